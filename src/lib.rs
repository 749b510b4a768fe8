#![cfg_attr(not(test), no_std)]
#![cfg_attr(docsrs, feature(doc_cfg))]

//! MAC-layer session management for LoRaWAN end devices.
//!
//! This crate bridges an event-driven LoRaWAN MAC engine (the
//! [`engine::MacEngine`] trait) to application-facing calls: network join
//! (OTAA/ABP), confirmed and unconfirmed uplinks, per-port downlink
//! dispatch, device-class and data-rate control, and persistence of the
//! engine's session state across power cycles. The engine itself — frame
//! counters, MAC command queue, duty cycle, regional channel plans — is an
//! external collaborator; this crate owns the session surface around it.
//!
//! The crate also defines the two seams engine implementations are built
//! on: the half-duplex radio control interface ([`radio::Radio`]) and the
//! cryptographic capability interface ([`se::SecureElement`]), with a
//! software secure element ([`se::SoftSecureElement`]) included.
//!
//! ## Feature flags
#![doc = document_features::document_features!(feature_label = r#"<span class="stab portability"><code>{feature}</code></span>"#)]

use heapless::Vec;

mod fmt;

pub mod engine;
pub mod nvm;
pub mod radio;
pub mod se;
pub mod session;

pub use engine::DR;
pub use rand_core::RngCore;
pub use session::{Class, DownlinkCallback, Error, Port, Session, SessionConfig};

/// An application downlink handed to a registered port listener.
///
/// Listeners run synchronously on the context that drives MAC event
/// processing and must not block.
#[derive(Debug)]
pub struct Downlink {
    pub data: Vec<u8, 256>,
    pub fport: u8,
    pub rssi: i16,
    pub snr: i8,
    /// The network has more data pending for this device.
    pub pending: bool,
}

#[cfg(feature = "defmt-03")]
impl defmt::Format for Downlink {
    fn format(&self, f: defmt::Formatter) {
        defmt::write!(f, "Downlink {{ fport: {}, rssi: {}, snr: {}, data: ", self.fport, self.rssi, self.snr);

        for byte in self.data.iter() {
            defmt::write!(f, "{:02x}", byte);
        }
        defmt::write!(f, " }}")
    }
}

/// How the device activates on the network.
///
/// OTAA fields are optional: an absent field keeps the value already
/// resident in the secure element. ABP carries everything explicitly; the
/// single `nwk_skey` serves uplink and downlink integrity alike, as
/// LoRaWAN 1.0.x defines only one network session key.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JoinMode {
    Otaa {
        dev_eui: Option<DevEui>,
        join_eui: Option<JoinEui>,
        nwk_key: Option<NwkKey>,
        app_key: Option<AppKey>,
    },
    Abp {
        dev_addr: DevAddr,
        nwk_skey: NwkSKey,
        app_skey: AppSKey,
        app_eui: AppEui,
    },
}

macro_rules! lorawan_key {
    (
        $(#[$outer:meta])*
        pub struct $type:ident([u8; 16]);
    ) => {
        $(#[$outer])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq)]
        #[cfg_attr(feature = "defmt-03", derive(defmt::Format))]
        pub struct $type([u8; 16]);

        impl From<[u8; 16]> for $type {
            fn from(key: [u8; 16]) -> Self {
                $type(key)
            }
        }

        impl $type {
            pub fn as_bytes(&self) -> &[u8; 16] {
                &self.0
            }
        }
    };
}

lorawan_key!(
    /// Root application key (OTAA).
    pub struct AppKey([u8; 16]);
);
lorawan_key!(
    /// Root network key (OTAA, LoRaWAN 1.1 naming; equals AppKey on 1.0.x).
    pub struct NwkKey([u8; 16]);
);
lorawan_key!(
    /// Network session key (ABP).
    pub struct NwkSKey([u8; 16]);
);
lorawan_key!(
    /// Application session key (ABP).
    pub struct AppSKey([u8; 16]);
);

macro_rules! lorawan_eui {
    (
        $(#[$outer:meta])*
        pub struct $type:ident([u8; 8]);
    ) => {
        $(#[$outer])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq)]
        #[cfg_attr(feature = "defmt-03", derive(defmt::Format))]
        pub struct $type([u8; 8]);

        impl From<[u8; 8]> for $type {
            fn from(eui: [u8; 8]) -> Self {
                $type(eui)
            }
        }

        impl $type {
            pub fn as_bytes(&self) -> &[u8; 8] {
                &self.0
            }
        }
    };
}

lorawan_eui!(
    /// 64-bit device identifier.
    pub struct DevEui([u8; 8]);
);
lorawan_eui!(
    /// 64-bit join server identifier (AppEUI on 1.0.x networks).
    pub struct JoinEui([u8; 8]);
);
lorawan_eui!(
    /// Application identifier carried by ABP provisioning data.
    pub struct AppEui([u8; 8]);
);

/// 32-bit device network address, little-endian on the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt-03", derive(defmt::Format))]
pub struct DevAddr([u8; 4]);

impl DevAddr {
    pub fn as_bytes(&self) -> &[u8; 4] {
        &self.0
    }

    pub fn as_u32(&self) -> u32 {
        u32::from_le_bytes(self.0)
    }
}

impl From<[u8; 4]> for DevAddr {
    fn from(addr: [u8; 4]) -> Self {
        DevAddr(addr)
    }
}

impl From<u32> for DevAddr {
    fn from(addr: u32) -> Self {
        DevAddr(addr.to_le_bytes())
    }
}
