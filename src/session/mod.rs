//! The session manager: application-facing calls bridged onto the
//! event-driven MAC engine.
//!
//! Requests are submitted to the engine and, where the protocol demands an
//! answer (OTAA join, confirmed uplink), the call awaits the matching
//! confirmation event before returning. Events that arrive while a call is
//! waiting — most importantly downlink indications — are dispatched on the
//! spot, so port listeners fire from whichever context is currently
//! driving the bridge.

use crate::engine::{
    Activation, DeviceClass, Event, EventStatus, MacEngine, McpsIndication, McpsRequest, Mib,
    MibValue, MlmeKind, MlmeRequest, Status, DR, LORAWAN_1_0_3,
};
use crate::nvm::{self, SettingsStore};
use crate::{Downlink, JoinMode};

mod listeners;
use listeners::Listeners;
pub use listeners::{DownlinkCallback, Port, MAX_PORT_LISTENERS};

#[cfg(test)]
mod test;

/// Session-wide tunables, applied with [`Session::configure`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt-03", derive(defmt::Format))]
pub struct SessionConfig {
    /// Receive-window tolerance for system clock error, in milliseconds.
    pub max_rx_error: u32,
    /// Transmission attempts for a confirmed uplink before the engine
    /// reports failure.
    pub confirmed_tries: u8,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self { max_rx_error: 0, confirmed_tries: 1 }
    }
}

/// Device classes selectable through [`Session::set_class`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt-03", derive(defmt::Format))]
pub enum Class {
    A,
    /// Not supported by this stack; selecting it fails.
    B,
    C,
}

/// Caller-visible error codes.
///
/// Deliberately coarse: many engine-level causes collapse onto the same
/// code. [`Error::TryAgain`] is the one retryable case — the payload did
/// not fit the current datarate and was *not* sent.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt-03", derive(defmt::Format))]
pub enum Error {
    InvalidParameter,
    /// Listener table is full.
    NoResources,
    Busy,
    Unsupported,
    NotJoined,
    PayloadTooLong,
    /// Duty-cycle or channel-availability restriction.
    Restricted,
    /// Resubmit later, typically after lowering the payload size or once
    /// ADR has raised the datarate.
    TryAgain,
    Timeout,
    /// MIC or address verification failed.
    IntegrityFail,
    FrameLoss,
    Crypto,
    /// Engine-internal failure without a more specific mapping.
    Engine,
}

/// Collapse an immediate engine status onto a caller-visible code.
pub fn status_to_error(status: Status) -> Error {
    match status {
        Status::Busy
        | Status::BusyBeaconReservedTime
        | Status::BusyPingSlotWindowTime
        | Status::BusyUplinkCollision => Error::Busy,
        Status::ParameterInvalid
        | Status::FrequencyInvalid
        | Status::DatarateInvalid
        | Status::FrequencyAndDatarateInvalid => Error::InvalidParameter,
        Status::ServiceUnknown | Status::RegionNotSupported => Error::Unsupported,
        Status::NoNetworkJoined | Status::NoChannelFound => Error::NotJoined,
        Status::LengthError | Status::SkippedAppData => Error::PayloadTooLong,
        Status::DutyCycleRestricted | Status::NoFreeChannelFound => Error::Restricted,
        Status::CryptoError => Error::Crypto,
        Status::FCntHandlerError
        | Status::MacCommandError
        | Status::ClassBError
        | Status::ConfirmQueueError
        | Status::McGroupUndefined
        | Status::Failure => Error::Engine,
    }
}

/// Collapse an asynchronous event outcome onto a caller-visible result.
pub fn event_status_to_result(status: EventStatus) -> Result<(), Error> {
    match status {
        EventStatus::Ok => Ok(()),
        EventStatus::TxTimeout | EventStatus::Rx1Timeout | EventStatus::Rx2Timeout => {
            Err(Error::Timeout)
        }
        EventStatus::TxDrPayloadSizeError => Err(Error::PayloadTooLong),
        EventStatus::MicFail | EventStatus::AddressFail => Err(Error::IntegrityFail),
        EventStatus::DownlinkTooManyFramesLost => Err(Error::FrameLoss),
        EventStatus::JoinFail => Err(Error::NotJoined),
        EventStatus::Error
        | EventStatus::Rx1Error
        | EventStatus::Rx2Error
        | EventStatus::DownlinkRepeated
        | EventStatus::MulticastFail
        | EventStatus::BeaconLocked
        | EventStatus::BeaconLost
        | EventStatus::BeaconNotFound => Err(Error::Engine),
    }
}

/// One LoRaWAN session over one MAC engine.
///
/// Exactly one `Session` exists per engine; every operation takes
/// `&mut self`, so joins, sends and suspend/resume can never overlap or
/// interleave engine requests. When no call is in flight, keep awaiting
/// [`Session::process`] so downlinks outside of receive windows (Class C)
/// still reach their listeners.
pub struct Session<E: MacEngine> {
    engine: E,
    confirmed_tries: u8,
    datarate: DR,
    adr_enabled: bool,
    listeners: Listeners,
}

impl<E: MacEngine> Session<E> {
    /// Start the engine and wrap it in a fresh session.
    pub fn new(mut engine: E) -> Result<Self, Error> {
        engine.start().map_err(status_to_error)?;
        debug!("MAC engine started");
        Ok(Self {
            engine,
            confirmed_tries: SessionConfig::default().confirmed_tries,
            datarate: DR::_0,
            adr_enabled: false,
            listeners: Listeners::new(),
        })
    }

    /// Apply session tunables. Triggers no network traffic.
    pub fn configure(&mut self, config: &SessionConfig) -> Result<(), Error> {
        self.mib_set(MibValue::SystemMaxRxError(config.max_rx_error))?;
        self.confirmed_tries = config.confirmed_tries;
        Ok(())
    }

    /// Activate on the network.
    ///
    /// OTAA transmits a join request at the current datarate and resolves
    /// once the engine reports the outcome; the engine's retry and
    /// duty-cycle logic guarantees an outcome eventually, so there is no
    /// timeout here. ABP programs the provisioned session directly and
    /// returns without any radio traffic.
    pub async fn join(&mut self, mode: &JoinMode) -> Result<(), Error> {
        match mode {
            JoinMode::Otaa { dev_eui, join_eui, nwk_key, app_key } => {
                // Only fields the caller supplied are pushed; anything
                // absent keeps the secure-element-resident value.
                if let Some(dev_eui) = dev_eui {
                    self.mib_set(MibValue::DevEui(*dev_eui))?;
                }
                if let Some(join_eui) = join_eui {
                    self.mib_set(MibValue::JoinEui(*join_eui))?;
                }
                if let Some(nwk_key) = nwk_key {
                    self.mib_set(MibValue::NwkKey(*nwk_key))?;
                }
                if let Some(app_key) = app_key {
                    self.mib_set(MibValue::AppKey(*app_key))?;
                }

                let request = MlmeRequest::Join { datarate: self.datarate };
                if let Err(status) = self.engine.mlme_request(request) {
                    error!("OTAA join failed: {}", status);
                    return Err(status_to_error(status));
                }
                debug!("network join request sent");

                let status = self.wait_mlme_confirm(MlmeKind::Join).await;
                event_status_to_result(status)?;

                if let Ok(MibValue::DevAddr(addr)) = self.engine.mib_get(Mib::DevAddr) {
                    info!("joined network! DevAddr: {:08x}", addr.as_u32());
                }
                Ok(())
            }
            JoinMode::Abp { dev_addr, nwk_skey, app_skey, app_eui: _ } => {
                self.mib_set(MibValue::AbpVersion(LORAWAN_1_0_3))?;
                self.mib_set(MibValue::NetId(0))?;
                self.mib_set(MibValue::DevAddr(*dev_addr))?;
                self.mib_set(MibValue::FNwkSIntKey(*nwk_skey))?;
                self.mib_set(MibValue::SNwkSIntKey(*nwk_skey))?;
                self.mib_set(MibValue::NwkSEncKey(*nwk_skey))?;
                self.mib_set(MibValue::AppSKey(*app_skey))?;
                self.mib_set(MibValue::NetworkActivation(Activation::Abp))
            }
        }
    }

    /// Switch the device class. Only A and C are supported.
    pub fn set_class(&mut self, class: Class) -> Result<(), Error> {
        let device_class = match class {
            Class::A => DeviceClass::A,
            Class::C => DeviceClass::C,
            Class::B => {
                error!("class B is not supported");
                return Err(Error::InvalidParameter);
            }
        };
        self.mib_set(MibValue::DeviceClass(device_class))
    }

    /// Select the datarate for subsequent uplinks and whether the network
    /// may adjust it (ADR).
    pub fn set_datarate(&mut self, datarate: DR, adr_enabled: bool) -> Result<(), Error> {
        self.mib_set(MibValue::AdrEnable(adr_enabled))?;
        self.adr_enabled = adr_enabled;
        self.datarate = datarate;
        Ok(())
    }

    pub fn datarate(&self) -> DR {
        self.datarate
    }

    pub fn adr_enabled(&self) -> bool {
        self.adr_enabled
    }

    /// Transmit `data` on `fport`.
    ///
    /// Unconfirmed sends return as soon as the engine accepts the frame —
    /// fire and forget. Confirmed sends resolve once the engine reports
    /// the delivery outcome after up to the configured number of tries.
    ///
    /// [`Error::TryAgain`] means the payload exceeds what the current
    /// region and datarate allow; an empty frame was sent in its place to
    /// flush pending MAC commands, and the caller must resubmit.
    pub async fn send(&mut self, fport: u8, data: &[u8], confirmed: bool) -> Result<(), Error> {
        if data.len() > 255 {
            return Err(Error::InvalidParameter);
        }

        if let Err(status) = self.engine.query_tx_possible(data.len() as u8) {
            warn!("payload does not fit current datarate ({}), flushing MAC commands", status);
            self.engine
                .mcps_request(McpsRequest::Unconfirmed { fport: 0, data: &[], datarate: DR::_0 })
                .map_err(status_to_error)?;
            return Err(Error::TryAgain);
        }

        let request = if confirmed {
            McpsRequest::Confirmed {
                fport,
                data,
                datarate: self.datarate,
                nb_trials: self.confirmed_tries,
            }
        } else {
            McpsRequest::Unconfirmed { fport, data, datarate: self.datarate }
        };
        if let Err(status) = self.engine.mcps_request(request) {
            error!("send failed: {}", status);
            return Err(status_to_error(status));
        }

        if confirmed {
            let status = self.wait_mcps_confirm().await;
            event_status_to_result(status)?;
        }
        Ok(())
    }

    /// Register, replace or (with `None`) remove a downlink listener.
    ///
    /// [`Port::Any`] addresses the default listener, which receives
    /// downlinks on ports nothing else is registered for. Listener
    /// registration is meant for quiescent setup, not for use concurrent
    /// with active downlink delivery.
    pub fn listen(&mut self, port: Port, cb: Option<DownlinkCallback>) -> Result<(), Error> {
        self.listeners.register(port, cb)
    }

    /// Install the battery-level provider consulted by the engine when the
    /// network asks for device status. Scale 0–254, 255 meaning "unknown".
    pub fn set_battery_level_callback(&mut self, cb: Option<fn() -> u8>) {
        self.engine.set_battery_level_provider(cb);
    }

    /// Dispatch one engine event. Await this in a loop whenever no other
    /// session call is in flight.
    pub async fn process(&mut self) {
        let event = self.engine.recv_event().await;
        self.dispatch(event);
    }

    /// Stop the engine and persist its state, category by category.
    ///
    /// On failure the engine is left stopped and the error propagated;
    /// nothing is rolled back.
    pub fn suspend<S: SettingsStore>(&mut self, store: &mut S) -> Result<(), nvm::Error<S::Error>> {
        nvm::suspend(&mut self.engine, store)
    }

    /// Restore persisted state into the engine and restart it.
    ///
    /// All-or-nothing: every context category must be present with its
    /// exact expected size, or the engine is never started.
    pub fn resume<S: SettingsStore>(&mut self, store: &mut S) -> Result<(), nvm::Error<S::Error>> {
        nvm::resume(&mut self.engine, store)
    }

    fn mib_set(&mut self, value: MibValue) -> Result<(), Error> {
        self.engine.mib_set(value).map_err(status_to_error)
    }

    async fn wait_mlme_confirm(&mut self, kind: MlmeKind) -> EventStatus {
        loop {
            match self.engine.recv_event().await {
                Event::MlmeConfirm(confirm) if confirm.kind == kind => {
                    if confirm.status != EventStatus::Ok {
                        error!("MlmeConfirm failed: {}", confirm.status);
                    }
                    return confirm.status;
                }
                event => self.dispatch(event),
            }
        }
    }

    async fn wait_mcps_confirm(&mut self) -> EventStatus {
        loop {
            match self.engine.recv_event().await {
                Event::McpsConfirm(confirm) => {
                    if confirm.status != EventStatus::Ok {
                        error!("McpsRequest failed: {}", confirm.status);
                    } else {
                        debug!("McpsRequest success");
                    }
                    return confirm.status;
                }
                event => self.dispatch(event),
            }
        }
    }

    fn dispatch(&mut self, event: Event) {
        match event {
            Event::McpsIndication(indication) => self.handle_indication(indication),
            Event::MlmeIndication(indication) => {
                debug!("MLME indication: {} {}", indication.kind, indication.status)
            }
            // Confirmations nobody is waiting for: the tail of an
            // unconfirmed send, drained on the next wait.
            Event::McpsConfirm(confirm) => trace!("unsolicited MCPS confirm: {}", confirm.status),
            Event::MlmeConfirm(confirm) => trace!("unsolicited MLME confirm: {}", confirm.status),
        }
    }

    fn handle_indication(&mut self, indication: McpsIndication) {
        if indication.status != EventStatus::Ok {
            error!("McpsIndication failed: {}", indication.status);
            return;
        }

        let Some(fport) = indication.fport else {
            trace!("downlink without application payload");
            return;
        };
        if indication.data.is_empty() {
            trace!("empty downlink on port {}", fport);
            return;
        }

        let Some(cb) = self.listeners.lookup(fport) else {
            warn!("no listener for port {}, dropping {} bytes", fport, indication.data.len());
            return;
        };
        let downlink = Downlink {
            fport,
            rssi: indication.quality.rssi(),
            snr: indication.quality.snr(),
            pending: indication.pending,
            data: indication.data,
        };
        cb(&downlink);
    }
}
