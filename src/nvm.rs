//! Persistence of the MAC engine's session state.
//!
//! The engine's internal state is exported as one opaque blob per
//! [`NvmCategory`] and written to a key-value [`SettingsStore`] under the
//! `lorawan/state` namespace. Restoration only ever happens wholesale: a
//! blob for every category, each with the exact length the engine expects,
//! or nothing. Blob contents are never interpreted here — their layout is
//! versioned by the engine.

use crate::engine::MacEngine;
use crate::session;

pub(crate) const STATE_PREFIX: &str = "lorawan/state";

/// The engine's persistable state categories.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt-03", derive(defmt::Format))]
#[repr(u8)]
pub enum NvmCategory {
    Crypto = 0,
    SecureElement = 1,
    Mac = 2,
    Region = 3,
    Commands = 4,
    ClassB = 5,
    ConfirmQueue = 6,
}

impl NvmCategory {
    pub const ALL: [NvmCategory; 7] = [
        NvmCategory::Crypto,
        NvmCategory::SecureElement,
        NvmCategory::Mac,
        NvmCategory::Region,
        NvmCategory::Commands,
        NvmCategory::ClassB,
        NvmCategory::ConfirmQueue,
    ];

    /// Key suffix under the `lorawan/state` namespace.
    pub const fn name(self) -> &'static str {
        match self {
            NvmCategory::Crypto => "Crypto",
            NvmCategory::SecureElement => "SecureElement",
            NvmCategory::Mac => "Mac",
            NvmCategory::Region => "Region",
            NvmCategory::Commands => "Commands",
            NvmCategory::ClassB => "ClassB",
            NvmCategory::ConfirmQueue => "ConfirmQueue",
        }
    }

    /// Full storage key.
    pub const fn path(self) -> &'static str {
        match self {
            NvmCategory::Crypto => "lorawan/state/Crypto",
            NvmCategory::SecureElement => "lorawan/state/SecureElement",
            NvmCategory::Mac => "lorawan/state/Mac",
            NvmCategory::Region => "lorawan/state/Region",
            NvmCategory::Commands => "lorawan/state/Commands",
            NvmCategory::ClassB => "lorawan/state/ClassB",
            NvmCategory::ConfirmQueue => "lorawan/state/ConfirmQueue",
        }
    }

    fn from_name(name: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|cat| cat.name() == name)
    }

    const fn bit(self) -> u8 {
        1 << self as u8
    }
}

const ALL_VALID: u8 = (1 << NvmCategory::ALL.len()) - 1;

/// Persistent key-value backend for session state.
pub trait SettingsStore {
    type Error;

    /// Store one named blob, replacing any previous value.
    fn save(&mut self, key: &str, value: &[u8]) -> Result<(), Self::Error>;

    /// Visit every entry stored below `prefix`, passing the key suffix and
    /// the stored bytes.
    fn load_subtree(
        &mut self,
        prefix: &str,
        visitor: &mut dyn FnMut(&str, &[u8]),
    ) -> Result<(), Self::Error>;
}

/// Failures of [`session::Session::suspend`] / [`session::Session::resume`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Error<S> {
    Session(session::Error),
    Store(S),
}

pub(crate) fn suspend<E: MacEngine, S: SettingsStore>(
    engine: &mut E,
    store: &mut S,
) -> Result<(), Error<S::Error>> {
    engine.stop().map_err(|status| Error::Session(session::status_to_error(status)))?;

    debug!("storing contexts");
    for cat in NvmCategory::ALL {
        if let Some(blob) = engine.nvm_export(cat) {
            debug!("saving {}", cat.name());
            store.save(cat.path(), blob).map_err(Error::Store)?;
        }
    }

    Ok(())
}

pub(crate) fn resume<E: MacEngine, S: SettingsStore>(
    engine: &mut E,
    store: &mut S,
) -> Result<(), Error<S::Error>> {
    engine
        .nvm_begin_restore()
        .map_err(|status| Error::Session(session::status_to_error(status)))?;

    let mut valid: u8 = 0;
    let mut restore_failure: Option<session::Error> = None;

    store
        .load_subtree(STATE_PREFIX, &mut |key, value| {
            let Some(cat) = NvmCategory::from_name(key) else {
                warn!("unknown setting: {}", key);
                return;
            };
            debug!("loading '{}'", key);

            if value.len() != engine.nvm_expected_size(cat) {
                error!("cannot load '{}' state, size mismatch", key);
                return;
            }

            match engine.nvm_restore(cat, value) {
                Ok(()) => valid |= cat.bit(),
                Err(status) => {
                    error!("cannot load '{}' state", key);
                    restore_failure.get_or_insert(session::status_to_error(status));
                }
            }
        })
        .map_err(Error::Store)?;

    if let Some(e) = restore_failure {
        return Err(Error::Session(e));
    }

    if valid != ALL_VALID {
        if valid == 0 {
            info!("no context stored");
        } else {
            error!("failed to restore all required contexts");
        }
        return Err(Error::Session(session::Error::InvalidParameter));
    }

    engine.nvm_install().map_err(|status| Error::Session(session::status_to_error(status)))?;
    engine.start().map_err(|status| Error::Session(session::status_to_error(status)))?;

    Ok(())
}
