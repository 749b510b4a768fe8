use heapless::Vec;

use super::Error;
use crate::Downlink;

/// Listener slots available for distinct ports, not counting the default
/// listener.
pub const MAX_PORT_LISTENERS: usize = 8;

/// Invoked for each downlink on a matching port. Runs on the context that
/// drives MAC event processing; must not block.
pub type DownlinkCallback = fn(&Downlink);

/// Bounded port-to-callback map with in-place update and a catch-all slot.
pub(crate) struct Listeners {
    default: Option<DownlinkCallback>,
    entries: Vec<(u8, DownlinkCallback), MAX_PORT_LISTENERS>,
}

/// Listener registration target.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt-03", derive(defmt::Format))]
pub enum Port {
    /// Receive downlinks on any port without a dedicated listener.
    Any,
    Num(u8),
}

impl Listeners {
    pub(crate) const fn new() -> Self {
        Self { default: None, entries: Vec::new() }
    }

    /// Install, replace or (with `None`) remove a listener.
    pub(crate) fn register(
        &mut self,
        port: Port,
        cb: Option<DownlinkCallback>,
    ) -> Result<(), Error> {
        let port = match port {
            Port::Any => {
                self.default = cb;
                return Ok(());
            }
            Port::Num(port) => port,
        };

        let existing = self.entries.iter().position(|(p, _)| *p == port);
        match (existing, cb) {
            (Some(i), Some(cb)) => self.entries[i].1 = cb,
            (Some(i), None) => {
                self.entries.swap_remove(i);
            }
            (None, Some(cb)) => {
                self.entries.push((port, cb)).map_err(|_| Error::NoResources)?;
            }
            // Clearing a listener that was never registered.
            (None, None) => {}
        }
        Ok(())
    }

    /// Listener for an incoming downlink: exact port first, then the
    /// default slot.
    pub(crate) fn lookup(&self, port: u8) -> Option<DownlinkCallback> {
        self.entries.iter().find(|(p, _)| *p == port).map(|(_, cb)| *cb).or(self.default)
    }
}
