//! Radio control interface consumed by MAC engine implementations.
//!
//! The session manager never talks to the transceiver directly; the engine
//! does, through this seam. Register access, SPI transactions and antenna
//! switching are the implementor's concern — this trait only fixes the
//! operations an engine may ask for. Completion callbacks of traditional
//! driver APIs are expressed as futures: `send` resolves on TX done,
//! `receive` on RX done or timeout.

#[cfg_attr(feature = "defmt-03", derive(defmt::Format))]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RfConfig {
    pub frequency: u32,
    pub bandwidth_hz: u32,
    pub spreading_factor: u8,
    /// Denominator of the 4/x coding rate.
    pub coding_rate: u8,
}

#[cfg_attr(feature = "defmt-03", derive(defmt::Format))]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RxMode {
    Continuous,
    /// Single shot receive. Argument `ms` indicates how many milliseconds of extra buffer time
    /// should be added to the preamble detection timeout.
    Single { ms: u32 },
}

#[cfg_attr(feature = "defmt-03", derive(defmt::Format))]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RxConfig {
    pub rf: RfConfig,
    pub mode: RxMode,
}

#[cfg_attr(feature = "defmt-03", derive(defmt::Format))]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TxConfig {
    /// Output power in dBm.
    pub pw: i8,
    pub rf: RfConfig,
}

#[cfg_attr(feature = "defmt-03", derive(defmt::Format))]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RxQuality {
    rssi: i16,
    snr: i8,
}

impl RxQuality {
    pub fn new(rssi: i16, snr: i8) -> RxQuality {
        RxQuality { rssi, snr }
    }

    pub fn rssi(self) -> i16 {
        self.rssi
    }
    pub fn snr(self) -> i8 {
        self.snr
    }
}

/// A half-duplex LoRa transceiver.
#[allow(async_fn_in_trait)]
pub trait Radio: Sized {
    #[cfg(feature = "defmt-03")]
    type Error: defmt::Format;

    #[cfg(not(feature = "defmt-03"))]
    type Error;

    /// Bring the transceiver out of reset into standby.
    async fn init(&mut self) -> Result<(), Self::Error>;

    /// Tune to the given carrier frequency in Hz.
    async fn set_channel(&mut self, frequency: u32) -> Result<(), Self::Error>;

    /// Install the transmit configuration for subsequent `send` calls.
    async fn setup_tx(&mut self, config: TxConfig) -> Result<(), Self::Error>;

    /// Install the receive configuration for subsequent `receive` calls.
    async fn setup_rx(&mut self, config: RxConfig) -> Result<(), Self::Error>;

    /// Transmit the buffer; resolves once the frame is on the air, returning
    /// the time on air in milliseconds.
    async fn send(&mut self, buf: &[u8]) -> Result<u32, Self::Error>;

    /// Receive into the buffer; resolves on a frame or after `timeout_ms`.
    /// `None` signals an RX timeout.
    async fn receive(
        &mut self,
        buf: &mut [u8],
        timeout_ms: u32,
    ) -> Result<Option<(usize, RxQuality)>, Self::Error>;

    /// Lowest-power state; RX/TX require re-configuration afterwards.
    async fn sleep(&mut self) -> Result<(), Self::Error>;

    /// Idle state with the oscillator running.
    async fn standby(&mut self) -> Result<(), Self::Error>;

    /// Cap the payload length the modem will accept.
    fn set_max_payload_length(&mut self, len: u8);

    /// Emit an unmodulated carrier for `duration_s` seconds. Test aid.
    async fn set_tx_continuous_wave(
        &mut self,
        frequency: u32,
        power: i8,
        duration_s: u16,
    ) -> Result<(), Self::Error>;

    /// Whether the hardware can be tuned to the given frequency.
    fn check_rf_frequency(&mut self, frequency: u32) -> bool;
}
