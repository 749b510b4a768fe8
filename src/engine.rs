//! Interface to the external LoRaWAN MAC engine.
//!
//! The engine is a pre-existing library implementing the protocol state
//! machine: join procedure, frame counters, MAC command queue, duty cycle
//! and the ADR algorithm. It is consumed as-is through [`MacEngine`];
//! requests return an immediate [`Status`] and complete later with an
//! [`Event`] delivered through [`MacEngine::recv_event`]. Implementations
//! are expected to drive their internal processing from radio interrupts
//! (see [`crate::radio::Radio`]) and to keep `recv_event` futures cheap —
//! the session manager awaits them in a tight bridge loop.

use heapless::Vec;

use crate::nvm::NvmCategory;
use crate::radio::RxQuality;
use crate::{AppKey, AppSKey, DevAddr, DevEui, JoinEui, NwkKey, NwkSKey};

/// A restricted data rate type that exposes the number of variants to only
/// what _may_ potentially be possible. Note that not all data rates are
/// valid in all regions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
#[cfg_attr(feature = "defmt-03", derive(defmt::Format))]
#[repr(u8)]
pub enum DR {
    _0 = 0,
    _1 = 1,
    _2 = 2,
    _3 = 3,
    _4 = 4,
    _5 = 5,
    _6 = 6,
    _7 = 7,
    _8 = 8,
    _9 = 9,
    _10 = 10,
    _11 = 11,
    _12 = 12,
    _13 = 13,
    _14 = 14,
    _15 = 15,
}

impl TryFrom<u8> for DR {
    type Error = ();

    fn try_from(value: u8) -> Result<Self, ()> {
        match value {
            0 => Ok(DR::_0),
            1 => Ok(DR::_1),
            2 => Ok(DR::_2),
            3 => Ok(DR::_3),
            4 => Ok(DR::_4),
            5 => Ok(DR::_5),
            6 => Ok(DR::_6),
            7 => Ok(DR::_7),
            8 => Ok(DR::_8),
            9 => Ok(DR::_9),
            10 => Ok(DR::_10),
            11 => Ok(DR::_11),
            12 => Ok(DR::_12),
            13 => Ok(DR::_13),
            14 => Ok(DR::_14),
            15 => Ok(DR::_15),
            _ => Err(()),
        }
    }
}

/// Engine-internal device class representation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt-03", derive(defmt::Format))]
pub enum DeviceClass {
    A,
    B,
    C,
}

/// Activation state recorded in the engine's information base.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt-03", derive(defmt::Format))]
pub enum Activation {
    None,
    Abp,
    Otaa,
}

/// Protocol version tag programmed into the engine for ABP sessions.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt-03", derive(defmt::Format))]
pub struct ProtocolVersion {
    pub major: u8,
    pub minor: u8,
    pub patch: u8,
}

/// The protocol revision this crate provisions ABP sessions with.
pub const LORAWAN_1_0_3: ProtocolVersion = ProtocolVersion { major: 1, minor: 0, patch: 3 };

/// Immediate status of a request submitted to the engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt-03", derive(defmt::Format))]
pub enum Status {
    Busy,
    ServiceUnknown,
    ParameterInvalid,
    FrequencyInvalid,
    DatarateInvalid,
    FrequencyAndDatarateInvalid,
    NoNetworkJoined,
    LengthError,
    RegionNotSupported,
    SkippedAppData,
    DutyCycleRestricted,
    NoChannelFound,
    NoFreeChannelFound,
    BusyBeaconReservedTime,
    BusyPingSlotWindowTime,
    BusyUplinkCollision,
    CryptoError,
    FCntHandlerError,
    MacCommandError,
    ClassBError,
    ConfirmQueueError,
    McGroupUndefined,
    Failure,
}

/// Outcome carried by an asynchronous confirmation or indication.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt-03", derive(defmt::Format))]
pub enum EventStatus {
    Ok,
    Error,
    TxTimeout,
    Rx1Timeout,
    Rx2Timeout,
    Rx1Error,
    Rx2Error,
    JoinFail,
    DownlinkRepeated,
    TxDrPayloadSizeError,
    DownlinkTooManyFramesLost,
    AddressFail,
    MicFail,
    MulticastFail,
    BeaconLocked,
    BeaconLost,
    BeaconNotFound,
}

/// Keys for reading single values out of the engine's information base.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt-03", derive(defmt::Format))]
pub enum Mib {
    DevAddr,
    DeviceClass,
    AdrEnable,
    NetworkActivation,
}

/// Typed values written to (and read from) the engine's information base.
#[derive(Debug, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "defmt-03", derive(defmt::Format))]
pub enum MibValue {
    DevEui(DevEui),
    JoinEui(JoinEui),
    NwkKey(NwkKey),
    AppKey(AppKey),
    AbpVersion(ProtocolVersion),
    NetId(u32),
    DevAddr(DevAddr),
    /// Forwarding network session integrity key.
    FNwkSIntKey(NwkSKey),
    /// Serving network session integrity key.
    SNwkSIntKey(NwkSKey),
    /// Network session encryption key.
    NwkSEncKey(NwkSKey),
    AppSKey(AppSKey),
    NetworkActivation(Activation),
    DeviceClass(DeviceClass),
    AdrEnable(bool),
    /// Receive-window tolerance for system clock error, in milliseconds.
    SystemMaxRxError(u32),
}

/// Management request classes, used to match confirmations to requests.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt-03", derive(defmt::Format))]
pub enum MlmeKind {
    Join,
    LinkCheck,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt-03", derive(defmt::Format))]
pub enum MlmeRequest {
    Join { datarate: DR },
    LinkCheck,
}

impl MlmeRequest {
    pub fn kind(&self) -> MlmeKind {
        match self {
            MlmeRequest::Join { .. } => MlmeKind::Join,
            MlmeRequest::LinkCheck => MlmeKind::LinkCheck,
        }
    }
}

/// Data request classes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt-03", derive(defmt::Format))]
pub enum McpsKind {
    Unconfirmed,
    Confirmed,
}

/// An uplink data request. The payload is borrowed for the duration of the
/// call; the engine copies what it needs before returning.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum McpsRequest<'a> {
    Unconfirmed { fport: u8, data: &'a [u8], datarate: DR },
    Confirmed { fport: u8, data: &'a [u8], datarate: DR, nb_trials: u8 },
}

impl McpsRequest<'_> {
    pub fn kind(&self) -> McpsKind {
        match self {
            McpsRequest::Unconfirmed { .. } => McpsKind::Unconfirmed,
            McpsRequest::Confirmed { .. } => McpsKind::Confirmed,
        }
    }
}

/// Transmit feasibility report for a prospective payload length.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt-03", derive(defmt::Format))]
pub struct TxInfo {
    /// Application payload the current datarate can carry once pending MAC
    /// commands are accounted for.
    pub current_possible_payload: u8,
    /// Application payload the current datarate could carry at best.
    pub max_possible_payload: u8,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt-03", derive(defmt::Format))]
pub struct McpsConfirm {
    pub kind: McpsKind,
    pub status: EventStatus,
}

/// A downlink (or downlink-shaped event) from the network. `fport` is
/// `None` when the frame carried no application payload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct McpsIndication {
    pub status: EventStatus,
    pub fport: Option<u8>,
    pub data: Vec<u8, 256>,
    pub quality: RxQuality,
    /// The network has queued further downlinks for this device.
    pub pending: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt-03", derive(defmt::Format))]
pub struct MlmeConfirm {
    pub kind: MlmeKind,
    pub status: EventStatus,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt-03", derive(defmt::Format))]
pub struct MlmeIndication {
    pub kind: MlmeKind,
    pub status: EventStatus,
}

/// Asynchronous events emitted by the engine's processing context.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Event {
    McpsConfirm(McpsConfirm),
    McpsIndication(McpsIndication),
    MlmeConfirm(MlmeConfirm),
    MlmeIndication(MlmeIndication),
}

/// The LoRaWAN MAC protocol engine.
///
/// Every request either fails immediately with a [`Status`] or is accepted
/// and eventually answered by exactly one matching confirmation event —
/// the engine's duty-cycle and retry logic guarantees completion, so
/// awaiting a confirmation needs no timeout.
#[allow(async_fn_in_trait)]
pub trait MacEngine {
    /// Wait for the next asynchronous MAC event.
    async fn recv_event(&mut self) -> Event;

    /// Start (or restart) protocol processing.
    fn start(&mut self) -> Result<(), Status>;

    /// Halt protocol processing and internal timers.
    fn stop(&mut self) -> Result<(), Status>;

    fn mib_set(&mut self, value: MibValue) -> Result<(), Status>;

    fn mib_get(&mut self, key: Mib) -> Result<MibValue, Status>;

    fn mlme_request(&mut self, req: MlmeRequest) -> Result<(), Status>;

    fn mcps_request(&mut self, req: McpsRequest<'_>) -> Result<(), Status>;

    /// Whether a frame with `len` bytes of application payload fits the
    /// current region and datarate state.
    fn query_tx_possible(&mut self, len: u8) -> Result<TxInfo, Status>;

    /// Install the provider consulted when answering `DevStatusReq` MAC
    /// commands. Scale 0–254, 255 meaning "unknown".
    fn set_battery_level_provider(&mut self, provider: Option<fn() -> u8>);

    /// Current opaque state blob for a category, if the engine has one.
    fn nvm_export(&mut self, cat: NvmCategory) -> Option<&[u8]>;

    /// Size a restored blob for this category must have.
    fn nvm_expected_size(&self, cat: NvmCategory) -> usize;

    /// Obtain a fresh, empty context handle for restoration.
    fn nvm_begin_restore(&mut self) -> Result<(), Status>;

    /// Copy one category's blob into the context handle. Contents are
    /// opaque; only the length is validated by the caller.
    fn nvm_restore(&mut self, cat: NvmCategory, blob: &[u8]) -> Result<(), Status>;

    /// Commit the restored context handle into the engine.
    fn nvm_install(&mut self) -> Result<(), Status>;
}
