//! Error types for the offload dataplane
//!
//! The fast path never propagates these upward: classification, table and
//! pool errors become counters and log lines. Only the flow-rule engine,
//! the aging subsystem and bootstrap surface them to callers.

use crate::key::FlowTuple;
use thiserror::Error;

/// Packet classification failure
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClassifyError {
    /// Packet shorter than the headers the codec needs
    #[error("truncated packet: need {needed} bytes, have {len}")]
    Truncated { needed: usize, len: usize },

    /// Not an IPv4 TCP/UDP packet
    #[error("unsupported packet type: {0}")]
    UnsupportedPacketType(&'static str),
}

/// Flow table errors
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum TableError {
    #[error("flow already exists")]
    AlreadyExists,

    #[error("flow table is full")]
    TableFull,
}

/// Error reported by the flow-offload hardware
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("{message} (code {code})")]
pub struct HwError {
    /// Device specific error code
    pub code: i32,
    /// Message reported by the device
    pub message: String,
}

impl HwError {
    pub fn new(code: i32, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
        }
    }
}

/// Which half of a flow pair an operation applied to
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    Forward,
    Peer,
}

impl std::fmt::Display for Direction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Direction::Forward => f.write_str("forward"),
            Direction::Peer => f.write_str("peer"),
        }
    }
}

/// Flow-rule engine errors
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum OffloadError {
    #[error("peer flow {0} not found")]
    PeerMissing(FlowTuple),

    #[error("failed to create {direction} flow rule for {tuple}: {source}")]
    Install {
        direction: Direction,
        tuple: FlowTuple,
        #[source]
        source: HwError,
    },

    /// A worker withdrew its claim on `{0}` while the rules were installing
    #[error("offload claim on {0} withdrawn during install")]
    ClaimLost(FlowTuple),
}

/// Aging / eviction errors, reported per flow
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum AgingError {
    #[error("failed to get timeout flows: {0}")]
    AgedQuery(#[source] HwError),

    #[error("timeout flow {0} has no entry")]
    MissingContext(FlowTuple),

    #[error("cannot query the counter of timeout flow {tuple}: {source}")]
    Query {
        tuple: FlowTuple,
        #[source]
        source: HwError,
    },

    #[error("cannot remove offload rule of flow {tuple}: {source}")]
    Destroy {
        tuple: FlowTuple,
        #[source]
        source: HwError,
    },

    #[error("deferred eviction is not running")]
    SchedulerClosed,
}

/// Bootstrap errors; fatal at startup only
#[derive(Error, Debug)]
pub enum SetupError {
    #[error("config error: {0}")]
    InvalidConfig(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("config parse error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("failed to create default flow rule: {0}")]
    DefaultRule(#[source] HwError),

    #[error("failed to register aged event: {0}")]
    EventRegister(#[source] HwError),

    #[error("failed to launch worker: {0}")]
    SpawnFailed(String),

    #[error("offload runtime already running")]
    AlreadyRunning,
}
