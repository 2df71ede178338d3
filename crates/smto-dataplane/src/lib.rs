//! Smart Flow Offload (SMTO) Dataplane
//!
//! Tracks bidirectional flows in software and, once a flow has proven hot,
//! installs hardware forwarding rules so the NIC handles the rest of it.
//! Idle rules are reclaimed when the hardware reports them aged.
//!
//! # Architecture
//!
//! ```text
//! ┌───────────────────────────────────────────────────────────────────┐
//! │                        SMART OFFLOAD                              │
//! │                                                                   │
//! │  ┌────────────┐  ┌────────────┐                                   │
//! │  │ Worker q0  │  │ Worker qN  │   receive_burst / transmit_burst  │
//! │  │ classify   │  │ classify   │                                   │
//! │  │ track      │  │ track      │──┐                                │
//! │  │ rewrite    │  │ rewrite    │  │                                │
//! │  └─────┬──────┘  └─────┬──────┘  │ threshold crossed              │
//! │        │               │         ▼                                │
//! │        ▼               ▼   ┌──────────────┐    ┌───────────────┐  │
//! │  ┌──────────────────────┐  │ Handoff queue│───▶│ Flow-rule     │  │
//! │  │ Flow table (pairs)   │  └──────────────┘    │ engine        │  │
//! │  │ + NAT port pool      │                      │ install x2    │  │
//! │  └──────────▲───────────┘                      └───────┬───────┘  │
//! │             │ merge + remove                           │          │
//! │  ┌──────────┴───────────┐   aged event   ┌─────────────▼───────┐  │
//! │  │ Aging (deferred)     │◀───────────────│ NIC flow device     │  │
//! │  └──────────────────────┘                └─────────────────────┘  │
//! └───────────────────────────────────────────────────────────────────┘
//! ```
//!
//! # Concurrency model
//!
//! Plain OS threads running cooperative poll loops. Workers never block;
//! the engine threads may block inside the device's install call; the aged
//! event handler only posts a wakeup for the aging thread. Every loop polls
//! the shared running flag.

pub mod aging;
pub mod config;
pub mod context;
pub mod engine;
pub mod error;
pub mod flow;
pub mod hw;
pub mod key;
pub mod packet;
pub mod port_pool;
pub mod runtime;
pub mod sim;
pub mod stats;
pub mod worker;

pub use config::OffloadConfig;
pub use context::OffloadContext;
pub use error::{AgingError, ClassifyError, HwError, OffloadError, SetupError, TableError};
pub use flow::{FlowEntry, FlowTable, OffloadStatus};
pub use hw::{FlowDevice, NicPort, PortId, QueueId, RuleHandle};
pub use key::FlowTuple;
pub use runtime::SmartOffload;
pub use stats::{LatencySummary, StatsSnapshot};
pub use worker::WorkerParams;

/// Default packets per receive burst
pub const BURST_SIZE: usize = 32;

/// Default packet count at which a flow is offloaded
pub const DEFAULT_OFFLOAD_THRESHOLD: u64 = 5;
