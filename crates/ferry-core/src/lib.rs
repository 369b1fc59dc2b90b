//! # FERRY Core
//!
//! Managed file transfer engine: moves one file between two hosts as a
//! sequence of fixed-size blocks, records progress durably so an interrupted
//! transfer resumes at the last committed block, and runs rule-defined tasks
//! around the transfer.
//!
//! This crate provides:
//! - Transfer records and their stores
//! - The per-transfer state machine and packet bridge
//! - The connection registry tracking live channels
//! - Host-wide and per-transfer bandwidth limiting
//! - The engine tying them together
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                          Engine                              │
//! │   (submit, run, resubmit, interrupt, accept, limits)        │
//! ├───────────────────────────┬─────────────────────────────────┤
//! │   TransferStateMachine    │   ConnectionRegistry            │
//! │   (one per transfer)      │   (live channels, blacklist)    │
//! ├───────────────────────────┼─────────────────────────────────┤
//! │   PacketBridge            │   BandwidthLimiter              │
//! │   (outcome -> wire)       │   (global + session windows)    │
//! ├───────────────────────────┴─────────────────────────────────┤
//! │                 ferry-transport Channel                      │
//! └─────────────────────────────────────────────────────────────┘
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod bridge;
pub mod config;
pub mod engine;
pub mod error;
pub mod limiter;
pub mod local_channel;
pub mod machine;
pub mod record;
pub mod registry;
pub mod signal;
pub mod store;
pub mod task;

pub use bridge::{OutcomeGuard, PacketBridge, PeerEvent};
pub use config::{EngineConfig, RegistryConfig, RetryConfig, TransferConfig};
pub use engine::{DEFAULT_RULE, Engine, EngineBuilder, TransferHandle, TransferRequest};
pub use error::{FailureKind, Result, TransferError};
pub use limiter::{BandwidthLimiter, Direction, Limit, LimiterStats, SessionLimiter};
pub use local_channel::{
    LocalChannelReference, TransferFailure, TransferOutcome, TransferSuccess,
};
pub use machine::{
    DiskFileOpener, FileOpener, InterruptHandle, MachineDeps, RankPolicy, Role,
    TransferContext, TransferStateMachine,
};
pub use record::{ErrorCode, GlobalStep, TransferKey, TransferMode, TransferRecord, UpdatedInfo};
pub use registry::{ConnectionRegistry, RegistryStats};
pub use signal::CompletionSignal;
pub use store::{JsonFileStore, MemoryStore, TransferStore};
pub use task::{BusinessHook, Rule, Task, TaskChain, TaskPhase, TaskSpec};
