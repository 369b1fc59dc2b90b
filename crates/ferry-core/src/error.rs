//! Error types for the transfer engine
//!
//! Every failure a transfer can hit is a `TransferError`. At the state
//! machine boundary each error is reduced to a [`FailureKind`], which decides
//! the terminal status of the transfer record:
//!
//! - **Runner**: transfer-logic failure (task failure, peer rejection,
//!   checksum mismatch). The record moves to `INERROR`.
//! - **System**: local resource failure (disk, permission, storage). Same
//!   terminal handling as Runner, kept apart for operational triage.
//! - **Network**: connect, write or timeout failure. The record moves to
//!   `INTERRUPTED` when no outcome message reached the peer.

use ferry_transport::{PacketError, TransportError};
use std::borrow::Cow;
use thiserror::Error;

/// Failure classification consumed by the state machine
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FailureKind {
    /// Transfer-logic failure
    Runner,
    /// Local resource failure
    System,
    /// Channel failure
    Network,
}

impl std::fmt::Display for FailureKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            FailureKind::Runner => "runner",
            FailureKind::System => "system",
            FailureKind::Network => "network",
        };
        f.write_str(name)
    }
}

/// Errors that can occur while running transfers
#[derive(Debug, Error, Clone)]
pub enum TransferError {
    // ============ Runner Errors ============
    /// Pre, post or error task failed
    #[error("Task {task} failed: {reason}")]
    TaskFailed {
        /// Task name
        task: Cow<'static, str>,
        /// Failure detail
        reason: String,
    },

    /// Peer refused or aborted the transfer
    #[error("Peer rejected transfer: {0}")]
    PeerRejected(String),

    /// Peer broke the block protocol
    #[error("Protocol violation: {0}")]
    Protocol(Cow<'static, str>),

    /// Whole-file checksum did not match
    #[error("Checksum mismatch: integrity verification failed")]
    ChecksumMismatch,

    /// Operation not allowed in the record's current state
    #[error("Invalid state: {0}")]
    InvalidState(Cow<'static, str>),

    /// No record for the requested key
    #[error("Transfer not found: {0}")]
    NotFound(String),

    /// Remote host is blacklisted
    #[error("Host blacklisted: {0}")]
    Blacklisted(String),

    /// Invalid configuration
    #[error("Invalid configuration: {0}")]
    InvalidConfig(Cow<'static, str>),

    /// Transfer was cancelled by its caller
    #[error("Transfer interrupted: {0}")]
    Interrupted(Cow<'static, str>),

    // ============ System Errors ============
    /// Local file missing
    #[error("File not found: {0}")]
    FileNotFound(String),

    /// File I/O error
    #[error("File I/O error: {0}")]
    Io(String),

    /// Record storage failed
    #[error("Storage error: {0}")]
    Storage(Cow<'static, str>),

    /// Any other local failure
    #[error("System error: {0}")]
    System(Cow<'static, str>),

    // ============ Network Errors ============
    /// Channel could not be opened or broke down
    #[error("Network error: {0}")]
    Network(String),

    /// Operation timed out
    #[error("Operation timed out: {0}")]
    Timeout(Cow<'static, str>),
}

impl TransferError {
    /// Classify this error
    #[must_use]
    pub fn kind(&self) -> FailureKind {
        match self {
            TransferError::TaskFailed { .. }
            | TransferError::PeerRejected(_)
            | TransferError::Protocol(_)
            | TransferError::ChecksumMismatch
            | TransferError::InvalidState(_)
            | TransferError::NotFound(_)
            | TransferError::Blacklisted(_)
            | TransferError::InvalidConfig(_)
            | TransferError::Interrupted(_) => FailureKind::Runner,
            TransferError::FileNotFound(_)
            | TransferError::Io(_)
            | TransferError::Storage(_)
            | TransferError::System(_) => FailureKind::System,
            TransferError::Network(_) | TransferError::Timeout(_) => FailureKind::Network,
        }
    }

    /// Returns true if the caller cancelled the transfer
    #[must_use]
    pub fn is_interruption(&self) -> bool {
        matches!(self, TransferError::Interrupted(_))
    }

    /// Create a protocol error with static context (zero allocation)
    #[must_use]
    pub const fn protocol(context: &'static str) -> Self {
        TransferError::Protocol(Cow::Borrowed(context))
    }

    /// Create an invalid state error with static context (zero allocation)
    #[must_use]
    pub const fn invalid_state(context: &'static str) -> Self {
        TransferError::InvalidState(Cow::Borrowed(context))
    }

    /// Create a storage error with static context (zero allocation)
    #[must_use]
    pub const fn storage(context: &'static str) -> Self {
        TransferError::Storage(Cow::Borrowed(context))
    }

    /// Create a system error with static context (zero allocation)
    #[must_use]
    pub const fn system(context: &'static str) -> Self {
        TransferError::System(Cow::Borrowed(context))
    }

    /// Create a timeout error with static context (zero allocation)
    #[must_use]
    pub const fn timeout(context: &'static str) -> Self {
        TransferError::Timeout(Cow::Borrowed(context))
    }

    /// Create an interruption error with static context (zero allocation)
    #[must_use]
    pub const fn interrupted(context: &'static str) -> Self {
        TransferError::Interrupted(Cow::Borrowed(context))
    }

    /// Wrap an error from opening `path`, keeping "not found" distinct
    pub fn open_failed(path: &str, err: std::io::Error) -> Self {
        if err.kind() == std::io::ErrorKind::NotFound {
            TransferError::FileNotFound(path.to_string())
        } else {
            TransferError::Io(format!("{path}: {err}"))
        }
    }

    /// Create a task failure
    pub fn task(task: impl Into<Cow<'static, str>>, reason: impl std::fmt::Display) -> Self {
        TransferError::TaskFailed {
            task: task.into(),
            reason: reason.to_string(),
        }
    }
}

impl From<std::io::Error> for TransferError {
    fn from(err: std::io::Error) -> Self {
        TransferError::Io(err.to_string())
    }
}

impl From<TransportError> for TransferError {
    fn from(err: TransportError) -> Self {
        match err {
            TransportError::Timeout(what) => TransferError::Timeout(Cow::Owned(what)),
            // A peer sending garbage is a protocol problem, not a broken link
            TransportError::Packet(e) => TransferError::Protocol(Cow::Owned(e.to_string())),
            other => TransferError::Network(other.to_string()),
        }
    }
}

impl From<PacketError> for TransferError {
    fn from(err: PacketError) -> Self {
        TransferError::Protocol(Cow::Owned(err.to_string()))
    }
}

impl From<serde_json::Error> for TransferError {
    fn from(err: serde_json::Error) -> Self {
        TransferError::Storage(Cow::Owned(err.to_string()))
    }
}

/// Result type for transfer operations
pub type Result<T> = std::result::Result<T, TransferError>;
