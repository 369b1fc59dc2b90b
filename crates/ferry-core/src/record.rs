//! Transfer records: the durable unit of work.
//!
//! A record is identified by its [`TransferKey`] and carries the resume
//! cursor (`rank`), the lifecycle marker ([`UpdatedInfo`]) and the failure
//! classification of the last attempt.

use ferry_transport::RetrieveMode;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Composite identity of a transfer, unique system-wide
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct TransferKey {
    /// Host owning the record
    pub owner: String,
    /// Host that initiated the transfer
    pub requester: String,
    /// Host that answers the transfer
    pub requested: String,
    /// Globally unique sequence value
    pub special_id: u64,
}

impl TransferKey {
    /// Create a key
    pub fn new(
        owner: impl Into<String>,
        requester: impl Into<String>,
        requested: impl Into<String>,
        special_id: u64,
    ) -> Self {
        Self {
            owner: owner.into(),
            requester: requester.into(),
            requested: requested.into(),
            special_id,
        }
    }

    /// File name safe rendering, used by file-backed stores
    pub fn file_stem(&self) -> String {
        format!(
            "{}_{}_{}_{}",
            self.special_id,
            sanitize(&self.owner),
            sanitize(&self.requester),
            sanitize(&self.requested)
        )
    }
}

fn sanitize(part: &str) -> String {
    part.chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || c == '-' || c == '.' {
                c
            } else {
                '_'
            }
        })
        .collect()
}

impl fmt::Display for TransferKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}:{}->{}#{}",
            self.owner, self.requester, self.requested, self.special_id
        )
    }
}

/// Lifecycle marker of a transfer record.
///
/// Decoding never fails: unknown integers become `Unknown`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(from = "i32", into = "i32")]
#[repr(i32)]
pub enum UpdatedInfo {
    /// Decode fallback, never persisted deliberately
    Unknown = 0,
    /// Record exists but was never scheduled
    NotUpdated = 1,
    /// Stopped before a verdict was reached
    Interrupted = 2,
    /// Waiting to be started
    ToSubmit = 3,
    /// Failed
    InError = 4,
    /// Being executed
    Running = 5,
    /// Finished successfully
    Done = 6,
}

impl UpdatedInfo {
    /// Decode from the persisted integer
    pub fn from_i32(value: i32) -> Self {
        match value {
            1 => Self::NotUpdated,
            2 => Self::Interrupted,
            3 => Self::ToSubmit,
            4 => Self::InError,
            5 => Self::Running,
            6 => Self::Done,
            _ => Self::Unknown,
        }
    }

    /// Whether a state machine may start from this state
    pub fn is_startable(self) -> bool {
        matches!(self, Self::ToSubmit | Self::Interrupted | Self::InError)
    }

    /// Whether the record may be put back to `ToSubmit`
    pub fn is_resubmittable(self) -> bool {
        matches!(self, Self::Interrupted | Self::InError)
    }

    /// Whether no further progress happens without outside action
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Done | Self::InError | Self::Interrupted)
    }
}

impl From<i32> for UpdatedInfo {
    fn from(value: i32) -> Self {
        Self::from_i32(value)
    }
}

impl From<UpdatedInfo> for i32 {
    fn from(value: UpdatedInfo) -> Self {
        value as i32
    }
}

impl fmt::Display for UpdatedInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Unknown => "UNKNOWN",
            Self::NotUpdated => "NOTUPDATED",
            Self::Interrupted => "INTERRUPTED",
            Self::ToSubmit => "TOSUBMIT",
            Self::InError => "INERROR",
            Self::Running => "RUNNING",
            Self::Done => "DONE",
        };
        f.write_str(name)
    }
}

/// Step outcome and failure classification
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorCode {
    /// Nothing recorded yet
    #[default]
    Unknown,
    /// Record initialized
    InitOk,
    /// Pre-tasks succeeded
    PreProcessingOk,
    /// All blocks transferred
    TransferOk,
    /// Post-tasks succeeded
    PostProcessingOk,
    /// Transfer fully complete
    CompleteOk,
    /// Currently running
    Running,
    /// Could not reach the peer
    ConnectionImpossible,
    /// Source file missing
    FileNotFound,
    /// Block transfer failed
    TransferError,
    /// Channel lost mid-transfer
    Disconnection,
    /// Stopped by the caller
    StoppedTransfer,
    /// A task failed
    ExternalOperation,
    /// Whole-file checksum mismatch
    ChecksumError,
    /// Peer reported a failure
    RemoteError,
    /// Peer broke the protocol
    ProtocolError,
    /// Local resource failure
    Internal,
}

/// Coarse phase of a transfer
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum GlobalStep {
    /// Not started
    #[default]
    NoTask,
    /// Running pre-tasks
    PreTask,
    /// Moving blocks
    Transfer,
    /// Running post-tasks
    PostTask,
    /// Finished
    AllDone,
}

/// Transfer mode flags
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TransferMode(u8);

impl TransferMode {
    /// Plain transfer
    pub const NORMAL: Self = Self(0);
    /// Verify a whole-file BLAKE3 checksum at the end
    pub const CHECKSUM: Self = Self(0b01);
    /// Keep partial data so an interrupted transfer resumes at its rank
    pub const RECOVERY: Self = Self(0b10);

    /// Build from raw wire bits, dropping unknown ones
    pub const fn from_bits(bits: u8) -> Self {
        Self(bits & 0b11)
    }

    /// Raw wire bits
    pub const fn bits(self) -> u8 {
        self.0
    }

    /// Whether every flag of `other` is set
    pub const fn contains(self, other: Self) -> bool {
        self.0 & other.0 == other.0
    }

    /// Union of both flag sets
    #[must_use]
    pub const fn with(self, other: Self) -> Self {
        Self(self.0 | other.0)
    }
}

/// Durable state of one transfer
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransferRecord {
    /// Identity
    pub key: TransferKey,

    /// Current coarse phase
    pub global_step: GlobalStep,
    /// Last phase that completed
    pub global_last_step: GlobalStep,
    /// Sub-step inside the current phase (task index)
    pub step: u32,
    /// Number of committed blocks, the resume cursor
    pub rank: u64,
    /// Outcome of the current step
    pub step_status: ErrorCode,

    /// Whether this host receives or sends the blocks
    pub retrieve_mode: RetrieveMode,
    /// Block size in bytes
    pub block_size: u32,
    /// Mode flags
    pub mode: TransferMode,

    /// Local file path
    pub filename: String,
    /// Name of the file on the initiating host
    pub original_name: String,
    /// Rule selecting the task chains
    pub rule_id: String,
    /// Free-form file information sent to the peer
    pub file_info: String,
    /// Free-form transfer information, also carries the last error detail
    pub transfer_info: String,
    /// Start of the last attempt (ms since epoch)
    pub start_trans: u64,
    /// End of the last attempt (ms since epoch)
    pub stop_trans: Option<u64>,

    /// Classification of the last outcome
    pub info_status: ErrorCode,
    /// Lifecycle marker
    pub updated_info: UpdatedInfo,
}

impl TransferRecord {
    /// Create a record ready for submission
    pub fn new(
        key: TransferKey,
        rule_id: impl Into<String>,
        filename: impl Into<String>,
        retrieve_mode: RetrieveMode,
        block_size: u32,
        mode: TransferMode,
    ) -> Self {
        let filename = filename.into();
        Self {
            key,
            global_step: GlobalStep::NoTask,
            global_last_step: GlobalStep::NoTask,
            step: 0,
            rank: 0,
            step_status: ErrorCode::InitOk,
            retrieve_mode,
            block_size,
            mode,
            original_name: filename.clone(),
            filename,
            rule_id: rule_id.into(),
            file_info: String::new(),
            transfer_info: String::new(),
            start_trans: now_millis(),
            stop_trans: None,
            info_status: ErrorCode::InitOk,
            updated_info: UpdatedInfo::ToSubmit,
        }
    }

    /// Whether pre-tasks already completed for this transfer
    pub fn pre_tasks_done(&self) -> bool {
        self.global_last_step >= GlobalStep::PreTask
    }

    /// Enter a phase
    pub fn enter_step(&mut self, step: GlobalStep) {
        self.global_step = step;
        self.step = 0;
    }

    /// Mark the current phase complete
    pub fn complete_step(&mut self, status: ErrorCode) {
        self.global_last_step = self.global_step;
        self.step_status = status;
    }

    /// Count one more committed block
    pub fn commit_block(&mut self) {
        self.rank += 1;
    }

    /// Explicit restart from the first block
    pub fn restart_from_zero(&mut self) {
        self.rank = 0;
        self.global_step = GlobalStep::NoTask;
        self.global_last_step = GlobalStep::NoTask;
        self.step = 0;
    }

    /// Put an `InError` or `Interrupted` record back to `ToSubmit`
    pub fn resubmit(&mut self) -> bool {
        if !self.updated_info.is_resubmittable() {
            return false;
        }
        self.updated_info = UpdatedInfo::ToSubmit;
        self.stop_trans = None;
        true
    }

    /// Mark a record left `Running` by a process that is gone as
    /// `Interrupted`, keeping its rank and completed steps
    pub fn mark_abandoned(&mut self) -> bool {
        if self.updated_info != UpdatedInfo::Running {
            return false;
        }
        self.updated_info = UpdatedInfo::Interrupted;
        self.info_status = ErrorCode::StoppedTransfer;
        self.step_status = ErrorCode::StoppedTransfer;
        self.transfer_info = "transfer was running when its process stopped".to_string();
        self.stop_trans = Some(now_millis());
        true
    }

    /// Bytes covered by the committed blocks
    pub fn committed_bytes(&self) -> u64 {
        self.rank.saturating_mul(u64::from(self.block_size))
    }
}

/// Milliseconds since the Unix epoch
pub fn now_millis() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record() -> TransferRecord {
        TransferRecord::new(
            TransferKey::new("hosta", "hosta", "hostb", 7),
            "default",
            "/data/out/report.csv",
            RetrieveMode::Push,
            4096,
            TransferMode::RECOVERY,
        )
    }

    #[test]
    fn test_updated_info_decoding() {
        for value in 0..=6 {
            assert_eq!(UpdatedInfo::from_i32(value) as i32, value);
        }
        assert_eq!(UpdatedInfo::from_i32(-1), UpdatedInfo::Unknown);
        assert_eq!(UpdatedInfo::from_i32(7), UpdatedInfo::Unknown);
        assert_eq!(UpdatedInfo::from(i32::MAX), UpdatedInfo::Unknown);
    }

    #[test]
    fn test_updated_info_serde_unknown() {
        let info: UpdatedInfo = serde_json::from_str("42").unwrap();
        assert_eq!(info, UpdatedInfo::Unknown);
        assert_eq!(serde_json::to_string(&UpdatedInfo::Done).unwrap(), "6");
    }

    #[test]
    fn test_startable_states() {
        assert!(UpdatedInfo::ToSubmit.is_startable());
        assert!(UpdatedInfo::InError.is_startable());
        assert!(UpdatedInfo::Interrupted.is_startable());
        assert!(!UpdatedInfo::Done.is_startable());
        assert!(!UpdatedInfo::Running.is_startable());
        assert!(!UpdatedInfo::Unknown.is_startable());
    }

    #[test]
    fn test_resubmit() {
        let mut rec = record();
        assert!(!rec.resubmit());

        rec.updated_info = UpdatedInfo::InError;
        rec.rank = 3;
        assert!(rec.resubmit());
        assert_eq!(rec.updated_info, UpdatedInfo::ToSubmit);
        assert_eq!(rec.rank, 3);

        rec.updated_info = UpdatedInfo::Done;
        assert!(!rec.resubmit());
    }

    #[test]
    fn test_mark_abandoned() {
        let mut rec = record();
        assert!(!rec.mark_abandoned());

        rec.updated_info = UpdatedInfo::Running;
        rec.rank = 2;
        assert!(rec.mark_abandoned());
        assert_eq!(rec.updated_info, UpdatedInfo::Interrupted);
        assert_eq!(rec.info_status, ErrorCode::StoppedTransfer);
        assert_eq!(rec.rank, 2);
        assert!(rec.stop_trans.is_some());
        assert!(rec.resubmit());
    }

    #[test]
    fn test_pre_tasks_done_tracking() {
        let mut rec = record();
        assert!(!rec.pre_tasks_done());

        rec.enter_step(GlobalStep::PreTask);
        assert!(!rec.pre_tasks_done());
        rec.complete_step(ErrorCode::PreProcessingOk);
        assert!(rec.pre_tasks_done());

        rec.enter_step(GlobalStep::Transfer);
        assert!(rec.pre_tasks_done());

        rec.restart_from_zero();
        assert!(!rec.pre_tasks_done());
    }

    #[test]
    fn test_mode_flags() {
        let mode = TransferMode::CHECKSUM.with(TransferMode::RECOVERY);
        assert!(mode.contains(TransferMode::CHECKSUM));
        assert!(mode.contains(TransferMode::RECOVERY));
        assert!(!TransferMode::NORMAL.contains(TransferMode::CHECKSUM));
        assert_eq!(TransferMode::from_bits(0xFF).bits(), 0b11);
    }

    #[test]
    fn test_key_file_stem() {
        let key = TransferKey::new("host:a", "host/a", "b", 12);
        assert_eq!(key.file_stem(), "12_host_a_host_a_b");
        assert_eq!(key.to_string(), "host:a:host/a->b#12");
    }

    #[test]
    fn test_record_json_roundtrip() {
        let mut rec = record();
        rec.rank = 2;
        rec.updated_info = UpdatedInfo::InError;
        let json = serde_json::to_string(&rec).unwrap();
        let back: TransferRecord = serde_json::from_str(&json).unwrap();
        assert_eq!(back, rec);
    }
}
