//! Transfer state machine
//!
//! Drives one transfer through its phases:
//!
//! ```text
//! TOSUBMIT/INTERRUPTED/INERROR -> RUNNING -> pre-tasks -> rank negotiation
//!     -> block loop -> post-tasks -> DONE
//! ```
//!
//! Any failure leaves the record in `INERROR` or `INTERRUPTED` with `rank`
//! equal to the number of blocks the receiving side committed, so that a
//! resubmitted transfer resumes where this one stopped. A sender learns that
//! number from the receiver's final `ValidAck` or `ErrorNotice`.

use crate::bridge::{OutcomeGuard, PacketBridge, PeerEvent};
use crate::config::TransferConfig;
use crate::error::{FailureKind, Result, TransferError};
use crate::limiter::{BandwidthLimiter, Direction, SessionLimiter};
use crate::local_channel::{
    LocalChannelReference, TransferFailure, TransferOutcome, TransferSuccess,
};
use crate::record::{ErrorCode, GlobalStep, TransferMode, TransferRecord, UpdatedInfo, now_millis};
use crate::store::TransferStore;
use crate::task::{BusinessHook, TaskChain, TaskPhase};
use async_trait::async_trait;
use ferry_files::{BlockFile, DiskBlockFile, hasher};
use ferry_transport::{Channel, Packet, RequestPacket, RetrieveMode};
use std::fmt;
use std::future::Future;
use std::io;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

/// How long a failed send waits for an already queued peer verdict
const VERDICT_GRACE: Duration = Duration::from_millis(500);

/// Reconciliation of the two sides' ranks when a transfer resumes
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum RankPolicy {
    /// Restart from the smaller rank; never skips uncommitted data
    #[default]
    Minimum,
    /// The responder's own rank wins
    Local,
    /// The requester's rank wins
    Remote,
}

impl RankPolicy {
    /// Effective rank given the responder's `local` and the requester's `remote`
    pub fn resolve(self, local: u64, remote: u64) -> u64 {
        match self {
            RankPolicy::Minimum => local.min(remote),
            RankPolicy::Local => local,
            RankPolicy::Remote => remote,
        }
    }
}

impl fmt::Display for RankPolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            RankPolicy::Minimum => "minimum",
            RankPolicy::Local => "local",
            RankPolicy::Remote => "remote",
        })
    }
}

impl FromStr for RankPolicy {
    type Err = TransferError;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "minimum" | "min" => Ok(RankPolicy::Minimum),
            "local" => Ok(RankPolicy::Local),
            "remote" => Ok(RankPolicy::Remote),
            other => Err(TransferError::InvalidConfig(
                format!("unknown rank policy '{other}'").into(),
            )),
        }
    }
}

/// Caller-side cancellation of one running transfer.
///
/// Interruption is observed at block boundaries and while the machine waits
/// for the peer or the limiter; a block write in progress always completes.
#[derive(Debug, Clone)]
pub struct InterruptHandle {
    tx: Arc<watch::Sender<bool>>,
}

impl InterruptHandle {
    /// Create a handle that has not fired
    pub fn new() -> Self {
        let (tx, _rx) = watch::channel(false);
        Self { tx: Arc::new(tx) }
    }

    /// Request the transfer to stop
    pub fn interrupt(&self) {
        self.tx.send_replace(true);
    }

    /// Whether `interrupt` was called
    pub fn is_interrupted(&self) -> bool {
        *self.tx.borrow()
    }

    /// Receiver observed by the state machine
    pub fn subscribe(&self) -> watch::Receiver<bool> {
        self.tx.subscribe()
    }
}

impl Default for InterruptHandle {
    fn default() -> Self {
        Self::new()
    }
}

/// Opens the local file of a transfer
#[async_trait]
pub trait FileOpener: Send + Sync {
    /// Open `record.filename` for reading (push) or writing (pull)
    async fn open(&self, record: &TransferRecord) -> io::Result<Box<dyn BlockFile>>;
}

/// Opens files on the local disk
#[derive(Debug, Clone, Copy, Default)]
pub struct DiskFileOpener;

#[async_trait]
impl FileOpener for DiskFileOpener {
    async fn open(&self, record: &TransferRecord) -> io::Result<Box<dyn BlockFile>> {
        let block_size = record.block_size as usize;
        let file = match record.retrieve_mode {
            RetrieveMode::Push => DiskBlockFile::open_read(&record.filename, block_size).await?,
            RetrieveMode::Pull => DiskBlockFile::open_write(&record.filename, block_size).await?,
        };
        Ok(Box::new(file))
    }
}

/// Which end of the channel this machine drives
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Role {
    /// Opened the channel and sends the first request
    Requester,
    /// Answers the request read off an accepted channel
    Responder(RequestPacket),
}

/// Shared collaborators of every state machine run by one engine
#[derive(Clone)]
pub struct MachineDeps {
    /// Record persistence
    pub store: Arc<dyn TransferStore>,
    /// Process-wide bandwidth policy
    pub limiter: Arc<BandwidthLimiter>,
    /// Local file access
    pub files: Arc<dyn FileOpener>,
    /// Tasks of the transfer's rule
    pub tasks: TaskChain,
    /// Optional hook around pre and post phases
    pub hook: Option<Arc<dyn BusinessHook>>,
    /// Timeouts and rank policy
    pub config: TransferConfig,
}

impl fmt::Debug for MachineDeps {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MachineDeps")
            .field("hook", &self.hook.is_some())
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

/// What one machine knows about its transfer
#[derive(Debug, Clone)]
pub struct TransferContext {
    /// The record, mutated as the transfer progresses
    pub record: TransferRecord,
    /// Name of this host
    pub local_host: String,
    /// Requester or responder
    pub role: Role,
    /// The peer already sent its final verdict, so no outcome message is owed
    pub peer_verdict: bool,
}

/// Single-transfer state machine
pub struct TransferStateMachine {
    ctx: TransferContext,
    deps: MachineDeps,
    bridge: PacketBridge,
    limiter: SessionLimiter,
    interrupt: watch::Receiver<bool>,
}

impl TransferStateMachine {
    /// Create a machine for `record`
    pub fn new(
        record: TransferRecord,
        local_host: impl Into<String>,
        role: Role,
        deps: MachineDeps,
        interrupt: &InterruptHandle,
    ) -> Self {
        let bridge = PacketBridge::new(deps.config.outcome_timeout, deps.config.recv_timeout);
        let limiter = deps.limiter.session();
        Self {
            ctx: TransferContext {
                record,
                local_host: local_host.into(),
                role,
                peer_verdict: false,
            },
            deps,
            bridge,
            limiter,
            interrupt: interrupt.subscribe(),
        }
    }

    /// Current context
    pub fn context(&self) -> &TransferContext {
        &self.ctx
    }

    /// Reject records that must not be started
    pub fn check_startable(record: &TransferRecord) -> Result<()> {
        match record.updated_info {
            state if state.is_startable() => Ok(()),
            UpdatedInfo::Done => Err(TransferError::InvalidState(
                format!("transfer {} is already done", record.key).into(),
            )),
            UpdatedInfo::Running => Err(TransferError::InvalidState(
                format!("transfer {} is already running", record.key).into(),
            )),
            state => Err(TransferError::InvalidState(
                format!("transfer {} cannot start from {:?}", record.key, state).into(),
            )),
        }
    }

    /// Drive the transfer bound to `guard` to its terminal outcome.
    ///
    /// The outcome message is sent before the completion signal resolves,
    /// and the channel closes after both.
    pub async fn run(mut self, guard: OutcomeGuard) -> TransferOutcome {
        let local = Arc::clone(guard.local());
        let channel = Arc::clone(local.channel());
        if let Role::Responder(request) = &self.ctx.role {
            local.set_remote_id(request.local_id);
        }

        if let Err(error) = Self::check_startable(&self.ctx.record) {
            warn!(transfer = %self.ctx.record.key, "Refusing to start: {}", error);
            self.bridge
                .deliver(
                    channel.as_ref(),
                    &PacketBridge::failure_packet(&error, self.ctx.record.rank),
                )
                .await;
            let outcome = Err(TransferFailure::new(error, Some(self.ctx.record.clone())));
            guard.finish(outcome.clone()).await;
            return outcome;
        }

        let outcome = match self.execute(&channel, &local).await {
            Ok(checksum) => {
                if !self.ctx.peer_verdict {
                    self.bridge
                        .deliver(
                            channel.as_ref(),
                            &PacketBridge::success_packet(self.ctx.record.rank),
                        )
                        .await;
                }
                info!(
                    transfer = %self.ctx.record.key,
                    rank = self.ctx.record.rank,
                    "Transfer done"
                );
                Ok(TransferSuccess {
                    record: self.ctx.record.clone(),
                    checksum,
                })
            }
            Err(error) => Err(self.fail(error, Some(channel.as_ref())).await),
        };
        guard.finish(outcome.clone()).await;
        outcome
    }

    /// Record a failure for a transfer that never obtained a channel
    pub async fn fail_unconnected(mut self, error: TransferError) -> TransferFailure {
        self.fail(error, None).await
    }

    async fn execute(
        &mut self,
        channel: &Arc<dyn Channel>,
        local: &LocalChannelReference,
    ) -> Result<Option<String>> {
        self.begin().await?;

        if self.ctx.record.pre_tasks_done() {
            debug!(transfer = %self.ctx.record.key, "Pre-tasks already done, skipping");
        } else {
            self.run_phase(TaskPhase::Pre).await?;
        }
        self.check_interrupt()?;

        self.negotiate(channel.as_ref(), local).await?;
        if self.ctx.record.global_step != GlobalStep::Transfer {
            self.ctx.record.enter_step(GlobalStep::Transfer);
        }
        self.persist().await?;

        let checksum = match self.ctx.record.retrieve_mode {
            RetrieveMode::Push => self.push_blocks(channel).await?,
            RetrieveMode::Pull => self.pull_blocks(channel.as_ref()).await?,
        };
        self.ctx.record.complete_step(ErrorCode::TransferOk);
        self.persist().await?;

        self.check_interrupt()?;
        self.run_phase(TaskPhase::Post).await?;
        self.finalize().await?;
        Ok(checksum)
    }

    async fn begin(&mut self) -> Result<()> {
        let record = &mut self.ctx.record;
        if record.rank > 0 && !record.mode.contains(TransferMode::RECOVERY) {
            info!(transfer = %record.key, "Recovery disabled, restarting from the first block");
            record.restart_from_zero();
        }
        record.updated_info = UpdatedInfo::Running;
        record.info_status = ErrorCode::Running;
        record.step_status = ErrorCode::Running;
        record.transfer_info.clear();
        record.start_trans = now_millis();
        record.stop_trans = None;
        info!(
            transfer = %record.key,
            mode = ?record.retrieve_mode,
            rank = record.rank,
            "Transfer running"
        );
        self.persist().await
    }

    /// Run the tasks of `phase`, resuming after the last persisted task
    async fn run_phase(&mut self, phase: TaskPhase) -> Result<()> {
        let (step, done) = match phase {
            TaskPhase::Pre => (GlobalStep::PreTask, ErrorCode::PreProcessingOk),
            TaskPhase::Post => (GlobalStep::PostTask, ErrorCode::PostProcessingOk),
            TaskPhase::Error => return Ok(()),
        };
        let resume_from = if self.ctx.record.global_step == step {
            self.ctx.record.step as usize
        } else {
            self.ctx.record.enter_step(step);
            0
        };

        if let Some(hook) = &self.deps.hook {
            hook.before(phase, &self.ctx.record).await?;
        }
        let tasks = self.deps.tasks.tasks(phase).to_vec();
        for (index, task) in tasks.iter().enumerate().skip(resume_from) {
            debug!(transfer = %self.ctx.record.key, "Running {:?} task {}", phase, task.name());
            task.run(phase, &mut self.ctx.record).await?;
            self.ctx.record.step = index as u32 + 1;
            self.persist().await?;
        }
        if let Some(hook) = &self.deps.hook {
            hook.after(phase, &self.ctx.record).await?;
        }

        self.ctx.record.complete_step(done);
        self.persist().await
    }

    async fn run_error_tasks(&mut self) {
        let tasks = self.deps.tasks.tasks(TaskPhase::Error).to_vec();
        for task in tasks {
            if let Err(e) = task.run(TaskPhase::Error, &mut self.ctx.record).await {
                warn!(
                    transfer = %self.ctx.record.key,
                    "Error task {} failed: {}", task.name(), e
                );
            }
        }
    }

    /// Agree on the rank both sides resume from
    async fn negotiate(
        &mut self,
        channel: &dyn Channel,
        local: &LocalChannelReference,
    ) -> Result<()> {
        let local_rank = self.ctx.record.rank;
        let effective = match &self.ctx.role {
            Role::Requester => {
                let request = self.request_packet(local.local_id(), local_rank);
                channel.send(&Packet::Request(request)).await?;
                let event =
                    until_interrupted(&mut self.interrupt, self.bridge.next_event(channel))
                        .await??;
                match event {
                    PeerEvent::Request(reply) => {
                        local.set_remote_id(reply.local_id);
                        reply.rank
                    }
                    PeerEvent::Rejected { message, .. } => {
                        self.ctx.peer_verdict = true;
                        return Err(TransferError::PeerRejected(message));
                    }
                    _ => return Err(TransferError::protocol("expected a negotiation reply")),
                }
            }
            Role::Responder(request) => {
                if request.block_size != self.ctx.record.block_size {
                    return Err(TransferError::protocol("block size differs from the peer's"));
                }
                let effective = self.deps.config.rank_policy.resolve(local_rank, request.rank);
                let reply = self.request_packet(local.local_id(), effective);
                channel.send(&Packet::Request(reply)).await?;
                effective
            }
        };

        if effective != local_rank {
            info!(
                transfer = %self.ctx.record.key,
                "Resuming at negotiated rank {} (local rank {})", effective, local_rank
            );
        }
        self.ctx.record.rank = effective;
        Ok(())
    }

    fn request_packet(&self, local_id: u64, rank: u64) -> RequestPacket {
        let record = &self.ctx.record;
        RequestPacket {
            owner: record.key.owner.clone(),
            requester: record.key.requester.clone(),
            requested: record.key.requested.clone(),
            special_id: record.key.special_id,
            local_id,
            rule_id: record.rule_id.clone(),
            filename: record.original_name.clone(),
            block_size: record.block_size,
            rank,
            mode: record.mode.bits(),
            retrieve_mode: record.retrieve_mode,
            file_info: record.file_info.clone(),
        }
    }

    async fn open_file(&self) -> Result<Box<dyn BlockFile>> {
        self.deps
            .files
            .open(&self.ctx.record)
            .await
            .map_err(|e| TransferError::open_failed(&self.ctx.record.filename, e))
    }

    /// Send every block from the negotiated rank on, then wait for the verdict.
    ///
    /// The record's rank only moves to what the receiver acknowledged: the
    /// final `ValidAck`, or the committed rank of an `ErrorNotice`.
    async fn push_blocks(&mut self, channel: &Arc<dyn Channel>) -> Result<Option<String>> {
        let mut file = self.open_file().await?;
        let mut verdict = VerdictReader::spawn(Arc::clone(channel));
        let block_size = u64::from(self.ctx.record.block_size);
        let size = file.len().await?;
        let mut sent = self.ctx.record.rank;

        loop {
            self.check_interrupt()?;
            if let Some(event) = verdict.try_take().await {
                return Err(self.early_verdict(event, sent));
            }

            let offset = sent.saturating_mul(block_size);
            if offset >= size {
                break;
            }
            let expected = (size - offset).min(block_size) as usize;
            until_interrupted(
                &mut self.interrupt,
                self.limiter.throttle(Direction::Read, expected),
            )
            .await?;
            let payload = file.read_block(sent).await?;
            if payload.is_empty() {
                break;
            }

            if let Err(e) = channel.send(&Packet::Data { rank: sent, payload }).await {
                return Err(self.verdict_or(&mut verdict, sent, e.into()).await);
            }
            debug!(transfer = %self.ctx.record.key, "Sent block {}", sent);
            sent += 1;
        }

        let checksum = if self.ctx.record.mode.contains(TransferMode::CHECKSUM) {
            Some(hasher::to_hex(&file.digest().await?))
        } else {
            None
        };
        file.finish().await?;

        let end = Packet::EndTransfer {
            rank: sent,
            checksum: checksum.clone(),
        };
        if let Err(e) = channel.send(&end).await {
            return Err(self.verdict_or(&mut verdict, sent, e.into()).await);
        }

        let timeout = self.bridge.recv_timeout();
        let event = until_interrupted(&mut self.interrupt, verdict.join_timeout(timeout)).await??;
        match event {
            PeerEvent::Accepted { rank, .. } => {
                self.ctx.peer_verdict = true;
                if rank != sent {
                    return Err(TransferError::protocol(
                        "peer acknowledged a different block count",
                    ));
                }
                self.ctx.record.rank = sent;
                Ok(checksum)
            }
            PeerEvent::Rejected { message, rank, .. } => {
                self.ctx.peer_verdict = true;
                self.adopt_peer_rank(rank, sent);
                Err(TransferError::PeerRejected(message))
            }
            _ => Err(TransferError::protocol("unexpected packet while awaiting verdict")),
        }
    }

    /// Receive blocks in order until the sender reports the end of data
    async fn pull_blocks(&mut self, channel: &dyn Channel) -> Result<Option<String>> {
        let mut file = self.open_file().await?;
        let block_size = self.ctx.record.block_size as usize;

        let available = ferry_files::block_count(file.len().await?, block_size);
        if self.ctx.record.rank > available {
            return Err(TransferError::protocol("negotiated rank beyond local data"));
        }
        file.truncate_to(self.ctx.record.rank).await?;

        loop {
            let event =
                until_interrupted(&mut self.interrupt, self.bridge.next_event(channel)).await??;
            match event {
                PeerEvent::Block { rank, payload } => {
                    if rank != self.ctx.record.rank {
                        return Err(TransferError::protocol("block out of sequence"));
                    }
                    if payload.len() > block_size {
                        return Err(TransferError::protocol("block larger than the block size"));
                    }
                    until_interrupted(
                        &mut self.interrupt,
                        self.limiter.throttle(Direction::Write, payload.len()),
                    )
                    .await?;
                    file.write_block(rank, &payload).await?;
                    self.ctx.record.commit_block();
                    self.persist().await?;
                    debug!(transfer = %self.ctx.record.key, "Committed block {}", rank);
                }
                PeerEvent::EndOfData { rank, checksum } => {
                    if rank != self.ctx.record.rank {
                        return Err(TransferError::protocol(
                            "sender block count differs from committed blocks",
                        ));
                    }
                    file.finish().await?;
                    if !self.ctx.record.mode.contains(TransferMode::CHECKSUM) {
                        return Ok(None);
                    }
                    let digest = file.digest().await?;
                    return match checksum {
                        Some(expected) if hasher::matches_hex(&digest, &expected) => {
                            Ok(Some(hasher::to_hex(&digest)))
                        }
                        _ => Err(TransferError::ChecksumMismatch),
                    };
                }
                PeerEvent::Rejected { message, .. } => {
                    self.ctx.peer_verdict = true;
                    return Err(TransferError::PeerRejected(message));
                }
                _ => return Err(TransferError::protocol("unexpected packet during transfer")),
            }
        }
    }

    /// Turn a verdict that arrived before the end of data into the failure
    fn early_verdict(&mut self, event: Result<PeerEvent>, sent: u64) -> TransferError {
        match event {
            Ok(PeerEvent::Rejected { message, rank, .. }) => {
                self.ctx.peer_verdict = true;
                self.adopt_peer_rank(rank, sent);
                TransferError::PeerRejected(message)
            }
            Ok(_) => TransferError::protocol("unexpected packet while sending blocks"),
            Err(e) => e,
        }
    }

    /// Prefer a queued peer rejection over the send error it caused
    async fn verdict_or(
        &mut self,
        verdict: &mut VerdictReader,
        sent: u64,
        error: TransferError,
    ) -> TransferError {
        match tokio::time::timeout(VERDICT_GRACE, verdict.join()).await {
            Ok(Ok(PeerEvent::Rejected { message, rank, .. })) => {
                self.ctx.peer_verdict = true;
                self.adopt_peer_rank(rank, sent);
                TransferError::PeerRejected(message)
            }
            _ => error,
        }
    }

    /// Take the receiver's committed rank, bounded by what was acknowledged
    /// before and what was sent
    fn adopt_peer_rank(&mut self, peer_rank: u64, sent: u64) {
        let acked = self.ctx.record.rank;
        self.ctx.record.rank = peer_rank.clamp(acked, sent.max(acked));
    }

    async fn finalize(&mut self) -> Result<()> {
        let record = &mut self.ctx.record;
        record.enter_step(GlobalStep::AllDone);
        record.complete_step(ErrorCode::CompleteOk);
        record.info_status = ErrorCode::CompleteOk;
        record.updated_info = UpdatedInfo::Done;
        record.stop_trans = Some(now_millis());
        self.persist().await
    }

    /// Record the failure, notify the peer and run the error tasks
    async fn fail(&mut self, error: TransferError, channel: Option<&dyn Channel>) -> TransferFailure {
        let connected = channel.is_some();
        let delivered = match channel {
            Some(channel) if !self.ctx.peer_verdict => {
                self.bridge
                    .deliver(
                        channel,
                        &PacketBridge::failure_packet(&error, self.ctx.record.rank),
                    )
                    .await
            }
            _ => false,
        };
        let interrupted = error.is_interruption()
            || (error.kind() == FailureKind::Network && !delivered);

        let code = error_code(&error, self.ctx.record.global_step, connected);
        let record = &mut self.ctx.record;
        record.step_status = code;
        record.info_status = code;
        record.transfer_info = error.to_string();
        record.updated_info = if interrupted {
            UpdatedInfo::Interrupted
        } else {
            UpdatedInfo::InError
        };
        record.stop_trans = Some(now_millis());
        error!(
            transfer = %record.key,
            rank = record.rank,
            status = %record.updated_info,
            "Transfer failed: {}", error
        );

        self.run_error_tasks().await;
        if let Err(e) = self.persist().await {
            error!(transfer = %self.ctx.record.key, "Failed to persist failed transfer: {}", e);
        }
        TransferFailure::new(error, Some(self.ctx.record.clone()))
    }

    fn check_interrupt(&self) -> Result<()> {
        if *self.interrupt.borrow() {
            return Err(TransferError::interrupted("transfer interrupted by caller"));
        }
        Ok(())
    }

    async fn persist(&self) -> Result<()> {
        self.deps.store.put(&self.ctx.record).await
    }
}

/// Failure classification stored on the record
fn error_code(error: &TransferError, step: GlobalStep, connected: bool) -> ErrorCode {
    match error {
        TransferError::TaskFailed { .. } => ErrorCode::ExternalOperation,
        TransferError::PeerRejected(_) => ErrorCode::RemoteError,
        TransferError::Protocol(_) => ErrorCode::ProtocolError,
        TransferError::ChecksumMismatch => ErrorCode::ChecksumError,
        TransferError::Interrupted(_) => ErrorCode::StoppedTransfer,
        TransferError::FileNotFound(_) => ErrorCode::FileNotFound,
        TransferError::Blacklisted(_) => ErrorCode::ConnectionImpossible,
        TransferError::Io(_) if step == GlobalStep::Transfer => ErrorCode::TransferError,
        TransferError::Network(_) | TransferError::Timeout(_) if !connected => {
            ErrorCode::ConnectionImpossible
        }
        TransferError::Network(_) | TransferError::Timeout(_) => ErrorCode::Disconnection,
        TransferError::Io(_)
        | TransferError::Storage(_)
        | TransferError::System(_)
        | TransferError::InvalidState(_)
        | TransferError::NotFound(_)
        | TransferError::InvalidConfig(_) => ErrorCode::Internal,
    }
}

/// Await `fut` unless the transfer is interrupted first
async fn until_interrupted<T>(
    interrupt: &mut watch::Receiver<bool>,
    fut: impl Future<Output = T>,
) -> Result<T> {
    if *interrupt.borrow() {
        return Err(TransferError::interrupted("transfer interrupted by caller"));
    }
    let fired = async {
        if interrupt.wait_for(|stop| *stop).await.is_err() {
            // Handle dropped: nobody can interrupt any more
            std::future::pending::<()>().await;
        }
    };
    tokio::select! {
        value = fut => Ok(value),
        () = fired => Err(TransferError::interrupted("transfer interrupted by caller")),
    }
}

/// Background read of the receiver's verdict while blocks are being sent
struct VerdictReader {
    handle: JoinHandle<Result<PeerEvent>>,
}

impl VerdictReader {
    fn spawn(channel: Arc<dyn Channel>) -> Self {
        Self {
            handle: tokio::spawn(async move { PacketBridge::recv_event(channel.as_ref()).await }),
        }
    }

    /// The verdict if it already arrived
    async fn try_take(&mut self) -> Option<Result<PeerEvent>> {
        if self.handle.is_finished() {
            Some(self.join().await)
        } else {
            None
        }
    }

    async fn join(&mut self) -> Result<PeerEvent> {
        match (&mut self.handle).await {
            Ok(event) => event,
            Err(e) => Err(TransferError::System(
                format!("verdict reader failed: {e}").into(),
            )),
        }
    }

    async fn join_timeout(&mut self, timeout: Duration) -> Result<PeerEvent> {
        tokio::time::timeout(timeout, self.join())
            .await
            .map_err(|_| TransferError::timeout("waiting for the receiver's verdict"))?
    }
}

impl Drop for VerdictReader {
    fn drop(&mut self) {
        self.handle.abort();
    }
}
