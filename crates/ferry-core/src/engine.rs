//! Transfer engine
//!
//! The engine owns every shared component (store, registry, limiter, rules)
//! and starts one state machine per transfer on its own tokio task. It is
//! cheap to clone; all clones drive the same engine.

use crate::bridge::{PacketBridge, PeerEvent};
use crate::config::{EngineConfig, MAX_BLOCK_SIZE};
use crate::error::{Result, TransferError};
use crate::limiter::{BandwidthLimiter, Limit, LimiterStats};
use crate::local_channel::{LocalChannelReference, TransferOutcome};
use crate::machine::{
    DiskFileOpener, FileOpener, InterruptHandle, MachineDeps, Role, TransferStateMachine,
};
use crate::record::{TransferKey, TransferMode, TransferRecord, UpdatedInfo};
use crate::registry::{ConnectionRegistry, RegistryStats};
use crate::signal::CompletionSignal;
use crate::store::{MemoryStore, TransferStore};
use crate::task::{BusinessHook, Rule, TaskChain};
use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use ferry_transport::{Channel, Connector, RequestPacket, RetrieveMode, TcpChannel, TcpConnector};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tokio::sync::{Semaphore, watch};

/// Rule used when a request names none
pub const DEFAULT_RULE: &str = "default";

/// Parameters of a new outbound transfer
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransferRequest {
    /// Partner host name, or a socket address
    pub partner: String,
    /// Rule selecting the task chains
    pub rule_id: String,
    /// Local path to send, or remote name to fetch
    pub filename: String,
    /// Whether this host sends (`Push`) or receives (`Pull`)
    pub retrieve_mode: RetrieveMode,
    /// Block size, the engine default when `None`
    pub block_size: Option<u32>,
    /// Mode flags, the engine default when `None`
    pub mode: Option<TransferMode>,
    /// Free-form file information sent to the partner
    pub file_info: String,
}

impl TransferRequest {
    /// Send `filename` to `partner`
    pub fn send(partner: impl Into<String>, filename: impl Into<String>) -> Self {
        Self::new(partner, filename, RetrieveMode::Push)
    }

    /// Fetch `filename` from `partner`
    pub fn receive(partner: impl Into<String>, filename: impl Into<String>) -> Self {
        Self::new(partner, filename, RetrieveMode::Pull)
    }

    fn new(partner: impl Into<String>, filename: impl Into<String>, mode: RetrieveMode) -> Self {
        Self {
            partner: partner.into(),
            rule_id: DEFAULT_RULE.to_string(),
            filename: filename.into(),
            retrieve_mode: mode,
            block_size: None,
            mode: None,
            file_info: String::new(),
        }
    }

    /// Use `rule_id` instead of the default rule
    #[must_use]
    pub fn with_rule(mut self, rule_id: impl Into<String>) -> Self {
        self.rule_id = rule_id.into();
        self
    }

    /// Use a specific block size
    #[must_use]
    pub fn with_block_size(mut self, block_size: u32) -> Self {
        self.block_size = Some(block_size);
        self
    }

    /// Use specific mode flags
    #[must_use]
    pub fn with_mode(mut self, mode: TransferMode) -> Self {
        self.mode = Some(mode);
        self
    }
}

/// Caller's view of a started transfer
#[derive(Debug, Clone)]
pub struct TransferHandle {
    key: TransferKey,
    outcome: Arc<CompletionSignal<TransferOutcome>>,
    closed: Arc<CompletionSignal<()>>,
    interrupt: InterruptHandle,
}

impl TransferHandle {
    /// Transfer identity
    pub fn key(&self) -> &TransferKey {
        &self.key
    }

    /// Wait for the terminal outcome
    pub async fn wait(&self) -> TransferOutcome {
        self.outcome.wait().await
    }

    /// Outcome, if already known
    pub fn try_outcome(&self) -> Option<TransferOutcome> {
        self.outcome.peek()
    }

    /// Wait until the transfer's channel is closed
    pub async fn wait_closed(&self) {
        self.closed.wait().await;
    }

    /// Ask the transfer to stop at the next block boundary
    pub fn interrupt(&self) {
        self.interrupt.interrupt();
    }
}

struct RunningTransfer {
    interrupt: InterruptHandle,
    outcome: Arc<CompletionSignal<TransferOutcome>>,
}

struct EngineInner {
    config: EngineConfig,
    store: Arc<dyn TransferStore>,
    limiter: Arc<BandwidthLimiter>,
    registry: Arc<ConnectionRegistry>,
    files: Arc<dyn FileOpener>,
    hook: Option<Arc<dyn BusinessHook>>,
    rules: HashMap<String, TaskChain>,
    permits: Arc<Semaphore>,
    running: DashMap<TransferKey, RunningTransfer>,
    shutdown: watch::Sender<bool>,
}

/// Managed file transfer engine
#[derive(Clone)]
pub struct Engine {
    inner: Arc<EngineInner>,
}

/// Builder for [`Engine`]
pub struct EngineBuilder {
    config: EngineConfig,
    store: Option<Arc<dyn TransferStore>>,
    connector: Option<Arc<dyn Connector>>,
    files: Option<Arc<dyn FileOpener>>,
    hook: Option<Arc<dyn BusinessHook>>,
    rules: HashMap<String, TaskChain>,
}

impl EngineBuilder {
    /// Persist records in `store` (in memory by default)
    #[must_use]
    pub fn store(mut self, store: Arc<dyn TransferStore>) -> Self {
        self.store = Some(store);
        self
    }

    /// Dial partners through `connector` (TCP by default)
    #[must_use]
    pub fn connector(mut self, connector: Arc<dyn Connector>) -> Self {
        self.connector = Some(connector);
        self
    }

    /// Open local files through `files` (the local disk by default)
    #[must_use]
    pub fn file_opener(mut self, files: Arc<dyn FileOpener>) -> Self {
        self.files = Some(files);
        self
    }

    /// Call `hook` around pre and post phases
    #[must_use]
    pub fn hook(mut self, hook: Arc<dyn BusinessHook>) -> Self {
        self.hook = Some(hook);
        self
    }

    /// Register a declarative rule
    #[must_use]
    pub fn rule(self, rule: &Rule) -> Self {
        let chain = TaskChain::from_rule(rule);
        self.task_chain(rule.id.clone(), chain)
    }

    /// Register a rule backed by custom tasks
    #[must_use]
    pub fn task_chain(mut self, rule_id: impl Into<String>, chain: TaskChain) -> Self {
        self.rules.insert(rule_id.into(), chain);
        self
    }

    /// Validate the configuration and build the engine
    pub fn build(self) -> Result<Engine> {
        self.config.validate()?;
        let config = self.config;

        let connector = self
            .connector
            .unwrap_or_else(|| Arc::new(TcpConnector::new(config.registry.connect_timeout)));
        let registry = Arc::new(ConnectionRegistry::new(config.registry.clone(), connector));
        let mut rules = self.rules;
        rules
            .entry(DEFAULT_RULE.to_string())
            .or_insert_with(TaskChain::empty);
        let (shutdown, _) = watch::channel(false);

        tracing::info!(
            host = %config.host_id,
            rules = rules.len(),
            max_concurrent = config.max_concurrent,
            "Engine ready"
        );

        Ok(Engine {
            inner: Arc::new(EngineInner {
                store: self.store.unwrap_or_else(|| Arc::new(MemoryStore::new())),
                limiter: Arc::new(BandwidthLimiter::new(config.limit)),
                registry,
                files: self.files.unwrap_or_else(|| Arc::new(DiskFileOpener)),
                hook: self.hook,
                rules,
                permits: Arc::new(Semaphore::new(config.max_concurrent)),
                running: DashMap::new(),
                shutdown,
                config,
            }),
        })
    }
}

impl Engine {
    /// Start building an engine for `config`
    pub fn builder(config: EngineConfig) -> EngineBuilder {
        EngineBuilder {
            config,
            store: None,
            connector: None,
            files: None,
            hook: None,
            rules: HashMap::new(),
        }
    }

    /// Engine configuration
    pub fn config(&self) -> &EngineConfig {
        &self.inner.config
    }

    /// Name of this host
    pub fn host_id(&self) -> &str {
        &self.inner.config.host_id
    }

    /// Create and persist a record for `request` without starting it
    pub async fn submit(&self, request: TransferRequest) -> Result<TransferRecord> {
        let config = &self.inner.config;
        if !self.inner.rules.contains_key(&request.rule_id) {
            return Err(TransferError::NotFound(format!("rule '{}'", request.rule_id)));
        }
        let block_size = request.block_size.unwrap_or(config.transfer.block_size);
        check_block_size(block_size)?;
        if request.filename.trim().is_empty() {
            return Err(TransferError::InvalidConfig("file name must not be empty".into()));
        }

        let special_id = self.inner.store.allocate_special_id().await?;
        let key = TransferKey::new(
            config.host_id.clone(),
            config.host_id.clone(),
            request.partner.clone(),
            special_id,
        );
        let local_path = match request.retrieve_mode {
            RetrieveMode::Push => resolve_local(&config.out_dir, &request.filename),
            RetrieveMode::Pull => config.in_dir.join(base_name(&request.filename)?),
        };

        let mut record = TransferRecord::new(
            key,
            request.rule_id,
            local_path.to_string_lossy(),
            request.retrieve_mode,
            block_size,
            request.mode.unwrap_or(config.transfer.mode),
        );
        record.original_name = request.filename;
        record.file_info = request.file_info;
        self.inner.store.put(&record).await?;

        tracing::info!(
            transfer = %record.key,
            file = %record.filename,
            mode = ?record.retrieve_mode,
            "Transfer submitted"
        );
        Ok(record)
    }

    /// Submit `request` and start it
    pub async fn transfer(&self, request: TransferRequest) -> Result<TransferHandle> {
        let record = self.submit(request).await?;
        self.run(&record.key).await
    }

    /// Start a submitted, interrupted or failed transfer this host requested.
    ///
    /// Returns once the transfer is scheduled; the handle yields its outcome.
    pub async fn run(&self, key: &TransferKey) -> Result<TransferHandle> {
        self.ensure_accepting()?;
        let record = self
            .inner
            .store
            .get(key)
            .await?
            .ok_or_else(|| TransferError::NotFound(format!("transfer {key}")))?;
        TransferStateMachine::check_startable(&record)?;
        let addr = self
            .inner
            .config
            .partner_addr(&record.key.requested)
            .ok_or_else(|| {
                TransferError::NotFound(format!("partner '{}'", record.key.requested))
            })?;
        let deps = self.deps(&record.rule_id)?;
        let handle = self.register(key)?;

        let inner = Arc::clone(&self.inner);
        let task_handle = handle.clone();
        tokio::spawn(async move {
            let _permit = Arc::clone(&inner.permits).acquire_owned().await.ok();
            let machine = TransferStateMachine::new(
                record,
                inner.config.host_id.clone(),
                Role::Requester,
                deps,
                &task_handle.interrupt,
            );

            match inner.registry.open_channel(addr).await {
                Ok(channel) => {
                    let local = Arc::new(LocalChannelReference::new(
                        task_handle.key.clone(),
                        channel,
                        Arc::clone(&task_handle.outcome),
                        Arc::clone(&task_handle.closed),
                        Some(Arc::clone(&inner.registry)),
                    ));
                    let guard = inner.bridge().guard(local);
                    if let Err(failure) = machine.run(guard).await {
                        tracing::debug!(
                            transfer = %task_handle.key,
                            "Requested transfer ended: {}", failure.error
                        );
                    }
                }
                Err(error) => {
                    tracing::warn!(
                        transfer = %task_handle.key,
                        "Cannot reach {}: {}", addr, error
                    );
                    let failure = machine.fail_unconnected(error).await;
                    task_handle.outcome.resolve(Err(failure));
                    task_handle.closed.resolve(());
                }
            }
        });
        Ok(handle)
    }

    /// Put an `INERROR` or `INTERRUPTED` transfer back to `TOSUBMIT`
    pub async fn resubmit(&self, key: &TransferKey) -> Result<TransferRecord> {
        let mut record = self
            .inner
            .store
            .get(key)
            .await?
            .ok_or_else(|| TransferError::NotFound(format!("transfer {key}")))?;
        if !record.resubmit() {
            return Err(TransferError::InvalidState(
                format!("transfer {key} is {}, not resubmittable", record.updated_info).into(),
            ));
        }
        self.inner.store.put(&record).await?;
        tracing::info!(transfer = %key, rank = record.rank, "Transfer resubmitted");
        Ok(record)
    }

    /// Mark `RUNNING` records that no transfer of this engine is driving as
    /// `INTERRUPTED`, so that a transfer cut short by a crash can be
    /// resubmitted. Returns the records it changed.
    pub async fn recover(&self) -> Result<Vec<TransferRecord>> {
        let mut recovered = Vec::new();
        for mut record in self.inner.store.list(Some(UpdatedInfo::Running)).await? {
            let live = self
                .inner
                .running
                .get(&record.key)
                .is_some_and(|running| !running.outcome.is_resolved());
            if live || !record.mark_abandoned() {
                continue;
            }
            self.inner.store.put(&record).await?;
            tracing::warn!(
                transfer = %record.key,
                rank = record.rank,
                "Transfer left running by a stopped process, marked interrupted"
            );
            recovered.push(record);
        }
        Ok(recovered)
    }

    /// Interrupt a running transfer; returns whether one was found
    pub fn interrupt(&self, key: &TransferKey) -> bool {
        match self.inner.running.get(key) {
            Some(running) if !running.outcome.is_resolved() => {
                tracing::info!(transfer = %key, "Interrupt requested");
                running.interrupt.interrupt();
                true
            }
            _ => false,
        }
    }

    /// Serve a transfer requested by the peer on `channel`.
    ///
    /// Reads the opening request, resolves or creates the local record and
    /// starts the responding state machine.
    pub async fn accept(&self, channel: Arc<dyn Channel>) -> Result<TransferHandle> {
        if let Err(error) = self.ensure_accepting() {
            let _ = channel.close().await;
            return Err(error);
        }
        let channel = self.inner.registry.accept(channel).await?;
        let bridge = self.inner.bridge();

        let request = match bridge.next_event(channel.as_ref()).await {
            Ok(PeerEvent::Request(request)) => request,
            Ok(_) => {
                let error = TransferError::protocol("expected a transfer request");
                self.refuse(channel, &error).await;
                return Err(error);
            }
            Err(error) => {
                self.release(channel).await;
                return Err(error);
            }
        };
        tracing::debug!(
            channel = channel.id(),
            "Request {} from {} for '{}'",
            request.special_id,
            request.requester,
            request.filename
        );

        let prepared = match self.responder_record(&request).await {
            Ok(record) => self.deps(&record.rule_id).map(|deps| (record, deps)),
            Err(error) => Err(error),
        };
        let (record, deps) = match prepared {
            Ok(prepared) => prepared,
            Err(error) => {
                tracing::warn!("Refusing request {}: {}", request.special_id, error);
                self.refuse(channel, &error).await;
                return Err(error);
            }
        };
        let handle = match self.register(&record.key) {
            Ok(handle) => handle,
            Err(error) => {
                self.refuse(channel, &error).await;
                return Err(error);
            }
        };

        let local = Arc::new(LocalChannelReference::new(
            record.key.clone(),
            channel,
            Arc::clone(&handle.outcome),
            Arc::clone(&handle.closed),
            Some(Arc::clone(&self.inner.registry)),
        ));
        let guard = bridge.guard(local);
        let machine = TransferStateMachine::new(
            record,
            self.inner.config.host_id.clone(),
            Role::Responder(request),
            deps,
            &handle.interrupt,
        );
        tokio::spawn(machine.run(guard));
        Ok(handle)
    }

    /// Accept TCP connections from `listener` until shutdown
    pub async fn serve(&self, listener: TcpListener) -> Result<()> {
        let local_addr = listener.local_addr()?;
        tracing::info!(host = %self.host_id(), "Listening on {}", local_addr);
        match self.recover().await {
            Ok(recovered) if !recovered.is_empty() => {
                tracing::info!("Recovered {} abandoned transfers", recovered.len());
            }
            Ok(_) => {}
            Err(e) => tracing::warn!("Recovering abandoned transfers failed: {}", e),
        }
        let mut shutdown = self.inner.shutdown.subscribe();

        loop {
            tokio::select! {
                accepted = listener.accept() => {
                    let (stream, peer) = match accepted {
                        Ok(accepted) => accepted,
                        Err(e) => {
                            tracing::warn!("Accept failed: {}", e);
                            continue;
                        }
                    };
                    let channel = match TcpChannel::from_stream(stream) {
                        Ok(channel) => channel,
                        Err(e) => {
                            tracing::warn!("Cannot set up channel from {}: {}", peer, e);
                            continue;
                        }
                    };
                    let engine = self.clone();
                    tokio::spawn(async move {
                        if let Err(e) = engine.accept(Arc::new(channel)).await {
                            tracing::warn!("Inbound transfer from {} refused: {}", peer, e);
                        }
                    });
                }
                _ = shutdown.wait_for(|stop| *stop) => break,
            }
        }

        tracing::info!("Stopped listening on {}", local_addr);
        Ok(())
    }

    /// Bind the configured listen address and serve it
    pub async fn listen(&self) -> Result<()> {
        let listener = TcpListener::bind(self.inner.config.listen_addr).await?;
        self.serve(listener).await
    }

    /// Replace the bandwidth limits; running transfers pick them up at their
    /// next limiter check
    pub fn update_limit(&self, limit: Limit) {
        self.inner.limiter.update_limit(limit);
    }

    /// Current bandwidth limits
    pub fn limit(&self) -> Limit {
        self.inner.limiter.limit()
    }

    /// Bytes accounted by the limiter so far
    pub fn limiter_stats(&self) -> LimiterStats {
        self.inner.limiter.stats()
    }

    /// Connection registry counters
    pub fn registry_stats(&self) -> RegistryStats {
        self.inner.registry.stats()
    }

    /// Fetch one record
    pub async fn get(&self, key: &TransferKey) -> Result<Option<TransferRecord>> {
        self.inner.store.get(key).await
    }

    /// List records, optionally in one lifecycle state
    pub async fn list(&self, filter: Option<UpdatedInfo>) -> Result<Vec<TransferRecord>> {
        self.inner.store.list(filter).await
    }

    /// Stop accepting work, interrupt running transfers and close every
    /// channel. Waits at most `grace` for running transfers to finish.
    pub async fn shutdown(&self, grace: Duration) {
        if self.inner.shutdown.send_replace(true) {
            return;
        }
        tracing::info!(host = %self.host_id(), "Shutting down");

        let pending: Vec<Arc<CompletionSignal<TransferOutcome>>> = self
            .inner
            .running
            .iter()
            .filter(|entry| !entry.outcome.is_resolved())
            .map(|entry| {
                entry.interrupt.interrupt();
                Arc::clone(&entry.outcome)
            })
            .collect();
        for outcome in pending {
            if outcome.wait_timeout(grace).await.is_none() {
                tracing::warn!("Transfer still running after {:?}, closing anyway", grace);
            }
        }
        self.inner.registry.close_all().await;
    }

    fn ensure_accepting(&self) -> Result<()> {
        if *self.inner.shutdown.borrow() {
            return Err(TransferError::invalid_state("engine is shutting down"));
        }
        Ok(())
    }

    fn deps(&self, rule_id: &str) -> Result<MachineDeps> {
        let tasks = self
            .inner
            .rules
            .get(rule_id)
            .cloned()
            .ok_or_else(|| TransferError::NotFound(format!("rule '{rule_id}'")))?;
        Ok(MachineDeps {
            store: Arc::clone(&self.inner.store),
            limiter: Arc::clone(&self.inner.limiter),
            files: Arc::clone(&self.inner.files),
            tasks,
            hook: self.inner.hook.clone(),
            config: self.inner.config.transfer.clone(),
        })
    }

    /// Track a transfer about to start, refusing one that is already running
    fn register(&self, key: &TransferKey) -> Result<TransferHandle> {
        let handle = TransferHandle {
            key: key.clone(),
            outcome: Arc::new(CompletionSignal::new()),
            closed: Arc::new(CompletionSignal::new()),
            interrupt: InterruptHandle::new(),
        };
        let running = RunningTransfer {
            interrupt: handle.interrupt.clone(),
            outcome: Arc::clone(&handle.outcome),
        };
        match self.inner.running.entry(key.clone()) {
            Entry::Occupied(entry) if !entry.get().outcome.is_resolved() => {
                Err(TransferError::InvalidState(
                    format!("transfer {key} is already running").into(),
                ))
            }
            Entry::Occupied(mut entry) => {
                entry.insert(running);
                Ok(handle)
            }
            Entry::Vacant(entry) => {
                entry.insert(running);
                Ok(handle)
            }
        }
    }

    /// Find the responder's record for `request`, creating it on first contact
    async fn responder_record(&self, request: &RequestPacket) -> Result<TransferRecord> {
        let config = &self.inner.config;
        if request.requested != config.host_id {
            return Err(TransferError::NotFound(format!(
                "request addressed to '{}', this host is '{}'",
                request.requested, config.host_id
            )));
        }
        if !self.inner.rules.contains_key(&request.rule_id) {
            return Err(TransferError::NotFound(format!("rule '{}'", request.rule_id)));
        }

        let key = TransferKey::new(
            config.host_id.clone(),
            request.requester.clone(),
            request.requested.clone(),
            request.special_id,
        );
        if let Some(record) = self.inner.store.get(&key).await? {
            tracing::info!(transfer = %key, rank = record.rank, "Known transfer, resuming");
            return Ok(record);
        }

        check_block_size(request.block_size).map_err(|_| {
            TransferError::protocol("requested block size is out of range")
        })?;
        let retrieve_mode = request.retrieve_mode.mirrored();
        let name = base_name(&request.filename)?;
        let local_path = match retrieve_mode {
            RetrieveMode::Pull => config.in_dir.join(name),
            RetrieveMode::Push => config.out_dir.join(name),
        };

        let mut record = TransferRecord::new(
            key,
            request.rule_id.clone(),
            local_path.to_string_lossy(),
            retrieve_mode,
            request.block_size,
            TransferMode::from_bits(request.mode),
        );
        record.original_name = request.filename.clone();
        record.file_info = request.file_info.clone();
        self.inner.store.put(&record).await?;
        tracing::info!(
            transfer = %record.key,
            file = %record.filename,
            mode = ?record.retrieve_mode,
            "Inbound transfer registered"
        );
        Ok(record)
    }

    async fn refuse(&self, channel: Arc<dyn Channel>, error: &TransferError) {
        self.inner
            .bridge()
            .deliver(channel.as_ref(), &PacketBridge::failure_packet(error, 0))
            .await;
        self.release(channel).await;
    }

    async fn release(&self, channel: Arc<dyn Channel>) {
        if let Err(e) = channel.close().await {
            tracing::debug!("Closing channel {} failed: {}", channel.id(), e);
        }
        self.inner.registry.release(channel.id());
    }
}

impl EngineInner {
    fn bridge(&self) -> PacketBridge {
        PacketBridge::new(
            self.config.transfer.outcome_timeout,
            self.config.transfer.recv_timeout,
        )
    }
}

impl std::fmt::Debug for Engine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Engine")
            .field("host_id", &self.inner.config.host_id)
            .field("running", &self.inner.running.len())
            .finish_non_exhaustive()
    }
}

fn check_block_size(block_size: u32) -> Result<()> {
    if block_size == 0 || block_size > MAX_BLOCK_SIZE {
        return Err(TransferError::InvalidConfig(
            format!("block size {block_size} outside 1..={MAX_BLOCK_SIZE}").into(),
        ));
    }
    Ok(())
}

/// Last component of a peer-supplied name; never escapes the target directory
fn base_name(name: &str) -> Result<&str> {
    Path::new(name)
        .file_name()
        .and_then(|n| n.to_str())
        .ok_or_else(|| TransferError::protocol("file name has no final component"))
}

fn resolve_local(dir: &Path, name: &str) -> PathBuf {
    let path = Path::new(name);
    if path.is_absolute() {
        path.to_path_buf()
    } else {
        dir.join(path)
    }
}
