//! Two-node fixture for end-to-end transfer tests
//!
//! `alpha` requests transfers, `beta` answers them. The nodes are joined by
//! in-memory channels: every channel alpha dials is handed to beta's
//! `accept`, and the packets alpha receives are recorded for inspection.

use async_trait::async_trait;
use ferry_core::{
    Engine, EngineConfig, FileOpener, JsonFileStore, Limit, MemoryStore, TransferHandle,
    TransferKey, TransferStore,
};
use ferry_transport::{
    Channel, ChannelId, ChannelStats, Connector, MemoryChannel, Packet, TransportResult,
};
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use tempfile::TempDir;

/// Name of the requesting node
pub const ALPHA: &str = "alpha";
/// Name of the answering node
pub const BETA: &str = "beta";

/// Packets one side received, in arrival order
type PacketLog = Arc<Mutex<Vec<Packet>>>;

/// Connects every dial to a peer engine through a memory pair
pub struct LoopbackConnector {
    peer: Engine,
    accepted: Arc<Mutex<Vec<TransferHandle>>>,
    received: PacketLog,
}

impl LoopbackConnector {
    /// Hand dialed channels to `peer`
    pub fn new(peer: Engine) -> Self {
        Self {
            peer,
            accepted: Arc::default(),
            received: Arc::default(),
        }
    }

    /// A second connector to the same peer, sharing the logs of this one
    fn share(&self) -> Self {
        Self {
            peer: self.peer.clone(),
            accepted: Arc::clone(&self.accepted),
            received: Arc::clone(&self.received),
        }
    }
}

#[async_trait]
impl Connector for LoopbackConnector {
    async fn connect(&self, _addr: SocketAddr) -> TransportResult<Arc<dyn Channel>> {
        let (near, far) = MemoryChannel::pair();
        let peer = self.peer.clone();
        let accepted = Arc::clone(&self.accepted);
        tokio::spawn(async move {
            if let Ok(handle) = peer.accept(Arc::new(far)).await {
                accepted.lock().unwrap().push(handle);
            }
        });
        Ok(Arc::new(TappedChannel {
            inner: near,
            received: Arc::clone(&self.received),
        }))
    }
}

/// Channel recording every packet it receives
struct TappedChannel {
    inner: MemoryChannel,
    received: PacketLog,
}

#[async_trait]
impl Channel for TappedChannel {
    fn id(&self) -> ChannelId {
        self.inner.id()
    }

    fn remote_addr(&self) -> Option<SocketAddr> {
        self.inner.remote_addr()
    }

    async fn send(&self, packet: &Packet) -> TransportResult<()> {
        self.inner.send(packet).await
    }

    async fn recv(&self) -> TransportResult<Packet> {
        let packet = self.inner.recv().await?;
        self.received.lock().unwrap().push(packet.clone());
        Ok(packet)
    }

    async fn close(&self) -> TransportResult<()> {
        self.inner.close().await
    }

    fn is_closed(&self) -> bool {
        self.inner.is_closed()
    }

    fn stats(&self) -> ChannelStats {
        self.inner.stats()
    }
}

/// Two engines wired together over memory channels
pub struct TwoNodeFixture {
    /// Requesting engine
    pub alpha: Engine,
    /// Answering engine
    pub beta: Engine,
    connector: LoopbackConnector,
    accepted: Arc<Mutex<Vec<TransferHandle>>>,
    received: PacketLog,
    block_size: u32,
    dir: TempDir,
}

impl TwoNodeFixture {
    /// Build both nodes with `block_size` and the default disk openers
    pub fn new(block_size: u32) -> Self {
        Self::build(block_size, None)
    }

    /// Build both nodes, opening beta's files through `files`
    pub fn with_beta_files(block_size: u32, files: Arc<dyn FileOpener>) -> Self {
        Self::build(block_size, Some(files))
    }

    /// Build both nodes, alpha keeping its records on disk so that it can
    /// be restarted with [`TwoNodeFixture::restart_alpha`]
    pub async fn persistent(block_size: u32, beta_files: Arc<dyn FileOpener>) -> Self {
        let mut fixture = Self::build(block_size, Some(beta_files));
        fixture.alpha = fixture.alpha_on_disk().await;
        fixture
    }

    fn build(block_size: u32, beta_files: Option<Arc<dyn FileOpener>>) -> Self {
        let dir = TempDir::new().expect("temp dir");

        let mut beta = Engine::builder(node_config(BETA, &dir, block_size))
            .store(Arc::new(MemoryStore::with_sequence(1_000)));
        if let Some(files) = beta_files {
            beta = beta.file_opener(files);
        }
        let beta = beta.build().expect("beta engine");

        let connector = LoopbackConnector::new(beta.clone());
        let accepted = Arc::clone(&connector.accepted);
        let received = Arc::clone(&connector.received);
        let alpha = Engine::builder(node_config(ALPHA, &dir, block_size))
            .store(Arc::new(MemoryStore::new()))
            .connector(Arc::new(connector.share()))
            .build()
            .expect("alpha engine");

        Self {
            alpha,
            beta,
            connector,
            accepted,
            received,
            block_size,
            dir,
        }
    }

    /// Where alpha keeps its records when persistent
    pub fn alpha_state_dir(&self) -> PathBuf {
        self.dir.path().join(ALPHA).join("state")
    }

    /// Open alpha's on-disk store directly, as another process would
    pub async fn alpha_store(&self) -> Arc<dyn TransferStore> {
        Arc::new(open_store(&self.alpha_state_dir()).await)
    }

    /// Replace alpha with a fresh engine over the same on-disk records, as
    /// after a process restart. The old engine is shut down first.
    pub async fn restart_alpha(&mut self) {
        self.alpha.shutdown(std::time::Duration::from_millis(100)).await;
        self.alpha = self.alpha_on_disk().await;
    }

    async fn alpha_on_disk(&self) -> Engine {
        let store = open_store(&self.alpha_state_dir()).await;
        Engine::builder(node_config(ALPHA, &self.dir, self.block_size))
            .store(Arc::new(store))
            .connector(Arc::new(self.connector.share()))
            .build()
            .expect("alpha engine")
    }

    /// Write `data` as `name` in alpha's outbound directory
    pub fn write_outbound(&self, name: &str, data: &[u8]) -> PathBuf {
        let dir = self.dir.path().join(ALPHA).join("out");
        std::fs::create_dir_all(&dir).expect("out dir");
        let path = dir.join(name);
        std::fs::write(&path, data).expect("write outbound");
        path
    }

    /// Where beta stores an inbound `name`
    pub fn inbound_path(&self, name: &str) -> PathBuf {
        self.dir.path().join(BETA).join("in").join(name)
    }

    /// Beta's key for the transfer alpha knows as `key`
    pub fn receiver_key(&self, key: &TransferKey) -> TransferKey {
        TransferKey::new(BETA, key.requester.clone(), key.requested.clone(), key.special_id)
    }

    /// Handles of every transfer beta accepted so far
    pub fn accepted(&self) -> Vec<TransferHandle> {
        self.accepted.lock().unwrap().clone()
    }

    /// Beta's handle for `key`, waiting for the accept to register it
    pub async fn beta_handle(&self, key: &TransferKey) -> TransferHandle {
        let beta_key = self.receiver_key(key);
        loop {
            let found = self
                .accepted
                .lock()
                .unwrap()
                .iter()
                .rev()
                .find(|handle| handle.key() == &beta_key)
                .cloned();
            if let Some(handle) = found {
                return handle;
            }
            tokio::task::yield_now().await;
        }
    }

    /// Every packet alpha received
    pub fn alpha_received(&self) -> Vec<Packet> {
        self.received.lock().unwrap().clone()
    }

    /// Forget the packets alpha received
    pub fn clear_received(&self) {
        self.received.lock().unwrap().clear();
    }

    /// Apply `limit` to beta
    pub fn limit_beta(&self, limit: Limit) {
        self.beta.update_limit(limit);
    }
}

fn node_config(host: &str, dir: &TempDir, block_size: u32) -> EngineConfig {
    let mut config = EngineConfig::for_host(host);
    config.in_dir = dir.path().join(host).join("in");
    config.out_dir = dir.path().join(host).join("out");
    config.transfer.block_size = block_size;
    config
        .partners
        .insert(BETA.to_string(), "127.0.0.1:6666".parse().expect("addr"));
    config
}

async fn open_store(root: &Path) -> JsonFileStore {
    JsonFileStore::open(root).await.expect("alpha store")
}
