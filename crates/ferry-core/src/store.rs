//! Transfer record storage
//!
//! The engine needs a keyed store with upsert semantics and an atomic
//! special id allocator. Two implementations are provided:
//! - [`MemoryStore`]: process-local, for loopback use and tests
//! - [`JsonFileStore`]: one JSON document per record in a state directory

use crate::error::{Result, TransferError};
use crate::record::{TransferKey, TransferRecord, UpdatedInfo};
use async_trait::async_trait;
use dashmap::DashMap;
use fs2::FileExt;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use tokio::fs;
use tokio::sync::Mutex;

/// Allocation attempts before giving up with a storage error
pub const MAX_ALLOCATION_ATTEMPTS: u32 = 5;

const ALLOCATION_BACKOFF: Duration = Duration::from_millis(20);

const SEQUENCE_FILE: &str = "sequence";
const LOCK_FILE: &str = "sequence.lock";

/// Keyed record store
#[async_trait]
pub trait TransferStore: Send + Sync {
    /// Fetch a record
    async fn get(&self, key: &TransferKey) -> Result<Option<TransferRecord>>;

    /// Insert or replace a record
    async fn put(&self, record: &TransferRecord) -> Result<()>;

    /// Allocate a special id never returned before
    async fn allocate_special_id(&self) -> Result<u64>;

    /// All records, optionally only those in one lifecycle state
    async fn list(&self, filter: Option<UpdatedInfo>) -> Result<Vec<TransferRecord>>;
}

/// In-memory store
#[derive(Debug, Default)]
pub struct MemoryStore {
    records: DashMap<TransferKey, TransferRecord>,
    sequence: AtomicU64,
}

impl MemoryStore {
    /// Create an empty store
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a store whose first allocated id is `first + 1`
    pub fn with_sequence(first: u64) -> Self {
        Self {
            records: DashMap::new(),
            sequence: AtomicU64::new(first),
        }
    }

    /// Number of stored records
    pub fn len(&self) -> usize {
        self.records.len()
    }

    /// Whether the store is empty
    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }
}

#[async_trait]
impl TransferStore for MemoryStore {
    async fn get(&self, key: &TransferKey) -> Result<Option<TransferRecord>> {
        Ok(self.records.get(key).map(|r| r.value().clone()))
    }

    async fn put(&self, record: &TransferRecord) -> Result<()> {
        self.records.insert(record.key.clone(), record.clone());
        Ok(())
    }

    async fn allocate_special_id(&self) -> Result<u64> {
        loop {
            let current = self.sequence.load(Ordering::Acquire);
            let next = current
                .checked_add(1)
                .ok_or(TransferError::storage("special id sequence exhausted"))?;
            // Lost the race: reread and retry the whole allocation
            if self
                .sequence
                .compare_exchange(current, next, Ordering::AcqRel, Ordering::Acquire)
                .is_ok()
            {
                return Ok(next);
            }
        }
    }

    async fn list(&self, filter: Option<UpdatedInfo>) -> Result<Vec<TransferRecord>> {
        let mut records: Vec<TransferRecord> = self
            .records
            .iter()
            .filter(|r| filter.is_none_or(|info| r.updated_info == info))
            .map(|r| r.value().clone())
            .collect();
        records.sort_by(|a, b| a.key.cmp(&b.key));
        Ok(records)
    }
}

/// File-backed store: `records/<key>.json` plus a `sequence` file
#[derive(Debug)]
pub struct JsonFileStore {
    root: PathBuf,
    sequence_lock: Mutex<()>,
}

impl JsonFileStore {
    /// Open (creating if needed) a store rooted at `root`
    pub async fn open(root: impl Into<PathBuf>) -> Result<Self> {
        let root = root.into();
        fs::create_dir_all(root.join("records")).await?;
        tracing::debug!("Opened transfer store at {}", root.display());
        Ok(Self {
            root,
            sequence_lock: Mutex::new(()),
        })
    }

    /// Store root directory
    pub fn root(&self) -> &Path {
        &self.root
    }

    fn record_path(&self, key: &TransferKey) -> PathBuf {
        self.root
            .join("records")
            .join(format!("{}.json", key.file_stem()))
    }

    /// One read-increment-write cycle under an exclusive lock on the
    /// sequence lock file. The lock is held by the open file, so the OS
    /// releases it when a crashed process goes away.
    async fn try_allocate(&self) -> io::Result<u64> {
        let sequence = self.root.join(SEQUENCE_FILE);
        let lock = self.root.join(LOCK_FILE);
        tokio::task::spawn_blocking(move || allocate_locked(&sequence, &lock))
            .await
            .map_err(io::Error::other)?
    }
}

fn allocate_locked(sequence: &Path, lock: &Path) -> io::Result<u64> {
    let lock_file = std::fs::OpenOptions::new()
        .create(true)
        .truncate(false)
        .write(true)
        .open(lock)?;
    FileExt::lock_exclusive(&lock_file)?;

    let result = bump_sequence(sequence);

    if let Err(e) = FileExt::unlock(&lock_file) {
        tracing::warn!("Failed to release sequence lock {}: {}", lock.display(), e);
    }
    result
}

fn bump_sequence(sequence: &Path) -> io::Result<u64> {
    let current: u64 = match std::fs::read_to_string(sequence) {
        Ok(text) => text
            .trim()
            .parse()
            .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?,
        Err(e) if e.kind() == io::ErrorKind::NotFound => 0,
        Err(e) => return Err(e),
    };
    let next = current.checked_add(1).ok_or_else(|| {
        io::Error::new(io::ErrorKind::InvalidData, "special id sequence exhausted")
    })?;
    let tmp = sequence.with_extension("tmp");
    std::fs::write(&tmp, next.to_string())?;
    std::fs::rename(&tmp, sequence)?;
    Ok(next)
}

/// Write to a temporary sibling, then rename over `path`
async fn write_atomic(path: &Path, contents: &[u8]) -> io::Result<()> {
    let tmp = path.with_extension("tmp");
    fs::write(&tmp, contents).await?;
    fs::rename(&tmp, path).await
}

#[async_trait]
impl TransferStore for JsonFileStore {
    async fn get(&self, key: &TransferKey) -> Result<Option<TransferRecord>> {
        match fs::read_to_string(self.record_path(key)).await {
            Ok(json) => Ok(Some(serde_json::from_str(&json)?)),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    async fn put(&self, record: &TransferRecord) -> Result<()> {
        let json = serde_json::to_string_pretty(record)?;
        write_atomic(&self.record_path(&record.key), json.as_bytes()).await?;
        Ok(())
    }

    async fn allocate_special_id(&self) -> Result<u64> {
        let _guard = self.sequence_lock.lock().await;

        for attempt in 1..=MAX_ALLOCATION_ATTEMPTS {
            match self.try_allocate().await {
                Ok(id) => return Ok(id),
                Err(e) => {
                    tracing::warn!(
                        "Special id allocation attempt {}/{} failed: {}",
                        attempt,
                        MAX_ALLOCATION_ATTEMPTS,
                        e
                    );
                    tokio::time::sleep(ALLOCATION_BACKOFF * attempt).await;
                }
            }
        }
        Err(TransferError::storage("special id allocation failed"))
    }

    async fn list(&self, filter: Option<UpdatedInfo>) -> Result<Vec<TransferRecord>> {
        let mut records = Vec::new();
        let mut entries = fs::read_dir(self.root.join("records")).await?;

        while let Some(entry) = entries.next_entry().await? {
            let path = entry.path();
            if path.extension().and_then(|s| s.to_str()) != Some("json") {
                continue;
            }
            let json = match fs::read_to_string(&path).await {
                Ok(json) => json,
                Err(e) => {
                    tracing::warn!("Skipping unreadable record {}: {}", path.display(), e);
                    continue;
                }
            };
            match serde_json::from_str::<TransferRecord>(&json) {
                Ok(record) if filter.is_none_or(|info| record.updated_info == info) => {
                    records.push(record)
                }
                Ok(_) => {}
                Err(e) => tracing::warn!("Skipping corrupt record {}: {}", path.display(), e),
            }
        }

        records.sort_by(|a, b| a.key.cmp(&b.key));
        Ok(records)
    }
}
