//! Disk fault injection
//!
//! Wraps the disk opener so tests can fail one block write and observe
//! exactly which blocks were written.

use async_trait::async_trait;
use ferry_core::{DiskFileOpener, FileOpener, TransferRecord};
use ferry_files::BlockFile;
use std::io;
use std::path::Path;
use std::sync::{Arc, Mutex};

/// Shared fault plan and write log
#[derive(Debug, Default)]
pub struct FaultState {
    fail_write_at: Mutex<Option<u64>>,
    written: Mutex<Vec<u64>>,
}

impl FaultState {
    /// Fail the next write of block `rank`, once
    pub fn fail_next_write_at(&self, rank: u64) {
        *self.fail_write_at.lock().unwrap() = Some(rank);
    }

    /// Ranks written successfully, in order
    pub fn written(&self) -> Vec<u64> {
        self.written.lock().unwrap().clone()
    }

    /// Forget the write log
    pub fn clear_written(&self) {
        self.written.lock().unwrap().clear();
    }

    fn should_fail(&self, rank: u64) -> bool {
        let mut plan = self.fail_write_at.lock().unwrap();
        if *plan == Some(rank) {
            *plan = None;
            return true;
        }
        false
    }
}

/// Disk opener with injectable write failures
#[derive(Debug, Default)]
pub struct FaultyFileOpener {
    state: Arc<FaultState>,
}

impl FaultyFileOpener {
    /// Create an opener with no planned faults
    pub fn new() -> Self {
        Self::default()
    }

    /// The fault plan and write log
    pub fn state(&self) -> &Arc<FaultState> {
        &self.state
    }
}

#[async_trait]
impl FileOpener for FaultyFileOpener {
    async fn open(&self, record: &TransferRecord) -> io::Result<Box<dyn BlockFile>> {
        let inner = DiskFileOpener.open(record).await?;
        Ok(Box::new(FaultyBlockFile {
            inner,
            state: Arc::clone(&self.state),
        }))
    }
}

struct FaultyBlockFile {
    inner: Box<dyn BlockFile>,
    state: Arc<FaultState>,
}

#[async_trait]
impl BlockFile for FaultyBlockFile {
    fn block_size(&self) -> usize {
        self.inner.block_size()
    }

    fn path(&self) -> Option<&Path> {
        self.inner.path()
    }

    async fn read_block(&mut self, rank: u64) -> io::Result<Vec<u8>> {
        self.inner.read_block(rank).await
    }

    async fn write_block(&mut self, rank: u64, data: &[u8]) -> io::Result<()> {
        if self.state.should_fail(rank) {
            return Err(io::Error::other(format!("injected disk failure at block {rank}")));
        }
        self.inner.write_block(rank, data).await?;
        self.state.written.lock().unwrap().push(rank);
        Ok(())
    }

    async fn truncate_to(&mut self, rank: u64) -> io::Result<()> {
        self.inner.truncate_to(rank).await
    }

    async fn len(&mut self) -> io::Result<u64> {
        self.inner.len().await
    }

    async fn digest(&mut self) -> io::Result<[u8; 32]> {
        self.inner.digest().await
    }

    async fn finish(&mut self) -> io::Result<()> {
        self.inner.finish().await
    }
}
