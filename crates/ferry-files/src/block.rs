//! Block-addressed file access.
//!
//! A transfer moves a file as a sequence of fixed-size blocks. Block `rank`
//! covers bytes `rank * block_size .. (rank + 1) * block_size`; only the last
//! block may be short.

use async_trait::async_trait;
use std::io;
use std::path::{Path, PathBuf};
use tokio::fs::{File, OpenOptions};
use tokio::io::{AsyncReadExt, AsyncSeekExt, AsyncWriteExt, SeekFrom};

/// File accessed block by block.
///
/// Writers must make a block durable before `write_block` returns: the
/// transfer engine counts a block as committed as soon as the call succeeds.
#[async_trait]
pub trait BlockFile: Send {
    /// Block size in bytes
    fn block_size(&self) -> usize;

    /// Path on disk, if the file has one
    fn path(&self) -> Option<&Path> {
        None
    }

    /// Read block `rank`.
    ///
    /// Returns an empty buffer when `rank` lies past the end of the file.
    async fn read_block(&mut self, rank: u64) -> io::Result<Vec<u8>>;

    /// Write block `rank` and flush it to stable storage
    async fn write_block(&mut self, rank: u64, data: &[u8]) -> io::Result<()>;

    /// Discard everything from block `rank` onwards
    async fn truncate_to(&mut self, rank: u64) -> io::Result<()>;

    /// Current file length in bytes
    async fn len(&mut self) -> io::Result<u64>;

    /// BLAKE3 digest of the whole file content
    async fn digest(&mut self) -> io::Result<[u8; 32]>;

    /// Flush metadata and release the file
    async fn finish(&mut self) -> io::Result<()>;
}

/// `BlockFile` backed by a file on disk
#[derive(Debug)]
pub struct DiskBlockFile {
    path: PathBuf,
    file: File,
    block_size: usize,
}

impl DiskBlockFile {
    /// Open an existing file for reading
    pub async fn open_read(path: impl AsRef<Path>, block_size: usize) -> io::Result<Self> {
        check_block_size(block_size)?;
        let path = path.as_ref().to_path_buf();
        let file = File::open(&path).await?;
        Ok(Self {
            path,
            file,
            block_size,
        })
    }

    /// Open a file for writing, creating it and its parent directories.
    ///
    /// Existing content is kept so an interrupted transfer can resume.
    pub async fn open_write(path: impl AsRef<Path>, block_size: usize) -> io::Result<Self> {
        check_block_size(block_size)?;
        let path = path.as_ref().to_path_buf();
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            tokio::fs::create_dir_all(parent).await?;
        }
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(&path)
            .await?;

        tracing::debug!("Opened {} for writing", path.display());
        Ok(Self {
            path,
            file,
            block_size,
        })
    }

    fn offset(&self, rank: u64) -> io::Result<u64> {
        rank.checked_mul(self.block_size as u64).ok_or_else(|| {
            io::Error::new(
                io::ErrorKind::InvalidInput,
                format!("block {rank} out of addressable range"),
            )
        })
    }
}

fn check_block_size(block_size: usize) -> io::Result<()> {
    if block_size == 0 {
        return Err(io::Error::new(
            io::ErrorKind::InvalidInput,
            "block size must be positive",
        ));
    }
    Ok(())
}

#[async_trait]
impl BlockFile for DiskBlockFile {
    fn block_size(&self) -> usize {
        self.block_size
    }

    fn path(&self) -> Option<&Path> {
        Some(&self.path)
    }

    async fn read_block(&mut self, rank: u64) -> io::Result<Vec<u8>> {
        let offset = self.offset(rank)?;
        self.file.seek(SeekFrom::Start(offset)).await?;

        let mut buffer = vec![0u8; self.block_size];
        let mut filled = 0;
        while filled < buffer.len() {
            let n = self.file.read(&mut buffer[filled..]).await?;
            if n == 0 {
                break;
            }
            filled += n;
        }
        buffer.truncate(filled);
        Ok(buffer)
    }

    async fn write_block(&mut self, rank: u64, data: &[u8]) -> io::Result<()> {
        if data.len() > self.block_size {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                format!(
                    "block of {} bytes exceeds block size {}",
                    data.len(),
                    self.block_size
                ),
            ));
        }
        let offset = self.offset(rank)?;
        self.file.seek(SeekFrom::Start(offset)).await?;
        self.file.write_all(data).await?;
        self.file.sync_data().await
    }

    async fn truncate_to(&mut self, rank: u64) -> io::Result<()> {
        let offset = self.offset(rank)?;
        let len = self.file.metadata().await?.len();
        if len > offset {
            tracing::debug!(
                "Truncating {} from {} to {} bytes",
                self.path.display(),
                len,
                offset
            );
            self.file.set_len(offset).await?;
            self.file.sync_data().await?;
        }
        Ok(())
    }

    async fn len(&mut self) -> io::Result<u64> {
        Ok(self.file.metadata().await?.len())
    }

    async fn digest(&mut self) -> io::Result<[u8; 32]> {
        self.file.seek(SeekFrom::Start(0)).await?;
        crate::hasher::hash_reader(&mut self.file).await
    }

    async fn finish(&mut self) -> io::Result<()> {
        self.file.flush().await?;
        self.file.sync_all().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[tokio::test]
    async fn test_read_blocks() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("source.bin");
        let data: Vec<u8> = (0..10_000u32).map(|i| (i % 251) as u8).collect();
        tokio::fs::write(&path, &data).await.unwrap();

        let mut file = DiskBlockFile::open_read(&path, 4096).await.unwrap();
        assert_eq!(file.len().await.unwrap(), 10_000);

        assert_eq!(file.read_block(0).await.unwrap(), &data[..4096]);
        assert_eq!(file.read_block(2).await.unwrap(), &data[8192..]);
        assert!(file.read_block(3).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_write_blocks_out_of_order() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("nested/dest.bin");

        let mut file = DiskBlockFile::open_write(&path, 4).await.unwrap();
        file.write_block(1, b"efgh").await.unwrap();
        file.write_block(0, b"abcd").await.unwrap();
        file.write_block(2, b"ij").await.unwrap();
        file.finish().await.unwrap();

        assert_eq!(tokio::fs::read(&path).await.unwrap(), b"abcdefghij");
    }

    #[tokio::test]
    async fn test_write_rejects_oversized_block() {
        let dir = TempDir::new().unwrap();
        let mut file = DiskBlockFile::open_write(dir.path().join("x"), 4)
            .await
            .unwrap();
        let err = file.write_block(0, b"too long").await.unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::InvalidInput);
    }

    #[tokio::test]
    async fn test_open_write_keeps_existing_content() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("partial.bin");
        tokio::fs::write(&path, b"abcdefgh").await.unwrap();

        let mut file = DiskBlockFile::open_write(&path, 4).await.unwrap();
        assert_eq!(file.len().await.unwrap(), 8);
        assert_eq!(file.read_block(1).await.unwrap(), b"efgh");
    }

    #[tokio::test]
    async fn test_truncate_to_rank() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("resume.bin");
        tokio::fs::write(&path, b"abcdefghij").await.unwrap();

        let mut file = DiskBlockFile::open_write(&path, 4).await.unwrap();
        file.truncate_to(1).await.unwrap();
        assert_eq!(file.len().await.unwrap(), 4);

        // Truncating past the end leaves the file alone
        file.truncate_to(5).await.unwrap();
        assert_eq!(file.len().await.unwrap(), 4);
    }

    #[tokio::test]
    async fn test_digest_matches_content() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("hashed.bin");
        tokio::fs::write(&path, b"ferry digest").await.unwrap();

        let mut file = DiskBlockFile::open_read(&path, 4).await.unwrap();
        let _ = file.read_block(2).await.unwrap();
        assert_eq!(
            file.digest().await.unwrap(),
            *blake3::hash(b"ferry digest").as_bytes()
        );
    }

    #[tokio::test]
    async fn test_zero_block_size_rejected() {
        let dir = TempDir::new().unwrap();
        let err = DiskBlockFile::open_write(dir.path().join("z"), 0)
            .await
            .unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::InvalidInput);
    }
}
