//! BLAKE3 checksums for checked transfer modes.

use std::io;
use std::path::Path;
use tokio::io::{AsyncRead, AsyncReadExt};

const READ_BUFFER_SIZE: usize = 64 * 1024;

/// Hash everything `reader` yields until EOF
pub async fn hash_reader<R>(reader: &mut R) -> io::Result<[u8; 32]>
where
    R: AsyncRead + Unpin + ?Sized,
{
    let mut hasher = blake3::Hasher::new();
    let mut buffer = vec![0u8; READ_BUFFER_SIZE];
    loop {
        let n = reader.read(&mut buffer).await?;
        if n == 0 {
            break;
        }
        hasher.update(&buffer[..n]);
    }
    Ok(*hasher.finalize().as_bytes())
}

/// BLAKE3 digest of a file on disk
pub async fn hash_file(path: impl AsRef<Path>) -> io::Result<[u8; 32]> {
    let mut file = tokio::fs::File::open(path).await?;
    hash_reader(&mut file).await
}

/// Hex encoding used on the wire
#[must_use]
pub fn to_hex(digest: &[u8; 32]) -> String {
    hex::encode(digest)
}

/// Compare a digest against its hex form, ignoring case
#[must_use]
pub fn matches_hex(digest: &[u8; 32], expected: &str) -> bool {
    to_hex(digest).eq_ignore_ascii_case(expected.trim())
}

/// Incremental hasher fed block by block, in rank order
#[derive(Debug, Default, Clone)]
pub struct BlockHasher {
    hasher: blake3::Hasher,
    next_rank: u64,
}

impl BlockHasher {
    /// Create an empty hasher
    pub fn new() -> Self {
        Self::default()
    }

    /// Feed block `rank`.
    ///
    /// Returns `false` and ignores the block if it is not the next one in
    /// sequence.
    pub fn update(&mut self, rank: u64, block: &[u8]) -> bool {
        if rank != self.next_rank {
            return false;
        }
        self.hasher.update(block);
        self.next_rank += 1;
        true
    }

    /// Number of blocks hashed so far
    pub fn blocks(&self) -> u64 {
        self.next_rank
    }

    /// Digest of the blocks fed so far
    pub fn finalize(&self) -> [u8; 32] {
        *self.hasher.finalize().as_bytes()
    }
}
