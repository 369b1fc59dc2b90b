//! # FERRY Files
//!
//! File access for the FERRY transfer engine.
//!
//! This crate provides:
//! - Block-addressed file access with durable commits
//! - BLAKE3 whole-file checksums for checked transfer modes

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod block;
pub mod hasher;

pub use block::{BlockFile, DiskBlockFile};
pub use hasher::{BlockHasher, hash_file};

/// Default block size (64 KiB)
pub const DEFAULT_BLOCK_SIZE: usize = 64 * 1024;

/// Number of blocks needed to hold `file_size` bytes
#[must_use]
pub fn block_count(file_size: u64, block_size: usize) -> u64 {
    file_size.div_ceil(block_size as u64)
}
