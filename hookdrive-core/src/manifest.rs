//! Manifest types and range math.

use crate::storage::RemoteObject;
use crate::{DriveError, Result};
use serde::{Deserialize, Serialize};

/// Hard ceiling imposed by the attachment host.
pub const MAX_CHUNK_SIZE: usize = 25 * 1024 * 1024;

pub const DEFAULT_CHUNK_SIZE: usize = 24 * 1024 * 1024;

/// One stored attachment.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChunkRef {
    /// Endpoint the chunk was uploaded through; downloads never rotate.
    pub endpoint: String,
    pub remote: RemoteObject,
    pub size: u64,
    pub sha256: String,
}

/// Ordered chunk list that reconstructs one file.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Manifest {
    pub chunks: Vec<ChunkRef>,
    pub size: u64,
    pub chunk_size: u64,
}

/// The part of one chunk that falls inside a requested byte window.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChunkSpan {
    pub index: usize,
    pub start_in_chunk: u64,
    pub len: u64,
}

impl Manifest {
    pub fn new(chunks: Vec<ChunkRef>, chunk_size: u64) -> Self {
        let size = chunks.iter().map(|chunk| chunk.size).sum();
        Self {
            chunks,
            size,
            chunk_size,
        }
    }

    pub fn empty(chunk_size: u64) -> Self {
        Self::new(Vec::new(), chunk_size)
    }

    pub fn chunk_count(&self) -> usize {
        self.chunks.len()
    }

    /// Number of bytes a read of `length` at `offset` returns.
    pub fn clip(&self, offset: u64, length: u64) -> u64 {
        length.min(self.size.saturating_sub(offset))
    }

    /// Chunks overlapping `[offset, offset + length)`, each with the slice of
    /// it that belongs to the window. Empty when the window lies past the end.
    pub fn spans(&self, offset: u64, length: u64) -> Vec<ChunkSpan> {
        let wanted = self.clip(offset, length);
        if wanted == 0 {
            return Vec::new();
        }
        let end = offset + wanted;

        let mut spans = Vec::new();
        let mut chunk_start = 0u64;
        for (index, chunk) in self.chunks.iter().enumerate() {
            let chunk_end = chunk_start + chunk.size;
            if chunk_end > offset && chunk_start < end {
                let start_in_chunk = offset.saturating_sub(chunk_start);
                let stop_in_chunk = end.min(chunk_end) - chunk_start;
                spans.push(ChunkSpan {
                    index,
                    start_in_chunk,
                    len: stop_in_chunk - start_in_chunk,
                });
            }
            if chunk_end >= end {
                break;
            }
            chunk_start = chunk_end;
        }
        spans
    }

    /// Checks the structural invariants a committed manifest must hold.
    pub fn validate(&self) -> Result<()> {
        let total: u64 = self.chunks.iter().map(|chunk| chunk.size).sum();
        if total != self.size {
            return Err(DriveError::Internal(format!(
                "manifest size {} does not match chunk total {}",
                self.size, total
            )));
        }

        let expected = expected_chunk_count(self.size, self.chunk_size);
        if self.chunks.len() != expected {
            return Err(DriveError::Internal(format!(
                "manifest has {} chunks, expected {} for size {} and chunk size {}",
                self.chunks.len(),
                expected,
                self.size,
                self.chunk_size
            )));
        }
        Ok(())
    }
}

pub fn expected_chunk_count(size: u64, chunk_size: u64) -> usize {
    if size == 0 {
        return 0;
    }
    size.div_ceil(chunk_size.max(1)) as usize
}

/// Validates a configured chunk size. Signed input so that negative values
/// coming from configuration are rejected rather than wrapped.
pub fn validate_chunk_size(chunk_size: i64) -> Result<usize> {
    if chunk_size <= 0 || chunk_size > MAX_CHUNK_SIZE as i64 {
        return Err(DriveError::Config(format!(
            "invalid chunk size {}: must be between 1 and {} bytes",
            chunk_size, MAX_CHUNK_SIZE
        )));
    }
    Ok(chunk_size as usize)
}
