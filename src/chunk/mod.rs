//! Chunked Transfers
//!
//! Large files arrive as numbered chunks belonging to a named transfer. The
//! [`ChunkAssembler`] stages each chunk in a private slot, tracks
//! completeness and, once every index has arrived, publishes the
//! concatenation through the storage facade in one atomic step.
//!
//! ```text
//! Open ──► Assembling ──► Finalizing ──► Done
//!              │                └──────► Aborted
//!              └──(idle)──────────────► Expired
//! ```

mod assembler;

pub use assembler::{ChunkAssembler, ChunkConfig};

use crate::domain::path::NamespacePath;
use crate::domain::ports::FileInfo;
use crate::error::{Error, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

// =============================================================================
// Chunk Descriptor
// =============================================================================

/// Position of one chunk inside a transfer
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChunkDescriptor {
    /// Opaque id, client- or server-generated
    pub transfer_id: String,
    /// 0-based chunk index
    pub index: u32,
    /// Declared number of chunks
    pub total: u32,
}

impl ChunkDescriptor {
    pub fn new(transfer_id: impl Into<String>, index: u32, total: u32) -> Self {
        Self {
            transfer_id: transfer_id.into(),
            index,
            total,
        }
    }

    /// A non-chunked upload: a single-chunk set under a generated id
    pub fn whole_file() -> Self {
        Self::new(uuid::Uuid::new_v4().simple().to_string(), 0, 1)
    }

    /// Check the descriptor against the configured chunk limit
    pub fn validate(&self, max_chunks: u32) -> Result<()> {
        if self.transfer_id.is_empty() {
            return Err(Error::BadInputData("transfer id must not be empty".into()));
        }
        if self.total == 0 {
            return Err(Error::BadInputData("chunk total must be at least 1".into()));
        }
        if self.index >= self.total {
            return Err(Error::BadInputData(format!(
                "chunk index {} out of range for total {}",
                self.index, self.total
            )));
        }
        if max_chunks > 0 && self.total > max_chunks {
            return Err(Error::BadInputData(format!(
                "chunk total {} exceeds the limit of {}",
                self.total, max_chunks
            )));
        }
        Ok(())
    }
}

// =============================================================================
// Transfer State
// =============================================================================

/// Lifecycle of a chunk set
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TransferState {
    Open,
    Assembling,
    Finalizing,
    Done,
    Aborted,
    Expired,
}

impl TransferState {
    /// Terminal sets accept no more chunks
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            TransferState::Done | TransferState::Aborted | TransferState::Expired
        )
    }
}

/// Result of delivering one chunk
#[derive(Debug, Clone, PartialEq)]
pub enum ChunkOutcome {
    /// The set is still missing chunks
    Pending { received: u32, total: u32 },
    /// This chunk completed the set and the file is published
    Completed(FileInfo),
}

/// Snapshot of an in-flight transfer for resuming clients
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TransferStatus {
    pub transfer_id: String,
    pub path: NamespacePath,
    pub total: u32,
    /// Indexes already staged, ascending
    pub received: Vec<u32>,
    pub state: TransferState,
    pub created_at: DateTime<Utc>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorCode;

    #[test]
    fn test_descriptor_validation() {
        assert!(ChunkDescriptor::new("t", 0, 3).validate(0).is_ok());
        assert!(ChunkDescriptor::new("t", 2, 3).validate(3).is_ok());

        for bad in [
            ChunkDescriptor::new("", 0, 1),
            ChunkDescriptor::new("t", 0, 0),
            ChunkDescriptor::new("t", 3, 3),
            ChunkDescriptor::new("t", 0, 11),
        ] {
            assert_eq!(bad.validate(10).unwrap_err().code(), ErrorCode::BadInputData);
        }
    }

    #[test]
    fn test_whole_file_descriptor() {
        let a = ChunkDescriptor::whole_file();
        let b = ChunkDescriptor::whole_file();
        assert_eq!((a.index, a.total), (0, 1));
        assert_ne!(a.transfer_id, b.transfer_id);
    }

    #[test]
    fn test_terminal_states() {
        assert!(!TransferState::Assembling.is_terminal());
        assert!(!TransferState::Finalizing.is_terminal());
        assert!(TransferState::Expired.is_terminal());
    }
}
