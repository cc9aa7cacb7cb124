use serde::{Deserialize, Serialize};

use crate::error::LedgerError;
use crate::types::Timestamp;

/// Lifecycle status of a recovery checkpoint.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum CheckpointStatus {
    Active,
    Expired,
    Corrupted,
    /// Used by a restore; a consumed checkpoint cannot be restored again.
    Consumed,
}

/// Snapshot of the chain head, sufficient to truncate back to a known-good
/// state after corruption.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct RecoveryCheckpoint {
    pub checkpoint_id: String,
    /// Free-form kind, e.g. "manual", "pre-restore", "scheduled".
    pub checkpoint_type: String,
    pub description: String,
    pub last_block_number: u64,
    pub last_block_hash: String,
    pub total_blocks: u64,
    /// Total on-chain `data` bytes at snapshot time.
    pub data_size: u64,
    pub created_at: Timestamp,
    pub expires_at: Option<Timestamp>,
    pub status: CheckpointStatus,
}

impl RecoveryCheckpoint {
    /// Build a checkpoint, rejecting blank identifiers up front.
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        checkpoint_id: &str,
        checkpoint_type: &str,
        description: &str,
        last_block_number: u64,
        last_block_hash: &str,
        total_blocks: u64,
        data_size: u64,
        created_at: Timestamp,
    ) -> Result<Self, LedgerError> {
        if checkpoint_id.trim().is_empty() {
            return Err(LedgerError::InvalidInput(
                "checkpoint_id must not be empty".into(),
            ));
        }
        if checkpoint_type.trim().is_empty() {
            return Err(LedgerError::InvalidInput(
                "checkpoint_type must not be empty".into(),
            ));
        }
        Ok(Self {
            checkpoint_id: checkpoint_id.to_string(),
            checkpoint_type: checkpoint_type.to_string(),
            description: description.to_string(),
            last_block_number,
            last_block_hash: last_block_hash.to_string(),
            total_blocks,
            data_size,
            created_at,
            expires_at: None,
            status: CheckpointStatus::Active,
        })
    }

    pub fn set_expiration(&mut self, expires_at: Timestamp) {
        self.expires_at = Some(expires_at);
    }

    pub fn is_expired(&self, now: Timestamp) -> bool {
        matches!(self.status, CheckpointStatus::Expired)
            || self.expires_at.is_some_and(|exp| now >= exp)
    }

    /// Restorable: active and not past its expiration.
    pub fn is_valid(&self, now: Timestamp) -> bool {
        self.status == CheckpointStatus::Active && !self.is_expired(now)
    }

    /// Age in whole hours; clamped to zero for clock skew.
    pub fn age_hours(&self, now: Timestamp) -> u64 {
        let secs = (now - self.created_at).num_seconds().max(0);
        secs as u64 / 3600
    }
}
