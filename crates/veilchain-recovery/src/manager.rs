use std::sync::Arc;

use chrono::Utc;
use tracing::{info, warn};

use veilchain_chain::ChainEngine;
use veilchain_core::{
    truncate_to_micros, CheckpointStatus, LedgerError, RecoveryCheckpoint, Timestamp,
};
use veilchain_storage::BlockDao;

/// Creates, expires, and restores chain checkpoints.
pub struct CheckpointManager {
    engine: Arc<ChainEngine>,
}

/// What a restore actually did.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct RestoreOutcome {
    pub restored_to_block: u64,
    pub removed_blocks: u64,
}

impl CheckpointManager {
    pub fn new(engine: Arc<ChainEngine>) -> Self {
        Self { engine }
    }

    /// Snapshot the current chain head.
    pub fn create_checkpoint(
        &self,
        checkpoint_type: &str,
        description: &str,
    ) -> Result<RecoveryCheckpoint, LedgerError> {
        let dao = self.engine.dao();
        let last = dao
            .get_last_block()?
            .ok_or_else(|| LedgerError::NotFound("cannot checkpoint an empty chain".into()))?;
        let total_blocks = dao.get_block_count()?;

        // Total on-chain data size, paginated like every other full pass.
        let mut data_size = 0u64;
        let mut offset = 0u64;
        loop {
            let page = dao.get_blocks_paginated(offset, 256)?;
            if page.is_empty() {
                break;
            }
            offset += page.len() as u64;
            data_size += page.iter().map(|b| b.data.len() as u64).sum::<u64>();
        }

        let created_at = truncate_to_micros(Utc::now());
        let checkpoint_id = format!(
            "cp-{}-{}",
            last.block_number,
            created_at.timestamp_micros()
        );
        let checkpoint = RecoveryCheckpoint::new(
            &checkpoint_id,
            checkpoint_type,
            description,
            last.block_number,
            &last.hash,
            total_blocks,
            data_size,
            created_at,
        )?;
        dao.put_checkpoint(&checkpoint)?;
        info!(
            checkpoint_id = %checkpoint.checkpoint_id,
            last_block = last.block_number,
            "checkpoint created"
        );
        Ok(checkpoint)
    }

    pub fn get(&self, checkpoint_id: &str) -> Result<Option<RecoveryCheckpoint>, LedgerError> {
        self.engine.dao().get_checkpoint(checkpoint_id)
    }

    pub fn list(&self) -> Result<Vec<RecoveryCheckpoint>, LedgerError> {
        let mut list = self.engine.dao().list_checkpoints()?;
        list.sort_by_key(|c| c.created_at);
        Ok(list)
    }

    pub fn set_expiration(
        &self,
        checkpoint_id: &str,
        expires_at: Timestamp,
    ) -> Result<(), LedgerError> {
        let mut cp = self.require(checkpoint_id)?;
        cp.set_expiration(expires_at);
        self.engine.dao().put_checkpoint(&cp)
    }

    pub fn update_status(
        &self,
        checkpoint_id: &str,
        status: CheckpointStatus,
    ) -> Result<(), LedgerError> {
        let mut cp = self.require(checkpoint_id)?;
        cp.status = status;
        self.engine.dao().put_checkpoint(&cp)
    }

    /// Truncate the chain back to a checkpoint. The checkpoint must be
    /// valid, its anchor block must still carry the recorded hash, and a
    /// successful restore consumes it.
    pub fn restore(&self, checkpoint_id: &str) -> Result<RestoreOutcome, LedgerError> {
        let mut cp = self.require(checkpoint_id)?;
        let now = Utc::now();
        if !cp.is_valid(now) {
            return Err(LedgerError::InvalidInput(format!(
                "checkpoint {checkpoint_id} is not restorable (status {:?}, expired: {})",
                cp.status,
                cp.is_expired(now)
            )));
        }

        let anchor = self.engine.dao().get_block(cp.last_block_number)?;
        match anchor {
            Some(block) if block.hash == cp.last_block_hash => {}
            _ => {
                warn!(checkpoint_id, "checkpoint anchor mismatch; marking corrupted");
                cp.status = CheckpointStatus::Corrupted;
                self.engine.dao().put_checkpoint(&cp)?;
                return Err(LedgerError::IntegrityFailed(format!(
                    "checkpoint {checkpoint_id} does not match the chain at block {}",
                    cp.last_block_number
                )));
            }
        }

        let removed = self.engine.restore_truncate(cp.last_block_number)?;
        cp.status = CheckpointStatus::Consumed;
        self.engine.dao().put_checkpoint(&cp)?;
        info!(checkpoint_id, removed, "chain restored from checkpoint");
        Ok(RestoreOutcome {
            restored_to_block: cp.last_block_number,
            removed_blocks: removed,
        })
    }

    fn require(&self, checkpoint_id: &str) -> Result<RecoveryCheckpoint, LedgerError> {
        self.engine
            .dao()
            .get_checkpoint(checkpoint_id)?
            .ok_or_else(|| LedgerError::NotFound(format!("checkpoint {checkpoint_id}")))
    }
}
