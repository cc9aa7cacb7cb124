use std::time::Instant;

use tracing::info;

use veilchain_chain::ChainEngine;
use veilchain_core::{CancelToken, LedgerError};
use veilchain_storage::BlockDao;

use crate::report::{CheckStatus, IntegrityCheckResult, OffChainIntegrityReport};

const SWEEP_PAGE: usize = 128;

/// Verify every off-chain blob referenced by the chain, filling `report`.
///
/// Cancellation is observed between pages; a cancelled sweep returns
/// `Cancelled` and leaves the partial report intact.
pub fn run_integrity_sweep(
    engine: &ChainEngine,
    report: &OffChainIntegrityReport,
    cancel: &CancelToken,
) -> Result<(), LedgerError> {
    let dao = engine.dao();
    let mut offset = 0u64;
    loop {
        if cancel.is_cancelled() {
            return Err(LedgerError::Cancelled);
        }
        let page = dao.get_blocks_with_off_chain_data_paginated(offset, SWEEP_PAGE)?;
        if page.is_empty() {
            break;
        }
        offset += page.len() as u64;

        for block in &page {
            let Some(reference) = &block.off_chain_ref else { continue };
            let started = Instant::now();
            let verification = engine.blobs().verify(reference, &block.signer_public_key);
            let duration = started.elapsed();

            let (status, details) = if verification.is_ok() {
                (CheckStatus::Healthy, String::new())
            } else if verification.file_missing {
                (CheckStatus::Critical, "blob file missing".to_string())
            } else if verification.hash_mismatch || verification.signature_invalid {
                (CheckStatus::Critical, format!("{verification:?}"))
            } else {
                (CheckStatus::Degraded, format!("{verification:?}"))
            };

            let mut result = IntegrityCheckResult::new(
                &reference.file_id,
                "off-chain-verify",
                status,
                &details,
                duration,
                reference.size,
            )?;
            result.add_metadata("block_number", &block.block_number.to_string())?;
            report.add_result(result)?;
        }
    }
    let stats = report.statistics();
    info!(
        checks = stats.total_checks,
        healthy = stats.healthy_checks,
        "off-chain integrity sweep finished"
    );
    Ok(())
}
