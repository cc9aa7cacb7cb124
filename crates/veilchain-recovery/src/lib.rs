//! veilchain-recovery
//!
//! Chain snapshots and off-chain health. Checkpoints capture the chain
//! head so a corrupted tail can be truncated back to a known-good state;
//! integrity reports aggregate per-blob verification results with hard
//! resource caps and deterministic operator recommendations.

pub mod integrity;
pub mod manager;
pub mod report;

pub use integrity::run_integrity_sweep;
pub use manager::CheckpointManager;
pub use report::{CheckStatus, IntegrityCheckResult, OffChainIntegrityReport, ReportStatistics};
