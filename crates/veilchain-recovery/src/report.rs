//! Thread-safe off-chain integrity reports.
//!
//! Reports are append-only while a sweep runs and are read through
//! snapshot accessors; statistics live in overflow-guarded atomics so
//! concurrent checkers never contend on the result list lock.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;
use std::time::Duration;

use chrono::Utc;

use veilchain_core::constants::{
    MAX_CHECK_DURATION_MS, MAX_DATA_ID_LEN, MAX_DETAILS_LEN, MAX_REPORT_ID_LEN,
    MAX_REPORT_RESULTS, MAX_RESULT_METADATA_ENTRIES,
};
use veilchain_core::{LedgerError, Timestamp};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CheckStatus {
    Healthy,
    Degraded,
    Critical,
    Unknown,
}

/// One verified blob. Construction validates every field cap so a hostile
/// or buggy checker cannot balloon the report.
#[derive(Clone, Debug)]
pub struct IntegrityCheckResult {
    pub data_id: String,
    pub check_type: String,
    pub status: CheckStatus,
    pub details: String,
    pub duration: Duration,
    pub bytes_checked: u64,
    metadata: BTreeMap<String, String>,
}

impl IntegrityCheckResult {
    pub fn new(
        data_id: &str,
        check_type: &str,
        status: CheckStatus,
        details: &str,
        duration: Duration,
        bytes_checked: u64,
    ) -> Result<Self, LedgerError> {
        if data_id.trim().is_empty() {
            return Err(LedgerError::InvalidInput("data_id must not be empty".into()));
        }
        if data_id.len() > MAX_DATA_ID_LEN {
            return Err(LedgerError::CapacityExceeded(format!(
                "data_id exceeds {MAX_DATA_ID_LEN} characters"
            )));
        }
        if details.len() > MAX_DETAILS_LEN {
            return Err(LedgerError::CapacityExceeded(format!(
                "details exceed {MAX_DETAILS_LEN} characters"
            )));
        }
        if duration.as_millis() as u64 > MAX_CHECK_DURATION_MS {
            return Err(LedgerError::InvalidInput(
                "check duration exceeds 24 hours".into(),
            ));
        }
        Ok(Self {
            data_id: data_id.to_string(),
            check_type: check_type.to_string(),
            status,
            details: details.to_string(),
            duration,
            bytes_checked,
            metadata: BTreeMap::new(),
        })
    }

    pub fn add_metadata(&mut self, key: &str, value: &str) -> Result<(), LedgerError> {
        if self.metadata.len() >= MAX_RESULT_METADATA_ENTRIES
            && !self.metadata.contains_key(key)
        {
            return Err(LedgerError::CapacityExceeded(format!(
                "result metadata is capped at {MAX_RESULT_METADATA_ENTRIES} entries"
            )));
        }
        self.metadata.insert(key.to_string(), value.to_string());
        Ok(())
    }

    pub fn metadata(&self) -> &BTreeMap<String, String> {
        &self.metadata
    }
}

/// Snapshot of a report's aggregate counters.
#[derive(Clone, Copy, Debug)]
pub struct ReportStatistics {
    pub total_checks: u64,
    pub healthy_checks: u64,
    pub critical_checks: u64,
    pub total_bytes: u64,
    pub total_duration_ms: u64,
}

impl ReportStatistics {
    pub fn healthy_pct(&self) -> f64 {
        if self.total_checks == 0 {
            0.0
        } else {
            self.healthy_checks as f64 * 100.0 / self.total_checks as f64
        }
    }

    /// Average throughput over all checks, in MB/s.
    pub fn avg_mb_per_s(&self) -> f64 {
        if self.total_duration_ms == 0 {
            0.0
        } else {
            (self.total_bytes as f64 / 1_000_000.0) / (self.total_duration_ms as f64 / 1000.0)
        }
    }
}

pub struct OffChainIntegrityReport {
    report_id: String,
    created_at: Timestamp,
    max_results: usize,
    results: Mutex<Vec<IntegrityCheckResult>>,
    total_checks: AtomicU64,
    healthy_checks: AtomicU64,
    critical_checks: AtomicU64,
    total_bytes: AtomicU64,
    total_duration_ms: AtomicU64,
}

impl OffChainIntegrityReport {
    pub fn new(report_id: &str) -> Result<Self, LedgerError> {
        Self::with_capacity(report_id, MAX_REPORT_RESULTS)
    }

    pub fn with_capacity(report_id: &str, max_results: usize) -> Result<Self, LedgerError> {
        if report_id.trim().is_empty() {
            return Err(LedgerError::InvalidInput("report_id must not be empty".into()));
        }
        if report_id.len() > MAX_REPORT_ID_LEN {
            return Err(LedgerError::CapacityExceeded(format!(
                "report_id exceeds {MAX_REPORT_ID_LEN} characters"
            )));
        }
        Ok(Self {
            report_id: report_id.to_string(),
            created_at: Utc::now(),
            max_results: max_results.min(MAX_REPORT_RESULTS),
            results: Mutex::new(Vec::new()),
            total_checks: AtomicU64::new(0),
            healthy_checks: AtomicU64::new(0),
            critical_checks: AtomicU64::new(0),
            total_bytes: AtomicU64::new(0),
            total_duration_ms: AtomicU64::new(0),
        })
    }

    pub fn report_id(&self) -> &str {
        &self.report_id
    }

    pub fn created_at(&self) -> Timestamp {
        self.created_at
    }

    /// Append a result. Fails with `CapacityExceeded` once the report is
    /// full; the counters saturate instead of wrapping.
    pub fn add_result(&self, result: IntegrityCheckResult) -> Result<(), LedgerError> {
        {
            let mut results = self.results.lock().expect("report poisoned");
            if results.len() >= self.max_results {
                return Err(LedgerError::CapacityExceeded(format!(
                    "integrity report is capped at {} results",
                    self.max_results
                )));
            }
            results.push(result.clone());
        }

        saturating_bump(&self.total_checks, 1);
        match result.status {
            CheckStatus::Healthy => saturating_bump(&self.healthy_checks, 1),
            CheckStatus::Critical => saturating_bump(&self.critical_checks, 1),
            CheckStatus::Degraded | CheckStatus::Unknown => {}
        }
        saturating_bump(&self.total_bytes, result.bytes_checked);
        saturating_bump(&self.total_duration_ms, result.duration.as_millis() as u64);
        Ok(())
    }

    /// Immutable snapshot of the collected results.
    pub fn results(&self) -> Vec<IntegrityCheckResult> {
        self.results.lock().expect("report poisoned").clone()
    }

    pub fn len(&self) -> usize {
        self.results.lock().expect("report poisoned").len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn statistics(&self) -> ReportStatistics {
        ReportStatistics {
            total_checks: self.total_checks.load(Ordering::SeqCst),
            healthy_checks: self.healthy_checks.load(Ordering::SeqCst),
            critical_checks: self.critical_checks.load(Ordering::SeqCst),
            total_bytes: self.total_bytes.load(Ordering::SeqCst),
            total_duration_ms: self.total_duration_ms.load(Ordering::SeqCst),
        }
    }

    /// Deterministic operator guidance derived from the statistics alone.
    pub fn recommendations(&self) -> Vec<String> {
        let stats = self.statistics();
        let mut out = Vec::new();

        if stats.total_checks == 0 {
            out.push("No integrity checks have run yet; schedule an off-chain scan.".to_string());
            return out;
        }
        if stats.critical_checks > 0 {
            out.push(format!(
                "{} blobs failed critically; restore them from backup before further writes.",
                stats.critical_checks
            ));
        }
        let pct = stats.healthy_pct();
        if pct < 50.0 {
            out.push(
                "The majority of off-chain data is unhealthy; treat the store as compromised."
                    .to_string(),
            );
        } else if pct < 90.0 {
            out.push(format!(
                "Off-chain health at {pct:.1}%; investigate degraded blobs before they spread."
            ));
        }
        if stats.total_bytes > 0 && stats.avg_mb_per_s() < 1.0 {
            out.push(
                "Verification throughput under 1 MB/s; check storage I/O on the blob root."
                    .to_string(),
            );
        }
        if out.is_empty() {
            out.push("All off-chain data healthy; no action required.".to_string());
        }
        out
    }
}

fn saturating_bump(counter: &AtomicU64, amount: u64) {
    let _ = counter.fetch_update(Ordering::SeqCst, Ordering::SeqCst, |v| {
        Some(v.saturating_add(amount))
    });
}
