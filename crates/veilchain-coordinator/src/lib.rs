//! veilchain-coordinator
//!
//! Single-flight coordination of named index rebuilds. At most one rebuild
//! per operation name runs at a time; repeat requests inside the minimum
//! interval are skipped with reason "Recently executed"; a test-mode gate
//! suppresses everything that is not forced. The coordinator is an
//! explicitly constructed service with an `init`/`shutdown` lifecycle —
//! hosts build one, wrap it in an `Arc`, and inject the handle.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use futures::future::BoxFuture;
use tokio::sync::watch;
use tracing::{info, warn};

/// Well-known operation names. Arbitrary names are equally valid; these
/// are the ones the stock components register.
pub const METADATA_INDEX_REBUILD: &str = "METADATA_INDEX_REBUILD";
pub const ENCRYPTED_BLOCKS_CACHE_REBUILD: &str = "ENCRYPTED_BLOCKS_CACHE_REBUILD";
pub const RECIPIENT_INDEX_REBUILD: &str = "RECIPIENT_INDEX_REBUILD";

/// Async rebuild handler. Returns a human-readable completion message, or
/// an error message on failure.
pub type RebuildHandler =
    Arc<dyn Fn(RebuildContext) -> BoxFuture<'static, Result<String, String>> + Send + Sync>;

/// What a handler gets to see about the request that triggered it.
#[derive(Clone, Debug)]
pub struct RebuildContext {
    pub operation: String,
    /// Full rebuild instead of incremental.
    pub force_rebuild: bool,
    /// Restrict the rebuild to these blocks (incremental updates).
    pub blocks: Option<Vec<u64>>,
}

/// A coordination request for one named operation.
#[derive(Clone, Debug)]
pub struct RebuildRequest {
    pub operation: String,
    /// Overrides the coordinator-wide default when set.
    pub min_interval_ms: Option<u64>,
    /// Wait for an in-flight rebuild of the same name instead of skipping.
    pub can_wait: bool,
    /// Bypass the interval gate and the test-mode gate.
    pub force: bool,
    /// Ask the handler for a full rebuild instead of an incremental one.
    pub force_rebuild: bool,
    pub blocks: Option<Vec<u64>>,
}

impl RebuildRequest {
    pub fn new(operation: impl Into<String>) -> Self {
        Self {
            operation: operation.into(),
            min_interval_ms: None,
            can_wait: false,
            force: false,
            force_rebuild: false,
            blocks: None,
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RebuildOutcome {
    Completed,
    Skipped,
    Failed,
}

#[derive(Clone, Debug)]
pub struct RebuildResult {
    pub outcome: RebuildOutcome,
    pub duration: Duration,
    pub message: String,
}

impl RebuildResult {
    fn skipped(message: impl Into<String>) -> Self {
        Self {
            outcome: RebuildOutcome::Skipped,
            duration: Duration::ZERO,
            message: message.into(),
        }
    }
}

/// Async handle on a coordinated rebuild.
pub struct RebuildTicket(tokio::task::JoinHandle<RebuildResult>);

impl RebuildTicket {
    pub async fn wait(self) -> RebuildResult {
        match self.0.await {
            Ok(result) => result,
            Err(e) => RebuildResult {
                outcome: RebuildOutcome::Failed,
                duration: Duration::ZERO,
                message: format!("rebuild task panicked: {e}"),
            },
        }
    }
}

#[derive(Clone, Debug)]
pub struct CoordinatorConfig {
    /// Interval gate applied when a request does not carry its own.
    pub default_min_interval: Duration,
    /// Suppress every non-forced request (used by test suites to stop
    /// automatic triggers from interfering).
    pub test_mode: bool,
}

impl Default for CoordinatorConfig {
    fn default() -> Self {
        Self {
            default_min_interval: Duration::from_secs(30),
            test_mode: false,
        }
    }
}

struct OpState {
    handler: Option<RebuildHandler>,
    /// `true` while a rebuild of this operation is in flight. Waiters
    /// subscribe and wake when it flips back to `false`.
    running: watch::Sender<bool>,
    last_success: Option<Instant>,
}

impl Default for OpState {
    fn default() -> Self {
        Self {
            handler: None,
            running: watch::channel(false).0,
            last_success: None,
        }
    }
}

pub struct IndexingCoordinator {
    config: CoordinatorConfig,
    test_mode: AtomicBool,
    shut_down: AtomicBool,
    ops: Mutex<HashMap<String, OpState>>,
}

impl IndexingCoordinator {
    pub fn new(config: CoordinatorConfig) -> Self {
        let test_mode = AtomicBool::new(config.test_mode);
        Self {
            config,
            test_mode,
            shut_down: AtomicBool::new(false),
            ops: Mutex::new(HashMap::new()),
        }
    }

    /// Register (or replace) the handler for an operation name. Consumers
    /// call this once at startup.
    pub fn register(&self, operation: &str, handler: RebuildHandler) {
        let mut ops = self.ops.lock().expect("coordinator state poisoned");
        ops.entry(operation.to_string()).or_default().handler = Some(handler);
        info!(operation, "registered rebuild handler");
    }

    pub fn set_test_mode(&self, enabled: bool) {
        self.test_mode.store(enabled, Ordering::SeqCst);
    }

    pub fn test_mode(&self) -> bool {
        self.test_mode.load(Ordering::SeqCst)
    }

    /// Coordinate a rebuild; the returned ticket resolves when the request
    /// has completed, failed, or been skipped.
    pub fn coordinate(self: &Arc<Self>, request: RebuildRequest) -> RebuildTicket {
        let this = Arc::clone(self);
        RebuildTicket(tokio::spawn(async move { this.run(request, None).await }))
    }

    /// Like [`coordinate`](Self::coordinate), but with a direct fallback
    /// path for operations nobody registered: the work still happens, with
    /// a warning, under the same single-flight and interval rules.
    pub fn coordinate_with_fallback(
        self: &Arc<Self>,
        request: RebuildRequest,
        fallback: RebuildHandler,
    ) -> RebuildTicket {
        let this = Arc::clone(self);
        RebuildTicket(tokio::spawn(async move { this.run(request, Some(fallback)).await }))
    }

    async fn run(&self, request: RebuildRequest, fallback: Option<RebuildHandler>) -> RebuildResult {
        let operation = request.operation.clone();
        if self.shut_down.load(Ordering::SeqCst) {
            return RebuildResult::skipped("coordinator is shut down");
        }
        if self.test_mode.load(Ordering::SeqCst) && !request.force {
            return RebuildResult::skipped("test mode active; pass force to execute");
        }

        let min_interval = request
            .min_interval_ms
            .map(Duration::from_millis)
            .unwrap_or(self.config.default_min_interval);

        // Acquire the single-flight slot for this operation, or bail out.
        let handler = loop {
            let wait_rx = {
                let mut ops = self.ops.lock().expect("coordinator state poisoned");
                let state = ops.entry(operation.clone()).or_default();

                if !*state.running.borrow() {
                    if !request.force {
                        if let Some(last) = state.last_success {
                            if last.elapsed() < min_interval {
                                return RebuildResult::skipped("Recently executed");
                            }
                        }
                    }
                    let handler = match (&state.handler, &fallback) {
                        (Some(h), _) => h.clone(),
                        (None, Some(f)) => {
                            warn!(operation = %operation, "no handler registered; using direct fallback path");
                            f.clone()
                        }
                        (None, None) => {
                            warn!(operation = %operation, "no handler registered and no fallback");
                            return RebuildResult {
                                outcome: RebuildOutcome::Failed,
                                duration: Duration::ZERO,
                                message: format!("no handler registered for '{operation}'"),
                            };
                        }
                    };
                    state.running.send_replace(true);
                    break handler;
                }

                if !request.can_wait {
                    return RebuildResult::skipped("concurrent rebuild in flight");
                }
                state.running.subscribe()
            };

            let mut rx = wait_rx;
            // Lock released; wake when the in-flight rebuild clears.
            if rx.wait_for(|running| !*running).await.is_err() {
                return RebuildResult::skipped("coordinator is shut down");
            }
        };

        let context = RebuildContext {
            operation: operation.clone(),
            force_rebuild: request.force_rebuild,
            blocks: request.blocks.clone(),
        };

        let started = Instant::now();
        let outcome = handler(context).await;
        let duration = started.elapsed();

        let mut ops = self.ops.lock().expect("coordinator state poisoned");
        let state = ops.entry(operation.clone()).or_default();
        state.running.send_replace(false);

        match outcome {
            Ok(message) => {
                state.last_success = Some(Instant::now());
                info!(operation = %operation, ?duration, "rebuild completed");
                RebuildResult {
                    outcome: RebuildOutcome::Completed,
                    duration,
                    message,
                }
            }
            Err(message) => {
                warn!(operation = %operation, ?duration, message = %message, "rebuild failed");
                RebuildResult {
                    outcome: RebuildOutcome::Failed,
                    duration,
                    message,
                }
            }
        }
    }

    /// Stop accepting work and wait for in-flight rebuilds to finish.
    pub async fn shutdown(&self) {
        self.shut_down.store(true, Ordering::SeqCst);
        let receivers: Vec<watch::Receiver<bool>> = {
            let ops = self.ops.lock().expect("coordinator state poisoned");
            ops.values().map(|s| s.running.subscribe()).collect()
        };
        for mut rx in receivers {
            let _ = rx.wait_for(|running| !*running).await;
        }
        info!("indexing coordinator shut down");
    }
}
