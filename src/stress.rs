//! Stress-test engine: continuous load at fixed concurrency.
//!
//! Spawns C long-lived workers sharing a semaphore of capacity C; each
//! worker issues executions back-to-back until the deadline. The deadline
//! is checked both before acquiring the semaphore and after, so no
//! request launches inside the grace window. In-flight executions at the
//! deadline are allowed to finish and their outcomes are kept.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tokio::time::Instant;
use tracing::{info, warn};

use crate::engine::ProgressCallback;
use crate::executor::{RequestExecutor, RequestResult};
use crate::stats::StageStats;

/// Cadence of the progress monitor.
const MONITOR_TICK: Duration = Duration::from_millis(100);

/// Time-bounded stress-test engine.
pub struct StressTestEngine {
    executor: Arc<RequestExecutor>,
    progress_callback: Option<ProgressCallback>,
}

impl StressTestEngine {
    pub fn new(executor: RequestExecutor) -> Self {
        Self {
            executor: Arc::new(executor),
            progress_callback: None,
        }
    }

    /// Install a progress callback invoked as `(elapsed_secs, total_secs)`
    /// on a ~100 ms cadence while the test runs. Must not block.
    pub fn set_progress_callback(
        &mut self,
        callback: impl Fn(usize, usize) + Send + Sync + 'static,
    ) {
        self.progress_callback = Some(Box::new(callback));
    }

    /// Run continuous load at `max_concurrent` until `duration` elapses,
    /// then aggregate everything collected into a single stage at that
    /// concurrency level.
    pub async fn run_stress(&self, max_concurrent: usize, duration: Duration) -> StageStats {
        info!(
            max_concurrent = max_concurrent,
            duration_secs = duration.as_secs(),
            "Starting stress test"
        );

        let start = Instant::now();
        let deadline = start + duration;
        let semaphore = Arc::new(Semaphore::new(max_concurrent));
        let results: Arc<Mutex<Vec<RequestResult>>> = Arc::new(Mutex::new(Vec::new()));

        let mut workers = JoinSet::new();
        for _ in 0..max_concurrent {
            let executor = Arc::clone(&self.executor);
            let semaphore = Arc::clone(&semaphore);
            let results = Arc::clone(&results);

            workers.spawn(async move {
                while Instant::now() < deadline {
                    let permit = match Arc::clone(&semaphore).acquire_owned().await {
                        Ok(permit) => permit,
                        Err(_) => break,
                    };

                    // Re-check after the acquire: a permit may have been
                    // granted right at the deadline.
                    if Instant::now() >= deadline {
                        break;
                    }

                    let outcome = executor.execute().await;
                    results.lock().unwrap().push(outcome);
                    drop(permit);
                }
            });
        }

        // Progress monitor until the deadline.
        let total_secs = duration.as_secs() as usize;
        while Instant::now() < deadline {
            if let Some(callback) = &self.progress_callback {
                let elapsed = start.elapsed().as_secs() as usize;
                callback(elapsed.min(total_secs), total_secs);
            }
            tokio::time::sleep(MONITOR_TICK).await;
        }

        // Deadline passed: wait out the in-flight executions. Worker
        // panics are logged and ignored; their outcomes are already
        // recorded or moot past the deadline.
        while let Some(joined) = workers.join_next().await {
            if let Err(e) = joined {
                warn!(error = %e, "Stress worker ended abnormally");
            }
        }

        if let Some(callback) = &self.progress_callback {
            callback(total_secs, total_secs);
        }

        let collected = {
            let mut guard = results.lock().unwrap();
            std::mem::take(&mut *guard)
        };

        let stats = StageStats::from_results(collected, max_concurrent);
        info!(
            total = stats.total_requests,
            successful = stats.successful_requests,
            rps = stats.requests_per_second,
            "Stress test complete"
        );

        stats
    }
}
