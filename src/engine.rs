//! Load-generation engine.
//!
//! Runs a staged concurrency sweep: each stage issues a fixed number of
//! requests with at most C in flight, gated by a semaphore. Dispatch is
//! batched so peak memory stays bounded and progress checkpoints fall out
//! naturally. Stages run strictly one after another with optional
//! ramp-up/cool-down idle periods around them.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tracing::{debug, info, warn};

use crate::executor::{RequestExecutor, RequestResult};
use crate::stats::StageStats;

/// Upper bound on tasks dispatched per batch.
const MAX_BATCH_SIZE: usize = 100;

/// Invoked as `(completed, total)` after each collected outcome.
/// Must not block; dispatch UI work elsewhere.
pub type ProgressCallback = Box<dyn Fn(usize, usize) + Send + Sync>;

/// Staged load-test engine.
pub struct LoadTestEngine {
    executor: Arc<RequestExecutor>,
    progress_callback: Option<ProgressCallback>,
}

impl LoadTestEngine {
    pub fn new(executor: RequestExecutor) -> Self {
        Self {
            executor: Arc::new(executor),
            progress_callback: None,
        }
    }

    /// Install a progress callback for stage execution.
    pub fn set_progress_callback(
        &mut self,
        callback: impl Fn(usize, usize) + Send + Sync + 'static,
    ) {
        self.progress_callback = Some(Box::new(callback));
    }

    /// Run one stage: `total_requests` executions with at most
    /// `concurrency` in flight simultaneously.
    ///
    /// Always returns exactly `total_requests` outcomes: a task that dies
    /// without producing one is recorded as a synthesized failure. The
    /// returned list is in completion order.
    pub async fn run_stage(
        &self,
        concurrency: usize,
        total_requests: usize,
    ) -> Vec<RequestResult> {
        let semaphore = Arc::new(Semaphore::new(concurrency));
        let mut results = Vec::with_capacity(total_requests);

        let batch = batch_size(concurrency);
        let mut dispatched = 0;

        debug!(
            concurrency = concurrency,
            total_requests = total_requests,
            batch_size = batch,
            "Running stage"
        );

        while dispatched < total_requests {
            let batch_count = batch.min(total_requests - dispatched);
            let mut tasks = JoinSet::new();

            for _ in 0..batch_count {
                let executor = Arc::clone(&self.executor);
                let semaphore = Arc::clone(&semaphore);

                tasks.spawn(async move {
                    match semaphore.acquire_owned().await {
                        Ok(_permit) => executor.execute().await,
                        Err(e) => RequestResult::synthesized(e.to_string()),
                    }
                });
            }
            dispatched += batch_count;

            // Await the whole batch before dispatching the next one.
            while let Some(joined) = tasks.join_next().await {
                let outcome = joined.unwrap_or_else(|e| {
                    warn!(error = %e, "Request task died, recording synthesized failure");
                    RequestResult::synthesized(e.to_string())
                });
                results.push(outcome);

                if let Some(callback) = &self.progress_callback {
                    callback(results.len(), total_requests);
                }
            }
        }

        results
    }

    /// Run the full concurrency sweep.
    ///
    /// For each level: idle `ramp_up`, run the stage, aggregate; idle
    /// `cool_down` between stages (not after the last). Stages are
    /// strictly sequential and the returned list preserves level order.
    pub async fn run_load_test(
        &self,
        levels: &[usize],
        requests_per_level: usize,
        ramp_up: Duration,
        cool_down: Duration,
    ) -> Vec<StageStats> {
        let mut stages = Vec::with_capacity(levels.len());

        info!(
            levels = ?levels,
            requests_per_level = requests_per_level,
            ramp_up_secs = ramp_up.as_secs(),
            cool_down_secs = cool_down.as_secs(),
            "Starting load test"
        );

        for (index, &level) in levels.iter().enumerate() {
            info!(
                stage = index + 1,
                stages = levels.len(),
                concurrency = level,
                "Starting stage"
            );

            if !ramp_up.is_zero() {
                debug!(seconds = ramp_up.as_secs(), "Ramp-up");
                tokio::time::sleep(ramp_up).await;
            }

            let results = self.run_stage(level, requests_per_level).await;
            let stats = StageStats::from_results(results, level);

            info!(
                concurrency = level,
                successful = stats.successful_requests,
                total = stats.total_requests,
                avg_response_time = stats.avg_response_time,
                rps = stats.requests_per_second,
                "Stage complete"
            );

            stages.push(stats);

            if !cool_down.is_zero() && index < levels.len() - 1 {
                debug!(seconds = cool_down.as_secs(), "Cool-down");
                tokio::time::sleep(cool_down).await;
            }
        }

        info!(stages = stages.len(), "Load test complete");
        stages
    }
}

/// Batch size for a stage: twice the concurrency, capped.
fn batch_size(concurrency: usize) -> usize {
    (concurrency * 2).clamp(1, MAX_BATCH_SIZE)
}
