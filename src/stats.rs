//! Per-stage statistics.
//!
//! Aggregates a stage's collected [`RequestResult`]s into the summary
//! record persisted and reported per concurrency level. Percentiles use
//! an explicit linear-interpolation formula so values are stable across
//! toolchains and comparable between runs.

use serde::{Deserialize, Serialize};

use crate::executor::RequestResult;

/// Requests slower than this count as hung, whatever their outcome.
/// Unrelated to the per-attempt timeout.
const HUNG_REQUEST_SECS: f64 = 1200.0;

/// Aggregates for one (concurrency level, request count) stage.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StageStats {
    pub concurrent_level: usize,
    pub total_requests: usize,
    pub successful_requests: usize,
    pub failed_requests: usize,
    pub avg_response_time: f64,
    pub min_response_time: f64,
    pub max_response_time: f64,
    pub p50_response_time: f64,
    pub p95_response_time: f64,
    pub p99_response_time: f64,
    pub requests_per_second: f64,
    pub total_test_time: f64,
    pub error_rate: f64,
    pub timeout_count: usize,
    pub total_tokens: u64,
    pub avg_tokens_per_request: f64,
    pub tokens_per_second: f64,

    /// The per-request outcomes this stage was computed from
    #[serde(default)]
    pub results: Vec<RequestResult>,
}

impl StageStats {
    /// An all-zero stage for the given concurrency level.
    pub fn empty(concurrent_level: usize) -> Self {
        Self {
            concurrent_level,
            total_requests: 0,
            successful_requests: 0,
            failed_requests: 0,
            avg_response_time: 0.0,
            min_response_time: 0.0,
            max_response_time: 0.0,
            p50_response_time: 0.0,
            p95_response_time: 0.0,
            p99_response_time: 0.0,
            requests_per_second: 0.0,
            total_test_time: 0.0,
            error_rate: 0.0,
            timeout_count: 0,
            total_tokens: 0,
            avg_tokens_per_request: 0.0,
            tokens_per_second: 0.0,
            results: Vec::new(),
        }
    }

    /// Compute stage aggregates from collected outcomes.
    ///
    /// Response-time statistics cover only successful outcomes with a
    /// positive latency; the test wall-time and error rate cover all
    /// outcomes. Timestamps are not assumed monotonic: outcomes arrive
    /// in completion order.
    pub fn from_results(results: Vec<RequestResult>, concurrent_level: usize) -> Self {
        if results.is_empty() {
            return Self::empty(concurrent_level);
        }

        let total_requests = results.len();
        let successful_requests = results.iter().filter(|r| r.success).count();
        let failed_requests = total_requests - successful_requests;
        let error_rate = failed_requests as f64 / total_requests as f64;

        let successful: Vec<&RequestResult> = results
            .iter()
            .filter(|r| r.success && r.response_time > 0.0)
            .collect();

        let mut response_times: Vec<f64> = successful.iter().map(|r| r.response_time).collect();
        response_times.sort_by(f64::total_cmp);

        let (avg, min, max, p50, p95, p99) = if response_times.is_empty() {
            (0.0, 0.0, 0.0, 0.0, 0.0, 0.0)
        } else {
            let avg = response_times.iter().sum::<f64>() / response_times.len() as f64;
            (
                avg,
                response_times[0],
                response_times[response_times.len() - 1],
                percentile(&response_times, 50.0),
                percentile(&response_times, 95.0),
                percentile(&response_times, 99.0),
            )
        };

        let test_start = results
            .iter()
            .map(|r| r.timestamp)
            .fold(f64::INFINITY, f64::min);
        let test_end = results
            .iter()
            .map(|r| r.timestamp + r.response_time)
            .fold(f64::NEG_INFINITY, f64::max);
        let total_test_time = test_end - test_start;

        let requests_per_second = if total_test_time > 0.0 {
            successful_requests as f64 / total_test_time
        } else {
            0.0
        };

        let timeout_count = results
            .iter()
            .filter(|r| r.response_time > HUNG_REQUEST_SECS)
            .count();

        let total_tokens: u64 = successful.iter().map(|r| r.total_tokens).sum();
        let avg_tokens_per_request = if successful.is_empty() {
            0.0
        } else {
            total_tokens as f64 / successful.len() as f64
        };
        let tokens_per_second = if total_test_time > 0.0 {
            total_tokens as f64 / total_test_time
        } else {
            0.0
        };

        Self {
            concurrent_level,
            total_requests,
            successful_requests,
            failed_requests,
            avg_response_time: avg,
            min_response_time: min,
            max_response_time: max,
            p50_response_time: p50,
            p95_response_time: p95,
            p99_response_time: p99,
            requests_per_second,
            total_test_time,
            error_rate,
            timeout_count,
            total_tokens,
            avg_tokens_per_request,
            tokens_per_second,
            results,
        }
    }
}

/// Linear-interpolation percentile over an ascending-sorted slice.
///
/// For percentile `p`, with `k = (L-1)*p/100`, `f = floor(k)` and
/// `c = k - f`, the result is `x[f]` when `f` is the last index and
/// `x[f]*(1-c) + x[f+1]*c` otherwise.
pub fn percentile(sorted: &[f64], p: f64) -> f64 {
    if sorted.is_empty() {
        return 0.0;
    }

    let k = (sorted.len() - 1) as f64 * p / 100.0;
    let f = k.floor() as usize;
    let c = k - f as f64;

    if f + 1 < sorted.len() {
        sorted[f] * (1.0 - c) + sorted[f + 1] * c
    } else {
        sorted[f]
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const EPSILON: f64 = 1e-9;

    fn outcome(timestamp: f64, response_time: f64, success: bool) -> RequestResult {
        RequestResult {
            timestamp,
            prompt: "q".to_string(),
            response_time,
            status_code: if success { 200 } else { 0 },
            success,
            response_content: String::new(),
            error_message: if success { None } else { Some("boom".to_string()) },
            input_tokens: 0,
            output_tokens: 0,
            total_tokens: 0,
            content_length: 0,
        }
    }

    fn assert_close(actual: f64, expected: f64) {
        assert!(
            (actual - expected).abs() < EPSILON,
            "expected {} but got {}",
            expected,
            actual
        );
    }

    #[test]
    fn test_single_stage_success() {
        let results = vec![
            outcome(100.0, 0.1, true),
            outcome(100.0, 0.2, true),
            outcome(100.0, 0.3, true),
            outcome(100.0, 0.4, true),
        ];

        let stats = StageStats::from_results(results, 2);

        assert_eq!(stats.concurrent_level, 2);
        assert_eq!(stats.total_requests, 4);
        assert_eq!(stats.successful_requests, 4);
        assert_eq!(stats.failed_requests, 0);
        assert_close(stats.error_rate, 0.0);
        assert_close(stats.avg_response_time, 0.25);
        assert_close(stats.min_response_time, 0.1);
        assert_close(stats.max_response_time, 0.4);
        assert_close(stats.p50_response_time, 0.25);
        assert_close(stats.p95_response_time, 0.385);
        assert_close(stats.p99_response_time, 0.397);
        // All issued at t=100, slowest finishes at 100.4.
        assert_close(stats.total_test_time, 0.4);
        assert_close(stats.requests_per_second, 4.0 / 0.4);
    }

    #[test]
    fn test_mixed_failures() {
        let mut results: Vec<RequestResult> = (0..8)
            .map(|i| outcome(100.0 + i as f64 * 0.1, 0.5, true))
            .collect();
        results.push(outcome(100.2, 0.0, false));
        results.push(outcome(100.3, 0.0, false));

        let stats = StageStats::from_results(results, 5);

        assert_eq!(stats.total_requests, 10);
        assert_eq!(stats.successful_requests, 8);
        assert_eq!(stats.failed_requests, 2);
        assert_close(stats.error_rate, 0.2);
        // Stats are over the 8 successes only.
        assert_close(stats.avg_response_time, 0.5);
        assert_close(stats.requests_per_second, 8.0 / stats.total_test_time);
    }

    #[test]
    fn test_hung_request_counter() {
        let results = vec![
            outcome(100.0, 0.2, true),
            // Still a success, but far beyond any reasonable latency.
            outcome(100.0, 1500.0, true),
        ];

        let stats = StageStats::from_results(results, 1);
        assert_eq!(stats.timeout_count, 1);
        assert_eq!(stats.successful_requests, 2);
    }

    #[test]
    fn test_token_totals_over_successes_only() {
        let mut ok = outcome(100.0, 0.5, true);
        ok.total_tokens = 150;
        let mut ok2 = outcome(100.1, 0.5, true);
        ok2.total_tokens = 50;
        let mut failed = outcome(100.2, 0.1, false);
        failed.total_tokens = 999; // must not be counted

        let stats = StageStats::from_results(vec![ok, ok2, failed], 2);

        assert_eq!(stats.total_tokens, 200);
        assert_close(stats.avg_tokens_per_request, 100.0);
        assert_close(stats.tokens_per_second, 200.0 / stats.total_test_time);
    }

    #[test]
    fn test_empty_results() {
        let stats = StageStats::from_results(Vec::new(), 7);
        assert_eq!(stats.concurrent_level, 7);
        assert_eq!(stats.total_requests, 0);
        assert_close(stats.error_rate, 0.0);
        assert_close(stats.total_test_time, 0.0);
        assert_close(stats.requests_per_second, 0.0);
    }

    #[test]
    fn test_wall_time_ignores_completion_order() {
        // Later-issued request completes first; wall time still spans
        // min(issue) to max(issue + latency).
        let results = vec![outcome(100.5, 0.1, true), outcome(100.0, 2.0, true)];

        let stats = StageStats::from_results(results, 2);
        assert_close(stats.total_test_time, 2.0);
    }

    #[test]
    fn test_percentile_single_value() {
        let data = vec![42.0];
        assert_close(percentile(&data, 50.0), 42.0);
        assert_close(percentile(&data, 99.0), 42.0);
    }

    #[test]
    fn test_percentile_interpolation() {
        let data = vec![1.0, 2.0, 3.0, 4.0];
        assert_close(percentile(&data, 50.0), 2.5);
        assert_close(percentile(&data, 100.0), 4.0);
        assert_close(percentile(&data, 0.0), 1.0);
    }

    #[test]
    fn test_percentile_monotonicity() {
        let mut data = vec![0.31, 0.05, 2.4, 0.9, 0.9, 1.7, 0.08, 0.66];
        data.sort_by(f64::total_cmp);

        let p50 = percentile(&data, 50.0);
        let p95 = percentile(&data, 95.0);
        let p99 = percentile(&data, 99.0);
        let max = data[data.len() - 1];

        assert!(p50 <= p95);
        assert!(p95 <= p99);
        assert!(p99 <= max);
    }

    #[test]
    fn test_percentile_empty() {
        assert_close(percentile(&[], 95.0), 0.0);
    }
}
