//! Read-side analyses over stored sessions.
//!
//! Everything here queries the session store and returns plain
//! serializable records for a report layer to render: per-session
//! summaries with an error distribution, concurrency-impact analysis
//! (optimal level, throughput peak, decline point), cross-session
//! performance trends and API comparisons.

use rusqlite::params;
use serde::Serialize;

use crate::store::{SessionRow, SessionStore, StoreError};
use crate::utils::unix_now;

/// One grouped failure reason.
#[derive(Debug, Clone, Serialize)]
pub struct ErrorCount {
    pub error_message: String,
    pub count: i64,
}

/// Whole-session roll-up across all stages.
#[derive(Debug, Clone, Serialize)]
pub struct SessionSummary {
    pub session: SessionRow,
    pub total_requests: i64,
    pub successful_requests: i64,
    pub failed_requests: i64,
    pub success_rate: f64,
    pub avg_response_time: f64,
    pub min_response_time: f64,
    pub max_response_time: f64,
    pub avg_p95_response_time: f64,
    pub total_tokens: i64,
    pub total_timeouts: i64,

    /// Failure reasons over failed requests, most frequent first
    pub error_distribution: Vec<ErrorCount>,
}

/// One stage as seen by the concurrency analysis.
#[derive(Debug, Clone, Serialize)]
pub struct StagePoint {
    pub concurrent_level: i64,
    pub avg_response_time: f64,
    pub requests_per_second: f64,
    pub error_rate: f64,
    pub p95_response_time: f64,
    pub total_tokens: i64,
    pub tokens_per_second: f64,

    /// `rps / (mean latency + 0.1)`
    pub efficiency_score: f64,
}

/// How concurrency affected one session.
#[derive(Debug, Clone, Serialize)]
pub struct ConcurrencyImpact {
    /// Stage with the best efficiency score
    pub optimal: StagePoint,

    /// Stage with the highest throughput
    pub max_throughput: StagePoint,

    /// Stage with the lowest mean latency
    pub min_latency: StagePoint,

    /// Last stage before the first >=5% throughput drop, if any
    pub throughput_decline_point: Option<StagePoint>,

    pub stages: Vec<StagePoint>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum TrendDirection {
    Improving,
    Degrading,
}

/// Per-day aggregate used by the trend analysis.
#[derive(Debug, Clone, Serialize)]
pub struct TrendPoint {
    pub test_date: String,
    pub api_name: String,
    pub avg_response_time: f64,
    pub avg_success_rate: f64,
    pub test_count: i64,
}

/// Cross-session performance trend over a day window.
#[derive(Debug, Clone, Serialize)]
pub struct PerformanceTrend {
    /// Per-day points, newest first
    pub points: Vec<TrendPoint>,

    /// Present only when more than one point exists
    pub response_time_trend: Option<TrendDirection>,
    pub success_rate_trend: Option<TrendDirection>,

    pub avg_response_time: f64,
    pub avg_success_rate: f64,
    pub total_tests: i64,
}

/// Per-API aggregate with its comparison ranks.
#[derive(Debug, Clone, Serialize)]
pub struct ApiPerformance {
    pub api_name: String,
    pub avg_response_time: f64,
    pub avg_success_rate: f64,
    pub test_count: i64,
    pub total_requests: i64,
    pub min_response_time: f64,
    pub max_response_time: f64,

    /// 1-based rank by mean latency, ascending; ties share the average
    pub response_time_rank: f64,

    /// 1-based rank by mean success rate, descending
    pub success_rate_rank: f64,

    /// Mean of the two ranks
    pub overall_rank: f64,
}

/// Side-by-side API comparison over a day window.
#[derive(Debug, Clone, Serialize)]
pub struct ApiComparison {
    pub apis: Vec<ApiPerformance>,
    pub best_overall: ApiPerformance,
    pub fastest: ApiPerformance,
    pub most_reliable: ApiPerformance,
}

/// Derived queries over a [`SessionStore`].
pub struct SessionAnalyzer {
    store: SessionStore,
}

impl SessionAnalyzer {
    pub fn new(store: SessionStore) -> Self {
        Self { store }
    }

    /// Whole-session summary, or `None` for an unknown session id.
    pub fn summary(&self, session_id: &str) -> Result<Option<SessionSummary>, StoreError> {
        let Some(session) = self.store.session(session_id)? else {
            return Ok(None);
        };

        let conn = self.store.lock_conn();

        let (
            total_requests,
            successful_requests,
            failed_requests,
            avg_response_time,
            min_response_time,
            max_response_time,
            avg_p95_response_time,
            total_tokens,
            total_timeouts,
        ) = conn.query_row(
            "SELECT SUM(total_requests), SUM(successful_requests),
                    SUM(failed_requests), AVG(avg_response_time),
                    MIN(min_response_time), MAX(max_response_time),
                    AVG(p95_response_time), SUM(total_tokens),
                    SUM(timeout_count)
             FROM load_test_results
             WHERE session_id = ?1",
            params![session_id],
            |row| {
                Ok((
                    row.get::<_, Option<i64>>(0)?.unwrap_or(0),
                    row.get::<_, Option<i64>>(1)?.unwrap_or(0),
                    row.get::<_, Option<i64>>(2)?.unwrap_or(0),
                    row.get::<_, Option<f64>>(3)?.unwrap_or(0.0),
                    row.get::<_, Option<f64>>(4)?.unwrap_or(0.0),
                    row.get::<_, Option<f64>>(5)?.unwrap_or(0.0),
                    row.get::<_, Option<f64>>(6)?.unwrap_or(0.0),
                    row.get::<_, Option<i64>>(7)?.unwrap_or(0),
                    row.get::<_, Option<i64>>(8)?.unwrap_or(0),
                ))
            },
        )?;

        let success_rate = if total_requests > 0 {
            successful_requests as f64 / total_requests as f64
        } else {
            0.0
        };

        let mut stmt = conn.prepare(
            "SELECT error_message, COUNT(*) as count
             FROM request_results
             WHERE session_id = ?1 AND success = 0 AND error_message IS NOT NULL
             GROUP BY error_message
             ORDER BY count DESC",
        )?;
        let error_distribution = stmt
            .query_map(params![session_id], |row| {
                Ok(ErrorCount {
                    error_message: row.get(0)?,
                    count: row.get(1)?,
                })
            })?
            .collect::<Result<Vec<_>, _>>()?;

        Ok(Some(SessionSummary {
            session,
            total_requests,
            successful_requests,
            failed_requests,
            success_rate,
            avg_response_time,
            min_response_time,
            max_response_time,
            avg_p95_response_time,
            total_tokens,
            total_timeouts,
            error_distribution,
        }))
    }

    /// Concurrency-impact analysis for one session, or `None` when the
    /// session has no stages.
    pub fn concurrency_impact(
        &self,
        session_id: &str,
    ) -> Result<Option<ConcurrencyImpact>, StoreError> {
        let conn = self.store.lock_conn();

        let mut stmt = conn.prepare(
            "SELECT concurrent_level, avg_response_time, requests_per_second,
                    error_rate, p95_response_time, total_tokens, tokens_per_second
             FROM load_test_results
             WHERE session_id = ?1
             ORDER BY concurrent_level",
        )?;

        let stages = stmt
            .query_map(params![session_id], |row| {
                let avg_response_time: f64 = row.get(1)?;
                let requests_per_second: f64 = row.get(2)?;
                Ok(StagePoint {
                    concurrent_level: row.get(0)?,
                    avg_response_time,
                    requests_per_second,
                    error_rate: row.get(3)?,
                    p95_response_time: row.get(4)?,
                    total_tokens: row.get(5)?,
                    tokens_per_second: row.get(6)?,
                    // The +0.1 keeps near-zero latencies from dominating.
                    efficiency_score: requests_per_second / (avg_response_time + 0.1),
                })
            })?
            .collect::<Result<Vec<StagePoint>, _>>()?;

        if stages.is_empty() {
            return Ok(None);
        }

        let optimal = first_max_by(&stages, |p| p.efficiency_score).clone();
        let max_throughput = first_max_by(&stages, |p| p.requests_per_second).clone();
        let min_latency = first_min_by(&stages, |p| p.avg_response_time).clone();

        // First >=5% drop in throughput across the sweep; the stage just
        // before it is the decline point.
        let mut throughput_decline_point = None;
        for i in 1..stages.len() {
            if stages[i].requests_per_second < stages[i - 1].requests_per_second * 0.95 {
                throughput_decline_point = Some(stages[i - 1].clone());
                break;
            }
        }

        Ok(Some(ConcurrencyImpact {
            optimal,
            max_throughput,
            min_latency,
            throughput_decline_point,
            stages,
        }))
    }

    /// Per-day latency/success-rate trend over the last `days` days,
    /// optionally restricted to one API. `None` when no sessions match.
    ///
    /// The series is evaluated newest-first, so for latency a negative
    /// slope reads as improving.
    pub fn performance_trend(
        &self,
        api_name: Option<&str>,
        days: u32,
    ) -> Result<Option<PerformanceTrend>, StoreError> {
        let cutoff = unix_now() - days as f64 * 86_400.0;
        let conn = self.store.lock_conn();

        let base_query = "SELECT DATE(start_time, 'unixepoch') as test_date, api_name,
                    AVG(avg_response_time),
                    AVG(CAST(successful_requests AS FLOAT) / total_requests),
                    COUNT(*)
             FROM test_sessions
             WHERE start_time >= ?1";
        let tail = " GROUP BY test_date, api_name ORDER BY test_date DESC";

        let map_point = |row: &rusqlite::Row<'_>| {
            Ok(TrendPoint {
                test_date: row.get(0)?,
                api_name: row.get(1)?,
                avg_response_time: row.get::<_, Option<f64>>(2)?.unwrap_or(0.0),
                avg_success_rate: row.get::<_, Option<f64>>(3)?.unwrap_or(0.0),
                test_count: row.get(4)?,
            })
        };

        let points: Vec<TrendPoint> = match api_name {
            Some(api) => {
                let query = format!("{} AND api_name = ?2{}", base_query, tail);
                let mut stmt = conn.prepare(&query)?;
                let rows = stmt.query_map(params![cutoff, api], map_point)?;
                rows.collect::<Result<_, _>>()?
            }
            None => {
                let query = format!("{}{}", base_query, tail);
                let mut stmt = conn.prepare(&query)?;
                let rows = stmt.query_map(params![cutoff], map_point)?;
                rows.collect::<Result<_, _>>()?
            }
        };

        if points.is_empty() {
            return Ok(None);
        }

        let (response_time_trend, success_rate_trend) = if points.len() > 1 {
            let latency_series: Vec<f64> = points.iter().map(|p| p.avg_response_time).collect();
            let success_series: Vec<f64> = points.iter().map(|p| p.avg_success_rate).collect();

            let latency_slope = least_squares_slope(&latency_series);
            let success_slope = least_squares_slope(&success_series);

            (
                Some(if latency_slope < 0.0 {
                    TrendDirection::Improving
                } else {
                    TrendDirection::Degrading
                }),
                Some(if success_slope > 0.0 {
                    TrendDirection::Improving
                } else {
                    TrendDirection::Degrading
                }),
            )
        } else {
            (None, None)
        };

        let avg_response_time =
            points.iter().map(|p| p.avg_response_time).sum::<f64>() / points.len() as f64;
        let avg_success_rate =
            points.iter().map(|p| p.avg_success_rate).sum::<f64>() / points.len() as f64;
        let total_tests = points.iter().map(|p| p.test_count).sum();

        Ok(Some(PerformanceTrend {
            points,
            response_time_trend,
            success_rate_trend,
            avg_response_time,
            avg_success_rate,
            total_tests,
        }))
    }

    /// Compare all APIs tested within the last `days` days. `None` when
    /// no sessions match.
    pub fn compare_apis(&self, days: u32) -> Result<Option<ApiComparison>, StoreError> {
        let cutoff = unix_now() - days as f64 * 86_400.0;
        let conn = self.store.lock_conn();

        let mut stmt = conn.prepare(
            "SELECT api_name,
                    AVG(avg_response_time),
                    AVG(CAST(successful_requests AS FLOAT) / total_requests),
                    COUNT(*),
                    SUM(total_requests),
                    MIN(avg_response_time),
                    MAX(avg_response_time)
             FROM test_sessions
             WHERE start_time >= ?1
             GROUP BY api_name
             ORDER BY AVG(avg_response_time)",
        )?;

        let mut apis: Vec<ApiPerformance> = stmt
            .query_map(params![cutoff], |row| {
                Ok(ApiPerformance {
                    api_name: row.get(0)?,
                    avg_response_time: row.get::<_, Option<f64>>(1)?.unwrap_or(0.0),
                    avg_success_rate: row.get::<_, Option<f64>>(2)?.unwrap_or(0.0),
                    test_count: row.get(3)?,
                    total_requests: row.get::<_, Option<i64>>(4)?.unwrap_or(0),
                    min_response_time: row.get::<_, Option<f64>>(5)?.unwrap_or(0.0),
                    max_response_time: row.get::<_, Option<f64>>(6)?.unwrap_or(0.0),
                    response_time_rank: 0.0,
                    success_rate_rank: 0.0,
                    overall_rank: 0.0,
                })
            })?
            .collect::<Result<_, _>>()?;

        if apis.is_empty() {
            return Ok(None);
        }

        let latency: Vec<f64> = apis.iter().map(|a| a.avg_response_time).collect();
        let reliability: Vec<f64> = apis.iter().map(|a| a.avg_success_rate).collect();

        let latency_ranks = average_ranks(&latency, true);
        let reliability_ranks = average_ranks(&reliability, false);

        for (api, (latency_rank, reliability_rank)) in apis
            .iter_mut()
            .zip(latency_ranks.into_iter().zip(reliability_ranks))
        {
            api.response_time_rank = latency_rank;
            api.success_rate_rank = reliability_rank;
            api.overall_rank = (latency_rank + reliability_rank) / 2.0;
        }

        let best_overall = first_min_by(&apis, |a| a.overall_rank).clone();
        let fastest = first_min_by(&apis, |a| a.avg_response_time).clone();
        let most_reliable = first_max_by(&apis, |a| a.avg_success_rate).clone();

        Ok(Some(ApiComparison {
            apis,
            best_overall,
            fastest,
            most_reliable,
        }))
    }
}

fn first_max_by<T>(items: &[T], key: impl Fn(&T) -> f64) -> &T {
    let mut best = &items[0];
    for item in &items[1..] {
        if key(item) > key(best) {
            best = item;
        }
    }
    best
}

fn first_min_by<T>(items: &[T], key: impl Fn(&T) -> f64) -> &T {
    let mut best = &items[0];
    for item in &items[1..] {
        if key(item) < key(best) {
            best = item;
        }
    }
    best
}

/// 1-based ranks where tied values share the average of their positions
/// (the convention report consumers expect from spreadsheet ranking).
fn average_ranks(values: &[f64], ascending: bool) -> Vec<f64> {
    let n = values.len();
    let mut order: Vec<usize> = (0..n).collect();
    order.sort_by(|&a, &b| {
        let cmp = values[a].total_cmp(&values[b]);
        if ascending {
            cmp
        } else {
            cmp.reverse()
        }
    });

    let mut ranks = vec![0.0; n];
    let mut i = 0;
    while i < n {
        let mut j = i;
        while j + 1 < n && values[order[j + 1]] == values[order[i]] {
            j += 1;
        }
        // Positions i..=j (1-based) share one averaged rank.
        let shared = (i + j + 2) as f64 / 2.0;
        for &index in &order[i..=j] {
            ranks[index] = shared;
        }
        i = j + 1;
    }

    ranks
}

/// Slope of the least-squares line through `(index, y)` points.
fn least_squares_slope(ys: &[f64]) -> f64 {
    if ys.len() < 2 {
        return 0.0;
    }

    let n = ys.len() as f64;
    let sum_x: f64 = (0..ys.len()).map(|i| i as f64).sum();
    let sum_y: f64 = ys.iter().sum();
    let sum_xy: f64 = ys.iter().enumerate().map(|(i, y)| i as f64 * y).sum();
    let sum_xx: f64 = (0..ys.len()).map(|i| (i as f64) * (i as f64)).sum();

    let denominator = n * sum_xx - sum_x * sum_x;
    if denominator == 0.0 {
        0.0
    } else {
        (n * sum_xy - sum_x * sum_y) / denominator
    }
}
