//! Host reachability monitoring.
//!
//! Samples one or more targets on a fixed interval while a test session
//! runs, via plain TCP connects or HTTP HEAD requests. Samples accumulate
//! in a bounded per-target ring; aggregates (success rate, latency
//! spread, jitter) are recomputed on demand from the retained window.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::net::TcpStream;
use tokio::task::JoinSet;
use tokio::time::Instant;
use tracing::{debug, error, info};

use crate::utils::unix_now;

/// Ring high-water mark; crossing it triggers a batch trim.
const RING_CAP: usize = 1000;

/// Samples retained after a trim.
const RING_KEEP: usize = 500;

const DEFAULT_TCP_PORT: u16 = 80;

/// How a target is probed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProbeMethod {
    /// Resolve and open a TCP connection
    Tcp,

    /// Send an HTTP HEAD request
    Http,
}

/// One reachability measurement.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProbeSample {
    /// Wall-clock sample time, seconds since the Unix epoch
    pub timestamp: f64,

    pub host: String,

    /// Address the probe dialed, or the hostname if resolution failed
    pub ip_address: String,

    /// Milliseconds; 0 when the probe failed outright
    pub response_time: f64,

    pub success: bool,

    pub error_message: Option<String>,
}

/// Aggregate reachability statistics for one target.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HostStats {
    pub host: String,
    pub total_pings: usize,
    pub successful_pings: usize,
    pub failed_pings: usize,
    pub success_rate: f64,
    pub avg_response_time: f64,
    pub min_response_time: f64,
    pub max_response_time: f64,
    pub std_response_time: f64,
    pub packet_loss: f64,

    /// Mean absolute difference between adjacent sample latencies
    pub jitter: f64,
}

/// Periodic reachability prober.
///
/// `start_monitoring` runs until `stop_monitoring` is called from another
/// task; the in-flight probe round completes and its samples are kept.
pub struct NetworkMonitor {
    interval: Duration,
    timeout: Duration,
    running: Arc<AtomicBool>,
    samples: Arc<Mutex<HashMap<String, Vec<ProbeSample>>>>,
    client: reqwest::Client,
}

impl NetworkMonitor {
    pub fn new(interval: Duration, timeout: Duration) -> Self {
        Self {
            interval,
            timeout,
            running: Arc::new(AtomicBool::new(false)),
            samples: Arc::new(Mutex::new(HashMap::new())),
            client: reqwest::Client::new(),
        }
    }

    /// Probe all targets once per interval until stopped.
    ///
    /// Targets beginning with `http://` or `https://` are probed over
    /// HTTP regardless of `method`.
    pub async fn start_monitoring(&self, targets: &[String], method: ProbeMethod) {
        self.running.store(true, Ordering::SeqCst);

        {
            let mut samples = self.samples.lock().unwrap();
            for target in targets {
                samples.entry(target.clone()).or_default();
            }
        }

        info!(targets = targets.len(), interval_secs = self.interval.as_secs(), "Starting host monitoring");

        while self.running.load(Ordering::SeqCst) {
            let mut probes = JoinSet::new();

            for target in targets {
                let client = self.client.clone();
                let timeout = self.timeout;
                let target = target.clone();

                probes.spawn(async move {
                    let sample = probe_target(&client, timeout, &target, method).await;
                    (target, sample)
                });
            }

            while let Some(joined) = probes.join_next().await {
                match joined {
                    Ok((target, sample)) => {
                        debug!(
                            target = %target,
                            success = sample.success,
                            response_time_ms = sample.response_time,
                            "Probe complete"
                        );
                        self.record(&target, sample);
                    }
                    Err(e) => error!(error = %e, "Probe task failed"),
                }
            }

            tokio::time::sleep(self.interval).await;
        }

        info!("Host monitoring stopped");
    }

    /// Signal the monitoring loop to stop after the current round.
    pub fn stop_monitoring(&self) {
        self.running.store(false, Ordering::SeqCst);
    }

    /// Run a single probe without the loop (useful for checks and tests).
    pub async fn probe_once(&self, target: &str, method: ProbeMethod) -> ProbeSample {
        probe_target(&self.client, self.timeout, target, method).await
    }

    fn record(&self, target: &str, sample: ProbeSample) {
        let mut samples = self.samples.lock().unwrap();
        let ring = samples.entry(target.to_string()).or_default();
        ring.push(sample);

        // Batch trim: keep aggregate computation cheap by trimming only
        // when the ring overflows, down to the most recent half-window.
        if ring.len() > RING_CAP {
            let excess = ring.len() - RING_KEEP;
            ring.drain(..excess);
        }
    }

    /// Number of retained samples for a target.
    pub fn sample_count(&self, target: &str) -> usize {
        let samples = self.samples.lock().unwrap();
        samples.get(target).map_or(0, Vec::len)
    }

    /// Aggregate statistics for one target, if any samples exist.
    pub fn host_stats(&self, target: &str) -> Option<HostStats> {
        let samples = self.samples.lock().unwrap();
        let ring = samples.get(target)?;
        if ring.is_empty() {
            return None;
        }
        Some(compute_host_stats(target, ring))
    }

    /// Aggregate statistics for every monitored target.
    pub fn all_stats(&self) -> HashMap<String, HostStats> {
        let samples = self.samples.lock().unwrap();
        samples
            .iter()
            .filter(|(_, ring)| !ring.is_empty())
            .map(|(target, ring)| (target.clone(), compute_host_stats(target, ring)))
            .collect()
    }
}

impl Default for NetworkMonitor {
    fn default() -> Self {
        Self::new(Duration::from_secs(5), Duration::from_secs(10))
    }
}

fn compute_host_stats(target: &str, ring: &[ProbeSample]) -> HostStats {
    let total_pings = ring.len();
    let successful: Vec<&ProbeSample> = ring.iter().filter(|s| s.success).collect();
    let successful_pings = successful.len();
    let failed_pings = total_pings - successful_pings;
    let success_rate = successful_pings as f64 / total_pings as f64;
    let packet_loss = failed_pings as f64 / total_pings as f64;

    let times: Vec<f64> = successful.iter().map(|s| s.response_time).collect();

    let (avg, min, max, std, jitter) = if times.is_empty() {
        (0.0, 0.0, 0.0, 0.0, 0.0)
    } else {
        let avg = times.iter().sum::<f64>() / times.len() as f64;
        let min = times.iter().copied().fold(f64::INFINITY, f64::min);
        let max = times.iter().copied().fold(f64::NEG_INFINITY, f64::max);

        let std = if times.len() > 1 {
            let variance = times.iter().map(|t| (t - avg).powi(2)).sum::<f64>()
                / (times.len() - 1) as f64;
            variance.sqrt()
        } else {
            0.0
        };

        let jitter = if times.len() > 1 {
            times
                .windows(2)
                .map(|pair| (pair[1] - pair[0]).abs())
                .sum::<f64>()
                / (times.len() - 1) as f64
        } else {
            0.0
        };

        (avg, min, max, std, jitter)
    };

    HostStats {
        host: target.to_string(),
        total_pings,
        successful_pings,
        failed_pings,
        success_rate,
        avg_response_time: avg,
        min_response_time: min,
        max_response_time: max,
        std_response_time: std,
        packet_loss,
        jitter,
    }
}

async fn probe_target(
    client: &reqwest::Client,
    timeout: Duration,
    target: &str,
    method: ProbeMethod,
) -> ProbeSample {
    if method == ProbeMethod::Http
        || target.starts_with("http://")
        || target.starts_with("https://")
    {
        return http_probe(client, timeout, target).await;
    }

    let (host, port) = match target.rsplit_once(':') {
        Some((host, port_str)) => match port_str.parse::<u16>() {
            Ok(port) => (host, port),
            Err(_) => (target, DEFAULT_TCP_PORT),
        },
        None => (target, DEFAULT_TCP_PORT),
    };

    tcp_probe(timeout, host, port).await
}

async fn tcp_probe(timeout: Duration, host: &str, port: u16) -> ProbeSample {
    let timestamp = unix_now();
    let addr = format!("{}:{}", host, port);

    let resolved = match tokio::net::lookup_host(addr.as_str()).await {
        Ok(mut addrs) => addrs.next(),
        Err(_) => None,
    };

    let Some(sock_addr) = resolved else {
        return ProbeSample {
            timestamp,
            host: host.to_string(),
            ip_address: host.to_string(),
            response_time: 0.0,
            success: false,
            error_message: Some(format!("failed to resolve host '{}'", host)),
        };
    };

    let ip_address = sock_addr.ip().to_string();
    let start = Instant::now();

    match tokio::time::timeout(timeout, TcpStream::connect(sock_addr)).await {
        Ok(Ok(stream)) => {
            let response_time = start.elapsed().as_secs_f64() * 1000.0;
            drop(stream);

            ProbeSample {
                timestamp,
                host: host.to_string(),
                ip_address,
                response_time,
                success: true,
                error_message: None,
            }
        }
        Ok(Err(e)) => ProbeSample {
            timestamp,
            host: host.to_string(),
            ip_address,
            response_time: 0.0,
            success: false,
            error_message: Some(e.to_string()),
        },
        Err(_) => ProbeSample {
            timestamp,
            host: host.to_string(),
            ip_address,
            response_time: timeout.as_secs_f64() * 1000.0,
            success: false,
            error_message: Some("connection timeout".to_string()),
        },
    }
}

async fn http_probe(client: &reqwest::Client, timeout: Duration, url: &str) -> ProbeSample {
    let timestamp = unix_now();

    let host = reqwest::Url::parse(url)
        .ok()
        .and_then(|u| u.host_str().map(str::to_string))
        .unwrap_or_else(|| url.to_string());

    let ip_address = match tokio::net::lookup_host((host.as_str(), DEFAULT_TCP_PORT)).await {
        Ok(mut addrs) => addrs
            .next()
            .map(|a| a.ip().to_string())
            .unwrap_or_else(|| "unknown".to_string()),
        Err(_) => "unknown".to_string(),
    };

    let start = Instant::now();

    match client.head(url).timeout(timeout).send().await {
        Ok(response) => {
            let response_time = start.elapsed().as_secs_f64() * 1000.0;
            let status = response.status().as_u16();
            let success = (200..400).contains(&status);

            ProbeSample {
                timestamp,
                host,
                ip_address,
                response_time,
                success,
                error_message: if success {
                    None
                } else {
                    Some(format!("HTTP {}", status))
                },
            }
        }
        Err(e) if e.is_timeout() => ProbeSample {
            timestamp,
            host,
            ip_address,
            response_time: timeout.as_secs_f64() * 1000.0,
            success: false,
            error_message: Some("request timeout".to_string()),
        },
        Err(e) => ProbeSample {
            timestamp,
            host,
            ip_address,
            response_time: 0.0,
            success: false,
            error_message: Some(e.to_string()),
        },
    }
}
