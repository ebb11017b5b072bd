use std::collections::HashMap;
use std::io::Write;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use clap::{Parser, Subcommand};
use tracing::warn;
use tracing_subscriber::EnvFilter;

use llm_loadtest::analyzer::SessionAnalyzer;
use llm_loadtest::config::{ConfigFile, EndpointProfile, TestConfig};
use llm_loadtest::engine::LoadTestEngine;
use llm_loadtest::executor::RequestExecutor;
use llm_loadtest::monitor::{NetworkMonitor, ProbeMethod};
use llm_loadtest::prompts::PromptSet;
use llm_loadtest::stats::StageStats;
use llm_loadtest::store::SessionStore;
use llm_loadtest::stress::StressTestEngine;
use llm_loadtest::utils::{generate_session_id, parse_level_list, unix_now};

type CliError = Box<dyn std::error::Error + Send + Sync>;

#[derive(Parser)]
#[command(
    name = "llm_loadtest",
    version,
    about = "Load and stress testing for LLM inference endpoints"
)]
struct Cli {
    /// Path to the YAML configuration file
    #[arg(long, default_value = "config/config.yaml")]
    config: PathBuf,

    /// Path to the JSONL prompt file
    #[arg(long, default_value = "data/prompts.jsonl")]
    prompts: PathBuf,

    /// Path to the results database
    #[arg(long, default_value = "data/test_results.db")]
    database: PathBuf,

    #[command(subcommand)]
    command: Command,
}

/// File locations shared by every subcommand.
struct Paths {
    config: PathBuf,
    prompts: PathBuf,
    database: PathBuf,
}

#[derive(Subcommand)]
enum Command {
    /// Run a staged load test and persist the session
    Load {
        /// API profile name from the config file
        #[arg(short, long)]
        api: String,

        /// Test config name from the config file
        #[arg(short, long, default_value = "default")]
        test_config: String,

        /// API key substituted into request templates
        #[arg(short = 'k', long)]
        api_key: String,

        /// Endpoint kind to drive
        #[arg(short, long, default_value = "chat")]
        endpoint: String,

        /// Override concurrency levels, comma separated (e.g. 1,5,10,20)
        #[arg(long)]
        concurrent_levels: Option<String>,

        /// Override requests per level
        #[arg(long)]
        requests_per_level: Option<usize>,

        /// Override per-request timeout in seconds
        #[arg(long)]
        timeout: Option<u64>,

        /// Use a fixed session id instead of a generated one
        #[arg(long)]
        session_id: Option<String>,

        /// Azure resource name, for profiles that template it
        #[arg(long)]
        resource_name: Option<String>,

        /// Azure deployment name, for profiles that template it
        #[arg(long)]
        deployment_name: Option<String>,

        /// Monitor endpoint-host reachability during the run
        #[arg(long)]
        monitor: bool,
    },

    /// Run a time-bounded stress test at fixed concurrency
    Stress {
        #[arg(short, long)]
        api: String,

        #[arg(short = 'k', long)]
        api_key: String,

        /// Maximum concurrent requests
        #[arg(short = 'c', long, default_value_t = 50)]
        max_concurrent: usize,

        /// Test duration in seconds
        #[arg(short, long, default_value_t = 300)]
        duration: u64,

        #[arg(short, long, default_value = "chat")]
        endpoint: String,

        /// Per-request timeout in seconds
        #[arg(long, default_value_t = 30)]
        timeout: u64,

        #[arg(long)]
        resource_name: Option<String>,

        #[arg(long)]
        deployment_name: Option<String>,
    },

    /// List stored test sessions, newest first
    History {
        /// Number of sessions to show
        #[arg(short, long, default_value_t = 10)]
        limit: usize,
    },

    /// Print the stored summary for one session
    Summary { session_id: String },

    /// List available API profiles and test configs
    Configs,
}

#[tokio::main]
async fn main() -> Result<(), CliError> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let Cli {
        config: config_path,
        prompts: prompts_path,
        database: database_path,
        command,
    } = Cli::parse();
    let paths = Paths {
        config: config_path,
        prompts: prompts_path,
        database: database_path,
    };

    match command {
        Command::Load {
            api,
            test_config,
            api_key,
            endpoint,
            concurrent_levels,
            requests_per_level,
            timeout,
            session_id,
            resource_name,
            deployment_name,
            monitor,
        } => {
            let config = ConfigFile::from_file(&paths.config)?;
            let profile = config.api_config(&api)?.clone();
            let mut plan = config.test_config(&test_config)?.clone();

            if let Some(levels) = concurrent_levels {
                plan.concurrent_levels = parse_level_list(&levels)?;
            }
            if let Some(n) = requests_per_level {
                plan.requests_per_level = n;
            }
            if let Some(t) = timeout {
                plan.timeout = t;
            }
            validate_plan(&plan)?;

            let params = template_params(api_key, resource_name, deployment_name);

            run_load(
                &paths,
                &api,
                &test_config,
                profile,
                plan,
                endpoint,
                params,
                session_id,
                monitor,
            )
            .await
        }

        Command::Stress {
            api,
            api_key,
            max_concurrent,
            duration,
            endpoint,
            timeout,
            resource_name,
            deployment_name,
        } => {
            let config = ConfigFile::from_file(&paths.config)?;
            let profile = config.api_config(&api)?.clone();

            if max_concurrent == 0 {
                return Err("--max-concurrent must be greater than zero".into());
            }

            let params = template_params(api_key, resource_name, deployment_name);

            run_stress(
                &paths,
                &api,
                profile,
                endpoint,
                params,
                max_concurrent,
                Duration::from_secs(duration),
                Duration::from_secs(timeout),
            )
            .await
        }

        Command::History { limit } => run_history(&paths, limit),

        Command::Summary { session_id } => run_summary(&paths, &session_id),

        Command::Configs => run_configs(&paths),
    }
}

fn template_params(
    api_key: String,
    resource_name: Option<String>,
    deployment_name: Option<String>,
) -> HashMap<String, String> {
    let mut params = HashMap::new();
    params.insert("api_key".to_string(), api_key);
    if let Some(resource_name) = resource_name {
        params.insert("resource_name".to_string(), resource_name);
    }
    if let Some(deployment_name) = deployment_name {
        params.insert("deployment_name".to_string(), deployment_name);
    }
    params
}

fn validate_plan(plan: &TestConfig) -> Result<(), CliError> {
    if plan.concurrent_levels.is_empty() {
        return Err("concurrent_levels cannot be empty".into());
    }
    if plan.concurrent_levels.iter().any(|&level| level == 0) {
        return Err("concurrent_levels must all be greater than zero".into());
    }
    if plan.requests_per_level == 0 {
        return Err("requests_per_level must be greater than zero".into());
    }
    Ok(())
}

#[allow(clippy::too_many_arguments)]
async fn run_load(
    paths: &Paths,
    api: &str,
    test_config: &str,
    profile: EndpointProfile,
    plan: TestConfig,
    endpoint: String,
    params: HashMap<String, String>,
    session_id: Option<String>,
    monitor: bool,
) -> Result<(), CliError> {
    let prompts = Arc::new(PromptSet::from_file(&paths.prompts)?);

    // Surface unresolved placeholders before any stage runs.
    let probe = profile.render(&endpoint, "", &params)?;

    let session_id = session_id.unwrap_or_else(generate_session_id);
    println!("Session: {}", session_id);
    println!("API: {} | test config: {}", profile.name, plan.name);
    println!(
        "Levels: {:?} | requests per level: {} | timeout: {}s",
        plan.concurrent_levels, plan.requests_per_level, plan.timeout
    );

    let store = SessionStore::open(&paths.database)?;

    let monitoring = if monitor {
        start_host_monitoring(&probe.url)
    } else {
        None
    };

    let executor = RequestExecutor::new(
        profile,
        Arc::clone(&prompts),
        endpoint.clone(),
        params,
        Duration::from_secs(plan.timeout),
    )?;

    let mut engine = LoadTestEngine::new(executor);
    engine.set_progress_callback(|completed, total| {
        print!("\r  {}/{} requests", completed, total);
        let _ = std::io::stdout().flush();
    });

    let start_time = unix_now();
    let stages = engine
        .run_load_test(
            &plan.concurrent_levels,
            plan.requests_per_level,
            Duration::from_secs(plan.ramp_up_time),
            Duration::from_secs(plan.cool_down_time),
        )
        .await;
    let end_time = unix_now();
    println!();

    let host_stats = match monitoring {
        Some((monitor, handle)) => {
            monitor.stop_monitoring();
            handle.abort();
            let stats = monitor.all_stats();
            if stats.is_empty() {
                None
            } else {
                Some(stats)
            }
        }
        None => None,
    };

    let metadata = serde_json::json!({
        "endpoint": endpoint,
        "prompt_count": prompts.count(),
    });

    store.save_session(
        &session_id,
        api,
        test_config,
        start_time,
        end_time,
        &stages,
        host_stats.as_ref(),
        Some(metadata),
    )?;

    println!("\nTest finished in {:.1}s", end_time - start_time);
    print_stage_table(&stages);

    if let Some(stats) = &host_stats {
        for (host, host_stat) in stats {
            println!(
                "\nHost {}: {:.1}% reachable, {:.1}ms avg, {:.1}ms jitter",
                host,
                host_stat.success_rate * 100.0,
                host_stat.avg_response_time,
                host_stat.jitter
            );
        }
    }

    let analyzer = SessionAnalyzer::new(store);
    if let Some(impact) = analyzer.concurrency_impact(&session_id)? {
        println!(
            "\nOptimal concurrency: {} ({:.1} req/s at {:.2}s mean latency)",
            impact.optimal.concurrent_level,
            impact.optimal.requests_per_second,
            impact.optimal.avg_response_time
        );
        if let Some(decline) = impact.throughput_decline_point {
            println!(
                "Throughput declines beyond concurrency {}",
                decline.concurrent_level
            );
        }
    }

    Ok(())
}

#[allow(clippy::too_many_arguments)]
async fn run_stress(
    paths: &Paths,
    api: &str,
    profile: EndpointProfile,
    endpoint: String,
    params: HashMap<String, String>,
    max_concurrent: usize,
    duration: Duration,
    timeout: Duration,
) -> Result<(), CliError> {
    let prompts = Arc::new(PromptSet::from_file(&paths.prompts)?);
    profile.render(&endpoint, "", &params)?;

    let session_id = generate_session_id();
    println!("Session: {}", session_id);
    println!(
        "API: {} | max concurrency: {} | duration: {}s",
        profile.name,
        max_concurrent,
        duration.as_secs()
    );

    let store = SessionStore::open(&paths.database)?;

    let executor = RequestExecutor::new(
        profile,
        Arc::clone(&prompts),
        endpoint.clone(),
        params,
        timeout,
    )?;

    let mut engine = StressTestEngine::new(executor);
    engine.set_progress_callback(|elapsed, total| {
        print!("\r  {}s / {}s", elapsed, total);
        let _ = std::io::stdout().flush();
    });

    let start_time = unix_now();
    let stage = engine.run_stress(max_concurrent, duration).await;
    let end_time = unix_now();
    println!();

    let metadata = serde_json::json!({
        "endpoint": endpoint,
        "mode": "stress",
        "prompt_count": prompts.count(),
    });

    let stages = vec![stage];
    store.save_session(
        &session_id,
        api,
        "stress",
        start_time,
        end_time,
        &stages,
        None,
        Some(metadata),
    )?;

    let stage = &stages[0];
    println!("\nTotal requests: {}", stage.total_requests);
    println!("Successful: {}", stage.successful_requests);
    println!("Success rate: {:.1}%", (1.0 - stage.error_rate) * 100.0);
    println!("Avg response time: {:.2}s", stage.avg_response_time);
    println!("Avg RPS: {:.1}", stage.requests_per_second);
    println!("Hung requests: {}", stage.timeout_count);

    Ok(())
}

fn run_history(paths: &Paths, limit: usize) -> Result<(), CliError> {
    let store = SessionStore::open(&paths.database)?;
    let sessions = store.list_sessions(limit)?;

    if sessions.is_empty() {
        println!("No stored sessions.");
        return Ok(());
    }

    println!(
        "{:<28} {:<12} {:<19} {:>9} {:>9} {:>10}",
        "Session", "API", "Started", "Requests", "Success", "Avg (s)"
    );

    for session in sessions {
        let success_rate = if session.total_requests > 0 {
            session.successful_requests as f64 / session.total_requests as f64 * 100.0
        } else {
            0.0
        };

        println!(
            "{:<28} {:<12} {:<19} {:>9} {:>8.1}% {:>10.2}",
            truncated(&session.session_id, 28),
            truncated(&session.api_name, 12),
            format_timestamp(session.start_time),
            session.total_requests,
            success_rate,
            session.avg_response_time
        );
    }

    Ok(())
}

fn run_summary(paths: &Paths, session_id: &str) -> Result<(), CliError> {
    let store = SessionStore::open(&paths.database)?;
    let analyzer = SessionAnalyzer::new(store);

    let Some(summary) = analyzer.summary(session_id)? else {
        println!("No data for session '{}'.", session_id);
        return Ok(());
    };

    println!("Session: {}", summary.session.session_id);
    println!(
        "API: {} | test config: {}",
        summary.session.api_name, summary.session.test_config
    );
    println!("Started: {}", format_timestamp(summary.session.start_time));
    println!();
    println!("Total requests: {}", summary.total_requests);
    println!("Success rate: {:.1}%", summary.success_rate * 100.0);
    println!(
        "Latency: min {:.2}s / mean {:.2}s / max {:.2}s (mean p95 {:.2}s)",
        summary.min_response_time,
        summary.avg_response_time,
        summary.max_response_time,
        summary.avg_p95_response_time
    );
    println!("Total tokens: {}", summary.total_tokens);
    println!("Hung requests: {}", summary.total_timeouts);

    if !summary.error_distribution.is_empty() {
        println!("\nErrors:");
        for error in &summary.error_distribution {
            println!("  {:>6}  {}", error.count, error.error_message);
        }
    }

    Ok(())
}

fn run_configs(paths: &Paths) -> Result<(), CliError> {
    let config = ConfigFile::from_file(&paths.config)?;

    println!("API profiles:");
    for name in config.api_names() {
        let profile = config.api_config(name)?;
        println!("  {}: {} ({})", name, profile.name, profile.base_url);
    }

    println!("\nTest configs:");
    for name in config.test_names() {
        let plan = config.test_config(name)?;
        println!(
            "  {}: levels {:?}, {} requests per level, {}s timeout",
            name, plan.concurrent_levels, plan.requests_per_level, plan.timeout
        );
    }

    Ok(())
}

/// Spawn session-scoped reachability monitoring against the target's
/// origin. Returns the monitor and its task handle, or None when the
/// URL has no usable host.
fn start_host_monitoring(
    url: &str,
) -> Option<(Arc<NetworkMonitor>, tokio::task::JoinHandle<()>)> {
    let origin = match reqwest::Url::parse(url) {
        Ok(parsed) => parsed.origin().ascii_serialization(),
        Err(e) => {
            warn!(error = %e, "Cannot monitor host: target URL did not parse");
            return None;
        }
    };
    if origin == "null" {
        warn!("Cannot monitor host: target URL has no origin");
        return None;
    }

    println!("Monitoring host: {}", origin);

    let monitor = Arc::new(NetworkMonitor::default());
    let task_monitor = Arc::clone(&monitor);
    let handle = tokio::spawn(async move {
        task_monitor
            .start_monitoring(&[origin], ProbeMethod::Http)
            .await;
    });

    Some((monitor, handle))
}

fn print_stage_table(stages: &[StageStats]) {
    println!(
        "{:>11} {:>9} {:>9} {:>12} {:>9} {:>10}",
        "Concurrency", "Requests", "Success", "Avg latency", "RPS", "Tokens/s"
    );
    for stage in stages {
        println!(
            "{:>11} {:>9} {:>8.1}% {:>11.2}s {:>9.1} {:>10.1}",
            stage.concurrent_level,
            stage.total_requests,
            (1.0 - stage.error_rate) * 100.0,
            stage.avg_response_time,
            stage.requests_per_second,
            stage.tokens_per_second
        );
    }
}

fn format_timestamp(secs: f64) -> String {
    chrono::DateTime::from_timestamp(secs as i64, 0)
        .map(|dt| dt.format("%Y-%m-%d %H:%M:%S").to_string())
        .unwrap_or_else(|| format!("{:.0}", secs))
}

fn truncated(s: &str, max: usize) -> String {
    if s.len() <= max {
        s.to_string()
    } else {
        format!("{}...", &s[..max.saturating_sub(3)])
    }
}
