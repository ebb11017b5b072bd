use std::sync::Arc;
use std::time::Duration;

use wiremock::matchers::method;
use wiremock::{Mock, MockServer, ResponseTemplate};

use llm_loadtest::monitor::{NetworkMonitor, ProbeMethod};

fn quick_monitor() -> NetworkMonitor {
    NetworkMonitor::new(Duration::from_millis(100), Duration::from_secs(2))
}

#[tokio::test]
async fn http_probe_succeeds_on_2xx() {
    let server = MockServer::start().await;

    Mock::given(method("HEAD"))
        .respond_with(ResponseTemplate::new(200))
        .mount(&server)
        .await;

    let monitor = quick_monitor();
    let sample = monitor.probe_once(&server.uri(), ProbeMethod::Http).await;

    assert!(sample.success, "probe failed: {:?}", sample.error_message);
    assert_eq!(sample.host, "127.0.0.1");
    assert!(sample.error_message.is_none());
    assert!(sample.response_time >= 0.0);
}

#[tokio::test]
async fn http_probe_treats_redirects_as_reachable() {
    let server = MockServer::start().await;

    Mock::given(method("HEAD"))
        .respond_with(ResponseTemplate::new(302))
        .mount(&server)
        .await;

    let monitor = quick_monitor();
    let sample = monitor.probe_once(&server.uri(), ProbeMethod::Http).await;

    assert!(sample.success);
}

#[tokio::test]
async fn http_probe_records_server_errors() {
    let server = MockServer::start().await;

    Mock::given(method("HEAD"))
        .respond_with(ResponseTemplate::new(500))
        .mount(&server)
        .await;

    let monitor = quick_monitor();
    let sample = monitor.probe_once(&server.uri(), ProbeMethod::Http).await;

    assert!(!sample.success);
    assert_eq!(sample.error_message.as_deref(), Some("HTTP 500"));
}

#[tokio::test]
async fn url_targets_probe_over_http_even_when_tcp_requested() {
    let server = MockServer::start().await;

    Mock::given(method("HEAD"))
        .respond_with(ResponseTemplate::new(200))
        .expect(1)
        .mount(&server)
        .await;

    let monitor = quick_monitor();
    let sample = monitor.probe_once(&server.uri(), ProbeMethod::Tcp).await;

    assert!(sample.success);
}

#[tokio::test]
async fn monitoring_loop_collects_samples_until_stopped() {
    let server = MockServer::start().await;

    Mock::given(method("HEAD"))
        .respond_with(ResponseTemplate::new(200))
        .mount(&server)
        .await;

    let monitor = Arc::new(quick_monitor());
    let target = server.uri();

    let loop_monitor = Arc::clone(&monitor);
    let loop_target = target.clone();
    let handle = tokio::spawn(async move {
        loop_monitor
            .start_monitoring(&[loop_target], ProbeMethod::Http)
            .await;
    });

    tokio::time::sleep(Duration::from_millis(350)).await;
    monitor.stop_monitoring();

    // The loop finishes its in-flight round and exits.
    tokio::time::timeout(Duration::from_secs(2), handle)
        .await
        .expect("monitoring loop did not stop")
        .unwrap();

    assert!(monitor.sample_count(&target) >= 1);

    let stats = monitor.host_stats(&target).unwrap();
    assert_eq!(stats.success_rate, 1.0);
    assert_eq!(stats.packet_loss, 0.0);
    assert_eq!(stats.failed_pings, 0);

    let all = monitor.all_stats();
    assert_eq!(all.len(), 1);
    assert!(all.contains_key(&target));
}
