use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use wiremock::matchers::{body_partial_json, header, method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

use llm_loadtest::config::{ConfigFile, EndpointProfile};
use llm_loadtest::executor::RequestExecutor;
use llm_loadtest::prompts::PromptSet;

fn profile_for(base_url: &str) -> EndpointProfile {
    let yaml = format!(
        r#"
api_configs:
  mock:
    name: "Mock LLM"
    base_url: "{base_url}"
    endpoints:
      chat: "/v1/chat"
    headers:
      Authorization: "Bearer {{api_key}}"
      Content-Type: "application/json"
    request_format:
      model: "test-model"
      messages:
        - role: "user"
          content: "{{prompt}}"
"#
    );

    ConfigFile::from_str(&yaml)
        .unwrap()
        .api_config("mock")
        .unwrap()
        .clone()
}

fn prompts(questions: &[&str]) -> Arc<PromptSet> {
    let jsonl: String = questions
        .iter()
        .map(|q| format!("{{\"question\": \"{}\"}}\n", q))
        .collect();
    Arc::new(PromptSet::from_jsonl(&jsonl).unwrap())
}

fn executor_for(base_url: &str, prompt_set: Arc<PromptSet>) -> RequestExecutor {
    let mut params = HashMap::new();
    params.insert("api_key".to_string(), "sk-test".to_string());

    RequestExecutor::new(
        profile_for(base_url),
        prompt_set,
        "chat",
        params,
        Duration::from_secs(5),
    )
    .unwrap()
}

#[tokio::test]
async fn successful_request_parses_completion_token_schema() {
    let server = MockServer::start().await;
    let body = r#"{"choices":[],"usage":{"prompt_tokens":10,"completion_tokens":20,"total_tokens":30}}"#;

    Mock::given(method("POST"))
        .and(path("/v1/chat"))
        .and(header("Authorization", "Bearer sk-test"))
        .and(body_partial_json(serde_json::json!({
            "model": "test-model",
            "messages": [{"role": "user", "content": "hello"}]
        })))
        .respond_with(ResponseTemplate::new(200).set_body_string(body))
        .expect(1)
        .mount(&server)
        .await;

    let executor = executor_for(&server.uri(), prompts(&["hello"]));
    let result = executor.execute().await;

    assert!(result.success);
    assert_eq!(result.status_code, 200);
    assert_eq!(result.prompt, "hello");
    assert_eq!(
        (result.input_tokens, result.output_tokens, result.total_tokens),
        (10, 20, 30)
    );
    assert_eq!(result.content_length, body.len() as u64);
    assert_eq!(result.response_content, body);
    assert!(result.error_message.is_none());
    assert!(result.response_time > 0.0);
}

#[tokio::test]
async fn successful_request_parses_input_output_token_schema() {
    let server = MockServer::start().await;
    let body = r#"{"content":[],"usage":{"input_tokens":10,"output_tokens":20}}"#;

    Mock::given(method("POST"))
        .and(path("/v1/chat"))
        .respond_with(ResponseTemplate::new(200).set_body_string(body))
        .mount(&server)
        .await;

    let executor = executor_for(&server.uri(), prompts(&["hello"]));
    let result = executor.execute().await;

    assert!(result.success);
    assert_eq!(
        (result.input_tokens, result.output_tokens, result.total_tokens),
        (10, 20, 30)
    );
}

#[tokio::test]
async fn unparseable_body_yields_zero_tokens_without_failing() {
    let server = MockServer::start().await;

    Mock::given(method("POST"))
        .and(path("/v1/chat"))
        .respond_with(ResponseTemplate::new(200).set_body_string("{}"))
        .mount(&server)
        .await;

    let executor = executor_for(&server.uri(), prompts(&["hello"]));
    let result = executor.execute().await;

    assert!(result.success);
    assert_eq!(
        (result.input_tokens, result.output_tokens, result.total_tokens),
        (0, 0, 0)
    );
}

#[tokio::test]
async fn non_success_status_is_not_retried() {
    let server = MockServer::start().await;

    // expect(1) fails the test on drop if a retry sends a second request.
    Mock::given(method("POST"))
        .and(path("/v1/chat"))
        .respond_with(ResponseTemplate::new(500).set_body_string("upstream exploded"))
        .expect(1)
        .mount(&server)
        .await;

    let executor = executor_for(&server.uri(), prompts(&["hello"]));
    let result = executor.execute().await;

    assert!(!result.success);
    assert_eq!(result.status_code, 500);
    // The status code carries the failure; no error message is attached.
    assert!(result.error_message.is_none());
    assert_eq!(result.content_length, "upstream exploded".len() as u64);
}

#[tokio::test]
async fn rate_limited_status_preserved() {
    let server = MockServer::start().await;

    Mock::given(method("POST"))
        .and(path("/v1/chat"))
        .respond_with(ResponseTemplate::new(429))
        .expect(1)
        .mount(&server)
        .await;

    let executor = executor_for(&server.uri(), prompts(&["hello"]));
    let result = executor.execute().await;

    assert!(!result.success);
    assert_eq!(result.status_code, 429);
}

#[tokio::test]
async fn transport_failure_retries_exactly_three_attempts() {
    // A listener that accepts and immediately closes every connection:
    // each attempt fails at the transport level and should be retried.
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();

    let connections = Arc::new(AtomicUsize::new(0));
    let task_connections = Arc::clone(&connections);
    tokio::spawn(async move {
        loop {
            if let Ok((stream, _)) = listener.accept().await {
                task_connections.fetch_add(1, Ordering::SeqCst);
                drop(stream);
            }
        }
    });

    let executor = executor_for(&format!("http://{}", addr), prompts(&["hello"]));
    let result = executor.execute().await;

    assert!(!result.success);
    assert_eq!(result.status_code, 0);
    assert!(result.error_message.is_some());
    assert_eq!(connections.load(Ordering::SeqCst), 3);
    // Two backoff sleeps (1s + 2s) sit between the three attempts.
    assert!(result.response_time >= 3.0);
}

#[tokio::test]
async fn render_failure_becomes_failed_outcome() {
    // No api_key in params, so the Authorization template cannot render.
    let executor = RequestExecutor::new(
        profile_for("http://127.0.0.1:1"),
        prompts(&["hello"]),
        "chat",
        HashMap::new(),
        Duration::from_secs(5),
    )
    .unwrap();

    let result = executor.execute().await;

    assert!(!result.success);
    assert_eq!(result.status_code, 0);
    assert!(result
        .error_message
        .as_deref()
        .unwrap()
        .contains("Unresolved template placeholder"));
}

#[tokio::test]
async fn executor_draws_prompts_in_rotation() {
    let server = MockServer::start().await;

    Mock::given(method("POST"))
        .and(path("/v1/chat"))
        .respond_with(ResponseTemplate::new(200).set_body_string("{}"))
        .mount(&server)
        .await;

    let executor = executor_for(&server.uri(), prompts(&["a", "b", "c"]));

    let mut drawn = Vec::new();
    for _ in 0..4 {
        drawn.push(executor.execute().await.prompt);
    }

    assert_eq!(drawn, vec!["a", "b", "c", "a"]);
}
