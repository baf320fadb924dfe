use std::time::Duration;

use nexus_core::{agents, bootstrap, LlmRouter, ModelTarget, NexusConfig};
use nexus_provider::ProviderError;
use wiremock::matchers::{header, method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

fn config_for(server: &MockServer, keys: &str) -> NexusConfig {
    let yaml = format!(
        r#"
app:
  name: nexus
  env: test
providers:
  - id: gemini
    type: gemini
    base_url: {uri}
pools:
  - id: primary
    provider: gemini
    keys: ["{keys}"]
agents:
  default:
    pool: primary
    model: gemini-test
"#,
        uri = server.uri()
    );
    serde_yaml::from_str(&yaml).unwrap()
}

fn reply(text: &str) -> ResponseTemplate {
    ResponseTemplate::new(200).set_body_json(serde_json::json!({
        "candidates": [{"content": {"role": "model", "parts": [{"text": text}]}}]
    }))
}

fn quota_exceeded() -> ResponseTemplate {
    ResponseTemplate::new(429).set_body_json(serde_json::json!({
        "error": {"code": 429, "status": "RESOURCE_EXHAUSTED", "message": "You exceeded your current quota"}
    }))
}

#[tokio::test]
async fn router_moves_past_an_exhausted_key() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/models/gemini-test:generateContent"))
        .and(header("x-goog-api-key", "spent-key"))
        .respond_with(quota_exceeded())
        .expect(1)
        .mount(&server)
        .await;
    Mock::given(method("POST"))
        .and(path("/models/gemini-test:generateContent"))
        .and(header("x-goog-api-key", "fresh-key"))
        .respond_with(reply("pong"))
        .expect(2)
        .mount(&server)
        .await;

    let config = config_for(&server, "spent-key, fresh-key");
    let router = LlmRouter::from_config(&config)
        .unwrap()
        .with_backoff(Duration::ZERO);
    let target = ModelTarget::new("primary", "gemini-test");

    assert_eq!(router.complete_text(&target, None, "ping").await.unwrap(), "pong");
    // the spent key stays in cooldown, so the next call goes straight to the fresh one
    assert_eq!(router.complete_text(&target, None, "ping").await.unwrap(), "pong");

    let status = &router.pool_statuses().await[0];
    assert_eq!(status.size, 2);
    assert_eq!(status.cooling_down, 1);
}

#[tokio::test]
async fn all_keys_exhausted_is_a_typed_error() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .respond_with(quota_exceeded())
        .expect(2)
        .mount(&server)
        .await;

    let config = config_for(&server, "a-key,b-key");
    let router = LlmRouter::from_config(&config)
        .unwrap()
        .with_backoff(Duration::ZERO);

    let err = router
        .complete_text(&ModelTarget::new("primary", "gemini-test"), None, "ping")
        .await
        .unwrap_err();
    assert!(err.downcast_ref::<ProviderError>().is_some());

    let again = router
        .complete_text(&ModelTarget::new("primary", "gemini-test"), None, "ping")
        .await
        .unwrap_err();
    assert!(again
        .downcast_ref::<ProviderError>()
        .is_some_and(ProviderError::is_exhausted));
}

#[tokio::test]
async fn bootstrapped_dispatcher_answers_over_http() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/models/gemini-test:generateContent"))
        .respond_with(reply(r#"{"type": "final_answer", "content": "Hello from the mock!"}"#))
        .mount(&server)
        .await;

    let root = tempfile::tempdir().unwrap();
    let nexus = bootstrap(root.path(), config_for(&server, "only-key")).unwrap();

    let resp = nexus.dispatcher.handle_query("hi", "s1").await;

    assert_eq!(resp.agent_used, agents::QUICK_RESPONSE);
    assert_eq!(resp.answer, "Hello from the mock!");
    assert!(!resp.error);
    assert!(root.path().join("data/conversation.db").exists());
    assert_eq!(nexus.store.last_user_query("s1").await.unwrap(), "hi");
}
