//! HTTP-level tests for the ComfyUI worker backend against a mock server.

use assert_matches::assert_matches;
use renderq_comfyui::{BackendError, ComfyUIApi, WorkerBackend};
use serde_json::json;
use wiremock::matchers::{body_partial_json, method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

async fn backend() -> (MockServer, ComfyUIApi) {
    let server = MockServer::start().await;
    let api = ComfyUIApi::new(server.uri());
    (server, api)
}

// ---------------------------------------------------------------------------
// Health
// ---------------------------------------------------------------------------

#[tokio::test]
async fn health_check_true_when_system_stats_answers() {
    let (server, api) = backend().await;
    Mock::given(method("GET"))
        .and(path("/system_stats"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({"system": {}})))
        .mount(&server)
        .await;

    assert!(api.health_check().await);
}

#[tokio::test]
async fn health_check_false_on_server_error() {
    let (server, api) = backend().await;
    Mock::given(method("GET"))
        .and(path("/system_stats"))
        .respond_with(ResponseTemplate::new(503))
        .mount(&server)
        .await;

    assert!(!api.health_check().await);
}

#[tokio::test]
async fn health_check_false_when_unreachable() {
    let api = ComfyUIApi::new("http://127.0.0.1:9".into());
    assert!(!api.health_check().await);
}

// ---------------------------------------------------------------------------
// Submit
// ---------------------------------------------------------------------------

#[tokio::test]
async fn submit_returns_prompt_id() {
    let (server, api) = backend().await;
    Mock::given(method("POST"))
        .and(path("/prompt"))
        .and(body_partial_json(json!({"prompt": {"3": {"class_type": "KSampler"}}})))
        .respond_with(
            ResponseTemplate::new(200)
                .set_body_json(json!({"prompt_id": "p-1", "number": 4, "node_errors": {}})),
        )
        .expect(1)
        .mount(&server)
        .await;

    let id = api
        .submit(&json!({"3": {"class_type": "KSampler"}}))
        .await
        .unwrap();
    assert_eq!(id, "p-1");
}

#[tokio::test]
async fn submit_validation_failure_is_rejected() {
    let (server, api) = backend().await;
    Mock::given(method("POST"))
        .and(path("/prompt"))
        .respond_with(
            ResponseTemplate::new(400)
                .set_body_json(json!({"error": {"type": "prompt_outputs_failed_validation"}})),
        )
        .mount(&server)
        .await;

    let err = api.submit(&json!({})).await.unwrap_err();
    assert_matches!(err, BackendError::Rejected(msg) if msg.contains("400"));
}

#[tokio::test]
async fn submit_server_error_is_unreachable() {
    let (server, api) = backend().await;
    Mock::given(method("POST"))
        .and(path("/prompt"))
        .respond_with(ResponseTemplate::new(502).set_body_string("bad gateway"))
        .mount(&server)
        .await;

    let err = api.submit(&json!({})).await.unwrap_err();
    assert_matches!(err, BackendError::Unreachable(_));
}

// ---------------------------------------------------------------------------
// Queue and history
// ---------------------------------------------------------------------------

#[tokio::test]
async fn queue_status_lists_running_and_pending() {
    let (server, api) = backend().await;
    Mock::given(method("GET"))
        .and(path("/queue"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "queue_running": [[1, "run-1", {}, {}, []]],
            "queue_pending": [[2, "pend-1", {}, {}, []]]
        })))
        .mount(&server)
        .await;

    let queue = api.queue_status().await.unwrap();
    assert!(queue.contains("run-1"));
    assert!(queue.contains("pend-1"));
    assert!(!queue.contains("done-1"));
}

#[tokio::test]
async fn result_is_none_before_history_exists() {
    let (server, api) = backend().await;
    Mock::given(method("GET"))
        .and(path("/history/p-1"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({})))
        .mount(&server)
        .await;

    assert!(api.result("p-1").await.unwrap().is_none());
}

#[tokio::test]
async fn result_carries_artifacts_with_view_urls() {
    let (server, api) = backend().await;
    Mock::given(method("GET"))
        .and(path("/history/p-1"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "p-1": {
                "outputs": {"9": {"images": [{"filename": "out.png", "subfolder": "", "type": "output"}]}},
                "status": {"status_str": "success", "completed": true, "messages": []}
            }
        })))
        .mount(&server)
        .await;

    let result = api.result("p-1").await.unwrap().unwrap();
    assert!(result.has_output());
    assert!(result.completed);
    assert_eq!(result.status.as_deref(), Some("success"));
    assert_eq!(result.artifacts[0].filename, "out.png");
    assert!(result.artifacts[0]
        .url
        .starts_with(&format!("{}/view?filename=out.png", server.uri())));
}

#[tokio::test]
async fn result_reports_execution_error() {
    let (server, api) = backend().await;
    Mock::given(method("GET"))
        .and(path("/history/p-1"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "p-1": {
                "outputs": {},
                "status": {
                    "status_str": "error",
                    "completed": false,
                    "messages": [["execution_error", {"exception_message": "model missing"}]]
                }
            }
        })))
        .mount(&server)
        .await;

    let result = api.result("p-1").await.unwrap().unwrap();
    assert!(!result.has_output());
    assert_eq!(result.error.as_deref(), Some("model missing"));
}

#[tokio::test]
async fn malformed_history_is_a_protocol_error() {
    let (server, api) = backend().await;
    Mock::given(method("GET"))
        .and(path("/history/p-1"))
        .respond_with(ResponseTemplate::new(200).set_body_string("<html>"))
        .mount(&server)
        .await;

    let err = api.result("p-1").await.unwrap_err();
    assert_matches!(err, BackendError::Protocol(_));
}

// ---------------------------------------------------------------------------
// Cancel
// ---------------------------------------------------------------------------

#[tokio::test]
async fn cancel_interrupts_a_running_job() {
    let (server, api) = backend().await;
    Mock::given(method("POST"))
        .and(path("/queue"))
        .and(body_partial_json(json!({"delete": ["run-1"]})))
        .respond_with(ResponseTemplate::new(200))
        .expect(1)
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path("/queue"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "queue_running": [[1, "run-1", {}, {}, []]],
            "queue_pending": []
        })))
        .mount(&server)
        .await;
    Mock::given(method("POST"))
        .and(path("/interrupt"))
        .respond_with(ResponseTemplate::new(200))
        .expect(1)
        .mount(&server)
        .await;

    api.cancel("run-1").await.unwrap();
}

#[tokio::test]
async fn cancel_skips_interrupt_for_queued_job() {
    let (server, api) = backend().await;
    Mock::given(method("POST"))
        .and(path("/queue"))
        .respond_with(ResponseTemplate::new(200))
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path("/queue"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "queue_running": [],
            "queue_pending": [[2, "pend-1", {}, {}, []]]
        })))
        .mount(&server)
        .await;
    Mock::given(method("POST"))
        .and(path("/interrupt"))
        .respond_with(ResponseTemplate::new(200))
        .expect(0)
        .mount(&server)
        .await;

    api.cancel("pend-1").await.unwrap();
}
