//! Webhook sink delivery against a mock endpoint.

use std::time::Duration;

use chrono::Utc;
use renderq_core::artifact::ArtifactRef;
use renderq_events::{DeliveryMetadata, NotificationError, NotificationSink, WebhookSink};
use serde_json::json;
use wiremock::matchers::{body_partial_json, method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

fn metadata() -> DeliveryMetadata {
    DeliveryMetadata {
        request_id: 11,
        worker_id: "remote-0".into(),
        external_job_id: "prompt-1".into(),
        completed_at: Utc::now(),
        elapsed_secs: 42,
    }
}

fn artifact() -> ArtifactRef {
    ArtifactRef {
        node_id: "9".into(),
        filename: "out.png".into(),
        subfolder: String::new(),
        folder_type: "output".into(),
        url: "http://gpu/view?filename=out.png".into(),
    }
}

fn sink(server: &MockServer) -> WebhookSink {
    WebhookSink::new(format!("{}/hooks/done", server.uri()))
        .unwrap()
        .with_retry_delays(vec![Duration::ZERO; 3])
}

#[tokio::test]
async fn posts_artifacts_and_metadata() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/hooks/done"))
        .and(body_partial_json(json!({
            "owner_id": "alice",
            "artifacts": [{"filename": "out.png"}],
            "request_id": 11,
            "worker_id": "remote-0",
            "external_job_id": "prompt-1"
        })))
        .respond_with(ResponseTemplate::new(204))
        .expect(1)
        .mount(&server)
        .await;

    sink(&server)
        .deliver(&[artifact()], "alice", &metadata())
        .await
        .unwrap();
}

#[tokio::test]
async fn retries_until_endpoint_recovers() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/hooks/done"))
        .respond_with(ResponseTemplate::new(503))
        .up_to_n_times(2)
        .expect(2)
        .mount(&server)
        .await;
    Mock::given(method("POST"))
        .and(path("/hooks/done"))
        .respond_with(ResponseTemplate::new(200))
        .expect(1)
        .mount(&server)
        .await;

    sink(&server)
        .deliver(&[artifact()], "alice", &metadata())
        .await
        .unwrap();
}

#[tokio::test]
async fn gives_up_after_four_attempts() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/hooks/done"))
        .respond_with(ResponseTemplate::new(500))
        .expect(4)
        .mount(&server)
        .await;

    let err = sink(&server)
        .deliver(&[artifact()], "alice", &metadata())
        .await
        .unwrap_err();
    assert!(matches!(err, NotificationError::HttpStatus(500)));
}
