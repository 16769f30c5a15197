//! HTTP transport tests against a mock server.

use gradwire_abstraction::{
    Datum, LossKind, ModelInput, OperationKind, QueueState, RequestEnvelope, RequestId,
    RetrieveResponse, SubmitResponse, TensorData, Transport, TransportError,
};
use gradwire_client::{ClientConfig, HttpTransport, PollOptions, ServiceClient};
use mockito::Matcher;
use serde_json::json;

fn forward_envelope() -> RequestEnvelope {
    RequestEnvelope::new(OperationKind::Forward, json!({"model_id": "m", "seq_id": 0}))
}

#[tokio::test]
async fn test_submit_deferred_with_bearer_auth() {
    let mut server = mockito::Server::new_async().await;
    let mock = server
        .mock("POST", "/api/v1/forward")
        .match_header("authorization", "Bearer test-key")
        .match_body(Matcher::PartialJson(json!({"model_id": "m"})))
        .with_status(200)
        .with_header("content-type", "application/json")
        .with_body(r#"{"type": "deferred", "request_id": "req-1"}"#)
        .create_async()
        .await;

    let transport = HttpTransport::new(server.url()).with_api_key("test-key");
    let reply = transport.submit(&forward_envelope()).await.unwrap();

    assert_eq!(reply, SubmitResponse::Deferred(RequestId::from("req-1")));
    mock.assert_async().await;
}

#[tokio::test]
async fn test_retrieve_completed_payload() {
    let mut server = mockito::Server::new_async().await;
    let mock = server
        .mock("POST", "/api/v1/retrieve_future")
        .match_body(Matcher::Json(json!({"request_id": "req-1"})))
        .with_status(200)
        .with_header("content-type", "application/json")
        .with_body(r#"{"metrics": {"loss:sum": 1.5}}"#)
        .create_async()
        .await;

    let transport = HttpTransport::new(server.url());
    let reply = transport.retrieve(&RequestId::from("req-1")).await.unwrap();

    assert_eq!(reply, RetrieveResponse::Completed(json!({"metrics": {"loss:sum": 1.5}})));
    mock.assert_async().await;
}

#[tokio::test]
async fn test_retrieve_try_again_body() {
    let mut server = mockito::Server::new_async().await;
    let _mock = server
        .mock("POST", "/api/v1/retrieve_future")
        .with_status(200)
        .with_body(
            r#"{"type": "try_again", "queue_state": "paused_capacity", "reason": "maintenance"}"#,
        )
        .create_async()
        .await;

    let transport = HttpTransport::new(server.url());
    match transport.retrieve(&RequestId::from("req-1")).await.unwrap() {
        RetrieveResponse::TryAgain(signal) => {
            assert_eq!(signal.queue_state, QueueState::PausedCapacity);
            assert_eq!(signal.reason(), "maintenance");
        }
        other => panic!("Expected try_again, got {:?}", other),
    }
}

#[tokio::test]
async fn test_rate_limit_status_is_backpressure() {
    let mut server = mockito::Server::new_async().await;
    let _mock = server
        .mock("POST", "/api/v1/forward_backward")
        .with_status(429)
        .with_header("retry-after", "2")
        .with_body("slow down")
        .create_async()
        .await;

    let transport = HttpTransport::new(server.url());
    let envelope = RequestEnvelope::new(OperationKind::ForwardBackward, json!({}));
    match transport.submit(&envelope).await.unwrap() {
        SubmitResponse::TryAgain(signal) => {
            assert_eq!(signal.queue_state, QueueState::PausedRateLimit);
            assert_eq!(signal.retry_after_ms, Some(2000));
        }
        other => panic!("Expected try_again, got {:?}", other),
    }
}

#[tokio::test]
async fn test_long_poll_timeout_status_is_backpressure() {
    let mut server = mockito::Server::new_async().await;
    let _mock = server
        .mock("POST", "/api/v1/retrieve_future")
        .with_status(408)
        .create_async()
        .await;

    let transport = HttpTransport::new(server.url());
    match transport.retrieve(&RequestId::from("req-1")).await.unwrap() {
        RetrieveResponse::TryAgain(signal) => assert_eq!(signal.queue_state, QueueState::Unknown),
        other => panic!("Expected try_again, got {:?}", other),
    }
}

#[tokio::test]
async fn test_server_error_status_is_retryable() {
    let mut server = mockito::Server::new_async().await;
    let _mock = server
        .mock("POST", "/api/v1/optim_step")
        .with_status(503)
        .with_body("unavailable")
        .create_async()
        .await;

    let transport = HttpTransport::new(server.url());
    let envelope = RequestEnvelope::new(OperationKind::OptimStep, json!({}));
    let error = transport.submit(&envelope).await.unwrap_err();

    assert_eq!(error, TransportError::Status { status: 503, body: "unavailable".to_string() });
    assert!(error.is_retryable());
}

#[tokio::test]
async fn test_client_error_status_is_not_retryable() {
    let mut server = mockito::Server::new_async().await;
    let _mock = server
        .mock("POST", "/api/v1/forward")
        .with_status(401)
        .with_body("bad key")
        .create_async()
        .await;

    let transport = HttpTransport::new(server.url());
    let error = transport.submit(&forward_envelope()).await.unwrap_err();
    assert!(matches!(error, TransportError::Status { status: 401, .. }));
    assert!(!error.is_retryable());
}

#[tokio::test]
async fn test_malformed_body_is_decode_error() {
    let mut server = mockito::Server::new_async().await;
    let _mock = server
        .mock("POST", "/api/v1/forward")
        .with_status(200)
        .with_body("not json")
        .create_async()
        .await;

    let transport = HttpTransport::new(server.url());
    let error = transport.submit(&forward_envelope()).await.unwrap_err();
    assert!(matches!(error, TransportError::Decode(_)));
    assert!(!error.is_retryable());
}

#[tokio::test]
async fn test_failed_submission_is_rejected() {
    let mut server = mockito::Server::new_async().await;
    let _mock = server
        .mock("POST", "/api/v1/forward")
        .with_status(200)
        .with_body(r#"{"type": "failed", "error": "unknown model", "category": "user"}"#)
        .create_async()
        .await;

    let transport = HttpTransport::new(server.url());
    match transport.submit(&forward_envelope()).await.unwrap() {
        SubmitResponse::Rejected(error) => assert_eq!(error.message, "unknown model"),
        other => panic!("Expected rejection, got {:?}", other),
    }
}

#[tokio::test]
async fn test_unreachable_server_is_connection_error() {
    let transport = HttpTransport::new("http://127.0.0.1:1");
    let error = transport.submit(&forward_envelope()).await.unwrap_err();
    assert!(matches!(error, TransportError::Connection(_)));
    assert!(error.is_retryable());
}

#[tokio::test]
async fn test_forward_through_service_client() {
    let mut server = mockito::Server::new_async().await;
    let submit = server
        .mock("POST", "/api/v1/forward")
        .match_body(Matcher::PartialJson(json!({
            "model_id": "model-1",
            "seq_id": 0,
            "forward_input": {"loss_fn": "cross_entropy"}
        })))
        .with_status(200)
        .with_body(r#"{"type": "deferred", "request_id": "req-7"}"#)
        .create_async()
        .await;
    let retrieve = server
        .mock("POST", "/api/v1/retrieve_future")
        .match_body(Matcher::Json(json!({"request_id": "req-7"})))
        .with_status(200)
        .with_body(
            r#"{
                "loss_fn_output_type": "TorchLossReturn",
                "loss_fn_outputs": [{"logprobs": {"data": [-0.1, -0.2], "dtype": "float32"}}],
                "metrics": {"loss:sum": 0.3}
            }"#,
        )
        .create_async()
        .await;

    let config = ClientConfig::default().with_base_url(server.url());
    let client = ServiceClient::from_config(&config).unwrap();
    let training = client.training_client("model-1");
    let data = vec![Datum::new(ModelInput::from_ints(vec![1, 2]), TensorData::ints(&[2, 3]))];

    let output = training
        .forward(&data, LossKind::CrossEntropy, &PollOptions::default())
        .await
        .unwrap();

    assert_eq!(output.loss_fn_outputs.len(), 1);
    assert_eq!(output.loss_fn_outputs[0]["logprobs"].numel(), 2);
    assert_eq!(output.metrics["loss:sum"], 0.3);
    submit.assert_async().await;
    retrieve.assert_async().await;
}
