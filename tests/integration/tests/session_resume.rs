//! End-to-end socket tests against a running worker.

use serde_json::json;
use shardlink_core::types::{AddSessionEvent, InitialHandshake, Operation, ShardId};
use shardlink_integration_tests::{next_envelope, send_json, InstantShard, TestWorker, PASSWORD, ROUTING_KEY};
use tokio_tungstenite::tungstenite;

#[tokio::test]
async fn test_wrong_password_is_unauthorized() {
    let worker = TestWorker::start().await;

    match worker.connect("wrong", None).await {
        Err(tungstenite::Error::Http(response)) => assert_eq!(response.status(), 401),
        Err(e) => panic!("unexpected error: {}", e),
        Ok(_) => panic!("handshake should be rejected"),
    }
    assert!(worker.sessions.is_empty());

    worker.stop().await;
}

#[tokio::test]
async fn test_new_session_handshake() {
    let worker = TestWorker::start().await;

    let (mut socket, resumed) = worker.connect(PASSWORD, None).await.unwrap();
    assert!(!resumed);

    let ack = next_envelope(&mut socket).await;
    assert_eq!(ack.operation, Operation::Initial);
    let handshake: InitialHandshake = ack.decode().unwrap();
    assert!(!handshake.resumed);
    assert_eq!(handshake.routing_key, ROUTING_KEY);
    assert_eq!(worker.sessions.len(), 1);

    worker.stop().await;
}

#[tokio::test]
async fn test_resume_replays_events_in_order() {
    let worker = TestWorker::start().await;

    let (mut socket, _) = worker.connect(PASSWORD, None).await.unwrap();
    let first: InitialHandshake = next_envelope(&mut socket).await.decode().unwrap();

    send_json(
        &mut socket,
        json!({
            "operation": "configureResuming",
            "type": "ConfigureResuming",
            "payload": {"key": "k1", "timeout": 60}
        }),
    )
    .await;
    socket.close(None).await.unwrap();
    assert!(worker.wait_for(|w| w.sessions.paused_len() == 1).await);

    for shard in 1..=3 {
        worker
            .sessions
            .broadcast(&AddSessionEvent {
                shard_id: ShardId(shard),
                total_shards: 3,
                routing_key: ROUTING_KEY.into(),
            })
            .unwrap();
    }

    let (mut socket, resumed) = worker.connect(PASSWORD, Some("k1")).await.unwrap();
    assert!(resumed);

    let ack: InitialHandshake = next_envelope(&mut socket).await.decode().unwrap();
    assert!(ack.resumed);
    assert_eq!(ack.session_id, first.session_id);

    for shard in 1..=3 {
        let event: AddSessionEvent = next_envelope(&mut socket).await.decode().unwrap();
        assert_eq!(event.shard_id, ShardId(shard));
    }
    assert_eq!(worker.sessions.paused_len(), 0);

    worker.stop().await;
}

#[tokio::test]
async fn test_unknown_resume_key_creates_new_session() {
    let worker = TestWorker::start().await;

    let (mut socket, resumed) = worker.connect(PASSWORD, Some("never-paused")).await.unwrap();
    assert!(!resumed);
    let ack: InitialHandshake = next_envelope(&mut socket).await.decode().unwrap();
    assert!(!ack.resumed);

    worker.stop().await;
}

#[tokio::test]
async fn test_run_session_request_over_socket() {
    let worker = TestWorker::start().await;
    let (mut socket, _) = worker.connect(PASSWORD, None).await.unwrap();
    next_envelope(&mut socket).await;

    worker.scheduler.enqueue(InstantShard::new(3, 10));
    let added = next_envelope(&mut socket).await;
    assert_eq!(added.payload_type, "AddSessionEvent");

    send_json(
        &mut socket,
        json!({
            "operation": "request",
            "type": "RunSessionRequest",
            "payload": {"shardId": 3},
            "responseId": 11
        }),
    )
    .await;

    let removed = next_envelope(&mut socket).await;
    assert_eq!(removed.payload_type, "RemoveSessionEvent");
    assert_eq!(removed.payload["shardId"], 3);

    let response = next_envelope(&mut socket).await;
    assert_eq!(response.operation, Operation::Response);
    assert_eq!(response.response_id, 11);
    assert_eq!(response.successful, Some(true));
    assert_eq!(response.payload["started"], true);
    assert!(worker.scheduler.is_empty());

    worker.stop().await;
}

#[tokio::test]
async fn test_run_unqueued_shard_fails_response() {
    let worker = TestWorker::start().await;
    let (mut socket, _) = worker.connect(PASSWORD, None).await.unwrap();
    next_envelope(&mut socket).await;

    send_json(
        &mut socket,
        json!({
            "operation": "request",
            "type": "RunSessionRequest",
            "payload": {"shardId": 8},
            "responseId": 2
        }),
    )
    .await;

    // The scheduler announces the removal before the handler answers.
    let removed = next_envelope(&mut socket).await;
    assert_eq!(removed.payload_type, "RemoveSessionEvent");

    let response = next_envelope(&mut socket).await;
    assert_eq!(response.response_id, 2);
    assert_eq!(response.successful, Some(false));
    assert_eq!(response.payload_type, "ErrorResponse");

    worker.stop().await;
}
