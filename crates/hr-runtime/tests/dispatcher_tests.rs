//! Outbound dispatcher tests: ordering, ack idempotence, transient poll
//! failures, cancellation.

mod common;

use std::sync::Arc;
use std::time::Duration;

use common::{outbound_json, MockPlugin};
use hr_common::backoff::BackoffPolicy;
use hr_protocol::RelayClient;
use hr_runtime::OutboundDispatcher;
use serde_json::json;
use tokio_util::sync::CancellationToken;
use wiremock::matchers::{body_partial_json, method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

const POLL_INTERVAL: Duration = Duration::from_millis(50);

fn test_backoff() -> BackoffPolicy {
    BackoffPolicy::from_millis(50, 200)
}

async fn client_for(server: &MockServer) -> Arc<RelayClient> {
    let client = RelayClient::new(server.uri()).unwrap();
    client.set_device_token("dt1");
    Arc::new(client)
}

fn dispatcher(
    client: Arc<RelayClient>,
    plugin: Arc<MockPlugin>,
    max_per_poll: u32,
) -> OutboundDispatcher {
    OutboundDispatcher::new(client, plugin, "r1".to_string(), POLL_INTERVAL, max_per_poll, test_backoff())
}

async fn mount_ok_acks(server: &MockServer) {
    Mock::given(method("POST"))
        .and(path("/ack"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({"ok": true})))
        .mount(server)
        .await;
}

async fn mount_empty_polls(server: &MockServer) {
    Mock::given(method("GET"))
        .and(path("/outbound"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!([])))
        .mount(server)
        .await;
}

#[tokio::test]
async fn batch_dispatches_in_order_with_gate_of_one() {
    let server = MockServer::start().await;

    Mock::given(method("GET"))
        .and(path("/outbound"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!([
            outbound_json("out-1", "m1"),
            outbound_json("out-2", "m2"),
            outbound_json("out-3", "m3"),
        ])))
        .up_to_n_times(1)
        .mount(&server)
        .await;
    mount_empty_polls(&server).await;
    mount_ok_acks(&server).await;

    let plugin = Arc::new(MockPlugin::new().with_deliver_delay(Duration::from_millis(20)));
    let cancel = CancellationToken::new();
    let handle = tokio::spawn(
        dispatcher(client_for(&server).await, plugin.clone(), 1).run(cancel.clone()),
    );

    tokio::time::sleep(Duration::from_millis(500)).await;
    cancel.cancel();
    tokio::time::timeout(Duration::from_secs(5), handle).await.unwrap().unwrap();

    assert_eq!(plugin.delivered(), vec!["m1", "m2", "m3"]);
}

#[tokio::test]
async fn successful_ack_is_sent_exactly_once_per_id() {
    let server = MockServer::start().await;

    // Every poll returns the same unacked id, as a slow cloud would.
    Mock::given(method("GET"))
        .and(path("/outbound"))
        .respond_with(
            ResponseTemplate::new(200).set_body_json(json!([outbound_json("out-1", "m1")])),
        )
        .mount(&server)
        .await;

    Mock::given(method("POST"))
        .and(path("/ack"))
        .and(body_partial_json(json!({"outboundMessageId": "out-1", "success": true})))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({"ok": true})))
        .expect(1)
        .mount(&server)
        .await;

    let plugin = Arc::new(MockPlugin::new());
    let cancel = CancellationToken::new();
    let handle = tokio::spawn(
        dispatcher(client_for(&server).await, plugin.clone(), 4).run(cancel.clone()),
    );

    // Enough time for several polls of the same id.
    tokio::time::sleep(Duration::from_millis(400)).await;
    cancel.cancel();
    tokio::time::timeout(Duration::from_secs(5), handle).await.unwrap().unwrap();

    assert_eq!(plugin.deliver_count(), 1, "already-acked id must not be re-delivered");
    server.verify().await;
}

#[tokio::test]
async fn transient_poll_failure_recovers_with_backoff() {
    let server = MockServer::start().await;

    Mock::given(method("GET"))
        .and(path("/outbound"))
        .respond_with(ResponseTemplate::new(500).set_body_json(json!({"error": "busy"})))
        .up_to_n_times(1)
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path("/outbound"))
        .respond_with(
            ResponseTemplate::new(200).set_body_json(json!([outbound_json("out-1", "m1")])),
        )
        .up_to_n_times(1)
        .mount(&server)
        .await;
    mount_empty_polls(&server).await;
    mount_ok_acks(&server).await;

    let plugin = Arc::new(MockPlugin::new());
    let cancel = CancellationToken::new();
    let handle = tokio::spawn(
        dispatcher(client_for(&server).await, plugin.clone(), 4).run(cancel.clone()),
    );

    tokio::time::sleep(Duration::from_millis(600)).await;
    cancel.cancel();
    tokio::time::timeout(Duration::from_secs(5), handle).await.unwrap().unwrap();

    assert_eq!(plugin.delivered(), vec!["m1"]);
}

#[tokio::test]
async fn failed_delivery_acks_with_retryability() {
    let server = MockServer::start().await;

    // The cloud keeps returning the failed id on a second poll (it is
    // allowed to until the ack lands); the dispatcher must still ack once.
    Mock::given(method("GET"))
        .and(path("/outbound"))
        .respond_with(
            ResponseTemplate::new(200).set_body_json(json!([outbound_json("out-9", "nope")])),
        )
        .up_to_n_times(2)
        .mount(&server)
        .await;
    mount_empty_polls(&server).await;

    Mock::given(method("POST"))
        .and(path("/ack"))
        .and(body_partial_json(json!({
            "outboundMessageId": "out-9",
            "success": false,
            "retryable": false
        })))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({"ok": true})))
        .expect(1)
        .mount(&server)
        .await;

    let plugin = Arc::new(MockPlugin::new().with_deliver_outcome(|_| {
        hr_common::DeliveryOutcome::failed_permanent("recipient blocked")
    }));
    let cancel = CancellationToken::new();
    let handle = tokio::spawn(
        dispatcher(client_for(&server).await, plugin.clone(), 4).run(cancel.clone()),
    );

    // Enough time for both id-bearing polls plus a few empty ones.
    tokio::time::sleep(Duration::from_millis(400)).await;
    cancel.cancel();
    tokio::time::timeout(Duration::from_secs(5), handle).await.unwrap().unwrap();

    assert_eq!(plugin.deliver_count(), 1, "a settled id must not be re-delivered");
    server.verify().await;
}

#[tokio::test]
async fn cancellation_stops_the_loop_promptly() {
    let server = MockServer::start().await;
    mount_empty_polls(&server).await;

    let plugin = Arc::new(MockPlugin::new());
    let cancel = CancellationToken::new();
    let handle =
        tokio::spawn(dispatcher(client_for(&server).await, plugin, 4).run(cancel.clone()));

    tokio::time::sleep(Duration::from_millis(80)).await;
    let cancelled_at = std::time::Instant::now();
    cancel.cancel();
    tokio::time::timeout(Duration::from_secs(5), handle).await.unwrap().unwrap();
    assert!(cancelled_at.elapsed() < Duration::from_secs(5));
}
