//! Activation flow test: register + activate, then persist.

use hr_common::ChannelTag;
use hr_config::ConfigStore;
use hr_protocol::RelayClient;
use serde_json::json;
use wiremock::matchers::{body_partial_json, method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

#[tokio::test]
async fn activation_persists_both_identifiers_and_cadences() {
    let server = MockServer::start().await;

    Mock::given(method("POST"))
        .and(path("/register"))
        .and(body_partial_json(json!({"channel": "signal", "label": "MyLaptop"})))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "relayId": "r1",
            "activationCode": "AC1",
            "activationCodeExpiresAt": "2026-01-01T00:10:00Z"
        })))
        .expect(1)
        .mount(&server)
        .await;

    Mock::given(method("POST"))
        .and(path("/activate"))
        .and(body_partial_json(json!({"relayId": "r1", "activationCode": "AC1"})))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "deviceToken": "dt1",
            "tokenExpiresAt": null,
            "heartbeatIntervalSeconds": 45,
            "outboundPollIntervalSeconds": 7
        })))
        .expect(1)
        .mount(&server)
        .await;

    let dir = tempfile::tempdir().unwrap();
    let store = ConfigStore::at(dir.path().join("agent")).unwrap();
    let mut config = store.load();

    let client = RelayClient::new(server.uri()).unwrap();
    hr_runtime::activate_agent(&client, &store, &mut config, ChannelTag::Signal, "MyLaptop", "user-tok-A")
        .await
        .unwrap();

    assert!(client.has_device_token());

    let persisted = store.load();
    assert!(persisted.is_activated());
    assert_eq!(persisted.channel, Some(ChannelTag::Signal));
    assert_eq!(persisted.relay_id.as_deref(), Some("r1"));
    assert_eq!(persisted.device_token.as_deref(), Some("dt1"));
    // Server-issued cadences become the persisted baseline.
    assert_eq!(persisted.heartbeat.interval_seconds, 45);
    assert_eq!(persisted.outbound.poll_interval_seconds, 7);

    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        let mode =
            std::fs::metadata(store.config_path()).unwrap().permissions().mode() & 0o777;
        assert_eq!(mode, 0o600);
    }
}

#[tokio::test]
async fn expired_activation_code_surfaces_the_server_message() {
    let server = MockServer::start().await;

    Mock::given(method("POST"))
        .and(path("/register"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "relayId": "r1",
            "activationCode": "AC-old",
            "activationCodeExpiresAt": "2026-01-01T00:00:00Z"
        })))
        .mount(&server)
        .await;
    Mock::given(method("POST"))
        .and(path("/activate"))
        .respond_with(
            ResponseTemplate::new(410).set_body_json(json!({"error": "activation code expired"})),
        )
        .mount(&server)
        .await;

    let dir = tempfile::tempdir().unwrap();
    let store = ConfigStore::at(dir.path().join("agent")).unwrap();
    let mut config = store.load();
    let client = RelayClient::new(server.uri()).unwrap();

    let err = hr_runtime::activate_agent(
        &client,
        &store,
        &mut config,
        ChannelTag::Signal,
        "MyLaptop",
        "user-tok-A",
    )
    .await
    .unwrap_err();
    assert!(err.to_string().contains("activation code expired"));

    // Nothing was persisted; the agent stays unconfigured.
    assert!(!store.load().is_activated());
    assert!(!client.has_device_token());
}
