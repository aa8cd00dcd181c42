//! Signal adapter: manages an external signal-cli daemon, speaks JSON-RPC
//! for sends and device linking, and consumes the daemon's SSE stream for
//! inbound messages.
//!
//! Transient stream drops reconnect the stream only; the daemon keeps
//! running. Only after the attempt limit is exhausted does the plugin stop
//! the daemon and surface a disconnect.

use std::path::PathBuf;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures::StreamExt;
use hr_common::backoff::{self, BackoffPolicy, SleepOutcome};
use hr_common::{
    ChannelTag, ConnectionState, DeliveryOutcome, DisconnectReason, EgressEnvelope,
    IngressEnvelope, MediaDescriptor, MediaKind,
};
use parking_lot::RwLock;
use serde_json::{json, Value};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::{ChannelError, ChannelPlugin, InboundSender, Result, SupportStatus};

pub mod daemon;
pub mod rpc;
pub mod sse;

use daemon::{DaemonHandle, DAEMON_PORT};
use rpc::{RpcClient, RpcError, SendOutcome, SendResultKind};
use sse::SseParser;

/// Conversation ids with this prefix address a group.
pub const GROUP_PREFIX: &str = "group.";

/// Stream-only reconnect policy: base 1 s, cap 2^5 x base.
const SSE_BACKOFF_INITIAL_MS: u64 = 1_000;
const SSE_BACKOFF_MAX_MS: u64 = 32_000;
const SSE_MAX_ATTEMPTS: u32 = 10;

pub struct SignalPlugin {
    data_dir: PathBuf,
    port: u16,
    /// No global timeout: the SSE stream stays open indefinitely. RPC and
    /// health probes set per-request timeouts.
    http: reqwest::Client,
    status: Arc<RwLock<ConnectionState>>,
    daemon: tokio::sync::Mutex<Option<DaemonHandle>>,
    rpc: RwLock<Option<Arc<RpcClient>>>,
}

impl SignalPlugin {
    pub fn new(credential_dir: PathBuf) -> Self {
        Self {
            data_dir: credential_dir.join("data"),
            port: DAEMON_PORT,
            http: reqwest::Client::new(),
            status: Arc::new(RwLock::new(ConnectionState::Disconnected)),
            daemon: tokio::sync::Mutex::new(None),
            rpc: RwLock::new(None),
        }
    }

    fn set_status(&self, state: ConnectionState) {
        *self.status.write() = state;
    }

    async fn stop_daemon(&self) {
        if let Some(mut handle) = self.daemon.lock().await.take() {
            handle.stop().await;
        }
        *self.rpc.write() = None;
    }
}

#[async_trait]
impl ChannelPlugin for SignalPlugin {
    fn channel(&self) -> ChannelTag {
        ChannelTag::Signal
    }

    fn display_name(&self) -> &'static str {
        "Signal"
    }

    fn support(&self) -> SupportStatus {
        SupportStatus::supported()
    }

    async fn is_authenticated(&self) -> bool {
        self.data_dir.join("data").join("accounts.json").exists()
            || self.data_dir.join("accounts.json").exists()
    }

    async fn login(&self) -> Result<()> {
        let binary = daemon::find_binary()?;
        std::fs::create_dir_all(&self.data_dir)?;

        // Temporary daemon just for the linking flow.
        let mut handle =
            DaemonHandle::spawn(&binary, &self.data_dir, self.port, &self.http).await?;
        let rpc = RpcClient::new(self.http.clone(), handle.base_url());

        let link = async {
            let started = rpc
                .call("startLink", json!({}))
                .await
                .map_err(|e| ChannelError::Pairing(format!("startLink failed: {}", e)))?;
            let uri = started
                .get("deviceLinkUri")
                .and_then(Value::as_str)
                .ok_or_else(|| ChannelError::Pairing("startLink returned no link URI".into()))?
                .to_string();

            eprintln!();
            eprintln!("Open Signal on your phone (Settings > Linked Devices) and scan:");
            eprintln!();
            eprintln!("  {}", uri);
            eprintln!();

            rpc.call_link("finishLink", json!({ "deviceLinkUri": uri, "deviceName": "HyveRelay" }))
                .await
                .map_err(|e| ChannelError::Pairing(format!("finishLink failed: {}", e)))?;
            Ok::<(), ChannelError>(())
        };

        let result = link.await;
        handle.stop().await;
        result?;

        info!("signal device linked");
        Ok(())
    }

    async fn start(&self, inbound: InboundSender, cancel: CancellationToken) -> Result<()> {
        let binary = daemon::find_binary()?;
        if !self.is_authenticated().await {
            return Err(ChannelError::NotAuthenticated);
        }

        self.set_status(ConnectionState::Connecting);
        let handle = match DaemonHandle::spawn(&binary, &self.data_dir, self.port, &self.http).await
        {
            Ok(handle) => handle,
            Err(e) => {
                self.set_status(ConnectionState::Disconnected);
                return Err(e);
            }
        };
        let base_url = handle.base_url().to_string();
        *self.rpc.write() = Some(Arc::new(RpcClient::new(self.http.clone(), &base_url)));
        *self.daemon.lock().await = Some(handle);

        let outcome =
            run_event_stream(&self.http, &base_url, &inbound, &cancel, &self.status).await;

        self.stop_daemon().await;
        self.set_status(ConnectionState::Disconnected);
        outcome
    }

    async fn deliver(&self, envelope: &EgressEnvelope) -> DeliveryOutcome {
        let rpc = match self.rpc.read().clone() {
            Some(rpc) => rpc,
            None => return DeliveryOutcome::failed_retryable("signal daemon is not running"),
        };

        // The daemon cannot fetch remote attachments; media rides along as
        // URLs in the body.
        let mut text = envelope.text.clone();
        for media in &envelope.media {
            if !text.is_empty() {
                text.push('\n');
            }
            text.push_str(&media.reference);
        }

        let params = match envelope.conversation_id.strip_prefix(GROUP_PREFIX) {
            Some(group_id) => json!({ "groupId": group_id, "message": text }),
            None => json!({ "recipient": [envelope.conversation_id], "message": text }),
        };

        match rpc.call("send", params).await {
            Ok(result) => {
                let outcome = SendOutcome::from_result(&result);
                match outcome.kind {
                    SendResultKind::Success => match outcome.timestamp {
                        Some(ts) => DeliveryOutcome::delivered(format!("sig-{}", ts)),
                        None => DeliveryOutcome::delivered_without_id(),
                    },
                    SendResultKind::NetworkFailure => {
                        DeliveryOutcome::failed_retryable("signal network failure")
                    }
                    SendResultKind::UnregisteredFailure => {
                        DeliveryOutcome::failed_permanent("recipient is not registered on signal")
                    }
                    SendResultKind::IdentityFailure => {
                        DeliveryOutcome::failed_permanent("recipient identity changed")
                    }
                    SendResultKind::ProofRequiredFailure => {
                        DeliveryOutcome::failed_permanent("signal requires a rate-limit proof")
                    }
                    SendResultKind::Other => {
                        DeliveryOutcome::failed_permanent("signal send failed")
                    }
                }
            }
            Err(RpcError::Transport(e)) => DeliveryOutcome::failed_retryable(e),
            Err(e @ RpcError::Remote { .. }) => DeliveryOutcome::failed_permanent(e.to_string()),
        }
    }

    fn status(&self) -> ConnectionState {
        *self.status.read()
    }

    async fn logout(&self) -> Result<()> {
        self.stop_daemon().await;
        match std::fs::remove_dir_all(&self.data_dir) {
            Ok(()) => {}
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => return Err(e.into()),
        }
        self.set_status(ConnectionState::Disconnected);
        debug!("signal credentials wiped");
        Ok(())
    }
}

/// Consume the daemon's SSE stream, reconnecting the stream only (the
/// daemon keeps running) on transient drops. Returns `Ok(())` when
/// cancelled, `Err(Disconnected(ConnectionLost))` once the attempt limit is
/// exhausted.
async fn run_event_stream(
    http: &reqwest::Client,
    base_url: &str,
    inbound: &InboundSender,
    cancel: &CancellationToken,
    status: &RwLock<ConnectionState>,
) -> Result<()> {
    let url = format!("{}/api/v1/events", base_url);
    let policy = BackoffPolicy::from_millis(SSE_BACKOFF_INITIAL_MS, SSE_BACKOFF_MAX_MS);
    let mut attempts: u32 = 0;

    loop {
        if cancel.is_cancelled() {
            return Ok(());
        }

        match http.get(&url).header("accept", "text/event-stream").send().await {
            Ok(response) if response.status().is_success() => {
                *status.write() = ConnectionState::Connected;
                attempts = 0;
                debug!("signal event stream connected");

                let mut parser = SseParser::new();
                let mut stream = response.bytes_stream();
                loop {
                    tokio::select! {
                        _ = cancel.cancelled() => return Ok(()),
                        chunk = stream.next() => match chunk {
                            Some(Ok(bytes)) => {
                                for event in parser.push(&bytes) {
                                    if let Some(envelope) = normalize_event(&event) {
                                        if inbound.send(envelope).await.is_err() {
                                            return Ok(());
                                        }
                                    }
                                }
                            }
                            Some(Err(e)) => {
                                warn!(error = %e, "signal event stream error");
                                break;
                            }
                            None => {
                                info!("signal event stream ended");
                                break;
                            }
                        },
                    }
                }
                *status.write() = ConnectionState::Connecting;
            }
            Ok(response) => {
                warn!(status = %response.status(), "signal event stream refused");
            }
            Err(e) => {
                warn!(error = %e, "signal event stream connect failed");
            }
        }

        attempts += 1;
        if attempts > SSE_MAX_ATTEMPTS {
            warn!(attempts, "signal event stream reconnect attempts exhausted");
            return Err(ChannelError::Disconnected(DisconnectReason::ConnectionLost));
        }
        if backoff::sleep(policy.delay(attempts - 1), cancel).await == SleepOutcome::Aborted {
            return Ok(());
        }
    }
}

/// Turn one SSE event into an ingress envelope. Only data messages with
/// text or attachments pass; receipts, typing indicators and reactions are
/// dropped.
fn normalize_event(event: &sse::SseEvent) -> Option<IngressEnvelope> {
    if event.event != "receive" && event.event != "message" {
        return None;
    }
    let value: Value = serde_json::from_str(&event.data).ok()?;
    let envelope = value.get("envelope")?;
    let data_message = envelope.get("dataMessage")?;

    if data_message.get("reaction").is_some() {
        return None;
    }

    let text = data_message.get("message").and_then(Value::as_str).unwrap_or("");
    let attachments = data_message
        .get("attachments")
        .and_then(Value::as_array)
        .cloned()
        .unwrap_or_default();
    if text.is_empty() && attachments.is_empty() {
        return None;
    }

    let source = envelope.get("source").and_then(Value::as_str)?.to_string();
    let source_name =
        envelope.get("sourceName").and_then(Value::as_str).map(str::to_string);
    let timestamp_ms = data_message
        .get("timestamp")
        .or_else(|| envelope.get("timestamp"))
        .and_then(Value::as_i64)?;
    let timestamp: DateTime<Utc> =
        DateTime::from_timestamp_millis(timestamp_ms).unwrap_or_else(Utc::now);

    let group_info = data_message.get("groupInfo");
    let (conversation_id, is_group, group_name) = match group_info {
        Some(info) => {
            let group_id = info.get("groupId").and_then(Value::as_str)?;
            (
                format!("{}{}", GROUP_PREFIX, group_id),
                true,
                info.get("groupName").and_then(Value::as_str).map(str::to_string),
            )
        }
        None => (source.clone(), false, None),
    };

    let media = attachments
        .iter()
        .filter_map(|attachment| {
            let id = attachment.get("id").and_then(Value::as_str)?.to_string();
            let mime_type =
                attachment.get("contentType").and_then(Value::as_str).map(str::to_string);
            Some(MediaDescriptor {
                kind: media_kind_from_mime(mime_type.as_deref()),
                reference: id,
                mime_type,
                file_name: attachment.get("filename").and_then(Value::as_str).map(str::to_string),
                size: attachment.get("size").and_then(Value::as_u64),
            })
        })
        .collect();

    let mentions = data_message
        .get("mentions")
        .and_then(Value::as_array)
        .map(|entries| {
            entries
                .iter()
                .filter_map(|m| m.get("number").and_then(Value::as_str).map(str::to_string))
                .collect()
        })
        .unwrap_or_default();

    let reply_to_message_id = data_message
        .get("quote")
        .and_then(|q| q.get("id"))
        .and_then(Value::as_i64)
        .map(|id| format!("sig-{}", id));

    Some(IngressEnvelope {
        channel: ChannelTag::Signal,
        platform_message_id: format!("sig-{}", timestamp_ms),
        conversation_id,
        thread_id: None,
        peer_id: source,
        peer_name: source_name,
        text: text.to_string(),
        media,
        is_group,
        group_name,
        timestamp,
        reply_to_message_id,
        mentions,
    })
}

fn media_kind_from_mime(mime: Option<&str>) -> MediaKind {
    match mime {
        Some(m) if m.starts_with("image/") => MediaKind::Image,
        Some(m) if m.starts_with("video/") => MediaKind::Video,
        Some(m) if m.starts_with("audio/") => MediaKind::Audio,
        _ => MediaKind::Document,
    }
}
