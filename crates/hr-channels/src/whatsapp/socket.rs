//! WebSocket session against the WhatsApp multi-device gateway.
//!
//! The session task owns the socket: it forwards gateway events to the
//! plugin, correlates send acknowledgments by request id, and classifies the
//! close reason when the stream ends.

use std::collections::HashMap;
use std::time::Duration;

use futures::{SinkExt, StreamExt};
use hr_common::DisconnectReason;
use serde::{Deserialize, Serialize};
use tokio::sync::{mpsc, oneshot};
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::Message as WsMessage;
use tracing::{debug, warn};

use crate::ChannelError;

/// Acknowledgment of an outbound send must arrive within this window.
const SEND_ACK_TIMEOUT: Duration = Duration::from_secs(30);

const EVENT_BUFFER: usize = 64;
const COMMAND_BUFFER: usize = 16;

/// Where the gateway session connects.
#[derive(Debug, Clone)]
pub struct SocketConfig {
    pub url: String,
}

impl Default for SocketConfig {
    fn default() -> Self {
        Self { url: "wss://web.whatsapp.com/ws/chat".to_string() }
    }
}

/// Persisted pairing state for an authenticated session.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionBlob {
    pub client_id: String,
    pub session_token: String,
}

/// Frames emitted by the gateway.
#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "event", rename_all = "kebab-case")]
pub enum ServerFrame {
    Qr { code: String },
    Paired { session: SessionBlob },
    Connected,
    Message(Box<WireMessage>),
    Ack(SendAck),
    Disconnected { code: u16 },
}

/// An incoming chat message as the gateway delivers it.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WireMessage {
    pub id: String,
    pub chat_id: String,
    pub sender_id: String,
    #[serde(default)]
    pub sender_name: Option<String>,
    #[serde(default)]
    pub from_me: bool,
    #[serde(default)]
    pub broadcast: bool,
    #[serde(default)]
    pub text: Option<String>,
    #[serde(default)]
    pub caption: Option<String>,
    #[serde(default)]
    pub group: bool,
    #[serde(default)]
    pub group_subject: Option<String>,
    /// Unix seconds.
    pub timestamp: i64,
    #[serde(default)]
    pub quoted_message_id: Option<String>,
    #[serde(default)]
    pub mentions: Vec<String>,
    #[serde(default)]
    pub media: Vec<WireMedia>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WireMedia {
    #[serde(rename = "type")]
    pub kind: String,
    pub media_id: String,
    #[serde(default)]
    pub mime_type: Option<String>,
    #[serde(default)]
    pub file_name: Option<String>,
    #[serde(default)]
    pub file_size: Option<u64>,
}

/// Result of one send request.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SendAck {
    pub request_id: u64,
    #[serde(default)]
    pub message_id: Option<String>,
    #[serde(default)]
    pub error: Option<SendError>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SendError {
    pub code: String,
    #[serde(default)]
    pub message: Option<String>,
}

impl SendError {
    /// The gateway's terminal outcomes; everything else is transient.
    pub fn is_permanent(&self) -> bool {
        matches!(self.code.as_str(), "not-on-whatsapp" | "blocked")
    }
}

/// Payload for a typed outbound send.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct OutgoingMessage {
    pub chat_id: String,
    pub kind: String,
    pub text: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub media_url: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub mime_type: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub file_name: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub quoted_message_id: Option<String>,
}

#[derive(Debug, Serialize)]
#[serde(tag = "action", rename_all = "kebab-case")]
enum ClientFrame<'a> {
    #[serde(rename_all = "camelCase")]
    Init { session_token: Option<&'a str> },
    #[serde(rename_all = "camelCase")]
    Send { request_id: u64, payload: &'a OutgoingMessage },
}

/// Events surfaced to the plugin.
#[derive(Debug)]
pub enum SocketEvent {
    Qr { code: String },
    Paired { session: SessionBlob },
    Connected,
    Message(Box<WireMessage>),
    Closed { reason: DisconnectReason },
}

enum Command {
    Send { payload: OutgoingMessage, reply: oneshot::Sender<Result<SendAck, ChannelError>> },
    Close,
}

/// Handle to a live session task. Cloneable; dropping all handles closes
/// the socket.
#[derive(Clone)]
pub struct SocketHandle {
    commands: mpsc::Sender<Command>,
}

impl SocketHandle {
    /// Send one message and wait for the gateway acknowledgment.
    pub async fn send_message(&self, payload: OutgoingMessage) -> Result<SendAck, ChannelError> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.commands
            .send(Command::Send { payload, reply: reply_tx })
            .await
            .map_err(|_| ChannelError::Disconnected(DisconnectReason::ConnectionLost))?;

        match tokio::time::timeout(SEND_ACK_TIMEOUT, reply_rx).await {
            Ok(Ok(result)) => result,
            Ok(Err(_)) => Err(ChannelError::Disconnected(DisconnectReason::ConnectionLost)),
            Err(_) => Err(ChannelError::Other("send acknowledgment timed out".to_string())),
        }
    }

    pub async fn close(&self) {
        let _ = self.commands.send(Command::Close).await;
    }
}

/// Map a gateway close code to a classified disconnect reason. Total over
/// the whole code space.
pub fn classify_close_code(code: u16) -> DisconnectReason {
    match code {
        401 => DisconnectReason::LoggedOut,
        440 => DisconnectReason::Replaced,
        408 | 500..=599 => DisconnectReason::ConnectionLost,
        _ => DisconnectReason::Unknown,
    }
}

/// Open a gateway session. With a session blob the gateway resumes the
/// paired device; without one it starts the QR pairing flow.
pub async fn connect(
    config: &SocketConfig,
    session: Option<&SessionBlob>,
) -> Result<(SocketHandle, mpsc::Receiver<SocketEvent>), ChannelError> {
    let (stream, _response) = connect_async(config.url.as_str())
        .await
        .map_err(|e| ChannelError::Other(format!("gateway connect failed: {}", e)))?;
    let (mut sink, ws_events) = stream.split();

    let init = ClientFrame::Init { session_token: session.map(|s| s.session_token.as_str()) };
    let body = serde_json::to_string(&init)
        .map_err(|e| ChannelError::Other(format!("encode init frame: {}", e)))?;
    sink.send(WsMessage::text(body))
        .await
        .map_err(|e| ChannelError::Other(format!("gateway init failed: {}", e)))?;

    let (event_tx, event_rx) = mpsc::channel(EVENT_BUFFER);
    let (cmd_tx, cmd_rx) = mpsc::channel(COMMAND_BUFFER);

    tokio::spawn(session_task(sink, ws_events, event_tx, cmd_rx));

    Ok((SocketHandle { commands: cmd_tx }, event_rx))
}

async fn session_task<W, R>(
    mut sink: W,
    mut ws_events: R,
    events: mpsc::Sender<SocketEvent>,
    mut commands: mpsc::Receiver<Command>,
) where
    W: SinkExt<WsMessage> + Unpin,
    W::Error: std::fmt::Display,
    R: StreamExt<Item = Result<WsMessage, tokio_tungstenite::tungstenite::Error>> + Unpin,
{
    let mut next_request_id: u64 = 1;
    let mut pending: HashMap<u64, oneshot::Sender<Result<SendAck, ChannelError>>> = HashMap::new();

    let close_reason = loop {
        tokio::select! {
            command = commands.recv() => match command {
                Some(Command::Send { payload, reply }) => {
                    let request_id = next_request_id;
                    next_request_id += 1;

                    let frame = ClientFrame::Send { request_id, payload: &payload };
                    let body = match serde_json::to_string(&frame) {
                        Ok(body) => body,
                        Err(e) => {
                            let _ = reply.send(Err(ChannelError::Other(format!(
                                "encode send frame: {}", e
                            ))));
                            continue;
                        }
                    };

                    if let Err(e) = sink.send(WsMessage::text(body)).await {
                        warn!(error = %e, "gateway write failed");
                        let _ = reply.send(Err(ChannelError::Disconnected(
                            DisconnectReason::ConnectionLost,
                        )));
                        break DisconnectReason::ConnectionLost;
                    }
                    pending.insert(request_id, reply);
                }
                Some(Command::Close) | None => {
                    let _ = sink.send(WsMessage::Close(None)).await;
                    // A deliberate close is not a disconnect; don't emit one.
                    return;
                }
            },
            frame = ws_events.next() => match frame {
                Some(Ok(WsMessage::Text(body))) => {
                    match serde_json::from_str::<ServerFrame>(body.as_str()) {
                        Ok(ServerFrame::Ack(ack)) => {
                            if let Some(reply) = pending.remove(&ack.request_id) {
                                let _ = reply.send(Ok(ack));
                            } else {
                                debug!(request_id = ack.request_id, "ack without pending send");
                            }
                        }
                        Ok(ServerFrame::Qr { code }) => {
                            let _ = events.send(SocketEvent::Qr { code }).await;
                        }
                        Ok(ServerFrame::Paired { session }) => {
                            let _ = events.send(SocketEvent::Paired { session }).await;
                        }
                        Ok(ServerFrame::Connected) => {
                            let _ = events.send(SocketEvent::Connected).await;
                        }
                        Ok(ServerFrame::Message(message)) => {
                            let _ = events.send(SocketEvent::Message(message)).await;
                        }
                        Ok(ServerFrame::Disconnected { code }) => {
                            break classify_close_code(code);
                        }
                        Err(e) => {
                            debug!(error = %e, "ignoring unparseable gateway frame");
                        }
                    }
                }
                Some(Ok(WsMessage::Close(frame))) => {
                    break frame
                        .map(|f| classify_close_code(f.code.into()))
                        .unwrap_or(DisconnectReason::Unknown);
                }
                Some(Ok(_)) => {} // ping/pong/binary keepalive
                Some(Err(e)) => {
                    warn!(error = %e, "gateway read failed");
                    break DisconnectReason::ConnectionLost;
                }
                None => break DisconnectReason::ConnectionLost,
            },
        }
    };

    for (_, reply) in pending.drain() {
        let _ = reply.send(Err(ChannelError::Disconnected(close_reason)));
    }
    let _ = events.send(SocketEvent::Closed { reason: close_reason }).await;
}
