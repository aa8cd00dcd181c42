//! Request/response bodies for the seven gateway endpoints.

use chrono::{DateTime, Utc};
use hr_common::{ChannelTag, ConnectionState};
use serde::{Deserialize, Serialize};

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub(crate) struct RegisterRequest<'a> {
    pub channel: ChannelTag,
    pub label: &'a str,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RegisterResponse {
    pub relay_id: String,
    pub activation_code: String,
    pub activation_code_expires_at: DateTime<Utc>,
}

/// Host details reported at activation time.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DeviceMetadata {
    pub os: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub hostname: Option<String>,
}

impl DeviceMetadata {
    pub fn current() -> Self {
        Self {
            os: std::env::consts::OS.to_string(),
            hostname: std::env::var("HOSTNAME").ok(),
        }
    }
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub(crate) struct ActivateRequest<'a> {
    pub relay_id: &'a str,
    pub activation_code: &'a str,
    pub version: &'a str,
    pub device_metadata: &'a DeviceMetadata,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ActivateResponse {
    pub device_token: String,
    pub token_expires_at: Option<DateTime<Utc>>,
    pub heartbeat_interval_seconds: u64,
    pub outbound_poll_interval_seconds: u64,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub(crate) struct RevokeRequest<'a> {
    pub relay_id: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<&'a str>,
}

/// Liveness snapshot sent with every heartbeat.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct HeartbeatStatus {
    pub version: String,
    pub uptime_seconds: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub platform_status: Option<ConnectionState>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub(crate) struct HeartbeatRequest<'a> {
    pub relay_id: &'a str,
    #[serde(flatten)]
    pub status: &'a HeartbeatStatus,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HeartbeatResponse {
    pub ok: bool,
    #[serde(default)]
    pub has_pending_outbound: bool,
    /// Server-side cadence override; takes effect on the next iteration.
    #[serde(default)]
    pub heartbeat_interval_seconds: Option<u64>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub(crate) struct InboundRequest<'a> {
    pub relay_id: &'a str,
    #[serde(flatten)]
    pub envelope: &'a hr_common::IngressEnvelope,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InboundResponse {
    pub ok: bool,
    #[serde(default)]
    pub dispatched: bool,
    #[serde(default)]
    pub denied: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub(crate) struct AckResponse {
    #[serde(default)]
    pub ok: bool,
}

/// 4xx bodies carry `{ error | message }`.
#[derive(Debug, Deserialize, Default)]
pub(crate) struct ErrorBody {
    #[serde(default)]
    pub error: Option<String>,
    #[serde(default)]
    pub message: Option<String>,
}

impl ErrorBody {
    pub fn into_message(self, fallback: &str) -> String {
        self.error.or(self.message).unwrap_or_else(|| fallback.to_string())
    }
}
