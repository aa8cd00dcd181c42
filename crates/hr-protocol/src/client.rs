//! Typed HTTPS client for the relay gateway.

use std::time::Duration;

use hr_common::{ChannelTag, DeliveryAck, IngressEnvelope, OutboundMessage};
use parking_lot::RwLock;
use reqwest::{Method, RequestBuilder, StatusCode};
use serde::de::DeserializeOwned;
use tracing::debug;

use crate::error::{ProtocolError, Result};
use crate::types::*;

const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

/// Client for the seven cloud endpoints.
///
/// Stateless apart from the base URL and the device token, and safe to share
/// across concurrent loops. The token is set once during activation, before
/// any loop starts.
#[derive(Debug)]
pub struct RelayClient {
    base_url: String,
    device_token: RwLock<Option<String>>,
    http: reqwest::Client,
}

impl RelayClient {
    pub fn new(base_url: impl Into<String>) -> Result<Self> {
        let http = reqwest::Client::builder()
            .timeout(REQUEST_TIMEOUT)
            .user_agent(format!("HyveRelay/{}", env!("CARGO_PKG_VERSION")))
            .build()
            .map_err(|e| ProtocolError::Network(e.to_string()))?;

        Ok(Self {
            base_url: base_url.into().trim_end_matches('/').to_string(),
            device_token: RwLock::new(None),
            http,
        })
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    /// Install the device token obtained from `activate`. Called once,
    /// before the loops start.
    pub fn set_device_token(&self, token: impl Into<String>) {
        *self.device_token.write() = Some(token.into());
    }

    pub fn has_device_token(&self) -> bool {
        self.device_token.read().as_deref().is_some_and(|t| !t.is_empty())
    }

    fn device_token(&self) -> Result<String> {
        self.device_token
            .read()
            .as_deref()
            .filter(|t| !t.is_empty())
            .map(str::to_string)
            .ok_or(ProtocolError::NoDeviceToken)
    }

    fn request(&self, method: Method, path: &str) -> RequestBuilder {
        self.http.request(method, format!("{}{}", self.base_url, path))
    }

    /// Builder for a device-token endpoint; fails fast before any network
    /// I/O when the token is unset.
    fn device_request(&self, method: Method, path: &str) -> Result<RequestBuilder> {
        let token = self.device_token()?;
        Ok(self.request(method, path).bearer_auth(token))
    }

    async fn execute<T: DeserializeOwned>(&self, request: RequestBuilder) -> Result<T> {
        let response = request.send().await?;
        let status = response.status();

        if status.is_success() {
            return Ok(response.json::<T>().await?);
        }

        let message = match response.json::<ErrorBody>().await {
            Ok(body) => body.into_message(status.canonical_reason().unwrap_or("request failed")),
            Err(_) => status.canonical_reason().unwrap_or("request failed").to_string(),
        };
        Err(ProtocolError::Api { status: status.as_u16(), message })
    }

    /// `POST /register` — obtain a relay id and a short-lived activation
    /// code. Authenticated with the user-identity bearer.
    pub async fn register(
        &self,
        channel: ChannelTag,
        label: &str,
        user_identity_token: &str,
    ) -> Result<RegisterResponse> {
        debug!(%channel, label, "registering relay");
        self.execute(
            self.request(Method::POST, "/register")
                .bearer_auth(user_identity_token)
                .json(&RegisterRequest { channel, label }),
        )
        .await
    }

    /// `POST /activate` — exchange the activation code for a device token.
    /// No bearer: the code is the proof.
    pub async fn activate(
        &self,
        relay_id: &str,
        activation_code: &str,
        version: &str,
        device_metadata: &DeviceMetadata,
    ) -> Result<ActivateResponse> {
        debug!(relay_id, "activating relay");
        self.execute(self.request(Method::POST, "/activate").json(&ActivateRequest {
            relay_id,
            activation_code,
            version,
            device_metadata,
        }))
        .await
    }

    /// `POST /revoke` — user-initiated teardown of a relay.
    pub async fn revoke(
        &self,
        relay_id: &str,
        user_identity_token: &str,
        reason: Option<&str>,
    ) -> Result<()> {
        let _: serde_json::Value = self
            .execute(
                self.request(Method::POST, "/revoke")
                    .bearer_auth(user_identity_token)
                    .json(&RevokeRequest { relay_id, reason }),
            )
            .await?;
        Ok(())
    }

    /// `POST /heartbeat` — periodic liveness write. A 401 here means the
    /// device was revoked.
    pub async fn heartbeat(
        &self,
        relay_id: &str,
        status: &HeartbeatStatus,
    ) -> Result<HeartbeatResponse> {
        self.execute(
            self.device_request(Method::POST, "/heartbeat")?
                .json(&HeartbeatRequest { relay_id, status }),
        )
        .await
    }

    /// `POST /inbound` — forward one normalized ingress envelope.
    pub async fn send_inbound(
        &self,
        relay_id: &str,
        envelope: &IngressEnvelope,
    ) -> Result<InboundResponse> {
        self.execute(
            self.device_request(Method::POST, "/inbound")?
                .json(&InboundRequest { relay_id, envelope }),
        )
        .await
    }

    /// `GET /outbound?relayId=…` — fetch queued replies. Unacked ids keep
    /// reappearing on subsequent polls.
    pub async fn poll_outbound(&self, relay_id: &str) -> Result<Vec<OutboundMessage>> {
        self.execute(
            self.device_request(Method::GET, "/outbound")?.query(&[("relayId", relay_id)]),
        )
        .await
    }

    /// `POST /ack` — report the outcome of one delivery. Must not be
    /// re-attempted for an id that was already acked successfully.
    pub async fn ack_outbound(&self, ack: &DeliveryAck) -> Result<()> {
        let response: AckResponse =
            self.execute(self.device_request(Method::POST, "/ack")?.json(ack)).await?;
        if !response.ok {
            return Err(ProtocolError::Api {
                status: StatusCode::OK.as_u16(),
                message: "gateway rejected ack".to_string(),
            });
        }
        Ok(())
    }
}
