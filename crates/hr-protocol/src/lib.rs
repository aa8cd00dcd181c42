//! Typed client for the HyveRelay cloud gateway.
//!
//! Seven endpoints under one base URL: `register`, `activate`, `revoke`,
//! `heartbeat`, `inbound`, `outbound`, `ack`. All JSON over HTTPS with a
//! 30-second per-request timeout. Endpoints that require the device token
//! fail fast with [`ProtocolError::NoDeviceToken`] before any network I/O.

mod client;
mod error;
mod types;

pub use client::RelayClient;
pub use error::{ProtocolError, Result};
pub use types::{
    ActivateResponse, DeviceMetadata, HeartbeatResponse, HeartbeatStatus, InboundResponse,
    RegisterResponse,
};
