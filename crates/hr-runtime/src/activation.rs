//! Activation flow: `register` + `activate`, then persist.
//!
//! Two separate endpoints: registration yields a relay id and a short-lived
//! activation code; the code is then exchanged for the long-lived device
//! token within its TTL. The resulting identifiers are written to disk
//! together, never independently.

use hr_common::ChannelTag;
use hr_config::{AgentConfig, ConfigError, ConfigStore};
use hr_protocol::{DeviceMetadata, ProtocolError, RelayClient};
use thiserror::Error;
use tracing::info;

#[derive(Error, Debug)]
pub enum ActivationError {
    #[error(transparent)]
    Protocol(#[from] ProtocolError),

    #[error(transparent)]
    Config(#[from] ConfigError),
}

/// Register this install, exchange the activation code for a device token,
/// persist the updated document, and arm the client with the token.
pub async fn activate_agent(
    client: &RelayClient,
    store: &ConfigStore,
    config: &mut AgentConfig,
    channel: ChannelTag,
    label: &str,
    user_identity_token: &str,
) -> Result<(), ActivationError> {
    let registered = client.register(channel, label, user_identity_token).await?;
    info!(relay_id = %registered.relay_id, "relay registered");

    let activated = client
        .activate(
            &registered.relay_id,
            &registered.activation_code,
            env!("CARGO_PKG_VERSION"),
            &DeviceMetadata::current(),
        )
        .await?;

    // Server-supplied cadences become the persisted baseline.
    config.heartbeat.interval_seconds = activated.heartbeat_interval_seconds.max(1);
    config.outbound.poll_interval_seconds = activated.outbound_poll_interval_seconds.max(1);

    store.store_activation(
        config,
        channel,
        registered.relay_id,
        activated.device_token.clone(),
    )?;
    client.set_device_token(activated.device_token);

    info!(%channel, "relay activated");
    Ok(())
}
