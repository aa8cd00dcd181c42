//! Inbound pipeline: plugin → cloud.
//!
//! Envelopes are forwarded serially in the plugin's emission order. A
//! retryable failure gets exactly one immediate retry; after that the
//! envelope is logged and dropped — the cloud is the source of truth and no
//! local inbound store exists by design. Errors never propagate back into
//! the plugin.

use std::sync::Arc;

use hr_common::IngressEnvelope;
use hr_protocol::RelayClient;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

pub struct InboundPipeline {
    client: Arc<RelayClient>,
    relay_id: String,
}

impl InboundPipeline {
    pub fn new(client: Arc<RelayClient>, relay_id: String) -> Self {
        Self { client, relay_id }
    }

    /// Drain the plugin's envelope stream until cancellation. An in-flight
    /// forward finishes before the loop returns.
    pub async fn run(
        self,
        mut envelopes: mpsc::Receiver<IngressEnvelope>,
        cancel: CancellationToken,
    ) {
        loop {
            let envelope = tokio::select! {
                _ = cancel.cancelled() => break,
                envelope = envelopes.recv() => match envelope {
                    Some(envelope) => envelope,
                    None => break,
                },
            };
            self.forward(envelope).await;
        }
        debug!("inbound pipeline stopped");
    }

    async fn forward(&self, envelope: IngressEnvelope) {
        let first = self.client.send_inbound(&self.relay_id, &envelope).await;
        let error = match first {
            Ok(response) => {
                if let Some(denied) = response.denied {
                    warn!(
                        platform_message_id = %envelope.platform_message_id,
                        %denied,
                        "cloud denied inbound message"
                    );
                }
                return;
            }
            Err(e) => e,
        };

        if !error.is_retryable() {
            warn!(
                platform_message_id = %envelope.platform_message_id,
                error = %error,
                "dropping inbound message (permanent failure)"
            );
            return;
        }

        // One immediate retry, then drop; heartbeat's pending-outbound hint
        // covers longer outages.
        match self.client.send_inbound(&self.relay_id, &envelope).await {
            Ok(_) => {}
            Err(e) => {
                warn!(
                    platform_message_id = %envelope.platform_message_id,
                    error = %e,
                    "dropping inbound message after retry"
                );
            }
        }
    }
}
