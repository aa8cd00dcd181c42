//! Outbound poller and dispatcher: cloud → plugin.
//!
//! One loop: cancellation-aware sleep, poll, dispatch the batch through a
//! bounded-concurrency gate, ack every attempt. Permits are acquired in
//! batch order, so deliveries start FIFO within a poll; with a gate of one
//! they are strictly sequential. Ids whose ack has landed are remembered so
//! an id is never acked twice, even if a slow cloud returns it again.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use hr_channels::ChannelPlugin;
use hr_common::backoff::{self, BackoffPolicy, SleepOutcome};
use hr_common::{DeliveryAck, DeliveryOutcome, OutboundMessage};
use hr_protocol::RelayClient;
use parking_lot::Mutex;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

/// A hung `deliver` is cut off here and acked retryable.
pub(crate) const DELIVER_DEADLINE: Duration = Duration::from_secs(60);

/// Ack retries: short backoff, bounded attempts, then drop (the cloud will
/// re-deliver; the dispatcher tolerates that).
const ACK_ATTEMPTS: u32 = 3;
const ACK_BACKOFF_INITIAL_MS: u64 = 250;
const ACK_BACKOFF_MAX_MS: u64 = 2_000;

pub struct OutboundDispatcher {
    client: Arc<RelayClient>,
    plugin: Arc<dyn ChannelPlugin>,
    relay_id: String,
    poll_interval: Duration,
    max_per_poll: u32,
    poll_backoff: BackoffPolicy,
    acked: Arc<Mutex<HashSet<String>>>,
}

impl OutboundDispatcher {
    pub fn new(
        client: Arc<RelayClient>,
        plugin: Arc<dyn ChannelPlugin>,
        relay_id: String,
        poll_interval: Duration,
        max_per_poll: u32,
        poll_backoff: BackoffPolicy,
    ) -> Self {
        Self {
            client,
            plugin,
            relay_id,
            poll_interval,
            max_per_poll: max_per_poll.max(1),
            poll_backoff,
            acked: Arc::new(Mutex::new(HashSet::new())),
        }
    }

    /// Poll-and-dispatch until cancellation. In-flight deliveries and acks
    /// finish before the loop returns.
    pub async fn run(self, cancel: CancellationToken) {
        let mut poll_failures: u32 = 0;

        loop {
            let delay = if poll_failures == 0 {
                self.poll_interval
            } else {
                self.poll_backoff.delay(poll_failures - 1)
            };
            if backoff::sleep(delay, &cancel).await == SleepOutcome::Aborted {
                break;
            }

            let messages = match self.client.poll_outbound(&self.relay_id).await {
                Ok(messages) => {
                    poll_failures = 0;
                    messages
                }
                Err(e) => {
                    poll_failures += 1;
                    warn!(error = %e, poll_failures, "outbound poll failed");
                    continue;
                }
            };

            if !messages.is_empty() {
                debug!(count = messages.len(), "dispatching outbound batch");
                self.dispatch_batch(messages, &cancel).await;
            }
        }
        debug!("outbound dispatcher stopped");
    }

    /// Dispatch one poll's batch under the concurrency gate and wait for
    /// every delivery and ack to finish.
    async fn dispatch_batch(&self, messages: Vec<OutboundMessage>, cancel: &CancellationToken) {
        let gate = Arc::new(Semaphore::new(self.max_per_poll as usize));
        let mut inflight = JoinSet::new();

        for message in messages {
            if cancel.is_cancelled() {
                break;
            }
            if self.acked.lock().contains(&message.id) {
                debug!(id = %message.id, "skipping already-acked outbound message");
                continue;
            }

            // Acquiring in loop order keeps dispatch FIFO within the batch.
            let permit = match gate.clone().acquire_owned().await {
                Ok(permit) => permit,
                Err(_) => break,
            };

            let client = self.client.clone();
            let plugin = self.plugin.clone();
            let acked = self.acked.clone();
            let cancel = cancel.clone();
            inflight.spawn(async move {
                let _permit = permit;
                dispatch_one(client, plugin, acked, message, &cancel).await;
            });
        }

        while inflight.join_next().await.is_some() {}
    }
}

async fn dispatch_one(
    client: Arc<RelayClient>,
    plugin: Arc<dyn ChannelPlugin>,
    acked: Arc<Mutex<HashSet<String>>>,
    message: OutboundMessage,
    cancel: &CancellationToken,
) {
    let started = tokio::time::Instant::now();
    let outcome = match tokio::time::timeout(DELIVER_DEADLINE, plugin.deliver(&message.envelope))
        .await
    {
        Ok(outcome) => outcome,
        Err(_) => {
            warn!(id = %message.id, "delivery exceeded deadline");
            DeliveryOutcome::failed_retryable("delivery timed out")
        }
    };
    let duration_ms = started.elapsed().as_millis() as u64;

    if outcome.success {
        debug!(id = %message.id, duration_ms, "outbound message delivered");
    } else {
        warn!(
            id = %message.id,
            duration_ms,
            retryable = outcome.retryable,
            error = outcome.error.as_deref().unwrap_or("unknown"),
            "outbound delivery failed"
        );
    }

    let ack = DeliveryAck {
        outbound_message_id: message.id.clone(),
        success: outcome.success,
        platform_message_id: outcome.platform_message_id,
        error: outcome.error,
        retryable: if outcome.success { None } else { Some(outcome.retryable) },
        duration_ms,
    };

    // Once the ack has landed, the id is settled cloud-side — regardless of
    // whether the delivery itself succeeded or failed.
    if send_ack(&client, &ack, cancel).await {
        acked.lock().insert(message.id);
    }
}

/// Post the ack with short bounded retries. Returns whether it landed.
async fn send_ack(client: &RelayClient, ack: &DeliveryAck, cancel: &CancellationToken) -> bool {
    let policy = BackoffPolicy::from_millis(ACK_BACKOFF_INITIAL_MS, ACK_BACKOFF_MAX_MS);

    for attempt in 0..ACK_ATTEMPTS {
        match client.ack_outbound(ack).await {
            Ok(()) => return true,
            Err(e) if e.is_retryable() && attempt + 1 < ACK_ATTEMPTS => {
                debug!(id = %ack.outbound_message_id, error = %e, attempt, "ack failed, retrying");
                if backoff::sleep(policy.delay(attempt), cancel).await == SleepOutcome::Aborted {
                    return false;
                }
            }
            Err(e) => {
                warn!(id = %ack.outbound_message_id, error = %e, "dropping ack after final attempt");
                return false;
            }
        }
    }
    false
}
