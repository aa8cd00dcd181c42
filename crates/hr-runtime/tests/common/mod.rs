//! Shared test double for the channel plugin contract.
#![allow(dead_code)]

use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use hr_channels::{ChannelError, ChannelPlugin, InboundSender, SupportStatus};
use hr_common::{ChannelTag, ConnectionState, DeliveryOutcome, EgressEnvelope};
use parking_lot::{Mutex, RwLock};
use tokio_util::sync::CancellationToken;

/// Scripted plugin: records deliver order, counts start calls, and can end
/// its first sessions with configured errors before settling into
/// run-until-cancelled.
pub struct MockPlugin {
    status: RwLock<ConnectionState>,
    start_calls: AtomicU32,
    deliver_delay: Duration,
    deliver_outcome: Mutex<Box<dyn Fn(&EgressEnvelope) -> DeliveryOutcome + Send>>,
    delivered: Mutex<Vec<String>>,
    /// Errors to end the first N `start` calls with, in order.
    start_script: Mutex<Vec<ChannelError>>,
    logged_out: AtomicBool,
}

impl MockPlugin {
    pub fn new() -> Self {
        Self {
            status: RwLock::new(ConnectionState::Disconnected),
            start_calls: AtomicU32::new(0),
            deliver_delay: Duration::ZERO,
            deliver_outcome: Mutex::new(Box::new(|_| DeliveryOutcome::delivered("mock-1"))),
            delivered: Mutex::new(Vec::new()),
            start_script: Mutex::new(Vec::new()),
            logged_out: AtomicBool::new(false),
        }
    }

    pub fn with_deliver_delay(mut self, delay: Duration) -> Self {
        self.deliver_delay = delay;
        self
    }

    pub fn with_deliver_outcome(
        self,
        outcome: impl Fn(&EgressEnvelope) -> DeliveryOutcome + Send + 'static,
    ) -> Self {
        *self.deliver_outcome.lock() = Box::new(outcome);
        self
    }

    /// End the next `start` calls with these errors, in order.
    pub fn script_start_errors(self, errors: Vec<ChannelError>) -> Self {
        *self.start_script.lock() = errors;
        self
    }

    pub fn delivered(&self) -> Vec<String> {
        self.delivered.lock().clone()
    }

    pub fn deliver_count(&self) -> usize {
        self.delivered.lock().len()
    }

    pub fn start_calls(&self) -> u32 {
        self.start_calls.load(Ordering::SeqCst)
    }

    pub fn was_logged_out(&self) -> bool {
        self.logged_out.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl ChannelPlugin for MockPlugin {
    fn channel(&self) -> ChannelTag {
        ChannelTag::Signal
    }

    fn display_name(&self) -> &'static str {
        "Mock"
    }

    fn support(&self) -> SupportStatus {
        SupportStatus::supported()
    }

    async fn is_authenticated(&self) -> bool {
        !self.logged_out.load(Ordering::SeqCst)
    }

    async fn login(&self) -> hr_channels::Result<()> {
        Ok(())
    }

    async fn start(
        &self,
        _inbound: InboundSender,
        cancel: CancellationToken,
    ) -> hr_channels::Result<()> {
        self.start_calls.fetch_add(1, Ordering::SeqCst);
        *self.status.write() = ConnectionState::Connected;

        let scripted = {
            let mut script = self.start_script.lock();
            if script.is_empty() {
                None
            } else {
                Some(script.remove(0))
            }
        };
        let result = match scripted {
            Some(error) => {
                // Hold the session open briefly so the supervisor observes
                // the bind before the scripted end.
                tokio::time::sleep(Duration::from_millis(150)).await;
                Err(error)
            }
            None => {
                cancel.cancelled().await;
                Ok(())
            }
        };

        *self.status.write() = ConnectionState::Disconnected;
        result
    }

    async fn deliver(&self, envelope: &EgressEnvelope) -> DeliveryOutcome {
        if !self.deliver_delay.is_zero() {
            tokio::time::sleep(self.deliver_delay).await;
        }
        self.delivered.lock().push(envelope.text.clone());
        (*self.deliver_outcome.lock())(envelope)
    }

    fn status(&self) -> ConnectionState {
        *self.status.read()
    }

    async fn logout(&self) -> hr_channels::Result<()> {
        self.logged_out.store(true, Ordering::SeqCst);
        *self.status.write() = ConnectionState::Disconnected;
        Ok(())
    }
}

impl Default for MockPlugin {
    fn default() -> Self {
        Self::new()
    }
}

/// An outbound message body as the cloud's poll endpoint returns it.
pub fn outbound_json(id: &str, text: &str) -> serde_json::Value {
    serde_json::json!({
        "id": id,
        "envelope": {"channel": "signal", "conversationId": "+1555", "text": text},
        "queuedAt": "2023-11-14T22:13:20Z",
        "priority": 0,
        "attempts": 0
    })
}
