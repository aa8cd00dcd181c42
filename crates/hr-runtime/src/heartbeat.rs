//! Heartbeat loop: periodic liveness writes with server-tunable cadence.

use std::sync::Arc;
use std::time::{Duration, Instant};

use hr_channels::ChannelPlugin;
use hr_common::backoff::{self, SleepOutcome};
use hr_protocol::{HeartbeatStatus, RelayClient};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

/// Why the heartbeat loop returned.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HeartbeatEnd {
    Cancelled,
    /// 401 from the gateway: the device was revoked. Terminal.
    Revoked,
}

pub struct HeartbeatLoop {
    client: Arc<RelayClient>,
    plugin: Arc<dyn ChannelPlugin>,
    relay_id: String,
    interval: Duration,
    version: String,
    started_at: Instant,
}

impl HeartbeatLoop {
    pub fn new(
        client: Arc<RelayClient>,
        plugin: Arc<dyn ChannelPlugin>,
        relay_id: String,
        interval: Duration,
        version: String,
        started_at: Instant,
    ) -> Self {
        Self { client, plugin, relay_id, interval, version, started_at }
    }

    fn snapshot(&self) -> HeartbeatStatus {
        HeartbeatStatus {
            version: self.version.clone(),
            uptime_seconds: self.started_at.elapsed().as_secs(),
            platform_status: Some(self.plugin.status()),
        }
    }

    /// Beat every interval until cancelled or revoked. Transient failures
    /// are absorbed; the next interval simply tries again.
    pub async fn run(mut self, cancel: CancellationToken) -> HeartbeatEnd {
        loop {
            if backoff::sleep(self.interval, &cancel).await == SleepOutcome::Aborted {
                return HeartbeatEnd::Cancelled;
            }

            match self.client.heartbeat(&self.relay_id, &self.snapshot()).await {
                Ok(response) => {
                    if response.has_pending_outbound {
                        // The outbound loop runs on its own cadence; the
                        // hint is recorded, not acted on.
                        debug!("cloud reports pending outbound messages");
                    }
                    if let Some(seconds) = response.heartbeat_interval_seconds {
                        let updated = Duration::from_secs(seconds.max(1));
                        if updated != self.interval {
                            debug!(
                                interval_seconds = seconds,
                                "heartbeat interval updated by server"
                            );
                            self.interval = updated;
                        }
                    }
                }
                Err(e) if e.is_auth_revoked() => {
                    warn!("heartbeat rejected: device revoked");
                    return HeartbeatEnd::Revoked;
                }
                Err(e) => {
                    warn!(error = %e, "heartbeat failed");
                }
            }
        }
    }
}
