//! Supervisor: owns the active plugin and the three loops, drives the agent
//! state machine, and coordinates cancellation.
//!
//! States: `Unconfigured → Activating → Idle → Starting → Running →
//! Draining → Stopped`, plus terminal `Revoked`. Plugin-transient
//! disconnects re-enter `Starting` with capped backoff under a cumulative
//! watchdog; `logged-out` and heartbeat 401 are terminal.

use std::sync::Arc;
use std::time::{Duration, Instant};

use hr_channels::{ChannelError, ChannelPlugin};
use hr_common::backoff::{self, BackoffPolicy, SleepOutcome};
use hr_common::ConnectionState;
use hr_config::AgentConfig;
use hr_protocol::{HeartbeatStatus, ProtocolError, RelayClient};
use parking_lot::Mutex;
use thiserror::Error;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::heartbeat::{HeartbeatEnd, HeartbeatLoop};
use crate::inbound::InboundPipeline;
use crate::outbound::OutboundDispatcher;

/// Grace period for loops to return after cancellation.
const DRAIN_DEADLINE: Duration = Duration::from_secs(5);
/// The plugin must report `connected` within this window after `start`.
const BIND_DEADLINE: Duration = Duration::from_secs(60);
const BIND_POLL_INTERVAL: Duration = Duration::from_millis(50);
const INBOUND_BUFFER: usize = 64;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AgentState {
    Unconfigured,
    Activating,
    Idle,
    Starting,
    Running,
    Draining,
    Stopped,
    Revoked,
}

impl std::fmt::Display for AgentState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            AgentState::Unconfigured => "unconfigured",
            AgentState::Activating => "activating",
            AgentState::Idle => "idle",
            AgentState::Starting => "starting",
            AgentState::Running => "running",
            AgentState::Draining => "draining",
            AgentState::Stopped => "stopped",
            AgentState::Revoked => "revoked",
        };
        f.write_str(s)
    }
}

/// How a supervisor run concluded.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunEnd {
    /// Graceful stop after cancellation.
    Stopped,
    /// Device revoked (heartbeat 401 or plugin logged-out). Credentials
    /// were wiped; the process should exit non-zero.
    Revoked,
}

#[derive(Error, Debug)]
pub enum SupervisorError {
    #[error("agent is not activated; complete setup first")]
    NotActivated,

    #[error("reconnect watchdog expired after {0:?}")]
    WatchdogExpired(Duration),

    #[error("reconnect attempts exhausted after {0}")]
    AttemptsExhausted(u32),

    #[error(transparent)]
    Channel(#[from] ChannelError),

    #[error(transparent)]
    Protocol(#[from] ProtocolError),
}

pub struct Supervisor {
    config: AgentConfig,
    client: Arc<RelayClient>,
    plugin: Arc<dyn ChannelPlugin>,
    relay_id: String,
    version: String,
    state: Mutex<AgentState>,
    started_at: Instant,
}

enum PhaseEnd {
    Cancelled,
    PluginEnded(Result<(), ChannelError>),
    Heartbeat(HeartbeatEnd),
}

impl Supervisor {
    pub fn new(
        config: AgentConfig,
        client: Arc<RelayClient>,
        plugin: Arc<dyn ChannelPlugin>,
    ) -> Result<Self, SupervisorError> {
        if !config.is_activated() || !client.has_device_token() {
            return Err(SupervisorError::NotActivated);
        }
        let support = plugin.support();
        if !support.supported {
            return Err(SupervisorError::Channel(ChannelError::Unsupported(
                support.unsupported_reason.unwrap_or_default(),
            )));
        }
        let relay_id = config.relay_id.clone().expect("activated config has relay id");

        Ok(Self {
            config,
            client,
            plugin,
            relay_id,
            version: env!("CARGO_PKG_VERSION").to_string(),
            state: Mutex::new(AgentState::Idle),
            started_at: Instant::now(),
        })
    }

    pub fn state(&self) -> AgentState {
        *self.state.lock()
    }

    fn transition(&self, to: AgentState) {
        let mut state = self.state.lock();
        if *state != to {
            debug!(from = %*state, to = %to, "state transition");
            *state = to;
        }
    }

    /// Run until cancellation, revocation, or a fatal supervisor error.
    pub async fn run(&self, cancel: CancellationToken) -> Result<RunEnd, SupervisorError> {
        let reconnect = BackoffPolicy::from_millis(
            self.config.reconnect.initial_delay_ms,
            self.config.reconnect.max_delay_ms,
        );
        let watchdog = Duration::from_millis(self.config.reconnect.watchdog_timeout_ms);
        let mut attempts: u32 = 0;
        let mut watchdog_start: Option<Instant> = None;

        loop {
            if cancel.is_cancelled() {
                self.transition(AgentState::Stopped);
                return Ok(RunEnd::Stopped);
            }

            self.transition(AgentState::Starting);
            let run_token = cancel.child_token();

            let (inbound_tx, inbound_rx) = mpsc::channel(INBOUND_BUFFER);
            let (start_done_tx, mut start_done_rx) = oneshot::channel();
            let start_handle: JoinHandle<()> = tokio::spawn({
                let plugin = self.plugin.clone();
                let token = run_token.clone();
                async move {
                    let result = plugin.start(inbound_tx, token).await;
                    let _ = start_done_tx.send(result);
                }
            });

            // Wait for the plugin to bind its session.
            let bind_deadline = tokio::time::Instant::now() + BIND_DEADLINE;
            let bound = loop {
                tokio::select! {
                    result = &mut start_done_rx => {
                        break Err(result.unwrap_or_else(|_| {
                            Err(ChannelError::Other("plugin task vanished".to_string()))
                        }));
                    }
                    _ = tokio::time::sleep(BIND_POLL_INTERVAL) => {
                        if self.plugin.status() == ConnectionState::Connected {
                            break Ok(());
                        }
                        if tokio::time::Instant::now() >= bind_deadline {
                            break Err(Err(ChannelError::Other(
                                "plugin did not bind within the deadline".to_string(),
                            )));
                        }
                    }
                }
            };

            match bound {
                Ok(()) => {}
                Err(start_result) => {
                    self.drain(&run_token, vec![start_handle]).await;
                    match self.classify_plugin_end(start_result, &cancel).await? {
                        Some(end) => return Ok(end),
                        None => {
                            self.backoff_before_retry(
                                &reconnect,
                                watchdog,
                                &mut attempts,
                                &mut watchdog_start,
                                &cancel,
                            )
                            .await?;
                            continue;
                        }
                    }
                }
            }

            // Starting → Running requires a first successful heartbeat.
            let first_beat = self
                .client
                .heartbeat(
                    &self.relay_id,
                    &HeartbeatStatus {
                        version: self.version.clone(),
                        uptime_seconds: self.started_at.elapsed().as_secs(),
                        platform_status: Some(self.plugin.status()),
                    },
                )
                .await;

            let heartbeat_interval = match first_beat {
                Ok(response) => Duration::from_secs(
                    response
                        .heartbeat_interval_seconds
                        .unwrap_or(self.config.heartbeat.interval_seconds)
                        .max(1),
                ),
                Err(e) if e.is_auth_revoked() => {
                    self.drain(&run_token, vec![start_handle]).await;
                    return self.enter_revoked().await;
                }
                Err(e) => {
                    warn!(error = %e, "first heartbeat failed; restarting session");
                    self.drain(&run_token, vec![start_handle]).await;
                    self.backoff_before_retry(
                        &reconnect,
                        watchdog,
                        &mut attempts,
                        &mut watchdog_start,
                        &cancel,
                    )
                    .await?;
                    continue;
                }
            };

            self.transition(AgentState::Running);
            attempts = 0;
            watchdog_start = None;
            info!(channel = %self.plugin.channel(), "relay is running");

            let pipeline = InboundPipeline::new(self.client.clone(), self.relay_id.clone());
            let inbound_handle = tokio::spawn(pipeline.run(inbound_rx, run_token.clone()));

            let dispatcher = OutboundDispatcher::new(
                self.client.clone(),
                self.plugin.clone(),
                self.relay_id.clone(),
                Duration::from_secs(self.config.outbound.poll_interval_seconds),
                self.config.outbound.max_per_poll,
                reconnect,
            );
            let outbound_handle = tokio::spawn(dispatcher.run(run_token.clone()));

            let (hb_done_tx, mut hb_done_rx) = oneshot::channel();
            let hb_handle: JoinHandle<()> = tokio::spawn({
                let hb = HeartbeatLoop::new(
                    self.client.clone(),
                    self.plugin.clone(),
                    self.relay_id.clone(),
                    heartbeat_interval,
                    self.version.clone(),
                    self.started_at,
                );
                let token = run_token.clone();
                async move {
                    let _ = hb_done_tx.send(hb.run(token).await);
                }
            });

            let phase_end = tokio::select! {
                _ = cancel.cancelled() => PhaseEnd::Cancelled,
                result = &mut start_done_rx => PhaseEnd::PluginEnded(
                    result.unwrap_or_else(|_| {
                        Err(ChannelError::Other("plugin task vanished".to_string()))
                    }),
                ),
                end = &mut hb_done_rx => {
                    PhaseEnd::Heartbeat(end.unwrap_or(HeartbeatEnd::Cancelled))
                }
            };

            let handles = vec![start_handle, inbound_handle, outbound_handle, hb_handle];
            match phase_end {
                PhaseEnd::Cancelled => {
                    self.drain(&run_token, handles).await;
                    self.transition(AgentState::Stopped);
                    return Ok(RunEnd::Stopped);
                }
                PhaseEnd::Heartbeat(HeartbeatEnd::Revoked) => {
                    self.drain(&run_token, handles).await;
                    return self.enter_revoked().await;
                }
                PhaseEnd::Heartbeat(HeartbeatEnd::Cancelled) => {
                    // Only reachable when the run token was cancelled out of
                    // band; treat like a transient end.
                    self.drain(&run_token, handles).await;
                }
                PhaseEnd::PluginEnded(result) => {
                    self.drain(&run_token, handles).await;
                    if let Some(end) = self.classify_plugin_end(result, &cancel).await? {
                        return Ok(end);
                    }
                }
            }

            self.backoff_before_retry(
                &reconnect,
                watchdog,
                &mut attempts,
                &mut watchdog_start,
                &cancel,
            )
            .await?;
        }
    }

    /// Decide what a finished plugin `start` means. `Some(end)` terminates
    /// the run; `None` means retry with backoff.
    async fn classify_plugin_end(
        &self,
        result: Result<(), ChannelError>,
        cancel: &CancellationToken,
    ) -> Result<Option<RunEnd>, SupervisorError> {
        match result {
            Ok(()) => {
                // A clean return only happens under cancellation.
                if cancel.is_cancelled() {
                    self.transition(AgentState::Stopped);
                    Ok(Some(RunEnd::Stopped))
                } else {
                    warn!("plugin returned early without cancellation; restarting");
                    Ok(None)
                }
            }
            Err(e) if e.is_fatal() => {
                warn!(error = %e, "plugin session is logged out");
                Ok(Some(self.enter_revoked().await?))
            }
            Err(ChannelError::Disconnected(reason)) => {
                warn!(%reason, "plugin disconnected; will reconnect");
                Ok(None)
            }
            Err(e @ ChannelError::BinaryMissing(_)) | Err(e @ ChannelError::NotAuthenticated) => {
                // Not recoverable by retrying start.
                Err(e.into())
            }
            Err(e) => {
                warn!(error = %e, "plugin start failed; will retry");
                Ok(None)
            }
        }
    }

    async fn enter_revoked(&self) -> Result<RunEnd, SupervisorError> {
        if let Err(e) = self.plugin.logout().await {
            warn!(error = %e, "plugin logout failed during revocation");
        }
        self.transition(AgentState::Revoked);
        error!("device was revoked; the agent must be activated again");
        Ok(RunEnd::Revoked)
    }

    /// Cancel the run token and wait out the drain deadline for every task.
    async fn drain(&self, run_token: &CancellationToken, handles: Vec<JoinHandle<()>>) {
        self.transition(AgentState::Draining);
        run_token.cancel();

        let mut handles = handles;
        let deadline = tokio::time::Instant::now() + DRAIN_DEADLINE;
        for handle in handles.iter_mut() {
            let remaining =
                deadline.saturating_duration_since(tokio::time::Instant::now());
            if tokio::time::timeout(remaining, &mut *handle).await.is_err() {
                warn!("task did not drain within the deadline; aborting");
                handle.abort();
            }
        }
    }

    async fn backoff_before_retry(
        &self,
        policy: &BackoffPolicy,
        watchdog: Duration,
        attempts: &mut u32,
        watchdog_start: &mut Option<Instant>,
        cancel: &CancellationToken,
    ) -> Result<(), SupervisorError> {
        let since = *watchdog_start.get_or_insert_with(Instant::now);
        if since.elapsed() >= watchdog {
            self.transition(AgentState::Stopped);
            return Err(SupervisorError::WatchdogExpired(watchdog));
        }
        if let Some(max) = self.config.reconnect.max_attempts {
            if *attempts >= max {
                self.transition(AgentState::Stopped);
                return Err(SupervisorError::AttemptsExhausted(max));
            }
        }

        let delay = policy.delay(*attempts);
        *attempts += 1;
        debug!(attempt = *attempts, delay_ms = delay.as_millis() as u64, "reconnect backoff");
        if backoff::sleep(delay, cancel).await == SleepOutcome::Aborted {
            self.transition(AgentState::Stopped);
        }
        Ok(())
    }
}
