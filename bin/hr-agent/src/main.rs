//! HyveRelay agent: the long-lived relay process.
//!
//! Loads the configuration document, builds the channel registry, and runs
//! the supervisor in the foreground until a termination signal fires the
//! shared cancellation token. Identical behavior foreground or supervised
//! by an init system.
//!
//! Exit codes: 0 graceful, 1 general error, 2 configuration error,
//! 3 missing binary/store, 4 unauthorized/revoked, 130 interrupted.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use hr_channels::{ChannelError, ChannelPlugin, ChannelRegistry};
use hr_config::ConfigStore;
use hr_protocol::RelayClient;
use hr_runtime::{RunEnd, Supervisor, SupervisorError};
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

/// Env var carrying a device bearer for unattended installs.
const TOKEN_ENV_VAR: &str = "HYVERELAY_TOKEN";

const EXIT_GENERAL: i32 = 1;
const EXIT_USAGE: i32 = 2;
const EXIT_NOT_FOUND: i32 = 3;
const EXIT_UNAUTHORIZED: i32 = 4;
const EXIT_INTERRUPTED: i32 = 130;

#[tokio::main]
async fn main() {
    let _ = dotenvy::dotenv();
    let code = run().await;
    std::process::exit(code);
}

async fn run() -> i32 {
    let store = match ConfigStore::open() {
        Ok(store) => store,
        Err(e) => {
            eprintln!("cannot open agent home: {e}");
            return EXIT_USAGE;
        }
    };

    let mut config = store.load();
    let log_file = config.logging.file_sink.then(|| store.log_file_path());
    hr_common::logging::init_logging(&config.logging.level, log_file.as_deref());

    if let Err(e) = config.validate() {
        error!(error = %e, "configuration is invalid; refusing to start");
        return EXIT_USAGE;
    }

    let client = match RelayClient::new(config.server.base_url.clone()) {
        Ok(client) => Arc::new(client),
        Err(e) => {
            error!(error = %e, "failed to build protocol client");
            return EXIT_GENERAL;
        }
    };

    // Unattended installs inject the device bearer through the environment.
    let env_token = std::env::var(TOKEN_ENV_VAR).ok().filter(|t| !t.is_empty());
    if let Some(token) = env_token {
        config.device_token = Some(token.clone());
        client.set_device_token(token);
    } else if let Some(token) = config.device_token.clone() {
        client.set_device_token(token);
    }

    let Some(channel) = config.channel else {
        error!("no channel configured; complete setup before starting the relay");
        return EXIT_USAGE;
    };

    let registry = match ChannelRegistry::with_builtins(&store) {
        Ok(registry) => registry,
        Err(e) => {
            error!(error = %e, "failed to prepare channel credential directories");
            return EXIT_GENERAL;
        }
    };
    let Some(plugin) = registry.get(channel) else {
        error!(%channel, "no plugin registered for the configured channel");
        return EXIT_USAGE;
    };

    let support = plugin.support();
    if !support.supported {
        error!(
            %channel,
            reason = support.unsupported_reason.as_deref().unwrap_or("unsupported"),
            "channel cannot run on this host"
        );
        return EXIT_NOT_FOUND;
    }

    info!(
        %channel,
        server = %config.server.base_url,
        version = env!("CARGO_PKG_VERSION"),
        "starting relay agent"
    );

    let supervisor = match Supervisor::new(config.clone(), client, plugin) {
        Ok(supervisor) => supervisor,
        Err(SupervisorError::NotActivated) => {
            error!("agent is not activated; complete setup first");
            return EXIT_UNAUTHORIZED;
        }
        Err(e) => {
            error!(error = %e, "failed to build supervisor");
            return EXIT_GENERAL;
        }
    };

    let cancel = CancellationToken::new();
    let interrupted = Arc::new(AtomicBool::new(false));
    tokio::spawn({
        let cancel = cancel.clone();
        let interrupted = interrupted.clone();
        async move {
            #[cfg(unix)]
            {
                use tokio::signal::unix::{signal, SignalKind};
                match signal(SignalKind::terminate()) {
                    Ok(mut sigterm) => tokio::select! {
                        _ = tokio::signal::ctrl_c() => {}
                        _ = sigterm.recv() => {}
                    },
                    Err(e) => {
                        warn!(error = %e, "SIGTERM handler unavailable; handling Ctrl+C only");
                        let _ = tokio::signal::ctrl_c().await;
                    }
                }
            }
            #[cfg(not(unix))]
            {
                let _ = tokio::signal::ctrl_c().await;
            }

            info!("termination signal received; draining");
            interrupted.store(true, Ordering::SeqCst);
            cancel.cancel();
        }
    });

    match supervisor.run(cancel).await {
        Ok(RunEnd::Stopped) => {
            info!("relay agent stopped");
            if interrupted.load(Ordering::SeqCst) {
                EXIT_INTERRUPTED
            } else {
                0
            }
        }
        Ok(RunEnd::Revoked) => {
            // Drop both identifiers together; the next run starts clean.
            if let Err(e) = store.clear_activation(&mut config) {
                warn!(error = %e, "failed to clear activation after revocation");
            }
            EXIT_UNAUTHORIZED
        }
        Err(SupervisorError::Channel(ChannelError::BinaryMissing(binary))) => {
            error!(%binary, "required external binary is not installed");
            EXIT_NOT_FOUND
        }
        Err(SupervisorError::NotActivated) => EXIT_UNAUTHORIZED,
        Err(e) => {
            error!(error = %e, "relay agent failed");
            EXIT_GENERAL
        }
    }
}
