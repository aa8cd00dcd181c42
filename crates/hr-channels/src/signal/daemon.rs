//! Lifecycle of the external signal-cli daemon.

use std::path::{Path, PathBuf};
use std::time::Duration;

use tokio::process::{Child, Command};
use tracing::{debug, info, warn};

use crate::{ChannelError, Result};

/// The external binary that speaks the Signal protocol.
pub const DAEMON_BINARY: &str = "signal-cli";

/// Fixed local port for the daemon's HTTP endpoint.
pub const DAEMON_PORT: u16 = 8980;

const HEALTH_POLL_INTERVAL: Duration = Duration::from_millis(500);
const HEALTH_DEADLINE: Duration = Duration::from_secs(30);

/// Locate the daemon binary on PATH. A missing binary is a distinct,
/// user-actionable error, separate from any runtime failure.
pub fn find_binary() -> Result<PathBuf> {
    let path = std::env::var_os("PATH")
        .ok_or_else(|| ChannelError::BinaryMissing(DAEMON_BINARY.to_string()))?;

    for dir in std::env::split_paths(&path) {
        let candidate = dir.join(DAEMON_BINARY);
        if is_executable(&candidate) {
            return Ok(candidate);
        }
    }
    Err(ChannelError::BinaryMissing(DAEMON_BINARY.to_string()))
}

fn is_executable(path: &Path) -> bool {
    let Ok(metadata) = std::fs::metadata(path) else {
        return false;
    };
    if !metadata.is_file() {
        return false;
    }
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        metadata.permissions().mode() & 0o111 != 0
    }
    #[cfg(not(unix))]
    true
}

/// A running daemon bound to localhost.
pub struct DaemonHandle {
    child: Child,
    base_url: String,
}

impl DaemonHandle {
    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    /// Spawn the daemon against `data_dir` and wait for its health endpoint
    /// to come up. The child is killed if health never materializes.
    pub async fn spawn(
        binary: &Path,
        data_dir: &Path,
        port: u16,
        http: &reqwest::Client,
    ) -> Result<Self> {
        let addr = format!("127.0.0.1:{}", port);
        debug!(binary = %binary.display(), %addr, "spawning signal daemon");

        let child = Command::new(binary)
            .arg("--config")
            .arg(data_dir)
            .arg("daemon")
            .arg("--http")
            .arg(&addr)
            .stdin(std::process::Stdio::null())
            .stdout(std::process::Stdio::null())
            .stderr(std::process::Stdio::null())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| ChannelError::Other(format!("failed to spawn {}: {}", DAEMON_BINARY, e)))?;

        let mut handle = Self { child, base_url: format!("http://{}", addr) };

        if let Err(e) = handle.wait_healthy(http).await {
            handle.stop().await;
            return Err(e);
        }

        info!(%addr, "signal daemon is healthy");
        Ok(handle)
    }

    /// Poll `/api/v1/health` every 500 ms until it answers, bounded by a
    /// 30 s deadline.
    async fn wait_healthy(&mut self, http: &reqwest::Client) -> Result<()> {
        let url = format!("{}/api/v1/health", self.base_url);
        let deadline = tokio::time::Instant::now() + HEALTH_DEADLINE;

        loop {
            if let Ok(Some(status)) = self.child.try_wait() {
                return Err(ChannelError::Other(format!(
                    "signal daemon exited during startup ({})",
                    status
                )));
            }

            match http.get(&url).timeout(HEALTH_POLL_INTERVAL).send().await {
                Ok(response) if response.status().is_success() => return Ok(()),
                Ok(response) => debug!(status = %response.status(), "daemon not ready"),
                Err(e) => debug!(error = %e, "daemon health probe failed"),
            }

            if tokio::time::Instant::now() >= deadline {
                return Err(ChannelError::Other(
                    "signal daemon did not become healthy within 30s".to_string(),
                ));
            }
            tokio::time::sleep(HEALTH_POLL_INTERVAL).await;
        }
    }

    /// Terminate the child and reap it.
    pub async fn stop(&mut self) {
        if let Err(e) = self.child.start_kill() {
            warn!(error = %e, "failed to kill signal daemon");
            return;
        }
        let _ = self.child.wait().await;
        debug!("signal daemon stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn missing_binary_is_a_distinct_error() {
        // An empty PATH guarantees the lookup fails regardless of the host.
        let original = std::env::var_os("PATH");
        std::env::set_var("PATH", "");
        let result = find_binary();
        if let Some(path) = original {
            std::env::set_var("PATH", path);
        }

        match result {
            Err(ChannelError::BinaryMissing(name)) => assert_eq!(name, DAEMON_BINARY),
            other => panic!("expected BinaryMissing, got {other:?}"),
        }
    }
}
