//! On-disk persistence for the configuration document and per-channel
//! credential directories.
//!
//! Layout under the agent home (default `~/.hyverelay`, override via
//! `HYVERELAY_HOME`):
//!
//! ```text
//! <home>/            0700
//!   config.json      0600
//!   whatsapp/        0700, owned by the WhatsApp plugin
//!   signal/          0700, owned by the Signal plugin
//!   imessage/        0700, owned by the iMessage plugin
//!   logs/relay.log   optional file sink
//! ```

use std::path::{Path, PathBuf};

use hr_common::ChannelTag;
use tracing::warn;

use crate::{AgentConfig, ConfigError};

/// Env var relocating the agent home (tests, unattended installs).
pub const HOME_ENV_VAR: &str = "HYVERELAY_HOME";

const CONFIG_FILE: &str = "config.json";

#[cfg(unix)]
const DIR_MODE: u32 = 0o700;
#[cfg(unix)]
const FILE_MODE: u32 = 0o600;

/// Reads and writes the agent's single configuration document.
#[derive(Debug, Clone)]
pub struct ConfigStore {
    root: PathBuf,
}

impl ConfigStore {
    /// Open the default store, creating the agent home if needed.
    pub fn open() -> Result<Self, ConfigError> {
        let root = match std::env::var_os(HOME_ENV_VAR) {
            Some(dir) => PathBuf::from(dir),
            None => {
                let home = std::env::var_os("HOME").ok_or(ConfigError::NoHome)?;
                PathBuf::from(home).join(".hyverelay")
            }
        };
        Self::at(root)
    }

    /// Open a store rooted at an explicit directory.
    pub fn at(root: impl Into<PathBuf>) -> Result<Self, ConfigError> {
        let root = root.into();
        create_private_dir(&root)?;
        Ok(Self { root })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn config_path(&self) -> PathBuf {
        self.root.join(CONFIG_FILE)
    }

    pub fn log_file_path(&self) -> PathBuf {
        self.root.join("logs").join("relay.log")
    }

    /// Load the document, merging the on-disk partial with defaults.
    ///
    /// Never fails: a missing file yields defaults, invalid content logs a
    /// warning and yields defaults.
    pub fn load(&self) -> AgentConfig {
        let path = self.config_path();
        let raw = match std::fs::read_to_string(&path) {
            Ok(raw) => raw,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return AgentConfig::default(),
            Err(e) => {
                warn!(path = %path.display(), error = %e, "unable to read config, using defaults");
                return AgentConfig::default();
            }
        };

        match serde_json::from_str::<AgentConfig>(&raw) {
            Ok(config) => config,
            Err(e) => {
                warn!(path = %path.display(), error = %e, "invalid config document, using defaults");
                AgentConfig::default()
            }
        }
    }

    /// Atomically persist the whole document (write-to-temp then rename),
    /// file mode 0600.
    pub fn save(&self, config: &AgentConfig) -> Result<(), ConfigError> {
        create_private_dir(&self.root)?;

        let body = serde_json::to_vec_pretty(config)?;
        let tmp = self.root.join(format!(".{}.tmp-{}", CONFIG_FILE, uuid::Uuid::new_v4()));
        std::fs::write(&tmp, &body)?;
        set_private_file_mode(&tmp)?;
        std::fs::rename(&tmp, self.config_path())?;
        Ok(())
    }

    /// Record the result of activation. `relay_id` and `device_token` are
    /// always written together, never independently.
    pub fn store_activation(
        &self,
        config: &mut AgentConfig,
        channel: ChannelTag,
        relay_id: String,
        device_token: String,
    ) -> Result<(), ConfigError> {
        config.channel = Some(channel);
        config.relay_id = Some(relay_id);
        config.device_token = Some(device_token);
        self.save(config)
    }

    /// Drop both server-issued identifiers after the device was revoked.
    pub fn clear_activation(&self, config: &mut AgentConfig) -> Result<(), ConfigError> {
        config.relay_id = None;
        config.device_token = None;
        self.save(config)
    }

    /// Credential directory for one channel, created on demand with
    /// owner-only permissions. Owned exclusively by that channel's plugin.
    pub fn channel_dir(&self, channel: ChannelTag) -> Result<PathBuf, ConfigError> {
        let dir = self.root.join(channel.as_str());
        create_private_dir(&dir)?;
        Ok(dir)
    }
}

fn create_private_dir(dir: &Path) -> Result<(), ConfigError> {
    std::fs::create_dir_all(dir)?;
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        std::fs::set_permissions(dir, std::fs::Permissions::from_mode(DIR_MODE))?;
    }
    Ok(())
}

fn set_private_file_mode(path: &Path) -> Result<(), ConfigError> {
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        std::fs::set_permissions(path, std::fs::Permissions::from_mode(FILE_MODE))?;
    }
    #[cfg(not(unix))]
    let _ = path;
    Ok(())
}
