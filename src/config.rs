use std::net::{IpAddr, Ipv4Addr};
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::port::PORT_RANGE_START;

/// Top-level orchestrator config, loaded from TOML. Every section has
/// defaults, so an empty file is valid.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct OrchestratorConfig {
    pub timeouts: TimeoutConfig,
    pub ports: PortConfig,
    pub worker: WorkerConfig,
    pub directory: DirectoryConfig,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TimeoutConfig {
    /// Event loop startup and worker handshake.
    pub connection_ms: u64,
    pub response_ms: u64,
    /// Poll interval of blocking calls.
    pub tick_ms: u64,
}

impl Default for TimeoutConfig {
    fn default() -> Self {
        Self {
            connection_ms: 10_000,
            response_ms: 30_000,
            tick_ms: 10,
        }
    }
}

impl TimeoutConfig {
    pub fn connection(&self) -> Duration {
        Duration::from_millis(self.connection_ms)
    }

    pub fn response(&self) -> Duration {
        Duration::from_millis(self.response_ms)
    }

    /// Never zero, so poll loops always yield.
    pub fn tick(&self) -> Duration {
        Duration::from_millis(self.tick_ms.max(1))
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PortConfig {
    pub host: IpAddr,
    pub base: u16,
    /// Test-bind each candidate before handing it out.
    pub probe: bool,
}

impl Default for PortConfig {
    fn default() -> Self {
        Self {
            host: IpAddr::V4(Ipv4Addr::LOCALHOST),
            base: PORT_RANGE_START,
            probe: false,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct WorkerConfig {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub executable: Option<PathBuf>,
    pub args: Vec<String>,
    pub worker_type: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub runtime_dir: Option<PathBuf>,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            executable: None,
            args: Vec::new(),
            worker_type: "python".to_string(),
            runtime_dir: None,
        }
    }
}

impl WorkerConfig {
    /// Configured socket directory, or the per-user default.
    pub fn runtime_dir(&self) -> PathBuf {
        self.runtime_dir
            .clone()
            .unwrap_or_else(crate::channel::default_runtime_dir)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DirectoryConfig {
    pub default_max_crash_restarts: u32,
    pub default_max_startup_restarts: u32,
    /// Override the system hostname.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub hostname: Option<String>,
    pub services: Vec<ServiceLimitConfig>,
}

impl Default for DirectoryConfig {
    fn default() -> Self {
        Self {
            default_max_crash_restarts: 8,
            default_max_startup_restarts: 64,
            hostname: None,
            services: Vec::new(),
        }
    }
}

/// Restart limits for one service, overriding the directory defaults.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ServiceLimitConfig {
    pub name: String,
    #[serde(rename = "type")]
    pub service_type: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_crash_restarts: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_startup_restarts: Option<u32>,
}

impl OrchestratorConfig {
    /// Load config from a TOML file path. Returns None if file doesn't exist.
    pub fn load(path: &Path) -> Result<Option<Self>, ConfigError> {
        if !path.exists() {
            return Ok(None);
        }

        check_config_permissions(path);

        let contents = std::fs::read_to_string(path)
            .map_err(|e| ConfigError::ReadFailed(path.to_path_buf(), e))?;
        let config: Self = toml::from_str(&contents)
            .map_err(|e| ConfigError::ParseFailed(path.to_path_buf(), e))?;
        Ok(Some(config))
    }

    /// Load from `path`, falling back to defaults when it does not exist.
    pub fn load_or_default(path: &Path) -> Result<Self, ConfigError> {
        Ok(Self::load(path)?.unwrap_or_default())
    }

    pub fn save(&self, path: &Path) -> Result<(), ConfigError> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)
                .map_err(|e| ConfigError::WriteFailed(path.to_path_buf(), e))?;
        }
        let contents = toml::to_string_pretty(self)?;
        std::fs::write(path, contents)
            .map_err(|e| ConfigError::WriteFailed(path.to_path_buf(), e))?;
        Ok(())
    }

    /// Hostname recorded in directory entries.
    pub fn hostname(&self) -> String {
        resolve_hostname(self.directory.hostname.as_deref())
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to read config {}: {1}", .0.display())]
    ReadFailed(PathBuf, #[source] std::io::Error),
    #[error("failed to parse config {}: {1}", .0.display())]
    ParseFailed(PathBuf, #[source] toml::de::Error),
    #[error("failed to write config {}: {1}", .0.display())]
    WriteFailed(PathBuf, #[source] std::io::Error),
    #[error("failed to serialize config: {0}")]
    SerializeFailed(#[from] toml::ser::Error),
}

/// Default config location, `$XDG_CONFIG_HOME/svcd/config.toml`.
pub fn default_config_path() -> PathBuf {
    dirs::config_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("svcd")
        .join("config.toml")
}

/// Warn if a config file is world-writable. Read access is not checked.
#[cfg(unix)]
pub fn check_config_permissions(path: &Path) {
    use std::os::unix::fs::PermissionsExt;

    let Ok(metadata) = std::fs::metadata(path) else {
        return;
    };

    let mode = metadata.permissions().mode();
    if is_world_writable(mode) {
        tracing::warn!(
            path = %path.display(),
            mode = format_args!("{:o}", mode & 0o7777),
            "config file is world-writable; anyone can change which executable is launched"
        );
    }
}

#[cfg(not(unix))]
pub fn check_config_permissions(_path: &Path) {}

#[cfg(unix)]
pub fn is_world_writable(mode: u32) -> bool {
    mode & 0o002 != 0
}

/// Configured override, else the system hostname, else `"unknown"`.
pub fn resolve_hostname(configured: Option<&str>) -> String {
    if let Some(hostname) = configured {
        return hostname.to_string();
    }
    hostname::get()
        .ok()
        .and_then(|h| h.into_string().ok())
        .unwrap_or_else(|| "unknown".to_string())
}
