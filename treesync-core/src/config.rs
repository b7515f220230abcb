use crate::error::ConfigError;
use globset::Glob;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Glob pattern (wrapper type for clarity)
/// Stored as plain String; compilation happens in [`PathMatcher`](crate::PathMatcher).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Pattern(pub String);

impl From<&str> for Pattern {
    fn from(s: &str) -> Self {
        Pattern(s.to_string())
    }
}

/// SSH/SFTP connection parameters of one sync pair.
///
/// Field names follow the flat `ssh_*` layout of the JSON config files.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ConnectionCfg {
    #[serde(rename = "ssh_host", default)]
    pub host: String,
    #[serde(rename = "ssh_port", default = "ConnectionCfg::default_port")]
    pub port: u16,
    #[serde(rename = "ssh_user", default)]
    pub user: String,
    /// Private key used for public-key authentication.
    #[serde(rename = "ssh_key_path", default)]
    pub key_path: Option<PathBuf>,
    /// Password authentication, used when no key is configured.
    #[serde(rename = "ssh_password", default)]
    pub password: Option<String>,
    /// Allowed host key fingerprints (OpenSSH SHA256) or base64 keys.
    /// `None` accepts any host key.
    #[serde(default)]
    pub host_fingerprints: Option<Vec<String>>,
    /// chmod 0777 every uploaded file and created directory.
    #[serde(default)]
    pub permissive: bool,
}

impl ConnectionCfg {
    fn default_port() -> u16 {
        22
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct InitialSyncCfg {
    #[serde(default)]
    pub enabled: bool,
    /// Delete remote paths that do not exist locally.
    #[serde(rename = "delete", alias = "delete_extraneous", default)]
    pub delete_extraneous: bool,
}

/// One local tree mirrored to one remote tree.
///
/// Loaded as-is from the config file, then normalised by
/// [`SyncPairConfig::validate`]. Workers only ever see validated values.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SyncPairConfig {
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub enabled: bool,
    #[serde(rename = "local_path", default)]
    pub local_root: PathBuf,
    #[serde(rename = "remote_path", default)]
    pub remote_root: String,
    #[serde(flatten)]
    pub connection: ConnectionCfg,
    #[serde(default)]
    pub initial_sync: InitialSyncCfg,
    /// Apply the built-in deny-list of VCS, build and cache paths.
    #[serde(default)]
    pub source_code_only: bool,
    #[serde(default)]
    pub exclude_patterns: Vec<Pattern>,
    /// Debounce window in ms applied per path.
    #[serde(default = "SyncPairConfig::default_debounce_ms")]
    pub debounce_ms: u64,
    /// Consecutive failures after which an action is dropped.
    #[serde(default = "SyncPairConfig::default_max_path_failures")]
    pub max_path_failures: u32,
    /// Initial reconnect backoff in ms (exponential, jittered).
    #[serde(default = "SyncPairConfig::default_reconnect_initial_ms")]
    pub reconnect_initial_ms: u64,
    /// Upper bound for the reconnect backoff in ms.
    #[serde(default = "SyncPairConfig::default_reconnect_max_ms")]
    pub reconnect_max_ms: u64,
    /// Use the polling watcher with this interval instead of native notifications.
    #[serde(default)]
    pub poll_interval_ms: Option<u64>,
}

impl SyncPairConfig {
    fn default_debounce_ms() -> u64 { 300 }
    fn default_max_path_failures() -> u32 { 5 }
    fn default_reconnect_initial_ms() -> u64 { 1_000 }
    fn default_reconnect_max_ms() -> u64 { 30_000 }

    /// Minimal pair with defaults everywhere, mostly useful for embedding and tests.
    pub fn new(
        name: impl Into<String>,
        local_root: impl Into<PathBuf>,
        remote_root: impl Into<String>,
    ) -> Self {
        Self {
            name: name.into(),
            enabled: true,
            local_root: local_root.into(),
            remote_root: remote_root.into(),
            connection: ConnectionCfg {
                port: ConnectionCfg::default_port(),
                ..ConnectionCfg::default()
            },
            initial_sync: InitialSyncCfg::default(),
            source_code_only: false,
            exclude_patterns: Vec::new(),
            debounce_ms: Self::default_debounce_ms(),
            max_path_failures: Self::default_max_path_failures(),
            reconnect_initial_ms: Self::default_reconnect_initial_ms(),
            reconnect_max_ms: Self::default_reconnect_max_ms(),
            poll_interval_ms: None,
        }
    }

    /// Check required fields, expand `~` and make sure every pattern compiles.
    pub fn validate(mut self) -> Result<Self, ConfigError> {
        let pair = if self.name.trim().is_empty() {
            return Err(ConfigError::Missing {
                pair: "<unnamed>".into(),
                field: "name",
            });
        } else {
            self.name.clone()
        };
        let missing = |field| ConfigError::Missing {
            pair: pair.clone(),
            field,
        };
        if self.local_root.as_os_str().is_empty() {
            return Err(missing("local_path"));
        }
        if self.remote_root.trim().is_empty() {
            return Err(missing("remote_path"));
        }
        if self.connection.host.trim().is_empty() {
            return Err(missing("ssh_host"));
        }
        if self.connection.user.trim().is_empty() {
            return Err(missing("ssh_user"));
        }
        if self.connection.port == 0 {
            return Err(ConfigError::Invalid {
                pair,
                field: "ssh_port",
                reason: "port must be non-zero".into(),
            });
        }
        if self.max_path_failures == 0 {
            return Err(ConfigError::Invalid {
                pair,
                field: "max_path_failures",
                reason: "must be at least 1".into(),
            });
        }
        if self.reconnect_initial_ms == 0 || self.reconnect_initial_ms > self.reconnect_max_ms {
            return Err(ConfigError::Invalid {
                pair,
                field: "reconnect_initial_ms",
                reason: format!(
                    "must be between 1 and reconnect_max_ms ({})",
                    self.reconnect_max_ms
                ),
            });
        }
        if self.poll_interval_ms == Some(0) {
            return Err(ConfigError::Invalid {
                pair,
                field: "poll_interval_ms",
                reason: "must be non-zero".into(),
            });
        }
        for pat in &self.exclude_patterns {
            let glob = pat.0.strip_suffix('/').unwrap_or(&pat.0);
            if let Err(source) = Glob::new(glob) {
                return Err(ConfigError::Pattern {
                    pair,
                    pattern: pat.0.clone(),
                    source,
                });
            }
        }

        self.local_root = expand_home(&self.local_root);
        self.connection.key_path = self.connection.key_path.as_deref().map(expand_home);
        if !self.local_root.is_dir() {
            return Err(ConfigError::LocalRoot {
                pair,
                path: self.local_root,
            });
        }
        Ok(self)
    }

    pub fn debounce(&self) -> Duration {
        Duration::from_millis(self.debounce_ms)
    }

    pub fn poll_interval(&self) -> Option<Duration> {
        self.poll_interval_ms.map(Duration::from_millis)
    }
}

/// Expand a leading `~` to the current user's home directory.
pub fn expand_home(path: &Path) -> PathBuf {
    match path.strip_prefix("~") {
        Ok(rest) => match dirs::home_dir() {
            Some(home) => home.join(rest),
            None => path.to_path_buf(),
        },
        Err(_) => path.to_path_buf(),
    }
}
