use std::collections::BTreeMap;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::registry::RefPolicy;

/// Top-level server config, loaded from TOML.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub server: ServerSection,
    #[serde(default)]
    pub sessions: SessionsConfig,
    #[serde(default)]
    pub references: ReferenceConfig,
    /// Plugins by name, e.g. `[plugins.auth]`.
    #[serde(default)]
    pub plugins: BTreeMap<String, PluginConfig>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerSection {
    pub bind: SocketAddr,
    /// Show error details (chains, panic messages) in the browser.
    pub debug: bool,
    pub title: String,
    /// Requests per second per client IP.
    pub rate_limit: Option<u32>,
}

impl Default for ServerSection {
    fn default() -> Self {
        Self {
            bind: SocketAddr::from(([127, 0, 0, 1], 8000)),
            debug: false,
            title: "livepage".to_string(),
            rate_limit: None,
        }
    }
}

/// Session lifecycle limits.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionsConfig {
    /// Above this many sessions, dormant ones are evicted on creation.
    pub soft_cap: usize,
    /// Creating a session at this many fails.
    pub hard_cap: usize,
    /// How long a session without a socket survives.
    pub idle_timeout_secs: u64,
    /// Serve new sessions at `/` instead of redirecting to `/{process}/`.
    pub hide_processes: bool,
    /// Cap on replay history entries; unbounded when unset.
    pub history_limit: Option<usize>,
    /// How long background tasks get to finish when a session ends.
    pub shutdown_grace_ms: u64,
}

impl Default for SessionsConfig {
    fn default() -> Self {
        Self {
            soft_cap: 1000,
            hard_cap: 1_000_000,
            idle_timeout_secs: 300,
            hide_processes: true,
            history_limit: None,
            shutdown_grace_ms: 1000,
        }
    }
}

impl SessionsConfig {
    pub fn idle_timeout(&self) -> Duration {
        Duration::from_secs(self.idle_timeout_secs)
    }

    pub fn shutdown_grace(&self) -> Duration {
        Duration::from_millis(self.shutdown_grace_ms)
    }
}

/// Where callbacks and values handed to the browser are kept.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ReferenceConfig {
    pub policy: RefPolicy,
    /// Bound on the strong registry under the weak and hybrid policies.
    pub keep: usize,
    /// Evict the oldest strong entry instead of failing when full.
    pub rotate: bool,
}

impl Default for ReferenceConfig {
    fn default() -> Self {
        Self {
            policy: RefPolicy::Hybrid,
            keep: 100,
            rotate: true,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PluginKind {
    Session,
    Token,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PluginConfig {
    pub kind: PluginKind,
    #[serde(default = "default_true")]
    pub enabled: bool,
    /// When false, the plugin is only installed if another plugin requires
    /// a capability it exports.
    #[serde(default = "default_true")]
    pub required: bool,
    /// Shared secret for `token` plugins.
    pub token: Option<String>,
    /// User name recorded for requests that present the token.
    pub user: Option<String>,
}

fn default_true() -> bool {
    true
}

impl Config {
    /// Load config from a TOML file path. Returns None if file doesn't exist.
    ///
    /// Checks file permissions and warns if world-readable.
    pub fn load(path: &Path) -> Result<Option<Self>, ConfigError> {
        if !path.exists() {
            return Ok(None);
        }

        check_config_permissions(path);

        let contents = std::fs::read_to_string(path)
            .map_err(|e| ConfigError::ReadFailed(path.to_path_buf(), e))?;
        let config: Self = toml::from_str(&contents)
            .map_err(|e| ConfigError::ParseFailed(path.to_path_buf(), e))?;
        config.validate()?;
        Ok(Some(config))
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        let sessions = &self.sessions;
        if sessions.hard_cap == 0 {
            return Err(ConfigError::Invalid("sessions.hard_cap must be positive".into()));
        }
        if sessions.soft_cap > sessions.hard_cap {
            return Err(ConfigError::Invalid(format!(
                "sessions.soft_cap ({}) exceeds sessions.hard_cap ({})",
                sessions.soft_cap, sessions.hard_cap
            )));
        }
        if sessions.history_limit == Some(0) {
            return Err(ConfigError::Invalid(
                "sessions.history_limit must be positive when set".into(),
            ));
        }
        for (name, plugin) in &self.plugins {
            if plugin.kind == PluginKind::Token && plugin.enabled && plugin.token.is_none() {
                return Err(ConfigError::Invalid(format!(
                    "plugin {name}: token plugins need a `token`"
                )));
            }
        }
        Ok(())
    }
}

/// `$XDG_CONFIG_HOME/livepage/config.toml` or the platform equivalent.
pub fn default_config_path() -> Option<PathBuf> {
    dirs::config_dir().map(|dir| dir.join("livepage").join("config.toml"))
}

/// Errors that can occur when loading config.
#[derive(Debug)]
pub enum ConfigError {
    ReadFailed(PathBuf, std::io::Error),
    ParseFailed(PathBuf, toml::de::Error),
    Invalid(String),
}

impl std::fmt::Display for ConfigError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::ReadFailed(path, e) => {
                write!(f, "Failed to read config {}: {}", path.display(), e)
            }
            Self::ParseFailed(path, e) => {
                write!(f, "Failed to parse config {}: {}", path.display(), e)
            }
            Self::Invalid(detail) => write!(f, "Invalid config: {}", detail),
        }
    }
}

impl std::error::Error for ConfigError {}

/// Warn when a config file that may hold plugin tokens is world-readable.
#[cfg(unix)]
pub fn check_config_permissions(path: &Path) {
    use std::os::unix::fs::PermissionsExt;

    let Ok(metadata) = std::fs::metadata(path) else {
        return;
    };
    let mode = metadata.permissions().mode();
    if is_world_readable(mode) {
        tracing::warn!(
            "config file {} is world-readable (mode {:o}); it may contain tokens",
            path.display(),
            mode & 0o7777,
        );
    }
}

#[cfg(not(unix))]
pub fn check_config_permissions(_path: &Path) {}

#[cfg(unix)]
pub fn is_world_readable(mode: u32) -> bool {
    mode & 0o004 != 0
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_empty_config_uses_defaults() {
        let config: Config = toml::from_str("").unwrap();
        assert_eq!(config.server.bind, "127.0.0.1:8000".parse().unwrap());
        assert_eq!(config.sessions.soft_cap, 1000);
        assert_eq!(config.sessions.hard_cap, 1_000_000);
        assert!(config.sessions.hide_processes);
        assert_eq!(config.sessions.history_limit, None);
        assert_eq!(config.references.policy, RefPolicy::Hybrid);
        assert_eq!(config.references.keep, 100);
        assert!(config.plugins.is_empty());
        config.validate().unwrap();
    }

    #[test]
    fn parse_full_config() {
        let toml = r#"
            [server]
            bind = "0.0.0.0:9000"
            debug = true
            title = "Demo"
            rate_limit = 20

            [sessions]
            soft_cap = 2
            hard_cap = 3
            idle_timeout_secs = 10
            hide_processes = false
            history_limit = 500

            [references]
            policy = "strong"

            [plugins.auth]
            kind = "token"
            token = "s3cret"
            required = false
        "#;
        let config: Config = toml::from_str(toml).unwrap();
        assert!(config.server.debug);
        assert_eq!(config.server.rate_limit, Some(20));
        assert_eq!(config.sessions.idle_timeout(), Duration::from_secs(10));
        assert_eq!(config.sessions.shutdown_grace(), Duration::from_millis(1000));
        assert_eq!(config.references.policy, RefPolicy::Strong);
        let auth = &config.plugins["auth"];
        assert_eq!(auth.kind, PluginKind::Token);
        assert!(auth.enabled);
        assert!(!auth.required);
        config.validate().unwrap();
    }

    #[test]
    fn soft_cap_above_hard_cap_is_invalid() {
        let mut config = Config::default();
        config.sessions.soft_cap = 10;
        config.sessions.hard_cap = 5;
        assert!(matches!(config.validate(), Err(ConfigError::Invalid(_))));
    }

    #[test]
    fn token_plugin_without_token_is_invalid() {
        let config: Config = toml::from_str(
            r#"
            [plugins.auth]
            kind = "token"
            "#,
        )
        .unwrap();
        assert!(config.validate().is_err());
    }

    #[test]
    fn load_missing_file_is_none() {
        let dir = tempfile::tempdir().unwrap();
        assert!(Config::load(&dir.path().join("nope.toml")).unwrap().is_none());
    }

    #[test]
    fn load_reports_parse_errors() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("bad.toml");
        std::fs::write(&path, "[sessions]\nsoft_cap = \"many\"\n").unwrap();
        let err = Config::load(&path).unwrap_err();
        assert!(matches!(err, ConfigError::ParseFailed(..)));
        assert!(err.to_string().contains("bad.toml"));
    }

    #[cfg(unix)]
    #[test]
    fn world_readable_modes() {
        assert!(is_world_readable(0o644));
        assert!(!is_world_readable(0o600));
    }
}
