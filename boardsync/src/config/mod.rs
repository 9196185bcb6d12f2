//! Configuration for the boardsync client.
//!
//! Layered with the following priority (highest first):
//! 1. CLI arguments
//! 2. Environment variables (via clap `env` attribute)
//! 3. TOML config file (`~/.config/boardsync/config.toml`)
//! 4. Compiled defaults
//!
//! A missing default config file is not an error. An explicit `--config`
//! path that doesn't exist is.

use std::path::PathBuf;
use std::time::Duration;

use crate::net::NetConfig;

/// Errors that can occur when loading configuration.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    /// Failed to read the configuration file.
    #[error("failed to read config file {path}: {source}")]
    ReadFile {
        /// Path that was attempted.
        path: PathBuf,
        /// Underlying I/O error.
        source: std::io::Error,
    },

    /// Failed to parse the TOML configuration.
    #[error("failed to parse config file: {0}")]
    ParseToml(#[from] toml::de::Error),

    /// A setting required to connect was not given anywhere.
    #[error("no {0} configured (pass --{0} or set it in the config file)")]
    Missing(&'static str),
}

// ---------------------------------------------------------------------------
// TOML file structs (all fields Option for partial overrides)
// ---------------------------------------------------------------------------

/// Top-level TOML config file structure.
#[derive(Debug, Default, serde::Deserialize)]
#[serde(default)]
struct ConfigFile {
    client: ClientFileConfig,
    reconnect: ReconnectFileConfig,
}

/// `[client]` section of the config file.
#[derive(Debug, Default, serde::Deserialize)]
#[serde(default)]
struct ClientFileConfig {
    server_url: Option<String>,
    workspace: Option<String>,
    token: Option<String>,
    connect_timeout_secs: Option<u64>,
    sync_timeout_secs: Option<u64>,
    delta_interval_ms: Option<u64>,
    channel_capacity: Option<usize>,
}

/// `[reconnect]` section of the config file.
#[derive(Debug, Default, serde::Deserialize)]
#[serde(default)]
struct ReconnectFileConfig {
    initial_delay_ms: Option<u64>,
    max_delay_ms: Option<u64>,
    max_attempts: Option<u32>,
    stability_threshold_secs: Option<u64>,
    message_queue_cap: Option<usize>,
}

// ---------------------------------------------------------------------------
// Resolved configuration (concrete types, all fields populated)
// ---------------------------------------------------------------------------

/// Reconnect supervisor settings.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReconnectConfig {
    /// Delay before the first attempt; doubles on each failure.
    pub initial_delay: Duration,
    /// Upper bound on the delay between attempts.
    pub max_delay: Duration,
    /// Attempts before giving up.
    pub max_attempts: u32,
    /// A session that lasted this long resets the attempt counter.
    pub stability_threshold: Duration,
    /// Local operations that may queue while offline.
    pub message_queue_cap: usize,
}

impl Default for ReconnectConfig {
    fn default() -> Self {
        Self {
            initial_delay: Duration::from_millis(500),
            max_delay: Duration::from_secs(30),
            max_attempts: 10,
            stability_threshold: Duration::from_secs(30),
            message_queue_cap: 1000,
        }
    }
}

impl ReconnectConfig {
    /// Delay before the given 1-based attempt.
    #[must_use]
    pub fn delay_for(&self, attempt: u32) -> Duration {
        backoff_delay(self.initial_delay, self.max_delay, attempt)
    }
}

/// Exponential backoff: `initial * 2^(attempt - 1)`, capped at `max`.
#[must_use]
pub fn backoff_delay(initial: Duration, max: Duration, attempt: u32) -> Duration {
    let factor = 1_u32
        .checked_shl(attempt.saturating_sub(1))
        .unwrap_or(u32::MAX);
    initial.saturating_mul(factor).min(max)
}

/// Fully resolved client configuration.
#[derive(Debug, Clone)]
pub struct ClientConfig {
    /// Server base URL, e.g. `ws://127.0.0.1:9000`.
    pub server_url: Option<String>,
    /// Workspace to open.
    pub workspace: Option<String>,
    /// Bearer token.
    pub token: Option<String>,
    /// Timeout for the WebSocket handshake and the `Hello`.
    pub connect_timeout: Duration,
    /// Time to wait for a catch-up response before asking again.
    pub sync_timeout: Duration,
    /// Minimum spacing of live text deltas per task.
    pub delta_interval: Duration,
    /// Channel capacity for command/event mpsc channels.
    pub channel_capacity: usize,
    /// Reconnect behavior.
    pub reconnect: ReconnectConfig,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            server_url: None,
            workspace: None,
            token: None,
            connect_timeout: Duration::from_secs(10),
            sync_timeout: Duration::from_secs(10),
            delta_interval: Duration::from_millis(60),
            channel_capacity: 256,
            reconnect: ReconnectConfig::default(),
        }
    }
}

impl ClientConfig {
    /// Load configuration by merging CLI args, env vars, and a TOML file.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError`] if the explicit config file cannot be read,
    /// or if any config file that exists cannot be parsed.
    pub fn load(cli: &CliArgs) -> Result<Self, ConfigError> {
        let file = load_config_file(cli.config.as_deref())?;
        Ok(Self::resolve(cli, &file))
    }

    /// Priority: CLI > file > default.
    fn resolve(cli: &CliArgs, file: &ConfigFile) -> Self {
        let defaults = Self::default();
        let c = &file.client;
        let r = &file.reconnect;

        Self {
            server_url: cli.server_url.clone().or_else(|| c.server_url.clone()),
            workspace: cli.workspace.clone().or_else(|| c.workspace.clone()),
            token: cli.token.clone().or_else(|| c.token.clone()),
            connect_timeout: c
                .connect_timeout_secs
                .map_or(defaults.connect_timeout, Duration::from_secs),
            sync_timeout: c
                .sync_timeout_secs
                .map_or(defaults.sync_timeout, Duration::from_secs),
            delta_interval: c
                .delta_interval_ms
                .map_or(defaults.delta_interval, Duration::from_millis),
            channel_capacity: c.channel_capacity.unwrap_or(defaults.channel_capacity),
            reconnect: ReconnectConfig {
                initial_delay: r
                    .initial_delay_ms
                    .map_or(defaults.reconnect.initial_delay, Duration::from_millis),
                max_delay: r
                    .max_delay_ms
                    .map_or(defaults.reconnect.max_delay, Duration::from_millis),
                max_attempts: r.max_attempts.unwrap_or(defaults.reconnect.max_attempts),
                stability_threshold: r
                    .stability_threshold_secs
                    .map_or(defaults.reconnect.stability_threshold, Duration::from_secs),
                message_queue_cap: r
                    .message_queue_cap
                    .unwrap_or(defaults.reconnect.message_queue_cap),
            },
        }
    }

    /// Builds a [`NetConfig`] from this configuration.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Missing`] naming the first of `server-url`,
    /// `workspace` or `token` that is unset or empty.
    pub fn to_net_config(&self) -> Result<NetConfig, ConfigError> {
        let required = |value: &Option<String>, name| {
            value
                .clone()
                .filter(|v| !v.is_empty())
                .ok_or(ConfigError::Missing(name))
        };
        let server_url = required(&self.server_url, "server-url")?;
        let workspace = required(&self.workspace, "workspace")?;
        let token = required(&self.token, "token")?;

        Ok(NetConfig {
            server_url,
            workspace,
            token,
            connect_timeout: self.connect_timeout,
            sync_timeout: self.sync_timeout,
            delta_interval: self.delta_interval,
            channel_capacity: self.channel_capacity,
            reconnect: self.reconnect.clone(),
        })
    }
}

/// Connection options shared by every subcommand.
#[derive(clap::Args, Debug, Default)]
pub struct CliArgs {
    /// Server base URL (`ws://host:port`).
    #[arg(long, global = true, env = "BOARDSYNC_SERVER")]
    pub server_url: Option<String>,

    /// Workspace id.
    #[arg(long, short, global = true, env = "BOARDSYNC_WORKSPACE")]
    pub workspace: Option<String>,

    /// Bearer token.
    #[arg(long, global = true, env = "BOARDSYNC_TOKEN", hide_env_values = true)]
    pub token: Option<String>,

    /// Path to config file (default: `~/.config/boardsync/config.toml`).
    #[arg(short, long, global = true)]
    pub config: Option<PathBuf>,

    /// Log level filter (trace, debug, info, warn, error).
    #[arg(long, global = true, default_value = "warn", env = "BOARDSYNC_LOG")]
    pub log_level: String,

    /// Write logs to this file instead of stderr.
    #[arg(long, global = true)]
    pub log_file: Option<PathBuf>,
}

// ---------------------------------------------------------------------------
// Internal helpers
// ---------------------------------------------------------------------------

/// Load and parse a TOML config file.
///
/// If `explicit_path` is `Some`, the file must exist. Otherwise the default
/// path is tried and a missing file is treated as empty config.
fn load_config_file(explicit_path: Option<&std::path::Path>) -> Result<ConfigFile, ConfigError> {
    if let Some(p) = explicit_path {
        let contents = std::fs::read_to_string(p).map_err(|e| ConfigError::ReadFile {
            path: p.to_path_buf(),
            source: e,
        })?;
        return Ok(toml::from_str(&contents)?);
    }

    let Some(config_dir) = dirs::config_dir() else {
        return Ok(ConfigFile::default());
    };
    let path = config_dir.join("boardsync").join("config.toml");

    match std::fs::read_to_string(&path) {
        Ok(contents) => Ok(toml::from_str(&contents)?),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(ConfigFile::default()),
        Err(e) => Err(ConfigError::ReadFile { path, source: e }),
    }
}
