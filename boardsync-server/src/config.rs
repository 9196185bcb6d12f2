//! Configuration system for the boardsync server.
//!
//! Supports layered configuration with the following priority (highest first):
//! 1. CLI arguments
//! 2. Environment variables (via clap `env` attribute)
//! 3. TOML config file (`~/.config/boardsync-server/config.toml`)
//! 4. Compiled defaults
//!
//! The file also carries the `[[users]]` and `[[grants]]` tables that back
//! the static identity and role directory; those have no CLI equivalent.

use std::path::PathBuf;
use std::time::Duration;

use crate::auth::{GrantEntry, UserEntry};
use crate::sequencer::SequencerConfig;

/// Errors that can occur when loading server configuration.
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

    /// A value is out of range.
    #[error("invalid config value for {field}: {reason}")]
    Invalid {
        /// Offending setting.
        field: &'static str,
        /// Why it was refused.
        reason: &'static str,
    },
}

// ---------------------------------------------------------------------------
// TOML file structs (all fields Option for partial overrides)
// ---------------------------------------------------------------------------

/// Top-level TOML config file structure.
#[derive(Debug, Default, serde::Deserialize)]
#[serde(default)]
struct ServerConfigFile {
    server: ServerFileConfig,
    users: Vec<UserEntry>,
    grants: Vec<GrantEntry>,
}

/// `[server]` section of the config file.
#[derive(Debug, Default, serde::Deserialize)]
#[serde(default)]
struct ServerFileConfig {
    bind_addr: Option<String>,
    compaction_interval: Option<u64>,
    sync_window: Option<u64>,
    awareness_ttl_ms: Option<u64>,
    delta_min_interval_ms: Option<u64>,
    idle_timeout_secs: Option<u64>,
    max_frame_size: Option<usize>,
    data_dir: Option<PathBuf>,
}

// ---------------------------------------------------------------------------
// CLI arguments
// ---------------------------------------------------------------------------

/// CLI arguments for the server.
#[derive(clap::Parser, Debug, Default)]
#[command(version, about = "boardsync workspace server")]
pub struct ServerCliArgs {
    /// Address to bind the server to.
    #[arg(short, long, env = "BOARDSYNC_ADDR")]
    pub bind: Option<String>,

    /// Path to config file (default: `~/.config/boardsync-server/config.toml`).
    #[arg(short, long)]
    pub config: Option<PathBuf>,

    /// Directory for the file-backed op log. In-memory storage if unset.
    #[arg(long, env = "BOARDSYNC_DATA_DIR")]
    pub data_dir: Option<PathBuf>,

    /// Compact a snapshot every N sequences.
    #[arg(long)]
    pub compaction_interval: Option<u64>,

    /// Largest catch-up gap served as an op range.
    #[arg(long)]
    pub sync_window: Option<u64>,

    /// Maximum WebSocket frame size in bytes.
    #[arg(long)]
    pub max_frame_size: Option<usize>,

    /// Log level filter (trace, debug, info, warn, error).
    #[arg(long, default_value = "info", env = "BOARDSYNC_LOG")]
    pub log_level: String,
}

// ---------------------------------------------------------------------------
// Resolved configuration
// ---------------------------------------------------------------------------

/// Fully resolved server configuration.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Address to bind the server to (e.g., `0.0.0.0:9000`).
    pub bind_addr: String,
    /// Compact when `seq` is a multiple of this.
    pub compaction_interval: u64,
    /// Largest catch-up gap served as an op range.
    pub sync_window: u64,
    /// Idle time after which awareness entries expire, in milliseconds.
    pub awareness_ttl_ms: u64,
    /// Minimum spacing between live deltas from one session, in milliseconds.
    pub delta_min_interval_ms: u64,
    /// Seconds a workspace with nobody connected keeps its sequencer.
    pub idle_timeout_secs: u64,
    /// Maximum WebSocket frame size in bytes.
    pub max_frame_size: usize,
    /// File-backed storage directory; in-memory when `None`.
    pub data_dir: Option<PathBuf>,
    /// Log level filter string.
    pub log_level: String,
    /// Known bearer tokens.
    pub users: Vec<UserEntry>,
    /// Workspace role grants.
    pub grants: Vec<GrantEntry>,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_addr: "0.0.0.0:9000".to_string(),
            compaction_interval: 1500,
            sync_window: 1500,
            awareness_ttl_ms: 8000,
            delta_min_interval_ms: 50,
            idle_timeout_secs: 600,
            max_frame_size: 256 * 1024,
            data_dir: None,
            log_level: "info".to_string(),
            users: Vec::new(),
            grants: Vec::new(),
        }
    }
}

impl ServerConfig {
    /// Load configuration by merging CLI args, env vars, and a TOML file.
    ///
    /// If `--config` is given and the file does not exist, returns an error.
    /// If no `--config` is given, the default path is tried and missing file
    /// is treated as empty config.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError`] if the explicit config file cannot be read
    /// or parsed, or a value is out of range.
    pub fn load(cli: &ServerCliArgs) -> Result<Self, ConfigError> {
        let file = load_config_file(cli.config.as_deref())?;
        let config = Self::resolve(cli, file);
        config.validate()?;
        Ok(config)
    }

    /// Resolve a `ServerConfig` from CLI args and a parsed config file.
    ///
    /// Priority: CLI > file > default.
    fn resolve(cli: &ServerCliArgs, file: ServerConfigFile) -> Self {
        let defaults = Self::default();
        let server = file.server;

        Self {
            bind_addr: cli
                .bind
                .clone()
                .or(server.bind_addr)
                .unwrap_or(defaults.bind_addr),
            compaction_interval: cli
                .compaction_interval
                .or(server.compaction_interval)
                .unwrap_or(defaults.compaction_interval),
            sync_window: cli
                .sync_window
                .or(server.sync_window)
                .unwrap_or(defaults.sync_window),
            awareness_ttl_ms: server
                .awareness_ttl_ms
                .unwrap_or(defaults.awareness_ttl_ms),
            delta_min_interval_ms: server
                .delta_min_interval_ms
                .unwrap_or(defaults.delta_min_interval_ms),
            idle_timeout_secs: server
                .idle_timeout_secs
                .unwrap_or(defaults.idle_timeout_secs),
            max_frame_size: cli
                .max_frame_size
                .or(server.max_frame_size)
                .unwrap_or(defaults.max_frame_size),
            data_dir: cli.data_dir.clone().or(server.data_dir),
            log_level: cli.log_level.clone(),
            users: file.users,
            grants: file.grants,
        }
    }

    fn validate(&self) -> Result<(), ConfigError> {
        if self.compaction_interval == 0 {
            return Err(ConfigError::Invalid {
                field: "compaction_interval",
                reason: "must be at least 1",
            });
        }
        if self.max_frame_size == 0 {
            return Err(ConfigError::Invalid {
                field: "max_frame_size",
                reason: "must be at least 1",
            });
        }
        Ok(())
    }

    /// Sequencer tunables derived from this config.
    #[must_use]
    pub fn sequencer(&self) -> SequencerConfig {
        SequencerConfig {
            compaction_interval: self.compaction_interval,
            sync_window: self.sync_window,
            awareness_ttl: Duration::from_millis(self.awareness_ttl_ms),
            delta_min_interval: Duration::from_millis(self.delta_min_interval_ms),
            idle_timeout: Duration::from_secs(self.idle_timeout_secs),
        }
    }
}

// ---------------------------------------------------------------------------
// Internal helpers
// ---------------------------------------------------------------------------

/// Load and parse a TOML config file for the server.
fn load_config_file(
    explicit_path: Option<&std::path::Path>,
) -> Result<ServerConfigFile, ConfigError> {
    let path = if let Some(p) = explicit_path {
        let contents = std::fs::read_to_string(p).map_err(|e| ConfigError::ReadFile {
            path: p.to_path_buf(),
            source: e,
        })?;
        return Ok(toml::from_str(&contents)?);
    } else {
        let Some(config_dir) = dirs::config_dir() else {
            return Ok(ServerConfigFile::default());
        };
        config_dir.join("boardsync-server").join("config.toml")
    };

    match std::fs::read_to_string(&path) {
        Ok(contents) => Ok(toml::from_str(&contents)?),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(ServerConfigFile::default()),
        Err(e) => Err(ConfigError::ReadFile { path, source: e }),
    }
}
