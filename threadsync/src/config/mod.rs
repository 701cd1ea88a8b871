//! Configuration for the `threadsync` client.
//!
//! Layered with the following priority (highest first):
//! 1. CLI arguments
//! 2. Environment variables (via clap `env` attribute)
//! 3. TOML config file (`~/.config/threadsync/config.toml`)
//! 4. Compiled defaults
//!
//! Missing config file is not an error (defaults are used). An explicit
//! `--config` path that doesn't exist is an error.

use std::path::PathBuf;
use std::time::Duration;

use threadsync_proto::conversation::{ConversationId, UserId};

use crate::channel::BackoffPolicy;
use crate::channel::ws::{DEFAULT_CONNECT_TIMEOUT, DEFAULT_SUBSCRIBE_TIMEOUT};
use crate::coordinator::SyncConfig;

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

    /// A required setting is missing.
    #[error("missing setting: {0}")]
    Missing(&'static str),
}

// ---------------------------------------------------------------------------
// TOML file structs (all fields Option for partial overrides)
// ---------------------------------------------------------------------------

/// Top-level TOML config file structure.
#[derive(Debug, Default, serde::Deserialize)]
#[serde(default)]
struct ConfigFile {
    api: ApiFileConfig,
    channel: ChannelFileConfig,
    sync: SyncFileConfig,
}

/// `[api]` section of the config file.
#[derive(Debug, Default, serde::Deserialize)]
#[serde(default)]
struct ApiFileConfig {
    base_url: Option<String>,
    token: Option<String>,
    user_id: Option<u64>,
}

/// `[channel]` section of the config file.
#[derive(Debug, Default, serde::Deserialize)]
#[serde(default)]
struct ChannelFileConfig {
    url: Option<String>,
    connect_timeout_secs: Option<u64>,
    subscribe_timeout_secs: Option<u64>,
    backoff_base_ms: Option<u64>,
    backoff_cap_secs: Option<u64>,
    backoff_jitter: Option<f64>,
}

/// `[sync]` section of the config file.
#[derive(Debug, Default, serde::Deserialize)]
#[serde(default)]
struct SyncFileConfig {
    send_timeout_secs: Option<u64>,
    echo_window_ms: Option<u64>,
    history_max_pages: Option<u32>,
    gap_fill_max_pages: Option<u32>,
    receipt_debounce_ms: Option<u64>,
    channel_capacity: Option<usize>,
}

// ---------------------------------------------------------------------------
// Resolved configuration
// ---------------------------------------------------------------------------

/// Fully resolved client configuration.
#[derive(Debug, Clone, PartialEq)]
pub struct ClientConfig {
    // -- API --
    /// REST base URL.
    pub api_url: Option<String>,
    /// Bearer token for the API and the push gateway.
    pub token: Option<String>,
    /// Authenticated user.
    pub user_id: UserId,

    // -- Channel --
    /// Push gateway WebSocket URL.
    pub channel_url: Option<String>,
    /// WebSocket handshake timeout.
    pub connect_timeout: Duration,
    /// Subscription acknowledgment timeout.
    pub subscribe_timeout: Duration,
    /// Reconnect backoff.
    pub backoff: BackoffPolicy,

    // -- Sync --
    /// Pending send timeout.
    pub send_timeout: Duration,
    /// Echo-matching tolerance.
    pub echo_window: Duration,
    /// Page limit for full history fetches.
    pub history_max_pages: u32,
    /// Page limit for gap-fill fetches.
    pub gap_fill_max_pages: u32,
    /// Read-receipt debounce.
    pub receipt_debounce: Duration,
    /// Channel signal buffer.
    pub channel_capacity: usize,

    // -- Session --
    /// Conversation to open on start.
    pub conversation: Option<ConversationId>,
}

impl Default for ClientConfig {
    fn default() -> Self {
        let sync = SyncConfig::new(UserId::new(1));
        Self {
            api_url: None,
            token: None,
            user_id: sync.local_user,
            channel_url: None,
            connect_timeout: DEFAULT_CONNECT_TIMEOUT,
            subscribe_timeout: DEFAULT_SUBSCRIBE_TIMEOUT,
            backoff: sync.backoff,
            send_timeout: sync.send_timeout,
            echo_window: sync.echo_window,
            history_max_pages: sync.history_max_pages,
            gap_fill_max_pages: sync.gap_fill_max_pages,
            receipt_debounce: sync.receipt_debounce,
            channel_capacity: sync.channel_capacity,
            conversation: None,
        }
    }
}

impl ClientConfig {
    /// Load configuration by merging CLI args, env vars, and a TOML file.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError`] if the explicit config file cannot be read
    /// or any config file cannot be parsed.
    pub fn load(cli: &CliArgs) -> Result<Self, ConfigError> {
        let file = load_config_file(cli.config.as_deref())?;
        Ok(Self::resolve(cli, &file))
    }

    /// Priority: CLI > file > default.
    fn resolve(cli: &CliArgs, file: &ConfigFile) -> Self {
        let defaults = Self::default();

        Self {
            api_url: cli.api_url.clone().or_else(|| file.api.base_url.clone()),
            token: cli.token.clone().or_else(|| file.api.token.clone()),
            user_id: cli
                .user_id
                .or(file.api.user_id)
                .map_or(defaults.user_id, UserId::new),
            channel_url: cli.channel_url.clone().or_else(|| file.channel.url.clone()),
            connect_timeout: file
                .channel
                .connect_timeout_secs
                .map_or(defaults.connect_timeout, Duration::from_secs),
            subscribe_timeout: file
                .channel
                .subscribe_timeout_secs
                .map_or(defaults.subscribe_timeout, Duration::from_secs),
            backoff: BackoffPolicy {
                base: file
                    .channel
                    .backoff_base_ms
                    .map_or(defaults.backoff.base, Duration::from_millis),
                cap: file
                    .channel
                    .backoff_cap_secs
                    .map_or(defaults.backoff.cap, Duration::from_secs),
                jitter: file
                    .channel
                    .backoff_jitter
                    .filter(|j| j.is_finite())
                    .map_or(defaults.backoff.jitter, |j| j.clamp(0.0, 1.0)),
            },
            send_timeout: file
                .sync
                .send_timeout_secs
                .map_or(defaults.send_timeout, Duration::from_secs),
            echo_window: file
                .sync
                .echo_window_ms
                .map_or(defaults.echo_window, Duration::from_millis),
            history_max_pages: file
                .sync
                .history_max_pages
                .unwrap_or(defaults.history_max_pages),
            gap_fill_max_pages: file
                .sync
                .gap_fill_max_pages
                .unwrap_or(defaults.gap_fill_max_pages),
            receipt_debounce: file
                .sync
                .receipt_debounce_ms
                .map_or(defaults.receipt_debounce, Duration::from_millis),
            channel_capacity: file
                .sync
                .channel_capacity
                .unwrap_or(defaults.channel_capacity),
            conversation: cli.conversation.map(ConversationId::new),
        }
    }

    /// Core settings for [`SyncCoordinator::spawn`](crate::coordinator::SyncCoordinator::spawn).
    #[must_use]
    pub fn sync_config(&self) -> SyncConfig {
        SyncConfig {
            local_user: self.user_id,
            send_timeout: self.send_timeout,
            echo_window: self.echo_window,
            history_max_pages: self.history_max_pages,
            gap_fill_max_pages: self.gap_fill_max_pages,
            receipt_debounce: self.receipt_debounce,
            channel_capacity: self.channel_capacity,
            backoff: self.backoff,
        }
    }

    /// Reconnect backoff for the push channel.
    #[must_use]
    pub const fn backoff_policy(&self) -> BackoffPolicy {
        self.backoff
    }

    /// API and gateway URLs, required outside demo mode.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Missing`] naming the first absent URL.
    pub fn endpoints(&self) -> Result<(&str, &str), ConfigError> {
        let api = self.api_url.as_deref().ok_or(ConfigError::Missing("api base_url"))?;
        let channel = self
            .channel_url
            .as_deref()
            .ok_or(ConfigError::Missing("channel url"))?;
        Ok((api, channel))
    }
}

/// CLI arguments parsed by clap.
#[derive(clap::Parser, Debug, Default)]
#[command(version, about = "Headless conversation sync client")]
pub struct CliArgs {
    /// REST API base URL.
    #[arg(long, env = "THREADSYNC_API_URL")]
    pub api_url: Option<String>,

    /// WebSocket URL of the push gateway.
    #[arg(long, env = "THREADSYNC_CHANNEL_URL")]
    pub channel_url: Option<String>,

    /// Bearer token.
    #[arg(long, env = "THREADSYNC_TOKEN")]
    pub token: Option<String>,

    /// Your user id.
    #[arg(long, env = "THREADSYNC_USER_ID")]
    pub user_id: Option<u64>,

    /// Conversation to open on start.
    #[arg(long)]
    pub conversation: Option<u64>,

    /// Run against an in-process fake server.
    #[arg(long)]
    pub demo: bool,

    /// Path to config file (default: `~/.config/threadsync/config.toml`).
    #[arg(short, long)]
    pub config: Option<PathBuf>,

    /// Log level filter (trace, debug, info, warn, error).
    #[arg(long, default_value = "info", env = "THREADSYNC_LOG")]
    pub log_level: String,

    /// Path to log file (default: `$TMPDIR/threadsync.log`).
    #[arg(long)]
    pub log_file: Option<PathBuf>,
}

/// Load and parse a TOML config file.
///
/// An explicit path must exist; the default path may be missing.
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
    let path = config_dir.join("threadsync").join("config.toml");
    match std::fs::read_to_string(&path) {
        Ok(contents) => Ok(toml::from_str(&contents)?),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(ConfigFile::default()),
        Err(e) => Err(ConfigError::ReadFile { path, source: e }),
    }
}
