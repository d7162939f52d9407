use clap::Parser;
use figment::{
    providers::{Env, Format, Serialized, Toml},
    Figment,
};
use serde::{Deserialize, Serialize};
use std::time::Duration;

use crate::state::HubSettings;
use crate::ws::OUTBOUND_CAPACITY;

const DEFAULT_CONFIG_PATH: &str = "./hub.toml";

/// Real-time broadcast hub server
///
/// Flags left off the command line stay `None` and are not serialized, so
/// they never mask values from the TOML file or the environment.
#[derive(Parser, Serialize, Clone, Debug, Default)]
#[command(name = "hub-server", version, about = "Real-time broadcast hub server")]
pub struct CliArgs {
    /// Port to listen on [default: 8080]
    #[arg(long)]
    #[serde(skip_serializing_if = "Option::is_none")]
    pub port: Option<u16>,

    /// Bind address [default: 0.0.0.0]
    #[arg(long)]
    #[serde(skip_serializing_if = "Option::is_none")]
    pub bind_address: Option<String>,

    /// Path to TOML config file [default: ./hub.toml]
    #[arg(long)]
    #[serde(skip_serializing_if = "Option::is_none")]
    pub config: Option<String>,

    /// Enable structured JSON logging (for Docker/production)
    #[arg(long)]
    #[serde(skip_serializing_if = "std::ops::Not::not")]
    pub json_logs: bool,

    /// Output a commented TOML config template and exit
    #[arg(long)]
    #[serde(skip_serializing_if = "std::ops::Not::not")]
    pub generate_config: bool,

    /// History store and event bus: "redis://host:port" or "memory"
    #[arg(long)]
    #[serde(skip_serializing_if = "Option::is_none")]
    pub store_url: Option<String>,

    /// Public history entries sent to a client on connect [default: 20]
    #[arg(long)]
    #[serde(skip_serializing_if = "Option::is_none")]
    pub history_window: Option<usize>,

    /// Entries kept per conversation log, 0 keeps everything [default: 1000]
    #[arg(long)]
    #[serde(skip_serializing_if = "Option::is_none")]
    pub history_retention: Option<usize>,

    /// Seconds between server pings [default: 30]
    #[arg(long)]
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ping_interval_secs: Option<u64>,

    /// Seconds to wait for a pong before closing [default: 10]
    #[arg(long)]
    #[serde(skip_serializing_if = "Option::is_none")]
    pub pong_timeout_secs: Option<u64>,

    /// Close connections that send nothing for this many seconds, 0 disables [default: 300]
    #[arg(long)]
    #[serde(skip_serializing_if = "Option::is_none")]
    pub idle_timeout_secs: Option<u64>,

    /// Milliseconds to wait before re-subscribing a lost bus subscription [default: 1000]
    #[arg(long)]
    #[serde(skip_serializing_if = "Option::is_none")]
    pub resubscribe_delay_ms: Option<u64>,

    /// Frames queued per connection before it is closed as too slow [default: 256]
    #[arg(long)]
    #[serde(skip_serializing_if = "Option::is_none")]
    pub outbound_queue_capacity: Option<usize>,
}

/// Resolved server configuration.
#[derive(Serialize, Deserialize, Clone, Debug)]
pub struct Config {
    pub port: u16,
    pub bind_address: String,
    pub config: String,
    pub json_logs: bool,
    pub generate_config: bool,
    pub store_url: String,
    pub history_window: usize,
    pub history_retention: usize,
    pub ping_interval_secs: u64,
    pub pong_timeout_secs: u64,
    pub idle_timeout_secs: u64,
    pub resubscribe_delay_ms: u64,
    pub outbound_queue_capacity: usize,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            port: 8080,
            bind_address: "0.0.0.0".to_string(),
            config: DEFAULT_CONFIG_PATH.to_string(),
            json_logs: false,
            generate_config: false,
            store_url: "redis://127.0.0.1:6379".to_string(),
            history_window: 20,
            history_retention: 1000,
            ping_interval_secs: 30,
            pong_timeout_secs: 10,
            idle_timeout_secs: 300,
            resubscribe_delay_ms: 1000,
            outbound_queue_capacity: OUTBOUND_CAPACITY,
        }
    }
}

impl Config {
    /// Load config from the process arguments with layered precedence:
    /// built-in defaults < TOML file < env vars (HUB_*) < CLI args
    pub fn load() -> Result<Self, figment::Error> {
        Self::from_args(CliArgs::parse())
    }

    /// Resolve config for already-parsed CLI args.
    pub fn from_args(cli: CliArgs) -> Result<Self, figment::Error> {
        let config_path = cli
            .config
            .clone()
            .unwrap_or_else(|| DEFAULT_CONFIG_PATH.to_string());

        Figment::new()
            .merge(Serialized::defaults(Config::default()))
            .merge(Toml::file(&config_path))
            .merge(Env::prefixed("HUB_"))
            .merge(Serialized::defaults(cli))
            .extract()
    }

    /// Runtime settings for the hub. Zero retention and zero idle timeout
    /// mean "unbounded"; intervals are clamped to at least one unit.
    pub fn hub_settings(&self) -> HubSettings {
        HubSettings {
            history_window: self.history_window,
            history_retention: (self.history_retention > 0).then_some(self.history_retention),
            ping_interval: Duration::from_secs(self.ping_interval_secs.max(1)),
            pong_timeout: Duration::from_secs(self.pong_timeout_secs.max(1)),
            idle_timeout: (self.idle_timeout_secs > 0)
                .then(|| Duration::from_secs(self.idle_timeout_secs)),
            resubscribe_delay: Duration::from_millis(self.resubscribe_delay_ms.max(1)),
            outbound_capacity: self.outbound_queue_capacity.max(1),
        }
    }
}

/// Generate a commented TOML config template
pub fn generate_config_template() -> String {
    r#"# Broadcast Hub Server Configuration
# Place this file at ./hub.toml or specify with --config <path>
# All settings can be overridden via environment variables (HUB_PORT, etc.)
# or CLI flags (--port, etc.)

# Server port (default: 8080)
# port = 8080

# Bind address (default: 0.0.0.0, all interfaces)
# bind_address = "0.0.0.0"

# Enable structured JSON logging for Docker/production
# json_logs = false

# History store and event bus. "memory" runs a single-process hub with
# nothing persisted across restarts.
# store_url = "redis://127.0.0.1:6379"

# ---- History ----

# Public messages sent to a client right after it connects (default: 20)
# history_window = 20

# Entries kept per conversation log; 0 keeps everything (default: 1000)
# history_retention = 1000

# ---- Connection liveness ----

# ping_interval_secs = 30
# pong_timeout_secs = 10

# Close connections that send nothing for this long; 0 disables (default: 300)
# idle_timeout_secs = 300

# Back-off before re-subscribing a lost bus subscription
# resubscribe_delay_ms = 1000

# Frames queued per connection; a client that falls this far behind is
# disconnected (default: 256)
# outbound_queue_capacity = 256
"#
    .to_string()
}
