//! Perpetual CLI Configuration Management
//!
//! Configuration is layered with figment, lowest priority first:
//! - Default values
//! - Configuration file (`perpetual.toml`, or the `--config` path)
//! - Environment variables (`PERPETUAL_*`, nested keys separated by `__`)
//! - Command line arguments
//!
//! Durations are stored as plain integers so that files and environment
//! variables stay readable; `channel_config` turns them into the core types.

use std::time::Duration;

use figment::{
    providers::{Env, Format, Serialized, Toml},
    Figment,
};
use perpetual_core::{ChannelConfig, ConnectionConfig, ReconnectPolicy, SendRetryPolicy};
use perpetual_tungstenite::TungsteniteConfig;
use serde::{Deserialize, Serialize};

use crate::cli::Cli;

/// File looked up in the working directory when no `--config` is given
pub const DEFAULT_CONFIG_FILE: &str = "perpetual.toml";

// ----------------------------------------------------------------------------
// CLI Application Configuration
// ----------------------------------------------------------------------------

/// Complete configuration for the perpetual CLI
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CliAppConfig {
    /// Rotation, liveness and retry settings of the channel
    pub channel: ChannelSection,

    /// WebSocket transport settings
    pub transport: TransportSection,

    /// Runtime behavior
    pub runtime: RuntimeConfig,

    /// CLI presentation
    pub cli: CliConfig,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChannelSection {
    pub name: String,
    pub shift_secs: u64,
    pub switch_secs: u64,
    pub ping_interval_ms: u64,
    pub read_timeout_ms: u64,
    pub init_timeout_ms: u64,
    pub send_attempts: u32,
    pub send_retry_initial_ms: u64,
    pub send_retry_max_ms: u64,
    pub send_attempt_timeout_ms: u64,
    pub reconnect_initial_ms: u64,
    pub reconnect_max_ms: u64,
    pub backoff_multiplier: f32,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TransportSection {
    pub connect_timeout_secs: u64,
    /// Largest inbound message in bytes (0 = transport default)
    pub max_message_size: usize,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RuntimeConfig {
    /// Threads of the shared scheduler (0 = one per core)
    pub worker_threads: usize,

    /// How long `send` waits for the channel to become available
    pub startup_timeout_secs: u64,

    /// How long to wait for the channel to close on exit
    pub shutdown_timeout_secs: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CliConfig {
    /// Enable verbose logging output
    pub verbose: bool,

    /// Prompt shown in interactive mode
    pub prompt: String,

    /// Treat text as JSON in both directions
    pub json: bool,
}

// ----------------------------------------------------------------------------
// Default Implementations
// ----------------------------------------------------------------------------

impl Default for ChannelSection {
    fn default() -> Self {
        let core = ChannelConfig::named("perpetual");
        Self {
            name: core.name,
            shift_secs: core.shift_duration.as_secs(),
            switch_secs: core.switch_duration.as_secs(),
            ping_interval_ms: millis(core.connection.ping_interval),
            read_timeout_ms: millis(core.connection.read_timeout),
            init_timeout_ms: millis(core.connection.init_timeout),
            send_attempts: core.send_retry.max_attempts,
            send_retry_initial_ms: millis(core.send_retry.initial_delay),
            send_retry_max_ms: millis(core.send_retry.max_delay),
            send_attempt_timeout_ms: millis(core.send_retry.attempt_timeout),
            reconnect_initial_ms: millis(core.reconnect.initial_delay),
            reconnect_max_ms: millis(core.reconnect.max_delay),
            backoff_multiplier: core.reconnect.multiplier,
        }
    }
}

impl Default for TransportSection {
    fn default() -> Self {
        Self {
            connect_timeout_secs: TungsteniteConfig::default().connection_timeout.as_secs(),
            max_message_size: 0,
        }
    }
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            worker_threads: 2,
            startup_timeout_secs: 30,
            shutdown_timeout_secs: 5,
        }
    }
}

impl Default for CliConfig {
    fn default() -> Self {
        Self {
            verbose: false,
            prompt: "perpetual> ".to_string(),
            json: false,
        }
    }
}

impl Default for CliAppConfig {
    fn default() -> Self {
        Self {
            channel: ChannelSection::default(),
            transport: TransportSection::default(),
            runtime: RuntimeConfig::default(),
            cli: CliConfig::default(),
        }
    }
}

fn millis(duration: Duration) -> u64 {
    duration.as_millis() as u64
}

// ----------------------------------------------------------------------------
// Configuration Loading Logic
// ----------------------------------------------------------------------------

impl CliAppConfig {
    /// Defaults, then the file, then `PERPETUAL_*` variables
    fn base_figment(path: Option<&str>) -> Figment {
        Figment::new()
            .merge(Serialized::defaults(Self::default()))
            .merge(Toml::file(path.unwrap_or(DEFAULT_CONFIG_FILE)))
            .merge(Env::prefixed("PERPETUAL_").split("__"))
    }

    /// Load configuration without command line overrides
    pub fn load(path: Option<&str>) -> Result<Self, ConfigError> {
        let config: CliAppConfig = Self::base_figment(path)
            .extract()
            .map_err(|e| ConfigError::Loading(format!("Failed to load configuration: {}", e)))?;

        config.validate()?;
        Ok(config)
    }

    /// Load configuration with command line arguments on top
    pub fn load_with_overrides(cli: &Cli) -> Result<Self, ConfigError> {
        let mut figment = Self::base_figment(cli.config.as_deref());

        if let Some(name) = &cli.name {
            figment = figment.merge(("channel.name", name.clone()));
        }
        if let Some(shift) = cli.shift_secs {
            figment = figment.merge(("channel.shift_secs", shift));
        }
        if let Some(switch) = cli.switch_secs {
            figment = figment.merge(("channel.switch_secs", switch));
        }
        if let Some(ping) = cli.ping_ms {
            figment = figment.merge(("channel.ping_interval_ms", ping));
        }
        if cli.verbose {
            figment = figment.merge(("cli.verbose", true));
        }
        if cli.json {
            figment = figment.merge(("cli.json", true));
        }

        let config: CliAppConfig = figment
            .extract()
            .map_err(|e| ConfigError::Loading(format!("Failed to load with overrides: {}", e)))?;

        config.validate()?;
        Ok(config)
    }

    /// Validate the configuration for consistency and correctness
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.channel.name.trim().is_empty() {
            return Err(ConfigError::Validation("Channel name must not be empty".to_string()));
        }
        if self.channel.switch_secs >= self.channel.shift_secs {
            return Err(ConfigError::Validation(format!(
                "switch_secs ({}) must be shorter than shift_secs ({})",
                self.channel.switch_secs, self.channel.shift_secs
            )));
        }
        if self.transport.connect_timeout_secs == 0 {
            return Err(ConfigError::Validation(
                "Connect timeout must be greater than 0".to_string(),
            ));
        }
        if self.runtime.startup_timeout_secs == 0 {
            return Err(ConfigError::Validation(
                "Startup timeout must be greater than 0".to_string(),
            ));
        }

        self.channel_config()
            .validate()
            .map_err(|e| ConfigError::Validation(e.to_string()))
    }

    /// Core channel configuration
    pub fn channel_config(&self) -> ChannelConfig {
        let channel = &self.channel;
        ChannelConfig {
            name: channel.name.clone(),
            shift_duration: Duration::from_secs(channel.shift_secs),
            switch_duration: Duration::from_secs(channel.switch_secs),
            connection: ConnectionConfig {
                ping_interval: Duration::from_millis(channel.ping_interval_ms),
                read_timeout: Duration::from_millis(channel.read_timeout_ms),
                init_timeout: Duration::from_millis(channel.init_timeout_ms),
            },
            send_retry: SendRetryPolicy {
                max_attempts: channel.send_attempts,
                initial_delay: Duration::from_millis(channel.send_retry_initial_ms),
                max_delay: Duration::from_millis(channel.send_retry_max_ms),
                multiplier: channel.backoff_multiplier,
                attempt_timeout: Duration::from_millis(channel.send_attempt_timeout_ms),
            },
            reconnect: ReconnectPolicy {
                initial_delay: Duration::from_millis(channel.reconnect_initial_ms),
                max_delay: Duration::from_millis(channel.reconnect_max_ms),
                multiplier: channel.backoff_multiplier,
            },
        }
    }

    /// WebSocket transport configuration
    pub fn transport_config(&self) -> TungsteniteConfig {
        TungsteniteConfig {
            connection_timeout: Duration::from_secs(self.transport.connect_timeout_secs),
            max_message_size: match self.transport.max_message_size {
                0 => None,
                size => Some(size),
            },
            ..TungsteniteConfig::default()
        }
    }

    /// Example configuration file content
    pub fn example_config() -> String {
        toml::to_string_pretty(&Self::default())
            .unwrap_or_else(|_| "# Failed to generate example config".to_string())
    }
}

// ----------------------------------------------------------------------------
// Error Types
// ----------------------------------------------------------------------------

/// Configuration-related errors
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Configuration loading error: {0}")]
    Loading(String),

    #[error("Configuration validation error: {0}")]
    Validation(String),
}

// ----------------------------------------------------------------------------
// Tests
// ----------------------------------------------------------------------------
