//! Configuration loading and persistence.
//!
//! Options are read from `config.json` in the config directory, then
//! overridden by `HUBWIRE_*` environment variables.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use std::fs;

use crate::connection::ConnectionOptions;
use crate::constants::{
    DEFAULT_BACKPLANE_ACK_TIMEOUT, DEFAULT_BIND_ADDR, DEFAULT_CLIENT_TIMEOUT_INTERVAL,
    DEFAULT_HANDSHAKE_TIMEOUT, DEFAULT_KEEP_ALIVE_INTERVAL, DEFAULT_MAXIMUM_RECEIVE_MESSAGE_SIZE,
    DEFAULT_MAX_PARALLEL_INVOCATIONS, DEFAULT_STREAM_BUFFER_CAPACITY,
};
use crate::dispatcher::DispatcherOptions;
use crate::protocol::{json, messagepack, ProtocolRegistry};

const CONFIG_FILE: &str = "config.json";

/// Hub server options.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
#[serde(default)]
pub struct HubOptions {
    /// Seconds of write silence before the server pings.
    pub keep_alive_interval_secs: u64,
    /// Seconds of read silence before the server drops a client.
    pub client_timeout_interval_secs: u64,
    /// Seconds a client has to complete the handshake.
    pub handshake_timeout_secs: u64,
    /// Largest accepted message in bytes; `null` for no limit.
    pub maximum_receive_message_size: Option<usize>,
    /// Plain invocations one client may run at once.
    pub maximum_parallel_invocations_per_client: usize,
    /// Buffered items per upload stream.
    pub stream_buffer_capacity: usize,
    /// Send error details to clients.
    pub enable_detailed_errors: bool,
    /// Hub protocols offered during the handshake.
    pub supported_protocols: Vec<String>,
    /// Seconds a backplane group command waits for its ack.
    pub backplane_ack_timeout_secs: u64,
    /// Listen address for `hubwire serve`.
    pub bind_addr: String,
}

impl Default for HubOptions {
    fn default() -> Self {
        Self {
            keep_alive_interval_secs: DEFAULT_KEEP_ALIVE_INTERVAL.as_secs(),
            client_timeout_interval_secs: DEFAULT_CLIENT_TIMEOUT_INTERVAL.as_secs(),
            handshake_timeout_secs: DEFAULT_HANDSHAKE_TIMEOUT.as_secs(),
            maximum_receive_message_size: Some(DEFAULT_MAXIMUM_RECEIVE_MESSAGE_SIZE),
            maximum_parallel_invocations_per_client: DEFAULT_MAX_PARALLEL_INVOCATIONS,
            stream_buffer_capacity: DEFAULT_STREAM_BUFFER_CAPACITY,
            enable_detailed_errors: false,
            supported_protocols: vec![
                json::PROTOCOL_NAME.to_string(),
                messagepack::PROTOCOL_NAME.to_string(),
            ],
            backplane_ack_timeout_secs: DEFAULT_BACKPLANE_ACK_TIMEOUT.as_secs(),
            bind_addr: DEFAULT_BIND_ADDR.to_string(),
        }
    }
}

impl HubOptions {
    /// Returns the configuration directory path.
    ///
    /// `HUBWIRE_CONFIG_DIR` wins; otherwise the platform config dir
    /// (e.g. `~/.config/hubwire`).
    pub fn config_dir() -> Result<PathBuf> {
        if let Ok(dir) = std::env::var("HUBWIRE_CONFIG_DIR") {
            return Ok(PathBuf::from(dir));
        }
        Ok(dirs::config_dir()
            .context("Could not determine config directory")?
            .join("hubwire"))
    }

    /// Loads options from the config directory, with environment overrides.
    pub fn load() -> Result<Self> {
        let mut options = Self::load_from(&Self::config_dir()?)?;
        options.apply_env_overrides();
        Ok(options)
    }

    /// Loads `config.json` from `dir`, or defaults if it does not exist.
    pub fn load_from(dir: &Path) -> Result<Self> {
        let path = dir.join(CONFIG_FILE);
        if !path.exists() {
            return Ok(Self::default());
        }
        let content = fs::read_to_string(&path)
            .with_context(|| format!("Failed to read {}", path.display()))?;
        serde_json::from_str(&content).with_context(|| format!("Invalid config in {}", path.display()))
    }

    /// Persists the options to `config.json` in `dir`.
    pub fn save_to(&self, dir: &Path) -> Result<()> {
        fs::create_dir_all(dir)?;
        fs::write(dir.join(CONFIG_FILE), serde_json::to_string_pretty(self)?)?;
        Ok(())
    }

    fn apply_env_overrides(&mut self) {
        self.apply_overrides(|key| std::env::var(key).ok());
    }

    /// Applies `HUBWIRE_*` overrides looked up through `var`.
    /// Values that fail to parse are ignored.
    pub fn apply_overrides(&mut self, var: impl Fn(&str) -> Option<String>) {
        fn parsed<T: std::str::FromStr>(var: &impl Fn(&str) -> Option<String>, key: &str) -> Option<T> {
            let value = var(key)?;
            match value.trim().parse() {
                Ok(v) => Some(v),
                Err(_) => {
                    log::warn!("[Config] Ignoring {key}={value}: not a valid value");
                    None
                }
            }
        }

        if let Some(v) = parsed(&var, "HUBWIRE_KEEP_ALIVE_INTERVAL_SECS") {
            self.keep_alive_interval_secs = v;
        }
        if let Some(v) = parsed(&var, "HUBWIRE_CLIENT_TIMEOUT_INTERVAL_SECS") {
            self.client_timeout_interval_secs = v;
        }
        if let Some(v) = parsed(&var, "HUBWIRE_HANDSHAKE_TIMEOUT_SECS") {
            self.handshake_timeout_secs = v;
        }
        if let Some(value) = var("HUBWIRE_MAXIMUM_RECEIVE_MESSAGE_SIZE") {
            if value.eq_ignore_ascii_case("none") {
                self.maximum_receive_message_size = None;
            } else if let Some(v) = parsed(&var, "HUBWIRE_MAXIMUM_RECEIVE_MESSAGE_SIZE") {
                self.maximum_receive_message_size = Some(v);
            }
        }
        if let Some(v) = parsed(&var, "HUBWIRE_MAXIMUM_PARALLEL_INVOCATIONS_PER_CLIENT") {
            self.maximum_parallel_invocations_per_client = v;
        }
        if let Some(v) = parsed(&var, "HUBWIRE_STREAM_BUFFER_CAPACITY") {
            self.stream_buffer_capacity = v;
        }
        if let Some(v) = parsed(&var, "HUBWIRE_ENABLE_DETAILED_ERRORS") {
            self.enable_detailed_errors = v;
        }
        if let Some(protocols) = var("HUBWIRE_SUPPORTED_PROTOCOLS") {
            self.supported_protocols = protocols
                .split(',')
                .map(str::trim)
                .filter(|p| !p.is_empty())
                .map(str::to_string)
                .collect();
        }
        if let Some(v) = parsed(&var, "HUBWIRE_BACKPLANE_ACK_TIMEOUT_SECS") {
            self.backplane_ack_timeout_secs = v;
        }
        if let Some(addr) = var("HUBWIRE_BIND_ADDR") {
            self.bind_addr = addr;
        }
    }

    /// Rejects option combinations the server cannot run with.
    pub fn validate(&self) -> Result<()> {
        if self.supported_protocols.is_empty() {
            anyhow::bail!("supported_protocols must not be empty");
        }
        if self.stream_buffer_capacity == 0 {
            anyhow::bail!("stream_buffer_capacity must be at least 1");
        }
        if self.maximum_parallel_invocations_per_client == 0 {
            anyhow::bail!("maximum_parallel_invocations_per_client must be at least 1");
        }
        if self.keep_alive_interval_secs == 0 {
            anyhow::bail!("keep_alive_interval_secs must be at least 1");
        }
        if self.keep_alive_interval_secs >= self.client_timeout_interval_secs {
            anyhow::bail!(
                "keep_alive_interval_secs ({}) must be shorter than client_timeout_interval_secs ({})",
                self.keep_alive_interval_secs,
                self.client_timeout_interval_secs
            );
        }
        ProtocolRegistry::from_names(self.supported_protocols.as_slice())?;
        Ok(())
    }

    /// Registry of the configured protocols.
    pub fn protocol_registry(&self) -> Result<ProtocolRegistry> {
        ProtocolRegistry::from_names(self.supported_protocols.as_slice())
    }

    /// Per-connection timeouts and limits.
    pub fn connection_options(&self) -> ConnectionOptions {
        ConnectionOptions {
            handshake_timeout: Duration::from_secs(self.handshake_timeout_secs),
            keep_alive_interval: Duration::from_secs(self.keep_alive_interval_secs),
            client_timeout_interval: Duration::from_secs(self.client_timeout_interval_secs),
            maximum_receive_message_size: self.maximum_receive_message_size,
            enable_detailed_errors: self.enable_detailed_errors,
        }
    }

    /// Dispatcher settings.
    pub fn dispatcher_options(&self) -> DispatcherOptions {
        DispatcherOptions {
            enable_detailed_errors: self.enable_detailed_errors,
            maximum_parallel_invocations: self.maximum_parallel_invocations_per_client,
            stream_buffer_capacity: self.stream_buffer_capacity,
        }
    }

    /// Ack timeout for backplane group commands.
    pub fn backplane_ack_timeout(&self) -> Duration {
        Duration::from_secs(self.backplane_ack_timeout_secs)
    }
}
