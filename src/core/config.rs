//! Configuration parsing and validation.
//!
//! Server configuration is loaded from TOML files with CLI overrides.
//! Sections mirror the coherence subsystems; only `[server]` is required.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::Path;

/// Top-level configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Server identity and listener.
    pub server: ServerConfig,

    /// Lock manager tuning.
    #[serde(default)]
    pub locks: LocksConfig,

    /// Id sequence configuration.
    #[serde(default)]
    pub sequence: SequenceConfig,

    /// Stage worker pools.
    #[serde(default)]
    pub stages: StagesConfig,

    /// Logging and operator events.
    #[serde(default)]
    pub telemetry: TelemetryConfig,
}

/// Server identity and listener configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    /// Name recorded on operator events.
    pub node_name: String,

    /// Numeric server id.
    #[serde(default)]
    pub server_id: u64,

    /// Bind address for client connections (e.g. "0.0.0.0:9510").
    #[serde(default = "default_bind")]
    pub bind: String,

    /// Protocol version; clients must share the major component.
    #[serde(default = "default_protocol_version")]
    pub protocol_version: String,

    /// How long a disconnected client's locks and references are retained.
    #[serde(default = "default_reconnect_window_ms")]
    pub reconnect_window_ms: u64,

    /// Maximum concurrent client connections.
    #[serde(default = "default_max_connections")]
    pub max_connections: usize,

    /// Client ids connected to the previous server. When non-empty the
    /// server starts in the starting phase and waits for them to return.
    #[serde(default)]
    pub expected_clients: Vec<u64>,
}

/// Lock manager configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LocksConfig {
    /// Periodic deadlock scan interval; 0 disables periodic scanning.
    #[serde(default = "default_deadlock_scan_interval_ms")]
    pub deadlock_scan_interval_ms: u64,

    /// Also scan whenever a request has to queue.
    #[serde(default)]
    pub scan_on_pending: bool,
}

impl Default for LocksConfig {
    fn default() -> Self {
        Self {
            deadlock_scan_interval_ms: default_deadlock_scan_interval_ms(),
            scan_on_pending: false,
        }
    }
}

/// Id sequence configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SequenceConfig {
    /// Number of server groups (stripes), each with its own counter.
    #[serde(default = "default_groups")]
    pub groups: u32,

    /// Ids a client hands out per local batch.
    #[serde(default = "default_client_batch_size")]
    pub client_batch_size: u64,

    /// Ids a client requests from the server per fetch.
    #[serde(default = "default_client_fetch_size")]
    pub client_fetch_size: u64,

    /// Remaining ids below which a client prefetches.
    #[serde(default = "default_client_low_water")]
    pub client_low_water: u64,

    /// Persistence: "memory" or "file".
    #[serde(default = "default_store")]
    pub store: String,

    /// Directory for the file store.
    #[serde(default = "default_store_path")]
    pub store_path: String,

    /// Ids reserved past the current value on each persisted write.
    #[serde(default = "default_reserve_ahead")]
    pub reserve_ahead: u64,
}

impl Default for SequenceConfig {
    fn default() -> Self {
        Self {
            groups: default_groups(),
            client_batch_size: default_client_batch_size(),
            client_fetch_size: default_client_fetch_size(),
            client_low_water: default_client_low_water(),
            store: default_store(),
            store_path: default_store_path(),
            reserve_ahead: default_reserve_ahead(),
        }
    }
}

/// Stage worker configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StagesConfig {
    /// Lock stage workers.
    #[serde(default = "default_workers")]
    pub lock_workers: usize,

    /// Transaction stage workers.
    #[serde(default = "default_workers")]
    pub txn_workers: usize,

    /// Handshake stage workers.
    #[serde(default = "default_handshake_workers")]
    pub handshake_workers: usize,

    /// Per-worker queue depth.
    #[serde(default = "default_queue_depth")]
    pub queue_depth: usize,
}

impl Default for StagesConfig {
    fn default() -> Self {
        Self {
            lock_workers: default_workers(),
            txn_workers: default_workers(),
            handshake_workers: default_handshake_workers(),
            queue_depth: default_queue_depth(),
        }
    }
}

/// Telemetry configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TelemetryConfig {
    /// Log level: "trace", "debug", "info", "warn", "error".
    #[serde(default = "default_log_level")]
    pub log_level: String,

    /// Operator events retained in memory.
    #[serde(default = "default_event_buffer_size")]
    pub event_buffer_size: usize,
}

impl Default for TelemetryConfig {
    fn default() -> Self {
        Self {
            log_level: default_log_level(),
            event_buffer_size: default_event_buffer_size(),
        }
    }
}

// Default value functions

fn default_bind() -> String {
    "0.0.0.0:9510".to_string()
}

fn default_protocol_version() -> String {
    crate::PROTOCOL_VERSION.to_string()
}

fn default_reconnect_window_ms() -> u64 {
    120_000
}

fn default_max_connections() -> usize {
    10_000
}

fn default_deadlock_scan_interval_ms() -> u64 {
    10_000
}

fn default_groups() -> u32 {
    1
}

fn default_client_batch_size() -> u64 {
    1_000
}

fn default_client_fetch_size() -> u64 {
    10_000
}

fn default_client_low_water() -> u64 {
    2_000
}

fn default_store() -> String {
    "memory".to_string()
}

fn default_store_path() -> String {
    "data/sequence".to_string()
}

fn default_reserve_ahead() -> u64 {
    100_000
}

fn default_workers() -> usize {
    4
}

fn default_handshake_workers() -> usize {
    2
}

fn default_queue_depth() -> usize {
    1_024
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_event_buffer_size() -> usize {
    1_000
}

impl Config {
    /// Load configuration from a TOML file.
    pub fn from_file(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read config file: {}", path.display()))?;
        let config: Config =
            toml::from_str(&content).with_context(|| "failed to parse config file")?;
        config.validate()?;
        Ok(config)
    }

    /// Load configuration from a TOML string.
    pub fn from_toml(content: &str) -> Result<Self> {
        let config: Config = toml::from_str(content).with_context(|| "failed to parse config")?;
        config.validate()?;
        Ok(config)
    }

    /// Minimal valid configuration for a named server, all sections defaulted.
    pub fn for_node(node_name: impl Into<String>) -> Self {
        Self {
            server: ServerConfig {
                node_name: node_name.into(),
                server_id: 0,
                bind: default_bind(),
                protocol_version: default_protocol_version(),
                reconnect_window_ms: default_reconnect_window_ms(),
                max_connections: default_max_connections(),
                expected_clients: Vec::new(),
            },
            locks: LocksConfig::default(),
            sequence: SequenceConfig::default(),
            stages: StagesConfig::default(),
            telemetry: TelemetryConfig::default(),
        }
    }

    /// Apply CLI overrides to the configuration.
    pub fn apply_overrides(&mut self, overrides: &ConfigOverrides) {
        if let Some(ref log_level) = overrides.log_level {
            self.telemetry.log_level = log_level.clone();
        }
        if let Some(ref bind) = overrides.bind {
            self.server.bind = bind.clone();
        }
        if let Some(window) = overrides.reconnect_window_ms {
            self.server.reconnect_window_ms = window;
        }
        if let Some(ref store_path) = overrides.store_path {
            self.sequence.store = "file".to_string();
            self.sequence.store_path = store_path.clone();
        }
    }

    /// Validate configuration consistency.
    pub fn validate(&self) -> Result<()> {
        self.validate_server()?;
        self.validate_sequence()?;
        self.validate_stages()?;
        self.validate_telemetry()?;
        Ok(())
    }

    fn validate_server(&self) -> Result<()> {
        if self.server.node_name.trim().is_empty() {
            anyhow::bail!("server.node_name must not be empty");
        }
        self.server
            .bind
            .parse::<std::net::SocketAddr>()
            .with_context(|| format!("server.bind is not a socket address: {}", self.server.bind))?;
        if self.server.max_connections == 0 {
            anyhow::bail!("server.max_connections must be > 0");
        }
        if crate::protocol::major_version(&self.server.protocol_version).is_none() {
            anyhow::bail!(
                "server.protocol_version must look like MAJOR.MINOR, got: {}",
                self.server.protocol_version
            );
        }
        Ok(())
    }

    fn validate_sequence(&self) -> Result<()> {
        let seq = &self.sequence;
        if seq.groups == 0 {
            anyhow::bail!("sequence.groups must be > 0");
        }
        if seq.client_batch_size == 0 {
            anyhow::bail!("sequence.client_batch_size must be > 0");
        }
        if seq.client_fetch_size < seq.client_batch_size {
            anyhow::bail!(
                "sequence.client_fetch_size ({}) cannot be smaller than client_batch_size ({})",
                seq.client_fetch_size,
                seq.client_batch_size
            );
        }
        if seq.client_low_water >= seq.client_fetch_size {
            anyhow::bail!(
                "sequence.client_low_water ({}) must be below client_fetch_size ({})",
                seq.client_low_water,
                seq.client_fetch_size
            );
        }
        if seq.store != "memory" && seq.store != "file" {
            anyhow::bail!("sequence.store must be 'memory' or 'file', got: {}", seq.store);
        }
        if seq.reserve_ahead == 0 {
            anyhow::bail!("sequence.reserve_ahead must be > 0");
        }
        Ok(())
    }

    fn validate_stages(&self) -> Result<()> {
        let stages = &self.stages;
        if stages.lock_workers == 0 || stages.txn_workers == 0 || stages.handshake_workers == 0 {
            anyhow::bail!("stages worker counts must be > 0");
        }
        if stages.queue_depth == 0 {
            anyhow::bail!("stages.queue_depth must be > 0");
        }
        Ok(())
    }

    fn validate_telemetry(&self) -> Result<()> {
        let valid_levels = ["trace", "debug", "info", "warn", "error"];
        if !valid_levels.contains(&self.telemetry.log_level.as_str()) {
            anyhow::bail!(
                "telemetry.log_level must be one of {:?}, got: {}",
                valid_levels,
                self.telemetry.log_level
            );
        }
        Ok(())
    }
}

/// CLI override options that can be applied to configuration.
#[derive(Debug, Clone, Default)]
pub struct ConfigOverrides {
    /// Override log level.
    pub log_level: Option<String>,
    /// Override bind address.
    pub bind: Option<String>,
    /// Override reconnect window.
    pub reconnect_window_ms: Option<u64>,
    /// Use the file sequence store at this path.
    pub store_path: Option<String>,
}
