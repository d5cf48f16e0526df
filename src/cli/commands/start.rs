//! Start command implementation.

use crate::core::config::{Config, ConfigOverrides};
use crate::core::runtime::Runtime;
use anyhow::{Context, Result};
use clap::Args;
use std::path::Path;

/// Start the coherence server.
#[derive(Args, Debug, Default)]
pub struct StartArgs {
    /// Override `server.bind`.
    #[arg(long)]
    pub bind: Option<String>,

    /// Override `server.reconnect_window_ms`.
    #[arg(long)]
    pub reconnect_window_ms: Option<u64>,

    /// Persist id ceilings under this directory.
    #[arg(long)]
    pub store_path: Option<String>,
}

impl StartArgs {
    fn overrides(&self, log_level: Option<String>) -> ConfigOverrides {
        ConfigOverrides {
            log_level,
            bind: self.bind.clone(),
            reconnect_window_ms: self.reconnect_window_ms,
            store_path: self.store_path.clone(),
        }
    }
}

/// Initialize tracing subscriber if the telemetry feature is enabled.
#[cfg(feature = "telemetry")]
fn init_tracing(level: &str) {
    use tracing_subscriber::{fmt, prelude::*, EnvFilter};

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));

    let _ = tracing_subscriber::registry()
        .with(fmt::layer().with_target(true))
        .with(filter)
        .try_init();
}

#[cfg(not(feature = "telemetry"))]
fn init_tracing(_level: &str) {}

/// Load the config (or defaults when `config_path` is absent), apply CLI
/// overrides and run the server until interrupted.
pub async fn run_start(
    config_path: Option<&Path>,
    log_level: Option<String>,
    args: StartArgs,
) -> Result<()> {
    let mut config = match config_path {
        Some(path) => Config::from_file(path)
            .with_context(|| format!("failed to load config from {:?}", path))?,
        None => Config::for_node("coherence"),
    };
    config.apply_overrides(&args.overrides(log_level));

    init_tracing(&config.telemetry.log_level);

    let mut runtime = Runtime::new(config)?;
    runtime.run().await
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_overrides_carry_every_flag() {
        let args = StartArgs {
            bind: Some("0.0.0.0:9000".into()),
            reconnect_window_ms: Some(250),
            store_path: Some("/tmp/ids".into()),
        };
        let mut config = Config::for_node("n1");
        config.apply_overrides(&args.overrides(Some("debug".into())));
        assert_eq!(config.server.bind, "0.0.0.0:9000");
        assert_eq!(config.server.reconnect_window_ms, 250);
        assert_eq!(config.sequence.store, "file");
        assert_eq!(config.sequence.store_path, "/tmp/ids");
        assert_eq!(config.telemetry.log_level, "debug");
    }
}
