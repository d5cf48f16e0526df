//! Command-line interface.

pub mod commands;

use clap::{Parser, Subcommand};

/// Coherence - lock, transaction and id coordination server.
#[derive(Parser, Debug)]
#[command(name = "coherence")]
#[command(author, version, about, long_about = None)]
pub struct Cli {
    /// Configuration file path.
    #[arg(short, long, global = true)]
    pub config: Option<String>,

    /// Log level (trace, debug, info, warn, error).
    #[arg(long, global = true)]
    pub log_level: Option<String>,

    #[command(subcommand)]
    pub command: Commands,
}

/// Available commands.
#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Start the coherence server.
    Start(commands::StartArgs),
    /// Configuration operations.
    Config(commands::ConfigArgs),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_start_with_overrides() {
        let cli = Cli::try_parse_from([
            "coherence",
            "--config",
            "server.toml",
            "start",
            "--bind",
            "127.0.0.1:7000",
            "--reconnect-window-ms",
            "500",
        ])
        .unwrap();
        assert_eq!(cli.config.as_deref(), Some("server.toml"));
        match cli.command {
            Commands::Start(args) => {
                assert_eq!(args.bind.as_deref(), Some("127.0.0.1:7000"));
                assert_eq!(args.reconnect_window_ms, Some(500));
                assert!(args.store_path.is_none());
            }
            other => panic!("unexpected command: {:?}", other),
        }
    }

    #[test]
    fn test_parse_config_validate() {
        let cli = Cli::try_parse_from(["coherence", "config", "validate"]).unwrap();
        assert!(matches!(cli.command, Commands::Config(_)));
    }
}
