//! Config command implementation.

use crate::core::config::Config;
use anyhow::{Context, Result};
use clap::{Args, Subcommand};
use std::path::{Path, PathBuf};

/// Configuration operations.
#[derive(Args, Debug)]
pub struct ConfigArgs {
    #[command(subcommand)]
    pub command: ConfigCommand,
}

/// Config subcommands.
#[derive(Subcommand, Debug)]
pub enum ConfigCommand {
    /// Parse and validate a configuration file.
    Validate {
        /// Config file path.
        #[arg(short, long, default_value = "config/coherence.toml")]
        config: PathBuf,
    },
    /// Print the effective configuration with defaults filled in.
    Show {
        /// Config file path.
        #[arg(short, long, default_value = "config/coherence.toml")]
        config: PathBuf,
        /// Output format (toml, json).
        #[arg(long, default_value = "toml")]
        format: String,
    },
    /// Print a configuration template.
    Generate {
        /// Output file path.
        #[arg(short, long)]
        output: Option<PathBuf>,
        /// Node name written into the template.
        #[arg(long, default_value = "coherence-1")]
        node_name: String,
    },
}

/// Run the config command.
pub fn run_config(args: ConfigArgs) -> Result<()> {
    match args.command {
        ConfigCommand::Validate { config } => validate_config(&config),
        ConfigCommand::Show { config, format } => show_config(&config, &format),
        ConfigCommand::Generate { output, node_name } => {
            generate_config(output.as_deref(), &node_name)
        }
    }
}

fn load(path: &Path) -> Result<Config> {
    if !path.exists() {
        anyhow::bail!("Config file not found: {:?}", path);
    }
    Config::from_file(path).with_context(|| format!("failed to load {:?}", path))
}

fn validate_config(path: &Path) -> Result<()> {
    let config = load(path)?;
    config.validate()?;
    if config.server.expected_clients.is_empty() {
        println!("  note: no expected_clients, server starts immediately");
    } else {
        println!(
            "  note: server waits for {} client(s) before starting",
            config.server.expected_clients.len()
        );
    }
    println!("✓ Configuration is valid");
    Ok(())
}

fn show_config(path: &Path, format: &str) -> Result<()> {
    let config = load(path)?;
    println!("{}", render(&config, format)?);
    Ok(())
}

fn render(config: &Config, format: &str) -> Result<String> {
    match format {
        "json" => Ok(serde_json::to_string_pretty(config)?),
        _ => Ok(toml::to_string_pretty(config)?),
    }
}

fn generate_config(output: Option<&Path>, node_name: &str) -> Result<()> {
    let template = render(&Config::for_node(node_name), "toml")?;
    match output {
        Some(path) => {
            std::fs::write(path, &template)?;
            println!("Generated config template: {:?}", path);
        }
        None => println!("{}", template),
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_generated_template_round_trips() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("coherence.toml");
        generate_config(Some(&path), "gen-node").unwrap();
        let config = load(&path).unwrap();
        assert_eq!(config.server.node_name, "gen-node");
        config.validate().unwrap();
    }

    #[test]
    fn test_validate_missing_file() {
        assert!(validate_config(Path::new("/nonexistent/coherence.toml")).is_err());
    }

    #[test]
    fn test_render_json() {
        let json = render(&Config::for_node("j"), "json").unwrap();
        assert!(json.contains("\"node_name\": \"j\""));
    }
}
