//! CLI argument parsing.

use clap::{Parser, Subcommand};

#[derive(Parser)]
#[command(name = "waveproxy", version, about = "Multi-channel AI API reverse proxy")]
pub struct Cli {
    #[command(subcommand)]
    pub command: Option<Command>,
}

#[derive(Subcommand)]
pub enum Command {
    /// Run the proxy (default when no subcommand is given)
    Run(RunArgs),
}

#[derive(Parser, Debug)]
pub struct RunArgs {
    /// Path to the settings file (defaults to waveproxy.json in the user
    /// config directory)
    #[arg(short, long, env = "WAVEPROXY_CONFIG")]
    pub config: Option<String>,

    /// Listen port override (not persisted)
    #[arg(long, env = "WAVEPROXY_PORT")]
    pub port: Option<u16>,

    /// Log level filter
    #[arg(long, default_value = "info", env = "WAVEPROXY_LOG_LEVEL")]
    pub log_level: String,
}

impl Default for RunArgs {
    fn default() -> Self {
        Self {
            config: None,
            port: None,
            log_level: "info".to_string(),
        }
    }
}
