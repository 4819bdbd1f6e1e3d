//! CLI entry point for mcp-hub.

use std::path::PathBuf;

use clap::{Parser, Subcommand};

/// mcp-hub gateway CLI
#[derive(Parser, Debug)]
#[command(name = "mcp-hub", version, about = "Multi-tenant MCP gateway")]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,
}

/// Top-level CLI commands.
#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Run the HTTP gateway
    Serve(ServeArgs),
    /// Serve one instance over standard input/output
    Stdio(StdioArgs),
}

/// Arguments for `mcp-hub serve`.
#[derive(Parser, Debug)]
pub struct ServeArgs {
    /// TOML configuration file
    #[arg(short, long)]
    pub config: Option<PathBuf>,

    /// Listen address, overrides the configured one
    #[arg(short, long)]
    pub bind: Option<String>,
}

/// Arguments for `mcp-hub stdio`.
#[derive(Parser, Debug)]
pub struct StdioArgs {
    /// Id of the persisted instance to serve
    #[arg(short, long)]
    pub instance: String,

    /// TOML configuration file
    #[arg(short, long)]
    pub config: Option<PathBuf>,
}

impl Cli {
    /// Parse CLI arguments.
    pub fn parse_args() -> Self {
        Self::parse()
    }
}
