use std::path::PathBuf;

use clap::{Parser, Subcommand};

#[derive(Debug, Parser)]
#[command(name = "credgate", about = "Multi-provider AI credential gateway")]
pub struct Cli {
    /// Path to the configuration file.
    #[arg(long, global = true)]
    pub config: Option<PathBuf>,

    /// Override the configured listen host.
    #[arg(long, global = true)]
    pub host: Option<String>,

    /// Override the configured listen port.
    #[arg(long, global = true)]
    pub port: Option<u16>,

    #[command(subcommand)]
    pub command: Option<Command>,
}

#[derive(Debug, Subcommand)]
pub enum Command {
    /// Run the management listener and background refresh worker (default).
    Serve,
    /// Run a provider login flow and register the resulting credential.
    Login {
        /// Provider key: codex, github-copilot, or kiro.
        #[arg(long)]
        provider: String,
        /// Label override for the new credential.
        #[arg(long)]
        label: Option<String>,
        /// Identity provider for Kiro social login (Google or Github).
        #[arg(long)]
        idp: Option<String>,
        /// Import a sibling tool's token file instead of running a flow.
        #[arg(long)]
        import: Option<PathBuf>,
        /// Discover and import the Kiro IDE token cache automatically.
        #[arg(long, conflicts_with = "import")]
        import_ide: bool,
        /// Print the authorization URL instead of expecting a browser.
        #[arg(long)]
        no_browser: bool,
    },
}
