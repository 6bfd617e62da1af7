//! Command-line interface definitions.

use clap::{Args, Parser, Subcommand};
use std::path::PathBuf;

/// MITM forward proxy with TLS interception, rule hooks and traffic recording.
#[derive(Parser, Debug)]
#[command(name = "eden-proxy", author, version, about, long_about = None)]
pub struct Cli {
    /// Subcommand. Without one the proxy runs with the flags below.
    #[command(subcommand)]
    pub command: Option<Commands>,

    /// Proxy flags used when no subcommand is given.
    #[command(flatten)]
    pub run: RunArgs,

    /// Increase verbosity (-v, -vv, -vvv).
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    pub verbose: u8,
}

impl Cli {
    /// Flags of the proxy run, from `run` or from the top level.
    pub fn run_args(&self) -> &RunArgs {
        match &self.command {
            Some(Commands::Run(args)) => args,
            _ => &self.run,
        }
    }
}

/// Available subcommands.
#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Run the proxy.
    Run(RunArgs),

    /// Generate the root CA pair.
    InitCa {
        /// Directory to write the root into. Defaults to the configured directory.
        #[arg(long)]
        dir: Option<PathBuf>,

        /// Overwrite an existing root.
        #[arg(long)]
        force: bool,
    },
}

/// Flags controlling a proxy run. Each overrides its config file value.
#[derive(Args, Debug, Default, Clone)]
pub struct RunArgs {
    /// Main port to listen on.
    #[arg(short, long)]
    pub port: Option<u16>,

    /// Additional config file (merged after system and user config).
    #[arg(short, long)]
    pub config: Option<PathBuf>,

    /// Intercept every CONNECT tunnel unless a rule decides otherwise.
    #[arg(long)]
    pub intercept: bool,

    /// Route plaintext WebSocket tunnels through the proxy pipeline.
    #[arg(long)]
    pub ws_intercept: bool,

    /// Skip verification of upstream TLS certificates.
    #[arg(long)]
    pub ignore_unauthorized: bool,

    /// Cap bandwidth in KiB/s.
    #[arg(long, value_name = "KBPS")]
    pub throttle: Option<u64>,

    /// Serve the main port over HTTPS.
    #[arg(long, requires = "hostname")]
    pub https: bool,

    /// Hostname presented by the main port when serving HTTPS.
    #[arg(long)]
    pub hostname: Option<String>,
}
