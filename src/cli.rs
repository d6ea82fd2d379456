use clap::{Parser, Subcommand};
use walletd::CheckMethod;

#[derive(Parser, Debug)]
#[command(version, about = "monero-wallet-rpc supervisor")]
pub struct Args {
    /// Path to configuration file
    #[arg(long, short = 'c', global = true)]
    pub config: Option<String>,

    /// Sub‑commands (run, status)
    #[command(subcommand)]
    pub sub: Option<Cmd>,
}

#[derive(Subcommand, Debug)]
pub enum Cmd {
    /// Supervise wallet-rpc processes (default if no sub‑command)
    Run,
    /// Check wallet-rpc health (Exit 0 = healthy, 1 = not running or unknown node)
    Status {
        /// Node id or name; every eligible node when omitted
        node: Option<String>,

        /// Check method: pid, port, api or full
        #[arg(long, default_value = "api")]
        method: CheckMethod,

        /// Check every eligible node
        #[arg(long, conflicts_with = "node")]
        all: bool,
    },
}
