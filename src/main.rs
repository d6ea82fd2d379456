mod cli;

use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use log::{error, info};
use tokio_util::sync::CancellationToken;
use walletd::config::{self, WalletdConfig};
use walletd::health::{Details, HealthVerdict};
use walletd::process::DaemonLauncher;
use walletd::registry::JsonRegistry;
use walletd::status::{self, CheckStats};
use walletd::supervisor::{self, Supervisor};
use walletd::{CheckMethod, HealthChecker, Node};

fn main() {
    env_logger::Builder::from_default_env()
        .format(|buf, record| {
            use std::io::Write;
            writeln!(
                buf,
                "[{} {} {}:{}] {}",
                buf.timestamp_millis(),
                record.level(),
                record.file().unwrap_or("unknown"),
                record.line().unwrap_or(0),
                record.args()
            )
        })
        .filter_level(log::LevelFilter::Info)
        .init();

    let rt = match tokio::runtime::Runtime::new() {
        Ok(rt) => rt,
        Err(e) => {
            eprintln!("FATAL: Failed to create Tokio runtime: {e}");
            std::process::exit(1);
        }
    };
    match rt.block_on(real_main()) {
        Ok(code) => std::process::exit(code),
        Err(e) => {
            error!("{e:#}");
            std::process::exit(1);
        }
    }
}

async fn real_main() -> Result<i32> {
    let args = cli::Args::parse();
    let cfg = load_config(args.config)?;

    match args.sub.unwrap_or(cli::Cmd::Run) {
        cli::Cmd::Run => run_supervisor(cfg).await.map(|()| 0),
        cli::Cmd::Status { node, method, all } => {
            handle_status(&cfg, node.filter(|_| !all), method).await
        }
    }
}

fn load_config(config_path: Option<String>) -> Result<WalletdConfig> {
    let cfg_path = match config_path {
        Some(path) => PathBuf::from(path),
        None => config::default_config_path()
            .ok_or_else(|| anyhow::anyhow!("Could not determine config directory"))?,
    };

    if !cfg_path.exists() {
        info!(
            "Config not found at {}, creating default configuration",
            cfg_path.display()
        );
        if let Some(parent) = cfg_path.parent() {
            fs::create_dir_all(parent).context("Failed to create config directory")?;
        }
        let default_toml = toml::to_string_pretty(&WalletdConfig::default())
            .context("Failed to serialize default config")?;
        fs::write(&cfg_path, default_toml).context("Failed to write config file")?;
        info!("Created default configuration at {}", cfg_path.display());
    }

    let cfg_str = fs::read_to_string(&cfg_path).context("Failed to read config file")?;
    let cfg: WalletdConfig = toml::from_str(&cfg_str).context("Failed to parse config")?;
    info!("Using config from: {}", cfg_path.display());
    Ok(cfg)
}

fn open_registry(path: &Path) -> Result<JsonRegistry> {
    if !path.exists() {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).context("Failed to create registry directory")?;
        }
        fs::write(path, "[]").context("Failed to create empty node registry")?;
        info!("Created empty node registry at {}", path.display());
    }
    Ok(JsonRegistry::new(path))
}

async fn run_supervisor(cfg: WalletdConfig) -> Result<()> {
    let registry = Arc::new(open_registry(&cfg.registry_path)?);
    let launcher = Arc::new(DaemonLauncher::from_config(&cfg.wallet_rpc));
    let checker =
        HealthChecker::from_config(&cfg.health).context("Failed to build health checker")?;

    info!("Spawning wallet-rpc from {}", launcher.program().display());
    let supervisor = Supervisor::new(registry, launcher, checker, &cfg.wallet_rpc);

    let shutdown = CancellationToken::new();
    supervisor::install_signal_handlers(shutdown.clone(), supervisor.sink())?;

    info!("walletd supervisor started (pid {})", std::process::id());
    supervisor.run(shutdown).await?;
    info!("walletd supervisor exiting");
    Ok(())
}

/// Print the verdict(s). Exit code 0 iff everything checked is healthy.
async fn handle_status(
    cfg: &WalletdConfig,
    node: Option<String>,
    method: CheckMethod,
) -> Result<i32> {
    let registry = open_registry(&cfg.registry_path)?;
    let checker =
        HealthChecker::from_config(&cfg.health).context("Failed to build health checker")?;

    match node {
        Some(ident) => {
            match status::check_node(&registry, &checker, &ident, method)
                .await
                .context("Status check failed")?
            {
                Some((node, verdict)) => {
                    print_verdict(&node, &verdict);
                    Ok(if verdict.status { 0 } else { 1 })
                }
                None => {
                    eprintln!("Unknown node: {ident}");
                    Ok(1)
                }
            }
        }
        None => {
            let stats = status::check_all_nodes(&registry, &checker, method)
                .await
                .context("Status check failed")?;
            print_stats(&stats);
            Ok(if stats.all_healthy() { 0 } else { 1 })
        }
    }
}

fn mark(ok: bool) -> &'static str {
    if ok { "✓" } else { "✗" }
}

fn print_verdict(node: &Node, verdict: &HealthVerdict) {
    println!(
        "{} {} (#{}) [{}] {}",
        mark(verdict.status),
        node.name,
        node.id,
        verdict.method,
        verdict.message()
    );
    if let Some(err) = verdict.error() {
        println!("    error: {err}");
    }
    if let Details::Full(full) = &verdict.details {
        for part in [&full.checks.pid, &full.checks.port, &full.checks.api] {
            println!(
                "    {} {:<4} {}",
                mark(part.status),
                part.method.as_str(),
                part.message()
            );
        }
    }
}

fn print_stats(stats: &CheckStats) {
    for node in &stats.nodes {
        println!(
            "{} {} (#{}) {}",
            mark(node.status),
            node.name,
            node.id,
            node.message
        );
    }
    println!(
        "{} checked, {} working, {} failed",
        stats.total, stats.working, stats.failed
    );
}
