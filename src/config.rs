use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Top‑level walletd configuration (`walletd.toml`).
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct WalletdConfig {
    /// JSON file holding the node records.
    pub registry_path: PathBuf,
    pub wallet_rpc: WalletRpcConfig,
    pub health: HealthConfig,
    pub atomic_lock: LockConfig,
}

/// How wallet-rpc processes are spawned and watched.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct WalletRpcConfig {
    /// Executable name or path; bare names are resolved through `PATH`.
    pub execute_path: String,
    pub wallet_dir: PathBuf,
    pub log_dir: PathBuf,
    pub watcher_period_secs: u64,
    /// How long a fresh process gets before its stderr is inspected.
    pub settle_delay_ms: u64,
    pub stop_grace_secs: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct HealthConfig {
    pub port_timeout_ms: u64,
    pub api_timeout_ms: u64,
    /// Substring the pid check expects in the process command line.
    pub expected_binary: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LockConfig {
    pub prefix: String,
    /// Lease lifetime; a crashed holder loses the lock after this long.
    pub timeout_secs: u64,
    /// Default bounded wait for acquisition.
    pub wait_secs: u64,
    /// Lock-file directory. Unset means locks are process-local.
    pub dir: Option<PathBuf>,
}

/// Base directory for wallets, logs, locks and the registry file.
pub fn default_data_dir() -> PathBuf {
    #[cfg(target_os = "linux")]
    let base = dirs::data_local_dir().unwrap_or_else(|| {
        dirs::home_dir()
            .unwrap_or_else(|| PathBuf::from("/tmp"))
            .join(".local")
            .join("share")
    });

    #[cfg(not(target_os = "linux"))]
    let base = dirs::data_local_dir()
        .unwrap_or_else(|| dirs::home_dir().unwrap_or_else(std::env::temp_dir));

    base.join("walletd")
}

/// `<config dir>/walletd/walletd.toml`, or `None` when the platform has no config dir.
pub fn default_config_path() -> Option<PathBuf> {
    dirs::config_dir().map(|d| d.join("walletd").join("walletd.toml"))
}

impl WalletdConfig {
    /// Same layout as [`Default`] but rooted at `dir`.
    pub fn rooted_at(dir: &Path) -> Self {
        Self {
            registry_path: dir.join("nodes.json"),
            wallet_rpc: WalletRpcConfig {
                wallet_dir: dir.join("wallets"),
                log_dir: dir.join("logs"),
                ..WalletRpcConfig::default()
            },
            atomic_lock: LockConfig {
                dir: Some(dir.join("locks")),
                ..LockConfig::default()
            },
            health: HealthConfig::default(),
        }
    }
}

impl Default for WalletdConfig {
    fn default() -> Self {
        Self::rooted_at(&default_data_dir())
    }
}

impl WalletRpcConfig {
    pub fn watcher_period(&self) -> Duration {
        Duration::from_secs(self.watcher_period_secs)
    }

    pub fn settle_delay(&self) -> Duration {
        Duration::from_millis(self.settle_delay_ms)
    }

    pub fn stop_grace(&self) -> Duration {
        Duration::from_secs(self.stop_grace_secs)
    }
}

impl Default for WalletRpcConfig {
    fn default() -> Self {
        let data = default_data_dir();
        Self {
            execute_path: "monero-wallet-rpc".into(),
            wallet_dir: data.join("wallets"),
            log_dir: data.join("logs"),
            watcher_period_secs: 30,
            settle_delay_ms: 3_000,
            stop_grace_secs: 3,
        }
    }
}

impl HealthConfig {
    pub fn port_timeout(&self) -> Duration {
        Duration::from_millis(self.port_timeout_ms)
    }

    pub fn api_timeout(&self) -> Duration {
        Duration::from_millis(self.api_timeout_ms)
    }
}

impl Default for HealthConfig {
    fn default() -> Self {
        Self {
            port_timeout_ms: 1_000,
            api_timeout_ms: 3_000,
            expected_binary: "monero-wallet-rpc".into(),
        }
    }
}

impl LockConfig {
    pub fn ttl(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }

    pub fn wait(&self) -> Duration {
        Duration::from_secs(self.wait_secs)
    }
}

impl Default for LockConfig {
    fn default() -> Self {
        Self {
            prefix: "monero".into(),
            timeout_secs: 300,
            wait_secs: 15,
            dir: None,
        }
    }
}
