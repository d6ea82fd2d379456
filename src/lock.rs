//! Node and wallet scoped mutual exclusion.
//!
//! wallet-rpc is a single-writer service, so anything that mutates wallet
//! state runs under a lease. Locally managed nodes are never shared with
//! another process and skip locking entirely. When both scopes are needed the
//! node lock is always taken first and released last.

use std::future::Future;
use std::time::Duration;

use chrono::{DateTime, TimeDelta, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::config::LockConfig;
use crate::error::{Error, Result};
use crate::node::{Node, Wallet};

mod file;
mod memory;

pub use file::FileBackend;
pub use memory::MemoryBackend;

const POLL_INTERVAL: Duration = Duration::from_millis(250);

/// A held lock. Expires on its own if the holder dies.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Lease {
    pub name: String,
    pub owner: String,
    pub expires_at: DateTime<Utc>,
}

impl Lease {
    pub fn new(name: &str, ttl: Duration, now: DateTime<Utc>) -> Self {
        let expires_at = TimeDelta::from_std(ttl)
            .ok()
            .and_then(|ttl| now.checked_add_signed(ttl))
            .unwrap_or(DateTime::<Utc>::MAX_UTC);
        Self {
            name: name.to_string(),
            owner: Uuid::new_v4().to_string(),
            expires_at,
        }
    }

    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.expires_at <= now
    }
}

/// Storage for leases. The single source of truth for who holds what.
pub trait LockBackend: Send + Sync {
    /// Take `name` if it is free or expired. Never blocks.
    fn try_acquire(&self, name: &str, ttl: Duration) -> Result<Option<Lease>>;

    /// Drop `lease` if it is still the current holder of its name.
    fn release(&self, lease: &Lease) -> Result<()>;
}

/// Releases its lease when dropped.
#[must_use = "the lock is released as soon as the guard is dropped"]
pub struct LockGuard<'a, B: LockBackend> {
    backend: &'a B,
    lease: Option<Lease>,
}

impl<B: LockBackend> LockGuard<'_, B> {
    pub fn name(&self) -> &str {
        self.lease.as_ref().map_or("", |l| l.name.as_str())
    }

    /// Release now and surface backend errors instead of logging them.
    pub fn release(mut self) -> Result<()> {
        match self.lease.take() {
            Some(lease) => self.backend.release(&lease),
            None => Ok(()),
        }
    }
}

impl<B: LockBackend> Drop for LockGuard<'_, B> {
    fn drop(&mut self) {
        if let Some(lease) = self.lease.take()
            && let Err(e) = self.backend.release(&lease)
        {
            log::warn!("Failed to release lock {}: {e}", lease.name);
        }
    }
}

/// Node lock plus wallet lock. Drops the wallet lock first.
#[must_use = "the locks are released as soon as the guard is dropped"]
pub struct GeneralGuard<'a, B: LockBackend> {
    wallet: Option<LockGuard<'a, B>>,
    node: Option<LockGuard<'a, B>>,
}

impl<B: LockBackend> GeneralGuard<'_, B> {
    /// False for local nodes, where nothing was locked.
    pub fn is_locked(&self) -> bool {
        self.node.is_some() || self.wallet.is_some()
    }
}

impl<B: LockBackend> Drop for GeneralGuard<'_, B> {
    fn drop(&mut self) {
        drop(self.wallet.take());
        drop(self.node.take());
    }
}

/// Backend picked from [`LockConfig`]: lock files when `dir` is set, memory otherwise.
#[derive(Debug)]
pub enum ConfiguredBackend {
    Memory(MemoryBackend),
    File(FileBackend),
}

impl LockBackend for ConfiguredBackend {
    fn try_acquire(&self, name: &str, ttl: Duration) -> Result<Option<Lease>> {
        match self {
            ConfiguredBackend::Memory(b) => b.try_acquire(name, ttl),
            ConfiguredBackend::File(b) => b.try_acquire(name, ttl),
        }
    }

    fn release(&self, lease: &Lease) -> Result<()> {
        match self {
            ConfiguredBackend::Memory(b) => b.release(lease),
            ConfiguredBackend::File(b) => b.release(lease),
        }
    }
}

pub struct LockManager<B> {
    backend: B,
    prefix: String,
    ttl: Duration,
    default_wait: Duration,
}

impl LockManager<ConfiguredBackend> {
    pub fn from_config(cfg: &LockConfig) -> Self {
        let backend = match &cfg.dir {
            Some(dir) => ConfiguredBackend::File(FileBackend::new(dir)),
            None => ConfiguredBackend::Memory(MemoryBackend::new()),
        };
        Self::new(backend, cfg)
    }
}

impl<B: LockBackend> LockManager<B> {
    pub fn new(backend: B, cfg: &LockConfig) -> Self {
        Self {
            backend,
            prefix: cfg.prefix.clone(),
            ttl: cfg.ttl(),
            default_wait: cfg.wait(),
        }
    }

    pub fn backend(&self) -> &B {
        &self.backend
    }

    pub fn lock_name(&self, name: &str) -> String {
        format!("{}_{name}", self.prefix)
    }

    pub fn node_lock_name(&self, node: &Node) -> String {
        self.lock_name(&format!("node_{}", node.id))
    }

    pub fn wallet_lock_name(&self, wallet: &Wallet) -> String {
        self.lock_name(&format!("wallet_{}", wallet.id))
    }

    /// Acquire `<prefix>_<name>`, polling until `wait` (or the configured default) runs out.
    pub async fn acquire(&self, name: &str, wait: Option<Duration>) -> Result<LockGuard<'_, B>> {
        self.acquire_scoped(self.lock_name(name), wait).await
    }

    /// `None` when the node is local and no lock is needed.
    pub async fn acquire_node(
        &self,
        node: &Node,
        wait: Option<Duration>,
    ) -> Result<Option<LockGuard<'_, B>>> {
        if node.is_local() {
            return Ok(None);
        }
        self.acquire_scoped(self.node_lock_name(node), wait)
            .await
            .map(Some)
    }

    pub async fn acquire_wallet(
        &self,
        wallet: &Wallet,
        wait: Option<Duration>,
    ) -> Result<Option<LockGuard<'_, B>>> {
        if wallet.node.is_local() {
            return Ok(None);
        }
        self.acquire_scoped(self.wallet_lock_name(wallet), wait)
            .await
            .map(Some)
    }

    /// Node lock, then wallet lock. A failed wallet acquisition releases the node lock.
    pub async fn acquire_general(
        &self,
        wallet: &Wallet,
        wait: Option<Duration>,
    ) -> Result<GeneralGuard<'_, B>> {
        let node = self.acquire_node(&wallet.node, wait).await?;
        let wallet = self.acquire_wallet(wallet, wait).await?;
        Ok(GeneralGuard { wallet, node })
    }

    pub async fn with_lock<T, E, F, Fut>(&self, name: &str, wait: Option<Duration>, f: F) -> Result<T, E>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, E>>,
        E: From<Error>,
    {
        let _guard = self.acquire(name, wait).await?;
        f().await
    }

    pub async fn with_node_lock<T, E, F, Fut>(
        &self,
        node: &Node,
        wait: Option<Duration>,
        f: F,
    ) -> Result<T, E>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, E>>,
        E: From<Error>,
    {
        let _guard = self.acquire_node(node, wait).await?;
        f().await
    }

    pub async fn with_wallet_lock<T, E, F, Fut>(
        &self,
        wallet: &Wallet,
        wait: Option<Duration>,
        f: F,
    ) -> Result<T, E>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, E>>,
        E: From<Error>,
    {
        let _guard = self.acquire_wallet(wallet, wait).await?;
        f().await
    }

    pub async fn with_general_lock<T, E, F, Fut>(
        &self,
        wallet: &Wallet,
        wait: Option<Duration>,
        f: F,
    ) -> Result<T, E>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, E>>,
        E: From<Error>,
    {
        let _guard = self.acquire_general(wallet, wait).await?;
        f().await
    }

    async fn acquire_scoped(&self, name: String, wait: Option<Duration>) -> Result<LockGuard<'_, B>> {
        let wait = wait.unwrap_or(self.default_wait);
        let deadline = tokio::time::Instant::now() + wait;

        loop {
            if let Some(lease) = self.backend.try_acquire(&name, self.ttl)? {
                log::debug!("Acquired lock {name} until {}", lease.expires_at);
                return Ok(LockGuard {
                    backend: &self.backend,
                    lease: Some(lease),
                });
            }

            let now = tokio::time::Instant::now();
            if now >= deadline {
                return Err(Error::LockTimeout { name, waited: wait });
            }
            tokio::time::sleep(POLL_INTERVAL.min(deadline - now)).await;
        }
    }
}
