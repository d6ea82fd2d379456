//! The wallet-rpc supervisor: one sequential control loop that keeps every
//! eligible local node's wallet-rpc running.
//!
//! Each tick reads the registry, checks tracked processes over the API,
//! (re)starts what is missing, and stops processes whose node is no longer
//! eligible. The shutdown token is only observed between ticks.

use std::collections::{BTreeMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use chrono::Utc;
use serde_json::json;
use tokio_util::sync::CancellationToken;

use crate::config::WalletRpcConfig;
use crate::events::{EventSink, LogSink, SkipReason, SupervisorEvent};
use crate::health::{CheckMethod, Details, HealthChecker, INTROSPECTION_UNAVAILABLE};
use crate::node::{Node, NodeUpdate};
use crate::process::{Launcher, ProcessHandle, ProcessProbe, SystemProbe};
use crate::registry::NodeRegistry;

/// Owns the in-memory node id → process table for its whole lifetime.
pub struct Supervisor<R, L, P = SystemProbe>
where
    R: NodeRegistry,
    L: Launcher,
    P: ProcessProbe,
{
    registry: Arc<R>,
    launcher: Arc<L>,
    checker: HealthChecker<P>,
    sink: Arc<dyn EventSink>,
    processes: BTreeMap<u64, L::Handle>,
    watch_period: Duration,
    stop_grace: Duration,
}

impl<R, L, P> Supervisor<R, L, P>
where
    R: NodeRegistry,
    L: Launcher,
    P: ProcessProbe,
{
    pub fn new(
        registry: Arc<R>,
        launcher: Arc<L>,
        checker: HealthChecker<P>,
        cfg: &WalletRpcConfig,
    ) -> Self {
        Self {
            registry,
            launcher,
            checker,
            sink: Arc::new(LogSink),
            processes: BTreeMap::new(),
            watch_period: cfg.watcher_period(),
            stop_grace: cfg.stop_grace(),
        }
    }

    pub fn with_sink(mut self, sink: Arc<dyn EventSink>) -> Self {
        self.sink = sink;
        self
    }

    pub fn sink(&self) -> Arc<dyn EventSink> {
        Arc::clone(&self.sink)
    }

    /// Node ids with a live entry in the process table.
    pub fn tracked(&self) -> Vec<u64> {
        self.processes.keys().copied().collect()
    }

    /// Central loop. Runs until `shutdown` is cancelled, then stops every tracked process.
    pub async fn run(mut self, shutdown: CancellationToken) -> Result<()> {
        self.emit(SupervisorEvent::Starting);

        while !shutdown.is_cancelled() {
            self.tick().await;

            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = tokio::time::sleep(self.watch_period) => {}
            }
        }

        self.shutdown().await;
        self.emit(SupervisorEvent::Stopped);
        Ok(())
    }

    /// One pass over the registry. Per-node failures are reported, never propagated.
    pub async fn tick(&mut self) {
        let nodes = match self.registry.eligible() {
            Ok(nodes) => nodes,
            Err(e) => {
                self.emit(SupervisorEvent::RegistryFailed {
                    error: e.to_string(),
                });
                return;
            }
        };

        let active: HashSet<u64> = nodes.iter().map(|n| n.id).collect();
        for node in &nodes {
            self.supervise(node).await;
        }
        self.reconcile(&active).await;
    }

    /// Stop and forget every tracked process.
    pub async fn shutdown(&mut self) {
        let ids = self.tracked();
        for id in ids {
            self.stop_process(id).await;
        }
    }

    async fn supervise(&mut self, node: &Node) {
        let tracked = self.processes.contains_key(&node.id);
        if tracked {
            self.refresh_status(node).await;
        }

        let port_in_use = self.checker.check_port(node).await.status;

        if tracked {
            let running = self
                .processes
                .get_mut(&node.id)
                .is_some_and(|handle| handle.is_running());
            if running && port_in_use {
                self.emit(SupervisorEvent::Skipped {
                    node: node.name.clone(),
                    reason: SkipReason::Healthy,
                });
                return;
            }
        }

        if port_in_use {
            self.emit(SupervisorEvent::Skipped {
                node: node.name.clone(),
                reason: SkipReason::PortOccupied,
            });
            return;
        }

        self.clear_stale(node).await;
        self.start(node).await;
    }

    /// Cheap API check for a tracked node, persisted on every tick.
    async fn refresh_status(&mut self, node: &Node) {
        let verdict = self.checker.check(node, CheckMethod::Api).await;
        self.emit(SupervisorEvent::HealthChecked {
            node: node.name.clone(),
            healthy: verdict.status,
            message: verdict.error().unwrap_or(verdict.message()).to_string(),
        });
        self.write(
            node,
            NodeUpdate::default()
                .worked(verdict.status)
                .worked_data(verdict.worked_data(Utc::now())),
        );
    }

    /// Drop a dead or port-less handle and any pid left over from an earlier run.
    async fn clear_stale(&mut self, node: &Node) {
        let mut reaped = None;
        if let Some(mut handle) = self.processes.remove(&node.id) {
            reaped = handle.pid();
            if let Err(e) = handle.stop(self.stop_grace).await {
                log::warn!("Failed to stop stale wallet-rpc for {}: {e}", node.name);
            }
        }

        let Some(pid) = node.pid else {
            return;
        };

        if reaped != Some(pid) {
            // A pid that runs something else is only forgotten; pids are reused.
            // An unreadable command line cannot rule wallet-rpc out.
            let owned = self.checker.check_pid(node);
            let unreadable = matches!(
                &owned.details,
                Details::Pid(d) if d.reason.as_deref() == Some(INTROSPECTION_UNAVAILABLE)
            );
            if owned.status || unreadable {
                match self.checker.probe().force_kill(pid) {
                    Ok(true) => self.emit(SupervisorEvent::Killed {
                        node: node.name.clone(),
                        pid,
                    }),
                    Ok(false) => log::debug!("pid {pid} of {} already gone", node.name),
                    Err(e) => log::warn!("Failed to kill pid {pid} of {}: {e}", node.name),
                }
            } else {
                log::info!(
                    "Forgetting pid {pid} of {}: {}",
                    node.name,
                    owned.message()
                );
            }
        }

        self.write(node, NodeUpdate::default().pid(None).worked(false));
    }

    async fn start(&mut self, node: &Node) {
        log::info!("Starting wallet-rpc for node {}...", node.name);

        match self.launcher.launch(node).await {
            Ok(handle) => {
                let pid = handle.pid();
                self.processes.insert(node.id, handle);
                self.write(
                    node,
                    NodeUpdate::default().pid(pid).worked(true).worked_data(json!({
                        "started_at": Utc::now().to_rfc3339(),
                        "method": "supervisor",
                        "message": "Process started by supervisor",
                    })),
                );
                self.emit(SupervisorEvent::Started {
                    node: node.name.clone(),
                    pid,
                });
            }
            Err(e) => {
                let error = e.to_string();
                self.write(
                    node,
                    NodeUpdate::default().worked(false).worked_data(json!({
                        "error": error,
                        "method": "supervisor",
                        "message": "Failed to start process",
                    })),
                );
                self.emit(SupervisorEvent::StartFailed {
                    node: node.name.clone(),
                    error,
                });
            }
        }
    }

    async fn reconcile(&mut self, active: &HashSet<u64>) {
        let gone: Vec<u64> = self
            .processes
            .keys()
            .filter(|id| !active.contains(id))
            .copied()
            .collect();

        for id in gone {
            log::info!("Node #{id} no longer active, stopping process");
            self.stop_process(id).await;
        }
    }

    async fn stop_process(&mut self, node_id: u64) {
        if let Some(mut handle) = self.processes.remove(&node_id) {
            if handle.is_running() {
                if let Err(e) = handle.stop(self.stop_grace).await {
                    log::error!("Failed to stop wallet-rpc for node #{node_id}: {e}");
                }
            }
            self.emit(SupervisorEvent::ProcessStopped { node_id });
        }

        if let Err(e) = self
            .registry
            .update(node_id, NodeUpdate::default().pid(None))
        {
            self.emit(SupervisorEvent::WriteFailed {
                node: format!("#{node_id}"),
                error: e.to_string(),
            });
        }
    }

    fn write(&self, node: &Node, update: NodeUpdate) {
        if let Err(e) = self.registry.update(node.id, update) {
            self.emit(SupervisorEvent::WriteFailed {
                node: node.name.clone(),
                error: e.to_string(),
            });
        }
    }

    fn emit(&self, event: SupervisorEvent) {
        self.sink.emit(Utc::now(), event);
    }
}

/// Cancel `shutdown` on SIGINT or SIGTERM. The handler only flips the token.
pub fn install_signal_handlers(
    shutdown: CancellationToken,
    sink: Arc<dyn EventSink>,
) -> Result<()> {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{SignalKind, signal};

        let mut sigterm = signal(SignalKind::terminate()).map_err(|e| {
            anyhow::anyhow!(
                "Failed to register SIGTERM handler: {e}. Signal handling is required for daemon operation."
            )
        })?;
        let mut sigint = signal(SignalKind::interrupt()).map_err(|e| {
            anyhow::anyhow!(
                "Failed to register SIGINT handler: {e}. Signal handling is required for daemon operation."
            )
        })?;

        tokio::spawn(async move {
            let name = tokio::select! {
                _ = sigterm.recv() => "SIGTERM",
                _ = sigint.recv() => "SIGINT",
            };
            sink.emit(Utc::now(), SupervisorEvent::ShutdownRequested { signal: name });
            shutdown.cancel();
        });
    }

    #[cfg(not(unix))]
    {
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                sink.emit(
                    Utc::now(),
                    SupervisorEvent::ShutdownRequested { signal: "Ctrl+C" },
                );
                shutdown.cancel();
            }
        });
    }

    Ok(())
}
