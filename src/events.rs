//! Supervisor events and the sink they are reported to.

use chrono::{DateTime, Utc};
use log::{debug, error, info, warn};

/// Something the supervisor did or observed.
#[derive(Debug, Clone, PartialEq)]
pub enum SupervisorEvent {
    Starting,
    ShutdownRequested { signal: &'static str },
    Stopped,
    HealthChecked {
        node: String,
        healthy: bool,
        message: String,
    },
    /// Node left alone this tick.
    Skipped { node: String, reason: SkipReason },
    Started { node: String, pid: Option<u32> },
    StartFailed { node: String, error: String },
    /// A recorded pid from an earlier generation was terminated.
    Killed { node: String, pid: u32 },
    ProcessStopped { node_id: u64 },
    RegistryFailed { error: String },
    WriteFailed { node: String, error: String },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SkipReason {
    Healthy,
    PortOccupied,
}

/// Receiver for [`SupervisorEvent`]s, injected when the supervisor is built.
pub trait EventSink: Send + Sync {
    fn emit(&self, ts: DateTime<Utc>, event: SupervisorEvent);
}

/// Default sink: everything goes to the `log` facade.
#[derive(Debug, Default, Clone, Copy)]
pub struct LogSink;

impl EventSink for LogSink {
    fn emit(&self, ts: DateTime<Utc>, event: SupervisorEvent) {
        match event {
            SupervisorEvent::Starting => info!("Starting wallet-rpc supervisor (ts: {ts})"),
            SupervisorEvent::ShutdownRequested { signal } => {
                info!("{signal} received – shutting down gracefully")
            }
            SupervisorEvent::Stopped => info!("wallet-rpc supervisor stopped (ts: {ts})"),
            SupervisorEvent::HealthChecked {
                node,
                healthy: true,
                message,
            } => debug!("{node} health check OK: {message}"),
            SupervisorEvent::HealthChecked {
                node,
                healthy: false,
                message,
            } => error!("{node} health check FAILED: {message}"),
            SupervisorEvent::Skipped { node, reason } => match reason {
                SkipReason::Healthy => debug!("{node} is running, nothing to do"),
                SkipReason::PortOccupied => {
                    warn!("{node}: port already in use by another process, not starting")
                }
            },
            SupervisorEvent::Started { node, pid } => {
                info!("Started wallet-rpc for {node} (pid: {pid:?})")
            }
            SupervisorEvent::StartFailed { node, error } => {
                error!("Failed to start wallet-rpc for {node}: {error}")
            }
            SupervisorEvent::Killed { node, pid } => {
                warn!("Killed stale pid {pid} recorded for {node}")
            }
            SupervisorEvent::ProcessStopped { node_id } => {
                info!("Stopped wallet-rpc for node #{node_id}")
            }
            SupervisorEvent::RegistryFailed { error } => {
                error!("Node registry unavailable, skipping tick: {error}")
            }
            SupervisorEvent::WriteFailed { node, error } => {
                error!("Failed to persist status for {node}: {error}")
            }
        }
    }
}
