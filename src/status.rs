//! On-demand status queries: check one node or every eligible node and persist the verdicts.

use chrono::Utc;
use serde::Serialize;

use crate::error::Result;
use crate::health::{CheckMethod, HealthChecker, HealthVerdict};
use crate::node::{Node, NodeUpdate};
use crate::process::ProcessProbe;
use crate::registry::NodeRegistry;

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct NodeStatus {
    pub id: u64,
    pub name: String,
    pub status: bool,
    pub message: String,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct CheckStats {
    pub total: usize,
    pub working: usize,
    pub failed: usize,
    pub nodes: Vec<NodeStatus>,
}

impl CheckStats {
    pub fn all_healthy(&self) -> bool {
        self.failed == 0
    }
}

/// Look a node up by numeric id, falling back to its name.
pub fn find_node<R: NodeRegistry + ?Sized>(registry: &R, ident: &str) -> Result<Option<Node>> {
    if let Ok(id) = ident.parse::<u64>()
        && let Some(node) = registry.find_by_id(id)?
    {
        return Ok(Some(node));
    }
    registry.find_by_name(ident)
}

/// Run `method` against `node` and store the verdict on it.
pub async fn update_node_status<R, P>(
    registry: &R,
    checker: &HealthChecker<P>,
    node: &Node,
    method: CheckMethod,
) -> Result<HealthVerdict>
where
    R: NodeRegistry + ?Sized,
    P: ProcessProbe,
{
    let verdict = checker.check(node, method).await;
    registry.update(
        node.id,
        NodeUpdate::default()
            .worked(verdict.status)
            .worked_data(verdict.worked_data(Utc::now())),
    )?;
    Ok(verdict)
}

/// Resolve `ident` and check that one node. `None` when nothing matches.
pub async fn check_node<R, P>(
    registry: &R,
    checker: &HealthChecker<P>,
    ident: &str,
    method: CheckMethod,
) -> Result<Option<(Node, HealthVerdict)>>
where
    R: NodeRegistry + ?Sized,
    P: ProcessProbe,
{
    let Some(node) = find_node(registry, ident)? else {
        return Ok(None);
    };
    let verdict = update_node_status(registry, checker, &node, method).await?;
    Ok(Some((node, verdict)))
}

/// Check every eligible node in registry order. Unavailable nodes are not touched.
pub async fn check_all_nodes<R, P>(
    registry: &R,
    checker: &HealthChecker<P>,
    method: CheckMethod,
) -> Result<CheckStats>
where
    R: NodeRegistry + ?Sized,
    P: ProcessProbe,
{
    let nodes = registry.eligible()?;
    let mut stats = CheckStats {
        total: nodes.len(),
        ..CheckStats::default()
    };

    for node in &nodes {
        let verdict = update_node_status(registry, checker, node, method).await?;
        if verdict.status {
            stats.working += 1;
        } else {
            stats.failed += 1;
        }
        stats.nodes.push(NodeStatus {
            id: node.id,
            name: node.name.clone(),
            status: verdict.status,
            message: verdict.message().to_string(),
        });
    }

    Ok(stats)
}
