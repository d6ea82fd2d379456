//! Node registry: where node records live and where observed status is written back.

use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use crate::error::{Error, Result};
use crate::node::{Node, NodeUpdate};

/// Store of [`Node`] records consumed by the supervisor and status queries.
///
/// Writes are field-wise and last-write-wins.
pub trait NodeRegistry: Send + Sync {
    fn all(&self) -> Result<Vec<Node>>;

    /// Nodes with `available = true` and a daemon address, in registry order.
    fn eligible(&self) -> Result<Vec<Node>> {
        Ok(self.all()?.into_iter().filter(Node::is_eligible).collect())
    }

    fn find_by_id(&self, id: u64) -> Result<Option<Node>> {
        Ok(self.all()?.into_iter().find(|n| n.id == id))
    }

    fn find_by_name(&self, name: &str) -> Result<Option<Node>> {
        Ok(self.all()?.into_iter().find(|n| n.name == name))
    }

    fn update(&self, id: u64, update: NodeUpdate) -> Result<()>;
}

/// Registry persisted as a JSON array of nodes.
///
/// The file is re-read on every query so edits made by other tools show up on
/// the next supervisor tick.
pub struct JsonRegistry {
    path: PathBuf,
}

impl JsonRegistry {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn load(&self) -> Result<Vec<Node>> {
        let raw = fs::read_to_string(&self.path).map_err(|e| {
            Error::Registry(format!("failed to read {}: {e}", self.path.display()))
        })?;
        if raw.trim().is_empty() {
            return Ok(Vec::new());
        }
        serde_json::from_str(&raw)
            .map_err(|e| Error::Registry(format!("failed to parse {}: {e}", self.path.display())))
    }

    fn store(&self, nodes: &[Node]) -> Result<()> {
        let dir = self
            .path
            .parent()
            .filter(|p| !p.as_os_str().is_empty())
            .unwrap_or_else(|| Path::new("."));
        let mut tmp = tempfile::NamedTempFile::new_in(dir)?;
        serde_json::to_writer_pretty(&mut tmp, nodes)?;
        tmp.write_all(b"\n")?;
        tmp.persist(&self.path).map_err(|e| {
            Error::Registry(format!("failed to write {}: {}", self.path.display(), e.error))
        })?;
        Ok(())
    }
}

impl NodeRegistry for JsonRegistry {
    fn all(&self) -> Result<Vec<Node>> {
        self.load()
    }

    fn update(&self, id: u64, update: NodeUpdate) -> Result<()> {
        let mut nodes = self.load()?;
        let node = nodes
            .iter_mut()
            .find(|n| n.id == id)
            .ok_or_else(|| Error::Registry(format!("node #{id} not found")))?;
        update.apply(node);
        self.store(&nodes)
    }
}

/// In-process registry. Keeps every applied update for inspection.
#[derive(Default)]
pub struct MemoryRegistry {
    nodes: Mutex<Vec<Node>>,
    history: Mutex<Vec<(u64, NodeUpdate)>>,
}

impl MemoryRegistry {
    pub fn new(nodes: Vec<Node>) -> Self {
        Self {
            nodes: Mutex::new(nodes),
            history: Mutex::default(),
        }
    }

    /// Replace or insert a node record, as an external management tool would.
    pub fn upsert(&self, node: Node) {
        let mut nodes = self.nodes.lock().unwrap_or_else(|e| e.into_inner());
        match nodes.iter_mut().find(|n| n.id == node.id) {
            Some(existing) => *existing = node,
            None => nodes.push(node),
        }
    }

    pub fn history(&self) -> Vec<(u64, NodeUpdate)> {
        self.history.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }
}

impl NodeRegistry for MemoryRegistry {
    fn all(&self) -> Result<Vec<Node>> {
        Ok(self.nodes.lock().unwrap_or_else(|e| e.into_inner()).clone())
    }

    fn update(&self, id: u64, update: NodeUpdate) -> Result<()> {
        let mut nodes = self.nodes.lock().unwrap_or_else(|e| e.into_inner());
        let node = nodes
            .iter_mut()
            .find(|n| n.id == id)
            .ok_or_else(|| Error::Registry(format!("node #{id} not found")))?;
        update.apply(node);
        self.history
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push((id, update));
        Ok(())
    }
}
