use serde::{Deserialize, Serialize};
use serde_json::Value;

/// One `monero-wallet-rpc` deployment as stored in the node registry.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Node {
    pub id: u64,
    pub name: String,
    pub host: String,
    pub port: u16,
    #[serde(default)]
    pub username: Option<String>,
    #[serde(default)]
    pub password: Option<String>,
    /// Address of the backing monerod. Set means the wallet-rpc is ours to run.
    #[serde(default)]
    pub daemon: Option<String>,
    #[serde(default)]
    pub pid: Option<u32>,
    #[serde(default = "default_true")]
    pub available: bool,
    #[serde(default)]
    pub worked: bool,
    #[serde(default)]
    pub worked_data: Option<Value>,
}

fn default_true() -> bool {
    true
}

impl Node {
    /// True when the wallet-rpc for this node is spawned by the local supervisor.
    pub fn is_local(&self) -> bool {
        self.daemon.as_deref().is_some_and(|d| !d.is_empty())
    }

    pub fn is_eligible(&self) -> bool {
        self.available && self.is_local()
    }

    /// Basic auth pair, only when both halves are present.
    pub fn credentials(&self) -> Option<(&str, &str)> {
        match (self.username.as_deref(), self.password.as_deref()) {
            (Some(user), Some(pass)) if !user.is_empty() && !pass.is_empty() => Some((user, pass)),
            _ => None,
        }
    }

    pub fn address(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

/// A wallet file opened on some node. Only the fields the lock manager needs.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Wallet {
    pub id: u64,
    pub name: String,
    pub node: Node,
}

/// Partial write of the observed-status fields of a [`Node`].
///
/// `pid: Some(None)` clears the stored pid, `pid: None` leaves it untouched.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct NodeUpdate {
    pub pid: Option<Option<u32>>,
    pub worked: Option<bool>,
    pub worked_data: Option<Value>,
}

impl NodeUpdate {
    pub fn pid(mut self, pid: Option<u32>) -> Self {
        self.pid = Some(pid);
        self
    }

    pub fn worked(mut self, worked: bool) -> Self {
        self.worked = Some(worked);
        self
    }

    pub fn worked_data(mut self, data: Value) -> Self {
        self.worked_data = Some(data);
        self
    }

    pub fn apply(&self, node: &mut Node) {
        if let Some(pid) = self.pid {
            node.pid = pid;
        }
        if let Some(worked) = self.worked {
            node.worked = worked;
        }
        if let Some(data) = &self.worked_data {
            node.worked_data = Some(data.clone());
        }
    }
}

#[cfg(test)]
pub(crate) fn fixture(id: u64, port: u16) -> Node {
    Node {
        id,
        name: format!("node-{id}"),
        host: "127.0.0.1".to_string(),
        port,
        username: None,
        password: None,
        daemon: Some("127.0.0.1:18081".to_string()),
        pid: None,
        available: true,
        worked: false,
        worked_data: None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn local_iff_daemon_is_set() {
        let mut node = fixture(1, 18082);
        assert!(node.is_local());

        node.daemon = Some(String::new());
        assert!(!node.is_local());

        node.daemon = None;
        assert!(!node.is_local());
    }

    #[test]
    fn eligibility_needs_available_and_daemon() {
        let mut node = fixture(1, 18082);
        assert!(node.is_eligible());

        node.available = false;
        assert!(!node.is_eligible());

        node.available = true;
        node.daemon = None;
        assert!(!node.is_eligible());
    }

    #[test]
    fn credentials_require_both_halves() {
        let mut node = fixture(1, 18082);
        node.username = Some("rpc".into());
        assert_eq!(node.credentials(), None);

        node.password = Some("secret".into());
        assert_eq!(node.credentials(), Some(("rpc", "secret")));
    }

    #[test]
    fn update_only_touches_given_fields() {
        let mut node = fixture(1, 18082);
        node.pid = Some(42);
        node.worked = true;

        NodeUpdate::default().worked(false).apply(&mut node);
        assert_eq!(node.pid, Some(42));
        assert!(!node.worked);

        NodeUpdate::default().pid(None).apply(&mut node);
        assert_eq!(node.pid, None);
    }

    #[test]
    fn deserializes_with_defaults() {
        let node: Node = serde_json::from_str(
            r#"{"id":3,"name":"main","host":"127.0.0.1","port":18083,"daemon":"node.xmr:18081"}"#,
        )
        .unwrap();
        assert!(node.available);
        assert!(!node.worked);
        assert_eq!(node.pid, None);
    }
}
