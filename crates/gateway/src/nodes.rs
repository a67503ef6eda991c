use std::collections::HashMap;

use serde::Serialize;

/// A client that connected in `node` mode (companion app or device host).
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct NodeSession {
    pub node_id: String,
    pub conn_id: String,
    pub display_name: Option<String>,
    pub platform: Option<String>,
    pub version: Option<String>,
    pub remote_ip: Option<String>,
    pub connected_at: i64,
}

/// Registry of connected nodes.
pub struct NodeRegistry {
    /// node_id → NodeSession
    nodes: HashMap<String, NodeSession>,
    /// conn_id → node_id (reverse lookup for cleanup on disconnect)
    by_conn: HashMap<String, String>,
}

impl Default for NodeRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl NodeRegistry {
    pub fn new() -> Self {
        Self {
            nodes: HashMap::new(),
            by_conn: HashMap::new(),
        }
    }

    /// A node reconnecting under the same id replaces its old connection.
    pub fn register(&mut self, session: NodeSession) {
        if let Some(old) = self.nodes.get(&session.node_id) {
            self.by_conn.remove(&old.conn_id);
        }
        self.by_conn
            .insert(session.conn_id.clone(), session.node_id.clone());
        self.nodes.insert(session.node_id.clone(), session);
    }

    pub fn unregister_by_conn(&mut self, conn_id: &str) -> Option<NodeSession> {
        let node_id = self.by_conn.remove(conn_id)?;
        self.nodes.remove(&node_id)
    }

    pub fn get(&self, node_id: &str) -> Option<&NodeSession> {
        self.nodes.get(node_id)
    }

    pub fn list(&self) -> Vec<NodeSession> {
        let mut list: Vec<_> = self.nodes.values().cloned().collect();
        list.sort_by(|a, b| a.node_id.cmp(&b.node_id));
        list
    }

    pub fn count(&self) -> usize {
        self.nodes.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn node(id: &str, conn: &str) -> NodeSession {
        NodeSession {
            node_id: id.into(),
            conn_id: conn.into(),
            display_name: None,
            platform: Some("macos".into()),
            version: None,
            remote_ip: None,
            connected_at: 0,
        }
    }

    #[test]
    fn reconnect_replaces_connection() {
        let mut reg = NodeRegistry::new();
        reg.register(node("mac", "c1"));
        reg.register(node("mac", "c2"));
        assert_eq!(reg.count(), 1);
        assert!(reg.unregister_by_conn("c1").is_none());
        assert_eq!(reg.get("mac").map(|n| n.conn_id.as_str()), Some("c2"));
        assert!(reg.unregister_by_conn("c2").is_some());
        assert_eq!(reg.count(), 0);
    }
}
