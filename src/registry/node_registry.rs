//! Node Registry
//!
//! Ordered, live membership of gateway instances. Nodes keep the position
//! of their first registration; re-registering the same id updates the
//! entry in place. Liveness is heartbeat based: entries whose last heartbeat
//! is older than the configured age are expired.

use crate::domain::ports::{RegistryDriver, RegistryNode};
use crate::error::{Error, Result};
use crate::registry::RegistryEvent;
use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use indexmap::IndexMap;
use parking_lot::RwLock;
use std::sync::Arc;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tracing::{debug, info};

/// Capacity of the event channel
const EVENT_CHANNEL_CAPACITY: usize = 1024;

// =============================================================================
// Node Entry
// =============================================================================

/// A registered node with its liveness bookkeeping
#[derive(Debug, Clone)]
pub struct NodeEntry {
    pub node: RegistryNode,
    /// First registration time
    pub registered_at: DateTime<Utc>,
    /// Last heartbeat timestamp
    pub last_heartbeat: DateTime<Utc>,
}

impl NodeEntry {
    fn new(node: RegistryNode) -> Self {
        let now = Utc::now();
        Self {
            node,
            registered_at: now,
            last_heartbeat: now,
        }
    }

    /// Check if the node missed heartbeats for longer than `max_age`
    pub fn is_stale(&self, now: DateTime<Utc>, max_age: Duration) -> bool {
        now.signed_duration_since(self.last_heartbeat) > max_age
    }
}

// =============================================================================
// Node Registry
// =============================================================================

/// In-memory registry of live nodes
pub struct NodeRegistry {
    nodes: RwLock<IndexMap<String, NodeEntry>>,
    /// Event broadcaster
    event_sender: broadcast::Sender<RegistryEvent>,
}

impl NodeRegistry {
    /// Create a new node registry
    pub fn new() -> Arc<Self> {
        let (event_sender, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        Arc::new(Self {
            nodes: RwLock::new(IndexMap::new()),
            event_sender,
        })
    }

    /// Get an event receiver
    pub fn subscribe(&self) -> broadcast::Receiver<RegistryEvent> {
        self.event_sender.subscribe()
    }

    /// Register a node, or update it in place when the id is known.
    ///
    /// Also counts as a heartbeat.
    pub fn register(&self, node: RegistryNode) -> Result<()> {
        if node.id.is_empty() || node.role.is_empty() {
            return Err(Error::BadInputData("node id and role are required".into()));
        }

        let event = {
            let mut nodes = self.nodes.write();
            match nodes.get_mut(&node.id) {
                Some(entry) => {
                    entry.node = node.clone();
                    entry.last_heartbeat = Utc::now();
                    RegistryEvent::NodeUpdated { node_id: node.id }
                }
                None => {
                    let event = RegistryEvent::NodeRegistered {
                        node_id: node.id.clone(),
                        role: node.role.clone(),
                        host: node.host.clone(),
                    };
                    nodes.insert(node.id.clone(), NodeEntry::new(node));
                    event
                }
            }
        };

        debug!(node_id = %event.node_id(), "Node registered");
        let _ = self.event_sender.send(event);
        Ok(())
    }

    /// Remove a node
    pub fn unregister(&self, node_id: &str) -> Result<()> {
        if self.nodes.write().shift_remove(node_id).is_none() {
            return Err(Error::NotFound(format!("node {}", node_id)));
        }
        info!(node_id, "Node unregistered");
        let _ = self.event_sender.send(RegistryEvent::NodeUnregistered {
            node_id: node_id.to_string(),
        });
        Ok(())
    }

    /// Record a heartbeat from a node
    pub fn heartbeat(&self, node_id: &str) -> Result<()> {
        let mut nodes = self.nodes.write();
        let entry = nodes
            .get_mut(node_id)
            .ok_or_else(|| Error::NotFound(format!("node {}", node_id)))?;
        entry.last_heartbeat = Utc::now();
        Ok(())
    }

    /// Nodes advertising `role`, in registration order
    pub fn nodes_for_role(&self, role: &str) -> Vec<RegistryNode> {
        self.nodes
            .read()
            .values()
            .filter(|entry| entry.node.role == role)
            .map(|entry| entry.node.clone())
            .collect()
    }

    pub fn get(&self, node_id: &str) -> Option<NodeEntry> {
        self.nodes.read().get(node_id).cloned()
    }

    pub fn len(&self) -> usize {
        self.nodes.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Remove nodes whose last heartbeat is older than `max_age`
    pub fn expire_stale(&self, max_age: Duration) -> Vec<String> {
        let now = Utc::now();
        let mut expired = Vec::new();
        self.nodes.write().retain(|id, entry| {
            if entry.is_stale(now, max_age) {
                expired.push(id.clone());
                false
            } else {
                true
            }
        });

        for node_id in &expired {
            info!(node_id = %node_id, "Node expired after missing heartbeats");
            let _ = self.event_sender.send(RegistryEvent::NodeExpired {
                node_id: node_id.clone(),
            });
        }
        expired
    }

    /// Keep `local` alive and expire stale peers until shutdown
    pub fn spawn_liveness(
        self: Arc<Self>,
        local: String,
        interval: std::time::Duration,
        max_age: Duration,
        mut shutdown: broadcast::Receiver<()>,
    ) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval.max(std::time::Duration::from_millis(10)));
            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        let _ = self.heartbeat(&local);
                        self.expire_stale(max_age);
                    }
                    _ = shutdown.recv() => {
                        debug!("Registry liveness task stopping");
                        break;
                    }
                }
            }
        })
    }
}

#[async_trait]
impl RegistryDriver for NodeRegistry {
    async fn register(&self, node: RegistryNode) -> Result<()> {
        NodeRegistry::register(self, node)
    }

    async fn unregister(&self, id: &str) -> Result<()> {
        NodeRegistry::unregister(self, id)
    }

    async fn nodes_for_role(&self, role: &str) -> Result<Vec<RegistryNode>> {
        Ok(NodeRegistry::nodes_for_role(self, role))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::ports::RegistryDriverRef;
    use crate::error::ErrorCode;

    fn node(id: &str, role: &str) -> RegistryNode {
        RegistryNode {
            id: id.to_string(),
            role: role.to_string(),
            system_version: "0.2.0".to_string(),
            host: format!("{}.local:8090", id),
        }
    }

    #[test]
    fn test_register_keeps_first_position() {
        let registry = NodeRegistry::new();
        registry.register(node("gw-1", "gateway")).unwrap();
        registry.register(node("gw-2", "gateway")).unwrap();
        registry.register(node("ix-1", "indexer")).unwrap();

        let mut moved = node("gw-1", "gateway");
        moved.host = "elsewhere:8090".to_string();
        registry.register(moved).unwrap();

        let gateways = registry.nodes_for_role("gateway");
        let ids: Vec<&str> = gateways.iter().map(|n| n.id.as_str()).collect();
        assert_eq!(ids, vec!["gw-1", "gw-2"]);
        assert_eq!(gateways[0].host, "elsewhere:8090");
        assert_eq!(registry.len(), 3);
    }

    #[test]
    fn test_unregister() {
        let registry = NodeRegistry::new();
        registry.register(node("gw-1", "gateway")).unwrap();
        registry.register(node("gw-2", "gateway")).unwrap();
        registry.register(node("gw-3", "gateway")).unwrap();
        registry.unregister("gw-2").unwrap();

        let ids: Vec<String> = registry
            .nodes_for_role("gateway")
            .into_iter()
            .map(|n| n.id)
            .collect();
        assert_eq!(ids, vec!["gw-1", "gw-3"]);
        assert_eq!(
            registry.unregister("gw-2").unwrap_err().code(),
            ErrorCode::NotFound
        );
    }

    #[test]
    fn test_invalid_node_rejected() {
        let registry = NodeRegistry::new();
        assert!(registry.register(node("", "gateway")).is_err());
        assert!(registry.register(node("gw-1", "")).is_err());
        assert!(registry.is_empty());
    }

    #[test]
    fn test_expire_stale() {
        let registry = NodeRegistry::new();
        registry.register(node("gw-1", "gateway")).unwrap();
        registry.register(node("gw-2", "gateway")).unwrap();

        assert!(registry.expire_stale(Duration::hours(1)).is_empty());
        {
            let mut nodes = registry.nodes.write();
            nodes.get_mut("gw-1").unwrap().last_heartbeat = Utc::now() - Duration::hours(2);
        }
        assert_eq!(registry.expire_stale(Duration::hours(1)), vec!["gw-1".to_string()]);
        assert!(registry.get("gw-1").is_none());
        assert!(registry.heartbeat("gw-1").is_err());
        assert!(registry.heartbeat("gw-2").is_ok());
    }

    #[tokio::test]
    async fn test_events() {
        let registry = NodeRegistry::new();
        let mut events = registry.subscribe();

        registry.register(node("gw-1", "gateway")).unwrap();
        registry.register(node("gw-1", "gateway")).unwrap();
        registry.unregister("gw-1").unwrap();

        assert!(matches!(
            events.recv().await.unwrap(),
            RegistryEvent::NodeRegistered { .. }
        ));
        assert_eq!(
            events.recv().await.unwrap(),
            RegistryEvent::NodeUpdated { node_id: "gw-1".into() }
        );
        assert!(events.recv().await.unwrap().is_departure());
    }

    #[tokio::test]
    async fn test_driver_trait() {
        let driver: RegistryDriverRef = NodeRegistry::new();
        driver.register(node("gw-1", "gateway")).await.unwrap();
        assert_eq!(driver.nodes_for_role("gateway").await.unwrap().len(), 1);
        assert!(driver.nodes_for_role("indexer").await.unwrap().is_empty());
        driver.unregister("gw-1").await.unwrap();
    }
}
