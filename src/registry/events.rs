//! Registry Events
//!
//! Membership changes broadcast by the node registry.

use serde::{Deserialize, Serialize};

/// Events emitted by the node registry
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum RegistryEvent {
    /// A node joined
    NodeRegistered {
        node_id: String,
        role: String,
        host: String,
    },

    /// A known node re-registered with new details
    NodeUpdated { node_id: String },

    /// A node left on request
    NodeUnregistered { node_id: String },

    /// A node was dropped after missing heartbeats
    NodeExpired { node_id: String },
}

impl RegistryEvent {
    /// Get the node ID associated with this event
    pub fn node_id(&self) -> &str {
        match self {
            RegistryEvent::NodeRegistered { node_id, .. } => node_id,
            RegistryEvent::NodeUpdated { node_id } => node_id,
            RegistryEvent::NodeUnregistered { node_id } => node_id,
            RegistryEvent::NodeExpired { node_id } => node_id,
        }
    }

    /// Whether the node is no longer a member after this event
    pub fn is_departure(&self) -> bool {
        matches!(
            self,
            RegistryEvent::NodeUnregistered { .. } | RegistryEvent::NodeExpired { .. }
        )
    }
}
