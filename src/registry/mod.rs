//! Node discovery
//!
//! Tracks which gateway instances are alive and which role each serves.

mod events;
mod node_registry;

pub use events::RegistryEvent;
pub use node_registry::{NodeEntry, NodeRegistry};
