//! Domain layer - Core types and port definitions
//!
//! This module defines the data model and the traits (ports) that storage
//! backends and collaborators implement.

pub mod path;
pub mod ports;

pub use path::NamespacePath;
pub use ports::*;
