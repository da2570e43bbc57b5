//! API Module
//!
//! HTTP surface of the gateway: the REST router and the server that runs it.

pub mod rest;
pub mod server;

pub use rest::*;
pub use server::*;
