//! DStore Common - Shared types and utilities
//!
//! This crate provides the identifiers, file metadata model, error
//! definitions and configuration structures used by the coordinator,
//! the storage daemons and the clients.

pub mod config;
pub mod error;
pub mod shutdown;
pub mod types;

pub use config::{HeartbeatConfig, NetworkConfig, ReplicationConfig};
pub use error::{Error, Result};
pub use shutdown::{Shutdown, ShutdownSignal};
pub use types::*;
