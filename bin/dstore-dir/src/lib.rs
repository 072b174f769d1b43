//! DStore DIR - the coordinator
//!
//! Holds the file -> chunk -> replica table, serves client requests over
//! the DIR protocol, tracks OSD liveness from heartbeats and repairs
//! replication when an OSD is lost.

pub mod coordinator;
pub mod metrics;
pub mod replication;
pub mod server;
pub mod state;

pub use coordinator::{DirCoordinator, OsdSnapshot, Upload};
pub use replication::{RepairFailure, RepairOutcome, RepairTask, ReplicationManager};
pub use server::DirServer;
pub use state::ClusterState;

#[cfg(test)]
mod tests;
