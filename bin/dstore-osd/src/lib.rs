//! DStore OSD - chunk storage daemon
//!
//! Stores chunk blobs on the local filesystem, serves the OSD wire
//! commands and heartbeats to the coordinator.

pub mod heartbeat;
pub mod server;
pub mod store;

pub use heartbeat::heartbeat_loop;
pub use server::OsdServer;
pub use store::ChunkStore;
