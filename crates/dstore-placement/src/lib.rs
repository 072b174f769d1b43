//! DStore Placement - health state machine and replica placement
//!
//! [`health`] turns heartbeat timestamps into UP / SUSPECTED / DOWN with a
//! pure evaluation function. [`policy`] ranks OSDs by health and load to
//! pick targets for new chunks and for repairs.
//!
//! # Example
//! ```ignore
//! use dstore_placement::{Candidate, PlacementPolicy};
//!
//! let policy = PlacementPolicy::new(3);
//! let targets = policy.place_chunk(&candidates);
//! ```

pub mod health;
pub mod policy;

pub use health::{evaluate, HealthStatus, HealthThresholds, OsdHealth, Transition};
pub use policy::{Candidate, PlacementPolicy};
