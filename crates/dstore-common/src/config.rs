//! Configuration types for DStore
//!
//! These structures are embedded in the TOML files read by the binaries.
//! Every field has a default so a section may be partially specified or
//! omitted entirely.

use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Chunking, replication and repair settings of the coordinator
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ReplicationConfig {
    /// Target number of OSDs holding each chunk
    pub replication_factor: usize,
    /// Size of every chunk except possibly the last one
    pub chunk_size: usize,
    /// Period of the health evaluation pass
    pub health_check_interval_ms: u64,
    /// Silence after which an OSD becomes SUSPECTED
    pub suspect_after_ms: u64,
    /// Silence after which an OSD becomes DOWN
    pub down_after_ms: u64,
    /// How long the repair consumer waits on an empty queue
    pub repair_poll_timeout_ms: u64,
    /// Period of the full repair scan
    pub repair_scan_interval_ms: u64,
    /// Outbound connect timeout towards OSDs
    pub connect_timeout_ms: u64,
}

impl Default for ReplicationConfig {
    fn default() -> Self {
        Self {
            replication_factor: 3,
            chunk_size: 1_000_000,
            health_check_interval_ms: 5_000,
            suspect_after_ms: 8_000,
            down_after_ms: 15_000,
            repair_poll_timeout_ms: 10_000,
            repair_scan_interval_ms: 30_000,
            connect_timeout_ms: 3_000,
        }
    }
}

impl ReplicationConfig {
    #[must_use]
    pub const fn health_check_interval(&self) -> Duration {
        Duration::from_millis(self.health_check_interval_ms)
    }

    #[must_use]
    pub const fn suspect_after(&self) -> Duration {
        Duration::from_millis(self.suspect_after_ms)
    }

    #[must_use]
    pub const fn down_after(&self) -> Duration {
        Duration::from_millis(self.down_after_ms)
    }

    #[must_use]
    pub const fn repair_poll_timeout(&self) -> Duration {
        Duration::from_millis(self.repair_poll_timeout_ms)
    }

    #[must_use]
    pub const fn repair_scan_interval(&self) -> Duration {
        Duration::from_millis(self.repair_scan_interval_ms)
    }

    #[must_use]
    pub const fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }

    /// Check the values are usable
    pub fn validate(&self) -> crate::Result<()> {
        if self.replication_factor == 0 {
            return Err(crate::Error::Configuration(
                "replication_factor must be at least 1".into(),
            ));
        }
        if self.chunk_size == 0 || self.chunk_size > crate::MAX_FRAME_SIZE {
            return Err(crate::Error::Configuration(format!(
                "chunk_size must be between 1 and {} bytes, got {}",
                crate::MAX_FRAME_SIZE,
                self.chunk_size
            )));
        }
        for (name, value) in [
            ("health_check_interval_ms", self.health_check_interval_ms),
            ("repair_poll_timeout_ms", self.repair_poll_timeout_ms),
            ("repair_scan_interval_ms", self.repair_scan_interval_ms),
        ] {
            if value == 0 {
                return Err(crate::Error::Configuration(format!("{name} must be at least 1")));
            }
        }
        if self.suspect_after_ms > self.down_after_ms {
            return Err(crate::Error::Configuration(format!(
                "suspect_after_ms ({}) exceeds down_after_ms ({})",
                self.suspect_after_ms, self.down_after_ms
            )));
        }
        Ok(())
    }
}

/// Heartbeat schedule of an OSD
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct HeartbeatConfig {
    pub interval_ms: u64,
    pub initial_delay_ms: u64,
}

impl Default for HeartbeatConfig {
    fn default() -> Self {
        Self {
            interval_ms: 5_000,
            initial_delay_ms: 2_000,
        }
    }
}

impl HeartbeatConfig {
    #[must_use]
    pub const fn interval(&self) -> Duration {
        Duration::from_millis(self.interval_ms)
    }

    #[must_use]
    pub const fn initial_delay(&self) -> Duration {
        Duration::from_millis(self.initial_delay_ms)
    }

    /// Check the values are usable
    pub fn validate(&self) -> crate::Result<()> {
        if self.interval_ms == 0 {
            return Err(crate::Error::Configuration(
                "heartbeat interval_ms must be at least 1".into(),
            ));
        }
        Ok(())
    }
}

/// Addresses of the cluster endpoints
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct NetworkConfig {
    /// Address the DIR listens on
    pub dir_listen: String,
    /// Address OSDs and clients use to reach the DIR
    pub dir_endpoint: String,
    /// Host an OSD binds to
    pub osd_host: String,
    /// Port of the first OSD in a local cluster (`osd-9001`, `osd-9002`, ...)
    pub osd_base_port: u16,
}

impl Default for NetworkConfig {
    fn default() -> Self {
        Self {
            dir_listen: "0.0.0.0:7000".to_string(),
            dir_endpoint: "127.0.0.1:7000".to_string(),
            osd_host: "0.0.0.0".to_string(),
            osd_base_port: 9001,
        }
    }
}
