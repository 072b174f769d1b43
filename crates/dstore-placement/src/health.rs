//! OSD health state machine

use derive_more::Display;
use dstore_common::{OsdId, ReplicationConfig};
use std::time::{Duration, Instant};

/// Liveness of an OSD as seen by the coordinator
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Display)]
pub enum HealthStatus {
    #[display("UP")]
    Up,
    #[display("SUSPECTED")]
    Suspected,
    #[display("DOWN")]
    Down,
}

impl HealthStatus {
    /// UP and SUSPECTED OSDs still serve reads and count as replicas
    #[must_use]
    pub const fn is_alive(self) -> bool {
        matches!(self, Self::Up | Self::Suspected)
    }
}

/// Silence thresholds of the state machine
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct HealthThresholds {
    pub suspect_after: Duration,
    pub down_after: Duration,
    /// Expected heartbeat period, used to count missed beats
    pub heartbeat_interval: Duration,
}

impl Default for HealthThresholds {
    fn default() -> Self {
        Self::from_config(&ReplicationConfig::default())
    }
}

impl HealthThresholds {
    /// OSDs are expected to beat at the period the coordinator evaluates at
    #[must_use]
    pub const fn from_config(config: &ReplicationConfig) -> Self {
        Self {
            suspect_after: config.suspect_after(),
            down_after: config.down_after(),
            heartbeat_interval: config.health_check_interval(),
        }
    }
}

/// Status of an OSD last heard from at `last_heartbeat`, observed at `now`
#[must_use]
pub fn evaluate(
    now: Instant,
    last_heartbeat: Option<Instant>,
    thresholds: &HealthThresholds,
) -> HealthStatus {
    let Some(last) = last_heartbeat else {
        return HealthStatus::Down;
    };
    let silence = now.saturating_duration_since(last);
    if silence >= thresholds.down_after {
        HealthStatus::Down
    } else if silence >= thresholds.suspect_after {
        HealthStatus::Suspected
    } else {
        HealthStatus::Up
    }
}

/// A status change produced by an evaluation pass
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Transition {
    pub osd_id: OsdId,
    pub from: HealthStatus,
    pub to: HealthStatus,
    pub silence: Option<Duration>,
}

impl Transition {
    /// An alive OSD was declared dead
    #[must_use]
    pub const fn is_failure(&self) -> bool {
        self.from.is_alive() && matches!(self.to, HealthStatus::Down)
    }
}

/// Health record of one OSD
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct OsdHealth {
    pub osd_id: OsdId,
    pub status: HealthStatus,
    pub last_heartbeat: Option<Instant>,
    pub missed_beats: u64,
    /// Number of chunk replicas placed on this OSD
    pub chunk_count: u64,
}

impl OsdHealth {
    /// A freshly known OSD starts DOWN until its first heartbeat
    #[must_use]
    pub const fn new(osd_id: OsdId) -> Self {
        Self {
            osd_id,
            status: HealthStatus::Down,
            last_heartbeat: None,
            missed_beats: 0,
            chunk_count: 0,
        }
    }

    /// Time since the last heartbeat
    #[must_use]
    pub fn silence(&self, now: Instant) -> Option<Duration> {
        self.last_heartbeat
            .map(|last| now.saturating_duration_since(last))
    }

    /// Record a heartbeat received at `at`, returning the previous status
    pub fn record_heartbeat(&mut self, at: Instant) -> HealthStatus {
        let previous = self.status;
        self.last_heartbeat = Some(at);
        self.missed_beats = 0;
        self.status = HealthStatus::Up;
        previous
    }

    /// Re-evaluate at `now`; returns the transition if the status changed
    pub fn evaluate(&mut self, now: Instant, thresholds: &HealthThresholds) -> Option<Transition> {
        let silence = self.silence(now);
        self.missed_beats = match silence {
            Some(silence) if !thresholds.heartbeat_interval.is_zero() => {
                u64::try_from(silence.as_millis() / thresholds.heartbeat_interval.as_millis())
                    .unwrap_or(u64::MAX)
            }
            _ => 0,
        };

        let next = evaluate(now, self.last_heartbeat, thresholds);
        if next == self.status {
            return None;
        }
        let from = std::mem::replace(&mut self.status, next);
        Some(Transition {
            osd_id: self.osd_id.clone(),
            from,
            to: next,
            silence,
        })
    }
}
