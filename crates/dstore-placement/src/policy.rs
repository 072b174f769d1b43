//! Placement policy implementation
//!
//! Placement is availability- and load-driven: UP OSDs with the fewest
//! chunks come first, SUSPECTED OSDs only pad the selection when there are
//! not enough UP ones, and DOWN OSDs are never chosen. Returning fewer
//! targets than requested is allowed; the repair loop fills the gap later.

use crate::health::HealthStatus;
use dstore_common::OsdId;

/// An OSD considered for placement
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Candidate {
    pub osd_id: OsdId,
    pub status: HealthStatus,
    pub chunk_count: u64,
}

impl Candidate {
    #[must_use]
    pub const fn new(osd_id: OsdId, status: HealthStatus, chunk_count: u64) -> Self {
        Self {
            osd_id,
            status,
            chunk_count,
        }
    }
}

/// Placement policy for chunk replicas
#[derive(Clone, Copy, Debug)]
pub struct PlacementPolicy {
    replication_factor: usize,
}

impl PlacementPolicy {
    /// Create a new placement policy
    #[must_use]
    pub const fn new(replication_factor: usize) -> Self {
        Self { replication_factor }
    }

    #[must_use]
    pub const fn replication_factor(&self) -> usize {
        self.replication_factor
    }

    /// Targets for a new chunk
    #[must_use]
    pub fn place_chunk(&self, candidates: &[Candidate]) -> Vec<OsdId> {
        let mut targets = rank(candidates, &[]);
        targets.truncate(self.replication_factor);
        targets
    }

    /// Up to `needed` targets for a repair, never one of `holders`
    #[must_use]
    pub fn place_repair(
        &self,
        candidates: &[Candidate],
        holders: &[OsdId],
        needed: usize,
    ) -> Vec<OsdId> {
        let mut targets = rank(candidates, holders);
        targets.truncate(needed);
        targets
    }
}

/// Alive candidates not in `exclude`: UP first, then SUSPECTED, each by
/// ascending chunk count with ties broken by id.
fn rank(candidates: &[Candidate], exclude: &[OsdId]) -> Vec<OsdId> {
    let mut eligible: Vec<&Candidate> = candidates
        .iter()
        .filter(|c| c.status.is_alive() && !exclude.contains(&c.osd_id))
        .collect();
    eligible.sort_by(|a, b| {
        tier(a.status)
            .cmp(&tier(b.status))
            .then(a.chunk_count.cmp(&b.chunk_count))
            .then_with(|| a.osd_id.cmp(&b.osd_id))
    });

    let mut ranked: Vec<OsdId> = Vec::with_capacity(eligible.len());
    for candidate in eligible {
        if !ranked.contains(&candidate.osd_id) {
            ranked.push(candidate.osd_id.clone());
        }
    }
    ranked
}

const fn tier(status: HealthStatus) -> u8 {
    match status {
        HealthStatus::Up => 0,
        HealthStatus::Suspected => 1,
        HealthStatus::Down => 2,
    }
}
