//! Particle identity roll call.
//!
//! A diagnostic scan checking that every identity in `0..expected`
//! appears exactly once in the node's particle range. It is only
//! meaningful for single-node runs whose identities are compact, i.e.
//! without open boundaries.
//!
//! The scanner remembers which identities it already complained
//! about, so an anomaly is logged once for the whole run no matter how
//! many roll calls observe it.

use std::collections::HashSet;

use hydra_arena::ParticleInfo;
use hydra_core::{DeviceIndex, ParticleId};
use tracing::{info, warn};

use crate::shared::DeviceLayout;

/// An identity found at two indices.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Duplicate {
    /// The repeated identity.
    pub id: ParticleId,
    /// Index of the first occurrence.
    pub first: usize,
    /// Index of the repeated occurrence.
    pub second: usize,
}

/// Anomalies found by one roll call.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct RollCallReport {
    /// Every repeated occurrence.
    pub duplicates: Vec<Duplicate>,
    /// Identities below the expected count that never appeared.
    pub missing: Vec<ParticleId>,
    /// Identities at or above the expected count, with their index.
    pub out_of_range: Vec<(ParticleId, usize)>,
    /// Anomalies not seen by any earlier roll call.
    pub new_anomalies: usize,
}

impl RollCallReport {
    /// Whether the particle set is exactly `0..expected`.
    pub fn is_clean(&self) -> bool {
        self.duplicates.is_empty() && self.missing.is_empty() && self.out_of_range.is_empty()
    }
}

/// Roll-call scanner with run-long memory of reported identities.
#[derive(Clone, Debug, Default)]
pub struct RollCall {
    seen: Vec<bool>,
    addrs: Vec<usize>,
    notified: Vec<bool>,
    notified_out_of_range: HashSet<ParticleId>,
    calls: u64,
}

impl RollCall {
    /// A scanner that has reported nothing yet.
    pub fn new() -> Self {
        Self::default()
    }

    /// Roll calls performed.
    pub fn calls(&self) -> u64 {
        self.calls
    }

    fn grow(&mut self, len: usize) {
        if self.seen.len() < len {
            self.seen.resize(len, false);
            self.addrs.resize(len, 0);
            self.notified.resize(len, false);
        }
    }

    /// Scans `info[layout.node_range()]` for identities `0..expected`.
    /// Logically deleted particles are ignored. Memory is bounded by
    /// `expected`; larger identities are reported, never indexed.
    pub fn check(
        &mut self,
        info: &[ParticleInfo],
        layout: &DeviceLayout,
        expected: usize,
    ) -> RollCallReport {
        self.calls += 1;
        let range = layout.node_range();
        let range = range.start.min(info.len())..range.end.min(info.len());
        self.grow(expected);
        self.seen.iter_mut().for_each(|s| *s = false);

        let mut report = RollCallReport::default();
        let mut warned_duplicate = false;
        let mut warned_out_of_range = false;
        for idx in range {
            let p = &info[idx];
            if p.is_deleted() {
                continue;
            }
            let id = p.id.0 as usize;
            if id >= expected {
                report.out_of_range.push((p.id, idx));
                if self.notified_out_of_range.insert(p.id) {
                    report.new_anomalies += 1;
                    if !warned_out_of_range {
                        warned_out_of_range = true;
                        warn!(
                            id = p.id.0,
                            index = idx,
                            expected,
                            "particle identity out of range"
                        );
                    }
                }
                continue;
            }
            if !self.seen[id] {
                self.seen[id] = true;
                self.addrs[id] = idx;
                continue;
            }
            let dup = Duplicate {
                id: p.id,
                first: self.addrs[id],
                second: idx,
            };
            report.duplicates.push(dup);
            if !self.notified[id] {
                self.notified[id] = true;
                report.new_anomalies += 1;
                if !warned_duplicate {
                    warned_duplicate = true;
                    warn!(
                        id = dup.id.0,
                        first = dup.first,
                        second = dup.second,
                        "duplicate particle identity"
                    );
                }
            }
        }

        let mut warned_missing = false;
        for id in 0..expected {
            if self.seen[id] {
                continue;
            }
            report.missing.push(ParticleId(id as u32));
            if !self.notified[id] {
                self.notified[id] = true;
                report.new_anomalies += 1;
                if !warned_missing {
                    warned_missing = true;
                    warn!(id, "missing particle identity");
                }
            }
        }

        if !report.is_clean() {
            warn!(
                duplicates = report.duplicates.len(),
                missing = report.missing.len(),
                out_of_range = report.out_of_range.len(),
                new = report.new_anomalies,
                "roll call found anomalies"
            );
            for d in 0..layout.counts.len() {
                let device = DeviceIndex(d as u8);
                let r = layout.device_range(device);
                let dups = report
                    .duplicates
                    .iter()
                    .filter(|dup| r.contains(&dup.second))
                    .count();
                info!(
                    device = d,
                    start = r.start,
                    count = r.len(),
                    duplicates = dups,
                    "roll call device recap"
                );
            }
        }
        report
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use smallvec::SmallVec;

    fn infos(ids: &[u32]) -> Vec<ParticleInfo> {
        ids.iter().map(|&i| ParticleInfo::fluid(ParticleId(i))).collect()
    }

    fn layout(counts: &[usize]) -> DeviceLayout {
        let mut starts = SmallVec::new();
        let mut at = 0;
        for &c in counts {
            starts.push(at);
            at += c;
        }
        DeviceLayout {
            starts,
            counts: SmallVec::from_slice(counts),
            node_counts: vec![at],
            total: at,
        }
    }

    #[test]
    fn permutation_is_clean() {
        let info = infos(&[3, 1, 0, 2, 4]);
        let report = RollCall::new().check(&info, &layout(&[2, 3]), 5);
        assert!(report.is_clean());
        assert_eq!(report.new_anomalies, 0);
    }

    #[test]
    fn finds_duplicates_and_missing() {
        let info = infos(&[0, 1, 1, 3]);
        let report = RollCall::new().check(&info, &layout(&[4]), 4);
        assert_eq!(
            report.duplicates,
            vec![Duplicate {
                id: ParticleId(1),
                first: 1,
                second: 2
            }]
        );
        assert_eq!(report.missing, vec![ParticleId(2)]);
        assert_eq!(report.new_anomalies, 2);
    }

    #[test]
    fn anomalies_are_new_only_once() {
        let mut rc = RollCall::new();
        let info = infos(&[0, 0, 2]);
        assert_eq!(rc.check(&info, &layout(&[3]), 3).new_anomalies, 2);
        let again = rc.check(&info, &layout(&[3]), 3);
        assert_eq!(again.duplicates.len(), 1);
        assert_eq!(again.missing.len(), 1);
        assert_eq!(again.new_anomalies, 0);
        assert_eq!(rc.calls(), 2);
    }

    #[test]
    fn deleted_particles_are_ignored() {
        let mut info = infos(&[0, 1, 1]);
        info[2].flags |= ParticleInfo::FLAG_DELETED;
        assert!(RollCall::new().check(&info, &layout(&[3]), 2).is_clean());
    }

    #[test]
    fn only_the_node_range_is_scanned() {
        let info = infos(&[9, 9, 0, 1]);
        let mut l = layout(&[2]);
        l.starts[0] = 2;
        assert!(RollCall::new().check(&info, &l, 2).is_clean());
    }

    #[test]
    fn huge_identities_are_reported_without_growing() {
        let mut rc = RollCall::new();
        let info = infos(&[0, u32::MAX - 1, 1]);
        let report = rc.check(&info, &layout(&[3]), 3);
        assert_eq!(report.out_of_range, vec![(ParticleId(u32::MAX - 1), 1)]);
        assert_eq!(report.missing, vec![ParticleId(2)]);
        assert_eq!(report.new_anomalies, 2);
        assert!(rc.seen.len() <= 3);
        assert_eq!(rc.check(&info, &layout(&[3]), 3).new_anomalies, 0);
    }
}
