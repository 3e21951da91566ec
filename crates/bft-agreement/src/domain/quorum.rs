//! Quorum arithmetic for the classic f-fault model.

use shared_types::{ReplicaId, View};

/// Replica count and the thresholds derived from it.
///
/// | Threshold | Value | Used for |
/// |-----------|-------|----------|
/// | `quorum` | N - f (2f+1) | commit, checkpoint, view-change selection |
/// | `prepare_quorum` | N - f - 1 (2f) | backup prepares; the pre-prepare stands in for the primary's vote |
/// | `weak` | f + 1 | replies, proofs, above-window evidence |
/// | `ack_quorum` | 2f - 1 | view-change acknowledgements at the new primary |
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct QuorumParams {
    /// Number of replicas.
    pub n: usize,
    /// Tolerated faulty replicas.
    pub f: usize,
}

impl QuorumParams {
    /// Parameters for `n` replicas.
    pub fn new(n: usize) -> Self {
        Self {
            n,
            f: n.saturating_sub(1) / 3,
        }
    }

    /// Matching votes needed for a complete certificate.
    pub fn quorum(&self) -> usize {
        self.n - self.f
    }

    /// Backup prepares needed alongside the pre-prepare.
    pub fn prepare_quorum(&self) -> usize {
        self.quorum().saturating_sub(1)
    }

    /// Votes guaranteeing at least one correct voter.
    pub fn weak(&self) -> usize {
        self.f + 1
    }

    /// Acknowledgements the new primary waits for before using a view-change.
    pub fn ack_quorum(&self) -> usize {
        (2 * self.f).saturating_sub(1)
    }

    /// Primary of `view`.
    pub fn primary(&self, view: View) -> ReplicaId {
        (view % self.n as u64) as ReplicaId
    }
}

/// The `k`-th largest of `values` (1-based), or `T::default()` if there are
/// fewer than `k`.
pub fn kth_largest<T: Ord + Copy + Default>(k: usize, values: impl IntoIterator<Item = T>) -> T {
    let mut sorted: Vec<T> = values.into_iter().collect();
    sorted.sort_unstable_by(|a, b| b.cmp(a));
    match k.checked_sub(1).and_then(|i| sorted.get(i)) {
        Some(v) => *v,
        None => T::default(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_four_replicas() {
        let q = QuorumParams::new(4);
        assert_eq!(q.f, 1);
        assert_eq!(q.quorum(), 3);
        assert_eq!(q.prepare_quorum(), 2);
        assert_eq!(q.weak(), 2);
        assert_eq!(q.ack_quorum(), 1);
    }

    #[test]
    fn test_seven_replicas() {
        let q = QuorumParams::new(7);
        assert_eq!(q.f, 2);
        assert_eq!(q.quorum(), 5);
        assert_eq!(q.ack_quorum(), 3);
    }

    #[test]
    fn test_primary_rotates_with_view() {
        let q = QuorumParams::new(4);
        assert_eq!(q.primary(0), 0);
        assert_eq!(q.primary(1), 1);
        assert_eq!(q.primary(5), 1);
    }

    #[test]
    fn test_kth_largest() {
        assert_eq!(kth_largest(1, [3u64, 9, 1, 4]), 9);
        assert_eq!(kth_largest(2, [3u64, 9, 1, 4]), 4);
        assert_eq!(kth_largest(3, [3u64, 9, 9, 4]), 4);
        assert_eq!(kth_largest(5, [3u64, 9]), 0);
    }
}
