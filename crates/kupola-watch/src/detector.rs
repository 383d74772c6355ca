//! Snapshot change detection.
//!
//! Two snapshots are considered equal when they have the same length and
//! the same multiset of (identity, watched-fingerprint) pairs. Ordering
//! and unwatched-field differences never count as change, which keeps
//! consumers from being re-notified for churn they would not display.

use std::collections::BTreeMap;

use kupola_types::{ResourceIdentity, Watchable};

type Multiset = BTreeMap<(ResourceIdentity, u64), usize>;

fn multiset<T: Watchable>(snapshot: &[T]) -> Multiset {
    let mut set = Multiset::new();
    for item in snapshot {
        *set.entry((item.identity(), item.watched_fingerprint()))
            .or_insert(0) += 1;
    }
    set
}

/// Whether two snapshots are equal under the watched-field policy.
pub fn snapshots_equal<T: Watchable>(prev: &[T], next: &[T]) -> bool {
    if prev.len() != next.len() {
        return false;
    }
    multiset(prev) == multiset(next)
}

#[cfg(test)]
mod tests {
    use super::*;
    use kupola_types::{PodPhase, PodSummary};

    fn pod(name: &str, phase: PodPhase, restarts: u32) -> PodSummary {
        let mut p = PodSummary::new(name, "default");
        p.phase = phase;
        p.restart_count = restarts;
        p
    }

    #[test]
    fn test_reordered_snapshots_are_equal() {
        let a = vec![
            pod("web-1", PodPhase::Running, 0),
            pod("web-2", PodPhase::Running, 0),
        ];
        let b = vec![
            pod("web-2", PodPhase::Running, 0),
            pod("web-1", PodPhase::Running, 0),
        ];
        assert!(snapshots_equal(&a, &b));
    }

    #[test]
    fn test_unwatched_field_change_is_ignored() {
        let a = vec![pod("web-1", PodPhase::Running, 0)];
        let mut b = a.clone();
        b[0].node_name = Some("node-3".to_string());
        b[0].pod_ip = Some("10.1.2.3".to_string());
        assert!(snapshots_equal(&a, &b));
    }

    #[test]
    fn test_watched_field_change_is_detected() {
        let a = vec![pod("web-1", PodPhase::Running, 0)];
        let b = vec![pod("web-1", PodPhase::Running, 1)];
        assert!(!snapshots_equal(&a, &b));
    }

    #[test]
    fn test_added_and_removed_items_are_detected() {
        let a = vec![pod("web-1", PodPhase::Running, 0)];
        let b = vec![
            pod("web-1", PodPhase::Running, 0),
            pod("web-2", PodPhase::Pending, 0),
        ];
        assert!(!snapshots_equal(&a, &b));
        assert!(!snapshots_equal(&b, &a));
    }

    #[test]
    fn test_duplicate_identities_compare_as_multiset() {
        // Same identity twice vs once plus a different one.
        let a = vec![
            pod("web-1", PodPhase::Running, 0),
            pod("web-1", PodPhase::Running, 0),
        ];
        let b = vec![
            pod("web-1", PodPhase::Running, 0),
            pod("web-2", PodPhase::Running, 0),
        ];
        assert!(!snapshots_equal(&a, &b));
        assert!(snapshots_equal(&a, &a.clone()));
    }

    #[test]
    fn test_empty_snapshots_are_equal() {
        let empty: Vec<PodSummary> = Vec::new();
        assert!(snapshots_equal(&empty, &empty));
    }
}
