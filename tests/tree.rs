//! Eligibility Tree Tests
//!
//! The tree is a pure data structure; these tests exercise the augmented
//! ordered-set contract directly, including the earliest-eligible search the
//! run queues are built on.

use oryn_sched::tree::EligibilityTree;

// ============================================================================
// Earliest-eligible search
// ============================================================================

#[test]
fn test_earliest_eligible_basic() {
    let mut tree = EligibilityTree::new();
    tree.insert(10, 0, 5);
    tree.insert(11, 1, 3);
    tree.insert(12, 2, 4);

    // Among entries with start <= 2, the minimum finish is (1, 3).
    let entry = tree.find_earliest_eligible(2).expect("eligible entry");
    assert_eq!(entry.tid, 11);
    assert_eq!(entry.finish_ns, 3);

    // Only (0, 5) is eligible at time 0.
    let entry = tree.find_earliest_eligible(0).expect("eligible entry");
    assert_eq!(entry.tid, 10);

    // At time 1, (1, 3) beats (0, 5).
    let entry = tree.find_earliest_eligible(1).expect("eligible entry");
    assert_eq!(entry.tid, 11);
}

#[test]
fn test_earliest_eligible_empty_and_none_eligible() {
    let mut tree = EligibilityTree::new();
    assert!(tree.find_earliest_eligible(100).is_none());

    tree.insert(1, 50, 60);
    assert!(tree.find_earliest_eligible(49).is_none(), "nothing starts by 49");
    assert!(tree.find_earliest_eligible(50).is_some());
}

#[test]
fn test_earliest_eligible_prefers_subtree_minimum() {
    let mut tree = EligibilityTree::new();
    // A chain of entries where the best finish hides in a left subtree.
    tree.insert(1, 10, 100);
    tree.insert(2, 20, 22);
    tree.insert(3, 30, 90);
    tree.insert(4, 40, 80);
    tree.insert(5, 50, 70);

    let entry = tree.find_earliest_eligible(45).expect("eligible entry");
    assert_eq!(entry.tid, 2, "minimum finish among starts <= 45 is (20, 22)");

    let entry = tree.find_earliest_eligible(u64::MAX).expect("eligible entry");
    assert_eq!(entry.tid, 2, "global minimum finish");
}

#[test]
fn test_earliest_eligible_with_predicate() {
    let mut tree = EligibilityTree::new();
    tree.insert(1, 0, 10);
    tree.insert(2, 0, 20);
    tree.insert(3, 0, 30);

    let entry = tree
        .find_earliest_eligible_where(5, |tid| tid != 1)
        .expect("filtered entry");
    assert_eq!(entry.tid, 2, "best entry passing the predicate");

    assert!(
        tree.find_earliest_eligible_where(5, |_| false).is_none(),
        "predicate rejecting everything yields none"
    );
}

// ============================================================================
// Structure and augmentation invariants
// ============================================================================

#[test]
fn test_front_and_min_finish() {
    let mut tree = EligibilityTree::new();
    assert!(tree.front().is_none());
    assert!(tree.min_finish().is_none());

    tree.insert(7, 30, 40);
    tree.insert(8, 10, 90);
    tree.insert(9, 20, 35);

    let front = tree.front().expect("non-empty");
    assert_eq!(front.tid, 8, "front is the earliest start");
    assert_eq!(tree.min_finish(), Some(35));

    assert!(tree.remove(9, 20));
    assert_eq!(tree.min_finish(), Some(40));
}

#[test]
fn test_remove_missing_entry() {
    let mut tree = EligibilityTree::new();
    tree.insert(1, 5, 10);
    assert!(!tree.remove(1, 6), "wrong start key");
    assert!(!tree.remove(2, 5), "wrong id");
    assert!(tree.remove(1, 5));
    assert!(tree.is_empty());
}

/// Deterministic pseudo-random sequence (LCG) for structural stress.
struct Lcg(u64);

impl Lcg {
    fn next(&mut self) -> u64 {
        self.0 = self.0.wrapping_mul(6364136223846793005).wrapping_add(1442695040888963407);
        self.0 >> 33
    }
}

#[test]
fn test_invariants_under_stress() {
    let mut tree = EligibilityTree::new();
    let mut rng = Lcg(0x5eed);
    let mut mirror: Vec<(u64, u64, u64)> = Vec::new();

    for tid in 0..200u64 {
        let start = rng.next() % 10_000;
        // Unique finishes keep the brute-force comparison unambiguous.
        let finish = start + 1 + tid;
        tree.insert(tid, start, finish);
        mirror.push((tid, start, finish));
        assert!(tree.check_invariants(), "invariants after insert {}", tid);
    }
    assert_eq!(tree.len(), 200);

    // Cross-check the search against a linear scan at assorted times.
    for probe in [0u64, 100, 1_000, 5_000, 9_999, u64::MAX] {
        let expected = mirror
            .iter()
            .filter(|(_, start, _)| *start <= probe)
            .min_by_key(|(_, _, finish)| *finish)
            .map(|(tid, _, _)| *tid);
        let got = tree.find_earliest_eligible(probe).map(|e| e.tid);
        assert_eq!(got, expected, "earliest eligible at {}", probe);
    }

    // Remove every other entry and re-verify.
    for chunk in mirror.chunks(2) {
        let (tid, start, _) = chunk[0];
        assert!(tree.remove(tid, start), "removing {}", tid);
        assert!(tree.check_invariants(), "invariants after remove {}", tid);
    }
    assert_eq!(tree.len(), 100);

    let survivors: Vec<_> = mirror.chunks(2).filter_map(|c| c.get(1).copied()).collect();
    for probe in [0u64, 2_500, 7_500, u64::MAX] {
        let expected = survivors
            .iter()
            .filter(|(_, start, _)| *start <= probe)
            .min_by_key(|(_, _, finish)| *finish)
            .map(|(tid, _, _)| *tid);
        let got = tree.find_earliest_eligible(probe).map(|e| e.tid);
        assert_eq!(got, expected, "earliest eligible at {} after removals", probe);
    }
}

#[test]
fn test_iter_entries_in_start_order() {
    let mut tree = EligibilityTree::new();
    tree.insert(1, 30, 31);
    tree.insert(2, 10, 11);
    tree.insert(3, 20, 21);

    let mut starts = Vec::new();
    tree.iter_entries(|e| starts.push(e.start_ns));
    assert_eq!(starts, vec![10, 20, 30]);
}
