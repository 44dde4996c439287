//! Preemption Timing Tests
//!
//! The timer contract: armed preemption targets, the pending-preempt flag,
//! early clamping for deadline arrivals, and slice monotonicity within a
//! single run.

mod common;

use common::{boot, slice_of, MS};
use oryn_sched::types::DeadlineParams;
use oryn_sched::{
    current_thread, initialize_thread, initialize_thread_deadline, preempt,
    target_preemption_time, timer_tick, unblock,
};
use serial_test::serial;

// ============================================================================
// Timer tick and targets
// ============================================================================

#[test]
#[serial]
fn test_timer_tick_marks_pending_preemption() {
    boot(1);
    initialize_thread(1, "a", 16).unwrap();
    unblock(1, 0).unwrap();
    preempt(0, 0);
    assert_eq!(target_preemption_time(0), 6 * MS);

    assert!(!timer_tick(0, 5 * MS), "before the target nothing is pending");
    assert!(timer_tick(0, 6 * MS), "reaching the target marks a preemption");
}

#[test]
#[serial]
fn test_deadline_thread_target_covers_slice_and_period() {
    boot(1);
    initialize_thread_deadline(
        1,
        "dl",
        DeadlineParams {
            capacity_ns: 2 * MS,
            deadline_ns: 5 * MS,
        },
    )
    .unwrap();
    unblock(1, 0).unwrap();
    preempt(0, 0);
    assert_eq!(
        target_preemption_time(0),
        2 * MS,
        "slice exhaustion comes before the period end"
    );
}

#[test]
#[serial]
fn test_future_deadline_arrival_clamps_fair_target() {
    boot(1);
    initialize_thread_deadline(
        1,
        "dl",
        DeadlineParams {
            capacity_ns: 2 * MS,
            deadline_ns: 5 * MS,
        },
    )
    .unwrap();
    initialize_thread(2, "fair", 16).unwrap();
    unblock(1, 0).unwrap();
    preempt(0, 0);
    assert_eq!(current_thread(0), Some(1));

    // The fair thread arrives while the deadline thread runs; no signal, it
    // just queues.
    unblock(2, MS).unwrap();

    // At 2ms the deadline budget is gone; its next period starts at 5ms.
    // The fair thread takes over, but its 6ms slice must be clamped to the
    // moment the deadline thread becomes eligible again.
    preempt(0, 2 * MS);
    assert_eq!(current_thread(0), Some(2));
    assert_eq!(
        target_preemption_time(0),
        5 * MS,
        "armed early for the re-arming deadline thread"
    );

    // The tick at 5ms preempts the fair thread even though its slice has
    // time left, and the deadline thread resumes.
    assert!(timer_tick(0, 5 * MS));
    preempt(0, 5 * MS);
    assert_eq!(current_thread(0), Some(1));
    assert_eq!(slice_of(1), 2 * MS, "fresh capacity for the new period");
}

// ============================================================================
// Slice monotonicity
// ============================================================================

#[test]
#[serial]
fn test_slice_is_non_increasing_within_a_run() {
    boot(1);
    initialize_thread(1, "a", 16).unwrap();
    unblock(1, 0).unwrap();
    preempt(0, 0);

    let mut last = slice_of(1);
    assert_eq!(last, 6 * MS);
    for now in [MS, 2 * MS + 500_000, 4 * MS, 5 * MS] {
        // Spurious preemption requests while nothing better exists: the
        // thread keeps the CPU and only its slice shrinks.
        preempt(0, now);
        assert_eq!(current_thread(0), Some(1));
        let slice = slice_of(1);
        assert!(
            slice <= last,
            "slice grew from {} to {} at {}",
            last,
            slice,
            now
        );
        last = slice;
    }

    // Expiry at 6ms is a fresh arrival with a full period again.
    preempt(0, 6 * MS);
    assert_eq!(current_thread(0), Some(1), "sole thread resumes after expiry");
    assert_eq!(slice_of(1), 6 * MS);
}
