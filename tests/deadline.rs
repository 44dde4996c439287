//! Deadline Discipline Tests
//!
//! EDF ordering, period replenishment, strict priority over fair threads,
//! performance-scaled slice consumption, and utilization-aware placement.

mod common;

use common::{boot, idle_tid, slice_of, utilization_total, MS};
use oryn_sched::thread::with_thread;
use oryn_sched::types::{DeadlineParams, FP_ONE};
use oryn_sched::{
    current_thread, initialize_thread, initialize_thread_deadline, preempt, unblock,
    update_performance_scales,
};
use serial_test::serial;

fn params(capacity_ms: u64, deadline_ms: u64) -> DeadlineParams {
    DeadlineParams {
        capacity_ns: capacity_ms * MS,
        deadline_ns: deadline_ms * MS,
    }
}

// ============================================================================
// Period lifecycle
// ============================================================================

#[test]
#[serial]
fn test_period_replenishment() {
    boot(1);
    initialize_thread_deadline(1, "dl", params(2, 10)).unwrap();
    unblock(1, 0).unwrap();
    preempt(0, 0);

    assert_eq!(current_thread(0), Some(1));
    let (start, finish) = with_thread(1, |t| (t.sched.start_ns, t.sched.finish_ns)).unwrap();
    assert_eq!(start, 0);
    assert_eq!(finish, 10 * MS);
    assert_eq!(slice_of(1), 2 * MS);

    // The full capacity is consumed at t=2ms; the next period chains off the
    // previous finish time, not off `now`.
    preempt(0, 2 * MS);
    assert_eq!(current_thread(0), Some(idle_tid(0)), "budget exhausted until 10ms");
    let (start, finish) = with_thread(1, |t| (t.sched.start_ns, t.sched.finish_ns)).unwrap();
    assert_eq!(start, 10 * MS);
    assert_eq!(finish, 20 * MS);
    assert_eq!(slice_of(1), 2 * MS, "slice reset to capacity");

    // At the new period start the thread runs again.
    preempt(0, 10 * MS);
    assert_eq!(current_thread(0), Some(1));
}

#[test]
#[serial]
fn test_edf_orders_by_finish_time() {
    boot(1);
    initialize_thread_deadline(1, "tight", params(1, 5)).unwrap();
    initialize_thread_deadline(2, "loose", params(1, 20)).unwrap();
    unblock(2, 0).unwrap();
    unblock(1, 0).unwrap();
    preempt(0, 0);

    assert_eq!(
        current_thread(0),
        Some(1),
        "earliest deadline wins regardless of insertion order"
    );
}

#[test]
#[serial]
fn test_deadline_outranks_fair() {
    boot(1);
    initialize_thread(1, "fair", 31).unwrap();
    initialize_thread_deadline(2, "dl", params(1, 10)).unwrap();
    unblock(1, 0).unwrap();
    unblock(2, 0).unwrap();
    preempt(0, 0);

    assert_eq!(
        current_thread(0),
        Some(2),
        "an eligible deadline thread beats even the heaviest fair thread"
    );
}

#[test]
#[serial]
fn test_unblock_mid_period_keeps_budget() {
    boot(1);
    initialize_thread_deadline(1, "dl", params(4, 20)).unwrap();
    unblock(1, 0).unwrap();
    preempt(0, 0);
    assert_eq!(slice_of(1), 4 * MS);

    // Run 1ms, then block with budget remaining.
    oryn_sched::block_current(0, MS);
    assert_eq!(current_thread(0), Some(idle_tid(0)));

    // Unblocking inside the same period must not grant a fresh capacity.
    unblock(1, 2 * MS).unwrap();
    preempt(0, 2 * MS);
    assert_eq!(current_thread(0), Some(1));
    assert_eq!(slice_of(1), 3 * MS, "remaining budget carries across the block");
    let finish = with_thread(1, |t| t.sched.finish_ns).unwrap();
    assert_eq!(finish, 20 * MS, "period end unchanged");
}

// ============================================================================
// Performance scaling
// ============================================================================

#[test]
#[serial]
fn test_slice_consumption_scales_with_core_speed() {
    boot(1);
    // Half-speed core: a wall-clock millisecond consumes half a millisecond
    // of budget.
    update_performance_scales(&[(0, FP_ONE / 2)]);
    initialize_thread_deadline(1, "dl", params(2, 10)).unwrap();
    unblock(1, 0).unwrap();
    preempt(0, 0);
    assert_eq!(slice_of(1), 2 * MS);

    preempt(0, 2 * MS);
    assert_eq!(current_thread(0), Some(1), "budget not yet exhausted on a slow core");
    assert_eq!(slice_of(1), MS, "2ms of wall time consumed 1ms of budget");
}

#[test]
#[serial]
fn test_performance_scale_staging() {
    boot(2);
    let defaults = oryn_sched::get_default_performance_scales();
    assert!(defaults.iter().all(|(_, scale)| *scale == FP_ONE));

    update_performance_scales(&[(1, FP_ONE / 4)]);
    // Staged, not yet applied: reads still show the active value until the
    // target CPU passes a reschedule.
    let active = oryn_sched::get_performance_scales();
    assert_eq!(active[1].1, FP_ONE);

    preempt(1, MS);
    let active = oryn_sched::get_performance_scales();
    assert_eq!(active[1].1, FP_ONE / 4, "applied at the reschedule boundary");
    assert_eq!(
        oryn_sched::get_default_performance_scales()[1].1,
        FP_ONE,
        "defaults are not rewritten"
    );
}

// ============================================================================
// Placement admission
// ============================================================================

#[test]
#[serial]
fn test_placement_respects_utilization_ceiling() {
    boot(2);
    initialize_thread_deadline(1, "heavy-a", params(6, 10)).unwrap();
    initialize_thread_deadline(2, "heavy-b", params(6, 10)).unwrap();
    unblock(1, 0).unwrap();
    unblock(2, 0).unwrap();

    // 0.6 + 0.6 exceeds the 95% ceiling, so the second thread must land on
    // the other CPU.
    let u0 = utilization_total(0);
    let u1 = utilization_total(1);
    let expected = DeadlineParams {
        capacity_ns: 6 * MS,
        deadline_ns: 10 * MS,
    }
    .utilization_fp();
    assert_eq!(u0, expected);
    assert_eq!(u1, expected);
}

#[test]
#[serial]
fn test_per_thread_utilization_limit() {
    boot(1);
    let err = initialize_thread_deadline(1, "hog", params(95, 100));
    assert!(err.is_err(), "95% utilization exceeds the per-thread limit");
    let err = initialize_thread_deadline(2, "zero", params(0, 10));
    assert!(err.is_err(), "zero capacity is malformed");
    let err = initialize_thread_deadline(
        3,
        "inverted",
        DeadlineParams {
            capacity_ns: 10 * MS,
            deadline_ns: 5 * MS,
        },
    );
    assert!(err.is_err(), "capacity beyond the period is malformed");
}
