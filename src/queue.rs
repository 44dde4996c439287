//! Fair and deadline run queues
//!
//! One CPU owns one of each. Both wrap an [`EligibilityTree`] and keep the
//! aggregates the scheduler's invariants are stated over: the fair queue
//! tracks the total weight of runnable fair threads, the deadline queue the
//! aggregate utilization. The arrival computations that assign start/finish
//! times live here as well.

use crate::config::SchedConfig;
use crate::tree::EligibilityTree;
use crate::types::{Discipline, SchedulerState, MIN_WEIGHT_FP};

// ============================================================================
// Fair queue
// ============================================================================

/// Proportional-share run queue.
pub struct FairQueue {
    pub tree: EligibilityTree,
    /// Fair threads counted runnable on this CPU (queued plus running).
    pub runnable: usize,
    /// Sum of the weights of those threads (Q16).
    pub weight_total_fp: u64,
}

impl FairQueue {
    pub const fn new() -> Self {
        Self {
            tree: EligibilityTree::new(),
            runnable: 0,
            weight_total_fp: 0,
        }
    }

    pub fn account_insert(&mut self, weight_fp: u64) {
        self.runnable += 1;
        self.weight_total_fp += weight_fp;
    }

    pub fn account_remove(&mut self, weight_fp: u64) {
        assert!(self.runnable > 0, "fair runnable count underflow");
        assert!(
            self.weight_total_fp >= weight_fp,
            "fair weight total underflow"
        );
        self.runnable -= 1;
        self.weight_total_fp -= weight_fp;
    }

    pub fn clear(&mut self) {
        self.tree.clear();
        self.runnable = 0;
        self.weight_total_fp = 0;
    }
}

// ============================================================================
// Deadline queue
// ============================================================================

/// Earliest-deadline-first run queue with bounded aggregate capacity.
pub struct DeadlineQueue {
    pub tree: EligibilityTree,
    /// Deadline threads counted runnable on this CPU (queued plus running).
    pub runnable: usize,
    /// Sum of their utilizations (Q16).
    pub utilization_total_fp: u64,
}

impl DeadlineQueue {
    pub const fn new() -> Self {
        Self {
            tree: EligibilityTree::new(),
            runnable: 0,
            utilization_total_fp: 0,
        }
    }

    pub fn account_insert(&mut self, utilization_fp: u64) {
        self.runnable += 1;
        self.utilization_total_fp += utilization_fp;
    }

    pub fn account_remove(&mut self, utilization_fp: u64) {
        assert!(self.runnable > 0, "deadline runnable count underflow");
        assert!(
            self.utilization_total_fp >= utilization_fp,
            "deadline utilization total underflow"
        );
        self.runnable -= 1;
        self.utilization_total_fp -= utilization_fp;
    }

    pub fn clear(&mut self) {
        self.tree.clear();
        self.runnable = 0;
        self.utilization_total_fp = 0;
    }
}

// ============================================================================
// Arrival computations
// ============================================================================

/// Scheduling period for a given fair load: stretches once the runnable
/// count exceeds the target latency.
#[inline]
pub fn scheduling_period_ns(runnable_fair: usize, config: &SchedConfig) -> u64 {
    config
        .target_latency_granules
        .max(runnable_fair as u64)
        .saturating_mul(config.minimum_granularity_ns)
}

/// Ideal fair time slice: the thread's weighted share of the period, floored
/// to one granule.
#[inline]
pub fn ideal_time_slice_ns(
    period_ns: u64,
    weight_fp: u64,
    weight_total_fp: u64,
    config: &SchedConfig,
) -> u64 {
    debug_assert!(weight_total_fp >= weight_fp, "weight total excludes thread");
    let slice = ((period_ns as u128 * weight_fp as u128) / weight_total_fp as u128) as u64;
    slice.max(config.minimum_granularity_ns)
}

/// Fresh fair arrival: the thread re-enters the virtual timeline no earlier
/// than its previous finish, and its finish recedes inversely with weight so
/// that heavier threads come up for selection sooner.
pub fn fair_arrive(state: &mut SchedulerState, virtual_time_ns: u64, period_ns: u64) {
    let weight_fp = match state.discipline {
        Discipline::Fair(ref fair) => fair.weight_fp,
        Discipline::Deadline(_) => unreachable!("fair arrival on deadline thread"),
    };
    let start = state.finish_ns.max(virtual_time_ns);
    let delay = (period_ns as u128 * MIN_WEIGHT_FP as u128 / weight_fp as u128) as u64;
    state.start_ns = start;
    state.finish_ns = start + delay.max(1);
    state.banked_runtime_ns = 0;
    if let Discipline::Fair(ref mut fair) = state.discipline {
        fair.normalized_remainder_fp = 0;
    }
}

/// Deadline arrival: begins a new period when the current one is exhausted
/// (no budget left, or the deadline has passed); otherwise the thread keeps
/// its in-flight period, e.g. when it unblocks mid-period.
pub fn deadline_arrive(state: &mut SchedulerState, now_ns: u64, config: &SchedConfig) {
    let deadline = match state.discipline {
        Discipline::Deadline(ref dl) => *dl,
        Discipline::Fair(_) => unreachable!("deadline arrival on fair thread"),
    };
    let fresh = state.finish_ns == 0
        || state.time_slice_ns <= config.deadline_slice_epsilon_ns
        || now_ns >= state.finish_ns;
    if fresh {
        let start = now_ns.max(state.finish_ns);
        state.start_ns = start;
        state.finish_ns = start + deadline.deadline_ns;
        state.time_slice_ns = deadline.capacity_ns;
        state.banked_runtime_ns = 0;
    }
}
