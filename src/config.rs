//! Scheduler tuning configuration
//!
//! Platform tuning values for the scheduler. None of these are structural
//! invariants; they are exposed as a runtime-settable block so platform
//! bring-up can adjust them before `init()`. The defaults suit a mid-size
//! SMP machine with one or two cache clusters.

use spin::RwLock;

use crate::types::FP_ONE;

/// Tunable scheduler parameters.
#[derive(Clone, Copy, Debug)]
pub struct SchedConfig {
    /// Minimum scheduling granularity in nanoseconds. No fair time slice is
    /// ever granted below this, and the scheduling period is a multiple of it.
    pub minimum_granularity_ns: u64,
    /// Target latency expressed in granules. The scheduling period is
    /// `max(target_latency_granules, runnable_fair_count) * granularity`.
    pub target_latency_granules: u64,
    /// Predicted queue time below which a same-cluster CPU is considered
    /// sufficiently idle during placement.
    pub intra_cluster_threshold_ns: u64,
    /// Predicted queue time below which a remote-cluster CPU is considered
    /// sufficiently idle, and above which a same-cluster CPU is abandoned in
    /// favor of looking across clusters.
    pub inter_cluster_threshold_ns: u64,
    /// Maximum utilization a single deadline thread may request (Q16).
    pub max_thread_utilization_fp: u64,
    /// Aggregate utilization ceiling per CPU used during placement and
    /// stealing admission (Q16).
    pub cpu_utilization_ceiling_fp: u64,
    /// Remaining deadline slice at or below which the current period is
    /// considered exhausted.
    pub deadline_slice_epsilon_ns: u64,
    /// Expected-runtime estimator attack shift: when a runtime sample exceeds
    /// the estimate, the estimate moves by `delta >> attack_shift`.
    pub estimator_attack_shift: u32,
    /// Expected-runtime estimator decay shift: when a sample falls below the
    /// estimate, the estimate moves by `delta >> decay_shift`.
    pub estimator_decay_shift: u32,
}

impl SchedConfig {
    pub const DEFAULT: Self = Self {
        minimum_granularity_ns: 750_000,
        target_latency_granules: 8,
        intra_cluster_threshold_ns: 25_000,
        inter_cluster_threshold_ns: 75_000,
        max_thread_utilization_fp: FP_ONE * 9 / 10,
        cpu_utilization_ceiling_fp: FP_ONE * 95 / 100,
        deadline_slice_epsilon_ns: 1_000,
        estimator_attack_shift: 1,
        estimator_decay_shift: 3,
    };
}

static CONFIG: RwLock<SchedConfig> = RwLock::new(SchedConfig::DEFAULT);

/// Read the active configuration (copy; the block is small).
pub fn get() -> SchedConfig {
    *CONFIG.read()
}

/// Replace the active configuration. Intended for platform bring-up, before
/// threads exist; changing thresholds mid-flight is safe but takes effect
/// only at the next reschedule/placement on each CPU.
pub fn set(config: SchedConfig) {
    *CONFIG.write() = config;
}

/// Restore the default configuration.
pub fn reset() {
    *CONFIG.write() = SchedConfig::DEFAULT;
}
