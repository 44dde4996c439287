//! Per-CPU scheduler state
//!
//! Each logical CPU owns a [`PerCpuScheduler`] guarded by its own spinlock.
//! Critical sections are short, bounded tree operations; no blocking call may
//! occur while a queue lock is held, and the embedding kernel acquires it
//! with interrupts disabled.
//!
//! ## Lock Hierarchy
//!
//! To avoid deadlocks, locks are acquired in this order:
//! 1. Thread registry (`thread::table`), when thread state is needed
//! 2. Per-CPU queue lock — the local CPU first, then at most one remote CPU
//!    in search-set order (cross-CPU operations hold no more than two)
//! 3. `CpuSched` atomics (statistics, flags) — touched lock-free
//!
//! Remote queue locks taken while the local lock is held use `try_lock`; the
//! steal and migration paths are best-effort and retry on a later
//! reschedule rather than wait on a contended neighbor.

use core::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use spin::Mutex;

use alloc::vec::Vec;

use crate::queue::{DeadlineQueue, FairQueue};
use crate::types::{CpuId, ThreadId, FP_ONE, FP_SHIFT, MAX_CPUS};

/// Run-queue state guarded by the per-CPU lock.
pub struct PerCpuScheduler {
    /// CPU this state belongs to.
    pub cpu: CpuId,
    /// Cache cluster index (from the topology).
    pub cluster: u16,
    /// Proportional-share queue.
    pub fair: FairQueue,
    /// EDF queue.
    pub deadline: DeadlineQueue,
    /// Fair-queue clock; advances with wall time while fair demand exists.
    pub virtual_time_ns: u64,
    /// Current scheduling period (stretches with fair load).
    pub scheduling_period_ns: u64,
    /// Absolute time at which the running thread should be preempted.
    pub target_preemption_ns: u64,
    /// Active performance scale (Q16; 1.0 = nominal core speed).
    pub performance_scale_fp: u64,
    /// Scale requested by `update_performance_scales`, applied at the next
    /// reschedule on this CPU.
    pub pending_performance_scale_fp: u64,
    /// Scale the platform reported at boot.
    pub default_performance_scale_fp: u64,
    /// Sum of expected-runtime estimates over threads accounted here; the
    /// basis of the queue-time prediction used for placement.
    pub total_expected_runtime_ns: u64,
    /// Thread currently on this CPU (idle thread included).
    pub current: Option<ThreadId>,
    /// Universal dequeue fallback. Installed when the bootstrap thread is
    /// retired into the idle role.
    pub idle_thread: Option<ThreadId>,
    /// Timestamp of the last reschedule; the running thread is charged for
    /// the interval since.
    pub last_update_ns: u64,
    /// `weight_total_fp` at the moment the running fair thread's slice was
    /// computed; a mismatch means fair demand changed under it.
    pub weight_snapshot_fp: u64,
}

impl PerCpuScheduler {
    pub const fn new() -> Self {
        Self {
            cpu: 0,
            cluster: 0,
            fair: FairQueue::new(),
            deadline: DeadlineQueue::new(),
            virtual_time_ns: 0,
            scheduling_period_ns: 0,
            target_preemption_ns: u64::MAX,
            performance_scale_fp: FP_ONE,
            pending_performance_scale_fp: FP_ONE,
            default_performance_scale_fp: FP_ONE,
            total_expected_runtime_ns: 0,
            current: None,
            idle_thread: None,
            last_update_ns: 0,
            weight_snapshot_fp: 0,
        }
    }

    /// Reinitialize for (re)boot of a CPU.
    pub fn init(&mut self, cpu: CpuId, cluster: u16, performance_scale_fp: u64) {
        self.cpu = cpu;
        self.cluster = cluster;
        self.fair.clear();
        self.deadline.clear();
        self.virtual_time_ns = 0;
        self.scheduling_period_ns = 0;
        self.target_preemption_ns = u64::MAX;
        self.performance_scale_fp = performance_scale_fp;
        self.pending_performance_scale_fp = performance_scale_fp;
        self.default_performance_scale_fp = performance_scale_fp;
        self.total_expected_runtime_ns = 0;
        self.current = None;
        self.idle_thread = None;
        self.last_update_ns = 0;
        self.weight_snapshot_fp = 0;
    }

    /// Runnable threads across both queues (queued plus running).
    #[inline]
    pub fn runnable(&self) -> usize {
        self.fair.runnable + self.deadline.runnable
    }

    /// Predicted time a new arrival would wait behind the work already
    /// accounted here, normalized by core speed.
    #[inline]
    pub fn predicted_queue_time_ns(&self) -> u64 {
        ((self.total_expected_runtime_ns as u128 * FP_ONE as u128)
            / self.performance_scale_fp.max(1) as u128) as u64
    }

    /// Deadline admission: would adding `utilization_fp`, normalized by this
    /// core's speed, stay under the configured ceiling?
    pub fn deadline_fits(&self, utilization_fp: u64, ceiling_fp: u64) -> bool {
        let scaled =
            ((utilization_fp as u128) << FP_SHIFT) / self.performance_scale_fp.max(1) as u128;
        self.deadline.utilization_total_fp as u128 + scaled <= ceiling_fp as u128
    }
}

/// Per-CPU scheduler data with its lock and lock-free side state.
/// Cache-line aligned to prevent false sharing between CPUs.
#[repr(C, align(64))]
pub struct CpuSched {
    /// Run queues and timeline state (the queue lock).
    pub rq: Mutex<PerCpuScheduler>,
    /// Pending-preemption flag, set by the timer tick.
    need_resched: AtomicBool,
    /// Whether this CPU participates in placement and stealing.
    online: AtomicBool,
    /// Mirror of `target_preemption_ns` so the tick path stays lock-free.
    target_preemption_ns: AtomicU64,
    /// Context switches on this CPU.
    pub context_switches: AtomicU64,
    /// Involuntary switches (slice expiry or preemption by a better thread).
    pub preemptions: AtomicU64,
    /// Voluntary switches (yield, block).
    pub voluntary_switches: AtomicU64,
    /// Threads stolen from other CPUs.
    pub steals_in: AtomicU64,
    /// Threads actively migrated to this CPU.
    pub migrations_in: AtomicU64,
    /// Threads actively migrated away from this CPU.
    pub migrations_out: AtomicU64,
}

impl CpuSched {
    pub const fn new() -> Self {
        Self {
            rq: Mutex::new(PerCpuScheduler::new()),
            need_resched: AtomicBool::new(false),
            online: AtomicBool::new(false),
            target_preemption_ns: AtomicU64::new(u64::MAX),
            context_switches: AtomicU64::new(0),
            preemptions: AtomicU64::new(0),
            voluntary_switches: AtomicU64::new(0),
            steals_in: AtomicU64::new(0),
            migrations_in: AtomicU64::new(0),
            migrations_out: AtomicU64::new(0),
        }
    }

    fn init(&self, cpu: CpuId, cluster: u16, performance_scale_fp: u64) {
        self.rq.lock().init(cpu, cluster, performance_scale_fp);
        self.need_resched.store(false, Ordering::Relaxed);
        self.target_preemption_ns.store(u64::MAX, Ordering::Relaxed);
        self.context_switches.store(0, Ordering::Relaxed);
        self.preemptions.store(0, Ordering::Relaxed);
        self.voluntary_switches.store(0, Ordering::Relaxed);
        self.steals_in.store(0, Ordering::Relaxed);
        self.migrations_in.store(0, Ordering::Relaxed);
        self.migrations_out.store(0, Ordering::Relaxed);
        self.online.store(true, Ordering::Release);
    }

    /// Set the pending-preemption flag.
    pub fn set_need_resched(&self) {
        self.need_resched.store(true, Ordering::Release);
    }

    /// Check and clear the pending-preemption flag.
    pub fn check_need_resched(&self) -> bool {
        self.need_resched.swap(false, Ordering::AcqRel)
    }

    pub fn is_online(&self) -> bool {
        self.online.load(Ordering::Acquire)
    }

    pub fn set_online(&self, online: bool) {
        self.online.store(online, Ordering::Release);
    }

    /// Publish the preemption target for the lock-free tick path. Called
    /// with the queue lock held.
    pub(crate) fn publish_preemption_target(&self, target_ns: u64) {
        self.target_preemption_ns.store(target_ns, Ordering::Release);
    }

    pub(crate) fn preemption_target(&self) -> u64 {
        self.target_preemption_ns.load(Ordering::Acquire)
    }
}

// ============================================================================
// Global per-CPU array
// ============================================================================

static CPUS: [CpuSched; MAX_CPUS] = {
    const INIT: CpuSched = CpuSched::new();
    [INIT; MAX_CPUS]
};

static CPU_COUNT: AtomicUsize = AtomicUsize::new(0);

/// Bring up per-CPU scheduler state. Called from `topology::init`.
pub(crate) fn init_cpus(assignments: &[(CpuId, u16, u64)]) {
    for sched in CPUS.iter().take(CPU_COUNT.load(Ordering::Relaxed)) {
        sched.set_online(false);
    }
    for (cpu, cluster, scale) in assignments {
        assert!((*cpu as usize) < MAX_CPUS, "CPU index out of range");
        CPUS[*cpu as usize].init(*cpu, *cluster, *scale);
    }
    CPU_COUNT.store(assignments.len(), Ordering::Release);
}

/// Number of CPUs described by the active topology.
pub fn cpu_count() -> usize {
    CPU_COUNT.load(Ordering::Acquire)
}

/// Per-CPU scheduler data for a CPU.
pub fn sched(cpu: CpuId) -> &'static CpuSched {
    assert!(
        (cpu as usize) < cpu_count(),
        "CPU index beyond active topology"
    );
    &CPUS[cpu as usize]
}

/// Mark a CPU as participating in placement and stealing. Hotplug clears
/// this before calling `migrate_unpinned_threads`.
pub fn set_cpu_online(cpu: CpuId, online: bool) {
    sched(cpu).set_online(online);
}

// ============================================================================
// Performance scales
// ============================================================================

/// Stage new per-CPU performance scales (Q16). Each value takes effect at
/// the target CPU's next reschedule, so an in-flight deadline slice is never
/// rescaled mid-grant.
pub fn update_performance_scales(scales: &[(CpuId, u64)]) {
    for (cpu, scale) in scales {
        if (*cpu as usize) >= cpu_count() {
            continue;
        }
        let mut rq = CPUS[*cpu as usize].rq.lock();
        rq.pending_performance_scale_fp = (*scale).max(1);
    }
}

/// Currently active performance scale of every CPU.
pub fn get_performance_scales() -> Vec<(CpuId, u64)> {
    (0..cpu_count() as u16)
        .map(|cpu| (cpu, CPUS[cpu as usize].rq.lock().performance_scale_fp))
        .collect()
}

/// Boot-time default performance scale of every CPU.
pub fn get_default_performance_scales() -> Vec<(CpuId, u64)> {
    (0..cpu_count() as u16)
        .map(|cpu| {
            (
                cpu,
                CPUS[cpu as usize].rq.lock().default_performance_scale_fp,
            )
        })
        .collect()
}
