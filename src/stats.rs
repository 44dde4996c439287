//! Scheduler statistics
//!
//! Snapshots of the per-CPU counters and queue state for the kernel's
//! introspection surfaces. Counters are relaxed atomics updated outside the
//! queue lock; a snapshot is consistent per field, not across fields.

use alloc::vec::Vec;
use core::sync::atomic::Ordering;

use crate::percpu;
use crate::types::{CpuId, ThreadId};

/// Point-in-time view of one CPU's scheduler.
#[derive(Clone, Copy, Debug)]
pub struct PerCpuStats {
    pub cpu: CpuId,
    pub context_switches: u64,
    pub preemptions: u64,
    pub voluntary_switches: u64,
    pub steals_in: u64,
    pub migrations_in: u64,
    pub migrations_out: u64,
    pub runnable_fair: usize,
    pub runnable_deadline: usize,
    pub weight_total_fp: u64,
    pub utilization_total_fp: u64,
    pub virtual_time_ns: u64,
    pub current: Option<ThreadId>,
}

/// Machine-wide totals.
#[derive(Clone, Copy, Debug, Default)]
pub struct SchedulerStats {
    pub context_switches: u64,
    pub preemptions: u64,
    pub voluntary_switches: u64,
    pub steals: u64,
    pub migrations: u64,
}

/// Snapshot one CPU.
pub fn get_percpu_stats(cpu: CpuId) -> PerCpuStats {
    let cs = percpu::sched(cpu);
    let rq = cs.rq.lock();
    PerCpuStats {
        cpu,
        context_switches: cs.context_switches.load(Ordering::Relaxed),
        preemptions: cs.preemptions.load(Ordering::Relaxed),
        voluntary_switches: cs.voluntary_switches.load(Ordering::Relaxed),
        steals_in: cs.steals_in.load(Ordering::Relaxed),
        migrations_in: cs.migrations_in.load(Ordering::Relaxed),
        migrations_out: cs.migrations_out.load(Ordering::Relaxed),
        runnable_fair: rq.fair.runnable,
        runnable_deadline: rq.deadline.runnable,
        weight_total_fp: rq.fair.weight_total_fp,
        utilization_total_fp: rq.deadline.utilization_total_fp,
        virtual_time_ns: rq.virtual_time_ns,
        current: rq.current,
    }
}

/// Snapshot every CPU in the active topology.
pub fn list_percpu_stats() -> Vec<PerCpuStats> {
    (0..percpu::cpu_count() as CpuId)
        .map(get_percpu_stats)
        .collect()
}

/// Aggregate totals over all CPUs.
pub fn get_stats() -> SchedulerStats {
    let mut totals = SchedulerStats::default();
    for stats in list_percpu_stats() {
        totals.context_switches += stats.context_switches;
        totals.preemptions += stats.preemptions;
        totals.voluntary_switches += stats.voluntary_switches;
        totals.steals += stats.steals_in;
        totals.migrations += stats.migrations_in;
    }
    totals
}
