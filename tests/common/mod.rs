//! Shared test fixtures
//!
//! Brings up a uniform topology and retires one bootstrap thread per CPU
//! into the idle role, mirroring how the kernel hands each CPU over to the
//! scheduler.

#![allow(dead_code)]

use oryn_sched::stats;
use oryn_sched::{initialize_first_thread, remove_first_thread, CpuId, CpuTopology, ThreadId};

pub const US: u64 = 1_000;
pub const MS: u64 = 1_000_000;

/// Idle-thread id convention used by these tests.
pub fn idle_tid(cpu: CpuId) -> ThreadId {
    1_000 + cpu as ThreadId
}

/// Initialize `cpus` identical CPUs and install an idle thread on each.
pub fn boot(cpus: usize) {
    oryn_sched::init(&CpuTopology::uniform(cpus));
    for cpu in 0..cpus as CpuId {
        initialize_first_thread(idle_tid(cpu), "boot", cpu).expect("first thread");
        remove_first_thread(idle_tid(cpu)).expect("retire into idle");
    }
}

/// Total fair weight currently accounted on a CPU.
pub fn weight_total(cpu: CpuId) -> u64 {
    stats::get_percpu_stats(cpu).weight_total_fp
}

/// Total deadline utilization currently accounted on a CPU.
pub fn utilization_total(cpu: CpuId) -> u64 {
    stats::get_percpu_stats(cpu).utilization_total_fp
}

/// Remaining time slice of a thread.
pub fn slice_of(tid: ThreadId) -> u64 {
    oryn_sched::thread::with_thread(tid, |t| t.sched.time_slice_ns).expect("thread registered")
}
