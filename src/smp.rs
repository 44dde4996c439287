//! Cross-CPU operations
//!
//! CPU selection for new arrivals, work stealing for idle CPUs, active
//! migration for threads carrying a migration hook, and hotplug evacuation.
//! Reschedule requests aimed at other CPUs are collected into a [`CpuMask`]
//! and delivered once through the installed IPI hook after every lock is
//! released.

use alloc::collections::BTreeMap;
use alloc::vec::Vec;
use core::sync::atomic::{AtomicUsize, Ordering};

use crate::config::{self, SchedConfig};
use crate::percpu::{self, PerCpuScheduler};
use crate::thread::{self, insert_locked, remove_locked};
use crate::topology::{cluster_of, search_order};
use crate::types::{CpuId, CpuMask, Discipline, Placement, Thread, ThreadId};
use crate::{kdebug, ktrace};

/// Reschedule-IPI delivery hook, installed by the interrupt layer.
static IPI_HOOK: AtomicUsize = AtomicUsize::new(0);

/// Install the hook used to deliver coalesced reschedule interrupts.
pub fn set_reschedule_ipi_hook(hook: fn(CpuMask)) {
    IPI_HOOK.store(hook as usize, Ordering::Release);
}

/// Pending reschedule interrupts, coalesced per operation and flushed once
/// outside all locks.
pub(crate) struct IpiMask {
    mask: CpuMask,
}

impl IpiMask {
    pub(crate) fn new() -> Self {
        Self {
            mask: CpuMask::empty(),
        }
    }

    pub(crate) fn mark(&mut self, cpu: CpuId) {
        self.mask.set(cpu as usize);
    }

    /// Deliver the accumulated mask. Must be called with no locks held.
    pub(crate) fn flush(self) {
        if self.mask.is_empty() {
            return;
        }
        let raw = IPI_HOOK.load(Ordering::Acquire);
        if raw != 0 {
            let hook: fn(CpuMask) = unsafe { core::mem::transmute(raw) };
            hook(self.mask);
        }
    }
}

// ============================================================================
// CPU selection
// ============================================================================

/// Pick the CPU a runnable thread should be queued on.
///
/// Candidates are the online CPUs in the thread's effective affinity mask,
/// visited in the starting CPU's search-set order (closest cache affinity
/// first). The walk stops at the first sufficiently idle candidate — one
/// whose predicted queue time is under the cluster-appropriate threshold
/// and, for deadline threads, whose aggregate utilization leaves headroom —
/// and otherwise settles for the least-loaded admissible candidate.
pub(crate) fn find_target_cpu(thread: &Thread, exclude: Option<CpuId>) -> CpuId {
    let config = config::get();
    let starting = thread
        .sched
        .last_cpu
        .or(thread.sched.curr_cpu)
        .unwrap_or(0);
    let effective = thread.sched.effective_affinity();
    let starting_cluster = cluster_of(starting);

    let mut best: Option<(CpuId, u64)> = None;
    let mut fallback: Option<(CpuId, u64)> = None;

    for cpu in search_order(starting) {
        if Some(cpu) == exclude || !effective.is_set(cpu as usize) {
            continue;
        }
        let cs = percpu::sched(cpu);
        if !cs.is_online() {
            continue;
        }
        // Placement runs both with and without a queue lock held, so
        // candidate peeks must not wait on a contended neighbor.
        let Some(rq) = cs.rq.try_lock() else {
            continue;
        };
        let (queue_time, fits) = {
            let fits = match thread.sched.discipline {
                Discipline::Fair(_) => true,
                Discipline::Deadline(ref dl) => {
                    rq.deadline_fits(dl.utilization_fp, config.cpu_utilization_ceiling_fp)
                }
            };
            (rq.predicted_queue_time_ns(), fits)
        };
        drop(rq);

        if fallback.map_or(true, |(_, t)| queue_time < t) {
            fallback = Some((cpu, queue_time));
        }
        if !fits {
            continue;
        }
        let threshold = if cluster_of(cpu) == starting_cluster {
            config.intra_cluster_threshold_ns
        } else {
            config.inter_cluster_threshold_ns
        };
        if queue_time <= threshold {
            return cpu;
        }
        if best.map_or(true, |(_, t)| queue_time < t) {
            best = Some((cpu, queue_time));
        }
    }

    if let Some((cpu, _)) = best.or(fallback) {
        return cpu;
    }
    // No online CPU in the mask; leave the thread where it last ran and let
    // hotplug sort it out.
    thread
        .sched
        .hard_affinity
        .first_set()
        .map(|cpu| cpu as CpuId)
        .unwrap_or(starting)
}

/// CPU selection with migration-hook deferral: when the chosen CPU differs
/// from the thread's last CPU and a hook is installed, the move is recorded
/// in `next_cpu` and the thread stays on its last CPU until the hook has run
/// there.
pub(crate) fn placement_target(thread: &mut Thread) -> CpuId {
    let target = find_target_cpu(thread, None);
    if thread.migrate_fn.is_some() {
        if let Some(last) = thread.sched.last_cpu {
            if last != target && thread.sched.hard_affinity.is_set(last as usize) {
                thread.sched.next_cpu = Some(target);
                ktrace!(
                    "scheduler: thread {} migration to CPU {} deferred",
                    thread.id,
                    target
                );
                return last;
            }
        }
    }
    target
}

/// Whether a thread dequeued on `cpu` must be moved before it may run.
pub(crate) fn needs_migration(thread: &Thread, cpu: CpuId) -> bool {
    if thread.sched.next_cpu.map_or(false, |next| next != cpu) {
        return true;
    }
    !thread.sched.hard_affinity.is_set(cpu as usize)
}

// ============================================================================
// Work stealing
// ============================================================================

/// Try to steal one runnable thread for `rq` (whose lock the caller holds).
///
/// Victims are scanned in search-set order; under each victim's lock the
/// scan prefers a deadline thread whose utilization is schedulable here,
/// else a fair thread, in both cases requiring matching affinity and no
/// pending migration hook. The stolen thread is re-associated with this CPU
/// without re-running arrival-time logic. Best-effort: contended victims
/// are skipped and failure just means the idle thread runs.
pub(crate) fn steal_work(
    table: &mut BTreeMap<ThreadId, Thread>,
    rq: &mut PerCpuScheduler,
    config: &SchedConfig,
) -> Option<ThreadId> {
    let this_cpu = rq.cpu;
    for victim in search_order(this_cpu) {
        if victim == this_cpu {
            continue;
        }
        let cs = percpu::sched(victim);
        if !cs.is_online() {
            continue;
        }
        let Some(mut victim_rq) = cs.rq.try_lock() else {
            continue;
        };

        let stealable = |t: &Thread| {
            t.sched.next_cpu.is_none()
                && t.migrate_fn.is_none()
                && t.sched.hard_affinity.is_set(this_cpu as usize)
        };
        let pick = victim_rq
            .deadline
            .tree
            .find_earliest_eligible_where(u64::MAX, |tid| {
                let t = &table[&tid];
                stealable(t)
                    && rq.deadline_fits(
                        t.sched.discipline.utilization_fp(),
                        config.cpu_utilization_ceiling_fp,
                    )
            })
            .or_else(|| {
                victim_rq
                    .fair
                    .tree
                    .find_earliest_eligible_where(u64::MAX, |tid| stealable(&table[&tid]))
            });

        let Some(entry) = pick else {
            continue;
        };
        let thread = table.get_mut(&entry.tid).expect("queued thread registered");
        move_thread(thread, &mut victim_rq, rq, config);
        cs.migrations_out.fetch_add(1, Ordering::Relaxed);
        percpu::sched(this_cpu)
            .steals_in
            .fetch_add(1, Ordering::Relaxed);
        kdebug!(
            "scheduler: CPU {} stole thread {} (flow {}) from CPU {}",
            this_cpu,
            entry.tid,
            thread.sched.flow_id,
            victim
        );
        return Some(entry.tid);
    }
    None
}

/// Move an active thread between two locked CPUs, carrying its start/finish
/// times over unchanged (Association placement).
pub(crate) fn move_thread(
    thread: &mut Thread,
    from: &mut PerCpuScheduler,
    to: &mut PerCpuScheduler,
    config: &SchedConfig,
) {
    debug_assert!(thread.sched.active, "moving an inactive thread");
    if thread.sched.queued {
        let tree = match thread.sched.discipline {
            Discipline::Fair(_) => &mut from.fair.tree,
            Discipline::Deadline(_) => &mut from.deadline.tree,
        };
        let removed = tree.remove(thread.id, thread.sched.start_ns);
        assert!(removed, "queued thread missing from source tree");
        thread.sched.queued = false;
    }
    match thread.sched.discipline {
        Discipline::Fair(ref fair) => {
            from.fair.account_remove(fair.weight_fp);
            to.fair.account_insert(fair.weight_fp);
        }
        Discipline::Deadline(ref dl) => {
            from.deadline.account_remove(dl.utilization_fp);
            to.deadline.account_insert(dl.utilization_fp);
        }
    }
    let estimate = thread.sched.expected_runtime.estimate_ns;
    from.total_expected_runtime_ns = from.total_expected_runtime_ns.saturating_sub(estimate);
    to.total_expected_runtime_ns += estimate;
    thread.sched.curr_cpu = Some(to.cpu);
    thread::enqueue(thread, to, 0, Placement::Association, config);
}

// ============================================================================
// Hotplug evacuation
// ============================================================================

/// Evacuate every thread without strict single-CPU affinity off `cpu`
/// (being taken offline). Pinned threads stay local; the running thread, if
/// unpinned, is flagged for active migration at its next reschedule.
/// Returns the number of threads moved.
pub fn migrate_unpinned_threads(cpu: CpuId, now_ns: u64) -> usize {
    let config = config::get();
    let mut ipi = IpiMask::new();
    let mut moved = 0;
    {
        let mut table = thread::table();
        let cs = percpu::sched(cpu);
        let mut rq = cs.rq.lock();

        let mut candidates: Vec<ThreadId> = Vec::new();
        rq.fair.tree.iter_entries(|e| candidates.push(e.tid));
        rq.deadline.tree.iter_entries(|e| candidates.push(e.tid));

        for tid in candidates {
            let thread = table.get_mut(&tid).expect("queued thread registered");
            if is_pinned(thread, cpu) {
                continue;
            }
            let target = find_target_cpu(thread, Some(cpu));
            if target == cpu {
                continue;
            }
            remove_locked(thread, &mut rq);
            let target_cs = percpu::sched(target);
            match target_cs.rq.try_lock() {
                Some(mut target_rq) => {
                    insert_locked(thread, &mut target_rq, now_ns, Placement::Insertion, &config);
                    cs.migrations_out.fetch_add(1, Ordering::Relaxed);
                    target_cs.migrations_in.fetch_add(1, Ordering::Relaxed);
                    ipi.mark(target);
                    moved += 1;
                }
                None => {
                    // Contended; keep it local and let a later pass move it.
                    insert_locked(thread, &mut rq, now_ns, Placement::Insertion, &config);
                }
            }
        }

        if let Some(current) = rq.current {
            let thread = table.get_mut(&current).expect("current thread registered");
            if !thread.idle && !is_pinned(thread, cpu) {
                let target = find_target_cpu(thread, Some(cpu));
                if target != cpu {
                    thread.sched.next_cpu = Some(target);
                }
            }
        }
        cs.set_need_resched();
        kdebug!("scheduler: evacuated {} threads from CPU {}", moved, cpu);
    }
    ipi.flush();
    moved
}

fn is_pinned(thread: &Thread, cpu: CpuId) -> bool {
    thread.sched.hard_affinity.count() == 1 && thread.sched.hard_affinity.is_set(cpu as usize)
}
