//! Thread registry and scheduling lifecycle
//!
//! The global registry owns the scheduler's view of every thread, keyed by
//! thread id. Run-queue trees store ids only; migration is strictly
//! remove-then-insert, so a thread is a member of at most one queue at any
//! time.
//!
//! Insert and remove are idempotent through the per-thread `active` flag:
//! they toggle bookkeeping exactly once per logical runnable/blocked
//! transition no matter how often they are called.

use alloc::collections::BTreeMap;
use core::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use lazy_static::lazy_static;
use spin::{Mutex, MutexGuard};

use crate::config::{self, SchedConfig};
use crate::percpu::{self, PerCpuScheduler};
use crate::queue::{deadline_arrive, fair_arrive, scheduling_period_ns};
use crate::types::{
    priority_to_weight, CpuId, CpuMask, DeadlineParams, DeadlineState, Discipline, ExpectedRuntime,
    FairState, HandoffState, Placement, SchedulerState, Thread, ThreadId, ThreadState,
};
use crate::{kdebug, kinfo};

/// Default ordinal priority for fair threads.
pub const DEFAULT_PRIORITY: u8 = 16;

lazy_static! {
    static ref THREAD_TABLE: Mutex<BTreeMap<ThreadId, Thread>> = Mutex::new(BTreeMap::new());
}

static FLOW_ID: AtomicU64 = AtomicU64::new(1);

/// Hook invoked when a blocked thread's effective priority changes, so the
/// wait structure holding it can re-propagate inheritance.
static PRIORITY_PROPAGATE_HOOK: AtomicUsize = AtomicUsize::new(0);

/// Lock the registry. Lock order: registry before any queue lock.
pub(crate) fn table() -> MutexGuard<'static, BTreeMap<ThreadId, Thread>> {
    THREAD_TABLE.lock()
}

/// Drop every registered thread. Called from `topology::init`.
pub(crate) fn reset_registry() {
    THREAD_TABLE.lock().clear();
    FLOW_ID.store(1, Ordering::Relaxed);
}

/// Install the priority re-propagation hook for blocked threads.
pub fn set_priority_propagate_hook(hook: fn(ThreadId, u8)) {
    PRIORITY_PROPAGATE_HOOK.store(hook as usize, Ordering::Release);
}

fn propagate_priority(tid: ThreadId, priority: u8) {
    let raw = PRIORITY_PROPAGATE_HOOK.load(Ordering::Acquire);
    if raw != 0 {
        let hook: fn(ThreadId, u8) = unsafe { core::mem::transmute(raw) };
        hook(tid, priority);
    }
}

/// Read-only access to a thread's scheduler view.
pub fn with_thread<R>(tid: ThreadId, f: impl FnOnce(&Thread) -> R) -> Option<R> {
    let table = THREAD_TABLE.lock();
    table.get(&tid).map(f)
}

// ============================================================================
// Thread initialization and teardown
// ============================================================================

/// Register a fair thread. The thread starts blocked; `unblock` makes it
/// runnable and places it on a CPU.
pub fn initialize_thread(tid: ThreadId, name: &'static str, priority: u8) -> Result<(), &'static str> {
    let discipline = Discipline::Fair(FairState::new(priority_to_weight(priority)));
    register(tid, name, priority, discipline)?;
    kinfo!("scheduler: added thread {} '{}' priority {}", tid, name, priority);
    Ok(())
}

/// Register a deadline thread with the supplied parameters.
pub fn initialize_thread_deadline(
    tid: ThreadId,
    name: &'static str,
    params: DeadlineParams,
) -> Result<(), &'static str> {
    if params.capacity_ns == 0 || params.deadline_ns < params.capacity_ns {
        return Err("malformed deadline parameters");
    }
    if params.utilization_fp() > config::get().max_thread_utilization_fp {
        return Err("deadline utilization exceeds per-thread limit");
    }
    let discipline = Discipline::Deadline(DeadlineState::new(params));
    register(tid, name, DEFAULT_PRIORITY, discipline)?;
    kinfo!(
        "scheduler: added deadline thread {} '{}' capacity {}ns period {}ns",
        tid,
        name,
        params.capacity_ns,
        params.deadline_ns
    );
    Ok(())
}

fn register(
    tid: ThreadId,
    name: &'static str,
    priority: u8,
    discipline: Discipline,
) -> Result<(), &'static str> {
    let mut table = THREAD_TABLE.lock();
    if table.contains_key(&tid) {
        return Err("thread already registered");
    }
    let flow_id = FLOW_ID.fetch_add(1, Ordering::Relaxed);
    let mut sched = SchedulerState::new(discipline, flow_id);
    // Until real samples arrive, a fresh thread predicts one granule of
    // queue time so placement spreads arrivals instead of stacking them.
    sched.expected_runtime = ExpectedRuntime::new(config::get().minimum_granularity_ns);
    table.insert(
        tid,
        Thread {
            id: tid,
            name,
            state: ThreadState::Blocked,
            base_priority: priority,
            inherited_priority: None,
            idle: false,
            sched,
            migrate_fn: None,
            lock_state: HandoffState::Unlocked,
        },
    );
    Ok(())
}

/// Register the bootstrap thread already running on `cpu`. It contributes
/// weight to the CPU's fair bookkeeping immediately; `remove_first_thread`
/// unwinds that contribution when the thread retires into the idle role.
pub fn initialize_first_thread(tid: ThreadId, name: &'static str, cpu: CpuId) -> Result<(), &'static str> {
    register(
        tid,
        name,
        DEFAULT_PRIORITY,
        Discipline::Fair(FairState::new(priority_to_weight(DEFAULT_PRIORITY))),
    )?;
    let mut table = THREAD_TABLE.lock();
    let thread = table.get_mut(&tid).expect("just registered");
    let mut rq = percpu::sched(cpu).rq.lock();
    assert!(rq.current.is_none(), "first thread on an occupied CPU");
    thread.state = ThreadState::Running;
    thread.lock_state = HandoffState::Locked;
    thread.sched.active = true;
    thread.sched.curr_cpu = Some(cpu);
    thread.sched.last_cpu = Some(cpu);
    thread.sched.hard_affinity = CpuMask::single(cpu);
    rq.fair.account_insert(thread.sched.discipline.weight_fp());
    rq.total_expected_runtime_ns += thread.sched.expected_runtime.estimate_ns;
    rq.current = Some(tid);
    kinfo!("scheduler: first thread {} '{}' on CPU {}", tid, name, cpu);
    Ok(())
}

/// Retire the bootstrap thread into the CPU's idle thread: unwind its
/// temporary weight contribution and install it as the dequeue fallback.
pub fn remove_first_thread(tid: ThreadId) -> Result<(), &'static str> {
    let mut table = THREAD_TABLE.lock();
    let thread = table.get_mut(&tid).ok_or("thread not found")?;
    if thread.idle || !thread.sched.active {
        return Err("not an active first thread");
    }
    let cpu = thread.sched.curr_cpu.ok_or("first thread has no CPU")?;
    let mut rq = percpu::sched(cpu).rq.lock();
    if rq.current != Some(tid) {
        return Err("first thread is not current");
    }
    rq.fair.account_remove(thread.sched.discipline.weight_fp());
    rq.total_expected_runtime_ns = rq
        .total_expected_runtime_ns
        .saturating_sub(thread.sched.expected_runtime.estimate_ns);
    thread.sched.active = false;
    thread.idle = true;
    rq.idle_thread = Some(tid);
    kinfo!("scheduler: thread {} becomes CPU {} idle thread", tid, cpu);
    Ok(())
}

/// Tear down a thread's scheduling state. The thread must not be running.
pub fn destroy_thread(tid: ThreadId) -> Result<(), &'static str> {
    let mut table = THREAD_TABLE.lock();
    let thread = table.get_mut(&tid).ok_or("thread not found")?;
    if thread.state == ThreadState::Running {
        return Err("thread is running");
    }
    if thread.sched.active {
        let cpu = thread.sched.curr_cpu.expect("active thread has a CPU");
        let mut rq = percpu::sched(cpu).rq.lock();
        remove_locked(thread, &mut rq);
    }
    table.remove(&tid);
    kinfo!("scheduler: removed thread {}", tid);
    Ok(())
}

// ============================================================================
// Queue membership (called with registry + queue locks held)
// ============================================================================

/// Place a thread in the run-queue tree matching its discipline. `Insertion`
/// runs the discipline's arrival computation; every other placement carries
/// the existing start/finish times.
pub(crate) fn enqueue(
    thread: &mut Thread,
    rq: &mut PerCpuScheduler,
    now_ns: u64,
    placement: Placement,
    config: &SchedConfig,
) {
    debug_assert!(!thread.sched.queued, "thread already queued");
    if placement == Placement::Insertion {
        match thread.sched.discipline {
            Discipline::Fair(_) => {
                rq.scheduling_period_ns = scheduling_period_ns(rq.fair.runnable, config);
                fair_arrive(&mut thread.sched, rq.virtual_time_ns, rq.scheduling_period_ns);
            }
            Discipline::Deadline(_) => deadline_arrive(&mut thread.sched, now_ns, config),
        }
    }
    let tree = match thread.sched.discipline {
        Discipline::Fair(_) => &mut rq.fair.tree,
        Discipline::Deadline(_) => &mut rq.deadline.tree,
    };
    tree.insert(thread.id, thread.sched.start_ns, thread.sched.finish_ns);
    thread.sched.queued = true;
    thread.sched.generation += 1;
}

/// Idempotent insert: account the thread on this CPU and queue it. Called
/// with the registry lock and `rq`'s lock held.
pub(crate) fn insert_locked(
    thread: &mut Thread,
    rq: &mut PerCpuScheduler,
    now_ns: u64,
    placement: Placement,
    config: &SchedConfig,
) {
    if thread.sched.active {
        return;
    }
    thread.sched.active = true;
    thread.sched.curr_cpu = Some(rq.cpu);
    rq.total_expected_runtime_ns += thread.sched.expected_runtime.estimate_ns;
    match thread.sched.discipline {
        Discipline::Fair(ref fair) => rq.fair.account_insert(fair.weight_fp),
        Discipline::Deadline(ref dl) => rq.deadline.account_insert(dl.utilization_fp),
    }
    enqueue(thread, rq, now_ns, placement, config);
}

/// Idempotent remove: unwind the aggregates of `insert_locked` and drop the
/// thread from its tree if queued. Fair start/finish reset to zero; a
/// deadline thread keeps its period so a later arrival chains correctly.
pub(crate) fn remove_locked(thread: &mut Thread, rq: &mut PerCpuScheduler) {
    if !thread.sched.active {
        return;
    }
    thread.sched.active = false;
    if thread.sched.queued {
        let tree = match thread.sched.discipline {
            Discipline::Fair(_) => &mut rq.fair.tree,
            Discipline::Deadline(_) => &mut rq.deadline.tree,
        };
        let removed = tree.remove(thread.id, thread.sched.start_ns);
        assert!(removed, "active queued thread missing from tree");
        thread.sched.queued = false;
    }
    match thread.sched.discipline {
        Discipline::Fair(ref fair) => rq.fair.account_remove(fair.weight_fp),
        Discipline::Deadline(ref dl) => rq.deadline.account_remove(dl.utilization_fp),
    }
    rq.total_expected_runtime_ns = rq
        .total_expected_runtime_ns
        .saturating_sub(thread.sched.expected_runtime.estimate_ns);
    if thread.sched.discipline.is_fair() {
        thread.sched.start_ns = 0;
        thread.sched.finish_ns = 0;
    }
    thread.sched.curr_cpu = None;
}

// ============================================================================
// Affinity
// ============================================================================

/// Set the hard affinity mask: the CPUs the thread may ever run on.
pub fn set_affinity(tid: ThreadId, mask: CpuMask) -> Result<(), &'static str> {
    if mask.is_empty() {
        return Err("empty affinity mask");
    }
    let mut table = THREAD_TABLE.lock();
    let thread = table.get_mut(&tid).ok_or("thread not found")?;
    thread.sched.hard_affinity = mask;
    kdebug!("scheduler: thread {} hard affinity updated", tid);
    if let Some(cpu) = thread.sched.curr_cpu {
        if !mask.is_set(cpu as usize) {
            // The next reschedule on that CPU migrates it off.
            percpu::sched(cpu).set_need_resched();
        }
    }
    Ok(())
}

/// Set the soft affinity mask: the preferred subset of the hard mask.
pub fn set_soft_affinity(tid: ThreadId, mask: CpuMask) -> Result<(), &'static str> {
    let mut table = THREAD_TABLE.lock();
    let thread = table.get_mut(&tid).ok_or("thread not found")?;
    thread.sched.soft_affinity = mask;
    Ok(())
}

/// Install a migration hook; the thread is only moved between CPUs actively,
/// after the hook has run on the source CPU.
pub fn set_migrate_fn(tid: ThreadId, hook: Option<crate::types::MigrateFn>) -> Result<(), &'static str> {
    let mut table = THREAD_TABLE.lock();
    let thread = table.get_mut(&tid).ok_or("thread not found")?;
    thread.migrate_fn = hook;
    Ok(())
}

// ============================================================================
// Priority and deadline changes
// ============================================================================

/// Change a thread's base priority. A deadline thread reverts to the fair
/// discipline as a forced fresh arrival.
pub fn change_priority(tid: ThreadId, priority: u8) -> Result<(), &'static str> {
    let config = config::get();
    let mut table = THREAD_TABLE.lock();
    let thread = table.get_mut(&tid).ok_or("thread not found")?;
    thread.base_priority = priority;
    apply_fair_weight(thread, &config);
    Ok(())
}

/// Donate (or with `None`, revoke) an inherited priority. The effective
/// priority is the max of base and inherited. Deadline threads are treated
/// as maximal for inheritance purposes: the donation is recorded but does
/// not reorder them.
pub fn inherit_priority(tid: ThreadId, priority: Option<u8>) -> Result<(), &'static str> {
    let config = config::get();
    let mut table = THREAD_TABLE.lock();
    let thread = table.get_mut(&tid).ok_or("thread not found")?;
    thread.inherited_priority = priority;
    if thread.sched.discipline.is_deadline() {
        if thread.state == ThreadState::Blocked {
            let effective = thread.effective_priority();
            propagate_priority(tid, effective);
        }
        return Ok(());
    }
    apply_fair_weight(thread, &config);
    Ok(())
}

/// Recompute the fair weight from the effective priority and requeue if the
/// thread is live. Converts a deadline thread back to fair.
fn apply_fair_weight(thread: &mut Thread, config: &SchedConfig) {
    let effective = thread.effective_priority();
    let new_weight = priority_to_weight(effective);
    let switching = thread.sched.discipline.is_deadline();
    if !switching {
        if thread.sched.discipline.weight_fp() == new_weight {
            return;
        }
    }

    if !thread.sched.active {
        thread.sched.discipline = Discipline::Fair(FairState::new(new_weight));
        if switching {
            thread.sched.start_ns = 0;
            thread.sched.finish_ns = 0;
            thread.sched.time_slice_ns = 0;
        }
        if thread.state == ThreadState::Blocked {
            propagate_priority(thread.id, effective);
        }
        return;
    }

    let cpu = thread.sched.curr_cpu.expect("active thread has a CPU");
    let mut rq = percpu::sched(cpu).rq.lock();
    let was_queued = thread.sched.queued;

    // Remove from the old tree and unwind the old discipline's aggregates.
    if was_queued {
        let tree = match thread.sched.discipline {
            Discipline::Fair(_) => &mut rq.fair.tree,
            Discipline::Deadline(_) => &mut rq.deadline.tree,
        };
        tree.remove(thread.id, thread.sched.start_ns);
        thread.sched.queued = false;
    }
    match thread.sched.discipline {
        Discipline::Fair(ref fair) => rq.fair.account_remove(fair.weight_fp),
        Discipline::Deadline(ref dl) => rq.deadline.account_remove(dl.utilization_fp),
    }

    thread.sched.discipline = Discipline::Fair(FairState::new(new_weight));
    if switching {
        // Forced fresh arrival: the old timeline has no meaning for the new
        // discipline.
        thread.sched.start_ns = 0;
        thread.sched.finish_ns = 0;
        thread.sched.time_slice_ns = 0;
    }
    rq.fair.account_insert(new_weight);

    if was_queued {
        if switching {
            rq.scheduling_period_ns = scheduling_period_ns(rq.fair.runnable, config);
            fair_arrive(&mut thread.sched, rq.virtual_time_ns, rq.scheduling_period_ns);
        }
        enqueue(thread, &mut rq, 0, Placement::Adjustment, config);
    }
    kdebug!(
        "scheduler: thread {} reweighted to priority {} (weight {:#x})",
        thread.id,
        effective,
        new_weight
    );
}

/// Re-parameterize a thread as (or within) the deadline discipline.
pub fn change_deadline(tid: ThreadId, params: DeadlineParams, now_ns: u64) -> Result<(), &'static str> {
    if params.capacity_ns == 0 || params.deadline_ns < params.capacity_ns {
        return Err("malformed deadline parameters");
    }
    let config = config::get();
    if params.utilization_fp() > config.max_thread_utilization_fp {
        return Err("deadline utilization exceeds per-thread limit");
    }
    let mut table = THREAD_TABLE.lock();
    let thread = table.get_mut(&tid).ok_or("thread not found")?;
    let switching = thread.sched.discipline.is_fair();
    let new_state = DeadlineState::new(params);

    if !thread.sched.active {
        thread.sched.discipline = Discipline::Deadline(new_state);
        if switching {
            thread.sched.start_ns = 0;
            thread.sched.finish_ns = 0;
            thread.sched.time_slice_ns = 0;
        }
        if thread.state == ThreadState::Blocked {
            propagate_priority(tid, crate::types::MAX_PRIORITY);
        }
        return Ok(());
    }

    let cpu = thread.sched.curr_cpu.expect("active thread has a CPU");
    let mut rq = percpu::sched(cpu).rq.lock();
    let was_queued = thread.sched.queued;

    if was_queued {
        let tree = match thread.sched.discipline {
            Discipline::Fair(_) => &mut rq.fair.tree,
            Discipline::Deadline(_) => &mut rq.deadline.tree,
        };
        tree.remove(thread.id, thread.sched.start_ns);
        thread.sched.queued = false;
    }
    match thread.sched.discipline {
        Discipline::Fair(ref fair) => rq.fair.account_remove(fair.weight_fp),
        Discipline::Deadline(ref dl) => rq.deadline.account_remove(dl.utilization_fp),
    }

    thread.sched.discipline = Discipline::Deadline(new_state);
    if switching {
        thread.sched.start_ns = 0;
        thread.sched.finish_ns = 0;
        thread.sched.time_slice_ns = 0;
    }
    rq.deadline.account_insert(new_state.utilization_fp);

    if was_queued {
        if switching {
            deadline_arrive(&mut thread.sched, now_ns, &config);
        }
        enqueue(thread, &mut rq, now_ns, Placement::Adjustment, &config);
    }
    kdebug!(
        "scheduler: thread {} deadline set to {}ns/{}ns",
        tid,
        params.capacity_ns,
        params.deadline_ns
    );
    Ok(())
}
