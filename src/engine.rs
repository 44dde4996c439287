//! Reschedule state machine
//!
//! Every CPU is either idle or running exactly one thread. A reschedule is
//! triggered by a voluntary yield, a preemption request, the current thread
//! blocking, or the timer tick raising the pending-preempt flag. On entry
//! the CPU advances its virtual clock, charges the running thread for its
//! elapsed runtime, then decides whether that thread continues, is requeued,
//! or replaced through the dequeue order: eligible deadline thread, else
//! front of the fair queue, else a stolen thread, else the idle thread.
//!
//! A reschedule is itself the suspension point: once a context switch
//! happens, the calling stack does not resume until the thread is chosen to
//! run again. Reschedule requests for remote CPUs are coalesced and
//! delivered after all locks are dropped.

use alloc::collections::BTreeMap;
use alloc::vec::Vec;
use core::sync::atomic::Ordering;

use crate::config::{self, SchedConfig};
use crate::context;
use crate::percpu::{self, PerCpuScheduler};
use crate::queue::{deadline_arrive, ideal_time_slice_ns, scheduling_period_ns};
use crate::smp::{self, IpiMask};
use crate::thread::{self, enqueue, insert_locked, remove_locked};
use crate::types::{
    CpuId, Discipline, HandoffState, MigrateStage, Placement, Thread, ThreadId, ThreadState,
    FP_ONE, FP_SHIFT,
};
use crate::{ktrace, kwarn};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum Reason {
    Yield,
    Preempt,
    Block,
}

// ============================================================================
// Entry points
// ============================================================================

/// Voluntarily give up the CPU; the current fair thread re-arrives fresh.
pub fn yield_current(cpu: CpuId, now_ns: u64) {
    reschedule(cpu, now_ns, Reason::Yield);
}

/// Honor a pending preemption (timer expiry or reschedule IPI).
pub fn preempt(cpu: CpuId, now_ns: u64) {
    percpu::sched(cpu).check_need_resched();
    reschedule(cpu, now_ns, Reason::Preempt);
}

/// The current thread blocks on an external wait structure.
pub fn block_current(cpu: CpuId, now_ns: u64) {
    reschedule(cpu, now_ns, Reason::Block);
}

/// Timer tick: raise the pending-preempt flag once the armed preemption
/// time has been reached. Returns whether a preemption is now pending; the
/// interrupt return path then calls [`preempt`].
pub fn timer_tick(cpu: CpuId, now_ns: u64) -> bool {
    let cs = percpu::sched(cpu);
    if now_ns >= cs.preemption_target() {
        cs.set_need_resched();
        return true;
    }
    false
}

/// Absolute time the timer subsystem should arm for this CPU.
pub fn target_preemption_time(cpu: CpuId) -> u64 {
    percpu::sched(cpu).preemption_target()
}

/// Thread currently on a CPU (the idle thread included).
pub fn current_thread(cpu: CpuId) -> Option<ThreadId> {
    percpu::sched(cpu).rq.lock().current
}

/// Make a blocked thread runnable: select a CPU, insert it there, and
/// signal that CPU if the arrival should preempt what it is running.
pub fn unblock(tid: ThreadId, now_ns: u64) -> Result<(), &'static str> {
    let mut ipi = IpiMask::new();
    let result = unblock_one(tid, now_ns, &mut ipi);
    ipi.flush();
    result.map(|_| ())
}

/// Wake a batch of threads, coalescing all reschedule signals into a single
/// IPI delivery. Returns how many threads newly became runnable.
pub fn unblock_batch(tids: &[ThreadId], now_ns: u64) -> usize {
    let mut ipi = IpiMask::new();
    let mut woken = 0;
    for tid in tids {
        if unblock_one(*tid, now_ns, &mut ipi) == Ok(true) {
            woken += 1;
        }
    }
    ipi.flush();
    woken
}

/// Returns whether the thread newly became runnable.
fn unblock_one(tid: ThreadId, now_ns: u64, ipi: &mut IpiMask) -> Result<bool, &'static str> {
    let config = config::get();
    let mut table = thread::table();
    let thread = table.get_mut(&tid).ok_or("thread not found")?;
    if thread.idle {
        return Err("idle threads are not schedulable");
    }
    if thread.sched.active {
        // Already runnable or running; unblock is idempotent.
        return Ok(false);
    }
    thread.state = ThreadState::Runnable;
    let target = smp::placement_target(thread);
    let cs = percpu::sched(target);
    let mut rq = cs.rq.lock();
    insert_locked(thread, &mut rq, now_ns, Placement::Insertion, &config);

    let start_ns = thread.sched.start_ns;
    let finish_ns = thread.sched.finish_ns;
    let is_deadline = thread.sched.discipline.is_deadline();
    let signal = match rq.current {
        None => true,
        Some(current) => {
            let running = &table[&current];
            if running.idle {
                true
            } else if is_deadline {
                start_ns <= now_ns
                    && match running.sched.discipline {
                        Discipline::Fair(_) => true,
                        Discipline::Deadline(_) => finish_ns < running.sched.finish_ns,
                    }
            } else {
                running.sched.discipline.is_fair()
                    && start_ns <= rq.virtual_time_ns
                    && finish_ns < running.sched.finish_ns
            }
        }
    };
    if signal {
        cs.set_need_resched();
        ipi.mark(target);
    }
    Ok(true)
}

// ============================================================================
// The reschedule operation
// ============================================================================

fn reschedule(cpu: CpuId, now_ns: u64, reason: Reason) {
    let config = config::get();
    let cs = percpu::sched(cpu);
    let mut ipi = IpiMask::new();
    let mut switch_pair: Option<(Option<ThreadId>, ThreadId)> = None;

    {
        let mut table = thread::table();
        let mut rq = cs.rq.lock();

        // A staged performance scale takes effect at the reschedule
        // boundary so an in-flight deadline grant is never rescaled.
        rq.performance_scale_fp = rq.pending_performance_scale_fp;

        // Advance the fair clock and charge the running thread.
        let elapsed = now_ns.saturating_sub(rq.last_update_ns);
        rq.last_update_ns = now_ns;
        if rq.fair.weight_total_fp > 0 {
            rq.virtual_time_ns += elapsed;
        }

        let current = rq.current;
        let mut expired = false;
        if let Some(tid) = current {
            let thread = table.get_mut(&tid).expect("current thread registered");
            if !thread.idle {
                expired = charge_current(thread, &mut rq, elapsed, now_ns, &config);
                if reason == Reason::Yield && thread.sched.discipline.is_fair() {
                    // A yielding fair thread forfeits its remaining slice
                    // and re-arrives fresh.
                    thread.sched.time_slice_ns = 0;
                    expired = true;
                }
            }
        }

        // Does the current thread keep the CPU?
        if reason != Reason::Block && reason != Reason::Yield {
            if let Some(tid) = current {
                let thread = &table[&tid];
                if !thread.idle
                    && thread.state == ThreadState::Running
                    && !expired
                    && !smp::needs_migration(thread, cpu)
                    && !deadline_preempts(&rq, thread, now_ns)
                {
                    let target = preemption_target_for(&table, &rq, tid, now_ns);
                    rq.target_preemption_ns = target;
                    cs.publish_preemption_target(target);
                    return;
                }
            }
        }

        // The current thread gives up the CPU: requeue, migrate or drop it.
        if let Some(tid) = current {
            let thread = table.get_mut(&tid).expect("current thread registered");
            if thread.idle {
                if reason == Reason::Block {
                    kwarn!("scheduler: idle thread blocked on CPU {}", cpu);
                }
            } else if reason == Reason::Block {
                thread.state = ThreadState::Blocked;
                remove_locked(thread, &mut rq);
            } else if smp::needs_migration(thread, cpu) {
                thread.state = ThreadState::Runnable;
                if !migrate_out(thread, &mut rq, now_ns, cpu, &mut ipi, &config) {
                    // Target lock contended; stay local and retry later.
                    requeue(thread, &mut rq, now_ns, expired, &config);
                    cs.set_need_resched();
                }
            } else {
                thread.state = ThreadState::Runnable;
                requeue(thread, &mut rq, now_ns, expired, &config);
            }
        }

        // Dequeue the next thread, migrating away any thread that may not
        // run here.
        let mut deferred: Vec<ThreadId> = Vec::new();
        let next = loop {
            let picked = dequeue_deadline(&mut table, &mut rq, now_ns, &config)
                .or_else(|| dequeue_fair(&mut table, &mut rq, &config));
            match picked {
                Some(tid) => {
                    let thread = table.get_mut(&tid).expect("dequeued thread registered");
                    if thread.sched.next_cpu == Some(cpu) {
                        thread.sched.next_cpu = None;
                    }
                    if smp::needs_migration(thread, cpu) {
                        if !migrate_out(thread, &mut rq, now_ns, cpu, &mut ipi, &config) {
                            if smp::needs_migration(thread, cpu) {
                                deferred.push(tid);
                            } else {
                                break tid;
                            }
                        }
                        continue;
                    }
                    break tid;
                }
                None => {
                    if smp::steal_work(&mut table, &mut rq, &config).is_some() {
                        continue;
                    }
                    match rq.idle_thread.or(current) {
                        Some(tid) => break tid,
                        None => {
                            // Bootstrap window: nothing to run and no idle
                            // thread installed yet.
                            return;
                        }
                    }
                }
            }
        };
        for tid in deferred {
            let thread = table.get_mut(&tid).expect("deferred thread registered");
            enqueue(thread, &mut rq, now_ns, Placement::Preemption, &config);
            cs.set_need_resched();
        }

        // Fold the finished stint into the outgoing thread's estimate once
        // it is clear the CPU changes hands (or the slice expired).
        if let Some(tid) = current {
            if tid != next || expired {
                let thread = table.get_mut(&tid).expect("current thread registered");
                if !thread.idle && thread.sched.run_ns > 0 {
                    let delta = thread.sched.expected_runtime.update(
                        thread.sched.run_ns,
                        config.estimator_attack_shift,
                        config.estimator_decay_shift,
                    );
                    if thread.sched.active && thread.sched.curr_cpu == Some(cpu) {
                        rq.total_expected_runtime_ns = add_signed(rq.total_expected_runtime_ns, delta);
                    }
                    thread.sched.run_ns = 0;
                }
            }
        }

        // Install the next thread.
        let thread = table.get_mut(&next).expect("next thread registered");
        thread.state = ThreadState::Running;
        thread.sched.curr_cpu = Some(cpu);
        thread.sched.last_cpu = Some(cpu);
        if thread.sched.needs_after_migrate {
            thread.sched.needs_after_migrate = false;
            if let Some(hook) = thread.migrate_fn {
                hook(next, MigrateStage::After);
            }
        }
        rq.current = Some(next);

        let target = preemption_target_for(&table, &rq, next, now_ns);
        rq.target_preemption_ns = target;
        cs.publish_preemption_target(target);

        if current != Some(next) {
            cs.context_switches.fetch_add(1, Ordering::Relaxed);
            match reason {
                Reason::Preempt => {
                    cs.preemptions.fetch_add(1, Ordering::Relaxed);
                }
                Reason::Yield | Reason::Block => {
                    cs.voluntary_switches.fetch_add(1, Ordering::Relaxed);
                }
            }
            if let Some(prev) = current {
                let pt = table.get_mut(&prev).expect("previous thread registered");
                if pt.idle {
                    pt.state = ThreadState::Runnable;
                }
                pt.lock_state = HandoffState::HandoffPending;
            }
            ktrace!(
                "scheduler: CPU {} switches {:?} -> {}",
                cpu,
                current,
                next
            );
            switch_pair = Some((current, next));
        }
    }

    // All locks dropped: deliver coalesced IPIs, then perform the switch and
    // complete the thread-lock handoff.
    ipi.flush();
    if let Some((prev, next)) = switch_pair {
        context::switch_threads(prev, next);
    }
}

// ============================================================================
// Charging and requeueing
// ============================================================================

/// Charge the running thread for `elapsed_ns`. Returns whether its slice is
/// now expired. Fair slices are rescaled when fair demand changed since the
/// slice was computed; deadline slices are consumed at the CPU's performance
/// scale.
fn charge_current(
    thread: &mut Thread,
    rq: &mut PerCpuScheduler,
    elapsed_ns: u64,
    now_ns: u64,
    config: &SchedConfig,
) -> bool {
    thread.sched.run_ns += elapsed_ns;
    match thread.sched.discipline {
        Discipline::Fair(ref mut fair) => {
            thread.sched.time_slice_ns = thread.sched.time_slice_ns.saturating_sub(elapsed_ns);
            if rq.fair.weight_total_fp != rq.weight_snapshot_fp
                && thread.sched.time_slice_ns > 0
                && fair.initial_time_slice_ns > 0
                && rq.fair.weight_total_fp >= fair.weight_fp
            {
                let remainder_fp = ((thread.sched.time_slice_ns as u128) << FP_SHIFT)
                    / fair.initial_time_slice_ns as u128;
                rq.scheduling_period_ns = scheduling_period_ns(rq.fair.runnable, config);
                let ideal = ideal_time_slice_ns(
                    rq.scheduling_period_ns,
                    fair.weight_fp,
                    rq.fair.weight_total_fp,
                    config,
                );
                thread.sched.time_slice_ns = ((ideal as u128 * remainder_fp) >> FP_SHIFT) as u64;
                fair.initial_time_slice_ns = ideal;
                rq.weight_snapshot_fp = rq.fair.weight_total_fp;
            }
            thread.sched.time_slice_ns == 0
        }
        Discipline::Deadline(_) => {
            let scaled = ((elapsed_ns as u128 * rq.performance_scale_fp as u128) >> FP_SHIFT) as u64;
            thread.sched.time_slice_ns = thread.sched.time_slice_ns.saturating_sub(scaled);
            now_ns >= thread.sched.finish_ns
                || thread.sched.time_slice_ns <= config.deadline_slice_epsilon_ns
        }
    }
}

/// Put the displaced current thread back on its queue. Expiry means a fresh
/// arrival; otherwise the thread keeps its position (Preemption placement)
/// and banks the normalized remainder of its slice.
fn requeue(
    thread: &mut Thread,
    rq: &mut PerCpuScheduler,
    now_ns: u64,
    expired: bool,
    config: &SchedConfig,
) {
    if expired {
        enqueue(thread, rq, now_ns, Placement::Insertion, config);
        return;
    }
    if let Discipline::Fair(ref mut fair) = thread.sched.discipline {
        if fair.initial_time_slice_ns > 0 {
            let remainder_fp = ((thread.sched.time_slice_ns as u128) << FP_SHIFT)
                / fair.initial_time_slice_ns as u128;
            fair.normalized_remainder_fp = (remainder_fp as u64).min(FP_ONE);
        }
        thread.sched.banked_runtime_ns += thread.sched.time_slice_ns;
    }
    enqueue(thread, rq, now_ns, Placement::Preemption, config);
}

// ============================================================================
// Dequeue
// ============================================================================

/// Should an eligible deadline thread displace the running thread?
fn deadline_preempts(rq: &PerCpuScheduler, running: &Thread, now_ns: u64) -> bool {
    match running.sched.discipline {
        Discipline::Fair(_) => rq
            .deadline
            .tree
            .front()
            .map_or(false, |front| front.start_ns <= now_ns),
        Discipline::Deadline(_) => rq
            .deadline
            .tree
            .find_earliest_eligible(now_ns)
            .map_or(false, |entry| entry.finish_ns < running.sched.finish_ns),
    }
}

/// Dequeue the earliest-finishing eligible deadline thread. A thread whose
/// period lapsed while it waited is re-armed; if its new period starts in
/// the future it is requeued instead of run.
fn dequeue_deadline(
    table: &mut BTreeMap<ThreadId, Thread>,
    rq: &mut PerCpuScheduler,
    now_ns: u64,
    config: &SchedConfig,
) -> Option<ThreadId> {
    loop {
        let entry = rq.deadline.tree.find_earliest_eligible(now_ns)?;
        let removed = rq.deadline.tree.remove(entry.tid, entry.start_ns);
        debug_assert!(removed, "eligible entry vanished");
        let thread = table.get_mut(&entry.tid).expect("queued thread registered");
        thread.sched.queued = false;
        deadline_arrive(&mut thread.sched, now_ns, config);
        if thread.sched.start_ns <= now_ns {
            return Some(entry.tid);
        }
        // Re-armed into the future; it competes again from its new start.
        rq.deadline
            .tree
            .insert(entry.tid, thread.sched.start_ns, thread.sched.finish_ns);
        thread.sched.queued = true;
    }
}

/// Dequeue from the fair queue front and grant its time slice. The eligible
/// time is pushed up to the front's start so the queue always yields a
/// thread when non-empty.
fn dequeue_fair(
    table: &mut BTreeMap<ThreadId, Thread>,
    rq: &mut PerCpuScheduler,
    config: &SchedConfig,
) -> Option<ThreadId> {
    let front = rq.fair.tree.front()?;
    let eligible_time = rq.virtual_time_ns.max(front.start_ns);
    let entry = rq
        .fair
        .tree
        .find_earliest_eligible(eligible_time)
        .expect("front is eligible by construction");
    let removed = rq.fair.tree.remove(entry.tid, entry.start_ns);
    debug_assert!(removed, "eligible entry vanished");

    let thread = table.get_mut(&entry.tid).expect("queued thread registered");
    thread.sched.queued = false;

    rq.scheduling_period_ns = scheduling_period_ns(rq.fair.runnable, config);
    if let Discipline::Fair(ref mut fair) = thread.sched.discipline {
        let ideal = ideal_time_slice_ns(
            rq.scheduling_period_ns,
            fair.weight_fp,
            rq.fair.weight_total_fp,
            config,
        );
        let granted = if fair.normalized_remainder_fp > 0 {
            ((ideal as u128 * fair.normalized_remainder_fp as u128) >> FP_SHIFT) as u64
        } else {
            ideal
        };
        thread.sched.time_slice_ns = granted.max(config.minimum_granularity_ns);
        fair.initial_time_slice_ns = thread.sched.time_slice_ns;
        fair.normalized_remainder_fp = 0;
    }
    rq.weight_snapshot_fp = rq.fair.weight_total_fp;
    Some(entry.tid)
}

// ============================================================================
// Active migration
// ============================================================================

/// Move a dequeued thread that may not run here to its target CPU: run the
/// before-migrate hook, shift the bookkeeping, and signal the target.
/// Returns false when no move happened (contended target lock, or nowhere
/// to go — in the latter case `next_cpu` is cleared so the thread can run
/// locally).
fn migrate_out(
    thread: &mut Thread,
    rq: &mut PerCpuScheduler,
    now_ns: u64,
    cpu: CpuId,
    ipi: &mut IpiMask,
    config: &SchedConfig,
) -> bool {
    let target = thread
        .sched
        .next_cpu
        .filter(|t| *t != cpu && thread.sched.hard_affinity.is_set(*t as usize))
        .unwrap_or_else(|| smp::find_target_cpu(thread, Some(cpu)));
    if target == cpu {
        thread.sched.next_cpu = None;
        return false;
    }
    let target_cs = percpu::sched(target);
    let Some(mut target_rq) = target_cs.rq.try_lock() else {
        return false;
    };
    if let Some(hook) = thread.migrate_fn {
        hook(thread.id, MigrateStage::Before);
    }
    thread.sched.next_cpu = None;
    remove_locked(thread, rq);
    insert_locked(thread, &mut target_rq, now_ns, Placement::Insertion, config);
    thread.sched.needs_after_migrate = thread.migrate_fn.is_some();
    percpu::sched(cpu)
        .migrations_out
        .fetch_add(1, Ordering::Relaxed);
    target_cs.migrations_in.fetch_add(1, Ordering::Relaxed);
    target_cs.set_need_resched();
    ipi.mark(target);
    ktrace!(
        "scheduler: thread {} (flow {}) migrated CPU {} -> {}",
        thread.id,
        thread.sched.flow_id,
        cpu,
        target
    );
    true
}

// ============================================================================
// Preemption timing
// ============================================================================

/// When should the timer preempt the thread about to run? The slice expiry
/// (scaled to wall time for deadline threads, clamped to the period end),
/// pulled earlier to the moment any queued deadline thread becomes
/// eligible.
fn preemption_target_for(
    table: &BTreeMap<ThreadId, Thread>,
    rq: &PerCpuScheduler,
    tid: ThreadId,
    now_ns: u64,
) -> u64 {
    let thread = &table[&tid];
    // Only a *future* arrival needs the timer pulled in; an already-eligible
    // deadline thread lost the dequeue on merit and waits for the slice end.
    let next_deadline_start = rq
        .deadline
        .tree
        .front()
        .map(|front| front.start_ns)
        .filter(|start| *start > now_ns);
    if thread.idle {
        return next_deadline_start.unwrap_or(u64::MAX);
    }
    let expiry = match thread.sched.discipline {
        Discipline::Fair(_) => now_ns.saturating_add(thread.sched.time_slice_ns),
        Discipline::Deadline(_) => {
            let wall = ((thread.sched.time_slice_ns as u128 * FP_ONE as u128)
                / rq.performance_scale_fp.max(1) as u128) as u64;
            now_ns.saturating_add(wall).min(thread.sched.finish_ns)
        }
    };
    match next_deadline_start {
        Some(start) => expiry.min(start),
        None => expiry,
    }
}

fn add_signed(value: u64, delta: i64) -> u64 {
    if delta >= 0 {
        value.saturating_add(delta as u64)
    } else {
        value.saturating_sub(delta.unsigned_abs())
    }
}
