//! Context-switch seam
//!
//! The architectural switch (register save/restore, stack change, address
//! space) is owned by the embedding kernel and reached through an installed
//! hook. What the scheduler owns is the lock handoff around it: the
//! outgoing thread's lock is released only once its CPU has fully stopped
//! executing it, and the incoming thread's lock is acquired before it
//! resumes, so there is no window where the logically running thread is
//! lock-free. The handoff is an explicit three-state token on each thread
//! rather than a lock object that would have to survive a stack switch.

use core::sync::atomic::{AtomicUsize, Ordering};

use crate::thread;
use crate::types::{HandoffState, ThreadId};

/// Architectural switch hook: `(outgoing, incoming)`. Runs with no
/// scheduler locks held.
pub type SwitchHook = fn(Option<ThreadId>, ThreadId);

static SWITCH_HOOK: AtomicUsize = AtomicUsize::new(0);

/// Install the architectural context-switch hook.
pub fn set_context_switch_hook(hook: SwitchHook) {
    SWITCH_HOOK.store(hook as usize, Ordering::Release);
}

/// Perform the switch and complete the lock handoff. The outgoing thread
/// was marked `HandoffPending` under the queue lock; once the hook returns,
/// this CPU no longer executes it and its lock drops to `Unlocked` while
/// the incoming thread's lock becomes `Locked`.
pub(crate) fn switch_threads(prev: Option<ThreadId>, next: ThreadId) {
    let raw = SWITCH_HOOK.load(Ordering::Acquire);
    if raw != 0 {
        let hook: SwitchHook = unsafe { core::mem::transmute(raw) };
        hook(prev, next);
    }
    let mut table = thread::table();
    if let Some(prev) = prev {
        if let Some(thread) = table.get_mut(&prev) {
            debug_assert_eq!(thread.lock_state, HandoffState::HandoffPending);
            thread.lock_state = HandoffState::Unlocked;
        }
    }
    if let Some(thread) = table.get_mut(&next) {
        thread.lock_state = HandoffState::Locked;
    }
}
