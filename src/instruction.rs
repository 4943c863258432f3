//! The unit of work dispatched by the engine: a callback plus its
//! declared read/mutate tag sets and the pending counter that gates it.

use std::fmt;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Weak;

use rustc_hash::FxHashSet;

use crate::engine::EngineShared;
use crate::tag::Tag;

/// A nullary, one-shot action the engine invokes on the caller's
/// behalf. The engine never inspects what it captures.
pub type Callback = Box<dyn FnOnce() + Send + 'static>;

/// A unit of work plus the resources it touches.
///
/// Immutable after construction except for [`pending`](Instruction::pending),
/// which is only ever touched through atomic fetch-and-subtract, never
/// a lock.
pub(crate) struct Instruction {
    callback: parking_lot::Mutex<Option<Callback>>,
    /// Tags this instruction may read but not mutate. Disjoint from
    /// `mutate_tags` by construction: a tag in both is kept on the
    /// mutate side only.
    pub(crate) read_tags: FxHashSet<Tag>,
    pub(crate) mutate_tags: FxHashSet<Tag>,
    pending: AtomicUsize,
    engine: Weak<EngineShared>,
}

impl fmt::Debug for Instruction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Instruction")
            .field("read_tags", &self.read_tags)
            .field("mutate_tags", &self.mutate_tags)
            .field("pending", &self.pending.load(Ordering::Relaxed))
            .finish()
    }
}

impl Instruction {
    pub(crate) fn new(
        callback: Callback,
        read_tags: FxHashSet<Tag>,
        mutate_tags: FxHashSet<Tag>,
        engine: Weak<EngineShared>,
    ) -> Self {
        let pending = read_tags.union(&mutate_tags).count();
        Instruction {
            callback: parking_lot::Mutex::new(Some(callback)),
            read_tags,
            mutate_tags,
            pending: AtomicUsize::new(pending),
            engine,
        }
    }

    /// All distinct tags this instruction touches (read ∪ mutate).
    pub(crate) fn touched_tags(&self) -> impl Iterator<Item = Tag> + '_ {
        self.read_tags.union(&self.mutate_tags).copied()
    }

    /// `true` iff this instruction touches no tags at all. Such an
    /// instruction is never handed to an RSQ.
    pub(crate) fn is_empty_enqueue(&self) -> bool {
        self.read_tags.is_empty() && self.mutate_tags.is_empty()
    }

    /// Atomically decrements the pending counter. Returns `true` iff
    /// this call observed the counter transition from 1 to 0 — i.e.
    /// this caller is the one RSQ that must dispatch the callback.
    /// Exactly one RSQ ever observes this, guaranteeing exactly one
    /// dispatch per instruction.
    pub(crate) fn decrement_and_is_ready(&self) -> bool {
        self.pending.fetch_sub(1, Ordering::AcqRel) == 1
    }

    /// Runs the callback, then restores and notifies every RSQ this
    /// instruction touched. Called on whatever thread the dispatching
    /// RSQ handed the job to (worker pool slot, or a fresh
    /// per-instruction thread — see [`crate::worker`]).
    pub(crate) fn run(&self) {
        let callback = self
            .callback
            .lock()
            .take()
            .expect("Instruction::run invoked more than once");

        if let Err(panic) = catch_unwind(AssertUnwindSafe(callback)) {
            log::error!(
                "instruction callback panicked, restoring dependent resources and continuing: {:?}",
                panic_message(&panic)
            );
        }

        self.restore_and_notify();
    }

    /// Runs the callback inline on the calling thread, for the
    /// `EmptyEnqueue` case only: no RSQ was ever touched, so there is
    /// nothing to restore or notify.
    pub(crate) fn run_inline(&self) {
        debug_assert!(self.is_empty_enqueue());
        let callback = self
            .callback
            .lock()
            .take()
            .expect("Instruction::run_inline invoked more than once");
        if let Err(panic) = catch_unwind(AssertUnwindSafe(callback)) {
            log::error!(
                "empty-enqueue instruction callback panicked: {:?}",
                panic_message(&panic)
            );
        }
    }

    fn restore_and_notify(&self) {
        let Some(engine) = self.engine.upgrade() else {
            // The engine was dropped out from under an in-flight
            // callback; there is nothing left to restore.
            return;
        };
        for tag in self.touched_tags() {
            engine.restore_and_notify(tag);
        }
    }
}

fn panic_message(payload: &Box<dyn std::any::Any + Send>) -> &str {
    if let Some(s) = payload.downcast_ref::<&str>() {
        s
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.as_str()
    } else {
        "<non-string panic payload>"
    }
}
