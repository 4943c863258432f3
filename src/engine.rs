//! The top-level façade: owns the tag→RSQ table, mints tags, fans
//! pushed instructions out into their participating RSQs, and
//! starts/stops the whole engine.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use rustc_hash::{FxHashMap, FxHashSet};

use crate::error::EngineError;
use crate::instruction::{Callback, Instruction};
use crate::rsq::Rsq;
use crate::tag::{Tag, TagMinter};
use crate::worker::Dispatcher;

/// Optional knobs recognized at construction time.
#[derive(Debug, Clone, Copy, Default)]
pub struct DependencyEngineBuilder {
    worker_pool_size: Option<usize>,
    hard_stop: bool,
}

impl DependencyEngineBuilder {
    /// Starts a builder with the defaults: unbounded per-instruction
    /// worker threads, and a graceful (draining) stop.
    pub fn new() -> Self {
        Self::default()
    }

    /// Bounds the number of callbacks that may run concurrently across
    /// the whole engine. Default: unbounded (one thread per dispatch).
    pub fn worker_pool_size(mut self, size: usize) -> Self {
        self.worker_pool_size = Some(size);
        self
    }

    /// If set, `stop()` makes listeners exit without draining their
    /// remaining queue, instead of waiting for it to empty.
    pub fn hard_stop(mut self, hard_stop: bool) -> Self {
        self.hard_stop = hard_stop;
        self
    }

    /// Builds the engine. The engine starts stopped, matching the
    /// original's `DependencyEngine() : shouldStop(true)`.
    pub fn build(self) -> DependencyEngine {
        let dispatcher = match self.worker_pool_size {
            Some(size) => Dispatcher::pool(size),
            None => Dispatcher::per_instruction(),
        };
        let shared = Arc::new(EngineShared {
            tags: Mutex::new(FxHashMap::default()),
            minter: TagMinter::default(),
            should_stop: Arc::new(AtomicBool::new(true)),
            dispatcher: Arc::new(dispatcher),
            hard_stop: Arc::new(AtomicBool::new(self.hard_stop)),
        });
        DependencyEngine { shared }
    }
}

/// State shared between the public [`DependencyEngine`] handle and
/// every [`Instruction`] it has dispatched, so instructions can route
/// their post-run restore-and-notify back to the right RSQ without
/// holding a direct reference to it — avoiding an RSQ → queue →
/// instruction → RSQ ownership cycle.
pub(crate) struct EngineShared {
    tags: Mutex<FxHashMap<Tag, Arc<Rsq>>>,
    minter: TagMinter,
    should_stop: Arc<AtomicBool>,
    dispatcher: Arc<Dispatcher>,
    hard_stop: Arc<AtomicBool>,
}

impl EngineShared {
    pub(crate) fn restore_and_notify(&self, tag: Tag) {
        let rsq = self.tags.lock().get(&tag).cloned();
        if let Some(rsq) = rsq {
            rsq.restore_state();
            rsq.notify();
        }
    }
}

/// Dependency-aware execution engine. Clients mint resource [`Tag`]s
/// with [`new_variable`](Self::new_variable), submit work with
/// [`push`](Self::push), and control dispatch with
/// [`start`](Self::start)/[`stop`](Self::stop).
pub struct DependencyEngine {
    shared: Arc<EngineShared>,
}

impl Default for DependencyEngine {
    fn default() -> Self {
        DependencyEngineBuilder::new().build()
    }
}

impl DependencyEngine {
    /// Equivalent to `DependencyEngineBuilder::new().build()`.
    pub fn new() -> Self {
        Self::default()
    }

    /// Allocates a fresh [`Tag`], constructs its RSQ in the idle
    /// state with an empty queue, and — if the engine is currently
    /// running — starts its listener immediately, matching the
    /// original's `if (!shouldStop) queue->startListening();`.
    pub fn new_variable(&self) -> Tag {
        let tag = self.shared.minter.mint();
        let rsq = Rsq::new(
            tag,
            Arc::clone(&self.shared.should_stop),
            Arc::clone(&self.shared.hard_stop),
        );

        if !self.shared.should_stop.load(Ordering::Acquire) {
            rsq.start_listening(self.dispatcher_for_listeners());
        }

        self.shared.tags.lock().insert(tag, rsq);
        log::debug!("new_variable: minted {:?}", tag);
        tag
    }

    /// Submits `callback` as an instruction that may read `read_tags`
    /// and mutate `mutate_tags`. Fails with
    /// [`EngineError::UnknownTag`] if any tag was not returned by
    /// [`new_variable`](Self::new_variable) on this engine.
    ///
    /// A tag present in both sets is treated as mutate-only: it is
    /// enqueued once, on the mutate side, and the pending counter is
    /// sized to the union, not the sum.
    ///
    /// If both sets are empty, the instruction touches nothing and
    /// the callback runs inline on the calling thread before `push`
    /// returns.
    pub fn push(
        &self,
        callback: impl FnOnce() + Send + 'static,
        read_tags: impl IntoIterator<Item = Tag>,
        mutate_tags: impl IntoIterator<Item = Tag>,
    ) -> Result<(), EngineError> {
        let mutate_tags: FxHashSet<Tag> = mutate_tags.into_iter().collect();
        let read_tags: FxHashSet<Tag> = read_tags
            .into_iter()
            .filter(|t| !mutate_tags.contains(t))
            .collect();

        let tags = self.shared.tags.lock();
        for tag in read_tags.iter().chain(mutate_tags.iter()) {
            if !tags.contains_key(tag) {
                return Err(EngineError::UnknownTag(*tag));
            }
        }

        let instruction = Arc::new(Instruction::new(
            Box::new(callback) as Callback,
            read_tags,
            mutate_tags,
            Arc::downgrade(&self.shared),
        ));

        if instruction.is_empty_enqueue() {
            drop(tags);
            log::debug!("push: empty tag sets, running inline");
            instruction.run_inline();
            return Ok(());
        }

        for tag in instruction.read_tags.iter().chain(instruction.mutate_tags.iter()) {
            let rsq = tags.get(tag).expect("tag presence checked above").clone();
            rsq.push(Arc::clone(&instruction));
        }
        log::debug!(
            "push: enqueued instruction touching {} tag(s)",
            instruction.read_tags.len() + instruction.mutate_tags.len()
        );
        Ok(())
    }

    /// Clears the stop flag and starts the listener of every RSQ not
    /// already running.
    pub fn start(&self) {
        self.shared.should_stop.store(false, Ordering::Release);
        let dispatcher = self.dispatcher_for_listeners();
        for rsq in self.shared.tags.lock().values() {
            rsq.start_listening(Arc::clone(&dispatcher));
        }
        log::debug!("start: engine running");
    }

    /// Sets the stop flag, wakes every listener so it observes it, and
    /// blocks until every listener and every in-flight callback has
    /// returned. Idempotent: calling `stop()` while already stopped is
    /// a no-op beyond re-joining (already-empty) thread sets.
    pub fn stop(&self) {
        self.shared.should_stop.store(true, Ordering::Release);

        let rsqs: Vec<Arc<Rsq>> = self.shared.tags.lock().values().cloned().collect();
        for rsq in &rsqs {
            rsq.notify();
        }
        for rsq in &rsqs {
            rsq.join_listener();
        }
        self.shared.dispatcher.join_all();
        log::debug!("stop: engine drained");
    }

    fn dispatcher_for_listeners(&self) -> Arc<Dispatcher> {
        Arc::clone(&self.shared.dispatcher)
    }
}

impl Drop for DependencyEngine {
    fn drop(&mut self) {
        self.stop();
    }
}
