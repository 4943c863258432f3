//! Where dispatched instructions actually run.
//!
//! Two strategies are supported: a fresh thread per dispatched
//! instruction (simplest, unbounded concurrency), and a fixed pool of
//! worker threads pulling from a shared ready queue (bounded
//! concurrency, fewer thread spawns under load). `stop()` must wait
//! for every in-flight callback either way. This module offers both
//! behind one [`Dispatcher`] so [`crate::engine`] does not need to
//! care which is in effect.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;

use parking_lot::{Condvar, Mutex};

use crate::instruction::Instruction;

/// Picks how dispatched instructions are run.
pub(crate) enum Dispatcher {
    /// One `std::thread` per dispatched instruction, tracked so they
    /// can all be joined on `stop()`. The default.
    PerInstruction(Mutex<Vec<JoinHandle<()>>>),
    /// A fixed number of long-lived worker threads pulling from a
    /// shared FIFO job queue.
    Pool(WorkerPool),
}

impl Dispatcher {
    pub(crate) fn per_instruction() -> Self {
        Dispatcher::PerInstruction(Mutex::new(Vec::new()))
    }

    pub(crate) fn pool(size: usize) -> Self {
        Dispatcher::Pool(WorkerPool::new(size))
    }

    pub(crate) fn dispatch(&self, instruction: Arc<Instruction>) {
        match self {
            Dispatcher::PerInstruction(handles) => {
                let handle = std::thread::Builder::new()
                    .name("depengine-worker".to_owned())
                    .spawn(move || instruction.run())
                    .expect("failed to spawn worker thread");
                handles.lock().push(handle);
            }
            Dispatcher::Pool(pool) => pool.submit(instruction),
        }
    }

    /// Blocks until every callback dispatched so far has returned.
    pub(crate) fn join_all(&self) {
        match self {
            Dispatcher::PerInstruction(handles) => {
                // Threads may still be being pushed onto this vector
                // by listeners racing to exit; draining in a loop
                // until empty ensures none are missed.
                loop {
                    let handle = handles.lock().pop();
                    match handle {
                        Some(handle) => {
                            if let Err(panic) = handle.join() {
                                log::error!("worker thread panicked: {:?}", panic);
                            }
                        }
                        None => break,
                    }
                }
            }
            Dispatcher::Pool(pool) => pool.join_all(),
        }
    }
}

pub(crate) struct WorkerPool {
    jobs: Arc<Mutex<VecDeque<Arc<Instruction>>>>,
    jobs_activity: Arc<Condvar>,
    shutdown: Arc<AtomicBool>,
    workers: Mutex<Vec<JoinHandle<()>>>,
}

impl WorkerPool {
    fn new(size: usize) -> Self {
        assert!(size > 0, "worker pool size must be non-zero");
        let jobs = Arc::new(Mutex::new(VecDeque::<Arc<Instruction>>::new()));
        let jobs_activity = Arc::new(Condvar::new());
        let shutdown = Arc::new(AtomicBool::new(false));
        let mut workers = Vec::with_capacity(size);

        for index in 0..size {
            let jobs = Arc::clone(&jobs);
            let jobs_activity = Arc::clone(&jobs_activity);
            let shutdown = Arc::clone(&shutdown);
            workers.push(
                std::thread::Builder::new()
                    .name(format!("depengine-pool-{index}"))
                    .spawn(move || worker_loop(jobs, jobs_activity, shutdown))
                    .expect("failed to spawn pool worker thread"),
            );
        }

        WorkerPool {
            jobs,
            jobs_activity,
            shutdown,
            workers: Mutex::new(workers),
        }
    }

    fn submit(&self, instruction: Arc<Instruction>) {
        self.jobs.lock().push_back(instruction);
        self.jobs_activity.notify_one();
    }

    fn join_all(&self) {
        self.shutdown.store(true, Ordering::Release);
        self.jobs_activity.notify_all();
        for handle in self.workers.lock().drain(..) {
            if let Err(panic) = handle.join() {
                log::error!("pool worker panicked: {:?}", panic);
            }
        }
    }
}

fn worker_loop(
    jobs: Arc<Mutex<VecDeque<Arc<Instruction>>>>,
    jobs_activity: Arc<Condvar>,
    shutdown: Arc<AtomicBool>,
) {
    loop {
        let instruction = {
            let mut guard = jobs.lock();
            loop {
                if let Some(instruction) = guard.pop_front() {
                    break Some(instruction);
                }
                if shutdown.load(Ordering::Acquire) {
                    break None;
                }
                jobs_activity.wait(&mut guard);
            }
        };
        match instruction {
            Some(instruction) => instruction.run(),
            None => return,
        }
    }
}
