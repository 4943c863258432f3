#![warn(rust_2018_idioms)]
#![warn(missing_docs)]

//! A dependency-aware execution engine for resource-tagged instruction
//! graphs, in the spirit of the dispatch layer found in dynamic
//! dataflow frameworks.
//!
//! Clients [mint tags](DependencyEngine::new_variable) for the
//! logical resources they care about, then
//! [`push`](DependencyEngine::push) callbacks annotated with the tags
//! they read and the tags they mutate. The engine runs callbacks
//! concurrently while preserving the illusion of sequential program
//! order with respect to read-after-write, write-after-read and
//! write-after-write conflicts on every individual tag — reads of the
//! same tag may run in parallel, any mutation is serialized against
//! both reads and other mutations of that tag.
//!
//! ```
//! use depengine::DependencyEngine;
//! use std::sync::{Arc, Mutex};
//!
//! let engine = DependencyEngine::new();
//! engine.start();
//!
//! let x = engine.new_variable();
//! let log = Arc::new(Mutex::new(Vec::new()));
//!
//! let log1 = Arc::clone(&log);
//! engine.push(move || log1.lock().unwrap().push("mutate"), [], [x]).unwrap();
//! let log2 = Arc::clone(&log);
//! engine.push(move || log2.lock().unwrap().push("read"), [x], []).unwrap();
//!
//! engine.stop();
//! assert_eq!(*log.lock().unwrap(), vec!["mutate", "read"]);
//! ```
//!
//! # Scope
//!
//! This crate implements only the dispatch core: the per-resource
//! state machine, the cross-resource pending counter, and the
//! post-execution restore-and-notify protocol. It does not schedule
//! by priority, persist state, distribute across machines, cancel
//! in-flight work, or detect deadlocks from cyclic cross-instruction
//! waits — see `DESIGN.md` for the full non-goals list.

mod engine;
mod error;
mod instruction;
mod rsq;
mod tag;
mod worker;

pub use crate::engine::{DependencyEngine, DependencyEngineBuilder};
pub use crate::error::EngineError;
pub use crate::tag::Tag;
