//! Error types surfaced at the engine's API boundary.
//!
//! Internal invariant violations (illegal [`crate::rsq`] state
//! transitions) are not represented here: they are a logic bug in the
//! engine itself, not a condition a caller can recover from, and are
//! reported by panicking rather than by a `Result`. See
//! `RSQ::to_state` and `RSQ::restore_state`.

use std::fmt;

use crate::tag::Tag;

/// Errors recoverable at the public API surface.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum EngineError {
    /// `push` named a tag that was never returned by
    /// [`DependencyEngine::new_variable`](crate::DependencyEngine::new_variable).
    UnknownTag(Tag),
}

impl fmt::Display for EngineError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            EngineError::UnknownTag(tag) => {
                write!(f, "tag {:?} was not minted by this engine's new_variable", tag)
            }
        }
    }
}

impl std::error::Error for EngineError {}
