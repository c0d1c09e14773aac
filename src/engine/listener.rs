//! Listener plumbing: match listeners, error listeners and the queue of
//! follow-up writes listeners may request.

use super::matcher::Match;
use crate::error::IntegrityIssue;
use crate::rete::Direction;
use parking_lot::Mutex;
use std::fmt;
use thiserror::Error;

/// Handle of a registered match listener
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ListenerId(pub(crate) u64);

impl fmt::Display for ListenerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "listener#{}", self.0)
    }
}

/// Receives match-set changes of one query.
///
/// Callbacks run after propagation has settled, never in the middle of it.
/// Writes to the model must go through `deferred`; they are applied once
/// every listener has seen the current batch.
pub trait MatchListener<M> {
    fn on_appeared(&mut self, matched: &Match, deferred: &mut DeferredUpdates<M>)
        -> anyhow::Result<()>;

    fn on_disappeared(
        &mut self,
        matched: &Match,
        deferred: &mut DeferredUpdates<M>,
    ) -> anyhow::Result<()>;
}

impl<M, F> MatchListener<M> for F
where
    F: FnMut(Direction, &Match, &mut DeferredUpdates<M>) -> anyhow::Result<()>,
{
    fn on_appeared(
        &mut self,
        matched: &Match,
        deferred: &mut DeferredUpdates<M>,
    ) -> anyhow::Result<()> {
        self(Direction::Insert, matched, deferred)
    }

    fn on_disappeared(
        &mut self,
        matched: &Match,
        deferred: &mut DeferredUpdates<M>,
    ) -> anyhow::Result<()> {
        self(Direction::Revoke, matched, deferred)
    }
}

/// Closure listener with its argument types pinned down for inference
pub fn match_listener<M, F>(f: F) -> F
where
    F: FnMut(Direction, &Match, &mut DeferredUpdates<M>) -> anyhow::Result<()>,
{
    f
}

/// Failures the engine cannot recover from locally
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum FatalError {
    #[error("{listener} on {query} failed: {message}")]
    ListenerFailed {
        query: String,
        listener: ListenerId,
        message: String,
    },

    #[error("{listener} on {query} panicked: {message}")]
    ListenerPanicked {
        query: String,
        listener: ListenerId,
        message: String,
    },

    /// Listener-triggered writes kept triggering further writes
    #[error("deferred updates still pending after {rounds} rounds, {dropped} dropped")]
    DeferredOverflow { rounds: usize, dropped: usize },
}

/// Receives problems found while keeping matches up to date
pub trait ErrorListener: Send + Sync {
    fn on_integrity_issue(&self, issue: &IntegrityIssue);

    fn on_fatal(&self, error: &FatalError);
}

/// Error listener that records everything it is told
#[derive(Debug, Default)]
pub struct CollectingErrorListener {
    issues: Mutex<Vec<IntegrityIssue>>,
    fatal: Mutex<Vec<FatalError>>,
}

impl CollectingErrorListener {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn issues(&self) -> Vec<IntegrityIssue> {
        self.issues.lock().clone()
    }

    pub fn fatal_errors(&self) -> Vec<FatalError> {
        self.fatal.lock().clone()
    }
}

impl ErrorListener for CollectingErrorListener {
    fn on_integrity_issue(&self, issue: &IntegrityIssue) {
        self.issues.lock().push(issue.clone());
    }

    fn on_fatal(&self, error: &FatalError) {
        self.fatal.lock().push(error.clone());
    }
}

/// Model writes requested by listeners, applied after delivery
pub struct DeferredUpdates<M> {
    pending: Vec<Box<dyn FnOnce(&mut M)>>,
}

impl<M> DeferredUpdates<M> {
    pub(crate) fn new() -> Self {
        DeferredUpdates {
            pending: Vec::new(),
        }
    }

    /// Queue a write
    pub fn push(&mut self, write: impl FnOnce(&mut M) + 'static) {
        self.pending.push(Box::new(write));
    }

    pub fn len(&self) -> usize {
        self.pending.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }

    pub(crate) fn apply(self, model: &mut M) {
        for write in self.pending {
            write(model);
        }
    }
}

impl<M> fmt::Debug for DeferredUpdates<M> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DeferredUpdates")
            .field("pending", &self.pending.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_deferred_updates_apply_in_order() {
        let mut deferred: DeferredUpdates<Vec<i32>> = DeferredUpdates::new();
        deferred.push(|v| v.push(1));
        deferred.push(|v| v.push(2));
        assert_eq!(deferred.len(), 2);
        let mut model = Vec::new();
        deferred.apply(&mut model);
        assert_eq!(model, vec![1, 2]);
    }

    #[test]
    fn test_collecting_listener() {
        let listener = CollectingErrorListener::new();
        listener.on_fatal(&FatalError::DeferredOverflow {
            rounds: 3,
            dropped: 1,
        });
        assert_eq!(listener.fatal_errors().len(), 1);
        assert!(listener.issues().is_empty());
        assert_eq!(
            listener.fatal_errors()[0].to_string(),
            "deferred updates still pending after 3 rounds, 1 dropped"
        );
    }
}
