//! C4: Listener Registry.
//!
//! Tracks the subscribers waiting on the next output burst from one worker.
//! Owned exclusively by that worker's actor task, so every operation here
//! is a plain, un-locked `Vec` mutation — draining it
//! on a burst and failing it on exit are each a single atomic step from the
//! point of view of any other task, because only the actor ever touches it.

use std::time::Instant;

use tokio::sync::oneshot;

use super::{CorrelationToken, WorkerOutcome};

pub struct Listener {
    pub token: CorrelationToken,
    pub request_id: u64,
    pub registered_at: Instant,
    reply: oneshot::Sender<WorkerOutcome>,
}

#[derive(Default)]
pub struct ListenerRegistry {
    listeners: Vec<Listener>,
}

impl ListenerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, token: CorrelationToken, request_id: u64, reply: oneshot::Sender<WorkerOutcome>) {
        tracing::trace!(token, request_id, "listener registered");
        self.listeners.push(Listener {
            token,
            request_id,
            registered_at: Instant::now(),
            reply,
        });
    }

    pub fn is_empty(&self) -> bool {
        self.listeners.is_empty()
    }

    pub fn len(&self) -> usize {
        self.listeners.len()
    }

    /// Removes every listener, handing each a clone of `outcome`. A listener
    /// whose receiver was already dropped (the caller stopped waiting) is
    /// simply skipped; delivering to a closed channel is a no-op, never an
    /// error worth surfacing.
    pub fn drain_with(&mut self, make_outcome: impl Fn() -> WorkerOutcome) {
        for listener in self.listeners.drain(..) {
            tracing::trace!(token = listener.token, "delivering outcome to listener");
            let _ = listener.reply.send(make_outcome());
        }
    }
}
