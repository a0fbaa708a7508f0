//! Reply-inbox router for correlated request/reply between workflows.
//!
//! When workflow A invokes workflow B, A registers a single-slot inbox
//! under a fresh `invoke_id` and suspends on it; B posts its result
//! under the same key on completion. The slot guarantees at-most-once
//! delivery: the second post for an `invoke_id` is rejected, and the
//! slot is cleared once the waiter has consumed the reply.
//!
//! Cancellation propagates through a flag on the slot that the callee
//! can poll via [`InboxRouter::is_cancelled`].

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use miette::Diagnostic;
use rustc_hash::FxHashMap;
use serde_json::Value;
use thiserror::Error;
use tokio::sync::oneshot;

/// Errors from inbox registration, posting, and waiting.
#[derive(Debug, Error, Diagnostic)]
pub enum InboxError {
    #[error("invoke id `{invoke_id}` is already registered")]
    #[diagnostic(
        code(replayweave::inbox::already_registered),
        help("Invoke ids must be fresh per cross-workflow call.")
    )]
    AlreadyRegistered { invoke_id: String },

    #[error("no inbox registered for invoke id `{invoke_id}`")]
    #[diagnostic(code(replayweave::inbox::not_registered))]
    NotRegistered { invoke_id: String },

    #[error("reply for invoke id `{invoke_id}` was already delivered")]
    #[diagnostic(code(replayweave::inbox::already_delivered))]
    AlreadyDelivered { invoke_id: String },

    #[error("timed out waiting for reply to invoke id `{invoke_id}`")]
    #[diagnostic(code(replayweave::inbox::timeout))]
    Timeout { invoke_id: String },

    #[error("inbox for invoke id `{invoke_id}` was dropped before delivery")]
    #[diagnostic(code(replayweave::inbox::closed))]
    Closed { invoke_id: String },
}

struct Slot {
    sender: Option<oneshot::Sender<Value>>,
    delivered: bool,
    cancelled: Arc<AtomicBool>,
}

/// Routes correlated replies to waiting steps.
#[derive(Default)]
pub struct InboxRouter {
    slots: Mutex<FxHashMap<String, Slot>>,
}

impl InboxRouter {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, FxHashMap<String, Slot>> {
        match self.slots.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    /// Register a fresh single-slot inbox and get the waiter half.
    pub fn register(self: &Arc<Self>, invoke_id: &str) -> Result<ReplyWaiter, InboxError> {
        let mut slots = self.lock();
        if slots.contains_key(invoke_id) {
            return Err(InboxError::AlreadyRegistered {
                invoke_id: invoke_id.to_string(),
            });
        }
        let (tx, rx) = oneshot::channel();
        let cancelled = Arc::new(AtomicBool::new(false));
        slots.insert(
            invoke_id.to_string(),
            Slot {
                sender: Some(tx),
                delivered: false,
                cancelled: Arc::clone(&cancelled),
            },
        );
        Ok(ReplyWaiter {
            invoke_id: invoke_id.to_string(),
            receiver: rx,
            router: Arc::clone(self),
        })
    }

    /// Post the callee's result. At-most-once: a second post for the
    /// same invoke id is rejected.
    pub fn post(&self, invoke_id: &str, value: Value) -> Result<(), InboxError> {
        let mut slots = self.lock();
        let slot = slots
            .get_mut(invoke_id)
            .ok_or_else(|| InboxError::NotRegistered {
                invoke_id: invoke_id.to_string(),
            })?;
        if slot.delivered {
            return Err(InboxError::AlreadyDelivered {
                invoke_id: invoke_id.to_string(),
            });
        }
        let sender = slot.sender.take().ok_or_else(|| InboxError::AlreadyDelivered {
            invoke_id: invoke_id.to_string(),
        })?;
        slot.delivered = true;
        // A waiter that already gave up (timeout) drops its receiver;
        // the reply is then discarded, which is the documented
        // at-most-once outcome.
        let _ = sender.send(value);
        Ok(())
    }

    /// Flag the invocation as cancelled; the callee observes it via
    /// [`Self::is_cancelled`].
    pub fn cancel(&self, invoke_id: &str) -> Result<(), InboxError> {
        let slots = self.lock();
        let slot = slots
            .get(invoke_id)
            .ok_or_else(|| InboxError::NotRegistered {
                invoke_id: invoke_id.to_string(),
            })?;
        slot.cancelled.store(true, Ordering::SeqCst);
        Ok(())
    }

    /// Whether the caller cancelled this invocation. Unknown ids read
    /// as not cancelled (the slot may already be cleared).
    #[must_use]
    pub fn is_cancelled(&self, invoke_id: &str) -> bool {
        self.lock()
            .get(invoke_id)
            .map(|s| s.cancelled.load(Ordering::SeqCst))
            .unwrap_or(false)
    }

    /// Number of live slots (delivered-but-unconsumed included).
    #[must_use]
    pub fn len(&self) -> usize {
        self.lock().len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    fn clear(&self, invoke_id: &str) {
        self.lock().remove(invoke_id);
    }
}

/// Waiter half of a registered inbox slot.
pub struct ReplyWaiter {
    invoke_id: String,
    receiver: oneshot::Receiver<Value>,
    router: Arc<InboxRouter>,
}

impl ReplyWaiter {
    #[must_use]
    pub fn invoke_id(&self) -> &str {
        &self.invoke_id
    }

    /// Give up without waiting; clears the slot so late replies are
    /// rejected as unregistered.
    pub fn abandon(self) {
        self.router.clear(&self.invoke_id);
    }

    /// Suspend until the reply arrives or the deadline passes. The
    /// slot is cleared on every exit path.
    pub async fn wait(self, timeout: Duration) -> Result<Value, InboxError> {
        let result = tokio::time::timeout(timeout, self.receiver).await;
        self.router.clear(&self.invoke_id);
        match result {
            Ok(Ok(value)) => Ok(value),
            Ok(Err(_)) => Err(InboxError::Closed {
                invoke_id: self.invoke_id,
            }),
            Err(_) => Err(InboxError::Timeout {
                invoke_id: self.invoke_id,
            }),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn round_trip_delivers_once() {
        let router = Arc::new(InboxRouter::new());
        let waiter = router.register("x").unwrap();

        router.post("x", json!({"ok": true})).unwrap();
        assert!(matches!(
            router.post("x", json!({"ok": false})),
            Err(InboxError::AlreadyDelivered { .. })
        ));

        let value = waiter.wait(Duration::from_secs(1)).await.unwrap();
        assert_eq!(value, json!({"ok": true}));
        assert!(router.is_empty());
    }

    #[tokio::test]
    async fn wait_times_out() {
        let router = Arc::new(InboxRouter::new());
        let waiter = router.register("slow").unwrap();
        let err = waiter.wait(Duration::from_millis(10)).await.unwrap_err();
        assert!(matches!(err, InboxError::Timeout { .. }));
        assert!(router.is_empty());
    }

    #[tokio::test]
    async fn cancellation_is_visible_to_callee() {
        let router = Arc::new(InboxRouter::new());
        let _waiter = router.register("c").unwrap();
        assert!(!router.is_cancelled("c"));
        router.cancel("c").unwrap();
        assert!(router.is_cancelled("c"));
    }

    #[tokio::test]
    async fn duplicate_registration_rejected() {
        let router = Arc::new(InboxRouter::new());
        let _w = router.register("dup").unwrap();
        assert!(matches!(
            router.register("dup"),
            Err(InboxError::AlreadyRegistered { .. })
        ));
    }
}
