//! Client-side request correlation: id -> pending-result placeholder.
//!
//! Grounded on `hat.juggler.client.Client`'s `_res_futures` dict and, in
//! Rust idiom, on the teacher's `correlations: Arc<DashMap<String,
//! CorrelationContext>>` field (`turbomcp-websocket::types`), generalized
//! from a string correlation id to the `u64` request id that the wire
//! format already carries.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use dashmap::DashMap;
use serde_json::Value;
use tokio::sync::oneshot;

use crate::error::JugglerError;

/// The outcome of a request: the peer's successful value, or its error.
pub type RequestOutcome = Result<Value, JugglerError>;

/// Per-client table mapping request id to a pending-result placeholder.
///
/// Invariants upheld by this type:
/// - an id is inserted before the corresponding request is enqueued on the
///   transport (callers must call [`CorrelationTable::register`] first);
/// - an id is removed once its result is delivered, whether by
///   [`CorrelationTable::resolve`] or [`CorrelationTable::fail_all`];
/// - a stale or already-resolved id is silently ignored by `resolve`, which
///   tolerates re-entrant cancellation.
#[derive(Clone)]
pub struct CorrelationTable {
    pending: Arc<DashMap<u64, oneshot::Sender<RequestOutcome>>>,
    next_id: Arc<AtomicU64>,
}

impl Default for CorrelationTable {
    fn default() -> Self {
        Self::new()
    }
}

impl CorrelationTable {
    /// Create an empty table whose ids start at 1.
    pub fn new() -> Self {
        Self {
            pending: Arc::new(DashMap::new()),
            next_id: Arc::new(AtomicU64::new(1)),
        }
    }

    /// Allocate the next monotonic request id.
    pub fn next_id(&self) -> u64 {
        self.next_id.fetch_add(1, Ordering::Relaxed)
    }

    /// Register a placeholder for `id`, returning the receiver half the
    /// caller should await after enqueueing the request.
    pub fn register(&self, id: u64) -> oneshot::Receiver<RequestOutcome> {
        let (tx, rx) = oneshot::channel();
        self.pending.insert(id, tx);
        rx
    }

    /// Drop the placeholder for `id` without resolving it (used when the
    /// caller abandons the wait, e.g. on its own cancellation).
    pub fn cancel(&self, id: u64) {
        self.pending.remove(&id);
    }

    /// Resolve `id` with its outcome. If `id` is absent or was already
    /// resolved, this is a silent no-op.
    pub fn resolve(&self, id: u64, outcome: RequestOutcome) {
        if let Some((_, tx)) = self.pending.remove(&id) {
            let _ = tx.send(outcome);
        }
    }

    /// Fail every still-pending placeholder with [`JugglerError::Disconnected`].
    pub fn fail_all(&self) {
        for (_, tx) in self.pending.drain() {
            let _ = tx.send(Err(JugglerError::Disconnected));
        }
    }

    /// Number of requests currently awaiting a response.
    pub fn len(&self) -> usize {
        self.pending.len()
    }

    /// Whether there are no pending requests.
    pub fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn resolve_delivers_success() {
        let table = CorrelationTable::new();
        let id = table.next_id();
        let rx = table.register(id);
        table.resolve(id, Ok(json!(42)));
        assert_eq!(rx.await.unwrap().unwrap(), json!(42));
    }

    #[tokio::test]
    async fn resolve_on_unknown_id_is_silently_dropped() {
        let table = CorrelationTable::new();
        // No panic, no effect.
        table.resolve(999, Ok(json!(null)));
        assert!(table.is_empty());
    }

    #[tokio::test]
    async fn fail_all_resolves_every_live_placeholder_exactly_once() {
        let table = CorrelationTable::new();
        let id1 = table.next_id();
        let id2 = table.next_id();
        let rx1 = table.register(id1);
        let rx2 = table.register(id2);

        table.fail_all();

        assert!(matches!(rx1.await.unwrap(), Err(JugglerError::Disconnected)));
        assert!(matches!(rx2.await.unwrap(), Err(JugglerError::Disconnected)));
        assert!(table.is_empty());
    }

    #[tokio::test]
    async fn double_resolve_is_a_noop_second_time() {
        let table = CorrelationTable::new();
        let id = table.next_id();
        let rx = table.register(id);
        table.resolve(id, Ok(json!(1)));
        // id already removed; this must not panic or resolve anything new.
        table.resolve(id, Ok(json!(2)));
        assert_eq!(rx.await.unwrap().unwrap(), json!(1));
    }

    #[test]
    fn ids_are_monotonic_starting_at_one() {
        let table = CorrelationTable::new();
        assert_eq!(table.next_id(), 1);
        assert_eq!(table.next_id(), 2);
        assert_eq!(table.next_id(), 3);
    }
}
