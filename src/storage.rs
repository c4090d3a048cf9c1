//! `Storage`: a mutable, observable JSON document.
//!
//! Mirrors `hat.json.Storage` from the original implementation: a single
//! JSON value with change-observer registration. Observers are invoked
//! synchronously, after the mutation is committed; a callback that mutates
//! the storage again (re-entrant mutation) is permitted and produces a
//! further, nested invocation of every observer.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use dashmap::DashMap;
use serde_json::Value;

type ChangeCb = Box<dyn Fn(Value) + Send + Sync>;

struct Inner {
    data: Mutex<Value>,
    observers: DashMap<u64, ChangeCb>,
    next_id: AtomicU64,
}

/// An observable, in-memory JSON document.
///
/// Cheaply cloneable; clones share the same underlying document and
/// observer set (the teacher's equivalent is sharing an `Arc`-wrapped
/// resource across connections when a server is configured with a shared
/// `state`).
#[derive(Clone)]
pub struct Storage {
    inner: Arc<Inner>,
}

impl Default for Storage {
    fn default() -> Self {
        Self::new()
    }
}

impl Storage {
    /// Create a fresh storage whose initial value is JSON `null`.
    pub fn new() -> Self {
        Self {
            inner: Arc::new(Inner {
                data: Mutex::new(Value::Null),
                observers: DashMap::new(),
                next_id: AtomicU64::new(1),
            }),
        }
    }

    /// Read the current value.
    pub fn get(&self) -> Value {
        self.inner.data.lock().expect("storage mutex poisoned").clone()
    }

    /// Replace the current value, then synchronously invoke every registered
    /// observer with the new value.
    ///
    /// Re-entrant calls to `set` from inside an observer are permitted: the
    /// inner mutation commits before the nested observer pass runs, so
    /// observers always see values in the order they were committed.
    pub fn set(&self, value: Value) {
        {
            let mut guard = self.inner.data.lock().expect("storage mutex poisoned");
            *guard = value.clone();
        }
        for entry in self.inner.observers.iter() {
            (entry.value())(value.clone());
        }
    }

    /// Register a change observer, returning a handle whose `unregister`
    /// (or drop) removes it.
    ///
    /// Callers that want the registration scoped to a block should hold the
    /// returned [`Registration`] for exactly that lifetime; it unregisters
    /// on drop, so there is no path that leaks a stale observer.
    pub fn register_change_cb<F>(&self, cb: F) -> Registration
    where
        F: Fn(Value) + Send + Sync + 'static,
    {
        let id = self.inner.next_id.fetch_add(1, Ordering::Relaxed);
        self.inner.observers.insert(id, Box::new(cb));
        Registration {
            storage: self.inner.clone(),
            id,
        }
    }
}

/// A scoped registration returned by [`Storage::register_change_cb`].
///
/// Unregisters the observer on drop, or explicitly via [`Registration::unregister`].
pub struct Registration {
    storage: Arc<Inner>,
    id: u64,
}

impl Registration {
    /// Remove the associated observer immediately.
    pub fn unregister(self) {
        // Drop impl does the work; this just makes the intent explicit at
        // the call site and consumes `self`.
    }
}

impl Drop for Registration {
    fn drop(&mut self) {
        self.storage.observers.remove(&self.id);
    }
}
