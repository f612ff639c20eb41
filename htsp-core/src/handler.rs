//! Listener plumbing: optional execution contexts and identity-keyed
//! listener registries.
//!
//! Every listener kind (connection, message, authentication) may
//! supply a [`Handler`] — callbacks are then posted onto it instead of
//! running inline on the I/O task. A handler drains its queue on a
//! single spawned task, so post order is delivery order.

use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::{Arc, Mutex};

use tokio::sync::mpsc;

/// A callback posted to a [`Handler`].
pub type Job = Box<dyn FnOnce() + Send + 'static>;

// ── Handler ──────────────────────────────────────────────────────

/// A post target for listener callbacks.
///
/// Cheaply cloneable; all clones feed the same drain task.
#[derive(Debug, Clone)]
pub struct Handler {
    tx: mpsc::UnboundedSender<Job>,
}

impl Handler {
    /// Create a handler backed by a freshly spawned drain task.
    ///
    /// Must be called from within a tokio runtime.
    pub fn spawn() -> Self {
        let (tx, mut rx) = mpsc::unbounded_channel::<Job>();
        tokio::spawn(async move {
            while let Some(job) = rx.recv().await {
                if catch_unwind(AssertUnwindSafe(job)).is_err() {
                    tracing::error!("posted listener callback panicked");
                }
            }
        });
        Self { tx }
    }

    /// Enqueue a callback. Dropped (with a warning) if the drain task
    /// is gone.
    pub fn post(&self, job: Job) {
        if self.tx.send(job).is_err() {
            tracing::warn!("handler drain task gone, dropping posted callback");
        }
    }
}

// ── ListenerSet ──────────────────────────────────────────────────

/// An identity-keyed set of listeners.
///
/// Duplicate adds and removals of unknown listeners log a warning and
/// no-op rather than failing.
#[derive(Debug)]
pub struct ListenerSet<L: ?Sized> {
    listeners: Mutex<Vec<Arc<L>>>,
}

impl<L: ?Sized> ListenerSet<L> {
    pub fn new() -> Self {
        Self {
            listeners: Mutex::new(Vec::new()),
        }
    }

    pub fn add(&self, listener: Arc<L>) {
        let mut listeners = self.listeners.lock().unwrap();
        if listeners.iter().any(|l| Arc::ptr_eq(l, &listener)) {
            tracing::warn!("attempted to add duplicate listener");
            return;
        }
        listeners.push(listener);
    }

    pub fn remove(&self, listener: &Arc<L>) {
        let mut listeners = self.listeners.lock().unwrap();
        let before = listeners.len();
        listeners.retain(|l| !Arc::ptr_eq(l, listener));
        if listeners.len() == before {
            tracing::warn!("attempted to remove non existing listener");
        }
    }

    /// Snapshot for fan-out without holding the lock across callbacks.
    pub fn snapshot(&self) -> Vec<Arc<L>> {
        self.listeners.lock().unwrap().clone()
    }

    pub fn len(&self) -> usize {
        self.listeners.lock().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.listeners.lock().unwrap().is_empty()
    }
}

impl<L: ?Sized> Default for ListenerSet<L> {
    fn default() -> Self {
        Self::new()
    }
}

// ── Tests ────────────────────────────────────────────────────────
