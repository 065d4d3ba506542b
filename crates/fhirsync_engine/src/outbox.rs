//! Side effects deferred until a unit of work has committed.

use crate::error::SyncResult;
use parking_lot::Mutex;
use tracing::{debug, error};

type Deferred = Box<dyn FnOnce() -> SyncResult<()> + Send>;

/// Callbacks that run only once the work they belong to succeeded.
///
/// Recording a fingerprint or deleting a staging record must not happen for a
/// message that ends up redelivered. Listeners queue those effects here and
/// [`commit`](Outbox::commit) them at the end, or
/// [`discard`](Outbox::discard) them.
#[derive(Default)]
pub struct Outbox {
    pending: Mutex<Vec<(&'static str, Deferred)>>,
}

impl Outbox {
    /// Creates an empty outbox.
    pub fn new() -> Self {
        Self::default()
    }

    /// Queues `effect` under `name` (used in logs).
    pub fn defer<F>(&self, name: &'static str, effect: F)
    where
        F: FnOnce() -> SyncResult<()> + Send + 'static,
    {
        self.pending.lock().push((name, Box::new(effect)));
    }

    /// Number of queued effects.
    pub fn len(&self) -> usize {
        self.pending.lock().len()
    }

    /// Returns true if nothing is queued.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Runs every queued effect in order.
    ///
    /// The work has already committed, so a failing effect is logged and the
    /// remaining effects still run. Returns the number that failed.
    pub fn commit(&self) -> usize {
        let pending = std::mem::take(&mut *self.pending.lock());
        let mut failed = 0;
        for (name, effect) in pending {
            match effect() {
                Ok(()) => debug!(effect = name, "deferred effect ran"),
                Err(e) => {
                    failed += 1;
                    error!(effect = name, error = %e, "deferred effect failed");
                }
            }
        }
        failed
    }

    /// Drops every queued effect without running it.
    pub fn discard(&self) -> usize {
        let dropped = std::mem::take(&mut *self.pending.lock()).len();
        if dropped > 0 {
            debug!(dropped, "discarded deferred effects");
        }
        dropped
    }
}

impl std::fmt::Debug for Outbox {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let names: Vec<&str> = self.pending.lock().iter().map(|(n, _)| *n).collect();
        f.debug_struct("Outbox").field("pending", &names).finish()
    }
}
