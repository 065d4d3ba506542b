//! Per-message processing context.

use crate::auth::SecurityContext;
use crate::request_cache::RequestCache;
use std::time::Instant;
use tracing::trace;
use uuid::Uuid;

/// Everything scoped to one message: who acts, and the lookups memoized
/// while it is processed.
///
/// Created by a listener when a message arrives and dropped when processing
/// ends, whichever way it ends. Dropping releases the request cache.
#[derive(Debug)]
pub struct SyncContext {
    message_id: Uuid,
    security: SecurityContext,
    request_cache: RequestCache,
    started: Instant,
}

impl SyncContext {
    /// Creates a context for a new message.
    pub fn new(security: SecurityContext) -> Self {
        Self {
            message_id: Uuid::new_v4(),
            security,
            request_cache: RequestCache::new(),
            started: Instant::now(),
        }
    }

    /// A context acting as the system principal.
    pub fn system() -> Self {
        Self::new(SecurityContext::system())
    }

    /// Uses `id` as the message id.
    pub fn with_message_id(mut self, id: Uuid) -> Self {
        self.message_id = id;
        self
    }

    /// Returns the message id used in log spans.
    pub fn message_id(&self) -> Uuid {
        self.message_id
    }

    /// Returns the security context.
    pub fn security(&self) -> &SecurityContext {
        &self.security
    }

    /// Returns the request-scoped cache.
    pub fn request_cache(&self) -> &RequestCache {
        &self.request_cache
    }
}

impl Drop for SyncContext {
    fn drop(&mut self) {
        trace!(
            message = %self.message_id,
            cached = self.request_cache.len(),
            elapsed_ms = self.started.elapsed().as_millis() as u64,
            "releasing sync context"
        );
    }
}
