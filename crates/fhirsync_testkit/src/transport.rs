//! Transport that records how each message was settled.

use fhirsync_engine::{Envelope, MemoryQueue, MessageTransport, SyncError, SyncResult};
use parking_lot::Mutex;
use std::time::Duration;

/// How one delivery was settled.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Settlement {
    /// Acknowledged.
    Acknowledged {
        /// Delivery tag.
        tag: u64,
    },
    /// Handed back.
    Redelivered {
        /// Delivery tag.
        tag: u64,
        /// Why.
        reason: String,
    },
    /// Rejected as fatal.
    Rejected {
        /// Delivery tag.
        tag: u64,
        /// The error.
        error: String,
    },
}

/// A [`MemoryQueue`] that keeps a log of settlements.
pub struct RecordingTransport<M> {
    queue: MemoryQueue<M>,
    log: Mutex<Vec<Settlement>>,
}

impl<M: Clone + Send> RecordingTransport<M> {
    /// Creates a transport allowing `max_attempts` deliveries per message.
    pub fn new(max_attempts: u32) -> Self {
        Self {
            queue: MemoryQueue::with_max_attempts(max_attempts),
            log: Mutex::new(Vec::new()),
        }
    }

    /// Enqueues `message`.
    pub fn publish(&self, message: M) {
        self.queue.publish(message);
    }

    /// The underlying queue.
    pub fn queue(&self) -> &MemoryQueue<M> {
        &self.queue
    }

    /// Settlements so far, in order.
    pub fn settlements(&self) -> Vec<Settlement> {
        self.log.lock().clone()
    }

    /// Number of acknowledged deliveries.
    pub fn acknowledged(&self) -> usize {
        self.count(|s| matches!(s, Settlement::Acknowledged { .. }))
    }

    /// Number of redelivered deliveries.
    pub fn redelivered(&self) -> usize {
        self.count(|s| matches!(s, Settlement::Redelivered { .. }))
    }

    /// Number of rejected deliveries.
    pub fn rejected(&self) -> usize {
        self.count(|s| matches!(s, Settlement::Rejected { .. }))
    }

    fn count(&self, predicate: impl Fn(&Settlement) -> bool) -> usize {
        self.log.lock().iter().filter(|s| predicate(s)).count()
    }
}

impl<M: Clone + Send> MessageTransport<M> for RecordingTransport<M> {
    fn receive(&self, timeout: Duration) -> SyncResult<Option<Envelope<M>>> {
        self.queue.receive(timeout)
    }

    fn acknowledge(&self, envelope: &Envelope<M>) -> SyncResult<()> {
        self.log.lock().push(Settlement::Acknowledged {
            tag: envelope.delivery_tag,
        });
        self.queue.acknowledge(envelope)
    }

    fn redeliver(&self, envelope: Envelope<M>, reason: &str) -> SyncResult<()> {
        self.log.lock().push(Settlement::Redelivered {
            tag: envelope.delivery_tag,
            reason: reason.to_string(),
        });
        self.queue.redeliver(envelope, reason)
    }

    fn reject(&self, envelope: Envelope<M>, error: &SyncError) -> SyncResult<()> {
        self.log.lock().push(Settlement::Rejected {
            tag: envelope.delivery_tag,
            error: error.to_string(),
        });
        self.queue.reject(envelope, error)
    }
}
