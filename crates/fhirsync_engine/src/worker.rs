//! Message transport and the worker pool that drains it.

use crate::config::ListenerConfig;
use crate::error::{SyncError, SyncResult};
use crate::listener::{Delivery, MessageHandler};
use parking_lot::{Condvar, Mutex};
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::Duration;
use tracing::{debug, info, info_span, warn};

/// A message as handed out by a transport.
#[derive(Debug, Clone, PartialEq)]
pub struct Envelope<M> {
    /// Transport-assigned tag.
    pub delivery_tag: u64,
    /// Deliveries so far, this one included.
    pub attempt: u32,
    /// The message.
    pub message: M,
}

/// Queue abstraction used by the workers.
///
/// Implementations wrap a broker client; [`MemoryQueue`] keeps messages in
/// process.
pub trait MessageTransport<M>: Send + Sync {
    /// Waits up to `timeout` for the next message.
    fn receive(&self, timeout: Duration) -> SyncResult<Option<Envelope<M>>>;

    /// Removes a finished message from the queue.
    fn acknowledge(&self, envelope: &Envelope<M>) -> SyncResult<()>;

    /// Hands a message back for a later delivery.
    fn redeliver(&self, envelope: Envelope<M>, reason: &str) -> SyncResult<()>;

    /// Moves a message that failed fatally out of the queue.
    fn reject(&self, envelope: Envelope<M>, error: &SyncError) -> SyncResult<()>;
}

/// In-process queue.
///
/// A message redelivered more often than the configured limit is moved to
/// the dead letters instead.
pub struct MemoryQueue<M> {
    state: Mutex<QueueState<M>>,
    ready: Condvar,
    max_attempts: u32,
}

struct QueueState<M> {
    next_tag: u64,
    pending: VecDeque<Envelope<M>>,
    in_flight: usize,
    acknowledged: Vec<M>,
    dead_letters: Vec<(M, String)>,
}

impl<M: Clone + Send> MemoryQueue<M> {
    /// Creates an empty queue that allows 5 deliveries per message.
    pub fn new() -> Self {
        Self::with_max_attempts(5)
    }

    /// Creates an empty queue that allows `max_attempts` deliveries.
    pub fn with_max_attempts(max_attempts: u32) -> Self {
        Self {
            state: Mutex::new(QueueState {
                next_tag: 1,
                pending: VecDeque::new(),
                in_flight: 0,
                acknowledged: Vec::new(),
                dead_letters: Vec::new(),
            }),
            ready: Condvar::new(),
            max_attempts: max_attempts.max(1),
        }
    }

    /// Enqueues `message`.
    pub fn publish(&self, message: M) {
        let mut state = self.state.lock();
        let tag = state.next_tag;
        state.next_tag += 1;
        state.pending.push_back(Envelope {
            delivery_tag: tag,
            attempt: 0,
            message,
        });
        self.ready.notify_one();
    }

    /// Messages waiting for delivery.
    pub fn pending(&self) -> usize {
        self.state.lock().pending.len()
    }

    /// Messages handed out and not yet settled.
    pub fn in_flight(&self) -> usize {
        self.state.lock().in_flight
    }

    /// Acknowledged messages, in acknowledgement order.
    pub fn acknowledged(&self) -> Vec<M> {
        self.state.lock().acknowledged.clone()
    }

    /// Rejected messages with the reason.
    pub fn dead_letters(&self) -> Vec<(M, String)> {
        self.state.lock().dead_letters.clone()
    }
}

impl<M: Clone + Send> Default for MemoryQueue<M> {
    fn default() -> Self {
        Self::new()
    }
}

impl<M: Clone + Send> MessageTransport<M> for MemoryQueue<M> {
    fn receive(&self, timeout: Duration) -> SyncResult<Option<Envelope<M>>> {
        let mut state = self.state.lock();
        if state.pending.is_empty() && state.in_flight > 0 {
            // A message in flight may still come back.
            let _ = self.ready.wait_for(&mut state, timeout);
        }
        let Some(mut envelope) = state.pending.pop_front() else {
            return Ok(None);
        };
        envelope.attempt += 1;
        state.in_flight += 1;
        Ok(Some(envelope))
    }

    fn acknowledge(&self, envelope: &Envelope<M>) -> SyncResult<()> {
        let mut state = self.state.lock();
        state.in_flight = state.in_flight.saturating_sub(1);
        state.acknowledged.push(envelope.message.clone());
        self.ready.notify_all();
        Ok(())
    }

    fn redeliver(&self, envelope: Envelope<M>, reason: &str) -> SyncResult<()> {
        let mut state = self.state.lock();
        state.in_flight = state.in_flight.saturating_sub(1);
        if envelope.attempt >= self.max_attempts {
            warn!(
                tag = envelope.delivery_tag,
                attempts = envelope.attempt,
                "delivery limit reached"
            );
            state
                .dead_letters
                .push((envelope.message, format!("delivery limit reached: {reason}")));
        } else {
            state.pending.push_back(envelope);
        }
        self.ready.notify_all();
        Ok(())
    }

    fn reject(&self, envelope: Envelope<M>, error: &SyncError) -> SyncResult<()> {
        let mut state = self.state.lock();
        state.in_flight = state.in_flight.saturating_sub(1);
        state.dead_letters.push((envelope.message, error.to_string()));
        self.ready.notify_all();
        Ok(())
    }
}

/// What a worker pool did before it stopped.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct WorkerReport {
    /// Messages received.
    pub received: u64,
    /// Messages acknowledged.
    pub acknowledged: u64,
    /// Messages handed back.
    pub redelivered: u64,
    /// Messages rejected as fatal.
    pub rejected: u64,
}

#[derive(Default)]
struct Counters {
    received: AtomicU64,
    acknowledged: AtomicU64,
    redelivered: AtomicU64,
    rejected: AtomicU64,
}

impl Counters {
    fn report(&self) -> WorkerReport {
        WorkerReport {
            received: self.received.load(Ordering::Relaxed),
            acknowledged: self.acknowledged.load(Ordering::Relaxed),
            redelivered: self.redelivered.load(Ordering::Relaxed),
            rejected: self.rejected.load(Ordering::Relaxed),
        }
    }
}

/// Runs a fixed number of workers over one transport.
#[derive(Debug, Clone)]
pub struct WorkerPool {
    workers: usize,
    receive_timeout: Duration,
}

impl WorkerPool {
    /// Creates a pool from listener settings.
    pub fn new(config: &ListenerConfig) -> Self {
        Self {
            workers: config.workers.max(1),
            receive_timeout: config.receive_timeout,
        }
    }

    /// Number of workers.
    pub fn workers(&self) -> usize {
        self.workers
    }

    /// Processes messages until `shutdown` is set.
    pub fn run<M, T, H>(&self, transport: &T, handler: &H, shutdown: &AtomicBool) -> WorkerReport
    where
        M: Send,
        T: MessageTransport<M> + ?Sized,
        H: MessageHandler<M> + ?Sized,
    {
        self.drive(transport, handler, shutdown, false)
    }

    /// Processes messages until the transport has none left.
    pub fn run_until_idle<M, T, H>(&self, transport: &T, handler: &H) -> WorkerReport
    where
        M: Send,
        T: MessageTransport<M> + ?Sized,
        H: MessageHandler<M> + ?Sized,
    {
        self.drive(transport, handler, &AtomicBool::new(false), true)
    }

    fn drive<M, T, H>(
        &self,
        transport: &T,
        handler: &H,
        shutdown: &AtomicBool,
        stop_when_idle: bool,
    ) -> WorkerReport
    where
        M: Send,
        T: MessageTransport<M> + ?Sized,
        H: MessageHandler<M> + ?Sized,
    {
        let counters = Counters::default();
        std::thread::scope(|scope| {
            for worker in 0..self.workers {
                let counters = &counters;
                scope.spawn(move || {
                    let span = info_span!("worker", worker);
                    let _enter = span.enter();
                    self.work(transport, handler, shutdown, stop_when_idle, counters);
                });
            }
        });
        let report = counters.report();
        info!(
            received = report.received,
            acknowledged = report.acknowledged,
            redelivered = report.redelivered,
            rejected = report.rejected,
            "workers stopped"
        );
        report
    }

    fn work<M, T, H>(
        &self,
        transport: &T,
        handler: &H,
        shutdown: &AtomicBool,
        stop_when_idle: bool,
        counters: &Counters,
    ) where
        T: MessageTransport<M> + ?Sized,
        H: MessageHandler<M> + ?Sized,
    {
        while !shutdown.load(Ordering::Acquire) {
            let envelope = match transport.receive(self.receive_timeout) {
                Ok(Some(envelope)) => envelope,
                Ok(None) if stop_when_idle => break,
                Ok(None) => continue,
                Err(e) => {
                    warn!(error = %e, "receive failed");
                    if stop_when_idle {
                        break;
                    }
                    continue;
                }
            };
            counters.received.fetch_add(1, Ordering::Relaxed);
            let tag = envelope.delivery_tag;

            let settled = match handler.handle(&envelope.message) {
                Ok(Delivery::Redeliver(reason)) => {
                    counters.redelivered.fetch_add(1, Ordering::Relaxed);
                    transport.redeliver(envelope, &reason)
                }
                Ok(delivery) => {
                    debug!(tag, ?delivery, "acknowledging");
                    counters.acknowledged.fetch_add(1, Ordering::Relaxed);
                    transport.acknowledge(&envelope)
                }
                Err(e) => {
                    counters.rejected.fetch_add(1, Ordering::Relaxed);
                    transport.reject(envelope, &e)
                }
            };
            if let Err(e) = settled {
                warn!(tag, error = %e, "cannot settle message");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicU32;

    struct Scripted {
        calls: AtomicU32,
    }

    impl MessageHandler<&'static str> for Scripted {
        fn handle(&self, message: &&'static str) -> SyncResult<Delivery> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            match *message {
                "retry" => Ok(Delivery::Redeliver("busy".into())),
                "fatal" => Err(SyncError::Fatal("broken".into())),
                "drop" => Ok(Delivery::Dropped("gone".into())),
                _ => Ok(Delivery::Applied),
            }
        }
    }

    fn pool(workers: usize) -> WorkerPool {
        WorkerPool::new(&ListenerConfig {
            workers,
            receive_timeout: Duration::from_millis(10),
            ..ListenerConfig::default()
        })
    }

    #[test]
    fn settles_each_delivery_kind() {
        let queue = MemoryQueue::with_max_attempts(3);
        for message in ["ok", "retry", "fatal", "drop"] {
            queue.publish(message);
        }
        let handler = Scripted {
            calls: AtomicU32::new(0),
        };

        let report = pool(1).run_until_idle(&queue, &handler);

        assert_eq!(report.received, 6);
        assert_eq!(report.acknowledged, 2);
        assert_eq!(report.redelivered, 3);
        assert_eq!(report.rejected, 1);
        assert_eq!(queue.acknowledged(), vec!["ok", "drop"]);
        let dead: Vec<_> = queue.dead_letters().into_iter().map(|(m, _)| m).collect();
        assert_eq!(dead, vec!["fatal", "retry"]);
        assert_eq!(queue.pending(), 0);
        assert_eq!(queue.in_flight(), 0);
    }

    #[test]
    fn many_workers_drain_the_queue() {
        let queue = MemoryQueue::new();
        for _ in 0..100 {
            queue.publish("ok");
        }
        let handler = Scripted {
            calls: AtomicU32::new(0),
        };

        let report = pool(4).run_until_idle(&queue, &handler);

        assert_eq!(report.acknowledged, 100);
        assert_eq!(handler.calls.load(Ordering::SeqCst), 100);
    }

    #[test]
    fn shutdown_flag_stops_workers() {
        let queue: MemoryQueue<&'static str> = MemoryQueue::new();
        let handler = Scripted {
            calls: AtomicU32::new(0),
        };
        let report = pool(2).run(&queue, &handler, &AtomicBool::new(true));
        assert_eq!(report, WorkerReport::default());
    }
}
