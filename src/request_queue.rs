//! Bounded FIFO of requests waiting for a credential slot.
//!
//! Each waiter holds a one-shot completion signal. Slots are granted in
//! enqueue order; timeouts are tied to wall-clock and may resolve out of
//! order. A full queue rejects synchronously.

use std::collections::VecDeque;
use std::time::{Duration, Instant};

use serde::Serialize;
use tokio::sync::{oneshot, Mutex};

/// How a wait for a slot ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum QueueOutcome {
    Granted,
    Timeout,
    Cancelled,
    Shutdown,
    RejectedFull,
}

/// The resolved wait, with how long the request sat in the queue.
#[derive(Debug, Clone, Copy)]
pub struct QueueTicket {
    pub outcome: QueueOutcome,
    pub waited: Duration,
}

struct Waiter {
    request_id: String,
    enqueued_at: Instant,
    tx: oneshot::Sender<QueueOutcome>,
}

#[derive(Default)]
struct QueueCounters {
    total_enqueued: u64,
    total_dequeued: u64,
    total_timed_out: u64,
    total_rejected: u64,
    peak_size: usize,
    /// Sum of waited ms across granted waiters, for the average.
    granted_wait_ms: u64,
}

struct Inner {
    waiters: VecDeque<Waiter>,
    counters: QueueCounters,
}

/// Point-in-time queue statistics for `/stats`.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct QueueStats {
    pub current: usize,
    pub max: usize,
    pub percent_used: f64,
    pub oldest_wait_ms: u64,
    pub avg_wait_ms: f64,
    pub peak_size: usize,
    pub total_enqueued: u64,
    pub total_dequeued: u64,
    pub total_timed_out: u64,
    pub total_rejected: u64,
}

pub struct RequestQueue {
    inner: Mutex<Inner>,
    max_size: usize,
    default_timeout: Duration,
}

impl RequestQueue {
    pub fn new(max_size: usize, default_timeout: Duration) -> Self {
        Self {
            inner: Mutex::new(Inner {
                waiters: VecDeque::new(),
                counters: QueueCounters::default(),
            }),
            max_size,
            default_timeout,
        }
    }

    /// Wait for a slot, up to `timeout` (the queue default when `None`).
    ///
    /// Resolves when [`signal_slot_available`](Self::signal_slot_available)
    /// reaches this entry, the timer fires, the entry is cancelled, or the
    /// queue is cleared. A full queue resolves immediately with
    /// [`QueueOutcome::RejectedFull`].
    pub async fn enqueue(&self, request_id: &str, timeout: Option<Duration>) -> QueueTicket {
        let timeout = timeout.unwrap_or(self.default_timeout);
        let enqueued_at = Instant::now();
        let rx = {
            let mut inner = self.inner.lock().await;
            if inner.waiters.len() >= self.max_size {
                inner.counters.total_rejected += 1;
                return QueueTicket {
                    outcome: QueueOutcome::RejectedFull,
                    waited: Duration::ZERO,
                };
            }
            let (tx, rx) = oneshot::channel();
            inner.waiters.push_back(Waiter {
                request_id: request_id.to_string(),
                enqueued_at,
                tx,
            });
            inner.counters.total_enqueued += 1;
            inner.counters.peak_size = inner.counters.peak_size.max(inner.waiters.len());
            rx
        };

        let mut rx = rx;
        let timer = tokio::time::sleep(timeout);
        tokio::pin!(timer);
        let early = tokio::select! {
            res = &mut rx => Some(res),
            _ = &mut timer => None,
        };
        let outcome = match early {
            Some(Ok(outcome)) => outcome,
            // Sender dropped without a verdict; treat as cancellation.
            Some(Err(_)) => QueueOutcome::Cancelled,
            None => {
                // Timer fired; a signal or clear may have raced it.
                let mut inner = self.inner.lock().await;
                let was_waiting = inner
                    .waiters
                    .iter()
                    .position(|w| w.request_id == request_id);
                match was_waiting {
                    Some(pos) => {
                        inner.waiters.remove(pos);
                        inner.counters.total_timed_out += 1;
                        QueueOutcome::Timeout
                    }
                    None => rx.try_recv().unwrap_or(QueueOutcome::Cancelled),
                }
            }
        };
        QueueTicket {
            outcome,
            waited: enqueued_at.elapsed(),
        }
    }

    /// Wake the head waiter. Returns whether anyone was waiting.
    pub async fn signal_slot_available(&self) -> bool {
        let mut inner = self.inner.lock().await;
        while let Some(waiter) = inner.waiters.pop_front() {
            let waited = waiter.enqueued_at.elapsed();
            if waiter.tx.send(QueueOutcome::Granted).is_ok() {
                inner.counters.total_dequeued += 1;
                inner.counters.granted_wait_ms += waited.as_millis() as u64;
                return true;
            }
            // Receiver vanished (task dropped); fall through to the next.
        }
        false
    }

    /// Remove a waiter by id, resolving it with `Cancelled`.
    pub async fn cancel(&self, request_id: &str) -> bool {
        let mut inner = self.inner.lock().await;
        let pos = inner
            .waiters
            .iter()
            .position(|w| w.request_id == request_id);
        if let Some(waiter) = pos.and_then(|p| inner.waiters.remove(p)) {
            let _ = waiter.tx.send(QueueOutcome::Cancelled);
            return true;
        }
        false
    }

    /// Resolve every outstanding waiter with `reason` (shutdown path).
    pub async fn clear(&self, reason: QueueOutcome) {
        let mut inner = self.inner.lock().await;
        while let Some(waiter) = inner.waiters.pop_front() {
            let _ = waiter.tx.send(reason);
        }
    }

    /// 1-indexed position of a waiter, or −1 when absent.
    pub async fn position(&self, request_id: &str) -> i64 {
        let inner = self.inner.lock().await;
        inner
            .waiters
            .iter()
            .position(|w| w.request_id == request_id)
            .map(|p| p as i64 + 1)
            .unwrap_or(-1)
    }

    pub async fn len(&self) -> usize {
        self.inner.lock().await.waiters.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }

    pub async fn stats(&self) -> QueueStats {
        let inner = self.inner.lock().await;
        let now = Instant::now();
        let current = inner.waiters.len();
        let oldest_wait_ms = inner
            .waiters
            .front()
            .map(|w| now.duration_since(w.enqueued_at).as_millis() as u64)
            .unwrap_or(0);
        let avg_wait_ms = if inner.counters.total_dequeued > 0 {
            inner.counters.granted_wait_ms as f64 / inner.counters.total_dequeued as f64
        } else {
            0.0
        };
        QueueStats {
            current,
            max: self.max_size,
            percent_used: if self.max_size > 0 {
                current as f64 * 100.0 / self.max_size as f64
            } else {
                0.0
            },
            oldest_wait_ms,
            avg_wait_ms,
            peak_size: inner.counters.peak_size,
            total_enqueued: inner.counters.total_enqueued,
            total_dequeued: inner.counters.total_dequeued,
            total_timed_out: inner.counters.total_timed_out,
            total_rejected: inner.counters.total_rejected,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[tokio::test]
    async fn enqueue_then_signal_resolves_granted() {
        let queue = Arc::new(RequestQueue::new(10, Duration::from_secs(5)));
        let waiter = {
            let queue = queue.clone();
            tokio::spawn(async move { queue.enqueue("req-1", None).await })
        };
        // Let the waiter park before signalling.
        while queue.is_empty().await {
            tokio::task::yield_now().await;
        }
        assert!(queue.signal_slot_available().await);
        let ticket = waiter.await.unwrap();
        assert_eq!(ticket.outcome, QueueOutcome::Granted);
    }

    #[tokio::test]
    async fn full_queue_rejects_synchronously() {
        let queue = Arc::new(RequestQueue::new(1, Duration::from_secs(5)));
        let parked = {
            let queue = queue.clone();
            tokio::spawn(async move { queue.enqueue("req-1", None).await })
        };
        while queue.is_empty().await {
            tokio::task::yield_now().await;
        }
        let ticket = queue.enqueue("req-2", None).await;
        assert_eq!(ticket.outcome, QueueOutcome::RejectedFull);
        assert_eq!(ticket.waited, Duration::ZERO);

        queue.clear(QueueOutcome::Shutdown).await;
        assert_eq!(parked.await.unwrap().outcome, QueueOutcome::Shutdown);
        assert_eq!(queue.stats().await.total_rejected, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn waiters_time_out() {
        let queue = Arc::new(RequestQueue::new(10, Duration::from_millis(100)));
        let ticket = queue.enqueue("req-1", None).await;
        assert_eq!(ticket.outcome, QueueOutcome::Timeout);
        assert!(queue.is_empty().await);
        assert_eq!(queue.stats().await.total_timed_out, 1);
    }

    #[test]
    fn explicit_timeout_overrides_the_default() {
        tokio_test::block_on(async {
            let queue = RequestQueue::new(10, Duration::from_secs(60));
            let ticket = queue
                .enqueue("req-1", Some(Duration::from_millis(10)))
                .await;
            assert_eq!(ticket.outcome, QueueOutcome::Timeout);
        });
    }

    #[tokio::test]
    async fn signals_wake_in_fifo_order() {
        let queue = Arc::new(RequestQueue::new(10, Duration::from_secs(5)));
        let mut handles = Vec::new();
        for i in 0..3 {
            let queue_clone = queue.clone();
            let id = format!("req-{}", i);
            handles.push(tokio::spawn(async move {
                let ticket = queue_clone.enqueue(&id, None).await;
                (id, ticket.outcome)
            }));
            while queue.len().await < i + 1 {
                tokio::task::yield_now().await;
            }
        }
        assert_eq!(queue.position("req-0").await, 1);
        assert_eq!(queue.position("req-2").await, 3);
        assert_eq!(queue.position("req-9").await, -1);

        // Grant one slot: only the head resolves.
        assert!(queue.signal_slot_available().await);
        let (id, outcome) = handles.remove(0).await.unwrap();
        assert_eq!(id, "req-0");
        assert_eq!(outcome, QueueOutcome::Granted);
        assert_eq!(queue.len().await, 2);

        assert!(queue.signal_slot_available().await);
        assert!(queue.signal_slot_available().await);
        for handle in handles {
            assert_eq!(handle.await.unwrap().1, QueueOutcome::Granted);
        }
        assert!(!queue.signal_slot_available().await);
    }

    #[tokio::test]
    async fn cancel_removes_and_resolves() {
        let queue = Arc::new(RequestQueue::new(10, Duration::from_secs(5)));
        let waiter = {
            let queue = queue.clone();
            tokio::spawn(async move { queue.enqueue("req-1", None).await })
        };
        while queue.is_empty().await {
            tokio::task::yield_now().await;
        }
        assert!(queue.cancel("req-1").await);
        assert_eq!(waiter.await.unwrap().outcome, QueueOutcome::Cancelled);
        assert!(!queue.cancel("req-1").await);
    }

    #[tokio::test]
    async fn clear_resolves_everyone_with_reason() {
        let queue = Arc::new(RequestQueue::new(10, Duration::from_secs(5)));
        let mut handles = Vec::new();
        for i in 0..4 {
            let queue = queue.clone();
            handles.push(tokio::spawn(
                async move { queue.enqueue(&format!("req-{}", i), None).await },
            ));
        }
        while queue.len().await < 4 {
            tokio::task::yield_now().await;
        }
        queue.clear(QueueOutcome::Shutdown).await;
        for handle in handles {
            assert_eq!(handle.await.unwrap().outcome, QueueOutcome::Shutdown);
        }
        assert!(queue.is_empty().await);
    }

    #[tokio::test]
    async fn stats_track_peak_and_counts() {
        let queue = Arc::new(RequestQueue::new(10, Duration::from_secs(5)));
        let mut handles = Vec::new();
        for i in 0..2 {
            let queue = queue.clone();
            handles.push(tokio::spawn(
                async move { queue.enqueue(&format!("req-{}", i), None).await },
            ));
        }
        while queue.len().await < 2 {
            tokio::task::yield_now().await;
        }
        let stats = queue.stats().await;
        assert_eq!(stats.current, 2);
        assert_eq!(stats.peak_size, 2);
        assert_eq!(stats.total_enqueued, 2);
        assert!((stats.percent_used - 20.0).abs() < f64::EPSILON);

        queue.signal_slot_available().await;
        queue.signal_slot_available().await;
        for handle in handles {
            handle.await.unwrap();
        }
        let stats = queue.stats().await;
        assert_eq!(stats.current, 0);
        assert_eq!(stats.total_dequeued, 2);
    }
}
