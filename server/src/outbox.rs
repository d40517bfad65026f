//! Bounded per-session outbound queue.
//!
//! The tick loop pushes without ever waiting. When the queue is full the oldest
//! discardable entry makes room for the new one; if nothing queued may be
//! discarded the new entry is dropped instead. The session's writer task drains
//! the queue and is the one that notices a peer falling behind.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex, MutexGuard};
use tokio::sync::Notify;

/// Whether a queued item may be evicted to make room for a newer one.
pub trait Discardable {
    fn discardable(&self) -> bool;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PushOutcome {
    Queued,
    /// Queued after evicting the oldest discardable entry.
    ReplacedOldest,
    /// Queue full of entries that must not be evicted; the new one was dropped.
    Dropped,
    Closed,
}

/// An encoded wire payload. Observers share one allocation per tick.
#[derive(Debug, Clone)]
pub struct Frame {
    bytes: Arc<Vec<u8>>,
    essential: bool,
}

impl Frame {
    /// A frame superseded by the next tick's frame, e.g. a world state.
    pub fn droppable(bytes: Arc<Vec<u8>>) -> Self {
        Self {
            bytes,
            essential: false,
        }
    }

    /// A frame the peer must see, e.g. a registration reply or stop.
    pub fn essential(bytes: Vec<u8>) -> Self {
        Self {
            bytes: Arc::new(bytes),
            essential: true,
        }
    }

    pub fn bytes(&self) -> &[u8] {
        &self.bytes
    }
}

impl Discardable for Frame {
    fn discardable(&self) -> bool {
        !self.essential
    }
}

struct Queue<T> {
    items: VecDeque<T>,
    closed: bool,
}

pub struct Outbox<T> {
    queue: Mutex<Queue<T>>,
    notify: Notify,
    capacity: usize,
}

impl<T: Discardable> Outbox<T> {
    pub fn new(capacity: usize) -> Self {
        Self {
            queue: Mutex::new(Queue {
                items: VecDeque::with_capacity(capacity),
                closed: false,
            }),
            notify: Notify::new(),
            capacity,
        }
    }

    fn lock(&self) -> MutexGuard<'_, Queue<T>> {
        self.queue.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Never waits. The lock is only held for a queue operation.
    pub fn push(&self, item: T) -> PushOutcome {
        let outcome = {
            let mut queue = self.lock();
            if queue.closed {
                return PushOutcome::Closed;
            }
            if self.capacity == 0 {
                return PushOutcome::Dropped;
            }
            if queue.items.len() < self.capacity {
                queue.items.push_back(item);
                PushOutcome::Queued
            } else {
                match queue.items.iter().position(Discardable::discardable) {
                    Some(oldest) => {
                        queue.items.remove(oldest);
                        queue.items.push_back(item);
                        PushOutcome::ReplacedOldest
                    }
                    None => return PushOutcome::Dropped,
                }
            }
        };
        self.notify.notify_one();
        outcome
    }

    /// Next queued item. After [`close`](Self::close) the remaining items are
    /// still handed out, then `None`.
    pub async fn next(&self) -> Option<T> {
        loop {
            let notified = self.notify.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();
            {
                let mut queue = self.lock();
                if let Some(item) = queue.items.pop_front() {
                    return Some(item);
                }
                if queue.closed {
                    return None;
                }
            }
            notified.await;
        }
    }

    /// Refuses further pushes. Already queued items can still be drained.
    pub fn close(&self) {
        self.lock().closed = true;
        self.notify.notify_waiters();
        self.notify.notify_one();
    }

    pub fn is_closed(&self) -> bool {
        self.lock().closed
    }

    pub fn depth(&self) -> usize {
        self.lock().items.len()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }
}

/// Counts consecutive observations of a deep queue.
#[derive(Debug, Clone)]
pub struct SlowConsumerGuard {
    threshold: usize,
    max_strikes: u32,
    strikes: u32,
}

impl SlowConsumerGuard {
    pub fn new(threshold: usize, max_strikes: u32) -> Self {
        Self {
            threshold,
            max_strikes,
            strikes: 0,
        }
    }

    /// Returns true once the queue has stayed at or above the threshold for
    /// `max_strikes` observations in a row.
    pub fn observe(&mut self, depth: usize) -> bool {
        if depth >= self.threshold {
            self.strikes += 1;
        } else {
            self.strikes = 0;
        }
        self.strikes >= self.max_strikes
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::{Duration, Instant};

    #[derive(Debug, PartialEq)]
    struct Item(u32, bool);

    impl Discardable for Item {
        fn discardable(&self) -> bool {
            self.1
        }
    }

    fn drain(outbox: &Outbox<Item>) -> Vec<u32> {
        let mut queue = outbox.lock();
        queue.items.drain(..).map(|i| i.0).collect()
    }

    #[test]
    fn test_push_until_full() {
        let outbox = Outbox::new(2);
        assert_eq!(outbox.push(Item(1, true)), PushOutcome::Queued);
        assert_eq!(outbox.push(Item(2, true)), PushOutcome::Queued);
        assert_eq!(outbox.depth(), 2);
    }

    #[test]
    fn test_full_queue_replaces_oldest_discardable() {
        let outbox = Outbox::new(3);
        outbox.push(Item(1, false));
        outbox.push(Item(2, true));
        outbox.push(Item(3, true));

        assert_eq!(outbox.push(Item(4, true)), PushOutcome::ReplacedOldest);
        assert_eq!(drain(&outbox), vec![1, 3, 4]);
    }

    #[test]
    fn test_full_queue_of_essentials_drops_new() {
        let outbox = Outbox::new(2);
        outbox.push(Item(1, false));
        outbox.push(Item(2, false));

        assert_eq!(outbox.push(Item(3, true)), PushOutcome::Dropped);
        assert_eq!(drain(&outbox), vec![1, 2]);
    }

    #[test]
    fn test_zero_capacity_drops() {
        let outbox = Outbox::new(0);
        assert_eq!(outbox.push(Item(1, true)), PushOutcome::Dropped);
    }

    #[test]
    fn test_push_never_blocks_when_full() {
        let outbox = Outbox::new(4);
        let start = Instant::now();
        for i in 0..100_000 {
            outbox.push(Item(i, i % 7 != 0));
        }
        assert!(start.elapsed() < Duration::from_secs(2));
        assert_eq!(outbox.depth(), 4);
    }

    #[test]
    fn test_closed_refuses_push() {
        let outbox = Outbox::new(2);
        outbox.close();
        assert!(outbox.is_closed());
        assert_eq!(outbox.push(Item(1, true)), PushOutcome::Closed);
    }

    #[tokio::test]
    async fn test_next_drains_then_ends_after_close() {
        let outbox = Outbox::new(4);
        outbox.push(Item(1, true));
        outbox.push(Item(2, false));
        outbox.close();

        assert_eq!(outbox.next().await, Some(Item(1, true)));
        assert_eq!(outbox.next().await, Some(Item(2, false)));
        assert_eq!(outbox.next().await, None);
    }

    #[tokio::test]
    async fn test_next_wakes_on_push() {
        let outbox = Arc::new(Outbox::new(4));
        let consumer = {
            let outbox = Arc::clone(&outbox);
            tokio::spawn(async move { outbox.next().await })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        outbox.push(Item(9, true));

        let item = tokio::time::timeout(Duration::from_secs(1), consumer)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(item, Some(Item(9, true)));
    }

    #[tokio::test]
    async fn test_next_wakes_on_close() {
        let outbox: Arc<Outbox<Item>> = Arc::new(Outbox::new(4));
        let consumer = {
            let outbox = Arc::clone(&outbox);
            tokio::spawn(async move { outbox.next().await })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        outbox.close();

        let item = tokio::time::timeout(Duration::from_secs(1), consumer)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(item, None);
    }

    #[test]
    fn test_frames() {
        let state = Frame::droppable(Arc::new(vec![1, 2, 3]));
        let stop = Frame::essential(vec![4]);
        assert!(state.discardable());
        assert!(!stop.discardable());
        assert_eq!(state.bytes(), &[1, 2, 3]);
    }

    #[test]
    fn test_slow_consumer_guard() {
        let mut guard = SlowConsumerGuard::new(3, 2);
        assert!(!guard.observe(5));
        assert!(!guard.observe(1));
        assert!(!guard.observe(3));
        assert!(guard.observe(4));
    }
}
