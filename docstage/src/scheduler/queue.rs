//! Delay-aware, deduplicating work queue.

use crate::core::StageKey;
use parking_lot::Mutex;
use std::cmp::Reverse;
use std::collections::{BinaryHeap, HashMap, VecDeque};
use std::time::Duration;
use tokio::sync::Notify;
use tokio::time::Instant;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Slot {
    Delayed(Instant),
    Ready,
}

#[derive(Debug, Default)]
struct QueueState {
    delayed: BinaryHeap<Reverse<(Instant, StageKey)>>,
    ready: VecDeque<StageKey>,
    slots: HashMap<StageKey, Slot>,
    closed: bool,
}

impl QueueState {
    /// Moves elapsed entries to the ready list. Heap entries superseded by
    /// an earlier deadline for the same key are dropped.
    fn promote(&mut self, now: Instant) {
        while let Some(Reverse((at, _))) = self.delayed.peek() {
            if *at > now {
                break;
            }
            let Some(Reverse((at, key))) = self.delayed.pop() else {
                break;
            };
            if self.slots.get(&key) == Some(&Slot::Delayed(at)) {
                self.slots.insert(key.clone(), Slot::Ready);
                self.ready.push_back(key);
            }
        }
    }

    fn next_deadline(&self) -> Option<Instant> {
        self.delayed.peek().map(|Reverse((at, _))| *at)
    }
}

/// Queue of `(document, stage, not_before)` entries.
///
/// Each key is queued at most once; pushing a queued key again only moves
/// its deadline earlier. [`pop`](Self::pop) doubles as the dispatcher:
/// it promotes elapsed entries and sleeps until the next deadline.
#[derive(Debug, Default)]
pub struct SchedulingQueue {
    state: Mutex<QueueState>,
    notify: Notify,
}

impl SchedulingQueue {
    /// Creates an empty queue.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Queues a key for immediate dispatch. Returns false if it was already
    /// ready or the queue is closed.
    pub fn push(&self, key: StageKey) -> bool {
        self.push_at(key, Instant::now())
    }

    /// Queues a key to become ready after `delay`.
    pub fn push_after(&self, key: StageKey, delay: Duration) -> bool {
        self.push_at(key, Instant::now() + delay)
    }

    /// Queues a key to become ready at `not_before`.
    pub fn push_at(&self, key: StageKey, not_before: Instant) -> bool {
        let mut state = self.state.lock();
        if state.closed {
            return false;
        }
        match state.slots.get(&key) {
            Some(Slot::Ready) => return false,
            Some(Slot::Delayed(at)) if *at <= not_before => return false,
            _ => {}
        }
        state.slots.insert(key.clone(), Slot::Delayed(not_before));
        state.delayed.push(Reverse((not_before, key)));
        drop(state);
        self.notify.notify_one();
        true
    }

    /// Waits for the next ready key. Returns `None` once the queue is closed.
    pub async fn pop(&self) -> Option<StageKey> {
        loop {
            let notified = self.notify.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            let deadline = {
                let mut state = self.state.lock();
                if state.closed {
                    return None;
                }
                state.promote(Instant::now());
                if let Some(key) = state.ready.pop_front() {
                    state.slots.remove(&key);
                    return Some(key);
                }
                state.next_deadline()
            };

            match deadline {
                Some(at) => {
                    tokio::select! {
                        () = &mut notified => {}
                        () = tokio::time::sleep_until(at) => {}
                    }
                }
                None => notified.await,
            }
        }
    }

    /// Takes a ready key without waiting.
    pub fn try_pop(&self) -> Option<StageKey> {
        let mut state = self.state.lock();
        if state.closed {
            return None;
        }
        state.promote(Instant::now());
        let key = state.ready.pop_front()?;
        state.slots.remove(&key);
        Some(key)
    }

    /// Closes the queue and wakes every waiter. Queued keys are dropped;
    /// their rows stay pending and are found again by the next scan.
    pub fn close(&self) {
        let mut state = self.state.lock();
        state.closed = true;
        state.delayed.clear();
        state.ready.clear();
        state.slots.clear();
        drop(state);
        self.notify.notify_waiters();
    }

    /// Returns whether the queue is closed.
    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.state.lock().closed
    }

    /// Number of distinct queued keys, delayed or ready.
    #[must_use]
    pub fn len(&self) -> usize {
        self.state.lock().slots.len()
    }

    /// Returns true if nothing is queued.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Returns whether a key is queued.
    #[must_use]
    pub fn contains(&self, key: &StageKey) -> bool {
        self.state.lock().slots.contains_key(key)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    fn key(stage: &str) -> StageKey {
        StageKey::new("d1", stage)
    }

    #[tokio::test]
    async fn test_push_deduplicates() {
        let queue = SchedulingQueue::new();
        assert!(queue.push(key("a")));
        assert!(!queue.push(key("a")));
        assert!(queue.push(key("b")));
        assert_eq!(queue.len(), 2);

        assert_eq!(queue.pop().await, Some(key("a")));
        assert_eq!(queue.pop().await, Some(key("b")));
        assert!(queue.is_empty());
        assert!(queue.push(key("a")));
    }

    #[tokio::test]
    async fn test_delayed_entry_waits() {
        let queue = SchedulingQueue::new();
        queue.push_after(key("a"), Duration::from_millis(50));
        assert!(queue.try_pop().is_none());

        let started = Instant::now();
        assert_eq!(queue.pop().await, Some(key("a")));
        assert!(started.elapsed() >= Duration::from_millis(40));
    }

    #[tokio::test]
    async fn test_earlier_push_moves_deadline() {
        let queue = SchedulingQueue::new();
        queue.push_after(key("a"), Duration::from_secs(60));
        assert!(queue.push(key("a")));
        assert_eq!(queue.len(), 1);
        assert_eq!(queue.try_pop(), Some(key("a")));
        assert!(queue.try_pop().is_none());
    }

    #[tokio::test]
    async fn test_later_push_is_ignored() {
        let queue = SchedulingQueue::new();
        queue.push(key("a"));
        assert!(!queue.push_after(key("a"), Duration::from_secs(60)));
        assert_eq!(queue.try_pop(), Some(key("a")));
    }

    #[tokio::test]
    async fn test_close_releases_waiters() {
        let queue = Arc::new(SchedulingQueue::new());
        let waiter = {
            let queue = Arc::clone(&queue);
            tokio::spawn(async move { queue.pop().await })
        };
        tokio::time::sleep(Duration::from_millis(10)).await;
        queue.close();

        assert_eq!(waiter.await.unwrap(), None);
        assert!(!queue.push(key("a")));
        assert!(queue.is_closed());
    }

    #[tokio::test]
    async fn test_push_wakes_waiter() {
        let queue = Arc::new(SchedulingQueue::new());
        let waiter = {
            let queue = Arc::clone(&queue);
            tokio::spawn(async move { queue.pop().await })
        };
        tokio::time::sleep(Duration::from_millis(10)).await;
        queue.push(key("a"));

        let popped = tokio::time::timeout(Duration::from_secs(1), waiter).await.unwrap().unwrap();
        assert_eq!(popped, Some(key("a")));
    }
}
