//! Non-blocking fan-out to independent observers.
//!
//! Every observer owns a bounded channel. [`Broadcaster::publish`] uses
//! `try_send` and never waits: an observer whose queue is full is either
//! dropped or has the message discarded, depending on
//! [`SlowObserverPolicy`]. An observer that went away (receiver dropped) is
//! always removed.
//!
//! ```text
//! publish(msg)
//!     ├──► [queue 1] ──► observer 1
//!     ├──► [queue 2] ──► observer 2   (full → dropped / skipped)
//!     └──► [queue N] ──► observer N
//! ```
//!
//! Messages to a single observer arrive in publish order.

use parking_lot::Mutex;
use std::sync::atomic::{AtomicU64, Ordering};
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;

/// Default queue depth per observer.
pub const DEFAULT_OBSERVER_CAPACITY: usize = 100;

/// What happens to an observer whose queue is full.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum SlowObserverPolicy {
    /// Remove the observer; its receiver sees the channel close.
    #[default]
    Drop,
    /// Discard this message for the observer and keep it subscribed.
    Skip,
}

type Filter<T> = Box<dyn Fn(&T) -> bool + Send + Sync>;

struct Observer<T> {
    id: u64,
    tx: mpsc::Sender<T>,
    filter: Option<Filter<T>>,
}

/// Receiving end of one observer.
#[derive(Debug)]
pub struct Subscription<T> {
    id: u64,
    rx: mpsc::Receiver<T>,
}

impl<T> Subscription<T> {
    pub fn id(&self) -> u64 {
        self.id
    }

    /// Next message, or `None` once the observer was dropped and drained.
    pub async fn recv(&mut self) -> Option<T> {
        self.rx.recv().await
    }

    pub fn try_recv(&mut self) -> Option<T> {
        self.rx.try_recv().ok()
    }

    pub fn into_inner(self) -> mpsc::Receiver<T> {
        self.rx
    }
}

/// Fan-out of `T` to any number of observers.
pub struct Broadcaster<T> {
    observers: Mutex<Vec<Observer<T>>>,
    next_id: AtomicU64,
    policy: SlowObserverPolicy,
    dropped_messages: AtomicU64,
    dropped_observers: AtomicU64,
}

impl<T> std::fmt::Debug for Broadcaster<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Broadcaster")
            .field("observers", &self.observers.lock().len())
            .field("policy", &self.policy)
            .finish_non_exhaustive()
    }
}

impl<T: Clone + Send + 'static> Default for Broadcaster<T> {
    fn default() -> Self {
        Self::new(SlowObserverPolicy::default())
    }
}

impl<T: Clone + Send + 'static> Broadcaster<T> {
    pub fn new(policy: SlowObserverPolicy) -> Self {
        Self {
            observers: Mutex::new(Vec::new()),
            next_id: AtomicU64::new(1),
            policy,
            dropped_messages: AtomicU64::new(0),
            dropped_observers: AtomicU64::new(0),
        }
    }

    /// Add an observer with a queue of `capacity` messages (minimum 1).
    pub fn subscribe(&self, capacity: usize) -> Subscription<T> {
        self.add_observer(capacity, None)
    }

    /// Add an observer that only receives messages matching `filter`.
    pub fn subscribe_filtered<F>(&self, capacity: usize, filter: F) -> Subscription<T>
    where
        F: Fn(&T) -> bool + Send + Sync + 'static,
    {
        self.add_observer(capacity, Some(Box::new(filter)))
    }

    fn add_observer(&self, capacity: usize, filter: Option<Filter<T>>) -> Subscription<T> {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        self.observers.lock().push(Observer { id, tx, filter });
        Subscription { id, rx }
    }

    /// Remove an observer explicitly.
    pub fn unsubscribe(&self, id: u64) {
        self.observers.lock().retain(|o| o.id != id);
    }

    /// Deliver `msg` to every interested observer without waiting.
    ///
    /// Returns how many observers accepted the message.
    pub fn publish(&self, msg: T) -> usize {
        let mut observers = self.observers.lock();
        let mut delivered = 0;
        let policy = self.policy;

        observers.retain(|observer| {
            if let Some(filter) = &observer.filter {
                if !filter(&msg) {
                    return true;
                }
            }
            match observer.tx.try_send(msg.clone()) {
                Ok(()) => {
                    delivered += 1;
                    true
                }
                Err(TrySendError::Full(_)) => {
                    self.dropped_messages.fetch_add(1, Ordering::Relaxed);
                    match policy {
                        SlowObserverPolicy::Skip => true,
                        SlowObserverPolicy::Drop => {
                            tracing::warn!(observer = observer.id, "Dropping slow observer");
                            self.dropped_observers.fetch_add(1, Ordering::Relaxed);
                            false
                        }
                    }
                }
                Err(TrySendError::Closed(_)) => {
                    tracing::debug!(observer = observer.id, "Observer went away");
                    false
                }
            }
        });

        delivered
    }

    pub fn observer_count(&self) -> usize {
        self.observers.lock().len()
    }

    /// Messages not delivered because a queue was full.
    pub fn dropped_messages(&self) -> u64 {
        self.dropped_messages.load(Ordering::Relaxed)
    }

    /// Observers removed for being too slow.
    pub fn dropped_observers(&self) -> u64 {
        self.dropped_observers.load(Ordering::Relaxed)
    }

    /// Remove every observer; their receivers see the channel close.
    pub fn close(&self) {
        self.observers.lock().clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_fan_out_in_order() {
        let bus = Broadcaster::<u32>::default();
        let mut a = bus.subscribe(10);
        let mut b = bus.subscribe(10);

        for i in 0..5 {
            assert_eq!(bus.publish(i), 2);
        }

        for i in 0..5 {
            assert_eq!(a.recv().await, Some(i));
            assert_eq!(b.recv().await, Some(i));
        }
    }

    #[tokio::test]
    async fn test_slow_observer_dropped_without_blocking() {
        let bus = Broadcaster::<u32>::new(SlowObserverPolicy::Drop);
        let mut slow = bus.subscribe(1);
        let mut fast = bus.subscribe(100);

        for i in 0..10 {
            bus.publish(i);
            assert_eq!(fast.recv().await, Some(i));
        }

        assert_eq!(bus.observer_count(), 1);
        assert_eq!(bus.dropped_observers(), 1);
        assert_eq!(slow.recv().await, Some(0));
        assert_eq!(slow.recv().await, None);
    }

    #[tokio::test]
    async fn test_slow_observer_skipped() {
        let bus = Broadcaster::<u32>::new(SlowObserverPolicy::Skip);
        let mut slow = bus.subscribe(2);

        for i in 0..5 {
            bus.publish(i);
        }

        assert_eq!(bus.observer_count(), 1);
        assert_eq!(bus.dropped_messages(), 3);
        assert_eq!(slow.try_recv(), Some(0));
        assert_eq!(slow.try_recv(), Some(1));
        assert_eq!(slow.try_recv(), None);

        bus.publish(9);
        assert_eq!(slow.try_recv(), Some(9));
    }

    #[tokio::test]
    async fn test_closed_observer_removed() {
        let bus = Broadcaster::<u32>::default();
        let sub = bus.subscribe(4);
        drop(sub);
        assert_eq!(bus.publish(1), 0);
        assert_eq!(bus.observer_count(), 0);
    }

    #[tokio::test]
    async fn test_filtered_observer() {
        let bus = Broadcaster::<u32>::default();
        let mut evens = bus.subscribe_filtered(10, |n| n % 2 == 0);
        for i in 0..6 {
            bus.publish(i);
        }
        assert_eq!(evens.try_recv(), Some(0));
        assert_eq!(evens.try_recv(), Some(2));
        assert_eq!(evens.try_recv(), Some(4));
        assert_eq!(evens.try_recv(), None);
    }

    #[tokio::test]
    async fn test_unsubscribe() {
        let bus = Broadcaster::<u32>::default();
        let sub = bus.subscribe(1);
        bus.unsubscribe(sub.id());
        assert_eq!(bus.observer_count(), 0);
    }
}
