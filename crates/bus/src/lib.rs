//! Topic-keyed in-process event bus with bounded per-subscriber fan-out.
#![warn(missing_docs)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]
#![warn(clippy::nursery)]

mod topic;

pub use topic::Topic;

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, Weak};

use tokio::sync::oneshot;
use tokio::sync::Notify;
use tracing::warn;

/// Default per-subscriber buffer capacity.
pub const DEFAULT_CAPACITY: usize = 10;

/// Topic-keyed pub/sub bus.
///
/// Each subscriber owns a bounded ring buffer; if a subscriber falls behind,
/// the oldest buffered delivery for that subscriber is dropped and counted.
/// [`Bus::emit`] hands the event to every current subscriber of the topic
/// before the returned [`EmitHandle`] resolves, so publishers that await
/// their handles get a happens-before edge with the deliveries.
pub struct Bus<T> {
    inner: Arc<Inner<T>>,
}

impl<T> Clone for Bus<T> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

struct Inner<T> {
    topics: Mutex<HashMap<Topic, Vec<Entry<T>>>>,
    capacity: usize,
    next_id: AtomicU64,
    dropped: AtomicU64,
}

struct Entry<T> {
    id: u64,
    once: bool,
    shared: Arc<Shared<T>>,
}

struct Shared<T> {
    queue: Mutex<VecDeque<T>>,
    notify: Notify,
    closed: AtomicBool,
}

impl<T: Clone> Bus<T> {
    /// Creates a bus with the given per-subscriber buffer capacity.
    #[must_use]
    pub fn new(capacity: usize) -> Self {
        Self {
            inner: Arc::new(Inner {
                topics: Mutex::new(HashMap::new()),
                capacity,
                next_id: AtomicU64::new(0),
                dropped: AtomicU64::new(0),
            }),
        }
    }

    /// Subscribes to a topic until the subscription is dropped.
    #[must_use]
    pub fn on(&self, topic: Topic) -> Subscription<T> {
        self.subscribe(topic, false)
    }

    /// Subscribes to a topic for exactly one delivery.
    ///
    /// The subscription is removed from the bus as soon as an event is
    /// handed to it; `recv` returns that event and then `None`.
    #[must_use]
    pub fn once(&self, topic: Topic) -> Subscription<T> {
        self.subscribe(topic, true)
    }

    fn subscribe(&self, topic: Topic, once: bool) -> Subscription<T> {
        let id = self.inner.next_id.fetch_add(1, Ordering::Relaxed);
        let shared = Arc::new(Shared {
            queue: Mutex::new(VecDeque::new()),
            notify: Notify::new(),
            closed: AtomicBool::new(false),
        });
        let mut topics = self.inner.topics.lock().expect("bus lock poisoned");
        topics.entry(topic.clone()).or_default().push(Entry {
            id,
            once,
            shared: shared.clone(),
        });
        Subscription {
            id,
            topic,
            shared,
            inner: Arc::downgrade(&self.inner),
        }
    }

    /// Publishes an event to every current subscriber of the topic.
    ///
    /// Delivery happens before this call returns; the handle reports how
    /// many subscribers the event was handed to, so callers can batch
    /// handles and await them all (the reconciler does this per tick).
    pub fn emit(&self, topic: &Topic, event: T) -> EmitHandle {
        let recipients = {
            let mut topics = self.inner.topics.lock().expect("bus lock poisoned");
            let recipients = match topics.get_mut(topic) {
                Some(entries) => {
                    let recipients: Vec<Entry<T>> = entries
                        .iter()
                        .map(|e| Entry {
                            id: e.id,
                            once: e.once,
                            shared: e.shared.clone(),
                        })
                        .collect();
                    // Once-subscriptions get exactly one delivery.
                    entries.retain(|e| !e.once);
                    recipients
                }
                None => Vec::new(),
            };
            if topics.get(topic).is_some_and(|entries| entries.is_empty()) {
                topics.remove(topic);
            }
            recipients
        };

        let delivered = recipients.len();
        for entry in recipients {
            let mut queue = entry.shared.queue.lock().expect("bus lock poisoned");
            if queue.len() >= self.inner.capacity {
                queue.pop_front();
                let total = self.inner.dropped.fetch_add(1, Ordering::Relaxed) + 1;
                warn!(topic = %topic, total, "subscriber buffer full, dropped oldest delivery");
            }
            queue.push_back(event.clone());
            drop(queue);
            if entry.once {
                entry.shared.closed.store(true, Ordering::Release);
            }
            entry.shared.notify.notify_one();
        }

        let (tx, rx) = oneshot::channel();
        let _ = tx.send(delivered);
        EmitHandle { rx }
    }

    /// Closes every subscription; pending `recv` calls return their buffered
    /// events and then `None`.
    pub fn shutdown(&self) {
        let topics = {
            let mut topics = self.inner.topics.lock().expect("bus lock poisoned");
            std::mem::take(&mut *topics)
        };
        for entries in topics.into_values() {
            for entry in entries {
                entry.shared.closed.store(true, Ordering::Release);
                entry.shared.notify.notify_one();
            }
        }
    }

    /// Total deliveries dropped because a subscriber buffer was full.
    #[must_use]
    pub fn dropped(&self) -> u64 {
        self.inner.dropped.load(Ordering::Relaxed)
    }
}

/// A subscription to one topic.
///
/// Dropping the subscription unsubscribes it from the bus.
pub struct Subscription<T> {
    id: u64,
    topic: Topic,
    shared: Arc<Shared<T>>,
    inner: Weak<Inner<T>>,
}

impl<T> Subscription<T> {
    /// The topic this subscription listens on.
    #[must_use]
    pub const fn topic(&self) -> &Topic {
        &self.topic
    }

    /// Receives the next buffered event.
    ///
    /// Returns `None` once the subscription is closed (one-shot delivery
    /// consumed, or bus shutdown) and the buffer is empty. Cancel-safe: a
    /// cancelled `recv` never loses an event.
    pub async fn recv(&mut self) -> Option<T> {
        loop {
            let notified = self.shared.notify.notified();
            if let Some(event) = self
                .shared
                .queue
                .lock()
                .expect("bus lock poisoned")
                .pop_front()
            {
                return Some(event);
            }
            if self.shared.closed.load(Ordering::Acquire) {
                return None;
            }
            notified.await;
        }
    }
}

impl<T> Drop for Subscription<T> {
    fn drop(&mut self) {
        if let Some(inner) = self.inner.upgrade() {
            let mut topics = inner.topics.lock().expect("bus lock poisoned");
            if let Some(entries) = topics.get_mut(&self.topic) {
                entries.retain(|e| e.id != self.id);
            }
            if topics.get(&self.topic).is_some_and(|entries| entries.is_empty()) {
                topics.remove(&self.topic);
            }
        }
    }
}

/// Completion handle returned by [`Bus::emit`].
pub struct EmitHandle {
    rx: oneshot::Receiver<usize>,
}

impl EmitHandle {
    /// Resolves once the event has been handed to every subscriber,
    /// returning the number of subscribers it reached.
    pub async fn wait(self) -> usize {
        self.rx.await.unwrap_or(0)
    }
}
