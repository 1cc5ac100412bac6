//! Correlation bus
//!
//! Matches a value that arrives asynchronously (a worker connection) with the
//! single caller waiting for it. Each subscription is a one-shot slot keyed by
//! the value's correlation key, so publishing is a map removal rather than a
//! scan over every subscriber, and a value can be delivered at most once.

use dashmap::DashMap;
use std::fmt;
use std::hash::Hash;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::oneshot;

/// Correlation key for a worker connection
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct WorkerKey {
    pub agent_id: String,
    pub worker_id: String,
}

impl WorkerKey {
    pub fn new(agent_id: impl Into<String>, worker_id: impl Into<String>) -> Self {
        Self {
            agent_id: agent_id.into(),
            worker_id: worker_id.into(),
        }
    }
}

impl fmt::Display for WorkerKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.agent_id, self.worker_id)
    }
}

struct Slot<V> {
    seq: u64,
    tx: oneshot::Sender<V>,
}

struct BusInner<K, V>
where
    K: Eq + Hash,
{
    slots: DashMap<K, Slot<V>>,
    next_seq: AtomicU64,
}

/// One-shot publish/subscribe keyed by correlation key
pub struct WorkerBus<K, V>
where
    K: Eq + Hash,
{
    inner: Arc<BusInner<K, V>>,
}

impl<K, V> Clone for WorkerBus<K, V>
where
    K: Eq + Hash,
{
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

/// Handle identifying one subscription, usable to evict it
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SubscriptionToken<K> {
    key: K,
    seq: u64,
}

impl<K> SubscriptionToken<K> {
    pub fn key(&self) -> &K {
        &self.key
    }
}

/// A pending subscription
///
/// Dropping it evicts the slot, so an abandoned wait never keeps a slot alive.
pub struct Subscription<K, V>
where
    K: Eq + Hash + Clone,
{
    token: SubscriptionToken<K>,
    rx: oneshot::Receiver<V>,
    bus: WorkerBus<K, V>,
}

impl<K, V> WorkerBus<K, V>
where
    K: Eq + Hash + Clone,
{
    pub fn new() -> Self {
        Self {
            inner: Arc::new(BusInner {
                slots: DashMap::new(),
                next_seq: AtomicU64::new(1),
            }),
        }
    }

    /// Register interest in the next value published under `key`
    ///
    /// A second subscription under the same key replaces the first; the
    /// replaced subscriber sees its channel close without a value.
    pub fn subscribe(&self, key: K) -> Subscription<K, V> {
        let seq = self.inner.next_seq.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = oneshot::channel();
        self.inner.slots.insert(key.clone(), Slot { seq, tx });

        Subscription {
            token: SubscriptionToken { key, seq },
            rx,
            bus: self.clone(),
        }
    }

    /// Deliver `value` to the subscriber registered under `key`
    ///
    /// Never blocks. Hands the value back when nobody is waiting for it, so
    /// the caller decides how to dispose of it.
    pub fn publish(&self, key: &K, value: V) -> Result<(), V> {
        match self.inner.slots.remove(key) {
            Some((_, slot)) => slot.tx.send(value),
            None => Err(value),
        }
    }

    /// Remove a subscription
    ///
    /// A no-op when the subscription already fired or was already evicted.
    /// Returns true if a waiting slot was removed.
    pub fn evict(&self, token: &SubscriptionToken<K>) -> bool {
        self.inner
            .slots
            .remove_if(&token.key, |_, slot| slot.seq == token.seq)
            .is_some()
    }

    /// Number of subscriptions still waiting for a value
    pub fn pending(&self) -> usize {
        self.inner.slots.len()
    }
}

impl<K, V> Default for WorkerBus<K, V>
where
    K: Eq + Hash + Clone,
{
    fn default() -> Self {
        Self::new()
    }
}

impl<K, V> Subscription<K, V>
where
    K: Eq + Hash + Clone,
{
    pub fn token(&self) -> &SubscriptionToken<K> {
        &self.token
    }

    /// Wait for the published value
    ///
    /// Returns None if the subscription was evicted or replaced.
    pub async fn recv(&mut self) -> Option<V> {
        (&mut self.rx).await.ok()
    }
}

impl<K, V> Drop for Subscription<K, V>
where
    K: Eq + Hash + Clone,
{
    fn drop(&mut self) {
        self.bus.evict(&self.token);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn key(worker: &str) -> WorkerKey {
        WorkerKey::new("agent1", worker)
    }

    #[tokio::test]
    async fn test_subscribe_and_publish() {
        let bus: WorkerBus<WorkerKey, u32> = WorkerBus::new();

        let mut sub = bus.subscribe(key("w1"));
        assert_eq!(bus.pending(), 1);

        assert!(bus.publish(&key("w1"), 42).is_ok());
        assert_eq!(bus.pending(), 0);
        assert_eq!(sub.recv().await, Some(42));
    }

    #[tokio::test]
    async fn test_publish_without_subscriber_returns_value() {
        let bus: WorkerBus<WorkerKey, u32> = WorkerBus::new();
        assert_eq!(bus.publish(&key("nobody"), 7), Err(7));
    }

    #[tokio::test]
    async fn test_publish_does_not_match_other_keys() {
        let bus: WorkerBus<WorkerKey, u32> = WorkerBus::new();
        let _sub = bus.subscribe(key("w1"));

        assert_eq!(bus.publish(&key("w2"), 1), Err(1));
        assert_eq!(
            bus.publish(&WorkerKey::new("agent2", "w1"), 2),
            Err(2),
            "same worker id under another agent must not match"
        );
        assert_eq!(bus.pending(), 1);
    }

    #[tokio::test]
    async fn test_delivered_at_most_once() {
        let bus: WorkerBus<WorkerKey, u32> = WorkerBus::new();
        let mut sub = bus.subscribe(key("w1"));

        assert!(bus.publish(&key("w1"), 1).is_ok());
        assert_eq!(bus.publish(&key("w1"), 2), Err(2));
        assert_eq!(sub.recv().await, Some(1));
    }

    #[tokio::test]
    async fn test_evict_before_publish() {
        let bus: WorkerBus<WorkerKey, u32> = WorkerBus::new();
        let mut sub = bus.subscribe(key("w1"));

        assert!(bus.evict(sub.token()));
        assert_eq!(bus.publish(&key("w1"), 5), Err(5));
        assert_eq!(sub.recv().await, None);
    }

    #[tokio::test]
    async fn test_evict_after_fire_is_noop() {
        let bus: WorkerBus<WorkerKey, u32> = WorkerBus::new();
        let mut sub = bus.subscribe(key("w1"));

        bus.publish(&key("w1"), 9).unwrap();
        assert!(!bus.evict(sub.token()));
        assert!(!bus.evict(sub.token()));
        assert_eq!(sub.recv().await, Some(9));
    }

    #[tokio::test]
    async fn test_stale_token_does_not_evict_newer_subscription() {
        let bus: WorkerBus<WorkerKey, u32> = WorkerBus::new();
        let first = bus.subscribe(key("w1"));
        let stale = first.token().clone();
        let mut second = bus.subscribe(key("w1"));

        assert!(!bus.evict(&stale));
        drop(first);
        assert_eq!(bus.pending(), 1);

        bus.publish(&key("w1"), 3).unwrap();
        assert_eq!(second.recv().await, Some(3));
    }

    #[tokio::test]
    async fn test_drop_evicts() {
        let bus: WorkerBus<WorkerKey, u32> = WorkerBus::new();
        let sub = bus.subscribe(key("w1"));
        assert_eq!(bus.pending(), 1);

        drop(sub);
        assert_eq!(bus.pending(), 0);
        assert_eq!(bus.publish(&key("w1"), 1), Err(1));
    }

    #[tokio::test]
    async fn test_publish_from_another_task() {
        let bus: WorkerBus<WorkerKey, String> = WorkerBus::new();
        let mut sub = bus.subscribe(key("w1"));

        let publisher = bus.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(10)).await;
            publisher
                .publish(&key("w1"), "conn".to_string())
                .unwrap();
        });

        let value = tokio::time::timeout(Duration::from_secs(1), sub.recv())
            .await
            .unwrap();
        assert_eq!(value.as_deref(), Some("conn"));
    }

    #[tokio::test]
    async fn test_concurrent_subscribe_publish_evict() {
        let bus: WorkerBus<WorkerKey, usize> = WorkerBus::new();
        let mut handles = vec![];

        for i in 0..50 {
            let bus = bus.clone();
            handles.push(tokio::spawn(async move {
                let k = key(&format!("w{}", i));
                let mut sub = bus.subscribe(k.clone());

                let publisher = bus.clone();
                let pk = k.clone();
                let racer = tokio::spawn(async move { publisher.publish(&pk, i).is_ok() });

                let delivered = racer.await.unwrap();
                bus.evict(sub.token());

                if delivered {
                    assert_eq!(sub.recv().await, Some(i));
                } else {
                    assert_eq!(sub.recv().await, None);
                }
            }));
        }

        for handle in handles {
            handle.await.unwrap();
        }
        assert_eq!(bus.pending(), 0);
    }
}
