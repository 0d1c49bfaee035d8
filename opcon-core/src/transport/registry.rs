//! Topic subscriptions kept for the lifetime of a session.
//!
//! The broker forgets subscriptions on every clean-session reconnect;
//! the transport replays this registry, in insertion order, each time
//! the link comes back up.

use std::sync::{Mutex, MutexGuard};

use crate::transport::QoS;

/// One topic binding.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Subscription {
    pub topic: String,
    pub qos: QoS,
}

#[derive(Debug, Default)]
pub struct SubscriptionRegistry {
    entries: Mutex<Vec<Subscription>>,
}

impl SubscriptionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    fn entries(&self) -> MutexGuard<'_, Vec<Subscription>> {
        match self.entries.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    /// Add a binding, or update the QoS of an existing one in place.
    pub fn record(&self, topic: &str, qos: QoS) {
        let mut entries = self.entries();
        match entries.iter_mut().find(|s| s.topic == topic) {
            Some(existing) => existing.qos = qos,
            None => entries.push(Subscription {
                topic: topic.to_string(),
                qos,
            }),
        }
    }

    /// Remove a binding. Returns whether it existed.
    pub fn remove(&self, topic: &str) -> bool {
        let mut entries = self.entries();
        let before = entries.len();
        entries.retain(|s| s.topic != topic);
        entries.len() != before
    }

    pub fn contains(&self, topic: &str) -> bool {
        self.entries().iter().any(|s| s.topic == topic)
    }

    /// Ordered copy used for replay.
    pub fn snapshot(&self) -> Vec<Subscription> {
        self.entries().clone()
    }

    pub fn len(&self) -> usize {
        self.entries().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries().is_empty()
    }
}
