// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! In-process bus.
//!
//! Delivers synchronously on the publisher's thread, so concurrent publishers
//! behave like a broker client with several delivery threads. Used by tests,
//! the loaders and single-host deployments.

use super::{BusListener, BusMessage, MessageBus, SubscriptionId};
use crate::error::BusError;
use dashmap::{DashMap, DashSet};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

struct Subscription {
    topic: String,
    listener: Arc<dyn BusListener>,
}

#[derive(Default)]
pub struct LocalBus {
    subscriptions: DashMap<SubscriptionId, Subscription>,
    next_id: AtomicU64,
    closed: AtomicBool,
    refuse_topics: DashSet<String>,
    published: AtomicU64,
}

impl LocalBus {
    pub fn new() -> Self {
        Self::default()
    }

    /// Deliver to every subscriber of `message.topic`. Returns the number of
    /// listeners reached.
    pub fn publish(&self, message: BusMessage) -> Result<usize, BusError> {
        if self.closed.load(Ordering::Acquire) {
            return Err(BusError::Closed);
        }
        let message = Arc::new(message);
        let listeners = self.listeners_of(&message.topic);
        for listener in &listeners {
            listener.on_message(Arc::clone(&message));
        }
        self.published.fetch_add(1, Ordering::Relaxed);
        Ok(listeners.len())
    }

    /// Report a delivery error to every subscriber of `topic`.
    pub fn report_error(&self, topic: &str, error: BusError) {
        for listener in self.listeners_of(topic) {
            listener.on_error(topic, error.clone());
        }
    }

    /// Make later subscriptions to `topic` fail.
    pub fn refuse_topic(&self, topic: &str) {
        self.refuse_topics.insert(topic.to_string());
    }

    pub fn subscription_count(&self) -> usize {
        self.subscriptions.len()
    }

    pub fn published(&self) -> u64 {
        self.published.load(Ordering::Relaxed)
    }

    /// Disconnect every subscriber.
    pub fn close(&self) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        let subs: Vec<(String, Arc<dyn BusListener>)> = self
            .subscriptions
            .iter()
            .map(|e| (e.value().topic.clone(), Arc::clone(&e.value().listener)))
            .collect();
        self.subscriptions.clear();
        for (topic, listener) in subs {
            listener.on_error(&topic, BusError::Closed);
        }
    }

    // Clone listeners out so no map lock is held while delivering.
    fn listeners_of(&self, topic: &str) -> Vec<Arc<dyn BusListener>> {
        self.subscriptions
            .iter()
            .filter(|e| e.value().topic == topic)
            .map(|e| Arc::clone(&e.value().listener))
            .collect()
    }
}

impl MessageBus for LocalBus {
    fn subscribe(
        &self,
        topic: &str,
        listener: Arc<dyn BusListener>,
    ) -> Result<SubscriptionId, BusError> {
        if self.closed.load(Ordering::Acquire) {
            return Err(BusError::Closed);
        }
        if self.refuse_topics.contains(topic) {
            return Err(BusError::Subscribe(format!("topic '{}' refused", topic)));
        }
        let id = SubscriptionId(self.next_id.fetch_add(1, Ordering::Relaxed) + 1);
        self.subscriptions.insert(
            id,
            Subscription {
                topic: topic.to_string(),
                listener,
            },
        );
        Ok(id)
    }

    fn unsubscribe(&self, id: SubscriptionId) -> Result<(), BusError> {
        self.subscriptions
            .remove(&id)
            .map(|_| ())
            .ok_or_else(|| BusError::Subscribe(format!("unknown subscription {}", id.0)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bus::MessageType;
    use parking_lot::Mutex;

    #[derive(Default)]
    struct Recorder {
        topics: Mutex<Vec<String>>,
        errors: Mutex<Vec<BusError>>,
    }

    impl BusListener for Recorder {
        fn on_message(&self, message: Arc<BusMessage>) {
            self.topics.lock().push(message.topic.clone());
        }

        fn on_error(&self, _topic: &str, error: BusError) {
            self.errors.lock().push(error);
        }
    }

    #[test]
    fn test_routes_by_topic() {
        let bus = LocalBus::new();
        let a = Arc::new(Recorder::default());
        let b = Arc::new(Recorder::default());
        bus.subscribe("a", a.clone()).expect("subscribe a");
        let sub_b = bus.subscribe("b", b.clone()).expect("subscribe b");

        assert_eq!(
            bus.publish(BusMessage::new("a", MessageType::EventRecord, vec![])),
            Ok(1)
        );
        assert_eq!(
            bus.publish(BusMessage::new("c", MessageType::EventRecord, vec![])),
            Ok(0)
        );
        bus.unsubscribe(sub_b).expect("unsubscribe");
        bus.publish(BusMessage::new("b", MessageType::EventRecord, vec![]))
            .expect("publish");

        assert_eq!(*a.topics.lock(), vec!["a".to_string()]);
        assert!(b.topics.lock().is_empty());
        assert!(bus.unsubscribe(sub_b).is_err());
    }

    #[test]
    fn test_refused_topic_and_close() {
        let bus = LocalBus::new();
        bus.refuse_topic("bad");
        let r = Arc::new(Recorder::default());
        assert!(bus.subscribe("bad", r.clone()).is_err());
        bus.subscribe("good", r.clone()).expect("subscribe");

        bus.report_error("good", BusError::Disconnected("broker gone".into()));
        bus.close();
        assert_eq!(
            *r.errors.lock(),
            vec![
                BusError::Disconnected("broker gone".into()),
                BusError::Closed
            ]
        );
        assert_eq!(
            bus.publish(BusMessage::new("good", MessageType::EventRecord, vec![])),
            Err(BusError::Closed)
        );
    }
}
