// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Topic subscriptions feeding the shared bus ring.

use super::filter::TypeFilter;
use super::{BusListener, BusMessage, MessageBus, SubscriptionId};
use crate::error::{BusError, QueueError};
use crate::metrics::IngestMetrics;
use crate::ring::MultiProducer;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

/// Callback target registered on every topic.
struct SubscriberListener {
    producer: MultiProducer<Arc<BusMessage>>,
    filter: TypeFilter,
    metrics: Arc<IngestMetrics>,
    active: AtomicBool,
    in_flight: AtomicUsize,
}

impl SubscriberListener {
    fn enqueue(&self, message: Arc<BusMessage>) {
        let stage = &self.metrics.bus.stage;
        let message = match self.producer.try_publish(message) {
            Ok(()) => return,
            Err((QueueError::Full, message)) => {
                stage.record_queue_full();
                message
            }
            Err((e, message)) => {
                stage.record_dropped(1);
                tracing::warn!("[bus] dropping message on {}: {}", message.topic, e);
                return;
            }
        };
        if let Err(e) = self.producer.publish(message) {
            stage.record_dropped(1);
            tracing::warn!("[bus] dropping message after wait: {}", e);
        }
    }
}

impl BusListener for SubscriberListener {
    fn on_message(&self, message: Arc<BusMessage>) {
        // Register before checking `active` so stop() either sees us or we see it.
        self.in_flight.fetch_add(1, Ordering::SeqCst);
        if !self.active.load(Ordering::SeqCst) {
            self.in_flight.fetch_sub(1, Ordering::SeqCst);
            return;
        }

        let type_name = message.message_type.name();
        self.metrics.bus.stage.record_received(message.payload.len());
        self.metrics.bus.record_received_type(type_name);

        if self.filter.matches(type_name) {
            self.enqueue(message);
        } else {
            self.metrics.bus.stage.record_filtered();
            tracing::debug!("[bus] {} on {} filtered", type_name, message.topic);
        }

        self.in_flight.fetch_sub(1, Ordering::SeqCst);
    }

    fn on_error(&self, topic: &str, error: BusError) {
        self.metrics.bus.record_delivery_error();
        tracing::warn!("[bus] delivery error on {}: {}", topic, error);
    }
}

/// Subscribes to configured topics and republishes accepted messages into a
/// shared ring.
pub struct BusSubscriber {
    bus: Arc<dyn MessageBus>,
    topics: Vec<String>,
    listener: Arc<SubscriberListener>,
    subscriptions: Mutex<Vec<(String, SubscriptionId)>>,
}

impl BusSubscriber {
    pub fn new(
        bus: Arc<dyn MessageBus>,
        topics: Vec<String>,
        filter: TypeFilter,
        producer: MultiProducer<Arc<BusMessage>>,
        metrics: Arc<IngestMetrics>,
    ) -> Self {
        Self {
            bus,
            topics,
            listener: Arc::new(SubscriberListener {
                producer,
                filter,
                metrics,
                active: AtomicBool::new(false),
                in_flight: AtomicUsize::new(0),
            }),
            subscriptions: Mutex::new(Vec::new()),
        }
    }

    /// Subscribe to every topic. A failing topic is logged and skipped; fails
    /// only when no topic could be subscribed.
    pub fn start(&self) -> Result<usize, BusError> {
        let mut subs = self.subscriptions.lock();
        if !subs.is_empty() {
            return Ok(subs.len());
        }
        self.listener.active.store(true, Ordering::SeqCst);

        let listener: Arc<dyn BusListener> = self.listener.clone();
        let mut last_error = None;
        for topic in &self.topics {
            match self.bus.subscribe(topic, Arc::clone(&listener)) {
                Ok(id) => {
                    tracing::info!("[bus] subscribed to {}", topic);
                    subs.push((topic.clone(), id));
                }
                Err(e) => {
                    tracing::error!("[bus] failed to subscribe to {}: {}", topic, e);
                    last_error = Some(e);
                }
            }
        }

        if subs.is_empty() {
            self.listener.active.store(false, Ordering::SeqCst);
            return Err(last_error.unwrap_or_else(|| BusError::Subscribe("no topics".into())));
        }
        Ok(subs.len())
    }

    /// Unsubscribe everything and wait up to `drain` for callbacks in progress.
    /// Returns false if callbacks were still running at the deadline.
    pub fn stop(&self, drain: Duration) -> bool {
        self.listener.active.store(false, Ordering::SeqCst);

        let subs: Vec<(String, SubscriptionId)> = self.subscriptions.lock().drain(..).collect();
        for (topic, id) in subs {
            if let Err(e) = self.bus.unsubscribe(id) {
                tracing::warn!("[bus] unsubscribe from {} failed: {}", topic, e);
            }
        }

        let deadline = Instant::now() + drain;
        while self.listener.in_flight.load(Ordering::SeqCst) > 0 {
            if Instant::now() >= deadline {
                tracing::warn!(
                    "[bus] {} callbacks still in flight after {:?}",
                    self.listener.in_flight.load(Ordering::SeqCst),
                    drain
                );
                return false;
            }
            thread::sleep(Duration::from_millis(1));
        }
        true
    }

    pub fn topics(&self) -> &[String] {
        &self.topics
    }

    /// Topics currently subscribed.
    pub fn active_topics(&self) -> Vec<String> {
        self.subscriptions
            .lock()
            .iter()
            .map(|(t, _)| t.clone())
            .collect()
    }

    pub fn is_active(&self) -> bool {
        self.listener.active.load(Ordering::SeqCst)
    }
}
