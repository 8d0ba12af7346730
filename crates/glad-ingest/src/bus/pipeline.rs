// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Bus pipeline lifecycle: ring first, subscriptions second; reverse on stop.

use super::consumer::BusEventConsumer;
use super::filter::TypeFilter;
use super::subscriber::BusSubscriber;
use super::{BusMessage, MessageBus};
use crate::codec::BusTranslator;
use crate::config::IngestConfig;
use crate::error::{IngestError, QueueError, Result};
use crate::metrics::IngestMetrics;
use crate::ring::{ProducerMode, RingBuffer, RingConfig, RingStats, WaitStrategy};
use crate::sink::StoreSink;
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::Arc;
use std::time::Duration;

const STATE_IDLE: u8 = 0;
const STATE_RUNNING: u8 = 1;
const STATE_STOPPED: u8 = 2;

#[derive(Debug, Clone)]
pub struct BusSettings {
    pub topics: Vec<String>,
    pub accepted_types: Vec<String>,
    pub ring_size: usize,
    pub wait: WaitStrategy,
    pub yellow_percent: u8,
    pub red_percent: u8,
    pub drain_timeout: Duration,
}

impl From<&IngestConfig> for BusSettings {
    fn from(config: &IngestConfig) -> Self {
        Self {
            topics: config.bus_topics.clone(),
            accepted_types: config.bus_accepted_types.clone(),
            ring_size: config.bus_ring_size,
            wait: config.bus_wait_strategy,
            yellow_percent: config.health_yellow_percent,
            red_percent: config.health_red_percent,
            drain_timeout: config.drain_timeout(),
        }
    }
}

/// Owns the shared bus ring and the subscriber feeding it.
pub struct BusIngest {
    ring: RingBuffer<Arc<BusMessage>>,
    subscriber: BusSubscriber,
    consumer: parking_lot::Mutex<Option<BusEventConsumer>>,
    metrics: Arc<IngestMetrics>,
    drain_timeout: Duration,
    state: AtomicU8,
}

impl BusIngest {
    pub fn new(
        bus: Arc<dyn MessageBus>,
        settings: BusSettings,
        translator: Arc<dyn BusTranslator>,
        sink: Arc<dyn StoreSink>,
        metrics: Arc<IngestMetrics>,
    ) -> Result<Self> {
        let ring = RingBuffer::new(
            RingConfig::new("bus", settings.ring_size, ProducerMode::Multi)
                .wait(settings.wait)
                .thresholds(settings.yellow_percent, settings.red_percent),
        );
        let producer = ring
            .multi_producer()
            .ok_or(IngestError::Queue(QueueError::Halted))?;
        let subscriber = BusSubscriber::new(
            bus,
            settings.topics,
            TypeFilter::accept(settings.accepted_types),
            producer,
            Arc::clone(&metrics),
        );
        let consumer = BusEventConsumer::new(translator, sink, Arc::clone(&metrics));

        Ok(Self {
            ring,
            subscriber,
            consumer: parking_lot::Mutex::new(Some(consumer)),
            metrics,
            drain_timeout: settings.drain_timeout,
            state: AtomicU8::new(STATE_IDLE),
        })
    }

    /// Start the consumer, then activate subscriptions. Returns the number of
    /// topics subscribed.
    pub fn start(&self) -> Result<usize> {
        if self
            .state
            .compare_exchange(STATE_IDLE, STATE_RUNNING, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return Err(IngestError::AlreadyRunning);
        }

        let consumer = self
            .consumer
            .lock()
            .take()
            .ok_or(IngestError::AlreadyRunning)?;
        self.ring.start(consumer)?;

        match self.subscriber.start() {
            Ok(n) => {
                tracing::info!(
                    "[bus] ingest running on {} topics (ring {})",
                    n,
                    self.ring.capacity()
                );
                Ok(n)
            }
            Err(e) => {
                self.state.store(STATE_STOPPED, Ordering::Release);
                self.ring.shutdown(self.drain_timeout);
                Err(e.into())
            }
        }
    }

    /// Deactivate subscriptions, drain callbacks, then drain and stop the
    /// consumer. Idempotent.
    pub fn stop(&self) {
        let prev = self.state.swap(STATE_STOPPED, Ordering::AcqRel);
        if prev == STATE_STOPPED {
            return;
        }
        self.subscriber.stop(self.drain_timeout);
        let abandoned = self.ring.shutdown(self.drain_timeout);
        self.metrics.bus.stage.record_dropped(abandoned as u64);
        tracing::info!(
            "[bus] ingest stopped ({} consumed, {} abandoned)",
            self.ring.consumed(),
            abandoned
        );
    }

    pub fn is_running(&self) -> bool {
        self.state.load(Ordering::Acquire) == STATE_RUNNING
    }

    pub fn stats(&self) -> BusIngestStats {
        BusIngestStats {
            running: self.is_running(),
            topics: self.subscriber.topics().to_vec(),
            active_topics: self.subscriber.active_topics(),
            ring: self.ring.stats(),
        }
    }
}

impl Drop for BusIngest {
    fn drop(&mut self) {
        self.stop();
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BusIngestStats {
    pub running: bool,
    pub topics: Vec<String>,
    pub active_topics: Vec<String>,
    pub ring: RingStats,
}
