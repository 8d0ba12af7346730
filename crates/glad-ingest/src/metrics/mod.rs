// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Ingestion metrics with independent atomic counters.
//!
//! Every pipeline instance owns its own [`IngestMetrics`]; nothing here is
//! process-global. Counters only ever increase. Reads never take a lock, so
//! [`IngestMetrics::snapshot`] cannot stall the ingest path.
//!
//! # Performance
//! - Counter increment: one Relaxed `fetch_add`
//! - Queue-wait sample: four atomics plus a short CAS loop for the sum of squares
//! - Snapshot: loads only

mod reporter;

pub use reporter::MetricsReporter;

use crate::record::RecordKind;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

/// Lock-free running summary (count, min, max, mean, variance).
pub struct RunningSummary {
    count: AtomicU64,
    sum_ns: AtomicU64,
    /// f64 bit pattern of the sum of squared samples (ns^2).
    sum_sq: AtomicU64,
    min_ns: AtomicU64,
    max_ns: AtomicU64,
}

impl RunningSummary {
    pub fn new() -> Self {
        Self {
            count: AtomicU64::new(0),
            sum_ns: AtomicU64::new(0),
            sum_sq: AtomicU64::new(0f64.to_bits()),
            min_ns: AtomicU64::new(u64::MAX),
            max_ns: AtomicU64::new(0),
        }
    }

    pub fn record(&self, sample: Duration) {
        let ns = sample.as_nanos().min(u64::MAX as u128) as u64;
        self.count.fetch_add(1, Ordering::Relaxed);
        self.sum_ns.fetch_add(ns, Ordering::Relaxed);
        let sq = (ns as f64) * (ns as f64);
        let _ = self
            .sum_sq
            .fetch_update(Ordering::Relaxed, Ordering::Relaxed, |bits| {
                Some((f64::from_bits(bits) + sq).to_bits())
            });
        self.min_ns.fetch_min(ns, Ordering::Relaxed);
        self.max_ns.fetch_max(ns, Ordering::Relaxed);
    }

    pub fn count(&self) -> u64 {
        self.count.load(Ordering::Relaxed)
    }

    /// Values are reported in microseconds.
    pub fn snapshot(&self) -> SummarySnapshot {
        let count = self.count.load(Ordering::Relaxed);
        if count == 0 {
            return SummarySnapshot::default();
        }
        let n = count as f64;
        let mean = self.sum_ns.load(Ordering::Relaxed) as f64 / n;
        let mean_sq = f64::from_bits(self.sum_sq.load(Ordering::Relaxed)) / n;
        let variance = (mean_sq - mean * mean).max(0.0);
        let min = self.min_ns.load(Ordering::Relaxed);

        SummarySnapshot {
            count,
            min_us: if min == u64::MAX { 0.0 } else { min as f64 / 1_000.0 },
            max_us: self.max_ns.load(Ordering::Relaxed) as f64 / 1_000.0,
            mean_us: mean / 1_000.0,
            variance_us2: variance / 1_000_000.0,
            stddev_us: variance.sqrt() / 1_000.0,
        }
    }
}

impl Default for RunningSummary {
    fn default() -> Self {
        Self::new()
    }
}

/// Point-in-time view of a [`RunningSummary`].
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SummarySnapshot {
    pub count: u64,
    pub min_us: f64,
    pub max_us: f64,
    pub mean_us: f64,
    pub variance_us2: f64,
    pub stddev_us: f64,
}

// ============================================================================
// Per-stage counters
// ============================================================================

/// Counters shared by both sources.
#[derive(Default)]
pub struct StageMetrics {
    bytes_received: AtomicU64,
    messages_received: AtomicU64,
    messages_filtered: AtomicU64,
    records_processed: AtomicU64,
    eha_records: AtomicU64,
    evr_records: AtomicU64,
    decode_errors: AtomicU64,
    sink_rejections: AtomicU64,
    queue_full_events: AtomicU64,
    queue_dropped: AtomicU64,
    queue_wait: RunningSummary,
}

impl StageMetrics {
    pub fn record_received(&self, bytes: usize) {
        self.messages_received.fetch_add(1, Ordering::Relaxed);
        self.bytes_received
            .fetch_add(bytes as u64, Ordering::Relaxed);
    }

    pub fn record_filtered(&self) {
        self.messages_filtered.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_processed(&self, kind: RecordKind) {
        self.records_processed.fetch_add(1, Ordering::Relaxed);
        match kind {
            RecordKind::Eha => self.eha_records.fetch_add(1, Ordering::Relaxed),
            RecordKind::Evr => self.evr_records.fetch_add(1, Ordering::Relaxed),
        };
    }

    pub fn record_decode_error(&self) {
        self.decode_errors.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_sink_rejection(&self) {
        self.sink_rejections.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_queue_full(&self) {
        self.queue_full_events.fetch_add(1, Ordering::Relaxed);
    }

    /// Events lost between read and decode: refused by a halted queue or
    /// left undrained at shutdown.
    pub fn record_dropped(&self, events: u64) {
        self.queue_dropped.fetch_add(events, Ordering::Relaxed);
    }

    pub fn dropped(&self) -> u64 {
        self.queue_dropped.load(Ordering::Relaxed)
    }

    pub fn record_queue_wait(&self, wait: Duration) {
        self.queue_wait.record(wait);
    }

    pub fn records_processed(&self) -> u64 {
        self.records_processed.load(Ordering::Relaxed)
    }

    pub fn messages_received(&self) -> u64 {
        self.messages_received.load(Ordering::Relaxed)
    }

    pub fn decode_errors(&self) -> u64 {
        self.decode_errors.load(Ordering::Relaxed)
    }

    fn received(&self, by_type: BTreeMap<String, u64>) -> ReceivedCounts {
        ReceivedCounts {
            bytes: self.bytes_received.load(Ordering::Relaxed),
            messages: self.messages_received.load(Ordering::Relaxed),
            filtered: self.messages_filtered.load(Ordering::Relaxed),
            by_type,
        }
    }

    fn processed(&self) -> ProcessedCounts {
        ProcessedCounts {
            records: self.records_processed.load(Ordering::Relaxed),
            eha: self.eha_records.load(Ordering::Relaxed),
            evr: self.evr_records.load(Ordering::Relaxed),
        }
    }

    fn errors(&self, transport: u64) -> ErrorCounts {
        ErrorCounts {
            decode: self.decode_errors.load(Ordering::Relaxed),
            sink_rejections: self.sink_rejections.load(Ordering::Relaxed),
            transport,
        }
    }

    fn queue(&self) -> QueueCounts {
        QueueCounts {
            full_events: self.queue_full_events.load(Ordering::Relaxed),
            dropped: self.queue_dropped.load(Ordering::Relaxed),
            wait: self.queue_wait.snapshot(),
        }
    }
}

/// Socket-side counters.
#[derive(Default)]
pub struct SocketMetrics {
    pub stage: StageMetrics,
    connections_accepted: AtomicU64,
    connections_rejected: AtomicU64,
    read_errors: AtomicU64,
}

impl SocketMetrics {
    pub fn record_accepted(&self) {
        self.connections_accepted.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_rejected(&self) {
        self.connections_rejected.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_read_error(&self) {
        self.read_errors.fetch_add(1, Ordering::Relaxed);
    }

    pub fn connections_accepted(&self) -> u64 {
        self.connections_accepted.load(Ordering::Relaxed)
    }

    pub fn snapshot(&self) -> SocketSnapshot {
        SocketSnapshot {
            connections: ConnectionCounts {
                accepted: self.connections_accepted.load(Ordering::Relaxed),
                rejected: self.connections_rejected.load(Ordering::Relaxed),
            },
            received: self.stage.received(BTreeMap::new()),
            processed: self.stage.processed(),
            errors: self.stage.errors(self.read_errors.load(Ordering::Relaxed)),
            queue: self.stage.queue(),
        }
    }
}

/// Bus-side counters.
#[derive(Default)]
pub struct BusMetrics {
    pub stage: StageMetrics,
    received_by_type: DashMap<String, AtomicU64>,
    delivery_errors: AtomicU64,
}

impl BusMetrics {
    pub fn record_received_type(&self, type_name: &str) {
        if let Some(counter) = self.received_by_type.get(type_name) {
            counter.fetch_add(1, Ordering::Relaxed);
            return;
        }
        self.received_by_type
            .entry(type_name.to_string())
            .or_insert_with(|| AtomicU64::new(0))
            .fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_delivery_error(&self) {
        self.delivery_errors.fetch_add(1, Ordering::Relaxed);
    }

    pub fn delivery_errors(&self) -> u64 {
        self.delivery_errors.load(Ordering::Relaxed)
    }

    pub fn received_of_type(&self, type_name: &str) -> u64 {
        self.received_by_type
            .get(type_name)
            .map(|c| c.load(Ordering::Relaxed))
            .unwrap_or(0)
    }

    pub fn snapshot(&self) -> BusSnapshot {
        let by_type = self
            .received_by_type
            .iter()
            .map(|e| (e.key().clone(), e.value().load(Ordering::Relaxed)))
            .collect();
        BusSnapshot {
            received: self.stage.received(by_type),
            processed: self.stage.processed(),
            errors: self.stage.errors(self.delivery_errors.load(Ordering::Relaxed)),
            queue: self.stage.queue(),
        }
    }
}

/// All metrics for one pipeline instance.
#[derive(Default)]
pub struct IngestMetrics {
    pub socket: SocketMetrics,
    pub bus: BusMetrics,
}

impl IngestMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    /// Never mutates counters.
    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            timestamp: Utc::now(),
            socket: self.socket.snapshot(),
            bus: self.bus.snapshot(),
        }
    }
}

// ============================================================================
// Snapshots
// ============================================================================

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ReceivedCounts {
    pub bytes: u64,
    pub messages: u64,
    /// Messages dropped by the type filter.
    pub filtered: u64,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub by_type: BTreeMap<String, u64>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProcessedCounts {
    pub records: u64,
    pub eha: u64,
    pub evr: u64,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorCounts {
    pub decode: u64,
    pub sink_rejections: u64,
    /// Read errors (socket) or delivery errors (bus).
    pub transport: u64,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct QueueCounts {
    pub full_events: u64,
    pub dropped: u64,
    pub wait: SummarySnapshot,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConnectionCounts {
    pub accepted: u64,
    pub rejected: u64,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SocketSnapshot {
    pub connections: ConnectionCounts,
    pub received: ReceivedCounts,
    pub processed: ProcessedCounts,
    pub errors: ErrorCounts,
    pub queue: QueueCounts,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct BusSnapshot {
    pub received: ReceivedCounts,
    pub processed: ProcessedCounts,
    pub errors: ErrorCounts,
    pub queue: QueueCounts,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MetricsSnapshot {
    pub timestamp: DateTime<Utc>,
    pub socket: SocketSnapshot,
    pub bus: BusSnapshot,
}

impl MetricsSnapshot {
    /// Flattened monotonic counters keyed by dotted path
    /// (e.g. `bus.received.by_type.EventRecord`).
    pub fn counters(&self) -> BTreeMap<String, u64> {
        let mut out = BTreeMap::new();
        let s = &self.socket;
        out.insert("socket.connections.accepted".into(), s.connections.accepted);
        out.insert("socket.connections.rejected".into(), s.connections.rejected);
        push_stage(&mut out, "socket", &s.received, &s.processed, &s.errors, &s.queue);
        let b = &self.bus;
        push_stage(&mut out, "bus", &b.received, &b.processed, &b.errors, &b.queue);
        out
    }
}

fn push_stage(
    out: &mut BTreeMap<String, u64>,
    source: &str,
    received: &ReceivedCounts,
    processed: &ProcessedCounts,
    errors: &ErrorCounts,
    queue: &QueueCounts,
) {
    let mut put = |name: &str, v: u64| {
        out.insert(format!("{}.{}", source, name), v);
    };
    put("received.bytes", received.bytes);
    put("received.messages", received.messages);
    put("received.filtered", received.filtered);
    put("processed.records", processed.records);
    put("processed.eha", processed.eha);
    put("processed.evr", processed.evr);
    put("errors.decode", errors.decode);
    put("errors.sink_rejections", errors.sink_rejections);
    put("errors.transport", errors.transport);
    put("queue.full_events", queue.full_events);
    put("queue.dropped", queue.dropped);
    put("queue.wait.count", queue.wait.count);
    for (ty, v) in &received.by_type {
        put(&format!("received.by_type.{}", ty), *v);
    }
}
