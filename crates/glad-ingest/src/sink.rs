// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Store sink interface and a bounded in-memory implementation.

use crate::error::SinkError;
use crate::record::GladRecord;
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};

/// Receives decoded records. Implementations must bound their own memory and
/// must not block indefinitely; a rejection is logged and dropped by callers.
pub trait StoreSink: Send + Sync {
    fn on_data(&self, record: GladRecord) -> Result<(), SinkError>;
}

/// Bounded sink keeping the most recent records, oldest evicted first.
pub struct MemorySink {
    records: Mutex<VecDeque<GladRecord>>,
    capacity: usize,
    accepted: AtomicU64,
    evicted: AtomicU64,
}

impl MemorySink {
    pub fn new(capacity: usize) -> Self {
        Self {
            records: Mutex::new(VecDeque::with_capacity(capacity.min(4096))),
            capacity: capacity.max(1),
            accepted: AtomicU64::new(0),
            evicted: AtomicU64::new(0),
        }
    }

    pub fn len(&self) -> usize {
        self.records.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.lock().is_empty()
    }

    /// Copy of the retained records, oldest first.
    pub fn records(&self) -> Vec<GladRecord> {
        self.records.lock().iter().cloned().collect()
    }

    /// Remove and return every retained record.
    pub fn drain(&self) -> Vec<GladRecord> {
        self.records.lock().drain(..).collect()
    }

    /// Most recent record with the given identifier.
    pub fn latest(&self, identifier: &str) -> Option<GladRecord> {
        self.records
            .lock()
            .iter()
            .rev()
            .find(|r| r.identifier() == identifier)
            .cloned()
    }

    pub fn accepted(&self) -> u64 {
        self.accepted.load(Ordering::Relaxed)
    }

    pub fn evicted(&self) -> u64 {
        self.evicted.load(Ordering::Relaxed)
    }
}

impl StoreSink for MemorySink {
    fn on_data(&self, record: GladRecord) -> Result<(), SinkError> {
        let mut records = self.records.lock();
        if records.len() >= self.capacity {
            records.pop_front();
            self.evicted.fetch_add(1, Ordering::Relaxed);
        }
        records.push_back(record);
        self.accepted.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::record::{EvrRecord, RecordHeader};

    fn evr(id: u32) -> GladRecord {
        GladRecord::Evr(EvrRecord {
            header: RecordHeader::default(),
            evr_id: id,
            name: "N".into(),
            level: "INFO".into(),
            message: format!("event {}", id),
            realtime: true,
        })
    }

    #[test]
    fn test_evicts_oldest() {
        let sink = MemorySink::new(3);
        for i in 0..5 {
            sink.on_data(evr(i)).expect("accept");
        }
        let ids: Vec<String> = sink.records().iter().map(|r| r.identifier()).collect();
        assert_eq!(ids, vec!["2", "3", "4"]);
        assert_eq!(sink.accepted(), 5);
        assert_eq!(sink.evicted(), 2);
    }

    #[test]
    fn test_latest_and_drain() {
        let sink = MemorySink::new(10);
        sink.on_data(evr(1)).expect("accept");
        sink.on_data(evr(2)).expect("accept");
        assert!(sink.latest("2").is_some());
        assert!(sink.latest("3").is_none());
        assert_eq!(sink.drain().len(), 2);
        assert!(sink.is_empty());
    }
}
