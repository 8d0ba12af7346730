// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Closed-client history.
//!
//! Keeps the most recent summaries in memory. Older ones are appended to a
//! JSON-lines side store when a path is configured, otherwise discarded.
//! The closed count is exact either way.

use super::client::CloseReason;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::fs::OpenOptions;
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};

/// Final statistics of one closed connection.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ClosedClientSummary {
    pub connection_id: u64,
    pub peer: String,
    pub opened_at: DateTime<Utc>,
    pub closed_at: DateTime<Utc>,
    pub close_reason: CloseReason,
    pub bytes_read: u64,
    pub reads: u64,
    pub empty_reads: u64,
    pub read_errors: u64,
    pub read_time_ns: u64,
    pub records_decoded: u64,
    pub decode_errors: u64,
    pub sink_rejections: u64,
    /// Chunks read but never decoded.
    #[serde(default)]
    pub dropped_chunks: u64,
}

pub struct ClosedLedger {
    recent: Mutex<VecDeque<ClosedClientSummary>>,
    capacity: usize,
    spill_path: Option<PathBuf>,
    total: AtomicU64,
    spilled: AtomicU64,
    spill_errors: AtomicU64,
}

impl ClosedLedger {
    pub fn new(capacity: usize, spill_path: Option<PathBuf>) -> Self {
        Self {
            recent: Mutex::new(VecDeque::with_capacity(capacity.min(1024))),
            capacity,
            spill_path,
            total: AtomicU64::new(0),
            spilled: AtomicU64::new(0),
            spill_errors: AtomicU64::new(0),
        }
    }

    pub fn record(&self, summary: ClosedClientSummary) {
        self.total.fetch_add(1, Ordering::Relaxed);

        let evicted: Vec<ClosedClientSummary> = {
            let mut recent = self.recent.lock();
            recent.push_back(summary);
            let excess = recent.len().saturating_sub(self.capacity);
            recent.drain(..excess).collect()
        };

        if evicted.is_empty() {
            return;
        }
        match &self.spill_path {
            Some(path) => match append_lines(path, &evicted) {
                Ok(()) => {
                    self.spilled
                        .fetch_add(evicted.len() as u64, Ordering::Relaxed);
                }
                Err(e) => {
                    self.spill_errors.fetch_add(1, Ordering::Relaxed);
                    tracing::warn!(
                        "[ledger] failed to spill {} summaries to {}: {}",
                        evicted.len(),
                        path.display(),
                        e
                    );
                }
            },
            None => {
                tracing::debug!("[ledger] discarded {} old summaries", evicted.len());
            }
        }
    }

    /// Exact number of clients ever closed.
    pub fn total(&self) -> u64 {
        self.total.load(Ordering::Relaxed)
    }

    pub fn spilled(&self) -> u64 {
        self.spilled.load(Ordering::Relaxed)
    }

    pub fn spill_errors(&self) -> u64 {
        self.spill_errors.load(Ordering::Relaxed)
    }

    /// In-memory summaries, oldest first.
    pub fn recent(&self) -> Vec<ClosedClientSummary> {
        self.recent.lock().iter().cloned().collect()
    }

    pub fn find(&self, connection_id: u64) -> Option<ClosedClientSummary> {
        self.recent
            .lock()
            .iter()
            .find(|s| s.connection_id == connection_id)
            .cloned()
    }
}

fn append_lines(path: &Path, summaries: &[ClosedClientSummary]) -> std::io::Result<()> {
    let file = OpenOptions::new().create(true).append(true).open(path)?;
    let mut w = BufWriter::new(file);
    for s in summaries {
        serde_json::to_writer(&mut w, s)?;
        w.write_all(b"\n")?;
    }
    w.flush()
}

/// Read back a side store written by the ledger.
pub fn read_spilled(path: &Path) -> std::io::Result<Vec<ClosedClientSummary>> {
    let content = std::fs::read_to_string(path)?;
    content
        .lines()
        .filter(|l| !l.trim().is_empty())
        .map(|l| serde_json::from_str(l).map_err(std::io::Error::from))
        .collect()
}
