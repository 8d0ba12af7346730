// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! One accepted connection: read loop, private ring, decode stage.
//!
//! ```text
//!  socket ──read──► [reader thread] ──publish──► ring ──► [decode thread] ──► sink
//! ```
//!
//! The reader owns the stream. Reads that return no data without ending the
//! stream (read timeout, `Interrupted`) count as empty reads. `Ok(0)` is end of
//! stream. I/O errors bump a consecutive counter that resets on the next
//! successful read; reaching the threshold shuts the handler down.
//!
//! Whatever ends the reader (EOF, threshold, request, panic), a drop guard
//! sends a done notice to the supervisor.

use super::ledger::ClosedClientSummary;
use crate::codec::StreamDecoder;
use crate::config::IngestConfig;
use crate::error::QueueError;
use crate::metrics::IngestMetrics;
use crate::ring::{
    EventHandler, EventMeta, ProducerMode, RingBuffer, RingConfig, RingStats, SingleProducer,
    WaitStrategy,
};
use crate::sink::StoreSink;
use chrono::{DateTime, Utc};
use crossbeam::channel::{self, Receiver, Sender};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::io::{self, Read};
use std::net::{Shutdown, TcpStream};
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

/// Server-assigned connection identifier.
pub type ClientId = u64;

/// Invoked once when shutdown is requested, to unblock a pending read.
pub type Closer = Box<dyn Fn() + Send + Sync>;

/// Why a handler stopped.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CloseReason {
    EndOfStream,
    ErrorThreshold,
    Requested,
    /// Closed by the reaper without a recorded cause (e.g. reader panic).
    Reaped,
}

/// Per-handler settings, shared by every client of a server.
#[derive(Debug, Clone)]
pub struct ClientSettings {
    pub read_buffer_size: usize,
    pub max_consecutive_errors: u32,
    pub read_timeout: Duration,
    pub ring_size: usize,
    pub wait: WaitStrategy,
    pub yellow_percent: u8,
    pub red_percent: u8,
    pub drain_timeout: Duration,
}

impl Default for ClientSettings {
    fn default() -> Self {
        Self::from(&IngestConfig::default())
    }
}

impl From<&IngestConfig> for ClientSettings {
    fn from(config: &IngestConfig) -> Self {
        Self {
            read_buffer_size: config.read_buffer_size,
            max_consecutive_errors: config.max_consecutive_errors,
            read_timeout: config.read_timeout(),
            ring_size: config.client_ring_size,
            wait: config.client_wait_strategy,
            yellow_percent: config.health_yellow_percent,
            red_percent: config.health_red_percent,
            drain_timeout: config.drain_timeout(),
        }
    }
}

#[derive(Default)]
struct ClientCounters {
    bytes_read: AtomicU64,
    reads: AtomicU64,
    empty_reads: AtomicU64,
    read_errors: AtomicU64,
    consecutive_errors: AtomicU32,
    read_time_ns: AtomicU64,
    records_decoded: AtomicU64,
    decode_errors: AtomicU64,
    sink_rejections: AtomicU64,
    dropped_chunks: AtomicU64,
}

/// State shared between the handle and its reader thread.
struct ClientShared {
    id: ClientId,
    shutdown: AtomicBool,
    finished: AtomicBool,
    reason: Mutex<Option<CloseReason>>,
    counters: ClientCounters,
    closer: Option<Closer>,
}

impl ClientShared {
    fn record_dropped(&self, metrics: &IngestMetrics, chunks: u64) {
        if chunks > 0 {
            self.counters
                .dropped_chunks
                .fetch_add(chunks, Ordering::Relaxed);
            metrics.socket.stage.record_dropped(chunks);
        }
    }

    /// First recorded reason wins.
    fn set_reason(&self, reason: CloseReason) {
        let mut slot = self.reason.lock();
        if slot.is_none() {
            *slot = Some(reason);
        }
    }

    /// Returns true for the caller that flipped the flag.
    fn request_shutdown(&self, reason: CloseReason) -> bool {
        self.set_reason(reason);
        if self.shutdown.swap(true, Ordering::AcqRel) {
            return false;
        }
        if let Some(close) = &self.closer {
            close();
        }
        true
    }
}

/// Sends the done notice when the reader thread exits, panics included.
struct DoneGuard {
    shared: Arc<ClientShared>,
    done_tx: Sender<()>,
    exit_tx: Option<Sender<ClientId>>,
}

impl Drop for DoneGuard {
    fn drop(&mut self) {
        self.shared.shutdown.store(true, Ordering::Release);
        self.shared.finished.store(true, Ordering::Release);
        let _ = self.done_tx.send(());
        if let Some(tx) = &self.exit_tx {
            let _ = tx.send(self.shared.id);
        }
    }
}

/// Ring consumer: decodes chunks and hands records to the sink.
struct DecodeStage {
    id: ClientId,
    decoder: Box<dyn StreamDecoder>,
    sink: Arc<dyn StoreSink>,
    metrics: Arc<IngestMetrics>,
    shared: Arc<ClientShared>,
}

impl EventHandler<Vec<u8>> for DecodeStage {
    fn on_event(&mut self, chunk: Vec<u8>, meta: EventMeta) {
        let stage = &self.metrics.socket.stage;
        stage.record_queue_wait(meta.queue_wait());

        let decoded = self.decoder.feed(&chunk);
        for err in decoded.errors {
            self.shared
                .counters
                .decode_errors
                .fetch_add(1, Ordering::Relaxed);
            stage.record_decode_error();
            tracing::warn!("[client:{}] decode error: {}", self.id, err);
        }
        for record in decoded.records {
            let kind = record.kind();
            match self.sink.on_data(record) {
                Ok(()) => {
                    self.shared
                        .counters
                        .records_decoded
                        .fetch_add(1, Ordering::Relaxed);
                    stage.record_processed(kind);
                }
                Err(e) => {
                    self.shared
                        .counters
                        .sink_rejections
                        .fetch_add(1, Ordering::Relaxed);
                    stage.record_sink_rejection();
                    tracing::warn!("[client:{}] sink rejected record: {}", self.id, e);
                }
            }
        }
    }

    fn on_shutdown(&mut self) {
        let left = self.decoder.buffered();
        if left > 0 {
            tracing::debug!(
                "[client:{}] {} bytes of partial frame discarded",
                self.id,
                left
            );
        }
    }
}

/// Handle to one running connection.
pub struct ClientHandler {
    shared: Arc<ClientShared>,
    peer: String,
    opened_at: DateTime<Utc>,
    settings: ClientSettings,
    ring: Arc<RingBuffer<Vec<u8>>>,
    metrics: Arc<IngestMetrics>,
    reader: Mutex<Option<JoinHandle<()>>>,
    done_rx: Receiver<()>,
    closing: AtomicBool,
}

impl ClientHandler {
    /// Start a handler on an accepted TCP connection.
    #[allow(clippy::too_many_arguments)]
    pub fn from_tcp(
        id: ClientId,
        stream: TcpStream,
        settings: ClientSettings,
        decoder: Box<dyn StreamDecoder>,
        sink: Arc<dyn StoreSink>,
        metrics: Arc<IngestMetrics>,
        exit_tx: Option<Sender<ClientId>>,
    ) -> io::Result<Self> {
        stream.set_read_timeout(Some(settings.read_timeout))?;
        let _ = stream.set_nodelay(true);
        let peer = stream
            .peer_addr()
            .map(|a| a.to_string())
            .unwrap_or_else(|_| "unknown".to_string());
        let control = stream.try_clone()?;
        let closer: Closer = Box::new(move || {
            let _ = control.shutdown(Shutdown::Both);
        });
        Self::spawn(
            id,
            peer,
            stream,
            Some(closer),
            settings,
            decoder,
            sink,
            metrics,
            exit_tx,
        )
    }

    /// Start a handler on any byte source.
    ///
    /// `closer` is invoked on the first shutdown request; without one, the
    /// reader notices the request at its next read boundary.
    #[allow(clippy::too_many_arguments)]
    pub fn spawn<R: Read + Send + 'static>(
        id: ClientId,
        peer: String,
        stream: R,
        closer: Option<Closer>,
        settings: ClientSettings,
        decoder: Box<dyn StreamDecoder>,
        sink: Arc<dyn StoreSink>,
        metrics: Arc<IngestMetrics>,
        exit_tx: Option<Sender<ClientId>>,
    ) -> io::Result<Self> {
        let shared = Arc::new(ClientShared {
            id,
            shutdown: AtomicBool::new(false),
            finished: AtomicBool::new(false),
            reason: Mutex::new(None),
            counters: ClientCounters::default(),
            closer,
        });

        let ring = Arc::new(RingBuffer::new(
            RingConfig::new(format!("client-{}", id), settings.ring_size, ProducerMode::Single)
                .wait(settings.wait)
                .thresholds(settings.yellow_percent, settings.red_percent),
        ));
        ring.start(DecodeStage {
            id,
            decoder,
            sink,
            metrics: Arc::clone(&metrics),
            shared: Arc::clone(&shared),
        })
        .map_err(queue_to_io)?;
        let producer = ring.single_producer().ok_or_else(|| {
            io::Error::new(io::ErrorKind::Other, "client ring producer unavailable")
        })?;

        let (done_tx, done_rx) = channel::bounded(1);
        let reader = ReadLoop {
            shared: Arc::clone(&shared),
            stream,
            producer,
            ring: Arc::clone(&ring),
            metrics: Arc::clone(&metrics),
            settings: settings.clone(),
        };
        let guard = DoneGuard {
            shared: Arc::clone(&shared),
            done_tx,
            exit_tx,
        };
        let handle = thread::Builder::new()
            .name(format!("glad-client-{}", id))
            .spawn(move || {
                let _guard = guard;
                reader.run();
            })?;

        tracing::info!("[client:{}] connected from {}", id, peer);

        Ok(Self {
            shared,
            peer,
            opened_at: Utc::now(),
            settings,
            ring,
            metrics,
            reader: Mutex::new(Some(handle)),
            done_rx,
            closing: AtomicBool::new(false),
        })
    }

    pub fn id(&self) -> ClientId {
        self.shared.id
    }

    pub fn peer(&self) -> &str {
        &self.peer
    }

    /// Ask the reader to stop. Idempotent; returns true for the first call.
    pub fn request_shutdown(&self) -> bool {
        self.shared.request_shutdown(CloseReason::Requested)
    }

    pub(crate) fn request_shutdown_with(&self, reason: CloseReason) -> bool {
        self.shared.request_shutdown(reason)
    }

    pub fn is_shutdown(&self) -> bool {
        self.shared.shutdown.load(Ordering::Acquire)
    }

    /// True once the reader thread has exited.
    pub fn is_finished(&self) -> bool {
        self.shared.finished.load(Ordering::Acquire)
    }

    pub fn close_reason(&self) -> Option<CloseReason> {
        *self.shared.reason.lock()
    }

    /// Elect the single closer of this handler.
    pub(crate) fn begin_close(&self) -> bool {
        !self.closing.swap(true, Ordering::AcqRel)
    }

    /// Wait up to `timeout` for the reader to exit, then tear down the ring.
    /// Returns false if the reader had to be detached.
    pub fn join(&self, timeout: Duration) -> bool {
        let exited = self.is_finished() || self.done_rx.recv_timeout(timeout).is_ok();
        let handle = self.reader.lock().take();
        if exited {
            if let Some(handle) = handle {
                if handle.join().is_err() {
                    tracing::error!("[client:{}] reader thread panicked", self.id());
                }
            }
        } else if handle.is_some() {
            tracing::warn!(
                "[client:{}] reader did not exit within {:?}, detaching",
                self.id(),
                timeout
            );
        }
        let abandoned = self.ring.shutdown(self.settings.drain_timeout);
        self.shared.record_dropped(&self.metrics, abandoned as u64);
        exited
    }

    pub fn stats(&self) -> ClientStats {
        let c = &self.shared.counters;
        ClientStats {
            connection_id: self.id(),
            peer: self.peer.clone(),
            opened_at: self.opened_at,
            uptime_ms: (Utc::now() - self.opened_at).num_milliseconds().max(0) as u64,
            shutdown: self.is_shutdown(),
            close_reason: self.close_reason(),
            read_buffer_size: self.settings.read_buffer_size,
            max_consecutive_errors: self.settings.max_consecutive_errors,
            consecutive_errors: c.consecutive_errors.load(Ordering::Relaxed),
            bytes_read: c.bytes_read.load(Ordering::Relaxed),
            reads: c.reads.load(Ordering::Relaxed),
            empty_reads: c.empty_reads.load(Ordering::Relaxed),
            read_errors: c.read_errors.load(Ordering::Relaxed),
            read_time_ns: c.read_time_ns.load(Ordering::Relaxed),
            records_decoded: c.records_decoded.load(Ordering::Relaxed),
            decode_errors: c.decode_errors.load(Ordering::Relaxed),
            sink_rejections: c.sink_rejections.load(Ordering::Relaxed),
            dropped_chunks: c.dropped_chunks.load(Ordering::Relaxed),
            ring: self.ring.stats(),
        }
    }

    /// Final summary for the closed ledger.
    pub fn summary(&self) -> ClosedClientSummary {
        let s = self.stats();
        ClosedClientSummary {
            connection_id: s.connection_id,
            peer: s.peer,
            opened_at: s.opened_at,
            closed_at: Utc::now(),
            close_reason: s.close_reason.unwrap_or(CloseReason::Reaped),
            bytes_read: s.bytes_read,
            reads: s.reads,
            empty_reads: s.empty_reads,
            read_errors: s.read_errors,
            read_time_ns: s.read_time_ns,
            records_decoded: s.records_decoded,
            decode_errors: s.decode_errors,
            sink_rejections: s.sink_rejections,
            dropped_chunks: s.dropped_chunks,
        }
    }
}

impl Drop for ClientHandler {
    fn drop(&mut self) {
        self.shared.request_shutdown(CloseReason::Requested);
    }
}

/// Live statistics of one connection.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClientStats {
    pub connection_id: ClientId,
    pub peer: String,
    pub opened_at: DateTime<Utc>,
    pub uptime_ms: u64,
    pub shutdown: bool,
    pub close_reason: Option<CloseReason>,
    pub read_buffer_size: usize,
    pub max_consecutive_errors: u32,
    pub consecutive_errors: u32,
    pub bytes_read: u64,
    pub reads: u64,
    pub empty_reads: u64,
    /// Total read errors, including ones later cleared by a good read.
    pub read_errors: u64,
    pub read_time_ns: u64,
    pub records_decoded: u64,
    pub decode_errors: u64,
    pub sink_rejections: u64,
    /// Chunks refused by the halted ring or left undrained at shutdown.
    pub dropped_chunks: u64,
    pub ring: RingStats,
}

fn queue_to_io(e: QueueError) -> io::Error {
    io::Error::new(io::ErrorKind::Other, e)
}

fn is_empty_read(kind: io::ErrorKind) -> bool {
    matches!(
        kind,
        io::ErrorKind::WouldBlock | io::ErrorKind::TimedOut | io::ErrorKind::Interrupted
    )
}

struct ReadLoop<R> {
    shared: Arc<ClientShared>,
    stream: R,
    producer: SingleProducer<Vec<u8>>,
    ring: Arc<RingBuffer<Vec<u8>>>,
    metrics: Arc<IngestMetrics>,
    settings: ClientSettings,
}

impl<R: Read> ReadLoop<R> {
    fn run(mut self) {
        let shared = Arc::clone(&self.shared);
        let id = shared.id;
        let counters = &shared.counters;
        let mut buf = vec![0u8; self.settings.read_buffer_size.max(1)];

        while !shared.shutdown.load(Ordering::Acquire) {
            let started = Instant::now();
            match self.stream.read(&mut buf) {
                Ok(0) => {
                    tracing::info!("[client:{}] end of stream", id);
                    shared.set_reason(CloseReason::EndOfStream);
                    break;
                }
                Ok(n) => {
                    counters
                        .read_time_ns
                        .fetch_add(started.elapsed().as_nanos() as u64, Ordering::Relaxed);
                    counters.reads.fetch_add(1, Ordering::Relaxed);
                    counters.bytes_read.fetch_add(n as u64, Ordering::Relaxed);
                    counters.consecutive_errors.store(0, Ordering::Relaxed);
                    self.metrics.socket.stage.record_received(n);

                    if !self.publish(buf[..n].to_vec()) {
                        shared.record_dropped(&self.metrics, 1);
                        break;
                    }
                }
                Err(e) if is_empty_read(e.kind()) => {
                    counters.empty_reads.fetch_add(1, Ordering::Relaxed);
                }
                Err(e) => {
                    if shared.shutdown.load(Ordering::Acquire) {
                        break;
                    }
                    counters.read_errors.fetch_add(1, Ordering::Relaxed);
                    self.metrics.socket.record_read_error();
                    let errors = counters.consecutive_errors.fetch_add(1, Ordering::Relaxed) + 1;
                    if errors >= self.settings.max_consecutive_errors {
                        tracing::error!(
                            "[client:{}] {} consecutive read errors, closing: {}",
                            id,
                            errors,
                            e
                        );
                        shared.set_reason(CloseReason::ErrorThreshold);
                        break;
                    }
                    tracing::warn!(
                        "[client:{}] read error {}/{}: {}",
                        id,
                        errors,
                        self.settings.max_consecutive_errors,
                        e
                    );
                }
            }
        }

        shared.request_shutdown(CloseReason::Requested);
        let abandoned = self.ring.shutdown(self.settings.drain_timeout);
        shared.record_dropped(&self.metrics, abandoned as u64);
        let c = counters;
        tracing::info!(
            "[client:{}] closed: bytes={} reads={} empty={} read_errors={} records={} decode_errors={} abandoned={}",
            id,
            c.bytes_read.load(Ordering::Relaxed),
            c.reads.load(Ordering::Relaxed),
            c.empty_reads.load(Ordering::Relaxed),
            c.read_errors.load(Ordering::Relaxed),
            c.records_decoded.load(Ordering::Relaxed),
            c.decode_errors.load(Ordering::Relaxed),
            abandoned
        );
    }

    /// Publish one chunk, waiting if the ring is full. False once the ring
    /// stopped accepting.
    fn publish(&mut self, chunk: Vec<u8>) -> bool {
        let chunk = match self.producer.try_publish(chunk) {
            Ok(()) => return true,
            Err((QueueError::Full, chunk)) => {
                self.metrics.socket.stage.record_queue_full();
                chunk
            }
            Err(_) => return false,
        };
        self.producer.publish(chunk).is_ok()
    }
}
