// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Bounded ring buffer with a single dedicated consumer thread.
//!
//! Slots are pre-allocated and overwritten in place. Each slot carries a
//! sequence stamp: a producer may only fill slot `pos & mask` once the stamp
//! equals `pos` (the consumer has retired the previous occupant), and the
//! consumer may only read it once the stamp equals `pos + 1`.
//!
//! ```text
//!  claim ──►  [ 5 | 6 | 7 | 4 ]  ◄── cursor
//!              pub  pub  free  consuming
//! ```
//!
//! Producer modes:
//! - [`SingleProducer`]: one unique handle, `&mut self` publish, plain store claim
//! - [`MultiProducer`]: cloneable handle, CAS claim (linearizable across producers)
//!
//! The consumer takes the payload out of the slot before the handler runs, so
//! no slot holds a payload reference once the handler returns. Handler panics
//! are caught and logged; the slot is still retired.

mod wait;

pub use wait::WaitStrategy;

use crate::error::QueueError;
use crossbeam::utils::{Backoff, CachePadded};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::cell::UnsafeCell;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};
use wait::Waiter;

/// Drain budget used when a ring is dropped without an explicit shutdown.
const DROP_DRAIN_TIMEOUT: Duration = Duration::from_secs(5);

/// How producers claim slots.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProducerMode {
    Single,
    Multi,
}

/// Ring construction parameters.
#[derive(Debug, Clone)]
pub struct RingConfig {
    /// Used for the consumer thread name and log lines.
    pub name: String,
    /// Requested capacity (rounded up to the next power of two).
    pub capacity: usize,
    pub mode: ProducerMode,
    pub wait: WaitStrategy,
    /// Backlog percentage at which health turns yellow.
    pub yellow_percent: u8,
    /// Backlog percentage at which health turns red.
    pub red_percent: u8,
}

impl RingConfig {
    pub fn new(name: impl Into<String>, capacity: usize, mode: ProducerMode) -> Self {
        Self {
            name: name.into(),
            capacity,
            mode,
            wait: WaitStrategy::Block,
            yellow_percent: 90,
            red_percent: 100,
        }
    }

    pub fn wait(mut self, wait: WaitStrategy) -> Self {
        self.wait = wait;
        self
    }

    pub fn thresholds(mut self, yellow_percent: u8, red_percent: u8) -> Self {
        self.yellow_percent = yellow_percent;
        self.red_percent = red_percent;
        self
    }
}

/// Backlog health relative to capacity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum QueueHealth {
    Green,
    Yellow,
    Red,
}

/// Metadata handed to the consumer alongside each payload.
#[derive(Debug, Clone, Copy)]
pub struct EventMeta {
    /// Publish sequence (0-based, monotonic per ring).
    pub sequence: u64,
    /// When the producer installed the payload.
    pub enqueued_at: Instant,
}

impl EventMeta {
    /// Time spent waiting in the ring.
    pub fn queue_wait(&self) -> Duration {
        self.enqueued_at.elapsed()
    }
}

/// Consumer callback. Invoked exactly once per published slot, in order, on
/// the ring's consumer thread.
pub trait EventHandler<T>: Send + 'static {
    fn on_event(&mut self, payload: T, meta: EventMeta);

    /// Called once on the consumer thread after the last event.
    fn on_shutdown(&mut self) {}
}

impl<T, F> EventHandler<T> for F
where
    F: FnMut(T, EventMeta) + Send + 'static,
{
    fn on_event(&mut self, payload: T, meta: EventMeta) {
        self(payload, meta)
    }
}

/// One reusable slot: payload plus enqueue timestamp.
#[derive(Debug)]
pub struct EventSlot<T> {
    payload: Option<T>,
    enqueued_at: Option<Instant>,
}

impl<T> EventSlot<T> {
    fn empty() -> Self {
        Self {
            payload: None,
            enqueued_at: None,
        }
    }

    /// Install a payload, stamping the enqueue time.
    pub fn set(&mut self, payload: T) {
        self.payload = Some(payload);
        self.enqueued_at = Some(Instant::now());
    }

    /// Mutable access for in-place initializers.
    pub fn payload_mut(&mut self) -> &mut Option<T> {
        &mut self.payload
    }

    pub fn is_empty(&self) -> bool {
        self.payload.is_none()
    }

    fn take(&mut self) -> Option<(T, Instant)> {
        let enqueued_at = self.enqueued_at.take().unwrap_or_else(Instant::now);
        self.payload.take().map(|p| (p, enqueued_at))
    }
}

struct Cell<T> {
    sequence: AtomicU64,
    slot: UnsafeCell<EventSlot<T>>,
}

struct RingInner<T> {
    name: String,
    cells: Box<[Cell<T>]>,
    mask: u64,
    capacity: u64,
    mode: ProducerMode,
    yellow_percent: u8,
    red_percent: u8,

    /// Next sequence a producer will claim.
    claim: CachePadded<AtomicU64>,
    /// Next sequence the consumer will read (== events retired).
    cursor: CachePadded<AtomicU64>,
    published: AtomicU64,
    full_events: AtomicU64,
    handler_panics: AtomicU64,
    /// Claimed slots whose initializer panicked.
    aborted: AtomicU64,

    accepting: AtomicBool,
    stop: AtomicBool,
    producer_wait: Waiter,
    consumer_wait: Waiter,
}

// SAFETY: a slot's contents are only touched by the producer that claimed its
// sequence (stamp == pos, claim is unique) or by the single consumer (stamp ==
// pos + 1). The Release store of the stamp after each access and the Acquire
// load before each access order those hand-offs.
unsafe impl<T: Send> Send for RingInner<T> {}
unsafe impl<T: Send> Sync for RingInner<T> {}

impl<T> RingInner<T> {
    fn cell(&self, pos: u64) -> &Cell<T> {
        &self.cells[(pos & self.mask) as usize]
    }

    fn backlog(&self) -> u64 {
        // cursor first: the later claim load can only over-count, which keeps
        // remaining_capacity a lower bound.
        let cursor = self.cursor.load(Ordering::Acquire);
        let claim = self.claim.load(Ordering::Acquire);
        claim.saturating_sub(cursor).min(self.capacity)
    }

    /// Claim the next sequence. `exclusive` marks the single-producer path.
    fn claim(&self, exclusive: bool, block: bool) -> Result<u64, QueueError> {
        let backoff = Backoff::new();
        let mut pos = self.claim.load(Ordering::Relaxed);
        let mut counted_full = false;

        loop {
            if !self.accepting.load(Ordering::Acquire) {
                return Err(QueueError::Halted);
            }

            let cell = self.cell(pos);
            let stamp = cell.sequence.load(Ordering::Acquire);

            if stamp == pos {
                if exclusive {
                    self.claim.store(pos + 1, Ordering::Relaxed);
                    return Ok(pos);
                }
                match self.claim.compare_exchange_weak(
                    pos,
                    pos + 1,
                    Ordering::Relaxed,
                    Ordering::Relaxed,
                ) {
                    Ok(_) => return Ok(pos),
                    Err(actual) => pos = actual,
                }
            } else if stamp < pos {
                // Previous occupant not yet retired: ring full.
                if !block {
                    return Err(QueueError::Full);
                }
                if !counted_full {
                    self.full_events.fetch_add(1, Ordering::Relaxed);
                    counted_full = true;
                }
                let ready = || {
                    cell.sequence.load(Ordering::Acquire) >= pos
                        || !self.accepting.load(Ordering::Acquire)
                };
                self.producer_wait.pause(&backoff, &ready);
                pos = self.claim.load(Ordering::Relaxed);
            } else {
                // Another producer got there first.
                pos = self.claim.load(Ordering::Relaxed);
            }
        }
    }

    fn commit(&self, pos: u64, init: impl FnOnce(&mut EventSlot<T>)) {
        let mut guard = CommitGuard {
            ring: self,
            pos,
            filled: false,
        };
        // SAFETY: `pos` was uniquely claimed and its stamp equals `pos`, so
        // the consumer is done with this slot and no other producer owns it.
        unsafe {
            let slot = &mut *self.cell(pos).slot.get();
            init(slot);
            if slot.enqueued_at.is_none() {
                slot.enqueued_at = Some(Instant::now());
            }
        }
        guard.filled = true;
    }

    fn publish(&self, exclusive: bool, payload: T) -> Result<(), QueueError> {
        let pos = self.claim(exclusive, true)?;
        self.commit(pos, |slot| slot.set(payload));
        Ok(())
    }

    fn try_publish(&self, exclusive: bool, payload: T) -> Result<(), (QueueError, T)> {
        match self.claim(exclusive, false) {
            Ok(pos) => {
                self.commit(pos, |slot| slot.set(payload));
                Ok(())
            }
            Err(e) => Err((e, payload)),
        }
    }

    fn publish_with(
        &self,
        exclusive: bool,
        init: impl FnOnce(&mut EventSlot<T>),
    ) -> Result<(), QueueError> {
        let pos = self.claim(exclusive, true)?;
        self.commit(pos, init);
        Ok(())
    }

    fn run_consumer<H: EventHandler<T>>(&self, mut handler: H) {
        let backoff = Backoff::new();
        let mut next = self.cursor.load(Ordering::Relaxed);

        loop {
            if self.stop.load(Ordering::Acquire) {
                break;
            }

            let cell = self.cell(next);
            if cell.sequence.load(Ordering::Acquire) != next + 1 {
                let ready = || {
                    cell.sequence.load(Ordering::Acquire) == next + 1
                        || self.stop.load(Ordering::Acquire)
                };
                self.consumer_wait.pause(&backoff, &ready);
                continue;
            }
            backoff.reset();

            // SAFETY: stamp == next + 1 means the producer finished writing
            // and nobody else touches the slot until we bump the stamp.
            let taken = unsafe { (*cell.slot.get()).take() };

            if let Some((payload, enqueued_at)) = taken {
                let meta = EventMeta {
                    sequence: next,
                    enqueued_at,
                };
                if catch_unwind(AssertUnwindSafe(|| handler.on_event(payload, meta))).is_err() {
                    self.handler_panics.fetch_add(1, Ordering::Relaxed);
                    tracing::error!(
                        "[ring:{}] consumer panicked on sequence {}, slot retired",
                        self.name,
                        next
                    );
                }
            }

            cell.sequence.store(next + self.capacity, Ordering::Release);
            next += 1;
            self.cursor.store(next, Ordering::Release);
            self.producer_wait.notify();
        }

        if catch_unwind(AssertUnwindSafe(|| handler.on_shutdown())).is_err() {
            tracing::error!("[ring:{}] consumer panicked in on_shutdown", self.name);
        }
    }
}

/// Hands a claimed slot to the consumer, even when the initializer unwinds.
/// An unfilled slot is left empty and the consumer skips it.
struct CommitGuard<'a, T> {
    ring: &'a RingInner<T>,
    pos: u64,
    filled: bool,
}

impl<T> Drop for CommitGuard<'_, T> {
    fn drop(&mut self) {
        let cell = self.ring.cell(self.pos);
        if !self.filled {
            // SAFETY: the stamp still equals `pos`, the slot is ours.
            unsafe { *cell.slot.get() = EventSlot::empty() };
            self.ring.aborted.fetch_add(1, Ordering::Relaxed);
            tracing::error!(
                "[ring:{}] initializer panicked on sequence {}, slot skipped",
                self.ring.name,
                self.pos
            );
        }
        cell.sequence.store(self.pos + 1, Ordering::Release);
        self.ring.published.fetch_add(1, Ordering::Relaxed);
        self.ring.consumer_wait.notify();
    }
}

/// Bounded concurrent queue owning its consumer thread.
pub struct RingBuffer<T: Send + 'static> {
    inner: Arc<RingInner<T>>,
    consumer: Mutex<Option<JoinHandle<()>>>,
    started: AtomicBool,
    single_taken: AtomicBool,
    halted: AtomicBool,
    abandoned: AtomicU64,
}

impl<T: Send + 'static> RingBuffer<T> {
    /// Allocate all slots up front.
    pub fn new(config: RingConfig) -> Self {
        let requested = config.capacity.max(1);
        let capacity = requested.next_power_of_two();
        if capacity != requested {
            tracing::debug!(
                "[ring:{}] capacity {} rounded up to {}",
                config.name,
                requested,
                capacity
            );
        }

        let cells: Box<[Cell<T>]> = (0..capacity)
            .map(|i| Cell {
                sequence: AtomicU64::new(i as u64),
                slot: UnsafeCell::new(EventSlot::empty()),
            })
            .collect();

        Self {
            inner: Arc::new(RingInner {
                name: config.name,
                cells,
                mask: capacity as u64 - 1,
                capacity: capacity as u64,
                mode: config.mode,
                yellow_percent: config.yellow_percent,
                red_percent: config.red_percent,
                claim: CachePadded::new(AtomicU64::new(0)),
                cursor: CachePadded::new(AtomicU64::new(0)),
                published: AtomicU64::new(0),
                full_events: AtomicU64::new(0),
                handler_panics: AtomicU64::new(0),
                aborted: AtomicU64::new(0),
                accepting: AtomicBool::new(true),
                stop: AtomicBool::new(false),
                producer_wait: Waiter::new(config.wait),
                consumer_wait: Waiter::new(config.wait),
            }),
            consumer: Mutex::new(None),
            started: AtomicBool::new(false),
            single_taken: AtomicBool::new(false),
            halted: AtomicBool::new(false),
            abandoned: AtomicU64::new(0),
        }
    }

    /// Register the consumer and spawn its thread. Only one consumer per ring.
    pub fn start<H: EventHandler<T>>(&self, handler: H) -> Result<(), QueueError> {
        if self.started.swap(true, Ordering::AcqRel) {
            return Err(QueueError::AlreadyStarted);
        }
        let inner = Arc::clone(&self.inner);
        let handle = thread::Builder::new()
            .name(format!("glad-ring-{}", self.inner.name))
            .spawn(move || inner.run_consumer(handler))
            .map_err(|e| {
                tracing::error!("[ring:{}] failed to spawn consumer: {}", self.inner.name, e);
                QueueError::Spawn
            })?;
        *self.consumer.lock() = Some(handle);
        Ok(())
    }

    /// Take the unique single-producer handle. `None` for multi-producer rings
    /// or when the handle was already taken.
    pub fn single_producer(&self) -> Option<SingleProducer<T>> {
        if self.inner.mode != ProducerMode::Single || self.single_taken.swap(true, Ordering::AcqRel)
        {
            return None;
        }
        Some(SingleProducer {
            inner: Arc::clone(&self.inner),
        })
    }

    /// Cloneable producer handle. `None` for single-producer rings.
    pub fn multi_producer(&self) -> Option<MultiProducer<T>> {
        if self.inner.mode != ProducerMode::Multi {
            return None;
        }
        Some(MultiProducer {
            inner: Arc::clone(&self.inner),
        })
    }

    pub fn name(&self) -> &str {
        &self.inner.name
    }

    pub fn capacity(&self) -> usize {
        self.inner.capacity as usize
    }

    pub fn mode(&self) -> ProducerMode {
        self.inner.mode
    }

    /// Slots claimed but not yet retired by the consumer.
    pub fn backlog(&self) -> usize {
        self.inner.backlog() as usize
    }

    /// Instantaneous lower bound on free slots.
    pub fn remaining_capacity(&self) -> usize {
        (self.inner.capacity - self.inner.backlog()) as usize
    }

    pub fn published(&self) -> u64 {
        self.inner.published.load(Ordering::Relaxed)
    }

    pub fn consumed(&self) -> u64 {
        self.inner.cursor.load(Ordering::Relaxed)
    }

    /// Number of publishes that found the ring full and had to wait.
    pub fn full_events(&self) -> u64 {
        self.inner.full_events.load(Ordering::Relaxed)
    }

    pub fn handler_panics(&self) -> u64 {
        self.inner.handler_panics.load(Ordering::Relaxed)
    }

    /// Publishes whose slot initializer panicked. Their sequences are retired
    /// empty and still count as published.
    pub fn aborted_publishes(&self) -> u64 {
        self.inner.aborted.load(Ordering::Relaxed)
    }

    /// Events left undrained by shutdown.
    pub fn abandoned(&self) -> u64 {
        self.abandoned.load(Ordering::Relaxed)
    }

    pub fn is_accepting(&self) -> bool {
        self.inner.accepting.load(Ordering::Acquire)
    }

    pub fn health(&self) -> QueueHealth {
        let percent = self.backlog() * 100 / self.capacity();
        if percent >= self.inner.red_percent as usize {
            QueueHealth::Red
        } else if percent >= self.inner.yellow_percent as usize {
            QueueHealth::Yellow
        } else {
            QueueHealth::Green
        }
    }

    pub fn stats(&self) -> RingStats {
        RingStats {
            name: self.inner.name.clone(),
            mode: self.inner.mode,
            capacity: self.capacity(),
            backlog: self.backlog(),
            remaining_capacity: self.remaining_capacity(),
            published: self.published(),
            consumed: self.consumed(),
            full_events: self.full_events(),
            handler_panics: self.handler_panics(),
            aborted_publishes: self.aborted_publishes(),
            abandoned: self.abandoned(),
            health: self.health(),
        }
    }

    /// Stop accepting publishes, drain up to `timeout`, then stop and join the
    /// consumer. Returns the number of events abandoned undrained. Idempotent:
    /// only the first call reports abandoned events.
    ///
    /// Abandoned payloads are released when the ring itself is dropped.
    pub fn shutdown(&self, timeout: Duration) -> usize {
        self.inner.accepting.store(false, Ordering::Release);
        // Producers parked on a full ring must observe the halt.
        self.inner.producer_wait.notify();
        if self.halted.swap(true, Ordering::AcqRel) {
            return 0;
        }

        let handle = self.consumer.lock().take();
        let Some(handle) = handle else {
            let abandoned = self.backlog();
            self.abandoned.store(abandoned as u64, Ordering::Relaxed);
            return abandoned;
        };

        let deadline = Instant::now() + timeout;
        while self.backlog() > 0 && Instant::now() < deadline && !handle.is_finished() {
            thread::sleep(Duration::from_millis(1));
        }
        self.inner.stop.store(true, Ordering::Release);
        self.inner.consumer_wait.notify();
        if handle.join().is_err() {
            tracing::error!("[ring:{}] consumer thread panicked", self.inner.name);
        }

        let abandoned = self.backlog();
        self.abandoned.store(abandoned as u64, Ordering::Relaxed);
        if abandoned > 0 {
            tracing::warn!(
                "[ring:{}] shutdown abandoned {} undrained events",
                self.inner.name,
                abandoned
            );
        }
        abandoned
    }
}

impl<T: Send + 'static> Drop for RingBuffer<T> {
    fn drop(&mut self) {
        self.shutdown(DROP_DRAIN_TIMEOUT);
    }
}

/// Point-in-time ring statistics.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RingStats {
    pub name: String,
    pub mode: ProducerMode,
    pub capacity: usize,
    pub backlog: usize,
    pub remaining_capacity: usize,
    pub published: u64,
    pub consumed: u64,
    pub full_events: u64,
    pub handler_panics: u64,
    pub aborted_publishes: u64,
    pub abandoned: u64,
    pub health: QueueHealth,
}

/// The unique producer of a single-producer ring.
pub struct SingleProducer<T> {
    inner: Arc<RingInner<T>>,
}

impl<T> SingleProducer<T> {
    /// Publish, waiting per the wait strategy while the ring is full.
    pub fn publish(&mut self, payload: T) -> Result<(), QueueError> {
        self.inner.publish(true, payload)
    }

    /// Publish without waiting; hands the payload back when full or halted.
    pub fn try_publish(&mut self, payload: T) -> Result<(), (QueueError, T)> {
        self.inner.try_publish(true, payload)
    }

    /// Publish by initializing the claimed slot in place.
    pub fn publish_with(
        &mut self,
        init: impl FnOnce(&mut EventSlot<T>),
    ) -> Result<(), QueueError> {
        self.inner.publish_with(true, init)
    }
}

/// A producer of a multi-producer ring; clone one per publishing thread.
pub struct MultiProducer<T> {
    inner: Arc<RingInner<T>>,
}

impl<T> Clone for MultiProducer<T> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<T> MultiProducer<T> {
    pub fn publish(&self, payload: T) -> Result<(), QueueError> {
        self.inner.publish(false, payload)
    }

    pub fn try_publish(&self, payload: T) -> Result<(), (QueueError, T)> {
        self.inner.try_publish(false, payload)
    }

    pub fn publish_with(&self, init: impl FnOnce(&mut EventSlot<T>)) -> Result<(), QueueError> {
        self.inner.publish_with(false, init)
    }

    pub fn remaining_capacity(&self) -> usize {
        (self.inner.capacity - self.inner.backlog()) as usize
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crossbeam::channel;

    fn collecting_ring(
        capacity: usize,
        mode: ProducerMode,
        wait: WaitStrategy,
    ) -> (RingBuffer<u64>, channel::Receiver<u64>) {
        let ring = RingBuffer::new(RingConfig::new("test", capacity, mode).wait(wait));
        let (tx, rx) = channel::unbounded();
        ring.start(move |v: u64, _meta: EventMeta| {
            let _ = tx.send(v);
        })
        .expect("consumer should start");
        (ring, rx)
    }

    #[test]
    fn test_capacity_power_of_two() {
        let ring: RingBuffer<u8> = RingBuffer::new(RingConfig::new("p2", 1000, ProducerMode::Multi));
        assert_eq!(ring.capacity(), 1024);
        assert_eq!(ring.remaining_capacity(), 1024);
    }

    #[test]
    fn test_single_producer_fifo() {
        let (ring, rx) = collecting_ring(8, ProducerMode::Single, WaitStrategy::Block);
        let mut producer = ring.single_producer().expect("single producer");
        for i in 0..1000 {
            producer.publish(i).expect("publish");
        }
        for i in 0..1000 {
            assert_eq!(rx.recv_timeout(Duration::from_secs(5)), Ok(i));
        }
        assert_eq!(ring.shutdown(Duration::from_secs(1)), 0);
    }

    #[test]
    fn test_single_producer_handle_is_unique() {
        let ring: RingBuffer<u8> = RingBuffer::new(RingConfig::new("u", 4, ProducerMode::Single));
        assert!(ring.single_producer().is_some());
        assert!(ring.single_producer().is_none());
        assert!(ring.multi_producer().is_none());
    }

    #[test]
    fn test_multi_producer_every_event_once() {
        for wait in [
            WaitStrategy::Block,
            WaitStrategy::Sleep,
            WaitStrategy::Yield,
            WaitStrategy::Spin,
        ] {
            let (ring, rx) = collecting_ring(16, ProducerMode::Multi, wait);
            let producer = ring.multi_producer().expect("multi producer");
            let threads: Vec<_> = (0..4u64)
                .map(|t| {
                    let p = producer.clone();
                    thread::spawn(move || {
                        for i in 0..500u64 {
                            p.publish(t * 10_000 + i).expect("publish");
                        }
                    })
                })
                .collect();
            for t in threads {
                t.join().expect("producer thread");
            }

            let mut seen: Vec<u64> = (0..2000)
                .map(|_| rx.recv_timeout(Duration::from_secs(5)).expect("event"))
                .collect();

            // Per-producer order is preserved.
            for t in 0..4u64 {
                let mine: Vec<u64> = seen.iter().copied().filter(|v| v / 10_000 == t).collect();
                let expected: Vec<u64> = (0..500).map(|i| t * 10_000 + i).collect();
                assert_eq!(mine, expected, "wait strategy {}", wait);
            }

            seen.sort_unstable();
            seen.dedup();
            assert_eq!(seen.len(), 2000);
            ring.shutdown(Duration::from_secs(1));
        }
    }

    #[test]
    fn test_full_ring_blocks_until_consumer_resumes() {
        let ring: RingBuffer<u64> =
            RingBuffer::new(RingConfig::new("gate", 1024, ProducerMode::Multi));
        let (gate_tx, gate_rx) = channel::bounded::<()>(0);
        let (done_tx, done_rx) = channel::unbounded();
        ring.start(move |v: u64, _meta: EventMeta| {
            if v == 0 {
                let _ = gate_rx.recv();
            }
            let _ = done_tx.send(v);
        })
        .expect("start");

        let producer = ring.multi_producer().expect("producer");
        for i in 0..1024 {
            producer.try_publish(i).expect("ring has room");
            assert!(ring.remaining_capacity() <= 1024);
        }
        assert_eq!(ring.remaining_capacity(), 0);
        assert_eq!(ring.health(), QueueHealth::Red);

        // 1025th publish must not fit.
        match producer.try_publish(1024) {
            Err((QueueError::Full, v)) => assert_eq!(v, 1024),
            other => panic!("expected Full, got {:?}", other.map_err(|(e, _)| e)),
        }

        let blocked = {
            let p = producer.clone();
            thread::spawn(move || p.publish(1024))
        };
        thread::sleep(Duration::from_millis(50));
        assert!(!blocked.is_finished(), "publish should block while ring is full");

        gate_tx.send(()).expect("release consumer");
        blocked
            .join()
            .expect("publisher thread")
            .expect("publish after resume");

        let received: Vec<u64> = (0..1025)
            .map(|_| done_rx.recv_timeout(Duration::from_secs(5)).expect("event"))
            .collect();
        assert_eq!(received, (0..1025).collect::<Vec<_>>());
        assert!(ring.full_events() >= 1);
    }

    #[test]
    fn test_panicking_handler_does_not_stop_ring() {
        let ring: RingBuffer<u32> = RingBuffer::new(RingConfig::new("panic", 8, ProducerMode::Single));
        let (tx, rx) = channel::unbounded();
        ring.start(move |v: u32, _meta: EventMeta| {
            if v % 3 == 0 {
                panic!("boom on {}", v);
            }
            let _ = tx.send(v);
        })
        .expect("start");

        let mut producer = ring.single_producer().expect("producer");
        for i in 1..=30 {
            producer.publish(i).expect("publish");
        }
        let got: Vec<u32> = (0..20)
            .map(|_| rx.recv_timeout(Duration::from_secs(5)).expect("event"))
            .collect();
        assert_eq!(got.len(), 20);
        assert!(got.iter().all(|v| v % 3 != 0));

        ring.shutdown(Duration::from_secs(1));
        assert_eq!(ring.handler_panics(), 10);
        assert_eq!(ring.consumed(), 30);
    }

    #[test]
    fn test_publish_after_shutdown_is_halted() {
        let (ring, _rx) = collecting_ring(4, ProducerMode::Multi, WaitStrategy::Sleep);
        let producer = ring.multi_producer().expect("producer");
        ring.shutdown(Duration::from_millis(100));
        assert_eq!(producer.publish(1), Err(QueueError::Halted));
        // Second shutdown is a no-op.
        assert_eq!(ring.shutdown(Duration::from_millis(100)), 0);
    }

    #[test]
    fn test_slot_released_after_consumption() {
        let payload = Arc::new(vec![0u8; 1024]);
        let ring: RingBuffer<Arc<Vec<u8>>> =
            RingBuffer::new(RingConfig::new("release", 4, ProducerMode::Single));
        let (tx, rx) = channel::unbounded();
        ring.start(move |_p: Arc<Vec<u8>>, _meta: EventMeta| {
            let _ = tx.send(());
        })
        .expect("start");

        let mut producer = ring.single_producer().expect("producer");
        producer.publish(Arc::clone(&payload)).expect("publish");
        rx.recv_timeout(Duration::from_secs(5)).expect("consumed");
        ring.shutdown(Duration::from_secs(1));

        // Only our handle remains: the ring kept no reference.
        assert_eq!(Arc::strong_count(&payload), 1);
    }

    #[test]
    fn test_publish_with_initializer() {
        let (ring, rx) = collecting_ring(4, ProducerMode::Single, WaitStrategy::Block);
        let mut producer = ring.single_producer().expect("producer");
        producer
            .publish_with(|slot| {
                assert!(slot.is_empty());
                slot.set(42);
            })
            .expect("publish");
        assert_eq!(rx.recv_timeout(Duration::from_secs(5)), Ok(42));
    }

    #[test]
    fn test_panicking_initializer_does_not_stall_ring() {
        let (ring, rx) = collecting_ring(4, ProducerMode::Multi, WaitStrategy::Block);
        let first = ring.multi_producer().expect("producer");
        let second = first.clone();

        let result = catch_unwind(AssertUnwindSafe(|| {
            let _ = first.publish_with(|slot| {
                *slot.payload_mut() = Some(1);
                panic!("initializer failed");
            });
        }));
        assert!(result.is_err());

        second.publish(7).expect("publish");
        assert_eq!(rx.recv_timeout(Duration::from_secs(5)), Ok(7));

        ring.shutdown(Duration::from_secs(1));
        assert_eq!(ring.backlog(), 0);
        assert_eq!(ring.consumed(), 2);
        assert_eq!(ring.aborted_publishes(), 1);
    }

    #[test]
    fn test_shutdown_reports_abandoned_once() {
        let ring: RingBuffer<u32> = RingBuffer::new(RingConfig::new("slow", 8, ProducerMode::Single));
        let (tx, rx) = channel::unbounded();
        ring.start(move |v: u32, _meta: EventMeta| {
            let _ = tx.send(v);
            thread::sleep(Duration::from_millis(200));
        })
        .expect("start");
        let mut producer = ring.single_producer().expect("producer");
        for i in 0..4 {
            producer.publish(i).expect("publish");
        }
        assert_eq!(rx.recv_timeout(Duration::from_secs(5)), Ok(0));

        // The first event is in the handler; the other three never run.
        assert_eq!(ring.shutdown(Duration::from_millis(20)), 3);
        assert_eq!(ring.shutdown(Duration::from_millis(20)), 0);
        assert_eq!(ring.abandoned(), 3);
        assert_eq!(ring.stats().abandoned, 3);
    }
}
