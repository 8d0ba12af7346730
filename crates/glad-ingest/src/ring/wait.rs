// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Wait strategies for ring producers (ring full) and consumers (ring empty).
//!
//! | Strategy | Idle behavior                        | Wake latency | CPU  |
//! |----------|--------------------------------------|--------------|------|
//! | `Block`  | condvar park, woken by the other side| ~10 us       | none |
//! | `Sleep`  | spin, yield, then 100 us sleeps      | ~100 us      | low  |
//! | `Yield`  | spin, then `yield_now`               | ~1 us        | high |
//! | `Spin`   | busy spin                            | ~100 ns      | full |
//!
//! The choice never affects correctness.

use crossbeam::utils::Backoff;
use parking_lot::{Condvar, Mutex};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use std::sync::atomic::{fence, AtomicUsize, Ordering};
use std::time::Duration;

/// Upper bound on one blocking park; covers a wakeup lost to a race.
const BLOCK_PARK_TIMEOUT: Duration = Duration::from_millis(10);

/// Sleep length once a sleeping waiter has exhausted its spin/yield budget.
const SLEEP_PARK: Duration = Duration::from_micros(100);

/// Backoff policy applied when a ring is full (producers) or empty (consumer).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase", from = "String")]
pub enum WaitStrategy {
    /// Park on a condition variable until signalled.
    #[default]
    Block,
    /// Spin, then yield, then sleep in short increments.
    Sleep,
    /// Spin briefly, then yield the time slice.
    Yield,
    /// Busy spin.
    Spin,
}

impl WaitStrategy {
    /// Parse a configured name, falling back to `Block` for unknown values.
    pub fn parse_or_default(name: &str) -> Self {
        name.parse().unwrap_or_default()
    }
}

impl From<String> for WaitStrategy {
    fn from(name: String) -> Self {
        Self::parse_or_default(&name)
    }
}

impl FromStr for WaitStrategy {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "block" | "blocking" => Ok(Self::Block),
            "sleep" | "sleeping" => Ok(Self::Sleep),
            "yield" | "yielding" => Ok(Self::Yield),
            "spin" | "spinning" => Ok(Self::Spin),
            other => Err(format!("unknown wait strategy '{}'", other)),
        }
    }
}

impl fmt::Display for WaitStrategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Block => "block",
            Self::Sleep => "sleep",
            Self::Yield => "yield",
            Self::Spin => "spin",
        };
        f.write_str(name)
    }
}

/// One side's waiting room (either "ring full" or "ring empty").
pub(crate) struct Waiter {
    strategy: WaitStrategy,
    lock: Mutex<()>,
    cond: Condvar,
    parked: AtomicUsize,
}

impl Waiter {
    pub(crate) fn new(strategy: WaitStrategy) -> Self {
        Self {
            strategy,
            lock: Mutex::new(()),
            cond: Condvar::new(),
            parked: AtomicUsize::new(0),
        }
    }

    /// Perform one wait step. Callers loop, re-checking their own condition.
    ///
    /// `ready` is evaluated under the park lock for `Block`, so a notify that
    /// happens after the check cannot be missed for longer than
    /// `BLOCK_PARK_TIMEOUT`.
    pub(crate) fn pause(&self, backoff: &Backoff, ready: &dyn Fn() -> bool) {
        match self.strategy {
            WaitStrategy::Block => {
                let mut guard = self.lock.lock();
                self.parked.fetch_add(1, Ordering::SeqCst);
                fence(Ordering::SeqCst);
                if !ready() {
                    let _ = self.cond.wait_for(&mut guard, BLOCK_PARK_TIMEOUT);
                }
                self.parked.fetch_sub(1, Ordering::SeqCst);
            }
            WaitStrategy::Sleep => {
                if backoff.is_completed() {
                    std::thread::sleep(SLEEP_PARK);
                } else {
                    backoff.snooze();
                }
            }
            WaitStrategy::Yield => backoff.snooze(),
            WaitStrategy::Spin => backoff.spin(),
        }
    }

    /// Wake parked waiters. Cheap when nobody is parked.
    pub(crate) fn notify(&self) {
        if self.strategy != WaitStrategy::Block {
            return;
        }
        fence(Ordering::SeqCst);
        if self.parked.load(Ordering::SeqCst) > 0 {
            let _guard = self.lock.lock();
            self.cond.notify_all();
        }
    }
}
