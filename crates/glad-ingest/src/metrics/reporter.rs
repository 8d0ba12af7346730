// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Periodic stats logger.

use crossbeam::channel::{self, RecvTimeoutError, Sender};
use std::thread::{self, JoinHandle};
use std::time::Duration;

/// Background thread logging a JSON stats document at a fixed interval.
///
/// Dropping the reporter disconnects its stop channel and joins the thread.
pub struct MetricsReporter {
    stop_tx: Option<Sender<()>>,
    thread: Option<JoinHandle<()>>,
}

impl MetricsReporter {
    /// Spawn the reporter. `source` is called once per tick on the reporter
    /// thread.
    pub fn spawn<F>(interval: Duration, source: F) -> std::io::Result<Self>
    where
        F: Fn() -> serde_json::Value + Send + 'static,
    {
        let (stop_tx, stop_rx) = channel::bounded::<()>(0);
        let thread = thread::Builder::new()
            .name("glad-metrics".to_string())
            .spawn(move || loop {
                match stop_rx.recv_timeout(interval) {
                    Err(RecvTimeoutError::Timeout) => {
                        let stats = source();
                        tracing::info!(target: "glad::metrics", "{}", stats);
                    }
                    Ok(()) | Err(RecvTimeoutError::Disconnected) => {
                        tracing::debug!("[metrics] reporter stopped");
                        break;
                    }
                }
            })?;

        Ok(Self {
            stop_tx: Some(stop_tx),
            thread: Some(thread),
        })
    }

    /// Signal the thread to stop and wait for it. Idempotent.
    pub fn stop(&mut self) {
        drop(self.stop_tx.take());
        if let Some(handle) = self.thread.take() {
            let _ = handle.join();
        }
    }
}

impl Drop for MetricsReporter {
    fn drop(&mut self) {
        self.stop();
    }
}
