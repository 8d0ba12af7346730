// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Single consumer of the shared bus ring.

use super::BusMessage;
use crate::codec::BusTranslator;
use crate::metrics::IngestMetrics;
use crate::ring::{EventHandler, EventMeta};
use crate::sink::StoreSink;
use std::sync::Arc;

/// Translates dequeued bus messages and forwards the records to the sink.
///
/// A message that fails to translate is logged, counted and skipped.
pub struct BusEventConsumer {
    translator: Arc<dyn BusTranslator>,
    sink: Arc<dyn StoreSink>,
    metrics: Arc<IngestMetrics>,
}

impl BusEventConsumer {
    pub fn new(
        translator: Arc<dyn BusTranslator>,
        sink: Arc<dyn StoreSink>,
        metrics: Arc<IngestMetrics>,
    ) -> Self {
        Self {
            translator,
            sink,
            metrics,
        }
    }

    fn process(&self, message: &BusMessage) {
        let stage = &self.metrics.bus.stage;
        let records = match self.translator.translate(message) {
            Ok(records) => records,
            Err(e) => {
                stage.record_decode_error();
                tracing::warn!(
                    "[bus] failed to decode {} from {} (scid {:?}): {}",
                    message.message_type,
                    message.topic,
                    message.scid,
                    e
                );
                return;
            }
        };

        for record in records {
            let kind = record.kind();
            match self.sink.on_data(record) {
                Ok(()) => stage.record_processed(kind),
                Err(e) => {
                    stage.record_sink_rejection();
                    tracing::warn!("[bus] sink rejected record from {}: {}", message.topic, e);
                }
            }
        }
    }
}

impl EventHandler<Arc<BusMessage>> for BusEventConsumer {
    fn on_event(&mut self, message: Arc<BusMessage>, meta: EventMeta) {
        self.metrics.bus.stage.record_queue_wait(meta.queue_wait());
        self.process(&message);
    }

    fn on_shutdown(&mut self) {
        tracing::debug!(
            "[bus] consumer stopped after {} records",
            self.metrics.bus.stage.records_processed()
        );
    }
}
