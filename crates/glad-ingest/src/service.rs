// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Ingest service: owns the socket server and the bus pipeline selected by
//! the configured data source, plus the administrative surface.

use crate::bus::{BusIngest, BusIngestStats, BusSettings, MessageBus};
use crate::codec::{BusTranslator, DecoderFactory, GladFrameCodec};
use crate::config::{DataSource, IngestConfig};
use crate::error::{ConfigError, IngestError, Result};
use crate::metrics::{IngestMetrics, MetricsReporter, MetricsSnapshot};
use crate::sink::{MemorySink, StoreSink};
use crate::socket::{ServerSettings, ServerStats, SocketServer};
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

/// Builder for [`GlobalLadIngest`].
pub struct IngestBuilder {
    config: IngestConfig,
    sink: Option<Arc<dyn StoreSink>>,
    bus: Option<Arc<dyn MessageBus>>,
    decoders: Arc<dyn DecoderFactory>,
    translator: Arc<dyn BusTranslator>,
    metrics: Option<Arc<IngestMetrics>>,
}

impl IngestBuilder {
    /// Store sink (default: a [`MemorySink`] sized by `sink_capacity`).
    pub fn sink(mut self, sink: Arc<dyn StoreSink>) -> Self {
        self.sink = Some(sink);
        self
    }

    /// Bus client; required when the data source includes the bus.
    pub fn bus(mut self, bus: Arc<dyn MessageBus>) -> Self {
        self.bus = Some(bus);
        self
    }

    pub fn decoders(mut self, decoders: Arc<dyn DecoderFactory>) -> Self {
        self.decoders = decoders;
        self
    }

    pub fn translator(mut self, translator: Arc<dyn BusTranslator>) -> Self {
        self.translator = translator;
        self
    }

    /// Share an existing metrics instance.
    pub fn metrics(mut self, metrics: Arc<IngestMetrics>) -> Self {
        self.metrics = Some(metrics);
        self
    }

    /// Validate the configuration and start every enabled feed.
    pub fn start(self) -> Result<GlobalLadIngest> {
        let config = self.config;
        config.validate()?;

        let metrics = self.metrics.unwrap_or_default();
        let sink: Arc<dyn StoreSink> = match self.sink {
            Some(sink) => sink,
            None => Arc::new(MemorySink::new(config.sink_capacity)),
        };

        let bus = if config.data_source.uses_bus() {
            let client = self.bus.ok_or_else(|| {
                IngestError::Config(ConfigError::InvalidValue(
                    "bus data source requires a message bus client".into(),
                ))
            })?;
            let ingest = BusIngest::new(
                client,
                BusSettings::from(&config),
                self.translator,
                Arc::clone(&sink),
                Arc::clone(&metrics),
            )?;
            ingest.start()?;
            Some(ingest)
        } else {
            None
        };

        let server = if config.data_source.uses_socket() {
            Some(SocketServer::start(
                ServerSettings::from(&config),
                self.decoders,
                Arc::clone(&sink),
                Arc::clone(&metrics),
            )?)
        } else {
            None
        };

        let reporter = if config.metrics_report_interval_secs > 0 {
            let source = Arc::clone(&metrics);
            Some(MetricsReporter::spawn(
                Duration::from_secs(config.metrics_report_interval_secs),
                move || serde_json::to_value(source.snapshot()).unwrap_or_default(),
            )?)
        } else {
            None
        };

        tracing::info!(
            "[ingest] started (source: {:?}, socket: {}, bus topics: {})",
            config.data_source,
            server
                .as_ref()
                .map(|s| s.local_addr().to_string())
                .unwrap_or_else(|| "off".to_string()),
            bus.as_ref().map(|b| b.stats().active_topics.len()).unwrap_or(0)
        );

        Ok(GlobalLadIngest {
            config,
            metrics,
            sink,
            server,
            bus,
            reporter: Mutex::new(reporter),
            closed: AtomicBool::new(false),
        })
    }
}

/// Running ingest service.
pub struct GlobalLadIngest {
    config: IngestConfig,
    metrics: Arc<IngestMetrics>,
    sink: Arc<dyn StoreSink>,
    server: Option<SocketServer>,
    bus: Option<BusIngest>,
    reporter: Mutex<Option<MetricsReporter>>,
    closed: AtomicBool,
}

impl GlobalLadIngest {
    pub fn builder(config: IngestConfig) -> IngestBuilder {
        let codec = Arc::new(GladFrameCodec::new());
        IngestBuilder {
            config,
            sink: None,
            bus: None,
            decoders: codec.clone(),
            translator: codec,
            metrics: None,
        }
    }

    pub fn config(&self) -> &IngestConfig {
        &self.config
    }

    pub fn metrics(&self) -> &Arc<IngestMetrics> {
        &self.metrics
    }

    pub fn sink(&self) -> &Arc<dyn StoreSink> {
        &self.sink
    }

    /// Socket server address, if the socket feed is enabled.
    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.server.as_ref().map(SocketServer::local_addr)
    }

    pub fn server(&self) -> Option<&SocketServer> {
        self.server.as_ref()
    }

    pub fn bus_ingest(&self) -> Option<&BusIngest> {
        self.bus.as_ref()
    }

    /// Close every socket client. Returns how many were closed.
    pub fn drop_all_clients(&self) -> usize {
        self.server
            .as_ref()
            .map(SocketServer::drop_all_clients)
            .unwrap_or(0)
    }

    pub fn stats(&self) -> IngestStats {
        IngestStats {
            timestamp: Utc::now(),
            data_source: self.config.data_source,
            socket: self.server.as_ref().map(SocketServer::stats),
            bus: self.bus.as_ref().map(BusIngest::stats),
            metrics: self.metrics.snapshot(),
        }
    }

    /// Stats as a JSON document.
    pub fn stats_json(&self) -> serde_json::Value {
        serde_json::to_value(self.stats()).unwrap_or_default()
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    /// Stop the reporter, the bus pipeline and the socket server. Idempotent.
    pub fn close(&self) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        if let Some(mut reporter) = self.reporter.lock().take() {
            reporter.stop();
        }
        if let Some(bus) = &self.bus {
            bus.stop();
        }
        if let Some(server) = &self.server {
            server.close();
        }
        let snap = self.metrics.snapshot();
        tracing::info!(
            "[ingest] closed (socket records: {}, bus records: {})",
            snap.socket.processed.records,
            snap.bus.processed.records
        );
    }
}

impl Drop for GlobalLadIngest {
    fn drop(&mut self) {
        self.close();
    }
}

/// Administrative stats document.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IngestStats {
    pub timestamp: DateTime<Utc>,
    pub data_source: DataSource,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub socket: Option<ServerStats>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub bus: Option<BusIngestStats>,
    pub metrics: MetricsSnapshot,
}
