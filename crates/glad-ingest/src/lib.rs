// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Global LAD Ingestion Pipeline
//!
//! Moves spacecraft telemetry from live feeds into the latest-available-data
//! store:
//! - Socket feed: one reader thread and one private ring per TCP client
//! - Bus feed: topic subscriptions sharing one multi-producer ring
//!
//! # Quick Start
//!
//! ```bash
//! # Socket feed on the default port (8900)
//! glad-ingestd
//!
//! # Socket and bus feeds from a config file
//! glad-ingestd --config ingest.json --data-source both
//!
//! # Bulk load a capture through the running server
//! glad-load --input pass-0412.glad --port 8900
//!
//! # Decode a capture locally and print records as JSON lines
//! glad-load --input pass-0412.glad --direct
//! ```
//!
//! # Pipeline
//!
//! | Stage | Socket feed | Bus feed |
//! |-------|-------------|----------|
//! | Producer | `ClientHandler` reader | `BusSubscriber` callback |
//! | Queue | single-producer ring per client | one multi-producer ring |
//! | Decode | `StreamDecoder` per client | shared `BusTranslator` |
//! | Output | `StoreSink` | `StoreSink` |

pub mod bus;
pub mod codec;
pub mod config;
pub mod error;
pub mod load;
pub mod metrics;
pub mod record;
pub mod ring;
pub mod service;
pub mod sink;
pub mod socket;

pub use bus::{BusIngest, BusMessage, BusSettings, LocalBus, MessageBus, MessageType, TypeFilter};
pub use codec::{BusTranslator, DecoderFactory, GladFrameCodec, StreamDecoder};
pub use config::{DataSource, IngestConfig};
pub use error::{IngestError, Result};
pub use load::{BusLoader, DirectLoader, LoadSummary, SocketLoader};
pub use metrics::{IngestMetrics, MetricsSnapshot};
pub use record::{EhaRecord, EvrRecord, GladRecord, RecordHeader};
pub use ring::{QueueHealth, RingBuffer, RingConfig, WaitStrategy};
pub use service::{GlobalLadIngest, IngestBuilder, IngestStats};
pub use sink::{MemorySink, StoreSink};
pub use socket::{ServerSettings, SocketServer};
