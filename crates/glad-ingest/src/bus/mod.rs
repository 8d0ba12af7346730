// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Publish/subscribe bus ingest.
//!
//! The bus client is abstracted behind [`MessageBus`] so the pipeline does not
//! depend on a particular broker. Callbacks arrive on bus-owned threads and
//! are funneled into one shared multi-producer ring drained by a single
//! [`BusEventConsumer`].
//!
//! ```text
//!  topic A ─┐
//!  topic B ─┼─► BusSubscriber ──filter──► ring ──► BusEventConsumer ──► sink
//!  topic C ─┘
//! ```

mod consumer;
mod filter;
mod local;
mod pipeline;
mod subscriber;

pub use consumer::BusEventConsumer;
pub use filter::TypeFilter;
pub use local::LocalBus;
pub use pipeline::{BusIngest, BusIngestStats, BusSettings};
pub use subscriber::BusSubscriber;

use crate::error::BusError;
use crate::record::now_ns;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;

/// Declared type of a bus message.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum MessageType {
    AlarmedChannelSample,
    EventRecord,
    GroupedChannelSamples,
    RawChannelSample,
    Other(String),
}

impl MessageType {
    pub fn from_name(name: &str) -> Self {
        match name {
            "AlarmedChannelSample" => Self::AlarmedChannelSample,
            "EventRecord" => Self::EventRecord,
            "GroupedChannelSamples" => Self::GroupedChannelSamples,
            "RawChannelSample" => Self::RawChannelSample,
            other => Self::Other(other.to_string()),
        }
    }

    pub fn name(&self) -> &str {
        match self {
            Self::AlarmedChannelSample => "AlarmedChannelSample",
            Self::EventRecord => "EventRecord",
            Self::GroupedChannelSamples => "GroupedChannelSamples",
            Self::RawChannelSample => "RawChannelSample",
            Self::Other(name) => name,
        }
    }
}

impl fmt::Display for MessageType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// One message as delivered by the bus.
#[derive(Debug, Clone, PartialEq)]
pub struct BusMessage {
    pub topic: String,
    pub message_type: MessageType,
    /// Spacecraft id header, applied as decoding context.
    pub scid: Option<u16>,
    /// Venue header, applied as decoding context.
    pub venue: Option<String>,
    pub payload: Vec<u8>,
    /// Publish time (Unix nanoseconds).
    pub published_ns: u64,
}

impl BusMessage {
    pub fn new(topic: impl Into<String>, message_type: MessageType, payload: Vec<u8>) -> Self {
        Self {
            topic: topic.into(),
            message_type,
            scid: None,
            venue: None,
            payload,
            published_ns: now_ns(),
        }
    }

    pub fn with_scid(mut self, scid: u16) -> Self {
        self.scid = Some(scid);
        self
    }

    pub fn with_venue(mut self, venue: impl Into<String>) -> Self {
        self.venue = Some(venue.into());
        self
    }
}

/// Subscription handle returned by [`MessageBus::subscribe`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SubscriptionId(pub u64);

/// Callback interface invoked by the bus client.
///
/// May be called concurrently from several bus threads.
pub trait BusListener: Send + Sync {
    fn on_message(&self, message: Arc<BusMessage>);

    /// Subscription-level failure (e.g. broker disconnect). Reconnection is
    /// the bus client's business.
    fn on_error(&self, topic: &str, error: BusError) {
        tracing::warn!("[bus] {}: {}", topic, error);
    }
}

/// Minimal pub/sub client surface used by the pipeline.
pub trait MessageBus: Send + Sync {
    fn subscribe(
        &self,
        topic: &str,
        listener: Arc<dyn BusListener>,
    ) -> Result<SubscriptionId, BusError>;

    /// After this returns no new deliveries start for `id`; deliveries
    /// already in progress may still complete.
    fn unsubscribe(&self, id: SubscriptionId) -> Result<(), BusError>;
}
