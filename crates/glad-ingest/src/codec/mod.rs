// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Decoder/translator seams.
//!
//! Socket handlers own one [`StreamDecoder`] each (frames may span reads);
//! the bus consumer shares one [`BusTranslator`]. [`GladFrameCodec`] is the
//! built-in implementation of both.

mod frame;

pub use frame::{encode_record, GladFrameCodec, GladStreamDecoder, DEFAULT_MAX_FRAME, START_WORD};

use crate::bus::BusMessage;
use crate::error::DecodeError;
use crate::record::GladRecord;

/// Output of one [`StreamDecoder::feed`] call.
#[derive(Debug, Default)]
pub struct Decoded {
    pub records: Vec<GladRecord>,
    /// Recoverable errors hit while decoding this chunk.
    pub errors: Vec<DecodeError>,
}

impl Decoded {
    pub fn is_empty(&self) -> bool {
        self.records.is_empty() && self.errors.is_empty()
    }
}

/// Stateful decoder for one byte stream.
pub trait StreamDecoder: Send {
    /// Append a chunk and return every record it completes.
    fn feed(&mut self, chunk: &[u8]) -> Decoded;

    /// Bytes held waiting for the rest of a frame.
    fn buffered(&self) -> usize;
}

/// Creates a fresh [`StreamDecoder`] per connection.
pub trait DecoderFactory: Send + Sync {
    fn stream_decoder(&self) -> Box<dyn StreamDecoder>;
}

/// Translates one bus message into records.
pub trait BusTranslator: Send + Sync {
    /// Message metadata (spacecraft id, venue) is applied as decoding context.
    fn translate(&self, message: &BusMessage) -> Result<Vec<GladRecord>, DecodeError>;
}
