// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Error types for the ingestion pipeline.

use thiserror::Error;

/// Ring buffer errors.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum QueueError {
    #[error("queue halted")]
    Halted,

    #[error("queue full")]
    Full,

    #[error("queue consumer already started")]
    AlreadyStarted,

    #[error("failed to spawn queue consumer")]
    Spawn,
}

/// Decoder/translator errors. Always recoverable: the offending record is
/// dropped and decoding continues.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DecodeError {
    #[error("bad start word 0x{0:08x}")]
    BadStartWord(u32),

    #[error("frame length {0} exceeds limit {1}")]
    FrameTooLarge(usize, usize),

    #[error("frame truncated: need {needed} bytes, have {available}")]
    Truncated { needed: usize, available: usize },

    #[error("unknown record type {0}")]
    UnknownRecordType(u8),

    #[error("invalid UTF-8 in field {0}")]
    InvalidUtf8(&'static str),

    #[error("malformed record: {0}")]
    Malformed(String),
}

/// Store sink rejections.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SinkError {
    #[error("record rejected: {0}")]
    Rejected(String),
}

/// Message bus errors.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum BusError {
    #[error("bus disconnected: {0}")]
    Disconnected(String),

    #[error("subscribe failed: {0}")]
    Subscribe(String),

    #[error("bus closed")]
    Closed,
}

/// Configuration errors.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("parse error: {0}")]
    Parse(#[from] serde_json::Error),

    #[error("invalid value: {0}")]
    InvalidValue(String),
}

/// Top-level pipeline errors.
#[derive(Debug, Error)]
pub enum IngestError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("bus error: {0}")]
    Bus(#[from] BusError),

    #[error("queue error: {0}")]
    Queue(#[from] QueueError),

    #[error("already running")]
    AlreadyRunning,
}

/// Result alias for pipeline operations.
pub type Result<T> = std::result::Result<T, IngestError>;
