// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Bulk loaders.
//!
//! - [`SocketLoader`] streams a capture to a running socket server over a
//!   short-lived client connection.
//! - [`DirectLoader`] feeds the same bytes straight into a stream decoder and
//!   the store sink, with no server in between.
//! - [`BusLoader`] republishes the records of a capture on an in-process bus.
//!
//! The socket and direct paths produce identical records for identical input,
//! apart from decode-time receive stamps.

use crate::bus::{BusMessage, LocalBus, MessageType};
use crate::codec::{encode_record, DecoderFactory, StreamDecoder};
use crate::config::IngestConfig;
use crate::error::BusError;
use crate::record::{AlarmState, GladRecord};
use crate::sink::StoreSink;
use serde::{Deserialize, Serialize};
use std::fs::File;
use std::io::{self, BufReader, Read, Write};
use std::net::{Shutdown, SocketAddr, TcpStream};
use std::path::Path;
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

/// Default chunk size used when reading a capture.
pub const DEFAULT_CHUNK_SIZE: usize = 64 * 1024;

/// Outcome of one load.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct LoadSummary {
    pub bytes: u64,
    pub chunks: u64,
    /// Records decoded and accepted (0 for the socket loader; the server
    /// decodes).
    pub records: u64,
    pub decode_errors: u64,
    pub sink_rejections: u64,
    /// Connection attempts used (socket loader only).
    pub attempts: u32,
    pub elapsed_ms: u64,
}

/// Streams bytes to a socket server, retrying the connection.
#[derive(Debug, Clone)]
pub struct SocketLoader {
    addr: SocketAddr,
    retries: u32,
    retry_delay: Duration,
    connect_timeout: Duration,
    chunk_size: usize,
    linger: Option<Duration>,
}

impl SocketLoader {
    pub fn new(addr: SocketAddr) -> Self {
        Self {
            addr,
            retries: 10,
            retry_delay: Duration::from_millis(2000),
            connect_timeout: Duration::from_secs(5),
            chunk_size: DEFAULT_CHUNK_SIZE,
            linger: None,
        }
    }

    /// Loader aimed at `addr` with the retry policy from `config`.
    pub fn from_config(addr: SocketAddr, config: &IngestConfig) -> Self {
        Self::new(addr)
            .retries(config.socket_loader_retries)
            .retry_delay(config.loader_retry_delay())
    }

    /// Extra connection attempts after the first one fails.
    pub fn retries(mut self, retries: u32) -> Self {
        self.retries = retries;
        self
    }

    pub fn retry_delay(mut self, delay: Duration) -> Self {
        self.retry_delay = delay;
        self
    }

    pub fn connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }

    pub fn chunk_size(mut self, size: usize) -> Self {
        self.chunk_size = size.max(1);
        self
    }

    /// After sending, wait up to `timeout` for the server to close its side.
    pub fn linger(mut self, timeout: Duration) -> Self {
        self.linger = Some(timeout);
        self
    }

    /// Connect, retrying up to the configured count. Returns the stream and
    /// the number of attempts used.
    pub fn connect(&self) -> io::Result<(TcpStream, u32)> {
        let mut attempt = 0;
        loop {
            attempt += 1;
            match TcpStream::connect_timeout(&self.addr, self.connect_timeout) {
                Ok(stream) => return Ok((stream, attempt)),
                Err(e) if attempt <= self.retries => {
                    tracing::warn!(
                        "[load] connect to {} failed (attempt {}/{}): {}",
                        self.addr,
                        attempt,
                        self.retries + 1,
                        e
                    );
                    thread::sleep(self.retry_delay);
                }
                Err(e) => {
                    tracing::error!(
                        "[load] giving up on {} after {} attempts: {}",
                        self.addr,
                        attempt,
                        e
                    );
                    return Err(e);
                }
            }
        }
    }

    pub fn load_file(&self, path: &Path) -> io::Result<LoadSummary> {
        let file = File::open(path)?;
        tracing::info!("[load] sending {} to {}", path.display(), self.addr);
        self.load_reader(BufReader::new(file))
    }

    pub fn load_bytes(&self, bytes: &[u8]) -> io::Result<LoadSummary> {
        self.load_reader(bytes)
    }

    pub fn load_reader<R: Read>(&self, mut reader: R) -> io::Result<LoadSummary> {
        let start = Instant::now();
        let (mut stream, attempts) = self.connect()?;
        let mut summary = LoadSummary {
            attempts,
            ..LoadSummary::default()
        };

        let mut buf = vec![0u8; self.chunk_size];
        loop {
            let n = match reader.read(&mut buf) {
                Ok(0) => break,
                Ok(n) => n,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(e),
            };
            stream.write_all(&buf[..n])?;
            summary.bytes += n as u64;
            summary.chunks += 1;
        }
        stream.flush()?;
        stream.shutdown(Shutdown::Write)?;

        if let Some(timeout) = self.linger {
            wait_for_close(&mut stream, timeout)?;
        }

        summary.elapsed_ms = start.elapsed().as_millis() as u64;
        tracing::info!(
            "[load] sent {} bytes in {} chunks to {}",
            summary.bytes,
            summary.chunks,
            self.addr
        );
        Ok(summary)
    }
}

/// Read until the peer closes or `timeout` passes.
fn wait_for_close(stream: &mut TcpStream, timeout: Duration) -> io::Result<()> {
    let deadline = Instant::now() + timeout;
    let mut scratch = [0u8; 256];
    loop {
        let left = deadline.saturating_duration_since(Instant::now());
        if left.is_zero() {
            tracing::debug!("[load] server still open after {:?}", timeout);
            return Ok(());
        }
        stream.set_read_timeout(Some(left))?;
        match stream.read(&mut scratch) {
            Ok(0) => return Ok(()),
            Ok(_) => continue,
            Err(e)
                if matches!(
                    e.kind(),
                    io::ErrorKind::WouldBlock | io::ErrorKind::TimedOut
                ) =>
            {
                return Ok(())
            }
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) if e.kind() == io::ErrorKind::ConnectionReset => return Ok(()),
            Err(e) => return Err(e),
        }
    }
}

/// Decodes a byte source locally and hands records to a sink.
pub struct DirectLoader {
    decoders: Arc<dyn DecoderFactory>,
    sink: Arc<dyn StoreSink>,
    chunk_size: usize,
}

impl DirectLoader {
    pub fn new(decoders: Arc<dyn DecoderFactory>, sink: Arc<dyn StoreSink>) -> Self {
        Self {
            decoders,
            sink,
            chunk_size: DEFAULT_CHUNK_SIZE,
        }
    }

    pub fn chunk_size(mut self, size: usize) -> Self {
        self.chunk_size = size.max(1);
        self
    }

    pub fn load_file(&self, path: &Path) -> io::Result<LoadSummary> {
        let file = File::open(path)?;
        tracing::info!("[load] decoding {}", path.display());
        self.load_reader(BufReader::new(file))
    }

    pub fn load_bytes(&self, bytes: &[u8]) -> io::Result<LoadSummary> {
        self.load_reader(bytes)
    }

    pub fn load_reader<R: Read>(&self, mut reader: R) -> io::Result<LoadSummary> {
        let start = Instant::now();
        let mut decoder = self.decoders.stream_decoder();
        let mut summary = LoadSummary::default();

        let mut buf = vec![0u8; self.chunk_size];
        loop {
            let n = match reader.read(&mut buf) {
                Ok(0) => break,
                Ok(n) => n,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(e),
            };
            summary.bytes += n as u64;
            summary.chunks += 1;
            self.push(decoder.as_mut(), &buf[..n], &mut summary);
        }

        if decoder.buffered() > 0 {
            tracing::warn!(
                "[load] {} trailing bytes did not complete a frame",
                decoder.buffered()
            );
        }
        summary.elapsed_ms = start.elapsed().as_millis() as u64;
        tracing::info!(
            "[load] {} records from {} bytes ({} decode errors)",
            summary.records,
            summary.bytes,
            summary.decode_errors
        );
        Ok(summary)
    }

    fn push(&self, decoder: &mut dyn StreamDecoder, chunk: &[u8], summary: &mut LoadSummary) {
        let decoded = decoder.feed(chunk);
        for err in decoded.errors {
            summary.decode_errors += 1;
            tracing::warn!("[load] decode error: {}", err);
        }
        for record in decoded.records {
            match self.sink.on_data(record) {
                Ok(()) => summary.records += 1,
                Err(e) => {
                    summary.sink_rejections += 1;
                    tracing::warn!("[load] sink rejected record: {}", e);
                }
            }
        }
    }
}

/// Bus message type a record travels as.
pub fn message_type_of(record: &GladRecord) -> MessageType {
    match record {
        GladRecord::Eha(eha) if eha.alarm_state != AlarmState::None => {
            MessageType::AlarmedChannelSample
        }
        GladRecord::Eha(_) => MessageType::RawChannelSample,
        GladRecord::Evr(_) => MessageType::EventRecord,
    }
}

/// Republishes a capture's records on a [`LocalBus`], one message per record.
pub struct BusLoader {
    bus: Arc<LocalBus>,
    decoders: Arc<dyn DecoderFactory>,
    eha_topic: String,
    evr_topic: String,
}

impl BusLoader {
    pub fn new(
        bus: Arc<LocalBus>,
        decoders: Arc<dyn DecoderFactory>,
        eha_topic: impl Into<String>,
        evr_topic: impl Into<String>,
    ) -> Self {
        Self {
            bus,
            decoders,
            eha_topic: eha_topic.into(),
            evr_topic: evr_topic.into(),
        }
    }

    /// Publish every record in `bytes`. Returns the number of messages
    /// published.
    pub fn load_bytes(&self, bytes: &[u8]) -> Result<usize, BusError> {
        let decoded = self.decoders.stream_decoder().feed(bytes);
        for err in &decoded.errors {
            tracing::warn!("[load] skipping undecodable frame: {}", err);
        }

        let mut published = 0;
        for record in decoded.records {
            let topic = match record {
                GladRecord::Eha(_) => &self.eha_topic,
                GladRecord::Evr(_) => &self.evr_topic,
            };
            let message = BusMessage::new(
                topic.clone(),
                message_type_of(&record),
                encode_record(&record),
            )
            .with_scid(record.header().scid)
            .with_venue(record.header().venue.clone());
            self.bus.publish(message)?;
            published += 1;
        }
        Ok(published)
    }
}
