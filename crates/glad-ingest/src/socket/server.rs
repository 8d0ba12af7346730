// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Socket server: accept loop, client registry, reaper.
//!
//! One accept thread polls a non-blocking listener and, every reap interval,
//! closes handlers that reported done. The registry is a concurrent map; a
//! handler is removed only after it was joined and summarized into the
//! closed ledger.

use super::client::{ClientHandler, ClientId, ClientSettings, ClientStats, CloseReason};
use super::ledger::{ClosedClientSummary, ClosedLedger};
use crate::codec::DecoderFactory;
use crate::config::IngestConfig;
use crate::metrics::IngestMetrics;
use crate::sink::StoreSink;
use crossbeam::channel::{self, Receiver, Sender};
use dashmap::DashMap;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::net::{Shutdown, SocketAddr, TcpListener, TcpStream};
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

/// Server-wide settings.
#[derive(Debug, Clone)]
pub struct ServerSettings {
    pub bind_addr: SocketAddr,
    pub accept_timeout: Duration,
    pub reap_interval: Duration,
    pub join_timeout: Duration,
    pub max_clients: Option<usize>,
    pub closed_in_memory: usize,
    pub closed_path: Option<PathBuf>,
    pub client: ClientSettings,
}

impl From<&IngestConfig> for ServerSettings {
    fn from(config: &IngestConfig) -> Self {
        Self {
            bind_addr: config.listen_addr(),
            accept_timeout: config.accept_timeout(),
            reap_interval: config.reap_interval(),
            join_timeout: config.join_timeout(),
            max_clients: config.max_clients,
            closed_in_memory: config.closed_clients_in_memory,
            closed_path: config.closed_clients_path.clone(),
            client: ClientSettings::from(config),
        }
    }
}

impl Default for ServerSettings {
    fn default() -> Self {
        Self::from(&IngestConfig::default())
    }
}

struct ServerShared {
    settings: ServerSettings,
    registry: DashMap<ClientId, Arc<ClientHandler>>,
    ledger: ClosedLedger,
    next_id: AtomicU64,
    running: AtomicBool,
    decoders: Arc<dyn DecoderFactory>,
    sink: Arc<dyn StoreSink>,
    metrics: Arc<IngestMetrics>,
    exit_tx: Sender<ClientId>,
    exit_rx: Receiver<ClientId>,
}

impl ServerShared {
    fn new(
        settings: ServerSettings,
        decoders: Arc<dyn DecoderFactory>,
        sink: Arc<dyn StoreSink>,
        metrics: Arc<IngestMetrics>,
    ) -> Self {
        let (exit_tx, exit_rx) = channel::unbounded();
        Self {
            ledger: ClosedLedger::new(settings.closed_in_memory, settings.closed_path.clone()),
            settings,
            registry: DashMap::new(),
            next_id: AtomicU64::new(0),
            running: AtomicBool::new(true),
            decoders,
            sink,
            metrics,
            exit_tx,
            exit_rx,
        }
    }

    fn admit(&self, stream: TcpStream, peer: SocketAddr) {
        if let Some(max) = self.settings.max_clients {
            if self.registry.len() >= max {
                self.metrics.socket.record_rejected();
                tracing::warn!(
                    "[server] rejecting {}: {} clients already connected",
                    peer,
                    max
                );
                let _ = stream.shutdown(Shutdown::Both);
                return;
            }
        }

        let _ = stream.set_nonblocking(false);
        let id = self.next_id.fetch_add(1, Ordering::Relaxed) + 1;
        match ClientHandler::from_tcp(
            id,
            stream,
            self.settings.client.clone(),
            self.decoders.stream_decoder(),
            Arc::clone(&self.sink),
            Arc::clone(&self.metrics),
            Some(self.exit_tx.clone()),
        ) {
            Ok(handler) => {
                self.registry.insert(id, Arc::new(handler));
                self.metrics.socket.record_accepted();
            }
            Err(e) => {
                tracing::error!("[server] failed to start handler for {}: {}", peer, e);
            }
        }
    }

    /// Close one client. Concurrent calls for the same id elect one closer;
    /// the rest return false immediately.
    fn close_client(&self, id: ClientId, reason: CloseReason) -> bool {
        let Some(handler) = self.registry.get(&id).map(|e| Arc::clone(e.value())) else {
            return false;
        };
        if !handler.begin_close() {
            return false;
        }

        handler.request_shutdown_with(reason);
        if !handler.join(self.settings.join_timeout) {
            tracing::warn!("[server] client {} abandoned after join timeout", id);
        }
        let summary = handler.summary();
        tracing::info!(
            "[server] client {} ({}) closed: {:?}, {} bytes, {} records",
            id,
            summary.peer,
            summary.close_reason,
            summary.bytes_read,
            summary.records_decoded
        );
        self.ledger.record(summary);
        self.registry.remove(&id);
        true
    }

    /// Close every handler that signalled done.
    fn reap(&self) -> usize {
        let mut finished: Vec<ClientId> = self.exit_rx.try_iter().collect();
        finished.extend(
            self.registry
                .iter()
                .filter(|e| e.value().is_finished())
                .map(|e| *e.key()),
        );
        finished.sort_unstable();
        finished.dedup();

        let reaped = finished
            .into_iter()
            .filter(|id| self.close_client(*id, CloseReason::Reaped))
            .count();
        if reaped > 0 {
            tracing::debug!("[server] reaped {} finished clients", reaped);
        }
        reaped
    }

    fn drop_all_clients(&self) -> usize {
        let ids: Vec<ClientId> = self.registry.iter().map(|e| *e.key()).collect();
        ids.into_iter()
            .filter(|id| self.close_client(*id, CloseReason::Requested))
            .count()
    }
}

/// TCP ingest server.
pub struct SocketServer {
    shared: Arc<ServerShared>,
    local_addr: SocketAddr,
    accept_thread: Mutex<Option<JoinHandle<()>>>,
    closed: AtomicBool,
}

impl SocketServer {
    /// Bind and start accepting.
    pub fn start(
        settings: ServerSettings,
        decoders: Arc<dyn DecoderFactory>,
        sink: Arc<dyn StoreSink>,
        metrics: Arc<IngestMetrics>,
    ) -> std::io::Result<Self> {
        let listener = create_tcp_listener(settings.bind_addr)?;
        let local_addr = listener.local_addr()?;
        let shared = Arc::new(ServerShared::new(settings, decoders, sink, metrics));

        let loop_shared = Arc::clone(&shared);
        let handle = thread::Builder::new()
            .name("glad-accept".to_string())
            .spawn(move || accept_loop(listener, loop_shared))?;

        tracing::info!("[server] listening on {}", local_addr);
        Ok(Self {
            shared,
            local_addr,
            accept_thread: Mutex::new(Some(handle)),
            closed: AtomicBool::new(false),
        })
    }

    /// Bound address (reports the real port when bound to port 0).
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Idempotent; false if the id is unknown or already closing.
    pub fn close_client(&self, id: ClientId) -> bool {
        self.shared.close_client(id, CloseReason::Requested)
    }

    /// Close every connected client. Returns how many were closed.
    pub fn drop_all_clients(&self) -> usize {
        let closed = self.shared.drop_all_clients();
        tracing::info!("[server] dropped {} clients", closed);
        closed
    }

    /// Run one reap pass now.
    pub fn reap(&self) -> usize {
        self.shared.reap()
    }

    /// Stop accepting, release the listener, close every client. Idempotent.
    pub fn close(&self) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        self.shared.running.store(false, Ordering::Release);
        if let Some(handle) = self.accept_thread.lock().take() {
            if handle.join().is_err() {
                tracing::error!("[server] accept thread panicked");
            }
        }
        self.shared.drop_all_clients();
        tracing::info!(
            "[server] closed ({} clients closed over lifetime)",
            self.shared.ledger.total()
        );
    }

    pub fn is_running(&self) -> bool {
        self.shared.running.load(Ordering::Acquire)
    }

    pub fn open_clients(&self) -> usize {
        self.shared.registry.len()
    }

    pub fn closed_clients(&self) -> u64 {
        self.shared.ledger.total()
    }

    pub fn client_ids(&self) -> Vec<ClientId> {
        let mut ids: Vec<ClientId> = self.shared.registry.iter().map(|e| *e.key()).collect();
        ids.sort_unstable();
        ids
    }

    pub fn client_stats(&self, id: ClientId) -> Option<ClientStats> {
        self.shared.registry.get(&id).map(|e| e.value().stats())
    }

    pub fn closed_summary(&self, id: ClientId) -> Option<ClosedClientSummary> {
        self.shared.ledger.find(id)
    }

    pub fn stats(&self) -> ServerStats {
        let mut open: Vec<ClientStats> = self
            .shared
            .registry
            .iter()
            .map(|e| e.value().stats())
            .collect();
        open.sort_by_key(|s| s.connection_id);

        ServerStats {
            local_addr: self.local_addr.to_string(),
            running: self.is_running(),
            open_client_count: open.len(),
            closed_client_count: self.shared.ledger.total(),
            closed_spilled: self.shared.ledger.spilled(),
            closed_spill_errors: self.shared.ledger.spill_errors(),
            open_clients: open,
            closed_clients: self.shared.ledger.recent(),
        }
    }
}

impl Drop for SocketServer {
    fn drop(&mut self) {
        self.close();
    }
}

/// Snapshot of server state.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerStats {
    pub local_addr: String,
    pub running: bool,
    pub open_client_count: usize,
    pub closed_client_count: u64,
    /// Closed summaries moved to the side store.
    pub closed_spilled: u64,
    /// Failed writes to the side store; those summaries are lost.
    pub closed_spill_errors: u64,
    pub open_clients: Vec<ClientStats>,
    /// Most recent closed summaries still held in memory.
    pub closed_clients: Vec<ClosedClientSummary>,
}

fn create_tcp_listener(addr: SocketAddr) -> std::io::Result<TcpListener> {
    let domain = if addr.is_ipv4() {
        socket2::Domain::IPV4
    } else {
        socket2::Domain::IPV6
    };
    let socket = socket2::Socket::new(domain, socket2::Type::STREAM, Some(socket2::Protocol::TCP))?;
    socket.set_reuse_address(true)?;
    socket.bind(&addr.into())?;
    socket.listen(128)?;

    let listener: TcpListener = socket.into();
    listener.set_nonblocking(true)?;
    Ok(listener)
}

fn accept_loop(listener: TcpListener, shared: Arc<ServerShared>) {
    let mut last_reap = Instant::now();

    while shared.running.load(Ordering::Acquire) {
        match listener.accept() {
            Ok((stream, peer)) => shared.admit(stream, peer),
            Err(ref e) if e.kind() == std::io::ErrorKind::WouldBlock => {
                thread::sleep(shared.settings.accept_timeout);
            }
            Err(e) => {
                tracing::warn!("[server] accept failed: {}", e);
                thread::sleep(shared.settings.accept_timeout);
            }
        }

        if last_reap.elapsed() >= shared.settings.reap_interval {
            shared.reap();
            last_reap = Instant::now();
        }
    }
    tracing::debug!("[server] accept loop exited");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::{encode_record, GladFrameCodec};
    use crate::record::{EvrRecord, GladRecord, RecordHeader};
    use crate::sink::MemorySink;
    use std::io::{self, Read, Write};

    fn test_settings() -> ServerSettings {
        let mut settings = ServerSettings {
            bind_addr: "127.0.0.1:0".parse().expect("addr"),
            accept_timeout: Duration::from_millis(5),
            reap_interval: Duration::from_millis(50),
            join_timeout: Duration::from_secs(5),
            ..Default::default()
        };
        settings.client.read_timeout = Duration::from_millis(20);
        settings.client.ring_size = 64;
        settings
    }

    fn start(settings: ServerSettings) -> (SocketServer, Arc<MemorySink>) {
        let sink = Arc::new(MemorySink::new(10_000));
        let server = SocketServer::start(
            settings,
            Arc::new(GladFrameCodec::new()),
            sink.clone(),
            Arc::new(IngestMetrics::new()),
        )
        .expect("start server");
        (server, sink)
    }

    fn wait_for(mut cond: impl FnMut() -> bool) -> bool {
        let deadline = Instant::now() + Duration::from_secs(5);
        while Instant::now() < deadline {
            if cond() {
                return true;
            }
            thread::sleep(Duration::from_millis(5));
        }
        cond()
    }

    fn evr(id: u32) -> GladRecord {
        GladRecord::Evr(EvrRecord {
            header: RecordHeader::default(),
            evr_id: id,
            name: "E".into(),
            level: "INFO".into(),
            message: String::new(),
            realtime: true,
        })
    }

    #[test]
    fn test_ephemeral_port_reported() {
        let (server, _sink) = start(test_settings());
        assert_ne!(server.local_addr().port(), 0);
        assert_eq!(server.open_clients(), 0);
    }

    #[test]
    fn test_close_twice_without_clients() {
        let (server, _sink) = start(test_settings());
        server.close();
        server.close();
        assert!(!server.is_running());
        assert_eq!(server.drop_all_clients(), 0);
    }

    #[test]
    fn test_client_disconnect_is_reaped() {
        let (server, sink) = start(test_settings());
        {
            let mut client = TcpStream::connect(server.local_addr()).expect("connect");
            assert!(wait_for(|| server.open_clients() == 1));
            client.write_all(&encode_record(&evr(1))).expect("write");
        }
        assert!(wait_for(|| server.open_clients() == 0));
        assert_eq!(server.closed_clients(), 1);
        assert_eq!(sink.len(), 1);

        let summary = server.closed_summary(1).expect("summary");
        assert_eq!(summary.close_reason, CloseReason::EndOfStream);
        assert_eq!(summary.records_decoded, 1);
    }

    #[test]
    fn test_close_client_twice() {
        let (server, _sink) = start(test_settings());
        let _client = TcpStream::connect(server.local_addr()).expect("connect");
        assert!(wait_for(|| server.open_clients() == 1));
        let id = server.client_ids()[0];

        assert!(server.close_client(id));
        assert!(!server.close_client(id));
        assert_eq!(server.open_clients(), 0);
        assert_eq!(server.closed_clients(), 1);
        assert_eq!(
            server.closed_summary(id).map(|s| s.close_reason),
            Some(CloseReason::Requested)
        );
    }

    #[test]
    fn test_max_clients_rejects_extra() {
        let mut settings = test_settings();
        settings.max_clients = Some(1);
        let sink = Arc::new(MemorySink::new(10));
        let metrics = Arc::new(IngestMetrics::new());
        let server = SocketServer::start(
            settings,
            Arc::new(GladFrameCodec::new()),
            sink,
            Arc::clone(&metrics),
        )
        .expect("start server");

        let _a = TcpStream::connect(server.local_addr()).expect("connect a");
        assert!(wait_for(|| server.open_clients() == 1));
        let _b = TcpStream::connect(server.local_addr()).expect("connect b");
        assert!(wait_for(|| metrics.snapshot().socket.connections.rejected == 1));
        assert_eq!(server.open_clients(), 1);
    }

    #[test]
    fn test_unwritable_closed_log_reported_in_stats() {
        let dir = tempfile::tempdir().expect("tempdir");
        let mut settings = test_settings();
        settings.closed_in_memory = 1;
        // A directory cannot be opened for append.
        settings.closed_path = Some(dir.path().to_path_buf());
        let (server, _sink) = start(settings);

        for expected in 1..=2 {
            let _client = TcpStream::connect(server.local_addr()).expect("connect");
            assert!(wait_for(|| server.open_clients() == 1));
            assert_eq!(server.drop_all_clients(), 1);
            assert_eq!(server.closed_clients(), expected);
        }

        let stats = server.stats();
        assert_eq!(stats.closed_client_count, 2);
        assert_eq!(stats.closed_spilled, 0);
        assert_eq!(stats.closed_spill_errors, 1);
    }

    struct CrashingReader;

    impl Read for CrashingReader {
        fn read(&mut self, _buf: &mut [u8]) -> io::Result<usize> {
            panic!("reader crashed");
        }
    }

    #[test]
    fn test_crashed_reader_is_reaped() {
        let sink = Arc::new(MemorySink::new(10));
        let shared = ServerShared::new(
            test_settings(),
            Arc::new(GladFrameCodec::new()),
            sink.clone(),
            Arc::new(IngestMetrics::new()),
        );
        let handler = ClientHandler::spawn(
            9,
            "crashing".into(),
            CrashingReader,
            None,
            shared.settings.client.clone(),
            shared.decoders.stream_decoder(),
            sink,
            Arc::clone(&shared.metrics),
            Some(shared.exit_tx.clone()),
        )
        .expect("spawn handler");
        let handler = Arc::new(handler);
        shared.registry.insert(9, Arc::clone(&handler));

        // The done guard fires although the reader panicked.
        assert_eq!(shared.exit_rx.recv_timeout(Duration::from_secs(5)), Ok(9));
        assert!(handler.is_finished());
        assert_eq!(handler.close_reason(), None);

        assert_eq!(shared.reap(), 1);
        assert!(shared.registry.is_empty());
        assert!(handler.join(Duration::from_millis(10)));

        let summary = shared.ledger.find(9).expect("summary");
        assert_eq!(summary.close_reason, CloseReason::Reaped);
        assert_eq!(summary.bytes_read, 0);
        assert_eq!(shared.ledger.total(), 1);
    }
}
