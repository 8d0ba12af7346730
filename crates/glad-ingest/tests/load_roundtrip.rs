// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

#![allow(clippy::uninlined_format_args)] // Test code readability

//! Socket and direct loaders must produce the same records.

use glad_ingest::codec::encode_record;
use glad_ingest::config::{DataSource, IngestConfig};
use glad_ingest::record::{AlarmState, DnType, EhaRecord, EvrRecord, GladRecord, RecordHeader};
use glad_ingest::{DirectLoader, GladFrameCodec, GlobalLadIngest, MemorySink, SocketLoader};
use std::io::Write;
use std::net::{IpAddr, Ipv4Addr};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

fn capture() -> Vec<GladRecord> {
    (0..300u32)
        .map(|i| {
            let header = RecordHeader {
                scid: 202,
                venue: "OPS".into(),
                host: "dsn-relay".into(),
                session: 41,
                dss_id: 14,
                vcid: 2,
                sclk_coarse: 700_000_000 + i,
                sclk_fine: i * 3,
                ert_ms: 1_700_000_000_000 + i64::from(i),
                scet_ms: 1_699_999_990_000 + i64::from(i),
                event_time_ms: 1_700_000_000_000 + i64::from(i),
                ..RecordHeader::default()
            };
            if i % 5 == 0 {
                GladRecord::Evr(EvrRecord {
                    header,
                    evr_id: 900 + i,
                    name: "FSW_BOOT".into(),
                    level: "FATAL".into(),
                    message: format!("boot count {}", i),
                    realtime: false,
                })
            } else {
                GladRecord::Eha(EhaRecord {
                    header,
                    channel_id: format!("P-{:04}", i % 17),
                    dn_type: DnType::Float,
                    dn_raw: f64::from(i).to_bits(),
                    eu: Some(f64::from(i) * 1.5),
                    alarm_state: if i % 7 == 0 { AlarmState::Red } else { AlarmState::None },
                    realtime: false,
                })
            }
        })
        .collect()
}

fn strip(records: Vec<GladRecord>) -> Vec<GladRecord> {
    records.iter().map(GladRecord::without_receive_time).collect()
}

#[test]
fn test_socket_and_direct_loads_match() {
    let records = capture();
    let bytes: Vec<u8> = records.iter().flat_map(encode_record).collect();

    let dir = tempfile::tempdir().expect("tempdir");
    let path = dir.path().join("pass.glad");
    std::fs::File::create(&path)
        .and_then(|mut f| f.write_all(&bytes))
        .expect("write capture");

    // Direct path.
    let direct_sink = Arc::new(MemorySink::new(10_000));
    let direct = DirectLoader::new(Arc::new(GladFrameCodec::new()), direct_sink.clone())
        .load_file(&path)
        .expect("direct load");
    assert_eq!(direct.records, 300);
    assert_eq!(direct.decode_errors, 0);

    // Socket path through a running service.
    let socket_sink = Arc::new(MemorySink::new(10_000));
    let config = IngestConfig {
        bind_address: IpAddr::V4(Ipv4Addr::LOCALHOST),
        port: 0,
        data_source: DataSource::Socket,
        reap_interval_secs: 1,
        ..IngestConfig::default()
    };
    let ingest = GlobalLadIngest::builder(config.clone())
        .sink(socket_sink.clone())
        .start()
        .expect("start ingest");
    let addr = ingest.local_addr().expect("socket feed");

    let sent = SocketLoader::from_config(addr, &config)
        .chunk_size(1000)
        .load_file(&path)
        .expect("socket load");
    assert_eq!(sent.bytes, bytes.len() as u64);
    assert_eq!(sent.attempts, 1);

    let deadline = Instant::now() + Duration::from_secs(10);
    while socket_sink.len() < 300 && Instant::now() < deadline {
        thread::sleep(Duration::from_millis(10));
    }
    ingest.close();

    let expected: Vec<GladRecord> = records;
    assert_eq!(strip(direct_sink.drain()), expected);
    assert_eq!(strip(socket_sink.drain()), expected);
}

#[test]
fn test_socket_loader_waits_for_late_server() {
    // Reserve a port, release it, and start the server there after a delay.
    let addr = {
        let l = std::net::TcpListener::bind("127.0.0.1:0").expect("bind");
        l.local_addr().expect("addr")
    };
    let config = IngestConfig {
        bind_address: addr.ip(),
        port: addr.port(),
        reap_interval_secs: 1,
        ..IngestConfig::default()
    };
    let sink = Arc::new(MemorySink::new(10));

    let server_config = config.clone();
    let server_sink = sink.clone();
    let server = thread::spawn(move || {
        thread::sleep(Duration::from_millis(300));
        GlobalLadIngest::builder(server_config)
            .sink(server_sink)
            .start()
            .expect("start ingest")
    });

    let frame = encode_record(&capture()[0]);
    let summary = SocketLoader::new(addr)
        .retries(20)
        .retry_delay(Duration::from_millis(100))
        .load_bytes(&frame)
        .expect("load after retries");
    assert!(summary.attempts > 1);

    let ingest = server.join().expect("server thread");
    let deadline = Instant::now() + Duration::from_secs(5);
    while sink.is_empty() && Instant::now() < deadline {
        thread::sleep(Duration::from_millis(10));
    }
    assert_eq!(sink.len(), 1);
    ingest.close();
}
