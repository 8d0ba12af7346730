// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

#![allow(clippy::uninlined_format_args)] // Test code readability

//! Bus feed integration tests on the in-process bus.

use glad_ingest::bus::{BusIngest, BusMessage, BusSettings, LocalBus, MessageType};
use glad_ingest::codec::encode_record;
use glad_ingest::error::BusError;
use glad_ingest::metrics::IngestMetrics;
use glad_ingest::record::{EvrRecord, GladRecord, RecordHeader};
use glad_ingest::{GladFrameCodec, MemorySink, WaitStrategy};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

fn settings(accepted: &[&str]) -> BusSettings {
    BusSettings {
        topics: vec!["mpcs.evr".into(), "mpcs.eha".into()],
        accepted_types: accepted.iter().map(|s| s.to_string()).collect(),
        ring_size: 16,
        wait: WaitStrategy::Yield,
        yellow_percent: 90,
        red_percent: 100,
        drain_timeout: Duration::from_secs(5),
    }
}

fn evr(id: u32) -> Vec<u8> {
    encode_record(&GladRecord::Evr(EvrRecord {
        header: RecordHeader::default(),
        evr_id: id,
        name: format!("EVR_{}", id),
        level: "ACTIVITY_HI".into(),
        message: "ok".into(),
        realtime: true,
    }))
}

struct Pipeline {
    bus: Arc<LocalBus>,
    sink: Arc<MemorySink>,
    metrics: Arc<IngestMetrics>,
    ingest: BusIngest,
}

fn pipeline(accepted: &[&str]) -> Pipeline {
    let bus = Arc::new(LocalBus::new());
    let sink = Arc::new(MemorySink::new(10_000));
    let metrics = Arc::new(IngestMetrics::new());
    let ingest = BusIngest::new(
        bus.clone(),
        settings(accepted),
        Arc::new(GladFrameCodec::new()),
        sink.clone(),
        Arc::clone(&metrics),
    )
    .expect("build");
    ingest.start().expect("start");
    Pipeline {
        bus,
        sink,
        metrics,
        ingest,
    }
}

#[test]
fn test_unconfigured_type_counted_but_never_stored() {
    let p = pipeline(&["EventRecord"]);

    p.bus
        .publish(BusMessage::new("mpcs.evr", MessageType::EventRecord, evr(1)))
        .expect("publish");
    p.bus
        .publish(BusMessage::new(
            "mpcs.eha",
            MessageType::GroupedChannelSamples,
            evr(2),
        ))
        .expect("publish");
    p.ingest.stop();

    let snap = p.metrics.snapshot();
    assert_eq!(snap.bus.received.messages, 2);
    assert_eq!(snap.bus.received.filtered, 1);
    assert_eq!(snap.bus.received.by_type["GroupedChannelSamples"], 1);
    assert_eq!(snap.bus.processed.records, 1);
    assert_eq!(p.sink.len(), 1);
    assert_eq!(p.sink.records()[0].identifier(), "1");
}

#[test]
fn test_bad_message_does_not_stop_the_feed() {
    let p = pipeline(&["*"]);

    p.bus
        .publish(BusMessage::new("mpcs.evr", MessageType::EventRecord, vec![1, 2, 3]))
        .expect("publish");
    for id in 10..20 {
        p.bus
            .publish(BusMessage::new("mpcs.evr", MessageType::EventRecord, evr(id)))
            .expect("publish");
    }
    p.ingest.stop();

    let snap = p.metrics.snapshot();
    assert_eq!(snap.bus.errors.decode, 1);
    assert_eq!(snap.bus.processed.evr, 10);
}

#[test]
fn test_concurrent_publishers_overflowing_small_ring() {
    let p = pipeline(&["EventRecord"]);

    thread::scope(|scope| {
        for t in 0..4u32 {
            let bus = &p.bus;
            scope.spawn(move || {
                for i in 0..250 {
                    bus.publish(BusMessage::new(
                        "mpcs.evr",
                        MessageType::EventRecord,
                        evr(t * 1000 + i),
                    ))
                    .expect("publish");
                }
            });
        }
    });
    p.ingest.stop();

    let stats = p.ingest.stats();
    assert!(stats.ring.backlog <= stats.ring.capacity);
    assert_eq!(stats.ring.consumed, 1000);
    assert_eq!(p.sink.len(), 1000);

    // Per-publisher order survives the shared ring.
    let records = p.sink.records();
    for t in 0..4u32 {
        let ids: Vec<u32> = records
            .iter()
            .filter_map(|r| match r {
                GladRecord::Evr(e) if e.evr_id / 1000 == t => Some(e.evr_id),
                _ => None,
            })
            .collect();
        assert_eq!(ids, (t * 1000..t * 1000 + 250).collect::<Vec<u32>>());
    }
}

#[test]
fn test_broker_disconnect_is_counted_not_fatal() {
    let p = pipeline(&["*"]);
    p.bus
        .report_error("mpcs.eha", BusError::Disconnected("broker restart".into()));
    p.bus
        .publish(BusMessage::new("mpcs.eha", MessageType::EventRecord, evr(5)))
        .expect("publish");
    p.ingest.stop();

    assert_eq!(p.metrics.bus.delivery_errors(), 1);
    assert_eq!(p.sink.len(), 1);
    assert!(!p.ingest.is_running());
}
