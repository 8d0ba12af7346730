// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! GLAD packet framing.
//!
//! # Frame Format
//!
//! ```text
//! +----------------------------------------------------------+
//! | start word (4) = 0x1ACFFC1D | length (4) = body + 4      |
//! | body (length - 4)                                        |
//! +----------------------------------------------------------+
//! ```
//!
//! All integers are big-endian. The length field counts itself.
//!
//! # Body Format
//!
//! ```text
//! +----------------------------------------------------------+
//! | kind (1) = 1 EHA, 2 EVR                                  |
//! | scid (2) | venue (str16) | host (str16) | session (8)    |
//! | dss_id (2) | vcid (1) | sclk_coarse (4) | sclk_fine (4)  |
//! | ert_ms (8) | scet_ms (8) | event_time_ms (8)             |
//! +----------------------------------------------------------+
//! | EHA: channel_id (str16) | dn_type (1) | dn_raw (8)       |
//! |      has_eu (1) [eu (8)] | alarm (1) | realtime (1)      |
//! | EVR: evr_id (4) | name (str16) | level (str16)           |
//! |      message (str32) | realtime (1)                      |
//! +----------------------------------------------------------+
//! ```
//!
//! `str16`/`str32` are a u16/u32 byte length followed by UTF-8.

use super::{BusTranslator, Decoded, DecoderFactory, StreamDecoder};
use crate::bus::BusMessage;
use crate::error::DecodeError;
use crate::record::{
    now_ns, AlarmState, DnType, EhaRecord, EvrRecord, GladRecord, RecordHeader,
};
use byteorder::{BigEndian, ReadBytesExt, WriteBytesExt};
use std::io::{self, Cursor};

/// Packet sync marker.
pub const START_WORD: u32 = 0x1ACF_FC1D;

const START_BYTES: [u8; 4] = START_WORD.to_be_bytes();

/// Start word plus length field.
const PREAMBLE_LEN: usize = 8;

/// Default largest accepted frame (length field value).
pub const DEFAULT_MAX_FRAME: usize = 1024 * 1024;

const KIND_EHA: u8 = 1;
const KIND_EVR: u8 = 2;

/// Encode one record as a complete frame.
pub fn encode_record(record: &GladRecord) -> Vec<u8> {
    let body = encode_body(record);
    let mut out = Vec::with_capacity(PREAMBLE_LEN + body.len());
    out.extend_from_slice(&START_BYTES);
    out.extend_from_slice(&((body.len() + 4) as u32).to_be_bytes());
    out.extend_from_slice(&body);
    out
}

fn encode_body(record: &GladRecord) -> Vec<u8> {
    let mut w = Vec::with_capacity(128);
    // Writes into a Vec cannot fail.
    let _ = write_body(&mut w, record);
    w
}

fn write_body(w: &mut Vec<u8>, record: &GladRecord) -> io::Result<()> {
    let kind = match record {
        GladRecord::Eha(_) => KIND_EHA,
        GladRecord::Evr(_) => KIND_EVR,
    };
    w.write_u8(kind)?;

    let h = record.header();
    w.write_u16::<BigEndian>(h.scid)?;
    write_str16(w, &h.venue)?;
    write_str16(w, &h.host)?;
    w.write_u64::<BigEndian>(h.session)?;
    w.write_u16::<BigEndian>(h.dss_id)?;
    w.write_u8(h.vcid)?;
    w.write_u32::<BigEndian>(h.sclk_coarse)?;
    w.write_u32::<BigEndian>(h.sclk_fine)?;
    w.write_i64::<BigEndian>(h.ert_ms)?;
    w.write_i64::<BigEndian>(h.scet_ms)?;
    w.write_i64::<BigEndian>(h.event_time_ms)?;

    match record {
        GladRecord::Eha(r) => {
            write_str16(w, &r.channel_id)?;
            w.write_u8(r.dn_type.to_byte())?;
            w.write_u64::<BigEndian>(r.dn_raw)?;
            match r.eu {
                Some(eu) => {
                    w.write_u8(1)?;
                    w.write_f64::<BigEndian>(eu)?;
                }
                None => w.write_u8(0)?,
            }
            w.write_u8(r.alarm_state.to_byte())?;
            w.write_u8(r.realtime as u8)?;
        }
        GladRecord::Evr(r) => {
            w.write_u32::<BigEndian>(r.evr_id)?;
            write_str16(w, &r.name)?;
            write_str16(w, &r.level)?;
            let msg = r.message.as_bytes();
            w.write_u32::<BigEndian>(msg.len() as u32)?;
            w.extend_from_slice(msg);
            w.write_u8(r.realtime as u8)?;
        }
    }
    Ok(())
}

/// Writes at most `u16::MAX` bytes, cut on a char boundary.
fn write_str16(w: &mut Vec<u8>, s: &str) -> io::Result<()> {
    let mut len = s.len().min(u16::MAX as usize);
    while !s.is_char_boundary(len) {
        len -= 1;
    }
    w.write_u16::<BigEndian>(len as u16)?;
    w.extend_from_slice(&s.as_bytes()[..len]);
    Ok(())
}

/// Cursor over a frame body mapping short reads to [`DecodeError::Truncated`].
struct BodyReader<'a> {
    cur: Cursor<&'a [u8]>,
}

impl<'a> BodyReader<'a> {
    fn new(body: &'a [u8]) -> Self {
        Self {
            cur: Cursor::new(body),
        }
    }

    fn remaining(&self) -> usize {
        let len = self.cur.get_ref().len();
        len.saturating_sub(self.cur.position() as usize)
    }

    fn short(&self, needed: usize) -> DecodeError {
        DecodeError::Truncated {
            needed,
            available: self.remaining(),
        }
    }

    fn u8(&mut self) -> Result<u8, DecodeError> {
        self.cur.read_u8().map_err(|_| self.short(1))
    }

    fn u16(&mut self) -> Result<u16, DecodeError> {
        self.cur.read_u16::<BigEndian>().map_err(|_| self.short(2))
    }

    fn u32(&mut self) -> Result<u32, DecodeError> {
        self.cur.read_u32::<BigEndian>().map_err(|_| self.short(4))
    }

    fn u64(&mut self) -> Result<u64, DecodeError> {
        self.cur.read_u64::<BigEndian>().map_err(|_| self.short(8))
    }

    fn i64(&mut self) -> Result<i64, DecodeError> {
        self.cur.read_i64::<BigEndian>().map_err(|_| self.short(8))
    }

    fn f64(&mut self) -> Result<f64, DecodeError> {
        self.cur.read_f64::<BigEndian>().map_err(|_| self.short(8))
    }

    fn bool(&mut self) -> Result<bool, DecodeError> {
        Ok(self.u8()? != 0)
    }

    fn bytes(&mut self, len: usize) -> Result<&'a [u8], DecodeError> {
        if self.remaining() < len {
            return Err(self.short(len));
        }
        let start = self.cur.position() as usize;
        let data: &'a [u8] = *self.cur.get_ref();
        self.cur.set_position((start + len) as u64);
        Ok(&data[start..start + len])
    }

    fn string(&mut self, len: usize, field: &'static str) -> Result<String, DecodeError> {
        let raw = self.bytes(len)?;
        std::str::from_utf8(raw)
            .map(str::to_owned)
            .map_err(|_| DecodeError::InvalidUtf8(field))
    }

    fn str16(&mut self, field: &'static str) -> Result<String, DecodeError> {
        let len = self.u16()? as usize;
        self.string(len, field)
    }

    fn str32(&mut self, field: &'static str) -> Result<String, DecodeError> {
        let len = self.u32()? as usize;
        self.string(len, field)
    }
}

/// Decode one frame body (everything after the length field).
fn decode_body(body: &[u8]) -> Result<GladRecord, DecodeError> {
    let mut r = BodyReader::new(body);
    let kind = r.u8()?;
    if kind != KIND_EHA && kind != KIND_EVR {
        return Err(DecodeError::UnknownRecordType(kind));
    }

    let header = RecordHeader {
        scid: r.u16()?,
        venue: r.str16("venue")?,
        host: r.str16("host")?,
        session: r.u64()?,
        dss_id: r.u16()?,
        vcid: r.u8()?,
        sclk_coarse: r.u32()?,
        sclk_fine: r.u32()?,
        ert_ms: r.i64()?,
        scet_ms: r.i64()?,
        event_time_ms: r.i64()?,
        received_ns: now_ns(),
    };

    let record = if kind == KIND_EHA {
        let channel_id = r.str16("channel_id")?;
        let dn_byte = r.u8()?;
        let dn_type = DnType::from_byte(dn_byte)
            .ok_or_else(|| DecodeError::Malformed(format!("dn type {}", dn_byte)))?;
        let dn_raw = r.u64()?;
        let eu = if r.bool()? { Some(r.f64()?) } else { None };
        let alarm_byte = r.u8()?;
        let alarm_state = AlarmState::from_byte(alarm_byte)
            .ok_or_else(|| DecodeError::Malformed(format!("alarm state {}", alarm_byte)))?;
        GladRecord::Eha(EhaRecord {
            header,
            channel_id,
            dn_type,
            dn_raw,
            eu,
            alarm_state,
            realtime: r.bool()?,
        })
    } else {
        GladRecord::Evr(EvrRecord {
            header,
            evr_id: r.u32()?,
            name: r.str16("name")?,
            level: r.str16("level")?,
            message: r.str32("message")?,
            realtime: r.bool()?,
        })
    };

    if r.remaining() != 0 {
        return Err(DecodeError::Malformed(format!(
            "{} trailing bytes",
            r.remaining()
        )));
    }
    Ok(record)
}

/// Reassembles frames across arbitrary chunk boundaries.
///
/// Garbage between frames is skipped by scanning for the next start word;
/// one [`DecodeError::BadStartWord`] is reported per resync.
pub struct GladStreamDecoder {
    buf: Vec<u8>,
    max_frame: usize,
}

impl GladStreamDecoder {
    pub fn new(max_frame: usize) -> Self {
        Self {
            buf: Vec::new(),
            max_frame,
        }
    }

    fn find_start(&self, from: usize) -> Option<usize> {
        self.buf[from..]
            .windows(START_BYTES.len())
            .position(|w| w == START_BYTES)
            .map(|p| from + p)
    }

    /// Offset of the next start word after a bad one at `at`. When none is
    /// found, a partial start word at the tail is kept so a split marker is
    /// not lost.
    fn resync(&self, at: usize, out: &mut Decoded) -> usize {
        let b = &self.buf[at..at + 4];
        out.errors
            .push(DecodeError::BadStartWord(u32::from_be_bytes([b[0], b[1], b[2], b[3]])));

        match self.find_start(at + 1) {
            Some(pos) => pos,
            None => {
                let keep = START_BYTES.len() - 1;
                self.buf.len().saturating_sub(keep).max(at + 1)
            }
        }
    }
}

impl Default for GladStreamDecoder {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_FRAME)
    }
}

impl StreamDecoder for GladStreamDecoder {
    fn feed(&mut self, chunk: &[u8]) -> Decoded {
        self.buf.extend_from_slice(chunk);
        let mut out = Decoded::default();
        // Consumed bytes are compacted once per feed.
        let mut pos = 0;

        loop {
            let avail = &self.buf[pos..];
            if avail.len() < START_BYTES.len() {
                break;
            }
            if avail[..4] != START_BYTES {
                pos = self.resync(pos, &mut out);
                continue;
            }
            if avail.len() < PREAMBLE_LEN {
                break;
            }

            let length = u32::from_be_bytes([avail[4], avail[5], avail[6], avail[7]]) as usize;
            if length < 4 {
                out.errors
                    .push(DecodeError::Malformed(format!("frame length {}", length)));
                pos += START_BYTES.len();
                continue;
            }
            if length > self.max_frame {
                out.errors
                    .push(DecodeError::FrameTooLarge(length, self.max_frame));
                pos += START_BYTES.len();
                continue;
            }

            let total = START_BYTES.len() + length;
            if avail.len() < total {
                break;
            }

            match decode_body(&avail[PREAMBLE_LEN..total]) {
                Ok(record) => out.records.push(record),
                Err(e) => out.errors.push(e),
            }
            pos += total;
        }

        self.buf.drain(..pos);
        out
    }

    fn buffered(&self) -> usize {
        self.buf.len()
    }
}

/// Built-in codec for GLAD frames, usable as stream decoder factory and as
/// bus translator.
#[derive(Debug, Clone)]
pub struct GladFrameCodec {
    max_frame: usize,
}

impl GladFrameCodec {
    pub fn new() -> Self {
        Self {
            max_frame: DEFAULT_MAX_FRAME,
        }
    }

    pub fn with_max_frame(max_frame: usize) -> Self {
        Self { max_frame }
    }
}

impl Default for GladFrameCodec {
    fn default() -> Self {
        Self::new()
    }
}

impl DecoderFactory for GladFrameCodec {
    fn stream_decoder(&self) -> Box<dyn StreamDecoder> {
        Box::new(GladStreamDecoder::new(self.max_frame))
    }
}

impl BusTranslator for GladFrameCodec {
    /// A bus payload holds one or more complete frames. Any error rejects
    /// the whole message.
    fn translate(&self, message: &BusMessage) -> Result<Vec<GladRecord>, DecodeError> {
        let mut decoder = GladStreamDecoder::new(self.max_frame);
        let decoded = decoder.feed(&message.payload);
        if let Some(err) = decoded.errors.into_iter().next() {
            return Err(err);
        }
        if decoder.buffered() > 0 {
            return Err(DecodeError::Truncated {
                needed: PREAMBLE_LEN,
                available: decoder.buffered(),
            });
        }

        let mut records = decoded.records;
        for record in &mut records {
            let header = record.header_mut();
            if let Some(scid) = message.scid {
                header.scid = scid;
            }
            if let Some(venue) = &message.venue {
                header.venue.clone_from(venue);
            }
        }
        Ok(records)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bus::MessageType;

    fn eha(channel: &str, dn: u64) -> GladRecord {
        GladRecord::Eha(EhaRecord {
            header: RecordHeader {
                scid: 42,
                venue: "TESTBED".into(),
                host: "gds-01".into(),
                session: 7,
                dss_id: 14,
                vcid: 3,
                sclk_coarse: 1000,
                sclk_fine: 12,
                ert_ms: 1_700_000_000_000,
                scet_ms: 1_699_999_999_000,
                event_time_ms: 1_700_000_000_000,
                received_ns: 0,
            },
            channel_id: channel.into(),
            dn_type: DnType::Float,
            dn_raw: dn,
            eu: Some(dn as f64 * 0.5),
            alarm_state: AlarmState::None,
            realtime: true,
        })
    }

    fn evr(id: u32) -> GladRecord {
        GladRecord::Evr(EvrRecord {
            header: RecordHeader {
                scid: 42,
                venue: "FLIGHT".into(),
                ..Default::default()
            },
            evr_id: id,
            name: "CMD_DISPATCH".into(),
            level: "COMMAND".into(),
            message: "dispatched opcode 0x12".into(),
            realtime: false,
        })
    }

    fn stripped(records: &[GladRecord]) -> Vec<GladRecord> {
        records.iter().map(|r| r.without_receive_time()).collect()
    }

    #[test]
    fn test_frame_preamble() {
        let frame = encode_record(&evr(1));
        assert_eq!(&frame[..4], &[0x1A, 0xCF, 0xFC, 0x1D]);
        let length = u32::from_be_bytes([frame[4], frame[5], frame[6], frame[7]]) as usize;
        assert_eq!(length, frame.len() - 4);
    }

    #[test]
    fn test_decode_byte_at_a_time() {
        let input = vec![eha("A-0001", 10), evr(77), eha("B-0002", 11)];
        let stream: Vec<u8> = input.iter().flat_map(encode_record).collect();

        let mut decoder = GladStreamDecoder::default();
        let mut out = Vec::new();
        for b in &stream {
            let d = decoder.feed(std::slice::from_ref(b));
            assert!(d.errors.is_empty());
            out.extend(d.records);
        }
        assert_eq!(stripped(&out), input);
        assert_eq!(decoder.buffered(), 0);
    }

    #[test]
    fn test_resync_after_garbage() {
        let mut stream = vec![0xDE, 0xAD, 0xBE, 0xEF, 0x1A, 0xCF];
        stream.extend(encode_record(&eha("A-0001", 1)));
        stream.extend([0x00, 0x01, 0x02]);
        stream.extend(encode_record(&evr(5)));

        let mut decoder = GladStreamDecoder::default();
        let decoded = decoder.feed(&stream);
        assert_eq!(
            stripped(&decoded.records),
            vec![eha("A-0001", 1), evr(5)]
        );
        assert_eq!(decoded.errors.len(), 2);
        assert!(matches!(decoded.errors[0], DecodeError::BadStartWord(0xDEAD_BEEF)));
    }

    #[test]
    fn test_frame_too_large_skipped() {
        let mut stream = Vec::new();
        stream.extend_from_slice(&START_BYTES);
        stream.extend_from_slice(&(10_000u32).to_be_bytes());
        stream.extend(encode_record(&evr(9)));

        let mut decoder = GladStreamDecoder::new(512);
        let decoded = decoder.feed(&stream);
        assert!(matches!(decoded.errors[0], DecodeError::FrameTooLarge(10_000, 512)));
        assert_eq!(stripped(&decoded.records), vec![evr(9)]);
    }

    #[test]
    fn test_bad_body_does_not_stop_stream() {
        let mut bad = encode_record(&evr(1));
        bad[PREAMBLE_LEN] = 9; // unknown kind
        let mut stream = bad;
        stream.extend(encode_record(&evr(2)));

        let decoded = GladStreamDecoder::default().feed(&stream);
        assert_eq!(decoded.errors, vec![DecodeError::UnknownRecordType(9)]);
        assert_eq!(stripped(&decoded.records), vec![evr(2)]);
    }

    #[test]
    fn test_large_chunk_of_small_frames() {
        let frame = encode_record(&evr(3));
        let count = (4 * 1024 * 1024) / frame.len() + 1;
        let mut stream = Vec::with_capacity(count * frame.len() + 5);
        for _ in 0..count {
            stream.extend_from_slice(&frame);
        }
        stream.extend_from_slice(&frame[..5]);

        let mut decoder = GladStreamDecoder::default();
        let start = std::time::Instant::now();
        let decoded = decoder.feed(&stream);
        let elapsed = start.elapsed();

        assert!(decoded.errors.is_empty());
        assert_eq!(decoded.records.len(), count);
        assert_eq!(decoder.buffered(), 5);
        assert!(
            elapsed < std::time::Duration::from_secs(15),
            "decoding {} bytes took {:?}",
            stream.len(),
            elapsed
        );

        let tail = decoder.feed(&frame[5..]);
        assert_eq!(stripped(&tail.records), vec![evr(3)]);
        assert_eq!(decoder.buffered(), 0);
    }

    #[test]
    fn test_long_name_cut_on_char_boundary() {
        let mut name = "a".repeat(u16::MAX as usize - 1);
        name.push('é');
        let record = GladRecord::Evr(EvrRecord {
            header: RecordHeader::default(),
            evr_id: 1,
            name,
            level: "WARNING_HI".into(),
            message: String::new(),
            realtime: true,
        });

        let decoded = GladStreamDecoder::default().feed(&encode_record(&record));
        assert!(decoded.errors.is_empty());
        match &decoded.records[..] {
            [GladRecord::Evr(e)] => {
                assert_eq!(e.name.len(), u16::MAX as usize - 1);
                assert!(e.name.bytes().all(|b| b == b'a'));
            }
            other => panic!("unexpected records: {:?}", other),
        }
    }

    #[test]
    fn test_translate_applies_message_context() {
        let codec = GladFrameCodec::new();
        let mut payload = encode_record(&eha("A-0001", 3));
        payload.extend(encode_record(&eha("A-0002", 4)));
        let msg = BusMessage::new("telemetry.eha", MessageType::GroupedChannelSamples, payload)
            .with_scid(99)
            .with_venue("OPS");

        let records = codec.translate(&msg).expect("translate");
        assert_eq!(records.len(), 2);
        assert!(records.iter().all(|r| r.header().scid == 99));
        assert!(records.iter().all(|r| r.header().venue == "OPS"));
    }

    #[test]
    fn test_translate_rejects_partial_payload() {
        let codec = GladFrameCodec::new();
        let mut payload = encode_record(&evr(1));
        payload.truncate(payload.len() - 2);
        let msg = BusMessage::new("telemetry.evr", MessageType::EventRecord, payload);
        assert!(matches!(
            codec.translate(&msg),
            Err(DecodeError::Truncated { .. })
        ));
    }
}
