// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Store-ready telemetry records.
//!
//! Decoders produce [`GladRecord`]s; sinks consume them. Field-level meaning
//! (channel definitions, EVR dictionaries) lives outside this crate.

use serde::{Deserialize, Serialize};
use std::time::{SystemTime, UNIX_EPOCH};

/// Fields common to channel samples and event records.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RecordHeader {
    /// Spacecraft identifier.
    pub scid: u16,
    /// Venue / context tag (e.g. "FLIGHT", "TESTBED").
    pub venue: String,
    pub host: String,
    pub session: u64,
    pub dss_id: u16,
    pub vcid: u8,
    pub sclk_coarse: u32,
    pub sclk_fine: u32,
    /// Earth receive time, ms since epoch.
    pub ert_ms: i64,
    /// Spacecraft event time, ms since epoch.
    pub scet_ms: i64,
    /// Time used for latest-value ordering, ms since epoch.
    pub event_time_ms: i64,
    /// Stamped when the record was decoded (ns since epoch).
    #[serde(default)]
    pub received_ns: u64,
}

/// One channel sample (EHA).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EhaRecord {
    pub header: RecordHeader,
    pub channel_id: String,
    pub dn_type: DnType,
    /// Raw data number, widened to 64 bits.
    pub dn_raw: u64,
    /// Engineering units value, when the channel has a conversion.
    pub eu: Option<f64>,
    pub alarm_state: AlarmState,
    pub realtime: bool,
}

/// One event record (EVR).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EvrRecord {
    pub header: RecordHeader,
    pub evr_id: u32,
    pub name: String,
    pub level: String,
    pub message: String,
    pub realtime: bool,
}

/// Channel data number representation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum DnType {
    SignedInt,
    UnsignedInt,
    Float,
    Boolean,
    Status,
    Time,
}

impl DnType {
    pub fn to_byte(self) -> u8 {
        match self {
            Self::SignedInt => 0,
            Self::UnsignedInt => 1,
            Self::Float => 2,
            Self::Boolean => 3,
            Self::Status => 4,
            Self::Time => 5,
        }
    }

    pub fn from_byte(b: u8) -> Option<Self> {
        match b {
            0 => Some(Self::SignedInt),
            1 => Some(Self::UnsignedInt),
            2 => Some(Self::Float),
            3 => Some(Self::Boolean),
            4 => Some(Self::Status),
            5 => Some(Self::Time),
            _ => None,
        }
    }
}

/// Worst alarm level raised by a channel sample.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum AlarmState {
    #[default]
    None,
    Yellow,
    Red,
}

impl AlarmState {
    pub fn to_byte(self) -> u8 {
        match self {
            Self::None => 0,
            Self::Yellow => 1,
            Self::Red => 2,
        }
    }

    pub fn from_byte(b: u8) -> Option<Self> {
        match b {
            0 => Some(Self::None),
            1 => Some(Self::Yellow),
            2 => Some(Self::Red),
            _ => None,
        }
    }
}

/// Record category, used for per-category counters.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RecordKind {
    Eha,
    Evr,
}

/// A decoded record, ready for the store.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum GladRecord {
    Eha(EhaRecord),
    Evr(EvrRecord),
}

impl GladRecord {
    pub fn kind(&self) -> RecordKind {
        match self {
            Self::Eha(_) => RecordKind::Eha,
            Self::Evr(_) => RecordKind::Evr,
        }
    }

    pub fn header(&self) -> &RecordHeader {
        match self {
            Self::Eha(r) => &r.header,
            Self::Evr(r) => &r.header,
        }
    }

    pub fn header_mut(&mut self) -> &mut RecordHeader {
        match self {
            Self::Eha(r) => &mut r.header,
            Self::Evr(r) => &mut r.header,
        }
    }

    /// Store key: channel id for EHA, EVR id for EVR.
    pub fn identifier(&self) -> String {
        match self {
            Self::Eha(r) => r.channel_id.clone(),
            Self::Evr(r) => r.evr_id.to_string(),
        }
    }

    /// Copy with the decode-time stamp zeroed, for comparing decoder outputs.
    pub fn without_receive_time(&self) -> Self {
        let mut copy = self.clone();
        copy.header_mut().received_ns = 0;
        copy
    }
}

/// Wall-clock nanoseconds since the Unix epoch (0 if the clock is before it).
pub fn now_ns() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_nanos() as u64)
        .unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_eha() -> GladRecord {
        GladRecord::Eha(EhaRecord {
            header: RecordHeader {
                scid: 76,
                venue: "TESTBED".into(),
                received_ns: 99,
                ..Default::default()
            },
            channel_id: "A-0001".into(),
            dn_type: DnType::UnsignedInt,
            dn_raw: 7,
            eu: Some(3.5),
            alarm_state: AlarmState::Yellow,
            realtime: true,
        })
    }

    #[test]
    fn test_kind_and_identifier() {
        let rec = sample_eha();
        assert_eq!(rec.kind(), RecordKind::Eha);
        assert_eq!(rec.identifier(), "A-0001");
        assert_eq!(rec.header().scid, 76);
    }

    #[test]
    fn test_without_receive_time() {
        let rec = sample_eha();
        assert_eq!(rec.without_receive_time().header().received_ns, 0);
        assert_eq!(rec.header().received_ns, 99);
    }

    #[test]
    fn test_json_tagged() {
        let json = serde_json::to_value(sample_eha()).expect("serialize");
        assert_eq!(json["type"], "eha");
        assert_eq!(json["alarm_state"], "YELLOW");
        assert_eq!(json["dn_type"], "UNSIGNED_INT");
    }

    #[test]
    fn test_byte_codes() {
        for b in 0..6 {
            let dn = DnType::from_byte(b).expect("valid dn type");
            assert_eq!(dn.to_byte(), b);
        }
        assert!(DnType::from_byte(6).is_none());
        assert_eq!(AlarmState::from_byte(2), Some(AlarmState::Red));
        assert!(AlarmState::from_byte(3).is_none());
    }
}
