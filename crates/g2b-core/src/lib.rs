//! Core domain model for the G2B bid-notice collector: notices, the
//! ingestion watermark, and the pure window/watermark arithmetic.

use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;

use chrono::{Duration, NaiveDate, NaiveDateTime, Timelike};
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use serde_json::{Map as JsonMap, Value as JsonValue};
use thiserror::Error;

pub const CRATE_NAME: &str = "g2b-core";

/// Compact timestamp encoding accepted by the notice API (`YYYYMMDDHHmm`).
pub const API_TIMESTAMP_FORMAT: &str = "%Y%m%d%H%M";

const DATETIME_FORMATS: &[&str] = &[
    "%Y%m%d%H%M%S",
    API_TIMESTAMP_FORMAT,
    "%Y-%m-%d %H:%M:%S",
    "%Y-%m-%d %H:%M",
    "%Y/%m/%d %H:%M:%S",
    "%Y/%m/%d %H:%M",
];

const DATE_FORMATS: &[&str] = &["%Y-%m-%d", "%Y/%m/%d", "%Y%m%d"];

pub fn format_api_timestamp(ts: NaiveDateTime) -> String {
    ts.format(API_TIMESTAMP_FORMAT).to_string()
}

/// Lenient parser for the timestamp shapes the portal emits. Blank input is `None`.
pub fn parse_notice_timestamp(input: &str) -> Option<NaiveDateTime> {
    let s = input.trim();
    if s.is_empty() {
        return None;
    }
    DATETIME_FORMATS
        .iter()
        .find_map(|f| NaiveDateTime::parse_from_str(s, f).ok())
        .or_else(|| {
            DATE_FORMATS
                .iter()
                .find_map(|f| NaiveDate::parse_from_str(s, f).ok())
                .and_then(|d| d.and_hms_opt(0, 0, 0))
        })
}

pub fn truncate_to_minute(ts: NaiveDateTime) -> NaiveDateTime {
    ts.with_second(0)
        .and_then(|t| t.with_nanosecond(0))
        .unwrap_or(ts)
}

/// One procurement announcement, projected from the upstream JSON item.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Notice {
    pub notice_no: String,
    pub title: String,
    pub institution: Option<String>,
    pub business_division: Option<String>,
    pub posted_at: Option<NaiveDateTime>,
    pub bid_open_at: Option<NaiveDateTime>,
    pub bid_close_at: Option<NaiveDateTime>,
    pub detail_url: Option<String>,
    /// Full upstream item, kept verbatim for fields not projected above.
    pub raw: JsonValue,
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum NoticeError {
    #[error("item is not a JSON object")]
    NotAnObject,
    #[error("item has no `bidNtceNo` identifier")]
    MissingIdentifier,
}

impl Notice {
    pub fn from_raw(raw: JsonValue) -> Result<Self, NoticeError> {
        let obj = raw.as_object().ok_or(NoticeError::NotAnObject)?;
        let notice_no = text_field(obj, &["bidNtceNo"]).ok_or(NoticeError::MissingIdentifier)?;

        Ok(Self {
            title: text_field(obj, &["bidNtceNm"]).unwrap_or_default(),
            institution: text_field(obj, &["dminsttNm", "ntceInsttNm"]),
            business_division: text_field(obj, &["bsnsDivNm"]),
            posted_at: timestamp_field(obj, "bidNtceDt"),
            bid_open_at: timestamp_field(obj, "bidNtceBgnDt"),
            bid_close_at: timestamp_field(obj, "bidNtceEndDt"),
            detail_url: text_field(obj, &["bidNtceUrl", "bidNtceDtlUrl"]),
            notice_no,
            raw,
        })
    }
}

fn text_field(obj: &JsonMap<String, JsonValue>, keys: &[&str]) -> Option<String> {
    keys.iter().find_map(|key| match obj.get(*key)? {
        JsonValue::String(s) if !s.trim().is_empty() => Some(s.trim().to_string()),
        JsonValue::Number(n) => Some(n.to_string()),
        _ => None,
    })
}

fn timestamp_field(obj: &JsonMap<String, JsonValue>, key: &str) -> Option<NaiveDateTime> {
    text_field(obj, &[key]).and_then(|s| parse_notice_timestamp(&s))
}

/// Keep only the last occurrence of each identifier, preserving API order otherwise.
pub fn collapse_duplicates(notices: &[Notice]) -> Vec<&Notice> {
    let mut last_index = HashMap::with_capacity(notices.len());
    for (idx, notice) in notices.iter().enumerate() {
        last_index.insert(notice.notice_no.as_str(), idx);
    }
    notices
        .iter()
        .enumerate()
        .filter(|(idx, n)| last_index.get(n.notice_no.as_str()) == Some(idx))
        .map(|(_, n)| n)
        .collect()
}

/// The "last collected" watermark carried between runs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Checkpoint {
    #[serde(
        rename = "last_collected_time",
        serialize_with = "serialize_compact",
        deserialize_with = "deserialize_compact"
    )]
    pub last_collected: NaiveDateTime,
}

impl Checkpoint {
    pub fn at(ts: NaiveDateTime) -> Self {
        Self {
            last_collected: truncate_to_minute(ts),
        }
    }
}

impl fmt::Display for Checkpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&format_api_timestamp(self.last_collected))
    }
}

fn serialize_compact<S: Serializer>(ts: &NaiveDateTime, s: S) -> Result<S::Ok, S::Error> {
    s.serialize_str(&format_api_timestamp(*ts))
}

fn deserialize_compact<'de, D: Deserializer<'de>>(d: D) -> Result<NaiveDateTime, D::Error> {
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Raw {
        Text(String),
        Number(u64),
    }

    let text = match Raw::deserialize(d)? {
        Raw::Text(s) => s,
        Raw::Number(n) => n.to_string(),
    };
    parse_notice_timestamp(&text)
        .ok_or_else(|| serde::de::Error::custom(format!("unrecognised timestamp `{text}`")))
}

/// What the checkpoint store reported at the start of a run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WatermarkState {
    Absent,
    Present(Checkpoint),
    Unreadable,
}

impl WatermarkState {
    pub fn checkpoint(&self) -> Option<&Checkpoint> {
        match self {
            Self::Present(cp) => Some(cp),
            Self::Absent | Self::Unreadable => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum WindowSeed {
    Checkpoint,
    DefaultLookback,
    CheckpointUnreadable,
    ClampedFuture,
}

/// Closed `[start, end]` query range at minute resolution.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct FetchWindow {
    pub start: NaiveDateTime,
    pub end: NaiveDateTime,
    pub seed: WindowSeed,
}

impl FetchWindow {
    pub fn begin_param(&self) -> String {
        format_api_timestamp(self.start)
    }

    pub fn end_param(&self) -> String {
        format_api_timestamp(self.end)
    }
}

impl fmt::Display for FetchWindow {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}, {}]", self.begin_param(), self.end_param())
    }
}

#[derive(Debug, Clone, Copy)]
pub struct WindowPolicy {
    pub default_lookback: Duration,
    pub overlap: Duration,
}

impl Default for WindowPolicy {
    fn default() -> Self {
        Self {
            default_lookback: Duration::minutes(5),
            overlap: Duration::zero(),
        }
    }
}

pub fn compute_window(state: &WatermarkState, now: NaiveDateTime, policy: &WindowPolicy) -> FetchWindow {
    let end = truncate_to_minute(now);
    // Out-of-range arithmetic degrades to an empty lookback.
    let fallback = end.checked_sub_signed(policy.default_lookback).unwrap_or(end);

    let (start, seed) = match state {
        WatermarkState::Absent => (fallback, WindowSeed::DefaultLookback),
        WatermarkState::Unreadable => (fallback, WindowSeed::CheckpointUnreadable),
        WatermarkState::Present(cp) => {
            let start = truncate_to_minute(
                cp.last_collected
                    .checked_sub_signed(policy.overlap)
                    .unwrap_or(cp.last_collected),
            );
            if start > end {
                (fallback, WindowSeed::ClampedFuture)
            } else {
                (start, WindowSeed::Checkpoint)
            }
        }
    };

    FetchWindow { start, end, seed }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum WatermarkStrategy {
    /// Bid-open time of the last item in API response order.
    #[default]
    LastInResponse,
    /// Greatest bid-open time across the run.
    MaxBidOpen,
}

impl FromStr for WatermarkStrategy {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "last" | "last_in_response" => Ok(Self::LastInResponse),
            "max" | "max_bid_open" => Ok(Self::MaxBidOpen),
            other => Err(format!("unknown watermark strategy `{other}` (expected `last` or `max`)")),
        }
    }
}

/// Returns the checkpoint to persist, or `None` when the watermark should stay put.
/// The result never moves behind `current`.
pub fn next_watermark(
    current: Option<&Checkpoint>,
    notices: &[Notice],
    strategy: WatermarkStrategy,
) -> Option<Checkpoint> {
    let candidate = match strategy {
        WatermarkStrategy::LastInResponse => notices.iter().rev().find_map(|n| n.bid_open_at),
        WatermarkStrategy::MaxBidOpen => notices.iter().filter_map(|n| n.bid_open_at).max(),
    }
    .map(Checkpoint::at)?;

    match current {
        Some(cur) if *cur >= candidate => None,
        _ => Some(candidate),
    }
}
