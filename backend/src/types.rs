// 后端类型定义
// Data model flowing through one polling cycle

use chrono::{DateTime, FixedOffset, NaiveDateTime, TimeZone, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

/// Decoded register content before any validation.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub enum RawValue {
    Bool(bool),
    Unsigned(u16),
    Signed(i16),
    Float(f32),
}

impl RawValue {
    /// Numeric view used by the normalizer; booleans map to 0/1.
    pub fn as_f64(&self) -> f64 {
        match *self {
            RawValue::Bool(b) => f64::from(u8::from(b)),
            RawValue::Unsigned(v) => f64::from(v),
            RawValue::Signed(v) => f64::from(v),
            RawValue::Float(v) => f64::from(v),
        }
    }
}

/// Tagged outcome of one read attempt.
#[derive(Debug, Clone, PartialEq)]
pub enum Reading {
    Value(RawValue),
    Failed(String),
}

impl Reading {
    pub fn value(&self) -> Option<f64> {
        match self {
            Reading::Value(raw) => Some(raw.as_f64()),
            Reading::Failed(_) => None,
        }
    }

    pub fn is_failed(&self) -> bool {
        matches!(self, Reading::Failed(_))
    }
}

/// One read attempt for one metric. Produced once per tick, never retried.
#[derive(Debug, Clone, PartialEq)]
pub struct ReadingResult {
    pub metric: String,
    pub reading: Reading,
    pub attempted_at: DateTime<Utc>,
}

/// Storage-ready field value.
///
/// `Absent` is the explicit "sensor gave no data" marker used by the
/// preserve-absence policy; it is distinct from a reading of zero.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub enum FieldValue {
    Number(f64),
    Absent,
}

impl FieldValue {
    pub fn as_number(&self) -> Option<f64> {
        match *self {
            FieldValue::Number(v) => Some(v),
            FieldValue::Absent => None,
        }
    }
}

impl fmt::Display for FieldValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FieldValue::Number(v) => write!(f, "{}", v),
            FieldValue::Absent => Ok(()),
        }
    }
}

/// Polling granularity: the width of one time bucket.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Granularity {
    Second,
    HalfMinute,
    #[default]
    Minute,
}

impl Granularity {
    pub fn seconds(self) -> i64 {
        match self {
            Granularity::Second => 1,
            Granularity::HalfMinute => 30,
            Granularity::Minute => 60,
        }
    }

    /// Truncate an instant to the start of its bucket.
    pub fn bucket(self, at: DateTime<Utc>) -> TimeBucket {
        let width = self.seconds();
        let secs = at.timestamp().div_euclid(width) * width;
        let start = DateTime::<Utc>::from_timestamp(secs, 0).unwrap_or(at);
        TimeBucket(start)
    }
}

const ROW_TIME_FORMAT: &str = "%Y-%m-%d %H:%M:%S";

/// Truncated timestamp used as the natural key of one cycle's row.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct TimeBucket(DateTime<Utc>);

impl TimeBucket {
    pub fn start(&self) -> DateTime<Utc> {
        self.0
    }

    /// Render as `YYYY-MM-DD HH:MM:SS` in the given offset, the format rows are keyed by.
    pub fn format_in(&self, offset: FixedOffset) -> String {
        self.0
            .with_timezone(&offset)
            .format(ROW_TIME_FORMAT)
            .to_string()
    }

    /// Inverse of [`TimeBucket::format_in`]; `None` if `text` is not a row timestamp.
    pub fn parse_in(text: &str, offset: FixedOffset) -> Option<Self> {
        let naive = NaiveDateTime::parse_from_str(text.trim(), ROW_TIME_FORMAT).ok()?;
        let local = offset.from_local_datetime(&naive).single()?;
        Some(TimeBucket(local.with_timezone(&Utc)))
    }
}

impl fmt::Display for TimeBucket {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0.format("%Y-%m-%dT%H:%M:%SZ"))
    }
}

/// Fully validated row for one bucket; handed to the sink and then dropped.
#[derive(Debug, Clone, PartialEq)]
pub struct ValidatedRow {
    pub bucket: TimeBucket,
    pub fields: BTreeMap<String, FieldValue>,
}

impl ValidatedRow {
    pub fn new(bucket: TimeBucket) -> Self {
        Self {
            bucket,
            fields: BTreeMap::new(),
        }
    }

    pub fn get(&self, field: &str) -> Option<FieldValue> {
        self.fields.get(field).copied()
    }
}
