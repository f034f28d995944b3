use chrono::{SecondsFormat, Utc};

pub const MINUTE_MS: i64 = 60_000;

/// Epoch milliseconds, UTC.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct TimestampMs(pub i64);

impl TimestampMs {
    pub fn minutes(minutes: i64) -> Self {
        Self(minutes * MINUTE_MS)
    }

    pub fn millis_since(self, earlier: TimestampMs) -> i64 {
        (self.0 - earlier.0).max(0)
    }
}

pub trait Clock: Send + Sync {
    fn now(&self) -> TimestampMs;
}

/// Half-open interval `[start, end)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TimeRange {
    pub start: TimestampMs,
    pub end: TimestampMs,
}

impl TimeRange {
    pub fn new(start: TimestampMs, end: TimestampMs) -> Self {
        Self { start, end }
    }

    pub fn duration_ms(&self) -> i64 {
        self.end.millis_since(self.start)
    }

    pub fn overlap_ms(&self, other: &TimeRange) -> i64 {
        let start = self.start.max(other.start);
        let end = self.end.min(other.end);
        end.millis_since(start)
    }
}

pub fn timestamp_to_iso8601(timestamp: TimestampMs) -> String {
    let datetime = chrono::DateTime::<Utc>::from_timestamp_millis(timestamp.0)
        .unwrap_or_else(|| chrono::DateTime::<Utc>::from(std::time::UNIX_EPOCH));
    datetime.to_rfc3339_opts(SecondsFormat::Millis, true)
}
