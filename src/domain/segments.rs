//! Mode-tagged billing segments and their cost.
//!
//! A ledger is an append-only list of segments, each carrying the hourly rate
//! in force when it was opened. At most one segment is open and it is always
//! the last one. Pauses do not split segments; they are subtracted from each
//! segment's duration when the cost is computed.

use crate::domain::error::BillingError;
use crate::domain::money::{Piasters, cost_for_minutes};
use crate::domain::rates::BillingMode;
use crate::domain::time::{MINUTE_MS, TimeRange, TimestampMs};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Segment {
    pub mode: BillingMode,
    pub rate_per_hour: Piasters,
    pub started_at: TimestampMs,
    pub ended_at: Option<TimestampMs>,
}

impl Segment {
    pub fn is_open(&self) -> bool {
        self.ended_at.is_none()
    }

    fn range(&self, now: TimestampMs) -> TimeRange {
        let end = self.ended_at.unwrap_or(now).max(self.started_at);
        TimeRange::new(self.started_at, end)
    }

    /// Milliseconds of the segment not covered by any pause.
    pub fn billable_ms(&self, now: TimestampMs, paused_ranges: &[TimeRange]) -> i64 {
        let range = self.range(now);
        let paused: i64 = paused_ranges
            .iter()
            .map(|pause| range.overlap_ms(pause))
            .sum();
        (range.duration_ms() - paused).max(0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BreakdownRow {
    pub mode: BillingMode,
    pub rate_per_hour: Piasters,
    pub minutes: i64,
    pub cost: Piasters,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CostBreakdown {
    pub rows: Vec<BreakdownRow>,
    pub total: Piasters,
    pub billable_ms: i64,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SegmentLedger {
    segments: Vec<Segment>,
}

impl SegmentLedger {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_segments(segments: Vec<Segment>) -> Self {
        Self { segments }
    }

    pub fn segments(&self) -> &[Segment] {
        &self.segments
    }

    pub fn open_segment(&self) -> Option<&Segment> {
        self.segments.last().filter(|segment| segment.is_open())
    }

    pub fn open(
        &mut self,
        mode: BillingMode,
        rate_per_hour: Piasters,
        at: TimestampMs,
    ) -> Result<(), BillingError> {
        if self.open_segment().is_some() {
            return Err(BillingError::SegmentAlreadyOpen);
        }

        self.segments.push(Segment {
            mode,
            rate_per_hour,
            started_at: at,
            ended_at: None,
        });
        Ok(())
    }

    pub fn close(&mut self, at: TimestampMs) -> Result<(), BillingError> {
        let segment = self
            .segments
            .last_mut()
            .filter(|segment| segment.is_open())
            .ok_or(BillingError::NoOpenSegment)?;
        segment.ended_at = Some(at.max(segment.started_at));
        Ok(())
    }

    /// Closes the open segment and opens the next one at the same instant.
    pub fn switch_mode(
        &mut self,
        mode: BillingMode,
        rate_per_hour: Piasters,
        at: TimestampMs,
    ) -> Result<(), BillingError> {
        let open_started_at = self
            .open_segment()
            .map(|segment| segment.started_at)
            .ok_or(BillingError::NoOpenSegment)?;
        let at = at.max(open_started_at);

        self.close(at)?;
        self.open(mode, rate_per_hour, at)
    }

    /// Moves the first segment's start. Later segments keep their boundaries.
    pub fn retime_start(&mut self, at: TimestampMs) -> Result<(), BillingError> {
        let first = self
            .segments
            .first_mut()
            .ok_or(BillingError::NoOpenSegment)?;
        if let Some(ended_at) = first.ended_at
            && at > ended_at
        {
            return Err(BillingError::InvalidStartTime);
        }

        first.started_at = at;
        Ok(())
    }

    pub fn cost_breakdown(&self, now: TimestampMs, paused_ranges: &[TimeRange]) -> CostBreakdown {
        let mut rows: Vec<BreakdownRow> = Vec::new();
        let mut total = Piasters::ZERO;
        let mut billable_ms = 0;

        for segment in &self.segments {
            let segment_ms = segment.billable_ms(now, paused_ranges);
            let minutes = ceil_minutes(segment_ms);
            let cost = cost_for_minutes(minutes, segment.rate_per_hour);
            total += cost;
            billable_ms += segment_ms;

            match rows.iter_mut().find(|row| {
                row.mode == segment.mode && row.rate_per_hour == segment.rate_per_hour
            }) {
                Some(row) => {
                    row.minutes += minutes;
                    row.cost += cost;
                }
                None => rows.push(BreakdownRow {
                    mode: segment.mode,
                    rate_per_hour: segment.rate_per_hour,
                    minutes,
                    cost,
                }),
            }
        }

        CostBreakdown {
            rows,
            total,
            billable_ms,
        }
    }
}

fn ceil_minutes(ms: i64) -> i64 {
    (ms + MINUTE_MS - 1) / MINUTE_MS
}
