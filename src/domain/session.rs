//! Lifecycle of one station rental.
//!
//! A session is `Running`, `Paused` or `Ended`. Cost is never stored as a
//! running total: it is recomputed from the segment ledger and the pause
//! ranges for whatever `now` the caller supplies.

use crate::domain::charges::{Charge, ChargeLedger};
use crate::domain::error::BillingError;
use crate::domain::events::BillingEvent;
use crate::domain::models::{ChargeId, SessionId, Station, StationId, TransferId};
use crate::domain::money::Piasters;
use crate::domain::rates::{BillingMode, rate_for};
use crate::domain::reconciliation::{Closing, ClosingPolicy, TrueTotal, final_amount};
use crate::domain::segments::{CostBreakdown, SegmentLedger};
use crate::domain::time::{MINUTE_MS, TimeRange, TimestampMs};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Running,
    Paused { since: TimestampMs },
    Ended(Closing),
}

impl SessionState {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Running => "running",
            Self::Paused { .. } => "paused",
            Self::Ended(_) => "ended",
        }
    }
}

/// Everything needed to rebuild a session from storage.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionParts {
    pub id: SessionId,
    pub station_id: StationId,
    pub created_at: TimestampMs,
    pub started_at: TimestampMs,
    pub timer_minutes: Option<u32>,
    pub timer_notified: bool,
    pub cost_limit: Option<Piasters>,
    pub state: SessionState,
    pub pauses: Vec<TimeRange>,
    pub segments: SegmentLedger,
    pub charges: ChargeLedger,
    pub version: u64,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Session {
    id: SessionId,
    station_id: StationId,
    created_at: TimestampMs,
    started_at: TimestampMs,
    timer_minutes: Option<u32>,
    timer_notified: bool,
    cost_limit: Option<Piasters>,
    state: SessionState,
    pauses: Vec<TimeRange>,
    segments: SegmentLedger,
    charges: ChargeLedger,
    version: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TimerStatus {
    pub limit_minutes: u32,
    pub remaining_ms: i64,
    pub expired: bool,
}

/// Display snapshot computed at one instant.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionView {
    pub now: TimestampMs,
    pub elapsed_ms: i64,
    pub billable_ms: i64,
    pub paused_ms: i64,
    pub breakdown: CostBreakdown,
    pub charges: Piasters,
    pub transferred_in: Piasters,
    pub timer: Option<TimerStatus>,
    pub cost_limit_reached: bool,
}

impl SessionView {
    /// Live liability without orders.
    pub fn running_total(&self) -> Piasters {
        self.breakdown.total + self.charges + self.transferred_in
    }
}

impl Session {
    pub fn start(
        id: SessionId,
        station: &Station,
        mode: BillingMode,
        started_at: Option<TimestampMs>,
        now: TimestampMs,
    ) -> Result<Self, BillingError> {
        let started_at = started_at.unwrap_or(now);
        if started_at > now {
            return Err(BillingError::InvalidStartTime);
        }

        let rate = rate_for(station, mode)?;
        let mut segments = SegmentLedger::new();
        segments.open(mode, rate, started_at)?;

        Ok(Self {
            id,
            station_id: station.id,
            created_at: now,
            started_at,
            timer_minutes: None,
            timer_notified: false,
            cost_limit: None,
            state: SessionState::Running,
            pauses: Vec::new(),
            segments,
            charges: ChargeLedger::default(),
            version: 0,
        })
    }

    pub fn from_parts(parts: SessionParts) -> Self {
        Self {
            id: parts.id,
            station_id: parts.station_id,
            created_at: parts.created_at,
            started_at: parts.started_at,
            timer_minutes: parts.timer_minutes,
            timer_notified: parts.timer_notified,
            cost_limit: parts.cost_limit,
            state: parts.state,
            pauses: parts.pauses,
            segments: parts.segments,
            charges: parts.charges,
            version: parts.version,
        }
    }

    pub fn id(&self) -> SessionId {
        self.id
    }

    pub fn station_id(&self) -> StationId {
        self.station_id
    }

    pub fn created_at(&self) -> TimestampMs {
        self.created_at
    }

    pub fn started_at(&self) -> TimestampMs {
        self.started_at
    }

    pub fn timer_minutes(&self) -> Option<u32> {
        self.timer_minutes
    }

    pub fn timer_notified(&self) -> bool {
        self.timer_notified
    }

    pub fn cost_limit(&self) -> Option<Piasters> {
        self.cost_limit
    }

    pub fn state(&self) -> &SessionState {
        &self.state
    }

    pub fn closing(&self) -> Option<&Closing> {
        match &self.state {
            SessionState::Ended(closing) => Some(closing),
            _ => None,
        }
    }

    pub fn pauses(&self) -> &[TimeRange] {
        &self.pauses
    }

    pub fn segments(&self) -> &SegmentLedger {
        &self.segments
    }

    pub fn charges(&self) -> &ChargeLedger {
        &self.charges
    }

    pub fn version(&self) -> u64 {
        self.version
    }

    pub fn is_active(&self) -> bool {
        !matches!(self.state, SessionState::Ended(_))
    }

    pub fn paused_since(&self) -> Option<TimestampMs> {
        match self.state {
            SessionState::Paused { since } => Some(since),
            _ => None,
        }
    }

    pub fn current_mode(&self) -> Option<BillingMode> {
        self.segments.open_segment().map(|segment| segment.mode)
    }

    pub(crate) fn bump_version(&mut self) {
        self.version += 1;
    }

    /// Closed pauses plus the ongoing one, if any, up to `now`.
    pub fn paused_ranges(&self, now: TimestampMs) -> Vec<TimeRange> {
        let mut ranges = self.pauses.clone();
        if let Some(since) = self.paused_since() {
            ranges.push(TimeRange::new(since, now.max(since)));
        }
        ranges
    }

    pub fn paused_duration_ms(&self, now: TimestampMs) -> i64 {
        self.paused_ranges(self.clamp_now(now))
            .iter()
            .map(TimeRange::duration_ms)
            .sum()
    }

    pub fn cost_breakdown(&self, now: TimestampMs) -> CostBreakdown {
        let now = self.clamp_now(now);
        self.segments.cost_breakdown(now, &self.paused_ranges(now))
    }

    pub fn pause(&mut self, at: TimestampMs) -> Result<(), BillingError> {
        match self.state {
            SessionState::Running => {
                let since = at.max(self.last_boundary());
                self.state = SessionState::Paused { since };
                Ok(())
            }
            SessionState::Paused { .. } => Err(BillingError::AlreadyPaused),
            SessionState::Ended(_) => Err(BillingError::SessionEnded(self.id)),
        }
    }

    pub fn resume(&mut self, at: TimestampMs) -> Result<(), BillingError> {
        match self.state {
            SessionState::Paused { since } => {
                self.pauses.push(TimeRange::new(since, at.max(since)));
                self.state = SessionState::Running;
                Ok(())
            }
            SessionState::Running => Err(BillingError::NotPaused),
            SessionState::Ended(_) => Err(BillingError::SessionEnded(self.id)),
        }
    }

    pub fn switch_mode(
        &mut self,
        station: &Station,
        mode: BillingMode,
        at: TimestampMs,
    ) -> Result<(), BillingError> {
        match self.state {
            SessionState::Running => {}
            SessionState::Paused { .. } => return Err(BillingError::CannotSwitchWhilePaused),
            SessionState::Ended(_) => return Err(BillingError::SessionEnded(self.id)),
        }

        let rate = rate_for(station, mode)?;
        self.segments.switch_mode(mode, rate, at)
    }

    pub fn retime_start(&mut self, at: TimestampMs, now: TimestampMs) -> Result<(), BillingError> {
        self.ensure_active()?;
        if at > now {
            return Err(BillingError::InvalidStartTime);
        }

        self.segments.retime_start(at)?;
        self.started_at = at;
        Ok(())
    }

    pub fn set_timer(&mut self, minutes: Option<u32>) -> Result<(), BillingError> {
        self.ensure_active()?;
        self.timer_minutes = minutes.filter(|minutes| *minutes > 0);
        self.timer_notified = false;
        Ok(())
    }

    pub fn set_cost_limit(&mut self, limit: Option<Piasters>) -> Result<(), BillingError> {
        self.ensure_active()?;
        if let Some(limit) = limit
            && (!limit.is_positive() || limit.exceeds_limit())
        {
            return Err(BillingError::InvalidAmount(limit.0));
        }
        self.cost_limit = limit;
        Ok(())
    }

    pub fn add_charge(&mut self, charge: Charge) -> Result<ChargeId, BillingError> {
        self.ensure_active()?;
        self.charges.add(charge)
    }

    pub fn edit_charge(
        &mut self,
        id: ChargeId,
        amount: Piasters,
        reason: Option<String>,
    ) -> Result<(), BillingError> {
        self.ensure_active()?;
        self.charges.edit(id, amount, reason)
    }

    pub fn remove_charge(&mut self, id: ChargeId) -> Result<Charge, BillingError> {
        self.ensure_active()?;
        self.charges.remove(id)
    }

    pub fn move_to_station(&mut self, station_id: StationId) -> Result<(), BillingError> {
        self.ensure_active()?;
        self.station_id = station_id;
        Ok(())
    }

    /// Commits the closing amount. Nothing changes if the policy is rejected.
    pub fn end(
        &mut self,
        now: TimestampMs,
        policy: ClosingPolicy,
        orders: Piasters,
        rounding_step: Piasters,
        transferred_out: Option<TransferId>,
    ) -> Result<Closing, BillingError> {
        self.ensure_active()?;

        let now = now.max(self.last_boundary());
        let totals = self.charges.totals();
        let true_total = TrueTotal {
            gaming: self.cost_breakdown(now).total,
            orders,
            charges: totals.manual,
            transferred_in: totals.transferred_in,
        };
        let final_amount = final_amount(&true_total, policy, rounding_step)?;

        if let SessionState::Paused { since } = self.state {
            self.pauses.push(TimeRange::new(since, now));
        }
        if self.segments.open_segment().is_some() {
            self.segments.close(now)?;
        }

        let closing = Closing {
            ended_at: now,
            policy,
            final_amount,
            true_total,
            transferred_out,
        };
        self.state = SessionState::Ended(closing);
        Ok(closing)
    }

    pub fn timer_status(&self, now: TimestampMs) -> Option<TimerStatus> {
        let limit_minutes = self.timer_minutes?;
        let billable_ms = self.cost_breakdown(now).billable_ms;
        let limit_ms = i64::from(limit_minutes) * MINUTE_MS;

        Some(TimerStatus {
            limit_minutes,
            remaining_ms: (limit_ms - billable_ms).max(0),
            expired: billable_ms >= limit_ms,
        })
    }

    /// Marks the timer as notified on the first evaluation that finds it expired.
    pub fn take_timer_expiry(&mut self, now: TimestampMs) -> Option<BillingEvent> {
        if !self.is_active() || self.timer_notified {
            return None;
        }

        let status = self.timer_status(now)?;
        if !status.expired {
            return None;
        }

        self.timer_notified = true;
        Some(BillingEvent::TimerExpired {
            session_id: self.id,
            station_id: self.station_id,
            timer_minutes: status.limit_minutes,
        })
    }

    pub fn view(&self, now: TimestampMs) -> SessionView {
        let now = self.clamp_now(now);
        let breakdown = self.cost_breakdown(now);
        let totals = self.charges.totals();
        let running_total = breakdown.total + totals.manual + totals.transferred_in;

        SessionView {
            now,
            elapsed_ms: now.millis_since(self.started_at),
            billable_ms: breakdown.billable_ms,
            paused_ms: self.paused_duration_ms(now),
            breakdown,
            charges: totals.manual,
            transferred_in: totals.transferred_in,
            timer: self.timer_status(now),
            cost_limit_reached: self
                .cost_limit
                .is_some_and(|limit| running_total >= limit),
        }
    }

    fn ensure_active(&self) -> Result<(), BillingError> {
        if self.is_active() {
            Ok(())
        } else {
            Err(BillingError::SessionEnded(self.id))
        }
    }

    /// Ended sessions are frozen at their end instant.
    fn clamp_now(&self, now: TimestampMs) -> TimestampMs {
        match &self.state {
            SessionState::Ended(closing) => closing.ended_at,
            _ => now,
        }
    }

    /// Earliest instant a new pause or the end may be recorded at.
    fn last_boundary(&self) -> TimestampMs {
        let segment_start = self
            .segments
            .open_segment()
            .map(|segment| segment.started_at)
            .unwrap_or(self.started_at);
        let last_pause_end = self.pauses.last().map(|pause| pause.end);
        let paused_since = self.paused_since();

        [Some(segment_start), last_pause_end, paused_since]
            .into_iter()
            .flatten()
            .max()
            .unwrap_or(self.started_at)
    }
}
