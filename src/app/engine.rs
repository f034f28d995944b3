//! In-memory registry of stations and sessions.
//!
//! Every session sits behind its own mutex. A mutation clones the session,
//! applies the change to the clone and swaps it in only if it succeeded, so a
//! failing operation leaves nothing behind. Lock order is session(s) first,
//! then the station table; sessions are always taken in ascending id order.
//! Nothing touches the store, the order ledger or the event sink while a lock
//! is held.
//!
//! Saves are write-behind: once a change is committed in memory the call
//! succeeds, and a snapshot that could not be saved is kept and retried by
//! `flush_pending`. The store ignores snapshots older than what it holds.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, RwLock};

use crate::adapters::db::IdWatermarks;
use crate::app::services::{BillingStore, OrderLedger, StoreSnapshot};
use crate::domain::charges::{Charge, ChargeOrigin};
use crate::domain::error::BillingError;
use crate::domain::events::{BillingEvent, EventSink};
use crate::domain::models::{
    ChargeId, NewStation, SessionId, Station, StationId, StationStatus, Transfer, TransferId,
};
use crate::domain::money::Piasters;
use crate::domain::rates::{BillingMode, StationRates};
use crate::domain::reconciliation::{Closing, ClosingPolicy};
use crate::domain::session::{Session, SessionView};
use crate::domain::time::{Clock, TimestampMs};

pub struct EngineDeps {
    pub clock: Arc<dyn Clock>,
    pub store: Arc<dyn BillingStore>,
    pub orders: Arc<dyn OrderLedger>,
    pub events: Arc<dyn EventSink>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StartSession {
    pub station_id: StationId,
    pub mode: BillingMode,
    pub started_at: Option<TimestampMs>,
    pub timer_minutes: Option<u32>,
    pub cost_limit: Option<Piasters>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionSnapshot {
    pub session: Session,
    pub view: SessionView,
}

#[derive(Default)]
struct IdAllocator {
    station: AtomicI64,
    session: AtomicI64,
    charge: AtomicI64,
    transfer: AtomicI64,
}

impl IdAllocator {
    fn seed(&self, watermarks: &IdWatermarks) {
        self.station.fetch_max(watermarks.station, Ordering::SeqCst);
        self.session.fetch_max(watermarks.session, Ordering::SeqCst);
        self.charge.fetch_max(watermarks.charge, Ordering::SeqCst);
        self.transfer.fetch_max(watermarks.transfer, Ordering::SeqCst);
    }

    fn next(counter: &AtomicI64) -> i64 {
        counter.fetch_add(1, Ordering::SeqCst) + 1
    }
}

/// Records whose last save failed; retried by `flush_pending`.
#[derive(Default)]
struct PendingWrites {
    stations: HashSet<StationId>,
    sessions: HashMap<SessionId, Session>,
    transfers: Vec<PendingTransfer>,
}

impl PendingWrites {
    fn len(&self) -> usize {
        self.stations.len() + self.sessions.len() + self.transfers.len()
    }

    /// Keeps the newest snapshot per session.
    fn queue_session(&mut self, session: &Session) {
        let newer = self
            .sessions
            .get(&session.id())
            .is_none_or(|queued| queued.version() < session.version());
        if newer {
            self.sessions.insert(session.id(), session.clone());
        }
    }
}

struct PendingTransfer {
    transfer: Transfer,
    from: Session,
    to: Session,
}

type SessionHandle = Arc<Mutex<Session>>;

/// Active sessions by id. Ended sessions leave `active` and only their id is kept.
#[derive(Default)]
struct SessionRegistry {
    active: HashMap<SessionId, SessionHandle>,
    retired: HashSet<SessionId>,
}

pub struct BillingEngine {
    clock: Arc<dyn Clock>,
    store: Arc<dyn BillingStore>,
    orders: Arc<dyn OrderLedger>,
    events: Arc<dyn EventSink>,
    rounding_step: Piasters,
    stations: Mutex<HashMap<StationId, Station>>,
    sessions: RwLock<SessionRegistry>,
    ids: IdAllocator,
    pending: Mutex<PendingWrites>,
}

impl BillingEngine {
    pub fn new(deps: EngineDeps, rounding_step: Piasters) -> Self {
        Self {
            clock: deps.clock,
            store: deps.store,
            orders: deps.orders,
            events: deps.events,
            rounding_step,
            stations: Mutex::new(HashMap::new()),
            sessions: RwLock::new(SessionRegistry::default()),
            ids: IdAllocator::default(),
            pending: Mutex::new(PendingWrites::default()),
        }
    }

    pub fn restore(&self, snapshot: StoreSnapshot) -> Result<(), BillingError> {
        self.ids.seed(&snapshot.watermarks);

        let mut stations = self.lock_stations()?;
        let mut sessions = self
            .sessions
            .write()
            .map_err(|_| BillingError::LockPoisoned)?;

        for station in snapshot.stations {
            stations.insert(station.id, station);
        }
        for session in snapshot.active_sessions {
            sessions
                .active
                .insert(session.id(), Arc::new(Mutex::new(session)));
        }

        tracing::info!(
            stations = stations.len(),
            active_sessions = sessions.active.len(),
            "billing engine restored"
        );
        Ok(())
    }

    pub fn now(&self) -> TimestampMs {
        self.clock.now()
    }

    pub fn register_station(&self, new_station: NewStation) -> Result<Station, BillingError> {
        let station = Station {
            id: StationId(IdAllocator::next(&self.ids.station)),
            name: new_station.name,
            rates: new_station.rates,
            status: StationStatus::Available,
            reachable: true,
            network_address: new_station.network_address,
        };

        self.store
            .save_station(&station)
            .map_err(BillingError::unavailable)?;
        self.lock_stations()?.insert(station.id, station.clone());

        tracing::info!(station_id = %station.id, name = %station.name, "station registered");
        Ok(station)
    }

    pub fn update_station_rates(
        &self,
        station_id: StationId,
        rates: StationRates,
    ) -> Result<Station, BillingError> {
        let station = {
            let mut stations = self.lock_stations()?;
            let station = stations
                .get_mut(&station_id)
                .ok_or(BillingError::UnknownStation(station_id))?;
            station.rates = rates;
            station.clone()
        };

        self.persist_station(&station);
        tracing::info!(
            station_id = %station_id,
            single_rate = %rates.single_per_hour,
            "station rates updated"
        );
        Ok(station)
    }

    pub fn set_station_maintenance(
        &self,
        station_id: StationId,
        maintenance: bool,
    ) -> Result<Station, BillingError> {
        let station = {
            let mut stations = self.lock_stations()?;
            let station = stations
                .get_mut(&station_id)
                .ok_or(BillingError::UnknownStation(station_id))?;
            station.status = match (station.status, maintenance) {
                (StationStatus::Occupied { .. }, _) => {
                    return Err(BillingError::StationBusy(station_id));
                }
                (_, true) => StationStatus::Maintenance,
                (_, false) => StationStatus::Available,
            };
            station.clone()
        };

        self.persist_station(&station);
        tracing::info!(station_id = %station_id, maintenance, "station maintenance toggled");
        Ok(station)
    }

    pub fn stations(&self) -> Result<Vec<Station>, BillingError> {
        let mut stations: Vec<Station> = self.lock_stations()?.values().cloned().collect();
        stations.sort_by_key(|station| station.id);
        Ok(stations)
    }

    pub fn station(&self, station_id: StationId) -> Result<Station, BillingError> {
        self.lock_stations()?
            .get(&station_id)
            .cloned()
            .ok_or(BillingError::UnknownStation(station_id))
    }

    pub fn start_session(&self, request: StartSession) -> Result<SessionId, BillingError> {
        let now = self.clock.now();

        let session = {
            let mut stations = self.lock_stations()?;
            let station = stations
                .get_mut(&request.station_id)
                .ok_or(BillingError::UnknownStation(request.station_id))?;
            match station.status {
                StationStatus::Available => {}
                StationStatus::Occupied { .. } => {
                    return Err(BillingError::StationBusy(station.id));
                }
                StationStatus::Maintenance => {
                    return Err(BillingError::StationInMaintenance(station.id));
                }
            }

            let id = SessionId(IdAllocator::next(&self.ids.session));
            let mut session = Session::start(id, station, request.mode, request.started_at, now)?;
            session.set_timer(request.timer_minutes)?;
            session.set_cost_limit(request.cost_limit)?;

            self.sessions
                .write()
                .map_err(|_| BillingError::LockPoisoned)?
                .active
                .insert(id, Arc::new(Mutex::new(session.clone())));
            station.status = StationStatus::Occupied { session_id: id };
            session
        };

        tracing::info!(
            session_id = %session.id(),
            station_id = %session.station_id(),
            mode = request.mode.as_str(),
            started_at = session.started_at().0,
            "session started"
        );
        self.persist_session(&session);
        Ok(session.id())
    }

    pub fn pause(&self, session_id: SessionId) -> Result<(), BillingError> {
        let now = self.clock.now();
        self.mutate_session(session_id, |session| session.pause(now))?;
        tracing::info!(session_id = %session_id, "session paused");
        Ok(())
    }

    pub fn resume(&self, session_id: SessionId) -> Result<(), BillingError> {
        let now = self.clock.now();
        self.mutate_session(session_id, |session| session.resume(now))?;
        tracing::info!(session_id = %session_id, "session resumed");
        Ok(())
    }

    pub fn switch_mode(&self, session_id: SessionId, mode: BillingMode) -> Result<(), BillingError> {
        let now = self.clock.now();
        self.mutate_session(session_id, |session| {
            let station = self.station(session.station_id())?;
            session.switch_mode(&station, mode, now)
        })?;
        tracing::info!(session_id = %session_id, mode = mode.as_str(), "billing mode switched");
        Ok(())
    }

    pub fn set_timer(
        &self,
        session_id: SessionId,
        minutes: Option<u32>,
    ) -> Result<(), BillingError> {
        self.mutate_session(session_id, |session| session.set_timer(minutes))?;
        tracing::info!(session_id = %session_id, timer_minutes = ?minutes, "timer updated");
        Ok(())
    }

    pub fn set_cost_limit(
        &self,
        session_id: SessionId,
        limit: Option<Piasters>,
    ) -> Result<(), BillingError> {
        self.mutate_session(session_id, |session| session.set_cost_limit(limit))?;
        tracing::info!(session_id = %session_id, cost_limit = ?limit, "cost limit updated");
        Ok(())
    }

    pub fn retime_start(
        &self,
        session_id: SessionId,
        started_at: TimestampMs,
    ) -> Result<(), BillingError> {
        let now = self.clock.now();
        self.mutate_session(session_id, |session| session.retime_start(started_at, now))?;
        tracing::info!(session_id = %session_id, started_at = started_at.0, "start time edited");
        Ok(())
    }

    pub fn add_charge(
        &self,
        session_id: SessionId,
        amount: Piasters,
        reason: Option<String>,
    ) -> Result<ChargeId, BillingError> {
        let charge = Charge {
            id: ChargeId(IdAllocator::next(&self.ids.charge)),
            amount,
            reason,
            created_at: self.clock.now(),
            origin: ChargeOrigin::Manual,
        };
        let charge_id =
            self.mutate_session(session_id, move |session| session.add_charge(charge))?;
        tracing::info!(
            session_id = %session_id,
            charge_id = %charge_id,
            amount = %amount,
            "charge added"
        );
        Ok(charge_id)
    }

    pub fn edit_charge(
        &self,
        session_id: SessionId,
        charge_id: ChargeId,
        amount: Piasters,
        reason: Option<String>,
    ) -> Result<(), BillingError> {
        self.mutate_session(session_id, move |session| {
            session.edit_charge(charge_id, amount, reason)
        })?;
        tracing::info!(
            session_id = %session_id,
            charge_id = %charge_id,
            amount = %amount,
            "charge edited"
        );
        Ok(())
    }

    pub fn remove_charge(
        &self,
        session_id: SessionId,
        charge_id: ChargeId,
    ) -> Result<(), BillingError> {
        self.mutate_session(session_id, |session| session.remove_charge(charge_id))?;
        tracing::info!(session_id = %session_id, charge_id = %charge_id, "charge removed");
        Ok(())
    }

    pub fn end_session(
        &self,
        session_id: SessionId,
        policy: ClosingPolicy,
    ) -> Result<Closing, BillingError> {
        let handle = self.session_handle(session_id)?;
        let observed_version = Self::lock_session(&handle)?.version();
        let orders = self.orders_total(session_id)?;

        let (closing, snapshot) = {
            let mut guard = Self::lock_session(&handle)?;
            if guard.version() != observed_version {
                return Err(BillingError::Conflict(session_id));
            }

            let now = self.clock.now();
            let mut next = guard.clone();
            let closing = next.end(now, policy, orders, self.rounding_step, None)?;
            next.bump_version();
            *guard = next;

            self.release_station(guard.station_id(), session_id)?;
            (closing, guard.clone())
        };
        self.retire_session(session_id);

        tracing::info!(
            session_id = %session_id,
            station_id = %snapshot.station_id(),
            policy = policy.as_str(),
            true_total = %closing.true_total.total(),
            final_amount = %closing.final_amount,
            "session ended"
        );
        self.persist_session(&snapshot);
        self.events.publish(BillingEvent::SessionEnded {
            session_id,
            final_amount: closing.final_amount,
        });
        Ok(closing)
    }

    pub fn transfer(
        &self,
        from_id: SessionId,
        to_id: SessionId,
        include_orders: bool,
    ) -> Result<Transfer, BillingError> {
        if from_id == to_id {
            return Err(BillingError::SelfTransfer);
        }

        let from_handle = self.session_handle(from_id)?;
        let to_handle = self.session_handle(to_id).map_err(|error| match error {
            BillingError::SessionEnded(id) => BillingError::TargetNotActive(id),
            other => other,
        })?;
        let observed_version = Self::lock_session(&from_handle)?.version();
        let orders = self.orders_total(from_id)?;

        let (transfer, from_snapshot, to_snapshot) = {
            let (mut from_guard, mut to_guard) = if from_id < to_id {
                let from_guard = Self::lock_session(&from_handle)?;
                let to_guard = Self::lock_session(&to_handle)?;
                (from_guard, to_guard)
            } else {
                let to_guard = Self::lock_session(&to_handle)?;
                let from_guard = Self::lock_session(&from_handle)?;
                (from_guard, to_guard)
            };

            if from_guard.version() != observed_version {
                return Err(BillingError::Conflict(from_id));
            }
            if !from_guard.is_active() {
                return Err(BillingError::SessionEnded(from_id));
            }
            if !to_guard.is_active() {
                return Err(BillingError::TargetNotActive(to_id));
            }

            let now = self.clock.now();
            let from_station = self.station(from_guard.station_id())?;
            let movable = from_guard.cost_breakdown(now).total
                + if include_orders { orders } else { Piasters::ZERO };
            let transfer = Transfer {
                id: TransferId(IdAllocator::next(&self.ids.transfer)),
                from_session_id: from_id,
                from_station_id: from_guard.station_id(),
                to_session_id: to_id,
                to_station_id: to_guard.station_id(),
                amount: movable,
                includes_orders: include_orders,
                created_at: now,
            };

            let mut next_from = from_guard.clone();
            next_from.end(
                now,
                ClosingPolicy::Zero,
                orders,
                self.rounding_step,
                Some(transfer.id),
            )?;
            let mut next_to = to_guard.clone();
            next_to.add_charge(Charge {
                id: ChargeId(IdAllocator::next(&self.ids.charge)),
                amount: movable,
                reason: Some(format!("transfer from {}", from_station.name)),
                created_at: now,
                origin: ChargeOrigin::Transfer(transfer.id),
            })?;

            next_from.bump_version();
            next_to.bump_version();
            *from_guard = next_from;
            *to_guard = next_to;
            self.release_station(from_guard.station_id(), from_id)?;

            (transfer, from_guard.clone(), to_guard.clone())
        };
        self.retire_session(from_id);

        tracing::info!(
            transfer_id = %transfer.id,
            from_session_id = %from_id,
            to_session_id = %to_id,
            amount = %transfer.amount,
            include_orders,
            "session liability transferred"
        );

        self.persist_transfer(PendingTransfer {
            transfer: transfer.clone(),
            from: from_snapshot,
            to: to_snapshot,
        });
        self.events.publish(BillingEvent::SessionEnded {
            session_id: from_id,
            final_amount: Piasters::ZERO,
        });
        Ok(transfer)
    }

    pub fn switch_station(
        &self,
        session_id: SessionId,
        target: StationId,
    ) -> Result<(), BillingError> {
        let handle = self.session_handle(session_id)?;

        let (snapshot, previous) = {
            let mut guard = Self::lock_session(&handle)?;
            if !guard.is_active() {
                return Err(BillingError::SessionEnded(session_id));
            }
            let previous = guard.station_id();

            let mut stations = self.lock_stations()?;
            let target_station = stations
                .get(&target)
                .ok_or(BillingError::UnknownStation(target))?;
            if target_station.status != StationStatus::Available {
                return Err(BillingError::StationNoLongerAvailable(target));
            }

            let mut next = guard.clone();
            next.move_to_station(target)?;
            next.bump_version();

            if let Some(station) = stations.get_mut(&target) {
                station.status = StationStatus::Occupied { session_id };
            }
            if let Some(station) = stations.get_mut(&previous)
                && station.status.active_session() == Some(session_id)
            {
                station.status = StationStatus::Available;
            }
            *guard = next;

            (guard.clone(), previous)
        };

        tracing::info!(
            session_id = %session_id,
            from_station_id = %previous,
            to_station_id = %target,
            "session moved to another station"
        );
        self.persist_session(&snapshot);
        Ok(())
    }

    /// Pauses or resumes the station's active session. Returns the session
    /// that changed state, if any.
    pub fn on_station_reachability_changed(
        &self,
        station_id: StationId,
        reachable: bool,
        at: TimestampMs,
    ) -> Result<Option<SessionId>, BillingError> {
        let (station, active) = {
            let mut stations = self.lock_stations()?;
            let station = stations.get_mut(&station_id).ok_or_else(|| {
                BillingError::MalformedSignal(format!("unknown station {station_id}"))
            })?;
            station.reachable = reachable;
            (station.clone(), station.status.active_session())
        };

        self.persist_station(&station);

        let Some(session_id) = active else {
            return Ok(None);
        };

        let at = at.min(self.clock.now());
        let result = if reachable {
            self.mutate_session(session_id, |session| session.resume(at))
        } else {
            self.mutate_session(session_id, |session| session.pause(at))
        };

        match result {
            Ok(()) => {
                tracing::info!(
                    session_id = %session_id,
                    station_id = %station_id,
                    reachable,
                    "session state follows station reachability"
                );
                Ok(Some(session_id))
            }
            Err(BillingError::AlreadyPaused | BillingError::NotPaused) => Ok(None),
            Err(error) => Err(error),
        }
    }

    /// Live display read. Also fires the timer notification when it is due.
    pub fn session_view(&self, session_id: SessionId) -> Result<SessionSnapshot, BillingError> {
        let handle = self.session_handle(session_id)?;
        let session = Self::lock_session(&handle)?.clone();
        let now = self.clock.now();
        let view = session.view(now);

        let due = session.is_active()
            && !session.timer_notified()
            && view.timer.is_some_and(|timer| timer.expired);
        if due {
            self.fire_timer(session_id, now)?;
        }

        Ok(SessionSnapshot { session, view })
    }

    pub fn active_sessions(&self) -> Result<Vec<Session>, BillingError> {
        let handles: Vec<SessionHandle> = self
            .sessions
            .read()
            .map_err(|_| BillingError::LockPoisoned)?
            .active
            .values()
            .cloned()
            .collect();

        let mut sessions = Vec::new();
        for handle in handles {
            let session = Self::lock_session(&handle)?;
            if session.is_active() {
                sessions.push(session.clone());
            }
        }
        sessions.sort_by_key(Session::id);
        Ok(sessions)
    }

    /// Sweeps all active sessions so timers fire even when nobody is looking.
    /// A session that cannot be evaluated is logged and skipped.
    pub fn evaluate_timers(&self) -> Result<Vec<BillingEvent>, BillingError> {
        let now = self.clock.now();
        let mut session_ids: Vec<SessionId> = self
            .sessions
            .read()
            .map_err(|_| BillingError::LockPoisoned)?
            .active
            .keys()
            .copied()
            .collect();
        session_ids.sort();

        let mut fired = Vec::new();
        for session_id in session_ids {
            match self.fire_timer(session_id, now) {
                Ok(Some(event)) => fired.push(event),
                Ok(None) => {}
                Err(error) => {
                    tracing::warn!(error = %error, session_id = %session_id, "timer check skipped");
                }
            }
        }
        Ok(fired)
    }

    /// Retries saves that failed earlier. Returns how many records are still pending.
    pub fn flush_pending(&self) -> Result<usize, BillingError> {
        let pending = {
            let mut pending = self.pending.lock().map_err(|_| BillingError::LockPoisoned)?;
            std::mem::take(&mut *pending)
        };

        for station_id in pending.stations {
            let station = self.station(station_id)?;
            if self.persist_station(&station) {
                tracing::info!(station_id = %station_id, "pending station saved");
            }
        }
        for transfer in pending.transfers {
            let transfer_id = transfer.transfer.id;
            if self.persist_transfer(transfer) {
                tracing::info!(transfer_id = %transfer_id, "pending transfer saved");
            }
        }
        for (session_id, snapshot) in pending.sessions {
            if self.persist_session(&snapshot) {
                tracing::info!(session_id = %session_id, "pending session saved");
            }
        }

        let pending = self.pending.lock().map_err(|_| BillingError::LockPoisoned)?;
        Ok(pending.len())
    }

    fn fire_timer(
        &self,
        session_id: SessionId,
        now: TimestampMs,
    ) -> Result<Option<BillingEvent>, BillingError> {
        let handle = match self.session_handle(session_id) {
            Ok(handle) => handle,
            Err(BillingError::SessionEnded(_)) => return Ok(None),
            Err(error) => return Err(error),
        };
        let (event, snapshot) = {
            let mut guard = Self::lock_session(&handle)?;
            let mut next = guard.clone();
            let Some(event) = next.take_timer_expiry(now) else {
                return Ok(None);
            };
            next.bump_version();
            *guard = next;
            (event, guard.clone())
        };

        tracing::info!(
            session_id = %session_id,
            station_id = %snapshot.station_id(),
            "timer expiry detected"
        );
        self.persist_session(&snapshot);
        self.events.publish(event);
        Ok(Some(event))
    }

    /// Applies `op` to a clone and commits it only if it succeeds.
    fn mutate_session<T>(
        &self,
        session_id: SessionId,
        op: impl FnOnce(&mut Session) -> Result<T, BillingError>,
    ) -> Result<T, BillingError> {
        let handle = self.session_handle(session_id)?;
        let (value, snapshot) = {
            let mut guard = Self::lock_session(&handle)?;
            let mut next = guard.clone();
            let value = op(&mut next)?;
            next.bump_version();
            *guard = next;
            (value, guard.clone())
        };

        self.persist_session(&snapshot);
        Ok(value)
    }

    /// Moves an ended session out of the active map.
    fn retire_session(&self, session_id: SessionId) {
        match self.sessions.write() {
            Ok(mut sessions) => {
                sessions.active.remove(&session_id);
                sessions.retired.insert(session_id);
            }
            Err(_) => tracing::error!(session_id = %session_id, "session registry poisoned"),
        }
    }

    /// Must be called with the session lock held.
    fn release_station(
        &self,
        station_id: StationId,
        session_id: SessionId,
    ) -> Result<(), BillingError> {
        let mut stations = self.lock_stations()?;
        if let Some(station) = stations.get_mut(&station_id)
            && station.status.active_session() == Some(session_id)
        {
            station.status = StationStatus::Available;
        }
        Ok(())
    }

    fn orders_total(&self, session_id: SessionId) -> Result<Piasters, BillingError> {
        self.orders.orders_total(session_id).map_err(|error| {
            tracing::warn!(error = %error, session_id = %session_id, "orders total unavailable");
            BillingError::unavailable(error)
        })
    }

    /// Returns whether the snapshot reached the store; otherwise it is queued.
    fn persist_session(&self, session: &Session) -> bool {
        match self.store.save_session(session) {
            Ok(()) => true,
            Err(error) => {
                tracing::error!(error = %error, session_id = %session.id(), "failed to persist session");
                self.with_pending(|pending| pending.queue_session(session));
                false
            }
        }
    }

    fn persist_station(&self, station: &Station) -> bool {
        match self.store.save_station(station) {
            Ok(()) => true,
            Err(error) => {
                tracing::error!(error = %error, station_id = %station.id, "failed to persist station");
                self.with_pending(|pending| {
                    pending.stations.insert(station.id);
                });
                false
            }
        }
    }

    fn persist_transfer(&self, pending_transfer: PendingTransfer) -> bool {
        let PendingTransfer { transfer, from, to } = &pending_transfer;
        match self.store.save_transfer(transfer, from, to) {
            Ok(()) => true,
            Err(error) => {
                tracing::error!(error = %error, transfer_id = %transfer.id, "failed to persist transfer");
                self.with_pending(|pending| pending.transfers.push(pending_transfer));
                false
            }
        }
    }

    fn with_pending(&self, op: impl FnOnce(&mut PendingWrites)) {
        match self.pending.lock() {
            Ok(mut pending) => op(&mut pending),
            Err(_) => tracing::error!("pending write queue poisoned; snapshot dropped"),
        }
    }

    fn session_handle(&self, session_id: SessionId) -> Result<SessionHandle, BillingError> {
        let sessions = self
            .sessions
            .read()
            .map_err(|_| BillingError::LockPoisoned)?;
        if let Some(handle) = sessions.active.get(&session_id) {
            return Ok(handle.clone());
        }
        if sessions.retired.contains(&session_id) {
            return Err(BillingError::SessionEnded(session_id));
        }
        Err(BillingError::UnknownSession(session_id))
    }

    #[cfg(test)]
    pub(crate) fn poison_session(&self, session_id: SessionId) {
        let handle = self
            .session_handle(session_id)
            .expect("session should be active");
        let _ = std::thread::spawn(move || {
            let _guard = handle.lock().expect("session lock should be free");
            panic!("session lock poisoned on purpose");
        })
        .join();
    }

    fn lock_session(handle: &SessionHandle) -> Result<MutexGuard<'_, Session>, BillingError> {
        handle.lock().map_err(|_| BillingError::LockPoisoned)
    }

    fn lock_stations(&self) -> Result<MutexGuard<'_, HashMap<StationId, Station>>, BillingError> {
        self.stations.lock().map_err(|_| BillingError::LockPoisoned)
    }
}
