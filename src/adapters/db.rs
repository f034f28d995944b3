use rusqlite::{Connection, OptionalExtension, Row, params};
use thiserror::Error;

use crate::domain::charges::{Charge, ChargeLedger, ChargeOrigin};
use crate::domain::models::{
    ChargeId, SessionId, Station, StationId, StationStatus, Transfer, TransferId,
};
use crate::domain::money::Piasters;
use crate::domain::rates::{BillingMode, StationRates};
use crate::domain::reconciliation::{Closing, ClosingPolicy, TrueTotal};
use crate::domain::segments::{Segment, SegmentLedger};
use crate::domain::session::{Session, SessionParts, SessionState};
use crate::domain::time::{TimeRange, TimestampMs};

pub const LATEST_SCHEMA_VERSION: u32 = 2;

const MIGRATIONS: &[(u32, &str)] = &[
    (
        1,
        r#"
CREATE TABLE IF NOT EXISTS stations (
    id INTEGER PRIMARY KEY,
    name TEXT NOT NULL,
    single_rate INTEGER NOT NULL,
    multi_rate INTEGER,
    maintenance INTEGER NOT NULL DEFAULT 0,
    reachable INTEGER NOT NULL DEFAULT 1,
    network_address TEXT
);

CREATE TABLE IF NOT EXISTS sessions (
    id INTEGER PRIMARY KEY,
    station_id INTEGER NOT NULL REFERENCES stations (id),
    created_at INTEGER NOT NULL,
    started_at INTEGER NOT NULL,
    timer_minutes INTEGER,
    timer_notified INTEGER NOT NULL DEFAULT 0,
    cost_limit INTEGER,
    state TEXT NOT NULL,
    paused_since INTEGER,
    ended_at INTEGER,
    closing_policy TEXT,
    final_amount INTEGER,
    gaming_total INTEGER,
    orders_total INTEGER,
    charges_total INTEGER,
    transferred_in_total INTEGER,
    transferred_out_id INTEGER,
    version INTEGER NOT NULL DEFAULT 0
);

CREATE INDEX IF NOT EXISTS idx_sessions_state
ON sessions (state);

CREATE INDEX IF NOT EXISTS idx_sessions_ended_at_desc
ON sessions (ended_at DESC);

CREATE TABLE IF NOT EXISTS segments (
    session_id INTEGER NOT NULL REFERENCES sessions (id),
    seq INTEGER NOT NULL,
    mode TEXT NOT NULL,
    rate INTEGER NOT NULL,
    started_at INTEGER NOT NULL,
    ended_at INTEGER,
    PRIMARY KEY (session_id, seq)
);

CREATE TABLE IF NOT EXISTS pauses (
    session_id INTEGER NOT NULL REFERENCES sessions (id),
    seq INTEGER NOT NULL,
    started_at INTEGER NOT NULL,
    ended_at INTEGER NOT NULL,
    PRIMARY KEY (session_id, seq)
);

CREATE TABLE IF NOT EXISTS charges (
    id INTEGER PRIMARY KEY,
    session_id INTEGER NOT NULL REFERENCES sessions (id),
    amount INTEGER NOT NULL,
    reason TEXT,
    created_at INTEGER NOT NULL,
    transfer_id INTEGER
);

CREATE INDEX IF NOT EXISTS idx_charges_session_id
ON charges (session_id);
"#,
    ),
    (
        2,
        r#"
CREATE TABLE IF NOT EXISTS transfers (
    id INTEGER PRIMARY KEY,
    from_session_id INTEGER NOT NULL REFERENCES sessions (id),
    from_station_id INTEGER NOT NULL,
    to_session_id INTEGER NOT NULL REFERENCES sessions (id),
    to_station_id INTEGER NOT NULL,
    amount INTEGER NOT NULL,
    includes_orders INTEGER NOT NULL,
    created_at INTEGER NOT NULL
);

CREATE TABLE IF NOT EXISTS orders (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    session_id INTEGER NOT NULL,
    menu_item_id INTEGER NOT NULL,
    quantity INTEGER NOT NULL,
    price_snapshot INTEGER NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_orders_session_id
ON orders (session_id);
"#,
    ),
];

#[derive(Debug, Error)]
pub enum DbError {
    #[error("database operation failed: {0}")]
    Sqlite(#[from] rusqlite::Error),
    #[error("unsupported schema version {current}; latest supported is {latest}")]
    UnsupportedSchemaVersion { current: u32, latest: u32 },
    #[error("corrupt row in {table}: {detail}")]
    Corrupt { table: &'static str, detail: String },
}

impl DbError {
    fn corrupt(table: &'static str, detail: impl Into<String>) -> Self {
        Self::Corrupt {
            table,
            detail: detail.into(),
        }
    }
}

pub fn open_connection(path: &str) -> Result<Connection, DbError> {
    let connection = Connection::open(path)?;
    connection.pragma_update(None, "foreign_keys", "ON")?;
    Ok(connection)
}

pub fn run_migrations(connection: &mut Connection) -> Result<(), DbError> {
    let current_version = schema_version(connection)?;

    if current_version > LATEST_SCHEMA_VERSION {
        return Err(DbError::UnsupportedSchemaVersion {
            current: current_version,
            latest: LATEST_SCHEMA_VERSION,
        });
    }

    let transaction = connection.transaction()?;

    for (version, sql) in MIGRATIONS {
        if *version > current_version {
            transaction.execute_batch(sql)?;
            transaction.pragma_update(None, "user_version", version)?;
        }
    }

    transaction.commit()?;

    Ok(())
}

pub fn schema_version(connection: &Connection) -> Result<u32, DbError> {
    let version = connection.pragma_query_value(None, "user_version", |row| row.get(0))?;
    Ok(version)
}

pub fn upsert_station(connection: &Connection, station: &Station) -> Result<(), DbError> {
    connection.execute(
        "INSERT INTO stations (id, name, single_rate, multi_rate, maintenance, reachable, network_address)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)
         ON CONFLICT (id) DO UPDATE SET
            name = excluded.name,
            single_rate = excluded.single_rate,
            multi_rate = excluded.multi_rate,
            maintenance = excluded.maintenance,
            reachable = excluded.reachable,
            network_address = excluded.network_address",
        params![
            station.id.0,
            station.name,
            station.rates.single_per_hour.0,
            station.rates.multi_per_hour.map(|rate| rate.0),
            station.status == StationStatus::Maintenance,
            station.reachable,
            station.network_address,
        ],
    )?;

    Ok(())
}

/// Occupancy is derived from the active sessions referencing each station.
pub fn list_stations(connection: &Connection) -> Result<Vec<Station>, DbError> {
    let mut statement = connection.prepare(
        "SELECT st.id, st.name, st.single_rate, st.multi_rate, st.maintenance, st.reachable,
                st.network_address,
                (SELECT s.id FROM sessions s
                 WHERE s.station_id = st.id AND s.state != 'ended'
                 ORDER BY s.id DESC LIMIT 1)
         FROM stations st
         ORDER BY st.id",
    )?;

    let rows = statement.query_map([], |row| {
        Ok((
            row.get::<_, i64>(0)?,
            row.get::<_, String>(1)?,
            row.get::<_, i64>(2)?,
            row.get::<_, Option<i64>>(3)?,
            row.get::<_, bool>(4)?,
            row.get::<_, bool>(5)?,
            row.get::<_, Option<String>>(6)?,
            row.get::<_, Option<i64>>(7)?,
        ))
    })?;

    let mut stations = Vec::new();
    for row in rows {
        let (id, name, single, multi, maintenance, reachable, network_address, active) = row?;
        let rates = StationRates::new(Piasters(single), multi.map(Piasters))
            .map_err(|error| DbError::corrupt("stations", error.to_string()))?;
        let status = match (active, maintenance) {
            (Some(session_id), _) => StationStatus::Occupied {
                session_id: SessionId(session_id),
            },
            (None, true) => StationStatus::Maintenance,
            (None, false) => StationStatus::Available,
        };

        stations.push(Station {
            id: StationId(id),
            name,
            rates,
            status,
            reachable,
            network_address,
        });
    }

    Ok(stations)
}

/// Replaces the stored image of a session, including its segments, pauses and charges.
/// A snapshot whose version is not newer than the stored one is ignored; returns
/// whether the row was written.
pub fn save_session(connection: &Connection, session: &Session) -> Result<bool, DbError> {
    let transaction = connection.unchecked_transaction()?;
    let written = write_session(&transaction, session)?;
    transaction.commit()?;
    Ok(written)
}

/// Writes both sides of a transfer and the transfer record in one transaction.
pub fn save_transfer(
    connection: &Connection,
    transfer: &Transfer,
    from: &Session,
    to: &Session,
) -> Result<(), DbError> {
    let transaction = connection.unchecked_transaction()?;
    write_session(&transaction, from)?;
    write_session(&transaction, to)?;
    insert_transfer(&transaction, transfer)?;
    transaction.commit()?;
    Ok(())
}

fn write_session(transaction: &Connection, session: &Session) -> Result<bool, DbError> {
    let closing = session.closing();

    let changed = transaction.execute(
        "INSERT INTO sessions (
            id, station_id, created_at, started_at, timer_minutes, timer_notified, cost_limit,
            state, paused_since, ended_at, closing_policy, final_amount, gaming_total,
            orders_total, charges_total, transferred_in_total, transferred_out_id, version)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15, ?16, ?17, ?18)
         ON CONFLICT (id) DO UPDATE SET
            station_id = excluded.station_id,
            started_at = excluded.started_at,
            timer_minutes = excluded.timer_minutes,
            timer_notified = excluded.timer_notified,
            cost_limit = excluded.cost_limit,
            state = excluded.state,
            paused_since = excluded.paused_since,
            ended_at = excluded.ended_at,
            closing_policy = excluded.closing_policy,
            final_amount = excluded.final_amount,
            gaming_total = excluded.gaming_total,
            orders_total = excluded.orders_total,
            charges_total = excluded.charges_total,
            transferred_in_total = excluded.transferred_in_total,
            transferred_out_id = excluded.transferred_out_id,
            version = excluded.version
         WHERE excluded.version > sessions.version",
        params![
            session.id().0,
            session.station_id().0,
            session.created_at().0,
            session.started_at().0,
            session.timer_minutes(),
            session.timer_notified(),
            session.cost_limit().map(|limit| limit.0),
            session.state().as_str(),
            session.paused_since().map(|since| since.0),
            closing.map(|closing| closing.ended_at.0),
            closing.map(|closing| closing.policy.as_str()),
            closing.map(|closing| closing.final_amount.0),
            closing.map(|closing| closing.true_total.gaming.0),
            closing.map(|closing| closing.true_total.orders.0),
            closing.map(|closing| closing.true_total.charges.0),
            closing.map(|closing| closing.true_total.transferred_in.0),
            closing.and_then(|closing| closing.transferred_out.map(|id| id.0)),
            i64::try_from(session.version()).unwrap_or(i64::MAX),
        ],
    )?;
    if changed == 0 {
        return Ok(false);
    }

    let session_id = session.id().0;
    transaction.execute("DELETE FROM segments WHERE session_id = ?1", [session_id])?;
    transaction.execute("DELETE FROM pauses WHERE session_id = ?1", [session_id])?;
    transaction.execute("DELETE FROM charges WHERE session_id = ?1", [session_id])?;

    for (seq, segment) in session.segments().segments().iter().enumerate() {
        transaction.execute(
            "INSERT INTO segments (session_id, seq, mode, rate, started_at, ended_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
            params![
                session_id,
                seq as i64,
                segment.mode.as_str(),
                segment.rate_per_hour.0,
                segment.started_at.0,
                segment.ended_at.map(|at| at.0),
            ],
        )?;
    }

    for (seq, pause) in session.pauses().iter().enumerate() {
        transaction.execute(
            "INSERT INTO pauses (session_id, seq, started_at, ended_at) VALUES (?1, ?2, ?3, ?4)",
            params![session_id, seq as i64, pause.start.0, pause.end.0],
        )?;
    }

    for charge in session.charges().charges() {
        let transfer_id = match charge.origin {
            ChargeOrigin::Manual => None,
            ChargeOrigin::Transfer(id) => Some(id.0),
        };
        transaction.execute(
            "INSERT INTO charges (id, session_id, amount, reason, created_at, transfer_id)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
            params![
                charge.id.0,
                session_id,
                charge.amount.0,
                charge.reason,
                charge.created_at.0,
                transfer_id,
            ],
        )?;
    }

    Ok(true)
}

pub fn load_active_sessions(connection: &Connection) -> Result<Vec<Session>, DbError> {
    let ids = {
        let mut statement =
            connection.prepare("SELECT id FROM sessions WHERE state != 'ended' ORDER BY id")?;
        let rows = statement.query_map([], |row| row.get::<_, i64>(0))?;
        rows.collect::<Result<Vec<_>, _>>()?
    };

    ids.into_iter()
        .map(|id| {
            load_session(connection, SessionId(id))?
                .ok_or_else(|| DbError::corrupt("sessions", format!("session {id} vanished")))
        })
        .collect()
}

pub fn load_session(
    connection: &Connection,
    session_id: SessionId,
) -> Result<Option<Session>, DbError> {
    let header = connection
        .query_row(
            "SELECT id, station_id, created_at, started_at, timer_minutes, timer_notified,
                    cost_limit, state, paused_since, ended_at, closing_policy, final_amount,
                    gaming_total, orders_total, charges_total, transferred_in_total,
                    transferred_out_id, version
             FROM sessions WHERE id = ?1",
            [session_id.0],
            read_session_header,
        )
        .optional()?;

    let Some(header) = header else {
        return Ok(None);
    };

    let state = header.state()?;
    let segments = load_segments(connection, session_id)?;
    let pauses = load_pauses(connection, session_id)?;
    let charges = load_charges(connection, session_id)?;

    Ok(Some(Session::from_parts(SessionParts {
        id: session_id,
        station_id: StationId(header.station_id),
        created_at: TimestampMs(header.created_at),
        started_at: TimestampMs(header.started_at),
        timer_minutes: header.timer_minutes,
        timer_notified: header.timer_notified,
        cost_limit: header.cost_limit.map(Piasters),
        state,
        pauses,
        segments,
        charges,
        version: u64::try_from(header.version).unwrap_or_default(),
    })))
}

struct SessionHeader {
    station_id: i64,
    created_at: i64,
    started_at: i64,
    timer_minutes: Option<u32>,
    timer_notified: bool,
    cost_limit: Option<i64>,
    state: String,
    paused_since: Option<i64>,
    ended_at: Option<i64>,
    closing_policy: Option<String>,
    final_amount: Option<i64>,
    gaming_total: Option<i64>,
    orders_total: Option<i64>,
    charges_total: Option<i64>,
    transferred_in_total: Option<i64>,
    transferred_out_id: Option<i64>,
    version: i64,
}

fn read_session_header(row: &Row<'_>) -> rusqlite::Result<SessionHeader> {
    Ok(SessionHeader {
        station_id: row.get(1)?,
        created_at: row.get(2)?,
        started_at: row.get(3)?,
        timer_minutes: row.get(4)?,
        timer_notified: row.get(5)?,
        cost_limit: row.get(6)?,
        state: row.get(7)?,
        paused_since: row.get(8)?,
        ended_at: row.get(9)?,
        closing_policy: row.get(10)?,
        final_amount: row.get(11)?,
        gaming_total: row.get(12)?,
        orders_total: row.get(13)?,
        charges_total: row.get(14)?,
        transferred_in_total: row.get(15)?,
        transferred_out_id: row.get(16)?,
        version: row.get(17)?,
    })
}

impl SessionHeader {
    fn state(&self) -> Result<SessionState, DbError> {
        match self.state.as_str() {
            "running" => Ok(SessionState::Running),
            "paused" => {
                let since = self
                    .paused_since
                    .ok_or_else(|| DbError::corrupt("sessions", "paused without paused_since"))?;
                Ok(SessionState::Paused {
                    since: TimestampMs(since),
                })
            }
            "ended" => Ok(SessionState::Ended(self.closing()?)),
            other => Err(DbError::corrupt(
                "sessions",
                format!("unknown state {other}"),
            )),
        }
    }

    fn closing(&self) -> Result<Closing, DbError> {
        let missing = |field: &str| DbError::corrupt("sessions", format!("ended without {field}"));

        let final_amount = Piasters(self.final_amount.ok_or_else(|| missing("final_amount"))?);
        let policy = match self.closing_policy.as_deref() {
            Some("rounded") => ClosingPolicy::Rounded,
            Some("zero") => ClosingPolicy::Zero,
            Some("custom") => ClosingPolicy::Custom(final_amount),
            _ => return Err(missing("closing_policy")),
        };

        Ok(Closing {
            ended_at: TimestampMs(self.ended_at.ok_or_else(|| missing("ended_at"))?),
            policy,
            final_amount,
            true_total: TrueTotal {
                gaming: Piasters(self.gaming_total.unwrap_or_default()),
                orders: Piasters(self.orders_total.unwrap_or_default()),
                charges: Piasters(self.charges_total.unwrap_or_default()),
                transferred_in: Piasters(self.transferred_in_total.unwrap_or_default()),
            },
            transferred_out: self.transferred_out_id.map(TransferId),
        })
    }
}

fn load_segments(connection: &Connection, session_id: SessionId) -> Result<SegmentLedger, DbError> {
    let mut statement = connection.prepare(
        "SELECT mode, rate, started_at, ended_at FROM segments WHERE session_id = ?1 ORDER BY seq",
    )?;
    let rows = statement.query_map([session_id.0], |row| {
        Ok((
            row.get::<_, String>(0)?,
            row.get::<_, i64>(1)?,
            row.get::<_, i64>(2)?,
            row.get::<_, Option<i64>>(3)?,
        ))
    })?;

    let mut segments = Vec::new();
    for row in rows {
        let (mode, rate, started_at, ended_at) = row?;
        let mode = mode
            .parse::<BillingMode>()
            .map_err(|error| DbError::corrupt("segments", error))?;
        segments.push(Segment {
            mode,
            rate_per_hour: Piasters(rate),
            started_at: TimestampMs(started_at),
            ended_at: ended_at.map(TimestampMs),
        });
    }

    Ok(SegmentLedger::from_segments(segments))
}

fn load_pauses(connection: &Connection, session_id: SessionId) -> Result<Vec<TimeRange>, DbError> {
    let mut statement = connection.prepare(
        "SELECT started_at, ended_at FROM pauses WHERE session_id = ?1 ORDER BY seq",
    )?;
    let rows = statement.query_map([session_id.0], |row| {
        Ok(TimeRange::new(
            TimestampMs(row.get(0)?),
            TimestampMs(row.get(1)?),
        ))
    })?;

    Ok(rows.collect::<Result<Vec<_>, _>>()?)
}

fn load_charges(connection: &Connection, session_id: SessionId) -> Result<ChargeLedger, DbError> {
    let mut statement = connection.prepare(
        "SELECT id, amount, reason, created_at, transfer_id
         FROM charges WHERE session_id = ?1 ORDER BY id",
    )?;
    let rows = statement.query_map([session_id.0], |row| {
        let transfer_id: Option<i64> = row.get(4)?;
        Ok(Charge {
            id: ChargeId(row.get(0)?),
            amount: Piasters(row.get(1)?),
            reason: row.get(2)?,
            created_at: TimestampMs(row.get(3)?),
            origin: transfer_id.map_or(ChargeOrigin::Manual, |id| {
                ChargeOrigin::Transfer(TransferId(id))
            }),
        })
    })?;

    Ok(ChargeLedger::from_charges(
        rows.collect::<Result<Vec<_>, _>>()?,
    ))
}

pub fn insert_transfer(connection: &Connection, transfer: &Transfer) -> Result<(), DbError> {
    connection.execute(
        "INSERT INTO transfers (id, from_session_id, from_station_id, to_session_id, to_station_id,
                                amount, includes_orders, created_at)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)
         ON CONFLICT (id) DO NOTHING",
        params![
            transfer.id.0,
            transfer.from_session_id.0,
            transfer.from_station_id.0,
            transfer.to_session_id.0,
            transfer.to_station_id.0,
            transfer.amount.0,
            transfer.includes_orders,
            transfer.created_at.0,
        ],
    )?;

    Ok(())
}

pub fn list_transfers(connection: &Connection, limit: u32) -> Result<Vec<Transfer>, DbError> {
    let mut statement = connection.prepare(
        "SELECT id, from_session_id, from_station_id, to_session_id, to_station_id, amount,
                includes_orders, created_at
         FROM transfers
         ORDER BY created_at DESC, id DESC
         LIMIT ?1",
    )?;

    let rows = statement.query_map([i64::from(limit)], |row| {
        Ok(Transfer {
            id: TransferId(row.get(0)?),
            from_session_id: SessionId(row.get(1)?),
            from_station_id: StationId(row.get(2)?),
            to_session_id: SessionId(row.get(3)?),
            to_station_id: StationId(row.get(4)?),
            amount: Piasters(row.get(5)?),
            includes_orders: row.get(6)?,
            created_at: TimestampMs(row.get(7)?),
        })
    })?;

    Ok(rows.collect::<Result<Vec<_>, _>>()?)
}

pub fn orders_total(connection: &Connection, session_id: SessionId) -> Result<Piasters, DbError> {
    let total: i64 = connection.query_row(
        "SELECT COALESCE(SUM(quantity * price_snapshot), 0) FROM orders WHERE session_id = ?1",
        [session_id.0],
        |row| row.get(0),
    )?;
    Ok(Piasters(total))
}

/// Ended sessions, most recent first.
pub fn list_ended_sessions(
    connection: &Connection,
    limit: u32,
    offset: u32,
) -> Result<Vec<Session>, DbError> {
    let ids = {
        let mut statement = connection.prepare(
            "SELECT id FROM sessions
             WHERE state = 'ended'
             ORDER BY ended_at DESC, id DESC
             LIMIT ?1 OFFSET ?2",
        )?;
        let rows = statement.query_map(params![i64::from(limit), i64::from(offset)], |row| {
            row.get::<_, i64>(0)
        })?;
        rows.collect::<Result<Vec<_>, _>>()?
    };

    let mut sessions = Vec::with_capacity(ids.len());
    for id in ids {
        if let Some(session) = load_session(connection, SessionId(id))? {
            sessions.push(session);
        }
    }
    Ok(sessions)
}

pub fn count_sessions(connection: &Connection) -> Result<i64, DbError> {
    let count = connection.query_row("SELECT COUNT(*) FROM sessions", [], |row| row.get(0))?;
    Ok(count)
}

pub fn count_active_sessions(connection: &Connection) -> Result<i64, DbError> {
    let count = connection.query_row(
        "SELECT COUNT(*) FROM sessions WHERE state != 'ended'",
        [],
        |row| row.get(0),
    )?;
    Ok(count)
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct IdWatermarks {
    pub station: i64,
    pub session: i64,
    pub charge: i64,
    pub transfer: i64,
}

/// Highest id in use per table, so freshly allocated ids never collide.
pub fn id_watermarks(connection: &Connection) -> Result<IdWatermarks, DbError> {
    let max = |table: &str| -> Result<i64, DbError> {
        let value: i64 = connection.query_row(
            &format!("SELECT COALESCE(MAX(id), 0) FROM {table}"),
            [],
            |row| row.get(0),
        )?;
        Ok(value)
    };

    Ok(IdWatermarks {
        station: max("stations")?,
        session: max("sessions")?,
        charge: max("charges")?,
        transfer: max("transfers")?,
    })
}
