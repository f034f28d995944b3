use std::sync::{Arc, Mutex};

use rusqlite::Connection;
use thiserror::Error;

use crate::adapters::db;
use crate::adapters::db::{DbError, IdWatermarks};
use crate::domain::models::{SessionId, Station, Transfer};
use crate::domain::money::Piasters;
use crate::domain::session::Session;

#[derive(Debug, Error)]
pub enum ServiceError {
    #[error("database lock poisoned")]
    DbLockPoisoned,
    #[error("database operation failed: {0}")]
    Database(#[from] DbError),
}

/// Durable image of the engine's records. Called without any session lock held.
pub trait BillingStore: Send + Sync {
    fn save_station(&self, station: &Station) -> Result<(), ServiceError>;
    fn save_session(&self, session: &Session) -> Result<(), ServiceError>;
    fn save_transfer(
        &self,
        transfer: &Transfer,
        from: &Session,
        to: &Session,
    ) -> Result<(), ServiceError>;
}

/// Read-only view of the food and drink orders billed to a session.
pub trait OrderLedger: Send + Sync {
    fn orders_total(&self, session_id: SessionId) -> Result<Piasters, ServiceError>;
}

pub trait BillingQueryHandler {
    fn load_session(&self, session_id: SessionId) -> Result<Option<Session>, ServiceError>;
    fn list_ended_sessions(&self, limit: u32, offset: u32) -> Result<Vec<Session>, ServiceError>;
    fn list_transfers(&self, limit: u32) -> Result<Vec<Transfer>, ServiceError>;
    fn get_schema_version(&self) -> Result<u32, ServiceError>;
    fn count_sessions(&self) -> Result<i64, ServiceError>;
    fn count_active_sessions(&self) -> Result<i64, ServiceError>;
}

#[derive(Debug, Clone, PartialEq)]
pub struct StoreSnapshot {
    pub stations: Vec<Station>,
    pub active_sessions: Vec<Session>,
    pub watermarks: IdWatermarks,
}

#[derive(Clone)]
pub struct SqliteBillingStore {
    connection: Arc<Mutex<Connection>>,
}

impl SqliteBillingStore {
    pub fn new(connection: Arc<Mutex<Connection>>) -> Self {
        Self { connection }
    }

    pub fn load_snapshot(&self) -> Result<StoreSnapshot, ServiceError> {
        self.with_connection(|connection| {
            Ok(StoreSnapshot {
                stations: db::list_stations(connection)?,
                active_sessions: db::load_active_sessions(connection)?,
                watermarks: db::id_watermarks(connection)?,
            })
        })
    }

    fn with_connection<T>(
        &self,
        op: impl FnOnce(&Connection) -> Result<T, DbError>,
    ) -> Result<T, ServiceError> {
        let connection = self
            .connection
            .lock()
            .map_err(|_| ServiceError::DbLockPoisoned)?;
        op(&connection).map_err(ServiceError::from)
    }
}

impl BillingStore for SqliteBillingStore {
    fn save_station(&self, station: &Station) -> Result<(), ServiceError> {
        self.with_connection(|connection| db::upsert_station(connection, station))
    }

    fn save_session(&self, session: &Session) -> Result<(), ServiceError> {
        let written = self.with_connection(|connection| db::save_session(connection, session))?;
        if !written {
            tracing::debug!(
                session_id = %session.id(),
                version = session.version(),
                "older session snapshot ignored"
            );
        }
        Ok(())
    }

    fn save_transfer(
        &self,
        transfer: &Transfer,
        from: &Session,
        to: &Session,
    ) -> Result<(), ServiceError> {
        self.with_connection(|connection| db::save_transfer(connection, transfer, from, to))
    }
}

impl OrderLedger for SqliteBillingStore {
    fn orders_total(&self, session_id: SessionId) -> Result<Piasters, ServiceError> {
        self.with_connection(|connection| db::orders_total(connection, session_id))
    }
}

impl BillingQueryHandler for SqliteBillingStore {
    fn load_session(&self, session_id: SessionId) -> Result<Option<Session>, ServiceError> {
        self.with_connection(|connection| db::load_session(connection, session_id))
    }

    fn list_ended_sessions(&self, limit: u32, offset: u32) -> Result<Vec<Session>, ServiceError> {
        self.with_connection(|connection| db::list_ended_sessions(connection, limit, offset))
    }

    fn list_transfers(&self, limit: u32) -> Result<Vec<Transfer>, ServiceError> {
        self.with_connection(|connection| db::list_transfers(connection, limit))
    }

    fn get_schema_version(&self) -> Result<u32, ServiceError> {
        self.with_connection(db::schema_version)
    }

    fn count_sessions(&self) -> Result<i64, ServiceError> {
        self.with_connection(db::count_sessions)
    }

    fn count_active_sessions(&self) -> Result<i64, ServiceError> {
        self.with_connection(db::count_active_sessions)
    }
}
