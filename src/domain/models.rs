use std::fmt;

use serde::{Deserialize, Serialize};

use crate::domain::money::Piasters;
use crate::domain::rates::StationRates;
use crate::domain::time::TimestampMs;

macro_rules! id_type {
    ($name:ident) => {
        #[derive(
            Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
        )]
        #[serde(transparent)]
        pub struct $name(pub i64);

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}", self.0)
            }
        }
    };
}

id_type!(StationId);
id_type!(SessionId);
id_type!(ChargeId);
id_type!(TransferId);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StationStatus {
    Available,
    Occupied { session_id: SessionId },
    Maintenance,
}

impl StationStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Available => "available",
            Self::Occupied { .. } => "occupied",
            Self::Maintenance => "maintenance",
        }
    }

    pub fn active_session(&self) -> Option<SessionId> {
        match self {
            Self::Occupied { session_id } => Some(*session_id),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Station {
    pub id: StationId,
    pub name: String,
    pub rates: StationRates,
    pub status: StationStatus,
    pub reachable: bool,
    /// Address the router reports the console under.
    pub network_address: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewStation {
    pub name: String,
    pub rates: StationRates,
    pub network_address: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Transfer {
    pub id: TransferId,
    pub from_session_id: SessionId,
    pub from_station_id: StationId,
    pub to_session_id: SessionId,
    pub to_station_id: StationId,
    pub amount: Piasters,
    pub includes_orders: bool,
    pub created_at: TimestampMs,
}
