use thiserror::Error;

use crate::domain::models::{ChargeId, SessionId, StationId};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    Precondition,
    NotFound,
    Conflict,
    Unavailable,
}

impl ErrorKind {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Precondition => "precondition",
            Self::NotFound => "not_found",
            Self::Conflict => "conflict",
            Self::Unavailable => "unavailable",
        }
    }
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum BillingError {
    #[error("session is already paused")]
    AlreadyPaused,
    #[error("session is not paused")]
    NotPaused,
    #[error("station {0} has no multi-mode rate")]
    ModeUnavailable(StationId),
    #[error("mode cannot be switched while the session is paused")]
    CannotSwitchWhilePaused,
    #[error("session {0} has already ended")]
    SessionEnded(SessionId),
    #[error("amount must be a positive number of piasters, got {0}")]
    InvalidAmount(i64),
    #[error("start time must not be in the future or past the first closed segment")]
    InvalidStartTime,
    #[error("a session cannot be transferred to itself")]
    SelfTransfer,
    #[error("target session {0} is not active")]
    TargetNotActive(SessionId),
    #[error("station {0} is no longer available")]
    StationNoLongerAvailable(StationId),
    #[error("station {0} already has an active session")]
    StationBusy(StationId),
    #[error("station {0} is under maintenance")]
    StationInMaintenance(StationId),
    #[error("a segment is already open")]
    SegmentAlreadyOpen,
    #[error("no segment is open")]
    NoOpenSegment,
    #[error("charge {0} was created by a transfer and cannot be changed")]
    ChargeNotEditable(ChargeId),
    #[error("unknown station {0}")]
    UnknownStation(StationId),
    #[error("unknown session {0}")]
    UnknownSession(SessionId),
    #[error("unknown charge {0}")]
    ChargeNotFound(ChargeId),
    #[error("session {0} changed concurrently; retry")]
    Conflict(SessionId),
    #[error("malformed reachability signal: {0}")]
    MalformedSignal(String),
    #[error("session state lock poisoned")]
    LockPoisoned,
    #[error("dependency unavailable: {0}")]
    Unavailable(String),
}

impl BillingError {
    pub fn unavailable<E: std::fmt::Display>(error: E) -> Self {
        Self::Unavailable(error.to_string())
    }

    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::UnknownStation(_) | Self::UnknownSession(_) | Self::ChargeNotFound(_) => {
                ErrorKind::NotFound
            }
            Self::Conflict(_) => ErrorKind::Conflict,
            Self::MalformedSignal(_) | Self::LockPoisoned | Self::Unavailable(_) => {
                ErrorKind::Unavailable
            }
            _ => ErrorKind::Precondition,
        }
    }
}
