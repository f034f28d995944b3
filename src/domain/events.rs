use serde::Serialize;

use crate::domain::models::{SessionId, StationId};
use crate::domain::money::Piasters;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(tag = "type", rename_all = "camelCase", rename_all_fields = "camelCase")]
pub enum BillingEvent {
    TimerExpired {
        session_id: SessionId,
        station_id: StationId,
        timer_minutes: u32,
    },
    SessionEnded {
        session_id: SessionId,
        final_amount: Piasters,
    },
}

impl BillingEvent {
    pub fn session_id(&self) -> SessionId {
        match self {
            Self::TimerExpired { session_id, .. } | Self::SessionEnded { session_id, .. } => {
                *session_id
            }
        }
    }
}

/// Fire-and-forget delivery; implementations must not block the caller.
pub trait EventSink: Send + Sync {
    fn publish(&self, event: BillingEvent);
}

#[derive(Debug, Clone, Copy, Default)]
pub struct TracingEventSink;

impl EventSink for TracingEventSink {
    fn publish(&self, event: BillingEvent) {
        match event {
            BillingEvent::TimerExpired {
                session_id,
                station_id,
                timer_minutes,
            } => tracing::info!(
                session_id = %session_id,
                station_id = %station_id,
                timer_minutes,
                "session timer expired"
            ),
            BillingEvent::SessionEnded {
                session_id,
                final_amount,
            } => tracing::info!(
                session_id = %session_id,
                final_amount = %final_amount,
                "session ended"
            ),
        }
    }
}
