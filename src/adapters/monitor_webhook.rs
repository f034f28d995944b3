use std::sync::Arc;
use std::sync::mpsc::{self, Receiver, Sender};
use std::thread::JoinHandle;
use std::time::Duration;

use serde::Serialize;
use thiserror::Error;
use uuid::Uuid;

use crate::domain::events::{BillingEvent, EventSink, TracingEventSink};
use crate::domain::time::{Clock, timestamp_to_iso8601};

const HTTP_TIMEOUT_SECONDS: u64 = 5;

#[derive(Debug, Error)]
pub enum WebhookError {
    #[error("failed to build webhook http client: {0}")]
    Build(#[from] reqwest::Error),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct MonitorEnvelope {
    pub event_id: String,
    pub emitted_at: String,
    pub event: BillingEvent,
}

impl MonitorEnvelope {
    pub fn new(event: BillingEvent, clock: &dyn Clock) -> Self {
        Self {
            event_id: Uuid::new_v4().to_string(),
            emitted_at: timestamp_to_iso8601(clock.now()),
            event,
        }
    }
}

/// Logs every event and queues it for delivery to the monitor webhook.
/// Delivery happens on a dedicated thread; `publish` never blocks.
pub struct MonitorWebhookSink {
    sender: Sender<MonitorEnvelope>,
    clock: Arc<dyn Clock>,
    log: TracingEventSink,
}

impl MonitorWebhookSink {
    pub fn spawn(
        url: &str,
        clock: Arc<dyn Clock>,
    ) -> Result<(Self, JoinHandle<()>), WebhookError> {
        let http = reqwest::blocking::Client::builder()
            .timeout(Duration::from_secs(HTTP_TIMEOUT_SECONDS))
            .build()?;
        let (sender, receiver) = mpsc::channel();
        let url = url.to_string();

        let handle = std::thread::spawn(move || deliver_events(http, url, receiver));

        Ok((
            Self {
                sender,
                clock,
                log: TracingEventSink,
            },
            handle,
        ))
    }
}

impl EventSink for MonitorWebhookSink {
    fn publish(&self, event: BillingEvent) {
        self.log.publish(event);

        let envelope = MonitorEnvelope::new(event, self.clock.as_ref());
        if self.sender.send(envelope).is_err() {
            tracing::warn!(
                session_id = %event.session_id(),
                "monitor webhook worker stopped; event dropped"
            );
        }
    }
}

fn deliver_events(
    http: reqwest::blocking::Client,
    url: String,
    receiver: Receiver<MonitorEnvelope>,
) {
    for envelope in receiver {
        let result = http
            .post(&url)
            .json(&envelope)
            .send()
            .and_then(|response| response.error_for_status());

        match result {
            Ok(_) => tracing::debug!(event_id = %envelope.event_id, "monitor event delivered"),
            Err(error) => tracing::warn!(
                error = %error,
                event_id = %envelope.event_id,
                "monitor event delivery failed"
            ),
        }
    }
}
