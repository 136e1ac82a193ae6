//! Notification and audit delivery for committed events.
//!
//! Sinks hang off the event bus: a [`SinkWorker`] thread subscribes, and
//! every committed envelope goes to the audit sink while the notable ones
//! also go to the notification sink. Delivery failures are logged and
//! dropped; they never reach the operation that produced the event.

use std::sync::{Arc, mpsc};
use std::thread;
use std::time::Duration;

use serde_json::Value as JsonValue;
use thiserror::Error;
use tracing::warn;

use stockledger_core::CompanyId;
use stockledger_events::{CompanyScoped, EventBus, EventEnvelope, Subscription};

#[derive(Debug, Error, Clone, PartialEq, Eq)]
#[error("sink delivery failed: {0}")]
pub struct SinkError(pub String);

pub trait NotificationSink: Send + Sync {
    fn notify(&self, event: &EventEnvelope<JsonValue>) -> Result<(), SinkError>;
}

pub trait AuditSink: Send + Sync {
    fn record(&self, event: &EventEnvelope<JsonValue>) -> Result<(), SinkError>;
}

/// Events people are told about: postings, movement decisions, fulfilled
/// documents and closure milestones.
pub fn is_notable(event_type: &str) -> bool {
    matches!(
        event_type,
        "inventory.movement.posted"
            | "inventory.movement.status_changed"
            | "inventory.lot.status_changed"
            | "documents.purchase.received"
            | "documents.dispatch.dispatched"
            | "documents.donation.received"
            | "documents.adjustment.processed"
            | "documents.transfer.shipped"
            | "documents.transfer.received"
    ) || event_type.starts_with("closing.closure.")
}

/// Audit trail as structured log lines.
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingAuditSink;

impl AuditSink for TracingAuditSink {
    fn record(&self, event: &EventEnvelope<JsonValue>) -> Result<(), SinkError> {
        tracing::info!(
            target: "stockledger::audit",
            event_id = %event.event_id(),
            company_id = %event.company_id(),
            aggregate_type = event.aggregate_type(),
            aggregate_id = %event.aggregate_id(),
            event_type = event.event_type(),
            sequence = event.sequence_number(),
            occurred_at = %event.occurred_at(),
            "audit"
        );
        Ok(())
    }
}

/// Drops notifications; for deployments without a delivery channel.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopNotifications;

impl NotificationSink for NoopNotifications {
    fn notify(&self, _event: &EventEnvelope<JsonValue>) -> Result<(), SinkError> {
        Ok(())
    }
}

#[derive(Clone)]
pub struct Sinks {
    pub notifications: Arc<dyn NotificationSink>,
    pub audit: Arc<dyn AuditSink>,
}

impl Default for Sinks {
    fn default() -> Self {
        Self {
            notifications: Arc::new(NoopNotifications),
            audit: Arc::new(TracingAuditSink),
        }
    }
}

impl core::fmt::Debug for Sinks {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("Sinks").finish_non_exhaustive()
    }
}

impl Sinks {
    /// Hand one committed event to the sinks. Never fails.
    pub fn deliver(&self, event: &EventEnvelope<JsonValue>) {
        if let Err(err) = self.audit.record(event) {
            warn!(event_type = event.event_type(), error = %err, "audit sink failed");
        }
        if is_notable(event.event_type()) {
            if let Err(err) = self.notifications.notify(event) {
                warn!(event_type = event.event_type(), error = %err, "notification sink failed");
            }
        }
    }
}

/// Handle to stop and join a sink worker.
#[derive(Debug)]
pub struct WorkerHandle {
    shutdown: mpsc::Sender<()>,
    join: Option<thread::JoinHandle<()>>,
}

impl WorkerHandle {
    pub fn shutdown(mut self) {
        let _ = self.shutdown.send(());
        if let Some(j) = self.join.take() {
            let _ = j.join();
        }
    }
}

#[derive(Debug)]
pub struct SinkWorker;

impl SinkWorker {
    /// Spawn a thread delivering bus messages to `sinks`.
    ///
    /// With `company_id` set, messages of other companies are skipped.
    pub fn spawn<B>(
        name: &'static str,
        bus: &B,
        company_id: Option<CompanyId>,
        sinks: Sinks,
    ) -> std::io::Result<WorkerHandle>
    where
        B: EventBus<EventEnvelope<JsonValue>>,
    {
        let (shutdown_tx, shutdown_rx) = mpsc::channel::<()>();
        let sub = bus.subscribe();

        let join = thread::Builder::new()
            .name(name.to_string())
            .spawn(move || worker_loop(name, sub, shutdown_rx, company_id, &sinks))?;

        Ok(WorkerHandle {
            shutdown: shutdown_tx,
            join: Some(join),
        })
    }
}

fn worker_loop(
    name: &'static str,
    sub: Subscription<EventEnvelope<JsonValue>>,
    shutdown_rx: mpsc::Receiver<()>,
    company_id: Option<CompanyId>,
    sinks: &Sinks,
) {
    let tick = Duration::from_millis(250);

    loop {
        if shutdown_rx.try_recv().is_ok() {
            break;
        }

        match sub.recv_timeout(tick) {
            Ok(msg) => {
                if company_id.is_some_and(|c| CompanyScoped::company_id(&msg) != c) {
                    continue;
                }
                sinks.deliver(&msg);
            }
            Err(mpsc::RecvTimeoutError::Timeout) => continue,
            Err(mpsc::RecvTimeoutError::Disconnected) => {
                tracing::debug!(worker = name, "bus closed, sink worker stopping");
                break;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;
    use std::time::Instant;

    use chrono::Utc;
    use stockledger_events::InMemoryEventBus;
    use uuid::Uuid;

    #[derive(Default)]
    struct Recorder {
        seen: Mutex<Vec<String>>,
    }

    impl NotificationSink for Recorder {
        fn notify(&self, event: &EventEnvelope<JsonValue>) -> Result<(), SinkError> {
            self.seen.lock().unwrap().push(event.event_type().to_string());
            Ok(())
        }
    }

    struct Broken;

    impl AuditSink for Broken {
        fn record(&self, _event: &EventEnvelope<JsonValue>) -> Result<(), SinkError> {
            Err(SinkError("disk full".into()))
        }
    }

    fn envelope(company_id: CompanyId, event_type: &str) -> EventEnvelope<JsonValue> {
        EventEnvelope::new(
            Uuid::now_v7(),
            company_id,
            Uuid::now_v7(),
            "inventory.movement",
            event_type,
            1,
            Utc::now(),
            JsonValue::Null,
        )
    }

    #[test]
    fn only_notable_events_are_notified_and_audit_errors_are_swallowed() {
        let recorder = Arc::new(Recorder::default());
        let sinks = Sinks {
            notifications: recorder.clone(),
            audit: Arc::new(Broken),
        };
        let company = CompanyId::new();
        sinks.deliver(&envelope(company, "inventory.movement.recorded"));
        sinks.deliver(&envelope(company, "inventory.movement.posted"));
        sinks.deliver(&envelope(company, "closing.closure.closed"));

        assert_eq!(
            *recorder.seen.lock().unwrap(),
            vec!["inventory.movement.posted", "closing.closure.closed"]
        );
    }

    #[test]
    fn worker_delivers_its_company_only() {
        let bus: InMemoryEventBus<EventEnvelope<JsonValue>> = InMemoryEventBus::new();
        let recorder = Arc::new(Recorder::default());
        let (mine, theirs) = (CompanyId::new(), CompanyId::new());
        let handle = SinkWorker::spawn(
            "sinks-test",
            &bus,
            Some(mine),
            Sinks {
                notifications: recorder.clone(),
                audit: Arc::new(TracingAuditSink),
            },
        )
        .unwrap();

        bus.publish(envelope(theirs, "inventory.movement.posted")).unwrap();
        bus.publish(envelope(mine, "inventory.movement.posted")).unwrap();

        let deadline = Instant::now() + Duration::from_secs(2);
        while recorder.seen.lock().unwrap().is_empty() && Instant::now() < deadline {
            thread::sleep(Duration::from_millis(10));
        }
        handle.shutdown();
        assert_eq!(recorder.seen.lock().unwrap().len(), 1);
    }
}
