use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use uuid::Uuid;

use stockledger_core::{CompanyId, DocumentId};
use stockledger_events::EventEnvelope;

use crate::error::StoreError;

/// A document event ready to be appended (no sequence number yet).
///
/// Built from a typed document event with [`UncommittedEvent::from_typed`],
/// which serializes the payload and captures the event metadata needed to
/// deserialize it again on load.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UncommittedEvent {
    pub event_id: Uuid,
    pub company_id: CompanyId,
    pub document_id: DocumentId,
    pub aggregate_type: String,

    pub event_type: String,
    pub event_version: u32,
    pub occurred_at: DateTime<Utc>,

    pub payload: JsonValue,
}

/// A persisted document event.
///
/// Sequence numbers start at 1, grow by one per event and are scoped to the
/// (company, document) stream. The last one is the document version used for
/// optimistic concurrency.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StoredEvent {
    pub event_id: Uuid,
    pub company_id: CompanyId,
    pub document_id: DocumentId,
    pub aggregate_type: String,

    pub sequence_number: u64,

    pub event_type: String,
    pub event_version: u32,
    pub occurred_at: DateTime<Utc>,

    pub payload: JsonValue,
}

impl StoredEvent {
    /// Envelope for publication once the unit of work commits.
    pub fn to_envelope(&self) -> EventEnvelope<JsonValue> {
        EventEnvelope::new(
            self.event_id,
            self.company_id,
            *self.document_id.as_uuid(),
            self.aggregate_type.clone(),
            self.event_type.clone(),
            self.sequence_number,
            self.occurred_at,
            self.payload.clone(),
        )
    }
}

impl UncommittedEvent {
    pub fn from_typed<E>(
        company_id: CompanyId,
        document_id: DocumentId,
        aggregate_type: impl Into<String>,
        event_id: Uuid,
        event: &E,
    ) -> Result<Self, StoreError>
    where
        E: stockledger_events::Event + Serialize,
    {
        let payload = serde_json::to_value(event)
            .map_err(|e| StoreError::Serialization(format!("payload serialization failed: {e}")))?;

        Ok(Self {
            event_id,
            company_id,
            document_id,
            aggregate_type: aggregate_type.into(),
            event_type: event.event_type().to_string(),
            event_version: event.version(),
            occurred_at: event.occurred_at(),
            payload,
        })
    }

    pub(crate) fn into_stored(self, sequence_number: u64) -> StoredEvent {
        StoredEvent {
            event_id: self.event_id,
            company_id: self.company_id,
            document_id: self.document_id,
            aggregate_type: self.aggregate_type,
            sequence_number,
            event_type: self.event_type,
            event_version: self.event_version,
            occurred_at: self.occurred_at,
            payload: self.payload,
        }
    }
}

/// All events of one batch must target the same stream and type.
pub(crate) fn validate_batch(events: &[UncommittedEvent]) -> Result<(), StoreError> {
    let Some(first) = events.first() else {
        return Ok(());
    };
    for (idx, e) in events.iter().enumerate() {
        if e.company_id != first.company_id {
            return Err(StoreError::Backend(format!(
                "batch contains multiple company_ids (index {idx})"
            )));
        }
        if e.document_id != first.document_id {
            return Err(StoreError::Backend(format!(
                "batch contains multiple document_ids (index {idx})"
            )));
        }
        if e.aggregate_type != first.aggregate_type {
            return Err(StoreError::Backend(format!(
                "batch contains multiple aggregate_types (index {idx})"
            )));
        }
    }
    Ok(())
}

pub(crate) fn stream_version(stream: &[StoredEvent]) -> u64 {
    stream.last().map(|e| e.sequence_number).unwrap_or(0)
}
