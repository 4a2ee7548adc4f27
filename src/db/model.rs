//! Row types and view models returned by repositories.
//!
//! Keep these structs focused on the data returned by queries. Delivery policy
//! lives in the tracker and dispatcher.

use crate::error::StoreError;
use crate::model::{
    AttemptOutcome, ChannelKind, DeliveryAttempt, EventStatus, ScheduledEvent, SubjectType,
};
use chrono::{DateTime, Utc};
use serde::Serialize;

/// Columns selected for every `scheduled_events` read, in `EventRow` order.
pub(crate) const EVENT_COLUMNS: &str = "e.id, e.subject_type, e.subject_id, e.recipient_id, \
     e.channel, e.target_at, e.payload, e.status, e.recurrence_secs, e.created_at, e.updated_at";

pub(crate) fn to_millis(at: DateTime<Utc>) -> i64 {
    at.timestamp_millis()
}

pub(crate) fn from_millis(ms: i64) -> Result<DateTime<Utc>, StoreError> {
    DateTime::from_timestamp_millis(ms)
        .ok_or_else(|| StoreError::Corrupt(format!("timestamp {} out of range", ms)))
}

#[derive(Debug, Clone, sqlx::FromRow)]
pub(crate) struct EventRow {
    pub id: String,
    pub subject_type: String,
    pub subject_id: String,
    pub recipient_id: String,
    pub channel: String,
    pub target_at: i64,
    pub payload: String,
    pub status: String,
    pub recurrence_secs: Option<i64>,
    pub created_at: i64,
    pub updated_at: i64,
}

impl TryFrom<EventRow> for ScheduledEvent {
    type Error = StoreError;

    fn try_from(row: EventRow) -> Result<Self, Self::Error> {
        let subject_type = SubjectType::parse_subject(&row.subject_type).ok_or_else(|| {
            StoreError::Corrupt(format!(
                "event {} has unknown subject type {}",
                row.id, row.subject_type
            ))
        })?;
        let channel = ChannelKind::parse_channel(&row.channel).ok_or_else(|| {
            StoreError::Corrupt(format!("event {} has unknown channel {}", row.id, row.channel))
        })?;
        let status = EventStatus::parse_status(&row.status).ok_or_else(|| {
            StoreError::Corrupt(format!("event {} has unknown status {}", row.id, row.status))
        })?;
        let payload = serde_json::from_str(&row.payload).map_err(|err| {
            StoreError::Corrupt(format!("event {} payload is not JSON: {}", row.id, err))
        })?;

        Ok(ScheduledEvent {
            subject_type,
            subject_id: row.subject_id,
            recipient_id: row.recipient_id,
            channel,
            target_at: from_millis(row.target_at)?,
            payload,
            status,
            recurrence_secs: row.recurrence_secs,
            created_at: from_millis(row.created_at)?,
            updated_at: from_millis(row.updated_at)?,
            id: row.id,
        })
    }
}

#[derive(Debug, Clone, sqlx::FromRow)]
pub(crate) struct AttemptRow {
    pub event_id: String,
    pub attempt_no: i64,
    pub attempted_at: i64,
    pub outcome: String,
    pub channel: String,
    pub error: Option<String>,
}

impl TryFrom<AttemptRow> for DeliveryAttempt {
    type Error = StoreError;

    fn try_from(row: AttemptRow) -> Result<Self, Self::Error> {
        let outcome = AttemptOutcome::parse_outcome(&row.outcome).ok_or_else(|| {
            StoreError::Corrupt(format!("attempt has unknown outcome {}", row.outcome))
        })?;
        let channel = ChannelKind::parse_channel(&row.channel).ok_or_else(|| {
            StoreError::Corrupt(format!("attempt has unknown channel {}", row.channel))
        })?;
        Ok(DeliveryAttempt {
            event_id: row.event_id,
            attempt_no: row.attempt_no,
            attempted_at: from_millis(row.attempted_at)?,
            outcome,
            channel,
            error: row.error,
        })
    }
}

/// Delivery overlay of one event, as seen by the tracker.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DeliveryState {
    pub status: EventStatus,
    pub attempts: i64,
    pub successes: i64,
}

/// Result of the business-layer upsert.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum UpsertOutcome {
    Inserted,
    /// A pending event had its target time, recipient or payload replaced.
    /// Any claim on it was dropped.
    Updated,
    /// Pending and already identical; the row and its claim were left alone.
    Unchanged,
    /// The event is dispatched, failed or cancelled; nothing was changed.
    Immutable(EventStatus),
}

/// One pass over due rows.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct DueBatch {
    pub events: Vec<ScheduledEvent>,
    /// Ids of due rows that could not be decoded.
    pub unreadable: Vec<String>,
}

/// Result of recording one delivery attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecordOutcome {
    Dispatched { attempt_no: i64 },
    /// Transient failure with budget left; the caller may retry.
    RetryScheduled { attempt_no: i64 },
    Failed { attempt_no: i64 },
    /// The event left `pending`, or the claim moved to another delivery,
    /// before this attempt was recorded. The attempt was discarded.
    Superseded,
}

/// Failed event plus the context an operator needs to act on it.
#[derive(Debug, Clone, Serialize)]
pub struct FailedEvent {
    pub event: ScheduledEvent,
    pub attempts: i64,
    pub last_error: Option<String>,
}
