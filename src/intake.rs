//! Business-layer write path: turns appointments and check-in plans into
//! scheduled events, reschedules them, and cancels them.
use crate::db::{self, Pool, UpsertOutcome};
use crate::error::StoreError;
use crate::model::{ChannelKind, NewEvent, SubjectType};
use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;
use tracing::{debug, info};

#[derive(Debug, Error)]
pub enum IntakeError {
    #[error("payload must be a JSON object")]
    PayloadNotObject,
    #[error("recurrence interval must be between 1 second and 366 days")]
    InvalidRecurrence,
    #[error("at least one lead time is required")]
    NoLeadTimes,
    #[error(transparent)]
    Store(#[from] StoreError),
}

/// Longest accepted recurrence interval (one leap year).
pub const MAX_RECURRENCE_SECS: i64 = 366 * 86_400;

fn valid_recurrence(secs: i64) -> bool {
    (1..=MAX_RECURRENCE_SECS).contains(&secs)
}

/// An appointment slot that should produce reminders ahead of its start.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct AppointmentReminder {
    pub appointment_id: String,
    pub recipient_id: String,
    pub channel: ChannelKind,
    pub starts_at: DateTime<Utc>,
    pub payload: Value,
}

/// A recurring mood-tracking check-in.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct CheckInPlan {
    pub plan_id: String,
    pub recipient_id: String,
    pub channel: ChannelKind,
    pub first_at: DateTime<Utc>,
    pub every_secs: i64,
    pub payload: Value,
}

/// What happened to one lead time of an appointment.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LeadOutcome {
    Scheduled(UpsertOutcome),
    /// Lead time already passed; any pending reminder for it was cancelled.
    Elapsed { cancelled: bool },
}

pub fn appointment_event_id(appointment_id: &str, lead_minutes: u32) -> String {
    format!("appointment:{}:{}m", appointment_id, lead_minutes)
}

/// Create or reschedule one event. Non-pending events keep their target.
pub async fn schedule_event(
    pool: &Pool,
    event: &NewEvent,
    now: DateTime<Utc>,
) -> Result<UpsertOutcome, IntakeError> {
    if !event.payload.is_object() {
        return Err(IntakeError::PayloadNotObject);
    }
    if matches!(event.recurrence_secs, Some(s) if !valid_recurrence(s)) {
        return Err(IntakeError::InvalidRecurrence);
    }
    let outcome = db::upsert_event(pool, event, now).await?;
    match outcome {
        UpsertOutcome::Immutable(status) => {
            debug!(event_id = %event.id, status = status.as_str(), "event no longer pending; left as is")
        }
        _ => info!(event_id = %event.id, target_at = %event.target_at, ?outcome, "event scheduled"),
    }
    Ok(outcome)
}

/// One reminder per lead time, keyed so a rescheduled appointment updates
/// its reminders in place.
pub async fn schedule_appointment(
    pool: &Pool,
    reminder: &AppointmentReminder,
    lead_minutes: &[u32],
    now: DateTime<Utc>,
) -> Result<Vec<(String, LeadOutcome)>, IntakeError> {
    if lead_minutes.is_empty() {
        return Err(IntakeError::NoLeadTimes);
    }
    let mut results = Vec::with_capacity(lead_minutes.len());
    for &lead in lead_minutes {
        let id = appointment_event_id(&reminder.appointment_id, lead);
        let target_at = reminder.starts_at - Duration::minutes(i64::from(lead));
        if target_at <= now {
            let cancelled = db::cancel_event(pool, &id, now).await?;
            results.push((id, LeadOutcome::Elapsed { cancelled }));
            continue;
        }
        let event = NewEvent {
            id: id.clone(),
            subject_type: SubjectType::Appointment,
            subject_id: reminder.appointment_id.clone(),
            recipient_id: reminder.recipient_id.clone(),
            channel: reminder.channel,
            target_at,
            payload: reminder.payload.clone(),
            recurrence_secs: None,
        };
        let outcome = schedule_event(pool, &event, now).await?;
        results.push((id, LeadOutcome::Scheduled(outcome)));
    }
    Ok(results)
}

/// Create the first occurrence of a recurring check-in. Later occurrences
/// are created when the previous one is dispatched.
pub async fn schedule_check_in(
    pool: &Pool,
    plan: &CheckInPlan,
    now: DateTime<Utc>,
) -> Result<(String, UpsertOutcome), IntakeError> {
    if !valid_recurrence(plan.every_secs) {
        return Err(IntakeError::InvalidRecurrence);
    }
    let id = db::occurrence_id(SubjectType::CheckIn, &plan.plan_id, plan.first_at);
    let event = NewEvent {
        id: id.clone(),
        subject_type: SubjectType::CheckIn,
        subject_id: plan.plan_id.clone(),
        recipient_id: plan.recipient_id.clone(),
        channel: plan.channel,
        target_at: plan.first_at,
        payload: plan.payload.clone(),
        recurrence_secs: Some(plan.every_secs),
    };
    let outcome = schedule_event(pool, &event, now).await?;
    Ok((id, outcome))
}

/// Cancel every pending event of an appointment or check-in plan.
pub async fn cancel_subject(
    pool: &Pool,
    subject_type: SubjectType,
    subject_id: &str,
    now: DateTime<Utc>,
) -> Result<u64, IntakeError> {
    let n = db::cancel_subject(pool, subject_type, subject_id, now).await?;
    info!(subject_type = subject_type.as_str(), subject_id, cancelled = n, "subject cancelled");
    Ok(n)
}
