use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum EventStatus {
    Pending,
    Dispatched,
    Failed,
    Cancelled,
}

impl EventStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            EventStatus::Pending => "pending",
            EventStatus::Dispatched => "dispatched",
            EventStatus::Failed => "failed",
            EventStatus::Cancelled => "cancelled",
        }
    }

    pub fn parse_status(s: &str) -> Option<Self> {
        match s {
            "pending" => Some(EventStatus::Pending),
            "dispatched" => Some(EventStatus::Dispatched),
            "failed" => Some(EventStatus::Failed),
            "cancelled" => Some(EventStatus::Cancelled),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum SubjectType {
    Appointment,
    CheckIn,
}

impl SubjectType {
    pub fn as_str(&self) -> &'static str {
        match self {
            SubjectType::Appointment => "appointment",
            SubjectType::CheckIn => "check_in",
        }
    }

    pub fn parse_subject(s: &str) -> Option<Self> {
        match s {
            "appointment" => Some(SubjectType::Appointment),
            "check_in" => Some(SubjectType::CheckIn),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[serde(rename_all = "snake_case")]
pub enum ChannelKind {
    Email,
    Sms,
    Push,
}

impl ChannelKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ChannelKind::Email => "email",
            ChannelKind::Sms => "sms",
            ChannelKind::Push => "push",
        }
    }

    pub fn parse_channel(s: &str) -> Option<Self> {
        match s {
            "email" => Some(ChannelKind::Email),
            "sms" => Some(ChannelKind::Sms),
            "push" => Some(ChannelKind::Push),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum AttemptOutcome {
    Success,
    TransientFailure,
    PermanentFailure,
}

impl AttemptOutcome {
    pub fn as_str(&self) -> &'static str {
        match self {
            AttemptOutcome::Success => "success",
            AttemptOutcome::TransientFailure => "transient_failure",
            AttemptOutcome::PermanentFailure => "permanent_failure",
        }
    }

    pub fn parse_outcome(s: &str) -> Option<Self> {
        match s {
            "success" => Some(AttemptOutcome::Success),
            "transient_failure" => Some(AttemptOutcome::TransientFailure),
            "permanent_failure" => Some(AttemptOutcome::PermanentFailure),
            _ => None,
        }
    }
}

/// One notifiable occurrence tied to an appointment or a check-in plan.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ScheduledEvent {
    pub id: String,
    pub subject_type: SubjectType,
    pub subject_id: String,
    pub recipient_id: String,
    pub channel: ChannelKind,
    pub target_at: DateTime<Utc>,
    /// Template parameters, always a JSON object.
    pub payload: Value,
    pub status: EventStatus,
    /// Set for recurring check-ins; the next occurrence is created on success.
    pub recurrence_secs: Option<i64>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Input of the business-layer write path.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct NewEvent {
    pub id: String,
    pub subject_type: SubjectType,
    pub subject_id: String,
    pub recipient_id: String,
    pub channel: ChannelKind,
    pub target_at: DateTime<Utc>,
    pub payload: Value,
    pub recurrence_secs: Option<i64>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct DeliveryAttempt {
    pub event_id: String,
    pub attempt_no: i64,
    pub attempted_at: DateTime<Utc>,
    pub outcome: AttemptOutcome,
    pub channel: ChannelKind,
    pub error: Option<String>,
}
