use super::model::{
    from_millis, to_millis, AttemptRow, DeliveryState, DueBatch, EventRow, FailedEvent,
    RecordOutcome, UpsertOutcome, EVENT_COLUMNS,
};
use crate::error::StoreError;
use crate::model::{
    AttemptOutcome, ChannelKind, DeliveryAttempt, EventStatus, NewEvent, ScheduledEvent,
    SubjectType,
};
use anyhow::Result;
use chrono::{DateTime, Utc};
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions, SqliteSynchronous};
use sqlx::{FromRow, Row, Sqlite, SqlitePool, Transaction};
use std::str::FromStr;
use std::time::Duration;
use tracing::{debug, instrument, warn};

pub type Pool = SqlitePool;

pub async fn init_pool(database_url: &str) -> Result<Pool> {
    let normalized = prepare_sqlite_url(database_url);
    // WAL so the admin CLI can read while the service writes.
    let options = SqliteConnectOptions::from_str(&normalized)?
        .create_if_missing(true)
        .journal_mode(SqliteJournalMode::Wal)
        .synchronous(SqliteSynchronous::Full)
        .busy_timeout(Duration::from_secs(5));
    let pool = SqlitePoolOptions::new().connect_with(options).await?;
    Ok(pool)
}

/// If using a file-backed SQLite URL, expand a leading `~/` and ensure the parent
/// directory exists. Leaves in-memory URLs untouched. Returns possibly-updated URL.
fn prepare_sqlite_url(url: &str) -> String {
    if !url.starts_with("sqlite:") || url.starts_with("sqlite::memory") {
        return url.to_string();
    }

    let rest = &url["sqlite:".len()..];
    let path_with_query = rest.strip_prefix("//").unwrap_or(rest);
    let (path_part, query_part) = match path_with_query.split_once('?') {
        Some((p, q)) => (p, Some(q)),
        None => (path_with_query, None),
    };
    if path_part.is_empty() {
        return url.to_string();
    }

    let expanded_path = match (path_part.strip_prefix("~/"), std::env::var("HOME")) {
        (Some(rest), Ok(home)) => format!("{}/{}", home.trim_end_matches('/'), rest),
        _ => path_part.to_string(),
    };

    if let Some(parent) = std::path::Path::new(&expanded_path).parent() {
        if !parent.as_os_str().is_empty() {
            let _ = std::fs::create_dir_all(parent);
        }
    }

    let mut rebuilt = String::from("sqlite://");
    rebuilt.push_str(&expanded_path);
    if let Some(q) = query_part {
        rebuilt.push('?');
        rebuilt.push_str(q);
    }
    rebuilt
}

pub async fn run_migrations(pool: &Pool) -> Result<()> {
    sqlx::migrate!("./migrations").run(pool).await?;
    Ok(())
}

// ---- business-layer write path -------------------------------------------

/// Insert a new event, or reschedule it if it is still pending.
#[instrument(skip_all, fields(event_id = %event.id))]
pub async fn upsert_event(
    pool: &Pool,
    event: &NewEvent,
    now: DateTime<Utc>,
) -> Result<UpsertOutcome, StoreError> {
    let payload = serde_json::to_string(&event.payload)
        .map_err(|err| StoreError::Corrupt(format!("payload not serializable: {}", err)))?;
    let now_ms = to_millis(now);
    let mut tx = pool.begin().await?;

    let inserted = sqlx::query(
        "INSERT OR IGNORE INTO scheduled_events \
         (id, subject_type, subject_id, recipient_id, channel, target_at, payload, status, recurrence_secs, created_at, updated_at) \
         VALUES (?, ?, ?, ?, ?, ?, ?, 'pending', ?, ?, ?)",
    )
    .bind(&event.id)
    .bind(event.subject_type.as_str())
    .bind(&event.subject_id)
    .bind(&event.recipient_id)
    .bind(event.channel.as_str())
    .bind(to_millis(event.target_at))
    .bind(&payload)
    .bind(event.recurrence_secs)
    .bind(now_ms)
    .bind(now_ms)
    .execute(&mut *tx)
    .await?
    .rows_affected();
    if inserted == 1 {
        tx.commit().await?;
        return Ok(UpsertOutcome::Inserted);
    }

    // Target time only moves while pending. A changed event loses its claim,
    // so a delivery built from the old row can neither send nor settle it.
    let updated = sqlx::query(
        "UPDATE scheduled_events SET recipient_id = ?, channel = ?, target_at = ?, payload = ?, \
         recurrence_secs = ?, claim_token = NULL, claimed_until = NULL, updated_at = ? \
         WHERE id = ? AND status = 'pending' \
           AND (recipient_id IS NOT ? OR channel IS NOT ? OR target_at IS NOT ? \
                OR payload IS NOT ? OR recurrence_secs IS NOT ?)",
    )
    .bind(&event.recipient_id)
    .bind(event.channel.as_str())
    .bind(to_millis(event.target_at))
    .bind(&payload)
    .bind(event.recurrence_secs)
    .bind(now_ms)
    .bind(&event.id)
    .bind(&event.recipient_id)
    .bind(event.channel.as_str())
    .bind(to_millis(event.target_at))
    .bind(&payload)
    .bind(event.recurrence_secs)
    .execute(&mut *tx)
    .await?
    .rows_affected();
    if updated == 1 {
        tx.commit().await?;
        return Ok(UpsertOutcome::Updated);
    }

    let status: String = sqlx::query_scalar("SELECT status FROM scheduled_events WHERE id = ?")
        .bind(&event.id)
        .fetch_one(&mut *tx)
        .await?;
    tx.rollback().await?;
    let status = EventStatus::parse_status(&status)
        .ok_or_else(|| StoreError::Corrupt(format!("event {} has unknown status", event.id)))?;
    if status == EventStatus::Pending {
        return Ok(UpsertOutcome::Unchanged);
    }
    Ok(UpsertOutcome::Immutable(status))
}

/// Cancel every pending event of a subject. Returns the number cancelled.
#[instrument(skip_all)]
pub async fn cancel_subject(
    pool: &Pool,
    subject_type: SubjectType,
    subject_id: &str,
    now: DateTime<Utc>,
) -> Result<u64, StoreError> {
    let res = sqlx::query(
        "UPDATE scheduled_events SET status = 'cancelled', claim_token = NULL, claimed_until = NULL, updated_at = ? \
         WHERE subject_type = ? AND subject_id = ? AND status = 'pending'",
    )
    .bind(to_millis(now))
    .bind(subject_type.as_str())
    .bind(subject_id)
    .execute(pool)
    .await?;
    Ok(res.rows_affected())
}

/// Cancel one event if it is still pending.
#[instrument(skip_all)]
pub async fn cancel_event(pool: &Pool, event_id: &str, now: DateTime<Utc>) -> Result<bool, StoreError> {
    let res = sqlx::query(
        "UPDATE scheduled_events SET status = 'cancelled', claim_token = NULL, claimed_until = NULL, updated_at = ? \
         WHERE id = ? AND status = 'pending'",
    )
    .bind(to_millis(now))
    .bind(event_id)
    .execute(pool)
    .await?;
    Ok(res.rows_affected() == 1)
}

// ---- reads ---------------------------------------------------------------

#[instrument(skip_all)]
pub async fn fetch_event(pool: &Pool, id: &str) -> Result<Option<ScheduledEvent>, StoreError> {
    let row: Option<EventRow> = sqlx::query_as(&format!(
        "SELECT {} FROM scheduled_events e WHERE e.id = ?",
        EVENT_COLUMNS
    ))
    .bind(id)
    .fetch_optional(pool)
    .await?;
    row.map(ScheduledEvent::try_from).transpose()
}

/// Pending events due at `as_of`, earliest first, ties broken by id.
/// Rows that cannot be decoded are logged and returned by id only.
#[instrument(skip_all)]
pub async fn list_due_events(
    pool: &Pool,
    as_of: DateTime<Utc>,
    limit: u32,
) -> Result<DueBatch, StoreError> {
    let rows: Vec<EventRow> = sqlx::query_as(&format!(
        "SELECT {} FROM scheduled_events e WHERE e.status = 'pending' AND e.target_at <= ? \
         ORDER BY e.target_at ASC, e.id ASC LIMIT ?",
        EVENT_COLUMNS
    ))
    .bind(to_millis(as_of))
    .bind(i64::from(limit))
    .fetch_all(pool)
    .await?;

    let mut batch = DueBatch::default();
    for row in rows {
        let id = row.id.clone();
        match ScheduledEvent::try_from(row) {
            Ok(event) => batch.events.push(event),
            Err(err) => {
                warn!(event_id = %id, %err, "unreadable event row");
                batch.unreadable.push(id);
            }
        }
    }
    Ok(batch)
}

/// Decode rows, logging and dropping the ones that do not parse.
fn decode_events(rows: Vec<EventRow>) -> Vec<ScheduledEvent> {
    rows.into_iter()
        .filter_map(|row| {
            let id = row.id.clone();
            ScheduledEvent::try_from(row)
                .map_err(|err| warn!(event_id = %id, %err, "unreadable event row skipped"))
                .ok()
        })
        .collect()
}

#[instrument(skip_all)]
pub async fn list_subject_events(
    pool: &Pool,
    subject_type: SubjectType,
    subject_id: &str,
) -> Result<Vec<ScheduledEvent>, StoreError> {
    let rows: Vec<EventRow> = sqlx::query_as(&format!(
        "SELECT {} FROM scheduled_events e WHERE e.subject_type = ? AND e.subject_id = ? \
         ORDER BY e.target_at ASC, e.id ASC",
        EVENT_COLUMNS
    ))
    .bind(subject_type.as_str())
    .bind(subject_id)
    .fetch_all(pool)
    .await?;
    Ok(decode_events(rows))
}

/// Most recently failed events, for operator review.
#[instrument(skip_all)]
pub async fn list_failed_events(pool: &Pool, limit: u32) -> Result<Vec<FailedEvent>, StoreError> {
    let rows = sqlx::query(&format!(
        "SELECT {}, \
           (SELECT COUNT(*) FROM delivery_attempts a WHERE a.event_id = e.id) AS attempts, \
           (SELECT a.error FROM delivery_attempts a WHERE a.event_id = e.id \
              ORDER BY a.attempt_no DESC LIMIT 1) AS last_error \
         FROM scheduled_events e WHERE e.status = 'failed' \
         ORDER BY e.updated_at DESC, e.id ASC LIMIT ?",
        EVENT_COLUMNS
    ))
    .bind(i64::from(limit))
    .fetch_all(pool)
    .await?;

    let mut failed = Vec::with_capacity(rows.len());
    for row in rows {
        let attempts: i64 = row.try_get("attempts")?;
        let last_error: Option<String> = row.try_get("last_error")?;
        let event_row = EventRow::from_row(&row)?;
        let id = event_row.id.clone();
        match ScheduledEvent::try_from(event_row) {
            Ok(event) => failed.push(FailedEvent {
                event,
                attempts,
                last_error,
            }),
            Err(err) => warn!(event_id = %id, %err, "unreadable event row skipped"),
        }
    }
    Ok(failed)
}

#[instrument(skip_all)]
pub async fn list_attempts(pool: &Pool, event_id: &str) -> Result<Vec<DeliveryAttempt>, StoreError> {
    let rows: Vec<AttemptRow> = sqlx::query_as(
        "SELECT event_id, attempt_no, attempted_at, outcome, channel, error \
         FROM delivery_attempts WHERE event_id = ? ORDER BY attempt_no ASC",
    )
    .bind(event_id)
    .fetch_all(pool)
    .await?;
    rows.into_iter().map(DeliveryAttempt::try_from).collect()
}

#[instrument(skip_all)]
pub async fn delivery_state(pool: &Pool, event_id: &str) -> Result<Option<DeliveryState>, StoreError> {
    let row = sqlx::query(
        "SELECT e.status, \
           (SELECT COUNT(*) FROM delivery_attempts a WHERE a.event_id = e.id) AS attempts, \
           (SELECT COUNT(*) FROM delivery_attempts a WHERE a.event_id = e.id AND a.outcome = 'success') AS successes \
         FROM scheduled_events e WHERE e.id = ?",
    )
    .bind(event_id)
    .fetch_optional(pool)
    .await?;
    let Some(row) = row else {
        return Ok(None);
    };
    let status: String = row.try_get("status")?;
    let status = EventStatus::parse_status(&status)
        .ok_or_else(|| StoreError::Corrupt(format!("event {} has unknown status", event_id)))?;
    Ok(Some(DeliveryState {
        status,
        attempts: row.try_get("attempts")?,
        successes: row.try_get("successes")?,
    }))
}

// ---- delivery overlay ----------------------------------------------------

/// Reserve a pending event for one delivery until `until`. Expired claims are
/// taken over, so a crashed process never strands an event.
#[instrument(skip_all)]
pub async fn claim_event(
    pool: &Pool,
    event_id: &str,
    token: &str,
    now: DateTime<Utc>,
    until: DateTime<Utc>,
) -> Result<bool, StoreError> {
    let res = sqlx::query(
        "UPDATE scheduled_events SET claim_token = ?, claimed_until = ? \
         WHERE id = ? AND status = 'pending' AND (claimed_until IS NULL OR claimed_until <= ?)",
    )
    .bind(token)
    .bind(to_millis(until))
    .bind(event_id)
    .bind(to_millis(now))
    .execute(pool)
    .await?;
    Ok(res.rows_affected() == 1)
}

#[instrument(skip_all)]
pub async fn release_claim(pool: &Pool, event_id: &str, token: &str) -> Result<bool, StoreError> {
    let res = sqlx::query(
        "UPDATE scheduled_events SET claim_token = NULL, claimed_until = NULL \
         WHERE id = ? AND claim_token = ?",
    )
    .bind(event_id)
    .bind(token)
    .execute(pool)
    .await?;
    Ok(res.rows_affected() == 1)
}

/// Extend a claim still held under `token`. False once the claim was lost:
/// taken over after expiry, dropped by a reschedule, or the event settled.
#[instrument(skip_all)]
pub async fn renew_claim(
    pool: &Pool,
    event_id: &str,
    token: &str,
    until: DateTime<Utc>,
) -> Result<bool, StoreError> {
    let res = sqlx::query(
        "UPDATE scheduled_events SET claimed_until = ? \
         WHERE id = ? AND status = 'pending' AND claim_token = ?",
    )
    .bind(to_millis(until))
    .bind(event_id)
    .bind(token)
    .execute(pool)
    .await?;
    Ok(res.rows_affected() == 1)
}

/// Close a pending event whose retry budget is already spent.
#[instrument(skip_all)]
pub async fn fail_pending_event(
    pool: &Pool,
    event_id: &str,
    now: DateTime<Utc>,
) -> Result<bool, StoreError> {
    let res = sqlx::query(
        "UPDATE scheduled_events SET status = 'failed', claim_token = NULL, claimed_until = NULL, updated_at = ? \
         WHERE id = ? AND status = 'pending'",
    )
    .bind(to_millis(now))
    .bind(event_id)
    .execute(pool)
    .await?;
    Ok(res.rows_affected() == 1)
}

/// Append one attempt and apply its status transition in a single transaction.
///
/// The conditional status update runs first; if the event is no longer
/// pending, or `claim_token` no longer matches, the attempt is discarded and
/// `Superseded` is returned. `None` skips the claim check.
#[allow(clippy::too_many_arguments)]
#[instrument(skip_all, fields(event_id = %event_id, outcome = outcome.as_str()))]
pub async fn record_attempt(
    pool: &Pool,
    event_id: &str,
    claim_token: Option<&str>,
    outcome: AttemptOutcome,
    channel: ChannelKind,
    at: DateTime<Utc>,
    error: Option<&str>,
    max_attempts: u32,
) -> Result<RecordOutcome, StoreError> {
    let at_ms = to_millis(at);
    let mut tx = pool.begin().await?;

    let guard_sql = match outcome {
        AttemptOutcome::Success => {
            "UPDATE scheduled_events SET status = 'dispatched', claim_token = NULL, claimed_until = NULL, updated_at = ? \
             WHERE id = ? AND status = 'pending' AND (? IS NULL OR claim_token = ?)"
        }
        AttemptOutcome::PermanentFailure => {
            "UPDATE scheduled_events SET status = 'failed', claim_token = NULL, claimed_until = NULL, updated_at = ? \
             WHERE id = ? AND status = 'pending' AND (? IS NULL OR claim_token = ?)"
        }
        AttemptOutcome::TransientFailure => {
            "UPDATE scheduled_events SET updated_at = ? \
             WHERE id = ? AND status = 'pending' AND (? IS NULL OR claim_token = ?)"
        }
    };
    let guarded = sqlx::query(guard_sql)
        .bind(at_ms)
        .bind(event_id)
        .bind(claim_token)
        .bind(claim_token)
        .execute(&mut *tx)
        .await?
        .rows_affected();
    if guarded == 0 {
        tx.rollback().await?;
        debug!("event no longer pending or claim lost; attempt discarded");
        return Ok(RecordOutcome::Superseded);
    }

    let attempt_no: i64 = sqlx::query_scalar(
        "INSERT INTO delivery_attempts (event_id, attempt_no, attempted_at, outcome, channel, error) \
         SELECT ?, COALESCE(MAX(attempt_no), 0) + 1, ?, ?, ?, ? FROM delivery_attempts WHERE event_id = ? \
         RETURNING attempt_no",
    )
    .bind(event_id)
    .bind(at_ms)
    .bind(outcome.as_str())
    .bind(channel.as_str())
    .bind(error)
    .bind(event_id)
    .fetch_one(&mut *tx)
    .await?;

    let result = match outcome {
        AttemptOutcome::Success => {
            schedule_next_occurrence(&mut tx, event_id, at_ms).await?;
            RecordOutcome::Dispatched { attempt_no }
        }
        AttemptOutcome::PermanentFailure => RecordOutcome::Failed { attempt_no },
        AttemptOutcome::TransientFailure if attempt_no >= i64::from(max_attempts) => {
            sqlx::query(
                "UPDATE scheduled_events SET status = 'failed', claim_token = NULL, claimed_until = NULL \
                 WHERE id = ? AND status = 'pending'",
            )
            .bind(event_id)
            .execute(&mut *tx)
            .await?;
            RecordOutcome::Failed { attempt_no }
        }
        AttemptOutcome::TransientFailure => RecordOutcome::RetryScheduled { attempt_no },
    };

    tx.commit().await?;
    Ok(result)
}

/// Id of a recurring occurrence, stable so re-creating it is idempotent.
pub fn occurrence_id(subject_type: SubjectType, subject_id: &str, target_at: DateTime<Utc>) -> String {
    format!(
        "{}:{}:{}",
        subject_type.as_str(),
        subject_id,
        to_millis(target_at)
    )
}

/// First occurrence of a series strictly after `now_ms`. `None` when the
/// step is not positive or the result leaves the representable range.
pub(crate) fn next_occurrence_ms(target_ms: i64, step_ms: i64, now_ms: i64) -> Option<i64> {
    if step_ms <= 0 {
        return None;
    }
    let mut next = target_ms.checked_add(step_ms)?;
    if next <= now_ms {
        let behind = now_ms.checked_sub(next)? / step_ms + 1;
        next = next.checked_add(behind.checked_mul(step_ms)?)?;
    }
    Some(next)
}

async fn schedule_next_occurrence(
    tx: &mut Transaction<'_, Sqlite>,
    event_id: &str,
    now_ms: i64,
) -> Result<(), StoreError> {
    let row: EventRow = sqlx::query_as(&format!(
        "SELECT {} FROM scheduled_events e WHERE e.id = ?",
        EVENT_COLUMNS
    ))
    .bind(event_id)
    .fetch_one(&mut **tx)
    .await?;
    let Some(step_secs) = row.recurrence_secs.filter(|s| *s > 0) else {
        return Ok(());
    };
    let subject_type = SubjectType::parse_subject(&row.subject_type)
        .ok_or_else(|| StoreError::Corrupt(format!("event {} has unknown subject type", event_id)))?;

    // An interval too large to represent ends the series; the dispatch itself
    // still commits.
    let next = step_secs
        .checked_mul(1000)
        .and_then(|step_ms| next_occurrence_ms(row.target_at, step_ms, now_ms))
        .and_then(|ms| from_millis(ms).ok().map(|at| (ms, at)));
    let Some((next_ms, next_at)) = next else {
        warn!(event_id, step_secs, "next occurrence out of range; series ended");
        return Ok(());
    };
    let next_id = occurrence_id(subject_type, &row.subject_id, next_at);
    sqlx::query(
        "INSERT OR IGNORE INTO scheduled_events \
         (id, subject_type, subject_id, recipient_id, channel, target_at, payload, status, recurrence_secs, created_at, updated_at) \
         VALUES (?, ?, ?, ?, ?, ?, ?, 'pending', ?, ?, ?)",
    )
    .bind(&next_id)
    .bind(&row.subject_type)
    .bind(&row.subject_id)
    .bind(&row.recipient_id)
    .bind(&row.channel)
    .bind(next_ms)
    .bind(&row.payload)
    .bind(step_secs)
    .bind(now_ms)
    .bind(now_ms)
    .execute(&mut **tx)
    .await?;
    debug!(next_id, "scheduled next occurrence");
    Ok(())
}

// ---- retention -----------------------------------------------------------

/// Delete terminal events last touched before `cutoff`, with their attempts.
#[instrument(skip_all)]
pub async fn purge_terminal_before(pool: &Pool, cutoff: DateTime<Utc>) -> Result<u64, StoreError> {
    let cutoff_ms = to_millis(cutoff);
    let mut tx = pool.begin().await?;
    sqlx::query(
        "DELETE FROM delivery_attempts WHERE event_id IN \
         (SELECT id FROM scheduled_events WHERE status <> 'pending' AND updated_at < ?)",
    )
    .bind(cutoff_ms)
    .execute(&mut *tx)
    .await?;
    let purged = sqlx::query("DELETE FROM scheduled_events WHERE status <> 'pending' AND updated_at < ?")
        .bind(cutoff_ms)
        .execute(&mut *tx)
        .await?
        .rows_affected();
    tx.commit().await?;
    Ok(purged)
}

#[instrument(skip_all)]
pub async fn count_by_status(pool: &Pool, status: EventStatus) -> Result<i64, StoreError> {
    let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM scheduled_events WHERE status = ?")
        .bind(status.as_str())
        .fetch_one(pool)
        .await?;
    Ok(count)
}
