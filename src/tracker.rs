//! Delivery tracker: per-event delivery state, claims and attempt recording.
//!
//! Every status transition is a conditional update on `status = 'pending'`,
//! so concurrent ticks and racing dispatch completions can never record two
//! successes for the same event.
use crate::db::{self, Pool, RecordOutcome};
use crate::error::StoreError;
use crate::model::{AttemptOutcome, ChannelKind, EventStatus};
use chrono::{DateTime, Duration, Utc};
use tracing::debug;
use uuid::Uuid;

/// Exclusive reservation of one event for one delivery run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Claim {
    pub event_id: String,
    pub token: String,
    pub until: DateTime<Utc>,
}

#[derive(Debug, Clone)]
pub struct DeliveryTracker {
    pool: Pool,
    max_attempts: u32,
    claim_lease: Duration,
}

impl DeliveryTracker {
    pub fn new(pool: Pool, max_attempts: u32, claim_lease: Duration) -> Self {
        Self {
            pool,
            max_attempts: max_attempts.max(1),
            claim_lease,
        }
    }

    pub fn max_attempts(&self) -> u32 {
        self.max_attempts
    }

    /// True unless the event is gone, no longer pending, already has a
    /// success, or has used its whole attempt budget.
    pub async fn should_attempt(&self, event_id: &str) -> Result<bool, StoreError> {
        let Some(state) = db::delivery_state(&self.pool, event_id).await? else {
            return Ok(false);
        };
        Ok(state.status == EventStatus::Pending
            && state.successes == 0
            && state.attempts < i64::from(self.max_attempts))
    }

    /// Attempts already recorded for the event.
    pub async fn attempts(&self, event_id: &str) -> Result<i64, StoreError> {
        Ok(db::delivery_state(&self.pool, event_id)
            .await?
            .map(|s| s.attempts)
            .unwrap_or(0))
    }

    /// Reserve the event for delivery. `None` when another delivery holds it.
    pub async fn try_claim(
        &self,
        event_id: &str,
        now: DateTime<Utc>,
    ) -> Result<Option<Claim>, StoreError> {
        let token = Uuid::new_v4().to_string();
        let until = now + self.claim_lease;
        if db::claim_event(&self.pool, event_id, &token, now, until).await? {
            Ok(Some(Claim {
                event_id: event_id.to_string(),
                token,
                until,
            }))
        } else {
            debug!(event_id, "event already claimed");
            Ok(None)
        }
    }

    /// Push the lease of a held claim out by another `claim_lease`. False when
    /// the claim is gone: taken over after expiry, dropped by a reschedule,
    /// or the event is no longer pending. The holder must stop delivering.
    pub async fn renew(&self, claim: &mut Claim, now: DateTime<Utc>) -> Result<bool, StoreError> {
        let until = now + self.claim_lease;
        if !db::renew_claim(&self.pool, &claim.event_id, &claim.token, until).await? {
            debug!(event_id = %claim.event_id, "claim lost");
            return Ok(false);
        }
        claim.until = until;
        Ok(true)
    }

    /// Drop a claim without changing the event status.
    pub async fn release(&self, claim: &Claim) -> Result<(), StoreError> {
        db::release_claim(&self.pool, &claim.event_id, &claim.token).await?;
        Ok(())
    }

    /// Append an attempt made under `claim`; success and permanent failure
    /// settle the status. Attempts from a claim that was lost are discarded.
    pub async fn record_attempt(
        &self,
        claim: &Claim,
        outcome: AttemptOutcome,
        channel: ChannelKind,
        at: DateTime<Utc>,
        error: Option<&str>,
    ) -> Result<RecordOutcome, StoreError> {
        db::record_attempt(
            &self.pool,
            &claim.event_id,
            Some(&claim.token),
            outcome,
            channel,
            at,
            error,
            self.max_attempts,
        )
        .await
    }

    /// Take a due row that cannot be decoded out of the queue.
    pub async fn fail_unreadable(&self, event_id: &str, now: DateTime<Utc>) -> Result<bool, StoreError> {
        db::fail_pending_event(&self.pool, event_id, now).await
    }

    /// Mark a still-pending event failed once its budget is gone. Returns
    /// false when it was not pending or still has attempts left.
    pub async fn fail_if_exhausted(
        &self,
        event_id: &str,
        now: DateTime<Utc>,
    ) -> Result<bool, StoreError> {
        let Some(state) = db::delivery_state(&self.pool, event_id).await? else {
            return Ok(false);
        };
        if state.status != EventStatus::Pending || state.attempts < i64::from(self.max_attempts) {
            return Ok(false);
        }
        db::fail_pending_event(&self.pool, event_id, now).await
    }
}
