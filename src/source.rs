//! Event source adapter: read-only view of due events.
use crate::db::{self, DueBatch, Pool};
use crate::error::StoreError;
use crate::model::ScheduledEvent;
use chrono::{DateTime, Utc};

#[derive(Debug, Clone)]
pub struct EventSource {
    pool: Pool,
    batch_size: u32,
}

impl EventSource {
    pub fn new(pool: Pool, batch_size: u32) -> Self {
        Self {
            pool,
            batch_size: batch_size.max(1),
        }
    }

    /// Pending events with `target_at <= as_of`, earliest first, ties by id.
    ///
    /// At most `batch_size` events are returned; the rest stay due and are
    /// returned by the next call in the same order.
    pub async fn list_due(&self, as_of: DateTime<Utc>) -> Result<Vec<ScheduledEvent>, StoreError> {
        Ok(self.poll(as_of).await?.events)
    }

    /// Like [`list_due`](Self::list_due), also reporting rows that could not
    /// be decoded so the caller can take them out of the queue.
    pub async fn poll(&self, as_of: DateTime<Utc>) -> Result<DueBatch, StoreError> {
        db::list_due_events(&self.pool, as_of, self.batch_size).await
    }
}
