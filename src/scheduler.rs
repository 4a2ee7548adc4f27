//! Scheduler loop: ticks, batches and storage backoff.
use crate::clock::Clock;
use crate::config::SchedulerSettings;
use crate::db::{self, Pool};
use crate::dispatcher::Dispatcher;
use crate::error::StoreError;
use crate::model::ScheduledEvent;
use crate::source::EventSource;
use crate::tracker::DeliveryTracker;
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::oneshot;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// Per-batch counts.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct BatchReport {
    pub due: usize,
    pub submitted: usize,
    pub skipped: usize,
    /// Pending events closed as failed because their attempts were used up.
    pub exhausted: usize,
    /// Due rows that could not be decoded; they are marked failed.
    pub unreadable: usize,
}

/// Snapshot of the tick loop for operators and tests.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct LoopStatus {
    /// Ticks the loop has run, skipped ones included.
    pub ticks: u64,
    /// Storage-unavailable ticks since the last good one.
    pub consecutive_failures: u32,
    /// Wait before the next tick, as last computed.
    pub next_delay_ms: u64,
}

/// Spacing between ticks: the regular interval, or capped exponential
/// backoff while storage stays unavailable.
#[derive(Debug, Clone)]
pub struct TickPacer {
    interval: Duration,
    max_backoff: Duration,
    failures: u32,
}

impl TickPacer {
    pub fn new(interval: Duration, max_backoff: Duration) -> Self {
        Self {
            interval,
            max_backoff,
            failures: 0,
        }
    }

    pub fn failures(&self) -> u32 {
        self.failures
    }

    /// Returns how many failures preceded this success.
    pub fn on_success(&mut self) -> u32 {
        std::mem::take(&mut self.failures)
    }

    pub fn on_unavailable(&mut self) {
        self.failures = self.failures.saturating_add(1);
    }

    /// Wait before the next tick, given how long this one took.
    pub fn next_delay(&self, elapsed: Duration) -> Duration {
        if self.failures > 0 {
            backoff_delay(self.interval, self.max_backoff, self.failures)
        } else {
            self.interval.saturating_sub(elapsed)
        }
    }
}

enum Admission {
    Submitted,
    Skipped,
    Exhausted,
}

/// Resets the running flag when a batch ends, including on early return.
struct RunningGuard<'a>(&'a AtomicBool);

impl Drop for RunningGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

pub struct Scheduler {
    pool: Pool,
    source: EventSource,
    tracker: DeliveryTracker,
    dispatcher: Dispatcher,
    clock: Arc<dyn Clock>,
    settings: SchedulerSettings,
    running: AtomicBool,
    ticks: AtomicU64,
    failures: AtomicU32,
    next_delay_ms: AtomicU64,
}

impl Scheduler {
    pub fn new(
        pool: Pool,
        tracker: DeliveryTracker,
        dispatcher: Dispatcher,
        clock: Arc<dyn Clock>,
        settings: SchedulerSettings,
    ) -> Self {
        Self {
            source: EventSource::new(pool.clone(), settings.batch_size),
            pool,
            tracker,
            dispatcher,
            clock,
            settings,
            running: AtomicBool::new(false),
            ticks: AtomicU64::new(0),
            failures: AtomicU32::new(0),
            next_delay_ms: AtomicU64::new(0),
        }
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::Acquire)
    }

    pub fn status(&self) -> LoopStatus {
        LoopStatus {
            ticks: self.ticks.load(Ordering::Relaxed),
            consecutive_failures: self.failures.load(Ordering::Relaxed),
            next_delay_ms: self.next_delay_ms.load(Ordering::Relaxed),
        }
    }

    /// Process one batch of due events. `Ok(None)` when another batch is
    /// still running and this tick was skipped.
    pub async fn run_batch(&self) -> Result<Option<BatchReport>, StoreError> {
        if self.running.swap(true, Ordering::AcqRel) {
            info!("previous batch still running; tick skipped");
            return Ok(None);
        }
        let _guard = RunningGuard(&self.running);

        let now = self.clock.now();
        let batch = self.source.poll(now).await?;
        let mut report = BatchReport {
            due: batch.events.len() + batch.unreadable.len(),
            ..BatchReport::default()
        };

        for event_id in &batch.unreadable {
            match self.tracker.fail_unreadable(event_id, now).await {
                Ok(_) => {
                    error!(event_id = %event_id, "unreadable event marked failed");
                    report.unreadable += 1;
                }
                Err(err) if err.is_unavailable() => return Err(err),
                Err(err) => warn!(?err, event_id = %event_id, "could not fail unreadable event"),
            }
        }

        for event in batch.events {
            let event_id = event.id.clone();
            match self.admit(event, now).await {
                Ok(Admission::Submitted) => report.submitted += 1,
                Ok(Admission::Skipped) => report.skipped += 1,
                Ok(Admission::Exhausted) => report.exhausted += 1,
                Err(err) if err.is_unavailable() => return Err(err),
                Err(err) => {
                    warn!(?err, event_id, "event skipped this tick");
                    report.skipped += 1;
                }
            }
        }
        Ok(Some(report))
    }

    async fn admit(&self, event: ScheduledEvent, now: DateTime<Utc>) -> Result<Admission, StoreError> {
        if !self.tracker.should_attempt(&event.id).await? {
            if self.tracker.fail_if_exhausted(&event.id, now).await? {
                warn!(event_id = %event.id, "attempts exhausted; event marked failed");
                return Ok(Admission::Exhausted);
            }
            return Ok(Admission::Skipped);
        }
        let Some(claim) = self.tracker.try_claim(&event.id, now).await? else {
            return Ok(Admission::Skipped);
        };
        debug!(event_id = %event.id, target_at = %event.target_at, "submitting event");
        self.dispatcher.submit(event, claim);
        Ok(Admission::Submitted)
    }

    /// Delete terminal events older than the retention window.
    pub async fn purge_expired(&self) -> Result<u64, StoreError> {
        let cutoff = self.clock.now() - chrono::Duration::days(i64::from(self.settings.retention_days));
        db::purge_terminal_before(&self.pool, cutoff).await
    }

    /// Tick until `cancel` fires. `ready` is signalled once the first tick is
    /// scheduled. A batch in progress always runs to completion. Only
    /// storage outages back off; other batch errors wait one interval.
    pub async fn run(self: Arc<Self>, cancel: CancellationToken, ready: oneshot::Sender<()>) {
        let interval = self.settings.tick_interval();
        let sweep_every = Duration::from_secs(self.settings.retention_sweep_secs);
        let mut pacer = TickPacer::new(interval, self.settings.max_backoff());
        let mut next_delay = Duration::ZERO;
        let mut last_sweep: Option<Instant> = None;

        info!(tick_secs = interval.as_secs(), "scheduler loop started");
        let _ = ready.send(());

        loop {
            tokio::select! {
                biased;
                _ = cancel.cancelled() => break,
                _ = tokio::time::sleep(next_delay) => {}
            }

            let started = Instant::now();
            let outcome = self.run_batch().await;
            self.ticks.fetch_add(1, Ordering::Relaxed);
            match outcome {
                Ok(Some(report)) => {
                    let recovered = pacer.on_success();
                    if recovered > 0 {
                        info!(failures = recovered, "storage reachable again");
                    }
                    let c = self.dispatcher.counters();
                    info!(
                        due = report.due,
                        submitted = report.submitted,
                        skipped = report.skipped,
                        exhausted = report.exhausted,
                        unreadable = report.unreadable,
                        dispatched = c.dispatched,
                        retried = c.retried,
                        failed = c.failed,
                        abandoned = c.abandoned,
                        "batch complete"
                    );
                }
                Ok(None) => {}
                Err(err) if err.is_unavailable() => {
                    pacer.on_unavailable();
                    warn!(?err, failures = pacer.failures(), "storage unavailable; backing off");
                }
                Err(err) => error!(?err, "batch failed"),
            }
            self.failures.store(pacer.failures(), Ordering::Relaxed);

            if pacer.failures() == 0
                && self.settings.retention_days > 0
                && last_sweep.map_or(true, |at| at.elapsed() >= sweep_every)
            {
                last_sweep = Some(Instant::now());
                match self.purge_expired().await {
                    Ok(0) => {}
                    Ok(purged) => info!(purged, "retention sweep"),
                    Err(err) => warn!(?err, "retention sweep failed"),
                }
            }

            let elapsed = started.elapsed();
            if elapsed > interval {
                let missed = elapsed.as_millis() / interval.as_millis().max(1);
                warn!(elapsed_ms = elapsed.as_millis() as u64, missed = missed as u64, "batch overran tick interval");
            }
            next_delay = pacer.next_delay(elapsed);
            self.next_delay_ms
                .store(u64::try_from(next_delay.as_millis()).unwrap_or(u64::MAX), Ordering::Relaxed);
        }

        info!("scheduler loop stopped");
    }
}

/// `interval * 2^failures`, capped at `max`.
pub fn backoff_delay(interval: Duration, max: Duration, failures: u32) -> Duration {
    let factor = 1_u32 << failures.min(16);
    interval.saturating_mul(factor).min(max)
}
