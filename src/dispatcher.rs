//! Dispatcher: delivers claimed events through the channel router.
//!
//! `submit` returns immediately; each delivery runs on its own task, bounded
//! by a semaphore, and records every attempt through the tracker. Transient
//! failures are retried with doubling backoff until the attempt budget is
//! spent. Cancellation abandons a delivery at its next suspension point and
//! releases its claim so the event stays pending.
use crate::channel::{ChannelError, MessageTemplates, Notification, NotificationChannel};
use crate::clock::Clock;
use crate::config::{DispatchSettings, StopPolicy};
use crate::db::RecordOutcome;
use crate::model::{AttemptOutcome, ScheduledEvent};
use crate::tracker::{Claim, DeliveryTracker};
use serde::Serialize;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, error, info, warn};

#[derive(Debug, Default)]
struct DispatchStats {
    submitted: AtomicU64,
    dispatched: AtomicU64,
    retried: AtomicU64,
    failed: AtomicU64,
    superseded: AtomicU64,
    abandoned: AtomicU64,
}

/// Running totals since the dispatcher was created.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct DispatchCounters {
    pub submitted: u64,
    pub dispatched: u64,
    pub retried: u64,
    pub failed: u64,
    pub superseded: u64,
    pub abandoned: u64,
}

/// What happened to in-flight deliveries during shutdown.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct ShutdownReport {
    pub in_flight: usize,
    pub abandoned: u64,
}

struct Inner {
    tracker: DeliveryTracker,
    channel: Arc<dyn NotificationChannel>,
    templates: MessageTemplates,
    clock: Arc<dyn Clock>,
    limiter: Arc<Semaphore>,
    settings: DispatchSettings,
    stats: DispatchStats,
}

#[derive(Clone)]
pub struct Dispatcher {
    inner: Arc<Inner>,
    tasks: TaskTracker,
    cancel: CancellationToken,
}

impl Dispatcher {
    pub fn new(
        tracker: DeliveryTracker,
        channel: Arc<dyn NotificationChannel>,
        templates: MessageTemplates,
        clock: Arc<dyn Clock>,
        settings: DispatchSettings,
    ) -> Self {
        let limiter = Arc::new(Semaphore::new(settings.concurrency.max(1)));
        Self {
            inner: Arc::new(Inner {
                tracker,
                channel,
                templates,
                clock,
                limiter,
                settings,
                stats: DispatchStats::default(),
            }),
            tasks: TaskTracker::new(),
            cancel: CancellationToken::new(),
        }
    }

    /// Hand a claimed event over for delivery. Never waits on the channel.
    pub fn submit(&self, event: ScheduledEvent, claim: Claim) {
        self.inner.stats.submitted.fetch_add(1, Ordering::Relaxed);
        let inner = self.inner.clone();
        let cancel = self.cancel.clone();
        self.tasks.spawn(async move { inner.deliver(event, claim, cancel).await });
    }

    pub fn in_flight(&self) -> usize {
        self.tasks.len()
    }

    pub fn counters(&self) -> DispatchCounters {
        let s = &self.inner.stats;
        DispatchCounters {
            submitted: s.submitted.load(Ordering::Relaxed),
            dispatched: s.dispatched.load(Ordering::Relaxed),
            retried: s.retried.load(Ordering::Relaxed),
            failed: s.failed.load(Ordering::Relaxed),
            superseded: s.superseded.load(Ordering::Relaxed),
            abandoned: s.abandoned.load(Ordering::Relaxed),
        }
    }

    /// Wait until every submitted delivery has finished.
    pub async fn wait_idle(&self) {
        self.tasks.close();
        self.tasks.wait().await;
        self.tasks.reopen();
    }

    /// Finish or abandon in-flight deliveries according to `policy`.
    pub async fn shutdown(&self, policy: StopPolicy, drain_timeout: Duration) -> ShutdownReport {
        let in_flight = self.tasks.len();
        let abandoned_before = self.inner.stats.abandoned.load(Ordering::Relaxed);
        self.tasks.close();

        match policy {
            StopPolicy::Drain => {
                if tokio::time::timeout(drain_timeout, self.tasks.wait())
                    .await
                    .is_err()
                {
                    warn!(
                        remaining = self.tasks.len(),
                        "drain timeout reached; abandoning remaining deliveries"
                    );
                    self.cancel.cancel();
                    self.tasks.wait().await;
                }
            }
            StopPolicy::Abandon => {
                self.cancel.cancel();
                self.tasks.wait().await;
            }
        }

        let abandoned = self.inner.stats.abandoned.load(Ordering::Relaxed) - abandoned_before;
        ShutdownReport {
            in_flight,
            abandoned,
        }
    }
}

impl Inner {
    async fn acquire(&self, cancel: &CancellationToken) -> Option<OwnedSemaphorePermit> {
        tokio::select! {
            biased;
            _ = cancel.cancelled() => None,
            permit = self.limiter.clone().acquire_owned() => permit.ok(),
        }
    }

    async fn deliver(&self, event: ScheduledEvent, mut claim: Claim, cancel: CancellationToken) {
        let notification = match Notification::from_event(&event, &self.templates) {
            Ok(n) => n,
            Err(err) => {
                // Malformed payload: no send, one permanent attempt.
                let msg = err.to_string();
                self.record(&event, &claim, AttemptOutcome::PermanentFailure, Some(&msg))
                    .await;
                return;
            }
        };

        loop {
            let Some(permit) = self.acquire(&cancel).await else {
                self.abandon(&claim).await;
                return;
            };
            // The lease must cover this attempt; a lost claim means another
            // run owns the event or it was rescheduled.
            match self.tracker.renew(&mut claim, self.clock.now()).await {
                Ok(true) => {}
                Ok(false) => {
                    self.stats.superseded.fetch_add(1, Ordering::Relaxed);
                    info!(event_id = %event.id, "claim lost before send; delivery stopped");
                    return;
                }
                Err(err) => {
                    warn!(?err, event_id = %event.id, "could not renew claim; event left pending");
                    self.release(&claim).await;
                    return;
                }
            }

            let send = tokio::time::timeout(
                self.settings.send_timeout(),
                self.channel.send(&notification),
            );
            let result = tokio::select! {
                biased;
                _ = cancel.cancelled() => {
                    self.abandon(&claim).await;
                    return;
                }
                res = send => res.unwrap_or_else(|_| {
                    Err(ChannelError::Transient("send timed out".into()))
                }),
            };

            let (outcome, error) = match result {
                Ok(()) => (AttemptOutcome::Success, None),
                Err(ChannelError::Transient(msg)) => (AttemptOutcome::TransientFailure, Some(msg)),
                Err(ChannelError::Permanent(msg)) => (AttemptOutcome::PermanentFailure, Some(msg)),
            };
            let recorded = self.record(&event, &claim, outcome, error.as_deref()).await;
            drop(permit);

            let Some(RecordOutcome::RetryScheduled { attempt_no }) = recorded else {
                return;
            };
            let delay = self
                .settings
                .retry_delay(u32::try_from(attempt_no).unwrap_or(u32::MAX));
            tokio::select! {
                biased;
                _ = cancel.cancelled() => {
                    self.abandon(&claim).await;
                    return;
                }
                _ = tokio::time::sleep(delay) => {}
            }
        }
    }

    /// Record one attempt and update counters. `None` means the delivery must
    /// stop without a verdict (storage trouble); the claim is released.
    async fn record(
        &self,
        event: &ScheduledEvent,
        claim: &Claim,
        outcome: AttemptOutcome,
        error: Option<&str>,
    ) -> Option<RecordOutcome> {
        let res = self
            .tracker
            .record_attempt(claim, outcome, event.channel, self.clock.now(), error)
            .await;
        match res {
            Ok(rec) => {
                match rec {
                    RecordOutcome::Dispatched { attempt_no } => {
                        self.stats.dispatched.fetch_add(1, Ordering::Relaxed);
                        info!(event_id = %event.id, attempt_no, channel = event.channel.as_str(), "notification dispatched");
                    }
                    RecordOutcome::RetryScheduled { attempt_no } => {
                        self.stats.retried.fetch_add(1, Ordering::Relaxed);
                        warn!(event_id = %event.id, attempt_no, error = error.unwrap_or(""), "delivery failed; will retry");
                    }
                    RecordOutcome::Failed { attempt_no } => {
                        self.stats.failed.fetch_add(1, Ordering::Relaxed);
                        error!(event_id = %event.id, attempt_no, error = error.unwrap_or(""), "delivery failed permanently");
                    }
                    RecordOutcome::Superseded => {
                        self.stats.superseded.fetch_add(1, Ordering::Relaxed);
                        debug!(event_id = %event.id, "event settled or claim lost; attempt discarded");
                    }
                }
                Some(rec)
            }
            Err(err) => {
                warn!(?err, event_id = %event.id, "could not record attempt; event left pending");
                self.release(claim).await;
                None
            }
        }
    }

    async fn abandon(&self, claim: &Claim) {
        self.stats.abandoned.fetch_add(1, Ordering::Relaxed);
        debug!(event_id = %claim.event_id, "delivery abandoned");
        self.release(claim).await;
    }

    async fn release(&self, claim: &Claim) {
        if let Err(err) = self.tracker.release(claim).await {
            // The lease runs out on its own.
            warn!(?err, event_id = %claim.event_id, "failed to release claim");
        }
    }
}
