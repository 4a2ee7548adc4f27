//! Lifecycle controller owning the scheduler task and its dispatcher.
use crate::channel::{MessageTemplates, NotificationChannel};
use crate::clock::{Clock, SystemClock};
use crate::config::{Config, DispatchSettings, SchedulerSettings};
use crate::db::Pool;
use crate::dispatcher::{DispatchCounters, Dispatcher};
use crate::scheduler::{LoopStatus, Scheduler};
use crate::tracker::DeliveryTracker;
use serde::Serialize;
use std::sync::Arc;
use tokio::sync::{oneshot, Mutex};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

/// Outcome of [`NotificationService::stop`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct StopReport {
    /// Deliveries still running when the loop stopped.
    pub in_flight: usize,
    /// Deliveries cut short; their events stay pending.
    pub abandoned: u64,
    pub counters: DispatchCounters,
}

struct Running {
    cancel: CancellationToken,
    handle: JoinHandle<()>,
    scheduler: Arc<Scheduler>,
    dispatcher: Dispatcher,
}

pub struct NotificationService {
    pool: Pool,
    channel: Arc<dyn NotificationChannel>,
    clock: Arc<dyn Clock>,
    templates: MessageTemplates,
    scheduler: SchedulerSettings,
    dispatch: DispatchSettings,
    state: Mutex<Option<Running>>,
}

impl NotificationService {
    pub fn new(
        pool: Pool,
        channel: Arc<dyn NotificationChannel>,
        clock: Arc<dyn Clock>,
        templates: MessageTemplates,
        scheduler: SchedulerSettings,
        dispatch: DispatchSettings,
    ) -> Self {
        Self {
            pool,
            channel,
            clock,
            templates,
            scheduler,
            dispatch,
            state: Mutex::new(None),
        }
    }

    pub fn from_config(pool: Pool, channel: Arc<dyn NotificationChannel>, cfg: &Config) -> Self {
        Self::new(
            pool,
            channel,
            Arc::new(SystemClock),
            MessageTemplates::from(&cfg.templates),
            cfg.scheduler.clone(),
            cfg.dispatch.clone(),
        )
    }

    /// Spawn the scheduler loop. Returns once its first tick is scheduled.
    /// Calling it on a running service does nothing and returns false.
    pub async fn start(&self) -> bool {
        let mut state = self.state.lock().await;
        if state.is_some() {
            info!("notification service already running");
            return false;
        }

        let tracker = DeliveryTracker::new(
            self.pool.clone(),
            self.dispatch.max_attempts,
            self.scheduler.claim_lease(),
        );
        let dispatcher = Dispatcher::new(
            tracker.clone(),
            self.channel.clone(),
            self.templates.clone(),
            self.clock.clone(),
            self.dispatch.clone(),
        );
        let scheduler = Arc::new(Scheduler::new(
            self.pool.clone(),
            tracker,
            dispatcher.clone(),
            self.clock.clone(),
            self.scheduler.clone(),
        ));

        let cancel = CancellationToken::new();
        let (ready_tx, ready_rx) = oneshot::channel();
        let handle = tokio::spawn(scheduler.clone().run(cancel.clone(), ready_tx));
        if ready_rx.await.is_err() {
            error!("scheduler loop exited before its first tick");
        }

        *state = Some(Running {
            cancel,
            handle,
            scheduler,
            dispatcher,
        });
        info!("notification service started");
        true
    }

    /// Stop the loop after its current batch, then drain or abandon
    /// in-flight deliveries per `dispatch.on_stop`. `None` if not running.
    pub async fn stop(&self) -> Option<StopReport> {
        let mut state = self.state.lock().await;
        let running = state.take()?;

        running.cancel.cancel();
        if let Err(err) = running.handle.await {
            error!(?err, "scheduler task ended abnormally");
        }

        let shutdown = running
            .dispatcher
            .shutdown(self.dispatch.on_stop, self.dispatch.drain_timeout())
            .await;
        let counters = running.dispatcher.counters();
        if shutdown.abandoned > 0 {
            warn!(
                abandoned = shutdown.abandoned,
                in_flight = shutdown.in_flight,
                "in-flight deliveries abandoned; events left pending"
            );
        } else {
            info!(
                in_flight = shutdown.in_flight,
                abandoned = 0,
                "in-flight deliveries finished"
            );
        }
        info!(
            dispatched = counters.dispatched,
            failed = counters.failed,
            "notification service stopped"
        );

        Some(StopReport {
            in_flight: shutdown.in_flight,
            abandoned: shutdown.abandoned,
            counters,
        })
    }

    pub async fn is_running(&self) -> bool {
        self.state.lock().await.is_some()
    }

    /// Dispatcher counters of the current run.
    pub async fn stats(&self) -> Option<DispatchCounters> {
        self.state
            .lock()
            .await
            .as_ref()
            .map(|running| running.dispatcher.counters())
    }

    /// Tick loop state of the current run.
    pub async fn loop_status(&self) -> Option<LoopStatus> {
        self.state
            .lock()
            .await
            .as_ref()
            .map(|running| running.scheduler.status())
    }
}
