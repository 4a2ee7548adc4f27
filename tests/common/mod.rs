#![allow(dead_code)]

use async_trait::async_trait;
use care_reminders::channel::{ChannelError, MessageTemplates, Notification, NotificationChannel};
use care_reminders::clock::Clock;
use care_reminders::config::{DispatchSettings, SchedulerSettings, StopPolicy};
use care_reminders::db::{self, Pool};
use care_reminders::dispatcher::Dispatcher;
use care_reminders::model::{ChannelKind, NewEvent, SubjectType};
use care_reminders::scheduler::Scheduler;
use care_reminders::tracker::DeliveryTracker;
use chrono::{DateTime, TimeZone, Utc};
use serde_json::json;
use sqlx::sqlite::SqlitePoolOptions;
use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;

pub async fn setup_pool() -> Pool {
    let pool = SqlitePoolOptions::new()
        .max_connections(1)
        .connect("sqlite::memory:")
        .await
        .unwrap();
    sqlx::migrate!("./migrations").run(&pool).await.unwrap();
    pool
}

pub fn t0() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2026, 3, 1, 9, 0, 0).unwrap()
}

pub fn appointment(id: &str, target_at: DateTime<Utc>) -> NewEvent {
    NewEvent {
        id: id.into(),
        subject_type: SubjectType::Appointment,
        subject_id: format!("appt-{}", id),
        recipient_id: "user-1".into(),
        channel: ChannelKind::Sms,
        target_at,
        payload: json!({ "doctor_name": "Dr. Rao", "slot_date": "2026-03-01", "slot_time": "10:00" }),
        recurrence_secs: None,
    }
}

pub async fn insert(pool: &Pool, event: &NewEvent) {
    db::upsert_event(pool, event, t0()).await.unwrap();
}

pub fn dispatch_settings(max_attempts: u32, on_stop: StopPolicy) -> DispatchSettings {
    DispatchSettings {
        max_attempts,
        retry_base_delay_ms: 1,
        retry_max_delay_ms: 4,
        concurrency: 4,
        send_timeout_secs: 5,
        on_stop,
        drain_timeout_secs: 5,
    }
}

pub fn scheduler_settings() -> SchedulerSettings {
    SchedulerSettings {
        tick_interval_secs: 1,
        max_backoff_secs: 4,
        batch_size: 100,
        claim_lease_secs: 300,
        retention_days: 0,
        retention_sweep_secs: 3600,
    }
}

/// Scheduler plus the dispatcher it feeds, wired to `channel`.
pub fn build(
    pool: &Pool,
    channel: Arc<dyn NotificationChannel>,
    clock: Arc<dyn Clock>,
    max_attempts: u32,
) -> (Scheduler, Dispatcher) {
    build_with(
        pool,
        channel,
        clock,
        chrono::Duration::minutes(5),
        dispatch_settings(max_attempts, StopPolicy::Drain),
    )
}

/// Like [`build`], with an explicit claim lease and dispatch settings.
pub fn build_with(
    pool: &Pool,
    channel: Arc<dyn NotificationChannel>,
    clock: Arc<dyn Clock>,
    lease: chrono::Duration,
    settings: DispatchSettings,
) -> (Scheduler, Dispatcher) {
    let tracker = DeliveryTracker::new(pool.clone(), settings.max_attempts, lease);
    let dispatcher = Dispatcher::new(
        tracker.clone(),
        channel,
        MessageTemplates::default(),
        clock.clone(),
        settings,
    );
    let scheduler = Scheduler::new(
        pool.clone(),
        tracker,
        dispatcher.clone(),
        clock,
        scheduler_settings(),
    );
    (scheduler, dispatcher)
}

/// Replays scripted results per event id (success once a script runs out)
/// and records every send.
#[derive(Clone, Default)]
pub struct RecordingChannel {
    scripts: Arc<Mutex<HashMap<String, VecDeque<Result<(), ChannelError>>>>>,
    calls: Arc<Mutex<Vec<String>>>,
    delay: Option<Duration>,
}

impl RecordingChannel {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn slow(delay: Duration) -> Self {
        Self {
            delay: Some(delay),
            ..Self::default()
        }
    }

    pub async fn script(&self, event_id: &str, results: Vec<Result<(), ChannelError>>) {
        self.scripts
            .lock()
            .await
            .insert(event_id.to_string(), VecDeque::from(results));
    }

    pub async fn calls(&self) -> Vec<String> {
        self.calls.lock().await.clone()
    }
}

#[async_trait]
impl NotificationChannel for RecordingChannel {
    async fn send(&self, notification: &Notification) -> Result<(), ChannelError> {
        self.calls.lock().await.push(notification.event_id.clone());
        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }
        let mut scripts = self.scripts.lock().await;
        scripts
            .get_mut(&notification.event_id)
            .and_then(VecDeque::pop_front)
            .unwrap_or(Ok(()))
    }
}

/// Records the send, then never answers.
#[derive(Clone, Default)]
pub struct HangingChannel {
    calls: Arc<Mutex<Vec<String>>>,
}

impl HangingChannel {
    pub async fn calls(&self) -> usize {
        self.calls.lock().await.len()
    }
}

#[async_trait]
impl NotificationChannel for HangingChannel {
    async fn send(&self, notification: &Notification) -> Result<(), ChannelError> {
        self.calls.lock().await.push(notification.event_id.clone());
        std::future::pending::<()>().await;
        Ok(())
    }
}

/// Poll `check` every 10ms until it holds or two seconds pass.
pub async fn eventually<F, Fut>(mut check: F) -> bool
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = bool>,
{
    for _ in 0..200 {
        if check().await {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    false
}
