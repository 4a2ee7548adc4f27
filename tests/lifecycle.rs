mod common;

use care_reminders::channel::{MessageTemplates, NotificationChannel};
use care_reminders::clock::SystemClock;
use care_reminders::config::StopPolicy;
use care_reminders::db::{self, Pool};
use care_reminders::model::EventStatus;
use care_reminders::service::NotificationService;
use care_reminders::tracker::DeliveryTracker;
use chrono::Utc;
use common::{
    appointment, dispatch_settings, eventually, insert, scheduler_settings, setup_pool,
    HangingChannel, RecordingChannel,
};
use std::sync::Arc;
use std::time::Duration;

fn service(pool: &Pool, channel: Arc<dyn NotificationChannel>, on_stop: StopPolicy) -> NotificationService {
    NotificationService::new(
        pool.clone(),
        channel,
        Arc::new(SystemClock),
        MessageTemplates::default(),
        scheduler_settings(),
        dispatch_settings(3, on_stop),
    )
}

#[tokio::test]
async fn start_and_stop_are_idempotent() {
    let pool = setup_pool().await;
    let svc = service(&pool, Arc::new(RecordingChannel::new()), StopPolicy::Drain);

    assert!(svc.start().await);
    assert!(!svc.start().await);
    assert!(svc.is_running().await);
    assert!(svc.stats().await.is_some());

    let report = svc.stop().await.unwrap();
    assert_eq!(report.abandoned, 0);
    assert!(svc.stop().await.is_none());
    assert!(!svc.is_running().await);

    // Restartable.
    assert!(svc.start().await);
    svc.stop().await.unwrap();
}

#[tokio::test]
async fn first_tick_runs_right_after_start() {
    let pool = setup_pool().await;
    let channel = RecordingChannel::new();
    insert(&pool, &appointment("due", Utc::now() - chrono::Duration::minutes(1))).await;
    let svc = service(&pool, Arc::new(channel.clone()), StopPolicy::Drain);

    svc.start().await;
    let dispatched = eventually(|| {
        let pool = pool.clone();
        async move {
            db::fetch_event(&pool, "due").await.unwrap().unwrap().status == EventStatus::Dispatched
        }
    })
    .await;
    assert!(dispatched);
    svc.stop().await.unwrap();
    assert_eq!(channel.calls().await, vec!["due".to_string()]);
}

#[tokio::test]
async fn abandon_leaves_event_pending_and_unclaimed() {
    let pool = setup_pool().await;
    let channel = HangingChannel::default();
    insert(&pool, &appointment("stuck", Utc::now() - chrono::Duration::minutes(1))).await;
    let svc = service(&pool, Arc::new(channel.clone()), StopPolicy::Abandon);

    svc.start().await;
    assert!(eventually(|| { let c = channel.clone(); async move { c.calls().await == 1 } }).await);

    let report = tokio::time::timeout(Duration::from_secs(2), svc.stop())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(report.in_flight, 1);
    assert_eq!(report.abandoned, 1);
    assert_eq!(report.counters.abandoned, 1);

    let ev = db::fetch_event(&pool, "stuck").await.unwrap().unwrap();
    assert_eq!(ev.status, EventStatus::Pending);
    assert!(db::list_attempts(&pool, "stuck").await.unwrap().is_empty());
    // Claim was released, so the next run can pick it up straight away.
    let tracker = DeliveryTracker::new(pool.clone(), 3, chrono::Duration::minutes(5));
    assert!(tracker.try_claim("stuck", Utc::now()).await.unwrap().is_some());
}

#[tokio::test]
async fn drain_waits_for_in_flight_delivery() {
    let pool = setup_pool().await;
    let channel = RecordingChannel::slow(Duration::from_millis(100));
    insert(&pool, &appointment("slow", Utc::now() - chrono::Duration::minutes(1))).await;
    let svc = service(&pool, Arc::new(channel.clone()), StopPolicy::Drain);

    svc.start().await;
    assert!(eventually(|| { let c = channel.clone(); async move { c.calls().await.len() == 1 } }).await);

    let report = svc.stop().await.unwrap();
    assert_eq!(report.abandoned, 0);
    assert_eq!(report.counters.dispatched, 1);
    let ev = db::fetch_event(&pool, "slow").await.unwrap().unwrap();
    assert_eq!(ev.status, EventStatus::Dispatched);
}

#[tokio::test]
async fn stop_mid_batch_leaves_only_settled_or_pending_events() {
    let pool = setup_pool().await;
    let channel = RecordingChannel::slow(Duration::from_millis(30));
    let ids: Vec<String> = (0..12).map(|i| format!("m{:02}", i)).collect();
    for id in &ids {
        insert(&pool, &appointment(id, Utc::now() - chrono::Duration::minutes(1))).await;
    }
    let svc = service(&pool, Arc::new(channel.clone()), StopPolicy::Abandon);

    svc.start().await;
    assert!(eventually(|| { let c = channel.clone(); async move { !c.calls().await.is_empty() } }).await);
    svc.stop().await.unwrap();

    for id in &ids {
        let ev = db::fetch_event(&pool, id).await.unwrap().unwrap();
        assert!(
            matches!(ev.status, EventStatus::Pending | EventStatus::Dispatched | EventStatus::Failed),
            "{} ended as {:?}",
            id,
            ev.status
        );
        let successes = db::list_attempts(&pool, id)
            .await
            .unwrap()
            .iter()
            .filter(|a| a.outcome == care_reminders::model::AttemptOutcome::Success)
            .count();
        assert_eq!(successes, usize::from(ev.status == EventStatus::Dispatched));
    }
}

#[tokio::test]
async fn loop_survives_storage_outage_with_growing_delay() {
    let pool = setup_pool().await;
    let svc = service(&pool, Arc::new(RecordingChannel::new()), StopPolicy::Drain);
    pool.close().await;
    // Paused after the pool work so SQLite's worker thread never races the clock.
    tokio::time::pause();

    assert!(svc.start().await);
    tokio::time::sleep(Duration::from_millis(10)).await;
    let status = svc.loop_status().await.unwrap();
    assert_eq!(status.ticks, 1);
    assert_eq!(status.consecutive_failures, 1);
    assert_eq!(status.next_delay_ms, 2_000);

    tokio::time::sleep(Duration::from_secs(2)).await;
    let status = svc.loop_status().await.unwrap();
    assert_eq!(status.ticks, 2);
    assert_eq!(status.consecutive_failures, 2);
    assert_eq!(status.next_delay_ms, 4_000);

    // Capped at max_backoff_secs.
    tokio::time::sleep(Duration::from_secs(4)).await;
    let status = svc.loop_status().await.unwrap();
    assert_eq!(status.ticks, 3);
    assert_eq!(status.consecutive_failures, 3);
    assert_eq!(status.next_delay_ms, 4_000);

    tokio::time::sleep(Duration::from_secs(40)).await;
    assert!(svc.is_running().await);
    assert!(svc.loop_status().await.unwrap().ticks >= 10);

    let report = svc.stop().await.unwrap();
    assert_eq!(report.counters.submitted, 0);
    assert!(svc.loop_status().await.is_none());
}
