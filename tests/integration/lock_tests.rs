use super::*;
use chrono::Utc;
use std::time::Duration;
use tokio::sync::RwLock;

use deal_radar::admin::StuckReason;
use deal_radar::config::LockConfig;
use deal_radar::models::{ScanJob, ScanJobStatus, ScanScope, ScanTrigger};
use deal_radar::scan_lock::{LockRecord, ManualScanRequest, LOCK_KEY};
use deal_radar::scheduler::{ScanScheduler, SchedulerStats};
use deal_radar::store::AtomicTtlStore;
use deal_radar::RunOutcome;

async fn plant_stale_lock(app: &TestApp) -> anyhow::Result<()> {
    let now = Utc::now();
    let record = LockRecord {
        owner: "crashed-worker".to_string(),
        run_id: "crashed-run".to_string(),
        acquired_at: now - chrono::Duration::hours(2),
        heartbeat_at: now - chrono::Duration::hours(1),
        ttl_secs: 7200,
    };
    app.store
        .set(LOCK_KEY, &serde_json::to_string(&record)?, Duration::from_secs(7200))
        .await?;
    Ok(())
}

#[tokio::test]
async fn test_concurrent_acquire_has_single_owner() -> anyhow::Result<()> {
    let app = create_test_app().await?;

    let attempts = (0..16).map(|i| {
        let lock = Arc::clone(&app.lock);
        tokio::spawn(async move { lock.acquire(&format!("run-{}", i)).await })
    });
    let results = futures::future::join_all(attempts).await;

    let mut owners = 0;
    for result in results {
        if result??.is_some() {
            owners += 1;
        }
    }
    assert_eq!(owners, 1);
    Ok(())
}

#[tokio::test]
async fn test_overlapping_runs_are_single_flight() -> anyhow::Result<()> {
    let app = create_test_app().await?;
    app.add_category("laptops", 5).await?;
    app.fetcher.set(
        &category_url("laptops"),
        Script::Slow(Duration::from_millis(300), clearance_page("lap")),
    );
    let peer = app.peer_coordinator().await?;

    let (first, second) = tokio::join!(
        app.coordinator.run(ScanTrigger::Scheduled),
        peer.run(ScanTrigger::Manual)
    );

    let outcomes = [first, second];
    let finished = outcomes.iter().filter(|o| matches!(o, RunOutcome::Finished { .. })).count();
    let skipped = outcomes.iter().filter(|o| **o == RunOutcome::Skipped).count();
    assert_eq!((finished, skipped), (1, 1));
    assert_eq!(app.fetcher.calls().len(), 1);
    Ok(())
}

#[tokio::test]
async fn test_stale_lock_recovered_by_next_run() -> anyhow::Result<()> {
    let app = create_test_app().await?;
    app.add_category("laptops", 5).await?;
    app.fetcher.set(&category_url("laptops"), Script::Page(clearance_page("lap")));
    plant_stale_lock(&app).await?;

    let outcome = app.coordinator.run(ScanTrigger::Scheduled).await;
    assert!(matches!(outcome, RunOutcome::Finished { .. }));
    assert!(!app.lock.status().await?.held);
    Ok(())
}

#[tokio::test]
async fn test_live_lock_is_not_taken_over() -> anyhow::Result<()> {
    let app = create_test_app().await?;
    app.add_category("laptops", 5).await?;
    let guard = app.lock.acquire("other-worker").await?.expect("lock is free");

    assert_eq!(app.coordinator.run(ScanTrigger::Scheduled).await, RunOutcome::Skipped);
    assert!(app.fetcher.calls().is_empty());
    assert!(app.lock.release(&guard).await?);
    Ok(())
}

#[tokio::test]
async fn test_stuck_job_flagged_and_cleared_by_force_unlock() -> anyhow::Result<()> {
    let app = create_test_app().await?;
    plant_stale_lock(&app).await?;
    let mut job = ScanJob::new("crashed-run", ScanTrigger::Scheduled, 3);
    app.repo.create_scan_job(&job).await?;
    app.repo.mark_job_running(&job.id).await?;

    let admin = app.admin();
    let diagnostics = admin.diagnostics().await?;
    assert!(diagnostics.lock.held);
    assert!(diagnostics.lock.stale);
    assert!(diagnostics.lock.heartbeat_age_secs.is_some_and(|age| age >= 3600));
    assert_eq!(diagnostics.stuck_jobs.len(), 1);
    assert_eq!(diagnostics.stuck_jobs[0].reason, StuckReason::StaleHeartbeat);

    let report = admin.force_unlock().await?;
    assert_eq!(report.cleared.map(|r| r.run_id).as_deref(), Some("crashed-run"));
    assert_eq!(report.failed_jobs, vec![job.id.clone()]);

    job = app.repo.get_scan_job(&job.id).await?;
    assert_eq!(job.status, ScanJobStatus::Failed);

    let diagnostics = admin.diagnostics().await?;
    assert!(!diagnostics.lock.held);
    assert!(diagnostics.stuck_jobs.is_empty());
    Ok(())
}

#[tokio::test]
async fn test_lost_lock_cancels_run() -> anyhow::Result<()> {
    let mut config = get_test_config();
    config.lock = LockConfig {
        ttl: 10,
        heartbeat_interval: 1,
        ..LockConfig::default()
    };
    let settings = CoordinatorSettings::from(&config);
    let app = create_test_app_with(config, settings).await?;
    let slow = app.add_category("slow", 5).await?;
    app.fetcher.set(&category_url("slow"), Script::Hang);

    let admin = app.admin();
    let lock = Arc::clone(&app.lock);
    let usurper = tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(200)).await;
        admin.force_unlock().await?;
        lock.acquire("usurper").await
    });

    let outcome = tokio::time::timeout(Duration::from_secs(5), app.coordinator.run(ScanTrigger::Scheduled)).await?;
    let usurper_guard = usurper.await??;
    assert!(usurper_guard.is_some());

    match outcome {
        RunOutcome::Finished { summary, .. } => assert!(summary.cancelled),
        other => panic!("expected a cancelled run, got {:?}", other),
    }
    assert!(app.repo.get_category(&slow.id).await?.last_scanned.is_none());

    // The new owner's lock survives the old run's release attempt.
    let status = app.lock.status().await?;
    assert_eq!(status.record.map(|r| r.run_id).as_deref(), Some("usurper"));
    Ok(())
}

#[tokio::test]
async fn test_manual_request_single_pending() -> anyhow::Result<()> {
    let app = create_test_app().await?;
    let admin = app.admin();

    assert_eq!(
        tokio_test::assert_ok!(admin.request_manual_scan(ScanScope::all()).await),
        ManualScanRequest::Queued
    );
    assert_eq!(admin.request_manual_scan(ScanScope::all()).await?, ManualScanRequest::AlreadyPending);
    assert_eq!(app.lock.take_pending_request().await?, Some(ScanScope::all()));
    assert_eq!(app.lock.take_pending_request().await?, None);

    let guard = app.lock.acquire("live-run").await?.expect("lock is free");
    assert_eq!(admin.request_manual_scan(ScanScope::all()).await?, ManualScanRequest::ScanRunning);
    assert!(!app.lock.status().await?.pending_manual_request);
    app.lock.release(&guard).await?;
    Ok(())
}

#[tokio::test]
async fn test_manual_poll_runs_pending_request_once() -> anyhow::Result<()> {
    let app = create_test_app().await?;
    app.add_category("laptops", 5).await?;
    app.fetcher.set(&category_url("laptops"), Script::Page(clearance_page("lap")));
    let stats = Arc::new(RwLock::new(SchedulerStats::default()));

    let poll = || {
        ScanScheduler::poll_manual_request(Arc::clone(&app.coordinator), Arc::clone(&app.lock), Arc::clone(&stats))
    };

    assert!(poll().await.is_none(), "nothing pending");

    app.admin().request_manual_scan(ScanScope::all()).await?;
    let outcome = poll().await;
    assert!(matches!(outcome, Some(RunOutcome::Finished { .. })));
    assert!(poll().await.is_none(), "request consumed");

    let stats = stats.read().await;
    assert_eq!(stats.manual_runs, 1);
    assert_eq!(stats.completed_runs, 1);
    Ok(())
}

#[tokio::test]
async fn test_manual_poll_waits_for_live_scan() -> anyhow::Result<()> {
    let app = create_test_app().await?;
    let stats = Arc::new(RwLock::new(SchedulerStats::default()));
    app.admin().request_manual_scan(ScanScope::all()).await?;

    let guard = app.lock.acquire("live-run").await?.expect("lock is free");
    let outcome =
        ScanScheduler::poll_manual_request(Arc::clone(&app.coordinator), Arc::clone(&app.lock), Arc::clone(&stats))
            .await;
    assert!(outcome.is_none());
    assert!(app.lock.status().await?.pending_manual_request, "request kept for later");
    app.lock.release(&guard).await?;
    Ok(())
}
