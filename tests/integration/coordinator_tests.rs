use super::*;
use deal_radar::fetcher::FetchError;
use deal_radar::models::{ErrorClass, ScanJob, ScanJobStatus, ScanScope, ScanTrigger};
use deal_radar::RunOutcome;

fn finished(outcome: RunOutcome) -> (String, deal_radar::models::ScanJobSummary) {
    match outcome {
        RunOutcome::Finished { job_id, summary } => (job_id, summary),
        other => panic!("expected a finished run, got {:?}", other),
    }
}

#[tokio::test]
async fn test_run_scans_due_categories_and_publishes_deals() -> anyhow::Result<()> {
    let app = create_test_app().await?;
    let laptops = app.add_category("laptops", 8).await?;
    let tvs = app.add_category("tvs", 5).await?;
    app.fetcher.set(&category_url("laptops"), Script::Page(clearance_page("lap")));
    app.fetcher.set(&category_url("tvs"), Script::Page(clearance_page("tv")));

    let (job_id, summary) = finished(app.coordinator.run(ScanTrigger::Scheduled).await);
    assert_eq!(summary.processed_items, 2);
    assert_eq!(summary.success_count, 2);
    assert_eq!(summary.products_found, 4);
    assert_eq!(summary.deals_found, 2);
    assert_eq!(summary.alerts_sent, 2);
    assert_eq!(app.sink.skus(), vec!["lap-1", "tv-1"]);

    let job = app.repo.get_scan_job(&job_id).await?;
    assert_eq!(job.status, ScanJobStatus::Completed);
    assert_eq!(job.total_items, 2);
    assert!(job.started_at.is_some() && job.completed_at.is_some());

    for id in [&laptops.id, &tvs.id] {
        let category = app.repo.get_category(id).await?;
        assert!(category.last_scanned.is_some());
        assert_eq!(category.products_found, 2);
        assert_eq!(category.deals_found, 1);
        assert!(category.last_error.is_none());
    }

    assert!(!app.lock.status().await?.held, "lock released after the run");
    Ok(())
}

#[tokio::test]
async fn test_nothing_due_creates_no_job() -> anyhow::Result<()> {
    let app = create_test_app().await?;
    app.add_category("laptops", 5).await?;
    app.fetcher.set(&category_url("laptops"), Script::Page(clearance_page("lap")));

    finished(app.coordinator.run(ScanTrigger::Scheduled).await);
    assert_eq!(app.coordinator.run(ScanTrigger::Scheduled).await, RunOutcome::NothingDue);

    let completed = app.repo.list_jobs_with_status(ScanJobStatus::Completed).await?;
    assert_eq!(completed.len(), 1);
    Ok(())
}

#[tokio::test]
async fn test_repeat_detection_is_deduplicated() -> anyhow::Result<()> {
    let app = create_test_app().await?;
    let laptops = app.add_category("laptops", 5).await?;
    app.fetcher.set(&category_url("laptops"), Script::Page(clearance_page("lap")));

    let (_, first) = finished(app.coordinator.run(ScanTrigger::Scheduled).await);
    app.make_due(&laptops.id).await?;
    let (_, second) = finished(app.coordinator.run(ScanTrigger::Scheduled).await);

    assert_eq!(first.alerts_sent, 1);
    assert_eq!(second.deals_found, 1);
    assert_eq!(second.alerts_sent, 0);
    assert_eq!(app.sink.skus(), vec!["lap-1"]);

    // Counters accumulate across runs.
    assert_eq!(app.repo.get_category(&laptops.id).await?.deals_found, 2);
    Ok(())
}

#[tokio::test]
async fn test_categories_scanned_in_priority_order() -> anyhow::Result<()> {
    let mut config = get_test_config();
    config.scheduler.max_concurrency = 1;
    let settings = CoordinatorSettings::from(&config);
    let app = create_test_app_with(config, settings).await?;

    for (name, priority) in [("low", 2), ("high", 9), ("mid", 5)] {
        app.add_category(name, priority).await?;
        app.fetcher.set(&category_url(name), Script::Page(clearance_page(name)));
    }

    finished(app.coordinator.run(ScanTrigger::Scheduled).await);
    assert_eq!(
        app.fetcher.calls(),
        vec![category_url("high"), category_url("mid"), category_url("low")]
    );
    Ok(())
}

#[tokio::test]
async fn test_concurrency_bound_and_dispatch_order() -> anyhow::Result<()> {
    let mut config = get_test_config();
    config.scheduler.max_concurrency = 2;
    let settings = CoordinatorSettings::from(&config);
    let app = create_test_app_with(config, settings).await?;

    for (name, priority) in [("p4", 4), ("p9", 9), ("p6", 6), ("p8", 8), ("p5", 5), ("p7", 7)] {
        app.add_category(name, priority).await?;
        app.fetcher.set(
            &category_url(name),
            Script::Slow(std::time::Duration::from_millis(40), clearance_page(name)),
        );
    }

    let (_, summary) = finished(app.coordinator.run(ScanTrigger::Scheduled).await);
    assert_eq!(summary.processed_items, 6);
    assert_eq!(app.fetcher.peak_in_flight(), 2);
    assert_eq!(
        app.fetcher.calls(),
        ["p9", "p8", "p7", "p6", "p5", "p4"].map(category_url).to_vec()
    );
    Ok(())
}

#[tokio::test]
async fn test_manual_run_ignores_interval_within_scope() -> anyhow::Result<()> {
    let app = create_test_app().await?;
    app.add_category("laptops", 8).await?;
    let tvs = app.add_category("tvs", 5).await?;
    app.fetcher.set(&category_url("laptops"), Script::Page(clearance_page("lap")));
    app.fetcher.set(&category_url("tvs"), Script::Page(clearance_page("tv")));

    finished(app.coordinator.run(ScanTrigger::Scheduled).await);
    assert_eq!(app.coordinator.run(ScanTrigger::Scheduled).await, RunOutcome::NothingDue);

    let only_tvs = ScanScope {
        category_ids: vec![tvs.id.clone()],
        store: None,
    };
    let (_, summary) = finished(app.coordinator.run_scoped(ScanTrigger::Manual, only_tvs).await);
    assert_eq!(summary.processed_items, 1);
    assert_eq!(app.fetcher.calls().last(), Some(&category_url("tvs")));

    let whole_store = ScanScope {
        category_ids: Vec::new(),
        store: Some(STORE.to_uppercase()),
    };
    let (_, summary) = finished(app.coordinator.run_scoped(ScanTrigger::Manual, whole_store).await);
    assert_eq!(summary.processed_items, 2);
    assert_eq!(app.fetcher.calls().len(), 5);
    Ok(())
}

#[tokio::test]
async fn test_running_job_reports_progress() -> anyhow::Result<()> {
    let mut config = get_test_config();
    config.scheduler.max_concurrency = 1;
    let settings = CoordinatorSettings::from(&config);
    let app = create_test_app_with(config, settings).await?;
    app.add_category("fast", 9).await?;
    app.add_category("stuck", 1).await?;
    app.fetcher.set(&category_url("fast"), Script::Page(clearance_page("fast")));
    app.fetcher.set(&category_url("stuck"), Script::Hang);

    let coordinator = Arc::clone(&app.coordinator);
    let run = tokio::spawn(async move { coordinator.run(ScanTrigger::Scheduled).await });

    let job = tokio::time::timeout(std::time::Duration::from_secs(5), async {
        loop {
            let running = app.repo.list_jobs_with_status(ScanJobStatus::Running).await?;
            if let Some(job) = running.into_iter().find(|j| j.processed_items == 1) {
                return anyhow::Ok(job);
            }
            tokio::time::sleep(std::time::Duration::from_millis(10)).await;
        }
    })
    .await??;
    assert_eq!(job.total_items, 2);
    assert_eq!(job.products_found, 2);
    assert_eq!(job.alerts_sent, 1);

    app.coordinator.shutdown_token().cancel();
    let (job_id, summary) = finished(run.await?);
    assert!(summary.cancelled);
    assert_eq!(app.repo.get_scan_job(&job_id).await?.status, ScanJobStatus::Failed);
    Ok(())
}

#[tokio::test]
async fn test_cooling_category_is_not_scanned() -> anyhow::Result<()> {
    let app = create_test_app().await?;
    let blocked = app.add_category("blocked", 9).await?;
    app.add_category("open", 1).await?;
    app.fetcher.set(&category_url("open"), Script::Page(clearance_page("open")));
    app.cooldowns.trip(&blocked.id, ErrorClass::Forbidden).await?;

    let (_, summary) = finished(app.coordinator.run(ScanTrigger::Scheduled).await);
    assert_eq!(summary.processed_items, 1);
    assert_eq!(app.fetcher.calls(), vec![category_url("open")]);
    assert!(app.repo.get_category(&blocked.id).await?.last_scanned.is_none());
    Ok(())
}

#[tokio::test]
async fn test_blocking_failure_recorded_without_disabling() -> anyhow::Result<()> {
    let app = create_test_app().await?;
    let laptops = app.add_category("laptops", 5).await?;
    app.fetcher.set(
        &category_url("laptops"),
        Script::Fail(FetchError::Forbidden { attempts: 3 }),
    );

    let (job_id, summary) = finished(app.coordinator.run(ScanTrigger::Scheduled).await);
    assert_eq!(summary.error_count, 1);
    assert!(summary.errors[0].contains("403"));

    let category = app.repo.get_category(&laptops.id).await?;
    assert!(category.enabled);
    assert_eq!(category.consecutive_structural_failures, 0);
    assert!(category.last_scanned.is_some());
    assert!(category.last_error.as_deref().is_some_and(|e| e.starts_with("forbidden")));
    assert!(category.last_error_at.is_some());

    // A failed category does not fail the run.
    assert_eq!(app.repo.get_scan_job(&job_id).await?.status, ScanJobStatus::Completed);
    Ok(())
}

#[tokio::test]
async fn test_block_page_trips_cooldown() -> anyhow::Result<()> {
    let app = create_test_app().await?;
    let laptops = app.add_category("laptops", 5).await?;
    app.fetcher.set(
        &category_url("laptops"),
        Script::Page("<html><title>Access Denied</title><body>Reference #18</body></html>".to_string()),
    );

    let (_, summary) = finished(app.coordinator.run(ScanTrigger::Scheduled).await);
    assert_eq!(summary.error_count, 1);
    assert!(app.cooldowns.is_cooling(&laptops.id).await?);

    let category = app.repo.get_category(&laptops.id).await?;
    assert_eq!(category.consecutive_structural_failures, 0);
    assert!(category.last_error.as_deref().is_some_and(|e| e.starts_with("blocked")));
    Ok(())
}

#[tokio::test]
async fn test_auto_disable_after_repeated_structural_failures() -> anyhow::Result<()> {
    let app = create_test_app().await?;
    let gone = app.add_category("discontinued", 5).await?;
    // No page scripted: every fetch answers 404.

    for expected_streak in 1..=3 {
        finished(app.coordinator.run(ScanTrigger::Scheduled).await);
        let category = app.repo.get_category(&gone.id).await?;
        assert_eq!(category.consecutive_structural_failures, expected_streak);
        assert_eq!(category.enabled, expected_streak < 3);
        app.make_due(&gone.id).await?;
    }

    assert_eq!(app.coordinator.run(ScanTrigger::Scheduled).await, RunOutcome::NothingDue);
    assert_eq!(app.fetcher.calls().len(), 3);
    Ok(())
}

#[tokio::test]
async fn test_success_resets_structural_streak() -> anyhow::Result<()> {
    let app = create_test_app().await?;
    let laptops = app.add_category("laptops", 5).await?;

    finished(app.coordinator.run(ScanTrigger::Scheduled).await);
    assert_eq!(app.repo.get_category(&laptops.id).await?.consecutive_structural_failures, 1);

    app.make_due(&laptops.id).await?;
    app.fetcher.set(&category_url("laptops"), Script::Page(clearance_page("lap")));
    finished(app.coordinator.run(ScanTrigger::Scheduled).await);

    let category = app.repo.get_category(&laptops.id).await?;
    assert_eq!(category.consecutive_structural_failures, 0);
    assert!(category.last_error.is_none());
    Ok(())
}

#[tokio::test]
async fn test_empty_parse_flags_stale_selectors() -> anyhow::Result<()> {
    let app = create_test_app().await?;
    let laptops = app.add_category("laptops", 5).await?;
    app.fetcher.set(
        &category_url("laptops"),
        Script::Page("<html><body><p>New layout, no cards</p></body></html>".to_string()),
    );

    let (_, summary) = finished(app.coordinator.run(ScanTrigger::Scheduled).await);
    assert_eq!(summary.success_count, 1);

    let category = app.repo.get_category(&laptops.id).await?;
    assert_eq!(category.consecutive_structural_failures, 1);
    assert!(category.last_error.as_deref().is_some_and(|e| e.contains("selectors")));
    assert!(!app.cooldowns.is_cooling(&laptops.id).await?);
    Ok(())
}

#[tokio::test]
async fn test_pagination_keeps_partial_results() -> anyhow::Result<()> {
    let app = create_test_app().await?;
    let laptops = app.add_category("laptops", 5).await?;
    app.fetcher.set(
        &category_url("laptops"),
        Script::Page(listing(
            &[("a-1", "10.00", "100.00"), ("a-2", "50.00", "50.00")],
            Some("/c/laptops?page=2"),
        )),
    );
    app.fetcher.set(
        "https://shop.test/c/laptops?page=2",
        Script::Page(listing(
            &[("a-2", "50.00", "50.00"), ("b-1", "20.00", "100.00")],
            Some("/c/laptops?page=3"),
        )),
    );
    app.fetcher.set(
        "https://shop.test/c/laptops?page=3",
        Script::Fail(FetchError::ServerError { status: 503, attempts: 3 }),
    );

    let (_, summary) = finished(app.coordinator.run(ScanTrigger::Scheduled).await);
    assert_eq!(summary.success_count, 1);
    assert_eq!(summary.products_found, 3, "duplicate sku across pages counted once");
    assert_eq!(summary.alerts_sent, 2);
    assert_eq!(app.fetcher.calls().len(), 3);
    assert!(app.repo.get_category(&laptops.id).await?.last_error.is_none());
    Ok(())
}

#[tokio::test]
async fn test_run_timeout_leaves_unfinished_categories_untouched() -> anyhow::Result<()> {
    let config = get_test_config();
    let settings = CoordinatorSettings {
        run_timeout: std::time::Duration::from_millis(200),
        ..CoordinatorSettings::from(&config)
    };
    let app = create_test_app_with(config, settings).await?;
    let stuck = app.add_category("stuck", 9).await?;
    let quick = app.add_category("quick", 5).await?;
    app.fetcher.set(&category_url("stuck"), Script::Hang);
    app.fetcher.set(&category_url("quick"), Script::Page(clearance_page("q")));

    let (job_id, summary) = finished(app.coordinator.run(ScanTrigger::Scheduled).await);
    assert!(summary.cancelled);
    assert_eq!(summary.success_count, 1);
    assert_eq!(summary.error_count, 1);

    assert!(app.repo.get_category(&stuck.id).await?.last_scanned.is_none());
    assert!(app.repo.get_category(&quick.id).await?.last_scanned.is_some());

    let job = app.repo.get_scan_job(&job_id).await?;
    assert_eq!(job.status, ScanJobStatus::Failed);
    assert!(!app.lock.status().await?.held);
    Ok(())
}

#[tokio::test]
async fn test_shutdown_cancels_in_flight_run() -> anyhow::Result<()> {
    let app = create_test_app().await?;
    let slow = app.add_category("slow", 5).await?;
    app.fetcher.set(&category_url("slow"), Script::Hang);

    let shutdown = app.coordinator.shutdown_token();
    let canceller = tokio::spawn(async move {
        tokio::time::sleep(std::time::Duration::from_millis(100)).await;
        shutdown.cancel();
    });

    let (_, summary) = finished(app.coordinator.run(ScanTrigger::Scheduled).await);
    canceller.await?;

    assert!(summary.cancelled);
    assert!(app.repo.get_category(&slow.id).await?.last_scanned.is_none());
    assert!(!app.lock.status().await?.held);
    Ok(())
}

#[tokio::test]
async fn test_orphaned_job_failed_by_next_run() -> anyhow::Result<()> {
    let app = create_test_app().await?;
    let mut orphan = ScanJob::new("dead-run", ScanTrigger::Scheduled, 4);
    app.repo.create_scan_job(&orphan).await?;
    app.repo.mark_job_running(&orphan.id).await?;

    assert_eq!(app.coordinator.run(ScanTrigger::Scheduled).await, RunOutcome::NothingDue);

    orphan = app.repo.get_scan_job(&orphan.id).await?;
    assert_eq!(orphan.status, ScanJobStatus::Failed);
    assert!(orphan.error_message.as_deref().is_some_and(|m| m.contains("Orphaned")));
    Ok(())
}
