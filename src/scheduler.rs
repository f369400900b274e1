use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::sync::Arc;
use tokio::sync::RwLock;
use tokio_cron_scheduler::{Job, JobScheduler};
use tokio_util::sync::CancellationToken;

use crate::config::SchedulerConfig;
use crate::coordinator::{RunOutcome, ScanCoordinator};
use crate::models::{Category, ScanScope, ScanTrigger};
use crate::scan_lock::ScanLock;
use crate::utils::error::Result;

/// Enabled categories that are due and not cooling down, highest priority
/// first; within a priority the longest-unscanned goes first.
pub fn select_due(categories: &[Category], now: DateTime<Utc>, cooled: &HashSet<String>) -> Vec<Category> {
    by_priority(
        categories
            .iter()
            .filter(|c| c.enabled && c.is_due(now) && !cooled.contains(&c.id))
            .cloned()
            .collect(),
    )
}

/// Manual runs skip the interval check but still honour the enabled flag,
/// cooldowns and the requested scope.
pub fn select_manual(categories: &[Category], cooled: &HashSet<String>, scope: &ScanScope) -> Vec<Category> {
    by_priority(
        categories
            .iter()
            .filter(|c| c.enabled && !cooled.contains(&c.id) && scope.matches(c))
            .cloned()
            .collect(),
    )
}

fn by_priority(mut categories: Vec<Category>) -> Vec<Category> {
    categories.sort_by(|a, b| {
        b.priority
            .cmp(&a.priority)
            .then_with(|| a.last_scanned.cmp(&b.last_scanned))
    });
    categories
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SchedulerStats {
    pub completed_runs: u64,
    pub skipped_runs: u64,
    pub idle_runs: u64,
    pub aborted_runs: u64,
    pub manual_runs: u64,
    pub last_run: Option<DateTime<Utc>>,
    pub last_error: Option<String>,
    pub uptime_seconds: u64,
}

impl SchedulerStats {
    fn record(&mut self, trigger: ScanTrigger, outcome: &RunOutcome) {
        self.last_run = Some(Utc::now());
        if trigger == ScanTrigger::Manual {
            self.manual_runs += 1;
        }
        match outcome {
            RunOutcome::Skipped => self.skipped_runs += 1,
            RunOutcome::NothingDue => self.idle_runs += 1,
            RunOutcome::Finished { .. } => self.completed_runs += 1,
            RunOutcome::Aborted { reason } => {
                self.aborted_runs += 1;
                self.last_error = Some(reason.clone());
            }
        }
    }
}

/// Daemon driver: a repeated job for scheduled runs and a poller that turns
/// a pending manual request into a run.
pub struct ScanScheduler {
    scheduler: JobScheduler,
    coordinator: Arc<ScanCoordinator>,
    lock: Arc<ScanLock>,
    stats: Arc<RwLock<SchedulerStats>>,
    config: SchedulerConfig,
    start_time: DateTime<Utc>,
    shutdown: CancellationToken,
}

impl ScanScheduler {
    pub async fn new(coordinator: Arc<ScanCoordinator>, lock: Arc<ScanLock>, config: SchedulerConfig) -> Result<Self> {
        let scheduler = JobScheduler::new().await?;
        let shutdown = coordinator.shutdown_token();

        Ok(Self {
            scheduler,
            coordinator,
            lock,
            stats: Arc::new(RwLock::new(SchedulerStats::default())),
            config,
            start_time: Utc::now(),
            shutdown,
        })
    }

    async fn run_and_record(
        coordinator: Arc<ScanCoordinator>,
        stats: Arc<RwLock<SchedulerStats>>,
        trigger: ScanTrigger,
        scope: ScanScope,
    ) -> RunOutcome {
        let outcome = coordinator.run_scoped(trigger, scope).await;
        stats.write().await.record(trigger, &outcome);
        outcome
    }

    /// Runs the pending manual request, if any. A request is only consumed
    /// when no live scan holds the lock, and is re-queued if the run lost the
    /// race for it.
    pub async fn poll_manual_request(
        coordinator: Arc<ScanCoordinator>,
        lock: Arc<ScanLock>,
        stats: Arc<RwLock<SchedulerStats>>,
    ) -> Option<RunOutcome> {
        match lock.status().await {
            Ok(status) if status.held && !status.stale => return None,
            Ok(_) => {}
            Err(e) => {
                tracing::warn!("Manual request poll failed: {}", e);
                return None;
            }
        }

        let scope = match lock.take_pending_request().await {
            Ok(Some(scope)) => scope,
            Ok(None) => return None,
            Err(e) => {
                tracing::warn!("Could not consume manual scan request: {}", e);
                return None;
            }
        };

        tracing::info!("Starting manual scan run");
        let outcome = Self::run_and_record(coordinator, stats, ScanTrigger::Manual, scope.clone()).await;
        if outcome == RunOutcome::Skipped {
            if let Err(e) = lock.request_manual_scan(scope).await {
                tracing::warn!("Could not re-queue manual scan request: {}", e);
            }
        }
        Some(outcome)
    }

    pub async fn start(&mut self) -> Result<()> {
        let coordinator = Arc::clone(&self.coordinator);
        let stats = Arc::clone(&self.stats);
        let tick = Job::new_repeated_async(self.config.tick_interval(), move |_uuid, _l| {
            let coordinator = Arc::clone(&coordinator);
            let stats = Arc::clone(&stats);
            Box::pin(async move {
                Self::run_and_record(coordinator, stats, ScanTrigger::Scheduled, ScanScope::all()).await;
            })
        })?;
        self.scheduler.add(tick).await?;

        let coordinator = Arc::clone(&self.coordinator);
        let lock = Arc::clone(&self.lock);
        let stats = Arc::clone(&self.stats);
        let poll = Job::new_repeated_async(self.config.manual_poll_interval(), move |_uuid, _l| {
            let coordinator = Arc::clone(&coordinator);
            let lock = Arc::clone(&lock);
            let stats = Arc::clone(&stats);
            Box::pin(async move {
                Self::poll_manual_request(coordinator, lock, stats).await;
            })
        })?;
        self.scheduler.add(poll).await?;

        self.scheduler.start().await?;
        tracing::info!(
            "Scan scheduler started: every {}s, manual poll every {}s",
            self.config.tick_interval,
            self.config.manual_poll_interval
        );

        // First run right away instead of waiting a full interval.
        tokio::spawn(Self::run_and_record(
            Arc::clone(&self.coordinator),
            Arc::clone(&self.stats),
            ScanTrigger::Scheduled,
            ScanScope::all(),
        ));
        Ok(())
    }

    pub async fn shutdown(&mut self) -> Result<()> {
        self.shutdown.cancel();
        self.scheduler.shutdown().await?;
        tracing::info!("Scan scheduler shutdown");
        Ok(())
    }

    pub async fn get_stats(&self) -> SchedulerStats {
        let mut stats = self.stats.read().await.clone();
        stats.uptime_seconds = (Utc::now() - self.start_time).num_seconds().max(0) as u64;
        stats
    }
}
