use chrono::Utc;
use futures::stream::{self, StreamExt};
use serde::Serialize;
use std::collections::HashSet;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::category_scanner::{CategoryScanResult, CategoryScanner};
use crate::config::AppConfig;
use crate::cooldown::ErrorCooldowns;
use crate::models::{
    generate_id, Category, CategoryScanUpdate, ScanJob, ScanJobStatus, ScanJobSummary, ScanScope, ScanTrigger,
};
use crate::proxy_pool::ProxyPool;
use crate::repository::Repository;
use crate::scan_lock::ScanLock;
use crate::scheduler::{select_due, select_manual};

const ORPHANED_JOB_MESSAGE: &str = "Orphaned: owning run stopped without finishing";

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct CoordinatorSettings {
    pub max_concurrency: usize,
    pub run_timeout: Duration,
    /// Consecutive structural failures before a category is disabled.
    pub auto_disable_after: u32,
}

impl Default for CoordinatorSettings {
    fn default() -> Self {
        Self::from(&AppConfig::default())
    }
}

impl From<&AppConfig> for CoordinatorSettings {
    fn from(config: &AppConfig) -> Self {
        Self {
            max_concurrency: config.scheduler.max_concurrency.max(1),
            run_timeout: config.scheduler.run_timeout(),
            auto_disable_after: config.categories.auto_disable_after,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum RunOutcome {
    /// Another live run holds the scan lock.
    Skipped,
    NothingDue,
    Finished { job_id: String, summary: ScanJobSummary },
    /// The run could not start; nothing was scanned.
    Aborted { reason: String },
}

enum CategoryOutcome {
    Scanned(CategoryScanResult),
    Cancelled,
}

/// Single entry point for a scan run. Never returns an error: every failure
/// degrades to a skipped run or a failed category recorded for next time.
pub struct ScanCoordinator {
    repo: Arc<dyn Repository>,
    lock: Arc<ScanLock>,
    cooldowns: Arc<ErrorCooldowns>,
    scanner: Arc<CategoryScanner>,
    proxies: Arc<ProxyPool>,
    settings: CoordinatorSettings,
    shutdown: CancellationToken,
}

impl ScanCoordinator {
    pub fn new(
        repo: Arc<dyn Repository>,
        lock: Arc<ScanLock>,
        cooldowns: Arc<ErrorCooldowns>,
        scanner: Arc<CategoryScanner>,
        proxies: Arc<ProxyPool>,
        settings: CoordinatorSettings,
    ) -> Self {
        Self {
            repo,
            lock,
            cooldowns,
            scanner,
            proxies,
            settings,
            shutdown: CancellationToken::new(),
        }
    }

    /// Cancelling `shutdown` aborts in-flight category scans.
    pub fn with_shutdown(mut self, shutdown: CancellationToken) -> Self {
        self.shutdown = shutdown;
        self
    }

    pub fn shutdown_token(&self) -> CancellationToken {
        self.shutdown.clone()
    }

    pub async fn run(&self, trigger: ScanTrigger) -> RunOutcome {
        self.run_scoped(trigger, ScanScope::all()).await
    }

    /// Scheduled runs pick due categories. Manual runs skip the interval
    /// check and are narrowed by `scope`.
    pub async fn run_scoped(&self, trigger: ScanTrigger, scope: ScanScope) -> RunOutcome {
        let run_id = generate_id();
        let started = Instant::now();
        metrics::counter!("scan_runs_total").increment(1);

        match self.lock.self_heal().await {
            Ok(true) => warn!("Recovered stale scan lock before run {}", run_id),
            Ok(false) => {}
            Err(e) => warn!("Stale lock check failed: {}", e),
        }

        let guard = match self.lock.acquire(&run_id).await {
            Ok(Some(guard)) => guard,
            Ok(None) => {
                info!("Scan already running, skipping {:?} run", trigger);
                metrics::counter!("scan_runs_skipped_total").increment(1);
                return RunOutcome::Skipped;
            }
            Err(e) => {
                error!("Scan lock unavailable: {}", e);
                return RunOutcome::Aborted {
                    reason: format!("scan lock unavailable: {}", e),
                };
            }
        };

        // Holding the lock means no other run is live.
        self.fail_orphaned_jobs().await;

        let stop_heartbeat = CancellationToken::new();
        let run_token = self.shutdown.child_token();
        let heartbeat = self
            .lock
            .spawn_heartbeat(Arc::clone(&guard), stop_heartbeat.clone(), run_token.clone());

        let outcome = self.execute(&run_id, trigger, &scope, &run_token).await;

        stop_heartbeat.cancel();
        if let Err(e) = heartbeat.await {
            warn!("Heartbeat task for run {} ended abnormally: {}", run_id, e);
        }
        match self.lock.release(&guard).await {
            Ok(true) => debug!("Released scan lock for run {}", run_id),
            Ok(false) => warn!("Scan lock for run {} was already taken over", run_id),
            Err(e) => warn!("Failed to release scan lock for run {}: {}", run_id, e),
        }
        if let Err(e) = self.repo.save_proxy_health(&self.proxies.snapshot()).await {
            warn!("Failed to persist proxy health: {}", e);
        }

        metrics::histogram!("scan_run_duration_seconds").record(started.elapsed().as_secs_f64());
        outcome
    }

    async fn fail_orphaned_jobs(&self) {
        for status in [ScanJobStatus::Running, ScanJobStatus::Pending] {
            let jobs = match self.repo.list_jobs_with_status(status).await {
                Ok(jobs) => jobs,
                Err(e) => {
                    warn!("Could not list {:?} scan jobs: {}", status, e);
                    continue;
                }
            };
            for job in jobs {
                match self.repo.fail_job(&job.id, ORPHANED_JOB_MESSAGE).await {
                    Ok(true) => warn!("Marked orphaned scan job {} (run {}) failed", job.id, job.run_id),
                    Ok(false) => {}
                    Err(e) => warn!("Could not fail orphaned job {}: {}", job.id, e),
                }
            }
        }
    }

    async fn execute(
        &self,
        run_id: &str,
        trigger: ScanTrigger,
        scope: &ScanScope,
        token: &CancellationToken,
    ) -> RunOutcome {
        let categories = match self.repo.list_enabled_categories().await {
            Ok(categories) => categories,
            Err(e) => {
                error!("Failed to load categories: {}", e);
                return RunOutcome::Aborted {
                    reason: format!("failed to load categories: {}", e),
                };
            }
        };

        let cooled = match self.cooldowns.cooled_categories(&categories).await {
            Ok(cooled) => cooled,
            Err(e) => {
                warn!("Cooldown lookup failed, scanning without it: {}", e);
                HashSet::new()
            }
        };

        let due = match trigger {
            ScanTrigger::Scheduled => select_due(&categories, Utc::now(), &cooled),
            ScanTrigger::Manual => select_manual(&categories, &cooled, scope),
        };
        if due.is_empty() {
            info!(
                "No categories due ({} enabled, {} cooling down)",
                categories.len(),
                cooled.len()
            );
            return RunOutcome::NothingDue;
        }

        let job = ScanJob::new(run_id, trigger, due.len() as i64);
        if let Err(e) = self.repo.create_scan_job(&job).await {
            error!("Failed to create scan job: {}", e);
            return RunOutcome::Aborted {
                reason: format!("failed to create scan job: {}", e),
            };
        }
        if let Err(e) = self.repo.mark_job_running(&job.id).await {
            warn!("Failed to mark scan job {} running: {}", job.id, e);
        }
        info!(
            "Scan run {} started: {} categories, concurrency {}",
            run_id,
            due.len(),
            self.settings.max_concurrency
        );

        let timer = {
            let token = token.clone();
            let timeout = self.settings.run_timeout;
            tokio::spawn(async move {
                tokio::select! {
                    _ = token.cancelled() => {}
                    _ = tokio::time::sleep(timeout) => {
                        warn!("Scan run exceeded {:?}, cancelling in-flight categories", timeout);
                        token.cancel();
                    }
                }
            })
        };

        let repo = &self.repo;
        let job_id = job.id.as_str();
        let summary = stream::iter(due)
            .map(|category| self.scan_one(category, token))
            .buffer_unordered(self.settings.max_concurrency)
            .fold(ScanJobSummary::default(), |mut summary, (category, outcome)| async move {
                summary.processed_items += 1;
                match outcome {
                    CategoryOutcome::Scanned(result) => {
                        summary.products_found += result.products_found;
                        summary.deals_found += result.deals_found;
                        summary.alerts_sent += result.alerts_sent;
                        match result.error {
                            None => summary.success_count += 1,
                            Some(failure) => {
                                summary.error_count += 1;
                                summary
                                    .errors
                                    .push(format!("{}: {}: {}", category.name, failure.class, failure.message));
                            }
                        }
                    }
                    CategoryOutcome::Cancelled => {
                        summary.error_count += 1;
                        summary.cancelled = true;
                        summary.errors.push(format!("{}: cancelled", category.name));
                    }
                }
                if let Err(e) = repo.record_job_progress(job_id, &summary).await {
                    debug!("Could not record progress for scan job {}: {}", job_id, e);
                }
                summary
            })
            .await;

        timer.abort();
        let mut summary = summary;
        summary.cancelled |= token.is_cancelled();

        match self.repo.finish_scan_job(&job.id, &summary).await {
            Ok(true) => {}
            Ok(false) => warn!("Scan job {} was already closed", job.id),
            Err(e) => error!("Failed to finish scan job {}: {}", job.id, e),
        }

        info!(
            "Scan run {} finished: {}/{} categories ok, {} products, {} deals, {} alerts{}",
            run_id,
            summary.success_count,
            summary.processed_items,
            summary.products_found,
            summary.deals_found,
            summary.alerts_sent,
            if summary.cancelled { " (cancelled)" } else { "" }
        );

        RunOutcome::Finished {
            job_id: job.id,
            summary,
        }
    }

    async fn scan_one(&self, category: Category, token: &CancellationToken) -> (Category, CategoryOutcome) {
        if token.is_cancelled() {
            return (category, CategoryOutcome::Cancelled);
        }

        let result = tokio::select! {
            _ = token.cancelled() => None,
            result = self.scanner.scan_category(&category) => Some(result),
        };

        match result {
            Some(result) => {
                self.record(&category, &result).await;
                (category, CategoryOutcome::Scanned(result))
            }
            None => {
                warn!("Scan of {} cancelled; category left unchanged", category.name);
                (category, CategoryOutcome::Cancelled)
            }
        }
    }

    /// One write per resolved category.
    async fn record(&self, category: &Category, result: &CategoryScanResult) {
        let structural = result.is_structural_failure();
        let streak = category.consecutive_structural_failures + 1;
        let disable = structural && streak >= i64::from(self.settings.auto_disable_after.max(1));

        if result.is_success() {
            metrics::counter!("categories_scanned_total").increment(1);
        } else {
            metrics::counter!("categories_failed_total").increment(1);
        }
        if disable {
            warn!(
                "Auto-disabling category {} ({}) after {} structural failures",
                category.name, category.store, streak
            );
            metrics::counter!("categories_auto_disabled_total").increment(1);
        }

        let update = CategoryScanUpdate {
            scanned_at: Utc::now(),
            products_found: result.products_found,
            deals_found: result.deals_found,
            error: result.error_message(),
            structural_failure: structural,
            disable,
        };
        if let Err(e) = self.repo.record_category_scan(&category.id, &update).await {
            error!("Failed to record scan of category {}: {}", category.id, e);
        }
    }
}
