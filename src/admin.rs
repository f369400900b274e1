use chrono::{DateTime, Utc};
use serde::Serialize;
use std::sync::Arc;

use crate::cooldown::{ActiveCooldown, ErrorCooldowns};
use crate::models::{ScanJob, ScanJobStatus, ScanScope};
use crate::repository::Repository;
use crate::scan_lock::{LockRecord, LockStatus, ManualScanRequest, ScanLock};
use crate::utils::error::Result;

const FORCE_UNLOCK_MESSAGE: &str = "Failed by force-unlock recovery";

#[derive(Debug, Clone, Copy, Serialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum StuckReason {
    /// Running longer than `lock.stuck_job_after`.
    Overdue,
    /// Running while the lock heartbeat is stale.
    StaleHeartbeat,
    /// Running with no lock held at all.
    NoLock,
}

#[derive(Debug, Clone, Serialize)]
pub struct StuckJob {
    pub job: ScanJob,
    pub running_secs: Option<i64>,
    pub reason: StuckReason,
}

#[derive(Debug, Clone, Serialize)]
pub struct CategoryCooldowns {
    pub category_id: String,
    pub name: String,
    pub cooldowns: Vec<ActiveCooldown>,
}

#[derive(Debug, Clone, Serialize)]
pub struct Diagnostics {
    pub checked_at: DateTime<Utc>,
    pub lock: LockStatus,
    pub running_jobs: usize,
    pub stuck_jobs: Vec<StuckJob>,
    pub cooling_categories: Vec<CategoryCooldowns>,
    pub disabled_categories: Vec<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct ForceUnlockReport {
    pub cleared: Option<LockRecord>,
    pub failed_jobs: Vec<String>,
}

/// Operator recovery and inspection, shared by the CLI subcommands.
pub struct Admin {
    repo: Arc<dyn Repository>,
    lock: Arc<ScanLock>,
    cooldowns: Arc<ErrorCooldowns>,
}

impl Admin {
    pub fn new(repo: Arc<dyn Repository>, lock: Arc<ScanLock>, cooldowns: Arc<ErrorCooldowns>) -> Self {
        Self { repo, lock, cooldowns }
    }

    fn stuck_reason(&self, job: &ScanJob, lock: &LockStatus, now: DateTime<Utc>) -> Option<StuckReason> {
        let overdue = job
            .running_for(now)
            .and_then(|running| running.to_std().ok())
            .is_some_and(|running| running > self.lock.config().stuck_job_after());

        if overdue {
            Some(StuckReason::Overdue)
        } else if !lock.held {
            Some(StuckReason::NoLock)
        } else if lock.stale {
            Some(StuckReason::StaleHeartbeat)
        } else {
            None
        }
    }

    pub async fn diagnostics(&self) -> Result<Diagnostics> {
        let now = Utc::now();
        let lock = self.lock.status().await?;
        let running = self.repo.list_jobs_with_status(ScanJobStatus::Running).await?;

        let stuck_jobs = running
            .iter()
            .filter_map(|job| {
                self.stuck_reason(job, &lock, now).map(|reason| StuckJob {
                    job: job.clone(),
                    running_secs: job.running_for(now).map(|d| d.num_seconds()),
                    reason,
                })
            })
            .collect();

        let mut cooling_categories = Vec::new();
        let mut disabled_categories = Vec::new();
        for category in self.repo.list_categories().await? {
            if !category.enabled {
                disabled_categories.push(category.name.clone());
            }
            let cooldowns = self.cooldowns.active(&category.id).await?;
            if !cooldowns.is_empty() {
                cooling_categories.push(CategoryCooldowns {
                    category_id: category.id,
                    name: category.name,
                    cooldowns,
                });
            }
        }

        Ok(Diagnostics {
            checked_at: now,
            lock,
            running_jobs: running.len(),
            stuck_jobs,
            cooling_categories,
            disabled_categories,
        })
    }

    /// Clears the lock whatever its state and fails every running job, since
    /// no run can still own one once the lock is gone.
    pub async fn force_unlock(&self) -> Result<ForceUnlockReport> {
        let cleared = self.lock.force_unlock().await?;

        let mut failed_jobs = Vec::new();
        for job in self.repo.list_jobs_with_status(ScanJobStatus::Running).await? {
            if self.repo.fail_job(&job.id, FORCE_UNLOCK_MESSAGE).await? {
                tracing::warn!("Marked scan job {} (run {}) failed", job.id, job.run_id);
                failed_jobs.push(job.id);
            }
        }

        metrics::counter!("scan_lock_force_unlocks_total").increment(1);
        Ok(ForceUnlockReport { cleared, failed_jobs })
    }

    pub async fn request_manual_scan(&self, scope: ScanScope) -> Result<ManualScanRequest> {
        self.lock.request_manual_scan(scope).await
    }

    /// Clears every cooldown on a category and re-enables it.
    pub async fn reset_category(&self, category_id: &str) -> Result<usize> {
        let category = self.repo.get_category(category_id).await?;
        let cleared = self.cooldowns.clear(&category.id).await?;
        if !category.enabled {
            self.repo.set_category_enabled(&category.id, true).await?;
        }
        tracing::info!(
            "Reset category {}: {} cooldowns cleared, enabled",
            category.name,
            cleared
        );
        Ok(cleared)
    }
}
