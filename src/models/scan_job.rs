use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;

use crate::models::{Category, ScanJobStatus, ScanTrigger, generate_id};

/// One coordinator run. Terminal states are final.
#[derive(Debug, Clone, Serialize, Deserialize, FromRow, PartialEq)]
pub struct ScanJob {
    pub id: String,
    pub run_id: String,
    pub triggered_by: ScanTrigger,
    pub status: ScanJobStatus,

    pub total_items: i64,
    pub processed_items: i64,
    pub success_count: i64,
    pub error_count: i64,
    pub products_found: i64,
    pub deals_found: i64,
    pub alerts_sent: i64,
    pub error_message: Option<String>,

    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
}

/// Narrows a manual run. An empty scope covers every enabled category.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct ScanScope {
    #[serde(default)]
    pub category_ids: Vec<String>,
    #[serde(default)]
    pub store: Option<String>,
}

impl ScanScope {
    pub fn all() -> Self {
        Self::default()
    }

    pub fn matches(&self, category: &Category) -> bool {
        let id_ok = self.category_ids.is_empty() || self.category_ids.iter().any(|id| *id == category.id);
        let store_ok = self
            .store
            .as_deref()
            .is_none_or(|store| store.eq_ignore_ascii_case(&category.store));
        id_ok && store_ok
    }
}

/// Aggregated category results folded into a job when the run ends.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct ScanJobSummary {
    pub processed_items: i64,
    pub success_count: i64,
    pub error_count: i64,
    pub products_found: i64,
    pub deals_found: i64,
    pub alerts_sent: i64,
    pub errors: Vec<String>,
    pub cancelled: bool,
}

impl ScanJob {
    pub fn new(run_id: &str, trigger: ScanTrigger, total_items: i64) -> Self {
        Self {
            id: generate_id(),
            run_id: run_id.to_string(),
            triggered_by: trigger,
            status: ScanJobStatus::Pending,
            total_items,
            processed_items: 0,
            success_count: 0,
            error_count: 0,
            products_found: 0,
            deals_found: 0,
            alerts_sent: 0,
            error_message: None,
            created_at: Utc::now(),
            started_at: None,
            completed_at: None,
        }
    }

    pub fn mark_running(&mut self, now: DateTime<Utc>) -> bool {
        if self.status != ScanJobStatus::Pending {
            return false;
        }
        self.status = ScanJobStatus::Running;
        self.started_at = Some(now);
        true
    }

    /// Completed unless the run was cancelled.
    pub fn finish(&mut self, summary: &ScanJobSummary, now: DateTime<Utc>) -> bool {
        if self.status.is_terminal() {
            return false;
        }

        self.apply_counters(summary);
        self.status = if summary.cancelled {
            ScanJobStatus::Failed
        } else {
            ScanJobStatus::Completed
        };
        self.started_at.get_or_insert(now);
        self.completed_at = Some(now);
        true
    }

    /// Mid-run counter update; only a running job takes it.
    pub fn record_progress(&mut self, summary: &ScanJobSummary) -> bool {
        if self.status != ScanJobStatus::Running {
            return false;
        }
        self.apply_counters(summary);
        true
    }

    fn apply_counters(&mut self, summary: &ScanJobSummary) {
        self.processed_items = summary.processed_items;
        self.success_count = summary.success_count;
        self.error_count = summary.error_count;
        self.products_found = summary.products_found;
        self.deals_found = summary.deals_found;
        self.alerts_sent = summary.alerts_sent;
        if !summary.errors.is_empty() {
            self.error_message = Some(summary.errors.join("; "));
        }
    }

    pub fn fail(&mut self, message: &str, now: DateTime<Utc>) -> bool {
        if self.status.is_terminal() {
            return false;
        }
        self.status = ScanJobStatus::Failed;
        self.error_message = Some(message.to_string());
        self.completed_at = Some(now);
        true
    }

    pub fn running_for(&self, now: DateTime<Utc>) -> Option<chrono::Duration> {
        match (self.status, self.started_at) {
            (ScanJobStatus::Running, Some(started)) => Some(now - started),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_job_lifecycle() {
        let mut job = ScanJob::new("run-1", ScanTrigger::Scheduled, 4);
        let now = Utc::now();
        assert_eq!(job.status, ScanJobStatus::Pending);

        assert!(job.mark_running(now));
        assert_eq!(job.status, ScanJobStatus::Running);
        assert!(!job.mark_running(now));

        let summary = ScanJobSummary {
            processed_items: 4,
            success_count: 3,
            error_count: 1,
            products_found: 120,
            deals_found: 5,
            alerts_sent: 2,
            errors: vec!["bestbuy/laptops: HTTP 403".to_string()],
            cancelled: false,
        };
        assert!(job.finish(&summary, now));
        assert_eq!(job.status, ScanJobStatus::Completed);
        assert_eq!(job.error_count, 1);
        assert_eq!(job.error_message.as_deref(), Some("bestbuy/laptops: HTTP 403"));
    }

    #[test]
    fn test_terminal_state_is_final() {
        let mut job = ScanJob::new("run-2", ScanTrigger::Manual, 1);
        let now = Utc::now();
        job.mark_running(now);

        assert!(job.fail("lock lost", now));
        assert!(!job.finish(&ScanJobSummary::default(), now));
        assert_eq!(job.status, ScanJobStatus::Failed);
        assert_eq!(job.error_message.as_deref(), Some("lock lost"));
    }

    #[test]
    fn test_cancelled_run_ends_failed() {
        let mut job = ScanJob::new("run-3", ScanTrigger::Scheduled, 2);
        let now = Utc::now();
        job.mark_running(now);

        let summary = ScanJobSummary {
            cancelled: true,
            ..Default::default()
        };
        job.finish(&summary, now);
        assert_eq!(job.status, ScanJobStatus::Failed);
    }

    #[test]
    fn test_running_for() {
        let mut job = ScanJob::new("run-4", ScanTrigger::Scheduled, 0);
        let now = Utc::now();
        assert!(job.running_for(now).is_none());

        job.mark_running(now - chrono::Duration::minutes(5));
        assert_eq!(job.running_for(now), Some(chrono::Duration::minutes(5)));
    }
}
