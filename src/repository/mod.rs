//! Persistence boundary for categories, scan jobs and proxy health.
//!
//! The scan engine only needs the narrow set of reads and writes below; the
//! admin surface that creates and edits categories lives elsewhere.

use async_trait::async_trait;

use crate::models::{
    Category, CategoryScanUpdate, NewCategory, ProxyConfig, ScanJob, ScanJobStatus, ScanJobSummary,
};
use crate::utils::error::Result;

pub mod memory;
pub mod sqlite;

pub use memory::MemoryRepository;
pub use sqlite::SqliteRepository;

#[async_trait]
pub trait Repository: Send + Sync {
    /// All categories, highest priority first.
    async fn list_categories(&self) -> Result<Vec<Category>>;

    async fn list_enabled_categories(&self) -> Result<Vec<Category>>;

    async fn get_category(&self, id: &str) -> Result<Category>;

    async fn insert_category(&self, new_category: NewCategory) -> Result<Category>;

    /// Applies one resolved scan in a single write: timestamps, counters,
    /// error fields, structural-failure streak and optional disable.
    async fn record_category_scan(&self, id: &str, update: &CategoryScanUpdate) -> Result<Category>;

    async fn set_category_enabled(&self, id: &str, enabled: bool) -> Result<()>;

    async fn create_scan_job(&self, job: &ScanJob) -> Result<()>;

    async fn get_scan_job(&self, id: &str) -> Result<ScanJob>;

    /// `false` if the job was no longer pending.
    async fn mark_job_running(&self, id: &str) -> Result<bool>;

    /// Writes running counters after each category; `false` unless running.
    async fn record_job_progress(&self, id: &str, summary: &ScanJobSummary) -> Result<bool>;

    /// `false` if the job had already reached a terminal state.
    async fn finish_scan_job(&self, id: &str, summary: &ScanJobSummary) -> Result<bool>;

    async fn list_jobs_with_status(&self, status: ScanJobStatus) -> Result<Vec<ScanJob>>;

    async fn fail_job(&self, id: &str, message: &str) -> Result<bool>;

    async fn add_proxy(&self, proxy: &ProxyConfig) -> Result<()>;

    async fn list_proxies(&self) -> Result<Vec<ProxyConfig>>;

    async fn save_proxy_health(&self, proxies: &[ProxyConfig]) -> Result<()>;
}

pub(crate) fn sort_categories(categories: &mut [Category]) {
    categories.sort_by(|a, b| b.priority.cmp(&a.priority).then_with(|| a.name.cmp(&b.name)));
}
