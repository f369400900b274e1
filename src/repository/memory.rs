use async_trait::async_trait;
use chrono::Utc;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::RwLock;
use validator::Validate;

use super::{sort_categories, Repository};
use crate::models::{
    Category, CategoryScanUpdate, NewCategory, ProxyConfig, ScanJob, ScanJobStatus, ScanJobSummary,
};
use crate::utils::error::{AppError, Result};

fn category_not_found(id: &str) -> AppError {
    AppError::NotFound {
        resource: format!("category {}", id),
    }
}

fn job_not_found(id: &str) -> AppError {
    AppError::NotFound {
        resource: format!("scan job {}", id),
    }
}

/// In-process repository for single-node runs and tests.
#[derive(Clone, Default)]
pub struct MemoryRepository {
    categories: Arc<RwLock<HashMap<String, Category>>>,
    jobs: Arc<RwLock<HashMap<String, ScanJob>>>,
    proxies: Arc<RwLock<Vec<ProxyConfig>>>,
}

impl MemoryRepository {
    pub fn new() -> Self {
        Self::default()
    }

    /// Stores a category as-is, keeping its id and timestamps.
    pub async fn put_category(&self, category: Category) {
        let mut categories = self.categories.write().await;
        categories.insert(category.id.clone(), category);
    }
}

#[async_trait]
impl Repository for MemoryRepository {
    async fn list_categories(&self) -> Result<Vec<Category>> {
        let categories = self.categories.read().await;
        let mut list: Vec<_> = categories.values().cloned().collect();
        sort_categories(&mut list);
        Ok(list)
    }

    async fn list_enabled_categories(&self) -> Result<Vec<Category>> {
        let mut list = self.list_categories().await?;
        list.retain(|c| c.enabled);
        Ok(list)
    }

    async fn get_category(&self, id: &str) -> Result<Category> {
        let categories = self.categories.read().await;
        categories.get(id).cloned().ok_or_else(|| category_not_found(id))
    }

    async fn insert_category(&self, new_category: NewCategory) -> Result<Category> {
        new_category.validate()?;
        let category = Category::new(new_category);
        self.put_category(category.clone()).await;
        Ok(category)
    }

    async fn record_category_scan(&self, id: &str, update: &CategoryScanUpdate) -> Result<Category> {
        let mut categories = self.categories.write().await;
        let category = categories.get_mut(id).ok_or_else(|| category_not_found(id))?;
        category.apply_scan(update);
        Ok(category.clone())
    }

    async fn set_category_enabled(&self, id: &str, enabled: bool) -> Result<()> {
        let mut categories = self.categories.write().await;
        let category = categories.get_mut(id).ok_or_else(|| category_not_found(id))?;
        category.enabled = enabled;
        category.updated_at = Utc::now();
        Ok(())
    }

    async fn create_scan_job(&self, job: &ScanJob) -> Result<()> {
        let mut jobs = self.jobs.write().await;
        jobs.insert(job.id.clone(), job.clone());
        Ok(())
    }

    async fn get_scan_job(&self, id: &str) -> Result<ScanJob> {
        let jobs = self.jobs.read().await;
        jobs.get(id).cloned().ok_or_else(|| job_not_found(id))
    }

    async fn mark_job_running(&self, id: &str) -> Result<bool> {
        let mut jobs = self.jobs.write().await;
        let job = jobs.get_mut(id).ok_or_else(|| job_not_found(id))?;
        Ok(job.mark_running(Utc::now()))
    }

    async fn record_job_progress(&self, id: &str, summary: &ScanJobSummary) -> Result<bool> {
        let mut jobs = self.jobs.write().await;
        let job = jobs.get_mut(id).ok_or_else(|| job_not_found(id))?;
        Ok(job.record_progress(summary))
    }

    async fn finish_scan_job(&self, id: &str, summary: &ScanJobSummary) -> Result<bool> {
        let mut jobs = self.jobs.write().await;
        let job = jobs.get_mut(id).ok_or_else(|| job_not_found(id))?;
        Ok(job.finish(summary, Utc::now()))
    }

    async fn list_jobs_with_status(&self, status: ScanJobStatus) -> Result<Vec<ScanJob>> {
        let jobs = self.jobs.read().await;
        let mut list: Vec<_> = jobs.values().filter(|j| j.status == status).cloned().collect();
        list.sort_by_key(|j| j.created_at);
        Ok(list)
    }

    async fn fail_job(&self, id: &str, message: &str) -> Result<bool> {
        let mut jobs = self.jobs.write().await;
        let job = jobs.get_mut(id).ok_or_else(|| job_not_found(id))?;
        Ok(job.fail(message, Utc::now()))
    }

    async fn add_proxy(&self, proxy: &ProxyConfig) -> Result<()> {
        let mut proxies = self.proxies.write().await;
        proxies.retain(|p| p.id != proxy.id);
        proxies.push(proxy.clone());
        Ok(())
    }

    async fn list_proxies(&self) -> Result<Vec<ProxyConfig>> {
        Ok(self.proxies.read().await.clone())
    }

    async fn save_proxy_health(&self, snapshot: &[ProxyConfig]) -> Result<()> {
        let mut proxies = self.proxies.write().await;
        for proxy in proxies.iter_mut() {
            if let Some(health) = snapshot.iter().find(|p| p.id == proxy.id) {
                proxy.enabled = health.enabled;
                proxy.last_used = health.last_used;
                proxy.last_success = health.last_success;
                proxy.failure_count = health.failure_count;
                proxy.disabled_at = health.disabled_at;
            }
        }
        Ok(())
    }
}
