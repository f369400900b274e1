use async_trait::async_trait;
use chrono::Utc;
use sqlx::sqlite::{SqlitePool, SqlitePoolOptions};
use std::time::Duration;
use validator::Validate;

use super::Repository;
use crate::config::DatabaseConfig;
use crate::models::{
    Category, CategoryScanUpdate, NewCategory, ProxyConfig, ScanJob, ScanJobStatus, ScanJobSummary,
};
use crate::utils::error::{AppError, Result};

const SCHEMA: &[&str] = &[
    r#"
    CREATE TABLE IF NOT EXISTS categories (
        id TEXT PRIMARY KEY,
        name TEXT NOT NULL,
        store TEXT NOT NULL,
        url TEXT NOT NULL,
        max_pages INTEGER NOT NULL DEFAULT 3,
        scan_interval_minutes INTEGER NOT NULL DEFAULT 60,
        priority INTEGER NOT NULL DEFAULT 5,
        enabled BOOLEAN NOT NULL DEFAULT 1,
        min_discount_percent REAL NOT NULL DEFAULT 40.0,
        min_price REAL,
        max_price REAL,
        last_scanned TEXT,
        products_found INTEGER NOT NULL DEFAULT 0,
        deals_found INTEGER NOT NULL DEFAULT 0,
        last_error TEXT,
        last_error_at TEXT,
        consecutive_structural_failures INTEGER NOT NULL DEFAULT 0,
        created_at TEXT NOT NULL,
        updated_at TEXT NOT NULL,
        UNIQUE (store, url)
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS scan_jobs (
        id TEXT PRIMARY KEY,
        run_id TEXT NOT NULL,
        triggered_by TEXT NOT NULL,
        status TEXT NOT NULL,
        total_items INTEGER NOT NULL DEFAULT 0,
        processed_items INTEGER NOT NULL DEFAULT 0,
        success_count INTEGER NOT NULL DEFAULT 0,
        error_count INTEGER NOT NULL DEFAULT 0,
        products_found INTEGER NOT NULL DEFAULT 0,
        deals_found INTEGER NOT NULL DEFAULT 0,
        alerts_sent INTEGER NOT NULL DEFAULT 0,
        error_message TEXT,
        created_at TEXT NOT NULL,
        started_at TEXT,
        completed_at TEXT
    )
    "#,
    "CREATE INDEX IF NOT EXISTS idx_scan_jobs_status ON scan_jobs (status)",
    r#"
    CREATE TABLE IF NOT EXISTS proxies (
        id TEXT PRIMARY KEY,
        scheme TEXT NOT NULL DEFAULT 'http',
        host TEXT NOT NULL,
        port INTEGER NOT NULL,
        username TEXT,
        password TEXT,
        enabled BOOLEAN NOT NULL DEFAULT 1,
        last_used TEXT,
        last_success TEXT,
        failure_count INTEGER NOT NULL DEFAULT 0,
        disabled_at TEXT
    )
    "#,
];

const ACTIVE_STATUSES: &str = "('pending', 'running')";

#[derive(Clone)]
pub struct SqliteRepository {
    pool: SqlitePool,
}

impl SqliteRepository {
    pub async fn connect(config: &DatabaseConfig) -> Result<Self> {
        if let Some(path) = config.url.strip_prefix("sqlite://") {
            let path = path.split('?').next().unwrap_or_default();
            if let Some(parent) = std::path::Path::new(path).parent().filter(|p| !p.as_os_str().is_empty()) {
                std::fs::create_dir_all(parent)?;
            }
        }

        let pool = SqlitePoolOptions::new()
            .max_connections(config.max_connections)
            .min_connections(config.min_connections)
            .acquire_timeout(Duration::from_secs(config.acquire_timeout))
            .connect(&config.url)
            .await?;
        Self::with_pool(pool).await
    }

    /// Wraps an existing pool and creates the schema if needed.
    pub async fn with_pool(pool: SqlitePool) -> Result<Self> {
        for statement in SCHEMA {
            sqlx::query(statement).execute(&pool).await?;
        }
        tracing::debug!("SQLite schema ready");
        Ok(Self { pool })
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    async fn insert(&self, category: &Category) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO categories (
                id, name, store, url, max_pages, scan_interval_minutes, priority, enabled,
                min_discount_percent, min_price, max_price, last_scanned, products_found,
                deals_found, last_error, last_error_at, consecutive_structural_failures,
                created_at, updated_at
            ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(&category.id)
        .bind(&category.name)
        .bind(&category.store)
        .bind(&category.url)
        .bind(category.max_pages)
        .bind(category.scan_interval_minutes)
        .bind(category.priority)
        .bind(category.enabled)
        .bind(category.min_discount_percent)
        .bind(category.min_price)
        .bind(category.max_price)
        .bind(category.last_scanned)
        .bind(category.products_found)
        .bind(category.deals_found)
        .bind(&category.last_error)
        .bind(category.last_error_at)
        .bind(category.consecutive_structural_failures)
        .bind(category.created_at)
        .bind(category.updated_at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }
}

fn category_not_found(id: &str) -> AppError {
    AppError::NotFound {
        resource: format!("category {}", id),
    }
}

#[async_trait]
impl Repository for SqliteRepository {
    async fn list_categories(&self) -> Result<Vec<Category>> {
        let categories = sqlx::query_as::<_, Category>("SELECT * FROM categories ORDER BY priority DESC, name ASC")
            .fetch_all(&self.pool)
            .await?;
        Ok(categories)
    }

    async fn list_enabled_categories(&self) -> Result<Vec<Category>> {
        let categories = sqlx::query_as::<_, Category>(
            "SELECT * FROM categories WHERE enabled = 1 ORDER BY priority DESC, name ASC",
        )
        .fetch_all(&self.pool)
        .await?;
        Ok(categories)
    }

    async fn get_category(&self, id: &str) -> Result<Category> {
        sqlx::query_as::<_, Category>("SELECT * FROM categories WHERE id = ?")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?
            .ok_or_else(|| category_not_found(id))
    }

    async fn insert_category(&self, new_category: NewCategory) -> Result<Category> {
        new_category.validate()?;
        let category = Category::new(new_category);
        self.insert(&category).await?;
        Ok(category)
    }

    async fn record_category_scan(&self, id: &str, update: &CategoryScanUpdate) -> Result<Category> {
        let result = sqlx::query(
            r#"
            UPDATE categories SET
                last_scanned = ?1,
                products_found = products_found + ?2,
                deals_found = deals_found + ?3,
                last_error = ?4,
                last_error_at = CASE WHEN ?4 IS NOT NULL THEN ?1 ELSE last_error_at END,
                consecutive_structural_failures =
                    CASE WHEN ?5 THEN consecutive_structural_failures + 1 ELSE 0 END,
                enabled = CASE WHEN ?6 THEN 0 ELSE enabled END,
                updated_at = ?1
            WHERE id = ?7
            "#,
        )
        .bind(update.scanned_at)
        .bind(update.products_found)
        .bind(update.deals_found)
        .bind(&update.error)
        .bind(update.structural_failure)
        .bind(update.disable)
        .bind(id)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return Err(category_not_found(id));
        }
        self.get_category(id).await
    }

    async fn set_category_enabled(&self, id: &str, enabled: bool) -> Result<()> {
        let result = sqlx::query("UPDATE categories SET enabled = ?, updated_at = ? WHERE id = ?")
            .bind(enabled)
            .bind(Utc::now())
            .bind(id)
            .execute(&self.pool)
            .await?;

        if result.rows_affected() == 0 {
            return Err(category_not_found(id));
        }
        Ok(())
    }

    async fn create_scan_job(&self, job: &ScanJob) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO scan_jobs (
                id, run_id, triggered_by, status, total_items, processed_items, success_count,
                error_count, products_found, deals_found, alerts_sent, error_message,
                created_at, started_at, completed_at
            ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(&job.id)
        .bind(&job.run_id)
        .bind(job.triggered_by)
        .bind(job.status)
        .bind(job.total_items)
        .bind(job.processed_items)
        .bind(job.success_count)
        .bind(job.error_count)
        .bind(job.products_found)
        .bind(job.deals_found)
        .bind(job.alerts_sent)
        .bind(&job.error_message)
        .bind(job.created_at)
        .bind(job.started_at)
        .bind(job.completed_at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn get_scan_job(&self, id: &str) -> Result<ScanJob> {
        sqlx::query_as::<_, ScanJob>("SELECT * FROM scan_jobs WHERE id = ?")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?
            .ok_or_else(|| AppError::NotFound {
                resource: format!("scan job {}", id),
            })
    }

    async fn mark_job_running(&self, id: &str) -> Result<bool> {
        let result = sqlx::query(
            "UPDATE scan_jobs SET status = 'running', started_at = ? WHERE id = ? AND status = 'pending'",
        )
        .bind(Utc::now())
        .bind(id)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() == 1)
    }

    async fn record_job_progress(&self, id: &str, summary: &ScanJobSummary) -> Result<bool> {
        let error_message = (!summary.errors.is_empty()).then(|| summary.errors.join("; "));
        let result = sqlx::query(
            r#"
            UPDATE scan_jobs SET
                processed_items = ?, success_count = ?, error_count = ?,
                products_found = ?, deals_found = ?, alerts_sent = ?,
                error_message = COALESCE(?, error_message)
            WHERE id = ? AND status = 'running'
            "#,
        )
        .bind(summary.processed_items)
        .bind(summary.success_count)
        .bind(summary.error_count)
        .bind(summary.products_found)
        .bind(summary.deals_found)
        .bind(summary.alerts_sent)
        .bind(error_message)
        .bind(id)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() == 1)
    }

    async fn finish_scan_job(&self, id: &str, summary: &ScanJobSummary) -> Result<bool> {
        let mut job = self.get_scan_job(id).await?;
        if !job.finish(summary, Utc::now()) {
            return Ok(false);
        }

        let result = sqlx::query(&format!(
            r#"
            UPDATE scan_jobs SET
                status = ?, processed_items = ?, success_count = ?, error_count = ?,
                products_found = ?, deals_found = ?, alerts_sent = ?, error_message = ?,
                started_at = ?, completed_at = ?
            WHERE id = ? AND status IN {}
            "#,
            ACTIVE_STATUSES
        ))
        .bind(job.status)
        .bind(job.processed_items)
        .bind(job.success_count)
        .bind(job.error_count)
        .bind(job.products_found)
        .bind(job.deals_found)
        .bind(job.alerts_sent)
        .bind(&job.error_message)
        .bind(job.started_at)
        .bind(job.completed_at)
        .bind(id)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() == 1)
    }

    async fn list_jobs_with_status(&self, status: ScanJobStatus) -> Result<Vec<ScanJob>> {
        let jobs = sqlx::query_as::<_, ScanJob>("SELECT * FROM scan_jobs WHERE status = ? ORDER BY created_at ASC")
            .bind(status)
            .fetch_all(&self.pool)
            .await?;
        Ok(jobs)
    }

    async fn fail_job(&self, id: &str, message: &str) -> Result<bool> {
        let result = sqlx::query(&format!(
            "UPDATE scan_jobs SET status = 'failed', error_message = ?, completed_at = ? \
             WHERE id = ? AND status IN {}",
            ACTIVE_STATUSES
        ))
        .bind(message)
        .bind(Utc::now())
        .bind(id)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() == 1)
    }

    async fn add_proxy(&self, proxy: &ProxyConfig) -> Result<()> {
        sqlx::query(
            r#"
            INSERT OR REPLACE INTO proxies (
                id, scheme, host, port, username, password, enabled, last_used, last_success,
                failure_count, disabled_at
            ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(&proxy.id)
        .bind(&proxy.scheme)
        .bind(&proxy.host)
        .bind(proxy.port)
        .bind(&proxy.username)
        .bind(&proxy.password)
        .bind(proxy.enabled)
        .bind(proxy.last_used)
        .bind(proxy.last_success)
        .bind(proxy.failure_count)
        .bind(proxy.disabled_at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn list_proxies(&self) -> Result<Vec<ProxyConfig>> {
        let proxies = sqlx::query_as::<_, ProxyConfig>("SELECT * FROM proxies ORDER BY host, port")
            .fetch_all(&self.pool)
            .await?;
        Ok(proxies)
    }

    async fn save_proxy_health(&self, proxies: &[ProxyConfig]) -> Result<()> {
        let mut tx = self.pool.begin().await?;
        for proxy in proxies {
            sqlx::query(
                r#"
                UPDATE proxies SET
                    enabled = ?, last_used = ?, last_success = ?, failure_count = ?, disabled_at = ?
                WHERE id = ?
                "#,
            )
            .bind(proxy.enabled)
            .bind(proxy.last_used)
            .bind(proxy.last_success)
            .bind(proxy.failure_count)
            .bind(proxy.disabled_at)
            .bind(&proxy.id)
            .execute(&mut *tx)
            .await?;
        }
        tx.commit().await?;
        Ok(())
    }
}
