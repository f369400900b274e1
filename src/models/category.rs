use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;
use validator::Validate;

use crate::models::generate_id;

#[derive(Debug, Clone, Serialize, Deserialize, FromRow, PartialEq)]
pub struct Category {
    pub id: String,
    pub name: String,
    pub store: String,
    pub url: String,
    pub max_pages: i64,
    pub scan_interval_minutes: i64,
    pub priority: i64,
    pub enabled: bool,

    // Thresholds
    pub min_discount_percent: f64,
    pub min_price: Option<f64>,
    pub max_price: Option<f64>,

    // Scan tracking
    pub last_scanned: Option<DateTime<Utc>>,
    pub products_found: i64,
    pub deals_found: i64,
    pub last_error: Option<String>,
    pub last_error_at: Option<DateTime<Utc>>,
    pub consecutive_structural_failures: i64,

    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize, Validate)]
pub struct NewCategory {
    #[validate(length(min = 1, max = 200))]
    pub name: String,
    #[validate(length(min = 1, max = 64))]
    pub store: String,
    #[validate(length(min = 1))]
    pub url: String,
    #[validate(range(min = 1, max = 50))]
    pub max_pages: Option<i64>,
    #[validate(range(min = 1))]
    pub scan_interval_minutes: Option<i64>,
    #[validate(range(min = 1, max = 10))]
    pub priority: Option<i64>,
    #[validate(range(min = 0.0, max = 100.0))]
    pub min_discount_percent: Option<f64>,
    #[validate(range(min = 0.0))]
    pub min_price: Option<f64>,
    #[validate(range(min = 0.0))]
    pub max_price: Option<f64>,
}

/// Thresholds the deal detector reads for one category.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct CategoryThresholds {
    pub min_discount_percent: f64,
    pub min_price: Option<f64>,
    pub max_price: Option<f64>,
}

impl Default for CategoryThresholds {
    fn default() -> Self {
        Self {
            min_discount_percent: 40.0,
            min_price: Some(1.0),
            max_price: Some(10_000.0),
        }
    }
}

/// Outcome of one resolved category scan, written back in a single update.
#[derive(Debug, Clone, PartialEq)]
pub struct CategoryScanUpdate {
    pub scanned_at: DateTime<Utc>,
    pub products_found: i64,
    pub deals_found: i64,
    pub error: Option<String>,
    pub structural_failure: bool,
    pub disable: bool,
}

impl Category {
    pub fn new(new_category: NewCategory) -> Self {
        let now = Utc::now();
        let defaults = CategoryThresholds::default();
        Self {
            id: generate_id(),
            name: new_category.name,
            store: new_category.store.to_lowercase(),
            url: new_category.url,
            max_pages: new_category.max_pages.unwrap_or(3),
            scan_interval_minutes: new_category.scan_interval_minutes.unwrap_or(60),
            priority: new_category.priority.unwrap_or(5),
            enabled: true,
            min_discount_percent: new_category
                .min_discount_percent
                .unwrap_or(defaults.min_discount_percent),
            min_price: new_category.min_price.or(defaults.min_price),
            max_price: new_category.max_price.or(defaults.max_price),
            last_scanned: None,
            products_found: 0,
            deals_found: 0,
            last_error: None,
            last_error_at: None,
            consecutive_structural_failures: 0,
            created_at: now,
            updated_at: now,
        }
    }

    pub fn thresholds(&self) -> CategoryThresholds {
        CategoryThresholds {
            min_discount_percent: self.min_discount_percent,
            min_price: self.min_price,
            max_price: self.max_price,
        }
    }

    pub fn scan_interval(&self) -> Duration {
        Duration::minutes(self.scan_interval_minutes.max(0))
    }

    /// Never-scanned categories are always due.
    pub fn is_due(&self, now: DateTime<Utc>) -> bool {
        match self.last_scanned {
            Some(last) => now - last >= self.scan_interval(),
            None => true,
        }
    }

    pub fn apply_scan(&mut self, update: &CategoryScanUpdate) {
        self.last_scanned = Some(update.scanned_at);
        self.products_found += update.products_found;
        self.deals_found += update.deals_found;

        match &update.error {
            Some(message) => {
                self.last_error = Some(message.clone());
                self.last_error_at = Some(update.scanned_at);
            }
            None => {
                self.last_error = None;
            }
        }

        if update.structural_failure {
            self.consecutive_structural_failures += 1;
        } else {
            self.consecutive_structural_failures = 0;
        }

        if update.disable {
            self.enabled = false;
        }

        self.updated_at = update.scanned_at;
    }
}
