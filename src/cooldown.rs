use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::HashSet;
use std::sync::Arc;

use crate::config::CooldownConfig;
use crate::models::{Category, ErrorClass};
use crate::store::AtomicTtlStore;
use crate::utils::error::Result;

fn cooldown_key(category_id: &str, class: ErrorClass) -> String {
    format!("cooldown:category:{}:{}", category_id, class)
}

#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct ActiveCooldown {
    pub class: ErrorClass,
    pub until: DateTime<Utc>,
}

/// Per (category, error class) cooldowns that keep a category out of
/// scheduling after blocking or transient failures.
pub struct ErrorCooldowns {
    store: Arc<dyn AtomicTtlStore>,
    config: CooldownConfig,
}

impl ErrorCooldowns {
    pub fn new(store: Arc<dyn AtomicTtlStore>, config: CooldownConfig) -> Self {
        Self { store, config }
    }

    /// Starts (or extends) the cooldown for `class`. Returns `None` for
    /// classes without a cooldown.
    pub async fn trip(&self, category_id: &str, class: ErrorClass) -> Result<Option<DateTime<Utc>>> {
        let Some(duration) = self.config.duration_for(class) else {
            return Ok(None);
        };

        let until = Utc::now() + chrono::Duration::from_std(duration).unwrap_or(chrono::Duration::zero());
        self.store
            .set(&cooldown_key(category_id, class), &until.to_rfc3339(), duration)
            .await?;

        tracing::warn!("Category {} cooling down after {} until {}", category_id, class, until);
        metrics::counter!("category_cooldowns_total", "class" => class.as_str()).increment(1);
        Ok(Some(until))
    }

    pub async fn active(&self, category_id: &str) -> Result<Vec<ActiveCooldown>> {
        let mut active = Vec::new();
        for class in ErrorClass::ALL {
            if self.config.duration_for(class).is_none() {
                continue;
            }
            if let Some(stored) = self.store.get(&cooldown_key(category_id, class)).await? {
                let until = DateTime::parse_from_rfc3339(&stored.value)
                    .map(|until| until.with_timezone(&Utc))
                    .unwrap_or_else(|_| Utc::now());
                active.push(ActiveCooldown { class, until });
            }
        }
        Ok(active)
    }

    pub async fn is_cooling(&self, category_id: &str) -> Result<bool> {
        Ok(!self.active(category_id).await?.is_empty())
    }

    /// Ids of the given categories with at least one active cooldown.
    pub async fn cooled_categories(&self, categories: &[Category]) -> Result<HashSet<String>> {
        let mut cooled = HashSet::new();
        for category in categories {
            if self.is_cooling(&category.id).await? {
                cooled.insert(category.id.clone());
            }
        }
        Ok(cooled)
    }

    /// Admin override: clears every cooldown on a category.
    pub async fn clear(&self, category_id: &str) -> Result<usize> {
        let mut cleared = 0;
        for class in ErrorClass::ALL {
            if self.store.delete(&cooldown_key(category_id, class)).await? {
                cleared += 1;
            }
        }
        Ok(cleared)
    }
}
