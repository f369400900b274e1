use chrono::Utc;
use std::sync::Arc;

use crate::config::DedupeConfig;
use crate::store::{AtomicTtlStore, TtlEntry};
use crate::utils::error::Result;

/// Decides whether a detected deal may be sent.
///
/// Two guards must both pass: no alert for the same (store, sku) inside the
/// dedupe window, and no per-product cooldown in effect. The windows are
/// tracked under separate keys so they can be tuned independently, and both
/// are recorded in one all-or-nothing write so concurrent detections of the
/// same product cannot both be allowed.
pub struct DedupeGate {
    store: Arc<dyn AtomicTtlStore>,
    config: DedupeConfig,
}

impl DedupeGate {
    pub fn new(store: Arc<dyn AtomicTtlStore>, config: DedupeConfig) -> Self {
        Self { store, config }
    }

    fn dedupe_key(store: &str, sku: &str) -> String {
        format!("alert:dedupe:{}:{}", store.to_lowercase(), sku)
    }

    fn cooldown_key(store: &str, sku: &str) -> String {
        format!("alert:cooldown:{}:{}", store.to_lowercase(), sku)
    }

    pub async fn allow(&self, store: &str, sku: &str) -> Result<bool> {
        let dedupe_key = Self::dedupe_key(store, sku);
        let cooldown_key = Self::cooldown_key(store, sku);
        let sent_at = Utc::now().to_rfc3339();

        let allowed = self
            .store
            .set_all_if_absent(&[
                TtlEntry {
                    key: &dedupe_key,
                    value: &sent_at,
                    ttl: self.config.ttl(),
                },
                TtlEntry {
                    key: &cooldown_key,
                    value: &sent_at,
                    ttl: self.config.cooldown(),
                },
            ])
            .await?;

        if allowed {
            metrics::counter!("alerts_allowed_total").increment(1);
        } else {
            tracing::debug!("Suppressed duplicate alert for {}/{}", store, sku);
            metrics::counter!("alerts_suppressed_total").increment(1);
        }
        Ok(allowed)
    }
}
