use async_trait::async_trait;
use reqwest::Client;
use serde_json::json;
use std::time::Duration;

use crate::config::NotificationsConfig;
use crate::models::DetectedDeal;
use crate::utils::error::{AppError, Result};

/// Downstream boundary for deals that passed the dedupe gate. Formatting and
/// delivery channels belong to the collaborator behind it.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait DealSink: Send + Sync {
    async fn publish(&self, deal: &DetectedDeal) -> Result<()>;
}

/// Writes deals to the log. Used when no webhook is configured.
#[derive(Debug, Default, Clone)]
pub struct TracingSink;

#[async_trait]
impl DealSink for TracingSink {
    async fn publish(&self, deal: &DetectedDeal) -> Result<()> {
        tracing::info!(
            store = %deal.product.store,
            sku = %deal.product.sku,
            discount = deal.discount_percent,
            confidence = deal.confidence,
            price_error = deal.is_price_error,
            "Deal: {} at {} ({})",
            deal.product.title,
            deal.product.current_price,
            deal.reason
        );
        Ok(())
    }
}

/// POSTs each deal as JSON to a webhook.
pub struct WebhookSink {
    client: Client,
    url: String,
}

impl WebhookSink {
    pub fn new(url: &str, timeout: Duration) -> Result<Self> {
        let client = Client::builder().timeout(timeout).build()?;
        Ok(Self {
            client,
            url: url.to_string(),
        })
    }

    fn payload(deal: &DetectedDeal) -> serde_json::Value {
        json!({
            "event": if deal.is_price_error { "price_error" } else { "deal" },
            "deal": deal,
        })
    }
}

#[async_trait]
impl DealSink for WebhookSink {
    async fn publish(&self, deal: &DetectedDeal) -> Result<()> {
        let response = self.client.post(&self.url).json(&Self::payload(deal)).send().await?;

        if !response.status().is_success() {
            return Err(AppError::Notification(format!(
                "webhook returned {} for {}/{}",
                response.status(),
                deal.product.store,
                deal.product.sku
            )));
        }
        Ok(())
    }
}

/// Webhook sink when a URL is configured, tracing sink otherwise.
pub fn from_config(config: &NotificationsConfig) -> Result<Box<dyn DealSink>> {
    match &config.webhook_url {
        Some(url) => Ok(Box::new(WebhookSink::new(url, Duration::from_secs(config.webhook_timeout))?)),
        None => Ok(Box::new(TracingSink)),
    }
}
