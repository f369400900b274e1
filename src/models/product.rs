use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use crate::models::DetectionMethod;

/// A product read off a category page by a parser.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct DiscoveredProduct {
    pub sku: String,
    pub store: String,
    pub title: String,
    pub url: String,
    pub current_price: Decimal,
    /// Strikethrough "was" price.
    pub original_price: Option<Decimal>,
    pub msrp: Option<Decimal>,
    pub image_url: Option<String>,
}

impl DiscoveredProduct {
    pub fn has_strikethrough(&self) -> bool {
        self.original_price.is_some_and(|price| price > Decimal::ZERO)
    }

    pub fn has_msrp(&self) -> bool {
        self.msrp.is_some_and(|price| price > Decimal::ZERO)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct DetectedDeal {
    pub product: DiscoveredProduct,
    pub discount_percent: f64,
    pub confidence: f64,
    pub detection_method: DetectionMethod,
    pub effective_threshold: f64,
    pub is_significant: bool,
    pub is_price_error: bool,
    pub reason: String,
    pub detected_at: DateTime<Utc>,
}
