use chrono::Utc;
use rust_decimal::Decimal;
use rust_decimal::prelude::ToPrimitive;
use std::collections::HashMap;
use thiserror::Error;

use crate::config::DetectionConfig;
use crate::models::{CategoryThresholds, DetectedDeal, DetectionMethod, DiscoveredProduct};

const BASE_CONFIDENCE: f64 = 0.5;
const STRIKETHROUGH_BONUS: f64 = 0.15;
const MSRP_BONUS: f64 = 0.10;
const COMBINED_BONUS: f64 = 0.15;
const MIN_CONFIDENCE: f64 = 0.1;
const MAX_CONFIDENCE: f64 = 1.0;

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct StoreAdjustment {
    pub min_discount_multiplier: f64,
}

impl Default for StoreAdjustment {
    fn default() -> Self {
        Self {
            min_discount_multiplier: 1.0,
        }
    }
}

/// Per-store threshold multipliers, loaded once at startup.
#[derive(Debug, Clone, Default)]
pub struct StoreAdjustments {
    table: HashMap<String, StoreAdjustment>,
}

impl StoreAdjustments {
    pub fn from_config(config: &DetectionConfig) -> Self {
        let table = config
            .store_adjustments
            .iter()
            .map(|(store, multiplier)| {
                (
                    store.to_lowercase(),
                    StoreAdjustment {
                        min_discount_multiplier: *multiplier,
                    },
                )
            })
            .collect();
        Self { table }
    }

    pub fn for_store(&self, store: &str) -> StoreAdjustment {
        self.table
            .get(&store.to_lowercase())
            .copied()
            .unwrap_or_default()
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct DetectorSettings {
    pub min_confidence: f64,
    /// Discount beyond `effective_threshold * price_error_multiplier` marks a
    /// likely pricing mistake rather than a good deal.
    pub price_error_multiplier: f64,
}

impl Default for DetectorSettings {
    fn default() -> Self {
        Self {
            min_confidence: 0.6,
            price_error_multiplier: 2.0,
        }
    }
}

impl From<&DetectionConfig> for DetectorSettings {
    fn from(config: &DetectionConfig) -> Self {
        Self {
            min_confidence: config.min_confidence,
            price_error_multiplier: config.price_error_multiplier,
        }
    }
}

/// Why a product was not scored.
#[derive(Debug, Clone, Error, PartialEq)]
pub enum Rejection {
    #[error("price {price} is not positive")]
    InvalidPrice { price: Decimal },
    #[error("price {price} outside category range")]
    OutOfPriceRange { price: Decimal },
    #[error("no strikethrough or MSRP reference price")]
    NoReferencePrice,
    #[error("price is not below the reference price")]
    NoDiscount,
}

fn percent_off(reference: Decimal, current: Decimal) -> Option<f64> {
    if reference <= Decimal::ZERO {
        return None;
    }
    reference
        .checked_sub(current)?
        .checked_div(reference)?
        .checked_mul(Decimal::ONE_HUNDRED)?
        .round_dp(2)
        .to_f64()
}

fn band_adjustment(discount_percent: f64) -> f64 {
    if discount_percent >= 95.0 {
        // Suspicious outlier.
        -0.10
    } else if discount_percent >= 85.0 {
        0.10
    } else if discount_percent >= 70.0 {
        0.15
    } else if discount_percent >= 50.0 {
        0.20
    } else {
        0.0
    }
}

pub fn confidence(discount_percent: f64, has_strikethrough: bool, has_msrp: bool) -> f64 {
    let mut score = BASE_CONFIDENCE + band_adjustment(discount_percent);
    if has_strikethrough {
        score += STRIKETHROUGH_BONUS;
    }
    if has_msrp {
        score += MSRP_BONUS;
    }
    if has_strikethrough && has_msrp {
        score += COMBINED_BONUS;
    }
    let score = score.clamp(MIN_CONFIDENCE, MAX_CONFIDENCE);
    (score * 100.0).round() / 100.0
}

fn in_range(price: f64, thresholds: &CategoryThresholds) -> bool {
    thresholds.min_price.is_none_or(|min| price >= min) && thresholds.max_price.is_none_or(|max| price <= max)
}

/// Scores one product against its category thresholds and store adjustment.
pub fn detect(
    product: &DiscoveredProduct,
    thresholds: &CategoryThresholds,
    adjustment: StoreAdjustment,
    settings: &DetectorSettings,
) -> Result<DetectedDeal, Rejection> {
    let current = product.current_price;
    if current <= Decimal::ZERO {
        return Err(Rejection::InvalidPrice { price: current });
    }

    let current_f64 = current.to_f64().unwrap_or(f64::MAX);
    if !in_range(current_f64, thresholds) {
        return Err(Rejection::OutOfPriceRange { price: current });
    }

    let has_strikethrough = product.has_strikethrough();
    let has_msrp = product.has_msrp();

    let (reference, detection_method) = match (product.original_price, has_strikethrough, has_msrp) {
        (Some(original), true, true) => (original, DetectionMethod::Combined),
        (Some(original), true, false) => (original, DetectionMethod::Strikethrough),
        (_, false, true) => match product.msrp {
            Some(msrp) => (msrp, DetectionMethod::Msrp),
            None => return Err(Rejection::NoReferencePrice),
        },
        _ => return Err(Rejection::NoReferencePrice),
    };

    let discount_percent = match percent_off(reference, current) {
        Some(discount) if discount > 0.0 => discount,
        _ => return Err(Rejection::NoDiscount),
    };

    let effective_threshold = thresholds.min_discount_percent * adjustment.min_discount_multiplier;
    let confidence = confidence(discount_percent, has_strikethrough, has_msrp);
    let is_significant = discount_percent >= effective_threshold && confidence >= settings.min_confidence;
    let is_price_error =
        is_significant && discount_percent >= effective_threshold * settings.price_error_multiplier;

    let mut reason = format!("{:.1}% off", discount_percent);
    match detection_method {
        DetectionMethod::Combined => reason.push_str(" (strikethrough and MSRP)"),
        DetectionMethod::Strikethrough => reason.push_str(" (strikethrough)"),
        DetectionMethod::Msrp => reason.push_str(" (MSRP)"),
    }
    reason.push_str(&format!(
        ", threshold {:.2}%, confidence {:.2}",
        effective_threshold, confidence
    ));
    if is_price_error {
        reason.push_str(", likely price error");
    }

    Ok(DetectedDeal {
        product: product.clone(),
        discount_percent,
        confidence,
        detection_method,
        effective_threshold,
        is_significant,
        is_price_error,
        reason,
        detected_at: Utc::now(),
    })
}
