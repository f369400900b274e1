use rand::Rng;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};
use url::Url;

use crate::config::AppConfig;
use crate::cooldown::ErrorCooldowns;
use crate::dedupe::DedupeGate;
use crate::detector::{detect, DetectorSettings, StoreAdjustments};
use crate::fetcher::{detect_block_reason, FetchContext, PageFetcher};
use crate::models::{Category, DiscoveredProduct, ErrorClass};
use crate::plugins::ParserRegistry;
use crate::sink::DealSink;

const STALE_SELECTORS_MESSAGE: &str = "No products parsed; selectors may be stale";

#[derive(Debug, Clone, PartialEq)]
pub struct ScanFailure {
    pub class: ErrorClass,
    pub message: String,
    /// Stale configuration rather than transient blocking.
    pub structural: bool,
}

impl ScanFailure {
    fn new(class: ErrorClass, message: impl Into<String>) -> Self {
        Self {
            class,
            message: message.into(),
            structural: class.is_structural(),
        }
    }

    fn structural(class: ErrorClass, message: impl Into<String>) -> Self {
        Self {
            structural: true,
            ..Self::new(class, message)
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct CategoryScanResult {
    pub pages_scanned: u32,
    pub products_found: i64,
    pub deals_found: i64,
    pub alerts_sent: i64,
    pub error: Option<ScanFailure>,
    /// First page fetched fine but parsed to nothing, with no block marker.
    pub stale_selectors: bool,
}

impl CategoryScanResult {
    fn failed(failure: ScanFailure) -> Self {
        Self {
            error: Some(failure),
            ..Self::default()
        }
    }

    pub fn is_success(&self) -> bool {
        self.error.is_none()
    }

    pub fn is_structural_failure(&self) -> bool {
        self.stale_selectors || self.error.as_ref().is_some_and(|e| e.structural)
    }

    /// Text for the category's `last_error` field.
    pub fn error_message(&self) -> Option<String> {
        match &self.error {
            Some(failure) => Some(format!("{}: {}", failure.class, failure.message)),
            None if self.stale_selectors => Some(STALE_SELECTORS_MESSAGE.to_string()),
            None => None,
        }
    }
}

/// Scans one category: pages through its listing, scores products and hands
/// allowed deals to the sink.
pub struct CategoryScanner {
    fetcher: Arc<dyn PageFetcher>,
    parsers: ParserRegistry,
    adjustments: StoreAdjustments,
    settings: DetectorSettings,
    gate: Arc<DedupeGate>,
    sink: Arc<dyn DealSink>,
    cooldowns: Arc<ErrorCooldowns>,
    base_urls: HashMap<String, String>,
    page_delay: (f64, f64),
}

impl CategoryScanner {
    pub fn new(
        fetcher: Arc<dyn PageFetcher>,
        parsers: ParserRegistry,
        gate: Arc<DedupeGate>,
        sink: Arc<dyn DealSink>,
        cooldowns: Arc<ErrorCooldowns>,
        config: &AppConfig,
    ) -> Self {
        let base_urls = config
            .categories
            .store_base_urls
            .iter()
            .map(|(store, base)| (store.to_lowercase(), base.clone()))
            .collect();

        Self {
            fetcher,
            parsers,
            adjustments: StoreAdjustments::from_config(&config.detection),
            settings: DetectorSettings::from(&config.detection),
            gate,
            sink,
            cooldowns,
            base_urls,
            page_delay: (config.fetch.page_delay_min, config.fetch.page_delay_max),
        }
    }

    fn resolve_url(&self, category: &Category) -> Result<String, String> {
        if let Ok(url) = Url::parse(&category.url) {
            return Ok(url.to_string());
        }
        let base = self
            .base_urls
            .get(&category.store.to_lowercase())
            .ok_or_else(|| format!("relative URL {} and no base URL for store {}", category.url, category.store))?;
        Url::parse(base)
            .and_then(|base| base.join(&category.url))
            .map(String::from)
            .map_err(|e| format!("cannot resolve {} against {}: {}", category.url, base, e))
    }

    async fn page_pause(&self) {
        let (min, max) = self.page_delay;
        let secs = if max > min {
            rand::thread_rng().gen_range(min..max)
        } else {
            min
        };
        if secs > 0.0 {
            tokio::time::sleep(Duration::from_secs_f64(secs)).await;
        }
    }

    pub async fn scan_category(&self, category: &Category) -> CategoryScanResult {
        let Some(parser) = self.parsers.get(&category.store).await else {
            warn!("No parser registered for store {}", category.store);
            return CategoryScanResult::failed(ScanFailure::structural(
                ErrorClass::Other,
                format!("no parser registered for store {}", category.store),
            ));
        };

        let mut url = match self.resolve_url(category) {
            Ok(url) => url,
            Err(message) => return CategoryScanResult::failed(ScanFailure::structural(ErrorClass::Other, message)),
        };

        let ctx = FetchContext {
            category_id: &category.id,
            store: &category.store,
        };
        let mut result = CategoryScanResult::default();
        let mut products: Vec<DiscoveredProduct> = Vec::new();
        let mut seen = HashSet::new();
        let max_pages = category.max_pages.max(1) as u32;

        for page in 1..=max_pages {
            if page > 1 {
                self.page_pause().await;
            }

            let fetched = match self.fetcher.fetch(&url, ctx).await {
                Ok(fetched) => fetched,
                Err(e) if page == 1 => {
                    warn!("[{}] {} failed: {}", category.store, category.name, e);
                    return CategoryScanResult::failed(ScanFailure::new(e.class(), e.to_string()));
                }
                Err(e) => {
                    warn!(
                        "[{}] page {} of {} failed, keeping {} products: {}",
                        category.store,
                        page,
                        category.name,
                        products.len(),
                        e
                    );
                    break;
                }
            };
            result.pages_scanned += 1;

            let found = parser.parse(&fetched.html, &url);
            if found.is_empty() {
                if page == 1 {
                    if let Some(reason) = detect_block_reason(&fetched.html) {
                        warn!("[{}] {} blocked: {}", category.store, category.name, reason);
                        metrics::counter!("category_blocked_total").increment(1);
                        if let Err(e) = self.cooldowns.trip(&category.id, ErrorClass::Blocked).await {
                            warn!("Failed to record cooldown for category {}: {}", category.id, e);
                        }
                        return CategoryScanResult::failed(ScanFailure::new(ErrorClass::Blocked, reason));
                    }
                    warn!(
                        "[{}] {} returned no products, selectors may be stale",
                        category.store, category.name
                    );
                    result.stale_selectors = true;
                }
                break;
            }

            debug!("[{}] page {} of {}: {} products", category.store, page, category.name, found.len());
            products.extend(found.into_iter().filter(|p| seen.insert(p.sku.clone())));

            match parser.next_page_url(&fetched.html, &url) {
                Some(next) => url = next,
                None => break,
            }
        }

        result.products_found = products.len() as i64;
        self.score(category, &products, &mut result).await;

        info!(
            "[{}] {}: {} products, {} deals, {} alerts over {} pages",
            category.store,
            category.name,
            result.products_found,
            result.deals_found,
            result.alerts_sent,
            result.pages_scanned
        );
        result
    }

    async fn score(&self, category: &Category, products: &[DiscoveredProduct], result: &mut CategoryScanResult) {
        let thresholds = category.thresholds();
        let adjustment = self.adjustments.for_store(&category.store);

        for product in products {
            let deal = match detect(product, &thresholds, adjustment, &self.settings) {
                Ok(deal) if deal.is_significant => deal,
                Ok(_) => continue,
                Err(rejection) => {
                    debug!("[{}] {} not scored: {}", product.store, product.sku, rejection);
                    continue;
                }
            };

            result.deals_found += 1;
            metrics::counter!("deals_detected_total").increment(1);

            match self.gate.allow(&product.store, &product.sku).await {
                Ok(true) => match self.sink.publish(&deal).await {
                    Ok(()) => {
                        result.alerts_sent += 1;
                        metrics::counter!("alerts_sent_total").increment(1);
                    }
                    Err(e) => warn!("Failed to publish deal {}/{}: {}", product.store, product.sku, e),
                },
                Ok(false) => {}
                Err(e) => warn!("Dedupe gate unavailable for {}/{}: {}", product.store, product.sku, e),
            }
        }
    }
}
