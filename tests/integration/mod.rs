// Integration tests for deal-radar
// These drive the coordinator end to end against the in-memory store and
// repository, with scripted pages standing in for the retailer sites.

pub mod coordinator_tests;
pub mod fetch_tests;
pub mod lock_tests;

use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use deal_radar::admin::Admin;
use deal_radar::category_scanner::CategoryScanner;
use deal_radar::config::AppConfig;
use deal_radar::cooldown::ErrorCooldowns;
use deal_radar::coordinator::{CoordinatorSettings, ScanCoordinator};
use deal_radar::dedupe::DedupeGate;
use deal_radar::fetcher::{FetchContext, FetchError, FetchedPage, PageFetcher};
use deal_radar::models::{Category, DetectedDeal, NewCategory};
use deal_radar::plugins::ParserRegistry;
use deal_radar::plugins::parsers::SelectorProfile;
use deal_radar::proxy_pool::ProxyPool;
use deal_radar::repository::{MemoryRepository, Repository};
use deal_radar::scan_lock::ScanLock;
use deal_radar::sink::DealSink;
use deal_radar::store::MemoryStore;

pub const STORE: &str = "shop";

pub fn category_url(name: &str) -> String {
    format!("https://shop.test/c/{}", name)
}

/// Selector profile matching the markup produced by [`listing`].
pub fn shop_profile() -> SelectorProfile {
    SelectorProfile {
        store: STORE.to_string(),
        base_url: Some("https://shop.test".to_string()),
        item: "div.product".to_string(),
        title: "a.title".to_string(),
        link: "a.title".to_string(),
        price: "span.now".to_string(),
        original_price: Some("span.was".to_string()),
        msrp: None,
        image: None,
        sku_attr: Some("data-sku".to_string()),
        sku_patterns: Vec::new(),
        next_page: Some("a.next".to_string()),
    }
}

/// A category page with `(sku, price, was)` cards.
pub fn listing(items: &[(&str, &str, &str)], next: Option<&str>) -> String {
    let mut html = String::from("<html><body>");
    for (sku, now, was) in items {
        html.push_str(&format!(
            r#"<div class="product" data-sku="{sku}"><a class="title" href="/p/{sku}">Item {sku}</a><span class="now">${now}</span><span class="was">${was}</span></div>"#
        ));
    }
    if let Some(next) = next {
        html.push_str(&format!(r#"<a class="next" href="{}">Next</a>"#, next));
    }
    html.push_str("</body></html>");
    html
}

/// One clearance card at 75% off and one at full price.
pub fn clearance_page(prefix: &str) -> String {
    listing(
        &[
            (&format!("{}-1", prefix), "49.99", "199.99"),
            (&format!("{}-2", prefix), "99.99", "99.99"),
        ],
        None,
    )
}

#[derive(Clone)]
pub enum Script {
    Page(String),
    Fail(FetchError),
    /// Never answers; only cancellation ends the fetch.
    Hang,
    Slow(Duration, String),
}

/// Answers fetches from a URL table and records the order of requests and
/// the peak number of fetches in flight. Unknown URLs answer 404.
#[derive(Default)]
pub struct ScriptedFetcher {
    scripts: Mutex<HashMap<String, Script>>,
    calls: Mutex<Vec<String>>,
    in_flight: AtomicUsize,
    peak: AtomicUsize,
}

struct InFlight<'a>(&'a AtomicUsize);

impl Drop for InFlight<'_> {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

impl ScriptedFetcher {
    pub fn set(&self, url: &str, script: Script) {
        self.scripts.lock().unwrap().insert(url.to_string(), script);
    }

    pub fn calls(&self) -> Vec<String> {
        self.calls.lock().unwrap().clone()
    }

    pub fn peak_in_flight(&self) -> usize {
        self.peak.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl PageFetcher for ScriptedFetcher {
    async fn fetch(&self, url: &str, _ctx: FetchContext<'_>) -> Result<FetchedPage, FetchError> {
        self.calls.lock().unwrap().push(url.to_string());
        let current = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.peak.fetch_max(current, Ordering::SeqCst);
        let _in_flight = InFlight(&self.in_flight);

        let script = self.scripts.lock().unwrap().get(url).cloned();

        let html = match script {
            Some(Script::Page(html)) => html,
            Some(Script::Fail(err)) => return Err(err),
            Some(Script::Hang) => std::future::pending::<String>().await,
            Some(Script::Slow(delay, html)) => {
                tokio::time::sleep(delay).await;
                html
            }
            None => return Err(FetchError::NotFound { url: url.to_string() }),
        };

        Ok(FetchedPage {
            html,
            status: 200,
            final_url: url.to_string(),
            attempts: 1,
            proxy_id: None,
        })
    }
}

#[derive(Default)]
pub struct RecordingSink {
    deals: Mutex<Vec<DetectedDeal>>,
}

impl RecordingSink {
    pub fn skus(&self) -> Vec<String> {
        let mut skus: Vec<_> = self.deals.lock().unwrap().iter().map(|d| d.product.sku.clone()).collect();
        skus.sort();
        skus
    }
}

#[async_trait]
impl DealSink for RecordingSink {
    async fn publish(&self, deal: &DetectedDeal) -> deal_radar::Result<()> {
        self.deals.lock().unwrap().push(deal.clone());
        Ok(())
    }
}

/// Test configuration for integration tests
pub fn get_test_config() -> AppConfig {
    let mut config = AppConfig::default();
    config.fetch.page_delay_min = 0.0;
    config.fetch.page_delay_max = 0.0;
    config.parsers.profiles = vec![shop_profile()];
    config
}

pub fn new_category(name: &str, priority: i64) -> NewCategory {
    NewCategory {
        name: name.to_string(),
        store: STORE.to_string(),
        url: category_url(name),
        max_pages: Some(3),
        scan_interval_minutes: Some(60),
        priority: Some(priority),
        min_discount_percent: None,
        min_price: None,
        max_price: None,
    }
}

pub struct TestApp {
    pub store: Arc<MemoryStore>,
    pub repo: MemoryRepository,
    pub lock: Arc<ScanLock>,
    pub cooldowns: Arc<ErrorCooldowns>,
    pub fetcher: Arc<ScriptedFetcher>,
    pub sink: Arc<RecordingSink>,
    pub coordinator: Arc<ScanCoordinator>,
    pub config: AppConfig,
}

impl TestApp {
    pub async fn add_category(&self, name: &str, priority: i64) -> anyhow::Result<Category> {
        Ok(self.repo.insert_category(new_category(name, priority)).await?)
    }

    /// Makes a category due again without touching its other state.
    pub async fn make_due(&self, id: &str) -> anyhow::Result<()> {
        let mut category = self.repo.get_category(id).await?;
        category.last_scanned = None;
        self.repo.put_category(category).await;
        Ok(())
    }

    pub fn admin(&self) -> Admin {
        Admin::new(
            Arc::new(self.repo.clone()),
            Arc::clone(&self.lock),
            Arc::clone(&self.cooldowns),
        )
    }

    /// A second coordinator sharing this app's store, repository and pages.
    pub async fn peer_coordinator(&self) -> anyhow::Result<ScanCoordinator> {
        build_coordinator(
            &self.config,
            Arc::clone(&self.store),
            self.repo.clone(),
            Arc::clone(&self.fetcher),
            Arc::clone(&self.sink),
            CoordinatorSettings::from(&self.config),
        )
        .await
    }
}

async fn build_coordinator(
    config: &AppConfig,
    store: Arc<MemoryStore>,
    repo: MemoryRepository,
    fetcher: Arc<ScriptedFetcher>,
    sink: Arc<RecordingSink>,
    settings: CoordinatorSettings,
) -> anyhow::Result<ScanCoordinator> {
    let lock = Arc::new(ScanLock::new(store.clone(), config.lock.clone()));
    let cooldowns = Arc::new(ErrorCooldowns::new(store.clone(), config.cooldowns.clone()));
    let parsers = ParserRegistry::from_profiles(&config.parsers.profiles).await?;
    let scanner = CategoryScanner::new(
        fetcher,
        parsers,
        Arc::new(DedupeGate::new(store, config.dedupe.clone())),
        sink,
        Arc::clone(&cooldowns),
        config,
    );

    Ok(ScanCoordinator::new(
        Arc::new(repo),
        lock,
        cooldowns,
        Arc::new(scanner),
        Arc::new(ProxyPool::empty()),
        settings,
    ))
}

pub async fn create_test_app_with(config: AppConfig, settings: CoordinatorSettings) -> anyhow::Result<TestApp> {
    let store = Arc::new(MemoryStore::new());
    let repo = MemoryRepository::new();
    let fetcher = Arc::new(ScriptedFetcher::default());
    let sink = Arc::new(RecordingSink::default());

    let coordinator = build_coordinator(
        &config,
        Arc::clone(&store),
        repo.clone(),
        Arc::clone(&fetcher),
        Arc::clone(&sink),
        settings,
    )
    .await?;

    Ok(TestApp {
        lock: Arc::new(ScanLock::new(store.clone(), config.lock.clone())),
        cooldowns: Arc::new(ErrorCooldowns::new(store.clone(), config.cooldowns.clone())),
        store,
        repo,
        fetcher,
        sink,
        coordinator: Arc::new(coordinator),
        config,
    })
}

pub async fn create_test_app() -> anyhow::Result<TestApp> {
    let config = get_test_config();
    let settings = CoordinatorSettings::from(&config);
    create_test_app_with(config, settings).await
}
