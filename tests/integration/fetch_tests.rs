use super::*;
use wiremock::matchers::{header_exists, method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

use deal_radar::fetcher::{HttpFetcher, ReqwestTransport};
use deal_radar::models::{ScanTrigger, Category};
use deal_radar::RunOutcome;

struct HttpApp {
    repo: MemoryRepository,
    sink: Arc<RecordingSink>,
    coordinator: ScanCoordinator,
}

async fn http_app(server: &MockServer, name: &str) -> anyhow::Result<(HttpApp, Category)> {
    let config = get_test_config();
    let store = Arc::new(MemoryStore::new());
    let repo = MemoryRepository::new();
    let sink = Arc::new(RecordingSink::default());
    let cooldowns = Arc::new(ErrorCooldowns::new(store.clone(), config.cooldowns.clone()));
    let proxies = Arc::new(ProxyPool::empty());

    let fetcher = HttpFetcher::new(
        Arc::new(ReqwestTransport),
        Arc::clone(&proxies),
        Arc::clone(&cooldowns),
        config.fetch.clone(),
    );
    let scanner = CategoryScanner::new(
        Arc::new(fetcher),
        ParserRegistry::from_profiles(&config.parsers.profiles).await?,
        Arc::new(DedupeGate::new(store.clone(), config.dedupe.clone())),
        Arc::clone(&sink) as Arc<dyn DealSink>,
        Arc::clone(&cooldowns),
        &config,
    );
    let coordinator = ScanCoordinator::new(
        Arc::new(repo.clone()),
        Arc::new(ScanLock::new(store, config.lock.clone())),
        cooldowns,
        Arc::new(scanner),
        proxies,
        CoordinatorSettings::from(&config),
    );

    let mut new = new_category(name, 5);
    new.url = format!("{}/c/{}", server.uri(), name);
    let category = repo.insert_category(new).await?;

    Ok((HttpApp { repo, sink, coordinator }, category))
}

#[tokio::test]
async fn test_http_scan_end_to_end() -> anyhow::Result<()> {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/c/laptops"))
        .and(header_exists("user-agent"))
        .respond_with(ResponseTemplate::new(200).set_body_string(clearance_page("lap")))
        .expect(1)
        .mount(&server)
        .await;

    let (app, category) = http_app(&server, "laptops").await?;
    let outcome = app.coordinator.run(ScanTrigger::Manual).await;

    match outcome {
        RunOutcome::Finished { summary, .. } => {
            assert_eq!(summary.success_count, 1);
            assert_eq!(summary.products_found, 2);
            assert_eq!(summary.alerts_sent, 1);
        }
        other => panic!("expected a finished run, got {:?}", other),
    }
    assert_eq!(app.sink.skus(), vec!["lap-1"]);
    assert!(app.repo.get_category(&category.id).await?.last_error.is_none());
    Ok(())
}

#[tokio::test]
async fn test_http_404_is_not_retried_and_counts_as_structural() -> anyhow::Result<()> {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/c/retired"))
        .respond_with(ResponseTemplate::new(404))
        .expect(1)
        .mount(&server)
        .await;

    let (app, category) = http_app(&server, "retired").await?;
    app.coordinator.run(ScanTrigger::Manual).await;

    let category = app.repo.get_category(&category.id).await?;
    assert_eq!(category.consecutive_structural_failures, 1);
    assert!(category.enabled);
    assert!(category.last_error.as_deref().is_some_and(|e| e.starts_with("not_found")));
    Ok(())
}
