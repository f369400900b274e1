use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::prelude::*;
use tracing_subscriber::{fmt, EnvFilter};

use deal_radar::admin::Admin;
use deal_radar::category_scanner::CategoryScanner;
use deal_radar::config::{AppConfig, LoggingConfig};
use deal_radar::cooldown::ErrorCooldowns;
use deal_radar::coordinator::{CoordinatorSettings, ScanCoordinator};
use deal_radar::dedupe::DedupeGate;
use deal_radar::fetcher::{HttpFetcher, ReqwestTransport};
use deal_radar::models::{ScanScope, ScanTrigger};
use deal_radar::plugins::ParserRegistry;
use deal_radar::proxy_pool::ProxyPool;
use deal_radar::repository::{Repository, SqliteRepository};
use deal_radar::scan_lock::ScanLock;
use deal_radar::scheduler::ScanScheduler;
use deal_radar::store::AtomicTtlStore;
use deal_radar::{sink, store};

#[derive(Parser)]
#[command(name = "deal-radar", version, about = "Category scanner for retail price errors")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Run the scheduler until Ctrl-C
    Run,
    /// Run one scan now, ignoring scan intervals, and print the outcome
    Scan(ScopeArgs),
    /// Print lock, job and cooldown diagnostics as JSON
    Status,
    /// Clear the scan lock and fail running jobs
    ForceUnlock,
    /// Ask the running daemon for a scan
    RequestScan(ScopeArgs),
    /// Clear cooldowns on a category and re-enable it
    ResetCategory { id: String },
}

#[derive(Args)]
struct ScopeArgs {
    /// Only scan this category id (repeatable)
    #[arg(long = "category")]
    categories: Vec<String>,
    /// Only scan categories of this store
    #[arg(long)]
    store: Option<String>,
}

impl From<ScopeArgs> for ScanScope {
    fn from(args: ScopeArgs) -> Self {
        ScanScope {
            category_ids: args.categories,
            store: args.store,
        }
    }
}

fn init_tracing(config: &LoggingConfig) -> Result<Option<WorkerGuard>> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("deal_radar=info"));
    let stdout = fmt::layer().with_target(false);

    match &config.directory {
        Some(directory) => {
            let appender = tracing_appender::rolling::daily(directory, &config.file_prefix);
            let (writer, guard) = tracing_appender::non_blocking(appender);
            tracing_subscriber::registry()
                .with(filter)
                .with(stdout)
                .with(fmt::layer().with_ansi(false).with_writer(writer))
                .try_init()
                .context("failed to install tracing subscriber")?;
            Ok(Some(guard))
        }
        None => {
            tracing_subscriber::registry()
                .with(filter)
                .with(stdout)
                .try_init()
                .context("failed to install tracing subscriber")?;
            Ok(None)
        }
    }
}

fn init_metrics(config: &AppConfig) -> Result<()> {
    if !config.metrics.enabled {
        return Ok(());
    }
    metrics_exporter_prometheus::PrometheusBuilder::new()
        .with_http_listener(([0, 0, 0, 0], config.metrics.port))
        .install()
        .context("failed to start Prometheus exporter")?;
    info!("Prometheus metrics on port {}", config.metrics.port);
    Ok(())
}

struct Services {
    kv: Arc<dyn AtomicTtlStore>,
    repo: Arc<dyn Repository>,
    lock: Arc<ScanLock>,
    cooldowns: Arc<ErrorCooldowns>,
}

impl Services {
    async fn connect(config: &AppConfig) -> Result<Self> {
        let kv = store::connect(&config.store).await.context("failed to connect shared store")?;
        let repo = SqliteRepository::connect(&config.database)
            .await
            .context("failed to open database")?;

        Ok(Self {
            repo: Arc::new(repo),
            lock: Arc::new(ScanLock::new(Arc::clone(&kv), config.lock.clone())),
            cooldowns: Arc::new(ErrorCooldowns::new(Arc::clone(&kv), config.cooldowns.clone())),
            kv,
        })
    }

    fn admin(&self) -> Admin {
        Admin::new(Arc::clone(&self.repo), Arc::clone(&self.lock), Arc::clone(&self.cooldowns))
    }

    async fn coordinator(&self, config: &AppConfig, shutdown: CancellationToken) -> Result<ScanCoordinator> {
        let proxies = Arc::new(ProxyPool::new(self.repo.list_proxies().await?, config.proxy.clone()));
        info!("Loaded {} proxies ({} enabled)", proxies.len(), proxies.enabled_count());

        let fetcher = HttpFetcher::new(
            Arc::new(ReqwestTransport),
            Arc::clone(&proxies),
            Arc::clone(&self.cooldowns),
            config.fetch.clone(),
        );
        let parsers = ParserRegistry::from_profiles(&config.parsers.profiles).await?;
        info!("Parsers registered for: {}", parsers.list_stores().await.join(", "));

        let scanner = CategoryScanner::new(
            Arc::new(fetcher),
            parsers,
            Arc::new(DedupeGate::new(Arc::clone(&self.kv), config.dedupe.clone())),
            Arc::from(sink::from_config(&config.notifications)?),
            Arc::clone(&self.cooldowns),
            config,
        );

        Ok(ScanCoordinator::new(
            Arc::clone(&self.repo),
            Arc::clone(&self.lock),
            Arc::clone(&self.cooldowns),
            Arc::new(scanner),
            proxies,
            CoordinatorSettings::from(config),
        )
        .with_shutdown(shutdown))
    }
}

fn print_json<T: serde::Serialize>(value: &T) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();
    let cli = Cli::parse();

    let config = AppConfig::from_env().context("failed to load configuration")?;
    let _log_guard = init_tracing(&config.logging)?;

    let services = Services::connect(&config).await?;

    match cli.command {
        Command::Run => {
            init_metrics(&config)?;
            info!("Starting deal-radar...");

            if services.lock.self_heal().await? {
                warn!("Recovered a stale scan lock at startup");
            }

            let shutdown = CancellationToken::new();
            let coordinator = Arc::new(services.coordinator(&config, shutdown.clone()).await?);
            let mut scheduler =
                ScanScheduler::new(coordinator, Arc::clone(&services.lock), config.scheduler.clone()).await?;
            scheduler.start().await?;

            tokio::signal::ctrl_c().await?;
            info!("Shutting down...");
            scheduler.shutdown().await?;
            let stats = scheduler.get_stats().await;
            info!(
                "Scheduler stopped after {} completed, {} skipped, {} aborted runs",
                stats.completed_runs, stats.skipped_runs, stats.aborted_runs
            );
        }
        Command::Scan(scope) => {
            init_metrics(&config)?;
            let shutdown = CancellationToken::new();
            let coordinator = services.coordinator(&config, shutdown.clone()).await?;

            let interrupt = tokio::spawn(async move {
                if tokio::signal::ctrl_c().await.is_ok() {
                    shutdown.cancel();
                }
            });
            let outcome = coordinator.run_scoped(ScanTrigger::Manual, scope.into()).await;
            interrupt.abort();
            print_json(&outcome)?;
        }
        Command::Status => print_json(&services.admin().diagnostics().await?)?,
        Command::ForceUnlock => print_json(&services.admin().force_unlock().await?)?,
        Command::RequestScan(scope) => print_json(&services.admin().request_manual_scan(scope.into()).await?)?,
        Command::ResetCategory { id } => {
            let cleared = services.admin().reset_category(&id).await?;
            println!("Cleared {} cooldowns on category {}", cleared, id);
        }
    }

    Ok(())
}
