use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rand::Rng;
use reqwest::header::RETRY_AFTER;
use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, warn};

use crate::config::FetchConfig;
use crate::cooldown::ErrorCooldowns;
use crate::models::{ErrorClass, ProxyConfig};
use crate::proxy_pool::ProxyPool;
use crate::utils::user_agents::{browser_headers, UserAgentPool};

const BLOCK_PATTERNS: &[(&str, &str)] = &[
    ("access denied", "Access denied"),
    ("forbidden", "Forbidden"),
    ("captcha", "Captcha required"),
    ("verify you are a human", "Human verification required"),
    ("robot check", "Robot check"),
    ("pardon our interruption", "Bot protection"),
    ("automation tools", "Automation blocked"),
    ("request has been blocked", "Request blocked"),
    ("unusual traffic", "Unusual traffic detected"),
    ("enable javascript", "JavaScript required"),
    ("enable cookies", "Cookies required"),
    ("cloudflare", "Cloudflare protection"),
    ("akamai", "Akamai protection"),
    ("incapsula", "Incapsula protection"),
];

/// Bot-wall markers in a page body. Only meaningful for pages that parsed
/// to zero products; real listings often mention these words in passing.
pub fn detect_block_reason(html: &str) -> Option<&'static str> {
    if html.trim().is_empty() {
        return Some("Empty response");
    }
    let haystack = html.split_whitespace().collect::<Vec<_>>().join(" ").to_lowercase();
    BLOCK_PATTERNS
        .iter()
        .find(|(needle, _)| haystack.contains(needle))
        .map(|&(_, reason)| reason)
}

#[derive(Debug, Clone)]
pub struct AttemptOptions<'a> {
    pub proxy: Option<&'a ProxyConfig>,
    pub user_agent: &'a str,
    pub connect_timeout: Duration,
    pub read_timeout: Duration,
}

#[derive(Debug, Clone)]
pub struct TransportResponse {
    pub status: u16,
    pub retry_after: Option<String>,
    pub body: String,
    pub final_url: String,
}

#[derive(Debug, Clone, Error)]
pub enum TransportError {
    #[error("read timed out: {0}")]
    Timeout(String),
    #[error("connection failed: {0}")]
    Connect(String),
    #[error("{0}")]
    Other(String),
}

/// One HTTP attempt. Implementations must not reuse connections across
/// attempts that go through different proxies.
#[async_trait]
pub trait Transport: Send + Sync {
    async fn get(&self, url: &str, options: &AttemptOptions<'_>) -> Result<TransportResponse, TransportError>;
}

/// Builds a fresh `reqwest::Client` per attempt.
#[derive(Debug, Default, Clone)]
pub struct ReqwestTransport;

fn classify(err: reqwest::Error) -> TransportError {
    if err.is_timeout() {
        TransportError::Timeout(err.to_string())
    } else if err.is_connect() {
        TransportError::Connect(err.to_string())
    } else {
        TransportError::Other(err.to_string())
    }
}

#[async_trait]
impl Transport for ReqwestTransport {
    async fn get(&self, url: &str, options: &AttemptOptions<'_>) -> Result<TransportResponse, TransportError> {
        let mut builder = reqwest::Client::builder()
            .default_headers(browser_headers())
            .user_agent(options.user_agent)
            .connect_timeout(options.connect_timeout)
            .timeout(options.read_timeout)
            .pool_max_idle_per_host(0);

        if let Some(proxy) = options.proxy {
            let proxy = reqwest::Proxy::all(proxy.url()).map_err(|e| TransportError::Other(e.to_string()))?;
            builder = builder.proxy(proxy);
        }

        let client = builder.build().map_err(classify)?;
        let response = client.get(url).send().await.map_err(classify)?;

        let status = response.status().as_u16();
        let retry_after = response
            .headers()
            .get(RETRY_AFTER)
            .and_then(|v| v.to_str().ok())
            .map(str::to_string);
        let final_url = response.url().to_string();
        let body = response.text().await.map_err(classify)?;

        Ok(TransportResponse {
            status,
            retry_after,
            body,
            final_url,
        })
    }
}

#[derive(Debug, Clone, Error, PartialEq)]
pub enum FetchError {
    #[error("HTTP 403 after {attempts} attempts")]
    Forbidden { attempts: u32 },
    #[error("HTTP 429 after {attempts} attempts")]
    RateLimited { attempts: u32 },
    #[error("HTTP {status} after {attempts} attempts")]
    ServerError { status: u16, attempts: u32 },
    #[error("read timeout after {attempts} attempts")]
    Timeout { attempts: u32 },
    #[error("connection failed after {failovers} failovers: {message}")]
    Connect { failovers: u32, message: String },
    #[error("page not found: {url}")]
    NotFound { url: String },
    #[error("unexpected HTTP {status}")]
    Status { status: u16 },
    #[error("no enabled proxy available")]
    NoProxy,
    #[error("request failed: {0}")]
    Other(String),
}

impl FetchError {
    pub fn class(&self) -> ErrorClass {
        match self {
            FetchError::Forbidden { .. } => ErrorClass::Forbidden,
            FetchError::RateLimited { .. } => ErrorClass::RateLimited,
            FetchError::ServerError { .. } => ErrorClass::ServerError,
            FetchError::Timeout { .. } => ErrorClass::Timeout,
            FetchError::Connect { .. } => ErrorClass::Connect,
            FetchError::NotFound { .. } => ErrorClass::NotFound,
            FetchError::Status { .. } | FetchError::NoProxy | FetchError::Other(_) => ErrorClass::Other,
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub struct FetchContext<'a> {
    pub category_id: &'a str,
    pub store: &'a str,
}

#[derive(Debug, Clone)]
pub struct FetchedPage {
    pub html: String,
    pub status: u16,
    pub final_url: String,
    pub attempts: u32,
    pub proxy_id: Option<String>,
}

/// One logical page fetch with retries. The seam the category scanner and
/// tests plug into.
#[async_trait]
pub trait PageFetcher: Send + Sync {
    async fn fetch(&self, url: &str, ctx: FetchContext<'_>) -> Result<FetchedPage, FetchError>;
}

pub struct HttpFetcher {
    transport: Arc<dyn Transport>,
    proxies: Arc<ProxyPool>,
    user_agents: UserAgentPool,
    cooldowns: Arc<ErrorCooldowns>,
    config: FetchConfig,
}

impl HttpFetcher {
    pub fn new(
        transport: Arc<dyn Transport>,
        proxies: Arc<ProxyPool>,
        cooldowns: Arc<ErrorCooldowns>,
        config: FetchConfig,
    ) -> Self {
        Self {
            transport,
            proxies,
            user_agents: UserAgentPool::new(config.user_agents.clone()),
            cooldowns,
            config,
        }
    }

    /// Picks the next untried proxy. Once every enabled proxy has been tried
    /// the exclusion set starts over; with no enabled proxy at all the fetch
    /// goes direct when allowed.
    fn select_proxy(&self, tried: &mut HashSet<String>) -> Result<Option<ProxyConfig>, FetchError> {
        if self.proxies.is_empty() {
            return Ok(None);
        }

        let mut proxy = self.proxies.next(tried);
        if proxy.is_none() && !tried.is_empty() {
            debug!("All {} proxies tried, starting a new rotation", tried.len());
            tried.clear();
            proxy = self.proxies.next(tried);
        }

        match proxy {
            Some(proxy) => {
                tried.insert(proxy.id.clone());
                Ok(Some(proxy))
            }
            None if self.config.direct_fallback => {
                warn!("No enabled proxies, fetching directly");
                Ok(None)
            }
            None => Err(FetchError::NoProxy),
        }
    }

    fn jitter(&self) -> f64 {
        if self.config.jitter_max <= self.config.jitter_min {
            return self.config.jitter_min.max(0.0);
        }
        rand::thread_rng().gen_range(self.config.jitter_min..self.config.jitter_max)
    }

    fn backoff(&self, attempt: u32, base: f64) -> Duration {
        let secs = 2f64.powi(attempt as i32) * base + self.jitter();
        Duration::from_secs_f64(secs.max(0.0))
    }

    fn retry_after(&self, header: Option<&str>, attempt: u32) -> Duration {
        let cap = Duration::from_secs(self.config.max_retry_after);
        let hinted = header.and_then(|value| {
            let value = value.trim();
            if let Ok(secs) = value.parse::<u64>() {
                return Some(Duration::from_secs(secs));
            }
            DateTime::parse_from_rfc2822(value)
                .ok()
                .map(|at| (at.with_timezone(&Utc) - Utc::now()).to_std().unwrap_or(Duration::ZERO))
        });
        hinted
            .unwrap_or_else(|| self.backoff(attempt, self.config.rate_limit_backoff_base))
            .min(cap)
    }

    async fn exhausted(&self, ctx: FetchContext<'_>, error: FetchError) -> FetchError {
        metrics::counter!("fetch_exhausted_total", "class" => error.class().as_str()).increment(1);
        if let Err(e) = self.cooldowns.trip(ctx.category_id, error.class()).await {
            warn!("Failed to record cooldown for category {}: {}", ctx.category_id, e);
        }
        error
    }
}

#[async_trait]
impl PageFetcher for HttpFetcher {
    async fn fetch(&self, url: &str, ctx: FetchContext<'_>) -> Result<FetchedPage, FetchError> {
        let max_retries = self.config.max_retries.max(1);
        let connect_timeout = Duration::from_secs(self.config.connect_timeout);
        let max_read_timeout = Duration::from_secs(self.config.max_read_timeout);
        let mut read_timeout = Duration::from_secs(self.config.read_timeout);

        let mut tried = HashSet::new();
        let mut sticky: Option<ProxyConfig> = None;
        let mut attempt: u32 = 0;
        let mut failovers: u32 = 0;

        loop {
            let proxy = match sticky.take() {
                Some(proxy) => Some(proxy),
                None => self.select_proxy(&mut tried)?,
            };
            let proxy_id = proxy.as_ref().map(|p| p.id.clone());
            let endpoint = proxy.as_ref().map(|p| p.to_string()).unwrap_or_else(|| "direct".to_string());
            let user_agent = self.user_agents.current().to_string();

            let options = AttemptOptions {
                proxy: proxy.as_ref(),
                user_agent: &user_agent,
                connect_timeout,
                read_timeout,
            };
            metrics::counter!("fetch_attempts_total").increment(1);

            let (error, delay) = match self.transport.get(url, &options).await {
                Ok(response) if (200..300).contains(&response.status) => {
                    if let Some(id) = &proxy_id {
                        self.proxies.report_success(id);
                    }
                    return Ok(FetchedPage {
                        html: response.body,
                        status: response.status,
                        final_url: response.final_url,
                        attempts: attempt + 1,
                        proxy_id,
                    });
                }
                Ok(response) => match response.status {
                    403 => {
                        if let Some(id) = &proxy_id {
                            self.proxies.report_failure(id);
                        }
                        self.user_agents.rotate();
                        let delay = self.backoff(attempt, self.config.forbidden_backoff_base);
                        (FetchError::Forbidden { attempts: attempt + 1 }, delay)
                    }
                    429 => {
                        sticky = proxy.clone();
                        let delay = self.retry_after(response.retry_after.as_deref(), attempt);
                        (FetchError::RateLimited { attempts: attempt + 1 }, delay)
                    }
                    404 => {
                        warn!("[{}] 404 for {}, category URL may be stale", ctx.store, url);
                        return Err(FetchError::NotFound { url: url.to_string() });
                    }
                    status @ 500..=599 => {
                        let delay = self.backoff(attempt, self.config.server_error_backoff_base);
                        (
                            FetchError::ServerError {
                                status,
                                attempts: attempt + 1,
                            },
                            delay,
                        )
                    }
                    status => return Err(FetchError::Status { status }),
                },
                Err(TransportError::Timeout(message)) => {
                    if let Some(id) = &proxy_id {
                        self.proxies.report_failure(id);
                    }
                    debug!("[{}] timeout via {}: {}", ctx.store, endpoint, message);
                    read_timeout = (read_timeout * 2).min(max_read_timeout);
                    (FetchError::Timeout { attempts: attempt + 1 }, Duration::ZERO)
                }
                Err(TransportError::Connect(message)) => {
                    if let Some(id) = &proxy_id {
                        self.proxies.report_failure(id);
                    }
                    failovers += 1;
                    metrics::counter!("fetch_retries_total", "class" => ErrorClass::Connect.as_str()).increment(1);
                    if failovers > self.config.max_connect_failovers {
                        let error = FetchError::Connect { failovers, message };
                        return Err(self.exhausted(ctx, error).await);
                    }
                    warn!(
                        "[{}] connect error via {}, failing over ({}/{})",
                        ctx.store, endpoint, failovers, self.config.max_connect_failovers
                    );
                    continue;
                }
                Err(TransportError::Other(message)) => return Err(FetchError::Other(message)),
            };

            attempt += 1;
            let class = error.class();
            if attempt >= max_retries {
                warn!("[{}] giving up on {} after {} attempts: {}", ctx.store, url, attempt, error);
                return Err(self.exhausted(ctx, error).await);
            }

            metrics::counter!("fetch_retries_total", "class" => class.as_str()).increment(1);
            warn!(
                "[{}] {} via {}, retry {}/{} in {:.1}s",
                ctx.store,
                class,
                endpoint,
                attempt,
                max_retries - 1,
                delay.as_secs_f64()
            );
            tokio::time::sleep(delay).await;
        }
    }
}
