use chrono::{DateTime, TimeZone, Utc};
use dashmap::DashMap;
use std::collections::{HashSet, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicI64, AtomicUsize, Ordering};

use crate::config::ProxyPoolConfig;
use crate::models::ProxyConfig;

const UNSET: i64 = i64::MIN;

fn to_millis(at: Option<DateTime<Utc>>) -> i64 {
    at.map(|at| at.timestamp_millis()).unwrap_or(UNSET)
}

fn from_millis(millis: i64) -> Option<DateTime<Utc>> {
    if millis == UNSET {
        return None;
    }
    Utc.timestamp_millis_opt(millis).single()
}

/// Health state for one proxy. Mutated only through atomics so concurrent
/// category scans never block each other on the pool.
struct ProxyEntry {
    config: ProxyConfig,
    enabled: AtomicBool,
    failure_count: AtomicI64,
    last_used: AtomicI64,
    last_success: AtomicI64,
    disabled_at: AtomicI64,
}

impl ProxyEntry {
    fn new(config: ProxyConfig) -> Self {
        Self {
            enabled: AtomicBool::new(config.enabled),
            failure_count: AtomicI64::new(config.failure_count),
            last_used: AtomicI64::new(to_millis(config.last_used)),
            last_success: AtomicI64::new(to_millis(config.last_success)),
            disabled_at: AtomicI64::new(to_millis(config.disabled_at)),
            config,
        }
    }

    fn snapshot(&self) -> ProxyConfig {
        ProxyConfig {
            enabled: self.enabled.load(Ordering::Acquire),
            failure_count: self.failure_count.load(Ordering::Relaxed),
            last_used: from_millis(self.last_used.load(Ordering::Relaxed)),
            last_success: from_millis(self.last_success.load(Ordering::Relaxed)),
            disabled_at: from_millis(self.disabled_at.load(Ordering::Relaxed)),
            ..self.config.clone()
        }
    }
}

pub struct ProxyPool {
    entries: Vec<ProxyEntry>,
    cursor: AtomicUsize,
    failures: DashMap<String, VecDeque<DateTime<Utc>>>,
    config: ProxyPoolConfig,
}

impl ProxyPool {
    pub fn new(proxies: Vec<ProxyConfig>, config: ProxyPoolConfig) -> Self {
        Self {
            entries: proxies.into_iter().map(ProxyEntry::new).collect(),
            cursor: AtomicUsize::new(0),
            failures: DashMap::new(),
            config,
        }
    }

    pub fn empty() -> Self {
        Self::new(Vec::new(), ProxyPoolConfig::default())
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn enabled_count(&self) -> usize {
        self.entries
            .iter()
            .filter(|e| e.enabled.load(Ordering::Acquire))
            .count()
    }

    fn entry(&self, id: &str) -> Option<&ProxyEntry> {
        self.entries.iter().find(|e| e.config.id == id)
    }

    /// Next enabled proxy not in `exclude`, round-robin. `None` once the
    /// exclusion set covers the whole enabled pool.
    pub fn next(&self, exclude: &HashSet<String>) -> Option<ProxyConfig> {
        self.next_at(exclude, Utc::now())
    }

    pub(crate) fn next_at(&self, exclude: &HashSet<String>, now: DateTime<Utc>) -> Option<ProxyConfig> {
        if self.entries.is_empty() {
            return None;
        }
        self.reenable_expired(now);

        for _ in 0..self.entries.len() {
            let index = self.cursor.fetch_add(1, Ordering::Relaxed) % self.entries.len();
            let entry = &self.entries[index];
            if !entry.enabled.load(Ordering::Acquire) || exclude.contains(&entry.config.id) {
                continue;
            }
            entry.last_used.store(now.timestamp_millis(), Ordering::Relaxed);
            return Some(entry.snapshot());
        }
        None
    }

    fn reenable_expired(&self, now: DateTime<Utc>) {
        let cooldown = chrono::Duration::seconds(self.config.reenable_after as i64);
        for entry in &self.entries {
            let Some(disabled_at) = from_millis(entry.disabled_at.load(Ordering::Relaxed)) else {
                continue;
            };
            if now - disabled_at >= cooldown
                && entry
                    .enabled
                    .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
                    .is_ok()
            {
                self.reset_health(entry);
                tracing::info!("Proxy {} re-enabled after cooldown", entry.config);
            }
        }
    }

    fn reset_health(&self, entry: &ProxyEntry) {
        entry.disabled_at.store(UNSET, Ordering::Relaxed);
        entry.failure_count.store(0, Ordering::Relaxed);
        self.failures.remove(&entry.config.id);
    }

    pub fn report_success(&self, id: &str) {
        if let Some(entry) = self.entry(id) {
            entry.last_success.store(Utc::now().timestamp_millis(), Ordering::Relaxed);
        }
    }

    pub fn report_failure(&self, id: &str) {
        self.report_failure_at(id, Utc::now());
    }

    /// Records a failure and auto-disables the proxy once the trailing
    /// window holds `failure_threshold` failures.
    pub(crate) fn report_failure_at(&self, id: &str, now: DateTime<Utc>) {
        let Some(entry) = self.entry(id) else {
            return;
        };

        let window = chrono::Duration::seconds(self.config.failure_window as i64);
        let recent = {
            let mut failures = self.failures.entry(id.to_string()).or_default();
            failures.push_back(now);
            while failures.front().is_some_and(|at| now - *at > window) {
                failures.pop_front();
            }
            failures.len() as i64
        };
        entry.failure_count.store(recent, Ordering::Relaxed);
        metrics::counter!("proxy_failures_total").increment(1);

        if recent >= self.config.failure_threshold as i64
            && entry
                .enabled
                .compare_exchange(true, false, Ordering::AcqRel, Ordering::Acquire)
                .is_ok()
        {
            entry.disabled_at.store(now.timestamp_millis(), Ordering::Relaxed);
            tracing::warn!(
                "Proxy {} disabled after {} failures in {}s",
                entry.config,
                recent,
                self.config.failure_window
            );
            metrics::counter!("proxy_auto_disabled_total").increment(1);
        }
    }

    /// Manual re-enable; also clears failure history.
    pub fn enable(&self, id: &str) -> bool {
        let Some(entry) = self.entry(id) else {
            return false;
        };
        entry.enabled.store(true, Ordering::Release);
        self.reset_health(entry);
        tracing::info!("Proxy {} enabled manually", entry.config);
        true
    }

    /// Health snapshot for persistence.
    pub fn snapshot(&self) -> Vec<ProxyConfig> {
        self.entries.iter().map(ProxyEntry::snapshot).collect()
    }
}
