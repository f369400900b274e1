use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::config::LockConfig;
use crate::models::ScanScope;
use crate::store::AtomicTtlStore;
use crate::utils::error::Result;

pub const LOCK_KEY: &str = "scan:category:lock";
pub const PENDING_KEY: &str = "scan:category:pending";

/// The single cluster-wide lock record.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct LockRecord {
    pub owner: String,
    pub run_id: String,
    pub acquired_at: DateTime<Utc>,
    pub heartbeat_at: DateTime<Utc>,
    pub ttl_secs: u64,
}

impl LockRecord {
    fn new(run_id: &str, now: DateTime<Utc>, ttl: Duration) -> Self {
        Self {
            owner: Uuid::new_v4().simple().to_string(),
            run_id: run_id.to_string(),
            acquired_at: now,
            heartbeat_at: now,
            ttl_secs: ttl.as_secs(),
        }
    }

    pub fn heartbeat_age(&self, now: DateTime<Utc>) -> chrono::Duration {
        now - self.heartbeat_at
    }
}

struct HeldState {
    raw: String,
    record: LockRecord,
}

/// Proof of ownership handed to the run that acquired the lock.
pub struct LockGuard {
    state: Mutex<HeldState>,
    owner: String,
    run_id: String,
}

impl LockGuard {
    fn new(raw: String, record: LockRecord) -> Self {
        Self {
            owner: record.owner.clone(),
            run_id: record.run_id.clone(),
            state: Mutex::new(HeldState { raw, record }),
        }
    }

    pub fn owner(&self) -> &str {
        &self.owner
    }

    pub fn run_id(&self) -> &str {
        &self.run_id
    }

    pub async fn record(&self) -> LockRecord {
        self.state.lock().await.record.clone()
    }
}

/// Body of the pending manual-request key.
#[derive(Debug, Serialize, Deserialize)]
struct PendingRequest {
    requested_at: DateTime<Utc>,
    #[serde(default)]
    scope: ScanScope,
}

#[derive(Debug, Clone, Copy, Serialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ManualScanRequest {
    Queued,
    AlreadyPending,
    ScanRunning,
}

#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct LockStatus {
    pub held: bool,
    pub record: Option<LockRecord>,
    pub ttl_remaining_secs: Option<u64>,
    pub heartbeat_age_secs: Option<i64>,
    pub stale: bool,
    pub pending_manual_request: bool,
}

pub struct ScanLock {
    store: Arc<dyn AtomicTtlStore>,
    config: LockConfig,
}

impl ScanLock {
    pub fn new(store: Arc<dyn AtomicTtlStore>, config: LockConfig) -> Self {
        Self { store, config }
    }

    pub fn config(&self) -> &LockConfig {
        &self.config
    }

    fn is_stale(&self, record: &LockRecord, now: DateTime<Utc>) -> bool {
        match record.heartbeat_age(now).to_std() {
            Ok(age) => age > self.config.staleness_threshold(),
            // Heartbeat in the future: another host's clock is ahead.
            Err(_) => false,
        }
    }

    /// Unparseable records count as stale so they can always be recovered.
    fn parse_record(raw: &str) -> Option<LockRecord> {
        serde_json::from_str(raw).ok()
    }

    /// Returns `None` when another live owner holds the lock.
    pub async fn acquire(&self, run_id: &str) -> Result<Option<Arc<LockGuard>>> {
        let now = Utc::now();
        let ttl = self.config.ttl();
        let record = LockRecord::new(run_id, now, ttl);
        let raw = serde_json::to_string(&record)?;

        if self.store.set_if_absent(LOCK_KEY, &raw, ttl).await? {
            tracing::info!("Acquired scan lock for run {}", run_id);
            return Ok(Some(Arc::new(LockGuard::new(raw, record))));
        }

        let Some(existing) = self.store.get(LOCK_KEY).await? else {
            // Expired between the two calls.
            if self.store.set_if_absent(LOCK_KEY, &raw, ttl).await? {
                return Ok(Some(Arc::new(LockGuard::new(raw, record))));
            }
            return Ok(None);
        };

        let holder = Self::parse_record(&existing.value);
        if let Some(holder) = &holder {
            if !self.is_stale(holder, now) {
                tracing::debug!("Scan lock held by run {}", holder.run_id);
                return Ok(None);
            }
        }

        if self.store.compare_and_swap(LOCK_KEY, &existing.value, &raw, ttl).await? {
            let previous = holder.map(|h| h.run_id).unwrap_or_else(|| "<unreadable>".to_string());
            tracing::warn!("Took over stale scan lock from run {} for run {}", previous, run_id);
            metrics::counter!("scan_lock_takeovers_total").increment(1);
            return Ok(Some(Arc::new(LockGuard::new(raw, record))));
        }

        Ok(None)
    }

    /// Refreshes the heartbeat and TTL. `false` means ownership was lost.
    pub async fn renew(&self, guard: &LockGuard) -> Result<bool> {
        let mut state = guard.state.lock().await;
        let mut record = state.record.clone();
        record.heartbeat_at = Utc::now();
        let raw = serde_json::to_string(&record)?;

        if self
            .store
            .compare_and_swap(LOCK_KEY, &state.raw, &raw, self.config.ttl())
            .await?
        {
            state.raw = raw;
            state.record = record;
            return Ok(true);
        }
        Ok(false)
    }

    /// Owner-checked release; never deletes someone else's lock.
    pub async fn release(&self, guard: &LockGuard) -> Result<bool> {
        let state = guard.state.lock().await;
        let released = self.store.compare_and_delete(LOCK_KEY, &state.raw).await?;
        if released {
            tracing::info!("Released scan lock for run {}", guard.run_id);
        } else {
            tracing::warn!("Scan lock for run {} was no longer ours at release", guard.run_id);
        }
        Ok(released)
    }

    /// Clears the lock regardless of owner or staleness.
    pub async fn force_unlock(&self) -> Result<Option<LockRecord>> {
        let existing = self.store.get(LOCK_KEY).await?;
        let cleared = self.store.delete(LOCK_KEY).await?;
        if cleared {
            tracing::warn!("Scan lock force-cleared");
        }
        Ok(existing.and_then(|stored| Self::parse_record(&stored.value)))
    }

    /// Clears a stale lock left behind by a dead owner.
    pub async fn self_heal(&self) -> Result<bool> {
        let Some(existing) = self.store.get(LOCK_KEY).await? else {
            return Ok(false);
        };

        let record = Self::parse_record(&existing.value);
        if let Some(record) = &record {
            if !self.is_stale(record, Utc::now()) {
                return Ok(false);
            }
        }

        if !self.store.compare_and_delete(LOCK_KEY, &existing.value).await? {
            return Ok(false);
        }

        match record {
            Some(record) => tracing::warn!(
                "Cleared stale scan lock from run {} (last heartbeat {})",
                record.run_id,
                record.heartbeat_at
            ),
            None => tracing::warn!("Cleared unreadable scan lock record"),
        }
        metrics::counter!("scan_lock_stale_recoveries_total").increment(1);
        Ok(true)
    }

    pub async fn status(&self) -> Result<LockStatus> {
        let now = Utc::now();
        let pending_manual_request = self.store.get(PENDING_KEY).await?.is_some();

        let Some(existing) = self.store.get(LOCK_KEY).await? else {
            return Ok(LockStatus {
                held: false,
                record: None,
                ttl_remaining_secs: None,
                heartbeat_age_secs: None,
                stale: false,
                pending_manual_request,
            });
        };

        let record = Self::parse_record(&existing.value);
        let stale = record.as_ref().is_none_or(|r| self.is_stale(r, now));
        Ok(LockStatus {
            held: true,
            heartbeat_age_secs: record.as_ref().map(|r| r.heartbeat_age(now).num_seconds()),
            record,
            ttl_remaining_secs: existing.ttl_remaining.map(|ttl| ttl.as_secs()),
            stale,
            pending_manual_request,
        })
    }

    /// At most one pending request; a no-op while one is queued or a live
    /// scan holds the lock.
    pub async fn request_manual_scan(&self, scope: ScanScope) -> Result<ManualScanRequest> {
        let status = self.status().await?;
        if status.held && !status.stale {
            return Ok(ManualScanRequest::ScanRunning);
        }

        let request = serde_json::to_string(&PendingRequest {
            requested_at: Utc::now(),
            scope,
        })?;
        if self
            .store
            .set_if_absent(PENDING_KEY, &request, self.config.ttl())
            .await?
        {
            tracing::info!("Manual scan request queued");
            Ok(ManualScanRequest::Queued)
        } else {
            Ok(ManualScanRequest::AlreadyPending)
        }
    }

    /// Consumes the pending manual request, if any, returning its scope.
    /// An unreadable request scans everything.
    pub async fn take_pending_request(&self) -> Result<Option<ScanScope>> {
        let Some(pending) = self.store.get(PENDING_KEY).await? else {
            return Ok(None);
        };
        if !self.store.compare_and_delete(PENDING_KEY, &pending.value).await? {
            return Ok(None);
        }
        let scope = serde_json::from_str::<PendingRequest>(&pending.value)
            .map(|request| request.scope)
            .unwrap_or_default();
        Ok(Some(scope))
    }

    /// Renews the heartbeat until `stop` fires. Cancels `on_lost` if another
    /// owner took the lock or after repeated renewal failures.
    pub fn spawn_heartbeat(
        self: &Arc<Self>,
        guard: Arc<LockGuard>,
        stop: CancellationToken,
        on_lost: CancellationToken,
    ) -> JoinHandle<()> {
        let lock = Arc::clone(self);
        let interval = self.config.heartbeat_interval();
        let max_failures = self.config.max_heartbeat_failures.max(1);

        tokio::spawn(async move {
            let mut failures = 0u32;
            loop {
                tokio::select! {
                    _ = stop.cancelled() => break,
                    _ = tokio::time::sleep(interval) => {}
                }

                match lock.renew(&guard).await {
                    Ok(true) => {
                        failures = 0;
                        tracing::debug!("Heartbeat renewed for run {}", guard.run_id());
                    }
                    Ok(false) => {
                        tracing::error!("Scan lock lost by run {}; cancelling run", guard.run_id());
                        metrics::counter!("scan_lock_ownership_lost_total").increment(1);
                        on_lost.cancel();
                        break;
                    }
                    Err(e) => {
                        failures += 1;
                        metrics::counter!("scan_lock_heartbeat_failures_total").increment(1);
                        tracing::warn!(
                            "Heartbeat renewal failed for run {} ({}/{}): {}",
                            guard.run_id(),
                            failures,
                            max_failures,
                            e
                        );
                        if failures >= max_failures {
                            tracing::error!(
                                "Stopping heartbeat for run {} after {} failures; cancelling run",
                                guard.run_id(),
                                failures
                            );
                            on_lost.cancel();
                            break;
                        }
                    }
                }
            }
        })
    }
}
