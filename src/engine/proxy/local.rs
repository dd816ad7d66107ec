use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::RwLock;
use std::time::{Duration, Instant};

use crate::db::models::{CreateProxyInput, Proxy};
use crate::db::repos::resources::proxies as proxy_repo;
use crate::db::DbPool;
use crate::error::AppError;

struct Snapshot {
    proxies: Vec<Proxy>,
    loaded_at: Instant,
}

/// Durable proxy inventory with an in-memory snapshot of usable proxies.
///
/// Selection never touches the database; the snapshot is reloaded by
/// [`ProxyManager::refresh`], normally from the background refresher.
pub struct ProxyManager {
    pool: DbPool,
    snapshot: RwLock<Snapshot>,
    cursor: AtomicUsize,
}

impl ProxyManager {
    /// Load the initial snapshot. An unreadable table starts with no proxies.
    pub fn new(pool: DbPool) -> Self {
        let proxies = proxy_repo::get_usable(&pool).unwrap_or_else(|e| {
            tracing::warn!(error = %e, "Failed to load proxies, starting with an empty pool");
            Vec::new()
        });
        tracing::debug!(count = proxies.len(), "Proxy snapshot loaded");
        Self {
            pool,
            snapshot: RwLock::new(Snapshot { proxies, loaded_at: Instant::now() }),
            cursor: AtomicUsize::new(0),
        }
    }

    /// Reload usable proxies. The old snapshot stays in place on failure.
    pub fn refresh(&self) -> Result<usize, AppError> {
        let proxies = proxy_repo::get_usable(&self.pool)?;
        let count = proxies.len();
        let mut snap = self.snapshot.write().unwrap_or_else(|e| e.into_inner());
        *snap = Snapshot { proxies, loaded_at: Instant::now() };
        Ok(count)
    }

    pub fn is_stale(&self, max_age: Duration) -> bool {
        let snap = self.snapshot.read().unwrap_or_else(|e| e.into_inner());
        snap.loaded_at.elapsed() >= max_age
    }

    pub fn snapshot(&self) -> Vec<Proxy> {
        let snap = self.snapshot.read().unwrap_or_else(|e| e.into_inner());
        snap.proxies.clone()
    }

    pub fn get(&self, proxy_id: &str) -> Option<Proxy> {
        let snap = self.snapshot.read().unwrap_or_else(|e| e.into_inner());
        snap.proxies.iter().find(|p| p.proxy_id == proxy_id).cloned()
    }

    /// Process-local round-robin over the snapshot.
    pub fn next(&self) -> Option<Proxy> {
        let snap = self.snapshot.read().unwrap_or_else(|e| e.into_inner());
        if snap.proxies.is_empty() {
            return None;
        }
        let idx = self.cursor.fetch_add(1, Ordering::Relaxed) % snap.proxies.len();
        Some(snap.proxies[idx].clone())
    }

    /// Register a proxy and make it selectable immediately.
    pub fn add(&self, input: CreateProxyInput) -> Result<Proxy, AppError> {
        let proxy = proxy_repo::create(&self.pool, input)?;
        self.refresh()?;
        tracing::info!(proxy_id = %proxy.proxy_id, server = %proxy.server, "Proxy added");
        Ok(proxy)
    }

    pub fn set_healthy(&self, proxy_id: &str, healthy: bool) -> Result<(), AppError> {
        proxy_repo::set_healthy(&self.pool, proxy_id, healthy)?;
        self.refresh()?;
        Ok(())
    }

    pub fn list(&self) -> Result<Vec<Proxy>, AppError> {
        proxy_repo::get_all(&self.pool)
    }

    pub fn record_success(&self, proxy_id: &str, domain: &str, worker_id: Option<&str>) {
        self.record(proxy_id, domain, worker_id, true, None);
    }

    pub fn record_failure(
        &self,
        proxy_id: &str,
        domain: &str,
        worker_id: Option<&str>,
        pattern: Option<&str>,
    ) {
        self.record(proxy_id, domain, worker_id, false, pattern);
    }

    // Bookkeeping only: failures are logged and swallowed.
    fn record(
        &self,
        proxy_id: &str,
        domain: &str,
        worker_id: Option<&str>,
        success: bool,
        pattern: Option<&str>,
    ) {
        if let Err(e) = proxy_repo::record_result(&self.pool, proxy_id, success) {
            tracing::warn!(proxy_id, error = %e, "Failed to update proxy counters");
        }
        if let Err(e) = proxy_repo::log_usage(&self.pool, proxy_id, domain, worker_id, success, pattern) {
            tracing::warn!(proxy_id, domain, error = %e, "Failed to write proxy usage log");
        }
    }
}
