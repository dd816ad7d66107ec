use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use super::config_manager::ConfigManager;
use super::proxy::ProxyManager;
use super::rules::RuleEngine;

/// How often the loop wakes up to check cache ages.
const TICK: Duration = Duration::from_secs(5);

/// Counters for the refresh loop, shared with whoever wants to report them.
#[derive(Default)]
pub struct RefreshState {
    rule_refreshes: AtomicU64,
    config_refreshes: AtomicU64,
    proxy_refreshes: AtomicU64,
    failures: AtomicU64,
}

impl RefreshState {
    pub fn stats(&self) -> RefreshStats {
        RefreshStats {
            rule_refreshes: self.rule_refreshes.load(Ordering::Relaxed),
            config_refreshes: self.config_refreshes.load(Ordering::Relaxed),
            proxy_refreshes: self.proxy_refreshes.load(Ordering::Relaxed),
            failures: self.failures.load(Ordering::Relaxed),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct RefreshStats {
    pub rule_refreshes: u64,
    pub config_refreshes: u64,
    pub proxy_refreshes: u64,
    pub failures: u64,
}

/// Periodic refresh of the in-process caches, stopped through its own token.
///
/// Readers never wait on a refresh: each cache keeps serving its previous
/// snapshot until the reload finishes, and a failed reload leaves it in place.
pub struct BackgroundRefresher {
    cancel: CancellationToken,
    state: Arc<RefreshState>,
    handle: Option<JoinHandle<()>>,
}

impl BackgroundRefresher {
    pub fn start(
        config: Arc<ConfigManager>,
        rules: Arc<RuleEngine>,
        proxies: Arc<ProxyManager>,
    ) -> Self {
        Self::start_with_tick(config, rules, proxies, TICK)
    }

    pub fn start_with_tick(
        config: Arc<ConfigManager>,
        rules: Arc<RuleEngine>,
        proxies: Arc<ProxyManager>,
        tick: Duration,
    ) -> Self {
        let cancel = CancellationToken::new();
        let state = Arc::new(RefreshState::default());
        tracing::info!(tick_ms = tick.as_millis() as u64, "Background refresher starting");

        let handle = tokio::spawn({
            let cancel = cancel.clone();
            let state = state.clone();
            async move {
                refresh_loop(cancel, state, config, rules, proxies, tick).await;
            }
        });

        Self { cancel, state, handle: Some(handle) }
    }

    pub fn stats(&self) -> RefreshStats {
        self.state.stats()
    }

    pub fn is_running(&self) -> bool {
        !self.cancel.is_cancelled()
    }

    /// Cancel the loop and wait for it to exit.
    pub async fn shutdown(&mut self) {
        self.cancel.cancel();
        if let Some(handle) = self.handle.take() {
            if let Err(e) = handle.await {
                tracing::warn!(error = %e, "Background refresher task ended abnormally");
            }
        }
        tracing::info!("Background refresher stopped");
    }
}

impl Drop for BackgroundRefresher {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

async fn refresh_loop(
    cancel: CancellationToken,
    state: Arc<RefreshState>,
    config: Arc<ConfigManager>,
    rules: Arc<RuleEngine>,
    proxies: Arc<ProxyManager>,
    tick: Duration,
) {
    let mut interval = tokio::time::interval(tick);
    interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = interval.tick() => {}
        }

        // Config first: the other caches read their TTLs from it.
        if config.is_stale() {
            let config = config.clone();
            match tokio::task::spawn_blocking(move || config.refresh()).await {
                Ok(Ok(())) => {
                    state.config_refreshes.fetch_add(1, Ordering::Relaxed);
                }
                Ok(Err(e)) => {
                    state.failures.fetch_add(1, Ordering::Relaxed);
                    tracing::warn!(error = %e, "Config refresh failed, keeping cached settings");
                }
                Err(e) => {
                    state.failures.fetch_add(1, Ordering::Relaxed);
                    tracing::warn!(error = %e, "Config refresh task panicked");
                }
            }
        }

        if rules.is_stale() {
            match rules.refresh_now().await {
                Ok(_) => {
                    state.rule_refreshes.fetch_add(1, Ordering::Relaxed);
                }
                Err(e) => {
                    state.failures.fetch_add(1, Ordering::Relaxed);
                    tracing::warn!(error = %e, "Rule refresh failed, keeping cached rules");
                }
            }
        }

        if proxies.is_stale(config.settings().proxy_refresh_interval) {
            let proxies = proxies.clone();
            match tokio::task::spawn_blocking(move || proxies.refresh()).await {
                Ok(Ok(_)) => {
                    state.proxy_refreshes.fetch_add(1, Ordering::Relaxed);
                }
                Ok(Err(e)) => {
                    state.failures.fetch_add(1, Ordering::Relaxed);
                    tracing::warn!(error = %e, "Proxy snapshot refresh failed");
                }
                Err(e) => {
                    state.failures.fetch_add(1, Ordering::Relaxed);
                    tracing::warn!(error = %e, "Proxy refresh task panicked");
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::init_test_db;
    use crate::db::settings_keys as keys;

    #[tokio::test]
    async fn test_refreshes_stale_caches_and_stops() {
        let pool = init_test_db().unwrap();
        let config = Arc::new(ConfigManager::new(pool.clone()));
        config.set(keys::RULES_CACHE_TTL_SECS, serde_json::json!(1)).unwrap();
        config.set(keys::PROXY_REFRESH_INTERVAL_SECS, serde_json::json!(1)).unwrap();
        let rules = Arc::new(RuleEngine::new(pool.clone(), config.clone()));
        let proxies = Arc::new(ProxyManager::new(pool));

        let mut refresher =
            BackgroundRefresher::start_with_tick(config, rules, proxies, Duration::from_millis(50));
        tokio::time::sleep(Duration::from_millis(1_400)).await;
        assert!(refresher.is_running());
        refresher.shutdown().await;
        assert!(!refresher.is_running());

        let stats = refresher.stats();
        assert!(stats.rule_refreshes >= 1);
        assert!(stats.proxy_refreshes >= 1);
        assert_eq!(stats.failures, 0);

        let after = refresher.stats();
        tokio::time::sleep(Duration::from_millis(60)).await;
        assert_eq!(refresher.stats(), after);
    }
}
