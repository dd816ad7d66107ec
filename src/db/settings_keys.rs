//! Canonical key constants for the `system_config` table.
//!
//! Use these instead of raw string literals to prevent typo-based key mismatches.

// ── Recovery trigger ────────────────────────────────────────────────
pub const CONSECUTIVE_THRESHOLD: &str = "recovery.consecutive_threshold";
pub const ERROR_RATE_THRESHOLD: &str = "recovery.error_rate_threshold";
pub const MIN_SAMPLES: &str = "recovery.min_samples";
pub const COUNTER_TTL_SECS: &str = "recovery.counter_ttl_secs";
pub const MAX_ATTEMPTS: &str = "recovery.max_attempts";
pub const AGENT_ENABLED: &str = "recovery.agent_enabled";
pub const AI_TIMEOUT_SECS: &str = "recovery.ai_timeout_secs";

// ── Domain health ───────────────────────────────────────────────────
pub const BLOCK_THRESHOLD: &str = "domain.block_threshold";

// ── Coordinator ─────────────────────────────────────────────────────
pub const LOCK_TTL_SECS: &str = "coordinator.lock_ttl_secs";
pub const RESULT_TTL_SECS: &str = "coordinator.result_ttl_secs";
pub const WAIT_TIMEOUT_MS: &str = "coordinator.wait_timeout_ms";
pub const POLL_INTERVAL_MS: &str = "coordinator.poll_interval_ms";

// ── Proxies ─────────────────────────────────────────────────────────
pub const LEASE_TTL_SECS: &str = "proxy.lease_ttl_secs";
pub const COOLDOWN_BASE_SECS: &str = "proxy.cooldown_base_secs";
pub const MAX_HOURLY_FAILURES: &str = "proxy.max_hourly_failures";
pub const DISABLE_MINUTES: &str = "proxy.disable_minutes";
pub const DOMAIN_AFFINITY_WEIGHT: &str = "proxy.domain_affinity_weight";
pub const AFFINITY_TOP_N: &str = "proxy.affinity_top_n";
pub const PROXY_STRATEGY: &str = "proxy.strategy";
pub const PROXY_REFRESH_INTERVAL_SECS: &str = "proxy.refresh_interval_secs";

// ── Caches ──────────────────────────────────────────────────────────
pub const RULES_CACHE_TTL_SECS: &str = "rules.cache_ttl_secs";
pub const CONFIG_CACHE_TTL_SECS: &str = "config.cache_ttl_secs";

// ── Learning ────────────────────────────────────────────────────────
pub const PROMOTION_THRESHOLD: &str = "learning.promotion_threshold";

/// Written by migrations; operators cannot change it.
pub const SCHEMA_VERSION: &str = "system.schema_version";

/// Seed row for `system_config`. `default` is JSON text.
pub struct SettingDef {
    pub key: &'static str,
    pub default: &'static str,
    pub description: &'static str,
    pub category: &'static str,
    pub editable: bool,
}

const fn def(
    key: &'static str,
    default: &'static str,
    description: &'static str,
    category: &'static str,
) -> SettingDef {
    SettingDef { key, default, description, category, editable: true }
}

pub const DEFAULTS: &[SettingDef] = &[
    def(CONSECUTIVE_THRESHOLD, "3", "Consecutive failures on a domain that trigger recovery", "recovery"),
    def(ERROR_RATE_THRESHOLD, "0.1", "Failure ratio that triggers recovery once enough samples exist", "recovery"),
    def(MIN_SAMPLES, "10", "Requests needed before the error-rate rule applies", "recovery"),
    def(COUNTER_TTL_SECS, "3600", "Lifetime of per-domain error counters", "recovery"),
    def(MAX_ATTEMPTS, "3", "Failed recovery attempts per task before an incident is opened", "recovery"),
    def(AGENT_ENABLED, "true", "Consult the AI agent when no rule matches", "recovery"),
    def(AI_TIMEOUT_SECS, "30", "Hard deadline for one AI decision", "recovery"),
    def(BLOCK_THRESHOLD, "5", "Consecutive failures before a domain is auto-blocked", "domain"),
    def(LOCK_TTL_SECS, "30", "Coordination lock lifetime", "coordinator"),
    def(RESULT_TTL_SECS, "300", "How long a published decision is reused by followers", "coordinator"),
    def(WAIT_TIMEOUT_MS, "10000", "Follower wait bound for a published decision", "coordinator"),
    def(POLL_INTERVAL_MS, "500", "Follower polling interval", "coordinator"),
    def(LEASE_TTL_SECS, "30", "Proxy lease lifetime", "proxy"),
    def(COOLDOWN_BASE_SECS, "60", "Base per-domain proxy cooldown after a failure", "proxy"),
    def(MAX_HOURLY_FAILURES, "10", "Failures per hour before a proxy is disabled", "proxy"),
    def(DISABLE_MINUTES, "30", "How long a proxy stays disabled", "proxy"),
    def(DOMAIN_AFFINITY_WEIGHT, "0.7", "Probability of picking from the domain's best proxies", "proxy"),
    def(AFFINITY_TOP_N, "5", "Size of the affinity candidate set", "proxy"),
    def(PROXY_STRATEGY, "\"domain_affinity\"", "round_robin | least_used | random | domain_affinity", "proxy"),
    def(PROXY_REFRESH_INTERVAL_SECS, "300", "Local proxy snapshot refresh interval", "proxy"),
    def(RULES_CACHE_TTL_SECS, "300", "Rule cache lifetime", "rules"),
    def(CONFIG_CACHE_TTL_SECS, "60", "Settings cache lifetime", "system"),
    def(PROMOTION_THRESHOLD, "3", "Successful AI decisions with one signature before promotion", "learning"),
    SettingDef {
        key: SCHEMA_VERSION,
        default: "1",
        description: "Schema version",
        category: "system",
        editable: false,
    },
];

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_are_valid_json_and_unique() {
        let mut seen = std::collections::HashSet::new();
        for d in DEFAULTS {
            assert!(seen.insert(d.key), "duplicate key {}", d.key);
            serde_json::from_str::<serde_json::Value>(d.default)
                .unwrap_or_else(|e| panic!("{}: {e}", d.key));
        }
    }
}
