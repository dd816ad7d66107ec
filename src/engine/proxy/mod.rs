//! Proxy selection and leasing.
//!
//! [`ProxyManager`] owns the durable proxy inventory and a process-local
//! snapshot of it. [`DistributedProxyManager`] layers fleet-wide selection,
//! exclusive leases, cooldowns and affinity on top through the shared store.

pub mod distributed;
pub mod local;

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::AppError;

pub use distributed::DistributedProxyManager;
pub use local::ProxyManager;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SelectionStrategy {
    /// Per-domain rotation counter.
    RoundRobin,
    /// Lowest fleet-wide usage score first.
    LeastUsed,
    Random,
    /// Prefer proxies that recently worked for the domain.
    DomainAffinity,
}

impl SelectionStrategy {
    pub fn as_str(&self) -> &'static str {
        match self {
            SelectionStrategy::RoundRobin => "round_robin",
            SelectionStrategy::LeastUsed => "least_used",
            SelectionStrategy::Random => "random",
            SelectionStrategy::DomainAffinity => "domain_affinity",
        }
    }
}

impl fmt::Display for SelectionStrategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for SelectionStrategy {
    type Err = AppError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "round_robin" => Ok(SelectionStrategy::RoundRobin),
            "least_used" => Ok(SelectionStrategy::LeastUsed),
            "random" => Ok(SelectionStrategy::Random),
            "domain_affinity" => Ok(SelectionStrategy::DomainAffinity),
            other => Err(AppError::Validation(format!("unknown proxy strategy '{other}'"))),
        }
    }
}

/// Exclusive, TTL-bounded claim on one proxy. A crashed holder loses it on expiry.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProxyLease {
    pub proxy_id: String,
    pub server: String,
    pub domain: String,
    pub worker_id: String,
    /// Value stored under the lease key; release only deletes a matching token.
    pub token: String,
    pub acquired_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
}

/// Fleet-wide health counters for one proxy. Stored with a TTL refreshed on every write.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ProxyHealth {
    pub proxy_id: String,
    pub success: i64,
    pub failure: i64,
    pub total_requests: i64,
    pub last_success: Option<DateTime<Utc>>,
    pub last_failure: Option<DateTime<Utc>>,
    pub hourly_failures: i64,
    pub usage_score: f64,
    pub is_leased: bool,
    pub is_disabled: bool,
    pub disabled_until: Option<DateTime<Utc>>,
    pub last_failure_pattern: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_strategy_names() {
        for s in [
            SelectionStrategy::RoundRobin,
            SelectionStrategy::LeastUsed,
            SelectionStrategy::Random,
            SelectionStrategy::DomainAffinity,
        ] {
            assert_eq!(s.as_str().parse::<SelectionStrategy>().unwrap(), s);
            assert_eq!(serde_json::to_value(s).unwrap(), s.as_str());
        }
        assert!("fastest".parse::<SelectionStrategy>().is_err());
    }
}
