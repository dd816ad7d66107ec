//! Self-healing recovery layer for a fleet of crawl workers.
//!
//! A worker reports a failed fetch to [`RecoveryManager::try_recover`] and gets
//! back a [`RecoveryPlan`]. Detection, per-domain counters, fleet-wide
//! coordination, the rule → AI → default decision, proxy leasing, learning and
//! incident escalation all happen behind that call.

pub mod config;
pub mod db;
pub mod engine;
pub mod error;
pub mod logging;
pub mod store;

pub use engine::types::{
    ActionType, DetectedError, ErrorPattern, FetchFailure, PlanSource, RecoveryAttempt, RecoveryPlan,
};
pub use engine::RecoveryManager;
pub use error::AppError;
