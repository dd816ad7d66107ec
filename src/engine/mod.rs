pub mod actions;
pub mod agent;
pub mod background;
pub mod config_manager;
pub mod coordinator;
pub mod detector;
pub mod domain_health;
pub mod incident;
pub mod learning;
pub mod manager;
pub mod provider;
pub mod proxy;
pub mod rules;
pub mod tracker;
pub mod types;

pub use manager::{RecoveryManager, RecoveryManagerBuilder};
