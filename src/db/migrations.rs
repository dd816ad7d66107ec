use rusqlite::Connection;

use crate::error::AppError;

/// Run the idempotent schema migration.
pub fn run(conn: &Connection) -> Result<(), AppError> {
    tracing::debug!("Running database migrations");

    conn.execute_batch(SCHEMA)?;

    tracing::info!("Database migrations complete");
    Ok(())
}

const SCHEMA: &str = r#"

-- ============================================================================
-- Recovery Rules
-- ============================================================================

CREATE TABLE IF NOT EXISTS recovery_rules (
    id                TEXT PRIMARY KEY,
    name              TEXT NOT NULL,
    description       TEXT,
    priority          INTEGER NOT NULL DEFAULT 100,
    enabled           INTEGER NOT NULL DEFAULT 1,
    pattern           TEXT,
    conditions        TEXT NOT NULL DEFAULT '[]',
    action            TEXT NOT NULL,
    action_params     TEXT NOT NULL DEFAULT '{}',
    max_retries       INTEGER NOT NULL DEFAULT 3,
    retry_delay_secs  INTEGER NOT NULL DEFAULT 5,
    is_learned        INTEGER NOT NULL DEFAULT 0,
    learned_from      TEXT,
    success_count     INTEGER NOT NULL DEFAULT 0,
    failure_count     INTEGER NOT NULL DEFAULT 0,
    created_at        TEXT NOT NULL,
    updated_at        TEXT NOT NULL
);
CREATE INDEX IF NOT EXISTS idx_rules_enabled_priority ON recovery_rules(enabled, priority);

-- ============================================================================
-- Learned Actions (AI decision outcomes)
-- ============================================================================

CREATE TABLE IF NOT EXISTS learned_actions (
    id                TEXT PRIMARY KEY,
    execution_id      TEXT NOT NULL,
    task_id           TEXT NOT NULL,
    error_pattern     TEXT NOT NULL,
    error_signature   TEXT NOT NULL,
    domain            TEXT NOT NULL,
    action            TEXT NOT NULL,
    action_params     TEXT NOT NULL DEFAULT '{}',
    ai_reasoning      TEXT,
    success           INTEGER NOT NULL,
    promoted_to_rule  INTEGER NOT NULL DEFAULT 0,
    rule_id           TEXT REFERENCES recovery_rules(id) ON DELETE SET NULL,
    created_at        TEXT NOT NULL
);
CREATE INDEX IF NOT EXISTS idx_learned_signature
    ON learned_actions(error_signature, success, promoted_to_rule);

-- ============================================================================
-- Incidents
-- ============================================================================

CREATE TABLE IF NOT EXISTS incidents (
    id                 TEXT PRIMARY KEY,
    task_id            TEXT NOT NULL,
    execution_id       TEXT NOT NULL,
    domain             TEXT NOT NULL,
    url                TEXT NOT NULL,
    error_pattern      TEXT NOT NULL,
    error_message      TEXT NOT NULL,
    status_code        INTEGER,
    attempts           TEXT NOT NULL DEFAULT '[]',
    ai_reasoning       TEXT,
    ai_failure         TEXT,
    snapshot           TEXT,
    priority           TEXT NOT NULL CHECK(priority IN ('low', 'medium', 'high', 'critical')),
    suggested_actions  TEXT NOT NULL DEFAULT '[]',
    status             TEXT NOT NULL DEFAULT 'open'
                       CHECK(status IN ('open', 'in_progress', 'resolved', 'ignored', 'recurring')),
    assigned_to        TEXT,
    resolution_notes   TEXT,
    created_at         TEXT NOT NULL,
    updated_at         TEXT NOT NULL,
    resolved_at        TEXT
);
CREATE INDEX IF NOT EXISTS idx_incidents_domain_pattern ON incidents(domain, error_pattern);
CREATE INDEX IF NOT EXISTS idx_incidents_status         ON incidents(status);

-- ============================================================================
-- Proxies
-- ============================================================================

CREATE TABLE IF NOT EXISTS proxies (
    id              TEXT PRIMARY KEY,
    proxy_id        TEXT NOT NULL UNIQUE,
    server          TEXT NOT NULL,
    username        TEXT,
    password        TEXT,
    address         TEXT NOT NULL,
    port            INTEGER NOT NULL,
    valid           INTEGER NOT NULL DEFAULT 1,
    last_verified   TEXT,
    country_code    TEXT,
    city            TEXT,
    proxy_type      TEXT NOT NULL DEFAULT 'datacenter',
    failure_count   INTEGER NOT NULL DEFAULT 0,
    success_count   INTEGER NOT NULL DEFAULT 0,
    last_used       TEXT,
    is_healthy      INTEGER NOT NULL DEFAULT 1,
    created_at      TEXT NOT NULL
);
CREATE INDEX IF NOT EXISTS idx_proxies_usable ON proxies(valid, is_healthy);

CREATE TABLE IF NOT EXISTS proxy_usage_log (
    id          INTEGER PRIMARY KEY AUTOINCREMENT,
    proxy_id    TEXT NOT NULL,
    domain      TEXT NOT NULL,
    worker_id   TEXT,
    success     INTEGER NOT NULL,
    pattern     TEXT,
    created_at  TEXT NOT NULL
);
CREATE INDEX IF NOT EXISTS idx_proxy_usage_proxy ON proxy_usage_log(proxy_id, created_at);

-- ============================================================================
-- Dynamic settings
-- ============================================================================

CREATE TABLE IF NOT EXISTS system_config (
    key          TEXT PRIMARY KEY,
    value        TEXT NOT NULL,
    description  TEXT,
    category     TEXT NOT NULL DEFAULT 'general',
    editable     INTEGER NOT NULL DEFAULT 1,
    updated_at   TEXT NOT NULL
);
CREATE INDEX IF NOT EXISTS idx_system_config_category ON system_config(category);
"#;
