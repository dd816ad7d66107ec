#[macro_use]
pub mod macros;
pub mod migrations;
pub mod models;
pub mod repos;
pub mod settings_keys;

use std::path::Path;

use r2d2::{CustomizeConnection, Pool};
use r2d2_sqlite::SqliteConnectionManager;
use rusqlite::params;

use crate::config::DatabaseConfig;
use crate::error::AppError;

pub type DbPool = Pool<SqliteConnectionManager>;

/// Connection customizer that sets per-connection SQLite pragmas.
#[derive(Debug)]
struct SqlitePragmaCustomizer;

impl CustomizeConnection<rusqlite::Connection, rusqlite::Error> for SqlitePragmaCustomizer {
    fn on_acquire(&self, conn: &mut rusqlite::Connection) -> Result<(), rusqlite::Error> {
        conn.execute_batch(
            "PRAGMA foreign_keys = ON;
             PRAGMA busy_timeout = 5000;
             PRAGMA synchronous = NORMAL;
             PRAGMA cache_size = -8000;",
        )?;
        Ok(())
    }
}

/// Initialize the database: create file, enable WAL + foreign keys, run migrations, seed defaults.
pub fn init_db(config: &DatabaseConfig) -> Result<DbPool, AppError> {
    if let Some(parent) = config.path.parent().filter(|p| !p.as_os_str().is_empty()) {
        std::fs::create_dir_all(parent)?;
    }

    tracing::info!(path = %config.path.display(), "Initializing database");

    let pool = build_pool(&config.path, config.pool_size.max(1))?;

    // Set WAL journal mode (database-wide, only needs to run once)
    {
        let conn = pool.get()?;
        conn.execute_batch("PRAGMA journal_mode = WAL;")?;
        tracing::debug!("SQLite pragmas configured (WAL, FK, busy_timeout)");
    }

    {
        let conn = pool.get()?;
        migrations::run(&conn)?;
        seed_system_config(&conn)?;
    }

    tracing::info!("Database initialized successfully");
    Ok(pool)
}

fn build_pool(path: &Path, max_size: u32) -> Result<DbPool, AppError> {
    let manager = SqliteConnectionManager::file(path);
    let pool = Pool::builder()
        .max_size(max_size)
        .connection_timeout(std::time::Duration::from_secs(5))
        .connection_customizer(Box::new(SqlitePragmaCustomizer))
        .build(manager)?;
    Ok(pool)
}

/// Seed every dynamic setting with its default. Existing rows (operator edits) are kept.
fn seed_system_config(conn: &rusqlite::Connection) -> Result<(), AppError> {
    let now = chrono::Utc::now().to_rfc3339();
    for def in settings_keys::DEFAULTS {
        conn.execute(
            "INSERT OR IGNORE INTO system_config (key, value, description, category, editable, updated_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
            params![
                def.key,
                def.default.to_string(),
                def.description,
                def.category,
                def.editable as i32,
                now
            ],
        )?;
    }
    tracing::debug!(count = settings_keys::DEFAULTS.len(), "System config defaults seeded");
    Ok(())
}

/// Migrated pool on a unique temp file. Shared by unit and integration tests.
pub fn init_test_db() -> Result<DbPool, AppError> {
    // Use a unique temp file for each test to avoid in-memory connection issues with r2d2.
    let tmp = std::env::temp_dir().join(format!("crawl_recovery_test_{}.db", uuid::Uuid::new_v4()));
    let pool = build_pool(&tmp, 4)?;

    let conn = pool.get()?;
    migrations::run(&conn)?;
    seed_system_config(&conn)?;
    drop(conn);
    Ok(pool)
}
