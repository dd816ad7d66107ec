use rusqlite::{params, Row};

use crate::db::models::SystemConfigEntry;
use crate::db::repos::json_col;
use crate::db::DbPool;
use crate::error::AppError;

fn row_to_entry(row: &Row) -> rusqlite::Result<SystemConfigEntry> {
    Ok(SystemConfigEntry {
        key: row.get("key")?,
        value: json_col(row, "value")?,
        description: row.get("description")?,
        category: row.get("category")?,
        editable: row.get::<_, i32>("editable")? != 0,
        updated_at: row.get("updated_at")?,
    })
}

/// Get a setting by key. Returns None if not found.
pub fn get(pool: &DbPool, key: &str) -> Result<Option<SystemConfigEntry>, AppError> {
    let conn = pool.get()?;
    let result = conn.query_row(
        "SELECT * FROM system_config WHERE key = ?1",
        params![key],
        row_to_entry,
    );

    match result {
        Ok(entry) => Ok(Some(entry)),
        Err(rusqlite::Error::QueryReturnedNoRows) => Ok(None),
        Err(e) => Err(AppError::Database(e)),
    }
}

pub fn get_all(pool: &DbPool) -> Result<Vec<SystemConfigEntry>, AppError> {
    let conn = pool.get()?;
    let mut stmt = conn.prepare("SELECT * FROM system_config ORDER BY category, key")?;
    let rows = stmt.query_map([], row_to_entry)?;
    rows.collect::<Result<Vec<_>, _>>().map_err(AppError::Database)
}

/// Set a setting value. Creates the key if missing; rejects non-editable keys.
pub fn set(pool: &DbPool, key: &str, value: &serde_json::Value) -> Result<SystemConfigEntry, AppError> {
    if key.trim().is_empty() {
        return Err(AppError::Validation("Config key cannot be empty".into()));
    }
    if let Some(existing) = get(pool, key)? {
        if !existing.editable {
            return Err(AppError::Validation(format!("Config key '{key}' is not editable")));
        }
    }

    let now = chrono::Utc::now().to_rfc3339();
    let encoded = serde_json::to_string(value)?;
    let category = key.split('.').next().unwrap_or("general");
    {
        let conn = pool.get()?;
        conn.execute(
            "INSERT INTO system_config (key, value, category, editable, updated_at)
             VALUES (?1, ?2, ?3, 1, ?4)
             ON CONFLICT(key) DO UPDATE SET value = ?2, updated_at = ?4",
            params![key, encoded, category, now],
        )?;
    }

    get(pool, key)?.ok_or_else(|| AppError::NotFound(format!("SystemConfig {key}")))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::init_test_db;
    use crate::db::settings_keys;

    #[test]
    fn test_seeded_defaults_readable() {
        let pool = init_test_db().unwrap();
        let entry = get(&pool, settings_keys::CONSECUTIVE_THRESHOLD).unwrap().unwrap();
        assert_eq!(entry.value, serde_json::json!(3));
        assert_eq!(entry.category, "recovery");
        assert!(entry.editable);
        assert_eq!(get_all(&pool).unwrap().len(), settings_keys::DEFAULTS.len());
    }

    #[test]
    fn test_set_and_overwrite() {
        let pool = init_test_db().unwrap();
        assert_eq!(get(&pool, "custom.flag").unwrap(), None);

        set(&pool, "custom.flag", &serde_json::json!(true)).unwrap();
        let entry = get(&pool, "custom.flag").unwrap().unwrap();
        assert_eq!(entry.value, serde_json::json!(true));
        assert_eq!(entry.category, "custom");

        set(&pool, settings_keys::PROXY_STRATEGY, &serde_json::json!("least_used")).unwrap();
        let entry = get(&pool, settings_keys::PROXY_STRATEGY).unwrap().unwrap();
        assert_eq!(entry.value, serde_json::json!("least_used"));
        // Category and description survive the overwrite.
        assert_eq!(entry.category, "proxy");
        assert!(entry.description.is_some());
    }

    #[test]
    fn test_non_editable_rejected() {
        let pool = init_test_db().unwrap();
        let err = set(&pool, settings_keys::SCHEMA_VERSION, &serde_json::json!(99)).unwrap_err();
        assert!(matches!(err, AppError::Validation(_)));
        let entry = get(&pool, settings_keys::SCHEMA_VERSION).unwrap().unwrap();
        assert_eq!(entry.value, serde_json::json!(1));
    }
}
