use rusqlite::{params, OptionalExtension, Row};

use crate::db::models::{CreateRuleInput, RecoveryRule, UpdateRuleInput};
use crate::db::repos::{enum_col, enum_col_opt, json_col, not_found};
use crate::db::DbPool;
use crate::error::AppError;

/// Deterministic evaluation order: priority, then age, then id.
const ORDER_BY: &str = "ORDER BY priority ASC, created_at ASC, id ASC";

fn row_to_rule(row: &Row) -> rusqlite::Result<RecoveryRule> {
    Ok(RecoveryRule {
        id: row.get("id")?,
        name: row.get("name")?,
        description: row.get("description")?,
        priority: row.get("priority")?,
        enabled: row.get::<_, i32>("enabled")? != 0,
        pattern: enum_col_opt(row, "pattern")?,
        conditions: json_col(row, "conditions")?,
        action: enum_col(row, "action")?,
        action_params: json_col(row, "action_params")?,
        max_retries: row.get("max_retries")?,
        retry_delay_secs: row.get("retry_delay_secs")?,
        is_learned: row.get::<_, i32>("is_learned")? != 0,
        learned_from: row.get("learned_from")?,
        success_count: row.get("success_count")?,
        failure_count: row.get("failure_count")?,
        created_at: row.get("created_at")?,
        updated_at: row.get("updated_at")?,
    })
}

pub fn get_all(pool: &DbPool) -> Result<Vec<RecoveryRule>, AppError> {
    let conn = pool.get()?;
    let mut stmt = conn.prepare(&format!("SELECT * FROM recovery_rules {ORDER_BY}"))?;
    let rows = stmt.query_map([], row_to_rule)?;
    rows.collect::<Result<Vec<_>, _>>().map_err(AppError::Database)
}

/// Enabled rules in evaluation order.
pub fn get_enabled(pool: &DbPool) -> Result<Vec<RecoveryRule>, AppError> {
    let conn = pool.get()?;
    let mut stmt = conn.prepare(&format!(
        "SELECT * FROM recovery_rules WHERE enabled = 1 {ORDER_BY}"
    ))?;
    let rows = stmt.query_map([], row_to_rule)?;
    rows.collect::<Result<Vec<_>, _>>().map_err(AppError::Database)
}

pub fn get_by_id(pool: &DbPool, id: &str) -> Result<RecoveryRule, AppError> {
    let conn = pool.get()?;
    conn.query_row(
        "SELECT * FROM recovery_rules WHERE id = ?1",
        params![id],
        row_to_rule,
    )
    .map_err(not_found(format!("RecoveryRule {id}")))
}

/// Oldest learned rule promoted from `signature`, if any.
pub fn get_by_learned_from(pool: &DbPool, signature: &str) -> Result<Option<RecoveryRule>, AppError> {
    let conn = pool.get()?;
    conn.query_row(
        "SELECT * FROM recovery_rules WHERE learned_from = ?1 ORDER BY created_at ASC LIMIT 1",
        params![signature],
        row_to_rule,
    )
    .optional()
    .map_err(AppError::Database)
}

pub fn create(pool: &DbPool, input: CreateRuleInput) -> Result<RecoveryRule, AppError> {
    if input.name.trim().is_empty() {
        return Err(AppError::Validation("Rule name cannot be empty".into()));
    }
    let action = input
        .action
        .ok_or_else(|| AppError::Validation("Rule action is required".into()))?;

    let id = uuid::Uuid::new_v4().to_string();
    let now = chrono::Utc::now().to_rfc3339();

    {
        let conn = pool.get()?;
        conn.execute(
            "INSERT INTO recovery_rules
             (id, name, description, priority, enabled, pattern, conditions, action, action_params,
              max_retries, retry_delay_secs, is_learned, learned_from, created_at, updated_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?14)",
            params![
                id,
                input.name.trim(),
                input.description,
                input.priority.unwrap_or(100),
                input.enabled.unwrap_or(true) as i32,
                input.pattern.map(|p| p.as_str()),
                serde_json::to_string(&input.conditions)?,
                action.as_str(),
                serde_json::to_string(&input.action_params)?,
                input.max_retries.unwrap_or(3),
                input.retry_delay_secs.unwrap_or(5),
                input.is_learned.unwrap_or(false) as i32,
                input.learned_from,
                now,
            ],
        )?;
    }

    get_by_id(pool, &id)
}

pub fn update(pool: &DbPool, id: &str, input: UpdateRuleInput) -> Result<RecoveryRule, AppError> {
    // Verify exists
    get_by_id(pool, id)?;

    if let Some(ref name) = input.name {
        if name.trim().is_empty() {
            return Err(AppError::Validation("Rule name cannot be empty".into()));
        }
    }

    let now = chrono::Utc::now().to_rfc3339();

    let conditions = input.conditions.as_ref().map(serde_json::to_string).transpose()?;
    let action_params = input.action_params.as_ref().map(serde_json::to_string).transpose()?;

    let mut sets: Vec<String> = vec!["updated_at = ?1".into()];
    let mut param_values: Vec<Box<dyn rusqlite::types::ToSql>> = vec![Box::new(now)];

    push_field!(sets, param_values, "name", input.name.map(|v| v.trim().to_string()));
    push_field!(sets, param_values, "description", input.description);
    push_field!(sets, param_values, "priority", input.priority);
    push_field!(sets, param_values, "enabled", input.enabled.map(|v| v as i32));
    push_field!(sets, param_values, "pattern", input.pattern.map(|v| v.map(|p| p.as_str())));
    push_field!(sets, param_values, "conditions", conditions);
    push_field!(sets, param_values, "action", input.action.map(|v| v.as_str()));
    push_field!(sets, param_values, "action_params", action_params);
    push_field!(sets, param_values, "max_retries", input.max_retries);
    push_field!(sets, param_values, "retry_delay_secs", input.retry_delay_secs);

    param_values.push(Box::new(id.to_string()));
    let sql = format!(
        "UPDATE recovery_rules SET {} WHERE id = ?{}",
        sets.join(", "),
        param_values.len()
    );

    {
        let conn = pool.get()?;
        let params_ref: Vec<&dyn rusqlite::types::ToSql> =
            param_values.iter().map(|p| p.as_ref()).collect();
        conn.execute(&sql, params_ref.as_slice())?;
    }

    get_by_id(pool, id)
}

/// Soft-disable or re-enable a rule.
pub fn set_enabled(pool: &DbPool, id: &str, enabled: bool) -> Result<(), AppError> {
    let now = chrono::Utc::now().to_rfc3339();
    let conn = pool.get()?;
    let rows = conn.execute(
        "UPDATE recovery_rules SET enabled = ?1, updated_at = ?2 WHERE id = ?3",
        params![enabled as i32, now, id],
    )?;
    if rows == 0 {
        return Err(AppError::NotFound(format!("RecoveryRule {id}")));
    }
    Ok(())
}

/// Hard delete, reserved for explicit operator action.
pub fn delete(pool: &DbPool, id: &str) -> Result<bool, AppError> {
    let conn = pool.get()?;
    let rows = conn.execute("DELETE FROM recovery_rules WHERE id = ?1", params![id])?;
    Ok(rows > 0)
}

/// Atomically bump the success or failure counter.
pub fn record_outcome(pool: &DbPool, id: &str, success: bool) -> Result<(), AppError> {
    let now = chrono::Utc::now().to_rfc3339();
    let sql = if success {
        "UPDATE recovery_rules SET success_count = success_count + 1, updated_at = ?1 WHERE id = ?2"
    } else {
        "UPDATE recovery_rules SET failure_count = failure_count + 1, updated_at = ?1 WHERE id = ?2"
    };
    let conn = pool.get()?;
    let rows = conn.execute(sql, params![now, id])?;
    if rows == 0 {
        return Err(AppError::NotFound(format!("RecoveryRule {id}")));
    }
    Ok(())
}
