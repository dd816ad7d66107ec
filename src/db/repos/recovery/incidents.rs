use rusqlite::{params, Row};

use crate::db::models::{CreateIncidentInput, Incident, IncidentFilter, IncidentStatus};
use crate::db::repos::{enum_col, json_col, json_col_opt, not_found};
use crate::db::DbPool;
use crate::engine::types::ErrorPattern;
use crate::error::AppError;

fn row_to_incident(row: &Row) -> rusqlite::Result<Incident> {
    Ok(Incident {
        id: row.get("id")?,
        task_id: row.get("task_id")?,
        execution_id: row.get("execution_id")?,
        domain: row.get("domain")?,
        url: row.get("url")?,
        error_pattern: enum_col(row, "error_pattern")?,
        error_message: row.get("error_message")?,
        status_code: row.get::<_, Option<i64>>("status_code")?.map(|c| c as u16),
        attempts: json_col(row, "attempts")?,
        ai_reasoning: row.get("ai_reasoning")?,
        ai_failure: row.get("ai_failure")?,
        snapshot: json_col_opt(row, "snapshot")?,
        priority: enum_col(row, "priority")?,
        suggested_actions: json_col(row, "suggested_actions")?,
        status: enum_col(row, "status")?,
        assigned_to: row.get("assigned_to")?,
        resolution_notes: row.get("resolution_notes")?,
        created_at: row.get("created_at")?,
        updated_at: row.get("updated_at")?,
        resolved_at: row.get("resolved_at")?,
    })
}

pub fn get_by_id(pool: &DbPool, id: &str) -> Result<Incident, AppError> {
    let conn = pool.get()?;
    conn.query_row(
        "SELECT * FROM incidents WHERE id = ?1",
        params![id],
        row_to_incident,
    )
    .map_err(not_found(format!("Incident {id}")))
}

pub fn list(pool: &DbPool, filter: &IncidentFilter) -> Result<Vec<Incident>, AppError> {
    let conn = pool.get()?;

    let mut conditions: Vec<String> = Vec::new();
    let mut param_values: Vec<Box<dyn rusqlite::types::ToSql>> = Vec::new();
    let mut param_idx = 1u32;

    if let Some(status) = filter.status {
        conditions.push(format!("status = ?{}", param_idx));
        param_values.push(Box::new(status.as_str()));
        param_idx += 1;
    }
    if let Some(ref domain) = filter.domain {
        conditions.push(format!("domain = ?{}", param_idx));
        param_values.push(Box::new(domain.clone()));
        param_idx += 1;
    }

    let where_clause = if conditions.is_empty() {
        String::new()
    } else {
        format!("WHERE {}", conditions.join(" AND "))
    };

    let sql = format!(
        "SELECT * FROM incidents {} ORDER BY created_at DESC, id DESC LIMIT ?{}",
        where_clause, param_idx
    );
    param_values.push(Box::new(filter.limit.unwrap_or(100).clamp(1, 1000)));

    let params_ref: Vec<&dyn rusqlite::types::ToSql> =
        param_values.iter().map(|p| p.as_ref()).collect();

    let mut stmt = conn.prepare(&sql)?;
    let rows = stmt.query_map(params_ref.as_slice(), row_to_incident)?;
    rows.collect::<Result<Vec<_>, _>>().map_err(AppError::Database)
}

/// Whether any incident already exists for this domain + pattern.
pub fn exists_for(pool: &DbPool, domain: &str, pattern: ErrorPattern) -> Result<bool, AppError> {
    let conn = pool.get()?;
    let count: i64 = conn.query_row(
        "SELECT COUNT(*) FROM incidents WHERE domain = ?1 AND error_pattern = ?2",
        params![domain, pattern.as_str()],
        |row| row.get(0),
    )?;
    Ok(count > 0)
}

pub fn create(pool: &DbPool, input: CreateIncidentInput) -> Result<Incident, AppError> {
    let id = uuid::Uuid::new_v4().to_string();
    let now = chrono::Utc::now().to_rfc3339();
    let snapshot = input.snapshot.as_ref().map(serde_json::to_string).transpose()?;

    {
        let conn = pool.get()?;
        conn.execute(
            "INSERT INTO incidents
             (id, task_id, execution_id, domain, url, error_pattern, error_message, status_code,
              attempts, ai_reasoning, ai_failure, snapshot, priority, suggested_actions, status,
              created_at, updated_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15, ?16, ?16)",
            params![
                id,
                input.task_id,
                input.execution_id,
                input.domain,
                input.url,
                input.error_pattern.as_str(),
                input.error_message,
                input.status_code.map(i64::from),
                serde_json::to_string(&input.attempts)?,
                input.ai_reasoning,
                input.ai_failure,
                snapshot,
                input.priority.as_str(),
                serde_json::to_string(&input.suggested_actions)?,
                input.status.as_str(),
                now,
            ],
        )?;
    }

    get_by_id(pool, &id)
}

/// Move an incident to `status`, enforcing the allowed transitions.
pub fn update_status(
    pool: &DbPool,
    id: &str,
    status: IncidentStatus,
    notes: Option<&str>,
) -> Result<Incident, AppError> {
    let current = get_by_id(pool, id)?;
    if !current.status.can_transition_to(status) {
        return Err(AppError::Validation(format!(
            "Incident {id} cannot move from {} to {}",
            current.status, status
        )));
    }

    let now = chrono::Utc::now().to_rfc3339();
    let resolved_at = status.is_terminal().then(|| now.clone());
    {
        let conn = pool.get()?;
        conn.execute(
            "UPDATE incidents
             SET status = ?1, updated_at = ?2, resolved_at = ?3,
                 resolution_notes = COALESCE(?4, resolution_notes)
             WHERE id = ?5",
            params![status.as_str(), now, resolved_at, notes, id],
        )?;
    }

    get_by_id(pool, id)
}

pub fn assign(pool: &DbPool, id: &str, assignee: &str) -> Result<Incident, AppError> {
    if assignee.trim().is_empty() {
        return Err(AppError::Validation("Assignee cannot be empty".into()));
    }
    let now = chrono::Utc::now().to_rfc3339();
    let rows = {
        let conn = pool.get()?;
        conn.execute(
            "UPDATE incidents SET assigned_to = ?1, updated_at = ?2 WHERE id = ?3",
            params![assignee.trim(), now, id],
        )?
    };
    if rows == 0 {
        return Err(AppError::NotFound(format!("Incident {id}")));
    }
    get_by_id(pool, id)
}
