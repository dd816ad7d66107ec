use rusqlite::{params, Row};

use crate::db::models::{CreateLearnedActionInput, LearnedAction, LearningStats};
use crate::db::repos::{enum_col, json_col, not_found};
use crate::db::DbPool;
use crate::error::AppError;

fn row_to_learned_action(row: &Row) -> rusqlite::Result<LearnedAction> {
    Ok(LearnedAction {
        id: row.get("id")?,
        execution_id: row.get("execution_id")?,
        task_id: row.get("task_id")?,
        error_pattern: enum_col(row, "error_pattern")?,
        error_signature: row.get("error_signature")?,
        domain: row.get("domain")?,
        action: enum_col(row, "action")?,
        action_params: json_col(row, "action_params")?,
        ai_reasoning: row.get("ai_reasoning")?,
        success: row.get::<_, i32>("success")? != 0,
        promoted_to_rule: row.get::<_, i32>("promoted_to_rule")? != 0,
        rule_id: row.get("rule_id")?,
        created_at: row.get("created_at")?,
    })
}

pub fn get_by_id(pool: &DbPool, id: &str) -> Result<LearnedAction, AppError> {
    let conn = pool.get()?;
    conn.query_row(
        "SELECT * FROM learned_actions WHERE id = ?1",
        params![id],
        row_to_learned_action,
    )
    .map_err(not_found(format!("LearnedAction {id}")))
}

pub fn create(pool: &DbPool, input: CreateLearnedActionInput) -> Result<LearnedAction, AppError> {
    let id = uuid::Uuid::new_v4().to_string();
    let now = chrono::Utc::now().to_rfc3339();

    {
        let conn = pool.get()?;
        conn.execute(
            "INSERT INTO learned_actions
             (id, execution_id, task_id, error_pattern, error_signature, domain, action,
              action_params, ai_reasoning, success, promoted_to_rule, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, 0, ?11)",
            params![
                id,
                input.execution_id,
                input.task_id,
                input.error_pattern.as_str(),
                input.error_signature,
                input.domain,
                input.action.as_str(),
                serde_json::to_string(&input.action_params)?,
                input.ai_reasoning,
                input.success as i32,
                now,
            ],
        )?;
    }

    get_by_id(pool, &id)
}

/// Successful, not-yet-promoted rows sharing a signature.
pub fn count_promotable(pool: &DbPool, signature: &str) -> Result<i64, AppError> {
    let conn = pool.get()?;
    let count = conn.query_row(
        "SELECT COUNT(*) FROM learned_actions
         WHERE error_signature = ?1 AND success = 1 AND promoted_to_rule = 0",
        params![signature],
        |row| row.get(0),
    )?;
    Ok(count)
}

/// Mark every successful, unpromoted row with `signature` as promoted into `rule_id`.
pub fn mark_promoted(pool: &DbPool, signature: &str, rule_id: &str) -> Result<usize, AppError> {
    let conn = pool.get()?;
    let rows = conn.execute(
        "UPDATE learned_actions SET promoted_to_rule = 1, rule_id = ?1
         WHERE error_signature = ?2 AND success = 1 AND promoted_to_rule = 0",
        params![rule_id, signature],
    )?;
    Ok(rows)
}

pub fn get_by_signature(pool: &DbPool, signature: &str) -> Result<Vec<LearnedAction>, AppError> {
    let conn = pool.get()?;
    let mut stmt = conn.prepare(
        "SELECT * FROM learned_actions WHERE error_signature = ?1 ORDER BY created_at ASC",
    )?;
    let rows = stmt.query_map(params![signature], row_to_learned_action)?;
    rows.collect::<Result<Vec<_>, _>>().map_err(AppError::Database)
}

pub fn stats(pool: &DbPool) -> Result<LearningStats, AppError> {
    let conn = pool.get()?;
    conn.query_row(
        "SELECT COUNT(*),
                COALESCE(SUM(success), 0),
                COALESCE(SUM(promoted_to_rule), 0)
         FROM learned_actions",
        [],
        |row| {
            Ok(LearningStats {
                total: row.get(0)?,
                successful: row.get(1)?,
                promoted: row.get(2)?,
            })
        },
    )
    .map_err(AppError::Database)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::init_test_db;
    use crate::engine::types::{ActionParams, ActionType, ErrorPattern};

    fn input(signature: &str, success: bool) -> CreateLearnedActionInput {
        CreateLearnedActionInput {
            execution_id: "exec-1".into(),
            task_id: "task-1".into(),
            error_pattern: ErrorPattern::Blocked,
            error_signature: signature.into(),
            domain: "shop.com".into(),
            action: ActionType::SwitchProxy,
            action_params: ActionParams::new(),
            ai_reasoning: Some("IP looks banned".into()),
            success,
        }
    }

    #[test]
    fn test_promotable_counting_and_marking() {
        let pool = init_test_db().unwrap();
        create(&pool, input("sig-a", true)).unwrap();
        create(&pool, input("sig-a", true)).unwrap();
        create(&pool, input("sig-a", false)).unwrap();
        create(&pool, input("sig-b", true)).unwrap();

        assert_eq!(count_promotable(&pool, "sig-a").unwrap(), 2);
        assert_eq!(count_promotable(&pool, "sig-b").unwrap(), 1);

        // rule_id is a foreign key.
        let rule = crate::db::repos::recovery::rules::create(
            &pool,
            crate::db::models::CreateRuleInput {
                name: "learned".into(),
                action: Some(ActionType::SwitchProxy),
                ..Default::default()
            },
        )
        .unwrap();
        assert_eq!(mark_promoted(&pool, "sig-a", &rule.id).unwrap(), 2);
        assert_eq!(count_promotable(&pool, "sig-a").unwrap(), 0);

        let rows = get_by_signature(&pool, "sig-a").unwrap();
        assert_eq!(rows.len(), 3);
        assert!(rows.iter().filter(|r| r.success).all(|r| r.promoted_to_rule));
        assert!(rows.iter().filter(|r| !r.success).all(|r| !r.promoted_to_rule));

        let stats = stats(&pool).unwrap();
        assert_eq!(stats, LearningStats { total: 4, successful: 3, promoted: 2 });
    }

    #[test]
    fn test_stats_on_empty_table() {
        let pool = init_test_db().unwrap();
        assert_eq!(stats(&pool).unwrap(), LearningStats::default());
    }
}
