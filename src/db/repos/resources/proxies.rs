use rusqlite::{params, Row};

use crate::db::models::{CreateProxyInput, Proxy};
use crate::db::repos::not_found;
use crate::db::DbPool;
use crate::error::AppError;

fn row_to_proxy(row: &Row) -> rusqlite::Result<Proxy> {
    Ok(Proxy {
        id: row.get("id")?,
        proxy_id: row.get("proxy_id")?,
        server: row.get("server")?,
        username: row.get("username")?,
        password: row.get("password")?,
        address: row.get("address")?,
        port: row.get::<_, i64>("port")? as u16,
        valid: row.get::<_, i32>("valid")? != 0,
        last_verified: row.get("last_verified")?,
        country_code: row.get("country_code")?,
        city: row.get("city")?,
        proxy_type: row.get("proxy_type")?,
        failure_count: row.get("failure_count")?,
        success_count: row.get("success_count")?,
        last_used: row.get("last_used")?,
        is_healthy: row.get::<_, i32>("is_healthy")? != 0,
        created_at: row.get("created_at")?,
    })
}

pub fn get_all(pool: &DbPool) -> Result<Vec<Proxy>, AppError> {
    let conn = pool.get()?;
    let mut stmt = conn.prepare("SELECT * FROM proxies ORDER BY proxy_id")?;
    let rows = stmt.query_map([], row_to_proxy)?;
    rows.collect::<Result<Vec<_>, _>>().map_err(AppError::Database)
}

/// Valid, healthy proxies in a stable order.
pub fn get_usable(pool: &DbPool) -> Result<Vec<Proxy>, AppError> {
    let conn = pool.get()?;
    let mut stmt = conn.prepare(
        "SELECT * FROM proxies WHERE valid = 1 AND is_healthy = 1 ORDER BY proxy_id",
    )?;
    let rows = stmt.query_map([], row_to_proxy)?;
    rows.collect::<Result<Vec<_>, _>>().map_err(AppError::Database)
}

pub fn get_by_proxy_id(pool: &DbPool, proxy_id: &str) -> Result<Proxy, AppError> {
    let conn = pool.get()?;
    conn.query_row(
        "SELECT * FROM proxies WHERE proxy_id = ?1",
        params![proxy_id],
        row_to_proxy,
    )
    .map_err(not_found(format!("Proxy {proxy_id}")))
}

pub fn create(pool: &DbPool, input: CreateProxyInput) -> Result<Proxy, AppError> {
    if input.proxy_id.trim().is_empty() {
        return Err(AppError::Validation("Proxy id cannot be empty".into()));
    }
    if input.address.trim().is_empty() || input.port == 0 {
        return Err(AppError::Validation("Proxy address and port are required".into()));
    }

    let scheme = input.scheme.as_deref().unwrap_or("http");
    let server = format!("{scheme}://{}:{}", input.address.trim(), input.port);
    url::Url::parse(&server)
        .map_err(|e| AppError::Validation(format!("Invalid proxy server '{server}': {e}")))?;

    let id = uuid::Uuid::new_v4().to_string();
    let now = chrono::Utc::now().to_rfc3339();
    {
        let conn = pool.get()?;
        conn.execute(
            "INSERT INTO proxies
             (id, proxy_id, server, username, password, address, port, valid, country_code,
              city, proxy_type, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, 1, ?8, ?9, ?10, ?11)",
            params![
                id,
                input.proxy_id.trim(),
                server,
                input.username,
                input.password,
                input.address.trim(),
                input.port as i64,
                input.country_code,
                input.city,
                input.proxy_type.as_deref().unwrap_or("datacenter"),
                now,
            ],
        )?;
    }

    get_by_proxy_id(pool, input.proxy_id.trim())
}

/// Bump success or failure counters and `last_used`.
pub fn record_result(pool: &DbPool, proxy_id: &str, success: bool) -> Result<(), AppError> {
    let now = chrono::Utc::now().to_rfc3339();
    let sql = if success {
        "UPDATE proxies SET success_count = success_count + 1, last_used = ?1 WHERE proxy_id = ?2"
    } else {
        "UPDATE proxies SET failure_count = failure_count + 1, last_used = ?1 WHERE proxy_id = ?2"
    };
    let conn = pool.get()?;
    let rows = conn.execute(sql, params![now, proxy_id])?;
    if rows == 0 {
        return Err(AppError::NotFound(format!("Proxy {proxy_id}")));
    }
    Ok(())
}

pub fn set_healthy(pool: &DbPool, proxy_id: &str, healthy: bool) -> Result<(), AppError> {
    let conn = pool.get()?;
    let rows = conn.execute(
        "UPDATE proxies SET is_healthy = ?1 WHERE proxy_id = ?2",
        params![healthy as i32, proxy_id],
    )?;
    if rows == 0 {
        return Err(AppError::NotFound(format!("Proxy {proxy_id}")));
    }
    Ok(())
}

pub fn log_usage(
    pool: &DbPool,
    proxy_id: &str,
    domain: &str,
    worker_id: Option<&str>,
    success: bool,
    pattern: Option<&str>,
) -> Result<(), AppError> {
    let now = chrono::Utc::now().to_rfc3339();
    let conn = pool.get()?;
    conn.execute(
        "INSERT INTO proxy_usage_log (proxy_id, domain, worker_id, success, pattern, created_at)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
        params![proxy_id, domain, worker_id, success as i32, pattern, now],
    )?;
    Ok(())
}

pub fn usage_count(pool: &DbPool, proxy_id: &str) -> Result<i64, AppError> {
    let conn = pool.get()?;
    let count = conn.query_row(
        "SELECT COUNT(*) FROM proxy_usage_log WHERE proxy_id = ?1",
        params![proxy_id],
        |row| row.get(0),
    )?;
    Ok(count)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::init_test_db;

    fn input(proxy_id: &str, port: u16) -> CreateProxyInput {
        CreateProxyInput {
            proxy_id: proxy_id.into(),
            address: "10.0.0.1".into(),
            port,
            ..Default::default()
        }
    }

    #[test]
    fn test_create_and_counters() {
        let pool = init_test_db().unwrap();
        let proxy = create(&pool, input("p1", 8080)).unwrap();
        assert_eq!(proxy.server, "http://10.0.0.1:8080");
        assert!(proxy.valid && proxy.is_healthy);
        assert_eq!(proxy.proxy_type, "datacenter");

        record_result(&pool, "p1", true).unwrap();
        record_result(&pool, "p1", false).unwrap();
        record_result(&pool, "p1", false).unwrap();
        let proxy = get_by_proxy_id(&pool, "p1").unwrap();
        assert_eq!(proxy.success_count, 1);
        assert_eq!(proxy.failure_count, 2);
        assert!(proxy.last_used.is_some());
    }

    #[test]
    fn test_usable_excludes_unhealthy() {
        let pool = init_test_db().unwrap();
        create(&pool, input("p1", 8080)).unwrap();
        create(&pool, input("p2", 8081)).unwrap();
        set_healthy(&pool, "p1", false).unwrap();
        let usable: Vec<String> = get_usable(&pool).unwrap().into_iter().map(|p| p.proxy_id).collect();
        assert_eq!(usable, vec!["p2"]);
        assert_eq!(get_all(&pool).unwrap().len(), 2);
    }

    #[test]
    fn test_usage_log() {
        let pool = init_test_db().unwrap();
        log_usage(&pool, "p1", "shop.com", Some("w1"), true, None).unwrap();
        log_usage(&pool, "p1", "shop.com", Some("w1"), false, Some("blocked")).unwrap();
        assert_eq!(usage_count(&pool, "p1").unwrap(), 2);
        assert_eq!(usage_count(&pool, "p2").unwrap(), 0);
    }

    #[test]
    fn test_validation() {
        let pool = init_test_db().unwrap();
        assert!(matches!(create(&pool, input("", 80)), Err(AppError::Validation(_))));
        assert!(matches!(create(&pool, input("p", 0)), Err(AppError::Validation(_))));
        assert!(matches!(record_result(&pool, "ghost", true), Err(AppError::NotFound(_))));
    }
}
