//! Worker sidecar: one JSON request per stdin line, one JSON response per stdout line.
//!
//! ```text
//! {"id":1,"op":"recover","task_id":"t","execution_id":"e","url":"https://x.com","failure":{"status_code":403}}
//! {"id":1,"ok":true,"result":{"action":"switch_proxy",...}}
//! ```

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::sync::mpsc;

use crawl_recovery::config::AppConfig;
use crawl_recovery::db::models::IncidentFilter;
use crawl_recovery::logging::{self, LogFormat};
use crawl_recovery::{AppError, FetchFailure, RecoveryManager};

#[derive(Debug, Deserialize)]
struct Envelope {
    #[serde(default)]
    id: Option<Value>,
    #[serde(flatten)]
    request: Request,
}

#[derive(Debug, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
enum Request {
    Recover {
        task_id: String,
        execution_id: String,
        url: String,
        #[serde(default)]
        failure: FetchFailure,
        #[serde(default)]
        page_content: Option<String>,
    },
    Outcome {
        task_id: String,
        success: bool,
    },
    Success {
        url: String,
        #[serde(default)]
        proxy_id: Option<String>,
    },
    DomainStatus {
        domain: String,
    },
    RefreshRules,
    Incidents {
        #[serde(default)]
        filter: IncidentFilter,
    },
}

#[derive(Debug, Serialize)]
struct Response {
    #[serde(skip_serializing_if = "Option::is_none")]
    id: Option<Value>,
    ok: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    result: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    error: Option<AppError>,
}

impl Response {
    fn from_result(id: Option<Value>, result: Result<Value, AppError>) -> Self {
        match result {
            Ok(v) => Self { id, ok: true, result: Some(v), error: None },
            Err(e) => Self { id, ok: false, result: None, error: Some(e) },
        }
    }
}

fn main() {
    // Sentry first so panics during startup are captured. No-op without SENTRY_DSN.
    let _sentry_guard = sentry::init(logging::sentry_options());
    logging::init(LogFormat::from_env());

    tracing::info!("Starting crawl-recovery sidecar v{}", env!("CARGO_PKG_VERSION"));

    let runtime = match tokio::runtime::Builder::new_multi_thread().enable_all().build() {
        Ok(rt) => rt,
        Err(e) => {
            tracing::error!(error = %e, "Failed to start Tokio runtime");
            std::process::exit(1);
        }
    };

    if let Err(e) = runtime.block_on(run()) {
        tracing::error!(error = %e, "Sidecar exited with error");
        std::process::exit(1);
    }
}

async fn run() -> Result<(), AppError> {
    let config = AppConfig::load()?;
    let manager = Arc::new(RecoveryManager::from_config(&config).await?);

    let (tx, mut rx) = mpsc::unbounded_channel::<String>();
    let writer = tokio::spawn(async move {
        let mut stdout = tokio::io::stdout();
        while let Some(line) = rx.recv().await {
            if let Err(e) = write_line(&mut stdout, &line).await {
                tracing::error!(error = %e, "Failed to write response");
                break;
            }
        }
    });

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                tracing::info!("Interrupted, shutting down");
                break;
            }
            line = lines.next_line() => {
                let Some(line) = line? else { break };
                if line.trim().is_empty() {
                    continue;
                }
                let manager = manager.clone();
                let tx = tx.clone();
                tokio::spawn(async move {
                    let response = handle_line(&manager, &line).await;
                    match serde_json::to_string(&response) {
                        Ok(out) => {
                            let _ = tx.send(out);
                        }
                        Err(e) => tracing::error!(error = %e, "Failed to encode response"),
                    }
                });
            }
        }
    }

    drop(tx);
    manager.close().await?;
    let _ = writer.await;
    Ok(())
}

async fn write_line(stdout: &mut tokio::io::Stdout, line: &str) -> std::io::Result<()> {
    stdout.write_all(line.as_bytes()).await?;
    stdout.write_all(b"\n").await?;
    stdout.flush().await
}

async fn handle_line(manager: &RecoveryManager, line: &str) -> Response {
    let envelope: Envelope = match serde_json::from_str(line) {
        Ok(e) => e,
        Err(e) => {
            let id = serde_json::from_str::<Value>(line).ok().and_then(|v| v.get("id").cloned());
            return Response::from_result(id, Err(AppError::Validation(format!("Bad request: {e}"))));
        }
    };
    let result = dispatch(manager, envelope.request).await;
    Response::from_result(envelope.id, result)
}

async fn dispatch(manager: &RecoveryManager, request: Request) -> Result<Value, AppError> {
    match request {
        Request::Recover { task_id, execution_id, url, failure, page_content } => {
            let plan = manager
                .try_recover(&task_id, &execution_id, &url, &failure, page_content.as_deref())
                .await?;
            Ok(serde_json::to_value(plan)?)
        }
        Request::Outcome { task_id, success } => {
            let attempt = manager.complete_attempt(&task_id, success).await?;
            Ok(serde_json::to_value(attempt)?)
        }
        Request::Success { url, proxy_id } => {
            manager.record_fetch_success(&url, proxy_id.as_deref()).await;
            Ok(Value::Null)
        }
        Request::DomainStatus { domain } => Ok(serde_json::to_value(manager.get_domain_status(&domain).await?)?),
        Request::RefreshRules => Ok(serde_json::json!({ "rules": manager.refresh_rules().await? })),
        Request::Incidents { filter } => Ok(serde_json::to_value(manager.incidents().list(&filter)?)?),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parses_recover_request() {
        let raw = r#"{"id":7,"op":"recover","task_id":"t","execution_id":"e","url":"https://x.com","failure":{"status_code":429}}"#;
        let env: Envelope = serde_json::from_str(raw).unwrap();
        assert_eq!(env.id, Some(serde_json::json!(7)));
        match env.request {
            Request::Recover { failure, page_content, .. } => {
                assert_eq!(failure.status_code, Some(429));
                assert!(page_content.is_none());
            }
            other => panic!("unexpected request {other:?}"),
        }
    }

    #[test]
    fn test_parses_unit_and_filter_requests() {
        let env: Envelope = serde_json::from_str(r#"{"op":"refresh_rules"}"#).unwrap();
        assert!(matches!(env.request, Request::RefreshRules));
        let env: Envelope =
            serde_json::from_str(r#"{"op":"incidents","filter":{"status":"open","limit":5}}"#).unwrap();
        match env.request {
            Request::Incidents { filter } => assert_eq!(filter.limit, Some(5)),
            other => panic!("unexpected request {other:?}"),
        }
    }

    #[test]
    fn test_error_response_shape() {
        let res = Response::from_result(Some(serde_json::json!("a")), Err(AppError::NotFound("x".into())));
        let v = serde_json::to_value(&res).unwrap();
        assert_eq!(v["ok"], false);
        assert_eq!(v["error"]["kind"], "not_found");
        assert!(v.get("result").is_none());
    }
}
