use std::path::Path;
use std::sync::Arc;

use axum::extract::State;
use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::Json;
use serde::Serialize;

use crate::AppState;

// ---------------------------------------------------------------------------
// Response types
// ---------------------------------------------------------------------------

#[derive(Debug, Serialize)]
pub struct HealthResponse {
    pub status: HealthStatus,
    pub checks: HealthChecks,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum HealthStatus {
    Ok,
    Degraded,
    Unhealthy,
}

#[derive(Debug, Serialize)]
pub struct HealthChecks {
    pub database: CheckResult,
    pub repository_root: CheckResult,
}

#[derive(Debug, Serialize)]
pub struct CheckResult {
    pub ok: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub detail: Option<String>,
}

impl CheckResult {
    fn healthy() -> Self {
        Self {
            ok: true,
            detail: None,
        }
    }

    fn unhealthy(detail: impl Into<String>) -> Self {
        Self {
            ok: false,
            detail: Some(detail.into()),
        }
    }
}

// ---------------------------------------------------------------------------
// Individual checks
// ---------------------------------------------------------------------------

async fn check_database(state: &AppState) -> CheckResult {
    match state.db.ping().await {
        Ok(()) => CheckResult::healthy(),
        Err(e) => CheckResult::unhealthy(format!("ping failed: {e}")),
    }
}

async fn check_repository_root(root: &Path) -> CheckResult {
    match tokio::fs::metadata(root).await {
        Ok(meta) if meta.is_dir() => CheckResult::healthy(),
        Ok(_) => CheckResult::unhealthy(format!("{} is not a directory", root.display())),
        Err(e) => CheckResult::unhealthy(format!("{}: {e}", root.display())),
    }
}

fn aggregate_status(checks: &HealthChecks) -> HealthStatus {
    if !checks.database.ok {
        HealthStatus::Unhealthy
    } else if !checks.repository_root.ok {
        HealthStatus::Degraded
    } else {
        HealthStatus::Ok
    }
}

// ---------------------------------------------------------------------------
// Axum handler
// ---------------------------------------------------------------------------

/// `GET /healthz`. 200 on Ok/Degraded, 503 on Unhealthy.
pub async fn health_handler(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    let (database, repository_root) = tokio::join!(
        check_database(&state),
        check_repository_root(&state.config.repository.root),
    );

    let checks = HealthChecks {
        database,
        repository_root,
    };
    let status = aggregate_status(&checks);

    let http_status = match status {
        HealthStatus::Ok | HealthStatus::Degraded => StatusCode::OK,
        HealthStatus::Unhealthy => StatusCode::SERVICE_UNAVAILABLE,
    };

    (http_status, Json(HealthResponse { status, checks }))
}

#[cfg(test)]
mod tests {
    use axum::body::Body;
    use axum::http::Request;
    use http_body_util::BodyExt;
    use tower::ServiceExt;

    use super::*;
    use crate::config::Config;

    #[test]
    fn database_failure_is_unhealthy() {
        let checks = HealthChecks {
            database: CheckResult::unhealthy("down"),
            repository_root: CheckResult::healthy(),
        };
        assert_eq!(aggregate_status(&checks), HealthStatus::Unhealthy);

        let checks = HealthChecks {
            database: CheckResult::healthy(),
            repository_root: CheckResult::unhealthy("missing"),
        };
        assert_eq!(aggregate_status(&checks), HealthStatus::Degraded);
    }

    #[tokio::test]
    async fn healthz_reports_each_check() {
        let dir = tempfile::TempDir::new().unwrap();
        let mut config = Config::default();
        config.repository.root = dir.path().join("absent");
        let state = Arc::new(AppState::for_tests(config).await);

        let resp = crate::http::handler::create_router(state)
            .oneshot(Request::builder().uri("/healthz").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
        let body = resp.into_body().collect().await.unwrap().to_bytes();
        let json: serde_json::Value = serde_json::from_slice(&body).unwrap();
        assert_eq!(json["status"], "degraded");
        assert_eq!(json["checks"]["database"]["ok"], true);
        assert_eq!(json["checks"]["repository_root"]["ok"], false);
    }
}
