use axum::extract::State;
use axum::http::StatusCode;
use axum::Json;
use serde::Serialize;

use crate::app_state::AppState;
use crate::models::stats::PipelineStats;

#[derive(Serialize)]
pub struct HealthResponse {
    pub status: String,
    pub version: String,
    pub checks: HealthChecks,
    pub pipeline: PipelineStats,
}

#[derive(Serialize)]
pub struct HealthChecks {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub database: Option<ComponentHealth>,
    pub endpoints: ComponentHealth,
}

#[derive(Serialize)]
pub struct ComponentHealth {
    pub status: String,
    pub latency_ms: Option<u64>,
}

/// GET /health: pipeline counters plus database and endpoint health.
pub async fn health_check(State(state): State<AppState>) -> (StatusCode, Json<HealthResponse>) {
    let db_check = match &state.db {
        Some(pool) => {
            let start = std::time::Instant::now();
            Some(match sqlx::query("SELECT 1").execute(pool).await {
                Ok(_) => ComponentHealth {
                    status: "ok".to_string(),
                    latency_ms: Some(start.elapsed().as_millis() as u64),
                },
                Err(_) => ComponentHealth {
                    status: "error".to_string(),
                    latency_ms: None,
                },
            })
        }
        None => None,
    };

    let stats = state.pipeline.stats();
    let endpoints_check = ComponentHealth {
        status: if stats.all_endpoints_healthy() { "ok" } else { "degraded" }.to_string(),
        latency_ms: None,
    };

    let all_healthy = stats.running
        && endpoints_check.status == "ok"
        && db_check.as_ref().map_or(true, |c| c.status == "ok");
    let status_code = if all_healthy {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    };

    let response = HealthResponse {
        status: if all_healthy {
            "ok".to_string()
        } else {
            "degraded".to_string()
        },
        version: env!("CARGO_PKG_VERSION").to_string(),
        checks: HealthChecks {
            database: db_check,
            endpoints: endpoints_check,
        },
        pipeline: stats,
    };

    (status_code, Json(response))
}
