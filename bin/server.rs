// Records Aggregates - Read API Server
// Tenant dashboards and raw range queries over the aggregate structures

use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    response::{IntoResponse, Json, Response},
    routing::get,
    Router,
};
use records_aggregates::{
    classify, logging, tenant_summary, Engine, EngineConfig, FaultClass, KeyRange, RangeStats,
    TenantSummary,
};
use serde::{Deserialize, Serialize};
use std::sync::{Arc, Mutex};
use tower_http::cors::CorsLayer;
use tracing::{error, info};

/// Shared application state
#[derive(Clone)]
struct AppState {
    engine: Arc<Mutex<Engine>>,
}

/// API Response wrapper
#[derive(Serialize)]
struct ApiResponse<T> {
    success: bool,
    data: Option<T>,
    #[serde(skip_serializing_if = "Option::is_none")]
    error: Option<String>,
}

impl<T: Serialize> ApiResponse<T> {
    fn ok(data: T) -> Response {
        (
            StatusCode::OK,
            Json(Self {
                success: true,
                data: Some(data),
                error: None,
            }),
        )
            .into_response()
    }

    fn failed(status: StatusCode, message: String) -> Response {
        (
            status,
            Json(Self {
                success: false,
                data: None,
                error: Some(message),
            }),
        )
            .into_response()
    }
}

/// Validation faults are the caller's; everything else is ours
fn error_response<T: Serialize>(context: &str, err: anyhow::Error) -> Response {
    match classify(&err) {
        FaultClass::Validation => ApiResponse::<T>::failed(StatusCode::BAD_REQUEST, format!("{:#}", err)),
        _ => {
            error!(error = %format!("{:#}", err), "{}", context);
            ApiResponse::<T>::failed(StatusCode::INTERNAL_SERVER_ERROR, format!("{:#}", err))
        }
    }
}

/// Metric query parameters: ?bucket=paid&from=<ms>&until=<ms>
#[derive(Deserialize)]
struct MetricQuery {
    bucket: Option<String>,
    from: Option<i64>,
    until: Option<i64>,
}

#[derive(Serialize)]
struct MetricResponse {
    tenant_id: String,
    metric: String,
    bucket: Option<String>,
    count: u64,
    sum: i64,
}

// ============================================================================
// API Handlers
// ============================================================================

/// GET /api/health - Health check
async fn health_check() -> impl IntoResponse {
    ApiResponse::ok("OK")
}

/// GET /api/tenants/:tenant/summary - Dashboard figures
async fn get_summary(State(state): State<AppState>, Path(tenant): Path<String>) -> Response {
    let engine = match state.engine.lock() {
        Ok(engine) => engine,
        Err(_) => {
            return ApiResponse::<TenantSummary>::failed(
                StatusCode::INTERNAL_SERVER_ERROR,
                "engine lock poisoned".to_string(),
            )
        }
    };

    match tenant_summary(&engine, &tenant, chrono::Utc::now()) {
        Ok(summary) => ApiResponse::ok(summary),
        Err(e) => error_response::<TenantSummary>("Error building summary", e),
    }
}

/// GET /api/tenants/:tenant/metrics/:metric - One range query
async fn get_metric(
    State(state): State<AppState>,
    Path((tenant, metric)): Path<(String, String)>,
    Query(query): Query<MetricQuery>,
) -> Response {
    let mut range = KeyRange::tenant(tenant.clone());
    if let Some(bucket) = &query.bucket {
        range = range.bucket(bucket.clone());
    }
    if let Some(from) = query.from {
        range = range.since(from);
    }
    if let Some(until) = query.until {
        range = range.until(until);
    }

    let engine = match state.engine.lock() {
        Ok(engine) => engine,
        Err(_) => {
            return ApiResponse::<MetricResponse>::failed(
                StatusCode::INTERNAL_SERVER_ERROR,
                "engine lock poisoned".to_string(),
            )
        }
    };

    match engine.range(&metric, &range) {
        Ok(RangeStats { count, sum }) => ApiResponse::ok(MetricResponse {
            tenant_id: tenant,
            metric,
            bucket: query.bucket,
            count,
            sum,
        }),
        Err(e) => error_response::<MetricResponse>("Error querying metric", e),
    }
}

// ============================================================================
// Main Server
// ============================================================================

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let config = EngineConfig::from_env()?;
    logging::init(&config.log_filter);

    println!("🌐 Records Aggregates - Read API");
    println!("━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━");

    if !config.database_path.exists() {
        eprintln!("❌ Database not found at {:?}", config.database_path);
        eprintln!("   Run: records-aggregates init");
        std::process::exit(1);
    }

    let db_path = config.database_path.clone();
    let engine = Engine::open(config)?;
    println!("✓ Database opened: {:?}", db_path);

    // Create shared state
    let state = AppState {
        engine: Arc::new(Mutex::new(engine)),
    };

    // Build API routes
    let api_routes = Router::new()
        .route("/health", get(health_check))
        .route("/tenants/:tenant/summary", get(get_summary))
        .route("/tenants/:tenant/metrics/:metric", get(get_metric))
        .with_state(state);

    let app = Router::new()
        .nest("/api", api_routes)
        .layer(CorsLayer::permissive());

    // Start server
    let addr = std::env::var("RECORDS_AGGREGATES_ADDR").unwrap_or_else(|_| "0.0.0.0:3000".to_string());
    let listener = tokio::net::TcpListener::bind(&addr).await?;

    info!(addr = %addr, "read API listening");
    println!("\n🚀 Server running on http://{}", addr);
    println!("   API: http://{}/api/health", addr);
    println!("\n   Press Ctrl+C to stop\n");

    axum::serve(listener, app).await?;
    Ok(())
}
