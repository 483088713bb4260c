#![deny(unsafe_code)]

pub mod config;
pub mod sweeper;

use axum::body::Bytes;
use axum::extract::{Path, State};
use axum::http::{header, HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post, put};
use axum::{Json, Router};
use chrono::{DateTime, Utc};
use crate::config::{IssuerConfig, ServiceConfig};
use serde::{Deserialize, Serialize};
use stagepay_adapters::{HttpLinkIssuer, MockLinkIssuer};
use stagepay_core::{
    bootstrap_store, IssuerError, LinkIssuer, OverdueSweep, PaymentStage, ProjectId,
    ProjectPaymentSummary, StageDefinition, StageEngine, StageId, StagePayError, StoreError,
};
use std::sync::Arc;
use thiserror::Error;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;

const SERVICE_NAME: &str = "stagepay-service";

#[derive(Clone)]
pub struct ServiceState {
    pub engine: Arc<StageEngine>,
}

impl ServiceState {
    pub async fn bootstrap(config: &ServiceConfig) -> Result<Self, ServiceError> {
        let store = bootstrap_store(config.storage_config()).await?;
        let issuer = build_issuer(&config.issuer, config)?;
        let engine = StageEngine::new(store, issuer, config.engine_config());

        tracing::info!(
            storage = engine.storage_backend(),
            issuer = engine.issuer_id(),
            "StagePay engine ready"
        );
        Ok(Self::with_engine(engine))
    }

    pub fn with_engine(engine: StageEngine) -> Self {
        Self {
            engine: Arc::new(engine),
        }
    }
}

fn build_issuer(
    issuer: &IssuerConfig,
    config: &ServiceConfig,
) -> Result<Arc<dyn LinkIssuer>, ServiceError> {
    match issuer {
        IssuerConfig::Mock { base_url } => Ok(Arc::new(MockLinkIssuer::new(base_url.clone()))),
        IssuerConfig::Http {
            endpoint,
            bearer_token,
        } => {
            let issuer =
                HttpLinkIssuer::new(endpoint.clone(), bearer_token.clone(), config.issuer_timeout())?;
            Ok(Arc::new(issuer))
        }
    }
}

pub fn build_router(state: ServiceState) -> Router {
    Router::new()
        .route("/health", get(health))
        .route(
            "/projects/:project_id/payment-stages",
            get(list_stages).post(define_plan),
        )
        .route("/projects/:project_id/progress", put(update_progress))
        .route("/projects/:project_id/payment-summary", get(payment_summary))
        .route("/payment-stages/:stage_id", get(get_stage))
        .route(
            "/payment-stages/:stage_id/generate-link",
            post(generate_link),
        )
        .route("/payment-stages/:stage_id/complete", post(complete_stage))
        .route("/overdue-sweeps", post(sweep_overdue))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

pub fn with_cors(router: Router) -> Router {
    router.layer(
        CorsLayer::new()
            .allow_origin(Any)
            .allow_methods(Any)
            .allow_headers(Any),
    )
}

#[derive(Debug, Error)]
pub enum ServiceError {
    #[error("storage bootstrap failed: {0}")]
    Storage(#[from] StoreError),
    #[error("issuer setup failed: {0}")]
    Issuer(#[from] IssuerError),
}

#[derive(Debug, Error)]
pub enum ApiError {
    #[error("{message}")]
    Http {
        status: StatusCode,
        code: &'static str,
        message: String,
    },
    #[error(transparent)]
    Core(#[from] StagePayError),
}

impl ApiError {
    fn bad_request(message: impl Into<String>) -> Self {
        Self::Http {
            status: StatusCode::BAD_REQUEST,
            code: "invalid_input",
            message: message.into(),
        }
    }
}

fn status_for(err: &StagePayError) -> StatusCode {
    match err {
        StagePayError::NotFound(_) => StatusCode::NOT_FOUND,
        StagePayError::StageNotReady { .. }
        | StagePayError::InvalidTransition { .. }
        | StagePayError::AlreadyIssued(_)
        | StagePayError::PlanExists(_) => StatusCode::CONFLICT,
        StagePayError::InvalidPlan(_) | StagePayError::InvalidInput(_) => {
            StatusCode::BAD_REQUEST
        }
        StagePayError::LinkIssuanceFailed(_) => StatusCode::BAD_GATEWAY,
        StagePayError::Contention { .. } => StatusCode::SERVICE_UNAVAILABLE,
        StagePayError::Storage(_) => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, code, message) = match self {
            ApiError::Http {
                status,
                code,
                message,
            } => (status, code, message),
            ApiError::Core(err) => {
                let status = status_for(&err);
                if status.is_server_error() {
                    tracing::error!(error = %err, code = err.code(), "request failed");
                }
                (status, err.code(), err.to_string())
            }
        };

        (
            status,
            Json(serde_json::json!({ "error": message, "code": code })),
        )
            .into_response()
    }
}

fn parse_stage_id(raw: &str) -> Result<StageId, ApiError> {
    raw.parse()
        .map_err(|_| ApiError::bad_request(format!("invalid payment stage id '{}'", raw)))
}

#[derive(Debug, Clone, Serialize)]
struct HealthResponse {
    status: &'static str,
    service: &'static str,
    storage_backend: &'static str,
    issuer: &'static str,
}

async fn health(State(state): State<ServiceState>) -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok",
        service: SERVICE_NAME,
        storage_backend: state.engine.storage_backend(),
        issuer: state.engine.issuer_id(),
    })
}

async fn list_stages(
    Path(project_id): Path<String>,
    State(state): State<ServiceState>,
) -> Result<Json<Vec<PaymentStage>>, ApiError> {
    Ok(Json(
        state
            .engine
            .list_stages(&ProjectId::new(project_id))
            .await?,
    ))
}

#[derive(Debug, Clone, Deserialize)]
struct DefinePlanRequest {
    stages: Vec<StageDefinition>,
}

async fn define_plan(
    Path(project_id): Path<String>,
    State(state): State<ServiceState>,
    Json(request): Json<DefinePlanRequest>,
) -> Result<(StatusCode, Json<Vec<PaymentStage>>), ApiError> {
    let stages = state
        .engine
        .define_plan(&ProjectId::new(project_id), request.stages)
        .await?;
    Ok((StatusCode::CREATED, Json(stages)))
}

#[derive(Debug, Clone, Deserialize)]
struct ProgressRequest {
    progress: u16,
}

#[derive(Debug, Clone, Serialize)]
struct ProgressResponse {
    project_id: ProjectId,
    progress: u8,
    unlocked: Vec<PaymentStage>,
}

async fn update_progress(
    Path(project_id): Path<String>,
    State(state): State<ServiceState>,
    Json(request): Json<ProgressRequest>,
) -> Result<Json<ProgressResponse>, ApiError> {
    let progress = u8::try_from(request.progress)
        .ok()
        .filter(|progress| *progress <= 100)
        .ok_or_else(|| {
            ApiError::bad_request(format!(
                "progress {} is outside 0..=100",
                request.progress
            ))
        })?;

    let project_id = ProjectId::new(project_id);
    let unlocked = state
        .engine
        .update_project_progress(&project_id, progress)
        .await?;

    Ok(Json(ProgressResponse {
        project_id,
        progress,
        unlocked,
    }))
}

async fn payment_summary(
    Path(project_id): Path<String>,
    State(state): State<ServiceState>,
) -> Result<Json<ProjectPaymentSummary>, ApiError> {
    Ok(Json(
        state
            .engine
            .project_summary(&ProjectId::new(project_id))
            .await?,
    ))
}

async fn get_stage(
    Path(stage_id): Path<String>,
    State(state): State<ServiceState>,
) -> Result<Json<PaymentStage>, ApiError> {
    let stage_id = parse_stage_id(&stage_id)?;
    Ok(Json(state.engine.get_stage(&stage_id).await?))
}

async fn generate_link(
    Path(stage_id): Path<String>,
    State(state): State<ServiceState>,
) -> Result<Json<PaymentStage>, ApiError> {
    let stage_id = parse_stage_id(&stage_id)?;
    Ok(Json(state.engine.generate_payment_link(&stage_id).await?))
}

async fn complete_stage(
    Path(stage_id): Path<String>,
    State(state): State<ServiceState>,
) -> Result<Json<PaymentStage>, ApiError> {
    let stage_id = parse_stage_id(&stage_id)?;
    Ok(Json(state.engine.mark_as_paid(&stage_id).await?))
}

#[derive(Debug, Clone, Default, Deserialize)]
struct SweepRequest {
    #[serde(default)]
    now: Option<DateTime<Utc>>,
}

/// An empty body means "sweep now"; anything else must be a valid JSON request.
fn parse_sweep_request(headers: &HeaderMap, body: &[u8]) -> Result<SweepRequest, ApiError> {
    if body.iter().all(u8::is_ascii_whitespace) {
        return Ok(SweepRequest::default());
    }

    let is_json = headers
        .get(header::CONTENT_TYPE)
        .and_then(|value| value.to_str().ok())
        .and_then(|value| value.split(';').next())
        .map(|mime| mime.trim().eq_ignore_ascii_case("application/json"))
        .unwrap_or(false);
    if !is_json {
        return Err(ApiError::bad_request(
            "sweep request body must be sent as application/json",
        ));
    }

    serde_json::from_slice(body)
        .map_err(|e| ApiError::bad_request(format!("invalid sweep request: {e}")))
}

async fn sweep_overdue(
    State(state): State<ServiceState>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<Json<OverdueSweep>, ApiError> {
    let request = parse_sweep_request(&headers, &body)?;
    let now = request.now.unwrap_or_else(Utc::now);
    Ok(Json(state.engine.refresh_overdue_status(now).await?))
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::{to_bytes, Body};
    use axum::http::Request;
    use stagepay_adapters::AlwaysFailIssuer;
    use stagepay_core::{InMemoryStageStore, StageEngineConfig, StageStatus};
    use tower::ServiceExt;

    fn app_with(issuer: Arc<dyn LinkIssuer>) -> Router {
        let engine = StageEngine::new(
            Arc::new(InMemoryStageStore::new()),
            issuer,
            StageEngineConfig::default(),
        );
        build_router(ServiceState::with_engine(engine))
    }

    fn app() -> Router {
        app_with(Arc::new(MockLinkIssuer::default()))
    }

    async fn call(
        app: &Router,
        method: &str,
        uri: &str,
        body: Option<serde_json::Value>,
    ) -> (StatusCode, serde_json::Value) {
        let builder = Request::builder().method(method).uri(uri);
        let request = match body {
            Some(body) => builder
                .header("content-type", "application/json")
                .body(Body::from(body.to_string()))
                .unwrap(),
            None => builder.body(Body::empty()).unwrap(),
        };

        let response = app.clone().oneshot(request).await.unwrap();
        let status = response.status();
        let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        let value = if bytes.is_empty() {
            serde_json::Value::Null
        } else {
            serde_json::from_slice(&bytes).unwrap()
        };
        (status, value)
    }

    fn plan() -> serde_json::Value {
        serde_json::json!({
            "stages": [
                { "stage_name": "signing", "stage_percentage": "30", "amount": "3000.00", "required_progress": 0 },
                {
                    "stage_name": "structure",
                    "stage_percentage": "40",
                    "amount": "4000.00",
                    "required_progress": 50,
                    "due_date": "2024-03-01T00:00:00Z"
                },
                { "stage_name": "handover", "stage_percentage": "30", "amount": "3000.00", "required_progress": 100 }
            ]
        })
    }

    async fn with_plan(app: &Router) -> Vec<PaymentStage> {
        let (status, body) = call(app, "POST", "/projects/villa-9/payment-stages", Some(plan())).await;
        assert_eq!(status, StatusCode::CREATED);
        serde_json::from_value(body).unwrap()
    }

    #[tokio::test]
    async fn health_reports_backend() {
        let (status, body) = call(&app(), "GET", "/health", None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["service"], "stagepay-service");
        assert_eq!(body["storage_backend"], "memory");
        assert_eq!(body["issuer"], "mock");
    }

    #[tokio::test]
    async fn unknown_project_is_404_with_code() {
        let (status, body) = call(&app(), "GET", "/projects/ghost/payment-stages", None).await;
        assert_eq!(status, StatusCode::NOT_FOUND);
        assert_eq!(body["code"], "not_found");
        assert!(body["error"].as_str().unwrap().contains("ghost"));
    }

    #[tokio::test]
    async fn plan_is_listed_in_threshold_order() {
        let app = app();
        let created = with_plan(&app).await;
        assert_eq!(created[0].status, StageStatus::Available);

        let (status, body) = call(&app, "GET", "/projects/villa-9/payment-stages", None).await;
        assert_eq!(status, StatusCode::OK);
        let listed: Vec<PaymentStage> = serde_json::from_value(body).unwrap();
        let names: Vec<&str> = listed.iter().map(|s| s.stage_name.as_str()).collect();
        assert_eq!(names, vec!["signing", "structure", "handover"]);

        let (status, body) = call(&app, "POST", "/projects/villa-9/payment-stages", Some(plan())).await;
        assert_eq!(status, StatusCode::CONFLICT);
        assert_eq!(body["code"], "plan_exists");
    }

    #[tokio::test]
    async fn plan_not_summing_to_100_is_400() {
        let mut body = plan();
        body["stages"][0]["stage_percentage"] = serde_json::json!("10");
        let (status, body) = call(&app(), "POST", "/projects/p/payment-stages", Some(body)).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(body["code"], "invalid_plan");
    }

    #[tokio::test]
    async fn link_on_pending_stage_is_409_and_stage_unchanged() {
        let app = app();
        let stages = with_plan(&app).await;
        let uri = format!("/payment-stages/{}/generate-link", stages[1].id);

        let (status, body) = call(&app, "POST", &uri, None).await;
        assert_eq!(status, StatusCode::CONFLICT);
        assert_eq!(body["code"], "stage_not_ready");

        let (_, body) = call(&app, "GET", &format!("/payment-stages/{}", stages[1].id), None).await;
        assert_eq!(body["status"], "pending");
        assert!(body["payment_link"].is_null());
    }

    #[tokio::test]
    async fn progress_unlocks_then_link_and_complete() {
        let app = app();
        let stages = with_plan(&app).await;

        let (status, body) = call(
            &app,
            "PUT",
            "/projects/villa-9/progress",
            Some(serde_json::json!({ "progress": 60 })),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["unlocked"].as_array().unwrap().len(), 1);
        assert_eq!(body["unlocked"][0]["stage_name"], "structure");

        let (status, body) = call(
            &app,
            "POST",
            &format!("/payment-stages/{}/generate-link", stages[1].id),
            None,
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(
            body["payment_link"],
            format!("https://pay.local/checkout/{}", stages[1].id)
        );

        let complete = format!("/payment-stages/{}/complete", stages[1].id);
        let (status, body) = call(&app, "POST", &complete, None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["status"], "paid");
        assert!(body["paid_date"].is_string());

        let (status, body) = call(&app, "POST", &complete, None).await;
        assert_eq!(status, StatusCode::CONFLICT);
        assert_eq!(body["code"], "invalid_transition");
    }

    #[tokio::test]
    async fn progress_out_of_range_is_400() {
        let app = app();
        with_plan(&app).await;
        let (status, body) = call(
            &app,
            "PUT",
            "/projects/villa-9/progress",
            Some(serde_json::json!({ "progress": 140 })),
        )
        .await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(body["code"], "invalid_input");
    }

    #[tokio::test]
    async fn issuer_failure_is_502_and_retryable_later() {
        let app = app_with(Arc::new(AlwaysFailIssuer::unavailable("processor down")));
        let stages = with_plan(&app).await;

        let (status, body) = call(
            &app,
            "POST",
            &format!("/payment-stages/{}/generate-link", stages[0].id),
            None,
        )
        .await;
        assert_eq!(status, StatusCode::BAD_GATEWAY);
        assert_eq!(body["code"], "issuer_unavailable");

        let (_, body) = call(&app, "GET", &format!("/payment-stages/{}", stages[0].id), None).await;
        assert!(body["payment_link"].is_null());
        assert_eq!(body["status"], "available");
    }

    #[tokio::test]
    async fn malformed_and_unknown_stage_ids() {
        let app = app();
        let (status, body) = call(&app, "GET", "/payment-stages/not-a-uuid", None).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(body["code"], "invalid_input");

        let (status, _) = call(
            &app,
            "POST",
            &format!("/payment-stages/{}/complete", StageId::new()),
            None,
        )
        .await;
        assert_eq!(status, StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn sweep_marks_lapsed_stage_and_summary_reflects_it() {
        let app = app();
        let stages = with_plan(&app).await;
        call(
            &app,
            "PUT",
            "/projects/villa-9/progress",
            Some(serde_json::json!({ "progress": 50 })),
        )
        .await;

        let (status, body) = call(
            &app,
            "POST",
            "/overdue-sweeps",
            Some(serde_json::json!({ "now": "2024-04-01T00:00:00Z" })),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["marked_overdue"][0], stages[1].id.to_string());

        let (status, body) = call(&app, "GET", "/projects/villa-9/payment-summary", None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["overdue_count"], 1);
        assert_eq!(body["overdue_amount"], "4000.00");
        assert_eq!(body["next_payable_stage"], stages[0].id.to_string());
    }

    #[tokio::test]
    async fn sweep_without_body_uses_current_time() {
        let (status, body) = call(&app(), "POST", "/overdue-sweeps", None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["examined"], 0);
    }

    #[tokio::test]
    async fn malformed_sweep_request_is_400_and_sweeps_nothing() {
        let app = app();
        let stages = with_plan(&app).await;
        call(
            &app,
            "PUT",
            "/projects/villa-9/progress",
            Some(serde_json::json!({ "progress": 50 })),
        )
        .await;

        let (status, body) = call(
            &app,
            "POST",
            "/overdue-sweeps",
            Some(serde_json::json!({ "now": "not-a-date" })),
        )
        .await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(body["code"], "invalid_input");

        let untyped = Request::builder()
            .method("POST")
            .uri("/overdue-sweeps")
            .body(Body::from(r#"{"now":"2030-01-01T00:00:00Z"}"#))
            .unwrap();
        let response = app.clone().oneshot(untyped).await.unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);

        let (_, body) = call(&app, "GET", &format!("/payment-stages/{}", stages[1].id), None).await;
        assert_eq!(body["status"], "available");
    }
}
