//! REST endpoints for producers, workers, and operators.

use std::sync::Arc;
use std::time::Duration;

use axum::{
    Json, Router,
    extract::{Path, Query, State},
    http::{HeaderMap, StatusCode, header},
    response::{IntoResponse, Response},
    routing::{get, post},
};
use secrecy::{ExposeSecret, SecretString};
use serde::{Deserialize, Serialize};
use tower_http::cors::CorsLayer;
use tracing::error;
use uuid::Uuid;

use crate::dispatch::Dispatcher;
use crate::error::{ConfigError, DispatchError};
use crate::jobs::{AuthorRole, ClaimedJob, Outcome};

/// Header naming the principal that producer-side limiters are keyed on.
pub const CALLER_KEY_HEADER: &str = "x-caller-key";

/// Longest a `/api/work/wait` call may hold the connection.
const MAX_WAIT: Duration = Duration::from_secs(60);

/// Application state shared across handlers.
#[derive(Clone)]
pub struct ApiState {
    pub dispatcher: Arc<Dispatcher>,
}

/// Build the Axum router with all dispatch routes.
pub fn dispatch_routes(dispatcher: Arc<Dispatcher>) -> Router {
    let state = ApiState { dispatcher };

    Router::new()
        .route("/health", get(health))
        .route("/api/outputs", post(create_output))
        .route("/api/outputs/{id}", get(get_output))
        .route("/api/workers", post(register_worker))
        .route("/api/workers/rotate", post(rotate_secret))
        .route("/api/jobs", post(enqueue_job))
        .route("/api/jobs/claim", post(claim_job))
        .route("/api/jobs/{id}", get(get_job))
        .route("/api/jobs/{id}/heartbeat", post(heartbeat))
        .route("/api/jobs/{id}/partial", post(submit_partial))
        .route("/api/jobs/{id}/final", post(submit_final))
        .route("/api/work", get(is_there_work))
        .route("/api/work/wait", get(wait_for_work))
        .route("/api/rate-limits/{name}/{key}", get(check_rate_limit))
        .route("/api/admin/sweep", post(sweep))
        .layer(CorsLayer::permissive())
        .with_state(state)
}

// ── Wire types ──────────────────────────────────────────────────────────

#[derive(Debug, Serialize, Deserialize)]
pub struct CreateOutputRequest {
    pub role: AuthorRole,
    #[serde(default)]
    pub content: String,
}

#[derive(Debug, Default, Serialize, Deserialize)]
pub struct RegisterRequest {
    #[serde(default)]
    pub display_name: Option<String>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct RegisterResponse {
    pub worker_id: Uuid,
    pub api_key: String,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct RotateResponse {
    pub api_key: String,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct EnqueueRequest {
    pub target_output_id: Uuid,
    #[serde(default)]
    pub wants_streaming: bool,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct EnqueueResponse {
    pub job_id: Uuid,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct ClaimResponse {
    pub job: Option<ClaimedJob>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct PartialRequest {
    pub chunk: String,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct FinalRequest {
    #[serde(default)]
    pub chunk: String,
    pub outcome: Outcome,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct FinalResponse {
    /// The worker's next job, claimed on its behalf.
    pub next: Option<ClaimedJob>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct WorkResponse {
    pub work: bool,
}

#[derive(Debug, Deserialize)]
pub struct WaitQuery {
    pub timeout_ms: Option<u64>,
}

// ── Errors ──────────────────────────────────────────────────────────────

/// Handler error, rendered as `{"error": ...}` with a status per kind.
#[derive(Debug)]
pub enum ApiError {
    BadRequest(String),
    Dispatch(DispatchError),
}

impl From<DispatchError> for ApiError {
    fn from(e: DispatchError) -> Self {
        Self::Dispatch(e)
    }
}

/// HTTP status for a dispatch error.
pub fn status_for(err: &DispatchError) -> StatusCode {
    match err {
        DispatchError::NotFound { .. } => StatusCode::NOT_FOUND,
        DispatchError::PreconditionFailed(_) => StatusCode::CONFLICT,
        DispatchError::RateLimited { .. } => StatusCode::TOO_MANY_REQUESTS,
        DispatchError::ExhaustedRetries { .. } => StatusCode::GONE,
        DispatchError::AuthenticationFailed => StatusCode::UNAUTHORIZED,
        DispatchError::Config(ConfigError::UnknownLimiter(_)) => StatusCode::NOT_FOUND,
        DispatchError::Config(ConfigError::InvalidValue { .. }) => StatusCode::BAD_REQUEST,
        DispatchError::Database(_) => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        match self {
            Self::BadRequest(message) => (
                StatusCode::BAD_REQUEST,
                Json(serde_json::json!({"error": message})),
            )
                .into_response(),
            Self::Dispatch(err) => {
                let status = status_for(&err);
                if status.is_server_error() {
                    error!(error = %err, "Request failed");
                }
                let body = match &err {
                    DispatchError::RateLimited { retry_at, .. } => {
                        serde_json::json!({"error": err.to_string(), "retry_at": retry_at})
                    }
                    _ => serde_json::json!({"error": err.to_string()}),
                };
                (status, Json(body)).into_response()
            }
        }
    }
}

type ApiResult<T> = Result<T, ApiError>;

fn bearer(headers: &HeaderMap) -> ApiResult<SecretString> {
    headers
        .get(header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Bearer "))
        .map(|token| SecretString::from(token.trim().to_string()))
        .ok_or(ApiError::Dispatch(DispatchError::AuthenticationFailed))
}

fn caller_key(headers: &HeaderMap) -> ApiResult<String> {
    headers
        .get(CALLER_KEY_HEADER)
        .and_then(|v| v.to_str().ok())
        .map(str::trim)
        .filter(|v| !v.is_empty())
        .map(str::to_string)
        .ok_or_else(|| ApiError::BadRequest(format!("Missing {CALLER_KEY_HEADER} header")))
}

fn parse_id(raw: &str, what: &str) -> ApiResult<Uuid> {
    Uuid::parse_str(raw).map_err(|_| ApiError::BadRequest(format!("Invalid {what} ID")))
}

// ── Health ──────────────────────────────────────────────────────────────

async fn health() -> impl IntoResponse {
    Json(serde_json::json!({
        "status": "ok",
        "service": "llm-dispatch"
    }))
}

// ── Producer ────────────────────────────────────────────────────────────

async fn create_output(
    State(state): State<ApiState>,
    Json(body): Json<CreateOutputRequest>,
) -> ApiResult<impl IntoResponse> {
    let output = state.dispatcher.create_output(body.role, body.content).await?;
    Ok((StatusCode::CREATED, Json(output)))
}

async fn get_output(
    State(state): State<ApiState>,
    Path(id): Path<String>,
) -> ApiResult<impl IntoResponse> {
    let output = state.dispatcher.get_output(parse_id(&id, "output")?).await?;
    Ok(Json(output))
}

async fn enqueue_job(
    State(state): State<ApiState>,
    headers: HeaderMap,
    Json(body): Json<EnqueueRequest>,
) -> ApiResult<impl IntoResponse> {
    let caller = caller_key(&headers)?;
    let job_id = state
        .dispatcher
        .enqueue(&caller, body.target_output_id, body.wants_streaming)
        .await?;
    Ok((StatusCode::CREATED, Json(EnqueueResponse { job_id })))
}

async fn get_job(
    State(state): State<ApiState>,
    Path(id): Path<String>,
) -> ApiResult<impl IntoResponse> {
    let job = state.dispatcher.get_job(parse_id(&id, "job")?).await?;
    Ok(Json(job))
}

// ── Workers ─────────────────────────────────────────────────────────────

async fn register_worker(
    State(state): State<ApiState>,
    headers: HeaderMap,
    Json(body): Json<RegisterRequest>,
) -> ApiResult<impl IntoResponse> {
    let caller = caller_key(&headers)?;
    let registration = state.dispatcher.register(&caller, body.display_name).await?;
    Ok((
        StatusCode::CREATED,
        Json(RegisterResponse {
            worker_id: registration.worker_id,
            api_key: registration.api_key.expose_secret().to_string(),
        }),
    ))
}

async fn rotate_secret(
    State(state): State<ApiState>,
    headers: HeaderMap,
) -> ApiResult<impl IntoResponse> {
    let current = bearer(&headers)?;
    let fresh = state.dispatcher.rotate_secret(&current).await?;
    Ok(Json(RotateResponse {
        api_key: fresh.expose_secret().to_string(),
    }))
}

async fn claim_job(
    State(state): State<ApiState>,
    headers: HeaderMap,
) -> ApiResult<impl IntoResponse> {
    let key = bearer(&headers)?;
    let job = state.dispatcher.claim(&key).await?;
    Ok(Json(ClaimResponse { job }))
}

async fn heartbeat(
    State(state): State<ApiState>,
    headers: HeaderMap,
    Path(id): Path<String>,
) -> ApiResult<impl IntoResponse> {
    let key = bearer(&headers)?;
    state.dispatcher.heartbeat(&key, parse_id(&id, "job")?).await?;
    Ok(Json(serde_json::json!({"status": "ok"})))
}

async fn submit_partial(
    State(state): State<ApiState>,
    headers: HeaderMap,
    Path(id): Path<String>,
    Json(body): Json<PartialRequest>,
) -> ApiResult<impl IntoResponse> {
    let key = bearer(&headers)?;
    state
        .dispatcher
        .submit_partial(&key, parse_id(&id, "job")?, &body.chunk)
        .await?;
    Ok(Json(serde_json::json!({"status": "ok"})))
}

async fn submit_final(
    State(state): State<ApiState>,
    headers: HeaderMap,
    Path(id): Path<String>,
    Json(body): Json<FinalRequest>,
) -> ApiResult<impl IntoResponse> {
    let key = bearer(&headers)?;
    let next = state
        .dispatcher
        .submit_final(&key, parse_id(&id, "job")?, &body.chunk, body.outcome)
        .await?;
    Ok(Json(FinalResponse { next }))
}

async fn is_there_work(State(state): State<ApiState>) -> ApiResult<impl IntoResponse> {
    let work = state.dispatcher.is_there_work().await?;
    Ok(Json(WorkResponse { work }))
}

async fn wait_for_work(
    State(state): State<ApiState>,
    Query(query): Query<WaitQuery>,
) -> ApiResult<impl IntoResponse> {
    let timeout = query
        .timeout_ms
        .map(Duration::from_millis)
        .unwrap_or(MAX_WAIT / 2)
        .min(MAX_WAIT);
    let work = tokio::time::timeout(timeout, state.dispatcher.wait_for_work())
        .await
        .is_ok();
    Ok(Json(WorkResponse { work }))
}

// ── Operations ──────────────────────────────────────────────────────────

async fn check_rate_limit(
    State(state): State<ApiState>,
    Path((name, key)): Path<(String, String)>,
) -> ApiResult<impl IntoResponse> {
    let decision = state.dispatcher.check_rate_limit(&name, &key).await?;
    Ok(Json(decision))
}

async fn sweep(State(state): State<ApiState>) -> ApiResult<impl IntoResponse> {
    let report = state.dispatcher.sweep().await?;
    Ok(Json(report))
}

#[cfg(test)]
mod tests {
    use axum::body::Body;
    use axum::http::Request;
    use tower::ServiceExt;

    use super::*;
    use crate::config::DispatchConfig;
    use crate::store::{LibSqlBackend, Store};

    async fn app() -> (Router, Arc<Dispatcher>) {
        let store: Arc<dyn Store> = Arc::new(LibSqlBackend::new_memory().await.unwrap());
        let dispatcher = Arc::new(
            Dispatcher::new(store, DispatchConfig::default())
                .await
                .unwrap(),
        );
        (dispatch_routes(Arc::clone(&dispatcher)), dispatcher)
    }

    async fn body_json(response: Response) -> serde_json::Value {
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        serde_json::from_slice(&bytes).unwrap()
    }

    fn post_json(uri: &str, body: serde_json::Value) -> Request<Body> {
        Request::post(uri)
            .header(header::CONTENT_TYPE, "application/json")
            .header(CALLER_KEY_HEADER, "tests")
            .body(Body::from(body.to_string()))
            .unwrap()
    }

    #[test]
    fn error_status_mapping() {
        assert_eq!(
            status_for(&DispatchError::not_found("job", "x")),
            StatusCode::NOT_FOUND
        );
        assert_eq!(
            status_for(&DispatchError::precondition("lost")),
            StatusCode::CONFLICT
        );
        assert_eq!(
            status_for(&DispatchError::RateLimited {
                name: "enqueue_job".into(),
                retry_at: chrono::Utc::now(),
            }),
            StatusCode::TOO_MANY_REQUESTS
        );
        assert_eq!(
            status_for(&DispatchError::ExhaustedRetries {
                job_id: Uuid::new_v4(),
                attempts: 4,
            }),
            StatusCode::GONE
        );
        assert_eq!(
            status_for(&DispatchError::AuthenticationFailed),
            StatusCode::UNAUTHORIZED
        );
    }

    #[tokio::test]
    async fn health_ok() {
        let (app, _) = app().await;
        let response = app
            .oneshot(Request::get("/health").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(body_json(response).await["status"], "ok");
    }

    #[tokio::test]
    async fn claim_without_bearer_is_unauthorized() {
        let (app, _) = app().await;
        let response = app
            .oneshot(Request::post("/api/jobs/claim").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
    }

    #[tokio::test]
    async fn enqueue_requires_caller_key() {
        let (app, dispatcher) = app().await;
        let output = dispatcher
            .create_output(AuthorRole::Assistant, "")
            .await
            .unwrap();
        let request = Request::post("/api/jobs")
            .header(header::CONTENT_TYPE, "application/json")
            .body(Body::from(
                serde_json::json!({"target_output_id": output.id}).to_string(),
            ))
            .unwrap();
        let response = app.oneshot(request).await.unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn enqueue_rate_limit_returns_retry_at() {
        let (app, dispatcher) = app().await;
        let output = dispatcher
            .create_output(AuthorRole::Assistant, "")
            .await
            .unwrap();
        let body = serde_json::json!({"target_output_id": output.id});

        for _ in 0..3 {
            let response = app
                .clone()
                .oneshot(post_json("/api/jobs", body.clone()))
                .await
                .unwrap();
            assert_eq!(response.status(), StatusCode::CREATED);
        }
        let response = app.oneshot(post_json("/api/jobs", body)).await.unwrap();
        assert_eq!(response.status(), StatusCode::TOO_MANY_REQUESTS);
        assert!(body_json(response).await["retry_at"].is_string());
    }

    #[tokio::test]
    async fn bad_job_id_is_bad_request() {
        let (app, _) = app().await;
        let response = app
            .oneshot(Request::get("/api/jobs/not-a-uuid").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn unknown_limiter_is_not_found() {
        let (app, _) = app().await;
        let response = app
            .oneshot(
                Request::get("/api/rate-limits/nope/anyone")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn wait_times_out_without_work() {
        let (app, _) = app().await;
        let response = app
            .oneshot(
                Request::get("/api/work/wait?timeout_ms=20")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(body_json(response).await["work"], false);
    }
}
