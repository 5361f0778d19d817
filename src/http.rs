use std::sync::Arc;
use std::time::Instant;

use axum::extract::rejection::{JsonRejection, QueryRejection};
use axum::extract::{MatchedPath, Path, Query, Request, State};
use axum::http::{StatusCode, header};
use axum::middleware::{self, Next};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post, put};
use axum::{Extension, Json, Router};
use serde::{Deserialize, Serialize};
use tower::limit::ConcurrencyLimitLayer;
use tower_http::trace::TraceLayer;
use tracing::{info, warn};
use ulid::Ulid;

use crate::auth::{Principal, TokenStore, bearer_token};
use crate::model::{EnvironmentInfo, Reservation};
use crate::observability;
use crate::service::{
    CreateReservationRequest, ReservationService, ServiceError, UpdateReservationRequest,
    format_timestamp,
};

#[derive(Clone)]
pub struct AppState {
    pub service: ReservationService,
    pub tokens: Arc<dyn TokenStore>,
}

impl AppState {
    pub fn new(service: ReservationService, tokens: Arc<dyn TokenStore>) -> Self {
        Self { service, tokens }
    }
}

// ── Wire shapes ──────────────────────────────────────────────────

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct EnvironmentView {
    pub id: Ulid,
    pub org_id: String,
    pub owner: String,
    pub note: Option<String>,
    pub last_changed: String,
}

impl From<EnvironmentInfo> for EnvironmentView {
    fn from(e: EnvironmentInfo) -> Self {
        Self {
            id: e.id,
            org_id: e.org_id,
            owner: e.owner,
            note: e.note,
            last_changed: format_timestamp(e.last_changed),
        }
    }
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ReservationView {
    pub id: Ulid,
    pub environment_id: Ulid,
    pub begin: String,
    pub end: String,
    pub note: Option<String>,
    pub by_user: String,
    pub last_changed: String,
}

impl From<Reservation> for ReservationView {
    fn from(r: Reservation) -> Self {
        Self {
            id: r.id,
            environment_id: r.environment_id,
            begin: format_timestamp(r.range.begin),
            end: format_timestamp(r.range.end),
            note: r.note,
            by_user: r.by_user,
            last_changed: format_timestamp(r.last_changed),
        }
    }
}

#[derive(Debug, Default, Deserialize)]
pub struct SinceQuery {
    pub since: Option<String>,
}

// ── Errors ───────────────────────────────────────────────────────

#[derive(Debug)]
pub struct ApiError(pub ServiceError);

impl From<ServiceError> for ApiError {
    fn from(e: ServiceError) -> Self {
        ApiError(e)
    }
}

impl From<JsonRejection> for ApiError {
    fn from(e: JsonRejection) -> Self {
        ApiError(ServiceError::InvalidInput(e.body_text()))
    }
}

impl From<QueryRejection> for ApiError {
    fn from(e: QueryRejection) -> Self {
        ApiError(ServiceError::InvalidInput(e.body_text()))
    }
}

#[derive(Serialize)]
struct ErrorBody {
    error: &'static str,
    message: String,
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, error, message) = match self.0 {
            ServiceError::InvalidInput(m) => (StatusCode::BAD_REQUEST, "InvalidInput", m),
            ServiceError::NotFound(m) => (StatusCode::NOT_FOUND, "NotFound", m),
            ServiceError::Conflict(m) => (StatusCode::CONFLICT, "Conflict", m),
            ServiceError::Unauthorized => {
                return (StatusCode::UNAUTHORIZED, [(header::WWW_AUTHENTICATE, "Bearer")])
                    .into_response();
            }
            ServiceError::Internal(detail) => {
                tracing::error!("internal error: {detail}");
                (
                    StatusCode::INTERNAL_SERVER_ERROR,
                    "Internal",
                    "internal server error".to_string(),
                )
            }
        };
        (status, Json(ErrorBody { error, message })).into_response()
    }
}

type ApiResult<T> = Result<Json<T>, ApiError>;

// ── Handlers ─────────────────────────────────────────────────────

async fn health() -> Json<serde_json::Value> {
    Json(serde_json::json!({ "status": "ok" }))
}

async fn list_environments(
    State(state): State<AppState>,
    query: Result<Query<SinceQuery>, QueryRejection>,
) -> ApiResult<Vec<EnvironmentView>> {
    let Query(query) = query?;
    let envs = state.service.list_environments(query.since.as_deref()).await?;
    Ok(Json(envs.into_iter().map(EnvironmentView::from).collect()))
}

async fn list_reservations(
    State(state): State<AppState>,
    query: Result<Query<SinceQuery>, QueryRejection>,
) -> ApiResult<Vec<ReservationView>> {
    let Query(query) = query?;
    let reservations = state.service.list_reservations(query.since.as_deref()).await?;
    Ok(Json(reservations.into_iter().map(ReservationView::from).collect()))
}

async fn create_reservation(
    State(state): State<AppState>,
    Extension(principal): Extension<Principal>,
    Path(environment_id): Path<String>,
    body: Result<Json<CreateReservationRequest>, JsonRejection>,
) -> ApiResult<ReservationView> {
    let Json(request) = body?;
    let created = state
        .service
        .create_reservation(&environment_id, request)
        .await?;
    info!(
        principal = %principal.user,
        reservation = %created.id,
        environment = %created.environment_id,
        "reservation created"
    );
    Ok(Json(created.into()))
}

async fn update_reservation(
    State(state): State<AppState>,
    Extension(principal): Extension<Principal>,
    Path((environment_id, reservation_id)): Path<(String, String)>,
    body: Result<Json<UpdateReservationRequest>, JsonRejection>,
) -> ApiResult<ReservationView> {
    let Json(request) = body?;
    let updated = state
        .service
        .update_reservation(&environment_id, &reservation_id, request)
        .await?;
    info!(
        principal = %principal.user,
        reservation = %updated.id,
        environment = %updated.environment_id,
        "reservation updated"
    );
    Ok(Json(updated.into()))
}

// ── Middleware ───────────────────────────────────────────────────

/// Rejects requests without a known bearer token; attaches the `Principal` otherwise.
async fn require_bearer(State(state): State<AppState>, mut req: Request, next: Next) -> Response {
    let token = bearer_token(req.headers()).map(str::to_owned);
    let principal = match token {
        Some(token) => state.tokens.authenticate(&token).await,
        None => Ok(None),
    };
    match principal {
        Ok(Some(principal)) => {
            req.extensions_mut().insert(principal);
            next.run(req).await
        }
        Ok(None) => {
            metrics::counter!(observability::AUTH_FAILURES_TOTAL).increment(1);
            warn!("rejected {} {}: missing or unknown bearer token", req.method(), req.uri().path());
            ApiError(ServiceError::Unauthorized).into_response()
        }
        Err(e) => ApiError(e).into_response(),
    }
}

async fn track_metrics(req: Request, next: Next) -> Response {
    let route = req
        .extensions()
        .get::<MatchedPath>()
        .map(|p| p.as_str().to_owned())
        .unwrap_or_else(|| "unmatched".to_owned());
    let start = Instant::now();
    let response = next.run(req).await;

    let status = observability::status_label(response.status().as_u16());
    metrics::counter!(observability::HTTP_REQUESTS_TOTAL, "route" => route.clone(), "status" => status)
        .increment(1);
    metrics::histogram!(observability::HTTP_REQUEST_DURATION_SECONDS, "route" => route)
        .record(start.elapsed().as_secs_f64());
    response
}

/// The full HTTP surface. `max_in_flight` bounds concurrently served requests.
pub fn router(state: AppState, max_in_flight: usize) -> Router {
    let api = Router::new()
        .route("/api/v0/environment", get(list_environments))
        .route("/api/v0/reservation", get(list_reservations))
        .route(
            "/api/v0/environment/{environment_id}/add-reservation",
            post(create_reservation),
        )
        .route(
            "/api/v0/environment/{environment_id}/reservation/{reservation_id}",
            put(update_reservation),
        )
        .route_layer(middleware::from_fn_with_state(state.clone(), require_bearer));

    Router::new()
        .route("/health", get(health))
        .merge(api)
        .route_layer(middleware::from_fn(track_metrics))
        .layer(TraceLayer::new_for_http())
        .layer(ConcurrencyLimitLayer::new(max_in_flight.max(1)))
        .with_state(state)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::auth::StaticTokenStore;
    use crate::engine::Engine;
    use axum::body::Body;
    use axum::http::Request;
    use http_body_util::BodyExt;
    use std::collections::HashMap;
    use tower::ServiceExt;

    #[tokio::test]
    async fn wal_failure_is_opaque_internal_error() {
        let dir = std::env::temp_dir().join("envbook_test_http");
        std::fs::create_dir_all(&dir).unwrap();
        let path = dir.join("wal_failure.wal");
        let _ = std::fs::remove_file(&path);

        let mut engine = Engine::new(path).unwrap();
        let env = Ulid::new();
        engine
            .create_environment(env, "org".into(), "ops".into(), None)
            .await
            .unwrap();
        engine.fail_wal_writes();
        let engine = Arc::new(engine);

        let tokens = StaticTokenStore::new(HashMap::from([("t".to_string(), "alice".to_string())]));
        let app = router(
            AppState::new(ReservationService::new(engine.clone()), Arc::new(tokens)),
            8,
        );
        let req = Request::post(format!("/api/v0/environment/{env}/add-reservation"))
            .header(header::AUTHORIZATION, "Bearer t")
            .header(header::CONTENT_TYPE, "application/json")
            .body(Body::from(
                r#"{"begin":"2024-01-01T10:00:00Z","end":"2024-01-01T11:00:00Z","user":"alice"}"#,
            ))
            .unwrap();

        let response = app.oneshot(req).await.unwrap();
        assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);
        let bytes = response.into_body().collect().await.unwrap().to_bytes();
        let body: serde_json::Value = serde_json::from_slice(&bytes).unwrap();
        assert_eq!(
            body,
            serde_json::json!({ "error": "Internal", "message": "internal server error" })
        );
        assert!(engine.list_reservations(None).await.is_empty());
    }
}
