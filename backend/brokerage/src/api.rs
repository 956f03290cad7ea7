//! Axum REST API handlers.
//!
//! Every action answers with the same envelope:
//!
//! ```json
//! { "success": true,  "data": { … }, "warning": "…" }
//! { "success": false, "error": { "kind": "market_closed", "message": "…" } }
//! ```

use std::sync::Arc;

use axum::{
    extract::{rejection::JsonRejection, Path, State},
    http::{HeaderMap, StatusCode},
    response::{IntoResponse, Response},
    routing::{delete, get, post},
    Json, Router,
};
use serde::{Deserialize, Serialize};

use crate::engine::{Engine, Outcome};
use crate::errors::{BrokerageError, ErrorKind, Result};
use crate::models::{Listing, NewListing, NewProject, PaymentConfirmation};
use crate::principal::{Principal, PrincipalResolver};
use crate::window::WindowStatus;

#[derive(Clone)]
pub struct ApiState {
    pub engine: Arc<Engine>,
    pub resolver: Arc<dyn PrincipalResolver>,
}

pub fn router(state: Arc<ApiState>) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/market/status", get(market_status))
        .route("/projects", post(submit_project).get(list_projects))
        .route("/projects/:id", get(get_project))
        .route("/projects/:id/payments", post(confirm_project_payment))
        .route("/projects/:id/assign", post(assign_agent))
        .route("/projects/:id/complete", post(complete_project))
        .route("/listings", post(list_marketplace_product).get(list_listings))
        .route("/listings/:id", delete(remove_listing))
        .route("/listings/:id/purchases", post(confirm_marketplace_purchase))
        .route("/analytics", get(get_analytics))
        .with_state(state)
}

// ─────────────────────────────────────────────────────────
// Request / response shapes
// ─────────────────────────────────────────────────────────

#[derive(Debug, Serialize)]
pub struct ActionResponse<T> {
    pub success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<T>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<ErrorBody>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub warning: Option<String>,
    #[serde(skip_serializing_if = "std::ops::Not::not")]
    pub replayed: bool,
}

#[derive(Debug, Serialize)]
pub struct ErrorBody {
    pub kind: ErrorKind,
    pub message: String,
}

#[derive(Debug, Deserialize)]
pub struct AssignRequest {
    pub agent_id: String,
}

#[derive(Serialize)]
pub struct MarketplaceResponse {
    pub market: WindowStatus,
    pub count: usize,
    pub listings: Vec<Listing>,
}

#[derive(Serialize)]
pub struct HealthResponse {
    pub status: &'static str,
    pub version: &'static str,
}

// ─────────────────────────────────────────────────────────
// Handlers
// ─────────────────────────────────────────────────────────

/// `GET /health`
pub async fn health() -> impl IntoResponse {
    Json(HealthResponse {
        status: "ok",
        version: env!("CARGO_PKG_VERSION"),
    })
}

/// `GET /market/status`
pub async fn market_status(State(state): State<Arc<ApiState>>) -> Response {
    data_response(Ok(state.engine.market_status()))
}

/// `POST /projects`
pub async fn submit_project(
    State(state): State<Arc<ApiState>>,
    headers: HeaderMap,
    body: std::result::Result<Json<NewProject>, JsonRejection>,
) -> Response {
    let result = async {
        let principal = authenticate(&state, &headers).await?;
        let Json(input) = body.map_err(invalid_body)?;
        state.engine.submit_project(&principal, input).await
    }
    .await;
    outcome_response(result, StatusCode::CREATED)
}

/// `GET /projects`
///
/// Projects visible to the caller.
pub async fn list_projects(State(state): State<Arc<ApiState>>, headers: HeaderMap) -> Response {
    let result = async {
        let principal = authenticate(&state, &headers).await?;
        state.engine.projects_for(&principal).await
    }
    .await;
    data_response(result)
}

/// `GET /projects/:id`
pub async fn get_project(
    State(state): State<Arc<ApiState>>,
    headers: HeaderMap,
    Path(project_id): Path<String>,
) -> Response {
    let result = async {
        let principal = authenticate(&state, &headers).await?;
        state.engine.get_project(&principal, &project_id).await
    }
    .await;
    data_response(result)
}

/// `POST /projects/:id/payments`
///
/// Gateway confirmation for a project payment. Safe to deliver repeatedly.
pub async fn confirm_project_payment(
    State(state): State<Arc<ApiState>>,
    headers: HeaderMap,
    Path(project_id): Path<String>,
    body: std::result::Result<Json<PaymentConfirmation>, JsonRejection>,
) -> Response {
    let result = async {
        let principal = authenticate(&state, &headers).await?;
        let Json(confirmation) = body.map_err(invalid_body)?;
        state
            .engine
            .confirm_project_payment(&principal, &project_id, confirmation)
            .await
    }
    .await;
    outcome_response(result, StatusCode::OK)
}

/// `POST /projects/:id/assign`
pub async fn assign_agent(
    State(state): State<Arc<ApiState>>,
    headers: HeaderMap,
    Path(project_id): Path<String>,
    body: std::result::Result<Json<AssignRequest>, JsonRejection>,
) -> Response {
    let result = async {
        let principal = authenticate(&state, &headers).await?;
        let Json(request) = body.map_err(invalid_body)?;
        state
            .engine
            .assign_agent(&principal, &project_id, &request.agent_id)
            .await
    }
    .await;
    outcome_response(result, StatusCode::OK)
}

/// `POST /projects/:id/complete`
pub async fn complete_project(
    State(state): State<Arc<ApiState>>,
    headers: HeaderMap,
    Path(project_id): Path<String>,
) -> Response {
    let result = async {
        let principal = authenticate(&state, &headers).await?;
        state.engine.complete_project(&principal, &project_id).await
    }
    .await;
    outcome_response(result, StatusCode::OK)
}

/// `POST /listings`
pub async fn list_marketplace_product(
    State(state): State<Arc<ApiState>>,
    headers: HeaderMap,
    body: std::result::Result<Json<NewListing>, JsonRejection>,
) -> Response {
    let result = async {
        let principal = authenticate(&state, &headers).await?;
        let Json(input) = body.map_err(invalid_body)?;
        state
            .engine
            .list_marketplace_product(&principal, input)
            .await
    }
    .await;
    outcome_response(result, StatusCode::CREATED)
}

/// `GET /listings`
///
/// Active listings together with the current trading window.
pub async fn list_listings(State(state): State<Arc<ApiState>>) -> Response {
    let result = async {
        let listings = state.engine.active_listings().await?;
        Ok::<_, BrokerageError>(MarketplaceResponse {
            market: state.engine.market_status(),
            count: listings.len(),
            listings,
        })
    }
    .await;
    data_response(result)
}

/// `DELETE /listings/:id`
pub async fn remove_listing(
    State(state): State<Arc<ApiState>>,
    headers: HeaderMap,
    Path(listing_id): Path<String>,
) -> Response {
    let result = async {
        let principal = authenticate(&state, &headers).await?;
        state.engine.remove_listing(&principal, &listing_id).await
    }
    .await;
    outcome_response(result, StatusCode::OK)
}

/// `POST /listings/:id/purchases`
///
/// Gateway confirmation for a marketplace sale. Rejected outside the
/// trading window.
pub async fn confirm_marketplace_purchase(
    State(state): State<Arc<ApiState>>,
    headers: HeaderMap,
    Path(listing_id): Path<String>,
    body: std::result::Result<Json<PaymentConfirmation>, JsonRejection>,
) -> Response {
    let result = async {
        let principal = authenticate(&state, &headers).await?;
        let Json(confirmation) = body.map_err(invalid_body)?;
        state
            .engine
            .confirm_marketplace_purchase(&principal, &listing_id, confirmation)
            .await
    }
    .await;
    outcome_response(result, StatusCode::CREATED)
}

/// `GET /analytics`
pub async fn get_analytics(State(state): State<Arc<ApiState>>, headers: HeaderMap) -> Response {
    let result = async {
        let principal = authenticate(&state, &headers).await?;
        state.engine.get_analytics(&principal).await
    }
    .await;
    data_response(result)
}

// ─────────────────────────────────────────────────────────
// Helpers
// ─────────────────────────────────────────────────────────

async fn authenticate(state: &ApiState, headers: &HeaderMap) -> Result<Principal> {
    let principal = state
        .resolver
        .resolve(headers)?
        .ok_or(BrokerageError::Unauthenticated)?;
    state.engine.register_principal(&principal).await?;
    Ok(principal)
}

fn invalid_body(rejection: JsonRejection) -> BrokerageError {
    BrokerageError::Validation(rejection.body_text())
}

fn status_for(kind: ErrorKind) -> StatusCode {
    match kind {
        ErrorKind::Validation => StatusCode::BAD_REQUEST,
        ErrorKind::NotFound => StatusCode::NOT_FOUND,
        ErrorKind::InvalidState => StatusCode::CONFLICT,
        ErrorKind::DuplicateTransaction => StatusCode::OK,
        ErrorKind::MarketClosed => StatusCode::LOCKED,
        ErrorKind::Unavailable => StatusCode::SERVICE_UNAVAILABLE,
        ErrorKind::Unauthenticated => StatusCode::UNAUTHORIZED,
        ErrorKind::Forbidden => StatusCode::FORBIDDEN,
    }
}

fn error_response(err: BrokerageError) -> Response {
    let kind = err.kind();
    if kind == ErrorKind::Unavailable {
        tracing::error!("Request failed: {err}");
    }
    (
        status_for(kind),
        Json(ActionResponse::<()> {
            success: false,
            data: None,
            error: Some(ErrorBody {
                kind,
                message: err.to_string(),
            }),
            warning: None,
            replayed: false,
        }),
    )
        .into_response()
}

fn outcome_response<T: Serialize>(result: Result<Outcome<T>>, status: StatusCode) -> Response {
    match result {
        Ok(outcome) => {
            let status = if outcome.replayed { StatusCode::OK } else { status };
            (
                status,
                Json(ActionResponse {
                    success: true,
                    data: Some(outcome.data),
                    error: None,
                    warning: outcome.warning,
                    replayed: outcome.replayed,
                }),
            )
                .into_response()
        }
        Err(e) => error_response(e),
    }
}

fn data_response<T: Serialize>(result: Result<T>) -> Response {
    match result {
        Ok(data) => (
            StatusCode::OK,
            Json(ActionResponse {
                success: true,
                data: Some(data),
                error: None,
                warning: None,
                replayed: false,
            }),
        )
            .into_response(),
        Err(e) => error_response(e),
    }
}
