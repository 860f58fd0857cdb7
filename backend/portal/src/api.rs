//! Axum REST API handlers.
//!
//! The caller is identified by the `x-user-id` header, which the identity
//! gateway in front of this service sets. Enrollment routes are owner-only.
//!
//! | Engine outcome          | Status                               |
//! |-------------------------|--------------------------------------|
//! | `Validation`            | 400                                  |
//! | `NotFound`              | 404                                  |
//! | `OutOfWindow`, `NotActive`, `AlreadyEnrolled` | 409            |
//! | `DuplicateSubmission`   | 200 with `duplicate: true`           |
//! | `ProofRejected`         | 422                                  |
//! | `RateLimited`           | 429 with `Retry-After`               |
//! | `Verification`, `Storage` | 503                                |
//! | `Config`                | 500                                  |

use std::sync::Arc;

use async_trait::async_trait;
use axum::{
    extract::{FromRequestParts, Path, Query, State},
    http::{header, request::Parts, StatusCode},
    response::{IntoResponse, Response},
    Json,
};
use chrono::Utc;
use serde::{Deserialize, Serialize};
use sqlx::SqlitePool;
use tracing::{error, warn};

use commit_engine::{
    quote, ChallengeEngine, ChallengeTemplate, DayProgress, EngineError, EngineEvent,
    Enrollment, EnrollmentId, Money, StakeQuote, UnitProof, UserSummary, ValidationError,
};

use crate::db;
use crate::upload::{self, UploadError};

pub struct ApiState {
    pub engine: Arc<ChallengeEngine>,
    pub pool: SqlitePool,
    pub max_proof_bytes: usize,
}

// ─────────────────────────────────────────────────────────
// Caller identity
// ─────────────────────────────────────────────────────────

pub const USER_HEADER: &str = "x-user-id";

/// Authenticated user id taken from [`USER_HEADER`].
#[derive(Debug, Clone)]
pub struct Caller(pub String);

#[async_trait]
impl<S: Send + Sync> FromRequestParts<S> for Caller {
    type Rejection = ApiError;

    async fn from_request_parts(parts: &mut Parts, _state: &S) -> Result<Self, ApiError> {
        parts
            .headers
            .get(USER_HEADER)
            .and_then(|v| v.to_str().ok())
            .map(str::trim)
            .filter(|v| !v.is_empty())
            .map(|v| Caller(v.to_string()))
            .ok_or(ApiError::Unauthenticated)
    }
}

// ─────────────────────────────────────────────────────────
// Request / response shapes
// ─────────────────────────────────────────────────────────

#[derive(Serialize)]
pub struct HealthResponse {
    pub status: &'static str,
    pub version: &'static str,
}

#[derive(Serialize)]
pub struct TemplatesResponse {
    pub count: usize,
    pub templates: Vec<ChallengeTemplate>,
}

#[derive(Debug, Deserialize)]
pub struct QuoteParams {
    pub stake: Money,
}

#[derive(Debug, Deserialize)]
pub struct StartEnrollment {
    pub template_id: String,
    pub tier_id: String,
    pub stake_amount: Money,
}

#[derive(Debug, Deserialize)]
pub struct SubmitProof {
    pub day_index: u32,
    pub unit_index: u32,
    pub proof_ref: String,
}

#[derive(Debug, Serialize)]
pub struct SubmitResponse {
    /// The slot was already filled; `existing` holds the stored proof.
    pub duplicate: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub existing: Option<UnitProof>,
    pub day: Option<DayProgress>,
    pub enrollment: Enrollment,
}

#[derive(Serialize)]
pub struct EnrollmentsResponse {
    pub count: usize,
    pub enrollments: Vec<Enrollment>,
}

#[derive(Serialize)]
pub struct EventsResponse {
    pub enrollment_id: EnrollmentId,
    pub count: usize,
    pub events: Vec<EngineEvent>,
}

#[derive(Debug, Deserialize)]
pub struct UploadProof {
    /// Base64 or `data:` URL.
    pub image: String,
}

#[derive(Debug, Serialize)]
pub struct UploadResponse {
    pub proof_ref: String,
    pub content_type: &'static str,
    pub size: usize,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct ErrorResponse {
    pub error: String,
    pub kind: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub retry_after_secs: Option<i64>,
}

// ─────────────────────────────────────────────────────────
// Errors
// ─────────────────────────────────────────────────────────

#[derive(Debug)]
pub enum ApiError {
    Engine(EngineError),
    Upload(UploadError),
    Unauthenticated,
    Forbidden,
    NotFound(String),
    BadRequest(String),
    Internal(String),
}

impl From<EngineError> for ApiError {
    fn from(e: EngineError) -> Self {
        Self::Engine(e)
    }
}

impl From<ValidationError> for ApiError {
    fn from(e: ValidationError) -> Self {
        Self::Engine(EngineError::Validation(e))
    }
}

impl From<UploadError> for ApiError {
    fn from(e: UploadError) -> Self {
        Self::Upload(e)
    }
}

impl From<crate::errors::PortalError> for ApiError {
    fn from(e: crate::errors::PortalError) -> Self {
        Self::Internal(e.to_string())
    }
}

fn engine_status(e: &EngineError) -> StatusCode {
    match e {
        EngineError::Validation(_) => StatusCode::BAD_REQUEST,
        EngineError::NotFound(_) => StatusCode::NOT_FOUND,
        EngineError::OutOfWindow { .. }
        | EngineError::DuplicateSubmission { .. }
        | EngineError::NotActive { .. }
        | EngineError::AlreadyEnrolled { .. } => StatusCode::CONFLICT,
        EngineError::ProofRejected { .. } => StatusCode::UNPROCESSABLE_ENTITY,
        EngineError::RateLimited { .. } => StatusCode::TOO_MANY_REQUESTS,
        EngineError::Verification(_) | EngineError::Storage(_) => StatusCode::SERVICE_UNAVAILABLE,
        EngineError::Config(_) => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, kind, message) = match &self {
            ApiError::Engine(e) => (engine_status(e), e.kind(), e.to_string()),
            ApiError::Upload(e) => (StatusCode::BAD_REQUEST, "invalid_upload", e.to_string()),
            ApiError::Unauthenticated => (
                StatusCode::UNAUTHORIZED,
                "unauthenticated",
                format!("missing {USER_HEADER} header"),
            ),
            ApiError::Forbidden => (
                StatusCode::FORBIDDEN,
                "forbidden",
                "enrollment belongs to another user".to_string(),
            ),
            ApiError::NotFound(m) => (StatusCode::NOT_FOUND, "not_found", m.clone()),
            ApiError::BadRequest(m) => (StatusCode::BAD_REQUEST, "bad_request", m.clone()),
            ApiError::Internal(m) => (StatusCode::INTERNAL_SERVER_ERROR, "internal", m.clone()),
        };

        if status.is_server_error() {
            error!("{kind}: {message}");
        }

        let retry_after_secs = match &self {
            // Round up so a client that waits exactly this long is admitted.
            ApiError::Engine(EngineError::RateLimited { retry_after, .. }) => {
                Some(((retry_after.num_milliseconds() + 999) / 1000).max(1))
            }
            _ => None,
        };
        let body = Json(ErrorResponse {
            error: message,
            kind: kind.to_string(),
            retry_after_secs,
        });

        match retry_after_secs {
            Some(secs) => (status, [(header::RETRY_AFTER, secs.to_string())], body).into_response(),
            None => (status, body).into_response(),
        }
    }
}

type ApiResult<T> = Result<T, ApiError>;

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

/// `GET /templates`
pub async fn list_templates(State(state): State<Arc<ApiState>>) -> impl IntoResponse {
    let templates: Vec<ChallengeTemplate> = state.engine.catalog().templates().cloned().collect();
    Json(TemplatesResponse {
        count: templates.len(),
        templates,
    })
}

/// `GET /templates/:id`
pub async fn get_template(
    State(state): State<Arc<ApiState>>,
    Path(template_id): Path<String>,
) -> ApiResult<Json<ChallengeTemplate>> {
    state
        .engine
        .catalog()
        .template(&template_id)
        .cloned()
        .map(Json)
        .ok_or_else(|| ApiError::NotFound(format!("unknown challenge template: {template_id}")))
}

/// `GET /templates/:id/tiers/:tier/quote?stake=N`
pub async fn quote_stake(
    State(state): State<Arc<ApiState>>,
    Path((template_id, tier_id)): Path<(String, String)>,
    Query(params): Query<QuoteParams>,
) -> ApiResult<Json<StakeQuote>> {
    let (_, tier) = state.engine.catalog().resolve(&template_id, &tier_id)?;
    Ok(Json(quote(tier, params.stake)?))
}

/// `POST /enrollments`
pub async fn start_enrollment(
    State(state): State<Arc<ApiState>>,
    Caller(user_id): Caller,
    Json(req): Json<StartEnrollment>,
) -> ApiResult<impl IntoResponse> {
    let enrollment = state
        .engine
        .start_enrollment(&user_id, &req.template_id, &req.tier_id, req.stake_amount, Utc::now())
        .await?;
    Ok((StatusCode::CREATED, Json(enrollment)))
}

/// `GET /enrollments/:id`
pub async fn get_enrollment(
    State(state): State<Arc<ApiState>>,
    Caller(user_id): Caller,
    Path(id): Path<EnrollmentId>,
) -> ApiResult<Json<Enrollment>> {
    Ok(Json(owned_enrollment(&state, &user_id, id).await?))
}

/// `POST /enrollments/:id/proofs`
///
/// Runs the full submission path, including the verifier round trip. A
/// duplicate upload is answered with the proof already on file.
pub async fn submit_proof(
    State(state): State<Arc<ApiState>>,
    Caller(user_id): Caller,
    Path(id): Path<EnrollmentId>,
    Json(req): Json<SubmitProof>,
) -> ApiResult<Json<SubmitResponse>> {
    owned_enrollment(&state, &user_id, id).await?;
    check_proof_ref(&state.pool, &user_id, &req.proof_ref).await?;

    let outcome = state
        .engine
        .submit_unit_proof(id, req.day_index, req.unit_index, &req.proof_ref, Utc::now())
        .await;

    match outcome {
        Ok(day) => {
            let enrollment = state.engine.get_enrollment_view(id).await?;
            Ok(Json(SubmitResponse {
                duplicate: false,
                existing: None,
                day: Some(day),
                enrollment,
            }))
        }
        Err(EngineError::DuplicateSubmission {
            day_index,
            existing,
            ..
        }) => {
            let enrollment = state.engine.get_enrollment_view(id).await?;
            Ok(Json(SubmitResponse {
                duplicate: true,
                existing: Some(existing),
                day: enrollment.days.get(day_index as usize).cloned(),
                enrollment,
            }))
        }
        Err(e) => {
            if let EngineError::RateLimited { reason, .. } = &e {
                warn!("Enrollment {id}: upload for unit {} throttled: {reason}", req.unit_index);
            }
            Err(e.into())
        }
    }
}

/// `GET /enrollments/:id/events`
pub async fn enrollment_events(
    State(state): State<Arc<ApiState>>,
    Caller(user_id): Caller,
    Path(id): Path<EnrollmentId>,
) -> ApiResult<Json<EventsResponse>> {
    owned_enrollment(&state, &user_id, id).await?;
    let events = state.engine.enrollment_events(id).await?;
    Ok(Json(EventsResponse {
        enrollment_id: id,
        count: events.len(),
        events,
    }))
}

/// `GET /me/enrollments`
pub async fn my_enrollments(
    State(state): State<Arc<ApiState>>,
    Caller(user_id): Caller,
) -> ApiResult<Json<EnrollmentsResponse>> {
    let enrollments = state.engine.list_enrollments(&user_id).await?;
    Ok(Json(EnrollmentsResponse {
        count: enrollments.len(),
        enrollments,
    }))
}

/// `GET /me/summary`
pub async fn my_summary(
    State(state): State<Arc<ApiState>>,
    Caller(user_id): Caller,
) -> ApiResult<Json<UserSummary>> {
    Ok(Json(state.engine.user_summary(&user_id).await?))
}

/// `POST /proofs`
pub async fn upload_proof(
    State(state): State<Arc<ApiState>>,
    Caller(user_id): Caller,
    Json(req): Json<UploadProof>,
) -> ApiResult<impl IntoResponse> {
    let image = upload::decode_image(&req.image, state.max_proof_bytes)?;
    let id = db::insert_proof(&state.pool, &user_id, image.content_type, &image.bytes).await?;
    Ok((
        StatusCode::CREATED,
        Json(UploadResponse {
            proof_ref: format!("proof:{id}"),
            content_type: image.content_type,
            size: image.bytes.len(),
        }),
    ))
}

// ─────────────────────────────────────────────────────────
// Helpers
// ─────────────────────────────────────────────────────────

async fn owned_enrollment(state: &ApiState, user_id: &str, id: EnrollmentId) -> ApiResult<Enrollment> {
    let enrollment = state.engine.get_enrollment_view(id).await?;
    if enrollment.user_id != user_id {
        return Err(ApiError::Forbidden);
    }
    Ok(enrollment)
}

/// Uploaded refs (`proof:<id>`) must exist and belong to the caller; other
/// references are passed to the verifier untouched.
async fn check_proof_ref(pool: &SqlitePool, user_id: &str, proof_ref: &str) -> ApiResult<()> {
    if proof_ref.trim().is_empty() {
        return Err(ApiError::BadRequest("proof_ref is required".to_string()));
    }
    let Some(raw_id) = proof_ref.strip_prefix("proof:") else {
        return Ok(());
    };
    let id: i64 = raw_id
        .parse()
        .map_err(|_| ApiError::BadRequest(format!("malformed proof reference {proof_ref}")))?;
    match db::proof_meta(pool, id).await? {
        Some((owner, _)) if owner == user_id => Ok(()),
        _ => Err(ApiError::BadRequest(format!("unknown proof reference {proof_ref}"))),
    }
}
