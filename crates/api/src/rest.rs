//! REST API handlers for sequence triggers, cancellations, inspection, and
//! operational endpoints.

use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::Json;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Instant;
use tracing::{error, warn};
use utoipa::ToSchema;
use uuid::Uuid;

use cadence_core::types::CampaignKind;
use cadence_core::SequencerError;
use cadence_engine::{CancellationGateway, IngestOutcome, TriggerIngestor};
use cadence_store::{ReconciliationEntry, SequenceInstance, SequenceStore};

/// Maximum string field length (subject id, reason, etc.).
const MAX_FIELD_LEN: usize = 256;

/// Maximum serialized binding payload size.
const MAX_BINDING_BYTES: usize = 64 * 1024;

/// Shared application state for REST handlers.
#[derive(Clone)]
pub struct AppState {
    pub ingestor: Arc<TriggerIngestor>,
    pub gateway: Arc<CancellationGateway>,
    pub store: Arc<dyn SequenceStore>,
    pub node_id: String,
    pub start_time: Instant,
}

#[derive(Debug, Deserialize, ToSchema)]
pub struct TriggerRequest {
    pub subject_id: String,
    pub campaign_kind: CampaignKind,
    /// Event payload snapshotted into the instance at creation.
    #[serde(default)]
    #[schema(value_type = Object)]
    pub binding_data: serde_json::Value,
}

#[derive(Debug, Serialize, ToSchema)]
pub struct TriggerResponse {
    pub instance_id: Uuid,
    pub outcome: String,
}

#[derive(Debug, Deserialize, ToSchema)]
pub struct CancelRequest {
    pub subject_id: String,
    pub campaign_kind: CampaignKind,
    pub reason: String,
}

#[derive(Debug, Serialize, ToSchema)]
pub struct CancelResponse {
    pub cancelled_instance_id: Option<Uuid>,
}

#[derive(Debug, Deserialize, ToSchema)]
pub struct DisqualifyRequest {
    pub subject_id: String,
    /// Business event name as referenced by catalog `cancel_if` predicates.
    pub event_name: String,
}

#[derive(Debug, Serialize, ToSchema)]
pub struct DisqualifyResponse {
    pub cancelled_instance_ids: Vec<Uuid>,
}

#[derive(Debug, Deserialize)]
pub struct ListQuery {
    pub subject_id: String,
}

#[derive(Serialize, ToSchema)]
pub struct ErrorResponse {
    pub error: String,
    pub message: String,
}

#[derive(Serialize, ToSchema)]
pub struct HealthResponse {
    pub status: String,
    pub node_id: String,
    pub uptime_secs: u64,
    pub instances: usize,
}

impl IntoResponse for ErrorResponse {
    fn into_response(self) -> axum::response::Response {
        (StatusCode::INTERNAL_SERVER_ERROR, Json(self)).into_response()
    }
}

fn validate_subject(subject_id: &str) -> Result<(), &'static str> {
    if subject_id.is_empty() {
        return Err("'subject_id' must not be empty");
    }
    if subject_id.len() > MAX_FIELD_LEN {
        return Err("'subject_id' exceeds maximum length");
    }
    Ok(())
}

fn bad_request(message: &str) -> (StatusCode, Json<ErrorResponse>) {
    metrics::counter!("api.validation_errors").increment(1);
    (
        StatusCode::BAD_REQUEST,
        Json(ErrorResponse {
            error: "invalid_request".to_string(),
            message: message.to_string(),
        }),
    )
}

fn internal_error(e: &SequencerError) -> (StatusCode, Json<ErrorResponse>) {
    metrics::counter!("api.errors").increment(1);
    (
        StatusCode::INTERNAL_SERVER_ERROR,
        Json(ErrorResponse {
            error: "sequencer_error".to_string(),
            message: e.to_string(),
        }),
    )
}

/// POST /v1/sequences/trigger — Ingest a business trigger event.
#[utoipa::path(
    post,
    path = "/v1/sequences/trigger",
    tag = "Sequences",
    request_body = TriggerRequest,
    responses(
        (status = 200, description = "Trigger ingested", body = TriggerResponse),
        (status = 400, description = "Validation failed", body = ErrorResponse),
    )
)]
pub async fn handle_trigger(
    State(state): State<AppState>,
    Json(request): Json<TriggerRequest>,
) -> Result<Json<TriggerResponse>, (StatusCode, Json<ErrorResponse>)> {
    if let Err(msg) = validate_subject(&request.subject_id) {
        warn!(error = msg, "Trigger validation failed");
        return Err(bad_request(msg));
    }
    let binding_bytes = request.binding_data.to_string().len();
    if binding_bytes > MAX_BINDING_BYTES {
        warn!(bytes = binding_bytes, "Trigger binding data too large");
        return Err(bad_request("'binding_data' exceeds maximum size"));
    }

    match state.ingestor.ingest(
        &request.subject_id,
        request.campaign_kind,
        request.binding_data,
    ) {
        Ok(outcome) => {
            let label = match &outcome {
                IngestOutcome::Created { .. } => "created",
                IngestOutcome::AlreadyActive { .. } => "already_active",
                IngestOutcome::Superseded { .. } => "superseded",
            };
            Ok(Json(TriggerResponse {
                instance_id: outcome.instance_id(),
                outcome: label.to_string(),
            }))
        }
        Err(e) => {
            error!(error = %e, subject_id = %request.subject_id, "Trigger ingest failed");
            Err(internal_error(&e))
        }
    }
}

/// POST /v1/sequences/cancel — Cancel the Active instance for a pair.
#[utoipa::path(
    post,
    path = "/v1/sequences/cancel",
    tag = "Sequences",
    request_body = CancelRequest,
    responses(
        (status = 200, description = "Cancellation processed", body = CancelResponse),
        (status = 400, description = "Validation failed", body = ErrorResponse),
    )
)]
pub async fn handle_cancel(
    State(state): State<AppState>,
    Json(request): Json<CancelRequest>,
) -> Result<Json<CancelResponse>, (StatusCode, Json<ErrorResponse>)> {
    if let Err(msg) = validate_subject(&request.subject_id) {
        return Err(bad_request(msg));
    }
    if request.reason.is_empty() || request.reason.len() > MAX_FIELD_LEN {
        return Err(bad_request("'reason' must be 1-256 characters"));
    }

    match state
        .gateway
        .cancel(&request.subject_id, request.campaign_kind, &request.reason)
    {
        Ok(cancelled_instance_id) => Ok(Json(CancelResponse {
            cancelled_instance_id,
        })),
        Err(e) => {
            error!(error = %e, subject_id = %request.subject_id, "Cancellation failed");
            Err(internal_error(&e))
        }
    }
}

/// POST /v1/sequences/disqualify — Route a disqualifying business event to
/// every campaign whose catalog names it.
#[utoipa::path(
    post,
    path = "/v1/sequences/disqualify",
    tag = "Sequences",
    request_body = DisqualifyRequest,
    responses(
        (status = 200, description = "Event routed", body = DisqualifyResponse),
        (status = 400, description = "Validation failed", body = ErrorResponse),
    )
)]
pub async fn handle_disqualify(
    State(state): State<AppState>,
    Json(request): Json<DisqualifyRequest>,
) -> Result<Json<DisqualifyResponse>, (StatusCode, Json<ErrorResponse>)> {
    if let Err(msg) = validate_subject(&request.subject_id) {
        return Err(bad_request(msg));
    }
    if request.event_name.is_empty() || request.event_name.len() > MAX_FIELD_LEN {
        return Err(bad_request("'event_name' must be 1-256 characters"));
    }

    match state
        .gateway
        .handle_disqualifying_event(&request.subject_id, &request.event_name)
    {
        Ok(cancelled_instance_ids) => Ok(Json(DisqualifyResponse {
            cancelled_instance_ids,
        })),
        Err(e) => {
            error!(error = %e, "Disqualifying event routing failed");
            Err(internal_error(&e))
        }
    }
}

/// GET /v1/sequences/{instance_id} — Full instance with step executions.
#[utoipa::path(
    get,
    path = "/v1/sequences/{instance_id}",
    tag = "Sequences",
    params(
        ("instance_id" = Uuid, Path, description = "Sequence instance identifier"),
    ),
    responses(
        (status = 200, description = "Sequence instance", body = SequenceInstance),
        (status = 404, description = "Instance not found"),
    )
)]
pub async fn handle_get_instance(
    State(state): State<AppState>,
    Path(instance_id): Path<Uuid>,
) -> Result<Json<SequenceInstance>, StatusCode> {
    match state.store.get(instance_id) {
        Some(instance) => Ok(Json(instance)),
        None => Err(StatusCode::NOT_FOUND),
    }
}

/// GET /v1/sequences?subject_id= — All instances for a subject, newest first.
#[utoipa::path(
    get,
    path = "/v1/sequences",
    tag = "Sequences",
    params(
        ("subject_id" = String, Query, description = "Subject identifier"),
    ),
    responses(
        (status = 200, description = "Instances for the subject", body = [SequenceInstance]),
    )
)]
pub async fn handle_list_instances(
    State(state): State<AppState>,
    Query(query): Query<ListQuery>,
) -> Result<Json<Vec<SequenceInstance>>, (StatusCode, Json<ErrorResponse>)> {
    if let Err(msg) = validate_subject(&query.subject_id) {
        return Err(bad_request(msg));
    }
    Ok(Json(state.store.list_for_subject(&query.subject_id)))
}

/// GET /v1/reconciliation — Operator queue of sends with unknown outcome.
#[utoipa::path(
    get,
    path = "/v1/reconciliation",
    tag = "Operations",
    responses(
        (status = 200, description = "Reconciliation queue", body = [ReconciliationEntry]),
    )
)]
pub async fn handle_reconciliation(
    State(state): State<AppState>,
) -> Json<Vec<ReconciliationEntry>> {
    Json(state.store.reconciliation_queue())
}

/// GET /health — Health check endpoint.
#[utoipa::path(
    get,
    path = "/health",
    tag = "Operations",
    responses(
        (status = 200, description = "Service health", body = HealthResponse),
    )
)]
pub async fn health_check(State(state): State<AppState>) -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "healthy".to_string(),
        node_id: state.node_id.clone(),
        uptime_secs: state.start_time.elapsed().as_secs(),
        instances: state.store.instance_count(),
    })
}

/// GET /ready — Readiness probe for Kubernetes.
#[utoipa::path(
    get,
    path = "/ready",
    tag = "Operations",
    responses(
        (status = 200, description = "Ready"),
        (status = 503, description = "Not ready"),
    )
)]
pub async fn readiness(State(state): State<AppState>) -> StatusCode {
    if state.start_time.elapsed().as_secs() > 0 {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    }
}

/// GET /live — Liveness probe for Kubernetes.
#[utoipa::path(
    get,
    path = "/live",
    tag = "Operations",
    responses((status = 200, description = "Alive"))
)]
pub async fn liveness() -> StatusCode {
    StatusCode::OK
}
