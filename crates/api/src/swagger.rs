//! OpenAPI specification and Swagger UI configuration.

use utoipa::OpenApi;

#[derive(OpenApi)]
#[openapi(
    info(
        title = "Cadence API",
        version = "0.1.0",
        description = "Delayed campaign sequencer.\n\nSchedules and fires ordered message sequences (welcome series, cart recovery, review requests, education drip) in reaction to business events, with durable restart-safe scheduling and cancellation on disqualifying events.",
        license(name = "MIT"),
    ),
    tags(
        (name = "Sequences", description = "Trigger, cancel, and inspect sequence instances"),
        (name = "Operations", description = "Health probes and the reconciliation queue"),
    ),
    paths(
        crate::rest::handle_trigger,
        crate::rest::handle_cancel,
        crate::rest::handle_disqualify,
        crate::rest::handle_get_instance,
        crate::rest::handle_list_instances,
        crate::rest::handle_reconciliation,
        crate::rest::health_check,
        crate::rest::readiness,
        crate::rest::liveness,
    ),
    components(schemas(
        crate::rest::TriggerRequest,
        crate::rest::TriggerResponse,
        crate::rest::CancelRequest,
        crate::rest::CancelResponse,
        crate::rest::DisqualifyRequest,
        crate::rest::DisqualifyResponse,
        crate::rest::ErrorResponse,
        crate::rest::HealthResponse,
        cadence_core::types::CampaignKind,
        cadence_store::SequenceInstance,
        cadence_store::StepExecution,
        cadence_store::InstanceStatus,
        cadence_store::StepState,
        cadence_store::ReconciliationEntry,
    ))
)]
pub struct ApiDoc;
