//! API server — HTTP REST endpoints plus the Prometheus metrics listener.

use crate::rest::{self, AppState};
use crate::swagger::ApiDoc;
use axum::routing::{get, post};
use axum::Router;
use cadence_core::config::AppConfig;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Instant;
use tower_http::compression::CompressionLayer;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use tracing::info;
use utoipa::OpenApi;
use utoipa_swagger_ui::SwaggerUi;

use cadence_engine::{CancellationGateway, TriggerIngestor};
use cadence_store::SequenceStore;

pub struct ApiServer {
    config: AppConfig,
    ingestor: Arc<TriggerIngestor>,
    gateway: Arc<CancellationGateway>,
    store: Arc<dyn SequenceStore>,
}

impl ApiServer {
    pub fn new(
        config: AppConfig,
        ingestor: Arc<TriggerIngestor>,
        gateway: Arc<CancellationGateway>,
        store: Arc<dyn SequenceStore>,
    ) -> Self {
        Self {
            config,
            ingestor,
            gateway,
            store,
        }
    }

    /// Build the router; exposed separately so tests can drive it in-process.
    pub fn router(&self) -> Router {
        let state = AppState {
            ingestor: self.ingestor.clone(),
            gateway: self.gateway.clone(),
            store: self.store.clone(),
            node_id: self.config.node_id.clone(),
            start_time: Instant::now(),
        };

        Router::new()
            // Sequence endpoints
            .route("/v1/sequences/trigger", post(rest::handle_trigger))
            .route("/v1/sequences/cancel", post(rest::handle_cancel))
            .route("/v1/sequences/disqualify", post(rest::handle_disqualify))
            .route("/v1/sequences/:instance_id", get(rest::handle_get_instance))
            .route("/v1/sequences", get(rest::handle_list_instances))
            .route("/v1/reconciliation", get(rest::handle_reconciliation))
            // Operational endpoints
            .route("/health", get(rest::health_check))
            .route("/ready", get(rest::readiness))
            .route("/live", get(rest::liveness))
            // API documentation
            .merge(SwaggerUi::new("/docs").url("/api-doc/openapi.json", ApiDoc::openapi()))
            // Middleware
            .layer(CompressionLayer::new())
            .layer(CorsLayer::permissive())
            .layer(TraceLayer::new_for_http())
            .with_state(state)
    }

    /// Start the HTTP REST server.
    pub async fn start_http(&self) -> anyhow::Result<()> {
        let app = self.router();
        let addr = SocketAddr::new(self.config.api.host.parse()?, self.config.api.http_port);

        info!(addr = %addr, "Starting HTTP server");

        let listener = tokio::net::TcpListener::bind(addr).await?;
        axum::serve(listener, app).await?;

        Ok(())
    }

    /// Start the metrics server on a separate port.
    pub async fn start_metrics(&self) -> anyhow::Result<()> {
        let builder = metrics_exporter_prometheus::PrometheusBuilder::new();
        let handle = builder
            .with_http_listener(SocketAddr::new(
                self.config.api.host.parse()?,
                self.config.metrics.port,
            ))
            .install_recorder()?;

        info!(port = self.config.metrics.port, "Metrics exporter started");

        // Keep the handle alive
        std::mem::forget(handle);
        Ok(())
    }
}
