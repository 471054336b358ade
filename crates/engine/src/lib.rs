//! Sequence engine — trigger ingestion, durable scheduling, step execution
//! with retry/backoff, and cancellation for the campaign sequencer.

pub mod cancel;
pub mod executor;
pub mod ingest;
pub mod render;
pub mod retry;
pub mod scheduler;
pub mod transport;

pub use cancel::CancellationGateway;
pub use executor::{ExecutionOutcome, Executor};
pub use ingest::{IngestOutcome, TriggerIngestor};
pub use render::{ContentRenderer, TemplateRenderer};
pub use retry::RetryPolicy;
pub use scheduler::Scheduler;
pub use transport::{CaptureTransport, DeliveryTransport, LogTransport};
