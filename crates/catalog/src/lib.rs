//! Campaign catalog — static, versioned definitions of campaigns and their
//! ordered steps. Pure data, loaded once at startup, never mutated at runtime.

pub mod catalog;
pub mod types;

pub use catalog::CampaignCatalog;
pub use types::{CampaignDefinition, StepDefinition, TriggerPolicy};
