use std::collections::HashMap;

use cadence_core::types::CampaignKind;
use cadence_core::{SequencerError, SequencerResult};
use tracing::info;

use crate::types::{CampaignDefinition, CatalogFile, StepDefinition, TriggerPolicy};

const HOUR: i64 = 3600;
const DAY: i64 = 86_400;

/// Versioned, read-only table of campaign definitions.
///
/// Instances record the catalog version active at their creation time, so a
/// catalog change never redefines an in-flight sequence.
#[derive(Debug, Clone)]
pub struct CampaignCatalog {
    version: u32,
    campaigns: HashMap<CampaignKind, CampaignDefinition>,
}

impl CampaignCatalog {
    pub fn version(&self) -> u32 {
        self.version
    }

    pub fn get(&self, kind: CampaignKind) -> Option<&CampaignDefinition> {
        self.campaigns.get(&kind)
    }

    pub fn require(&self, kind: CampaignKind) -> SequencerResult<&CampaignDefinition> {
        self.campaigns
            .get(&kind)
            .ok_or_else(|| SequencerError::UnknownCampaign(kind.to_string()))
    }

    pub fn campaigns(&self) -> impl Iterator<Item = &CampaignDefinition> {
        self.campaigns.values()
    }

    /// Campaign kinds that carry a `cancel_if` predicate naming this event.
    /// The Cancellation Gateway uses this to route a business event to the
    /// sequences it disqualifies.
    pub fn kinds_cancelled_by(&self, event_name: &str) -> Vec<CampaignKind> {
        let mut kinds: Vec<CampaignKind> = self
            .campaigns
            .values()
            .filter(|c| {
                c.steps
                    .iter()
                    .any(|s| s.cancel_if.as_deref() == Some(event_name))
            })
            .map(|c| c.kind)
            .collect();
        kinds.sort_by_key(|k| k.as_str());
        kinds
    }

    /// The catalog shipped with the service, version 1.
    pub fn builtin() -> Self {
        let campaigns = vec![
            CampaignDefinition {
                kind: CampaignKind::WelcomeSeries,
                name: "Welcome Series".to_string(),
                trigger_policy: TriggerPolicy::IdempotentCreate,
                cancel_on_hard_bounce: true,
                steps: vec![
                    step(0, 2 * DAY, "welcome_intro", None),
                    step(1, 4 * DAY, "welcome_getting_started", None),
                    step(2, 7 * DAY, "welcome_social_proof", None),
                    step(3, 10 * DAY, "welcome_first_order_offer", None),
                ],
            },
            CampaignDefinition {
                kind: CampaignKind::CartRecovery,
                name: "Cart Recovery".to_string(),
                trigger_policy: TriggerPolicy::Replace,
                cancel_on_hard_bounce: true,
                steps: vec![
                    step(0, HOUR, "cart_reminder", Some("purchase_completed")),
                    step(1, 24 * HOUR, "cart_still_waiting", Some("purchase_completed")),
                    // Final step offers a discount code and unsubscribes the
                    // subject from further cart reminders.
                    step(2, 72 * HOUR, "cart_discount_code", Some("purchase_completed")),
                ],
            },
            CampaignDefinition {
                kind: CampaignKind::ReviewRequest,
                name: "Review Request".to_string(),
                trigger_policy: TriggerPolicy::IdempotentCreate,
                cancel_on_hard_bounce: true,
                steps: vec![
                    step(0, 7 * DAY, "review_ask", Some("review_submitted")),
                    step(1, 14 * DAY, "review_nudge", Some("review_submitted")),
                ],
            },
            CampaignDefinition {
                kind: CampaignKind::EducationDrip,
                name: "Education Drip".to_string(),
                trigger_policy: TriggerPolicy::IdempotentCreate,
                cancel_on_hard_bounce: true,
                steps: (0..12)
                    .map(|i| {
                        step(
                            i,
                            (i as i64 + 1) * 14 * DAY,
                            &format!("course_lesson_{:02}", i + 1),
                            None,
                        )
                    })
                    .collect(),
            },
        ];

        Self::from_definitions(1, campaigns).expect("builtin catalog is valid")
    }

    /// Load a catalog from a TOML file.
    pub fn from_file(path: &str) -> SequencerResult<Self> {
        let file: CatalogFile = config::Config::builder()
            .add_source(config::File::with_name(path))
            .build()
            .map_err(|e| SequencerError::Catalog(e.to_string()))?
            .try_deserialize()
            .map_err(|e| SequencerError::Catalog(e.to_string()))?;

        let catalog = Self::from_definitions(file.version, file.campaigns)?;
        info!(
            path = path,
            version = catalog.version,
            campaigns = catalog.campaigns.len(),
            "Campaign catalog loaded"
        );
        Ok(catalog)
    }

    /// Parse a catalog from TOML text. Used by tests and tooling.
    pub fn from_toml_str(text: &str) -> SequencerResult<Self> {
        let file: CatalogFile = config::Config::builder()
            .add_source(config::File::from_str(text, config::FileFormat::Toml))
            .build()
            .map_err(|e| SequencerError::Catalog(e.to_string()))?
            .try_deserialize()
            .map_err(|e| SequencerError::Catalog(e.to_string()))?;

        Self::from_definitions(file.version, file.campaigns)
    }

    fn from_definitions(
        version: u32,
        definitions: Vec<CampaignDefinition>,
    ) -> SequencerResult<Self> {
        if version == 0 {
            return Err(SequencerError::Catalog(
                "catalog version must be >= 1".to_string(),
            ));
        }

        let mut campaigns = HashMap::new();
        for definition in definitions {
            validate_definition(&definition)?;
            if campaigns.insert(definition.kind, definition.clone()).is_some() {
                return Err(SequencerError::Catalog(format!(
                    "duplicate campaign kind '{}'",
                    definition.kind
                )));
            }
        }

        if campaigns.is_empty() {
            return Err(SequencerError::Catalog("catalog has no campaigns".to_string()));
        }

        Ok(Self { version, campaigns })
    }
}

fn validate_definition(definition: &CampaignDefinition) -> SequencerResult<()> {
    if definition.steps.is_empty() {
        return Err(SequencerError::Catalog(format!(
            "campaign '{}' has no steps",
            definition.kind
        )));
    }

    let mut previous_offset = -1i64;
    for (position, step) in definition.steps.iter().enumerate() {
        if step.step_index as usize != position {
            return Err(SequencerError::Catalog(format!(
                "campaign '{}': step indices must be contiguous from 0, found {} at position {}",
                definition.kind, step.step_index, position
            )));
        }
        if step.offset_secs < 0 {
            return Err(SequencerError::Catalog(format!(
                "campaign '{}' step {}: negative offset",
                definition.kind, step.step_index
            )));
        }
        if step.offset_secs < previous_offset {
            return Err(SequencerError::Catalog(format!(
                "campaign '{}' step {}: offsets must be non-decreasing",
                definition.kind, step.step_index
            )));
        }
        if step.content_key.is_empty() {
            return Err(SequencerError::Catalog(format!(
                "campaign '{}' step {}: empty content key",
                definition.kind, step.step_index
            )));
        }
        previous_offset = step.offset_secs;
    }

    Ok(())
}

fn step(step_index: u32, offset_secs: i64, content_key: &str, cancel_if: Option<&str>) -> StepDefinition {
    StepDefinition {
        step_index,
        offset_secs,
        content_key: content_key.to_string(),
        cancel_if: cancel_if.map(str::to_string),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration, Utc};

    #[test]
    fn builtin_catalog_has_all_four_campaigns() {
        let catalog = CampaignCatalog::builtin();
        assert_eq!(catalog.version(), 1);

        let welcome = catalog.get(CampaignKind::WelcomeSeries).unwrap();
        assert_eq!(welcome.steps.len(), 4);
        assert_eq!(
            welcome.steps.iter().map(|s| s.offset_secs).collect::<Vec<_>>(),
            vec![2 * DAY, 4 * DAY, 7 * DAY, 10 * DAY]
        );

        let cart = catalog.get(CampaignKind::CartRecovery).unwrap();
        assert_eq!(cart.trigger_policy, TriggerPolicy::Replace);
        assert_eq!(
            cart.steps.iter().map(|s| s.offset_secs).collect::<Vec<_>>(),
            vec![HOUR, 24 * HOUR, 72 * HOUR]
        );
        assert!(cart
            .steps
            .iter()
            .all(|s| s.cancel_if.as_deref() == Some("purchase_completed")));

        let review = catalog.get(CampaignKind::ReviewRequest).unwrap();
        assert_eq!(review.steps.len(), 2);

        let drip = catalog.get(CampaignKind::EducationDrip).unwrap();
        assert_eq!(drip.steps.len(), 12);
        assert_eq!(drip.steps[0].offset_secs, 14 * DAY);
        assert_eq!(drip.steps[11].offset_secs, 12 * 14 * DAY);
    }

    #[test]
    fn offsets_are_relative_to_trigger_time() {
        let catalog = CampaignCatalog::builtin();
        let cart = catalog.get(CampaignKind::CartRecovery).unwrap();
        let trigger = Utc::now();

        assert_eq!(cart.steps[0].scheduled_at(trigger), trigger + Duration::hours(1));
        assert_eq!(cart.steps[2].scheduled_at(trigger), trigger + Duration::hours(72));
    }

    #[test]
    fn disqualifying_event_routing() {
        let catalog = CampaignCatalog::builtin();
        assert_eq!(
            catalog.kinds_cancelled_by("purchase_completed"),
            vec![CampaignKind::CartRecovery]
        );
        assert_eq!(
            catalog.kinds_cancelled_by("review_submitted"),
            vec![CampaignKind::ReviewRequest]
        );
        assert!(catalog.kinds_cancelled_by("unknown_event").is_empty());
    }

    #[test]
    fn toml_catalog_round_trip() {
        let catalog = CampaignCatalog::from_toml_str(
            r#"
            version = 2

            [[campaigns]]
            kind = "cart_recovery"
            name = "Cart Recovery"
            trigger_policy = "replace"
            cancel_on_hard_bounce = false

            [[campaigns.steps]]
            step_index = 0
            offset_secs = 3600
            content_key = "cart_reminder"
            cancel_if = "purchase_completed"

            [[campaigns.steps]]
            step_index = 1
            offset_secs = 86400
            content_key = "cart_discount_code"
            cancel_if = "purchase_completed"
            "#,
        )
        .unwrap();

        assert_eq!(catalog.version(), 2);
        let cart = catalog.get(CampaignKind::CartRecovery).unwrap();
        assert_eq!(cart.steps.len(), 2);
        assert!(!cart.cancel_on_hard_bounce);
    }

    #[test]
    fn rejects_out_of_order_offsets() {
        let result = CampaignCatalog::from_toml_str(
            r#"
            version = 1

            [[campaigns]]
            kind = "welcome_series"
            name = "Welcome"
            trigger_policy = "idempotent_create"

            [[campaigns.steps]]
            step_index = 0
            offset_secs = 7200
            content_key = "a"

            [[campaigns.steps]]
            step_index = 1
            offset_secs = 3600
            content_key = "b"
            "#,
        );
        assert!(result.is_err());
    }

    #[test]
    fn rejects_non_contiguous_step_indices() {
        let result = CampaignCatalog::from_toml_str(
            r#"
            version = 1

            [[campaigns]]
            kind = "welcome_series"
            name = "Welcome"
            trigger_policy = "idempotent_create"

            [[campaigns.steps]]
            step_index = 1
            offset_secs = 3600
            content_key = "a"
            "#,
        );
        assert!(result.is_err());
    }

    #[test]
    fn rejects_version_zero() {
        let result = CampaignCatalog::from_toml_str(
            r#"
            version = 0
            campaigns = []
            "#,
        );
        assert!(result.is_err());
    }
}
