//! Content Renderer contract and the default template renderer.
//!
//! Rendering is a pure function of `(content_key, binding_data)` — no I/O —
//! so a step renders identically no matter when or how often it runs.

use std::collections::HashMap;

use cadence_core::types::RenderedMessage;
use cadence_core::{SequencerError, SequencerResult};
use chrono::Utc;

/// External collaborator producing the message for a step.
pub trait ContentRenderer: Send + Sync {
    fn render(
        &self,
        content_key: &str,
        binding_data: &serde_json::Value,
    ) -> SequencerResult<RenderedMessage>;
}

/// A registered message template using `{{variable}}` syntax.
#[derive(Debug, Clone)]
pub struct MessageTemplate {
    pub content_key: String,
    pub subject: String,
    pub html_body: String,
    pub text_body: String,
    /// Binding fields that must be present; a missing field fails the render.
    pub required_fields: Vec<String>,
}

/// Simple template renderer keyed by content key.
pub struct TemplateRenderer {
    templates: HashMap<String, MessageTemplate>,
}

impl TemplateRenderer {
    pub fn new() -> Self {
        Self {
            templates: HashMap::new(),
        }
    }

    pub fn register(&mut self, template: MessageTemplate) {
        self.templates.insert(template.content_key.clone(), template);
    }

    /// Renderer pre-loaded with placeholder templates for every content key
    /// in the built-in catalog. Marketing copy lives outside this repository;
    /// these bodies are intentionally skeletal.
    pub fn builtin() -> Self {
        let mut renderer = Self::new();

        let plain = |key: &str, subject: &str| MessageTemplate {
            content_key: key.to_string(),
            subject: subject.to_string(),
            html_body: format!("<p>{{{{first_name}}}}, {subject}.</p>"),
            text_body: format!("{{{{first_name}}}}, {subject}."),
            required_fields: vec![],
        };

        renderer.register(plain("welcome_intro", "Welcome aboard"));
        renderer.register(plain("welcome_getting_started", "Getting the most from your account"));
        renderer.register(plain("welcome_social_proof", "What our customers say"));
        renderer.register(plain("welcome_first_order_offer", "A little something for your first order"));

        renderer.register(MessageTemplate {
            content_key: "cart_reminder".to_string(),
            subject: "You left something behind".to_string(),
            html_body: "<p>Your cart ({{cart_total}}) is waiting.</p>".to_string(),
            text_body: "Your cart ({{cart_total}}) is waiting.".to_string(),
            required_fields: vec!["cart_total".to_string()],
        });
        renderer.register(MessageTemplate {
            content_key: "cart_still_waiting".to_string(),
            subject: "Still thinking it over?".to_string(),
            html_body: "<p>Your cart ({{cart_total}}) is still here.</p>".to_string(),
            text_body: "Your cart ({{cart_total}}) is still here.".to_string(),
            required_fields: vec!["cart_total".to_string()],
        });
        renderer.register(MessageTemplate {
            content_key: "cart_discount_code".to_string(),
            subject: "10% off to finish your order".to_string(),
            html_body: "<p>Use code {{discount_code}} on your {{cart_total}} cart.</p>".to_string(),
            text_body: "Use code {{discount_code}} on your {{cart_total}} cart.".to_string(),
            required_fields: vec!["cart_total".to_string(), "discount_code".to_string()],
        });

        renderer.register(MessageTemplate {
            content_key: "review_ask".to_string(),
            subject: "How was your order?".to_string(),
            html_body: "<p>Tell us about order {{order_number}}.</p>".to_string(),
            text_body: "Tell us about order {{order_number}}.".to_string(),
            required_fields: vec!["order_number".to_string()],
        });
        renderer.register(MessageTemplate {
            content_key: "review_nudge".to_string(),
            subject: "A minute for a review?".to_string(),
            html_body: "<p>Order {{order_number}} — we'd love your feedback.</p>".to_string(),
            text_body: "Order {{order_number}} — we'd love your feedback.".to_string(),
            required_fields: vec!["order_number".to_string()],
        });

        for i in 1..=12u32 {
            renderer.register(plain(
                &format!("course_lesson_{i:02}"),
                &format!("Lesson {i} is ready"),
            ));
        }

        renderer
    }

    fn substitute(template_str: &str, bindings: &serde_json::Map<String, serde_json::Value>) -> String {
        let mut result = template_str.to_string();
        for (name, value) in bindings {
            let placeholder = format!("{{{{{name}}}}}");
            let text = match value {
                serde_json::Value::String(s) => s.clone(),
                other => other.to_string(),
            };
            result = result.replace(&placeholder, &text);
        }
        result
    }
}

impl Default for TemplateRenderer {
    fn default() -> Self {
        Self::new()
    }
}

impl ContentRenderer for TemplateRenderer {
    fn render(
        &self,
        content_key: &str,
        binding_data: &serde_json::Value,
    ) -> SequencerResult<RenderedMessage> {
        let template = self.templates.get(content_key).ok_or_else(|| {
            SequencerError::Render {
                content_key: content_key.to_string(),
                message: "no template registered".to_string(),
            }
        })?;

        let empty = serde_json::Map::new();
        let bindings = binding_data.as_object().unwrap_or(&empty);

        for field in &template.required_fields {
            if !bindings.contains_key(field) {
                return Err(SequencerError::Render {
                    content_key: content_key.to_string(),
                    message: format!("missing binding field '{field}'"),
                });
            }
        }

        Ok(RenderedMessage {
            content_key: content_key.to_string(),
            subject: Self::substitute(&template.subject, bindings),
            html_body: Self::substitute(&template.html_body, bindings),
            text_body: Self::substitute(&template.text_body, bindings),
            rendered_at: Utc::now(),
        })
    }
}
