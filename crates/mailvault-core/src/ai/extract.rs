use std::collections::BTreeMap;

use schemars::{JsonSchema, schema_for};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use super::parse::parse_json_lenient;
use super::{ChatMessage, CompletionRequest, LLMError};
use crate::config::AiConfig;
use crate::content::ParsedEmail;

/// Characters of cleaned body shown to the extractor.
pub const EXTRACT_BODY_CHARS: usize = 2500;

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct Entities {
    #[serde(default)]
    pub organizations: Vec<String>,
    #[serde(default)]
    pub people: Vec<String>,
    #[serde(default)]
    pub dates: Vec<String>,
    #[serde(default)]
    pub monetary_values: Vec<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct StructuredData {
    /// Document type, e.g. invoice, meeting, shipping, other.
    #[serde(rename = "type", default)]
    pub doc_type: String,
    #[serde(default)]
    pub fields: BTreeMap<String, Value>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct Extraction {
    /// At most two sentences.
    #[serde(default)]
    pub summary: String,
    #[serde(default)]
    pub entities: Entities,
    #[serde(default)]
    pub structured_data: StructuredData,
    #[serde(default)]
    pub action_items: Vec<String>,
}

#[derive(Debug, Clone)]
pub struct Extractor {
    temperature: f32,
    max_tokens: u32,
    schema: String,
}

impl Extractor {
    pub fn from_config(cfg: &AiConfig) -> Self {
        let schema = serde_json::to_string_pretty(&schema_for!(Extraction))
            .unwrap_or_else(|_| "{}".to_string());
        Self {
            temperature: cfg.extraction_temperature,
            max_tokens: cfg.max_output_tokens,
            schema,
        }
    }

    pub fn build_request(&self, email: &ParsedEmail) -> CompletionRequest {
        let prompt = format!(
            "EMAIL CONTENT:\n{email}\n\n\
             INSTRUCTIONS:\n\
             Extract structured data from the email above.\n\n\
             Guidelines:\n\
             - Summary: High-level TL;DR (max 2 sentences).\n\
             - Entities: Specific organizations, people, dates, amounts.\n\
             - Structured Data: Identify type (invoice/meeting/etc) and key fields.\n\
             - Action Items: Tasks or deadlines for the recipient.\n\n\
             The output must be a JSON object matching this JSON Schema:\n{schema}\n\n\
             Return ONLY JSON.",
            email = email.prompt_block(EXTRACT_BODY_CHARS),
            schema = self.schema,
        );

        CompletionRequest {
            messages: vec![
                ChatMessage::system("You are a data extraction assistant."),
                ChatMessage::user(prompt),
            ],
            temperature: self.temperature,
            max_tokens: self.max_tokens,
            json_mode: true,
        }
    }

    pub fn parse_response(&self, raw: &str) -> Result<Extraction, LLMError> {
        parse_json_lenient(raw)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn request_embeds_schema_and_longer_preview() {
        let extractor = Extractor::from_config(&AiConfig::default());
        let email = ParsedEmail {
            subject: Some("Invoice #42".into()),
            body: "x".repeat(4000),
            ..ParsedEmail::default()
        };
        let request = extractor.build_request(&email);
        let prompt = &request.messages[1].content;

        assert!((request.temperature - 0.1).abs() < 1e-6);
        assert!(prompt.contains("monetary_values"));
        assert!(prompt.contains("action_items"));
        assert!(prompt.contains(&"x".repeat(EXTRACT_BODY_CHARS)));
        assert!(!prompt.contains(&"x".repeat(EXTRACT_BODY_CHARS + 1)));
    }

    #[test]
    fn parses_fenced_reply_with_partial_fields() {
        let raw = "```json\n{\n  \"summary\": \"Invoice due Friday.\",\n  \
                   \"entities\": {\"organizations\": [\"Acme\"]},\n  \
                   \"structured_data\": {\"type\": \"invoice\", \"fields\": {\"amount\": \"$10.00\"}}\n}\n```";
        let extraction = Extractor::from_config(&AiConfig::default())
            .parse_response(raw)
            .expect("parse");

        assert_eq!(extraction.summary, "Invoice due Friday.");
        assert_eq!(extraction.entities.organizations, vec!["Acme".to_string()]);
        assert!(extraction.entities.people.is_empty());
        assert_eq!(extraction.structured_data.doc_type, "invoice");
        assert_eq!(extraction.structured_data.fields["amount"], "$10.00");
        assert!(extraction.action_items.is_empty());
    }
}
