use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use super::parse::parse_json_lenient;
use super::{ChatMessage, CompletionRequest, LLMError};
use crate::config::AiConfig;
use crate::content::ParsedEmail;

/// Characters of cleaned body shown to the classifier.
pub const CLASSIFY_BODY_CHARS: usize = 1000;

const SYSTEM_PROMPT: &str =
    "You are an email classification assistant. Classify emails accurately and provide reasoning.";

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "lowercase")]
pub enum ClassificationSource {
    #[default]
    Model,
    Rules,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct Classification {
    pub category: String,
    #[serde(default)]
    pub confidence: f32,
    #[serde(default)]
    pub reasoning: String,
    #[serde(default)]
    pub is_important: bool,
    #[serde(default)]
    pub tags: Vec<String>,
    #[serde(default)]
    pub source: ClassificationSource,
}

/// Builds classification prompts and interprets the replies against a
/// fixed label set.
#[derive(Debug, Clone)]
pub struct Classifier {
    categories: Vec<String>,
    skip_categories: Vec<String>,
    temperature: f32,
    max_tokens: u32,
}

impl Classifier {
    pub fn from_config(cfg: &AiConfig) -> Self {
        Self {
            categories: cfg.categories.iter().map(|c| c.to_lowercase()).collect(),
            skip_categories: cfg.skip_categories.iter().map(|c| c.to_lowercase()).collect(),
            temperature: cfg.classification_temperature,
            max_tokens: cfg.max_output_tokens,
        }
    }

    pub fn categories(&self) -> &[String] {
        &self.categories
    }

    pub fn build_request(&self, email: &ParsedEmail) -> CompletionRequest {
        let prompt = format!(
            "Classify the following email into one of these categories: {categories}\n\n\
             {email}\n\n\
             Provide your response as JSON with the following structure:\n\
             {{\n  \"category\": \"one of the categories\",\n  \"confidence\": 0.0-1.0,\n  \
             \"reasoning\": \"brief explanation\",\n  \"is_important\": true/false,\n  \
             \"tags\": [\"tag1\", \"tag2\"]\n}}\n\n\
             Guidelines:\n\
             - \"important\": Work-related, urgent, from known contacts, requires action\n\
             - \"promotional\": Marketing, sales, offers, discounts\n\
             - \"transactional\": Receipts, confirmations, shipping notifications\n\
             - \"social\": Social media notifications, friend requests\n\
             - \"newsletter\": Subscribed content, regular updates\n\
             - \"spam\": Unsolicited, suspicious, phishing attempts\n\n\
             Return ONLY JSON.",
            categories = self.categories.join(", "),
            email = email.prompt_block(CLASSIFY_BODY_CHARS),
        );

        CompletionRequest {
            messages: vec![ChatMessage::system(SYSTEM_PROMPT), ChatMessage::user(prompt)],
            temperature: self.temperature,
            max_tokens: self.max_tokens,
            json_mode: true,
        }
    }

    pub fn parse_response(&self, raw: &str) -> Result<Classification, LLMError> {
        let mut classification: Classification = parse_json_lenient(raw)?;
        classification.category = self.normalize_category(&classification.category)?;
        classification.confidence = classification.confidence.clamp(0.0, 1.0);
        classification.source = ClassificationSource::Model;
        Ok(classification)
    }

    /// Maps a free-form label onto the configured set. Exact matches win,
    /// then a label contained in the reply ("Promotional email").
    fn normalize_category(&self, raw: &str) -> Result<String, LLMError> {
        let label = raw.trim().to_lowercase();
        if self.categories.contains(&label) {
            return Ok(label);
        }
        self.categories
            .iter()
            .find(|c| label.contains(c.as_str()))
            .cloned()
            .ok_or_else(|| LLMError::ParseError(format!("category {raw:?} is not a known label")))
    }

    /// Only model verdicts can filter a message out of the archive.
    pub fn should_skip(&self, classification: &Classification) -> bool {
        classification.source == ClassificationSource::Model
            && self
                .skip_categories
                .contains(&classification.category.to_lowercase())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn classifier() -> Classifier {
        Classifier::from_config(&AiConfig {
            skip_categories: vec!["Spam".into()],
            ..AiConfig::default()
        })
    }

    #[test]
    fn request_carries_labels_and_preview() {
        let email = ParsedEmail {
            subject: Some("Your order shipped".into()),
            sender: Some("shop@example.com".into()),
            body: "b".repeat(3000),
            ..ParsedEmail::default()
        };
        let request = classifier().build_request(&email);

        assert_eq!(request.messages.len(), 2);
        assert!(request.json_mode);
        assert!((request.temperature - 0.3).abs() < 1e-6);
        let prompt = &request.messages[1].content;
        assert!(prompt.contains("important, promotional, transactional, social, newsletter, spam"));
        assert!(prompt.contains("Subject: Your order shipped"));
        assert!(prompt.contains(&"b".repeat(CLASSIFY_BODY_CHARS)));
        assert!(!prompt.contains(&"b".repeat(CLASSIFY_BODY_CHARS + 1)));
    }

    #[test]
    fn parse_normalizes_category_and_confidence() {
        let c = classifier()
            .parse_response(r#"{"category": "Promotional Email", "confidence": 1.7, "tags": ["sale"]}"#)
            .expect("parse");
        assert_eq!(c.category, "promotional");
        assert_eq!(c.confidence, 1.0);
        assert_eq!(c.tags, vec!["sale".to_string()]);
        assert_eq!(c.source, ClassificationSource::Model);
    }

    #[test]
    fn unknown_category_is_parse_error() {
        let err = classifier()
            .parse_response(r#"{"category": "recipes"}"#)
            .expect_err("unknown label");
        assert!(matches!(err, LLMError::ParseError(_)));
    }

    #[test]
    fn skip_applies_only_to_model_verdicts() {
        let classifier = classifier();
        let mut c = classifier
            .parse_response(r#"{"category": "spam", "confidence": 0.9}"#)
            .expect("parse");
        assert!(classifier.should_skip(&c));
        c.source = ClassificationSource::Rules;
        assert!(!classifier.should_skip(&c));
    }

    #[test]
    fn legacy_shape_without_source_deserializes() {
        let c: Classification = serde_json::from_value(serde_json::json!({
            "category": "newsletter",
            "confidence": 0.5,
            "reasoning": "weekly digest",
            "is_important": false,
            "tags": []
        }))
        .expect("deserialize");
        assert_eq!(c.source, ClassificationSource::Model);
    }
}
