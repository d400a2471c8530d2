//! Deterministic classification used when no model verdict is available.

use super::classify::{Classification, ClassificationSource};
use crate::content::ParsedEmail;

const SOCIAL_DOMAINS: &[&str] = &[
    "facebookmail.com",
    "linkedin.com",
    "twitter.com",
    "x.com",
    "instagram.com",
    "pinterest.com",
    "reddit.com",
    "discord.com",
    "mastodon.social",
];

const PROMOTIONAL_KEYWORDS: &[&str] = &[
    "% off",
    "sale",
    "discount",
    "deal",
    "coupon",
    "promo",
    "limited time",
    "special offer",
    "free shipping",
    "shop now",
];

const TRANSACTIONAL_KEYWORDS: &[&str] = &[
    "receipt",
    "invoice",
    "order",
    "shipped",
    "shipping",
    "delivery",
    "delivered",
    "payment",
    "confirmation",
    "booking",
    "statement",
    "password reset",
    "verification code",
];

#[derive(Debug, Clone, Copy, Default)]
pub struct RuleClassifier;

impl RuleClassifier {
    pub fn classify(&self, email: &ParsedEmail) -> Classification {
        let subject = email.subject.as_deref().unwrap_or("").to_lowercase();
        let body = email.body.to_lowercase();
        let sender_domain = email
            .sender
            .as_deref()
            .and_then(extract_domain)
            .map(str::to_lowercase);

        let (category, tag) = if let Some(domain) = sender_domain
            .as_deref()
            .filter(|d| SOCIAL_DOMAINS.iter().any(|s| d == s || d.ends_with(&format!(".{s}"))))
        {
            ("social", domain.to_string())
        } else if let Some(kw) = find_keyword(&subject, TRANSACTIONAL_KEYWORDS) {
            ("transactional", kw.to_string())
        } else if let Some(kw) = find_keyword(&subject, PROMOTIONAL_KEYWORDS)
            .or_else(|| find_keyword(&body, PROMOTIONAL_KEYWORDS).filter(|_| is_bulk(email)))
        {
            ("promotional", kw.to_string())
        } else if is_bulk(email) {
            ("newsletter", "list-unsubscribe".to_string())
        } else {
            ("important", "personal".to_string())
        };

        Classification {
            category: category.to_string(),
            confidence: 0.5,
            reasoning: format!("rule-based fallback matched {tag:?}"),
            is_important: category == "important",
            tags: vec![tag],
            source: ClassificationSource::Rules,
        }
    }
}

fn is_bulk(email: &ParsedEmail) -> bool {
    email.has_list_unsubscribe || email.mentions_unsubscribe
}

fn find_keyword(haystack: &str, keywords: &[&'static str]) -> Option<&'static str> {
    keywords.iter().copied().find(|kw| haystack.contains(kw))
}

/// Domain of an address, accepting the `Name <user@host>` form.
fn extract_domain(sender: &str) -> Option<&str> {
    let at_index = sender.rfind('@')?;
    let domain = sender[at_index + 1..].trim_end_matches('>').trim();
    if domain.is_empty() { None } else { Some(domain) }
}
