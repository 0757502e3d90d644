// src/matching/classifier.rs - Rule-based payee classification
use crate::matching::normalize::{name_tokens, normalize_payee_name};
use crate::models::{Classification, PayeeClass};

const GOVERNMENT_PHRASES: [&str; 12] = [
    "city of",
    "county of",
    "state of",
    "town of",
    "village of",
    "department of",
    "school district",
    "internal revenue",
    "water district",
    "port of",
    "housing authority",
    "transit authority",
];

const GOVERNMENT_TOKENS: [&str; 7] = [
    "county", "municipal", "treasurer", "treasury", "irs", "dept", "township",
];

/// Tokens that survive normalization but still mark an organisation.
const BUSINESS_TOKENS: [&str; 28] = [
    "services", "service", "supply", "supplies", "solutions", "systems", "group",
    "associates", "partners", "enterprises", "industries", "consulting", "construction",
    "electric", "plumbing", "bank", "insurance", "logistics", "technologies", "tech",
    "manufacturing", "distributors", "wholesale", "store", "market", "foods", "motors",
    "and",
];

/// Legal-form markers checked against the raw name, since normalization strips them.
const LEGAL_FORM_TOKENS: [&str; 8] = ["inc", "llc", "corp", "ltd", "co", "lp", "llp", "plc"];

#[derive(Debug, Clone, Default)]
pub struct PayeeClassifier;

impl PayeeClassifier {
    pub fn new() -> Self {
        Self
    }

    pub fn classify(&self, raw_name: &str) -> Classification {
        let normalized = normalize_payee_name(raw_name);
        if normalized.is_empty() {
            return Classification {
                class: PayeeClass::Unknown,
                confidence: 0.0,
                reasoning: "empty name after normalization".to_string(),
            };
        }

        if let Some(phrase) = GOVERNMENT_PHRASES.iter().find(|p| normalized.contains(*p)) {
            return Classification {
                class: PayeeClass::Government,
                confidence: 0.95,
                reasoning: format!("government phrase '{}'", phrase),
            };
        }

        let tokens = name_tokens(&normalized);
        if let Some(token) = tokens.iter().find(|t| GOVERNMENT_TOKENS.contains(*t)) {
            return Classification {
                class: PayeeClass::Government,
                confidence: 0.85,
                reasoning: format!("government keyword '{}'", token),
            };
        }

        let raw_lower = raw_name.to_lowercase();
        let raw_tokens: Vec<&str> = raw_lower
            .split(|c: char| !c.is_ascii_alphanumeric())
            .filter(|t| !t.is_empty())
            .collect();
        if let Some(form) = raw_tokens.iter().find(|t| LEGAL_FORM_TOKENS.contains(*t)) {
            return Classification {
                class: PayeeClass::Business,
                confidence: 0.95,
                reasoning: format!("legal form '{}'", form),
            };
        }

        if let Some(token) = tokens.iter().find(|t| BUSINESS_TOKENS.contains(*t)) {
            return Classification {
                class: PayeeClass::Business,
                confidence: 0.8,
                reasoning: format!("business keyword '{}'", token),
            };
        }

        let looks_personal = (2..=3).contains(&tokens.len())
            && tokens.iter().all(|t| t.chars().all(|c| c.is_ascii_alphabetic()));
        if looks_personal {
            return Classification {
                class: PayeeClass::Individual,
                confidence: 0.6,
                reasoning: format!("{} alphabetic tokens with no organisation markers", tokens.len()),
            };
        }

        Classification {
            class: PayeeClass::Unknown,
            confidence: 0.3,
            reasoning: "no classification rule applied".to_string(),
        }
    }
}
