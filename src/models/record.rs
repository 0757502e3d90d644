// src/models/record.rs
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use crate::matching::normalize::normalize_payee_name;
use crate::matching::MatchResult;
use crate::models::batch::BatchId;

pub type RecordId = String;

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct LocationHints {
    pub city: Option<String>,
    pub state: Option<String>,
}

impl LocationHints {
    pub fn new(city: Option<&str>, state: Option<&str>) -> Self {
        Self {
            city: city.map(|c| c.to_string()),
            state: state.map(|s| s.to_string()),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.normalized_city().is_none() && self.normalized_state().is_none()
    }

    pub fn normalized_city(&self) -> Option<String> {
        normalize_hint(self.city.as_deref())
    }

    pub fn normalized_state(&self) -> Option<String> {
        normalize_hint(self.state.as_deref())
    }
}

fn normalize_hint(value: Option<&str>) -> Option<String> {
    value
        .map(|v| v.trim().to_lowercase())
        .filter(|v| !v.is_empty())
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PayeeClass {
    Business,
    Government,
    Individual,
    Unknown,
}

impl PayeeClass {
    pub fn as_str(&self) -> &'static str {
        match self {
            PayeeClass::Business => "business",
            PayeeClass::Government => "government",
            PayeeClass::Individual => "individual",
            PayeeClass::Unknown => "unknown",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "business" => Some(PayeeClass::Business),
            "government" => Some(PayeeClass::Government),
            "individual" => Some(PayeeClass::Individual),
            "unknown" => Some(PayeeClass::Unknown),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Classification {
    pub class: PayeeClass,
    pub confidence: f64,
    pub reasoning: String,
}

/// Output of a matching stage for one record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StageEnrichment {
    pub candidate_id: Option<String>,
    pub confidence: Option<f64>,
    pub method: String,
    pub reasoning: String,
    pub enriched_at: DateTime<Utc>,
}

impl StageEnrichment {
    pub fn from_match(result: &MatchResult, at: DateTime<Utc>) -> Self {
        Self {
            candidate_id: result.candidate_id.clone(),
            confidence: result.confidence,
            method: result.method.clone(),
            reasoning: result.reasoning.clone(),
            enriched_at: at,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PayeeRecord {
    pub id: RecordId,
    pub batch_id: BatchId,
    pub raw_name: String,
    pub normalized_name: Option<String>,
    pub location: LocationHints,
    pub classification: Option<Classification>,
    /// Keyed by stage key.
    pub enrichments: BTreeMap<String, StageEnrichment>,
}

impl PayeeRecord {
    pub fn new(id: impl Into<RecordId>, batch_id: impl Into<BatchId>, raw_name: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            batch_id: batch_id.into(),
            raw_name: raw_name.into(),
            normalized_name: None,
            location: LocationHints::default(),
            classification: None,
            enrichments: BTreeMap::new(),
        }
    }

    /// Stored normalized name when the upload step produced one, otherwise normalized on the fly.
    pub fn matchable_name(&self) -> String {
        match &self.normalized_name {
            Some(name) if !name.trim().is_empty() => name.clone(),
            _ => normalize_payee_name(&self.raw_name),
        }
    }

    pub fn has_enrichment(&self, stage_key: &str) -> bool {
        self.enrichments.contains_key(stage_key)
    }

    pub fn payee_class(&self) -> Option<PayeeClass> {
        self.classification.as_ref().map(|c| c.class)
    }
}

/// A single-record write. Each variant overwrites its own fields, so retries replace rather than append.
#[derive(Debug, Clone, PartialEq)]
pub enum RecordUpdate {
    Classification(Classification),
    Enrichment {
        stage: String,
        enrichment: StageEnrichment,
    },
}

impl RecordUpdate {
    pub fn apply_to(&self, record: &mut PayeeRecord) {
        match self {
            RecordUpdate::Classification(classification) => {
                record.classification = Some(classification.clone());
            }
            RecordUpdate::Enrichment { stage, enrichment } => {
                record.enrichments.insert(stage.clone(), enrichment.clone());
            }
        }
    }
}
