// src/matching/mod.rs
pub mod classifier;
pub mod normalize;
pub mod reference;
pub mod timeout;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::time::Duration;

use crate::models::LocationHints;

/// What a matcher decided for one name.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MatchResult {
    pub matched: bool,
    pub candidate_id: Option<String>,
    /// 0.0..=1.0 when present.
    pub confidence: Option<f64>,
    pub method: String,
    pub reasoning: String,
}

impl MatchResult {
    pub fn matched(candidate_id: impl Into<String>, confidence: f64, method: &str, reasoning: impl Into<String>) -> Self {
        Self {
            matched: true,
            candidate_id: Some(candidate_id.into()),
            confidence: Some(confidence.clamp(0.0, 1.0)),
            method: method.to_string(),
            reasoning: reasoning.into(),
        }
    }

    pub fn no_match(method: &str, reasoning: impl Into<String>) -> Self {
        Self {
            matched: false,
            candidate_id: None,
            confidence: None,
            method: method.to_string(),
            reasoning: reasoning.into(),
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum MatcherError {
    #[error("matcher timed out after {0:?}")]
    Timeout(Duration),

    #[error("matcher unavailable: {0}")]
    Unavailable(String),

    #[error("invalid matcher input: {0}")]
    InvalidInput(String),
}

impl MatcherError {
    /// Timeouts and outages may succeed on a later attempt; bad input will not.
    pub fn is_transient(&self) -> bool {
        matches!(self, MatcherError::Timeout(_) | MatcherError::Unavailable(_))
    }
}

/// Opaque matching capability consumed by matcher-backed stages.
#[async_trait]
pub trait Matcher: Send + Sync {
    fn name(&self) -> &str;

    async fn match_name(&self, name: &str, hints: &LocationHints) -> Result<MatchResult, MatcherError>;
}
