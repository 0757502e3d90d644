// src/matching/timeout.rs
use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;

use crate::matching::{MatchResult, Matcher, MatcherError};
use crate::models::LocationHints;

/// Bounds every call to the inner matcher; an elapsed call becomes a transient `MatcherError::Timeout`.
pub struct TimeoutMatcher {
    inner: Arc<dyn Matcher>,
    limit: Duration,
}

impl TimeoutMatcher {
    pub fn new(inner: Arc<dyn Matcher>, limit: Duration) -> Self {
        Self { inner, limit }
    }
}

#[async_trait]
impl Matcher for TimeoutMatcher {
    fn name(&self) -> &str {
        self.inner.name()
    }

    async fn match_name(&self, name: &str, hints: &LocationHints) -> Result<MatchResult, MatcherError> {
        match tokio::time::timeout(self.limit, self.inner.match_name(name, hints)).await {
            Ok(result) => result,
            Err(_) => Err(MatcherError::Timeout(self.limit)),
        }
    }
}
