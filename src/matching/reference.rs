// src/matching/reference.rs - Matches payee names against the reference supplier dataset
use anyhow::{Context, Result};
use async_trait::async_trait;
use log::{debug, info};
use std::collections::{HashMap, HashSet};
use strsim::jaro_winkler;

use crate::matching::normalize::{name_tokens, normalize_payee_name};
use crate::matching::{MatchResult, Matcher, MatcherError};
use crate::models::LocationHints;
use crate::utils::db_connect::PgPool;

pub const DEFAULT_FUZZY_THRESHOLD: f64 = 0.92;
const LOCATION_AGREEMENT_BOOST: f64 = 0.03;
const STATE_CONFLICT_PENALTY: f64 = 0.06;
/// Tokens shorter than this are too common to narrow the candidate set.
const MIN_INDEX_TOKEN_LENGTH: usize = 3;

#[derive(Debug, Clone, PartialEq)]
pub struct ReferenceSupplier {
    pub id: String,
    pub name: String,
    pub normalized_name: String,
    pub city: Option<String>,
    pub state: Option<String>,
}

impl ReferenceSupplier {
    pub fn new(id: &str, name: &str, city: Option<&str>, state: Option<&str>) -> Self {
        Self {
            id: id.to_string(),
            name: name.to_string(),
            normalized_name: normalize_payee_name(name),
            city: city.map(|c| c.trim().to_lowercase()).filter(|c| !c.is_empty()),
            state: state.map(|s| s.trim().to_lowercase()).filter(|s| !s.is_empty()),
        }
    }

    /// Positive when the hints agree, negative when the state conflicts, zero when unknown.
    fn location_adjustment(&self, hints: &LocationHints) -> f64 {
        let hint_state = hints.normalized_state();
        let hint_city = hints.normalized_city();
        match (&self.state, &hint_state) {
            (Some(ours), Some(theirs)) if ours != theirs => -STATE_CONFLICT_PENALTY,
            (Some(_), Some(_)) => match (&self.city, &hint_city) {
                (Some(ours), Some(theirs)) if ours == theirs => LOCATION_AGREEMENT_BOOST,
                _ => 0.0,
            },
            _ => 0.0,
        }
    }
}

/// In-memory index over the reference suppliers: exact lookup by normalized name, then
/// Jaro-Winkler over suppliers that share at least one token.
pub struct ReferenceMatcher {
    suppliers: Vec<ReferenceSupplier>,
    by_name: HashMap<String, Vec<usize>>,
    by_token: HashMap<String, Vec<usize>>,
    fuzzy_threshold: f64,
}

impl ReferenceMatcher {
    pub fn from_suppliers(suppliers: Vec<ReferenceSupplier>, fuzzy_threshold: f64) -> Self {
        let mut by_name: HashMap<String, Vec<usize>> = HashMap::new();
        let mut by_token: HashMap<String, Vec<usize>> = HashMap::new();

        for (idx, supplier) in suppliers.iter().enumerate() {
            if supplier.normalized_name.is_empty() {
                continue;
            }
            by_name
                .entry(supplier.normalized_name.clone())
                .or_default()
                .push(idx);
            let unique: HashSet<&str> = name_tokens(&supplier.normalized_name)
                .into_iter()
                .filter(|t| t.len() >= MIN_INDEX_TOKEN_LENGTH)
                .collect();
            for token in unique {
                by_token.entry(token.to_string()).or_default().push(idx);
            }
        }

        Self {
            suppliers,
            by_name,
            by_token,
            fuzzy_threshold,
        }
    }

    /// Loads every active reference supplier into memory.
    pub async fn load(pool: &PgPool, fuzzy_threshold: f64) -> Result<Self> {
        let conn = pool
            .get()
            .await
            .context("Failed to get DB connection for ReferenceMatcher::load")?;

        let rows = conn
            .query(
                "SELECT id::text AS id, name, city, state
                 FROM payee_enrichment.reference_suppliers
                 WHERE active = TRUE",
                &[],
            )
            .await
            .context("Failed to query payee_enrichment.reference_suppliers")?;

        let suppliers: Vec<ReferenceSupplier> = rows
            .iter()
            .map(|row| {
                let city: Option<String> = row.get("city");
                let state: Option<String> = row.get("state");
                ReferenceSupplier::new(
                    row.get::<_, String>("id").as_str(),
                    row.get::<_, String>("name").as_str(),
                    city.as_deref(),
                    state.as_deref(),
                )
            })
            .collect();

        info!(
            "Loaded {} reference suppliers (fuzzy threshold {:.2})",
            suppliers.len(),
            fuzzy_threshold
        );
        Ok(Self::from_suppliers(suppliers, fuzzy_threshold))
    }

    pub fn len(&self) -> usize {
        self.suppliers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.suppliers.is_empty()
    }

    fn best_of<'a>(&'a self, indices: impl Iterator<Item = usize>, name: &str, hints: &LocationHints) -> Option<(&'a ReferenceSupplier, f64, f64)> {
        let mut best: Option<(&ReferenceSupplier, f64, f64)> = None;
        for idx in indices {
            let supplier = &self.suppliers[idx];
            let similarity = jaro_winkler(name, &supplier.normalized_name);
            let adjusted = (similarity + supplier.location_adjustment(hints)).clamp(0.0, 1.0);
            let better = match best {
                Some((_, _, current)) => adjusted > current,
                None => true,
            };
            if better {
                best = Some((supplier, similarity, adjusted));
            }
        }
        best
    }
}

#[async_trait]
impl Matcher for ReferenceMatcher {
    fn name(&self) -> &str {
        "reference_suppliers"
    }

    async fn match_name(&self, name: &str, hints: &LocationHints) -> Result<MatchResult, MatcherError> {
        let normalized = normalize_payee_name(name);
        if normalized.is_empty() {
            return Err(MatcherError::InvalidInput("empty payee name".to_string()));
        }

        if let Some(indices) = self.by_name.get(&normalized) {
            if let Some((supplier, _, adjusted)) = self.best_of(indices.iter().copied(), &normalized, hints) {
                let confidence = adjusted.max(0.9);
                return Ok(MatchResult::matched(
                    supplier.id.clone(),
                    confidence,
                    "exact",
                    format!(
                        "normalized name '{}' equals reference supplier '{}'",
                        normalized, supplier.name
                    ),
                ));
            }
        }

        let candidates: HashSet<usize> = name_tokens(&normalized)
            .into_iter()
            .filter(|t| t.len() >= MIN_INDEX_TOKEN_LENGTH)
            .filter_map(|t| self.by_token.get(t))
            .flatten()
            .copied()
            .collect();

        if candidates.is_empty() {
            return Ok(MatchResult::no_match(
                "fuzzy",
                format!("no reference supplier shares a token with '{}'", normalized),
            ));
        }

        debug!("'{}': scoring {} reference candidates", normalized, candidates.len());

        match self.best_of(candidates.into_iter(), &normalized, hints) {
            Some((supplier, similarity, adjusted)) if adjusted >= self.fuzzy_threshold => {
                Ok(MatchResult::matched(
                    supplier.id.clone(),
                    adjusted,
                    "fuzzy",
                    format!(
                        "jaro-winkler {:.3} (adjusted {:.3}) against '{}'",
                        similarity, adjusted, supplier.name
                    ),
                ))
            }
            Some((supplier, _, adjusted)) => Ok(MatchResult::no_match(
                "fuzzy",
                format!(
                    "best candidate '{}' scored {:.3}, below threshold {:.2}",
                    supplier.name, adjusted, self.fuzzy_threshold
                ),
            )),
            None => Ok(MatchResult::no_match("fuzzy", "no candidates scored")),
        }
    }
}
