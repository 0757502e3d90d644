// src/utils/pipeline_config.rs - Typed pipeline configuration loaded from the environment
use log::{info, warn};
use std::collections::HashMap;
use std::env;
use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use crate::models::StageDescriptor;

pub const DEFAULT_CHUNK_SIZE: usize = 50;
pub const DEFAULT_CONCURRENCY_LIMIT: usize = 20;
pub const DEFAULT_INTER_CHUNK_DELAY_MS: u64 = 100;
pub const DEFAULT_SCAN_INTERVAL_SECS: u64 = 60;
pub const DEFAULT_STALL_THRESHOLD_SECS: u64 = 300;

#[derive(Debug, thiserror::Error, PartialEq)]
pub enum ConfigError {
    #[error("Invalid value for field '{field}': {value}")]
    InvalidValue { field: String, value: String },

    #[error("Configuration validation failed: {reason}")]
    ValidationFailed { reason: String },
}

/// Recognized per-stage execution options.
#[derive(Debug, Clone, PartialEq)]
pub struct StageOptions {
    pub chunk_size: usize,
    pub concurrency_limit: usize,
    pub inter_chunk_delay_ms: u64,
    /// When false, records that already carry this stage's output are left out of the run.
    pub reprocess_existing: bool,
}

impl Default for StageOptions {
    fn default() -> Self {
        Self {
            chunk_size: DEFAULT_CHUNK_SIZE,
            concurrency_limit: DEFAULT_CONCURRENCY_LIMIT,
            inter_chunk_delay_ms: DEFAULT_INTER_CHUNK_DELAY_MS,
            reprocess_existing: false,
        }
    }
}

impl StageOptions {
    /// Rejects zero sizes and clamps the concurrency limit to the chunk size.
    pub fn validated(mut self, scope: &str) -> Result<Self, ConfigError> {
        if self.chunk_size == 0 {
            return Err(ConfigError::InvalidValue {
                field: format!("{}.chunk_size", scope),
                value: "0".to_string(),
            });
        }
        if self.concurrency_limit == 0 {
            return Err(ConfigError::InvalidValue {
                field: format!("{}.concurrency_limit", scope),
                value: "0".to_string(),
            });
        }
        if self.concurrency_limit > self.chunk_size {
            self.concurrency_limit = self.chunk_size;
        }
        Ok(self)
    }

    pub fn inter_chunk_delay(&self) -> Duration {
        Duration::from_millis(self.inter_chunk_delay_ms)
    }
}

/// What happens to the remaining stages once one stage fails.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailurePolicy {
    /// The first stage error fails the batch and later stages are not invoked.
    StopOnFirstFailure,
    /// Later stages still run; the batch ends failed if any stage failed.
    ContinueIndependentStages,
}

impl FailurePolicy {
    pub fn as_str(&self) -> &'static str {
        match self {
            FailurePolicy::StopOnFirstFailure => "stop_on_first_failure",
            FailurePolicy::ContinueIndependentStages => "continue_independent_stages",
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct WatchdogConfig {
    pub scan_interval: Duration,
    pub stall_threshold: Duration,
}

impl Default for WatchdogConfig {
    fn default() -> Self {
        Self {
            scan_interval: Duration::from_secs(DEFAULT_SCAN_INTERVAL_SECS),
            stall_threshold: Duration::from_secs(DEFAULT_STALL_THRESHOLD_SECS),
        }
    }
}

/// Per-stage settings: execution options plus the enable/order overrides applied to its descriptor.
#[derive(Debug, Clone, PartialEq)]
pub struct StageSettings {
    pub options: StageOptions,
    pub enabled: bool,
    pub order: Option<i32>,
}

impl Default for StageSettings {
    fn default() -> Self {
        Self {
            options: StageOptions::default(),
            enabled: true,
            order: None,
        }
    }
}

impl StageSettings {
    pub fn apply_to(&self, descriptor: StageDescriptor) -> StageDescriptor {
        let descriptor = descriptor.with_enabled(self.enabled);
        match self.order {
            Some(order) => descriptor.with_order(order),
            None => descriptor,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct PipelineConfig {
    pub defaults: StageOptions,
    pub stages: HashMap<String, StageSettings>,
    pub failure_policy: FailurePolicy,
    pub watchdog: WatchdogConfig,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            defaults: StageOptions::default(),
            stages: HashMap::new(),
            failure_policy: FailurePolicy::StopOnFirstFailure,
            watchdog: WatchdogConfig::default(),
        }
    }
}

/// Parsed value of `key`, or `default` when it is unset, blank or unparsable.
fn parse_or<T: FromStr + fmt::Debug>(lookup: &dyn Fn(&str) -> Option<String>, key: &str, default: T) -> T {
    match lookup(key) {
        None => default,
        Some(raw) if raw.trim().is_empty() => default,
        Some(raw) => raw.trim().parse::<T>().unwrap_or_else(|_| {
            warn!("Ignoring unparsable {}='{}', using default {:?}", key, raw, default);
            default
        }),
    }
}

impl PipelineConfig {
    /// Create configuration from environment variables for the given stage keys.
    pub fn from_env(stage_keys: &[&str]) -> Result<Self, ConfigError> {
        Self::from_lookup(&|key: &str| env::var(key).ok(), stage_keys)
    }

    /// Same as `from_env` over an arbitrary key lookup.
    ///
    /// Global keys: `PIPELINE_CHUNK_SIZE`, `PIPELINE_CONCURRENCY_LIMIT`, `PIPELINE_INTER_CHUNK_DELAY_MS`,
    /// `PIPELINE_REPROCESS_EXISTING`, `PIPELINE_CONTINUE_ON_STAGE_ERROR`, `WATCHDOG_SCAN_INTERVAL_SECS`,
    /// `WATCHDOG_STALL_THRESHOLD_SECS`. Per stage (upper-cased key as prefix): `_CHUNK_SIZE`,
    /// `_CONCURRENCY_LIMIT`, `_INTER_CHUNK_DELAY_MS`, `_REPROCESS_EXISTING`, `_ENABLED`, `_ORDER`.
    pub fn from_lookup(lookup: &dyn Fn(&str) -> Option<String>, stage_keys: &[&str]) -> Result<Self, ConfigError> {
        let defaults = StageOptions {
            chunk_size: parse_or(lookup, "PIPELINE_CHUNK_SIZE", DEFAULT_CHUNK_SIZE),
            concurrency_limit: parse_or(lookup, "PIPELINE_CONCURRENCY_LIMIT", DEFAULT_CONCURRENCY_LIMIT),
            inter_chunk_delay_ms: parse_or(lookup, "PIPELINE_INTER_CHUNK_DELAY_MS", DEFAULT_INTER_CHUNK_DELAY_MS),
            reprocess_existing: parse_or(lookup, "PIPELINE_REPROCESS_EXISTING", false),
        }
        .validated("pipeline")?;

        let mut stages = HashMap::new();
        for key in stage_keys {
            let prefix = key.to_uppercase();
            let options = StageOptions {
                chunk_size: parse_or(lookup, &format!("{}_CHUNK_SIZE", prefix), defaults.chunk_size),
                concurrency_limit: parse_or(
                    lookup,
                    &format!("{}_CONCURRENCY_LIMIT", prefix),
                    defaults.concurrency_limit,
                ),
                inter_chunk_delay_ms: parse_or(
                    lookup,
                    &format!("{}_INTER_CHUNK_DELAY_MS", prefix),
                    defaults.inter_chunk_delay_ms,
                ),
                reprocess_existing: parse_or(
                    lookup,
                    &format!("{}_REPROCESS_EXISTING", prefix),
                    defaults.reprocess_existing,
                ),
            }
            .validated(key)?;

            let order = match lookup(&format!("{}_ORDER", prefix)) {
                Some(raw) if !raw.trim().is_empty() => match raw.trim().parse::<i32>() {
                    Ok(order) => Some(order),
                    Err(_) => {
                        warn!("Ignoring unparsable {}_ORDER='{}', keeping declared order", prefix, raw);
                        None
                    }
                },
                _ => None,
            };

            stages.insert(
                key.to_string(),
                StageSettings {
                    options,
                    enabled: parse_or(lookup, &format!("{}_ENABLED", prefix), true),
                    order,
                },
            );
        }

        let failure_policy = if parse_or(lookup, "PIPELINE_CONTINUE_ON_STAGE_ERROR", false) {
            FailurePolicy::ContinueIndependentStages
        } else {
            FailurePolicy::StopOnFirstFailure
        };

        let scan_secs = parse_or(lookup, "WATCHDOG_SCAN_INTERVAL_SECS", DEFAULT_SCAN_INTERVAL_SECS);
        let stall_secs = parse_or(lookup, "WATCHDOG_STALL_THRESHOLD_SECS", DEFAULT_STALL_THRESHOLD_SECS);
        if scan_secs == 0 || stall_secs == 0 {
            return Err(ConfigError::ValidationFailed {
                reason: "watchdog interval and stall threshold must be positive".to_string(),
            });
        }

        Ok(Self {
            defaults,
            stages,
            failure_policy,
            watchdog: WatchdogConfig {
                scan_interval: Duration::from_secs(scan_secs),
                stall_threshold: Duration::from_secs(stall_secs),
            },
        })
    }

    pub fn settings_for(&self, stage_key: &str) -> StageSettings {
        self.stages.get(stage_key).cloned().unwrap_or_else(|| StageSettings {
            options: self.defaults.clone(),
            ..StageSettings::default()
        })
    }

    pub fn options_for(&self, stage_key: &str) -> StageOptions {
        self.settings_for(stage_key).options
    }

    pub fn log_config(&self) {
        info!("⚙️  Pipeline configuration:");
        info!(
            "   • Defaults: chunk size {}, concurrency {}, inter-chunk delay {}ms, reprocess existing: {}",
            self.defaults.chunk_size,
            self.defaults.concurrency_limit,
            self.defaults.inter_chunk_delay_ms,
            self.defaults.reprocess_existing
        );
        let mut keys: Vec<&String> = self.stages.keys().collect();
        keys.sort();
        for key in keys {
            let s = &self.stages[key];
            info!(
                "   • {}: enabled={}, order={:?}, chunk {}, concurrency {}, delay {}ms",
                key,
                s.enabled,
                s.order,
                s.options.chunk_size,
                s.options.concurrency_limit,
                s.options.inter_chunk_delay_ms
            );
        }
        info!("   • Failure policy: {}", self.failure_policy.as_str());
        info!(
            "   • Watchdog: scan every {}s, stall after {}s idle",
            self.watchdog.scan_interval.as_secs(),
            self.watchdog.stall_threshold.as_secs()
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn lookup_from(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key: &str| map.get(key).cloned()
    }

    #[test]
    fn test_default_config() {
        let config = PipelineConfig::from_lookup(&lookup_from(&[]), &["classification"]).unwrap();
        assert_eq!(config.defaults, StageOptions::default());
        assert_eq!(config.failure_policy, FailurePolicy::StopOnFirstFailure);
        assert_eq!(config.watchdog.stall_threshold, Duration::from_secs(300));
        let settings = config.settings_for("classification");
        assert!(settings.enabled);
        assert_eq!(settings.options.chunk_size, 50);
        assert_eq!(settings.options.concurrency_limit, 20);
    }

    #[test]
    fn test_stage_overrides() {
        let lookup = lookup_from(&[
            ("PIPELINE_CHUNK_SIZE", "80"),
            ("SUPPLIER_MATCH_CONCURRENCY_LIMIT", "5"),
            ("SUPPLIER_MATCH_ORDER", "5"),
            ("CLASSIFICATION_ENABLED", "false"),
            ("PIPELINE_CONTINUE_ON_STAGE_ERROR", "true"),
        ]);
        let config = PipelineConfig::from_lookup(&lookup, &["classification", "supplier_match"]).unwrap();

        let matching = config.settings_for("supplier_match");
        assert_eq!(matching.options.chunk_size, 80);
        assert_eq!(matching.options.concurrency_limit, 5);
        assert_eq!(matching.order, Some(5));
        assert!(!config.settings_for("classification").enabled);
        assert_eq!(config.failure_policy, FailurePolicy::ContinueIndependentStages);
    }

    #[test]
    fn test_concurrency_clamped_to_chunk_size() {
        let lookup = lookup_from(&[("PIPELINE_CHUNK_SIZE", "10"), ("PIPELINE_CONCURRENCY_LIMIT", "25")]);
        let config = PipelineConfig::from_lookup(&lookup, &[]).unwrap();
        assert_eq!(config.defaults.concurrency_limit, 10);
    }

    #[test]
    fn test_invalid_values_rejected() {
        let zero = lookup_from(&[("PIPELINE_CHUNK_SIZE", "0")]);
        assert!(matches!(
            PipelineConfig::from_lookup(&zero, &[]),
            Err(ConfigError::InvalidValue { .. })
        ));

        let no_watchdog = lookup_from(&[("WATCHDOG_STALL_THRESHOLD_SECS", "0")]);
        assert!(matches!(
            PipelineConfig::from_lookup(&no_watchdog, &[]),
            Err(ConfigError::ValidationFailed { .. })
        ));
    }

    #[test]
    fn test_unparsable_values_fall_back_to_defaults() {
        let garbage = lookup_from(&[
            ("SUPPLIER_MATCH_CHUNK_SIZE", "lots"),
            ("SUPPLIER_MATCH_ORDER", "first"),
            ("PIPELINE_REPROCESS_EXISTING", "maybe"),
            ("WATCHDOG_SCAN_INTERVAL_SECS", "often"),
        ]);
        let config = PipelineConfig::from_lookup(&garbage, &["supplier_match"]).unwrap();

        let settings = config.settings_for("supplier_match");
        assert_eq!(settings.options.chunk_size, DEFAULT_CHUNK_SIZE);
        assert_eq!(settings.order, None);
        assert!(!config.defaults.reprocess_existing);
        assert_eq!(
            config.watchdog.scan_interval,
            Duration::from_secs(DEFAULT_SCAN_INTERVAL_SECS)
        );
    }

    #[test]
    fn test_unknown_stage_uses_defaults() {
        let config = PipelineConfig::from_lookup(&lookup_from(&[("PIPELINE_INTER_CHUNK_DELAY_MS", "0")]), &[]).unwrap();
        let options = config.options_for("external_lookup");
        assert_eq!(options.inter_chunk_delay_ms, 0);
        assert_eq!(options.inter_chunk_delay(), Duration::ZERO);
    }
}
