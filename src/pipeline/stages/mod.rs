// src/pipeline/stages/mod.rs
pub mod classification;
pub mod matcher_stage;

use indicatif::MultiProgress;
use std::sync::Arc;

use crate::matching::Matcher;
use crate::models::StageDescriptor;
use crate::pipeline::stage::Stage;
use crate::store::SharedStore;
use crate::utils::pipeline_config::PipelineConfig;

pub use classification::ClassificationStage;
pub use matcher_stage::MatcherStage;

pub const CLASSIFICATION: &str = "classification";
pub const SUPPLIER_MATCH: &str = "supplier_match";

/// Keys of the stages the binary assembles, in declaration order.
pub const DEFAULT_STAGE_KEYS: [&str; 2] = [CLASSIFICATION, SUPPLIER_MATCH];

/// Descriptors of the default pipeline with the configured enable/order overrides applied.
pub fn default_descriptors(config: &PipelineConfig) -> Vec<StageDescriptor> {
    vec![
        StageDescriptor::new(CLASSIFICATION, "Payee classification", 10),
        StageDescriptor::new(SUPPLIER_MATCH, "Supplier matching", 20),
    ]
    .into_iter()
    .map(|d| config.settings_for(&d.key).apply_to(d))
    .collect()
}

pub fn build_default_stages(
    store: SharedStore,
    supplier_matcher: Arc<dyn Matcher>,
    config: &PipelineConfig,
    multi_progress: Option<MultiProgress>,
) -> Vec<Arc<dyn Stage>> {
    let mut stages: Vec<Arc<dyn Stage>> = Vec::new();
    for descriptor in default_descriptors(config) {
        let stage: Arc<dyn Stage> = match descriptor.key.as_str() {
            CLASSIFICATION => Arc::new(
                ClassificationStage::new(descriptor, store.clone())
                    .with_progress(multi_progress.clone()),
            ),
            _ => Arc::new(
                MatcherStage::new(descriptor, store.clone(), supplier_matcher.clone())
                    .with_progress(multi_progress.clone()),
            ),
        };
        stages.push(stage);
    }
    stages
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::utils::pipeline_config::StageSettings;

    #[test]
    fn test_default_descriptors_follow_config() {
        let mut config = PipelineConfig::default();
        assert_eq!(
            default_descriptors(&config)
                .iter()
                .map(|d| (d.key.as_str(), d.order, d.enabled))
                .collect::<Vec<_>>(),
            vec![(CLASSIFICATION, 10, true), (SUPPLIER_MATCH, 20, true)]
        );

        config.stages.insert(
            SUPPLIER_MATCH.to_string(),
            StageSettings {
                enabled: false,
                order: Some(5),
                ..StageSettings::default()
            },
        );
        let descriptors = default_descriptors(&config);
        assert!(!descriptors[1].enabled);
        assert_eq!(descriptors[1].order, 5);
    }
}
