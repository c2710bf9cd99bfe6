use std::sync::Arc;

use serde::Deserialize;

use editorial_common::ValidationRule;

use super::cache::ResponseCache;
use super::repository::StaticRuleRepository;
use super::service::ValidationService;

#[derive(Deserialize)]
struct Collection {
    rules: Vec<ValidationRule>,
}

/// The bundled `rules.yaml` collection.
pub fn sample_rules() -> Vec<ValidationRule> {
    let collection: Collection = serde_yaml::from_str(include_str!("../../rules.yaml")).unwrap();
    collection.rules
}

pub fn sample_repository() -> Arc<StaticRuleRepository> {
    Arc::new(StaticRuleRepository::new(sample_rules()))
}

pub fn sample_service() -> (Arc<ValidationService>, Arc<StaticRuleRepository>) {
    let repo = sample_repository();
    let service = ValidationService::new(
        repo.clone(),
        Arc::new(ResponseCache::new(std::time::Duration::from_secs(300), 128)),
    );
    (Arc::new(service), repo)
}
