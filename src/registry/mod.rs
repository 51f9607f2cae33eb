//! Model registry — logical model ids to provider, pricing and capabilities.
//!
//! Built once at startup from the declarative defaults mapping and pricing
//! table in `RegistryConfig`; read-only afterward. Resolution never performs
//! I/O.

mod pricing;

pub use pricing::{ModelInfo, ModelPricing};

use std::collections::HashMap;

use tracing::warn;

use crate::config::{ModelEntry, RegistryConfig};
use crate::error::{AxonError, Result};

/// Fallback aliases consulted when neither a tenant override nor a
/// configured default matches. Last-resort names that predate the
/// configuration layer and still appear in stored conversations.
const FALLBACK_ALIASES: &[(&str, &str)] = &[
    ("default", "gpt-4o"),
    ("fast", "gpt-4o-mini"),
    ("reasoning", "o3-mini"),
    ("claude", "claude-3-5-sonnet"),
];

pub struct ModelRegistry {
    defaults: HashMap<String, String>,
    tenant_overrides: HashMap<String, HashMap<String, String>>,
    models: HashMap<String, ModelEntry>,
    strict: bool,
}

impl ModelRegistry {
    pub fn from_config(config: &RegistryConfig) -> Self {
        Self {
            defaults: config.defaults.clone(),
            tenant_overrides: config.tenant_overrides.clone(),
            models: config.models.clone(),
            strict: config.strict,
        }
    }

    /// Resolve a logical id with no tenant context.
    pub fn resolve(&self, logical_id: &str) -> Option<ModelInfo> {
        self.resolve_for_tenant(None, logical_id)
    }

    /// Resolve a logical id, checking the tenant's overrides first.
    ///
    /// Resolution order: tenant override, configured default, fallback alias
    /// table, raw pass-through when the id is already priced, suffix match
    /// against known provider ids.
    pub fn resolve_for_tenant(&self, tenant: Option<&str>, logical_id: &str) -> Option<ModelInfo> {
        if let Some(tenant) = tenant {
            if let Some(overrides) = self.tenant_overrides.get(tenant) {
                if let Some(target) = overrides.get(logical_id) {
                    return self.info_for(logical_id, target);
                }
            }
        }

        if let Some(target) = self.defaults.get(logical_id) {
            return self.info_for(logical_id, target);
        }

        if let Some((_, target)) = FALLBACK_ALIASES.iter().find(|(alias, _)| *alias == logical_id)
        {
            if let Some(info) = self.info_for(logical_id, target) {
                return Some(info);
            }
        }

        if self.models.contains_key(logical_id) {
            return self.info_for(logical_id, logical_id);
        }

        // Suffix match: "4o-mini" finds "gpt-4o-mini".
        let mut suffix_matches: Vec<&String> = self
            .models
            .keys()
            .filter(|id| id.ends_with(logical_id))
            .collect();
        suffix_matches.sort();
        if let Some(target) = suffix_matches.first() {
            let target = (*target).clone();
            return self.info_for(logical_id, &target);
        }

        None
    }

    fn info_for(&self, logical_id: &str, provider_model_id: &str) -> Option<ModelInfo> {
        self.models.get(provider_model_id).map(|entry| {
            ModelInfo::from_entry(logical_id, provider_model_id, entry)
        })
    }

    /// Check that every configured default resolves to a priced entry.
    ///
    /// In strict mode an unpriced default is fatal; otherwise each gap is
    /// logged and given a fallback price so resolution keeps working.
    /// Returns the list of warnings either way.
    pub fn validate(&mut self) -> Result<Vec<String>> {
        let mut warnings = Vec::new();

        let unpriced: Vec<(String, String)> = self
            .defaults
            .iter()
            .filter(|(_, target)| !self.models.contains_key(*target))
            .map(|(logical, target)| (logical.clone(), target.clone()))
            .collect();

        for (logical, target) in &unpriced {
            let message = format!("default {logical} -> {target} has no pricing entry");
            if self.strict {
                return Err(AxonError::UnpricedModel {
                    logical_id: logical.clone(),
                    provider_model_id: target.clone(),
                });
            }
            warn!("{message}, registering fallback price");
            self.models
                .insert(target.clone(), ModelEntry::fallback_priced());
            warnings.push(message);
        }

        Ok(warnings)
    }

    /// Every priced provider model id known to the registry.
    pub fn known_models(&self) -> Vec<&str> {
        self.models.keys().map(String::as_str).collect()
    }
}
