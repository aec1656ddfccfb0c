//! Provisioned state: the engine's sole output.
//!
//! Everything here is created fresh by a provisioning run and never mutated
//! afterwards. Maps are ordered (`BTreeMap`/`BTreeSet`) and lists keep
//! first-resolved order, so two runs over the same input compare equal.

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;

use serde::{Deserialize, Serialize};

use crate::coordinate::ArtifactCoordinate;
use crate::plugin::PluginDescriptor;

pub use crate::descriptor::ConfigId;

// ============================================================================
// Feature identity
// ============================================================================

/// Primary key of a feature instance.
///
/// Two occurrences with equal ids are the same logical feature and merge.
/// Once resolution completes, `params` holds exactly the id parameters
/// declared by the spec, all set.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ResolvedFeatureId {
    pub pack: ArtifactCoordinate,
    pub spec: String,
    pub params: BTreeMap<String, String>,
}

impl ResolvedFeatureId {
    pub fn new<K, V>(
        pack: ArtifactCoordinate,
        spec: impl Into<String>,
        params: impl IntoIterator<Item = (K, V)>,
    ) -> Self
    where
        K: Into<String>,
        V: Into<String>,
    {
        Self {
            pack,
            spec: spec.into(),
            params: params
                .into_iter()
                .map(|(k, v)| (k.into(), v.into()))
                .collect(),
        }
    }

    pub fn param(&self, name: &str) -> Option<&str> {
        self.params.get(name).map(String::as_str)
    }
}

impl fmt::Display for ResolvedFeatureId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}#{}{{", self.pack, self.spec)?;
        for (i, (name, value)) in self.params.iter().enumerate() {
            if i > 0 {
                write!(f, ",")?;
            }
            write!(f, "{name}={value}")?;
        }
        write!(f, "}}")
    }
}

// ============================================================================
// Features and configs
// ============================================================================

/// A fully resolved feature: identity plus final non-id parameters.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProvisionedFeature {
    pub id: ResolvedFeatureId,
    pub params: BTreeMap<String, String>,
}

impl ProvisionedFeature {
    /// Value of an id or non-id parameter
    pub fn param(&self, name: &str) -> Option<&str> {
        self.id
            .param(name)
            .or_else(|| self.params.get(name).map(String::as_str))
    }
}

/// A resolved foreign-key edge. Diagnostic only, it imposes no ordering.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FeatureReference {
    pub from: ResolvedFeatureId,
    pub name: String,
    pub to: ResolvedFeatureId,
}

/// A resolved config.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProvisionedConfig {
    /// `None` for anonymous configs
    pub id: Option<ConfigId>,
    pub props: BTreeMap<String, String>,
    /// First-resolved order
    pub features: Vec<ProvisionedFeature>,
    pub references: Vec<FeatureReference>,
    /// Provided capability value -> providers in first-resolved order
    pub capability_providers: BTreeMap<String, Vec<ResolvedFeatureId>>,
}

impl ProvisionedConfig {
    pub fn model(&self) -> Option<&str> {
        self.id.as_ref().map(|id| id.model.as_str())
    }

    pub fn name(&self) -> Option<&str> {
        self.id.as_ref().map(|id| id.name.as_str())
    }

    pub fn feature(&self, id: &ResolvedFeatureId) -> Option<&ProvisionedFeature> {
        self.features.iter().find(|f| &f.id == id)
    }

    /// Features of one spec, in config order
    pub fn features_of<'a>(
        &'a self,
        spec: &'a str,
    ) -> impl Iterator<Item = &'a ProvisionedFeature> + 'a {
        self.features.iter().filter(move |f| f.id.spec == spec)
    }

    /// The canonical provider of a capability: the first one resolved.
    pub fn provider_of(&self, capability: &str) -> Option<&ResolvedFeatureId> {
        self.capability_providers
            .get(capability)
            .and_then(|providers| providers.first())
    }
}

// ============================================================================
// Provisioned state
// ============================================================================

/// A feature pack in the final plan with the packages it installs.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProvisionedFeaturePack {
    pub coordinate: ArtifactCoordinate,
    pub packages: BTreeSet<String>,
    pub plugins: Vec<PluginDescriptor>,
}

/// The complete, validated installation plan.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProvisionedState {
    /// Install order: dependencies before the packs depending on them
    pub feature_packs: Vec<ProvisionedFeaturePack>,
    /// Config dependency order
    pub configs: Vec<ProvisionedConfig>,
    /// Request options handed to plugins
    pub options: BTreeMap<String, String>,
}

impl ProvisionedState {
    pub fn feature_pack(&self, coordinate: &ArtifactCoordinate) -> Option<&ProvisionedFeaturePack> {
        self.feature_packs
            .iter()
            .find(|fp| &fp.coordinate == coordinate)
    }

    /// Installed package names of a pack (empty when the pack is absent)
    pub fn packages_of(&self, coordinate: &ArtifactCoordinate) -> Vec<&str> {
        self.feature_pack(coordinate)
            .map(|fp| fp.packages.iter().map(String::as_str).collect())
            .unwrap_or_default()
    }

    pub fn config(&self, model: &str, name: &str) -> Option<&ProvisionedConfig> {
        self.configs
            .iter()
            .find(|c| c.model() == Some(model) && c.name() == Some(name))
    }

    /// Returns a summary of the plan for logging/display.
    pub fn summary(&self) -> String {
        let mut lines = vec![format!(
            "Provisioned State: {} feature pack(s), {} config(s)",
            self.feature_packs.len(),
            self.configs.len()
        )];
        for fp in &self.feature_packs {
            lines.push(format!("  Feature pack {}", fp.coordinate));
            if fp.packages.is_empty() {
                lines.push("    (no packages)".to_string());
            }
            for package in &fp.packages {
                lines.push(format!("    package {package}"));
            }
        }
        for config in &self.configs {
            let title = match &config.id {
                Some(id) => format!("  Config {id}"),
                None => "  Config (anonymous)".to_string(),
            };
            lines.push(format!("{title} ({} feature(s))", config.features.len()));
            for (i, feature) in config.features.iter().enumerate() {
                let params: Vec<String> = feature
                    .params
                    .iter()
                    .map(|(k, v)| format!("{k}={v}"))
                    .collect();
                lines.push(format!("    {}. {} [{}]", i + 1, feature.id, params.join(", ")));
            }
        }
        lines.join("\n")
    }
}
