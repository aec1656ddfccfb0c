//! Capability resolver.
//!
//! Runs over a config's fully resolved feature set, never during traversal,
//! so requirement cycles between features are legal: satisfaction only asks
//! whether some feature in the set provides the required value.
//!
//! Patterns are dot-separated; an element starting with `$` is replaced by
//! the value of the parameter it names (`org.service.$name`).

use std::collections::BTreeMap;

use tracing::debug;

use crate::error::ResolutionError;
use crate::logic::references::ResolvedFeature;
use crate::state::ResolvedFeatureId;

/// Outcome of substituting parameter values into a pattern.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Substitution {
    Value(String),
    /// The named parameter has no value
    Unset(String),
}

/// Substitute a feature's parameter values into a capability pattern
pub fn substitute(pattern: &str, feature: &ResolvedFeature) -> Substitution {
    let mut parts = Vec::new();
    for element in pattern.split('.') {
        match element.strip_prefix('$') {
            Some(param) => match feature.param(param) {
                Some(value) => parts.push(value),
                None => return Substitution::Unset(param.to_string()),
            },
            None => parts.push(element),
        }
    }
    Substitution::Value(parts.join("."))
}

/// Provided capability values of a feature set, providers in set order.
///
/// Patterns whose parameter is unset provide nothing.
pub fn providers(features: &[ResolvedFeature]) -> BTreeMap<String, Vec<ResolvedFeatureId>> {
    let mut index: BTreeMap<String, Vec<ResolvedFeatureId>> = BTreeMap::new();
    for resolved in features {
        for pattern in &resolved.spec.provides {
            if let Substitution::Value(capability) = substitute(pattern, resolved) {
                let providers = index.entry(capability).or_default();
                if !providers.contains(&resolved.feature.id) {
                    providers.push(resolved.feature.id.clone());
                }
            }
        }
    }
    index
}

/// Check every requirement against what the set provides.
///
/// Returns the provided-value index on success.
pub fn validate(
    features: &[ResolvedFeature],
) -> Result<BTreeMap<String, Vec<ResolvedFeatureId>>, ResolutionError> {
    let index = providers(features);

    for resolved in features {
        for requirement in &resolved.spec.requires {
            match substitute(&requirement.name, resolved) {
                Substitution::Value(capability) => {
                    if !requirement.optional && !index.contains_key(&capability) {
                        return Err(ResolutionError::UnresolvedCapabilityRequirement {
                            feature: resolved.feature.id.clone(),
                            capability,
                        });
                    }
                }
                Substitution::Unset(_) if requirement.optional => {}
                Substitution::Unset(param) => {
                    return Err(ResolutionError::UnresolvedCapabilityParameter {
                        feature: resolved.feature.id.clone(),
                        pattern: requirement.name.clone(),
                        param,
                    });
                }
            }
        }
    }

    debug!(
        features = features.len(),
        capabilities = index.len(),
        "Capabilities satisfied"
    );
    Ok(index)
}
