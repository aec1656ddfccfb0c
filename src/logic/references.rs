//! Feature identity and reference resolution.
//!
//! Occurrences are merged into features by identity first; references are
//! only looked at once every occurrence of the config is known, so a feature
//! may reference one declared after it, or one that references it back.

use std::collections::BTreeMap;
use std::sync::Arc;

use indexmap::IndexMap;
use indexmap::map::Entry;
use tracing::{debug, trace};

use crate::coordinate::ArtifactCoordinate;
use crate::descriptor::{FeatureReferenceSpec, FeatureSpec};
use crate::error::ResolutionError;
use crate::logic::configs::RawFeature;
use crate::logic::layout::FeaturePackLayout;
use crate::logic::params::{OverrideStack, Scope, feature_id, merge, partial_id};
use crate::state::{FeatureReference, ProvisionedFeature, ResolvedFeatureId};

/// A resolved feature together with the spec it instantiates.
#[derive(Debug, Clone)]
pub struct ResolvedFeature {
    pub feature: ProvisionedFeature,
    pub spec: Arc<FeatureSpec>,
}

impl ResolvedFeature {
    /// Value of any parameter, id or not
    pub fn param(&self, name: &str) -> Option<&str> {
        self.feature.param(name)
    }
}

/// Output of resolving one config's features.
#[derive(Debug, Clone, Default)]
pub struct ResolvedFeatures {
    /// First-resolved order
    pub features: Vec<ResolvedFeature>,
    pub references: Vec<FeatureReference>,
}

#[derive(Debug)]
struct Collected {
    pack: ArtifactCoordinate,
    spec: Arc<FeatureSpec>,
    stack: OverrideStack,
}

/// Collects occurrences of one config and resolves them into features.
pub struct FeatureReferenceResolver<'a, 'r> {
    layout: &'a FeaturePackLayout<'r>,
    entries: IndexMap<ResolvedFeatureId, Collected>,
}

impl<'a, 'r> FeatureReferenceResolver<'a, 'r> {
    pub fn new(layout: &'a FeaturePackLayout<'r>) -> Self {
        Self {
            layout,
            entries: IndexMap::new(),
        }
    }

    /// Number of distinct features collected so far
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Add an occurrence; occurrences with the same identity merge.
    pub fn add(&mut self, raw: RawFeature) -> Result<ResolvedFeatureId, ResolutionError> {
        let merged = merge(&raw.pack, &raw.spec, &raw.stack)?;
        let id = feature_id(&raw.pack, &raw.spec, &merged)?;
        match self.entries.entry(id.clone()) {
            Entry::Occupied(mut existing) => {
                trace!(feature = %id, "Merging repeated occurrence");
                existing.get_mut().stack.extend(raw.stack);
            }
            Entry::Vacant(slot) => {
                slot.insert(Collected {
                    pack: raw.pack,
                    spec: raw.spec,
                    stack: raw.stack,
                });
            }
        }
        Ok(id)
    }

    /// Identity a reference points at, or `None` when a mapped local
    /// parameter has no value.
    fn target_of(
        &self,
        pack: &ArtifactCoordinate,
        reference: &FeatureReferenceSpec,
        values: &BTreeMap<String, String>,
    ) -> Result<Option<ResolvedFeatureId>, ResolutionError> {
        let (target_pack, target_spec) =
            self.layout
                .find_spec(Some(pack), reference.origin.as_deref(), &reference.feature)?;

        let mut ids = BTreeMap::new();
        if reference.mappings.is_empty() {
            for param in target_spec.id_params() {
                match values.get(&param.name) {
                    Some(value) => ids.insert(param.name.clone(), value.clone()),
                    None => return Ok(None),
                };
            }
        } else {
            for (local, target) in &reference.mappings {
                match values.get(local) {
                    Some(value) => ids.insert(target.clone(), value.clone()),
                    None => return Ok(None),
                };
            }
            if target_spec.id_params().any(|p| !ids.contains_key(&p.name)) {
                return Ok(None);
            }
        }
        Ok(Some(ResolvedFeatureId::new(
            target_pack,
            target_spec.name.clone(),
            ids,
        )))
    }

    /// Resolve every collected feature.
    ///
    /// Adds the targets of including references that are absent, checks
    /// non-nillable parameters and resolves references into edges.
    pub fn finish(mut self) -> Result<ResolvedFeatures, ResolutionError> {
        let mut merged: Vec<BTreeMap<String, String>> = Vec::with_capacity(self.entries.len());

        // Entries appended while iterating are visited too
        let mut index = 0;
        loop {
            let Some((_, entry)) = self.entries.get_index(index) else {
                break;
            };
            let pack = entry.pack.clone();
            let spec = Arc::clone(&entry.spec);
            let values = merge(&pack, &spec, &entry.stack)?;

            for reference in spec.references.iter().filter(|r| r.include) {
                let Some(target) = self.target_of(&pack, reference, &values)? else {
                    continue;
                };
                if self.entries.contains_key(&target) {
                    continue;
                }
                let (target_pack, target_spec) = self.layout.find_spec(
                    Some(&pack),
                    reference.origin.as_deref(),
                    &reference.feature,
                )?;
                let mut stack = OverrideStack::new();
                stack.push(
                    Scope::declared(0),
                    0,
                    target
                        .params
                        .iter()
                        .map(|(k, v)| (k.clone(), v.clone()))
                        .collect(),
                );
                debug!(
                    feature = %target,
                    required_by = %partial_id(&pack, &spec, &values),
                    "Including referenced feature"
                );
                self.entries.insert(
                    target,
                    Collected {
                        pack: target_pack,
                        spec: target_spec,
                        stack,
                    },
                );
            }

            merged.push(values);
            index += 1;
        }

        let mut out = ResolvedFeatures::default();
        for ((id, entry), values) in self.entries.iter().zip(&merged) {
            for param in &entry.spec.params {
                if !param.feature_id && !param.nillable && !values.contains_key(&param.name) {
                    return Err(ResolutionError::NonNillableParameterUnset {
                        feature: id.clone(),
                        param: param.name.clone(),
                    });
                }
            }

            for reference in &entry.spec.references {
                match self.target_of(&entry.pack, reference, values)? {
                    Some(target) if self.entries.contains_key(&target) => {
                        out.references.push(FeatureReference {
                            from: id.clone(),
                            name: reference.reference_name().to_string(),
                            to: target,
                        });
                    }
                    None if reference.nillable => {}
                    _ => {
                        return Err(ResolutionError::UnresolvedReference {
                            feature: id.clone(),
                            reference: reference.reference_name().to_string(),
                        });
                    }
                }
            }

            let params = values
                .iter()
                .filter(|(name, _)| !entry.spec.is_id_param(name))
                .map(|(k, v)| (k.clone(), v.clone()))
                .collect();
            out.features.push(ResolvedFeature {
                feature: ProvisionedFeature {
                    id: id.clone(),
                    params,
                },
                spec: Arc::clone(&entry.spec),
            });
        }

        debug!(
            features = out.features.len(),
            references = out.references.len(),
            "Resolved features"
        );
        Ok(out)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::descriptor::{FeaturePackSpec, ParameterSpec};
    use crate::registry::FeatureSpecRegistry;
    use crate::request::{FeaturePackSelection, ProvisioningRequest};

    fn coord() -> ArtifactCoordinate {
        "org.test:fp1:1.0".parse().unwrap()
    }

    fn registry() -> FeatureSpecRegistry {
        let spec = FeaturePackSpec::new(coord())
            .with_feature_spec(
                FeatureSpec::new("item")
                    .with_param(ParameterSpec::id("name"))
                    .with_param(ParameterSpec::nillable("p"))
                    .with_param(ParameterSpec::nillable("q")),
            )
            .with_feature_spec(
                FeatureSpec::new("chainA")
                    .with_param(ParameterSpec::id("name"))
                    .with_reference(FeatureReferenceSpec::new("chainB").including()),
            )
            .with_feature_spec(
                FeatureSpec::new("chainB")
                    .with_param(ParameterSpec::id("name"))
                    .with_reference(FeatureReferenceSpec::new("chainC").including()),
            )
            .with_feature_spec(FeatureSpec::new("chainC").with_param(ParameterSpec::id("name")))
            .with_feature_spec(
                FeatureSpec::new("link")
                    .with_param(ParameterSpec::id("name"))
                    .with_param(ParameterSpec::nillable("target"))
                    .with_reference(
                        FeatureReferenceSpec::new("item")
                            .nillable()
                            .map("target", "name"),
                    ),
            )
            .with_feature_spec(
                FeatureSpec::new("strict")
                    .with_param(ParameterSpec::id("name"))
                    .with_param(ParameterSpec::nillable("target"))
                    .with_reference(FeatureReferenceSpec::new("item").map("target", "name")),
            );
        let mut registry = FeatureSpecRegistry::new();
        registry.register(spec).unwrap();
        registry
    }

    fn request() -> ProvisioningRequest {
        ProvisioningRequest::new().with_feature_pack(FeaturePackSelection::new(coord()))
    }

    fn raw(layout: &FeaturePackLayout<'_>, spec: &str, seq: u64, params: &[(&str, &str)]) -> RawFeature {
        let (pack, spec) = layout.find_spec(Some(&coord()), None, spec).unwrap();
        let mut stack = OverrideStack::new();
        stack.push(
            Scope::declared(0),
            seq,
            params
                .iter()
                .map(|(k, v)| (k.to_string(), v.to_string()))
                .collect(),
        );
        RawFeature {
            pack,
            spec,
            stack,
            parent: None,
        }
    }

    fn id(spec: &str, name: &str) -> ResolvedFeatureId {
        ResolvedFeatureId::new(coord(), spec, [("name", name)])
    }

    fn ids(resolved: &ResolvedFeatures) -> Vec<ResolvedFeatureId> {
        resolved.features.iter().map(|f| f.feature.id.clone()).collect()
    }

    // ========================================================================
    // Identity Tests
    // ========================================================================

    #[test]
    fn test_same_identity_merges_into_one_feature() {
        let registry = registry();
        let layout = FeaturePackLayout::resolve(&registry, &request()).unwrap();
        let mut resolver = FeatureReferenceResolver::new(&layout);

        let first = resolver
            .add(raw(&layout, "item", 0, &[("name", "i1"), ("p", "1"), ("q", "kept")]))
            .unwrap();
        let second = resolver
            .add(raw(&layout, "item", 1, &[("name", "i1"), ("p", "2")]))
            .unwrap();
        resolver
            .add(raw(&layout, "item", 2, &[("name", "i2")]))
            .unwrap();

        assert_eq!(first, second);
        assert_eq!(resolver.len(), 2);

        let resolved = resolver.finish().unwrap();
        assert_eq!(ids(&resolved), vec![id("item", "i1"), id("item", "i2")]);
        let merged = &resolved.features[0];
        assert_eq!(merged.param("p"), Some("2"));
        assert_eq!(merged.param("q"), Some("kept"));
        assert_eq!(resolved.features[1].param("p"), None);
    }

    #[test]
    fn test_conflicting_id_in_one_occurrence_is_rejected() {
        let registry = registry();
        let layout = FeaturePackLayout::resolve(&registry, &request()).unwrap();
        let mut resolver = FeatureReferenceResolver::new(&layout);

        let mut feature = raw(&layout, "item", 0, &[("name", "i1")]);
        let mut other = IndexMap::new();
        other.insert("name".to_string(), "i2".to_string());
        feature.stack.push(Scope::declared(0), 1, other);

        assert!(resolver.add(feature).is_err());
        assert!(resolver.is_empty());
    }

    // ========================================================================
    // Auto-include Tests
    // ========================================================================

    #[test]
    fn test_chained_includes_are_added() {
        let registry = registry();
        let layout = FeaturePackLayout::resolve(&registry, &request()).unwrap();
        let mut resolver = FeatureReferenceResolver::new(&layout);
        resolver
            .add(raw(&layout, "chainA", 0, &[("name", "x")]))
            .unwrap();

        let resolved = resolver.finish().unwrap();
        assert_eq!(
            ids(&resolved),
            vec![id("chainA", "x"), id("chainB", "x"), id("chainC", "x")]
        );
        let edges: Vec<(ResolvedFeatureId, ResolvedFeatureId)> = resolved
            .references
            .iter()
            .map(|r| (r.from.clone(), r.to.clone()))
            .collect();
        assert_eq!(
            edges,
            vec![
                (id("chainA", "x"), id("chainB", "x")),
                (id("chainB", "x"), id("chainC", "x")),
            ]
        );
    }

    #[test]
    fn test_include_keeps_existing_target() {
        let registry = registry();
        let layout = FeaturePackLayout::resolve(&registry, &request()).unwrap();
        let mut resolver = FeatureReferenceResolver::new(&layout);
        resolver
            .add(raw(&layout, "chainA", 0, &[("name", "x")]))
            .unwrap();
        resolver
            .add(raw(&layout, "chainB", 1, &[("name", "x")]))
            .unwrap();

        let resolved = resolver.finish().unwrap();
        assert_eq!(
            ids(&resolved),
            vec![id("chainA", "x"), id("chainB", "x"), id("chainC", "x")]
        );
        assert_eq!(resolved.references.len(), 2);
    }

    #[test]
    fn test_reference_to_later_feature_resolves() {
        let registry = registry();
        let layout = FeaturePackLayout::resolve(&registry, &request()).unwrap();
        let mut resolver = FeatureReferenceResolver::new(&layout);
        resolver
            .add(raw(&layout, "link", 0, &[("name", "l1"), ("target", "i1")]))
            .unwrap();
        resolver
            .add(raw(&layout, "item", 1, &[("name", "i1")]))
            .unwrap();

        let resolved = resolver.finish().unwrap();
        assert_eq!(resolved.references.len(), 1);
        assert_eq!(resolved.references[0].from, id("link", "l1"));
        assert_eq!(resolved.references[0].to, id("item", "i1"));
        assert_eq!(resolved.references[0].name, "item");
    }

    // ========================================================================
    // Unresolved Reference Tests
    // ========================================================================

    #[test]
    fn test_nillable_reference_with_unset_mapping_has_no_edge() {
        let registry = registry();
        let layout = FeaturePackLayout::resolve(&registry, &request()).unwrap();
        let mut resolver = FeatureReferenceResolver::new(&layout);
        resolver
            .add(raw(&layout, "link", 0, &[("name", "l1")]))
            .unwrap();

        let resolved = resolver.finish().unwrap();
        assert_eq!(ids(&resolved), vec![id("link", "l1")]);
        assert!(resolved.references.is_empty());
    }

    #[test]
    fn test_nillable_reference_with_missing_target_fails() {
        let registry = registry();
        let layout = FeaturePackLayout::resolve(&registry, &request()).unwrap();
        let mut resolver = FeatureReferenceResolver::new(&layout);
        resolver
            .add(raw(&layout, "link", 0, &[("name", "l1"), ("target", "absent")]))
            .unwrap();

        let err = resolver.finish().unwrap_err();
        match err {
            ResolutionError::UnresolvedReference { feature, reference } => {
                assert_eq!(feature, id("link", "l1"));
                assert_eq!(reference, "item");
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn test_required_reference_with_unset_mapping_fails() {
        let registry = registry();
        let layout = FeaturePackLayout::resolve(&registry, &request()).unwrap();
        let mut resolver = FeatureReferenceResolver::new(&layout);
        resolver
            .add(raw(&layout, "strict", 0, &[("name", "s1")]))
            .unwrap();

        assert!(matches!(
            resolver.finish(),
            Err(ResolutionError::UnresolvedReference { .. })
        ));
    }
}
