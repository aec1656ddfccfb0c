//! Parameter merge engine.
//!
//! A feature occurrence carries an [`OverrideStack`]: the parameter values
//! assigned to it at each scope it was reached through. Merging applies the
//! layers least specific first, so a more specific scope always replaces a
//! less specific one and a scope that does not mention a parameter leaves it
//! alone.
//!
//! # Specificity
//!
//! Lower depth is more specific: depth 0 is the config body, each group
//! inclusion adds one. At equal depth an inclusion override is less specific
//! than a value declared in that body, and at equal scope the later
//! declaration wins.
//!
//! | Scope (least → most specific)                       | depth | kind               |
//! |-----------------------------------------------------|-------|--------------------|
//! | spec default                                        | n/a   | filled in last     |
//! | value declared inside a group                       | 1     | `Declared`         |
//! | override applied when the config includes the group | 0     | `InclusionOverride`|
//! | value declared directly in the config               | 0     | `Declared`         |
//!
//! Id parameters follow a stricter rule: the first value any layer assigns is
//! authoritative and a later different value is an `IdParameterConflict`.
//! Foreign-key initialization from a parent feature is applied before every
//! other layer.

use std::cmp::Reverse;
use std::collections::BTreeMap;

use indexmap::IndexMap;

use crate::coordinate::ArtifactCoordinate;
use crate::descriptor::FeatureSpec;
use crate::error::ResolutionError;
use crate::state::ResolvedFeatureId;

// ============================================================================
// Scopes and layers
// ============================================================================

/// How a layer was attached to an occurrence.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum ScopeKind {
    /// Id values copied from the enclosing feature
    ForeignKey,
    /// Override carried by a group inclusion
    InclusionOverride,
    /// Values written on the feature itself
    Declared,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Scope {
    pub depth: usize,
    pub kind: ScopeKind,
}

impl Scope {
    pub fn declared(depth: usize) -> Self {
        Self {
            depth,
            kind: ScopeKind::Declared,
        }
    }

    pub fn inclusion_override(depth: usize) -> Self {
        Self {
            depth,
            kind: ScopeKind::InclusionOverride,
        }
    }

    pub fn foreign_key(depth: usize) -> Self {
        Self {
            depth,
            kind: ScopeKind::ForeignKey,
        }
    }
}

/// Values assigned at one scope.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParamLayer {
    pub scope: Scope,
    /// Declaration sequence, breaks ties between equal scopes
    pub seq: u64,
    pub values: IndexMap<String, String>,
}

impl ParamLayer {
    fn sort_key(&self) -> (u8, Reverse<usize>, ScopeKind, u64) {
        // Foreign keys go first regardless of depth
        let phase = u8::from(self.scope.kind != ScopeKind::ForeignKey);
        (phase, Reverse(self.scope.depth), self.scope.kind, self.seq)
    }
}

/// All layers of one feature (or of every occurrence of one identity).
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct OverrideStack {
    layers: Vec<ParamLayer>,
}

impl OverrideStack {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a layer; empty layers are dropped
    pub fn push(&mut self, scope: Scope, seq: u64, values: IndexMap<String, String>) {
        if values.is_empty() {
            return;
        }
        self.layers.push(ParamLayer { scope, seq, values });
    }

    /// Take over every layer of another stack
    pub fn extend(&mut self, other: OverrideStack) {
        self.layers.extend(other.layers);
    }

    pub fn layers(&self) -> &[ParamLayer] {
        &self.layers
    }

    pub fn is_empty(&self) -> bool {
        self.layers.is_empty()
    }

    fn ordered(&self) -> Vec<&ParamLayer> {
        let mut ordered: Vec<&ParamLayer> = self.layers.iter().collect();
        ordered.sort_by_key(|l| l.sort_key());
        ordered
    }

    /// Best-effort current value of a parameter, without validation.
    ///
    /// For id parameters this is the first value assigned, otherwise the
    /// most specific one. Used to match selectors during assembly.
    pub fn peek(&self, name: &str, is_id: bool) -> Option<&str> {
        let mut values = self
            .ordered()
            .into_iter()
            .filter_map(|l| l.values.get(name).map(String::as_str));
        if is_id { values.next() } else { values.last() }
    }
}

// ============================================================================
// Merge
// ============================================================================

/// Final parameter values of one feature, ids and non-ids together.
///
/// Parameters without value and without default are absent.
pub fn merge(
    pack: &ArtifactCoordinate,
    spec: &FeatureSpec,
    stack: &OverrideStack,
) -> Result<BTreeMap<String, String>, ResolutionError> {
    let mut merged: BTreeMap<String, String> = BTreeMap::new();

    for layer in stack.ordered() {
        for (name, value) in &layer.values {
            let Some(param) = spec.param(name) else {
                return Err(ResolutionError::UnknownParameter {
                    feature: partial_id(pack, spec, &merged),
                    param: name.clone(),
                });
            };
            if !param.feature_id {
                merged.insert(name.clone(), value.clone());
                continue;
            }
            match merged.get(name) {
                None => {
                    merged.insert(name.clone(), value.clone());
                }
                Some(old) if old == value => {}
                Some(old) => {
                    return Err(ResolutionError::IdParameterConflict {
                        feature: partial_id(pack, spec, &merged),
                        param: name.clone(),
                        old: old.clone(),
                        new: value.clone(),
                    });
                }
            }
        }
    }

    for param in &spec.params {
        if let Some(default) = &param.default {
            merged
                .entry(param.name.clone())
                .or_insert_with(|| default.clone());
        }
    }

    Ok(merged)
}

/// Identity built from whatever id values are known so far
pub fn partial_id(
    pack: &ArtifactCoordinate,
    spec: &FeatureSpec,
    values: &BTreeMap<String, String>,
) -> ResolvedFeatureId {
    ResolvedFeatureId::new(
        pack.clone(),
        spec.name.clone(),
        spec.id_params()
            .filter_map(|p| values.get(&p.name).map(|v| (p.name.clone(), v.clone()))),
    )
}

/// The complete identity, or the first id parameter without value
pub fn feature_id(
    pack: &ArtifactCoordinate,
    spec: &FeatureSpec,
    values: &BTreeMap<String, String>,
) -> Result<ResolvedFeatureId, ResolutionError> {
    if let Some(missing) = spec.id_params().find(|p| !values.contains_key(&p.name)) {
        return Err(ResolutionError::MissingIdParameter {
            feature: partial_id(pack, spec, values),
            param: missing.name.clone(),
        });
    }
    Ok(partial_id(pack, spec, values))
}
