//! Config assembler.
//!
//! Three steps, each a pure function of the layout and the request:
//!
//! 1. [`select_configs`] decides which configs are provisioned and merges
//!    every definition of the same `(model, name)` into one [`ConfigPlan`].
//! 2. [`ConfigAssembler::assemble`] expands a plan's items into a flat list
//!    of [`RawFeature`] occurrences, depth-first and left-to-right, attaching
//!    the parameter layers of every scope an occurrence was reached through.
//! 3. [`order_configs`] sorts configs by their declared dependencies.
//!
//! # Group inclusion
//!
//! | Inclusion field      | Effect                                                   |
//! |----------------------|----------------------------------------------------------|
//! | `inherit-features`   | `false` keeps only features listed by the include fields |
//! | `include-specs`      | keep every feature of the listed specs                   |
//! | `include-features`   | keep matching features and apply the non-id overrides    |
//! | `exclude-specs`      | drop features of the listed specs unless listed by id    |
//! | `exclude-features`   | drop matching features                                   |
//!
//! Dropping a feature drops everything nested inside it.

use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet};
use std::sync::Arc;

use indexmap::IndexMap;
use tracing::debug;

use crate::coordinate::ArtifactCoordinate;
use crate::descriptor::{
    ConfigId, ConfigItem, ConfigModel, ConfigSelector, FeatureConfig, FeatureSelector, FeatureSpec,
    GroupInclusion,
};
use crate::error::ResolutionError;
use crate::logic::layout::FeaturePackLayout;
use crate::logic::params::{OverrideStack, Scope, partial_id};
use crate::request::ProvisioningRequest;

// ============================================================================
// Config selection
// ============================================================================

/// Items contributed to a config by one definition.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConfigLayer {
    /// Pack the definition comes from, `None` for the request
    pub context: Option<ArtifactCoordinate>,
    pub items: Vec<ConfigItem>,
}

/// Everything known about one provisioned config before expansion.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConfigPlan {
    pub id: Option<ConfigId>,
    pub props: IndexMap<String, String>,
    pub config_deps: Vec<ConfigId>,
    pub layers: Vec<ConfigLayer>,
    pub excluded: Vec<FeatureSelector>,
}

impl ConfigPlan {
    fn new(id: Option<ConfigId>) -> Self {
        Self {
            id,
            props: IndexMap::new(),
            config_deps: Vec::new(),
            layers: Vec::new(),
            excluded: Vec::new(),
        }
    }

    /// Fold one definition into the plan.
    ///
    /// `inherited` holds the packs whose content this definition drops when
    /// it does not inherit features.
    fn apply(
        &mut self,
        context: Option<&ArtifactCoordinate>,
        model: &ConfigModel,
        inherited: &dyn Fn(Option<&ArtifactCoordinate>) -> bool,
    ) {
        if !model.inherit_features {
            self.layers.retain(|layer| !inherited(layer.context.as_ref()));
        }
        for (name, value) in &model.props {
            self.props.insert(name.clone(), value.clone());
        }
        for dep in &model.config_deps {
            if !self.config_deps.contains(dep) {
                self.config_deps.push(dep.clone());
            }
        }
        self.excluded.extend(model.excluded.iter().cloned());
        if !model.items.is_empty() {
            self.layers.push(ConfigLayer {
                context: context.cloned(),
                items: model.items.clone(),
            });
        }
    }
}

fn any_matches(selectors: &[ConfigSelector], id: &ConfigId) -> bool {
    selectors
        .iter()
        .any(|s| s.matches(Some(&id.model), Some(&id.name)))
}

/// Decide which configs are provisioned and merge their definitions.
///
/// Plans come back in declaration order: pack configs in install order, then
/// configs only the request defines.
pub fn select_configs(
    layout: &FeaturePackLayout<'_>,
    request: &ProvisioningRequest,
) -> Result<Vec<ConfigPlan>, ResolutionError> {
    let mut selected: HashSet<ConfigId> = HashSet::new();
    let mut anonymous: BTreeSet<(usize, usize)> = BTreeSet::new();

    for selection in &request.feature_packs {
        let mut scope = layout.transitive_dependencies(&selection.coordinate);
        scope.insert(selection.coordinate.clone());

        let mut defined: HashSet<ConfigId> = HashSet::new();
        for (pack_index, coordinate) in layout.order().iter().enumerate() {
            if !scope.contains(coordinate) {
                continue;
            }
            for (config_index, config) in layout.pack(coordinate)?.configs().iter().enumerate() {
                match config.config_ref() {
                    Some(id) => {
                        let inherited = selection.inherit_configs
                            && !any_matches(&selection.excluded_configs, &id);
                        if inherited || any_matches(&selection.included_configs, &id) {
                            selected.insert(id.clone());
                        }
                        defined.insert(id);
                    }
                    None if config.model.is_none() && selection.inherit_configs => {
                        anonymous.insert((pack_index, config_index));
                    }
                    None => {}
                }
            }
        }

        for included in &selection.included_configs {
            let Some(name) = &included.name else {
                continue;
            };
            let id = ConfigId::new(included.model.clone(), name.clone());
            let in_request = request.configs.iter().any(|c| c.config_ref().as_ref() == Some(&id));
            if !defined.contains(&id) && !in_request {
                return Err(ResolutionError::UnresolvedConfig { config: id });
            }
        }
    }

    // Model defaults sit underneath every named config of their model, so a
    // definition that drops inherited content drops them as well
    let mut model_defaults: IndexMap<String, Vec<(Option<ArtifactCoordinate>, &ConfigModel)>> =
        IndexMap::new();
    for coordinate in layout.order() {
        for config in layout.pack(coordinate)?.configs() {
            if let (true, Some(model)) = (config.is_model_defaults(), &config.model) {
                model_defaults
                    .entry(model.clone())
                    .or_default()
                    .push((Some(coordinate.clone()), config));
            }
        }
    }
    for config in &request.configs {
        if let (true, Some(model)) = (config.is_model_defaults(), &config.model) {
            model_defaults
                .entry(model.clone())
                .or_default()
                .push((None, config));
        }
    }
    let seeded = |id: &ConfigId| {
        let mut plan = ConfigPlan::new(Some(id.clone()));
        for (context, config) in model_defaults.get(&id.model).into_iter().flatten() {
            plan.apply(context.as_ref(), config, &|_| false);
        }
        plan
    };

    let mut plans: Vec<ConfigPlan> = Vec::new();
    let mut named: HashMap<ConfigId, usize> = HashMap::new();

    for (pack_index, coordinate) in layout.order().iter().enumerate() {
        let deps = layout.transitive_dependencies(coordinate);
        let inherited = |context: Option<&ArtifactCoordinate>| context.is_some_and(|c| deps.contains(c));

        for (config_index, config) in layout.pack(coordinate)?.configs().iter().enumerate() {
            if config.is_model_defaults() {
                continue;
            }
            match config.config_ref() {
                Some(id) if selected.contains(&id) => {
                    let index = *named.entry(id.clone()).or_insert_with(|| {
                        plans.push(seeded(&id));
                        plans.len() - 1
                    });
                    plans[index].apply(Some(coordinate), config, &inherited);
                }
                Some(_) => {}
                None => {
                    if anonymous.contains(&(pack_index, config_index)) {
                        let mut plan = ConfigPlan::new(None);
                        plan.apply(Some(coordinate), config, &inherited);
                        plans.push(plan);
                    }
                }
            }
        }
    }

    let everything = |context: Option<&ArtifactCoordinate>| context.is_some();
    for config in &request.configs {
        if config.is_model_defaults() {
            continue;
        }
        match config.config_ref() {
            Some(id) => {
                let index = *named.entry(id.clone()).or_insert_with(|| {
                    plans.push(seeded(&id));
                    plans.len() - 1
                });
                plans[index].apply(None, config, &everything);
            }
            None => {
                let mut plan = ConfigPlan::new(None);
                plan.apply(None, config, &everything);
                plans.push(plan);
            }
        }
    }

    debug!(configs = plans.len(), "Selected configs");
    Ok(plans)
}

// ============================================================================
// Expansion
// ============================================================================

/// One occurrence of a feature in a config, before identity resolution.
#[derive(Debug, Clone)]
pub struct RawFeature {
    /// Pack declaring the spec
    pub pack: ArtifactCoordinate,
    pub spec: Arc<FeatureSpec>,
    pub stack: OverrideStack,
    /// Index of the enclosing feature in the same list
    pub parent: Option<usize>,
}

impl RawFeature {
    /// Spec name and id values match the selector
    fn matches(&self, selector: &FeatureSelector) -> bool {
        selector.spec == self.spec.name
            && selector
                .params
                .iter()
                .filter(|(name, _)| self.spec.is_id_param(name))
                .all(|(name, value)| self.stack.peek(name, true) == Some(value.as_str()))
    }

    fn id_values(&self) -> BTreeMap<String, String> {
        self.spec
            .id_params()
            .filter_map(|p| {
                self.stack
                    .peek(&p.name, true)
                    .map(|v| (p.name.clone(), v.to_string()))
            })
            .collect()
    }
}

/// Expands config plans into raw feature occurrences.
pub struct ConfigAssembler<'a, 'r> {
    layout: &'a FeaturePackLayout<'r>,
    seq: u64,
    groups: Vec<String>,
}

impl<'a, 'r> ConfigAssembler<'a, 'r> {
    pub fn new(layout: &'a FeaturePackLayout<'r>) -> Self {
        Self {
            layout,
            seq: 0,
            groups: Vec::new(),
        }
    }

    fn next_seq(&mut self) -> u64 {
        self.seq += 1;
        self.seq
    }

    /// Flatten a plan into occurrences in encounter order
    pub fn assemble(&mut self, plan: &ConfigPlan) -> Result<Vec<RawFeature>, ResolutionError> {
        let mut out = Vec::new();
        for layer in &plan.layers {
            self.expand_items(&layer.items, layer.context.as_ref(), 0, None, &mut out)?;
        }

        if !plan.excluded.is_empty() {
            let keep: Vec<bool> = out
                .iter()
                .map(|f| !plan.excluded.iter().any(|s| f.matches(s)))
                .collect();
            compact(&mut out, 0, keep);
        }

        debug!(
            config = ?plan.id,
            occurrences = out.len(),
            "Assembled config"
        );
        Ok(out)
    }

    fn expand_items(
        &mut self,
        items: &[ConfigItem],
        context: Option<&ArtifactCoordinate>,
        depth: usize,
        parent: Option<usize>,
        out: &mut Vec<RawFeature>,
    ) -> Result<(), ResolutionError> {
        for item in items {
            match item {
                ConfigItem::Feature(feature) => {
                    self.expand_feature(feature, context, depth, parent, out)?
                }
                ConfigItem::Group(inclusion) => {
                    self.expand_group(inclusion, context, depth, parent, out)?
                }
            }
        }
        Ok(())
    }

    fn expand_feature(
        &mut self,
        feature: &FeatureConfig,
        context: Option<&ArtifactCoordinate>,
        depth: usize,
        parent: Option<usize>,
        out: &mut Vec<RawFeature>,
    ) -> Result<(), ResolutionError> {
        let (pack, spec) = self
            .layout
            .find_spec(context, feature.origin.as_deref(), &feature.spec)?;

        let mut stack = OverrideStack::new();
        if let Some(parent_index) = parent {
            let fk = parent_key_values(&out[parent_index], &pack, &spec, feature)?;
            let seq = self.next_seq();
            stack.push(Scope::foreign_key(depth), seq, fk);
        }
        let seq = self.next_seq();
        stack.push(Scope::declared(depth), seq, feature.params.clone());

        out.push(RawFeature {
            pack,
            spec,
            stack,
            parent,
        });
        let index = out.len() - 1;
        self.expand_items(&feature.items, context, depth, Some(index), out)
    }

    fn expand_group(
        &mut self,
        inclusion: &GroupInclusion,
        context: Option<&ArtifactCoordinate>,
        depth: usize,
        parent: Option<usize>,
        out: &mut Vec<RawFeature>,
    ) -> Result<(), ResolutionError> {
        let (group_pack, group) =
            self.layout
                .find_group(context, inclusion.origin.as_deref(), &inclusion.group)?;
        let key = format!("{group_pack}#{}", group.name);
        if self.groups.contains(&key) {
            return Err(ResolutionError::CyclicFeatureGroup {
                group: group.name.clone(),
            });
        }

        let start = out.len();
        self.groups.push(key);
        let expanded = self.expand_items(&group.items, Some(&group_pack), depth + 1, parent, out);
        self.groups.pop();
        expanded?;

        // Which included features each override selects
        let mut overrides: Vec<Vec<usize>> = Vec::with_capacity(inclusion.include_features.len());
        for selector in &inclusion.include_features {
            let matched: Vec<usize> = (start..out.len())
                .filter(|&i| out[i].matches(selector))
                .collect();
            if matched.is_empty() {
                return Err(ResolutionError::UnmatchedFeatureOverride {
                    group: group.name.clone(),
                    spec: selector.spec.clone(),
                    params: selector
                        .params
                        .iter()
                        .map(|(k, v)| (k.clone(), v.clone()))
                        .collect(),
                });
            }
            overrides.push(matched);
        }
        let listed: HashSet<usize> = overrides.iter().flatten().copied().collect();

        let mut keep = Vec::with_capacity(out.len() - start);
        for i in start..out.len() {
            let feature = &out[i];
            let excluded = inclusion.exclude_features.iter().any(|s| feature.matches(s))
                || (inclusion.exclude_specs.contains(&feature.spec.name) && !listed.contains(&i));
            let kept = match feature.parent.filter(|&p| p >= start) {
                Some(p) => keep[p - start] && !excluded,
                None => {
                    !excluded
                        && (inclusion.inherit_features
                            || listed.contains(&i)
                            || inclusion.include_specs.contains(&feature.spec.name))
                }
            };
            keep.push(kept);
        }

        for (selector, matched) in inclusion.include_features.iter().zip(&overrides) {
            let values: IndexMap<String, String> = selector
                .params
                .iter()
                .filter(|(name, _)| !out[matched[0]].spec.is_id_param(name))
                .map(|(k, v)| (k.clone(), v.clone()))
                .collect();
            for &i in matched {
                if keep[i - start] {
                    let seq = self.next_seq();
                    out[i]
                        .stack
                        .push(Scope::inclusion_override(depth), seq, values.clone());
                }
            }
        }

        compact(out, start, keep);
        Ok(())
    }
}

/// Values copied from the enclosing feature through the child's reference to it.
fn parent_key_values(
    parent: &RawFeature,
    pack: &ArtifactCoordinate,
    spec: &FeatureSpec,
    feature: &FeatureConfig,
) -> Result<IndexMap<String, String>, ResolutionError> {
    let reference = match &feature.parent_ref {
        Some(name) => spec.references.iter().find(|r| r.reference_name() == name),
        None => spec.references.iter().find(|r| r.feature == parent.spec.name),
    };
    let Some(reference) = reference else {
        let declared: BTreeMap<String, String> = feature
            .params
            .iter()
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect();
        return Err(ResolutionError::UnresolvedReference {
            feature: partial_id(pack, spec, &declared),
            reference: feature
                .parent_ref
                .clone()
                .unwrap_or_else(|| parent.spec.name.clone()),
        });
    };

    let parent_ids = parent.id_values();
    let mut values = IndexMap::new();
    if reference.mappings.is_empty() {
        for (name, value) in parent_ids {
            values.insert(name, value);
        }
    } else {
        for (local, target) in &reference.mappings {
            if let Some(value) = parent_ids.get(target) {
                values.insert(local.clone(), value.clone());
            }
        }
    }
    Ok(values)
}

/// Drop occurrences at or after `start` whose `keep` flag is false, and
/// everything nested in them, fixing up parent indices.
fn compact(out: &mut Vec<RawFeature>, start: usize, mut keep: Vec<bool>) {
    for offset in 0..keep.len() {
        if let Some(p) = out[start + offset].parent.filter(|&p| p >= start) {
            if !keep[p - start] {
                keep[offset] = false;
            }
        }
    }

    let tail: Vec<RawFeature> = out.drain(start..).collect();
    let mut remap: HashMap<usize, usize> = HashMap::new();
    for (offset, (mut feature, kept)) in tail.into_iter().zip(keep).enumerate() {
        if !kept {
            continue;
        }
        if let Some(p) = feature.parent.filter(|&p| p >= start) {
            feature.parent = remap.get(&p).copied();
        }
        remap.insert(start + offset, out.len());
        out.push(feature);
    }
}

// ============================================================================
// Ordering
// ============================================================================

/// Topological order of configs by their declared dependencies.
///
/// `deps[i]` lists what config `i` depends on. Ties are broken by
/// declaration index, so independent configs keep their declared order.
/// Returns indices into the input.
pub fn order_configs(
    ids: &[Option<ConfigId>],
    deps: &[Vec<ConfigId>],
) -> Result<Vec<usize>, ResolutionError> {
    let index_of: HashMap<&ConfigId, usize> = ids
        .iter()
        .enumerate()
        .filter_map(|(i, id)| id.as_ref().map(|id| (id, i)))
        .collect();

    let mut remaining: Vec<usize> = vec![0; ids.len()];
    let mut dependents: Vec<Vec<usize>> = vec![Vec::new(); ids.len()];
    let mut edges: Vec<Vec<usize>> = vec![Vec::new(); ids.len()];
    for (i, config_deps) in deps.iter().enumerate() {
        for dep in config_deps {
            let Some(&target) = index_of.get(dep) else {
                return Err(ResolutionError::UnsatisfiedConfigDependency {
                    config: ids[i]
                        .as_ref()
                        .map_or_else(|| format!("anonymous config #{i}"), ToString::to_string),
                    missing: dep.clone(),
                });
            };
            if !edges[i].contains(&target) {
                edges[i].push(target);
                dependents[target].push(i);
                remaining[i] += 1;
            }
        }
    }

    let mut ready: BTreeSet<usize> = (0..ids.len()).filter(|&i| remaining[i] == 0).collect();
    let mut order = Vec::with_capacity(ids.len());
    while let Some(next) = ready.pop_first() {
        order.push(next);
        for &dependent in &dependents[next] {
            remaining[dependent] -= 1;
            if remaining[dependent] == 0 {
                ready.insert(dependent);
            }
        }
    }

    if order.len() < ids.len() {
        return Err(ResolutionError::CyclicConfigDependency {
            members: find_cycle(ids, &edges, &remaining),
        });
    }
    Ok(order)
}

/// Walk unresolved dependency edges from the first blocked config until a
/// config repeats; the repeated stretch is the cycle.
fn find_cycle(ids: &[Option<ConfigId>], edges: &[Vec<usize>], remaining: &[usize]) -> Vec<ConfigId> {
    let Some(start) = (0..ids.len()).find(|&i| remaining[i] > 0) else {
        return Vec::new();
    };
    let mut path: Vec<usize> = Vec::new();
    let mut current = start;
    loop {
        if let Some(pos) = path.iter().position(|&i| i == current) {
            return path[pos..]
                .iter()
                .filter_map(|&i| ids[i].clone())
                .collect();
        }
        path.push(current);
        match edges[current].iter().find(|&&t| remaining[t] > 0) {
            Some(&t) => current = t,
            None => return path.iter().filter_map(|&i| ids[i].clone()).collect(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn id(name: &str) -> ConfigId {
        ConfigId::new("model1", name)
    }

    // ========================================================================
    // Ordering Tests
    // ========================================================================

    #[test]
    fn test_dependency_comes_first() {
        let ids = vec![Some(id("config2")), Some(id("config1"))];
        let deps = vec![vec![id("config1")], vec![]];
        assert_eq!(order_configs(&ids, &deps).unwrap(), vec![1, 0]);
    }

    #[test]
    fn test_independent_configs_keep_declaration_order() {
        let ids = vec![Some(id("c")), None, Some(id("a")), Some(id("b"))];
        let deps = vec![vec![], vec![], vec![], vec![]];
        assert_eq!(order_configs(&ids, &deps).unwrap(), vec![0, 1, 2, 3]);
    }

    #[test]
    fn test_missing_dependency() {
        let ids = vec![Some(id("config1"))];
        let deps = vec![vec![id("config9")]];
        assert_eq!(
            order_configs(&ids, &deps).unwrap_err(),
            ResolutionError::UnsatisfiedConfigDependency {
                config: "model1/config1".to_string(),
                missing: id("config9"),
            }
        );
    }

    #[test]
    fn test_mutual_dependency_is_cycle() {
        let ids = vec![Some(id("config1")), Some(id("config2")), Some(id("config3"))];
        let deps = vec![vec![id("config2")], vec![id("config1")], vec![]];
        assert_eq!(
            order_configs(&ids, &deps).unwrap_err(),
            ResolutionError::CyclicConfigDependency {
                members: vec![id("config1"), id("config2")],
            }
        );
    }

    #[test]
    fn test_cycle_reported_without_bystanders() {
        // config0 depends on the cycle but is not part of it
        let ids = vec![Some(id("config0")), Some(id("config1")), Some(id("config2"))];
        let deps = vec![vec![id("config1")], vec![id("config2")], vec![id("config1")]];
        assert_eq!(
            order_configs(&ids, &deps).unwrap_err(),
            ResolutionError::CyclicConfigDependency {
                members: vec![id("config1"), id("config2")],
            }
        );
    }
}
