//! Feature-pack layout resolver.
//!
//! Turns the request's top-level feature packs into the full, ordered set of
//! packs in scope, decides each pack's package selection, and answers lookups
//! (specs, groups, origins) against that scope for the later phases.
//!
//! # Selection rules
//!
//! | Source                               | Effect on package `p` of pack `D`             |
//! |--------------------------------------|-----------------------------------------------|
//! | request includes/excludes `p`        | always wins                                   |
//! | some dependent of `D` includes `p`   | included unless the request excludes it      |
//! | some dependent of `D` excludes `p`   | excluded unless anything includes it         |
//! | defaults of `D`                      | request's `inherit` flag, else any dependent |
//!
//! Traversal order never matters: selections are computed from the complete
//! set of declarations after the pack graph is known.

use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet, VecDeque};
use std::sync::Arc;

use indexmap::{IndexMap, IndexSet};
use tracing::{debug, info};

use crate::coordinate::ArtifactCoordinate;
use crate::descriptor::{FeatureGroupSpec, FeatureSpec, PackageSelection};
use crate::error::ResolutionError;
use crate::logic::packages::PackageRequest;
use crate::registry::{FeaturePack, FeatureSpecRegistry};
use crate::request::ProvisioningRequest;

/// Name used for the request wherever an error needs a requester
pub const REQUEST_CONTEXT: &str = "provisioning request";

/// A package something outside its pack needs installed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PackageDemand {
    pub pack: ArtifactCoordinate,
    pub package: String,
    pub optional: bool,
    pub required_by: String,
}

/// The resolved set of feature packs of one run.
#[derive(Debug)]
pub struct FeaturePackLayout<'r> {
    registry: &'r FeatureSpecRegistry,
    /// Dependencies before dependents
    order: Vec<ArtifactCoordinate>,
    top_level: Vec<ArtifactCoordinate>,
    by_ga: HashMap<String, ArtifactCoordinate>,
    dependencies: HashMap<ArtifactCoordinate, Vec<ArtifactCoordinate>>,
    selections: HashMap<ArtifactCoordinate, PackageRequest>,
}

impl<'r> FeaturePackLayout<'r> {
    /// Resolve the transitive feature packs of a request.
    pub fn resolve(
        registry: &'r FeatureSpecRegistry,
        request: &ProvisioningRequest,
    ) -> Result<Self, ResolutionError> {
        // Top-level coordinates pin their group:artifact
        let mut pinned: HashMap<String, ArtifactCoordinate> = HashMap::new();
        let mut top_level: Vec<ArtifactCoordinate> = Vec::new();
        for selection in &request.feature_packs {
            let coordinate = &selection.coordinate;
            if !registry.contains(coordinate) {
                return Err(ResolutionError::UnresolvedFeaturePackDependency {
                    required_by: REQUEST_CONTEXT.to_string(),
                    dependency: coordinate.clone(),
                });
            }
            match pinned.get(&coordinate.ga()) {
                Some(existing) if existing != coordinate => {
                    return Err(ResolutionError::FeaturePackVersionConflict {
                        ga: coordinate.ga(),
                        versions: sorted_strings([existing, coordinate]),
                    });
                }
                Some(_) => {}
                None => {
                    pinned.insert(coordinate.ga(), coordinate.clone());
                    top_level.push(coordinate.clone());
                }
            }
        }

        // Reach every pack, substituting pinned versions
        let mut reached: IndexSet<ArtifactCoordinate> = top_level.iter().cloned().collect();
        let mut dependencies: HashMap<ArtifactCoordinate, Vec<ArtifactCoordinate>> = HashMap::new();
        let mut queue: VecDeque<ArtifactCoordinate> = top_level.iter().cloned().collect();
        while let Some(coordinate) = queue.pop_front() {
            let pack = pack_of(registry, &coordinate)?;
            let mut resolved = Vec::with_capacity(pack.dependencies().len());
            for dep in pack.dependencies() {
                let target = pinned
                    .get(&dep.coordinate.ga())
                    .cloned()
                    .unwrap_or_else(|| dep.coordinate.clone());
                if !registry.contains(&target) {
                    return Err(ResolutionError::UnresolvedFeaturePackDependency {
                        required_by: coordinate.to_string(),
                        dependency: target,
                    });
                }
                if reached.insert(target.clone()) {
                    queue.push_back(target.clone());
                }
                resolved.push(target);
            }
            dependencies.insert(coordinate, resolved);
        }

        let mut by_ga: HashMap<String, ArtifactCoordinate> = HashMap::new();
        let mut versions: BTreeMap<String, BTreeSet<String>> = BTreeMap::new();
        for coordinate in &reached {
            versions
                .entry(coordinate.ga())
                .or_default()
                .insert(coordinate.to_string());
            by_ga.insert(coordinate.ga(), coordinate.clone());
        }
        if let Some((ga, conflicting)) = versions.into_iter().find(|(_, v)| v.len() > 1) {
            return Err(ResolutionError::FeaturePackVersionConflict {
                ga,
                versions: conflicting.into_iter().collect(),
            });
        }

        let order = install_order(&top_level, &dependencies);
        let selections = package_selections(registry, request, &order)?;

        info!(
            packs = order.len(),
            top_level = top_level.len(),
            "Resolved feature-pack layout"
        );

        Ok(Self {
            registry,
            order,
            top_level,
            by_ga,
            dependencies,
            selections,
        })
    }

    pub fn registry(&self) -> &'r FeatureSpecRegistry {
        self.registry
    }

    /// Packs in install order: dependencies first
    pub fn order(&self) -> &[ArtifactCoordinate] {
        &self.order
    }

    pub fn top_level(&self) -> &[ArtifactCoordinate] {
        &self.top_level
    }

    pub fn pack(&self, coordinate: &ArtifactCoordinate) -> Result<&'r Arc<FeaturePack>, ResolutionError> {
        pack_of(self.registry, coordinate)
    }

    pub fn coordinate_for_ga(&self, ga: &str) -> Option<&ArtifactCoordinate> {
        self.by_ga.get(ga)
    }

    /// Direct dependencies of a pack, versions as resolved
    pub fn dependencies_of(&self, coordinate: &ArtifactCoordinate) -> &[ArtifactCoordinate] {
        self.dependencies
            .get(coordinate)
            .map(Vec::as_slice)
            .unwrap_or_default()
    }

    /// Every pack reachable from `coordinate`, excluding itself
    pub fn transitive_dependencies(&self, coordinate: &ArtifactCoordinate) -> HashSet<ArtifactCoordinate> {
        let mut path = self.bfs(std::slice::from_ref(coordinate));
        path.shift_remove(coordinate);
        path.into_iter().collect()
    }

    /// Packs searched for an unqualified spec or group name.
    ///
    /// From a pack: the pack, then its dependencies breadth first. From the
    /// request: the top-level packs in request order, then their dependencies.
    pub fn search_path(&self, context: Option<&ArtifactCoordinate>) -> Vec<ArtifactCoordinate> {
        let visited = match context {
            Some(coordinate) => self.bfs(std::slice::from_ref(coordinate)),
            None => self.bfs(&self.top_level),
        };
        visited.into_iter().collect()
    }

    fn bfs(&self, roots: &[ArtifactCoordinate]) -> IndexSet<ArtifactCoordinate> {
        let mut visited: IndexSet<ArtifactCoordinate> = roots.iter().cloned().collect();
        let mut next = 0;
        while next < visited.len() {
            let current = visited[next].clone();
            next += 1;
            for dep in self.dependencies_of(&current) {
                visited.insert(dep.clone());
            }
        }
        visited
    }

    /// Map an origin (dependency alias or `group:artifact`) to a pack in scope
    pub fn resolve_origin(
        &self,
        context: Option<&ArtifactCoordinate>,
        origin: &str,
    ) -> Result<ArtifactCoordinate, ResolutionError> {
        let ga = match context {
            Some(coordinate) => self.pack(coordinate)?.origin_ga(origin),
            None => None,
        }
        .unwrap_or_else(|| origin.to_string());

        self.by_ga
            .get(&ga)
            .cloned()
            .ok_or_else(|| ResolutionError::UnresolvedOrigin {
                context: context_name(context),
                origin: origin.to_string(),
            })
    }

    /// Find a feature spec, returning the pack that declares it
    pub fn find_spec(
        &self,
        context: Option<&ArtifactCoordinate>,
        origin: Option<&str>,
        name: &str,
    ) -> Result<(ArtifactCoordinate, Arc<FeatureSpec>), ResolutionError> {
        let candidates = match origin {
            Some(origin) => vec![self.resolve_origin(context, origin)?],
            None => self.search_path(context),
        };
        candidates
            .into_iter()
            .find_map(|c| self.registry.lookup(&c, name).map(|spec| (c, spec)))
            .ok_or_else(|| ResolutionError::UnresolvedFeatureSpec {
                context: context_name(context),
                spec: name.to_string(),
            })
    }

    /// Find a feature group, returning the pack that declares it
    pub fn find_group(
        &self,
        context: Option<&ArtifactCoordinate>,
        origin: Option<&str>,
        name: &str,
    ) -> Result<(ArtifactCoordinate, &'r FeatureGroupSpec), ResolutionError> {
        let candidates = match origin {
            Some(origin) => vec![self.resolve_origin(context, origin)?],
            None => self.search_path(context),
        };
        for coordinate in candidates {
            if let Some(group) = self.pack(&coordinate)?.feature_group(name) {
                return Ok((coordinate, group));
            }
        }
        Err(ResolutionError::UnresolvedFeatureGroup {
            context: context_name(context),
            group: name.to_string(),
        })
    }

    /// Close every pack's package selection, routing cross-pack demands
    /// until nothing new is demanded.
    pub fn close_packages(
        &self,
        demands: &[PackageDemand],
    ) -> Result<BTreeMap<ArtifactCoordinate, IndexSet<String>>, ResolutionError> {
        let mut demanded: HashMap<ArtifactCoordinate, IndexMap<String, String>> = HashMap::new();
        let mut wanted: HashMap<ArtifactCoordinate, BTreeSet<String>> = HashMap::new();
        for demand in demands {
            if demand.optional {
                wanted
                    .entry(demand.pack.clone())
                    .or_default()
                    .insert(demand.package.clone());
            } else {
                demanded
                    .entry(demand.pack.clone())
                    .or_default()
                    .entry(demand.package.clone())
                    .or_insert_with(|| demand.required_by.clone());
            }
        }

        let mut pass = 0;
        loop {
            pass += 1;
            let mut changed = false;
            let mut closed = BTreeMap::new();

            for coordinate in &self.order {
                let mut request = self.selections.get(coordinate).cloned().unwrap_or_default();
                if let Some(d) = demanded.get(coordinate) {
                    request.demanded = d.clone();
                }
                if let Some(w) = wanted.get(coordinate) {
                    request.wanted = w.clone();
                }

                let closure = self.pack(coordinate)?.graph().close(&request)?;
                for external in closure.external {
                    let target = self
                        .by_ga
                        .get(&external.origin_ga)
                        .cloned()
                        .ok_or_else(|| ResolutionError::UnresolvedOrigin {
                            context: coordinate.to_string(),
                            origin: external.origin_ga.clone(),
                        })?;
                    changed |= if external.optional {
                        wanted.entry(target).or_default().insert(external.package)
                    } else {
                        let entry = demanded.entry(target).or_default();
                        if entry.contains_key(&external.package) {
                            false
                        } else {
                            entry.insert(external.package, external.required_by);
                            true
                        }
                    };
                }
                closed.insert(coordinate.clone(), closure.packages);
            }

            if !changed {
                debug!(passes = pass, "Closed package dependencies");
                return Ok(closed);
            }
        }
    }
}

fn pack_of<'r>(
    registry: &'r FeatureSpecRegistry,
    coordinate: &ArtifactCoordinate,
) -> Result<&'r Arc<FeaturePack>, ResolutionError> {
    registry
        .pack(coordinate)
        .ok_or_else(|| ResolutionError::UnresolvedFeaturePackDependency {
            required_by: REQUEST_CONTEXT.to_string(),
            dependency: coordinate.clone(),
        })
}

pub(crate) fn context_name(context: Option<&ArtifactCoordinate>) -> String {
    context.map_or_else(|| REQUEST_CONTEXT.to_string(), ToString::to_string)
}

fn sorted_strings<'a>(coordinates: impl IntoIterator<Item = &'a ArtifactCoordinate>) -> Vec<String> {
    let set: BTreeSet<String> = coordinates.into_iter().map(ToString::to_string).collect();
    set.into_iter().collect()
}

/// Depth-first post-order from the top-level packs, dependencies in
/// declaration order. Cycles between packs are cut at the first revisit.
fn install_order(
    top_level: &[ArtifactCoordinate],
    dependencies: &HashMap<ArtifactCoordinate, Vec<ArtifactCoordinate>>,
) -> Vec<ArtifactCoordinate> {
    fn visit(
        coordinate: &ArtifactCoordinate,
        dependencies: &HashMap<ArtifactCoordinate, Vec<ArtifactCoordinate>>,
        visited: &mut HashSet<ArtifactCoordinate>,
        order: &mut Vec<ArtifactCoordinate>,
    ) {
        if !visited.insert(coordinate.clone()) {
            return;
        }
        for dep in dependencies.get(coordinate).into_iter().flatten() {
            visit(dep, dependencies, visited, order);
        }
        order.push(coordinate.clone());
    }

    let mut visited = HashSet::new();
    let mut order = Vec::new();
    for coordinate in top_level {
        visit(coordinate, dependencies, &mut visited, &mut order);
    }
    order
}

fn package_selections(
    registry: &FeatureSpecRegistry,
    request: &ProvisioningRequest,
    order: &[ArtifactCoordinate],
) -> Result<HashMap<ArtifactCoordinate, PackageRequest>, ResolutionError> {
    // Everything dependents declare about each pack
    let mut inherited: HashMap<String, Vec<&PackageSelection>> = HashMap::new();
    for coordinate in order {
        for dep in pack_of(registry, coordinate)?.dependencies() {
            inherited
                .entry(dep.coordinate.ga())
                .or_default()
                .push(&dep.packages);
        }
    }

    let mut selections = HashMap::new();
    for coordinate in order {
        let declared = inherited.get(&coordinate.ga()).map(Vec::as_slice).unwrap_or_default();
        let explicit = request.selection(coordinate).map(|s| &s.packages);

        let inherited_include: BTreeSet<String> =
            declared.iter().flat_map(|s| s.include.iter().cloned()).collect();
        let inherited_exclude: BTreeSet<String> =
            declared.iter().flat_map(|s| s.exclude.iter().cloned()).collect();
        let explicit_include: BTreeSet<String> =
            explicit.map(|s| s.include.iter().cloned().collect()).unwrap_or_default();
        let explicit_exclude: BTreeSet<String> =
            explicit.map(|s| s.exclude.iter().cloned().collect()).unwrap_or_default();

        let include_defaults = match explicit {
            Some(selection) => selection.inherit,
            None => declared.iter().any(|s| s.inherit),
        };
        let include: BTreeSet<String> = inherited_include
            .union(&explicit_include)
            .filter(|p| !explicit_exclude.contains(*p))
            .cloned()
            .collect();
        let exclude: BTreeSet<String> = inherited_exclude
            .iter()
            .filter(|p| !inherited_include.contains(*p) && !explicit_include.contains(*p))
            .cloned()
            .chain(explicit_exclude.iter().cloned())
            .collect();

        selections.insert(
            coordinate.clone(),
            PackageRequest {
                include_defaults,
                include,
                exclude,
                ..PackageRequest::default()
            },
        );
    }
    Ok(selections)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::descriptor::{FeaturePackDependency, FeaturePackSpec, PackageDependency, PackageSpec};
    use crate::request::FeaturePackSelection;

    fn coord(text: &str) -> ArtifactCoordinate {
        text.parse().unwrap()
    }

    fn registry(specs: Vec<FeaturePackSpec>) -> FeatureSpecRegistry {
        let mut registry = FeatureSpecRegistry::new();
        for spec in specs {
            registry.register(spec).unwrap();
        }
        registry
    }

    fn packages(
        closed: &BTreeMap<ArtifactCoordinate, IndexSet<String>>,
        coordinate: &str,
    ) -> Vec<String> {
        let mut v: Vec<String> = closed[&coord(coordinate)].iter().cloned().collect();
        v.sort();
        v
    }

    // ========================================================================
    // Layout Tests
    // ========================================================================

    #[test]
    fn test_order_puts_dependencies_first() {
        let reg = registry(vec![
            FeaturePackSpec::new(coord("g:base:1")),
            FeaturePackSpec::new(coord("g:mid:1"))
                .with_dependency(FeaturePackDependency::new(coord("g:base:1"))),
            FeaturePackSpec::new(coord("g:app:1"))
                .with_dependency(FeaturePackDependency::new(coord("g:mid:1")))
                .with_dependency(FeaturePackDependency::new(coord("g:base:1"))),
        ]);
        let request = ProvisioningRequest::new()
            .with_feature_pack(FeaturePackSelection::new(coord("g:app:1")));
        let layout = FeaturePackLayout::resolve(&reg, &request).unwrap();
        assert_eq!(
            layout.order(),
            &[coord("g:base:1"), coord("g:mid:1"), coord("g:app:1")]
        );
        assert_eq!(
            layout.search_path(Some(&coord("g:app:1"))),
            vec![coord("g:app:1"), coord("g:mid:1"), coord("g:base:1")]
        );
    }

    #[test]
    fn test_missing_dependency_is_unresolved() {
        let reg = registry(vec![FeaturePackSpec::new(coord("g:app:1"))
            .with_dependency(FeaturePackDependency::new(coord("g:base:1")))]);
        let request = ProvisioningRequest::new()
            .with_feature_pack(FeaturePackSelection::new(coord("g:app:1")));
        let err = FeaturePackLayout::resolve(&reg, &request).unwrap_err();
        assert_eq!(
            err,
            ResolutionError::UnresolvedFeaturePackDependency {
                required_by: "g:app:1".to_string(),
                dependency: coord("g:base:1"),
            }
        );
    }

    #[test]
    fn test_version_conflict_without_pin() {
        let reg = registry(vec![
            FeaturePackSpec::new(coord("g:base:1")),
            FeaturePackSpec::new(coord("g:base:2")),
            FeaturePackSpec::new(coord("g:a:1"))
                .with_dependency(FeaturePackDependency::new(coord("g:base:1"))),
            FeaturePackSpec::new(coord("g:b:1"))
                .with_dependency(FeaturePackDependency::new(coord("g:base:2"))),
        ]);
        let request = ProvisioningRequest::new()
            .with_feature_pack(FeaturePackSelection::new(coord("g:a:1")))
            .with_feature_pack(FeaturePackSelection::new(coord("g:b:1")));
        let err = FeaturePackLayout::resolve(&reg, &request).unwrap_err();
        assert_eq!(
            err,
            ResolutionError::FeaturePackVersionConflict {
                ga: "g:base".to_string(),
                versions: vec!["g:base:1".to_string(), "g:base:2".to_string()],
            }
        );

        // pinning the version at the top level settles it
        let pinned = request.with_feature_pack(FeaturePackSelection::new(coord("g:base:2")));
        let layout = FeaturePackLayout::resolve(&reg, &pinned).unwrap();
        assert_eq!(layout.coordinate_for_ga("g:base"), Some(&coord("g:base:2")));
        assert!(!layout.order().contains(&coord("g:base:1")));
    }

    // ========================================================================
    // Package Selection Tests
    // ========================================================================

    #[test]
    fn test_explicit_selection_overrides_inherited() {
        let reg = registry(vec![
            FeaturePackSpec::new(coord("g:fp2:1"))
                .with_package(PackageSpec::new("p2"))
                .with_package(PackageSpec::new("p3").non_default()),
            FeaturePackSpec::new(coord("g:fp1:1"))
                .with_package(PackageSpec::new("p1"))
                .with_dependency(
                    FeaturePackDependency::new(coord("g:fp2:1"))
                        .with_packages(PackageSelection::none().include("p3")),
                ),
        ]);
        let request = ProvisioningRequest::new().with_feature_pack(
            FeaturePackSelection::new(coord("g:fp1:1")).exclude_package("p1"),
        );
        let layout = FeaturePackLayout::resolve(&reg, &request).unwrap();
        let closed = layout.close_packages(&[]).unwrap();
        assert!(packages(&closed, "g:fp1:1").is_empty());
        assert_eq!(packages(&closed, "g:fp2:1"), vec!["p3"]);
    }

    #[test]
    fn test_top_level_selection_beats_dependent_declaration() {
        let reg = registry(vec![
            FeaturePackSpec::new(coord("g:fp2:1"))
                .with_package(PackageSpec::new("p2"))
                .with_package(PackageSpec::new("p3").non_default()),
            FeaturePackSpec::new(coord("g:fp1:1")).with_dependency(
                FeaturePackDependency::new(coord("g:fp2:1"))
                    .with_packages(PackageSelection::inherit_defaults().include("p3")),
            ),
        ]);
        let request = ProvisioningRequest::new()
            .with_feature_pack(FeaturePackSelection::new(coord("g:fp1:1")))
            .with_feature_pack(FeaturePackSelection::new(coord("g:fp2:1")).exclude_package("p3"));
        let layout = FeaturePackLayout::resolve(&reg, &request).unwrap();
        let closed = layout.close_packages(&[]).unwrap();
        assert_eq!(packages(&closed, "g:fp2:1"), vec!["p2"]);
    }

    #[test]
    fn test_cross_pack_dependencies_are_routed() {
        let reg = registry(vec![
            FeaturePackSpec::new(coord("g:base:1"))
                .with_package(PackageSpec::new("b1").non_default())
                .with_package(PackageSpec::new("b2").non_default()),
            FeaturePackSpec::new(coord("g:app:1"))
                .with_dependency(
                    FeaturePackDependency::new(coord("g:base:1"))
                        .named("base")
                        .with_packages(PackageSelection::none()),
                )
                .with_package(
                    PackageSpec::new("a1")
                        .with_dependency(PackageDependency::required("b1").from_origin("base"))
                        .with_dependency(PackageDependency::optional("b2").from_origin("base")),
                ),
        ]);
        let request = ProvisioningRequest::new()
            .with_feature_pack(FeaturePackSelection::new(coord("g:app:1")));
        let layout = FeaturePackLayout::resolve(&reg, &request).unwrap();
        let closed = layout.close_packages(&[]).unwrap();
        assert_eq!(packages(&closed, "g:base:1"), vec!["b1", "b2"]);
    }

    #[test]
    fn test_demands_on_excluded_package_fail() {
        let reg = registry(vec![
            FeaturePackSpec::new(coord("g:fp1:1")).with_package(PackageSpec::new("p1")),
        ]);
        let request = ProvisioningRequest::new().with_feature_pack(
            FeaturePackSelection::new(coord("g:fp1:1")).exclude_package("p1"),
        );
        let layout = FeaturePackLayout::resolve(&reg, &request).unwrap();
        let err = layout
            .close_packages(&[PackageDemand {
                pack: coord("g:fp1:1"),
                package: "p1".to_string(),
                optional: false,
                required_by: "feature spec 'specA'".to_string(),
            }])
            .unwrap_err();
        assert!(matches!(err, ResolutionError::RequiredPackageExcluded { .. }));
    }

    #[test]
    fn test_unknown_request_origin() {
        let reg = registry(vec![FeaturePackSpec::new(coord("g:fp1:1"))]);
        let request = ProvisioningRequest::new()
            .with_feature_pack(FeaturePackSelection::new(coord("g:fp1:1")));
        let layout = FeaturePackLayout::resolve(&reg, &request).unwrap();
        assert_eq!(layout.resolve_origin(None, "g:fp1").unwrap(), coord("g:fp1:1"));
        assert!(matches!(
            layout.resolve_origin(None, "g:other"),
            Err(ResolutionError::UnresolvedOrigin { .. })
        ));
    }
}
