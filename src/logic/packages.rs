//! Package dependency graph of one feature pack.
//!
//! # Design
//!
//! - **Validated once**: [`PackageGraph::build`] runs when a pack is
//!   registered. A required edge to a missing package, or an edge declared both
//!   required and optional, is a [`DescriptionError`] of that pack.
//! - **Pure closure**: [`PackageGraph::close`] has no side effects and never
//!   looks at other packs. Edges into other packs are returned as
//!   [`ExternalPackageDemand`]s for the layout resolver to route.
//!
//! # Closure rules
//!
//! | Edge                         | Target excluded              | Target missing        |
//! |------------------------------|------------------------------|-----------------------|
//! | required                     | `RequiredPackageExcluded`    | rejected at build     |
//! | optional                     | skipped                      | skipped               |

use std::collections::BTreeSet;

use indexmap::{IndexMap, IndexSet};

use crate::coordinate::ArtifactCoordinate;
use crate::descriptor::FeaturePackSpec;
use crate::error::{DescriptionError, ResolutionError};

// ============================================================================
// Graph
// ============================================================================

#[derive(Debug, Clone, PartialEq, Eq)]
struct LocalEdge {
    target: String,
    optional: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
struct ExternalEdge {
    origin_ga: String,
    target: String,
    optional: bool,
}

#[derive(Debug, Clone, Default)]
struct PackageNode {
    default: bool,
    local: Vec<LocalEdge>,
    external: Vec<ExternalEdge>,
}

/// A package of another feature pack that a closed package depends on.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExternalPackageDemand {
    /// `group:artifact` of the pack owning the package
    pub origin_ga: String,
    pub package: String,
    pub optional: bool,
    pub required_by: String,
}

/// Inputs of one closure.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PackageRequest {
    pub include_defaults: bool,
    pub include: BTreeSet<String>,
    pub exclude: BTreeSet<String>,
    /// Packages something outside the pack requires, with who requires them
    pub demanded: IndexMap<String, String>,
    /// Packages something outside the pack would like, unless excluded
    pub wanted: BTreeSet<String>,
}

/// Result of [`PackageGraph::close`].
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PackageClosure {
    /// Installed packages in closure order
    pub packages: IndexSet<String>,
    pub external: Vec<ExternalPackageDemand>,
}

/// Validated package graph of a single feature pack.
#[derive(Debug, Clone)]
pub struct PackageGraph {
    pack: ArtifactCoordinate,
    nodes: IndexMap<String, PackageNode>,
}

impl PackageGraph {
    /// Validate the pack's package declarations.
    ///
    /// `origin_ga` maps a dependency alias or `group:artifact` to the
    /// `group:artifact` of a declared dependency.
    pub fn build(
        spec: &FeaturePackSpec,
        origin_ga: impl Fn(&str) -> Option<String>,
    ) -> Result<Self, DescriptionError> {
        let pack = spec.coordinate.clone();
        let mut nodes: IndexMap<String, PackageNode> = IndexMap::new();

        for package in &spec.packages {
            if nodes.contains_key(&package.name) {
                return Err(DescriptionError::DuplicateName {
                    pack,
                    kind: "package",
                    name: package.name.clone(),
                });
            }
            nodes.insert(
                package.name.clone(),
                PackageNode {
                    default: package.default,
                    ..PackageNode::default()
                },
            );
        }

        for package in &spec.packages {
            let mut local: Vec<LocalEdge> = Vec::new();
            let mut external: Vec<ExternalEdge> = Vec::new();

            for dep in &package.dependencies {
                let inconsistent = || DescriptionError::InconsistentPackageDependency {
                    pack: pack.clone(),
                    package: package.name.clone(),
                    dependency: dep.name.clone(),
                };

                match &dep.origin {
                    None => {
                        if let Some(existing) = local.iter().find(|e| e.target == dep.name) {
                            if existing.optional != dep.optional {
                                return Err(inconsistent());
                            }
                            continue;
                        }
                        if !dep.optional && !nodes.contains_key(&dep.name) {
                            return Err(DescriptionError::MissingPackageDependency {
                                pack: pack.clone(),
                                package: package.name.clone(),
                                dependency: dep.name.clone(),
                            });
                        }
                        local.push(LocalEdge {
                            target: dep.name.clone(),
                            optional: dep.optional,
                        });
                    }
                    Some(origin) => {
                        let ga = origin_ga(origin).ok_or_else(|| DescriptionError::UnknownOrigin {
                            pack: pack.clone(),
                            origin: origin.clone(),
                            declared_by: format!("package '{}'", package.name),
                        })?;
                        if let Some(existing) = external
                            .iter()
                            .find(|e| e.origin_ga == ga && e.target == dep.name)
                        {
                            if existing.optional != dep.optional {
                                return Err(inconsistent());
                            }
                            continue;
                        }
                        external.push(ExternalEdge {
                            origin_ga: ga,
                            target: dep.name.clone(),
                            optional: dep.optional,
                        });
                    }
                }
            }

            if let Some(node) = nodes.get_mut(&package.name) {
                node.local = local;
                node.external = external;
            }
        }

        Ok(Self { pack, nodes })
    }

    pub fn contains(&self, package: &str) -> bool {
        self.nodes.contains_key(package)
    }

    /// Packages flagged as default, in declaration order
    pub fn defaults(&self) -> impl Iterator<Item = &str> {
        self.nodes
            .iter()
            .filter(|(_, node)| node.default)
            .map(|(name, _)| name.as_str())
    }

    fn unresolved(&self, package: &str) -> ResolutionError {
        ResolutionError::UnresolvedPackage {
            pack: self.pack.clone(),
            package: package.to_string(),
        }
    }

    /// Compute the installed package set for one selection.
    pub fn close(&self, request: &PackageRequest) -> Result<PackageClosure, ResolutionError> {
        for name in request.include.iter().chain(&request.exclude) {
            if !self.contains(name) {
                return Err(self.unresolved(name));
            }
        }

        // (package, who pulled it in)
        let mut queue: Vec<(String, String)> = Vec::new();

        for (name, required_by) in &request.demanded {
            if !self.contains(name) {
                return Err(self.unresolved(name));
            }
            if request.exclude.contains(name) {
                return Err(ResolutionError::RequiredPackageExcluded {
                    pack: self.pack.clone(),
                    package: name.clone(),
                    required_by: required_by.clone(),
                });
            }
            queue.push((name.clone(), required_by.clone()));
        }
        if request.include_defaults {
            for name in self.defaults() {
                if !request.exclude.contains(name) {
                    queue.push((name.to_string(), "default selection".to_string()));
                }
            }
        }
        for name in &request.include {
            if !request.exclude.contains(name) {
                queue.push((name.clone(), "explicit selection".to_string()));
            }
        }
        for name in &request.wanted {
            if self.contains(name) && !request.exclude.contains(name) {
                queue.push((name.clone(), "optional dependency".to_string()));
            }
        }

        let mut closure = PackageClosure::default();
        let mut next = 0;
        while next < queue.len() {
            let (name, _) = queue[next].clone();
            next += 1;
            if !closure.packages.insert(name.clone()) {
                continue;
            }
            let Some(node) = self.nodes.get(&name) else {
                continue;
            };
            let required_by = format!("package '{name}' of {}", self.pack);

            for edge in &node.local {
                if request.exclude.contains(&edge.target) {
                    if edge.optional {
                        continue;
                    }
                    return Err(ResolutionError::RequiredPackageExcluded {
                        pack: self.pack.clone(),
                        package: edge.target.clone(),
                        required_by,
                    });
                }
                if self.contains(&edge.target) {
                    queue.push((edge.target.clone(), required_by.clone()));
                }
            }
            for edge in &node.external {
                closure.external.push(ExternalPackageDemand {
                    origin_ga: edge.origin_ga.clone(),
                    package: edge.target.clone(),
                    optional: edge.optional,
                    required_by: required_by.clone(),
                });
            }
        }

        Ok(closure)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::descriptor::{FeaturePackDependency, PackageDependency, PackageSpec};

    fn coord() -> ArtifactCoordinate {
        "org.test:fp1:1.0.0".parse().unwrap()
    }

    fn no_origins(_: &str) -> Option<String> {
        None
    }

    fn graph(packages: Vec<PackageSpec>) -> PackageGraph {
        let mut spec = FeaturePackSpec::new(coord());
        spec.packages = packages;
        PackageGraph::build(&spec, no_origins).unwrap()
    }

    fn names(closure: &PackageClosure) -> Vec<&str> {
        let mut v: Vec<&str> = closure.packages.iter().map(String::as_str).collect();
        v.sort();
        v
    }

    // ========================================================================
    // Build Validation Tests
    // ========================================================================

    #[test]
    fn test_missing_required_target_is_description_error() {
        let mut spec = FeaturePackSpec::new(coord());
        spec.packages = vec![PackageSpec::new("p1").requires("p9")];
        let err = PackageGraph::build(&spec, no_origins).unwrap_err();
        assert!(matches!(
            err,
            DescriptionError::MissingPackageDependency { ref dependency, .. } if dependency == "p9"
        ));
    }

    #[test]
    fn test_missing_optional_target_is_allowed() {
        let g = graph(vec![PackageSpec::new("p1").optionally("p9")]);
        let closure = g.close(&PackageRequest {
            include_defaults: true,
            ..Default::default()
        });
        assert_eq!(names(&closure.unwrap()), vec!["p1"]);
    }

    #[test]
    fn test_inconsistent_classification_is_rejected() {
        let mut spec = FeaturePackSpec::new(coord());
        spec.packages = vec![
            PackageSpec::new("p1").requires("p2").optionally("p2"),
            PackageSpec::new("p2"),
        ];
        let err = PackageGraph::build(&spec, no_origins).unwrap_err();
        assert!(matches!(err, DescriptionError::InconsistentPackageDependency { .. }));
    }

    #[test]
    fn test_duplicate_package_name_is_rejected() {
        let mut spec = FeaturePackSpec::new(coord());
        spec.packages = vec![PackageSpec::new("p1"), PackageSpec::new("p1")];
        let err = PackageGraph::build(&spec, no_origins).unwrap_err();
        assert!(matches!(err, DescriptionError::DuplicateName { kind: "package", .. }));
    }

    #[test]
    fn test_unknown_origin_is_rejected() {
        let mut spec = FeaturePackSpec::new(coord());
        spec.packages = vec![PackageSpec::new("p1")
            .with_dependency(PackageDependency::required("x").from_origin("nope"))];
        let err = PackageGraph::build(&spec, no_origins).unwrap_err();
        assert!(matches!(err, DescriptionError::UnknownOrigin { ref origin, .. } if origin == "nope"));
    }

    // ========================================================================
    // Closure Tests
    // ========================================================================

    #[test]
    fn test_defaults_close_over_required() {
        let g = graph(vec![
            PackageSpec::new("p1").requires("p2"),
            PackageSpec::new("p2").non_default().requires("p3"),
            PackageSpec::new("p3").non_default(),
            PackageSpec::new("p4").non_default(),
        ]);
        let closure = g
            .close(&PackageRequest {
                include_defaults: true,
                ..Default::default()
            })
            .unwrap();
        assert_eq!(names(&closure), vec!["p1", "p2", "p3"]);
    }

    #[test]
    fn test_optional_followed_unless_excluded() {
        let g = graph(vec![
            PackageSpec::new("p1").optionally("p2"),
            PackageSpec::new("p2").non_default(),
        ]);
        let with = g
            .close(&PackageRequest {
                include_defaults: true,
                ..Default::default()
            })
            .unwrap();
        assert_eq!(names(&with), vec!["p1", "p2"]);

        let without = g
            .close(&PackageRequest {
                include_defaults: true,
                exclude: ["p2".to_string()].into(),
                ..Default::default()
            })
            .unwrap();
        assert_eq!(names(&without), vec!["p1"]);
    }

    #[test]
    fn test_excluding_required_package_fails() {
        let g = graph(vec![PackageSpec::new("p1").requires("p2"), PackageSpec::new("p2")]);
        let err = g
            .close(&PackageRequest {
                include_defaults: true,
                exclude: ["p2".to_string()].into(),
                ..Default::default()
            })
            .unwrap_err();
        assert!(matches!(
            err,
            ResolutionError::RequiredPackageExcluded { ref package, .. } if package == "p2"
        ));
    }

    #[test]
    fn test_optional_cycle_terminates() {
        let g = graph(vec![
            PackageSpec::new("p1").optionally("p2"),
            PackageSpec::new("p2").optionally("p1"),
        ]);
        let closure = g
            .close(&PackageRequest {
                include_defaults: true,
                ..Default::default()
            })
            .unwrap();
        assert_eq!(names(&closure), vec!["p1", "p2"]);
    }

    #[test]
    fn test_unknown_included_package_fails() {
        let g = graph(vec![PackageSpec::new("p1")]);
        let err = g
            .close(&PackageRequest {
                include: ["p7".to_string()].into(),
                ..Default::default()
            })
            .unwrap_err();
        assert!(matches!(err, ResolutionError::UnresolvedPackage { .. }));
    }

    #[test]
    fn test_external_edges_are_reported() {
        let mut spec = FeaturePackSpec::new(coord())
            .with_dependency(FeaturePackDependency::new("org.test:base:1.0".parse().unwrap()).named("base"));
        spec.packages = vec![PackageSpec::new("p1")
            .with_dependency(PackageDependency::required("b1").from_origin("base"))];
        let g = PackageGraph::build(&spec, |origin| {
            (origin == "base").then(|| "org.test:base".to_string())
        })
        .unwrap();

        let closure = g
            .close(&PackageRequest {
                include_defaults: true,
                ..Default::default()
            })
            .unwrap();
        assert_eq!(closure.external.len(), 1);
        assert_eq!(closure.external[0].origin_ga, "org.test:base");
        assert_eq!(closure.external[0].package, "b1");
        assert!(!closure.external[0].optional);
    }
}
