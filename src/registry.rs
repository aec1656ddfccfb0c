//! Feature spec registry.
//!
//! Holds every registered feature pack, validated and indexed by name. The
//! registry is built once and then only read; a provisioning run borrows it
//! and never changes it, so the same registry serves any number of runs.

use std::collections::HashSet;
use std::sync::Arc;

use indexmap::IndexMap;
use tracing::debug;

use crate::coordinate::ArtifactCoordinate;
use crate::descriptor::{
    ConfigModel, FeatureGroupSpec, FeaturePackDependency, FeaturePackSpec, FeatureSpec,
    PackageSpec,
};
use crate::error::DescriptionError;
use crate::logic::packages::PackageGraph;
use crate::plugin::PluginDescriptor;

// ============================================================================
// Feature pack
// ============================================================================

/// A registered, validated feature pack.
#[derive(Debug)]
pub struct FeaturePack {
    coordinate: ArtifactCoordinate,
    dependencies: Vec<FeaturePackDependency>,
    packages: IndexMap<String, PackageSpec>,
    feature_specs: IndexMap<String, Arc<FeatureSpec>>,
    feature_groups: IndexMap<String, FeatureGroupSpec>,
    configs: Vec<ConfigModel>,
    plugins: Vec<PluginDescriptor>,
    graph: PackageGraph,
}

impl FeaturePack {
    /// Validate a descriptor and index its declarations.
    pub fn build(spec: FeaturePackSpec) -> Result<Self, DescriptionError> {
        let coordinate = spec.coordinate.clone();
        let origin_ga = |origin: &str| dependency_ga(&spec.dependencies, origin);

        for package in &spec.packages {
            check_path_name(&coordinate, "package", &package.name)?;
        }
        let graph = PackageGraph::build(&spec, origin_ga)?;

        let mut aliases = HashSet::new();
        for dep in &spec.dependencies {
            if let Some(name) = &dep.name {
                if !aliases.insert(name.as_str()) {
                    return Err(duplicate(&coordinate, "dependency alias", name));
                }
            }
        }

        let mut feature_specs = IndexMap::new();
        for feature_spec in &spec.feature_specs {
            validate_feature_spec(&coordinate, feature_spec, &spec, &graph)?;
            if feature_specs
                .insert(feature_spec.name.clone(), Arc::new(feature_spec.clone()))
                .is_some()
            {
                return Err(duplicate(&coordinate, "feature spec", &feature_spec.name));
            }
        }

        let mut feature_groups = IndexMap::new();
        for group in &spec.feature_groups {
            if feature_groups
                .insert(group.name.clone(), group.clone())
                .is_some()
            {
                return Err(duplicate(&coordinate, "feature group", &group.name));
            }
        }

        let mut config_ids = HashSet::new();
        for config in &spec.configs {
            if let Some(model) = &config.model {
                check_path_name(&coordinate, "config model", model)?;
            }
            if let Some(name) = &config.name {
                check_path_name(&coordinate, "config", name)?;
            }
            if let Some(id) = config.config_ref() {
                if !config_ids.insert(id.clone()) {
                    return Err(duplicate(&coordinate, "config", &id.to_string()));
                }
            }
        }

        let packages = spec
            .packages
            .iter()
            .map(|p| (p.name.clone(), p.clone()))
            .collect();

        Ok(Self {
            coordinate,
            dependencies: spec.dependencies,
            packages,
            feature_specs,
            feature_groups,
            configs: spec.configs,
            plugins: spec.plugins,
            graph,
        })
    }

    pub fn coordinate(&self) -> &ArtifactCoordinate {
        &self.coordinate
    }

    pub fn dependencies(&self) -> &[FeaturePackDependency] {
        &self.dependencies
    }

    pub fn packages(&self) -> &IndexMap<String, PackageSpec> {
        &self.packages
    }

    pub fn feature_spec(&self, name: &str) -> Option<&Arc<FeatureSpec>> {
        self.feature_specs.get(name)
    }

    pub fn feature_group(&self, name: &str) -> Option<&FeatureGroupSpec> {
        self.feature_groups.get(name)
    }

    pub fn configs(&self) -> &[ConfigModel] {
        &self.configs
    }

    pub fn plugins(&self) -> &[PluginDescriptor] {
        &self.plugins
    }

    pub fn graph(&self) -> &PackageGraph {
        &self.graph
    }

    /// `group:artifact` of the dependency an origin names (alias or ga)
    pub fn origin_ga(&self, origin: &str) -> Option<String> {
        dependency_ga(&self.dependencies, origin)
    }
}

fn dependency_ga(dependencies: &[FeaturePackDependency], origin: &str) -> Option<String> {
    dependencies
        .iter()
        .find(|d| d.name.as_deref() == Some(origin) || d.coordinate.ga() == origin)
        .map(|d| d.coordinate.ga())
}

/// Package and config names become directory and file names on install.
fn check_path_name(
    pack: &ArtifactCoordinate,
    kind: &'static str,
    name: &str,
) -> Result<(), DescriptionError> {
    let escapes = name.trim().is_empty()
        || name.contains(['/', '\\'])
        || name == "."
        || name == "..";
    if escapes {
        return Err(DescriptionError::InvalidName {
            pack: pack.clone(),
            kind,
            name: name.to_string(),
        });
    }
    Ok(())
}

fn duplicate(pack: &ArtifactCoordinate, kind: &'static str, name: &str) -> DescriptionError {
    DescriptionError::DuplicateName {
        pack: pack.clone(),
        kind,
        name: name.to_string(),
    }
}

fn validate_feature_spec(
    pack: &ArtifactCoordinate,
    feature_spec: &FeatureSpec,
    spec: &FeaturePackSpec,
    graph: &PackageGraph,
) -> Result<(), DescriptionError> {
    let invalid = |param: &str, reason: &str| DescriptionError::InvalidParameter {
        pack: pack.clone(),
        spec: feature_spec.name.clone(),
        param: param.to_string(),
        reason: reason.to_string(),
    };

    let mut seen = HashSet::new();
    for param in &feature_spec.params {
        if !seen.insert(param.name.as_str()) {
            return Err(invalid(&param.name, "declared more than once"));
        }
        if param.feature_id && param.nillable {
            return Err(invalid(&param.name, "an id parameter cannot be nillable"));
        }
    }
    for reference in &feature_spec.references {
        for local in reference.mappings.keys() {
            if !seen.contains(local.as_str()) {
                return Err(invalid(
                    local,
                    &format!("mapped by reference '{}' but not declared", reference.reference_name()),
                ));
            }
        }
    }

    for package in &feature_spec.packages {
        match &package.origin {
            None if !graph.contains(&package.name) => {
                return Err(DescriptionError::MissingSpecPackage {
                    pack: pack.clone(),
                    spec: feature_spec.name.clone(),
                    package: package.name.clone(),
                });
            }
            Some(origin) if dependency_ga(&spec.dependencies, origin).is_none() => {
                return Err(DescriptionError::UnknownOrigin {
                    pack: pack.clone(),
                    origin: origin.clone(),
                    declared_by: format!("feature spec '{}'", feature_spec.name),
                });
            }
            _ => {}
        }
    }
    Ok(())
}

// ============================================================================
// Registry
// ============================================================================

/// Registry of feature packs, keyed by coordinate.
#[derive(Debug, Default, Clone)]
pub struct FeatureSpecRegistry {
    packs: IndexMap<ArtifactCoordinate, Arc<FeaturePack>>,
}

impl FeatureSpecRegistry {
    /// Create a new empty registry
    pub fn new() -> Self {
        Self::default()
    }

    /// Validate and register a feature pack
    pub fn register(&mut self, spec: FeaturePackSpec) -> Result<(), DescriptionError> {
        if self.packs.contains_key(&spec.coordinate) {
            return Err(DescriptionError::DuplicateFeaturePack {
                pack: spec.coordinate,
            });
        }
        let pack = FeaturePack::build(spec)?;
        debug!(
            pack = %pack.coordinate,
            packages = pack.packages.len(),
            specs = pack.feature_specs.len(),
            "Registered feature pack"
        );
        self.packs.insert(pack.coordinate.clone(), Arc::new(pack));
        Ok(())
    }

    pub fn pack(&self, coordinate: &ArtifactCoordinate) -> Option<&Arc<FeaturePack>> {
        self.packs.get(coordinate)
    }

    pub fn contains(&self, coordinate: &ArtifactCoordinate) -> bool {
        self.packs.contains_key(coordinate)
    }

    /// Look up a feature spec declared by a pack
    pub fn lookup(&self, coordinate: &ArtifactCoordinate, spec: &str) -> Option<Arc<FeatureSpec>> {
        self.packs
            .get(coordinate)
            .and_then(|pack| pack.feature_spec(spec))
            .cloned()
    }

    /// Packages a pack declares, by name
    pub fn packages_of(
        &self,
        coordinate: &ArtifactCoordinate,
    ) -> Option<&IndexMap<String, PackageSpec>> {
        self.packs.get(coordinate).map(|pack| pack.packages())
    }

    /// Registered coordinates in registration order
    pub fn coordinates(&self) -> impl Iterator<Item = &ArtifactCoordinate> {
        self.packs.keys()
    }

    pub fn len(&self) -> usize {
        self.packs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.packs.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::descriptor::{PackageDependency, ParameterSpec};

    fn coord(text: &str) -> ArtifactCoordinate {
        text.parse().unwrap()
    }

    #[test]
    fn test_register_and_lookup() {
        let mut registry = FeatureSpecRegistry::new();
        registry
            .register(
                FeaturePackSpec::new(coord("g:fp1:1"))
                    .with_package(PackageSpec::new("p1"))
                    .with_feature_spec(FeatureSpec::new("specA").with_param(ParameterSpec::id("name"))),
            )
            .unwrap();

        assert!(registry.lookup(&coord("g:fp1:1"), "specA").is_some());
        assert!(registry.lookup(&coord("g:fp1:1"), "specB").is_none());
        assert!(registry.lookup(&coord("g:fp1:2"), "specA").is_none());
        let packages = registry.packages_of(&coord("g:fp1:1")).unwrap();
        assert!(packages.contains_key("p1"));
    }

    #[test]
    fn test_duplicate_pack_is_rejected() {
        let mut registry = FeatureSpecRegistry::new();
        registry.register(FeaturePackSpec::new(coord("g:fp1:1"))).unwrap();
        let err = registry
            .register(FeaturePackSpec::new(coord("g:fp1:1")))
            .unwrap_err();
        assert!(matches!(err, DescriptionError::DuplicateFeaturePack { .. }));
    }

    #[test]
    fn test_nillable_id_param_is_rejected() {
        let mut param = ParameterSpec::id("name");
        param.nillable = true;
        let err = FeaturePack::build(
            FeaturePackSpec::new(coord("g:fp1:1"))
                .with_feature_spec(FeatureSpec::new("specA").with_param(param)),
        )
        .unwrap_err();
        assert!(matches!(err, DescriptionError::InvalidParameter { .. }));
    }

    #[test]
    fn test_spec_package_must_exist() {
        let err = FeaturePack::build(
            FeaturePackSpec::new(coord("g:fp1:1")).with_feature_spec(
                FeatureSpec::new("specA").with_package(PackageDependency::required("p9")),
            ),
        )
        .unwrap_err();
        assert!(matches!(err, DescriptionError::MissingSpecPackage { .. }));
    }

    #[test]
    fn test_origin_by_alias_or_ga() {
        let pack = FeaturePack::build(
            FeaturePackSpec::new(coord("g:fp1:1"))
                .with_dependency(FeaturePackDependency::new(coord("g:base:1")).named("base")),
        )
        .unwrap();
        assert_eq!(pack.origin_ga("base").as_deref(), Some("g:base"));
        assert_eq!(pack.origin_ga("g:base").as_deref(), Some("g:base"));
        assert_eq!(pack.origin_ga("other"), None);
    }

    #[test]
    fn test_duplicate_feature_spec_is_rejected() {
        let err = FeaturePack::build(
            FeaturePackSpec::new(coord("g:fp1:1"))
                .with_feature_spec(FeatureSpec::new("specA"))
                .with_feature_spec(FeatureSpec::new("specA")),
        )
        .unwrap_err();
        assert!(matches!(err, DescriptionError::DuplicateName { kind: "feature spec", .. }));
    }

    #[test]
    fn test_path_unsafe_names_are_rejected() {
        let pack = || FeaturePackSpec::new(coord("g:fp1:1"));
        let cases = vec![
            pack().with_package(PackageSpec::new("../escape")),
            pack().with_package(PackageSpec::new("/etc")),
            pack().with_package(PackageSpec::new("")),
            pack().with_config(ConfigModel::named("../../x", "config1")),
            pack().with_config(ConfigModel::named("model1", "..")),
            pack().with_config(ConfigModel::named("model1", "a\\b")),
            pack().with_config(ConfigModel::model_defaults("/abs")),
        ];
        for spec in cases {
            let err = FeaturePack::build(spec).unwrap_err();
            assert!(
                matches!(err, DescriptionError::InvalidName { .. }),
                "unexpected error {err:?}"
            );
        }
    }

    #[test]
    fn test_dotted_names_are_allowed() {
        let pack = FeaturePack::build(
            FeaturePackSpec::new(coord("g:fp1:1"))
                .with_package(PackageSpec::new("org.test.core"))
                .with_config(ConfigModel::named("standalone", "server.v2")),
        );
        assert!(pack.is_ok());
    }
}
