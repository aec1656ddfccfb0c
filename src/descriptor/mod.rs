//! Feature-pack descriptors.
//!
//! These types are what a descriptor loader hands to the engine: plain,
//! structurally valid declarations of packages, feature specs, feature groups
//! and config models. They carry no resolution state and are never mutated
//! once registered. Cross-referential consistency is checked by
//! [`crate::registry::FeatureSpecRegistry::register`].
//!
//! The serde representation is the JSON read by [`loader::JsonDescriptorLoader`]:
//!
//! ```json
//! {
//!   "coordinate": "org.acme:core:1.0",
//!   "dependencies": [{ "coordinate": "org.acme:base:1.0", "name": "base" }],
//!   "packages": [{ "name": "p1", "dependencies": [{ "name": "p2", "optional": true }] }],
//!   "feature-specs": [{ "name": "specA", "params": [{ "name": "name", "feature-id": true }] }],
//!   "configs": [{ "model": "standalone", "name": "main.xml", "items": [] }]
//! }
//! ```

pub mod loader;

use std::fmt;

use indexmap::IndexMap;
use serde::{Deserialize, Serialize};

use crate::coordinate::ArtifactCoordinate;
use crate::plugin::PluginDescriptor;

fn default_true() -> bool {
    true
}

fn is_true(value: &bool) -> bool {
    *value
}

// ============================================================================
// Feature packs and packages
// ============================================================================

/// Everything a single feature pack declares.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct FeaturePackSpec {
    pub coordinate: ArtifactCoordinate,
    #[serde(default)]
    pub dependencies: Vec<FeaturePackDependency>,
    #[serde(default)]
    pub packages: Vec<PackageSpec>,
    #[serde(default)]
    pub feature_specs: Vec<FeatureSpec>,
    #[serde(default)]
    pub feature_groups: Vec<FeatureGroupSpec>,
    #[serde(default)]
    pub configs: Vec<ConfigModel>,
    #[serde(default)]
    pub plugins: Vec<PluginDescriptor>,
}

impl FeaturePackSpec {
    pub fn new(coordinate: ArtifactCoordinate) -> Self {
        Self {
            coordinate,
            dependencies: Vec::new(),
            packages: Vec::new(),
            feature_specs: Vec::new(),
            feature_groups: Vec::new(),
            configs: Vec::new(),
            plugins: Vec::new(),
        }
    }

    pub fn with_dependency(mut self, dependency: FeaturePackDependency) -> Self {
        self.dependencies.push(dependency);
        self
    }

    pub fn with_package(mut self, package: PackageSpec) -> Self {
        self.packages.push(package);
        self
    }

    pub fn with_feature_spec(mut self, spec: FeatureSpec) -> Self {
        self.feature_specs.push(spec);
        self
    }

    pub fn with_feature_group(mut self, group: FeatureGroupSpec) -> Self {
        self.feature_groups.push(group);
        self
    }

    pub fn with_config(mut self, config: ConfigModel) -> Self {
        self.configs.push(config);
        self
    }

    pub fn with_plugin(mut self, plugin: PluginDescriptor) -> Self {
        self.plugins.push(plugin);
        self
    }
}

/// Which packages of a feature pack to install.
///
/// Used both by a pack declaring its dependency on another pack (inherited
/// selection) and by the provisioning request (explicit selection).
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct PackageSelection {
    /// Install the packages the pack flags as default
    #[serde(default = "default_true", skip_serializing_if = "is_true")]
    pub inherit: bool,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub include: Vec<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub exclude: Vec<String>,
}

impl PackageSelection {
    /// Default packages, nothing else
    pub fn inherit_defaults() -> Self {
        Self {
            inherit: true,
            ..Self::default()
        }
    }

    /// Only explicitly included packages
    pub fn none() -> Self {
        Self::default()
    }

    pub fn include(mut self, package: impl Into<String>) -> Self {
        self.include.push(package.into());
        self
    }

    pub fn exclude(mut self, package: impl Into<String>) -> Self {
        self.exclude.push(package.into());
        self
    }
}

/// A feature pack's dependency on another feature pack.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct FeaturePackDependency {
    pub coordinate: ArtifactCoordinate,
    /// Alias usable as an `origin` inside the depending pack
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(default = "PackageSelection::inherit_defaults")]
    pub packages: PackageSelection,
}

impl FeaturePackDependency {
    pub fn new(coordinate: ArtifactCoordinate) -> Self {
        Self {
            coordinate,
            name: None,
            packages: PackageSelection::inherit_defaults(),
        }
    }

    pub fn named(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    pub fn with_packages(mut self, packages: PackageSelection) -> Self {
        self.packages = packages;
        self
    }
}

/// A named unit of installable content. The content itself is opaque here.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct PackageSpec {
    pub name: String,
    /// Installed whenever the pack's defaults are inherited
    #[serde(default = "default_true")]
    pub default: bool,
    #[serde(default)]
    pub dependencies: Vec<PackageDependency>,
}

impl PackageSpec {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            default: true,
            dependencies: Vec::new(),
        }
    }

    pub fn non_default(mut self) -> Self {
        self.default = false;
        self
    }

    pub fn requires(mut self, package: impl Into<String>) -> Self {
        self.dependencies.push(PackageDependency::required(package));
        self
    }

    pub fn optionally(mut self, package: impl Into<String>) -> Self {
        self.dependencies.push(PackageDependency::optional(package));
        self
    }

    pub fn with_dependency(mut self, dependency: PackageDependency) -> Self {
        self.dependencies.push(dependency);
        self
    }
}

/// An edge of the package graph, possibly into another feature pack.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct PackageDependency {
    pub name: String,
    #[serde(default)]
    pub optional: bool,
    /// Dependency alias or `group:artifact` of the pack owning the target
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub origin: Option<String>,
}

impl PackageDependency {
    pub fn required(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            optional: false,
            origin: None,
        }
    }

    pub fn optional(name: impl Into<String>) -> Self {
        Self {
            optional: true,
            ..Self::required(name)
        }
    }

    pub fn from_origin(mut self, origin: impl Into<String>) -> Self {
        self.origin = Some(origin.into());
        self
    }
}

// ============================================================================
// Feature specs
// ============================================================================

/// The declared type of a configuration entry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct FeatureSpec {
    pub name: String,
    #[serde(default)]
    pub params: Vec<ParameterSpec>,
    #[serde(default)]
    pub references: Vec<FeatureReferenceSpec>,
    /// Capability patterns, `$param` elements are substituted
    #[serde(default)]
    pub provides: Vec<String>,
    #[serde(default)]
    pub requires: Vec<CapabilityRequirement>,
    /// Packages installed when a feature of this spec is provisioned
    #[serde(default)]
    pub packages: Vec<PackageDependency>,
}

impl FeatureSpec {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            params: Vec::new(),
            references: Vec::new(),
            provides: Vec::new(),
            requires: Vec::new(),
            packages: Vec::new(),
        }
    }

    pub fn with_param(mut self, param: ParameterSpec) -> Self {
        self.params.push(param);
        self
    }

    pub fn with_reference(mut self, reference: FeatureReferenceSpec) -> Self {
        self.references.push(reference);
        self
    }

    pub fn provides(mut self, capability: impl Into<String>) -> Self {
        self.provides.push(capability.into());
        self
    }

    pub fn requires(mut self, capability: impl Into<String>) -> Self {
        self.requires.push(CapabilityRequirement::new(capability));
        self
    }

    pub fn requires_optionally(mut self, capability: impl Into<String>) -> Self {
        self.requires.push(CapabilityRequirement::new(capability).optional());
        self
    }

    pub fn with_package(mut self, package: PackageDependency) -> Self {
        self.packages.push(package);
        self
    }

    pub fn param(&self, name: &str) -> Option<&ParameterSpec> {
        self.params.iter().find(|p| p.name == name)
    }

    pub fn id_params(&self) -> impl Iterator<Item = &ParameterSpec> {
        self.params.iter().filter(|p| p.feature_id)
    }

    pub fn is_id_param(&self, name: &str) -> bool {
        self.param(name).is_some_and(|p| p.feature_id)
    }
}

/// A parameter of a feature spec.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct ParameterSpec {
    pub name: String,
    #[serde(default)]
    pub feature_id: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub default: Option<String>,
    #[serde(default)]
    pub nillable: bool,
}

impl ParameterSpec {
    /// A non-nillable parameter without default
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            feature_id: false,
            default: None,
            nillable: false,
        }
    }

    /// An id parameter
    pub fn id(name: impl Into<String>) -> Self {
        Self {
            feature_id: true,
            ..Self::new(name)
        }
    }

    /// A nillable parameter
    pub fn nillable(name: impl Into<String>) -> Self {
        Self {
            nillable: true,
            ..Self::new(name)
        }
    }

    pub fn with_default(mut self, value: impl Into<String>) -> Self {
        self.default = Some(value.into());
        self
    }
}

/// A foreign key from a feature to another feature's identity.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct FeatureReferenceSpec {
    /// Target spec name
    pub feature: String,
    /// Reference name, defaults to the target spec name
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    /// Dependency alias or `group:artifact` of the pack owning the target spec
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub origin: Option<String>,
    #[serde(default)]
    pub nillable: bool,
    /// Add the target feature when it is absent
    #[serde(default)]
    pub include: bool,
    /// local parameter -> target id parameter; empty maps id names one to one
    #[serde(default)]
    pub mappings: IndexMap<String, String>,
}

impl FeatureReferenceSpec {
    pub fn new(feature: impl Into<String>) -> Self {
        Self {
            feature: feature.into(),
            name: None,
            origin: None,
            nillable: false,
            include: false,
            mappings: IndexMap::new(),
        }
    }

    pub fn named(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    pub fn from_origin(mut self, origin: impl Into<String>) -> Self {
        self.origin = Some(origin.into());
        self
    }

    pub fn nillable(mut self) -> Self {
        self.nillable = true;
        self
    }

    pub fn including(mut self) -> Self {
        self.include = true;
        self
    }

    pub fn map(mut self, local: impl Into<String>, target: impl Into<String>) -> Self {
        self.mappings.insert(local.into(), target.into());
        self
    }

    /// The name errors and reference edges use
    pub fn reference_name(&self) -> &str {
        self.name.as_deref().unwrap_or(&self.feature)
    }
}

/// A required capability pattern.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct CapabilityRequirement {
    pub name: String,
    /// Optional requirements never fail validation
    #[serde(default)]
    pub optional: bool,
}

impl CapabilityRequirement {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            optional: false,
        }
    }

    pub fn optional(mut self) -> Self {
        self.optional = true;
        self
    }
}

// ============================================================================
// Feature groups and configs
// ============================================================================

/// One entry of a config or group body.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "kebab-case")]
pub enum ConfigItem {
    Feature(FeatureConfig),
    Group(GroupInclusion),
}

impl From<FeatureConfig> for ConfigItem {
    fn from(value: FeatureConfig) -> Self {
        Self::Feature(value)
    }
}

impl From<GroupInclusion> for ConfigItem {
    fn from(value: GroupInclusion) -> Self {
        Self::Group(value)
    }
}

/// A concrete use of a feature spec inside a config or group body.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct FeatureConfig {
    pub spec: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub origin: Option<String>,
    #[serde(default)]
    pub params: IndexMap<String, String>,
    /// Which reference of this spec points at the enclosing feature
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parent_ref: Option<String>,
    /// Nested features and groups; nested features are children of this one
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub items: Vec<ConfigItem>,
}

impl FeatureConfig {
    pub fn new(spec: impl Into<String>) -> Self {
        Self {
            spec: spec.into(),
            origin: None,
            params: IndexMap::new(),
            parent_ref: None,
            items: Vec::new(),
        }
    }

    pub fn param(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.params.insert(name.into(), value.into());
        self
    }

    pub fn from_origin(mut self, origin: impl Into<String>) -> Self {
        self.origin = Some(origin.into());
        self
    }

    pub fn with_parent_ref(mut self, reference: impl Into<String>) -> Self {
        self.parent_ref = Some(reference.into());
        self
    }

    pub fn with_item(mut self, item: impl Into<ConfigItem>) -> Self {
        self.items.push(item.into());
        self
    }
}

/// Identifies features by spec name and (a subset of) id parameter values.
///
/// When used as an inclusion override, the non-id parameters are the
/// override values.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct FeatureSelector {
    pub spec: String,
    #[serde(default)]
    pub params: IndexMap<String, String>,
}

impl FeatureSelector {
    pub fn new(spec: impl Into<String>) -> Self {
        Self {
            spec: spec.into(),
            params: IndexMap::new(),
        }
    }

    pub fn param(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.params.insert(name.into(), value.into());
        self
    }
}

/// Inclusion of a feature group, with filters and overrides.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct GroupInclusion {
    pub group: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub origin: Option<String>,
    /// Keep features the inclusion does not list explicitly
    #[serde(default = "default_true")]
    pub inherit_features: bool,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub include_specs: Vec<String>,
    /// Selected features, their non-id params override the group's values
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub include_features: Vec<FeatureSelector>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub exclude_specs: Vec<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub exclude_features: Vec<FeatureSelector>,
}

impl GroupInclusion {
    pub fn new(group: impl Into<String>) -> Self {
        Self {
            group: group.into(),
            origin: None,
            inherit_features: true,
            include_specs: Vec::new(),
            include_features: Vec::new(),
            exclude_specs: Vec::new(),
            exclude_features: Vec::new(),
        }
    }

    pub fn from_origin(mut self, origin: impl Into<String>) -> Self {
        self.origin = Some(origin.into());
        self
    }

    pub fn without_inherited_features(mut self) -> Self {
        self.inherit_features = false;
        self
    }

    pub fn include_spec(mut self, spec: impl Into<String>) -> Self {
        self.include_specs.push(spec.into());
        self
    }

    pub fn include_feature(mut self, selector: FeatureSelector) -> Self {
        self.include_features.push(selector);
        self
    }

    pub fn exclude_spec(mut self, spec: impl Into<String>) -> Self {
        self.exclude_specs.push(spec.into());
        self
    }

    pub fn exclude_feature(mut self, selector: FeatureSelector) -> Self {
        self.exclude_features.push(selector);
        self
    }
}

/// A reusable, named list of config items.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct FeatureGroupSpec {
    pub name: String,
    #[serde(default)]
    pub items: Vec<ConfigItem>,
}

impl FeatureGroupSpec {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            items: Vec::new(),
        }
    }

    pub fn with_item(mut self, item: impl Into<ConfigItem>) -> Self {
        self.items.push(item.into());
        self
    }
}

/// Identity of a named config
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ConfigId {
    pub model: String,
    pub name: String,
}

impl ConfigId {
    pub fn new(model: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            model: model.into(),
            name: name.into(),
        }
    }
}

impl fmt::Display for ConfigId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.model, self.name)
    }
}

/// Selects configs by model, and optionally by name
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConfigSelector {
    pub model: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
}

impl ConfigSelector {
    pub fn named(model: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            model: model.into(),
            name: Some(name.into()),
        }
    }

    pub fn model(model: impl Into<String>) -> Self {
        Self {
            model: model.into(),
            name: None,
        }
    }

    pub fn matches(&self, model: Option<&str>, name: Option<&str>) -> bool {
        model == Some(self.model.as_str())
            && self.name.as_deref().is_none_or(|n| name == Some(n))
    }
}

/// A named (or anonymous) collection of features.
///
/// Both `model` and `name` set: a named config, merged with same-identity
/// configs of other packs. Only `model` set: defaults applied to every
/// named config of that model. Neither set: an anonymous config, never
/// merged with anything.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct ConfigModel {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(default)]
    pub props: IndexMap<String, String>,
    #[serde(default)]
    pub items: Vec<ConfigItem>,
    #[serde(default)]
    pub config_deps: Vec<ConfigId>,
    /// Keep content contributed by same-identity configs of dependency packs
    #[serde(default = "default_true")]
    pub inherit_features: bool,
    /// Drop matching features from the assembled config
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub excluded: Vec<FeatureSelector>,
}

impl ConfigModel {
    pub fn named(model: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            model: Some(model.into()),
            name: Some(name.into()),
            ..Self::anonymous()
        }
    }

    pub fn model_defaults(model: impl Into<String>) -> Self {
        Self {
            model: Some(model.into()),
            ..Self::anonymous()
        }
    }

    pub fn anonymous() -> Self {
        Self {
            model: None,
            name: None,
            props: IndexMap::new(),
            items: Vec::new(),
            config_deps: Vec::new(),
            inherit_features: true,
            excluded: Vec::new(),
        }
    }

    pub fn prop(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.props.insert(name.into(), value.into());
        self
    }

    pub fn with_item(mut self, item: impl Into<ConfigItem>) -> Self {
        self.items.push(item.into());
        self
    }

    pub fn depends_on(mut self, model: impl Into<String>, name: impl Into<String>) -> Self {
        self.config_deps.push(ConfigId::new(model, name));
        self
    }

    pub fn without_inherited_features(mut self) -> Self {
        self.inherit_features = false;
        self
    }

    pub fn exclude(mut self, selector: FeatureSelector) -> Self {
        self.excluded.push(selector);
        self
    }

    /// `(model, name)` when this is a named config
    pub fn config_ref(&self) -> Option<ConfigId> {
        match (&self.model, &self.name) {
            (Some(model), Some(name)) => Some(ConfigId {
                model: model.clone(),
                name: name.clone(),
            }),
            _ => None,
        }
    }

    pub fn is_model_defaults(&self) -> bool {
        self.model.is_some() && self.name.is_none()
    }
}
