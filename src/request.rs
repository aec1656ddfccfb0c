//! Provisioning request: what the caller wants installed.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::coordinate::ArtifactCoordinate;
use crate::descriptor::{ConfigModel, ConfigSelector, PackageSelection};

fn default_true() -> bool {
    true
}

/// A top-level feature pack with the caller's package and config choices.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct FeaturePackSelection {
    pub coordinate: ArtifactCoordinate,
    /// Explicit package selection, overrides whatever dependents declare
    #[serde(default = "PackageSelection::inherit_defaults")]
    pub packages: PackageSelection,
    /// Provision the configs the pack and its dependencies declare
    #[serde(default = "default_true")]
    pub inherit_configs: bool,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub included_configs: Vec<ConfigSelector>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub excluded_configs: Vec<ConfigSelector>,
}

impl FeaturePackSelection {
    pub fn new(coordinate: ArtifactCoordinate) -> Self {
        Self {
            coordinate,
            packages: PackageSelection::inherit_defaults(),
            inherit_configs: true,
            included_configs: Vec::new(),
            excluded_configs: Vec::new(),
        }
    }

    pub fn with_packages(mut self, packages: PackageSelection) -> Self {
        self.packages = packages;
        self
    }

    pub fn include_package(mut self, package: impl Into<String>) -> Self {
        self.packages.include.push(package.into());
        self
    }

    pub fn exclude_package(mut self, package: impl Into<String>) -> Self {
        self.packages.exclude.push(package.into());
        self
    }

    pub fn without_inherited_configs(mut self) -> Self {
        self.inherit_configs = false;
        self
    }

    pub fn include_config(mut self, selector: ConfigSelector) -> Self {
        self.included_configs.push(selector);
        self
    }

    pub fn exclude_config(mut self, selector: ConfigSelector) -> Self {
        self.excluded_configs.push(selector);
        self
    }
}

/// Input of [`crate::provisioner::Provisioner::provision`].
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct ProvisioningRequest {
    #[serde(default)]
    pub feature_packs: Vec<FeaturePackSelection>,
    /// Configs defined or customized by the caller, merged last
    #[serde(default)]
    pub configs: Vec<ConfigModel>,
    /// Opaque options handed to plugins
    #[serde(default)]
    pub options: BTreeMap<String, String>,
}

impl ProvisioningRequest {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_feature_pack(mut self, selection: FeaturePackSelection) -> Self {
        self.feature_packs.push(selection);
        self
    }

    pub fn with_config(mut self, config: ConfigModel) -> Self {
        self.configs.push(config);
        self
    }

    pub fn with_option(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.options.insert(name.into(), value.into());
        self
    }

    pub fn selection(&self, coordinate: &ArtifactCoordinate) -> Option<&FeaturePackSelection> {
        self.feature_packs
            .iter()
            .find(|fp| &fp.coordinate == coordinate)
    }
}
