//! Error handling module for fpack
//!
//! Provides the error taxonomy of the provisioning engine using thiserror.
//!
//! # Families
//!
//! - [`DescriptionError`]: a feature-pack descriptor is internally inconsistent.
//!   Raised once, when the pack is registered, independent of any run.
//! - [`ResolutionError`]: a provisioning run cannot produce a consistent state.
//!   Every variant carries the identity needed to locate the offending
//!   declaration (feature-pack coordinate, spec name, id-parameter values).
//! - [`ArtifactError`]: the repository could not supply content. Surfaced as-is.
//!
//! [`ProvisioningError`] wraps all of them for the public API.

use std::path::PathBuf;

use thiserror::Error;

use crate::coordinate::ArtifactCoordinate;
use crate::run_state::StageTransitionError;
use crate::state::{ConfigId, ResolvedFeatureId};

/// Main error type for fpack
#[derive(Error, Debug)]
pub enum ProvisioningError {
    /// Malformed or inconsistent feature-pack descriptor
    #[error("Description error: {0}")]
    Description(#[from] DescriptionError),

    /// The request cannot be resolved against the registered descriptors
    #[error("Resolution error: {0}")]
    Resolution(#[from] ResolutionError),

    /// Repository/IO failure from the artifact resolver
    #[error("Artifact error: {0}")]
    Artifact(#[from] ArtifactError),

    /// A post-install plugin failed
    #[error("Plugin error: {0}")]
    Plugin(#[from] PluginError),

    /// Writing the provisioned state to disk failed
    #[error("Materialize error: {0}")]
    Materialize(#[from] MaterializeError),

    /// Provisioning run state machine misuse
    #[error("Stage transition error: {0}")]
    Stage(#[from] StageTransitionError),
}

/// Result type alias for provisioning operations
pub type Result<T> = std::result::Result<T, ProvisioningError>;

/// Inconsistent feature-pack declarations, detected at registration time.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum DescriptionError {
    /// A feature pack with the same coordinate is already registered
    #[error("Feature pack {pack} is already registered")]
    DuplicateFeaturePack { pack: ArtifactCoordinate },

    /// Two declarations of the same kind share a name within one pack
    #[error("Feature pack {pack} declares {kind} '{name}' more than once")]
    DuplicateName {
        pack: ArtifactCoordinate,
        kind: &'static str,
        name: String,
    },

    /// A required package dependency points at a package the pack does not have
    #[error("Package '{package}' of {pack} requires missing package '{dependency}'")]
    MissingPackageDependency {
        pack: ArtifactCoordinate,
        package: String,
        dependency: String,
    },

    /// The same (source, target) package edge is declared both required and optional
    #[error(
        "Package '{package}' of {pack} declares dependency on '{dependency}' as both required and optional"
    )]
    InconsistentPackageDependency {
        pack: ArtifactCoordinate,
        package: String,
        dependency: String,
    },

    /// A feature spec depends on a package the pack does not have
    #[error("Feature spec '{spec}' of {pack} requires missing package '{package}'")]
    MissingSpecPackage {
        pack: ArtifactCoordinate,
        spec: String,
        package: String,
    },

    /// An origin names neither a dependency alias nor a dependency group:artifact
    #[error("{pack} refers to unknown origin '{origin}' (from '{declared_by}')")]
    UnknownOrigin {
        pack: ArtifactCoordinate,
        origin: String,
        declared_by: String,
    },

    /// A feature spec declares a parameter twice or an id parameter that is nillable
    #[error("Feature spec '{spec}' of {pack} has invalid parameter '{param}': {reason}")]
    InvalidParameter {
        pack: ArtifactCoordinate,
        spec: String,
        param: String,
        reason: String,
    },

    /// A name that ends up in an installation path is empty or leaves its directory
    #[error("Feature pack {pack} declares invalid {kind} name '{name}'")]
    InvalidName {
        pack: ArtifactCoordinate,
        kind: &'static str,
        name: String,
    },

    /// The descriptor could not be decoded
    #[error("Descriptor for {pack} is malformed: {reason}")]
    Malformed {
        pack: ArtifactCoordinate,
        reason: String,
    },

    /// The descriptor found at a coordinate declares a different coordinate
    #[error("Descriptor resolved for {expected} declares coordinate {found}")]
    CoordinateMismatch {
        expected: ArtifactCoordinate,
        found: ArtifactCoordinate,
    },
}

/// Failures of a provisioning run.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ResolutionError {
    /// A requested or depended-upon feature pack is not registered
    #[error("Feature pack {dependency} required by {required_by} is not available")]
    UnresolvedFeaturePackDependency {
        required_by: String,
        dependency: ArtifactCoordinate,
    },

    /// Different versions of the same feature pack were reached transitively
    #[error("Feature pack {ga} is reached in conflicting versions: {}", versions.join(", "))]
    FeaturePackVersionConflict { ga: String, versions: Vec<String> },

    /// A package named by a selection or dependency does not exist
    #[error("Package '{package}' is not found in {pack}")]
    UnresolvedPackage {
        pack: ArtifactCoordinate,
        package: String,
    },

    /// An excluded package is still required by something installed
    #[error("Package '{package}' of {pack} is excluded but required by {required_by}")]
    RequiredPackageExcluded {
        pack: ArtifactCoordinate,
        package: String,
        required_by: String,
    },

    /// An origin used during resolution cannot be mapped to a feature pack
    #[error("Origin '{origin}' referenced from {context} does not name a feature pack in scope")]
    UnresolvedOrigin { context: String, origin: String },

    /// A feature spec cannot be found in the searched feature packs
    #[error("Feature spec '{spec}' is not found (looked up from {context})")]
    UnresolvedFeatureSpec { context: String, spec: String },

    /// A feature group cannot be found in the searched feature packs
    #[error("Feature group '{group}' is not found (looked up from {context})")]
    UnresolvedFeatureGroup { context: String, group: String },

    /// A feature group includes itself, directly or transitively
    #[error("Feature group '{group}' includes itself")]
    CyclicFeatureGroup { group: String },

    /// A feature assigns a parameter its spec does not declare
    #[error("Feature {feature} assigns unknown parameter '{param}'")]
    UnknownParameter {
        feature: ResolvedFeatureId,
        param: String,
    },

    /// An id parameter received two different values for the same identity
    #[error("Feature {feature} id parameter '{param}' is '{old}' and cannot be reassigned to '{new}'")]
    IdParameterConflict {
        feature: ResolvedFeatureId,
        param: String,
        old: String,
        new: String,
    },

    /// An id parameter has no value after merging and foreign-key initialization
    #[error("Feature {feature} has no value for id parameter '{param}'")]
    MissingIdParameter {
        feature: ResolvedFeatureId,
        param: String,
    },

    /// A non-nillable parameter has no value after merging
    #[error("Feature {feature} has no value for non-nillable parameter '{param}'")]
    NonNillableParameterUnset {
        feature: ResolvedFeatureId,
        param: String,
    },

    /// A non-nillable feature reference cannot be resolved
    #[error("Feature {feature} cannot resolve reference '{reference}'")]
    UnresolvedReference {
        feature: ResolvedFeatureId,
        reference: String,
    },

    /// An inclusion override matches no feature of the included group
    #[error("Override of '{spec}' {params:?} matches no feature of group '{group}'")]
    UnmatchedFeatureOverride {
        group: String,
        spec: String,
        params: Vec<(String, String)>,
    },

    /// A required capability is not provided by any feature of the config
    #[error("Feature {feature} requires capability '{capability}' which nothing provides")]
    UnresolvedCapabilityRequirement {
        feature: ResolvedFeatureId,
        capability: String,
    },

    /// A required capability pattern names a parameter without value
    #[error("Feature {feature} requires capability '{pattern}' but parameter '{param}' is unset")]
    UnresolvedCapabilityParameter {
        feature: ResolvedFeatureId,
        pattern: String,
        param: String,
    },

    /// A selected config is not defined by any feature pack or by the request
    #[error("Config {config} is not defined by any feature pack in scope")]
    UnresolvedConfig { config: ConfigId },

    /// A config depends on a config that is not provisioned
    #[error("Config {config} depends on {missing} which is not provisioned")]
    UnsatisfiedConfigDependency { config: String, missing: ConfigId },

    /// Config dependencies form a cycle
    #[error("Configs depend on each other in a cycle: {}", display_cycle(members))]
    CyclicConfigDependency { members: Vec<ConfigId> },
}

fn display_cycle(members: &[ConfigId]) -> String {
    let mut parts: Vec<String> = members.iter().map(ToString::to_string).collect();
    if let Some(first) = members.first() {
        parts.push(first.to_string());
    }
    parts.join(" -> ")
}

/// Repository/IO failures. The engine never retries these.
#[derive(Error, Debug)]
pub enum ArtifactError {
    /// Nothing is stored at the coordinate's location
    #[error("Artifact {coordinate} not found at {}", path.display())]
    NotFound {
        coordinate: ArtifactCoordinate,
        path: PathBuf,
    },

    /// Reading or writing the repository failed
    #[error("IO error on {}: {source}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// The bounded fetch pool could not be created
    #[error("Failed to start fetch pool: {0}")]
    Pool(String),
}

impl ArtifactError {
    /// Wrap an IO error with the path it happened on
    pub fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Self::Io {
            path: path.into(),
            source,
        }
    }
}

/// Plugin lookup and execution failures
#[derive(Error, Debug)]
pub enum PluginError {
    /// A feature pack declares a plugin nobody registered
    #[error("Plugin '{id}' declared by {pack} is not registered")]
    Unknown { id: String, pack: ArtifactCoordinate },

    /// A plugin reported a failure
    #[error("Plugin '{id}' failed: {reason}")]
    Failed { id: String, reason: String },
}

impl PluginError {
    /// Create a failure report for a plugin
    pub fn failed(id: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::Failed {
            id: id.into(),
            reason: reason.into(),
        }
    }
}

/// Failures while writing the provisioned state to a target directory
#[derive(Error, Debug)]
pub enum MaterializeError {
    /// The target directory already has content
    #[error("Target directory {} is not empty", path.display())]
    TargetNotEmpty { path: PathBuf },

    /// Filesystem failure while staging or committing
    #[error("IO error on {}: {source}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

impl MaterializeError {
    /// Wrap an IO error with the path it happened on
    pub fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Self::Io {
            path: path.into(),
            source,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn coord() -> ArtifactCoordinate {
        "org.test:fp1:1.0.0".parse().unwrap()
    }

    #[test]
    fn test_error_display() {
        let err = ResolutionError::UnresolvedPackage {
            pack: coord(),
            package: "p9".to_string(),
        };
        assert_eq!(err.to_string(), "Package 'p9' is not found in org.test:fp1:1.0.0");
    }

    #[test]
    fn test_cycle_display_closes_loop() {
        let err = ResolutionError::CyclicConfigDependency {
            members: vec![ConfigId::new("m", "config1"), ConfigId::new("m", "config2")],
        };
        assert_eq!(
            err.to_string(),
            "Configs depend on each other in a cycle: m/config1 -> m/config2 -> m/config1"
        );
    }

    #[test]
    fn test_resolution_error_conversion() {
        let err: ProvisioningError = ResolutionError::UnresolvedConfig {
            config: ConfigId::new("m", "c"),
        }
        .into();
        assert!(matches!(err, ProvisioningError::Resolution(_)));
    }

    #[test]
    fn test_id_conflict_names_both_values() {
        let err = ResolutionError::IdParameterConflict {
            feature: ResolvedFeatureId::new(coord(), "specB", [("name", "b")]),
            param: "a".to_string(),
            old: "a1".to_string(),
            new: "a2".to_string(),
        };
        let text = err.to_string();
        assert!(text.contains("'a1'"));
        assert!(text.contains("'a2'"));
        assert!(text.contains("specB{name=b}"));
    }
}
