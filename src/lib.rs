//! fpack Library
//!
//! This library provides the provisioning engine: it resolves feature packs,
//! their packages and configuration features into a deterministic
//! [`ProvisionedState`], and materializes that state into a directory.

pub mod artifact;
pub mod cli;
pub mod config_file;
pub mod coordinate;
pub mod descriptor;
pub mod error;
pub mod logic;
pub mod materialize;
pub mod plugin;
pub mod provisioner;
pub mod registry;
pub mod request;
pub mod run_state;
pub mod state;

// Re-export main types for convenience
pub use artifact::{ArtifactResolver, LocalRepository};
pub use config_file::ProvisioningConfig;
pub use coordinate::ArtifactCoordinate;
pub use error::{
    ArtifactError, DescriptionError, MaterializeError, PluginError, ProvisioningError,
    ResolutionError,
};
pub use materialize::{FsMaterializer, Materializer};
pub use plugin::{PluginDescriptor, PluginRegistry, PluginScope, ProvisioningPlugin};
pub use provisioner::Provisioner;
pub use registry::FeatureSpecRegistry;
pub use request::{FeaturePackSelection, ProvisioningRequest};
pub use run_state::{ProvisioningContext, ProvisioningStage, StageTransitionError};
pub use state::{
    ConfigId, FeatureReference, ProvisionedConfig, ProvisionedFeature, ProvisionedFeaturePack,
    ProvisionedState, ResolvedFeatureId,
};
