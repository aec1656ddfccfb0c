//! Provisioner facade.
//!
//! Drives one provisioning run through the stages of
//! [`ProvisioningStage`](crate::run_state::ProvisioningStage). The run owns
//! its [`ProvisioningContext`]; the registry is only read.
//!
//! # Design
//!
//! Phase 1 (layout, config assembly, feature resolution, package closure)
//! collects everything without judging capabilities, so forward references
//! and capability cycles never fail it. Phase 2 validates the collected
//! graph and builds the [`ProvisionedState`]. Nothing is written anywhere:
//! materialization is a separate step that only ever sees a complete state.

use std::collections::BTreeMap;

use tracing::{info, warn};

use crate::error::{ResolutionError, Result};
use crate::logic::capabilities;
use crate::logic::configs::{ConfigAssembler, ConfigPlan, order_configs, select_configs};
use crate::logic::layout::{FeaturePackLayout, PackageDemand};
use crate::logic::references::{FeatureReferenceResolver, ResolvedFeatures};
use crate::registry::FeatureSpecRegistry;
use crate::request::ProvisioningRequest;
use crate::run_state::{ProvisioningContext, ProvisioningStage};
use crate::state::{ProvisionedConfig, ProvisionedFeaturePack, ProvisionedState, ResolvedFeatureId};

/// Resolves provisioning requests against a registry.
#[derive(Debug, Clone, Copy)]
pub struct Provisioner<'r> {
    registry: &'r FeatureSpecRegistry,
}

impl<'r> Provisioner<'r> {
    pub fn new(registry: &'r FeatureSpecRegistry) -> Self {
        Self { registry }
    }

    /// Resolve a request into a provisioned state.
    pub fn provision(&self, request: &ProvisioningRequest) -> Result<ProvisionedState> {
        let mut ctx = ProvisioningContext::new();
        self.provision_with(request, &mut ctx)
    }

    /// Like [`Self::provision`], with a caller-owned context left behind for
    /// inspection (stage history, stage a failure happened in).
    pub fn provision_with(
        &self,
        request: &ProvisioningRequest,
        ctx: &mut ProvisioningContext,
    ) -> Result<ProvisionedState> {
        match self.run(request, ctx) {
            Ok(state) => Ok(state),
            Err(e) => {
                let stage = ctx.current_stage();
                if !stage.is_terminal() {
                    if let Err(t) = ctx.fail() {
                        warn!(stage = %stage, error = %t, "Could not mark run as failed");
                    }
                }
                warn!(stage = %stage, error = %e, "Provisioning failed");
                Err(e)
            }
        }
    }

    fn run(
        &self,
        request: &ProvisioningRequest,
        ctx: &mut ProvisioningContext,
    ) -> Result<ProvisionedState> {
        ctx.transition_to(ProvisioningStage::ResolvingLayout)?;
        let layout = FeaturePackLayout::resolve(self.registry, request)?;

        ctx.transition_to(ProvisioningStage::AssemblingConfigs)?;
        let plans = select_configs(&layout, request)?;
        let mut assembler = ConfigAssembler::new(&layout);
        let mut assembled = Vec::with_capacity(plans.len());
        for plan in &plans {
            assembled.push(assembler.assemble(plan)?);
        }

        ctx.transition_to(ProvisioningStage::ResolvingFeatures)?;
        let mut resolved = Vec::with_capacity(assembled.len());
        for occurrences in assembled {
            let mut resolver = FeatureReferenceResolver::new(&layout);
            for raw in occurrences {
                resolver.add(raw)?;
            }
            resolved.push(resolver.finish()?);
        }

        ctx.transition_to(ProvisioningStage::ClosingPackages)?;
        let demands = feature_package_demands(&layout, &resolved)?;
        for (pack, packages) in layout.close_packages(&demands)? {
            ctx.record_installed(pack, packages.into_iter().collect());
        }

        ctx.transition_to(ProvisioningStage::ValidatingCapabilities)?;
        let mut providers = Vec::with_capacity(resolved.len());
        for features in &resolved {
            providers.push(capabilities::validate(&features.features)?);
        }

        ctx.transition_to(ProvisioningStage::OrderingConfigs)?;
        let ids: Vec<_> = plans.iter().map(|p| p.id.clone()).collect();
        let deps: Vec<_> = plans.iter().map(|p| p.config_deps.clone()).collect();
        let order = order_configs(&ids, &deps)?;

        ctx.transition_to(ProvisioningStage::BuildingState)?;
        let mut built: Vec<Option<ProvisionedConfig>> = plans
            .into_iter()
            .zip(resolved)
            .zip(providers)
            .map(|((plan, features), providers)| Some(build_config(plan, features, providers)))
            .collect();
        let configs: Vec<ProvisionedConfig> =
            order.into_iter().filter_map(|i| built[i].take()).collect();

        let mut installed = ctx.take_installed();
        let mut feature_packs = Vec::with_capacity(layout.order().len());
        for coordinate in layout.order() {
            feature_packs.push(ProvisionedFeaturePack {
                coordinate: coordinate.clone(),
                packages: installed.remove(coordinate).unwrap_or_default(),
                plugins: layout.pack(coordinate)?.plugins().to_vec(),
            });
        }

        let state = ProvisionedState {
            feature_packs,
            configs,
            options: request.options.clone(),
        };
        ctx.transition_to(ProvisioningStage::Completed)?;

        info!(
            packs = state.feature_packs.len(),
            configs = state.configs.len(),
            "Provisioned state built"
        );
        Ok(state)
    }
}

/// Packages the specs of provisioned features ask for.
fn feature_package_demands(
    layout: &FeaturePackLayout<'_>,
    resolved: &[ResolvedFeatures],
) -> std::result::Result<Vec<PackageDemand>, ResolutionError> {
    let mut demands = Vec::new();
    for config in resolved {
        for feature in &config.features {
            let pack = &feature.feature.id.pack;
            for dependency in &feature.spec.packages {
                let target = match &dependency.origin {
                    Some(origin) => layout.resolve_origin(Some(pack), origin)?,
                    None => pack.clone(),
                };
                demands.push(PackageDemand {
                    pack: target,
                    package: dependency.name.clone(),
                    optional: dependency.optional,
                    required_by: format!("feature spec '{}' of {pack}", feature.spec.name),
                });
            }
        }
    }
    Ok(demands)
}

fn build_config(
    plan: ConfigPlan,
    features: ResolvedFeatures,
    capability_providers: BTreeMap<String, Vec<ResolvedFeatureId>>,
) -> ProvisionedConfig {
    ProvisionedConfig {
        id: plan.id,
        props: plan.props.into_iter().collect(),
        features: features.features.into_iter().map(|f| f.feature).collect(),
        references: features.references,
        capability_providers,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::coordinate::ArtifactCoordinate;
    use crate::descriptor::{
        ConfigModel, FeatureConfig, FeaturePackSpec, FeatureSpec, PackageSpec, ParameterSpec,
    };
    use crate::error::ProvisioningError;
    use crate::request::FeaturePackSelection;
    use crate::run_state::StageTransitionError;

    fn coord() -> ArtifactCoordinate {
        "org.test:fp1:1.0.0".parse().unwrap()
    }

    fn registry() -> FeatureSpecRegistry {
        let mut registry = FeatureSpecRegistry::new();
        registry
            .register(
                FeaturePackSpec::new(coord())
                    .with_package(PackageSpec::new("p1"))
                    .with_feature_spec(
                        FeatureSpec::new("specA")
                            .with_param(ParameterSpec::id("name"))
                            .requires("cap.missing"),
                    )
                    .with_config(
                        ConfigModel::named("model1", "config1")
                            .with_item(FeatureConfig::new("specA").param("name", "a1")),
                    ),
            )
            .unwrap();
        registry
    }

    #[test]
    fn test_failure_marks_context_failed() {
        let registry = registry();
        let request =
            ProvisioningRequest::new().with_feature_pack(FeaturePackSelection::new(coord()));
        let mut ctx = ProvisioningContext::new();
        let err = Provisioner::new(&registry)
            .provision_with(&request, &mut ctx)
            .unwrap_err();

        assert!(matches!(
            err,
            ProvisioningError::Resolution(ResolutionError::UnresolvedCapabilityRequirement { .. })
        ));
        assert!(ctx.is_failed());
        assert_eq!(ctx.failed_at(), Some(ProvisioningStage::ValidatingCapabilities));
    }

    #[test]
    fn test_success_walks_every_stage() {
        let registry = registry();
        let request = ProvisioningRequest::new()
            .with_feature_pack(FeaturePackSelection::new(coord()).without_inherited_configs());
        let mut ctx = ProvisioningContext::new();
        let state = Provisioner::new(&registry)
            .provision_with(&request, &mut ctx)
            .unwrap();

        assert!(ctx.is_complete());
        assert_eq!(
            ctx.stage_history().len(),
            ProvisioningStage::all_stages().len() - 1
        );
        assert!(state.configs.is_empty());
        assert_eq!(state.packages_of(&coord()), vec!["p1"]);
    }

    #[test]
    fn test_reused_context_keeps_original_error() {
        let registry = registry();
        let request = ProvisioningRequest::new()
            .with_feature_pack(FeaturePackSelection::new(coord()).without_inherited_configs());
        let mut ctx = ProvisioningContext::new();
        Provisioner::new(&registry)
            .provision_with(&request, &mut ctx)
            .unwrap();

        // A completed context cannot be failed; the caller still sees why the run stopped
        let err = Provisioner::new(&registry)
            .provision_with(&request, &mut ctx)
            .unwrap_err();
        assert!(matches!(
            err,
            ProvisioningError::Stage(StageTransitionError::FromTerminalState { .. })
        ));
        assert!(ctx.is_complete());
    }

    #[test]
    fn test_failure_in_first_stage_is_returned() {
        let registry = FeatureSpecRegistry::new();
        let request =
            ProvisioningRequest::new().with_feature_pack(FeaturePackSelection::new(coord()));
        let mut ctx = ProvisioningContext::new();
        let err = Provisioner::new(&registry)
            .provision_with(&request, &mut ctx)
            .unwrap_err();

        assert!(matches!(
            err,
            ProvisioningError::Resolution(ResolutionError::UnresolvedFeaturePackDependency { .. })
        ));
        assert_eq!(ctx.failed_at(), Some(ProvisioningStage::ResolvingLayout));
    }
}
