//! Post-install plugins.
//!
//! A feature pack declares the plugins it needs by [`PluginDescriptor`]. The
//! installer registers implementations in a [`PluginRegistry`] up front; there
//! is no dynamic loading. Plugins only ever see the provisioned state through
//! a shared reference inside [`PluginContext`], so they cannot change the plan
//! they are post-processing.
//!
//! # Invocation order
//!
//! | Step | Hook                | Runs                                               |
//! |------|---------------------|----------------------------------------------------|
//! | 1    | `on_feature_pack`   | per pack in install order, per declared plugin     |
//! | 2    | `on_config`         | per distinct plugin with config scope, per config  |

use std::collections::{BTreeMap, HashMap};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use indexmap::IndexSet;
use serde::{Deserialize, Serialize};
use strum::{Display, EnumIter, EnumString, IntoEnumIterator};
use tracing::{debug, info};

use crate::artifact::ArtifactResolver;
use crate::error::PluginError;
use crate::state::{ProvisionedConfig, ProvisionedFeaturePack, ProvisionedState};

// ============================================================================
// Descriptors
// ============================================================================

/// What a plugin wants to be invoked for.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Display, EnumString, EnumIter,
)]
#[serde(rename_all = "kebab-case")]
#[strum(serialize_all = "kebab-case")]
pub enum PluginScope {
    FeaturePack,
    Config,
}

/// A plugin declaration inside a feature pack.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PluginDescriptor {
    pub id: String,
    #[serde(default = "PluginDescriptor::all_scopes")]
    pub scopes: Vec<PluginScope>,
}

impl PluginDescriptor {
    /// A descriptor with every scope
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            scopes: Self::all_scopes(),
        }
    }

    pub fn with_scopes(id: impl Into<String>, scopes: &[PluginScope]) -> Self {
        Self {
            id: id.into(),
            scopes: scopes.to_vec(),
        }
    }

    pub fn has_scope(&self, scope: PluginScope) -> bool {
        self.scopes.contains(&scope)
    }

    fn all_scopes() -> Vec<PluginScope> {
        PluginScope::iter().collect()
    }
}

// ============================================================================
// Plugin contract
// ============================================================================

/// Everything a plugin may look at. Nothing in here is mutable.
pub struct PluginContext<'a> {
    state: &'a ProvisionedState,
    target_dir: &'a Path,
    work_dir: &'a Path,
    encoding: &'a str,
    resolver: &'a dyn ArtifactResolver,
}

impl<'a> PluginContext<'a> {
    pub fn new(
        state: &'a ProvisionedState,
        target_dir: &'a Path,
        work_dir: &'a Path,
        encoding: &'a str,
        resolver: &'a dyn ArtifactResolver,
    ) -> Self {
        Self {
            state,
            target_dir,
            work_dir,
            encoding,
            resolver,
        }
    }

    pub fn state(&self) -> &ProvisionedState {
        self.state
    }

    /// Directory being installed into (the staging tree during materialization)
    pub fn target_dir(&self) -> &Path {
        self.target_dir
    }

    /// Scratch space, discarded after the run
    pub fn work_dir(&self) -> &Path {
        self.work_dir
    }

    pub fn encoding(&self) -> &str {
        self.encoding
    }

    pub fn resolver(&self) -> &dyn ArtifactResolver {
        self.resolver
    }

    pub fn options(&self) -> &BTreeMap<String, String> {
        &self.state.options
    }
}

/// A post-install step.
///
/// Both hooks default to doing nothing, so a plugin only implements the
/// scopes it cares about.
pub trait ProvisioningPlugin: Send + Sync {
    /// Identifier matched against [`PluginDescriptor::id`]
    fn id(&self) -> &str;

    fn on_feature_pack(
        &self,
        _ctx: &PluginContext<'_>,
        _pack: &ProvisionedFeaturePack,
    ) -> Result<(), PluginError> {
        Ok(())
    }

    fn on_config(
        &self,
        _ctx: &PluginContext<'_>,
        _config: &ProvisionedConfig,
    ) -> Result<(), PluginError> {
        Ok(())
    }
}

// ============================================================================
// Registry
// ============================================================================

/// Registered plugin implementations, by id.
#[derive(Default)]
pub struct PluginRegistry {
    plugins: HashMap<String, Arc<dyn ProvisioningPlugin>>,
    /// Run even when no feature pack declares them
    defaults: Vec<PluginDescriptor>,
}

impl PluginRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a plugin that runs where feature packs declare it
    pub fn register(&mut self, plugin: Arc<dyn ProvisioningPlugin>) {
        self.plugins.insert(plugin.id().to_string(), plugin);
    }

    /// Register a plugin that runs for every provisioned state
    pub fn register_default(&mut self, plugin: Arc<dyn ProvisioningPlugin>) {
        self.defaults.push(PluginDescriptor::new(plugin.id()));
        self.register(plugin);
    }

    pub fn get(&self, id: &str) -> Option<&Arc<dyn ProvisioningPlugin>> {
        self.plugins.get(id)
    }

    pub fn len(&self) -> usize {
        self.plugins.len()
    }

    pub fn is_empty(&self) -> bool {
        self.plugins.is_empty()
    }
}

/// Invoke every plugin the provisioned state calls for.
///
/// Feature-pack hooks run per declaring pack in install order, then config
/// hooks run once per distinct plugin over the configs in dependency order.
/// The first failure stops the run.
pub fn run_plugins(registry: &PluginRegistry, ctx: &PluginContext<'_>) -> Result<(), PluginError> {
    let mut config_plugins: IndexSet<String> = IndexSet::new();

    for pack in &ctx.state().feature_packs {
        for descriptor in &pack.plugins {
            let plugin = registry.get(&descriptor.id).ok_or_else(|| PluginError::Unknown {
                id: descriptor.id.clone(),
                pack: pack.coordinate.clone(),
            })?;
            if descriptor.has_scope(PluginScope::FeaturePack) {
                debug!(plugin = %descriptor.id, pack = %pack.coordinate, "Invoking feature-pack plugin");
                plugin.on_feature_pack(ctx, pack)?;
            }
            if descriptor.has_scope(PluginScope::Config) {
                config_plugins.insert(descriptor.id.clone());
            }
        }
    }

    for descriptor in &registry.defaults {
        if descriptor.has_scope(PluginScope::FeaturePack) {
            if let Some(plugin) = registry.get(&descriptor.id) {
                for pack in &ctx.state().feature_packs {
                    plugin.on_feature_pack(ctx, pack)?;
                }
            }
        }
        if descriptor.has_scope(PluginScope::Config) {
            config_plugins.insert(descriptor.id.clone());
        }
    }

    for id in &config_plugins {
        let Some(plugin) = registry.get(id) else {
            continue;
        };
        for config in &ctx.state().configs {
            debug!(plugin = %id, config = ?config.id, "Invoking config plugin");
            plugin.on_config(ctx, config)?;
        }
    }

    info!(plugins = config_plugins.len(), "Plugins finished");
    Ok(())
}

// ============================================================================
// Built-in plugins
// ============================================================================

/// Writes each named config to `<target>/configuration/<model>/<name>.json`.
///
/// Anonymous configs have no file name and are skipped.
pub struct ConfigWriterPlugin;

impl ConfigWriterPlugin {
    pub const ID: &'static str = "config-writer";

    pub fn output_path(target_dir: &Path, model: &str, name: &str) -> PathBuf {
        target_dir
            .join("configuration")
            .join(model)
            .join(format!("{name}.json"))
    }
}

impl ProvisioningPlugin for ConfigWriterPlugin {
    fn id(&self) -> &str {
        Self::ID
    }

    fn on_config(
        &self,
        ctx: &PluginContext<'_>,
        config: &ProvisionedConfig,
    ) -> Result<(), PluginError> {
        let Some(id) = &config.id else {
            return Ok(());
        };
        let path = Self::output_path(ctx.target_dir(), &id.model, &id.name);
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)
                .map_err(|e| PluginError::failed(Self::ID, format!("{}: {e}", parent.display())))?;
        }
        let json = serde_json::to_string_pretty(config)
            .map_err(|e| PluginError::failed(Self::ID, e.to_string()))?;
        fs::write(&path, json)
            .map_err(|e| PluginError::failed(Self::ID, format!("{}: {e}", path.display())))?;
        debug!(config = %id, path = %path.display(), "Wrote config");
        Ok(())
    }
}
