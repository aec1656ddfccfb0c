//! Descriptor loading from an artifact repository.
//!
//! A feature pack's location (as resolved by an [`ArtifactResolver`]) holds
//! its descriptor in `feature-pack.json`. [`load_transitive`] follows
//! dependency coordinates level by level; the packs of one level are
//! independent of each other, so they are fetched in parallel.

use std::collections::{HashMap, HashSet};
use std::fs;

use rayon::prelude::*;
use tracing::{debug, info};

use crate::artifact::ArtifactResolver;
use crate::coordinate::ArtifactCoordinate;
use crate::descriptor::FeaturePackSpec;
use crate::error::{ArtifactError, DescriptionError, Result};
use crate::registry::FeatureSpecRegistry;

/// File name of the descriptor inside a feature pack
pub const DESCRIPTOR_FILE: &str = "feature-pack.json";

/// Produces the descriptor of a feature pack.
pub trait DescriptorLoader: Send + Sync {
    fn load(&self, coordinate: &ArtifactCoordinate) -> Result<FeaturePackSpec>;
}

/// Reads `feature-pack.json` from wherever the resolver puts the pack.
#[derive(Debug, Clone)]
pub struct JsonDescriptorLoader<R> {
    resolver: R,
}

impl<R: ArtifactResolver> JsonDescriptorLoader<R> {
    pub fn new(resolver: R) -> Self {
        Self { resolver }
    }

    pub fn resolver(&self) -> &R {
        &self.resolver
    }
}

impl<R: ArtifactResolver> DescriptorLoader for JsonDescriptorLoader<R> {
    fn load(&self, coordinate: &ArtifactCoordinate) -> Result<FeaturePackSpec> {
        let location = self.resolver.resolve(coordinate)?;
        let path = location.join(DESCRIPTOR_FILE);
        let text = fs::read_to_string(&path).map_err(|e| ArtifactError::io(&path, e))?;

        let spec: FeaturePackSpec =
            serde_json::from_str(&text).map_err(|e| DescriptionError::Malformed {
                pack: coordinate.clone(),
                reason: e.to_string(),
            })?;
        if &spec.coordinate != coordinate {
            return Err(DescriptionError::CoordinateMismatch {
                expected: coordinate.clone(),
                found: spec.coordinate,
            }
            .into());
        }
        debug!(%coordinate, "Loaded descriptor");
        Ok(spec)
    }
}

/// Load the roots and everything they depend on into a new registry.
///
/// A dependency on a `group:artifact` that is also a root is loaded in the
/// root's version, matching how the layout resolver pins top-level packs.
pub fn load_transitive<L>(
    loader: &L,
    roots: &[ArtifactCoordinate],
    max_parallel: usize,
) -> Result<FeatureSpecRegistry>
where
    L: DescriptorLoader + ?Sized,
{
    let pinned: HashMap<String, ArtifactCoordinate> =
        roots.iter().map(|c| (c.ga(), c.clone())).collect();

    let mut registry = FeatureSpecRegistry::new();
    let mut seen: HashSet<ArtifactCoordinate> = HashSet::new();
    let mut level: Vec<ArtifactCoordinate> = roots
        .iter()
        .filter(|c| seen.insert((*c).clone()))
        .cloned()
        .collect();

    let mut depth = 0;
    while !level.is_empty() {
        debug!(depth, packs = level.len(), "Loading descriptor level");
        let specs = load_level(loader, &level, max_parallel)?;

        let mut next = Vec::new();
        for spec in specs {
            for dep in &spec.dependencies {
                let target = pinned
                    .get(&dep.coordinate.ga())
                    .cloned()
                    .unwrap_or_else(|| dep.coordinate.clone());
                if seen.insert(target.clone()) {
                    next.push(target);
                }
            }
            registry.register(spec)?;
        }
        level = next;
        depth += 1;
    }

    info!(packs = registry.len(), "Loaded feature-pack descriptors");
    Ok(registry)
}

fn load_level<L>(
    loader: &L,
    level: &[ArtifactCoordinate],
    max_parallel: usize,
) -> Result<Vec<FeaturePackSpec>>
where
    L: DescriptorLoader + ?Sized,
{
    if level.len() <= 1 || max_parallel <= 1 {
        return level.iter().map(|c| loader.load(c)).collect();
    }

    let pool = rayon::ThreadPoolBuilder::new()
        .num_threads(max_parallel.min(level.len()))
        .build()
        .map_err(|e| ArtifactError::Pool(e.to_string()))?;

    pool.install(|| {
        level
            .par_iter()
            .map(|c| loader.load(c))
            .collect::<Result<Vec<_>>>()
    })
}
