//! Materialization: writing a provisioned state to a target directory.
//!
//! # Design
//!
//! | Step    | Where                                   | On failure                |
//! |---------|-----------------------------------------|---------------------------|
//! | stage   | temp dir next to the target             | staged tree removed       |
//! | copy    | `packages/<name>/content/**` per pack   | staged tree removed       |
//! | plugins | run against the staged tree             | staged tree removed       |
//! | commit  | rename staged tree onto the target      | staged tree removed       |
//!
//! The target is only touched by the final rename, so a failed run never
//! leaves a partial installation behind.

use std::fs;
use std::path::{Path, PathBuf};

use tempfile::TempDir;
use tracing::{debug, info, warn};

use crate::artifact::{ArtifactResolver, copy_tree, fetch_all};
use crate::error::{MaterializeError, Result};
use crate::plugin::{PluginContext, PluginRegistry, run_plugins};
use crate::state::ProvisionedState;

const STAGING_PREFIX: &str = ".fpack-staging-";

/// Writes a provisioned state somewhere.
pub trait Materializer {
    fn materialize(&self, state: &ProvisionedState, target_dir: &Path) -> Result<()>;
}

/// Materializes onto the local filesystem.
pub struct FsMaterializer<'a> {
    resolver: &'a dyn ArtifactResolver,
    plugins: &'a PluginRegistry,
    work_dir: Option<PathBuf>,
    encoding: String,
    max_parallel: usize,
}

impl<'a> FsMaterializer<'a> {
    pub fn new(resolver: &'a dyn ArtifactResolver, plugins: &'a PluginRegistry) -> Self {
        Self {
            resolver,
            plugins,
            work_dir: None,
            encoding: "UTF-8".to_string(),
            max_parallel: 4,
        }
    }

    /// Scratch directory handed to plugins; a temporary one otherwise
    pub fn with_work_dir(mut self, work_dir: impl Into<PathBuf>) -> Self {
        self.work_dir = Some(work_dir.into());
        self
    }

    pub fn with_encoding(mut self, encoding: impl Into<String>) -> Self {
        self.encoding = encoding.into();
        self
    }

    pub fn with_max_parallel(mut self, max_parallel: usize) -> Self {
        self.max_parallel = max_parallel;
        self
    }

    fn stage(&self, state: &ProvisionedState, staged: &Path) -> Result<()> {
        let coordinates: Vec<_> = state
            .feature_packs
            .iter()
            .map(|fp| fp.coordinate.clone())
            .collect();
        let locations = fetch_all(self.resolver, &coordinates, self.max_parallel)?;

        for (pack, location) in state.feature_packs.iter().zip(&locations) {
            for package in &pack.packages {
                let content = location.join("packages").join(package).join("content");
                if !content.is_dir() {
                    continue;
                }
                let copied =
                    copy_tree(&content, staged).map_err(|(p, e)| MaterializeError::io(p, e))?;
                debug!(pack = %pack.coordinate, package = %package, files = copied, "Staged package content");
            }
        }

        let scratch;
        let work_dir = match &self.work_dir {
            Some(dir) => {
                fs::create_dir_all(dir).map_err(|e| MaterializeError::io(dir, e))?;
                dir.as_path()
            }
            None => {
                scratch = TempDir::new().map_err(|e| MaterializeError::io(std::env::temp_dir(), e))?;
                scratch.path()
            }
        };
        let ctx = PluginContext::new(state, staged, work_dir, &self.encoding, self.resolver);
        run_plugins(self.plugins, &ctx)?;
        Ok(())
    }
}

fn is_empty_dir(path: &Path) -> std::io::Result<bool> {
    Ok(fs::read_dir(path)?.next().is_none())
}

impl Materializer for FsMaterializer<'_> {
    fn materialize(&self, state: &ProvisionedState, target_dir: &Path) -> Result<()> {
        let target_exists = target_dir.exists();
        if target_exists {
            let empty = is_empty_dir(target_dir).map_err(|e| MaterializeError::io(target_dir, e))?;
            if !empty {
                return Err(MaterializeError::TargetNotEmpty {
                    path: target_dir.to_path_buf(),
                }
                .into());
            }
        }

        let parent = match target_dir.parent() {
            Some(p) if !p.as_os_str().is_empty() => p.to_path_buf(),
            _ => PathBuf::from("."),
        };
        fs::create_dir_all(&parent).map_err(|e| MaterializeError::io(&parent, e))?;

        // Dropping the TempDir removes the staged tree
        let staged = tempfile::Builder::new()
            .prefix(STAGING_PREFIX)
            .tempdir_in(&parent)
            .map_err(|e| MaterializeError::io(&parent, e))?;
        debug!(path = %staged.path().display(), "Staging installation");

        if let Err(e) = self.stage(state, staged.path()) {
            warn!(error = %e, "Materialization failed, discarding staged tree");
            return Err(e);
        }

        // rename(2) replaces an existing empty directory in one step
        let staged_path = staged.keep();
        if let Err(e) = fs::rename(&staged_path, target_dir) {
            warn!(error = %e, "Commit failed, discarding staged tree");
            if let Err(cleanup) = fs::remove_dir_all(&staged_path) {
                warn!(error = %cleanup, path = %staged_path.display(), "Failed to remove staged tree");
            }
            return Err(MaterializeError::io(target_dir, e).into());
        }

        info!(target = %target_dir.display(), "Installation committed");
        Ok(())
    }
}
