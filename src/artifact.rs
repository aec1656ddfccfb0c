//! Artifact repository access.
//!
//! The engine never touches repository storage directly. Everything that
//! needs bytes goes through [`ArtifactResolver`], whose failures are surfaced
//! unmodified as [`ArtifactError`].
//!
//! # Layout
//!
//! [`LocalRepository`] stores artifacts in a maven-like tree:
//!
//! ```text
//! <root>/org/acme/core/1.0/core-1.0            (directory or file)
//! <root>/org/acme/core/1.0/core-1.0-dist.zip   (classifier + extension)
//! ```
//!
//! Feature packs are stored unpacked: the location holds `feature-pack.json`
//! and a `packages/<name>/content/` tree per package.

use std::fs;
use std::path::{Path, PathBuf};

use rayon::prelude::*;
use tracing::debug;
use walkdir::WalkDir;

use crate::coordinate::ArtifactCoordinate;
use crate::error::ArtifactError;

// ============================================================================
// Resolver trait
// ============================================================================

/// Resolves coordinates to local content locations.
///
/// Implementations must be safe to call from several fetch threads at once.
pub trait ArtifactResolver: Send + Sync {
    /// Local location of the artifact's content
    fn resolve(&self, coordinate: &ArtifactCoordinate) -> Result<PathBuf, ArtifactError>;

    /// Store `content` (a file or a directory tree) under the coordinate
    fn install(
        &self,
        coordinate: &ArtifactCoordinate,
        content: &Path,
    ) -> Result<PathBuf, ArtifactError>;
}

// ============================================================================
// Local repository
// ============================================================================

/// A repository rooted at a local directory.
#[derive(Debug, Clone)]
pub struct LocalRepository {
    root: PathBuf,
}

impl LocalRepository {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Where the artifact lives, whether or not it exists
    pub fn path_of(&self, coordinate: &ArtifactCoordinate) -> PathBuf {
        let mut path = self.root.clone();
        path.extend(coordinate.group().split('.'));
        path.push(coordinate.artifact());
        path.push(coordinate.version());

        let mut file_name = format!("{}-{}", coordinate.artifact(), coordinate.version());
        if let Some(classifier) = coordinate.classifier() {
            file_name.push('-');
            file_name.push_str(classifier);
        }
        if let Some(extension) = coordinate.extension() {
            file_name.push('.');
            file_name.push_str(extension);
        }
        path.push(file_name);
        path
    }
}

impl ArtifactResolver for LocalRepository {
    fn resolve(&self, coordinate: &ArtifactCoordinate) -> Result<PathBuf, ArtifactError> {
        let path = self.path_of(coordinate);
        if !path.exists() {
            return Err(ArtifactError::NotFound {
                coordinate: coordinate.clone(),
                path,
            });
        }
        debug!(%coordinate, path = %path.display(), "Resolved artifact");
        Ok(path)
    }

    fn install(
        &self,
        coordinate: &ArtifactCoordinate,
        content: &Path,
    ) -> Result<PathBuf, ArtifactError> {
        let path = self.path_of(coordinate);
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).map_err(|e| ArtifactError::io(parent, e))?;
        }
        if content.is_dir() {
            copy_tree(content, &path).map_err(|(p, e)| ArtifactError::io(p, e))?;
        } else {
            fs::copy(content, &path).map_err(|e| ArtifactError::io(content, e))?;
        }
        debug!(%coordinate, path = %path.display(), "Installed artifact");
        Ok(path)
    }
}

// ============================================================================
// Helpers
// ============================================================================

/// Resolve independent coordinates with at most `max_parallel` fetches in
/// flight. Results are returned in input order.
pub fn fetch_all<R>(
    resolver: &R,
    coordinates: &[ArtifactCoordinate],
    max_parallel: usize,
) -> Result<Vec<PathBuf>, ArtifactError>
where
    R: ArtifactResolver + ?Sized,
{
    if coordinates.len() <= 1 || max_parallel <= 1 {
        return coordinates.iter().map(|c| resolver.resolve(c)).collect();
    }

    let pool = rayon::ThreadPoolBuilder::new()
        .num_threads(max_parallel.min(coordinates.len()))
        .build()
        .map_err(|e| ArtifactError::Pool(e.to_string()))?;

    pool.install(|| {
        coordinates
            .par_iter()
            .map(|c| resolver.resolve(c))
            .collect::<Result<Vec<_>, _>>()
    })
}

/// Copy a directory tree into `dst`, creating directories as needed.
///
/// Returns the number of files copied. The error carries the path that
/// failed.
pub(crate) fn copy_tree(src: &Path, dst: &Path) -> Result<usize, (PathBuf, std::io::Error)> {
    let mut copied = 0;
    for entry in WalkDir::new(src).sort_by_file_name() {
        let entry = entry.map_err(|e| (src.to_path_buf(), std::io::Error::from(e)))?;
        let relative = entry
            .path()
            .strip_prefix(src)
            .map_err(|e| (entry.path().to_path_buf(), std::io::Error::other(e)))?;
        let target = dst.join(relative);

        if entry.file_type().is_dir() {
            fs::create_dir_all(&target).map_err(|e| (target.clone(), e))?;
        } else {
            if let Some(parent) = target.parent() {
                fs::create_dir_all(parent).map_err(|e| (parent.to_path_buf(), e))?;
            }
            fs::copy(entry.path(), &target).map_err(|e| (entry.path().to_path_buf(), e))?;
            copied += 1;
        }
    }
    Ok(copied)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn coord(text: &str) -> ArtifactCoordinate {
        text.parse().unwrap()
    }

    #[test]
    fn test_path_layout() {
        let repo = LocalRepository::new("/repo");
        assert_eq!(
            repo.path_of(&coord("org.acme:core:1.0")),
            PathBuf::from("/repo/org/acme/core/1.0/core-1.0")
        );
        assert_eq!(
            repo.path_of(&coord("org.acme:core:1.0:dist:zip")),
            PathBuf::from("/repo/org/acme/core/1.0/core-1.0-dist.zip")
        );
        assert_eq!(
            repo.path_of(&coord("org.acme:core:1.0::zip")),
            PathBuf::from("/repo/org/acme/core/1.0/core-1.0.zip")
        );
    }

    #[test]
    fn test_resolve_missing_is_not_found() {
        let dir = TempDir::new().unwrap();
        let repo = LocalRepository::new(dir.path());
        let err = repo.resolve(&coord("g:a:1")).unwrap_err();
        assert!(matches!(err, ArtifactError::NotFound { .. }));
    }

    #[test]
    fn test_install_directory_then_resolve() {
        let repo_dir = TempDir::new().unwrap();
        let content = TempDir::new().unwrap();
        fs::create_dir_all(content.path().join("sub")).unwrap();
        fs::write(content.path().join("sub/file.txt"), "hello").unwrap();

        let repo = LocalRepository::new(repo_dir.path());
        let c = coord("g:a:1");
        let installed = repo.install(&c, content.path()).unwrap();
        assert_eq!(repo.resolve(&c).unwrap(), installed);
        assert_eq!(
            fs::read_to_string(installed.join("sub/file.txt")).unwrap(),
            "hello"
        );
    }

    #[test]
    fn test_install_single_file() {
        let repo_dir = TempDir::new().unwrap();
        let content = TempDir::new().unwrap();
        let file = content.path().join("x.zip");
        fs::write(&file, "zip").unwrap();

        let repo = LocalRepository::new(repo_dir.path());
        let c = coord("g:a:1::zip");
        let installed = repo.install(&c, &file).unwrap();
        assert!(installed.ends_with("g/a/1/a-1.zip"));
        assert_eq!(fs::read_to_string(installed).unwrap(), "zip");
    }

    #[test]
    fn test_fetch_all_keeps_input_order() {
        let repo_dir = TempDir::new().unwrap();
        let repo = LocalRepository::new(repo_dir.path());
        let coords: Vec<ArtifactCoordinate> =
            (0..6).map(|i| coord(&format!("g:a{i}:1"))).collect();
        for c in &coords {
            fs::create_dir_all(repo.path_of(c)).unwrap();
        }

        let paths = fetch_all(&repo, &coords, 3).unwrap();
        let expected: Vec<PathBuf> = coords.iter().map(|c| repo.path_of(c)).collect();
        assert_eq!(paths, expected);
    }

    #[test]
    fn test_fetch_all_surfaces_failure() {
        let repo_dir = TempDir::new().unwrap();
        let repo = LocalRepository::new(repo_dir.path());
        let present = coord("g:present:1");
        fs::create_dir_all(repo.path_of(&present)).unwrap();

        let err = fetch_all(&repo, &[present, coord("g:missing:1")], 2).unwrap_err();
        assert!(matches!(err, ArtifactError::NotFound { .. }));
    }
}
