//! Artifact coordinates.
//!
//! A coordinate identifies a feature pack (or any raw resource) in the
//! repository. Its textual form is
//! `group:artifact:version[:classifier][:extension]`:
//!
//! | Text                      | classifier | extension |
//! |---------------------------|------------|-----------|
//! | `org.acme:core:1.0`       | none       | none      |
//! | `org.acme:core:1.0:x`     | `x`        | none      |
//! | `org.acme:core:1.0::zip`  | none       | `zip`     |
//! | `org.acme:core:1.0:x:zip` | `x`        | `zip`     |
//!
//! Equality is structural. Coordinates order lexicographically by their
//! fields so they can key ordered maps.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Error parsing the textual coordinate form
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("Invalid artifact coordinate '{text}': {reason}")]
pub struct CoordinateParseError {
    pub text: String,
    pub reason: &'static str,
}

/// `group:artifact:version[:classifier][:extension]`
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct ArtifactCoordinate {
    group: String,
    artifact: String,
    version: String,
    classifier: Option<String>,
    extension: Option<String>,
}

impl ArtifactCoordinate {
    /// Create a coordinate without classifier or extension
    pub fn new(
        group: impl Into<String>,
        artifact: impl Into<String>,
        version: impl Into<String>,
    ) -> Self {
        Self {
            group: group.into(),
            artifact: artifact.into(),
            version: version.into(),
            classifier: None,
            extension: None,
        }
    }

    /// Set the classifier
    pub fn with_classifier(mut self, classifier: impl Into<String>) -> Self {
        self.classifier = Some(classifier.into());
        self
    }

    /// Set the extension
    pub fn with_extension(mut self, extension: impl Into<String>) -> Self {
        self.extension = Some(extension.into());
        self
    }

    pub fn group(&self) -> &str {
        &self.group
    }

    pub fn artifact(&self) -> &str {
        &self.artifact
    }

    pub fn version(&self) -> &str {
        &self.version
    }

    pub fn classifier(&self) -> Option<&str> {
        self.classifier.as_deref()
    }

    pub fn extension(&self) -> Option<&str> {
        self.extension.as_deref()
    }

    /// `group:artifact`, the version-less identity of a feature pack.
    ///
    /// Two coordinates with the same `ga()` and different versions can never
    /// both be provisioned.
    pub fn ga(&self) -> String {
        format!("{}:{}", self.group, self.artifact)
    }
}

impl fmt::Display for ArtifactCoordinate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}:{}", self.group, self.artifact, self.version)?;
        match (&self.classifier, &self.extension) {
            (None, None) => Ok(()),
            (Some(c), None) => write!(f, ":{c}"),
            (None, Some(e)) => write!(f, "::{e}"),
            (Some(c), Some(e)) => write!(f, ":{c}:{e}"),
        }
    }
}

impl FromStr for ArtifactCoordinate {
    type Err = CoordinateParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let err = |reason| CoordinateParseError {
            text: s.to_string(),
            reason,
        };

        let parts: Vec<&str> = s.split(':').collect();
        if parts.len() < 3 {
            return Err(err("expected at least group:artifact:version"));
        }
        if parts.len() > 5 {
            return Err(err("too many ':' separated segments"));
        }
        if parts[..3].iter().any(|p| p.trim().is_empty()) {
            return Err(err("group, artifact and version must not be empty"));
        }

        let optional = |idx: usize| {
            parts
                .get(idx)
                .filter(|p| !p.is_empty())
                .map(|p| (*p).to_string())
        };
        let classifier = optional(3);
        let extension = optional(4);
        if parts.len() == 4 && classifier.is_none() {
            return Err(err("classifier segment must not be empty"));
        }
        if parts.len() == 5 && extension.is_none() {
            return Err(err("extension segment must not be empty"));
        }

        Ok(Self {
            group: parts[0].to_string(),
            artifact: parts[1].to_string(),
            version: parts[2].to_string(),
            classifier,
            extension,
        })
    }
}

impl TryFrom<String> for ArtifactCoordinate {
    type Error = CoordinateParseError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<ArtifactCoordinate> for String {
    fn from(value: ArtifactCoordinate) -> Self {
        value.to_string()
    }
}
