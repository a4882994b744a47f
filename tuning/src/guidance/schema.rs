//! The bounded, line-oriented guidance block for one repository.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::util::fsio;

/// Default character budget for a rendered guidance block.
pub const DEFAULT_CHAR_BUDGET: usize = 3200;

/// Result type alias for guidance persistence operations.
pub type GuidanceResult<T> = Result<T, GuidanceError>;

/// Error during guidance load/save.
#[derive(Debug, Error)]
pub enum GuidanceError {
    /// Filesystem operation failed.
    #[error("guidance IO error at {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// Guidance file contains invalid JSON.
    #[error("invalid guidance JSON at {path}: {source}")]
    Json {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },
}

/// A bounded guidance block for one repository.
///
/// Immutable value: versions are created by the initializer or the
/// proposer and never edited in place. Earlier versions stay on disk so
/// a run can always be inspected after the fact.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Guidance {
    /// Repository slug in `owner/name` form.
    pub repo: String,
    /// Commit the guidance was tuned against.
    pub commit: String,
    /// Ordered guidance lines; insertion order is the render order.
    pub lines: Vec<String>,
    /// Monotonic version number, assigned by the tuner.
    pub version: u64,
    /// Maximum characters allowed in the rendered block.
    pub char_budget: usize,
}

impl Guidance {
    /// Create a new guidance block.
    pub fn new(
        repo: impl Into<String>,
        commit: impl Into<String>,
        lines: Vec<String>,
        version: u64,
        char_budget: usize,
    ) -> Self {
        Self {
            repo: repo.into(),
            commit: commit.into(),
            lines,
            version,
            char_budget,
        }
    }

    /// Join the lines into the guidance text block.
    pub fn render(&self) -> String {
        self.lines.join("\n")
    }

    /// Character count of the rendered block.
    pub fn char_count(&self) -> usize {
        self.render().chars().count()
    }

    /// Whether the rendered block fits the character budget.
    pub fn is_within_budget(&self) -> bool {
        self.char_count() <= self.char_budget
    }

    /// Copy with a different version number.
    pub fn with_version(&self, version: u64) -> Self {
        Self {
            version,
            ..self.clone()
        }
    }

    /// Copy with replacement lines.
    pub fn with_lines(&self, lines: Vec<String>) -> Self {
        Self {
            lines,
            ..self.clone()
        }
    }

    /// Persist to `path` as pretty-printed JSON (atomic replace).
    pub fn save(&self, path: &Path) -> GuidanceResult<()> {
        fsio::write_json_atomic(path, self).map_err(|source| GuidanceError::Io {
            path: path.to_path_buf(),
            source,
        })
    }

    /// Load a guidance block previously written by [`Guidance::save`].
    pub fn load(path: &Path) -> GuidanceResult<Self> {
        let body = std::fs::read_to_string(path).map_err(|source| GuidanceError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        serde_json::from_str(&body).map_err(|source| GuidanceError::Json {
            path: path.to_path_buf(),
            source,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn sample() -> Guidance {
        Guidance::new(
            "astropy/astropy",
            "abc123",
            vec![
                "- Core units logic lives in astropy/units/".to_string(),
                "- Run pytest from the repo root".to_string(),
            ],
            0,
            DEFAULT_CHAR_BUDGET,
        )
    }

    #[test]
    fn test_render_joins_lines() {
        let g = sample();
        assert_eq!(
            g.render(),
            "- Core units logic lives in astropy/units/\n- Run pytest from the repo root"
        );
        assert_eq!(g.char_count(), g.render().chars().count());
    }

    #[test]
    fn test_budget_check() {
        let mut g = sample();
        assert!(g.is_within_budget());
        g.char_budget = 10;
        assert!(!g.is_within_budget());
    }

    #[test]
    fn test_copy_helpers() {
        let g = sample();
        let v3 = g.with_version(3);
        assert_eq!(v3.version, 3);
        assert_eq!(v3.lines, g.lines);
        assert_eq!(v3.repo, g.repo);

        let replaced = g.with_lines(vec!["- only line".to_string()]);
        assert_eq!(replaced.version, 0);
        assert_eq!(replaced.lines.len(), 1);
    }

    #[test]
    fn test_save_load_roundtrip() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("versions/v0.json");

        let g = sample();
        g.save(&path).unwrap();
        let back = Guidance::load(&path).unwrap();
        assert_eq!(back, g);
    }

    #[test]
    fn test_load_missing_file_is_io_error() {
        let dir = tempdir().unwrap();
        let err = Guidance::load(&dir.path().join("nope.json")).unwrap_err();
        assert!(matches!(err, GuidanceError::Io { .. }));
    }

    #[test]
    fn test_saved_json_has_schema_keys() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("v0.json");
        sample().save(&path).unwrap();

        let value: serde_json::Value =
            serde_json::from_str(&std::fs::read_to_string(&path).unwrap()).unwrap();
        for key in ["repo", "commit", "lines", "version", "char_budget"] {
            assert!(value.get(key).is_some(), "missing key {key}");
        }
    }
}
