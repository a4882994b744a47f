//! Task loading and normalization.
//!
//! Tasks arrive as JSONL (one object per line) or JSON (a bare list or
//! `{"tasks": [...]}`). Field names vary across generators, so rows are
//! normalized: `id` for `instance_id`, `repository` for `repo`,
//! `commit`/`base_sha` for `base_commit`, `issue`/`problem`/`prompt`
//! for `problem_statement`. Benchmark-dataset ingestion lives outside
//! this crate; only task files are consumed here.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Result type alias for dataset operations.
pub type DatasetResult<T> = Result<T, DatasetError>;

/// Error loading a tasks file.
#[derive(Debug, Error)]
pub enum DatasetError {
    /// Tasks file does not exist.
    #[error("tasks file not found: {path}")]
    NotFound { path: PathBuf },

    /// Filesystem read failed.
    #[error("failed to read {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// A row failed to parse as JSON.
    #[error("invalid JSON in {path}: {source}")]
    Json {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },

    /// A row is missing required fields.
    #[error("task row missing required fields (instance_id/id, repo/repository, base_commit/commit/base_sha)")]
    MissingFields,

    /// JSON payload is neither a list nor `{"tasks": [...]}`.
    #[error("unsupported tasks payload in {path}: expected a list or an object with a 'tasks' key")]
    UnsupportedPayload { path: PathBuf },
}

/// One coding task: the input to a single agent run. Read-only.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Task {
    /// Unique benchmark instance id.
    pub instance_id: String,
    /// Repository slug in `owner/name` form.
    pub repo: String,
    /// Commit the task's container is built at.
    pub base_commit: String,
    /// The issue text handed to the agent.
    pub problem_statement: String,
    /// Explicit container image override, when the generator knows it.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub image_tag: Option<String>,
    /// Benchmark version marker, passed through untouched.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub version: Option<serde_json::Value>,
    /// Environment setup commit, passed through untouched.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub environment_setup_commit: Option<serde_json::Value>,
}

/// Raw task row with every field-name variant seen in the wild.
#[derive(Deserialize)]
struct RawTask {
    #[serde(alias = "id")]
    instance_id: Option<String>,
    #[serde(alias = "repository")]
    repo: Option<String>,
    #[serde(alias = "commit", alias = "base_sha")]
    base_commit: Option<String>,
    #[serde(alias = "issue", alias = "problem", alias = "prompt")]
    problem_statement: Option<String>,
    #[serde(alias = "image_name")]
    image_tag: Option<String>,
    version: Option<serde_json::Value>,
    environment_setup_commit: Option<serde_json::Value>,
}

impl RawTask {
    fn normalize(self) -> DatasetResult<Task> {
        let instance_id = self
            .instance_id
            .filter(|s| !s.is_empty())
            .ok_or(DatasetError::MissingFields)?;
        let repo = self
            .repo
            .filter(|s| !s.is_empty())
            .ok_or(DatasetError::MissingFields)?;
        let base_commit = self
            .base_commit
            .filter(|s| !s.is_empty())
            .ok_or(DatasetError::MissingFields)?;

        Ok(Task {
            instance_id,
            repo,
            base_commit,
            problem_statement: self.problem_statement.unwrap_or_default(),
            image_tag: self.image_tag,
            version: self.version,
            environment_setup_commit: self.environment_setup_commit,
        })
    }
}

/// Load tasks from a JSONL or JSON file, optionally filtered to an
/// allow-list of instance ids and capped at `limit`.
pub fn load_tasks(
    path: &Path,
    instance_ids: Option<&[String]>,
    limit: Option<usize>,
) -> DatasetResult<Vec<Task>> {
    if !path.exists() {
        return Err(DatasetError::NotFound {
            path: path.to_path_buf(),
        });
    }

    let body = std::fs::read_to_string(path).map_err(|source| DatasetError::Io {
        path: path.to_path_buf(),
        source,
    })?;

    let rows: Vec<serde_json::Value> = if path
        .extension()
        .is_some_and(|e| e.eq_ignore_ascii_case("jsonl"))
    {
        let mut rows = Vec::new();
        for line in body.lines() {
            let line = line.trim();
            if line.is_empty() {
                continue;
            }
            rows.push(
                serde_json::from_str(line).map_err(|source| DatasetError::Json {
                    path: path.to_path_buf(),
                    source,
                })?,
            );
        }
        rows
    } else {
        let payload: serde_json::Value =
            serde_json::from_str(&body).map_err(|source| DatasetError::Json {
                path: path.to_path_buf(),
                source,
            })?;
        match payload {
            serde_json::Value::Array(rows) => rows,
            serde_json::Value::Object(mut map) => match map.remove("tasks") {
                Some(serde_json::Value::Array(rows)) => rows,
                _ => {
                    return Err(DatasetError::UnsupportedPayload {
                        path: path.to_path_buf(),
                    })
                }
            },
            _ => {
                return Err(DatasetError::UnsupportedPayload {
                    path: path.to_path_buf(),
                })
            }
        }
    };

    let mut tasks = Vec::new();
    for row in rows {
        let raw: RawTask = serde_json::from_value(row).map_err(|source| DatasetError::Json {
            path: path.to_path_buf(),
            source,
        })?;
        tasks.push(raw.normalize()?);
    }

    if let Some(ids) = instance_ids {
        let allowed: std::collections::HashSet<&str> = ids.iter().map(String::as_str).collect();
        tasks.retain(|t| allowed.contains(t.instance_id.as_str()));
    }
    if let Some(limit) = limit {
        tasks.truncate(limit);
    }

    Ok(tasks)
}

/// Read instance ids from a file, one per line. Blank lines and lines
/// starting with `#` are ignored.
pub fn read_instance_ids(path: &Path) -> DatasetResult<Vec<String>> {
    let body = std::fs::read_to_string(path).map_err(|source| DatasetError::Io {
        path: path.to_path_buf(),
        source,
    })?;
    Ok(body
        .lines()
        .map(str::trim)
        .filter(|l| !l.is_empty() && !l.starts_with('#'))
        .map(String::from)
        .collect())
}
