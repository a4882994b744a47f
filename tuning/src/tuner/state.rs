//! Persistent tuning state for one repository.
//!
//! The history is append-only: exactly one `init` event first, then
//! candidate events with strictly increasing versions. `best_score` is
//! the maximum score seen so far; `completed_iterations` is the last
//! fully-finished iteration. Every save is an atomic snapshot replace.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::runner::TokenUsage;
use crate::util::fsio;

/// Result type alias for state persistence.
pub type StateResult<T> = Result<T, StateError>;

/// Error loading or saving a state snapshot.
#[derive(Debug, Error)]
pub enum StateError {
    /// Snapshot IO failed.
    #[error("state IO error at {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// Snapshot is not valid JSON — a fatal condition for resume.
    #[error("unreadable state file {path}: {source}")]
    Unreadable {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },
}

/// What produced a history event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventKind {
    /// The scored initial guidance G₀.
    Init,
    /// A scored proposer candidate.
    Candidate,
}

/// One scored guidance version in the tuning history.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HistoryEvent {
    pub version: u64,
    pub score: f64,
    pub kind: EventKind,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub iteration: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub candidate_index: Option<usize>,
    pub resolved: usize,
    pub total: usize,
    pub non_empty_patches: usize,
    pub elapsed_s: f64,
    pub token_usage: TokenUsage,
    pub instance_metrics_path: String,
}

/// Persistent state of one repo's tuning run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TuningState {
    pub repo: String,
    pub best_version: u64,
    pub best_score: f64,
    pub history: Vec<HistoryEvent>,
    pub completed_iterations: u32,
}

impl TuningState {
    /// Fresh state for a repo, before the init event.
    pub fn new(repo: impl Into<String>) -> Self {
        Self {
            repo: repo.into(),
            best_version: 0,
            best_score: 0.0,
            history: Vec::new(),
            completed_iterations: 0,
        }
    }

    /// `(version, score)` pairs for the proposer prompt.
    pub fn score_history(&self) -> Vec<(u64, f64)> {
        self.history.iter().map(|h| (h.version, h.score)).collect()
    }

    /// Atomically persist the snapshot.
    pub fn save(&self, path: &Path) -> StateResult<()> {
        fsio::write_json_atomic(path, self).map_err(|source| StateError::Io {
            path: path.to_path_buf(),
            source,
        })
    }

    /// Load a snapshot written by [`TuningState::save`].
    pub fn load(path: &Path) -> StateResult<Self> {
        let body = std::fs::read_to_string(path).map_err(|source| StateError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        serde_json::from_str(&body).map_err(|source| StateError::Unreadable {
            path: path.to_path_buf(),
            source,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn event(version: u64, score: f64, kind: EventKind) -> HistoryEvent {
        HistoryEvent {
            version,
            score,
            kind,
            iteration: (kind == EventKind::Candidate).then_some(1),
            candidate_index: (kind == EventKind::Candidate).then_some(0),
            resolved: 1,
            total: 3,
            non_empty_patches: 2,
            elapsed_s: 4.5,
            token_usage: TokenUsage::default(),
            instance_metrics_path: "preds/iter01/c0/instance_metrics.jsonl".to_string(),
        }
    }

    #[test]
    fn test_fresh_state() {
        let state = TuningState::new("o/n");
        assert_eq!(state.best_version, 0);
        assert_eq!(state.best_score, 0.0);
        assert!(state.history.is_empty());
        assert_eq!(state.completed_iterations, 0);
    }

    #[test]
    fn test_save_load_roundtrip() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("tuning_state.json");

        let mut state = TuningState::new("o/n");
        state.history.push(event(0, 0.33, EventKind::Init));
        state.history.push(event(1, 0.66, EventKind::Candidate));
        state.best_version = 1;
        state.best_score = 0.66;
        state.completed_iterations = 1;
        state.save(&path).unwrap();

        let back = TuningState::load(&path).unwrap();
        assert_eq!(back.repo, "o/n");
        assert_eq!(back.best_version, 1);
        assert_eq!(back.history.len(), 2);
        assert_eq!(back.history[0].kind, EventKind::Init);
        assert_eq!(back.history[1].iteration, Some(1));
        assert_eq!(back.completed_iterations, 1);
    }

    #[test]
    fn test_corrupt_state_is_unreadable() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("tuning_state.json");
        std::fs::write(&path, "{ truncated").unwrap();
        assert!(matches!(
            TuningState::load(&path).unwrap_err(),
            StateError::Unreadable { .. }
        ));
    }

    #[test]
    fn test_init_event_omits_iteration_fields() {
        let mut e = event(0, 0.2, EventKind::Init);
        e.iteration = None;
        e.candidate_index = None;
        let json = serde_json::to_string(&e).unwrap();
        assert!(!json.contains("iteration"));
        assert!(!json.contains("candidate_index"));
        assert!(json.contains("\"kind\":\"init\""));
    }

    #[test]
    fn test_score_history_pairs() {
        let mut state = TuningState::new("o/n");
        state.history.push(event(0, 0.1, EventKind::Init));
        state.history.push(event(1, 0.4, EventKind::Candidate));
        assert_eq!(state.score_history(), vec![(0, 0.1), (1, 0.4)]);
    }
}
