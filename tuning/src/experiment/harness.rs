//! External evaluation harness invocation.
//!
//! The orchestrator hands `(dataset, predictions path, run id, worker
//! count)` to an external process and reads counts back from its
//! results directory. The harness is a trait seam so the orchestrator
//! is testable without the real benchmark installed.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;
use tracing::{info, warn};

use super::results::{load_instance_records, load_results, summarize_failure_taxonomy};

/// Wall-clock budget for one harness invocation.
const HARNESS_TIMEOUT: Duration = Duration::from_secs(3600);

/// Result type alias for harness calls.
pub type HarnessResult<T> = Result<T, HarnessError>;

/// Error from an external harness invocation.
#[derive(Debug, Error)]
pub enum HarnessError {
    /// The harness command could not be spawned.
    #[error("failed to spawn harness: {0}")]
    Spawn(#[source] std::io::Error),

    /// The harness exceeded its wall-clock budget.
    #[error("harness timed out after {0:?}")]
    Timeout(Duration),

    /// The harness finished but produced no readable results.
    #[error("no harness results found under {0}")]
    NoResults(PathBuf),

    /// Log streaming failed.
    #[error("harness log IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Counts read back from the harness, plus the coarse failure
/// taxonomy when the harness produced per-instance records.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HarnessOutcome {
    pub resolved: usize,
    pub total: usize,
    pub failure_taxonomy: Option<BTreeMap<String, usize>>,
}

/// Seam for the external evaluation harness.
#[async_trait]
pub trait EvalHarness: Send + Sync {
    /// Evaluate a predictions log and return resolve counts.
    async fn evaluate(
        &self,
        dataset: &str,
        predictions_path: &Path,
        run_id: &str,
        workers: u32,
    ) -> HarnessResult<HarnessOutcome>;
}

/// Production harness: an external command receiving the four
/// positional arguments, with stdout/stderr streamed to log files.
pub struct CommandHarness {
    /// Program plus leading arguments.
    pub command: Vec<String>,
    /// Where the harness writes `<run_id>/results.json` or
    /// `<run_id>/instance_results.jsonl`.
    pub results_root: PathBuf,
    /// Where invocation logs are streamed.
    pub logs_dir: PathBuf,
}

impl CommandHarness {
    /// Create a harness runner for the given command.
    pub fn new(command: Vec<String>, results_root: PathBuf, logs_dir: PathBuf) -> Self {
        Self {
            command,
            results_root,
            logs_dir,
        }
    }
}

#[async_trait]
impl EvalHarness for CommandHarness {
    async fn evaluate(
        &self,
        dataset: &str,
        predictions_path: &Path,
        run_id: &str,
        workers: u32,
    ) -> HarnessResult<HarnessOutcome> {
        let (program, args) = self
            .command
            .split_first()
            .ok_or_else(|| HarnessError::Spawn(std::io::Error::other("empty harness command")))?;

        std::fs::create_dir_all(&self.logs_dir)?;
        let stdout_log = std::fs::File::create(self.logs_dir.join(format!("eval_{run_id}.stdout.log")))?;
        let stderr_log = std::fs::File::create(self.logs_dir.join(format!("eval_{run_id}.stderr.log")))?;

        info!(run_id, dataset, "invoking evaluation harness");
        let status = tokio::time::timeout(
            HARNESS_TIMEOUT,
            tokio::process::Command::new(program)
                .args(args)
                .arg(dataset)
                .arg(predictions_path)
                .arg(run_id)
                .arg(workers.to_string())
                .stdin(Stdio::null())
                .stdout(Stdio::from(stdout_log))
                .stderr(Stdio::from(stderr_log))
                .status(),
        )
        .await
        .map_err(|_| HarnessError::Timeout(HARNESS_TIMEOUT))?
        .map_err(HarnessError::Spawn)?;

        if !status.success() {
            warn!(run_id, code = status.code(), "harness exited non-zero");
        }

        let results_dir = self.results_root.join(run_id);
        let (resolved, total) =
            load_results(&results_dir).ok_or_else(|| HarnessError::NoResults(results_dir.clone()))?;

        let records = load_instance_records(&results_dir.join("instance_results.jsonl"));
        let failure_taxonomy =
            (!records.is_empty()).then(|| summarize_failure_taxonomy(&records));

        info!(run_id, resolved, total, "harness results loaded");
        Ok(HarnessOutcome {
            resolved,
            total,
            failure_taxonomy,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[tokio::test]
    async fn test_command_harness_reads_results() {
        let dir = tempdir().unwrap();
        let results_root = dir.path().join("results");
        let run_dir = results_root.join("exp__no_guidance");
        std::fs::create_dir_all(&run_dir).unwrap();
        std::fs::write(
            run_dir.join("results.json"),
            serde_json::json!({"resolved": ["a"], "applied": ["a", "b"]}).to_string(),
        )
        .unwrap();

        let preds = dir.path().join("preds.jsonl");
        std::fs::write(&preds, "").unwrap();

        // `true` as the harness command: exits 0 without doing work.
        let harness = CommandHarness::new(
            vec!["true".to_string()],
            results_root,
            dir.path().join("logs"),
        );
        let outcome = harness
            .evaluate("dataset", &preds, "exp__no_guidance", 4)
            .await
            .unwrap();
        assert_eq!(outcome.resolved, 1);
        assert_eq!(outcome.total, 2);
        // Summary file only: no per-instance records, no taxonomy.
        assert!(outcome.failure_taxonomy.is_none());
        assert!(dir
            .path()
            .join("logs/eval_exp__no_guidance.stdout.log")
            .exists());
    }

    #[tokio::test]
    async fn test_command_harness_builds_failure_taxonomy() {
        let dir = tempdir().unwrap();
        let results_root = dir.path().join("results");
        let run_dir = results_root.join("run");
        std::fs::create_dir_all(&run_dir).unwrap();
        let body = [
            serde_json::json!({"instance_id": "a", "resolved": true}).to_string(),
            serde_json::json!({"instance_id": "b", "error": "timeout after 120s"}).to_string(),
            serde_json::json!({"instance_id": "c", "error": "could not apply patch"}).to_string(),
        ]
        .join("\n");
        std::fs::write(run_dir.join("instance_results.jsonl"), body).unwrap();

        let harness = CommandHarness::new(
            vec!["true".to_string()],
            results_root,
            dir.path().join("logs"),
        );
        let outcome = harness
            .evaluate("dataset", &dir.path().join("p.jsonl"), "run", 1)
            .await
            .unwrap();
        assert_eq!(outcome.resolved, 1);
        assert_eq!(outcome.total, 3);
        let taxonomy = outcome.failure_taxonomy.unwrap();
        assert_eq!(taxonomy["resolved"], 1);
        assert_eq!(taxonomy["timeout"], 1);
        assert_eq!(taxonomy["patch_apply_failure"], 1);
    }

    #[tokio::test]
    async fn test_command_harness_no_results_is_error() {
        let dir = tempdir().unwrap();
        let harness = CommandHarness::new(
            vec!["true".to_string()],
            dir.path().join("results"),
            dir.path().join("logs"),
        );
        let err = harness
            .evaluate("dataset", &dir.path().join("p.jsonl"), "run", 1)
            .await
            .unwrap_err();
        assert!(matches!(err, HarnessError::NoResults(_)));
    }
}
