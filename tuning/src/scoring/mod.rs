//! Score a guidance candidate over N tasks.
//!
//! The scorer is keyed by its prediction directory: one append-only
//! `preds.jsonl` plus one `instance_metrics.jsonl` per (repo, version).
//! On entry both logs are read back; any task already present is
//! treated as completed and its recorded metrics are reused. Remaining
//! tasks run in input order, and each completion is flushed to both
//! logs before the next task starts — a killed scorer resumes exactly
//! where it stopped.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{info, warn};

use crate::datasets::Task;
use crate::guidance::Guidance;
use crate::runner::{AgentDriver, TokenUsage};
use crate::util::fsio;
use crate::util::run_id::make_run_id;

/// Result type alias for scoring operations.
pub type ScoringResult<T> = Result<T, ScoreError>;

/// Error while reading or writing the scorer's logs.
#[derive(Debug, Error)]
pub enum ScoreError {
    /// Log file IO failed.
    #[error("scorer IO error at {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

/// One record of the predictions log (schema: one JSON object per line).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PredictionRecord {
    pub instance_id: String,
    pub model_name_or_path: String,
    pub model_patch: String,
}

/// One record of the per-task metrics log.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InstanceMetricsRecord {
    pub instance_id: String,
    pub elapsed_s: f64,
    pub patch_non_empty: bool,
    pub token_usage: TokenUsage,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// Detailed result of scoring one guidance candidate.
#[derive(Debug, Clone, Serialize)]
pub struct ScoreResult {
    /// Resolve rate: resolved / total.
    pub rate: f64,
    pub resolved: usize,
    pub total: usize,
    pub non_empty_patches: usize,
    /// Aggregate agent wall clock in seconds.
    pub total_elapsed_s: f64,
    pub token_usage: TokenUsage,
    /// Where the per-instance metrics live.
    pub instance_metrics_path: PathBuf,
}

impl ScoreResult {
    /// Fraction of tasks with a non-empty patch.
    pub fn non_empty_patch_rate(&self) -> f64 {
        if self.total == 0 {
            0.0
        } else {
            self.non_empty_patches as f64 / self.total as f64
        }
    }

    /// Mean agent wall clock per task in seconds.
    pub fn mean_elapsed_s(&self) -> f64 {
        if self.total == 0 {
            0.0
        } else {
            self.total_elapsed_s / self.total as f64
        }
    }

    /// All-zero result, used when scoring itself errored. Rate 0 by
    /// construction, so an errored candidate can never become best.
    pub fn zeroed(instance_metrics_path: PathBuf) -> Self {
        Self {
            rate: 0.0,
            resolved: 0,
            total: 0,
            non_empty_patches: 0,
            total_elapsed_s: 0.0,
            token_usage: TokenUsage::default(),
            instance_metrics_path,
        }
    }
}

/// The predicate deciding whether a patch resolves a task.
///
/// The default implementation ([`HarnessEvaluator`]) is strict: an
/// empty or whitespace-only patch never passes, and a non-empty patch
/// passes only when the external harness says so — harness failures
/// count as failures, keeping the hill-climbing signal monotone.
/// Swap in another implementation to change the policy.
#[async_trait]
pub trait Evaluator: Send + Sync {
    async fn evaluate(&self, task: &Task, patch: &str) -> bool;
}

/// Default evaluator backed by the external benchmark harness.
pub struct HarnessEvaluator {
    /// Harness program and leading arguments.
    pub command: Vec<String>,
    /// Dataset name forwarded to the harness.
    pub dataset: String,
}

impl Default for HarnessEvaluator {
    fn default() -> Self {
        Self {
            command: vec![
                "python".to_string(),
                "-m".to_string(),
                "swebench.harness.run_evaluation".to_string(),
            ],
            dataset: "princeton-nlp/SWE-bench_Verified".to_string(),
        }
    }
}

impl HarnessEvaluator {
    async fn run_harness(&self, task: &Task, patch: &str) -> Result<bool, String> {
        let preds_file = std::env::temp_dir().join(format!("{}.jsonl", make_run_id("score")));
        let record = PredictionRecord {
            instance_id: task.instance_id.clone(),
            model_name_or_path: "tuning".to_string(),
            model_patch: patch.to_string(),
        };
        fsio::append_jsonl(&preds_file, &record).map_err(|e| e.to_string())?;

        let (program, args) = self
            .command
            .split_first()
            .ok_or_else(|| "empty harness command".to_string())?;

        let result = tokio::time::timeout(
            Duration::from_secs(180),
            tokio::process::Command::new(program)
                .args(args)
                .arg("--predictions_path")
                .arg(&preds_file)
                .arg("--swe_bench_tasks")
                .arg(&self.dataset)
                .arg("--log_level")
                .arg("ERROR")
                .arg("--timeout")
                .arg("120")
                .stdin(Stdio::null())
                .output(),
        )
        .await;

        let _ = std::fs::remove_file(&preds_file);

        let output = result
            .map_err(|_| "harness timed out".to_string())?
            .map_err(|e| format!("harness spawn failed: {e}"))?;

        let stdout = String::from_utf8_lossy(&output.stdout);
        if stdout.to_lowercase().contains("resolved") || stdout.contains(&task.instance_id) {
            return Ok(true);
        }
        Ok(output.status.success())
    }
}

#[async_trait]
impl Evaluator for HarnessEvaluator {
    async fn evaluate(&self, task: &Task, patch: &str) -> bool {
        if patch.trim().is_empty() {
            return false;
        }
        match self.run_harness(task, patch).await {
            Ok(passed) => passed,
            Err(err) => {
                warn!(instance_id = %task.instance_id, %err, "harness failed, counting as failure");
                false
            }
        }
    }
}

/// Resumable scorer over an agent driver and an evaluator.
pub struct Scorer {
    driver: Arc<dyn AgentDriver>,
    evaluator: Arc<dyn Evaluator>,
    model: String,
}

impl Scorer {
    /// Create a scorer; `model` is recorded in the predictions log.
    pub fn new(
        driver: Arc<dyn AgentDriver>,
        evaluator: Arc<dyn Evaluator>,
        model: impl Into<String>,
    ) -> Self {
        Self {
            driver,
            evaluator,
            model: model.into(),
        }
    }

    /// Score `guidance` against `tasks`, writing logs under `preds_dir`.
    pub async fn score(
        &self,
        guidance: &Guidance,
        tasks: &[Task],
        preds_dir: &Path,
    ) -> ScoringResult<ScoreResult> {
        std::fs::create_dir_all(preds_dir).map_err(|source| ScoreError::Io {
            path: preds_dir.to_path_buf(),
            source,
        })?;
        let preds_path = preds_dir.join("preds.jsonl");
        let metrics_path = preds_dir.join("instance_metrics.jsonl");
        let traj_dir = preds_dir.join("trajectories");

        let (completed, completed_metrics) = read_completed(&preds_path, &metrics_path)?;

        let guidance_text = guidance.render();
        let guidance_opt = (!guidance_text.is_empty()).then_some(guidance_text.as_str());
        let tag = format!(
            "{}_v{}",
            crate::util::repo_to_dirname(&guidance.repo),
            guidance.version
        );

        let mut resolved = 0;
        let mut total = 0;
        let mut non_empty_patches = 0;
        let mut total_elapsed_s = 0.0;
        let mut token_usage = TokenUsage::default();

        for (i, task) in tasks.iter().enumerate() {
            total += 1;

            let (patch, elapsed_s, usage) = match completed.get(&task.instance_id) {
                Some(patch) => {
                    let prev = completed_metrics.get(&task.instance_id);
                    (
                        patch.clone(),
                        prev.map(|m| m.elapsed_s).unwrap_or(0.0),
                        prev.map(|m| m.token_usage).unwrap_or_default(),
                    )
                }
                None => {
                    let result = self
                        .driver
                        .run(task, guidance_opt, Some(&traj_dir))
                        .await;

                    let pred = PredictionRecord {
                        instance_id: task.instance_id.clone(),
                        model_name_or_path: self.model.clone(),
                        model_patch: result.patch.clone(),
                    };
                    fsio::append_jsonl(&preds_path, &pred).map_err(|source| ScoreError::Io {
                        path: preds_path.clone(),
                        source,
                    })?;

                    let metrics = InstanceMetricsRecord {
                        instance_id: task.instance_id.clone(),
                        elapsed_s: result.elapsed_s(),
                        patch_non_empty: result.patch_non_empty(),
                        token_usage: result.token_usage,
                        status: Some(result.status.to_string()),
                        error: result.error.clone(),
                    };
                    fsio::append_jsonl(&metrics_path, &metrics).map_err(|source| {
                        ScoreError::Io {
                            path: metrics_path.clone(),
                            source,
                        }
                    })?;

                    let elapsed_s = result.elapsed_s();
                    (result.patch, elapsed_s, result.token_usage)
                }
            };

            let passed = self.evaluator.evaluate(task, &patch).await;

            if !patch.trim().is_empty() {
                non_empty_patches += 1;
            }
            total_elapsed_s += elapsed_s;
            token_usage.accumulate(&usage);
            if passed {
                resolved += 1;
            }

            info!(
                %tag,
                progress = %format!("{}/{}", i + 1, tasks.len()),
                instance_id = %task.instance_id,
                passed,
                "scored task"
            );
        }

        let rate = if total == 0 {
            0.0
        } else {
            resolved as f64 / total as f64
        };
        info!(%tag, resolved, total, rate, "candidate scored");

        Ok(ScoreResult {
            rate,
            resolved,
            total,
            non_empty_patches,
            total_elapsed_s,
            token_usage,
            instance_metrics_path: metrics_path,
        })
    }
}

/// Read back the append-only logs of a previous (partial) scoring run.
#[allow(clippy::type_complexity)]
fn read_completed(
    preds_path: &Path,
    metrics_path: &Path,
) -> ScoringResult<(HashMap<String, String>, HashMap<String, InstanceMetricsRecord>)> {
    let mut completed = HashMap::new();
    if preds_path.exists() {
        let records: Vec<PredictionRecord> =
            fsio::read_jsonl(preds_path).map_err(|source| ScoreError::Io {
                path: preds_path.to_path_buf(),
                source,
            })?;
        for record in records {
            completed.insert(record.instance_id.clone(), record.model_patch);
        }
    }

    let mut completed_metrics = HashMap::new();
    if metrics_path.exists() {
        let records: Vec<InstanceMetricsRecord> =
            fsio::read_jsonl(metrics_path).map_err(|source| ScoreError::Io {
                path: metrics_path.to_path_buf(),
                source,
            })?;
        for record in records {
            completed_metrics.insert(record.instance_id.clone(), record);
        }
    }

    Ok((completed, completed_metrics))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_score_result_derived_rates() {
        let result = ScoreResult {
            rate: 0.5,
            resolved: 2,
            total: 4,
            non_empty_patches: 3,
            total_elapsed_s: 8.0,
            token_usage: TokenUsage::default(),
            instance_metrics_path: PathBuf::from("m.jsonl"),
        };
        assert!((result.non_empty_patch_rate() - 0.75).abs() < f64::EPSILON);
        assert!((result.mean_elapsed_s() - 2.0).abs() < f64::EPSILON);
    }

    #[test]
    fn test_zeroed_result_never_wins() {
        let result = ScoreResult::zeroed(PathBuf::from("m.jsonl"));
        assert_eq!(result.rate, 0.0);
        assert_eq!(result.total, 0);
        assert_eq!(result.non_empty_patch_rate(), 0.0);
        assert_eq!(result.mean_elapsed_s(), 0.0);
    }

    #[test]
    fn test_metrics_record_optional_fields_omitted() {
        let record = InstanceMetricsRecord {
            instance_id: "t-1".to_string(),
            elapsed_s: 1.5,
            patch_non_empty: true,
            token_usage: TokenUsage::default(),
            status: None,
            error: None,
        };
        let json = serde_json::to_string(&record).unwrap();
        assert!(!json.contains("status"));
        assert!(!json.contains("error"));

        let with_status = InstanceMetricsRecord {
            status: Some("ok".to_string()),
            ..record
        };
        let json = serde_json::to_string(&with_status).unwrap();
        assert!(json.contains("\"status\":\"ok\""));
    }

    #[test]
    fn test_prediction_record_schema_keys() {
        let record = PredictionRecord {
            instance_id: "t-1".to_string(),
            model_name_or_path: "m".to_string(),
            model_patch: "diff".to_string(),
        };
        let value = serde_json::to_value(&record).unwrap();
        assert!(value.get("instance_id").is_some());
        assert!(value.get("model_name_or_path").is_some());
        assert!(value.get("model_patch").is_some());
    }

    #[tokio::test]
    async fn test_harness_evaluator_rejects_empty_patch() {
        let evaluator = HarnessEvaluator::default();
        let task = Task {
            instance_id: "t-1".to_string(),
            repo: "o/n".to_string(),
            base_commit: "c".to_string(),
            problem_statement: String::new(),
            image_tag: None,
            version: None,
            environment_setup_commit: None,
        };
        assert!(!evaluator.evaluate(&task, "").await);
        assert!(!evaluator.evaluate(&task, "   \n  ").await);
    }
}
