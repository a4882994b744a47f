//! The two-phase experiment orchestrator.
//!
//! Phase 1 tunes guidance independently for every configured repo.
//! Phase 2 evaluates the held-out instance set under two conditions:
//! `no_guidance` (issue only) and `tuned_guidance` (issue + tuned
//! block), then asks the external harness for resolve counts and
//! reports the delta.
//!
//! Every phase is resumable: tuning completion per repo and eval
//! completion per `(repo, condition)` live in an atomically-replaced
//! state snapshot; per-instance progress lives in the append-only
//! prediction and metrics logs. A fatal error in one repo's tuning
//! skips that repo — it is recorded incomplete and Phase 2 ignores
//! its instances.

pub mod harness;
pub mod results;

use std::collections::{BTreeMap, HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{error, info, warn};

use crate::datasets::{load_tasks, read_instance_ids, DatasetError, Task};
use crate::guidance::{Guidance, GuidanceError};
use crate::llm::LlmClient;
use crate::runner::{AgentDriver, AgentRunResult, RunStatus, TokenUsage};
use crate::scoring::{Evaluator, PredictionRecord};
use crate::tuner::{production_tuner, TuningConfig};
use crate::util::{fsio, repo_to_dirname};

pub use harness::{CommandHarness, EvalHarness, HarnessError, HarnessOutcome};
pub use results::{classify_failure, compute_rate, load_results, summarize_failure_taxonomy};

/// Result type alias for experiment operations.
pub type ExperimentResult<T> = Result<T, ExperimentError>;

/// Fatal orchestrator errors. Per-repo tuning failures and harness
/// failures are absorbed (skipped repo / unknown rate), not raised.
#[derive(Debug, Error)]
pub enum ExperimentError {
    /// Held-out instances or allow-list failed to load.
    #[error(transparent)]
    Dataset(#[from] DatasetError),

    /// Guidance persistence failed.
    #[error(transparent)]
    Guidance(#[from] GuidanceError),

    /// State or log IO failed.
    #[error("experiment IO error at {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

/// One repo entry of the experiment config.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RepoSpec {
    pub repo: String,
    pub commit: String,
    pub tasks_file: PathBuf,
}

/// Top-level experiment configuration, JSON-loadable.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExperimentConfig {
    pub experiment_id: String,
    pub model: String,
    pub repos: Vec<RepoSpec>,

    // Tuning hyperparameters.
    #[serde(default = "defaults::iterations")]
    pub iterations: u32,
    #[serde(default = "defaults::candidates_per_iter")]
    pub candidates_per_iter: usize,
    #[serde(default = "defaults::tasks_per_score")]
    pub tasks_per_score: usize,
    #[serde(default = "defaults::char_budget")]
    pub char_budget: usize,

    // Runner settings.
    #[serde(default = "defaults::timeout_s")]
    pub timeout_s: u64,
    #[serde(default = "defaults::step_limit")]
    pub step_limit: u32,

    // Eval settings.
    #[serde(default = "defaults::eval_dataset")]
    pub eval_dataset: String,
    #[serde(default = "defaults::eval_split")]
    pub eval_split: String,
    /// Held-out instances, same normalized format as tuning tasks.
    pub eval_tasks_file: PathBuf,
    #[serde(default)]
    pub eval_instance_ids_file: Option<PathBuf>,
    #[serde(default = "defaults::max_workers_eval")]
    pub max_workers_eval: u32,
    /// External harness program plus leading arguments. Recorded with
    /// the rest of the config so a resumed run and the summary it
    /// produces name the same harness.
    #[serde(default = "defaults::harness_command")]
    pub harness_command: Vec<String>,

    /// Root directory for every artifact of this experiment.
    pub output_dir: PathBuf,
}

mod defaults {
    pub fn iterations() -> u32 {
        10
    }
    pub fn candidates_per_iter() -> usize {
        6
    }
    pub fn tasks_per_score() -> usize {
        20
    }
    pub fn char_budget() -> usize {
        crate::guidance::DEFAULT_CHAR_BUDGET
    }
    pub fn timeout_s() -> u64 {
        600
    }
    pub fn step_limit() -> u32 {
        30
    }
    pub fn eval_dataset() -> String {
        "princeton-nlp/SWE-bench_Verified".to_string()
    }
    pub fn eval_split() -> String {
        "test".to_string()
    }
    pub fn max_workers_eval() -> u32 {
        4
    }
    pub fn harness_command() -> Vec<String> {
        vec!["scripts/run_swebench_eval.sh".to_string()]
    }
}

impl ExperimentConfig {
    /// Load a config from a JSON file.
    pub fn load(path: &Path) -> ExperimentResult<Self> {
        let body = std::fs::read_to_string(path).map_err(|source| ExperimentError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        serde_json::from_str(&body).map_err(|source| ExperimentError::Io {
            path: path.to_path_buf(),
            source: std::io::Error::other(source),
        })
    }

    /// Derive the per-repo tuning config.
    fn tuning_config_for(&self, spec: &RepoSpec, output_dir: &Path) -> TuningConfig {
        TuningConfig {
            repo: spec.repo.clone(),
            commit: spec.commit.clone(),
            tasks_file: spec.tasks_file.clone(),
            model: self.model.clone(),
            iterations: self.iterations,
            candidates_per_iter: self.candidates_per_iter,
            tasks_per_score: self.tasks_per_score,
            char_budget: self.char_budget,
            timeout_s: self.timeout_s,
            step_limit: self.step_limit,
            output_dir: output_dir.to_path_buf(),
        }
    }
}

/// The two Phase-2 conditions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Condition {
    NoGuidance,
    TunedGuidance,
}

impl Condition {
    /// Evaluation order: baseline first.
    pub const ALL: [Condition; 2] = [Condition::NoGuidance, Condition::TunedGuidance];

    /// Stable name used in paths, state keys, and the summary.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::NoGuidance => "no_guidance",
            Self::TunedGuidance => "tuned_guidance",
        }
    }
}

/// Persistent experiment state; grows monotonically.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExperimentState {
    pub experiment_id: String,
    pub created_at: String,
    /// Repos whose tuning finished.
    pub tuning_completed: Vec<String>,
    /// `<repo>__<condition>` pairs whose eval finished.
    pub eval_completed: Vec<String>,
}

impl ExperimentState {
    fn new(experiment_id: impl Into<String>) -> Self {
        Self {
            experiment_id: experiment_id.into(),
            created_at: Utc::now().to_rfc3339(),
            tuning_completed: Vec::new(),
            eval_completed: Vec::new(),
        }
    }

    fn save(&self, path: &Path) -> ExperimentResult<()> {
        fsio::write_json_atomic(path, self).map_err(|source| ExperimentError::Io {
            path: path.to_path_buf(),
            source,
        })
    }

    fn load(path: &Path) -> ExperimentResult<Self> {
        fsio::read_json(path).map_err(|source| ExperimentError::Io {
            path: path.to_path_buf(),
            source,
        })
    }

    fn eval_key(repo: &str, condition: Condition) -> String {
        format!("{repo}__{}", condition.as_str())
    }
}

/// One record of `metrics/<condition>_instances.jsonl`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EvalInstanceRecord {
    pub instance_id: String,
    pub repo: String,
    pub condition: String,
    pub elapsed_s: f64,
    pub patch_non_empty: bool,
    pub status: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub token_usage: TokenUsage,
}

/// Patch-generation aggregates for one condition.
#[derive(Debug, Clone, Default, Serialize)]
pub struct GenerationMetrics {
    pub instances_processed: usize,
    pub patch_non_empty: usize,
    pub patch_non_empty_rate: f64,
    pub elapsed_s: f64,
    pub mean_elapsed_s: f64,
    pub token_usage: TokenUsage,
}

impl GenerationMetrics {
    fn absorb(&mut self, record: &EvalInstanceRecord) {
        self.instances_processed += 1;
        if record.patch_non_empty {
            self.patch_non_empty += 1;
        }
        self.elapsed_s += record.elapsed_s;
        self.token_usage.accumulate(&record.token_usage);
    }

    fn finalize(&mut self) {
        if self.instances_processed > 0 {
            self.patch_non_empty_rate = self.patch_non_empty as f64 / self.instances_processed as f64;
            self.mean_elapsed_s = self.elapsed_s / self.instances_processed as f64;
        }
    }
}

/// Per-condition section of the summary. `rate` is absent when the
/// harness failed for the condition.
#[derive(Debug, Clone, Serialize)]
pub struct ConditionReport {
    pub run_id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub resolved: Option<usize>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub total: Option<usize>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub rate: Option<f64>,
    pub preds_path: String,
    pub instance_metrics_path: String,
    pub generation_metrics: GenerationMetrics,
    /// Coarse failure counts from the harness's per-instance records,
    /// absent when the harness only wrote a summary file.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub failure_taxonomy: Option<BTreeMap<String, usize>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// Tuned-vs-baseline difference, present when both conditions scored.
#[derive(Debug, Clone, Serialize)]
pub struct Delta {
    pub absolute: f64,
    pub no_guidance_rate: f64,
    pub tuned_guidance_rate: f64,
}

/// Tuning knobs echoed into the summary.
#[derive(Debug, Clone, Serialize)]
pub struct TuningKnobs {
    pub iterations: u32,
    pub candidates_per_iter: usize,
    pub tasks_per_score: usize,
}

/// Final experiment summary, written to `experiment_summary.json`.
#[derive(Debug, Clone, Serialize)]
pub struct ExperimentSummary {
    pub experiment_id: String,
    pub model: String,
    pub repos: Vec<String>,
    pub tuning_config: TuningKnobs,
    pub eval_results: BTreeMap<String, ConditionReport>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub delta: Option<Delta>,
}

/// Build the summary from per-condition reports. Pure; the delta is
/// `tuned − no_guidance` and appears only when both rates are known.
pub fn build_summary(
    config: &ExperimentConfig,
    eval_results: BTreeMap<String, ConditionReport>,
) -> ExperimentSummary {
    let rate_of = |condition: Condition| {
        eval_results
            .get(condition.as_str())
            .and_then(|report| report.rate)
    };
    let delta = match (rate_of(Condition::NoGuidance), rate_of(Condition::TunedGuidance)) {
        (Some(no_guidance_rate), Some(tuned_guidance_rate)) => Some(Delta {
            absolute: tuned_guidance_rate - no_guidance_rate,
            no_guidance_rate,
            tuned_guidance_rate,
        }),
        _ => None,
    };

    ExperimentSummary {
        experiment_id: config.experiment_id.clone(),
        model: config.model.clone(),
        repos: config.repos.iter().map(|r| r.repo.clone()).collect(),
        tuning_config: TuningKnobs {
            iterations: config.iterations,
            candidates_per_iter: config.candidates_per_iter,
            tasks_per_score: config.tasks_per_score,
        },
        eval_results,
        delta,
    }
}

/// The experiment orchestrator.
pub struct Experiment {
    config: ExperimentConfig,
    llm: Arc<LlmClient>,
    driver: Arc<dyn AgentDriver>,
    evaluator: Arc<dyn Evaluator>,
    harness: Arc<dyn EvalHarness>,
    dry_run: bool,
}

impl Experiment {
    /// Assemble an experiment from its collaborators.
    pub fn new(
        config: ExperimentConfig,
        llm: Arc<LlmClient>,
        driver: Arc<dyn AgentDriver>,
        evaluator: Arc<dyn Evaluator>,
        harness: Arc<dyn EvalHarness>,
    ) -> Self {
        Self {
            config,
            llm,
            driver,
            evaluator,
            harness,
            dry_run: false,
        }
    }

    /// Skip inference: placeholder guidance, empty patches.
    pub fn dry_run(mut self, dry_run: bool) -> Self {
        self.dry_run = dry_run;
        self
    }

    /// Run both phases and write the summary.
    pub async fn run(&self) -> ExperimentResult<ExperimentSummary> {
        let exp_root = self.config.output_dir.clone();
        std::fs::create_dir_all(&exp_root).map_err(|source| ExperimentError::Io {
            path: exp_root.clone(),
            source,
        })?;

        let state_path = exp_root.join("experiment_state.json");
        let mut state = if state_path.exists() {
            ExperimentState::load(&state_path)?
        } else {
            let state = ExperimentState::new(&self.config.experiment_id);
            state.save(&state_path)?;
            state
        };

        let config_path = exp_root.join("experiment_config.json");
        fsio::write_json_atomic(&config_path, &self.config).map_err(|source| {
            ExperimentError::Io {
                path: config_path,
                source,
            }
        })?;

        let guidance_map = self.run_tuning_phase(&exp_root, &state_path, &mut state).await?;
        let eval_results = self
            .run_eval_phase(&exp_root, &state_path, &mut state, &guidance_map)
            .await?;

        let summary = build_summary(&self.config, eval_results);
        let summary_path = exp_root.join("experiment_summary.json");
        fsio::write_json_atomic(&summary_path, &summary).map_err(|source| ExperimentError::Io {
            path: summary_path.clone(),
            source,
        })?;
        info!(path = %summary_path.display(), "experiment summary written");

        Ok(summary)
    }

    /// Phase 1: tune every repo; fatal per-repo errors skip the repo.
    async fn run_tuning_phase(
        &self,
        exp_root: &Path,
        state_path: &Path,
        state: &mut ExperimentState,
    ) -> ExperimentResult<HashMap<String, Guidance>> {
        let mut guidance_map = HashMap::new();

        for spec in &self.config.repos {
            let repo_out = exp_root.join("guidance").join(repo_to_dirname(&spec.repo));
            let best_path = repo_out.join("best_guidance.json");

            if state.tuning_completed.contains(&spec.repo) {
                if best_path.exists() {
                    guidance_map.insert(spec.repo.clone(), Guidance::load(&best_path)?);
                    info!(repo = %spec.repo, "tuning already complete, skipping");
                    continue;
                }
                warn!(repo = %spec.repo, "tuning marked complete but best guidance missing, re-tuning");
            }

            info!(repo = %spec.repo, "tuning guidance");

            if self.dry_run {
                let placeholder = Guidance::new(
                    &spec.repo,
                    &spec.commit,
                    vec!["- (dry run)".to_string()],
                    0,
                    self.config.char_budget,
                );
                placeholder.save(&best_path)?;
                guidance_map.insert(spec.repo.clone(), placeholder);
            } else {
                let tuning_config = self.config.tuning_config_for(spec, &repo_out);
                let cache_root = exp_root.join("cache");
                let tuner = match production_tuner(
                    tuning_config,
                    self.llm.clone(),
                    self.driver.clone(),
                    self.evaluator.clone(),
                    &cache_root,
                ) {
                    Ok(tuner) => tuner,
                    Err(err) => {
                        error!(repo = %spec.repo, %err, "tuner setup failed, repo skipped");
                        continue;
                    }
                };
                match tuner.run().await {
                    Ok(best) => {
                        guidance_map.insert(spec.repo.clone(), best);
                    }
                    Err(err) => {
                        error!(repo = %spec.repo, %err, "tuning failed, repo skipped");
                        continue;
                    }
                }
            }

            state.tuning_completed.push(spec.repo.clone());
            state.save(state_path)?;
        }

        Ok(guidance_map)
    }

    /// Phase 2: evaluate the held-out set under both conditions.
    async fn run_eval_phase(
        &self,
        exp_root: &Path,
        state_path: &Path,
        state: &mut ExperimentState,
        guidance_map: &HashMap<String, Guidance>,
    ) -> ExperimentResult<BTreeMap<String, ConditionReport>> {
        let allow_list = match &self.config.eval_instance_ids_file {
            Some(path) => Some(read_instance_ids(path)?),
            None => None,
        };
        let instances = load_tasks(&self.config.eval_tasks_file, allow_list.as_deref(), None)?;
        info!(count = instances.len(), "held-out instances loaded");

        // Group by repo; Phase 2 runs only for repos whose tuning
        // completed.
        let mut by_repo: BTreeMap<String, Vec<Task>> = BTreeMap::new();
        for instance in instances {
            if state.tuning_completed.contains(&instance.repo) {
                by_repo.entry(instance.repo.clone()).or_default().push(instance);
            }
        }

        let mut eval_results = BTreeMap::new();

        for condition in Condition::ALL {
            let report = self
                .run_condition(exp_root, state_path, state, guidance_map, &by_repo, condition)
                .await?;
            eval_results.insert(condition.as_str().to_string(), report);
        }

        Ok(eval_results)
    }

    async fn run_condition(
        &self,
        exp_root: &Path,
        state_path: &Path,
        state: &mut ExperimentState,
        guidance_map: &HashMap<String, Guidance>,
        by_repo: &BTreeMap<String, Vec<Task>>,
        condition: Condition,
    ) -> ExperimentResult<ConditionReport> {
        let cond_dir = exp_root.join("preds").join(condition.as_str());
        let preds_path = cond_dir.join("preds.jsonl");
        let traj_dir = cond_dir.join("trajectories");
        let metrics_path = exp_root
            .join("metrics")
            .join(format!("{}_instances.jsonl", condition.as_str()));

        // Per-instance resume from the append-only logs.
        let mut completed_ids: HashSet<String> = HashSet::new();
        if preds_path.exists() {
            let records: Vec<PredictionRecord> =
                fsio::read_jsonl(&preds_path).map_err(|source| ExperimentError::Io {
                    path: preds_path.clone(),
                    source,
                })?;
            completed_ids.extend(records.into_iter().map(|r| r.instance_id));
        }
        let mut completed_metrics: HashMap<String, EvalInstanceRecord> = HashMap::new();
        if metrics_path.exists() {
            let records: Vec<EvalInstanceRecord> =
                fsio::read_jsonl(&metrics_path).map_err(|source| ExperimentError::Io {
                    path: metrics_path.clone(),
                    source,
                })?;
            completed_metrics.extend(records.into_iter().map(|r| (r.instance_id.clone(), r)));
        }

        let mut generation = GenerationMetrics::default();
        let total_instances: usize = by_repo.values().map(Vec::len).sum();
        let mut done = 0;

        for (repo, instances) in by_repo {
            let key = ExperimentState::eval_key(repo, condition);
            if state.eval_completed.contains(&key) {
                // Already done in a previous run; fold the recorded
                // metrics into the aggregates.
                for task in instances {
                    if let Some(prev) = completed_metrics.get(&task.instance_id) {
                        generation.absorb(prev);
                    }
                }
                done += instances.len();
                continue;
            }

            let guidance_text = match condition {
                Condition::TunedGuidance => guidance_map.get(repo).map(|g| g.render()),
                Condition::NoGuidance => None,
            };

            for task in instances {
                if completed_ids.contains(&task.instance_id) {
                    if let Some(prev) = completed_metrics.get(&task.instance_id) {
                        generation.absorb(prev);
                    }
                    done += 1;
                    continue;
                }

                let result = if self.dry_run {
                    AgentRunResult {
                        patch: String::new(),
                        elapsed: Duration::ZERO,
                        status: RunStatus::DryRun,
                        error: None,
                        token_usage: TokenUsage::default(),
                        trajectory_path: None,
                    }
                } else {
                    self.driver
                        .run(task, guidance_text.as_deref(), Some(&traj_dir))
                        .await
                };

                let pred = PredictionRecord {
                    instance_id: task.instance_id.clone(),
                    model_name_or_path: self.config.model.clone(),
                    model_patch: result.patch.clone(),
                };
                fsio::append_jsonl(&preds_path, &pred).map_err(|source| ExperimentError::Io {
                    path: preds_path.clone(),
                    source,
                })?;

                let record = EvalInstanceRecord {
                    instance_id: task.instance_id.clone(),
                    repo: repo.clone(),
                    condition: condition.as_str().to_string(),
                    elapsed_s: result.elapsed_s(),
                    patch_non_empty: result.patch_non_empty(),
                    status: result.status.to_string(),
                    error: result.error.clone(),
                    token_usage: result.token_usage,
                };
                fsio::append_jsonl(&metrics_path, &record).map_err(|source| {
                    ExperimentError::Io {
                        path: metrics_path.clone(),
                        source,
                    }
                })?;
                generation.absorb(&record);

                done += 1;
                info!(
                    condition = condition.as_str(),
                    progress = %format!("{done}/{total_instances}"),
                    instance_id = %task.instance_id,
                    patch_non_empty = record.patch_non_empty,
                    "eval instance finished"
                );
            }

            state.eval_completed.push(key);
            state.save(state_path)?;
        }

        generation.finalize();

        // Hand the condition's prediction log to the external harness.
        let run_id = format!("{}__{}", self.config.experiment_id, condition.as_str());
        let (resolved, total, rate, failure_taxonomy, harness_error) = match self
            .harness
            .evaluate(
                &self.config.eval_dataset,
                &preds_path,
                &run_id,
                self.config.max_workers_eval,
            )
            .await
        {
            Ok(outcome) => (
                Some(outcome.resolved),
                Some(outcome.total),
                Some(compute_rate(outcome.resolved, outcome.total)),
                outcome.failure_taxonomy,
                None,
            ),
            Err(err) => {
                warn!(condition = condition.as_str(), %err, "harness failed, rate unknown");
                (None, None, None, None, Some(err.to_string()))
            }
        };

        Ok(ConditionReport {
            run_id,
            resolved,
            total,
            rate,
            preds_path: preds_path.display().to_string(),
            instance_metrics_path: metrics_path.display().to_string(),
            generation_metrics: generation,
            failure_taxonomy,
            error: harness_error,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_config() -> ExperimentConfig {
        ExperimentConfig {
            experiment_id: "exp-1".to_string(),
            model: "m".to_string(),
            repos: vec![
                RepoSpec {
                    repo: "a/a".to_string(),
                    commit: "c1".to_string(),
                    tasks_file: PathBuf::from("a.jsonl"),
                },
                RepoSpec {
                    repo: "b/b".to_string(),
                    commit: "c2".to_string(),
                    tasks_file: PathBuf::from("b.jsonl"),
                },
            ],
            iterations: 10,
            candidates_per_iter: 6,
            tasks_per_score: 20,
            char_budget: 3200,
            timeout_s: 600,
            step_limit: 30,
            eval_dataset: "dataset".to_string(),
            eval_split: "test".to_string(),
            eval_tasks_file: PathBuf::from("eval.jsonl"),
            eval_instance_ids_file: None,
            max_workers_eval: 4,
            harness_command: vec!["scripts/run_swebench_eval.sh".to_string()],
            output_dir: PathBuf::from("out"),
        }
    }

    fn report(rate: Option<f64>, resolved: Option<usize>, total: Option<usize>) -> ConditionReport {
        ConditionReport {
            run_id: "run".to_string(),
            resolved,
            total,
            rate,
            preds_path: "p".to_string(),
            instance_metrics_path: "m".to_string(),
            generation_metrics: GenerationMetrics::default(),
            failure_taxonomy: None,
            error: rate.is_none().then(|| "harness failed".to_string()),
        }
    }

    #[test]
    fn test_summary_delta_both_conditions() {
        let mut results = BTreeMap::new();
        results.insert(
            "no_guidance".to_string(),
            report(Some(0.5), Some(10), Some(20)),
        );
        results.insert(
            "tuned_guidance".to_string(),
            report(Some(0.7), Some(14), Some(20)),
        );

        let summary = build_summary(&test_config(), results);
        let delta = summary.delta.expect("delta present");
        assert!((delta.absolute - 0.2).abs() < 1e-12);
        assert!((delta.no_guidance_rate - 0.5).abs() < f64::EPSILON);
        assert!((delta.tuned_guidance_rate - 0.7).abs() < f64::EPSILON);
    }

    #[test]
    fn test_summary_delta_absent_on_harness_failure() {
        let mut results = BTreeMap::new();
        results.insert(
            "no_guidance".to_string(),
            report(Some(0.5), Some(10), Some(20)),
        );
        results.insert("tuned_guidance".to_string(), report(None, None, None));

        let summary = build_summary(&test_config(), results);
        assert!(summary.delta.is_none());
        assert!(summary.eval_results["tuned_guidance"].error.is_some());
    }

    #[test]
    fn test_condition_names() {
        assert_eq!(Condition::NoGuidance.as_str(), "no_guidance");
        assert_eq!(Condition::TunedGuidance.as_str(), "tuned_guidance");
        assert_eq!(
            ExperimentState::eval_key("o/n", Condition::TunedGuidance),
            "o/n__tuned_guidance"
        );
    }

    #[test]
    fn test_generation_metrics_finalize() {
        let mut metrics = GenerationMetrics::default();
        for non_empty in [true, true, false, true] {
            metrics.absorb(&EvalInstanceRecord {
                instance_id: "i".to_string(),
                repo: "r".to_string(),
                condition: "no_guidance".to_string(),
                elapsed_s: 2.0,
                patch_non_empty: non_empty,
                status: "ok".to_string(),
                error: None,
                token_usage: TokenUsage {
                    prompt_tokens: 100,
                    completion_tokens: 10,
                    total_tokens: 110,
                },
            });
        }
        metrics.finalize();
        assert_eq!(metrics.instances_processed, 4);
        assert!((metrics.patch_non_empty_rate - 0.75).abs() < f64::EPSILON);
        assert!((metrics.mean_elapsed_s - 2.0).abs() < f64::EPSILON);
        assert_eq!(metrics.token_usage.total_tokens, 440);
    }

    #[test]
    fn test_config_defaults_from_minimal_json() {
        let json = r#"{
            "experiment_id": "exp",
            "model": "m",
            "repos": [],
            "eval_tasks_file": "eval.jsonl",
            "output_dir": "out"
        }"#;
        let config: ExperimentConfig = serde_json::from_str(json).unwrap();
        assert_eq!(config.iterations, 10);
        assert_eq!(config.candidates_per_iter, 6);
        assert_eq!(config.tasks_per_score, 20);
        assert_eq!(config.char_budget, 3200);
        assert_eq!(config.max_workers_eval, 4);
        assert_eq!(config.eval_split, "test");
        assert_eq!(
            config.harness_command,
            vec!["scripts/run_swebench_eval.sh".to_string()]
        );
    }

    #[test]
    fn test_summary_serialization_shape() {
        let mut results = BTreeMap::new();
        results.insert(
            "no_guidance".to_string(),
            report(Some(0.25), Some(5), Some(20)),
        );
        results.insert(
            "tuned_guidance".to_string(),
            report(Some(0.45), Some(9), Some(20)),
        );
        let summary = build_summary(&test_config(), results);
        let value = serde_json::to_value(&summary).unwrap();
        assert_eq!(value["experiment_id"], "exp-1");
        assert!((value["delta"]["absolute"].as_f64().unwrap() - 0.2).abs() < 1e-12);
        assert!(value["eval_results"]["no_guidance"]["rate"].is_number());
        assert_eq!(value["tuning_config"]["iterations"], 10);
    }

    #[test]
    fn test_failure_taxonomy_serialized_when_present() {
        let mut with_taxonomy = report(Some(0.5), Some(1), Some(2));
        let mut counts = BTreeMap::new();
        counts.insert("resolved".to_string(), 1);
        counts.insert("test_failure".to_string(), 1);
        with_taxonomy.failure_taxonomy = Some(counts);

        let value = serde_json::to_value(&with_taxonomy).unwrap();
        assert_eq!(value["failure_taxonomy"]["test_failure"], 1);

        // Absent taxonomy is omitted from the JSON entirely.
        let value = serde_json::to_value(report(Some(0.5), Some(1), Some(2))).unwrap();
        assert!(value.get("failure_taxonomy").is_none());
    }
}
