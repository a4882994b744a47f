//! Hill-climbing tuner for per-repo guidance.
//!
//! Outer loop:
//! 1. Initialize G₀ from repo introspection + LLM, score it.
//! 2. For T iterations: propose K incremental candidates of the current
//!    best, score each, adopt on strict improvement.
//! 3. Save the final best to a stable path.
//!
//! The loop is a state machine over [`TuningState`]; every iteration
//! ends with an atomic checkpoint, and a restarted tuner resumes at
//! `completed_iterations + 1`. Partial iterations recover through the
//! scorer's own per-version logs. The proposer and scorer sit behind
//! traits so the machine itself is testable without an LLM or a
//! container daemon.

pub mod state;

use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::checkout::RepoCache;
use crate::datasets::{load_tasks, DatasetError, Task};
use crate::guidance::{initialize_guidance, propose_candidates, Guidance, GuidanceError};
use crate::llm::LlmClient;
use crate::runner::{AgentDriver, TokenUsage};
use crate::scoring::{Evaluator, ScoreError, ScoreResult, Scorer};
use crate::util::fsio;

pub use state::{EventKind, HistoryEvent, StateError, TuningState};

/// Hard cap on tuning iterations.
pub const MAX_TUNING_ITERATIONS: u32 = 20;

/// Result type alias for tuner operations.
pub type TuningResult<T> = Result<T, TuningError>;

/// Fatal tuner errors. Recoverable conditions (proposer noise, a
/// scoring error for one candidate) never surface here — they are
/// logged and absorbed by the loop.
#[derive(Debug, Error)]
pub enum TuningError {
    /// `iterations` exceeds [`MAX_TUNING_ITERATIONS`].
    #[error("iterations={got} exceeds cap {max}")]
    IterationsOverCap { got: u32, max: u32 },

    /// A config knob fails its bound.
    #[error("invalid tuning config: {message}")]
    InvalidConfig { message: String },

    /// The tasks file does not exist.
    #[error("tasks file missing: {path}")]
    TasksFileMissing { path: PathBuf },

    /// State snapshot could not be read or written.
    #[error(transparent)]
    State(#[from] StateError),

    /// Guidance persistence failed.
    #[error(transparent)]
    Guidance(#[from] GuidanceError),

    /// Tasks file failed to load.
    #[error(transparent)]
    Dataset(#[from] DatasetError),

    /// G₀ could not be built or scored — there is no incumbent, the
    /// run cannot begin.
    #[error("guidance initialization failed: {message}")]
    InitFailed { message: String },

    /// Output-directory IO failed.
    #[error("tuner IO error at {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

/// All knobs for one repo's tuning run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TuningConfig {
    pub repo: String,
    pub commit: String,
    /// Path to the per-repo tasks file (JSONL or JSON).
    pub tasks_file: PathBuf,
    pub model: String,

    /// Hill-climbing budget: iterations T.
    pub iterations: u32,
    /// Candidates per iteration K.
    pub candidates_per_iter: usize,
    /// Tasks per scoring pass N.
    pub tasks_per_score: usize,

    /// Guidance character budget.
    pub char_budget: usize,

    /// Per-task agent timeout in seconds.
    pub timeout_s: u64,
    /// Agent step limit.
    pub step_limit: u32,

    /// Root for every artifact of this run.
    pub output_dir: PathBuf,
}

impl TuningConfig {
    /// Check every bound; misconfiguration is fatal.
    pub fn validate(&self) -> TuningResult<()> {
        if self.iterations > MAX_TUNING_ITERATIONS {
            return Err(TuningError::IterationsOverCap {
                got: self.iterations,
                max: MAX_TUNING_ITERATIONS,
            });
        }
        if self.candidates_per_iter == 0 {
            return Err(TuningError::InvalidConfig {
                message: "candidates_per_iter must be > 0".to_string(),
            });
        }
        if self.tasks_per_score == 0 {
            return Err(TuningError::InvalidConfig {
                message: "tasks_per_score must be > 0".to_string(),
            });
        }
        if !self.tasks_file.exists() {
            return Err(TuningError::TasksFileMissing {
                path: self.tasks_file.clone(),
            });
        }
        Ok(())
    }
}

/// Builds and scores G₀ when no usable state exists.
#[async_trait]
pub trait GuidanceInitializer: Send + Sync {
    async fn initialize(
        &self,
        repo: &str,
        commit: &str,
        char_budget: usize,
    ) -> TuningResult<Guidance>;
}

/// Proposes up to K candidates derived from the incumbent.
///
/// A failed proposal round returns an empty vector — the iteration is
/// then recorded as completed with no changes.
#[async_trait]
pub trait Proposer: Send + Sync {
    async fn propose(&self, best: &Guidance, score: f64, history: &[(u64, f64)]) -> Vec<Guidance>;
}

/// Scores one candidate, logging under the given predictions directory.
#[async_trait]
pub trait CandidateScorer: Send + Sync {
    async fn score(&self, guidance: &Guidance, preds_dir: &Path)
        -> Result<ScoreResult, ScoreError>;
}

/// Per-iteration rollup written to `tuning_metrics.json`.
#[derive(Debug, Serialize)]
struct TuningRollup {
    repo: String,
    model: String,
    started_at: String,
    iterations: Vec<IterationEntry>,
}

#[derive(Debug, Serialize)]
struct IterationEntry {
    iteration: u32,
    candidate_index: usize,
    version: u64,
    score: f64,
    resolved: usize,
    total: usize,
    non_empty_patch_rate: f64,
    elapsed_s: f64,
    token_usage: TokenUsage,
    improved_best: bool,
    instance_metrics_path: String,
}

/// The hill-climbing state machine for one repository.
pub struct GuidanceTuner {
    config: TuningConfig,
    initializer: Arc<dyn GuidanceInitializer>,
    proposer: Arc<dyn Proposer>,
    scorer: Arc<dyn CandidateScorer>,
    cancel: CancellationToken,
}

impl GuidanceTuner {
    /// Assemble a tuner from its seams.
    pub fn new(
        config: TuningConfig,
        initializer: Arc<dyn GuidanceInitializer>,
        proposer: Arc<dyn Proposer>,
        scorer: Arc<dyn CandidateScorer>,
    ) -> Self {
        Self {
            config,
            initializer,
            proposer,
            scorer,
            cancel: CancellationToken::new(),
        }
    }

    /// Install a cooperative cancellation token. The tuner checks it
    /// before each iteration; in-flight scoring finishes its current
    /// task and the loop exits at the next checkpoint boundary.
    pub fn with_cancellation(mut self, cancel: CancellationToken) -> Self {
        self.cancel = cancel;
        self
    }

    /// Run the tuning loop to completion (or cancellation) and return
    /// the best guidance found.
    pub async fn run(&self) -> TuningResult<Guidance> {
        self.config.validate()?;

        let out = &self.config.output_dir;
        let versions_dir = out.join("versions");
        std::fs::create_dir_all(&versions_dir).map_err(|source| TuningError::Io {
            path: versions_dir.clone(),
            source,
        })?;
        let state_path = out.join("tuning_state.json");
        let metrics_path = out.join("tuning_metrics.json");

        let (mut state, mut best) = self.load_or_init(&state_path, &versions_dir, out).await?;
        let mut best_score = state.best_score;

        let mut rollup = TuningRollup {
            repo: self.config.repo.clone(),
            model: self.config.model.clone(),
            started_at: Utc::now().to_rfc3339(),
            iterations: Vec::new(),
        };

        let first = state.completed_iterations + 1;
        for iteration in first..=self.config.iterations {
            if self.cancel.is_cancelled() {
                info!(
                    repo = %self.config.repo,
                    iteration,
                    "cancellation requested, stopping before iteration"
                );
                break;
            }

            info!(
                repo = %self.config.repo,
                iteration,
                total = self.config.iterations,
                best_version = best.version,
                best_score,
                "tuning iteration"
            );

            let candidates = self
                .proposer
                .propose(&best, best_score, &state.score_history())
                .await;

            if candidates.is_empty() {
                info!(iteration, "no usable candidates, recording iteration with no changes");
                state.completed_iterations = iteration;
                state.save(&state_path)?;
                continue;
            }

            for (ci, candidate) in candidates.into_iter().enumerate() {
                let version = best.version + ci as u64 + 1;
                let candidate = candidate.with_version(version);

                let preds_dir = out
                    .join("preds")
                    .join(format!("iter{iteration:02}"))
                    .join(format!("c{ci}"));

                let result = match self.scorer.score(&candidate, &preds_dir).await {
                    Ok(result) => result,
                    Err(err) => {
                        // One candidate's scoring error is recoverable:
                        // rate 0 by construction, never adopted.
                        warn!(version, %err, "scoring failed, candidate receives score 0");
                        ScoreResult::zeroed(preds_dir.join("instance_metrics.jsonl"))
                    }
                };

                candidate.save(&versions_dir.join(format!("v{version}.json")))?;

                state.history.push(HistoryEvent {
                    version,
                    score: result.rate,
                    kind: EventKind::Candidate,
                    iteration: Some(iteration),
                    candidate_index: Some(ci),
                    resolved: result.resolved,
                    total: result.total,
                    non_empty_patches: result.non_empty_patches,
                    elapsed_s: result.total_elapsed_s,
                    token_usage: result.token_usage,
                    instance_metrics_path: result.instance_metrics_path.display().to_string(),
                });

                // Strict improvement only; ties keep the incumbent.
                let improved = result.rate > best_score;
                if improved {
                    info!(
                        version,
                        from = best_score,
                        to = result.rate,
                        "candidate adopted as new best"
                    );
                    best = candidate;
                    best_score = result.rate;
                    state.best_version = version;
                    state.best_score = best_score;
                } else {
                    info!(version, score = result.rate, best_score, "candidate not adopted");
                }

                rollup.iterations.push(IterationEntry {
                    iteration,
                    candidate_index: ci,
                    version,
                    score: result.rate,
                    resolved: result.resolved,
                    total: result.total,
                    non_empty_patch_rate: result.non_empty_patch_rate(),
                    elapsed_s: result.total_elapsed_s,
                    token_usage: result.token_usage,
                    improved_best: improved,
                    instance_metrics_path: result.instance_metrics_path.display().to_string(),
                });
            }

            state.completed_iterations = iteration;
            state.save(&state_path)?;
            fsio::write_json_atomic(&metrics_path, &rollup).map_err(|source| TuningError::Io {
                path: metrics_path.clone(),
                source,
            })?;
        }

        best.save(&out.join("best_guidance.json"))?;
        let config_echo = out.join("tuning_config.json");
        fsio::write_json_atomic(&config_echo, &self.config).map_err(|source| TuningError::Io {
            path: config_echo,
            source,
        })?;

        info!(
            repo = %self.config.repo,
            best_version = best.version,
            best_score,
            "tuning complete"
        );
        Ok(best)
    }

    /// Resume from a state snapshot, or build and score G₀.
    async fn load_or_init(
        &self,
        state_path: &Path,
        versions_dir: &Path,
        out: &Path,
    ) -> TuningResult<(TuningState, Guidance)> {
        if state_path.exists() {
            let state = TuningState::load(state_path)?;
            let best_path = versions_dir.join(format!("v{}.json", state.best_version));
            if best_path.exists() {
                let best = Guidance::load(&best_path)?;
                info!(
                    repo = %self.config.repo,
                    best_version = state.best_version,
                    best_score = state.best_score,
                    completed_iterations = state.completed_iterations,
                    "resuming tuning run"
                );
                return Ok((state, best));
            }
            warn!(
                repo = %self.config.repo,
                "state snapshot present but best guidance file missing, reinitializing"
            );
        }

        let g0 = self
            .initializer
            .initialize(&self.config.repo, &self.config.commit, self.config.char_budget)
            .await?;
        g0.save(&versions_dir.join("v0.json"))?;

        info!(
            repo = %self.config.repo,
            chars = g0.char_count(),
            lines = g0.lines.len(),
            "scoring initial guidance"
        );
        let init_preds = out.join("preds").join("iter00").join("c0");
        let result = self
            .scorer
            .score(&g0, &init_preds)
            .await
            .map_err(|err| TuningError::InitFailed {
                message: format!("scoring G0 failed: {err}"),
            })?;

        let mut state = TuningState::new(&self.config.repo);
        state.best_version = g0.version;
        state.best_score = result.rate;
        state.history.push(HistoryEvent {
            version: g0.version,
            score: result.rate,
            kind: EventKind::Init,
            iteration: None,
            candidate_index: None,
            resolved: result.resolved,
            total: result.total,
            non_empty_patches: result.non_empty_patches,
            elapsed_s: result.total_elapsed_s,
            token_usage: result.token_usage,
            instance_metrics_path: result.instance_metrics_path.display().to_string(),
        });
        state.save(state_path)?;

        info!(repo = %self.config.repo, score = result.rate, "initial guidance scored");
        Ok((state, g0))
    }
}

// ---------------------------------------------------------------------------
// Production seam implementations
// ---------------------------------------------------------------------------

/// LLM-backed proposer; a failed round degrades to an empty vector.
pub struct LlmProposer {
    llm: Arc<LlmClient>,
    model: String,
    k: usize,
}

impl LlmProposer {
    pub fn new(llm: Arc<LlmClient>, model: impl Into<String>, k: usize) -> Self {
        Self {
            llm,
            model: model.into(),
            k,
        }
    }
}

#[async_trait]
impl Proposer for LlmProposer {
    async fn propose(&self, best: &Guidance, score: f64, history: &[(u64, f64)]) -> Vec<Guidance> {
        match propose_candidates(&self.llm, best, score, &self.model, self.k, history).await {
            Ok(candidates) => candidates,
            Err(err) => {
                warn!(%err, "proposer call failed, iteration will be skipped");
                Vec::new()
            }
        }
    }
}

/// Scores candidates against a fixed task slice via the C3 scorer.
pub struct TaskScorer {
    scorer: Scorer,
    tasks: Vec<Task>,
}

impl TaskScorer {
    pub fn new(scorer: Scorer, tasks: Vec<Task>) -> Self {
        Self { scorer, tasks }
    }
}

#[async_trait]
impl CandidateScorer for TaskScorer {
    async fn score(
        &self,
        guidance: &Guidance,
        preds_dir: &Path,
    ) -> Result<ScoreResult, ScoreError> {
        self.scorer.score(guidance, &self.tasks, preds_dir).await
    }
}

/// Production initializer: checkout the worktree, introspect, ask the
/// LLM for G₀.
pub struct WorktreeInitializer {
    llm: Arc<LlmClient>,
    model: String,
    cache: RepoCache,
}

impl WorktreeInitializer {
    pub fn new(llm: Arc<LlmClient>, model: impl Into<String>, cache: RepoCache) -> Self {
        Self {
            llm,
            model: model.into(),
            cache,
        }
    }
}

#[async_trait]
impl GuidanceInitializer for WorktreeInitializer {
    async fn initialize(
        &self,
        repo: &str,
        commit: &str,
        char_budget: usize,
    ) -> TuningResult<Guidance> {
        let repo_dir = self
            .cache
            .checkout(repo, commit)
            .await
            .map_err(|err| TuningError::InitFailed {
                message: format!("checkout failed: {err}"),
            })?;
        initialize_guidance(&self.llm, repo, commit, &repo_dir, &self.model, char_budget)
            .await
            .map_err(|err| TuningError::InitFailed {
                message: format!("LLM init failed: {err}"),
            })
    }
}

/// Wire up a production tuner: LLM proposer + worktree initializer +
/// task scorer over the given driver and evaluator.
pub fn production_tuner(
    config: TuningConfig,
    llm: Arc<LlmClient>,
    driver: Arc<dyn AgentDriver>,
    evaluator: Arc<dyn Evaluator>,
    cache_root: &Path,
) -> TuningResult<GuidanceTuner> {
    config.validate()?;
    let tasks = load_tasks(&config.tasks_file, None, Some(config.tasks_per_score))?;

    let scorer = TaskScorer::new(
        Scorer::new(driver, evaluator, config.model.clone()),
        tasks,
    );
    let proposer = LlmProposer::new(llm.clone(), config.model.clone(), config.candidates_per_iter);
    let initializer = WorktreeInitializer::new(llm, config.model.clone(), RepoCache::new(cache_root));

    Ok(GuidanceTuner::new(
        config,
        Arc::new(initializer),
        Arc::new(proposer),
        Arc::new(scorer),
    ))
}
