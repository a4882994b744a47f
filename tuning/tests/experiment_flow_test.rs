//! Experiment orchestration integration tests (dry-run inference,
//! stubbed harness): two-condition evaluation, per-condition logs,
//! summary delta, and resume markers.

use std::collections::{BTreeMap, HashMap};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use tempfile::tempdir;

use tuning::datasets::Task;
use tuning::experiment::{
    EvalHarness, Experiment, ExperimentConfig, HarnessError, HarnessOutcome, RepoSpec,
};
use tuning::llm::LlmClient;
use tuning::runner::{AgentDriver, AgentRunResult};
use tuning::scoring::{Evaluator, HarnessEvaluator, PredictionRecord};
use tuning::util::fsio;

struct StubHarness {
    by_run_id: HashMap<String, (usize, usize)>,
    calls: Mutex<Vec<String>>,
}

#[async_trait]
impl EvalHarness for StubHarness {
    async fn evaluate(
        &self,
        _dataset: &str,
        _predictions_path: &Path,
        run_id: &str,
        _workers: u32,
    ) -> Result<HarnessOutcome, HarnessError> {
        self.calls.lock().unwrap().push(run_id.to_string());
        match self.by_run_id.get(run_id) {
            Some(&(resolved, total)) => {
                let mut taxonomy = BTreeMap::new();
                taxonomy.insert("resolved".to_string(), resolved);
                taxonomy.insert("unresolved_unknown".to_string(), total - resolved);
                Ok(HarnessOutcome {
                    resolved,
                    total,
                    failure_taxonomy: Some(taxonomy),
                })
            }
            None => Err(HarnessError::NoResults(PathBuf::from(run_id))),
        }
    }
}

/// Never invoked under dry-run; panics if it is.
struct UnreachableDriver;

#[async_trait]
impl AgentDriver for UnreachableDriver {
    async fn run(
        &self,
        _task: &Task,
        _guidance_text: Option<&str>,
        _traj_dir: Option<&Path>,
    ) -> AgentRunResult {
        panic!("driver must not run in dry-run mode");
    }
}

fn write_eval_tasks(dir: &Path) -> PathBuf {
    let path = dir.join("eval_tasks.jsonl");
    let mut body = String::new();
    for repo in ["a/a", "b/b"] {
        for i in 1..=2 {
            let id = format!("{}-{i}", repo.replace('/', "__"));
            body.push_str(&format!(
                "{{\"instance_id\": \"{id}\", \"repo\": \"{repo}\", \"base_commit\": \"c\", \"problem_statement\": \"fix\"}}\n"
            ));
        }
    }
    std::fs::write(&path, body).unwrap();
    path
}

fn experiment_config(dir: &Path) -> ExperimentConfig {
    ExperimentConfig {
        experiment_id: "exp-1".to_string(),
        model: "test-model".to_string(),
        repos: vec![
            RepoSpec {
                repo: "a/a".to_string(),
                commit: "c1".to_string(),
                tasks_file: dir.join("unused.jsonl"),
            },
            RepoSpec {
                repo: "b/b".to_string(),
                commit: "c2".to_string(),
                tasks_file: dir.join("unused.jsonl"),
            },
        ],
        iterations: 1,
        candidates_per_iter: 1,
        tasks_per_score: 1,
        char_budget: 3200,
        timeout_s: 60,
        step_limit: 10,
        eval_dataset: "dataset".to_string(),
        eval_split: "test".to_string(),
        eval_tasks_file: write_eval_tasks(dir),
        eval_instance_ids_file: None,
        max_workers_eval: 2,
        harness_command: vec!["true".to_string()],
        output_dir: dir.join("exp"),
    }
}

fn harness_for(config: &ExperimentConfig) -> StubHarness {
    let mut by_run_id = HashMap::new();
    by_run_id.insert(format!("{}__no_guidance", config.experiment_id), (10, 20));
    by_run_id.insert(format!("{}__tuned_guidance", config.experiment_id), (14, 20));
    StubHarness {
        by_run_id,
        calls: Mutex::new(Vec::new()),
    }
}

fn build_experiment(config: ExperimentConfig, harness: Arc<StubHarness>) -> Experiment {
    let llm = Arc::new(LlmClient::new("http://localhost:9", "EMPTY").unwrap());
    let evaluator: Arc<dyn Evaluator> = Arc::new(HarnessEvaluator::default());
    Experiment::new(config, llm, Arc::new(UnreachableDriver), evaluator, harness).dry_run(true)
}

#[tokio::test]
async fn test_dry_run_experiment_end_to_end() {
    let dir = tempdir().unwrap();
    let config = experiment_config(dir.path());
    let out = config.output_dir.clone();
    let harness = Arc::new(harness_for(&config));

    let summary = build_experiment(config, harness.clone()).run().await.unwrap();

    // Both conditions evaluated, baseline first.
    assert_eq!(
        harness.calls.lock().unwrap().clone(),
        vec![
            "exp-1__no_guidance".to_string(),
            "exp-1__tuned_guidance".to_string()
        ]
    );

    // Delta: 14/20 − 10/20 = 0.20 to float precision.
    let delta = summary.delta.expect("delta present");
    assert!((delta.absolute - 0.20).abs() < 1e-12);
    assert!((delta.no_guidance_rate - 0.5).abs() < f64::EPSILON);
    assert!((delta.tuned_guidance_rate - 0.7).abs() < f64::EPSILON);

    // The harness's failure taxonomy lands on each condition report.
    let taxonomy = summary.eval_results["no_guidance"]
        .failure_taxonomy
        .as_ref()
        .expect("taxonomy present");
    assert_eq!(taxonomy["resolved"], 10);
    assert_eq!(taxonomy["unresolved_unknown"], 10);

    // Per-condition prediction logs: 4 instances each, empty patches.
    for condition in ["no_guidance", "tuned_guidance"] {
        let preds: Vec<PredictionRecord> =
            fsio::read_jsonl(&out.join("preds").join(condition).join("preds.jsonl")).unwrap();
        assert_eq!(preds.len(), 4);
        assert!(preds.iter().all(|p| p.model_patch.is_empty()));

        let metrics: Vec<serde_json::Value> = fsio::read_jsonl(
            &out.join("metrics")
                .join(format!("{condition}_instances.jsonl")),
        )
        .unwrap();
        assert_eq!(metrics.len(), 4);
        assert!(metrics.iter().all(|m| m["status"] == "dry_run"));
    }

    // Placeholder tuned guidance exists per repo.
    assert!(out.join("guidance/a__a/best_guidance.json").exists());
    assert!(out.join("guidance/b__b/best_guidance.json").exists());

    // State and summary artifacts.
    let state: serde_json::Value = fsio::read_json(&out.join("experiment_state.json")).unwrap();
    let tuned: Vec<String> = state["tuning_completed"]
        .as_array()
        .unwrap()
        .iter()
        .map(|v| v.as_str().unwrap().to_string())
        .collect();
    assert_eq!(tuned, vec!["a/a".to_string(), "b/b".to_string()]);
    assert_eq!(state["eval_completed"].as_array().unwrap().len(), 4);
    assert!(out.join("experiment_summary.json").exists());
    assert!(out.join("experiment_config.json").exists());
}

#[tokio::test]
async fn test_experiment_resume_does_not_duplicate_work() {
    let dir = tempdir().unwrap();
    let config = experiment_config(dir.path());
    let out = config.output_dir.clone();

    let first = Arc::new(harness_for(&config));
    build_experiment(config.clone(), first).run().await.unwrap();

    let preds_before = std::fs::read_to_string(out.join("preds/no_guidance/preds.jsonl")).unwrap();
    let state_before = std::fs::read_to_string(out.join("experiment_state.json")).unwrap();

    // Second run over the same tree: instances are skipped via the
    // completion markers, logs stay byte-identical, markers are not
    // duplicated. The harness still re-runs per condition.
    let second = Arc::new(harness_for(&config));
    let summary = build_experiment(config, second.clone()).run().await.unwrap();
    assert_eq!(second.calls.lock().unwrap().len(), 2);

    let preds_after = std::fs::read_to_string(out.join("preds/no_guidance/preds.jsonl")).unwrap();
    assert_eq!(preds_before, preds_after);
    let state_after = std::fs::read_to_string(out.join("experiment_state.json")).unwrap();
    assert_eq!(state_before, state_after);

    // Aggregates survive the resume path via the recorded metrics.
    let report = &summary.eval_results["no_guidance"];
    assert_eq!(report.generation_metrics.instances_processed, 4);
}

#[tokio::test]
async fn test_harness_failure_marks_rate_unknown() {
    let dir = tempdir().unwrap();
    let config = experiment_config(dir.path());

    // Harness only knows the baseline run id.
    let mut by_run_id = HashMap::new();
    by_run_id.insert("exp-1__no_guidance".to_string(), (10, 20));
    let harness = Arc::new(StubHarness {
        by_run_id,
        calls: Mutex::new(Vec::new()),
    });

    let summary = build_experiment(config, harness).run().await.unwrap();

    assert!(summary.eval_results["no_guidance"].rate.is_some());
    let tuned = &summary.eval_results["tuned_guidance"];
    assert!(tuned.rate.is_none());
    assert!(tuned.error.is_some());
    // With one rate unknown there is no delta.
    assert!(summary.delta.is_none());
}
