//! The agent-run driver: one scoped agent invocation per task.
//!
//! The agent runs as an isolated child process (its own process group)
//! so the whole subtree can be killed on timeout without leaving the
//! parent in an unknown state. The child's outcome travels over a
//! one-shot channel; the parent enforces the wall-clock budget.
//!
//! The produced diff is hunted down a fixed ladder, stopping at the
//! first non-empty hit:
//! 1. the structured patch field on the child's return,
//! 2. a regex pass over the child's textual output,
//! 3. a `git diff` probe inside the still-running container (this one
//!    must happen before the container stops, timeout path included),
//! 4. a last-resort scan of the trajectory artifact on disk.

use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::process::Command;
use tokio::sync::oneshot;
use tracing::{debug, info, warn};
use uuid::Uuid;

use super::container::{resolve_image, trajectory_path, ContainerHandle};
use super::patch::{
    extract_diff, extract_patch_from_trajectory, extract_token_usage, MAX_PATCH_SIZE,
};
use super::TokenUsage;
use crate::datasets::Task;

/// Sentinel opening the guidance block in the agent prompt.
pub const GUIDANCE_BLOCK_START: &str = "# REPO GUIDANCE (AUTO-TUNED)";

/// Sentinel closing the guidance block in the agent prompt.
pub const GUIDANCE_BLOCK_END: &str = "# END REPO GUIDANCE";

/// Grace period between SIGTERM and SIGKILL on the timeout path.
const KILL_GRACE: Duration = Duration::from_secs(2);

/// How long to wait for a killed child to surface partial output.
const DRAIN_TIMEOUT: Duration = Duration::from_secs(3);

/// Compose the task text handed to the agent.
///
/// With guidance present the wire format is exactly:
///
/// ```text
/// # REPO GUIDANCE (AUTO-TUNED)
/// <guidance render>
/// # END REPO GUIDANCE
///
/// <problem statement>
/// ```
///
/// Without guidance the problem statement passes through unchanged.
pub fn compose_task(problem_statement: &str, guidance_text: Option<&str>) -> String {
    match guidance_text {
        Some(text) if !text.is_empty() => format!(
            "{GUIDANCE_BLOCK_START}\n{text}\n{GUIDANCE_BLOCK_END}\n\n{problem_statement}"
        ),
        _ => problem_statement.to_string(),
    }
}

/// Terminal status of one agent run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    /// The agent returned within budget.
    Ok,
    /// Wall-clock exceeded; the patch may still be non-empty thanks to
    /// the container probe.
    Timeout,
    /// The agent raised; the container probe was still attempted.
    Error,
    /// The caller requested no real work.
    DryRun,
}

impl std::fmt::Display for RunStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Ok => write!(f, "ok"),
            Self::Timeout => write!(f, "timeout"),
            Self::Error => write!(f, "error"),
            Self::DryRun => write!(f, "dry_run"),
        }
    }
}

/// Outcome of one agent run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentRunResult {
    /// Unified diff, possibly empty, never over [`MAX_PATCH_SIZE`].
    pub patch: String,
    /// Wall-clock duration of the run.
    pub elapsed: Duration,
    /// Terminal status.
    pub status: RunStatus,
    /// Error detail for `error` runs.
    pub error: Option<String>,
    /// Token counters, zero when the trajectory reports none.
    pub token_usage: TokenUsage,
    /// Trajectory artifact location, when the caller asked to keep it.
    pub trajectory_path: Option<PathBuf>,
}

impl AgentRunResult {
    /// Elapsed wall clock in seconds.
    pub fn elapsed_s(&self) -> f64 {
        self.elapsed.as_secs_f64()
    }

    /// Whether the run produced a non-whitespace patch.
    pub fn patch_non_empty(&self) -> bool {
        !self.patch.trim().is_empty()
    }

    fn empty(status: RunStatus, elapsed: Duration, error: Option<String>) -> Self {
        Self {
            patch: String::new(),
            elapsed,
            status,
            error,
            token_usage: TokenUsage::default(),
            trajectory_path: None,
        }
    }
}

/// Settings for the agent-run driver.
#[derive(Debug, Clone)]
pub struct RunnerConfig {
    /// Agent executable invoked per task.
    pub agent_command: String,
    /// Model identifier handed to the agent.
    pub model: String,
    /// Wall-clock budget per run.
    pub timeout: Duration,
    /// Agent step limit.
    pub step_limit: u32,
    /// External image-resolution helper command, if installed.
    pub image_helper: Option<String>,
    /// Benchmark `test_spec` helper command, if installed.
    pub test_spec_helper: Option<String>,
    /// Skip all real work and return `dry_run` results.
    pub dry_run: bool,
}

impl RunnerConfig {
    /// Defaults for a given model: `mini-swe-agent`, 600 s, 30 steps.
    pub fn new(model: impl Into<String>) -> Self {
        Self {
            agent_command: "mini-swe-agent".to_string(),
            model: model.into(),
            timeout: Duration::from_secs(600),
            step_limit: 30,
            image_helper: None,
            test_spec_helper: None,
            dry_run: false,
        }
    }
}

/// Seam between the scorer/orchestrator and the concrete driver.
///
/// Errors never propagate: every failure mode is folded into the
/// returned [`AgentRunResult`] so one bad run can't sink a scoring
/// pass.
#[async_trait]
pub trait AgentDriver: Send + Sync {
    /// Run the agent once for `task`, with optional guidance text
    /// prepended to the problem statement. `traj_dir` names where to
    /// keep the trajectory; `None` uses a temp file that is removed.
    async fn run(
        &self,
        task: &Task,
        guidance_text: Option<&str>,
        traj_dir: Option<&Path>,
    ) -> AgentRunResult;
}

/// Production driver: task container + external agent subprocess.
pub struct AgentRunner {
    config: RunnerConfig,
}

impl AgentRunner {
    /// Create a driver with the given settings.
    pub fn new(config: RunnerConfig) -> Self {
        Self { config }
    }

    async fn run_inner(
        &self,
        task: &Task,
        guidance_text: Option<&str>,
        traj_dir: Option<&Path>,
    ) -> AgentRunResult {
        let started = Instant::now();

        if self.config.dry_run {
            return AgentRunResult::empty(RunStatus::DryRun, started.elapsed(), None);
        }

        // Trajectory location: caller-named artifacts are preserved,
        // temp files are removed during cleanup.
        let (traj_path, traj_is_temp) = match traj_dir {
            Some(dir) => {
                if let Err(err) = std::fs::create_dir_all(dir) {
                    return AgentRunResult::empty(
                        RunStatus::Error,
                        started.elapsed(),
                        Some(format!("cannot create trajectory dir: {err}")),
                    );
                }
                (trajectory_path(dir, &task.instance_id), false)
            }
            None => {
                let nonce = Uuid::new_v4().simple().to_string();
                let name = format!("{}-{}.traj.json", task.instance_id, &nonce[..8]);
                (std::env::temp_dir().join(name), true)
            }
        };

        let image = resolve_image(
            task,
            self.config.image_helper.as_deref(),
            self.config.test_spec_helper.as_deref(),
        )
        .await;

        let mut container = match ContainerHandle::start(&image, &task.instance_id).await {
            Ok(container) => container,
            Err(err) => {
                return AgentRunResult::empty(
                    RunStatus::Error,
                    started.elapsed(),
                    Some(format!("container start failed: {err}")),
                );
            }
        };

        let task_text = compose_task(&task.problem_statement, guidance_text);
        let outcome = self
            .run_agent(&task_text, container.name(), &traj_path)
            .await;

        let (status, error, child) = match outcome {
            AgentOutcome::Finished(child) => (RunStatus::Ok, None, Some(child)),
            AgentOutcome::Failed(message) => {
                warn!(instance_id = %task.instance_id, %message, "agent run failed");
                (RunStatus::Error, Some(message), None)
            }
            AgentOutcome::TimedOut(salvaged) => {
                warn!(
                    instance_id = %task.instance_id,
                    timeout_s = self.config.timeout.as_secs(),
                    "agent run timed out"
                );
                (RunStatus::Timeout, None, salvaged)
            }
        };

        // Diff ladder; the container probe runs before the container
        // stops, on every path.
        let mut patch = child.as_ref().map(patch_from_child).unwrap_or_default();
        if patch.is_empty() {
            if let Some(diff) = container.probe_diff().await {
                patch = diff;
            }
        }
        if patch.is_empty() {
            patch = extract_patch_from_trajectory(&traj_path);
        }
        if patch.len() > MAX_PATCH_SIZE {
            warn!(
                instance_id = %task.instance_id,
                bytes = patch.len(),
                "patch over size limit, rejecting as empty"
            );
            patch.clear();
        }

        container.stop().await;

        let token_usage = extract_token_usage(&traj_path);
        let trajectory = if traj_is_temp {
            let _ = std::fs::remove_file(&traj_path);
            None
        } else {
            Some(traj_path)
        };

        debug!(
            instance_id = %task.instance_id,
            status = %status,
            patch_bytes = patch.len(),
            "agent run finished"
        );

        AgentRunResult {
            patch,
            elapsed: started.elapsed(),
            status,
            error,
            token_usage,
            trajectory_path: trajectory,
        }
    }

    /// Spawn the agent subprocess and wait for its outcome or the
    /// deadline, whichever comes first.
    async fn run_agent(&self, task_text: &str, container_name: &str, traj_path: &Path) -> AgentOutcome {
        let mut cmd = Command::new(&self.config.agent_command);
        cmd.arg("--model")
            .arg(&self.config.model)
            .arg("--task")
            .arg(task_text)
            .arg("--output")
            .arg(traj_path)
            .arg("--container")
            .arg(container_name)
            .arg("--step-limit")
            .arg(self.config.step_limit.to_string())
            .arg("--exit-immediately")
            .arg("--yolo")
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        #[cfg(unix)]
        cmd.process_group(0);

        let child = match cmd.spawn() {
            Ok(child) => child,
            Err(err) => {
                return AgentOutcome::Failed(format!(
                    "failed to spawn agent '{}': {err}",
                    self.config.agent_command
                ))
            }
        };
        let pid = child.id();

        let (tx, mut rx) = oneshot::channel();
        let traj = traj_path.to_path_buf();
        tokio::spawn(async move {
            let outcome = match child.wait_with_output().await {
                Ok(output) => {
                    let stdout = String::from_utf8_lossy(&output.stdout).into_owned();
                    let stderr = String::from_utf8_lossy(&output.stderr).into_owned();
                    let label = if output.status.success() {
                        "submitted".to_string()
                    } else {
                        format!("exit {}", output.status.code().unwrap_or(-1))
                    };
                    Ok(ChildOutcome {
                        patch: structured_patch(&traj),
                        label,
                        stdout: format!("{stdout}{stderr}"),
                    })
                }
                Err(err) => Err(format!("agent wait failed: {err}")),
            };
            let _ = tx.send(outcome);
        });

        tokio::select! {
            received = &mut rx => match received {
                Ok(Ok(child)) => {
                    debug!(label = %child.label, "agent child returned");
                    AgentOutcome::Finished(child)
                }
                Ok(Err(message)) => AgentOutcome::Failed(message),
                Err(_) => AgentOutcome::Failed("agent result channel closed".to_string()),
            },
            _ = tokio::time::sleep(self.config.timeout) => {
                if let Some(pid) = pid {
                    terminate_process_group(pid).await;
                }
                // The killed child may still surface partial output.
                let salvaged = tokio::time::timeout(DRAIN_TIMEOUT, &mut rx)
                    .await
                    .ok()
                    .and_then(Result::ok)
                    .and_then(Result::ok);
                AgentOutcome::TimedOut(salvaged)
            }
        }
    }
}

#[async_trait]
impl AgentDriver for AgentRunner {
    async fn run(
        &self,
        task: &Task,
        guidance_text: Option<&str>,
        traj_dir: Option<&Path>,
    ) -> AgentRunResult {
        info!(
            instance_id = %task.instance_id,
            guided = guidance_text.is_some(),
            "starting agent run"
        );
        self.run_inner(task, guidance_text, traj_dir).await
    }
}

/// What the child delivers over the one-shot channel.
#[derive(Debug)]
struct ChildOutcome {
    /// Structured patch field from the trajectory, if the agent wrote one.
    patch: Option<String>,
    /// Exit label, diagnostic only.
    #[allow(dead_code)]
    label: String,
    /// Captured stdout+stderr for the regex pass.
    stdout: String,
}

/// Outcome of the spawn/join dance, before diff salvage.
#[derive(Debug)]
enum AgentOutcome {
    Finished(ChildOutcome),
    Failed(String),
    TimedOut(Option<ChildOutcome>),
}

/// Ladder steps 1 and 2: structured field first, then the regex pass
/// over the child's textual output.
fn patch_from_child(child: &ChildOutcome) -> String {
    if let Some(patch) = &child.patch {
        if !patch.trim().is_empty() {
            return patch.trim().to_string();
        }
    }
    extract_diff(&child.stdout)
}

/// Top-level `patch`/`model_patch`/`diff` field of the trajectory.
fn structured_patch(traj_path: &Path) -> Option<String> {
    let body = std::fs::read_to_string(traj_path).ok()?;
    let data: serde_json::Value = serde_json::from_str(&body).ok()?;
    for key in ["patch", "model_patch", "diff"] {
        if let Some(patch) = data.get(key).and_then(|v| v.as_str()) {
            if !patch.trim().is_empty() {
                return Some(patch.trim().to_string());
            }
        }
    }
    None
}

/// SIGTERM the child's process group, wait briefly, escalate to
/// SIGKILL. Shells out to kill(1) so the whole subtree goes down.
#[cfg(unix)]
async fn terminate_process_group(pid: u32) {
    let group = format!("-{pid}");
    let _ = Command::new("kill")
        .args(["-TERM", &group])
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .status()
        .await;
    tokio::time::sleep(KILL_GRACE).await;
    let _ = Command::new("kill")
        .args(["-KILL", &group])
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .status()
        .await;
}

#[cfg(not(unix))]
async fn terminate_process_group(_pid: u32) {}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE_DIFF: &str =
        "diff --git a/f.py b/f.py\n--- a/f.py\n+++ b/f.py\n@@ -1 +1 @@\n-old\n+new";

    #[test]
    fn test_compose_task_wire_format() {
        let composed = compose_task("Fix the bug.", Some("- tip one\n- tip two"));
        assert_eq!(
            composed,
            "# REPO GUIDANCE (AUTO-TUNED)\n- tip one\n- tip two\n# END REPO GUIDANCE\n\nFix the bug."
        );
    }

    #[test]
    fn test_compose_task_without_guidance() {
        assert_eq!(compose_task("Fix the bug.", None), "Fix the bug.");
        assert_eq!(compose_task("Fix the bug.", Some("")), "Fix the bug.");
    }

    #[test]
    fn test_patch_from_child_prefers_structured() {
        let child = ChildOutcome {
            patch: Some(SAMPLE_DIFF.to_string()),
            label: "submitted".to_string(),
            stdout: "--- a/other\n+++ b/other\n@@ -1 +1 @@\n-x\n+y".to_string(),
        };
        assert_eq!(patch_from_child(&child), SAMPLE_DIFF);
    }

    #[test]
    fn test_patch_from_child_falls_back_to_stdout() {
        let child = ChildOutcome {
            patch: Some("   ".to_string()),
            label: "submitted".to_string(),
            stdout: format!("agent log\n{SAMPLE_DIFF}"),
        };
        assert_eq!(patch_from_child(&child), SAMPLE_DIFF);
    }

    #[test]
    fn test_patch_from_child_empty_when_no_diff_anywhere() {
        let child = ChildOutcome {
            patch: None,
            label: "exit 1".to_string(),
            stdout: "no diff in sight".to_string(),
        };
        assert_eq!(patch_from_child(&child), "");
    }

    #[test]
    fn test_structured_patch_reads_top_level_only() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("t.traj.json");
        std::fs::write(
            &path,
            serde_json::json!({
                "patch": SAMPLE_DIFF,
                "steps": [{ "output": "ignored here" }]
            })
            .to_string(),
        )
        .unwrap();
        assert_eq!(structured_patch(&path).as_deref(), Some(SAMPLE_DIFF));

        let empty = dir.path().join("e.traj.json");
        std::fs::write(&empty, serde_json::json!({ "patch": " " }).to_string()).unwrap();
        assert_eq!(structured_patch(&empty), None);
    }

    #[test]
    fn test_run_status_serde_and_display() {
        assert_eq!(
            serde_json::to_string(&RunStatus::DryRun).unwrap(),
            "\"dry_run\""
        );
        assert_eq!(RunStatus::Timeout.to_string(), "timeout");
        let back: RunStatus = serde_json::from_str("\"ok\"").unwrap();
        assert_eq!(back, RunStatus::Ok);
    }

    #[tokio::test]
    async fn test_dry_run_skips_all_work() {
        let mut config = RunnerConfig::new("test-model");
        config.dry_run = true;
        // An agent command that cannot exist; dry-run must not touch it.
        config.agent_command = "/definitely/not/a/real/agent".to_string();
        let runner = AgentRunner::new(config);

        let task = Task {
            instance_id: "x__y-1".to_string(),
            repo: "x/y".to_string(),
            base_commit: "c".to_string(),
            problem_statement: "fix".to_string(),
            image_tag: None,
            version: None,
            environment_setup_commit: None,
        };
        let result = runner.run(&task, Some("- tip"), None).await;
        assert_eq!(result.status, RunStatus::DryRun);
        assert!(result.patch.is_empty());
        assert_eq!(result.token_usage, TokenUsage::default());
    }

    #[test]
    fn test_runner_config_defaults() {
        let config = RunnerConfig::new("m");
        assert_eq!(config.agent_command, "mini-swe-agent");
        assert_eq!(config.timeout, Duration::from_secs(600));
        assert_eq!(config.step_limit, 30);
        assert!(!config.dry_run);
    }
}
