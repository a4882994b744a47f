//! Task container lifecycle and diff probing.
//!
//! Each agent run gets one container started from the task's image and
//! kept alive through the agent's tool calls. Names are namespaced with
//! a known prefix so orphans left by crashed runs can be listed and
//! stopped safely. Stopping is idempotent; a `Drop` fallback covers
//! panic/unwind paths.

use std::path::PathBuf;
use std::process::Stdio;
use std::time::Duration;

use thiserror::Error;
use tokio::process::Command;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::datasets::Task;

/// Prefix applied to every container this driver starts.
pub const CONTAINER_NAME_PREFIX: &str = "minisweagent-";

/// Conventional working directories probed for a `git diff`.
const PROBE_WORKDIRS: &[&str] = &["/testbed", "/workspace", "/repo"];

/// Timeout for a single docker CLI invocation.
const DOCKER_TIMEOUT: Duration = Duration::from_secs(60);

/// Result type alias for container operations.
pub type ContainerResult<T> = Result<T, ContainerError>;

/// Error from the container runtime.
#[derive(Debug, Error)]
pub enum ContainerError {
    /// The docker CLI could not be spawned.
    #[error("docker not available: {0}")]
    Unavailable(String),

    /// A docker command exited non-zero.
    #[error("docker {operation} failed: {stderr}")]
    Docker { operation: String, stderr: String },

    /// A docker command exceeded its timeout.
    #[error("docker {operation} timed out")]
    Timeout { operation: String },
}

/// Verify the docker daemon is running and reachable.
pub async fn check_docker_available() -> ContainerResult<()> {
    run_docker(&["info"]).await.map(|_| ())
}

/// Resolve the container image for a task.
///
/// Consults, in order: an external helper command, a benchmark
/// `test_spec` helper command, the task's explicit `image_tag`, the
/// local image inventory filtered by the task's short id, and finally a
/// hard-coded naming convention. The first success wins.
pub async fn resolve_image(
    task: &Task,
    image_helper: Option<&str>,
    test_spec_helper: Option<&str>,
) -> String {
    for helper in [image_helper, test_spec_helper].into_iter().flatten() {
        match run_helper(helper, &task.instance_id).await {
            Some(image) => {
                debug!(helper, %image, "image resolved by helper");
                return image;
            }
            None => warn!(helper, instance_id = %task.instance_id, "image helper produced nothing"),
        }
    }

    if let Some(image) = &task.image_tag {
        debug!(%image, "image taken from task field");
        return image.clone();
    }

    if let Some(image) = query_local_images(&task.instance_id).await {
        debug!(%image, "image found in local inventory");
        return image;
    }

    let image = fallback_image(&task.instance_id);
    debug!(%image, "falling back to naming convention");
    image
}

/// The short id used to filter the local image inventory: everything
/// after the last `__` (e.g. `django-10097` for
/// `django__django-10097`).
pub fn short_instance_id(instance_id: &str) -> &str {
    instance_id
        .rsplit_once("__")
        .map(|(_, short)| short)
        .unwrap_or(instance_id)
}

/// Hard-coded benchmark naming convention, the last resort.
pub fn fallback_image(instance_id: &str) -> String {
    format!("swebench/sweb.eval.x86_64.{instance_id}:latest")
}

async fn run_helper(helper: &str, instance_id: &str) -> Option<String> {
    let output = tokio::time::timeout(
        DOCKER_TIMEOUT,
        Command::new(helper)
            .arg(instance_id)
            .stdin(Stdio::null())
            .output(),
    )
    .await
    .ok()?
    .ok()?;

    if !output.status.success() {
        return None;
    }
    let image = String::from_utf8_lossy(&output.stdout).trim().to_string();
    (!image.is_empty()).then_some(image)
}

async fn query_local_images(instance_id: &str) -> Option<String> {
    let listing = run_docker(&["images", "--format", "{{.Repository}}:{{.Tag}}"])
        .await
        .ok()?;
    let short = short_instance_id(instance_id);
    listing
        .lines()
        .find(|line| line.contains(short) && line.contains("sweb.eval"))
        .map(|line| line.trim().to_string())
}

/// A running task container, stopped on every exit path.
#[derive(Debug)]
pub struct ContainerHandle {
    name: String,
    stopped: bool,
}

impl ContainerHandle {
    /// Start a container from `image`, kept alive until [`stop`].
    ///
    /// [`stop`]: ContainerHandle::stop
    pub async fn start(image: &str, instance_id: &str) -> ContainerResult<Self> {
        let name = container_name(instance_id);
        run_docker(&[
            "run",
            "-d",
            "--name",
            &name,
            image,
            "tail",
            "-f",
            "/dev/null",
        ])
        .await?;
        debug!(container = %name, image, "container started");
        Ok(Self {
            name,
            stopped: false,
        })
    }

    /// The container's name, passed to the agent subprocess.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Probe the container for uncommitted changes.
    ///
    /// Runs `git diff` then `git diff HEAD` inside each conventional
    /// working directory; the first non-empty output wins. Must be
    /// called before [`stop`] — including on the timeout path.
    ///
    /// [`stop`]: ContainerHandle::stop
    pub async fn probe_diff(&self) -> Option<String> {
        if self.stopped {
            return None;
        }
        for workdir in PROBE_WORKDIRS {
            for git_cmd in ["git diff", "git diff HEAD"] {
                let script = format!("cd {workdir} 2>/dev/null && {git_cmd}");
                match run_docker(&["exec", &self.name, "sh", "-c", &script]).await {
                    Ok(diff) if !diff.trim().is_empty() => {
                        debug!(container = %self.name, workdir, git_cmd, "container diff salvaged");
                        return Some(diff.trim().to_string());
                    }
                    _ => {}
                }
            }
        }
        None
    }

    /// Stop and remove the container. Safe to call repeatedly.
    pub async fn stop(&mut self) {
        if self.stopped {
            return;
        }
        self.stopped = true;
        if let Err(err) = run_docker(&["rm", "-f", &self.name]).await {
            warn!(container = %self.name, %err, "container removal failed");
        }
    }
}

impl Drop for ContainerHandle {
    fn drop(&mut self) {
        if !self.stopped {
            // Unwind path: best-effort synchronous removal.
            let _ = std::process::Command::new("docker")
                .args(["rm", "-f", &self.name])
                .stdout(Stdio::null())
                .stderr(Stdio::null())
                .status();
        }
    }
}

/// Stop every container carrying the driver's name prefix.
///
/// Returns the number of containers removed.
pub async fn reap_orphans() -> ContainerResult<usize> {
    let listing = run_docker(&[
        "ps",
        "-a",
        "--filter",
        &format!("name={CONTAINER_NAME_PREFIX}"),
        "--format",
        "{{.Names}}",
    ])
    .await?;

    let mut reaped = 0;
    for name in listing.lines().map(str::trim).filter(|n| !n.is_empty()) {
        match run_docker(&["rm", "-f", name]).await {
            Ok(_) => {
                debug!(container = name, "orphan container removed");
                reaped += 1;
            }
            Err(err) => warn!(container = name, %err, "failed to remove orphan"),
        }
    }
    Ok(reaped)
}

fn container_name(instance_id: &str) -> String {
    let sanitized: String = instance_id
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() || c == '-' || c == '_' { c } else { '-' })
        .collect();
    let nonce = Uuid::new_v4().simple().to_string();
    format!("{CONTAINER_NAME_PREFIX}{sanitized}-{}", &nonce[..8])
}

async fn run_docker(args: &[&str]) -> ContainerResult<String> {
    let operation = args.first().copied().unwrap_or("docker").to_string();
    let result = tokio::time::timeout(
        DOCKER_TIMEOUT,
        Command::new("docker")
            .args(args)
            .stdin(Stdio::null())
            .output(),
    )
    .await
    .map_err(|_| ContainerError::Timeout {
        operation: operation.clone(),
    })?;

    let output = result.map_err(|e| ContainerError::Unavailable(e.to_string()))?;
    if !output.status.success() {
        return Err(ContainerError::Docker {
            operation,
            stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
        });
    }
    Ok(String::from_utf8_lossy(&output.stdout).to_string())
}

/// Path under `dir` for a trajectory artifact of one instance.
pub fn trajectory_path(dir: &std::path::Path, instance_id: &str) -> PathBuf {
    dir.join(format!("{instance_id}.traj.json"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_short_instance_id() {
        assert_eq!(short_instance_id("django__django-10097"), "django-10097");
        assert_eq!(short_instance_id("plain-id"), "plain-id");
        assert_eq!(short_instance_id("a__b__c"), "c");
    }

    #[test]
    fn test_fallback_image_convention() {
        assert_eq!(
            fallback_image("django__django-10097"),
            "swebench/sweb.eval.x86_64.django__django-10097:latest"
        );
    }

    #[test]
    fn test_container_name_prefix_and_sanitization() {
        let name = container_name("owner__repo-123");
        assert!(name.starts_with(CONTAINER_NAME_PREFIX));
        assert!(name.contains("owner__repo-123"));

        let odd = container_name("weird/id with:chars");
        assert!(odd.starts_with(CONTAINER_NAME_PREFIX));
        assert!(!odd.contains('/'));
        assert!(!odd.contains(' '));
        assert!(!odd.contains(':'));
    }

    #[test]
    fn test_container_names_are_unique() {
        assert_ne!(container_name("same"), container_name("same"));
    }

    #[test]
    fn test_trajectory_path() {
        let p = trajectory_path(std::path::Path::new("/tmp/trajs"), "x__y-1");
        assert_eq!(p, PathBuf::from("/tmp/trajs/x__y-1.traj.json"));
    }

    #[tokio::test]
    async fn test_resolve_image_prefers_task_field_without_helpers() {
        let task = Task {
            instance_id: "x__y-1".to_string(),
            repo: "x/y".to_string(),
            base_commit: "c".to_string(),
            problem_statement: String::new(),
            image_tag: Some("custom/image:tag".to_string()),
            version: None,
            environment_setup_commit: None,
        };
        // No helpers configured: the explicit tag wins before any
        // docker query happens.
        assert_eq!(resolve_image(&task, None, None).await, "custom/image:tag");
    }

    #[tokio::test]
    async fn test_resolve_image_helper_overrides_task_field() {
        let task = Task {
            instance_id: "x__y-1".to_string(),
            repo: "x/y".to_string(),
            base_commit: "c".to_string(),
            problem_statement: String::new(),
            image_tag: Some("custom/image:tag".to_string()),
            version: None,
            environment_setup_commit: None,
        };
        // `echo` as helper prints its argument: helper output wins.
        let image = resolve_image(&task, Some("echo"), None).await;
        assert_eq!(image, "x__y-1");
    }
}
