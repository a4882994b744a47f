//! One scoped agent run per task: container up, agent subprocess,
//! diff extraction, container down.
//!
//! - [`driver`]: the run loop, timeout enforcement, diff-source ladder
//! - [`container`]: image resolution, container lifecycle, diff probe
//! - [`patch`]: diff extraction from text and trajectory artifacts

pub mod container;
pub mod driver;
pub mod patch;

use serde::{Deserialize, Serialize};

pub use container::{
    check_docker_available, reap_orphans, resolve_image, ContainerError, ContainerHandle,
    CONTAINER_NAME_PREFIX,
};
pub use driver::{
    compose_task, AgentDriver, AgentRunResult, AgentRunner, RunStatus, RunnerConfig,
    GUIDANCE_BLOCK_END, GUIDANCE_BLOCK_START,
};
pub use patch::{extract_diff, extract_patch_from_trajectory, MAX_PATCH_SIZE};

/// Token counters for one or more agent runs. Zero when unknown.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TokenUsage {
    pub prompt_tokens: u64,
    pub completion_tokens: u64,
    pub total_tokens: u64,
}

impl TokenUsage {
    /// Accumulate another run's counters into this one.
    pub fn accumulate(&mut self, other: &TokenUsage) {
        self.prompt_tokens += other.prompt_tokens;
        self.completion_tokens += other.completion_tokens;
        self.total_tokens += other.total_tokens;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_token_usage_accumulate() {
        let mut total = TokenUsage::default();
        total.accumulate(&TokenUsage {
            prompt_tokens: 10,
            completion_tokens: 5,
            total_tokens: 15,
        });
        total.accumulate(&TokenUsage {
            prompt_tokens: 1,
            completion_tokens: 2,
            total_tokens: 3,
        });
        assert_eq!(total.prompt_tokens, 11);
        assert_eq!(total.completion_tokens, 7);
        assert_eq!(total.total_tokens, 18);
    }
}
