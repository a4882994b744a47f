//! Initialize guidance G₀ for a repository.
//!
//! The initializer asks the model for a concise, actionable guidance
//! block grounded in the repository's structure, then runs the result
//! through budget truncation and validation.

use std::path::Path;

use tracing::warn;

use super::gating::{truncate_to_budget, validate_guidance};
use super::repo_info::build_repo_info_block;
use super::schema::Guidance;
use crate::llm::{ChatMessage, ChatParams, LlmClient, LlmResult};

const INIT_SYSTEM: &str = "\
You are an expert software-engineering assistant.
Your job is to produce a concise GUIDANCE BLOCK that will be prepended to
every issue a coding agent sees when working on a specific open-source
repository. The guidance should help the agent produce correct patches
more often.

Rules for the guidance block:
- Maximum {char_budget} characters (hard limit).
- Focus on ACTIONABLE tips: where key modules live, naming conventions,
  test patterns, common pitfalls, import style.
- Do NOT repeat information already visible in the directory tree
  (the agent always sees the tree separately).
- Do NOT include generic advice. Be repo-specific.
- Write in terse bullet-point style. No headings, no markdown fences.
- Every line should start with \"- \".
- Output ONLY the guidance lines. No preamble, no closing remarks.";

const INIT_USER: &str = "\
Repository: {repo}
Commit: {commit}

{repo_info}

Write the guidance block now (max {char_budget} chars).";

/// Create the initial guidance G₀ for a repository.
///
/// `repo_dir` is the checked-out worktree at `commit`; its structure
/// seeds the prompt. The result is version 0, truncated to the budget.
pub async fn initialize_guidance(
    llm: &LlmClient,
    repo: &str,
    commit: &str,
    repo_dir: &Path,
    model: &str,
    char_budget: usize,
) -> LlmResult<Guidance> {
    let repo_info = build_repo_info_block(repo_dir);
    let budget = char_budget.to_string();

    let messages = vec![
        ChatMessage::system(INIT_SYSTEM.replace("{char_budget}", &budget)),
        ChatMessage::user(
            INIT_USER
                .replace("{repo}", repo)
                .replace("{commit}", commit)
                .replace("{repo_info}", &repo_info)
                .replace("{char_budget}", &budget),
        ),
    ];

    let params = ChatParams {
        temperature: 0.4,
        max_tokens: 2048,
        ..ChatParams::default()
    };
    let raw = llm.chat_completion(model, &messages, &params).await?;

    let lines: Vec<String> = raw
        .lines()
        .map(|l| l.trim_end().to_string())
        .filter(|l| !l.trim().is_empty())
        .collect();

    let guidance = truncate_to_budget(&Guidance::new(repo, commit, lines, 0, char_budget));

    let warnings = validate_guidance(&guidance, Some(repo_dir), false);
    if !warnings.is_empty() {
        warn!(repo, ?warnings, "initial guidance has validation warnings");
    }

    Ok(guidance)
}
