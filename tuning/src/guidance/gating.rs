//! Validation and budget gating for guidance blocks.
//!
//! Validation never rejects: it returns advisory warnings. The tuner
//! scores warned candidates too, because the LLM may emit blocks the
//! gate dislikes that still help, and scoring is what prunes them.

use std::path::Path;
use std::sync::OnceLock;

use regex::Regex;

use super::schema::Guidance;

/// Maximum number of guidance lines before a warning is raised.
pub const MAX_LINE_COUNT: usize = 120;

/// Minimum number of guidance lines before a warning is raised.
pub const MIN_LINE_COUNT: usize = 3;

/// Validate a guidance block and return human-readable warnings.
///
/// An empty vector means the guidance is clean. When `repo_dir` is
/// provided and `strict_paths` is set, path references in the rendered
/// text are checked against the actual worktree.
pub fn validate_guidance(
    guidance: &Guidance,
    repo_dir: Option<&Path>,
    strict_paths: bool,
) -> Vec<String> {
    let mut warnings = Vec::new();

    if !guidance.is_within_budget() {
        warnings.push(format!(
            "guidance exceeds char budget: {} > {}",
            guidance.char_count(),
            guidance.char_budget
        ));
    }

    let n = guidance.lines.len();
    if n < MIN_LINE_COUNT {
        warnings.push(format!("too few lines ({n} < {MIN_LINE_COUNT})"));
    }
    if n > MAX_LINE_COUNT {
        warnings.push(format!("too many lines ({n} > {MAX_LINE_COUNT})"));
    }

    let blank = guidance
        .lines
        .iter()
        .filter(|l| l.trim().is_empty())
        .count();
    if n > 6 && blank > n / 3 {
        warnings.push(format!("{blank}/{n} lines are blank"));
    }

    if strict_paths {
        if let Some(repo_dir) = repo_dir {
            for reference in extract_path_references(&guidance.render()) {
                let target = repo_dir.join(reference.trim_end_matches('/'));
                if !target.exists() {
                    warnings.push(format!("path reference not found in repo: {reference}"));
                }
            }
        }
    }

    warnings
}

/// Return a copy truncated to fit the character budget.
///
/// Whole lines are dropped from the end until the render fits; no line
/// is ever cut mid-text. Dropping every line is a legal outcome.
pub fn truncate_to_budget(guidance: &Guidance) -> Guidance {
    if guidance.is_within_budget() {
        return guidance.clone();
    }

    let mut lines = guidance.lines.clone();
    while !lines.is_empty() && lines.join("\n").chars().count() > guidance.char_budget {
        lines.pop();
    }
    guidance.with_lines(lines)
}

/// Extract plausible file/directory path references from guidance text.
///
/// Matches things like `src/foo/bar.py` or `tests/`, skipping URLs.
/// Used to flag guidance that hallucinates paths.
pub fn extract_path_references(text: &str) -> Vec<String> {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    let pattern = PATTERN.get_or_init(|| {
        Regex::new(r"[a-zA-Z0-9_.][a-zA-Z0-9_./\-]*(?:\.\w+|/)").expect("path regex")
    });

    let mut paths = Vec::new();
    for m in pattern.find_iter(text) {
        // Skip matches glued to a preceding word character.
        if m.start() > 0 {
            let prev = text[..m.start()].chars().next_back();
            if prev.is_some_and(|c| c.is_alphanumeric() || c == '_') {
                continue;
            }
        }
        let candidate = m.as_str();
        if candidate.starts_with("http") || candidate.starts_with("//") {
            continue;
        }
        if !candidate.contains('/') {
            continue;
        }
        let trimmed = candidate.trim_end_matches('.');
        if trimmed.len() > 2 {
            paths.push(trimmed.to_string());
        }
    }
    paths
}
