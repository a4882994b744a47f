//! Extracting unified diffs from agent output and trajectory artifacts.

use std::path::Path;
use std::sync::OnceLock;

use regex::Regex;

use super::TokenUsage;

/// Maximum allowed patch size in bytes. Anything larger is rejected as
/// empty — a runaway diff is worse than no diff.
pub const MAX_PATCH_SIZE: usize = 200_000;

/// Trajectory keys that may carry the patch directly.
const PATCH_KEYS: &[&str] = &["patch", "model_patch", "diff"];

/// Trajectory keys that may hold a list of agent steps.
const STEP_LIST_KEYS: &[&str] = &["actions", "steps", "messages", "history"];

/// Step fields worth scanning for an embedded diff.
const STEP_TEXT_FIELDS: &[&str] = &["output", "content", "result", "patch"];

/// Extract a unified diff from free-form model output.
///
/// Tries, in order: a fenced ```` ```diff ```` block, the first line
/// starting with `diff --git ` (and everything after it), the first
/// line starting with `--- ` (and everything after it). Returns an
/// empty string when nothing looks like a diff.
pub fn extract_diff(text: &str) -> String {
    static FENCE: OnceLock<Regex> = OnceLock::new();
    let fence = FENCE.get_or_init(|| {
        Regex::new(r"(?s)```(?:diff)?[ \t]*\n(.*?)```").expect("fence regex")
    });

    for captures in fence.captures_iter(text) {
        let block = &captures[1];
        if block.contains("---") || block.contains("diff --git") {
            return block.trim().to_string();
        }
    }

    let lines: Vec<&str> = text.split('\n').collect();
    for (i, line) in lines.iter().enumerate() {
        if line.starts_with("diff --git ") {
            return lines[i..].join("\n").trim().to_string();
        }
    }
    for (i, line) in lines.iter().enumerate() {
        if line.starts_with("--- ") {
            return lines[i..].join("\n").trim().to_string();
        }
    }

    String::new()
}

/// Extract a patch from an agent trajectory JSON file.
///
/// Tries a top-level `patch`/`model_patch`/`diff` field first, then
/// scans step lists newest-first for anything [`extract_diff`] accepts.
/// Unreadable or malformed trajectories yield an empty string.
pub fn extract_patch_from_trajectory(path: &Path) -> String {
    let Ok(body) = std::fs::read_to_string(path) else {
        return String::new();
    };
    let Ok(data) = serde_json::from_str::<serde_json::Value>(&body) else {
        return String::new();
    };

    for key in PATCH_KEYS {
        if let Some(patch) = data.get(key).and_then(|v| v.as_str()) {
            if !patch.trim().is_empty() {
                return patch.trim().to_string();
            }
        }
    }

    for key in STEP_LIST_KEYS {
        let Some(items) = data.get(key).and_then(|v| v.as_array()) else {
            continue;
        };
        // Most recent step first.
        for item in items.iter().rev() {
            match item {
                serde_json::Value::Object(map) => {
                    for field in STEP_TEXT_FIELDS {
                        if let Some(text) = map.get(*field).and_then(|v| v.as_str()) {
                            let diff = extract_diff(text);
                            if !diff.is_empty() {
                                return diff;
                            }
                        }
                    }
                }
                serde_json::Value::String(text) => {
                    let diff = extract_diff(text);
                    if !diff.is_empty() {
                        return diff;
                    }
                }
                _ => {}
            }
        }
    }

    String::new()
}

/// Salvage token usage counters from a trajectory JSON file.
///
/// Looks for a top-level `token_usage` or `usage` object; zeros when
/// the trajectory does not report usage.
pub fn extract_token_usage(path: &Path) -> TokenUsage {
    let Ok(body) = std::fs::read_to_string(path) else {
        return TokenUsage::default();
    };
    let Ok(data) = serde_json::from_str::<serde_json::Value>(&body) else {
        return TokenUsage::default();
    };

    for key in ["token_usage", "usage"] {
        if let Some(usage) = data.get(key) {
            let get = |field: &str| usage.get(field).and_then(|v| v.as_u64()).unwrap_or(0);
            return TokenUsage {
                prompt_tokens: get("prompt_tokens"),
                completion_tokens: get("completion_tokens"),
                total_tokens: get("total_tokens"),
            };
        }
    }
    TokenUsage::default()
}
