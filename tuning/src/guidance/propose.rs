//! Propose candidate guidance edits for hill-climbing.
//!
//! Given the current best guidance G*, the proposer asks the LLM for K
//! variant blocks. The model is told to make incremental edits only —
//! add a line, remove a line, reorder, rephrase — never a from-scratch
//! rewrite. Output is parsed tolerantly: the model may emit a list of
//! line-lists or a list of `{"lines": [...]}` objects; malformed array
//! entries are dropped. Every surviving candidate is truncated to the
//! budget and validated before it enters the score queue.

use std::sync::OnceLock;

use regex::Regex;
use serde::Deserialize;
use tracing::warn;

use super::gating::{truncate_to_budget, validate_guidance};
use super::schema::Guidance;
use crate::llm::{ChatMessage, ChatParams, LlmClient, LlmResult};

const PROPOSE_SYSTEM: &str = "\
You are an expert at tuning guidance blocks for a coding agent that fixes
open-source issues. You will be given the CURRENT best guidance for a
repository together with its recent score. Produce exactly {k} VARIANT
guidance blocks, each a plausible improvement.

Rules:
- Each variant must be <= {char_budget} characters.
- Each variant is a list of lines starting with \"- \".
- Make diverse edits: add tips, remove unhelpful ones, rephrase, reorder.
- Keep changes incremental - do NOT rewrite from scratch.
- Output valid JSON: a list of {k} objects, each with a \"lines\" key
  containing a list of strings.
- Output ONLY the JSON array. No commentary.";

const PROPOSE_USER: &str = "\
Repository: {repo}

Current guidance (version {version}, score {score}):
---
{current_text}
---

Previous scores: {history}

Produce {k} variant guidance blocks as JSON.";

/// One entry of the proposer's JSON array. The model swings between two
/// shapes; both are accepted, anything else is dropped.
#[derive(Deserialize)]
#[serde(untagged)]
enum RawCandidate {
    Object { lines: Vec<serde_json::Value> },
    List(Vec<serde_json::Value>),
}

impl RawCandidate {
    fn into_lines(self) -> Vec<String> {
        let values = match self {
            Self::Object { lines } => lines,
            Self::List(lines) => lines,
        };
        values
            .into_iter()
            .filter_map(|v| match v {
                serde_json::Value::String(s) => Some(s),
                other => Some(other.to_string()),
            })
            .map(|s| s.trim_end().to_string())
            .filter(|s| !s.trim().is_empty())
            .collect()
    }
}

/// Ask the LLM to propose up to `k` candidate guidance variants.
///
/// Candidates are derived from `guidance` (the incumbent) and returned
/// at `guidance.version + 1`; the tuner reassigns final versions. The
/// returned order is the model's order and is stable for a given
/// response.
pub async fn propose_candidates(
    llm: &LlmClient,
    guidance: &Guidance,
    score: f64,
    model: &str,
    k: usize,
    history: &[(u64, f64)],
) -> LlmResult<Vec<Guidance>> {
    let history_text = if history.is_empty() {
        "none".to_string()
    } else {
        history
            .iter()
            .map(|(v, s)| format!("v{v}={:.1}%", s * 100.0))
            .collect::<Vec<_>>()
            .join(", ")
    };

    let k_text = k.to_string();
    let budget_text = guidance.char_budget.to_string();
    let messages = vec![
        ChatMessage::system(
            PROPOSE_SYSTEM
                .replace("{k}", &k_text)
                .replace("{char_budget}", &budget_text),
        ),
        ChatMessage::user(
            PROPOSE_USER
                .replace("{repo}", &guidance.repo)
                .replace("{version}", &guidance.version.to_string())
                .replace("{score}", &format!("{:.1}%", score * 100.0))
                .replace("{current_text}", &guidance.render())
                .replace("{history}", &history_text)
                .replace("{k}", &k_text),
        ),
    ];

    let params = ChatParams {
        temperature: 0.7,
        max_tokens: 4096,
        ..ChatParams::default()
    };
    let raw = llm.chat_completion(model, &messages, &params).await?;

    Ok(parse_candidates(&raw, guidance, k))
}

/// Parse LLM output into validated candidates. Returns an empty vector
/// (never an error) when the output is unusable; the tuner records the
/// iteration as completed with no changes.
pub fn parse_candidates(raw: &str, base: &Guidance, k: usize) -> Vec<Guidance> {
    let text = strip_fences(raw.trim());

    let array: Vec<serde_json::Value> = match serde_json::from_str(text) {
        Ok(serde_json::Value::Array(items)) => items,
        Ok(other) => {
            warn!(got = %type_name(&other), "proposer output is not a JSON array");
            return Vec::new();
        }
        Err(_) => match find_embedded_array(text) {
            Some(items) => items,
            None => {
                warn!(chars = text.len(), "no JSON array found in proposer output");
                return Vec::new();
            }
        },
    };

    let next_version = base.version + 1;
    let mut candidates = Vec::new();

    for (i, item) in array.into_iter().take(k).enumerate() {
        let lines = match serde_json::from_value::<RawCandidate>(item) {
            Ok(raw) => raw.into_lines(),
            Err(_) => {
                warn!(index = i, "skipping candidate with unexpected shape");
                continue;
            }
        };

        let candidate = truncate_to_budget(&base.with_version(next_version).with_lines(lines));
        let warnings = validate_guidance(&candidate, None, false);
        if !warnings.is_empty() {
            warn!(index = i, ?warnings, "candidate has validation warnings");
        }
        // Kept even with warnings; scoring prunes bad candidates.
        candidates.push(candidate);
    }

    candidates
}

/// Remove a surrounding markdown fence, if any.
fn strip_fences(text: &str) -> &str {
    static OPEN: OnceLock<Regex> = OnceLock::new();
    let open = OPEN.get_or_init(|| Regex::new(r"^```(?:json)?\s*").expect("fence regex"));

    let mut out = text;
    if let Some(m) = open.find(out) {
        out = &out[m.end()..];
    }
    out.trim_end().strip_suffix("```").unwrap_or(out).trim()
}

/// Find the first bracketed JSON array embedded in free text.
fn find_embedded_array(text: &str) -> Option<Vec<serde_json::Value>> {
    let start = text.find('[')?;
    let end = text.rfind(']')?;
    if end <= start {
        return None;
    }
    match serde_json::from_str(&text[start..=end]) {
        Ok(serde_json::Value::Array(items)) => Some(items),
        _ => None,
    }
}

fn type_name(value: &serde_json::Value) -> &'static str {
    match value {
        serde_json::Value::Null => "null",
        serde_json::Value::Bool(_) => "bool",
        serde_json::Value::Number(_) => "number",
        serde_json::Value::String(_) => "string",
        serde_json::Value::Array(_) => "array",
        serde_json::Value::Object(_) => "object",
    }
}
