//! Loading and summarizing external-harness evaluation results.
//!
//! The harness writes either a summary `results.json` with `resolved`
//! and `applied` id lists, or a per-instance `instance_results.jsonl`
//! with one record per line carrying a truthy `resolved`/`passed`
//! field. Both shapes are accepted; counts fall out of cardinality.

use std::path::Path;

use serde_json::Value;

/// Load `(resolved, total)` from a harness results directory.
///
/// Tries `results.json` first, then `instance_results.jsonl`. Returns
/// `None` when neither file yields counts.
pub fn load_results(results_dir: &Path) -> Option<(usize, usize)> {
    if let Some(counts) = load_summary_results(&results_dir.join("results.json")) {
        return Some(counts);
    }
    load_instance_results(&results_dir.join("instance_results.jsonl"))
}

fn load_summary_results(path: &Path) -> Option<(usize, usize)> {
    let body = std::fs::read_to_string(path).ok()?;
    let data: Value = serde_json::from_str(&body).ok()?;
    let map = data.as_object()?;

    let id_list = |key: &str| -> Vec<String> {
        map.get(key)
            .and_then(Value::as_array)
            .map(|a| {
                a.iter()
                    .filter_map(|v| v.as_str().map(String::from))
                    .collect()
            })
            .unwrap_or_default()
    };

    let resolved = id_list("resolved");
    let applied = id_list("applied");

    // `applied` gives the denominator when present; otherwise every id
    // mentioned anywhere counts.
    let total = if !applied.is_empty() {
        applied.len()
    } else {
        let mut all: std::collections::HashSet<String> = std::collections::HashSet::new();
        for key in ["resolved", "applied", "failed", "error"] {
            all.extend(id_list(key));
        }
        if all.is_empty() {
            resolved.len()
        } else {
            all.len()
        }
    };

    Some((resolved.len(), total))
}

fn load_instance_results(path: &Path) -> Option<(usize, usize)> {
    let records = load_instance_records(path);
    if records.is_empty() {
        return None;
    }
    let resolved = records.iter().filter(|r| record_resolved(r)).count();
    Some((resolved, records.len()))
}

/// Load per-instance harness records when available. Malformed lines
/// are skipped.
pub fn load_instance_records(path: &Path) -> Vec<Value> {
    let Ok(body) = std::fs::read_to_string(path) else {
        return Vec::new();
    };
    body.lines()
        .map(str::trim)
        .filter(|l| !l.is_empty())
        .filter_map(|l| serde_json::from_str(l).ok())
        .collect()
}

fn record_resolved(record: &Value) -> bool {
    ["resolved", "passed"]
        .iter()
        .any(|key| record.get(key).map(truthy).unwrap_or(false))
}

fn truthy(value: &Value) -> bool {
    match value {
        Value::Bool(b) => *b,
        Value::Number(n) => n.as_f64().is_some_and(|f| f != 0.0),
        Value::String(s) => !s.is_empty() && s != "false" && s != "0",
        Value::Null => false,
        _ => true,
    }
}

/// Success rate as a fraction, zero when the denominator is zero.
pub fn compute_rate(resolved: usize, total: usize) -> f64 {
    if total == 0 {
        0.0
    } else {
        resolved as f64 / total as f64
    }
}

/// Coarse failure taxonomy for an unresolved instance record.
pub fn classify_failure(record: &Value) -> &'static str {
    if record_resolved(record) {
        return "resolved";
    }

    let mut text = String::new();
    for key in ["error", "error_message", "failure_reason", "report", "status"] {
        if let Some(value) = record.get(key) {
            if !value.is_null() {
                text.push_str(&value.to_string().to_lowercase());
                text.push(' ');
            }
        }
    }

    if text.contains("timeout") {
        "timeout"
    } else if text.contains("apply") || text.contains("patch") {
        "patch_apply_failure"
    } else if text.contains("importerror") || text.contains("module") || text.contains("environment")
    {
        "environment_failure"
    } else if text.contains("test") || text.contains("assert") || text.contains("fail") {
        "test_failure"
    } else if text.contains("error") || text.contains("exception") {
        "runtime_error"
    } else {
        "unresolved_unknown"
    }
}

/// Count instances per failure category.
pub fn summarize_failure_taxonomy(records: &[Value]) -> std::collections::BTreeMap<String, usize> {
    let mut counts = std::collections::BTreeMap::new();
    for record in records {
        *counts
            .entry(classify_failure(record).to_string())
            .or_insert(0) += 1;
    }
    counts
}
