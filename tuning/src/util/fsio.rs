//! Atomic JSON snapshots and append-only JSONL logs.
//!
//! Every persistent snapshot in this crate goes through
//! [`write_json_atomic`]: serialize, write to a sibling temp file, fsync,
//! rename. A crashed writer never leaves a partially-written snapshot
//! behind. JSONL logs are append-only with one sorted-key object per line.

use std::fs::{self, File, OpenOptions};
use std::io::{self, Write};
use std::path::Path;

use serde::de::DeserializeOwned;
use serde::Serialize;

/// Serialize `value` as pretty-printed JSON (sorted keys, trailing
/// newline) and atomically replace `path` with it.
pub fn write_json_atomic<T: Serialize>(path: &Path, value: &T) -> io::Result<()> {
    // Round-trip through Value: serde_json's default map is a BTreeMap,
    // which yields sorted keys in the output.
    let value = serde_json::to_value(value).map_err(io::Error::other)?;
    let mut body = serde_json::to_string_pretty(&value).map_err(io::Error::other)?;
    body.push('\n');

    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            fs::create_dir_all(parent)?;
        }
    }

    let tmp = tmp_sibling(path);
    {
        let mut file = File::create(&tmp)?;
        file.write_all(body.as_bytes())?;
        file.sync_all()?;
    }
    fs::rename(&tmp, path)?;
    Ok(())
}

/// Read a JSON snapshot written by [`write_json_atomic`].
pub fn read_json<T: DeserializeOwned>(path: &Path) -> io::Result<T> {
    let body = fs::read_to_string(path)?;
    serde_json::from_str(&body).map_err(io::Error::other)
}

/// Append one record to a JSONL log as a single sorted-key line.
///
/// Parent directories are created on first use. The write is flushed
/// before returning so a subsequent reader observes the record.
pub fn append_jsonl<T: Serialize>(path: &Path, record: &T) -> io::Result<()> {
    let value = serde_json::to_value(record).map_err(io::Error::other)?;
    let mut line = serde_json::to_string(&value).map_err(io::Error::other)?;
    line.push('\n');

    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            fs::create_dir_all(parent)?;
        }
    }

    let mut file = OpenOptions::new().create(true).append(true).open(path)?;
    file.write_all(line.as_bytes())?;
    file.flush()?;
    Ok(())
}

/// Read all records from a JSONL file, skipping blank lines.
pub fn read_jsonl<T: DeserializeOwned>(path: &Path) -> io::Result<Vec<T>> {
    let body = fs::read_to_string(path)?;
    let mut records = Vec::new();
    for line in body.lines() {
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        records.push(serde_json::from_str(line).map_err(io::Error::other)?);
    }
    Ok(records)
}

fn tmp_sibling(path: &Path) -> std::path::PathBuf {
    let mut name = path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| "snapshot".to_string());
    name.push_str(".tmp");
    path.with_file_name(name)
}
