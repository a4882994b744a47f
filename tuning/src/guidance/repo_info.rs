//! Lightweight repository introspection for guidance initialization.
//!
//! A quick depth-limited tree walk plus heuristic detection of test
//! directories and the likely test command. The output feeds the G₀
//! seed prompt; nothing here is persisted.

use std::path::Path;

use ignore::WalkBuilder;

/// Directory names never worth showing to the model.
const IGNORE_DIRS: &[&str] = &[
    ".git",
    ".hg",
    ".svn",
    "__pycache__",
    ".pytest_cache",
    ".mypy_cache",
    ".tox",
    ".nox",
    ".eggs",
    ".venv",
    "venv",
    "env",
    ".env",
    "dist",
    "build",
    "_build",
    ".build",
    "htmlcov",
    "node_modules",
    ".coverage",
    ".cache",
    "target",
];

/// File names never worth showing to the model.
const IGNORE_FILES: &[&str] = &[".DS_Store", "Thumbs.db"];

/// Ignored file suffixes.
const IGNORE_FILE_SUFFIXES: &[&str] = &[".pyc", ".pyo", ".so", ".egg"];

/// Directory names that look like test roots.
const TEST_DIR_NAMES: &[&str] = &["tests", "test", "testing", "spec", "specs"];

/// Whether a directory name should be skipped during traversal.
pub fn should_ignore_dir(name: &str) -> bool {
    IGNORE_DIRS.contains(&name) || name.ends_with(".egg-info")
}

/// Whether a file name should be skipped during traversal.
pub fn should_ignore_file(name: &str) -> bool {
    IGNORE_FILES.contains(&name) || IGNORE_FILE_SUFFIXES.iter().any(|s| name.ends_with(s))
}

/// Render an indented directory tree, depth-limited.
pub fn render_repo_tree(repo_dir: &Path, max_depth: usize) -> String {
    let root_name = repo_dir
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| ".".to_string());
    let mut lines = vec![format!("{root_name}/")];
    walk_tree(repo_dir, "", 1, max_depth, &mut lines);
    lines.join("\n")
}

fn walk_tree(current: &Path, prefix: &str, depth: usize, max_depth: usize, lines: &mut Vec<String>) {
    if depth > max_depth {
        return;
    }
    let Ok(read) = std::fs::read_dir(current) else {
        return;
    };

    let mut entries: Vec<(bool, String)> = read
        .flatten()
        .filter_map(|entry| {
            let name = entry.file_name().to_string_lossy().into_owned();
            let is_dir = entry.file_type().map(|t| t.is_dir()).unwrap_or(false);
            let ignored = if is_dir {
                should_ignore_dir(&name)
            } else {
                should_ignore_file(&name)
            };
            (!ignored).then_some((is_dir, name))
        })
        .collect();
    // Directories first, then case-insensitive by name.
    entries.sort_by(|a, b| {
        b.0.cmp(&a.0)
            .then_with(|| a.1.to_lowercase().cmp(&b.1.to_lowercase()))
    });

    let count = entries.len();
    for (i, (is_dir, name)) in entries.into_iter().enumerate() {
        let is_last = i == count - 1;
        let connector = if is_last { "└── " } else { "├── " };
        let suffix = if is_dir { "/" } else { "" };
        lines.push(format!("{prefix}{connector}{name}{suffix}"));
        if is_dir && depth < max_depth {
            let extension = if is_last { "    " } else { "│   " };
            walk_tree(
                &current.join(&name),
                &format!("{prefix}{extension}"),
                depth + 1,
                max_depth,
                lines,
            );
        }
    }
}

/// Sorted non-ignored top-level directory names.
pub fn top_level_dirs(repo_dir: &Path) -> Vec<String> {
    let mut dirs: Vec<String> = std::fs::read_dir(repo_dir)
        .into_iter()
        .flatten()
        .flatten()
        .filter(|e| e.file_type().map(|t| t.is_dir()).unwrap_or(false))
        .map(|e| e.file_name().to_string_lossy().into_owned())
        .filter(|name| !should_ignore_dir(name))
        .collect();
    dirs.sort();
    dirs
}

/// Relative paths of directories that look like test roots (depth ≤ 3).
pub fn test_dirs(repo_dir: &Path) -> Vec<String> {
    let mut found = Vec::new();
    let walker = WalkBuilder::new(repo_dir)
        .max_depth(Some(3))
        .hidden(false)
        .filter_entry(|entry| {
            let name = entry.file_name().to_string_lossy();
            !should_ignore_dir(&name)
        })
        .build();

    for entry in walker.flatten() {
        if entry.depth() == 0 {
            continue;
        }
        if !entry.file_type().is_some_and(|t| t.is_dir()) {
            continue;
        }
        let name = entry.file_name().to_string_lossy().to_lowercase();
        if TEST_DIR_NAMES.contains(&name.as_str()) {
            if let Ok(rel) = entry.path().strip_prefix(repo_dir) {
                found.push(rel.to_string_lossy().into_owned());
            }
        }
    }
    found.sort();
    found
}

/// Top-level Python package names (directories with `__init__.py`).
pub fn python_modules(repo_dir: &Path) -> Vec<String> {
    let mut modules: Vec<String> = std::fs::read_dir(repo_dir)
        .into_iter()
        .flatten()
        .flatten()
        .filter(|e| e.file_type().map(|t| t.is_dir()).unwrap_or(false))
        .map(|e| e.file_name().to_string_lossy().into_owned())
        .filter(|name| !should_ignore_dir(name))
        .filter(|name| repo_dir.join(name).join("__init__.py").exists())
        .collect();
    modules.sort();
    modules
}

/// Best-effort guess of the repository's test command.
pub fn detect_test_command(repo_dir: &Path) -> &'static str {
    if repo_dir.join("pytest.ini").exists() || repo_dir.join("pyproject.toml").exists() {
        return "pytest";
    }
    if let Ok(cfg) = std::fs::read_to_string(repo_dir.join("setup.cfg")) {
        if cfg.contains("[tool:pytest]") {
            return "pytest";
        }
    }
    if repo_dir.join("tox.ini").exists() {
        return "tox";
    }
    if repo_dir.join("Cargo.toml").exists() {
        return "cargo test";
    }
    if repo_dir.join("package.json").exists() {
        return "npm test";
    }
    "pytest"
}

/// Build the repo-info text block for the G₀ seed prompt.
pub fn build_repo_info_block(repo_dir: &Path) -> String {
    let mut parts = Vec::new();

    let tree = render_repo_tree(repo_dir, 2);
    parts.push(format!("## Directory tree (depth=2)\n```\n{tree}\n```"));

    let dirs = top_level_dirs(repo_dir);
    parts.push(format!("## Top-level directories\n{}", dirs.join(", ")));

    let tests = test_dirs(repo_dir);
    if !tests.is_empty() {
        parts.push(format!("## Test directories\n{}", tests.join(", ")));
    }

    let cmd = detect_test_command(repo_dir);
    parts.push(format!("## Likely test command\n`{cmd}`"));

    let modules = python_modules(repo_dir);
    if !modules.is_empty() {
        parts.push(format!("## Python packages\n{}", modules.join(", ")));
    }

    let mut block = parts.join("\n\n");
    block.push('\n');
    block
}
