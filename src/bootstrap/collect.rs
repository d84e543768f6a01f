//! Bounded project material for the bootstrap agents.

use std::fmt::Write as _;
use std::fs;
use std::path::{Path, PathBuf};
use tracing::debug;

use crate::agents::BootstrapKind;

/// Characters read from any single file.
const MAX_FILE_CHARS: usize = 8_000;
/// Characters of material handed to one agent.
const MAX_MATERIAL_CHARS: usize = 32_000;
/// Directory depth walked for docs and structure.
const MAX_DEPTH: usize = 3;
/// Entries listed in the structure summary.
const MAX_TREE_ENTRIES: usize = 400;

const SKIPPED_DIRS: &[&str] = &[
    "target",
    "node_modules",
    "vendor",
    "dist",
    "build",
    "__pycache__",
    "venv",
];

const MANIFESTS: &[&str] = &[
    "Cargo.toml",
    "package.json",
    "go.mod",
    "pyproject.toml",
    "requirements.txt",
];

const ARCHITECTURE_FILES: &[&str] = &["ARCHITECTURE.md", "docs/ARCHITECTURE.md", "docs/architecture.md"];

/// Material for one agent; empty when the project has nothing relevant.
pub fn gather(root: &Path, kind: BootstrapKind) -> String {
    let material = match kind {
        BootstrapKind::Docs => gather_docs(root),
        BootstrapKind::Deps => gather_manifests(root),
        BootstrapKind::Structure => gather_structure(root),
    };
    debug!(agent = %kind, chars = material.len(), "Gathered bootstrap material");
    material
}

/// The project's architecture overview document, verbatim.
pub fn architecture_document(root: &Path) -> Option<String> {
    ARCHITECTURE_FILES
        .iter()
        .map(|rel| root.join(rel))
        .find(|p| p.is_file())
        .and_then(|p| fs::read_to_string(p).ok())
        .filter(|text| !text.trim().is_empty())
}

fn gather_docs(root: &Path) -> String {
    let mut files: Vec<PathBuf> = Vec::new();
    if let Ok(entries) = fs::read_dir(root) {
        let mut top: Vec<PathBuf> = entries
            .flatten()
            .map(|e| e.path())
            .filter(|p| p.is_file() && is_markdown(p))
            .collect();
        top.sort();
        // README first.
        top.sort_by_key(|p| !file_name(p).to_lowercase().starts_with("readme"));
        files.extend(top);
    }
    let docs = root.join("docs");
    if docs.is_dir() {
        walk(&docs, 1, &mut |path, is_dir| {
            if !is_dir && is_markdown(path) {
                files.push(path.to_path_buf());
            }
        });
    }
    concat_files(root, &files)
}

fn gather_manifests(root: &Path) -> String {
    let mut files: Vec<PathBuf> = MANIFESTS
        .iter()
        .map(|m| root.join(m))
        .filter(|p| p.is_file())
        .collect();

    // Workspace members one level down (crates/foo/Cargo.toml, packages/bar/package.json).
    if let Ok(entries) = fs::read_dir(root) {
        let mut dirs: Vec<PathBuf> = entries
            .flatten()
            .map(|e| e.path())
            .filter(|p| p.is_dir() && !is_skipped(p))
            .collect();
        dirs.sort();
        for dir in dirs {
            if let Ok(children) = fs::read_dir(&dir) {
                let mut nested: Vec<PathBuf> = children
                    .flatten()
                    .map(|e| e.path())
                    .filter(|p| p.is_dir() && !is_skipped(p))
                    .flat_map(|member| MANIFESTS.iter().map(move |m| member.join(m)))
                    .filter(|p| p.is_file())
                    .collect();
                nested.sort();
                files.extend(nested);
            }
        }
    }
    concat_files(root, &files)
}

fn gather_structure(root: &Path) -> String {
    let mut lines: Vec<String> = Vec::new();
    walk(root, 0, &mut |path, is_dir| {
        if lines.len() >= MAX_TREE_ENTRIES {
            return;
        }
        let rel = path.strip_prefix(root).unwrap_or(path);
        let depth = rel.components().count().saturating_sub(1);
        let suffix = if is_dir { "/" } else { "" };
        lines.push(format!("{}{}{}", "  ".repeat(depth), file_name(path), suffix));
    });
    let mut out = lines.join("\n");
    if lines.len() >= MAX_TREE_ENTRIES {
        out.push_str("\n... (truncated)");
    }
    out
}

/// Depth-first walk in name order, skipping hidden and build directories.
fn walk(dir: &Path, depth: usize, visit: &mut dyn FnMut(&Path, bool)) {
    if depth >= MAX_DEPTH {
        return;
    }
    let Ok(entries) = fs::read_dir(dir) else {
        return;
    };
    let mut paths: Vec<PathBuf> = entries.flatten().map(|e| e.path()).collect();
    paths.sort();
    for path in paths {
        if file_name(&path).starts_with('.') {
            continue;
        }
        let is_dir = path.is_dir();
        if is_dir && is_skipped(&path) {
            continue;
        }
        visit(&path, is_dir);
        if is_dir {
            walk(&path, depth + 1, visit);
        }
    }
}

fn concat_files(root: &Path, files: &[PathBuf]) -> String {
    let mut out = String::new();
    for path in files {
        if out.len() >= MAX_MATERIAL_CHARS {
            break;
        }
        let Ok(text) = fs::read_to_string(path) else {
            continue;
        };
        let rel = path.strip_prefix(root).unwrap_or(path);
        let body: String = text.chars().take(MAX_FILE_CHARS).collect();
        let _ = write!(out, "=== {} ===\n{}\n\n", rel.display(), body.trim_end());
    }
    out.chars().take(MAX_MATERIAL_CHARS).collect()
}

fn is_markdown(path: &Path) -> bool {
    path.extension()
        .and_then(|e| e.to_str())
        .map(|e| e.eq_ignore_ascii_case("md"))
        .unwrap_or(false)
}

fn is_skipped(path: &Path) -> bool {
    let name = file_name(path);
    name.starts_with('.') || SKIPPED_DIRS.contains(&name.as_str())
}

fn file_name(path: &Path) -> String {
    path.file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn project() -> TempDir {
        let dir = TempDir::new().unwrap();
        let root = dir.path();
        fs::write(root.join("README.md"), "# Demo\nA demo service.").unwrap();
        fs::write(root.join("ARCHITECTURE.md"), "Layers: api -> core -> db").unwrap();
        fs::write(root.join("Cargo.toml"), "[package]\nname = \"demo\"").unwrap();
        fs::create_dir_all(root.join("src/api")).unwrap();
        fs::write(root.join("src/api/mod.rs"), "").unwrap();
        fs::create_dir_all(root.join("target/debug")).unwrap();
        fs::create_dir_all(root.join("crates/core")).unwrap();
        fs::write(root.join("crates/core/Cargo.toml"), "[package]\nname = \"core\"").unwrap();
        dir
    }

    #[test]
    fn test_docs_put_readme_first() {
        let dir = project();
        let docs = gather(dir.path(), BootstrapKind::Docs);
        assert!(docs.starts_with("=== README.md ==="));
        assert!(docs.contains("ARCHITECTURE.md"));
    }

    #[test]
    fn test_manifests_include_workspace_members() {
        let dir = project();
        let deps = gather(dir.path(), BootstrapKind::Deps);
        assert!(deps.contains("=== Cargo.toml ==="));
        assert!(deps.contains("crates/core/Cargo.toml"));
    }

    #[test]
    fn test_structure_skips_build_dirs() {
        let dir = project();
        let tree = gather(dir.path(), BootstrapKind::Structure);
        assert!(tree.contains("src/"));
        assert!(tree.contains("  api/"));
        assert!(!tree.contains("target"));
    }

    #[test]
    fn test_architecture_document() {
        let dir = project();
        assert_eq!(
            architecture_document(dir.path()).as_deref(),
            Some("Layers: api -> core -> db")
        );
        let empty = TempDir::new().unwrap();
        assert!(architecture_document(empty.path()).is_none());
    }
}
