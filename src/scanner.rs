use anyhow::{Context, Result};
use ignore::gitignore::{Gitignore, GitignoreBuilder};
use ignore::WalkBuilder;
use std::path::{Path, PathBuf};

use crate::parser::INDEXED_EXTENSIONS;

// ---------------------------------------------------------------------------
// File discovery.
//
// Four ignore layers, applied in order: built-in excludes, `.aiignore`,
// `.gitignore`. The gitignore dialect here is deliberately simplified: no
// negation (`!` lines are dropped), a leading `/` is stripped, a trailing
// `/` expands to `…/**`.
// ---------------------------------------------------------------------------

/// Directory names that are never indexed, at any depth.
const BUILTIN_EXCLUDES: [&str; 8] = [
    "node_modules",
    ".git",
    ".git-ai",
    ".repo",
    "dist",
    "target",
    "build",
    ".gradle",
];

#[derive(Debug, Clone)]
pub struct ScanOptions {
    pub repo_root: PathBuf,
    /// Scan root, relative to the repo root (`.` scans everything).
    pub scan_root: PathBuf,
}

impl ScanOptions {
    pub fn new(repo_root: &Path) -> Self {
        Self {
            repo_root: repo_root.to_path_buf(),
            scan_root: PathBuf::from("."),
        }
    }

    fn scan_root_abs(&self) -> PathBuf {
        if self.scan_root.is_absolute() {
            self.scan_root.clone()
        } else {
            self.repo_root.join(&self.scan_root)
        }
    }
}

#[derive(Debug, Clone)]
pub struct SourceFile {
    pub abs_path: PathBuf,
    /// Repo-relative POSIX path; this exact string feeds every identifier.
    pub rel_posix: String,
}

fn build_ignore_matcher(repo_root: &Path) -> Result<Gitignore> {
    let mut builder = GitignoreBuilder::new(repo_root);

    for name in BUILTIN_EXCLUDES {
        builder.add_line(None, name)?;
        builder.add_line(None, &format!("**/{name}/**"))?;
    }

    for ignore_file in [".aiignore", ".gitignore"] {
        add_simplified_patterns(&mut builder, &repo_root.join(ignore_file))?;
    }

    Ok(builder.build()?)
}

/// Read one ignore file with the simplified semantics described above.
fn add_simplified_patterns(builder: &mut GitignoreBuilder, path: &Path) -> Result<()> {
    let Ok(text) = std::fs::read_to_string(path) else {
        return Ok(());
    };
    for raw in text.lines() {
        let line = raw.trim();
        if line.is_empty() || line.starts_with('#') || line.starts_with('!') {
            continue;
        }
        let line = line.strip_prefix('/').unwrap_or(line);
        if let Some(dir) = line.strip_suffix('/') {
            builder.add_line(None, dir)?;
            builder.add_line(None, &format!("{dir}/**"))?;
        } else {
            builder.add_line(None, line)?;
        }
    }
    Ok(())
}

fn has_indexed_extension(path: &Path) -> bool {
    let ext = path
        .extension()
        .and_then(|e| e.to_str())
        .unwrap_or("")
        .to_lowercase();
    INDEXED_EXTENSIONS.contains(&ext.as_str())
}

/// Enumerate candidate source files under the scan root, lexicographically
/// by repo-relative path.
pub fn discover_files(opts: &ScanOptions) -> Result<Vec<SourceFile>> {
    let scan_root = opts.scan_root_abs();
    std::fs::metadata(&scan_root)
        .with_context(|| format!("Scan root does not exist: {}", scan_root.display()))?;

    let matcher = build_ignore_matcher(&opts.repo_root)?;

    let walker = WalkBuilder::new(&scan_root)
        .standard_filters(false)
        .hidden(false)
        .build();

    let mut out: Vec<SourceFile> = Vec::new();
    for item in walker {
        let dent = match item {
            Ok(d) => d,
            Err(_) => continue,
        };
        if !dent.file_type().map(|ft| ft.is_file()).unwrap_or(false) {
            continue;
        }
        let abs_path = dent.into_path();
        if !has_indexed_extension(&abs_path) {
            continue;
        }
        let Ok(rel) = abs_path.strip_prefix(&opts.repo_root) else {
            continue;
        };
        if matcher
            .matched_path_or_any_parents(rel, false)
            .is_ignore()
        {
            continue;
        }
        let rel_posix = rel.to_string_lossy().replace('\\', "/");
        out.push(SourceFile {
            abs_path,
            rel_posix,
        });
    }

    out.sort_by(|a, b| a.rel_posix.cmp(&b.rel_posix));
    Ok(out)
}
