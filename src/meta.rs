use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use thiserror::Error;

use crate::parser::IndexLang;
use crate::store::{chunks_table, refs_table, OpenMode, VectorStore};

pub const INDEX_SCHEMA_VERSION: i64 = 3;
pub const STORE_DIR: &str = ".git-ai";
pub const VECTOR_DIR: &str = "lancedb";
pub const META_FILE: &str = "meta.json";

/// Raised when the on-disk index cannot serve the request (schema mismatch,
/// wrong dim, missing tables). Mapped to exit code 2 by the CLI.
#[derive(Debug, Error)]
#[error("{0}")]
pub struct IndexIncompatible(pub String);

/// Raised when a named language is not part of the index. Exit code 2.
#[derive(Debug, Error)]
#[error("language '{requested}' is not indexed; available: {}", available.join(", "))]
pub struct LanguageUnavailable {
    pub requested: String,
    pub available: Vec<String>,
}

/// Raised when a caller-supplied path points outside the repository.
#[derive(Debug, Error)]
#[error("path_escapes_root: {0}")]
pub struct PathEscapesRoot(pub String);

pub fn store_root(repo_root: &Path) -> PathBuf {
    repo_root.join(STORE_DIR)
}

pub fn vector_dir(repo_root: &Path) -> PathBuf {
    store_root(repo_root).join(VECTOR_DIR)
}

pub fn meta_path(repo_root: &Path) -> PathBuf {
    store_root(repo_root).join(META_FILE)
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AstGraphMeta {
    pub enabled: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub engine: Option<String>,
    #[serde(rename = "dbPath", skip_serializing_if = "Option::is_none")]
    pub db_path: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub counts: Option<BTreeMap<String, usize>>,
    #[serde(rename = "skippedReason", skip_serializing_if = "Option::is_none")]
    pub skipped_reason: Option<String>,
}

#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub struct LangCounts {
    #[serde(rename = "chunksAdded")]
    pub chunks_added: usize,
    #[serde(rename = "refsAdded")]
    pub refs_added: usize,
}

/// `meta.json`, the final write that publishes an indexing run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IndexMeta {
    pub index_schema_version: i64,
    pub dim: usize,
    pub languages: Vec<IndexLang>,
    #[serde(rename = "dbDir")]
    pub db_dir: String,
    #[serde(rename = "scanRoot")]
    pub scan_root: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub commit_hash: Option<String>,
    #[serde(rename = "astGraph")]
    pub ast_graph: AstGraphMeta,
    #[serde(rename = "byLang")]
    pub by_lang: BTreeMap<String, LangCounts>,
}

pub fn read_meta(repo_root: &Path) -> Result<IndexMeta> {
    let path = meta_path(repo_root);
    let text = std::fs::read_to_string(&path)
        .with_context(|| format!("No index meta at {} (run `index` first)", path.display()))?;
    serde_json::from_str(&text).with_context(|| format!("Unreadable meta: {}", path.display()))
}

pub fn write_meta(repo_root: &Path, meta: &IndexMeta) -> Result<()> {
    let path = meta_path(repo_root);
    std::fs::create_dir_all(path.parent().unwrap_or(repo_root))?;
    std::fs::write(&path, serde_json::to_vec_pretty(meta)?)
        .with_context(|| format!("Failed to write {}", path.display()))?;
    Ok(())
}

/// Reject the meta early when its schema cannot serve this build.
pub fn ensure_compatible(meta: &IndexMeta) -> Result<(), IndexIncompatible> {
    if meta.index_schema_version != INDEX_SCHEMA_VERSION {
        return Err(IndexIncompatible(format!(
            "index schema v{} found, v{} expected; run `index --overwrite`",
            meta.index_schema_version, INDEX_SCHEMA_VERSION
        )));
    }
    Ok(())
}

// ---------------------------------------------------------------------------
// Language selection
// ---------------------------------------------------------------------------

/// `auto` picks one language by preference order, `all` fans out, a named
/// language must exist in the index.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LangSelector {
    Auto,
    All,
    One(IndexLang),
}

impl LangSelector {
    pub fn parse(s: &str) -> Result<Self> {
        match s {
            "auto" => Ok(LangSelector::Auto),
            "all" => Ok(LangSelector::All),
            other => IndexLang::parse(other)
                .map(LangSelector::One)
                .with_context(|| format!("unknown language: {other}")),
        }
    }

    pub fn resolve(&self, available: &[IndexLang]) -> Result<Vec<IndexLang>, LanguageUnavailable> {
        match self {
            LangSelector::All => Ok(available.to_vec()),
            LangSelector::Auto => IndexLang::PREFERENCE
                .iter()
                .find(|l| available.contains(l))
                .map(|&l| vec![l])
                .ok_or_else(|| LanguageUnavailable {
                    requested: "auto".to_string(),
                    available: vec![],
                }),
            LangSelector::One(lang) => {
                if available.contains(lang) {
                    Ok(vec![*lang])
                } else {
                    Err(LanguageUnavailable {
                        requested: lang.as_str().to_string(),
                        available: available.iter().map(|l| l.as_str().to_string()).collect(),
                    })
                }
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Git HEAD (no libgit dependency: HEAD + loose ref + packed-refs)
// ---------------------------------------------------------------------------

pub fn resolve_head(repo_root: &Path) -> Option<String> {
    let head = std::fs::read_to_string(repo_root.join(".git").join("HEAD")).ok()?;
    let head = head.trim();
    if let Some(refname) = head.strip_prefix("ref: ") {
        let loose = repo_root.join(".git").join(refname);
        if let Ok(hash) = std::fs::read_to_string(loose) {
            let hash = hash.trim();
            if !hash.is_empty() {
                return Some(hash.to_string());
            }
        }
        let packed = std::fs::read_to_string(repo_root.join(".git").join("packed-refs")).ok()?;
        for line in packed.lines() {
            if let Some((hash, name)) = line.split_once(' ') {
                if name.trim() == refname {
                    return Some(hash.trim().to_string());
                }
            }
        }
        None
    } else if head.len() >= 40 {
        Some(head.to_string())
    } else {
        None
    }
}

// ---------------------------------------------------------------------------
// Index check
// ---------------------------------------------------------------------------

#[derive(Debug, Serialize)]
pub struct CheckReport {
    pub ok: bool,
    pub problems: Vec<String>,
    pub warnings: Vec<String>,
    pub expected: serde_json::Value,
    pub found: serde_json::Value,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub hint: Option<String>,
}

/// Validate the on-disk index: meta readable, schema version current, vector
/// tables present for every declared language, graph store present. A commit
/// drift between meta and HEAD is a warning, not a failure.
pub fn check_index(repo_root: &Path) -> CheckReport {
    let mut problems: Vec<String> = Vec::new();
    let mut warnings: Vec<String> = Vec::new();
    let mut found_tables: Vec<String> = Vec::new();
    let mut hint = None;

    let expected_tables = |langs: &[IndexLang]| -> Vec<String> {
        langs
            .iter()
            .flat_map(|&l| [chunks_table(l), refs_table(l)])
            .collect()
    };

    let meta = match read_meta(repo_root) {
        Ok(m) => m,
        Err(e) => {
            return CheckReport {
                ok: false,
                problems: vec![format!("{e:#}")],
                warnings,
                expected: json!({ "index_schema_version": INDEX_SCHEMA_VERSION }),
                found: json!({}),
                hint: Some("run `index` to build the store".to_string()),
            };
        }
    };

    if meta.index_schema_version != INDEX_SCHEMA_VERSION {
        problems.push(format!(
            "index_schema_version is {} (expected {})",
            meta.index_schema_version, INDEX_SCHEMA_VERSION
        ));
        hint = Some("run `index --overwrite`".to_string());
    }

    let db_dir = vector_dir(repo_root);
    if !db_dir.is_dir() {
        problems.push(format!("vector store missing: {}", db_dir.display()));
        hint.get_or_insert_with(|| "run `index --overwrite`".to_string());
    } else {
        match VectorStore::open(&db_dir, meta.dim, OpenMode::CreateIfMissing, &[]) {
            Ok(store) => {
                for table in expected_tables(&meta.languages) {
                    match store.table_exists(&table) {
                        Ok(true) => found_tables.push(table),
                        Ok(false) => {
                            problems.push(format!("table missing: {table}"));
                            hint.get_or_insert_with(|| "run `index --overwrite`".to_string());
                        }
                        Err(e) => problems.push(format!("cannot inspect {table}: {e}")),
                    }
                }
            }
            Err(e) => problems.push(format!("vector store does not open: {e}")),
        }
    }

    if meta.ast_graph.enabled {
        if let Some(db_path) = &meta.ast_graph.db_path {
            if !Path::new(db_path).exists() && !repo_root.join(db_path).exists() {
                problems.push(format!("graph store missing: {db_path}"));
            }
        }
    } else if let Some(reason) = &meta.ast_graph.skipped_reason {
        warnings.push(format!("AST graph disabled: {reason}"));
    }

    if let (Some(meta_commit), Some(head)) = (&meta.commit_hash, resolve_head(repo_root)) {
        if *meta_commit != head {
            warnings.push(format!(
                "index built at commit {} but HEAD is {}; results may be stale",
                &meta_commit[..meta_commit.len().min(12)],
                &head[..head.len().min(12)]
            ));
        }
    }

    CheckReport {
        ok: problems.is_empty(),
        problems,
        warnings,
        expected: json!({
            "index_schema_version": INDEX_SCHEMA_VERSION,
            "languages": meta.languages.clone(),
            "tables": expected_tables(&meta.languages),
        }),
        found: json!({
            "index_schema_version": meta.index_schema_version,
            "dim": meta.dim,
            "tables": found_tables,
            "astGraph": meta.ast_graph,
        }),
        hint,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn minimal_meta() -> IndexMeta {
        IndexMeta {
            index_schema_version: INDEX_SCHEMA_VERSION,
            dim: 16,
            languages: vec![IndexLang::Ts],
            db_dir: format!("{STORE_DIR}/{VECTOR_DIR}"),
            scan_root: ".".to_string(),
            commit_hash: None,
            ast_graph: AstGraphMeta::default(),
            by_lang: BTreeMap::new(),
        }
    }

    #[test]
    fn meta_json_uses_spec_field_names() {
        let text = serde_json::to_string(&minimal_meta()).unwrap();
        for key in [
            "index_schema_version",
            "dbDir",
            "scanRoot",
            "astGraph",
            "byLang",
        ] {
            assert!(text.contains(key), "missing key {key} in {text}");
        }
    }

    #[test]
    fn selector_auto_follows_preference_order() {
        let available = vec![IndexLang::Rust, IndexLang::Python, IndexLang::Yaml];
        let picked = LangSelector::Auto.resolve(&available).unwrap();
        assert_eq!(picked, vec![IndexLang::Python]);
    }

    #[test]
    fn selector_all_fans_out_and_named_must_exist() {
        let available = vec![IndexLang::Ts, IndexLang::Java];
        assert_eq!(
            LangSelector::All.resolve(&available).unwrap(),
            vec![IndexLang::Ts, IndexLang::Java]
        );
        let err = LangSelector::One(IndexLang::Go)
            .resolve(&available)
            .err()
            .unwrap();
        assert_eq!(err.requested, "go");
        assert_eq!(err.available, vec!["ts", "java"]);
    }

    #[test]
    fn schema_gate_rejects_other_versions() {
        let mut meta = minimal_meta();
        meta.index_schema_version = 2;
        assert!(ensure_compatible(&meta).is_err());
        meta.index_schema_version = INDEX_SCHEMA_VERSION;
        assert!(ensure_compatible(&meta).is_ok());
    }

    #[test]
    fn check_index_reports_missing_meta() {
        let tmp = tempfile::tempdir().unwrap();
        let report = check_index(tmp.path());
        assert!(!report.ok);
        assert!(!report.problems.is_empty());
    }

    #[test]
    fn resolve_head_reads_loose_ref() {
        let tmp = tempfile::tempdir().unwrap();
        let git = tmp.path().join(".git");
        std::fs::create_dir_all(git.join("refs/heads")).unwrap();
        std::fs::write(git.join("HEAD"), "ref: refs/heads/main\n").unwrap();
        std::fs::write(git.join("refs/heads/main"), "abc123def456\n").unwrap();
        assert_eq!(resolve_head(tmp.path()).as_deref(), Some("abc123def456"));
    }

    #[test]
    fn resolve_head_detached() {
        let tmp = tempfile::tempdir().unwrap();
        let git = tmp.path().join(".git");
        std::fs::create_dir_all(&git).unwrap();
        let hash = "a".repeat(40);
        std::fs::write(git.join("HEAD"), format!("{hash}\n")).unwrap();
        assert_eq!(resolve_head(tmp.path()).as_deref(), Some(hash.as_str()));
    }
}
