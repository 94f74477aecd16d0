use anyhow::Result;
use ignore::WalkBuilder;
use serde::Serialize;
use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};

use crate::graph::GraphStore;
use crate::meta::PathEscapesRoot;

// ---------------------------------------------------------------------------
// Repo map: PageRank over the symbol graph, aggregated per file.
//
// Edges come from two relations: calls (caller → every symbol matching the
// callee name) and name references (scope → every symbol matching the name).
// File-scoped origins contribute no edges; only symbols are nodes.
// ---------------------------------------------------------------------------

const PAGERANK_ROUNDS: usize = 10;
const DAMPING: f64 = 0.85;

#[derive(Debug, Clone)]
pub struct RepoMapOptions {
    pub max_files: usize,
    pub max_symbols_per_file: usize,
    pub wiki_dir: Option<PathBuf>,
}

impl Default for RepoMapOptions {
    fn default() -> Self {
        Self {
            max_files: 20,
            max_symbols_per_file: 8,
            wiki_dir: None,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct RankedSymbol {
    pub ref_id: String,
    pub name: String,
    pub kind: String,
    pub start_line: i32,
    pub end_line: i32,
    pub rank: f64,
}

#[derive(Debug, Clone, Serialize)]
pub struct RankedFile {
    pub file: String,
    pub lang: String,
    pub rank: f64,
    pub symbols: Vec<RankedSymbol>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub wiki: Option<String>,
}

pub fn build_repo_map(
    store: &GraphStore,
    repo_root: &Path,
    opts: &RepoMapOptions,
) -> Result<Vec<RankedFile>> {
    let data = store.export()?;
    let n = data.ast_symbol.len();
    if n == 0 {
        return Ok(vec![]);
    }

    let mut index_of: HashMap<&str, usize> = HashMap::with_capacity(n);
    let mut by_name: HashMap<String, Vec<usize>> = HashMap::new();
    for (i, sym) in data.ast_symbol.iter().enumerate() {
        index_of.insert(sym.ref_id.as_str(), i);
        by_name.entry(sym.name.to_lowercase()).or_default().push(i);
    }

    // Directed edges, deduped, self-loops dropped.
    let mut edge_set: HashSet<(usize, usize)> = HashSet::new();
    let link = |from_id: &str, name: &str, edge_set: &mut HashSet<(usize, usize)>| {
        let Some(&from) = index_of.get(from_id) else {
            return;
        };
        if let Some(targets) = by_name.get(&name.to_lowercase()) {
            for &to in targets {
                if from != to {
                    edge_set.insert((from, to));
                }
            }
        }
    };
    for call in &data.ast_call_name {
        link(&call.caller_id, &call.callee_name, &mut edge_set);
    }
    for r in &data.ast_ref_name {
        link(&r.from_id, &r.name, &mut edge_set);
    }

    let mut out_edges: Vec<Vec<usize>> = vec![Vec::new(); n];
    for (from, to) in edge_set {
        out_edges[from].push(to);
    }

    let ranks = page_rank(&out_edges, PAGERANK_ROUNDS, DAMPING);

    // Aggregate per file.
    let mut file_rank: HashMap<&str, f64> = HashMap::new();
    let mut file_symbols: HashMap<&str, Vec<usize>> = HashMap::new();
    let mut file_lang: HashMap<&str, &str> = HashMap::new();
    for (i, sym) in data.ast_symbol.iter().enumerate() {
        *file_rank.entry(sym.file.as_str()).or_insert(0.0) += ranks[i];
        file_symbols.entry(sym.file.as_str()).or_default().push(i);
        file_lang.entry(sym.file.as_str()).or_insert(sym.lang.as_str());
    }

    let mut files: Vec<(&str, f64)> = file_rank.into_iter().collect();
    files.sort_by(|a, b| b.1.partial_cmp(&a.1).unwrap_or(std::cmp::Ordering::Equal));
    files.truncate(opts.max_files);

    let wiki_pages = match &opts.wiki_dir {
        Some(dir) => Some(load_wiki_pages(repo_root, dir)?),
        None => None,
    };

    let mut out: Vec<RankedFile> = Vec::new();
    for (file, rank) in files {
        let mut symbol_indices = file_symbols.remove(file).unwrap_or_default();
        symbol_indices.sort_by(|&a, &b| {
            ranks[b]
                .partial_cmp(&ranks[a])
                .unwrap_or(std::cmp::Ordering::Equal)
        });
        symbol_indices.truncate(opts.max_symbols_per_file);

        let symbols: Vec<RankedSymbol> = symbol_indices
            .iter()
            .map(|&i| {
                let s = &data.ast_symbol[i];
                RankedSymbol {
                    ref_id: s.ref_id.clone(),
                    name: s.name.clone(),
                    kind: s.kind.clone(),
                    start_line: s.start_line,
                    end_line: s.end_line,
                    rank: ranks[i],
                }
            })
            .collect();

        let wiki = wiki_pages
            .as_ref()
            .and_then(|pages| match_wiki_page(pages, file, &symbols));

        out.push(RankedFile {
            file: file.to_string(),
            lang: file_lang.get(file).unwrap_or(&"").to_string(),
            rank,
            symbols,
            wiki,
        });
    }

    Ok(out)
}

/// Standard PageRank with a dangling-node correction: nodes without
/// successors spread their damped rank across every node, so total rank
/// stays at 1 each round.
fn page_rank(out_edges: &[Vec<usize>], rounds: usize, damping: f64) -> Vec<f64> {
    let n = out_edges.len();
    if n == 0 {
        return vec![];
    }
    let base = (1.0 - damping) / n as f64;
    let mut ranks = vec![1.0 / n as f64; n];

    for _ in 0..rounds {
        let mut next = vec![0.0f64; n];
        let mut dangling = 0.0f64;

        for (i, succs) in out_edges.iter().enumerate() {
            if succs.is_empty() {
                dangling += ranks[i];
                continue;
            }
            let share = damping * ranks[i] / succs.len() as f64;
            for &t in succs {
                next[t] += share;
            }
        }

        let dangling_share = damping * dangling / n as f64;
        for r in next.iter_mut() {
            *r += base + dangling_share;
        }
        ranks = next;
    }

    ranks
}

struct WikiPage {
    rel_posix: String,
    stem_lower: String,
    text_lower: String,
}

/// Enumerate `*.md` pages under the wiki dir. The dir must live inside the
/// repository.
fn load_wiki_pages(repo_root: &Path, wiki_dir: &Path) -> Result<Vec<WikiPage>> {
    let abs = if wiki_dir.is_absolute() {
        wiki_dir.to_path_buf()
    } else {
        repo_root.join(wiki_dir)
    };
    let canon_root = repo_root.canonicalize().unwrap_or_else(|_| repo_root.to_path_buf());
    let canon_wiki = abs.canonicalize().unwrap_or(abs.clone());
    if !canon_wiki.starts_with(&canon_root) {
        return Err(PathEscapesRoot(wiki_dir.display().to_string()).into());
    }

    let mut pages = Vec::new();
    let walker = WalkBuilder::new(&canon_wiki)
        .standard_filters(false)
        .hidden(false)
        .build();
    for item in walker {
        let Ok(dent) = item else { continue };
        if !dent.file_type().map(|ft| ft.is_file()).unwrap_or(false) {
            continue;
        }
        let path = dent.into_path();
        if path.extension().and_then(|e| e.to_str()) != Some("md") {
            continue;
        }
        let stem_lower = path
            .file_stem()
            .and_then(|s| s.to_str())
            .unwrap_or("")
            .to_lowercase();
        let text_lower = std::fs::read_to_string(&path)
            .unwrap_or_default()
            .to_lowercase();
        let rel_posix = path
            .strip_prefix(&canon_root)
            .unwrap_or(&path)
            .to_string_lossy()
            .replace('\\', "/");
        pages.push(WikiPage {
            rel_posix,
            stem_lower,
            text_lower,
        });
    }
    pages.sort_by(|a, b| a.rel_posix.cmp(&b.rel_posix));
    Ok(pages)
}

/// Base-name substring first, then any prominent symbol name in the page
/// body.
fn match_wiki_page(
    pages: &[WikiPage],
    file: &str,
    symbols: &[RankedSymbol],
) -> Option<String> {
    let stem = Path::new(file)
        .file_stem()
        .and_then(|s| s.to_str())
        .unwrap_or("")
        .to_lowercase();

    if !stem.is_empty() {
        if let Some(page) = pages
            .iter()
            .find(|p| p.stem_lower.contains(&stem) || stem.contains(&p.stem_lower))
        {
            return Some(page.rel_posix.clone());
        }
    }

    for sym in symbols {
        let name = sym.name.to_lowercase();
        if name.len() <= 3 {
            continue;
        }
        if let Some(page) = pages.iter().find(|p| p.text_lower.contains(&name)) {
            return Some(page.rel_posix.clone());
        }
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::indexer::{index_repository, IndexOptions};
    use crate::meta::store_root;

    #[test]
    fn pagerank_conserves_total_mass() {
        // a → b → c, d dangling.
        let out_edges = vec![vec![1], vec![2], vec![], vec![]];
        let ranks = page_rank(&out_edges, PAGERANK_ROUNDS, DAMPING);
        let total: f64 = ranks.iter().sum();
        assert!((total - 1.0).abs() < 1e-9, "total rank {total}");
        // c receives from b and loses nothing directly: it should outrank a.
        assert!(ranks[2] > ranks[0]);
    }

    #[test]
    fn pagerank_handles_all_dangling_graph() {
        let out_edges = vec![vec![], vec![], vec![]];
        let ranks = page_rank(&out_edges, PAGERANK_ROUNDS, DAMPING);
        let total: f64 = ranks.iter().sum();
        assert!((total - 1.0).abs() < 1e-9);
        for r in &ranks {
            assert!((r - 1.0 / 3.0).abs() < 1e-9);
        }
    }

    fn indexed(files: &[(&str, &str)]) -> (tempfile::TempDir, GraphStore) {
        let tmp = tempfile::tempdir().unwrap();
        for (rel, body) in files {
            let p = tmp.path().join(rel);
            std::fs::create_dir_all(p.parent().unwrap()).unwrap();
            std::fs::write(p, body).unwrap();
        }
        let opts = IndexOptions {
            repo_root: tmp.path().to_path_buf(),
            scan_root: PathBuf::from("."),
            dim: 16,
            overwrite: true,
        };
        index_repository(&opts, None, None).unwrap();
        let store = GraphStore::open_existing(&store_root(tmp.path())).unwrap();
        (tmp, store)
    }

    #[test]
    fn heavily_called_file_ranks_first() {
        let (tmp, store) = indexed(&[
            (
                "core.ts",
                "export function core() {}\n",
            ),
            (
                "a.ts",
                "function ua() { core(); }\n",
            ),
            (
                "b.ts",
                "function ub() { core(); }\nfunction ub2() { core(); }\n",
            ),
        ]);
        let map = build_repo_map(&store, tmp.path(), &RepoMapOptions::default()).unwrap();
        assert!(!map.is_empty());
        assert_eq!(map[0].file, "core.ts");
        assert_eq!(map[0].symbols[0].name, "core");
    }

    #[test]
    fn limits_apply_per_file_and_overall() {
        let (tmp, store) = indexed(&[
            ("a.ts", "function a1() {}\nfunction a2() {}\nfunction a3() {}\n"),
            ("b.ts", "function b1() {}\n"),
        ]);
        let opts = RepoMapOptions {
            max_files: 1,
            max_symbols_per_file: 2,
            wiki_dir: None,
        };
        let map = build_repo_map(&store, tmp.path(), &opts).unwrap();
        assert_eq!(map.len(), 1);
        assert!(map[0].symbols.len() <= 2);
    }

    #[test]
    fn wiki_match_by_base_name_then_symbol() {
        let (tmp, store) = indexed(&[(
            "src/auth.ts",
            "export function handleAuth() {}\n",
        )]);
        std::fs::create_dir_all(tmp.path().join("wiki")).unwrap();
        std::fs::write(tmp.path().join("wiki/auth.md"), "# Auth notes\n").unwrap();

        let opts = RepoMapOptions {
            wiki_dir: Some(PathBuf::from("wiki")),
            ..Default::default()
        };
        let map = build_repo_map(&store, tmp.path(), &opts).unwrap();
        assert_eq!(map[0].wiki.as_deref(), Some("wiki/auth.md"));
    }

    #[test]
    fn wiki_dir_outside_repo_is_rejected() {
        let (tmp, store) = indexed(&[("a.ts", "function a() {}\n")]);
        let opts = RepoMapOptions {
            wiki_dir: Some(PathBuf::from("..")),
            ..Default::default()
        };
        let err = build_repo_map(&store, tmp.path(), &opts).err().unwrap();
        assert!(err.downcast_ref::<PathEscapesRoot>().is_some());
    }
}
