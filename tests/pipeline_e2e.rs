use std::path::{Path, PathBuf};

use codescope::astquery::{AstQuery, ChainDirection};
use codescope::graph::GraphStore;
use codescope::indexer::{index_repository, IndexOptions};
use codescope::meta::{read_meta, store_root, vector_dir, LangSelector};
use codescope::parser::IndexLang;
use codescope::search::{search, SearchColumn, SearchMode, SearchParams};
use codescope::semantic::semantic_search;
use codescope::store::{OpenMode, VectorStore};

fn write(root: &Path, rel: &str, body: &str) {
    let p = root.join(rel);
    std::fs::create_dir_all(p.parent().unwrap()).unwrap();
    std::fs::write(p, body).unwrap();
}

fn index(root: &Path, dim: usize, overwrite: bool) {
    let opts = IndexOptions {
        repo_root: root.to_path_buf(),
        scan_root: PathBuf::from("."),
        dim,
        overwrite,
    };
    index_repository(&opts, None, None).unwrap();
}

fn open_store(root: &Path, dim: usize, langs: &[IndexLang]) -> VectorStore {
    VectorStore::open(&vector_dir(root), dim, OpenMode::OpenOnly, langs).unwrap()
}

fn params(query: &str) -> SearchParams {
    SearchParams {
        query: query.to_string(),
        mode: None,
        case_insensitive: false,
        limit: 20,
        max_candidates: None,
        column: SearchColumn::Symbol,
    }
}

#[test]
fn symbol_search_on_a_single_ts_file() {
    let tmp = tempfile::tempdir().unwrap();
    write(
        tmp.path(),
        "a.ts",
        "export function handleAuth(req) { return parse(req); }\nclass Project {}\n",
    );
    index(tmp.path(), 16, true);

    let store = open_store(tmp.path(), 16, &[IndexLang::Ts]);
    let hits = search(&store, &[IndexLang::Ts], &params("class Project")).unwrap();

    assert_eq!(hits.len(), 1);
    let row = &hits[0].row;
    assert_eq!(row.symbol, "Project");
    assert_eq!(row.kind, "class");
    assert_eq!(row.file, "a.ts");
    assert_eq!(row.start_line, 2);
}

#[test]
fn fuzzy_query_finds_handle_auth() {
    let tmp = tempfile::tempdir().unwrap();
    write(
        tmp.path(),
        "a.ts",
        "export function handleAuth(req) { return parse(req); }\nclass Project {}\n",
    );
    index(tmp.path(), 16, true);

    let store = open_store(tmp.path(), 16, &[IndexLang::Ts]);
    let mut p = params("hAu");
    p.mode = Some(SearchMode::Fuzzy);
    let hits = search(&store, &[IndexLang::Ts], &p).unwrap();

    assert!(!hits.is_empty());
    assert_eq!(hits[0].row.symbol, "handleAuth");
    assert!(hits[0].score > 0);
}

#[test]
fn semantic_query_attaches_the_auth_ref() {
    let tmp = tempfile::tempdir().unwrap();
    write(
        tmp.path(),
        "a.ts",
        "export function handleAuth(req) { return parse(req); }\nclass Project {}\n",
    );
    index(tmp.path(), 16, true);

    let store = open_store(tmp.path(), 16, &[IndexLang::Ts]);
    let hits = semantic_search(&store, "authentication handler", 16, 1, &[IndexLang::Ts]).unwrap();

    assert_eq!(hits.len(), 1);
    assert!(hits[0]
        .refs
        .iter()
        .any(|r| r.symbol == "handleAuth"));
}

#[test]
fn graph_callers_and_upstream_chain() {
    let tmp = tempfile::tempdir().unwrap();
    write(tmp.path(), "a.ts", "function a() { b(); }\nfunction b() {}\n");
    index(tmp.path(), 16, true);

    let graph = GraphStore::open_existing(&store_root(tmp.path())).unwrap();
    let query = AstQuery::load(&graph).unwrap();

    let callers = query.callers("b", &[IndexLang::Ts]);
    assert_eq!(callers.len(), 1);
    assert_eq!(callers[0].caller_name, "a");

    let chain = query.call_chain("b", ChainDirection::Upstream, 2, &[IndexLang::Ts], 0);
    assert!(chain
        .iter()
        .any(|r| r.caller_name == "a" && r.callee_name == "b" && r.depth == 1));
}

#[test]
fn multi_language_selector_semantics() {
    let tmp = tempfile::tempdir().unwrap();
    write(tmp.path(), "a.java", "class X {}\n");
    write(tmp.path(), "a.py", "class Y: pass\n");
    index(tmp.path(), 16, true);

    let meta = read_meta(tmp.path()).unwrap();
    assert!(meta.languages.contains(&IndexLang::Java));
    assert!(meta.languages.contains(&IndexLang::Python));

    // lang=python: indexed, but X lives in Java, so the result is empty.
    let py = LangSelector::One(IndexLang::Python)
        .resolve(&meta.languages)
        .unwrap();
    let store = open_store(tmp.path(), 16, &py);
    let hits = search(&store, &py, &params("X")).unwrap();
    assert!(hits.is_empty());

    // lang=all: one row, from the Java table.
    let all = LangSelector::All.resolve(&meta.languages).unwrap();
    let store = open_store(tmp.path(), 16, &all);
    let hits = search(&store, &all, &params("X")).unwrap();
    assert_eq!(hits.len(), 1);
    assert_eq!(hits[0].lang, IndexLang::Java);

    // lang=ts was never indexed here: unavailable, with the list attached.
    let err = LangSelector::One(IndexLang::Ts)
        .resolve(&meta.languages)
        .err()
        .unwrap();
    assert!(err.available.contains(&"java".to_string()));
}

#[test]
fn gitignore_toggling_never_duplicates_chunks() {
    let tmp = tempfile::tempdir().unwrap();
    write(tmp.path(), "main.ts", "export function keep() {}\n");
    write(tmp.path(), "gen/out.ts", "export function generated() {}\n");
    write(tmp.path(), ".gitignore", "gen/\n");

    index(tmp.path(), 16, true);
    let store = open_store(tmp.path(), 16, &[IndexLang::Ts]);
    let before = store.chunk_hashes(IndexLang::Ts).unwrap();
    assert_eq!(before.len(), 1);
    drop(store);

    // Remove the ignore line and reindex additively.
    write(tmp.path(), ".gitignore", "");
    index(tmp.path(), 16, false);

    let store = open_store(tmp.path(), 16, &[IndexLang::Ts]);
    let after = store.chunk_hashes(IndexLang::Ts).unwrap();
    assert_eq!(after.len(), 2);
    assert_eq!(store.count_rows("chunks_ts").unwrap(), 2);
    assert!(after.is_superset(&before));
}

#[test]
fn reindex_produces_identical_hash_sets() {
    let tmp = tempfile::tempdir().unwrap();
    write(
        tmp.path(),
        "lib.rs",
        "pub struct Engine;\nimpl Engine {\n    pub fn start(&self) {}\n}\n",
    );
    index(tmp.path(), 16, true);
    let store = open_store(tmp.path(), 16, &[IndexLang::Rust]);
    let first = store.chunk_hashes(IndexLang::Rust).unwrap();
    drop(store);

    index(tmp.path(), 16, true);
    let store = open_store(tmp.path(), 16, &[IndexLang::Rust]);
    let second = store.chunk_hashes(IndexLang::Rust).unwrap();
    assert_eq!(first, second);
}
