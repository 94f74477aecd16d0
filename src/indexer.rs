use anyhow::{Context, Result};
use rayon::prelude::*;
use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet};
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};

use crate::embedding::{hash_embedding, quantize_sq8, qvec_to_b64};
use crate::extract::{ParsedFile, SymbolKind};
use crate::graph::{
    CallTuple, ContainsTuple, ExtendsTuple, FileTuple, GraphData, GraphStore, ImplementsTuple,
    RefTuple, SymbolTuple,
};
use crate::ids::{chunk_text, content_hash, file_id, ref_id};
use crate::meta::{
    resolve_head, store_root, vector_dir, write_meta, AstGraphMeta, IndexIncompatible, IndexMeta,
    LangCounts, INDEX_SCHEMA_VERSION, STORE_DIR, VECTOR_DIR,
};
use crate::parser::{parse_source, route_path, IndexLang};
use crate::scanner::{discover_files, ScanOptions, SourceFile};
use crate::store::{ChunkRow, OpenMode, RefRow, VectorStore};

pub const DEFAULT_DIM: usize = 256;

#[derive(Debug, Clone)]
pub struct IndexOptions {
    pub repo_root: PathBuf,
    /// Scan root, relative to the repo root.
    pub scan_root: PathBuf,
    pub dim: usize,
    pub overwrite: bool,
}

impl IndexOptions {
    pub fn new(repo_root: PathBuf) -> Self {
        Self {
            repo_root,
            scan_root: PathBuf::from("."),
            dim: DEFAULT_DIM,
            overwrite: false,
        }
    }
}

#[derive(Debug, Clone)]
pub struct IndexProgress {
    pub total: usize,
    pub processed: usize,
    pub current: String,
}

#[derive(Debug)]
pub struct IndexOutcome {
    pub meta: IndexMeta,
    pub files_processed: usize,
    pub chunks_added: usize,
    pub refs_added: usize,
    pub aborted: bool,
}

/// One parsed file, ready for the single-writer assembly pass.
struct FileBatch {
    rel_posix: String,
    lang: IndexLang,
    parsed: ParsedFile,
}

/// Rows and tuples accumulated across a run. Writes to the stores happen in
/// bulk at the end, so an abort mid-run never leaves partial tables behind.
#[derive(Default)]
struct Accumulator {
    chunks: HashMap<IndexLang, Vec<ChunkRow>>,
    refs: HashMap<IndexLang, Vec<RefRow>>,
    graph: GraphData,
    by_lang: BTreeMap<String, LangCounts>,
}

/// Full (re)build of the index for a repository.
pub fn index_repository(
    opts: &IndexOptions,
    mut on_progress: Option<&mut dyn FnMut(&IndexProgress)>,
    abort: Option<&AtomicBool>,
) -> Result<IndexOutcome> {
    let scan = ScanOptions {
        repo_root: opts.repo_root.clone(),
        scan_root: opts.scan_root.clone(),
    };
    let files = discover_files(&scan)?;
    let languages = distinct_languages(&files);

    let prior = load_prior_meta(opts)?;
    let mut all_languages: BTreeSet<IndexLang> = languages.iter().copied().collect();
    if let Some(prior) = &prior {
        if !opts.overwrite {
            all_languages.extend(prior.languages.iter().copied());
        }
    }

    let mode = if opts.overwrite {
        OpenMode::Overwrite
    } else {
        OpenMode::CreateIfMissing
    };
    let mut store = VectorStore::open(&vector_dir(&opts.repo_root), opts.dim, mode, &languages)
        .context("Failed to open vector store")?;

    let mut existing = preload_hashes(&store, &languages, opts.overwrite)?;

    let batches = parse_in_parallel(&files, abort);

    let mut acc = Accumulator::default();
    let total = batches.len();
    let mut processed = 0usize;
    let mut aborted = abort.map(|a| a.load(Ordering::Relaxed)).unwrap_or(false);

    for batch in &batches {
        if abort.map(|a| a.load(Ordering::Relaxed)).unwrap_or(false) {
            aborted = true;
            break;
        }
        assemble_file(batch, opts.dim, &mut existing, &mut acc);
        processed += 1;
        if let Some(cb) = on_progress.as_deref_mut() {
            cb(&IndexProgress {
                total,
                processed,
                current: batch.rel_posix.clone(),
            });
        }
    }

    flush_vector_rows(&mut store, &acc)?;

    let ast_graph = write_graph_full(opts, &acc.graph);

    let meta = IndexMeta {
        index_schema_version: INDEX_SCHEMA_VERSION,
        dim: opts.dim,
        languages: all_languages.into_iter().collect(),
        db_dir: format!("{STORE_DIR}/{VECTOR_DIR}"),
        scan_root: opts.scan_root.to_string_lossy().replace('\\', "/"),
        commit_hash: resolve_head(&opts.repo_root),
        ast_graph,
        by_lang: acc.by_lang.clone(),
    };
    write_meta(&opts.repo_root, &meta)?;

    Ok(outcome(meta, processed, &acc, aborted))
}

/// Incremental path: the caller supplies the changed-file set (repo-relative
/// POSIX paths). Files that no longer exist are removed from the graph;
/// changed files get a targeted `remove` + `put`. Vector rows belonging to
/// obsolete ref ids are left in place; `--overwrite` is the correctness path
/// after schema-level changes.
pub fn index_incremental(
    opts: &IndexOptions,
    changed: &[String],
    mut on_progress: Option<&mut dyn FnMut(&IndexProgress)>,
    abort: Option<&AtomicBool>,
) -> Result<IndexOutcome> {
    let prior = load_prior_meta(opts)?;

    let mut live: Vec<SourceFile> = Vec::new();
    let mut removed: Vec<String> = Vec::new();
    for raw in changed {
        let rel_posix = raw.replace('\\', "/");
        let ext = crate::parser::path_ext_lower(&rel_posix);
        if !crate::parser::INDEXED_EXTENSIONS.contains(&ext.as_str()) {
            continue;
        }
        let abs = opts.repo_root.join(&rel_posix);
        if abs.is_file() {
            live.push(SourceFile {
                abs_path: abs,
                rel_posix,
            });
        } else {
            removed.push(rel_posix);
        }
    }
    live.sort_by(|a, b| a.rel_posix.cmp(&b.rel_posix));

    let languages = distinct_languages(&live);
    let mut all_languages: BTreeSet<IndexLang> = languages.iter().copied().collect();
    if let Some(prior) = &prior {
        all_languages.extend(prior.languages.iter().copied());
    }

    let mut store = VectorStore::open(
        &vector_dir(&opts.repo_root),
        opts.dim,
        OpenMode::CreateIfMissing,
        &languages,
    )
    .context("Failed to open vector store")?;

    let mut existing = preload_hashes(&store, &languages, false)?;

    let batches = parse_in_parallel(&live, abort);

    let mut acc = Accumulator::default();
    let mut per_file_graph: Vec<(String, GraphData)> = Vec::new();
    let total = batches.len();
    let mut processed = 0usize;
    let mut aborted = abort.map(|a| a.load(Ordering::Relaxed)).unwrap_or(false);

    for batch in &batches {
        if abort.map(|a| a.load(Ordering::Relaxed)).unwrap_or(false) {
            aborted = true;
            break;
        }
        let before = std::mem::take(&mut acc.graph);
        assemble_file(batch, opts.dim, &mut existing, &mut acc);
        let file_graph = std::mem::replace(&mut acc.graph, before);
        per_file_graph.push((batch.rel_posix.clone(), file_graph));
        processed += 1;
        if let Some(cb) = on_progress.as_deref_mut() {
            cb(&IndexProgress {
                total,
                processed,
                current: batch.rel_posix.clone(),
            });
        }
    }

    flush_vector_rows(&mut store, &acc)?;

    let ast_graph = write_graph_incremental(opts, &removed, &per_file_graph);

    let meta = IndexMeta {
        index_schema_version: INDEX_SCHEMA_VERSION,
        dim: opts.dim,
        languages: all_languages.into_iter().collect(),
        db_dir: format!("{STORE_DIR}/{VECTOR_DIR}"),
        scan_root: prior
            .as_ref()
            .map(|p| p.scan_root.clone())
            .unwrap_or_else(|| ".".to_string()),
        commit_hash: resolve_head(&opts.repo_root),
        ast_graph,
        by_lang: acc.by_lang.clone(),
    };
    write_meta(&opts.repo_root, &meta)?;

    Ok(outcome(meta, processed, &acc, aborted))
}

fn outcome(meta: IndexMeta, processed: usize, acc: &Accumulator, aborted: bool) -> IndexOutcome {
    IndexOutcome {
        meta,
        files_processed: processed,
        chunks_added: acc.by_lang.values().map(|c| c.chunks_added).sum(),
        refs_added: acc.by_lang.values().map(|c| c.refs_added).sum(),
        aborted,
    }
}

fn distinct_languages(files: &[SourceFile]) -> Vec<IndexLang> {
    let set: BTreeSet<IndexLang> = files.iter().map(|f| route_path(&f.rel_posix)).collect();
    set.into_iter().collect()
}

/// Refuse to mix dims or schema versions into an existing store.
fn load_prior_meta(opts: &IndexOptions) -> Result<Option<IndexMeta>> {
    if !crate::meta::meta_path(&opts.repo_root).exists() {
        return Ok(None);
    }
    let prior = crate::meta::read_meta(&opts.repo_root)?;
    if !opts.overwrite {
        if prior.index_schema_version != INDEX_SCHEMA_VERSION {
            return Err(IndexIncompatible(format!(
                "existing index has schema v{}; run `index --overwrite`",
                prior.index_schema_version
            ))
            .into());
        }
        if prior.dim != opts.dim {
            return Err(IndexIncompatible(format!(
                "existing index has dim {}, requested {}; run `index --overwrite`",
                prior.dim, opts.dim
            ))
            .into());
        }
    }
    Ok(Some(prior))
}

fn preload_hashes(
    store: &VectorStore,
    languages: &[IndexLang],
    overwrite: bool,
) -> Result<HashMap<IndexLang, HashSet<String>>> {
    let mut out: HashMap<IndexLang, HashSet<String>> = HashMap::new();
    for &lang in languages {
        let set = if overwrite {
            HashSet::new()
        } else {
            store.chunk_hashes(lang)?
        };
        out.insert(lang, set);
    }
    Ok(out)
}

/// Parse fan-out. Parsing is pure per-file work; all store mutation stays on
/// the calling thread. Result order follows the input (rayon preserves it).
fn parse_in_parallel(files: &[SourceFile], abort: Option<&AtomicBool>) -> Vec<FileBatch> {
    files
        .par_iter()
        .filter_map(|f| {
            if abort.map(|a| a.load(Ordering::Relaxed)).unwrap_or(false) {
                return None;
            }
            let meta = std::fs::metadata(&f.abs_path).ok()?;
            if !meta.is_file() {
                return None;
            }
            let raw = std::fs::read(&f.abs_path).ok()?;
            let source = String::from_utf8_lossy(&raw).into_owned();
            let parsed = parse_source(&f.rel_posix, &source);
            Some(FileBatch {
                rel_posix: f.rel_posix.clone(),
                lang: route_path(&f.rel_posix),
                parsed,
            })
        })
        .collect()
}

/// Turn one parsed file into chunk rows, ref rows and graph tuples.
///
/// The dedup set is consulted and updated here, on the single writer thread,
/// so a hash produced by two files in the same run still yields one chunk.
fn assemble_file(
    batch: &FileBatch,
    dim: usize,
    existing: &mut HashMap<IndexLang, HashSet<String>>,
    acc: &mut Accumulator,
) {
    let rel = &batch.rel_posix;
    let lang = batch.lang;
    let lang_str = lang.as_str().to_string();
    let fid = file_id(rel);

    acc.graph.ast_file.push(FileTuple {
        file_id: fid.clone(),
        file: rel.clone(),
        lang: lang_str.clone(),
    });

    let counts = acc.by_lang.entry(lang_str.clone()).or_default();
    let chunk_rows = acc.chunks.entry(lang).or_default();
    let ref_rows = acc.refs.entry(lang).or_default();
    let hashes = existing.entry(lang).or_default();

    // (ref_id, start, end) for every callable in the file, used to attribute
    // references to their smallest enclosing function/method.
    let mut callables: Vec<(String, u32, u32)> = Vec::new();
    let mut symbol_ids: Vec<String> = Vec::with_capacity(batch.parsed.symbols.len());

    for sym in &batch.parsed.symbols {
        let hash = content_hash(rel, sym);
        let rid = ref_id(rel, sym, &hash);
        symbol_ids.push(rid.clone());

        acc.graph.ast_symbol.push(SymbolTuple {
            ref_id: rid.clone(),
            file: rel.clone(),
            lang: lang_str.clone(),
            name: sym.name.clone(),
            kind: sym.kind.as_str().to_string(),
            signature: sym.signature.clone(),
            start_line: sym.start_line as i32,
            end_line: sym.end_line as i32,
        });

        let parent = match sym.container {
            Some(idx) => symbol_ids[idx].clone(),
            None => fid.clone(),
        };
        acc.graph.ast_contains.push(ContainsTuple {
            parent_id: parent,
            child_id: rid.clone(),
        });

        if sym.kind == SymbolKind::Class {
            for super_name in &sym.extends {
                acc.graph.ast_extends_name.push(ExtendsTuple {
                    sub_id: rid.clone(),
                    super_name: super_name.clone(),
                });
            }
            for iface in &sym.implements {
                acc.graph.ast_implements_name.push(ImplementsTuple {
                    sub_id: rid.clone(),
                    iface_name: iface.clone(),
                });
            }
        }

        if sym.kind.is_callable() {
            callables.push((rid.clone(), sym.start_line, sym.end_line));
        }

        if !hashes.contains(&hash) {
            let text = chunk_text(rel, sym);
            let quantized = quantize_sq8(&hash_embedding(&text, dim));
            chunk_rows.push(ChunkRow {
                content_hash: hash.clone(),
                text,
                dim: dim as i32,
                scale: quantized.scale,
                qvec_b64: qvec_to_b64(&quantized.q),
            });
            hashes.insert(hash.clone());
            counts.chunks_added += 1;
        }

        ref_rows.push(RefRow {
            ref_id: rid,
            content_hash: hash,
            file: rel.clone(),
            symbol: sym.name.clone(),
            kind: sym.kind.as_str().to_string(),
            signature: sym.signature.clone(),
            start_line: sym.start_line as i32,
            end_line: sym.end_line as i32,
        });
        counts.refs_added += 1;
    }

    // Smallest enclosing callable wins: sort by span ascending, first hit.
    callables.sort_by_key(|(_, start, end)| (end - start, *start));

    for r in &batch.parsed.refs {
        let from_id = callables
            .iter()
            .find(|(_, start, end)| *start <= r.line && r.line <= *end)
            .map(|(id, _, _)| id.clone())
            .unwrap_or_else(|| fid.clone());

        acc.graph.ast_ref_name.push(RefTuple {
            from_id: from_id.clone(),
            from_lang: lang_str.clone(),
            name: r.name.clone(),
            ref_kind: r.kind.as_str().to_string(),
            file: rel.clone(),
            line: r.line as i32,
            col: r.col as i32,
        });

        if matches!(r.kind, crate::extract::RefKind::Call | crate::extract::RefKind::New) {
            acc.graph.ast_call_name.push(CallTuple {
                caller_id: from_id,
                caller_lang: lang_str.clone(),
                callee_name: r.name.clone(),
                file: rel.clone(),
                line: r.line as i32,
                col: r.col as i32,
            });
        }
    }
}

fn flush_vector_rows(store: &mut VectorStore, acc: &Accumulator) -> Result<()> {
    for (&lang, rows) in &acc.chunks {
        store
            .append_chunks(lang, rows)
            .with_context(|| format!("Failed to write chunks_{}", lang.as_str()))?;
    }
    for (&lang, rows) in &acc.refs {
        store
            .append_refs(lang, rows)
            .with_context(|| format!("Failed to write refs_{}", lang.as_str()))?;
    }
    Ok(())
}

/// Graph write for a full build: one `replace` transaction. Backend failure
/// downgrades the graph, never the run.
fn write_graph_full(opts: &IndexOptions, data: &GraphData) -> AstGraphMeta {
    match GraphStore::open(&store_root(&opts.repo_root)) {
        Ok(mut graph) => match graph.replace(data) {
            Ok(()) => AstGraphMeta {
                enabled: true,
                engine: Some(graph.engine().to_string()),
                db_path: Some(graph.db_path().to_string_lossy().replace('\\', "/")),
                counts: graph.counts().ok(),
                skipped_reason: None,
            },
            Err(e) => graph_skipped(format!("graph write failed: {e}")),
        },
        Err(e) => graph_skipped(e.to_string()),
    }
}

fn write_graph_incremental(
    opts: &IndexOptions,
    removed: &[String],
    per_file: &[(String, GraphData)],
) -> AstGraphMeta {
    match GraphStore::open(&store_root(&opts.repo_root)) {
        Ok(mut graph) => {
            for file in removed {
                if let Err(e) = graph.remove_file(file) {
                    return graph_skipped(format!("graph remove failed for {file}: {e}"));
                }
            }
            for (file, data) in per_file {
                if let Err(e) = graph.put_file(file, data) {
                    return graph_skipped(format!("graph put failed for {file}: {e}"));
                }
            }
            AstGraphMeta {
                enabled: true,
                engine: Some(graph.engine().to_string()),
                db_path: Some(graph.db_path().to_string_lossy().replace('\\', "/")),
                counts: graph.counts().ok(),
                skipped_reason: None,
            }
        }
        Err(e) => graph_skipped(e.to_string()),
    }
}

fn graph_skipped(reason: String) -> AstGraphMeta {
    crate::debug_log!("[codescope] AST graph skipped: {reason}");
    AstGraphMeta {
        enabled: false,
        engine: None,
        db_path: None,
        counts: None,
        skipped_reason: Some(reason),
    }
}
