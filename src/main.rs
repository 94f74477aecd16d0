use anyhow::{anyhow, Context, Result};
use clap::{Parser, Subcommand};
use indicatif::{ProgressBar, ProgressStyle};
use serde_json::json;
use std::path::PathBuf;
use std::process::Command as SysCommand;

use codescope::astquery::{AstQuery, ChainDirection};
use codescope::graph::{GraphError, GraphStore};
use codescope::indexer::{index_incremental, index_repository, IndexOptions, DEFAULT_DIM};
use codescope::meta::{
    check_index, ensure_compatible, read_meta, store_root, vector_dir, IndexIncompatible,
    IndexMeta, LangSelector, LanguageUnavailable, PathEscapesRoot,
};
use codescope::parser::IndexLang;
use codescope::repomap::{build_repo_map, RepoMapOptions};
use codescope::search::{search, SearchColumn, SearchHit, SearchMode, SearchParams};
use codescope::semantic::semantic_search;
use codescope::store::{OpenMode, StoreError, VectorStore};

#[derive(Debug, Parser)]
#[command(name = "codescope")]
#[command(version)]
#[command(about = "Content-addressed code intelligence for a Git repository")]
struct Cli {
    /// Repository root.
    #[arg(long, global = true, default_value = ".")]
    path: PathBuf,

    /// Emit JSON instead of the column format.
    #[arg(long, global = true)]
    json: bool,

    #[command(subcommand)]
    cmd: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Build or refresh the index under .git-ai/.
    Index {
        /// Embedding dimension.
        #[arg(long, default_value_t = DEFAULT_DIM)]
        dim: usize,
        /// Drop and rebuild the vector tables.
        #[arg(long)]
        overwrite: bool,
        /// Reindex only the files Git reports as changed.
        #[arg(long, conflicts_with = "overwrite")]
        incremental: bool,
        /// With --incremental, use the staged (cached) diff.
        #[arg(long, requires = "incremental")]
        staged: bool,
        /// Subdirectory to scan (relative to the repo root).
        #[arg(long, default_value = ".")]
        scan_root: PathBuf,
    },
    /// Symbol search.
    Query {
        keyword: String,
        #[arg(short, long, default_value_t = 20)]
        limit: usize,
        /// substring | prefix | wildcard | regex | fuzzy (inferred if absent).
        #[arg(long)]
        mode: Option<String>,
        #[arg(long)]
        case_insensitive: bool,
        #[arg(long)]
        max_candidates: Option<usize>,
        #[arg(long, default_value = "auto")]
        lang: String,
    },
    /// File-name search (same modes and ranking as `query`).
    Files {
        keyword: String,
        #[arg(short, long, default_value_t = 20)]
        limit: usize,
        #[arg(long)]
        mode: Option<String>,
        #[arg(long)]
        case_insensitive: bool,
        #[arg(long)]
        max_candidates: Option<usize>,
        #[arg(long, default_value = "auto")]
        lang: String,
    },
    /// Brute-force semantic search over the quantized chunk vectors.
    Semantic {
        text: String,
        #[arg(short = 'k', long = "topk", default_value_t = 10)]
        top_k: usize,
        #[arg(long, default_value = "auto")]
        lang: String,
    },
    /// AST graph queries.
    Graph {
        #[command(subcommand)]
        op: GraphOp,
    },
    /// PageRank repo map: top files and their top symbols.
    Map {
        #[arg(long, default_value_t = 20)]
        max_files: usize,
        #[arg(long, default_value_t = 8)]
        max_symbols: usize,
        /// Directory of *.md pages to link against (must be inside the repo).
        #[arg(long)]
        wiki_dir: Option<PathBuf>,
    },
    /// Validate the on-disk index and report problems.
    Status,
}

#[derive(Debug, Subcommand)]
enum GraphOp {
    /// Symbols whose name starts with the prefix.
    Find {
        prefix: String,
        #[arg(long, default_value = "auto")]
        lang: String,
    },
    /// Direct children of a file_id or symbol ref_id.
    Children { parent_id: String },
    /// Reference occurrences of a name, joined to their scope.
    Refs {
        name: String,
        #[arg(long, default_value = "auto")]
        lang: String,
    },
    /// Call sites targeting the name.
    Callers {
        name: String,
        #[arg(long, default_value = "auto")]
        lang: String,
    },
    /// Symbols the named callable calls.
    Callees {
        name: String,
        #[arg(long, default_value = "auto")]
        lang: String,
    },
    /// Bounded call chain from the named symbol.
    Chain {
        name: String,
        #[arg(long, default_value = "downstream")]
        direction: String,
        #[arg(long, default_value_t = 3)]
        depth: u32,
        #[arg(long, default_value_t = 2)]
        min_name_len: usize,
        #[arg(long, default_value = "auto")]
        lang: String,
    },
}

fn main() {
    let cli = Cli::parse();
    match run(&cli) {
        Ok(()) => {}
        Err(e) => {
            eprintln!("error: {e:#}");
            std::process::exit(exit_code_for(&e));
        }
    }
}

/// 2 = index incompatible or language unavailable; 1 = everything else.
fn exit_code_for(err: &anyhow::Error) -> i32 {
    if err.downcast_ref::<IndexIncompatible>().is_some()
        || err.downcast_ref::<LanguageUnavailable>().is_some()
    {
        return 2;
    }
    if let Some(store_err) = err.downcast_ref::<StoreError>() {
        if matches!(
            store_err,
            StoreError::MissingTable(_) | StoreError::MissingStore(_)
        ) {
            return 2;
        }
    }
    1
}

fn run(cli: &Cli) -> Result<()> {
    let repo_root = cli
        .path
        .canonicalize()
        .with_context(|| format!("Repo root does not exist: {}", cli.path.display()))?;

    match &cli.cmd {
        Command::Index {
            dim,
            overwrite,
            incremental,
            staged,
            scan_root,
        } => cmd_index(cli, &repo_root, *dim, *overwrite, *incremental, *staged, scan_root),
        Command::Query {
            keyword,
            limit,
            mode,
            case_insensitive,
            max_candidates,
            lang,
        } => cmd_search(
            cli,
            &repo_root,
            keyword,
            *limit,
            mode.as_deref(),
            *case_insensitive,
            *max_candidates,
            lang,
            SearchColumn::Symbol,
        ),
        Command::Files {
            keyword,
            limit,
            mode,
            case_insensitive,
            max_candidates,
            lang,
        } => cmd_search(
            cli,
            &repo_root,
            keyword,
            *limit,
            mode.as_deref(),
            *case_insensitive,
            *max_candidates,
            lang,
            SearchColumn::File,
        ),
        Command::Semantic { text, top_k, lang } => cmd_semantic(cli, &repo_root, text, *top_k, lang),
        Command::Graph { op } => cmd_graph(cli, &repo_root, op),
        Command::Map {
            max_files,
            max_symbols,
            wiki_dir,
        } => cmd_map(cli, &repo_root, *max_files, *max_symbols, wiki_dir.clone()),
        Command::Status => cmd_status(cli, &repo_root),
    }
}

// ---------------------------------------------------------------------------
// index
// ---------------------------------------------------------------------------

fn cmd_index(
    cli: &Cli,
    repo_root: &std::path::Path,
    dim: usize,
    overwrite: bool,
    incremental: bool,
    staged: bool,
    scan_root: &std::path::Path,
) -> Result<()> {
    let opts = IndexOptions {
        repo_root: repo_root.to_path_buf(),
        scan_root: scan_root.to_path_buf(),
        dim,
        overwrite,
    };

    let bar = ProgressBar::new(0);
    bar.set_style(
        ProgressStyle::with_template("{bar:30} {pos}/{len} {msg}")
            .unwrap_or_else(|_| ProgressStyle::default_bar()),
    );
    let mut on_progress = |p: &codescope::indexer::IndexProgress| {
        bar.set_length(p.total as u64);
        bar.set_position(p.processed as u64);
        bar.set_message(p.current.clone());
    };

    let outcome = if incremental {
        let changed = git_changed_files(repo_root, staged)?;
        index_incremental(&opts, &changed, Some(&mut on_progress), None)?
    } else {
        index_repository(&opts, Some(&mut on_progress), None)?
    };
    bar.finish_and_clear();

    if cli.json {
        println!(
            "{}",
            serde_json::to_string_pretty(&json!({
                "filesProcessed": outcome.files_processed,
                "chunksAdded": outcome.chunks_added,
                "refsAdded": outcome.refs_added,
                "aborted": outcome.aborted,
                "meta": outcome.meta,
            }))?
        );
    } else {
        println!(
            "indexed {} files  (+{} chunks, +{} refs)  languages: {}",
            outcome.files_processed,
            outcome.chunks_added,
            outcome.refs_added,
            outcome
                .meta
                .languages
                .iter()
                .map(|l| l.as_str())
                .collect::<Vec<_>>()
                .join(", ")
        );
        if let Some(reason) = &outcome.meta.ast_graph.skipped_reason {
            eprintln!("warning: AST graph skipped: {reason}");
        }
    }
    Ok(())
}

/// Changed-file set from Git: diff against HEAD (or the staged diff), plus
/// untracked files. Deleted files stay in the list so the incremental path
/// can remove their graph tuples.
fn git_changed_files(repo_root: &std::path::Path, staged: bool) -> Result<Vec<String>> {
    let mut files: Vec<String> = Vec::new();

    let diff_args: &[&str] = if staged {
        &["diff", "--name-only", "--cached"]
    } else {
        &["diff", "--name-only", "HEAD"]
    };
    files.extend(run_git(repo_root, diff_args)?);

    if !staged {
        files.extend(run_git(
            repo_root,
            &["ls-files", "--others", "--exclude-standard"],
        )?);
    }

    files.sort();
    files.dedup();
    Ok(files)
}

fn run_git(repo_root: &std::path::Path, args: &[&str]) -> Result<Vec<String>> {
    let output = SysCommand::new("git")
        .arg("-C")
        .arg(repo_root)
        .args(args)
        .output()
        .context("Failed to run git (is it installed?)")?;
    if !output.status.success() {
        return Err(anyhow!(
            "git {} failed: {}",
            args.join(" "),
            String::from_utf8_lossy(&output.stderr).trim()
        ));
    }
    Ok(String::from_utf8_lossy(&output.stdout)
        .lines()
        .map(|l| l.trim().to_string())
        .filter(|l| !l.is_empty())
        .collect())
}

// ---------------------------------------------------------------------------
// query / files
// ---------------------------------------------------------------------------

fn load_compatible_meta(repo_root: &std::path::Path) -> Result<IndexMeta> {
    let meta = read_meta(repo_root)?;
    ensure_compatible(&meta)?;
    Ok(meta)
}

fn resolve_langs(meta: &IndexMeta, lang: &str) -> Result<Vec<IndexLang>> {
    let selector = LangSelector::parse(lang)?;
    Ok(selector.resolve(&meta.languages)?)
}

#[allow(clippy::too_many_arguments)]
fn cmd_search(
    cli: &Cli,
    repo_root: &std::path::Path,
    keyword: &str,
    limit: usize,
    mode: Option<&str>,
    case_insensitive: bool,
    max_candidates: Option<usize>,
    lang: &str,
    column: SearchColumn,
) -> Result<()> {
    let meta = load_compatible_meta(repo_root)?;
    let langs = resolve_langs(&meta, lang)?;

    let mode = match mode {
        Some(m) => Some(
            SearchMode::parse(m).ok_or_else(|| anyhow!("unknown mode: {m} (substring|prefix|wildcard|regex|fuzzy)"))?,
        ),
        None => None,
    };

    let store = VectorStore::open(&vector_dir(repo_root), meta.dim, OpenMode::OpenOnly, &langs)?;
    let params = SearchParams {
        query: keyword.to_string(),
        mode,
        case_insensitive,
        limit,
        max_candidates,
        column,
    };
    let hits = search(&store, &langs, &params)?;

    if cli.json {
        println!("{}", serde_json::to_string_pretty(&hits)?);
    } else {
        print_search_hits(&hits);
    }
    Ok(())
}

fn print_search_hits(hits: &[SearchHit]) {
    if hits.is_empty() {
        println!("no matches");
        return;
    }
    for h in hits {
        println!(
            "{:<8} {:<30} {:<10} {}:{}-{}  {}",
            h.lang.as_str(),
            h.row.symbol,
            h.row.kind,
            h.row.file,
            h.row.start_line,
            h.row.end_line,
            h.row.signature
        );
    }
}

// ---------------------------------------------------------------------------
// semantic
// ---------------------------------------------------------------------------

fn cmd_semantic(
    cli: &Cli,
    repo_root: &std::path::Path,
    text: &str,
    top_k: usize,
    lang: &str,
) -> Result<()> {
    let meta = load_compatible_meta(repo_root)?;
    let langs = resolve_langs(&meta, lang)?;
    let store = VectorStore::open(&vector_dir(repo_root), meta.dim, OpenMode::OpenOnly, &langs)?;

    let hits = semantic_search(&store, text, meta.dim, top_k, &langs)?;

    if cli.json {
        println!("{}", serde_json::to_string_pretty(&hits)?);
    } else if hits.is_empty() {
        println!("no matches");
    } else {
        for h in &hits {
            let first_ref = h
                .refs
                .first()
                .map(|r| format!("{} {}:{}", r.symbol, r.file, r.start_line))
                .unwrap_or_else(|| "-".to_string());
            println!(
                "{:>7.4} {:<8} {}  {}",
                h.score,
                h.lang.as_str(),
                &h.content_hash[..12],
                first_ref
            );
        }
    }
    Ok(())
}

// ---------------------------------------------------------------------------
// graph
// ---------------------------------------------------------------------------

fn open_graph(repo_root: &std::path::Path, meta: &IndexMeta) -> Result<GraphStore> {
    if !meta.ast_graph.enabled {
        let reason = meta
            .ast_graph
            .skipped_reason
            .clone()
            .unwrap_or_else(|| "graph was not built".to_string());
        return Err(GraphError::Unavailable(reason).into());
    }
    Ok(GraphStore::open_existing(&store_root(repo_root))?)
}

fn cmd_graph(cli: &Cli, repo_root: &std::path::Path, op: &GraphOp) -> Result<()> {
    let meta = load_compatible_meta(repo_root)?;
    let graph = open_graph(repo_root, &meta)?;
    let query = AstQuery::load(&graph)?;

    match op {
        GraphOp::Find { prefix, lang } => {
            let langs = resolve_langs(&meta, lang)?;
            let rows = query.find(prefix, &langs);
            emit(cli, &rows, |r| {
                format!(
                    "{:<8} {:<30} {:<10} {}:{}-{}",
                    r.lang, r.name, r.kind, r.file, r.start_line, r.end_line
                )
            })
        }
        GraphOp::Children { parent_id } => {
            let rows = query.children(parent_id);
            emit(cli, &rows, |r| {
                format!(
                    "{:<8} {:<30} {:<10} {}:{}-{}",
                    r.lang, r.name, r.kind, r.file, r.start_line, r.end_line
                )
            })
        }
        GraphOp::Refs { name, lang } => {
            let langs = resolve_langs(&meta, lang)?;
            let rows = query.find_references(name, &langs);
            emit(cli, &rows, |r| {
                format!(
                    "{:<8} {:<12} {:<30} {}:{}:{}  (in {} {})",
                    r.lang, r.ref_kind, r.name, r.file, r.line, r.col, r.from_kind, r.from_name
                )
            })
        }
        GraphOp::Callers { name, lang } => {
            let langs = resolve_langs(&meta, lang)?;
            let rows = query.callers(name, &langs);
            emit(cli, &rows, |r| {
                format!(
                    "{:<8} {:<30} {:<10} {}:{}:{} -> {}",
                    r.lang, r.caller_name, r.caller_kind, r.file, r.line, r.col, r.callee_name
                )
            })
        }
        GraphOp::Callees { name, lang } => {
            let langs = resolve_langs(&meta, lang)?;
            let rows = query.callees(name, &langs);
            emit(cli, &rows, |r| {
                format!(
                    "{:<8} {:<30} -> {:<30} {}:{}-{}",
                    r.callee.lang,
                    r.caller_name,
                    r.callee.name,
                    r.callee.file,
                    r.callee.start_line,
                    r.callee.end_line
                )
            })
        }
        GraphOp::Chain {
            name,
            direction,
            depth,
            min_name_len,
            lang,
        } => {
            let langs = resolve_langs(&meta, lang)?;
            let dir = ChainDirection::parse(direction)
                .ok_or_else(|| anyhow!("direction must be downstream or upstream"))?;
            let rows = query.call_chain(name, dir, *depth, &langs, *min_name_len);
            emit(cli, &rows, |r| {
                format!(
                    "{:<8} depth {:<2} {:<30} -> {}",
                    r.lang, r.depth, r.caller_name, r.callee_name
                )
            })
        }
    }
}

fn emit<T: serde::Serialize>(cli: &Cli, rows: &[T], line: impl Fn(&T) -> String) -> Result<()> {
    if cli.json {
        println!("{}", serde_json::to_string_pretty(rows)?);
    } else if rows.is_empty() {
        println!("no rows");
    } else {
        for row in rows {
            println!("{}", line(row));
        }
    }
    Ok(())
}

// ---------------------------------------------------------------------------
// map / status
// ---------------------------------------------------------------------------

fn cmd_map(
    cli: &Cli,
    repo_root: &std::path::Path,
    max_files: usize,
    max_symbols: usize,
    wiki_dir: Option<PathBuf>,
) -> Result<()> {
    let meta = load_compatible_meta(repo_root)?;
    let graph = open_graph(repo_root, &meta)?;

    if let Some(dir) = &wiki_dir {
        // Fail fast on escapes before any ranking work.
        let abs = if dir.is_absolute() {
            dir.clone()
        } else {
            repo_root.join(dir)
        };
        let canon = abs.canonicalize().unwrap_or(abs);
        if !canon.starts_with(repo_root) {
            return Err(PathEscapesRoot(dir.display().to_string()).into());
        }
    }

    let opts = RepoMapOptions {
        max_files,
        max_symbols_per_file: max_symbols,
        wiki_dir,
    };
    let map = build_repo_map(&graph, repo_root, &opts)?;

    if cli.json {
        println!("{}", serde_json::to_string_pretty(&map)?);
    } else {
        for file in &map {
            let wiki = file
                .wiki
                .as_ref()
                .map(|w| format!("  [wiki: {w}]"))
                .unwrap_or_default();
            println!("{:<10.6} {}{}", file.rank, file.file, wiki);
            for sym in &file.symbols {
                println!("    {:<10.6} {:<10} {}", sym.rank, sym.kind, sym.name);
            }
        }
    }
    Ok(())
}

fn cmd_status(cli: &Cli, repo_root: &std::path::Path) -> Result<()> {
    let report = check_index(repo_root);

    if cli.json {
        println!("{}", serde_json::to_string_pretty(&report)?);
    } else {
        println!("ok: {}", report.ok);
        for p in &report.problems {
            println!("problem: {p}");
        }
        for w in &report.warnings {
            println!("warning: {w}");
        }
        if let Some(hint) = &report.hint {
            println!("hint: {hint}");
        }
    }

    if !report.ok {
        return Err(IndexIncompatible("index check failed".to_string()).into());
    }
    Ok(())
}
