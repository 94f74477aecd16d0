use anyhow::Result;
use regex::Regex;
use serde::Serialize;
use std::sync::OnceLock;

use crate::parser::IndexLang;
use crate::store::{RefRow, VectorStore};

// ---------------------------------------------------------------------------
// Symbol search.
//
// Two stages, like every query in this crate: a coarse store-side pre-filter
// (`LIKE`, recall-only, never correctness) narrows candidates, then the
// mode-specific matcher refines and ranks in memory.
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SearchMode {
    Substring,
    Prefix,
    Wildcard,
    Regex,
    Fuzzy,
}

impl SearchMode {
    pub fn parse(s: &str) -> Option<Self> {
        Some(match s {
            "substring" => SearchMode::Substring,
            "prefix" => SearchMode::Prefix,
            "wildcard" => SearchMode::Wildcard,
            "regex" => SearchMode::Regex,
            "fuzzy" => SearchMode::Fuzzy,
            _ => return None,
        })
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            SearchMode::Substring => "substring",
            SearchMode::Prefix => "prefix",
            SearchMode::Wildcard => "wildcard",
            SearchMode::Regex => "regex",
            SearchMode::Fuzzy => "fuzzy",
        }
    }
}

/// Explicit mode wins; glob metacharacters imply wildcard; default substring.
pub fn infer_mode(query: &str, explicit: Option<SearchMode>) -> SearchMode {
    if let Some(mode) = explicit {
        return mode;
    }
    if query.contains('*') || query.contains('?') {
        SearchMode::Wildcard
    } else {
        SearchMode::Substring
    }
}

fn keyword_prefix_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    // Longest alternatives first: the regex engine takes the leftmost
    // alternative, so `export async function` must appear before `export`.
    RE.get_or_init(|| {
        Regex::new(
            r"(?i)^(?:export\s+async\s+function|export\s+function|async\s+function|export\s+const|export\s+let|export\s+var|class|interface|type|enum|struct|trait|function|method|def|func|fn|const|let|var|val|public|private|protected|static|readonly|abstract)\s+",
        )
        .unwrap()
    })
}

/// Strip leading language keywords so `"class Project"` searches `Project`.
/// Iterates (bounded) because modifiers stack: `"public static readonly x"`.
pub fn strip_keywords(query: &str) -> String {
    let mut out = query.trim().to_string();
    for _ in 0..5 {
        let stripped = keyword_prefix_re().replace(&out, "").to_string();
        if stripped == out {
            break;
        }
        out = stripped.trim_start().to_string();
    }
    out
}

fn escape_sql_literal(s: &str) -> String {
    s.replace('\'', "''")
}

/// Longest `[A-Za-z0-9_]` run in the query, used to anchor the coarse filter
/// for the modes whose syntax the store cannot evaluate.
fn longest_alnum_token(query: &str) -> Option<String> {
    let mut best: Option<&str> = None;
    for token in query.split(|c: char| !c.is_ascii_alphanumeric() && c != '_') {
        if token.is_empty() {
            continue;
        }
        if best.map(|b| token.len() > b.len()).unwrap_or(true) {
            best = Some(token);
        }
    }
    best.map(|s| s.to_string())
}

/// Build the pushed-down predicate. SQLite's `LIKE` is already ASCII
/// case-insensitive, so one operator covers both the LIKE and ILIKE cases of
/// the contract; case-sensitive exactness is restored by the refine step.
pub fn build_where(query: &str, mode: SearchMode, column: &str) -> Option<String> {
    match mode {
        SearchMode::Prefix => Some(format!(
            "{column} LIKE '{}%'",
            escape_sql_literal(query)
        )),
        SearchMode::Substring => Some(format!(
            "{column} LIKE '%{}%'",
            escape_sql_literal(query)
        )),
        SearchMode::Wildcard | SearchMode::Regex | SearchMode::Fuzzy => longest_alnum_token(query)
            .map(|token| format!("{column} LIKE '%{}%'", escape_sql_literal(&token))),
    }
}

/// Which column the search runs over: `symbol` (symbol search) or `file`
/// (file-name search). Both share mode inference and ranking.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SearchColumn {
    Symbol,
    File,
}

impl SearchColumn {
    fn name(&self) -> &'static str {
        match self {
            SearchColumn::Symbol => "symbol",
            SearchColumn::File => "file",
        }
    }

    fn value<'a>(&self, row: &'a RefRow) -> &'a str {
        match self {
            SearchColumn::Symbol => &row.symbol,
            SearchColumn::File => &row.file,
        }
    }
}

#[derive(Debug, Clone)]
pub struct SearchParams {
    pub query: String,
    pub mode: Option<SearchMode>,
    pub case_insensitive: bool,
    pub limit: usize,
    pub max_candidates: Option<usize>,
    pub column: SearchColumn,
}

#[derive(Debug, Clone, Serialize)]
pub struct SearchHit {
    pub lang: IndexLang,
    pub score: u32,
    #[serde(flatten)]
    pub row: RefRow,
}

pub fn default_max_candidates(limit: usize) -> usize {
    limit.max(2000.min(limit.saturating_mul(20)))
}

/// Run the search over the given languages and return the first `limit`
/// refined rows (fuzzy mode ranks by score first).
pub fn search(
    store: &VectorStore,
    languages: &[IndexLang],
    params: &SearchParams,
) -> Result<Vec<SearchHit>> {
    let query = strip_keywords(&params.query);
    let mode = infer_mode(&query, params.mode);
    let max_candidates = params
        .max_candidates
        .unwrap_or_else(|| default_max_candidates(params.limit));

    let matcher = match Matcher::build(&query, mode, params.case_insensitive) {
        Some(m) => m,
        // A broken regex/wildcard pattern returns empty rows, not an error.
        None => return Ok(vec![]),
    };

    let where_sql = build_where(&query, mode, params.column.name());

    let mut hits: Vec<SearchHit> = Vec::new();
    for &lang in languages {
        let candidates = store.query_refs(lang, where_sql.as_deref(), max_candidates)?;
        for row in candidates {
            if let Some(score) = matcher.score(params.column.value(&row)) {
                hits.push(SearchHit { lang, score, row });
            }
        }
    }

    if mode == SearchMode::Fuzzy {
        // Stable sort keeps insertion order among equal scores.
        hits.sort_by(|a, b| b.score.cmp(&a.score));
    }
    hits.truncate(params.limit);
    Ok(hits)
}

// ---------------------------------------------------------------------------
// In-memory refinement
// ---------------------------------------------------------------------------

enum Matcher {
    Substring { needle: String, ci: bool },
    Prefix { needle: String, ci: bool },
    Pattern(Regex),
    Fuzzy { needle: String },
}

impl Matcher {
    fn build(query: &str, mode: SearchMode, case_insensitive: bool) -> Option<Self> {
        match mode {
            SearchMode::Substring => Some(Matcher::Substring {
                needle: if case_insensitive {
                    query.to_lowercase()
                } else {
                    query.to_string()
                },
                ci: case_insensitive,
            }),
            SearchMode::Prefix => Some(Matcher::Prefix {
                needle: if case_insensitive {
                    query.to_lowercase()
                } else {
                    query.to_string()
                },
                ci: case_insensitive,
            }),
            SearchMode::Wildcard => {
                let pattern = wildcard_to_regex(query, case_insensitive);
                Regex::new(&pattern).ok().map(Matcher::Pattern)
            }
            SearchMode::Regex => {
                let pattern = if case_insensitive {
                    format!("(?i){query}")
                } else {
                    query.to_string()
                };
                Regex::new(&pattern).ok().map(Matcher::Pattern)
            }
            SearchMode::Fuzzy => Some(Matcher::Fuzzy {
                needle: fuzzy_normalize(query),
            }),
        }
    }

    /// `Some(score)` on a match. Non-fuzzy modes score 0; ordering for them
    /// is candidate order.
    fn score(&self, value: &str) -> Option<u32> {
        match self {
            Matcher::Substring { needle, ci } => {
                let hay = if *ci { value.to_lowercase() } else { value.to_string() };
                hay.contains(needle.as_str()).then_some(0)
            }
            Matcher::Prefix { needle, ci } => {
                let hay = if *ci { value.to_lowercase() } else { value.to_string() };
                hay.starts_with(needle.as_str()).then_some(0)
            }
            Matcher::Pattern(re) => re.is_match(value).then_some(0),
            Matcher::Fuzzy { needle } => fuzzy_score(needle, &fuzzy_normalize(value)),
        }
    }
}

/// Glob to anchored regex: `*` → `.*`, `?` → `.`, everything else literal.
fn wildcard_to_regex(glob: &str, case_insensitive: bool) -> String {
    let mut out = String::with_capacity(glob.len() + 8);
    if case_insensitive {
        out.push_str("(?i)");
    }
    out.push('^');
    for ch in glob.chars() {
        match ch {
            '*' => out.push_str(".*"),
            '?' => out.push('.'),
            _ => out.push_str(&regex::escape(&ch.to_string())),
        }
    }
    out.push('$');
    out
}

/// Fuzzy matching normalizes both sides to `[a-z0-9_$.]` before the
/// subsequence walk.
fn fuzzy_normalize(s: &str) -> String {
    s.to_lowercase()
        .chars()
        .filter(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || matches!(c, '_' | '$' | '.'))
        .collect()
}

/// Subsequence score: 2 per consecutive hit, 1 otherwise; `None` unless the
/// whole needle is consumed.
fn fuzzy_score(needle: &str, haystack: &str) -> Option<u32> {
    if needle.is_empty() {
        return None;
    }
    let mut score: u32 = 0;
    let mut last_hit: Option<usize> = None;
    let mut hay = haystack.char_indices();

    'outer: for nc in needle.chars() {
        for (i, hc) in hay.by_ref() {
            if hc == nc {
                score += match last_hit {
                    Some(prev) if i == prev + hc.len_utf8() => 2,
                    _ => 1,
                };
                last_hit = Some(i);
                continue 'outer;
            }
        }
        return None;
    }
    Some(score)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::OpenMode;

    #[test]
    fn mode_inference() {
        assert_eq!(infer_mode("a*b", None), SearchMode::Wildcard);
        assert_eq!(infer_mode("a?b", None), SearchMode::Wildcard);
        assert_eq!(infer_mode("abc", None), SearchMode::Substring);
        // Explicit always wins.
        assert_eq!(infer_mode("a*b", Some(SearchMode::Regex)), SearchMode::Regex);
    }

    #[test]
    fn keyword_stripping_is_idempotent() {
        let q = "export async function handleAuth";
        let once = strip_keywords(q);
        assert_eq!(once, "handleAuth");
        assert_eq!(strip_keywords(&once), once);

        assert_eq!(strip_keywords("class Project"), "Project");
        assert_eq!(strip_keywords("public static readonly counter"), "counter");
        // Keywords with no trailing name are left alone.
        assert_eq!(strip_keywords("classify"), "classify");
    }

    #[test]
    fn where_clause_shapes() {
        assert_eq!(
            build_where("Pro", SearchMode::Prefix, "symbol").unwrap(),
            "symbol LIKE 'Pro%'"
        );
        assert_eq!(
            build_where("o'brien", SearchMode::Substring, "symbol").unwrap(),
            "symbol LIKE '%o''brien%'"
        );
        // Wildcard anchors on the longest alphanumeric token.
        assert_eq!(
            build_where("ha*Auth", SearchMode::Wildcard, "symbol").unwrap(),
            "symbol LIKE '%Auth%'"
        );
        // No token at all: no predicate, full scan up to max_candidates.
        assert_eq!(build_where("***", SearchMode::Wildcard, "symbol"), None);
    }

    #[test]
    fn wildcard_matcher_is_anchored() {
        let m = Matcher::build("handle*", SearchMode::Wildcard, false).unwrap();
        assert!(m.score("handleAuth").is_some());
        assert!(m.score("rehandleAuth").is_none());

        let q = Matcher::build("h?ndle", SearchMode::Wildcard, false).unwrap();
        assert!(q.score("handle").is_some());
        assert!(q.score("hanndle").is_none());
    }

    #[test]
    fn regex_compile_error_returns_empty_not_error() {
        assert!(Matcher::build("([", SearchMode::Regex, false).is_none());
    }

    #[test]
    fn fuzzy_scoring_rewards_consecutive_runs() {
        // "hAu" vs handleAuth → h(1) + a(2, consecutive) + u(1) = 4.
        assert_eq!(fuzzy_score("hau", &fuzzy_normalize("handleAuth")), Some(4));
        // Not a subsequence.
        assert_eq!(fuzzy_score("xyz", "handleauth"), None);
        // Fully consecutive run scores highest.
        let tight = fuzzy_score("auth", "auth").unwrap();
        let loose = fuzzy_score("auth", "a_u_t_h").unwrap();
        assert!(tight > loose);
    }

    #[test]
    fn default_candidate_budget() {
        assert_eq!(default_max_candidates(10), 200);
        assert_eq!(default_max_candidates(500), 2000);
        assert_eq!(default_max_candidates(5000), 5000);
    }

    fn seeded_store(tmp: &std::path::Path) -> VectorStore {
        let mut store =
            VectorStore::open(tmp, 16, OpenMode::CreateIfMissing, &[IndexLang::Ts]).unwrap();
        let rows: Vec<RefRow> = [
            ("r1", "handleAuth", "function", "src/auth.ts"),
            ("r2", "Project", "class", "src/project.ts"),
            ("r3", "parse_req", "function", "src/http/parse.ts"),
        ]
        .iter()
        .map(|(id, symbol, kind, file)| RefRow {
            ref_id: id.to_string(),
            content_hash: format!("h-{id}"),
            file: file.to_string(),
            symbol: symbol.to_string(),
            kind: kind.to_string(),
            signature: format!("{kind} {symbol}"),
            start_line: 1,
            end_line: 2,
        })
        .collect();
        store.append_refs(IndexLang::Ts, &rows).unwrap();
        store
    }

    fn params(query: &str, mode: Option<SearchMode>) -> SearchParams {
        SearchParams {
            query: query.to_string(),
            mode,
            case_insensitive: false,
            limit: 10,
            max_candidates: None,
            column: SearchColumn::Symbol,
        }
    }

    #[test]
    fn keyword_stripped_substring_search() {
        let tmp = tempfile::tempdir().unwrap();
        let store = seeded_store(tmp.path());
        let hits = search(&store, &[IndexLang::Ts], &params("class Project", None)).unwrap();
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].row.symbol, "Project");
        assert_eq!(hits[0].row.kind, "class");
    }

    #[test]
    fn case_sensitivity_is_refined_in_memory() {
        let tmp = tempfile::tempdir().unwrap();
        let store = seeded_store(tmp.path());
        // Case-sensitive: the LIKE prefilter is case-insensitive, but refine
        // rejects the wrong-case candidate.
        let hits = search(&store, &[IndexLang::Ts], &params("handleauth", None)).unwrap();
        assert!(hits.is_empty());

        let mut p = params("handleauth", None);
        p.case_insensitive = true;
        let hits = search(&store, &[IndexLang::Ts], &p).unwrap();
        assert_eq!(hits.len(), 1);
    }

    #[test]
    fn fuzzy_search_ranks_by_score() {
        let tmp = tempfile::tempdir().unwrap();
        let store = seeded_store(tmp.path());
        let hits = search(
            &store,
            &[IndexLang::Ts],
            &params("hAu", Some(SearchMode::Fuzzy)),
        )
        .unwrap();
        assert!(!hits.is_empty());
        assert_eq!(hits[0].row.symbol, "handleAuth");
        assert!(hits[0].score > 0);
    }

    #[test]
    fn regex_across_separators_survives_coarse_filter() {
        let tmp = tempfile::tempdir().unwrap();
        let store = seeded_store(tmp.path());
        // Pattern spans `_`; the pushdown keys on the longest token "parse"
        // and must still return the row.
        let hits = search(
            &store,
            &[IndexLang::Ts],
            &params("parse.req", Some(SearchMode::Regex)),
        )
        .unwrap();
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].row.symbol, "parse_req");
    }

    #[test]
    fn file_column_search_shares_machinery() {
        let tmp = tempfile::tempdir().unwrap();
        let store = seeded_store(tmp.path());
        let mut p = params("http", None);
        p.column = SearchColumn::File;
        let hits = search(&store, &[IndexLang::Ts], &p).unwrap();
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].row.file, "src/http/parse.ts");
    }
}
