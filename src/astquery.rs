use anyhow::Result;
use serde::Serialize;
use std::collections::{HashMap, HashSet};

use crate::graph::{CallTuple, GraphData, GraphStore, SymbolTuple};
use crate::parser::IndexLang;

// ---------------------------------------------------------------------------
// Fixed-shape queries over the AST graph. Joins run in memory on a loaded
// relation image; both graph backends serve the same queries that way.
//
// Name resolution is case-insensitive and name-based throughout: overloads
// and same-named callables in different files are conflated. That is a known
// precision limit of the graph, not a bug to fix here.
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChainDirection {
    Downstream,
    Upstream,
}

impl ChainDirection {
    pub fn parse(s: &str) -> Option<Self> {
        Some(match s {
            "downstream" => ChainDirection::Downstream,
            "upstream" => ChainDirection::Upstream,
            _ => return None,
        })
    }
}

/// A reference occurrence joined to its originating scope (symbol or file).
#[derive(Debug, Clone, Serialize)]
pub struct ReferenceSite {
    pub from_id: String,
    pub from_name: String,
    pub from_kind: String,
    pub name: String,
    pub ref_kind: String,
    pub file: String,
    pub line: i32,
    pub col: i32,
    pub lang: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct CallerRow {
    pub caller_id: String,
    pub caller_name: String,
    pub caller_kind: String,
    pub caller_file: String,
    pub callee_name: String,
    pub file: String,
    pub line: i32,
    pub col: i32,
    pub lang: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct CalleeRow {
    pub caller_id: String,
    pub caller_name: String,
    pub callee: SymbolTuple,
    pub file: String,
    pub line: i32,
    pub col: i32,
}

#[derive(Debug, Clone, Serialize, PartialEq, Eq, Hash)]
pub struct ChainRow {
    pub caller_id: String,
    pub callee_id: String,
    pub depth: u32,
    pub caller_name: String,
    pub callee_name: String,
    pub lang: String,
}

/// One loaded graph image plus the lookup maps the queries need.
pub struct AstQuery {
    data: GraphData,
    /// ref_id → index into `data.ast_symbol`.
    by_id: HashMap<String, usize>,
    /// lowercase name → indices into `data.ast_symbol`.
    by_name: HashMap<String, Vec<usize>>,
    /// file_id → file path.
    file_by_id: HashMap<String, String>,
}

impl AstQuery {
    pub fn load(store: &GraphStore) -> Result<Self> {
        let data = store.export()?;
        let mut by_id = HashMap::new();
        let mut by_name: HashMap<String, Vec<usize>> = HashMap::new();
        for (i, sym) in data.ast_symbol.iter().enumerate() {
            by_id.insert(sym.ref_id.clone(), i);
            by_name.entry(sym.name.to_lowercase()).or_default().push(i);
        }
        let file_by_id = data
            .ast_file
            .iter()
            .map(|f| (f.file_id.clone(), f.file.clone()))
            .collect();
        Ok(Self {
            data,
            by_id,
            by_name,
            file_by_id,
        })
    }

    fn lang_matches(langs: &[IndexLang], lang: &str) -> bool {
        langs.iter().any(|l| l.as_str() == lang)
    }

    /// Name and kind of a scope id: a symbol, or a file node for top-level
    /// references.
    fn scope_of(&self, id: &str) -> (String, String) {
        if let Some(&i) = self.by_id.get(id) {
            let sym = &self.data.ast_symbol[i];
            (sym.name.clone(), sym.kind.clone())
        } else if let Some(file) = self.file_by_id.get(id) {
            (file.clone(), "file".to_string())
        } else {
            (String::new(), "unknown".to_string())
        }
    }

    /// Symbols whose lowercased name starts with the lowercased prefix.
    pub fn find(&self, prefix: &str, langs: &[IndexLang]) -> Vec<SymbolTuple> {
        let needle = prefix.to_lowercase();
        self.data
            .ast_symbol
            .iter()
            .filter(|s| Self::lang_matches(langs, &s.lang))
            .filter(|s| s.name.to_lowercase().starts_with(&needle))
            .cloned()
            .collect()
    }

    /// Direct children of a parent id (a file_id or a symbol ref_id).
    pub fn children(&self, parent_id: &str) -> Vec<SymbolTuple> {
        self.data
            .ast_contains
            .iter()
            .filter(|c| c.parent_id == parent_id)
            .filter_map(|c| self.by_id.get(&c.child_id))
            .map(|&i| self.data.ast_symbol[i].clone())
            .collect()
    }

    pub fn find_references(&self, name: &str, langs: &[IndexLang]) -> Vec<ReferenceSite> {
        let needle = name.to_lowercase();
        self.data
            .ast_ref_name
            .iter()
            .filter(|r| Self::lang_matches(langs, &r.from_lang))
            .filter(|r| r.name.to_lowercase() == needle)
            .map(|r| {
                let (from_name, from_kind) = self.scope_of(&r.from_id);
                ReferenceSite {
                    from_id: r.from_id.clone(),
                    from_name,
                    from_kind,
                    name: r.name.clone(),
                    ref_kind: r.ref_kind.clone(),
                    file: r.file.clone(),
                    line: r.line,
                    col: r.col,
                    lang: r.from_lang.clone(),
                }
            })
            .collect()
    }

    pub fn callers(&self, name: &str, langs: &[IndexLang]) -> Vec<CallerRow> {
        let needle = name.to_lowercase();
        self.data
            .ast_call_name
            .iter()
            .filter(|c| Self::lang_matches(langs, &c.caller_lang))
            .filter(|c| c.callee_name.to_lowercase() == needle)
            .map(|c| {
                let (caller_name, caller_kind) = self.scope_of(&c.caller_id);
                let caller_file = self
                    .by_id
                    .get(&c.caller_id)
                    .map(|&i| self.data.ast_symbol[i].file.clone())
                    .unwrap_or_else(|| c.file.clone());
                CallerRow {
                    caller_id: c.caller_id.clone(),
                    caller_name,
                    caller_kind,
                    caller_file,
                    callee_name: c.callee_name.clone(),
                    file: c.file.clone(),
                    line: c.line,
                    col: c.col,
                    lang: c.caller_lang.clone(),
                }
            })
            .collect()
    }

    /// Everything the named symbol calls, resolved back to symbols by name.
    pub fn callees(&self, name: &str, langs: &[IndexLang]) -> Vec<CalleeRow> {
        let needle = name.to_lowercase();
        let caller_ids: HashSet<&str> = self
            .data
            .ast_symbol
            .iter()
            .filter(|s| Self::lang_matches(langs, &s.lang))
            .filter(|s| s.name.to_lowercase() == needle)
            .map(|s| s.ref_id.as_str())
            .collect();

        let mut out = Vec::new();
        for call in &self.data.ast_call_name {
            if !caller_ids.contains(call.caller_id.as_str()) {
                continue;
            }
            let (caller_name, _) = self.scope_of(&call.caller_id);
            for &i in self
                .by_name
                .get(&call.callee_name.to_lowercase())
                .map(|v| v.as_slice())
                .unwrap_or(&[])
            {
                let callee = &self.data.ast_symbol[i];
                if !Self::lang_matches(langs, &callee.lang) {
                    continue;
                }
                out.push(CalleeRow {
                    caller_id: call.caller_id.clone(),
                    caller_name: caller_name.clone(),
                    callee: callee.clone(),
                    file: call.file.clone(),
                    line: call.line,
                    col: call.col,
                });
            }
        }
        out
    }

    /// Bounded fixed-point over `ast_call_name`, per language, seeded on the
    /// symbols named `name`. Depth starts at 1 and never exceeds `max_depth`.
    pub fn call_chain(
        &self,
        name: &str,
        direction: ChainDirection,
        max_depth: u32,
        langs: &[IndexLang],
        min_name_len: usize,
    ) -> Vec<ChainRow> {
        let mut rows: Vec<ChainRow> = Vec::new();
        let mut seen: HashSet<ChainRow> = HashSet::new();

        for &lang in langs {
            for row in self.chain_for_lang(name, direction, max_depth, lang) {
                if row.caller_name.len() < min_name_len || row.callee_name.len() < min_name_len {
                    continue;
                }
                if seen.insert(row.clone()) {
                    rows.push(row);
                }
            }
        }
        rows
    }

    /// Symbols with the given (lowercased) name in one language.
    fn symbols_named_in(&self, name: &str, lang_str: &str) -> Vec<&SymbolTuple> {
        self.by_name
            .get(&name.to_lowercase())
            .map(|v| v.as_slice())
            .unwrap_or(&[])
            .iter()
            .map(|&i| &self.data.ast_symbol[i])
            .filter(|s| s.lang == lang_str)
            .collect()
    }

    fn chain_for_lang(
        &self,
        name: &str,
        direction: ChainDirection,
        max_depth: u32,
        lang: IndexLang,
    ) -> Vec<ChainRow> {
        let needle = name.to_lowercase();
        let lang_str = lang.as_str();

        let calls: Vec<&CallTuple> = self
            .data
            .ast_call_name
            .iter()
            .filter(|c| c.caller_lang == lang_str)
            .collect();

        let seeds: Vec<&SymbolTuple> = self.symbols_named_in(&needle, lang_str);
        if seeds.is_empty() {
            return vec![];
        }

        let mut rows: Vec<ChainRow> = Vec::new();
        let mut visited: HashSet<String> = seeds.iter().map(|s| s.ref_id.clone()).collect();
        let mut frontier: Vec<String> = seeds.iter().map(|s| s.ref_id.clone()).collect();

        for depth in 1..=max_depth {
            if frontier.is_empty() {
                break;
            }
            let frontier_set: HashSet<&str> = frontier.iter().map(|s| s.as_str()).collect();
            let mut next: Vec<String> = Vec::new();

            match direction {
                ChainDirection::Downstream => {
                    // caller ∈ frontier, extend to callees by name.
                    for call in &calls {
                        if !frontier_set.contains(call.caller_id.as_str()) {
                            continue;
                        }
                        let (caller_name, _) = self.scope_of(&call.caller_id);
                        for callee in self.symbols_named_in(&call.callee_name, lang_str) {
                            rows.push(ChainRow {
                                caller_id: call.caller_id.clone(),
                                callee_id: callee.ref_id.clone(),
                                depth,
                                caller_name: caller_name.clone(),
                                callee_name: callee.name.clone(),
                                lang: lang_str.to_string(),
                            });
                            if visited.insert(callee.ref_id.clone()) {
                                next.push(callee.ref_id.clone());
                            }
                        }
                    }
                }
                ChainDirection::Upstream => {
                    // callee name ∈ frontier names, extend to callers.
                    let frontier_syms: Vec<&SymbolTuple> = frontier
                        .iter()
                        .filter_map(|id| self.by_id.get(id))
                        .map(|&i| &self.data.ast_symbol[i])
                        .collect();
                    for call in &calls {
                        for target in &frontier_syms {
                            if call.callee_name.to_lowercase() != target.name.to_lowercase() {
                                continue;
                            }
                            let (caller_name, _) = self.scope_of(&call.caller_id);
                            rows.push(ChainRow {
                                caller_id: call.caller_id.clone(),
                                callee_id: target.ref_id.clone(),
                                depth,
                                caller_name: caller_name.clone(),
                                callee_name: target.name.clone(),
                                lang: lang_str.to_string(),
                            });
                            // Files can originate calls but never receive them;
                            // only symbol callers extend the frontier.
                            if self.by_id.contains_key(&call.caller_id)
                                && visited.insert(call.caller_id.clone())
                            {
                                next.push(call.caller_id.clone());
                            }
                        }
                    }
                }
            }

            frontier = next;
        }

        rows
    }
}
