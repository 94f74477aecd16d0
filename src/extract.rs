use regex::Regex;
use serde::{Deserialize, Serialize};
use std::sync::OnceLock;
use tree_sitter::Node;

// ---------------------------------------------------------------------------
// Symbol / reference extraction.
//
// Tree-sitter languages are walked with an explicit container stack so each
// symbol records its immediately enclosing declaration; the indexer turns
// that into `ast_contains` edges. Markdown and YAML never reach tree-sitter:
// they are line scanners (headers / top-level keys).
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SymbolKind {
    Function,
    Method,
    Class,
    Interface,
    Type,
    Variable,
    Export,
    Field,
    Section,
    Document,
    Node,
    Test,
}

impl SymbolKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            SymbolKind::Function => "function",
            SymbolKind::Method => "method",
            SymbolKind::Class => "class",
            SymbolKind::Interface => "interface",
            SymbolKind::Type => "type",
            SymbolKind::Variable => "variable",
            SymbolKind::Export => "export",
            SymbolKind::Field => "field",
            SymbolKind::Section => "section",
            SymbolKind::Document => "document",
            SymbolKind::Node => "node",
            SymbolKind::Test => "test",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        Some(match s {
            "function" => SymbolKind::Function,
            "method" => SymbolKind::Method,
            "class" => SymbolKind::Class,
            "interface" => SymbolKind::Interface,
            "type" => SymbolKind::Type,
            "variable" => SymbolKind::Variable,
            "export" => SymbolKind::Export,
            "field" => SymbolKind::Field,
            "section" => SymbolKind::Section,
            "document" => SymbolKind::Document,
            "node" => SymbolKind::Node,
            "test" => SymbolKind::Test,
            _ => return None,
        })
    }

    /// Callable scopes are the attribution window for surrounding references.
    pub fn is_callable(&self) -> bool {
        matches!(self, SymbolKind::Function | SymbolKind::Method)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RefKind {
    Call,
    New,
    Type,
}

impl RefKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            RefKind::Call => "call",
            RefKind::New => "new",
            RefKind::Type => "type",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        Some(match s {
            "call" => RefKind::Call,
            "new" => RefKind::New,
            "type" => RefKind::Type,
            _ => return None,
        })
    }
}

/// A named code construct discovered by parsing.
///
/// Lines are 1-based and inclusive. `container` indexes the enclosing symbol
/// in the same `ParsedFile` (containers are always emitted before their
/// children, so the index is valid by construction).
#[derive(Debug, Clone, Serialize)]
pub struct Symbol {
    pub name: String,
    pub kind: SymbolKind,
    pub start_line: u32,
    pub end_line: u32,
    pub signature: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub container: Option<usize>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub extends: Vec<String>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub implements: Vec<String>,
}

/// An occurrence of a name used as `call`, `new` or `type`.
/// `line` is 1-based; `col` is the tree-sitter column (0-based).
#[derive(Debug, Clone, Serialize)]
pub struct AstReference {
    pub name: String,
    pub kind: RefKind,
    pub line: u32,
    pub col: u32,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct ParsedFile {
    pub symbols: Vec<Symbol>,
    pub refs: Vec<AstReference>,
}

// ---------------------------------------------------------------------------
// Shared walker state
// ---------------------------------------------------------------------------

struct Walker<'a> {
    source: &'a str,
    out: ParsedFile,
    /// Indices into `out.symbols` of the open container declarations.
    containers: Vec<usize>,
}

impl<'a> Walker<'a> {
    fn new(source: &'a str) -> Self {
        Self {
            source,
            out: ParsedFile::default(),
            containers: Vec::new(),
        }
    }

    fn text(&self, node: Node) -> &'a str {
        node.utf8_text(self.source.as_bytes()).unwrap_or("")
    }

    fn push_symbol(&mut self, name: &str, kind: SymbolKind, def: Node) -> usize {
        self.push_symbol_with_heritage(name, kind, def, vec![], vec![])
    }

    fn push_symbol_with_heritage(
        &mut self,
        name: &str,
        kind: SymbolKind,
        def: Node,
        extends: Vec<String>,
        implements: Vec<String>,
    ) -> usize {
        let idx = self.out.symbols.len();
        self.out.symbols.push(Symbol {
            name: name.to_string(),
            kind,
            start_line: def.start_position().row as u32 + 1,
            end_line: def.end_position().row as u32 + 1,
            signature: signature_of(self.text(def)),
            container: self.containers.last().copied(),
            extends,
            implements,
        });
        idx
    }

    fn push_ref(&mut self, name: &str, kind: RefKind, at: Node) {
        if name.is_empty() {
            return;
        }
        self.out.refs.push(AstReference {
            name: name.to_string(),
            kind,
            line: at.start_position().row as u32 + 1,
            col: at.start_position().column as u32,
        });
    }

    /// Nearest open container of kind `class`, if any.
    fn inside_class(&self) -> bool {
        self.containers
            .last()
            .map(|&i| self.out.symbols[i].kind == SymbolKind::Class)
            .unwrap_or(false)
    }
}

/// First line of a definition, cut at the body opener, whitespace-collapsed.
///
/// Python-style headers end with `:`; that trailing colon is trimmed, but
/// colons inside parameter annotations are left alone.
fn signature_of(def_text: &str) -> String {
    let mut s = def_text.lines().next().unwrap_or("");
    if let Some(i) = s.find('{') {
        s = &s[..i];
    }
    let mut out = String::with_capacity(s.len().min(240));
    let mut prev_ws = false;
    for ch in s.chars() {
        let is_ws = ch.is_whitespace();
        if is_ws {
            if !prev_ws {
                out.push(' ');
            }
        } else {
            out.push(ch);
        }
        prev_ws = is_ws;
        if out.len() >= 240 {
            break;
        }
    }
    out.trim().trim_end_matches(':').trim().to_string()
}

/// Signature for Java fields: first line up to the terminating `;`.
fn field_signature_of(def_text: &str) -> String {
    let mut s = def_text.lines().next().unwrap_or("");
    if let Some(i) = s.find(';') {
        s = &s[..i];
    }
    s.trim().to_string()
}

// ---------------------------------------------------------------------------
// Heritage parsing (extends / implements from a declaration head)
// ---------------------------------------------------------------------------

fn extends_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"\bextends\b([^{]*?)(?:\bimplements\b|\{|$)").unwrap())
}

fn implements_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"\bimplements\b([^{]*?)(?:\{|$)").unwrap())
}

/// Split a heritage clause on commas at angle-bracket/paren depth 0, so
/// `A<Map<K, V>>, B` yields exactly `["A", "B"]`.
fn split_top_level(clause: &str) -> Vec<String> {
    let mut parts: Vec<String> = Vec::new();
    let mut depth: i32 = 0;
    let mut cur = String::new();
    for ch in clause.chars() {
        match ch {
            '<' | '(' | '[' => {
                depth += 1;
                cur.push(ch);
            }
            '>' | ')' | ']' => {
                depth -= 1;
                cur.push(ch);
            }
            ',' if depth == 0 => {
                parts.push(cur.clone());
                cur.clear();
            }
            _ => cur.push(ch),
        }
    }
    parts.push(cur);
    parts
        .into_iter()
        .map(|p| heritage_name(&p))
        .filter(|n| !n.is_empty())
        .collect()
}

/// Reduce one heritage entry to its bare (possibly dotted) name.
fn heritage_name(part: &str) -> String {
    let t = part.trim();
    let cut = t.find(['<', '(']).unwrap_or(t.len());
    t[..cut].trim().to_string()
}

/// Parse `extends` / `implements` name lists from a declaration.
/// Works for TS classes/interfaces and Java type declarations alike.
///
/// The scan covers the whole declaration head up to the opening `{`, so
/// heritage clauses wrapped onto their own line still count; the body is cut
/// away so `extends` inside nested declarations cannot leak in.
pub fn parse_heritage(decl_text: &str) -> (Vec<String>, Vec<String>) {
    let head = decl_text.split('{').next().unwrap_or(decl_text);
    let extends = extends_re()
        .captures(head)
        .map(|c| split_top_level(&c[1]))
        .unwrap_or_default();
    let implements = implements_re()
        .captures(head)
        .map(|c| split_top_level(&c[1]))
        .unwrap_or_default();
    (extends, implements)
}

// ---------------------------------------------------------------------------
// TypeScript / JavaScript
// ---------------------------------------------------------------------------

pub fn extract_typescript(source: &str, root: Node) -> ParsedFile {
    let mut w = Walker::new(source);
    walk_ts(&mut w, root);
    w.out
}

fn ts_declarator_is_function(decl: Node) -> bool {
    decl.child_by_field_name("value")
        .map(|v| matches!(v.kind(), "arrow_function" | "function" | "function_expression"))
        .unwrap_or(false)
}

fn walk_ts(w: &mut Walker, node: Node) {
    let mut pushed_container: Option<usize> = None;

    match node.kind() {
        "function_declaration" => {
            if let Some(name) = node.child_by_field_name("name") {
                let name = w.text(name).to_string();
                let idx = w.push_symbol(&name, SymbolKind::Function, node);
                pushed_container = Some(idx);
            }
        }
        "method_definition" => {
            if let Some(name) = node.child_by_field_name("name") {
                let name = w.text(name).to_string();
                let idx = w.push_symbol(&name, SymbolKind::Method, node);
                pushed_container = Some(idx);
            }
        }
        "class_declaration" => {
            if let Some(name) = node.child_by_field_name("name") {
                let name = w.text(name).to_string();
                let (extends, implements) = parse_heritage(w.text(node));
                let idx =
                    w.push_symbol_with_heritage(&name, SymbolKind::Class, node, extends, implements);
                pushed_container = Some(idx);
            }
        }
        "interface_declaration" => {
            if let Some(name) = node.child_by_field_name("name") {
                let name = w.text(name).to_string();
                let (extends, implements) = parse_heritage(w.text(node));
                let idx = w.push_symbol_with_heritage(
                    &name,
                    SymbolKind::Interface,
                    node,
                    extends,
                    implements,
                );
                pushed_container = Some(idx);
            }
        }
        "type_alias_declaration" => {
            if let Some(name) = node.child_by_field_name("name") {
                let name = w.text(name).to_string();
                w.push_symbol(&name, SymbolKind::Type, node);
            }
        }
        "lexical_declaration" | "variable_declaration" => {
            let exported = node
                .parent()
                .map(|p| p.kind() == "export_statement")
                .unwrap_or(false);
            let mut cursor = node.walk();
            let declarators: Vec<Node> = node
                .named_children(&mut cursor)
                .filter(|c| c.kind() == "variable_declarator")
                .collect();
            for decl in declarators {
                let Some(name_node) = decl.child_by_field_name("name") else {
                    continue;
                };
                let name = w.text(name_node).to_string();
                if ts_declarator_is_function(decl) {
                    let idx = w.push_symbol(&name, SymbolKind::Function, node);
                    // The arrow body is walked below; nested symbols belong to it.
                    pushed_container = Some(idx);
                } else if exported {
                    w.push_symbol(&name, SymbolKind::Variable, node);
                }
            }
        }
        "export_specifier" => {
            if let Some(name) = node.child_by_field_name("name") {
                let name = w.text(name).to_string();
                w.push_symbol(&name, SymbolKind::Export, node);
            }
        }
        "call_expression" => {
            if let Some(callee) = node.child_by_field_name("function") {
                let name = ts_callee_name(w, callee);
                if !name.is_empty() {
                    w.push_ref(&name, RefKind::Call, callee);
                    // test("...") / describe("...") blocks become named symbols.
                    if name == "test" || name == "describe" {
                        if let Some(title) = ts_first_string_argument(w, node) {
                            w.push_symbol(&title, SymbolKind::Test, node);
                        }
                    }
                }
            }
        }
        "new_expression" => {
            if let Some(ctor) = node.child_by_field_name("constructor") {
                let name = ts_callee_name(w, ctor);
                w.push_ref(&name, RefKind::New, ctor);
            }
        }
        "type_identifier" => {
            let name = w.text(node).to_string();
            w.push_ref(&name, RefKind::Type, node);
        }
        _ => {}
    }

    if let Some(idx) = pushed_container {
        w.containers.push(idx);
    }
    let mut cursor = node.walk();
    let children: Vec<Node> = node.children(&mut cursor).collect();
    for child in children {
        walk_ts(w, child);
    }
    if pushed_container.is_some() {
        w.containers.pop();
    }
}

/// Name of a callee: bare identifiers as-is, member calls by property only.
fn ts_callee_name(w: &Walker, callee: Node) -> String {
    match callee.kind() {
        "identifier" => w.text(callee).to_string(),
        "member_expression" => callee
            .child_by_field_name("property")
            .map(|p| w.text(p).to_string())
            .unwrap_or_default(),
        _ => String::new(),
    }
}

fn ts_first_string_argument(w: &Walker, call: Node) -> Option<String> {
    let args = call.child_by_field_name("arguments")?;
    let mut cursor = args.walk();
    let first = args.named_children(&mut cursor).next()?;
    if first.kind() != "string" {
        return None;
    }
    let raw = w.text(first);
    let trimmed = raw.trim_matches(|c| c == '"' || c == '\'' || c == '`');
    if trimmed.is_empty() {
        None
    } else {
        Some(trimmed.to_string())
    }
}

// ---------------------------------------------------------------------------
// Java
// ---------------------------------------------------------------------------

pub fn extract_java(source: &str, root: Node) -> ParsedFile {
    let mut w = Walker::new(source);
    walk_java(&mut w, root);
    w.out
}

fn walk_java(w: &mut Walker, node: Node) {
    let mut pushed_container: Option<usize> = None;

    match node.kind() {
        "class_declaration"
        | "interface_declaration"
        | "enum_declaration"
        | "record_declaration"
        | "annotation_type_declaration" => {
            if let Some(name) = node.child_by_field_name("name") {
                let name = w.text(name).to_string();
                let (extends, implements) = parse_heritage(w.text(node));
                let idx =
                    w.push_symbol_with_heritage(&name, SymbolKind::Class, node, extends, implements);
                pushed_container = Some(idx);
            }
        }
        "method_declaration" | "constructor_declaration" => {
            if let Some(name) = node.child_by_field_name("name") {
                let name = w.text(name).to_string();
                let idx = w.push_symbol(&name, SymbolKind::Method, node);
                pushed_container = Some(idx);
            }
        }
        "field_declaration" => {
            if let Some(decl) = node.child_by_field_name("declarator") {
                if let Some(name_node) = decl.child_by_field_name("name") {
                    let name = w.text(name_node).to_string();
                    let idx = w.push_symbol(&name, SymbolKind::Field, node);
                    w.out.symbols[idx].signature = field_signature_of(w.text(node));
                }
            }
        }
        "method_invocation" => {
            if let Some(name) = node.child_by_field_name("name") {
                let name = w.text(name).to_string();
                w.push_ref(&name, RefKind::Call, node);
            }
        }
        "object_creation_expression" => {
            if let Some(ty) = node.child_by_field_name("type") {
                let name = java_type_name(w, ty);
                w.push_ref(&name, RefKind::New, ty);
            }
        }
        _ => {}
    }

    if let Some(idx) = pushed_container {
        w.containers.push(idx);
    }
    let mut cursor = node.walk();
    let children: Vec<Node> = node.children(&mut cursor).collect();
    for child in children {
        walk_java(w, child);
    }
    if pushed_container.is_some() {
        w.containers.pop();
    }
}

/// `new Foo<Bar>()` refs `Foo`; generic wrappers are peeled.
fn java_type_name(w: &Walker, ty: Node) -> String {
    if ty.kind() == "generic_type" {
        let mut cursor = ty.walk();
        for child in ty.named_children(&mut cursor) {
            if child.kind() == "type_identifier" || child.kind() == "scoped_type_identifier" {
                return w.text(child).to_string();
            }
        }
    }
    w.text(ty).to_string()
}

// ---------------------------------------------------------------------------
// C
// ---------------------------------------------------------------------------

pub fn extract_c(source: &str, root: Node) -> ParsedFile {
    let mut w = Walker::new(source);
    walk_c(&mut w, root);
    w.out
}

fn walk_c(w: &mut Walker, node: Node) {
    let mut pushed_container: Option<usize> = None;

    match node.kind() {
        "function_definition" => {
            if let Some(name) = c_function_name(node) {
                let name = w.text(name).to_string();
                let idx = w.push_symbol(&name, SymbolKind::Function, node);
                pushed_container = Some(idx);
            }
        }
        "struct_specifier" => {
            // Named definitions only; `struct Foo x;` is a usage, not a symbol.
            if node.child_by_field_name("body").is_some() {
                if let Some(name) = node.child_by_field_name("name") {
                    let name = w.text(name).to_string();
                    w.push_symbol(&name, SymbolKind::Class, node);
                }
            }
        }
        "call_expression" => {
            if let Some(callee) = node.child_by_field_name("function") {
                if callee.kind() == "identifier" {
                    let name = w.text(callee).to_string();
                    w.push_ref(&name, RefKind::Call, callee);
                }
            }
        }
        "type_identifier" => {
            let name = w.text(node).to_string();
            w.push_ref(&name, RefKind::Type, node);
        }
        _ => {}
    }

    if let Some(idx) = pushed_container {
        w.containers.push(idx);
    }
    let mut cursor = node.walk();
    let children: Vec<Node> = node.children(&mut cursor).collect();
    for child in children {
        walk_c(w, child);
    }
    if pushed_container.is_some() {
        w.containers.pop();
    }
}

/// Dig through pointer declarators to the `function_declarator`'s identifier.
fn c_function_name(def: Node) -> Option<Node> {
    let mut decl = def.child_by_field_name("declarator")?;
    loop {
        match decl.kind() {
            "function_declarator" => {
                let inner = decl.child_by_field_name("declarator")?;
                if inner.kind() == "identifier" {
                    return Some(inner);
                }
                decl = inner;
            }
            "pointer_declarator" | "parenthesized_declarator" => {
                decl = match decl.child_by_field_name("declarator") {
                    Some(d) => Some(d),
                    None => {
                        let mut cursor = decl.walk();
                        let first = decl.named_children(&mut cursor).next();
                        first
                    }
                }?;
            }
            "identifier" => return Some(decl),
            _ => return None,
        }
    }
}

// ---------------------------------------------------------------------------
// Go
// ---------------------------------------------------------------------------

pub fn extract_go(source: &str, root: Node) -> ParsedFile {
    let mut w = Walker::new(source);
    walk_go(&mut w, root);
    w.out
}

fn walk_go(w: &mut Walker, node: Node) {
    let mut pushed_container: Option<usize> = None;

    match node.kind() {
        "function_declaration" => {
            if let Some(name) = node.child_by_field_name("name") {
                let name = w.text(name).to_string();
                let idx = w.push_symbol(&name, SymbolKind::Function, node);
                pushed_container = Some(idx);
            }
        }
        "method_declaration" => {
            if let Some(name) = node.child_by_field_name("name") {
                let name = w.text(name).to_string();
                let idx = w.push_symbol(&name, SymbolKind::Method, node);
                pushed_container = Some(idx);
            }
        }
        "type_spec" => {
            if let Some(name) = node.child_by_field_name("name") {
                let name = w.text(name).to_string();
                w.push_symbol(&name, SymbolKind::Class, node);
            }
        }
        "call_expression" => {
            if let Some(callee) = node.child_by_field_name("function") {
                let name = match callee.kind() {
                    "identifier" => w.text(callee).to_string(),
                    "selector_expression" => callee
                        .child_by_field_name("field")
                        .map(|f| w.text(f).to_string())
                        .unwrap_or_default(),
                    _ => String::new(),
                };
                w.push_ref(&name, RefKind::Call, callee);
            }
        }
        _ => {}
    }

    if let Some(idx) = pushed_container {
        w.containers.push(idx);
    }
    let mut cursor = node.walk();
    let children: Vec<Node> = node.children(&mut cursor).collect();
    for child in children {
        walk_go(w, child);
    }
    if pushed_container.is_some() {
        w.containers.pop();
    }
}

// ---------------------------------------------------------------------------
// Python
// ---------------------------------------------------------------------------

pub fn extract_python(source: &str, root: Node) -> ParsedFile {
    let mut w = Walker::new(source);
    walk_python(&mut w, root);
    w.out
}

fn walk_python(w: &mut Walker, node: Node) {
    let mut pushed_container: Option<usize> = None;

    match node.kind() {
        "function_definition" => {
            if let Some(name) = node.child_by_field_name("name") {
                let name = w.text(name).to_string();
                let kind = if w.inside_class() {
                    SymbolKind::Method
                } else {
                    SymbolKind::Function
                };
                let idx = w.push_symbol(&name, kind, node);
                pushed_container = Some(idx);
            }
        }
        "class_definition" => {
            if let Some(name) = node.child_by_field_name("name") {
                let name = w.text(name).to_string();
                let extends = python_base_classes(w, node);
                let idx = w.push_symbol_with_heritage(&name, SymbolKind::Class, node, extends, vec![]);
                pushed_container = Some(idx);
            }
        }
        "call" => {
            if let Some(callee) = node.child_by_field_name("function") {
                let name = match callee.kind() {
                    "identifier" => w.text(callee).to_string(),
                    "attribute" => callee
                        .child_by_field_name("attribute")
                        .map(|a| w.text(a).to_string())
                        .unwrap_or_default(),
                    _ => String::new(),
                };
                w.push_ref(&name, RefKind::Call, callee);
            }
        }
        _ => {}
    }

    if let Some(idx) = pushed_container {
        w.containers.push(idx);
    }
    let mut cursor = node.walk();
    let children: Vec<Node> = node.children(&mut cursor).collect();
    for child in children {
        walk_python(w, child);
    }
    if pushed_container.is_some() {
        w.containers.pop();
    }
}

fn python_base_classes(w: &Walker, class_def: Node) -> Vec<String> {
    let Some(args) = class_def.child_by_field_name("superclasses") else {
        return vec![];
    };
    let mut cursor = args.walk();
    args.named_children(&mut cursor)
        .filter(|c| c.kind() == "identifier" || c.kind() == "attribute")
        .map(|c| w.text(c).to_string())
        .collect()
}

// ---------------------------------------------------------------------------
// Rust
// ---------------------------------------------------------------------------

pub fn extract_rust(source: &str, root: Node) -> ParsedFile {
    let mut w = Walker::new(source);
    walk_rust(&mut w, root, 0);
    w.out
}

fn walk_rust(w: &mut Walker, node: Node, impl_depth: u32) {
    let mut pushed_container: Option<usize> = None;
    let mut child_impl_depth = impl_depth;

    match node.kind() {
        "function_item" => {
            if let Some(name) = node.child_by_field_name("name") {
                let name = w.text(name).to_string();
                let kind = if impl_depth > 0 {
                    SymbolKind::Method
                } else {
                    SymbolKind::Function
                };
                let idx = w.push_symbol(&name, kind, node);
                pushed_container = Some(idx);
            }
        }
        "struct_item" | "enum_item" | "trait_item" => {
            if let Some(name) = node.child_by_field_name("name") {
                let name = w.text(name).to_string();
                let idx = w.push_symbol(&name, SymbolKind::Class, node);
                pushed_container = Some(idx);
            }
        }
        "impl_item" => {
            if let Some(ty) = node.child_by_field_name("type") {
                let name = heritage_name(w.text(ty));
                let idx = w.push_symbol(&name, SymbolKind::Class, node);
                pushed_container = Some(idx);
            }
            child_impl_depth += 1;
        }
        "call_expression" => {
            if let Some(callee) = node.child_by_field_name("function") {
                let name = match callee.kind() {
                    "identifier" => w.text(callee).to_string(),
                    "scoped_identifier" => callee
                        .child_by_field_name("name")
                        .map(|n| w.text(n).to_string())
                        .unwrap_or_default(),
                    "field_expression" => callee
                        .child_by_field_name("field")
                        .map(|f| w.text(f).to_string())
                        .unwrap_or_default(),
                    _ => String::new(),
                };
                w.push_ref(&name, RefKind::Call, callee);
            }
        }
        _ => {}
    }

    if let Some(idx) = pushed_container {
        w.containers.push(idx);
    }
    let mut cursor = node.walk();
    let children: Vec<Node> = node.children(&mut cursor).collect();
    for child in children {
        walk_rust(w, child, child_impl_depth);
    }
    if pushed_container.is_some() {
        w.containers.pop();
    }
}

// ---------------------------------------------------------------------------
// Markdown: header scanner (no tree-sitter)
// ---------------------------------------------------------------------------

pub fn extract_markdown(source: &str, posix_path: &str) -> ParsedFile {
    let lines: Vec<&str> = source.lines().collect();
    let total = lines.len() as u32;

    struct Header {
        level: usize,
        title: String,
        line: u32, // 1-based
    }

    let mut headers: Vec<Header> = Vec::new();
    let mut in_fence = false;
    for (i, line) in lines.iter().enumerate() {
        let trimmed = line.trim_start();
        if trimmed.starts_with("```") || trimmed.starts_with("~~~") {
            in_fence = !in_fence;
            continue;
        }
        if in_fence {
            continue;
        }
        let hashes = trimmed.chars().take_while(|&c| c == '#').count();
        if hashes == 0 || hashes > 6 {
            continue;
        }
        let rest = &trimmed[hashes..];
        if !rest.starts_with(' ') && !rest.starts_with('\t') {
            continue;
        }
        let title = header_title(rest);
        if title.is_empty() {
            continue;
        }
        headers.push(Header {
            level: hashes,
            title,
            line: i as u32 + 1,
        });
    }

    let mut out = ParsedFile::default();

    if headers.is_empty() {
        out.symbols.push(document_symbol(posix_path, total.max(1)));
        return out;
    }

    // A section runs until the line before the next same-or-shallower header.
    // Nesting: the container is the nearest open shallower section; the
    // breadcrumb signature is the ancestor titles joined with " > ".
    let mut stack: Vec<(usize, usize)> = Vec::new(); // (level, symbol index)
    for (h_idx, h) in headers.iter().enumerate() {
        let end_line = headers[h_idx + 1..]
            .iter()
            .find(|n| n.level <= h.level)
            .map(|n| n.line - 1)
            .unwrap_or(total.max(h.line));

        while stack
            .last()
            .map(|&(lvl, _)| lvl >= h.level)
            .unwrap_or(false)
        {
            stack.pop();
        }

        let breadcrumb = {
            let mut parts: Vec<&str> = stack
                .iter()
                .map(|&(_, idx)| out.symbols[idx].name.as_str())
                .collect();
            parts.push(&h.title);
            parts.join(" > ")
        };

        let idx = out.symbols.len();
        out.symbols.push(Symbol {
            name: h.title.clone(),
            kind: SymbolKind::Section,
            start_line: h.line,
            end_line,
            signature: breadcrumb,
            container: stack.last().map(|&(_, i)| i),
            extends: vec![],
            implements: vec![],
        });
        stack.push((h.level, idx));
    }

    out
}

/// Title of an ATX header, with the CommonMark closing-sequence rule:
/// trailing `#`s are dropped only when preceded by whitespace (or when the
/// title is nothing but `#`s). `## C#` keeps its `#`.
fn header_title(rest: &str) -> String {
    let title = rest.trim();
    let without_hashes = title.trim_end_matches('#');
    if without_hashes.len() < title.len()
        && (without_hashes.is_empty() || without_hashes.ends_with([' ', '\t']))
    {
        return without_hashes.trim_end().to_string();
    }
    title.to_string()
}

fn document_symbol(posix_path: &str, end_line: u32) -> Symbol {
    let base = posix_path.rsplit('/').next().unwrap_or(posix_path);
    Symbol {
        name: base.to_string(),
        kind: SymbolKind::Document,
        start_line: 1,
        end_line,
        signature: posix_path.to_string(),
        container: None,
        extends: vec![],
        implements: vec![],
    }
}

// ---------------------------------------------------------------------------
// YAML: top-level key scanner (no tree-sitter)
// ---------------------------------------------------------------------------

fn yaml_key_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"^\s*([A-Za-z0-9_.-]+)\s*:").unwrap())
}

/// Paths under agent/rule/skill config trees fall back to a whole-file
/// document node when no keys matched.
fn is_configish_path(posix_path: &str) -> bool {
    let padded = format!("/{}", posix_path);
    padded.contains("/.agents/")
        || padded.contains("/templates/agents/")
        || padded.contains("/rules/")
        || padded.contains("/skills/")
}

pub fn extract_yaml(source: &str, posix_path: &str) -> ParsedFile {
    let lines: Vec<&str> = source.lines().collect();
    let total = lines.len() as u32;

    struct Key {
        name: String,
        line: u32,
        signature: String,
    }

    let mut keys: Vec<Key> = Vec::new();
    for (i, line) in lines.iter().enumerate() {
        let trimmed = line.trim_start();
        if trimmed.starts_with('#') || trimmed.starts_with('-') {
            continue;
        }
        if let Some(caps) = yaml_key_re().captures(line) {
            keys.push(Key {
                name: caps[1].to_string(),
                line: i as u32 + 1,
                signature: signature_of(trimmed),
            });
        }
    }

    let mut out = ParsedFile::default();

    if keys.is_empty() {
        if is_configish_path(posix_path) {
            out.symbols.push(document_symbol(posix_path, total.max(1)));
        }
        return out;
    }

    for (k_idx, k) in keys.iter().enumerate() {
        let end_line = keys
            .get(k_idx + 1)
            .map(|n| n.line - 1)
            .unwrap_or(total.max(k.line));
        out.symbols.push(Symbol {
            name: k.name.clone(),
            kind: SymbolKind::Node,
            start_line: k.line,
            end_line,
            signature: k.signature.clone(),
            container: None,
            extends: vec![],
            implements: vec![],
        });
    }

    out
}

// ---------------------------------------------------------------------------
