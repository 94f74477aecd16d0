use serde::{Deserialize, Serialize};
use tree_sitter::{Language, Parser};

use crate::extract::{
    extract_c, extract_go, extract_java, extract_markdown, extract_python, extract_rust,
    extract_typescript, extract_yaml, ParsedFile,
};

/// Languages the index understands. Markdown and YAML are scanner-parsed;
/// the rest carry a tree-sitter grammar.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum IndexLang {
    Java,
    Ts,
    C,
    Go,
    Python,
    Rust,
    Markdown,
    Yaml,
}

impl IndexLang {
    pub const ALL: [IndexLang; 8] = [
        IndexLang::Java,
        IndexLang::Ts,
        IndexLang::C,
        IndexLang::Go,
        IndexLang::Python,
        IndexLang::Rust,
        IndexLang::Markdown,
        IndexLang::Yaml,
    ];

    /// `lang=auto` resolution order.
    pub const PREFERENCE: [IndexLang; 8] = [
        IndexLang::Java,
        IndexLang::Ts,
        IndexLang::Python,
        IndexLang::Go,
        IndexLang::Rust,
        IndexLang::C,
        IndexLang::Markdown,
        IndexLang::Yaml,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            IndexLang::Java => "java",
            IndexLang::Ts => "ts",
            IndexLang::C => "c",
            IndexLang::Go => "go",
            IndexLang::Python => "python",
            IndexLang::Rust => "rust",
            IndexLang::Markdown => "markdown",
            IndexLang::Yaml => "yaml",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        Some(match s {
            "java" => IndexLang::Java,
            "ts" => IndexLang::Ts,
            "c" => IndexLang::C,
            "go" => IndexLang::Go,
            "python" => IndexLang::Python,
            "rust" => IndexLang::Rust,
            "markdown" => IndexLang::Markdown,
            "yaml" => IndexLang::Yaml,
            _ => return None,
        })
    }
}

/// Extensions the scanner enumerates. Anything outside this set never
/// reaches the parser.
pub const INDEXED_EXTENSIONS: [&str; 16] = [
    "java", "c", "h", "go", "py", "rs", "md", "mdx", "yml", "yaml", "ts", "tsx", "js", "jsx",
    "mjs", "cjs",
];

/// Authoritative extension routing; unknown extensions fall through to the
/// TypeScript grammar (it covers the JS family).
pub fn route_extension(ext: &str) -> IndexLang {
    match ext {
        "java" => IndexLang::Java,
        "c" | "h" => IndexLang::C,
        "go" => IndexLang::Go,
        "py" => IndexLang::Python,
        "rs" => IndexLang::Rust,
        "md" | "mdx" => IndexLang::Markdown,
        "yml" | "yaml" => IndexLang::Yaml,
        _ => IndexLang::Ts,
    }
}

pub fn route_path(posix_path: &str) -> IndexLang {
    route_extension(&path_ext_lower(posix_path))
}

pub fn path_ext_lower(posix_path: &str) -> String {
    std::path::Path::new(posix_path)
        .extension()
        .and_then(|e| e.to_str())
        .unwrap_or("")
        .to_lowercase()
}

fn grammar_for(lang: IndexLang, posix_path: &str) -> Option<Language> {
    Some(match lang {
        IndexLang::Java => tree_sitter_java::language(),
        IndexLang::C => tree_sitter_c::language(),
        IndexLang::Go => tree_sitter_go::language(),
        IndexLang::Python => tree_sitter_python::language(),
        IndexLang::Rust => tree_sitter_rust::language(),
        IndexLang::Ts => {
            let ext = path_ext_lower(posix_path);
            if ext == "tsx" || ext == "jsx" {
                tree_sitter_typescript::language_tsx()
            } else {
                tree_sitter_typescript::language_typescript()
            }
        }
        IndexLang::Markdown | IndexLang::Yaml => return None,
    })
}

/// Parse one file into `(symbols, refs)`.
///
/// Never fails: a file whose grammar cannot load or whose parse dies twice
/// contributes zero rows. The parse is retried exactly once with a fresh
/// parser before giving up.
pub fn parse_source(posix_path: &str, source: &str) -> ParsedFile {
    let lang = route_path(posix_path);
    match lang {
        IndexLang::Markdown => return extract_markdown(source, posix_path),
        IndexLang::Yaml => return extract_yaml(source, posix_path),
        _ => {}
    }

    let Some(grammar) = grammar_for(lang, posix_path) else {
        return ParsedFile::default();
    };

    let tree = match parse_with_retry(&grammar, source) {
        Some(t) => t,
        None => {
            crate::debug_log!("[codescope] parse failed twice: {}", posix_path);
            return ParsedFile::default();
        }
    };
    let root = tree.root_node();

    match lang {
        IndexLang::Java => extract_java(source, root),
        IndexLang::Ts => extract_typescript(source, root),
        IndexLang::C => extract_c(source, root),
        IndexLang::Go => extract_go(source, root),
        IndexLang::Python => extract_python(source, root),
        IndexLang::Rust => extract_rust(source, root),
        IndexLang::Markdown | IndexLang::Yaml => unreachable!("scanner languages handled above"),
    }
}

fn parse_with_retry(grammar: &Language, source: &str) -> Option<tree_sitter::Tree> {
    for _ in 0..2 {
        let mut parser = Parser::new();
        if parser.set_language(grammar).is_err() {
            // Grammar/runtime ABI mismatch: nothing a retry can fix.
            return None;
        }
        if let Some(tree) = parser.parse(source, None) {
            return Some(tree);
        }
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::extract::SymbolKind;

    #[test]
    fn routing_table_is_authoritative() {
        assert_eq!(route_extension("java"), IndexLang::Java);
        assert_eq!(route_extension("h"), IndexLang::C);
        assert_eq!(route_extension("go"), IndexLang::Go);
        assert_eq!(route_extension("py"), IndexLang::Python);
        assert_eq!(route_extension("rs"), IndexLang::Rust);
        assert_eq!(route_extension("mdx"), IndexLang::Markdown);
        assert_eq!(route_extension("yml"), IndexLang::Yaml);
        for ext in ["ts", "tsx", "js", "jsx", "mjs", "cjs"] {
            assert_eq!(route_extension(ext), IndexLang::Ts);
        }
        // Fallthrough.
        assert_eq!(route_extension("weird"), IndexLang::Ts);
    }

    #[test]
    fn parse_source_dispatches_by_extension() {
        let ts = parse_source("a.ts", "export function handleAuth(req) { return req; }");
        assert!(ts
            .symbols
            .iter()
            .any(|s| s.name == "handleAuth" && s.kind == SymbolKind::Function));

        let py = parse_source("b.py", "def main():\n    pass\n");
        assert!(py.symbols.iter().any(|s| s.name == "main"));

        let md = parse_source("c.md", "# Title\nbody\n");
        assert!(md.symbols.iter().any(|s| s.kind == SymbolKind::Section));
    }

    #[test]
    fn tsx_uses_the_tsx_grammar() {
        let parsed = parse_source("app.tsx", "export function App() { return <div>hi</div>; }");
        assert!(parsed.symbols.iter().any(|s| s.name == "App"));
    }

    #[test]
    fn garbage_input_yields_empty_not_error() {
        // Severely broken source still parses (tree-sitter is error-tolerant),
        // and whatever cannot be recognized contributes nothing.
        let parsed = parse_source("broken.rs", "fn {{{{");
        assert!(parsed.symbols.is_empty());
    }
}
