use sha2::{Digest, Sha256};

use crate::extract::Symbol;

/// Lowercase-hex SHA-256 of the UTF-8 bytes of `s`.
pub fn sha256_hex(s: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(s.as_bytes());
    let digest = hasher.finalize();
    let mut out = String::with_capacity(64);
    for b in digest {
        out.push_str(&format!("{:02x}", b));
    }
    out
}

/// Normalize a path string to POSIX form.
///
/// Every identifier formula in the index hashes the POSIX form of a
/// repo-relative path; absolute paths must never reach these functions.
pub fn to_posix(p: &str) -> String {
    p.replace('\\', "/")
}

/// The canonical chunk text for a symbol occurrence.
///
/// Hashing this string yields the chunk's `content_hash`, the sole dedup key
/// for chunk rows. The file path is part of the text on purpose: identical
/// symbols in different files are distinct chunks.
pub fn chunk_text(posix_path: &str, sym: &Symbol) -> String {
    format!(
        "file:{}\nkind:{}\nname:{}\nsignature:{}",
        posix_path,
        sym.kind.as_str(),
        sym.name,
        sym.signature
    )
}

pub fn content_hash(posix_path: &str, sym: &Symbol) -> String {
    sha256_hex(&chunk_text(posix_path, sym))
}

/// Stable id of one symbol occurrence.
pub fn ref_id(posix_path: &str, sym: &Symbol, content_hash: &str) -> String {
    sha256_hex(&format!(
        "{}:{}:{}:{}:{}:{}",
        posix_path,
        sym.name,
        sym.kind.as_str(),
        sym.start_line,
        sym.end_line,
        content_hash
    ))
}

/// Stable id of a file, derived from its POSIX repo-relative path alone.
pub fn file_id(posix_path: &str) -> String {
    sha256_hex(&format!("file:{}", posix_path))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::extract::{Symbol, SymbolKind};

    fn sym(name: &str, kind: SymbolKind, start: u32, end: u32, sig: &str) -> Symbol {
        Symbol {
            name: name.to_string(),
            kind,
            start_line: start,
            end_line: end,
            signature: sig.to_string(),
            container: None,
            extends: vec![],
            implements: vec![],
        }
    }

    #[test]
    fn sha256_hex_known_vector() {
        // printf 'abc' | sha256sum
        assert_eq!(
            sha256_hex("abc"),
            "ba7816bf8f01cfea414140de5dae2223b00361a396177a9cb410ff61f20015ad"
        );
        assert_eq!(sha256_hex(""), "e3b0c44298fc1c149afbf4c8996fb92427ae41e4649b934ca495991b7852b855");
    }

    #[test]
    fn path_separator_does_not_change_ids() {
        let s = sym("handleAuth", SymbolKind::Function, 1, 1, "export function handleAuth(req)");
        let posix = to_posix("src\\auth\\a.ts");
        assert_eq!(posix, "src/auth/a.ts");
        let h1 = content_hash(&posix, &s);
        let h2 = content_hash("src/auth/a.ts", &s);
        assert_eq!(h1, h2);
        assert_eq!(ref_id(&posix, &s, &h1), ref_id("src/auth/a.ts", &s, &h2));
        assert_eq!(file_id(&posix), file_id("src/auth/a.ts"));
    }

    #[test]
    fn same_symbol_in_different_files_hashes_differently() {
        let s = sym("Project", SymbolKind::Class, 2, 2, "class Project");
        assert_ne!(content_hash("a.ts", &s), content_hash("b.ts", &s));
    }

    #[test]
    fn ref_id_depends_on_lines() {
        let a = sym("f", SymbolKind::Function, 1, 3, "function f()");
        let b = sym("f", SymbolKind::Function, 5, 7, "function f()");
        let h = content_hash("a.ts", &a);
        assert_ne!(ref_id("a.ts", &a, &h), ref_id("a.ts", &b, &h));
    }
}
