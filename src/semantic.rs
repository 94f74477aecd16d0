use anyhow::Result;
use serde::Serialize;
use std::collections::HashSet;

use crate::embedding::{cosine_similarity, dequantize, hash_embedding, quantize_sq8, qvec_from_b64};
use crate::parser::IndexLang;
use crate::store::{RefRow, VectorStore};

// ---------------------------------------------------------------------------
// Semantic search: brute-force cosine over the quantized chunk tables. No
// ANN index: the corpus is one repository, a full scan per language is the
// design.
// ---------------------------------------------------------------------------

/// At most this many ref rows are attached to each hit.
const MAX_REFS_PER_HIT: usize = 5;

#[derive(Debug, Clone, Serialize)]
pub struct SemanticHit {
    pub lang: IndexLang,
    pub content_hash: String,
    pub score: f32,
    pub text: String,
    pub refs: Vec<RefRow>,
}

/// The query travels through the same quantizer as the chunks, so both sides
/// carry the same quantization error.
pub fn build_query_vector(text: &str, dim: usize) -> Vec<f32> {
    let q = quantize_sq8(&hash_embedding(text, dim));
    dequantize(&q.q, q.scale)
}

pub fn semantic_search(
    store: &VectorStore,
    text: &str,
    dim: usize,
    top_k: usize,
    languages: &[IndexLang],
) -> Result<Vec<SemanticHit>> {
    let query = build_query_vector(text, dim);

    let mut hits: Vec<SemanticHit> = Vec::new();
    for &lang in languages {
        for chunk in store.scan_chunks(lang)? {
            let Some(q) = qvec_from_b64(&chunk.qvec_b64) else {
                continue;
            };
            let vec = dequantize(&q, chunk.scale);
            let score = cosine_similarity(&query, &vec);
            hits.push(SemanticHit {
                lang,
                content_hash: chunk.content_hash,
                score,
                text: chunk.text,
                refs: vec![],
            });
        }
    }

    // Stable sort: ties keep insertion (scan) order.
    hits.sort_by(|a, b| b.score.partial_cmp(&a.score).unwrap_or(std::cmp::Ordering::Equal));
    hits.truncate(top_k);

    attach_refs(store, &mut hits)?;
    Ok(hits)
}

/// Pull ref rows for the surviving hashes, language by language, and attach
/// up to `MAX_REFS_PER_HIT` to each hit.
fn attach_refs(store: &VectorStore, hits: &mut [SemanticHit]) -> Result<()> {
    let mut langs: Vec<IndexLang> = hits.iter().map(|h| h.lang).collect();
    langs.sort();
    langs.dedup();

    for lang in langs {
        let wanted: HashSet<String> = hits
            .iter()
            .filter(|h| h.lang == lang)
            .map(|h| h.content_hash.clone())
            .collect();
        let rows = store.refs_for_hashes(lang, &wanted)?;
        for hit in hits.iter_mut().filter(|h| h.lang == lang) {
            hit.refs = rows
                .iter()
                .filter(|r| r.content_hash == hit.content_hash)
                .take(MAX_REFS_PER_HIT)
                .cloned()
                .collect();
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::indexer::{index_repository, IndexOptions};
    use crate::meta::vector_dir;
    use crate::store::OpenMode;
    use std::path::PathBuf;

    #[test]
    fn semantic_hit_carries_matching_ref() {
        let tmp = tempfile::tempdir().unwrap();
        std::fs::write(
            tmp.path().join("a.ts"),
            "export function handleAuth(req) { return parse(req); }\nclass Matrix {}\n",
        )
        .unwrap();

        let opts = IndexOptions {
            repo_root: tmp.path().to_path_buf(),
            scan_root: PathBuf::from("."),
            dim: 64,
            overwrite: true,
        };
        index_repository(&opts, None, None).unwrap();

        let store = VectorStore::open(
            &vector_dir(tmp.path()),
            64,
            OpenMode::OpenOnly,
            &[IndexLang::Ts],
        )
        .unwrap();

        let hits =
            semantic_search(&store, "authentication handler", 64, 1, &[IndexLang::Ts]).unwrap();
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].refs.len(), 1);
        assert_eq!(hits[0].refs[0].symbol, "handleAuth");
    }

    #[test]
    fn top_k_bounds_results_and_order_is_descending() {
        let tmp = tempfile::tempdir().unwrap();
        std::fs::write(
            tmp.path().join("a.py"),
            "def alpha():\n    pass\n\ndef beta():\n    pass\n\ndef gamma():\n    pass\n",
        )
        .unwrap();
        let opts = IndexOptions {
            repo_root: tmp.path().to_path_buf(),
            scan_root: PathBuf::from("."),
            dim: 16,
            overwrite: true,
        };
        index_repository(&opts, None, None).unwrap();
        let store = VectorStore::open(
            &vector_dir(tmp.path()),
            16,
            OpenMode::OpenOnly,
            &[IndexLang::Python],
        )
        .unwrap();

        let hits = semantic_search(&store, "alpha", 16, 2, &[IndexLang::Python]).unwrap();
        assert_eq!(hits.len(), 2);
        assert!(hits[0].score >= hits[1].score);
    }
}
