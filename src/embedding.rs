use serde::{Deserialize, Serialize};

use crate::ids::sha256_hex;

// ---------------------------------------------------------------------------
// Hashed bag-of-tokens embeddings + SQ8 scalar quantization.
//
// The embedding is deterministic: no model, no weights. Tokens are hashed
// into a fixed-dimension signed histogram which is then L2-normalized.
// Reindexing the same text on any platform yields the same vector, which is
// what makes content-addressed dedup of chunk rows sound.
// ---------------------------------------------------------------------------

/// A scalar-quantized vector: int8 components plus a per-vector scale.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QuantizedVec {
    pub dim: usize,
    pub scale: f32,
    pub q: Vec<i8>,
}

/// Tokenize as lowercase maximal runs of `[A-Za-z0-9_]`, splitting tokens
/// longer than 6 chars into head/mid/tail pieces so that long identifiers
/// still collide with their prefixes ("handleAuthRequest" shares pieces with
/// "handleAuth").
fn tokenize(text: &str) -> Vec<String> {
    let lower = text.to_lowercase();
    let mut tokens: Vec<String> = Vec::new();
    let mut cur = String::new();
    for ch in lower.chars() {
        if ch.is_ascii_alphanumeric() || ch == '_' {
            cur.push(ch);
        } else if !cur.is_empty() {
            push_token_pieces(&mut tokens, &cur);
            cur.clear();
        }
    }
    if !cur.is_empty() {
        push_token_pieces(&mut tokens, &cur);
    }
    tokens
}

fn push_token_pieces(out: &mut Vec<String>, token: &str) {
    if token.len() > 6 {
        out.push(token[0..3].to_string());
        out.push(token[3..6].to_string());
        out.push(token[6..].to_string());
    } else {
        out.push(token.to_string());
    }
}

/// Deterministic hashed embedding: each token lands at
/// `parseInt(sha256[0..8], 16) % dim` with a sign from byte 4's low bit.
/// Accumulation order is the token order, so the result is bit-stable.
pub fn hash_embedding(text: &str, dim: usize) -> Vec<f32> {
    let mut vec = vec![0.0f32; dim.max(1)];
    for token in tokenize(text) {
        let h = sha256_hex(&token);
        // First 8 hex chars → bucket, next 2 → sign.
        let idx = u32::from_str_radix(&h[0..8], 16).unwrap_or(0) as usize % vec.len();
        let sign_byte = u32::from_str_radix(&h[8..10], 16).unwrap_or(0);
        let sign = if sign_byte & 1 == 0 { 1.0f32 } else { -1.0f32 };
        vec[idx] += sign;
    }
    let norm: f32 = vec.iter().map(|x| x * x).sum::<f32>().sqrt();
    if norm > 0.0 {
        for x in vec.iter_mut() {
            *x /= norm;
        }
    }
    vec
}

/// Scalar-quantize to int8 with a per-vector scale of `max(|v|)/127`.
/// An all-zero vector quantizes to scale 1.0 and all-zero components.
pub fn quantize_sq8(vec: &[f32]) -> QuantizedVec {
    let max_abs = vec.iter().fold(0.0f32, |m, x| m.max(x.abs()));
    if max_abs == 0.0 {
        return QuantizedVec {
            dim: vec.len(),
            scale: 1.0,
            q: vec![0; vec.len()],
        };
    }
    let scale = max_abs / 127.0;
    let q = vec
        .iter()
        .map(|x| (x / scale).round().clamp(-127.0, 127.0) as i8)
        .collect();
    QuantizedVec {
        dim: vec.len(),
        scale,
        q,
    }
}

pub fn dequantize(q: &[i8], scale: f32) -> Vec<f32> {
    q.iter().map(|&v| v as f32 * scale).collect()
}

pub fn cosine_similarity(a: &[f32], b: &[f32]) -> f32 {
    if a.len() != b.len() || a.is_empty() {
        return 0.0;
    }
    let dot: f32 = a.iter().zip(b.iter()).map(|(x, y)| x * y).sum();
    let norm_a: f32 = a.iter().map(|x| x * x).sum::<f32>().sqrt();
    let norm_b: f32 = b.iter().map(|x| x * x).sum::<f32>().sqrt();
    if norm_a == 0.0 || norm_b == 0.0 {
        return 0.0;
    }
    dot / (norm_a * norm_b)
}

/// Encode quantized components as base64 of the raw int8 bytes.
pub fn qvec_to_b64(q: &[i8]) -> String {
    use base64::Engine as _;
    let bytes: Vec<u8> = q.iter().map(|&v| v as u8).collect();
    base64::engine::general_purpose::STANDARD.encode(bytes)
}

/// Decode a `qvec_b64` column back into int8 components.
pub fn qvec_from_b64(b64: &str) -> Option<Vec<i8>> {
    use base64::Engine as _;
    let bytes = base64::engine::general_purpose::STANDARD.decode(b64).ok()?;
    Some(bytes.into_iter().map(|b| b as i8).collect())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tokenizer_splits_long_identifiers() {
        let toks = tokenize("handleAuth parse_req x");
        // "handleauth" (10 chars) → "han" "dle" "auth"; "parse_req" → "par" "se_" "req".
        assert_eq!(toks, vec!["han", "dle", "auth", "par", "se_", "req", "x"]);
    }

    #[test]
    fn embedding_is_deterministic_and_normalized() {
        let a = hash_embedding("authentication handler", 64);
        let b = hash_embedding("authentication handler", 64);
        assert_eq!(a, b);
        let norm: f32 = a.iter().map(|x| x * x).sum::<f32>().sqrt();
        assert!((norm - 1.0).abs() < 1e-5, "norm {norm}");
    }

    #[test]
    fn empty_text_embeds_to_zero() {
        let v = hash_embedding("", 16);
        assert!(v.iter().all(|&x| x == 0.0));
        let q = quantize_sq8(&v);
        assert_eq!(q.scale, 1.0);
        assert!(q.q.iter().all(|&x| x == 0));
    }

    #[test]
    fn quantization_round_trip_bound() {
        let v = hash_embedding("the quick brown fox jumps over the lazy dog", 32);
        let q = quantize_sq8(&v);
        let back = dequantize(&q.q, q.scale);
        for (orig, deq) in v.iter().zip(back.iter()) {
            assert!(
                (orig - deq).abs() <= q.scale,
                "component error {} exceeds scale {}",
                (orig - deq).abs(),
                q.scale
            );
        }
    }

    #[test]
    fn qvec_b64_round_trip() {
        let q: Vec<i8> = vec![-127, -1, 0, 1, 127, 42];
        let b64 = qvec_to_b64(&q);
        assert_eq!(qvec_from_b64(&b64).unwrap(), q);
    }

    #[test]
    fn similar_texts_score_higher_than_unrelated() {
        let dim = 256;
        let q = dequantize_quantized(&hash_embedding("authentication handler", dim));
        let hit = dequantize_quantized(&hash_embedding(
            "file:a.ts\nkind:function\nname:handleAuth\nsignature:export function handleAuth(req)",
            dim,
        ));
        let miss = dequantize_quantized(&hash_embedding(
            "file:b.ts\nkind:class\nname:Matrix\nsignature:class Matrix",
            dim,
        ));
        assert!(cosine_similarity(&q, &hit) > cosine_similarity(&q, &miss));
    }

    fn dequantize_quantized(v: &[f32]) -> Vec<f32> {
        let q = quantize_sq8(v);
        dequantize(&q.q, q.scale)
    }
}
