//! Record embeddings: an optional async backend hook plus a local
//! feature-hashed fallback that needs no model.

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

/// Async embedding backend.  Returns `None` when the backend is unavailable;
/// the store then falls back to [`hashed_embedding`].
pub type EmbedFn =
    Arc<dyn Fn(String) -> Pin<Box<dyn Future<Output = Option<Vec<f32>>> + Send>> + Send + Sync>;

const FNV_OFFSET: u64 = 0xcbf2_9ce4_8422_2325;
const FNV_PRIME: u64 = 0x0000_0100_0000_01b3;

fn fnv1a(bytes: &[u8]) -> u64 {
    bytes.iter().fold(FNV_OFFSET, |hash, b| {
        (hash ^ u64::from(*b)).wrapping_mul(FNV_PRIME)
    })
}

/// Bag-of-words embedding with signed feature hashing, L2-normalised.
///
/// ASCII words hash whole; words with non-ASCII characters (e.g. Japanese,
/// which has no spaces) hash as character bigrams so that overlapping text
/// still lands close together.  Empty input yields the zero vector.
pub fn hashed_embedding(text: &str, dim: usize) -> Vec<f32> {
    let mut vector = vec![0.0f32; dim.max(1)];
    let mut add = |feature: &str| {
        let hash = fnv1a(feature.as_bytes());
        let slot = (hash % vector.len() as u64) as usize;
        let sign = if hash >> 63 == 0 { 1.0 } else { -1.0 };
        vector[slot] += sign;
    };

    for word in text
        .split(|c: char| !c.is_alphanumeric())
        .filter(|w| !w.is_empty())
    {
        let word = word.to_lowercase();
        if word.is_ascii() {
            add(&word);
        } else {
            let chars: Vec<char> = word.chars().collect();
            if chars.len() == 1 {
                add(&word);
            }
            for pair in chars.windows(2) {
                add(&pair.iter().collect::<String>());
            }
        }
    }

    let norm = vector.iter().map(|x| x * x).sum::<f32>().sqrt();
    if norm > 0.0 {
        for x in &mut vector {
            *x /= norm;
        }
    }
    vector
}

/// Cosine similarity in `[-1, 1]`; zero when the lengths differ or either
/// side is the zero vector.
pub fn cosine_similarity(a: &[f32], b: &[f32]) -> f32 {
    if a.len() != b.len() || a.is_empty() {
        return 0.0;
    }
    let dot: f32 = a.iter().zip(b.iter()).map(|(x, y)| x * y).sum();
    let mag_a: f32 = a.iter().map(|x| x * x).sum::<f32>().sqrt();
    let mag_b: f32 = b.iter().map(|x| x * x).sum::<f32>().sqrt();
    if mag_a == 0.0 || mag_b == 0.0 {
        return 0.0;
    }
    (dot / (mag_a * mag_b)).clamp(-1.0, 1.0)
}
