//! Stateless hashing encoder.
//!
//! Each token is mapped to a bucket by hashing it with blake3, so no
//! vocabulary needs to be learned or persisted. Counts are unsigned and the
//! resulting vector is L2-normalized.

use std::collections::BTreeMap;

use rayon::prelude::*;
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// Version of the token → bucket mapping. Bump when the hashing changes so
/// that old snapshots are not silently mixed with new vectors.
pub const HASH_SCHEME_VERSION: u32 = 1;

/// Tokens shorter than this many characters are ignored.
const MIN_TOKEN_CHARS: usize = 2;

/// A sparse feature vector with strictly increasing indices.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SparseVector {
    pub indices: Vec<u32>,
    pub values: Vec<f32>,
}

impl SparseVector {
    pub fn is_zero(&self) -> bool {
        self.values.iter().all(|v| *v == 0.0)
    }

    pub fn nnz(&self) -> usize {
        self.indices.len()
    }

    pub fn iter(&self) -> impl Iterator<Item = (usize, f32)> + '_ {
        self.indices
            .iter()
            .zip(&self.values)
            .map(|(&i, &v)| (i as usize, v))
    }

    pub fn squared_norm(&self) -> f32 {
        self.values.iter().map(|v| v * v).sum()
    }

    /// Dot product of two sparse vectors (merge over sorted indices).
    pub fn dot(&self, other: &SparseVector) -> f32 {
        let (mut i, mut j) = (0, 0);
        let mut acc = 0.0f32;
        while i < self.indices.len() && j < other.indices.len() {
            match self.indices[i].cmp(&other.indices[j]) {
                std::cmp::Ordering::Less => i += 1,
                std::cmp::Ordering::Greater => j += 1,
                std::cmp::Ordering::Equal => {
                    acc += self.values[i] * other.values[j];
                    i += 1;
                    j += 1;
                }
            }
        }
        acc
    }

    /// Dot product with a dense vector.
    pub fn dot_dense(&self, dense: &[f32]) -> f32 {
        self.iter().map(|(i, v)| v * dense[i]).sum()
    }

    pub fn to_dense(&self, dimension: usize) -> Vec<f32> {
        let mut dense = vec![0.0; dimension];
        for (i, v) in self.iter() {
            dense[i] = v;
        }
        dense
    }
}

/// Cosine similarity between two sparse vectors.
///
/// Returns `None` when either vector has zero magnitude, where the
/// similarity is undefined.
pub fn cosine_similarity(a: &SparseVector, b: &SparseVector) -> Option<f32> {
    let denom = a.squared_norm().sqrt() * b.squared_norm().sqrt();
    if denom <= f32::EPSILON {
        None
    } else {
        Some(a.dot(b) / denom)
    }
}

/// Hashing trick encoder with a fixed output dimensionality.
///
/// # Examples
///
/// ```
/// use streamrank::encoder::FeatureEncoder;
///
/// let encoder = FeatureEncoder::new(1 << 10).unwrap();
/// let a = encoder.encode("hello world");
/// let b = encoder.encode("hello world");
/// assert_eq!(a, b);
/// assert_eq!(a.nnz(), 2);
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct FeatureEncoder {
    n_features: u32,
    scheme_version: u32,
}

impl FeatureEncoder {
    pub fn new(n_features: usize) -> Result<Self> {
        if n_features == 0 || n_features > u32::MAX as usize {
            return Err(Error::Config(format!(
                "invalid feature dimensionality: {n_features}"
            )));
        }
        Ok(Self {
            n_features: n_features as u32,
            scheme_version: HASH_SCHEME_VERSION,
        })
    }

    pub fn n_features(&self) -> usize {
        self.n_features as usize
    }

    pub fn scheme_version(&self) -> u32 {
        self.scheme_version
    }

    /// Fails if this encoder was produced by a different hashing scheme.
    pub fn check_compatible(&self) -> Result<()> {
        if self.scheme_version != HASH_SCHEME_VERSION {
            return Err(Error::Config(format!(
                "encoder hash scheme v{} is not supported (expected v{})",
                self.scheme_version, HASH_SCHEME_VERSION
            )));
        }
        Ok(())
    }

    fn bucket(&self, token: &str) -> u32 {
        let hash = blake3::hash(token.as_bytes());
        let mut head = [0u8; 8];
        head.copy_from_slice(&hash.as_bytes()[..8]);
        (u64::from_le_bytes(head) % u64::from(self.n_features)) as u32
    }

    /// Encode one normalized document.
    pub fn encode(&self, text: &str) -> SparseVector {
        let mut counts: BTreeMap<u32, f32> = BTreeMap::new();
        for token in text.split_whitespace() {
            if token.chars().count() < MIN_TOKEN_CHARS {
                continue;
            }
            *counts.entry(self.bucket(token)).or_insert(0.0) += 1.0;
        }

        let norm = counts.values().map(|c| c * c).sum::<f32>().sqrt();
        let mut vector = SparseVector {
            indices: Vec::with_capacity(counts.len()),
            values: Vec::with_capacity(counts.len()),
        };
        for (index, count) in counts {
            vector.indices.push(index);
            vector.values.push(if norm > 0.0 { count / norm } else { 0.0 });
        }
        vector
    }

    /// Encode a batch of normalized documents in parallel, preserving order.
    pub fn encode_batch(&self, texts: &[String]) -> Vec<SparseVector> {
        texts.par_iter().map(|t| self.encode(t)).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn encoder() -> FeatureEncoder {
        FeatureEncoder::new(1 << 18).unwrap()
    }

    #[test]
    fn identical_input_identical_output() {
        let enc = encoder();
        assert_eq!(
            enc.encode("rust memory safety"),
            enc.encode("rust memory safety")
        );

        // A fresh encoder with the same width maps tokens identically.
        let other = FeatureEncoder::new(1 << 18).unwrap();
        assert_eq!(enc.encode("streaming"), other.encode("streaming"));
    }

    #[test]
    fn vectors_are_unit_length() {
        let v = encoder().encode("the cat sat on the mat");
        assert!((v.squared_norm() - 1.0).abs() < 1e-5);
    }

    #[test]
    fn repeated_tokens_accumulate() {
        let v = encoder().encode("echo echo echo");
        assert_eq!(v.nnz(), 1);
        assert!((v.values[0] - 1.0).abs() < 1e-6);

        let w = encoder().encode("echo echo other");
        assert_eq!(w.nnz(), 2);
        let max = w.values.iter().cloned().fold(0.0f32, f32::max);
        assert!((max - 2.0 / 5.0f32.sqrt()).abs() < 1e-5);
    }

    #[test]
    fn single_character_tokens_are_ignored() {
        let v = encoder().encode("a b c");
        assert!(v.is_zero());
        assert_eq!(v.nnz(), 0);
    }

    #[test]
    fn indices_are_sorted_and_in_range() {
        let enc = FeatureEncoder::new(64).unwrap();
        let v = enc.encode("one two three four five six seven eight nine ten");
        assert!(v.indices.windows(2).all(|w| w[0] < w[1]));
        assert!(v.indices.iter().all(|&i| i < 64));
    }

    #[test]
    fn batch_matches_single_encoding() {
        let enc = encoder();
        let texts = vec!["alpha beta".to_string(), "gamma".to_string()];
        let batch = enc.encode_batch(&texts);
        assert_eq!(batch.len(), 2);
        assert_eq!(batch[0], enc.encode("alpha beta"));
        assert_eq!(batch[1], enc.encode("gamma"));
    }

    #[test]
    fn cosine_of_identical_is_one() {
        let enc = encoder();
        let a = enc.encode("hello world");
        let sim = cosine_similarity(&a, &a).unwrap();
        assert!((sim - 1.0).abs() < 1e-5);
    }

    #[test]
    fn cosine_of_disjoint_is_zero() {
        let enc = encoder();
        let a = enc.encode("hello world");
        let b = enc.encode("quantum chromodynamics");
        let sim = cosine_similarity(&a, &b).unwrap();
        assert!(sim.abs() < 1e-6);
    }

    #[test]
    fn cosine_with_zero_vector_is_undefined() {
        let enc = encoder();
        let a = enc.encode("hello world");
        let zero = SparseVector::default();
        assert!(cosine_similarity(&a, &zero).is_none());
        assert!(cosine_similarity(&zero, &zero).is_none());
    }

    #[test]
    fn dense_conversion_roundtrips_dot() {
        let enc = FeatureEncoder::new(128).unwrap();
        let a = enc.encode("red green blue");
        let b = enc.encode("green blue yellow");
        let dense_b = b.to_dense(128);
        assert!((a.dot(&b) - a.dot_dense(&dense_b)).abs() < 1e-6);
    }

    #[test]
    fn zero_width_rejected() {
        assert!(FeatureEncoder::new(0).is_err());
    }
}
