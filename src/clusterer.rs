//! Mini-batch k-means over sparse feature vectors.
//!
//! Centroids are seeded lazily with k-means++ from the first batches that
//! arrive and are then moved towards the running mean of every sample ever
//! assigned to them. Each batch is seen exactly once; the result depends on
//! batch order.
//!
//! Centroid rows are dense (`dimension` floats each) and are only allocated
//! once seeded, so an untrained model costs almost nothing.

use rand::{Rng, SeedableRng, rngs::StdRng};
use rayon::prelude::*;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::{
    encoder::SparseVector,
    error::{Error, Result},
};

/// Seed used when none is given explicitly.
pub const DEFAULT_SEED: u64 = 0x5eed_c1a5;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ClusterModel {
    n_clusters: usize,
    dimension: usize,
    /// Row-major centroid matrix holding `seeded * dimension` values.
    centroids: Vec<f32>,
    /// Squared L2 norm of every seeded centroid.
    norms: Vec<f32>,
    /// Number of samples assigned to every seeded centroid so far.
    counts: Vec<u64>,
    seed: u64,
    batches_seen: u64,
}

impl ClusterModel {
    pub fn new(n_clusters: usize, dimension: usize) -> Result<Self> {
        Self::with_seed(n_clusters, dimension, DEFAULT_SEED)
    }

    pub fn with_seed(
        n_clusters: usize,
        dimension: usize,
        seed: u64,
    ) -> Result<Self> {
        if n_clusters == 0 {
            return Err(Error::Config("n_clusters must be at least 1".into()));
        }
        if dimension == 0 {
            return Err(Error::Config("dimension must be at least 1".into()));
        }
        Ok(Self {
            n_clusters,
            dimension,
            centroids: Vec::new(),
            norms: Vec::new(),
            counts: Vec::new(),
            seed,
            batches_seen: 0,
        })
    }

    pub fn n_clusters(&self) -> usize {
        self.n_clusters
    }

    pub fn dimension(&self) -> usize {
        self.dimension
    }

    /// Number of centroids that have been seeded from data.
    pub fn seeded(&self) -> usize {
        self.counts.len()
    }

    pub fn is_fitted(&self) -> bool {
        self.seeded() > 0
    }

    pub fn counts(&self) -> &[u64] {
        &self.counts
    }

    pub fn batches_seen(&self) -> u64 {
        self.batches_seen
    }

    pub fn centroid(&self, index: usize) -> &[f32] {
        let start = index * self.dimension;
        &self.centroids[start..start + self.dimension]
    }

    fn check_dimension(&self, vector: &SparseVector) -> Result<()> {
        match vector.indices.last() {
            Some(&max) if max as usize >= self.dimension => {
                Err(Error::DimensionMismatch {
                    expected: self.dimension,
                    actual: max as usize + 1,
                })
            }
            _ => Ok(()),
        }
    }

    fn squared_distance(&self, vector: &SparseVector, centroid: usize) -> f32 {
        let cross = vector.dot_dense(self.centroid(centroid));
        (vector.squared_norm() - 2.0 * cross + self.norms[centroid]).max(0.0)
    }

    fn nearest(&self, vector: &SparseVector) -> usize {
        let mut best = 0;
        let mut best_dist = f32::INFINITY;
        for c in 0..self.seeded() {
            let dist = self.squared_distance(vector, c);
            if dist < best_dist {
                best_dist = dist;
                best = c;
            }
        }
        best
    }

    /// Index of the centroid closest to `vector`.
    pub fn predict(&self, vector: &SparseVector) -> Result<usize> {
        if !self.is_fitted() {
            return Err(Error::NotTrained);
        }
        self.check_dimension(vector)?;
        Ok(self.nearest(vector))
    }

    pub fn predict_batch(
        &self,
        vectors: &[SparseVector],
    ) -> Result<Vec<usize>> {
        if !self.is_fitted() {
            return Err(Error::NotTrained);
        }
        for v in vectors {
            self.check_dimension(v)?;
        }
        Ok(vectors.par_iter().map(|v| self.nearest(v)).collect())
    }

    /// Update the centroids with one mini-batch.
    ///
    /// Returns the centroid each sample was assigned to, in input order.
    pub fn partial_fit(
        &mut self,
        batch: &[SparseVector],
    ) -> Result<Vec<usize>> {
        if batch.is_empty() {
            return Ok(Vec::new());
        }
        for v in batch {
            self.check_dimension(v)?;
        }

        let mut rng = StdRng::seed_from_u64(self.seed ^ self.batches_seen);
        if self.seeded() < self.n_clusters {
            self.seed_centroids(batch, &mut rng);
        }

        let assignments: Vec<usize> =
            batch.par_iter().map(|v| self.nearest(v)).collect();

        let mut assigned = vec![0u64; self.seeded()];
        for &a in &assignments {
            assigned[a] += 1;
        }

        // Move every touched centroid to the running mean of its samples.
        for (c, &m) in assigned.iter().enumerate() {
            if m == 0 {
                continue;
            }
            let old = self.counts[c];
            let new = old + m;
            let keep = old as f32 / new as f32;
            let start = c * self.dimension;
            for value in &mut self.centroids[start..start + self.dimension] {
                *value *= keep;
            }
            self.counts[c] = new;
        }
        for (vector, &c) in batch.iter().zip(&assignments) {
            let weight = 1.0 / self.counts[c] as f32;
            let start = c * self.dimension;
            for (i, v) in vector.iter() {
                self.centroids[start + i] += v * weight;
            }
        }
        for (c, &m) in assigned.iter().enumerate() {
            if m > 0 {
                self.norms[c] = self.centroid(c).iter().map(|x| x * x).sum();
            }
        }

        self.batches_seen += 1;
        Ok(assignments)
    }

    /// k-means++ seeding of the remaining centroids from `batch`.
    fn seed_centroids(&mut self, batch: &[SparseVector], rng: &mut StdRng) {
        let before = self.seeded();

        if self.seeded() == 0 {
            let first = rng.random_range(0..batch.len());
            self.push_centroid(&batch[first]);
        }

        // Squared distance of every sample to its closest seeded centroid.
        let mut min_dist: Vec<f32> = batch
            .par_iter()
            .map(|v| {
                (0..self.seeded())
                    .map(|c| self.squared_distance(v, c))
                    .fold(f32::INFINITY, f32::min)
            })
            .collect();

        while self.seeded() < self.n_clusters {
            let total: f64 = min_dist.iter().map(|&d| f64::from(d)).sum();
            if total <= f64::from(f32::EPSILON) {
                // Every sample coincides with an existing centroid.
                break;
            }
            let mut target = rng.random::<f64>() * total;
            let mut chosen =
                min_dist.iter().rposition(|&d| d > 0.0).unwrap_or(0);
            for (i, &d) in min_dist.iter().enumerate() {
                target -= f64::from(d);
                if target <= 0.0 && d > 0.0 {
                    chosen = i;
                    break;
                }
            }
            self.push_centroid(&batch[chosen]);

            let newest = self.seeded() - 1;
            min_dist
                .par_iter_mut()
                .zip(batch.par_iter())
                .for_each(|(d, v)| {
                    *d = d.min(self.squared_distance(v, newest));
                });
        }

        debug!(
            seeded = self.seeded(),
            new = self.seeded() - before,
            n_clusters = self.n_clusters,
            "seeded centroids"
        );
    }

    fn push_centroid(&mut self, vector: &SparseVector) {
        let start = self.centroids.len();
        self.centroids.resize(start + self.dimension, 0.0);
        for (i, v) in vector.iter() {
            self.centroids[start + i] = v;
        }
        self.norms.push(vector.squared_norm());
        self.counts.push(0);
    }
}
