//! K-means and mini-batch k-means over feature matrices.

use std::collections::HashSet;

use rand::{Rng, SeedableRng, rngs::StdRng};
use rayon::prelude::*;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::features::FeatureMatrix;

/// Label maps store cluster ids as `u8`; the original tool capped models at eight clusters.
pub const MAX_CLUSTERS: usize = 8;

#[derive(Error, Debug, Clone, PartialEq)]
pub enum FitFailure {
    #[error("cluster count {0} outside 2..={MAX_CLUSTERS}")]
    InvalidClusterCount(usize),
    #[error("only {distinct} distinct samples for {requested} clusters")]
    TooFewSamples { distinct: usize, requested: usize },
    #[error("did not converge within {max_iter} iterations")]
    DidNotConverge { max_iter: usize },
    #[error("non-finite inertia")]
    NonFinite,
}

/// Fitted cluster centres
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Centroids {
    dims: usize,
    data: Vec<f32>,
}

impl Centroids {
    pub fn new(dims: usize, data: Vec<f32>) -> Self {
        Self { dims, data }
    }

    pub fn dims(&self) -> usize {
        self.dims
    }

    pub fn len(&self) -> usize {
        if self.dims == 0 { 0 } else { self.data.len() / self.dims }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn centroid(&self, index: usize) -> &[f32] {
        &self.data[index * self.dims..(index + 1) * self.dims]
    }

    pub fn iter(&self) -> std::slice::ChunksExact<'_, f32> {
        self.data.chunks_exact(self.dims.max(1))
    }

    /// Index of and squared distance to the nearest centre. Ties go to the lower index.
    pub fn nearest(&self, point: &[f32]) -> (usize, f32) {
        let mut best = (0, f32::INFINITY);
        for (i, centroid) in self.iter().enumerate() {
            let d = squared_distance(point, centroid);
            if d < best.1 {
                best = (i, d);
            }
        }
        best
    }

    pub fn assign(&self, features: &FeatureMatrix) -> Vec<u8> {
        features
            .as_slice()
            .par_chunks(features.dims().max(1))
            .map(|row| self.nearest(row).0 as u8)
            .collect()
    }

    pub fn inertia(&self, features: &FeatureMatrix) -> f64 {
        // collected before summing so the result does not depend on thread scheduling
        let distances: Vec<f32> = features
            .as_slice()
            .par_chunks(features.dims().max(1))
            .map(|row| self.nearest(row).1)
            .collect();
        distances.iter().map(|&d| d as f64).sum()
    }
}

pub fn squared_distance(a: &[f32], b: &[f32]) -> f32 {
    a.iter().zip(b).map(|(x, y)| (x - y) * (x - y)).sum()
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct KMeansParams {
    pub n_clusters: usize,
    pub max_iter: usize,
    pub n_init: usize,
    pub tol: f64,
    pub seed: u64,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct MiniBatchParams {
    pub n_clusters: usize,
    pub batch_size: usize,
    pub max_iter: usize,
    pub tol: f64,
    pub seed: u64,
}

#[derive(Debug, Clone, PartialEq)]
pub struct KMeansFit {
    pub centroids: Centroids,
    pub inertia: f64,
    pub iterations: usize,
}

/// Lloyd's k-means with k-means++ seeding; the best of `n_init` converged runs wins.
pub fn fit_kmeans(features: &FeatureMatrix, params: &KMeansParams) -> Result<KMeansFit, FitFailure> {
    check_fit_inputs(features, params.n_clusters)?;
    let tol = absolute_tolerance(features, params.tol);

    let mut best: Option<KMeansFit> = None;
    for run in 0..params.n_init.max(1) {
        let mut rng = StdRng::seed_from_u64(params.seed.wrapping_add(run as u64));
        let initial = kmeans_plus_plus(features, params.n_clusters, &mut rng);
        let Some((centroids, iterations)) = lloyd(features, initial, params.max_iter, tol) else {
            tracing::debug!(run, max_iter = params.max_iter, "k-means run did not converge");
            continue;
        };
        let inertia = centroids.inertia(features);
        if best.as_ref().is_none_or(|b| inertia < b.inertia) {
            best = Some(KMeansFit {
                centroids,
                inertia,
                iterations,
            });
        }
    }

    let fit = best.ok_or(FitFailure::DidNotConverge {
        max_iter: params.max_iter,
    })?;
    if !fit.inertia.is_finite() {
        return Err(FitFailure::NonFinite);
    }
    Ok(fit)
}

/// Mini-batch k-means with per-centre learning rates.
pub fn fit_minibatch(features: &FeatureMatrix, params: &MiniBatchParams) -> Result<KMeansFit, FitFailure> {
    check_fit_inputs(features, params.n_clusters)?;
    let tol = absolute_tolerance(features, params.tol);
    let dims = features.dims();
    let n = features.len();
    let batch_size = params.batch_size.clamp(1, n);

    let mut rng = StdRng::seed_from_u64(params.seed);
    let mut centroids = kmeans_plus_plus(features, params.n_clusters, &mut rng);
    let mut counts = vec![0u64; params.n_clusters];
    let mut batch = Vec::with_capacity(batch_size);

    for iteration in 0..params.max_iter {
        batch.clear();
        batch.extend((0..batch_size).map(|_| rng.random_range(0..n)));

        let previous = centroids.data.clone();
        for &i in &batch {
            let row = features.row(i);
            let (c, _) = centroids.nearest(row);
            counts[c] += 1;
            let eta = 1.0 / counts[c] as f32;
            for d in 0..dims {
                let v = &mut centroids.data[c * dims + d];
                *v += eta * (row[d] - *v);
            }
        }

        let shift: f64 = previous
            .iter()
            .zip(&centroids.data)
            .map(|(a, b)| ((a - b) * (a - b)) as f64)
            .sum();
        if shift <= tol {
            let inertia = centroids.inertia(features);
            if !inertia.is_finite() {
                return Err(FitFailure::NonFinite);
            }
            return Ok(KMeansFit {
                centroids,
                inertia,
                iterations: iteration + 1,
            });
        }
    }

    Err(FitFailure::DidNotConverge {
        max_iter: params.max_iter,
    })
}

fn check_fit_inputs(features: &FeatureMatrix, n_clusters: usize) -> Result<(), FitFailure> {
    if !(2..=MAX_CLUSTERS).contains(&n_clusters) {
        return Err(FitFailure::InvalidClusterCount(n_clusters));
    }
    let distinct = count_distinct(features, n_clusters);
    if distinct < n_clusters {
        return Err(FitFailure::TooFewSamples {
            distinct,
            requested: n_clusters,
        });
    }
    Ok(())
}

/// Distinct rows, counting no further than `limit`.
fn count_distinct(features: &FeatureMatrix, limit: usize) -> usize {
    let mut seen: HashSet<Vec<u32>> = HashSet::new();
    for row in features.rows() {
        seen.insert(row.iter().map(|v| v.to_bits()).collect());
        if seen.len() >= limit {
            break;
        }
    }
    seen.len()
}

/// Tolerance scaled by the mean per-dimension variance of the data.
fn absolute_tolerance(features: &FeatureMatrix, tol: f64) -> f64 {
    let dims = features.dims();
    let n = features.len() as f64;
    let mut sum = vec![0f64; dims];
    let mut sum_sq = vec![0f64; dims];
    for row in features.rows() {
        for d in 0..dims {
            let v = row[d] as f64;
            sum[d] += v;
            sum_sq[d] += v * v;
        }
    }
    let mean_variance = (0..dims)
        .map(|d| (sum_sq[d] / n - (sum[d] / n).powi(2)).max(0.0))
        .sum::<f64>()
        / dims.max(1) as f64;
    tol * mean_variance
}

fn kmeans_plus_plus(features: &FeatureMatrix, k: usize, rng: &mut StdRng) -> Centroids {
    let n = features.len();
    let dims = features.dims();
    let mut data = Vec::with_capacity(k * dims);
    data.extend_from_slice(features.row(rng.random_range(0..n)));

    let mut closest: Vec<f32> = features
        .rows()
        .map(|row| squared_distance(row, &data[..dims]))
        .collect();

    while data.len() < k * dims {
        let total: f64 = closest.iter().map(|&d| d as f64).sum();
        let mut target = rng.random::<f64>() * total;
        let mut chosen = n - 1;
        for (i, &d) in closest.iter().enumerate() {
            if d > 0.0 && target < d as f64 {
                chosen = i;
                break;
            }
            target -= d as f64;
        }
        if closest[chosen] == 0.0 {
            // rounding pushed past the end; take the farthest point instead
            chosen = farthest(&closest);
        }

        let start = data.len();
        data.extend_from_slice(features.row(chosen));
        let centre = data[start..].to_vec();
        for (d, row) in closest.iter_mut().zip(features.rows()) {
            *d = d.min(squared_distance(row, &centre));
        }
    }

    Centroids::new(dims, data)
}

fn farthest(distances: &[f32]) -> usize {
    let mut best = (0, f32::NEG_INFINITY);
    for (i, &d) in distances.iter().enumerate() {
        if d > best.1 {
            best = (i, d);
        }
    }
    best.0
}

/// Returns the converged centres and iteration count, or `None` if `max_iter` ran out.
fn lloyd(features: &FeatureMatrix, mut centroids: Centroids, max_iter: usize, tol: f64) -> Option<(Centroids, usize)> {
    let dims = features.dims();
    let k = centroids.len();

    for iteration in 0..max_iter {
        let assignments: Vec<(usize, f32)> = features
            .as_slice()
            .par_chunks(dims)
            .map(|row| centroids.nearest(row))
            .collect();

        let mut sums = vec![0f64; k * dims];
        let mut counts = vec![0usize; k];
        for (row, &(c, _)) in features.rows().zip(&assignments) {
            counts[c] += 1;
            for d in 0..dims {
                sums[c * dims + d] += row[d] as f64;
            }
        }

        let mut next = centroids.data.clone();
        let mut relocated: Vec<usize> = Vec::new();
        for c in 0..k {
            if counts[c] == 0 {
                // empty cluster: move it onto the worst-fitting point not already used
                let far = assignments
                    .iter()
                    .enumerate()
                    .filter(|(i, _)| !relocated.contains(i))
                    .max_by(|a, b| a.1.1.total_cmp(&b.1.1).then(b.0.cmp(&a.0)))
                    .map(|(i, _)| i)
                    .unwrap_or(0);
                relocated.push(far);
                next[c * dims..(c + 1) * dims].copy_from_slice(features.row(far));
                continue;
            }
            for d in 0..dims {
                next[c * dims + d] = (sums[c * dims + d] / counts[c] as f64) as f32;
            }
        }

        let shift: f64 = centroids
            .data
            .iter()
            .zip(&next)
            .map(|(a, b)| ((a - b) * (a - b)) as f64)
            .sum();
        centroids.data = next;

        if shift <= tol && relocated.is_empty() {
            return Some((centroids, iteration + 1));
        }
    }
    None
}
