//! Internal validation metrics: cluster quality without ground-truth labels.

use rand::{SeedableRng, rngs::StdRng};
use rayon::prelude::*;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use strum::{Display, EnumIter, EnumString, IntoStaticStr, VariantNames};

use crate::{
    algorithms::kmeans::squared_distance,
    features::FeatureMatrix,
    selection::ClusteringModel,
    traits::ValidationMetric,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, JsonSchema, Display)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum ScoreOrientation {
    HigherIsBetter,
    LowerIsBetter,
}

impl ScoreOrientation {
    /// Whether `candidate` beats `incumbent` by more than a relative epsilon.
    pub fn is_better(&self, candidate: f64, incumbent: f64) -> bool {
        if approx_equal(candidate, incumbent) {
            return false;
        }
        match self {
            Self::HigherIsBetter => candidate > incumbent,
            Self::LowerIsBetter => candidate < incumbent,
        }
    }

    /// Whether `score` is at least as good as `bar`.
    pub fn passes(&self, score: f64, bar: f64) -> bool {
        match self {
            Self::HigherIsBetter => score >= bar,
            Self::LowerIsBetter => score <= bar,
        }
    }
}

pub fn approx_equal(a: f64, b: f64) -> bool {
    (a - b).abs() <= 1e-9 * a.abs().max(b.abs()).max(1.0)
}

/// Serializable choice among the built-in metrics
#[derive(
    Debug, Clone, Copy, Default,
    Serialize, Deserialize, JsonSchema,
    Display, EnumString, EnumIter, VariantNames, IntoStaticStr,
    PartialEq
)]
#[serde(tag = "type", rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum MetricKind {
    /// Ratio of between- to within-cluster dispersion
    #[default]
    CalinskiHarabasz,
    /// Average worst-case similarity between clusters
    DaviesBouldin,
    /// Mean silhouette over a seeded subsample
    Silhouette {
        #[schemars(range(min = 2))]
        sample_size: usize,
    },
}

impl MetricKind {
    pub fn build(&self, seed: u64) -> Box<dyn ValidationMetric> {
        match *self {
            Self::CalinskiHarabasz => Box::new(CalinskiHarabasz),
            Self::DaviesBouldin => Box::new(DaviesBouldin),
            Self::Silhouette { sample_size } => Box::new(Silhouette { sample_size, seed }),
        }
    }
}

/// Per-cluster sizes and means of the assigned points
struct ClusterStats {
    dims: usize,
    counts: Vec<usize>,
    means: Vec<f64>,
    overall_mean: Vec<f64>,
}

impl ClusterStats {
    fn compute(features: &FeatureMatrix, labels: &[u8], k: usize) -> Self {
        let dims = features.dims();
        let mut counts = vec![0usize; k];
        let mut means = vec![0f64; k * dims];
        let mut overall_mean = vec![0f64; dims];

        for (row, &label) in features.rows().zip(labels) {
            let c = label as usize;
            counts[c] += 1;
            for d in 0..dims {
                means[c * dims + d] += row[d] as f64;
                overall_mean[d] += row[d] as f64;
            }
        }
        for c in 0..k {
            if counts[c] > 0 {
                for d in 0..dims {
                    means[c * dims + d] /= counts[c] as f64;
                }
            }
        }
        let n = labels.len().max(1) as f64;
        overall_mean.iter_mut().for_each(|v| *v /= n);

        Self {
            dims,
            counts,
            means,
            overall_mean,
        }
    }

    fn mean(&self, cluster: usize) -> &[f64] {
        &self.means[cluster * self.dims..(cluster + 1) * self.dims]
    }

    fn non_empty(&self) -> Vec<usize> {
        (0..self.counts.len()).filter(|&c| self.counts[c] > 0).collect()
    }

    fn distance_to_mean(&self, row: &[f32], cluster: usize) -> f64 {
        row.iter()
            .zip(self.mean(cluster))
            .map(|(&x, &m)| (x as f64 - m).powi(2))
            .sum::<f64>()
    }
}

fn labelled(model: &ClusteringModel, features: &FeatureMatrix) -> Option<(Vec<u8>, ClusterStats)> {
    if features.is_empty() || features.dims() != model.feature_dims() {
        return None;
    }
    let labels = model.centroids.assign(features);
    let stats = ClusterStats::compute(features, &labels, model.n_clusters());
    Some((labels, stats))
}

/// Calinski-Harabasz index
#[derive(Debug, Clone, Copy, Default)]
pub struct CalinskiHarabasz;

impl ValidationMetric for CalinskiHarabasz {
    fn name(&self) -> &'static str {
        "calinski_harabasz"
    }

    fn orientation(&self) -> ScoreOrientation {
        ScoreOrientation::HigherIsBetter
    }

    fn score(&self, model: &ClusteringModel, features: &FeatureMatrix) -> Option<f64> {
        let (labels, stats) = labelled(model, features)?;
        let clusters = stats.non_empty();
        let n = labels.len();
        let k = clusters.len();
        if k < 2 || n <= k {
            return None;
        }

        let between: f64 = clusters
            .iter()
            .map(|&c| {
                let spread: f64 = stats
                    .mean(c)
                    .iter()
                    .zip(&stats.overall_mean)
                    .map(|(m, o)| (m - o).powi(2))
                    .sum();
                stats.counts[c] as f64 * spread
            })
            .sum();
        let within: f64 = features
            .rows()
            .zip(&labels)
            .map(|(row, &l)| stats.distance_to_mean(row, l as usize))
            .sum();

        if within == 0.0 {
            return Some(1.0);
        }
        Some(between * (n - k) as f64 / (within * (k - 1) as f64))
    }
}

/// Davies-Bouldin index
#[derive(Debug, Clone, Copy, Default)]
pub struct DaviesBouldin;

impl ValidationMetric for DaviesBouldin {
    fn name(&self) -> &'static str {
        "davies_bouldin"
    }

    fn orientation(&self) -> ScoreOrientation {
        ScoreOrientation::LowerIsBetter
    }

    fn score(&self, model: &ClusteringModel, features: &FeatureMatrix) -> Option<f64> {
        let (labels, stats) = labelled(model, features)?;
        let clusters = stats.non_empty();
        if clusters.len() < 2 {
            return None;
        }

        let mut scatter = vec![0f64; stats.counts.len()];
        for (row, &l) in features.rows().zip(&labels) {
            scatter[l as usize] += stats.distance_to_mean(row, l as usize).sqrt();
        }
        for &c in &clusters {
            scatter[c] /= stats.counts[c] as f64;
        }

        let worst: f64 = clusters
            .iter()
            .map(|&i| {
                clusters
                    .iter()
                    .filter(|&&j| j != i)
                    .map(|&j| {
                        let separation: f64 = stats
                            .mean(i)
                            .iter()
                            .zip(stats.mean(j))
                            .map(|(a, b)| (a - b).powi(2))
                            .sum::<f64>()
                            .sqrt();
                        if separation == 0.0 {
                            0.0
                        } else {
                            (scatter[i] + scatter[j]) / separation
                        }
                    })
                    .fold(0.0, f64::max)
            })
            .sum();
        Some(worst / clusters.len() as f64)
    }
}

/// Mean silhouette coefficient over at most `sample_size` seeded samples
#[derive(Debug, Clone, Copy)]
pub struct Silhouette {
    pub sample_size: usize,
    pub seed: u64,
}

impl ValidationMetric for Silhouette {
    fn name(&self) -> &'static str {
        "silhouette"
    }

    fn orientation(&self) -> ScoreOrientation {
        ScoreOrientation::HigherIsBetter
    }

    fn score(&self, model: &ClusteringModel, features: &FeatureMatrix) -> Option<f64> {
        let sample = features.subsample(self.sample_size.max(2), self.seed);
        let (labels, stats) = labelled(model, &sample)?;
        if stats.non_empty().len() < 2 {
            return None;
        }
        let k = stats.counts.len();

        let coefficients: Vec<f64> = (0..sample.len())
            .into_par_iter()
            .map(|i| {
                let own = labels[i] as usize;
                if stats.counts[own] <= 1 {
                    return 0.0;
                }
                let mut totals = vec![0f64; k];
                for (j, row) in sample.rows().enumerate() {
                    if j != i {
                        totals[labels[j] as usize] += (squared_distance(sample.row(i), row) as f64).sqrt();
                    }
                }
                let a = totals[own] / (stats.counts[own] - 1) as f64;
                let b = (0..k)
                    .filter(|&c| c != own && stats.counts[c] > 0)
                    .map(|c| totals[c] / stats.counts[c] as f64)
                    .fold(f64::INFINITY, f64::min);
                let denom = a.max(b);
                if denom == 0.0 { 0.0 } else { (b - a) / denom }
            })
            .collect();

        Some(coefficients.iter().sum::<f64>() / coefficients.len() as f64)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        algorithms::kmeans::Centroids,
        features::FeatureSpace,
        selection::{CandidateConfig, ClusteringModel},
    };

    fn two_blobs() -> FeatureMatrix {
        let mut features = FeatureMatrix::with_capacity(3, 40);
        for i in 0..20 {
            let jitter = (i % 5) as f32 * 0.01;
            features.push(&[0.1 + jitter, 0.1, 0.1]);
            features.push(&[0.9 - jitter, 0.9, 0.9]);
        }
        features
    }

    fn model(centres: Vec<f32>) -> ClusteringModel {
        let k = centres.len() / 3;
        ClusteringModel {
            candidate: CandidateConfig::kmeans(k),
            feature_space: FeatureSpace::Rgb,
            centroids: Centroids::new(3, centres),
            metric: String::new(),
            score: 0.0,
            inertia: 0.0,
        }
    }

    #[test]
    fn good_partition_outscores_bad_partition() {
        let features = two_blobs();
        let good = model(vec![0.12, 0.1, 0.1, 0.88, 0.9, 0.9]);
        // both centres on one side: splits one blob, lumps the other into it
        let bad = model(vec![0.1, 0.1, 0.1, 0.14, 0.1, 0.1]);

        let ch = CalinskiHarabasz;
        assert!(ch.score(&good, &features).unwrap() > ch.score(&bad, &features).unwrap());

        let db = DaviesBouldin;
        assert!(db.score(&good, &features).unwrap() < db.score(&bad, &features).unwrap());

        let sil = Silhouette { sample_size: 40, seed: 1 };
        let s = sil.score(&good, &features).unwrap();
        assert!(s > 0.9 && s <= 1.0);
        assert!(s > sil.score(&bad, &features).unwrap());
    }

    #[test]
    fn single_populated_cluster_is_unscorable() {
        let features = two_blobs();
        let degenerate = model(vec![0.5, 0.5, 0.5, 5.0, 5.0, 5.0]);
        assert!(CalinskiHarabasz.score(&degenerate, &features).is_none());
        assert!(DaviesBouldin.score(&degenerate, &features).is_none());
    }

    #[test]
    fn orientation_breaks_near_ties_as_equal() {
        assert!(ScoreOrientation::HigherIsBetter.is_better(2.0, 1.0));
        assert!(ScoreOrientation::LowerIsBetter.is_better(1.0, 2.0));
        assert!(!ScoreOrientation::HigherIsBetter.is_better(1.0 + 1e-12, 1.0));
        assert!(ScoreOrientation::LowerIsBetter.passes(0.5, 0.7));
    }
}
