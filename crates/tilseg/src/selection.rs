//! Candidate clustering configurations, fitted models and metric-driven model selection.

use std::{
    fmt,
    fs::File,
    io::{BufReader, BufWriter, Write},
    path::Path,
    sync::Arc,
};

use rayon::prelude::*;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use crate::{
    algorithms::{
        kmeans::{self, Centroids, FitFailure, KMeansFit, KMeansParams, MAX_CLUSTERS, MiniBatchParams},
        metrics::{ScoreOrientation, approx_equal},
    },
    config::ClusteringConfig,
    error::{Result, TilsegError},
    features::{FeatureExtractor, FeatureMatrix, FeatureSpace},
    traits::ValidationMetric,
};

fn default_max_iter() -> usize {
    20
}

fn default_n_init() -> usize {
    3
}

fn default_tol() -> f64 {
    1e-3
}

fn default_batch_size() -> usize {
    1024
}

fn default_minibatch_max_iter() -> usize {
    100
}

/// An unfitted clustering configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(tag = "algorithm")]
pub enum CandidateConfig {
    #[serde(rename = "kmeans")]
    KMeans {
        #[schemars(range(min = 2, max = 8))]
        n_clusters: usize,
        #[serde(default = "default_max_iter")]
        max_iter: usize,
        #[serde(default = "default_n_init")]
        n_init: usize,
        #[serde(default = "default_tol")]
        tol: f64,
    },
    #[serde(rename = "minibatch_kmeans")]
    MiniBatchKMeans {
        #[schemars(range(min = 2, max = 8))]
        n_clusters: usize,
        #[serde(default = "default_batch_size")]
        batch_size: usize,
        #[serde(default = "default_minibatch_max_iter")]
        max_iter: usize,
        #[serde(default = "default_tol")]
        tol: f64,
    },
}

impl CandidateConfig {
    pub fn kmeans(n_clusters: usize) -> Self {
        Self::KMeans {
            n_clusters,
            max_iter: default_max_iter(),
            n_init: default_n_init(),
            tol: default_tol(),
        }
    }

    pub fn minibatch(n_clusters: usize) -> Self {
        Self::MiniBatchKMeans {
            n_clusters,
            batch_size: default_batch_size(),
            max_iter: default_minibatch_max_iter(),
            tol: default_tol(),
        }
    }

    pub fn n_clusters(&self) -> usize {
        match *self {
            Self::KMeans { n_clusters, .. } | Self::MiniBatchKMeans { n_clusters, .. } => n_clusters,
        }
    }

    pub fn fit(&self, features: &FeatureMatrix, seed: u64) -> std::result::Result<KMeansFit, FitFailure> {
        match *self {
            Self::KMeans {
                n_clusters,
                max_iter,
                n_init,
                tol,
            } => kmeans::fit_kmeans(
                features,
                &KMeansParams {
                    n_clusters,
                    max_iter,
                    n_init,
                    tol,
                    seed,
                },
            ),
            Self::MiniBatchKMeans {
                n_clusters,
                batch_size,
                max_iter,
                tol,
            } => kmeans::fit_minibatch(
                features,
                &MiniBatchParams {
                    n_clusters,
                    batch_size,
                    max_iter,
                    tol,
                    seed,
                },
            ),
        }
    }
}

impl fmt::Display for CandidateConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::KMeans { n_clusters, .. } => write!(f, "kmeans(k={n_clusters})"),
            Self::MiniBatchKMeans { n_clusters, .. } => write!(f, "minibatch_kmeans(k={n_clusters})"),
        }
    }
}

/// The fitted model applied during segmentation
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ClusteringModel {
    pub candidate: CandidateConfig,
    pub feature_space: FeatureSpace,
    pub centroids: Centroids,
    /// Name of the metric that produced `score`
    pub metric: String,
    pub score: f64,
    pub inertia: f64,
}

impl ClusteringModel {
    pub fn n_clusters(&self) -> usize {
        self.centroids.len()
    }

    pub fn feature_dims(&self) -> usize {
        self.centroids.dims()
    }

    pub fn extractor(&self) -> FeatureExtractor {
        FeatureExtractor::new(self.feature_space)
    }

    /// Nearest-centroid label per feature row
    pub fn predict(&self, features: &FeatureMatrix) -> Vec<u8> {
        self.centroids.assign(features)
    }

    pub fn check_features(&self, subject: impl fmt::Display, features: &FeatureMatrix) -> Result<()> {
        if features.dims() != self.feature_dims() {
            return Err(TilsegError::FeatureMismatch {
                patch: subject.to_string(),
                expected: self.feature_dims(),
                found: features.dims(),
            });
        }
        Ok(())
    }

    pub fn save_json(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let mut writer = BufWriter::new(File::create(path)?);
        serde_json::to_writer_pretty(&mut writer, self)?;
        writer.flush()?;
        Ok(())
    }

    pub fn load_json(path: &Path) -> Result<Self> {
        let model: Self = serde_json::from_reader(BufReader::new(File::open(path)?))?;
        if model.feature_dims() != model.feature_space.dims() {
            return Err(TilsegError::InvalidConfig(format!(
                "model centroids have {} dimensions but feature space {} has {}",
                model.feature_dims(),
                model.feature_space,
                model.feature_space.dims()
            )));
        }
        if !(2..=MAX_CLUSTERS).contains(&model.n_clusters()) {
            return Err(TilsegError::InvalidConfig(format!(
                "model has {} clusters, expected 2..={MAX_CLUSTERS}",
                model.n_clusters()
            )));
        }
        Ok(model)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum CandidateStatus {
    Selected,
    Valid,
    /// Scored, but worse than the configured quality bar
    BelowQualityBar,
    /// Fitted, but the metric is undefined for the result
    Unscorable,
    Failed { reason: String },
}

impl CandidateStatus {
    pub fn label(&self) -> &'static str {
        match self {
            Self::Selected => "selected",
            Self::Valid => "valid",
            Self::BelowQualityBar => "below_quality_bar",
            Self::Unscorable => "unscorable",
            Self::Failed { .. } => "failed",
        }
    }

    pub fn is_failed(&self) -> bool {
        matches!(self, Self::Failed { .. })
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CandidateScore {
    pub index: usize,
    pub config: CandidateConfig,
    pub n_clusters: usize,
    pub status: CandidateStatus,
    pub score: Option<f64>,
    pub inertia: Option<f64>,
    pub iterations: Option<usize>,
}

#[derive(Serialize)]
struct ScoreRow<'a> {
    index: usize,
    candidate: String,
    n_clusters: usize,
    status: &'static str,
    score: Option<f64>,
    inertia: Option<f64>,
    iterations: Option<usize>,
    reason: Option<&'a str>,
}

/// Every candidate's outcome, in candidate order
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScoreTable {
    pub metric: String,
    pub orientation: ScoreOrientation,
    pub rows: Vec<CandidateScore>,
}

impl ScoreTable {
    pub fn selected(&self) -> Option<&CandidateScore> {
        self.rows.iter().find(|row| row.status == CandidateStatus::Selected)
    }

    pub fn to_csv_writer<W: Write>(&self, writer: W) -> Result<()> {
        let mut csv = csv::Writer::from_writer(writer);
        for row in &self.rows {
            csv.serialize(ScoreRow {
                index: row.index,
                candidate: row.config.to_string(),
                n_clusters: row.n_clusters,
                status: row.status.label(),
                score: row.score,
                inertia: row.inertia,
                iterations: row.iterations,
                reason: match &row.status {
                    CandidateStatus::Failed { reason } => Some(reason),
                    _ => None,
                },
            })?;
        }
        csv.flush()?;
        Ok(())
    }

    pub fn write_csv(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        self.to_csv_writer(BufWriter::new(File::create(path)?))
    }
}

#[derive(Debug, Clone)]
pub struct ModelSelection {
    pub model: ClusteringModel,
    pub table: ScoreTable,
}

/// Fits every candidate once and keeps the best-scoring model
pub struct ModelSelector {
    metric: Arc<dyn ValidationMetric>,
    feature_space: FeatureSpace,
    seed: u64,
    quality_bar: Option<f64>,
}

impl ModelSelector {
    pub fn new(config: &ClusteringConfig) -> Self {
        Self {
            metric: Arc::from(config.metric.build(config.seed)),
            feature_space: config.feature_space,
            seed: config.seed,
            quality_bar: config.quality_bar,
        }
    }

    /// Replace the built-in metric with a custom one
    pub fn with_metric<M>(mut self, metric: M) -> Self
    where
        M: ValidationMetric + 'static,
    {
        self.metric = Arc::new(metric);
        self
    }

    pub fn with_shared_metric(mut self, metric: Arc<dyn ValidationMetric>) -> Self {
        self.metric = metric;
        self
    }

    pub fn metric_name(&self) -> &'static str {
        self.metric.name()
    }

    pub fn select(&self, features: &FeatureMatrix, candidates: &[CandidateConfig]) -> Result<ModelSelection> {
        if candidates.is_empty() {
            return Err(TilsegError::InvalidConfig("no clustering candidates configured".into()));
        }
        if features.dims() != self.feature_space.dims() {
            return Err(TilsegError::FeatureMismatch {
                patch: "training features".into(),
                expected: self.feature_space.dims(),
                found: features.dims(),
            });
        }

        let orientation = self.metric.orientation();
        let outcomes: Vec<(CandidateScore, Option<ClusteringModel>)> = candidates
            .par_iter()
            .enumerate()
            .map(|(index, config)| self.evaluate(index, config, features))
            .collect();

        let mut best: Option<usize> = None;
        for (i, (row, _)) in outcomes.iter().enumerate() {
            if row.status != CandidateStatus::Valid {
                continue;
            }
            let Some(score) = row.score else { continue };
            let replace = match best {
                None => true,
                Some(b) => {
                    let incumbent = &outcomes[b].0;
                    let incumbent_score = incumbent.score.unwrap_or(f64::NAN);
                    orientation.is_better(score, incumbent_score)
                        || (approx_equal(score, incumbent_score) && row.n_clusters < incumbent.n_clusters)
                }
            };
            if replace {
                best = Some(i);
            }
        }

        let mut rows = Vec::with_capacity(outcomes.len());
        let mut chosen = None;
        for (i, (mut row, model)) in outcomes.into_iter().enumerate() {
            if Some(i) == best {
                row.status = CandidateStatus::Selected;
                chosen = model;
            }
            rows.push(row);
        }
        let table = ScoreTable {
            metric: self.metric.name().to_string(),
            orientation,
            rows,
        };

        match chosen {
            Some(model) => {
                tracing::info!(
                    candidate = %model.candidate,
                    metric = %table.metric,
                    score = model.score,
                    "selected clustering model"
                );
                Ok(ModelSelection { model, table })
            }
            None => Err(TilsegError::ModelSelection {
                reason: failure_reason(&table),
                table: Box::new(table),
            }),
        }
    }

    fn evaluate(
        &self,
        index: usize,
        config: &CandidateConfig,
        features: &FeatureMatrix,
    ) -> (CandidateScore, Option<ClusteringModel>) {
        let mut row = CandidateScore {
            index,
            config: config.clone(),
            n_clusters: config.n_clusters(),
            status: CandidateStatus::Valid,
            score: None,
            inertia: None,
            iterations: None,
        };

        let fit = match config.fit(features, self.seed) {
            Ok(fit) => fit,
            Err(failure) => {
                tracing::warn!(candidate = %config, reason = %failure, "candidate failed to fit");
                row.status = CandidateStatus::Failed {
                    reason: failure.to_string(),
                };
                return (row, None);
            }
        };
        row.inertia = Some(fit.inertia);
        row.iterations = Some(fit.iterations);

        let mut model = ClusteringModel {
            candidate: config.clone(),
            feature_space: self.feature_space,
            centroids: fit.centroids,
            metric: self.metric.name().to_string(),
            score: f64::NAN,
            inertia: fit.inertia,
        };
        let score = match self.metric.score(&model, features) {
            Some(score) if score.is_finite() => score,
            _ => {
                tracing::debug!(candidate = %config, "metric undefined for candidate");
                row.status = CandidateStatus::Unscorable;
                return (row, None);
            }
        };
        model.score = score;
        row.score = Some(score);
        tracing::debug!(candidate = %config, score, inertia = fit.inertia, "scored candidate");

        if let Some(bar) = self.quality_bar {
            if !self.metric.orientation().passes(score, bar) {
                row.status = CandidateStatus::BelowQualityBar;
                return (row, None);
            }
        }
        (row, Some(model))
    }
}

fn failure_reason(table: &ScoreTable) -> String {
    if table.rows.iter().all(|row| row.status.is_failed()) {
        "no candidate converged".into()
    } else if table.rows.iter().any(|row| row.status == CandidateStatus::BelowQualityBar) {
        format!("no candidate met the quality bar for {}", table.metric)
    } else {
        format!("{} is undefined for every fitted candidate", table.metric)
    }
}
