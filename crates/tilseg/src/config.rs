use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use crate::{
    algorithms::{kmeans::MAX_CLUSTERS, metrics::MetricKind, tissue::TissueThresholds},
    error::{Result, TilsegError},
    features::FeatureSpace,
    segmentation::{TilClusterSelection, TilHeuristics},
    selection::CandidateConfig,
};

/// Every tunable of a pipeline run. Sections missing from a config file take their defaults.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(default)]
pub struct PipelineConfig {
    pub tiling: TilingConfig,
    pub tissue: TissueThresholds,
    pub sampling: SamplingConfig,
    pub clustering: ClusteringConfig,
    pub segmentation: SegmentationConfig,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(default)]
pub struct TilingConfig {
    /// Maximum patch width in pixels
    pub max_tile_x: u32,
    /// Maximum patch height in pixels
    pub max_tile_y: u32,
    /// Resolution level to read; 0 is native resolution
    pub level: u32,
    /// Persist accepted patches under `<out>/<slide>/`
    pub save_images: bool,
    /// Rejected-pixel fraction above which a slide is reported
    #[schemars(range(min = 0.0, max = 1.0))]
    pub pixel_loss_warning: f64,
}

impl Default for TilingConfig {
    fn default() -> Self {
        Self {
            max_tile_x: 4000,
            max_tile_y: 3000,
            level: 0,
            save_images: true,
            pixel_loss_warning: 0.25,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(default)]
pub struct SamplingConfig {
    /// Number of patches composited into the training superpatch
    pub patch_count: usize,
    pub seed: u64,
}

impl Default for SamplingConfig {
    fn default() -> Self {
        Self {
            patch_count: 6,
            seed: 42,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(default)]
pub struct ClusteringConfig {
    pub candidates: Vec<CandidateConfig>,
    pub metric: MetricKind,
    pub feature_space: FeatureSpace,
    /// Training features are subsampled to at most this many rows
    pub max_training_samples: usize,
    /// Scores worse than this disqualify a candidate
    pub quality_bar: Option<f64>,
    pub seed: u64,
}

impl Default for ClusteringConfig {
    fn default() -> Self {
        Self {
            candidates: (3..=5).map(CandidateConfig::kmeans).collect(),
            metric: MetricKind::default(),
            feature_space: FeatureSpace::default(),
            max_training_samples: 200_000,
            quality_bar: None,
            seed: 42,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(default)]
pub struct SegmentationConfig {
    pub til: TilHeuristics,
    pub til_cluster: TilClusterSelection,
    /// Weight of the cluster palette in the overlay image
    #[schemars(range(min = 0.0, max = 1.0))]
    pub overlay_alpha: f32,
    /// One image per cluster with that cluster blacked out on the original
    pub save_cluster_overlays: bool,
    /// One binary mask per cluster
    pub save_cluster_masks: bool,
    /// Palette colour map of every cluster, unblended
    pub save_all_clusters: bool,
    pub save_geojson: bool,
    /// Douglas-Peucker tolerance (pixels) applied to exported outlines
    pub contour_simplification: Option<f32>,
}

impl Default for SegmentationConfig {
    fn default() -> Self {
        Self {
            til: TilHeuristics::default(),
            til_cluster: TilClusterSelection::default(),
            overlay_alpha: 0.4,
            save_cluster_overlays: false,
            save_cluster_masks: false,
            save_all_clusters: false,
            save_geojson: true,
            contour_simplification: None,
        }
    }
}

impl PipelineConfig {
    pub fn validate(&self) -> Result<()> {
        let invalid = |msg: String| Err(TilsegError::InvalidConfig(msg));

        if self.tiling.max_tile_x == 0 || self.tiling.max_tile_y == 0 {
            return invalid(format!(
                "tile size must be positive, got {}x{}",
                self.tiling.max_tile_x, self.tiling.max_tile_y
            ));
        }
        if !(0.0..=1.0).contains(&self.tiling.pixel_loss_warning) {
            return invalid(format!("pixel_loss_warning {} outside [0, 1]", self.tiling.pixel_loss_warning));
        }
        if self.tissue.min_luminance > self.tissue.max_luminance {
            return invalid(format!(
                "min_luminance {} exceeds max_luminance {}",
                self.tissue.min_luminance, self.tissue.max_luminance
            ));
        }
        if self.sampling.patch_count == 0 {
            return invalid("patch_count must be at least 1".into());
        }
        if self.clustering.candidates.is_empty() {
            return invalid("no clustering candidates configured".into());
        }
        if let Some(bad) = self
            .clustering
            .candidates
            .iter()
            .find(|c| !(2..=MAX_CLUSTERS).contains(&c.n_clusters()))
        {
            return invalid(format!("candidate {bad} outside 2..={MAX_CLUSTERS} clusters"));
        }
        if self.clustering.max_training_samples == 0 {
            return invalid("max_training_samples must be positive".into());
        }
        if let MetricKind::Silhouette { sample_size } = self.clustering.metric {
            if sample_size < 2 {
                return invalid(format!("silhouette sample_size {sample_size} below 2"));
            }
        }
        if self.segmentation.til.min_area >= self.segmentation.til.max_area {
            return invalid(format!(
                "TIL min_area {} leaves no room below max_area {}",
                self.segmentation.til.min_area, self.segmentation.til.max_area
            ));
        }
        if let TilClusterSelection::Label(label) = self.segmentation.til_cluster {
            if label as usize >= MAX_CLUSTERS {
                return invalid(format!("TIL cluster label {label} can never occur"));
            }
        }
        if !(0.0..=1.0).contains(&self.segmentation.overlay_alpha) {
            return invalid(format!("overlay_alpha {} outside [0, 1]", self.segmentation.overlay_alpha));
        }
        Ok(())
    }
}
