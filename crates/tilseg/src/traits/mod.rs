use std::path::Path;

use image::{DynamicImage, RgbImage};

use crate::{
    algorithms::metrics::ScoreOrientation,
    error::Result,
    features::FeatureMatrix,
    selection::ClusteringModel,
    slide::SlideHandle,
    types::{PatchId, Region, RegionShape},
};

/// Access to whole-slide image containers
pub trait SlideReader: Send + Sync {
    /// Open a slide and describe its geometry
    fn open(&self, path: &Path) -> Result<SlideHandle>;

    /// Read one rectangular region at the given resolution level
    fn read_region(&self, handle: &SlideHandle, region: Region, level: u32) -> Result<RgbImage>;

    /// Drop any decoded state held for `handle`; later reads may reopen it.
    fn release(&self, _handle: &SlideHandle) {}
}

/// Re-materializes patch buffers from their identifiers
pub trait PatchSource: Send + Sync {
    fn load_patch(&self, id: &PatchId) -> Result<DynamicImage>;
}

/// Scores a fitted clustering without ground-truth labels
pub trait ValidationMetric: Send + Sync {
    fn name(&self) -> &'static str;

    fn orientation(&self) -> ScoreOrientation;

    /// `None` when the metric is undefined for this clustering (e.g. a single populated cluster)
    fn score(&self, model: &ClusteringModel, features: &FeatureMatrix) -> Option<f64>;
}

/// Reduces the vertex count of region outlines
pub trait ShapeSimplifier: Send + Sync {
    fn simplify(&self, shapes: &mut [RegionShape], tolerance: f32);
}
