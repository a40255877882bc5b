use std::sync::Arc;

use crate::{
    algorithms::DouglasPeuckerSimplifier,
    cancel::CancellationToken,
    config::PipelineConfig,
    error::Result,
    pipeline::Pipeline,
    selection::CandidateConfig,
    slide::RasterSlideReader,
    traits::{ShapeSimplifier, SlideReader, ValidationMetric},
};

/// Builder for [`Pipeline`] with a fluent API
pub struct PipelineBuilder {
    config: PipelineConfig,
    reader: Option<Arc<dyn SlideReader>>,
    metric: Option<Arc<dyn ValidationMetric>>,
    simplifier: Option<Box<dyn ShapeSimplifier>>,
    cancel: CancellationToken,
}

impl PipelineBuilder {
    pub fn new() -> Self {
        Self {
            config: PipelineConfig::default(),
            reader: None,
            metric: None,
            simplifier: None,
            cancel: CancellationToken::new(),
        }
    }

    /// Replace the whole configuration
    pub fn with_config(mut self, config: PipelineConfig) -> Self {
        self.config = config;
        self
    }

    /// Set the slide reader (defaults to [`RasterSlideReader`])
    pub fn with_reader<R>(mut self, reader: R) -> Self
    where
        R: SlideReader + 'static,
    {
        self.reader = Some(Arc::new(reader));
        self
    }

    pub fn with_shared_reader(mut self, reader: Arc<dyn SlideReader>) -> Self {
        self.reader = Some(reader);
        self
    }

    /// Score candidates with a custom metric instead of the configured one
    pub fn with_metric<M>(mut self, metric: M) -> Self
    where
        M: ValidationMetric + 'static,
    {
        self.metric = Some(Arc::new(metric));
        self
    }

    /// Simplifier applied to exported outlines when `contour_simplification` is set
    pub fn with_simplifier<S>(mut self, simplifier: S) -> Self
    where
        S: ShapeSimplifier + 'static,
    {
        self.simplifier = Some(Box::new(simplifier));
        self
    }

    pub fn with_cancellation(mut self, cancel: CancellationToken) -> Self {
        self.cancel = cancel;
        self
    }

    pub fn with_tile_size(mut self, max_tile_x: u32, max_tile_y: u32) -> Self {
        self.config.tiling.max_tile_x = max_tile_x;
        self.config.tiling.max_tile_y = max_tile_y;
        self
    }

    pub fn with_candidates(mut self, candidates: Vec<CandidateConfig>) -> Self {
        self.config.clustering.candidates = candidates;
        self
    }

    pub fn with_patch_count(mut self, patch_count: usize) -> Self {
        self.config.sampling.patch_count = patch_count;
        self
    }

    /// Seed both superpatch sampling and clustering
    pub fn with_seed(mut self, seed: u64) -> Self {
        self.config.sampling.seed = seed;
        self.config.clustering.seed = seed;
        self
    }

    /// Validate the configuration and assemble the pipeline.
    pub fn build(self) -> Result<Pipeline> {
        self.config.validate()?;
        let reader = self
            .reader
            .unwrap_or_else(|| Arc::new(RasterSlideReader::new()));
        let simplifier = self
            .simplifier
            .unwrap_or_else(|| Box::new(DouglasPeuckerSimplifier));
        Ok(Pipeline::new(self.config, reader, self.metric, simplifier, self.cancel))
    }
}

impl Default for PipelineBuilder {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::TilsegError;

    #[test]
    fn builder_overrides_land_in_config() {
        let pipeline = PipelineBuilder::new()
            .with_tile_size(256, 128)
            .with_patch_count(4)
            .with_seed(7)
            .with_candidates(vec![CandidateConfig::kmeans(2), CandidateConfig::minibatch(4)])
            .build()
            .unwrap();
        let config = pipeline.config();
        assert_eq!((config.tiling.max_tile_x, config.tiling.max_tile_y), (256, 128));
        assert_eq!(config.sampling.patch_count, 4);
        assert_eq!(config.clustering.seed, 7);
        assert_eq!(config.clustering.candidates.len(), 2);
    }

    #[test]
    fn invalid_config_is_rejected_at_build() {
        let result = PipelineBuilder::new().with_candidates(Vec::new()).build();
        assert!(matches!(result, Err(TilsegError::InvalidConfig(_))));

        let result = PipelineBuilder::new().with_tile_size(0, 10).build();
        assert!(matches!(result, Err(TilsegError::InvalidConfig(_))));
    }
}
