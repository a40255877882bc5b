pub mod builder;

use std::{
    collections::BTreeMap,
    fmt,
    path::{Path, PathBuf},
    sync::Arc,
};

use rayon::prelude::*;
use serde::Serialize;

use crate::{
    cancel::CancellationToken,
    config::{PipelineConfig, TilingConfig},
    error::{Result, TilsegError},
    io::{PatchStore, SlideRegionSource, geojson::save_geojson},
    quantification::{QuantificationRecord, QuantificationWriter, write_region_csv},
    segmentation::{Segmentation, SegmentationEngine},
    selection::{CandidateConfig, ClusteringModel, ModelSelection, ModelSelector},
    slide::{SlideHandle, discover_slides},
    superpatch::{Superpatch, SuperpatchSampler},
    tiler::{AcceptedPatch, Tiler, TilingReport},
    traits::{PatchSource, ShapeSimplifier, SlideReader, ValidationMetric},
    types::{Patch, PatchId},
};

pub use builder::PipelineBuilder;

pub const SUPERPATCH_FILE: &str = "superpatch_training.png";
pub const MODEL_FILE: &str = "model.json";
pub const SCORES_FILE: &str = "model_scores.csv";
pub const QUANTIFICATION_FILE: &str = "quantification.csv";

/// Options of the tiling stage
#[derive(Debug, Clone, PartialEq)]
pub struct PreprocessOptions {
    /// Patches composited into the training superpatch
    pub patch_count: usize,
    /// Build the training superpatch after tiling
    pub training: bool,
    pub save_images: bool,
    pub max_tile_x: u32,
    pub max_tile_y: u32,
}

impl Default for PreprocessOptions {
    fn default() -> Self {
        Self::from_config(&PipelineConfig::default())
    }
}

impl PreprocessOptions {
    pub fn from_config(config: &PipelineConfig) -> Self {
        Self {
            patch_count: config.sampling.patch_count,
            training: true,
            save_images: config.tiling.save_images,
            max_tile_x: config.tiling.max_tile_x,
            max_tile_y: config.tiling.max_tile_y,
        }
    }
}

/// A slide or patch that failed without stopping the run
#[derive(Debug)]
pub struct StageFailure {
    pub subject: String,
    pub error: TilsegError,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum PipelineWarning {
    ExcessivePixelLoss { slide: String, pixel_loss: f64 },
    NoTissue { slide: String },
    FewerPatchesThanRequested { requested: usize, available: usize },
    NoTilCluster { patch: String },
}

impl fmt::Display for PipelineWarning {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::ExcessivePixelLoss { slide, pixel_loss } => {
                write!(f, "{slide}: {:.2}% of pixels rejected", pixel_loss * 100.0)
            }
            Self::NoTissue { slide } => write!(f, "{slide}: no tissue patches"),
            Self::FewerPatchesThanRequested { requested, available } => {
                write!(f, "requested {requested} training patches, only {available} available")
            }
            Self::NoTilCluster { patch } => write!(f, "{patch}: no cluster held TIL-like regions"),
        }
    }
}

#[derive(Debug, Default)]
pub struct PreprocessReport {
    pub slides: Vec<TilingReport>,
    /// Handles of the slides that tiled successfully, in `slides` order
    pub handles: Vec<SlideHandle>,
    pub failures: Vec<StageFailure>,
    pub warnings: Vec<PipelineWarning>,
    pub superpatch: Option<Superpatch>,
    pub superpatch_path: Option<PathBuf>,
}

impl PreprocessReport {
    pub fn accepted(&self) -> impl Iterator<Item = &AcceptedPatch> {
        self.slides.iter().flat_map(|s| s.accepted.iter())
    }

    pub fn patch_ids(&self) -> Vec<PatchId> {
        self.accepted().map(|a| a.id.clone()).collect()
    }
}

#[derive(Debug, Default)]
pub struct SegmentAllReport {
    /// One record per segmented patch, sorted by slide then origin
    pub records: Vec<QuantificationRecord>,
    pub failures: Vec<StageFailure>,
    pub warnings: Vec<PipelineWarning>,
    pub csv_paths: Vec<PathBuf>,
}

#[derive(Debug)]
pub struct RunReport {
    pub preprocess: PreprocessReport,
    pub selection: ModelSelection,
    pub model_path: PathBuf,
    pub scores_path: PathBuf,
    pub segmentation: SegmentAllReport,
}

/// Patch-and-cluster pipeline over one slide reader and one configuration
pub struct Pipeline {
    config: PipelineConfig,
    reader: Arc<dyn SlideReader>,
    metric: Option<Arc<dyn ValidationMetric>>,
    simplifier: Box<dyn ShapeSimplifier>,
    cancel: CancellationToken,
}

impl Pipeline {
    pub fn builder() -> PipelineBuilder {
        PipelineBuilder::new()
    }

    pub(crate) fn new(
        config: PipelineConfig,
        reader: Arc<dyn SlideReader>,
        metric: Option<Arc<dyn ValidationMetric>>,
        simplifier: Box<dyn ShapeSimplifier>,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            config,
            reader,
            metric,
            simplifier,
            cancel,
        }
    }

    pub fn config(&self) -> &PipelineConfig {
        &self.config
    }

    pub fn reader(&self) -> &dyn SlideReader {
        self.reader.as_ref()
    }

    pub fn cancellation(&self) -> &CancellationToken {
        &self.cancel
    }

    fn release_all(&self, handles: &[SlideHandle]) {
        for handle in handles {
            self.reader.release(handle);
        }
    }

    fn engine(&self) -> SegmentationEngine {
        SegmentationEngine::new(self.config.segmentation.clone(), self.config.tissue)
    }

    /// Tile every slide under `input`, keep tissue patches and optionally build the
    /// training superpatch. Failing slides are reported, not fatal.
    pub fn preprocess(&self, input: &Path, out_dir: &Path, options: &PreprocessOptions) -> Result<PreprocessReport> {
        if options.training && options.patch_count == 0 {
            return Err(TilsegError::InvalidConfig("patch_count must be at least 1".into()));
        }
        self.cancel.check()?;

        let paths = discover_slides(input)?;
        tracing::info!(input = %input.display(), slides = paths.len(), "preprocessing");

        let tiler = Tiler::new(
            TilingConfig {
                max_tile_x: options.max_tile_x,
                max_tile_y: options.max_tile_y,
                save_images: options.save_images,
                ..self.config.tiling.clone()
            },
            self.config.tissue,
        );
        let store = PatchStore::new(out_dir);
        let reader = self.reader.as_ref();

        let outcomes: Vec<(&PathBuf, Result<(SlideHandle, TilingReport)>)> = paths
            .par_iter()
            .map(|path| {
                let outcome = self.cancel.check().and_then(|()| {
                    let handle = reader.open(path)?;
                    let report = tiler.process_slide(reader, &handle, Some(&store), &self.cancel);
                    reader.release(&handle);
                    Ok((handle, report?))
                });
                (path, outcome)
            })
            .collect();

        let mut report = PreprocessReport::default();
        for (path, outcome) in outcomes {
            match outcome {
                Ok((handle, slide)) => {
                    if slide.accepted.is_empty() {
                        report.warnings.push(PipelineWarning::NoTissue {
                            slide: slide.slide.clone(),
                        });
                    }
                    // already logged by the tiler
                    if slide.pixel_loss() > tiler.config().pixel_loss_warning {
                        report.warnings.push(PipelineWarning::ExcessivePixelLoss {
                            slide: slide.slide.clone(),
                            pixel_loss: slide.pixel_loss(),
                        });
                    }
                    report.handles.push(handle);
                    report.slides.push(slide);
                }
                Err(TilsegError::Cancelled) => return Err(TilsegError::Cancelled),
                Err(error) => {
                    tracing::warn!(slide = %path.display(), %error, "skipping slide");
                    report.failures.push(StageFailure {
                        subject: path.display().to_string(),
                        error,
                    });
                }
            }
        }

        if options.training {
            self.cancel.check()?;
            let available = report.accepted().count();
            if available > 0 && available < options.patch_count {
                report.warnings.push(PipelineWarning::FewerPatchesThanRequested {
                    requested: options.patch_count,
                    available,
                });
            }

            let sampler = SuperpatchSampler::new(self.config.sampling.seed);
            let superpatch = if options.save_images {
                sampler.sample(&report.slides, options.patch_count, &store)?
            } else {
                let source = SlideRegionSource::new(reader, report.handles.iter().cloned(), self.config.tiling.level);
                let sampled = sampler.sample(&report.slides, options.patch_count, &source);
                self.release_all(&report.handles);
                sampled?
            };
            let path = out_dir.join(SUPERPATCH_FILE);
            superpatch.save(&path)?;
            tracing::info!(path = %path.display(), "saved training superpatch");
            report.superpatch = Some(superpatch);
            report.superpatch_path = Some(path);
        }

        let unlogged = report
            .warnings
            .iter()
            .filter(|warning| !matches!(warning, PipelineWarning::ExcessivePixelLoss { .. }));
        for warning in unlogged {
            tracing::warn!(%warning, "preprocess");
        }
        Ok(report)
    }

    /// Fit and score `candidates` on the superpatch's tissue pixels.
    pub fn select_model(&self, superpatch: &Superpatch, candidates: &[CandidateConfig]) -> Result<ModelSelection> {
        self.cancel.check()?;
        let clustering = &self.config.clustering;
        let features = superpatch.features(clustering.feature_space, clustering.max_training_samples, clustering.seed);
        tracing::info!(
            samples = features.len(),
            dims = features.dims(),
            candidates = candidates.len(),
            "selecting clustering model"
        );

        let mut selector = ModelSelector::new(clustering);
        if let Some(metric) = &self.metric {
            selector = selector.with_shared_metric(Arc::clone(metric));
        }
        selector.select(&features, candidates)
    }

    pub fn segment_patch(&self, patch: &Patch, model: &ClusteringModel) -> Result<Segmentation> {
        self.engine().segment(patch, model)
    }

    /// Segment patches in parallel, write their artifacts and append one CSV row per patch
    /// to `<out>/<slide>/quantification.csv`.
    pub fn segment_all(
        &self,
        ids: &[PatchId],
        source: &dyn PatchSource,
        model: &ClusteringModel,
        out_dir: &Path,
    ) -> Result<SegmentAllReport> {
        self.cancel.check()?;
        let engine = self.engine();
        let store = PatchStore::new(out_dir);
        tracing::info!(patches = ids.len(), clusters = model.n_clusters(), "segmenting");

        let outcomes: Vec<(&PatchId, Result<QuantificationRecord>)> = ids
            .par_iter()
            .map(|id| {
                let outcome = self
                    .cancel
                    .check()
                    .and_then(|()| self.segment_to_disk(&engine, id, source, model, &store));
                (id, outcome)
            })
            .collect();

        let mut report = SegmentAllReport::default();
        for (id, outcome) in outcomes {
            match outcome {
                Ok(record) => {
                    if record.til_cluster.is_none() {
                        report.warnings.push(PipelineWarning::NoTilCluster { patch: id.to_string() });
                    }
                    report.records.push(record);
                }
                Err(TilsegError::Cancelled) => return Err(TilsegError::Cancelled),
                Err(error) => {
                    tracing::warn!(patch = %id, %error, "skipping patch");
                    report.failures.push(StageFailure {
                        subject: id.to_string(),
                        error,
                    });
                }
            }
        }
        report
            .records
            .sort_by(|a, b| (&a.patch.slide, a.patch.y, a.patch.x).cmp(&(&b.patch.slide, b.patch.y, b.patch.x)));

        let mut by_slide: BTreeMap<&str, Vec<QuantificationRecord>> = BTreeMap::new();
        for record in &report.records {
            by_slide.entry(record.patch.slide.as_str()).or_default().push(record.clone());
        }
        let writer = QuantificationWriter;
        for (slide, records) in by_slide {
            let path = store.slide_dir(slide).join(QUANTIFICATION_FILE);
            writer.append(&path, &records)?;
            report.csv_paths.push(path);
        }

        for warning in &report.warnings {
            tracing::warn!(%warning, "segment");
        }
        tracing::info!(
            segmented = report.records.len(),
            failed = report.failures.len(),
            "segmentation finished"
        );
        Ok(report)
    }

    fn segment_to_disk(
        &self,
        engine: &SegmentationEngine,
        id: &PatchId,
        source: &dyn PatchSource,
        model: &ClusteringModel,
        store: &PatchStore,
    ) -> Result<QuantificationRecord> {
        let patch = Patch::new(id.clone(), source.load_patch(id)?);
        let segmentation = engine.segment(&patch, model)?;
        let dir = store.artifact_dir(id);
        engine.render(&patch, &segmentation).save(&dir)?;
        write_region_csv(&dir.join("til_regions.csv"), &segmentation.regions)?;

        let config = engine.config();
        if config.save_geojson {
            let mut exported = segmentation.regions.clone();
            if let Some(tolerance) = config.contour_simplification {
                for region in &mut exported {
                    self.simplifier.simplify(std::slice::from_mut(&mut region.shape), tolerance);
                }
            }
            save_geojson(id, &exported, &dir.join("til_regions.geojson"))?;
        }
        Ok(segmentation.record)
    }

    /// preprocess, sample, select, segment.
    pub fn run(&self, input: &Path, out_dir: &Path) -> Result<RunReport> {
        let options = PreprocessOptions::from_config(&self.config);
        let preprocess = self.preprocess(input, out_dir, &options)?;
        let superpatch = preprocess
            .superpatch
            .as_ref()
            .ok_or(TilsegError::InsufficientTissue {
                slides: preprocess.slides.len(),
            })?;

        let model_path = out_dir.join(MODEL_FILE);
        let scores_path = out_dir.join(SCORES_FILE);
        let selection = match self.select_model(superpatch, &self.config.clustering.candidates) {
            Ok(selection) => selection,
            Err(error) => {
                if let TilsegError::ModelSelection { table, .. } = &error {
                    table.write_csv(&scores_path)?;
                    tracing::info!(path = %scores_path.display(), "saved scores of the failed selection");
                }
                return Err(error);
            }
        };
        selection.model.save_json(&model_path)?;
        selection.table.write_csv(&scores_path)?;

        let ids = preprocess.patch_ids();
        let segmentation = if options.save_images {
            self.segment_all(&ids, &PatchStore::new(out_dir), &selection.model, out_dir)?
        } else {
            let source = SlideRegionSource::new(
                self.reader.as_ref(),
                preprocess.handles.iter().cloned(),
                self.config.tiling.level,
            );
            let segmented = self.segment_all(&ids, &source, &selection.model, out_dir);
            self.release_all(&preprocess.handles);
            segmented?
        };

        Ok(RunReport {
            preprocess,
            selection,
            model_path,
            scores_path,
            segmentation,
        })
    }
}
