//! # TIL Segmentation Library
//!
//! Patch-and-cluster segmentation of tumor-infiltrating lymphocytes (TILs) in
//! H&E whole-slide images. Slides are tiled into patches, background patches are
//! dropped, a handful of tissue patches are composited into a training
//! superpatch, and candidate k-means models are fitted and scored on it. The
//! winning model then labels every tissue patch; the TIL-like regions of the
//! chosen cluster are outlined, measured and exported.
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use tilseg::Pipeline;
//! use std::path::Path;
//!
//! let pipeline = Pipeline::builder()
//!     .with_tile_size(2000, 2000)
//!     .with_patch_count(6)
//!     .build()?;
//!
//! let report = pipeline.run(Path::new("slides/"), Path::new("out/"))?;
//! println!("selected {}", report.selection.model.candidate);
//! # Ok::<(), Box<dyn std::error::Error>>(())
//! ```
//!
//! ## Stages
//!
//! Each stage can be driven on its own: [`Pipeline::preprocess`] tiles and samples,
//! [`Pipeline::select_model`] fits and scores candidates, and
//! [`Pipeline::segment_all`] applies a saved [`ClusteringModel`] to stored patches.

pub mod algorithms;
pub mod cancel;
pub mod config;
pub mod error;
pub mod features;
pub mod io;
pub mod pipeline;
pub mod quantification;
pub mod segmentation;
pub mod selection;
pub mod slide;
pub mod superpatch;
pub mod tiler;
pub mod traits;
pub mod types;

pub use cancel::CancellationToken;
pub use config::PipelineConfig;
pub use error::{Result, TilsegError};
pub use features::{FeatureExtractor, FeatureMatrix, FeatureSpace};
pub use io::{PatchStore, SlideRegionSource};
pub use pipeline::{Pipeline, PipelineWarning, PreprocessOptions, builder::PipelineBuilder};
pub use quantification::QuantificationRecord;
pub use segmentation::{Segmentation, SegmentationEngine, TilClusterSelection, TilHeuristics};
pub use selection::{CandidateConfig, ClusteringModel, ModelSelection, ModelSelector, ScoreTable};
pub use slide::{RasterSlideReader, SlideFormat, SlideHandle};
pub use superpatch::{Superpatch, SuperpatchSampler};
pub use tiler::{Tiler, TilingReport};
pub use traits::*;
pub use types::{Patch, PatchId, Region, TilRegion};
