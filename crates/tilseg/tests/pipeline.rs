mod common;

use std::sync::Arc;

use common::{SyntheticReader, nucleus_area, slide_dir};
use tilseg::{
    CancellationToken, CandidateConfig, ClusteringModel, PatchStore, Pipeline, PipelineConfig, PipelineWarning,
    PreprocessOptions, RasterSlideReader, Region, SlideReader, TilsegError,
};

fn pipeline() -> Pipeline {
    Pipeline::builder()
        .with_reader(SyntheticReader)
        .with_tile_size(100, 100)
        .with_patch_count(6)
        .with_candidates(vec![
            CandidateConfig::kmeans(2),
            CandidateConfig::kmeans(3),
            CandidateConfig::minibatch(2),
        ])
        .build()
        .unwrap()
}

#[test]
fn full_run_over_two_slides() {
    let input = slide_dir(&["slide_a.svs", "slide_b.svs"]);
    let out = tempfile::tempdir().unwrap();

    let report = pipeline().run(input.path(), out.path()).unwrap();

    // 6 x 2 cells per slide, the glass margin column is rejected
    assert_eq!(report.preprocess.slides.len(), 2);
    for slide in &report.preprocess.slides {
        assert_eq!(slide.cells, 12);
        assert_eq!(slide.accepted.len(), 10);
        assert_eq!(slide.rejected, 2);
        assert!((slide.pixel_loss() - 6000.0 / 106_000.0).abs() < 1e-9);
    }
    assert!(report.preprocess.failures.is_empty());

    let superpatch = report.preprocess.superpatch.as_ref().unwrap();
    assert_eq!(superpatch.len(), 6);
    assert_eq!(superpatch.slides().len(), 2);
    assert!(out.path().join("superpatch_training.png").exists());

    assert!(report.model_path.exists());
    assert!(report.scores_path.exists());
    assert_eq!(report.selection.table.rows.len(), 3);
    assert_eq!(report.selection.model.n_clusters(), 2);

    let records = &report.segmentation.records;
    assert_eq!(records.len(), 20);
    assert!(report.segmentation.failures.is_empty());
    for record in records {
        assert_eq!(record.cluster_pixels.iter().sum::<u64>(), record.tissue_pixels);
        assert_eq!(record.tissue_pixels, 100 * 100);
        assert!(record.til_cluster.is_some());
        assert_eq!(record.til_region_count, 4);
        assert_eq!(record.til_pixels, 4 * nucleus_area());
    }
    let mut sorted = records.clone();
    sorted.sort_by(|a, b| (&a.patch.slide, a.patch.y, a.patch.x).cmp(&(&b.patch.slide, b.patch.y, b.patch.x)));
    assert_eq!(&sorted, records);

    for slide in ["slide_a", "slide_b"] {
        let csv = out.path().join(slide).join("quantification.csv");
        let rows = csv::Reader::from_path(&csv).unwrap().records().count();
        assert_eq!(rows, 10);
        let artifacts = out.path().join(slide).join("0_0");
        for name in ["overlay.png", "contours.png", "til_mask.png", "til_regions.csv", "til_regions.geojson"] {
            assert!(artifacts.join(name).exists(), "{slide}/{name}");
        }
    }
}

#[test]
fn saved_model_segments_stored_patches_again() {
    let input = slide_dir(&["slide_a.svs"]);
    let out = tempfile::tempdir().unwrap();
    let pipeline = pipeline();
    let first = pipeline.run(input.path(), out.path()).unwrap();

    let model = ClusteringModel::load_json(&first.model_path).unwrap();
    assert_eq!(model.centroids, first.selection.model.centroids);

    let store = PatchStore::new(out.path());
    let ids = store.list_all().unwrap();
    assert_eq!(ids.len(), 10);

    let rerun = tempfile::tempdir().unwrap();
    let second = pipeline.segment_all(&ids, &store, &model, rerun.path()).unwrap();
    assert_eq!(second.records, first.segmentation.records);
}

#[test]
fn background_slide_yields_no_patches_without_error() {
    let input = slide_dir(&["blank.svs"]);
    let out = tempfile::tempdir().unwrap();
    let options = PreprocessOptions {
        training: false,
        max_tile_x: 100,
        max_tile_y: 100,
        ..PreprocessOptions::default()
    };

    let report = pipeline().preprocess(input.path(), out.path(), &options).unwrap();
    assert_eq!(report.slides[0].accepted.len(), 0);
    assert_eq!(report.slides[0].pixel_loss(), 1.0);
    assert!(report.superpatch.is_none());
    assert!(report.warnings.contains(&PipelineWarning::NoTissue { slide: "blank".into() }));
}

#[test]
fn training_without_tissue_is_fatal() {
    let input = slide_dir(&["blank.svs"]);
    let out = tempfile::tempdir().unwrap();
    let error = pipeline().run(input.path(), out.path()).unwrap_err();
    assert!(matches!(error, TilsegError::InsufficientTissue { .. }));
    assert!(error.is_run_fatal());
}

#[test]
fn superpatch_uses_every_patch_when_fewer_are_available() {
    let input = slide_dir(&["slide_a.svs"]);
    let out = tempfile::tempdir().unwrap();
    let options = PreprocessOptions {
        patch_count: 50,
        max_tile_x: 100,
        max_tile_y: 100,
        ..PreprocessOptions::default()
    };

    let report = pipeline().preprocess(input.path(), out.path(), &options).unwrap();
    assert_eq!(report.superpatch.as_ref().unwrap().len(), 10);
    assert!(report.warnings.contains(&PipelineWarning::FewerPatchesThanRequested {
        requested: 50,
        available: 10,
    }));
}

#[test]
fn unreadable_slide_is_reported_and_skipped() {
    let input = slide_dir(&["corrupt.svs", "slide_a.svs"]);
    let out = tempfile::tempdir().unwrap();
    let options = PreprocessOptions {
        training: false,
        max_tile_x: 100,
        max_tile_y: 100,
        ..PreprocessOptions::default()
    };

    let report = pipeline().preprocess(input.path(), out.path(), &options).unwrap();
    assert_eq!(report.slides.len(), 1);
    assert_eq!(report.failures.len(), 1);
    assert!(report.failures[0].subject.ends_with("corrupt.svs"));
    assert!(matches!(report.failures[0].error, TilsegError::SlideRead { .. }));
}

#[test]
fn cancelled_run_stops_before_work() {
    let input = slide_dir(&["slide_a.svs"]);
    let out = tempfile::tempdir().unwrap();
    let cancel = CancellationToken::new();
    let pipeline = Pipeline::builder()
        .with_reader(SyntheticReader)
        .with_tile_size(100, 100)
        .with_cancellation(cancel.clone())
        .build()
        .unwrap();

    cancel.cancel();
    assert!(matches!(pipeline.run(input.path(), out.path()), Err(TilsegError::Cancelled)));
    assert!(!out.path().join("slide_a").exists());
}

#[test]
fn failed_selection_still_writes_the_score_table() {
    let input = slide_dir(&["slide_a.svs"]);
    let out = tempfile::tempdir().unwrap();
    let mut config = PipelineConfig::default();
    config.clustering.quality_bar = Some(f64::MAX);
    let pipeline = Pipeline::builder()
        .with_config(config)
        .with_reader(SyntheticReader)
        .with_tile_size(100, 100)
        .with_patch_count(4)
        .with_candidates(vec![CandidateConfig::kmeans(2), CandidateConfig::kmeans(3)])
        .build()
        .unwrap();

    let error = pipeline.run(input.path(), out.path()).unwrap_err();
    assert!(matches!(error, TilsegError::ModelSelection { .. }));

    let scores = out.path().join("model_scores.csv");
    assert!(scores.exists());
    assert_eq!(csv::Reader::from_path(&scores).unwrap().records().count(), 2);
    assert!(!out.path().join("model.json").exists());
}

/// Writes the synthetic slides as real rasters so the default reader decodes them.
fn raster_slide_dir(names: &[&str]) -> tempfile::TempDir {
    let dir = tempfile::tempdir().unwrap();
    for name in names {
        let path = dir.path().join(name);
        let handle = SyntheticReader.open(&path).unwrap();
        let (width, height) = handle.dimensions();
        let raster = SyntheticReader.read_region(&handle, Region::new(0, 0, width, height), 0).unwrap();
        raster.save(&path).unwrap();
    }
    dir
}

#[test]
fn decoded_slides_are_released_once_stages_finish() {
    let input = raster_slide_dir(&["slide_a.tif", "slide_b.tif"]);
    let out = tempfile::tempdir().unwrap();
    let reader = Arc::new(RasterSlideReader::new());
    let mut config = PipelineConfig::default();
    config.tiling.save_images = false;
    let pipeline = Pipeline::builder()
        .with_config(config)
        .with_shared_reader(reader.clone())
        .with_tile_size(100, 100)
        .with_patch_count(4)
        .with_candidates(vec![CandidateConfig::kmeans(2)])
        .build()
        .unwrap();

    let options = PreprocessOptions {
        patch_count: 4,
        save_images: false,
        max_tile_x: 100,
        max_tile_y: 100,
        ..PreprocessOptions::default()
    };
    let report = pipeline.preprocess(input.path(), out.path(), &options).unwrap();
    assert_eq!(report.slides.len(), 2);
    assert_eq!(report.superpatch.as_ref().unwrap().len(), 4);
    assert_eq!(reader.cached(), 0);

    let run = pipeline.run(input.path(), out.path()).unwrap();
    assert_eq!(run.segmentation.records.len(), 20);
    assert_eq!(reader.cached(), 0);
}
