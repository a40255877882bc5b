use clap::{Parser, Subcommand};
use cli::{RunManifest, load_pipeline_config};
use color_eyre::eyre::{Result, eyre};
use std::path::{Path, PathBuf};
use tilseg::{
    CancellationToken, ClusteringModel, PatchStore, Pipeline, PipelineConfig, PreprocessOptions, ScoreTable,
    Superpatch, TilsegError,
    pipeline::{MODEL_FILE, SCORES_FILE, SUPERPATCH_FILE},
};
use tracing::{error, info, warn};
use tracing_subscriber::{self, EnvFilter};

#[derive(Parser)]
#[command(author, version, about, long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Tile slides, keep tissue patches and build the training superpatch
    Preprocess {
        /// Slide file or directory of slides
        #[arg(short, long)]
        input: PathBuf,
        #[arg(short, long)]
        output_dir: PathBuf,
        /// Pipeline configuration (.toml or .json)
        #[arg(short, long)]
        config: Option<PathBuf>,
        /// Patches composited into the superpatch
        #[arg(long)]
        patches: Option<usize>,
        #[arg(long)]
        max_tile_x: Option<u32>,
        #[arg(long)]
        max_tile_y: Option<u32>,
        /// Tile and filter only
        #[arg(long)]
        no_training: bool,
        /// Keep accepted patches in memory instead of writing them
        #[arg(long)]
        no_save_images: bool,
    },
    /// Fit and score the configured candidates on a superpatch
    Select {
        /// Superpatch image, usually <output_dir>/superpatch_training.png
        #[arg(short, long)]
        superpatch: PathBuf,
        #[arg(short, long)]
        output_dir: PathBuf,
        #[arg(short, long)]
        config: Option<PathBuf>,
    },
    /// Segment the stored patches of a preprocess run with a saved model
    Segment {
        /// Directory written by `preprocess`
        #[arg(short, long)]
        patches_dir: PathBuf,
        /// Model JSON written by `select`
        #[arg(short, long)]
        model: PathBuf,
        #[arg(short, long)]
        output_dir: PathBuf,
        #[arg(short, long)]
        config: Option<PathBuf>,
    },
    /// Run every stage from a manifest
    Run {
        /// Run manifest (.toml or .json)
        #[arg(short, long)]
        manifest: PathBuf,
    },
    /// Print the JSON schema of the run manifest
    Schema,
}

#[tokio::main]
async fn main() -> Result<()> {
    color_eyre::install()?;

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new("info"))
        )
        .init();

    let cli = Cli::parse();
    let cancel = CancellationToken::new();
    {
        let cancel = cancel.clone();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                warn!("interrupt received, stopping after in-flight work");
                cancel.cancel();
            }
        });
    }

    match cli.command {
        Commands::Preprocess {
            input,
            output_dir,
            config,
            patches,
            max_tile_x,
            max_tile_y,
            no_training,
            no_save_images,
        } => {
            let config = load_pipeline_config(config.as_deref())?;
            let mut options = PreprocessOptions::from_config(&config);
            options.patch_count = patches.unwrap_or(options.patch_count);
            options.max_tile_x = max_tile_x.unwrap_or(options.max_tile_x);
            options.max_tile_y = max_tile_y.unwrap_or(options.max_tile_y);
            options.training = !no_training;
            options.save_images = !no_save_images;
            blocking(move || preprocess(config, cancel, &input, &output_dir, &options)).await?;
        }
        Commands::Select {
            superpatch,
            output_dir,
            config,
        } => {
            let config = load_pipeline_config(config.as_deref())?;
            blocking(move || select(config, cancel, &superpatch, &output_dir)).await?;
        }
        Commands::Segment {
            patches_dir,
            model,
            output_dir,
            config,
        } => {
            let config = load_pipeline_config(config.as_deref())?;
            blocking(move || segment(config, cancel, &patches_dir, &model, &output_dir)).await?;
        }
        Commands::Run { manifest } => {
            let manifest = RunManifest::from_file(&manifest)?;
            blocking(move || run(manifest, cancel)).await?;
        }
        Commands::Schema => {
            let schema = schemars::schema_for!(RunManifest);
            println!("{}", serde_json::to_string_pretty(&schema)?);
        }
    }

    Ok(())
}

/// Pipeline work is CPU bound; keep it off the async workers.
async fn blocking<F>(work: F) -> Result<()>
where
    F: FnOnce() -> Result<()> + Send + 'static,
{
    tokio::task::spawn_blocking(work).await?
}

fn build(config: PipelineConfig, cancel: CancellationToken) -> Result<Pipeline> {
    Ok(Pipeline::builder()
        .with_config(config)
        .with_cancellation(cancel)
        .build()?)
}

fn preprocess(
    config: PipelineConfig,
    cancel: CancellationToken,
    input: &Path,
    output_dir: &Path,
    options: &PreprocessOptions,
) -> Result<()> {
    let pipeline = build(config, cancel)?;
    let report = pipeline.preprocess(input, output_dir, options)?;

    for slide in &report.slides {
        info!(
            "{}: {} of {} patches kept, {:.2}% pixels lost",
            slide.slide,
            slide.accepted.len(),
            slide.cells,
            slide.pixel_loss_percent()
        );
    }
    for failure in &report.failures {
        error!("{}: {}", failure.subject, failure.error);
    }
    if let Some(path) = &report.superpatch_path {
        info!("Superpatch written to {}", path.display());
    }
    Ok(())
}

fn select(config: PipelineConfig, cancel: CancellationToken, superpatch: &Path, output_dir: &Path) -> Result<()> {
    let candidates = config.clustering.candidates.clone();
    let pipeline = build(config, cancel)?;
    let raster = tilseg::io::load_patch(superpatch)?.to_rgb8();
    std::fs::create_dir_all(output_dir)?;
    let scores_path = output_dir.join(SCORES_FILE);
    let selection = match pipeline.select_model(&Superpatch::from_image(raster), &candidates) {
        Ok(selection) => selection,
        Err(TilsegError::ModelSelection { reason, table }) => {
            table.write_csv(&scores_path)?;
            print_scores(&table);
            error!("Scores written to {}", scores_path.display());
            return Err(eyre!("model selection failed: {reason}"));
        }
        Err(error) => return Err(error.into()),
    };

    let model_path = output_dir.join(MODEL_FILE);
    selection.model.save_json(&model_path)?;
    selection.table.write_csv(&scores_path)?;
    print_scores(&selection.table);
    info!("Model {} written to {}", selection.model.candidate, model_path.display());
    Ok(())
}

fn print_scores(table: &ScoreTable) {
    for row in &table.rows {
        info!("{:<28} {:<16} {:?}", row.config.to_string(), row.status.label(), row.score);
    }
}

fn segment(
    config: PipelineConfig,
    cancel: CancellationToken,
    patches_dir: &Path,
    model: &Path,
    output_dir: &Path,
) -> Result<()> {
    let pipeline = build(config, cancel)?;
    let model = ClusteringModel::load_json(model)?;
    let store = PatchStore::new(patches_dir);
    let ids = store.list_all()?;
    if ids.is_empty() {
        return Err(eyre!("no stored patches under {}", patches_dir.display()));
    }

    let report = pipeline.segment_all(&ids, &store, &model, output_dir)?;
    for failure in &report.failures {
        error!("{}: {}", failure.subject, failure.error);
    }
    for path in &report.csv_paths {
        info!("Quantification appended to {}", path.display());
    }
    Ok(())
}

fn run(manifest: RunManifest, cancel: CancellationToken) -> Result<()> {
    let pipeline = build(manifest.pipeline, cancel)?;
    let report = match pipeline.run(&manifest.input, &manifest.output_dir) {
        Ok(report) => report,
        Err(TilsegError::ModelSelection { reason, table }) => {
            print_scores(&table);
            error!("Scores written to {}", manifest.output_dir.join(SCORES_FILE).display());
            return Err(eyre!("model selection failed: {reason}"));
        }
        Err(error) => return Err(error.into()),
    };

    let failures = report.preprocess.failures.iter().chain(&report.segmentation.failures);
    for failure in failures {
        error!("{}: {}", failure.subject, failure.error);
    }
    info!(
        "Selected {} ({} = {:.4}); {} patches segmented, superpatch at {}",
        report.selection.model.candidate,
        report.selection.model.metric,
        report.selection.model.score,
        report.segmentation.records.len(),
        manifest.output_dir.join(SUPERPATCH_FILE).display()
    );
    Ok(())
}
