use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use thiserror::Error;
use tilseg::PipelineConfig;

#[derive(Error, Debug)]
pub enum CliError {
    #[error(transparent)]
    SerdeError(#[from] serde_json::Error),
    #[error(transparent)]
    TomlDeError(#[from] toml::de::Error),
    #[error(transparent)]
    TomlSerError(#[from] toml::ser::Error),
    #[error(transparent)]
    IoError(#[from] std::io::Error),
    #[error(transparent)]
    Pipeline(#[from] tilseg::TilsegError),
    #[error("Unsupported file format. Please use .toml or .json files")]
    UnsupportedFileFormat,
}

/// A full run: where the slides are, where results go, and how to process them
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, PartialEq)]
pub struct RunManifest {
    /// Slide file or directory of slides
    pub input: PathBuf,
    pub output_dir: PathBuf,
    #[serde(default)]
    pub pipeline: PipelineConfig,
}

impl RunManifest {
    pub fn new(input: impl Into<PathBuf>, output_dir: impl Into<PathBuf>) -> Self {
        Self {
            input: input.into(),
            output_dir: output_dir.into(),
            pipeline: PipelineConfig::default(),
        }
    }

    /// Load a manifest from a TOML file
    pub fn from_toml_file<P: AsRef<Path>>(path: P) -> Result<Self, CliError> {
        let content = fs::read_to_string(path)?;
        Self::from_toml(&content)
    }

    pub fn from_toml(content: &str) -> Result<Self, CliError> {
        let manifest: RunManifest = toml::from_str(content)?;
        manifest.pipeline.validate()?;
        Ok(manifest)
    }

    /// Load a manifest from a JSON file
    pub fn from_json_file<P: AsRef<Path>>(path: P) -> Result<Self, CliError> {
        let content = fs::read_to_string(path)?;
        Self::from_json(&content)
    }

    pub fn from_json(content: &str) -> Result<Self, CliError> {
        let manifest: RunManifest = serde_json::from_str(content)?;
        manifest.pipeline.validate()?;
        Ok(manifest)
    }

    /// Auto-detect file format and load the manifest
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self, CliError> {
        let path_ref = path.as_ref();
        match path_ref.extension().and_then(|ext| ext.to_str()) {
            Some("toml") => Self::from_toml_file(path),
            Some("json") => Self::from_json_file(path),
            _ => Err(CliError::UnsupportedFileFormat),
        }
    }

    pub fn to_toml_file<P: AsRef<Path>>(&self, path: P) -> Result<(), CliError> {
        fs::write(path, self.to_toml()?)?;
        Ok(())
    }

    pub fn to_toml(&self) -> Result<String, CliError> {
        Ok(toml::to_string_pretty(&self)?)
    }

    pub fn to_json(&self) -> Result<String, CliError> {
        Ok(serde_json::to_string_pretty(&self)?)
    }
}

/// Pipeline config from a TOML or JSON file, defaults when absent
pub fn load_pipeline_config(path: Option<&Path>) -> Result<PipelineConfig, CliError> {
    let Some(path) = path else {
        return Ok(PipelineConfig::default());
    };
    let content = fs::read_to_string(path)?;
    let config: PipelineConfig = match path.extension().and_then(|ext| ext.to_str()) {
        Some("toml") => toml::from_str(&content)?,
        Some("json") => serde_json::from_str(&content)?,
        _ => return Err(CliError::UnsupportedFileFormat),
    };
    config.validate()?;
    Ok(config)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tilseg::CandidateConfig;

    #[test]
    fn toml_manifest_fills_defaults() {
        let manifest = RunManifest::from_toml(
            r#"
            input = "slides"
            output_dir = "out"

            [pipeline.tiling]
            max_tile_x = 2000
            max_tile_y = 2000

            [[pipeline.clustering.candidates]]
            algorithm = "kmeans"
            n_clusters = 4

            [[pipeline.clustering.candidates]]
            algorithm = "minibatch_kmeans"
            n_clusters = 5
            batch_size = 512
            "#,
        )
        .unwrap();

        assert_eq!(manifest.input, PathBuf::from("slides"));
        assert_eq!(manifest.pipeline.tiling.max_tile_x, 2000);
        assert_eq!(manifest.pipeline.sampling.patch_count, 6);
        assert_eq!(manifest.pipeline.clustering.candidates[0], CandidateConfig::kmeans(4));
        assert_eq!(manifest.pipeline.clustering.candidates[1].n_clusters(), 5);
    }

    #[test]
    fn toml_round_trip_through_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("run.toml");
        let manifest = RunManifest::new("slides/a.svs", "out");
        manifest.to_toml_file(&path).unwrap();
        assert_eq!(RunManifest::from_file(&path).unwrap(), manifest);
    }

    #[test]
    fn invalid_pipeline_is_rejected_on_load() {
        let result = RunManifest::from_json(
            r#"{"input": "s", "output_dir": "o", "pipeline": {"sampling": {"patch_count": 0}}}"#,
        );
        assert!(matches!(result, Err(CliError::Pipeline(_))));
    }

    #[test]
    fn unknown_extension_is_unsupported() {
        assert!(matches!(
            RunManifest::from_file("run.yaml"),
            Err(CliError::UnsupportedFileFormat)
        ));
    }
}
