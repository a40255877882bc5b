use thiserror::Error;

use crate::selection::ScoreTable;

#[derive(Error, Debug)]
pub enum TilsegError {
    #[error("Invalid patch: {0}")]
    InvalidPatch(String),

    #[error("Failed to read slide '{slide}': {reason}")]
    SlideRead { slide: String, reason: String },

    #[error("Unsupported slide format: {0}")]
    UnsupportedFormat(String),

    #[error("No tissue found across {slides} slide(s)")]
    InsufficientTissue { slides: usize },

    #[error("Model selection failed: {reason}")]
    ModelSelection {
        reason: String,
        /// Scores of every candidate, kept so callers can retry with other configurations
        table: Box<ScoreTable>,
    },

    #[error("Feature mismatch for patch {patch}: model expects {expected} dimensions, patch yields {found}")]
    FeatureMismatch {
        patch: String,
        expected: usize,
        found: usize,
    },

    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("Run cancelled")]
    Cancelled,

    #[error("Image error: {0}")]
    Image(#[from] image::ImageError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("CSV error: {0}")]
    Csv(#[from] csv::Error),

    #[error("GeoJSON error: {0}")]
    GeoJson(#[from] geojson::Error),
}

impl TilsegError {
    pub fn slide_read(slide: impl Into<String>, reason: impl ToString) -> Self {
        Self::SlideRead {
            slide: slide.into(),
            reason: reason.to_string(),
        }
    }

    /// Errors after which no downstream stage can run.
    pub fn is_run_fatal(&self) -> bool {
        matches!(
            self,
            Self::InsufficientTissue { .. }
                | Self::ModelSelection { .. }
                | Self::InvalidConfig(_)
                | Self::Cancelled
        )
    }
}

pub type Result<T> = std::result::Result<T, TilsegError>;
