pub mod components;
pub mod kmeans;
pub mod metrics;
pub mod simplification;
pub mod tissue;

pub use components::{Component, extract_components, extract_labelled_components};
pub use kmeans::{Centroids, MAX_CLUSTERS};
pub use metrics::{CalinskiHarabasz, DaviesBouldin, MetricKind, ScoreOrientation, Silhouette};
pub use simplification::DouglasPeuckerSimplifier;
pub use tissue::{ColorDescriptor, TissueFilter, TissueThresholds};
