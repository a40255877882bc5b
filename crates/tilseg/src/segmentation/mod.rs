//! Applies a fitted model to a patch: label map, regions, TIL candidates and counts.

pub mod render;

use image::{GrayImage, Luma};
use rayon::prelude::*;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use strum::Display;

use crate::{
    algorithms::{
        components::{Component, extract_components, extract_labelled_components},
        tissue::{TissueFilter, TissueThresholds},
    },
    config::SegmentationConfig,
    error::{Result, TilsegError},
    quantification::QuantificationRecord,
    selection::ClusteringModel,
    types::{Patch, PatchId, TilRegion},
};

pub use render::{PALETTE, SegmentationArtifacts};

/// Shape limits for a connected region to count as a TIL candidate
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(default)]
pub struct TilHeuristics {
    /// Regions must be strictly larger than this many pixels
    pub min_area: u64,
    /// Regions must be strictly smaller than this many pixels
    pub max_area: u64,
    /// Exclusive upper bound on perimeter^2 / (4 * pi * area)
    pub max_roundness: f64,
}

impl Default for TilHeuristics {
    fn default() -> Self {
        Self {
            min_area: 200,
            max_area: 2000,
            max_roundness: 3.0,
        }
    }
}

impl TilHeuristics {
    pub fn accepts(&self, component: &Component) -> bool {
        component.pixel_area > self.min_area
            && component.pixel_area < self.max_area
            && component.perimeter() > 0.0
            && component.roundness() < self.max_roundness
    }
}

/// How the TIL cluster is chosen among the model's clusters
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize, JsonSchema, Display)]
#[serde(tag = "rule", content = "label", rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum TilClusterSelection {
    /// The cluster with the most qualifying regions; ties go to the lowest label
    #[default]
    MostRegions,
    /// The cluster whose centroid has the lowest luminance
    Darkest,
    /// A fixed cluster label
    Label(u8),
}

/// Cluster id per pixel, row-major, same shape as the patch
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClusterLabelMap {
    width: u32,
    height: u32,
    labels: Vec<u8>,
    n_clusters: usize,
}

impl ClusterLabelMap {
    pub fn new(width: u32, height: u32, labels: Vec<u8>, n_clusters: usize) -> Result<Self> {
        if labels.len() != width as usize * height as usize {
            return Err(TilsegError::InvalidPatch(format!(
                "{} labels for a {width}x{height} patch",
                labels.len()
            )));
        }
        if let Some(&bad) = labels.iter().find(|&&l| l as usize >= n_clusters) {
            return Err(TilsegError::InvalidPatch(format!("label {bad} outside {n_clusters} clusters")));
        }
        Ok(Self {
            width,
            height,
            labels,
            n_clusters,
        })
    }

    pub fn width(&self) -> u32 {
        self.width
    }

    pub fn height(&self) -> u32 {
        self.height
    }

    pub fn n_clusters(&self) -> usize {
        self.n_clusters
    }

    pub fn labels(&self) -> &[u8] {
        &self.labels
    }

    pub fn get(&self, x: u32, y: u32) -> u8 {
        self.labels[y as usize * self.width as usize + x as usize]
    }

    /// 255 where the pixel belongs to `cluster`, 0 elsewhere
    pub fn mask(&self, cluster: u8) -> GrayImage {
        GrayImage::from_fn(self.width, self.height, |x, y| {
            Luma([if self.get(x, y) == cluster { 255 } else { 0 }])
        })
    }

    pub fn counts(&self) -> Vec<u64> {
        let mut counts = vec![0u64; self.n_clusters];
        for &l in &self.labels {
            counts[l as usize] += 1;
        }
        counts
    }
}

#[derive(Debug, Clone)]
pub struct Segmentation {
    pub patch: PatchId,
    pub labels: ClusterLabelMap,
    pub til_cluster: Option<u8>,
    /// Qualifying regions in the TIL cluster
    pub regions: Vec<TilRegion>,
    /// Qualifying region count of every cluster
    pub candidates_per_cluster: Vec<usize>,
    /// 255 inside TIL regions
    pub til_mask: GrayImage,
    pub record: QuantificationRecord,
}

/// Segments patches with a shared, read-only model
#[derive(Debug, Clone)]
pub struct SegmentationEngine {
    config: SegmentationConfig,
    filter: TissueFilter,
}

impl SegmentationEngine {
    pub fn new(config: SegmentationConfig, thresholds: TissueThresholds) -> Self {
        Self {
            config,
            filter: TissueFilter::new(thresholds),
        }
    }

    pub fn config(&self) -> &SegmentationConfig {
        &self.config
    }

    /// Nearest-centroid label of every pixel.
    pub fn label_map(&self, patch: &Patch, model: &ClusteringModel) -> Result<ClusterLabelMap> {
        let channels = patch.pixels.color().channel_count() as usize;
        if channels < 3 {
            return Err(TilsegError::FeatureMismatch {
                patch: patch.id.to_string(),
                expected: model.feature_dims(),
                found: channels,
            });
        }
        if patch.width() == 0 || patch.height() == 0 {
            return Err(TilsegError::InvalidPatch(format!("{} has no pixels", patch.id)));
        }
        let rgb = patch.pixels.to_rgb8();
        let features = model.extractor().extract(&rgb);
        model.check_features(&patch.id, &features)?;
        ClusterLabelMap::new(rgb.width(), rgb.height(), model.predict(&features), model.n_clusters())
    }

    pub fn segment(&self, patch: &Patch, model: &ClusteringModel) -> Result<Segmentation> {
        let labels = self.label_map(patch, model)?;
        let n_clusters = labels.n_clusters();

        let qualifying: Vec<Vec<Component>> = (0..n_clusters as u8)
            .into_par_iter()
            .map(|cluster| {
                extract_components(&labels.mask(cluster))
                    .into_iter()
                    .filter(|c| self.config.til.accepts(c))
                    .collect()
            })
            .collect();
        let candidates_per_cluster: Vec<usize> = qualifying.iter().map(Vec::len).collect();

        let til_cluster = self.choose_til_cluster(&candidates_per_cluster, model);
        let (regions, til_mask) = match til_cluster {
            Some(cluster) => self.til_regions(&patch.id, &labels, cluster),
            None => (Vec::new(), GrayImage::new(labels.width(), labels.height())),
        };

        let record = self.quantify(patch, &labels, til_cluster, &regions, &til_mask);
        tracing::debug!(
            patch = %patch.id,
            til_cluster = ?til_cluster,
            regions = regions.len(),
            til_fraction = record.til_area_fraction,
            "segmented patch"
        );

        Ok(Segmentation {
            patch: patch.id.clone(),
            labels,
            til_cluster,
            regions,
            candidates_per_cluster,
            til_mask,
            record,
        })
    }

    fn choose_til_cluster(&self, candidates: &[usize], model: &ClusteringModel) -> Option<u8> {
        match self.config.til_cluster {
            TilClusterSelection::MostRegions => {
                let mut best: Option<(usize, usize)> = None;
                for (cluster, &count) in candidates.iter().enumerate() {
                    if count > 0 && best.is_none_or(|(_, b)| count > b) {
                        best = Some((cluster, count));
                    }
                }
                best.map(|(cluster, _)| cluster as u8)
            }
            TilClusterSelection::Darkest => model
                .centroids
                .iter()
                .map(|c| 0.299 * c[0] + 0.587 * c[1] + 0.114 * c[2])
                .enumerate()
                .min_by(|a, b| a.1.total_cmp(&b.1))
                .map(|(cluster, _)| cluster as u8),
            TilClusterSelection::Label(label) if (label as usize) < candidates.len() => Some(label),
            TilClusterSelection::Label(label) => {
                tracing::warn!(label, clusters = candidates.len(), "configured TIL cluster does not exist");
                None
            }
        }
    }

    /// Qualifying regions of `cluster` and the mask covering them.
    fn til_regions(&self, patch: &PatchId, labels: &ClusterLabelMap, cluster: u8) -> (Vec<TilRegion>, GrayImage) {
        let (component_image, components) = extract_labelled_components(&labels.mask(cluster));
        let mut keep = vec![false; components.last().map_or(0, |c| c.label as usize + 1)];
        let mut regions = Vec::new();

        for component in components.into_iter().filter(|c| self.config.til.accepts(c)) {
            keep[component.label as usize] = true;
            regions.push(TilRegion {
                patch: patch.clone(),
                label: cluster,
                pixel_area: component.pixel_area,
                perimeter: component.perimeter(),
                roundness: component.roundness(),
                centroid: component.centroid,
                enclosing_circle_area: component.enclosing_circle_area(),
                shape: component.shape,
            });
        }

        let mask = GrayImage::from_fn(labels.width(), labels.height(), |x, y| {
            let id = component_image.get_pixel(x, y)[0] as usize;
            Luma([if id > 0 && keep.get(id).copied().unwrap_or(false) { 255 } else { 0 }])
        });
        (regions, mask)
    }

    fn quantify(
        &self,
        patch: &Patch,
        labels: &ClusterLabelMap,
        til_cluster: Option<u8>,
        regions: &[TilRegion],
        til_mask: &GrayImage,
    ) -> QuantificationRecord {
        let rgb = patch.pixels.to_rgb8();
        let mut cluster_pixels = vec![0u64; labels.n_clusters()];
        let mut tissue_pixels = 0u64;
        let mut til_pixels = 0u64;

        for (x, y, pixel) in rgb.enumerate_pixels() {
            if !self.filter.is_tissue_pixel(pixel) {
                continue;
            }
            tissue_pixels += 1;
            cluster_pixels[labels.get(x, y) as usize] += 1;
            if til_mask.get_pixel(x, y)[0] > 0 {
                til_pixels += 1;
            }
        }

        QuantificationRecord {
            patch: patch.id.clone(),
            n_clusters: labels.n_clusters(),
            cluster_pixels,
            tissue_pixels,
            background_pixels: patch.pixel_count() - tissue_pixels,
            til_cluster,
            til_region_count: regions.len(),
            til_pixels,
            til_area_fraction: if tissue_pixels == 0 {
                0.0
            } else {
                til_pixels as f64 / tissue_pixels as f64
            },
        }
    }

    pub fn render(&self, patch: &Patch, segmentation: &Segmentation) -> SegmentationArtifacts {
        SegmentationArtifacts::render(&patch.pixels.to_rgb8(), segmentation, &self.config)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        algorithms::kmeans::Centroids,
        features::FeatureSpace,
        selection::CandidateConfig,
        types::Region,
    };
    use image::{DynamicImage, Rgb, RgbImage};

    const STROMA: Rgb<u8> = Rgb([230, 150, 200]);
    const NUCLEUS: Rgb<u8> = Rgb([60, 30, 110]);
    const GLASS: Rgb<u8> = Rgb([250, 250, 250]);

    fn model() -> ClusteringModel {
        let norm = |p: Rgb<u8>| p.0.map(|v| v as f32 / 255.0);
        let mut centres = Vec::new();
        for colour in [STROMA, NUCLEUS, GLASS] {
            centres.extend(norm(colour));
        }
        ClusteringModel {
            candidate: CandidateConfig::kmeans(3),
            feature_space: FeatureSpace::Rgb,
            centroids: Centroids::new(3, centres),
            metric: "calinski_harabasz".into(),
            score: 1.0,
            inertia: 0.0,
        }
    }

    /// Stroma with a glass strip, four nucleus blobs of 20x20 and one oversized 60x60 blob
    fn patch() -> Patch {
        let mut img = RgbImage::from_pixel(200, 120, STROMA);
        for y in 100..120 {
            for x in 0..200 {
                img.put_pixel(x, y, GLASS);
            }
        }
        let mut blob = |x0: u32, y0: u32, side: u32| {
            for y in y0..y0 + side {
                for x in x0..x0 + side {
                    img.put_pixel(x, y, NUCLEUS);
                }
            }
        };
        for x0 in [5, 35, 65, 95] {
            blob(x0, 10, 20);
        }
        blob(130, 20, 60);
        Patch::from_rgb(PatchId::new("s", Region::new(0, 0, 200, 120)), img)
    }

    fn engine() -> SegmentationEngine {
        SegmentationEngine::new(SegmentationConfig::default(), TissueThresholds::default())
    }

    #[test]
    fn finds_til_regions_in_the_nucleus_cluster() {
        let seg = engine().segment(&patch(), &model()).unwrap();
        assert_eq!(seg.til_cluster, Some(1));
        assert_eq!(seg.regions.len(), 4);
        assert!(seg.regions.iter().all(|r| r.pixel_area == 400 && r.label == 1));
        assert_eq!(seg.candidates_per_cluster[1], 4);

        let mask_pixels = seg.til_mask.pixels().filter(|p| p[0] == 255).count();
        assert_eq!(mask_pixels, 1600);
    }

    #[test]
    fn counts_cover_tissue_only() {
        let seg = engine().segment(&patch(), &model()).unwrap();
        let record = &seg.record;
        assert_eq!(record.cluster_pixels.iter().sum::<u64>(), record.tissue_pixels);
        assert_eq!(record.background_pixels, 200 * 20);
        assert_eq!(record.cluster_pixels[2], 0);
        assert_eq!(record.til_pixels, 1600);
        assert_eq!(record.til_region_count, 4);
        let expected = 1600.0 / record.tissue_pixels as f64;
        assert!((record.til_area_fraction - expected).abs() < 1e-12);
    }

    #[test]
    fn segmentation_is_idempotent() {
        let engine = engine();
        let (patch, model) = (patch(), model());
        let a = engine.segment(&patch, &model).unwrap();
        let b = engine.segment(&patch, &model).unwrap();
        assert_eq!(a.labels, b.labels);
        assert_eq!(a.record, b.record);
    }

    #[test]
    fn cluster_selection_rules() {
        let mut config = SegmentationConfig::default();
        config.til_cluster = TilClusterSelection::Darkest;
        let darkest = SegmentationEngine::new(config.clone(), TissueThresholds::default());
        assert_eq!(darkest.segment(&patch(), &model()).unwrap().til_cluster, Some(1));

        config.til_cluster = TilClusterSelection::Label(0);
        let fixed = SegmentationEngine::new(config.clone(), TissueThresholds::default());
        let seg = fixed.segment(&patch(), &model()).unwrap();
        assert_eq!(seg.til_cluster, Some(0));
        assert!(seg.regions.is_empty());

        config.til_cluster = TilClusterSelection::Label(7);
        let missing = SegmentationEngine::new(config, TissueThresholds::default());
        assert_eq!(missing.segment(&patch(), &model()).unwrap().til_cluster, None);
    }

    #[test]
    fn grayscale_patches_are_feature_mismatches() {
        let gray = Patch::new(
            PatchId::new("s", Region::new(0, 0, 4, 4)),
            DynamicImage::ImageLuma8(GrayImage::new(4, 4)),
        );
        assert!(matches!(
            engine().segment(&gray, &model()),
            Err(TilsegError::FeatureMismatch { expected: 3, found: 1, .. })
        ));
    }

    #[test]
    fn model_with_other_feature_space_is_rejected() {
        let mut texture_model = model();
        texture_model.feature_space = FeatureSpace::RgbTexture;
        assert!(matches!(
            engine().segment(&patch(), &texture_model),
            Err(TilsegError::FeatureMismatch { expected: 3, found: 5, .. })
        ));
    }

    /// One `width` x `height` block on a blank mask, grown or trimmed by a single corner pixel
    fn block(width: u32, height: u32, corner: Option<bool>) -> Component {
        let mut mask = GrayImage::new(80, 80);
        for y in 5..5 + height {
            for x in 5..5 + width {
                mask.put_pixel(x, y, Luma([255]));
            }
        }
        match corner {
            Some(true) => mask.put_pixel(5 + width, 5, Luma([255])),
            Some(false) => mask.put_pixel(5, 5, Luma([0])),
            None => {}
        }
        let mut components = extract_components(&mask);
        assert_eq!(components.len(), 1);
        components.remove(0)
    }

    #[test]
    fn til_area_and_roundness_bounds_are_exclusive() {
        let til = TilHeuristics::default();

        let at_min = block(10, 20, None);
        assert_eq!(at_min.pixel_area, 200);
        assert!(!til.accepts(&at_min));
        let above_min = block(10, 20, Some(true));
        assert_eq!(above_min.pixel_area, 201);
        assert!(til.accepts(&above_min));

        let at_max = block(40, 50, None);
        assert_eq!(at_max.pixel_area, 2000);
        assert!(!til.accepts(&at_max));
        let below_max = block(40, 50, Some(false));
        assert_eq!(below_max.pixel_area, 1999);
        assert!(til.accepts(&below_max));

        let at_roundness = TilHeuristics {
            max_roundness: above_min.roundness(),
            ..til
        };
        assert!(!at_roundness.accepts(&above_min));
    }

    #[test]
    fn label_lookup_is_row_major() {
        let labels = (0..12).map(|i| (i % 3) as u8).collect();
        let map = ClusterLabelMap::new(4, 3, labels, 3).unwrap();
        assert_eq!(map.get(0, 0), 0);
        assert_eq!(map.get(3, 0), 0);
        assert_eq!(map.get(1, 1), 2);
        assert_eq!(map.get(3, 2), 2);
        assert_eq!(map.mask(2).get_pixel(1, 1)[0], 255);
        assert_eq!(map.counts(), vec![4, 4, 4]);
    }

    #[test]
    fn selection_rule_parses_from_config() {
        let rule: TilClusterSelection = serde_json::from_str(r#"{"rule":"label","label":2}"#).unwrap();
        assert_eq!(rule, TilClusterSelection::Label(2));
        let rule: TilClusterSelection = serde_json::from_str(r#"{"rule":"most_regions"}"#).unwrap();
        assert_eq!(rule, TilClusterSelection::MostRegions);
    }
}
