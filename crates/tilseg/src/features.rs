//! Per-pixel feature vectors for clustering.

use image::RgbImage;
use rand::{SeedableRng, rngs::StdRng};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use strum::{Display, EnumIter, EnumString, IntoStaticStr, VariantNames};

use crate::types::Region;

#[derive(
    Debug, Clone, Copy, Default,
    Serialize, Deserialize, JsonSchema,
    Display, EnumString, EnumIter, VariantNames, IntoStaticStr,
    PartialEq, Eq
)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum FeatureSpace {
    /// Normalized RGB
    #[default]
    Rgb,
    /// Normalized RGB plus mean and standard deviation of luminance in a 3x3 window
    RgbTexture,
}

impl FeatureSpace {
    pub fn dims(&self) -> usize {
        match self {
            Self::Rgb => 3,
            Self::RgbTexture => 5,
        }
    }
}

/// Row-major matrix of feature vectors
#[derive(Debug, Clone, PartialEq)]
pub struct FeatureMatrix {
    dims: usize,
    data: Vec<f32>,
}

impl FeatureMatrix {
    pub fn with_capacity(dims: usize, rows: usize) -> Self {
        Self {
            dims,
            data: Vec::with_capacity(dims * rows),
        }
    }

    /// Build from flat data; trailing values that do not fill a row are dropped.
    pub fn from_flat(dims: usize, mut data: Vec<f32>) -> Self {
        if dims == 0 {
            data.clear();
        } else {
            data.truncate(data.len() - data.len() % dims);
        }
        Self { dims, data }
    }

    pub fn push(&mut self, row: &[f32]) {
        debug_assert_eq!(row.len(), self.dims);
        self.data.extend_from_slice(row);
    }

    pub fn dims(&self) -> usize {
        self.dims
    }

    pub fn len(&self) -> usize {
        if self.dims == 0 { 0 } else { self.data.len() / self.dims }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn row(&self, index: usize) -> &[f32] {
        &self.data[index * self.dims..(index + 1) * self.dims]
    }

    pub fn rows(&self) -> std::slice::ChunksExact<'_, f32> {
        self.data.chunks_exact(self.dims.max(1))
    }

    pub fn as_slice(&self) -> &[f32] {
        &self.data
    }

    /// Keep at most `max_rows` rows, chosen uniformly with a fixed seed, in original order.
    pub fn subsample(&self, max_rows: usize, seed: u64) -> FeatureMatrix {
        if self.len() <= max_rows {
            return self.clone();
        }
        let mut rng = StdRng::seed_from_u64(seed);
        let mut indices = rand::seq::index::sample(&mut rng, self.len(), max_rows).into_vec();
        indices.sort_unstable();

        let mut out = FeatureMatrix::with_capacity(self.dims, max_rows);
        for i in indices {
            out.push(self.row(i));
        }
        out
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct FeatureExtractor {
    pub space: FeatureSpace,
}

impl FeatureExtractor {
    pub fn new(space: FeatureSpace) -> Self {
        Self { space }
    }

    /// One feature vector per pixel, row-major.
    pub fn extract(&self, image: &RgbImage) -> FeatureMatrix {
        let whole = Region::new(0, 0, image.width(), image.height());
        self.extract_regions(image, std::slice::from_ref(&whole))
    }

    /// Features of the pixels inside `regions` only. Texture windows are clamped to
    /// each region so neighbouring content never leaks in.
    pub fn extract_regions(&self, image: &RgbImage, regions: &[Region]) -> FeatureMatrix {
        let rows: usize = regions.iter().map(|r| r.area() as usize).sum();
        let mut out = FeatureMatrix::with_capacity(self.space.dims(), rows);
        let mut row = [0f32; 5];
        for region in regions {
            for dy in 0..region.height {
                for dx in 0..region.width {
                    self.fill_row(image, region, dx, dy, &mut row);
                    out.push(&row[..self.space.dims()]);
                }
            }
        }
        out
    }

    /// At most `max_rows` pixels of `regions`, drawn uniformly with a fixed seed before any
    /// feature is computed. Same rows as `extract_regions(..).subsample(max_rows, seed)`.
    pub fn sample_regions(&self, image: &RgbImage, regions: &[Region], max_rows: usize, seed: u64) -> FeatureMatrix {
        let total: usize = regions.iter().map(|r| r.area() as usize).sum();
        if total <= max_rows {
            return self.extract_regions(image, regions);
        }
        let mut rng = StdRng::seed_from_u64(seed);
        let mut indices = rand::seq::index::sample(&mut rng, total, max_rows).into_vec();
        indices.sort_unstable();

        let mut out = FeatureMatrix::with_capacity(self.space.dims(), max_rows);
        let mut row = [0f32; 5];
        let mut regions_iter = regions.iter().filter(|r| r.area() > 0);
        let mut current = regions_iter.next();
        let mut offset = 0usize;
        for index in indices {
            while let Some(region) = current {
                let area = region.area() as usize;
                if index < offset + area {
                    break;
                }
                offset += area;
                current = regions_iter.next();
            }
            let Some(region) = current else { break };
            let local = (index - offset) as u32;
            self.fill_row(image, region, local % region.width, local / region.width, &mut row);
            out.push(&row[..self.space.dims()]);
        }
        out
    }

    fn fill_row(&self, image: &RgbImage, region: &Region, dx: u32, dy: u32, row: &mut [f32; 5]) {
        let pixel = image.get_pixel(region.x + dx, region.y + dy);
        row[0] = pixel[0] as f32 / 255.0;
        row[1] = pixel[1] as f32 / 255.0;
        row[2] = pixel[2] as f32 / 255.0;
        if self.space == FeatureSpace::RgbTexture {
            let (mean, std) = window_stats(image, region, dx, dy);
            row[3] = mean;
            row[4] = std;
        }
    }
}

fn luma(p: &image::Rgb<u8>) -> f32 {
    (0.299 * p[0] as f32 + 0.587 * p[1] as f32 + 0.114 * p[2] as f32) / 255.0
}

/// Mean and standard deviation of luminance in the 3x3 window around `(x, y)`, clamped to `region`.
fn window_stats(image: &RgbImage, region: &Region, x: u32, y: u32) -> (f32, f32) {
    let (mut sum, mut sum_sq, mut n) = (0f32, 0f32, 0f32);
    for wy in y.saturating_sub(1)..(y + 2).min(region.height) {
        for wx in x.saturating_sub(1)..(x + 2).min(region.width) {
            let v = luma(image.get_pixel(region.x + wx, region.y + wy));
            sum += v;
            sum_sq += v * v;
            n += 1.0;
        }
    }
    let mean = sum / n;
    (mean, (sum_sq / n - mean * mean).max(0.0).sqrt())
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::Rgb;

    #[test]
    fn rgb_features_are_normalized_per_pixel() {
        let mut img = RgbImage::from_pixel(2, 2, Rgb([255, 0, 51]));
        img.put_pixel(1, 1, Rgb([0, 255, 0]));
        let features = FeatureExtractor::default().extract(&img);
        assert_eq!(features.dims(), 3);
        assert_eq!(features.len(), 4);
        assert_eq!(features.row(0), &[1.0, 0.0, 0.2]);
        assert_eq!(features.row(3), &[0.0, 1.0, 0.0]);
    }

    #[test]
    fn texture_of_flat_region_has_zero_spread() {
        let img = RgbImage::from_pixel(4, 4, Rgb([100, 100, 100]));
        let features = FeatureExtractor::new(FeatureSpace::RgbTexture).extract(&img);
        assert_eq!(features.dims(), 5);
        for row in features.rows() {
            assert!((row[3] - 100.0 / 255.0).abs() < 1e-5);
            assert!(row[4].abs() < 1e-3);
        }
    }

    #[test]
    fn region_extraction_skips_pixels_outside() {
        let mut img = RgbImage::from_pixel(4, 2, Rgb([255, 255, 255]));
        img.put_pixel(0, 0, Rgb([0, 0, 0]));
        let features = FeatureExtractor::default().extract_regions(&img, &[Region::new(0, 0, 1, 1)]);
        assert_eq!(features.len(), 1);
        assert_eq!(features.row(0), &[0.0, 0.0, 0.0]);
    }

    #[test]
    fn subsample_is_seeded_and_bounded() {
        let data: Vec<f32> = (0..300).map(|v| v as f32).collect();
        let features = FeatureMatrix::from_flat(3, data);
        let a = features.subsample(10, 7);
        let b = features.subsample(10, 7);
        assert_eq!(a.len(), 10);
        assert_eq!(a, b);
        assert_eq!(features.subsample(1000, 7), features);
    }

    #[test]
    fn sampling_before_extraction_matches_subsampling_after() {
        let img = RgbImage::from_fn(40, 30, |x, y| Rgb([(x * 6) as u8, (y * 8) as u8, ((x + y) * 3) as u8]));
        let regions = [Region::new(0, 0, 20, 15), Region::new(20, 15, 20, 15), Region::new(0, 15, 0, 4)];
        for space in [FeatureSpace::Rgb, FeatureSpace::RgbTexture] {
            let extractor = FeatureExtractor::new(space);
            let sampled = extractor.sample_regions(&img, &regions, 50, 11);
            assert_eq!(sampled.len(), 50);
            assert_eq!(sampled, extractor.extract_regions(&img, &regions).subsample(50, 11));
        }
        let everything = FeatureExtractor::default().sample_regions(&img, &regions, 10_000, 11);
        assert_eq!(everything.len(), 600);
    }
}
