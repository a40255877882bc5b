use image::{DynamicImage, Rgb, RgbImage};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use crate::{
    error::{Result, TilsegError},
    types::TissueVerdict,
};

/// Colour thresholds separating H&E-stained tissue from slide glass and artifacts.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(default)]
pub struct TissueThresholds {
    /// Minimum HSV saturation (0-1) of a tissue pixel. Unstained glass is nearly grey.
    #[schemars(range(min = 0.0, max = 1.0))]
    pub min_saturation: f32,
    /// Minimum luminance (0-255); darker pixels are treated as pen marks, dust or folds.
    pub min_luminance: f32,
    /// Maximum luminance (0-255); brighter pixels are treated as white background.
    pub max_luminance: f32,
    /// Fraction of tissue pixels a patch needs to be accepted.
    #[schemars(range(min = 0.0, max = 1.0))]
    pub min_tissue_fraction: f64,
}

impl Default for TissueThresholds {
    fn default() -> Self {
        Self {
            min_saturation: 0.07,
            min_luminance: 20.0,
            max_luminance: 235.0,
            min_tissue_fraction: 0.5,
        }
    }
}

/// Mean and spread of the tissue colour in a patch, normalized to [0, 1].
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct ColorDescriptor {
    pub mean: [f32; 3],
    pub std: [f32; 3],
}

impl ColorDescriptor {
    pub fn distance(&self, other: &ColorDescriptor) -> f32 {
        let mut sum = 0.0;
        for c in 0..3 {
            sum += (self.mean[c] - other.mean[c]).powi(2);
            sum += (self.std[c] - other.std[c]).powi(2);
        }
        sum.sqrt()
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct TissueAnalysis {
    pub verdict: TissueVerdict,
    pub descriptor: ColorDescriptor,
}

/// Stateless tissue classifier
#[derive(Debug, Clone, Default)]
pub struct TissueFilter {
    pub thresholds: TissueThresholds,
}

impl TissueFilter {
    pub fn new(thresholds: TissueThresholds) -> Self {
        Self { thresholds }
    }

    pub fn is_tissue_pixel(&self, pixel: &Rgb<u8>) -> bool {
        let [r, g, b] = pixel.0.map(|v| v as f32);
        let max = r.max(g).max(b);
        let min = r.min(g).min(b);
        let saturation = if max == 0.0 { 0.0 } else { (max - min) / max };
        let luminance = 0.299 * r + 0.587 * g + 0.114 * b;
        saturation >= self.thresholds.min_saturation
            && luminance >= self.thresholds.min_luminance
            && luminance <= self.thresholds.max_luminance
    }

    pub fn classify(&self, patch: &DynamicImage) -> Result<TissueVerdict> {
        Ok(self.analyze(patch)?.verdict)
    }

    /// Classify the patch and describe the colour of its tissue pixels in one pass.
    pub fn analyze(&self, patch: &DynamicImage) -> Result<TissueAnalysis> {
        let rgb = validated_rgb(patch)?;
        Ok(self.analyze_rgb(&rgb))
    }

    pub fn analyze_rgb(&self, rgb: &RgbImage) -> TissueAnalysis {
        let total_pixels = rgb.width() as u64 * rgb.height() as u64;
        let mut tissue_pixels = 0u64;
        let mut sum = [0f64; 3];
        let mut sum_sq = [0f64; 3];

        for pixel in rgb.pixels() {
            if !self.is_tissue_pixel(pixel) {
                continue;
            }
            tissue_pixels += 1;
            for c in 0..3 {
                let v = pixel[c] as f64 / 255.0;
                sum[c] += v;
                sum_sq[c] += v * v;
            }
        }

        let mut descriptor = ColorDescriptor::default();
        if tissue_pixels > 0 {
            let n = tissue_pixels as f64;
            for c in 0..3 {
                let mean = sum[c] / n;
                descriptor.mean[c] = mean as f32;
                descriptor.std[c] = (sum_sq[c] / n - mean * mean).max(0.0).sqrt() as f32;
            }
        }

        let verdict = TissueVerdict {
            accepted: false,
            tissue_pixels,
            total_pixels,
        };
        let accepted = verdict.tissue_fraction() >= self.thresholds.min_tissue_fraction && tissue_pixels > 0;

        TissueAnalysis {
            verdict: TissueVerdict { accepted, ..verdict },
            descriptor,
        }
    }
}

/// RGB view of a patch, rejecting empty or colourless buffers.
pub fn validated_rgb(patch: &DynamicImage) -> Result<RgbImage> {
    if patch.width() == 0 || patch.height() == 0 {
        return Err(TilsegError::InvalidPatch(format!(
            "empty buffer ({}x{})",
            patch.width(),
            patch.height()
        )));
    }
    let channels = patch.color().channel_count();
    if channels < 3 {
        return Err(TilsegError::InvalidPatch(format!(
            "expected an RGB raster, got {channels} channel(s)"
        )));
    }
    Ok(patch.to_rgb8())
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::GrayImage;

    const HEMATOXYLIN: Rgb<u8> = Rgb([90, 60, 140]);
    const GLASS: Rgb<u8> = Rgb([245, 245, 245]);

    fn half_tissue(width: u32, height: u32, tissue_columns: u32) -> DynamicImage {
        let mut img = RgbImage::from_pixel(width, height, GLASS);
        for y in 0..height {
            for x in 0..tissue_columns {
                img.put_pixel(x, y, HEMATOXYLIN);
            }
        }
        DynamicImage::ImageRgb8(img)
    }

    #[test]
    fn stained_pixels_are_tissue_and_glass_is_not() {
        let filter = TissueFilter::default();
        assert!(filter.is_tissue_pixel(&HEMATOXYLIN));
        assert!(filter.is_tissue_pixel(&Rgb([220, 130, 180])));
        assert!(!filter.is_tissue_pixel(&GLASS));
        assert!(!filter.is_tissue_pixel(&Rgb([5, 0, 10])));
    }

    #[test]
    fn verdict_follows_tissue_fraction() {
        let filter = TissueFilter::default();
        let mostly = filter.classify(&half_tissue(20, 10, 15)).unwrap();
        assert!(mostly.accepted);
        assert!((mostly.tissue_fraction() - 0.75).abs() < 1e-9);

        let sparse = filter.classify(&half_tissue(20, 10, 4)).unwrap();
        assert!(!sparse.accepted);
        assert!((sparse.background_fraction() - 0.8).abs() < 1e-9);
    }

    #[test]
    fn classification_is_deterministic() {
        let filter = TissueFilter::default();
        let patch = half_tissue(32, 32, 17);
        assert_eq!(filter.analyze(&patch).unwrap(), filter.analyze(&patch).unwrap());
    }

    #[test]
    fn all_background_is_rejected_without_error() {
        let filter = TissueFilter::default();
        let patch = DynamicImage::ImageRgb8(RgbImage::from_pixel(16, 16, GLASS));
        let verdict = filter.classify(&patch).unwrap();
        assert!(!verdict.accepted);
        assert_eq!(verdict.tissue_pixels, 0);
    }

    #[test]
    fn malformed_buffers_are_invalid_patches() {
        let filter = TissueFilter::default();
        let empty = DynamicImage::ImageRgb8(RgbImage::new(0, 0));
        assert!(matches!(filter.classify(&empty), Err(TilsegError::InvalidPatch(_))));

        let gray = DynamicImage::ImageLuma8(GrayImage::new(4, 4));
        assert!(matches!(filter.classify(&gray), Err(TilsegError::InvalidPatch(_))));
    }

    #[test]
    fn descriptor_summarizes_tissue_only() {
        let filter = TissueFilter::default();
        let analysis = filter.analyze(&half_tissue(10, 10, 5)).unwrap();
        let expected = [90.0 / 255.0, 60.0 / 255.0, 140.0 / 255.0];
        for c in 0..3 {
            assert!((analysis.descriptor.mean[c] - expected[c]).abs() < 1e-5);
            assert!(analysis.descriptor.std[c].abs() < 1e-3);
        }
    }
}
