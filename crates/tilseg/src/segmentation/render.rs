use std::path::{Path, PathBuf};

use image::{GrayImage, Rgb, RgbImage};
use imageproc::drawing::draw_line_segment_mut;

use crate::{
    config::SegmentationConfig,
    error::Result,
    io::raster,
    segmentation::Segmentation,
};

/// Cluster colours, indexed by label
pub const PALETTE: [Rgb<u8>; 8] = [
    Rgb([0, 255, 255]),
    Rgb([255, 102, 102]),
    Rgb([153, 255, 51]),
    Rgb([178, 102, 255]),
    Rgb([0, 128, 255]),
    Rgb([95, 95, 95]),
    Rgb([102, 0, 0]),
    Rgb([255, 0, 127]),
];

const OUTLINE: Rgb<u8> = Rgb([0, 255, 0]);
const BLACK: Rgb<u8> = Rgb([0, 0, 0]);

/// Images produced for one segmented patch
#[derive(Debug, Clone)]
pub struct SegmentationArtifacts {
    /// Palette blended over the original
    pub overlay: RgbImage,
    pub til_mask: GrayImage,
    /// TIL outlines drawn on the original
    pub contours: RgbImage,
    /// Original with one cluster blacked out, per cluster
    pub cluster_overlays: Vec<RgbImage>,
    pub cluster_masks: Vec<GrayImage>,
    pub all_clusters: Option<RgbImage>,
}

impl SegmentationArtifacts {
    pub fn render(original: &RgbImage, segmentation: &Segmentation, config: &SegmentationConfig) -> Self {
        let labels = &segmentation.labels;
        let colour = |x: u32, y: u32| PALETTE[labels.get(x, y) as usize % PALETTE.len()];
        let alpha = config.overlay_alpha.clamp(0.0, 1.0);

        let overlay = RgbImage::from_fn(original.width(), original.height(), |x, y| {
            let base = original.get_pixel(x, y);
            let tint = colour(x, y);
            Rgb(std::array::from_fn(|c| {
                ((1.0 - alpha) * base[c] as f32 + alpha * tint[c] as f32).round() as u8
            }))
        });

        let mut contours = original.clone();
        for region in &segmentation.regions {
            draw_ring(&mut contours, &region.shape.exterior);
            for hole in &region.shape.holes {
                draw_ring(&mut contours, hole);
            }
        }

        let clusters = 0..labels.n_clusters() as u8;
        let cluster_overlays = if config.save_cluster_overlays {
            clusters
                .clone()
                .map(|k| {
                    RgbImage::from_fn(original.width(), original.height(), |x, y| {
                        if labels.get(x, y) == k { BLACK } else { *original.get_pixel(x, y) }
                    })
                })
                .collect()
        } else {
            Vec::new()
        };
        let cluster_masks = if config.save_cluster_masks {
            clusters.map(|k| labels.mask(k)).collect()
        } else {
            Vec::new()
        };
        let all_clusters = config
            .save_all_clusters
            .then(|| RgbImage::from_fn(original.width(), original.height(), colour));

        Self {
            overlay,
            til_mask: segmentation.til_mask.clone(),
            contours,
            cluster_overlays,
            cluster_masks,
            all_clusters,
        }
    }

    /// Write every artifact under `dir`, returning the written paths.
    pub fn save(&self, dir: &Path) -> Result<Vec<PathBuf>> {
        let mut written = Vec::new();
        let mut rgb = |image: &RgbImage, path: PathBuf| -> Result<()> {
            raster::save_rgb(image, &path)?;
            written.push(path);
            Ok(())
        };
        rgb(&self.overlay, dir.join("overlay.png"))?;
        rgb(&self.contours, dir.join("contours.png"))?;
        for (k, image) in self.cluster_overlays.iter().enumerate() {
            rgb(image, dir.join("clusters").join(format!("overlay_{k}.png")))?;
        }
        if let Some(image) = &self.all_clusters {
            rgb(image, dir.join("clusters").join("all.png"))?;
        }

        let mask_path = dir.join("til_mask.png");
        raster::save_gray(&self.til_mask, &mask_path)?;
        written.push(mask_path);
        for (k, mask) in self.cluster_masks.iter().enumerate() {
            let path = dir.join("clusters").join(format!("mask_{k}.png"));
            raster::save_gray(mask, &path)?;
            written.push(path);
        }
        Ok(written)
    }
}

fn draw_ring(canvas: &mut RgbImage, ring: &[[f32; 2]]) {
    match ring {
        [] => {}
        [point] => {
            let (x, y) = (point[0] as u32, point[1] as u32);
            if x < canvas.width() && y < canvas.height() {
                canvas.put_pixel(x, y, OUTLINE);
            }
        }
        _ => {
            for (a, b) in ring.iter().zip(ring.iter().cycle().skip(1)) {
                draw_line_segment_mut(canvas, (a[0], a[1]), (b[0], b[1]), OUTLINE);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        quantification::QuantificationRecord,
        segmentation::ClusterLabelMap,
        types::{PatchId, Region, RegionShape, TilRegion},
    };

    fn segmentation() -> Segmentation {
        let patch = PatchId::new("s", Region::new(0, 0, 4, 2));
        let labels = ClusterLabelMap::new(4, 2, vec![0, 0, 1, 1, 0, 0, 1, 1], 2).unwrap();
        Segmentation {
            patch: patch.clone(),
            labels,
            til_cluster: Some(1),
            regions: vec![TilRegion {
                patch: patch.clone(),
                label: 1,
                shape: RegionShape {
                    exterior: vec![[2.0, 0.0], [3.0, 0.0], [3.0, 1.0], [2.0, 1.0]],
                    holes: vec![],
                },
                pixel_area: 4,
                perimeter: 4.0,
                roundness: 0.3,
                centroid: [2.5, 0.5],
                enclosing_circle_area: 1.6,
            }],
            candidates_per_cluster: vec![0, 1],
            til_mask: GrayImage::from_fn(4, 2, |x, _| image::Luma([if x >= 2 { 255 } else { 0 }])),
            record: QuantificationRecord {
                patch,
                n_clusters: 2,
                cluster_pixels: vec![4, 4],
                tissue_pixels: 8,
                background_pixels: 0,
                til_cluster: Some(1),
                til_region_count: 1,
                til_pixels: 4,
                til_area_fraction: 0.5,
            },
        }
    }

    #[test]
    fn overlay_blends_palette_over_original() {
        let original = RgbImage::from_pixel(4, 2, Rgb([100, 100, 100]));
        let artifacts =
            SegmentationArtifacts::render(&original, &segmentation(), &SegmentationConfig::default());
        // 0.6 * 100 + 0.4 * palette
        assert_eq!(artifacts.overlay.get_pixel(0, 0), &Rgb([60, 162, 162]));
        assert_eq!(artifacts.overlay.get_pixel(3, 1), &Rgb([162, 101, 101]));
        assert_eq!(artifacts.contours.get_pixel(2, 0), &OUTLINE);
        assert_eq!(artifacts.contours.get_pixel(0, 0), &Rgb([100, 100, 100]));
        assert!(artifacts.cluster_overlays.is_empty());
    }

    #[test]
    fn optional_cluster_series_are_saved() {
        let dir = tempfile::tempdir().unwrap();
        let config = SegmentationConfig {
            save_cluster_overlays: true,
            save_cluster_masks: true,
            save_all_clusters: true,
            ..SegmentationConfig::default()
        };
        let original = RgbImage::from_pixel(4, 2, Rgb([100, 100, 100]));
        let artifacts = SegmentationArtifacts::render(&original, &segmentation(), &config);
        assert_eq!(artifacts.cluster_overlays[1].get_pixel(2, 0), &BLACK);
        assert_eq!(artifacts.cluster_overlays[1].get_pixel(0, 0), &Rgb([100, 100, 100]));

        let written = artifacts.save(dir.path()).unwrap();
        assert_eq!(written.len(), 3 + 2 + 2 + 1);
        for name in ["overlay.png", "til_mask.png", "contours.png", "clusters/mask_1.png", "clusters/all.png"] {
            assert!(dir.path().join(name).exists(), "{name}");
        }
    }
}
