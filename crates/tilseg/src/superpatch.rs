//! Diverse cross-slide patch sampling and compositing into one training raster.

use std::{collections::BTreeSet, path::Path};

use image::{Rgb, RgbImage};
use rand::{Rng, SeedableRng, rngs::StdRng, seq::SliceRandom};
use serde::Serialize;

use crate::{
    algorithms::tissue::validated_rgb,
    error::{Result, TilsegError},
    features::{FeatureExtractor, FeatureMatrix, FeatureSpace},
    io::raster,
    tiler::{AcceptedPatch, TilingReport},
    traits::PatchSource,
    types::{Patch, PatchId, Region},
};

const FILLER: Rgb<u8> = Rgb([255, 255, 255]);

/// Where one constituent sits inside the composite
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct Placement {
    /// Index into [`Superpatch::constituents`]
    pub constituent: usize,
    pub region: Region,
}

#[derive(Debug, Clone)]
pub struct Superpatch {
    pub constituents: Vec<PatchId>,
    pub placements: Vec<Placement>,
    pub raster: RgbImage,
}

impl Superpatch {
    /// Treat a whole image (e.g. a previously saved composite) as the training raster.
    pub fn from_image(raster: RgbImage) -> Self {
        let region = Region::new(0, 0, raster.width(), raster.height());
        Self {
            constituents: Vec::new(),
            placements: vec![Placement { constituent: 0, region }],
            raster,
        }
    }

    /// Placed images; a superpatch loaded with `from_image` counts as one.
    pub fn len(&self) -> usize {
        self.placements.len()
    }

    pub fn is_empty(&self) -> bool {
        self.placements.is_empty()
    }

    /// Regions holding patch pixels; the white filler between them is excluded.
    pub fn training_regions(&self) -> Vec<Region> {
        self.placements.iter().map(|p| p.region).collect()
    }

    pub fn slides(&self) -> BTreeSet<&str> {
        self.constituents.iter().map(|id| id.slide.as_str()).collect()
    }

    /// Training features over the placed pixels, subsampled to `max_samples` rows.
    pub fn features(&self, space: FeatureSpace, max_samples: usize, seed: u64) -> FeatureMatrix {
        FeatureExtractor::new(space).sample_regions(&self.raster, &self.training_regions(), max_samples, seed)
    }

    pub fn save(&self, path: &Path) -> Result<()> {
        raster::save_rgb(&self.raster, path)
    }
}

/// Seeded selection of diverse tissue patches across slides
#[derive(Debug, Clone, Copy)]
pub struct SuperpatchSampler {
    seed: u64,
}

impl SuperpatchSampler {
    pub fn new(seed: u64) -> Self {
        Self { seed }
    }

    /// Choose `target` accepted patches, or all of them when fewer exist.
    ///
    /// Slides are visited round-robin in seeded order so every slide contributes once before
    /// any contributes twice. Each slide's first pick is random; later picks maximize the
    /// colour distance to everything already chosen.
    pub fn select<'a>(&self, slides: &'a [TilingReport], target: usize) -> Result<Vec<&'a AcceptedPatch>> {
        if target == 0 {
            return Err(TilsegError::InvalidConfig("superpatch needs at least one patch".into()));
        }
        let total: usize = slides.iter().map(|s| s.accepted.len()).sum();
        if total == 0 {
            return Err(TilsegError::InsufficientTissue { slides: slides.len() });
        }
        if target >= total {
            if target > total {
                tracing::info!(requested = target, available = total, "using every accepted patch");
            }
            return Ok(slides.iter().flat_map(|s| s.accepted.iter()).collect());
        }

        let mut rng = StdRng::seed_from_u64(self.seed);
        let mut order: Vec<usize> = (0..slides.len()).filter(|&s| !slides[s].accepted.is_empty()).collect();
        order.shuffle(&mut rng);

        let mut used: Vec<Vec<bool>> = slides.iter().map(|s| vec![false; s.accepted.len()]).collect();
        let mut nearest: Vec<Vec<f32>> = slides
            .iter()
            .map(|s| vec![f32::INFINITY; s.accepted.len()])
            .collect();
        let mut picks_per_slide = vec![0usize; slides.len()];
        let mut chosen: Vec<&AcceptedPatch> = Vec::with_capacity(target);

        while chosen.len() < target {
            for &s in &order {
                if chosen.len() == target {
                    break;
                }
                let candidates = &slides[s].accepted;
                if used[s].iter().all(|&u| u) {
                    continue;
                }

                let pick = if picks_per_slide[s] == 0 {
                    rng.random_range(0..candidates.len())
                } else {
                    farthest_unused(&nearest[s], &used[s])
                };

                used[s][pick] = true;
                picks_per_slide[s] += 1;
                let descriptor = candidates[pick].descriptor;
                chosen.push(&candidates[pick]);

                for (slide, distances) in slides.iter().zip(nearest.iter_mut()) {
                    for (patch, d) in slide.accepted.iter().zip(distances.iter_mut()) {
                        *d = d.min(patch.descriptor.distance(&descriptor));
                    }
                }
            }
        }
        Ok(chosen)
    }

    /// Lay patches out on a `ceil(sqrt(n))`-column grid of cells sized to the largest patch.
    pub fn composite(&self, patches: &[Patch]) -> Result<Superpatch> {
        if patches.is_empty() {
            return Err(TilsegError::InsufficientTissue { slides: 0 });
        }
        let n = patches.len() as u32;
        let columns = (n as f64).sqrt().ceil() as u32;
        let rows = n.div_ceil(columns);
        let cell_width = patches.iter().map(Patch::width).max().unwrap_or(0);
        let cell_height = patches.iter().map(Patch::height).max().unwrap_or(0);

        let mut raster = RgbImage::from_pixel(columns * cell_width, rows * cell_height, FILLER);
        let mut placements = Vec::with_capacity(patches.len());
        for (i, patch) in patches.iter().enumerate() {
            let rgb = validated_rgb(&patch.pixels)?;
            let x = (i as u32 % columns) * cell_width;
            let y = (i as u32 / columns) * cell_height;
            image::imageops::replace(&mut raster, &rgb, x as i64, y as i64);
            placements.push(Placement {
                constituent: i,
                region: Region::new(x, y, rgb.width(), rgb.height()),
            });
        }

        Ok(Superpatch {
            constituents: patches.iter().map(|p| p.id.clone()).collect(),
            placements,
            raster,
        })
    }

    pub fn sample(&self, slides: &[TilingReport], target: usize, source: &dyn PatchSource) -> Result<Superpatch> {
        let selected = self.select(slides, target)?;
        let patches = selected
            .iter()
            .map(|accepted| Ok(Patch::new(accepted.id.clone(), source.load_patch(&accepted.id)?)))
            .collect::<Result<Vec<_>>>()?;

        let superpatch = self.composite(&patches)?;
        tracing::info!(
            patches = superpatch.len(),
            slides = superpatch.slides().len(),
            width = superpatch.raster.width(),
            height = superpatch.raster.height(),
            "built training superpatch"
        );
        Ok(superpatch)
    }
}

/// Unused candidate with the largest distance to the chosen set; ties go to the lowest index.
fn farthest_unused(nearest: &[f32], used: &[bool]) -> usize {
    let mut best: Option<(usize, f32)> = None;
    for (i, (&d, &u)) in nearest.iter().zip(used).enumerate() {
        if u {
            continue;
        }
        if best.is_none_or(|(_, b)| d > b) {
            best = Some((i, d));
        }
    }
    best.map(|(i, _)| i).unwrap_or(0)
}
