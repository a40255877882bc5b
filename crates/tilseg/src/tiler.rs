//! Lazy tiling of slides into bounded patches, filtered for tissue.

use std::path::PathBuf;

use rayon::prelude::*;
use serde::Serialize;

use crate::{
    algorithms::tissue::{ColorDescriptor, TissueFilter, TissueThresholds},
    cancel::CancellationToken,
    config::TilingConfig,
    error::{Result, TilsegError},
    io::PatchStore,
    slide::SlideHandle,
    traits::SlideReader,
    types::{Patch, PatchId, Region, TissueVerdict},
};

/// Row-major grid of cells no larger than the maximum tile size.
///
/// Cells step by the maximum size; the last column and row absorb the remainder, so the
/// cells cover the slide exactly and never overlap.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TileGrid {
    width: u32,
    height: u32,
    tile_width: u32,
    tile_height: u32,
}

impl TileGrid {
    pub fn new(width: u32, height: u32, max_tile_x: u32, max_tile_y: u32) -> Result<Self> {
        if max_tile_x == 0 || max_tile_y == 0 {
            return Err(TilsegError::InvalidConfig(format!(
                "tile size must be positive, got {max_tile_x}x{max_tile_y}"
            )));
        }
        Ok(Self {
            width,
            height,
            tile_width: max_tile_x,
            tile_height: max_tile_y,
        })
    }

    pub fn columns(&self) -> u32 {
        self.width.div_ceil(self.tile_width)
    }

    pub fn rows(&self) -> u32 {
        self.height.div_ceil(self.tile_height)
    }

    pub fn len(&self) -> usize {
        self.columns() as usize * self.rows() as usize
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn cell(&self, index: usize) -> Region {
        let columns = self.columns().max(1) as usize;
        let x = (index % columns) as u32 * self.tile_width;
        let y = (index / columns) as u32 * self.tile_height;
        Region::new(
            x,
            y,
            self.tile_width.min(self.width - x),
            self.tile_height.min(self.height - y),
        )
    }

    pub fn cells(&self) -> impl Iterator<Item = Region> + '_ {
        (0..self.len()).map(|i| self.cell(i))
    }
}

/// A tissue patch kept after tiling. Pixels live on disk or are re-read from the slide.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct AcceptedPatch {
    pub id: PatchId,
    pub descriptor: ColorDescriptor,
    pub tissue_fraction: f64,
    /// Where the patch was saved, if it was
    pub path: Option<PathBuf>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TilingReport {
    pub slide: String,
    pub dimensions: (u32, u32),
    pub cells: usize,
    pub accepted: Vec<AcceptedPatch>,
    pub rejected: usize,
    pub pixels_total: u64,
    /// Pixels of every rejected patch
    pub pixels_rejected: u64,
}

impl TilingReport {
    /// Fraction of the slide discarded as background or artifact, in [0, 1]
    pub fn pixel_loss(&self) -> f64 {
        if self.pixels_total == 0 {
            0.0
        } else {
            self.pixels_rejected as f64 / self.pixels_total as f64
        }
    }

    pub fn pixel_loss_percent(&self) -> f64 {
        self.pixel_loss() * 100.0
    }
}

/// Grids slides and applies the tissue filter to each cell
#[derive(Debug, Clone)]
pub struct Tiler {
    config: TilingConfig,
    filter: TissueFilter,
}

impl Tiler {
    pub fn new(config: TilingConfig, thresholds: TissueThresholds) -> Self {
        Self {
            config,
            filter: TissueFilter::new(thresholds),
        }
    }

    pub fn config(&self) -> &TilingConfig {
        &self.config
    }

    pub fn filter(&self) -> &TissueFilter {
        &self.filter
    }

    pub fn grid(&self, handle: &SlideHandle) -> Result<TileGrid> {
        let (width, height) = handle.dimensions_at(self.config.level).ok_or_else(|| {
            TilsegError::slide_read(handle.id(), format!("level {} not available", self.config.level))
        })?;
        TileGrid::new(width, height, self.config.max_tile_x, self.config.max_tile_y)
    }

    /// Every patch of the slide with its verdict, reading one region per step.
    pub fn tile<'a>(&'a self, reader: &'a dyn SlideReader, handle: &'a SlideHandle) -> Result<Tiles<'a>> {
        Ok(Tiles {
            tiler: self,
            reader,
            handle,
            grid: self.grid(handle)?,
            next: 0,
            failed: false,
        })
    }

    fn read_cell(&self, reader: &dyn SlideReader, handle: &SlideHandle, region: Region) -> Result<(Patch, ColorDescriptor, TissueVerdict)> {
        let pixels = reader.read_region(handle, region, self.config.level)?;
        let analysis = self.filter.analyze_rgb(&pixels);
        let patch = Patch::from_rgb(PatchId::new(handle.id(), region), pixels);
        Ok((patch, analysis.descriptor, analysis.verdict))
    }

    /// Tile, filter and optionally persist one slide, cells in parallel.
    pub fn process_slide(
        &self,
        reader: &dyn SlideReader,
        handle: &SlideHandle,
        store: Option<&PatchStore>,
        cancel: &CancellationToken,
    ) -> Result<TilingReport> {
        let grid = self.grid(handle)?;
        let cells: Vec<Region> = grid.cells().collect();
        tracing::info!(slide = handle.id(), cells = cells.len(), "tiling slide");

        let outcomes: Vec<(Option<AcceptedPatch>, u64)> = cells
            .par_iter()
            .map(|&region| -> Result<(Option<AcceptedPatch>, u64)> {
                cancel.check()?;
                let (patch, descriptor, verdict) = self.read_cell(reader, handle, region)?;
                if !verdict.accepted {
                    return Ok((None, verdict.total_pixels));
                }
                let path = match store {
                    Some(store) if self.config.save_images => Some(store.save(&patch)?),
                    _ => None,
                };
                Ok((
                    Some(AcceptedPatch {
                        id: patch.id,
                        descriptor,
                        tissue_fraction: verdict.tissue_fraction(),
                        path,
                    }),
                    0,
                ))
            })
            .collect::<Result<Vec<_>>>()?;

        let mut report = TilingReport {
            slide: handle.id().to_string(),
            dimensions: (grid.width, grid.height),
            cells: cells.len(),
            accepted: Vec::new(),
            rejected: 0,
            pixels_total: cells.iter().map(Region::area).sum(),
            pixels_rejected: 0,
        };
        for (accepted, rejected_pixels) in outcomes {
            match accepted {
                Some(patch) => report.accepted.push(patch),
                None => {
                    report.rejected += 1;
                    report.pixels_rejected += rejected_pixels;
                }
            }
        }

        tracing::info!(
            slide = %report.slide,
            accepted = report.accepted.len(),
            rejected = report.rejected,
            pixel_loss_percent = report.pixel_loss_percent(),
            "tiled slide"
        );
        if report.pixel_loss() > self.config.pixel_loss_warning {
            tracing::warn!(
                slide = %report.slide,
                pixel_loss_percent = report.pixel_loss_percent(),
                "large share of the slide rejected as background"
            );
        }
        Ok(report)
    }
}

/// Lazy sequence of `(patch, verdict)`; fused after the first read failure.
pub struct Tiles<'a> {
    tiler: &'a Tiler,
    reader: &'a dyn SlideReader,
    handle: &'a SlideHandle,
    grid: TileGrid,
    next: usize,
    failed: bool,
}

impl Iterator for Tiles<'_> {
    type Item = Result<(Patch, TissueVerdict)>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.failed || self.next >= self.grid.len() {
            return None;
        }
        let region = self.grid.cell(self.next);
        self.next += 1;
        match self.tiler.read_cell(self.reader, self.handle, region) {
            Ok((patch, _, verdict)) => Some(Ok((patch, verdict))),
            Err(e) => {
                self.failed = true;
                Some(Err(e))
            }
        }
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        if self.failed {
            return (0, Some(0));
        }
        (0, Some(self.grid.len() - self.next))
    }
}
