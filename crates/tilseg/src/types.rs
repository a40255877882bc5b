use std::fmt;

use geo_types::{Coord, LineString, Polygon};
use image::{DynamicImage, RgbImage};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

/// Rectangular pixel region in slide coordinates
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, JsonSchema)]
pub struct Region {
    pub x: u32,
    pub y: u32,
    pub width: u32,
    pub height: u32,
}

impl Region {
    pub fn new(x: u32, y: u32, width: u32, height: u32) -> Self {
        Self { x, y, width, height }
    }

    pub fn area(&self) -> u64 {
        self.width as u64 * self.height as u64
    }

    pub fn right(&self) -> u32 {
        self.x + self.width
    }

    pub fn bottom(&self) -> u32 {
        self.y + self.height
    }

    pub fn overlaps(&self, other: &Region) -> bool {
        self.x < other.right() && other.x < self.right() && self.y < other.bottom() && other.y < self.bottom()
    }
}

/// Identifies a patch by its source slide and origin
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize, JsonSchema)]
pub struct PatchId {
    pub slide: String,
    pub x: u32,
    pub y: u32,
    pub width: u32,
    pub height: u32,
}

impl PatchId {
    pub fn new(slide: impl Into<String>, region: Region) -> Self {
        Self {
            slide: slide.into(),
            x: region.x,
            y: region.y,
            width: region.width,
            height: region.height,
        }
    }

    pub fn region(&self) -> Region {
        Region::new(self.x, self.y, self.width, self.height)
    }

    /// Origin-derived name, unique within a slide
    pub fn file_stem(&self) -> String {
        format!("{}_{}", self.x, self.y)
    }

    /// Parse an origin-derived stem (`<x>_<y>`) back into a patch id.
    pub fn from_file_stem(slide: impl Into<String>, stem: &str, width: u32, height: u32) -> Option<Self> {
        let (x, y) = stem.split_once('_')?;
        Some(Self {
            slide: slide.into(),
            x: x.parse().ok()?,
            y: y.parse().ok()?,
            width,
            height,
        })
    }
}

impl fmt::Display for PatchId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.slide, self.file_stem())
    }
}

/// A raster region extracted from a slide
#[derive(Debug, Clone)]
pub struct Patch {
    pub id: PatchId,
    pub pixels: DynamicImage,
}

impl Patch {
    pub fn new(id: PatchId, pixels: DynamicImage) -> Self {
        Self { id, pixels }
    }

    pub fn from_rgb(id: PatchId, pixels: RgbImage) -> Self {
        Self::new(id, DynamicImage::ImageRgb8(pixels))
    }

    pub fn width(&self) -> u32 {
        self.pixels.width()
    }

    pub fn height(&self) -> u32 {
        self.pixels.height()
    }

    pub fn pixel_count(&self) -> u64 {
        self.width() as u64 * self.height() as u64
    }
}

/// Outcome of the tissue filter for one patch
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct TissueVerdict {
    pub accepted: bool,
    pub tissue_pixels: u64,
    pub total_pixels: u64,
}

impl TissueVerdict {
    pub fn tissue_fraction(&self) -> f64 {
        if self.total_pixels == 0 {
            0.0
        } else {
            self.tissue_pixels as f64 / self.total_pixels as f64
        }
    }

    /// Fraction of pixels classified as background or artifact
    pub fn background_fraction(&self) -> f64 {
        1.0 - self.tissue_fraction()
    }
}

/// Outline of a connected region, possibly with holes
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RegionShape {
    /// The exterior boundary of the shape (outer contour)
    pub exterior: Vec<[f32; 2]>,
    /// Interior boundaries (holes within the shape)
    pub holes: Vec<Vec<[f32; 2]>>,
}

impl RegionShape {
    /// Convert to geo-types Polygon for geometric operations
    pub fn to_geo_polygon(&self) -> Polygon<f32> {
        let ring = |points: &[[f32; 2]]| {
            LineString::new(points.iter().map(|&[x, y]| Coord { x, y }).collect())
        };
        Polygon::new(ring(&self.exterior), self.holes.iter().map(|hole| ring(hole)).collect())
    }

    /// Polygon area (exterior minus holes)
    pub fn area(&self) -> f32 {
        use geo::Area;
        self.to_geo_polygon().unsigned_area()
    }

    pub fn has_holes(&self) -> bool {
        !self.holes.is_empty()
    }

    pub fn bounding_box(&self) -> ([f32; 2], [f32; 2]) {
        let mut min = [f32::INFINITY; 2];
        let mut max = [f32::NEG_INFINITY; 2];
        for &[x, y] in &self.exterior {
            min = [min[0].min(x), min[1].min(y)];
            max = [max[0].max(x), max[1].max(y)];
        }
        (min, max)
    }

    /// Closed length of the exterior ring
    pub fn perimeter(&self) -> f32 {
        closed_ring_length(&self.exterior)
    }

    /// Radius of the circle centred at `center` that encloses every exterior point
    pub fn enclosing_radius(&self, center: [f32; 2]) -> f32 {
        self.exterior
            .iter()
            .map(|&[x, y]| ((x - center[0]).powi(2) + (y - center[1]).powi(2)).sqrt())
            .fold(0.0, f32::max)
    }
}

fn closed_ring_length(points: &[[f32; 2]]) -> f32 {
    if points.len() < 2 {
        return 0.0;
    }
    let segment = |a: [f32; 2], b: [f32; 2]| ((b[0] - a[0]).powi(2) + (b[1] - a[1]).powi(2)).sqrt();
    let open: f32 = points.windows(2).map(|w| segment(w[0], w[1])).sum();
    open + segment(points[points.len() - 1], points[0])
}

/// A connected region classified as TIL-like
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TilRegion {
    pub patch: PatchId,
    /// Cluster label the region was found in
    pub label: u8,
    pub shape: RegionShape,
    /// Number of pixels in the connected component
    pub pixel_area: u64,
    pub perimeter: f64,
    /// perimeter^2 / (4 * pi * area); 1.0 for a perfect disk
    pub roundness: f64,
    pub centroid: [f64; 2],
    pub enclosing_circle_area: f64,
}
