use geo::Simplify;
use geo_types::{Coord, LineString};

use crate::{traits::ShapeSimplifier, types::RegionShape};

/// Douglas-Peucker simplifier using geo crate's implementation
#[derive(Debug, Clone, Copy, Default)]
pub struct DouglasPeuckerSimplifier;

impl DouglasPeuckerSimplifier {
    fn simplify_ring(ring: &[[f32; 2]], tolerance: f32) -> Vec<[f32; 2]> {
        let line = LineString::new(ring.iter().map(|&[x, y]| Coord { x, y }).collect());
        let simplified: Vec<[f32; 2]> = line.simplify(&tolerance).coords().map(|c| [c.x, c.y]).collect();
        // a ring needs three vertices; keep the original outline of tiny regions
        if simplified.len() < 3 { ring.to_vec() } else { simplified }
    }
}

impl ShapeSimplifier for DouglasPeuckerSimplifier {
    fn simplify(&self, shapes: &mut [RegionShape], tolerance: f32) {
        if tolerance <= 0.0 {
            return;
        }
        for shape in shapes {
            shape.exterior = Self::simplify_ring(&shape.exterior, tolerance);
            for hole in &mut shape.holes {
                *hole = Self::simplify_ring(hole, tolerance);
            }
        }
    }
}
