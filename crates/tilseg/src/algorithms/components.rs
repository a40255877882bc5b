//! 8-connected components of a binary mask and their outlines.

use image::{GrayImage, ImageBuffer, Luma};
use imageproc::{
    contours::{BorderType, find_contours},
    region_labelling::{Connectivity, connected_components},
};

use crate::types::RegionShape;

/// One connected foreground region
#[derive(Debug, Clone, PartialEq)]
pub struct Component {
    /// Label in the component image, starting at 1
    pub label: u32,
    pub pixel_area: u64,
    /// Mean pixel position
    pub centroid: [f64; 2],
    pub shape: RegionShape,
}

impl Component {
    pub fn perimeter(&self) -> f64 {
        self.shape.perimeter() as f64
    }

    /// perimeter^2 / (4 * pi * area); about 1 for a disk, larger for elongated or ragged shapes
    pub fn roundness(&self) -> f64 {
        if self.pixel_area == 0 {
            return f64::INFINITY;
        }
        self.perimeter().powi(2) / (4.0 * std::f64::consts::PI * self.pixel_area as f64)
    }

    /// Area of the smallest circle about the centroid that contains the outline
    pub fn enclosing_circle_area(&self) -> f64 {
        let r = self
            .shape
            .enclosing_radius([self.centroid[0] as f32, self.centroid[1] as f32]) as f64;
        std::f64::consts::PI * r * r
    }
}

pub type ComponentImage = ImageBuffer<Luma<u32>, Vec<u32>>;

/// Component label per pixel; background (0 in the mask) stays 0.
pub fn label_components(mask: &GrayImage) -> ComponentImage {
    connected_components(mask, Connectivity::Eight, Luma([0u8]))
}

#[derive(Debug, Clone, Copy, Default)]
struct Accumulator {
    count: u64,
    sum_x: f64,
    sum_y: f64,
}

/// Every 8-connected foreground component of `mask`, ordered by label.
pub fn extract_components(mask: &GrayImage) -> Vec<Component> {
    extract_labelled_components(mask).1
}

/// Like [`extract_components`], also returning the per-pixel component labels.
pub fn extract_labelled_components(mask: &GrayImage) -> (ComponentImage, Vec<Component>) {
    let labels = label_components(mask);
    let count = labels.pixels().map(|p| p[0]).max().unwrap_or(0) as usize;
    if count == 0 {
        return (labels, Vec::new());
    }

    let mut stats = vec![Accumulator::default(); count + 1];
    for (x, y, pixel) in labels.enumerate_pixels() {
        let label = pixel[0] as usize;
        if label == 0 {
            continue;
        }
        let acc = &mut stats[label];
        acc.count += 1;
        acc.sum_x += x as f64;
        acc.sum_y += y as f64;
    }

    let mut shapes: Vec<Option<RegionShape>> = vec![None; count + 1];
    let contours = find_contours::<i32>(mask);
    let mut owner: Vec<Option<usize>> = vec![None; contours.len()];

    for (i, contour) in contours.iter().enumerate() {
        if !matches!(contour.border_type, BorderType::Outer) {
            continue;
        }
        let Some(first) = contour.points.first() else { continue };
        let label = labels.get_pixel(first.x as u32, first.y as u32)[0] as usize;
        if label == 0 {
            continue;
        }
        owner[i] = Some(label);
        shapes[label] = Some(RegionShape {
            exterior: contour.points.iter().map(|p| [p.x as f32, p.y as f32]).collect(),
            holes: Vec::new(),
        });
    }

    for contour in contours.iter().filter(|c| matches!(c.border_type, BorderType::Hole)) {
        let Some(label) = contour.parent.and_then(|parent| owner[parent]) else {
            continue;
        };
        if let Some(shape) = shapes[label].as_mut() {
            shape
                .holes
                .push(contour.points.iter().map(|p| [p.x as f32, p.y as f32]).collect());
        }
    }

    let components: Vec<Component> = (1..=count)
        .filter(|&label| stats[label].count > 0)
        .map(|label| {
            let acc = stats[label];
            let centroid = [acc.sum_x / acc.count as f64, acc.sum_y / acc.count as f64];
            let shape = shapes[label].take().unwrap_or_else(|| RegionShape {
                exterior: vec![[centroid[0] as f32, centroid[1] as f32]],
                holes: Vec::new(),
            });
            Component {
                label: label as u32,
                pixel_area: acc.count,
                centroid,
                shape,
            }
        })
        .collect();
    (labels, components)
}
