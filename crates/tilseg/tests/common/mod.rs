#![allow(dead_code)]

use std::path::Path;

use image::{Rgb, RgbImage};
use tilseg::{Region, Result, SlideFormat, SlideHandle, SlideReader, TilsegError, slide::slide_id};

pub const STROMA: Rgb<u8> = Rgb([230, 150, 200]);
pub const NUCLEUS: Rgb<u8> = Rgb([60, 30, 110]);
pub const GLASS: Rgb<u8> = Rgb([250, 250, 250]);

pub const NUCLEUS_RADIUS: i64 = 10;
pub const NUCLEUS_SPACING: u32 = 50;

/// Procedural slides keyed by file stem:
/// `blank*` is all glass, `corrupt*` fails to open, anything else is
/// 500x200 of stroma dotted with round nuclei plus a 30 px glass margin on the right.
pub struct SyntheticReader;

impl SyntheticReader {
    pub const TISSUE_WIDTH: u32 = 500;
    pub const WIDTH: u32 = 530;
    pub const HEIGHT: u32 = 200;

    fn pixel(slide: &str, x: u32, y: u32) -> Rgb<u8> {
        if slide.starts_with("blank") || x >= Self::TISSUE_WIDTH {
            return GLASS;
        }
        let centre = |v: u32| (v / NUCLEUS_SPACING * NUCLEUS_SPACING + NUCLEUS_SPACING / 2) as i64;
        let (dx, dy) = (x as i64 - centre(x), y as i64 - centre(y));
        let base = if dx * dx + dy * dy <= NUCLEUS_RADIUS * NUCLEUS_RADIUS { NUCLEUS } else { STROMA };
        jitter(base, x, y)
    }
}

impl SlideReader for SyntheticReader {
    fn open(&self, path: &Path) -> Result<SlideHandle> {
        let id = slide_id(path);
        if id.starts_with("corrupt") {
            return Err(TilsegError::slide_read(id, "truncated header"));
        }
        SlideHandle::new(path, SlideFormat::Svs, vec![(Self::WIDTH, Self::HEIGHT)])
    }

    fn read_region(&self, handle: &SlideHandle, region: Region, _level: u32) -> Result<RgbImage> {
        let slide = handle.id().to_string();
        Ok(RgbImage::from_fn(region.width, region.height, |x, y| {
            Self::pixel(&slide, region.x + x, region.y + y)
        }))
    }
}

/// Deterministic +-6 stain variation so clusters are not single points
fn jitter(colour: Rgb<u8>, x: u32, y: u32) -> Rgb<u8> {
    let hash = x.wrapping_mul(73_856_093) ^ y.wrapping_mul(19_349_663);
    Rgb(std::array::from_fn(|c| {
        let offset = ((hash >> (c * 8)) % 13) as i16 - 6;
        (colour[c] as i16 + offset).clamp(0, 255) as u8
    }))
}

/// Input directory holding empty placeholder files; pixels come from [`SyntheticReader`].
pub fn slide_dir(names: &[&str]) -> tempfile::TempDir {
    let dir = tempfile::tempdir().unwrap();
    for name in names {
        std::fs::write(dir.path().join(name), b"").unwrap();
    }
    dir
}

/// Pixels inside one nucleus disk
pub fn nucleus_area() -> u64 {
    let r = NUCLEUS_RADIUS;
    let mut count = 0;
    for dy in -r..=r {
        for dx in -r..=r {
            if dx * dx + dy * dy <= r * r {
                count += 1;
            }
        }
    }
    count
}
