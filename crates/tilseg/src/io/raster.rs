use std::path::Path;

use image::{DynamicImage, GrayImage, RgbImage};

use crate::error::Result;

fn ensure_parent(path: &Path) -> Result<()> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    Ok(())
}

/// Write an RGB raster; the format follows the file extension.
pub fn save_rgb(image: &RgbImage, path: &Path) -> Result<()> {
    ensure_parent(path)?;
    image.save(path)?;
    Ok(())
}

pub fn save_gray(image: &GrayImage, path: &Path) -> Result<()> {
    ensure_parent(path)?;
    image.save(path)?;
    Ok(())
}

pub fn load_patch(path: &Path) -> Result<DynamicImage> {
    Ok(image::open(path)?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::{Luma, Rgb};

    #[test]
    fn saves_into_missing_directories() {
        let dir = tempfile::tempdir().unwrap();
        let rgb_path = dir.path().join("a/b/patch.png");
        let gray_path = dir.path().join("c/mask.png");

        save_rgb(&RgbImage::from_pixel(3, 2, Rgb([10, 20, 30])), &rgb_path).unwrap();
        save_gray(&GrayImage::from_pixel(3, 2, Luma([255])), &gray_path).unwrap();

        let loaded = load_patch(&rgb_path).unwrap().to_rgb8();
        assert_eq!(loaded.dimensions(), (3, 2));
        assert_eq!(loaded.get_pixel(1, 1), &Rgb([10, 20, 30]));
        assert_eq!(load_patch(&gray_path).unwrap().to_luma8().get_pixel(0, 0), &Luma([255]));
    }
}
