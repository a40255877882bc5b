//! Slide containers and the bundled raster reader.

use std::{
    collections::HashMap,
    path::{Path, PathBuf},
    str::FromStr,
    sync::{Arc, RwLock},
};

use image::RgbImage;
use serde::{Deserialize, Serialize};
use strum::{Display, EnumIter, EnumString, IntoEnumIterator, IntoStaticStr, VariantNames};

use crate::{
    error::{Result, TilsegError},
    traits::SlideReader,
    types::Region,
};

/// Whole-slide image containers accepted as pipeline input
#[derive(
    Debug, Clone, Copy,
    Serialize, Deserialize,
    Display, EnumString, EnumIter, VariantNames, IntoStaticStr,
    PartialEq, Eq, Hash
)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase", ascii_case_insensitive)]
pub enum SlideFormat {
    Svs,
    Tif,
    Ndpi,
    Vms,
    Vmu,
    Scn,
    Mrxs,
    Tiff,
    Svslide,
    Bif,
}

impl SlideFormat {
    pub fn from_path(path: &Path) -> Option<Self> {
        let ext = path.extension()?.to_str()?;
        Self::from_str(ext).ok()
    }

    /// Formats whose level 0 is stored as a TIFF image
    pub fn is_tiff_container(&self) -> bool {
        matches!(self, Self::Svs | Self::Tif | Self::Tiff | Self::Scn | Self::Bif | Self::Svslide)
    }

    pub fn extensions() -> Vec<&'static str> {
        Self::iter().map(Into::into).collect()
    }
}

/// An opened slide. Immutable; clone to share.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SlideHandle {
    id: String,
    path: PathBuf,
    format: SlideFormat,
    level_dimensions: Vec<(u32, u32)>,
}

impl SlideHandle {
    /// `level_dimensions[0]` is the native resolution.
    pub fn new(path: impl Into<PathBuf>, format: SlideFormat, level_dimensions: Vec<(u32, u32)>) -> Result<Self> {
        let path = path.into();
        if level_dimensions.is_empty() {
            return Err(TilsegError::slide_read(path.display().to_string(), "slide has no resolution levels"));
        }
        Ok(Self {
            id: slide_id(&path),
            path,
            format,
            level_dimensions,
        })
    }

    /// Name of the slide file without its extension
    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn format(&self) -> SlideFormat {
        self.format
    }

    pub fn dimensions(&self) -> (u32, u32) {
        self.level_dimensions[0]
    }

    pub fn level_count(&self) -> usize {
        self.level_dimensions.len()
    }

    pub fn dimensions_at(&self, level: u32) -> Option<(u32, u32)> {
        self.level_dimensions.get(level as usize).copied()
    }
}

pub fn slide_id(path: &Path) -> String {
    path.file_stem()
        .map(|stem| stem.to_string_lossy().into_owned())
        .unwrap_or_else(|| path.display().to_string())
}

/// Slides under `path`: the file itself, or every supported file in the directory, sorted.
pub fn discover_slides(path: &Path) -> Result<Vec<PathBuf>> {
    if path.is_file() {
        return match SlideFormat::from_path(path) {
            Some(_) => Ok(vec![path.to_path_buf()]),
            None => Err(TilsegError::UnsupportedFormat(path.display().to_string())),
        };
    }

    let mut slides = Vec::new();
    for entry in std::fs::read_dir(path)? {
        let entry_path = entry?.path();
        if entry_path.is_file() && SlideFormat::from_path(&entry_path).is_some() {
            slides.push(entry_path);
        }
    }
    slides.sort();
    Ok(slides)
}

/// Reads TIFF-container slides through the `image` decoder.
///
/// The decoded level 0 is cached per path until [`SlideReader::release`], so this reader
/// suits slides that fit in memory; vendor pyramid formats need a dedicated [`SlideReader`].
#[derive(Debug, Default)]
pub struct RasterSlideReader {
    cache: RwLock<HashMap<PathBuf, Arc<RgbImage>>>,
}

impl RasterSlideReader {
    pub fn new() -> Self {
        Self::default()
    }

    /// Slides currently held decoded
    pub fn cached(&self) -> usize {
        self.cache.read().map_or(0, |cache| cache.len())
    }

    fn decode(path: &Path, id: &str) -> Result<RgbImage> {
        let decoded = image::ImageReader::open(path)
            .map_err(|e| TilsegError::slide_read(id, e))?
            .with_guessed_format()
            .map_err(|e| TilsegError::slide_read(id, e))?
            .decode()
            .map_err(|e| TilsegError::slide_read(id, e))?
            .to_rgb8();
        tracing::debug!(slide = %id, width = decoded.width(), height = decoded.height(), "decoded slide");
        Ok(decoded)
    }

    fn insert(&self, path: &Path, id: &str, raster: RgbImage) -> Result<Arc<RgbImage>> {
        let raster = Arc::new(raster);
        self.cache
            .write()
            .map_err(|_| TilsegError::slide_read(id, "raster cache poisoned"))?
            .insert(path.to_path_buf(), Arc::clone(&raster));
        Ok(raster)
    }

    /// Cached raster, decoded again if it was released.
    fn raster(&self, handle: &SlideHandle) -> Result<Arc<RgbImage>> {
        let cached = self
            .cache
            .read()
            .map_err(|_| TilsegError::slide_read(handle.id(), "raster cache poisoned"))?
            .get(handle.path())
            .cloned();
        match cached {
            Some(raster) => Ok(raster),
            None => {
                let decoded = Self::decode(handle.path(), handle.id())?;
                if decoded.dimensions() != handle.dimensions() {
                    return Err(TilsegError::slide_read(handle.id(), "slide changed since it was opened"));
                }
                self.insert(handle.path(), handle.id(), decoded)
            }
        }
    }
}

impl SlideReader for RasterSlideReader {
    fn open(&self, path: &Path) -> Result<SlideHandle> {
        let format = SlideFormat::from_path(path)
            .ok_or_else(|| TilsegError::UnsupportedFormat(path.display().to_string()))?;
        if !format.is_tiff_container() {
            return Err(TilsegError::UnsupportedFormat(format!(
                "{} ({format} needs a vendor slide reader)",
                path.display()
            )));
        }

        let id = slide_id(path);
        let decoded = Self::decode(path, &id)?;
        let handle = SlideHandle::new(path, format, vec![decoded.dimensions()])?;
        self.insert(path, &id, decoded)?;
        Ok(handle)
    }

    fn read_region(&self, handle: &SlideHandle, region: Region, level: u32) -> Result<RgbImage> {
        let (width, height) = handle
            .dimensions_at(level)
            .ok_or_else(|| TilsegError::slide_read(handle.id(), format!("level {level} not available")))?;
        if region.width == 0 || region.height == 0 || region.right() > width || region.bottom() > height {
            return Err(TilsegError::slide_read(
                handle.id(),
                format!("region {region:?} outside {width}x{height}"),
            ));
        }
        let raster = self.raster(handle)?;
        Ok(image::imageops::crop_imm(&*raster, region.x, region.y, region.width, region.height).to_image())
    }

    fn release(&self, handle: &SlideHandle) {
        if let Ok(mut cache) = self.cache.write() {
            cache.remove(handle.path());
        }
    }
}
