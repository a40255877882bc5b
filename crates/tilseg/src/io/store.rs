use std::{
    collections::HashMap,
    path::{Path, PathBuf},
};

use image::DynamicImage;

use crate::{
    error::{Result, TilsegError},
    io::raster,
    slide::SlideHandle,
    traits::{PatchSource, SlideReader},
    types::{Patch, PatchId},
};

/// Accepted patches on disk, laid out as `<root>/<slide>/<x>_<y>.png`
#[derive(Debug, Clone)]
pub struct PatchStore {
    root: PathBuf,
}

impl PatchStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn slide_dir(&self, slide: &str) -> PathBuf {
        self.root.join(slide)
    }

    pub fn patch_path(&self, id: &PatchId) -> PathBuf {
        self.slide_dir(&id.slide).join(format!("{}.png", id.file_stem()))
    }

    /// Directory holding the segmentation artifacts of one patch
    pub fn artifact_dir(&self, id: &PatchId) -> PathBuf {
        self.slide_dir(&id.slide).join(id.file_stem())
    }

    pub fn save(&self, patch: &Patch) -> Result<PathBuf> {
        let path = self.patch_path(&patch.id);
        raster::save_rgb(&patch.pixels.to_rgb8(), &path)?;
        Ok(path)
    }

    pub fn load(&self, id: &PatchId) -> Result<Patch> {
        Ok(Patch::new(id.clone(), raster::load_patch(&self.patch_path(id))?))
    }

    /// Slides with a patch directory, sorted
    pub fn slides(&self) -> Result<Vec<String>> {
        let mut slides = Vec::new();
        for entry in std::fs::read_dir(&self.root)? {
            let entry = entry?;
            if entry.file_type()?.is_dir() {
                slides.push(entry.file_name().to_string_lossy().into_owned());
            }
        }
        slides.sort();
        Ok(slides)
    }

    /// Saved patches of one slide, ordered by origin
    pub fn list(&self, slide: &str) -> Result<Vec<PatchId>> {
        let dir = self.slide_dir(slide);
        if !dir.is_dir() {
            return Ok(Vec::new());
        }

        let mut ids = Vec::new();
        for entry in std::fs::read_dir(&dir)? {
            let path = entry?.path();
            if !path.is_file() || path.extension().is_none_or(|ext| ext != "png") {
                continue;
            }
            let Some(stem) = path.file_stem().and_then(|s| s.to_str()) else {
                continue;
            };
            let Some(mut id) = PatchId::from_file_stem(slide, stem, 0, 0) else {
                continue;
            };
            let (width, height) = image::image_dimensions(&path)?;
            id.width = width;
            id.height = height;
            ids.push(id);
        }
        ids.sort_by_key(|id| (id.y, id.x));
        Ok(ids)
    }

    pub fn list_all(&self) -> Result<Vec<PatchId>> {
        let mut ids = Vec::new();
        for slide in self.slides()? {
            ids.extend(self.list(&slide)?);
        }
        Ok(ids)
    }
}

impl PatchSource for PatchStore {
    fn load_patch(&self, id: &PatchId) -> Result<DynamicImage> {
        raster::load_patch(&self.patch_path(id))
    }
}

/// Re-reads patch regions straight from their slides
pub struct SlideRegionSource<'a> {
    reader: &'a dyn SlideReader,
    handles: HashMap<String, SlideHandle>,
    level: u32,
}

impl<'a> SlideRegionSource<'a> {
    pub fn new(reader: &'a dyn SlideReader, handles: impl IntoIterator<Item = SlideHandle>, level: u32) -> Self {
        Self {
            reader,
            handles: handles.into_iter().map(|h| (h.id().to_string(), h)).collect(),
            level,
        }
    }
}

impl PatchSource for SlideRegionSource<'_> {
    fn load_patch(&self, id: &PatchId) -> Result<DynamicImage> {
        let handle = self
            .handles
            .get(&id.slide)
            .ok_or_else(|| TilsegError::slide_read(&id.slide, "slide is not open"))?;
        let pixels = self.reader.read_region(handle, id.region(), self.level)?;
        Ok(DynamicImage::ImageRgb8(pixels))
    }
}

/// Patches already held in memory
impl PatchSource for Vec<Patch> {
    fn load_patch(&self, id: &PatchId) -> Result<DynamicImage> {
        self.iter()
            .find(|patch| &patch.id == id)
            .map(|patch| patch.pixels.clone())
            .ok_or_else(|| TilsegError::InvalidPatch(format!("{id} is not loaded")))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::Region;
    use image::{Rgb, RgbImage};

    #[test]
    fn saves_lists_and_loads_patches() {
        let dir = tempfile::tempdir().unwrap();
        let store = PatchStore::new(dir.path());

        for (x, y) in [(8, 0), (0, 0), (0, 6)] {
            let id = PatchId::new("slide", Region::new(x, y, 8, 6));
            let patch = Patch::from_rgb(id, RgbImage::from_pixel(8, 6, Rgb([x as u8, y as u8, 1])));
            let path = store.save(&patch).unwrap();
            assert!(path.ends_with(format!("slide/{x}_{y}.png")));
        }
        // artifact directories and CSVs are not patches
        std::fs::create_dir_all(dir.path().join("slide/0_0")).unwrap();
        std::fs::write(dir.path().join("slide/quantification.csv"), "").unwrap();

        let ids = store.list("slide").unwrap();
        let origins: Vec<_> = ids.iter().map(|id| (id.x, id.y)).collect();
        assert_eq!(origins, [(0, 0), (8, 0), (0, 6)]);
        assert_eq!((ids[0].width, ids[0].height), (8, 6));

        let loaded = store.load(&ids[1]).unwrap();
        assert_eq!(loaded.pixels.to_rgb8().get_pixel(0, 0), &Rgb([8, 0, 1]));
        assert_eq!(store.list_all().unwrap().len(), 3);
        assert!(store.list("missing").unwrap().is_empty());
    }

    #[test]
    fn in_memory_source_reports_unknown_patches() {
        let id = PatchId::new("s", Region::new(0, 0, 2, 2));
        let patches = vec![Patch::from_rgb(id.clone(), RgbImage::new(2, 2))];
        assert!(patches.load_patch(&id).is_ok());
        let other = PatchId::new("s", Region::new(2, 0, 2, 2));
        assert!(matches!(patches.load_patch(&other), Err(TilsegError::InvalidPatch(_))));
    }
}
