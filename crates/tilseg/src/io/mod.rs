pub mod geojson;
pub mod raster;
pub mod store;

pub use raster::{load_patch, save_gray, save_rgb};
pub use store::{PatchStore, SlideRegionSource};
