//! Per-patch counts and their CSV forms.

use std::{
    fs::{File, OpenOptions},
    io::BufWriter,
    path::Path,
};

use serde::{Deserialize, Serialize};

use crate::{
    algorithms::kmeans::MAX_CLUSTERS,
    error::Result,
    types::{PatchId, TilRegion},
};

/// Counts for one segmented tissue patch
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QuantificationRecord {
    pub patch: PatchId,
    pub n_clusters: usize,
    /// Tissue pixels per cluster; sums to `tissue_pixels`
    pub cluster_pixels: Vec<u64>,
    pub tissue_pixels: u64,
    pub background_pixels: u64,
    pub til_cluster: Option<u8>,
    pub til_region_count: usize,
    /// Tissue pixels inside TIL regions
    pub til_pixels: u64,
    pub til_area_fraction: f64,
}

impl QuantificationRecord {
    pub fn header() -> Vec<String> {
        let mut header: Vec<String> = ["slide", "x", "y", "width", "height", "n_clusters"]
            .into_iter()
            .map(String::from)
            .collect();
        header.extend((0..MAX_CLUSTERS).map(|k| format!("cluster_{k}_pixels")));
        header.extend(
            [
                "tissue_pixels",
                "background_pixels",
                "til_cluster",
                "til_region_count",
                "til_pixels",
                "til_area_fraction",
            ]
            .into_iter()
            .map(String::from),
        );
        header
    }

    /// One CSV row; cluster columns past `n_clusters` stay empty.
    pub fn to_row(&self) -> Vec<String> {
        let mut row = vec![
            self.patch.slide.clone(),
            self.patch.x.to_string(),
            self.patch.y.to_string(),
            self.patch.width.to_string(),
            self.patch.height.to_string(),
            self.n_clusters.to_string(),
        ];
        row.extend((0..MAX_CLUSTERS).map(|k| {
            self.cluster_pixels
                .get(k)
                .map(|count| count.to_string())
                .unwrap_or_default()
        }));
        row.extend([
            self.tissue_pixels.to_string(),
            self.background_pixels.to_string(),
            self.til_cluster.map(|c| c.to_string()).unwrap_or_default(),
            self.til_region_count.to_string(),
            self.til_pixels.to_string(),
            format!("{:.6}", self.til_area_fraction),
        ]);
        row
    }
}

/// Appends records to a CSV, writing the header only when the file is new or empty.
#[derive(Debug, Default, Clone, Copy)]
pub struct QuantificationWriter;

impl QuantificationWriter {
    pub fn append(&self, path: &Path, records: &[QuantificationRecord]) -> Result<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let file = OpenOptions::new().create(true).append(true).open(path)?;
        let needs_header = file.metadata()?.len() == 0;

        let mut writer = csv::WriterBuilder::new()
            .has_headers(false)
            .from_writer(BufWriter::new(file));
        if needs_header {
            writer.write_record(QuantificationRecord::header())?;
        }
        for record in records {
            writer.write_record(record.to_row())?;
        }
        writer.flush()?;
        Ok(())
    }
}

const REGION_HEADER: [&str; 8] = [
    "id",
    "cluster",
    "area",
    "perimeter",
    "roundness",
    "bounding_circle_area",
    "centroid_x",
    "centroid_y",
];

#[derive(Serialize)]
struct RegionRow {
    id: usize,
    cluster: u8,
    area: u64,
    perimeter: f64,
    roundness: f64,
    bounding_circle_area: f64,
    centroid_x: f64,
    centroid_y: f64,
}

/// Geometry of every TIL region of one patch
pub fn write_region_csv(path: &Path, regions: &[TilRegion]) -> Result<()> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    // serialize only emits a header before the first row; empty patches still get one
    let mut writer = csv::WriterBuilder::new()
        .has_headers(false)
        .from_writer(BufWriter::new(File::create(path)?));
    writer.write_record(REGION_HEADER)?;
    for (id, region) in regions.iter().enumerate() {
        writer.serialize(RegionRow {
            id,
            cluster: region.label,
            area: region.pixel_area,
            perimeter: region.perimeter,
            roundness: region.roundness,
            bounding_circle_area: region.enclosing_circle_area,
            centroid_x: region.centroid[0],
            centroid_y: region.centroid[1],
        })?;
    }
    writer.flush()?;
    Ok(())
}
