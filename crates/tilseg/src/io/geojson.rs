use std::path::Path;

use geojson::{Feature, FeatureCollection, Geometry, Value};
use serde_json::{Map, Number, Value as JsonValue};

use crate::{
    error::{Result, TilsegError},
    types::{PatchId, RegionShape, TilRegion},
};

fn number(value: f64) -> JsonValue {
    Number::from_f64(value).map(JsonValue::Number).unwrap_or(JsonValue::Null)
}

/// Closed GeoJSON ring; the first position is repeated at the end.
fn ring(points: &[[f32; 2]]) -> Vec<Vec<f64>> {
    let mut ring: Vec<Vec<f64>> = points.iter().map(|&[x, y]| vec![x as f64, y as f64]).collect();
    if let (Some(first), Some(last)) = (ring.first(), ring.last()) {
        if first != last {
            ring.push(first.clone());
        }
    }
    ring
}

fn open_ring(positions: &[Vec<f64>]) -> Vec<[f32; 2]> {
    let mut points: Vec<[f32; 2]> = positions
        .iter()
        .filter(|p| p.len() >= 2)
        .map(|p| [p[0] as f32, p[1] as f32])
        .collect();
    if points.len() > 1 && points.first() == points.last() {
        points.pop();
    }
    points
}

/// TIL outlines of one patch as a FeatureCollection in patch pixel coordinates.
///
/// The patch origin is stored in the collection's foreign members so outlines can be
/// placed back on the slide.
pub fn to_geojson(patch: &PatchId, regions: &[TilRegion]) -> FeatureCollection {
    let features = regions
        .iter()
        .enumerate()
        .map(|(i, region)| {
            let mut coordinates = vec![ring(&region.shape.exterior)];
            coordinates.extend(region.shape.holes.iter().map(|hole| ring(hole)));

            let mut properties = Map::new();
            properties.insert("id".to_string(), JsonValue::from(i));
            properties.insert("cluster".to_string(), JsonValue::from(region.label));
            properties.insert("area".to_string(), JsonValue::from(region.pixel_area));
            properties.insert("perimeter".to_string(), number(region.perimeter));
            properties.insert("roundness".to_string(), number(region.roundness));
            properties.insert("bounding_circle_area".to_string(), number(region.enclosing_circle_area));
            properties.insert("hole_count".to_string(), JsonValue::from(region.shape.holes.len()));

            Feature {
                bbox: None,
                geometry: Some(Geometry::new(Value::Polygon(coordinates))),
                id: Some(geojson::feature::Id::Number(Number::from(i))),
                properties: Some(properties),
                foreign_members: None,
            }
        })
        .collect();

    let mut foreign_members = Map::new();
    foreign_members.insert("slide".to_string(), JsonValue::from(patch.slide.clone()));
    foreign_members.insert("origin".to_string(), JsonValue::from(vec![patch.x, patch.y]));
    foreign_members.insert("image_width".to_string(), JsonValue::from(patch.width));
    foreign_members.insert("image_height".to_string(), JsonValue::from(patch.height));
    foreign_members.insert("region_count".to_string(), JsonValue::from(regions.len()));

    FeatureCollection {
        bbox: None,
        features,
        foreign_members: Some(foreign_members),
    }
}

pub fn save_geojson(patch: &PatchId, regions: &[TilRegion], path: &Path) -> Result<()> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    let collection = to_geojson(patch, regions);
    std::fs::write(path, serde_json::to_string_pretty(&collection)?)?;
    Ok(())
}

/// Read back the patch id and outlines written by [`save_geojson`].
pub fn load_outlines(path: &Path) -> Result<(PatchId, Vec<RegionShape>)> {
    let text = std::fs::read_to_string(path)?;
    let collection: FeatureCollection = text.parse()?;

    let members = collection
        .foreign_members
        .as_ref()
        .ok_or_else(|| TilsegError::InvalidPatch(format!("{}: missing patch metadata", path.display())))?;
    let field = |key: &str| members.get(key).and_then(JsonValue::as_u64).map(|v| v as u32);
    let origin: Vec<u32> = members
        .get("origin")
        .and_then(JsonValue::as_array)
        .map(|values| values.iter().filter_map(|v| v.as_u64().map(|v| v as u32)).collect())
        .unwrap_or_default();
    let (Some(slide), [x, y], Some(width), Some(height)) = (
        members.get("slide").and_then(JsonValue::as_str),
        origin.as_slice(),
        field("image_width"),
        field("image_height"),
    ) else {
        return Err(TilsegError::InvalidPatch(format!(
            "{}: incomplete patch metadata",
            path.display()
        )));
    };
    let patch = PatchId {
        slide: slide.to_string(),
        x: *x,
        y: *y,
        width,
        height,
    };

    let shapes = collection
        .features
        .into_iter()
        .filter_map(|feature| match feature.geometry?.value {
            Value::Polygon(rings) if !rings.is_empty() => Some(RegionShape {
                exterior: open_ring(&rings[0]),
                holes: rings[1..].iter().map(|hole| open_ring(hole)).collect(),
            }),
            _ => None,
        })
        .collect();

    Ok((patch, shapes))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::Region;

    fn region(patch: &PatchId) -> TilRegion {
        TilRegion {
            patch: patch.clone(),
            label: 2,
            shape: RegionShape {
                exterior: vec![[0.0, 0.0], [20.0, 0.0], [20.0, 20.0], [0.0, 20.0]],
                holes: vec![vec![[5.0, 5.0], [6.0, 5.0], [6.0, 6.0]]],
            },
            pixel_area: 400,
            perimeter: 80.0,
            roundness: 1.27,
            centroid: [10.0, 10.0],
            enclosing_circle_area: 628.3,
        }
    }

    #[test]
    fn rings_are_closed_and_metadata_is_kept() {
        let patch = PatchId::new("s1", Region::new(4000, 0, 4000, 3000));
        let collection = to_geojson(&patch, &[region(&patch)]);
        assert_eq!(collection.features.len(), 1);

        let geometry = collection.features[0].geometry.as_ref().unwrap();
        let Value::Polygon(rings) = &geometry.value else {
            panic!("expected a polygon");
        };
        assert_eq!(rings.len(), 2);
        assert_eq!(rings[0].first(), rings[0].last());
        assert_eq!(rings[0].len(), 5);

        let members = collection.foreign_members.as_ref().unwrap();
        assert_eq!(members["slide"], "s1");
        assert_eq!(members["region_count"], 1);
    }

    #[test]
    fn saved_outlines_load_back() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested/til_regions.geojson");
        let patch = PatchId::new("s1", Region::new(0, 3000, 500, 400));
        let original = region(&patch);
        save_geojson(&patch, std::slice::from_ref(&original), &path).unwrap();

        let (loaded_patch, shapes) = load_outlines(&path).unwrap();
        assert_eq!(loaded_patch, patch);
        assert_eq!(shapes, vec![original.shape]);
    }
}
