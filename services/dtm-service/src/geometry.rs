//! Task-boundary processing: normalising uploaded GeoJSON, building project
//! outlines, merging polygons and splitting an AOI into square tasks.

use geo::{Area, BooleanOps, BoundingRect, Centroid, ChamberlainDuquetteArea, ConvexHull};
use geo_types::{coord, MultiPolygon, Point, Polygon, Rect};
use thiserror::Error;

use crate::geojson::{Feature, FeatureCollection, GeoJson, GeoJsonError, Geometry};

/// Meters per degree of latitude, also used at the equator for longitude.
const METERS_PER_DEGREE: f64 = 111_320.0;
const MAX_GRID_CELLS: usize = 250_000;
/// Clipped parts smaller than this fraction of a grid cell are slivers.
const SLIVER_FRACTION: f64 = 1e-9;

#[derive(Debug, Error)]
pub enum GeometryError {
    #[error(transparent)]
    GeoJson(#[from] GeoJsonError),
    #[error("no polygon geometries found")]
    NoPolygons,
    #[error("unsupported outline geometry: {0}")]
    UnsupportedOutline(&'static str),
    #[error("split dimension must be a positive number of meters, got {0}")]
    InvalidDimension(f64),
    #[error("area is too large to split into {0} m squares")]
    TooManyCells(f64),
    #[error("geometry is empty")]
    Empty,
}

/// Wraps a Feature or bare geometry in a FeatureCollection.
pub fn to_feature_collection(geojson: GeoJson) -> FeatureCollection {
    match geojson {
        GeoJson::FeatureCollection(collection) => collection,
        GeoJson::Feature(feature) => FeatureCollection::new(vec![feature]),
        GeoJson::Geometry(geometry) => FeatureCollection::new(vec![Feature::new(geometry)]),
    }
}

/// Parses raw GeoJSON into a FeatureCollection with single-member
/// GeometryCollection wrappers removed.
pub fn parse_feature_collection(bytes: &[u8]) -> Result<FeatureCollection, GeometryError> {
    let mut collection = to_feature_collection(GeoJson::from_slice(bytes)?);
    for feature in &mut collection.features {
        feature.geometry = feature.geometry.take().map(unwrap_single_collection);
    }
    Ok(collection)
}

fn unwrap_single_collection(geometry: Geometry) -> Geometry {
    match geometry {
        Geometry::GeometryCollection { mut geometries } if geometries.len() == 1 => {
            match geometries.pop() {
                Some(inner) => inner,
                None => Geometry::GeometryCollection { geometries },
            }
        }
        other => other,
    }
}

/// Normalises a collection so every feature is a 2D Point, LineString or
/// Polygon. MultiPolygons are exploded into one feature per part.
pub fn normalise_feature_collection(mut collection: FeatureCollection) -> FeatureCollection {
    for feature in &mut collection.features {
        feature.geometry = feature.geometry.take().map(|geometry| {
            let mut geometry = unwrap_single_collection(geometry);
            geometry.strip_z();
            geometry
        });
    }
    explode_multipolygons(collection, true)
}

/// Converts MultiPolygon features into Polygon features and drops every
/// non-polygonal feature.
pub fn multipolygon_to_polygon(collection: FeatureCollection) -> FeatureCollection {
    explode_multipolygons(collection, false)
}

fn explode_multipolygons(collection: FeatureCollection, keep_other: bool) -> FeatureCollection {
    let mut features = Vec::with_capacity(collection.features.len());
    for feature in collection.features {
        match feature.geometry {
            Some(Geometry::MultiPolygon { coordinates }) => {
                features.extend(coordinates.into_iter().map(|polygon| {
                    Feature::new(Geometry::Polygon {
                        coordinates: polygon,
                    })
                    .with_properties(feature.properties.clone())
                }));
            }
            Some(Geometry::Polygon { .. }) => features.push(feature),
            _ if keep_other => features.push(feature),
            _ => {}
        }
    }
    FeatureCollection::new(features)
}

/// Predominant geometry type among Polygon, Point and LineString. Ties go
/// to the type listed first.
pub fn main_geometry_type(collection: &FeatureCollection) -> &'static str {
    const CANDIDATES: [&str; 3] = ["Polygon", "Point", "LineString"];
    let mut counts = [0usize; 3];
    for kind in collection.features.iter().filter_map(Feature::geometry_type) {
        if let Some(index) = CANDIDATES.iter().position(|candidate| *candidate == kind) {
            counts[index] += 1;
        }
    }

    let mut best = 0;
    for index in 1..CANDIDATES.len() {
        if counts[index] > counts[best] {
            best = index;
        }
    }
    CANDIDATES[best]
}

pub fn filter_main_geometry_type(collection: FeatureCollection) -> FeatureCollection {
    let main = main_geometry_type(&collection);
    FeatureCollection::new(
        collection
            .features
            .into_iter()
            .filter(|feature| feature.geometry_type() == Some(main))
            .collect(),
    )
}

/// Collects every polygon in the collection, looking inside MultiPolygons
/// and GeometryCollections.
pub fn collect_polygons(collection: &FeatureCollection) -> Result<Vec<Polygon<f64>>, GeometryError> {
    fn push(geometry: geo_types::Geometry<f64>, out: &mut Vec<Polygon<f64>>) {
        match geometry {
            geo_types::Geometry::Polygon(polygon) => out.push(polygon),
            geo_types::Geometry::MultiPolygon(multi) => out.extend(multi.0),
            geo_types::Geometry::Rect(rect) => out.push(rect.to_polygon()),
            geo_types::Geometry::GeometryCollection(collection) => {
                for member in collection.0 {
                    push(member, out);
                }
            }
            _ => {}
        }
    }

    let mut polygons = Vec::new();
    for geometry in collection.features.iter().filter_map(|f| f.geometry.as_ref()) {
        push(geo_types::Geometry::try_from(geometry)?, &mut polygons);
    }
    Ok(polygons)
}

pub fn union_polygons(polygons: Vec<Polygon<f64>>) -> MultiPolygon<f64> {
    let mut polygons = polygons.into_iter();
    let Some(first) = polygons.next() else {
        return MultiPolygon::new(Vec::new());
    };
    polygons.fold(MultiPolygon::new(vec![first]), |merged, polygon| {
        merged.union(&MultiPolygon::new(vec![polygon]))
    })
}

/// Builds the project outline. A single feature keeps its own geometry;
/// several features are unioned into a MultiPolygon.
pub fn outline_from_geojson(geojson: GeoJson) -> Result<geo_types::Geometry<f64>, GeometryError> {
    let collection = normalise_feature_collection(to_feature_collection(geojson));
    let geometries: Vec<&Geometry> = collection
        .features
        .iter()
        .filter_map(|feature| feature.geometry.as_ref())
        .collect();

    match geometries.as_slice() {
        [] => Err(GeometryError::Empty),
        [single] => match geo_types::Geometry::try_from(*single)? {
            polygon @ geo_types::Geometry::Polygon(_) => Ok(polygon),
            multi @ geo_types::Geometry::MultiPolygon(_) => Ok(multi),
            _ => Err(GeometryError::UnsupportedOutline(single.type_name())),
        },
        _ => {
            let polygons = collect_polygons(&collection)?;
            if polygons.is_empty() {
                return Err(GeometryError::NoPolygons);
            }
            Ok(geo_types::Geometry::MultiPolygon(union_polygons(polygons)))
        }
    }
}

/// Unions every polygon into one. Disjoint results collapse to their
/// convex hull so the caller always gets a single polygon.
pub fn merge_multipolygon(collection: FeatureCollection) -> Result<Polygon<f64>, GeometryError> {
    let collection = normalise_feature_collection(collection);
    let polygons = collect_polygons(&collection)?;
    if polygons.is_empty() {
        return Err(GeometryError::NoPolygons);
    }

    let mut merged = union_polygons(polygons);
    match merged.0.len() {
        0 => Err(GeometryError::Empty),
        1 => Ok(merged.0.remove(0)),
        parts => {
            tracing::warn!(parts, "disjoint polygons merged into their convex hull");
            Ok(merged.convex_hull())
        }
    }
}

pub fn subtract_no_fly_zones(aoi: &MultiPolygon<f64>, zones: Vec<Polygon<f64>>) -> MultiPolygon<f64> {
    if zones.is_empty() {
        return aoi.clone();
    }
    aoi.difference(&union_polygons(zones))
}

/// Degrees of (latitude, longitude) spanned by `meters` at `latitude`.
pub fn meters_to_degrees(meters: f64, latitude: f64) -> (f64, f64) {
    let lat_degrees = meters / METERS_PER_DEGREE;
    let cos = latitude.to_radians().cos().abs().max(1e-6);
    let lon_degrees = meters / (METERS_PER_DEGREE * cos);
    (lat_degrees, lon_degrees)
}

/// Splits the AOI into squares `meters` wide, clipped to the AOI. Cells are
/// numbered from the south-west corner, row by row.
pub fn split_by_square(
    aoi: &MultiPolygon<f64>,
    meters: f64,
) -> Result<FeatureCollection, GeometryError> {
    if !(meters.is_finite() && meters > 0.0) {
        return Err(GeometryError::InvalidDimension(meters));
    }
    let bounds = aoi.bounding_rect().ok_or(GeometryError::Empty)?;
    let (min, max) = (bounds.min(), bounds.max());
    let reference_lat = (min.y + max.y) / 2.0;
    let (lat_step, lon_step) = meters_to_degrees(meters, reference_lat);

    let cols = ((max.x - min.x) / lon_step).ceil().max(1.0);
    let rows = ((max.y - min.y) / lat_step).ceil().max(1.0);
    if cols * rows > MAX_GRID_CELLS as f64 {
        return Err(GeometryError::TooManyCells(meters));
    }
    let (cols, rows) = (cols as usize, rows as usize);
    let min_area = lat_step * lon_step * SLIVER_FRACTION;

    let mut features = Vec::new();
    for row in 0..rows {
        for col in 0..cols {
            // Both corners come from the grid index so neighbours share edges exactly.
            let (x0, x1) = (grid_line(min.x, col, lon_step), grid_line(min.x, col + 1, lon_step));
            let (y0, y1) = (grid_line(min.y, row, lat_step), grid_line(min.y, row + 1, lat_step));
            let cell = Rect::new(coord! { x: x0, y: y0 }, coord! { x: x1, y: y1 })
            .to_polygon();
            let clipped = MultiPolygon::new(vec![cell]).intersection(aoi);
            for part in clipped {
                if part.unsigned_area() <= min_area {
                    continue;
                }
                let task_index = features.len() + 1;
                features.push(Feature::new((&part).into()).with_property("task_index", task_index));
            }
        }
    }

    tracing::debug!(meters, tasks = features.len(), "split area by square");
    Ok(FeatureCollection::new(features))
}

fn grid_line(origin: f64, index: usize, step: f64) -> f64 {
    origin + index as f64 * step
}

/// Geodesic area in square kilometres.
pub fn area_km2(geometry: &geo_types::Geometry<f64>) -> f64 {
    geometry.chamberlain_duquette_unsigned_area() / 1_000_000.0
}

pub fn centroid(geometry: &geo_types::Geometry<f64>) -> Option<Point<f64>> {
    geometry.centroid()
}

/// Any polygonal geometry as a MultiPolygon; other types yield `None`.
pub fn as_multipolygon(geometry: &geo_types::Geometry<f64>) -> Option<MultiPolygon<f64>> {
    match geometry {
        geo_types::Geometry::Polygon(polygon) => Some(MultiPolygon::new(vec![polygon.clone()])),
        geo_types::Geometry::MultiPolygon(multi) => Some(multi.clone()),
        geo_types::Geometry::Rect(rect) => Some(MultiPolygon::new(vec![rect.to_polygon()])),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use geo_types::polygon;
    use serde_json::json;

    fn square(x: f64, y: f64, size: f64) -> Vec<Vec<Vec<f64>>> {
        vec![vec![
            vec![x, y],
            vec![x + size, y],
            vec![x + size, y + size],
            vec![x, y + size],
            vec![x, y],
        ]]
    }

    fn square_polygon(x: f64, y: f64, size: f64) -> Polygon<f64> {
        Rect::new(coord! { x: x, y: y }, coord! { x: x + size, y: y + size }).to_polygon()
    }

    #[test]
    fn normalises_uploaded_collection() {
        let raw = json!({
            "type": "FeatureCollection",
            "features": [
                {
                    "type": "Feature",
                    "properties": { "name": "blocks" },
                    "geometry": {
                        "type": "MultiPolygon",
                        "coordinates": [square(0.0, 0.0, 1.0), square(5.0, 5.0, 1.0)]
                    }
                },
                {
                    "type": "Feature",
                    "properties": {},
                    "geometry": {
                        "type": "GeometryCollection",
                        "geometries": [{ "type": "Point", "coordinates": [1.0, 2.0, 30.0] }]
                    }
                }
            ]
        });
        let collection = parse_feature_collection(raw.to_string().as_bytes()).unwrap();
        let normalised = normalise_feature_collection(collection);

        assert_eq!(normalised.features.len(), 3);
        assert_eq!(normalised.features[0].geometry_type(), Some("Polygon"));
        assert_eq!(normalised.features[1].geometry_type(), Some("Polygon"));
        assert_eq!(
            normalised.features[1].properties.as_ref().unwrap()["name"],
            "blocks"
        );
        assert_eq!(
            normalised.features[2].geometry,
            Some(Geometry::Point {
                coordinates: vec![1.0, 2.0]
            })
        );
    }

    #[test]
    fn multipolygon_to_polygon_drops_other_types() {
        let collection = FeatureCollection::new(vec![
            Feature::new(Geometry::MultiPolygon {
                coordinates: vec![square(0.0, 0.0, 1.0), square(2.0, 0.0, 1.0)],
            }),
            Feature::new(Geometry::LineString {
                coordinates: vec![vec![0.0, 0.0], vec![1.0, 1.0]],
            }),
        ]);
        let exploded = multipolygon_to_polygon(collection);
        assert_eq!(exploded.features.len(), 2);
        assert!(exploded
            .features
            .iter()
            .all(|feature| feature.geometry_type() == Some("Polygon")));
    }

    #[test]
    fn main_type_prefers_polygons_on_tie() {
        let collection = FeatureCollection::new(vec![
            Feature::new(Geometry::Point {
                coordinates: vec![0.0, 0.0],
            }),
            Feature::new(Geometry::Polygon {
                coordinates: square(0.0, 0.0, 1.0),
            }),
        ]);
        assert_eq!(main_geometry_type(&collection), "Polygon");

        let mut points = collection.clone();
        points.features.push(Feature::new(Geometry::Point {
            coordinates: vec![3.0, 3.0],
        }));
        assert_eq!(main_geometry_type(&points), "Point");
        assert_eq!(filter_main_geometry_type(points).features.len(), 2);
    }

    #[test]
    fn outline_unions_several_features() {
        let geojson = GeoJson::FeatureCollection(FeatureCollection::new(vec![
            Feature::new(Geometry::Polygon {
                coordinates: square(0.0, 0.0, 1.0),
            }),
            Feature::new(Geometry::Polygon {
                coordinates: square(1.0, 0.0, 1.0),
            }),
        ]));
        let outline = outline_from_geojson(geojson).unwrap();
        let geo_types::Geometry::MultiPolygon(multi) = outline else {
            panic!("expected multipolygon");
        };
        assert_eq!(multi.0.len(), 1);
        assert!((multi.unsigned_area() - 2.0).abs() < 1e-9);
    }

    #[test]
    fn outline_keeps_single_polygon_and_rejects_points() {
        let polygon = GeoJson::Geometry(Geometry::Polygon {
            coordinates: square(0.0, 0.0, 1.0),
        });
        assert!(matches!(
            outline_from_geojson(polygon),
            Ok(geo_types::Geometry::Polygon(_))
        ));

        let point = GeoJson::Geometry(Geometry::Point {
            coordinates: vec![0.0, 0.0],
        });
        assert!(matches!(
            outline_from_geojson(point),
            Err(GeometryError::UnsupportedOutline("Point"))
        ));

        let empty = GeoJson::FeatureCollection(FeatureCollection::default());
        assert!(matches!(outline_from_geojson(empty), Err(GeometryError::Empty)));
    }

    #[test]
    fn merge_returns_hull_for_disjoint_polygons() {
        let collection = FeatureCollection::new(vec![
            Feature::new(Geometry::Polygon {
                coordinates: square(0.0, 0.0, 1.0),
            }),
            Feature::new(Geometry::Polygon {
                coordinates: square(3.0, 0.0, 1.0),
            }),
        ]);
        let merged = merge_multipolygon(collection).unwrap();
        assert!((merged.unsigned_area() - 4.0).abs() < 1e-9);

        let adjacent = FeatureCollection::new(vec![
            Feature::new(Geometry::Polygon {
                coordinates: square(0.0, 0.0, 1.0),
            }),
            Feature::new(Geometry::Polygon {
                coordinates: square(0.5, 0.0, 1.0),
            }),
        ]);
        let merged = merge_multipolygon(adjacent).unwrap();
        assert!((merged.unsigned_area() - 1.5).abs() < 1e-9);

        assert!(matches!(
            merge_multipolygon(FeatureCollection::default()),
            Err(GeometryError::NoPolygons)
        ));
    }

    #[test]
    fn split_covers_the_whole_aoi() {
        let aoi = MultiPolygon::new(vec![square_polygon(30.0, 0.0, 0.01)]);
        let tasks = split_by_square(&aoi, 500.0).unwrap();

        assert_eq!(tasks.features.len(), 9);
        let mut covered = 0.0;
        for (index, feature) in tasks.features.iter().enumerate() {
            assert_eq!(
                feature.properties.as_ref().unwrap()["task_index"],
                index + 1
            );
            let geometry = geo_types::Geometry::try_from(feature.geometry.as_ref().unwrap()).unwrap();
            covered += geometry.unsigned_area();
        }
        assert!((covered - aoi.unsigned_area()).abs() < 1e-9);
    }

    #[test]
    fn split_cells_merge_back_into_the_aoi() {
        let l_shape = polygon![
            (x: 85.30, y: 27.70),
            (x: 85.32, y: 27.70),
            (x: 85.32, y: 27.71),
            (x: 85.31, y: 27.71),
            (x: 85.31, y: 27.72),
            (x: 85.30, y: 27.72),
            (x: 85.30, y: 27.70),
        ];
        let aoi = MultiPolygon::new(vec![l_shape]);
        for meters in [100.0, 250.0] {
            let tasks = split_by_square(&aoi, meters).unwrap();
            let cells = collect_polygons(&tasks).unwrap();
            assert_eq!(union_polygons(cells).0.len(), 1, "split at {meters} m");

            let merged = merge_multipolygon(tasks).unwrap();
            let ratio = merged.unsigned_area() / aoi.unsigned_area();
            assert!((ratio - 1.0).abs() < 1e-6, "split at {meters} m gave ratio {ratio}");
        }
    }

    #[test]
    fn split_rejects_bad_dimensions() {
        let aoi = MultiPolygon::new(vec![square_polygon(0.0, 0.0, 0.01)]);
        assert!(matches!(
            split_by_square(&aoi, 0.0),
            Err(GeometryError::InvalidDimension(_))
        ));
        assert!(matches!(
            split_by_square(&aoi, f64::NAN),
            Err(GeometryError::InvalidDimension(_))
        ));
        assert!(matches!(
            split_by_square(&MultiPolygon::new(Vec::new()), 100.0),
            Err(GeometryError::Empty)
        ));
        let continent = MultiPolygon::new(vec![square_polygon(0.0, 0.0, 40.0)]);
        assert!(matches!(
            split_by_square(&continent, 1.0),
            Err(GeometryError::TooManyCells(_))
        ));
    }

    #[test]
    fn no_fly_zones_are_removed() {
        let aoi = MultiPolygon::new(vec![square_polygon(0.0, 0.0, 2.0)]);
        let remaining = subtract_no_fly_zones(&aoi, vec![square_polygon(0.0, 0.0, 1.0)]);
        assert!((remaining.unsigned_area() - 3.0).abs() < 1e-9);
        assert_eq!(subtract_no_fly_zones(&aoi, Vec::new()), aoi);
    }

    #[test]
    fn degrees_widen_towards_the_poles() {
        let (lat_eq, lon_eq) = meters_to_degrees(111_320.0, 0.0);
        assert!((lat_eq - 1.0).abs() < 1e-12);
        assert!((lon_eq - 1.0).abs() < 1e-12);
        let (_, lon_60) = meters_to_degrees(111_320.0, 60.0);
        assert!((lon_60 - 2.0).abs() < 1e-9);
    }

    #[test]
    fn area_and_centroid() {
        let polygon = geo_types::Geometry::Polygon(square_polygon(0.0, 0.0, 0.01));
        let km2 = area_km2(&polygon);
        // Roughly 1.11 km on each side near the equator.
        assert!(km2 > 1.2 && km2 < 1.3, "area was {km2}");
        let center = centroid(&polygon).unwrap();
        assert!((center.x() - 0.005).abs() < 1e-12);
        assert!((center.y() - 0.005).abs() < 1e-12);
    }
}
