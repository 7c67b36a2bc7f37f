//! Serde model of GeoJSON plus conversions to and from `geo_types`.
//!
//! Only the parts the backend needs are modelled: foreign members are
//! dropped and `bbox` is ignored. Positions keep every ordinate they were
//! given so callers can decide what to do with a z value.

use geo_types::{Coord, LineString, Polygon};
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use serde_json::{Map, Value};
use thiserror::Error;

pub type Position = Vec<f64>;
pub type Properties = Map<String, Value>;

#[derive(Debug, Error)]
pub enum GeoJsonError {
    #[error("invalid geojson: {0}")]
    Json(#[from] serde_json::Error),
    #[error("geojson object has no type member")]
    MissingType,
    #[error("position needs at least two ordinates, got {0}")]
    InvalidPosition(usize),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum Geometry {
    Point { coordinates: Position },
    MultiPoint { coordinates: Vec<Position> },
    LineString { coordinates: Vec<Position> },
    MultiLineString { coordinates: Vec<Vec<Position>> },
    Polygon { coordinates: Vec<Vec<Position>> },
    MultiPolygon { coordinates: Vec<Vec<Vec<Position>>> },
    GeometryCollection { geometries: Vec<Geometry> },
}

impl Geometry {
    pub fn type_name(&self) -> &'static str {
        match self {
            Geometry::Point { .. } => "Point",
            Geometry::MultiPoint { .. } => "MultiPoint",
            Geometry::LineString { .. } => "LineString",
            Geometry::MultiLineString { .. } => "MultiLineString",
            Geometry::Polygon { .. } => "Polygon",
            Geometry::MultiPolygon { .. } => "MultiPolygon",
            Geometry::GeometryCollection { .. } => "GeometryCollection",
        }
    }

    /// Drops every ordinate past x and y.
    pub fn strip_z(&mut self) {
        fn strip(position: &mut Position) {
            position.truncate(2);
        }

        match self {
            Geometry::Point { coordinates } => strip(coordinates),
            Geometry::MultiPoint { coordinates } | Geometry::LineString { coordinates } => {
                coordinates.iter_mut().for_each(strip)
            }
            Geometry::MultiLineString { coordinates } | Geometry::Polygon { coordinates } => {
                coordinates.iter_mut().flatten().for_each(strip)
            }
            Geometry::MultiPolygon { coordinates } => {
                coordinates.iter_mut().flatten().flatten().for_each(strip)
            }
            Geometry::GeometryCollection { geometries } => {
                geometries.iter_mut().for_each(Geometry::strip_z)
            }
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum FeatureTag {
    #[default]
    Feature,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum FeatureCollectionTag {
    #[default]
    FeatureCollection,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Feature {
    #[serde(rename = "type", default)]
    pub kind: FeatureTag,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<Value>,
    pub geometry: Option<Geometry>,
    #[serde(default)]
    pub properties: Option<Properties>,
}

impl Feature {
    pub fn new(geometry: Geometry) -> Self {
        Self {
            kind: FeatureTag::Feature,
            id: None,
            geometry: Some(geometry),
            properties: Some(Properties::new()),
        }
    }

    pub fn with_id(mut self, id: impl Into<Value>) -> Self {
        self.id = Some(id.into());
        self
    }

    pub fn with_properties(mut self, properties: Option<Properties>) -> Self {
        self.properties = properties;
        self
    }

    pub fn with_property(mut self, key: &str, value: impl Into<Value>) -> Self {
        self.properties
            .get_or_insert_with(Properties::new)
            .insert(key.to_string(), value.into());
        self
    }

    pub fn geometry_type(&self) -> Option<&'static str> {
        self.geometry.as_ref().map(Geometry::type_name)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct FeatureCollection {
    #[serde(rename = "type", default)]
    pub kind: FeatureCollectionTag,
    #[serde(default)]
    pub features: Vec<Feature>,
}

impl FeatureCollection {
    pub fn new(features: Vec<Feature>) -> Self {
        Self {
            kind: FeatureCollectionTag::FeatureCollection,
            features,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.features.is_empty()
    }
}

/// Any top-level GeoJSON object, dispatched on its `type` member.
#[derive(Debug, Clone, PartialEq)]
pub enum GeoJson {
    FeatureCollection(FeatureCollection),
    Feature(Feature),
    Geometry(Geometry),
}

impl GeoJson {
    pub fn from_slice(bytes: &[u8]) -> Result<Self, GeoJsonError> {
        let value: Value = serde_json::from_slice(bytes)?;
        Self::from_value(value)
    }

    pub fn from_value(value: Value) -> Result<Self, GeoJsonError> {
        let kind = value
            .get("type")
            .and_then(Value::as_str)
            .ok_or(GeoJsonError::MissingType)?;
        match kind {
            "FeatureCollection" => Ok(Self::FeatureCollection(serde_json::from_value(value)?)),
            "Feature" => Ok(Self::Feature(serde_json::from_value(value)?)),
            _ => Ok(Self::Geometry(serde_json::from_value(value)?)),
        }
    }
}

impl Serialize for GeoJson {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        match self {
            GeoJson::FeatureCollection(collection) => collection.serialize(serializer),
            GeoJson::Feature(feature) => feature.serialize(serializer),
            GeoJson::Geometry(geometry) => geometry.serialize(serializer),
        }
    }
}

impl<'de> Deserialize<'de> for GeoJson {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let value = Value::deserialize(deserializer)?;
        GeoJson::from_value(value).map_err(serde::de::Error::custom)
    }
}

fn to_coord(position: &[f64]) -> Result<Coord<f64>, GeoJsonError> {
    match position {
        [x, y, ..] => Ok(Coord { x: *x, y: *y }),
        _ => Err(GeoJsonError::InvalidPosition(position.len())),
    }
}

fn to_line_string(positions: &[Position]) -> Result<LineString<f64>, GeoJsonError> {
    positions
        .iter()
        .map(|position| to_coord(position))
        .collect::<Result<Vec<_>, _>>()
        .map(LineString::new)
}

fn to_polygon(rings: &[Vec<Position>]) -> Result<Polygon<f64>, GeoJsonError> {
    let mut rings = rings.iter().map(|ring| to_line_string(ring));
    let exterior = rings
        .next()
        .transpose()?
        .unwrap_or_else(|| LineString::new(Vec::new()));
    let interiors = rings.collect::<Result<Vec<_>, _>>()?;
    Ok(Polygon::new(exterior, interiors))
}

impl TryFrom<&Geometry> for geo_types::Geometry<f64> {
    type Error = GeoJsonError;

    fn try_from(geometry: &Geometry) -> Result<Self, Self::Error> {
        Ok(match geometry {
            Geometry::Point { coordinates } => {
                geo_types::Geometry::Point(to_coord(coordinates)?.into())
            }
            Geometry::MultiPoint { coordinates } => geo_types::Geometry::MultiPoint(
                coordinates
                    .iter()
                    .map(|position| to_coord(position).map(geo_types::Point::from))
                    .collect::<Result<Vec<_>, _>>()?
                    .into(),
            ),
            Geometry::LineString { coordinates } => {
                geo_types::Geometry::LineString(to_line_string(coordinates)?)
            }
            Geometry::MultiLineString { coordinates } => {
                geo_types::Geometry::MultiLineString(geo_types::MultiLineString::new(
                    coordinates
                        .iter()
                        .map(|line| to_line_string(line))
                        .collect::<Result<Vec<_>, _>>()?,
                ))
            }
            Geometry::Polygon { coordinates } => {
                geo_types::Geometry::Polygon(to_polygon(coordinates)?)
            }
            Geometry::MultiPolygon { coordinates } => {
                geo_types::Geometry::MultiPolygon(geo_types::MultiPolygon::new(
                    coordinates
                        .iter()
                        .map(|polygon| to_polygon(polygon))
                        .collect::<Result<Vec<_>, _>>()?,
                ))
            }
            Geometry::GeometryCollection { geometries } => {
                geo_types::Geometry::GeometryCollection(geo_types::GeometryCollection::new_from(
                    geometries
                        .iter()
                        .map(geo_types::Geometry::try_from)
                        .collect::<Result<Vec<_>, _>>()?,
                ))
            }
        })
    }
}

fn from_coord(coord: Coord<f64>) -> Position {
    vec![coord.x, coord.y]
}

fn from_line_string(line: &LineString<f64>) -> Vec<Position> {
    line.coords().copied().map(from_coord).collect()
}

fn from_polygon(polygon: &Polygon<f64>) -> Vec<Vec<Position>> {
    std::iter::once(polygon.exterior())
        .chain(polygon.interiors())
        .map(from_line_string)
        .collect()
}

impl From<&Polygon<f64>> for Geometry {
    fn from(polygon: &Polygon<f64>) -> Self {
        Geometry::Polygon {
            coordinates: from_polygon(polygon),
        }
    }
}

impl From<&geo_types::MultiPolygon<f64>> for Geometry {
    fn from(multi: &geo_types::MultiPolygon<f64>) -> Self {
        Geometry::MultiPolygon {
            coordinates: multi.iter().map(from_polygon).collect(),
        }
    }
}

impl From<&geo_types::Geometry<f64>> for Geometry {
    fn from(geometry: &geo_types::Geometry<f64>) -> Self {
        match geometry {
            geo_types::Geometry::Point(point) => Geometry::Point {
                coordinates: from_coord(point.0),
            },
            geo_types::Geometry::Line(line) => Geometry::LineString {
                coordinates: vec![from_coord(line.start), from_coord(line.end)],
            },
            geo_types::Geometry::LineString(line) => Geometry::LineString {
                coordinates: from_line_string(line),
            },
            geo_types::Geometry::Polygon(polygon) => polygon.into(),
            geo_types::Geometry::MultiPoint(points) => Geometry::MultiPoint {
                coordinates: points.iter().map(|point| from_coord(point.0)).collect(),
            },
            geo_types::Geometry::MultiLineString(lines) => Geometry::MultiLineString {
                coordinates: lines.iter().map(from_line_string).collect(),
            },
            geo_types::Geometry::MultiPolygon(multi) => multi.into(),
            geo_types::Geometry::GeometryCollection(collection) => Geometry::GeometryCollection {
                geometries: collection.iter().map(Geometry::from).collect(),
            },
            geo_types::Geometry::Rect(rect) => (&rect.to_polygon()).into(),
            geo_types::Geometry::Triangle(triangle) => (&triangle.to_polygon()).into(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn dispatches_on_type_member() {
        let collection = GeoJson::from_value(json!({
            "type": "FeatureCollection",
            "features": [{
                "type": "Feature",
                "geometry": { "type": "Point", "coordinates": [85.3, 27.7] },
                "properties": { "name": "a" }
            }]
        }))
        .unwrap();
        assert!(matches!(collection, GeoJson::FeatureCollection(ref fc) if fc.features.len() == 1));

        let feature = GeoJson::from_slice(
            br#"{"type":"Feature","geometry":null,"properties":null}"#,
        )
        .unwrap();
        assert!(matches!(feature, GeoJson::Feature(ref f) if f.geometry.is_none()));

        let geometry =
            GeoJson::from_slice(br#"{"type":"LineString","coordinates":[[0,0],[1,1]]}"#).unwrap();
        assert!(matches!(geometry, GeoJson::Geometry(Geometry::LineString { .. })));
    }

    #[test]
    fn rejects_untyped_and_unknown_objects() {
        assert!(matches!(
            GeoJson::from_value(json!({ "coordinates": [0, 0] })),
            Err(GeoJsonError::MissingType)
        ));
        assert!(matches!(
            GeoJson::from_value(json!({ "type": "Circle", "radius": 3 })),
            Err(GeoJsonError::Json(_))
        ));
        assert!(GeoJson::from_slice(b"{ not json").is_err());
    }

    #[test]
    fn serializes_with_type_members() {
        let feature = Feature::new(Geometry::Point {
            coordinates: vec![1.0, 2.0],
        })
        .with_id(7)
        .with_property("task_index", 1);
        let value = serde_json::to_value(GeoJson::FeatureCollection(FeatureCollection::new(
            vec![feature],
        )))
        .unwrap();
        assert_eq!(value["type"], "FeatureCollection");
        assert_eq!(value["features"][0]["type"], "Feature");
        assert_eq!(value["features"][0]["id"], 7);
        assert_eq!(value["features"][0]["geometry"]["type"], "Point");
        assert_eq!(value["features"][0]["properties"]["task_index"], 1);
    }

    #[test]
    fn converts_polygon_with_hole() {
        let geometry = Geometry::Polygon {
            coordinates: vec![
                vec![
                    vec![0.0, 0.0, 12.0],
                    vec![10.0, 0.0, 12.0],
                    vec![10.0, 10.0, 12.0],
                    vec![0.0, 10.0, 12.0],
                    vec![0.0, 0.0, 12.0],
                ],
                vec![
                    vec![2.0, 2.0],
                    vec![4.0, 2.0],
                    vec![4.0, 4.0],
                    vec![2.0, 2.0],
                ],
            ],
        };
        let converted = geo_types::Geometry::try_from(&geometry).unwrap();
        let geo_types::Geometry::Polygon(polygon) = &converted else {
            panic!("expected polygon");
        };
        assert_eq!(polygon.interiors().len(), 1);
        assert_eq!(polygon.exterior().0.len(), 5);

        let Geometry::Polygon { coordinates } = Geometry::from(&converted) else {
            panic!("expected polygon");
        };
        assert_eq!(coordinates[0][1], vec![10.0, 0.0]);
    }

    #[test]
    fn short_positions_are_rejected() {
        let geometry = Geometry::Point {
            coordinates: vec![1.0],
        };
        assert!(matches!(
            geo_types::Geometry::try_from(&geometry),
            Err(GeoJsonError::InvalidPosition(1))
        ));
    }

    #[test]
    fn strip_z_reaches_nested_geometries() {
        let mut geometry = Geometry::GeometryCollection {
            geometries: vec![Geometry::MultiPolygon {
                coordinates: vec![vec![vec![vec![1.0, 2.0, 3.0]]]],
            }],
        };
        geometry.strip_z();
        let Geometry::GeometryCollection { geometries } = geometry else {
            panic!("expected collection");
        };
        assert_eq!(
            geometries[0],
            Geometry::MultiPolygon {
                coordinates: vec![vec![vec![vec![1.0, 2.0]]]],
            }
        );
    }
}
