use serde_json::Value;

use crate::geojson::{Feature, FeatureCollection, Geometry, Position};

pub fn feature_collection_to_kml(collection: &FeatureCollection) -> String {
    let mut out = String::from(
        "<?xml version=\"1.0\" encoding=\"UTF-8\"?>\n\
         <kml xmlns=\"http://www.opengis.net/kml/2.2\">\n<Document>\n",
    );
    for (index, feature) in collection.features.iter().enumerate() {
        write_placemark(&mut out, feature, index);
    }
    out.push_str("</Document>\n</kml>\n");
    out
}

fn placemark_name(feature: &Feature, index: usize) -> String {
    let from_properties = feature.properties.as_ref().and_then(|properties| {
        ["name", "task_index"]
            .iter()
            .find_map(|key| properties.get(*key))
            .and_then(value_text)
    });
    from_properties
        .or_else(|| feature.id.as_ref().and_then(value_text))
        .unwrap_or_else(|| format!("feature {}", index + 1))
}

fn value_text(value: &Value) -> Option<String> {
    match value {
        Value::String(text) => Some(text.clone()),
        Value::Number(number) => Some(number.to_string()),
        _ => None,
    }
}

fn write_placemark(out: &mut String, feature: &Feature, index: usize) {
    let Some(geometry) = feature.geometry.as_ref() else {
        return;
    };
    let name = escape(&placemark_name(feature, index));
    out.push_str(&format!("<Placemark>\n<name>{name}</name>\n"));
    write_geometry(out, geometry);
    out.push_str("</Placemark>\n");
}

fn write_geometry(out: &mut String, geometry: &Geometry) {
    match geometry {
        Geometry::Point { coordinates } => {
            out.push_str("<Point><coordinates>");
            write_position(out, coordinates);
            out.push_str("</coordinates></Point>\n");
        }
        Geometry::LineString { coordinates } => write_line_string(out, coordinates),
        Geometry::Polygon { coordinates } => write_polygon(out, coordinates),
        Geometry::MultiPoint { coordinates } => {
            out.push_str("<MultiGeometry>\n");
            for position in coordinates {
                write_geometry(
                    out,
                    &Geometry::Point {
                        coordinates: position.clone(),
                    },
                );
            }
            out.push_str("</MultiGeometry>\n");
        }
        Geometry::MultiLineString { coordinates } => {
            out.push_str("<MultiGeometry>\n");
            for line in coordinates {
                write_line_string(out, line);
            }
            out.push_str("</MultiGeometry>\n");
        }
        Geometry::MultiPolygon { coordinates } => {
            out.push_str("<MultiGeometry>\n");
            for polygon in coordinates {
                write_polygon(out, polygon);
            }
            out.push_str("</MultiGeometry>\n");
        }
        Geometry::GeometryCollection { geometries } => {
            out.push_str("<MultiGeometry>\n");
            for member in geometries {
                write_geometry(out, member);
            }
            out.push_str("</MultiGeometry>\n");
        }
    }
}

fn write_line_string(out: &mut String, positions: &[Position]) {
    out.push_str("<LineString><coordinates>");
    write_positions(out, positions);
    out.push_str("</coordinates></LineString>\n");
}

fn write_polygon(out: &mut String, rings: &[Vec<Position>]) {
    let Some((exterior, interiors)) = rings.split_first() else {
        return;
    };
    out.push_str("<Polygon>\n<outerBoundaryIs><LinearRing><coordinates>");
    write_positions(out, exterior);
    out.push_str("</coordinates></LinearRing></outerBoundaryIs>\n");
    for ring in interiors {
        out.push_str("<innerBoundaryIs><LinearRing><coordinates>");
        write_positions(out, ring);
        out.push_str("</coordinates></LinearRing></innerBoundaryIs>\n");
    }
    out.push_str("</Polygon>\n");
}

fn write_positions(out: &mut String, positions: &[Position]) {
    for (index, position) in positions.iter().enumerate() {
        if index > 0 {
            out.push(' ');
        }
        write_position(out, position);
    }
}

fn write_position(out: &mut String, position: &[f64]) {
    for (index, ordinate) in position.iter().take(3).enumerate() {
        if index > 0 {
            out.push(',');
        }
        out.push_str(&ordinate.to_string());
    }
}

fn escape(text: &str) -> String {
    let mut escaped = String::with_capacity(text.len());
    for ch in text.chars() {
        match ch {
            '&' => escaped.push_str("&amp;"),
            '<' => escaped.push_str("&lt;"),
            '>' => escaped.push_str("&gt;"),
            '"' => escaped.push_str("&quot;"),
            '\'' => escaped.push_str("&apos;"),
            other => escaped.push(other),
        }
    }
    escaped
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn polygon_with_hole() {
        let feature = Feature::new(Geometry::Polygon {
            coordinates: vec![
                vec![
                    vec![0.0, 0.0],
                    vec![4.0, 0.0],
                    vec![4.0, 4.0],
                    vec![0.0, 0.0],
                ],
                vec![vec![1.0, 1.0], vec![2.0, 1.0], vec![2.0, 2.0], vec![1.0, 1.0]],
            ],
        })
        .with_property("task_index", 3);
        let kml = feature_collection_to_kml(&FeatureCollection::new(vec![feature]));

        assert!(kml.starts_with("<?xml"));
        assert!(kml.contains("<Placemark>\n<name>3</name>\n"));
        assert!(kml.contains(
            "<outerBoundaryIs><LinearRing><coordinates>0,0 4,0 4,4 0,0</coordinates>"
        ));
        assert_eq!(kml.matches("<innerBoundaryIs>").count(), 1);
        assert!(kml.trim_end().ends_with("</kml>"));
    }

    #[test]
    fn names_are_escaped_and_fall_back_to_position() {
        let named = Feature::new(Geometry::Point {
            coordinates: vec![85.5, 27.25],
        })
        .with_property("name", "Fields <north> & \"south\"");
        let unnamed = Feature::new(Geometry::LineString {
            coordinates: vec![vec![0.0, 0.0], vec![1.5, 1.0]],
        });
        let kml = feature_collection_to_kml(&FeatureCollection::new(vec![named, unnamed]));

        assert!(kml.contains("<name>Fields &lt;north&gt; &amp; &quot;south&quot;</name>"));
        assert!(kml.contains("<Point><coordinates>85.5,27.25</coordinates></Point>"));
        assert!(kml.contains("<name>feature 2</name>"));
        assert!(kml.contains("<LineString><coordinates>0,0 1.5,1</coordinates></LineString>"));
    }

    #[test]
    fn multipolygon_becomes_multigeometry() {
        let feature = Feature::new(Geometry::MultiPolygon {
            coordinates: vec![
                vec![vec![vec![0.0, 0.0], vec![1.0, 0.0], vec![1.0, 1.0], vec![0.0, 0.0]]],
                vec![vec![vec![5.0, 5.0], vec![6.0, 5.0], vec![6.0, 6.0], vec![5.0, 5.0]]],
            ],
        })
        .with_id("outline");
        let kml = feature_collection_to_kml(&FeatureCollection::new(vec![feature]));
        assert!(kml.contains("<name>outline</name>"));
        assert!(kml.contains("<MultiGeometry>"));
        assert_eq!(kml.matches("<Polygon>").count(), 2);
    }
}
