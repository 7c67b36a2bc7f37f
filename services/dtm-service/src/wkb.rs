//! Well-Known Binary codec for 2D geometries.
//!
//! PostGIS receives geometries through `ST_GeomFromWKB` and hands them back
//! through `ST_AsBinary`, so only the ISO 2D subset is produced. Decoding
//! accepts both byte orders and skips the SRID of extended WKB.

use geo_types::{
    Coord, Geometry, GeometryCollection, LineString, MultiLineString, MultiPoint, MultiPolygon,
    Point, Polygon,
};
use thiserror::Error;

const LITTLE_ENDIAN: u8 = 1;
const BIG_ENDIAN: u8 = 0;

const WKB_POINT: u32 = 1;
const WKB_LINE_STRING: u32 = 2;
const WKB_POLYGON: u32 = 3;
const WKB_MULTI_POINT: u32 = 4;
const WKB_MULTI_LINE_STRING: u32 = 5;
const WKB_MULTI_POLYGON: u32 = 6;
const WKB_GEOMETRY_COLLECTION: u32 = 7;

const EWKB_Z: u32 = 0x8000_0000;
const EWKB_M: u32 = 0x4000_0000;
const EWKB_SRID: u32 = 0x2000_0000;

#[derive(Debug, Error, PartialEq)]
pub enum WkbError {
    #[error("unexpected end of wkb at byte {0}")]
    Truncated(usize),
    #[error("invalid byte order marker {0}")]
    ByteOrder(u8),
    #[error("unsupported wkb geometry type {0}")]
    UnsupportedType(u32),
    #[error("only 2D geometries are supported")]
    Dimensions,
    #[error("{0} trailing bytes after geometry")]
    TrailingBytes(usize),
}

pub fn encode(geometry: &Geometry<f64>) -> Vec<u8> {
    let mut out = Vec::with_capacity(64);
    write_geometry(&mut out, geometry);
    out
}

pub fn decode(bytes: &[u8]) -> Result<Geometry<f64>, WkbError> {
    let mut reader = Reader { bytes, offset: 0 };
    let geometry = reader.geometry()?;
    let remaining = bytes.len() - reader.offset;
    if remaining > 0 {
        return Err(WkbError::TrailingBytes(remaining));
    }
    Ok(geometry)
}

fn write_header(out: &mut Vec<u8>, kind: u32) {
    out.push(LITTLE_ENDIAN);
    out.extend_from_slice(&kind.to_le_bytes());
}

fn write_count(out: &mut Vec<u8>, count: usize) {
    // WKB counts are u32; geometries anywhere near that size never reach here.
    out.extend_from_slice(&(count as u32).to_le_bytes());
}

fn write_coord(out: &mut Vec<u8>, coord: Coord<f64>) {
    out.extend_from_slice(&coord.x.to_le_bytes());
    out.extend_from_slice(&coord.y.to_le_bytes());
}

fn write_ring(out: &mut Vec<u8>, line: &LineString<f64>) {
    write_count(out, line.0.len());
    for coord in &line.0 {
        write_coord(out, *coord);
    }
}

fn write_polygon_body(out: &mut Vec<u8>, polygon: &Polygon<f64>) {
    let exterior = polygon.exterior();
    if exterior.0.is_empty() {
        write_count(out, 0);
        return;
    }
    write_count(out, 1 + polygon.interiors().len());
    write_ring(out, exterior);
    for interior in polygon.interiors() {
        write_ring(out, interior);
    }
}

fn write_geometry(out: &mut Vec<u8>, geometry: &Geometry<f64>) {
    match geometry {
        Geometry::Point(point) => {
            write_header(out, WKB_POINT);
            write_coord(out, point.0);
        }
        Geometry::Line(line) => {
            write_header(out, WKB_LINE_STRING);
            write_ring(out, &LineString::new(vec![line.start, line.end]));
        }
        Geometry::LineString(line) => {
            write_header(out, WKB_LINE_STRING);
            write_ring(out, line);
        }
        Geometry::Polygon(polygon) => {
            write_header(out, WKB_POLYGON);
            write_polygon_body(out, polygon);
        }
        Geometry::MultiPoint(points) => {
            write_header(out, WKB_MULTI_POINT);
            write_count(out, points.0.len());
            for point in points {
                write_geometry(out, &Geometry::Point(*point));
            }
        }
        Geometry::MultiLineString(lines) => {
            write_header(out, WKB_MULTI_LINE_STRING);
            write_count(out, lines.0.len());
            for line in lines {
                write_header(out, WKB_LINE_STRING);
                write_ring(out, line);
            }
        }
        Geometry::MultiPolygon(polygons) => {
            write_header(out, WKB_MULTI_POLYGON);
            write_count(out, polygons.0.len());
            for polygon in polygons {
                write_header(out, WKB_POLYGON);
                write_polygon_body(out, polygon);
            }
        }
        Geometry::GeometryCollection(collection) => {
            write_header(out, WKB_GEOMETRY_COLLECTION);
            write_count(out, collection.0.len());
            for member in collection {
                write_geometry(out, member);
            }
        }
        Geometry::Rect(rect) => write_geometry(out, &Geometry::Polygon(rect.to_polygon())),
        Geometry::Triangle(triangle) => {
            write_geometry(out, &Geometry::Polygon(triangle.to_polygon()))
        }
    }
}

struct Reader<'a> {
    bytes: &'a [u8],
    offset: usize,
}

impl Reader<'_> {
    fn take<const N: usize>(&mut self) -> Result<[u8; N], WkbError> {
        let end = self.offset + N;
        let slice = self
            .bytes
            .get(self.offset..end)
            .ok_or(WkbError::Truncated(self.offset))?;
        let mut buf = [0u8; N];
        buf.copy_from_slice(slice);
        self.offset = end;
        Ok(buf)
    }

    fn u32(&mut self, little: bool) -> Result<u32, WkbError> {
        let buf = self.take::<4>()?;
        Ok(if little {
            u32::from_le_bytes(buf)
        } else {
            u32::from_be_bytes(buf)
        })
    }

    fn f64(&mut self, little: bool) -> Result<f64, WkbError> {
        let buf = self.take::<8>()?;
        Ok(if little {
            f64::from_le_bytes(buf)
        } else {
            f64::from_be_bytes(buf)
        })
    }

    fn coord(&mut self, little: bool) -> Result<Coord<f64>, WkbError> {
        Ok(Coord {
            x: self.f64(little)?,
            y: self.f64(little)?,
        })
    }

    fn line_string(&mut self, little: bool) -> Result<LineString<f64>, WkbError> {
        let count = self.u32(little)? as usize;
        // Each coordinate is 16 bytes; refuse counts the buffer cannot hold.
        if count.saturating_mul(16) > self.bytes.len() - self.offset {
            return Err(WkbError::Truncated(self.offset));
        }
        (0..count)
            .map(|_| self.coord(little))
            .collect::<Result<Vec<_>, _>>()
            .map(LineString::new)
    }

    fn polygon(&mut self, little: bool) -> Result<Polygon<f64>, WkbError> {
        let rings = self.u32(little)? as usize;
        if rings == 0 {
            return Ok(Polygon::new(LineString::new(Vec::new()), Vec::new()));
        }
        let exterior = self.line_string(little)?;
        let interiors = (1..rings)
            .map(|_| self.line_string(little))
            .collect::<Result<Vec<_>, _>>()?;
        Ok(Polygon::new(exterior, interiors))
    }

    fn members(&mut self, little: bool) -> Result<Vec<Geometry<f64>>, WkbError> {
        let count = self.u32(little)? as usize;
        // Smallest member (an empty ring count) is 9 bytes.
        if count.saturating_mul(9) > self.bytes.len() - self.offset {
            return Err(WkbError::Truncated(self.offset));
        }
        (0..count).map(|_| self.geometry()).collect()
    }

    fn geometry(&mut self) -> Result<Geometry<f64>, WkbError> {
        let [order] = self.take::<1>()?;
        let little = match order {
            LITTLE_ENDIAN => true,
            BIG_ENDIAN => false,
            other => return Err(WkbError::ByteOrder(other)),
        };
        let raw = self.u32(little)?;
        if raw & (EWKB_Z | EWKB_M) != 0 {
            return Err(WkbError::Dimensions);
        }
        if raw & EWKB_SRID != 0 {
            let _srid = self.u32(little)?;
        }
        let kind = raw & 0x0fff_ffff;
        if kind > 1000 {
            // ISO Z (1000s), M (2000s) and ZM (3000s) codes.
            return Err(WkbError::Dimensions);
        }

        match kind {
            WKB_POINT => Ok(Geometry::Point(Point(self.coord(little)?))),
            WKB_LINE_STRING => Ok(Geometry::LineString(self.line_string(little)?)),
            WKB_POLYGON => Ok(Geometry::Polygon(self.polygon(little)?)),
            WKB_MULTI_POINT => {
                let points = self
                    .members(little)?
                    .into_iter()
                    .map(|member| match member {
                        Geometry::Point(point) => Ok(point),
                        _ => Err(WkbError::UnsupportedType(kind)),
                    })
                    .collect::<Result<Vec<_>, _>>()?;
                Ok(Geometry::MultiPoint(MultiPoint::new(points)))
            }
            WKB_MULTI_LINE_STRING => {
                let lines = self
                    .members(little)?
                    .into_iter()
                    .map(|member| match member {
                        Geometry::LineString(line) => Ok(line),
                        _ => Err(WkbError::UnsupportedType(kind)),
                    })
                    .collect::<Result<Vec<_>, _>>()?;
                Ok(Geometry::MultiLineString(MultiLineString::new(lines)))
            }
            WKB_MULTI_POLYGON => {
                let polygons = self
                    .members(little)?
                    .into_iter()
                    .map(|member| match member {
                        Geometry::Polygon(polygon) => Ok(polygon),
                        _ => Err(WkbError::UnsupportedType(kind)),
                    })
                    .collect::<Result<Vec<_>, _>>()?;
                Ok(Geometry::MultiPolygon(MultiPolygon::new(polygons)))
            }
            WKB_GEOMETRY_COLLECTION => Ok(Geometry::GeometryCollection(
                GeometryCollection::new_from(self.members(little)?),
            )),
            other => Err(WkbError::UnsupportedType(other)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use geo_types::{polygon, point};

    fn square() -> Polygon<f64> {
        polygon![
            (x: 85.0, y: 27.0),
            (x: 85.1, y: 27.0),
            (x: 85.1, y: 27.1),
            (x: 85.0, y: 27.1),
            (x: 85.0, y: 27.0),
        ]
    }

    #[test]
    fn point_matches_known_bytes() {
        // POINT(1 2) as produced by ST_AsBinary on x86.
        let expected: Vec<u8> = vec![
            0x01, 0x01, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0xf0, 0x3f, 0x00,
            0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x40,
        ];
        assert_eq!(encode(&Geometry::Point(point!(x: 1.0, y: 2.0))), expected);
        assert_eq!(
            decode(&expected).unwrap(),
            Geometry::Point(point!(x: 1.0, y: 2.0))
        );
    }

    #[test]
    fn decodes_big_endian_point() {
        let mut bytes = vec![0x00, 0x00, 0x00, 0x00, 0x01];
        bytes.extend_from_slice(&3.5f64.to_be_bytes());
        bytes.extend_from_slice(&(-1.25f64).to_be_bytes());
        assert_eq!(
            decode(&bytes).unwrap(),
            Geometry::Point(point!(x: 3.5, y: -1.25))
        );
    }

    #[test]
    fn multipolygon_survives_postgis_interchange() {
        let geometry = Geometry::MultiPolygon(MultiPolygon::new(vec![square(), square()]));
        let bytes = encode(&geometry);
        assert_eq!(bytes[0], LITTLE_ENDIAN);
        assert_eq!(u32::from_le_bytes([bytes[1], bytes[2], bytes[3], bytes[4]]), 6);
        assert_eq!(decode(&bytes).unwrap(), geometry);
    }

    #[test]
    fn skips_ewkb_srid() {
        let mut bytes = vec![LITTLE_ENDIAN];
        bytes.extend_from_slice(&(WKB_POINT | EWKB_SRID).to_le_bytes());
        bytes.extend_from_slice(&4326u32.to_le_bytes());
        bytes.extend_from_slice(&10.0f64.to_le_bytes());
        bytes.extend_from_slice(&20.0f64.to_le_bytes());
        assert_eq!(
            decode(&bytes).unwrap(),
            Geometry::Point(point!(x: 10.0, y: 20.0))
        );
    }

    #[test]
    fn rejects_malformed_input() {
        let bytes = encode(&Geometry::Polygon(square()));
        assert!(matches!(
            decode(&bytes[..bytes.len() - 3]),
            Err(WkbError::Truncated(_))
        ));

        let mut trailing = bytes.clone();
        trailing.push(0);
        assert_eq!(decode(&trailing), Err(WkbError::TrailingBytes(1)));

        assert_eq!(decode(&[7]), Err(WkbError::ByteOrder(7)));

        let mut z_point = vec![LITTLE_ENDIAN];
        z_point.extend_from_slice(&1001u32.to_le_bytes());
        assert_eq!(decode(&z_point), Err(WkbError::Dimensions));

        let mut unknown = vec![LITTLE_ENDIAN];
        unknown.extend_from_slice(&17u32.to_le_bytes());
        assert_eq!(decode(&unknown), Err(WkbError::UnsupportedType(17)));
    }

    #[test]
    fn huge_counts_do_not_allocate() {
        let mut bytes = vec![LITTLE_ENDIAN];
        bytes.extend_from_slice(&WKB_LINE_STRING.to_le_bytes());
        bytes.extend_from_slice(&u32::MAX.to_le_bytes());
        assert!(matches!(decode(&bytes), Err(WkbError::Truncated(_))));
    }
}
