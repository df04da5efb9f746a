//! Conversion between boundary geometry formats and stored values.
//!
//! Callers hand over GeoJSON or WKT. Stored values are GeoPackage geometry
//! blobs (GP header + SRS id + WKB) whose SRS is always EPSG:4326.

use geo_traits::to_geo::ToGeoGeometry;
use geo_traits::{CoordTrait, GeometryTrait, LineStringTrait, PointTrait, PolygonTrait};
use geo_types::{Coord, Geometry, LineString, Point, Polygon};
use geojson::GeoJson;
use serde_json::Value as Json;
use std::str::FromStr;
use wkb::reader::Wkb;
use wkt::Wkt;

use crate::crs::{Crs, coordinate_transform};
use crate::error::{GeoLayerError, Result};
use crate::ogc_sql::SRS_ID_WGS84;
use crate::types::LayerType;

const GPKG_HEADER_LEN: usize = 8;

/// Geometry as received from a caller.
#[derive(Clone, Debug, PartialEq)]
pub enum GeometryPayload {
    /// A GeoJSON geometry object, or a `Feature` wrapping one.
    GeoJson(Json),
    /// Well-known text, optionally with an EWKT `SRID=n;` prefix.
    Wkt(String),
}

impl GeometryPayload {
    /// Treat text starting with `{` as GeoJSON and anything else as WKT.
    pub fn parse(text: &str) -> Result<Self> {
        let trimmed = text.trim();
        if trimmed.starts_with('{') {
            Ok(Self::GeoJson(serde_json::from_str(trimmed)?))
        } else {
            Ok(Self::Wkt(trimmed.to_string()))
        }
    }
}

impl From<Json> for GeometryPayload {
    fn from(value: Json) -> Self {
        Self::GeoJson(value)
    }
}

/// Decode a payload into a stored geometry blob for a layer of `layer_type`.
///
/// Coordinates in another supported CRS are reprojected to WGS84.
pub fn decode_feature_geometry(payload: &GeometryPayload, layer_type: LayerType) -> Result<Vec<u8>> {
    let geometry = match payload {
        GeometryPayload::GeoJson(value) => geojson_to_geometry(value, layer_type)?,
        GeometryPayload::Wkt(text) => wkt_to_geometry(text, layer_type)?,
    };
    validate(&geometry)?;
    geometry_to_blob(&geometry)
}

/// Render a stored geometry blob as a GeoJSON geometry object.
///
/// Coordinates are always written as JSON floats, so a decode/encode round
/// trip is equal by numeric value: `[4, 0]` comes back as `[4.0, 0.0]`.
pub fn encode_feature_geometry(blob: &[u8]) -> Result<Json> {
    let wkb = gpkg_geometry_to_wkb(blob)?;
    let geometry: Geometry<f64> = wkb
        .try_to_geometry()
        .ok_or_else(|| invalid("an empty geometry has no GeoJSON form"))?;
    let geometry = geojson::Geometry::new(geojson::Value::from(&geometry));
    Ok(serde_json::to_value(&geometry)?)
}

/// Render a stored geometry blob as WKT.
pub fn encode_wkt(blob: &[u8]) -> Result<String> {
    let wkb = gpkg_geometry_to_wkb(blob)?;
    let mut out = String::new();
    wkt::to_wkt::write_geometry(&mut out, &wkb)
        .map_err(|err| GeoLayerError::InvalidGeometry(err.to_string()))?;
    Ok(out)
}

/// A WGS84 point blob.
pub(crate) fn point_blob(x: f64, y: f64) -> Result<Vec<u8>> {
    geometry_to_blob(&Geometry::Point(Point::new(x, y)))
}

fn geometry_to_blob(geometry: &Geometry<f64>) -> Result<Vec<u8>> {
    let mut buf = Vec::new();
    wkb::writer::write_geometry(&mut buf, geometry, &Default::default())?;
    let wkb = Wkb::try_new(&buf)?;
    wkb_to_gpkg_geometry(wkb, SRS_ID_WGS84)
}

fn mismatch(expected: LayerType, actual: &str) -> GeoLayerError {
    GeoLayerError::GeometryTypeMismatch {
        expected,
        actual: actual.to_string(),
    }
}

fn invalid(message: impl Into<String>) -> GeoLayerError {
    GeoLayerError::InvalidGeometry(message.into())
}

fn geojson_crs(value: &Json) -> Result<Option<Crs>> {
    value
        .get("crs")
        .and_then(|crs| crs.get("properties"))
        .and_then(|props| props.get("name"))
        .and_then(Json::as_str)
        .map(Crs::from_str)
        .transpose()
}

fn geojson_to_geometry(value: &Json, layer_type: LayerType) -> Result<Geometry<f64>> {
    let outer_crs = geojson_crs(value)?;
    let inner_crs = match value.get("geometry") {
        Some(geometry) => geojson_crs(geometry)?,
        None => None,
    };
    let crs = inner_crs.or(outer_crs).unwrap_or(Crs::Wgs84);

    let geometry = match GeoJson::from_json_value(value.clone()).map_err(|err| invalid(err.to_string()))? {
        GeoJson::Geometry(geometry) => geometry,
        GeoJson::Feature(feature) => feature
            .geometry
            .ok_or_else(|| invalid("feature has no geometry"))?,
        GeoJson::FeatureCollection(_) => {
            return Err(invalid("expected a geometry or a feature, got a FeatureCollection"));
        }
    };
    check_shape(&geometry.value, layer_type)?;
    let geometry = Geometry::<f64>::try_from(geometry).map_err(|err| invalid(err.to_string()))?;
    reproject(geometry, crs)
}

fn geojson_type_name(value: &geojson::Value) -> &'static str {
    match value {
        geojson::Value::Point(_) => "Point",
        geojson::Value::MultiPoint(_) => "MultiPoint",
        geojson::Value::LineString(_) => "LineString",
        geojson::Value::MultiLineString(_) => "MultiLineString",
        geojson::Value::Polygon(_) => "Polygon",
        geojson::Value::MultiPolygon(_) => "MultiPolygon",
        geojson::Value::GeometryCollection(_) => "GeometryCollection",
    }
}

/// Positions are checked before conversion, which would close open rings.
fn check_shape(value: &geojson::Value, layer_type: LayerType) -> Result<()> {
    match (value, layer_type) {
        (geojson::Value::Point(position), LayerType::Point) => check_position(position),
        (geojson::Value::LineString(line), LayerType::LineString) => {
            line.iter().try_for_each(|position| check_position(position))
        }
        (geojson::Value::Polygon(rings), LayerType::Polygon) => {
            if rings.is_empty() {
                return Err(invalid("polygon has no exterior ring"));
            }
            rings.iter().try_for_each(|ring| check_ring(ring))
        }
        (other, _) => Err(mismatch(layer_type, geojson_type_name(other))),
    }
}

fn check_position(position: &[f64]) -> Result<()> {
    if position.len() < 2 {
        return Err(invalid(format!("invalid position: {position:?}")));
    }
    Ok(())
}

fn check_ring(ring: &[Vec<f64>]) -> Result<()> {
    ring.iter().try_for_each(|position| check_position(position))?;
    if ring.len() < 4 {
        return Err(invalid("a polygon ring needs at least four positions"));
    }
    if ring.first() != ring.last() {
        return Err(invalid("a polygon ring must be closed"));
    }
    Ok(())
}

fn reproject(geometry: Geometry<f64>, crs: Crs) -> Result<Geometry<f64>> {
    match geometry {
        Geometry::Point(point) => Ok(Point::from(to_wgs84(point.x(), point.y(), crs)?).into()),
        Geometry::LineString(line) => Ok(LineString::new(ring_coords(&line, crs)?).into()),
        Geometry::Polygon(polygon) => {
            let exterior = LineString::new(ring_coords(polygon.exterior(), crs)?);
            let interiors = polygon
                .interiors()
                .iter()
                .map(|ring| ring_coords(ring, crs).map(LineString::new))
                .collect::<Result<Vec<_>>>()?;
            Ok(Polygon::new(exterior, interiors).into())
        }
        other => Err(invalid(format!("{} is not a layer geometry", type_name(&other)))),
    }
}

fn to_wgs84(x: f64, y: f64, crs: Crs) -> Result<Coord<f64>> {
    let (x, y) = coordinate_transform(x, y, crs, Crs::Wgs84)?;
    Ok(Coord { x, y })
}

/// Split an EWKT `SRID=n;` prefix off the text.
fn split_ewkt(text: &str) -> Result<(Crs, &str)> {
    let trimmed = text.trim();
    let has_prefix = trimmed
        .get(..5)
        .is_some_and(|p| p.eq_ignore_ascii_case("SRID="));
    if !has_prefix {
        return Ok((Crs::Wgs84, trimmed));
    }
    let (srid, body) = trimmed[5..]
        .split_once(';')
        .ok_or_else(|| invalid("EWKT prefix without ';'"))?;
    let code = srid
        .trim()
        .parse::<u32>()
        .map_err(|_| GeoLayerError::UnsupportedCrs(srid.to_string()))?;
    Ok((Crs::from_epsg(code)?, body))
}

fn wkt_to_geometry(text: &str, layer_type: LayerType) -> Result<Geometry<f64>> {
    let (crs, body) = split_ewkt(text)?;
    let wkt = Wkt::<f64>::from_str(body).map_err(|err| invalid(err.to_string()))?;
    traits_to_geometry(&wkt, layer_type, crs)
}

fn type_name<G: GeometryTrait<T = f64>>(geom: &G) -> &'static str {
    use geo_traits::GeometryType as GeoType;
    match geom.as_type() {
        GeoType::Point(_) => "Point",
        GeoType::LineString(_) => "LineString",
        GeoType::Polygon(_) => "Polygon",
        GeoType::MultiPoint(_) => "MultiPoint",
        GeoType::MultiLineString(_) => "MultiLineString",
        GeoType::MultiPolygon(_) => "MultiPolygon",
        GeoType::GeometryCollection(_) => "GeometryCollection",
        GeoType::Rect(_) => "Rect",
        GeoType::Triangle(_) => "Triangle",
        GeoType::Line(_) => "Line",
    }
}

fn ring_coords<L: LineStringTrait<T = f64>>(line: &L, crs: Crs) -> Result<Vec<Coord<f64>>> {
    line.coords()
        .map(|c| {
            let (x, y) = c.x_y();
            to_wgs84(x, y, crs)
        })
        .collect()
}

fn traits_to_geometry<G: GeometryTrait<T = f64>>(
    geom: &G,
    layer_type: LayerType,
    crs: Crs,
) -> Result<Geometry<f64>> {
    use geo_traits::GeometryType as GeoType;

    match (geom.as_type(), layer_type) {
        (GeoType::Point(point), LayerType::Point) => {
            let coord = point.coord().ok_or_else(|| invalid("empty point"))?;
            let (x, y) = coord.x_y();
            Ok(Point::from(to_wgs84(x, y, crs)?).into())
        }
        (GeoType::LineString(line), LayerType::LineString) => {
            Ok(LineString::new(ring_coords(line, crs)?).into())
        }
        (GeoType::Polygon(poly), LayerType::Polygon) => {
            let exterior = poly
                .exterior()
                .ok_or_else(|| invalid("polygon has no exterior ring"))?;
            let exterior = ring(ring_coords(&exterior, crs)?)?;
            let interiors = poly
                .interiors()
                .map(|r| ring_coords(&r, crs).and_then(ring))
                .collect::<Result<Vec<_>>>()?;
            Ok(Polygon::new(exterior, interiors).into())
        }
        _ => Err(mismatch(layer_type, type_name(geom))),
    }
}

/// A polygon ring: at least four positions, first equal to last.
fn ring(coords: Vec<Coord<f64>>) -> Result<LineString<f64>> {
    if coords.len() < 4 {
        return Err(invalid("a polygon ring needs at least four positions"));
    }
    if coords.first() != coords.last() {
        return Err(invalid("a polygon ring must be closed"));
    }
    Ok(LineString::new(coords))
}

fn validate(geometry: &Geometry<f64>) -> Result<()> {
    match geometry {
        Geometry::LineString(line) if line.0.len() < 2 => {
            Err(invalid("a linestring needs at least two positions"))
        }
        _ => Ok(()),
    }
}

/// Strip GeoPackage header and envelope bytes to access raw WKB.
// cf. https://www.geopackage.org/spec140/index.html#gpb_format
pub(crate) fn gpkg_geometry_to_wkb(b: &[u8]) -> Result<Wkb<'_>> {
    if b.len() < GPKG_HEADER_LEN {
        return Err(GeoLayerError::InvalidGpkgGeometryLength {
            len: b.len(),
            minimum: GPKG_HEADER_LEN,
        });
    }
    let flags = b[3];
    let envelope_size: usize = match flags & 0b00001110 {
        0b00000000 => 0,  // no envelope
        0b00000010 => 32, // envelope is [minx, maxx, miny, maxy], 32 bytes
        0b00000100 => 48, // envelope is [minx, maxx, miny, maxy, minz, maxz], 48 bytes
        0b00000110 => 48, // envelope is [minx, maxx, miny, maxy, minm, maxm], 48 bytes
        0b00001000 => 64, // envelope is [minx, maxx, miny, maxy, minz, maxz, minm, maxm], 64 bytes
        _ => {
            return Err(GeoLayerError::InvalidGpkgGeometryFlags(flags));
        }
    };
    let offset = GPKG_HEADER_LEN + envelope_size;
    if b.len() < offset {
        return Err(GeoLayerError::InvalidGpkgGeometryLength {
            len: b.len(),
            minimum: offset,
        });
    }

    Ok(Wkb::try_new(&b[offset..])?)
}

// cf. https://www.geopackage.org/spec140/index.html#gpb_format
pub(crate) fn wkb_to_gpkg_geometry(wkb: Wkb<'_>, srs_id: u32) -> Result<Vec<u8>> {
    let mut geom = Vec::with_capacity(wkb.buf().len() + GPKG_HEADER_LEN);
    geom.extend_from_slice(&[
        0x47u8, // magic
        0x50u8, // magic
        0x00u8, // version
        0x01u8, // flags (little endian SRS ID, no envelope)
    ]);
    geom.extend_from_slice(&srs_id.to_le_bytes());
    geom.extend_from_slice(wkb.buf());

    Ok(geom)
}
