//! Coordinate reference systems understood by the geometry codec.
//!
//! Storage is always WGS84 (EPSG:4326). Incoming coordinates in Web
//! Mercator or a WGS84 UTM zone are reprojected before they are written.

use std::f64::consts::PI;
use std::fmt;
use std::str::FromStr;

use crate::error::{GeoLayerError, Result};

// WGS84 ellipsoid
const WGS84_A: f64 = 6_378_137.0;
const WGS84_F: f64 = 1.0 / 298.257_223_563;
const UTM_K0: f64 = 0.9996;
const UTM_FALSE_EASTING: f64 = 500_000.0;
const UTM_FALSE_NORTHING_SOUTH: f64 = 10_000_000.0;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Crs {
    /// EPSG:4326, coordinates are (longitude, latitude) in degrees.
    Wgs84,
    /// EPSG:3857, spherical Web Mercator in metres.
    WebMercator,
    /// EPSG:326xx (north) / 327xx (south).
    Utm { zone: u8, north: bool },
}

impl Crs {
    pub fn from_epsg(code: u32) -> Result<Self> {
        match code {
            4326 => Ok(Self::Wgs84),
            3857 | 900913 => Ok(Self::WebMercator),
            32601..=32660 => Ok(Self::Utm {
                zone: (code - 32600) as u8,
                north: true,
            }),
            32701..=32760 => Ok(Self::Utm {
                zone: (code - 32700) as u8,
                north: false,
            }),
            _ => Err(GeoLayerError::UnsupportedCrs(format!("EPSG:{code}"))),
        }
    }

    pub fn epsg(&self) -> u32 {
        match self {
            Self::Wgs84 => 4326,
            Self::WebMercator => 3857,
            Self::Utm { zone, north: true } => 32600 + *zone as u32,
            Self::Utm { zone, north: false } => 32700 + *zone as u32,
        }
    }

    /// Project (lng, lat) degrees into this system.
    fn project(&self, lng: f64, lat: f64) -> (f64, f64) {
        match *self {
            Self::Wgs84 => (lng, lat),
            Self::WebMercator => {
                let x = WGS84_A * lng.to_radians();
                let y = WGS84_A * (PI / 4.0 + lat.to_radians() / 2.0).tan().ln();
                (x, y)
            }
            Self::Utm { zone, north } => utm_forward(lng, lat, zone, north),
        }
    }

    /// Unproject coordinates of this system into (lng, lat) degrees.
    fn unproject(&self, x: f64, y: f64) -> (f64, f64) {
        match *self {
            Self::Wgs84 => (x, y),
            Self::WebMercator => {
                let lng = (x / WGS84_A).to_degrees();
                let lat = (2.0 * (y / WGS84_A).exp().atan() - PI / 2.0).to_degrees();
                (lng, lat)
            }
            Self::Utm { zone, north } => utm_inverse(x, y, zone, north),
        }
    }
}

impl fmt::Display for Crs {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "EPSG:{}", self.epsg())
    }
}

impl FromStr for Crs {
    type Err = GeoLayerError;

    /// Accepts `EPSG:n`, `urn:ogc:def:crs:EPSG::n`, OGC `CRS84` names and bare codes.
    fn from_str(s: &str) -> Result<Self> {
        let s = s.trim();
        if s.to_ascii_uppercase().ends_with("CRS84") {
            return Ok(Self::Wgs84);
        }
        let code = s.rsplit(':').next().unwrap_or(s);
        code.parse::<u32>()
            .map_err(|_| GeoLayerError::UnsupportedCrs(s.to_string()))
            .and_then(Self::from_epsg)
    }
}

/// Transform a single coordinate between two reference systems.
///
/// Geographic systems use (longitude, latitude) order.
pub fn coordinate_transform(x: f64, y: f64, from: Crs, to: Crs) -> Result<(f64, f64)> {
    if !x.is_finite() || !y.is_finite() {
        return Err(GeoLayerError::InvalidGeometry(format!(
            "non-finite coordinate ({x}, {y})"
        )));
    }
    if from == to {
        return Ok((x, y));
    }
    let (lng, lat) = from.unproject(x, y);
    Ok(to.project(lng, lat))
}

/// EPSG code assumed for bare projected coordinates (WGS84 / UTM zone 47N).
pub const DEFAULT_SOURCE_EPSG: u32 = 32647;

/// Convert UTM zone 47N coordinates to `(lng, lat)`.
///
/// Use [`coordinate_transform`] for any other source system.
pub fn utm_to_lat_lng(x: f64, y: f64) -> Result<(f64, f64)> {
    coordinate_transform(x, y, Crs::from_epsg(DEFAULT_SOURCE_EPSG)?, Crs::Wgs84)
}

fn central_meridian(zone: u8) -> f64 {
    (zone as f64 - 1.0) * 6.0 - 180.0 + 3.0
}

// Transverse Mercator series, cf. Snyder, "Map Projections: A Working Manual", p. 61.
fn utm_forward(lng: f64, lat: f64, zone: u8, north: bool) -> (f64, f64) {
    let e2 = WGS84_F * (2.0 - WGS84_F);
    let ep2 = e2 / (1.0 - e2);
    let phi = lat.to_radians();
    let (sin_phi, cos_phi) = phi.sin_cos();
    let tan_phi = phi.tan();

    let n = WGS84_A / (1.0 - e2 * sin_phi * sin_phi).sqrt();
    let t = tan_phi * tan_phi;
    let c = ep2 * cos_phi * cos_phi;
    let a = cos_phi * (lng - central_meridian(zone)).to_radians();
    let m = meridian_arc(phi, e2);

    let x = UTM_K0
        * n
        * (a + (1.0 - t + c) * a.powi(3) / 6.0
            + (5.0 - 18.0 * t + t * t + 72.0 * c - 58.0 * ep2) * a.powi(5) / 120.0)
        + UTM_FALSE_EASTING;
    let mut y = UTM_K0
        * (m + n
            * tan_phi
            * (a * a / 2.0
                + (5.0 - t + 9.0 * c + 4.0 * c * c) * a.powi(4) / 24.0
                + (61.0 - 58.0 * t + t * t + 600.0 * c - 330.0 * ep2) * a.powi(6) / 720.0));
    if !north {
        y += UTM_FALSE_NORTHING_SOUTH;
    }
    (x, y)
}

fn utm_inverse(x: f64, y: f64, zone: u8, north: bool) -> (f64, f64) {
    let e2 = WGS84_F * (2.0 - WGS84_F);
    let ep2 = e2 / (1.0 - e2);
    let x = x - UTM_FALSE_EASTING;
    let y = if north { y } else { y - UTM_FALSE_NORTHING_SOUTH };

    let m = y / UTM_K0;
    let mu = m / (WGS84_A * (1.0 - e2 / 4.0 - 3.0 * e2 * e2 / 64.0 - 5.0 * e2.powi(3) / 256.0));
    let e1 = (1.0 - (1.0 - e2).sqrt()) / (1.0 + (1.0 - e2).sqrt());
    let phi1 = mu
        + (3.0 * e1 / 2.0 - 27.0 * e1.powi(3) / 32.0) * (2.0 * mu).sin()
        + (21.0 * e1 * e1 / 16.0 - 55.0 * e1.powi(4) / 32.0) * (4.0 * mu).sin()
        + (151.0 * e1.powi(3) / 96.0) * (6.0 * mu).sin()
        + (1097.0 * e1.powi(4) / 512.0) * (8.0 * mu).sin();

    let (sin_phi1, cos_phi1) = phi1.sin_cos();
    let tan_phi1 = phi1.tan();
    let n1 = WGS84_A / (1.0 - e2 * sin_phi1 * sin_phi1).sqrt();
    let t1 = tan_phi1 * tan_phi1;
    let c1 = ep2 * cos_phi1 * cos_phi1;
    let r1 = WGS84_A * (1.0 - e2) / (1.0 - e2 * sin_phi1 * sin_phi1).powf(1.5);
    let d = x / (n1 * UTM_K0);

    let phi = phi1
        - (n1 * tan_phi1 / r1)
            * (d * d / 2.0
                - (5.0 + 3.0 * t1 + 10.0 * c1 - 4.0 * c1 * c1 - 9.0 * ep2) * d.powi(4) / 24.0
                + (61.0 + 90.0 * t1 + 298.0 * c1 + 45.0 * t1 * t1 - 252.0 * ep2 - 3.0 * c1 * c1)
                    * d.powi(6)
                    / 720.0);
    let lambda = (d - (1.0 + 2.0 * t1 + c1) * d.powi(3) / 6.0
        + (5.0 - 2.0 * c1 + 28.0 * t1 - 3.0 * c1 * c1 + 8.0 * ep2 + 24.0 * t1 * t1) * d.powi(5)
            / 120.0)
        / cos_phi1;

    (central_meridian(zone) + lambda.to_degrees(), phi.to_degrees())
}

fn meridian_arc(phi: f64, e2: f64) -> f64 {
    let e4 = e2 * e2;
    let e6 = e4 * e2;
    WGS84_A
        * ((1.0 - e2 / 4.0 - 3.0 * e4 / 64.0 - 5.0 * e6 / 256.0) * phi
            - (3.0 * e2 / 8.0 + 3.0 * e4 / 32.0 + 45.0 * e6 / 1024.0) * (2.0 * phi).sin()
            + (15.0 * e4 / 256.0 + 45.0 * e6 / 1024.0) * (4.0 * phi).sin()
            - (35.0 * e6 / 3072.0) * (6.0 * phi).sin())
}
