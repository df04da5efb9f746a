use crate::error::Result;
use crate::geometry::{gpkg_geometry_to_wkb, point_blob};
use geo_traits::{CoordTrait, GeometryTrait, LineStringTrait, PointTrait, PolygonTrait};
use rusqlite::functions::{Context, FunctionFlags};
use rusqlite::types::{Type, ValueRef};
use rusqlite::{Connection, Error};
use wkb::reader::Wkb;

#[derive(Clone, Copy)]
struct Bounds {
    minx: f64,
    maxx: f64,
    miny: f64,
    maxy: f64,
}

impl Bounds {
    fn of<C: CoordTrait<T = f64>>(coords: impl Iterator<Item = C>) -> Option<Self> {
        coords.map(|c| c.x_y()).fold(None, |bounds, (x, y)| {
            Some(match bounds {
                None => Bounds {
                    minx: x,
                    maxx: x,
                    miny: y,
                    maxy: y,
                },
                Some(b) => Bounds {
                    minx: b.minx.min(x),
                    maxx: b.maxx.max(x),
                    miny: b.miny.min(y),
                    maxy: b.maxy.max(y),
                },
            })
        })
    }
}

/// Register the spatial SQL helper functions on a connection.
///
/// The R-tree triggers of every feature table call the bounds functions, so
/// each pooled connection gets them before it touches a layer.
///
/// Example:
/// ```no_run
/// use rusqlite::Connection;
/// use rusqlite_geolayer::register_spatial_functions;
///
/// let conn = Connection::open_in_memory()?;
/// register_spatial_functions(&conn)?;
/// let blob: Vec<u8> = conn.query_row("SELECT ST_MakePoint(99.0, 18.5)", [], |row| row.get(0))?;
/// # Ok::<(), rusqlite_geolayer::GeoLayerError>(())
/// ```
pub fn register_spatial_functions(conn: &Connection) -> Result<()> {
    register_st_makepoint(conn)?;
    register_st_minx(conn)?;
    register_st_miny(conn)?;
    register_st_maxx(conn)?;
    register_st_maxy(conn)?;
    register_st_isempty(conn)?;
    Ok(())
}

pub(crate) fn register_st_minx(conn: &Connection) -> Result<()> {
    register_bounds_component(conn, "ST_MinX", |b| b.minx)
}

pub(crate) fn register_st_miny(conn: &Connection) -> Result<()> {
    register_bounds_component(conn, "ST_MinY", |b| b.miny)
}

pub(crate) fn register_st_maxx(conn: &Connection) -> Result<()> {
    register_bounds_component(conn, "ST_MaxX", |b| b.maxx)
}

pub(crate) fn register_st_maxy(conn: &Connection) -> Result<()> {
    register_bounds_component(conn, "ST_MaxY", |b| b.maxy)
}

pub(crate) fn register_st_isempty(conn: &Connection) -> Result<()> {
    conn.create_scalar_function(
        "ST_IsEmpty",
        1,
        FunctionFlags::SQLITE_DETERMINISTIC,
        |ctx| {
            let wkb = match wkb_from_ctx(ctx)? {
                Some(wkb) => wkb,
                None => return Ok(None),
            };
            let is_empty = bounds_from_geometry(&wkb).is_none();
            Ok(Some(i64::from(is_empty)))
        },
    )?;
    Ok(())
}

/// `ST_MakePoint(x, y)`: a WGS84 point geometry, NULL if either input is NULL.
pub(crate) fn register_st_makepoint(conn: &Connection) -> Result<()> {
    conn.create_scalar_function(
        "ST_MakePoint",
        2,
        FunctionFlags::SQLITE_DETERMINISTIC,
        |ctx| {
            let (Some(x), Some(y)) = (ctx.get::<Option<f64>>(0)?, ctx.get::<Option<f64>>(1)?)
            else {
                return Ok(None);
            };
            let blob = point_blob(x, y).map_err(|err| Error::UserFunctionError(Box::new(err)))?;
            Ok(Some(blob))
        },
    )?;
    Ok(())
}

fn register_bounds_component<F>(conn: &Connection, name: &str, f: F) -> Result<()>
where
    F: Fn(Bounds) -> f64 + Copy + Send + Sync + 'static,
{
    conn.create_scalar_function(name, 1, FunctionFlags::SQLITE_DETERMINISTIC, move |ctx| {
        let wkb = match wkb_from_ctx(ctx)? {
            Some(wkb) => wkb,
            None => return Ok(None),
        };
        Ok(bounds_from_geometry(&wkb).map(f))
    })?;
    Ok(())
}

fn wkb_from_ctx<'a>(ctx: &'a Context<'a>) -> std::result::Result<Option<Wkb<'a>>, Error> {
    let value = ctx.get_raw(0);
    match value {
        ValueRef::Null => Ok(None),
        ValueRef::Blob(blob) => {
            let wkb = gpkg_geometry_to_wkb(blob)
                .map_err(|err| Error::UserFunctionError(Box::new(err)))?;
            Ok(Some(wkb))
        }
        _ => Err(Error::InvalidFunctionParameterType(0, Type::Blob)),
    }
}

/// Bounds of a layer geometry. Empty geometries and shapes no layer stores
/// have none, so the R-tree skips them.
fn bounds_from_geometry<G: GeometryTrait<T = f64>>(geom: &G) -> Option<Bounds> {
    use geo_traits::GeometryType as GeoType;

    match geom.as_type() {
        GeoType::Point(point) => point.coord().and_then(|coord| Bounds::of(std::iter::once(coord))),
        GeoType::LineString(line) => Bounds::of(line.coords()),
        // Interior rings lie inside the exterior.
        GeoType::Polygon(poly) => poly.exterior().and_then(|ring| Bounds::of(ring.coords())),
        _ => None,
    }
}
