use chrono::{NaiveDate, NaiveDateTime};
use rusqlite::types::{Type, Value};

use crate::error::{GeoLayerError, Result};
use crate::ogc_sql::TS_FORMAT;
use crate::types::{LayerType, LogicalType};

#[inline]
pub(crate) fn geometry_type_to_str(geometry_type: wkb::reader::GeometryType) -> &'static str {
    match geometry_type {
        wkb::reader::GeometryType::GeometryCollection => "GEOMETRYCOLLECTION",
        wkb::reader::GeometryType::Point => "POINT",
        wkb::reader::GeometryType::LineString => "LINESTRING",
        wkb::reader::GeometryType::Polygon => "POLYGON",
        wkb::reader::GeometryType::MultiPoint => "MULTIPOINT",
        wkb::reader::GeometryType::MultiLineString => "MULTILINESTRING",
        wkb::reader::GeometryType::MultiPolygon => "MULTIPOLYGON",
        _ => "GEOMETRY",
    }
}

#[inline]
pub(crate) fn layer_type_to_geometry_type(layer_type: LayerType) -> wkb::reader::GeometryType {
    match layer_type {
        LayerType::Point => wkb::reader::GeometryType::Point,
        LayerType::LineString => wkb::reader::GeometryType::LineString,
        LayerType::Polygon => wkb::reader::GeometryType::Polygon,
    }
}

/// Declared SQLite type of the geometry column, e.g. `POINT`.
#[inline]
pub(crate) fn layer_type_to_column_type(layer_type: LayerType) -> &'static str {
    geometry_type_to_str(layer_type_to_geometry_type(layer_type))
}

/// Map a logical column type to the declared physical type.
#[inline]
pub fn logical_type_to_physical(logical: LogicalType) -> &'static str {
    match logical {
        LogicalType::Text => "TEXT",
        LogicalType::Integer => "INTEGER",
        LogicalType::Numeric | LogicalType::Decimal => "NUMERIC",
        LogicalType::Date => "DATE",
        LogicalType::Boolean => "BOOLEAN",
    }
}

/// Map a caller-supplied logical type name straight to its physical type.
pub fn map_logical_type(logical: &str) -> Result<&'static str> {
    Ok(logical_type_to_physical(logical.parse()?))
}

/// Coerce a form value into the SQL value stored for `logical`.
pub(crate) fn coerce_value(col_id: &str, logical: LogicalType, raw: &str) -> Result<Value> {
    let invalid = |expected: &'static str| GeoLayerError::InvalidValue {
        col_id: col_id.to_string(),
        expected,
        value: raw.to_string(),
    };

    let trimmed = raw.trim();
    match logical {
        LogicalType::Text => Ok(Value::Text(raw.to_string())),
        LogicalType::Integer => trimmed
            .parse::<i64>()
            .map(Value::Integer)
            .map_err(|_| invalid("integer")),
        LogicalType::Numeric | LogicalType::Decimal => trimmed
            .parse::<f64>()
            .ok()
            .filter(|v| v.is_finite())
            .map(Value::Real)
            .ok_or_else(|| invalid("number")),
        LogicalType::Date => NaiveDate::parse_from_str(trimmed, "%Y-%m-%d")
            .map(|date| Value::Text(date.format("%Y-%m-%d").to_string()))
            .map_err(|_| invalid("date")),
        LogicalType::Boolean => match trimmed.to_ascii_lowercase().as_str() {
            "true" | "t" | "yes" | "1" => Ok(Value::Integer(1)),
            "false" | "f" | "no" | "0" => Ok(Value::Integer(0)),
            _ => Err(invalid("boolean")),
        },
    }
}

/// Parse a stored `ts` value read from result column `idx`.
pub(crate) fn parse_timestamp(idx: usize, text: &str) -> rusqlite::Result<NaiveDateTime> {
    NaiveDateTime::parse_from_str(text, TS_FORMAT)
        .map_err(|err| rusqlite::Error::FromSqlConversionFailure(idx, Type::Text, Box::new(err)))
}

/// Parse a catalog text field into one of the enums, e.g. `LayerType`.
pub(crate) fn parse_catalog_field<T>(idx: usize, text: &str) -> rusqlite::Result<T>
where
    T: std::str::FromStr<Err = GeoLayerError>,
{
    text.parse()
        .map_err(|err| rusqlite::Error::FromSqlConversionFailure(idx, Type::Text, Box::new(err)))
}

/// Render a stored value as JSON, using the catalog type to restore booleans.
pub(crate) fn value_to_json(value: Value, logical: Option<LogicalType>) -> serde_json::Value {
    match (value, logical) {
        (Value::Null, _) => serde_json::Value::Null,
        (Value::Integer(v), Some(LogicalType::Boolean)) => serde_json::Value::Bool(v != 0),
        // NUMERIC affinity stores whole reals as integers.
        (Value::Integer(v), Some(LogicalType::Numeric | LogicalType::Decimal)) => {
            value_to_json(Value::Real(v as f64), logical)
        }
        (Value::Integer(v), _) => serde_json::Value::from(v),
        (Value::Real(v), _) => serde_json::Number::from_f64(v)
            .map(serde_json::Value::Number)
            .unwrap_or(serde_json::Value::Null),
        (Value::Text(v), _) => serde_json::Value::String(v),
        // Attribute columns never hold blobs.
        (Value::Blob(_), _) => serde_json::Value::Null,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn maps_logical_types() -> Result<()> {
        assert_eq!(map_logical_type("text")?, "TEXT");
        assert_eq!(map_logical_type("integer")?, "INTEGER");
        assert_eq!(map_logical_type("decimal")?, "NUMERIC");
        assert_eq!(map_logical_type("numeric")?, "NUMERIC");
        assert_eq!(map_logical_type("date")?, "DATE");
        assert_eq!(map_logical_type("boolean")?, "BOOLEAN");
        assert_eq!(map_logical_type("file")?, "TEXT");
        assert!(matches!(
            map_logical_type("geometry"),
            Err(GeoLayerError::UnsupportedType(_))
        ));
        Ok(())
    }

    #[test]
    fn coerces_form_values() -> Result<()> {
        assert_eq!(
            coerce_value("c", LogicalType::Integer, " 42 ")?,
            Value::Integer(42)
        );
        assert_eq!(
            coerce_value("c", LogicalType::Numeric, "2.5")?,
            Value::Real(2.5)
        );
        assert_eq!(
            coerce_value("c", LogicalType::Boolean, "Yes")?,
            Value::Integer(1)
        );
        assert_eq!(
            coerce_value("c", LogicalType::Date, "2024-02-01")?,
            Value::Text("2024-02-01".to_string())
        );

        let err = coerce_value("c", LogicalType::Integer, "abc").expect_err("not an integer");
        assert!(matches!(err, GeoLayerError::InvalidValue { expected: "integer", .. }));
        let err = coerce_value("c", LogicalType::Date, "01/02/2024").expect_err("not a date");
        assert!(matches!(err, GeoLayerError::InvalidValue { expected: "date", .. }));
        Ok(())
    }

    #[test]
    fn booleans_render_as_json_booleans() {
        assert_eq!(
            value_to_json(Value::Integer(1), Some(LogicalType::Boolean)),
            serde_json::Value::Bool(true)
        );
        assert_eq!(
            value_to_json(Value::Integer(1), Some(LogicalType::Integer)),
            serde_json::json!(1)
        );
        assert_eq!(
            value_to_json(Value::Integer(8), Some(LogicalType::Numeric)),
            serde_json::json!(8.0)
        );
    }
}
