use chrono::NaiveDateTime;
use serde::Serialize;
use std::fmt;
use std::str::FromStr;

use crate::error::GeoLayerError;

/// Geometry kind of a layer. Fixed for the lifetime of the layer.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum LayerType {
    Point,
    LineString,
    Polygon,
}

impl LayerType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Point => "point",
            Self::LineString => "linestring",
            Self::Polygon => "polygon",
        }
    }
}

impl fmt::Display for LayerType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for LayerType {
    type Err = GeoLayerError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim();
        if s.eq_ignore_ascii_case("point") {
            Ok(Self::Point)
        } else if s.eq_ignore_ascii_case("linestring") {
            Ok(Self::LineString)
        } else if s.eq_ignore_ascii_case("polygon") {
            Ok(Self::Polygon)
        } else {
            Err(GeoLayerError::InvalidLayerType(s.to_string()))
        }
    }
}

/// Column type as the operator sees it.
///
/// `file` and `varchar` are accepted on input and stored as `text`.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum LogicalType {
    Text,
    Integer,
    Numeric,
    Decimal,
    Date,
    Boolean,
}

impl LogicalType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Text => "text",
            Self::Integer => "integer",
            Self::Numeric => "numeric",
            Self::Decimal => "decimal",
            Self::Date => "date",
            Self::Boolean => "boolean",
        }
    }

    /// Numeric columns are summed by aggregations, the others are counted.
    pub fn is_numeric(&self) -> bool {
        matches!(self, Self::Integer | Self::Numeric | Self::Decimal)
    }
}

impl fmt::Display for LogicalType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for LogicalType {
    type Err = GeoLayerError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "text" | "varchar" | "file" => Ok(Self::Text),
            "integer" => Ok(Self::Integer),
            "numeric" => Ok(Self::Numeric),
            "decimal" => Ok(Self::Decimal),
            "date" => Ok(Self::Date),
            "boolean" => Ok(Self::Boolean),
            _ => Err(GeoLayerError::UnsupportedType(s.to_string())),
        }
    }
}

/// A catalog row describing one layer.
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct LayerDefinition {
    pub formid: String,
    pub layername: String,
    pub division: String,
    pub layertype: LayerType,
    pub created_at: NaiveDateTime,
}

/// A catalog row describing one attribute column of a layer.
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct ColumnDefinition {
    pub formid: String,
    pub col_id: String,
    pub col_name: String,
    pub col_type: LogicalType,
    pub col_desc: String,
}

/// Column requested by a caller before an id has been allocated.
#[derive(Clone, Debug)]
pub struct NewColumn {
    pub name: String,
    pub column_type: LogicalType,
    pub desc: String,
}

impl NewColumn {
    pub fn new(name: impl Into<String>, column_type: LogicalType) -> Self {
        Self {
            name: name.into(),
            column_type,
            desc: String::new(),
        }
    }
}

/// Which catalog layers a caller may see.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum LayerFilter {
    All,
    Division(String),
    Nothing,
}

impl LayerFilter {
    /// `admin` sees every layer, `user` sees none, any other role sees its
    /// own division.
    pub fn for_role(role: &str, division: &str) -> Self {
        match role {
            "admin" => Self::All,
            "user" => Self::Nothing,
            _ => Self::Division(division.to_string()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_layer_types_case_insensitively() {
        assert_eq!("Point".parse::<LayerType>().ok(), Some(LayerType::Point));
        assert_eq!(
            "LINESTRING".parse::<LayerType>().ok(),
            Some(LayerType::LineString)
        );
        assert!(matches!(
            "multipoint".parse::<LayerType>(),
            Err(GeoLayerError::InvalidLayerType(_))
        ));
    }

    #[test]
    fn file_and_varchar_are_text() {
        assert_eq!("file".parse::<LogicalType>().ok(), Some(LogicalType::Text));
        assert_eq!("varchar".parse::<LogicalType>().ok(), Some(LogicalType::Text));
        assert!(matches!(
            "blob".parse::<LogicalType>(),
            Err(GeoLayerError::UnsupportedType(_))
        ));
    }

    #[test]
    fn role_filters() {
        assert_eq!(LayerFilter::for_role("admin", "x"), LayerFilter::All);
        assert_eq!(LayerFilter::for_role("user", "x"), LayerFilter::Nothing);
        assert_eq!(
            LayerFilter::for_role("editor", "north"),
            LayerFilter::Division("north".to_string())
        );
    }
}
