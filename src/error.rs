use std::time::Duration;
use thiserror::Error;

use crate::types::LayerType;

/// Crate error type for catalog, schema and feature operations.
#[derive(Debug, Error)]
pub enum GeoLayerError {
    /// Wraps errors returned by `rusqlite`.
    #[error("{0}")]
    Sql(#[from] rusqlite::Error),
    /// Wraps errors returned by the `wkb` crate.
    #[error("{0}")]
    Wkb(#[from] wkb::error::WkbError),
    /// Wraps errors returned by `serde_json`.
    #[error("{0}")]
    Json(#[from] serde_json::Error),
    /// Wraps errors returned by the `csv` crate.
    #[error("csv error: {0}")]
    Csv(#[from] csv::Error),
    #[error("{0}")]
    Io(#[from] std::io::Error),
    #[error("invalid configuration: {0}")]
    Toml(#[from] toml::de::Error),
    /// A DDL or DML statement failed. Never retried.
    #[error("{operation} failed on layer '{formid}': {source}")]
    Storage {
        operation: &'static str,
        formid: String,
        #[source]
        source: rusqlite::Error,
    },
    #[error("layer not found: {formid}")]
    LayerNotFound { formid: String },
    #[error("column not found: {col_id} (layer {formid})")]
    ColumnNotFound { formid: String, col_id: String },
    #[error("feature not found: id {id} (layer {formid})")]
    FeatureNotFound { formid: String, id: i64 },
    /// Layer type is not one of `point`, `linestring` or `polygon`.
    #[error("invalid layer type: {0}")]
    InvalidLayerType(String),
    /// Logical column type is not recognized.
    #[error("unsupported column type: {0}")]
    UnsupportedType(String),
    /// A name failed the identifier allow-list.
    #[error("invalid identifier: {0:?}")]
    InvalidIdentifier(String),
    /// Geometry payload shape disagrees with the layer type.
    #[error("geometry type mismatch: layer expects {expected}, got {actual}")]
    GeometryTypeMismatch { expected: LayerType, actual: String },
    #[error("invalid geometry: {0}")]
    InvalidGeometry(String),
    #[error("unsupported coordinate reference system: {0}")]
    UnsupportedCrs(String),
    /// Invalid GeoPackage geometry flags byte.
    #[error("invalid gpkg geometry flags: {0:#04x}")]
    InvalidGpkgGeometryFlags(u8),
    /// GeoPackage geometry blob is too short for its header.
    #[error("invalid gpkg geometry length: got {len} bytes, expected at least {minimum}")]
    InvalidGpkgGeometryLength { len: usize, minimum: usize },
    /// Sum aggregation requested on a non-numeric column.
    #[error("column {col_id} has type {col_type}, expected a numeric column")]
    TypeMismatch { col_id: String, col_type: String },
    /// An attribute value could not be coerced to its column type.
    #[error("invalid value for column {col_id} ({expected}): {value:?}")]
    InvalidValue {
        col_id: String,
        expected: &'static str,
        value: String,
    },
    #[error("invalid aggregate request: {0}")]
    InvalidAggregate(String),
    #[error("input contains no rows")]
    EmptyInput,
    /// No pooled connection became available in time, or the pool is closed.
    #[error("no connection available after {waited:?}")]
    Unavailable { waited: Duration },
    /// Catalog and physical table disagree.
    #[error(
        "schema drift on layer '{formid}': missing columns {missing:?}, unexpected columns {unexpected:?}"
    )]
    SchemaDriftDetected {
        formid: String,
        missing: Vec<String>,
        unexpected: Vec<String>,
    },
}

impl GeoLayerError {
    /// True for unknown layers, columns and features.
    pub fn is_not_found(&self) -> bool {
        matches!(
            self,
            Self::LayerNotFound { .. } | Self::ColumnNotFound { .. } | Self::FeatureNotFound { .. }
        )
    }
}

pub type Result<T> = std::result::Result<T, GeoLayerError>;

/// Attach the operation and layer to a failed statement.
pub(crate) trait StorageContext<T> {
    fn storage(self, operation: &'static str, formid: &str) -> Result<T>;
}

impl<T> StorageContext<T> for rusqlite::Result<T> {
    fn storage(self, operation: &'static str, formid: &str) -> Result<T> {
        self.map_err(|source| GeoLayerError::Storage {
            operation,
            formid: formid.to_string(),
            source,
        })
    }
}
