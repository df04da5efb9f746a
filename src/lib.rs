//! Runtime-defined geospatial layers on top of rusqlite.
//!
//! ## Overview
//!
//! - `LayerDb` is the entry point. It owns a pool of SQLite connections and
//!   exposes every catalog, feature, import and maintenance operation.
//! - A layer is a catalog row (`LayerDefinition`) plus one physical table
//!   named after its `formid`. Attribute columns are catalog rows
//!   (`ColumnDefinition`) plus one physical column each. The two sides are
//!   always written in the same transaction.
//! - `Feature` is a single row read back with its geometry rendered as
//!   GeoJSON and its properties typed by the catalog.
//!
//! The database is also a valid GeoPackage: every layer table is registered
//! in `gpkg_contents`/`gpkg_geometry_columns`, carries an R-tree index and
//! stores geometry as GeoPackage binary in WGS84.
//!
//! ## Short usage
//!
//! ```no_run
//! use rusqlite_geolayer::{GeometryPayload, LayerDb, LayerFilter, LogicalType, NewColumn};
//!
//! let db = LayerDb::open_in_memory()?;
//! let layer = db.create_layer(
//!     "north",
//!     "Wells",
//!     "point",
//!     &[
//!         NewColumn::new("Name", LogicalType::Text),
//!         NewColumn::new("Depth", LogicalType::Numeric),
//!     ],
//! )?;
//! let columns = db.list_columns(&layer.formid)?;
//!
//! // Attributes are keyed by col_id, values are form strings.
//! let geometry = GeometryPayload::parse("POINT (98.99 18.79)")?;
//! db.insert_feature(
//!     &layer.formid,
//!     Some(&geometry),
//!     [(columns[0].col_id.as_str(), "Well A"), (columns[1].col_id.as_str(), "12.5")],
//! )?;
//!
//! for feature in db.list_features(&layer.formid)? {
//!     println!("{}", serde_json::to_string(&feature)?);
//! }
//!
//! let visible = db.list_layers(&LayerFilter::for_role("user", "north"))?;
//! # Ok::<(), Box<dyn std::error::Error>>(())
//! ```
//!
//! ## Import
//!
//! ```no_run
//! use rusqlite_geolayer::{EngineConfig, LayerDb, read_csv};
//!
//! let db = LayerDb::open(EngineConfig::for_file("layers.gpkg"))?;
//! let rows = read_csv(std::fs::File::open("wells.csv")?)?;
//! let report = db.import_table("north", "Wells", "point", &rows)?;
//! println!("{} rows into {}", report.inserted, report.formid);
//! # Ok::<(), Box<dyn std::error::Error>>(())
//! ```
//!
//! Headers matching a latitude or longitude name become the `lat`/`lng`
//! columns; for point layers the geometry is derived from them once all rows
//! are in.
//!
//! ## Maintenance
//!
//! `check_layer` reports drift between the catalog and a table,
//! `repair_layer`/`repair_all` recreate missing tables and columns, and
//! `drop_orphan_tables` removes tables left without a catalog row.
mod catalog;
mod config;
mod conversions;
mod crs;
mod db;
mod error;
mod features;
mod geometry;
mod ident;
mod import;
mod ogc_sql;
mod schema;
mod session;
mod sql_functions;
mod types;

pub use catalog::{Catalog, LayerSchema};
pub use config::{DatabaseSettings, EngineConfig, GeometrySettings, IN_MEMORY_PATH, ImportSettings};
pub use conversions::{logical_type_to_physical, map_logical_type};
pub use crs::{Crs, DEFAULT_SOURCE_EPSG, coordinate_transform, utm_to_lat_lng};
pub use db::{LayerDb, RepairReport};
pub use error::{GeoLayerError, Result};
pub use features::{Aggregate, Feature, FeatureStore, GroupBy, MonthlySummary};
pub use geometry::{GeometryPayload, decode_feature_geometry, encode_feature_geometry, encode_wkt};
pub use ident::{Ident, RESERVED_COLUMNS, new_column_id, new_layer_id, new_refid};
pub use import::{ImportReport, ImportRow, read_csv};
pub use schema::{PhysicalColumn, SchemaDrift, SchemaSync};
pub use session::{Session, SessionPool};
pub use sql_functions::register_spatial_functions;
pub use types::{ColumnDefinition, LayerDefinition, LayerFilter, LayerType, LogicalType, NewColumn};
