//! Layer and column metadata.
//!
//! Catalog operations only touch `layer_name` and `layer_column`. Pairing
//! them with the physical DDL is done by [`crate::LayerDb`], catalog first on
//! create and table first on drop.

use chrono::Utc;
use rusqlite::{Connection, OptionalExtension, Row, params};

use crate::conversions::{parse_catalog_field, parse_timestamp};
use crate::error::{GeoLayerError, Result};
use crate::ident::{Ident, new_column_id, new_layer_id, next_ordinal};
use crate::ogc_sql::TS_FORMAT;
use crate::types::{
    ColumnDefinition, LayerDefinition, LayerFilter, LayerType, LogicalType, NewColumn,
};

const SQL_SELECT_LAYER: &str =
    "SELECT formid, layername, division, layertype, ts FROM layer_name WHERE formid = ?1";

const SQL_SELECT_LAYERS: &str =
    "SELECT formid, layername, division, layertype, ts FROM layer_name ORDER BY ts, formid";

const SQL_SELECT_LAYERS_BY_DIVISION: &str = "SELECT formid, layername, division, layertype, ts FROM layer_name WHERE division = ?1 ORDER BY ts, formid";

const SQL_SELECT_COLUMNS: &str = "SELECT formid, col_id, col_name, col_type, col_desc FROM layer_column WHERE formid = ?1 ORDER BY rowid";

/// A layer together with its columns, read in one go.
#[derive(Clone, Debug, PartialEq)]
pub struct LayerSchema {
    pub layer: LayerDefinition,
    pub columns: Vec<ColumnDefinition>,
}

impl LayerSchema {
    /// Look up a column, failing with `ColumnNotFound` for ids the catalog
    /// does not know.
    pub fn column(&self, col_id: &str) -> Result<&ColumnDefinition> {
        self.columns
            .iter()
            .find(|c| c.col_id == col_id)
            .ok_or_else(|| GeoLayerError::ColumnNotFound {
                formid: self.layer.formid.clone(),
                col_id: col_id.to_string(),
            })
    }

    pub fn layertype(&self) -> LayerType {
        self.layer.layertype
    }
}

fn layer_from_row(row: &Row<'_>) -> rusqlite::Result<LayerDefinition> {
    let layertype: String = row.get(3)?;
    let ts: String = row.get(4)?;
    Ok(LayerDefinition {
        formid: row.get(0)?,
        layername: row.get(1)?,
        division: row.get(2)?,
        layertype: parse_catalog_field(3, &layertype)?,
        created_at: parse_timestamp(4, &ts)?,
    })
}

fn column_from_row(row: &Row<'_>) -> rusqlite::Result<ColumnDefinition> {
    let col_type: String = row.get(3)?;
    Ok(ColumnDefinition {
        formid: row.get(0)?,
        col_id: row.get(1)?,
        col_name: row.get(2)?,
        col_type: parse_catalog_field(3, &col_type)?,
        col_desc: row.get(4)?,
    })
}

/// Catalog reads and writes over one connection.
pub struct Catalog<'c> {
    conn: &'c Connection,
}

impl<'c> Catalog<'c> {
    pub fn new(conn: &'c Connection) -> Self {
        Self { conn }
    }

    /// Allocate a formid and record a new layer.
    pub fn create_layer(
        &self,
        division: &str,
        layername: &str,
        layertype: LayerType,
    ) -> Result<LayerDefinition> {
        let formid = new_layer_id();
        // Second precision, like the stored text.
        let created_at = Utc::now().naive_utc();
        let ts = created_at.format(TS_FORMAT).to_string();
        self.conn.execute(
            "INSERT INTO layer_name (formid, division, layername, layertype, ts) VALUES (?1, ?2, ?3, ?4, ?5)",
            params![formid.as_str(), division, layername, layertype.as_str(), ts],
        )?;

        Ok(LayerDefinition {
            formid: formid.as_str().to_string(),
            layername: layername.to_string(),
            division: division.to_string(),
            layertype,
            created_at: parse_timestamp(4, &ts)?,
        })
    }

    pub fn get_layer(&self, formid: &str) -> Result<LayerDefinition> {
        self.conn
            .query_row(SQL_SELECT_LAYER, [formid], layer_from_row)
            .optional()?
            .ok_or_else(|| GeoLayerError::LayerNotFound {
                formid: formid.to_string(),
            })
    }

    pub fn list_layers(&self, filter: &LayerFilter) -> Result<Vec<LayerDefinition>> {
        let layers = match filter {
            LayerFilter::Nothing => Vec::new(),
            LayerFilter::All => {
                let mut stmt = self.conn.prepare(SQL_SELECT_LAYERS)?;
                stmt.query_map([], layer_from_row)?
                    .collect::<rusqlite::Result<Vec<_>>>()?
            }
            LayerFilter::Division(division) => {
                let mut stmt = self.conn.prepare(SQL_SELECT_LAYERS_BY_DIVISION)?;
                stmt.query_map([division], layer_from_row)?
                    .collect::<rusqlite::Result<Vec<_>>>()?
            }
        };
        Ok(layers)
    }

    /// Remove a layer and its column rows.
    pub fn delete_layer(&self, formid: &str) -> Result<()> {
        self.conn
            .execute("DELETE FROM layer_column WHERE formid = ?1", [formid])?;
        let deleted = self
            .conn
            .execute("DELETE FROM layer_name WHERE formid = ?1", [formid])?;
        if deleted == 0 {
            return Err(GeoLayerError::LayerNotFound {
                formid: formid.to_string(),
            });
        }
        Ok(())
    }

    /// Record a column under the next ordinal.
    ///
    /// Ordinals come from the layer's high-water mark, so an id freed by
    /// `remove_column` is never handed out again. The read and the bump are
    /// separate statements: concurrent callers must hold a write transaction.
    pub fn add_column(&self, formid: &str, column: &NewColumn) -> Result<ColumnDefinition> {
        let layer = self.get_layer(formid)?;
        let formid = Ident::parse(&layer.formid)?;

        let mut stmt = self
            .conn
            .prepare("SELECT col_id FROM layer_column WHERE formid = ?1")?;
        let existing = stmt
            .query_map([formid.as_str()], |row| row.get::<_, String>(0))?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        let seq: u32 = self.conn.query_row(
            "SELECT col_seq FROM layer_name WHERE formid = ?1",
            [formid.as_str()],
            |row| row.get(0),
        )?;
        let ordinal = next_ordinal(formid.as_str(), existing.iter().map(String::as_str)).max(seq);
        self.conn.execute(
            "UPDATE layer_name SET col_seq = ?2 WHERE formid = ?1",
            params![formid.as_str(), ordinal + 1],
        )?;

        let col_id = new_column_id(&formid, ordinal);
        self.insert_column(
            &formid,
            &col_id,
            &column.name,
            column.column_type,
            &column.desc,
        )
    }

    /// Record a column with a caller-chosen id (the importer's `lat`/`lng`).
    pub(crate) fn insert_column(
        &self,
        formid: &Ident,
        col_id: &Ident,
        col_name: &str,
        col_type: LogicalType,
        col_desc: &str,
    ) -> Result<ColumnDefinition> {
        self.conn.execute(
            "INSERT INTO layer_column (formid, col_id, col_name, col_type, col_desc) VALUES (?1, ?2, ?3, ?4, ?5)",
            params![formid.as_str(), col_id.as_str(), col_name, col_type.as_str(), col_desc],
        )?;
        Ok(ColumnDefinition {
            formid: formid.as_str().to_string(),
            col_id: col_id.as_str().to_string(),
            col_name: col_name.to_string(),
            col_type,
            col_desc: col_desc.to_string(),
        })
    }

    pub fn remove_column(&self, formid: &str, col_id: &str) -> Result<()> {
        let deleted = self.conn.execute(
            "DELETE FROM layer_column WHERE formid = ?1 AND col_id = ?2",
            [formid, col_id],
        )?;
        if deleted == 0 {
            return Err(GeoLayerError::ColumnNotFound {
                formid: formid.to_string(),
                col_id: col_id.to_string(),
            });
        }
        Ok(())
    }

    /// Change a column's display label. The col_id stays.
    pub fn rename_column(&self, formid: &str, col_id: &str, new_name: &str) -> Result<()> {
        let updated = self.conn.execute(
            "UPDATE layer_column SET col_name = ?3 WHERE formid = ?1 AND col_id = ?2",
            [formid, col_id, new_name],
        )?;
        if updated == 0 {
            return Err(GeoLayerError::ColumnNotFound {
                formid: formid.to_string(),
                col_id: col_id.to_string(),
            });
        }
        Ok(())
    }

    /// Columns of a layer in creation order.
    pub fn list_columns(&self, formid: &str) -> Result<Vec<ColumnDefinition>> {
        let mut stmt = self.conn.prepare(SQL_SELECT_COLUMNS)?;
        let columns = stmt
            .query_map([formid], column_from_row)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(columns)
    }

    pub fn layer_schema(&self, formid: &str) -> Result<LayerSchema> {
        let layer = self.get_layer(formid)?;
        let columns = self.list_columns(formid)?;
        Ok(LayerSchema { layer, columns })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ogc_sql::initialize_store;

    fn catalog_conn() -> Result<Connection> {
        let conn = Connection::open_in_memory()?;
        conn.pragma_update(None, "foreign_keys", "ON")?;
        initialize_store(&conn)?;
        Ok(conn)
    }

    #[test]
    fn create_and_get_layer() -> Result<()> {
        let conn = catalog_conn()?;
        let catalog = Catalog::new(&conn);

        let layer = catalog.create_layer("north", "Wells", LayerType::Point)?;
        assert!(layer.formid.starts_with("fid_"));
        assert_eq!(catalog.get_layer(&layer.formid)?, layer);

        let err = catalog.get_layer("fid_missing").expect_err("unknown layer");
        assert!(err.is_not_found());
        Ok(())
    }

    #[test]
    fn list_layers_respects_filter() -> Result<()> {
        let conn = catalog_conn()?;
        let catalog = Catalog::new(&conn);
        catalog.create_layer("north", "Wells", LayerType::Point)?;
        catalog.create_layer("south", "Roads", LayerType::LineString)?;

        assert_eq!(catalog.list_layers(&LayerFilter::All)?.len(), 2);
        assert!(catalog.list_layers(&LayerFilter::Nothing)?.is_empty());
        let south = catalog.list_layers(&LayerFilter::for_role("editor", "south"))?;
        assert_eq!(south.len(), 1);
        assert_eq!(south[0].layername, "Roads");
        Ok(())
    }

    #[test]
    fn column_ids_are_monotonic_and_never_reused() -> Result<()> {
        let conn = catalog_conn()?;
        let catalog = Catalog::new(&conn);
        let layer = catalog.create_layer("north", "Wells", LayerType::Point)?;
        let formid = layer.formid.as_str();

        let c0 = catalog.add_column(formid, &NewColumn::new("Name", LogicalType::Text))?;
        let c1 = catalog.add_column(formid, &NewColumn::new("Depth", LogicalType::Numeric))?;
        assert_eq!(c0.col_id, format!("{formid}_0"));
        assert_eq!(c1.col_id, format!("{formid}_1"));

        catalog.remove_column(formid, &c1.col_id)?;
        let c2 = catalog.add_column(formid, &NewColumn::new("Owner", LogicalType::Text))?;
        assert_eq!(c2.col_id, format!("{formid}_2"));

        catalog.remove_column(formid, &c0.col_id)?;
        catalog.remove_column(formid, &c2.col_id)?;
        let c3 = catalog.add_column(formid, &NewColumn::new("Notes", LogicalType::Text))?;
        assert_eq!(c3.col_id, format!("{formid}_3"));
        Ok(())
    }

    #[test]
    fn add_column_to_unknown_layer_fails() -> Result<()> {
        let conn = catalog_conn()?;
        let catalog = Catalog::new(&conn);
        let err = catalog
            .add_column("fid_missing", &NewColumn::new("Name", LogicalType::Text))
            .expect_err("unknown layer");
        assert!(matches!(err, GeoLayerError::LayerNotFound { .. }));
        Ok(())
    }

    #[test]
    fn rename_and_list_columns() -> Result<()> {
        let conn = catalog_conn()?;
        let catalog = Catalog::new(&conn);
        let layer = catalog.create_layer("north", "Wells", LayerType::Point)?;
        let formid = layer.formid.as_str();
        let column = catalog.add_column(formid, &NewColumn::new("Name", LogicalType::Text))?;
        catalog.add_column(formid, &NewColumn::new("Open", LogicalType::Boolean))?;

        catalog.rename_column(formid, &column.col_id, "Well name")?;
        let columns = catalog.list_columns(formid)?;
        assert_eq!(columns.len(), 2);
        assert_eq!(columns[0].col_name, "Well name");
        assert_eq!(columns[1].col_type, LogicalType::Boolean);

        assert!(matches!(
            catalog.rename_column(formid, "nope", "x"),
            Err(GeoLayerError::ColumnNotFound { .. })
        ));
        Ok(())
    }

    #[test]
    fn delete_layer_cascades_columns() -> Result<()> {
        let conn = catalog_conn()?;
        let catalog = Catalog::new(&conn);
        let layer = catalog.create_layer("north", "Wells", LayerType::Polygon)?;
        catalog.add_column(&layer.formid, &NewColumn::new("Name", LogicalType::Text))?;

        catalog.delete_layer(&layer.formid)?;
        assert!(catalog.list_columns(&layer.formid)?.is_empty());
        assert!(catalog.get_layer(&layer.formid).is_err());
        assert!(matches!(
            catalog.delete_layer(&layer.formid),
            Err(GeoLayerError::LayerNotFound { .. })
        ));
        Ok(())
    }

    #[test]
    fn layer_schema_resolves_columns() -> Result<()> {
        let conn = catalog_conn()?;
        let catalog = Catalog::new(&conn);
        let layer = catalog.create_layer("north", "Wells", LayerType::Point)?;
        let column = catalog.add_column(&layer.formid, &NewColumn::new("Depth", LogicalType::Numeric))?;

        let schema = catalog.layer_schema(&layer.formid)?;
        assert_eq!(schema.column(&column.col_id)?.col_type, LogicalType::Numeric);
        assert!(matches!(
            schema.column("lat"),
            Err(GeoLayerError::ColumnNotFound { .. })
        ));
        Ok(())
    }
}
