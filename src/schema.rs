//! Physical tables behind catalog layers.
//!
//! Every DDL statement here is run once. A failure comes back as
//! [`GeoLayerError::Storage`] naming the operation and formid.

use rusqlite::{Connection, params};
use tracing::debug;

use crate::conversions::{layer_type_to_column_type, logical_type_to_physical};
use crate::error::{GeoLayerError, Result, StorageContext};
use crate::ident::{Ident, RESERVED_COLUMNS};
use crate::ogc_sql::{
    SQL_DELETE_GPKG_REGISTRATION, SQL_INSERT_GPKG_CONTENTS, SQL_INSERT_GPKG_GEOMETRY_COLUMNS,
    SQL_INSERT_GPKG_RTREE_EXTENSION, SQL_LIST_REGISTERED_TABLES, SQL_TABLE_COLUMNS,
    SQL_TABLE_EXISTS, SRS_ID_WGS84, execute_rtree_sqls, gpkg_rtree_drop_sql, sql_add_column,
    sql_create_layer_table, sql_drop_column, sql_drop_table,
};
use crate::types::{ColumnDefinition, LayerType, LogicalType};

/// Name and declared type of one physical column.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PhysicalColumn {
    pub name: String,
    pub declared_type: String,
}

/// Differences between catalog columns and a physical table.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct SchemaDrift {
    pub table_missing: bool,
    /// Reserved and catalog columns with no physical column.
    pub missing: Vec<String>,
    /// Physical attribute columns with no catalog row.
    pub unexpected: Vec<String>,
}

impl SchemaDrift {
    pub fn is_empty(&self) -> bool {
        !self.table_missing && self.missing.is_empty() && self.unexpected.is_empty()
    }

    pub(crate) fn into_error(self, formid: &str) -> GeoLayerError {
        let mut missing = self.missing;
        if self.table_missing {
            missing.insert(0, formid.to_string());
        }
        GeoLayerError::SchemaDriftDetected {
            formid: formid.to_string(),
            missing,
            unexpected: self.unexpected,
        }
    }
}

/// DDL for feature tables over one connection.
pub struct SchemaSync<'c> {
    conn: &'c Connection,
}

impl<'c> SchemaSync<'c> {
    pub fn new(conn: &'c Connection) -> Self {
        Self { conn }
    }

    pub fn table_exists(&self, formid: &Ident) -> Result<bool> {
        Ok(self
            .conn
            .query_row(SQL_TABLE_EXISTS, [formid.as_str()], |row| row.get(0))?)
    }

    pub fn table_columns(&self, formid: &Ident) -> Result<Vec<PhysicalColumn>> {
        let mut stmt = self.conn.prepare(SQL_TABLE_COLUMNS)?;
        let columns = stmt
            .query_map([formid.as_str()], |row| {
                Ok(PhysicalColumn {
                    name: row.get(0)?,
                    declared_type: row.get(1)?,
                })
            })?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(columns)
    }

    fn column_exists(&self, formid: &Ident, col_id: &Ident) -> Result<bool> {
        Ok(self
            .table_columns(formid)?
            .iter()
            .any(|c| c.name.eq_ignore_ascii_case(col_id.as_str())))
    }

    /// Create the feature table, register it as a GeoPackage feature table
    /// and build its R-tree index. A table that already exists is left alone.
    ///
    /// Registration rows and an R-tree left behind by a table dropped out of
    /// band are cleared first.
    pub fn materialize_layer(&self, formid: &Ident, layertype: LayerType) -> Result<()> {
        if self.table_exists(formid)? {
            debug!(%formid, "feature table already exists");
            return Ok(());
        }
        self.unregister(formid)?;

        let geometry_type = layer_type_to_column_type(layertype);
        let sql = sql_create_layer_table(formid, geometry_type);
        debug!(%formid, %sql, "create feature table");
        self.conn
            .execute_batch(&sql)
            .storage("create table", formid.as_str())?;

        self.conn
            .execute(
                SQL_INSERT_GPKG_CONTENTS,
                params![formid.as_str(), "", SRS_ID_WGS84],
            )
            .storage("register table", formid.as_str())?;
        self.conn
            .execute(
                SQL_INSERT_GPKG_GEOMETRY_COLUMNS,
                params![formid.as_str(), geometry_type, SRS_ID_WGS84],
            )
            .storage("register geometry column", formid.as_str())?;
        self.conn
            .execute(SQL_INSERT_GPKG_RTREE_EXTENSION, [formid.as_str()])
            .storage("register rtree", formid.as_str())?;
        execute_rtree_sqls(self.conn, formid).storage("create rtree", formid.as_str())?;
        Ok(())
    }

    /// Add an attribute column unless the table already has it.
    pub fn materialize_column(
        &self,
        formid: &Ident,
        col_id: &Ident,
        logical: LogicalType,
    ) -> Result<()> {
        if self.column_exists(formid, col_id)? {
            debug!(%formid, %col_id, "column already exists");
            return Ok(());
        }
        let sql = sql_add_column(formid, col_id, logical_type_to_physical(logical));
        debug!(%formid, %sql, "add column");
        self.conn
            .execute_batch(&sql)
            .storage("add column", formid.as_str())
    }

    pub fn drop_column(&self, formid: &Ident, col_id: &Ident) -> Result<()> {
        if !self.column_exists(formid, col_id)? {
            debug!(%formid, %col_id, "column already absent");
            return Ok(());
        }
        self.conn
            .execute_batch(&sql_drop_column(formid, col_id))
            .storage("drop column", formid.as_str())
    }

    /// Drop the table, its R-tree and its GeoPackage registration. Safe when
    /// any of them is already gone.
    pub fn drop_layer(&self, formid: &Ident) -> Result<()> {
        self.conn
            .execute_batch(&sql_drop_table(formid))
            .storage("drop table", formid.as_str())?;
        self.unregister(formid)
    }

    fn unregister(&self, formid: &Ident) -> Result<()> {
        self.conn
            .execute_batch(&gpkg_rtree_drop_sql(formid))
            .storage("drop rtree", formid.as_str())?;
        for sql in SQL_DELETE_GPKG_REGISTRATION {
            self.conn
                .execute(sql, [formid.as_str()])
                .storage("unregister table", formid.as_str())?;
        }
        Ok(())
    }

    /// Add a catalog column the physical table lacks. Returns whether
    /// anything was added. Existing rows get NULL in the new column.
    pub fn backfill_missing_column(
        &self,
        formid: &Ident,
        col_id: &Ident,
        logical: LogicalType,
    ) -> Result<bool> {
        if self.column_exists(formid, col_id)? {
            return Ok(false);
        }
        self.materialize_column(formid, col_id, logical)?;
        Ok(true)
    }

    /// Restore a reserved column the physical table lacks. Only `refid` and
    /// `style` can be added back; `id`, `geom` and `ts` need the table
    /// recreated and are left alone. Returns whether anything was added.
    pub fn backfill_reserved_column(&self, formid: &Ident, name: &str) -> Result<bool> {
        if !matches!(name, "refid" | "style") {
            return Ok(false);
        }
        let column = Ident::parse(name)?;
        if self.column_exists(formid, &column)? {
            return Ok(false);
        }
        let sql = sql_add_column(formid, &column, "TEXT");
        debug!(%formid, %sql, "restore reserved column");
        self.conn
            .execute_batch(&sql)
            .storage("add column", formid.as_str())?;
        Ok(true)
    }

    /// Compare catalog columns with the physical table. Reserved columns
    /// are expected on every table and reported as missing when absent.
    pub fn diff(&self, formid: &Ident, columns: &[ColumnDefinition]) -> Result<SchemaDrift> {
        if !self.table_exists(formid)? {
            return Ok(SchemaDrift {
                table_missing: true,
                missing: columns.iter().map(|c| c.col_id.clone()).collect(),
                unexpected: Vec::new(),
            });
        }

        let physical = self.table_columns(formid)?;
        let present = |name: &str| physical.iter().any(|p| p.name.eq_ignore_ascii_case(name));
        let missing = RESERVED_COLUMNS
            .iter()
            .map(|name| name.to_string())
            .chain(columns.iter().map(|c| c.col_id.clone()))
            .filter(|name| !present(name))
            .collect();
        let unexpected = physical
            .iter()
            .filter(|p| {
                !RESERVED_COLUMNS
                    .iter()
                    .any(|r| r.eq_ignore_ascii_case(&p.name))
            })
            .filter(|p| {
                !columns
                    .iter()
                    .any(|c| c.col_id.eq_ignore_ascii_case(&p.name))
            })
            .map(|p| p.name.clone())
            .collect();

        Ok(SchemaDrift {
            table_missing: false,
            missing,
            unexpected,
        })
    }

    /// Tables registered in `gpkg_contents` as feature tables.
    pub fn registered_tables(&self) -> Result<Vec<String>> {
        let mut stmt = self.conn.prepare(SQL_LIST_REGISTERED_TABLES)?;
        let tables = stmt
            .query_map([], |row| row.get(0))?
            .collect::<rusqlite::Result<Vec<String>>>()?;
        Ok(tables)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ogc_sql::initialize_store;
    use crate::sql_functions::register_spatial_functions;

    fn store() -> Result<Connection> {
        let conn = Connection::open_in_memory()?;
        register_spatial_functions(&conn)?;
        initialize_store(&conn)?;
        Ok(conn)
    }

    fn ident(name: &str) -> Ident {
        Ident::parse(name).expect("valid identifier")
    }

    #[test]
    fn materialize_layer_creates_registered_table() -> Result<()> {
        let conn = store()?;
        let schema = SchemaSync::new(&conn);
        let formid = ident("fid_1_abcdef");

        schema.materialize_layer(&formid, LayerType::Polygon)?;
        // Second call is a no-op.
        schema.materialize_layer(&formid, LayerType::Polygon)?;

        let names: Vec<String> = schema
            .table_columns(&formid)?
            .into_iter()
            .map(|c| c.name)
            .collect();
        assert_eq!(names, RESERVED_COLUMNS);

        let (geometry_type, srs_id): (String, i64) = conn.query_row(
            "SELECT geometry_type_name, srs_id FROM gpkg_geometry_columns WHERE table_name = ?1",
            [formid.as_str()],
            |row| Ok((row.get(0)?, row.get(1)?)),
        )?;
        assert_eq!(geometry_type, "POLYGON");
        assert_eq!(srs_id, 4326);
        assert_eq!(schema.registered_tables()?, vec![formid.as_str().to_string()]);
        Ok(())
    }

    #[test]
    fn columns_use_mapped_physical_types() -> Result<()> {
        let conn = store()?;
        let schema = SchemaSync::new(&conn);
        let formid = ident("fid_1_abcdef");
        schema.materialize_layer(&formid, LayerType::Point)?;

        schema.materialize_column(&formid, &ident("fid_1_abcdef_0"), LogicalType::Decimal)?;
        schema.materialize_column(&formid, &ident("fid_1_abcdef_0"), LogicalType::Decimal)?;
        schema.materialize_column(&formid, &ident("fid_1_abcdef_1"), LogicalType::Boolean)?;

        let columns = schema.table_columns(&formid)?;
        assert_eq!(columns.len(), 7);
        assert_eq!(columns[5].declared_type, "NUMERIC");
        assert_eq!(columns[6].declared_type, "BOOLEAN");

        schema.drop_column(&formid, &ident("fid_1_abcdef_0"))?;
        schema.drop_column(&formid, &ident("fid_1_abcdef_0"))?;
        assert_eq!(schema.table_columns(&formid)?.len(), 6);
        Ok(())
    }

    #[test]
    fn drop_layer_removes_everything() -> Result<()> {
        let conn = store()?;
        let schema = SchemaSync::new(&conn);
        let formid = ident("fid_1_abcdef");
        schema.materialize_layer(&formid, LayerType::Point)?;

        schema.drop_layer(&formid)?;
        schema.drop_layer(&formid)?;
        assert!(!schema.table_exists(&formid)?);
        assert!(!schema.table_exists(&ident("rtree_fid_1_abcdef_geom"))?);
        assert!(schema.registered_tables()?.is_empty());
        Ok(())
    }

    #[test]
    fn diff_and_backfill() -> Result<()> {
        let conn = store()?;
        let schema = SchemaSync::new(&conn);
        let formid = ident("fid_1_abcdef");
        let column = |col_id: &str| ColumnDefinition {
            formid: formid.as_str().to_string(),
            col_id: col_id.to_string(),
            col_name: col_id.to_string(),
            col_type: LogicalType::Text,
            col_desc: String::new(),
        };
        let catalog = vec![column("fid_1_abcdef_0"), column("fid_1_abcdef_1")];

        let drift = schema.diff(&formid, &catalog)?;
        assert!(drift.table_missing);

        schema.materialize_layer(&formid, LayerType::Point)?;
        schema.materialize_column(&formid, &ident("fid_1_abcdef_0"), LogicalType::Text)?;
        schema.materialize_column(&formid, &ident("stray"), LogicalType::Text)?;

        let drift = schema.diff(&formid, &catalog)?;
        assert_eq!(drift.missing, vec!["fid_1_abcdef_1".to_string()]);
        assert_eq!(drift.unexpected, vec!["stray".to_string()]);

        assert!(schema.backfill_missing_column(&formid, &ident("fid_1_abcdef_1"), LogicalType::Text)?);
        assert!(!schema.backfill_missing_column(&formid, &ident("fid_1_abcdef_1"), LogicalType::Text)?);
        assert!(schema.diff(&formid, &catalog)?.missing.is_empty());
        Ok(())
    }

    #[test]
    fn reserved_columns_are_diffed_and_restored() -> Result<()> {
        let conn = store()?;
        let schema = SchemaSync::new(&conn);
        let formid = ident("fid_1_abcdef");
        schema.materialize_layer(&formid, LayerType::Point)?;
        conn.execute_batch(r#"ALTER TABLE "fid_1_abcdef" DROP COLUMN "style""#)?;
        conn.execute_batch(r#"ALTER TABLE "fid_1_abcdef" DROP COLUMN "refid""#)?;

        let drift = schema.diff(&formid, &[])?;
        assert_eq!(drift.missing, vec!["refid".to_string(), "style".to_string()]);
        assert!(drift.unexpected.is_empty());

        assert!(schema.backfill_reserved_column(&formid, "style")?);
        assert!(schema.backfill_reserved_column(&formid, "refid")?);
        assert!(!schema.backfill_reserved_column(&formid, "style")?);
        assert!(!schema.backfill_reserved_column(&formid, "ts")?);
        assert!(schema.diff(&formid, &[])?.is_empty());
        Ok(())
    }

    #[test]
    fn stale_registration_is_replaced_on_recreate() -> Result<()> {
        let conn = store()?;
        let schema = SchemaSync::new(&conn);
        let formid = ident("fid_1_abcdef");
        schema.materialize_layer(&formid, LayerType::Point)?;
        conn.execute_batch(r#"DROP TABLE "fid_1_abcdef""#)?;
        assert!(schema.table_exists(&ident("rtree_fid_1_abcdef_geom"))?);

        schema.materialize_layer(&formid, LayerType::Polygon)?;
        let geometry_type: String = conn.query_row(
            "SELECT geometry_type_name FROM gpkg_geometry_columns WHERE table_name = ?1",
            [formid.as_str()],
            |row| row.get(0),
        )?;
        assert_eq!(geometry_type, "POLYGON");
        assert_eq!(schema.registered_tables()?, vec![formid.as_str().to_string()]);
        Ok(())
    }

    #[test]
    fn ddl_failures_carry_context() -> Result<()> {
        let conn = store()?;
        let schema = SchemaSync::new(&conn);
        let formid = ident("fid_1_abcdef");
        // No table to alter.
        let err = schema
            .materialize_column(&formid, &ident("fid_1_abcdef_0"), LogicalType::Text)
            .expect_err("missing table");
        match err {
            GeoLayerError::Storage {
                operation, formid, ..
            } => {
                assert_eq!(operation, "add column");
                assert_eq!(formid, "fid_1_abcdef");
            }
            other => panic!("unexpected error: {other:?}"),
        }
        Ok(())
    }
}
