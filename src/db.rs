use chrono::NaiveDateTime;
use rusqlite::{Connection, TransactionBehavior};
use serde_json::Value as Json;
use tracing::{info, warn};

use crate::catalog::{Catalog, LayerSchema};
use crate::config::EngineConfig;
use crate::error::{GeoLayerError, Result};
use crate::features::{Aggregate, Feature, FeatureStore, GroupBy, MonthlySummary};
use crate::geometry::GeometryPayload;
use crate::ident::{Ident, RESERVED_COLUMNS};
use crate::import::{ImportReport, ImportRow, import_rows};
use crate::schema::{SchemaDrift, SchemaSync};
use crate::session::{Session, SessionPool};
use crate::types::{ColumnDefinition, LayerDefinition, LayerFilter, LayerType, NewColumn};

/// What `repair_layer` changed.
#[derive(Clone, Debug, Default, PartialEq, Eq, serde::Serialize)]
pub struct RepairReport {
    pub formid: String,
    pub table_created: bool,
    pub columns_added: Vec<String>,
    /// Physical columns with no catalog row. Left in place.
    pub unexpected: Vec<String>,
}

/// Entry point: owns the session pool and exposes every catalog, feature
/// and import operation.
///
/// Example:
/// ```no_run
/// use rusqlite_geolayer::{GeometryPayload, LayerDb, LogicalType, NewColumn};
///
/// let db = LayerDb::open_in_memory()?;
/// let layer = db.create_layer("north", "Wells", "point", &[NewColumn::new("Name", LogicalType::Text)])?;
/// let columns = db.list_columns(&layer.formid)?;
/// let point = GeometryPayload::parse(r#"{"type": "Point", "coordinates": [98.99, 18.79]}"#)?;
/// db.insert_feature(&layer.formid, Some(&point), [(columns[0].col_id.as_str(), "Well A")])?;
/// # Ok::<(), rusqlite_geolayer::GeoLayerError>(())
/// ```
pub struct LayerDb {
    pool: SessionPool,
    config: EngineConfig,
}

impl LayerDb {
    pub fn open(config: EngineConfig) -> Result<Self> {
        let pool = SessionPool::open(&config.database)?;
        info!(
            path = %config.database.path.display(),
            pool_size = pool.size(),
            "layer database opened"
        );
        Ok(Self { pool, config })
    }

    pub fn open_in_memory() -> Result<Self> {
        Self::open(EngineConfig::default())
    }

    /// Close the pool. Later calls fail with `Unavailable`.
    pub fn close(&self) {
        self.pool.close();
        info!("layer database closed");
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    fn session(&self) -> Result<Session<'_>> {
        self.pool.acquire()
    }

    /// Run `f` in a `BEGIN IMMEDIATE` transaction. SQLite DDL is
    /// transactional, so catalog rows and tables commit or roll back together.
    fn write<T>(&self, f: impl FnOnce(&Connection) -> Result<T>) -> Result<T> {
        let mut session = self.session()?;
        let tx = session.transaction_with_behavior(TransactionBehavior::Immediate)?;
        let out = f(&tx)?;
        tx.commit()?;
        Ok(out)
    }

    fn read<T>(&self, f: impl FnOnce(&Connection) -> Result<T>) -> Result<T> {
        let session = self.session()?;
        f(&session)
    }

    fn with_features<T>(
        &self,
        conn: &Connection,
        formid: &str,
        f: impl FnOnce(&FeatureStore<'_>) -> Result<T>,
    ) -> Result<T> {
        let schema = Catalog::new(conn).layer_schema(formid)?;
        f(&FeatureStore::new(conn, schema)?)
    }

    // Catalog ---------------------------------------------------------------

    /// Create a layer, its table and its initial columns.
    pub fn create_layer(
        &self,
        division: &str,
        layername: &str,
        layertype: &str,
        columns: &[NewColumn],
    ) -> Result<LayerDefinition> {
        let layertype: LayerType = layertype.parse()?;
        let layer = self.write(|conn| {
            let catalog = Catalog::new(conn);
            let schema = SchemaSync::new(conn);
            let layer = catalog.create_layer(division, layername, layertype)?;
            let formid = Ident::parse(&layer.formid)?;
            schema.materialize_layer(&formid, layertype)?;
            for column in columns {
                let def = catalog.add_column(&layer.formid, column)?;
                schema.materialize_column(&formid, &Ident::parse(&def.col_id)?, def.col_type)?;
            }
            Ok(layer)
        })?;
        info!(formid = %layer.formid, %layertype, division, "layer created");
        Ok(layer)
    }

    pub fn get_layer(&self, formid: &str) -> Result<LayerDefinition> {
        self.read(|conn| Catalog::new(conn).get_layer(formid))
    }

    pub fn list_layers(&self, filter: &LayerFilter) -> Result<Vec<LayerDefinition>> {
        self.read(|conn| Catalog::new(conn).list_layers(filter))
    }

    pub fn layer_schema(&self, formid: &str) -> Result<LayerSchema> {
        self.read(|conn| Catalog::new(conn).layer_schema(formid))
    }

    /// Drop the table, then the catalog rows.
    pub fn delete_layer(&self, formid: &str) -> Result<()> {
        self.write(|conn| {
            let catalog = Catalog::new(conn);
            let layer = catalog.get_layer(formid)?;
            SchemaSync::new(conn).drop_layer(&Ident::parse(&layer.formid)?)?;
            catalog.delete_layer(formid)
        })?;
        info!(formid, "layer deleted");
        Ok(())
    }

    /// Add a column. The immediate transaction serializes ordinal allocation,
    /// so concurrent callers always receive distinct col_ids.
    pub fn add_column(&self, formid: &str, column: &NewColumn) -> Result<ColumnDefinition> {
        let def = self.write(|conn| {
            let def = Catalog::new(conn).add_column(formid, column)?;
            SchemaSync::new(conn).materialize_column(
                &Ident::parse(formid)?,
                &Ident::parse(&def.col_id)?,
                def.col_type,
            )?;
            Ok(def)
        })?;
        info!(formid, col_id = %def.col_id, col_type = %def.col_type, "column added");
        Ok(def)
    }

    pub fn list_columns(&self, formid: &str) -> Result<Vec<ColumnDefinition>> {
        self.read(|conn| {
            let catalog = Catalog::new(conn);
            catalog.get_layer(formid)?;
            catalog.list_columns(formid)
        })
    }

    /// Drop the physical column, then its catalog row.
    pub fn remove_column(&self, formid: &str, col_id: &str) -> Result<()> {
        self.write(|conn| {
            let catalog = Catalog::new(conn);
            let schema = catalog.layer_schema(formid)?;
            let column = schema.column(col_id)?;
            SchemaSync::new(conn)
                .drop_column(&Ident::parse(formid)?, &Ident::parse(&column.col_id)?)?;
            catalog.remove_column(formid, col_id)
        })?;
        info!(formid, col_id, "column removed");
        Ok(())
    }

    pub fn rename_column(&self, formid: &str, col_id: &str, new_name: &str) -> Result<()> {
        self.write(|conn| Catalog::new(conn).rename_column(formid, col_id, new_name))?;
        info!(formid, col_id, new_name, "column renamed");
        Ok(())
    }

    // Features --------------------------------------------------------------

    pub fn insert_feature<I, K, V>(
        &self,
        formid: &str,
        geometry: Option<&GeometryPayload>,
        attributes: I,
    ) -> Result<String>
    where
        I: IntoIterator<Item = (K, V)>,
        K: AsRef<str>,
        V: AsRef<str>,
    {
        self.write(|conn| {
            self.with_features(conn, formid, |store| {
                store.insert_feature(geometry, attributes)
            })
        })
    }

    pub fn insert_feature_at<I, K, V>(
        &self,
        formid: &str,
        geometry: Option<&GeometryPayload>,
        attributes: I,
        created_at: NaiveDateTime,
    ) -> Result<String>
    where
        I: IntoIterator<Item = (K, V)>,
        K: AsRef<str>,
        V: AsRef<str>,
    {
        self.write(|conn| {
            self.with_features(conn, formid, |store| {
                store.insert_feature_at(geometry, attributes, created_at)
            })
        })
    }

    pub fn update_feature<I, K, V>(&self, formid: &str, id: i64, attributes: I) -> Result<()>
    where
        I: IntoIterator<Item = (K, V)>,
        K: AsRef<str>,
        V: AsRef<str>,
    {
        self.write(|conn| {
            self.with_features(conn, formid, |store| store.update_feature(id, attributes))
        })
    }

    pub fn delete_feature(&self, formid: &str, id: i64) -> Result<()> {
        self.write(|conn| self.with_features(conn, formid, |store| store.delete_feature(id)))
    }

    pub fn set_style(&self, formid: &str, id: i64, style: Option<&str>) -> Result<()> {
        self.write(|conn| self.with_features(conn, formid, |store| store.set_style(id, style)))
    }

    pub fn list_features(&self, formid: &str) -> Result<Vec<Feature>> {
        self.read(|conn| self.with_features(conn, formid, |store| store.list_features()))
    }

    pub fn get_feature(&self, formid: &str, id: i64) -> Result<Feature> {
        self.read(|conn| self.with_features(conn, formid, |store| store.get_feature(id)))
    }

    pub fn distinct_values(&self, formid: &str, col_id: &str) -> Result<Vec<Json>> {
        self.read(|conn| self.with_features(conn, formid, |store| store.distinct_values(col_id)))
    }

    pub fn search_by_column(&self, formid: &str, col_id: &str, value: &str) -> Result<Vec<Feature>> {
        self.read(|conn| {
            self.with_features(conn, formid, |store| store.search_by_column(col_id, value))
        })
    }

    /// Aggregate with caller-supplied strings, e.g. `("month", "sum", Some(col_id))`.
    /// Bad strings fail before any statement runs.
    pub fn aggregate(
        &self,
        formid: &str,
        group_by: &str,
        kind: &str,
        col_id: Option<&str>,
    ) -> Result<Vec<(String, f64)>> {
        let group_by: GroupBy = group_by.parse()?;
        let aggregate = Aggregate::parse(kind, col_id)?;
        self.read(|conn| {
            self.with_features(conn, formid, |store| store.aggregate(group_by, &aggregate))
        })
    }

    pub fn summarize(&self, formid: &str) -> Result<Vec<MonthlySummary>> {
        self.read(|conn| self.with_features(conn, formid, |store| store.summarize()))
    }

    // Import ----------------------------------------------------------------

    /// Create a layer from tabular rows. See [`crate::import`].
    pub fn import_table(
        &self,
        division: &str,
        layername: &str,
        layertype: &str,
        rows: &[ImportRow],
    ) -> Result<ImportReport> {
        let layertype: LayerType = layertype.parse()?;
        if rows.is_empty() {
            return Err(GeoLayerError::EmptyInput);
        }
        let mut session = self.session()?;
        import_rows(
            &mut session,
            division,
            layername,
            layertype,
            rows,
            self.config.import.batch_size,
        )
    }

    // Maintenance -----------------------------------------------------------

    /// Compare a layer's catalog columns with its table.
    pub fn check_layer(&self, formid: &str) -> Result<()> {
        let drift = self.read(|conn| drift_of(conn, formid))?;
        if drift.is_empty() {
            return Ok(());
        }
        warn!(formid, ?drift, "schema drift detected");
        Err(drift.into_error(formid))
    }

    /// Recreate a missing table, restore the `refid`/`style` columns and add
    /// missing catalog columns. Physical columns without a catalog row are
    /// reported, never dropped.
    pub fn repair_layer(&self, formid: &str) -> Result<RepairReport> {
        let report = self.write(|conn| {
            let schema = Catalog::new(conn).layer_schema(formid)?;
            let sync = SchemaSync::new(conn);
            let ident = Ident::parse(formid)?;
            let drift = sync.diff(&ident, &schema.columns)?;

            let mut report = RepairReport {
                formid: formid.to_string(),
                table_created: drift.table_missing,
                columns_added: Vec::new(),
                unexpected: drift.unexpected,
            };
            if drift.table_missing {
                sync.materialize_layer(&ident, schema.layertype())?;
            }
            for name in RESERVED_COLUMNS {
                if sync.backfill_reserved_column(&ident, name)? {
                    report.columns_added.push(name.to_string());
                }
            }
            for column in &schema.columns {
                if sync.backfill_missing_column(&ident, &Ident::parse(&column.col_id)?, column.col_type)? {
                    report.columns_added.push(column.col_id.clone());
                }
            }
            Ok(report)
        })?;

        if report.table_created || !report.columns_added.is_empty() {
            info!(
                formid,
                table_created = report.table_created,
                columns_added = ?report.columns_added,
                "layer repaired"
            );
        }
        if !report.unexpected.is_empty() {
            warn!(formid, unexpected = ?report.unexpected, "columns missing from catalog");
        }
        Ok(report)
    }

    /// Repair every catalog layer.
    pub fn repair_all(&self) -> Result<Vec<RepairReport>> {
        let layers = self.list_layers(&LayerFilter::All)?;
        layers
            .iter()
            .map(|layer| self.repair_layer(&layer.formid))
            .collect()
    }

    /// Drop registered feature tables that have no catalog row. Returns the
    /// dropped table names.
    pub fn drop_orphan_tables(&self) -> Result<Vec<String>> {
        let dropped = self.write(|conn| {
            let catalog = Catalog::new(conn);
            let sync = SchemaSync::new(conn);
            let mut dropped = Vec::new();
            for table in sync.registered_tables()? {
                match catalog.get_layer(&table) {
                    Ok(_) => continue,
                    Err(GeoLayerError::LayerNotFound { .. }) => {}
                    Err(err) => return Err(err),
                }
                sync.drop_layer(&Ident::parse(&table)?)?;
                dropped.push(table);
            }
            Ok(dropped)
        })?;
        for table in &dropped {
            warn!(table, "dropped orphan table");
        }
        Ok(dropped)
    }
}

fn drift_of(conn: &Connection, formid: &str) -> Result<SchemaDrift> {
    let schema = Catalog::new(conn).layer_schema(formid)?;
    SchemaSync::new(conn).diff(&Ident::parse(formid)?, &schema.columns)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::DatabaseSettings;
    use crate::types::LogicalType;
    use chrono::NaiveDate;
    use serde_json::json;
    use std::collections::HashSet;
    use std::path::PathBuf;

    fn temp_db_path(name: &str) -> PathBuf {
        use std::time::{SystemTime, UNIX_EPOCH};

        let nanos = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .expect("time")
            .as_nanos();
        std::env::temp_dir().join(format!("rusqlite_geolayer_{name}_{nanos}.gpkg"))
    }

    fn remove_db(path: &PathBuf) {
        for suffix in ["", "-wal", "-shm"] {
            let mut file = path.clone().into_os_string();
            file.push(suffix);
            let _ = std::fs::remove_file(file);
        }
    }

    fn physical_columns(db: &LayerDb, formid: &str) -> Result<Vec<(String, String)>> {
        db.read(|conn| {
            Ok(SchemaSync::new(conn)
                .table_columns(&Ident::parse(formid)?)?
                .into_iter()
                .map(|c| (c.name, c.declared_type))
                .collect())
        })
    }

    #[test]
    fn created_layer_has_matching_table() -> Result<()> {
        let db = LayerDb::open_in_memory()?;
        let layer = db.create_layer(
            "north",
            "Wells",
            "POINT",
            &[
                NewColumn::new("Name", LogicalType::Text),
                NewColumn::new("Depth", LogicalType::Decimal),
                NewColumn::new("Surveyed", LogicalType::Date),
            ],
        )?;
        assert_eq!(layer.layertype, LayerType::Point);

        let columns = db.list_columns(&layer.formid)?;
        let physical = physical_columns(&db, &layer.formid)?;
        assert_eq!(physical.len(), RESERVED_COLUMNS.len() + columns.len());
        for (name, reserved) in physical.iter().zip(RESERVED_COLUMNS) {
            assert_eq!(name.0, reserved);
        }
        for (column, (name, declared)) in columns.iter().zip(&physical[RESERVED_COLUMNS.len()..]) {
            assert_eq!(&column.col_id, name);
            assert_eq!(declared, crate::conversions::logical_type_to_physical(column.col_type));
        }
        db.check_layer(&layer.formid)?;
        Ok(())
    }

    #[test]
    fn invalid_layer_type_creates_nothing() -> Result<()> {
        let db = LayerDb::open_in_memory()?;
        assert!(matches!(
            db.create_layer("north", "Bad", "multipoint", &[]),
            Err(GeoLayerError::InvalidLayerType(_))
        ));
        assert!(db.list_layers(&LayerFilter::All)?.is_empty());
        Ok(())
    }

    #[test]
    fn failed_write_rolls_back_catalog_and_table() -> Result<()> {
        let db = LayerDb::open_in_memory()?;
        let layer = db.create_layer("north", "Wells", "point", &[])?;
        let err = db
            .write(|conn| {
                let def = Catalog::new(conn)
                    .add_column(&layer.formid, &NewColumn::new("Depth", LogicalType::Integer))?;
                SchemaSync::new(conn).materialize_column(
                    &Ident::parse(&layer.formid)?,
                    &Ident::parse(&def.col_id)?,
                    def.col_type,
                )?;
                Err::<(), _>(GeoLayerError::EmptyInput)
            })
            .expect_err("forced failure");
        assert!(matches!(err, GeoLayerError::EmptyInput));

        assert!(db.list_columns(&layer.formid)?.is_empty());
        assert_eq!(physical_columns(&db, &layer.formid)?.len(), RESERVED_COLUMNS.len());
        db.check_layer(&layer.formid)?;
        Ok(())
    }

    #[test]
    fn delete_layer_leaves_nothing_behind() -> Result<()> {
        let db = LayerDb::open_in_memory()?;
        let layer = db.create_layer("north", "Wells", "polygon", &[NewColumn::new("Name", LogicalType::Text)])?;
        db.delete_layer(&layer.formid)?;

        assert!(matches!(
            db.get_layer(&layer.formid),
            Err(GeoLayerError::LayerNotFound { .. })
        ));
        assert!(matches!(
            db.list_columns(&layer.formid),
            Err(GeoLayerError::LayerNotFound { .. })
        ));
        let leftovers: i64 = db.read(|conn| {
            Ok(conn.query_row(
                "SELECT COUNT(*) FROM sqlite_master WHERE name LIKE ?1",
                [format!("%{}%", layer.formid)],
                |row| row.get(0),
            )?)
        })?;
        assert_eq!(leftovers, 0);
        let column_rows: i64 = db.read(|conn| {
            Ok(conn.query_row(
                "SELECT COUNT(*) FROM layer_column WHERE formid = ?1",
                [&layer.formid],
                |row| row.get(0),
            )?)
        })?;
        assert_eq!(column_rows, 0);
        assert!(db.delete_layer(&layer.formid).is_err());
        Ok(())
    }

    #[test]
    fn column_lifecycle() -> Result<()> {
        let db = LayerDb::open_in_memory()?;
        let layer = db.create_layer("north", "Wells", "point", &[])?;
        let a = db.add_column(&layer.formid, &NewColumn::new("A", LogicalType::Text))?;
        let b = db.add_column(&layer.formid, &NewColumn::new("B", LogicalType::Boolean))?;

        db.rename_column(&layer.formid, &a.col_id, "Alpha")?;
        db.remove_column(&layer.formid, &b.col_id)?;
        let columns = db.list_columns(&layer.formid)?;
        assert_eq!(columns.len(), 1);
        assert_eq!(columns[0].col_name, "Alpha");
        assert_eq!(physical_columns(&db, &layer.formid)?.len(), RESERVED_COLUMNS.len() + 1);

        assert!(matches!(
            db.remove_column(&layer.formid, &b.col_id),
            Err(GeoLayerError::ColumnNotFound { .. })
        ));
        assert!(matches!(
            db.add_column("fid_0_000000", &NewColumn::new("A", LogicalType::Text)),
            Err(GeoLayerError::LayerNotFound { .. })
        ));
        Ok(())
    }

    #[test]
    fn features_through_the_facade() -> Result<()> {
        let db = LayerDb::open_in_memory()?;
        let layer = db.create_layer(
            "north",
            "Payments",
            "point",
            &[NewColumn::new("Amount", LogicalType::Numeric)],
        )?;
        let amount = db.list_columns(&layer.formid)?[0].col_id.clone();
        let day = |m, d| {
            NaiveDate::from_ymd_opt(2024, m, d)
                .and_then(|date| date.and_hms_opt(12, 0, 0))
                .expect("valid date")
        };
        for (ts, value) in [(day(1, 5), "10"), (day(1, 20), "5"), (day(2, 1), "7")] {
            db.insert_feature_at(&layer.formid, None, [(amount.as_str(), value)], ts)?;
        }

        assert_eq!(
            db.aggregate(&layer.formid, "month", "sum", Some(&amount))?,
            vec![("2024-01".to_string(), 15.0), ("2024-02".to_string(), 7.0)]
        );
        assert!(matches!(
            db.aggregate(&layer.formid, "week", "sum", Some(&amount)),
            Err(GeoLayerError::InvalidAggregate(_))
        ));
        assert!(matches!(
            db.search_by_column(&layer.formid, "geom", "1"),
            Err(GeoLayerError::ColumnNotFound { .. })
        ));

        let features = db.list_features(&layer.formid)?;
        assert_eq!(features.len(), 3);
        assert_eq!(features[0].ts, day(2, 1));
        let id = features[0].id;
        db.update_feature(&layer.formid, id, [(amount.as_str(), "8")])?;
        db.set_style(&layer.formid, id, Some("red"))?;
        let feature = db.get_feature(&layer.formid, id)?;
        assert_eq!(feature.properties[&amount], json!(8.0));
        assert_eq!(feature.style.as_deref(), Some("red"));
        db.delete_feature(&layer.formid, id)?;
        assert_eq!(db.summarize(&layer.formid)?.len(), 1);
        assert_eq!(db.distinct_values(&layer.formid, &amount)?, vec![json!(5.0), json!(10.0)]);
        Ok(())
    }

    #[test]
    fn import_derives_point_geometry() -> Result<()> {
        let db = LayerDb::open_in_memory()?;
        let rows = crate::import::read_csv("lat,lng,name\n18.79,98.99,A\n,,B\n".as_bytes())?;
        let report = db.import_table("north", "Wells", "point", &rows)?;
        assert_eq!(report.inserted, 2);
        assert_eq!(report.failed, 0);

        let columns = db.list_columns(&report.formid)?;
        let name_id = format!("{}_0", report.formid);
        let ids: Vec<&str> = columns.iter().map(|c| c.col_id.as_str()).collect();
        assert_eq!(ids, ["lat", "lng", name_id.as_str()]);
        assert_eq!(columns[0].col_type, LogicalType::Numeric);
        assert_eq!(columns[2].col_type, LogicalType::Text);
        db.check_layer(&report.formid)?;

        let features = db.list_features(&report.formid)?;
        let a = features
            .iter()
            .find(|f| f.properties[&columns[2].col_id] == json!("A"))
            .expect("row A");
        assert_eq!(
            a.geometry,
            Some(json!({"type": "Point", "coordinates": [98.99, 18.79]}))
        );
        let b = features
            .iter()
            .find(|f| f.properties[&columns[2].col_id] == json!("B"))
            .expect("row B");
        assert_eq!(b.geometry, None);
        assert_eq!(b.properties["lat"], json!(0.0));
        Ok(())
    }

    #[test]
    fn import_rejects_empty_input() -> Result<()> {
        let db = LayerDb::open_in_memory()?;
        assert!(matches!(
            db.import_table("north", "Empty", "point", &[]),
            Err(GeoLayerError::EmptyInput)
        ));
        assert!(db.list_layers(&LayerFilter::All)?.is_empty());
        Ok(())
    }

    #[test]
    fn import_skips_geometry_for_non_point_layers() -> Result<()> {
        let db = LayerDb::open_in_memory()?;
        let rows = crate::import::read_csv("latitude,longitude\n18.79,98.99\n".as_bytes())?;
        let report = db.import_table("north", "Lines", "linestring", &rows)?;
        let features = db.list_features(&report.formid)?;
        assert_eq!(features.len(), 1);
        assert_eq!(features[0].geometry, None);
        Ok(())
    }

    #[test]
    fn drift_is_detected_and_repaired() -> Result<()> {
        let db = LayerDb::open_in_memory()?;
        let layer = db.create_layer("north", "Wells", "point", &[NewColumn::new("Name", LogicalType::Text)])?;
        let col_id = db.list_columns(&layer.formid)?[0].col_id.clone();
        db.write(|conn| {
            SchemaSync::new(conn).drop_column(&Ident::parse(&layer.formid)?, &Ident::parse(&col_id)?)
        })?;

        match db.check_layer(&layer.formid) {
            Err(GeoLayerError::SchemaDriftDetected { missing, unexpected, .. }) => {
                assert_eq!(missing, vec![col_id.clone()]);
                assert!(unexpected.is_empty());
            }
            other => panic!("expected drift, got {other:?}"),
        }

        let reports = db.repair_all()?;
        assert_eq!(reports.len(), 1);
        assert_eq!(reports[0].columns_added, vec![col_id]);
        db.check_layer(&layer.formid)?;

        // A vanished table is recreated.
        db.write(|conn| SchemaSync::new(conn).drop_layer(&Ident::parse(&layer.formid)?))?;
        assert!(db.check_layer(&layer.formid).is_err());
        let report = db.repair_layer(&layer.formid)?;
        assert!(report.table_created);
        db.check_layer(&layer.formid)?;
        Ok(())
    }

    #[test]
    fn dropped_columns_fail_reads_until_repaired() -> Result<()> {
        let db = LayerDb::open_in_memory()?;
        let layer = db.create_layer("north", "Wells", "point", &[NewColumn::new("Name", LogicalType::Text)])?;
        let name = db.list_columns(&layer.formid)?[0].col_id.clone();
        let point = GeometryPayload::parse("POINT (98.99 18.79)")?;
        db.insert_feature(&layer.formid, Some(&point), [(name.as_str(), "Well A")])?;

        db.write(|conn| {
            conn.execute_batch(&format!(
                r#"ALTER TABLE "{0}" DROP COLUMN "style"; ALTER TABLE "{0}" DROP COLUMN "{name}";"#,
                layer.formid
            ))?;
            Ok(())
        })?;

        assert!(db.list_features(&layer.formid).is_err());
        assert!(db.distinct_values(&layer.formid, &name).is_err());
        assert!(db.search_by_column(&layer.formid, &name, "Well A").is_err());
        match db.check_layer(&layer.formid) {
            Err(GeoLayerError::SchemaDriftDetected { missing, .. }) => {
                assert_eq!(missing, vec!["style".to_string(), name.clone()]);
            }
            other => panic!("expected drift, got {other:?}"),
        }

        let report = db.repair_layer(&layer.formid)?;
        assert_eq!(report.columns_added, vec!["style".to_string(), name.clone()]);
        db.check_layer(&layer.formid)?;
        let features = db.list_features(&layer.formid)?;
        assert_eq!(features.len(), 1);
        assert_eq!(features[0].style, None);
        assert_eq!(features[0].properties[&name], Json::Null);
        Ok(())
    }

    #[test]
    fn table_dropped_out_of_band_is_recreated() -> Result<()> {
        let db = LayerDb::open_in_memory()?;
        let layer = db.create_layer("north", "Wells", "point", &[])?;
        db.write(|conn| Ok(conn.execute_batch(&format!(r#"DROP TABLE "{}""#, layer.formid))?))?;

        let report = db.repair_layer(&layer.formid)?;
        assert!(report.table_created);
        db.check_layer(&layer.formid)?;

        let point = GeometryPayload::parse("POINT (98.99 18.79)")?;
        db.insert_feature(&layer.formid, Some(&point), std::iter::empty::<(&str, &str)>())?;
        let indexed: i64 = db.read(|conn| {
            Ok(conn.query_row(
                &format!(r#"SELECT COUNT(*) FROM "rtree_{}_geom""#, layer.formid),
                [],
                |row| row.get(0),
            )?)
        })?;
        assert_eq!(indexed, 1);
        Ok(())
    }

    #[test]
    fn orphan_tables_are_dropped() -> Result<()> {
        let db = LayerDb::open_in_memory()?;
        let layer = db.create_layer("north", "Wells", "point", &[])?;
        // Simulate a crash between table creation and the catalog write.
        db.write(|conn| Ok(conn.execute("DELETE FROM layer_name WHERE formid = ?1", [&layer.formid])?))?;

        assert_eq!(db.drop_orphan_tables()?, vec![layer.formid.clone()]);
        assert!(db.drop_orphan_tables()?.is_empty());
        Ok(())
    }

    #[test]
    fn closed_db_is_unavailable() -> Result<()> {
        let db = LayerDb::open_in_memory()?;
        db.close();
        assert!(matches!(
            db.list_layers(&LayerFilter::All),
            Err(GeoLayerError::Unavailable { .. })
        ));
        Ok(())
    }

    #[test]
    fn concurrent_add_column_allocates_distinct_ids() -> Result<()> {
        const WRITERS: usize = 8;

        let path = temp_db_path("concurrent");
        let config = EngineConfig {
            database: DatabaseSettings {
                pool_size: 4,
                acquire_timeout_ms: 30_000,
                busy_timeout_ms: 30_000,
                ..DatabaseSettings::file(&path)
            },
            ..EngineConfig::default()
        };
        let db = LayerDb::open(config)?;
        let layer = db.create_layer("north", "Wells", "point", &[])?;

        let col_ids = std::thread::scope(|scope| {
            let handles = (0..WRITERS)
                .map(|i| {
                    let db = &db;
                    let formid = layer.formid.as_str();
                    scope.spawn(move || {
                        db.add_column(formid, &NewColumn::new(format!("c{i}"), LogicalType::Text))
                            .map(|def| def.col_id)
                    })
                })
                .collect::<Vec<_>>();
            handles
                .into_iter()
                .map(|h| h.join().expect("writer thread"))
                .collect::<Result<Vec<_>>>()
        })?;

        let unique: HashSet<&String> = col_ids.iter().collect();
        assert_eq!(unique.len(), WRITERS);
        let expected: HashSet<String> = (0..WRITERS)
            .map(|n| format!("{}_{n}", layer.formid))
            .collect();
        assert_eq!(col_ids.into_iter().collect::<HashSet<_>>(), expected);
        db.check_layer(&layer.formid)?;

        db.close();
        remove_db(&path);
        Ok(())
    }
}
