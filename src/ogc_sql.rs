// cf. https://www.geopackage.org/spec140/index.html#table_definition_sql
//
// Every builder below takes `Ident`s, never raw strings, so nothing
// caller-controlled reaches a statement unvalidated.

use crate::ident::Ident;

pub(crate) const SRS_ID_WGS84: u32 = 4326;

/// `ts` values are stored as text in this format (UTC).
pub(crate) const TS_FORMAT: &str = "%Y-%m-%d %H:%M:%S";

// layer_name: one row per user-defined layer. col_seq is the high-water mark
// of generated column ordinals.
pub(crate) const SQL_LAYER_NAME: &str = "
CREATE TABLE IF NOT EXISTS layer_name (
  formid TEXT NOT NULL PRIMARY KEY,
  division TEXT NOT NULL,
  layername TEXT NOT NULL,
  layertype TEXT NOT NULL,
  col_seq INTEGER NOT NULL DEFAULT 0,
  ts TIMESTAMP NOT NULL DEFAULT (strftime('%Y-%m-%d %H:%M:%S','now'))
);
";

// layer_column: attribute columns of each layer. Row order is the display order.
pub(crate) const SQL_LAYER_COLUMN: &str = "
CREATE TABLE IF NOT EXISTS layer_column (
  formid TEXT NOT NULL,
  col_id TEXT NOT NULL,
  col_name TEXT NOT NULL,
  col_type TEXT NOT NULL,
  col_desc TEXT NOT NULL DEFAULT '',
  CONSTRAINT pk_layer_column PRIMARY KEY (formid, col_id),
  CONSTRAINT fk_lc_formid FOREIGN KEY (formid) REFERENCES layer_name(formid) ON DELETE CASCADE
);
";

// gpkg_spatial_ref_sys: the SRS catalog referenced by gpkg_contents and
// gpkg_geometry_columns to describe spatial reference systems.
pub(crate) const SQL_GPKG_SPATIAL_REF_SYS: &str = "
CREATE TABLE IF NOT EXISTS gpkg_spatial_ref_sys (
  srs_name TEXT NOT NULL,
  srs_id INTEGER PRIMARY KEY,
  organization TEXT NOT NULL,
  organization_coordsys_id INTEGER NOT NULL,
  definition  TEXT NOT NULL,
  description TEXT
);
";

// gpkg_contents: lists all geospatial contents in the package. Here it is
// also the registry of physical layer tables.
pub(crate) const SQL_GPKG_CONTENTS: &str = "
CREATE TABLE IF NOT EXISTS gpkg_contents (
  table_name TEXT NOT NULL PRIMARY KEY,
  data_type TEXT NOT NULL,
  identifier TEXT UNIQUE,
  description TEXT DEFAULT '',
  last_change DATETIME NOT NULL DEFAULT (strftime('%Y-%m-%dT%H:%M:%fZ','now')),
  min_x DOUBLE,
  min_y DOUBLE,
  max_x DOUBLE,
  max_y DOUBLE,
  srs_id INTEGER,
  CONSTRAINT fk_gc_r_srs_id FOREIGN KEY (srs_id) REFERENCES gpkg_spatial_ref_sys(srs_id)
);
";

// gpkg_geometry_columns: identifies geometry columns and geometry types for
// vector feature user data tables.
pub(crate) const SQL_GPKG_GEOMETRY_COLUMNS: &str = "
CREATE TABLE IF NOT EXISTS gpkg_geometry_columns (
  table_name TEXT NOT NULL,
  column_name TEXT NOT NULL,
  geometry_type_name TEXT NOT NULL,
  srs_id INTEGER NOT NULL,
  z TINYINT NOT NULL,
  m TINYINT NOT NULL,
  CONSTRAINT pk_geom_cols PRIMARY KEY (table_name, column_name),
  CONSTRAINT uk_gc_table_name UNIQUE (table_name),
  CONSTRAINT fk_gc_tn FOREIGN KEY (table_name) REFERENCES gpkg_contents(table_name),
  CONSTRAINT fk_gc_srs FOREIGN KEY (srs_id) REFERENCES gpkg_spatial_ref_sys (srs_id)
);
";

// gpkg_extensions: declares which extensions apply to a table or column.
pub(crate) const SQL_GPKG_EXTENSIONS: &str = "
CREATE TABLE IF NOT EXISTS gpkg_extensions (
  table_name TEXT,
  column_name TEXT,
  extension_name TEXT NOT NULL,
  definition TEXT NOT NULL,
  scope TEXT NOT NULL,
  CONSTRAINT ge_tce UNIQUE (table_name, column_name, extension_name)
);
";

pub(crate) const SQL_INSERT_GPKG_CONTENTS: &str = "
INSERT INTO gpkg_contents
  (table_name, data_type, identifier, description, srs_id)
VALUES
  (?1, 'features', ?1, ?2, ?3)
";

pub(crate) const SQL_INSERT_GPKG_GEOMETRY_COLUMNS: &str = "
INSERT INTO gpkg_geometry_columns
  (table_name, column_name, geometry_type_name, srs_id, z, m)
VALUES
  (?1, 'geom', ?2, ?3, 0, 0)
";

pub(crate) const SQL_INSERT_GPKG_RTREE_EXTENSION: &str = "
INSERT OR IGNORE INTO gpkg_extensions
  (table_name, column_name, extension_name, definition, scope)
VALUES
  (?1, 'geom', 'gpkg_rtree_index', 'http://www.geopackage.org/spec120/#extension_rtree', 'write-only')
";

pub(crate) const SQL_DELETE_GPKG_REGISTRATION: [&str; 3] = [
    "DELETE FROM gpkg_geometry_columns WHERE table_name = ?1",
    "DELETE FROM gpkg_extensions WHERE table_name = ?1",
    "DELETE FROM gpkg_contents WHERE table_name = ?1",
];

pub(crate) const SQL_TABLE_EXISTS: &str =
    "SELECT EXISTS(SELECT 1 FROM sqlite_master WHERE type = 'table' AND name = ?1)";

pub(crate) const SQL_TABLE_COLUMNS: &str = "SELECT name, type FROM pragma_table_info(?1)";

pub(crate) const SQL_LIST_REGISTERED_TABLES: &str =
    "SELECT table_name FROM gpkg_contents WHERE data_type = 'features' ORDER BY table_name";

pub(crate) fn initialize_store(conn: &rusqlite::Connection) -> rusqlite::Result<()> {
    conn.execute_batch(SQL_GPKG_SPATIAL_REF_SYS)?;
    register_default_srs_ids(conn)?;
    conn.execute_batch(SQL_GPKG_CONTENTS)?;
    conn.execute_batch(SQL_GPKG_GEOMETRY_COLUMNS)?;
    conn.execute_batch(SQL_GPKG_EXTENSIONS)?;
    conn.execute_batch(SQL_LAYER_NAME)?;
    conn.execute_batch(SQL_LAYER_COLUMN)?;
    Ok(())
}

fn register_default_srs_ids(conn: &rusqlite::Connection) -> rusqlite::Result<()> {
    const EPSG4326_WKT: &str = r#"GEOGCS["WGS 84",DATUM["WGS_1984",SPHEROID["WGS 84",6378137,298.257223563,AUTHORITY["EPSG","7030"]],AUTHORITY["EPSG","6326"]],PRIMEM["Greenwich",0,AUTHORITY["EPSG","8901"]],UNIT["degree",0.0174532925199433,AUTHORITY["EPSG","9122"]],AXIS["Latitude",NORTH],AXIS["Longitude",EAST],AUTHORITY["EPSG","4326"]]"#;

    let sql = "INSERT OR IGNORE INTO gpkg_spatial_ref_sys \
            (srs_name, srs_id, organization, organization_coordsys_id, definition, description) \
            VALUES (?1, ?2, ?3, ?4, ?5, ?6)";
    conn.execute(
        sql,
        rusqlite::params!["WGS 84", 4326, "EPSG", 4326, EPSG4326_WKT, "WGS 84"],
    )?;
    conn.execute(
        sql,
        rusqlite::params![
            "Undefined Cartesian SRS",
            -1,
            "NONE",
            -1,
            "undefined",
            "undefined Cartesian coordinate reference system"
        ],
    )?;
    conn.execute(
        sql,
        rusqlite::params![
            "Undefined geographic SRS",
            0,
            "NONE",
            0,
            "undefined",
            "undefined geographic coordinate reference system"
        ],
    )?;
    Ok(())
}

pub(crate) fn sql_create_layer_table(formid: &Ident, geometry_column_type: &str) -> String {
    format!(
        r#"CREATE TABLE IF NOT EXISTS {t} (
  "id" INTEGER PRIMARY KEY AUTOINCREMENT,
  "refid" TEXT,
  "geom" {geometry_column_type},
  "ts" TIMESTAMP NOT NULL DEFAULT (strftime('%Y-%m-%d %H:%M:%S','now')),
  "style" TEXT
)"#,
        t = formid.quoted(),
    )
}

pub(crate) fn sql_drop_table(formid: &Ident) -> String {
    format!("DROP TABLE IF EXISTS {}", formid.quoted())
}

pub(crate) fn sql_add_column(formid: &Ident, col_id: &Ident, physical_type: &str) -> String {
    format!(
        "ALTER TABLE {} ADD COLUMN {} {physical_type}",
        formid.quoted(),
        col_id.quoted()
    )
}

pub(crate) fn sql_drop_column(formid: &Ident, col_id: &Ident) -> String {
    format!(
        "ALTER TABLE {} DROP COLUMN {}",
        formid.quoted(),
        col_id.quoted()
    )
}

/// `"id", "refid", "geom", "ts", "style", <attribute columns>`.
pub(crate) fn feature_select_list(columns: &[Ident]) -> String {
    let mut list = String::from(r#""id", "refid", "geom", "ts", "style""#);
    for column in columns {
        list.push_str(", ");
        list.push_str(&column.quoted());
    }
    list
}

pub(crate) fn sql_select_features(formid: &Ident, columns: &[Ident], filter: &str) -> String {
    format!(
        r#"SELECT {} FROM {} {filter} ORDER BY "ts" DESC, "id" DESC"#,
        feature_select_list(columns),
        formid.quoted(),
    )
}

pub(crate) fn sql_insert_feature(formid: &Ident, columns: &[&Ident]) -> String {
    let mut names = vec![
        r#""refid""#.to_string(),
        r#""geom""#.to_string(),
        r#""ts""#.to_string(),
    ];
    names.extend(columns.iter().map(|c| c.quoted()));
    let placeholders = (1..=names.len())
        .map(|i| format!("?{i}"))
        .collect::<Vec<String>>()
        .join(", ");

    format!(
        "INSERT INTO {} ({}) VALUES ({placeholders})",
        formid.quoted(),
        names.join(", ")
    )
}

pub(crate) fn sql_update_feature(formid: &Ident, columns: &[&Ident]) -> String {
    let assignments = columns
        .iter()
        .enumerate()
        .map(|(idx, name)| format!("{}=?{}", name.quoted(), idx + 1))
        .collect::<Vec<String>>()
        .join(", ");
    let id_idx = columns.len() + 1;

    format!(
        r#"UPDATE {} SET {assignments} WHERE "id"=?{id_idx}"#,
        formid.quoted()
    )
}

// cf. https://www.geopackage.org/spec140/index.html#extension_rtree
fn rtree_name(table: &Ident) -> String {
    format!(r#""rtree_{}_geom""#, table.as_str())
}

pub(crate) fn gpkg_rtree_create_sql(table: &Ident) -> String {
    format!(
        "CREATE VIRTUAL TABLE IF NOT EXISTS {} USING rtree(id, minx, maxx, miny, maxy);",
        rtree_name(table)
    )
}

pub(crate) fn gpkg_rtree_drop_sql(table: &Ident) -> String {
    format!("DROP TABLE IF EXISTS {};", rtree_name(table))
}

pub(crate) fn gpkg_rtree_load_sql(table: &Ident) -> String {
    format!(
        r#"INSERT OR REPLACE INTO {r}
  SELECT "id", ST_MinX("geom"), ST_MaxX("geom"), ST_MinY("geom"), ST_MaxY("geom")
  FROM {t} WHERE "geom" NOT NULL AND NOT ST_IsEmpty("geom");"#,
        r = rtree_name(table),
        t = table.quoted(),
    )
}

// Feature ids never change, so only the insert, geometry-update and delete
// triggers are needed.
pub(crate) fn gpkg_rtree_triggers_sql(table: &Ident) -> String {
    format!(
        r#"CREATE TRIGGER IF NOT EXISTS "rtree_{n}_geom_insert" AFTER INSERT ON {t}
  WHEN (NEW."geom" NOT NULL AND NOT ST_IsEmpty(NEW."geom"))
BEGIN
  INSERT OR REPLACE INTO {r} VALUES (
    NEW."id",
    ST_MinX(NEW."geom"), ST_MaxX(NEW."geom"),
    ST_MinY(NEW."geom"), ST_MaxY(NEW."geom")
  );
END;

CREATE TRIGGER IF NOT EXISTS "rtree_{n}_geom_update" AFTER UPDATE OF "geom" ON {t}
  WHEN (NEW."geom" NOT NULL AND NOT ST_IsEmpty(NEW."geom"))
BEGIN
  INSERT OR REPLACE INTO {r} VALUES (
    NEW."id",
    ST_MinX(NEW."geom"), ST_MaxX(NEW."geom"),
    ST_MinY(NEW."geom"), ST_MaxY(NEW."geom")
  );
END;

CREATE TRIGGER IF NOT EXISTS "rtree_{n}_geom_update_empty" AFTER UPDATE OF "geom" ON {t}
  WHEN (NEW."geom" ISNULL OR ST_IsEmpty(NEW."geom"))
BEGIN
  DELETE FROM {r} WHERE id = OLD."id";
END;

CREATE TRIGGER IF NOT EXISTS "rtree_{n}_geom_delete" AFTER DELETE ON {t}
  WHEN OLD."geom" NOT NULL
BEGIN
  DELETE FROM {r} WHERE id = OLD."id";
END;"#,
        n = table.as_str(),
        t = table.quoted(),
        r = rtree_name(table),
    )
}

pub(crate) fn execute_rtree_sqls(conn: &rusqlite::Connection, table: &Ident) -> rusqlite::Result<()> {
    conn.execute_batch(&gpkg_rtree_create_sql(table))?;
    conn.execute_batch(&gpkg_rtree_load_sql(table))?;
    conn.execute_batch(&gpkg_rtree_triggers_sql(table))?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn builds_quoted_insert_and_update() -> crate::Result<()> {
        let formid = Ident::parse("fid_1_abc")?;
        let col = Ident::parse("fid_1_abc_0")?;

        assert_eq!(
            sql_insert_feature(&formid, &[&col]),
            r#"INSERT INTO "fid_1_abc" ("refid", "geom", "ts", "fid_1_abc_0") VALUES (?1, ?2, ?3, ?4)"#
        );
        assert_eq!(
            sql_update_feature(&formid, &[&col]),
            r#"UPDATE "fid_1_abc" SET "fid_1_abc_0"=?1 WHERE "id"=?2"#
        );
        Ok(())
    }

    #[test]
    fn initialize_is_idempotent() -> crate::Result<()> {
        let conn = rusqlite::Connection::open_in_memory()?;
        initialize_store(&conn)?;
        initialize_store(&conn)?;
        let srs_count: i64 =
            conn.query_row("SELECT COUNT(*) FROM gpkg_spatial_ref_sys", [], |row| {
                row.get(0)
            })?;
        assert_eq!(srs_count, 3);
        Ok(())
    }
}
