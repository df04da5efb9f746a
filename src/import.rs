//! Bulk import of tabular rows into a new layer.

use indexmap::{IndexMap, IndexSet};
use rusqlite::{Connection, TransactionBehavior};
use serde::Serialize;
use std::io::Read;
use tracing::{debug, info, warn};

use crate::catalog::{Catalog, LayerSchema};
use crate::error::{GeoLayerError, Result};
use crate::features::FeatureStore;
use crate::ident::Ident;
use crate::schema::SchemaSync;
use crate::types::{LayerType, LogicalType, NewColumn};

/// Header to raw value, in header order.
pub type ImportRow = IndexMap<String, String>;

const LAT_NAMES: [&str; 3] = ["ละติจูด", "latitude", "lat"];
const LNG_NAMES: [&str; 4] = ["ลองจิจูด", "longitude", "long", "lng"];

pub(crate) const LAT_COLUMN: &str = "lat";
pub(crate) const LNG_COLUMN: &str = "lng";

/// Outcome of an import. `inserted + failed` is the number of input rows.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct ImportReport {
    pub formid: String,
    pub inserted: usize,
    pub failed: usize,
}

/// Read UTF-8 CSV with a header row.
///
/// A repeated header gets a `_2`, `_3`, ... suffix so every cell keeps its
/// own column.
pub fn read_csv<R: Read>(reader: R) -> Result<Vec<ImportRow>> {
    let mut reader = csv::ReaderBuilder::new().flexible(true).from_reader(reader);
    let headers = unique_headers(reader.headers()?);
    let mut rows = Vec::new();
    for record in reader.records() {
        let record = record?;
        let row = headers
            .iter()
            .enumerate()
            .map(|(idx, header)| {
                (
                    header.clone(),
                    record.get(idx).unwrap_or_default().to_string(),
                )
            })
            .collect::<ImportRow>();
        rows.push(row);
    }
    Ok(rows)
}

fn unique_headers(headers: &csv::StringRecord) -> IndexSet<String> {
    let mut unique = IndexSet::with_capacity(headers.len());
    for header in headers {
        let base = header.trim();
        let mut name = base.to_string();
        let mut n = 1;
        while unique.contains(&name) {
            n += 1;
            name = format!("{base}_{n}");
        }
        unique.insert(name);
    }
    unique
}

fn matches_pool(header: &str, pool: &[&str]) -> bool {
    let lower = header.trim().to_lowercase();
    pool.iter().any(|name| *name == lower)
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum ColumnRole {
    Lat,
    Lng,
    Generic(LogicalType),
}

/// One header and what it becomes.
#[derive(Clone, Debug)]
struct PlannedColumn {
    header: String,
    role: ColumnRole,
}

impl PlannedColumn {
    fn logical_type(&self) -> LogicalType {
        match self.role {
            ColumnRole::Lat | ColumnRole::Lng => LogicalType::Numeric,
            ColumnRole::Generic(logical) => logical,
        }
    }
}

/// Decide the columns from the headers of the first row.
///
/// The first latitude-like and longitude-like headers become the reserved
/// `lat`/`lng` columns. Later matches of either pool are ordinary numeric
/// columns; every other header is text.
fn plan_columns(first: &ImportRow) -> Vec<PlannedColumn> {
    let mut has_lat = false;
    let mut has_lng = false;
    first
        .keys()
        .map(|header| {
            let is_lat = matches_pool(header, &LAT_NAMES);
            let is_lng = matches_pool(header, &LNG_NAMES);
            let role = if is_lat && !has_lat {
                has_lat = true;
                ColumnRole::Lat
            } else if is_lng && !has_lng {
                has_lng = true;
                ColumnRole::Lng
            } else if is_lat || is_lng {
                ColumnRole::Generic(LogicalType::Numeric)
            } else {
                ColumnRole::Generic(LogicalType::Text)
            };
            PlannedColumn {
                header: header.clone(),
                role,
            }
        })
        .collect()
}

/// Numeric cells that do not parse are stored as 0.
fn normalize_numeric(raw: &str) -> String {
    let trimmed = raw.trim();
    match trimmed.parse::<f64>() {
        Ok(v) if v.is_finite() => trimmed.to_string(),
        _ => "0".to_string(),
    }
}

/// Create a layer from `rows` and insert one feature per row.
///
/// Once the layer exists the import always reports back: rows that could
/// not be stored are counted in [`ImportReport::failed`] instead of failing
/// the call.
pub(crate) fn import_rows(
    conn: &mut Connection,
    division: &str,
    layername: &str,
    layertype: LayerType,
    rows: &[ImportRow],
    batch_size: usize,
) -> Result<ImportReport> {
    let first = rows.first().ok_or(GeoLayerError::EmptyInput)?;
    let plan = plan_columns(first);
    let (layer_schema, col_ids) =
        create_import_layer(conn, division, layername, layertype, &plan)?;
    let formid = layer_schema.layer.formid.clone();

    let (inserted, failed) = insert_rows(conn, &layer_schema, &plan, &col_ids, rows, batch_size);

    let has_lat = plan.iter().any(|c| c.role == ColumnRole::Lat);
    let has_lng = plan.iter().any(|c| c.role == ColumnRole::Lng);
    if has_lat && has_lng {
        if layertype == LayerType::Point {
            match derive_geometry(conn, layer_schema) {
                Ok(located) => debug!(formid = formid.as_str(), located, "derived point geometry"),
                Err(err) => {
                    warn!(formid = formid.as_str(), error = %err, "point geometry derivation failed")
                }
            }
        } else {
            warn!(
                formid = formid.as_str(),
                %layertype,
                "lat/lng columns found but the layer is not a point layer; geometry left empty"
            );
        }
    }

    info!(formid = formid.as_str(), inserted, failed, "import finished");
    Ok(ImportReport {
        formid,
        inserted,
        failed,
    })
}

/// Create the layer, its table and one column per planned header. All of it
/// commits together. Returns the schema and the col_id of every planned column.
fn create_import_layer(
    conn: &mut Connection,
    division: &str,
    layername: &str,
    layertype: LayerType,
    plan: &[PlannedColumn],
) -> Result<(LayerSchema, Vec<String>)> {
    let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
    let (layer_schema, col_ids) = {
        let catalog = Catalog::new(&tx);
        let schema = SchemaSync::new(&tx);
        let layer = catalog.create_layer(division, layername, layertype)?;
        let formid = Ident::parse(&layer.formid)?;
        schema.materialize_layer(&formid, layertype)?;

        let mut col_ids = Vec::with_capacity(plan.len());
        for column in plan {
            let logical = column.logical_type();
            let def = match column.role {
                ColumnRole::Lat | ColumnRole::Lng => {
                    let col_id = if column.role == ColumnRole::Lat {
                        LAT_COLUMN
                    } else {
                        LNG_COLUMN
                    };
                    catalog.insert_column(
                        &formid,
                        &Ident::parse_column(col_id)?,
                        &column.header,
                        logical,
                        &column.header,
                    )?
                }
                ColumnRole::Generic(_) => catalog.add_column(
                    formid.as_str(),
                    &NewColumn {
                        name: column.header.clone(),
                        column_type: logical,
                        desc: column.header.clone(),
                    },
                )?,
            };
            schema.materialize_column(&formid, &Ident::parse(&def.col_id)?, logical)?;
            col_ids.push(def.col_id);
        }
        (catalog.layer_schema(formid.as_str())?, col_ids)
    };
    tx.commit()?;
    Ok((layer_schema, col_ids))
}

/// Insert `rows` in transactions of `batch_size` rows. Returns the inserted
/// and failed counts.
///
/// A row the store rejects is skipped. A batch that cannot begin or commit
/// stops the import; its rows and all later rows count as failed.
fn insert_rows(
    conn: &mut Connection,
    layer_schema: &LayerSchema,
    plan: &[PlannedColumn],
    col_ids: &[String],
    rows: &[ImportRow],
    batch_size: usize,
) -> (usize, usize) {
    let formid = layer_schema.layer.formid.as_str();
    let mut inserted = 0;
    let mut failed = 0;
    for batch in rows.chunks(batch_size.max(1)) {
        match insert_batch(conn, layer_schema, plan, col_ids, batch) {
            Ok((batch_inserted, batch_failed)) => {
                inserted += batch_inserted;
                failed += batch_failed;
            }
            Err(err) => {
                let remaining = rows.len() - inserted - failed;
                warn!(formid, error = %err, remaining, "import batch failed; stopping");
                failed += remaining;
                break;
            }
        }
    }
    (inserted, failed)
}

fn insert_batch(
    conn: &mut Connection,
    layer_schema: &LayerSchema,
    plan: &[PlannedColumn],
    col_ids: &[String],
    batch: &[ImportRow],
) -> Result<(usize, usize)> {
    let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
    let mut inserted = 0;
    let mut failed = 0;
    {
        let store = FeatureStore::new(&tx, layer_schema.clone())?;
        for row in batch {
            let attributes = plan.iter().zip(col_ids).map(|(column, col_id)| {
                let raw = row.get(&column.header).map_or("", String::as_str);
                let value = if column.logical_type().is_numeric() {
                    normalize_numeric(raw)
                } else {
                    raw.to_string()
                };
                (col_id.as_str(), value)
            });
            match store.insert_feature(None, attributes) {
                Ok(_) => inserted += 1,
                Err(err) => {
                    debug!(formid = layer_schema.layer.formid.as_str(), error = %err, "import row failed");
                    failed += 1;
                }
            }
        }
    }
    tx.commit()?;
    Ok((inserted, failed))
}

fn derive_geometry(conn: &Connection, layer_schema: LayerSchema) -> Result<usize> {
    let lat = Ident::parse_column(LAT_COLUMN)?;
    let lng = Ident::parse_column(LNG_COLUMN)?;
    FeatureStore::new(conn, layer_schema)?.derive_point_geometry(&lat, &lng)
}
