//! Feature rows of one layer.
//!
//! A [`FeatureStore`] is built from the catalog's [`LayerSchema`], so every
//! attribute column it names in SQL is a column the catalog knows about.

use chrono::{NaiveDateTime, Utc};
use indexmap::IndexMap;
use rusqlite::types::{Type, Value};
use rusqlite::{Connection, Row, params, params_from_iter};
use serde::Serialize;
use serde_json::Value as Json;
use std::fmt;
use std::str::FromStr;
use tracing::debug;

use crate::catalog::LayerSchema;
use crate::conversions::{coerce_value, parse_timestamp, value_to_json};
use crate::error::{GeoLayerError, Result, StorageContext};
use crate::geometry::{GeometryPayload, decode_feature_geometry, encode_feature_geometry};
use crate::ident::{Ident, new_refid};
use crate::ogc_sql::{TS_FORMAT, sql_insert_feature, sql_select_features, sql_update_feature};

// Fixed columns come first in every SELECT.
const ID_INDEX: usize = 0;
const REFID_INDEX: usize = 1;
const GEOMETRY_INDEX: usize = 2;
const TS_INDEX: usize = 3;
const STYLE_INDEX: usize = 4;
const FIRST_PROPERTY_INDEX: usize = 5;

/// One row of a layer, as handed back to callers.
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct Feature {
    pub id: i64,
    pub refid: Option<String>,
    /// GeoJSON geometry object.
    pub geometry: Option<Json>,
    pub ts: NaiveDateTime,
    pub style: Option<String>,
    /// col_id to value, in catalog column order.
    pub properties: IndexMap<String, Json>,
}

/// Time bucket for [`FeatureStore::aggregate`].
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum GroupBy {
    Day,
    Month,
    Year,
}

impl GroupBy {
    fn strftime_format(&self) -> &'static str {
        match self {
            Self::Day => "%Y-%m-%d",
            Self::Month => "%Y-%m",
            Self::Year => "%Y",
        }
    }
}

impl FromStr for GroupBy {
    type Err = GeoLayerError;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "day" => Ok(Self::Day),
            "month" => Ok(Self::Month),
            "year" => Ok(Self::Year),
            _ => Err(GeoLayerError::InvalidAggregate(format!("group by {s}"))),
        }
    }
}

impl fmt::Display for GroupBy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Day => "day",
            Self::Month => "month",
            Self::Year => "year",
        })
    }
}

/// What [`FeatureStore::aggregate`] computes per bucket.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Aggregate {
    Count,
    Sum { col_id: String },
}

impl Aggregate {
    /// Build from caller strings, e.g. `("sum", Some("fid_..._0"))`.
    pub fn parse(kind: &str, col_id: Option<&str>) -> Result<Self> {
        match (kind.to_ascii_lowercase().as_str(), col_id) {
            ("count", _) => Ok(Self::Count),
            ("sum", Some(col_id)) => Ok(Self::Sum {
                col_id: col_id.to_string(),
            }),
            ("sum", None) => Err(GeoLayerError::InvalidAggregate(
                "sum needs a column".to_string(),
            )),
            _ => Err(GeoLayerError::InvalidAggregate(kind.to_string())),
        }
    }
}

/// One month of [`FeatureStore::summarize`]: sums for numeric columns,
/// non-null counts for the rest.
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct MonthlySummary {
    pub month: String,
    pub values: Vec<(String, Option<f64>)>,
}

/// Queries and mutations on the feature table of one layer.
pub struct FeatureStore<'c> {
    conn: &'c Connection,
    formid: Ident,
    schema: LayerSchema,
    columns: Vec<Ident>,
}

impl<'c> FeatureStore<'c> {
    pub fn new(conn: &'c Connection, schema: LayerSchema) -> Result<Self> {
        let formid = Ident::parse(&schema.layer.formid)?;
        let columns = schema
            .columns
            .iter()
            .map(|c| Ident::parse(&c.col_id))
            .collect::<Result<Vec<_>>>()?;
        Ok(Self {
            conn,
            formid,
            schema,
            columns,
        })
    }

    pub fn schema(&self) -> &LayerSchema {
        &self.schema
    }

    fn formid(&self) -> &str {
        self.formid.as_str()
    }

    /// Resolve caller attributes against the catalog.
    ///
    /// Keys that are not catalog columns and empty values are skipped, so a
    /// partially filled form still saves. A non-empty value that does not
    /// fit the column type fails the whole call.
    fn resolve_attributes<I, K, V>(&self, attributes: I) -> Result<Vec<(usize, Value)>>
    where
        I: IntoIterator<Item = (K, V)>,
        K: AsRef<str>,
        V: AsRef<str>,
    {
        let mut resolved: Vec<(usize, Value)> = Vec::new();
        for (key, value) in attributes {
            let (key, value) = (key.as_ref(), value.as_ref());
            let Some(idx) = self.schema.columns.iter().position(|c| c.col_id == key) else {
                debug!(formid = self.formid(), key, "ignoring unknown attribute");
                continue;
            };
            if value.trim().is_empty() {
                debug!(formid = self.formid(), key, "ignoring empty attribute");
                continue;
            }
            let column = &self.schema.columns[idx];
            let value = coerce_value(&column.col_id, column.col_type, value)?;
            match resolved.iter_mut().find(|(i, _)| *i == idx) {
                Some(slot) => slot.1 = value,
                None => resolved.push((idx, value)),
            }
        }
        Ok(resolved)
    }

    /// Insert a feature stamped with the current time. Returns its refid.
    pub fn insert_feature<I, K, V>(
        &self,
        geometry: Option<&GeometryPayload>,
        attributes: I,
    ) -> Result<String>
    where
        I: IntoIterator<Item = (K, V)>,
        K: AsRef<str>,
        V: AsRef<str>,
    {
        self.insert_feature_at(geometry, attributes, Utc::now().naive_utc())
    }

    /// Insert a feature with an explicit creation time.
    pub fn insert_feature_at<I, K, V>(
        &self,
        geometry: Option<&GeometryPayload>,
        attributes: I,
        created_at: NaiveDateTime,
    ) -> Result<String>
    where
        I: IntoIterator<Item = (K, V)>,
        K: AsRef<str>,
        V: AsRef<str>,
    {
        let geom = geometry
            .map(|payload| decode_feature_geometry(payload, self.schema.layertype()))
            .transpose()?;
        let attributes = self.resolve_attributes(attributes)?;

        let refid = new_refid();
        let names = attributes
            .iter()
            .map(|(idx, _)| &self.columns[*idx])
            .collect::<Vec<_>>();
        let params = [
            Value::Text(refid.clone()),
            geom.map_or(Value::Null, Value::Blob),
            Value::Text(created_at.format(TS_FORMAT).to_string()),
        ]
        .into_iter()
        .chain(attributes.into_iter().map(|(_, value)| value));

        let sql = sql_insert_feature(&self.formid, &names);
        let mut stmt = self.conn.prepare_cached(&sql)?;
        stmt.execute(params_from_iter(params))
            .storage("insert feature", self.formid())?;
        Ok(refid)
    }

    /// Set the given attributes of an existing feature.
    pub fn update_feature<I, K, V>(&self, id: i64, attributes: I) -> Result<()>
    where
        I: IntoIterator<Item = (K, V)>,
        K: AsRef<str>,
        V: AsRef<str>,
    {
        let attributes = self.resolve_attributes(attributes)?;
        if attributes.is_empty() {
            return self.ensure_feature(id);
        }

        let names = attributes
            .iter()
            .map(|(idx, _)| &self.columns[*idx])
            .collect::<Vec<_>>();
        let params = attributes
            .into_iter()
            .map(|(_, value)| value)
            .chain(std::iter::once(Value::Integer(id)));

        let sql = sql_update_feature(&self.formid, &names);
        let mut stmt = self.conn.prepare_cached(&sql)?;
        let updated = stmt
            .execute(params_from_iter(params))
            .storage("update feature", self.formid())?;
        self.found(id, updated)
    }

    pub fn delete_feature(&self, id: i64) -> Result<()> {
        let sql = format!(r#"DELETE FROM {} WHERE "id" = ?1"#, self.formid.quoted());
        let deleted = self
            .conn
            .execute(&sql, [id])
            .storage("delete feature", self.formid())?;
        self.found(id, deleted)
    }

    /// Replace the style payload of a feature. `None` clears it.
    pub fn set_style(&self, id: i64, style: Option<&str>) -> Result<()> {
        let sql = format!(
            r#"UPDATE {} SET "style" = ?1 WHERE "id" = ?2"#,
            self.formid.quoted()
        );
        let updated = self
            .conn
            .execute(&sql, params![style, id])
            .storage("set style", self.formid())?;
        self.found(id, updated)
    }

    fn found(&self, id: i64, rows: usize) -> Result<()> {
        if rows == 0 {
            return Err(GeoLayerError::FeatureNotFound {
                formid: self.formid().to_string(),
                id,
            });
        }
        Ok(())
    }

    fn ensure_feature(&self, id: i64) -> Result<()> {
        let sql = format!(
            r#"SELECT EXISTS(SELECT 1 FROM {} WHERE "id" = ?1)"#,
            self.formid.quoted()
        );
        let exists: bool = self.conn.query_row(&sql, [id], |row| row.get(0))?;
        self.found(id, usize::from(exists))
    }

    fn feature_from_row(&self, row: &Row<'_>) -> rusqlite::Result<Feature> {
        let geometry = match row.get::<_, Option<Vec<u8>>>(GEOMETRY_INDEX)? {
            Some(blob) => Some(encode_feature_geometry(&blob).map_err(|err| {
                rusqlite::Error::FromSqlConversionFailure(GEOMETRY_INDEX, Type::Blob, Box::new(err))
            })?),
            None => None,
        };
        let ts: String = row.get(TS_INDEX)?;

        let mut properties = IndexMap::with_capacity(self.schema.columns.len());
        for (offset, column) in self.schema.columns.iter().enumerate() {
            let value: Value = row.get(FIRST_PROPERTY_INDEX + offset)?;
            properties.insert(
                column.col_id.clone(),
                value_to_json(value, Some(column.col_type)),
            );
        }

        Ok(Feature {
            id: row.get(ID_INDEX)?,
            refid: row.get(REFID_INDEX)?,
            geometry,
            ts: parse_timestamp(TS_INDEX, &ts)?,
            style: row.get(STYLE_INDEX)?,
            properties,
        })
    }

    fn select<P: rusqlite::Params>(&self, filter: &str, params: P) -> Result<Vec<Feature>> {
        let sql = sql_select_features(&self.formid, &self.columns, filter);
        let mut stmt = self.conn.prepare_cached(&sql)?;
        let features = stmt
            .query_map(params, |row| self.feature_from_row(row))?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(features)
    }

    /// All features, newest first.
    pub fn list_features(&self) -> Result<Vec<Feature>> {
        self.select("", [])
    }

    pub fn get_feature(&self, id: i64) -> Result<Feature> {
        self.select(r#"WHERE "id" = ?1"#, [id])?
            .into_iter()
            .next()
            .ok_or_else(|| GeoLayerError::FeatureNotFound {
                formid: self.formid().to_string(),
                id,
            })
    }

    /// Position of a catalog column. Unknown ids never reach SQL.
    fn column_index(&self, col_id: &str) -> Result<usize> {
        self.schema
            .columns
            .iter()
            .position(|c| c.col_id == col_id)
            .ok_or_else(|| GeoLayerError::ColumnNotFound {
                formid: self.formid().to_string(),
                col_id: col_id.to_string(),
            })
    }

    /// Distinct non-null values of a column, ascending.
    pub fn distinct_values(&self, col_id: &str) -> Result<Vec<Json>> {
        let idx = self.column_index(col_id)?;
        let column = &self.columns[idx];
        let logical = self.schema.columns[idx].col_type;
        let sql = format!(
            "SELECT DISTINCT {c} FROM {t} WHERE {c} IS NOT NULL ORDER BY {c}",
            c = column.quoted(),
            t = self.formid.quoted(),
        );
        let mut stmt = self.conn.prepare(&sql)?;
        let values = stmt
            .query_map([], |row| row.get::<_, Value>(0))?
            .map(|value| value.map(|v| value_to_json(v, Some(logical))))
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(values)
    }

    /// Features whose column equals `value`, newest first.
    pub fn search_by_column(&self, col_id: &str, value: &str) -> Result<Vec<Feature>> {
        let idx = self.column_index(col_id)?;
        let logical = self.schema.columns[idx].col_type;
        let value = coerce_value(col_id, logical, value)?;
        let filter = format!("WHERE {} = ?1", self.columns[idx].quoted());
        self.select(&filter, [value])
    }

    /// Bucket features by creation time and count them or sum a numeric
    /// column. Buckets are ascending.
    pub fn aggregate(&self, group_by: GroupBy, aggregate: &Aggregate) -> Result<Vec<(String, f64)>> {
        let expr = match aggregate {
            Aggregate::Count => "COUNT(*)".to_string(),
            Aggregate::Sum { col_id } => {
                let idx = self.column_index(col_id)?;
                let column = &self.schema.columns[idx];
                if !column.col_type.is_numeric() {
                    return Err(GeoLayerError::TypeMismatch {
                        col_id: col_id.clone(),
                        col_type: column.col_type.to_string(),
                    });
                }
                format!("COALESCE(SUM({}), 0)", self.columns[idx].quoted())
            }
        };
        let sql = format!(
            r#"SELECT strftime('{fmt}', "ts") AS bucket, {expr} FROM {t} GROUP BY bucket ORDER BY bucket"#,
            fmt = group_by.strftime_format(),
            t = self.formid.quoted(),
        );
        debug!(formid = self.formid(), %sql, "aggregate");
        let mut stmt = self.conn.prepare(&sql)?;
        let rows = stmt
            .query_map([], |row| Ok((row.get(0)?, row.get(1)?)))?
            .collect::<rusqlite::Result<Vec<(String, f64)>>>()?;
        Ok(rows)
    }

    /// Monthly report over every catalog column.
    pub fn summarize(&self) -> Result<Vec<MonthlySummary>> {
        if self.columns.is_empty() {
            return Ok(Vec::new());
        }
        let exprs = self
            .schema
            .columns
            .iter()
            .zip(&self.columns)
            .map(|(column, ident)| {
                if column.col_type.is_numeric() {
                    format!("SUM({})", ident.quoted())
                } else {
                    format!("COUNT({})", ident.quoted())
                }
            })
            .collect::<Vec<_>>()
            .join(", ");
        let sql = format!(
            r#"SELECT strftime('%Y-%m', "ts") AS bucket, {exprs} FROM {t} GROUP BY bucket ORDER BY bucket"#,
            t = self.formid.quoted(),
        );
        let mut stmt = self.conn.prepare(&sql)?;
        let rows = stmt
            .query_map([], |row| {
                let mut values = Vec::with_capacity(self.schema.columns.len());
                for (offset, column) in self.schema.columns.iter().enumerate() {
                    values.push((column.col_id.clone(), row.get::<_, Option<f64>>(offset + 1)?));
                }
                Ok(MonthlySummary {
                    month: row.get(0)?,
                    values,
                })
            })?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(rows)
    }

    /// Set `geom` to a point built from two numeric columns wherever both are
    /// positive. Returns the number of rows updated.
    pub(crate) fn derive_point_geometry(&self, lat: &Ident, lng: &Ident) -> Result<usize> {
        let sql = format!(
            r#"UPDATE {t} SET "geom" = ST_MakePoint({lng}, {lat}) WHERE {lat} > 0 AND {lng} > 0"#,
            t = self.formid.quoted(),
            lat = lat.quoted(),
            lng = lng.quoted(),
        );
        self.conn
            .execute(&sql, [])
            .storage("derive geometry", self.formid())
    }
}
