//! Identifiers that end up inside generated SQL.
//!
//! Table and column names cannot be bound as statement parameters, so every
//! name interpolated into DDL or DML goes through [`Ident`]. An `Ident` can
//! only be built by the generators below or by [`Ident::parse`], which
//! enforces the allow-list pattern.

use std::fmt;
use std::time::{SystemTime, UNIX_EPOCH};
use uuid::Uuid;

use crate::error::{GeoLayerError, Result};

pub const MAX_IDENT_LEN: usize = 63;

/// Columns every feature table carries. Attribute columns may not reuse them.
pub const RESERVED_COLUMNS: [&str; 5] = ["id", "refid", "geom", "ts", "style"];

const SQL_KEYWORDS: &[&str] = &[
    "abort", "add", "all", "alter", "and", "as", "asc", "attach", "begin", "between", "by",
    "cascade", "case", "cast", "check", "collate", "column", "commit", "constraint", "create",
    "cross", "current_date", "current_time", "current_timestamp", "database", "default",
    "delete", "desc", "detach", "distinct", "drop", "else", "end", "escape", "except", "exists",
    "foreign", "from", "full", "glob", "group", "having", "if", "in", "index", "inner", "insert",
    "intersect", "into", "is", "isnull", "join", "key", "left", "like", "limit", "match",
    "natural", "not", "notnull", "null", "of", "offset", "on", "or", "order", "outer", "pragma",
    "primary", "references", "regexp", "reindex", "release", "rename", "replace", "right",
    "rollback", "rowid", "savepoint", "select", "set", "table", "temp", "then", "to",
    "transaction", "trigger", "union", "unique", "update", "using", "vacuum", "values", "view",
    "virtual", "when", "where", "with",
];

/// A validated SQL identifier.
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Ident(String);

impl Ident {
    /// Validate a caller-supplied name against the allow-list.
    pub fn parse(name: &str) -> Result<Self> {
        let invalid = || GeoLayerError::InvalidIdentifier(name.to_string());

        let mut chars = name.chars();
        let first = chars.next().ok_or_else(invalid)?;
        if !(first.is_ascii_alphabetic() || first == '_') {
            return Err(invalid());
        }
        if name.len() > MAX_IDENT_LEN || !chars.all(|c| c.is_ascii_alphanumeric() || c == '_') {
            return Err(invalid());
        }
        let lower = name.to_ascii_lowercase();
        if SQL_KEYWORDS.binary_search(&lower.as_str()).is_ok() {
            return Err(invalid());
        }
        Ok(Self(name.to_string()))
    }

    /// Validate a name used as an attribute column.
    pub fn parse_column(name: &str) -> Result<Self> {
        let ident = Self::parse(name)?;
        if RESERVED_COLUMNS
            .iter()
            .any(|reserved| reserved.eq_ignore_ascii_case(name))
        {
            return Err(GeoLayerError::InvalidIdentifier(name.to_string()));
        }
        Ok(ident)
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// The identifier wrapped in double quotes, ready for interpolation.
    pub fn quoted(&self) -> String {
        format!(r#""{}""#, self.0)
    }
}

impl fmt::Display for Ident {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl AsRef<str> for Ident {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

fn unix_millis() -> u128 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis())
        .unwrap_or_default()
}

/// Generate a fresh layer id, e.g. `fid_1718000000000_3fa85f`.
pub fn new_layer_id() -> Ident {
    let random = Uuid::new_v4().simple().to_string();
    Ident(format!("fid_{}_{}", unix_millis(), &random[..6]))
}

/// Generate a fresh feature reference.
pub fn new_refid() -> String {
    format!("ref{}", Uuid::new_v4().simple())
}

/// `{formid}_{ordinal}`.
pub fn new_column_id(formid: &Ident, ordinal: u32) -> Ident {
    Ident(format!("{}_{ordinal}", formid.as_str()))
}

/// Ordinal of a generated column id, `None` for ids like `lat`.
pub(crate) fn column_ordinal(formid: &str, col_id: &str) -> Option<u32> {
    col_id
        .strip_prefix(formid)?
        .strip_prefix('_')?
        .parse::<u32>()
        .ok()
}

/// Next ordinal after the given column ids. Starts at 0 and never reuses.
pub(crate) fn next_ordinal<'a, I>(formid: &str, existing: I) -> u32
where
    I: IntoIterator<Item = &'a str>,
{
    existing
        .into_iter()
        .filter_map(|col_id| column_ordinal(formid, col_id))
        .max()
        .map_or(0, |max| max + 1)
}
