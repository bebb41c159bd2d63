//! Tagged column values.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::fmt;
use uuid::Uuid;

/// A single column value carried by a [`SyncRow`](crate::SyncRow).
///
/// Rows are schema-described: the owning table declares the column
/// order and types, and each cell is one of these variants.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum SyncValue {
    /// SQL `NULL`.
    Null,
    /// Boolean value.
    Boolean(bool),
    /// Signed 64-bit integer.
    Integer(i64),
    /// Double precision floating point.
    Real(f64),
    /// Exact decimal in canonical textual form (e.g. `"12.50"`).
    Decimal(String),
    /// UTF-8 text.
    Text(String),
    /// Binary data.
    Blob(#[serde(with = "serde_bytes")] Vec<u8>),
    /// UTC timestamp.
    DateTime(DateTime<Utc>),
    /// Globally unique identifier.
    Guid(Uuid),
}

impl SyncValue {
    /// Rank of the variant used to order values of different types.
    fn rank(&self) -> u8 {
        match self {
            SyncValue::Null => 0,
            SyncValue::Boolean(_) => 1,
            SyncValue::Integer(_) => 2,
            SyncValue::Real(_) => 3,
            SyncValue::Decimal(_) => 4,
            SyncValue::Text(_) => 5,
            SyncValue::Blob(_) => 6,
            SyncValue::DateTime(_) => 7,
            SyncValue::Guid(_) => 8,
        }
    }

    /// Total order over values.
    ///
    /// Values of different variants order by variant; reals use
    /// `f64::total_cmp`. Used for primary-key ordering.
    pub fn cmp_total(&self, other: &Self) -> Ordering {
        match (self, other) {
            (SyncValue::Null, SyncValue::Null) => Ordering::Equal,
            (SyncValue::Boolean(a), SyncValue::Boolean(b)) => a.cmp(b),
            (SyncValue::Integer(a), SyncValue::Integer(b)) => a.cmp(b),
            (SyncValue::Real(a), SyncValue::Real(b)) => a.total_cmp(b),
            (SyncValue::Decimal(a), SyncValue::Decimal(b)) => a.cmp(b),
            (SyncValue::Text(a), SyncValue::Text(b)) => a.cmp(b),
            (SyncValue::Blob(a), SyncValue::Blob(b)) => a.cmp(b),
            (SyncValue::DateTime(a), SyncValue::DateTime(b)) => a.cmp(b),
            (SyncValue::Guid(a), SyncValue::Guid(b)) => a.cmp(b),
            _ => self.rank().cmp(&other.rank()),
        }
    }

    /// Name of the variant, as used in diagnostics.
    pub fn type_name(&self) -> &'static str {
        match self {
            SyncValue::Null => "null",
            SyncValue::Boolean(_) => "boolean",
            SyncValue::Integer(_) => "integer",
            SyncValue::Real(_) => "real",
            SyncValue::Decimal(_) => "decimal",
            SyncValue::Text(_) => "text",
            SyncValue::Blob(_) => "blob",
            SyncValue::DateTime(_) => "datetime",
            SyncValue::Guid(_) => "guid",
        }
    }

    /// Check if this value is null.
    pub fn is_null(&self) -> bool {
        matches!(self, SyncValue::Null)
    }

    /// Get this value as a boolean, if it is one.
    pub fn as_bool(&self) -> Option<bool> {
        match self {
            SyncValue::Boolean(b) => Some(*b),
            _ => None,
        }
    }

    /// Get this value as an integer, if it is one.
    pub fn as_integer(&self) -> Option<i64> {
        match self {
            SyncValue::Integer(n) => Some(*n),
            _ => None,
        }
    }

    /// Get this value as text, if it is text.
    pub fn as_text(&self) -> Option<&str> {
        match self {
            SyncValue::Text(s) => Some(s),
            _ => None,
        }
    }

    /// Get this value as a guid, if it is one.
    pub fn as_guid(&self) -> Option<Uuid> {
        match self {
            SyncValue::Guid(id) => Some(*id),
            _ => None,
        }
    }
}

impl fmt::Display for SyncValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SyncValue::Null => f.write_str("NULL"),
            SyncValue::Boolean(b) => write!(f, "{b}"),
            SyncValue::Integer(n) => write!(f, "{n}"),
            SyncValue::Real(r) => write!(f, "{r}"),
            SyncValue::Decimal(d) => f.write_str(d),
            SyncValue::Text(s) => write!(f, "'{s}'"),
            SyncValue::Blob(b) => write!(f, "<{} bytes>", b.len()),
            SyncValue::DateTime(ts) => write!(f, "{}", ts.to_rfc3339()),
            SyncValue::Guid(id) => write!(f, "{id}"),
        }
    }
}

impl From<bool> for SyncValue {
    fn from(b: bool) -> Self {
        SyncValue::Boolean(b)
    }
}

impl From<i64> for SyncValue {
    fn from(n: i64) -> Self {
        SyncValue::Integer(n)
    }
}

impl From<i32> for SyncValue {
    fn from(n: i32) -> Self {
        SyncValue::Integer(i64::from(n))
    }
}

impl From<f64> for SyncValue {
    fn from(r: f64) -> Self {
        SyncValue::Real(r)
    }
}

impl From<String> for SyncValue {
    fn from(s: String) -> Self {
        SyncValue::Text(s)
    }
}

impl From<&str> for SyncValue {
    fn from(s: &str) -> Self {
        SyncValue::Text(s.to_string())
    }
}

impl From<Vec<u8>> for SyncValue {
    fn from(b: Vec<u8>) -> Self {
        SyncValue::Blob(b)
    }
}

impl From<DateTime<Utc>> for SyncValue {
    fn from(ts: DateTime<Utc>) -> Self {
        SyncValue::DateTime(ts)
    }
}

impl From<Uuid> for SyncValue {
    fn from(id: Uuid) -> Self {
        SyncValue::Guid(id)
    }
}

impl<T: Into<SyncValue>> From<Option<T>> for SyncValue {
    fn from(value: Option<T>) -> Self {
        value.map_or(SyncValue::Null, Into::into)
    }
}
