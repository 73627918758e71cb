//! Database value types
//!
//! This module defines the values bound into generated SQL and the rows read
//! back from result sets.

use serde::{Deserialize, Serialize};

/// Database value that can hold different types
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum DatabaseValue {
    /// Null value
    Null,
    /// Boolean value
    Bool(bool),
    /// 32-bit integer
    Int(i32),
    /// 64-bit integer
    Long(i64),
    /// 32-bit floating point
    Float(f32),
    /// 64-bit floating point
    Double(f64),
    /// String value
    String(String),
    /// Binary data
    Bytes(Vec<u8>),
    /// Timestamp (Unix timestamp in microseconds)
    Timestamp(i64),
}

impl DatabaseValue {
    /// Boolean reading; strings accept `t`/`f`, `yes`/`no` and `1`/`0`
    pub fn as_bool(&self) -> Option<bool> {
        match self {
            Self::Bool(v) => Some(*v),
            Self::Int(v) => Some(*v != 0),
            Self::Long(v) => Some(*v != 0),
            Self::String(s) => match s.to_ascii_lowercase().as_str() {
                "true" | "t" | "1" | "yes" => Some(true),
                "false" | "f" | "0" | "no" => Some(false),
                _ => None,
            },
            _ => None,
        }
    }

    pub fn as_int(&self) -> Option<i32> {
        self.as_long().and_then(|v| i32::try_from(v).ok())
    }

    /// Integer reading; textual results (as MySQL returns them) are parsed
    pub fn as_long(&self) -> Option<i64> {
        match self {
            Self::Long(v) | Self::Timestamp(v) => Some(*v),
            Self::Int(v) => Some(i64::from(*v)),
            Self::Bool(v) => Some(i64::from(*v)),
            Self::String(s) => s.trim().parse().ok(),
            Self::Bytes(b) => std::str::from_utf8(b).ok()?.trim().parse().ok(),
            _ => None,
        }
    }

    pub fn as_double(&self) -> Option<f64> {
        match self {
            Self::Double(v) => Some(*v),
            Self::Float(v) => Some(f64::from(*v)),
            Self::String(s) => s.trim().parse().ok(),
            other => other.as_long().map(|v| v as f64),
        }
    }

    /// Borrow the text of a `String` value
    pub fn as_str(&self) -> Option<&str> {
        match self {
            Self::String(s) => Some(s.as_str()),
            _ => None,
        }
    }

    /// Render the value as text; `Null` renders as `"null"`
    pub fn as_string(&self) -> String {
        match self {
            Self::Null => "null".to_string(),
            Self::Bool(v) => v.to_string(),
            Self::Int(v) => v.to_string(),
            Self::Long(v) | Self::Timestamp(v) => v.to_string(),
            Self::Float(v) => v.to_string(),
            Self::Double(v) => v.to_string(),
            Self::String(s) => s.clone(),
            Self::Bytes(b) => String::from_utf8_lossy(b).into_owned(),
        }
    }

    pub fn as_bytes(&self) -> Option<&[u8]> {
        match self {
            Self::Bytes(b) => Some(b),
            Self::String(s) => Some(s.as_bytes()),
            _ => None,
        }
    }

    pub fn is_null(&self) -> bool {
        matches!(self, Self::Null)
    }

    /// Loose truthiness used when reading flag-like scalar results
    /// (e.g. `GET_LOCK()` or `pg_try_advisory_lock()`)
    pub fn is_truthy(&self) -> bool {
        match self {
            Self::Null => false,
            Self::Bytes(b) => !b.is_empty() && b.as_slice() != b"0",
            Self::Double(v) => *v != 0.0,
            Self::Float(v) => *v != 0.0,
            other => other.as_bool().unwrap_or(true),
        }
    }
}

macro_rules! impl_from_scalar {
    ($($ty:ty => $variant:ident),* $(,)?) => {
        $(
            impl From<$ty> for DatabaseValue {
                fn from(v: $ty) -> Self {
                    Self::$variant(v.into())
                }
            }
        )*
    };
}

impl_from_scalar! {
    bool => Bool,
    i32 => Int,
    i64 => Long,
    f32 => Float,
    f64 => Double,
    String => String,
    &str => String,
    Vec<u8> => Bytes,
    &[u8] => Bytes,
}

impl From<u32> for DatabaseValue {
    fn from(v: u32) -> Self {
        Self::Long(i64::from(v))
    }
}

impl<T: Into<DatabaseValue>> From<Option<T>> for DatabaseValue {
    fn from(v: Option<T>) -> Self {
        v.map_or(Self::Null, Into::into)
    }
}

/// One result row, keeping the column order of the statement
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct DatabaseRow {
    columns: Vec<String>,
    values: Vec<DatabaseValue>,
}

impl DatabaseRow {
    /// Create an empty row
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a column; a repeated name shadows the earlier column on lookup
    pub fn insert(&mut self, column: impl Into<String>, value: DatabaseValue) {
        self.columns.push(column.into());
        self.values.push(value);
    }

    /// Look up a column by name (last column with that name wins)
    pub fn get(&self, column: &str) -> Option<&DatabaseValue> {
        self.columns
            .iter()
            .rposition(|c| c == column)
            .map(|idx| &self.values[idx])
    }

    /// Look up a column by position
    pub fn get_index(&self, index: usize) -> Option<&DatabaseValue> {
        self.values.get(index)
    }

    /// Column names in statement order
    pub fn columns(&self) -> &[String] {
        &self.columns
    }

    /// Number of columns
    pub fn len(&self) -> usize {
        self.values.len()
    }

    /// Whether the row has no columns
    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    /// Iterate `(column, value)` pairs in statement order
    pub fn iter(&self) -> impl Iterator<Item = (&str, &DatabaseValue)> {
        self.columns
            .iter()
            .map(String::as_str)
            .zip(self.values.iter())
    }
}

impl<K: Into<String>, V: Into<DatabaseValue>> FromIterator<(K, V)> for DatabaseRow {
    fn from_iter<I: IntoIterator<Item = (K, V)>>(iter: I) -> Self {
        let mut row = DatabaseRow::new();
        for (k, v) in iter {
            row.insert(k, v.into());
        }
        row
    }
}

/// Multiple rows returned from a query
pub type DatabaseResult = Vec<DatabaseRow>;

/// What a successful `query()` hands back to the caller
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ResultWrapper {
    rows: DatabaseResult,
    affected_rows: u64,
    insert_id: Option<i64>,
}

impl ResultWrapper {
    pub(crate) fn new(rows: DatabaseResult, affected_rows: u64, insert_id: Option<i64>) -> Self {
        Self {
            rows,
            affected_rows,
            insert_id,
        }
    }

    /// Rows produced by a read; empty for writes
    pub fn rows(&self) -> &[DatabaseRow] {
        &self.rows
    }

    /// Consume the wrapper, keeping the rows
    pub fn into_rows(self) -> DatabaseResult {
        self.rows
    }

    /// Number of rows in the result set
    pub fn num_rows(&self) -> usize {
        self.rows.len()
    }

    /// Rows changed by a write
    pub fn affected_rows(&self) -> u64 {
        self.affected_rows
    }

    /// Auto-increment value generated by an insert, when the backend reports one
    pub fn insert_id(&self) -> Option<i64> {
        self.insert_id
    }

    /// First row, if any
    pub fn first(&self) -> Option<&DatabaseRow> {
        self.rows.first()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_value_conversions() {
        let val = DatabaseValue::Int(42);
        assert_eq!(val.as_int(), Some(42));
        assert_eq!(val.as_long(), Some(42));
        assert_eq!(val.as_string(), "42");

        let val = DatabaseValue::String("123".to_string());
        assert_eq!(val.as_int(), Some(123));
        assert_eq!(val.as_long(), Some(123));

        let val = DatabaseValue::Bool(true);
        assert_eq!(val.as_bool(), Some(true));
        assert_eq!(val.as_int(), Some(1));
    }

    #[test]
    fn test_value_from_types() {
        let val: DatabaseValue = 42.into();
        assert_eq!(val, DatabaseValue::Int(42));

        let val: DatabaseValue = "hello".into();
        assert_eq!(val, DatabaseValue::String("hello".to_string()));

        let val: DatabaseValue = Some(42).into();
        assert_eq!(val, DatabaseValue::Int(42));

        let val: DatabaseValue = Option::<i32>::None.into();
        assert_eq!(val, DatabaseValue::Null);
    }

    #[test]
    fn test_truthiness() {
        assert!(DatabaseValue::Long(1).is_truthy());
        assert!(!DatabaseValue::Long(0).is_truthy());
        assert!(!DatabaseValue::Null.is_truthy());
        assert!(DatabaseValue::String("t".into()).is_truthy());
        assert!(!DatabaseValue::String("f".into()).is_truthy());
        assert!(DatabaseValue::Bytes(b"1".to_vec()).is_truthy());
        assert!(!DatabaseValue::Bytes(b"0".to_vec()).is_truthy());
    }

    #[test]
    fn test_row_keeps_column_order() {
        let row: DatabaseRow = vec![("id", DatabaseValue::Long(1)), ("v", "x".into())]
            .into_iter()
            .collect();

        assert_eq!(row.columns(), &["id".to_string(), "v".to_string()]);
        assert_eq!(row.get("v"), Some(&DatabaseValue::String("x".into())));
        assert_eq!(row.get_index(0), Some(&DatabaseValue::Long(1)));
        assert_eq!(row.get("missing"), None);
        assert_eq!(row.len(), 2);
    }
}
