//! Result rows and the sinks that consume them.

use std::sync::Arc;

use bytes::Bytes;

use crate::error::{Error, Result};
use crate::pg::protocol::{ColumnInfo, Format};
use crate::types::{Scan, Value};

/// Column descriptions shared by every row of a result set.
pub type SharedColumns = Arc<[ColumnInfo]>;

// ============================================================================
// Row
// ============================================================================

/// One DataRow with the columns of its RowDescription.
#[derive(Debug, Clone)]
pub struct Row {
    columns: SharedColumns,
    values: Vec<Option<Bytes>>,
}

/// Column lookup by position or by name.
pub trait RowIndex {
    fn index(&self, row: &Row) -> Result<usize>;
}

impl RowIndex for usize {
    fn index(&self, row: &Row) -> Result<usize> {
        if *self < row.len() {
            Ok(*self)
        } else {
            Err(Error::Decode(format!(
                "column index {} out of range, row has {} columns",
                self,
                row.len()
            )))
        }
    }
}

impl RowIndex for &str {
    fn index(&self, row: &Row) -> Result<usize> {
        row.columns
            .iter()
            .position(|c| c.name == *self)
            .ok_or_else(|| Error::Decode(format!("can't find column {:?} in row", self)))
    }
}

impl Row {
    pub fn new(columns: SharedColumns, values: Vec<Option<Bytes>>) -> Self {
        Self { columns, values }
    }

    pub fn columns(&self) -> &[ColumnInfo] {
        &self.columns
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.values.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    /// Raw text of a column, `None` for NULL.
    pub fn raw<I: RowIndex>(&self, idx: I) -> Result<Option<&[u8]>> {
        let i = idx.index(self)?;
        Ok(self.values[i].as_deref())
    }

    /// Decodes a column. NULL scans into the type's zero value unless `T`
    /// is an `Option`.
    pub fn get<T: Scan, I: RowIndex>(&self, idx: I) -> Result<T> {
        let i = idx.index(self)?;
        self.check_text(i)?;
        T::scan(self.values[i].as_deref()).map_err(|e| match e {
            Error::Decode(msg) => {
                Error::Decode(format!("column {:?}: {}", self.columns[i].name, msg))
            }
            e => e,
        })
    }

    /// Decodes a column by its type OID.
    pub fn value<I: RowIndex>(&self, idx: I) -> Result<Value> {
        let i = idx.index(self)?;
        self.check_text(i)?;
        Value::decode_text(self.columns[i].type_oid, self.values[i].as_deref())
    }

    fn check_text(&self, i: usize) -> Result<()> {
        match self.columns.get(i).map(|c| c.format) {
            Some(Format::Binary) => Err(Error::UnsupportedType(format!(
                "column {:?} uses the binary format",
                self.columns[i].name
            ))),
            _ => Ok(()),
        }
    }
}

// ============================================================================
// FromRow
// ============================================================================

/// A type built from a whole row.
///
/// Implemented for [`Row`], for tuples of [`Scan`] types (by position) and
/// by `#[derive(FromRow)]` (by column name).
pub trait FromRow: Sized {
    fn from_row(row: &Row) -> Result<Self>;
}

impl FromRow for Row {
    fn from_row(row: &Row) -> Result<Self> {
        Ok(row.clone())
    }
}

macro_rules! impl_from_row_tuple {
    ($len:expr; $($name:ident $idx:tt),+) => {
        impl<$($name: Scan),+> FromRow for ($($name,)+) {
            fn from_row(row: &Row) -> Result<Self> {
                if row.len() != $len {
                    return Err(Error::Decode(format!(
                        "expected {} columns, got {}",
                        $len,
                        row.len()
                    )));
                }
                Ok(($(row.get::<$name, usize>($idx)?,)+))
            }
        }
    };
}

impl_from_row_tuple!(1; A 0);
impl_from_row_tuple!(2; A 0, B 1);
impl_from_row_tuple!(3; A 0, B 1, C 2);
impl_from_row_tuple!(4; A 0, B 1, C 2, D 3);
impl_from_row_tuple!(5; A 0, B 1, C 2, D 3, E 4);
impl_from_row_tuple!(6; A 0, B 1, C 2, D 3, E 4, F 5);
impl_from_row_tuple!(7; A 0, B 1, C 2, D 3, E 4, F 5, G 6);
impl_from_row_tuple!(8; A 0, B 1, C 2, D 3, E 4, F 5, G 6, H 7);

// ============================================================================
// Model
// ============================================================================

/// Destination of query rows.
pub trait Model: Send {
    /// Called before each attempt so retried queries do not duplicate rows.
    fn reset(&mut self) {}

    fn add_row(&mut self, row: Row) -> Result<()>;
}

impl<T: FromRow + Send> Model for Vec<T> {
    fn reset(&mut self) {
        self.clear();
    }

    fn add_row(&mut self, row: Row) -> Result<()> {
        self.push(T::from_row(&row)?);
        Ok(())
    }
}

/// Keeps the last row.
impl<T: FromRow + Send> Model for Option<T> {
    fn reset(&mut self) {
        *self = None;
    }

    fn add_row(&mut self, row: Row) -> Result<()> {
        *self = Some(T::from_row(&row)?);
        Ok(())
    }
}

impl<M: Model + ?Sized> Model for &mut M {
    fn reset(&mut self) {
        (**self).reset();
    }

    fn add_row(&mut self, row: Row) -> Result<()> {
        (**self).add_row(row)
    }
}

/// Ignores rows; used by `exec`.
#[derive(Debug, Clone, Copy, Default)]
pub struct Discard;

impl Model for Discard {
    fn add_row(&mut self, _row: Row) -> Result<()> {
        Ok(())
    }
}

// ============================================================================
// QueryResult
// ============================================================================

/// Outcome of one command.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct QueryResult {
    tag: Bytes,
    rows_affected: i64,
    rows_returned: usize,
}

impl QueryResult {
    pub(crate) fn new(tag: Bytes, rows_returned: usize) -> Self {
        Self {
            rows_affected: parse_rows_affected(&tag),
            tag,
            rows_returned,
        }
    }

    /// Result of an EmptyQueryResponse.
    pub(crate) fn empty() -> Self {
        Self {
            tag: Bytes::new(),
            rows_affected: -1,
            rows_returned: 0,
        }
    }

    /// Rows affected according to the command tag, `-1` for commands that
    /// don't report a count.
    pub fn rows_affected(&self) -> i64 {
        self.rows_affected
    }

    /// Number of DataRow messages received.
    pub fn rows_returned(&self) -> usize {
        self.rows_returned
    }

    pub fn command_tag(&self) -> &str {
        std::str::from_utf8(&self.tag).unwrap_or_default()
    }
}

/// Parses the row count from a command tag.
fn parse_rows_affected(tag: &[u8]) -> i64 {
    let tag = std::str::from_utf8(tag).unwrap_or_default();
    let parts: Vec<&str> = tag.split_whitespace().collect();
    match parts.as_slice() {
        ["INSERT", _, n]
        | ["UPDATE", n]
        | ["DELETE", n]
        | ["SELECT", n]
        | ["MERGE", n]
        | ["COPY", n]
        | ["MOVE", n]
        | ["FETCH", n] => n.parse().unwrap_or(-1),
        _ => -1,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::Oid;

    fn columns(names: &[(&str, Oid)]) -> SharedColumns {
        names
            .iter()
            .map(|(name, oid)| ColumnInfo {
                name: name.to_string(),
                table_oid: 0,
                column_attr: 0,
                type_oid: *oid,
                type_size: -1,
                type_modifier: -1,
                format: Format::Text,
            })
            .collect()
    }

    fn row() -> Row {
        Row::new(
            columns(&[("id", Oid::INT8), ("name", Oid::TEXT), ("deleted", Oid::BOOL)]),
            vec![Some(Bytes::from_static(b"7")), Some(Bytes::from_static(b"ann")), None],
        )
    }

    #[test]
    fn test_parse_rows_affected() {
        assert_eq!(parse_rows_affected(b"INSERT 0 5"), 5);
        assert_eq!(parse_rows_affected(b"UPDATE 3"), 3);
        assert_eq!(parse_rows_affected(b"DELETE 2"), 2);
        assert_eq!(parse_rows_affected(b"SELECT 10"), 10);
        assert_eq!(parse_rows_affected(b"COPY 4"), 4);
        assert_eq!(parse_rows_affected(b"CREATE TABLE"), -1);
        assert_eq!(parse_rows_affected(b"UNKNOWN"), -1);
    }

    #[test]
    fn test_row_get() {
        let row = row();
        assert_eq!(row.get::<i64, _>(0).unwrap(), 7);
        assert_eq!(row.get::<String, _>("name").unwrap(), "ann");
        assert_eq!(row.get::<Option<bool>, _>("deleted").unwrap(), None);
        assert!(!row.get::<bool, _>("deleted").unwrap());
        assert!(row.get::<i64, _>("missing").is_err());
        assert!(row.get::<i64, _>(3).is_err());
        assert_eq!(row.value("id").unwrap(), Value::Int8(7));
        assert!(matches!(row.get::<i64, _>("name"), Err(Error::Decode(_))));
    }

    #[test]
    fn test_tuple_from_row() {
        let (id, name, deleted) = <(i64, String, Option<bool>)>::from_row(&row()).unwrap();
        assert_eq!((id, name.as_str(), deleted), (7, "ann", None));
        assert!(<(i64, String)>::from_row(&row()).is_err());
    }

    #[test]
    fn test_models() {
        let mut rows: Vec<(i64, String, bool)> = Vec::new();
        rows.add_row(row()).unwrap();
        rows.add_row(row()).unwrap();
        assert_eq!(rows.len(), 2);
        rows.reset();
        assert!(rows.is_empty());

        let mut one: Option<Row> = None;
        one.add_row(row()).unwrap();
        assert_eq!(one.unwrap().len(), 3);
        assert!(Discard.add_row(row()).is_ok());
    }

    #[cfg(feature = "macros")]
    #[test]
    fn test_derived_from_row() {
        #[derive(crate::FromRow, Debug, PartialEq)]
        struct User {
            id: i64,
            #[pg(rename = "name")]
            user_name: String,
            deleted: Option<bool>,
            #[pg(skip)]
            cached: u32,
        }

        let user = User::from_row(&row()).unwrap();
        assert_eq!(
            user,
            User {
                id: 7,
                user_name: "ann".to_string(),
                deleted: None,
                cached: 0,
            }
        );
    }

    #[test]
    fn test_query_result() {
        let res = QueryResult::new(Bytes::from_static(b"UPDATE 3"), 0);
        assert_eq!(res.rows_affected(), 3);
        assert_eq!(res.command_tag(), "UPDATE 3");
        assert_eq!(QueryResult::empty().rows_affected(), -1);
    }
}
