//! Dynamically typed column values, decoded by type OID.

use bytes::Bytes;
use chrono::{DateTime, FixedOffset, NaiveDate, NaiveDateTime, NaiveTime};
use uuid::Uuid;

use super::append::append_null;
use super::{parse_array, Append, Array, Flags, Json, Scan};
use crate::error::Result;

// ============================================================================
// Type OIDs
// ============================================================================

/// PostgreSQL type object identifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct Oid(pub u32);

impl Oid {
    // Boolean
    pub const BOOL: Oid = Oid(16);

    // Binary data
    pub const BYTEA: Oid = Oid(17);

    // Character types
    pub const CHAR: Oid = Oid(18);
    pub const NAME: Oid = Oid(19);
    pub const TEXT: Oid = Oid(25);
    pub const BPCHAR: Oid = Oid(1042);
    pub const VARCHAR: Oid = Oid(1043);

    // Integer types
    pub const INT8: Oid = Oid(20);
    pub const INT2: Oid = Oid(21);
    pub const INT4: Oid = Oid(23);
    pub const OID: Oid = Oid(26);

    // Floating point
    pub const FLOAT4: Oid = Oid(700);
    pub const FLOAT8: Oid = Oid(701);
    pub const NUMERIC: Oid = Oid(1700);

    // Date/time
    pub const DATE: Oid = Oid(1082);
    pub const TIME: Oid = Oid(1083);
    pub const TIMESTAMP: Oid = Oid(1114);
    pub const TIMESTAMPTZ: Oid = Oid(1184);
    pub const INTERVAL: Oid = Oid(1186);

    pub const UUID: Oid = Oid(2950);
    pub const JSON: Oid = Oid(114);
    pub const JSONB: Oid = Oid(3802);

    // Arrays
    pub const BOOL_ARRAY: Oid = Oid(1000);
    pub const INT2_ARRAY: Oid = Oid(1005);
    pub const INT4_ARRAY: Oid = Oid(1007);
    pub const TEXT_ARRAY: Oid = Oid(1009);
    pub const VARCHAR_ARRAY: Oid = Oid(1015);
    pub const INT8_ARRAY: Oid = Oid(1016);
    pub const FLOAT8_ARRAY: Oid = Oid(1022);

    /// Element type of the array types above.
    pub fn element(self) -> Option<Oid> {
        Some(match self {
            Oid::BOOL_ARRAY => Oid::BOOL,
            Oid::INT2_ARRAY => Oid::INT2,
            Oid::INT4_ARRAY => Oid::INT4,
            Oid::TEXT_ARRAY => Oid::TEXT,
            Oid::VARCHAR_ARRAY => Oid::VARCHAR,
            Oid::INT8_ARRAY => Oid::INT8,
            Oid::FLOAT8_ARRAY => Oid::FLOAT8,
            _ => return None,
        })
    }

    pub fn is_text_like(self) -> bool {
        matches!(
            self,
            Oid::TEXT | Oid::VARCHAR | Oid::BPCHAR | Oid::CHAR | Oid::NAME
        )
    }
}

// ============================================================================
// Values
// ============================================================================

/// A column value with its type resolved from the row description.
#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    Null,
    Bool(bool),
    Int2(i16),
    Int4(i32),
    Int8(i64),
    Float4(f32),
    Float8(f64),
    /// `numeric` is kept as text to preserve precision.
    Numeric(String),
    Text(String),
    Bytea(Vec<u8>),
    Uuid(Uuid),
    Json(serde_json::Value),
    Date(NaiveDate),
    Time(NaiveTime),
    Timestamp(NaiveDateTime),
    TimestampTz(DateTime<FixedOffset>),
    Array(Vec<Value>),
    /// Types without a dedicated variant, as received.
    Raw { oid: Oid, data: Bytes },
}

impl Value {
    #[inline]
    pub fn is_null(&self) -> bool {
        matches!(self, Value::Null)
    }

    /// Decodes a text-format column of type `oid`.
    pub fn decode_text(oid: Oid, data: Option<&[u8]>) -> Result<Value> {
        let Some(data) = data else {
            return Ok(Value::Null);
        };
        Ok(match oid {
            Oid::BOOL => Value::Bool(bool::scan(Some(data))?),
            Oid::INT2 => Value::Int2(i16::scan(Some(data))?),
            Oid::INT4 => Value::Int4(i32::scan(Some(data))?),
            Oid::INT8 => Value::Int8(i64::scan(Some(data))?),
            Oid::OID => Value::Int8(u32::scan(Some(data))? as i64),
            Oid::FLOAT4 => Value::Float4(f32::scan(Some(data))?),
            Oid::FLOAT8 => Value::Float8(f64::scan(Some(data))?),
            Oid::NUMERIC => Value::Numeric(String::scan(Some(data))?),
            Oid::BYTEA => Value::Bytea(Vec::<u8>::scan(Some(data))?),
            Oid::UUID => Value::Uuid(Uuid::scan(Some(data))?),
            Oid::JSON | Oid::JSONB => Value::Json(serde_json::Value::scan(Some(data))?),
            Oid::DATE => Value::Date(NaiveDate::scan(Some(data))?),
            Oid::TIME => Value::Time(NaiveTime::scan(Some(data))?),
            Oid::TIMESTAMP => Value::Timestamp(NaiveDateTime::scan(Some(data))?),
            Oid::TIMESTAMPTZ => Value::TimestampTz(DateTime::<FixedOffset>::scan(Some(data))?),
            oid if oid.is_text_like() => Value::Text(String::scan(Some(data))?),
            oid => match oid.element() {
                Some(elem) => Value::Array(
                    parse_array(data)?
                        .iter()
                        .map(|e| Value::decode_text(elem, e.as_deref()))
                        .collect::<Result<_>>()?,
                ),
                None => Value::Raw {
                    oid,
                    data: Bytes::copy_from_slice(data),
                },
            },
        })
    }

    /// Type of the value. `Null` reports `text`.
    pub fn type_oid(&self) -> Oid {
        match self {
            Value::Null | Value::Text(_) => Oid::TEXT,
            Value::Bool(_) => Oid::BOOL,
            Value::Int2(_) => Oid::INT2,
            Value::Int4(_) => Oid::INT4,
            Value::Int8(_) => Oid::INT8,
            Value::Float4(_) => Oid::FLOAT4,
            Value::Float8(_) => Oid::FLOAT8,
            Value::Numeric(_) => Oid::NUMERIC,
            Value::Bytea(_) => Oid::BYTEA,
            Value::Uuid(_) => Oid::UUID,
            Value::Json(_) => Oid::JSONB,
            Value::Date(_) => Oid::DATE,
            Value::Time(_) => Oid::TIME,
            Value::Timestamp(_) => Oid::TIMESTAMP,
            Value::TimestampTz(_) => Oid::TIMESTAMPTZ,
            Value::Array(_) => Oid::TEXT_ARRAY,
            Value::Raw { oid, .. } => *oid,
        }
    }
}

impl Append for Value {
    fn append_value(&self, dst: &mut Vec<u8>, flags: Flags) {
        match self {
            Value::Null => append_null(dst, flags),
            Value::Bool(v) => v.append_value(dst, flags),
            Value::Int2(v) => v.append_value(dst, flags),
            Value::Int4(v) => v.append_value(dst, flags),
            Value::Int8(v) => v.append_value(dst, flags),
            Value::Float4(v) => v.append_value(dst, flags),
            Value::Float8(v) => v.append_value(dst, flags),
            Value::Numeric(v) => {
                // Already a valid literal; quote only inside arrays
                if flags.contains(Flags::ARRAY) {
                    v.append_value(dst, flags);
                } else {
                    dst.extend_from_slice(v.as_bytes());
                }
            }
            Value::Text(v) => v.append_value(dst, flags),
            Value::Bytea(v) => v.append_value(dst, flags),
            Value::Uuid(v) => v.append_value(dst, flags),
            Value::Json(v) => Json(v).append_value(dst, flags),
            Value::Date(v) => v.append_value(dst, flags),
            Value::Time(v) => v.append_value(dst, flags),
            Value::Timestamp(v) => v.append_value(dst, flags),
            Value::TimestampTz(v) => v.append_value(dst, flags),
            Value::Array(v) => Array(v).append_value(dst, flags),
            Value::Raw { data, .. } => {
                super::append_string(dst, &String::from_utf8_lossy(data), flags)
            }
        }
    }

    fn is_null(&self) -> bool {
        Value::is_null(self)
    }
}

// ============================================================================
// Driver values
// ============================================================================

/// A type that converts itself to a [`Value`] before rendering.
pub trait DriverValue: Sync {
    fn driver_value(&self) -> Value;
}

/// Renders a [`DriverValue`] through its underlying [`Value`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Driver<T>(pub T);

impl<T: DriverValue> Append for Driver<T> {
    fn append_value(&self, dst: &mut Vec<u8>, flags: Flags) {
        self.0.driver_value().append_value(dst, flags);
    }

    fn is_null(&self) -> bool {
        self.0.driver_value().is_null()
    }
}

impl From<&str> for Value {
    fn from(v: &str) -> Self {
        Value::Text(v.to_string())
    }
}

impl From<String> for Value {
    fn from(v: String) -> Self {
        Value::Text(v)
    }
}

impl From<i64> for Value {
    fn from(v: i64) -> Self {
        Value::Int8(v)
    }
}

impl From<bool> for Value {
    fn from(v: bool) -> Self {
        Value::Bool(v)
    }
}

impl<T: Into<Value>> From<Option<T>> for Value {
    fn from(v: Option<T>) -> Self {
        v.map_or(Value::Null, Into::into)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn render(v: &dyn Append, flags: Flags) -> String {
        let mut dst = Vec::new();
        v.append_value(&mut dst, flags);
        String::from_utf8(dst).unwrap()
    }

    #[test]
    fn test_oid_constants() {
        assert_eq!(Oid::INT4.0, 23);
        assert_eq!(Oid::TEXT.0, 25);
        assert_eq!(Oid::JSONB.0, 3802);
        assert!(Oid::VARCHAR.is_text_like());
        assert!(!Oid::INT4.is_text_like());
    }

    #[test]
    fn test_decode_text() {
        assert_eq!(Value::decode_text(Oid::INT4, Some(b"42")).unwrap(), Value::Int4(42));
        assert_eq!(Value::decode_text(Oid::BOOL, Some(b"t")).unwrap(), Value::Bool(true));
        assert_eq!(Value::decode_text(Oid::INT8, None).unwrap(), Value::Null);
        assert_eq!(
            Value::decode_text(Oid::INT4_ARRAY, Some(b"{1,NULL,3}")).unwrap(),
            Value::Array(vec![Value::Int4(1), Value::Null, Value::Int4(3)])
        );
        assert_eq!(
            Value::decode_text(Oid::NUMERIC, Some(b"1.50")).unwrap(),
            Value::Numeric("1.50".to_string())
        );
        assert!(matches!(
            Value::decode_text(Oid(600), Some(b"(1,2)")).unwrap(),
            Value::Raw { oid: Oid(600), .. }
        ));
        assert!(Value::decode_text(Oid::INT2, Some(b"x")).is_err());
    }

    #[test]
    fn test_render_value() {
        assert_eq!(render(&Value::Null, Flags::QUOTE), "NULL");
        assert_eq!(render(&Value::from("a'b"), Flags::QUOTE), "'a''b'");
        assert_eq!(render(&Value::Numeric("1.50".into()), Flags::QUOTE), "1.50");
        assert_eq!(
            render(&Value::Array(vec![Value::Int8(1), Value::Null]), Flags::QUOTE),
            "'{1,NULL}'"
        );
    }

    struct Cents(i64);

    impl DriverValue for Cents {
        fn driver_value(&self) -> Value {
            Value::Numeric(format!("{}.{:02}", self.0 / 100, self.0 % 100))
        }
    }

    struct Nullable(Option<i64>);

    impl DriverValue for Nullable {
        fn driver_value(&self) -> Value {
            self.0.into()
        }
    }

    #[test]
    fn test_driver_value() {
        assert_eq!(render(&Driver(Cents(1234)), Flags::QUOTE), "12.34");
        assert_eq!(render(&Driver(Nullable(Some(5))), Flags::QUOTE), "5");
        assert_eq!(render(&Driver(Nullable(None)), Flags::QUOTE), "NULL");
        assert!(Driver(Nullable(None)).is_null());
    }
}
