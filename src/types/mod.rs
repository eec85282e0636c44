//! Conversion between Rust values and PostgreSQL text representations.
//!
//! [`Append`] renders a value as SQL text (a quoted literal for query
//! formatting, a raw text parameter for Bind, or an element inside an array
//! or composite literal). [`Scan`] is the inverse: it parses the text format
//! value of a result column.

mod append;
mod array;
mod composite;
mod hstore;
mod json;
mod scan;
mod time;
mod value;

use std::ops::{BitAnd, BitOr};

pub use array::{parse_array, Array, Elements};
pub use composite::{append_composite, parse_composite};
pub use hstore::{parse_hstore, Hstore, StringPairs};
pub use json::Json;
pub use scan::{decode_bytea, Scan};
pub use time::{parse_time, ParsedTime};
pub use value::{Driver, DriverValue, Oid, Value};

pub(crate) use append::{append_null, append_string};

/// Rendering context of a value.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Flags(u8);

impl Flags {
    /// Raw text, as sent in Bind parameters.
    pub const NONE: Flags = Flags(0);
    /// A standalone SQL literal: strings get single quotes.
    pub const QUOTE: Flags = Flags(1);
    /// An element of an array or composite literal.
    pub const ARRAY: Flags = Flags(1 << 1);
    /// A nested array; only the outermost array is quoted.
    pub const SUBARRAY: Flags = Flags(1 << 2);

    #[inline]
    pub fn contains(self, other: Flags) -> bool {
        self.0 & other.0 == other.0
    }

    #[inline]
    pub fn without(self, other: Flags) -> Flags {
        Flags(self.0 & !other.0)
    }
}

impl BitOr for Flags {
    type Output = Flags;

    fn bitor(self, rhs: Flags) -> Flags {
        Flags(self.0 | rhs.0)
    }
}

impl BitAnd for Flags {
    type Output = Flags;

    fn bitand(self, rhs: Flags) -> Flags {
        Flags(self.0 & rhs.0)
    }
}

/// A value that can be rendered into SQL text.
pub trait Append: Sync {
    /// Writes the value to `dst`.
    fn append_value(&self, dst: &mut Vec<u8>, flags: Flags);

    /// NULL values are sent as SQL NULL in Bind parameters.
    fn is_null(&self) -> bool {
        false
    }

    /// The type's zero value, used by `nullempty` struct fields.
    fn is_zero(&self) -> bool {
        false
    }

    /// Named-parameter source used to resolve `?name` placeholders.
    fn as_named(&self) -> Option<&dyn NamedParams> {
        None
    }
}

/// Resolves `?name` placeholders against a struct or map.
///
/// Implemented by `#[derive(Params)]`.
pub trait NamedParams: Sync {
    /// Renders the field or method `name` into `dst`. Returns `false` when
    /// the name is unknown.
    fn append_param(&self, dst: &mut Vec<u8>, name: &str, flags: Flags) -> bool;

    /// Type name used in error messages.
    fn type_name(&self) -> &'static str;

    /// Field metadata, in declaration order.
    fn fields(&self) -> &'static [FieldInfo] {
        &[]
    }
}

/// Per-field metadata collected from `#[pg(...)]` attributes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FieldInfo {
    pub name: &'static str,
    /// Explicit SQL type, e.g. `jsonb`.
    pub sql_type: Option<&'static str>,
    pub array: bool,
    pub hstore: bool,
    pub nullempty: bool,
    pub composite: Option<&'static str>,
}

impl FieldInfo {
    pub const fn new(name: &'static str) -> Self {
        Self {
            name,
            sql_type: None,
            array: false,
            hstore: false,
            nullempty: false,
            composite: None,
        }
    }
}

/// A list of named values, usable as the trailing named-parameter argument.
///
/// ```
/// use pgkit::types::Named;
///
/// let args = Named::new().set("id", &1).set("name", &"alice");
/// ```
#[derive(Default)]
pub struct Named<'a> {
    values: Vec<(&'a str, &'a dyn Append)>,
}

impl<'a> Named<'a> {
    pub fn new() -> Self {
        Self { values: Vec::new() }
    }

    pub fn set(mut self, name: &'a str, value: &'a dyn Append) -> Self {
        self.values.push((name, value));
        self
    }
}

impl NamedParams for Named<'_> {
    fn append_param(&self, dst: &mut Vec<u8>, name: &str, flags: Flags) -> bool {
        match self.values.iter().rev().find(|(n, _)| *n == name) {
            Some((_, v)) => {
                v.append_value(dst, flags);
                true
            }
            None => false,
        }
    }

    fn type_name(&self) -> &'static str {
        "Named"
    }
}

impl Append for Named<'_> {
    fn append_value(&self, dst: &mut Vec<u8>, flags: Flags) {
        append_null(dst, flags);
    }

    fn as_named(&self) -> Option<&dyn NamedParams> {
        Some(self)
    }
}

/// Renders `value` the way a positional query parameter would be rendered.
pub fn to_sql(value: &dyn Append) -> String {
    let mut dst = Vec::new();
    value.append_value(&mut dst, Flags::QUOTE);
    String::from_utf8_lossy(&dst).into_owned()
}
