use std::collections::{BTreeMap, HashMap};
use std::io::Write as _;

use bytes::Bytes;
use serde::Serialize;
use uuid::Uuid;

use super::{Append, Flags, NamedParams};

pub(crate) fn append_null(dst: &mut Vec<u8>, flags: Flags) {
    if flags.contains(Flags::QUOTE) || flags.contains(Flags::ARRAY) {
        dst.extend_from_slice(b"NULL");
    }
}

/// Renders an error in place of a value. The result is deliberately invalid
/// SQL so that the server rejects the query with the message attached.
pub(crate) fn append_error(dst: &mut Vec<u8>, msg: &str) {
    dst.extend_from_slice(b"?!(");
    dst.extend_from_slice(msg.as_bytes());
    dst.push(b')');
}

pub(crate) fn append_string(dst: &mut Vec<u8>, s: &str, flags: Flags) {
    if flags.contains(Flags::ARRAY) {
        dst.push(b'"');
        for c in s.bytes() {
            match c {
                0 => {}
                b'\'' => {
                    if flags.contains(Flags::QUOTE) {
                        dst.push(b'\'');
                    }
                    dst.push(b'\'');
                }
                b'"' => dst.extend_from_slice(b"\\\""),
                b'\\' => dst.extend_from_slice(b"\\\\"),
                _ => dst.push(c),
            }
        }
        dst.push(b'"');
        return;
    }

    if flags.contains(Flags::QUOTE) {
        dst.push(b'\'');
        for c in s.bytes() {
            match c {
                0 => {}
                b'\'' => dst.extend_from_slice(b"''"),
                _ => dst.push(c),
            }
        }
        dst.push(b'\'');
        return;
    }

    dst.extend(s.bytes().filter(|&c| c != 0));
}

pub(crate) fn append_bytes(dst: &mut Vec<u8>, b: &[u8], flags: Flags) {
    const HEX: &[u8; 16] = b"0123456789abcdef";

    if flags.contains(Flags::ARRAY) {
        dst.extend_from_slice(b"\"\\");
    } else if flags.contains(Flags::QUOTE) {
        dst.push(b'\'');
    }

    dst.extend_from_slice(b"\\x");
    dst.reserve(b.len() * 2);
    for &byte in b {
        dst.push(HEX[(byte >> 4) as usize]);
        dst.push(HEX[(byte & 0x0f) as usize]);
    }

    if flags.contains(Flags::ARRAY) {
        dst.push(b'"');
    } else if flags.contains(Flags::QUOTE) {
        dst.push(b'\'');
    }
}

fn append_float(dst: &mut Vec<u8>, v: f64, display: impl std::fmt::Display, flags: Flags) {
    let special = if v.is_nan() {
        Some("NaN")
    } else if v == f64::INFINITY {
        Some("Infinity")
    } else if v == f64::NEG_INFINITY {
        Some("-Infinity")
    } else {
        None
    };

    match special {
        Some(s) if flags.contains(Flags::QUOTE) && !flags.contains(Flags::ARRAY) => {
            dst.push(b'\'');
            dst.extend_from_slice(s.as_bytes());
            dst.push(b'\'');
        }
        Some(s) => dst.extend_from_slice(s.as_bytes()),
        None => {
            let _ = write!(dst, "{}", display);
        }
    }
}

// ============================================================================
// Scalars
// ============================================================================

impl Append for bool {
    fn append_value(&self, dst: &mut Vec<u8>, flags: Flags) {
        let s: &[u8] = match (flags.contains(Flags::QUOTE), *self) {
            (true, true) => b"TRUE",
            (true, false) => b"FALSE",
            (false, true) => b"t",
            (false, false) => b"f",
        };
        dst.extend_from_slice(s);
    }

    fn is_zero(&self) -> bool {
        !*self
    }
}

macro_rules! impl_append_int {
    ($($t:ty),*) => {
        $(
            impl Append for $t {
                fn append_value(&self, dst: &mut Vec<u8>, _flags: Flags) {
                    let _ = write!(dst, "{}", self);
                }

                fn is_zero(&self) -> bool {
                    *self == 0
                }
            }
        )*
    };
}

impl_append_int!(i8, i16, i32, i64, isize, u8, u16, u32, u64, usize);

impl Append for f32 {
    fn append_value(&self, dst: &mut Vec<u8>, flags: Flags) {
        append_float(dst, *self as f64, self, flags);
    }

    fn is_zero(&self) -> bool {
        *self == 0.0
    }
}

impl Append for f64 {
    fn append_value(&self, dst: &mut Vec<u8>, flags: Flags) {
        append_float(dst, *self, self, flags);
    }

    fn is_zero(&self) -> bool {
        *self == 0.0
    }
}

impl Append for str {
    fn append_value(&self, dst: &mut Vec<u8>, flags: Flags) {
        append_string(dst, self, flags);
    }

    fn is_zero(&self) -> bool {
        self.is_empty()
    }
}

impl Append for String {
    fn append_value(&self, dst: &mut Vec<u8>, flags: Flags) {
        append_string(dst, self, flags);
    }

    fn is_zero(&self) -> bool {
        self.is_empty()
    }
}

impl Append for char {
    fn append_value(&self, dst: &mut Vec<u8>, flags: Flags) {
        let mut buf = [0u8; 4];
        append_string(dst, self.encode_utf8(&mut buf), flags);
    }
}

// ============================================================================
// Binary data
// ============================================================================

impl Append for [u8] {
    fn append_value(&self, dst: &mut Vec<u8>, flags: Flags) {
        append_bytes(dst, self, flags);
    }

    fn is_zero(&self) -> bool {
        self.is_empty()
    }
}

impl Append for Vec<u8> {
    fn append_value(&self, dst: &mut Vec<u8>, flags: Flags) {
        append_bytes(dst, self, flags);
    }

    fn is_zero(&self) -> bool {
        self.is_empty()
    }
}

impl Append for Bytes {
    fn append_value(&self, dst: &mut Vec<u8>, flags: Flags) {
        append_bytes(dst, self, flags);
    }

    fn is_zero(&self) -> bool {
        self.is_empty()
    }
}

// ============================================================================
// Wrappers
// ============================================================================

impl<T: Append + ?Sized> Append for &T {
    fn append_value(&self, dst: &mut Vec<u8>, flags: Flags) {
        (**self).append_value(dst, flags);
    }

    fn is_null(&self) -> bool {
        (**self).is_null()
    }

    fn is_zero(&self) -> bool {
        (**self).is_zero()
    }

    fn as_named(&self) -> Option<&dyn NamedParams> {
        (**self).as_named()
    }
}

impl<T: Append + ?Sized> Append for Box<T> {
    fn append_value(&self, dst: &mut Vec<u8>, flags: Flags) {
        (**self).append_value(dst, flags);
    }

    fn is_null(&self) -> bool {
        (**self).is_null()
    }

    fn is_zero(&self) -> bool {
        (**self).is_zero()
    }

    fn as_named(&self) -> Option<&dyn NamedParams> {
        (**self).as_named()
    }
}

impl<T: Append> Append for Option<T> {
    fn append_value(&self, dst: &mut Vec<u8>, flags: Flags) {
        match self {
            Some(v) => v.append_value(dst, flags),
            None => append_null(dst, flags),
        }
    }

    fn is_null(&self) -> bool {
        match self {
            Some(v) => v.is_null(),
            None => true,
        }
    }

    fn is_zero(&self) -> bool {
        match self {
            Some(v) => v.is_zero(),
            None => true,
        }
    }
}

impl Append for Uuid {
    fn append_value(&self, dst: &mut Vec<u8>, flags: Flags) {
        let mut buf = Uuid::encode_buffer();
        append_string(dst, self.hyphenated().encode_lower(&mut buf), flags);
    }

    fn is_zero(&self) -> bool {
        self.is_nil()
    }
}

// ============================================================================
// Maps (rendered as JSON)
// ============================================================================

fn append_json_value<T: Serialize + ?Sized>(dst: &mut Vec<u8>, v: &T, flags: Flags) {
    match serde_json::to_vec(v) {
        Ok(b) => super::json::append_json(dst, &b, flags),
        Err(e) => append_error(dst, &e.to_string()),
    }
}

impl<V: Serialize + Sync> Append for HashMap<String, V> {
    fn append_value(&self, dst: &mut Vec<u8>, flags: Flags) {
        append_json_value(dst, self, flags);
    }

    fn is_zero(&self) -> bool {
        self.is_empty()
    }
}

impl<V: Serialize + Sync> Append for BTreeMap<String, V> {
    fn append_value(&self, dst: &mut Vec<u8>, flags: Flags) {
        append_json_value(dst, self, flags);
    }

    fn is_zero(&self) -> bool {
        self.is_empty()
    }
}

impl Append for serde_json::Value {
    fn append_value(&self, dst: &mut Vec<u8>, flags: Flags) {
        if self.is_null() {
            return append_null(dst, flags);
        }
        append_json_value(dst, self, flags);
    }

    fn is_null(&self) -> bool {
        serde_json::Value::is_null(self)
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
    fn test_string_quoting() {
        assert_eq!(render(&"it's", Flags::QUOTE), "'it''s'");
        assert_eq!(render(&"a\0b", Flags::QUOTE), "'ab'");
        assert_eq!(render(&"it's", Flags::NONE), "it's");
        // Array elements: double quotes, backslash escapes
        assert_eq!(render(&r#"a"b\c"#, Flags::ARRAY), r#""a\"b\\c""#);
        assert_eq!(render(&"it's", Flags::ARRAY | Flags::QUOTE), r#""it''s""#);
        assert_eq!(render(&"it's", Flags::ARRAY), r#""it's""#);
    }

    #[test]
    fn test_bool() {
        assert_eq!(render(&true, Flags::QUOTE), "TRUE");
        assert_eq!(render(&false, Flags::QUOTE), "FALSE");
        assert_eq!(render(&true, Flags::NONE), "t");
    }

    #[test]
    fn test_floats() {
        assert_eq!(render(&1.5f64, Flags::QUOTE), "1.5");
        assert_eq!(render(&f64::NAN, Flags::QUOTE), "'NaN'");
        assert_eq!(render(&f64::INFINITY, Flags::QUOTE), "'Infinity'");
        assert_eq!(render(&f32::NEG_INFINITY, Flags::QUOTE), "'-Infinity'");
        assert_eq!(render(&f64::NAN, Flags::QUOTE | Flags::ARRAY), "NaN");
        assert_eq!(render(&f64::NAN, Flags::NONE), "NaN");
    }

    #[test]
    fn test_bytes() {
        let b = vec![0xde_u8, 0xad];
        assert_eq!(render(&b, Flags::QUOTE), r"'\xdead'");
        assert_eq!(render(&b, Flags::NONE), r"\xdead");
        assert_eq!(render(&b, Flags::ARRAY), r#""\\xdead""#);
    }

    #[test]
    fn test_null() {
        assert_eq!(render(&None::<i32>, Flags::QUOTE), "NULL");
        assert_eq!(render(&None::<i32>, Flags::ARRAY), "NULL");
        assert_eq!(render(&None::<i32>, Flags::NONE), "");
        assert!(None::<i32>.is_null());
        assert!(!Some(0).is_null());
        assert!(Some(0).is_zero());
    }

    #[test]
    fn test_json_map() {
        let mut m = BTreeMap::new();
        m.insert("k".to_string(), "it's");
        assert_eq!(render(&m, Flags::QUOTE), r#"'{"k":"it''s"}'"#);
    }
}
