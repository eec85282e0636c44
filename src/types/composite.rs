//! Composite (row) literals: `(1,"a b",,t)`.
//!
//! Tuples render as composites and scan from composite text. An empty
//! unquoted field is NULL.

use super::{Append, Flags, Scan};
use crate::error::{Error, Result};

/// Renders `fields` as a composite literal. NULL fields are left empty.
pub fn append_composite(dst: &mut Vec<u8>, flags: Flags, fields: &[&dyn Append]) {
    if flags.contains(Flags::ARRAY) {
        // Nested inside an array: render raw, then escape as an element
        let mut inner = Vec::new();
        append_fields(&mut inner, flags & Flags::QUOTE, fields);
        dst.push(b'"');
        for c in inner {
            match c {
                b'"' | b'\\' => dst.extend_from_slice(&[b'\\', c]),
                _ => dst.push(c),
            }
        }
        dst.push(b'"');
        return;
    }

    let quote = flags.contains(Flags::QUOTE);
    if quote {
        dst.push(b'\'');
    }
    append_fields(dst, flags & Flags::QUOTE, fields);
    if quote {
        dst.push(b'\'');
    }
}

fn append_fields(dst: &mut Vec<u8>, quote: Flags, fields: &[&dyn Append]) {
    let elem_flags = quote | Flags::ARRAY;
    dst.push(b'(');
    for (i, field) in fields.iter().enumerate() {
        if i > 0 {
            dst.push(b',');
        }
        if !field.is_null() {
            field.append_value(dst, elem_flags);
        }
    }
    dst.push(b')');
}

/// Splits a composite literal into its fields. Quoted fields are unescaped;
/// empty unquoted fields become `None`.
pub fn parse_composite(src: &[u8]) -> Result<Vec<Option<Vec<u8>>>> {
    let inner = match src {
        [b'(', inner @ .., b')'] => inner,
        _ => {
            return Err(Error::Decode(format!(
                "invalid composite literal {:?}",
                String::from_utf8_lossy(src)
            )))
        }
    };

    let mut fields = Vec::new();
    let mut pos = 0;
    loop {
        let (field, next) = match inner.get(pos) {
            Some(b'"') => {
                let (s, next) = read_field(inner, pos)?;
                (Some(s), next)
            }
            _ => {
                let end = inner[pos..]
                    .iter()
                    .position(|&c| c == b',')
                    .map_or(inner.len(), |n| pos + n);
                let raw = &inner[pos..end];
                ((!raw.is_empty()).then(|| raw.to_vec()), end)
            }
        };
        fields.push(field);

        match inner.get(next) {
            None => return Ok(fields),
            Some(b',') => pos = next + 1,
            Some(&c) => {
                return Err(Error::Decode(format!(
                    "unexpected {:?} in composite literal",
                    c as char
                )))
            }
        }
    }
}

/// Quoted composite fields escape `"` either as `""` or `\"`.
fn read_field(src: &[u8], pos: usize) -> Result<(Vec<u8>, usize)> {
    let mut out = Vec::new();
    let mut i = pos + 1;
    while i < src.len() {
        match src[i] {
            b'\\' if i + 1 < src.len() => {
                out.push(src[i + 1]);
                i += 2;
            }
            b'"' if src.get(i + 1) == Some(&b'"') => {
                out.push(b'"');
                i += 2;
            }
            b'"' => return Ok((out, i + 1)),
            c => {
                out.push(c);
                i += 1;
            }
        }
    }
    Err(Error::Decode("unterminated composite field".to_string()))
}

macro_rules! impl_tuple {
    ($len:expr; $($name:ident $idx:tt),+) => {
        impl<$($name: Append),+> Append for ($($name,)+) {
            fn append_value(&self, dst: &mut Vec<u8>, flags: Flags) {
                append_composite(dst, flags, &[$(&self.$idx),+]);
            }
        }

        impl<$($name: Scan),+> Scan for ($($name,)+) {
            fn scan(src: Option<&[u8]>) -> Result<Self> {
                let Some(src) = src else {
                    return Ok(($($name::scan(None)?,)+));
                };
                let fields = parse_composite(src)?;
                if fields.len() != $len {
                    return Err(Error::Decode(format!(
                        "composite has {} fields, expected {}",
                        fields.len(),
                        $len
                    )));
                }
                Ok(($($name::scan(fields[$idx].as_deref())?,)+))
            }
        }
    };
}

impl_tuple!(1; A 0);
impl_tuple!(2; A 0, B 1);
impl_tuple!(3; A 0, B 1, C 2);
impl_tuple!(4; A 0, B 1, C 2, D 3);
impl_tuple!(5; A 0, B 1, C 2, D 3, E 4);
impl_tuple!(6; A 0, B 1, C 2, D 3, E 4, F 5);
impl_tuple!(7; A 0, B 1, C 2, D 3, E 4, F 5, G 6);
impl_tuple!(8; A 0, B 1, C 2, D 3, E 4, F 5, G 6, H 7);

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::Array;

    fn render(v: &dyn Append, flags: Flags) -> String {
        let mut dst = Vec::new();
        v.append_value(&mut dst, flags);
        String::from_utf8(dst).unwrap()
    }

    #[test]
    fn test_render_composite() {
        let v = (1, "it's a", None::<i32>, true);
        assert_eq!(render(&v, Flags::QUOTE), r#"'(1,"it''s a",,TRUE)'"#);
        assert_eq!(render(&v, Flags::NONE), r#"(1,"it's a",,t)"#);
    }

    #[test]
    fn test_composite_in_array() {
        let v = Array(vec![(1, "x")]);
        assert_eq!(render(&v, Flags::QUOTE), r#"'{"(1,\"x\")"}'"#);
    }

    #[test]
    fn test_parse_composite() {
        let fields = parse_composite(br#"(1,"a ""b""",,"")"#).unwrap();
        assert_eq!(
            fields,
            vec![
                Some(b"1".to_vec()),
                Some(br#"a "b""#.to_vec()),
                None,
                Some(Vec::new()),
            ]
        );
        assert!(parse_composite(b"1,2").is_err());
    }

    #[test]
    fn test_scan_tuple() {
        let (a, b, c): (i32, String, Option<bool>) = Scan::scan(Some(br#"(7,"x y",)"#)).unwrap();
        assert_eq!((a, b.as_str(), c), (7, "x y", None));
        assert!(<(i32, i32)>::scan(Some(b"(1)")).is_err());
    }
}
