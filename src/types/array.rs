//! PostgreSQL array literals: `{a,"b c",NULL,{1,2}}`.

use super::append::append_null;
use super::{Append, Flags, Scan};
use crate::error::{Error, Result};

/// Renders a sequence as a PostgreSQL array and scans array columns.
///
/// Without this wrapper a `Vec<T>` has no SQL rendering (and `Vec<u8>` is
/// `bytea`).
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Array<T>(pub T);

impl<T> Array<T> {
    pub fn into_inner(self) -> T {
        self.0
    }
}

/// Sequence types whose elements can be rendered into an array literal.
pub trait Elements: Sync {
    type Item: Append;

    fn elements(&self) -> &[Self::Item];
}

impl<T: Append> Elements for Vec<T> {
    type Item = T;

    fn elements(&self) -> &[T] {
        self
    }
}

impl<T: Append> Elements for [T] {
    type Item = T;

    fn elements(&self) -> &[T] {
        self
    }
}

impl<T: Append, const N: usize> Elements for [T; N] {
    type Item = T;

    fn elements(&self) -> &[T] {
        self
    }
}

impl<E: Elements + ?Sized> Elements for &E {
    type Item = E::Item;

    fn elements(&self) -> &[E::Item] {
        (**self).elements()
    }
}

impl<E: Elements> Append for Array<E> {
    fn append_value(&self, dst: &mut Vec<u8>, flags: Flags) {
        let elems = self.0.elements();
        let quote = flags.contains(Flags::QUOTE) && !flags.contains(Flags::SUBARRAY);
        let elem_flags = flags | Flags::ARRAY | Flags::SUBARRAY;

        if quote {
            dst.push(b'\'');
        }
        dst.push(b'{');
        for (i, elem) in elems.iter().enumerate() {
            if i > 0 {
                dst.push(b',');
            }
            if elem.is_null() {
                append_null(dst, elem_flags);
            } else {
                elem.append_value(dst, elem_flags);
            }
        }
        dst.push(b'}');
        if quote {
            dst.push(b'\'');
        }
    }

    fn is_zero(&self) -> bool {
        self.0.elements().is_empty()
    }
}

impl<T: Scan> Scan for Array<Vec<T>> {
    fn scan(src: Option<&[u8]>) -> Result<Self> {
        let Some(src) = src else {
            return Ok(Array(Vec::new()));
        };
        parse_array(src)?
            .iter()
            .map(|elem| T::scan(elem.as_deref()))
            .collect::<Result<Vec<T>>>()
            .map(Array)
    }
}

/// Splits an array literal into its elements. Quoted elements are
/// unescaped; nested arrays are returned verbatim, braces included; `NULL`
/// becomes `None`.
pub fn parse_array(src: &[u8]) -> Result<Vec<Option<Vec<u8>>>> {
    let src = trim(src);
    // Skip an optional dimension decoration: [1:3]={...}
    let src = match src.iter().position(|&c| c == b'=') {
        Some(eq) if src.first() == Some(&b'[') => &src[eq + 1..],
        _ => src,
    };
    let inner = match src {
        [b'{', inner @ .., b'}'] => inner,
        _ => {
            return Err(Error::Decode(format!(
                "invalid array literal {:?}",
                String::from_utf8_lossy(src)
            )))
        }
    };

    let mut elems = Vec::new();
    if trim(inner).is_empty() {
        return Ok(elems);
    }

    let mut pos = 0;
    loop {
        while pos < inner.len() && inner[pos].is_ascii_whitespace() {
            pos += 1;
        }
        let (elem, next) = match inner.get(pos) {
            Some(b'"') => {
                let (s, next) = read_quoted(inner, pos)?;
                (Some(s), next)
            }
            Some(b'{') => {
                let end = find_subarray_end(inner, pos)?;
                (Some(inner[pos..end].to_vec()), end)
            }
            _ => {
                let end = inner[pos..]
                    .iter()
                    .position(|&c| c == b',')
                    .map_or(inner.len(), |n| pos + n);
                let raw = trim(&inner[pos..end]);
                if raw.eq_ignore_ascii_case(b"NULL") {
                    (None, end)
                } else {
                    (Some(raw.to_vec()), end)
                }
            }
        };
        elems.push(elem);

        pos = next;
        while pos < inner.len() && inner[pos].is_ascii_whitespace() {
            pos += 1;
        }
        match inner.get(pos) {
            None => return Ok(elems),
            Some(b',') => pos += 1,
            Some(&c) => {
                return Err(Error::Decode(format!(
                    "unexpected {:?} in array literal",
                    c as char
                )))
            }
        }
    }
}

/// Reads a double-quoted element starting at `pos`. Returns the unescaped
/// contents and the position after the closing quote.
pub(crate) fn read_quoted(src: &[u8], pos: usize) -> Result<(Vec<u8>, usize)> {
    let mut out = Vec::new();
    let mut i = pos + 1;
    while i < src.len() {
        match src[i] {
            b'\\' if i + 1 < src.len() => {
                out.push(src[i + 1]);
                i += 2;
            }
            b'"' => return Ok((out, i + 1)),
            c => {
                out.push(c);
                i += 1;
            }
        }
    }
    Err(Error::Decode("unterminated quoted element".to_string()))
}

fn find_subarray_end(src: &[u8], pos: usize) -> Result<usize> {
    let mut depth = 0;
    let mut in_quotes = false;
    let mut i = pos;
    while i < src.len() {
        match src[i] {
            b'\\' if in_quotes => i += 1,
            b'"' => in_quotes = !in_quotes,
            b'{' if !in_quotes => depth += 1,
            b'}' if !in_quotes => {
                depth -= 1;
                if depth == 0 {
                    return Ok(i + 1);
                }
            }
            _ => {}
        }
        i += 1;
    }
    Err(Error::Decode("unterminated nested array".to_string()))
}

fn trim(b: &[u8]) -> &[u8] {
    let start = b.iter().position(|c| !c.is_ascii_whitespace()).unwrap_or(b.len());
    let end = b
        .iter()
        .rposition(|c| !c.is_ascii_whitespace())
        .map_or(start, |n| n + 1);
    &b[start..end]
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn render(v: &dyn Append, flags: Flags) -> String {
        let mut dst = Vec::new();
        v.append_value(&mut dst, flags);
        String::from_utf8(dst).unwrap()
    }

    #[test]
    fn test_render_arrays() {
        assert_eq!(render(&Array(vec!["foo", "bar"]), Flags::QUOTE), r#"'{"foo","bar"}'"#);
        assert_eq!(render(&Array(vec![1, 2, 3]), Flags::NONE), "{1,2,3}");
        assert_eq!(render(&Array(Vec::<i32>::new()), Flags::QUOTE), "'{}'");
        assert_eq!(
            render(&Array(vec![Some("a'b"), None]), Flags::QUOTE),
            r#"'{"a''b",NULL}'"#
        );
    }

    #[test]
    fn test_render_nested_arrays() {
        let v = Array(vec![Array(vec![1, 2]), Array(vec![3, 4])]);
        assert_eq!(render(&v, Flags::QUOTE), "'{{1,2},{3,4}}'");
    }

    #[test]
    fn test_parse_array() {
        let elems = parse_array(br#"{a,"b c",NULL,"NULL","",{1,2}}"#).unwrap();
        assert_eq!(
            elems,
            vec![
                Some(b"a".to_vec()),
                Some(b"b c".to_vec()),
                None,
                Some(b"NULL".to_vec()),
                Some(Vec::new()),
                Some(b"{1,2}".to_vec()),
            ]
        );
        assert!(parse_array(b"{}").unwrap().is_empty());
        assert!(parse_array(b"nope").is_err());
    }

    #[test]
    fn test_scan_nested() {
        let Array(v): Array<Vec<Array<Vec<i32>>>> = Scan::scan(Some(b"{{1,2},{3}}")).unwrap();
        assert_eq!(v, vec![Array(vec![1, 2]), Array(vec![3])]);
    }

    proptest! {
        #[test]
        fn prop_string_array_roundtrip(input in proptest::collection::vec("[^\u{0}]*", 0..8)) {
            let mut dst = Vec::new();
            Array(input.clone()).append_value(&mut dst, Flags::NONE);
            let Array(parsed): Array<Vec<String>> = Scan::scan(Some(&dst)).unwrap();
            prop_assert_eq!(parsed, input);
        }

        #[test]
        fn prop_int_array_roundtrip(input in proptest::collection::vec(any::<i64>(), 0..16)) {
            let mut dst = Vec::new();
            Array(&input).append_value(&mut dst, Flags::NONE);
            let Array(parsed): Array<Vec<i64>> = Scan::scan(Some(&dst)).unwrap();
            prop_assert_eq!(parsed, input);
        }
    }
}
