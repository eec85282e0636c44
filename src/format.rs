//! Placeholder substitution.
//!
//! Queries use `?` for the next positional parameter, `?N` for the N-th
//! (zero based, repeatable) and `?name` for a named parameter resolved
//! against the trailing [`NamedParams`] argument and then against
//! DB-level parameters. `\?` produces a literal `?`.

use std::collections::HashMap;
use std::sync::Arc;

use bytes::Bytes;

use crate::error::{Error, Result};
use crate::types::{Append, Elements, Flags, NamedParams};

// ============================================================================
// Helper values
// ============================================================================

/// SQL text inserted verbatim. Never pass user input through `Q`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Q<'a>(pub &'a str);

impl Append for Q<'_> {
    fn append_value(&self, dst: &mut Vec<u8>, _flags: Flags) {
        dst.extend_from_slice(self.0.as_bytes());
    }
}

/// An identifier such as a table or column name. Each dot-separated part
/// is double quoted; `*` is left bare.
///
/// ```
/// use pgkit::{format::Ident, types::to_sql};
///
/// assert_eq!(to_sql(&Ident("users.id")), r#""users"."id""#);
/// assert_eq!(to_sql(&Ident("u.*")), r#""u".*"#);
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Ident<'a>(pub &'a str);

impl Append for Ident<'_> {
    fn append_value(&self, dst: &mut Vec<u8>, _flags: Flags) {
        append_ident(dst, self.0);
    }
}

pub(crate) fn append_ident(dst: &mut Vec<u8>, ident: &str) {
    let mut quoted = false;
    for c in ident.bytes() {
        match c {
            b'*' if !quoted => {
                dst.push(b'*');
                continue;
            }
            b'.' => {
                if quoted {
                    dst.push(b'"');
                    quoted = false;
                }
                dst.push(b'.');
                continue;
            }
            _ => {}
        }
        if !quoted {
            dst.push(b'"');
            quoted = true;
        }
        if c == b'"' {
            dst.extend_from_slice(b"\"\"");
        } else {
            dst.push(c);
        }
    }
    if quoted {
        dst.push(b'"');
    }
}

/// Expands a sequence into a comma separated list for `IN (?)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct In<T>(pub T);

impl<E: Elements> Append for In<E> {
    fn append_value(&self, dst: &mut Vec<u8>, flags: Flags) {
        for (i, elem) in self.0.elements().iter().enumerate() {
            if i > 0 {
                dst.push(b',');
            }
            elem.append_value(dst, flags);
        }
    }
}

// ============================================================================
// Formatter
// ============================================================================

/// Renders queries. Clones share the DB-level parameter map until
/// [`Formatter::with_param`] copies it.
#[derive(Debug, Clone, Default)]
pub struct Formatter {
    params: Arc<HashMap<String, Bytes>>,
}

impl Formatter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns a formatter that also resolves `?name` to `value`.
    pub fn with_param(&self, name: &str, value: &dyn Append) -> Self {
        let mut rendered = Vec::new();
        value.append_value(&mut rendered, Flags::QUOTE);

        let mut params = (*self.params).clone();
        params.insert(name.to_string(), Bytes::from(rendered));
        Self {
            params: Arc::new(params),
        }
    }

    /// The rendered value of a DB-level parameter.
    pub fn param(&self, name: &str) -> Option<&[u8]> {
        self.params.get(name).map(|b| &b[..])
    }

    pub fn format(&self, query: &str, params: &[&dyn Append]) -> Result<String> {
        let mut dst = Vec::with_capacity(query.len());
        self.append_query(&mut dst, query.as_bytes(), params)?;
        String::from_utf8(dst).map_err(|e| Error::Format(e.to_string()))
    }

    /// Appends `query` to `dst` with placeholders substituted.
    pub fn append_query(&self, dst: &mut Vec<u8>, query: &[u8], params: &[&dyn Append]) -> Result<()> {
        let (named, positional) = match params.split_last() {
            Some((last, rest)) if last.as_named().is_some() => (last.as_named(), rest),
            _ => (None, params),
        };

        let mut next = 0;
        let mut max_index = None::<usize>;
        let mut i = 0;

        while i < query.len() {
            let c = query[i];
            i += 1;

            if c == b'\\' && query.get(i) == Some(&b'?') {
                dst.push(b'?');
                i += 1;
                continue;
            }
            if c != b'?' {
                dst.push(c);
                continue;
            }

            let ident_len = query[i..]
                .iter()
                .take_while(|c| c.is_ascii_alphanumeric() || **c == b'_')
                .count();
            if ident_len == 0 {
                let Some(param) = positional.get(next) else {
                    return Err(Error::Format(format!(
                        "expected at least {} parameters, got {}",
                        next + 1,
                        positional.len()
                    )));
                };
                param.append_value(dst, Flags::QUOTE);
                next += 1;
                continue;
            }

            let ident = &query[i..i + ident_len];
            i += ident_len;

            if ident.iter().all(u8::is_ascii_digit) {
                let index = std::str::from_utf8(ident)
                    .ok()
                    .and_then(|s| s.parse::<usize>().ok())
                    .ok_or_else(|| Error::Format("invalid parameter index".to_string()))?;
                let Some(param) = positional.get(index) else {
                    return Err(Error::Format(format!(
                        "expected at least {} parameters, got {}",
                        index + 1,
                        positional.len()
                    )));
                };
                param.append_value(dst, Flags::QUOTE);
                max_index = max_index.max(Some(index));
                continue;
            }

            // Identifier bytes are ASCII
            let name = std::str::from_utf8(ident).map_err(|e| Error::Format(e.to_string()))?;
            self.append_named(dst, name, named)?;
        }

        let used = max_index.map_or(next, |m| next.max(m + 1));
        if used < positional.len() {
            return Err(Error::Format(format!(
                "expected {} parameters, got {}",
                used,
                positional.len()
            )));
        }
        Ok(())
    }

    fn append_named(&self, dst: &mut Vec<u8>, name: &str, named: Option<&dyn NamedParams>) -> Result<()> {
        if let Some(named) = named {
            if named.append_param(dst, name, Flags::QUOTE) {
                return Ok(());
            }
        }
        if let Some(value) = self.params.get(name) {
            dst.extend_from_slice(value);
            return Ok(());
        }
        let type_name = named.map_or("nil", |n| n.type_name());
        Err(Error::Format(format!("cannot map {} on {}", name, type_name)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{Array, Named};
    use proptest::prelude::*;

    fn format(query: &str, params: &[&dyn Append]) -> Result<String> {
        Formatter::new().format(query, params)
    }

    #[test]
    fn test_format_u64_max() {
        assert_eq!(format("?", &[&u64::MAX]).unwrap(), "18446744073709551615");
    }

    #[test]
    fn test_format_null() {
        assert_eq!(format("?", &[&None::<i32>]).unwrap(), "NULL");
    }

    #[test]
    fn test_format_escaped_placeholder() {
        assert_eq!(format("\\? ?", &[&1]).unwrap(), "? 1");
        assert_eq!(format("a\\b", &[]).unwrap(), "a\\b");
    }

    #[test]
    fn test_format_mixed_named_and_positional() {
        let named = Named::new().set("foo", &"bar");
        assert_eq!(
            format("? ?foo ?", &[&"one", &"two", &named]).unwrap(),
            "'one' 'bar' 'two'"
        );
    }

    #[test]
    fn test_format_string_array() {
        let arr = Array(vec!["foo\n", "bar {}", "'\\\""]);
        assert_eq!(
            format("?", &[&arr]).unwrap(),
            "'{\"foo\n\",\"bar {}\",\"''\\\\\\\"\"}'"
        );
    }

    #[test]
    fn test_format_indexed() {
        assert_eq!(format("?0 ?1 ?0", &[&1, &"x"]).unwrap(), "1 'x' 1");
    }

    #[test]
    fn test_format_arity_errors() {
        let err = format("? ?", &[&1]).unwrap_err();
        assert_eq!(err.to_string(), "pg: expected at least 2 parameters, got 1");

        let err = format("?", &[&1, &2]).unwrap_err();
        assert_eq!(err.to_string(), "pg: expected 1 parameters, got 2");

        let err = format("?3", &[&1]).unwrap_err();
        assert_eq!(err.to_string(), "pg: expected at least 4 parameters, got 1");
    }

    #[test]
    fn test_format_unknown_name() {
        let named = Named::new().set("a", &1);
        let err = format("?b", &[&named]).unwrap_err();
        assert_eq!(err.to_string(), "pg: cannot map b on Named");

        let err = format("?b", &[]).unwrap_err();
        assert_eq!(err.to_string(), "pg: cannot map b on nil");
    }

    #[test]
    fn test_db_params() {
        let fmt = Formatter::new().with_param("schema", &Q("public"));
        let named = Named::new().set("schema", &Q("other"));
        assert_eq!(fmt.format("?schema.t", &[]).unwrap(), "public.t");
        // Struct parameters take precedence
        assert_eq!(fmt.format("?schema.t", &[&named]).unwrap(), "other.t");
        assert!(Formatter::new().param("schema").is_none());
    }

    #[test]
    fn test_ident() {
        let render = |s| {
            let mut dst = Vec::new();
            append_ident(&mut dst, s);
            String::from_utf8(dst).unwrap()
        };
        assert_eq!(render("id"), r#""id""#);
        assert_eq!(render("t.id"), r#""t"."id""#);
        assert_eq!(render("t.*"), r#""t".*"#);
        assert_eq!(render(r#"we"ird"#), r#""we""ird""#);
    }

    #[test]
    fn test_in() {
        assert_eq!(
            format("id IN (?)", &[&In(vec![1, 2, 3])]).unwrap(),
            "id IN (1,2,3)"
        );
        assert_eq!(
            format("name IN (?)", &[&In(["a", "b"])]).unwrap(),
            "name IN ('a','b')"
        );
    }

    #[cfg(feature = "macros")]
    mod derived {
        use super::*;
        use crate::Params;

        #[derive(Params)]
        #[pg(methods(display_name))]
        struct User {
            id: i64,
            #[pg(rename = "user_name")]
            name: String,
            #[pg(nullempty)]
            email: String,
            #[pg(array)]
            tags: Vec<String>,
            #[pg(skip)]
            #[allow(dead_code)]
            secret: String,
        }

        impl User {
            fn display_name(&self) -> String {
                format!("{} <{}>", self.name, self.id)
            }
        }

        fn user() -> User {
            User {
                id: 7,
                name: "ann".to_string(),
                email: String::new(),
                tags: vec!["a".to_string(), "b c".to_string()],
                secret: "x".to_string(),
            }
        }

        #[test]
        fn test_named_fields() {
            let u = user();
            assert_eq!(
                format("?id ?user_name ?email ?tags", &[&u]).unwrap(),
                "7 'ann' NULL '{\"a\",\"b c\"}'"
            );
        }

        #[test]
        fn test_named_method() {
            assert_eq!(format("?display_name", &[&user()]).unwrap(), "'ann <7>'");
        }

        #[test]
        fn test_skipped_field_is_unknown() {
            let err = format("?secret", &[&user()]).unwrap_err();
            assert_eq!(err.to_string(), "pg: cannot map secret on User");
        }

        #[test]
        fn test_positional_before_struct() {
            assert_eq!(format("? ?id", &[&"x", &user()]).unwrap(), "'x' 7");
        }

        #[test]
        fn test_field_info() {
            let u = user();
            let fields = crate::types::NamedParams::fields(&u);
            let names: Vec<_> = fields.iter().map(|f| f.name).collect();
            assert_eq!(names, vec!["id", "user_name", "email", "tags"]);
            assert!(fields[2].nullempty);
            assert!(fields[3].array);
        }
    }

    proptest! {
        #[test]
        fn prop_string_literal_quoting(s in "\\PC*") {
            let out = format("?", &[&s.as_str()]).unwrap();
            let expected = format!("'{}'", s.replace('\0', "").replace('\'', "''"));
            prop_assert_eq!(out, expected);
        }
    }
}
