//! hstore literals: `"k1"=>"v1", "k2"=>NULL`.

use std::collections::{BTreeMap, HashMap};

use super::append::append_string;
use super::array::read_quoted;
use super::{Append, Flags, Scan};
use crate::error::{Error, Result};

/// Renders a string map as hstore and scans hstore columns.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Hstore<T>(pub T);

impl<T> Hstore<T> {
    pub fn into_inner(self) -> T {
        self.0
    }
}

fn append_pairs<'a>(dst: &mut Vec<u8>, mut pairs: Vec<(&'a str, &'a str)>, flags: Flags) {
    // Sorted for a stable rendering regardless of map type
    pairs.sort_unstable();

    let quote = flags.contains(Flags::QUOTE);
    let elem_flags = (flags & Flags::QUOTE) | Flags::ARRAY;

    if quote {
        dst.push(b'\'');
    }
    for (i, (k, v)) in pairs.into_iter().enumerate() {
        if i > 0 {
            dst.push(b',');
        }
        append_string(dst, k, elem_flags);
        dst.extend_from_slice(b"=>");
        append_string(dst, v, elem_flags);
    }
    if quote {
        dst.push(b'\'');
    }
}

/// String maps that can be rendered as hstore.
pub trait StringPairs: Sync {
    fn pairs(&self) -> Vec<(&str, &str)>;
}

impl StringPairs for HashMap<String, String> {
    fn pairs(&self) -> Vec<(&str, &str)> {
        self.iter().map(|(k, v)| (k.as_str(), v.as_str())).collect()
    }
}

impl StringPairs for BTreeMap<String, String> {
    fn pairs(&self) -> Vec<(&str, &str)> {
        self.iter().map(|(k, v)| (k.as_str(), v.as_str())).collect()
    }
}

impl<T: StringPairs + ?Sized> StringPairs for &T {
    fn pairs(&self) -> Vec<(&str, &str)> {
        (**self).pairs()
    }
}

impl<T: StringPairs> Append for Hstore<T> {
    fn append_value(&self, dst: &mut Vec<u8>, flags: Flags) {
        append_pairs(dst, self.0.pairs(), flags);
    }

    fn is_zero(&self) -> bool {
        self.0.pairs().is_empty()
    }
}

impl Scan for Hstore<HashMap<String, String>> {
    fn scan(src: Option<&[u8]>) -> Result<Self> {
        let Some(src) = src else {
            return Ok(Hstore(HashMap::new()));
        };
        Ok(Hstore(parse_pairs(src)?.into_iter().collect()))
    }
}

impl Scan for Hstore<BTreeMap<String, String>> {
    fn scan(src: Option<&[u8]>) -> Result<Self> {
        let Some(src) = src else {
            return Ok(Hstore(BTreeMap::new()));
        };
        Ok(Hstore(parse_pairs(src)?.into_iter().collect()))
    }
}

fn parse_pairs(src: &[u8]) -> Result<Vec<(String, String)>> {
    parse_hstore(src)?
        .into_iter()
        .map(|(k, v)| {
            let k = String::from_utf8(k).map_err(|e| Error::Decode(e.to_string()))?;
            let v = match v {
                Some(v) => String::from_utf8(v).map_err(|e| Error::Decode(e.to_string()))?,
                None => String::new(),
            };
            Ok((k, v))
        })
        .collect()
}

/// Parses hstore text output into key/value pairs. NULL values are `None`.
pub fn parse_hstore(src: &[u8]) -> Result<Vec<(Vec<u8>, Option<Vec<u8>>)>> {
    let mut pairs = Vec::new();
    let mut pos = 0;
    let skip_ws = |pos: &mut usize| {
        while *pos < src.len() && src[*pos].is_ascii_whitespace() {
            *pos += 1;
        }
    };

    loop {
        skip_ws(&mut pos);
        if pos >= src.len() {
            return Ok(pairs);
        }
        if src[pos] != b'"' {
            return Err(Error::Decode("hstore key must be quoted".to_string()));
        }
        let (key, next) = read_quoted(src, pos)?;
        pos = next;

        skip_ws(&mut pos);
        if !src[pos..].starts_with(b"=>") {
            return Err(Error::Decode("expected => in hstore".to_string()));
        }
        pos += 2;
        skip_ws(&mut pos);

        let value = if src[pos..].starts_with(b"NULL") {
            pos += 4;
            None
        } else if src.get(pos) == Some(&b'"') {
            let (v, next) = read_quoted(src, pos)?;
            pos = next;
            Some(v)
        } else {
            return Err(Error::Decode("hstore value must be quoted".to_string()));
        };
        pairs.push((key, value));

        skip_ws(&mut pos);
        match src.get(pos) {
            None => return Ok(pairs),
            Some(b',') => pos += 1,
            Some(&c) => {
                return Err(Error::Decode(format!(
                    "unexpected {:?} in hstore",
                    c as char
                )))
            }
        }
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
    fn test_render_hstore() {
        let m = HashMap::from([
            ("b".to_string(), "it's".to_string()),
            ("a".to_string(), "x\"y".to_string()),
        ]);
        assert_eq!(
            render(&Hstore(m), Flags::QUOTE),
            r#"'"a"=>"x\"y","b"=>"it''s"'"#
        );
        assert_eq!(render(&Hstore(HashMap::<String, String>::new()), Flags::QUOTE), "''");
    }

    #[test]
    fn test_parse_hstore() {
        let Hstore(m): Hstore<BTreeMap<String, String>> =
            Scan::scan(Some(br#""a"=>"1", "b"=>NULL, "c d"=>"x\"y""#)).unwrap();
        assert_eq!(m["a"], "1");
        assert_eq!(m["b"], "");
        assert_eq!(m["c d"], "x\"y");
        assert!(parse_hstore(b"").unwrap().is_empty());
    }
}
