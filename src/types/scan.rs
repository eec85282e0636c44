use std::collections::{BTreeMap, HashMap};
use std::str::FromStr;

use bytes::Bytes;
use uuid::Uuid;

use crate::error::{Error, Result};

/// A type that can be decoded from a text-format column value.
///
/// `None` is SQL NULL; implementations return their zero value for it
/// unless they can represent NULL themselves (`Option<T>`).
pub trait Scan: Sized {
    fn scan(src: Option<&[u8]>) -> Result<Self>;
}

fn as_str(b: &[u8]) -> Result<&str> {
    std::str::from_utf8(b).map_err(|e| Error::Decode(format!("invalid utf-8: {}", e)))
}

fn parse<T>(b: &[u8], type_name: &str) -> Result<T>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    let s = as_str(b)?;
    s.parse()
        .map_err(|e| Error::Decode(format!("can't parse {:?} as {}: {}", s, type_name, e)))
}

impl<T: Scan> Scan for Option<T> {
    fn scan(src: Option<&[u8]>) -> Result<Self> {
        match src {
            None => Ok(None),
            Some(_) => T::scan(src).map(Some),
        }
    }
}

impl Scan for bool {
    fn scan(src: Option<&[u8]>) -> Result<Self> {
        match src {
            None => Ok(false),
            Some(b"t" | b"true" | b"TRUE" | b"1") => Ok(true),
            Some(b"f" | b"false" | b"FALSE" | b"0") => Ok(false),
            Some(b) => Err(Error::Decode(format!(
                "can't parse {:?} as bool",
                String::from_utf8_lossy(b)
            ))),
        }
    }
}

macro_rules! impl_scan_parse {
    ($($t:ty),*) => {
        $(
            impl Scan for $t {
                fn scan(src: Option<&[u8]>) -> Result<Self> {
                    match src {
                        None => Ok(<$t>::default()),
                        Some(b) => parse(b, stringify!($t)),
                    }
                }
            }
        )*
    };
}

impl_scan_parse!(i8, i16, i32, i64, isize, u8, u16, u32, u64, usize);

macro_rules! impl_scan_float {
    ($($t:ty),*) => {
        $(
            impl Scan for $t {
                fn scan(src: Option<&[u8]>) -> Result<Self> {
                    match src {
                        None => Ok(0.0),
                        Some(b"NaN") => Ok(<$t>::NAN),
                        Some(b"Infinity") => Ok(<$t>::INFINITY),
                        Some(b"-Infinity") => Ok(<$t>::NEG_INFINITY),
                        Some(b) => parse(b, stringify!($t)),
                    }
                }
            }
        )*
    };
}

impl_scan_float!(f32, f64);

impl Scan for String {
    fn scan(src: Option<&[u8]>) -> Result<Self> {
        match src {
            None => Ok(String::new()),
            Some(b) => as_str(b).map(str::to_owned),
        }
    }
}

impl Scan for Vec<u8> {
    fn scan(src: Option<&[u8]>) -> Result<Self> {
        match src {
            None => Ok(Vec::new()),
            Some(b) => decode_bytea(b),
        }
    }
}

impl Scan for Bytes {
    fn scan(src: Option<&[u8]>) -> Result<Self> {
        Vec::<u8>::scan(src).map(Bytes::from)
    }
}

impl Scan for Uuid {
    fn scan(src: Option<&[u8]>) -> Result<Self> {
        match src {
            None => Ok(Uuid::nil()),
            Some(b) => Uuid::try_parse_ascii(b)
                .map_err(|e| Error::Decode(format!("invalid uuid: {}", e))),
        }
    }
}

impl Scan for serde_json::Value {
    fn scan(src: Option<&[u8]>) -> Result<Self> {
        match src {
            None => Ok(serde_json::Value::Null),
            Some(b) => serde_json::from_slice(b)
                .map_err(|e| Error::Decode(format!("invalid json: {}", e))),
        }
    }
}

impl<V: serde::de::DeserializeOwned> Scan for HashMap<String, V> {
    fn scan(src: Option<&[u8]>) -> Result<Self> {
        match src {
            None => Ok(HashMap::new()),
            Some(b) => serde_json::from_slice(b)
                .map_err(|e| Error::Decode(format!("invalid json: {}", e))),
        }
    }
}

impl<V: serde::de::DeserializeOwned> Scan for BTreeMap<String, V> {
    fn scan(src: Option<&[u8]>) -> Result<Self> {
        match src {
            None => Ok(BTreeMap::new()),
            Some(b) => serde_json::from_slice(b)
                .map_err(|e| Error::Decode(format!("invalid json: {}", e))),
        }
    }
}

/// Decodes a bytea value in either hex (`\x...`) or escape format.
pub fn decode_bytea(b: &[u8]) -> Result<Vec<u8>> {
    if let Some(hex) = b.strip_prefix(b"\\x") {
        if hex.len() % 2 != 0 {
            return Err(Error::Decode("odd length hex bytea".to_string()));
        }
        return hex
            .chunks(2)
            .map(|pair| Ok((hex_digit(pair[0])? << 4) | hex_digit(pair[1])?))
            .collect();
    }

    let mut out = Vec::with_capacity(b.len());
    let mut i = 0;
    while i < b.len() {
        if b[i] != b'\\' {
            out.push(b[i]);
            i += 1;
            continue;
        }
        match b.get(i + 1) {
            Some(b'\\') => {
                out.push(b'\\');
                i += 2;
            }
            Some(_) if is_octal_escape(&b[i + 1..]) => {
                let v = b[i + 1..i + 4]
                    .iter()
                    .fold(0u16, |acc, c| acc * 8 + (c - b'0') as u16);
                out.push(v as u8);
                i += 4;
            }
            _ => return Err(Error::Decode("invalid bytea escape".to_string())),
        }
    }
    Ok(out)
}

fn is_octal_escape(b: &[u8]) -> bool {
    b.len() >= 3 && b[..3].iter().all(|c| (b'0'..=b'7').contains(c))
}

fn hex_digit(c: u8) -> Result<u8> {
    match c {
        b'0'..=b'9' => Ok(c - b'0'),
        b'a'..=b'f' => Ok(c - b'a' + 10),
        b'A'..=b'F' => Ok(c - b'A' + 10),
        _ => Err(Error::Decode(format!("invalid hex digit {:?}", c as char))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_scan_null_yields_zero() {
        assert_eq!(i64::scan(None).unwrap(), 0);
        assert_eq!(String::scan(None).unwrap(), "");
        assert!(!bool::scan(None).unwrap());
        assert_eq!(Option::<i32>::scan(None).unwrap(), None);
        assert_eq!(Option::<i32>::scan(Some(b"7")).unwrap(), Some(7));
    }

    #[test]
    fn test_scan_scalars() {
        assert!(bool::scan(Some(b"t")).unwrap());
        assert_eq!(i16::scan(Some(b"-12")).unwrap(), -12);
        assert!(f64::scan(Some(b"NaN")).unwrap().is_nan());
        assert_eq!(f32::scan(Some(b"-Infinity")).unwrap(), f32::NEG_INFINITY);
        assert!(matches!(i32::scan(Some(b"x")), Err(Error::Decode(_))));
    }

    #[test]
    fn test_decode_bytea() {
        assert_eq!(decode_bytea(br"\xdeadBEEF").unwrap(), vec![0xde, 0xad, 0xbe, 0xef]);
        assert_eq!(decode_bytea(br"a\\b\001").unwrap(), vec![b'a', b'\\', b'b', 1]);
        assert!(decode_bytea(br"\xabc").is_err());
    }

    #[test]
    fn test_scan_uuid() {
        let id = Uuid::scan(Some(b"a0eebc99-9c0b-4ef8-bb6d-6bb9bd380a11")).unwrap();
        assert_eq!(id.to_string(), "a0eebc99-9c0b-4ef8-bb6d-6bb9bd380a11");
    }
}
