use serde::de::DeserializeOwned;
use serde::Serialize;

use super::append::{append_error, append_null};
use super::{Append, Flags, Scan};
use crate::error::{Error, Result};

/// Renders and scans the wrapped value as JSON (`json` / `jsonb` columns).
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Json<T>(pub T);

impl<T> Json<T> {
    pub fn into_inner(self) -> T {
        self.0
    }
}

/// Writes serialized JSON as a SQL literal.
///
/// `\u0000` escapes are doubled because PostgreSQL rejects NUL in text.
pub(crate) fn append_json(dst: &mut Vec<u8>, json: &[u8], flags: Flags) {
    let array = flags.contains(Flags::ARRAY);
    let quote = flags.contains(Flags::QUOTE);

    if array {
        dst.push(b'"');
    } else if quote {
        dst.push(b'\'');
    }

    let mut i = 0;
    while i < json.len() {
        let c = json[i];
        i += 1;
        match c {
            0 => {}
            b'"' => {
                if array {
                    dst.push(b'\\');
                }
                dst.push(b'"');
            }
            b'\'' => {
                if quote {
                    dst.push(b'\'');
                }
                dst.push(b'\'');
            }
            b'\\' if array => dst.extend_from_slice(b"\\\\"),
            b'\\' => {
                if json[i..].starts_with(b"u0000") {
                    dst.extend_from_slice(b"\\\\u0000");
                    i += 5;
                } else {
                    dst.push(b'\\');
                    if i < json.len() {
                        dst.push(json[i]);
                        i += 1;
                    }
                }
            }
            _ => dst.push(c),
        }
    }

    if array {
        dst.push(b'"');
    } else if quote {
        dst.push(b'\'');
    }
}

impl<T: Serialize + Sync> Append for Json<T> {
    fn append_value(&self, dst: &mut Vec<u8>, flags: Flags) {
        match serde_json::to_vec(&self.0) {
            Ok(b) if b == b"null" => append_null(dst, flags),
            Ok(b) => append_json(dst, &b, flags),
            Err(e) => append_error(dst, &e.to_string()),
        }
    }

    fn is_null(&self) -> bool {
        matches!(serde_json::to_value(&self.0), Ok(serde_json::Value::Null))
    }
}

impl<T: DeserializeOwned + Default> Scan for Json<T> {
    fn scan(src: Option<&[u8]>) -> Result<Self> {
        match src {
            None => Ok(Json(T::default())),
            Some(b) => serde_json::from_slice(b)
                .map(Json)
                .map_err(|e| Error::Decode(format!("invalid json: {}", e))),
        }
    }
}
