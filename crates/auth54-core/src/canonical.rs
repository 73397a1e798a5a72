//! Canonical JSON serialization for signature payloads.
//!
//! Every signature in the federation protocol is computed over a canonical
//! rendering of a JSON document, so that signer and verifier reach identical
//! bytes regardless of field order or formatting. The profile follows
//! RFC 8785 (JSON Canonicalization Scheme) with extra constraints that keep
//! the representation deterministic across platforms:
//!
//! - Object keys sorted in lexicographic byte order, no whitespace.
//! - Integer-only numbers within the signed 64-bit range; floats rejected.
//! - Strings must already be Unicode NFC; minimal escaping on output.
//! - Duplicate object keys rejected (decoded form, so `"a"` and `"a"`
//!   collide).
//! - Nesting deeper than [`MAX_DEPTH`] rejected.
//!
//! # Example
//!
//! ```
//! use auth54_core::canonical::canonicalize_json;
//!
//! let canonical = canonicalize_json(r#"{ "z": 1, "a": 2 }"#).unwrap();
//! assert_eq!(canonical, r#"{"a":2,"z":1}"#);
//! ```

use std::collections::BTreeSet;
use std::fmt::Write as _;

use serde::de::{self, Deserialize, Deserializer, MapAccess, SeqAccess, Visitor};
use serde_json::{Number, Value};
use thiserror::Error;
use unicode_normalization::UnicodeNormalization;

/// Maximum nesting depth accepted by the canonicalizer.
pub const MAX_DEPTH: usize = 128;

/// Errors produced while validating or canonicalizing a JSON document.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
#[non_exhaustive]
pub enum CanonicalJsonError {
    /// A floating-point number was encountered; only integers are allowed.
    #[error("float not allowed: canonical JSON is integer-only")]
    FloatNotAllowed,

    /// A number falls outside the signed 64-bit integer range.
    #[error("number out of range: {value} does not fit in a signed 64-bit integer")]
    NumberOutOfRange {
        /// String rendering of the offending number.
        value: String,
    },

    /// An object contains the same key more than once.
    #[error("duplicate key: '{key}' appears multiple times in object")]
    DuplicateKey {
        /// The duplicated key.
        key: String,
    },

    /// A string is not in Unicode NFC form.
    #[error("non-NFC string at '{path}'")]
    NonNfcString {
        /// JSON path to the offending string.
        path: String,
    },

    /// The document nests deeper than [`MAX_DEPTH`] levels.
    #[error("max depth exceeded: nested deeper than {max_depth} levels")]
    MaxDepthExceeded {
        /// The enforced depth limit.
        max_depth: usize,
    },

    /// The input could not be parsed as JSON at all.
    #[error("JSON parse error: {message}")]
    Parse {
        /// Parser diagnostic.
        message: String,
    },
}

/// Canonicalizes a JSON text.
///
/// Parses the input with duplicate-key detection, validates it against the
/// profile, and emits the canonical rendering.
///
/// # Errors
///
/// Returns [`CanonicalJsonError`] when the input is not valid JSON, contains
/// floats or out-of-range numbers, duplicate keys, non-NFC strings, or nests
/// deeper than [`MAX_DEPTH`].
pub fn canonicalize_json(input: &str) -> Result<String, CanonicalJsonError> {
    let value = parse_checked(input)?;
    canonicalize_value(&value)
}

/// Canonicalizes an in-memory [`Value`].
///
/// `serde_json` maps cannot hold duplicate keys, so only the number, string,
/// and depth constraints apply here.
///
/// # Errors
///
/// Returns [`CanonicalJsonError`] when the value violates the profile.
pub fn canonicalize_value(value: &Value) -> Result<String, CanonicalJsonError> {
    validate(value, "", 0)?;
    let mut out = String::new();
    emit(value, &mut out);
    Ok(out)
}

/// Canonicalizes any serializable payload.
///
/// This is the entry point signing code uses: serialize, then canonicalize.
///
/// # Errors
///
/// Returns [`CanonicalJsonError::Parse`] when serialization itself fails and
/// the profile errors otherwise.
pub fn canonical_string<T: serde::Serialize>(payload: &T) -> Result<String, CanonicalJsonError> {
    let value = serde_json::to_value(payload).map_err(|error| CanonicalJsonError::Parse {
        message: error.to_string(),
    })?;
    canonicalize_value(&value)
}

/// Parses JSON while rejecting duplicate object keys.
///
/// Stock parsers keep the last occurrence of a duplicated key, which would
/// let two semantically different documents canonicalize identically. The
/// custom visitor compares decoded key strings, so escape variants of the
/// same key are caught as well.
fn parse_checked(input: &str) -> Result<Value, CanonicalJsonError> {
    let mut deserializer = serde_json::Deserializer::from_str(input);
    let checked = CheckedValue::deserialize(&mut deserializer).map_err(|error| {
        let message = error.to_string();
        message.strip_prefix("duplicate key: ").map_or_else(
            || CanonicalJsonError::Parse {
                message: message.clone(),
            },
            |rest| CanonicalJsonError::DuplicateKey {
                // serde_json appends " at line X column Y" to custom errors.
                key: rest
                    .split(" at line ")
                    .next()
                    .unwrap_or(rest)
                    .to_string(),
            },
        )
    })?;
    Ok(checked.0)
}

struct CheckedValue(Value);

impl<'de> Deserialize<'de> for CheckedValue {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        struct CheckedVisitor;

        impl<'de> Visitor<'de> for CheckedVisitor {
            type Value = Value;

            fn expecting(&self, formatter: &mut std::fmt::Formatter) -> std::fmt::Result {
                formatter.write_str("any JSON value")
            }

            fn visit_bool<E>(self, v: bool) -> Result<Self::Value, E> {
                Ok(Value::Bool(v))
            }

            fn visit_i64<E>(self, v: i64) -> Result<Self::Value, E> {
                Ok(Value::Number(v.into()))
            }

            fn visit_u64<E>(self, v: u64) -> Result<Self::Value, E> {
                Ok(Value::Number(v.into()))
            }

            fn visit_f64<E>(self, v: f64) -> Result<Self::Value, E>
            where
                E: de::Error,
            {
                Number::from_f64(v)
                    .map(Value::Number)
                    .ok_or_else(|| de::Error::custom("invalid float"))
            }

            fn visit_str<E>(self, v: &str) -> Result<Self::Value, E> {
                Ok(Value::String(v.to_owned()))
            }

            fn visit_string<E>(self, v: String) -> Result<Self::Value, E> {
                Ok(Value::String(v))
            }

            fn visit_none<E>(self) -> Result<Self::Value, E> {
                Ok(Value::Null)
            }

            fn visit_unit<E>(self) -> Result<Self::Value, E> {
                Ok(Value::Null)
            }

            fn visit_seq<A>(self, mut seq: A) -> Result<Self::Value, A::Error>
            where
                A: SeqAccess<'de>,
            {
                let mut items = Vec::new();
                while let Some(item) = seq.next_element::<CheckedValue>()? {
                    items.push(item.0);
                }
                Ok(Value::Array(items))
            }

            fn visit_map<A>(self, mut map: A) -> Result<Self::Value, A::Error>
            where
                A: MapAccess<'de>,
            {
                let mut seen = BTreeSet::new();
                let mut object = serde_json::Map::new();
                while let Some(key) = map.next_key::<String>()? {
                    if !seen.insert(key.clone()) {
                        return Err(de::Error::custom(format!("duplicate key: {key}")));
                    }
                    let value = map.next_value::<CheckedValue>()?;
                    object.insert(key, value.0);
                }
                Ok(Value::Object(object))
            }
        }

        deserializer
            .deserialize_any(CheckedVisitor)
            .map(CheckedValue)
    }
}

fn validate(value: &Value, path: &str, depth: usize) -> Result<(), CanonicalJsonError> {
    if depth > MAX_DEPTH {
        return Err(CanonicalJsonError::MaxDepthExceeded {
            max_depth: MAX_DEPTH,
        });
    }

    match value {
        Value::Null | Value::Bool(_) => Ok(()),
        Value::Number(number) => validate_number(number),
        Value::String(text) => validate_nfc(text, path),
        Value::Array(items) => {
            for (index, item) in items.iter().enumerate() {
                validate(item, &format!("{path}[{index}]"), depth + 1)?;
            }
            Ok(())
        },
        Value::Object(object) => {
            for (key, item) in object {
                validate_nfc(key, &format!("{path}.{key}(key)"))?;
                let child = if path.is_empty() {
                    key.clone()
                } else {
                    format!("{path}.{key}")
                };
                validate(item, &child, depth + 1)?;
            }
            Ok(())
        },
    }
}

fn validate_number(number: &Number) -> Result<(), CanonicalJsonError> {
    if number.is_i64() {
        return Ok(());
    }
    if let Some(unsigned) = number.as_u64() {
        if unsigned > i64::MAX as u64 {
            return Err(CanonicalJsonError::NumberOutOfRange {
                value: unsigned.to_string(),
            });
        }
        return Ok(());
    }
    Err(CanonicalJsonError::FloatNotAllowed)
}

fn validate_nfc(text: &str, path: &str) -> Result<(), CanonicalJsonError> {
    if text.nfc().zip(text.chars()).any(|(a, b)| a != b) || text.nfc().count() != text.chars().count()
    {
        return Err(CanonicalJsonError::NonNfcString {
            path: path.to_string(),
        });
    }
    Ok(())
}

fn emit(value: &Value, out: &mut String) {
    match value {
        Value::Null => out.push_str("null"),
        Value::Bool(flag) => out.push_str(if *flag { "true" } else { "false" }),
        Value::Number(number) => {
            // Validation already restricted numbers to the i64/u64 range.
            if let Some(signed) = number.as_i64() {
                let _ = write!(out, "{signed}");
            } else if let Some(unsigned) = number.as_u64() {
                let _ = write!(out, "{unsigned}");
            } else {
                out.push_str(&number.to_string());
            }
        },
        Value::String(text) => emit_string(text, out),
        Value::Array(items) => {
            out.push('[');
            for (index, item) in items.iter().enumerate() {
                if index > 0 {
                    out.push(',');
                }
                emit(item, out);
            }
            out.push(']');
        },
        Value::Object(object) => {
            // Sorted explicitly rather than relying on the map's iteration
            // order, which flips to insertion order when any crate in the
            // build enables serde_json's preserve_order feature.
            let mut keys: Vec<&String> = object.keys().collect();
            keys.sort_unstable();
            out.push('{');
            for (index, key) in keys.iter().enumerate() {
                if index > 0 {
                    out.push(',');
                }
                emit_string(key, out);
                out.push(':');
                if let Some(item) = object.get(*key) {
                    emit(item, out);
                }
            }
            out.push('}');
        },
    }
}

/// Minimal escaping per RFC 8785 §3.2.2.2: quote, backslash, and control
/// characters only, with the short escapes where JSON defines them.
fn emit_string(text: &str, out: &mut String) {
    out.push('"');
    for ch in text.chars() {
        match ch {
            '"' => out.push_str("\\\""),
            '\\' => out.push_str("\\\\"),
            '\u{0008}' => out.push_str("\\b"),
            '\u{000C}' => out.push_str("\\f"),
            '\n' => out.push_str("\\n"),
            '\r' => out.push_str("\\r"),
            '\t' => out.push_str("\\t"),
            ch if ch <= '\u{001F}' => {
                let _ = write!(out, "\\u{:04x}", ch as u32);
            },
            ch => out.push(ch),
        }
    }
    out.push('"');
}
