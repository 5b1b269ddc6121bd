//! # Reply Value Model
//!
//! Purpose: Represent one decoded reply as a tagged union with soft-typed
//! accessors so callers never have to match on the variant just to read it.
//!
//! ## Design Principles
//! 1. **One Variant at a Time**: `RespValue` is a plain enum; there is no way
//!    to populate two payloads at once.
//! 2. **Total Accessors**: `to_int`, `to_bytes`, `to_array` and friends return
//!    the zero value of their type on a variant mismatch instead of failing.
//! 3. **Errors Are Data**: a server error line is an ordinary value carrying
//!    the error flag, inspected with `is_error`/`is_ok`.
//! 4. **Binary-Safe**: byte strings are raw bytes, never forced through UTF-8.

use std::fmt;

/// Decoded reply value.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum RespValue {
    /// `$-1` and `*-1` replies.
    #[default]
    Null,
    /// `:123` replies.
    Integer(i64),
    /// `+OK` simple strings and `$n` bulk strings.
    Bytes(Vec<u8>),
    /// `*n` arrays.
    Array(Vec<RespValue>),
    /// `-ERR ...` replies: a byte string with the error flag set.
    Error(Vec<u8>),
}

impl RespValue {
    /// Builds an error-flagged byte string.
    pub fn error(message: impl Into<Vec<u8>>) -> Self {
        RespValue::Error(message.into())
    }

    /// Returns the integer payload, or 0 for any other variant.
    pub fn to_int(&self) -> i64 {
        match self {
            RespValue::Integer(value) => *value,
            _ => 0,
        }
    }

    /// Returns the byte payload decoded lossily as UTF-8, or an empty string.
    ///
    /// Error replies yield their message.
    pub fn to_string_lossy(&self) -> String {
        String::from_utf8_lossy(self.as_bytes()).into_owned()
    }

    /// Returns a copy of the byte payload, or an empty vector.
    pub fn to_bytes(&self) -> Vec<u8> {
        self.as_bytes().to_vec()
    }

    /// Borrows the byte payload of `Bytes` and `Error`, or an empty slice.
    pub fn as_bytes(&self) -> &[u8] {
        match self {
            RespValue::Bytes(data) | RespValue::Error(data) => data,
            _ => &[],
        }
    }

    /// Returns a copy of the array elements, or an empty vector.
    pub fn to_array(&self) -> Vec<RespValue> {
        match self {
            RespValue::Array(items) => items.clone(),
            _ => Vec::new(),
        }
    }

    /// Consumes the value and returns its elements, or an empty vector.
    pub fn into_array(self) -> Vec<RespValue> {
        match self {
            RespValue::Array(items) => items,
            _ => Vec::new(),
        }
    }

    #[inline]
    pub fn is_error(&self) -> bool {
        matches!(self, RespValue::Error(_))
    }

    #[inline]
    pub fn is_ok(&self) -> bool {
        !self.is_error()
    }

    #[inline]
    pub fn is_null(&self) -> bool {
        matches!(self, RespValue::Null)
    }

    #[inline]
    pub fn is_int(&self) -> bool {
        matches!(self, RespValue::Integer(_))
    }

    #[inline]
    pub fn is_array(&self) -> bool {
        matches!(self, RespValue::Array(_))
    }

    /// True for non-error byte strings.
    #[inline]
    pub fn is_bytes(&self) -> bool {
        matches!(self, RespValue::Bytes(_))
    }

    /// True for non-error byte strings holding valid UTF-8.
    pub fn is_string(&self) -> bool {
        match self {
            RespValue::Bytes(data) => std::str::from_utf8(data).is_ok(),
            _ => false,
        }
    }

    /// Renders a recursive, human-readable dump of the value.
    ///
    /// ```rust
    /// use redwire_common::RespValue;
    ///
    /// let value = RespValue::Array(vec![RespValue::from("a"), RespValue::Integer(2)]);
    /// assert_eq!(value.inspect(), "[\"a\", 2]");
    /// ```
    pub fn inspect(&self) -> String {
        let mut out = String::new();
        inspect_into(self, &mut out);
        out
    }
}

fn inspect_into(value: &RespValue, out: &mut String) {
    match value {
        RespValue::Null => out.push_str("(null)"),
        RespValue::Integer(value) => out.push_str(&value.to_string()),
        RespValue::Bytes(data) => {
            out.push('"');
            out.push_str(&String::from_utf8_lossy(data));
            out.push('"');
        }
        RespValue::Error(data) => {
            out.push_str("(error) ");
            out.push_str(&String::from_utf8_lossy(data));
        }
        RespValue::Array(items) => {
            out.push('[');
            for (idx, item) in items.iter().enumerate() {
                if idx > 0 {
                    out.push_str(", ");
                }
                inspect_into(item, out);
            }
            out.push(']');
        }
    }
}

impl fmt::Display for RespValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.inspect())
    }
}

impl From<i64> for RespValue {
    fn from(value: i64) -> Self {
        RespValue::Integer(value)
    }
}

impl From<&str> for RespValue {
    fn from(value: &str) -> Self {
        RespValue::Bytes(value.as_bytes().to_vec())
    }
}

impl From<String> for RespValue {
    fn from(value: String) -> Self {
        RespValue::Bytes(value.into_bytes())
    }
}

impl From<Vec<u8>> for RespValue {
    fn from(value: Vec<u8>) -> Self {
        RespValue::Bytes(value)
    }
}

impl From<&[u8]> for RespValue {
    fn from(value: &[u8]) -> Self {
        RespValue::Bytes(value.to_vec())
    }
}

impl From<Vec<RespValue>> for RespValue {
    fn from(value: Vec<RespValue>) -> Self {
        RespValue::Array(value)
    }
}
