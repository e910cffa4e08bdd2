//! Leaf-string scanning for JSON documents.
//!
//! When an incident body is a JSON object or array, replacements may only
//! touch the content of string *values*. This module locates those values
//! (as byte ranges between the quotes) together with the escape sequences
//! inside them, so segment edges can be widened to whole escapes.

use serde_json::Value;
use std::borrow::Cow;

/// Content range of one JSON string value, in bytes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LeafString {
    pub start: usize,
    pub end: usize,
    /// Byte ranges of escape sequences (`\n`, `\"`, `\u00e9`, ...).
    pub escapes: Vec<(usize, usize)>,
}

impl LeafString {
    /// Clip `[start, end)` to this string and widen edges that fall inside
    /// an escape sequence. `None` when nothing remains.
    pub fn clip(&self, start: usize, end: usize) -> Option<(usize, usize)> {
        let mut s = start.max(self.start);
        let mut e = end.min(self.end);
        if s >= e {
            return None;
        }
        for &(es, ee) in &self.escapes {
            if es < s && s < ee {
                s = es;
            }
            if es < e && e < ee {
                e = ee;
            }
        }
        Some((s, e))
    }
}

/// Parse `text` and, if it is a JSON object or array, return its leaf
/// string values in document order. Returns `None` for anything else.
pub fn leaf_strings(text: &str) -> Option<Vec<LeafString>> {
    match serde_json::from_str::<Value>(text) {
        Ok(Value::Object(_)) | Ok(Value::Array(_)) => Some(scan(text.as_bytes())),
        _ => None,
    }
}

/// Decoded value of a fragment of a JSON string's content. Fragments that
/// do not decode on their own (a lone surrogate half) are returned as is.
pub fn unescape_fragment(raw: &str) -> Cow<'_, str> {
    if !raw.contains('\\') {
        return Cow::Borrowed(raw);
    }
    match serde_json::from_str::<String>(&format!("\"{}\"", raw)) {
        Ok(decoded) => Cow::Owned(decoded),
        Err(_) => Cow::Borrowed(raw),
    }
}

#[derive(Clone, Copy)]
enum Frame {
    Object { expect_key: bool },
    Array,
}

// Input is already known to be valid JSON.
fn scan(bytes: &[u8]) -> Vec<LeafString> {
    let mut out = Vec::new();
    let mut stack: Vec<Frame> = Vec::new();
    let mut i = 0;

    while i < bytes.len() {
        match bytes[i] {
            b'{' => stack.push(Frame::Object { expect_key: true }),
            b'[' => stack.push(Frame::Array),
            b'}' | b']' => {
                stack.pop();
            }
            b',' => {
                if let Some(Frame::Object { expect_key }) = stack.last_mut() {
                    *expect_key = true;
                }
            }
            b':' => {
                if let Some(Frame::Object { expect_key }) = stack.last_mut() {
                    *expect_key = false;
                }
            }
            b'"' => {
                let start = i + 1;
                let mut j = start;
                let mut escapes = Vec::new();
                while j < bytes.len() && bytes[j] != b'"' {
                    if bytes[j] == b'\\' {
                        let len = if bytes.get(j + 1) == Some(&b'u') { 6 } else { 2 };
                        let esc_end = (j + len).min(bytes.len());
                        escapes.push((j, esc_end));
                        j = esc_end;
                    } else {
                        j += 1;
                    }
                }
                let is_key = matches!(stack.last(), Some(Frame::Object { expect_key: true }));
                if !is_key {
                    out.push(LeafString {
                        start,
                        end: j,
                        escapes,
                    });
                }
                i = j;
            }
            _ => {}
        }
        i += 1;
    }
    out
}

/// Whether two JSON values have the same shape: same container kinds,
/// same object keys, same array lengths and same scalar kinds.
pub fn same_shape(a: &Value, b: &Value) -> bool {
    match (a, b) {
        (Value::Object(x), Value::Object(y)) => {
            x.len() == y.len()
                && x.iter()
                    .all(|(k, v)| y.get(k).map(|w| same_shape(v, w)).unwrap_or(false))
        }
        (Value::Array(x), Value::Array(y)) => {
            x.len() == y.len() && x.iter().zip(y).all(|(v, w)| same_shape(v, w))
        }
        (Value::String(_), Value::String(_))
        | (Value::Number(_), Value::Number(_))
        | (Value::Bool(_), Value::Bool(_))
        | (Value::Null, Value::Null) => true,
        _ => false,
    }
}
