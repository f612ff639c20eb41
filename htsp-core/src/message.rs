//! The HTSP message value: an insertion-ordered, typed key→value map.
//!
//! Every unit exchanged with the server is one [`HtspMessage`]. String
//! fields are stored as raw bytes off the wire; UTF-8 validation is
//! deferred to the string getters, so a message carrying a bad string
//! field still parses and every other field stays accessible.

use bytes::Bytes;

use crate::error::HtspError;

// ── HtspValue ────────────────────────────────────────────────────

/// One field value inside an [`HtspMessage`].
#[derive(Debug, Clone, PartialEq)]
pub enum HtspValue {
    /// Signed 64-bit integer.
    S64(i64),
    /// String field, kept as raw bytes until a getter asks for UTF-8.
    Str(Bytes),
    /// Opaque binary blob (e.g. the auth challenge, muxpkt payloads).
    Bin(Bytes),
    /// Ordered list of values.
    List(Vec<HtspValue>),
    /// Nested message.
    Map(HtspMessage),
}

impl From<i64> for HtspValue {
    fn from(v: i64) -> Self {
        HtspValue::S64(v)
    }
}

impl From<i32> for HtspValue {
    fn from(v: i32) -> Self {
        HtspValue::S64(v as i64)
    }
}

impl From<&str> for HtspValue {
    fn from(v: &str) -> Self {
        HtspValue::Str(Bytes::copy_from_slice(v.as_bytes()))
    }
}

impl From<String> for HtspValue {
    fn from(v: String) -> Self {
        HtspValue::Str(Bytes::from(v.into_bytes()))
    }
}

impl From<Bytes> for HtspValue {
    fn from(v: Bytes) -> Self {
        HtspValue::Bin(v)
    }
}

impl From<Vec<u8>> for HtspValue {
    fn from(v: Vec<u8>) -> Self {
        HtspValue::Bin(Bytes::from(v))
    }
}

impl From<Vec<HtspValue>> for HtspValue {
    fn from(v: Vec<HtspValue>) -> Self {
        HtspValue::List(v)
    }
}

impl From<HtspMessage> for HtspValue {
    fn from(v: HtspMessage) -> Self {
        HtspValue::Map(v)
    }
}

// ── HtspMessage ──────────────────────────────────────────────────

/// An ordered mapping from field name to [`HtspValue`].
///
/// Field order is preserved exactly as inserted (and as received off
/// the wire). Lookups are linear — HTSP messages are small, typically
/// well under a dozen fields.
///
/// Messages are mutable until handed to the dispatcher; the dispatcher
/// takes them by value, so nothing can touch `seq` after enqueue.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct HtspMessage {
    fields: Vec<(String, HtspValue)>,
}

impl HtspMessage {
    pub fn new() -> Self {
        Self::default()
    }

    /// Convenience constructor for a request carrying a `method` field.
    pub fn request(method: &str) -> Self {
        let mut message = Self::new();
        message.put("method", method);
        message
    }

    /// Insert or replace a field. Replacement keeps the field's
    /// original position.
    pub fn put(&mut self, name: &str, value: impl Into<HtspValue>) {
        let value = value.into();
        match self.fields.iter_mut().find(|(n, _)| n == name) {
            Some((_, slot)) => *slot = value,
            None => self.fields.push((name.to_owned(), value)),
        }
    }

    pub fn contains(&self, name: &str) -> bool {
        self.fields.iter().any(|(n, _)| n == name)
    }

    pub fn get(&self, name: &str) -> Option<&HtspValue> {
        self.fields
            .iter()
            .find(|(n, _)| n == name)
            .map(|(_, v)| v)
    }

    /// Number of fields.
    pub fn len(&self) -> usize {
        self.fields.len()
    }

    pub fn is_empty(&self) -> bool {
        self.fields.is_empty()
    }

    /// Iterate fields in insertion order.
    pub fn iter(&self) -> impl Iterator<Item = (&str, &HtspValue)> {
        self.fields.iter().map(|(n, v)| (n.as_str(), v))
    }

    // ── Typed getters ─────────────────────────────────────────────

    pub fn get_i64(&self, name: &str) -> Option<i64> {
        match self.get(name) {
            Some(HtspValue::S64(v)) => Some(*v),
            _ => None,
        }
    }

    pub fn get_i64_or(&self, name: &str, default: i64) -> i64 {
        self.get_i64(name).unwrap_or(default)
    }

    /// String getter. Returns `None` for an absent field, a
    /// non-string field, or string bytes that are not valid UTF-8.
    pub fn get_str(&self, name: &str) -> Option<&str> {
        match self.get(name) {
            Some(HtspValue::Str(bytes)) => std::str::from_utf8(bytes).ok(),
            _ => None,
        }
    }

    pub fn get_str_or<'a>(&'a self, name: &str, default: &'a str) -> &'a str {
        self.get_str(name).unwrap_or(default)
    }

    pub fn get_bin(&self, name: &str) -> Option<&Bytes> {
        match self.get(name) {
            Some(HtspValue::Bin(bytes)) => Some(bytes),
            _ => None,
        }
    }

    pub fn get_list(&self, name: &str) -> Option<&[HtspValue]> {
        match self.get(name) {
            Some(HtspValue::List(values)) => Some(values),
            _ => None,
        }
    }

    pub fn get_map(&self, name: &str) -> Option<&HtspMessage> {
        match self.get(name) {
            Some(HtspValue::Map(map)) => Some(map),
            _ => None,
        }
    }

    /// Required-field variant of [`get_i64`](Self::get_i64).
    pub fn require_i64(&self, name: &'static str) -> Result<i64, HtspError> {
        self.get_i64(name).ok_or(HtspError::Protocol(name))
    }

    /// Required-field variant of [`get_str`](Self::get_str).
    pub fn require_str(&self, name: &'static str) -> Result<&str, HtspError> {
        self.get_str(name).ok_or(HtspError::Protocol(name))
    }

    /// Required-field variant of [`get_bin`](Self::get_bin).
    pub fn require_bin(&self, name: &'static str) -> Result<&Bytes, HtspError> {
        self.get_bin(name).ok_or(HtspError::Protocol(name))
    }

    // ── Protocol helpers ──────────────────────────────────────────

    /// The `method` field, present on requests and async events.
    pub fn method(&self) -> Option<&str> {
        self.get_str("method")
    }

    /// The `seq` field, present on requests and their replies.
    pub fn seq(&self) -> Option<i64> {
        self.get_i64("seq")
    }
}

// ── Tests ────────────────────────────────────────────────────────
