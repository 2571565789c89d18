//! The box message type.
//!
//! A box is a flat mapping from short string keys to byte-string values. It
//! is the atomic unit of the wire protocol: one box per frame, key order
//! irrelevant. The empty box is valid and meaningful; several sub-protocols
//! use it as an ack or end-of-stream sentinel.

use crate::error::ProtocolError;
use crate::{MAX_KEY_LEN, MAX_VALUE_LEN};
use bytes::Bytes;
use std::collections::btree_map;
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

/// One protocol message: string keys mapped to byte values.
///
/// Keys must be 1-255 bytes of UTF-8, values at most 65535 bytes. Limits are
/// enforced by the frame codec at encode time, so a `Message` under
/// construction may hold oversized entries until it is sent.
#[derive(Clone, Default, PartialEq, Eq)]
pub struct Message {
    entries: BTreeMap<String, Bytes>,
}

impl Message {
    /// Creates an empty box.
    pub fn new() -> Self {
        Self::default()
    }

    /// Builder-style insert.
    pub fn with(mut self, key: impl Into<String>, value: impl Into<Bytes>) -> Self {
        self.insert(key, value);
        self
    }

    /// Inserts a key, replacing any previous value for it.
    pub fn insert(&mut self, key: impl Into<String>, value: impl Into<Bytes>) {
        self.entries.insert(key.into(), value.into());
    }

    /// Inserts a key only when the caller has a value for it.
    pub fn maybe_with(self, key: impl Into<String>, value: Option<impl Into<Bytes>>) -> Self {
        match value {
            Some(v) => self.with(key, v),
            None => self,
        }
    }

    /// Removes a key, returning its value if present.
    pub fn remove(&mut self, key: &str) -> Option<Bytes> {
        self.entries.remove(key)
    }

    pub fn contains(&self, key: &str) -> bool {
        self.entries.contains_key(key)
    }

    pub fn get(&self, key: &str) -> Option<&Bytes> {
        self.entries.get(key)
    }

    /// Returns a value as UTF-8 text, or `None` if absent or not UTF-8.
    pub fn get_str(&self, key: &str) -> Option<&str> {
        self.entries
            .get(key)
            .and_then(|v| std::str::from_utf8(v).ok())
    }

    /// Returns a value that must be present.
    pub fn require(&self, key: &'static str) -> Result<&Bytes, ProtocolError> {
        self.entries.get(key).ok_or(ProtocolError::MissingKey(key))
    }

    /// Returns a value that must be present and valid UTF-8.
    pub fn require_str(&self, key: &'static str) -> Result<&str, ProtocolError> {
        let value = self.require(key)?;
        std::str::from_utf8(value).map_err(|_| ProtocolError::ValueNotUtf8(key.to_string()))
    }

    /// Returns a value that must be present and parse as a decimal integer.
    pub fn require_int<T: FromStr>(&self, key: &'static str) -> Result<T, ProtocolError> {
        self.require_str(key)?
            .parse()
            .map_err(|_| ProtocolError::ValueNotInt(key.to_string()))
    }

    /// True for the empty box `{}`.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn iter(&self) -> btree_map::Iter<'_, String, Bytes> {
        self.entries.iter()
    }

    pub fn keys(&self) -> impl Iterator<Item = &str> {
        self.entries.keys().map(String::as_str)
    }

    /// Checks the size limits this box must satisfy to be encodable.
    pub fn validate(&self) -> Result<(), ProtocolError> {
        for (key, value) in &self.entries {
            if key.is_empty() || key.len() > MAX_KEY_LEN {
                return Err(ProtocolError::InvalidKeyLength(key.len()));
            }
            if value.len() > MAX_VALUE_LEN {
                return Err(ProtocolError::ValueTooLarge {
                    size: value.len(),
                    max: MAX_VALUE_LEN,
                });
            }
        }
        Ok(())
    }
}

impl<K: Into<String>, V: Into<Bytes>> FromIterator<(K, V)> for Message {
    fn from_iter<I: IntoIterator<Item = (K, V)>>(iter: I) -> Self {
        let mut msg = Message::new();
        for (k, v) in iter {
            msg.insert(k, v);
        }
        msg
    }
}

impl fmt::Debug for Message {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut map = f.debug_map();
        for (key, value) in &self.entries {
            match std::str::from_utf8(value) {
                Ok(text) if text.len() <= 64 => map.entry(key, &text),
                _ => map.entry(key, &format_args!("<{} bytes>", value.len())),
            };
        }
        map.finish()
    }
}
