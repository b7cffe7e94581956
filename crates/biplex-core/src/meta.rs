//! Ordered multimap of message headers.

use crate::escape::{escape_into, unescape};
use crate::status::Status;

/// Meta key carrying the caller's per-message deadline in decimal
/// seconds; fractions carry sub-second deadlines.
pub const META_CONTEXT_AGE: &str = "X-Context-Age";
/// Meta key carrying the body codec id the caller wants the reply in.
pub const META_ACCEPT_BODY_CODEC: &str = "X-Accept-Body-Codec";

/// Ordered multimap of key/value headers carried on every message.
///
/// Insertion order is preserved and a key may appear more than once. On the
/// wire a meta encodes as `key=value&key=value` with percent-escaped values.
///
/// Keys prefixed `X-` are reserved for the framework, `hb_` for the
/// heartbeat plugin.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Meta {
    pairs: Vec<(String, String)>,
}

impl Meta {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_empty(&self) -> bool {
        self.pairs.is_empty()
    }

    pub fn len(&self) -> usize {
        self.pairs.len()
    }

    /// Replaces the first occurrence of `key` and removes any others;
    /// appends if absent.
    pub fn set(&mut self, key: impl Into<String>, value: impl Into<String>) {
        let key = key.into();
        let value = value.into();
        match self.pairs.iter().position(|(k, _)| *k == key) {
            Some(first) => {
                self.pairs[first].1 = value;
                let mut i = first + 1;
                while i < self.pairs.len() {
                    if self.pairs[i].0 == key {
                        self.pairs.remove(i);
                    } else {
                        i += 1;
                    }
                }
            }
            None => self.pairs.push((key, value)),
        }
    }

    /// Appends a pair, keeping any existing values for `key`.
    pub fn add(&mut self, key: impl Into<String>, value: impl Into<String>) {
        self.pairs.push((key.into(), value.into()));
    }

    /// First value for `key`.
    pub fn get(&self, key: &str) -> Option<&str> {
        self.pairs
            .iter()
            .find(|(k, _)| k == key)
            .map(|(_, v)| v.as_str())
    }

    /// All values for `key`, in insertion order.
    pub fn get_all<'a>(&'a self, key: &'a str) -> impl Iterator<Item = &'a str> + 'a {
        self.pairs
            .iter()
            .filter(move |(k, _)| k == key)
            .map(|(_, v)| v.as_str())
    }

    /// Removes every value for `key`.
    pub fn del(&mut self, key: &str) {
        self.pairs.retain(|(k, _)| k != key);
    }

    /// Iterates pairs in insertion order.
    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> + '_ {
        self.pairs.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }

    pub fn clear(&mut self) {
        self.pairs.clear();
    }

    /// Encodes as a query string, preserving order and duplicates.
    pub fn encode(&self) -> Vec<u8> {
        let mut out = Vec::new();
        for (i, (k, v)) in self.pairs.iter().enumerate() {
            if i > 0 {
                out.push(b'&');
            }
            escape_into(&mut out, k.as_bytes());
            out.push(b'=');
            escape_into(&mut out, v.as_bytes());
        }
        out
    }

    /// Decodes the wire form produced by [`Meta::encode`].
    pub fn decode(data: &[u8]) -> Result<Self, Status> {
        let mut meta = Meta::new();
        if data.is_empty() {
            return Ok(meta);
        }
        for pair in data.split(|&b| b == b'&') {
            let mut it = pair.splitn(2, |&b| b == b'=');
            let key = unescape(it.next().unwrap_or_default())?;
            let value = unescape(it.next().unwrap_or_default())?;
            let key = String::from_utf8(key)
                .map_err(|_| Status::bad_message("meta key is not utf-8"))?;
            let value = String::from_utf8(value)
                .map_err(|_| Status::bad_message("meta value is not utf-8"))?;
            if key.is_empty() {
                return Err(Status::bad_message("empty meta key"));
            }
            meta.pairs.push((key, value));
        }
        Ok(meta)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_set_replaces_all_occurrences() {
        let mut meta = Meta::new();
        meta.add("a", "1");
        meta.add("b", "2");
        meta.add("a", "3");
        meta.set("a", "9");
        assert_eq!(meta.get_all("a").collect::<Vec<_>>(), vec!["9"]);
        assert_eq!(meta.len(), 2);
        // first slot keeps its position
        assert_eq!(meta.iter().next(), Some(("a", "9")));
    }

    #[test]
    fn test_roundtrip_preserves_order_and_duplicates() {
        let mut meta = Meta::new();
        meta.add("peer", "a=b&c");
        meta.add("tag", "x");
        meta.add("tag", "y");
        let decoded = Meta::decode(&meta.encode()).unwrap();
        assert_eq!(decoded, meta);
        assert_eq!(decoded.get_all("tag").collect::<Vec<_>>(), vec!["x", "y"]);
    }

    #[test]
    fn test_empty_roundtrip() {
        let meta = Meta::new();
        assert!(meta.encode().is_empty());
        assert_eq!(Meta::decode(b"").unwrap(), meta);
    }

    #[test]
    fn test_value_missing_equals_sign() {
        let meta = Meta::decode(b"flag").unwrap();
        assert_eq!(meta.get("flag"), Some(""));
    }
}
