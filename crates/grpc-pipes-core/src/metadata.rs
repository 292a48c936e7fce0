//! Call metadata (request headers, response headers, trailers).
//!
//! Unlike a map, [`Metadata`] keeps every entry in insertion order and allows
//! duplicate keys: later entries may repeat or override earlier ones, and the
//! order is preserved across the wire.

use bytes::Bytes;

/// A metadata value: text or opaque bytes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MetadataValue {
    Ascii(String),
    Binary(Bytes),
}

impl MetadataValue {
    /// The text value, if this is not a binary entry.
    pub fn as_str(&self) -> Option<&str> {
        match self {
            MetadataValue::Ascii(value) => Some(value),
            MetadataValue::Binary(_) => None,
        }
    }

    pub fn as_bytes(&self) -> &[u8] {
        match self {
            MetadataValue::Ascii(value) => value.as_bytes(),
            MetadataValue::Binary(value) => value,
        }
    }

    pub fn is_binary(&self) -> bool {
        matches!(self, MetadataValue::Binary(_))
    }
}

impl From<&str> for MetadataValue {
    fn from(value: &str) -> Self {
        MetadataValue::Ascii(value.to_string())
    }
}

impl From<String> for MetadataValue {
    fn from(value: String) -> Self {
        MetadataValue::Ascii(value)
    }
}

impl From<Bytes> for MetadataValue {
    fn from(value: Bytes) -> Self {
        MetadataValue::Binary(value)
    }
}

impl From<Vec<u8>> for MetadataValue {
    fn from(value: Vec<u8>) -> Self {
        MetadataValue::Binary(Bytes::from(value))
    }
}

/// Ordered list of key/value pairs. Keys are lowercase ASCII.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Metadata {
    entries: Vec<(String, MetadataValue)>,
}

impl Metadata {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append an entry. The key is normalized to lowercase.
    pub fn push(&mut self, key: impl Into<String>, value: impl Into<MetadataValue>) {
        let key = key.into().to_ascii_lowercase();
        self.entries.push((key, value.into()));
    }

    /// Builder-style [`push`](Self::push).
    pub fn with(mut self, key: impl Into<String>, value: impl Into<MetadataValue>) -> Self {
        self.push(key, value);
        self
    }

    /// The most recently added value for `key`.
    pub fn get(&self, key: &str) -> Option<&MetadataValue> {
        let key = key.to_ascii_lowercase();
        self.entries
            .iter()
            .rev()
            .find(|(k, _)| *k == key)
            .map(|(_, v)| v)
    }

    /// All values for `key`, in insertion order.
    pub fn get_all<'a>(&'a self, key: &str) -> impl Iterator<Item = &'a MetadataValue> + 'a {
        let key = key.to_ascii_lowercase();
        self.entries
            .iter()
            .filter(move |(k, _)| *k == key)
            .map(|(_, v)| v)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &MetadataValue)> {
        self.entries.iter().map(|(k, v)| (k.as_str(), v))
    }

    pub fn extend(&mut self, other: Metadata) {
        self.entries.extend(other.entries);
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Number of entries, including duplicates.
    pub fn len(&self) -> usize {
        self.entries.len()
    }
}

impl<K, V> FromIterator<(K, V)> for Metadata
where
    K: Into<String>,
    V: Into<MetadataValue>,
{
    fn from_iter<T: IntoIterator<Item = (K, V)>>(iter: T) -> Self {
        let mut metadata = Metadata::new();
        for (key, value) in iter {
            metadata.push(key, value);
        }
        metadata
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_insertion_order_preserved_with_duplicates() {
        let metadata = Metadata::new()
            .with("b", "1")
            .with("a", "2")
            .with("b", "3");

        let keys: Vec<&str> = metadata.iter().map(|(k, _)| k).collect();
        assert_eq!(keys, vec!["b", "a", "b"]);
        assert_eq!(metadata.len(), 3);
    }

    #[test]
    fn test_get_returns_latest_value() {
        let metadata = Metadata::new().with("retry", "1").with("retry", "2");
        assert_eq!(metadata.get("retry").and_then(|v| v.as_str()), Some("2"));

        let all: Vec<_> = metadata.get_all("retry").filter_map(|v| v.as_str()).collect();
        assert_eq!(all, vec!["1", "2"]);
    }

    #[test]
    fn test_keys_are_lowercased() {
        let metadata = Metadata::new().with("X-Request-Id", "abc");
        assert!(metadata.get("x-request-id").is_some());
        assert!(metadata.get("X-REQUEST-ID").is_some());
    }

    #[test]
    fn test_binary_values() {
        let metadata = Metadata::new().with("trace-bin", vec![0u8, 159, 146, 150]);
        let value = metadata.get("trace-bin").unwrap();
        assert!(value.is_binary());
        assert_eq!(value.as_bytes(), &[0u8, 159, 146, 150]);
        assert!(value.as_str().is_none());
    }
}
