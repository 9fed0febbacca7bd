//! Document identifiers and fetched records

use std::fmt;

use bytes::Bytes;

use crate::vbucket::VBucketId;

/// A document id as reported by the index
///
/// Opaque bytes; may carry a legacy prefix. Never mutated after it is
/// read, so it is cheap to clone into worker tasks.
#[derive(Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct DocumentId(Bytes);

impl DocumentId {
    pub fn new(id: impl Into<Bytes>) -> Self {
        Self(id.into())
    }

    /// Returns the raw id bytes.
    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }

    pub fn into_bytes(self) -> Bytes {
        self.0
    }

    /// JSON-escaped rendering, safe for logs even with control bytes
    pub fn escaped(&self) -> String {
        serde_json::Value::String(String::from_utf8_lossy(&self.0).into_owned()).to_string()
    }
}

impl From<&str> for DocumentId {
    fn from(s: &str) -> Self {
        Self(Bytes::copy_from_slice(s.as_bytes()))
    }
}

impl From<String> for DocumentId {
    fn from(s: String) -> Self {
        Self(Bytes::from(s))
    }
}

impl From<&[u8]> for DocumentId {
    fn from(b: &[u8]) -> Self {
        Self(Bytes::copy_from_slice(b))
    }
}

impl From<Bytes> for DocumentId {
    fn from(b: Bytes) -> Self {
        Self(b)
    }
}

impl AsRef<[u8]> for DocumentId {
    fn as_ref(&self) -> &[u8] {
        &self.0
    }
}

impl fmt::Debug for DocumentId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "DocumentId({})", self.escaped())
    }
}

impl fmt::Display for DocumentId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.escaped())
    }
}

/// One physical copy of a document, as fetched
///
/// Read fresh on every fetch and never cached: the CAS is only
/// meaningful against the vbucket it was read from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DocumentRecord {
    /// Document body as stored
    pub value: Bytes,
    /// Version token returned with the read
    pub cas: u64,
    /// Opaque client flags, carried over on restore
    pub flags: u32,
    /// Datatype bits reported by the server
    pub datatype: u8,
    /// Vbucket the copy was read from
    pub vbucket: VBucketId,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_escaped_control_bytes() {
        let id = DocumentId::from(&b"\x03foo"[..]);
        assert_eq!(id.escaped(), r#""\u0003foo""#);
        assert_eq!(id.to_string(), r#""\u0003foo""#);
    }

    #[test]
    fn test_from_string_keeps_bytes() {
        let id = DocumentId::from(String::from("\u{0}abc"));
        assert_eq!(id.as_bytes(), b"\x00abc");
    }
}
