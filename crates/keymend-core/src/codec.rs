//! Collection-id key codec
//!
//! Keys on a collection-aware connection are prefixed with the
//! collection id as an unsigned LEB128 varint (continuation bit `0x80` on
//! every byte but the last). Collection `0` therefore encodes to a single
//! `0x00` byte, which is byte-for-byte identical to the older
//! "null-prefix" convention. The two cannot be told apart from the key
//! alone, so nothing here ever guesses a prefix: callers only strip or
//! re-encode a prefix they already know.

use bytes::{BufMut, Bytes, BytesMut};
use serde::{Deserialize, Serialize};

use crate::error::{KvError, Result};

/// Exclusive upper bound for collection ids handled by keymend
pub const COLLECTION_ID_LIMIT: u32 = 32;

/// A validated collection id in `[0, 32)`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(try_from = "u32", into = "u32")]
pub struct CollectionId(u32);

impl CollectionId {
    /// The default collection
    pub const DEFAULT: CollectionId = CollectionId(0);

    /// Validate a raw collection id
    pub fn new(id: u32) -> Result<Self> {
        if id >= COLLECTION_ID_LIMIT {
            return Err(KvError::InvalidArgument(format!(
                "collection id {} is outside [0, {})",
                id, COLLECTION_ID_LIMIT
            )));
        }
        Ok(Self(id))
    }

    /// Returns the numeric collection id.
    pub fn value(&self) -> u32 {
        self.0
    }

    /// The varint prefix this collection puts in front of a key
    pub fn prefix(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(5);
        put_leb128(self.0, &mut buf);
        buf.freeze()
    }
}

impl TryFrom<u32> for CollectionId {
    type Error = KvError;

    fn try_from(value: u32) -> Result<Self> {
        Self::new(value)
    }
}

impl From<CollectionId> for u32 {
    fn from(id: CollectionId) -> u32 {
        id.0
    }
}

impl std::fmt::Display for CollectionId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Append `value` as an unsigned LEB128 varint
pub fn put_leb128(mut value: u32, buf: &mut BytesMut) {
    loop {
        let byte = (value & 0x7f) as u8;
        value >>= 7;
        if value > 0 {
            buf.put_u8(byte | 0x80);
        } else {
            buf.put_u8(byte);
            break;
        }
    }
}

/// Prepend the collection prefix to `id`
pub fn encode_key(id: &[u8], collection: CollectionId) -> Bytes {
    let mut buf = BytesMut::with_capacity(id.len() + 5);
    put_leb128(collection.value(), &mut buf);
    buf.put_slice(id);
    buf.freeze()
}

/// Remove a prefix of known length from an encoded key
pub fn decode_key(encoded: &[u8], prefix_len: usize) -> Result<&[u8]> {
    encoded.get(prefix_len..).ok_or_else(|| {
        KvError::InvalidArgument(format!(
            "key of {} bytes is shorter than its {}-byte prefix",
            encoded.len(),
            prefix_len
        ))
    })
}

/// How legacy ids were written
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum LegacyConvention {
    /// Ids carry a collection-id varint and live in the default collection
    /// of a collection-aware bucket
    #[default]
    CollectionPrefix,
    /// Ids carry a single `0x00` byte on a bucket without collections
    NullPrefix,
}

impl std::fmt::Display for LegacyConvention {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            LegacyConvention::CollectionPrefix => write!(f, "collection-prefix"),
            LegacyConvention::NullPrefix => write!(f, "null-prefix"),
        }
    }
}

/// A byte-string shape under which a legacy id may have been hashed
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum KeyVariant {
    /// The id exactly as the index reports it
    AsGiven,
    /// The id with its legacy prefix removed
    Stripped,
    /// The id behind one extra `0x00` byte
    NullPrefixed,
}

/// Key shaping rules for one run: the legacy convention plus the
/// collection the canonical documents belong in
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct KeyShape {
    convention: LegacyConvention,
    collection: CollectionId,
}

impl KeyShape {
    /// Combine a convention with a target collection
    ///
    /// The null-prefix convention predates collections, so only the
    /// default collection is meaningful there.
    pub fn new(convention: LegacyConvention, collection: CollectionId) -> Result<Self> {
        if convention == LegacyConvention::NullPrefix && collection != CollectionId::DEFAULT {
            return Err(KvError::InvalidArgument(format!(
                "null-prefix convention cannot target collection {}",
                collection
            )));
        }
        Ok(Self {
            convention,
            collection,
        })
    }

    /// Returns how legacy ids were written.
    pub fn convention(&self) -> LegacyConvention {
        self.convention
    }

    /// Returns the collection canonical documents are restored into.
    pub fn collection(&self) -> CollectionId {
        self.collection
    }

    /// Whether connections must negotiate collection-prefixed keys
    pub fn collections_enabled(&self) -> bool {
        self.convention == LegacyConvention::CollectionPrefix
    }

    /// The prefix legacy ids start with
    pub fn legacy_prefix(&self) -> Bytes {
        match self.convention {
            LegacyConvention::CollectionPrefix => self.collection.prefix(),
            LegacyConvention::NullPrefix => Bytes::from_static(&[0]),
        }
    }

    /// Whether an indexed id has the legacy shape with a non-empty remainder
    pub fn is_legacy_id(&self, id: &[u8]) -> bool {
        let prefix = self.legacy_prefix();
        id.len() > prefix.len() && id.starts_with(&prefix)
    }

    /// The canonical (un-prefixed) id, if `id` carries the legacy prefix
    pub fn canonical_id(&self, id: &[u8]) -> Option<Bytes> {
        let prefix = self.legacy_prefix();
        if !id.starts_with(&prefix) {
            return None;
        }
        decode_key(id, prefix.len()).ok().map(Bytes::copy_from_slice)
    }

    /// Build the legacy id that a plain id would have been written as
    pub fn legacy_id(&self, plain: &[u8]) -> Bytes {
        let mut buf = BytesMut::with_capacity(plain.len() + 5);
        buf.put_slice(&self.legacy_prefix());
        buf.put_slice(plain);
        buf.freeze()
    }

    /// The byte string hashed for `variant` of `id`, if it applies
    pub fn variant(&self, id: &[u8], variant: KeyVariant) -> Option<Bytes> {
        match variant {
            KeyVariant::AsGiven => Some(Bytes::copy_from_slice(id)),
            KeyVariant::Stripped => self.canonical_id(id),
            KeyVariant::NullPrefixed => {
                let mut buf = BytesMut::with_capacity(id.len() + 1);
                buf.put_u8(0);
                buf.put_slice(id);
                Some(buf.freeze())
            }
        }
    }

    /// Wire key of a logical key in `collection`
    fn wire_key(&self, logical: &[u8], collection: CollectionId) -> Bytes {
        if self.collections_enabled() {
            encode_key(logical, collection)
        } else {
            Bytes::copy_from_slice(logical)
        }
    }

    /// Wire key used to fetch or delete a legacy copy
    pub fn legacy_wire_key(&self, id: &[u8]) -> Bytes {
        self.wire_key(id, CollectionId::DEFAULT)
    }

    /// Wire key the canonical copy is created under
    pub fn canonical_wire_key(&self, canonical: &[u8]) -> Bytes {
        self.wire_key(canonical, self.collection)
    }

    /// Index `LIKE` pattern matching every legacy id, as a JSON string
    /// literal
    pub fn index_pattern(&self) -> String {
        let mut pattern = String::from_utf8_lossy(&self.legacy_prefix()).into_owned();
        pattern.push('%');
        serde_json::Value::String(pattern).to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cid(id: u32) -> CollectionId {
        CollectionId::new(id).unwrap()
    }

    #[test]
    fn test_collection_id_bounds() {
        assert!(CollectionId::new(0).is_ok());
        assert!(CollectionId::new(31).is_ok());
        assert!(matches!(
            CollectionId::new(32),
            Err(KvError::InvalidArgument(_))
        ));
    }

    #[test]
    fn test_encode_single_byte_prefix() {
        assert_eq!(&encode_key(b"foo", cid(3))[..], b"\x03foo");
        assert_eq!(&encode_key(b"foo", cid(0))[..], b"\x00foo");
        assert_eq!(&encode_key(b"", cid(31))[..], b"\x1f");
    }

    #[test]
    fn test_leb128_multi_byte() {
        let mut buf = BytesMut::new();
        put_leb128(300, &mut buf);
        assert_eq!(&buf[..], &[0xac, 0x02]);

        let mut buf = BytesMut::new();
        put_leb128(0x7f, &mut buf);
        assert_eq!(&buf[..], &[0x7f]);

        let mut buf = BytesMut::new();
        put_leb128(0x80, &mut buf);
        assert_eq!(&buf[..], &[0x80, 0x01]);
    }

    #[test]
    fn test_decode_known_prefix() {
        let encoded = encode_key(b"user::1001", cid(9));
        assert_eq!(decode_key(&encoded, 1).unwrap(), b"user::1001");
        assert!(decode_key(b"", 1).is_err());
    }

    #[test]
    fn test_null_prefix_requires_default_collection() {
        assert!(KeyShape::new(LegacyConvention::NullPrefix, cid(0)).is_ok());
        assert!(KeyShape::new(LegacyConvention::NullPrefix, cid(3)).is_err());
    }

    #[test]
    fn test_collection_prefix_shape() {
        let shape = KeyShape::new(LegacyConvention::CollectionPrefix, cid(3)).unwrap();
        assert!(shape.collections_enabled());
        assert_eq!(&shape.legacy_prefix()[..], b"\x03");
        assert!(shape.is_legacy_id(b"\x03foo"));
        assert!(!shape.is_legacy_id(b"\x03"));
        assert!(!shape.is_legacy_id(b"foo"));
        assert_eq!(&shape.canonical_id(b"\x03foo").unwrap()[..], b"foo");
        assert_eq!(shape.canonical_id(b"foo"), None);
        assert_eq!(&shape.legacy_wire_key(b"\x03foo")[..], b"\x00\x03foo");
        assert_eq!(&shape.canonical_wire_key(b"foo")[..], b"\x03foo");
        assert_eq!(&shape.legacy_id(b"foo")[..], b"\x03foo");
    }

    #[test]
    fn test_null_prefix_shape() {
        let shape = KeyShape::new(LegacyConvention::NullPrefix, CollectionId::DEFAULT).unwrap();
        assert!(!shape.collections_enabled());
        assert!(shape.is_legacy_id(b"\x00a"));
        assert!(!shape.is_legacy_id(b"\x00"));
        assert!(!shape.is_legacy_id(b"ab"));
        assert_eq!(&shape.legacy_wire_key(b"\x00abc")[..], b"\x00abc");
        assert_eq!(&shape.canonical_wire_key(b"abc")[..], b"abc");
    }

    #[test]
    fn test_variants() {
        let shape = KeyShape::new(LegacyConvention::CollectionPrefix, cid(3)).unwrap();
        let id = b"\x03foo";
        assert_eq!(&shape.variant(id, KeyVariant::AsGiven).unwrap()[..], b"\x03foo");
        assert_eq!(&shape.variant(id, KeyVariant::Stripped).unwrap()[..], b"foo");
        assert_eq!(
            &shape.variant(id, KeyVariant::NullPrefixed).unwrap()[..],
            b"\x00\x03foo"
        );
        assert_eq!(shape.variant(b"foo", KeyVariant::Stripped), None);
    }

    #[test]
    fn test_index_pattern_is_json_escaped() {
        let shape = KeyShape::new(LegacyConvention::CollectionPrefix, cid(3)).unwrap();
        assert_eq!(shape.index_pattern(), r#""\u0003%""#);

        let shape = KeyShape::new(LegacyConvention::NullPrefix, CollectionId::DEFAULT).unwrap();
        assert_eq!(shape.index_pattern(), r#""\u0000%""#);
    }

    #[test]
    fn test_collection_id_deserialize_validates() {
        #[derive(Deserialize)]
        struct Holder {
            cid: CollectionId,
        }
        let ok: Holder = serde_json::from_str(r#"{"cid": 12}"#).unwrap();
        assert_eq!(ok.cid.value(), 12);
        assert!(serde_json::from_str::<Holder>(r#"{"cid": 40}"#).is_err());
    }
}
