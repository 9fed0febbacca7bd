//! Partition hash
//!
//! A key's vbucket is `(crc32(key) >> 16 & 0x7fff) mod N`, with the
//! standard (zlib / IEEE 802.3) CRC-32. This must match the server's own
//! partitioning bit for bit; a request sent to any other vbucket comes
//! back as a spurious miss.

use crate::error::{KvError, Result};

/// Vbucket counts a bucket may be configured with
pub const VALID_VBUCKET_COUNTS: [u16; 3] = [64, 128, 1024];

/// Identifier of a logical partition
pub type VBucketId = u16;

/// Number of vbuckets in the bucket, fixed for the whole run
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct VBucketCount(u16);

impl VBucketCount {
    /// Validate a vbucket count reported by the cluster
    pub fn new(count: usize) -> Result<Self> {
        match u16::try_from(count) {
            Ok(n) if VALID_VBUCKET_COUNTS.contains(&n) => Ok(Self(n)),
            _ => Err(KvError::ConfigInconsistency(format!(
                "vbucket count {} is not one of {:?}",
                count, VALID_VBUCKET_COUNTS
            ))),
        }
    }

    pub fn get(&self) -> u16 {
        self.0
    }

    /// Owning vbucket of a raw key
    pub fn vbucket_for(&self, key: &[u8]) -> VBucketId {
        vbucket_for_key(key, self.0)
    }

    /// Every vbucket id in order
    pub fn iter(&self) -> impl Iterator<Item = VBucketId> {
        0..self.0
    }
}

/// Compute the owning vbucket of `key` among `count` vbuckets
pub fn vbucket_for_key(key: &[u8], count: u16) -> VBucketId {
    debug_assert!(count > 0);
    let crc = crc32fast::hash(key);
    (((crc >> 16) & 0x7fff) % count as u32) as VBucketId
}
