//! The node seam: everything the resolver and the migration engine need
//! from one data-node connection
//!
//! [`crate::connection::NodeConnection`] implements [`KvNode`] over the
//! binary protocol. Tests substitute an in-memory node.

use std::collections::BTreeMap;

use async_trait::async_trait;
use bytes::Bytes;

use crate::error::Result;
use crate::topology::ClusterMap;
use crate::vbucket::VBucketId;

/// Result of a point read
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum GetOutcome {
    Found {
        value: Bytes,
        cas: u64,
        flags: u32,
        datatype: u8,
    },
    NotFound,
}

/// Result of a create-if-absent write
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AddOutcome {
    Created { cas: u64 },
    AlreadyExists,
}

/// Result of a CAS-guarded delete
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeleteOutcome {
    Deleted,
    NotFound,
    /// The document was rewritten after it was read and was left alone
    CasMismatch,
}

/// Extended attributes by name
pub type Xattrs = BTreeMap<String, serde_json::Value>;

/// A strictly sequential request/response channel to one data node
///
/// Methods take `&mut self`: a connection carries one in-flight request at
/// a time, and callers share it behind a mutex.
#[async_trait]
pub trait KvNode: Send + 'static {
    /// Fetch the bucket's cluster map
    async fn cluster_config(&mut self) -> Result<ClusterMap>;

    /// Read `key` from `vbucket`
    async fn get(&mut self, vbucket: VBucketId, key: &[u8]) -> Result<GetOutcome>;

    /// Create `key` in `vbucket` unless it already exists
    async fn add(
        &mut self,
        vbucket: VBucketId,
        key: &[u8],
        value: &[u8],
        flags: u32,
        datatype: u8,
    ) -> Result<AddOutcome>;

    /// Delete `key` from `vbucket` if its CAS still equals `cas`
    async fn delete(&mut self, vbucket: VBucketId, key: &[u8], cas: u64) -> Result<DeleteOutcome>;

    /// Read every extended attribute of `key`
    async fn xattrs(&mut self, vbucket: VBucketId, key: &[u8]) -> Result<Xattrs>;

    /// Release the connection
    async fn close(&mut self) -> Result<()>;
}

/// Opens authenticated, bucket-bound node connections
#[async_trait]
pub trait NodeConnector: Send + Sync {
    type Node: KvNode;

    async fn connect(&self, host: &str, port: u16) -> Result<Self::Node>;
}
