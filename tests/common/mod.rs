//! Shared test utilities for keymend integration tests.
//!
//! Import via `mod common;` in integration test files:
//! ```rust,ignore
//! mod common;
//! use common::*;
//! ```

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::Mutex;

use keymend::error::{KvError, Result};
use keymend::node::{
    AddOutcome, DeleteOutcome, GetOutcome, KvNode, NodeConnector, Xattrs,
};
use keymend::protocol::{Opcode, Status};
use keymend::topology::{ClusterMap, Endpoint, Topology};
use keymend::vbucket::{vbucket_for_key, VBucketId};

// ============================================================================
// In-memory cluster
// ============================================================================

/// A stored document
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoredDoc {
    pub value: Bytes,
    pub cas: u64,
    pub flags: u32,
    pub datatype: u8,
}

/// Error injected for one key
#[derive(Debug, Clone, Copy)]
enum Injected {
    Status(Status),
    Disconnect,
}

impl Injected {
    fn into_error(self, opcode: Opcode) -> KvError {
        match self {
            Injected::Status(status) => KvError::Server { opcode, status },
            Injected::Disconnect => KvError::Connection("connection reset by peer".into()),
        }
    }
}

#[derive(Default)]
struct ClusterState {
    docs: HashMap<(VBucketId, Vec<u8>), StoredDoc>,
    xattrs: HashMap<(VBucketId, Vec<u8>), Xattrs>,
    next_cas: u64,
    ops: Vec<String>,
    /// Keys rewritten by "another writer" right after every read
    rewrite_after_get: HashSet<(VBucketId, Vec<u8>)>,
    /// Status returned by every add
    fail_adds: Option<Status>,
    /// Make every get fail as if the node went away
    fail_gets_with_disconnect: bool,
    get_failures: HashMap<(VBucketId, Vec<u8>), Injected>,
    delete_failures: HashMap<(VBucketId, Vec<u8>), Injected>,
    closed: usize,
}

/// Shared document store behind every [`MemoryNode`]
///
/// Documents are keyed by (vbucket, wire key), so a key written to the
/// wrong vbucket is invisible to a correctly routed read, just like on a
/// real cluster.
#[derive(Clone, Default)]
pub struct MemoryCluster {
    state: Arc<Mutex<ClusterState>>,
    vbuckets: usize,
    nodes: usize,
}

#[allow(dead_code)]
impl MemoryCluster {
    pub fn new(vbuckets: usize, nodes: usize) -> Self {
        Self {
            state: Arc::new(Mutex::new(ClusterState {
                next_cas: 1000,
                ..Default::default()
            })),
            vbuckets,
            nodes,
        }
    }

    /// Store a JSON document directly; returns its CAS
    pub fn put(&self, vbucket: VBucketId, key: &[u8], value: &str) -> u64 {
        self.put_with(vbucket, key, value, 0, 0x01)
    }

    pub fn put_with(
        &self,
        vbucket: VBucketId,
        key: &[u8],
        value: &str,
        flags: u32,
        datatype: u8,
    ) -> u64 {
        let mut state = self.state.lock();
        state.next_cas += 1;
        let cas = state.next_cas;
        state.docs.insert(
            (vbucket, key.to_vec()),
            StoredDoc {
                value: Bytes::copy_from_slice(value.as_bytes()),
                cas,
                flags,
                datatype,
            },
        );
        cas
    }

    pub fn get(&self, vbucket: VBucketId, key: &[u8]) -> Option<StoredDoc> {
        self.state.lock().docs.get(&(vbucket, key.to_vec())).cloned()
    }

    pub fn len(&self) -> usize {
        self.state.lock().docs.len()
    }

    pub fn set_xattrs(&self, vbucket: VBucketId, key: &[u8], xattrs: Xattrs) {
        self.state.lock().xattrs.insert((vbucket, key.to_vec()), xattrs);
    }

    pub fn rewrite_after_get(&self, vbucket: VBucketId, key: &[u8]) {
        self.state
            .lock()
            .rewrite_after_get
            .insert((vbucket, key.to_vec()));
    }

    pub fn fail_adds(&self, status: Status) {
        self.state.lock().fail_adds = Some(status);
    }

    pub fn fail_gets_with_disconnect(&self) {
        self.state.lock().fail_gets_with_disconnect = true;
    }

    /// Reads of `key` in `vbucket` return a server status error
    pub fn fail_get(&self, vbucket: VBucketId, key: &[u8], status: Status) {
        self.state
            .lock()
            .get_failures
            .insert((vbucket, key.to_vec()), Injected::Status(status));
    }

    /// Reads of `key` in `vbucket` fail as if the node went away
    pub fn disconnect_on_get(&self, vbucket: VBucketId, key: &[u8]) {
        self.state
            .lock()
            .get_failures
            .insert((vbucket, key.to_vec()), Injected::Disconnect);
    }

    /// Deletes of `key` in `vbucket` return a server status error
    pub fn fail_delete(&self, vbucket: VBucketId, key: &[u8], status: Status) {
        self.state
            .lock()
            .delete_failures
            .insert((vbucket, key.to_vec()), Injected::Status(status));
    }

    /// Operations served so far, e.g. `"add 115"`
    pub fn ops(&self) -> Vec<String> {
        self.state.lock().ops.clone()
    }

    pub fn count_ops(&self, prefix: &str) -> usize {
        self.state
            .lock()
            .ops
            .iter()
            .filter(|op| op.starts_with(prefix))
            .count()
    }

    pub fn closed_connections(&self) -> usize {
        self.state.lock().closed
    }

    pub fn node(&self) -> MemoryNode {
        MemoryNode {
            cluster: self.clone(),
            closed: false,
        }
    }

    /// Vbucket `v` is owned by node `v % nodes`
    pub fn owners(&self) -> Vec<usize> {
        (0..self.vbuckets).map(|vb| vb % self.nodes).collect()
    }

    pub fn topology(&self) -> Arc<Topology<MemoryNode>> {
        let nodes = (0..self.nodes)
            .map(|i| {
                (
                    Endpoint {
                        host: format!("kv{}", i + 1),
                        port: 11210,
                    },
                    self.node(),
                )
            })
            .collect();
        Arc::new(Topology::from_parts(nodes, self.owners()).unwrap())
    }

    pub fn cluster_map(&self) -> ClusterMap {
        let servers: Vec<String> = (0..self.nodes)
            .map(|i| {
                if i == 0 {
                    "\"$HOST:11210\"".to_string()
                } else {
                    format!("\"kv{}:11210\"", i + 1)
                }
            })
            .collect();
        let rows: Vec<String> = self
            .owners()
            .iter()
            .map(|o| format!("[{},-1]", o))
            .collect();
        let json = format!(
            r#"{{"rev":1,"vBucketServerMap":{{"hashAlgorithm":"CRC","numReplicas":1,"serverList":[{}],"vBucketMap":[{}]}}}}"#,
            servers.join(","),
            rows.join(",")
        );
        ClusterMap::from_json(json.as_bytes()).unwrap()
    }

    pub fn vbucket_for(&self, key: &[u8]) -> VBucketId {
        vbucket_for_key(key, self.vbuckets as u16)
    }
}

/// One "connection" to the in-memory cluster
pub struct MemoryNode {
    cluster: MemoryCluster,
    closed: bool,
}

impl MemoryNode {
    fn check_open(&self) -> Result<()> {
        if self.closed {
            return Err(KvError::Connection("connection closed".into()));
        }
        Ok(())
    }
}

#[async_trait]
impl KvNode for MemoryNode {
    async fn cluster_config(&mut self) -> Result<ClusterMap> {
        self.check_open()?;
        Ok(self.cluster.cluster_map())
    }

    async fn get(&mut self, vbucket: VBucketId, key: &[u8]) -> Result<GetOutcome> {
        self.check_open()?;
        let mut state = self.cluster.state.lock();
        state.ops.push(format!("get {}", vbucket));
        if state.fail_gets_with_disconnect {
            return Err(KvError::Connection("connection reset by peer".into()));
        }

        let slot = (vbucket, key.to_vec());
        if let Some(injected) = state.get_failures.get(&slot) {
            return Err(injected.into_error(Opcode::Get));
        }
        let Some(doc) = state.docs.get(&slot).cloned() else {
            return Ok(GetOutcome::NotFound);
        };
        if state.rewrite_after_get.contains(&slot) {
            state.next_cas += 1;
            let cas = state.next_cas;
            if let Some(stored) = state.docs.get_mut(&slot) {
                stored.cas = cas;
            }
        }
        Ok(GetOutcome::Found {
            value: doc.value,
            cas: doc.cas,
            flags: doc.flags,
            datatype: doc.datatype,
        })
    }

    async fn add(
        &mut self,
        vbucket: VBucketId,
        key: &[u8],
        value: &[u8],
        flags: u32,
        datatype: u8,
    ) -> Result<AddOutcome> {
        self.check_open()?;
        let mut state = self.cluster.state.lock();
        state.ops.push(format!("add {}", vbucket));
        if let Some(status) = state.fail_adds {
            return Err(KvError::Server {
                opcode: Opcode::Add,
                status,
            });
        }

        let slot = (vbucket, key.to_vec());
        if state.docs.contains_key(&slot) {
            return Ok(AddOutcome::AlreadyExists);
        }
        state.next_cas += 1;
        let cas = state.next_cas;
        state.docs.insert(
            slot,
            StoredDoc {
                value: Bytes::copy_from_slice(value),
                cas,
                flags,
                datatype,
            },
        );
        Ok(AddOutcome::Created { cas })
    }

    async fn delete(&mut self, vbucket: VBucketId, key: &[u8], cas: u64) -> Result<DeleteOutcome> {
        self.check_open()?;
        let mut state = self.cluster.state.lock();
        state.ops.push(format!("delete {}", vbucket));

        let slot = (vbucket, key.to_vec());
        if let Some(injected) = state.delete_failures.get(&slot) {
            return Err(injected.into_error(Opcode::Delete));
        }
        match state.docs.get(&slot) {
            None => Ok(DeleteOutcome::NotFound),
            Some(doc) if cas != 0 && doc.cas != cas => Ok(DeleteOutcome::CasMismatch),
            Some(_) => {
                state.docs.remove(&slot);
                Ok(DeleteOutcome::Deleted)
            }
        }
    }

    async fn xattrs(&mut self, vbucket: VBucketId, key: &[u8]) -> Result<Xattrs> {
        self.check_open()?;
        let mut state = self.cluster.state.lock();
        state.ops.push(format!("xattrs {}", vbucket));
        Ok(state
            .xattrs
            .get(&(vbucket, key.to_vec()))
            .cloned()
            .unwrap_or_default())
    }

    async fn close(&mut self) -> Result<()> {
        if !self.closed {
            self.closed = true;
            self.cluster.state.lock().closed += 1;
        }
        Ok(())
    }
}

/// Connector handing out [`MemoryNode`]s, refusing listed hosts
#[derive(Clone)]
pub struct MemoryConnector {
    pub cluster: MemoryCluster,
    pub unreachable: Vec<String>,
}

#[async_trait]
impl NodeConnector for MemoryConnector {
    type Node = MemoryNode;

    async fn connect(&self, host: &str, port: u16) -> Result<MemoryNode> {
        if self.unreachable.iter().any(|h| h == host) {
            return Err(KvError::Connection(format!(
                "connect to {}:{} refused",
                host, port
            )));
        }
        Ok(self.cluster.node())
    }
}
