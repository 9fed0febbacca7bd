//! Cluster topology
//!
//! Turns the bucket's cluster map into a fixed vbucket → node routing
//! table with one open connection per data node.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use serde::Deserialize;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use crate::error::{KvError, Result};
use crate::node::{KvNode, NodeConnector};
use crate::vbucket::{VBucketCount, VBucketId};

/// Placeholder the server uses for "the host you reached me on"
pub const HOST_PLACEHOLDER: &str = "$HOST";

/// The only partition hash keymend implements
const SUPPORTED_HASH: &str = "CRC";

/// Bucket cluster map as returned by the config request
#[derive(Debug, Clone, Deserialize)]
pub struct ClusterMap {
    #[serde(default)]
    pub rev: Option<i64>,

    #[serde(rename = "vBucketServerMap")]
    pub server_map: VBucketServerMap,
}

/// Server list and per-vbucket owner table
#[derive(Debug, Clone, Deserialize)]
pub struct VBucketServerMap {
    #[serde(rename = "hashAlgorithm", default = "default_hash")]
    pub hash_algorithm: String,

    #[serde(rename = "numReplicas", default)]
    pub num_replicas: u32,

    #[serde(rename = "serverList")]
    pub server_list: Vec<String>,

    /// Row per vbucket; column 0 is the active owner's server index
    #[serde(rename = "vBucketMap")]
    pub vbucket_map: Vec<Vec<i32>>,
}

fn default_hash() -> String {
    SUPPORTED_HASH.to_string()
}

/// One data node to connect to
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Endpoint {
    pub host: String,
    pub port: u16,
}

impl fmt::Display for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.host.contains(':') {
            write!(f, "[{}]:{}", self.host, self.port)
        } else {
            write!(f, "{}:{}", self.host, self.port)
        }
    }
}

impl Endpoint {
    /// Parse a server-list entry
    ///
    /// `$HOST` becomes `seed_host`. With `port_override` set (TLS runs)
    /// every node is dialled on that port instead of the listed one.
    pub fn parse(entry: &str, seed_host: &str, port_override: Option<u16>) -> Result<Self> {
        let bad = || KvError::ConfigInconsistency(format!("malformed server entry {:?}", entry));

        let (host, port) = if let Some(rest) = entry.strip_prefix('[') {
            let (host, tail) = rest.split_once(']').ok_or_else(bad)?;
            let port = tail.strip_prefix(':').ok_or_else(bad)?;
            (host, port)
        } else {
            entry.rsplit_once(':').ok_or_else(bad)?
        };

        let port: u16 = port.parse().map_err(|_| bad())?;
        if host.is_empty() {
            return Err(bad());
        }

        let host = if host == HOST_PLACEHOLDER {
            seed_host
        } else {
            host
        };
        Ok(Self {
            host: host.to_string(),
            port: port_override.unwrap_or(port),
        })
    }
}

/// Distinct endpoints plus, per vbucket, the index of its owner
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RoutingPlan {
    pub endpoints: Vec<Endpoint>,
    pub owners: Vec<usize>,
}

impl ClusterMap {
    /// Parse the config response body
    ///
    /// Older servers send the literal `$HOST` unescaped, which is still
    /// valid JSON, so no substitution happens before parsing.
    pub fn from_json(body: &[u8]) -> Result<Self> {
        serde_json::from_slice(body)
            .map_err(|e| KvError::ConfigInconsistency(format!("unreadable cluster config: {}", e)))
    }

    /// Number of vbuckets in the map
    pub fn num_vbuckets(&self) -> usize {
        self.server_map.vbucket_map.len()
    }

    /// Validate the map and work out which node owns each vbucket
    pub fn routing_plan(&self, seed_host: &str, port_override: Option<u16>) -> Result<RoutingPlan> {
        let map = &self.server_map;
        if !map.hash_algorithm.eq_ignore_ascii_case(SUPPORTED_HASH) {
            return Err(KvError::ConfigInconsistency(format!(
                "unsupported hash algorithm {:?}",
                map.hash_algorithm
            )));
        }
        VBucketCount::new(self.num_vbuckets())?;
        if map.server_list.is_empty() {
            return Err(KvError::ConfigInconsistency(
                "cluster config lists no servers".to_string(),
            ));
        }

        // Two entries can collapse to one endpoint once $HOST and the TLS
        // port are applied.
        let mut endpoints: Vec<Endpoint> = Vec::new();
        let mut slot_of_server = Vec::with_capacity(map.server_list.len());
        let mut seen: HashMap<Endpoint, usize> = HashMap::new();
        for entry in &map.server_list {
            let endpoint = Endpoint::parse(entry, seed_host, port_override)?;
            let slot = *seen.entry(endpoint.clone()).or_insert_with(|| {
                endpoints.push(endpoint);
                endpoints.len() - 1
            });
            slot_of_server.push(slot);
        }

        let mut owners = Vec::with_capacity(map.vbucket_map.len());
        for (vb, row) in map.vbucket_map.iter().enumerate() {
            let active = row.first().copied().unwrap_or(-1);
            let slot = usize::try_from(active)
                .ok()
                .and_then(|i| slot_of_server.get(i).copied())
                .ok_or_else(|| {
                    KvError::ConfigInconsistency(format!(
                        "vbucket {} has no active owner (index {})",
                        vb, active
                    ))
                })?;
            owners.push(slot);
        }

        Ok(RoutingPlan { endpoints, owners })
    }
}

/// A node connection shared by workers; one request at a time
pub type SharedNode<N> = Arc<Mutex<N>>;

/// Immutable vbucket → node routing table for one run
pub struct Topology<N> {
    nodes: Vec<(Endpoint, SharedNode<N>)>,
    owners: Vec<usize>,
    count: VBucketCount,
}

impl<N> fmt::Debug for Topology<N> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Topology")
            .field("nodes", &self.nodes.iter().map(|(e, _)| e).collect::<Vec<_>>())
            .field("vbuckets", &self.count.get())
            .finish()
    }
}

impl<N: KvNode> Topology<N> {
    /// Assemble a topology from already-open connections
    pub fn from_parts(nodes: Vec<(Endpoint, N)>, owners: Vec<usize>) -> Result<Self> {
        let count = VBucketCount::new(owners.len())?;
        if let Some(bad) = owners.iter().find(|&&o| o >= nodes.len()) {
            return Err(KvError::ConfigInconsistency(format!(
                "owner index {} out of range for {} nodes",
                bad,
                nodes.len()
            )));
        }
        Ok(Self {
            nodes: nodes
                .into_iter()
                .map(|(e, n)| (e, Arc::new(Mutex::new(n))))
                .collect(),
            owners,
            count,
        })
    }

    /// Number of vbuckets in the bucket
    pub fn vbucket_count(&self) -> VBucketCount {
        self.count
    }

    pub fn num_vbuckets(&self) -> u16 {
        self.count.get()
    }

    /// Owning vbucket of a raw key
    pub fn vbucket_for(&self, key: &[u8]) -> VBucketId {
        self.count.vbucket_for(key)
    }

    /// Connection to the active owner of `vbucket`
    pub fn node(&self, vbucket: VBucketId) -> Result<&SharedNode<N>> {
        self.owners
            .get(usize::from(vbucket))
            .and_then(|&slot| self.nodes.get(slot))
            .map(|(_, node)| node)
            .ok_or_else(|| {
                KvError::InvalidArgument(format!(
                    "vbucket {} out of range 0..{}",
                    vbucket,
                    self.count.get()
                ))
            })
    }

    /// Endpoint owning `vbucket`, for logging
    pub fn endpoint(&self, vbucket: VBucketId) -> Option<&Endpoint> {
        self.owners
            .get(usize::from(vbucket))
            .and_then(|&slot| self.nodes.get(slot))
            .map(|(e, _)| e)
    }

    /// Every distinct node endpoint, in server-list order
    pub fn endpoints(&self) -> impl Iterator<Item = &Endpoint> {
        self.nodes.iter().map(|(e, _)| e)
    }

    /// Close every node connection
    ///
    /// Waits for any in-flight request on a node to finish first. Errors
    /// are logged; closing never fails the caller.
    pub async fn close(&self) {
        for (endpoint, node) in &self.nodes {
            if let Err(e) = node.lock().await.close().await {
                warn!(%endpoint, error = %e, "failed to close node connection");
            }
        }
        debug!(nodes = self.nodes.len(), "topology closed");
    }
}

/// Builds a [`Topology`] from a seed node
pub struct TopologyResolver<C> {
    connector: C,
    port_override: Option<u16>,
}

impl<C: NodeConnector> TopologyResolver<C> {
    /// Creates a resolver that dials nodes on the ports the cluster map lists.
    pub fn new(connector: C) -> Self {
        Self {
            connector,
            port_override: None,
        }
    }

    /// Dial every node on the seed port (TLS clusters list plain ports)
    pub fn with_seed_port_for_all(mut self, enabled: bool, seed_port: u16) -> Self {
        self.port_override = enabled.then_some(seed_port);
        self
    }

    /// Returns the connector used for every node.
    pub fn connector(&self) -> &C {
        &self.connector
    }

    /// Connect to the seed, fetch its cluster map and open every node
    pub async fn resolve(&self, seed_host: &str, seed_port: u16) -> Result<Topology<C::Node>> {
        let mut seed = self.connector.connect(seed_host, seed_port).await?;
        let fetched = seed.cluster_config().await;
        if let Err(e) = seed.close().await {
            debug!(error = %e, "seed connection close failed");
        }
        let map = fetched?;

        let plan = map.routing_plan(seed_host, self.port_override)?;
        info!(
            rev = ?map.rev,
            vbuckets = plan.owners.len(),
            nodes = plan.endpoints.len(),
            "resolved cluster map"
        );

        let mut nodes = Vec::with_capacity(plan.endpoints.len());
        for endpoint in plan.endpoints {
            match self.connector.connect(&endpoint.host, endpoint.port).await {
                Ok(node) => nodes.push((endpoint, node)),
                Err(e) => {
                    warn!(%endpoint, error = %e, "node unreachable, closing opened connections");
                    for (_, mut opened) in nodes {
                        let _ = opened.close().await;
                    }
                    return Err(e);
                }
            }
        }

        Topology::from_parts(nodes, plan.owners)
    }
}
