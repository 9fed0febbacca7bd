//! # Keymend Core
//!
//! Byte- and network-level building blocks for keymend: the collection
//! prefix key codec, vbucket hashing, the binary KV protocol, data-node
//! connections and topology resolution.

// ── Keys and partitioning ────────────────────────────────────────────────────

pub mod codec;
pub mod document;
pub mod vbucket;

// ── Wire and connections ─────────────────────────────────────────────────────

pub mod connection;
pub mod node;
pub mod protocol;
pub mod tls;
pub mod topology;

// ── Ambient ──────────────────────────────────────────────────────────────────

pub mod config;
pub mod error;

// ── Public re-exports ────────────────────────────────────────────────────────

pub use codec::{CollectionId, KeyShape, KeyVariant, LegacyConvention};
pub use config::Config;
pub use connection::{ConnectionConfig, KvConnector, NodeConnection, TlsSettings};
pub use document::{DocumentId, DocumentRecord};
pub use error::{KvError, Result};
pub use node::{AddOutcome, DeleteOutcome, GetOutcome, KvNode, NodeConnector, Xattrs};
pub use topology::{ClusterMap, Endpoint, Topology, TopologyResolver};
pub use vbucket::{VBucketCount, VBucketId};
