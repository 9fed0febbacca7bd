//! # Keymend
//!
//! Repairs documents written under legacy collection-id prefixed keys in
//! a vbucket-partitioned key-value store. Each legacy document is found
//! across every vbucket it may have been hashed to, recreated under its
//! canonical key with a create-if-absent write, and optionally removed
//! from its legacy key with a CAS-guarded delete.
//!
//! ## Crate Organization
//!
//! | Crate | Description |
//! |-------|-------------|
//! | [`keymend-core`] | Key codec, vbucket hash, KV protocol, connections, topology |
//! | `keymend` | Migration engine, candidate locator, document index, CLI |

// ── Re-exports from keymend-core ─────────────────────────────────────────────

pub use keymend_core::codec;
pub use keymend_core::config;
pub use keymend_core::connection;
pub use keymend_core::document;
pub use keymend_core::error;
pub use keymend_core::node;
pub use keymend_core::protocol;
pub use keymend_core::tls;
pub use keymend_core::topology;
pub use keymend_core::vbucket;

// ── Modules ──────────────────────────────────────────────────────────────────

pub mod index;
pub mod migration;
