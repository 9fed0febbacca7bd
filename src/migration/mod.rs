//! Legacy key migration
//!
//! Moves documents stored under legacy prefixed keys to their canonical
//! keys. For each indexed id the engine locates every physical copy,
//! picks the most recent one by CAS, creates the canonical document with
//! a create-if-absent write, then removes legacy copies with CAS-guarded
//! deletes.
//!
//! # Example
//!
//! ```ignore
//! use keymend::migration::{MigrationEngine, MigrationOptions};
//!
//! let options = MigrationOptions::from_config(&config)?;
//! let engine = MigrationEngine::new(topology, options);
//! let summary = engine.run(ids).await?;
//! println!("{}", summary);
//! ```

pub mod counters;
pub mod engine;
pub mod fixture;
pub mod locator;

pub use counters::{RunCounters, RunSummary};
pub use engine::{DeleteStep, MigrationEngine, MigrationOutcome, RestoreStep};
pub use fixture::{add_test_document, FixtureWrite};
pub use locator::CandidateLocator;

use keymend_core::codec::{KeyShape, KeyVariant};
use keymend_core::config::MAX_WORKERS;
use keymend_core::{Config, KvError};

/// Migration error
#[derive(Debug, thiserror::Error)]
pub enum MigrationError {
    /// The document index could not be read
    #[error("cluster query error: {0}")]
    ClusterQuery(String),

    /// Infrastructure failure from the KV layer
    #[error(transparent)]
    Kv(#[from] KvError),

    /// The run was cancelled before it finished
    #[error("migration interrupted")]
    Interrupted,
}

/// Result type for migration operations
pub type Result<T> = std::result::Result<T, MigrationError>;

/// Which vbuckets are probed for each indexed id
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProbeStrategy {
    /// The vbuckets the listed key shapes hash to, in order
    Variants(Vec<KeyVariant>),
    /// Every vbucket of the bucket
    AllVBuckets,
}

impl Default for ProbeStrategy {
    fn default() -> Self {
        ProbeStrategy::Variants(vec![KeyVariant::AsGiven, KeyVariant::Stripped])
    }
}

/// Per-run migration settings
#[derive(Debug, Clone)]
pub struct MigrationOptions {
    pub shape: KeyShape,
    pub probe: ProbeStrategy,
    /// Create the canonical copy of each document
    pub restore: bool,
    /// Delete every legacy copy found
    pub delete: bool,
    /// Log candidate xattrs
    pub print_xattrs: bool,
    /// Documents in flight at once
    pub workers: usize,
}

impl MigrationOptions {
    /// Options with both mutations off
    pub fn new(shape: KeyShape) -> Self {
        Self {
            shape,
            probe: ProbeStrategy::default(),
            restore: false,
            delete: false,
            print_xattrs: false,
            workers: 1,
        }
    }

    /// Derive options from a validated config
    pub fn from_config(config: &Config) -> Result<Self> {
        let settings = &config.migration;
        let probe = if settings.search_all_vbuckets {
            ProbeStrategy::AllVBuckets
        } else {
            ProbeStrategy::Variants(settings.probe_variants.clone())
        };
        Ok(Self {
            shape: config.key_shape()?,
            probe,
            restore: settings.restore,
            delete: settings.delete,
            print_xattrs: settings.print_xattrs,
            workers: settings.workers.clamp(1, MAX_WORKERS),
        })
    }

    pub fn with_restore(mut self, restore: bool) -> Self {
        self.restore = restore;
        self
    }

    pub fn with_delete(mut self, delete: bool) -> Self {
        self.delete = delete;
        self
    }

    pub fn with_probe(mut self, probe: ProbeStrategy) -> Self {
        self.probe = probe;
        self
    }

    pub fn with_workers(mut self, workers: usize) -> Self {
        self.workers = workers.clamp(1, MAX_WORKERS);
        self
    }
}
