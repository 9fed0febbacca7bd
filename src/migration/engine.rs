//! Migration engine
//!
//! Drives each indexed id through locate → restore → delete. Restore of
//! the most recent copy always completes before any copy of the same id
//! is deleted. Documents are processed by a bounded pool of tasks;
//! requests to one node are serialized by that node's mutex.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use keymend_core::protocol::DATATYPE_JSON;
use keymend_core::{
    AddOutcome, DeleteOutcome, DocumentId, DocumentRecord, KvError, KvNode, Topology,
};
use tokio::task::{JoinError, JoinSet};
use tracing::{debug, info, warn};

use super::counters::{RunCounters, RunSummary};
use super::locator::CandidateLocator;
use super::{MigrationError, MigrationOptions, Result};

/// What happened to one document
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MigrationOutcome {
    /// The id does not carry the legacy prefix
    Skipped,
    /// No probed vbucket holds a copy
    NotFound,
    /// Locating the copies failed; nothing was changed
    Failed,
    /// The run was aborted before this document was changed
    Aborted,
    Located {
        candidates: usize,
        /// `None` when restore was not requested
        restore: Option<RestoreStep>,
        /// One entry per candidate when delete was requested
        deletes: Vec<DeleteStep>,
    },
}

/// Result of creating the canonical copy
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RestoreStep {
    Restored,
    /// An earlier run (or another writer) already created it
    AlreadyExists,
    Failed,
}

/// Result of deleting one legacy copy
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeleteStep {
    Deleted,
    /// Rewritten since it was read; left in place
    Retained,
    NotFound,
    Failed,
    /// Not attempted because the restore failed or the run was aborted
    Skipped,
}

/// Per-run migration driver
pub struct MigrationEngine<N> {
    topology: Arc<Topology<N>>,
    options: Arc<MigrationOptions>,
    counters: Arc<RunCounters>,
    /// Set once a document hit an infrastructure error
    aborted: Arc<AtomicBool>,
}

impl<N> Clone for MigrationEngine<N> {
    fn clone(&self) -> Self {
        Self {
            topology: Arc::clone(&self.topology),
            options: Arc::clone(&self.options),
            counters: Arc::clone(&self.counters),
            aborted: Arc::clone(&self.aborted),
        }
    }
}

impl<N: KvNode> MigrationEngine<N> {
    pub fn new(topology: Arc<Topology<N>>, options: MigrationOptions) -> Self {
        Self {
            topology,
            options: Arc::new(options),
            counters: Arc::new(RunCounters::new()),
            aborted: Arc::new(AtomicBool::new(false)),
        }
    }

    pub fn topology(&self) -> &Arc<Topology<N>> {
        &self.topology
    }

    pub fn options(&self) -> &MigrationOptions {
        &self.options
    }

    /// Counters so far; valid after an abort too
    pub fn summary(&self) -> RunSummary {
        self.counters.summary()
    }

    /// Migrate every id, `workers` at a time
    ///
    /// Returns on the first infrastructure error. No document is mutated
    /// once that error is seen; documents still in flight stop before
    /// their next write. Per-document failures only show up in the summary.
    pub async fn run(&self, ids: Vec<DocumentId>) -> Result<RunSummary> {
        info!(
            documents = ids.len(),
            workers = self.options.workers,
            restore = self.options.restore,
            delete = self.options.delete,
            "starting migration"
        );

        let workers = self.options.workers.max(1);
        let mut tasks: JoinSet<keymend_core::Result<MigrationOutcome>> = JoinSet::new();

        for id in ids {
            while tasks.len() >= workers {
                if let Some(joined) = tasks.join_next().await {
                    Self::check_task(joined)?;
                }
            }

            let engine = self.clone();
            tasks.spawn(async move {
                let outcome = engine.migrate_one(&id).await;
                if outcome.is_err() {
                    engine.aborted.store(true, Ordering::SeqCst);
                }
                outcome
            });
        }

        while let Some(joined) = tasks.join_next().await {
            Self::check_task(joined)?;
        }

        let summary = self.counters.summary();
        info!(
            added = summary.added,
            already_exist = summary.already_exist,
            not_found = summary.not_found,
            deleted = summary.deleted,
            "migration finished"
        );
        Ok(summary)
    }

    fn is_aborted(&self) -> bool {
        self.aborted.load(Ordering::SeqCst)
    }

    fn check_task(
        joined: std::result::Result<keymend_core::Result<MigrationOutcome>, JoinError>,
    ) -> Result<()> {
        match joined {
            Ok(Ok(_)) => Ok(()),
            Ok(Err(e)) => Err(MigrationError::Kv(e)),
            Err(e) if e.is_panic() => std::panic::resume_unwind(e.into_panic()),
            Err(_) => Err(MigrationError::Interrupted),
        }
    }

    /// Migrate one document
    ///
    /// Only errors that invalidate the whole run are returned; everything
    /// else is folded into the outcome and the counters.
    pub async fn migrate_one(&self, id: &DocumentId) -> keymend_core::Result<MigrationOutcome> {
        let shape = self.options.shape;
        if !shape.is_legacy_id(id.as_bytes()) {
            warn!(%id, convention = %shape.convention(), "id lacks the legacy prefix, skipping");
            self.counters.record_skipped();
            return Ok(MigrationOutcome::Skipped);
        }

        let locator = CandidateLocator::new(&self.topology, shape, &self.options.probe);
        let records = match locator.locate(id).await {
            Ok(records) => records,
            Err(e) if e.is_fatal() => return Err(e),
            Err(e) => {
                warn!(%id, error = %e, "lookup failed");
                self.counters.record_failed(id);
                return Ok(MigrationOutcome::Failed);
            }
        };

        if records.is_empty() {
            info!(%id, "not found");
            self.counters.record_not_found();
            return Ok(MigrationOutcome::NotFound);
        }

        for record in &records {
            info!(
                %id,
                cas = record.cas,
                flags = record.flags,
                vbucket = record.vbucket,
                "got candidate"
            );
            if self.options.print_xattrs {
                self.log_xattrs(id, record).await;
            }
        }

        if self.is_aborted() {
            debug!(%id, "run aborted, leaving document untouched");
            return Ok(MigrationOutcome::Aborted);
        }

        let restore = if self.options.restore {
            Some(self.restore(id, &records[0]).await?)
        } else {
            None
        };

        let mut deletes = Vec::new();
        if self.options.delete {
            if restore == Some(RestoreStep::Failed) {
                warn!(%id, "restore failed, keeping every legacy copy");
                deletes = vec![DeleteStep::Skipped; records.len()];
            } else {
                for record in &records {
                    if self.is_aborted() {
                        debug!(%id, vbucket = record.vbucket, "run aborted, keeping legacy copy");
                        deletes.push(DeleteStep::Skipped);
                        continue;
                    }
                    deletes.push(self.delete(id, record).await?);
                }
            }
        }

        Ok(MigrationOutcome::Located {
            candidates: records.len(),
            restore,
            deletes,
        })
    }

    /// Create the canonical document from the most recent copy
    async fn restore(
        &self,
        id: &DocumentId,
        record: &DocumentRecord,
    ) -> keymend_core::Result<RestoreStep> {
        let shape = self.options.shape;
        let Some(canonical) = shape.canonical_id(id.as_bytes()) else {
            self.counters.record_failed(id);
            return Ok(RestoreStep::Failed);
        };
        let canonical_id = DocumentId::from(canonical.clone());
        let key = shape.canonical_wire_key(&canonical);
        let vbucket = self.topology.vbucket_for(&canonical);
        let node = self.topology.node(vbucket)?;

        let outcome = node
            .lock()
            .await
            .add(
                vbucket,
                &key,
                &record.value,
                record.flags,
                record.datatype & DATATYPE_JSON,
            )
            .await;

        match outcome {
            Ok(AddOutcome::Created { cas }) => {
                info!(id = %canonical_id, collection = %shape.collection(), vbucket, cas, "added");
                self.counters.record_added();
                Ok(RestoreStep::Restored)
            }
            Ok(AddOutcome::AlreadyExists) => {
                info!(id = %canonical_id, collection = %shape.collection(), "already exists");
                self.counters.record_already_exists();
                Ok(RestoreStep::AlreadyExists)
            }
            Err(e) if e.is_fatal() => Err(e),
            Err(e) => {
                warn!(id = %canonical_id, error = %e, "restore failed");
                self.counters.record_failed(id);
                Ok(RestoreStep::Failed)
            }
        }
    }

    /// Delete one legacy copy, guarded by the CAS it was read with
    async fn delete(
        &self,
        id: &DocumentId,
        record: &DocumentRecord,
    ) -> keymend_core::Result<DeleteStep> {
        let key = self.options.shape.legacy_wire_key(id.as_bytes());
        let vbucket = record.vbucket;
        let node = self.topology.node(vbucket)?;

        let outcome = node.lock().await.delete(vbucket, &key, record.cas).await;
        match outcome {
            Ok(DeleteOutcome::Deleted) => {
                info!(%id, vbucket, "deleted");
                self.counters.record_deleted();
                Ok(DeleteStep::Deleted)
            }
            Ok(DeleteOutcome::CasMismatch) => {
                warn!(%id, vbucket, cas = record.cas, "changed since read, not deleted");
                self.counters.record_delete_failed();
                Ok(DeleteStep::Retained)
            }
            Ok(DeleteOutcome::NotFound) => {
                warn!(%id, vbucket, "gone before delete");
                self.counters.record_delete_failed();
                Ok(DeleteStep::NotFound)
            }
            Err(e) if e.is_fatal() => Err(e),
            Err(e) => {
                warn!(%id, vbucket, error = %e, "delete failed");
                self.counters.record_delete_failed();
                self.counters.record_failed(id);
                Ok(DeleteStep::Failed)
            }
        }
    }

    async fn log_xattrs(&self, id: &DocumentId, record: &DocumentRecord) {
        let key = self.options.shape.legacy_wire_key(id.as_bytes());
        let node = match self.topology.node(record.vbucket) {
            Ok(node) => node,
            Err(e) => {
                debug!(%id, error = %e, "no node for xattr lookup");
                return;
            }
        };

        let fetched = node.lock().await.xattrs(record.vbucket, &key).await;
        match fetched.map(|x| serde_json::to_string_pretty(&x)) {
            Ok(Ok(pretty)) => info!(%id, vbucket = record.vbucket, "XATTRS: {}", pretty),
            Ok(Err(e)) => warn!(%id, error = %e, "cannot render xattrs"),
            Err(e) => warn!(%id, vbucket = record.vbucket, error = %e, "xattr lookup failed"),
        }
    }
}

// Mutation paths need a cluster; they are covered in tests/migration_engine.rs.
#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_check_task_maps_errors() {
        type Engine = MigrationEngine<StaticNode>;

        assert!(Engine::check_task(Ok(Ok(MigrationOutcome::NotFound))).is_ok());
        assert!(matches!(
            Engine::check_task(Ok(Err(KvError::Connection("reset".into())))),
            Err(MigrationError::Kv(KvError::Connection(_)))
        ));
    }

    fn engine() -> MigrationEngine<StaticNode> {
        use keymend_core::codec::{CollectionId, KeyShape, LegacyConvention};

        let shape = KeyShape::new(
            LegacyConvention::CollectionPrefix,
            CollectionId::new(3).unwrap(),
        )
        .unwrap();
        let nodes = vec![(
            keymend_core::Endpoint {
                host: "kv1".to_string(),
                port: 11210,
            },
            StaticNode,
        )];
        let topology = Topology::from_parts(nodes, vec![0; 64]).unwrap();
        let options = MigrationOptions::new(shape)
            .with_restore(true)
            .with_delete(true);
        MigrationEngine::new(Arc::new(topology), options)
    }

    #[tokio::test]
    async fn test_aborted_run_leaves_document_untouched() {
        let engine = engine();
        let id = DocumentId::from("\u{3}foo");

        let outcome = engine.migrate_one(&id).await.unwrap();
        assert!(matches!(outcome, MigrationOutcome::Located { .. }));

        engine.aborted.store(true, Ordering::SeqCst);
        let outcome = engine.migrate_one(&id).await.unwrap();
        assert_eq!(outcome, MigrationOutcome::Aborted);
        assert_eq!(engine.summary().already_exist, 1);
        assert_eq!(engine.summary().deleted, 0);
    }

    /// Every key exists, so adds report a conflict
    struct StaticNode;

    #[async_trait::async_trait]
    impl KvNode for StaticNode {
        async fn cluster_config(&mut self) -> keymend_core::Result<keymend_core::ClusterMap> {
            Err(KvError::Connection("unused".into()))
        }
        async fn get(
            &mut self,
            _: u16,
            _: &[u8],
        ) -> keymend_core::Result<keymend_core::GetOutcome> {
            Ok(keymend_core::GetOutcome::Found {
                value: bytes::Bytes::from_static(b"{}"),
                cas: 7,
                flags: 0,
                datatype: DATATYPE_JSON,
            })
        }
        async fn add(
            &mut self,
            _: u16,
            _: &[u8],
            _: &[u8],
            _: u32,
            _: u8,
        ) -> keymend_core::Result<AddOutcome> {
            Ok(AddOutcome::AlreadyExists)
        }
        async fn delete(&mut self, _: u16, _: &[u8], _: u64) -> keymend_core::Result<DeleteOutcome> {
            Ok(DeleteOutcome::NotFound)
        }
        async fn xattrs(&mut self, _: u16, _: &[u8]) -> keymend_core::Result<keymend_core::Xattrs> {
            Ok(Default::default())
        }
        async fn close(&mut self) -> keymend_core::Result<()> {
            Ok(())
        }
    }
}
