//! Candidate locator
//!
//! The partition hash depends on the exact key bytes, so a legacy
//! document may sit in the vbucket of any key shape it was ever hashed
//! under. The locator probes each of those vbuckets with the legacy wire
//! key and collects every copy it finds.

use keymend_core::codec::KeyShape;
use keymend_core::vbucket::{VBucketCount, VBucketId};
use keymend_core::{DocumentId, DocumentRecord, GetOutcome, KvNode, Result, Topology};
use tracing::debug;

use super::ProbeStrategy;

/// Vbuckets to probe for `id`, without repeats, in probe order
pub fn probe_targets(
    shape: &KeyShape,
    probe: &ProbeStrategy,
    count: VBucketCount,
    id: &[u8],
) -> Vec<VBucketId> {
    match probe {
        ProbeStrategy::AllVBuckets => count.iter().collect(),
        ProbeStrategy::Variants(variants) => {
            let mut targets = Vec::with_capacity(variants.len());
            for variant in variants {
                let Some(bytes) = shape.variant(id, *variant) else {
                    continue;
                };
                let vbucket = count.vbucket_for(&bytes);
                if !targets.contains(&vbucket) {
                    targets.push(vbucket);
                }
            }
            targets
        }
    }
}

/// Finds every physical copy of a legacy document
pub struct CandidateLocator<'a, N> {
    topology: &'a Topology<N>,
    shape: KeyShape,
    probe: &'a ProbeStrategy,
}

impl<'a, N: KvNode> CandidateLocator<'a, N> {
    pub fn new(topology: &'a Topology<N>, shape: KeyShape, probe: &'a ProbeStrategy) -> Self {
        Self {
            topology,
            shape,
            probe,
        }
    }

    /// All copies of `id`, most recent (highest CAS) first
    ///
    /// A miss on one probe is normal. Any other error aborts the lookup:
    /// acting on a partial view could restore a stale copy.
    pub async fn locate(&self, id: &DocumentId) -> Result<Vec<DocumentRecord>> {
        let key = self.shape.legacy_wire_key(id.as_bytes());
        let targets = probe_targets(
            &self.shape,
            self.probe,
            self.topology.vbucket_count(),
            id.as_bytes(),
        );

        let mut records = Vec::new();
        for vbucket in targets {
            let node = self.topology.node(vbucket)?;
            let outcome = node.lock().await.get(vbucket, &key).await?;
            match outcome {
                GetOutcome::Found {
                    value,
                    cas,
                    flags,
                    datatype,
                } => records.push(DocumentRecord {
                    value,
                    cas,
                    flags,
                    datatype,
                    vbucket,
                }),
                GetOutcome::NotFound => {
                    debug!(%id, vbucket, "no copy in vbucket");
                }
            }
        }

        records.sort_by(|a, b| b.cas.cmp(&a.cas));
        Ok(records)
    }
}
