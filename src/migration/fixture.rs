//! Test-document fixture
//!
//! Plants an empty JSON document under the legacy key of a plain id, in
//! every vbucket the locator may probe for it. Used to check a cluster
//! end to end before migrating real data.

use keymend_core::codec::{KeyShape, KeyVariant};
use keymend_core::protocol::DATATYPE_JSON;
use keymend_core::vbucket::VBucketId;
use keymend_core::{AddOutcome, DocumentId, KvError, KvNode, Result, Topology};
use tracing::info;

const FIXTURE_BODY: &[u8] = b"{}";

/// One planted copy
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FixtureWrite {
    pub vbucket: VBucketId,
    pub outcome: AddOutcome,
}

/// Write the legacy form of `plain_id` into each probe vbucket
///
/// Create-if-absent, so re-running reports `AlreadyExists` per vbucket.
pub async fn add_test_document<N: KvNode>(
    topology: &Topology<N>,
    shape: &KeyShape,
    plain_id: &[u8],
) -> Result<Vec<FixtureWrite>> {
    if plain_id.is_empty() {
        return Err(KvError::InvalidArgument(
            "test document id cannot be empty".to_string(),
        ));
    }

    let legacy = shape.legacy_id(plain_id);
    let legacy_id = DocumentId::from(legacy.clone());
    let key = shape.legacy_wire_key(&legacy);

    let mut vbuckets: Vec<VBucketId> = Vec::with_capacity(3);
    for variant in [
        KeyVariant::Stripped,
        KeyVariant::AsGiven,
        KeyVariant::NullPrefixed,
    ] {
        if let Some(bytes) = shape.variant(&legacy, variant) {
            let vbucket = topology.vbucket_for(&bytes);
            if !vbuckets.contains(&vbucket) {
                vbuckets.push(vbucket);
            }
        }
    }

    let mut writes = Vec::with_capacity(vbuckets.len());
    for vbucket in vbuckets {
        let node = topology.node(vbucket)?;
        let outcome = node
            .lock()
            .await
            .add(vbucket, &key, FIXTURE_BODY, 0, DATATYPE_JSON)
            .await?;
        match outcome {
            AddOutcome::Created { .. } => info!(id = %legacy_id, vbucket, "added test doc"),
            AddOutcome::AlreadyExists => info!(id = %legacy_id, vbucket, "test doc already exists"),
        }
        writes.push(FixtureWrite { vbucket, outcome });
    }
    Ok(writes)
}
