//! State hashing for cheap replica comparison.

use serde::Serialize;
use sha2::{Digest, Sha256};

use crate::model::QueueItem;

/// Number of digest bytes kept in the rendered hash.
const HASH_BYTES: usize = 8;

#[derive(Serialize)]
struct HashInput<'a> {
    queue: &'a [QueueItem],
    current_item: Option<&'a QueueItem>,
}

/// Digest of `(queue, current_item)` as lowercase hex.
///
/// Serialization of the model types cannot fail; the digest covers every
/// field, so replicas with equal hashes hold equal content.
#[must_use]
pub fn state_hash(queue: &[QueueItem], current_item: Option<&QueueItem>) -> String {
    let mut hasher = Sha256::new();
    let input = HashInput {
        queue,
        current_item,
    };
    if let Err(e) = serde_json::to_writer(&mut hasher, &input) {
        tracing::error!("Failed to serialize queue state for hashing: {}", e);
    }
    let digest = hasher.finalize();
    hex::encode(&digest[..HASH_BYTES])
}
