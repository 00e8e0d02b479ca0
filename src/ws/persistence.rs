use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};
use uuid::Uuid;

use super::room::Checkpoint;
use crate::db::{DocumentStore, SnapshotRow, StreamStore};
use crate::models::lorodoc::ReplicatedDoc;
use crate::models::{DocKind, PersistenceError};

/// Exponential backoff: `base`, `2 * base`, `4 * base`, ...
#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub base_delay: Duration,
}

impl RetryPolicy {
    pub fn new(max_attempts: u32, base_delay: Duration) -> Self {
        Self {
            max_attempts: max_attempts.max(1),
            base_delay,
        }
    }

    /// Delay before retry number `attempt` (1-based)
    pub fn delay(&self, attempt: u32) -> Duration {
        let exp = attempt.saturating_sub(1).min(16);
        self.base_delay.saturating_mul(1u32 << exp)
    }
}

pub struct LoadedDoc {
    pub doc: ReplicatedDoc,
    /// Highest log sequence number folded into `doc`
    pub last_seq: i64,
    /// Revision of the stored snapshot; the room counts on from here
    pub revision: u64,
}

/// Moves replicated state between rooms and storage.
pub struct PersistenceBridge {
    streams: Arc<dyn StreamStore>,
    documents: Arc<dyn DocumentStore>,
}

impl PersistenceBridge {
    pub fn new(streams: Arc<dyn StreamStore>, documents: Arc<dyn DocumentStore>) -> Self {
        Self { streams, documents }
    }

    /// Latest snapshot plus every logged operation after it
    pub async fn load(&self, doc_id: Uuid, kind: DocKind) -> Result<LoadedDoc, PersistenceError> {
        let snapshot = self.streams.load_snapshot(doc_id).await?;
        let (doc, snapshot_seq, revision) = match snapshot {
            Some(row) => (
                ReplicatedDoc::from_package(kind, &row.content)?,
                row.upto_seq,
                row.revision.max(0) as u64,
            ),
            None => (ReplicatedDoc::new(kind), 0, 0),
        };

        let updates = self.streams.updates_since(doc_id, snapshot_seq).await?;
        let mut last_seq = snapshot_seq;
        for update in &updates {
            // A log entry the document cannot take is skipped, not fatal
            if let Err(e) = doc.apply(&update.payload) {
                warn!("Skipping log entry {} of document {}: {}", update.seq, doc_id, e);
            }
            last_seq = last_seq.max(update.seq);
        }

        info!(
            "Loaded document {} (snapshot up to {}, {} logged operation(s))",
            doc_id,
            snapshot_seq,
            updates.len()
        );
        Ok(LoadedDoc { doc, last_seq, revision })
    }

    pub async fn load_with_retry(
        &self,
        doc_id: Uuid,
        kind: DocKind,
        policy: &RetryPolicy,
    ) -> Result<LoadedDoc, PersistenceError> {
        let mut attempt = 1;
        loop {
            match self.load(doc_id, kind).await {
                Ok(loaded) => return Ok(loaded),
                Err(e) if attempt < policy.max_attempts => {
                    let delay = policy.delay(attempt);
                    warn!("Load of document {} failed (attempt {}), retrying in {:?}: {}", doc_id, attempt, delay, e);
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
                Err(e) => return Err(e),
            }
        }
    }

    pub async fn append(&self, doc_id: Uuid, payload: &[u8]) -> Result<i64, PersistenceError> {
        self.streams.append_update(doc_id, payload).await
    }

    pub async fn flush(&self, doc_id: Uuid, checkpoint: &Checkpoint) -> Result<(), PersistenceError> {
        let snapshot = SnapshotRow {
            content: checkpoint.package.clone(),
            upto_seq: checkpoint.upto_seq,
            revision: checkpoint.revision as i64,
        };
        if !self.streams.save_snapshot(doc_id, &snapshot).await? {
            warn!(
                "Flush of document {} at revision {} superseded by a newer stored snapshot",
                doc_id, checkpoint.revision
            );
            return Ok(());
        }
        debug!(
            "Flushed document {} at revision {} ({} bytes, log up to {})",
            doc_id,
            checkpoint.revision,
            checkpoint.package.len(),
            checkpoint.upto_seq
        );
        // Metadata timestamp is advisory
        if let Err(e) = self.documents.touch_document(doc_id).await {
            warn!("Failed to touch document {} after flush: {}", doc_id, e);
        }
        Ok(())
    }
}
