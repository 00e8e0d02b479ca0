use loro::{ExportMode, LoroDoc, ToJson};
use serde::{Deserialize, Serialize};

use crate::models::{DocKind, PersistenceError, ValidationError};

/// Root container of a text document
pub const TEXT_CONTAINER: &str = "content";
/// Root container of a canvas document, shape id -> shape
pub const CANVAS_CONTAINER: &str = "shapes";

/// What gets written to the snapshot store
#[derive(Serialize, Deserialize)]
pub struct SnapshotPackage {
    pub kind: DocKind,
    pub snapshot: Vec<u8>,
}

/// Server-side replica of a collaborative document. Operations are opaque
/// Loro update blobs; merging is left entirely to Loro.
pub struct ReplicatedDoc {
    kind: DocKind,
    doc: LoroDoc,
}

impl ReplicatedDoc {
    pub fn new(kind: DocKind) -> Self {
        let doc = LoroDoc::new();
        match kind {
            DocKind::Text => {
                let _ = doc.get_text(TEXT_CONTAINER);
            }
            DocKind::Canvas => {
                let _ = doc.get_map(CANVAS_CONTAINER);
            }
        }
        Self { kind, doc }
    }

    pub fn from_snapshot(kind: DocKind, snapshot: &[u8]) -> Result<Self, PersistenceError> {
        let replica = Self::new(kind);
        replica
            .doc
            .import(snapshot)
            .map_err(|e| PersistenceError::Encoding(format!("failed to import snapshot: {}", e)))?;
        Ok(replica)
    }

    pub fn kind(&self) -> DocKind {
        self.kind
    }

    /// Merge a remote operation. Re-applying an already merged update is a no-op.
    pub fn apply(&self, payload: &[u8]) -> Result<(), ValidationError> {
        if payload.is_empty() {
            return Err(ValidationError::new("payload", "operation payload is empty"));
        }
        self.doc
            .import(payload)
            .map(|_| ())
            .map_err(|e| ValidationError::new("payload", format!("operation rejected: {}", e)))
    }

    pub fn export_snapshot(&self) -> Result<Vec<u8>, PersistenceError> {
        self.doc
            .export(ExportMode::Snapshot)
            .map_err(|e| PersistenceError::Encoding(format!("failed to export snapshot: {}", e)))
    }

    pub fn to_package(&self) -> Result<Vec<u8>, PersistenceError> {
        let package = SnapshotPackage {
            kind: self.kind,
            snapshot: self.export_snapshot()?,
        };
        serde_cbor::to_vec(&package)
            .map_err(|e| PersistenceError::Encoding(format!("failed to serialize snapshot package: {}", e)))
    }

    /// Restore from a stored package. A package written for another kind is
    /// still imported; the document's metadata decides the kind.
    pub fn from_package(kind: DocKind, bytes: &[u8]) -> Result<Self, PersistenceError> {
        let package: SnapshotPackage = serde_cbor::from_slice(bytes)
            .map_err(|e| PersistenceError::Encoding(format!("failed to deserialize snapshot package: {}", e)))?;
        Self::from_snapshot(kind, &package.snapshot)
    }

    pub fn to_json(&self) -> serde_json::Value {
        self.doc.get_deep_value().to_json_value()
    }

    /// Plain text of a text document, empty for canvases
    pub fn text(&self) -> String {
        match self.kind {
            DocKind::Text => self.doc.get_text(TEXT_CONTAINER).to_string(),
            DocKind::Canvas => String::new(),
        }
    }
}


#[cfg(test)]
mod tests {
    use super::testing::ClientReplica;
    use super::*;

    #[test]
    fn applies_remote_text_updates() {
        let client = ClientReplica::new();
        let server = ReplicatedDoc::new(DocKind::Text);

        server.apply(&client.insert_text(0, "hello")).unwrap();
        server.apply(&client.insert_text(5, " world")).unwrap();

        assert_eq!(server.text(), "hello world");
    }

    #[test]
    fn reapplying_an_update_is_idempotent() {
        let client = ClientReplica::new();
        let server = ReplicatedDoc::new(DocKind::Text);
        let update = client.insert_text(0, "abc");

        server.apply(&update).unwrap();
        server.apply(&update).unwrap();

        assert_eq!(server.text(), "abc");
    }

    #[test]
    fn rejects_garbage_and_empty_payloads() {
        let server = ReplicatedDoc::new(DocKind::Text);
        assert_eq!(server.apply(&[]).unwrap_err().field, "payload");
        assert!(server.apply(b"definitely not a loro update").is_err());
    }

    #[test]
    fn package_restores_equivalent_state() {
        let client = ClientReplica::new();
        let server = ReplicatedDoc::new(DocKind::Canvas);
        server.apply(&client.put_shape("s1", "circle")).unwrap();

        let package = server.to_package().unwrap();
        let restored = ReplicatedDoc::from_package(DocKind::Canvas, &package).unwrap();

        assert_eq!(restored.to_json(), server.to_json());
        assert_eq!(restored.to_json()[CANVAS_CONTAINER]["s1"], "circle");
    }
}
