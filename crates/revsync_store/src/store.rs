//! The revision store contract consumed by replication.

use crate::error::StoreResult;
use revsync_protocol::{
    AttachmentRef, ChangeEntry, Checkpoint, Conflict, Properties, RevId, Resolution, Revision,
    RevsDiffRequest, RevsDiffResponse,
};
use tokio::sync::watch;

/// A document as seen through its current revision.
#[derive(Debug, Clone, PartialEq)]
pub struct Document {
    /// Document ID.
    pub doc_id: String,
    /// The winning leaf.
    pub current: Revision,
    /// Other live leaves, best first.
    pub conflicts: Vec<RevId>,
}

impl Document {
    /// Returns true if the document has more than one live leaf.
    pub fn is_conflicted(&self) -> bool {
        !self.conflicts.is_empty()
    }

    /// Returns true if the current revision is a tombstone.
    pub fn is_deleted(&self) -> bool {
        self.current.deleted
    }
}

/// Result of inserting a revision that was created elsewhere.
#[derive(Debug, Clone, PartialEq)]
pub enum InsertOutcome {
    /// The revision was already in the tree; nothing changed.
    AlreadyPresent,
    /// The revision was added without creating a second live leaf.
    Inserted(Revision),
    /// The revision was added as a new live leaf next to the local one.
    Conflicted(Conflict),
}

/// Persistent revision trees for a single database.
///
/// Implementations must be `Send + Sync`. Every operation that reads the
/// current leaf of a document and then writes based on it is atomic with
/// respect to other writers of the same document; writers of different
/// documents do not block each other.
///
/// # Sequences
///
/// Every stored revision receives a local sequence number, strictly greater
/// than any assigned before. [`changes_since`](Self::changes_since) lists
/// leaves in ascending sequence order.
pub trait RevisionStore: Send + Sync {
    /// Returns the private UUID of this database.
    fn local_uuid(&self) -> String;

    /// Returns the highest sequence assigned so far.
    fn last_sequence(&self) -> u64;

    /// Subscribes to sequence advances.
    fn subscribe(&self) -> watch::Receiver<u64>;

    /// Returns a document with its current revision.
    fn get_document(&self, doc_id: &str) -> StoreResult<Option<Document>>;

    /// Returns a revision, or `None` if it is unknown or only a stub.
    fn get_revision(&self, doc_id: &str, rev_id: &RevId) -> StoreResult<Option<Revision>>;

    /// Returns the ancestry of a revision, newest first.
    fn get_history(&self, doc_id: &str, rev_id: &RevId) -> StoreResult<Vec<RevId>>;

    /// Saves a local edit.
    ///
    /// `parent` must be the current revision (or `None` for a new document);
    /// otherwise the edit fails with [`StoreError::Conflict`](crate::StoreError::Conflict).
    /// Attachments without a `revpos` are stamped with the new generation.
    fn put_revision(
        &self,
        doc_id: &str,
        parent: Option<&RevId>,
        properties: Properties,
        deleted: bool,
        attachments: Vec<AttachmentRef>,
    ) -> StoreResult<Revision>;

    /// Inserts a revision with its existing ID (`new_edits=false`).
    ///
    /// `history` lists the ancestry newest first, starting with the revision
    /// itself. Unknown ancestors are stored as stubs. Every referenced
    /// attachment blob must already be stored.
    fn force_insert(&self, revision: Revision, history: &[RevId]) -> StoreResult<InsertOutcome>;

    /// Applies a resolution computed against `conflict`.
    ///
    /// The lower-ranked leaf is closed with a tombstone and stays in the tree
    /// as history. If the chosen body is not the higher-ranked leaf's, it is
    /// written as a new child of that leaf.
    ///
    /// Fails with [`StoreError::StaleResolution`](crate::StoreError::StaleResolution)
    /// if either leaf of the conflict is no longer a live leaf. Returns the new
    /// current revision.
    fn resolve_conflict(&self, conflict: &Conflict, resolution: &Resolution)
        -> StoreResult<Revision>;

    /// Returns the open conflict of a document, if it has one.
    fn conflict_for(&self, doc_id: &str) -> StoreResult<Option<Conflict>>;

    /// Lists documents with more than one live leaf.
    fn conflicted_documents(&self) -> StoreResult<Vec<String>>;

    /// Answers which of the given revisions are missing locally.
    fn revs_diff(&self, request: &RevsDiffRequest) -> StoreResult<RevsDiffResponse>;

    /// Lists leaf revisions stored after `since`, in sequence order.
    fn changes_since(&self, since: u64, limit: usize) -> StoreResult<Vec<ChangeEntry>>;

    /// Removes the named leaves, or closed branches together with their
    /// tombstones. Returns how many revisions were removed.
    fn purge(&self, doc_id: &str, rev_ids: &[RevId]) -> StoreResult<usize>;

    /// Stores a blob under its content digest, verifying the bytes.
    fn put_attachment(&self, digest: &str, data: Vec<u8>) -> StoreResult<()>;

    /// Returns a blob by digest.
    fn get_attachment(&self, digest: &str) -> StoreResult<Option<Vec<u8>>>;

    /// Returns true if a blob is stored.
    fn has_attachment(&self, digest: &str) -> bool;

    /// Reads the checkpoint of a replication.
    fn get_checkpoint(&self, peer_key: &str) -> StoreResult<Option<Checkpoint>>;

    /// Writes the checkpoint of a replication.
    fn set_checkpoint(&self, peer_key: &str, checkpoint: &Checkpoint) -> StoreResult<()>;

    /// Deletes the checkpoint of a replication.
    fn reset_checkpoint(&self, peer_key: &str) -> StoreResult<()>;
}
