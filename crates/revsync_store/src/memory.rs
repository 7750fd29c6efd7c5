//! In-memory revision store.

use crate::error::{StoreError, StoreResult};
use crate::store::{Document, InsertOutcome, RevisionStore};
use crate::tree::{RevisionNode, RevisionTree};
use parking_lot::{Mutex, RwLock};
use revsync_protocol::{
    attachment_digest, AttachmentRef, ChangeEntry, Checkpoint, Conflict, Properties, RevId,
    Resolution, Revision, RevsDiffEntry, RevsDiffRequest, RevsDiffResponse,
};
use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::watch;
use tracing::{debug, trace, warn};

#[derive(Debug)]
struct LogEntry {
    doc_id: String,
    rev_id: RevId,
    deleted: bool,
}

/// Sequence index holding one entry per stored leaf.
#[derive(Debug, Default)]
struct SequenceLog {
    last: u64,
    entries: BTreeMap<u64, LogEntry>,
    by_rev: HashMap<(String, RevId), u64>,
}

impl SequenceLog {
    fn append(&mut self, doc_id: &str, node: &RevisionNode) -> u64 {
        if let Some(parent) = &node.parent {
            self.remove(doc_id, parent);
        }
        self.last += 1;
        self.entries.insert(
            self.last,
            LogEntry {
                doc_id: doc_id.to_string(),
                rev_id: node.rev_id.clone(),
                deleted: node.deleted,
            },
        );
        self.by_rev
            .insert((doc_id.to_string(), node.rev_id.clone()), self.last);
        self.last
    }

    fn remove(&mut self, doc_id: &str, rev_id: &RevId) {
        if let Some(seq) = self.by_rev.remove(&(doc_id.to_string(), rev_id.clone())) {
            self.entries.remove(&seq);
        }
    }
}

/// A revision store kept entirely in memory.
///
/// Suitable for tests, for ephemeral databases, and as the backing store of
/// the in-process test remote.
///
/// # Locking
///
/// Each document has its own mutex. The document map is only locked long
/// enough to look up or create an entry, and the sequence log is only locked
/// while a document lock is held, always in that order.
///
/// # Example
///
/// ```rust
/// use revsync_store::{MemoryRevisionStore, RevisionStore};
///
/// let store = MemoryRevisionStore::new();
/// let rev = store
///     .put_revision("a", None, Default::default(), false, Vec::new())
///     .unwrap();
/// assert_eq!(rev.generation(), 1);
/// assert_eq!(store.last_sequence(), 1);
/// ```
#[derive(Debug)]
pub struct MemoryRevisionStore {
    uuid: String,
    docs: RwLock<HashMap<String, Arc<Mutex<RevisionTree>>>>,
    log: Mutex<SequenceLog>,
    blobs: RwLock<HashMap<String, Vec<u8>>>,
    checkpoints: RwLock<HashMap<String, Checkpoint>>,
    sequence_tx: watch::Sender<u64>,
    fail_writes: AtomicBool,
}

impl Default for MemoryRevisionStore {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryRevisionStore {
    /// Creates an empty store with a random UUID.
    pub fn new() -> Self {
        Self::with_uuid(uuid::Uuid::new_v4().simple().to_string())
    }

    /// Creates an empty store with the given UUID.
    pub fn with_uuid(uuid: impl Into<String>) -> Self {
        let (sequence_tx, _) = watch::channel(0);
        Self {
            uuid: uuid.into(),
            docs: RwLock::new(HashMap::new()),
            log: Mutex::new(SequenceLog::default()),
            blobs: RwLock::new(HashMap::new()),
            checkpoints: RwLock::new(HashMap::new()),
            sequence_tx,
            fail_writes: AtomicBool::new(false),
        }
    }

    /// Makes every subsequent write fail with [`StoreError::Full`].
    ///
    /// Useful for testing storage-failure handling.
    pub fn set_fail_writes(&self, fail: bool) {
        self.fail_writes.store(fail, Ordering::SeqCst);
    }

    /// Returns a snapshot of a document's revision tree.
    pub fn tree(&self, doc_id: &str) -> Option<RevisionTree> {
        self.document(doc_id)
            .map(|doc| doc.lock().clone())
            .filter(|tree| !tree.is_empty())
    }

    /// Returns the number of documents.
    pub fn document_count(&self) -> usize {
        self.docs
            .read()
            .values()
            .filter(|doc| !doc.lock().is_empty())
            .count()
    }

    /// Returns the IDs of all documents, sorted.
    pub fn document_ids(&self) -> Vec<String> {
        let docs: Vec<(String, Arc<Mutex<RevisionTree>>)> = self
            .docs
            .read()
            .iter()
            .map(|(id, doc)| (id.clone(), Arc::clone(doc)))
            .collect();
        let mut ids: Vec<String> = docs
            .into_iter()
            .filter(|(_, doc)| !doc.lock().is_empty())
            .map(|(id, _)| id)
            .collect();
        ids.sort();
        ids
    }

    fn document(&self, doc_id: &str) -> Option<Arc<Mutex<RevisionTree>>> {
        self.docs.read().get(doc_id).cloned()
    }

    fn document_or_create(&self, doc_id: &str) -> Arc<Mutex<RevisionTree>> {
        if let Some(doc) = self.document(doc_id) {
            return doc;
        }
        Arc::clone(self.docs.write().entry(doc_id.to_string()).or_default())
    }

    fn check_writable(&self) -> StoreResult<()> {
        if self.fail_writes.load(Ordering::SeqCst) {
            return Err(StoreError::Full);
        }
        Ok(())
    }

    fn check_blobs(&self, attachments: &[AttachmentRef]) -> StoreResult<()> {
        let blobs = self.blobs.read();
        match attachments.iter().find(|a| !blobs.contains_key(&a.digest)) {
            Some(missing) => Err(StoreError::BlobMissing {
                digest: missing.digest.clone(),
            }),
            None => Ok(()),
        }
    }

    /// Assigns a sequence and appends the node. Caller holds the document lock.
    fn append(&self, doc_id: &str, tree: &mut RevisionTree, mut node: RevisionNode) -> u64 {
        let seq = self.log.lock().append(doc_id, &node);
        node.sequence = seq;
        tree.insert(node);
        seq
    }

    fn append_with_history(
        &self,
        doc_id: &str,
        tree: &mut RevisionTree,
        mut node: RevisionNode,
        history: &[RevId],
    ) -> (u64, usize) {
        node.parent = history.get(1).cloned();
        let seq = self.log.lock().append(doc_id, &node);
        node.sequence = seq;
        let stubs = tree.insert_with_history(node, history);
        (seq, stubs)
    }

    fn publish(&self, seq: u64) {
        self.sequence_tx.send_if_modified(|current| {
            if seq > *current {
                *current = seq;
                true
            } else {
                false
            }
        });
    }
}

fn tombstone(parent: &RevId) -> RevisionNode {
    let empty = Properties::new();
    RevisionNode {
        rev_id: RevId::derive(Some(parent), true, &empty),
        parent: Some(parent.clone()),
        deleted: true,
        sequence: 0,
        body: Some(empty),
        attachments: Vec::new(),
    }
}

/// A live child of `parent` carrying `properties`.
fn successor(
    parent: &Revision,
    properties: &Properties,
    attachments: &[AttachmentRef],
) -> RevisionNode {
    RevisionNode {
        rev_id: RevId::derive(Some(&parent.rev_id), false, properties),
        parent: Some(parent.rev_id.clone()),
        deleted: false,
        sequence: 0,
        body: Some(properties.clone()),
        attachments: attachments.to_vec(),
    }
}

fn is_live_leaf(tree: &RevisionTree, rev_id: &RevId) -> bool {
    tree.is_leaf(rev_id) && tree.get(rev_id).is_some_and(|n| !n.deleted && !n.is_stub())
}

/// Normalizes the history of a forced insert, newest first.
fn effective_history(revision: &Revision, history: &[RevId]) -> StoreResult<Vec<RevId>> {
    let invalid = |reason: String| StoreError::InvalidHistory {
        doc_id: revision.doc_id.clone(),
        reason,
    };
    let mut history = if history.is_empty() {
        vec![revision.rev_id.clone()]
    } else {
        history.to_vec()
    };
    if history[0] != revision.rev_id {
        return Err(invalid(format!("history starts with {}", history[0])));
    }
    match (&revision.parent, history.get(1)) {
        (Some(parent), None) => history.push(parent.clone()),
        (Some(parent), Some(listed)) if parent != listed => {
            return Err(invalid(format!("parent {parent} but history lists {listed}")));
        }
        _ => {}
    }
    for pair in history.windows(2) {
        if pair[1].generation() + 1 != pair[0].generation() {
            return Err(invalid(format!("{} does not follow {}", pair[0], pair[1])));
        }
    }
    Ok(history)
}

impl RevisionStore for MemoryRevisionStore {
    fn local_uuid(&self) -> String {
        self.uuid.clone()
    }

    fn last_sequence(&self) -> u64 {
        self.log.lock().last
    }

    fn subscribe(&self) -> watch::Receiver<u64> {
        self.sequence_tx.subscribe()
    }

    fn get_document(&self, doc_id: &str) -> StoreResult<Option<Document>> {
        let Some(doc) = self.document(doc_id) else {
            return Ok(None);
        };
        let tree = doc.lock();
        Ok(tree.winner().map(|winner| Document {
            doc_id: doc_id.to_string(),
            current: winner.to_revision(doc_id),
            conflicts: tree
                .conflicting_leaves()
                .into_iter()
                .map(|n| n.rev_id.clone())
                .collect(),
        }))
    }

    fn get_revision(&self, doc_id: &str, rev_id: &RevId) -> StoreResult<Option<Revision>> {
        let Some(doc) = self.document(doc_id) else {
            return Ok(None);
        };
        let tree = doc.lock();
        Ok(tree
            .get(rev_id)
            .filter(|n| !n.is_stub())
            .map(|n| n.to_revision(doc_id)))
    }

    fn get_history(&self, doc_id: &str, rev_id: &RevId) -> StoreResult<Vec<RevId>> {
        let Some(doc) = self.document(doc_id) else {
            return Ok(Vec::new());
        };
        let history = doc.lock().history(rev_id);
        Ok(history)
    }

    fn put_revision(
        &self,
        doc_id: &str,
        parent: Option<&RevId>,
        properties: Properties,
        deleted: bool,
        attachments: Vec<AttachmentRef>,
    ) -> StoreResult<Revision> {
        self.check_writable()?;
        self.check_blobs(&attachments)?;

        let doc = self.document_or_create(doc_id);
        let mut tree = doc.lock();
        let current = tree.winner().map(|n| n.rev_id.clone());
        if parent != current.as_ref() {
            if let Some(parent) = parent {
                if !tree.contains(parent) {
                    return Err(StoreError::MissingParent {
                        doc_id: doc_id.to_string(),
                        parent: parent.clone(),
                    });
                }
            }
            return Err(StoreError::Conflict {
                doc_id: doc_id.to_string(),
                current,
            });
        }

        let rev_id = RevId::derive(parent, deleted, &properties);
        let generation = rev_id.generation();
        let attachments = attachments
            .into_iter()
            .map(|mut a| {
                if a.revpos == 0 {
                    a.revpos = generation;
                }
                a
            })
            .collect();
        let mut revision = Revision::new(doc_id, rev_id, parent.cloned())
            .with_properties(properties)
            .with_deleted(deleted)
            .with_attachments(attachments);
        revision.sequence = self.append(doc_id, &mut tree, RevisionNode::from_revision(&revision));
        drop(tree);

        self.publish(revision.sequence);
        debug!(doc_id, rev = %revision.rev_id, seq = revision.sequence, "saved local revision");
        Ok(revision)
    }

    fn force_insert(&self, revision: Revision, history: &[RevId]) -> StoreResult<InsertOutcome> {
        self.check_writable()?;
        let history = effective_history(&revision, history)?;
        self.check_blobs(&revision.attachments)?;

        let doc_id = revision.doc_id.clone();
        let doc = self.document_or_create(&doc_id);
        let mut tree = doc.lock();
        if tree.contains(&revision.rev_id) {
            trace!(doc_id = %doc_id, rev = %revision.rev_id, "revision already present");
            return Ok(InsertOutcome::AlreadyPresent);
        }

        let previous = tree.winner().map(|n| n.to_revision(&doc_id));
        let (seq, stubs) = self.append_with_history(
            &doc_id,
            &mut tree,
            RevisionNode::from_revision(&revision),
            &history,
        );
        let mut inserted = revision;
        inserted.parent = history.get(1).cloned();
        inserted.sequence = seq;

        let outcome = match previous {
            Some(local)
                if !inserted.deleted
                    && is_live_leaf(&tree, &local.rev_id)
                    && is_live_leaf(&tree, &inserted.rev_id) =>
            {
                let ancestor = tree.common_ancestor(&local.rev_id, &inserted.rev_id);
                debug!(
                    doc_id = %doc_id,
                    local = %local.rev_id,
                    remote = %inserted.rev_id,
                    "inserted conflicting revision"
                );
                InsertOutcome::Conflicted(Conflict::new(local, inserted, ancestor))
            }
            _ => {
                trace!(doc_id = %doc_id, rev = %inserted.rev_id, seq, stubs, "inserted revision");
                InsertOutcome::Inserted(inserted)
            }
        };
        drop(tree);

        self.publish(seq);
        Ok(outcome)
    }

    fn resolve_conflict(
        &self,
        conflict: &Conflict,
        resolution: &Resolution,
    ) -> StoreResult<Revision> {
        self.check_writable()?;
        let doc_id = conflict.doc_id.as_str();
        let doc = self
            .document(doc_id)
            .ok_or_else(|| StoreError::DocumentNotFound(doc_id.to_string()))?;
        let mut tree = doc.lock();
        if !is_live_leaf(&tree, &conflict.local.rev_id)
            || !is_live_leaf(&tree, &conflict.remote.rev_id)
        {
            return Err(StoreError::StaleResolution {
                doc_id: doc_id.to_string(),
            });
        }

        // Only the ranked loser is ever closed, so peers that decide
        // differently still agree on which branch stays open.
        let winner = conflict.ranked_winner();
        let loser = conflict.ranked_loser();
        let keep = |chosen: &Revision| {
            if chosen.rev_id == winner.rev_id {
                vec![tombstone(&loser.rev_id)]
            } else {
                vec![
                    successor(winner, &chosen.properties, &chosen.attachments),
                    tombstone(&loser.rev_id),
                ]
            }
        };
        let writes = match resolution {
            Resolution::KeepLocal => keep(&conflict.local),
            Resolution::AcceptRemote => keep(&conflict.remote),
            Resolution::Merge(properties) => vec![
                successor(winner, properties, &winner.attachments),
                tombstone(&loser.rev_id),
            ],
            Resolution::Delete => vec![
                tombstone(&conflict.local.rev_id),
                tombstone(&conflict.remote.rev_id),
            ],
        };

        let mut last_seq = 0;
        for node in writes {
            last_seq = self.append(doc_id, &mut tree, node);
        }
        let current = tree
            .winner()
            .map(|n| n.to_revision(doc_id))
            .ok_or_else(|| StoreError::Corrupted(format!("{doc_id} has no leaves")))?;
        drop(tree);

        self.publish(last_seq);
        debug!(doc_id, current = %current.rev_id, ?resolution, "resolved conflict");
        Ok(current)
    }

    fn conflict_for(&self, doc_id: &str) -> StoreResult<Option<Conflict>> {
        let Some(doc) = self.document(doc_id) else {
            return Ok(None);
        };
        let tree = doc.lock();
        let (Some(winner), Some(other)) = (tree.winner(), tree.conflicting_leaves().first().copied())
        else {
            return Ok(None);
        };
        let ancestor = tree.common_ancestor(&winner.rev_id, &other.rev_id);
        Ok(Some(Conflict::new(
            winner.to_revision(doc_id),
            other.to_revision(doc_id),
            ancestor,
        )))
    }

    fn conflicted_documents(&self) -> StoreResult<Vec<String>> {
        let docs: Vec<(String, Arc<Mutex<RevisionTree>>)> = self
            .docs
            .read()
            .iter()
            .map(|(id, doc)| (id.clone(), Arc::clone(doc)))
            .collect();
        let mut ids: Vec<String> = docs
            .into_iter()
            .filter(|(_, doc)| doc.lock().is_conflicted())
            .map(|(id, _)| id)
            .collect();
        ids.sort();
        Ok(ids)
    }

    fn revs_diff(&self, request: &RevsDiffRequest) -> StoreResult<RevsDiffResponse> {
        let mut response = RevsDiffResponse::new();
        for (doc_id, revs) in request {
            let doc = self.document(doc_id);
            let tree = doc.as_ref().map(|d| d.lock());
            let mut missing: Vec<RevId> = revs
                .iter()
                .filter(|r| !tree.as_ref().is_some_and(|t| t.contains(r)))
                .cloned()
                .collect();
            missing.sort();
            missing.dedup();
            if missing.is_empty() {
                continue;
            }
            let possible_ancestors = match &tree {
                Some(tree) => {
                    let mut ancestors: Vec<RevId> = tree
                        .leaves()
                        .filter(|leaf| {
                            missing
                                .iter()
                                .any(|m| leaf.rev_id.generation() < m.generation())
                        })
                        .map(|leaf| leaf.rev_id.clone())
                        .collect();
                    ancestors.sort();
                    ancestors
                }
                None => Vec::new(),
            };
            response.insert(
                doc_id.clone(),
                RevsDiffEntry {
                    missing,
                    possible_ancestors,
                },
            );
        }
        Ok(response)
    }

    fn changes_since(&self, since: u64, limit: usize) -> StoreResult<Vec<ChangeEntry>> {
        let log = self.log.lock();
        Ok(log
            .entries
            .range(since.saturating_add(1)..)
            .take(limit)
            .map(|(&seq, entry)| {
                ChangeEntry::new(entry.doc_id.clone(), entry.rev_id.clone(), seq)
                    .with_deleted(entry.deleted)
            })
            .collect())
    }

    fn purge(&self, doc_id: &str, rev_ids: &[RevId]) -> StoreResult<usize> {
        self.check_writable()?;
        let Some(doc) = self.document(doc_id) else {
            return Ok(0);
        };
        let mut tree = doc.lock();
        let purged = tree.purge(rev_ids);
        {
            let mut log = self.log.lock();
            for rev_id in &purged {
                log.remove(doc_id, rev_id);
            }
        }
        if !purged.is_empty() {
            warn!(doc_id, purged = purged.len(), "purged revisions");
        }
        Ok(purged.len())
    }

    fn put_attachment(&self, digest: &str, data: Vec<u8>) -> StoreResult<()> {
        self.check_writable()?;
        let actual = attachment_digest(&data);
        if actual != digest {
            return Err(StoreError::DigestMismatch {
                expected: digest.to_string(),
                actual,
            });
        }
        self.blobs.write().insert(actual, data);
        Ok(())
    }

    fn get_attachment(&self, digest: &str) -> StoreResult<Option<Vec<u8>>> {
        Ok(self.blobs.read().get(digest).cloned())
    }

    fn has_attachment(&self, digest: &str) -> bool {
        self.blobs.read().contains_key(digest)
    }

    fn get_checkpoint(&self, peer_key: &str) -> StoreResult<Option<Checkpoint>> {
        Ok(self.checkpoints.read().get(peer_key).cloned())
    }

    fn set_checkpoint(&self, peer_key: &str, checkpoint: &Checkpoint) -> StoreResult<()> {
        self.check_writable()?;
        self.checkpoints
            .write()
            .insert(peer_key.to_string(), checkpoint.clone());
        Ok(())
    }

    fn reset_checkpoint(&self, peer_key: &str) -> StoreResult<()> {
        self.check_writable()?;
        self.checkpoints.write().remove(peer_key);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use revsync_protocol::RemoteSeq;
    use serde_json::json;

    fn rev(s: &str) -> RevId {
        RevId::parse(s).unwrap()
    }

    fn props(value: serde_json::Value) -> Properties {
        match value {
            serde_json::Value::Object(map) => map,
            _ => Properties::new(),
        }
    }

    fn remote_rev(doc: &str, id: &str, parent: Option<&str>) -> Revision {
        Revision::new(doc, rev(id), parent.map(rev)).with_properties(props(json!({"v": id})))
    }

    #[test]
    fn local_edits_chain() {
        let store = MemoryRevisionStore::new();
        let first = store
            .put_revision("a", None, props(json!({"n": 1})), false, Vec::new())
            .unwrap();
        let second = store
            .put_revision("a", Some(&first.rev_id), props(json!({"n": 2})), false, Vec::new())
            .unwrap();
        assert_eq!(second.generation(), 2);
        assert!(second.sequence > first.sequence);

        let doc = store.get_document("a").unwrap().unwrap();
        assert_eq!(doc.current.rev_id, second.rev_id);
        assert_eq!(doc.current.properties["n"], json!(2));

        // Editing a non-current revision conflicts.
        let err = store
            .put_revision("a", Some(&first.rev_id), Properties::new(), false, Vec::new())
            .unwrap_err();
        assert!(matches!(err, StoreError::Conflict { .. }));

        // Only the leaf stays in the sequence index.
        let changes = store.changes_since(0, 10).unwrap();
        assert_eq!(changes.len(), 1);
        assert_eq!(changes[0].rev_id, second.rev_id);
        assert_eq!(changes[0].sequence, RemoteSeq::Number(2));
    }

    #[test]
    fn forced_insert_creates_stubs_and_is_idempotent() {
        let store = MemoryRevisionStore::new();
        let history = vec![rev("3-zzz"), rev("2-yyy"), rev("1-xxx")];
        let outcome = store
            .force_insert(remote_rev("a", "3-zzz", Some("2-yyy")), &history)
            .unwrap();
        assert!(matches!(outcome, InsertOutcome::Inserted(_)));
        assert_eq!(
            store.get_document("a").unwrap().unwrap().current.rev_id,
            rev("3-zzz")
        );
        assert!(store.get_revision("a", &rev("2-yyy")).unwrap().is_none());
        assert_eq!(store.get_history("a", &rev("3-zzz")).unwrap(), history);

        let again = store
            .force_insert(remote_rev("a", "3-zzz", Some("2-yyy")), &history)
            .unwrap();
        assert_eq!(again, InsertOutcome::AlreadyPresent);
        assert_eq!(store.last_sequence(), 1);
    }

    #[test]
    fn forced_insert_rejects_gapped_history() {
        let store = MemoryRevisionStore::new();
        let err = store
            .force_insert(
                remote_rev("a", "3-c", Some("1-a")),
                &[rev("3-c"), rev("1-a")],
            )
            .unwrap_err();
        assert!(matches!(err, StoreError::InvalidHistory { .. }));
    }

    #[test]
    fn branch_reports_conflict_and_resolution_tombstones_loser() {
        let store = MemoryRevisionStore::new();
        store
            .force_insert(remote_rev("d", "1-x", None), &[rev("1-x")])
            .unwrap();
        store
            .force_insert(remote_rev("d", "2-a", Some("1-x")), &[])
            .unwrap();
        let outcome = store
            .force_insert(remote_rev("d", "2-b", Some("1-x")), &[])
            .unwrap();
        let InsertOutcome::Conflicted(conflict) = outcome else {
            panic!("expected conflict, got {outcome:?}");
        };
        assert_eq!(conflict.local.rev_id, rev("2-a"));
        assert_eq!(conflict.remote.rev_id, rev("2-b"));
        assert_eq!(conflict.common_ancestor, Some(rev("1-x")));
        assert_eq!(store.conflicted_documents().unwrap(), vec!["d".to_string()]);

        let current = store
            .resolve_conflict(&conflict, &Resolution::AcceptRemote)
            .unwrap();
        assert_eq!(current.rev_id, rev("2-b"));
        assert!(store.conflicted_documents().unwrap().is_empty());
        // The loser is still in the tree.
        assert!(store.get_revision("d", &rev("2-a")).unwrap().is_some());

        // Re-applying the same resolution is stale.
        let stale = store
            .resolve_conflict(&conflict, &Resolution::AcceptRemote)
            .unwrap_err();
        assert!(matches!(stale, StoreError::StaleResolution { .. }));
    }

    #[test]
    fn resolution_is_identical_on_both_sides() {
        let here = MemoryRevisionStore::new();
        let there = MemoryRevisionStore::new();
        for (store, first, second) in [(&here, "2-a", "2-b"), (&there, "2-b", "2-a")] {
            store
                .force_insert(remote_rev("d", "1-x", None), &[])
                .unwrap();
            store
                .force_insert(remote_rev("d", first, Some("1-x")), &[])
                .unwrap();
            let InsertOutcome::Conflicted(conflict) = store
                .force_insert(remote_rev("d", second, Some("1-x")), &[])
                .unwrap()
            else {
                panic!("expected conflict");
            };
            let resolution = if conflict.remote.rev_id > conflict.local.rev_id {
                Resolution::AcceptRemote
            } else {
                Resolution::KeepLocal
            };
            store.resolve_conflict(&conflict, &resolution).unwrap();
        }
        let here_tree = here.tree("d").unwrap();
        let there_tree = there.tree("d").unwrap();
        let mut here_revs: Vec<RevId> = here_tree.nodes().map(|n| n.rev_id.clone()).collect();
        let mut there_revs: Vec<RevId> = there_tree.nodes().map(|n| n.rev_id.clone()).collect();
        here_revs.sort();
        there_revs.sort();
        assert_eq!(here_revs, there_revs);
        assert_eq!(here_tree.winner().unwrap().rev_id, rev("2-b"));
        assert_eq!(there_tree.winner().unwrap().rev_id, rev("2-b"));
    }

    #[test]
    fn merge_and_delete_resolutions() {
        let store = MemoryRevisionStore::new();
        store.force_insert(remote_rev("m", "1-x", None), &[]).unwrap();
        store.force_insert(remote_rev("m", "2-a", Some("1-x")), &[]).unwrap();
        let InsertOutcome::Conflicted(conflict) = store
            .force_insert(remote_rev("m", "2-b", Some("1-x")), &[])
            .unwrap()
        else {
            panic!("expected conflict");
        };
        let merged = store
            .resolve_conflict(&conflict, &Resolution::Merge(props(json!({"v": "both"}))))
            .unwrap();
        assert_eq!(merged.generation(), 3);
        assert_eq!(merged.parent, Some(rev("2-b")));
        assert_eq!(merged.properties["v"], json!("both"));

        store.force_insert(remote_rev("z", "1-x", None), &[]).unwrap();
        store.force_insert(remote_rev("z", "2-a", Some("1-x")), &[]).unwrap();
        let InsertOutcome::Conflicted(conflict) = store
            .force_insert(remote_rev("z", "2-b", Some("1-x")), &[])
            .unwrap()
        else {
            panic!("expected conflict");
        };
        let current = store.resolve_conflict(&conflict, &Resolution::Delete).unwrap();
        assert!(current.deleted);
        assert!(store.get_document("z").unwrap().unwrap().is_deleted());
    }

    /// Sends every full revision of `doc_id` in `from` to `to`.
    fn exchange(from: &MemoryRevisionStore, to: &MemoryRevisionStore, doc_id: &str) {
        let tree = from.tree(doc_id).unwrap();
        for node in tree.nodes().filter(|n| !n.is_stub()) {
            let history = tree.history(&node.rev_id);
            to.force_insert(node.to_revision(doc_id), &history).unwrap();
        }
    }

    #[test]
    fn opposite_choices_keep_both_edits() {
        let here = MemoryRevisionStore::new();
        let there = MemoryRevisionStore::new();
        for (store, local, remote) in [(&here, "2-a", "2-b"), (&there, "2-b", "2-a")] {
            store.force_insert(remote_rev("d", "1-x", None), &[]).unwrap();
            store.force_insert(remote_rev("d", local, Some("1-x")), &[]).unwrap();
            let InsertOutcome::Conflicted(conflict) = store
                .force_insert(remote_rev("d", remote, Some("1-x")), &[])
                .unwrap()
            else {
                panic!("expected conflict");
            };
            // Each side insists on its own edit.
            store.resolve_conflict(&conflict, &Resolution::KeepLocal).unwrap();
        }
        exchange(&here, &there, "d");
        exchange(&there, &here, "d");

        let here_doc = here.get_document("d").unwrap().unwrap();
        let there_doc = there.get_document("d").unwrap().unwrap();
        assert_eq!(here_doc.current.rev_id, there_doc.current.rev_id);
        assert!(!here_doc.is_deleted());
        assert_eq!(here_doc.current.parent, Some(rev("2-b")));
        assert_eq!(here_doc.current.properties["v"], json!("2-a"));
        for store in [&here, &there] {
            assert!(store.conflicted_documents().unwrap().is_empty());
            for edit in ["2-a", "2-b"] {
                assert!(store.get_revision("d", &rev(edit)).unwrap().is_some());
            }
        }
    }

    #[test]
    fn purge_reaches_a_resolved_loser() {
        let store = MemoryRevisionStore::new();
        store.force_insert(remote_rev("d", "1-x", None), &[]).unwrap();
        store.force_insert(remote_rev("d", "2-a", Some("1-x")), &[]).unwrap();
        let InsertOutcome::Conflicted(conflict) = store
            .force_insert(remote_rev("d", "2-b", Some("1-x")), &[])
            .unwrap()
        else {
            panic!("expected conflict");
        };
        store.resolve_conflict(&conflict, &Resolution::AcceptRemote).unwrap();

        assert_eq!(store.purge("d", &[rev("2-a")]).unwrap(), 2);
        assert!(store.get_revision("d", &rev("2-a")).unwrap().is_none());
        assert_eq!(store.tree("d").unwrap().leaves().count(), 1);
        let changes = store.changes_since(0, 10).unwrap();
        assert_eq!(changes.len(), 1);
        assert_eq!(changes[0].rev_id, rev("2-b"));
    }

    #[test]
    fn revs_diff_reports_missing_and_ancestors() {
        let store = MemoryRevisionStore::new();
        store.force_insert(remote_rev("a", "1-x", None), &[]).unwrap();

        let mut request = RevsDiffRequest::new();
        request.insert("a".into(), vec![rev("1-x"), rev("2-y")]);
        request.insert("b".into(), vec![rev("1-q")]);
        let response = store.revs_diff(&request).unwrap();
        assert_eq!(response["a"].missing, vec![rev("2-y")]);
        assert_eq!(response["a"].possible_ancestors, vec![rev("1-x")]);
        assert_eq!(response["b"].missing, vec![rev("1-q")]);

        let mut known = RevsDiffRequest::new();
        known.insert("a".into(), vec![rev("1-x")]);
        assert!(store.revs_diff(&known).unwrap().is_empty());
    }

    #[test]
    fn attachments_must_be_stored_first() {
        let store = MemoryRevisionStore::new();
        let data = b"blob".to_vec();
        let digest = attachment_digest(&data);
        let revision = remote_rev("a", "1-x", None).with_attachments(vec![AttachmentRef {
            name: "f".into(),
            digest: digest.clone(),
            content_type: None,
            length: 4,
            revpos: 1,
        }]);

        let err = store.force_insert(revision.clone(), &[]).unwrap_err();
        assert!(matches!(err, StoreError::BlobMissing { .. }));

        let bad = store.put_attachment(&digest, b"other".to_vec()).unwrap_err();
        assert!(matches!(bad, StoreError::DigestMismatch { .. }));

        store.put_attachment(&digest, data.clone()).unwrap();
        assert!(store.has_attachment(&digest));
        assert!(matches!(
            store.force_insert(revision, &[]).unwrap(),
            InsertOutcome::Inserted(_)
        ));
        assert_eq!(store.get_attachment(&digest).unwrap(), Some(data));
    }

    #[test]
    fn purge_removes_losing_leaf() {
        let store = MemoryRevisionStore::new();
        store.force_insert(remote_rev("d", "1-x", None), &[]).unwrap();
        store.force_insert(remote_rev("d", "2-a", Some("1-x")), &[]).unwrap();
        store.force_insert(remote_rev("d", "2-b", Some("1-x")), &[]).unwrap();
        assert_eq!(store.purge("d", &[rev("2-a"), rev("1-x")]).unwrap(), 1);
        assert!(store.conflicted_documents().unwrap().is_empty());
        assert!(store
            .changes_since(0, 10)
            .unwrap()
            .iter()
            .all(|c| c.rev_id != rev("2-a")));
    }

    #[test]
    fn failing_writes_are_reported_as_full() {
        let store = MemoryRevisionStore::new();
        store.set_fail_writes(true);
        let err = store
            .put_revision("a", None, Properties::new(), false, Vec::new())
            .unwrap_err();
        assert!(err.is_fatal());
        assert!(store.set_checkpoint("peer", &Checkpoint::default()).is_err());
    }

    #[test]
    fn checkpoints_roundtrip() {
        let store = MemoryRevisionStore::with_uuid("local-1");
        assert_eq!(store.local_uuid(), "local-1");
        assert!(store.get_checkpoint("peer").unwrap().is_none());
        let checkpoint = Checkpoint {
            last_sequence_pushed: 4,
            last_sequence_pulled: Some(RemoteSeq::Number(9)),
            remote_token: None,
        };
        store.set_checkpoint("peer", &checkpoint).unwrap();
        assert_eq!(store.get_checkpoint("peer").unwrap(), Some(checkpoint));
        store.reset_checkpoint("peer").unwrap();
        assert!(store.get_checkpoint("peer").unwrap().is_none());
    }

    #[tokio::test]
    async fn subscribers_see_sequence_advance() {
        let store = MemoryRevisionStore::new();
        let mut rx = store.subscribe();
        store
            .put_revision("a", None, Properties::new(), false, Vec::new())
            .unwrap();
        rx.changed().await.unwrap();
        assert_eq!(*rx.borrow(), 1);
    }
}
