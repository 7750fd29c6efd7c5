//! Property-based test generators using proptest.

use crate::fixtures::{delete_doc, put_doc};
use proptest::prelude::*;
use revsync_protocol::Properties;
use revsync_store::RevisionStore;

/// One local edit.
#[derive(Debug, Clone)]
pub enum Edit {
    /// Create or update a document.
    Put {
        /// Document ID.
        doc_id: String,
        /// New body.
        properties: Properties,
    },
    /// Delete a document if it exists.
    Delete {
        /// Document ID.
        doc_id: String,
    },
}

/// Generate document IDs from a small alphabet so edits collide.
pub fn doc_id() -> impl Strategy<Value = String> {
    "[a-e]{1,2}"
}

/// Generate small flat document bodies.
pub fn properties() -> impl Strategy<Value = Properties> {
    prop::collection::btree_map("[a-z]{1,4}", any::<i32>(), 0..4).prop_map(|fields| {
        fields
            .into_iter()
            .map(|(k, v)| (k, serde_json::Value::from(v)))
            .collect()
    })
}

/// Generate a single edit, mostly puts.
pub fn edit() -> impl Strategy<Value = Edit> {
    prop_oneof![
        4 => (doc_id(), properties()).prop_map(|(doc_id, properties)| Edit::Put { doc_id, properties }),
        1 => doc_id().prop_map(|doc_id| Edit::Delete { doc_id }),
    ]
}

/// Generate a sequence of edits.
pub fn edits(max: usize) -> impl Strategy<Value = Vec<Edit>> {
    prop::collection::vec(edit(), 0..=max)
}

/// Applies edits in order. Deleting a missing document is skipped.
pub fn apply_edits(store: &dyn RevisionStore, edits: &[Edit]) {
    for edit in edits {
        match edit {
            Edit::Put { doc_id, properties } => {
                put_doc(store, doc_id, properties.clone());
            }
            Edit::Delete { doc_id } => {
                let exists = store
                    .get_document(doc_id)
                    .ok()
                    .flatten()
                    .is_some_and(|d| !d.current.deleted);
                if exists {
                    delete_doc(store, doc_id);
                }
            }
        }
    }
}
