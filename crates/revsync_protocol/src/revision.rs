//! Revisions and attachment references.

use crate::rev_id::RevId;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

/// Opaque document properties (never interpreted by replication).
pub type Properties = serde_json::Map<String, serde_json::Value>;

/// A reference to a content-addressed attachment blob.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AttachmentRef {
    /// Attachment name within the document.
    pub name: String,
    /// Content digest (`sha256-<hex>`).
    pub digest: String,
    /// MIME type, if known.
    pub content_type: Option<String>,
    /// Length of the blob in bytes.
    pub length: u64,
    /// Generation of the revision that introduced this blob.
    pub revpos: u64,
}

/// A single revision of a document.
#[derive(Debug, Clone, PartialEq)]
pub struct Revision {
    /// Document ID.
    pub doc_id: String,
    /// Revision ID.
    pub rev_id: RevId,
    /// Parent revision, `None` for a root.
    pub parent: Option<RevId>,
    /// Document body.
    pub properties: Properties,
    /// Tombstone marker.
    pub deleted: bool,
    /// Local sequence, 0 until the store assigns one.
    pub sequence: u64,
    /// Attachments referenced by this revision.
    pub attachments: Vec<AttachmentRef>,
}

impl Revision {
    /// Creates an unsaved revision.
    pub fn new(doc_id: impl Into<String>, rev_id: RevId, parent: Option<RevId>) -> Self {
        Self {
            doc_id: doc_id.into(),
            rev_id,
            parent,
            properties: Properties::new(),
            deleted: false,
            sequence: 0,
            attachments: Vec::new(),
        }
    }

    /// Sets the properties.
    pub fn with_properties(mut self, properties: Properties) -> Self {
        self.properties = properties;
        self
    }

    /// Marks the revision as a tombstone.
    pub fn with_deleted(mut self, deleted: bool) -> Self {
        self.deleted = deleted;
        self
    }

    /// Sets the attachment list.
    pub fn with_attachments(mut self, attachments: Vec<AttachmentRef>) -> Self {
        self.attachments = attachments;
        self
    }

    /// Returns the generation of this revision.
    pub fn generation(&self) -> u64 {
        self.rev_id.generation()
    }
}

/// Computes the content digest used as an attachment key.
pub fn attachment_digest(data: &[u8]) -> String {
    format!("sha256-{}", hex::encode(Sha256::digest(data)))
}
