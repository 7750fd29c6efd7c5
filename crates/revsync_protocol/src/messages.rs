//! Request and response bodies for the replication endpoints.

use crate::changes::RemoteSeq;
use crate::error::{ProtocolError, ProtocolResult};
use crate::rev_id::RevId;
use crate::revision::{attachment_digest, AttachmentRef, Properties, Revision};
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Highest protocol version this implementation speaks.
pub const PROTOCOL_VERSION: u16 = 1;

/// `GET /{db}/` response.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct DatabaseInfo {
    /// Database name.
    pub db_name: String,
    /// Latest sequence of the database.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub update_seq: Option<RemoteSeq>,
    /// Replication protocol version; absent means version 1.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub protocol_version: Option<u16>,
}

impl DatabaseInfo {
    /// Returns true if the peer speaks a protocol version we understand.
    pub fn is_compatible(&self) -> bool {
        self.protocol_version.unwrap_or(1) <= PROTOCOL_VERSION
    }
}

/// `_revisions` history block: newest generation plus digests, newest first.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RevisionHistory {
    /// Generation of the first ID.
    pub start: u64,
    /// Digests in descending generation order.
    pub ids: Vec<String>,
}

impl RevisionHistory {
    /// Builds the block from revision IDs ordered newest first.
    pub fn from_rev_ids(history: &[RevId]) -> Option<Self> {
        let first = history.first()?;
        Some(Self {
            start: first.generation(),
            ids: history.iter().map(|r| r.digest().to_string()).collect(),
        })
    }

    /// Expands the block into revision IDs, newest first.
    pub fn to_rev_ids(&self) -> ProtocolResult<Vec<RevId>> {
        if self.ids.len() as u64 > self.start {
            return Err(ProtocolError::invalid(format!(
                "_revisions lists {} ids from generation {}",
                self.ids.len(),
                self.start
            )));
        }
        self.ids
            .iter()
            .enumerate()
            .map(|(i, digest)| RevId::new(self.start - i as u64, digest.clone()))
            .collect()
    }
}

/// One entry of a document's `_attachments` map.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AttachmentBody {
    /// MIME type.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub content_type: Option<String>,
    /// Content digest.
    pub digest: String,
    /// Blob length in bytes.
    #[serde(default)]
    pub length: u64,
    /// Generation that introduced the blob.
    #[serde(default)]
    pub revpos: u64,
    /// True when the body is omitted because the receiver already has it.
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub stub: bool,
    /// Inline base64 data.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<String>,
}

impl AttachmentBody {
    /// Builds a stub that references the blob by digest only.
    pub fn stub(attachment: &AttachmentRef) -> Self {
        Self {
            content_type: attachment.content_type.clone(),
            digest: attachment.digest.clone(),
            length: attachment.length,
            revpos: attachment.revpos,
            stub: true,
            data: None,
        }
    }

    /// Builds an entry carrying the blob inline.
    pub fn inline(attachment: &AttachmentRef, data: &[u8]) -> Self {
        Self {
            stub: false,
            data: Some(BASE64.encode(data)),
            ..Self::stub(attachment)
        }
    }

    /// Decodes the inline data, verifying it against the digest.
    pub fn decode_data(&self, name: &str) -> ProtocolResult<Option<Vec<u8>>> {
        let Some(encoded) = &self.data else {
            return Ok(None);
        };
        let bytes = BASE64
            .decode(encoded)
            .map_err(|e| ProtocolError::InvalidAttachment {
                name: name.to_string(),
                reason: e.to_string(),
            })?;
        if attachment_digest(&bytes) != self.digest {
            return Err(ProtocolError::InvalidAttachment {
                name: name.to_string(),
                reason: "digest mismatch".into(),
            });
        }
        Ok(Some(bytes))
    }

    /// Converts to the store-level reference.
    pub fn to_ref(&self, name: &str) -> AttachmentRef {
        AttachmentRef {
            name: name.to_string(),
            digest: self.digest.clone(),
            content_type: self.content_type.clone(),
            length: self.length,
            revpos: self.revpos,
        }
    }
}

/// A document revision as it travels over the wire.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DocumentBody {
    /// Document ID.
    #[serde(rename = "_id")]
    pub id: String,
    /// Revision ID.
    #[serde(rename = "_rev")]
    pub rev: RevId,
    /// Tombstone marker.
    #[serde(rename = "_deleted", default, skip_serializing_if = "std::ops::Not::not")]
    pub deleted: bool,
    /// Revision history.
    #[serde(rename = "_revisions", default, skip_serializing_if = "Option::is_none")]
    pub revisions: Option<RevisionHistory>,
    /// Attachments by name.
    #[serde(rename = "_attachments", default, skip_serializing_if = "BTreeMap::is_empty")]
    pub attachments: BTreeMap<String, AttachmentBody>,
    /// All other properties.
    #[serde(flatten)]
    pub properties: Properties,
}

/// A decoded incoming revision: the revision, its history, and inline blobs.
pub type IncomingRevision = (Revision, Vec<RevId>, Vec<(String, Vec<u8>)>);

impl DocumentBody {
    /// Builds the wire form of a stored revision.
    pub fn from_revision(
        revision: &Revision,
        history: &[RevId],
        attachments: BTreeMap<String, AttachmentBody>,
    ) -> Self {
        Self {
            id: revision.doc_id.clone(),
            rev: revision.rev_id.clone(),
            deleted: revision.deleted,
            revisions: RevisionHistory::from_rev_ids(history),
            attachments,
            properties: revision.properties.clone(),
        }
    }

    /// Returns the revision history, newest first, always starting with `_rev`.
    pub fn history(&self) -> ProtocolResult<Vec<RevId>> {
        let history = match &self.revisions {
            Some(block) => block.to_rev_ids()?,
            None => vec![self.rev.clone()],
        };
        if history.first() != Some(&self.rev) {
            return Err(ProtocolError::invalid(format!(
                "_revisions of {} does not start with {}",
                self.id, self.rev
            )));
        }
        Ok(history)
    }

    /// Splits the body into a revision, its history and decoded inline blobs.
    pub fn into_revision(self) -> ProtocolResult<IncomingRevision> {
        let history = self.history()?;
        let mut refs = Vec::with_capacity(self.attachments.len());
        let mut blobs = Vec::new();
        for (name, body) in &self.attachments {
            if let Some(bytes) = body.decode_data(name)? {
                blobs.push((body.digest.clone(), bytes));
            }
            refs.push(body.to_ref(name));
        }
        let revision = Revision::new(self.id, self.rev, history.get(1).cloned())
            .with_properties(self.properties)
            .with_deleted(self.deleted)
            .with_attachments(refs);
        Ok((revision, history, blobs))
    }
}

/// `POST /{db}/_revs_diff` body: document ID to candidate revisions.
pub type RevsDiffRequest = BTreeMap<String, Vec<RevId>>;

/// Per-document `_revs_diff` answer.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RevsDiffEntry {
    /// Revisions the responder does not have.
    #[serde(default)]
    pub missing: Vec<RevId>,
    /// Leaves the responder has that could be ancestors of the missing ones.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub possible_ancestors: Vec<RevId>,
}

/// `POST /{db}/_revs_diff` response. Documents with nothing missing are absent.
pub type RevsDiffResponse = BTreeMap<String, RevsDiffEntry>;

/// `POST /{db}/_bulk_docs` body.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BulkDocsRequest {
    /// Revisions to store.
    pub docs: Vec<DocumentBody>,
    /// False: store the given revision IDs instead of generating new ones.
    pub new_edits: bool,
}

impl BulkDocsRequest {
    /// Builds a replication upload (`new_edits: false`).
    pub fn replicate(docs: Vec<DocumentBody>) -> Self {
        Self {
            docs,
            new_edits: false,
        }
    }
}

/// One row of a `_bulk_docs` response, also used for `_bulk_get` errors.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BulkDocsRow {
    /// Document ID.
    pub id: String,
    /// Revision ID, if echoed.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rev: Option<RevId>,
    /// Success marker.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ok: Option<bool>,
    /// Error code (`conflict`, `forbidden`, ...).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    /// Human-readable reason.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
}

impl BulkDocsRow {
    /// Creates a success row.
    pub fn success(id: impl Into<String>, rev: RevId) -> Self {
        Self {
            id: id.into(),
            rev: Some(rev),
            ok: Some(true),
            error: None,
            reason: None,
        }
    }

    /// Creates an error row.
    pub fn failure(
        id: impl Into<String>,
        rev: Option<RevId>,
        error: impl Into<String>,
        reason: impl Into<String>,
    ) -> Self {
        Self {
            id: id.into(),
            rev,
            ok: None,
            error: Some(error.into()),
            reason: Some(reason.into()),
        }
    }

    /// Returns true unless the row carries an error.
    pub fn is_ok(&self) -> bool {
        self.error.is_none()
    }
}

/// A `_bulk_get` request item.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BulkGetRef {
    /// Document ID.
    pub id: String,
    /// Revision to fetch.
    pub rev: RevId,
    /// Revisions the requester holds; attachments present there come back as stubs.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub atts_since: Vec<RevId>,
}

/// `POST /{db}/_bulk_get` body.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct BulkGetRequest {
    /// Requested revisions.
    pub docs: Vec<BulkGetRef>,
}

/// One fetched revision or its error.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BulkGetDoc {
    /// The revision body.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ok: Option<DocumentBody>,
    /// Why the revision could not be returned.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<BulkDocsRow>,
}

/// All requested revisions of one document.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BulkGetResult {
    /// Document ID.
    pub id: String,
    /// Per-revision outcomes.
    pub docs: Vec<BulkGetDoc>,
}

/// `POST /{db}/_bulk_get` response.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct BulkGetResponse {
    /// Per-document results.
    pub results: Vec<BulkGetResult>,
}
