//! Replication checkpoints.

use crate::changes::RemoteSeq;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::BTreeMap;

/// Persisted progress for one (local database, remote, filter) triple.
///
/// Checkpoints only move forward; the only way back is an explicit reset.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Checkpoint {
    /// Highest local sequence acknowledged by the remote.
    pub last_sequence_pushed: u64,
    /// Remote sequence below which every change has been applied locally.
    pub last_sequence_pulled: Option<RemoteSeq>,
    /// `_rev` of the remote checkpoint document.
    pub remote_token: Option<String>,
}

impl Checkpoint {
    /// Returns true if no progress has been recorded.
    pub fn is_empty(&self) -> bool {
        self.last_sequence_pushed == 0 && self.last_sequence_pulled.is_none()
    }

    /// Returns true if the remote copy records the same progress.
    pub fn matches(&self, remote: &CheckpointDoc) -> bool {
        remote.last_sequence == self.last_sequence_pulled
            && remote.last_sequence_pushed.unwrap_or(0) == self.last_sequence_pushed
    }
}

/// The `_local/{checkpointId}` document stored on the remote.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CheckpointDoc {
    /// Document ID (`_local/...`), echoed by some servers.
    #[serde(rename = "_id", default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    /// Remote revision token of this document.
    #[serde(rename = "_rev", default, skip_serializing_if = "Option::is_none")]
    pub rev: Option<String>,
    /// Pull progress.
    #[serde(rename = "lastSequence", default, skip_serializing_if = "Option::is_none")]
    pub last_sequence: Option<RemoteSeq>,
    /// Push progress.
    #[serde(
        rename = "lastSequencePushed",
        default,
        skip_serializing_if = "Option::is_none"
    )]
    pub last_sequence_pushed: Option<u64>,
}

impl CheckpointDoc {
    /// Builds the remote copy of a checkpoint.
    pub fn from_checkpoint(checkpoint: &Checkpoint) -> Self {
        Self {
            id: None,
            rev: checkpoint.remote_token.clone(),
            last_sequence: checkpoint.last_sequence_pulled.clone(),
            last_sequence_pushed: Some(checkpoint.last_sequence_pushed),
        }
    }
}

/// The replication settings that identify a checkpoint.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct CheckpointSettings {
    /// Private UUID of the local database.
    #[serde(rename = "localUUID")]
    pub local_uuid: String,
    /// Remote database URL, credentials stripped.
    #[serde(rename = "remoteURL")]
    pub remote_url: String,
    /// Named changes filter.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub filter: Option<String>,
    /// Filter parameters (sorted by key).
    #[serde(rename = "filterParams", skip_serializing_if = "BTreeMap::is_empty")]
    pub filter_params: BTreeMap<String, serde_json::Value>,
    /// Restricting document IDs.
    #[serde(rename = "docids", skip_serializing_if = "Option::is_none")]
    pub doc_ids: Option<Vec<String>>,
}

/// Derives the checkpoint ID for a set of replication settings.
///
/// The ID is the hex SHA-256 of the canonical JSON form; doc IDs are sorted
/// so that equivalent settings always map to the same checkpoint.
pub fn checkpoint_id(settings: &CheckpointSettings) -> String {
    let mut canonical = settings.clone();
    if let Some(ids) = canonical.doc_ids.as_mut() {
        ids.sort();
        ids.dedup();
    }
    let bytes = serde_json::to_vec(&canonical).unwrap_or_default();
    hex::encode(Sha256::digest(&bytes))
}
