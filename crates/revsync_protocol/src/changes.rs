//! Changes feed rows and the incremental feed parser.

use crate::error::{ProtocolError, ProtocolResult};
use crate::rev_id::RevId;
use serde::{Deserialize, Serialize};
use std::fmt;

/// A position in a changes feed.
///
/// Local sequences are numeric. Remote sequences are opaque tokens that are
/// only ever echoed back in `since=`; they are never compared.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(untagged)]
pub enum RemoteSeq {
    /// Numeric sequence.
    Number(u64),
    /// Opaque sequence token.
    Token(String),
}

impl RemoteSeq {
    /// Returns the numeric value, if this is a numeric sequence.
    pub fn as_number(&self) -> Option<u64> {
        match self {
            RemoteSeq::Number(n) => Some(*n),
            RemoteSeq::Token(t) => t.parse().ok(),
        }
    }
}

impl From<u64> for RemoteSeq {
    fn from(n: u64) -> Self {
        RemoteSeq::Number(n)
    }
}

impl fmt::Display for RemoteSeq {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RemoteSeq::Number(n) => write!(f, "{n}"),
            RemoteSeq::Token(t) => f.write_str(t),
        }
    }
}

/// `{"rev": "..."}` element of a change row.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RevRef {
    /// Revision ID.
    pub rev: RevId,
}

/// One row of the `_changes` feed as it appears on the wire.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChangeRow {
    /// Feed sequence.
    pub seq: RemoteSeq,
    /// Document ID.
    pub id: String,
    /// Leaf revisions (winner first with `style=all_docs`).
    pub changes: Vec<RevRef>,
    /// Whether the winning revision is a tombstone.
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub deleted: bool,
}

impl ChangeRow {
    /// Expands the row into one entry per listed revision.
    pub fn into_entries(self) -> Vec<ChangeEntry> {
        let ChangeRow {
            seq,
            id,
            changes,
            deleted,
        } = self;
        changes
            .into_iter()
            .enumerate()
            .map(|(i, change)| ChangeEntry {
                doc_id: id.clone(),
                rev_id: change.rev,
                sequence: seq.clone(),
                deleted: deleted && i == 0,
                possible_ancestors: Vec::new(),
            })
            .collect()
    }
}

/// A change notification consumed by the puller or pusher.
#[derive(Debug, Clone, PartialEq)]
pub struct ChangeEntry {
    /// Document ID.
    pub doc_id: String,
    /// Revision ID.
    pub rev_id: RevId,
    /// Feed sequence that produced this entry.
    pub sequence: RemoteSeq,
    /// Tombstone marker.
    pub deleted: bool,
    /// Ancestors the receiving side already holds, if known.
    pub possible_ancestors: Vec<RevId>,
}

impl ChangeEntry {
    /// Creates an entry with no known ancestors.
    pub fn new(doc_id: impl Into<String>, rev_id: RevId, sequence: impl Into<RemoteSeq>) -> Self {
        Self {
            doc_id: doc_id.into(),
            rev_id,
            sequence: sequence.into(),
            deleted: false,
            possible_ancestors: Vec::new(),
        }
    }

    /// Marks the entry as a tombstone.
    pub fn with_deleted(mut self, deleted: bool) -> Self {
        self.deleted = deleted;
        self
    }
}

/// Body of a `feed=normal` or `feed=longpoll` response.
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct ChangesResponse {
    /// Raw rows; decoded one by one so a bad row does not poison the batch.
    #[serde(default)]
    pub results: Vec<serde_json::Value>,
    /// Sequence to resume from.
    pub last_seq: Option<RemoteSeq>,
}

impl ChangesResponse {
    /// Decodes a response body.
    pub fn decode(bytes: &[u8]) -> ProtocolResult<Self> {
        Ok(serde_json::from_slice(bytes)?)
    }

    /// Decodes each row independently.
    pub fn rows(&self) -> Vec<ProtocolResult<ChangeRow>> {
        self.results
            .iter()
            .map(|v| ChangeRow::deserialize(v).map_err(ProtocolError::from))
            .collect()
    }
}

/// A decoded line of a continuous feed.
#[derive(Debug, Clone, PartialEq)]
pub enum FeedLine {
    /// A change row.
    Change(ChangeRow),
    /// End-of-feed marker carrying the final sequence.
    LastSeq(RemoteSeq),
    /// Empty keep-alive line.
    Heartbeat,
    /// A line that could not be decoded; only this line is lost.
    Malformed {
        /// Offending line (lossy UTF-8).
        line: String,
        /// Decoder message.
        reason: String,
    },
}

/// Incremental parser for newline-delimited continuous feeds.
///
/// Chunks may split lines anywhere; incomplete trailing bytes are kept until
/// the next chunk completes them.
#[derive(Debug, Default)]
pub struct FeedParser {
    buffer: Vec<u8>,
}

impl FeedParser {
    /// Creates an empty parser.
    pub fn new() -> Self {
        Self::default()
    }

    /// Feeds a chunk and returns every line it completed.
    pub fn push(&mut self, chunk: &[u8]) -> Vec<FeedLine> {
        self.buffer.extend_from_slice(chunk);
        let mut lines = Vec::new();
        while let Some(pos) = self.buffer.iter().position(|b| *b == b'\n') {
            let line: Vec<u8> = self.buffer.drain(..=pos).collect();
            lines.push(Self::decode_line(&line[..line.len() - 1]));
        }
        lines
    }

    /// Flushes a trailing line that was not newline-terminated.
    pub fn finish(&mut self) -> Option<FeedLine> {
        if self.buffer.is_empty() {
            return None;
        }
        let line = std::mem::take(&mut self.buffer);
        match Self::decode_line(&line) {
            FeedLine::Heartbeat => None,
            other => Some(other),
        }
    }

    /// Returns the number of buffered bytes.
    pub fn pending_bytes(&self) -> usize {
        self.buffer.len()
    }

    fn decode_line(raw: &[u8]) -> FeedLine {
        let trimmed = trim_ascii(raw);
        if trimmed.is_empty() {
            return FeedLine::Heartbeat;
        }
        let malformed = |reason: String| FeedLine::Malformed {
            line: String::from_utf8_lossy(trimmed).into_owned(),
            reason,
        };
        let value: serde_json::Value = match serde_json::from_slice(trimmed) {
            Ok(v) => v,
            Err(e) => return malformed(e.to_string()),
        };
        if value.get("id").is_none() {
            if let Some(last) = value.get("last_seq") {
                return match RemoteSeq::deserialize(last) {
                    Ok(seq) => FeedLine::LastSeq(seq),
                    Err(e) => malformed(e.to_string()),
                };
            }
        }
        match ChangeRow::deserialize(&value) {
            Ok(row) => FeedLine::Change(row),
            Err(e) => malformed(e.to_string()),
        }
    }
}

fn trim_ascii(bytes: &[u8]) -> &[u8] {
    let start = bytes
        .iter()
        .position(|b| !b.is_ascii_whitespace())
        .unwrap_or(bytes.len());
    let end = bytes
        .iter()
        .rposition(|b| !b.is_ascii_whitespace())
        .map_or(start, |p| p + 1);
    &bytes[start..end]
}
