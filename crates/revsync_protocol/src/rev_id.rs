//! Revision identifiers.

use crate::error::{ProtocolError, ProtocolResult};
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use sha2::{Digest, Sha256};
use std::cmp::Ordering;
use std::fmt;
use std::str::FromStr;

/// A revision identifier of the form `<generation>-<digest>`.
///
/// Ordering is the winner ordering of the revision tree: higher generation
/// first, then the lexicographically greater digest. Two peers comparing the
/// same pair of IDs always agree.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct RevId {
    generation: u64,
    digest: String,
}

impl RevId {
    /// Creates a revision ID from its parts.
    pub fn new(generation: u64, digest: impl Into<String>) -> ProtocolResult<Self> {
        let digest = digest.into();
        if generation == 0 || digest.is_empty() || digest.contains('-') {
            return Err(ProtocolError::InvalidRevId(format!("{generation}-{digest}")));
        }
        Ok(Self { generation, digest })
    }

    /// Parses a `<generation>-<digest>` string.
    pub fn parse(s: &str) -> ProtocolResult<Self> {
        let (generation, digest) = s
            .split_once('-')
            .ok_or_else(|| ProtocolError::InvalidRevId(s.to_string()))?;
        let generation = generation
            .parse::<u64>()
            .map_err(|_| ProtocolError::InvalidRevId(s.to_string()))?;
        Self::new(generation, digest).map_err(|_| ProtocolError::InvalidRevId(s.to_string()))
    }

    /// Derives the ID for a new child of `parent`.
    ///
    /// The digest is a hash of the parent ID, the deletion flag and the
    /// canonical JSON of the properties, so identical edits made on two peers
    /// produce identical revision IDs.
    pub fn derive(
        parent: Option<&RevId>,
        deleted: bool,
        properties: &serde_json::Map<String, serde_json::Value>,
    ) -> Self {
        let mut hasher = Sha256::new();
        if let Some(parent) = parent {
            hasher.update(parent.to_string().as_bytes());
        }
        hasher.update([u8::from(deleted)]);
        // serde_json maps are sorted by key unless preserve_order is enabled.
        if let Ok(json) = serde_json::to_vec(properties) {
            hasher.update(&json);
        }
        let digest = hex::encode(&hasher.finalize()[..16]);
        Self {
            generation: parent.map_or(1, |p| p.generation + 1),
            digest,
        }
    }

    /// Returns the generation number.
    pub fn generation(&self) -> u64 {
        self.generation
    }

    /// Returns the digest suffix.
    pub fn digest(&self) -> &str {
        &self.digest
    }
}

impl Ord for RevId {
    fn cmp(&self, other: &Self) -> Ordering {
        self.generation
            .cmp(&other.generation)
            .then_with(|| self.digest.cmp(&other.digest))
    }
}

impl PartialOrd for RevId {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl fmt::Display for RevId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}-{}", self.generation, self.digest)
    }
}

impl FromStr for RevId {
    type Err = ProtocolError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

impl Serialize for RevId {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for RevId {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        RevId::parse(&s).map_err(serde::de::Error::custom)
    }
}
