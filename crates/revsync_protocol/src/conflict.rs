//! Conflict detection and resolution.

use crate::rev_id::RevId;
use crate::revision::{Properties, Revision};
use std::panic::{catch_unwind, AssertUnwindSafe};
use thiserror::Error;

/// Two competing leaves of the same document.
#[derive(Debug, Clone, PartialEq)]
pub struct Conflict {
    /// Document ID.
    pub doc_id: String,
    /// The current local leaf.
    pub local: Revision,
    /// The leaf that arrived from the remote.
    pub remote: Revision,
    /// Nearest revision both leaves descend from, when it is in the tree.
    pub common_ancestor: Option<RevId>,
}

impl Conflict {
    /// Creates a conflict.
    pub fn new(local: Revision, remote: Revision, common_ancestor: Option<RevId>) -> Self {
        Self {
            doc_id: local.doc_id.clone(),
            local,
            remote,
            common_ancestor,
        }
    }

    /// Returns the leaf the revision-tree ordering would pick.
    pub fn ranked_winner(&self) -> &Revision {
        if self.remote.rev_id > self.local.rev_id {
            &self.remote
        } else {
            &self.local
        }
    }

    /// Returns the leaf the revision-tree ordering would not pick.
    pub fn ranked_loser(&self) -> &Revision {
        if self.remote.rev_id > self.local.rev_id {
            &self.local
        } else {
            &self.remote
        }
    }
}

/// Outcome of resolving a conflict.
#[derive(Debug, Clone, PartialEq)]
pub enum Resolution {
    /// The local leaf stays current.
    KeepLocal,
    /// The remote leaf becomes current.
    AcceptRemote,
    /// A new revision with these properties becomes current.
    Merge(Properties),
    /// A tombstone becomes current.
    Delete,
}

/// A resolver refused or failed to decide; the conflict stays open.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("conflict resolution deferred for {doc_id}: {reason}")]
pub struct ResolveError {
    /// Document ID.
    pub doc_id: String,
    /// Why resolution did not happen.
    pub reason: String,
}

impl ResolveError {
    /// Creates a resolve error.
    pub fn new(doc_id: impl Into<String>, reason: impl Into<String>) -> Self {
        Self {
            doc_id: doc_id.into(),
            reason: reason.into(),
        }
    }
}

/// Policy deciding the winner of a conflict.
///
/// Both peers must reach the same answer for the same pair of leaves, so a
/// resolver should depend only on the revisions it is given.
pub trait ConflictResolver: Send + Sync {
    /// Resolves a conflict.
    fn resolve(&self, conflict: &Conflict) -> Result<Resolution, ResolveError>;

    /// Resolves, converting a panic inside the policy into a deferral.
    fn resolve_guarded(&self, conflict: &Conflict) -> Result<Resolution, ResolveError> {
        match catch_unwind(AssertUnwindSafe(|| self.resolve(conflict))) {
            Ok(result) => result,
            Err(_) => Err(ResolveError::new(&conflict.doc_id, "resolver panicked")),
        }
    }
}

/// Higher generation wins; ties go to the greater digest.
#[derive(Debug, Clone, Copy, Default)]
pub struct DefaultResolver;

impl ConflictResolver for DefaultResolver {
    fn resolve(&self, conflict: &Conflict) -> Result<Resolution, ResolveError> {
        if conflict.remote.rev_id > conflict.local.rev_id {
            Ok(Resolution::AcceptRemote)
        } else {
            Ok(Resolution::KeepLocal)
        }
    }
}

/// Adapts a closure into a [`ConflictResolver`].
pub struct ResolverFn<F>(pub F);

impl<F> ConflictResolver for ResolverFn<F>
where
    F: Fn(&Conflict) -> Result<Resolution, ResolveError> + Send + Sync,
{
    fn resolve(&self, conflict: &Conflict) -> Result<Resolution, ResolveError> {
        (self.0)(conflict)
    }
}
