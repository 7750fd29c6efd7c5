//! Applies a conflict resolver to the store.

use crate::error::ReplicationResult;
use revsync_protocol::{Conflict, ConflictResolver, ResolveError, Revision};
use revsync_store::{RevisionStore, StoreError};
use tracing::{debug, info};

/// Attempts before a conflict that keeps changing under us is deferred.
const MAX_RESOLVE_ATTEMPTS: usize = 3;

/// What happened to a conflict.
#[derive(Debug, Clone, PartialEq)]
pub enum ResolveOutcome {
    /// The resolution was applied; this is the new current revision.
    Resolved(Revision),
    /// The resolver failed; both leaves stay live until the next pass.
    Deferred(ResolveError),
    /// Another writer resolved the conflict first.
    Vanished,
}

/// Resolves `conflict` and applies the outcome.
///
/// If another writer changed the leaves in between, the fresh conflict is
/// resolved instead. Store failures other than a stale resolution propagate.
pub fn resolve_and_apply(
    store: &dyn RevisionStore,
    resolver: &dyn ConflictResolver,
    conflict: Conflict,
) -> ReplicationResult<ResolveOutcome> {
    let mut conflict = conflict;
    for _ in 0..MAX_RESOLVE_ATTEMPTS {
        let resolution = match resolver.resolve_guarded(&conflict) {
            Ok(resolution) => resolution,
            Err(err) => {
                debug!(doc_id = %conflict.doc_id, reason = %err.reason, "resolution deferred");
                return Ok(ResolveOutcome::Deferred(err));
            }
        };
        match store.resolve_conflict(&conflict, &resolution) {
            Ok(current) => {
                info!(
                    doc_id = %conflict.doc_id,
                    local = %conflict.local.rev_id,
                    remote = %conflict.remote.rev_id,
                    current = %current.rev_id,
                    "conflict resolved"
                );
                return Ok(ResolveOutcome::Resolved(current));
            }
            Err(StoreError::StaleResolution { .. }) => {
                match store.conflict_for(&conflict.doc_id)? {
                    Some(fresh) => conflict = fresh,
                    None => return Ok(ResolveOutcome::Vanished),
                }
            }
            Err(err) => return Err(err.into()),
        }
    }
    Ok(ResolveOutcome::Deferred(ResolveError::new(
        conflict.doc_id,
        "leaves kept changing during resolution",
    )))
}
