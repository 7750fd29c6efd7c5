//! Replication status and its subscribers.
//!
//! The current [`StatusSnapshot`] lives in a `watch` channel so a subscriber
//! that attaches late still sees the last transition. Per-document failures
//! are fire-and-forget `broadcast` events: nobody listening means nobody hears.

use crate::config::Direction;
use crate::error::ReplicationError;
use revsync_protocol::RevId;
use std::fmt;
use std::sync::Arc;
use tokio::sync::{broadcast, watch};
use tracing::{info, warn};

const DOCUMENT_ERROR_CAPACITY: usize = 256;

/// Lifecycle state of a replicator.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum ReplicationStatus {
    /// Not running.
    #[default]
    Stopped,
    /// Connecting and loading checkpoints.
    Starting,
    /// Caught up, waiting for new changes.
    Idle,
    /// Transferring revisions.
    Active,
    /// The remote is unreachable; work resumes when it comes back.
    Offline,
    /// Winding down in-flight batches.
    Stopping,
    /// Stopped by a non-retryable failure.
    Error,
}

impl ReplicationStatus {
    /// Returns true while workers may be running.
    pub fn is_running(self) -> bool {
        matches!(
            self,
            Self::Starting | Self::Idle | Self::Active | Self::Offline
        )
    }

    /// Returns true once the replicator has come to rest.
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Stopped | Self::Error)
    }
}

impl fmt::Display for ReplicationStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Stopped => "stopped",
            Self::Starting => "starting",
            Self::Idle => "idle",
            Self::Active => "active",
            Self::Offline => "offline",
            Self::Stopping => "stopping",
            Self::Error => "error",
        })
    }
}

/// Status plus progress counters.
#[derive(Debug, Clone, Default)]
pub struct StatusSnapshot {
    /// Current state.
    pub status: ReplicationStatus,
    /// Changes discovered so far.
    pub changes_count: u64,
    /// Changes fully processed so far.
    pub completed_changes_count: u64,
    /// Revisions accepted by the remote.
    pub docs_pushed: u64,
    /// Revisions inserted locally.
    pub docs_pulled: u64,
    /// Most recent session-level failure.
    pub last_error: Option<Arc<ReplicationError>>,
}

/// A failure confined to one document.
#[derive(Debug, Clone)]
pub struct DocumentError {
    /// Document ID.
    pub doc_id: String,
    /// Revision involved, if known.
    pub rev_id: Option<RevId>,
    /// Which side of the replication failed.
    pub direction: Direction,
    /// Cause.
    pub error: Arc<ReplicationError>,
}

impl DocumentError {
    /// Creates a document error.
    pub fn new(
        doc_id: impl Into<String>,
        rev_id: Option<RevId>,
        direction: Direction,
        error: ReplicationError,
    ) -> Self {
        Self {
            doc_id: doc_id.into(),
            rev_id,
            direction,
            error: Arc::new(error),
        }
    }
}

/// Publishes status changes and document errors.
#[derive(Debug)]
pub struct StatusHub {
    snapshot: watch::Sender<StatusSnapshot>,
    errors: broadcast::Sender<DocumentError>,
}

impl Default for StatusHub {
    fn default() -> Self {
        Self::new()
    }
}

impl StatusHub {
    /// Creates a hub in the `Stopped` state.
    pub fn new() -> Self {
        let (snapshot, _) = watch::channel(StatusSnapshot::default());
        let (errors, _) = broadcast::channel(DOCUMENT_ERROR_CAPACITY);
        Self { snapshot, errors }
    }

    /// Returns a copy of the current snapshot.
    pub fn snapshot(&self) -> StatusSnapshot {
        self.snapshot.borrow().clone()
    }

    /// Returns the current state.
    pub fn status(&self) -> ReplicationStatus {
        self.snapshot.borrow().status
    }

    /// Moves to `status`. Returns false if already there.
    pub fn set_status(&self, status: ReplicationStatus) -> bool {
        let mut from = status;
        let changed = self.snapshot.send_if_modified(|snapshot| {
            from = snapshot.status;
            if snapshot.status == status {
                return false;
            }
            snapshot.status = status;
            true
        });
        if changed {
            info!(%from, to = %status, "replication status changed");
        }
        changed
    }

    /// Counts newly discovered changes.
    pub fn add_changes(&self, count: u64) {
        if count > 0 {
            self.snapshot
                .send_modify(|snapshot| snapshot.changes_count += count);
        }
    }

    /// Counts processed changes, whatever their outcome.
    pub fn add_completed(&self, count: u64) {
        if count > 0 {
            self.snapshot.send_modify(|snapshot| {
                snapshot.completed_changes_count += count;
            });
        }
    }

    /// Counts revisions transferred in one direction.
    pub fn add_transferred(&self, direction: Direction, count: u64) {
        if count == 0 {
            return;
        }
        self.snapshot.send_modify(|snapshot| match direction {
            Direction::Push => snapshot.docs_pushed += count,
            _ => snapshot.docs_pulled += count,
        });
    }

    /// Records a session-level error.
    pub fn set_error(&self, error: ReplicationError) {
        self.snapshot
            .send_modify(|snapshot| snapshot.last_error = Some(Arc::new(error)));
    }

    /// Clears the last error.
    pub fn clear_error(&self) {
        self.snapshot.send_if_modified(|snapshot| snapshot.last_error.take().is_some());
    }

    /// Zeroes the progress counters for a new run.
    pub fn reset_counters(&self) {
        self.snapshot.send_modify(|snapshot| {
            snapshot.changes_count = 0;
            snapshot.completed_changes_count = 0;
            snapshot.docs_pushed = 0;
            snapshot.docs_pulled = 0;
        });
    }

    /// Logs a per-document failure and broadcasts it to listeners.
    pub fn report_document_error(&self, error: DocumentError) {
        warn!(
            doc_id = %error.doc_id,
            rev_id = ?error.rev_id.as_ref().map(ToString::to_string),
            direction = ?error.direction,
            error = %error.error,
            "document failed to replicate"
        );
        // No receivers is fine.
        let _ = self.errors.send(error);
    }

    /// Subscribes to snapshots. The current snapshot is visible immediately.
    pub fn subscribe(&self) -> watch::Receiver<StatusSnapshot> {
        self.snapshot.subscribe()
    }

    /// Subscribes to document errors reported from now on.
    pub fn subscribe_errors(&self) -> broadcast::Receiver<DocumentError> {
        self.errors.subscribe()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn late_subscriber_sees_last_status() {
        let hub = StatusHub::new();
        assert!(hub.set_status(ReplicationStatus::Starting));
        assert!(hub.set_status(ReplicationStatus::Active));
        assert!(!hub.set_status(ReplicationStatus::Active));

        let rx = hub.subscribe();
        assert_eq!(rx.borrow().status, ReplicationStatus::Active);
        assert!(rx.borrow().status.is_running());
        assert!(!ReplicationStatus::Stopped.is_running());
    }

    #[test]
    fn counters() {
        let hub = StatusHub::new();
        hub.add_changes(5);
        hub.add_completed(3);
        hub.add_transferred(Direction::Push, 2);
        hub.add_transferred(Direction::Pull, 1);
        let snapshot = hub.snapshot();
        assert_eq!(snapshot.changes_count, 5);
        assert_eq!(snapshot.completed_changes_count, 3);
        assert_eq!(snapshot.docs_pushed, 2);
        assert_eq!(snapshot.docs_pulled, 1);

        hub.reset_counters();
        assert_eq!(hub.snapshot().changes_count, 0);
    }

    #[test]
    fn errors() {
        let hub = StatusHub::new();
        // Reporting without listeners is not an error.
        hub.report_document_error(DocumentError::new(
            "a",
            None,
            Direction::Pull,
            ReplicationError::Protocol("bad".into()),
        ));

        let mut rx = hub.subscribe_errors();
        hub.report_document_error(DocumentError::new(
            "b",
            None,
            Direction::Push,
            ReplicationError::Protocol("bad".into()),
        ));
        assert_eq!(rx.try_recv().unwrap().doc_id, "b");

        hub.set_error(ReplicationError::NotConnected);
        assert!(hub.snapshot().last_error.is_some());
        hub.clear_error();
        assert!(hub.snapshot().last_error.is_none());
    }

    #[tokio::test]
    async fn subscribers_wake_on_transition() {
        let hub = Arc::new(StatusHub::new());
        let mut rx = hub.subscribe();
        let waiter = tokio::spawn(async move {
            rx.wait_for(|s| s.status == ReplicationStatus::Idle)
                .await
                .map(|s| s.status)
        });
        hub.set_status(ReplicationStatus::Starting);
        hub.set_status(ReplicationStatus::Idle);
        assert_eq!(waiter.await.unwrap().unwrap(), ReplicationStatus::Idle);
    }
}
