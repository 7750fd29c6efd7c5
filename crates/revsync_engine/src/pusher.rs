//! Pushes local revisions the remote does not have.

use crate::backoff::Backoff;
use crate::checkpoint::CheckpointManager;
use crate::config::{Direction, ReplicatorConfig};
use crate::coordinator::WorkerEvent;
use crate::error::{ReplicationError, ReplicationResult};
use crate::remote::RemoteDatabase;
use crate::status::{DocumentError, StatusHub};
use revsync_protocol::{
    AttachmentBody, ChangeEntry, DocumentBody, RevId, Revision, RevsDiffRequest,
};
use revsync_store::{RevisionStore, StoreError};
use std::collections::BTreeMap;
use std::future::Future;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace, warn};

/// Scans local changes in sequence order and uploads what the remote lacks.
///
/// `lastSequencePushed` advances only after the remote acknowledged a batch,
/// so an interrupted push resumes from the last acknowledged boundary.
pub struct Pusher {
    store: Arc<dyn RevisionStore>,
    remote: Arc<RemoteDatabase>,
    config: Arc<ReplicatorConfig>,
    checkpoints: Arc<CheckpointManager>,
    status: Arc<StatusHub>,
    events: mpsc::UnboundedSender<WorkerEvent>,
    cancel: CancellationToken,
}

impl Pusher {
    /// Creates a pusher.
    pub fn new(
        store: Arc<dyn RevisionStore>,
        remote: Arc<RemoteDatabase>,
        config: Arc<ReplicatorConfig>,
        checkpoints: Arc<CheckpointManager>,
        status: Arc<StatusHub>,
        events: mpsc::UnboundedSender<WorkerEvent>,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            store,
            remote,
            config,
            checkpoints,
            status,
            events,
            cancel,
        }
    }

    /// Runs until caught up (one-shot), cancellation, or an error that
    /// retrying will not fix.
    pub async fn run(self) -> ReplicationResult<()> {
        match self.run_inner().await {
            Err(ReplicationError::Cancelled) => Ok(()),
            other => other,
        }
    }

    async fn run_inner(&self) -> ReplicationResult<()> {
        let mut sequences = self.store.subscribe();
        let mut since = self.checkpoints.current().await.last_sequence_pushed;
        let mut backoff = Backoff::new(self.config.retry.clone());
        let mut attempts = 0;
        info!(since, "pusher started");

        loop {
            if self.cancel.is_cancelled() {
                return Err(ReplicationError::Cancelled);
            }
            sequences.borrow_and_update();
            let changes = self.store.changes_since(since, self.config.push_batch_size)?;
            let Some(batch_end) = changes.last().and_then(|c| c.sequence.as_number()) else {
                let _ = self.events.send(WorkerEvent::CaughtUp(Direction::Push));
                if !self.config.continuous {
                    return Ok(());
                }
                tokio::select! {
                    biased;
                    _ = self.cancel.cancelled() => return Err(ReplicationError::Cancelled),
                    changed = sequences.changed() => {
                        if changed.is_err() {
                            return Ok(());
                        }
                    }
                }
                continue;
            };

            let _ = self.events.send(WorkerEvent::Busy(Direction::Push));
            match self.push_batch(changes).await {
                Ok(()) => {
                    self.checkpoints.save_pushed(batch_end).await?;
                    since = batch_end;
                    attempts = 0;
                    backoff.reset();
                }
                Err(err) if !err.is_retryable() || matches!(err, ReplicationError::Cancelled) => {
                    return Err(err)
                }
                Err(err) if err.is_connectivity() => {
                    let delay = backoff.next_delay();
                    warn!(error = %err, ?delay, "push failed; remote unreachable");
                    let _ = self.events.send(WorkerEvent::Retrying {
                        direction: Direction::Push,
                        error: Arc::new(err),
                        delay,
                    });
                    if !Backoff::sleep(delay, &self.cancel).await {
                        return Err(ReplicationError::Cancelled);
                    }
                }
                Err(err) => {
                    attempts += 1;
                    if attempts >= self.config.retry.max_attempts {
                        return Err(err);
                    }
                    let delay = self.config.retry.delay_for_attempt(attempts);
                    warn!(error = %err, attempts, ?delay, "push batch failed; retrying");
                    if !Backoff::sleep(delay, &self.cancel).await {
                        return Err(ReplicationError::Cancelled);
                    }
                }
            }
        }
    }

    /// Uploads one batch. Returns once the remote answered for every document.
    async fn push_batch(&self, changes: Vec<ChangeEntry>) -> ReplicationResult<()> {
        let entries: Vec<ChangeEntry> = changes
            .into_iter()
            .filter(|c| self.config.allows(&c.doc_id))
            .collect();
        if entries.is_empty() {
            return Ok(());
        }
        self.status.add_changes(entries.len() as u64);

        let mut request = RevsDiffRequest::new();
        for entry in &entries {
            request
                .entry(entry.doc_id.clone())
                .or_default()
                .push(entry.rev_id.clone());
        }
        let diff = self.cancellable(self.remote.revs_diff(&request)).await?;

        let mut docs = Vec::new();
        let mut known = 0;
        for entry in &entries {
            let Some(found) = diff
                .get(&entry.doc_id)
                .filter(|found| found.missing.contains(&entry.rev_id))
            else {
                known += 1;
                continue;
            };
            let Some(revision) = self.store.get_revision(&entry.doc_id, &entry.rev_id)? else {
                // Purged since the scan.
                known += 1;
                continue;
            };
            let history = self.store.get_history(&entry.doc_id, &entry.rev_id)?;
            let attachments = self.attachment_bodies(&revision, &history, &found.possible_ancestors)?;
            docs.push(DocumentBody::from_revision(&revision, &history, attachments));
        }
        self.status.add_completed(known);
        debug!(
            scanned = entries.len(),
            missing = docs.len(),
            "remote revs_diff answered"
        );
        if docs.is_empty() {
            return Ok(());
        }

        let uploaded = docs.len() as u64;
        let rows = self.cancellable(self.remote.bulk_docs(docs)).await?;
        let mut accepted = 0;
        for row in rows {
            if row.is_ok() {
                trace!(doc_id = %row.id, "remote accepted revision");
                accepted += 1;
                continue;
            }
            self.status.report_document_error(DocumentError::new(
                row.id.clone(),
                row.rev.clone(),
                Direction::Push,
                ReplicationError::Rejected {
                    doc_id: row.id,
                    rev_id: row.rev,
                    error: row.error.unwrap_or_default(),
                    reason: row.reason.unwrap_or_default(),
                },
            ));
        }
        self.status.add_transferred(Direction::Push, accepted);
        self.status.add_completed(uploaded);
        Ok(())
    }

    /// Builds the `_attachments` block. Blobs the remote already holds
    /// through a shared ancestor go as stubs; the rest are inlined.
    fn attachment_bodies(
        &self,
        revision: &Revision,
        history: &[RevId],
        remote_ancestors: &[RevId],
    ) -> ReplicationResult<BTreeMap<String, AttachmentBody>> {
        let known_generation = remote_ancestors
            .iter()
            .filter(|a| history.contains(a))
            .map(RevId::generation)
            .max()
            .unwrap_or(0);

        let mut bodies = BTreeMap::new();
        for attachment in &revision.attachments {
            let body = if attachment.revpos <= known_generation {
                AttachmentBody::stub(attachment)
            } else {
                let data = self
                    .store
                    .get_attachment(&attachment.digest)?
                    .ok_or_else(|| StoreError::BlobMissing {
                        digest: attachment.digest.clone(),
                    })?;
                AttachmentBody::inline(attachment, &data)
            };
            bodies.insert(attachment.name.clone(), body);
        }
        Ok(bodies)
    }

    async fn cancellable<T>(
        &self,
        future: impl Future<Output = ReplicationResult<T>>,
    ) -> ReplicationResult<T> {
        tokio::select! {
            biased;
            _ = self.cancel.cancelled() => Err(ReplicationError::Cancelled),
            result = future => result,
        }
    }
}
