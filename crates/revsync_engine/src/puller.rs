//! Pulls remote revisions into the local store.

use crate::backoff::Backoff;
use crate::change_tracker::TrackerEvent;
use crate::checkpoint::CheckpointManager;
use crate::config::{AttachmentMode, Direction, ReplicatorConfig};
use crate::coordinator::WorkerEvent;
use crate::error::{ReplicationError, ReplicationResult};
use crate::pending::PendingSequences;
use crate::remote::RemoteDatabase;
use crate::resolution::{resolve_and_apply, ResolveOutcome};
use crate::status::{DocumentError, StatusHub};
use revsync_protocol::{
    BulkGetRef, BulkGetResult, ChangeEntry, ConflictResolver, DocumentBody, RemoteSeq, RevId,
    RevsDiffRequest,
};
use revsync_store::{InsertOutcome, RevisionStore};
use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace, warn};

/// A change waiting to be applied, with its checkpoint ticket.
#[derive(Debug)]
struct Item {
    entry: ChangeEntry,
    ticket: u64,
}

type Fetched = Option<ReplicationResult<DocumentBody>>;

/// Everything a pull worker shares with the rest of the replication.
#[derive(Clone)]
pub struct PullContext {
    /// Local database.
    pub store: Arc<dyn RevisionStore>,
    /// Remote database.
    pub remote: Arc<RemoteDatabase>,
    /// Replication settings.
    pub config: Arc<ReplicatorConfig>,
    /// Conflict policy.
    pub resolver: Arc<dyn ConflictResolver>,
    /// Checkpoint persistence.
    pub checkpoints: Arc<CheckpointManager>,
    /// Status and error reporting.
    pub status: Arc<StatusHub>,
}

/// Consumes tracker output and applies remote revisions locally.
///
/// Entries are batched by size and delay. Revisions already in the local
/// tree are skipped; the rest are fetched, with `_bulk_get` when the remote
/// supports it, and force-inserted together with their history. A revision
/// is complete only once every attachment blob it references is stored.
pub struct Puller {
    ctx: PullContext,
    input: mpsc::Receiver<TrackerEvent>,
    events: mpsc::UnboundedSender<WorkerEvent>,
    cancel: CancellationToken,
    pending: PendingSequences,
    backoff: Backoff,
}

impl Puller {
    /// Creates a puller.
    pub fn new(
        ctx: PullContext,
        input: mpsc::Receiver<TrackerEvent>,
        events: mpsc::UnboundedSender<WorkerEvent>,
        cancel: CancellationToken,
    ) -> Self {
        let backoff = Backoff::new(ctx.config.retry.clone());
        Self {
            ctx,
            input,
            events,
            cancel,
            pending: PendingSequences::new(),
            backoff,
        }
    }

    /// Runs until the tracker closes its channel, cancellation, or a fatal error.
    pub async fn run(mut self) -> ReplicationResult<()> {
        match self.run_inner().await {
            Err(ReplicationError::Cancelled) => {
                debug!(in_flight = self.pending.len(), "puller cancelled");
                Ok(())
            }
            other => other,
        }
    }

    async fn run_inner(&mut self) -> ReplicationResult<()> {
        loop {
            let (entries, caught_up, closed) = self.next_batch().await;
            if self.cancel.is_cancelled() {
                return Err(ReplicationError::Cancelled);
            }
            if !entries.is_empty() {
                let _ = self.events.send(WorkerEvent::Busy(Direction::Pull));
                self.process(entries).await?;
            }
            if let Some(sequence) = caught_up {
                if let Some(sequence) = sequence.and_then(|s| self.pending.advance_idle(s)) {
                    self.ctx.checkpoints.save_pulled(sequence).await?;
                }
                let _ = self.events.send(WorkerEvent::CaughtUp(Direction::Pull));
            }
            if closed {
                return Ok(());
            }
        }
    }

    /// Waits for entries, then keeps collecting until the batch is full, the
    /// batch delay passes, or the feed reports it is caught up.
    async fn next_batch(&mut self) -> (Vec<ChangeEntry>, Option<Option<RemoteSeq>>, bool) {
        let mut entries = Vec::new();
        let mut caught_up = None;

        let first = tokio::select! {
            biased;
            _ = self.cancel.cancelled() => return (entries, None, true),
            event = self.input.recv() => event,
        };
        match first {
            None => return (entries, None, true),
            Some(TrackerEvent::Changes(batch)) => entries.extend(batch),
            Some(TrackerEvent::CaughtUp(sequence)) => return (entries, Some(sequence), false),
        }

        let deadline = Instant::now() + self.ctx.config.pull_batch_delay;
        while entries.len() < self.ctx.config.pull_batch_size {
            let event = tokio::select! {
                biased;
                _ = self.cancel.cancelled() => break,
                _ = tokio::time::sleep_until(deadline) => break,
                event = self.input.recv() => event,
            };
            match event {
                None => return (entries, caught_up, true),
                Some(TrackerEvent::Changes(batch)) => entries.extend(batch),
                Some(TrackerEvent::CaughtUp(sequence)) => {
                    caught_up = Some(sequence);
                    break;
                }
            }
        }
        (entries, caught_up, false)
    }

    async fn process(&mut self, entries: Vec<ChangeEntry>) -> ReplicationResult<()> {
        self.ctx.status.add_changes(entries.len() as u64);
        let items: Vec<Item> = entries
            .into_iter()
            .map(|entry| {
                let ticket = self.pending.add(entry.sequence.clone());
                Item { entry, ticket }
            })
            .collect();

        let missing = self.skip_known(items).await?;
        debug!(missing = missing.len(), "fetching revisions");
        for chunk in missing.chunks(self.ctx.config.max_revs_per_bulk_get) {
            let prefetched = self.prefetch(chunk).await?;
            for (item, fetched) in chunk.iter().zip(prefetched) {
                if self.cancel.is_cancelled() {
                    return Err(ReplicationError::Cancelled);
                }
                self.pull_one(item, fetched).await?;
            }
        }
        Ok(())
    }

    /// Completes entries the local tree already holds and returns the rest,
    /// annotated with the leaves the remote may use as attachment bases.
    async fn skip_known(&mut self, items: Vec<Item>) -> ReplicationResult<Vec<Item>> {
        let mut request = RevsDiffRequest::new();
        for item in &items {
            request
                .entry(item.entry.doc_id.clone())
                .or_default()
                .push(item.entry.rev_id.clone());
        }
        let diff = self.ctx.store.revs_diff(&request)?;

        let mut missing = Vec::with_capacity(items.len());
        for mut item in items {
            match diff.get(&item.entry.doc_id) {
                Some(found) if found.missing.contains(&item.entry.rev_id) => {
                    if item.entry.possible_ancestors.is_empty() {
                        item.entry.possible_ancestors = found.possible_ancestors.clone();
                    }
                    missing.push(item);
                }
                _ => {
                    trace!(doc_id = %item.entry.doc_id, rev_id = %item.entry.rev_id, "already present");
                    self.complete(item.ticket).await?;
                }
            }
        }
        Ok(missing)
    }

    /// Fetches a chunk with one `_bulk_get`. `None` slots are fetched singly.
    async fn prefetch(&self, chunk: &[Item]) -> ReplicationResult<Vec<Fetched>> {
        let mut slots: Vec<Fetched> = chunk.iter().map(|_| None).collect();
        if chunk.len() < 2 || !self.ctx.remote.supports_bulk_get() {
            return Ok(slots);
        }
        let refs = chunk
            .iter()
            .map(|item| BulkGetRef {
                id: item.entry.doc_id.clone(),
                rev: item.entry.rev_id.clone(),
                atts_since: item.entry.possible_ancestors.clone(),
            })
            .collect();
        let results = match self
            .cancellable(self.ctx.remote.bulk_get(refs, self.eager()))
            .await
        {
            Ok(Some(results)) => results,
            Ok(None) => return Ok(slots),
            Err(err) if err.is_fatal() || matches!(err, ReplicationError::Cancelled) => {
                return Err(err)
            }
            Err(err) => {
                debug!(error = %err, "bulk fetch failed; fetching one by one");
                return Ok(slots);
            }
        };

        let mut by_rev = split_bulk_results(results);
        for (slot, item) in slots.iter_mut().zip(chunk) {
            *slot = by_rev.remove(&(item.entry.doc_id.clone(), item.entry.rev_id.clone()));
        }
        Ok(slots)
    }

    /// Fetches and applies one revision, retrying per-revision failures.
    async fn pull_one(&mut self, item: &Item, mut fetched: Fetched) -> ReplicationResult<()> {
        let entry = &item.entry;
        let mut attempts = 0;
        loop {
            let body = match fetched.take() {
                Some(body) => body,
                None => self.fetch(entry).await,
            };
            let result = match body {
                Ok(body) => self.apply(entry, body).await,
                Err(err) => Err(err),
            };
            let err = match result {
                Ok(()) => {
                    self.backoff.reset();
                    return self.complete(item.ticket).await;
                }
                Err(err) if err.is_fatal() || matches!(err, ReplicationError::Cancelled) => {
                    return Err(err)
                }
                Err(err) => err,
            };

            if err.is_connectivity() {
                // The peer is unreachable; that is not this document's fault.
                let delay = self.backoff.next_delay();
                warn!(doc_id = %entry.doc_id, error = %err, ?delay, "remote unreachable; waiting");
                let _ = self.events.send(WorkerEvent::Retrying {
                    direction: Direction::Pull,
                    error: Arc::new(err),
                    delay,
                });
                if !Backoff::sleep(delay, &self.cancel).await {
                    return Err(ReplicationError::Cancelled);
                }
                continue;
            }

            attempts += 1;
            if attempts >= self.ctx.config.max_fetch_attempts {
                // The entry stays pending, so the checkpoint cannot pass it.
                self.ctx.status.add_completed(1);
                self.ctx.status.report_document_error(DocumentError::new(
                    &entry.doc_id,
                    Some(entry.rev_id.clone()),
                    Direction::Pull,
                    ReplicationError::FetchFailed {
                        doc_id: entry.doc_id.clone(),
                        rev_id: entry.rev_id.clone(),
                        attempts,
                        reason: err.to_string(),
                    },
                ));
                return Ok(());
            }
            let delay = self.ctx.config.retry.delay_for_attempt(attempts);
            debug!(doc_id = %entry.doc_id, rev_id = %entry.rev_id, attempts, error = %err, "retrying revision");
            if !Backoff::sleep(delay, &self.cancel).await {
                return Err(ReplicationError::Cancelled);
            }
        }
    }

    async fn fetch(&self, entry: &ChangeEntry) -> ReplicationResult<DocumentBody> {
        self.cancellable(self.ctx.remote.get_revision(
            &entry.doc_id,
            &entry.rev_id,
            &entry.possible_ancestors,
            self.eager(),
        ))
        .await
    }

    /// Stores the blobs of a fetched revision, then the revision itself.
    async fn apply(&self, entry: &ChangeEntry, body: DocumentBody) -> ReplicationResult<()> {
        if body.id != entry.doc_id || body.rev != entry.rev_id {
            return Err(ReplicationError::Protocol(format!(
                "asked for {} {}, got {} {}",
                entry.doc_id, entry.rev_id, body.id, body.rev
            )));
        }
        let (revision, history, blobs) = body.into_revision()?;
        for (digest, data) in blobs {
            self.ctx.store.put_attachment(&digest, data)?;
        }
        for attachment in &revision.attachments {
            if self.ctx.store.has_attachment(&attachment.digest) {
                continue;
            }
            trace!(doc_id = %revision.doc_id, name = %attachment.name, "downloading attachment");
            let data = self
                .cancellable(self.ctx.remote.get_attachment(
                    &revision.doc_id,
                    &revision.rev_id,
                    &attachment.name,
                ))
                .await?;
            self.ctx.store.put_attachment(&attachment.digest, data.to_vec())?;
        }

        match self.ctx.store.force_insert(revision, &history)? {
            InsertOutcome::AlreadyPresent => {
                trace!(doc_id = %entry.doc_id, rev_id = %entry.rev_id, "revision arrived meanwhile");
            }
            InsertOutcome::Inserted(revision) => {
                self.ctx.status.add_transferred(Direction::Pull, 1);
                debug!(doc_id = %revision.doc_id, rev_id = %revision.rev_id, seq = revision.sequence, "pulled revision");
            }
            InsertOutcome::Conflicted(conflict) => {
                self.ctx.status.add_transferred(Direction::Pull, 1);
                info!(
                    doc_id = %conflict.doc_id,
                    local = %conflict.local.rev_id,
                    remote = %conflict.remote.rev_id,
                    "pulled revision conflicts with local edit"
                );
                let outcome =
                    resolve_and_apply(&*self.ctx.store, &*self.ctx.resolver, conflict)?;
                if let ResolveOutcome::Deferred(err) = outcome {
                    self.ctx.status.report_document_error(DocumentError::new(
                        &entry.doc_id,
                        Some(entry.rev_id.clone()),
                        Direction::Pull,
                        err.into(),
                    ));
                }
            }
        }
        Ok(())
    }

    async fn complete(&mut self, ticket: u64) -> ReplicationResult<()> {
        self.ctx.status.add_completed(1);
        if let Some(sequence) = self.pending.complete(ticket) {
            self.ctx.checkpoints.save_pulled(sequence).await?;
        }
        Ok(())
    }

    fn eager(&self) -> bool {
        self.ctx.config.attachment_mode == AttachmentMode::Eager
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

/// Indexes `_bulk_get` results by (document, revision).
fn split_bulk_results(
    results: Vec<BulkGetResult>,
) -> HashMap<(String, RevId), ReplicationResult<DocumentBody>> {
    let mut by_rev = HashMap::new();
    for result in results {
        for doc in result.docs {
            match (doc.ok, doc.error) {
                (Some(body), _) => {
                    by_rev.insert((body.id.clone(), body.rev.clone()), Ok(body));
                }
                (None, Some(row)) => {
                    let Some(rev) = row.rev.clone() else {
                        continue;
                    };
                    let reason = format!(
                        "{}: {}",
                        row.error.as_deref().unwrap_or("error"),
                        row.reason.as_deref().unwrap_or("")
                    );
                    by_rev.insert((row.id, rev), Err(ReplicationError::Protocol(reason)));
                }
                (None, None) => {}
            }
        }
    }
    by_rev
}
