//! Checkpoint persistence for one replication.
//!
//! The checkpoint is kept in the local store and mirrored to the remote as a
//! `_local` document. Writes are serialized and only move forward.

use crate::error::{ReplicationError, ReplicationResult};
use crate::remote::RemoteDatabase;
use revsync_protocol::{checkpoint_id, Checkpoint, CheckpointDoc, CheckpointSettings, RemoteSeq};
use revsync_store::RevisionStore;
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

/// Loads and saves the checkpoint of one (local, remote, filter) triple.
pub struct CheckpointManager {
    store: Arc<dyn RevisionStore>,
    remote: Arc<RemoteDatabase>,
    id: String,
    state: Mutex<Checkpoint>,
}

impl std::fmt::Debug for CheckpointManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CheckpointManager")
            .field("id", &self.id)
            .finish_non_exhaustive()
    }
}

impl CheckpointManager {
    /// Creates a manager for the checkpoint identified by `settings`.
    pub fn new(
        store: Arc<dyn RevisionStore>,
        remote: Arc<RemoteDatabase>,
        settings: &CheckpointSettings,
    ) -> Self {
        Self {
            store,
            remote,
            id: checkpoint_id(settings),
            state: Mutex::new(Checkpoint::default()),
        }
    }

    /// Returns the checkpoint ID.
    pub fn id(&self) -> &str {
        &self.id
    }

    /// Returns the remote the checkpoint is mirrored to.
    pub fn remote(&self) -> &Arc<RemoteDatabase> {
        &self.remote
    }

    /// Returns the checkpoint as last loaded or saved.
    pub async fn current(&self) -> Checkpoint {
        self.state.lock().await.clone()
    }

    /// Reads both copies and returns the progress to resume from.
    ///
    /// If the local and remote copies disagree, replication starts over;
    /// revision inserts are idempotent so the only cost is bandwidth.
    pub async fn load(&self) -> ReplicationResult<Checkpoint> {
        let mut state = self.state.lock().await;
        let local = self.store.get_checkpoint(&self.id)?.unwrap_or_default();
        let remote = self.remote.get_checkpoint(&self.id).await?;

        let checkpoint = match remote {
            Some(doc) if local.matches(&doc) => Checkpoint {
                remote_token: doc.rev,
                ..local
            },
            Some(doc) => {
                info!(checkpoint = %self.id, "local and remote checkpoints differ; starting over");
                Checkpoint {
                    remote_token: doc.rev,
                    ..Checkpoint::default()
                }
            }
            None if local.is_empty() => local,
            None => {
                info!(checkpoint = %self.id, "remote checkpoint missing; starting over");
                Checkpoint::default()
            }
        };
        self.store.set_checkpoint(&self.id, &checkpoint)?;
        debug!(
            checkpoint = %self.id,
            pushed = checkpoint.last_sequence_pushed,
            pulled = ?checkpoint.last_sequence_pulled.as_ref().map(ToString::to_string),
            "checkpoint loaded"
        );
        *state = checkpoint.clone();
        Ok(checkpoint)
    }

    /// Records pull progress.
    pub async fn save_pulled(&self, sequence: RemoteSeq) -> ReplicationResult<()> {
        self.save(|checkpoint| {
            let behind = match (&checkpoint.last_sequence_pulled, sequence.as_number()) {
                (Some(current), Some(next)) => current.as_number().is_some_and(|c| next < c),
                _ => false,
            };
            if !behind {
                checkpoint.last_sequence_pulled = Some(sequence);
            }
        })
        .await
    }

    /// Records push progress.
    pub async fn save_pushed(&self, sequence: u64) -> ReplicationResult<()> {
        self.save(|checkpoint| {
            checkpoint.last_sequence_pushed = checkpoint.last_sequence_pushed.max(sequence);
        })
        .await
    }

    /// Forgets all progress locally. The remote copy then mismatches and is
    /// overwritten by the next save.
    pub async fn reset(&self) -> ReplicationResult<()> {
        let mut state = self.state.lock().await;
        self.store.reset_checkpoint(&self.id)?;
        *state = Checkpoint {
            remote_token: state.remote_token.take(),
            ..Checkpoint::default()
        };
        info!(checkpoint = %self.id, "checkpoint reset");
        Ok(())
    }

    async fn save(&self, update: impl FnOnce(&mut Checkpoint)) -> ReplicationResult<()> {
        let mut state = self.state.lock().await;
        let mut next = state.clone();
        update(&mut next);
        if next == *state {
            return Ok(());
        }
        self.store.set_checkpoint(&self.id, &next)?;
        *state = next;

        match self.push_remote(&state).await {
            Ok(token) => {
                state.remote_token = Some(token);
                self.store.set_checkpoint(&self.id, &state)?;
            }
            Err(err) => {
                warn!(checkpoint = %self.id, error = %err, "could not save remote checkpoint");
            }
        }
        Ok(())
    }

    async fn push_remote(&self, checkpoint: &Checkpoint) -> ReplicationResult<String> {
        let doc = CheckpointDoc::from_checkpoint(checkpoint);
        match self.remote.put_checkpoint(&self.id, &doc).await {
            Err(ReplicationError::Status { status: 409, .. }) => {
                debug!(checkpoint = %self.id, "remote checkpoint token is stale; refetching");
                let current = self.remote.get_checkpoint(&self.id).await?;
                let retry = CheckpointDoc {
                    rev: current.and_then(|d| d.rev),
                    ..doc
                };
                self.remote.put_checkpoint(&self.id, &retry).await
            }
            other => other,
        }
    }
}
