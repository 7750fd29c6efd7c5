//! Helpers shared by the replication scenarios.

#![allow(dead_code)]

use revsync_engine::{Replicator, ReplicatorConfig, StatusSnapshot};
use revsync_protocol::{Checkpoint, Properties};
use revsync_store::{MemoryRevisionStore, RevisionStore};
use revsync_testkit::prelude::*;
use std::sync::Arc;
use std::time::Duration;

/// Upper bound for any scenario step.
pub const TIMEOUT: Duration = Duration::from_secs(10);

pub fn replicator(
    local: &Arc<MemoryRevisionStore>,
    remote: &MemoryRemote,
    config: ReplicatorConfig,
) -> Replicator {
    init_tracing();
    Replicator::builder(local.clone(), Arc::new(remote.clone()), config)
        .build()
        .expect("valid configuration")
}

/// Runs a one-shot replication to its end and returns the final snapshot.
pub async fn run_to_end(replicator: &Replicator) -> StatusSnapshot {
    replicator.start().expect("start");
    let snapshot = tokio::time::timeout(
        TIMEOUT,
        replicator.wait_for(|s| s.status.is_terminal()),
    )
    .await
    .expect("replication did not finish");
    replicator.stop().await;
    snapshot
}

/// Waits until the replicator reports a state matching `predicate`.
pub async fn wait_status(
    replicator: &Replicator,
    predicate: impl FnMut(&StatusSnapshot) -> bool,
) -> StatusSnapshot {
    tokio::time::timeout(TIMEOUT, replicator.wait_for(predicate))
        .await
        .expect("status never reached")
}

/// Polls `check` until it holds.
pub async fn eventually(what: &str, mut check: impl FnMut() -> bool) {
    let deadline = tokio::time::Instant::now() + TIMEOUT;
    while !check() {
        assert!(tokio::time::Instant::now() < deadline, "timed out waiting for {what}");
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}

/// The local copy of the replication's checkpoint.
pub fn local_checkpoint(local: &MemoryRevisionStore, replicator: &Replicator) -> Checkpoint {
    local
        .get_checkpoint(&replicator.checkpoint_id())
        .expect("read checkpoint")
        .unwrap_or_default()
}

/// Creates `count` documents named `{prefix}{i}`.
pub fn seed(store: &dyn RevisionStore, prefix: &str, count: usize) {
    for i in 0..count {
        let mut properties = Properties::new();
        properties.insert("n".into(), i.into());
        put_doc(store, &format!("{prefix}{i}"), properties);
    }
}

/// Copies a document's current revision, with its history, into `target`.
pub fn copy_current(source: &MemoryRevisionStore, target: &MemoryRevisionStore, doc_id: &str) {
    let doc = source
        .get_document(doc_id)
        .expect("read document")
        .expect("document exists");
    let history = source
        .get_history(doc_id, &doc.current.rev_id)
        .expect("read history");
    target
        .force_insert(doc.current, &history)
        .expect("insert revision");
}

pub fn has_doc(store: &MemoryRevisionStore, doc_id: &str) -> bool {
    store
        .get_document(doc_id)
        .expect("read document")
        .is_some_and(|doc| !doc.current.deleted)
}
