//! Bidirectional and continuous replication scenarios.

mod common;

use common::*;
use proptest::prelude::*;
use revsync_engine::{
    CredentialStore, Credentials, Direction, FeedMode, ReplicationError, ReplicationStatus,
    Replicator, StoredCredentials,
};
use revsync_protocol::{Conflict, Resolution, ResolveError, ResolverFn, PROTOCOL_VERSION};
use revsync_store::{MemoryRevisionStore, RevisionStore};
use revsync_testkit::prelude::*;
use serde_json::json;
use std::sync::Arc;

#[tokio::test]
async fn concurrent_edits_pick_the_same_winner_on_both_sides() {
    let remote = MemoryRemote::new("db");
    let local = local_store("local");
    let remote_store = remote.store();
    insert_branch(&*local, "doc", &["1-x"], props(json!({})));
    insert_branch(&*remote_store, "doc", &["1-x"], props(json!({})));
    insert_branch(&*local, "doc", &["2-a", "1-x"], props(json!({"by": "local"})));
    insert_branch(&*remote_store, "doc", &["2-b", "1-x"], props(json!({"by": "remote"})));
    let replicator = replicator(
        &local,
        &remote,
        test_config(remote.endpoint(), Direction::PushAndPull),
    );

    run_to_end(&replicator).await;
    run_to_end(&replicator).await;

    for store in [&local, &remote_store] {
        let doc = store.get_document("doc").unwrap().unwrap();
        assert_eq!(doc.current.rev_id, rev("2-b"));
        assert_eq!(doc.current.properties["by"], "remote");
        assert!(!doc.is_conflicted());
    }
    assert_converged(&local, &remote_store);
}

/// A push-and-pull replicator whose resolver always keeps the local edit.
fn insisting(local: &Arc<MemoryRevisionStore>, remote: &MemoryRemote) -> Replicator {
    init_tracing();
    Replicator::builder(
        local.clone(),
        Arc::new(remote.clone()),
        test_config(remote.endpoint(), Direction::PushAndPull),
    )
    .resolver(Arc::new(ResolverFn(
        |_: &Conflict| -> Result<Resolution, ResolveError> { Ok(Resolution::KeepLocal) },
    )))
    .build()
    .unwrap()
}

#[tokio::test]
async fn peers_that_each_keep_their_own_edit_lose_nothing() {
    let remote = MemoryRemote::new("db");
    let first = local_store("first");
    let second = local_store("second");
    for store in [&first, &second, &remote.store()] {
        insert_branch(&**store, "doc", &["1-x"], props(json!({})));
    }
    insert_branch(&*first, "doc", &["2-a", "1-x"], props(json!({"by": "first"})));
    insert_branch(&*second, "doc", &["2-b", "1-x"], props(json!({"by": "second"})));
    let one = insisting(&first, &remote);
    let two = insisting(&second, &remote);

    for replicator in [&one, &two, &one, &two, &one, &two] {
        let snapshot = run_to_end(replicator).await;
        assert_eq!(snapshot.status, ReplicationStatus::Stopped);
    }

    assert_converged(&first, &second);
    assert_converged(&first, &remote.store());
    for store in [&first, &second] {
        let doc = store.get_document("doc").unwrap().unwrap();
        assert!(!doc.is_deleted());
        assert!(!doc.is_conflicted());
        for (rev_id, by) in [("2-a", "first"), ("2-b", "second")] {
            let edit = store.get_revision("doc", &rev(rev_id)).unwrap().unwrap();
            assert_eq!(edit.properties["by"], by);
        }
    }
}

#[tokio::test]
async fn deferred_conflicts_are_retried_on_the_next_start() {
    let remote = MemoryRemote::new("db");
    let local = local_store("local");
    let remote_store = remote.store();
    insert_branch(&*local, "doc", &["1-x"], props(json!({})));
    insert_branch(&*remote_store, "doc", &["1-x"], props(json!({})));
    insert_branch(&*local, "doc", &["2-a", "1-x"], props(json!({})));
    insert_branch(&*remote_store, "doc", &["2-b", "1-x"], props(json!({})));
    let config = test_config(remote.endpoint(), Direction::Pull);

    init_tracing();
    let undecided = Replicator::builder(local.clone(), Arc::new(remote.clone()), config.clone())
        .resolver(Arc::new(ResolverFn(
            |conflict: &Conflict| -> Result<Resolution, ResolveError> {
                Err(ResolveError::new(&conflict.doc_id, "needs a human"))
            },
        )))
        .build()
        .unwrap();
    let mut errors = undecided.document_errors();
    let snapshot = run_to_end(&undecided).await;

    assert_eq!(snapshot.status, ReplicationStatus::Stopped);
    assert_eq!(local.conflicted_documents().unwrap(), vec!["doc".to_string()]);
    let deferred = errors.try_recv().unwrap();
    assert!(matches!(*deferred.error, ReplicationError::ConflictDeferred(_)));

    let decided = replicator(&local, &remote, config);
    run_to_end(&decided).await;

    assert!(local.conflicted_documents().unwrap().is_empty());
    let doc = local.get_document("doc").unwrap().unwrap();
    assert_eq!(doc.current.rev_id, rev("2-b"));
}

#[tokio::test]
async fn continuous_replication_carries_new_edits_both_ways() {
    for mode in [FeedMode::LongPoll, FeedMode::Continuous, FeedMode::Normal] {
        let remote = MemoryRemote::new("db");
        let local = local_store("local");
        put_doc(&*local, "early", props(json!({})));
        let config = test_config(remote.endpoint(), Direction::PushAndPull)
            .with_continuous(true)
            .with_feed_mode(mode);
        let replicator = replicator(&local, &remote, config);

        replicator.start().unwrap();
        wait_status(&replicator, |s| s.status == ReplicationStatus::Idle).await;
        assert!(has_doc(&remote.store(), "early"));

        put_doc(&*local, "from_local", props(json!({})));
        put_doc(&*remote.store(), "from_remote", props(json!({})));
        eventually("edits to cross over", || {
            has_doc(&remote.store(), "from_local") && has_doc(&local, "from_remote")
        })
        .await;
        wait_status(&replicator, |s| s.status == ReplicationStatus::Idle).await;

        replicator.stop().await;
        assert_eq!(replicator.status().status, ReplicationStatus::Stopped);
        assert_converged(&local, &remote.store());
    }
}

#[tokio::test]
async fn unreachable_remote_goes_offline_and_recovers() {
    let remote = MemoryRemote::new("db");
    let local = local_store("local");
    let config = test_config(remote.endpoint(), Direction::Pull).with_continuous(true);
    let replicator = replicator(&local, &remote, config);

    replicator.start().unwrap();
    wait_status(&replicator, |s| s.status == ReplicationStatus::Idle).await;

    remote.set_offline(true);
    let offline = wait_status(&replicator, |s| s.status == ReplicationStatus::Offline).await;
    assert!(offline.last_error.is_none() || offline.last_error.unwrap().is_connectivity());

    put_doc(&*remote.store(), "while_away", props(json!({})));
    remote.set_offline(false);
    eventually("the missed edit", || has_doc(&local, "while_away")).await;
    wait_status(&replicator, |s| s.status == ReplicationStatus::Idle).await;

    replicator.stop().await;
}

#[tokio::test]
async fn host_reachability_suspends_and_resumes() {
    let remote = MemoryRemote::new("db");
    let local = local_store("local");
    let config = test_config(remote.endpoint(), Direction::PushAndPull).with_continuous(true);
    let replicator = replicator(&local, &remote, config);

    replicator.start().unwrap();
    wait_status(&replicator, |s| s.status == ReplicationStatus::Idle).await;

    replicator.set_reachable(false);
    wait_status(&replicator, |s| s.status == ReplicationStatus::Offline).await;
    put_doc(&*local, "queued", props(json!({})));

    replicator.set_reachable(true);
    eventually("the queued edit", || has_doc(&remote.store(), "queued")).await;
    wait_status(&replicator, |s| s.status == ReplicationStatus::Idle).await;

    replicator.stop().await;
    assert_eq!(replicator.status().status, ReplicationStatus::Stopped);
}

#[tokio::test]
async fn expired_credentials_are_refreshed_once() {
    let remote = MemoryRemote::new("db");
    let fresh = Credentials::Bearer("fresh".into());
    remote.require_credentials(Some(&fresh));
    put_doc(&*remote.store(), "private", props(json!({})));

    let credentials = Arc::new(CredentialStore::new());
    credentials.set("remote.test", Credentials::Bearer("expired".into()));
    credentials.set_refresher(Arc::new(move |_: &str| Some(fresh.clone())));
    let local = local_store("local");
    init_tracing();
    let replicator = Replicator::builder(
        local.clone(),
        Arc::new(remote.clone()),
        test_config(remote.endpoint(), Direction::Pull),
    )
    .authenticator(Arc::new(StoredCredentials::new(
        Arc::clone(&credentials),
        "remote.test",
    )))
    .build()
    .unwrap();

    let snapshot = run_to_end(&replicator).await;

    assert_eq!(snapshot.status, ReplicationStatus::Stopped);
    assert!(has_doc(&local, "private"));
    assert_eq!(credentials.get("remote.test"), Some(Credentials::Bearer("fresh".into())));
}

#[tokio::test]
async fn incompatible_remote_stops_in_error() {
    let remote = MemoryRemote::new("db");
    remote.set_protocol_version(Some(PROTOCOL_VERSION + 1));
    let local = local_store("local");
    let replicator = replicator(
        &local,
        &remote,
        test_config(remote.endpoint(), Direction::PushAndPull),
    );

    let snapshot = run_to_end(&replicator).await;

    assert_eq!(snapshot.status, ReplicationStatus::Error);
    assert!(matches!(
        snapshot.last_error.as_deref(),
        Some(ReplicationError::VersionMismatch { .. })
    ));
    assert_eq!(remote.request_count(Route::Changes), 0);
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(12))]

    #[test]
    fn independent_edits_converge(local_edits in edits(12), remote_edits in edits(12)) {
        let runtime = tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()
            .unwrap();
        runtime.block_on(async {
            let remote = MemoryRemote::new("db");
            let local = local_store("local");
            apply_edits(&*local, &local_edits);
            apply_edits(&*remote.store(), &remote_edits);
            let replicator = replicator(
                &local,
                &remote,
                test_config(remote.endpoint(), Direction::PushAndPull),
            );

            // The first run may create resolution revisions locally; the
            // second carries them over.
            run_to_end(&replicator).await;
            run_to_end(&replicator).await;

            assert_converged(&local, &remote.store());
        });
    }
}
