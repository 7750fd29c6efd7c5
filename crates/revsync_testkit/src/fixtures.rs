//! Test fixtures and store helpers.

use revsync_engine::{Direction, RemoteEndpoint, ReplicatorConfig, RetryConfig};
use revsync_protocol::{attachment_digest, AttachmentRef, Properties, RevId, Revision};
use revsync_store::{InsertOutcome, MemoryRevisionStore, RevisionStore};
use std::collections::BTreeMap;
use std::sync::{Arc, Once};
use std::time::Duration;

static TRACING: Once = Once::new();

/// Installs a test-friendly tracing subscriber once per process.
///
/// Output is captured by the test harness; set `RUST_LOG` to see it.
pub fn init_tracing() {
    TRACING.call_once(|| {
        let filter = tracing_subscriber::EnvFilter::try_from_default_env()
            .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("warn"));
        let _ = tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_test_writer()
            .try_init();
    });
}

/// Parses a revision ID, panicking on bad input.
pub fn rev(s: &str) -> RevId {
    RevId::parse(s).expect("valid revision id")
}

/// Converts a JSON object into document properties.
pub fn props(value: serde_json::Value) -> Properties {
    match value {
        serde_json::Value::Object(map) => map,
        other => panic!("properties must be a JSON object, got {other}"),
    }
}

/// Creates a local store with a fixed UUID.
pub fn local_store(uuid: &str) -> Arc<MemoryRevisionStore> {
    Arc::new(MemoryRevisionStore::with_uuid(uuid))
}

fn current_rev(store: &dyn RevisionStore, doc_id: &str) -> Option<RevId> {
    store
        .get_document(doc_id)
        .expect("read document")
        .map(|doc| doc.current.rev_id)
}

/// Saves a new revision on top of the current one.
pub fn put_doc(store: &dyn RevisionStore, doc_id: &str, properties: Properties) -> Revision {
    let parent = current_rev(store, doc_id);
    store
        .put_revision(doc_id, parent.as_ref(), properties, false, Vec::new())
        .expect("save revision")
}

/// Saves a tombstone on top of the current revision.
pub fn delete_doc(store: &dyn RevisionStore, doc_id: &str) -> Revision {
    let parent = current_rev(store, doc_id);
    store
        .put_revision(doc_id, parent.as_ref(), Properties::new(), true, Vec::new())
        .expect("save tombstone")
}

/// Saves a new revision carrying one attachment, storing the blob first.
pub fn put_doc_with_attachment(
    store: &dyn RevisionStore,
    doc_id: &str,
    properties: Properties,
    name: &str,
    data: &[u8],
) -> Revision {
    let digest = attachment_digest(data);
    store
        .put_attachment(&digest, data.to_vec())
        .expect("store blob");
    let mut attachments: Vec<AttachmentRef> = current_rev(store, doc_id)
        .and_then(|r| store.get_revision(doc_id, &r).expect("read revision"))
        .map(|r| r.attachments)
        .unwrap_or_default();
    attachments.retain(|a| a.name != name);
    attachments.push(AttachmentRef {
        name: name.to_string(),
        digest,
        content_type: Some("application/octet-stream".into()),
        length: data.len() as u64,
        revpos: 0,
    });
    let parent = current_rev(store, doc_id);
    store
        .put_revision(doc_id, parent.as_ref(), properties, false, attachments)
        .expect("save revision")
}

/// Inserts a revision created elsewhere. `history` is newest first, e.g.
/// `["2-b", "1-a"]`.
pub fn insert_branch(
    store: &dyn RevisionStore,
    doc_id: &str,
    history: &[&str],
    properties: Properties,
) -> InsertOutcome {
    let history: Vec<RevId> = history.iter().map(|r| rev(r)).collect();
    let revision = Revision::new(doc_id, history[0].clone(), history.get(1).cloned())
        .with_properties(properties);
    store
        .force_insert(revision, &history)
        .expect("insert revision")
}

/// Winning revision and tombstone flag of every document.
pub fn winners(store: &MemoryRevisionStore) -> BTreeMap<String, (RevId, bool)> {
    store
        .document_ids()
        .into_iter()
        .filter_map(|id| {
            let doc = store.get_document(&id).expect("read document")?;
            Some((id, (doc.current.rev_id, doc.current.deleted)))
        })
        .collect()
}

/// Asserts that two stores agree on the winner of every document.
pub fn assert_converged(a: &MemoryRevisionStore, b: &MemoryRevisionStore) {
    assert_eq!(winners(a), winners(b), "stores did not converge");
}

/// A configuration tuned for tests: short delays, fast retries.
pub fn test_config(endpoint: RemoteEndpoint, direction: Direction) -> ReplicatorConfig {
    ReplicatorConfig::new(endpoint, direction)
        .with_pull_batch(50, Duration::from_millis(10))
        .with_debounce_window(Duration::from_millis(10))
        .with_heartbeat(Duration::from_millis(200))
        .with_poll_interval(Duration::from_millis(50))
        .with_request_timeout(Duration::from_secs(2))
        .with_stop_timeout(Duration::from_secs(2))
        .with_retry(
            RetryConfig::new(3)
                .with_initial_delay(Duration::from_millis(10))
                .with_max_delay(Duration::from_millis(100))
                .with_jitter(false),
        )
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn edits_chain_on_the_current_revision() {
        let store = MemoryRevisionStore::new();
        let first = put_doc(&store, "a", props(json!({"v": 1})));
        let second = put_doc(&store, "a", props(json!({"v": 2})));
        assert_eq!(second.parent, Some(first.rev_id));
        let gone = delete_doc(&store, "a");
        assert!(gone.deleted);
        assert_eq!(winners(&store)["a"], (gone.rev_id, true));
    }

    #[test]
    fn branches_create_conflicts() {
        let store = MemoryRevisionStore::new();
        insert_branch(&store, "a", &["1-a"], props(json!({})));
        insert_branch(&store, "a", &["2-a", "1-a"], props(json!({"side": "a"})));
        let outcome = insert_branch(&store, "a", &["2-b", "1-a"], props(json!({"side": "b"})));
        assert!(matches!(outcome, InsertOutcome::Conflicted(_)));
        assert_eq!(winners(&store)["a"].0, rev("2-b"));
    }

    #[test]
    fn attachments_carry_over() {
        let store = MemoryRevisionStore::new();
        put_doc_with_attachment(&store, "a", props(json!({})), "one", b"1");
        let rev = put_doc_with_attachment(&store, "a", props(json!({})), "two", b"2");
        let names: Vec<_> = rev.attachments.iter().map(|a| a.name.as_str()).collect();
        assert_eq!(names, ["one", "two"]);
        assert_eq!(rev.attachments[0].revpos, 1);
        assert_eq!(rev.attachments[1].revpos, 2);
    }
}
