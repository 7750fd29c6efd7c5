//! Client for the remote database's replication endpoints.

use crate::config::{FeedMode, RemoteEndpoint, ReplicatorConfig};
use crate::error::{ReplicationError, ReplicationResult};
use crate::transport::{Authenticator, ByteStream, Method, Request, Response, Transport};
use bytes::Bytes;
use revsync_protocol::{
    BulkDocsRequest, BulkDocsRow, BulkGetRef, BulkGetRequest, BulkGetResponse, BulkGetResult,
    ChangesResponse, CheckpointDoc, DatabaseInfo, DocumentBody, RemoteSeq, RevId,
    RevsDiffRequest, RevsDiffResponse,
};
use serde::Deserialize;
use std::collections::BTreeMap;
use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, trace, warn};
use url::{Position, Url};

/// Parameters of a `_changes` request.
#[derive(Debug, Clone, PartialEq)]
pub struct ChangesQuery {
    /// Feed style.
    pub feed: FeedMode,
    /// Resume point.
    pub since: Option<RemoteSeq>,
    /// Page size for polled feeds.
    pub limit: Option<usize>,
    /// Keep-alive interval for long-lived feeds.
    pub heartbeat: Duration,
    /// Named filter.
    pub filter: Option<String>,
    /// Filter parameters.
    pub filter_params: BTreeMap<String, serde_json::Value>,
    /// Document restriction.
    pub doc_ids: Option<Vec<String>>,
}

impl ChangesQuery {
    /// Builds the query a replication uses, resuming after `since`.
    pub fn for_config(config: &ReplicatorConfig, since: Option<RemoteSeq>) -> Self {
        let feed = config.effective_feed_mode();
        Self {
            feed,
            since,
            limit: (feed != FeedMode::Continuous).then_some(config.changes_limit),
            heartbeat: config.heartbeat,
            filter: config.filter.clone(),
            filter_params: config.filter_params.clone(),
            doc_ids: config.doc_ids.clone(),
        }
    }

    /// Returns the query string pairs in request order.
    pub fn to_pairs(&self) -> Vec<(String, String)> {
        let mut pairs = vec![("feed".to_string(), self.feed.as_str().to_string())];
        if self.feed != FeedMode::Normal {
            pairs.push(("heartbeat".into(), self.heartbeat.as_millis().to_string()));
        }
        pairs.push(("style".into(), "all_docs".into()));
        if let Some(since) = &self.since {
            pairs.push(("since".into(), since.to_string()));
        }
        if let Some(limit) = self.limit {
            pairs.push(("limit".into(), limit.to_string()));
        }
        if let Some(doc_ids) = &self.doc_ids {
            pairs.push(("filter".into(), "_doc_ids".into()));
            pairs.push((
                "doc_ids".into(),
                serde_json::Value::from(doc_ids.clone()).to_string(),
            ));
        } else if let Some(filter) = &self.filter {
            pairs.push(("filter".into(), filter.clone()));
            for (key, value) in &self.filter_params {
                let value = match value {
                    serde_json::Value::String(s) => s.clone(),
                    other => other.to_string(),
                };
                pairs.push((key.clone(), value));
            }
        }
        pairs
    }
}

#[derive(Deserialize)]
struct PutResponse {
    rev: String,
}

/// Typed access to one remote database.
///
/// Every request carries the authenticator's credentials and is bounded by
/// the request timeout. A 401 triggers at most one credential refresh.
pub struct RemoteDatabase {
    transport: Arc<dyn Transport>,
    authenticator: Option<Arc<dyn Authenticator>>,
    endpoint: RemoteEndpoint,
    base: Url,
    timeout: Duration,
    bulk_get_supported: AtomicBool,
}

impl std::fmt::Debug for RemoteDatabase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RemoteDatabase")
            .field("endpoint", &self.endpoint)
            .field("timeout", &self.timeout)
            .finish_non_exhaustive()
    }
}

impl RemoteDatabase {
    /// Creates a client.
    pub fn new(
        transport: Arc<dyn Transport>,
        authenticator: Option<Arc<dyn Authenticator>>,
        endpoint: RemoteEndpoint,
        timeout: Duration,
    ) -> ReplicationResult<Self> {
        let base = Url::parse(&endpoint.database_url())
            .map_err(|e| ReplicationError::Config(format!("invalid remote endpoint: {e}")))?;
        if base.cannot_be_a_base() {
            return Err(ReplicationError::Config(
                "remote endpoint cannot carry paths".into(),
            ));
        }
        Ok(Self {
            transport,
            authenticator,
            endpoint,
            base,
            timeout,
            bulk_get_supported: AtomicBool::new(true),
        })
    }

    /// Returns the endpoint.
    pub fn endpoint(&self) -> &RemoteEndpoint {
        &self.endpoint
    }

    /// Returns false once the remote has refused `_bulk_get`.
    pub fn supports_bulk_get(&self) -> bool {
        self.bulk_get_supported.load(Ordering::Acquire)
    }

    /// Opens the transport connection.
    pub async fn connect(&self) -> ReplicationResult<()> {
        self.bounded(self.timeout, self.transport.connect(&self.endpoint))
            .await
    }

    /// `GET /{db}/`
    pub async fn server_info(&self) -> ReplicationResult<DatabaseInfo> {
        let path = self.path([""], &[]);
        let response = self.execute(Request::get(&path), self.timeout).await?;
        check(response, &path)?.decode()
    }

    /// `GET /{db}/_changes` for normal and longpoll feeds.
    pub async fn changes(&self, query: &ChangesQuery) -> ReplicationResult<ChangesResponse> {
        let path = self.path(["_changes"], &query.to_pairs());
        // A longpoll request legitimately stays open until the heartbeat.
        let timeout = match query.feed {
            FeedMode::Normal => self.timeout,
            _ => self.timeout + query.heartbeat,
        };
        let response = self.execute(Request::get(&path), timeout).await?;
        let response = check(response, &path)?;
        Ok(ChangesResponse::decode(&response.body)?)
    }

    /// `GET /{db}/_changes?feed=continuous`, returning the body reader.
    pub async fn open_changes_stream(
        &self,
        query: &ChangesQuery,
    ) -> ReplicationResult<Box<dyn ByteStream>> {
        let path = self.path(["_changes"], &query.to_pairs());
        let mut refreshed = false;
        loop {
            let mut request = Request::get(&path);
            self.authorize(&mut request);
            let stream = self
                .bounded(self.timeout, self.transport.open_stream(request))
                .await?;
            if stream.status == 401 && !refreshed && self.refresh_credentials().await {
                refreshed = true;
                continue;
            }
            if (200..300).contains(&stream.status) {
                return Ok(stream.body);
            }
            return Err(status_error(stream.status, &path));
        }
    }

    /// `POST /{db}/_revs_diff`
    pub async fn revs_diff(&self, request: &RevsDiffRequest) -> ReplicationResult<RevsDiffResponse> {
        if request.is_empty() {
            return Ok(RevsDiffResponse::new());
        }
        let path = self.path(["_revs_diff"], &[]);
        let response = self
            .execute(Request::json(Method::Post, &path, request)?, self.timeout)
            .await?;
        check(response, &path)?.decode()
    }

    /// `POST /{db}/_bulk_docs` with `new_edits=false`.
    pub async fn bulk_docs(&self, docs: Vec<DocumentBody>) -> ReplicationResult<Vec<BulkDocsRow>> {
        let path = self.path(["_bulk_docs"], &[]);
        let body = BulkDocsRequest::replicate(docs);
        let response = self
            .execute(Request::json(Method::Post, &path, &body)?, self.timeout)
            .await?;
        check(response, &path)?.decode()
    }

    /// `POST /{db}/_bulk_get`. Returns `None` if the remote lacks the endpoint.
    pub async fn bulk_get(
        &self,
        docs: Vec<BulkGetRef>,
        attachments: bool,
    ) -> ReplicationResult<Option<Vec<BulkGetResult>>> {
        if !self.supports_bulk_get() {
            return Ok(None);
        }
        let path = self.path(
            ["_bulk_get"],
            &[
                ("revs".into(), "true".into()),
                ("attachments".into(), attachments.to_string()),
            ],
        );
        let body = BulkGetRequest { docs };
        let response = self
            .execute(Request::json(Method::Post, &path, &body)?, self.timeout)
            .await?;
        if matches!(response.status, 404 | 405) {
            debug!(status = response.status, "remote lacks _bulk_get; fetching per document");
            self.bulk_get_supported.store(false, Ordering::Release);
            return Ok(None);
        }
        let decoded: BulkGetResponse = check(response, &path)?.decode()?;
        Ok(Some(decoded.results))
    }

    /// `GET /{db}/{docid}?rev=..&revs=true&attachments=..&atts_since=[..]`
    pub async fn get_revision(
        &self,
        doc_id: &str,
        rev_id: &RevId,
        atts_since: &[RevId],
        attachments: bool,
    ) -> ReplicationResult<DocumentBody> {
        let mut query = vec![
            ("rev".to_string(), rev_id.to_string()),
            ("revs".into(), "true".into()),
            ("attachments".into(), attachments.to_string()),
        ];
        if attachments && !atts_since.is_empty() {
            let since: Vec<String> = atts_since.iter().map(RevId::to_string).collect();
            query.push(("atts_since".into(), serde_json::to_string(&since)?));
        }
        let path = self.path([doc_id], &query);
        let response = self.execute(Request::get(&path), self.timeout).await?;
        check(response, &path)?.decode()
    }

    /// `GET /{db}/{docid}/{name}?rev=..`
    pub async fn get_attachment(
        &self,
        doc_id: &str,
        rev_id: &RevId,
        name: &str,
    ) -> ReplicationResult<Bytes> {
        let path = self.path([doc_id, name], &[("rev".into(), rev_id.to_string())]);
        let response = self
            .execute(
                Request::get(&path).with_header("Accept", "*/*"),
                self.timeout,
            )
            .await?;
        Ok(check(response, &path)?.body)
    }

    /// `GET /{db}/_local/{id}`. A missing document is `None`.
    pub async fn get_checkpoint(&self, checkpoint_id: &str) -> ReplicationResult<Option<CheckpointDoc>> {
        let path = self.path(["_local", checkpoint_id], &[]);
        let response = self.execute(Request::get(&path), self.timeout).await?;
        if response.status == 404 {
            return Ok(None);
        }
        check(response, &path)?.decode().map(Some)
    }

    /// `PUT /{db}/_local/{id}`. Returns the new remote revision token.
    pub async fn put_checkpoint(
        &self,
        checkpoint_id: &str,
        doc: &CheckpointDoc,
    ) -> ReplicationResult<String> {
        let path = self.path(["_local", checkpoint_id], &[]);
        let response = self
            .execute(Request::json(Method::Put, &path, doc)?, self.timeout)
            .await?;
        let put: PutResponse = check(response, &path)?.decode()?;
        Ok(put.rev)
    }

    fn path<'a>(
        &self,
        segments: impl IntoIterator<Item = &'a str>,
        query: &[(String, String)],
    ) -> String {
        let mut url = self.base.clone();
        if let Ok(mut path) = url.path_segments_mut() {
            path.pop_if_empty().extend(segments);
        }
        if !query.is_empty() {
            let mut pairs = url.query_pairs_mut();
            for (key, value) in query {
                pairs.append_pair(key, value);
            }
        }
        url[Position::BeforePath..].to_string()
    }

    fn authorize(&self, request: &mut Request) {
        if let Some(authenticator) = &self.authenticator {
            authenticator.authorize(request);
        }
    }

    async fn refresh_credentials(&self) -> bool {
        match &self.authenticator {
            Some(authenticator) => {
                let refreshed = authenticator.refresh().await;
                debug!(refreshed, "credentials rejected; asked for fresh ones");
                refreshed
            }
            None => false,
        }
    }

    async fn execute(&self, request: Request, timeout: Duration) -> ReplicationResult<Response> {
        trace!(method = %request.method, path = %request.path, "sending request");
        let response = self.send_once(request.clone(), timeout).await?;
        if response.status == 401 && self.refresh_credentials().await {
            return self.send_once(request, timeout).await;
        }
        Ok(response)
    }

    async fn send_once(&self, mut request: Request, timeout: Duration) -> ReplicationResult<Response> {
        self.authorize(&mut request);
        self.bounded(timeout, self.transport.send(request)).await
    }

    async fn bounded<T>(
        &self,
        timeout: Duration,
        future: impl Future<Output = ReplicationResult<T>>,
    ) -> ReplicationResult<T> {
        match tokio::time::timeout(timeout, future).await {
            Ok(result) => result,
            Err(_) => {
                warn!(?timeout, "request timed out");
                Err(ReplicationError::Timeout(timeout))
            }
        }
    }
}

fn status_error(status: u16, path: &str) -> ReplicationError {
    match status {
        401 | 403 => ReplicationError::AuthenticationFailed(format!("status {status} for {path}")),
        _ => ReplicationError::Status {
            status,
            path: path.to_string(),
        },
    }
}

fn check(response: Response, path: &str) -> ReplicationResult<Response> {
    if response.is_success() {
        Ok(response)
    } else {
        Err(status_error(response.status, path))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Direction;
    use crate::test_support::ScriptedTransport;
    use crate::transport::{CredentialStore, Credentials, StoredCredentials};

    fn endpoint() -> RemoteEndpoint {
        RemoteEndpoint::new("db.example.com", 5984, false, "notes")
    }

    fn remote(transport: Arc<ScriptedTransport>, auth: Option<Arc<dyn Authenticator>>) -> RemoteDatabase {
        RemoteDatabase::new(transport, auth, endpoint(), Duration::from_secs(5)).unwrap()
    }

    #[test]
    fn changes_query_for_doc_ids() {
        let config = ReplicatorConfig::new(endpoint(), Direction::Pull)
            .with_doc_ids(vec!["a".into(), "b".into()]);
        let query = ChangesQuery::for_config(&config, Some(RemoteSeq::Number(7)));
        assert_eq!(
            query.to_pairs(),
            vec![
                ("feed".to_string(), "normal".to_string()),
                ("style".into(), "all_docs".into()),
                ("since".into(), "7".into()),
                ("limit".into(), "50".into()),
                ("filter".into(), "_doc_ids".into()),
                ("doc_ids".into(), r#"["a","b"]"#.into()),
            ]
        );
    }

    #[test]
    fn changes_query_for_continuous_filter() {
        let mut params = BTreeMap::new();
        params.insert("owner".to_string(), serde_json::json!("ann"));
        params.insert("min".to_string(), serde_json::json!(3));
        let config = ReplicatorConfig::new(endpoint(), Direction::Pull)
            .with_continuous(true)
            .with_feed_mode(FeedMode::Continuous)
            .with_heartbeat(Duration::from_secs(300))
            .with_filter("by_owner", params);
        let pairs = ChangesQuery::for_config(&config, None).to_pairs();
        assert!(pairs.contains(&("feed".into(), "continuous".into())));
        assert!(pairs.contains(&("heartbeat".into(), "300000".into())));
        assert!(pairs.contains(&("filter".into(), "by_owner".into())));
        assert!(pairs.contains(&("owner".into(), "ann".into())));
        assert!(pairs.contains(&("min".into(), "3".into())));
        assert!(!pairs.iter().any(|(k, _)| k == "limit" || k == "since"));
    }

    #[tokio::test]
    async fn paths_are_escaped() {
        let transport = Arc::new(ScriptedTransport::answering(vec![Response::json(
            200,
            &serde_json::json!({"_id": "a b/c", "_rev": "1-x"}),
        )]));
        let db = remote(Arc::clone(&transport), None);
        let rev = RevId::parse("1-x").unwrap();
        db.get_revision("a b/c", &rev, &[], true).await.unwrap();

        let sent = transport.requests.lock()[0].path.clone();
        assert!(sent.starts_with("/notes/a%20b%2Fc?rev=1-x&revs=true&attachments=true"));
    }

    #[tokio::test]
    async fn unauthorized_refreshes_once() {
        let transport = Arc::new(ScriptedTransport::answering(vec![
            Response::new(401, ""),
            Response::json(200, &serde_json::json!({"db_name": "notes"})),
        ]));
        let store = Arc::new(CredentialStore::new());
        store.set("peer", Credentials::Bearer("stale".into()));
        store.set_refresher(Arc::new(|_: &str| Some(Credentials::Bearer("fresh".into()))));
        let auth: Arc<dyn Authenticator> = Arc::new(StoredCredentials::new(store, "peer"));
        let db = remote(Arc::clone(&transport), Some(auth));

        let info = db.server_info().await.unwrap();
        assert_eq!(info.db_name, "notes");
        let requests = transport.requests.lock();
        assert_eq!(requests[0].header("Authorization"), Some("Bearer stale"));
        assert_eq!(requests[1].header("Authorization"), Some("Bearer fresh"));
    }

    #[tokio::test]
    async fn unauthorized_without_refresh_fails() {
        let transport = Arc::new(ScriptedTransport::answering(vec![Response::new(401, "")]));
        let db = remote(transport, None);
        let err = db.server_info().await.unwrap_err();
        assert!(matches!(err, ReplicationError::AuthenticationFailed(_)));
        assert!(err.is_fatal());
    }

    #[tokio::test]
    async fn bulk_get_fallback_is_sticky() {
        let transport = Arc::new(ScriptedTransport::answering(vec![Response::new(405, "")]));
        let db = remote(Arc::clone(&transport), None);
        let refs = vec![BulkGetRef {
            id: "a".into(),
            rev: RevId::parse("1-x").unwrap(),
            atts_since: Vec::new(),
        }];
        assert!(db.bulk_get(refs.clone(), true).await.unwrap().is_none());
        assert!(!db.supports_bulk_get());
        assert!(db.bulk_get(refs, true).await.unwrap().is_none());
        assert_eq!(transport.requests.lock().len(), 1);
    }

    #[tokio::test]
    async fn missing_checkpoint_is_none() {
        let transport = Arc::new(ScriptedTransport::answering(vec![Response::new(404, "")]));
        let db = remote(Arc::clone(&transport), None);
        assert!(db.get_checkpoint("abc").await.unwrap().is_none());
        assert_eq!(transport.requests.lock()[0].path, "/notes/_local/abc");
    }

    #[tokio::test(start_paused = true)]
    async fn slow_requests_time_out() {
        let transport = Arc::new(ScriptedTransport {
            delay: Some(Duration::from_secs(60)),
            ..ScriptedTransport::default()
        });
        let db = remote(transport, None);
        let err = db.server_info().await.unwrap_err();
        assert!(matches!(err, ReplicationError::Timeout(_)));
        assert!(err.is_retryable());
    }
}
