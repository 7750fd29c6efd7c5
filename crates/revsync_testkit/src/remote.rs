//! An in-process remote database speaking the replication wire protocol.
//!
//! [`MemoryRemote`] implements [`Transport`] on top of a
//! [`MemoryRevisionStore`], so a replicator under test talks to it exactly as
//! it would talk to a server: paths, query strings, JSON bodies, status codes.
//! Faults (unreachable, injected statuses, rejected documents, missing
//! endpoints) can be switched on at any time.

use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::Mutex;
use revsync_engine::{
    ByteStream, Credentials, Method, RemoteEndpoint, ReplicationError, ReplicationResult, Request,
    Response, StreamResponse, Transport,
};
use revsync_protocol::{
    AttachmentBody, BulkDocsRequest, BulkDocsRow, BulkGetDoc, BulkGetRequest, BulkGetResponse,
    BulkGetResult, ChangeRow, CheckpointDoc, DatabaseInfo, DocumentBody, RemoteSeq,
    RevId, RevRef, Revision, RevsDiffRequest, PROTOCOL_VERSION,
};
use revsync_store::{InsertOutcome, MemoryRevisionStore, RevisionStore, StoreError};
use serde_json::json;
use std::collections::{BTreeMap, HashMap, HashSet, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tracing::{debug, trace};
use url::Url;

/// Query parameters of `_changes` that are not filter parameters.
const RESERVED_CHANGES_PARAMS: &[&str] = &[
    "feed",
    "heartbeat",
    "style",
    "since",
    "limit",
    "filter",
    "doc_ids",
];

/// Endpoint families, for request counting and fault injection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Route {
    /// `GET /{db}/`
    Info,
    /// `GET /{db}/_changes`
    Changes,
    /// `POST /{db}/_revs_diff`
    RevsDiff,
    /// `POST /{db}/_bulk_docs`
    BulkDocs,
    /// `POST /{db}/_bulk_get`
    BulkGet,
    /// `GET /{db}/{docid}`
    Document,
    /// `GET /{db}/{docid}/{attachment}`
    Attachment,
    /// `GET|PUT /{db}/_local/{id}`
    Local,
}

/// A server-side filter: current revision, query parameters, verdict.
pub type NamedFilter = Arc<dyn Fn(&Revision, &BTreeMap<String, String>) -> bool + Send + Sync>;

#[derive(Clone)]
enum FeedFilter {
    All,
    DocIds(HashSet<String>),
    Named(NamedFilter, BTreeMap<String, String>),
}

impl FeedFilter {
    fn accepts(&self, doc: &Revision) -> bool {
        match self {
            FeedFilter::All => true,
            FeedFilter::DocIds(ids) => ids.contains(&doc.doc_id),
            FeedFilter::Named(filter, params) => filter(doc, params),
        }
    }
}

struct InjectedFailure {
    route: Route,
    status: u16,
    remaining: usize,
}

/// A parsed request target.
struct Target {
    route: Route,
    /// Decoded path segments after the database name.
    segments: Vec<String>,
    query: BTreeMap<String, String>,
}

struct Shared {
    store: Arc<MemoryRevisionStore>,
    db: String,
    offline: AtomicBool,
    bulk_get_enabled: AtomicBool,
    /// Bumped to cut every open continuous feed.
    epoch: AtomicU64,
    protocol_version: Mutex<Option<u16>>,
    credentials: Mutex<Option<String>>,
    failures: Mutex<Vec<InjectedFailure>>,
    rejected: Mutex<HashSet<String>>,
    filters: Mutex<HashMap<String, NamedFilter>>,
    checkpoints: Mutex<HashMap<String, (u64, CheckpointDoc)>>,
    counts: Mutex<HashMap<Route, usize>>,
    log: Mutex<VecDeque<Request>>,
}

/// Maximum number of requests kept in the request log.
const LOG_CAPACITY: usize = 1024;

/// In-process remote database. Cheap to clone; clones share state.
#[derive(Clone)]
pub struct MemoryRemote {
    shared: Arc<Shared>,
}

impl std::fmt::Debug for MemoryRemote {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MemoryRemote")
            .field("db", &self.shared.db)
            .field("offline", &self.shared.offline.load(Ordering::Relaxed))
            .finish_non_exhaustive()
    }
}

impl MemoryRemote {
    /// Serves `db` from a fresh store.
    pub fn new(db: impl Into<String>) -> Self {
        Self::with_store(db, Arc::new(MemoryRevisionStore::new()))
    }

    /// Serves `db` from an existing store.
    pub fn with_store(db: impl Into<String>, store: Arc<MemoryRevisionStore>) -> Self {
        Self {
            shared: Arc::new(Shared {
                store,
                db: db.into(),
                offline: AtomicBool::new(false),
                bulk_get_enabled: AtomicBool::new(true),
                epoch: AtomicU64::new(0),
                protocol_version: Mutex::new(Some(PROTOCOL_VERSION)),
                credentials: Mutex::new(None),
                failures: Mutex::new(Vec::new()),
                rejected: Mutex::new(HashSet::new()),
                filters: Mutex::new(HashMap::new()),
                checkpoints: Mutex::new(HashMap::new()),
                counts: Mutex::new(HashMap::new()),
                log: Mutex::new(VecDeque::new()),
            }),
        }
    }

    /// The database behind the remote.
    pub fn store(&self) -> Arc<MemoryRevisionStore> {
        Arc::clone(&self.shared.store)
    }

    /// An endpoint that addresses this remote.
    pub fn endpoint(&self) -> RemoteEndpoint {
        RemoteEndpoint::new("remote.test", 5984, false, self.shared.db.clone())
    }

    /// Makes every request fail as unreachable, and cuts open feeds.
    pub fn set_offline(&self, offline: bool) {
        debug!(offline, "remote reachability changed");
        self.shared.offline.store(offline, Ordering::SeqCst);
        if offline {
            self.shared.epoch.fetch_add(1, Ordering::SeqCst);
        }
    }

    /// Ends every open continuous feed with a `last_seq` line.
    pub fn end_feeds(&self) {
        self.shared.epoch.fetch_add(1, Ordering::SeqCst);
    }

    /// Answers the next `count` requests to `route` with `status`.
    pub fn fail_next(&self, route: Route, status: u16, count: usize) {
        self.shared.failures.lock().push(InjectedFailure {
            route,
            status,
            remaining: count,
        });
    }

    /// Requires these credentials on every request; `None` lifts the requirement.
    pub fn require_credentials(&self, credentials: Option<&Credentials>) {
        *self.shared.credentials.lock() = credentials.map(Credentials::header_value);
    }

    /// Refuses pushed revisions of `doc_id` with `forbidden`.
    pub fn reject_doc(&self, doc_id: impl Into<String>) {
        self.shared.rejected.lock().insert(doc_id.into());
    }

    /// Answers `_bulk_get` with 404, like servers that predate it.
    pub fn disable_bulk_get(&self) {
        self.shared.bulk_get_enabled.store(false, Ordering::SeqCst);
    }

    /// Sets the advertised protocol version; `None` omits it.
    pub fn set_protocol_version(&self, version: Option<u16>) {
        *self.shared.protocol_version.lock() = version;
    }

    /// Registers a named `_changes` filter.
    pub fn register_filter(
        &self,
        name: impl Into<String>,
        filter: impl Fn(&Revision, &BTreeMap<String, String>) -> bool + Send + Sync + 'static,
    ) {
        self.shared.filters.lock().insert(name.into(), Arc::new(filter));
    }

    /// Number of requests served for `route`, including failed ones.
    pub fn request_count(&self, route: Route) -> usize {
        self.shared.counts.lock().get(&route).copied().unwrap_or(0)
    }

    /// Most recent requests, oldest first.
    pub fn requests(&self) -> Vec<Request> {
        self.shared.log.lock().iter().cloned().collect()
    }

    /// The stored `_local` checkpoint document.
    pub fn checkpoint(&self, id: &str) -> Option<CheckpointDoc> {
        self.shared
            .checkpoints
            .lock()
            .get(id)
            .map(|(_, doc)| doc.clone())
    }
}

#[async_trait]
impl Transport for MemoryRemote {
    async fn connect(&self, _endpoint: &RemoteEndpoint) -> ReplicationResult<()> {
        self.shared.check_online()
    }

    async fn send(&self, request: Request) -> ReplicationResult<Response> {
        self.shared.check_online()?;
        let target = match self.shared.admit(&request) {
            Ok(target) => target,
            Err(response) => return Ok(response),
        };
        trace!(method = %request.method, path = %request.path, "remote request");
        Ok(self.shared.dispatch(&request, target).await)
    }

    async fn open_stream(&self, request: Request) -> ReplicationResult<StreamResponse> {
        self.shared.check_online()?;
        let target = match self.shared.admit(&request) {
            Ok(target) => target,
            Err(response) => return Ok(rejected_stream(response)),
        };
        if target.route != Route::Changes || request.method != Method::Get {
            return Ok(rejected_stream(not_found()));
        }
        let filter = match self.shared.feed_filter(&target.query) {
            Ok(filter) => filter,
            Err(response) => return Ok(rejected_stream(response)),
        };
        let heartbeat = heartbeat(&target.query);
        Ok(StreamResponse {
            status: 200,
            body: Box::new(ContinuousFeed {
                shared: Arc::clone(&self.shared),
                since: since(&target.query),
                filter,
                heartbeat,
                announced: false,
                epoch: self.shared.epoch.load(Ordering::SeqCst),
                sequences: self.shared.store.subscribe(),
                ended: false,
            }),
        })
    }
}

impl Shared {
    fn check_online(&self) -> ReplicationResult<()> {
        if self.offline.load(Ordering::SeqCst) {
            return Err(ReplicationError::transport_retryable("remote unreachable"));
        }
        Ok(())
    }

    /// Routes, counts, authenticates, and applies injected failures.
    fn admit(&self, request: &Request) -> Result<Target, Response> {
        {
            let mut log = self.log.lock();
            if log.len() == LOG_CAPACITY {
                log.pop_front();
            }
            log.push_back(request.clone());
        }
        let target = self.parse(&request.path).ok_or_else(not_found)?;
        *self.counts.lock().entry(target.route).or_default() += 1;

        if let Some(expected) = self.credentials.lock().as_deref() {
            if request.header("Authorization") != Some(expected) {
                return Err(Response::json(
                    401,
                    &json!({"error": "unauthorized", "reason": "name or password is incorrect"}),
                ));
            }
        }

        let mut failures = self.failures.lock();
        if let Some(failure) = failures
            .iter_mut()
            .find(|f| f.route == target.route && f.remaining > 0)
        {
            failure.remaining -= 1;
            let status = failure.status;
            failures.retain(|f| f.remaining > 0);
            return Err(Response::json(
                status,
                &json!({"error": "injected", "reason": format!("injected {status}")}),
            ));
        }
        Ok(target)
    }

    fn parse(&self, path: &str) -> Option<Target> {
        let url = Url::parse(&format!("http://remote.test{path}")).ok()?;
        let mut segments = url.path_segments()?.map(percent_decode);
        if segments.next()? != self.db {
            return None;
        }
        let segments: Vec<String> = segments.filter(|s| !s.is_empty()).collect();
        let route = match segments.iter().map(String::as_str).collect::<Vec<_>>()[..] {
            [] => Route::Info,
            ["_changes"] => Route::Changes,
            ["_revs_diff"] => Route::RevsDiff,
            ["_bulk_docs"] => Route::BulkDocs,
            ["_bulk_get"] => Route::BulkGet,
            ["_local", _] => Route::Local,
            [_] => Route::Document,
            [_, _] => Route::Attachment,
            _ => return None,
        };
        let query = url.query_pairs().into_owned().collect();
        Some(Target {
            route,
            segments,
            query,
        })
    }

    async fn dispatch(&self, request: &Request, target: Target) -> Response {
        let result = match (request.method, target.route) {
            (Method::Get, Route::Info) => Ok(self.info()),
            (Method::Get, Route::Changes) => self.changes(&target.query).await,
            (Method::Post, Route::RevsDiff) => self.revs_diff(request),
            (Method::Post, Route::BulkDocs) => self.bulk_docs(request),
            (Method::Post, Route::BulkGet) => self.bulk_get(request, &target.query),
            (Method::Get, Route::Document) => self.document(&target),
            (Method::Get, Route::Attachment) => self.attachment(&target),
            (Method::Get, Route::Local) => Ok(self.get_local(&target.segments[1])),
            (Method::Put, Route::Local) => self.put_local(&target.segments[1], request),
            _ => Ok(Response::json(
                405,
                &json!({"error": "method_not_allowed", "reason": "Only GET, PUT, POST allowed"}),
            )),
        };
        result.unwrap_or_else(|err| {
            Response::json(500, &json!({"error": "internal", "reason": err.to_string()}))
        })
    }

    fn info(&self) -> Response {
        let info = DatabaseInfo {
            db_name: self.db.clone(),
            update_seq: Some(RemoteSeq::Number(self.store.last_sequence())),
            protocol_version: *self.protocol_version.lock(),
        };
        Response::json(200, &info)
    }

    fn feed_filter(&self, query: &BTreeMap<String, String>) -> Result<FeedFilter, Response> {
        match query.get("filter").map(String::as_str) {
            None => Ok(FeedFilter::All),
            Some("_doc_ids") => {
                let ids: Vec<String> = query
                    .get("doc_ids")
                    .and_then(|raw| serde_json::from_str(raw).ok())
                    .ok_or_else(|| bad_request("doc_ids must be a JSON array"))?;
                Ok(FeedFilter::DocIds(ids.into_iter().collect()))
            }
            Some(name) => {
                let filter = self.filters.lock().get(name).cloned().ok_or_else(|| {
                    Response::json(
                        404,
                        &json!({"error": "not_found", "reason": format!("missing filter {name}")}),
                    )
                })?;
                let params = query
                    .iter()
                    .filter(|(k, _)| !RESERVED_CHANGES_PARAMS.contains(&k.as_str()))
                    .map(|(k, v)| (k.clone(), v.clone()))
                    .collect();
                Ok(FeedFilter::Named(filter, params))
            }
        }
    }

    /// Feed rows after `since`, never past `head`: one row per document at
    /// its latest sequence, listing every leaf with the winner first.
    fn collect(
        &self,
        since: u64,
        head: u64,
        filter: &FeedFilter,
        limit: usize,
    ) -> Result<Vec<ChangeRow>, StoreError> {
        let mut docs: HashMap<String, (u64, Vec<RevId>)> = HashMap::new();
        for entry in self.store.changes_since(0, usize::MAX)? {
            let Some(seq) = entry.sequence.as_number().filter(|s| *s <= head) else {
                continue;
            };
            let (latest, revs) = docs.entry(entry.doc_id).or_default();
            *latest = (*latest).max(seq);
            revs.push(entry.rev_id);
        }

        let mut rows = Vec::new();
        for (doc_id, (seq, mut revs)) in docs {
            if seq <= since {
                continue;
            }
            let Some(doc) = self.store.get_document(&doc_id)? else {
                continue;
            };
            if !filter.accepts(&doc.current) {
                continue;
            }
            revs.sort_by_key(|r| *r != doc.current.rev_id);
            rows.push(ChangeRow {
                seq: RemoteSeq::Number(seq),
                id: doc_id,
                changes: revs.into_iter().map(|rev| RevRef { rev }).collect(),
                deleted: doc.current.deleted,
            });
        }
        rows.sort_by_key(|r| r.seq.as_number());
        rows.truncate(limit);
        Ok(rows)
    }

    async fn changes(&self, query: &BTreeMap<String, String>) -> Result<Response, StoreError> {
        let filter = match self.feed_filter(query) {
            Ok(filter) => filter,
            Err(response) => return Ok(response),
        };
        let since = since(query);
        let limit = query
            .get("limit")
            .and_then(|l| l.parse().ok())
            .unwrap_or(usize::MAX);
        let longpoll = query.get("feed").map(String::as_str) == Some("longpoll");

        let mut sequences = self.store.subscribe();
        let mut head = self.store.last_sequence();
        let mut rows = self.collect(since, head, &filter, limit)?;
        if rows.is_empty() && longpoll {
            sequences.borrow_and_update();
            if let Ok(Ok(())) = tokio::time::timeout(heartbeat(query), sequences.changed()).await {
                head = self.store.last_sequence();
                rows = self.collect(since, head, &filter, limit)?;
            }
        }

        let last_seq = if rows.len() == limit {
            rows.last().and_then(|r| r.seq.as_number()).unwrap_or(since)
        } else {
            head.max(since)
        };
        let results: Vec<serde_json::Value> = rows.iter().map(change_row).collect();
        Ok(Response::json(
            200,
            &json!({"results": results, "last_seq": last_seq}),
        ))
    }

    fn revs_diff(&self, request: &Request) -> Result<Response, StoreError> {
        let Some(body) = decode::<RevsDiffRequest>(request) else {
            return Ok(bad_request("invalid _revs_diff body"));
        };
        let diff = self.store.revs_diff(&body)?;
        Ok(Response::json(200, &diff))
    }

    fn bulk_docs(&self, request: &Request) -> Result<Response, StoreError> {
        let Some(body) = decode::<BulkDocsRequest>(request) else {
            return Ok(bad_request("invalid _bulk_docs body"));
        };
        if body.new_edits {
            return Ok(bad_request("only new_edits=false is supported"));
        }
        let rows: Vec<BulkDocsRow> = body
            .docs
            .into_iter()
            .map(|doc| self.insert(doc))
            .collect::<Result<_, _>>()?;
        Ok(Response::json(201, &rows))
    }

    fn insert(&self, doc: DocumentBody) -> Result<BulkDocsRow, StoreError> {
        let id = doc.id.clone();
        let rev = doc.rev.clone();
        if self.rejected.lock().contains(&id) {
            return Ok(BulkDocsRow::failure(
                id,
                Some(rev),
                "forbidden",
                "document rejected by validation",
            ));
        }
        let (revision, history, blobs) = match doc.into_revision() {
            Ok(decoded) => decoded,
            Err(err) => {
                return Ok(BulkDocsRow::failure(id, Some(rev), "bad_request", err.to_string()))
            }
        };
        for (digest, data) in blobs {
            self.store.put_attachment(&digest, data)?;
        }
        match self.store.force_insert(revision, &history) {
            Ok(InsertOutcome::Conflicted(conflict)) => {
                debug!(doc_id = %conflict.doc_id, "remote now holds a conflict");
                Ok(BulkDocsRow::success(id, rev))
            }
            Ok(_) => Ok(BulkDocsRow::success(id, rev)),
            Err(StoreError::BlobMissing { digest }) => Ok(BulkDocsRow::failure(
                id,
                Some(rev),
                "missing_stub",
                format!("no attachment with digest {digest}"),
            )),
            Err(err) if err.is_fatal() => Err(err),
            Err(err) => Ok(BulkDocsRow::failure(id, Some(rev), "bad_request", err.to_string())),
        }
    }

    fn bulk_get(
        &self,
        request: &Request,
        query: &BTreeMap<String, String>,
    ) -> Result<Response, StoreError> {
        if !self.bulk_get_enabled.load(Ordering::SeqCst) {
            return Ok(not_found());
        }
        let Some(body) = decode::<BulkGetRequest>(request) else {
            return Ok(bad_request("invalid _bulk_get body"));
        };
        let attachments = flag(query, "attachments");
        let mut results = Vec::with_capacity(body.docs.len());
        for wanted in body.docs {
            let doc = match self.document_body(&wanted.id, &wanted.rev, &wanted.atts_since, attachments)? {
                Some(body) => BulkGetDoc {
                    ok: Some(body),
                    error: None,
                },
                None => BulkGetDoc {
                    ok: None,
                    error: Some(BulkDocsRow::failure(
                        wanted.id.clone(),
                        Some(wanted.rev),
                        "not_found",
                        "missing",
                    )),
                },
            };
            results.push(BulkGetResult {
                id: wanted.id,
                docs: vec![doc],
            });
        }
        Ok(Response::json(200, &BulkGetResponse { results }))
    }

    fn document(&self, target: &Target) -> Result<Response, StoreError> {
        let doc_id = &target.segments[0];
        let rev = match target.query.get("rev") {
            Some(raw) => match RevId::parse(raw) {
                Ok(rev) => rev,
                Err(err) => return Ok(bad_request(&err.to_string())),
            },
            None => match self.store.get_document(doc_id)? {
                Some(doc) if !doc.is_deleted() => doc.current.rev_id,
                _ => return Ok(not_found()),
            },
        };
        let atts_since: Vec<RevId> = target
            .query
            .get("atts_since")
            .and_then(|raw| serde_json::from_str(raw).ok())
            .unwrap_or_default();
        let attachments = flag(&target.query, "attachments");
        Ok(
            match self.document_body(doc_id, &rev, &atts_since, attachments)? {
                Some(body) => Response::json(200, &body),
                None => not_found(),
            },
        )
    }

    /// The wire form of one revision. Attachments the caller already has
    /// through an `atts_since` ancestor are sent as stubs.
    fn document_body(
        &self,
        doc_id: &str,
        rev: &RevId,
        atts_since: &[RevId],
        attachments: bool,
    ) -> Result<Option<DocumentBody>, StoreError> {
        let Some(revision) = self.store.get_revision(doc_id, rev)? else {
            return Ok(None);
        };
        let history = self.store.get_history(doc_id, rev)?;
        let known = atts_since
            .iter()
            .filter(|a| history.contains(a))
            .map(RevId::generation)
            .max()
            .unwrap_or(0);

        let mut bodies = BTreeMap::new();
        for attachment in &revision.attachments {
            let body = match self.store.get_attachment(&attachment.digest)? {
                Some(data) if attachments && attachment.revpos > known => {
                    AttachmentBody::inline(attachment, &data)
                }
                _ => AttachmentBody::stub(attachment),
            };
            bodies.insert(attachment.name.clone(), body);
        }
        Ok(Some(DocumentBody::from_revision(&revision, &history, bodies)))
    }

    fn attachment(&self, target: &Target) -> Result<Response, StoreError> {
        let (doc_id, name) = (&target.segments[0], &target.segments[1]);
        let revision = match target.query.get("rev").map(|r| RevId::parse(r)) {
            Some(Ok(rev)) => self.store.get_revision(doc_id, &rev)?,
            Some(Err(err)) => return Ok(bad_request(&err.to_string())),
            None => self.store.get_document(doc_id)?.map(|d| d.current),
        };
        let Some(attachment) = revision
            .as_ref()
            .and_then(|r| r.attachments.iter().find(|a| &a.name == name))
        else {
            return Ok(not_found());
        };
        Ok(match self.store.get_attachment(&attachment.digest)? {
            Some(data) => Response::new(200, data),
            None => not_found(),
        })
    }

    fn get_local(&self, id: &str) -> Response {
        match self.checkpoints.lock().get(id) {
            Some((_, doc)) => Response::json(200, doc),
            None => not_found(),
        }
    }

    fn put_local(&self, id: &str, request: &Request) -> Result<Response, StoreError> {
        let Some(mut doc) = decode::<CheckpointDoc>(request) else {
            return Ok(bad_request("invalid checkpoint body"));
        };
        let mut checkpoints = self.checkpoints.lock();
        let generation = match checkpoints.get(id) {
            Some((generation, stored)) if stored.rev == doc.rev => generation + 1,
            None if doc.rev.is_none() => 1,
            _ => {
                debug!(checkpoint = id, "stale checkpoint token");
                return Ok(Response::json(
                    409,
                    &json!({"error": "conflict", "reason": "Document update conflict."}),
                ));
            }
        };
        let rev = format!("0-{generation}");
        doc.id = Some(format!("_local/{id}"));
        doc.rev = Some(rev.clone());
        checkpoints.insert(id.to_string(), (generation, doc));
        Ok(Response::json(
            201,
            &json!({"ok": true, "id": format!("_local/{id}"), "rev": rev}),
        ))
    }
}

/// A `feed=continuous` response body.
///
/// Rows go out as they are written. Once caught up, a heartbeat line is sent
/// immediately and then every `heartbeat` while idle.
struct ContinuousFeed {
    shared: Arc<Shared>,
    since: u64,
    filter: FeedFilter,
    heartbeat: Duration,
    announced: bool,
    epoch: u64,
    sequences: watch::Receiver<u64>,
    ended: bool,
}

#[async_trait]
impl ByteStream for ContinuousFeed {
    async fn next_chunk(&mut self) -> ReplicationResult<Option<Bytes>> {
        loop {
            if self.ended {
                return Ok(None);
            }
            self.shared.check_online()?;
            if self.shared.epoch.load(Ordering::SeqCst) != self.epoch {
                self.ended = true;
                let line = format!("{}\n", json!({"last_seq": self.since}));
                return Ok(Some(Bytes::from(line)));
            }

            self.sequences.borrow_and_update();
            let head = self.shared.store.last_sequence();
            let rows = self
                .shared
                .collect(self.since, head, &self.filter, usize::MAX)
                .map_err(|e| ReplicationError::transport_fatal(e.to_string()))?;
            if let Some(last) = rows.last().and_then(|r| r.seq.as_number()) {
                self.since = last;
                self.announced = false;
                let mut chunk = String::new();
                for row in &rows {
                    chunk.push_str(&change_row(row).to_string());
                    chunk.push('\n');
                }
                return Ok(Some(Bytes::from(chunk)));
            }
            if !self.announced {
                self.announced = true;
                return Ok(Some(Bytes::from_static(b"\n")));
            }
            match tokio::time::timeout(self.heartbeat, self.sequences.changed()).await {
                Ok(Ok(())) => continue,
                Ok(Err(_)) => return Ok(None),
                Err(_) => return Ok(Some(Bytes::from_static(b"\n"))),
            }
        }
    }
}

/// A stream response carrying an error status and an empty body.
struct EmptyBody;

#[async_trait]
impl ByteStream for EmptyBody {
    async fn next_chunk(&mut self) -> ReplicationResult<Option<Bytes>> {
        Ok(None)
    }
}

fn rejected_stream(response: Response) -> StreamResponse {
    StreamResponse {
        status: response.status,
        body: Box::new(EmptyBody),
    }
}

fn change_row(row: &ChangeRow) -> serde_json::Value {
    serde_json::to_value(row).unwrap_or_default()
}

fn since(query: &BTreeMap<String, String>) -> u64 {
    query
        .get("since")
        .and_then(|s| s.parse().ok())
        .unwrap_or(0)
}

fn heartbeat(query: &BTreeMap<String, String>) -> Duration {
    query
        .get("heartbeat")
        .and_then(|h| h.parse().ok())
        .map(Duration::from_millis)
        .unwrap_or(Duration::from_secs(10))
}

fn flag(query: &BTreeMap<String, String>, name: &str) -> bool {
    query.get(name).map(String::as_str) == Some("true")
}

fn decode<T: serde::de::DeserializeOwned>(request: &Request) -> Option<T> {
    serde_json::from_slice(request.body.as_deref()?).ok()
}

fn not_found() -> Response {
    Response::json(404, &json!({"error": "not_found", "reason": "missing"}))
}

fn bad_request(reason: &str) -> Response {
    Response::json(400, &json!({"error": "bad_request", "reason": reason}))
}

/// Decodes `%XX` escapes in a path segment.
fn percent_decode(segment: &str) -> String {
    let bytes = segment.as_bytes();
    let mut out = Vec::with_capacity(bytes.len());
    let mut i = 0;
    while i < bytes.len() {
        if bytes[i] == b'%' {
            if let Some(byte) = segment
                .get(i + 1..i + 3)
                .and_then(|hex| u8::from_str_radix(hex, 16).ok())
            {
                out.push(byte);
                i += 3;
                continue;
            }
        }
        out.push(bytes[i]);
        i += 1;
    }
    String::from_utf8_lossy(&out).into_owned()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fixtures::{insert_branch, props, put_doc};

    fn get(path: &str) -> Request {
        Request::get(path)
    }

    #[test]
    fn decodes_escaped_segments() {
        assert_eq!(percent_decode("a%20b%2Fc"), "a b/c");
        assert_eq!(percent_decode("100%"), "100%");
        assert_eq!(percent_decode("x+y"), "x+y");
    }

    #[test]
    fn routes_requests() {
        let remote = MemoryRemote::new("db");
        let route = |path: &str| remote.shared.parse(path).map(|t| t.route);
        assert_eq!(route("/db/"), Some(Route::Info));
        assert_eq!(route("/db/_changes?feed=normal"), Some(Route::Changes));
        assert_eq!(route("/db/_local/abc"), Some(Route::Local));
        assert_eq!(route("/db/a%2Fb"), Some(Route::Document));
        assert_eq!(route("/db/doc/file.txt?rev=1-a"), Some(Route::Attachment));
        assert_eq!(route("/other/doc"), None);
    }

    #[tokio::test]
    async fn serves_changes_pages() {
        let remote = MemoryRemote::new("db");
        for i in 0..3 {
            put_doc(&*remote.store(), &format!("doc{i}"), props(json!({"n": i})));
        }
        let response = remote
            .send(get("/db/_changes?feed=normal&style=all_docs&since=1&limit=1"))
            .await
            .unwrap();
        let body: serde_json::Value = response.decode().unwrap();
        assert_eq!(body["results"].as_array().unwrap().len(), 1);
        assert_eq!(body["results"][0]["id"], "doc1");
        assert_eq!(body["last_seq"], 2);
    }

    #[tokio::test]
    async fn conflicting_leaves_share_one_row() {
        let remote = MemoryRemote::new("db");
        let store = remote.store();
        insert_branch(&*store, "a", &["1-a"], props(json!({})));
        insert_branch(&*store, "a", &["2-b", "1-a"], props(json!({})));
        insert_branch(&*store, "a", &["2-a", "1-a"], props(json!({})));
        let response = remote
            .send(get("/db/_changes?feed=normal&style=all_docs&since=0"))
            .await
            .unwrap();
        let body: serde_json::Value = response.decode().unwrap();
        let results = body["results"].as_array().unwrap();
        assert_eq!(results.len(), 1);
        assert_eq!(results[0]["seq"], 3);
        assert_eq!(results[0]["changes"], json!([{"rev": "2-b"}, {"rev": "2-a"}]));
    }

    #[tokio::test]
    async fn local_documents_use_tokens() {
        let remote = MemoryRemote::new("db");
        let put = |rev: Option<&str>| {
            let mut body = json!({"lastSequencePushed": 1});
            if let Some(rev) = rev {
                body["_rev"] = json!(rev);
            }
            Request::json(Method::Put, "/db/_local/cp", &body).unwrap()
        };
        assert_eq!(remote.send(put(None)).await.unwrap().status, 201);
        assert_eq!(remote.send(put(None)).await.unwrap().status, 409);
        assert_eq!(remote.send(put(Some("0-1"))).await.unwrap().status, 201);
        assert_eq!(remote.checkpoint("cp").unwrap().rev.as_deref(), Some("0-2"));
    }

    #[tokio::test]
    async fn enforces_credentials_and_injected_failures() {
        let remote = MemoryRemote::new("db");
        let credentials = Credentials::Bearer("t0ken".into());
        remote.require_credentials(Some(&credentials));
        assert_eq!(remote.send(get("/db/")).await.unwrap().status, 401);
        let authorized = get("/db/").with_header("Authorization", credentials.header_value());
        assert_eq!(remote.send(authorized.clone()).await.unwrap().status, 200);

        remote.fail_next(Route::Info, 503, 1);
        assert_eq!(remote.send(authorized.clone()).await.unwrap().status, 503);
        assert_eq!(remote.send(authorized).await.unwrap().status, 200);
        assert_eq!(remote.request_count(Route::Info), 4);
    }

    #[tokio::test]
    async fn offline_remote_is_unreachable() {
        let remote = MemoryRemote::new("db");
        remote.set_offline(true);
        let err = remote.send(get("/db/")).await.unwrap_err();
        assert!(err.is_connectivity());
    }

    #[tokio::test]
    async fn continuous_feed_announces_catch_up() {
        let remote = MemoryRemote::new("db");
        put_doc(&*remote.store(), "a", props(json!({})));
        let mut stream = remote
            .open_stream(get("/db/_changes?feed=continuous&heartbeat=50"))
            .await
            .unwrap()
            .body;
        let rows = stream.next_chunk().await.unwrap().unwrap();
        assert!(String::from_utf8_lossy(&rows).contains("\"id\":\"a\""));
        assert_eq!(stream.next_chunk().await.unwrap().unwrap(), Bytes::from_static(b"\n"));

        remote.end_feeds();
        let last = stream.next_chunk().await.unwrap().unwrap();
        assert_eq!(String::from_utf8_lossy(&last), "{\"last_seq\":1}\n");
        assert!(stream.next_chunk().await.unwrap().is_none());
    }
}
