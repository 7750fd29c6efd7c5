//! Transport layer abstraction for replication.

use crate::config::RemoteEndpoint;
use crate::error::ReplicationResult;
use async_trait::async_trait;
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use bytes::Bytes;
use parking_lot::RwLock;
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

/// HTTP method.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Method {
    /// GET
    Get,
    /// PUT
    Put,
    /// POST
    Post,
    /// DELETE
    Delete,
}

impl fmt::Display for Method {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Method::Get => "GET",
            Method::Put => "PUT",
            Method::Post => "POST",
            Method::Delete => "DELETE",
        })
    }
}

/// An outgoing request. `path` includes the query string.
#[derive(Debug, Clone, PartialEq)]
pub struct Request {
    /// Method.
    pub method: Method,
    /// Absolute path and query, e.g. `/db/_changes?feed=normal`.
    pub path: String,
    /// Header name/value pairs.
    pub headers: Vec<(String, String)>,
    /// Body bytes.
    pub body: Option<Bytes>,
}

impl Request {
    /// Creates a bodiless request.
    pub fn new(method: Method, path: impl Into<String>) -> Self {
        Self {
            method,
            path: path.into(),
            headers: vec![("Accept".into(), "application/json".into())],
            body: None,
        }
    }

    /// Creates a GET request.
    pub fn get(path: impl Into<String>) -> Self {
        Self::new(Method::Get, path)
    }

    /// Creates a request with a JSON body.
    pub fn json<T: Serialize>(
        method: Method,
        path: impl Into<String>,
        body: &T,
    ) -> ReplicationResult<Self> {
        let bytes = serde_json::to_vec(body)?;
        Ok(Self::new(method, path)
            .with_header("Content-Type", "application/json")
            .with_body(bytes))
    }

    /// Adds a header, replacing any existing one with the same name.
    pub fn with_header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.set_header(name, value);
        self
    }

    /// Sets a header in place.
    pub fn set_header(&mut self, name: impl Into<String>, value: impl Into<String>) {
        let name = name.into();
        self.headers.retain(|(n, _)| !n.eq_ignore_ascii_case(&name));
        self.headers.push((name, value.into()));
    }

    /// Sets the body.
    pub fn with_body(mut self, body: impl Into<Bytes>) -> Self {
        self.body = Some(body.into());
        self
    }

    /// Returns a header value (case-insensitive name).
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(n, _)| n.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }
}

/// A complete response.
#[derive(Debug, Clone, PartialEq)]
pub struct Response {
    /// HTTP status code.
    pub status: u16,
    /// Body bytes.
    pub body: Bytes,
}

impl Response {
    /// Creates a response.
    pub fn new(status: u16, body: impl Into<Bytes>) -> Self {
        Self {
            status,
            body: body.into(),
        }
    }

    /// Creates a response with a JSON body.
    pub fn json<T: Serialize>(status: u16, body: &T) -> Self {
        Self::new(status, serde_json::to_vec(body).unwrap_or_default())
    }

    /// Returns true for 2xx statuses.
    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status)
    }

    /// Decodes the body as JSON.
    pub fn decode<T: DeserializeOwned>(&self) -> ReplicationResult<T> {
        Ok(serde_json::from_slice(&self.body)?)
    }
}

/// Incremental reader for a long-lived response body.
#[async_trait]
pub trait ByteStream: Send {
    /// Returns the next chunk, or `None` once the stream has ended.
    async fn next_chunk(&mut self) -> ReplicationResult<Option<Bytes>>;
}

/// The head of a streaming response.
pub struct StreamResponse {
    /// HTTP status code.
    pub status: u16,
    /// Body reader.
    pub body: Box<dyn ByteStream>,
}

impl fmt::Debug for StreamResponse {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StreamResponse")
            .field("status", &self.status)
            .finish_non_exhaustive()
    }
}

/// A duplex connection to a remote peer.
///
/// This trait abstracts the network layer, allowing for different
/// implementations (an HTTP client, an in-process test double, etc.).
/// Implementations report unreachable peers as retryable transport errors
/// and do not interpret status codes.
#[async_trait]
pub trait Transport: Send + Sync {
    /// Opens (or verifies) the connection to the remote.
    async fn connect(&self, endpoint: &RemoteEndpoint) -> ReplicationResult<()>;

    /// Sends a request and reads the whole response.
    async fn send(&self, request: Request) -> ReplicationResult<Response>;

    /// Sends a request and returns a handle that reads the body incrementally.
    async fn open_stream(&self, request: Request) -> ReplicationResult<StreamResponse>;
}

/// Credentials for one peer.
#[derive(Clone, PartialEq, Eq)]
pub enum Credentials {
    /// HTTP basic authentication.
    Basic {
        /// User name.
        username: String,
        /// Password.
        password: String,
    },
    /// Bearer token.
    Bearer(String),
}

impl Credentials {
    /// Returns the `Authorization` header value.
    pub fn header_value(&self) -> String {
        match self {
            Credentials::Basic { username, password } => {
                format!("Basic {}", BASE64.encode(format!("{username}:{password}")))
            }
            Credentials::Bearer(token) => format!("Bearer {token}"),
        }
    }
}

impl fmt::Debug for Credentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Credentials::Basic { username, .. } => f
                .debug_struct("Basic")
                .field("username", username)
                .field("password", &"---")
                .finish(),
            Credentials::Bearer(_) => f.debug_tuple("Bearer").field(&"---").finish(),
        }
    }
}

/// Obtains fresh credentials for a peer.
pub type CredentialRefresher = Arc<dyn Fn(&str) -> Option<Credentials> + Send + Sync>;

/// Credentials keyed by peer identity, owned by whoever builds replicators.
///
/// There is no process-wide registry: each store lives exactly as long as
/// its owner and is shared explicitly.
#[derive(Default)]
pub struct CredentialStore {
    credentials: RwLock<HashMap<String, Credentials>>,
    refresher: RwLock<Option<CredentialRefresher>>,
}

impl fmt::Debug for CredentialStore {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CredentialStore")
            .field("peers", &self.credentials.read().keys().collect::<Vec<_>>())
            .finish_non_exhaustive()
    }
}

impl CredentialStore {
    /// Creates an empty store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Stores credentials for a peer.
    pub fn set(&self, peer: impl Into<String>, credentials: Credentials) {
        self.credentials.write().insert(peer.into(), credentials);
    }

    /// Returns the credentials for a peer.
    pub fn get(&self, peer: &str) -> Option<Credentials> {
        self.credentials.read().get(peer).cloned()
    }

    /// Forgets a peer.
    pub fn remove(&self, peer: &str) {
        self.credentials.write().remove(peer);
    }

    /// Installs the collaborator used to refresh rejected credentials.
    pub fn set_refresher(&self, refresher: CredentialRefresher) {
        *self.refresher.write() = Some(refresher);
    }

    /// Asks the refresher for new credentials. Returns true if they changed.
    pub fn refresh(&self, peer: &str) -> bool {
        let Some(refresher) = self.refresher.read().clone() else {
            return false;
        };
        match refresher(peer) {
            Some(fresh) if self.get(peer).as_ref() != Some(&fresh) => {
                self.set(peer, fresh);
                true
            }
            _ => false,
        }
    }
}

/// Attaches credentials to outgoing requests.
#[async_trait]
pub trait Authenticator: Send + Sync {
    /// Adds credentials to a request.
    fn authorize(&self, request: &mut Request);

    /// Called once after a 401. Returns true if the request should be retried.
    async fn refresh(&self) -> bool {
        false
    }
}

/// Authenticator backed by a [`CredentialStore`] entry.
#[derive(Debug, Clone)]
pub struct StoredCredentials {
    store: Arc<CredentialStore>,
    peer: String,
}

impl StoredCredentials {
    /// Uses the credentials stored for `peer`.
    pub fn new(store: Arc<CredentialStore>, peer: impl Into<String>) -> Self {
        Self {
            store,
            peer: peer.into(),
        }
    }
}

#[async_trait]
impl Authenticator for StoredCredentials {
    fn authorize(&self, request: &mut Request) {
        if let Some(credentials) = self.store.get(&self.peer) {
            request.set_header("Authorization", credentials.header_value());
        }
    }

    async fn refresh(&self) -> bool {
        self.store.refresh(&self.peer)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn request_headers_are_case_insensitive() {
        let request = Request::get("/db/")
            .with_header("authorization", "a")
            .with_header("Authorization", "b");
        assert_eq!(request.header("AUTHORIZATION"), Some("b"));
        assert_eq!(
            request
                .headers
                .iter()
                .filter(|(n, _)| n.eq_ignore_ascii_case("authorization"))
                .count(),
            1
        );
    }

    #[test]
    fn json_request_and_response() {
        let request = Request::json(Method::Post, "/db/_revs_diff", &serde_json::json!({}))
            .unwrap();
        assert_eq!(request.header("content-type"), Some("application/json"));
        assert_eq!(request.body.as_deref(), Some(&b"{}"[..]));

        let response = Response::json(200, &serde_json::json!({"ok": true}));
        assert!(response.is_success());
        let value: serde_json::Value = response.decode().unwrap();
        assert_eq!(value["ok"], true);
        assert!(!Response::new(404, "").is_success());
    }

    #[test]
    fn basic_credentials_header() {
        let creds = Credentials::Basic {
            username: "ann".into(),
            password: "secret".into(),
        };
        assert_eq!(creds.header_value(), "Basic YW5uOnNlY3JldA==");
        assert!(!format!("{creds:?}").contains("secret"));
    }

    #[tokio::test]
    async fn stored_credentials_refresh_once() {
        let store = Arc::new(CredentialStore::new());
        store.set("peer", Credentials::Bearer("old".into()));
        let auth = StoredCredentials::new(Arc::clone(&store), "peer");

        let mut request = Request::get("/db/");
        auth.authorize(&mut request);
        assert_eq!(request.header("Authorization"), Some("Bearer old"));

        assert!(!auth.refresh().await);
        store.set_refresher(Arc::new(|_: &str| Some(Credentials::Bearer("new".into()))));
        assert!(auth.refresh().await);
        // Same credentials again: nothing to retry with.
        assert!(!auth.refresh().await);

        auth.authorize(&mut request);
        assert_eq!(request.header("Authorization"), Some("Bearer new"));
    }
}
