//! Configuration for replication.

use crate::error::{ReplicationError, ReplicationResult};
use revsync_protocol::CheckpointSettings;
use std::collections::BTreeMap;
use std::time::Duration;
use url::Url;

/// Which way revisions flow.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    /// Local to remote.
    Push,
    /// Remote to local.
    Pull,
    /// Both ways.
    PushAndPull,
}

impl Direction {
    /// Returns true if remote changes are pulled.
    pub fn pulls(self) -> bool {
        matches!(self, Direction::Pull | Direction::PushAndPull)
    }

    /// Returns true if local changes are pushed.
    pub fn pushes(self) -> bool {
        matches!(self, Direction::Push | Direction::PushAndPull)
    }
}

/// `_changes` feed style used by continuous replication.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FeedMode {
    /// One finite response per request.
    Normal,
    /// The request blocks until there is at least one change.
    LongPoll,
    /// The connection stays open; rows arrive newline-delimited.
    Continuous,
}

impl FeedMode {
    /// Value of the `feed=` query parameter.
    pub fn as_str(self) -> &'static str {
        match self {
            FeedMode::Normal => "normal",
            FeedMode::LongPoll => "longpoll",
            FeedMode::Continuous => "continuous",
        }
    }
}

/// When attachment bodies are downloaded.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AttachmentMode {
    /// Inline with the revision body.
    Eager,
    /// With a separate request per blob after the body arrives.
    Lazy,
}

/// Address of the remote database.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemoteEndpoint {
    /// Host name.
    pub host: String,
    /// TCP port.
    pub port: u16,
    /// Whether to use TLS.
    pub tls: bool,
    /// Database name.
    pub db: String,
}

impl RemoteEndpoint {
    /// Creates an endpoint.
    pub fn new(host: impl Into<String>, port: u16, tls: bool, db: impl Into<String>) -> Self {
        Self {
            host: host.into(),
            port,
            tls,
            db: db.into(),
        }
    }

    /// Parses `http[s]://[user:pass@]host[:port]/db`. Credentials are dropped.
    pub fn parse(url: &str) -> ReplicationResult<Self> {
        let parsed = Url::parse(url).map_err(|e| {
            ReplicationError::Config(format!("invalid remote URL {}: {e}", mask_credentials(url)))
        })?;
        let tls = match parsed.scheme() {
            "https" => true,
            "http" => false,
            other => {
                return Err(ReplicationError::Config(format!(
                    "unsupported scheme {other}"
                )))
            }
        };
        let host = parsed
            .host_str()
            .ok_or_else(|| ReplicationError::Config("remote URL has no host".into()))?;
        let db = parsed
            .path_segments()
            .and_then(|mut segments| segments.find(|s| !s.is_empty()))
            .ok_or_else(|| ReplicationError::Config("remote URL has no database".into()))?;
        Ok(Self::new(
            host,
            parsed.port_or_known_default().unwrap_or(if tls { 443 } else { 80 }),
            tls,
            db,
        ))
    }

    /// Returns the server root, e.g. `https://db.example.com:443/`.
    pub fn server_url(&self) -> String {
        let scheme = if self.tls { "https" } else { "http" };
        format!("{scheme}://{}:{}/", self.host, self.port)
    }

    /// Returns the database URL without credentials.
    pub fn database_url(&self) -> String {
        format!("{}{}", self.server_url(), self.db)
    }
}

/// Replaces the user-info part of a URL with `---:---`.
pub fn mask_credentials(url: &str) -> String {
    let Some(scheme_end) = url.find("://") else {
        return url.to_string();
    };
    let authority_start = scheme_end + 3;
    let authority_end = url[authority_start..]
        .find('/')
        .map_or(url.len(), |i| authority_start + i);
    match url[authority_start..authority_end].rfind('@') {
        Some(at) => format!(
            "{}---:---{}",
            &url[..authority_start],
            &url[authority_start + at..]
        ),
        None => url.to_string(),
    }
}

/// Configuration for one replication.
#[derive(Debug, Clone)]
pub struct ReplicatorConfig {
    /// Remote database.
    pub remote: RemoteEndpoint,
    /// Push, pull or both.
    pub direction: Direction,
    /// Keep running after catching up.
    pub continuous: bool,
    /// Feed style for continuous replication; one-shot always polls.
    pub feed_mode: FeedMode,
    /// Named remote filter.
    pub filter: Option<String>,
    /// Parameters passed to the filter.
    pub filter_params: BTreeMap<String, serde_json::Value>,
    /// Restrict replication to these documents.
    pub doc_ids: Option<Vec<String>>,
    /// `limit=` for polled feeds.
    pub changes_limit: usize,
    /// Entries collected before the puller processes a batch.
    pub pull_batch_size: usize,
    /// Longest a partial pull batch waits for more entries.
    pub pull_batch_delay: Duration,
    /// Window in which repeated changes to one document are folded.
    pub debounce_window: Duration,
    /// Revisions per `_bulk_get` request.
    pub max_revs_per_bulk_get: usize,
    /// Local changes per push batch.
    pub push_batch_size: usize,
    /// Attempts per revision fetch before the document is reported failed.
    pub max_fetch_attempts: u32,
    /// Attachment download strategy.
    pub attachment_mode: AttachmentMode,
    /// Per-request timeout.
    pub request_timeout: Duration,
    /// Heartbeat requested from the remote feed.
    pub heartbeat: Duration,
    /// Delay between polls of a normal feed in continuous replication.
    pub poll_interval: Duration,
    /// How long `stop` waits for in-flight batches.
    pub stop_timeout: Duration,
    /// Pending feed batches before the tracker pauses.
    pub tracker_backlog: usize,
    /// Backoff for reconnects and retries.
    pub retry: RetryConfig,
}

impl ReplicatorConfig {
    /// Creates a configuration with default tuning.
    pub fn new(remote: RemoteEndpoint, direction: Direction) -> Self {
        Self {
            remote,
            direction,
            continuous: false,
            feed_mode: FeedMode::LongPoll,
            filter: None,
            filter_params: BTreeMap::new(),
            doc_ids: None,
            changes_limit: 50,
            pull_batch_size: 200,
            pull_batch_delay: Duration::from_millis(500),
            debounce_window: Duration::from_millis(100),
            max_revs_per_bulk_get: 50,
            push_batch_size: 100,
            max_fetch_attempts: 3,
            attachment_mode: AttachmentMode::Eager,
            request_timeout: Duration::from_secs(30),
            heartbeat: Duration::from_secs(300),
            poll_interval: Duration::from_secs(10),
            stop_timeout: Duration::from_secs(10),
            tracker_backlog: 200,
            retry: RetryConfig::default(),
        }
    }

    /// Enables or disables continuous replication.
    pub fn with_continuous(mut self, continuous: bool) -> Self {
        self.continuous = continuous;
        self
    }

    /// Sets the feed mode for continuous replication.
    pub fn with_feed_mode(mut self, mode: FeedMode) -> Self {
        self.feed_mode = mode;
        self
    }

    /// Sets a named filter and its parameters.
    pub fn with_filter(
        mut self,
        name: impl Into<String>,
        params: BTreeMap<String, serde_json::Value>,
    ) -> Self {
        self.filter = Some(name.into());
        self.filter_params = params;
        self
    }

    /// Restricts replication to the given documents.
    pub fn with_doc_ids(mut self, doc_ids: Vec<String>) -> Self {
        self.doc_ids = Some(doc_ids);
        self
    }

    /// Sets the `_changes` page size.
    pub fn with_changes_limit(mut self, limit: usize) -> Self {
        self.changes_limit = limit;
        self
    }

    /// Sets the pull batch size and delay.
    pub fn with_pull_batch(mut self, size: usize, delay: Duration) -> Self {
        self.pull_batch_size = size;
        self.pull_batch_delay = delay;
        self
    }

    /// Sets the debounce window.
    pub fn with_debounce_window(mut self, window: Duration) -> Self {
        self.debounce_window = window;
        self
    }

    /// Sets the push batch size.
    pub fn with_push_batch_size(mut self, size: usize) -> Self {
        self.push_batch_size = size;
        self
    }

    /// Sets the number of fetch attempts per revision.
    pub fn with_max_fetch_attempts(mut self, attempts: u32) -> Self {
        self.max_fetch_attempts = attempts;
        self
    }

    /// Sets the attachment mode.
    pub fn with_attachment_mode(mut self, mode: AttachmentMode) -> Self {
        self.attachment_mode = mode;
        self
    }

    /// Sets the request timeout.
    pub fn with_request_timeout(mut self, timeout: Duration) -> Self {
        self.request_timeout = timeout;
        self
    }

    /// Sets the heartbeat interval.
    pub fn with_heartbeat(mut self, heartbeat: Duration) -> Self {
        self.heartbeat = heartbeat;
        self
    }

    /// Sets the poll interval for normal feeds.
    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    /// Sets the stop timeout.
    pub fn with_stop_timeout(mut self, timeout: Duration) -> Self {
        self.stop_timeout = timeout;
        self
    }

    /// Sets the tracker backlog.
    pub fn with_tracker_backlog(mut self, backlog: usize) -> Self {
        self.tracker_backlog = backlog;
        self
    }

    /// Sets the retry configuration.
    pub fn with_retry(mut self, retry: RetryConfig) -> Self {
        self.retry = retry;
        self
    }

    /// Checks that the configuration can work.
    pub fn validate(&self) -> ReplicationResult<()> {
        if self.remote.host.is_empty() {
            return Err(ReplicationError::Config("remote host is empty".into()));
        }
        if self.remote.db.is_empty() || self.remote.db.starts_with('_') {
            return Err(ReplicationError::Config(format!(
                "invalid database name {:?}",
                self.remote.db
            )));
        }
        if self.pull_batch_size == 0
            || self.push_batch_size == 0
            || self.changes_limit == 0
            || self.max_revs_per_bulk_get == 0
            || self.tracker_backlog == 0
        {
            return Err(ReplicationError::Config("batch sizes must be non-zero".into()));
        }
        if self.max_fetch_attempts == 0 {
            return Err(ReplicationError::Config(
                "max_fetch_attempts must be at least 1".into(),
            ));
        }
        Ok(())
    }

    /// Feed style actually used: one-shot replication always polls.
    pub fn effective_feed_mode(&self) -> FeedMode {
        if self.continuous {
            self.feed_mode
        } else {
            FeedMode::Normal
        }
    }

    /// Settings identifying this replication's checkpoint.
    pub fn checkpoint_settings(&self, local_uuid: &str) -> CheckpointSettings {
        CheckpointSettings {
            local_uuid: local_uuid.to_string(),
            remote_url: self.remote.database_url(),
            filter: self.filter.clone(),
            filter_params: self.filter_params.clone(),
            doc_ids: self.doc_ids.clone(),
        }
    }

    /// Returns true if `doc_id` passes the doc-ID restriction.
    pub fn allows(&self, doc_id: &str) -> bool {
        self.doc_ids
            .as_ref()
            .map_or(true, |ids| ids.iter().any(|id| id == doc_id))
    }
}

/// Configuration for retry behavior.
#[derive(Debug, Clone)]
pub struct RetryConfig {
    /// Maximum number of retry attempts.
    pub max_attempts: u32,
    /// Initial delay between retries.
    pub initial_delay: Duration,
    /// Maximum delay between retries.
    pub max_delay: Duration,
    /// Multiplier for exponential backoff.
    pub backoff_multiplier: f64,
    /// Whether to add jitter to delays.
    pub add_jitter: bool,
}

impl RetryConfig {
    /// Creates a new retry configuration.
    pub fn new(max_attempts: u32) -> Self {
        Self {
            max_attempts,
            initial_delay: Duration::from_millis(100),
            max_delay: Duration::from_secs(30),
            backoff_multiplier: 2.0,
            add_jitter: true,
        }
    }

    /// Creates a configuration with no retries.
    pub fn no_retry() -> Self {
        Self {
            max_attempts: 1,
            initial_delay: Duration::ZERO,
            max_delay: Duration::ZERO,
            backoff_multiplier: 1.0,
            add_jitter: false,
        }
    }

    /// Sets the initial delay.
    pub fn with_initial_delay(mut self, delay: Duration) -> Self {
        self.initial_delay = delay;
        self
    }

    /// Sets the maximum delay.
    pub fn with_max_delay(mut self, delay: Duration) -> Self {
        self.max_delay = delay;
        self
    }

    /// Sets the backoff multiplier.
    pub fn with_backoff_multiplier(mut self, multiplier: f64) -> Self {
        self.backoff_multiplier = multiplier;
        self
    }

    /// Enables or disables jitter.
    pub fn with_jitter(mut self, jitter: bool) -> Self {
        self.add_jitter = jitter;
        self
    }

    /// Calculates the delay for a given attempt (0-indexed).
    ///
    /// Attempt 0 has no delay; attempt `n` waits
    /// `initial_delay * multiplier^(n-1)`, never more than `max_delay`.
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        if attempt == 0 {
            return Duration::ZERO;
        }

        let exponent = i32::try_from(attempt.saturating_sub(1)).unwrap_or(i32::MAX);
        let base_delay = self.initial_delay.as_secs_f64() * self.backoff_multiplier.powi(exponent);
        let max = self.max_delay.as_secs_f64();
        let mut delay_secs = base_delay.min(max);

        if self.add_jitter {
            // Up to 25% jitter, still bounded by the cap.
            delay_secs = (delay_secs + delay_secs * 0.25 * rand::random::<f64>()).min(max);
        }
        Duration::from_secs_f64(delay_secs)
    }
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self::new(3)
    }
}
