//! Follows the remote `_changes` feed.
//!
//! The tracker turns feed rows into [`ChangeEntry`] batches for the puller.
//! Polled feeds (`normal`, `longpoll`) are paged with `since=`; continuous
//! feeds are parsed incrementally as bytes arrive. Repeated rows for the same
//! document inside the debounce window are folded into the latest one.
//!
//! Connection failures and server-side 5xx answers are retried forever with
//! capped exponential backoff, reset whenever data arrives. Anything else
//! (bad credentials, an unknown filter, a malformed response) ends the tracker.

use crate::backoff::Backoff;
use crate::config::{Direction, FeedMode, ReplicatorConfig};
use crate::coordinator::WorkerEvent;
use crate::error::{ReplicationError, ReplicationResult};
use crate::remote::{ChangesQuery, RemoteDatabase};
use revsync_protocol::{ChangeEntry, ChangeRow, FeedLine, FeedParser, RemoteSeq};
use std::collections::HashSet;
use std::future::Future;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace, warn};

/// Output of the tracker, consumed by the puller.
#[derive(Debug, Clone, PartialEq)]
pub enum TrackerEvent {
    /// New entries, in feed order.
    Changes(Vec<ChangeEntry>),
    /// The feed has nothing more right now.
    CaughtUp(Option<RemoteSeq>),
}

/// Buffer that keeps only the newest row per document.
#[derive(Debug, Default)]
struct Debouncer {
    entries: Vec<ChangeEntry>,
    opened: Option<Instant>,
}

impl Debouncer {
    fn push(&mut self, row: Vec<ChangeEntry>) {
        if row.is_empty() {
            return;
        }
        let ids: HashSet<&str> = row.iter().map(|e| e.doc_id.as_str()).collect();
        let before = self.entries.len();
        self.entries.retain(|e| !ids.contains(e.doc_id.as_str()));
        if self.entries.len() != before {
            trace!(folded = before - self.entries.len(), "folded repeated changes");
        }
        self.entries.extend(row);
        self.opened.get_or_insert_with(Instant::now);
    }

    fn deadline(&self, window: std::time::Duration) -> Option<Instant> {
        self.opened.map(|opened| opened + window)
    }

    fn len(&self) -> usize {
        self.entries.len()
    }

    fn take(&mut self) -> Vec<ChangeEntry> {
        self.opened = None;
        std::mem::take(&mut self.entries)
    }
}

enum Outcome {
    /// One-shot replication has read the whole feed.
    Finished,
    /// The connection ended; open a new one.
    Reconnect,
}

/// Reads the remote changes feed and forwards entries to the puller.
pub struct ChangeTracker {
    remote: Arc<RemoteDatabase>,
    config: Arc<ReplicatorConfig>,
    output: mpsc::Sender<TrackerEvent>,
    events: mpsc::UnboundedSender<WorkerEvent>,
    cancel: CancellationToken,
    since: Option<RemoteSeq>,
}

impl ChangeTracker {
    /// Creates a tracker that resumes after `since`.
    pub fn new(
        remote: Arc<RemoteDatabase>,
        config: Arc<ReplicatorConfig>,
        since: Option<RemoteSeq>,
        output: mpsc::Sender<TrackerEvent>,
        events: mpsc::UnboundedSender<WorkerEvent>,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            remote,
            config,
            output,
            events,
            cancel,
            since,
        }
    }

    /// Runs until the feed is exhausted (one-shot), cancellation, or a fatal error.
    pub async fn run(mut self) -> ReplicationResult<()> {
        let mode = self.config.effective_feed_mode();
        info!(feed = mode.as_str(), since = ?self.since.as_ref().map(ToString::to_string), "change tracker started");
        let mut backoff = Backoff::new(self.config.retry.clone());

        loop {
            let result = match mode {
                FeedMode::Continuous => self.stream(&mut backoff).await,
                FeedMode::Normal | FeedMode::LongPoll => self.poll(&mut backoff).await,
            };
            match result {
                Ok(Outcome::Finished) => {
                    debug!("changes feed exhausted");
                    return Ok(());
                }
                Ok(Outcome::Reconnect) => {
                    trace!("changes feed closed; reconnecting");
                }
                Err(ReplicationError::Cancelled) => return Ok(()),
                Err(err) if !err.is_retryable() => {
                    warn!(error = %err, "change tracker stopped");
                    return Err(err);
                }
                Err(err) => {
                    let delay = backoff.next_delay();
                    warn!(error = %err, attempt = backoff.failures(), ?delay, "changes feed failed; retrying");
                    let _ = self.events.send(WorkerEvent::Retrying {
                        direction: Direction::Pull,
                        error: Arc::new(err),
                        delay,
                    });
                    if !Backoff::sleep(delay, &self.cancel).await {
                        return Ok(());
                    }
                }
            }
        }
    }

    async fn poll(&mut self, backoff: &mut Backoff) -> ReplicationResult<Outcome> {
        loop {
            let query = ChangesQuery::for_config(&self.config, self.since.clone());
            let response = self.cancellable(self.remote.changes(&query)).await?;
            self.connected(backoff);

            let rows = response.rows();
            let row_count = rows.len();
            let mut batch = Debouncer::default();
            for row in rows {
                match row {
                    Ok(row) => batch.push(row.into_entries()),
                    Err(err) => warn!(error = %err, "skipping malformed change row"),
                }
            }
            let entries = batch.take();
            let resume = response
                .last_seq
                .clone()
                .or_else(|| entries.last().map(|e| e.sequence.clone()));
            if !entries.is_empty() {
                debug!(count = entries.len(), "received changes");
                self.send(TrackerEvent::Changes(entries)).await?;
            }
            if resume.is_some() {
                self.since = resume;
            }

            let drained = match query.limit {
                Some(limit) => row_count < limit,
                None => true,
            };
            if !drained {
                continue;
            }
            self.send(TrackerEvent::CaughtUp(self.since.clone())).await?;
            if !self.config.continuous {
                return Ok(Outcome::Finished);
            }
            if query.feed == FeedMode::Normal
                && !Backoff::sleep(self.config.poll_interval, &self.cancel).await
            {
                return Err(ReplicationError::Cancelled);
            }
        }
    }

    async fn stream(&mut self, backoff: &mut Backoff) -> ReplicationResult<Outcome> {
        let query = ChangesQuery::for_config(&self.config, self.since.clone());
        let mut body = self.cancellable(self.remote.open_changes_stream(&query)).await?;
        self.connected(backoff);

        let read_timeout = self.config.heartbeat + self.config.request_timeout;
        let mut parser = FeedParser::new();
        let mut pending = Debouncer::default();
        let cancel = self.cancel.clone();

        loop {
            let deadline = pending.deadline(self.config.debounce_window);
            let chunk = tokio::select! {
                biased;
                _ = cancel.cancelled() => return Err(ReplicationError::Cancelled),
                _ = sleep_until(deadline) => {
                    self.flush(&mut pending).await?;
                    continue;
                }
                chunk = tokio::time::timeout(read_timeout, body.next_chunk()) => {
                    chunk.map_err(|_| ReplicationError::Timeout(read_timeout))??
                }
            };

            let Some(chunk) = chunk else {
                if let Some(line) = parser.finish() {
                    if self.handle_line(line, &mut pending).await? {
                        return Ok(Outcome::Reconnect);
                    }
                }
                self.flush(&mut pending).await?;
                return Ok(Outcome::Reconnect);
            };
            backoff.reset();
            for line in parser.push(&chunk) {
                if self.handle_line(line, &mut pending).await? {
                    return Ok(Outcome::Reconnect);
                }
            }
        }
    }

    /// Applies one feed line. Returns true if the feed signalled its end.
    async fn handle_line(
        &mut self,
        line: FeedLine,
        pending: &mut Debouncer,
    ) -> ReplicationResult<bool> {
        match line {
            FeedLine::Change(row) => {
                self.push_row(row, pending);
                if pending.len() >= self.config.pull_batch_size {
                    self.flush(pending).await?;
                }
                Ok(false)
            }
            FeedLine::Heartbeat => {
                self.flush(pending).await?;
                self.send(TrackerEvent::CaughtUp(self.since.clone())).await?;
                Ok(false)
            }
            FeedLine::LastSeq(seq) => {
                self.flush(pending).await?;
                self.since = Some(seq);
                self.send(TrackerEvent::CaughtUp(self.since.clone())).await?;
                Ok(true)
            }
            FeedLine::Malformed { line, reason } => {
                warn!(%line, %reason, "skipping malformed feed line");
                Ok(false)
            }
        }
    }

    fn push_row(&self, row: ChangeRow, pending: &mut Debouncer) {
        trace!(doc_id = %row.id, seq = %row.seq, "feed row");
        pending.push(row.into_entries());
    }

    async fn flush(&mut self, pending: &mut Debouncer) -> ReplicationResult<()> {
        let entries = pending.take();
        let Some(last) = entries.last() else {
            return Ok(());
        };
        let resume = last.sequence.clone();
        debug!(count = entries.len(), "received changes");
        self.send(TrackerEvent::Changes(entries)).await?;
        self.since = Some(resume);
        Ok(())
    }

    fn connected(&self, backoff: &mut Backoff) {
        if backoff.failures() > 0 {
            info!(after = backoff.failures(), "changes feed reconnected");
        }
        backoff.reset();
        let _ = self.events.send(WorkerEvent::Connected(Direction::Pull));
    }

    /// Hands an event to the puller, waiting while its queue is full.
    async fn send(&self, event: TrackerEvent) -> ReplicationResult<()> {
        tokio::select! {
            biased;
            _ = self.cancel.cancelled() => Err(ReplicationError::Cancelled),
            sent = self.output.send(event) => sent.map_err(|_| ReplicationError::Cancelled),
        }
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

async fn sleep_until(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => tokio::time::sleep_until(deadline).await,
        None => std::future::pending().await,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{RemoteEndpoint, RetryConfig};
    use crate::test_support::{Script, ScriptedTransport};
    use crate::transport::Response;
    use revsync_protocol::RevId;
    use serde_json::json;
    use std::time::Duration;

    fn config() -> ReplicatorConfig {
        ReplicatorConfig::new(
            RemoteEndpoint::new("peer", 5984, false, "db"),
            Direction::Pull,
        )
        .with_retry(
            RetryConfig::new(u32::MAX)
                .with_initial_delay(Duration::from_millis(10))
                .with_jitter(false),
        )
    }

    struct Harness {
        transport: Arc<ScriptedTransport>,
        output: mpsc::Receiver<TrackerEvent>,
        events: mpsc::UnboundedReceiver<WorkerEvent>,
        cancel: CancellationToken,
        tracker: Option<ChangeTracker>,
    }

    fn harness(config: ReplicatorConfig, transport: ScriptedTransport) -> Harness {
        harness_with_backlog(config, transport, 16)
    }

    fn harness_with_backlog(
        config: ReplicatorConfig,
        transport: ScriptedTransport,
        backlog: usize,
    ) -> Harness {
        let transport = Arc::new(transport);
        let remote = RemoteDatabase::new(
            Arc::clone(&transport) as Arc<dyn crate::transport::Transport>,
            None,
            config.remote.clone(),
            Duration::from_secs(5),
        )
        .unwrap();
        let (tx, output) = mpsc::channel(backlog);
        let (events_tx, events) = mpsc::unbounded_channel();
        let cancel = CancellationToken::new();
        let tracker = ChangeTracker::new(
            Arc::new(remote),
            Arc::new(config),
            None,
            tx,
            events_tx,
            cancel.clone(),
        );
        Harness {
            transport,
            output,
            events,
            cancel,
            tracker: Some(tracker),
        }
    }

    fn row(seq: u64, id: &str, rev: &str) -> serde_json::Value {
        json!({"seq": seq, "id": id, "changes": [{"rev": rev}]})
    }

    fn rev(s: &str) -> RevId {
        RevId::parse(s).unwrap()
    }

    #[tokio::test]
    async fn one_shot_pages_until_short_page() {
        let mut config = config();
        config.changes_limit = 2;
        let transport = ScriptedTransport::answering(vec![
            Response::json(200, &json!({"results": [row(1, "a", "1-a"), row(2, "b", "1-b")], "last_seq": 2})),
            Response::json(200, &json!({"results": [row(3, "c", "1-c")], "last_seq": 3})),
        ]);
        let mut h = harness(config, transport);
        h.tracker.take().unwrap().run().await.unwrap();

        let first = h.output.recv().await.unwrap();
        assert!(matches!(first, TrackerEvent::Changes(ref e) if e.len() == 2));
        let second = h.output.recv().await.unwrap();
        assert!(matches!(second, TrackerEvent::Changes(ref e) if e[0].doc_id == "c"));
        assert_eq!(
            h.output.recv().await.unwrap(),
            TrackerEvent::CaughtUp(Some(RemoteSeq::Number(3)))
        );

        let paths = h.transport.paths();
        assert_eq!(paths.len(), 2);
        assert!(paths[0].contains("feed=normal"));
        assert!(!paths[0].contains("since="));
        assert!(paths[1].contains("since=2"));
    }

    #[tokio::test]
    async fn full_backlog_pauses_the_feed() {
        let mut config = config();
        config.changes_limit = 1;
        let transport = ScriptedTransport::answering(vec![
            Response::json(200, &json!({"results": [row(1, "a", "1-a")], "last_seq": 1})),
            Response::json(200, &json!({"results": [row(2, "b", "1-b")], "last_seq": 2})),
            Response::json(200, &json!({"results": [], "last_seq": 2})),
        ]);
        let mut h = harness_with_backlog(config, transport, 1);
        let tracker = tokio::spawn(h.tracker.take().unwrap().run());

        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(h.transport.paths().len(), 2);
        assert!(!tracker.is_finished());

        let mut ids = Vec::new();
        while let Some(event) = h.output.recv().await {
            match event {
                TrackerEvent::Changes(entries) => {
                    ids.extend(entries.into_iter().map(|e| e.doc_id));
                }
                TrackerEvent::CaughtUp(_) => break,
            }
        }
        assert_eq!(ids, ["a", "b"]);
        tracker.await.unwrap().unwrap();
        assert_eq!(h.transport.paths().len(), 3);
    }

    #[tokio::test]
    async fn malformed_rows_are_skipped() {
        let transport = ScriptedTransport::answering(vec![Response::json(
            200,
            &json!({"results": [row(1, "a", "1-a"), {"seq": 2, "id": "b", "changes": [{"rev": "oops"}]}, row(3, "c", "1-c")], "last_seq": 3}),
        )]);
        let mut h = harness(config(), transport);
        h.tracker.take().unwrap().run().await.unwrap();
        let TrackerEvent::Changes(entries) = h.output.recv().await.unwrap() else {
            panic!("expected changes");
        };
        let ids: Vec<_> = entries.iter().map(|e| e.doc_id.as_str()).collect();
        assert_eq!(ids, ["a", "c"]);
    }

    #[tokio::test]
    async fn continuous_feed_folds_repeats_and_reports_heartbeat() {
        let config = config()
            .with_continuous(true)
            .with_feed_mode(FeedMode::Continuous)
            .with_debounce_window(Duration::from_secs(60));
        let transport = ScriptedTransport::default();
        transport.streams.lock().push_back(Script {
            chunks: vec![
                "{\"seq\":1,\"id\":\"a\",\"changes\":[{\"rev\":\"1-a\"}]}\n{\"seq\":2,\"id\":\"b\",",
                "\"changes\":[{\"rev\":\"1-b\"}]}\nnot json\n",
                "{\"seq\":3,\"id\":\"a\",\"changes\":[{\"rev\":\"2-a\"}]}\n\n",
            ],
            hang: true,
        });
        let mut h = harness(config, transport);
        let task = tokio::spawn(h.tracker.take().unwrap().run());

        let TrackerEvent::Changes(entries) = h.output.recv().await.unwrap() else {
            panic!("expected changes");
        };
        let got: Vec<_> = entries.iter().map(|e| (e.doc_id.as_str(), e.rev_id.clone())).collect();
        assert_eq!(got, vec![("b", rev("1-b")), ("a", rev("2-a"))]);
        assert_eq!(
            h.output.recv().await.unwrap(),
            TrackerEvent::CaughtUp(Some(RemoteSeq::Number(3)))
        );

        h.cancel.cancel();
        task.await.unwrap().unwrap();
        assert!(h.output.recv().await.is_none());
    }

    #[tokio::test]
    async fn last_seq_line_reconnects_from_it() {
        let config = config()
            .with_continuous(true)
            .with_feed_mode(FeedMode::Continuous);
        let transport = ScriptedTransport::default();
        transport.streams.lock().push_back(Script {
            chunks: vec!["{\"seq\":4,\"id\":\"a\",\"changes\":[{\"rev\":\"1-a\"}]}\n{\"last_seq\":9}\n"],
            hang: false,
        });
        transport.streams.lock().push_back(Script {
            chunks: vec![],
            hang: true,
        });
        let mut h = harness(config, transport);
        let task = tokio::spawn(h.tracker.take().unwrap().run());

        assert!(matches!(h.output.recv().await.unwrap(), TrackerEvent::Changes(_)));
        assert_eq!(
            h.output.recv().await.unwrap(),
            TrackerEvent::CaughtUp(Some(RemoteSeq::Number(9)))
        );
        // Wait until the second connection is open.
        while h.transport.paths().len() < 2 {
            tokio::task::yield_now().await;
        }
        assert!(h.transport.paths()[1].contains("since=9"));
        h.cancel.cancel();
        task.await.unwrap().unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn connection_failures_back_off_then_reset() {
        let transport = ScriptedTransport::default();
        {
            let mut responses = transport.responses.lock();
            responses.push_back(Err(ReplicationError::transport_retryable("reset")));
            responses.push_back(Err(ReplicationError::transport_retryable("reset")));
            responses.push_back(Ok(Response::json(200, &json!({"results": [], "last_seq": 0}))));
        }
        let mut h = harness(config(), transport);
        h.tracker.take().unwrap().run().await.unwrap();

        let mut delays = Vec::new();
        let mut connected = false;
        while let Ok(event) = h.events.try_recv() {
            match event {
                WorkerEvent::Retrying { delay, .. } => delays.push(delay),
                WorkerEvent::Connected(_) => connected = true,
                _ => {}
            }
        }
        assert_eq!(delays, [Duration::from_millis(10), Duration::from_millis(20)]);
        assert!(connected);
    }

    #[tokio::test]
    async fn fatal_errors_end_the_tracker() {
        let transport = ScriptedTransport::answering(vec![Response::new(401, "")]);
        let mut h = harness(config(), transport);
        let err = h.tracker.take().unwrap().run().await.unwrap_err();
        assert!(matches!(err, ReplicationError::AuthenticationFailed(_)));
    }

    #[tokio::test]
    async fn missing_filter_ends_the_tracker() {
        let transport = ScriptedTransport::answering(vec![Response::new(404, "")]);
        let mut h = harness(config(), transport);
        let err = h.tracker.take().unwrap().run().await.unwrap_err();
        assert!(matches!(err, ReplicationError::Status { status: 404, .. }));
    }

    #[test]
    fn debouncer_keeps_newest_row_per_document() {
        let mut debouncer = Debouncer::default();
        debouncer.push(vec![ChangeEntry::new("a", rev("1-a"), 1)]);
        debouncer.push(vec![ChangeEntry::new("b", rev("1-b"), 2)]);
        debouncer.push(vec![
            ChangeEntry::new("a", rev("3-a"), 3),
            ChangeEntry::new("a", rev("3-z"), 3),
        ]);
        let entries = debouncer.take();
        let revs: Vec<String> = entries.iter().map(|e| e.rev_id.to_string()).collect();
        assert_eq!(revs, ["1-b", "3-a", "3-z"]);
        assert_eq!(debouncer.len(), 0);
        assert!(debouncer.deadline(Duration::from_secs(1)).is_none());
    }
}
