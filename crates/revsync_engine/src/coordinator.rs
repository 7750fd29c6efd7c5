//! The replicator: lifecycle, worker supervision, and status.
//!
//! A replicator runs sessions. Each session connects, checks the remote
//! protocol version, sweeps deferred conflicts, loads the checkpoint, and then
//! runs the change tracker, puller, and pusher as tasks. Worker events drive
//! the `Active`/`Idle`/`Offline` transitions. Transient session failures are
//! retried with backoff; fatal ones park the replicator in `Error`.

use crate::backoff::Backoff;
use crate::change_tracker::ChangeTracker;
use crate::checkpoint::CheckpointManager;
use crate::config::{Direction, ReplicatorConfig};
use crate::error::{ReplicationError, ReplicationResult};
use crate::puller::{PullContext, Puller};
use crate::pusher::Pusher;
use crate::remote::RemoteDatabase;
use crate::resolution::{resolve_and_apply, ResolveOutcome};
use crate::status::{DocumentError, ReplicationStatus, StatusHub, StatusSnapshot};
use crate::transport::{Authenticator, Transport};
use parking_lot::Mutex;
use revsync_protocol::{ConflictResolver, DefaultResolver, PROTOCOL_VERSION};
use revsync_store::RevisionStore;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, mpsc, watch};
use tokio::task::{JoinHandle, JoinSet};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn, Instrument};

/// What workers tell the supervisor.
#[derive(Debug, Clone)]
pub(crate) enum WorkerEvent {
    /// The direction has work in flight.
    Busy(Direction),
    /// The direction drained everything it knows about.
    CaughtUp(Direction),
    /// A request to the remote succeeded after a failure.
    Connected(Direction),
    /// A request failed and will be retried after `delay`.
    Retrying {
        direction: Direction,
        error: Arc<ReplicationError>,
        delay: Duration,
    },
}

/// How a session ended.
#[derive(Debug)]
enum SessionEnd {
    /// One-shot replication finished.
    Completed,
    /// `stop` was requested.
    Cancelled,
    /// The host reported the network gone.
    Unreachable,
    /// A worker or the handshake failed.
    Failed(ReplicationError),
}

/// Builds a [`Replicator`].
pub struct ReplicatorBuilder {
    store: Arc<dyn RevisionStore>,
    transport: Arc<dyn Transport>,
    config: ReplicatorConfig,
    resolver: Option<Arc<dyn ConflictResolver>>,
    authenticator: Option<Arc<dyn Authenticator>>,
}

impl ReplicatorBuilder {
    /// Sets the conflict policy. Defaults to [`DefaultResolver`].
    pub fn resolver(mut self, resolver: Arc<dyn ConflictResolver>) -> Self {
        self.resolver = Some(resolver);
        self
    }

    /// Attaches credentials to every request.
    pub fn authenticator(mut self, authenticator: Arc<dyn Authenticator>) -> Self {
        self.authenticator = Some(authenticator);
        self
    }

    /// Validates the configuration and builds the replicator.
    pub fn build(self) -> ReplicationResult<Replicator> {
        self.config.validate()?;
        let (reachable, _) = watch::channel(true);
        Ok(Replicator {
            inner: Arc::new(Inner {
                store: self.store,
                transport: self.transport,
                config: Arc::new(self.config),
                resolver: self.resolver.unwrap_or_else(|| Arc::new(DefaultResolver)),
                authenticator: self.authenticator,
                status: Arc::new(StatusHub::new()),
                reachable,
            }),
            running: Mutex::new(None),
        })
    }
}

struct Running {
    cancel: CancellationToken,
    handle: JoinHandle<()>,
}

struct Inner {
    store: Arc<dyn RevisionStore>,
    transport: Arc<dyn Transport>,
    config: Arc<ReplicatorConfig>,
    resolver: Arc<dyn ConflictResolver>,
    authenticator: Option<Arc<dyn Authenticator>>,
    status: Arc<StatusHub>,
    reachable: watch::Sender<bool>,
}

/// Replicates one local store with one remote database.
///
/// ```ignore
/// let replicator = Replicator::builder(store, transport, config).build()?;
/// replicator.start()?;
/// let mut status = replicator.subscribe();
/// status.wait_for(|s| s.status == ReplicationStatus::Idle).await?;
/// replicator.stop().await;
/// ```
pub struct Replicator {
    inner: Arc<Inner>,
    running: Mutex<Option<Running>>,
}

impl std::fmt::Debug for Replicator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Replicator")
            .field("remote", &self.inner.config.remote.database_url())
            .field("direction", &self.inner.config.direction)
            .field("status", &self.inner.status.status())
            .finish_non_exhaustive()
    }
}

impl Replicator {
    /// Starts building a replicator.
    pub fn builder(
        store: Arc<dyn RevisionStore>,
        transport: Arc<dyn Transport>,
        config: ReplicatorConfig,
    ) -> ReplicatorBuilder {
        ReplicatorBuilder {
            store,
            transport,
            config,
            resolver: None,
            authenticator: None,
        }
    }

    /// Starts replicating in the background.
    ///
    /// Does nothing if already running. Restarting after `Stopped` or `Error`
    /// resumes from the saved checkpoint. Must be called inside a tokio runtime.
    pub fn start(&self) -> ReplicationResult<()> {
        let mut running = self.running.lock();
        if running.as_ref().is_some_and(|r| !r.handle.is_finished()) {
            debug!("replicator already running");
            return Ok(());
        }
        let runtime = tokio::runtime::Handle::try_current()
            .map_err(|_| ReplicationError::Config("start requires a tokio runtime".into()))?;

        self.inner.status.clear_error();
        self.inner.status.reset_counters();
        self.inner.status.set_status(ReplicationStatus::Starting);

        let cancel = CancellationToken::new();
        let span = tracing::info_span!(
            "replicator",
            remote = %self.inner.config.remote.database_url(),
            direction = ?self.inner.config.direction,
        );
        let handle = runtime.spawn(
            Arc::clone(&self.inner)
                .supervise(cancel.clone())
                .instrument(span),
        );
        *running = Some(Running { cancel, handle });
        Ok(())
    }

    /// Stops replicating and waits for in-flight work to wind down.
    ///
    /// Workers get `stop_timeout` to finish their current batch before they
    /// are aborted. Safe to call in any state.
    pub async fn stop(&self) {
        let Some(running) = self.running.lock().take() else {
            return;
        };
        if !self.inner.status.status().is_terminal() {
            self.inner.status.set_status(ReplicationStatus::Stopping);
        }
        running.cancel.cancel();

        let mut handle = running.handle;
        if tokio::time::timeout(self.inner.config.stop_timeout, &mut handle)
            .await
            .is_err()
        {
            warn!(timeout = ?self.inner.config.stop_timeout, "workers did not stop in time; aborting");
            handle.abort();
            let _ = handle.await;
        }
        if self.inner.status.status() != ReplicationStatus::Error {
            self.inner.status.set_status(ReplicationStatus::Stopped);
        }
    }

    /// Reports host network reachability.
    ///
    /// Unreachable suspends the current session and goes `Offline`. Any
    /// report also cuts a pending retry delay short.
    pub fn set_reachable(&self, reachable: bool) {
        debug!(reachable, "reachability changed");
        self.inner.reachable.send_modify(|r| *r = reachable);
    }

    /// Returns the current status and counters.
    pub fn status(&self) -> StatusSnapshot {
        self.inner.status.snapshot()
    }

    /// Subscribes to status changes. The current value is seen immediately.
    pub fn subscribe(&self) -> watch::Receiver<StatusSnapshot> {
        self.inner.status.subscribe()
    }

    /// Subscribes to per-document failures.
    pub fn document_errors(&self) -> broadcast::Receiver<DocumentError> {
        self.inner.status.subscribe_errors()
    }

    /// Returns the most recent session-level failure.
    pub fn last_error(&self) -> Option<Arc<ReplicationError>> {
        self.inner.status.snapshot().last_error
    }

    /// Waits until the status satisfies `predicate`.
    pub async fn wait_for(
        &self,
        mut predicate: impl FnMut(&StatusSnapshot) -> bool,
    ) -> StatusSnapshot {
        let mut status = self.subscribe();
        let result = match status.wait_for(|s| predicate(s)).await {
            Ok(snapshot) => snapshot.clone(),
            Err(_) => self.status(),
        };
        result
    }

    /// Returns the ID of this replication's checkpoint.
    pub fn checkpoint_id(&self) -> String {
        revsync_protocol::checkpoint_id(
            &self
                .inner
                .config
                .checkpoint_settings(&self.inner.store.local_uuid()),
        )
    }

    /// Forgets replication progress so the next start begins from scratch.
    ///
    /// Only allowed while stopped.
    pub async fn reset_checkpoint(&self) -> ReplicationResult<()> {
        if self
            .running
            .lock()
            .as_ref()
            .is_some_and(|r| !r.handle.is_finished())
        {
            return Err(ReplicationError::Config(
                "cannot reset the checkpoint of a running replicator".into(),
            ));
        }
        let manager = self.inner.checkpoints(self.inner.remote()?);
        manager.reset().await
    }
}

impl Drop for Replicator {
    fn drop(&mut self) {
        if let Some(running) = self.running.get_mut().take() {
            running.cancel.cancel();
        }
    }
}

impl Inner {
    fn remote(&self) -> ReplicationResult<Arc<RemoteDatabase>> {
        RemoteDatabase::new(
            Arc::clone(&self.transport),
            self.authenticator.clone(),
            self.config.remote.clone(),
            self.config.request_timeout,
        )
        .map(Arc::new)
    }

    fn checkpoints(&self, remote: Arc<RemoteDatabase>) -> CheckpointManager {
        let settings = self
            .config
            .checkpoint_settings(&self.store.local_uuid());
        CheckpointManager::new(Arc::clone(&self.store), remote, &settings)
    }

    /// Runs sessions until stopped, finished, or failed.
    async fn supervise(self: Arc<Self>, cancel: CancellationToken) {
        let mut reachable = self.reachable.subscribe();
        let mut backoff = Backoff::new(self.config.retry.clone());
        info!("replicator started");

        loop {
            if !*reachable.borrow_and_update() {
                self.status.set_status(ReplicationStatus::Offline);
                tokio::select! {
                    biased;
                    _ = cancel.cancelled() => break,
                    up = reachability(&mut reachable, true) => {
                        if !up {
                            break;
                        }
                    }
                }
            }

            let session = cancel.child_token();
            match self.session(&session, &mut reachable, &mut backoff).await {
                SessionEnd::Completed => {
                    info!("replication complete");
                    self.status.set_status(ReplicationStatus::Stopped);
                    break;
                }
                SessionEnd::Cancelled => break,
                SessionEnd::Unreachable => {
                    info!("network unreachable; suspending");
                    continue;
                }
                SessionEnd::Failed(err) if err.is_fatal() => {
                    error!(error = %err, "replication failed");
                    self.status.set_error(err);
                    self.status.set_status(ReplicationStatus::Error);
                    break;
                }
                SessionEnd::Failed(err) => {
                    let delay = backoff.next_delay();
                    warn!(error = %err, ?delay, "replication session failed; retrying");
                    if err.is_retryable() {
                        self.status.set_status(ReplicationStatus::Offline);
                    }
                    self.status.set_error(err);
                    reachable.borrow_and_update();
                    tokio::select! {
                        biased;
                        _ = cancel.cancelled() => break,
                        _ = tokio::time::sleep(delay) => {}
                        _ = reachable.changed() => debug!("reachability report; retrying now"),
                    }
                }
            }
        }
        debug!("replicator supervisor exiting");
    }

    async fn session(
        &self,
        cancel: &CancellationToken,
        reachable: &mut watch::Receiver<bool>,
        backoff: &mut Backoff,
    ) -> SessionEnd {
        let prepared = tokio::select! {
            biased;
            _ = cancel.cancelled() => return SessionEnd::Cancelled,
            _ = reachability(reachable, false) => return SessionEnd::Unreachable,
            prepared = self.prepare() => prepared,
        };
        let checkpoints = match prepared {
            Ok(checkpoints) => checkpoints,
            Err(err) => return SessionEnd::Failed(err),
        };
        backoff.reset();
        self.status.set_status(ReplicationStatus::Active);

        let (events, mut worker_events) = mpsc::unbounded_channel();
        let mut tasks = self.spawn_workers(&checkpoints, events, cancel).await;
        let mut busy = Busy::new(self.config.direction);

        loop {
            tokio::select! {
                biased;
                _ = cancel.cancelled() => {
                    drain(&mut tasks).await;
                    return SessionEnd::Cancelled;
                }
                _ = reachability(reachable, false) => {
                    cancel.cancel();
                    drain(&mut tasks).await;
                    self.status.set_status(ReplicationStatus::Offline);
                    return SessionEnd::Unreachable;
                }
                Some(event) = worker_events.recv() => self.on_event(event, &mut busy),
                joined = tasks.join_next() => match joined {
                    None => {
                        while let Ok(event) = worker_events.try_recv() {
                            self.on_event(event, &mut busy);
                        }
                        return SessionEnd::Completed;
                    }
                    Some(Ok(Ok(()))) => {}
                    Some(Ok(Err(err))) => {
                        cancel.cancel();
                        drain(&mut tasks).await;
                        return SessionEnd::Failed(err);
                    }
                    Some(Err(join_err)) => {
                        cancel.cancel();
                        drain(&mut tasks).await;
                        return SessionEnd::Failed(ReplicationError::WorkerFailed(join_err.to_string()));
                    }
                },
            }
        }
    }

    /// Handshake, deferred conflicts, and checkpoint load.
    async fn prepare(&self) -> ReplicationResult<Arc<CheckpointManager>> {
        let remote = self.remote()?;
        remote.connect().await?;
        let info = remote.server_info().await?;
        if !info.is_compatible() {
            return Err(ReplicationError::VersionMismatch {
                local: PROTOCOL_VERSION,
                remote: info.protocol_version.unwrap_or_default(),
            });
        }
        debug!(db = %info.db_name, "remote database reachable");

        self.sweep_conflicts()?;

        let checkpoints = Arc::new(self.checkpoints(remote));
        checkpoints.load().await?;
        Ok(checkpoints)
    }

    /// Retries conflicts whose resolution was deferred in an earlier session.
    fn sweep_conflicts(&self) -> ReplicationResult<()> {
        for doc_id in self.store.conflicted_documents()? {
            if !self.config.allows(&doc_id) {
                continue;
            }
            let Some(conflict) = self.store.conflict_for(&doc_id)? else {
                continue;
            };
            if let ResolveOutcome::Deferred(err) =
                resolve_and_apply(&*self.store, &*self.resolver, conflict)?
            {
                self.status.report_document_error(DocumentError::new(
                    doc_id,
                    None,
                    Direction::Pull,
                    err.into(),
                ));
            }
        }
        Ok(())
    }

    async fn spawn_workers(
        &self,
        checkpoints: &Arc<CheckpointManager>,
        events: mpsc::UnboundedSender<WorkerEvent>,
        cancel: &CancellationToken,
    ) -> JoinSet<ReplicationResult<()>> {
        let mut tasks = JoinSet::new();
        let remote = Arc::clone(checkpoints.remote());
        let start = checkpoints.current().await;

        if self.config.direction.pulls() {
            let (output, input) = mpsc::channel(self.config.tracker_backlog);
            let tracker = ChangeTracker::new(
                Arc::clone(&remote),
                Arc::clone(&self.config),
                start.last_sequence_pulled.clone(),
                output,
                events.clone(),
                cancel.clone(),
            );
            let puller = Puller::new(
                PullContext {
                    store: Arc::clone(&self.store),
                    remote: Arc::clone(&remote),
                    config: Arc::clone(&self.config),
                    resolver: Arc::clone(&self.resolver),
                    checkpoints: Arc::clone(checkpoints),
                    status: Arc::clone(&self.status),
                },
                input,
                events.clone(),
                cancel.clone(),
            );
            tasks.spawn(tracker.run().in_current_span());
            tasks.spawn(puller.run().in_current_span());
        }
        if self.config.direction.pushes() {
            let pusher = Pusher::new(
                Arc::clone(&self.store),
                remote,
                Arc::clone(&self.config),
                Arc::clone(checkpoints),
                Arc::clone(&self.status),
                events,
                cancel.clone(),
            );
            tasks.spawn(pusher.run().in_current_span());
        }
        tasks
    }

    fn on_event(&self, event: WorkerEvent, busy: &mut Busy) {
        match event {
            WorkerEvent::Busy(direction) => {
                busy.set(direction, true);
                self.status.set_status(ReplicationStatus::Active);
            }
            WorkerEvent::CaughtUp(direction) => {
                busy.set(direction, false);
                if busy.idle() && self.status.status() != ReplicationStatus::Offline {
                    self.status.set_status(ReplicationStatus::Idle);
                }
            }
            WorkerEvent::Connected(_) => {
                if self.status.status() == ReplicationStatus::Offline {
                    self.status.clear_error();
                    self.status.set_status(if busy.idle() {
                        ReplicationStatus::Idle
                    } else {
                        ReplicationStatus::Active
                    });
                }
            }
            WorkerEvent::Retrying {
                direction,
                error,
                delay,
            } => {
                debug!(?direction, error = %error, ?delay, "worker retrying");
                if error.is_connectivity() {
                    self.status.set_status(ReplicationStatus::Offline);
                }
            }
        }
    }
}

/// Per-direction work flags.
#[derive(Debug)]
struct Busy {
    pull: bool,
    push: bool,
}

impl Busy {
    fn new(direction: Direction) -> Self {
        Self {
            pull: direction.pulls(),
            push: direction.pushes(),
        }
    }

    fn set(&mut self, direction: Direction, busy: bool) {
        match direction {
            Direction::Pull => self.pull = busy,
            Direction::Push => self.push = busy,
            Direction::PushAndPull => {
                self.pull = busy;
                self.push = busy;
            }
        }
    }

    fn idle(&self) -> bool {
        !self.pull && !self.push
    }
}

/// Waits until reachability equals `value`. False if the sender is gone.
async fn reachability(reachable: &mut watch::Receiver<bool>, value: bool) -> bool {
    reachable.wait_for(|r| *r == value).await.is_ok()
}

async fn drain(tasks: &mut JoinSet<ReplicationResult<()>>) {
    while let Some(joined) = tasks.join_next().await {
        if let Ok(Err(err)) = joined {
            debug!(error = %err, "worker ended during shutdown");
        }
    }
}
