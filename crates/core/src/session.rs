//! One realtime conversation: its state machine, upstream link, audio turn
//! buffer and subscribers.
//!
//! Status transitions happen under a synchronous lock that is never held across
//! an await. Upstream commands and buffer mutation are serialized by a second,
//! async lock so appends and commits always observe a consistent buffer.
//! Readiness is published on a `watch` channel so waiters never poll.

use crate::{
    audio::{AudioTurnBuffer, CommittedTurn},
    config::{ManagerConfig, Provider, SessionOptions},
    error::{RealtimeError, RealtimeResult},
    event::{Event, EventKind},
    upstream::{LinkEvent, LinkOptions, UpstreamChannel, UpstreamConnector, UpstreamLink},
};
use bytes::Bytes;
use parking_lot::Mutex;
use serde::Serialize;
use std::{
    collections::HashMap,
    fmt,
    pin::Pin,
    sync::{
        Arc, Weak,
        atomic::{AtomicU64, Ordering},
    },
    task::{Context, Poll},
    time::{Duration, Instant},
};
use tokio::{
    sync::{mpsc, mpsc::error::TrySendError, watch},
    task::JoinHandle,
};
use tokio_stream::{Stream, StreamExt, wrappers::ReceiverStream};
use tracing::{Instrument, debug, error, info, instrument, warn};

/// Lifecycle of a session.
///
/// `idle → starting → active → stopped`, with `error` reachable from
/// `starting` and `active`. From `error` only an explicit start leaves.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum SessionStatus {
    Idle,
    Starting,
    Active,
    Error,
    Stopped,
}

impl SessionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            SessionStatus::Idle => "idle",
            SessionStatus::Starting => "starting",
            SessionStatus::Active => "active",
            SessionStatus::Error => "error",
            SessionStatus::Stopped => "stopped",
        }
    }
}

impl fmt::Display for SessionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Client-safe view of a session's configuration. Never carries the credential.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SessionConfiguration {
    pub provider: Provider,
    pub model: String,
    pub voice: String,
    pub has_credential: bool,
}

struct SessionState {
    status: SessionStatus,
    options: SessionOptions,
    /// Bumped on every start claim and on stop; stale async work compares against it.
    generation: u64,
    last_error: Option<RealtimeError>,
    last_activity: Instant,
    /// The in-flight attempt; aborting it drops a half-open link.
    start_task: Option<JoinHandle<()>>,
    pump: Option<JoinHandle<()>>,
}

#[derive(Default)]
struct Upstream {
    link: Option<Box<dyn UpstreamLink>>,
    buffer: AudioTurnBuffer,
}

struct Listener {
    id: u64,
    sender: mpsc::Sender<Event>,
}

struct IdleTimer {
    token: u64,
    handle: JoinHandle<()>,
}

/// A logical conversation between one browser client and the provider.
pub struct Session {
    id: String,
    config: Arc<ManagerConfig>,
    connector: Arc<dyn UpstreamConnector>,
    state: Mutex<SessionState>,
    upstream: tokio::sync::Mutex<Upstream>,
    status_tx: watch::Sender<SessionStatus>,
    listeners: Mutex<HashMap<EventKind, Vec<Listener>>>,
    next_listener_id: AtomicU64,
    idle_timer: Mutex<Option<IdleTimer>>,
    next_idle_token: AtomicU64,
}

impl Session {
    pub fn new(
        id: impl Into<String>,
        config: Arc<ManagerConfig>,
        connector: Arc<dyn UpstreamConnector>,
    ) -> Arc<Self> {
        let (status_tx, _) = watch::channel(SessionStatus::Idle);
        Arc::new(Self {
            id: id.into(),
            state: Mutex::new(SessionState {
                status: SessionStatus::Idle,
                options: config.defaults.clone(),
                generation: 0,
                last_error: None,
                last_activity: Instant::now(),
                start_task: None,
                pump: None,
            }),
            config,
            connector,
            upstream: tokio::sync::Mutex::new(Upstream::default()),
            status_tx,
            listeners: Mutex::new(HashMap::new()),
            next_listener_id: AtomicU64::new(1),
            idle_timer: Mutex::new(None),
            next_idle_token: AtomicU64::new(1),
        })
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn status(&self) -> SessionStatus {
        self.state.lock().status
    }

    pub fn is_active(&self) -> bool {
        self.status() == SessionStatus::Active
    }

    pub fn is_starting(&self) -> bool {
        self.status() == SessionStatus::Starting
    }

    pub fn configuration(&self) -> SessionConfiguration {
        let state = self.state.lock();
        SessionConfiguration {
            provider: state.options.provider,
            model: state.options.model.clone(),
            voice: state.options.voice.clone(),
            has_credential: state.options.credential.is_some(),
        }
    }

    /// The failure that moved the session to `error`, if it is there.
    pub fn last_error(&self) -> Option<RealtimeError> {
        self.state.lock().last_error.clone()
    }

    pub fn idle_for(&self) -> Duration {
        self.state.lock().last_activity.elapsed()
    }

    fn set_status(&self, state: &mut SessionState, status: SessionStatus) {
        state.status = status;
        self.status_tx.send_replace(status);
    }

    fn touch(&self) {
        self.state.lock().last_activity = Instant::now();
    }

    fn ensure_active(&self) -> RealtimeResult<()> {
        let mut state = self.state.lock();
        state.last_activity = Instant::now();
        match state.status {
            SessionStatus::Active => Ok(()),
            other => Err(RealtimeError::not_ready(other)),
        }
    }

    /// Replaces the session options. Only allowed while `idle` or `error`.
    pub fn configure(&self, options: SessionOptions) -> RealtimeResult<()> {
        options.validate()?;
        let mut state = self.state.lock();
        match state.status {
            SessionStatus::Starting | SessionStatus::Active => {
                Err(RealtimeError::InvalidConfiguration(format!(
                    "session is {}; stop it before reconfiguring",
                    state.status
                )))
            }
            SessionStatus::Stopped => Err(RealtimeError::InvalidConfiguration(
                "session is stopped".to_string(),
            )),
            SessionStatus::Idle | SessionStatus::Error => {
                state.options = options;
                state.last_activity = Instant::now();
                Ok(())
            }
        }
    }

    fn link_options(&self, options: &SessionOptions) -> RealtimeResult<LinkOptions> {
        let credential = options
            .credential
            .clone()
            .ok_or_else(|| RealtimeError::MissingCredential(options.provider.to_string()))?;
        Ok(LinkOptions {
            session_id: self.id.clone(),
            provider: options.provider,
            model: options.model.clone(),
            credential,
            voice: options.voice.clone(),
            transcription_model: options.transcription_model.clone(),
            turn_detection: options.turn_detection.clone(),
            instructions: options.instructions.clone(),
            temperature: options.temperature,
        })
    }

    /// Opens the upstream link and waits for the provider to acknowledge it.
    ///
    /// Idempotent: an `active` session returns at once, and concurrent callers
    /// of a `starting` session share the outcome of the single attempt in flight.
    /// The attempt runs on its own task, so a caller that goes away does not
    /// strand the session in `starting`.
    #[instrument(skip_all, fields(session_id = %self.id))]
    pub async fn start(self: &Arc<Self>) -> RealtimeResult<()> {
        let claim = {
            let mut state = self.state.lock();
            state.last_activity = Instant::now();
            match state.status {
                SessionStatus::Active => return Ok(()),
                SessionStatus::Stopped => {
                    return Err(RealtimeError::not_ready(SessionStatus::Stopped));
                }
                SessionStatus::Starting => None,
                SessionStatus::Idle | SessionStatus::Error => {
                    let options = self.link_options(&state.options)?;
                    state.generation += 1;
                    state.last_error = None;
                    self.set_status(&mut state, SessionStatus::Starting);
                    Some((state.generation, options))
                }
            }
        };

        if let Some((generation, options)) = claim {
            info!(provider = %options.provider, model = %options.model, "Starting session");
            let session = Arc::clone(self);
            let task = tokio::spawn(
                async move { session.run_start(generation, options).await }
                    .instrument(tracing::Span::current()),
            );
            let mut state = self.state.lock();
            if state.generation == generation {
                state.start_task = Some(task);
            } else {
                task.abort();
            }
        } else {
            debug!("Start already in flight; joining it");
        }

        self.start_outcome().await
    }

    async fn start_outcome(&self) -> RealtimeResult<()> {
        let mut rx = self.status_tx.subscribe();
        let status = rx
            .wait_for(|s| *s != SessionStatus::Starting)
            .await
            .map(|s| *s)
            .map_err(|_| RealtimeError::InternalFailure("status channel closed".to_string()))?;
        match status {
            SessionStatus::Active => Ok(()),
            SessionStatus::Error => Err(self.last_error().unwrap_or_else(|| {
                RealtimeError::UpstreamUnavailable("session failed to start".to_string())
            })),
            other => Err(RealtimeError::not_ready(other)),
        }
    }

    async fn run_start(self: Arc<Self>, generation: u64, options: LinkOptions) {
        let handshake_timeout = self.config.handshake_timeout;
        let result = tokio::time::timeout(handshake_timeout, self.open_and_handshake(options))
            .await
            .unwrap_or_else(|_| {
                Err(RealtimeError::HandshakeTimeout(
                    handshake_timeout.as_millis() as u64,
                ))
            });
        match result {
            Ok(channel) => self.activate(generation, channel).await,
            Err(err) => self.fail_start(generation, err),
        }
    }

    async fn open_and_handshake(&self, options: LinkOptions) -> RealtimeResult<UpstreamChannel> {
        let mut channel = self.connector.open(options).await?;
        loop {
            match channel.events.recv().await {
                Some(LinkEvent::Ready) => return Ok(channel),
                Some(LinkEvent::Failed(err)) => {
                    channel.link.close().await;
                    return Err(err);
                }
                Some(LinkEvent::Event(event)) => {
                    debug!(kind = %event.kind(), "Dropping event received before acknowledgment");
                }
                None => {
                    return Err(RealtimeError::UpstreamUnavailable(
                        "connection closed during handshake".to_string(),
                    ));
                }
            }
        }
    }

    async fn activate(self: &Arc<Self>, generation: u64, channel: UpstreamChannel) {
        let UpstreamChannel { link, events } = channel;
        let mut upstream = self.upstream.lock().await;
        let ready = {
            let mut state = self.state.lock();
            if state.generation != generation || state.status != SessionStatus::Starting {
                None
            } else {
                state.pump = Some(tokio::spawn(
                    pump_events(Arc::downgrade(self), generation, events)
                        .instrument(tracing::Span::current()),
                ));
                self.set_status(&mut state, SessionStatus::Active);
                Some(Event::SessionReady {
                    session_id: self.id.clone(),
                    provider: state.options.provider.to_string(),
                    model: state.options.model.clone(),
                })
            }
        };

        match ready {
            Some(event) => {
                upstream.link = Some(link);
                upstream.buffer.clear();
                drop(upstream);
                info!("Session active");
                self.dispatch(event);
            }
            None => {
                drop(upstream);
                debug!("Session left starting before the link was ready; closing it");
                self.close_link(link).await;
            }
        }
    }

    fn fail_start(&self, generation: u64, err: RealtimeError) {
        {
            let mut state = self.state.lock();
            if state.generation != generation || state.status != SessionStatus::Starting {
                return;
            }
            state.last_error = Some(err.clone());
            self.set_status(&mut state, SessionStatus::Error);
        }
        warn!(error = %err, "Session failed to start");
        self.dispatch(Event::from_error(&err));
    }

    async fn fail_active(&self, generation: u64, err: RealtimeError) {
        {
            let mut state = self.state.lock();
            if state.generation != generation || state.status != SessionStatus::Active {
                return;
            }
            state.last_error = Some(err.clone());
            // The pump is the caller; dropping its handle detaches it.
            state.pump = None;
            self.set_status(&mut state, SessionStatus::Error);
        }
        error!(session_id = %self.id, error = %err, "Upstream link lost");
        self.dispatch(Event::from_error(&err));

        let link = {
            let mut upstream = self.upstream.lock().await;
            upstream.buffer.clear();
            upstream.link.take()
        };
        if let Some(link) = link {
            self.close_link(link).await;
        }
    }

    async fn close_link(&self, link: Box<dyn UpstreamLink>) {
        if tokio::time::timeout(self.config.close_timeout, link.close())
            .await
            .is_err()
        {
            warn!(session_id = %self.id, "Upstream link close timed out");
        }
    }

    /// Waits, without polling, until the session leaves `starting`.
    ///
    /// Succeeds once `active`. Fails with `SessionNotReady` on timeout or when
    /// the session settles in any other status.
    pub async fn wait_until_ready(&self, timeout: Duration) -> RealtimeResult<()> {
        let mut rx = self.status_tx.subscribe();
        let waited = tokio::time::timeout(timeout, async {
            rx.wait_for(|s| *s != SessionStatus::Starting)
                .await
                .map(|s| *s)
        })
        .await;
        match waited {
            Ok(Ok(SessionStatus::Active)) => Ok(()),
            Ok(Ok(other)) => Err(RealtimeError::not_ready(other)),
            Ok(Err(_)) => Err(RealtimeError::InternalFailure(
                "status channel closed".to_string(),
            )),
            Err(_) => Err(RealtimeError::not_ready(self.status())),
        }
    }

    /// The open link, provided it still reports itself usable.
    fn ready_link<'a>(
        &self,
        link: &'a Option<Box<dyn UpstreamLink>>,
    ) -> RealtimeResult<&'a dyn UpstreamLink> {
        let link = link
            .as_deref()
            .ok_or_else(|| RealtimeError::not_ready(self.status()))?;
        if !link.is_ready() {
            return Err(link.last_error().unwrap_or_else(|| {
                RealtimeError::UpstreamUnavailable("upstream link is not ready".to_string())
            }));
        }
        Ok(link)
    }

    /// Streams one chunk of user audio upstream and records it in the turn buffer.
    pub async fn append_audio(&self, chunk: Bytes) -> RealtimeResult<()> {
        if chunk.is_empty() {
            return Err(RealtimeError::InvalidInput(
                "audio chunk must not be empty".to_string(),
            ));
        }
        let mut guard = self.upstream.lock().await;
        self.ensure_active()?;
        let upstream = &mut *guard;
        let link = self.ready_link(&upstream.link)?;
        link.send_audio(chunk.clone()).await?;
        upstream.buffer.append(chunk);
        Ok(())
    }

    /// Ends the current audio turn and requests a response.
    ///
    /// An empty buffer still sends the turn boundary, so the provider can answer
    /// input that arrived by other means.
    pub async fn commit_audio(&self) -> RealtimeResult<CommittedTurn> {
        let mut guard = self.upstream.lock().await;
        self.ensure_active()?;
        let upstream = &mut *guard;
        let link = self.ready_link(&upstream.link)?;
        let turn = upstream.buffer.take_turn();
        link.commit().await?;
        link.request_response().await?;
        debug!(session_id = %self.id, chunks = turn.chunks, bytes = turn.bytes, "Committed audio turn");
        Ok(turn)
    }

    /// Sends a user text turn and requests a response.
    pub async fn send_text(&self, text: String) -> RealtimeResult<()> {
        if text.trim().is_empty() {
            return Err(RealtimeError::InvalidInput(
                "text must not be empty".to_string(),
            ));
        }
        let guard = self.upstream.lock().await;
        self.ensure_active()?;
        let link = self.ready_link(&guard.link)?;
        link.send_text(text).await?;
        link.request_response().await
    }

    /// Registers a subscriber for one event kind.
    ///
    /// Events fired before this call are not replayed. Dropping the returned
    /// [`Subscription`] deregisters it. On a stopped session the subscription
    /// ends immediately.
    pub fn on(self: &Arc<Self>, kind: EventKind) -> Subscription {
        let (sender, receiver) = mpsc::channel(self.config.subscriber_capacity.max(1));
        let id = self.next_listener_id.fetch_add(1, Ordering::Relaxed);
        {
            let state = self.state.lock();
            if state.status != SessionStatus::Stopped {
                self.listeners
                    .lock()
                    .entry(kind)
                    .or_default()
                    .push(Listener { id, sender });
            }
        }
        Subscription {
            id,
            kind,
            events: ReceiverStream::new(receiver),
            session: Arc::downgrade(self),
        }
    }

    /// Deregisters a subscriber. Returns whether it was registered.
    pub fn off(&self, kind: EventKind, id: u64) -> bool {
        let mut listeners = self.listeners.lock();
        let Some(entries) = listeners.get_mut(&kind) else {
            return false;
        };
        let before = entries.len();
        entries.retain(|l| l.id != id);
        let removed = entries.len() != before;
        if entries.is_empty() {
            listeners.remove(&kind);
        }
        removed
    }

    pub fn listener_count(&self, kind: EventKind) -> usize {
        self.listeners.lock().get(&kind).map_or(0, Vec::len)
    }

    /// Delivers an event to every subscriber of its kind without blocking.
    ///
    /// A full subscriber queue loses this event; a closed one is deregistered.
    fn dispatch(&self, event: Event) {
        let kind = event.kind();
        let mut listeners = self.listeners.lock();
        let Some(entries) = listeners.get_mut(&kind) else {
            return;
        };
        entries.retain(|listener| match listener.sender.try_send(event.clone()) {
            Ok(()) => true,
            Err(TrySendError::Full(_)) => {
                warn!(session_id = %self.id, %kind, listener = listener.id, "Subscriber queue full; dropping event");
                true
            }
            Err(TrySendError::Closed(_)) => false,
        });
        if entries.is_empty() {
            listeners.remove(&kind);
        }
    }

    /// Tears the session down. Safe to call any number of times.
    ///
    /// A start still in flight is aborted, which releases its link.
    #[instrument(skip_all, fields(session_id = %self.id))]
    pub async fn stop(&self) {
        let (start_task, pump) = {
            let mut state = self.state.lock();
            if state.status == SessionStatus::Stopped {
                return;
            }
            state.generation += 1;
            state.last_activity = Instant::now();
            self.set_status(&mut state, SessionStatus::Stopped);
            self.listeners.lock().clear();
            (state.start_task.take(), state.pump.take())
        };
        self.cancel_idle_timer();
        if let Some(task) = start_task {
            task.abort();
        }
        if let Some(pump) = pump {
            pump.abort();
        }

        let link = {
            let mut upstream = self.upstream.lock().await;
            upstream.buffer.clear();
            upstream.link.take()
        };
        if let Some(link) = link {
            self.close_link(link).await;
        }
        info!("Session stopped");
    }

    /// Installs a new idle timer, aborting the previous one.
    pub(crate) fn reschedule_idle_timer(&self, spawn: impl FnOnce(u64) -> JoinHandle<()>) {
        let token = self.next_idle_token.fetch_add(1, Ordering::Relaxed);
        self.touch();
        let mut slot = self.idle_timer.lock();
        if let Some(previous) = slot.take() {
            previous.handle.abort();
        }
        *slot = Some(IdleTimer {
            token,
            handle: spawn(token),
        });
    }

    /// Called by a firing timer. True only if that timer is still the current one,
    /// in which case it is detached so eviction can proceed without aborting itself.
    pub(crate) fn claim_idle_timer(&self, token: u64) -> bool {
        let mut slot = self.idle_timer.lock();
        match slot.as_ref() {
            Some(timer) if timer.token == token => {
                slot.take();
                true
            }
            _ => false,
        }
    }

    fn cancel_idle_timer(&self) {
        if let Some(timer) = self.idle_timer.lock().take() {
            timer.handle.abort();
        }
    }

    #[cfg(test)]
    pub(crate) async fn buffered_chunks(&self) -> usize {
        self.upstream.lock().await.buffer.chunk_count()
    }
}

impl Drop for Session {
    fn drop(&mut self) {
        if let Some(timer) = self.idle_timer.get_mut().take() {
            timer.handle.abort();
        }
        let state = self.state.get_mut();
        if let Some(task) = state.start_task.take() {
            task.abort();
        }
        if let Some(pump) = state.pump.take() {
            pump.abort();
        }
    }
}

async fn pump_events(
    session: Weak<Session>,
    generation: u64,
    mut events: mpsc::Receiver<LinkEvent>,
) {
    while let Some(link_event) = events.recv().await {
        let Some(session) = session.upgrade() else {
            return;
        };
        match link_event {
            LinkEvent::Event(event) => session.dispatch(event),
            LinkEvent::Ready => {}
            LinkEvent::Failed(err) => {
                session.fail_active(generation, err).await;
                return;
            }
        }
    }
    if let Some(session) = session.upgrade() {
        session
            .fail_active(
                generation,
                RealtimeError::UpstreamUnavailable("upstream link ended".to_string()),
            )
            .await;
    }
}

/// A live registration for one event kind. Yields events in emission order and
/// ends when the session stops. Dropping it deregisters the listener.
pub struct Subscription {
    id: u64,
    kind: EventKind,
    events: ReceiverStream<Event>,
    session: Weak<Session>,
}

impl Subscription {
    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn kind(&self) -> EventKind {
        self.kind
    }

    pub async fn recv(&mut self) -> Option<Event> {
        self.events.next().await
    }
}

impl Stream for Subscription {
    type Item = Event;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Event>> {
        Pin::new(&mut self.events).poll_next(cx)
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        if let Some(session) = self.session.upgrade() {
            session.off(self.kind, self.id);
        }
    }
}
