//! # Redlink Core
//!
//! Connection handling for a single long-lived Redis connection: command
//! submission with FIFO reply correlation, cooperative pipelining behind an
//! auto-flush switch, subscriber mode with receiver fan-out, and the
//! connection lifecycle from handshake to graceful or unexpected close.
//!
//! ## Modules
//!
//! - [`connection`] - The owned transport and its split halves
//! - [`command`] - Command builders and the `CommandSignature` contract
//! - [`builder`] - Connection configuration and factory
//! - [`pubsub`] - Subscriber-mode dispatch
//! - [`metrics`] - Process-wide counters and gauges
//!

#![warn(missing_docs)]

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicU8, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Instant;

use bytes::Bytes;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::{mpsc, oneshot, watch};
use tracing::{debug, error, warn, Span};
use uuid::Uuid;

pub use crate::proto::error::{Error, Result};
use crate::proto::frame::RespValue;

use self::command::{Cmd, CommandSignature};
use self::connection::{Transport, TransportReader, TransportWriter};
use self::pubsub::{
    DispatchOutcome, MessageReceiver, PubSubDispatcher, SubscriptionAck, SubscriptionChange,
    SubscriptionChangeHook, SubscriptionKind,
};

/// Connection configuration and factory.
pub mod builder;
/// Command construction helpers.
pub mod command;
/// Low-level transport management.
pub mod connection;
/// Client metrics.
pub mod metrics;
/// Subscriber-mode dispatch.
pub mod pubsub;

cfg_if::cfg_if! {
    if #[cfg(feature = "tls")] {
        mod tls;
        pub use tls::TlsConnectorInner;
    }
}

/// Externally observable connection states.
///
/// The authoritative state lives on the driver task (where the `PubSub`
/// variant carries its dispatcher); this mirror is kept in an atomic so any
/// thread can read it without synchronizing with the driver.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum ConnectionState {
    /// Ready for arbitrary commands.
    Open = 0,
    /// Subscribed; only the subscriber-mode command set is accepted.
    PubSub = 1,
    /// `close()` was called and the QUIT exchange is in flight.
    ShuttingDown = 2,
    /// The transport is gone.
    Closed = 3,
}

impl ConnectionState {
    fn from_u8(raw: u8) -> Self {
        match raw {
            0 => ConnectionState::Open,
            1 => ConnectionState::PubSub,
            2 => ConnectionState::ShuttingDown,
            _ => ConnectionState::Closed,
        }
    }
}

/// Callback fired at most once when the server closes the transport while
/// the connection was still open or subscribed.
pub type ClosureCallback = Box<dyn FnOnce() + Send>;

/// State shared between the public handles and the driver task.
struct Shared {
    id: Uuid,
    state: AtomicU8,
    autoflush: AtomicBool,
    allow_subscriptions: AtomicBool,
    closed: watch::Sender<bool>,
    on_unexpected_closure: Mutex<Option<ClosureCallback>>,
}

impl Shared {
    fn state(&self) -> ConnectionState {
        ConnectionState::from_u8(self.state.load(Ordering::SeqCst))
    }

    fn store_state(&self, state: ConnectionState) {
        self.state.store(state as u8, Ordering::SeqCst);
    }

    fn fire_unexpected_closure(&self) {
        let callback = self.on_unexpected_closure.lock().unwrap().take();
        if let Some(callback) = callback {
            callback();
        }
    }
}

/// Guard owned only by public handles: a connection must be closed before the
/// last handle goes away.
struct CloseGuard {
    shared: Arc<Shared>,
}

impl Drop for CloseGuard {
    fn drop(&mut self) {
        let state = self.shared.state();
        if !matches!(
            state,
            ConnectionState::ShuttingDown | ConnectionState::Closed
        ) {
            error!(id = %self.shared.id, "connection dropped without close()");
            debug_assert!(
                false,
                "RedisConnection must be closed before the last handle is dropped"
            );
        }
    }
}

/// Requests from the public handles to the driver task.
enum Event {
    Send {
        frames: Vec<RespValue>,
        promises: Vec<oneshot::Sender<Result<RespValue>>>,
        submitted_at: Instant,
    },
    Subscribe {
        kind: SubscriptionKind,
        targets: Vec<Bytes>,
        receiver: MessageReceiver,
        on_subscribe: Option<SubscriptionChangeHook>,
        on_unsubscribe: Option<SubscriptionChangeHook>,
        ack: oneshot::Sender<Result<()>>,
    },
    Unsubscribe {
        kind: SubscriptionKind,
        targets: Vec<Bytes>,
        ack: Option<oneshot::Sender<Result<()>>>,
    },
    Flush,
    Close,
}

/// One entry of the pending-reply FIFO.
enum Pending {
    /// A regular command awaiting its reply.
    Command {
        tx: oneshot::Sender<Result<RespValue>>,
        submitted_at: Instant,
    },
    /// The QUIT written by a graceful close.
    Quit,
    /// A subscription change awaiting `remaining` acknowledgements.
    SubscriptionChange {
        change: SubscriptionChange,
        kind: SubscriptionKind,
        remaining: usize,
        receiver: Option<MessageReceiver>,
        on_subscribe: Option<SubscriptionChangeHook>,
        on_unsubscribe: Option<SubscriptionChangeHook>,
        ack: Option<oneshot::Sender<Result<()>>>,
    },
}

/// Driver-side connection state; the dispatcher lives inside `PubSub` so it
/// cannot exist while the connection is `Open`.
enum State {
    Open,
    PubSub(PubSubDispatcher),
    ShuttingDown,
    Closed,
}

/// A single long-lived connection to a Redis server.
///
/// The handle is cheap to clone; all clones drive the same connection. Every
/// mutation of connection state happens on the connection's driver task, so
/// calls from any thread or task are serialized by hopping over a channel.
/// The observable flags (`is_connected`, `is_subscribed`, `autoflush`,
/// `allow_subscriptions`) are atomics and never block.
///
/// # Example
///
/// ```no_run
/// use redlink::core::builder::ConnectionBuilder;
/// use redlink::core::command::{self, expect_ok};
///
/// #[tokio::main]
/// async fn main() -> Result<(), Box<dyn std::error::Error>> {
///     let conn = ConnectionBuilder::new()
///         .address("redis://127.0.0.1:6379")
///         .connect()
///         .await?;
///
///     let reply = conn.send(command::setex("greeting", 5, "hello")).await?;
///     expect_ok(reply)?;
///
///     conn.close().await;
///     Ok(())
/// }
/// ```
#[derive(Clone)]
pub struct RedisConnection {
    events: mpsc::UnboundedSender<Event>,
    shared: Arc<Shared>,
    _guard: Arc<CloseGuard>,
}

impl RedisConnection {
    /// Runs the startup handshake on a fresh transport and spawns the driver.
    ///
    /// The handshake happens before the driver exists, so its replies can
    /// never be confused with application command replies. Any rejection
    /// closes the transport and surfaces as [`Error::Startup`].
    pub(crate) async fn start<S>(
        mut transport: Transport<S>,
        username: Option<String>,
        password: Option<String>,
        database: Option<u8>,
        client_name: Option<String>,
        on_unexpected_closure: Option<ClosureCallback>,
    ) -> Result<Self>
    where
        S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
    {
        let mut handshake = Vec::new();
        if let Some(password) = password {
            handshake.push(match username {
                Some(username) => command::auth_with_username(username, password),
                None => command::auth(password),
            });
        }
        if let Some(db) = database {
            handshake.push(command::select(db));
        }
        if let Some(name) = client_name {
            handshake.push(command::client_setname(name));
        }

        for cmd in handshake {
            let step = String::from_utf8_lossy(cmd.name()).into_owned();
            let reply = match transport.request(&cmd.into_value()).await {
                Ok(reply) => reply,
                Err(e) => {
                    transport.shutdown().await;
                    return Err(e);
                }
            };
            if let Err(e) = command::expect_ok(reply) {
                transport.shutdown().await;
                return Err(match e {
                    Error::Server { message } => Error::Startup {
                        message: format!("{step} rejected: {message}"),
                    },
                    other => other,
                });
            }
        }

        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let (closed_tx, _) = watch::channel(false);
        let shared = Arc::new(Shared {
            id: Uuid::new_v4(),
            state: AtomicU8::new(ConnectionState::Open as u8),
            autoflush: AtomicBool::new(true),
            allow_subscriptions: AtomicBool::new(true),
            closed: closed_tx,
            on_unexpected_closure: Mutex::new(on_unexpected_closure),
        });

        metrics::incr_counter(&metrics::CONNECTIONS_TOTAL);
        metrics::add_gauge(&metrics::ACTIVE_CONNECTIONS, 1.0);
        debug!(id = %shared.id, "connection established");

        let (reader, writer) = transport.split();
        let driver = Driver {
            reader,
            writer,
            events: events_rx,
            pending: VecDeque::new(),
            state: State::Open,
            shared: Arc::clone(&shared),
            events_closed: false,
            finished: false,
        };
        tokio::spawn(driver.run());

        Ok(Self {
            events: events_tx,
            _guard: Arc::new(CloseGuard {
                shared: Arc::clone(&shared),
            }),
            shared,
        })
    }

    /// The connection's unique identifier.
    pub fn id(&self) -> Uuid {
        self.shared.id
    }

    /// The externally observable connection state.
    pub fn state(&self) -> ConnectionState {
        self.shared.state()
    }

    /// True while the transport is alive and the connection is usable.
    pub fn is_connected(&self) -> bool {
        matches!(
            self.shared.state(),
            ConnectionState::Open | ConnectionState::PubSub
        ) && !self.events.is_closed()
    }

    /// True while the connection is in subscriber mode.
    pub fn is_subscribed(&self) -> bool {
        self.shared.state() == ConnectionState::PubSub
    }

    /// Whether every write is flushed immediately. Defaults to true.
    pub fn autoflush(&self) -> bool {
        self.shared.autoflush.load(Ordering::SeqCst)
    }

    /// Switches immediate flushing on or off.
    ///
    /// Turning the switch off lets a batch of sends accumulate in the write
    /// buffer; turning it back on flushes the buffer exactly once and
    /// restores flush-per-write behavior.
    pub fn set_autoflush(&self, enabled: bool) {
        let was = self.shared.autoflush.swap(enabled, Ordering::SeqCst);
        if enabled && !was {
            let _ = self.events.send(Event::Flush);
        }
    }

    /// Whether `subscribe`/`psubscribe` are currently permitted.
    pub fn allow_subscriptions(&self) -> bool {
        self.shared.allow_subscriptions.load(Ordering::SeqCst)
    }

    /// Permits or forbids subscriptions.
    ///
    /// Flipping to false while subscribed unsubscribes from every channel
    /// and pattern. A subscribe already in flight completes first; the
    /// unsubscribe-all is ordered behind it and removes it.
    pub fn set_allow_subscriptions(&self, allowed: bool) {
        let was = self
            .shared
            .allow_subscriptions
            .swap(allowed, Ordering::SeqCst);
        if was && !allowed && self.is_subscribed() {
            let _ = self.events.send(Event::Unsubscribe {
                kind: SubscriptionKind::Channel,
                targets: Vec::new(),
                ack: None,
            });
            let _ = self.events.send(Event::Unsubscribe {
                kind: SubscriptionKind::Pattern,
                targets: Vec::new(),
                ack: None,
            });
        }
    }

    /// Installs the unexpected-closure callback, replacing any previous one.
    ///
    /// The callback fires at most once, when the server closes the transport
    /// while the connection was `Open` or `PubSub`.
    pub fn on_unexpected_closure(&self, callback: ClosureCallback) {
        *self.shared.on_unexpected_closure.lock().unwrap() = Some(callback);
    }

    /// Sends one command and resolves with its reply.
    ///
    /// A Redis error reply resolves *successfully* with the
    /// [`RespValue::Error`] value: in-band errors belong to the caller.
    /// Transport-level failures fail the future with [`Error`].
    pub async fn send(&self, cmd: Cmd) -> Result<RespValue> {
        let mut replies = self.dispatch(vec![cmd])?;
        let rx = replies.pop().expect("one promise per command");
        rx.await.map_err(|_| Error::ConnectionClosed)?
    }

    /// Sends a batch of commands as one write and resolves with all replies
    /// in submission order.
    pub async fn send_all(&self, cmds: Vec<Cmd>) -> Result<Vec<RespValue>> {
        let replies = self.dispatch(cmds)?;
        let mut values = Vec::with_capacity(replies.len());
        for rx in replies {
            values.push(rx.await.map_err(|_| Error::ConnectionClosed)??);
        }
        Ok(values)
    }

    /// Executes a [`CommandSignature`]: sends all of its commands and decodes
    /// the reply to the last one.
    pub async fn execute<C: CommandSignature>(&self, signature: &C) -> Result<C::Response> {
        let mut replies = self.send_all(signature.commands()).await?;
        let last = replies.pop().ok_or_else(|| Error::Assertion {
            message: "cannot send zero commands".to_string(),
        })?;
        signature.make_response(last)
    }

    /// Subscribes to the given channels.
    ///
    /// The receiver is invoked on the driver task for every message pushed to
    /// one of the channels. `on_subscribe`/`on_unsubscribe` fire per target
    /// with the server-reported subscription count. The returned future
    /// resolves once the server has acknowledged every channel.
    pub async fn subscribe(
        &self,
        channels: Vec<Bytes>,
        receiver: MessageReceiver,
        on_subscribe: Option<SubscriptionChangeHook>,
        on_unsubscribe: Option<SubscriptionChangeHook>,
    ) -> Result<()> {
        self.subscribe_inner(
            SubscriptionKind::Channel,
            channels,
            receiver,
            on_subscribe,
            on_unsubscribe,
        )
        .await
    }

    /// Subscribes to the given patterns (Redis glob syntax; the server does
    /// the matching).
    pub async fn psubscribe(
        &self,
        patterns: Vec<Bytes>,
        receiver: MessageReceiver,
        on_subscribe: Option<SubscriptionChangeHook>,
        on_unsubscribe: Option<SubscriptionChangeHook>,
    ) -> Result<()> {
        self.subscribe_inner(
            SubscriptionKind::Pattern,
            patterns,
            receiver,
            on_subscribe,
            on_unsubscribe,
        )
        .await
    }

    /// Unsubscribes from the given channels; an empty list means all of them.
    ///
    /// Succeeds as a no-op when the connection is not in subscriber mode.
    pub async fn unsubscribe(&self, channels: Vec<Bytes>) -> Result<()> {
        self.unsubscribe_inner(SubscriptionKind::Channel, channels)
            .await
    }

    /// Unsubscribes from the given patterns; an empty list means all of them.
    pub async fn punsubscribe(&self, patterns: Vec<Bytes>) -> Result<()> {
        self.unsubscribe_inner(SubscriptionKind::Pattern, patterns)
            .await
    }

    /// Closes the connection gracefully: QUIT is written, its reply awaited,
    /// and the transport shut down.
    ///
    /// Idempotent: closing an already-closed connection resolves immediately,
    /// and concurrent callers all wait for the same transport close.
    pub async fn close(&self) {
        let mut closed = self.shared.closed.subscribe();
        if *closed.borrow() {
            return;
        }
        let _ = self.events.send(Event::Close);
        // An Err means the driver is gone, which only happens once the
        // connection is already torn down.
        let _ = closed.wait_for(|done| *done).await;
    }

    /// Returns a wrapper that routes commands through this connection with
    /// the supplied tracing span attached. The connection itself is
    /// unchanged.
    pub fn instrumented(&self, span: Span) -> InstrumentedConnection {
        InstrumentedConnection {
            inner: self.clone(),
            span,
        }
    }

    fn dispatch(&self, cmds: Vec<Cmd>) -> Result<Vec<oneshot::Receiver<Result<RespValue>>>> {
        if cmds.is_empty() {
            return Err(Error::Assertion {
                message: "cannot send zero commands".to_string(),
            });
        }
        if !self.is_connected() {
            return Err(Error::ConnectionClosed);
        }
        if self.is_subscribed() {
            for cmd in &cmds {
                if !command::allowed_in_subscriber_mode(cmd.name()) {
                    return Err(Error::InPubSubMode {
                        command: String::from_utf8_lossy(cmd.name()).into_owned(),
                    });
                }
            }
        }

        let mut frames = Vec::with_capacity(cmds.len());
        let mut promises = Vec::with_capacity(cmds.len());
        let mut replies = Vec::with_capacity(cmds.len());
        for cmd in cmds {
            let (tx, rx) = oneshot::channel();
            frames.push(cmd.into_value());
            promises.push(tx);
            replies.push(rx);
        }

        self.events
            .send(Event::Send {
                frames,
                promises,
                submitted_at: Instant::now(),
            })
            .map_err(|_| Error::ConnectionClosed)?;
        Ok(replies)
    }

    async fn subscribe_inner(
        &self,
        kind: SubscriptionKind,
        targets: Vec<Bytes>,
        receiver: MessageReceiver,
        on_subscribe: Option<SubscriptionChangeHook>,
        on_unsubscribe: Option<SubscriptionChangeHook>,
    ) -> Result<()> {
        if targets.is_empty() {
            return Err(Error::Assertion {
                message: "cannot subscribe to zero targets".to_string(),
            });
        }
        if !self.is_connected() {
            return Err(Error::ConnectionClosed);
        }
        if !self.allow_subscriptions() {
            return Err(Error::PubSubNotAllowed);
        }

        let (tx, rx) = oneshot::channel();
        self.events
            .send(Event::Subscribe {
                kind,
                targets,
                receiver,
                on_subscribe,
                on_unsubscribe,
                ack: tx,
            })
            .map_err(|_| Error::ConnectionClosed)?;
        rx.await.map_err(|_| Error::ConnectionClosed)?
    }

    async fn unsubscribe_inner(&self, kind: SubscriptionKind, targets: Vec<Bytes>) -> Result<()> {
        if !self.is_subscribed() {
            return Ok(());
        }

        let (tx, rx) = oneshot::channel();
        if self
            .events
            .send(Event::Unsubscribe {
                kind,
                targets,
                ack: Some(tx),
            })
            .is_err()
        {
            // The driver is gone, so nothing is subscribed anymore.
            return Ok(());
        }
        match rx.await {
            Ok(result) => result,
            Err(_) => Ok(()),
        }
    }
}

impl std::fmt::Debug for RedisConnection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RedisConnection")
            .field("id", &self.shared.id)
            .field("state", &self.shared.state())
            .finish()
    }
}

/// A [`RedisConnection`] wrapper that attaches a tracing span to every
/// command, leaving the connection itself untouched.
#[derive(Debug, Clone)]
pub struct InstrumentedConnection {
    inner: RedisConnection,
    span: Span,
}

impl InstrumentedConnection {
    /// Sends one command inside the attached span.
    pub async fn send(&self, cmd: Cmd) -> Result<RespValue> {
        use tracing::Instrument;
        self.inner.send(cmd).instrument(self.span.clone()).await
    }

    /// Sends a batch of commands inside the attached span.
    pub async fn send_all(&self, cmds: Vec<Cmd>) -> Result<Vec<RespValue>> {
        use tracing::Instrument;
        self.inner.send_all(cmds).instrument(self.span.clone()).await
    }

    /// Executes a signature inside the attached span.
    pub async fn execute<C: CommandSignature>(&self, signature: &C) -> Result<C::Response> {
        use tracing::Instrument;
        self.inner
            .execute(signature)
            .instrument(self.span.clone())
            .await
    }

    /// The underlying connection.
    pub fn connection(&self) -> &RedisConnection {
        &self.inner
    }
}

/// What the driver loop observed this iteration.
enum Tick {
    Event(Option<Event>),
    Inbound(Result<Option<RespValue>>),
}

struct Driver<S> {
    reader: TransportReader<S>,
    writer: TransportWriter<S>,
    events: mpsc::UnboundedReceiver<Event>,
    pending: VecDeque<Pending>,
    state: State,
    shared: Arc<Shared>,
    events_closed: bool,
    finished: bool,
}

impl<S> Driver<S>
where
    S: AsyncRead + AsyncWrite + Send + 'static,
{
    async fn run(mut self) {
        while !self.finished {
            if self.events_closed {
                let inbound = self.reader.read_value().await;
                self.process_inbound(inbound).await;
                continue;
            }

            let tick = {
                let Driver { reader, events, .. } = &mut self;
                tokio::select! {
                    event = events.recv() => Tick::Event(event),
                    value = reader.read_value() => Tick::Inbound(value),
                }
            };

            match tick {
                Tick::Event(Some(event)) => {
                    if let Err(e) = self.handle_event(event).await {
                        self.fail_connection(Some(e));
                    }
                }
                Tick::Event(None) => {
                    // Every handle is gone; wind the connection down.
                    self.events_closed = true;
                    if let Err(e) = self.begin_close().await {
                        self.fail_connection(Some(e));
                    }
                }
                Tick::Inbound(inbound) => self.process_inbound(inbound).await,
            }
        }
    }

    async fn process_inbound(&mut self, inbound: Result<Option<RespValue>>) {
        match inbound {
            Ok(Some(value)) => {
                if let Err(e) = self.handle_inbound(value).await {
                    self.fail_connection(Some(e));
                }
            }
            Ok(None) => {
                if matches!(self.state, State::ShuttingDown) {
                    self.finish_close().await;
                } else {
                    self.fail_connection(None);
                }
            }
            Err(e) => {
                if matches!(self.state, State::ShuttingDown) {
                    self.finish_close().await;
                } else {
                    self.fail_connection(Some(e));
                }
            }
        }
    }

    async fn handle_event(&mut self, event: Event) -> Result<()> {
        match event {
            Event::Send {
                frames,
                promises,
                submitted_at,
            } => self.handle_send(frames, promises, submitted_at).await,
            Event::Flush => {
                self.writer.flush().await?;
                Ok(())
            }
            Event::Subscribe {
                kind,
                targets,
                receiver,
                on_subscribe,
                on_unsubscribe,
                ack,
            } => {
                self.handle_subscribe(kind, targets, receiver, on_subscribe, on_unsubscribe, ack)
                    .await
            }
            Event::Unsubscribe { kind, targets, ack } => {
                self.handle_unsubscribe(kind, targets, ack).await
            }
            Event::Close => self.begin_close().await,
        }
    }

    async fn handle_send(
        &mut self,
        frames: Vec<RespValue>,
        promises: Vec<oneshot::Sender<Result<RespValue>>>,
        submitted_at: Instant,
    ) -> Result<()> {
        if !matches!(self.state, State::Open | State::PubSub(_)) {
            for tx in promises {
                let _ = tx.send(Err(Error::ConnectionClosed));
            }
            return Ok(());
        }

        for tx in promises {
            self.pending.push_back(Pending::Command { tx, submitted_at });
        }
        let flush = self.shared.autoflush.load(Ordering::SeqCst);
        self.writer.write_values(&frames, flush).await?;
        Ok(())
    }

    async fn handle_subscribe(
        &mut self,
        kind: SubscriptionKind,
        targets: Vec<Bytes>,
        receiver: MessageReceiver,
        on_subscribe: Option<SubscriptionChangeHook>,
        on_unsubscribe: Option<SubscriptionChangeHook>,
        ack: oneshot::Sender<Result<()>>,
    ) -> Result<()> {
        if matches!(self.state, State::ShuttingDown | State::Closed) {
            let _ = ack.send(Err(Error::ConnectionClosed));
            return Ok(());
        }
        if matches!(self.state, State::Open) {
            self.state = State::PubSub(PubSubDispatcher::new());
            self.shared.store_state(ConnectionState::PubSub);
        }

        let frame = match kind {
            SubscriptionKind::Channel => command::subscribe(&targets),
            SubscriptionKind::Pattern => command::psubscribe(&targets),
        }
        .into_value();

        self.pending.push_back(Pending::SubscriptionChange {
            change: SubscriptionChange::Added,
            kind,
            remaining: targets.len(),
            receiver: Some(receiver),
            on_subscribe,
            on_unsubscribe,
            ack: Some(ack),
        });

        let flush = self.shared.autoflush.load(Ordering::SeqCst);
        if let Err(e) = self.writer.write_values(&[frame], flush).await {
            // The write failure is fatal, but roll back the entry first so the
            // caller sees the original cause rather than ConnectionClosed, and
            // drop a dispatcher that was installed for nothing.
            if let Some(Pending::SubscriptionChange { ack: Some(ack), .. }) = self.pending.pop_back()
            {
                let _ = ack.send(Err(Error::Io {
                    source: std::io::Error::new(e.kind(), e.to_string()),
                }));
            }
            if matches!(&self.state, State::PubSub(d) if d.is_empty()) {
                self.state = State::Open;
                self.shared.store_state(ConnectionState::Open);
            }
            return Err(Error::Io { source: e });
        }
        Ok(())
    }

    async fn handle_unsubscribe(
        &mut self,
        kind: SubscriptionKind,
        targets: Vec<Bytes>,
        ack: Option<oneshot::Sender<Result<()>>>,
    ) -> Result<()> {
        let dispatcher = match &self.state {
            State::PubSub(dispatcher) => dispatcher,
            _ => {
                if let Some(ack) = ack {
                    let _ = ack.send(Ok(()));
                }
                return Ok(());
            }
        };

        // Unsubscribe-all is acknowledged once per live target, or exactly
        // once (with a null target) when nothing of the kind was subscribed.
        let remaining = if targets.is_empty() {
            dispatcher.len(kind).max(1)
        } else {
            targets.len()
        };

        let frame = match kind {
            SubscriptionKind::Channel => command::unsubscribe(&targets),
            SubscriptionKind::Pattern => command::punsubscribe(&targets),
        }
        .into_value();

        self.pending.push_back(Pending::SubscriptionChange {
            change: SubscriptionChange::Removed,
            kind,
            remaining,
            receiver: None,
            on_subscribe: None,
            on_unsubscribe: None,
            ack,
        });

        let flush = self.shared.autoflush.load(Ordering::SeqCst);
        self.writer.write_values(&[frame], flush).await?;
        Ok(())
    }

    async fn begin_close(&mut self) -> Result<()> {
        if matches!(self.state, State::ShuttingDown | State::Closed) {
            return Ok(());
        }
        self.state = State::ShuttingDown;
        self.shared.store_state(ConnectionState::ShuttingDown);
        debug!(id = %self.shared.id, "closing connection");

        self.pending.push_back(Pending::Quit);
        self.writer
            .write_values(&[command::quit().into_value()], true)
            .await?;
        Ok(())
    }

    async fn handle_inbound(&mut self, value: RespValue) -> Result<()> {
        let outcome = match &mut self.state {
            State::PubSub(dispatcher) => dispatcher.handle(value)?,
            _ => {
                // Acknowledgements can trail the return to Open (the second
                // half of an unsubscribe-all); only classify them while a
                // subscription change is actually pending.
                let expecting_acks = self
                    .pending
                    .iter()
                    .any(|entry| matches!(entry, Pending::SubscriptionChange { .. }));
                if expecting_acks {
                    match pubsub::classify_ack(&value)? {
                        Some(ack) => DispatchOutcome::Ack(ack),
                        None => DispatchOutcome::Response(value),
                    }
                } else {
                    DispatchOutcome::Response(value)
                }
            }
        };

        match outcome {
            DispatchOutcome::Response(value) => self.resolve_next(value).await,
            DispatchOutcome::Ack(ack) => {
                self.handle_ack(ack);
                Ok(())
            }
            DispatchOutcome::Delivered => Ok(()),
        }
    }

    async fn resolve_next(&mut self, value: RespValue) -> Result<()> {
        let index = self
            .pending
            .iter()
            .position(|entry| matches!(entry, Pending::Command { .. } | Pending::Quit));
        let entry = match index {
            Some(index) => self.pending.remove(index).expect("entry exists"),
            None => {
                warn!(id = %self.shared.id, "dropping reply with no pending command");
                return Ok(());
            }
        };

        match entry {
            Pending::Command { tx, submitted_at } => {
                if value.is_error() {
                    metrics::incr_counter(&metrics::COMMANDS_FAILURE_TOTAL);
                } else {
                    metrics::incr_counter(&metrics::COMMANDS_SUCCESS_TOTAL);
                }
                metrics::observe_round_trip(submitted_at.elapsed());
                // An Err here means the caller cancelled; the reply is
                // dropped, which is the documented cancellation behavior.
                let _ = tx.send(Ok(value));
            }
            Pending::Quit => {
                self.finish_close().await;
            }
            Pending::SubscriptionChange { .. } => unreachable!("filtered by position()"),
        }
        Ok(())
    }

    fn handle_ack(&mut self, ack: SubscriptionAck) {
        let index = self.pending.iter().position(|entry| {
            matches!(
                entry,
                Pending::SubscriptionChange { change, kind, .. }
                    if *change == ack.change && *kind == ack.kind
            )
        });

        match ack.change {
            SubscriptionChange::Added => {
                let Some(index) = index else {
                    warn!(id = %self.shared.id, "unmatched subscribe ack");
                    return;
                };
                if let State::PubSub(dispatcher) = &mut self.state {
                    if let Pending::SubscriptionChange {
                        receiver,
                        on_subscribe,
                        on_unsubscribe,
                        ..
                    } = &self.pending[index]
                    {
                        if let (Some(target), Some(receiver)) = (&ack.target, receiver) {
                            dispatcher.register(
                                ack.kind,
                                target.clone(),
                                Arc::clone(receiver),
                                on_unsubscribe.clone(),
                            );
                            if let Some(hook) = on_subscribe {
                                hook(target, ack.count.max(0) as usize);
                            }
                        }
                    }
                }
                self.settle_subscription_entry(index);
            }
            SubscriptionChange::Removed => {
                let mut left_subscriber_mode = false;
                if let State::PubSub(dispatcher) = &mut self.state {
                    if let Some(target) = &ack.target {
                        dispatcher.unregister(ack.kind, target, ack.count);
                    }
                    left_subscriber_mode = ack.count == 0 && dispatcher.is_empty();
                }

                if let Some(index) = index {
                    self.settle_subscription_entry(index);
                }

                if left_subscriber_mode {
                    self.state = State::Open;
                    self.shared.store_state(ConnectionState::Open);
                    debug!(id = %self.shared.id, "left subscriber mode");
                }
            }
        }
    }

    /// Decrements a pending subscription entry, resolving and removing it
    /// once every expected acknowledgement has arrived.
    fn settle_subscription_entry(&mut self, index: usize) {
        let done = match &mut self.pending[index] {
            Pending::SubscriptionChange { remaining, .. } => {
                *remaining = remaining.saturating_sub(1);
                *remaining == 0
            }
            _ => false,
        };
        if done {
            if let Some(Pending::SubscriptionChange { ack: Some(ack), .. }) =
                self.pending.remove(index)
            {
                let _ = ack.send(Ok(()));
            }
        }
    }

    /// Graceful teardown once QUIT is acknowledged or the peer hung up while
    /// shutting down.
    async fn finish_close(&mut self) {
        let _ = self.writer.shutdown().await;
        self.teardown(false);
    }

    /// Fatal teardown: the transport died while the connection was live.
    fn fail_connection(&mut self, cause: Option<Error>) {
        let unexpected = matches!(self.state, State::Open | State::PubSub(_));
        match &cause {
            Some(e) => error!(id = %self.shared.id, error = %e, "connection failed"),
            None => warn!(id = %self.shared.id, "connection closed by peer"),
        }
        self.teardown(unexpected);
    }

    fn teardown(&mut self, unexpected: bool) {
        // Replacing the state drops any dispatcher, which settles the
        // subscription gauges for whatever was still registered.
        self.state = State::Closed;
        self.shared.store_state(ConnectionState::Closed);
        metrics::add_gauge(&metrics::ACTIVE_CONNECTIONS, -1.0);

        // The callback fires before the pending promises fail, so a caller
        // woken by its failing future already observes the closure.
        if unexpected {
            self.shared.fire_unexpected_closure();
        }

        for entry in self.pending.drain(..) {
            match entry {
                Pending::Command { tx, .. } => {
                    let _ = tx.send(Err(Error::ConnectionClosed));
                }
                Pending::SubscriptionChange { ack: Some(ack), .. } => {
                    let _ = ack.send(Err(Error::ConnectionClosed));
                }
                Pending::Quit | Pending::SubscriptionChange { ack: None, .. } => {}
            }
        }

        // send_replace stores the value even when nobody subscribed yet, so a
        // later close() still observes the finished state.
        self.shared.closed.send_replace(true);

        self.finished = true;
        debug!(id = %self.shared.id, "connection closed");
    }
}
