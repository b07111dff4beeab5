//! Connection state machine
//!
//! A `Connection` is one physical link walking `Idle -> Opening -> Open ->
//! Closing -> Closed`. It owns two sequential workers: the main worker
//! serializes every state mutation (open, inbound frames, handler chain
//! advancement, timers, close) and the send worker serializes outbound
//! traffic. The send worker stays disabled until the link is open, so sends
//! submitted early simply wait.
//!
//! Other contexts only ever read published views: the state through a watch
//! channel, the handler position through an atomic, and the close reason and
//! link through write-once cells.

use core::fmt;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, OnceLock};

use dashmap::DashMap;
use futures::future::{BoxFuture, FutureExt};
use serde::{Deserialize, Serialize};
use tokio::sync::watch;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::config::ConnectionConfig;
use crate::errors::{
    ConfigError, SocketError, SocketResult, WorkerError, END_OF_HANDLER_CHAIN, NORMAL_CLOSURE,
};
use crate::handler::{guarded, ConnectionHandler, HandlerChain};
use crate::message::{Frame, Message};
use crate::scheduler::{cancel_timer, Scheduler, TimerHandle};
use crate::transport::{DialRequest, Transport, TransportEvents, TransportLink};
use crate::types::ConnectionId;
use crate::worker::SequentialWorker;

/// Inbound traffic re-arms the liveness timers at most once per window
const REARM_WINDOW_MS: u64 = 50;

/// `last_inbound` value before any traffic was seen
const NEVER: u64 = u64::MAX;

/// Completion of an outbound send
pub type SendFuture = BoxFuture<'static, SocketResult<()>>;

// ----------------------------------------------------------------------------
// Connection State
// ----------------------------------------------------------------------------

/// Lifecycle of a physical connection; transitions only move forward
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum ConnectionState {
    Idle,
    Opening,
    Open,
    Closing,
    Closed,
}

impl ConnectionState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, ConnectionState::Closing | ConnectionState::Closed)
    }
}

// ----------------------------------------------------------------------------
// Connection
// ----------------------------------------------------------------------------

/// Cloneable handle to one physical connection
#[derive(Clone)]
pub struct Connection {
    shared: Arc<ConnectionShared>,
}

pub(crate) struct ConnectionShared {
    id: ConnectionId,
    name: Arc<str>,
    request: DialRequest,
    config: ConnectionConfig,
    chain: HandlerChain,
    scheduler: Scheduler,
    transport: Arc<dyn Transport>,
    main: SequentialWorker<ConnectionCore>,
    send: SequentialWorker<()>,
    state: watch::Sender<ConnectionState>,
    handler_index: AtomicUsize,
    /// Milliseconds since `epoch` of the last liveness re-arm
    last_inbound: AtomicU64,
    epoch: Instant,
    closed_with: OnceLock<SocketError>,
    link: OnceLock<Arc<dyn TransportLink>>,
    attributes: DashMap<String, serde_json::Value>,
}

/// State owned by the main worker
#[derive(Default)]
struct ConnectionCore {
    next_ping: Option<TimerHandle>,
    next_read_timeout: Option<TimerHandle>,
    next_init_timeout: Option<TimerHandle>,
    /// Frames that raced ahead of the open transition
    early_frames: Vec<Frame>,
}

impl Connection {
    /// Start configuring a connection to `request`
    pub fn builder(request: DialRequest) -> ConnectionBuilder {
        ConnectionBuilder::new(request)
    }

    pub(crate) fn from_shared(shared: Arc<ConnectionShared>) -> Self {
        Self { shared }
    }

    // ------------------------------------------------------------------------
    // Read-only views
    // ------------------------------------------------------------------------

    pub fn id(&self) -> ConnectionId {
        self.shared.id
    }

    pub fn name(&self) -> &str {
        &self.shared.name
    }

    /// Request this connection was dialed with
    pub fn request(&self) -> &DialRequest {
        &self.shared.request
    }

    pub fn state(&self) -> ConnectionState {
        *self.shared.state.borrow()
    }

    /// Receiver following every state transition
    pub fn subscribe_state(&self) -> watch::Receiver<ConnectionState> {
        self.shared.state.subscribe()
    }

    /// Whether the link is open and not closing
    pub fn is_connected(&self) -> bool {
        self.state() == ConnectionState::Open
    }

    /// Whether the link opened at some point
    pub fn has_opened(&self) -> bool {
        self.shared.link.get().is_some()
    }

    /// Current position in the handler chain
    pub fn handler_index(&self) -> usize {
        self.shared.handler_index.load(Ordering::Acquire)
    }

    /// Whether the connection reached the final handler stage
    pub fn is_initialized(&self) -> bool {
        self.shared.chain.is_final(self.handler_index())
    }

    /// Why the connection closed, once it has
    pub fn closed_reason(&self) -> Option<SocketError> {
        self.shared.closed_with.get().cloned()
    }

    /// Free-form values shared between handler stages
    pub fn attributes(&self) -> &DashMap<String, serde_json::Value> {
        &self.shared.attributes
    }

    /// Resolves with the close reason once the connection is closed
    pub fn wait_closed(&self) -> impl std::future::Future<Output = SocketError> + Send + 'static {
        let mut receiver = self.shared.state.subscribe();
        let shared = Arc::clone(&self.shared);
        async move {
            loop {
                if *receiver.borrow_and_update() == ConnectionState::Closed {
                    break;
                }
                if receiver.changed().await.is_err() {
                    break;
                }
            }
            shared
                .closed_with
                .get()
                .cloned()
                .unwrap_or_else(|| SocketError::illegal_state("Connection dropped"))
        }
    }

    fn current_stage(&self) -> Arc<dyn ConnectionHandler> {
        Arc::clone(self.shared.chain.stage(self.handler_index()))
    }

    fn link(&self) -> Option<Arc<dyn TransportLink>> {
        self.shared.link.get().cloned()
    }

    fn now_ms(&self) -> u64 {
        self.shared.epoch.elapsed().as_millis() as u64
    }

    fn worker_failure(&self, err: WorkerError) -> SocketError {
        match err {
            WorkerError::Retired => self
                .closed_reason()
                .unwrap_or_else(|| SocketError::illegal_state("Connection is closed")),
            WorkerError::Panicked => SocketError::illegal_state(err.to_string()),
        }
    }

    // ------------------------------------------------------------------------
    // Public operations
    // ------------------------------------------------------------------------

    /// Send a message on this connection
    ///
    /// The send is queued immediately; awaiting the returned future is only
    /// needed to observe the outcome.
    pub fn send_message(&self, message: impl Into<Message>) -> SendFuture {
        let message = message.into();
        let this = self.clone();
        let task = self
            .shared
            .send
            .submit_async(move |_: &mut ()| this.transmit(message));

        let this = self.clone();
        async move {
            match task.await {
                Ok(outcome) => outcome,
                Err(err) => Err(this.worker_failure(err)),
            }
        }
        .boxed()
    }

    /// Close the connection; a no-op once it is closed
    pub fn close(&self, reason: impl Into<String>, code: u16) -> BoxFuture<'static, ()> {
        let reason = SocketError::closed(code, reason);
        let this = self.clone();
        let task = self
            .shared
            .main
            .submit(move |core: &mut ConnectionCore| this.close_with(core, reason));
        async move {
            let _ = task.await;
        }
        .boxed()
    }

    /// Move to the next handler stage, closing past the final one
    pub fn complete_handler(&self) -> BoxFuture<'static, SocketResult<()>> {
        let this = self.clone();
        let task = self
            .shared
            .main
            .submit(move |core: &mut ConnectionCore| this.advance(core));

        let this = self.clone();
        async move {
            match task.await {
                Ok(outcome) => outcome,
                Err(err) => Err(this.worker_failure(err)),
            }
        }
        .boxed()
    }

    // ------------------------------------------------------------------------
    // Transport entry points
    // ------------------------------------------------------------------------

    fn dial(&self) {
        self.shared.state.send_replace(ConnectionState::Opening);
        debug!(name = %self.shared.name, id = %self.shared.id, address = %self.shared.request.address, "Dialing");

        let this = self.clone();
        let events = TransportEvents::new(Arc::downgrade(&self.shared));
        self.shared.scheduler.spawn(async move {
            let transport = Arc::clone(&this.shared.transport);
            match transport.dial(&this.shared.request, events).await {
                Ok(link) => {
                    let opener = this.clone();
                    let pending = Arc::clone(&link);
                    let opened = this
                        .shared
                        .main
                        .submit(move |core: &mut ConnectionCore| opener.open_with(core, pending))
                        .await;
                    if !matches!(opened, Ok(true)) {
                        debug!(name = %this.shared.name, id = %this.shared.id, "Closed before open, dropping link");
                        let _ = link
                            .close(NORMAL_CLOSURE, "Connection closed".to_string())
                            .await;
                    }
                }
                Err(err) => {
                    warn!(name = %this.shared.name, id = %this.shared.id, transport = transport.name(), error = %err, "Dial failed");
                    this.fail(err);
                }
            }
        });
    }

    /// Record inbound activity, re-arming liveness timers at most once per window
    pub(crate) fn data_received(&self) {
        let last = self.shared.last_inbound.load(Ordering::Acquire);
        let now = self.now_ms();
        let expired = last == NEVER || last.saturating_add(REARM_WINDOW_MS) < now;

        if expired
            && self
                .shared
                .last_inbound
                .compare_exchange(last, now, Ordering::AcqRel, Ordering::Acquire)
                .is_ok()
        {
            let this = self.clone();
            let _ = self.shared.main.submit(move |core: &mut ConnectionCore| {
                if this.is_connected() {
                    this.arm_liveness(core);
                }
            });
        }
    }

    /// Queue an inbound frame for the current handler stage
    pub(crate) fn accept_frame(&self, frame: Frame) {
        let this = self.clone();
        let _ = self
            .shared
            .main
            .submit(move |core: &mut ConnectionCore| match this.state() {
                ConnectionState::Idle | ConnectionState::Opening => core.early_frames.push(frame),
                ConnectionState::Open => this.deliver(frame),
                ConnectionState::Closing | ConnectionState::Closed => {}
            });
    }

    /// Close with a failure reported by the transport or a timer
    pub(crate) fn fail(&self, reason: SocketError) {
        let this = self.clone();
        let _ = self
            .shared
            .main
            .submit(move |core: &mut ConnectionCore| this.close_with(core, reason));
    }

    // ------------------------------------------------------------------------
    // Main worker tasks
    // ------------------------------------------------------------------------

    fn open_with(&self, core: &mut ConnectionCore, link: Arc<dyn TransportLink>) -> bool {
        if self.state() != ConnectionState::Opening || self.shared.link.set(link).is_err() {
            return false;
        }

        self.shared.state.send_replace(ConnectionState::Open);

        if !self.is_initialized() {
            let target = Arc::downgrade(&self.shared);
            core.next_init_timeout = Some(self.shared.scheduler.schedule(
                self.shared.config.init_timeout,
                async move {
                    if let Some(shared) = target.upgrade() {
                        Connection::from_shared(shared).init_timed_out();
                    }
                },
            ));
        }

        self.shared
            .last_inbound
            .store(self.now_ms(), Ordering::Release);
        self.arm_liveness(core);

        info!(name = %self.shared.name, id = %self.shared.id, "Opened");
        self.shared.send.enable(true);

        let stage = self.current_stage();
        let reply = guarded(&self.shared.name, self.shared.id, "on_available", || {
            stage.on_available(self)
        });
        self.reply(reply);

        for frame in std::mem::take(&mut core.early_frames) {
            if !self.is_connected() {
                break;
            }
            self.deliver(frame);
        }
        true
    }

    fn deliver(&self, frame: Frame) {
        let stage = self.current_stage();
        let kind = frame.kind();
        let message = match stage.deserializer().deserialize(frame) {
            Ok(message) => message,
            Err(err) => {
                warn!(name = %self.shared.name, id = %self.shared.id, kind, error = %err, "Dropping undecodable frame");
                return;
            }
        };

        let reply = guarded(&self.shared.name, self.shared.id, "on_message", || {
            stage.on_message(self, message)
        });
        self.reply(reply);
    }

    fn advance(&self, core: &mut ConnectionCore) -> SocketResult<()> {
        if !self.is_connected() {
            return Err(SocketError::illegal_state("Connection is not connected"));
        }

        let index = self.handler_index();
        let chain = self.shared.chain.clone();
        if chain.is_final(index) {
            self.close_with(core, SocketError::closed(NORMAL_CLOSURE, END_OF_HANDLER_CHAIN));
            return Ok(());
        }

        let next = index + 1;
        self.shared.handler_index.store(next, Ordering::Release);
        debug!(name = %self.shared.name, id = %self.shared.id, stage = next, "Handler completed");

        if self.is_initialized() {
            cancel_timer(&mut core.next_init_timeout);
        }

        if !chain.same_stage(index, next) {
            let previous = Arc::clone(chain.stage(index));
            let reply = guarded(&self.shared.name, self.shared.id, "on_unavailable", || {
                previous.on_unavailable(self)
            });
            self.reply(reply);

            let current = Arc::clone(chain.stage(next));
            let reply = guarded(&self.shared.name, self.shared.id, "on_available", || {
                current.on_available(self)
            });
            self.reply(reply);
        }
        Ok(())
    }

    fn close_with(&self, core: &mut ConnectionCore, reason: SocketError) {
        if self.shared.closed_with.set(reason.clone()).is_err() {
            return;
        }

        let was_open = self.is_connected();
        cancel_timer(&mut core.next_ping);
        cancel_timer(&mut core.next_read_timeout);
        cancel_timer(&mut core.next_init_timeout);
        core.early_frames.clear();

        self.shared.state.send_replace(ConnectionState::Closing);
        self.shared.main.retire();
        self.shared.send.retire();

        if let Some(link) = self.link() {
            let code = reason.close_code();
            let text = reason.close_reason();
            let name = Arc::clone(&self.shared.name);
            let id = self.shared.id;
            self.shared.scheduler.spawn(async move {
                if let Err(err) = link.close(code, text).await {
                    debug!(name = %name, id = %id, error = %err, "Link close failed");
                }
            });
        }

        self.shared.state.send_replace(ConnectionState::Closed);
        debug!(name = %self.shared.name, id = %self.shared.id, reason = %reason, "Closed");

        if was_open {
            let stage = self.current_stage();
            // Replies cannot be sent anymore
            let _ = guarded(&self.shared.name, self.shared.id, "on_unavailable", || {
                stage.on_unavailable(self)
            });
        }
    }

    fn init_timed_out(&self) {
        let this = self.clone();
        let _ = self.shared.main.submit(move |core: &mut ConnectionCore| {
            if !this.is_initialized() {
                warn!(name = %this.shared.name, id = %this.shared.id, stage = this.handler_index(), "Initialization timeout");
                this.close_with(core, SocketError::InitializationTimeout);
            }
        });
    }

    fn arm_liveness(&self, core: &mut ConnectionCore) {
        cancel_timer(&mut core.next_ping);
        let target = Arc::downgrade(&self.shared);
        core.next_ping = Some(self.shared.scheduler.schedule(
            self.shared.config.ping_interval,
            async move {
                if let Some(shared) = target.upgrade() {
                    Connection::from_shared(shared).ping_now();
                }
            },
        ));

        cancel_timer(&mut core.next_read_timeout);
        let target = Arc::downgrade(&self.shared);
        core.next_read_timeout = Some(self.shared.scheduler.schedule(
            self.shared.config.read_timeout,
            async move {
                if let Some(shared) = target.upgrade() {
                    Connection::from_shared(shared).fail(SocketError::ReadTimeout);
                }
            },
        ));
    }

    // ------------------------------------------------------------------------
    // Send worker tasks
    // ------------------------------------------------------------------------

    fn ping_now(&self) {
        let this = self.clone();
        let _ = self.shared.send.submit_async(move |_: &mut ()| async move {
            let Some(link) = this.link() else {
                return;
            };
            debug!(name = %this.shared.name, id = %this.shared.id, "Ping");
            if let Err(err) = link.ping().await {
                this.fail(err);
            }
        });
    }

    async fn transmit(self, message: Message) -> SocketResult<()> {
        if let Some(reason) = self.closed_reason() {
            return Err(reason);
        }
        let link = self
            .link()
            .ok_or_else(|| SocketError::illegal_state("Connection is not open"))?;

        let frame = match message {
            Message::Text(text) => Frame::Text(text),
            Message::Binary(data) => Frame::Binary(data),
            structured => self.current_stage().serializer().serialize(structured)?,
        };

        let sent = match frame {
            Frame::Text(text) => link.send_text(text).await,
            Frame::Binary(data) => link.send_binary(data).await,
        };

        if let Err(err) = sent {
            let reason = match err {
                SocketError::Connection(_) => err,
                other => SocketError::connection(other.to_string()),
            };
            warn!(name = %self.shared.name, id = %self.shared.id, error = %reason, "Send failed");
            self.fail(reason.clone());
            return Err(reason);
        }
        Ok(())
    }

    fn reply(&self, reply: Option<Message>) {
        let Some(message) = reply else {
            return;
        };
        let sent = self.send_message(message);
        let name = Arc::clone(&self.shared.name);
        let id = self.shared.id;
        self.shared.scheduler.spawn(async move {
            if let Err(err) = sent.await {
                debug!(name = %name, id = %id, error = %err, "Reply not sent");
            }
        });
    }
}

impl PartialEq for Connection {
    fn eq(&self, other: &Self) -> bool {
        self.shared.id == other.shared.id
    }
}

impl Eq for Connection {}

impl fmt::Debug for Connection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Connection")
            .field("id", &self.shared.id)
            .field("name", &self.shared.name)
            .field("state", &self.state())
            .field("handler_index", &self.handler_index())
            .finish()
    }
}

// ----------------------------------------------------------------------------
// Connection Builder
// ----------------------------------------------------------------------------

/// Configures and dials a standalone connection
pub struct ConnectionBuilder {
    request: DialRequest,
    name: String,
    config: ConnectionConfig,
    stages: Vec<Arc<dyn ConnectionHandler>>,
}

impl ConnectionBuilder {
    fn new(request: DialRequest) -> Self {
        Self {
            request,
            name: "connection".to_string(),
            config: ConnectionConfig::default(),
            stages: Vec::new(),
        }
    }

    pub fn name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    pub fn config(mut self, config: ConnectionConfig) -> Self {
        self.config = config;
        self
    }

    /// Append a handler stage
    pub fn handler(mut self, stage: Arc<dyn ConnectionHandler>) -> Self {
        self.stages.push(stage);
        self
    }

    /// Replace all handler stages
    pub fn handlers(mut self, stages: Vec<Arc<dyn ConnectionHandler>>) -> Self {
        self.stages = stages;
        self
    }

    /// Validate the configuration and start dialing
    pub fn connect(
        self,
        scheduler: &Scheduler,
        transport: Arc<dyn Transport>,
    ) -> Result<Connection, ConfigError> {
        self.config.validate()?;
        self.request.validate()?;
        let chain = HandlerChain::new(self.stages);
        Ok(open_connection(
            scheduler,
            transport,
            self.request,
            self.name,
            self.config,
            chain,
        ))
    }
}

/// Create a connection over a prepared chain and start dialing
pub(crate) fn open_connection(
    scheduler: &Scheduler,
    transport: Arc<dyn Transport>,
    request: DialRequest,
    name: impl Into<String>,
    config: ConnectionConfig,
    chain: HandlerChain,
) -> Connection {
    let id = ConnectionId::next();
    let name: Arc<str> = Arc::from(name.into());
    let (state, _) = watch::channel(ConnectionState::Idle);

    let connection = Connection {
        shared: Arc::new(ConnectionShared {
            id,
            main: SequentialWorker::new(
                scheduler,
                format!("{}-{}-main", name, id),
                ConnectionCore::default(),
                true,
            ),
            send: SequentialWorker::new(scheduler, format!("{}-{}-send", name, id), (), false),
            name,
            request,
            config,
            chain,
            scheduler: scheduler.clone(),
            transport,
            state,
            handler_index: AtomicUsize::new(0),
            last_inbound: AtomicU64::new(NEVER),
            epoch: Instant::now(),
            closed_with: OnceLock::new(),
            link: OnceLock::new(),
            attributes: DashMap::new(),
        }),
    };

    connection.dial();
    connection
}
