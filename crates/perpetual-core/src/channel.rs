//! Perpetual channel
//!
//! A `PerpetualChannel` presents one logical duplex channel on top of a
//! rotating set of physical connections. Every `shift_duration` a replacement
//! connection is dialed speculatively; `switch_duration` after it opens, every
//! older connection is closed. While more than one connection is alive,
//! inbound frames go through the deduplicator so the consumer sees each
//! message once. Rotation is invisible to the consumer: `on_available` fires
//! when the first connection goes live and `on_unavailable` only on total loss
//! of connectivity or teardown.
//!
//! All channel state is owned by the channel's main worker. The list of
//! connections is additionally published as an immutable snapshot for the
//! send path and for `is_connected`.

use core::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};

use futures::future::{self, BoxFuture, FutureExt};
use serde::{Deserialize, Serialize};
use tokio::sync::watch;
use tracing::{debug, info, warn};

use crate::config::ChannelConfig;
use crate::connection::{open_connection, Connection, SendFuture};
use crate::deduplication::{DeduplicationStats, MessageDeduplicator};
use crate::errors::{ConfigError, SocketError, SocketResult, WorkerError, NORMAL_CLOSURE};
use crate::handler::{
    guarded, ChannelHandler, ConnectionHandler, HandlerBuilder, HandlerChain, HandlerResult,
};
use crate::message::{Deserializer, Frame, Message, Passthrough, Serializer};
use crate::scheduler::{cancel_timer, Scheduler, TimerHandle};
use crate::transport::{DialRequest, RequestFactory, Transport};
use crate::types::{ChannelId, ConnectionId};
use crate::worker::SequentialWorker;

/// Close reason of connections retired by rotation
pub const SHIFT_ENDED: &str = "Shift ended";

/// Close reason of connections closed by channel teardown
pub const CHANNEL_CLOSED: &str = "Channel closed";

// ----------------------------------------------------------------------------
// Channel Statistics
// ----------------------------------------------------------------------------

/// Point-in-time view of the channel's internal state
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChannelStats {
    /// Connections that joined the channel and have not left
    pub connections: usize,
    /// Whether a dial is in progress
    pub dialing: bool,
    /// Whether the consumer was told the channel is available
    pub available: bool,
    /// Consecutive failed dials
    pub retry_attempt: u32,
    pub deduplication: DeduplicationStats,
}

// ----------------------------------------------------------------------------
// Perpetual Channel
// ----------------------------------------------------------------------------

/// Cloneable handle to a perpetual channel
#[derive(Clone)]
pub struct PerpetualChannel {
    shared: Arc<ChannelShared>,
}

struct ChannelShared {
    id: ChannelId,
    name: Arc<str>,
    config: ChannelConfig,
    scheduler: Scheduler,
    transport: Arc<dyn Transport>,
    request_factory: RequestFactory,
    chain: HandlerChain,
    handler: Arc<dyn ChannelHandler>,
    main: SequentialWorker<ChannelCore>,
    send: SequentialWorker<()>,
    snapshot: watch::Sender<Arc<Vec<Connection>>>,
    closed: AtomicBool,
}

/// State owned by the main worker
#[derive(Default)]
struct ChannelCore {
    /// Joined connections, most recently opened last
    connections: Vec<Connection>,
    dialing: Option<Connection>,
    next_shift: Option<TimerHandle>,
    next_retry: Option<TimerHandle>,
    switches: Vec<TimerHandle>,
    retry_attempt: u32,
    deduplicator: MessageDeduplicator,
    available: bool,
    closed: bool,
}

impl ChannelCore {
    /// Joined connections plus the one being dialed
    fn alive(&self) -> usize {
        self.connections.len() + usize::from(self.dialing.is_some())
    }

    fn owns(&self, id: ConnectionId) -> bool {
        self.connections.iter().any(|connection| connection.id() == id)
    }
}

impl PerpetualChannel {
    /// Channel dialing the same request every time
    pub fn builder(request: DialRequest) -> ChannelBuilder {
        ChannelBuilder::new(Arc::new(move || request.clone()))
    }

    /// Channel asking `factory` for a fresh request on every dial
    pub fn builder_with<F>(factory: F) -> ChannelBuilder
    where
        F: Fn() -> DialRequest + Send + Sync + 'static,
    {
        ChannelBuilder::new(Arc::new(factory))
    }

    // ------------------------------------------------------------------------
    // Read-only views
    // ------------------------------------------------------------------------

    pub fn id(&self) -> ChannelId {
        self.shared.id
    }

    pub fn name(&self) -> &str {
        &self.shared.name
    }

    pub fn config(&self) -> &ChannelConfig {
        &self.shared.config
    }

    /// Snapshot of the joined connections, most recently opened last
    pub fn connections(&self) -> Arc<Vec<Connection>> {
        Arc::clone(&self.shared.snapshot.borrow())
    }

    /// Receiver following every change of the joined connections
    pub fn subscribe_connections(&self) -> watch::Receiver<Arc<Vec<Connection>>> {
        self.shared.snapshot.subscribe()
    }

    /// Whether any joined connection is connected
    pub fn is_connected(&self) -> bool {
        self.shared
            .snapshot
            .borrow()
            .iter()
            .any(Connection::is_connected)
    }

    pub fn is_closed(&self) -> bool {
        self.shared.closed.load(Ordering::Acquire)
    }

    /// Internal counters, read through the main worker
    pub fn stats(&self) -> BoxFuture<'static, SocketResult<ChannelStats>> {
        let task = self.shared.main.submit(|core: &mut ChannelCore| ChannelStats {
            connections: core.connections.len(),
            dialing: core.dialing.is_some(),
            available: core.available,
            retry_attempt: core.retry_attempt,
            deduplication: core.deduplicator.stats(),
        });
        async move { task.await.map_err(channel_worker_failure) }.boxed()
    }

    // ------------------------------------------------------------------------
    // Public operations
    // ------------------------------------------------------------------------

    /// Send a message on the most recently opened connected connection
    ///
    /// Fails immediately when nothing is connected. Otherwise the send is
    /// queued right away and retried under the channel's send retry policy.
    /// An attempt still waiting for a connection after `attempt_timeout`
    /// counts as failed and is abandoned.
    pub fn send_message(&self, message: impl Into<Message>) -> SendFuture {
        let message = message.into();
        if !self.is_connected() {
            return future::ready(Err(SocketError::illegal_state("Not connected"))).boxed();
        }

        let first = self.submit_send(message.clone());
        let this = self.clone();
        async move {
            let policy = this.shared.config.send_retry.clone();
            let mut outcome = first.await;
            let mut attempt = 0u32;
            loop {
                let err = match outcome {
                    Ok(()) => return Ok(()),
                    Err(err) => err,
                };

                attempt += 1;
                if attempt >= policy.max_attempts || this.is_closed() {
                    warn!(channel = %this.shared.name, channel_id = %this.shared.id, attempts = attempt, error = %err, "Send failed");
                    return Err(err);
                }

                let delay = policy.delay_for(attempt - 1);
                debug!(channel = %this.shared.name, channel_id = %this.shared.id, attempt, delay_ms = delay.as_millis() as u64, error = %err, "Retrying send");
                tokio::time::sleep(delay).await;
                outcome = this.submit_send(message.clone()).await;
            }
        }
        .boxed()
    }

    /// Tear the channel down; a no-op once closed
    pub fn close(&self) -> BoxFuture<'static, ()> {
        let this = self.clone();
        let task = self
            .shared
            .main
            .submit(move |core: &mut ChannelCore| this.teardown(core));
        async move {
            let _ = task.await;
        }
        .boxed()
    }

    // ------------------------------------------------------------------------
    // Proxy entry points
    // ------------------------------------------------------------------------

    fn connection_opened(&self, connection: Connection) {
        let this = self.clone();
        let _ = self
            .shared
            .main
            .submit(move |core: &mut ChannelCore| this.accept_opening(core, connection));
    }

    fn connection_closing(&self, id: ConnectionId) {
        let this = self.clone();
        let _ = self
            .shared
            .main
            .submit(move |core: &mut ChannelCore| this.accept_closing(core, id));
    }

    fn message_received(&self, origin: ConnectionId, frame: Frame) {
        let this = self.clone();
        let _ = self
            .shared
            .main
            .submit(move |core: &mut ChannelCore| this.accept_message(core, origin, frame));
    }

    fn submit_reconnect(&self) {
        let this = self.clone();
        let _ = self
            .shared
            .main
            .submit(move |core: &mut ChannelCore| this.reconnect(core));
    }

    fn submit_close_old(&self) {
        let this = self.clone();
        let _ = self
            .shared
            .main
            .submit(move |core: &mut ChannelCore| this.close_old_connections(core));
    }

    // ------------------------------------------------------------------------
    // Main worker tasks
    // ------------------------------------------------------------------------

    fn reconnect(&self, core: &mut ChannelCore) {
        if core.closed || core.dialing.is_some() {
            return;
        }

        cancel_timer(&mut core.next_shift);
        cancel_timer(&mut core.next_retry);

        let request = (self.shared.request_factory)();
        let connection = open_connection(
            &self.shared.scheduler,
            Arc::clone(&self.shared.transport),
            request,
            self.shared.name.to_string(),
            self.shared.config.connection.clone(),
            self.shared.chain.clone(),
        );
        debug!(channel = %self.shared.name, channel_id = %self.shared.id, connection = %connection.id(), "Dialing replacement");
        core.dialing = Some(connection.clone());

        let this = self.clone();
        self.shared.scheduler.spawn(async move {
            connection.wait_closed().await;
            let id = connection.id();
            let main = this.shared.main.clone();
            let _ = main.submit(move |core: &mut ChannelCore| this.connection_terminated(core, id));
        });
    }

    fn connection_terminated(&self, core: &mut ChannelCore, id: ConnectionId) {
        if core.closed {
            return;
        }

        let was_dialing = core
            .dialing
            .as_ref()
            .is_some_and(|connection| connection.id() == id);
        if !was_dialing {
            self.accept_closing(core, id);
            return;
        }

        core.dialing = None;
        if core.alive() <= 1 {
            core.deduplicator.reset();
        }

        let delay = self.shared.config.reconnect.delay_for(core.retry_attempt);
        core.retry_attempt = core.retry_attempt.saturating_add(1);
        warn!(channel = %self.shared.name, channel_id = %self.shared.id, connection = %id, attempt = core.retry_attempt, delay_ms = delay.as_millis() as u64, "Connection failed before joining, retrying");

        cancel_timer(&mut core.next_retry);
        let this = self.clone();
        core.next_retry = Some(
            self.shared
                .scheduler
                .schedule(delay, async move { this.submit_reconnect() }),
        );
    }

    fn accept_opening(&self, core: &mut ChannelCore, connection: Connection) {
        if core.closed {
            let _ = connection.close(CHANNEL_CLOSED, NORMAL_CLOSURE);
            return;
        }

        if core
            .dialing
            .as_ref()
            .is_some_and(|dialing| dialing.id() == connection.id())
        {
            core.dialing = None;
        }
        if core.owns(connection.id()) {
            return;
        }

        core.connections.push(connection.clone());
        core.retry_attempt = 0;
        cancel_timer(&mut core.next_retry);
        self.publish(core);

        cancel_timer(&mut core.next_shift);
        let this = self.clone();
        core.next_shift = Some(self.shared.scheduler.schedule(
            self.shared.config.shift_duration,
            async move { this.submit_reconnect() },
        ));

        core.switches.retain(|timer| !timer.is_finished());
        let this = self.clone();
        core.switches.push(self.shared.scheduler.schedule(
            self.shared.config.switch_duration,
            async move { this.submit_close_old() },
        ));

        info!(channel = %self.shared.name, channel_id = %self.shared.id, connection = %connection.id(), total = core.connections.len(), "Connection joined");

        if core.connections.len() == 1 {
            self.shared.send.enable(true);
        }

        if !core.available {
            core.available = true;
            let handler = Arc::clone(&self.shared.handler);
            let reply = guarded(&self.shared.name, self.shared.id, "on_available", || {
                handler.on_available(self)
            });
            self.reply(reply);
        }
    }

    fn close_old_connections(&self, core: &mut ChannelCore) {
        if core.closed {
            return;
        }

        let keep = core.connections.len().saturating_sub(1);
        for connection in &core.connections[..keep] {
            debug!(channel = %self.shared.name, channel_id = %self.shared.id, connection = %connection.id(), "Shift ended");
            let _ = connection.close(SHIFT_ENDED, NORMAL_CLOSURE);
        }
    }

    fn accept_closing(&self, core: &mut ChannelCore, id: ConnectionId) {
        if core.closed || !core.owns(id) {
            return;
        }

        let was_last = core.connections.last().map(Connection::id) == Some(id);
        core.connections.retain(|connection| connection.id() != id);
        self.publish(core);
        info!(channel = %self.shared.name, channel_id = %self.shared.id, connection = %id, total = core.connections.len(), "Connection left");

        if was_last {
            self.reconnect(core);
        }
        if core.alive() <= 1 {
            core.deduplicator.reset();
        }
        if core.connections.is_empty() {
            self.shared.send.enable(false);
            if core.available {
                core.available = false;
                warn!(channel = %self.shared.name, channel_id = %self.shared.id, "Channel unavailable");
                let handler = Arc::clone(&self.shared.handler);
                let _ = guarded(&self.shared.name, self.shared.id, "on_unavailable", || {
                    handler.on_unavailable(self)
                });
            }
        }
    }

    fn accept_message(&self, core: &mut ChannelCore, origin: ConnectionId, frame: Frame) {
        if core.closed {
            return;
        }
        if core.alive() > 1 && !core.deduplicator.accept(&frame, origin) {
            return;
        }

        let handler = Arc::clone(&self.shared.handler);
        let message = match handler.deserializer().deserialize(frame) {
            Ok(message) => message,
            Err(err) => {
                warn!(channel = %self.shared.name, channel_id = %self.shared.id, connection = %origin, error = %err, "Dropping undecodable message");
                return;
            }
        };

        let reply = guarded(&self.shared.name, self.shared.id, "on_message", || {
            handler.on_message(self, message)
        });
        self.reply(reply);
    }

    fn teardown(&self, core: &mut ChannelCore) {
        if core.closed {
            return;
        }
        core.closed = true;
        self.shared.closed.store(true, Ordering::Release);
        info!(channel = %self.shared.name, channel_id = %self.shared.id, "Closing channel");

        cancel_timer(&mut core.next_shift);
        cancel_timer(&mut core.next_retry);
        for timer in core.switches.drain(..) {
            timer.cancel();
        }

        let mut doomed = std::mem::take(&mut core.connections);
        doomed.extend(core.dialing.take());
        for connection in &doomed {
            let _ = connection.close(CHANNEL_CLOSED, NORMAL_CLOSURE);
        }
        self.publish(core);
        core.deduplicator.reset();
        self.shared.send.retire();

        if core.available {
            core.available = false;
            let handler = Arc::clone(&self.shared.handler);
            let _ = guarded(&self.shared.name, self.shared.id, "on_unavailable", || {
                handler.on_unavailable(self)
            });
        }
        self.shared.main.retire();
    }

    fn publish(&self, core: &ChannelCore) {
        self.shared
            .snapshot
            .send_replace(Arc::new(core.connections.clone()));
    }

    // ------------------------------------------------------------------------
    // Send worker tasks
    // ------------------------------------------------------------------------

    fn submit_send(&self, message: Message) -> impl std::future::Future<Output = SocketResult<()>> {
        let limit = self.shared.config.send_retry.attempt_timeout;
        let abandoned = Arc::new(AtomicBool::new(false));
        let this = self.clone();
        let flag = Arc::clone(&abandoned);
        let task = self
            .shared
            .send
            .submit_async(move |_: &mut ()| this.transmit(message, flag));

        async move {
            match tokio::time::timeout(limit, task).await {
                Ok(outcome) => outcome.map_err(channel_worker_failure)?,
                Err(_) => {
                    // The queued task must not send once the caller gave up on it
                    abandoned.store(true, Ordering::Release);
                    Err(SocketError::connection(format!(
                        "Send attempt timed out after {}ms",
                        limit.as_millis()
                    )))
                }
            }
        }
    }

    fn latest_connected(&self) -> Option<Connection> {
        self.shared
            .snapshot
            .borrow()
            .iter()
            .rev()
            .find(|connection| connection.is_connected())
            .cloned()
    }

    async fn transmit(self, message: Message, abandoned: Arc<AtomicBool>) -> SocketResult<()> {
        if abandoned.load(Ordering::Acquire) {
            return Err(SocketError::illegal_state("Send abandoned"));
        }
        let connection = self
            .latest_connected()
            .ok_or_else(|| SocketError::illegal_state("Not connected"))?;
        connection.send_message(message).await
    }

    fn reply(&self, reply: Option<Message>) {
        let Some(message) = reply else {
            return;
        };
        let sent = self.send_message(message);
        let name = Arc::clone(&self.shared.name);
        self.shared.scheduler.spawn(async move {
            if let Err(err) = sent.await {
                debug!(channel = %name, error = %err, "Reply not sent");
            }
        });
    }
}

fn channel_worker_failure(err: WorkerError) -> SocketError {
    match err {
        WorkerError::Retired => SocketError::closed(NORMAL_CLOSURE, CHANNEL_CLOSED),
        WorkerError::Panicked => SocketError::illegal_state(err.to_string()),
    }
}

impl fmt::Debug for PerpetualChannel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PerpetualChannel")
            .field("id", &self.shared.id)
            .field("name", &self.shared.name)
            .field("connections", &self.shared.snapshot.borrow().len())
            .field("closed", &self.is_closed())
            .finish()
    }
}

// ----------------------------------------------------------------------------
// Handler Proxy
// ----------------------------------------------------------------------------

/// Final stage of every channel connection, feeding events into the channel
struct ChannelProxy {
    channel: Weak<ChannelShared>,
    serializer: Arc<dyn Serializer>,
}

impl ChannelProxy {
    fn channel(&self) -> Option<PerpetualChannel> {
        self.channel
            .upgrade()
            .map(|shared| PerpetualChannel { shared })
    }
}

impl ConnectionHandler for ChannelProxy {
    fn on_available(&self, connection: &Connection) -> HandlerResult {
        if let Some(channel) = self.channel() {
            channel.connection_opened(connection.clone());
        }
        Ok(None)
    }

    fn on_message(&self, connection: &Connection, message: Message) -> HandlerResult {
        if let Some(channel) = self.channel() {
            channel.message_received(connection.id(), message.into_frame());
        }
        Ok(None)
    }

    fn on_unavailable(&self, connection: &Connection) -> HandlerResult {
        if connection.is_initialized() {
            if let Some(channel) = self.channel() {
                channel.connection_closing(connection.id());
            }
        }
        Ok(None)
    }

    fn serializer(&self) -> Arc<dyn Serializer> {
        Arc::clone(&self.serializer)
    }

    // Raw frames reach the channel so duplicates can be fingerprinted
    fn deserializer(&self) -> Arc<dyn Deserializer> {
        Arc::new(Passthrough)
    }
}

// ----------------------------------------------------------------------------
// Channel Builder
// ----------------------------------------------------------------------------

/// Configures and starts a perpetual channel
pub struct ChannelBuilder {
    request_factory: RequestFactory,
    config: ChannelConfig,
    initializers: Vec<Arc<dyn ConnectionHandler>>,
    handler: Option<Arc<dyn ChannelHandler>>,
}

impl ChannelBuilder {
    fn new(request_factory: RequestFactory) -> Self {
        Self {
            request_factory,
            config: ChannelConfig::default(),
            initializers: Vec::new(),
            handler: None,
        }
    }

    pub fn name(mut self, name: impl Into<String>) -> Self {
        self.config.name = name.into();
        self
    }

    pub fn config(mut self, config: ChannelConfig) -> Self {
        self.config = config;
        self
    }

    /// Append a stage every connection walks before joining the channel
    pub fn initializer(mut self, stage: Arc<dyn ConnectionHandler>) -> Self {
        self.initializers.push(stage);
        self
    }

    pub fn initializers(mut self, stages: Vec<Arc<dyn ConnectionHandler>>) -> Self {
        self.initializers = stages;
        self
    }

    /// Consumer of the channel
    pub fn handler(mut self, handler: Arc<dyn ChannelHandler>) -> Self {
        self.handler = Some(handler);
        self
    }

    /// Validate the configuration and dial the first connection
    pub fn build(
        self,
        scheduler: &Scheduler,
        transport: Arc<dyn Transport>,
    ) -> Result<PerpetualChannel, ConfigError> {
        self.config.validate()?;

        let handler = self.handler.unwrap_or_else(|| {
            let idle: Arc<dyn ChannelHandler> = HandlerBuilder::<PerpetualChannel>::new().build();
            idle
        });
        let id = ChannelId::next();
        let name: Arc<str> = Arc::from(self.config.name.as_str());
        let (snapshot, _) = watch::channel(Arc::new(Vec::new()));
        let initializers = self.initializers;
        let request_factory = self.request_factory;
        let config = self.config;

        let shared = Arc::new_cyclic(|channel: &Weak<ChannelShared>| {
            let proxy: Arc<dyn ConnectionHandler> = Arc::new(ChannelProxy {
                channel: channel.clone(),
                serializer: handler.serializer(),
            });
            let mut stages = initializers;
            stages.push(proxy);

            ChannelShared {
                id,
                main: SequentialWorker::new(
                    scheduler,
                    format!("{}-{}-main", name, id),
                    ChannelCore::default(),
                    true,
                ),
                send: SequentialWorker::new(scheduler, format!("{}-{}-send", name, id), (), false),
                name,
                config,
                scheduler: scheduler.clone(),
                transport,
                request_factory,
                chain: HandlerChain::new(stages),
                handler,
                snapshot,
                closed: AtomicBool::new(false),
            }
        });

        let channel = PerpetualChannel { shared };
        info!(channel = %channel.shared.name, channel_id = %channel.shared.id, "Channel started");
        channel.submit_reconnect();
        Ok(channel)
    }
}
