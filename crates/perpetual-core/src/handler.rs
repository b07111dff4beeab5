//! Handler capabilities and handler chains
//!
//! A connection walks an ordered chain of `ConnectionHandler` stages (for
//! example: authenticate, subscribe, consume). A perpetual channel exposes a
//! single `ChannelHandler` to its consumer. Both can be written as trait impls
//! or assembled from closures with `HandlerBuilder`.
//!
//! Every callback may return a reply message which is sent back on the same
//! connection or channel. Errors and panics raised by callbacks are caught and
//! logged; they never reach the state machine.

use core::fmt;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::Arc;

use tracing::error;

use crate::channel::PerpetualChannel;
use crate::connection::Connection;
use crate::message::{Deserializer, JsonCodec, Message, Passthrough, Serializer};

/// Callback outcome: an optional reply, or an error to be logged
pub type HandlerResult = anyhow::Result<Option<Message>>;

// ----------------------------------------------------------------------------
// Handler Traits
// ----------------------------------------------------------------------------

/// One stage of a connection's handler chain
pub trait ConnectionHandler: Send + Sync {
    /// The connection reached this stage while open
    fn on_available(&self, connection: &Connection) -> HandlerResult {
        let _ = connection;
        Ok(None)
    }

    /// A message arrived while the connection is at this stage
    fn on_message(&self, connection: &Connection, message: Message) -> HandlerResult {
        let _ = (connection, message);
        Ok(None)
    }

    /// The connection left this stage or closed
    fn on_unavailable(&self, connection: &Connection) -> HandlerResult {
        let _ = connection;
        Ok(None)
    }

    /// Serializer applied to structured outbound messages at this stage
    fn serializer(&self) -> Arc<dyn Serializer> {
        Arc::new(Passthrough)
    }

    /// Deserializer applied to inbound frames at this stage
    fn deserializer(&self) -> Arc<dyn Deserializer> {
        Arc::new(Passthrough)
    }
}

/// Consumer of a perpetual channel
pub trait ChannelHandler: Send + Sync {
    /// The channel gained its first live connection
    fn on_available(&self, channel: &PerpetualChannel) -> HandlerResult {
        let _ = channel;
        Ok(None)
    }

    /// A deduplicated message arrived on the channel
    fn on_message(&self, channel: &PerpetualChannel, message: Message) -> HandlerResult {
        let _ = (channel, message);
        Ok(None)
    }

    /// The channel lost every connection or was closed
    fn on_unavailable(&self, channel: &PerpetualChannel) -> HandlerResult {
        let _ = channel;
        Ok(None)
    }

    fn serializer(&self) -> Arc<dyn Serializer> {
        Arc::new(Passthrough)
    }

    fn deserializer(&self) -> Arc<dyn Deserializer> {
        Arc::new(Passthrough)
    }
}

// ----------------------------------------------------------------------------
// Closure Handlers
// ----------------------------------------------------------------------------

type EventCallback<T> = Box<dyn Fn(&T) -> HandlerResult + Send + Sync>;
type MessageCallback<T> = Box<dyn Fn(&T, Message) -> HandlerResult + Send + Sync>;

/// Handler assembled from closures, for either connections or channels
pub struct FnHandler<T> {
    on_available: Option<EventCallback<T>>,
    on_message: Option<MessageCallback<T>>,
    on_unavailable: Option<EventCallback<T>>,
    serializer: Arc<dyn Serializer>,
    deserializer: Arc<dyn Deserializer>,
}

impl<T> FnHandler<T> {
    fn available(&self, target: &T) -> HandlerResult {
        match &self.on_available {
            Some(callback) => callback(target),
            None => Ok(None),
        }
    }

    fn message(&self, target: &T, message: Message) -> HandlerResult {
        match &self.on_message {
            Some(callback) => callback(target, message),
            None => Ok(None),
        }
    }

    fn unavailable(&self, target: &T) -> HandlerResult {
        match &self.on_unavailable {
            Some(callback) => callback(target),
            None => Ok(None),
        }
    }
}

impl<T> fmt::Debug for FnHandler<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FnHandler")
            .field("on_available", &self.on_available.is_some())
            .field("on_message", &self.on_message.is_some())
            .field("on_unavailable", &self.on_unavailable.is_some())
            .finish()
    }
}

impl ConnectionHandler for FnHandler<Connection> {
    fn on_available(&self, connection: &Connection) -> HandlerResult {
        self.available(connection)
    }

    fn on_message(&self, connection: &Connection, message: Message) -> HandlerResult {
        self.message(connection, message)
    }

    fn on_unavailable(&self, connection: &Connection) -> HandlerResult {
        self.unavailable(connection)
    }

    fn serializer(&self) -> Arc<dyn Serializer> {
        Arc::clone(&self.serializer)
    }

    fn deserializer(&self) -> Arc<dyn Deserializer> {
        Arc::clone(&self.deserializer)
    }
}

impl ChannelHandler for FnHandler<PerpetualChannel> {
    fn on_available(&self, channel: &PerpetualChannel) -> HandlerResult {
        self.available(channel)
    }

    fn on_message(&self, channel: &PerpetualChannel, message: Message) -> HandlerResult {
        self.message(channel, message)
    }

    fn on_unavailable(&self, channel: &PerpetualChannel) -> HandlerResult {
        self.unavailable(channel)
    }

    fn serializer(&self) -> Arc<dyn Serializer> {
        Arc::clone(&self.serializer)
    }

    fn deserializer(&self) -> Arc<dyn Deserializer> {
        Arc::clone(&self.deserializer)
    }
}

/// Builder for closure-based handlers
///
/// ```ignore
/// let consumer = HandlerBuilder::<PerpetualChannel>::new()
///     .json()
///     .on_message(|_, message| {
///         println!("{:?}", message);
///         Ok(None)
///     })
///     .build();
/// ```
pub struct HandlerBuilder<T> {
    handler: FnHandler<T>,
}

impl<T> Default for HandlerBuilder<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> HandlerBuilder<T> {
    pub fn new() -> Self {
        Self {
            handler: FnHandler {
                on_available: None,
                on_message: None,
                on_unavailable: None,
                serializer: Arc::new(Passthrough),
                deserializer: Arc::new(Passthrough),
            },
        }
    }

    pub fn on_available<F>(mut self, callback: F) -> Self
    where
        F: Fn(&T) -> HandlerResult + Send + Sync + 'static,
    {
        self.handler.on_available = Some(Box::new(callback));
        self
    }

    pub fn on_message<F>(mut self, callback: F) -> Self
    where
        F: Fn(&T, Message) -> HandlerResult + Send + Sync + 'static,
    {
        self.handler.on_message = Some(Box::new(callback));
        self
    }

    pub fn on_unavailable<F>(mut self, callback: F) -> Self
    where
        F: Fn(&T) -> HandlerResult + Send + Sync + 'static,
    {
        self.handler.on_unavailable = Some(Box::new(callback));
        self
    }

    pub fn serializer(mut self, serializer: Arc<dyn Serializer>) -> Self {
        self.handler.serializer = serializer;
        self
    }

    pub fn deserializer(mut self, deserializer: Arc<dyn Deserializer>) -> Self {
        self.handler.deserializer = deserializer;
        self
    }

    /// Use the JSON codec in both directions
    pub fn json(self) -> Self {
        self.serializer(Arc::new(JsonCodec))
            .deserializer(Arc::new(JsonCodec))
    }

    pub fn build(self) -> Arc<FnHandler<T>> {
        Arc::new(self.handler)
    }
}

// ----------------------------------------------------------------------------
// Handler Chain
// ----------------------------------------------------------------------------

/// Ordered, immutable list of connection stages
#[derive(Clone)]
pub struct HandlerChain {
    stages: Arc<[Arc<dyn ConnectionHandler>]>,
}

impl HandlerChain {
    /// Build a chain; an empty list yields a single no-op stage
    pub fn new(stages: Vec<Arc<dyn ConnectionHandler>>) -> Self {
        let stages = if stages.is_empty() {
            vec![HandlerBuilder::<Connection>::new().build() as Arc<dyn ConnectionHandler>]
        } else {
            stages
        };
        Self {
            stages: stages.into(),
        }
    }

    /// Chain with a single stage
    pub fn single(stage: Arc<dyn ConnectionHandler>) -> Self {
        Self::new(vec![stage])
    }

    pub fn len(&self) -> usize {
        self.stages.len()
    }

    /// Always false, a chain holds at least one stage
    pub fn is_empty(&self) -> bool {
        self.stages.is_empty()
    }

    /// Stage at `index`, clamped to the final stage
    pub fn stage(&self, index: usize) -> &Arc<dyn ConnectionHandler> {
        let last = self.stages.len() - 1;
        &self.stages[index.min(last)]
    }

    /// Whether `index` designates the final stage
    pub fn is_final(&self, index: usize) -> bool {
        index + 1 >= self.stages.len()
    }

    /// Whether two positions hold the very same stage instance
    pub fn same_stage(&self, a: usize, b: usize) -> bool {
        Arc::ptr_eq(self.stage(a), self.stage(b))
    }
}

impl fmt::Debug for HandlerChain {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HandlerChain")
            .field("stages", &self.stages.len())
            .finish()
    }
}

// ----------------------------------------------------------------------------
// Guarded Invocation
// ----------------------------------------------------------------------------

/// Run a handler callback, swallowing and logging errors and panics
pub(crate) fn guarded<F>(name: &str, id: impl fmt::Display, event: &'static str, call: F) -> Option<Message>
where
    F: FnOnce() -> HandlerResult,
{
    match catch_unwind(AssertUnwindSafe(call)) {
        Ok(Ok(reply)) => reply,
        Ok(Err(err)) => {
            error!(name = %name, id = %id, handler_event = event, error = %err, "A handler error occurred");
            None
        }
        Err(_) => {
            error!(name = %name, id = %id, handler_event = event, "A handler panicked");
            None
        }
    }
}

// ----------------------------------------------------------------------------
// Tests
// ----------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    struct Marker;
    impl ConnectionHandler for Marker {}

    #[test]
    fn test_chain_positions() {
        let a: Arc<dyn ConnectionHandler> = Arc::new(Marker);
        let b: Arc<dyn ConnectionHandler> = Arc::new(Marker);
        let chain = HandlerChain::new(vec![a.clone(), a, b]);

        assert_eq!(chain.len(), 3);
        assert!(chain.same_stage(0, 1));
        assert!(!chain.same_stage(1, 2));
        assert!(!chain.is_final(1));
        assert!(chain.is_final(2));
        assert!(Arc::ptr_eq(chain.stage(10), chain.stage(2)));
    }

    #[test]
    fn test_empty_chain_gets_noop_stage() {
        let chain = HandlerChain::new(Vec::new());
        assert_eq!(chain.len(), 1);
        assert!(chain.is_final(0));
    }

    #[test]
    fn test_guarded_swallows_errors_and_panics() {
        let reply = guarded("test", 1, "on_message", || Ok(Some(Message::from("pong"))));
        assert_eq!(reply, Some(Message::Text("pong".into())));

        let reply = guarded("test", 1, "on_message", || Err(anyhow::anyhow!("bad payload")));
        assert_eq!(reply, None);

        let reply = guarded("test", 1, "on_message", || -> HandlerResult { panic!("boom") });
        assert_eq!(reply, None);
    }

    #[test]
    fn test_builder_json_codec() {
        let handler = HandlerBuilder::<Connection>::new().json().build();
        let frame = ConnectionHandler::serializer(&*handler)
            .serialize(Message::Json(serde_json::json!({"op": "ping"})))
            .unwrap();
        assert_eq!(frame, crate::message::Frame::Text(r#"{"op":"ping"}"#.into()));
    }
}
