//! Recording handlers
//!
//! `RecordingHandler` implements both handler capabilities and pushes every
//! callback into an async queue, so tests can assert on the exact sequence of
//! events a connection stage or a channel consumer observed.

use std::sync::Arc;
use std::time::Duration;

use perpetual_core::{
    ChannelHandler, Connection, ConnectionHandler, Deserializer, HandlerResult, JsonCodec,
    Message, Passthrough, PerpetualChannel, Serializer,
};
use tokio::sync::mpsc;

/// Default bound used by the waiting helpers
pub const DEFAULT_WAIT: Duration = Duration::from_secs(30);

/// One observed callback; the id is the connection or channel id
#[derive(Debug, Clone, PartialEq)]
pub enum Recorded {
    Available(u64),
    Message(u64, Message),
    Unavailable(u64),
}

impl Recorded {
    /// Message payload, if this is a message event
    pub fn message(&self) -> Option<&Message> {
        match self {
            Recorded::Message(_, message) => Some(message),
            _ => None,
        }
    }
}

/// Handler recording every callback it receives
pub struct RecordingHandler {
    events: mpsc::UnboundedSender<Recorded>,
    serializer: Arc<dyn Serializer>,
    deserializer: Arc<dyn Deserializer>,
}

impl RecordingHandler {
    /// Passthrough handler and the queue of its events
    pub fn new() -> (Arc<Self>, Recording) {
        Self::with_codec(Arc::new(Passthrough), Arc::new(Passthrough))
    }

    /// Handler using the JSON codec
    pub fn json() -> (Arc<Self>, Recording) {
        Self::with_codec(Arc::new(JsonCodec), Arc::new(JsonCodec))
    }

    pub fn with_codec(
        serializer: Arc<dyn Serializer>,
        deserializer: Arc<dyn Deserializer>,
    ) -> (Arc<Self>, Recording) {
        let (events, receiver) = mpsc::unbounded_channel();
        let handler = Arc::new(Self {
            events,
            serializer,
            deserializer,
        });
        (handler, Recording { receiver })
    }

    fn record(&self, event: Recorded) -> HandlerResult {
        let _ = self.events.send(event);
        Ok(None)
    }
}

impl ConnectionHandler for RecordingHandler {
    fn on_available(&self, connection: &Connection) -> HandlerResult {
        self.record(Recorded::Available(connection.id().as_u64()))
    }

    fn on_message(&self, connection: &Connection, message: Message) -> HandlerResult {
        self.record(Recorded::Message(connection.id().as_u64(), message))
    }

    fn on_unavailable(&self, connection: &Connection) -> HandlerResult {
        self.record(Recorded::Unavailable(connection.id().as_u64()))
    }

    fn serializer(&self) -> Arc<dyn Serializer> {
        Arc::clone(&self.serializer)
    }

    fn deserializer(&self) -> Arc<dyn Deserializer> {
        Arc::clone(&self.deserializer)
    }
}

impl ChannelHandler for RecordingHandler {
    fn on_available(&self, channel: &PerpetualChannel) -> HandlerResult {
        self.record(Recorded::Available(channel.id().as_u64()))
    }

    fn on_message(&self, channel: &PerpetualChannel, message: Message) -> HandlerResult {
        self.record(Recorded::Message(channel.id().as_u64(), message))
    }

    fn on_unavailable(&self, channel: &PerpetualChannel) -> HandlerResult {
        self.record(Recorded::Unavailable(channel.id().as_u64()))
    }

    fn serializer(&self) -> Arc<dyn Serializer> {
        Arc::clone(&self.serializer)
    }

    fn deserializer(&self) -> Arc<dyn Deserializer> {
        Arc::clone(&self.deserializer)
    }
}

/// Receiving end of a `RecordingHandler`
pub struct Recording {
    receiver: mpsc::UnboundedReceiver<Recorded>,
}

impl Recording {
    /// Next event, waiting at most `DEFAULT_WAIT`
    pub async fn next(&mut self) -> Option<Recorded> {
        self.next_within(DEFAULT_WAIT).await
    }

    /// Next event, waiting at most `wait`
    pub async fn next_within(&mut self, wait: Duration) -> Option<Recorded> {
        tokio::time::timeout(wait, self.receiver.recv())
            .await
            .ok()
            .flatten()
    }

    /// Events already recorded
    pub fn drain(&mut self) -> Vec<Recorded> {
        let mut events = Vec::new();
        while let Ok(event) = self.receiver.try_recv() {
            events.push(event);
        }
        events
    }
}
