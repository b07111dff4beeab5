//! Perpetual Channels Core
//!
//! This crate provides resilient, perpetual duplex messaging over rotating
//! physical connections:
//! - `SequentialWorker`: single-logical-thread task queue, the only
//!   serialization mechanism for mutable state
//! - `Connection`: the state machine of one physical link, its liveness timers
//!   and its handler chain
//! - `MessageDeduplicator`: exactly-once delivery while connections overlap
//! - `PerpetualChannel`: a logical channel that rotates connections without
//!   ever appearing to disconnect
//!
//! The wire protocol lives behind the `Transport` trait; see the
//! `perpetual-tungstenite` crate for a WebSocket implementation.

// ----------------------------------------------------------------------------
// Module Declarations
// ----------------------------------------------------------------------------

pub mod channel;
pub mod collection;
pub mod config;
pub mod connection;
pub mod deduplication;
pub mod deferred;
pub mod errors;
pub mod handler;
pub mod message;
pub mod scheduler;
pub mod transport;
pub mod types;
pub mod worker;

// ----------------------------------------------------------------------------
// Public API
// ----------------------------------------------------------------------------

pub use channel::{ChannelBuilder, ChannelStats, PerpetualChannel, CHANNEL_CLOSED, SHIFT_ENDED};
pub use collection::ConnectionSet;
pub use config::{ChannelConfig, ConnectionConfig, ReconnectPolicy, SendRetryPolicy};
pub use connection::{Connection, ConnectionBuilder, ConnectionState, SendFuture};
pub use deduplication::{DeduplicationStats, Fingerprint, MessageDeduplicator};
pub use deferred::DeferredChannel;
pub use errors::{
    ConfigError, SocketError, SocketResult, WorkerError, END_OF_HANDLER_CHAIN, NORMAL_CLOSURE,
};
pub use handler::{
    ChannelHandler, ConnectionHandler, FnHandler, HandlerBuilder, HandlerChain, HandlerResult,
};
pub use message::{Deserializer, Frame, JsonCodec, Message, Passthrough, Serializer};
pub use scheduler::{Scheduler, TimerHandle};
pub use transport::{DialRequest, RequestFactory, Transport, TransportEvents, TransportLink};
pub use types::{ChannelId, ConnectionId};
pub use worker::{SequentialWorker, TaskFuture};
