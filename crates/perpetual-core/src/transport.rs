//! Transport abstraction
//!
//! The core never speaks a wire protocol itself. A `Transport` dials a
//! `DialRequest` and hands back a `TransportLink` for outbound traffic;
//! inbound traffic and link failures are reported through the
//! `TransportEvents` handle passed into the dial. Frames reported to the core
//! are already reassembled; fragments only count as liveness.

use std::sync::{Arc, Weak};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::connection::{Connection, ConnectionShared};
use crate::errors::{ConfigError, SocketError, SocketResult};
use crate::message::Frame;

// ----------------------------------------------------------------------------
// Dial Request
// ----------------------------------------------------------------------------

/// Target address and request headers of one dial
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DialRequest {
    pub address: String,
    pub headers: Vec<(String, String)>,
}

impl DialRequest {
    pub fn new(address: impl Into<String>) -> Self {
        Self {
            address: address.into(),
            headers: Vec::new(),
        }
    }

    /// Builder-style header addition
    pub fn header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.push((name.into(), value.into()));
        self
    }

    /// First value of a header, case-insensitive
    pub fn header_value(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(key, _)| key.eq_ignore_ascii_case(name))
            .map(|(_, value)| value.as_str())
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.address.trim().is_empty() {
            return Err(ConfigError::InvalidAddress("address is empty".to_string()));
        }
        Ok(())
    }
}

/// Produces a fresh request for every dial of a channel
pub type RequestFactory = Arc<dyn Fn() -> DialRequest + Send + Sync>;

// ----------------------------------------------------------------------------
// Transport Traits
// ----------------------------------------------------------------------------

/// Dials physical connections
#[async_trait]
pub trait Transport: Send + Sync {
    /// Open a link; inbound traffic is reported through `events`
    async fn dial(
        &self,
        request: &DialRequest,
        events: TransportEvents,
    ) -> SocketResult<Arc<dyn TransportLink>>;

    /// Short name used in logs
    fn name(&self) -> &'static str {
        "transport"
    }
}

/// Outbound half of an open physical connection
#[async_trait]
pub trait TransportLink: Send + Sync {
    async fn send_text(&self, text: String) -> SocketResult<()>;

    async fn send_binary(&self, data: Vec<u8>) -> SocketResult<()>;

    async fn ping(&self) -> SocketResult<()>;

    /// Close the link with a close code and reason
    async fn close(&self, code: u16, reason: String) -> SocketResult<()>;
}

// ----------------------------------------------------------------------------
// Transport Events
// ----------------------------------------------------------------------------

/// Non-owning handle through which a transport reports inbound events
///
/// Events reported after the connection is gone are ignored.
#[derive(Clone)]
pub struct TransportEvents {
    target: Weak<ConnectionShared>,
}

impl TransportEvents {
    pub(crate) fn new(target: Weak<ConnectionShared>) -> Self {
        Self { target }
    }

    /// Handle attached to nothing; every event is dropped
    pub fn detached() -> Self {
        Self { target: Weak::new() }
    }

    /// Whether the owning connection still exists
    pub fn is_attached(&self) -> bool {
        self.target.strong_count() > 0
    }

    fn connection(&self) -> Option<Connection> {
        self.target.upgrade().map(Connection::from_shared)
    }

    /// A complete text frame arrived
    pub fn on_text(&self, text: String) {
        self.on_frame(Frame::Text(text));
    }

    /// A complete binary frame arrived
    pub fn on_binary(&self, data: Vec<u8>) {
        self.on_frame(Frame::Binary(data));
    }

    pub fn on_frame(&self, frame: Frame) {
        if let Some(connection) = self.connection() {
            connection.data_received();
            connection.accept_frame(frame);
        }
    }

    pub fn on_ping(&self) {
        self.on_activity();
    }

    pub fn on_pong(&self) {
        self.on_activity();
    }

    /// Part of a fragmented frame arrived
    pub fn on_partial(&self) {
        self.on_activity();
    }

    fn on_activity(&self) {
        if let Some(connection) = self.connection() {
            connection.data_received();
        }
    }

    /// The link failed
    pub fn on_error(&self, reason: impl Into<String>) {
        if let Some(connection) = self.connection() {
            connection.fail(SocketError::connection(reason));
        }
    }

    /// The remote side closed the link
    pub fn on_closed(&self, code: u16, reason: impl Into<String>) {
        if let Some(connection) = self.connection() {
            connection.fail(SocketError::closed(code, reason));
        }
    }
}

impl std::fmt::Debug for TransportEvents {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TransportEvents")
            .field("attached", &self.is_attached())
            .finish()
    }
}
