//! Mock Transport for Testing
//!
//! Provides a deterministic in-memory transport. Every dial is parked until
//! the test accepts or rejects it, which makes rotation, reconnection and
//! dial-failure scenarios fully scriptable. An accepted dial yields a
//! `MockPeer`, the server side of the link.

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use perpetual_core::{
    DialRequest, Frame, SocketError, SocketResult, Transport, TransportEvents, TransportLink,
};
use tokio::sync::{mpsc, oneshot, watch, Mutex};
use tracing::debug;

// ----------------------------------------------------------------------------
// Mock Transport Configuration
// ----------------------------------------------------------------------------

/// Configuration for mock transport behavior
#[derive(Debug, Clone)]
pub struct MockTransportConfig {
    /// Accept every dial without waiting for the test
    pub auto_accept: bool,
    /// Simulated time spent dialing before the dial is parked or accepted
    pub dial_latency: Duration,
    /// Whether new peers answer pings with a pong
    pub auto_pong: bool,
}

impl Default for MockTransportConfig {
    fn default() -> Self {
        Self {
            auto_accept: false,
            dial_latency: Duration::ZERO,
            auto_pong: true,
        }
    }
}

impl MockTransportConfig {
    /// Dials succeed immediately; peers are handed out through `next_peer`
    pub fn accepting() -> Self {
        Self {
            auto_accept: true,
            ..Self::default()
        }
    }

    /// Peers stay silent when pinged
    pub fn silent() -> Self {
        Self {
            auto_pong: false,
            ..Self::default()
        }
    }
}

// ----------------------------------------------------------------------------
// Mock Transport
// ----------------------------------------------------------------------------

/// Scriptable transport; clones share the same dial queue
#[derive(Clone)]
pub struct MockTransport {
    inner: Arc<TransportInner>,
}

struct TransportInner {
    config: MockTransportConfig,
    dial_tx: mpsc::UnboundedSender<PendingDial>,
    dial_rx: Mutex<mpsc::UnboundedReceiver<PendingDial>>,
    peer_tx: mpsc::UnboundedSender<MockPeer>,
    peer_rx: Mutex<mpsc::UnboundedReceiver<MockPeer>>,
    pending: AtomicUsize,
    max_pending: AtomicUsize,
    total_dials: AtomicUsize,
}

/// Statistics about dials seen by the transport
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct MockTransportStats {
    pub total_dials: usize,
    pub pending_dials: usize,
    pub max_concurrent_dials: usize,
}

impl Default for MockTransport {
    fn default() -> Self {
        Self::new(MockTransportConfig::default())
    }
}

impl MockTransport {
    pub fn new(config: MockTransportConfig) -> Self {
        let (dial_tx, dial_rx) = mpsc::unbounded_channel();
        let (peer_tx, peer_rx) = mpsc::unbounded_channel();
        Self {
            inner: Arc::new(TransportInner {
                config,
                dial_tx,
                dial_rx: Mutex::new(dial_rx),
                peer_tx,
                peer_rx: Mutex::new(peer_rx),
                pending: AtomicUsize::new(0),
                max_pending: AtomicUsize::new(0),
                total_dials: AtomicUsize::new(0),
            }),
        }
    }

    /// Dials wait for the test
    pub fn manual() -> Self {
        Self::new(MockTransportConfig::default())
    }

    /// Dials succeed immediately
    pub fn accepting() -> Self {
        Self::new(MockTransportConfig::accepting())
    }

    /// Shared handle usable by connections and channels
    pub fn handle(&self) -> Arc<dyn Transport> {
        Arc::new(self.clone())
    }

    /// Next parked dial, in dial order
    pub async fn next_dial(&self) -> Option<PendingDial> {
        self.inner.dial_rx.lock().await.recv().await
    }

    /// Next peer accepted automatically, in dial order
    pub async fn next_peer(&self) -> Option<MockPeer> {
        self.inner.peer_rx.lock().await.recv().await
    }

    pub fn stats(&self) -> MockTransportStats {
        MockTransportStats {
            total_dials: self.inner.total_dials.load(Ordering::SeqCst),
            pending_dials: self.inner.pending.load(Ordering::SeqCst),
            max_concurrent_dials: self.inner.max_pending.load(Ordering::SeqCst),
        }
    }
}

/// Decrements the pending dial count when a dial settles or is dropped
struct PendingGuard<'a>(&'a AtomicUsize);

impl Drop for PendingGuard<'_> {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

#[async_trait]
impl Transport for MockTransport {
    async fn dial(
        &self,
        request: &DialRequest,
        events: TransportEvents,
    ) -> SocketResult<Arc<dyn TransportLink>> {
        let inner = &self.inner;
        let dial_number = inner.total_dials.fetch_add(1, Ordering::SeqCst) + 1;
        let pending = inner.pending.fetch_add(1, Ordering::SeqCst) + 1;
        inner.max_pending.fetch_max(pending, Ordering::SeqCst);
        let _guard = PendingGuard(&inner.pending);
        debug!(dial = dial_number, address = %request.address, "Mock dial");

        if !inner.config.dial_latency.is_zero() {
            tokio::time::sleep(inner.config.dial_latency).await;
        }

        if inner.config.auto_accept {
            let peer = MockPeer::new(request.clone(), events, inner.config.auto_pong);
            let link = peer.link();
            let _ = inner.peer_tx.send(peer);
            return Ok(link);
        }

        let (responder, outcome) = oneshot::channel();
        inner
            .dial_tx
            .send(PendingDial {
                request: request.clone(),
                events,
                auto_pong: inner.config.auto_pong,
                responder,
            })
            .map_err(|_| SocketError::connection("Mock transport dropped"))?;

        outcome
            .await
            .unwrap_or_else(|_| Err(SocketError::connection("Dial abandoned")))
    }

    fn name(&self) -> &'static str {
        "mock"
    }
}

// ----------------------------------------------------------------------------
// Pending Dial
// ----------------------------------------------------------------------------

/// A dial parked until the test decides its outcome
pub struct PendingDial {
    request: DialRequest,
    events: TransportEvents,
    auto_pong: bool,
    responder: oneshot::Sender<SocketResult<Arc<dyn TransportLink>>>,
}

impl PendingDial {
    pub fn request(&self) -> &DialRequest {
        &self.request
    }

    /// Complete the dial and return the server side of the link
    pub fn accept(self) -> MockPeer {
        let peer = MockPeer::new(self.request, self.events, self.auto_pong);
        let _ = self.responder.send(Ok(peer.link()));
        peer
    }

    /// Fail the dial
    pub fn reject(self, reason: SocketError) {
        let _ = self.responder.send(Err(reason));
    }
}

impl std::fmt::Debug for PendingDial {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PendingDial")
            .field("request", &self.request)
            .finish()
    }
}

// ----------------------------------------------------------------------------
// Mock Peer
// ----------------------------------------------------------------------------

/// Server side of one mock link
#[derive(Clone)]
pub struct MockPeer {
    inner: Arc<PeerInner>,
}

struct PeerInner {
    request: DialRequest,
    events: TransportEvents,
    sent_tx: mpsc::UnboundedSender<Frame>,
    sent_rx: Mutex<mpsc::UnboundedReceiver<Frame>>,
    pings: AtomicUsize,
    auto_pong: AtomicBool,
    fail_sends: AtomicBool,
    client_close: watch::Sender<Option<(u16, String)>>,
}

impl MockPeer {
    fn new(request: DialRequest, events: TransportEvents, auto_pong: bool) -> Self {
        let (sent_tx, sent_rx) = mpsc::unbounded_channel();
        let (client_close, _) = watch::channel(None);
        Self {
            inner: Arc::new(PeerInner {
                request,
                events,
                sent_tx,
                sent_rx: Mutex::new(sent_rx),
                pings: AtomicUsize::new(0),
                auto_pong: AtomicBool::new(auto_pong),
                fail_sends: AtomicBool::new(false),
                client_close,
            }),
        }
    }

    fn link(&self) -> Arc<dyn TransportLink> {
        Arc::new(MockLink {
            peer: Arc::clone(&self.inner),
        })
    }

    /// Request the client dialed with
    pub fn request(&self) -> &DialRequest {
        &self.inner.request
    }

    // ------------------------------------------------------------------------
    // Server to client
    // ------------------------------------------------------------------------

    pub fn push_text(&self, text: impl Into<String>) {
        self.inner.events.on_text(text.into());
    }

    pub fn push_binary(&self, data: impl Into<Vec<u8>>) {
        self.inner.events.on_binary(data.into());
    }

    pub fn push_ping(&self) {
        self.inner.events.on_ping();
    }

    pub fn push_pong(&self) {
        self.inner.events.on_pong();
    }

    pub fn push_partial(&self) {
        self.inner.events.on_partial();
    }

    /// Close the link from the server side
    pub fn remote_close(&self, code: u16, reason: impl Into<String>) {
        self.inner.events.on_closed(code, reason);
    }

    /// Fail the link from the server side
    pub fn remote_error(&self, reason: impl Into<String>) {
        self.inner.events.on_error(reason);
    }

    // ------------------------------------------------------------------------
    // Client to server
    // ------------------------------------------------------------------------

    /// Next frame sent by the client
    pub async fn next_sent(&self) -> Option<Frame> {
        self.inner.sent_rx.lock().await.recv().await
    }

    /// Frames sent by the client and not yet consumed
    pub async fn drain_sent(&self) -> Vec<Frame> {
        let mut receiver = self.inner.sent_rx.lock().await;
        let mut frames = Vec::new();
        while let Ok(frame) = receiver.try_recv() {
            frames.push(frame);
        }
        frames
    }

    pub fn ping_count(&self) -> usize {
        self.inner.pings.load(Ordering::SeqCst)
    }

    /// Close code and reason sent by the client, if it closed the link
    pub fn client_close(&self) -> Option<(u16, String)> {
        self.inner.client_close.borrow().clone()
    }

    /// Wait until the client closes the link
    pub async fn wait_client_close(&self) -> (u16, String) {
        let mut receiver = self.inner.client_close.subscribe();
        loop {
            if let Some(close) = receiver.borrow_and_update().clone() {
                return close;
            }
            if receiver.changed().await.is_err() {
                return (0, String::new());
            }
        }
    }

    /// Make every following client send fail
    pub fn fail_sends(&self, fail: bool) {
        self.inner.fail_sends.store(fail, Ordering::SeqCst);
    }

    pub fn set_auto_pong(&self, enabled: bool) {
        self.inner.auto_pong.store(enabled, Ordering::SeqCst);
    }
}

impl std::fmt::Debug for MockPeer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MockPeer")
            .field("address", &self.inner.request.address)
            .field("pings", &self.ping_count())
            .field("client_close", &self.client_close())
            .finish()
    }
}

struct MockLink {
    peer: Arc<PeerInner>,
}

impl MockLink {
    fn deliver(&self, frame: Frame) -> SocketResult<()> {
        if self.peer.fail_sends.load(Ordering::SeqCst) {
            return Err(SocketError::connection("Injected send failure"));
        }
        if self.peer.client_close.borrow().is_some() {
            return Err(SocketError::connection("Link closed"));
        }
        self.peer
            .sent_tx
            .send(frame)
            .map_err(|_| SocketError::connection("Peer dropped"))
    }
}

#[async_trait]
impl TransportLink for MockLink {
    async fn send_text(&self, text: String) -> SocketResult<()> {
        self.deliver(Frame::Text(text))
    }

    async fn send_binary(&self, data: Vec<u8>) -> SocketResult<()> {
        self.deliver(Frame::Binary(data))
    }

    async fn ping(&self) -> SocketResult<()> {
        self.peer.pings.fetch_add(1, Ordering::SeqCst);
        if self.peer.auto_pong.load(Ordering::SeqCst) {
            self.peer.events.on_pong();
        }
        Ok(())
    }

    async fn close(&self, code: u16, reason: String) -> SocketResult<()> {
        self.peer.client_close.send_if_modified(|close| {
            if close.is_some() {
                return false;
            }
            *close = Some((code, reason));
            true
        });
        Ok(())
    }
}

// ----------------------------------------------------------------------------
// Tests
// ----------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_pending_dial_accept_and_reject() {
        let transport = MockTransport::manual();
        let handle = transport.handle();

        let dialer = tokio::spawn(async move {
            handle
                .dial(&DialRequest::new("mock://a"), TransportEvents::detached())
                .await
                .map(|_| ())
        });
        let dial = transport.next_dial().await.unwrap();
        assert_eq!(dial.request().address, "mock://a");
        assert_eq!(transport.stats().pending_dials, 1);
        let peer = dial.accept();
        assert!(dialer.await.unwrap().is_ok());
        assert_eq!(transport.stats().pending_dials, 0);
        assert!(peer.client_close().is_none());

        let handle = transport.handle();
        let dialer = tokio::spawn(async move {
            handle
                .dial(&DialRequest::new("mock://b"), TransportEvents::detached())
                .await
                .map(|_| ())
        });
        transport
            .next_dial()
            .await
            .unwrap()
            .reject(SocketError::connection("refused"));
        assert_eq!(
            dialer.await.unwrap(),
            Err(SocketError::connection("refused"))
        );
        assert_eq!(transport.stats().total_dials, 2);
        assert_eq!(transport.stats().max_concurrent_dials, 1);
    }

    #[tokio::test]
    async fn test_link_records_frames_and_close() {
        let transport = MockTransport::accepting();
        let link = transport
            .handle()
            .dial(&DialRequest::new("mock://c"), TransportEvents::detached())
            .await
            .unwrap();
        let peer = transport.next_peer().await.unwrap();

        link.send_text("hello".into()).await.unwrap();
        link.ping().await.unwrap();
        assert_eq!(peer.next_sent().await, Some(Frame::Text("hello".into())));
        assert_eq!(peer.ping_count(), 1);

        peer.fail_sends(true);
        assert!(link.send_binary(vec![1]).await.is_err());
        peer.fail_sends(false);

        link.close(1000, "bye".into()).await.unwrap();
        assert_eq!(peer.wait_client_close().await, (1000, "bye".to_string()));
        assert!(link.send_text("late".into()).await.is_err());
    }
}
