//! WebSocket transport for perpetual channels
//!
//! This crate implements the `Transport` trait from `perpetual-core` on top of
//! `tokio-tungstenite`. Each dial performs one WebSocket handshake; the write
//! half becomes the `TransportLink` and a reader task forwards every inbound
//! frame to the connection's `TransportEvents`. Reader tasks run on the
//! `Scheduler` the transport was created with.
//!
//! Secure (`wss://`) addresses require the `tls` feature.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures::stream::{SplitSink, SplitStream};
use futures::{SinkExt, StreamExt};
use perpetual_core::{
    DialRequest, Scheduler, SocketError, SocketResult, Transport, TransportEvents, TransportLink,
};
use tokio::net::TcpStream;
use tokio::sync::Mutex;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::handshake::client::Request;
use tokio_tungstenite::tungstenite::http::{HeaderName, HeaderValue};
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_tungstenite::tungstenite::protocol::{CloseFrame, WebSocketConfig};
use tokio_tungstenite::tungstenite::{Error as WsError, Message as WsMessage};
use tokio_tungstenite::{connect_async_with_config, MaybeTlsStream, WebSocketStream};
use tracing::{debug, trace, warn};
use url::Url;

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// Close code reported when the stream ends without a close frame
const ABNORMAL_CLOSURE: u16 = 1006;

/// Close code reported when the peer's close frame carries no status
const NO_STATUS_RECEIVED: u16 = 1005;

// ----------------------------------------------------------------------------
// WebSocket Configuration
// ----------------------------------------------------------------------------

/// Configuration for the WebSocket transport
#[derive(Debug, Clone)]
pub struct TungsteniteConfig {
    /// Upper bound for TCP connect plus the WebSocket handshake
    pub connection_timeout: Duration,
    /// Largest inbound message accepted (None = tungstenite default)
    pub max_message_size: Option<usize>,
    /// Disable Nagle's algorithm on the socket
    pub disable_nagle: bool,
}

impl Default for TungsteniteConfig {
    fn default() -> Self {
        Self {
            connection_timeout: Duration::from_secs(10),
            max_message_size: None,
            disable_nagle: true,
        }
    }
}

// ----------------------------------------------------------------------------
// WebSocket Transport
// ----------------------------------------------------------------------------

/// Dials `ws://` and `wss://` addresses
#[derive(Debug, Clone)]
pub struct TungsteniteTransport {
    config: TungsteniteConfig,
    scheduler: Scheduler,
}

impl TungsteniteTransport {
    pub fn new(config: TungsteniteConfig, scheduler: &Scheduler) -> Self {
        Self {
            config,
            scheduler: scheduler.clone(),
        }
    }

    pub fn config(&self) -> &TungsteniteConfig {
        &self.config
    }

    fn websocket_config(&self) -> WebSocketConfig {
        let mut config = WebSocketConfig::default();
        if self.config.max_message_size.is_some() {
            config.max_message_size = self.config.max_message_size;
        }
        config
    }
}

#[async_trait]
impl Transport for TungsteniteTransport {
    async fn dial(
        &self,
        request: &DialRequest,
        events: TransportEvents,
    ) -> SocketResult<Arc<dyn TransportLink>> {
        let client_request = client_request(request)?;
        debug!(address = %request.address, headers = request.headers.len(), "Connecting WebSocket");

        let handshake = connect_async_with_config(
            client_request,
            Some(self.websocket_config()),
            self.config.disable_nagle,
        );
        let (stream, response) = tokio::time::timeout(self.config.connection_timeout, handshake)
            .await
            .map_err(|_| {
                SocketError::connection(format!(
                    "Connect to {} timed out after {:?}",
                    request.address, self.config.connection_timeout
                ))
            })?
            .map_err(websocket_error)?;
        debug!(address = %request.address, status = %response.status(), "WebSocket connected");

        let (sink, stream) = stream.split();
        self.scheduler
            .spawn(read_frames(stream, events, request.address.clone()));

        Ok(Arc::new(TungsteniteLink {
            sink: Mutex::new(sink),
        }))
    }

    fn name(&self) -> &'static str {
        "websocket"
    }
}

/// Turn a dial request into a handshake request carrying its headers
fn client_request(request: &DialRequest) -> SocketResult<Request> {
    let url = Url::parse(&request.address).map_err(|err| {
        SocketError::connection(format!("Invalid address {}: {}", request.address, err))
    })?;
    match url.scheme() {
        "ws" => {}
        "wss" if cfg!(feature = "tls") => {}
        "wss" => {
            return Err(SocketError::connection(format!(
                "Secure address {} requires the tls feature",
                request.address
            )))
        }
        other => {
            return Err(SocketError::connection(format!(
                "Unsupported scheme {} in {}",
                other, request.address
            )))
        }
    }

    let mut client_request = url.as_str().into_client_request().map_err(websocket_error)?;
    let headers = client_request.headers_mut();
    for (name, value) in &request.headers {
        let header = HeaderName::from_bytes(name.as_bytes())
            .map_err(|err| SocketError::connection(format!("Invalid header {}: {}", name, err)))?;
        let value = HeaderValue::from_str(value)
            .map_err(|err| SocketError::connection(format!("Invalid value for {}: {}", name, err)))?;
        headers.append(header, value);
    }
    Ok(client_request)
}

fn websocket_error(err: WsError) -> SocketError {
    match err {
        WsError::ConnectionClosed | WsError::AlreadyClosed => SocketError::connection("Link closed"),
        WsError::Io(err) => SocketError::from(err),
        other => SocketError::connection(other.to_string()),
    }
}

// ----------------------------------------------------------------------------
// Reader Task
// ----------------------------------------------------------------------------

async fn read_frames(mut stream: SplitStream<WsStream>, events: TransportEvents, address: String) {
    while let Some(frame) = stream.next().await {
        match frame {
            Ok(WsMessage::Text(text)) => events.on_text(text),
            Ok(WsMessage::Binary(data)) => events.on_binary(data),
            Ok(WsMessage::Ping(_)) => events.on_ping(),
            Ok(WsMessage::Pong(_)) => events.on_pong(),
            Ok(WsMessage::Frame(_)) => events.on_partial(),
            Ok(WsMessage::Close(frame)) => {
                let (code, reason) = frame
                    .map(|frame| (u16::from(frame.code), frame.reason.into_owned()))
                    .unwrap_or((NO_STATUS_RECEIVED, String::new()));
                debug!(address = %address, code, reason = %reason, "WebSocket closed by peer");
                events.on_closed(code, reason);
                return;
            }
            Err(err) => {
                warn!(address = %address, error = %err, "WebSocket read failed");
                events.on_error(err.to_string());
                return;
            }
        }
    }

    trace!(address = %address, "WebSocket stream ended");
    events.on_closed(ABNORMAL_CLOSURE, "Stream ended");
}

// ----------------------------------------------------------------------------
// Link
// ----------------------------------------------------------------------------

struct TungsteniteLink {
    sink: Mutex<SplitSink<WsStream, WsMessage>>,
}

impl TungsteniteLink {
    async fn write(&self, message: WsMessage) -> Result<(), WsError> {
        self.sink.lock().await.send(message).await
    }
}

#[async_trait]
impl TransportLink for TungsteniteLink {
    async fn send_text(&self, text: String) -> SocketResult<()> {
        self.write(WsMessage::Text(text))
            .await
            .map_err(websocket_error)
    }

    async fn send_binary(&self, data: Vec<u8>) -> SocketResult<()> {
        self.write(WsMessage::Binary(data))
            .await
            .map_err(websocket_error)
    }

    async fn ping(&self) -> SocketResult<()> {
        self.write(WsMessage::Ping(Vec::new()))
            .await
            .map_err(websocket_error)
    }

    async fn close(&self, code: u16, reason: String) -> SocketResult<()> {
        let frame = CloseFrame {
            code: CloseCode::from(code),
            reason: reason.into(),
        };
        match self.write(WsMessage::Close(Some(frame))).await {
            // The peer closed first
            Ok(()) | Err(WsError::ConnectionClosed | WsError::AlreadyClosed) => Ok(()),
            Err(err) => Err(websocket_error(err)),
        }
    }
}

// ----------------------------------------------------------------------------
// Tests
// ----------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use perpetual_core::{Connection, ConnectionHandler, HandlerBuilder, Message, Scheduler};
    use tokio::net::TcpListener;
    use tokio::sync::{mpsc, oneshot};
    use tokio_tungstenite::tungstenite::handshake::server::{
        ErrorResponse, Request as ServerRequest, Response,
    };

    /// Echo server recording the value of `x-token` from the handshake
    async fn echo_server() -> (String, oneshot::Receiver<Option<String>>) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let address = format!("ws://{}", listener.local_addr().unwrap());
        let (token_tx, token_rx) = oneshot::channel();

        tokio::spawn(async move {
            let (tcp, _) = listener.accept().await.unwrap();
            let callback = move |request: &ServerRequest,
                                 response: Response|
                  -> Result<Response, ErrorResponse> {
                let token = request
                    .headers()
                    .get("x-token")
                    .and_then(|value| value.to_str().ok())
                    .map(str::to_string);
                let _ = token_tx.send(token);
                Ok(response)
            };
            let mut ws = tokio_tungstenite::accept_hdr_async(tcp, callback)
                .await
                .unwrap();
            while let Some(Ok(message)) = ws.next().await {
                if message.is_text() || message.is_binary() {
                    if ws.send(message).await.is_err() {
                        break;
                    }
                }
            }
        });

        (address, token_rx)
    }

    #[test]
    fn test_client_request_carries_headers() {
        let request = DialRequest::new("ws://localhost:9000/feed")
            .header("Authorization", "Bearer abc")
            .header("X-Session", "7");
        let built = client_request(&request).unwrap();
        assert_eq!(built.uri().path(), "/feed");
        assert_eq!(built.headers()["authorization"], "Bearer abc");
        assert_eq!(built.headers()["x-session"], "7");
    }

    #[test]
    fn test_client_request_rejects_bad_addresses() {
        assert!(client_request(&DialRequest::new("not a url")).is_err());
        assert!(client_request(&DialRequest::new("http://localhost/feed")).is_err());

        let bad_header = DialRequest::new("ws://localhost/feed").header("bad header", "x");
        assert!(client_request(&bad_header).is_err());
    }

    #[cfg(not(feature = "tls"))]
    #[test]
    fn test_secure_address_requires_tls_feature() {
        let result = client_request(&DialRequest::new("wss://localhost/feed"));
        assert_eq!(
            result.err(),
            Some(SocketError::connection(
                "Secure address wss://localhost/feed requires the tls feature"
            ))
        );
    }

    #[cfg(feature = "tls")]
    #[test]
    fn test_secure_address_accepted_with_tls_feature() {
        assert!(client_request(&DialRequest::new("wss://localhost/feed")).is_ok());
    }

    #[tokio::test]
    async fn test_dial_refused_is_a_connection_error() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let address = format!("ws://{}", listener.local_addr().unwrap());
        drop(listener);

        let result = TungsteniteTransport::new(TungsteniteConfig::default(), &Scheduler::current())
            .dial(&DialRequest::new(address), TransportEvents::detached())
            .await;
        assert!(matches!(result, Err(SocketError::Connection(_))));
    }

    #[tokio::test]
    async fn test_connection_round_trip_over_websocket() {
        let (address, token) = echo_server().await;
        let (received_tx, mut received) = mpsc::unbounded_channel();
        let handler: Arc<dyn ConnectionHandler> = HandlerBuilder::<Connection>::new()
            .on_message(move |_, message| {
                let _ = received_tx.send(message);
                Ok(None)
            })
            .build();

        let scheduler = Scheduler::current();
        let transport = TungsteniteTransport::new(TungsteniteConfig::default(), &scheduler);
        let connection = Connection::builder(DialRequest::new(address).header("X-Token", "secret"))
            .handler(handler)
            .connect(&scheduler, Arc::new(transport))
            .unwrap();

        assert_eq!(connection.send_message("hello").await, Ok(()));
        let echoed = tokio::time::timeout(Duration::from_secs(5), received.recv())
            .await
            .unwrap();
        assert_eq!(echoed, Some(Message::Text("hello".into())));
        assert_eq!(token.await.unwrap(), Some("secret".to_string()));

        connection.close("done", 1000).await;
        assert_eq!(
            connection.wait_closed().await,
            SocketError::closed(1000, "done")
        );
    }
}
