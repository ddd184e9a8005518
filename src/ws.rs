//! Shared WebSocket transport.
//!
//! Thin wrapper around `tokio-tungstenite` providing type-isolated
//! reader/writer halves. All WebSocket consumers in the crate should use
//! this module rather than `tokio-tungstenite` directly.
//!
//! A single [`connect`] function handles URL scheme rewriting, bearer
//! header insertion, and TLS negotiation, and distinguishes an
//! authentication rejection at the handshake from ordinary transport
//! failure - the channel layer treats the two very differently.

use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::{connect_async, tungstenite};

/// Concrete WebSocket stream type (avoids repeating the generic everywhere).
type WsStream =
    tokio_tungstenite::WebSocketStream<tokio_tungstenite::MaybeTlsStream<tokio::net::TcpStream>>;

/// Errors from establishing a WebSocket connection.
#[derive(Debug)]
pub enum ConnectError {
    /// Server rejected the handshake with 401/403; the token is bad.
    Unauthorized,
    /// Any other handshake or transport failure.
    Failed(String),
}

impl std::fmt::Display for ConnectError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Unauthorized => write!(f, "WebSocket handshake rejected: unauthorized"),
            Self::Failed(msg) => write!(f, "WebSocket connect failed: {msg}"),
        }
    }
}

impl std::error::Error for ConnectError {}

/// Received WebSocket message.
#[derive(Debug)]
pub enum WsMessage {
    /// UTF-8 text frame.
    Text(String),
    /// Ping frame with payload.
    Ping(Vec<u8>),
    /// Close frame (code and reason dropped; the caller only reconnects).
    Close,
}

/// Write half of a WebSocket connection.
#[derive(Debug)]
pub struct WsWriter {
    sink: SplitSink<WsStream, tungstenite::Message>,
}

impl WsWriter {
    /// Send a UTF-8 text frame.
    ///
    /// # Errors
    ///
    /// Returns an error if the send fails (connection closed, I/O error).
    pub async fn send_text(&mut self, text: &str) -> Result<(), ConnectError> {
        self.sink
            .send(tungstenite::Message::Text(text.to_string()))
            .await
            .map_err(|e| ConnectError::Failed(format!("send_text: {e}")))
    }

    /// Send a pong frame in response to a ping.
    ///
    /// # Errors
    ///
    /// Returns an error if the send fails.
    pub async fn send_pong(&mut self, data: Vec<u8>) -> Result<(), ConnectError> {
        self.sink
            .send(tungstenite::Message::Pong(data))
            .await
            .map_err(|e| ConnectError::Failed(format!("send_pong: {e}")))
    }
}

/// Read half of a WebSocket connection.
#[derive(Debug)]
pub struct WsReader {
    stream: SplitStream<WsStream>,
}

impl WsReader {
    /// Receive the next message.
    ///
    /// Returns `None` when the connection is closed or errors; the caller
    /// reconnects in either case, so the distinction is only logged.
    pub async fn next(&mut self) -> Option<WsMessage> {
        loop {
            match self.stream.next().await? {
                Ok(tungstenite::Message::Text(text)) => return Some(WsMessage::Text(text)),
                Ok(tungstenite::Message::Ping(data)) => return Some(WsMessage::Ping(data)),
                Ok(tungstenite::Message::Close(_)) => return Some(WsMessage::Close),
                Ok(_) => continue,
                Err(e) => {
                    log::warn!("WebSocket read error: {}", e);
                    return None;
                }
            }
        }
    }
}

/// Connect to `server_url` at `path` with a bearer token.
///
/// Rewrites `http(s)://` to `ws(s)://`, attaches `Origin` and
/// `Authorization` headers, and splits the stream into halves ready for a
/// `tokio::select!` loop.
///
/// # Errors
///
/// Returns [`ConnectError::Unauthorized`] when the server answers the
/// handshake with 401 or 403, [`ConnectError::Failed`] for everything else.
pub async fn connect(
    server_url: &str,
    path: &str,
    token: &str,
) -> Result<(WsWriter, WsReader), ConnectError> {
    let ws_url = format!(
        "{}{}",
        server_url
            .replace("https://", "wss://")
            .replace("http://", "ws://"),
        path
    );

    log::debug!("Connecting WebSocket: {}", ws_url);

    let mut request = ws_url
        .into_client_request()
        .map_err(|e| ConnectError::Failed(format!("invalid URL: {e}")))?;

    let origin = server_url
        .parse()
        .map_err(|e| ConnectError::Failed(format!("invalid server URL '{server_url}': {e}")))?;
    request.headers_mut().insert("Origin", origin);
    request.headers_mut().insert(
        "Authorization",
        format!("Bearer {token}")
            .parse()
            .map_err(|e| ConnectError::Failed(format!("invalid token header: {e}")))?,
    );

    let (stream, _) = connect_async(request).await.map_err(|e| match &e {
        tungstenite::Error::Http(response)
            if response.status() == 401 || response.status() == 403 =>
        {
            ConnectError::Unauthorized
        }
        _ => ConnectError::Failed(e.to_string()),
    })?;

    let (sink, stream) = stream.split();
    Ok((WsWriter { sink }, WsReader { stream }))
}
