use futures::stream::SplitSink;
use tokio::net::TcpStream;
use tokio_tungstenite::{tungstenite::Message, MaybeTlsStream, WebSocketStream};
use url::Url;

use crate::types::Result;

/// A connected client WebSocket stream (plain TCP or TLS).
pub type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// The write half of a split [`WsStream`].
pub type WsSink = SplitSink<WsStream, Message>;

/// Dials WebSocket connections for the session layer.
pub struct WebSocketFactory;

impl WebSocketFactory {
    /// Opens a WebSocket connection to `url`.
    ///
    /// The URL is validated before dialing so malformed endpoints fail with
    /// a parse error rather than an opaque transport error.
    pub async fn create(url: &str) -> Result<WsStream> {
        Url::parse(url)?;
        tracing::debug!("Dialing WebSocket endpoint {}", url);
        let (stream, response) = tokio_tungstenite::connect_async(url).await?;
        tracing::debug!("WebSocket handshake completed: {:?}", response.status());
        Ok(stream)
    }
}
