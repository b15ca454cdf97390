use std::time::Duration;

use async_trait::async_trait;
use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio::sync::Mutex;
use tokio_tungstenite::tungstenite::{self, http::StatusCode, Message};
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};

use crate::protocol::Frame;
use crate::transport::{Connector, ProxyTransport, Result, TransportError, TransportKind};

pub const NODE_PATH: &str = "/hub/node";
pub const OBSERVER_PATH: &str = "/hub/observer";

const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(10);

type Stream = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// Dials the hub's websocket endpoint, presenting the bearer token as the
/// `access_token` query parameter.
#[derive(Clone)]
pub struct WsConnector {
    base_url: String,
    path: &'static str,
    token: String,
}

impl WsConnector {
    /// Node-facing endpoint. `hub_url` is the base, e.g. `ws://127.0.0.1:7420`.
    pub fn node(hub_url: impl Into<String>, token: impl Into<String>) -> Self {
        Self {
            base_url: hub_url.into().trim_end_matches('/').to_string(),
            path: NODE_PATH,
            token: token.into(),
        }
    }

    /// Observer-facing endpoint.
    pub fn observer(hub_url: impl Into<String>, token: impl Into<String>) -> Self {
        Self {
            base_url: hub_url.into().trim_end_matches('/').to_string(),
            path: OBSERVER_PATH,
            token: token.into(),
        }
    }

    fn url(&self) -> String {
        format!("{}{}?access_token={}", self.base_url, self.path, self.token)
    }
}

#[async_trait]
impl Connector for WsConnector {
    async fn connect(&self) -> Result<Box<dyn ProxyTransport>> {
        let url = self.url();
        let attempt = tokio::time::timeout(HANDSHAKE_TIMEOUT, tokio_tungstenite::connect_async(url));
        let (stream, _response) = match attempt.await {
            Err(_) => return Err(TransportError::Timeout(HANDSHAKE_TIMEOUT.as_millis() as u64)),
            Ok(Err(tungstenite::Error::Http(resp))) if resp.status() == StatusCode::UNAUTHORIZED => {
                return Err(TransportError::Unauthorized)
            }
            Ok(Err(e)) => return Err(TransportError::Handshake(e.to_string())),
            Ok(Ok(ok)) => ok,
        };
        Ok(Box::new(WsTransport::new(stream)))
    }

    fn describe(&self) -> String {
        format!("{}{}", self.base_url, self.path)
    }
}

/// Client half of an established websocket.
pub struct WsTransport {
    sink: Mutex<SplitSink<Stream, Message>>,
    stream: Mutex<SplitStream<Stream>>,
}

impl WsTransport {
    pub fn new(stream: Stream) -> Self {
        let (sink, stream) = stream.split();
        Self {
            sink: Mutex::new(sink),
            stream: Mutex::new(stream),
        }
    }
}

#[async_trait]
impl ProxyTransport for WsTransport {
    fn kind(&self) -> TransportKind {
        TransportKind::WebSocket
    }

    async fn send(&self, frame: Frame) -> Result<()> {
        let text = frame
            .encode()
            .map_err(|e| TransportError::Serialization(e.to_string()))?;
        self.sink
            .lock()
            .await
            .send(Message::text(text))
            .await
            .map_err(|e| TransportError::SendFailed(e.to_string()))
    }

    async fn recv(&self) -> Result<Frame> {
        let mut stream = self.stream.lock().await;
        loop {
            match stream.next().await {
                Some(Ok(Message::Text(text))) => {
                    return Frame::decode(text.as_str())
                        .map_err(|e| TransportError::Serialization(e.to_string()));
                }
                Some(Ok(Message::Close(_))) | None => return Err(TransportError::ConnectionClosed),
                // Pings are answered by tungstenite itself.
                Some(Ok(_)) => continue,
                Some(Err(e)) => return Err(TransportError::ReceiveFailed(e.to_string())),
            }
        }
    }

    async fn close(&self) {
        let _ = self.sink.lock().await.close().await;
    }
}
