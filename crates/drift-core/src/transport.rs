//! Transport abstraction and the production WebSocket transport.
//!
//! The connector only sees the [`Transport`] / [`TransportFactory`] traits;
//! tests drive it with an in-memory scripted transport (see `harness`),
//! production uses [`WsFactory`] over TLS WebSockets.

use std::collections::BTreeMap;

use async_trait::async_trait;
use bytes::Bytes;
use futures_util::{SinkExt, StreamExt};
use http::header::{HeaderName, HeaderValue, LOCATION, SEC_WEBSOCKET_PROTOCOL};
use tokio::net::TcpStream;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::handshake::client::Request;
use tokio_tungstenite::tungstenite::Message as WsMessage;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};
use tracing::debug;

use crate::errors::TransportError;

/// An established, bidirectional binary frame transport.
#[async_trait]
pub trait Transport: Send {
    async fn send(&mut self, frame: Bytes) -> Result<(), TransportError>;

    /// Next inbound frame. `None` means the peer closed the connection.
    async fn recv(&mut self) -> Option<Result<Bytes, TransportError>>;

    async fn close(&mut self);
}

/// Opens transports. One factory per connector; each connect attempt yields
/// a fresh transport.
#[async_trait]
pub trait TransportFactory: Send + Sync {
    async fn connect(
        &self,
        url: &str,
        access_key: &str,
        headers: &BTreeMap<String, String>,
    ) -> Result<Box<dyn Transport>, TransportError>;
}

/// WebSocket-over-TLS transport factory. The configured access key travels
/// as the WebSocket subprotocol; extra headers are set on the upgrade
/// request; HTTP redirects are followed.
pub struct WsFactory {
    max_redirects: usize,
}

impl Default for WsFactory {
    fn default() -> Self {
        Self { max_redirects: 5 }
    }
}

impl WsFactory {
    pub fn new() -> Self {
        Self::default()
    }
}

fn build_request(
    url: &str,
    access_key: &str,
    headers: &BTreeMap<String, String>,
) -> Result<Request, TransportError> {
    let mut request = url
        .into_client_request()
        .map_err(|err| TransportError::ConnectFailed(err.to_string()))?;

    let header_map = request.headers_mut();
    if !access_key.is_empty() {
        header_map.insert(
            SEC_WEBSOCKET_PROTOCOL,
            HeaderValue::from_str(access_key)
                .map_err(|_| TransportError::ConnectFailed("invalid access key".into()))?,
        );
    }
    for (name, value) in headers {
        let name = HeaderName::from_bytes(name.as_bytes())
            .map_err(|_| TransportError::ConnectFailed(format!("invalid header name: {name}")))?;
        let value = HeaderValue::from_str(value)
            .map_err(|_| TransportError::ConnectFailed("invalid header value".into()))?;
        header_map.insert(name, value);
    }
    Ok(request)
}

#[async_trait]
impl TransportFactory for WsFactory {
    async fn connect(
        &self,
        url: &str,
        access_key: &str,
        headers: &BTreeMap<String, String>,
    ) -> Result<Box<dyn Transport>, TransportError> {
        let mut url = url.to_string();
        for _ in 0..=self.max_redirects {
            let request = build_request(&url, access_key, headers)?;
            match connect_async(request).await {
                Ok((stream, _response)) => {
                    return Ok(Box::new(WsTransport { inner: stream }));
                }
                Err(tokio_tungstenite::tungstenite::Error::Http(response))
                    if response.status().is_redirection() =>
                {
                    let location = response
                        .headers()
                        .get(LOCATION)
                        .and_then(|v| v.to_str().ok())
                        .ok_or_else(|| {
                            TransportError::ConnectFailed("redirect without location".into())
                        })?;
                    debug!("following redirect to {location}");
                    url = location.to_string();
                }
                Err(tokio_tungstenite::tungstenite::Error::Tls(err)) => {
                    return Err(TransportError::Tls(err.to_string()));
                }
                Err(err) => return Err(TransportError::ConnectFailed(err.to_string())),
            }
        }
        Err(TransportError::TooManyRedirects)
    }
}

/// The production WebSocket transport.
pub struct WsTransport {
    inner: WebSocketStream<MaybeTlsStream<TcpStream>>,
}

#[async_trait]
impl Transport for WsTransport {
    async fn send(&mut self, frame: Bytes) -> Result<(), TransportError> {
        self.inner
            .send(WsMessage::Binary(frame.to_vec()))
            .await
            .map_err(|err| TransportError::Io(err.to_string()))
    }

    async fn recv(&mut self) -> Option<Result<Bytes, TransportError>> {
        loop {
            match self.inner.next().await? {
                Ok(WsMessage::Binary(data)) => return Some(Ok(Bytes::from(data))),
                Ok(WsMessage::Close(_)) => return None,
                // Protocol-level ping/pong is handled by the library; the
                // application keepalive uses its own frame.
                Ok(_) => continue,
                Err(err) => return Some(Err(TransportError::Io(err.to_string()))),
            }
        }
    }

    async fn close(&mut self) {
        let _ = self.inner.close(None).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn request_carries_subprotocol_and_headers() {
        let mut headers = BTreeMap::new();
        headers.insert("X-Tenant".to_string(), "demo".to_string());

        let request = build_request("wss://sync.example.com/ws", "access-1", &headers).unwrap();
        assert_eq!(
            request
                .headers()
                .get(SEC_WEBSOCKET_PROTOCOL)
                .and_then(|v| v.to_str().ok()),
            Some("access-1")
        );
        assert_eq!(
            request.headers().get("X-Tenant").and_then(|v| v.to_str().ok()),
            Some("demo")
        );
    }

    #[test]
    fn empty_access_key_sets_no_subprotocol() {
        let request = build_request("wss://sync.example.com/ws", "", &BTreeMap::new()).unwrap();
        assert!(request.headers().get(SEC_WEBSOCKET_PROTOCOL).is_none());
    }

    #[test]
    fn invalid_url_is_rejected() {
        assert!(build_request("not a url", "k", &BTreeMap::new()).is_err());
    }
}
