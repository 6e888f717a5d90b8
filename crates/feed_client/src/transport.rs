//! Transport abstraction over the persistent connection.
//!
//! The connection manager only sees the [`Transport`]/[`Connector`] seam; the
//! production implementation dials a WebSocket over TLS. Tests substitute a
//! scripted in-memory transport.

use std::net::{SocketAddr, ToSocketAddrs};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use common::{Error, Result};
use futures::stream::{SplitSink, SplitStream};
use futures::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio_tungstenite::{
    client_async_tls_with_config,
    tungstenite::protocol::{frame::coding::CloseCode, CloseFrame, Message},
    Connector as TlsConnector, MaybeTlsStream, WebSocketStream,
};
use tracing::{debug, warn};
use url::Url;

/// Events surfaced by a transport to the connection manager.
#[derive(Debug)]
pub enum TransportEvent {
    /// One complete inbound text frame.
    Frame(String),
    /// The peer closed the connection or the stream errored out.
    Closed,
}

/// An open duplex channel to the feed server.
#[async_trait]
pub trait Transport: Send {
    async fn send(&mut self, text: String) -> Result<()>;
    /// Wait for the next inbound event. Yields `Closed` once the far end is
    /// gone; the manager drops the transport at that point.
    async fn next_event(&mut self) -> TransportEvent;
    /// Best-effort clean close.
    async fn close(&mut self);
}

/// Opens transports. The manager holds one connector for the client lifetime.
#[async_trait]
pub trait Connector: Send + Sync {
    async fn open(&self, url: &Url) -> Result<Box<dyn Transport>>;
}

const TCP_CONNECT_TIMEOUT: Duration = Duration::from_secs(5);

/// Production connector: WebSocket over TLS via tokio-tungstenite.
#[derive(Debug, Default)]
pub struct WsConnector;

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

struct WsTransport {
    write: SplitSink<WsStream, Message>,
    read: SplitStream<WsStream>,
}

#[async_trait]
impl Connector for WsConnector {
    async fn open(&self, url: &Url) -> Result<Box<dyn Transport>> {
        let host = url
            .host_str()
            .ok_or_else(|| Error::Generic("no host in URL".to_string()))?;
        let port = url.port().unwrap_or(443);
        let tcp_stream = dial(&format!("{}:{}", host, port)).await?;

        let mut root_store = rustls::RootCertStore::empty();
        for cert in rustls_native_certs::load_native_certs().certs {
            let _ = root_store.add(cert);
        }
        let connector = TlsConnector::Rustls(Arc::new(
            rustls::ClientConfig::builder_with_provider(Arc::new(
                rustls::crypto::ring::default_provider(),
            ))
            .with_safe_default_protocol_versions()
            .map_err(|e| Error::Generic(format!("TLS config error: {}", e)))?
            .with_root_certificates(root_store)
            .with_no_client_auth(),
        ));

        let (ws_stream, response) =
            client_async_tls_with_config(url.as_str(), tcp_stream, None, Some(connector)).await?;
        debug!(status = ?response.status(), "websocket handshake complete");

        let (write, read) = ws_stream.split();
        Ok(Box::new(WsTransport { write, read }))
    }
}

/// Resolve and connect, preferring IPv4 addresses.
async fn dial(addr: &str) -> Result<TcpStream> {
    let addrs: Vec<SocketAddr> = addr
        .to_socket_addrs()
        .map_err(|e| Error::Generic(format!("DNS resolution failed: {}", e)))?
        .collect();

    let mut ordered: Vec<SocketAddr> = addrs.iter().filter(|a| a.is_ipv4()).copied().collect();
    ordered.extend(addrs.iter().filter(|a| a.is_ipv6()).copied());

    for candidate in &ordered {
        match tokio::time::timeout(TCP_CONNECT_TIMEOUT, TcpStream::connect(candidate)).await {
            Ok(Ok(stream)) => return Ok(stream),
            Ok(Err(e)) => debug!(addr = %candidate, error = %e, "TCP connect failed"),
            Err(_) => debug!(addr = %candidate, "TCP connect timed out"),
        }
    }
    Err(Error::Generic(format!(
        "all connection attempts to {} failed",
        addr
    )))
}

#[async_trait]
impl Transport for WsTransport {
    async fn send(&mut self, text: String) -> Result<()> {
        self.write.send(Message::Text(text)).await?;
        Ok(())
    }

    async fn next_event(&mut self) -> TransportEvent {
        loop {
            match self.read.next().await {
                Some(Ok(Message::Text(text))) => return TransportEvent::Frame(text),
                Some(Ok(Message::Binary(data))) => match String::from_utf8(data) {
                    Ok(text) => return TransportEvent::Frame(text),
                    Err(_) => warn!("dropping non-UTF-8 binary frame"),
                },
                Some(Ok(Message::Ping(data))) => {
                    // Protocol-level keepalive; answered here, invisible above.
                    let _ = self.write.send(Message::Pong(data)).await;
                }
                Some(Ok(Message::Pong(_))) => {}
                Some(Ok(Message::Close(frame))) => {
                    debug!(?frame, "received close frame");
                    return TransportEvent::Closed;
                }
                Some(Ok(Message::Frame(_))) => {}
                Some(Err(e)) => {
                    warn!(error = %e, "websocket read error");
                    return TransportEvent::Closed;
                }
                None => return TransportEvent::Closed,
            }
        }
    }

    async fn close(&mut self) {
        let frame = CloseFrame {
            code: CloseCode::Normal,
            reason: "client disconnect".into(),
        };
        let _ = self.write.send(Message::Close(Some(frame))).await;
    }
}
