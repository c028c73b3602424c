use std::net::SocketAddr;

use async_trait::async_trait;
use futures_util::{SinkExt, StreamExt};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpListener;
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{WebSocketStream, accept_async, connect_async};
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace, warn};

use super::{Connector, Link, TransportError, TransportKind};

/// Dials a `ws://` endpoint and speaks binary messages over it.
#[derive(Debug, Clone)]
pub struct WebSocketConnector {
    url: String,
}

impl WebSocketConnector {
    pub fn new(url: impl Into<String>) -> Result<Self, TransportError> {
        let url = url.into();
        let parsed = url::Url::parse(&url).map_err(|err| TransportError::Setup(err.to_string()))?;
        match parsed.scheme() {
            "ws" | "wss" => Ok(Self { url }),
            other => Err(TransportError::Setup(format!(
                "unsupported websocket scheme '{other}'"
            ))),
        }
    }
}

#[async_trait]
impl Connector for WebSocketConnector {
    async fn connect(&self) -> Result<Link, TransportError> {
        let (stream, _) = connect_async(self.url.as_str())
            .await
            .map_err(|err| TransportError::Unreachable(err.to_string()))?;
        let link = spawn_link(stream);
        debug!(target = "undertow::transport", link = %link.id(), url = %self.url, "websocket connected");
        Ok(link)
    }

    fn describe(&self) -> String {
        self.url.clone()
    }
}

pub struct WebSocketListener {
    listener: TcpListener,
}

impl WebSocketListener {
    pub async fn bind(addr: SocketAddr) -> Result<Self, TransportError> {
        let listener = TcpListener::bind(addr)
            .await
            .map_err(|err| TransportError::Setup(err.to_string()))?;
        Ok(Self { listener })
    }

    pub fn local_addr(&self) -> Result<SocketAddr, TransportError> {
        self.listener
            .local_addr()
            .map_err(|err| TransportError::Setup(err.to_string()))
    }

    /// Accepts the next TCP connection and completes the upgrade.
    pub async fn accept(&self) -> Result<Link, TransportError> {
        let (stream, peer) = self
            .listener
            .accept()
            .await
            .map_err(|err| TransportError::Setup(err.to_string()))?;
        let ws = accept_async(stream)
            .await
            .map_err(|err| TransportError::WebSocket(err.to_string()))?;
        let link = spawn_link(ws);
        debug!(target = "undertow::transport", link = %link.id(), peer = %peer, "websocket accepted");
        Ok(link)
    }
}

fn spawn_link<S>(stream: WebSocketStream<S>) -> Link
where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    let (outbound_tx, mut outbound_rx) = mpsc::unbounded_channel::<Vec<u8>>();
    let (inbound_tx, inbound_rx) = mpsc::unbounded_channel::<Vec<u8>>();
    let closed = CancellationToken::new();
    let (mut ws_sender, mut ws_receiver) = stream.split();

    let writer_closed = closed.clone();
    tokio::spawn(async move {
        loop {
            tokio::select! {
                _ = writer_closed.cancelled() => break,
                next = outbound_rx.recv() => match next {
                    Some(bytes) => {
                        if let Err(err) = ws_sender.send(Message::Binary(bytes)).await {
                            warn!(target = "undertow::transport", error = %err, "websocket send failed");
                            break;
                        }
                    }
                    None => break,
                },
            }
        }
        let _ = ws_sender.send(Message::Close(None)).await;
        writer_closed.cancel();
    });

    let reader_closed = closed.clone();
    tokio::spawn(async move {
        loop {
            let next = tokio::select! {
                _ = reader_closed.cancelled() => break,
                next = ws_receiver.next() => next,
            };
            match next {
                Some(Ok(Message::Binary(bytes))) => {
                    if inbound_tx.send(bytes).is_err() {
                        break;
                    }
                }
                Some(Ok(Message::Close(_))) | None => break,
                Some(Ok(other)) => {
                    trace!(target = "undertow::transport", kind = ?other, "ignoring non-binary message");
                }
                Some(Err(err)) => {
                    debug!(target = "undertow::transport", error = %err, "websocket read failed");
                    break;
                }
            }
        }
        reader_closed.cancel();
    });

    Link::from_channels(TransportKind::WebSocket, outbound_tx, inbound_rx, closed)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test_timeout::tokio_timeout_test(20)]
    async fn websocket_link_carries_binary_messages() {
        let listener = WebSocketListener::bind("127.0.0.1:0".parse().expect("addr"))
            .await
            .expect("bind");
        let addr = listener.local_addr().expect("local addr");
        let server = tokio::spawn(async move {
            let mut link = listener.accept().await.expect("accept");
            let bytes = link.recv().await.expect("message");
            link.send(bytes.into_iter().rev().collect()).expect("echo");
            link
        });

        let connector = WebSocketConnector::new(format!("ws://{addr}")).expect("connector");
        let mut client = connector.connect().await.expect("connect");
        assert_eq!(client.kind(), TransportKind::WebSocket);
        client.send(vec![1, 2, 3]).expect("send");
        assert_eq!(client.recv().await, Some(vec![3, 2, 1]));

        let server_link = server.await.expect("server task");
        server_link.close();
        assert_eq!(client.recv().await, None);
    }

    #[test_timeout::timeout]
    fn connector_rejects_http_urls() {
        assert!(matches!(
            WebSocketConnector::new("http://localhost"),
            Err(TransportError::Setup(_))
        ));
    }
}
