use async_trait::async_trait;
use tokio::sync::mpsc;
use tracing::debug;

use super::{Connector, Link, TransportError, TransportPair};

/// Creates a connector whose links are handed to the paired acceptor.
pub fn memory_endpoint() -> (MemoryConnector, MemoryAcceptor) {
    let (tx, rx) = mpsc::unbounded_channel();
    (MemoryConnector { acceptor: tx }, MemoryAcceptor { incoming: rx })
}

#[derive(Clone)]
pub struct MemoryConnector {
    acceptor: mpsc::UnboundedSender<Link>,
}

#[async_trait]
impl Connector for MemoryConnector {
    async fn connect(&self) -> Result<Link, TransportError> {
        let TransportPair { client, server } = TransportPair::new();
        self.acceptor
            .send(server)
            .map_err(|_| TransportError::Unreachable("memory acceptor dropped".into()))?;
        debug!(target = "undertow::transport", link = %client.id(), "memory link opened");
        Ok(client)
    }

    fn describe(&self) -> String {
        "memory".into()
    }
}

pub struct MemoryAcceptor {
    incoming: mpsc::UnboundedReceiver<Link>,
}

impl MemoryAcceptor {
    pub async fn accept(&mut self) -> Option<Link> {
        self.incoming.recv().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test_timeout::tokio_timeout_test]
    async fn connector_hands_peer_to_acceptor() {
        let (connector, mut acceptor) = memory_endpoint();
        let client = connector.connect().await.expect("connect");
        let mut server = acceptor.accept().await.expect("accepted");
        client.send(vec![3]).expect("send");
        assert_eq!(server.recv().await, Some(vec![3]));
    }

    #[test_timeout::tokio_timeout_test]
    async fn dropped_acceptor_is_unreachable() {
        let (connector, acceptor) = memory_endpoint();
        drop(acceptor);
        assert!(matches!(
            connector.connect().await,
            Err(TransportError::Unreachable(_))
        ));
    }
}
