//! In-process transport. Each `connect` creates a fresh channel pair and
//! hands the far end to whoever holds the [`MemoryAcceptor`], which lets a
//! test script the peer frame by frame.

use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};

use async_trait::async_trait;
use tokio::sync::mpsc;
use tracing::debug;

use crate::{Connector, Duplex, Frame, FrameSink, FrameStream, TransportError, TransportResult};

pub fn memory_transport() -> (MemoryConnector, MemoryAcceptor) {
    let (accept_tx, accept_rx) = mpsc::unbounded_channel();
    (
        MemoryConnector {
            accept_tx,
            refuse_remaining: Arc::new(AtomicU32::new(0)),
        },
        MemoryAcceptor { accept_rx },
    )
}

#[derive(Debug, Clone)]
pub struct MemoryConnector {
    accept_tx: mpsc::UnboundedSender<MemoryPeer>,
    refuse_remaining: Arc<AtomicU32>,
}

impl MemoryConnector {
    /// Make the next `count` connect attempts fail.
    pub fn refuse_next(&self, count: u32) {
        self.refuse_remaining.store(count, Ordering::SeqCst);
    }

    fn take_refusal(&self) -> bool {
        self.refuse_remaining
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |left| left.checked_sub(1))
            .is_ok()
    }
}

#[async_trait]
impl Connector for MemoryConnector {
    async fn connect(&self) -> TransportResult<Duplex> {
        if self.take_refusal() {
            return Err(TransportError::Connect("connection refused".to_owned()));
        }
        let (to_peer, from_client) = mpsc::unbounded_channel();
        let (to_client, from_peer) = mpsc::unbounded_channel();
        self.accept_tx
            .send(MemoryPeer {
                to_client,
                from_client,
            })
            .map_err(|_| TransportError::Connect("no acceptor listening".to_owned()))?;
        debug!("memory connection opened");
        Ok(Duplex {
            sink: Box::new(MemorySink { tx: to_peer }),
            stream: Box::new(MemorySource { rx: from_peer }),
        })
    }

    fn endpoint(&self) -> String {
        "memory://".to_owned()
    }
}

#[derive(Debug)]
pub struct MemoryAcceptor {
    accept_rx: mpsc::UnboundedReceiver<MemoryPeer>,
}

impl MemoryAcceptor {
    pub async fn accept(&mut self) -> Option<MemoryPeer> {
        self.accept_rx.recv().await
    }
}

/// The far end of one in-memory connection. Dropping it looks like the
/// remote side vanishing.
#[derive(Debug)]
pub struct MemoryPeer {
    to_client: mpsc::UnboundedSender<Frame>,
    from_client: mpsc::UnboundedReceiver<Frame>,
}

impl MemoryPeer {
    pub async fn recv(&mut self) -> Option<Frame> {
        self.from_client.recv().await
    }

    /// Next text frame, skipping close frames.
    pub async fn recv_text(&mut self) -> Option<String> {
        loop {
            match self.from_client.recv().await? {
                Frame::Text(text) => return Some(text),
                Frame::Close(_) => continue,
            }
        }
    }

    pub fn send_text(&self, text: impl Into<String>) -> bool {
        self.to_client.send(Frame::Text(text.into())).is_ok()
    }

    pub fn close(self, reason: Option<String>) {
        let _ = self.to_client.send(Frame::Close(reason));
    }
}

struct MemorySink {
    tx: mpsc::UnboundedSender<Frame>,
}

#[async_trait]
impl FrameSink for MemorySink {
    async fn send(&mut self, frame: Frame) -> TransportResult<()> {
        self.tx.send(frame).map_err(|_| TransportError::Closed)
    }
}

struct MemorySource {
    rx: mpsc::UnboundedReceiver<Frame>,
}

#[async_trait]
impl FrameStream for MemorySource {
    async fn next_frame(&mut self) -> Option<TransportResult<Frame>> {
        self.rx.recv().await.map(Ok)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use anyhow::{Context, Result};

    #[tokio::test]
    async fn frames_flow_both_ways() -> Result<()> {
        let (connector, mut acceptor) = memory_transport();
        let mut duplex = connector.connect().await?;
        let mut peer = acceptor.accept().await.context("no peer")?;

        duplex.sink.send(Frame::Text("hello".into())).await?;
        assert_eq!(peer.recv_text().await.as_deref(), Some("hello"));

        assert!(peer.send_text("world"));
        let frame = duplex.stream.next_frame().await.context("stream ended")??;
        assert_eq!(frame, Frame::Text("world".into()));
        Ok(())
    }

    #[tokio::test]
    async fn dropped_peer_ends_the_stream() -> Result<()> {
        let (connector, mut acceptor) = memory_transport();
        let mut duplex = connector.connect().await?;
        let peer = acceptor.accept().await.context("no peer")?;
        drop(peer);
        assert!(duplex.stream.next_frame().await.is_none());
        assert!(duplex.sink.send(Frame::Text("late".into())).await.is_err());
        Ok(())
    }

    #[tokio::test]
    async fn refusals_are_consumed_in_order() -> Result<()> {
        let (connector, _acceptor) = memory_transport();
        connector.refuse_next(2);
        assert!(connector.connect().await.is_err());
        assert!(connector.connect().await.is_err());
        assert!(connector.connect().await.is_ok());
        Ok(())
    }

    #[tokio::test]
    async fn peer_close_is_delivered_as_close_frame() -> Result<()> {
        let (connector, mut acceptor) = memory_transport();
        let mut duplex = connector.connect().await?;
        let peer = acceptor.accept().await.context("no peer")?;
        peer.close(Some("bye".into()));
        let frame = duplex.stream.next_frame().await.context("stream ended")??;
        assert_eq!(frame, Frame::Close(Some("bye".into())));
        Ok(())
    }
}
