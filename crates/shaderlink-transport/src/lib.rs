//! Message-oriented duplex channels carrying text frames.
//!
//! A [`Connector`] opens one connection and hands back its two halves. The
//! connection manager owns both halves exclusively and recreates them on
//! every connect attempt.

use async_trait::async_trait;
use thiserror::Error;

pub mod memory;
pub mod websocket;

pub use memory::{MemoryAcceptor, MemoryConnector, MemoryPeer, memory_transport};
pub use websocket::WebSocketConnector;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Frame {
    Text(String),
    /// Orderly shutdown, with the peer's reason if it gave one.
    Close(Option<String>),
}

#[derive(Debug, Error)]
pub enum TransportError {
    #[error("connect failed: {0}")]
    Connect(String),
    #[error("send failed: {0}")]
    Send(String),
    #[error("receive failed: {0}")]
    Receive(String),
    #[error("transport closed")]
    Closed,
}

pub type TransportResult<T> = Result<T, TransportError>;

#[async_trait]
pub trait FrameSink: Send {
    async fn send(&mut self, frame: Frame) -> TransportResult<()>;
}

#[async_trait]
pub trait FrameStream: Send {
    /// Next frame, or `None` once the connection is gone.
    async fn next_frame(&mut self) -> Option<TransportResult<Frame>>;
}

/// Both halves of one open connection.
pub struct Duplex {
    pub sink: Box<dyn FrameSink>,
    pub stream: Box<dyn FrameStream>,
}

#[async_trait]
pub trait Connector: Send + Sync {
    async fn connect(&self) -> TransportResult<Duplex>;

    /// Where this connector points, for logs.
    fn endpoint(&self) -> String;
}
