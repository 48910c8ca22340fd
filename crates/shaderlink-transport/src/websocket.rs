use async_trait::async_trait;
use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::tungstenite::protocol::CloseFrame;
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream, connect_async};
use tracing::{debug, instrument, warn};

use crate::{Connector, Duplex, Frame, FrameSink, FrameStream, TransportError, TransportResult};

type Socket = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// Client-side WebSocket connector (`ws://` or `wss://`).
#[derive(Debug, Clone)]
pub struct WebSocketConnector {
    url: String,
}

impl WebSocketConnector {
    pub fn new(url: impl Into<String>) -> Self {
        Self { url: url.into() }
    }
}

#[async_trait]
impl Connector for WebSocketConnector {
    #[instrument(skip(self), fields(url = %self.url))]
    async fn connect(&self) -> TransportResult<Duplex> {
        let (socket, response) = connect_async(self.url.as_str())
            .await
            .map_err(|error| TransportError::Connect(error.to_string()))?;
        debug!(status = %response.status(), "websocket handshake complete");
        let (sink, stream) = socket.split();
        Ok(Duplex {
            sink: Box::new(WebSocketSink { inner: sink }),
            stream: Box::new(WebSocketSource { inner: stream }),
        })
    }

    fn endpoint(&self) -> String {
        self.url.clone()
    }
}

struct WebSocketSink {
    inner: SplitSink<Socket, Message>,
}

#[async_trait]
impl FrameSink for WebSocketSink {
    async fn send(&mut self, frame: Frame) -> TransportResult<()> {
        match frame {
            Frame::Text(text) => self
                .inner
                .send(Message::Text(text))
                .await
                .map_err(|error| TransportError::Send(error.to_string())),
            Frame::Close(reason) => {
                let close = CloseFrame {
                    code: CloseCode::Normal,
                    reason: reason.unwrap_or_default().into(),
                };
                // The peer may already be gone; closing is best-effort.
                if let Err(error) = self.inner.send(Message::Close(Some(close))).await {
                    debug!(%error, "close frame not delivered");
                }
                self.inner
                    .close()
                    .await
                    .map_err(|error| TransportError::Send(error.to_string()))
            }
        }
    }
}

struct WebSocketSource {
    inner: SplitStream<Socket>,
}

#[async_trait]
impl FrameStream for WebSocketSource {
    async fn next_frame(&mut self) -> Option<TransportResult<Frame>> {
        loop {
            let message = match self.inner.next().await? {
                Ok(message) => message,
                Err(error) => return Some(Err(TransportError::Receive(error.to_string()))),
            };
            match message {
                Message::Text(text) => return Some(Ok(Frame::Text(text))),
                Message::Binary(bytes) => match String::from_utf8(bytes) {
                    Ok(text) => return Some(Ok(Frame::Text(text))),
                    Err(error) => warn!(%error, "dropping non-UTF-8 binary frame"),
                },
                Message::Close(close) => {
                    return Some(Ok(Frame::Close(
                        close.map(|frame| frame.reason.into_owned()),
                    )));
                }
                // Control frames are answered by tungstenite itself.
                Message::Ping(_) | Message::Pong(_) | Message::Frame(_) => {}
            }
        }
    }
}
