//! Transports carry encoded frames; [`Connection`] adds the codec on top.
//!
//! A WebSocket (networked play) and an in-process loopback (offline play)
//! implement the same [`Transport`] trait, so sessions never know which one
//! they are talking through.

use std::future::Future;

use futures_util::{SinkExt, StreamExt};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::Message as WsMessage;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};
use url::Url;

use crate::common::protocol::{self, CodecError, Message};

#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    #[error("websocket error: {0}")]
    WebSocket(#[from] tokio_tungstenite::tungstenite::Error),
    #[error("invalid server address: {0}")]
    Address(#[from] url::ParseError),
    #[error("transport closed")]
    Closed,
    #[error(transparent)]
    Codec(#[from] CodecError),
    #[error("unexpected {0} frame")]
    UnexpectedFrame(&'static str),
}

impl TransportError {
    /// Bad input from the peer. The frame is dropped; the link stays up.
    pub fn is_bad_frame(&self) -> bool {
        matches!(self, TransportError::Codec(_) | TransportError::UnexpectedFrame(_))
    }
}

/// A bidirectional, frame-delimited byte link.
pub trait Transport: Send {
    fn send_frame(&mut self, frame: Vec<u8>) -> impl Future<Output = Result<(), TransportError>> + Send;

    /// Next inbound frame, or `None` once the peer has closed. Must be
    /// cancel-safe: the connection driver polls it inside `select!`.
    fn next_frame(&mut self) -> impl Future<Output = Option<Result<Vec<u8>, TransportError>>> + Send;
}

/// Binary WebSocket frames over any async byte stream.
pub struct WebSocketTransport<S> {
    stream: WebSocketStream<S>,
}

impl<S> WebSocketTransport<S> {
    pub fn new(stream: WebSocketStream<S>) -> Self {
        WebSocketTransport { stream }
    }
}

impl<S> Transport for WebSocketTransport<S>
where
    S: AsyncRead + AsyncWrite + Unpin + Send,
{
    async fn send_frame(&mut self, frame: Vec<u8>) -> Result<(), TransportError> {
        self.stream.send(WsMessage::Binary(frame)).await?;
        Ok(())
    }

    async fn next_frame(&mut self) -> Option<Result<Vec<u8>, TransportError>> {
        loop {
            match self.stream.next().await? {
                Ok(WsMessage::Binary(bytes)) => return Some(Ok(bytes)),
                Ok(WsMessage::Text(_)) => return Some(Err(TransportError::UnexpectedFrame("text"))),
                Ok(WsMessage::Close(_)) => return None,
                // Pings are answered by tungstenite itself.
                Ok(_) => continue,
                Err(e) => return Some(Err(e.into())),
            }
        }
    }
}

/// One end of an in-process link.
#[derive(Debug)]
pub struct LoopbackTransport {
    tx: mpsc::UnboundedSender<Vec<u8>>,
    rx: mpsc::UnboundedReceiver<Vec<u8>>,
}

/// Two connected loopback ends: frames sent on one arrive on the other.
pub fn loopback_pair() -> (LoopbackTransport, LoopbackTransport) {
    let (a_tx, b_rx) = mpsc::unbounded_channel();
    let (b_tx, a_rx) = mpsc::unbounded_channel();
    (
        LoopbackTransport { tx: a_tx, rx: a_rx },
        LoopbackTransport { tx: b_tx, rx: b_rx },
    )
}

impl Transport for LoopbackTransport {
    async fn send_frame(&mut self, frame: Vec<u8>) -> Result<(), TransportError> {
        self.tx.send(frame).map_err(|_| TransportError::Closed)
    }

    async fn next_frame(&mut self) -> Option<Result<Vec<u8>, TransportError>> {
        self.rx.recv().await.map(Ok)
    }
}

/// A transport plus the wire codec.
pub struct Connection<T> {
    transport: T,
}

impl<T: Transport> Connection<T> {
    pub fn new(transport: T) -> Self {
        Connection { transport }
    }

    pub async fn send(&mut self, message: &Message) -> Result<(), TransportError> {
        let frame = protocol::encode(message)?;
        self.transport.send_frame(frame).await
    }

    /// Next decoded message. A frame that fails to decode yields
    /// `Some(Err(..))` and leaves the connection usable.
    pub async fn recv(&mut self) -> Option<Result<Message, TransportError>> {
        let frame = match self.transport.next_frame().await? {
            Ok(frame) => frame,
            Err(e) => return Some(Err(e)),
        };
        Some(protocol::decode(&frame).map_err(TransportError::from))
    }

    /// Calls `handler` for every decodable inbound message until the
    /// transport closes or fails. Undecodable frames are logged and skipped.
    pub async fn on_message<F>(&mut self, mut handler: F) -> Result<(), TransportError>
    where
        F: FnMut(Message),
    {
        while let Some(inbound) = self.recv().await {
            match inbound {
                Ok(message) => handler(message),
                Err(e) if e.is_bad_frame() => tracing::warn!(error = %e, "dropping bad frame"),
                Err(e) => return Err(e),
            }
        }
        Ok(())
    }

    pub fn transport_mut(&mut self) -> &mut T {
        &mut self.transport
    }

    pub fn into_inner(self) -> T {
        self.transport
    }
}

pub type ClientSocket = WebSocketTransport<MaybeTlsStream<TcpStream>>;

/// Dials `ws://<address>` and wraps the socket as a [`Connection`].
pub async fn connect_websocket(address: &str) -> Result<Connection<ClientSocket>, TransportError> {
    let url = Url::parse(&format!("ws://{}", address))?;
    let (ws_stream, _) = connect_async(url.as_str()).await?;
    tracing::debug!(%url, "connected");
    Ok(Connection::new(WebSocketTransport::new(ws_stream)))
}
