use {
    async_trait::async_trait,
    futures::{SinkExt, StreamExt},
    tokio::net::TcpStream,
    tokio_tungstenite::{
        MaybeTlsStream, WebSocketStream, connect_async,
        tungstenite::{
            Message,
            protocol::{CloseFrame, frame::coding::CloseCode},
        },
    },
    tracing::debug,
    url::Url,
};

use {crate::error::TransportError, tether_protocol::close_codes};

/// A frame read from the socket, reduced to what the driver acts on.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Frame {
    Text(String),
    Binary(Vec<u8>),
    /// The peer sent a close frame. The socket is finished.
    Close { code: u16, reason: String },
}

/// One open bidirectional connection.
///
/// `next` must be cancel-safe: the driver races it against timers and
/// commands.
#[async_trait]
pub trait Socket: Send {
    async fn send_text(&mut self, text: String) -> Result<(), TransportError>;

    /// The next frame, or `None` once the stream has ended without a close
    /// frame.
    async fn next(&mut self) -> Option<Result<Frame, TransportError>>;

    async fn close(&mut self, code: u16, reason: &str) -> Result<(), TransportError>;
}

/// Opens sockets. Swapped out in tests for an in-memory implementation.
#[async_trait]
pub trait Connector: Send + Sync {
    async fn connect(&self, url: &Url) -> Result<Box<dyn Socket>, TransportError>;
}

// ── tokio-tungstenite ───────────────────────────────────────────────────────

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// Connects with `tokio_tungstenite::connect_async` (TLS via rustls).
#[derive(Debug, Clone, Copy, Default)]
pub struct TungsteniteConnector;

#[async_trait]
impl Connector for TungsteniteConnector {
    async fn connect(&self, url: &Url) -> Result<Box<dyn Socket>, TransportError> {
        let (stream, response) = connect_async(url.as_str()).await?;
        debug!(url = %url, status = %response.status(), "websocket handshake complete");
        Ok(Box::new(WsSocket { inner: stream }))
    }
}

pub struct WsSocket {
    inner: WsStream,
}

#[async_trait]
impl Socket for WsSocket {
    async fn send_text(&mut self, text: String) -> Result<(), TransportError> {
        self.inner.send(Message::Text(text.into())).await?;
        Ok(())
    }

    async fn next(&mut self) -> Option<Result<Frame, TransportError>> {
        loop {
            let msg = match self.inner.next().await? {
                Ok(msg) => msg,
                Err(e) => return Some(Err(e.into())),
            };
            let frame = match msg {
                Message::Text(text) => Frame::Text(text.as_str().to_owned()),
                Message::Binary(bytes) => Frame::Binary(bytes.to_vec()),
                Message::Close(frame) => match frame {
                    Some(f) => Frame::Close {
                        code: u16::from(f.code),
                        reason: f.reason.as_str().to_owned(),
                    },
                    None => Frame::Close {
                        code: close_codes::NO_STATUS,
                        reason: String::new(),
                    },
                },
                // Protocol-level pings are answered by tungstenite itself.
                Message::Ping(_) | Message::Pong(_) | Message::Frame(_) => continue,
            };
            return Some(Ok(frame));
        }
    }

    async fn close(&mut self, code: u16, reason: &str) -> Result<(), TransportError> {
        let frame = CloseFrame {
            code: CloseCode::from(code),
            reason: reason.to_owned().into(),
        };
        match self.inner.close(Some(frame)).await {
            Ok(())
            | Err(
                tokio_tungstenite::tungstenite::Error::ConnectionClosed
                | tokio_tungstenite::tungstenite::Error::AlreadyClosed,
            ) => Ok(()),
            Err(e) => Err(e.into()),
        }
    }
}
