//! Socket seam between the channel driver and the websocket client.

use async_trait::async_trait;
use futures::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_tungstenite::tungstenite::protocol::CloseFrame;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};
use tracing::trace;
use url::Url;

use crate::SyncError;

/// The frames the channel cares about. Control frames stay in the transport.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Frame {
    Text(String),
    /// `None` when the peer closed without a status code.
    Close(Option<u16>),
}

#[async_trait]
pub trait SocketConnection: Send {
    async fn send(&mut self, frame: Frame) -> Result<(), SyncError>;
    /// `None` once the stream ended without a close frame.
    async fn recv(&mut self) -> Option<Result<Frame, SyncError>>;
}

#[async_trait]
pub trait Connector: Send + Sync {
    async fn connect(&self, url: &Url) -> Result<Box<dyn SocketConnection>, SyncError>;
}

#[derive(Debug, Default, Clone, Copy)]
pub struct WsConnector;

#[async_trait]
impl Connector for WsConnector {
    async fn connect(&self, url: &Url) -> Result<Box<dyn SocketConnection>, SyncError> {
        let (stream, response) = tokio_tungstenite::connect_async(url.as_str()).await?;
        trace!(status = %response.status(), "websocket handshake complete");
        Ok(Box::new(WsSocket { stream }))
    }
}

struct WsSocket {
    stream: WebSocketStream<MaybeTlsStream<TcpStream>>,
}

#[async_trait]
impl SocketConnection for WsSocket {
    async fn send(&mut self, frame: Frame) -> Result<(), SyncError> {
        let message = match frame {
            Frame::Text(text) => Message::Text(text),
            Frame::Close(code) => Message::Close(code.map(|code| CloseFrame {
                code: CloseCode::from(code),
                reason: "".into(),
            })),
        };
        self.stream.send(message).await?;
        Ok(())
    }

    async fn recv(&mut self) -> Option<Result<Frame, SyncError>> {
        loop {
            let message = match self.stream.next().await? {
                Ok(message) => message,
                Err(err) => return Some(Err(err.into())),
            };
            match message {
                Message::Text(text) => return Some(Ok(Frame::Text(text))),
                Message::Binary(data) => match String::from_utf8(data) {
                    Ok(text) => return Some(Ok(Frame::Text(text))),
                    Err(_) => trace!("dropping non-utf8 binary frame"),
                },
                Message::Close(frame) => {
                    return Some(Ok(Frame::Close(frame.map(|f| u16::from(f.code)))))
                }
                Message::Ping(_) | Message::Pong(_) | Message::Frame(_) => {}
            }
        }
    }
}
