//! Transport seam: a single bidirectional text-message stream.
//!
//! The session loop only ever sees [`Connector`] and the split
//! [`TransportSink`] / [`TransportStream`] halves; the production
//! implementation speaks WebSocket via tokio-tungstenite, tests inject
//! scripted transports.

use async_trait::async_trait;
use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use std::time::Duration;
use tokio::net::TcpStream;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};
use tracing::{debug, info};
use url::Url;

use crate::error::{DbError, Result};

const CONNECT_TIMEOUT_SECS: u64 = 10;

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// Write half of a live connection.
#[async_trait]
pub trait TransportSink: Send {
    /// Send one text frame.
    async fn send(&mut self, text: String) -> Result<()>;

    /// Keepalive probe; default is a no-op for transports without one.
    async fn ping(&mut self) -> Result<()> {
        Ok(())
    }

    async fn close(&mut self);

    fn is_open(&self) -> bool;
}

/// Read half of a live connection.
#[async_trait]
pub trait TransportStream: Send {
    /// Receive the next text frame. `None` means the peer closed the
    /// connection normally.
    async fn recv(&mut self) -> Option<Result<String>>;
}

/// Dials new connections; the reconnect loop calls this per attempt.
#[async_trait]
pub trait Connector: Send + Sync {
    async fn connect(
        &self,
        url: &str,
    ) -> Result<(Box<dyn TransportSink>, Box<dyn TransportStream>)>;
}

/// Production WebSocket connector.
#[derive(Debug, Default)]
pub struct WsConnector;

#[async_trait]
impl Connector for WsConnector {
    async fn connect(
        &self,
        url: &str,
    ) -> Result<(Box<dyn TransportSink>, Box<dyn TransportStream>)> {
        let url =
            Url::parse(url).map_err(|e| DbError::Transport(format!("invalid session URL: {e}")))?;

        info!(%url, "connecting session transport");
        let (stream, _) = tokio::time::timeout(
            Duration::from_secs(CONNECT_TIMEOUT_SECS),
            connect_async(url.as_str()),
        )
        .await
        .map_err(|_| DbError::Transport("WebSocket connection timeout".to_string()))??;

        let (write, read) = stream.split();
        Ok((
            Box::new(WsSink {
                write,
                open: true,
            }),
            Box::new(WsStreamHalf { read }),
        ))
    }
}

struct WsSink {
    write: SplitSink<WsStream, Message>,
    open: bool,
}

#[async_trait]
impl TransportSink for WsSink {
    async fn send(&mut self, text: String) -> Result<()> {
        self.write.send(Message::Text(text)).await.map_err(|e| {
            self.open = false;
            DbError::WebSocket(e)
        })
    }

    async fn ping(&mut self) -> Result<()> {
        self.write.send(Message::Ping(Vec::new())).await.map_err(|e| {
            self.open = false;
            DbError::WebSocket(e)
        })
    }

    async fn close(&mut self) {
        let _ = self.write.send(Message::Close(None)).await;
        let _ = self.write.flush().await;
        self.open = false;
    }

    fn is_open(&self) -> bool {
        self.open
    }
}

struct WsStreamHalf {
    read: SplitStream<WsStream>,
}

#[async_trait]
impl TransportStream for WsStreamHalf {
    async fn recv(&mut self) -> Option<Result<String>> {
        loop {
            match self.read.next().await {
                Some(Ok(Message::Text(text))) => return Some(Ok(text)),
                // tungstenite queues the pong internally; it flushes with
                // the next outbound write
                Some(Ok(Message::Ping(_))) => debug!("received ping"),
                Some(Ok(Message::Pong(_))) => debug!("received pong"),
                Some(Ok(Message::Close(_))) => {
                    info!("received close frame");
                    return None;
                }
                Some(Ok(_)) => {}
                Some(Err(e)) => return Some(Err(e.into())),
                None => return None,
            }
        }
    }
}
