use std::time::Duration;

use async_trait::async_trait;
use futures::{SinkExt, StreamExt};
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::{client::IntoClientRequest, Message};
use url::Url;

use super::{Connector, Link};
use crate::errors::RelayError;

const WS_SEND_TIMEOUT: Duration = Duration::from_secs(3);
const LINK_QUEUE: usize = 256;

/// Opens STOMP links over a plain WebSocket
pub struct WebSocketConnector {
    url: Url,
    connect_timeout: Duration,
}

impl WebSocketConnector {
    pub fn new(url: &str, connect_timeout: Duration) -> Result<Self, RelayError> {
        let url = Url::parse(url)
            .map_err(|e| RelayError::Config(format!("invalid relay URL {}: {}", url, e)))?;
        match url.scheme() {
            "ws" | "wss" => Ok(Self {
                url,
                connect_timeout,
            }),
            other => Err(RelayError::Config(format!(
                "relay URL must use ws:// or wss://, got {}://",
                other
            ))),
        }
    }

    pub fn from_config(config: &crate::config::TransportConfig) -> Result<Self, RelayError> {
        Self::new(&config.url, config.connect_timeout())
    }
}

#[async_trait]
impl Connector for WebSocketConnector {
    async fn open(&self) -> Result<Link, RelayError> {
        let mut req = self
            .url
            .as_str()
            .into_client_request()
            .map_err(|e| RelayError::Transport(format!("build websocket request: {}", e)))?;
        req.headers_mut().insert(
            "Sec-WebSocket-Protocol",
            "v12.stomp"
                .parse()
                .map_err(|_| RelayError::Transport("invalid protocol header".into()))?,
        );

        let (ws, _resp) = tokio::time::timeout(self.connect_timeout, tokio_tungstenite::connect_async(req))
            .await
            .map_err(|_| {
                RelayError::Transport(format!(
                    "connecting to {} timed out; check that the backend is reachable",
                    self.url
                ))
            })?
            .map_err(|e| RelayError::Transport(format!("connect {}: {}", self.url, e)))?;

        log::debug!("WebSocket open to {}", self.url);
        let (mut ws_write, mut ws_read) = ws.split();

        let (out_tx, mut out_rx) = mpsc::channel::<String>(LINK_QUEUE);
        let (in_tx, in_rx) = mpsc::channel::<String>(LINK_QUEUE);
        let (pong_tx, mut pong_rx) = mpsc::channel::<Message>(8);

        // Writer: ends when every outbound sender is gone or a write stalls
        tokio::spawn(async move {
            loop {
                let msg = tokio::select! {
                    biased;
                    pong = pong_rx.recv() => match pong {
                        Some(p) => p,
                        None => continue,
                    },
                    text = out_rx.recv() => match text {
                        Some(t) => Message::Text(t.into()),
                        None => break,
                    },
                };
                let res = tokio::time::timeout(WS_SEND_TIMEOUT, ws_write.send(msg)).await;
                if !matches!(res, Ok(Ok(()))) {
                    log::warn!("WebSocket write failed; closing link");
                    break;
                }
            }
            let _ = ws_write.send(Message::Close(None)).await;
        });

        // Reader: dropping `in_tx` signals closure to the connection driver
        tokio::spawn(async move {
            while let Some(msg) = ws_read.next().await {
                let text = match msg {
                    Ok(Message::Text(t)) => t.to_string(),
                    Ok(Message::Binary(b)) => String::from_utf8_lossy(&b).to_string(),
                    Ok(Message::Ping(p)) => {
                        if pong_tx.try_send(Message::Pong(p)).is_err() {
                            break;
                        }
                        continue;
                    }
                    Ok(Message::Close(_)) => break,
                    Ok(_) => continue,
                    Err(e) => {
                        log::warn!("WebSocket read failed: {}", e);
                        break;
                    }
                };
                if in_tx.send(text).await.is_err() {
                    break;
                }
            }
        });

        Ok(Link {
            outbound: out_tx,
            inbound: in_rx,
        })
    }

    fn host(&self) -> String {
        self.url.host_str().unwrap_or("localhost").to_string()
    }
}
