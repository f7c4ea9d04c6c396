//! Transport connection to the pub/sub relay
//!
//! The relay speaks STOMP over a WebSocket. A [`Connector`] opens the raw
//! text link; [`Connection`] layers the STOMP session on top of it: one
//! memoized connection attempt, heartbeats, subscription routing and
//! auto-reconnect.

mod connection;
pub mod stomp;
mod websocket;

use async_trait::async_trait;
use tokio::sync::mpsc;

use crate::errors::RelayError;

pub use connection::{Connection, Subscription, SubscriptionHandle};
pub use stomp::StompFrame;
pub use websocket::WebSocketConnector;

/// A raw, bidirectional text link to the relay.
///
/// `inbound` yields `None` once the peer closed the socket; dropping
/// `outbound` closes it from our side.
pub struct Link {
    pub outbound: mpsc::Sender<String>,
    pub inbound: mpsc::Receiver<String>,
}

/// Opens raw links. Each successful `open` is one socket.
#[async_trait]
pub trait Connector: Send + Sync {
    async fn open(&self) -> Result<Link, RelayError>;

    /// Value for the STOMP `host` header
    fn host(&self) -> String {
        "localhost".to_string()
    }
}
