use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, Weak};
use std::time::Duration;

use futures::future::{BoxFuture, FutureExt, Shared};
use serde::Serialize;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};

use super::stomp::{self, StompFrame};
use super::{Connector, Link, WebSocketConnector};
use crate::config::TransportConfig;
use crate::errors::RelayError;

type PendingConnect = Shared<BoxFuture<'static, Result<(), RelayError>>>;

struct Route {
    topic: String,
    tx: mpsc::Sender<String>,
}

#[derive(Default)]
struct State {
    /// Present exactly while a STOMP session is established
    outbound: Option<mpsc::Sender<String>>,
    pending: Option<PendingConnect>,
    driver: Option<JoinHandle<()>>,
    reconnect: Option<JoinHandle<()>>,
    routes: HashMap<String, Route>,
    /// Bumped on every new link and every explicit disconnect
    epoch: u64,
}

struct Inner {
    connector: Arc<dyn Connector>,
    config: TransportConfig,
    state: Mutex<State>,
    next_sub: AtomicU64,
    connected: watch::Sender<bool>,
}

/// Shared handle to the single relay connection of a client.
///
/// Cloning is cheap and every clone drives the same socket.
#[derive(Clone)]
pub struct Connection {
    inner: Arc<Inner>,
}

impl Connection {
    pub fn new(connector: Arc<dyn Connector>, config: TransportConfig) -> Self {
        let (connected, _) = watch::channel(false);
        Self {
            inner: Arc::new(Inner {
                connector,
                config,
                state: Mutex::new(State::default()),
                next_sub: AtomicU64::new(0),
                connected,
            }),
        }
    }

    /// Connection over a real WebSocket to `config.url`
    pub fn websocket(config: TransportConfig) -> Result<Self, RelayError> {
        let connector = WebSocketConnector::from_config(&config)?;
        Ok(Self::new(Arc::new(connector), config))
    }

    /// Establish the STOMP session if it is not up yet.
    ///
    /// Concurrent callers share one in-flight attempt and observe the same
    /// outcome; at most one socket is opened for them.
    pub async fn connect(&self) -> Result<(), RelayError> {
        let attempt = {
            let mut state = self.inner.lock();
            if state.outbound.is_some() {
                return Ok(());
            }
            match &state.pending {
                Some(pending) => pending.clone(),
                None => {
                    let inner = Arc::clone(&self.inner);
                    let attempt = Inner::establish(inner).boxed().shared();
                    state.pending = Some(attempt.clone());
                    attempt
                }
            }
        };
        attempt.await
    }

    /// Tear the session down and drop every subscription.
    ///
    /// Cancels any pending reconnect; receivers of existing subscriptions
    /// observe end-of-stream.
    pub async fn disconnect(&self) {
        let outbound = {
            let mut state = self.inner.lock();
            state.epoch += 1;
            state.pending = None;
            if let Some(task) = state.reconnect.take() {
                task.abort();
            }
            if let Some(task) = state.driver.take() {
                task.abort();
            }
            state.routes.clear();
            state.outbound.take()
        };

        if let Some(outbound) = outbound {
            let bye = StompFrame::new(stomp::DISCONNECT).with_header("receipt", "disconnect");
            let _ = outbound.send(bye.encode()).await;
            log::info!("Disconnected from relay");
        }
        self.inner.connected.send_replace(false);
    }

    pub fn is_connected(&self) -> bool {
        self.inner.lock().outbound.is_some()
    }

    /// Connectivity-changed signal; `true` while the session is up
    pub fn connectivity(&self) -> watch::Receiver<bool> {
        self.inner.connected.subscribe()
    }

    /// Number of live subscriptions (survives reconnects)
    pub fn subscription_count(&self) -> usize {
        self.inner.lock().routes.len()
    }

    /// Publish `payload` as JSON. Fails fast when not connected.
    pub async fn publish<T: Serialize + ?Sized>(
        &self,
        destination: &str,
        payload: &T,
    ) -> Result<(), RelayError> {
        let body = serde_json::to_string(payload)
            .map_err(|e| RelayError::Encoding(format!("serialize payload: {}", e)))?;
        self.publish_raw(destination, body).await
    }

    pub async fn publish_raw(&self, destination: &str, body: String) -> Result<(), RelayError> {
        let outbound = self.inner.lock().outbound.clone();
        let Some(outbound) = outbound else {
            log::warn!("Dropping publish to {}: not connected", destination);
            return Err(RelayError::NotConnected);
        };
        outbound
            .send(StompFrame::send_json(destination, body).encode())
            .await
            .map_err(|_| RelayError::NotConnected)
    }

    /// Subscribe to `topic`. Fails fast when not connected.
    pub async fn subscribe(&self, topic: &str) -> Result<Subscription, RelayError> {
        let id = format!("sub-{}", self.inner.next_sub.fetch_add(1, Ordering::Relaxed));
        let (tx, rx) = mpsc::channel(self.inner.config.subscription_queue.max(1));

        let outbound = {
            let mut state = self.inner.lock();
            let outbound = state.outbound.clone().ok_or(RelayError::NotConnected)?;
            state.routes.insert(
                id.clone(),
                Route {
                    topic: topic.to_string(),
                    tx,
                },
            );
            outbound
        };

        if outbound
            .send(StompFrame::subscribe(&id, topic).encode())
            .await
            .is_err()
        {
            self.inner.lock().routes.remove(&id);
            return Err(RelayError::NotConnected);
        }

        log::debug!("Subscribed {} to {}", id, topic);
        Ok(Subscription {
            handle: SubscriptionHandle {
                id,
                topic: topic.to_string(),
                conn: Arc::downgrade(&self.inner),
                released: false,
            },
            rx,
        })
    }
}

impl Inner {
    fn lock(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    async fn establish(self: Arc<Self>) -> Result<(), RelayError> {
        let started_at = self.lock().epoch;
        let result = self.handshake().await;

        let (outbound, inbound, heartbeat) = match result {
            Ok(link) => link,
            Err(e) => {
                let mut state = self.lock();
                if state.epoch == started_at {
                    state.pending = None;
                }
                log::warn!("Relay connection failed: {}", e);
                return Err(e);
            }
        };

        let resubscribe: Vec<(String, String)> = {
            let state = self.lock();
            if state.epoch != started_at {
                return Err(RelayError::Transport(
                    "connection attempt cancelled by disconnect".to_string(),
                ));
            }
            state
                .routes
                .iter()
                .map(|(id, route)| (id.clone(), route.topic.clone()))
                .collect()
        };
        for (id, topic) in &resubscribe {
            if outbound
                .send(StompFrame::subscribe(id, topic).encode())
                .await
                .is_err()
            {
                log::warn!("Socket closed while restoring {} ({})", id, topic);
            }
        }
        if !resubscribe.is_empty() {
            log::info!("Restored {} subscription(s)", resubscribe.len());
        }

        let mut state = self.lock();
        if state.epoch != started_at {
            return Err(RelayError::Transport(
                "connection attempt cancelled by disconnect".to_string(),
            ));
        }
        state.epoch += 1;
        state.pending = None;
        state.outbound = Some(outbound.clone());
        // A running reconnect loop ends on its own once this attempt resolves
        drop(state.reconnect.take());
        state.driver = Some(tokio::spawn(drive(
            Arc::downgrade(&self),
            state.epoch,
            outbound,
            inbound,
            heartbeat,
        )));
        drop(state);

        self.connected.send_replace(true);
        log::info!(
            "Connected to relay (heartbeat out {} ms, in {} ms)",
            heartbeat.0,
            heartbeat.1
        );
        Ok(())
    }

    async fn handshake(
        &self,
    ) -> Result<(mpsc::Sender<String>, mpsc::Receiver<String>, (u64, u64)), RelayError> {
        let timeout = self.config.connect_timeout();
        let client_heartbeat = (
            self.config.heartbeat_outgoing_ms,
            self.config.heartbeat_incoming_ms,
        );

        let handshake = async {
            let Link {
                outbound,
                mut inbound,
            } = self.connector.open().await?;

            outbound
                .send(StompFrame::connect(&self.connector.host(), client_heartbeat).encode())
                .await
                .map_err(|_| RelayError::Transport("socket closed during handshake".into()))?;

            loop {
                let raw = inbound.recv().await.ok_or_else(|| {
                    RelayError::Transport("socket closed before CONNECTED".into())
                })?;
                let Some(frame) = StompFrame::decode(&raw)? else {
                    continue;
                };
                match frame.command.as_str() {
                    stomp::CONNECTED => {
                        let heartbeat = stomp::negotiate_heartbeat(
                            client_heartbeat,
                            frame.header("heart-beat"),
                        );
                        return Ok((outbound, inbound, heartbeat));
                    }
                    stomp::ERROR => {
                        let detail = frame.header("message").unwrap_or(&frame.body).to_string();
                        return Err(RelayError::Transport(format!(
                            "relay rejected CONNECT: {}",
                            detail
                        )));
                    }
                    other => log::debug!("Ignoring {} before CONNECTED", other),
                }
            }
        };

        tokio::time::timeout(timeout, handshake).await.map_err(|_| {
            RelayError::Transport(format!(
                "STOMP handshake timed out after {:?}; check that the backend is reachable",
                timeout
            ))
        })?
    }

    fn dispatch(&self, frame: StompFrame) {
        match frame.command.as_str() {
            stomp::MESSAGE => {
                let Some(id) = frame.header("subscription").map(str::to_string) else {
                    log::debug!("MESSAGE without subscription header dropped");
                    return;
                };
                let state = self.lock();
                let Some(route) = state.routes.get(&id) else {
                    log::debug!("MESSAGE for released subscription {} dropped", id);
                    return;
                };
                match route.tx.try_send(frame.body) {
                    Ok(()) => {}
                    Err(mpsc::error::TrySendError::Full(_)) => {
                        log::warn!("Subscription {} ({}) is full, dropping message", id, route.topic)
                    }
                    Err(mpsc::error::TrySendError::Closed(_)) => {
                        log::debug!("Subscription {} receiver is gone", id)
                    }
                }
            }
            stomp::RECEIPT => log::debug!("Receipt {:?}", frame.header("receipt-id")),
            other => log::debug!("Ignoring {} frame", other),
        }
    }

    fn on_link_lost(self: &Arc<Self>, epoch: u64, reason: &str) {
        let mut state = self.lock();
        if state.epoch != epoch {
            return;
        }
        state.outbound = None;
        state.pending = None;
        state.driver = None;
        log::warn!("Relay connection lost: {}", reason);

        if self.config.auto_reconnect && state.reconnect.is_none() {
            state.reconnect = Some(tokio::spawn(reconnect_loop(Arc::downgrade(self))));
        }
        drop(state);
        self.connected.send_replace(false);
    }

    fn release(&self, id: &str) -> Option<mpsc::Sender<String>> {
        let mut state = self.lock();
        state.routes.remove(id)?;
        state.outbound.clone()
    }
}

impl Drop for Inner {
    fn drop(&mut self) {
        let state = self.state.get_mut().unwrap_or_else(|p| p.into_inner());
        if let Some(task) = state.driver.take() {
            task.abort();
        }
        if let Some(task) = state.reconnect.take() {
            task.abort();
        }
    }
}

/// Owns the live link: routes inbound frames, sends heartbeats and watches
/// for silence.
async fn drive(
    weak: Weak<Inner>,
    epoch: u64,
    outbound: mpsc::Sender<String>,
    mut inbound: mpsc::Receiver<String>,
    heartbeat: (u64, u64),
) {
    let send_every = (heartbeat.0 > 0).then(|| Duration::from_millis(heartbeat.0));
    // Liveness allows one missed heartbeat
    let silence_limit = (heartbeat.1 > 0).then(|| Duration::from_millis(heartbeat.1 * 2));

    let mut beat = tokio::time::interval(send_every.unwrap_or(Duration::from_secs(3600)));
    beat.set_missed_tick_behavior(MissedTickBehavior::Delay);
    beat.tick().await;
    let mut last_inbound = Instant::now();

    let reason = loop {
        let deadline = silence_limit.map(|limit| last_inbound + limit);
        tokio::select! {
            raw = inbound.recv() => {
                let Some(raw) = raw else {
                    break "socket closed";
                };
                last_inbound = Instant::now();
                let Some(inner) = weak.upgrade() else {
                    return;
                };
                match StompFrame::decode(&raw) {
                    Ok(Some(frame)) if frame.command == stomp::ERROR => {
                        log::error!(
                            "Relay error: {}",
                            frame.header("message").unwrap_or(&frame.body)
                        );
                        break "relay sent ERROR";
                    }
                    Ok(Some(frame)) => inner.dispatch(frame),
                    Ok(None) => {}
                    Err(e) => log::warn!("Malformed frame from relay: {}", e),
                }
            }
            _ = beat.tick(), if send_every.is_some() => {
                if outbound.send(stomp::HEARTBEAT.to_string()).await.is_err() {
                    break "socket writer closed";
                }
            }
            _ = tokio::time::sleep_until(deadline.unwrap_or_else(Instant::now)), if deadline.is_some() => {
                break "heartbeat timeout";
            }
        }
    };

    if let Some(inner) = weak.upgrade() {
        inner.on_link_lost(epoch, reason);
    }
}

async fn reconnect_loop(weak: Weak<Inner>) {
    let mut attempt = 0u32;
    loop {
        let Some(delay) = weak.upgrade().map(|inner| inner.config.reconnect_delay()) else {
            return;
        };
        tokio::time::sleep(delay).await;

        let Some(inner) = weak.upgrade() else {
            return;
        };
        attempt += 1;
        let conn = Connection { inner };
        match conn.connect().await {
            Ok(()) => {
                log::info!("Reconnected to relay after {} attempt(s)", attempt);
                return;
            }
            Err(e) => log::warn!("Reconnect attempt {} failed: {}", attempt, e),
        }
    }
}

/// A live subscription: the routing handle plus its delivery queue
pub struct Subscription {
    handle: SubscriptionHandle,
    rx: mpsc::Receiver<String>,
}

impl Subscription {
    pub fn id(&self) -> &str {
        &self.handle.id
    }

    pub fn topic(&self) -> &str {
        &self.handle.topic
    }

    /// Next message body; `None` once the subscription was released or the
    /// connection was explicitly disconnected
    pub async fn recv(&mut self) -> Option<String> {
        self.rx.recv().await
    }

    pub async fn unsubscribe(self) -> Result<(), RelayError> {
        self.handle.unsubscribe().await
    }

    /// Separate the handle from the queue so a consumer task can own the
    /// queue while the caller keeps the handle
    pub fn split(self) -> (SubscriptionHandle, mpsc::Receiver<String>) {
        (self.handle, self.rx)
    }
}

/// Releases the server-side subscription on `unsubscribe` or drop
pub struct SubscriptionHandle {
    id: String,
    topic: String,
    conn: Weak<Inner>,
    released: bool,
}

impl SubscriptionHandle {
    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn topic(&self) -> &str {
        &self.topic
    }

    /// Remove the route and send UNSUBSCRIBE.
    ///
    /// Errors when the handle was already torn down with its connection or
    /// when the socket is gone; the local route is removed either way.
    pub async fn unsubscribe(mut self) -> Result<(), RelayError> {
        self.released = true;
        let inner = self.conn.upgrade().ok_or(RelayError::NotConnected)?;
        let released = {
            let mut state = inner.lock();
            match state.routes.remove(&self.id) {
                Some(_) => Some(state.outbound.clone()),
                None => None,
            }
        };
        let outbound = match released {
            Some(Some(outbound)) => outbound,
            Some(None) => return Err(RelayError::NotConnected),
            None => {
                return Err(RelayError::Transport(format!(
                    "subscription {} is already closed",
                    self.id
                )))
            }
        };
        outbound
            .send(StompFrame::unsubscribe(&self.id).encode())
            .await
            .map_err(|_| RelayError::NotConnected)?;
        log::debug!("Unsubscribed {} from {}", self.id, self.topic);
        Ok(())
    }
}

impl Drop for SubscriptionHandle {
    fn drop(&mut self) {
        if self.released {
            return;
        }
        if let Some(outbound) = self.conn.upgrade().and_then(|inner| inner.release(&self.id)) {
            let _ = outbound.try_send(StompFrame::unsubscribe(&self.id).encode());
        }
    }
}
