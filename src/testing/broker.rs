//! In-process STOMP relay
//!
//! Behaves like the backend's simple broker: `SEND` to an `/app/...`
//! destination is rebroadcast as `MESSAGE` to every subscriber of the
//! matching `/topic/...`. Counters make socket and subscription churn
//! observable from tests.

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, Weak};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use crate::errors::RelayError;
use crate::topics;
use crate::transport::stomp::{self, StompFrame};
use crate::transport::{Connector, Link};

const PEER_QUEUE: usize = 256;

struct Peer {
    tx: mpsc::Sender<String>,
    task: JoinHandle<()>,
}

struct BrokerSubscription {
    peer: u64,
    id: String,
    destination: String,
}

#[derive(Default)]
struct BrokerState {
    next_peer: u64,
    next_message: u64,
    peers: HashMap<u64, Peer>,
    subscriptions: Vec<BrokerSubscription>,
    published: Vec<(String, String)>,
    heartbeat_ms: u64,
    silent: bool,
    refuse: bool,
    open_delay: Duration,
}

#[derive(Default)]
struct BrokerInner {
    state: Mutex<BrokerState>,
    opened: AtomicUsize,
    subscribes: AtomicUsize,
    unsubscribes: AtomicUsize,
}

impl BrokerInner {
    fn lock(&self) -> MutexGuard<'_, BrokerState> {
        self.state.lock().unwrap_or_else(|p| p.into_inner())
    }
}

/// Loopback relay implementing [`Connector`]; clones share one broker
#[derive(Clone, Default)]
pub struct LoopbackBroker {
    inner: Arc<BrokerInner>,
}

impl LoopbackBroker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Advertise (and send) server heartbeats every `ms` milliseconds
    pub fn with_heartbeat(self, ms: u64) -> Self {
        self.inner.lock().heartbeat_ms = ms;
        self
    }

    /// Delay every socket open, to widen connect races
    pub fn with_open_delay(self, delay: Duration) -> Self {
        self.inner.lock().open_delay = delay;
        self
    }

    /// Keep advertising heartbeats but stop sending them (half-open link)
    pub fn set_silent(&self, silent: bool) {
        self.inner.lock().silent = silent;
    }

    /// Refuse new sockets, as if the backend were down
    pub fn set_refusing(&self, refuse: bool) {
        self.inner.lock().refuse = refuse;
    }

    /// Sockets successfully opened so far
    pub fn connections_opened(&self) -> usize {
        self.inner.opened.load(Ordering::SeqCst)
    }

    pub fn live_connections(&self) -> usize {
        self.inner.lock().peers.len()
    }

    pub fn subscribe_frames(&self) -> usize {
        self.inner.subscribes.load(Ordering::SeqCst)
    }

    pub fn unsubscribe_frames(&self) -> usize {
        self.inner.unsubscribes.load(Ordering::SeqCst)
    }

    /// Destinations with at least one live subscriber
    pub fn subscribed_destinations(&self) -> Vec<String> {
        let state = self.inner.lock();
        let mut destinations: Vec<String> = state
            .subscriptions
            .iter()
            .map(|s| s.destination.clone())
            .collect();
        destinations.sort();
        destinations.dedup();
        destinations
    }

    /// Bodies clients sent to `destination`, oldest first
    pub fn sent_to(&self, destination: &str) -> Vec<String> {
        self.inner
            .lock()
            .published
            .iter()
            .filter(|(d, _)| d == destination)
            .map(|(_, body)| body.clone())
            .collect()
    }

    /// Push a server-originated message to subscribers of `topic`
    pub fn publish(&self, topic: &str, body: &str) {
        deliver(&self.inner, topic, body);
    }

    /// Kill every socket without a DISCONNECT, as a network failure would
    pub fn drop_connections(&self) {
        let mut state = self.inner.lock();
        for (_, peer) in state.peers.drain() {
            peer.task.abort();
        }
        state.subscriptions.clear();
    }
}

#[async_trait]
impl Connector for LoopbackBroker {
    async fn open(&self) -> Result<Link, RelayError> {
        let (delay, refuse) = {
            let state = self.inner.lock();
            (state.open_delay, state.refuse)
        };
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }
        if refuse {
            return Err(RelayError::Transport("connection refused".to_string()));
        }

        let (client_tx, client_rx) = mpsc::channel::<String>(PEER_QUEUE);
        let (server_tx, server_rx) = mpsc::channel::<String>(PEER_QUEUE);

        let mut state = self.inner.lock();
        let peer_id = state.next_peer;
        state.next_peer += 1;
        let task = tokio::spawn(serve_peer(
            Arc::downgrade(&self.inner),
            peer_id,
            client_rx,
            server_tx.clone(),
        ));
        state.peers.insert(
            peer_id,
            Peer {
                tx: server_tx,
                task,
            },
        );
        drop(state);

        self.inner.opened.fetch_add(1, Ordering::SeqCst);
        Ok(Link {
            outbound: client_tx,
            inbound: server_rx,
        })
    }
}

async fn serve_peer(
    weak: Weak<BrokerInner>,
    peer_id: u64,
    mut from_client: mpsc::Receiver<String>,
    to_client: mpsc::Sender<String>,
) {
    let mut heartbeat: Option<tokio::time::Interval> = None;

    loop {
        tokio::select! {
            raw = from_client.recv() => {
                let Some(raw) = raw else { break };
                let Some(inner) = weak.upgrade() else { return };
                let frame = match StompFrame::decode(&raw) {
                    Ok(Some(frame)) => frame,
                    Ok(None) => continue,
                    Err(e) => {
                        log::debug!("Loopback broker ignoring malformed frame: {}", e);
                        continue;
                    }
                };
                match frame.command.as_str() {
                    stomp::CONNECT => {
                        let ms = inner.lock().heartbeat_ms;
                        let connected = StompFrame::new(stomp::CONNECTED)
                            .with_header("version", "1.2")
                            .with_header("heart-beat", format!("{},{}", ms, ms));
                        if to_client.send(connected.encode()).await.is_err() {
                            break;
                        }
                        if ms > 0 {
                            heartbeat = Some(tokio::time::interval(Duration::from_millis(ms)));
                        }
                    }
                    stomp::SUBSCRIBE => {
                        let (Some(id), Some(destination)) =
                            (frame.header("id"), frame.header("destination"))
                        else {
                            continue;
                        };
                        inner.subscribes.fetch_add(1, Ordering::SeqCst);
                        inner.lock().subscriptions.push(BrokerSubscription {
                            peer: peer_id,
                            id: id.to_string(),
                            destination: destination.to_string(),
                        });
                    }
                    stomp::UNSUBSCRIBE => {
                        let Some(id) = frame.header("id") else { continue };
                        inner.unsubscribes.fetch_add(1, Ordering::SeqCst);
                        inner
                            .lock()
                            .subscriptions
                            .retain(|s| !(s.peer == peer_id && s.id == id));
                    }
                    stomp::SEND => {
                        let Some(destination) = frame.header("destination") else { continue };
                        inner
                            .lock()
                            .published
                            .push((destination.to_string(), frame.body.clone()));
                        if let Some(topic) = topics::broadcast_topic_for(destination) {
                            deliver(&inner, &topic, &frame.body);
                        }
                    }
                    stomp::DISCONNECT => {
                        if let Some(receipt) = frame.header("receipt") {
                            let reply = StompFrame::new(stomp::RECEIPT).with_header("receipt-id", receipt);
                            let _ = to_client.send(reply.encode()).await;
                        }
                        break;
                    }
                    _ => {}
                }
            }
            _ = async {
                match heartbeat.as_mut() {
                    Some(interval) => { interval.tick().await; }
                    None => std::future::pending::<()>().await,
                }
            } => {
                let silent = weak.upgrade().map(|inner| inner.lock().silent).unwrap_or(true);
                if !silent && to_client.send(stomp::HEARTBEAT.to_string()).await.is_err() {
                    break;
                }
            }
        }
    }

    if let Some(inner) = weak.upgrade() {
        let mut state = inner.lock();
        state.peers.remove(&peer_id);
        state.subscriptions.retain(|s| s.peer != peer_id);
    }
}

fn deliver(inner: &BrokerInner, topic: &str, body: &str) {
    let mut state = inner.lock();
    let targets: Vec<(mpsc::Sender<String>, String)> = state
        .subscriptions
        .iter()
        .filter(|s| s.destination == topic)
        .filter_map(|s| state.peers.get(&s.peer).map(|p| (p.tx.clone(), s.id.clone())))
        .collect();

    for (tx, subscription) in targets {
        let message_id = state.next_message;
        state.next_message += 1;
        let message = StompFrame::new(stomp::MESSAGE)
            .with_header("destination", topic)
            .with_header("subscription", subscription)
            .with_header("message-id", message_id.to_string())
            .with_header("content-type", "application/json")
            .with_body(body);
        if tx.try_send(message.encode()).is_err() {
            log::debug!("Loopback broker dropped a message for {}", topic);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_broker_answers_connect() {
        let broker = LoopbackBroker::new().with_heartbeat(1000);
        let mut link = broker.open().await.unwrap();
        link.outbound
            .send(StompFrame::connect("localhost", (0, 0)).encode())
            .await
            .unwrap();
        let reply = link.inbound.recv().await.unwrap();
        let frame = StompFrame::decode(&reply).unwrap().unwrap();
        assert_eq!(frame.command, stomp::CONNECTED);
        assert_eq!(frame.header("heart-beat"), Some("1000,1000"));
        assert_eq!(broker.connections_opened(), 1);
    }

    #[tokio::test]
    async fn test_refusing_broker_fails_open() {
        let broker = LoopbackBroker::new();
        broker.set_refusing(true);
        assert!(broker.open().await.is_err());
        assert_eq!(broker.connections_opened(), 0);
    }
}
