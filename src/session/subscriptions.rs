//! One active session per client
//!
//! [`SubscriptionManager`] owns the pair of subscriptions (frames and
//! commands) for the session a client is attached to. It is the only writer
//! of that state; everyone else reads the latest-value channels it exposes.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use tokio::sync::{broadcast, mpsc, watch, Mutex};
use tokio::task::JoinHandle;

use crate::errors::RelayError;
use crate::topics;
use crate::transport::{Connection, SubscriptionHandle};
use crate::types::{CommandPayload, FramePayload};

const COMMAND_BACKLOG: usize = 32;

/// A payload together with the session whose subscription delivered it
#[derive(Debug, Clone, PartialEq)]
pub struct SessionFrame {
    pub session_id: String,
    pub payload: FramePayload,
}

#[derive(Debug, Clone, PartialEq)]
pub struct SessionCommand {
    pub session_id: String,
    pub payload: CommandPayload,
}

struct Attachment {
    handle: SubscriptionHandle,
    consumer: JoinHandle<()>,
}

struct ActivePair {
    session_id: String,
    frames: Attachment,
    commands: Attachment,
}

/// Counters for subscription churn
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TransitionStats {
    pub setups: u64,
    pub teardowns: u64,
}

pub struct SubscriptionManager {
    conn: Connection,
    active: Mutex<Option<ActivePair>>,
    /// Bumped on every attach and detach; consumers drop deliveries from
    /// any generation but the current one
    generation: Arc<AtomicU64>,
    latest_frame: watch::Sender<Option<SessionFrame>>,
    latest_command: watch::Sender<Option<SessionCommand>>,
    commands: broadcast::Sender<SessionCommand>,
    active_id: watch::Sender<Option<String>>,
    setups: AtomicU64,
    teardowns: AtomicU64,
}

impl SubscriptionManager {
    pub fn new(conn: Connection) -> Self {
        let (latest_frame, _) = watch::channel(None);
        let (latest_command, _) = watch::channel(None);
        let (commands, _) = broadcast::channel(COMMAND_BACKLOG);
        let (active_id, _) = watch::channel(None);
        Self {
            conn,
            active: Mutex::new(None),
            generation: Arc::new(AtomicU64::new(0)),
            latest_frame,
            latest_command,
            commands,
            active_id,
            setups: AtomicU64::new(0),
            teardowns: AtomicU64::new(0),
        }
    }

    pub fn connection(&self) -> &Connection {
        &self.conn
    }

    /// Attach to `session_id`.
    ///
    /// Re-attaching to the active session is a no-op. Switching sessions
    /// fully detaches the old pair before the new one is opened, so the two
    /// are never live together.
    pub async fn subscribe_to_session(&self, session_id: &str) -> Result<(), RelayError> {
        self.conn.connect().await?;

        let mut active = self.active.lock().await;
        if active.as_ref().map(|a| a.session_id.as_str()) == Some(session_id) {
            log::debug!("Already attached to session {}", session_id);
            return Ok(());
        }

        if let Some(previous) = active.take() {
            self.detach(previous).await;
        }

        let generation = self.generation.fetch_add(1, Ordering::SeqCst) + 1;
        self.clear_cached();

        let frames = self
            .conn
            .subscribe(&topics::frame_topic(session_id))
            .await?;
        let commands = match self.conn.subscribe(&topics::command_topic(session_id)).await {
            Ok(sub) => sub,
            Err(e) => {
                if let Err(unsub) = frames.unsubscribe().await {
                    log::debug!("Rollback unsubscribe failed: {}", unsub);
                }
                return Err(e);
            }
        };

        let (frame_handle, frame_rx) = frames.split();
        let (command_handle, command_rx) = commands.split();

        let pair = ActivePair {
            session_id: session_id.to_string(),
            frames: Attachment {
                handle: frame_handle,
                consumer: tokio::spawn(consume_frames(
                    session_id.to_string(),
                    generation,
                    Arc::clone(&self.generation),
                    frame_rx,
                    self.latest_frame.clone(),
                )),
            },
            commands: Attachment {
                handle: command_handle,
                consumer: tokio::spawn(consume_commands(
                    session_id.to_string(),
                    generation,
                    Arc::clone(&self.generation),
                    command_rx,
                    self.latest_command.clone(),
                    self.commands.clone(),
                )),
            },
        };

        *active = Some(pair);
        self.setups.fetch_add(1, Ordering::SeqCst);
        self.active_id.send_replace(Some(session_id.to_string()));
        log::info!("Attached to session {}", session_id);
        Ok(())
    }

    /// Detach from the current session, if any. Never fails.
    pub async fn unsubscribe_from_current(&self) {
        let mut active = self.active.lock().await;
        if let Some(previous) = active.take() {
            self.detach(previous).await;
            self.clear_cached();
        }
    }

    async fn detach(&self, pair: ActivePair) {
        self.generation.fetch_add(1, Ordering::SeqCst);
        self.active_id.send_replace(None);

        for attachment in [pair.frames, pair.commands] {
            attachment.consumer.abort();
            let topic = attachment.handle.topic().to_string();
            if let Err(e) = attachment.handle.unsubscribe().await {
                log::debug!("Unsubscribe from {} failed (ignored): {}", topic, e);
            }
        }
        self.teardowns.fetch_add(1, Ordering::SeqCst);
        log::info!("Detached from session {}", pair.session_id);
    }

    fn clear_cached(&self) {
        self.latest_frame.send_replace(None);
        self.latest_command.send_replace(None);
    }

    pub async fn active_session(&self) -> Option<String> {
        self.active
            .lock()
            .await
            .as_ref()
            .map(|a| a.session_id.clone())
    }

    /// Active session id as a watchable value
    pub fn active_session_watch(&self) -> watch::Receiver<Option<String>> {
        self.active_id.subscribe()
    }

    pub fn latest_frame(&self) -> watch::Receiver<Option<SessionFrame>> {
        self.latest_frame.subscribe()
    }

    pub fn latest_command(&self) -> watch::Receiver<Option<SessionCommand>> {
        self.latest_command.subscribe()
    }

    /// Every command delivered on the active session, none coalesced
    pub fn commands(&self) -> broadcast::Receiver<SessionCommand> {
        self.commands.subscribe()
    }

    pub fn stats(&self) -> TransitionStats {
        TransitionStats {
            setups: self.setups.load(Ordering::SeqCst),
            teardowns: self.teardowns.load(Ordering::SeqCst),
        }
    }
}

async fn consume_frames(
    session_id: String,
    generation: u64,
    current: Arc<AtomicU64>,
    mut rx: mpsc::Receiver<String>,
    latest: watch::Sender<Option<SessionFrame>>,
) {
    while let Some(body) = rx.recv().await {
        let payload = match serde_json::from_str::<FramePayload>(&body) {
            Ok(payload) => payload,
            Err(e) => {
                log::debug!("Dropping malformed frame on {}: {}", session_id, e);
                continue;
            }
        };
        if current.load(Ordering::SeqCst) != generation {
            return;
        }
        latest.send_replace(Some(SessionFrame {
            session_id: session_id.clone(),
            payload,
        }));
    }
}

async fn consume_commands(
    session_id: String,
    generation: u64,
    current: Arc<AtomicU64>,
    mut rx: mpsc::Receiver<String>,
    latest: watch::Sender<Option<SessionCommand>>,
    fanout: broadcast::Sender<SessionCommand>,
) {
    while let Some(body) = rx.recv().await {
        let payload = match serde_json::from_str::<CommandPayload>(&body) {
            Ok(payload) => payload,
            Err(e) => {
                log::debug!("Dropping malformed command on {}: {}", session_id, e);
                continue;
            }
        };
        if current.load(Ordering::SeqCst) != generation {
            return;
        }
        let command = SessionCommand {
            session_id: session_id.clone(),
            payload,
        };
        latest.send_replace(Some(command.clone()));
        let _ = fanout.send(command);
    }
}

impl Drop for SubscriptionManager {
    fn drop(&mut self) {
        if let Some(pair) = self.active.get_mut().take() {
            pair.frames.consumer.abort();
            pair.commands.consumer.abort();
        }
    }
}
