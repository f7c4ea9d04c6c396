//! Recent-media view
//!
//! A bounded, newest-first list of artifacts the client produced or was told
//! about. Local uploads register themselves; [`MediaFeed`] adds artifacts the
//! directory announces for the session the client is following.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex, MutexGuard};

use serde::de::DeserializeOwned;
use tokio::sync::watch;
use tokio::task::JoinHandle;

use crate::errors::RelayError;
use crate::topics;
use crate::transport::{Connection, SubscriptionHandle};
use crate::types::{MediaArtifact, Screenshot, VideoRecord};

/// Newest-first artifacts, de-duplicated by file name
#[derive(Clone)]
pub struct RecentMedia {
    items: Arc<Mutex<VecDeque<MediaArtifact>>>,
    capacity: usize,
}

impl RecentMedia {
    pub fn new(capacity: usize) -> Self {
        Self {
            items: Arc::new(Mutex::new(VecDeque::new())),
            capacity: capacity.max(1),
        }
    }

    fn lock(&self) -> MutexGuard<'_, VecDeque<MediaArtifact>> {
        self.items.lock().unwrap_or_else(|p| p.into_inner())
    }

    /// Put `artifact` at the front, replacing an entry with the same file name
    pub fn register(&self, artifact: MediaArtifact) {
        let mut items = self.lock();
        items.retain(|a| a.file_name != artifact.file_name);
        items.push_front(artifact);
        items.truncate(self.capacity);
    }

    pub fn list(&self) -> Vec<MediaArtifact> {
        self.lock().iter().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    pub fn clear(&self) {
        self.lock().clear();
    }
}

impl Default for RecentMedia {
    fn default() -> Self {
        Self::new(20)
    }
}

/// Follows the directory's new-video and new-screenshot announcements
pub struct MediaFeed {
    handles: Vec<SubscriptionHandle>,
    tasks: Vec<JoinHandle<()>>,
}

impl MediaFeed {
    /// Register announced artifacts whose session is the one `followed`
    /// currently names
    pub async fn start(
        conn: &Connection,
        recent: RecentMedia,
        followed: watch::Receiver<Option<String>>,
    ) -> Result<Self, RelayError> {
        conn.connect().await?;

        let mut feed = Self {
            handles: Vec::new(),
            tasks: Vec::new(),
        };
        feed.follow::<VideoRecord>(conn, topics::VIDEOS_NEW, &recent, &followed)
            .await?;
        feed.follow::<Screenshot>(conn, topics::SCREENSHOTS_NEW, &recent, &followed)
            .await?;
        Ok(feed)
    }

    async fn follow<T>(
        &mut self,
        conn: &Connection,
        topic: &'static str,
        recent: &RecentMedia,
        followed: &watch::Receiver<Option<String>>,
    ) -> Result<(), RelayError>
    where
        T: DeserializeOwned + Into<MediaArtifact> + Send + 'static,
    {
        let (handle, mut rx) = conn.subscribe(topic).await?.split();
        let recent = recent.clone();
        let followed = followed.clone();

        self.tasks.push(tokio::spawn(async move {
            while let Some(body) = rx.recv().await {
                let artifact: MediaArtifact = match serde_json::from_str::<T>(&body) {
                    Ok(record) => record.into(),
                    Err(e) => {
                        log::debug!("Ignoring malformed announcement on {}: {}", topic, e);
                        continue;
                    }
                };
                let belongs = followed.borrow().as_deref() == Some(artifact.session_id.as_str());
                if belongs {
                    log::debug!("New {} announced: {}", artifact.kind, artifact.file_name);
                    recent.register(artifact);
                }
            }
        }));
        self.handles.push(handle);
        Ok(())
    }

    /// Unsubscribe from both announcement topics
    pub async fn stop(mut self) {
        for task in self.tasks.drain(..) {
            task.abort();
        }
        for handle in self.handles.drain(..) {
            if let Err(e) = handle.unsubscribe().await {
                log::debug!("Media feed unsubscribe: {}", e);
            }
        }
    }
}

impl Drop for MediaFeed {
    fn drop(&mut self) {
        for task in &self.tasks {
            task.abort();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::MediaKind;

    fn artifact(name: &str) -> MediaArtifact {
        MediaArtifact {
            kind: MediaKind::Screenshot,
            id: None,
            file_name: name.to_string(),
            device_id: "d".to_string(),
            session_id: "s".to_string(),
            mime_type: "image/png".to_string(),
            file_size: 1,
            captured_at: None,
            width: None,
            height: None,
            duration_secs: None,
        }
    }

    #[test]
    fn test_newest_first_and_deduplicated() {
        let recent = RecentMedia::new(10);
        recent.register(artifact("a.png"));
        recent.register(artifact("b.png"));
        recent.register(artifact("a.png"));

        let names: Vec<_> = recent.list().into_iter().map(|a| a.file_name).collect();
        assert_eq!(names, vec!["a.png", "b.png"]);
    }

    #[test]
    fn test_bounded() {
        let recent = RecentMedia::new(2);
        for name in ["1", "2", "3"] {
            recent.register(artifact(name));
        }
        let names: Vec<_> = recent.list().into_iter().map(|a| a.file_name).collect();
        assert_eq!(names, vec!["3", "2"]);
    }

    #[tokio::test]
    async fn test_feed_registers_only_followed_session() {
        use crate::config::CamRelayConfig;
        use crate::testing::{wait_until, LoopbackBroker};
        use std::time::Duration;

        let broker = LoopbackBroker::new();
        let conn = Connection::new(
            Arc::new(broker.clone()),
            CamRelayConfig::default().transport,
        );
        let recent = RecentMedia::default();
        let (followed, rx) = watch::channel(Some("S1".to_string()));
        let feed = MediaFeed::start(&conn, recent.clone(), rx).await.unwrap();
        assert!(wait_until(Duration::from_secs(1), || broker.subscribe_frames() == 2).await);

        let video = |session: &str, name: &str| {
            serde_json::json!({
                "id": 1,
                "fileName": name,
                "fileSize": 10,
                "recordedAt": "2024-05-01T10:00:00",
                "deviceId": "d1",
                "sessionId": session,
                "mimeType": "video/webm"
            })
            .to_string()
        };
        broker.publish(topics::VIDEOS_NEW, &video("S2", "other.webm"));
        broker.publish(topics::VIDEOS_NEW, &video("S1", "mine.webm"));
        assert!(wait_until(Duration::from_secs(1), || recent.len() == 1).await);
        assert_eq!(recent.list()[0].file_name, "mine.webm");
        assert_eq!(recent.list()[0].kind, MediaKind::Video);

        followed.send_replace(None);
        broker.publish(topics::VIDEOS_NEW, &video("S1", "late.webm"));
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(recent.len(), 1);

        feed.stop().await;
        assert!(wait_until(Duration::from_secs(1), || broker.unsubscribe_frames() == 2).await);
    }
}
