//! End-to-end camera/viewer flows over the loopback relay
//!
//! Every collaborator is in-process: the relay is a [`LoopbackBroker`], the
//! backend a [`MemoryDirectory`], the camera a [`SyntheticDevices`] gradient.

use std::sync::Arc;
use std::time::Duration;

use camrelay::capture::{CaptureConstraints, CaptureStream};
use camrelay::commands::{self, CameraPhase};
use camrelay::recording::{EncoderBackend, MotionJpegBackend, RecordingPhase};
use camrelay::relay;
use camrelay::testing::{wait_until, LoopbackBroker, MemoryDirectory, SyntheticDevices};
use camrelay::topics;
use camrelay::types::FramePayload;
use camrelay::{
    CamRelayConfig, CameraClient, Command, CommandPayload, Connection, MediaKind, RelayError,
    SubscriptionManager, ViewerClient,
};
use tokio::time::timeout;

const WIDTH: u32 = 64;
const HEIGHT: u32 = 48;

fn config() -> CamRelayConfig {
    let mut config = CamRelayConfig::default();
    config.transport.reconnect_delay_ms = 50;
    config.streaming.frame_interval_ms = 50;
    config.recording.mime_preferences = vec!["video/x-motion-jpeg".to_string()];
    config
}

fn backend() -> Arc<dyn EncoderBackend> {
    Arc::new(MotionJpegBackend::new(70))
}

fn manager(broker: &LoopbackBroker, config: &CamRelayConfig) -> Arc<SubscriptionManager> {
    let conn = Connection::new(Arc::new(broker.clone()), config.transport.clone());
    Arc::new(SubscriptionManager::new(conn))
}

struct Harness {
    broker: LoopbackBroker,
    directory: MemoryDirectory,
    devices: SyntheticDevices,
    config: CamRelayConfig,
    camera_manager: Arc<SubscriptionManager>,
    camera: CameraClient,
    viewer: ViewerClient,
}

impl Harness {
    fn new() -> Self {
        let config = config();
        let broker = LoopbackBroker::new();
        let directory = MemoryDirectory::new().with_next_session_id("S1");
        let devices = SyntheticDevices::new(WIDTH, HEIGHT);

        let camera_manager = manager(&broker, &config);
        let camera = CameraClient::new(
            Arc::clone(&camera_manager),
            Arc::new(directory.clone()),
            Arc::new(devices.clone()),
            backend(),
            config.clone(),
        );
        let viewer = ViewerClient::new(
            manager(&broker, &config),
            Arc::new(directory.clone()),
            backend(),
            &config,
        );

        Self {
            broker,
            directory,
            devices,
            config,
            camera_manager,
            camera,
            viewer,
        }
    }

    fn constraints(&self) -> CaptureConstraints {
        CaptureConstraints::ideal(None, &self.config.capture)
    }

    /// Camera live in S1 and the viewer receiving its frames
    async fn live(&self) {
        let session = self.camera.start(self.constraints()).await.unwrap();
        assert_eq!(session.session_id, "S1");
        self.viewer.join("S1").await.unwrap();
        self.wait_for_frame().await;
    }

    async fn wait_for_frame(&self) {
        let mut frames = self.viewer.frames();
        timeout(Duration::from_secs(3), frames.wait_for(|f| f.is_some()))
            .await
            .expect("viewer received a frame")
            .unwrap();
    }

    async fn wait_for_phase(&self, phase: CameraPhase) {
        let mut phases = self.camera.phase_watch();
        let reached = timeout(Duration::from_secs(3), phases.wait_for(|p| *p == phase))
            .await
            .map(|seen| seen.is_ok())
            .unwrap_or(false);
        assert!(reached, "camera never reached {:?}", phase);
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_viewer_receives_camera_frames() {
    let h = Harness::new();
    h.live().await;

    let frame = h.viewer.frames().borrow().clone().unwrap();
    assert_eq!(frame.session_id, "S1");
    let image = relay::decode_frame_image(&frame.payload).unwrap();
    assert_eq!(image.dimensions(), (WIDTH, HEIGHT));
    assert!(!h.broker.sent_to(&topics::frame_destination("S1")).is_empty());
    assert_eq!(h.camera.phase(), CameraPhase::Idle);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_toggle_twice_records_and_uploads() {
    let h = Harness::new();
    h.live().await;

    h.viewer.send_command(Command::ToggleRecording).await.unwrap();
    h.wait_for_phase(CameraPhase::Recording).await;
    tokio::time::sleep(Duration::from_millis(300)).await;

    h.viewer.send_command(Command::ToggleRecording).await.unwrap();
    h.wait_for_phase(CameraPhase::Idle).await;
    assert!(wait_until(Duration::from_secs(3), || h.directory.uploads().len() == 1).await);

    let (kind, upload) = h.directory.uploads().remove(0);
    assert_eq!(kind, MediaKind::Video);
    assert_eq!(upload.session_id, "S1");
    assert_eq!(upload.device_id, h.camera.device_id());
    assert_eq!(upload.mime_type, "video/x-motion-jpeg");
    assert!(!upload.bytes.is_empty());
    assert_eq!(h.camera.recent_media().len(), 1);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_remote_screenshot_uploads_full_resolution_still() {
    let h = Harness::new();
    h.live().await;

    h.viewer.send_command(Command::TakeScreenshot).await.unwrap();
    assert!(wait_until(Duration::from_secs(3), || h.directory.uploads().len() == 1).await);

    let (kind, upload) = h.directory.uploads().remove(0);
    assert_eq!(kind, MediaKind::Screenshot);
    assert_eq!(upload.mime_type, "image/png");
    assert_eq!((upload.width, upload.height), (Some(WIDTH), Some(HEIGHT)));
    assert_eq!(h.camera.phase(), CameraPhase::Idle);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_end_session_terminates_camera() {
    let h = Harness::new();
    h.live().await;

    h.viewer.send_command(Command::EndSession).await.unwrap();
    h.wait_for_phase(CameraPhase::Terminated).await;

    assert!(h.devices.opened()[0].is_stopped());
    assert!(
        wait_until(Duration::from_secs(2), || {
            h.directory.session("S1").map(|s| !s.active).unwrap_or(false)
        })
        .await
    );
    assert_eq!(h.camera.current_session().await, None);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_end_session_while_recording_uploads_first() {
    let h = Harness::new();
    h.live().await;

    h.camera.toggle_recording().await.unwrap();
    assert_eq!(h.camera.phase(), CameraPhase::Recording);
    tokio::time::sleep(Duration::from_millis(200)).await;

    h.camera.stop().await.unwrap();
    assert_eq!(h.camera.phase(), CameraPhase::Terminated);
    assert_eq!(h.directory.uploads().len(), 1);
    assert_eq!(h.directory.uploads()[0].0, MediaKind::Video);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_camera_ignores_its_own_commands() {
    let h = Harness::new();
    h.live().await;

    let echo = CommandPayload::new(Command::ToggleRecording).with_origin(h.camera.client_id());
    commands::send_command(h.camera_manager.connection(), "S1", &echo)
        .await
        .unwrap();
    tokio::time::sleep(Duration::from_millis(300)).await;

    assert_eq!(h.camera.phase(), CameraPhase::Idle);
    assert_eq!(h.directory.upload_attempts(), 0);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_viewer_does_not_execute_commands() {
    let h = Harness::new();
    h.live().await;

    h.viewer.send_command(Command::TakeScreenshot).await.unwrap();
    assert!(wait_until(Duration::from_secs(3), || h.directory.upload_attempts() == 1).await);
    tokio::time::sleep(Duration::from_millis(200)).await;

    // Exactly one upload: the camera's, none from the viewer
    assert_eq!(h.directory.upload_attempts(), 1);
    assert_eq!(h.viewer.recording_phase(), RecordingPhase::NotRecording);
    assert!(h.viewer.recent_media().is_empty());
}

#[tokio::test]
async fn test_camera_acquired_on_last_fallback() {
    let h = Harness::new();
    h.devices.fail_next(RelayError::Capture("constraints not satisfiable".to_string()));
    h.devices.fail_next(RelayError::Capture("no environment camera".to_string()));

    h.camera.start(h.constraints()).await.unwrap();

    let attempts = h.devices.attempts();
    assert_eq!(attempts.len(), 3);
    assert_eq!(attempts[0], h.constraints());
    assert_eq!(attempts[1], CaptureConstraints::environment_without_audio());
    assert_eq!(attempts[2], CaptureConstraints::any_video());
    assert_eq!(h.camera.phase(), CameraPhase::Idle);
    h.camera.stop().await.unwrap();
}

#[tokio::test]
async fn test_denied_camera_reports_actionable_error() {
    let h = Harness::new();
    for _ in 0..3 {
        h.devices
            .fail_next(RelayError::PermissionDenied("NotAllowedError".to_string()));
    }

    let err = h.camera.start(h.constraints()).await.unwrap_err();
    match err {
        RelayError::PermissionDenied(message) => {
            assert!(message.contains("Allow camera access"), "{}", message)
        }
        other => panic!("unexpected error {:?}", other),
    }
    assert_eq!(h.camera.phase(), CameraPhase::Inactive);
    assert_eq!(h.broker.connections_opened(), 0);
}

#[tokio::test]
async fn test_failed_session_start_releases_camera() {
    let h = Harness::new();
    h.directory.set_fail_start(true);

    let err = h.camera.start(h.constraints()).await.unwrap_err();
    assert!(matches!(err, RelayError::Session(_)));

    let opened = h.devices.opened();
    assert_eq!(opened.len(), 1);
    assert!(opened[0].is_stopped());
    assert_eq!(h.camera.phase(), CameraPhase::Inactive);
    assert_eq!(h.broker.subscribe_frames(), 0);
}

#[tokio::test]
async fn test_second_start_is_rejected() {
    let h = Harness::new();
    h.camera.start(h.constraints()).await.unwrap();

    let err = h.camera.start(h.constraints()).await.unwrap_err();
    assert!(matches!(err, RelayError::Session(_)));
    assert_eq!(h.devices.opened().len(), 1);
    h.camera.stop().await.unwrap();
}

#[tokio::test]
async fn test_viewer_recording_needs_a_frame() {
    let h = Harness::new();
    h.viewer.join("S1").await.unwrap();

    assert_eq!(h.viewer.start_recording().await, Err(RelayError::NoFrames));
    assert_eq!(h.viewer.recording_phase(), RecordingPhase::NotRecording);
    assert!(matches!(
        h.viewer.take_screenshot().await,
        Err(RelayError::NoFrames)
    ));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_viewer_records_received_frames() {
    let h = Harness::new();
    h.live().await;

    let mime = h.viewer.start_recording().await.unwrap();
    assert_eq!(mime, "video/x-motion-jpeg");
    assert_eq!(h.viewer.recording_phase(), RecordingPhase::Recording);
    tokio::time::sleep(Duration::from_millis(700)).await;

    let artifact = h.viewer.stop_recording().await.unwrap().unwrap();
    assert_eq!(artifact.kind, MediaKind::Video);
    assert_eq!(artifact.session_id, "S1");
    // Attributed to the camera that captured the session
    assert_eq!(artifact.device_id, h.camera.device_id());
    assert_eq!((artifact.width, artifact.height), (Some(WIDTH), Some(HEIGHT)));
    assert_eq!(h.viewer.recording_phase(), RecordingPhase::NotRecording);
    assert_eq!(h.viewer.recent_media().len(), 1);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_viewer_screenshot_of_received_frame() {
    let h = Harness::new();
    h.live().await;

    let artifact = h.viewer.take_screenshot().await.unwrap();
    assert_eq!(artifact.kind, MediaKind::Screenshot);
    assert_eq!(artifact.mime_type, "image/jpeg");
    assert!(artifact.file_name.ends_with(".jpg"));
    assert_eq!(artifact.width, Some(WIDTH));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_viewer_leave_detaches() {
    let h = Harness::new();
    h.live().await;

    h.viewer.leave().await;
    assert_eq!(h.viewer.session_id().await, None);
    assert!(h.viewer.latest_frame().is_none());
    assert!(matches!(
        h.viewer.send_command(Command::TakeScreenshot).await,
        Err(RelayError::Session(_))
    ));

    h.viewer.leave().await;
    h.camera.stop().await.unwrap();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_camera_can_start_again_after_stop() {
    let h = Harness::new();
    h.camera.start(h.constraints()).await.unwrap();
    h.camera.stop().await.unwrap();
    assert_eq!(h.camera.phase(), CameraPhase::Terminated);

    let second = h.camera.start(h.constraints()).await.unwrap();
    assert_ne!(second.session_id, "S1");
    assert_eq!(h.camera.phase(), CameraPhase::Idle);
    assert!(h.devices.opened()[0].is_stopped());
    assert!(!h.devices.opened()[1].is_stopped());
    assert_eq!(h.devices.opened()[1].label(), "synthetic camera");
    h.camera.stop().await.unwrap();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_viewer_ignores_frames_of_other_sessions_on_shared_manager() {
    let broker = LoopbackBroker::new();
    let config = config();
    let shared = manager(&broker, &config);
    let viewer = ViewerClient::new(
        Arc::clone(&shared),
        Arc::new(MemoryDirectory::new()),
        backend(),
        &config,
    );
    let body = |timestamp| {
        serde_json::to_string(&FramePayload::new("data:image/jpeg;base64,AAAA", timestamp)).unwrap()
    };

    viewer.join("S1").await.unwrap();
    assert!(wait_until(Duration::from_secs(1), || broker.subscribe_frames() == 2).await);
    broker.publish(&topics::frame_topic("S1"), &body(1));
    assert!(wait_until(Duration::from_secs(1), || viewer.latest_frame().is_some()).await);
    assert_eq!(viewer.latest_frame().map(|f| f.timestamp), Some(1));

    // Another user of the manager moves it to S2 behind the viewer's back
    shared.subscribe_to_session("S2").await.unwrap();
    assert!(wait_until(Duration::from_secs(1), || broker.subscribe_frames() == 4).await);
    broker.publish(&topics::frame_topic("S2"), &body(2));
    let mut frames = shared.latest_frame();
    timeout(
        Duration::from_secs(1),
        frames.wait_for(|f| f.as_ref().map(|f| f.session_id.as_str()) == Some("S2")),
    )
    .await
    .unwrap()
    .unwrap();

    assert_eq!(viewer.session_id().await.as_deref(), Some("S1"));
    assert_eq!(viewer.latest_frame(), None);
    assert_eq!(viewer.start_recording().await, Err(RelayError::NoFrames));

    viewer.leave().await;
    assert_eq!(viewer.latest_frame(), None);
}
