//! HTTP session directory against a mock backend

use bytes::Bytes;
use camrelay::config::DirectoryConfig;
use camrelay::directory::MediaUpload;
use camrelay::{HttpDirectory, MediaKind, RelayError, SessionDirectory};
use serde_json::json;
use wiremock::matchers::{body_string_contains, method, path, query_param};
use wiremock::{Mock, MockServer, ResponseTemplate};

fn directory(server: &MockServer) -> HttpDirectory {
    HttpDirectory::new(&DirectoryConfig {
        base_url: format!("{}/api/camera/", server.uri()),
        request_timeout_ms: 5_000,
    })
    .unwrap()
}

fn upload(file_name: &str, mime_type: &str) -> MediaUpload {
    MediaUpload {
        file_name: file_name.to_string(),
        mime_type: mime_type.to_string(),
        bytes: Bytes::from_static(b"fake media bytes"),
        device_id: "mobile-device-abc123def".to_string(),
        session_id: "S1".to_string(),
        width: Some(640),
        height: Some(480),
        duration_secs: Some(4.0),
    }
}

#[tokio::test]
async fn test_start_session_returns_backend_id() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/api/camera/start-session"))
        .and(query_param("deviceId", "dev-1"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "success": true,
            "sessionId": "2f0c6a9e-session",
            "message": "Session started"
        })))
        .expect(1)
        .mount(&server)
        .await;

    let id = directory(&server).start_session("dev-1").await.unwrap();
    assert_eq!(id, "2f0c6a9e-session");
}

#[tokio::test]
async fn test_start_session_refusal_surfaces_message() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/api/camera/start-session"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "success": false,
            "message": "device is banned"
        })))
        .mount(&server)
        .await;

    let err = directory(&server).start_session("dev-1").await.unwrap_err();
    assert_eq!(err, RelayError::Session("device is banned".to_string()));
}

#[tokio::test]
async fn test_server_error_message_is_extracted() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/api/camera/end-session"))
        .and(query_param("sessionId", "S1"))
        .respond_with(
            ResponseTemplate::new(500).set_body_json(json!({ "message": "database unavailable" })),
        )
        .mount(&server)
        .await;

    match directory(&server).end_session("S1").await {
        Err(RelayError::Session(message)) => {
            assert!(message.contains("end-session"), "{}", message);
            assert!(message.contains("500"), "{}", message);
            assert!(message.contains("database unavailable"), "{}", message);
        }
        other => panic!("unexpected result {:?}", other),
    }
}

#[tokio::test]
async fn test_get_session_parses_row_and_maps_404() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/api/camera/session/S1"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "id": 7,
            "sessionId": "S1",
            "deviceId": "mobile-device-abc123def",
            "startTime": "2024-05-01T10:00:00",
            "endTime": null,
            "isActive": true,
            "ipAddress": "10.0.0.5",
            "userAgent": "Mozilla/5.0"
        })))
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path("/api/camera/session/missing"))
        .respond_with(ResponseTemplate::new(404))
        .mount(&server)
        .await;

    let directory = directory(&server);
    let session = directory.get_session("S1").await.unwrap();
    assert_eq!(session.id, Some(7));
    assert_eq!(session.device_id, "mobile-device-abc123def");
    assert!(session.active);
    assert_eq!(session.end_time, None);

    assert_eq!(
        directory.get_session("missing").await,
        Err(RelayError::Session("session missing not found".to_string()))
    );
}

#[tokio::test]
async fn test_active_sessions_listed() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/api/camera/active-sessions"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!([
            {
                "sessionId": "S1",
                "deviceId": "d1",
                "startTime": "2024-05-01T10:00:00",
                "isActive": true
            },
            {
                "sessionId": "S2",
                "deviceId": "d2",
                "startTime": "2024-05-01T10:05:00",
                "active": true
            }
        ])))
        .mount(&server)
        .await;

    let sessions = directory(&server).active_sessions().await.unwrap();
    let ids: Vec<_> = sessions.iter().map(|s| s.session_id.as_str()).collect();
    assert_eq!(ids, vec!["S1", "S2"]);
    assert!(sessions.iter().all(|s| s.active));
}

#[tokio::test]
async fn test_video_upload_sends_multipart_form() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/api/camera/upload-video"))
        .and(body_string_contains("name=\"file\""))
        .and(body_string_contains("filename=\"recording_1.webm\""))
        .and(body_string_contains("name=\"deviceId\""))
        .and(body_string_contains("mobile-device-abc123def"))
        .and(body_string_contains("name=\"sessionId\""))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "success": true,
            "videoId": 42,
            "fileName": "video_20240501_100000.webm"
        })))
        .expect(1)
        .mount(&server)
        .await;

    let artifact = directory(&server)
        .upload(MediaKind::Video, upload("recording_1.webm", "video/webm"))
        .await
        .unwrap();

    assert_eq!(artifact.kind, MediaKind::Video);
    assert_eq!(artifact.id, Some(42));
    assert_eq!(artifact.file_name, "video_20240501_100000.webm");
    assert_eq!(artifact.session_id, "S1");
    assert_eq!(artifact.duration_secs, Some(4.0));
}

#[tokio::test]
async fn test_rejected_upload_is_an_upload_error() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/api/camera/upload-screenshot"))
        .respond_with(ResponseTemplate::new(413).set_body_string("Payload Too Large"))
        .mount(&server)
        .await;

    let err = directory(&server)
        .upload(MediaKind::Screenshot, upload("screenshot_1.png", "image/png"))
        .await
        .unwrap_err();
    match err {
        RelayError::Upload(message) => assert!(message.contains("Payload Too Large"), "{}", message),
        other => panic!("unexpected error {:?}", other),
    }
}

#[tokio::test]
async fn test_media_listing_delete_and_download() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/api/camera/screenshots/device/d1"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!([{
            "id": 3,
            "fileName": "screenshot_1.png",
            "fileSize": 2048,
            "capturedAt": "2024-05-01T10:01:00",
            "deviceId": "d1",
            "sessionId": "S1",
            "mimeType": "image/png",
            "width": 1280,
            "height": 720
        }])))
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path("/api/camera/videos"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!([])))
        .mount(&server)
        .await;
    Mock::given(method("DELETE"))
        .and(path("/api/camera/screenshot/3"))
        .respond_with(ResponseTemplate::new(200))
        .expect(1)
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path("/api/camera/download/screenshot/screenshot_1.png"))
        .respond_with(ResponseTemplate::new(200).set_body_bytes(b"\x89PNG".to_vec()))
        .mount(&server)
        .await;

    let directory = directory(&server);
    let shots = directory.list_screenshots(Some("d1")).await.unwrap();
    assert_eq!(shots.len(), 1);
    assert_eq!(shots[0].width, Some(1280));
    assert!(directory.list_videos(None).await.unwrap().is_empty());

    directory.delete_screenshot(3).await.unwrap();
    let bytes = directory
        .download_screenshot("screenshot_1.png")
        .await
        .unwrap();
    assert_eq!(&bytes[..], b"\x89PNG");
}

#[tokio::test]
async fn test_unreachable_backend_is_actionable() {
    // Bind and release a port so nothing is listening on it
    let port = std::net::TcpListener::bind("127.0.0.1:0")
        .unwrap()
        .local_addr()
        .unwrap()
        .port();
    let directory = HttpDirectory::new(&DirectoryConfig {
        base_url: format!("http://127.0.0.1:{}/api/camera", port),
        request_timeout_ms: 2_000,
    })
    .unwrap();

    match directory.active_sessions().await {
        Err(RelayError::Directory(message)) => {
            assert!(message.contains("check that the backend is reachable"), "{}", message)
        }
        other => panic!("unexpected result {:?}", other),
    }
}
