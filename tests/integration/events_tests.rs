//! Upload event stream scenarios.

use std::time::Duration;

use actix_web::body::to_bytes;
use actix_web::test;
use nsm_storage_lib::config::SseMode;
use nsm_storage_lib::models::{ProgressUpdate, UploadStatus};
use nsm_storage_lib::services::ProgressStore;

use super::helpers::*;

async fn read_stream(resp: actix_web::dev::ServiceResponse) -> Vec<(Option<String>, serde_json::Value)> {
    let body = tokio::time::timeout(Duration::from_secs(5), to_bytes(resp.into_body()))
        .await
        .expect("stream should end after the terminal event")
        .expect("stream body");
    parse_frames(&body)
}

#[actix_rt::test]
async fn test_event_stream_headers() {
    let backends = Backends::new();
    let app = create_test_app(&backends, upload_settings(1024), sse_settings(SseMode::Queue)).await;

    let req = test::TestRequest::get()
        .uri("/api/v1/events/upload/h-1")
        .to_request();
    let resp = test::call_service(&app, req).await;

    assert_eq!(resp.status(), 200);
    let headers = resp.headers();
    assert_eq!(headers.get("content-type").unwrap(), "text/event-stream");
    assert_eq!(headers.get("cache-control").unwrap(), "no-cache");
    assert_eq!(headers.get("x-accel-buffering").unwrap(), "no");
    assert_eq!(backends.registry.subscriber_count("h-1"), 1);
}

#[actix_rt::test]
async fn test_two_subscribers_both_receive_completion() {
    let backends = Backends::new();
    let app = create_test_app(&backends, upload_settings(1024 * 1024), sse_settings(SseMode::Queue)).await;

    let open = || {
        test::TestRequest::get()
            .uri("/api/v1/events/upload/shared-1")
            .to_request()
    };
    let first = test::call_service(&app, open()).await;
    let second = test::call_service(&app, open()).await;
    assert_eq!(backends.registry.subscriber_count("shared-1"), 2);

    let req = upload_request(&[
        Part::Text("uploadId", "shared-1"),
        Part::File {
            name: "photo.png",
            mime_type: "image/png",
            data: &[0x89, b'P', b'N', b'G', 0, 1, 2, 3],
        },
    ])
    .to_request();
    let (status, _) = call_json(&app, req).await;
    assert_eq!(status, 201);

    assert!(backends.pump_progress().await > 0);

    for resp in [first, second] {
        let frames = read_stream(resp).await;
        let (event, connected) = &frames[0];
        assert_eq!(event.as_deref(), Some("connected"));
        assert_eq!(connected["uploadId"], "shared-1");
        assert_eq!(connected["progress"], 0.0);

        let (event, last) = frames.last().unwrap();
        assert_eq!(*event, None);
        assert_eq!(last["event"], "UPLOAD_COMPLETED");
        assert_eq!(last["status"], "completed");
        assert_eq!(last["progress"], 100.0);
    }

    assert_eq!(backends.registry.subscriber_count("shared-1"), 0);
    assert_eq!(backends.registry.upload_count(), 0);
}

#[actix_rt::test]
async fn test_poll_mode_streams_terminal_record_and_cleans_up() {
    let backends = Backends::new();
    let app = create_test_app(&backends, upload_settings(1024 * 1024), sse_settings(SseMode::Poll)).await;

    backends
        .progress
        .upsert(
            &ProgressUpdate::uploading("poll-1", 50)
                .with_file(Some("a.txt".to_string()), Some(50))
                .with_status(UploadStatus::Completed),
        )
        .await
        .unwrap();

    let req = test::TestRequest::get()
        .uri("/api/v1/events/upload/poll-1")
        .to_request();
    let resp = test::call_service(&app, req).await;
    let frames = read_stream(resp).await;

    assert_eq!(frames[0].0.as_deref(), Some("connected"));
    let (event, last) = frames.last().unwrap();
    assert_eq!(*event, None);
    assert_eq!(last["status"], "completed");
    assert_eq!(last["progress"], 100.0);
    assert!(backends.progress.get("poll-1").await.unwrap().is_none());
}

#[actix_rt::test]
async fn test_closed_stream_unsubscribes() {
    let backends = Backends::new();
    let app = create_test_app(&backends, upload_settings(1024), sse_settings(SseMode::Queue)).await;

    let req = test::TestRequest::get()
        .uri("/api/v1/events/upload/gone-1")
        .to_request();
    let resp = test::call_service(&app, req).await;
    assert_eq!(backends.registry.subscriber_count("gone-1"), 1);

    drop(resp);

    assert_eq!(backends.registry.subscriber_count("gone-1"), 0);
}
