//! Upload endpoint scenarios.

use actix_web::test;
use nsm_storage_lib::config::SseMode;
use nsm_storage_lib::models::{ProgressEventKind, UploadStatus};
use nsm_storage_lib::services::{ProgressStore, QueueName};

use super::helpers::*;

const TEN_MB: usize = 10 * 1024 * 1024;

#[actix_rt::test]
async fn test_large_upload_reports_increasing_progress_and_completes_once() {
    let backends = Backends::new();
    let app = create_test_app(&backends, upload_settings(100 * 1024 * 1024), sse_settings(SseMode::Queue)).await;
    let data = vec![7u8; TEN_MB];
    let size = TEN_MB.to_string();

    let req = upload_request(&[
        Part::Text("uploadId", "big-1"),
        Part::Text("fileSize", &size),
        Part::File {
            name: "big.csv",
            mime_type: "text/csv",
            data: &data,
        },
    ])
    .to_request();
    let (status, body) = call_json(&app, req).await;

    assert_eq!(status, 201, "Upload should succeed: {}", body);
    assert_eq!(body["uploadId"], "big-1");
    assert_eq!(body["file"]["fileSize"], TEN_MB as u64);
    assert_eq!(backends.files.len(), 1);

    let events = backends.progress_events().await;
    let (last, rest) = events.split_last().expect("at least one event");
    assert_eq!(last.event, ProgressEventKind::UploadCompleted);
    assert_eq!(last.progress, Some(100.0));
    assert_eq!(last.uploaded_bytes, Some(TEN_MB as u64));

    let mut previous = None;
    for event in rest {
        assert_eq!(event.event, ProgressEventKind::UploadProgress);
        let bytes = event.uploaded_bytes.unwrap();
        assert!(previous.is_none_or(|p| bytes > p), "bytes must strictly increase");
        assert!(event.progress.unwrap() <= 100.0);
        previous = Some(bytes);
    }

    let record = backends.progress.get("big-1").await.unwrap().unwrap();
    assert_eq!(record.status, UploadStatus::Completed);
    assert_eq!(record.progress, 100.0);

    let file_events = backends.drain(QueueName::FileEvents).await;
    assert_eq!(file_events.len(), 1);
    assert_eq!(file_events[0]["event"], "FILE_CREATED");
}

#[actix_rt::test]
async fn test_disallowed_type_is_rejected_without_storing() {
    let backends = Backends::new();
    let app = create_test_app(&backends, upload_settings(1024 * 1024), sse_settings(SseMode::Queue)).await;

    let req = upload_request(&[Part::File {
        name: "setup.exe",
        mime_type: "application/x-msdownload",
        data: b"MZ\x90\x00",
    }])
    .insert_header(("x-upload-id", "exe-1"))
    .to_request();
    let (status, body) = call_json(&app, req).await;

    assert_eq!(status, 415);
    assert_eq!(body["status"], false);
    assert_eq!(body["error"], "UNSUPPORTED_MEDIA_TYPE");
    assert!(backends.files.is_empty());
    assert!(backends.blobs.is_empty());

    let events = backends.progress_events().await;
    assert_eq!(events.len(), 1);
    assert_eq!(events[0].event, ProgressEventKind::UploadFailed);

    let record = backends.progress.get("exe-1").await.unwrap().unwrap();
    assert_eq!(record.status, UploadStatus::Failed);
}

#[actix_rt::test]
async fn test_missing_upload_id_is_rejected() {
    let backends = Backends::new();
    let app = create_test_app(&backends, upload_settings(1024 * 1024), sse_settings(SseMode::Queue)).await;

    let req = upload_request(&[Part::File {
        name: "a.txt",
        mime_type: "text/plain",
        data: b"hello",
    }])
    .to_request();
    let (status, body) = call_json(&app, req).await;

    assert_eq!(status, 400);
    assert_eq!(body["error"], "MISSING_UPLOAD_ID");
    assert!(backends.blobs.is_empty());
    assert!(backends.progress.is_empty());
}

#[actix_rt::test]
async fn test_upload_id_from_query_and_folder_from_header() {
    let backends = Backends::new();
    let app = create_test_app(&backends, upload_settings(1024 * 1024), sse_settings(SseMode::Queue)).await;

    let req = upload_request(&[Part::File {
        name: "notes.txt",
        mime_type: "text/plain",
        data: b"some notes",
    }])
    .uri("/api/v1/upload?uploadId=q-1")
    .insert_header(("x-folder-id", "folder-9"))
    .to_request();
    let (status, body) = call_json(&app, req).await;

    assert_eq!(status, 201, "Upload should succeed: {}", body);
    assert_eq!(body["uploadId"], "q-1");
    assert_eq!(body["file"]["folderId"], "folder-9");
}

#[actix_rt::test]
async fn test_oversized_upload_fails() {
    let backends = Backends::new();
    let app = create_test_app(&backends, upload_settings(1024), sse_settings(SseMode::Queue)).await;
    let data = vec![1u8; 4096];

    let req = upload_request(&[
        Part::Text("uploadId", "big-2"),
        Part::File {
            name: "big.txt",
            mime_type: "text/plain",
            data: &data,
        },
    ])
    .to_request();
    let (status, body) = call_json(&app, req).await;

    assert_eq!(status, 400);
    assert_eq!(body["error"], "PAYLOAD_TOO_LARGE");
    assert!(backends.files.is_empty());

    let events = backends.progress_events().await;
    assert_eq!(events.last().unwrap().event, ProgressEventKind::UploadFailed);
}

#[actix_rt::test]
async fn test_request_without_file_part_is_malformed() {
    let backends = Backends::new();
    let app = create_test_app(&backends, upload_settings(1024), sse_settings(SseMode::Queue)).await;

    let req = upload_request(&[Part::Text("uploadId", "none-1")]).to_request();
    let (status, body) = call_json(&app, req).await;

    assert_eq!(status, 400);
    assert_eq!(body["error"], "MALFORMED_MULTIPART");
}

#[actix_rt::test]
async fn test_only_first_file_part_is_stored() {
    let backends = Backends::new();
    let app = create_test_app(&backends, upload_settings(1024 * 1024), sse_settings(SseMode::Queue)).await;

    let req = upload_request(&[
        Part::Text("uploadId", "two-1"),
        Part::File {
            name: "first.txt",
            mime_type: "text/plain",
            data: b"first",
        },
        Part::File {
            name: "second.txt",
            mime_type: "text/plain",
            data: b"second",
        },
    ])
    .to_request();
    let (status, body) = call_json(&app, req).await;

    assert_eq!(status, 201);
    assert_eq!(body["file"]["name"], "first.txt");
    assert_eq!(backends.blobs.len(), 1);
    assert_eq!(backends.files.len(), 1);
}

#[actix_rt::test]
async fn test_health_and_ready_without_database() {
    let backends = Backends::new();
    let app = create_test_app(&backends, upload_settings(1024), sse_settings(SseMode::Queue)).await;

    let req = test::TestRequest::get().uri("/api/v1/health").to_request();
    let (status, body) = call_json(&app, req).await;
    assert_eq!(status, 200);
    assert_eq!(body["status"], "healthy");

    let req = test::TestRequest::get().uri("/api/v1/ready").to_request();
    let (status, body) = call_json(&app, req).await;
    assert_eq!(status, 200);
    assert_eq!(body["status"], "ready");
}

#[actix_rt::test]
async fn test_poll_mode_without_consumer_does_not_queue_progress() {
    let sse = sse_settings(SseMode::Poll);
    let backends = Backends::for_settings(&sse);
    let app = create_test_app(&backends, upload_settings(1024 * 1024), sse).await;

    for i in 0..5 {
        let upload_id = format!("poll-up-{}", i);
        let req = upload_request(&[
            Part::Text("uploadId", &upload_id),
            Part::File {
                name: "a.txt",
                mime_type: "text/plain",
                data: b"hello world",
            },
        ])
        .to_request();
        let (status, _) = call_json(&app, req).await;
        assert_eq!(status, 201);
        assert!(backends.queue.is_empty(QueueName::ProgressEvents));
    }

    let record = backends.progress.get("poll-up-4").await.unwrap().unwrap();
    assert_eq!(record.status, UploadStatus::Completed);
    assert_eq!(backends.queue.len(QueueName::FileEvents), 5);
}
