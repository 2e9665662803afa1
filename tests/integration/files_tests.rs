//! File metadata endpoints.

use actix_web::test;
use nsm_storage_lib::config::SseMode;
use nsm_storage_lib::services::QueueName;

use super::helpers::*;

#[actix_rt::test]
async fn test_get_and_delete_uploaded_file() {
    let backends = Backends::new();
    let app = create_test_app(&backends, upload_settings(1024 * 1024), sse_settings(SseMode::Queue)).await;

    let req = upload_request(&[
        Part::Text("uploadId", "file-1"),
        Part::File {
            name: "report.pdf",
            mime_type: "application/pdf",
            data: b"%PDF-1.7",
        },
    ])
    .to_request();
    let (status, body) = call_json(&app, req).await;
    assert_eq!(status, 201);
    let file_id = body["file"]["id"].as_str().unwrap().to_string();
    backends.drain(QueueName::FileEvents).await;

    let req = test::TestRequest::get()
        .uri(&format!("/api/v1/files/{}", file_id))
        .to_request();
    let (status, body) = call_json(&app, req).await;
    assert_eq!(status, 200);
    assert_eq!(body["name"], "report.pdf");
    assert_eq!(body["mimeType"], "application/pdf");

    let req = test::TestRequest::delete()
        .uri(&format!("/api/v1/files/{}", file_id))
        .to_request();
    let (status, body) = call_json(&app, req).await;
    assert_eq!(status, 200);
    assert_eq!(body["status"], true);
    assert!(backends.files.is_empty());
    assert!(backends.blobs.is_empty());

    let events = backends.drain(QueueName::FileEvents).await;
    assert_eq!(events.len(), 1);
    assert_eq!(events[0]["event"], "FILE_DELETED");
    assert_eq!(events[0]["fileId"], file_id.as_str());

    let req = test::TestRequest::get()
        .uri(&format!("/api/v1/files/{}", file_id))
        .to_request();
    let (status, body) = call_json(&app, req).await;
    assert_eq!(status, 404);
    assert_eq!(body["error"], "NOT_FOUND");
}
