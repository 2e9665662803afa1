//! Server-sent progress events.

use actix_web::http::header::{CACHE_CONTROL, CONTENT_TYPE};
use actix_web::{HttpResponse, web};
use tracing::debug;

use crate::error::{AppError, AppResult};
use crate::services::EventStreams;

/// Stream progress of one upload.
///
/// Starts with a `connected` event, then sends a `data:` frame per progress
/// update and a `ping` event as heartbeat. The stream ends after the
/// terminal update.
#[utoipa::path(
    get,
    path = "/api/v1/events/upload/{upload_id}",
    tag = "Uploads",
    params(
        ("upload_id" = String, Path, description = "Upload identifier")
    ),
    responses(
        (status = 200, description = "Event stream", content_type = "text/event-stream", body = String),
        (status = 400, description = "Empty upload id", body = crate::error::ErrorResponse)
    )
)]
pub async fn upload_events(
    streams: web::Data<EventStreams>,
    path: web::Path<String>,
) -> AppResult<HttpResponse> {
    let upload_id = path.into_inner();
    if upload_id.trim().is_empty() {
        return Err(AppError::MissingUploadId);
    }

    debug!(upload_id = %upload_id, mode = ?streams.mode(), "SSE connection opened");

    Ok(HttpResponse::Ok()
        .insert_header((CONTENT_TYPE, "text/event-stream"))
        .insert_header((CACHE_CONTROL, "no-cache"))
        .insert_header(("X-Accel-Buffering", "no"))
        .streaming(streams.open(&upload_id)))
}

/// Configure event routes.
pub fn configure_routes(cfg: &mut web::ServiceConfig) {
    cfg.service(web::resource("/events/upload/{upload_id}").route(web::get().to(upload_events)));
}
