//! OpenAPI documentation configuration.

use utoipa::OpenApi;

use crate::{api, error, models};

/// OpenAPI documentation.
#[derive(OpenApi)]
#[openapi(
    info(
        title = "NSM Storage Server",
        version = "0.3.0",
        description = "File storage server with streaming uploads and live upload progress over server-sent events"
    ),
    servers(
        (url = "/", description = "Local server")
    ),
    paths(
        // Health endpoints
        api::health::health,
        api::health::ready,
        // Upload endpoints
        api::upload::upload_file,
        api::events::upload_events,
        // File endpoints
        api::files::get_file,
        api::files::delete_file,
    ),
    components(
        schemas(
            // Common
            error::ErrorResponse,
            // Health
            api::health::HealthResponse,
            api::health::ReadyResponse,
            api::upload::UploadForm,
            // Uploads
            models::UploadStatus,
            models::UploadResponse,
            models::FileRecord,
            models::DeleteFileResponse,
        )
    ),
    tags(
        (name = "Health", description = "Health check endpoints"),
        (name = "Uploads", description = "Streaming uploads and progress events"),
        (name = "Files", description = "File metadata and deletion")
    )
)]
pub struct ApiDoc;
