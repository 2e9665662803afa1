//! File metadata API handlers.

use actix_web::{HttpResponse, web};
use uuid::Uuid;

use crate::error::AppResult;
use crate::models::DeleteFileResponse;
use crate::services::FileService;

/// Get a file record.
#[utoipa::path(
    get,
    path = "/api/v1/files/{file_id}",
    tag = "Files",
    params(
        ("file_id" = Uuid, Path, description = "File ID")
    ),
    responses(
        (status = 200, description = "File record", body = crate::models::FileRecord),
        (status = 404, description = "File not found", body = crate::error::ErrorResponse)
    )
)]
pub async fn get_file(
    service: web::Data<FileService>,
    path: web::Path<Uuid>,
) -> AppResult<HttpResponse> {
    let record = service.get(path.into_inner()).await?;
    Ok(HttpResponse::Ok().json(record))
}

/// Delete a file and its stored object.
#[utoipa::path(
    delete,
    path = "/api/v1/files/{file_id}",
    tag = "Files",
    params(
        ("file_id" = Uuid, Path, description = "File ID")
    ),
    responses(
        (status = 200, description = "File deleted", body = DeleteFileResponse),
        (status = 404, description = "File not found", body = crate::error::ErrorResponse)
    )
)]
pub async fn delete_file(
    service: web::Data<FileService>,
    path: web::Path<Uuid>,
) -> AppResult<HttpResponse> {
    let record = service.delete(path.into_inner()).await?;
    Ok(HttpResponse::Ok().json(DeleteFileResponse {
        status: true,
        id: record.id,
    }))
}

/// Configure file routes.
pub fn configure_routes(cfg: &mut web::ServiceConfig) {
    cfg.service(
        web::resource("/files/{file_id}")
            .route(web::get().to(get_file))
            .route(web::delete().to(delete_file)),
    );
}
