//! Multipart upload endpoint.

use actix_multipart::{Field, Multipart};
use actix_web::http::header::CONTENT_LENGTH;
use actix_web::{HttpRequest, HttpResponse, web};
use futures_util::StreamExt;
use serde::Deserialize;
use tracing::debug;
use utoipa::{IntoParams, ToSchema};

use crate::config::{FILE_SIZE_HEADER, FOLDER_ID_HEADER, UPLOAD_ID_HEADER};
use crate::error::{AppError, AppResult};
use crate::models::ROOT_FOLDER_ID;
use crate::services::{FilePart, UploadPipeline, UploadRequest};

/// Longest accepted value of a text field.
const MAX_TEXT_FIELD_LEN: usize = 1024;

/// Query parameters accepted by the upload endpoint.
#[derive(Debug, Default, Deserialize, IntoParams)]
#[serde(rename_all = "camelCase")]
#[into_params(parameter_in = Query)]
pub struct UploadQuery {
    /// Upload identifier, used when neither field nor header carries one
    pub upload_id: Option<String>,
    /// Destination folder, used when neither field nor header carries one
    pub folder_id: Option<String>,
}

/// Multipart body layout, for the API documentation.
#[derive(ToSchema)]
#[schema(rename_all = "camelCase")]
#[allow(dead_code)]
pub struct UploadForm {
    upload_id: Option<String>,
    folder_id: Option<String>,
    file_size: Option<u64>,
    /// Must come after the text fields
    #[schema(value_type = String, format = Binary)]
    file: Vec<u8>,
}

/// Text fields seen before the file part.
#[derive(Debug, Default)]
struct FormFields {
    upload_id: Option<String>,
    folder_id: Option<String>,
    file_size: Option<u64>,
}

fn header_str<'a>(req: &'a HttpRequest, name: &str) -> Option<&'a str> {
    req.headers()
        .get(name)
        .and_then(|v| v.to_str().ok())
        .map(str::trim)
        .filter(|v| !v.is_empty())
}

fn non_empty(value: Option<String>) -> Option<String> {
    value.map(|v| v.trim().to_string()).filter(|v| !v.is_empty())
}

/// Resolve identifiers and declared size.
///
/// Form fields win over headers, headers over query parameters. The declared
/// size falls back to `Content-Length` of the whole request.
fn resolve_request(
    req: &HttpRequest,
    query: &UploadQuery,
    fields: FormFields,
) -> AppResult<UploadRequest> {
    let upload_id = non_empty(fields.upload_id)
        .or_else(|| header_str(req, UPLOAD_ID_HEADER).map(str::to_string))
        .or_else(|| non_empty(query.upload_id.clone()))
        .ok_or(AppError::MissingUploadId)?;

    let folder_id = non_empty(fields.folder_id)
        .or_else(|| header_str(req, FOLDER_ID_HEADER).map(str::to_string))
        .or_else(|| non_empty(query.folder_id.clone()))
        .unwrap_or_else(|| ROOT_FOLDER_ID.to_string());

    let declared_size = fields
        .file_size
        .or_else(|| header_str(req, FILE_SIZE_HEADER).and_then(|v| v.parse().ok()))
        .or_else(|| header_str(req, CONTENT_LENGTH.as_str()).and_then(|v| v.parse().ok()));

    Ok(UploadRequest {
        upload_id,
        folder_id,
        declared_size,
    })
}

async fn read_text_field(field: &mut Field) -> AppResult<String> {
    let mut buf = Vec::new();
    while let Some(chunk) = field.next().await {
        let chunk = chunk.map_err(|e| AppError::MalformedMultipart(e.to_string()))?;
        if buf.len() + chunk.len() > MAX_TEXT_FIELD_LEN {
            return Err(AppError::MalformedMultipart(
                "Form field value too long".to_string(),
            ));
        }
        buf.extend_from_slice(&chunk);
    }
    String::from_utf8(buf)
        .map(|s| s.trim().to_string())
        .map_err(|_| AppError::MalformedMultipart("Form field is not UTF-8".to_string()))
}

async fn drain_field(field: &mut Field) -> AppResult<()> {
    while let Some(chunk) = field.next().await {
        chunk.map_err(|e| AppError::MalformedMultipart(e.to_string()))?;
    }
    Ok(())
}

/// Upload one file.
///
/// The first file part is streamed to object storage while progress is
/// published for `GET /api/v1/events/upload/{uploadId}` subscribers.
#[utoipa::path(
    post,
    path = "/api/v1/upload",
    tag = "Uploads",
    params(
        UploadQuery,
        ("x-upload-id" = Option<String>, Header, description = "Upload identifier"),
        ("x-folder-id" = Option<String>, Header, description = "Destination folder"),
        ("x-file-size" = Option<u64>, Header, description = "Declared file size in bytes")
    ),
    request_body(content = UploadForm, content_type = "multipart/form-data"),
    responses(
        (status = 201, description = "File stored", body = crate::models::UploadResponse),
        (status = 400, description = "Missing uploadId, malformed body or file too large", body = crate::error::ErrorResponse),
        (status = 415, description = "File type not allowed", body = crate::error::ErrorResponse),
        (status = 500, description = "Storage backend failure", body = crate::error::ErrorResponse)
    )
)]
pub async fn upload_file(
    req: HttpRequest,
    query: web::Query<UploadQuery>,
    pipeline: web::Data<UploadPipeline>,
    mut payload: Multipart,
) -> AppResult<HttpResponse> {
    let query = query.into_inner();
    let mut fields = FormFields::default();
    let mut response = None;

    while let Some(item) = payload.next().await {
        let mut field =
            item.map_err(|e| AppError::MalformedMultipart(format!("Multipart error: {}", e)))?;

        let file_name = field
            .content_disposition()
            .and_then(|cd| cd.get_filename())
            .map(str::to_string);

        let Some(file_name) = file_name else {
            let name = field.name().unwrap_or_default().to_string();
            match name.as_str() {
                "uploadId" => fields.upload_id = Some(read_text_field(&mut field).await?),
                "folderId" => fields.folder_id = Some(read_text_field(&mut field).await?),
                "fileSize" => {
                    let value = read_text_field(&mut field).await?;
                    fields.file_size = value.parse().ok();
                }
                _ => drain_field(&mut field).await?,
            }
            continue;
        };

        if response.is_some() {
            debug!(file_name = %file_name, "Ignoring additional file part");
            drain_field(&mut field).await?;
            continue;
        }

        let request = resolve_request(&req, &query, std::mem::take(&mut fields))?;
        let mime_type = field
            .content_type()
            .map(|m| m.to_string())
            .unwrap_or_else(|| "application/octet-stream".to_string());

        let session = pipeline
            .start(
                request,
                FilePart {
                    file_name,
                    mime_type,
                },
            )
            .await?;
        response = Some(session.ingest(field).await?);
    }

    let response = response
        .ok_or_else(|| AppError::MalformedMultipart("No file part in request".to_string()))?;

    Ok(HttpResponse::Created().json(response))
}

/// Configure upload routes.
pub fn configure_routes(cfg: &mut web::ServiceConfig) {
    cfg.service(web::resource("/upload").route(web::post().to(upload_file)));
}
