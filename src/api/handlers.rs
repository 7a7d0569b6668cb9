use actix_multipart::{Multipart, MultipartError};
use actix_web::http::header::{self, ContentDisposition, DispositionParam, DispositionType};
use actix_web::{delete, get, post, web, HttpRequest, HttpResponse};
use bytes::Bytes;
use futures::TryStreamExt;
use log::{debug, info, warn};
use serde_json::json;
use std::collections::HashMap;
use std::io::{self, Write};
use std::sync::Arc;
use tempfile::NamedTempFile;
use uuid::Uuid;

use crate::api::{streaming, REQUEST_ID_KEY};
use crate::app_state::AppState;
use crate::error::ArchiveError;
use crate::service::query::TICKET_NUMBER_PARAM;
use crate::service::ArchiveService;

/// Multipart field carrying the uploaded file
const FILE_FIELD: &str = "file";

fn request_context(req: &HttpRequest) -> String {
    let request_id = Uuid::new_v4().to_string();
    log_mdc::insert(REQUEST_ID_KEY, &request_id);
    debug!("{} {}", req.method(), req.uri());
    request_id
}

/// Run a service call on the blocking pool, carrying the request id along.
async fn run_blocking<T, F>(state: &AppState, request_id: String, call: F) -> Result<T, ArchiveError>
where
    T: Send + 'static,
    F: FnOnce(&ArchiveService) -> Result<T, ArchiveError> + Send + 'static,
{
    let service = Arc::clone(&state.archive_service);
    web::block(move || {
        log_mdc::insert(REQUEST_ID_KEY, &request_id);
        let result = call(&service);
        log_mdc::remove(REQUEST_ID_KEY);
        result
    })
    .await
    .map_err(|e| ArchiveError::from(io::Error::new(io::ErrorKind::Other, e.to_string())))?
}

/// Append one received part chunk to the staging file on the blocking pool.
async fn append_chunk(mut temp: NamedTempFile, chunk: Bytes) -> Result<NamedTempFile, ArchiveError> {
    web::block(move || temp.write_all(&chunk).map(|_| temp))
        .await
        .map_err(|e| ArchiveError::from(io::Error::new(io::ErrorKind::Other, e.to_string())))?
        .map_err(ArchiveError::from)
}

fn multipart_error(err: MultipartError) -> ArchiveError {
    warn!("Malformed multipart body: {}", err);
    ArchiveError::validation(format!("Invalid multipart body: {}", err))
}

#[get("/archive")]
pub async fn list(
    req: HttpRequest,
    query: web::Query<HashMap<String, String>>,
    state: web::Data<AppState>,
) -> Result<HttpResponse, ArchiveError> {
    let request_id = request_context(&req);
    let params = query.into_inner();
    let files = run_blocking(&state, request_id, move |service| service.list(&params)).await?;
    Ok(HttpResponse::Ok().json(files))
}

#[get("/archive/count")]
pub async fn count(req: HttpRequest, state: web::Data<AppState>) -> Result<HttpResponse, ArchiveError> {
    let request_id = request_context(&req);
    let total = run_blocking(&state, request_id, |service| service.count()).await?;
    Ok(HttpResponse::Ok().json(json!({ "totalRecords": total })))
}

#[post("/archive")]
pub async fn upload(
    req: HttpRequest,
    mut payload: Multipart,
    query: web::Query<HashMap<String, String>>,
    state: web::Data<AppState>,
) -> Result<HttpResponse, ArchiveError> {
    let request_id = request_context(&req);
    let max_size = state.config.server.max_payload_size;
    let mut staged = None;

    while let Some(mut field) = payload.try_next().await.map_err(multipart_error)? {
        if staged.is_some() || field.name() != Some(FILE_FIELD) {
            while field.try_next().await.map_err(multipart_error)?.is_some() {}
            continue;
        }

        let filename = field
            .content_disposition()
            .and_then(|cd| cd.get_filename())
            .map(str::trim)
            .filter(|name| !name.is_empty())
            .map(str::to_string)
            .ok_or_else(|| ArchiveError::validation("Filename is required"))?;

        // received into a temp file, removed once it is dropped
        let mut temp = tempfile::Builder::new()
            .prefix("upload-")
            .tempfile_in(&state.config.upload.temp_dir)?;
        let mut received = 0u64;
        while let Some(chunk) = field.try_next().await.map_err(multipart_error)? {
            received += chunk.len() as u64;
            if received > max_size {
                warn!("Upload of {} exceeds {} bytes", filename, max_size);
                return Err(ArchiveError::validation(format!(
                    "Upload exceeds the maximum size of {} bytes",
                    max_size
                )));
            }
            temp = append_chunk(temp, chunk).await?;
        }
        info!("Received {} ({} bytes) into {}", filename, received, temp.path().display());
        staged = Some((temp, filename));
    }

    let (temp, filename) =
        staged.ok_or_else(|| ArchiveError::validation(format!("Missing multipart field '{}'", FILE_FIELD)))?;
    let ticket_number = query.get(TICKET_NUMBER_PARAM).cloned();

    let id = run_blocking(&state, request_id, move |service| {
        service.upload(temp, &filename, ticket_number.as_deref())
    })
    .await?;

    let location = {
        let conn = req.connection_info();
        format!(
            "{}://{}{}/{}",
            conn.scheme(),
            conn.host(),
            req.path().trim_end_matches('/'),
            id
        )
    };
    Ok(HttpResponse::Created()
        .insert_header((header::LOCATION, location))
        .json(json!({ "id": id })))
}

#[get("/archive/exists/hash/{hash}")]
pub async fn exists_by_hash(
    req: HttpRequest,
    path: web::Path<String>,
    state: web::Data<AppState>,
) -> Result<HttpResponse, ArchiveError> {
    hash_exists_response(&req, path.into_inner(), &state).await
}

/// Short form of `/archive/exists/hash/{hash}`
#[get("/archive/exists/{hash}")]
pub async fn exists(
    req: HttpRequest,
    path: web::Path<String>,
    state: web::Data<AppState>,
) -> Result<HttpResponse, ArchiveError> {
    hash_exists_response(&req, path.into_inner(), &state).await
}

async fn hash_exists_response(req: &HttpRequest, hash: String, state: &AppState) -> Result<HttpResponse, ArchiveError> {
    let request_id = request_context(req);
    let found = run_blocking(state, request_id, move |service| service.hash_exists(&hash)).await?;
    Ok(HttpResponse::Ok().json(json!({ "exists": found })))
}

#[get("/archive/exists/id/{id}")]
pub async fn exists_by_id(
    req: HttpRequest,
    path: web::Path<String>,
    state: web::Data<AppState>,
) -> Result<HttpResponse, ArchiveError> {
    let request_id = request_context(&req);
    let id = path.into_inner();
    let found = run_blocking(&state, request_id, move |service| service.id_exists(&id)).await?;
    Ok(HttpResponse::Ok().json(json!({ "exists": found })))
}

#[get("/archive/exists/name/{filename}")]
pub async fn exists_by_name(
    req: HttpRequest,
    path: web::Path<String>,
    state: web::Data<AppState>,
) -> Result<HttpResponse, ArchiveError> {
    let request_id = request_context(&req);
    let filename = path.into_inner();
    let found = run_blocking(&state, request_id, move |service| service.filename_exists(&filename)).await?;
    Ok(HttpResponse::Ok().json(json!({ "exists": found })))
}

#[get("/archive/download/{id}")]
pub async fn download(
    req: HttpRequest,
    path: web::Path<String>,
    state: web::Data<AppState>,
) -> Result<HttpResponse, ArchiveError> {
    let request_id = request_context(&req);
    let id = path.into_inner();

    // resolve first so a missing id is a proper 404 rather than a broken stream
    let lookup_id = id.clone();
    let info = run_blocking(&state, request_id.clone(), move |service| service.get_info(&lookup_id)).await?;
    info!("Streaming {} ({}, {} bytes)", info.id, info.filename, info.length);

    let body = streaming::download_body(Arc::clone(&state.archive_service), id, request_id);
    Ok(HttpResponse::Ok()
        .content_type("application/octet-stream")
        .insert_header(ContentDisposition {
            disposition: DispositionType::Attachment,
            parameters: vec![DispositionParam::Filename(info.filename)],
        })
        .no_chunking(info.length)
        .streaming(body))
}

#[get("/archive/{id}")]
pub async fn get_info(
    req: HttpRequest,
    path: web::Path<String>,
    state: web::Data<AppState>,
) -> Result<HttpResponse, ArchiveError> {
    let request_id = request_context(&req);
    let id = path.into_inner();
    let info = run_blocking(&state, request_id, move |service| service.get_info(&id)).await?;
    Ok(HttpResponse::Ok().json(info))
}

#[delete("/archive/{id}")]
pub async fn delete(
    req: HttpRequest,
    path: web::Path<String>,
    state: web::Data<AppState>,
) -> Result<HttpResponse, ArchiveError> {
    let request_id = request_context(&req);
    let id = path.into_inner();
    run_blocking(&state, request_id, move |service| service.delete(&id)).await?;
    Ok(HttpResponse::Ok().finish())
}
