use actix_multipart::Multipart;
use actix_web::{web, Error, HttpResponse};
use futures::{StreamExt, TryStreamExt};
use serde_json::json;
use std::time::Duration;

use crate::error::InferenceError;
use crate::report::ScanService;

pub fn configure_routes(cfg: &mut web::ServiceConfig) {
    cfg.service(web::resource("/api/inference").route(web::post().to(handle_inference)))
        .service(web::resource("/api/compare").route(web::post().to(handle_compare)))
        .service(web::resource("/api/models").route(web::get().to(list_models)))
        .service(web::resource("/api/health").route(web::get().to(health)));
}

async fn handle_inference(
    service: web::Data<ScanService>,
    payload: Multipart,
) -> Result<HttpResponse, Error> {
    let image_data = read_upload(payload, service.config().inference.max_upload_bytes).await?;
    log::info!("Received scan upload of {} bytes", image_data.len());

    let report = run_blocking(&service, move |service| service.analyze(&image_data)).await?;
    Ok(HttpResponse::Ok().json(report))
}

async fn handle_compare(
    service: web::Data<ScanService>,
    payload: Multipart,
) -> Result<HttpResponse, Error> {
    let image_data = read_upload(payload, service.config().inference.max_upload_bytes).await?;
    let rows = run_blocking(&service, move |service| service.compare(&image_data)).await?;
    Ok(HttpResponse::Ok().json(rows))
}

async fn list_models(service: web::Data<ScanService>) -> HttpResponse {
    HttpResponse::Ok().json(service.inventory())
}

async fn health(service: web::Data<ScanService>) -> HttpResponse {
    let available = service
        .inventory()
        .iter()
        .filter(|model| model.available)
        .count();
    HttpResponse::Ok().json(json!({
        "status": "ok",
        "engine": service.registry().engine_name(),
        "models_root": service.registry().root().display().to_string(),
        "available_models": available,
    }))
}

/// Multipart field carrying the scan.
pub const UPLOAD_FIELD: &str = "file";

/// Bytes of the first non-empty file part: the `file` field, or any field
/// sent with a filename. Plain form fields are drained and ignored.
async fn read_upload(mut payload: Multipart, max_bytes: usize) -> Result<Vec<u8>, Error> {
    while let Some(mut field) = payload.try_next().await? {
        let has_filename = field
            .content_disposition()
            .and_then(|disposition| disposition.get_filename())
            .is_some();
        if field.name() != Some(UPLOAD_FIELD) && !has_filename {
            log::debug!("Ignoring multipart field {:?}", field.name());
            while let Some(chunk) = field.next().await {
                chunk?;
            }
            continue;
        }

        let mut image_data = Vec::new();
        while let Some(chunk) = field.next().await {
            let data = chunk?;
            let size = image_data.len() + data.len();
            if size > max_bytes {
                return Err(InferenceError::UploadTooLarge {
                    size,
                    max: max_bytes,
                }
                .into());
            }
            image_data.extend_from_slice(&data);
        }
        if !image_data.is_empty() {
            return Ok(image_data);
        }
    }
    Err(InferenceError::EmptyUpload.into())
}

/// Runs `job` on the blocking pool, bounded by `inference.timeout_secs`.
async fn run_blocking<T, F>(service: &web::Data<ScanService>, job: F) -> Result<T, Error>
where
    T: Send + 'static,
    F: FnOnce(&ScanService) -> Result<T, InferenceError> + Send + 'static,
{
    let timeout_secs = service.config().inference.timeout_secs;
    let service = service.clone();
    let task = web::block(move || job(&service));

    match tokio::time::timeout(Duration::from_secs(timeout_secs), task).await {
        Ok(joined) => {
            let result = joined?;
            Ok(result?)
        }
        Err(_) => Err(InferenceError::Timeout(timeout_secs).into()),
    }
}
