use actix_cors::Cors;
use actix_web::{web, App, HttpServer};
use mri_triage::inference::torch::TorchEngine;
use mri_triage::routes::configure_routes;
use mri_triage::{AppConfig, ScanService};
use std::env;
use std::sync::Arc;

#[actix_web::main]
async fn main() -> std::io::Result<()> {
    dotenv::dotenv().ok();
    env_logger::init_from_env(env_logger::Env::new().default_filter_or("info"));

    if let Ok(current_dir) = env::current_dir() {
        log::info!("Current working directory: {}", current_dir.display());
    } else {
        log::error!("Failed to get the current working directory.");
    }

    let config = AppConfig::from_env().map_err(|e| {
        log::error!("Failed to load configuration: {}", e);
        std::io::Error::new(std::io::ErrorKind::InvalidInput, e.to_string())
    })?;

    let service = ScanService::from_config(config, Arc::new(TorchEngine::new()));
    for model in service.inventory() {
        if model.available {
            log::info!("Model '{}' available at {}", model.name, model.artifact_path);
        } else {
            log::warn!("Model '{}' not trained yet ({} missing)", model.name, model.artifact_path);
        }
    }

    let bind_address = service.config().bind_address();
    let service = web::Data::new(service);

    log::info!("Starting server on {}", bind_address);

    HttpServer::new(move || {
        App::new()
            .wrap(
                Cors::default()
                    .allow_any_origin()
                    .allowed_methods(vec!["GET", "POST", "OPTIONS"])
                    .allowed_headers(vec![
                        actix_web::http::header::ACCEPT,
                        actix_web::http::header::CONTENT_TYPE,
                    ])
                    .max_age(3600),
            )
            .app_data(service.clone())
            .configure(configure_routes)
    })
    .bind(&bind_address)?
    .run()
    .await
}
