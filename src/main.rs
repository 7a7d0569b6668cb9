use actix_web::{middleware, web, App, HttpServer};
use log::{error, info, warn};
use std::fs;

use snapshot_archive::api;
use snapshot_archive::app_state::AppState;
use snapshot_archive::config::AppConfig;

fn init_logging(config_file: &str) {
    if let Err(e) = log4rs::init_file(config_file, Default::default()) {
        env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();
        warn!("Could not load log config {}: {}, falling back to env_logger", config_file, e);
    }
}

#[actix_web::main]
async fn main() -> std::io::Result<()> {
    let config = AppConfig::load().map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidInput, e.to_string()))?;
    init_logging(&config.logging.config_file);

    fs::create_dir_all(&config.upload.temp_dir)?;
    let state = AppState::from_config(config.clone()).map_err(|e| {
        error!("Failed to initialize archive: {}", e);
        std::io::Error::new(std::io::ErrorKind::Other, e.to_string())
    })?;
    let state = web::Data::new(state);

    info!("Starting server on {}:{}", config.server.host, config.server.port);
    HttpServer::new(move || {
        App::new()
            .wrap(middleware::Logger::default())
            .app_data(state.clone())
            .configure(api::configure)
    })
    .workers(config.server.workers)
    .bind((config.server.host.as_str(), config.server.port))?
    .run()
    .await
}
