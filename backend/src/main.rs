use actix_cors::Cors;
use actix_web::middleware::Logger;
use actix_web::{App, HttpServer, web};
use medvision::config::AppConfig;
use medvision::inference::{InferencePipeline, Preprocessor};
use medvision::model::torch::TorchBackend;
use medvision::model::{ModelCache, ModelRegistry};
use medvision::routes::{AppState, UploadLimits, configure_routes};
use medvision::storage::LocalUploadStore;
use std::env;
use std::sync::Arc;

fn startup_error(err: impl std::fmt::Display) -> std::io::Error {
    log::error!("Startup failed: {}", err);
    std::io::Error::other(err.to_string())
}

#[actix_web::main]
async fn main() -> std::io::Result<()> {
    dotenv::dotenv().ok();
    env_logger::init_from_env(env_logger::Env::new().default_filter_or("info"));

    if let Ok(current_dir) = env::current_dir() {
        log::info!("Current working directory: {}", current_dir.display());
    }

    let config = AppConfig::load().map_err(startup_error)?;
    let registry = ModelRegistry::from_config(&config).map_err(startup_error)?;
    let backend = TorchBackend::new(&config.runtime);
    let cache = Arc::new(ModelCache::new(registry, Box::new(backend)));

    if let Some(task) = config.preload {
        cache.preload(task).map_err(startup_error)?;
    }

    let upload_dir = config.storage.upload_dir.clone();
    let store = LocalUploadStore::create(&upload_dir, config.storage.max_file_bytes)?;
    log::info!("Staging uploads in {}", upload_dir.display());

    let pipeline = Arc::new(InferencePipeline::new(
        cache.clone(),
        Arc::new(store),
        Preprocessor::new(&config.image),
    ));
    let state = web::Data::new(AppState::new(pipeline, UploadLimits::from(&config.storage)));

    let bind_address = format!("{}:{}", config.server.host, config.server.port);
    log::info!("Starting server on {}", bind_address);

    HttpServer::new(move || {
        App::new()
            .wrap(Logger::default())
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
            .app_data(state.clone())
            .configure(|cfg| configure_routes(cfg, upload_dir.clone()))
    })
    .bind(&bind_address)?
    .run()
    .await?;

    log::info!("Server stopped, releasing resident model");
    cache.release();
    Ok(())
}
