mod api;

use actix_cors::Cors;
use actix_web::{web, App, HttpServer};
use api::AppState;
use canvasnodes::Settings;
use std::path::PathBuf;
use tracing::info;
use tracing_subscriber::EnvFilter;

#[actix_web::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    info!("🚀 Starting Canvas Server");

    let settings = match std::env::var("CANVAS_CONFIG") {
        Ok(path) => Settings::load(&PathBuf::from(path))?,
        Err(_) => Settings::default(),
    };
    let runtime = settings.build_runtime()?;

    info!(
        "✅ Runtime initialized: {} provider(s), {} template(s)",
        runtime.providers().len(),
        runtime.templates().len()
    );

    let app_state = web::Data::new(AppState::new(runtime));
    let bind_address = std::env::var("BIND_ADDRESS").unwrap_or_else(|_| "0.0.0.0:3000".to_string());

    info!("🌐 Server starting on http://{}", bind_address);

    HttpServer::new(move || {
        let cors = Cors::default()
            .allow_any_origin()
            .allow_any_method()
            .allow_any_header()
            .max_age(3600);

        App::new()
            .app_data(app_state.clone())
            .wrap(cors)
            .wrap(actix_web::middleware::Logger::default())
            .configure(api::configure)
    })
    .bind(&bind_address)?
    .run()
    .await?;

    Ok(())
}
