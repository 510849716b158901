mod database;
mod handlers;
mod model;
mod settings;

use actix_cors::Cors;
use actix_web::{middleware::Logger, web, App, HttpServer};
use anyhow::Context;
use log::info;
use settings::Settings;

#[actix_rt::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();
    env_logger::Builder::from_env(
        env_logger::Env::default().default_filter_or(settings::DEFAULT_LOG_FILTER),
    )
    .init();

    let settings = Settings::new()?;
    let store = database::open(&settings.db_url)
        .await
        .context("Could not open the database")?;

    info!("Listening on 0.0.0.0:{}", settings.port);
    HttpServer::new(move || {
        App::new()
            .wrap(Logger::default())
            .wrap(Cors::permissive())
            .configure(handlers::configure(store.clone()))
            .default_service(web::to(handlers::not_found))
    })
    .bind(("0.0.0.0", settings.port))
    .with_context(|| format!("Could not bind port {}", settings.port))?
    .run()
    .await?;
    Ok(())
}
