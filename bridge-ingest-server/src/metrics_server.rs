//! Prometheus scrape endpoint for the collectors of the ingestion core.

use actix_web::{App, HttpResponse, HttpServer, dev::Server, web};
use anyhow::Context;
use blockscout_service_launcher::launcher::MetricsSettings;
use prometheus::{Encoder, Registry, TextEncoder};

async fn metrics(registry: web::Data<Registry>) -> HttpResponse {
    let encoder = TextEncoder::new();
    let mut buffer = Vec::new();
    if let Err(err) = encoder.encode(&registry.gather(), &mut buffer) {
        tracing::error!(err = ?err, "failed to encode metrics");
        return HttpResponse::InternalServerError().finish();
    }
    HttpResponse::Ok()
        .content_type(encoder.format_type())
        .body(buffer)
}

async fn health() -> HttpResponse {
    HttpResponse::Ok().json(serde_json::json!({"status": "SERVING"}))
}

fn configure_routes(
    registry: Registry,
    route: String,
) -> impl FnOnce(&mut web::ServiceConfig) {
    move |config| {
        config
            .app_data(web::Data::new(registry))
            .route(&route, web::get().to(metrics))
            .route("/health", web::get().to(health));
    }
}

/// Binds the metrics server. The returned server must be polled to run and
/// is stopped through its handle.
pub fn serve(settings: &MetricsSettings, registry: Registry) -> Result<Server, anyhow::Error> {
    tracing::info!(addr = %settings.addr, route = %settings.route, "starting metrics server");
    let route = settings.route.clone();
    let server = HttpServer::new(move || {
        App::new().configure(configure_routes(registry.clone(), route.clone()))
    })
    .workers(1)
    .disable_signals()
    .bind(settings.addr)
    .with_context(|| format!("failed to bind metrics server on {}", settings.addr))?
    .run();
    Ok(server)
}
