//! Web server module

pub mod client;
pub mod routes;
mod sse;

use anyhow::Result;
use axum::{
    http::{header, HeaderValue, Method},
    routing::{get, post},
    Router,
};
use std::{net::SocketAddr, path::Path, sync::Arc, time::Duration};
use tower_http::{
    cors::{Any, CorsLayer},
    services::{ServeDir, ServeFile},
    set_header::SetResponseHeaderLayer,
};
use tracing::info;

use crate::aggregator::StatsAggregator;
use crate::config::Config;
use crate::contact::ContactService;
use crate::events::EventBus;
use crate::feed::StatsFeed;

pub struct AppState {
    pub aggregator: StatsAggregator,
    pub feed: StatsFeed,
    pub contact: ContactService,
    pub event_bus: EventBus,
}

pub fn router(state: Arc<AppState>, static_dir: &str) -> Router {
    let api = Router::new()
        .route("/api/visit", post(routes::api_visit))
        .route("/api/stats", get(routes::api_stats))
        .route("/api/map", get(routes::api_map))
        .route("/api/contact", post(routes::api_contact))
        .layer(SetResponseHeaderLayer::overriding(
            header::CACHE_CONTROL,
            HeaderValue::from_static("no-store"),
        ));

    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods([Method::GET, Method::POST])
        .allow_headers([header::CONTENT_TYPE]);

    Router::new()
        // Portfolio page
        .route_service("/", ServeFile::new(Path::new(static_dir).join("index.html")))
        .nest_service("/static", ServeDir::new(static_dir))
        // Live visit feed
        .route("/events", get(sse::events_handler))
        .merge(api)
        .layer(cors)
        .with_state(state)
}

pub async fn start_server(config: &Config, state: Arc<AppState>) -> Result<()> {
    let app = router(state, &config.server.static_dir);

    let https = if config.tls_enabled() {
        let addr: SocketAddr = format!("{}:{}", config.server.host, config.server.https_port).parse()?;
        let tls = axum_server::tls_rustls::RustlsConfig::from_pem_file(
            &config.server.tls_cert,
            &config.server.tls_key,
        )
        .await?;
        let handle = axum_server::Handle::new();
        let service = app.clone().into_make_service_with_connect_info::<SocketAddr>();
        let server = axum_server::bind_rustls(addr, tls).handle(handle.clone());
        info!("HTTPS server starting on https://{}", addr);
        let task = tokio::spawn(async move {
            if let Err(e) = server.serve(service).await {
                tracing::error!("HTTPS server failed: {}", e);
            }
        });
        Some((handle, task))
    } else {
        None
    };

    let addr = format!("{}:{}", config.server.host, config.server.http_port);
    info!("Web server starting on http://{}", addr);

    let listener = tokio::net::TcpListener::bind(&addr).await?;
    axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(shutdown_signal())
    .await?;

    if let Some((handle, task)) = https {
        handle.graceful_shutdown(Some(Duration::from_secs(5)));
        let _ = task.await;
    }

    info!("Web server stopped");
    Ok(())
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::error!("Failed to listen for shutdown signal: {}", e);
        std::future::pending::<()>().await;
    }
    info!("Shutdown signal received");
}
