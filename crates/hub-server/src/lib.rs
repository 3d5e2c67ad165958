//! Wires the HTTP API and the WebSocket gateway into one axum app.

pub mod config;
pub mod routes;

use std::future::Future;
use std::sync::Arc;

use axum::{
    Router, middleware,
    routing::{get, post},
};
use tokio::net::TcpListener;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use tracing::info;

use hub_api::auth::{self, AppState, AppStateInner};
use hub_api::channels;
use hub_api::middleware::require_auth;
use hub_db::Store;
use hub_gateway::{ActionRouter, Registry};

use crate::config::ServerConfig;
use crate::routes::GatewayState;

/// A built app plus the registry, which the caller needs for shutdown.
pub struct Hub {
    pub app: Router,
    pub registry: Registry,
}

pub fn build(config: &ServerConfig, store: Arc<dyn Store>) -> Hub {
    let registry = Registry::new(config.outbound_buffer);
    let app_state: AppState = Arc::new(AppStateInner::new(
        store.clone(),
        config.jwt_secret.clone(),
        config.token_ttl(),
    ));

    let gateway = GatewayState {
        verifier: app_state.verifier.clone(),
        router: ActionRouter::new(store, registry.clone()),
        config: config.gateway(),
        max_frame_bytes: config.max_frame_bytes,
    };

    let public_routes = Router::new()
        .route("/api/user/create", post(auth::create_user))
        .route("/api/user/login", post(auth::login))
        .with_state(app_state.clone());

    let protected_routes = Router::new()
        .route("/api/channels", get(channels::list_channels))
        .route("/api/channels/{channel_id}/messages", get(channels::list_messages))
        .layer(middleware::from_fn_with_state(app_state.clone(), require_auth))
        .with_state(app_state);

    let ws_route = Router::new()
        .route("/ws", get(routes::ws_upgrade))
        .with_state(gateway);

    let app = Router::new()
        .route("/health", get(routes::health))
        .route("/info", get(routes::info))
        .merge(public_routes)
        .merge(protected_routes)
        .merge(ws_route)
        .layer(CorsLayer::permissive())
        .layer(TraceLayer::new_for_http());

    Hub { app, registry }
}

/// Serve until `shutdown` resolves, then close every live session.
pub async fn serve<F>(listener: TcpListener, hub: Hub, shutdown: F) -> anyhow::Result<()>
where
    F: Future<Output = ()> + Send + 'static,
{
    let Hub { app, registry } = hub;
    info!("ConnectHub listening on {}", listener.local_addr()?);

    axum::serve(listener, app)
        .with_graceful_shutdown(async move {
            shutdown.await;
            registry.close_all();
        })
        .await?;

    Ok(())
}
