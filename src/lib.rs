pub mod auth;
pub mod config;
pub mod hub;
pub mod http;
pub mod metrics;
pub mod state;

use std::net::SocketAddr;
use std::path::Path;
use std::sync::Arc;

use anyhow::Result;
use axum::Router;
use axum::extract::connect_info::IntoMakeServiceWithConnectInfo;
use sendie_core::{AllowList, RateLimiter, SessionRegistry, TtlConfig};
use tokio::net::TcpListener;

use crate::config::Config;
use crate::hub::Hub;
use crate::state::AppState;

/// Software banner reported by clients that care to log it.
pub static SOFTWARE: &str = concat!("sendie/", env!("CARGO_PKG_VERSION"));

fn build_router(state: Arc<AppState>) -> IntoMakeServiceWithConnectInfo<Router, SocketAddr> {
    let app = Router::new()
        .merge(http::router())
        .route("/hub", axum::routing::get(hub_upgrade))
        .with_state(state);

    app.into_make_service_with_connect_info::<SocketAddr>()
}

async fn hub_upgrade(
    ws: axum::extract::ws::WebSocketUpgrade,
    axum::extract::State(state): axum::extract::State<Arc<AppState>>,
    principal: auth::Principal,
) -> impl axum::response::IntoResponse {
    ws.on_upgrade(move |socket| async move {
        state.hub.clone().handle_connection(socket, principal.user_id).await;
    })
}

/// Builds the process-wide shared state: allow-list loaded from disk,
/// session registry, rate limiter, and the signaling hub wired to both.
pub fn build_state(config: Arc<Config>) -> Result<Arc<AppState>> {
    let allow_list = Arc::new(AllowList::load(
        config.access_control.admins.clone(),
        config.access_control.initial_allow_list.clone(),
        Path::new(&config.data_directory),
    )?);

    let ttl: TtlConfig = (&config.session).into();
    let sessions = SessionRegistry::new(ttl);
    let rate_limiter = RateLimiter::new();
    let hub = Hub::new(sessions.clone(), rate_limiter.clone());

    Ok(Arc::new(AppState { config, sessions, rate_limiter, allow_list, hub }))
}

/// Binds the configured listen address and returns it alongside the built
/// state, without starting to serve — split out so integration tests can
/// bind an ephemeral port (`config.http.listen` with port 0) and learn the
/// real address via `TcpListener::local_addr`.
pub async fn bind(config: Arc<Config>) -> Result<(TcpListener, Arc<AppState>)> {
    let state = build_state(config.clone())?;
    let listener = TcpListener::bind(config.http.listen).await?;
    Ok((listener, state))
}

/// Serves `state` on `listener` until a shutdown signal or, in tests, the
/// caller's own cancellation.
pub async fn serve(listener: TcpListener, state: Arc<AppState>) -> Result<()> {
    log::info!("sendie signaling service listening on {}", listener.local_addr()?);
    axum::serve(listener, build_router(state)).with_graceful_shutdown(shutdown_signal()).await?;
    Ok(())
}

/// Composes the process: builds the shared registries, binds the listener,
/// and serves until shutdown. Kept separate from `main` so integration
/// tests can drive a real server without a process boundary.
pub async fn startup(config: Arc<Config>) -> Result<()> {
    let (listener, state) = bind(config).await?;
    serve(listener, state).await
}

async fn shutdown_signal() {
    let _ = tokio::signal::ctrl_c().await;
    log::info!("shutdown signal received");
}
