mod admission;
mod config;
mod errors;
mod game_manager;
mod lobby;
mod router;
mod session;
mod transport;

use crate::admission::AdmissionState;
use crate::config::Config;
use crate::errors::ConfigError;
use crate::router::run_router;
use axum::Router;
use axum::extract::State;
use axum::routing::get;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

const CONFIG_PATH: &str = "HubConfig.json";

#[tokio::main]
/// Activates error tracing, loads the hub configuration, and wires the
/// router/lobby/game-manager tasks together before serving the websocket and
/// status routes. Unlike the teacher's `main`, a bad config is surfaced as an
/// error return rather than a panic, so the process exit code tells the
/// difference between "crashed" and "refused to start".
async fn main() -> Result<(), ConfigError> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| format!("{}=trace", env!("CARGO_CRATE_NAME")).into()),
        )
        .with(
            tracing_subscriber::fmt::layer()
                .with_file(true)
                .with_line_number(true)
                .with_target(true)
                .with_thread_ids(true)
                .with_thread_names(true),
        )
        .init();

    let config = Arc::new(Config::load(CONFIG_PATH).await?);
    tracing::info!(?config, "configuration loaded");

    let cancel = CancellationToken::new();

    // lobby -> router
    let (to_router_tx, from_lobby_rx) = mpsc::channel(protocol::CHANNEL_BUFFER_SIZE);
    // lobby -> router, admin requests
    let (to_router_admin_tx, router_from_admin_rx) = mpsc::channel(protocol::CHANNEL_BUFFER_SIZE);
    // sessions -> router
    let (from_sessions_tx, from_sessions_rx) = mpsc::channel(protocol::CHANNEL_BUFFER_SIZE);
    // router -> lobby
    let (router_to_lobby_tx, lobby_from_router_rx) = mpsc::channel(protocol::CHANNEL_BUFFER_SIZE);
    // game manager -> lobby
    let (from_games_tx, lobby_from_games_rx) = mpsc::channel(protocol::CHANNEL_BUFFER_SIZE);
    // lobby -> game manager
    let (to_games_tx, game_manager_inbox_rx) = mpsc::channel(protocol::CHANNEL_BUFFER_SIZE);
    // admission -> lobby, admin requests
    let (admission_to_lobby_tx, lobby_from_admin_rx) = mpsc::channel(protocol::CHANNEL_BUFFER_SIZE);

    let mut tasks = tokio::task::JoinSet::new();

    tasks.spawn(run_router(
        from_lobby_rx,
        router_from_admin_rx,
        from_sessions_rx,
        from_sessions_tx,
        router_to_lobby_tx,
        config.clone(),
        cancel.clone(),
    ));

    tasks.spawn(lobby::run_lobby(
        lobby_from_games_rx,
        lobby_from_router_rx,
        lobby_from_admin_rx,
        to_router_tx,
        to_games_tx,
        to_router_admin_tx,
        cancel.clone(),
    ));

    tasks.spawn(game_manager::run_game_manager(
        game_manager_inbox_rx,
        from_games_tx,
        config.max_games,
        cancel.clone(),
    ));

    let admission_state = Arc::new(AdmissionState::new(admission_to_lobby_tx));

    let app = Router::new()
        .route("/ws", get(admission::websocket_handler))
        .route("/enlist", get(enlist_handler))
        .with_state(admission_state);

    let listener = tokio::net::TcpListener::bind("127.0.0.1:8080")
        .await
        .expect("failed to bind listener");

    let serve_cancel = cancel.clone();
    tasks.spawn(async move {
        axum::serve(
            listener,
            app.into_make_service_with_connect_info::<SocketAddr>(),
        )
        .with_graceful_shutdown(async move { serve_cancel.cancelled().await })
        .await
        .expect("server failed");
    });

    tokio::signal::ctrl_c().await.ok();
    tracing::info!("shutdown requested");
    cancel.cancel();

    while tasks.join_next().await.is_some() {}
    Ok(())
}

/// A thin status endpoint; the hub has no per-room state worth exposing
/// beyond liveness, since game state lives entirely behind the game manager.
async fn enlist_handler(State(_state): State<Arc<AdmissionState>>) -> &'static str {
    "ok"
}
