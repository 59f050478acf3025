mod cleanup;

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;

use axum::{
    Router,
    extract::{State, WebSocketUpgrade},
    middleware,
    response::IntoResponse,
    routing::{get, post},
};
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use tracing::info;

use banter_api::auth::{self, AppState, AppStateInner};
use banter_api::calls;
use banter_api::matchmaking;
use banter_api::middleware::require_auth;
use banter_api::postcall;
use banter_db::Database;
use banter_gateway::connection;
use banter_gateway::dispatcher::Dispatcher;

#[derive(Clone)]
struct ServerState {
    dispatcher: Dispatcher,
    db: Arc<Database>,
    jwt_secret: String,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load .env if present
    let _ = dotenvy::dotenv();

    // Init logging
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "banter=debug,tower_http=debug".into()),
        )
        .init();

    // Config
    let jwt_secret =
        std::env::var("BANTER_JWT_SECRET").unwrap_or_else(|_| "dev-secret-change-me".into());
    let db_path = std::env::var("BANTER_DB_PATH").unwrap_or_else(|_| "banter.db".into());
    let host = std::env::var("BANTER_HOST").unwrap_or_else(|_| "0.0.0.0".into());
    let port: u16 = std::env::var("BANTER_PORT")
        .unwrap_or_else(|_| "3000".into())
        .parse()?;
    let signal_grace_secs: i64 = std::env::var("BANTER_SIGNAL_GRACE_SECS")
        .unwrap_or_else(|_| "3600".into())
        .parse()?;

    // Init database
    let db = Arc::new(Database::open(&PathBuf::from(&db_path))?);

    // Shared state
    let dispatcher = Dispatcher::new();
    let app_state: AppState = Arc::new(AppStateInner {
        db: db.clone(),
        dispatcher: dispatcher.clone(),
        jwt_secret: jwt_secret.clone(),
    });

    let state = ServerState {
        dispatcher: dispatcher.clone(),
        db: db.clone(),
        jwt_secret: jwt_secret.clone(),
    };

    // Signal logs of finished calls are pruned after a grace window.
    tokio::spawn(cleanup::run_signal_prune_loop(
        db.clone(),
        signal_grace_secs,
        300,
    ));

    // Routes
    let public_routes = Router::new()
        .route("/auth/register", post(auth::register))
        .route("/auth/login", post(auth::login))
        .with_state(app_state.clone());

    let protected_routes = Router::new()
        .route("/match/search", post(matchmaking::start_search))
        .route("/match/cancel", post(matchmaking::cancel_search))
        .route("/calls/{call_id}/end", post(calls::end_call))
        .route("/calls/{call_id}/feedback", post(postcall::submit_feedback))
        .route("/friends/requests", post(postcall::send_friend_request))
        .layer(middleware::from_fn(require_auth))
        .with_state(app_state);

    let ws_route = Router::new()
        .route("/gateway", get(ws_upgrade))
        .with_state(state);

    let app = Router::new()
        .merge(public_routes)
        .merge(protected_routes)
        .merge(ws_route)
        .layer(CorsLayer::permissive())
        .layer(TraceLayer::new_for_http());

    let addr: SocketAddr = format!("{}:{}", host, port).parse()?;
    info!("Banter server listening on {}", addr);

    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app).await?;

    Ok(())
}

async fn ws_upgrade(State(state): State<ServerState>, ws: WebSocketUpgrade) -> impl IntoResponse {
    ws.on_upgrade(move |socket| {
        connection::handle_connection(socket, state.dispatcher, state.db, state.jwt_secret)
    })
}
