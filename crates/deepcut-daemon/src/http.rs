use crate::catalog::CatalogClient;
use crate::core::PlayerEvent;
use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    response::{IntoResponse, Json, Response},
    routing::{delete, get, post},
    Router,
};
use deepcut_proto::protocol::{Command, PlayerSnapshot, Track};
use deepcut_proto::state::StateManager;
use serde::Deserialize;
use serde_json::json;
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio::sync::mpsc;
use tower_http::cors::CorsLayer;
use tracing::{error, info, warn};

#[derive(Clone)]
struct HttpState {
    state_manager: Arc<StateManager>,
    event_tx: mpsc::Sender<PlayerEvent>,
    catalog: CatalogClient,
}

#[derive(Deserialize)]
struct LimitQuery {
    limit: Option<u32>,
}

#[derive(Deserialize)]
struct SearchQuery {
    query: String,
    limit: Option<u32>,
}

pub fn router(
    state_manager: Arc<StateManager>,
    event_tx: mpsc::Sender<PlayerEvent>,
    catalog: CatalogClient,
) -> Router {
    let app_state = HttpState {
        state_manager,
        event_tx,
        catalog,
    };

    Router::new()
        .route("/api/state", get(get_state))
        .route("/api/trending", get(trending))
        .route("/api/search", get(search))
        .route("/api/queue", post(set_queue))
        .route("/api/queue/:idx", delete(remove_at))
        .route("/api/play/:idx", post(play_at))
        .route("/api/jump/:idx", post(jump_to))
        .route("/api/toggle", post(toggle))
        .route("/api/next", post(next))
        .route("/api/prev", post(prev))
        .route("/api/seek/:ms", post(seek))
        .route("/api/enqueue/next", post(enqueue_next))
        .route("/api/enqueue/last", post(enqueue_last))
        .route("/api/clear", post(clear_queue))
        .layer(CorsLayer::permissive())
        .with_state(app_state)
}

pub fn start_server(
    bind_address: String,
    port: u16,
    state_manager: Arc<StateManager>,
    event_tx: mpsc::Sender<PlayerEvent>,
    catalog: CatalogClient,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let app = router(state_manager, event_tx, catalog);

        let addr = format!("{}:{}", bind_address, port);
        let listener = match TcpListener::bind(&addr).await {
            Ok(l) => l,
            Err(e) => {
                error!("Failed to bind HTTP server to {}: {}", addr, e);
                return;
            }
        };

        info!("HTTP API server listening on http://{}", addr);

        if let Err(e) = axum::serve(listener, app).await {
            error!("HTTP server error: {}", e);
        }
    })
}

async fn send_command(state: &HttpState, cmd: Command) -> StatusCode {
    if state.event_tx.send(PlayerEvent::Command(cmd)).await.is_err() {
        error!("HTTP API: player event channel closed");
        return StatusCode::SERVICE_UNAVAILABLE;
    }
    StatusCode::OK
}

async fn get_state(State(state): State<HttpState>) -> Json<PlayerSnapshot> {
    Json(state.state_manager.get_state().await)
}

fn catalog_result(result: Result<Vec<Track>, crate::catalog::FetchError>) -> Response {
    match result {
        Ok(tracks) => Json(tracks).into_response(),
        Err(e) => {
            warn!("HTTP API: catalog request failed: {}", e);
            (StatusCode::BAD_GATEWAY, Json(json!({ "error": e.to_string() }))).into_response()
        }
    }
}

async fn trending(State(state): State<HttpState>, Query(q): Query<LimitQuery>) -> Response {
    catalog_result(state.catalog.fetch_trending(q.limit).await)
}

async fn search(State(state): State<HttpState>, Query(q): Query<SearchQuery>) -> Response {
    info!("HTTP API: search '{}'", q.query);
    catalog_result(state.catalog.search(&q.query, q.limit).await)
}

async fn set_queue(State(state): State<HttpState>, Json(tracks): Json<Vec<Track>>) -> StatusCode {
    info!("HTTP API: set queue ({} tracks)", tracks.len());
    send_command(&state, Command::SetQueue { tracks }).await
}

async fn remove_at(State(state): State<HttpState>, Path(index): Path<usize>) -> StatusCode {
    send_command(&state, Command::RemoveAt { index }).await
}

async fn play_at(State(state): State<HttpState>, Path(index): Path<usize>) -> StatusCode {
    send_command(&state, Command::PlayAt { index }).await
}

async fn jump_to(State(state): State<HttpState>, Path(index): Path<usize>) -> StatusCode {
    send_command(&state, Command::JumpTo { index }).await
}

async fn toggle(State(state): State<HttpState>) -> StatusCode {
    send_command(&state, Command::Toggle).await
}

async fn next(State(state): State<HttpState>) -> StatusCode {
    send_command(&state, Command::Next).await
}

async fn prev(State(state): State<HttpState>) -> StatusCode {
    send_command(&state, Command::Prev).await
}

async fn seek(State(state): State<HttpState>, Path(ms): Path<u64>) -> StatusCode {
    send_command(&state, Command::Seek { ms }).await
}

async fn enqueue_next(State(state): State<HttpState>, Json(track): Json<Track>) -> StatusCode {
    send_command(&state, Command::EnqueueNext { track }).await
}

async fn enqueue_last(State(state): State<HttpState>, Json(track): Json<Track>) -> StatusCode {
    send_command(&state, Command::EnqueueLast { track }).await
}

async fn clear_queue(State(state): State<HttpState>) -> StatusCode {
    send_command(&state, Command::ClearQueue).await
}
