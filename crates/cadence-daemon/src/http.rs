use crate::core::CoreEvent;
use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    response::Json,
    routing::{delete, get, post},
    Router,
};
use cadence_proto::model::Track;
use cadence_proto::protocol::{Command, PlayerState};
use cadence_proto::state::StateManager;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio::sync::mpsc;
use tower::ServiceBuilder;
use tower_http::cors::CorsLayer;
use tracing::{error, info};

#[derive(Clone)]
struct HttpState {
    state_manager: Arc<StateManager>,
    event_tx: mpsc::Sender<CoreEvent>,
}

#[derive(Deserialize)]
struct SearchParams {
    q: String,
}

#[derive(Deserialize)]
struct NewPlaylist {
    name: String,
}

#[derive(Serialize)]
struct VolumeStatus {
    volume: u8,
}

pub fn start_server(
    bind_address: String,
    port: u16,
    state_manager: Arc<StateManager>,
    event_tx: mpsc::Sender<CoreEvent>,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let app = router(HttpState {
            state_manager,
            event_tx,
        });

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

fn router(app_state: HttpState) -> Router {
    Router::new()
        .route("/api/state", get(get_state))
        .route("/api/search", post(search))
        .route("/api/play/:index", post(play_index))
        .route("/api/next", post(next))
        .route("/api/prev", post(prev))
        .route("/api/pause", post(toggle_pause))
        .route("/api/stop", post(stop))
        .route("/api/volume/:volume", post(set_volume))
        .route("/api/volume", get(get_volume))
        .route("/api/seek/:fraction", post(seek))
        .route("/api/autoplay/:mode", post(set_autoplay))
        .route("/api/related", post(load_related))
        .route("/api/queue", post(add_to_queue))
        .route("/api/queue/:index", delete(remove_from_queue))
        .route("/api/download/:id", post(download))
        .route("/api/downloads/:id", delete(delete_download))
        .route("/api/downloads/:id/play", post(play_download))
        .route("/api/playlists", post(create_playlist))
        .route("/api/playlists/:id", delete(delete_playlist))
        .route("/api/playlists/:id/play/:index", post(play_playlist))
        .route("/api/recommendations", post(more_recommendations))
        .layer(ServiceBuilder::new().layer(CorsLayer::permissive()))
        .with_state(app_state)
}

/// Forward a command to the core.  Fire-and-forget: the effect shows up in
/// the next state snapshot.
async fn dispatch(state: &HttpState, cmd: Command) -> StatusCode {
    info!("HTTP API: {:?}", cmd);
    if state
        .event_tx
        .send(CoreEvent::ClientCommand(cmd))
        .await
        .is_err()
    {
        error!("Failed to send command to core");
        return StatusCode::INTERNAL_SERVER_ERROR;
    }
    StatusCode::OK
}

async fn get_state(State(state): State<HttpState>) -> Json<PlayerState> {
    Json(state.state_manager.get_state().await)
}

async fn search(State(state): State<HttpState>, Query(params): Query<SearchParams>) -> StatusCode {
    if params.q.trim().is_empty() {
        return StatusCode::BAD_REQUEST;
    }
    dispatch(&state, Command::Search { query: params.q }).await
}

async fn play_index(State(state): State<HttpState>, Path(index): Path<usize>) -> StatusCode {
    dispatch(&state, Command::PlayIndex { index }).await
}

async fn next(State(state): State<HttpState>) -> StatusCode {
    dispatch(&state, Command::Next).await
}

async fn prev(State(state): State<HttpState>) -> StatusCode {
    dispatch(&state, Command::Prev).await
}

async fn toggle_pause(State(state): State<HttpState>) -> StatusCode {
    dispatch(&state, Command::TogglePause).await
}

async fn stop(State(state): State<HttpState>) -> StatusCode {
    dispatch(&state, Command::Stop).await
}

async fn set_volume(State(state): State<HttpState>, Path(volume): Path<i32>) -> StatusCode {
    let value = (volume as f32 / 100.0).clamp(0.0, 1.0);
    dispatch(&state, Command::Volume { value }).await
}

async fn get_volume(State(state): State<HttpState>) -> Json<VolumeStatus> {
    let player = state.state_manager.get_state().await;
    let volume = (player.volume * 100.0).round() as u8;
    Json(VolumeStatus { volume })
}

async fn seek(State(state): State<HttpState>, Path(fraction): Path<f64>) -> StatusCode {
    if !fraction.is_finite() {
        return StatusCode::BAD_REQUEST;
    }
    dispatch(&state, Command::SeekCommit { fraction }).await
}

async fn set_autoplay(State(state): State<HttpState>, Path(mode): Path<String>) -> StatusCode {
    let enabled = match mode.as_str() {
        "on" => true,
        "off" => false,
        _ => return StatusCode::BAD_REQUEST,
    };
    dispatch(&state, Command::SetAutoplay { enabled }).await
}

async fn load_related(State(state): State<HttpState>) -> StatusCode {
    dispatch(&state, Command::LoadMoreRelated).await
}

async fn remove_from_queue(State(state): State<HttpState>, Path(index): Path<usize>) -> StatusCode {
    dispatch(&state, Command::RemoveFromQueue { index }).await
}

async fn add_to_queue(State(state): State<HttpState>, Json(track): Json<Track>) -> StatusCode {
    if track.id.trim().is_empty() {
        return StatusCode::BAD_REQUEST;
    }
    dispatch(&state, Command::AddToQueue { track }).await
}

async fn download(State(state): State<HttpState>, Path(id): Path<String>) -> StatusCode {
    dispatch(&state, Command::Download { track_id: Some(id) }).await
}

async fn delete_download(State(state): State<HttpState>, Path(id): Path<String>) -> StatusCode {
    dispatch(&state, Command::DeleteDownload { track_id: id }).await
}

async fn play_download(State(state): State<HttpState>, Path(index): Path<usize>) -> StatusCode {
    dispatch(&state, Command::PlayDownload { index }).await
}

async fn create_playlist(
    State(state): State<HttpState>,
    Json(body): Json<NewPlaylist>,
) -> StatusCode {
    if body.name.trim().is_empty() {
        return StatusCode::BAD_REQUEST;
    }
    dispatch(&state, Command::CreatePlaylist { name: body.name }).await
}

async fn delete_playlist(State(state): State<HttpState>, Path(id): Path<String>) -> StatusCode {
    dispatch(&state, Command::DeletePlaylist { playlist_id: id }).await
}

async fn play_playlist(
    State(state): State<HttpState>,
    Path((id, index)): Path<(String, usize)>,
) -> StatusCode {
    dispatch(
        &state,
        Command::PlayPlaylist {
            playlist_id: id,
            index,
        },
    )
    .await
}

async fn more_recommendations(State(state): State<HttpState>) -> StatusCode {
    dispatch(&state, Command::LoadRecommendations { more: true }).await
}
