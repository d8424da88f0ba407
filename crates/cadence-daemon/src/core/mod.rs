//! Single-owner event loop for all mutable playback state.
//!
//! Every input (client commands, remote-service results, engine signals,
//! heartbeat) arrives as a `CoreEvent` on one mpsc channel and is handled to
//! completion before the next.  Network calls run as spawned tasks that post
//! their result back tagged with a `RequestToken`; a result whose token is no
//! longer the one being waited for is dropped.
//!
//! After each event that changes what clients see, the core writes a full
//! snapshot into the `StateManager` and broadcasts
//! `BroadcastMessage::StateUpdated`.

use std::sync::Arc;

use cadence_proto::config::PlaybackConfig;
use cadence_proto::model::{StreamRef, Track};
use cadence_proto::protocol::{
    Command, Display, EngineHealth, PlaybackMode, PlaybackStatus, PlayerState,
};
use cadence_proto::state::StateManager;
use cadence_proto::timeline::{progress_fraction, seek_target};
use tokio::sync::{broadcast, mpsc};
use tokio::task::AbortHandle;
use tracing::{debug, error, info, warn};

use crate::downloads::DownloadManager;
use crate::engine::{EngineEvent, PlaybackEngine};
use crate::error::ServiceResult;
use crate::preload::PreloadCoordinator;
use crate::queue::QueueManager;
use crate::service::MediaService;
use crate::token::{RequestToken, TokenSource};
use crate::BroadcastMessage;

mod library;


pub use library::LibraryEvent;
use library::Library;

// ── CoreEvent ─────────────────────────────────────────────────────────────────

/// All inputs into the PlayerCore loop.
#[derive(Debug)]
pub enum CoreEvent {
    /// A command from a socket client or the HTTP API.
    ClientCommand(Command),
    SearchCompleted {
        token: RequestToken,
        query: String,
        result: ServiceResult<Vec<Track>>,
    },
    StreamResolved {
        token: RequestToken,
        track_id: String,
        result: ServiceResult<StreamRef>,
    },
    PreloadResolved {
        token: RequestToken,
        result: ServiceResult<StreamRef>,
    },
    RelatedLoaded {
        requested_for: String,
        result: ServiceResult<Vec<Track>>,
    },
    Engine(EngineEvent),
    Library(LibraryEvent),
    /// Periodic engine liveness check.
    HeartbeatTick,
    #[allow(dead_code)]
    Shutdown,
}

// ── PlayerCore ────────────────────────────────────────────────────────────────

pub struct PlayerCore {
    config: PlaybackConfig,
    service: Arc<dyn MediaService>,
    engine: Box<dyn PlaybackEngine>,
    state_manager: Arc<StateManager>,
    broadcast_tx: broadcast::Sender<BroadcastMessage>,
    /// Sender side of our own loop, handed to spawned tasks.
    event_tx: mpsc::Sender<CoreEvent>,
    tokens: TokenSource,

    queue: QueueManager,
    preload: PreloadCoordinator,
    mode: PlaybackMode,
    status: PlaybackStatus,
    display: Display,
    volume: f32,
    autoplay: bool,
    time_pos: Option<f64>,
    duration: Option<f64>,
    seek_preview: Option<f64>,
    engine_health: EngineHealth,

    /// Token of the stream resolution the current selection waits for.
    play_token: Option<RequestToken>,
    play_task: Option<AbortHandle>,
    /// Source handed to the engine that has not reported `Started` yet.
    awaiting_start: Option<Track>,
    preload_task: Option<AbortHandle>,
    search_token: Option<RequestToken>,
    /// First track of a new search has not started yet.
    fresh_search: bool,
    loading_related: bool,

    library: Library,
    downloads: DownloadManager,
}

impl PlayerCore {
    pub async fn new(
        config: PlaybackConfig,
        service: Arc<dyn MediaService>,
        engine: Box<dyn PlaybackEngine>,
        state_manager: Arc<StateManager>,
        broadcast_tx: broadcast::Sender<BroadcastMessage>,
        event_tx: mpsc::Sender<CoreEvent>,
    ) -> Self {
        let initial = state_manager.get_state().await;
        let queue = QueueManager::new(config.max_queue_len, config.refill_threshold);

        Self {
            config,
            service,
            engine,
            state_manager,
            broadcast_tx,
            event_tx,
            tokens: TokenSource::default(),
            queue,
            preload: PreloadCoordinator::new(),
            mode: PlaybackMode::SearchQueue,
            status: PlaybackStatus::Idle,
            display: Display::Empty,
            volume: initial.volume,
            autoplay: initial.autoplay,
            time_pos: None,
            duration: None,
            seek_preview: None,
            engine_health: EngineHealth::Absent,
            play_token: None,
            play_task: None,
            awaiting_start: None,
            preload_task: None,
            search_token: None,
            fresh_search: false,
            loading_related: false,
            library: Library::default(),
            downloads: DownloadManager::new(),
        }
    }

    /// Borrow the state manager (for the socket and HTTP servers).
    pub fn state_manager(&self) -> Arc<StateManager> {
        Arc::clone(&self.state_manager)
    }

    /// Run the event loop.  Returns on `Shutdown` or when every sender is gone.
    pub async fn run(mut self, mut event_rx: mpsc::Receiver<CoreEvent>) -> anyhow::Result<()> {
        info!("PlayerCore: starting event loop");

        let heartbeat_tx = self.event_tx.clone();
        tokio::spawn(async move {
            loop {
                tokio::time::sleep(tokio::time::Duration::from_secs(10)).await;
                if heartbeat_tx.send(CoreEvent::HeartbeatTick).await.is_err() {
                    break;
                }
            }
        });

        self.bootstrap().await;

        loop {
            match event_rx.recv().await {
                None => {
                    info!("PlayerCore: event channel closed, shutting down");
                    break;
                }
                Some(CoreEvent::Shutdown) => {
                    info!("PlayerCore: shutdown requested");
                    break;
                }
                Some(evt) => self.handle_event(evt).await,
            }
        }

        self.cleanup().await;
        Ok(())
    }

    /// Initial library fetches a client expects to be populated on connect.
    async fn bootstrap(&mut self) {
        self.publish().await;
        self.refresh_downloads();
        self.refresh_playlists();
        self.load_recommendations(false);
    }

    pub async fn handle_event(&mut self, evt: CoreEvent) {
        match evt {
            CoreEvent::ClientCommand(cmd) => {
                info!("PlayerCore: command {:?}", cmd);
                if let Err(e) = self.handle_command(cmd).await {
                    error!("PlayerCore: command error: {}", e);
                }
            }
            CoreEvent::SearchCompleted {
                token,
                query,
                result,
            } => self.on_search_completed(token, query, result).await,
            CoreEvent::StreamResolved {
                token,
                track_id,
                result,
            } => self.on_stream_resolved(token, track_id, result).await,
            CoreEvent::PreloadResolved { token, result } => self.on_preload_resolved(token, result),
            CoreEvent::RelatedLoaded {
                requested_for,
                result,
            } => self.on_related_loaded(requested_for, result).await,
            CoreEvent::Engine(signal) => self.handle_engine_event(signal).await,
            CoreEvent::Library(evt) => self.handle_library_event(evt).await,
            CoreEvent::HeartbeatTick => {
                if !self.engine.check_alive().await {
                    warn!("PlayerCore: heartbeat: playback engine died");
                    self.on_engine_lost().await;
                }
            }
            CoreEvent::Shutdown => {}
        }
    }

    // ── publishing ────────────────────────────────────────────────────────────

    fn fill_snapshot(&self, s: &mut PlayerState) {
        s.queue = self.queue.tracks().to_vec();
        s.position = self.queue.position();
        s.mode = self.mode;
        s.queue_visible = self.mode == PlaybackMode::SearchQueue;
        s.status = self.status;
        s.is_paused = self.status == PlaybackStatus::Paused;
        s.display = self.display.clone();
        s.volume = self.volume;
        s.autoplay = self.autoplay;
        s.time_pos_secs = self.time_pos;
        s.duration_secs = self.duration;
        s.seek_preview_secs = self.seek_preview;
        s.engine_health = self.engine_health.clone();
        s.searching = self.search_token.is_some();
        s.loading_related = self.loading_related;
        s.active_downloads = self.downloads.snapshot();
        self.library.fill_snapshot(s);
    }

    async fn publish(&self) {
        self.state_manager.update(|s| self.fill_snapshot(s)).await;
        let _ = self.broadcast_tx.send(BroadcastMessage::StateUpdated);
    }

    async fn publish_timeline(&self) {
        self.state_manager
            .set_timeline(self.time_pos, self.duration)
            .await;
        let _ = self.broadcast_tx.send(BroadcastMessage::StateUpdated);
    }

    fn notice(&self, message: impl Into<String>) {
        let message = message.into();
        info!("PlayerCore: notice: {}", message);
        let _ = self.broadcast_tx.send(BroadcastMessage::Notice(message));
    }

    // ── command handlers ──────────────────────────────────────────────────────

    async fn handle_command(&mut self, cmd: Command) -> anyhow::Result<()> {
        match cmd {
            Command::Search { query } => self.search(query).await,
            Command::PlayIndex { index } => {
                if index >= self.queue.len() {
                    debug!("PlayerCore: play index {} out of range", index);
                    return Ok(());
                }
                if self.mode == PlaybackMode::DownloadedLibrary {
                    self.set_mode(PlaybackMode::SearchQueue);
                }
                self.play_track(index).await;
            }
            Command::Next => self.next().await,
            Command::Prev => self.prev().await,
            Command::RemoveFromQueue { index } => {
                if self.queue.remove_at(index).is_some() {
                    self.drop_preload();
                    self.publish().await;
                } else {
                    debug!("PlayerCore: remove {} rejected", index);
                }
            }
            Command::AddToQueue { track } => self.add_to_queue(track).await,
            Command::LoadMoreRelated => {
                if let Some(id) = self.queue.current().map(|t| t.id.clone()) {
                    self.request_related(id);
                    self.publish().await;
                }
            }
            Command::TogglePause => self.toggle_pause().await,
            Command::Stop => self.stop().await,
            Command::Volume { value } => self.set_volume(value).await?,
            Command::SeekPreview { fraction } => {
                self.seek_preview = seek_target(fraction, self.duration);
                self.publish().await;
            }
            Command::SeekCommit { fraction } => self.seek_commit(fraction).await,
            Command::SetAutoplay { enabled } => {
                self.autoplay = enabled;
                self.state_manager.set_autoplay(enabled).await?;
                self.publish().await;
            }
            Command::Download { track_id } => self.start_download(track_id).await,
            Command::DismissDownload { track_id } => {
                self.downloads.dismiss(&track_id);
                self.publish().await;
            }
            Command::RefreshDownloads => self.refresh_downloads(),
            Command::PlayDownload { index } => self.play_download(index).await,
            Command::DeleteDownload { track_id } => self.delete_download(track_id),
            Command::RefreshPlaylists => self.refresh_playlists(),
            Command::CreatePlaylist { name } => self.create_playlist(name),
            Command::DeletePlaylist { playlist_id } => self.delete_playlist(playlist_id),
            Command::AddToPlaylist { playlist_id, track } => {
                self.add_to_playlist(playlist_id, track)
            }
            Command::RemoveFromPlaylist {
                playlist_id,
                track_id,
            } => self.remove_from_playlist(playlist_id, track_id),
            Command::PlayPlaylist { playlist_id, index } => {
                self.play_playlist(playlist_id, index).await
            }
            Command::ImportPlaylist { name, url } => self.import_playlist(name, url).await,
            Command::LoadRecommendations { more } => self.load_recommendations(more),
            Command::PlayRecommendation { track_id } => self.play_recommendation(track_id).await,
            Command::GetState => {
                // the socket answers with the current snapshot
            }
        }
        Ok(())
    }

    // ── search ────────────────────────────────────────────────────────────────

    async fn search(&mut self, query: String) {
        let query = query.trim().to_string();
        if query.is_empty() {
            debug!("PlayerCore: empty search rejected");
            return;
        }
        let token = self.tokens.issue();
        self.search_token = Some(token);

        let service = Arc::clone(&self.service);
        let tx = self.event_tx.clone();
        tokio::spawn(async move {
            let result = service.search(&query).await;
            let _ = tx
                .send(CoreEvent::SearchCompleted {
                    token,
                    query,
                    result,
                })
                .await;
        });
        self.publish().await;
    }

    async fn on_search_completed(
        &mut self,
        token: RequestToken,
        query: String,
        result: ServiceResult<Vec<Track>>,
    ) {
        if self.search_token != Some(token) {
            debug!("PlayerCore: stale search '{}' {} dropped", query, token);
            return;
        }
        self.search_token = None;

        let tracks = match result {
            Ok(tracks) => tracks,
            Err(e) => {
                warn!("PlayerCore: search '{}' failed: {}", query, e);
                self.publish().await;
                return;
            }
        };
        info!("PlayerCore: search '{}' returned {} tracks", query, tracks.len());

        self.set_mode(PlaybackMode::SearchQueue);
        self.queue.replace(tracks);
        self.drop_preload();

        if self.queue.is_empty() {
            if self.status == PlaybackStatus::Loading {
                // the pending selection is gone with the old queue
                self.stop().await;
            } else {
                self.publish().await;
            }
        } else {
            self.fresh_search = true;
            self.play_track(0).await;
        }
        self.load_recommendations(true);
    }

    async fn add_to_queue(&mut self, track: Track) {
        if self.mode == PlaybackMode::DownloadedLibrary {
            debug!("PlayerCore: add to queue rejected in {:?}", self.mode);
            return;
        }
        let Some(track) = track.normalize() else {
            debug!("PlayerCore: add to queue rejected: track without id");
            return;
        };
        let title = track.title.clone();
        if !self.queue.push(track) {
            self.notice("Queue is full");
            return;
        }
        debug!("PlayerCore: queued '{}'", title);
        self.drop_preload();
        self.publish().await;
    }

    // ── mode ──────────────────────────────────────────────────────────────────

    fn set_mode(&mut self, mode: PlaybackMode) {
        if self.mode == mode {
            return;
        }
        info!("PlayerCore: mode {:?} → {:?}", self.mode, mode);
        self.drop_preload();
        if self.mode == PlaybackMode::Playlist {
            self.library.open_playlist = None;
        }
        if self.mode == PlaybackMode::DownloadedLibrary {
            self.library.current_download = None;
        }
        self.mode = mode;
    }

    fn drop_preload(&mut self) {
        self.preload.invalidate();
        if let Some(task) = self.preload_task.take() {
            task.abort();
        }
    }

    /// Forget the pending stream resolution or engine start, if any.
    fn supersede_play(&mut self) {
        self.play_token = None;
        self.awaiting_start = None;
        if let Some(task) = self.play_task.take() {
            task.abort();
        }
    }

    // ── playback ──────────────────────────────────────────────────────────────

    /// Select queue entry `index` and resolve its stream.  Out-of-range is a
    /// no-op.
    async fn play_track(&mut self, index: usize) {
        let Some(track) = self.queue.get(index).cloned() else {
            debug!("PlayerCore: play_track {} out of range", index);
            return;
        };
        self.drop_preload();
        self.supersede_play();
        self.queue.set_position(index);

        let token = self.tokens.issue();
        self.play_token = Some(token);
        info!("PlayerCore: loading {} '{}' ({})", index, track.title, token);

        self.status = PlaybackStatus::Loading;
        self.display = Display::Loading {
            track: track.clone(),
        };
        self.time_pos = None;
        self.duration = track.duration;
        self.seek_preview = None;
        self.publish().await;

        let service = Arc::clone(&self.service);
        let tx = self.event_tx.clone();
        let track_id = track.id;
        let task = tokio::spawn(async move {
            let result = service.resolve_stream(&track_id).await;
            let _ = tx
                .send(CoreEvent::StreamResolved {
                    token,
                    track_id,
                    result,
                })
                .await;
        });
        self.play_task = Some(task.abort_handle());
    }

    async fn on_stream_resolved(
        &mut self,
        token: RequestToken,
        track_id: String,
        result: ServiceResult<StreamRef>,
    ) {
        if self.play_token != Some(token) {
            debug!("PlayerCore: stale stream {} for {} dropped", token, track_id);
            return;
        }
        let Some(track) = self.queue.current().cloned().filter(|t| t.id == track_id) else {
            debug!("PlayerCore: selection moved away from {}", track_id);
            self.stop().await;
            return;
        };
        self.play_token = None;
        self.play_task = None;

        match result {
            Ok(stream) => self.start_output(track, stream).await,
            Err(e) => self.fail_playback(Some(track), e.to_string()).await,
        }
    }

    /// Hand a resolved source to the engine.  The status stays `Loading`
    /// until the engine reports `Started`.
    async fn start_output(&mut self, track: Track, stream: StreamRef) {
        if let Err(e) = self.engine.load(&stream.url, self.volume).await {
            self.fail_playback(Some(track), e.to_string()).await;
            return;
        }
        debug!("PlayerCore: engine accepted '{}'", track.title);
        self.status = PlaybackStatus::Loading;
        self.duration = stream.duration.or(track.duration);
        self.display = Display::Loading {
            track: track.clone(),
        };
        self.awaiting_start = Some(track);
        self.publish().await;
    }

    /// The engine confirmed the source it was last given is audible.
    async fn on_output_started(&mut self) {
        let Some(track) = self.awaiting_start.take() else {
            debug!("PlayerCore: start signal with nothing pending");
            return;
        };
        info!("PlayerCore: playing '{}'", track.title);
        self.status = PlaybackStatus::Playing;
        self.time_pos = Some(0.0);
        let track_id = track.id.clone();
        self.display = Display::Track { track };
        self.publish().await;

        if self.fresh_search && self.mode == PlaybackMode::SearchQueue {
            self.fresh_search = false;
            if self.autoplay {
                self.request_related(track_id);
                self.publish().await;
            }
        }
    }

    async fn fail_playback(&mut self, track: Option<Track>, message: String) {
        warn!("PlayerCore: playback failed: {}", message);
        self.awaiting_start = None;
        self.status = PlaybackStatus::Error;
        self.display = Display::Error { track, message };
        self.time_pos = None;
        self.drop_preload();
        self.publish().await;
    }

    async fn go_idle(&mut self) {
        self.status = PlaybackStatus::Idle;
        self.time_pos = None;
        self.seek_preview = None;
        self.drop_preload();
        self.publish().await;
    }

    async fn next(&mut self) {
        if self.mode == PlaybackMode::DownloadedLibrary {
            let len = self.library.downloads.len();
            if len > 0 {
                let next = self.library.current_download.map_or(0, |c| (c + 1) % len);
                self.play_download(next).await;
            }
            return;
        }
        if let Some(next) = self.queue.next_index() {
            self.play_track(next).await;
        }
    }

    async fn prev(&mut self) {
        if self.mode == PlaybackMode::DownloadedLibrary {
            let len = self.library.downloads.len();
            if len > 0 {
                let prev = self.library.current_download.map_or(0, |c| (c + len - 1) % len);
                self.play_download(prev).await;
            }
            return;
        }
        if let Some(prev) = self.queue.prev_index() {
            self.play_track(prev).await;
        }
    }

    async fn toggle_pause(&mut self) {
        let pause = match self.status {
            PlaybackStatus::Playing => true,
            PlaybackStatus::Paused => false,
            _ => {
                debug!("PlayerCore: nothing to pause in {:?}", self.status);
                return;
            }
        };
        match self.engine.set_pause(pause).await {
            Ok(()) => {
                self.status = if pause {
                    PlaybackStatus::Paused
                } else {
                    PlaybackStatus::Playing
                };
                self.publish().await;
            }
            Err(e) => warn!("PlayerCore: pause toggle failed: {}", e),
        }
    }

    async fn stop(&mut self) {
        info!("PlayerCore: stopping playback");
        self.supersede_play();
        if let Err(e) = self.engine.stop().await {
            warn!("PlayerCore: engine stop failed: {}", e);
        }
        self.display = Display::Empty;
        self.duration = None;
        self.go_idle().await;
    }

    async fn set_volume(&mut self, value: f32) -> anyhow::Result<()> {
        let volume = value.clamp(0.0, 1.0);
        self.volume = volume;
        if let Err(e) = self.engine.set_volume(volume).await {
            warn!("PlayerCore: set volume failed: {}", e);
        }
        self.state_manager.set_volume(volume).await?;
        self.publish().await;
        Ok(())
    }

    async fn seek_commit(&mut self, fraction: f64) {
        self.seek_preview = None;
        let playing = matches!(
            self.status,
            PlaybackStatus::Playing | PlaybackStatus::Paused
        );
        if let (true, Some(target)) = (playing, seek_target(fraction, self.duration)) {
            match self.engine.seek_to(target).await {
                Ok(()) => self.time_pos = Some(target),
                Err(e) => warn!("PlayerCore: seek failed: {}", e),
            }
        }
        self.publish().await;
    }

    // ── track end ─────────────────────────────────────────────────────────────

    /// Downloaded-library and queue progression are exclusive; the active
    /// mode picks exactly one.
    async fn on_track_ended(&mut self) {
        if self.status != PlaybackStatus::Playing {
            debug!("PlayerCore: end of track ignored in {:?}", self.status);
            return;
        }
        self.time_pos = None;

        match self.mode {
            PlaybackMode::Playlist => match self.queue.next_index() {
                Some(next) => self.play_track(next).await,
                None => {
                    info!("PlayerCore: playlist finished");
                    self.queue.clear_position();
                    self.go_idle().await;
                }
            },
            PlaybackMode::DownloadedLibrary => {
                let len = self.library.downloads.len();
                if self.autoplay && len > 0 {
                    let next = self.library.current_download.map_or(0, |c| (c + 1) % len);
                    self.play_download(next).await;
                } else {
                    self.go_idle().await;
                }
            }
            PlaybackMode::SearchQueue => {
                if !self.autoplay || self.queue.is_empty() {
                    self.go_idle().await;
                    return;
                }
                if self.queue.needs_refill() {
                    if let Some(id) = self.queue.current().map(|t| t.id.clone()) {
                        self.request_related(id);
                    }
                }
                match self.queue.next_index() {
                    Some(next) => self.advance_to(next).await,
                    None => self.go_idle().await,
                }
            }
        }
    }

    /// Move to `next`, using the preloaded stream when it was primed for it.
    async fn advance_to(&mut self, next: usize) {
        let Some(track) = self.queue.get(next).cloned() else {
            return;
        };
        let Some(slot) = self.preload.consume(&track, next) else {
            self.play_track(next).await;
            return;
        };
        self.preload_task = None;
        info!("PlayerCore: handoff to preloaded '{}'", slot.track.title);
        self.supersede_play();
        self.queue.set_position(next);
        self.seek_preview = None;
        self.start_output(slot.track, slot.stream).await;

        if self.autoplay && self.queue.needs_refill() {
            if let Some(id) = self.queue.current().map(|t| t.id.clone()) {
                self.request_related(id);
            }
        }
    }

    // ── preload ───────────────────────────────────────────────────────────────

    fn maybe_preload(&mut self) {
        if self.mode != PlaybackMode::SearchQueue || self.status != PlaybackStatus::Playing {
            return;
        }
        let Some(progress) = progress_fraction(self.time_pos, self.duration) else {
            return;
        };
        if !self
            .preload
            .should_begin(progress, self.config.preload_at, self.autoplay)
        {
            return;
        }
        if self.queue.position().is_none() {
            return;
        }

        let next = self
            .queue
            .next_index()
            .and_then(|i| self.queue.get(i).cloned().map(|t| (i, t)));
        let Some((index, track)) = next else {
            // nothing to preload yet: grow the queue instead
            self.preload.mark_started();
            if let Some(id) = self.queue.current().map(|t| t.id.clone()) {
                self.request_related(id);
            }
            return;
        };

        let token = self.preload.begin(&mut self.tokens, &track, index);
        let service = Arc::clone(&self.service);
        let tx = self.event_tx.clone();
        let task = tokio::spawn(async move {
            let result = service.resolve_stream(&track.id).await;
            let _ = tx.send(CoreEvent::PreloadResolved { token, result }).await;
        });
        self.preload_task = Some(task.abort_handle());
    }

    fn on_preload_resolved(&mut self, token: RequestToken, result: ServiceResult<StreamRef>) {
        let expected = self
            .queue
            .next_index()
            .and_then(|i| self.queue.get(i).map(|t| (t, i)));
        let result = result.map_err(|e| e.to_string());
        if self.preload.complete(token, result, expected) {
            self.preload_task = None;
        }
    }

    // ── related expansion ─────────────────────────────────────────────────────

    /// Fire-and-forget related fetch; one at a time, never in playlist mode.
    fn request_related(&mut self, track_id: String) {
        if self.mode == PlaybackMode::Playlist || self.loading_related {
            return;
        }
        debug!("PlayerCore: requesting related for {}", track_id);
        self.loading_related = true;
        let service = Arc::clone(&self.service);
        let tx = self.event_tx.clone();
        tokio::spawn(async move {
            let result = service.related(&track_id).await;
            let _ = tx
                .send(CoreEvent::RelatedLoaded {
                    requested_for: track_id,
                    result,
                })
                .await;
        });
    }

    async fn on_related_loaded(&mut self, requested_for: String, result: ServiceResult<Vec<Track>>) {
        self.loading_related = false;
        match result {
            Err(e) => warn!("PlayerCore: related for {} failed: {}", requested_for, e),
            Ok(_) if self.mode != PlaybackMode::SearchQueue => {
                debug!("PlayerCore: related for {} arrived after mode change", requested_for);
            }
            Ok(candidates) => {
                let added = self
                    .queue
                    .append_related(candidates, self.mode, &requested_for);
                if added > 0 {
                    info!("PlayerCore: queue grew by {}", added);
                    self.drop_preload();
                }
            }
        }
        self.publish().await;
    }

    // ── engine signals ────────────────────────────────────────────────────────

    async fn handle_engine_event(&mut self, signal: EngineEvent) {
        match signal {
            EngineEvent::TimePos(pos) => {
                self.time_pos = pos;
                self.maybe_preload();
                self.publish_timeline().await;
            }
            EngineEvent::Duration(duration) => {
                if duration.is_some() && duration != self.duration {
                    self.duration = duration;
                    self.publish_timeline().await;
                }
            }
            EngineEvent::Pause(paused) => {
                let status = match (self.status, paused) {
                    (PlaybackStatus::Playing, true) => PlaybackStatus::Paused,
                    (PlaybackStatus::Paused, false) => PlaybackStatus::Playing,
                    _ => return,
                };
                self.status = status;
                self.publish().await;
            }
            EngineEvent::Started => self.on_output_started().await,
            EngineEvent::Ended => self.on_track_ended().await,
            EngineEvent::Failed(reason) => {
                if let Some(track) = self.awaiting_start.take() {
                    self.fail_playback(Some(track), reason).await;
                } else if matches!(
                    self.status,
                    PlaybackStatus::Playing | PlaybackStatus::Paused
                ) {
                    let track = self.display.track().cloned();
                    self.fail_playback(track, reason).await;
                }
            }
            EngineEvent::Health(health) => {
                if self.engine_health != health {
                    info!("PlayerCore: engine {:?} → {:?}", self.engine_health, health);
                    let lost = health.is_unhealthy();
                    self.engine_health = health;
                    if lost {
                        self.on_engine_lost().await;
                    } else {
                        self.publish().await;
                    }
                }
            }
        }
    }

    async fn on_engine_lost(&mut self) {
        self.engine_health = EngineHealth::Dead;
        if let Some(track) = self.awaiting_start.take() {
            self.fail_playback(Some(track), "playback engine exited".to_string())
                .await;
        } else if matches!(
            self.status,
            PlaybackStatus::Playing | PlaybackStatus::Paused
        ) {
            let track = self.display.track().cloned();
            self.fail_playback(track, "playback engine exited".to_string())
                .await;
        } else {
            self.publish().await;
        }
    }

    async fn cleanup(&mut self) {
        info!("PlayerCore: cleaning up");
        self.supersede_play();
        self.drop_preload();
        self.library.stop_import_poll();
        self.engine.shutdown().await;
    }
}
