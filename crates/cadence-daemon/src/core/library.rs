//! Library side of the core: downloads, playlists, recommendations and
//! playlist import.  Results come back through `CoreEvent::Library`.

use std::collections::HashSet;
use std::sync::Arc;

use cadence_proto::model::{
    DownloadEntry, ImportOutcome, ImportProgress, Playlist, StreamRef, Track,
};
use cadence_proto::protocol::{Display, PlaybackMode, PlaybackStatus, PlayerState};
use rand::seq::SliceRandom;
use tokio::task::AbortHandle;
use tracing::{debug, info, warn};

use super::{CoreEvent, PlayerCore};
use crate::error::{ServiceError, ServiceResult};
use crate::BroadcastMessage;

#[derive(Debug)]
pub enum LibraryEvent {
    Playlists(ServiceResult<Vec<Playlist>>),
    PlaylistCreated {
        name: String,
        result: ServiceResult<String>,
    },
    PlaylistDeleted {
        playlist_id: String,
        result: ServiceResult<()>,
    },
    PlaylistEdited {
        playlist_id: String,
        result: ServiceResult<()>,
    },
    Downloads(ServiceResult<Vec<DownloadEntry>>),
    DownloadDeleted {
        track_id: String,
        result: ServiceResult<()>,
    },
    DownloadProgress {
        track_id: String,
        percent: f32,
    },
    DownloadFinished {
        track_id: String,
        result: ServiceResult<String>,
    },
    Recommendations {
        /// Initial loads replace the list; "more" loads extend it.
        initial: bool,
        result: ServiceResult<Vec<Track>>,
    },
    ImportProgress(ImportProgress),
    ImportFinished(ServiceResult<ImportOutcome>),
}

#[derive(Default)]
pub(super) struct Library {
    pub downloads: Vec<DownloadEntry>,
    /// Index into `downloads` while the downloaded library is playing.
    pub current_download: Option<usize>,
    pub playlists: Vec<Playlist>,
    pub open_playlist: Option<String>,
    recommendations: Vec<Track>,
    recommended_ids: HashSet<String>,
    loading_recommendations: bool,
    import: Option<ImportProgress>,
    import_poller: Option<AbortHandle>,
}

impl Library {
    pub fn fill_snapshot(&self, s: &mut PlayerState) {
        s.downloads = self.downloads.clone();
        s.current_download = self.current_download;
        s.playlists = self.playlists.clone();
        s.open_playlist = self.open_playlist.clone();
        s.recommendations = self.recommendations.clone();
        s.import = self.import;
    }

    pub fn stop_import_poll(&mut self) {
        if let Some(poller) = self.import_poller.take() {
            poller.abort();
        }
    }

    fn add_recommendations(&mut self, tracks: Vec<Track>) -> usize {
        let before = self.recommendations.len();
        for track in tracks {
            if self.recommended_ids.insert(track.id.clone()) {
                self.recommendations.push(track);
            }
        }
        self.recommendations.len() - before
    }
}

impl PlayerCore {
    /// Run `fut` off the loop and post its output as a library event.
    fn spawn_library<F>(&self, fut: F)
    where
        F: std::future::Future<Output = LibraryEvent> + Send + 'static,
    {
        let tx = self.event_tx.clone();
        tokio::spawn(async move {
            let evt = fut.await;
            let _ = tx.send(CoreEvent::Library(evt)).await;
        });
    }

    pub(super) async fn handle_library_event(&mut self, evt: LibraryEvent) {
        match evt {
            LibraryEvent::Playlists(Ok(playlists)) => {
                debug!("PlayerCore: {} playlists", playlists.len());
                self.library.playlists = playlists;
            }
            LibraryEvent::Playlists(Err(e)) => warn!("PlayerCore: playlists failed: {}", e),
            LibraryEvent::PlaylistCreated { name, result } => match result {
                Ok(id) => {
                    self.notice(format!("Created playlist \"{}\"", name));
                    debug!("PlayerCore: playlist {} created", id);
                    self.refresh_playlists();
                }
                Err(e) => self.notice(format!("Failed to create playlist: {}", e)),
            },
            LibraryEvent::PlaylistDeleted {
                playlist_id,
                result,
            } => match result {
                Ok(()) => {
                    self.notice("Playlist deleted");
                    if self.library.open_playlist.as_deref() == Some(playlist_id.as_str()) {
                        self.library.open_playlist = None;
                    }
                    self.refresh_playlists();
                }
                Err(e) => self.notice(format!("Failed to delete playlist: {}", e)),
            },
            LibraryEvent::PlaylistEdited {
                playlist_id,
                result,
            } => match result {
                Ok(()) => self.refresh_playlists(),
                Err(e) => warn!("PlayerCore: editing playlist {} failed: {}", playlist_id, e),
            },
            LibraryEvent::Downloads(Ok(entries)) => {
                debug!("PlayerCore: {} downloaded tracks", entries.len());
                if let Some(cur) = self.library.current_download {
                    if cur >= entries.len() {
                        self.library.current_download = None;
                    }
                }
                self.library.downloads = entries;
            }
            LibraryEvent::Downloads(Err(e)) => warn!("PlayerCore: downloads failed: {}", e),
            LibraryEvent::DownloadDeleted { track_id, result } => match result {
                Ok(()) => {
                    self.notice("Download deleted");
                    debug!("PlayerCore: deleted download {}", track_id);
                    self.refresh_downloads();
                }
                Err(e) => self.notice(format!("Failed to delete download: {}", e)),
            },
            LibraryEvent::DownloadProgress { track_id, percent } => {
                if self.downloads.update(&track_id, percent) {
                    let _ = self
                        .broadcast_tx
                        .send(BroadcastMessage::DownloadProgress { track_id, percent });
                }
                return;
            }
            LibraryEvent::DownloadFinished { track_id, result } => {
                self.downloads.finish(&track_id);
                match result {
                    Ok(filename) => {
                        self.notice(format!("Downloaded {}", filename));
                        self.refresh_downloads();
                    }
                    Err(e) => self.notice(format!("Download failed: {}", e)),
                }
            }
            LibraryEvent::Recommendations { initial, result } => {
                self.library.loading_recommendations = false;
                match result {
                    Ok(tracks) => {
                        if initial {
                            self.library.recommended_ids.clear();
                            self.library.recommendations.clear();
                        }
                        let added = self.library.add_recommendations(tracks);
                        debug!("PlayerCore: {} new recommendations", added);
                    }
                    Err(e) => warn!("PlayerCore: recommendations failed: {}", e),
                }
            }
            LibraryEvent::ImportProgress(progress) => {
                if self.library.import_poller.is_none() {
                    return;
                }
                self.library.import = Some(progress);
                let _ = self
                    .broadcast_tx
                    .send(BroadcastMessage::ImportProgress(progress));
                return;
            }
            LibraryEvent::ImportFinished(result) => {
                self.library.stop_import_poll();
                self.library.import = None;
                match result {
                    Ok(outcome) => {
                        self.notice(format!(
                            "Imported {} of {} songs into \"{}\"",
                            outcome.song_count, outcome.total_songs, outcome.name
                        ));
                        self.refresh_playlists();
                    }
                    Err(e) => self.notice(format!("Import failed: {}", e)),
                }
            }
        }
        self.publish().await;
    }

    // ── downloads ─────────────────────────────────────────────────────────────

    pub(super) fn refresh_downloads(&self) {
        let service = Arc::clone(&self.service);
        self.spawn_library(async move { LibraryEvent::Downloads(service.downloads().await) });
    }

    pub(super) async fn start_download(&mut self, track_id: Option<String>) {
        let Some(track_id) = track_id.or_else(|| self.display.track().map(|t| t.id.clone()))
        else {
            self.notice("Nothing to download");
            return;
        };
        match self
            .downloads
            .start(&track_id, Arc::clone(&self.service), self.event_tx.clone())
        {
            Ok(()) => {
                info!("PlayerCore: download started for {}", track_id);
                self.publish().await;
            }
            Err(reason) => self.notice(reason),
        }
    }

    pub(super) fn delete_download(&self, track_id: String) {
        let service = Arc::clone(&self.service);
        self.spawn_library(async move {
            let result = service.delete_download(&track_id).await;
            LibraryEvent::DownloadDeleted { track_id, result }
        });
    }

    /// Play a file from the downloaded library.  Local files need no stream
    /// resolution.
    pub(super) async fn play_download(&mut self, index: usize) {
        let Some(entry) = self.library.downloads.get(index).cloned() else {
            debug!("PlayerCore: download {} out of range", index);
            return;
        };
        self.set_mode(PlaybackMode::DownloadedLibrary);
        self.supersede_play();
        self.queue.clear_position();
        self.library.current_download = Some(index);

        let track = entry.as_track();
        let stream = StreamRef {
            track_id: entry.id.clone(),
            url: self.service.local_stream_url(&entry),
            duration: None,
            format: None,
        };
        self.status = PlaybackStatus::Loading;
        self.display = Display::Loading {
            track: track.clone(),
        };
        self.time_pos = None;
        self.duration = None;
        self.seek_preview = None;
        self.start_output(track, stream).await;
    }

    // ── playlists ─────────────────────────────────────────────────────────────

    pub(super) fn refresh_playlists(&self) {
        let service = Arc::clone(&self.service);
        self.spawn_library(async move { LibraryEvent::Playlists(service.playlists().await) });
    }

    pub(super) fn create_playlist(&self, name: String) {
        let name = name.trim().to_string();
        if name.is_empty() {
            self.notice("Playlist name cannot be empty");
            return;
        }
        let service = Arc::clone(&self.service);
        self.spawn_library(async move {
            let result = service.create_playlist(&name).await;
            LibraryEvent::PlaylistCreated { name, result }
        });
    }

    pub(super) fn delete_playlist(&self, playlist_id: String) {
        let service = Arc::clone(&self.service);
        self.spawn_library(async move {
            let result = service.delete_playlist(&playlist_id).await;
            LibraryEvent::PlaylistDeleted {
                playlist_id,
                result,
            }
        });
    }

    pub(super) fn add_to_playlist(&self, playlist_id: String, track: Option<Track>) {
        let Some(track) = track.or_else(|| self.display.track().cloned()) else {
            self.notice("Nothing to add");
            return;
        };
        let service = Arc::clone(&self.service);
        self.spawn_library(async move {
            let result = service.add_to_playlist(&playlist_id, &track).await;
            LibraryEvent::PlaylistEdited {
                playlist_id,
                result,
            }
        });
    }

    pub(super) fn remove_from_playlist(&self, playlist_id: String, track_id: String) {
        let service = Arc::clone(&self.service);
        self.spawn_library(async move {
            let result = service.remove_from_playlist(&playlist_id, &track_id).await;
            LibraryEvent::PlaylistEdited {
                playlist_id,
                result,
            }
        });
    }

    /// Install a cached playlist as the queue and start at `index`.
    pub(super) async fn play_playlist(&mut self, playlist_id: String, index: usize) {
        let Some(playlist) = self
            .library
            .playlists
            .iter()
            .find(|p| p.id == playlist_id)
            .cloned()
        else {
            self.notice("Playlist not found");
            return;
        };
        if playlist.songs.is_empty() {
            self.notice(format!("Playlist \"{}\" is empty", playlist.name));
            return;
        }
        if index >= playlist.songs.len() {
            debug!("PlayerCore: playlist index {} out of range", index);
            return;
        }
        info!(
            "PlayerCore: playing playlist '{}' from {}",
            playlist.name, index
        );
        self.set_mode(PlaybackMode::Playlist);
        self.library.open_playlist = Some(playlist.id);
        self.queue.install(playlist.songs);
        self.play_track(index).await;
    }

    pub(super) async fn import_playlist(&mut self, name: Option<String>, url: String) {
        let url = url.trim().to_string();
        if url.is_empty() {
            self.notice("Import URL cannot be empty");
            return;
        }
        if self.library.import_poller.is_some() {
            self.notice("An import is already running");
            return;
        }

        let service = Arc::clone(&self.service);
        let tx = self.event_tx.clone();
        let interval = tokio::time::Duration::from_millis(self.config.import_poll_ms);
        let poller = tokio::spawn(async move {
            loop {
                tokio::time::sleep(interval).await;
                match service.import_progress().await {
                    Ok(p) => {
                        let evt = CoreEvent::Library(LibraryEvent::ImportProgress(p));
                        if tx.send(evt).await.is_err() {
                            break;
                        }
                    }
                    Err(e) => debug!("PlayerCore: import progress poll failed: {}", e),
                }
            }
        });
        self.library.import_poller = Some(poller.abort_handle());
        self.library.import = Some(ImportProgress::default());

        let service = Arc::clone(&self.service);
        self.spawn_library(async move {
            LibraryEvent::ImportFinished(service.import_playlist(name.as_deref(), &url).await)
        });
        self.publish().await;
    }

    // ── recommendations ───────────────────────────────────────────────────────

    pub(super) fn load_recommendations(&mut self, more: bool) {
        if self.library.loading_recommendations {
            debug!("PlayerCore: recommendations already loading");
            return;
        }

        let service = Arc::clone(&self.service);
        if !more {
            self.library.loading_recommendations = true;
            self.spawn_library(async move {
                LibraryEvent::Recommendations {
                    initial: true,
                    result: service.recommendations().await,
                }
            });
            return;
        }

        // "more": seed from a random downloaded track
        let Some(seed) = self
            .library
            .downloads
            .choose(&mut rand::thread_rng())
            .map(|d| d.title.clone())
        else {
            debug!("PlayerCore: no downloads to seed recommendations");
            return;
        };
        self.library.loading_recommendations = true;
        self.spawn_library(async move {
            let result = async {
                let hits = service.search(&seed).await?;
                let first = hits
                    .into_iter()
                    .next()
                    .ok_or_else(|| ServiceError::Parse(format!("no results for '{}'", seed)))?;
                service.related(&first.id).await
            }
            .await;
            LibraryEvent::Recommendations {
                initial: false,
                result,
            }
        });
    }

    pub(super) async fn play_recommendation(&mut self, track_id: String) {
        let Some(track) = self
            .library
            .recommendations
            .iter()
            .find(|t| t.id == track_id)
            .cloned()
        else {
            debug!("PlayerCore: unknown recommendation {}", track_id);
            return;
        };
        self.set_mode(PlaybackMode::SearchQueue);
        self.queue.install(vec![track]);
        self.play_track(0).await;
    }
}
