//! In-memory media service and engine for driving the core in tests.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use cadence_proto::model::{
    DownloadEntry, ImportOutcome, ImportProgress, Playlist, StreamRef, Track,
};
use futures_util::stream::{self, BoxStream, StreamExt};
use tokio::sync::mpsc;

use crate::core::CoreEvent;
use crate::engine::{EngineEvent, PlaybackEngine};
use crate::error::{EngineError, EngineResult, ServiceError, ServiceResult};
use crate::service::MediaService;

pub fn tracks(ids: &[&str]) -> Vec<Track> {
    ids.iter()
        .map(|id| {
            let mut t = Track::new(*id, id.to_uppercase());
            t.duration = Some(200.0);
            t
        })
        .collect()
}

pub fn download_entry(id: &str) -> DownloadEntry {
    DownloadEntry {
        id: id.to_string(),
        title: id.to_uppercase(),
        uploader: "Someone".to_string(),
        thumbnail: String::new(),
        filename: format!("{}.mp3", id),
        path: format!("/music/{}.mp3", id),
    }
}

#[derive(Default)]
pub struct FakeService {
    pub search_results: Mutex<HashMap<String, Vec<Track>>>,
    pub related: Mutex<HashMap<String, Vec<Track>>>,
    pub failing_streams: Mutex<HashSet<String>>,
    /// Per-track stream resolution delay in milliseconds.
    pub slow_streams: Mutex<HashMap<String, u64>>,
    pub downloads: Mutex<Vec<DownloadEntry>>,
    pub playlists: Mutex<Vec<Playlist>>,
    pub recommendations: Mutex<Vec<Track>>,
    calls: Mutex<Vec<String>>,
}

impl FakeService {
    pub fn with_search(self, query: &str, results: Vec<Track>) -> Self {
        self.search_results
            .lock()
            .unwrap()
            .insert(query.to_string(), results);
        self
    }

    pub fn with_related(self, track_id: &str, results: Vec<Track>) -> Self {
        self.related
            .lock()
            .unwrap()
            .insert(track_id.to_string(), results);
        self
    }

    pub fn with_failing_stream(self, track_id: &str) -> Self {
        self.failing_streams
            .lock()
            .unwrap()
            .insert(track_id.to_string());
        self
    }

    pub fn with_slow_stream(self, track_id: &str, millis: u64) -> Self {
        self.slow_streams
            .lock()
            .unwrap()
            .insert(track_id.to_string(), millis);
        self
    }

    pub fn with_downloads(self, entries: Vec<DownloadEntry>) -> Self {
        *self.downloads.lock().unwrap() = entries;
        self
    }

    pub fn with_playlist(self, playlist: Playlist) -> Self {
        self.playlists.lock().unwrap().push(playlist);
        self
    }

    pub fn with_recommendations(self, tracks: Vec<Track>) -> Self {
        *self.recommendations.lock().unwrap() = tracks;
        self
    }

    pub fn calls(&self) -> Vec<String> {
        self.calls.lock().unwrap().clone()
    }

    pub fn count(&self, call: &str) -> usize {
        self.calls().iter().filter(|c| *c == call).count()
    }

    fn record(&self, call: String) {
        self.calls.lock().unwrap().push(call);
    }
}

#[async_trait]
impl MediaService for FakeService {
    async fn search(&self, query: &str) -> ServiceResult<Vec<Track>> {
        self.record(format!("search:{}", query));
        Ok(self
            .search_results
            .lock()
            .unwrap()
            .get(query)
            .cloned()
            .unwrap_or_default())
    }

    async fn related(&self, track_id: &str) -> ServiceResult<Vec<Track>> {
        self.record(format!("related:{}", track_id));
        Ok(self
            .related
            .lock()
            .unwrap()
            .get(track_id)
            .cloned()
            .unwrap_or_default())
    }

    async fn resolve_stream(&self, track_id: &str) -> ServiceResult<StreamRef> {
        self.record(format!("stream:{}", track_id));
        let delay = self.slow_streams.lock().unwrap().get(track_id).copied();
        if let Some(millis) = delay {
            tokio::time::sleep(tokio::time::Duration::from_millis(millis)).await;
        }
        if self.failing_streams.lock().unwrap().contains(track_id) {
            return Err(ServiceError::NoStream(track_id.to_string()));
        }
        Ok(StreamRef {
            track_id: track_id.to_string(),
            url: format!("fake://{}", track_id),
            duration: Some(200.0),
            format: None,
        })
    }

    fn local_stream_url(&self, entry: &DownloadEntry) -> String {
        format!("fake://local/{}", entry.filename)
    }

    async fn download(&self, track_id: &str) -> ServiceResult<String> {
        self.record(format!("download:{}", track_id));
        tokio::time::sleep(tokio::time::Duration::from_millis(20)).await;
        Ok(format!("{}.mp3", track_id))
    }

    async fn download_progress(&self, track_id: &str) -> ServiceResult<BoxStream<'static, f32>> {
        self.record(format!("progress:{}", track_id));
        Ok(stream::iter(vec![25.0, 100.0]).boxed())
    }

    async fn downloads(&self) -> ServiceResult<Vec<DownloadEntry>> {
        self.record("downloads".to_string());
        Ok(self.downloads.lock().unwrap().clone())
    }

    async fn delete_download(&self, track_id: &str) -> ServiceResult<()> {
        self.record(format!("delete-download:{}", track_id));
        self.downloads.lock().unwrap().retain(|d| d.id != track_id);
        Ok(())
    }

    async fn playlists(&self) -> ServiceResult<Vec<Playlist>> {
        self.record("playlists".to_string());
        Ok(self.playlists.lock().unwrap().clone())
    }

    async fn create_playlist(&self, name: &str) -> ServiceResult<String> {
        self.record(format!("create-playlist:{}", name));
        let mut playlists = self.playlists.lock().unwrap();
        let id = format!("p{}", playlists.len() + 1);
        playlists.push(Playlist {
            id: id.clone(),
            name: name.to_string(),
            songs: Vec::new(),
            created_at: None,
        });
        Ok(id)
    }

    async fn delete_playlist(&self, playlist_id: &str) -> ServiceResult<()> {
        self.record(format!("delete-playlist:{}", playlist_id));
        self.playlists.lock().unwrap().retain(|p| p.id != playlist_id);
        Ok(())
    }

    async fn add_to_playlist(&self, playlist_id: &str, track: &Track) -> ServiceResult<()> {
        self.record(format!("add:{}:{}", playlist_id, track.id));
        let mut playlists = self.playlists.lock().unwrap();
        let playlist = playlists
            .iter_mut()
            .find(|p| p.id == playlist_id)
            .ok_or_else(|| ServiceError::Rejected("Playlist not found".to_string()))?;
        playlist.songs.push(track.clone());
        Ok(())
    }

    async fn remove_from_playlist(&self, playlist_id: &str, track_id: &str) -> ServiceResult<()> {
        self.record(format!("remove:{}:{}", playlist_id, track_id));
        let mut playlists = self.playlists.lock().unwrap();
        if let Some(p) = playlists.iter_mut().find(|p| p.id == playlist_id) {
            p.songs.retain(|s| s.id != track_id);
        }
        Ok(())
    }

    async fn import_playlist(
        &self,
        name: Option<&str>,
        url: &str,
    ) -> ServiceResult<ImportOutcome> {
        self.record(format!("import:{}", url));
        Ok(ImportOutcome {
            playlist_id: "imported".to_string(),
            name: name.unwrap_or("Imported").to_string(),
            song_count: 3,
            total_songs: 4,
        })
    }

    async fn import_progress(&self) -> ServiceResult<ImportProgress> {
        Ok(ImportProgress {
            progress: 50.0,
            total_songs: 4,
        })
    }

    async fn recommendations(&self) -> ServiceResult<Vec<Track>> {
        self.record("recommendations".to_string());
        Ok(self.recommendations.lock().unwrap().clone())
    }
}

/// Engine that records what it was told.  Accepted sources report
/// `Started` back into the event loop unless `hold_start` is set.
#[derive(Clone, Default)]
pub struct FakeEngine {
    pub log: Arc<Mutex<Vec<String>>>,
    pub failing_urls: Arc<Mutex<HashSet<String>>>,
    pub dead: Arc<Mutex<bool>>,
    pub hold_start: Arc<Mutex<bool>>,
    events: Option<mpsc::Sender<CoreEvent>>,
}

impl FakeEngine {
    pub fn with_events(mut self, events: mpsc::Sender<CoreEvent>) -> Self {
        self.events = Some(events);
        self
    }

    pub fn entries(&self) -> Vec<String> {
        self.log.lock().unwrap().clone()
    }

    pub fn loads(&self) -> Vec<String> {
        self.entries()
            .into_iter()
            .filter_map(|e| e.strip_prefix("load:").map(str::to_string))
            .collect()
    }

    fn push(&self, entry: String) {
        self.log.lock().unwrap().push(entry);
    }
}

#[async_trait]
impl PlaybackEngine for FakeEngine {
    async fn load(&mut self, url: &str, _volume: f32) -> EngineResult<()> {
        if self.failing_urls.lock().unwrap().contains(url) {
            return Err(EngineError::Command(format!("cannot open {}", url)));
        }
        self.push(format!("load:{}", url));
        if !*self.hold_start.lock().unwrap() {
            if let Some(events) = &self.events {
                let _ = events.try_send(CoreEvent::Engine(EngineEvent::Started));
            }
        }
        Ok(())
    }

    async fn set_pause(&mut self, paused: bool) -> EngineResult<()> {
        self.push(format!("pause:{}", paused));
        Ok(())
    }

    async fn seek_to(&mut self, secs: f64) -> EngineResult<()> {
        self.push(format!("seek:{}", secs));
        Ok(())
    }

    async fn set_volume(&mut self, volume: f32) -> EngineResult<()> {
        self.push(format!("volume:{}", volume));
        Ok(())
    }

    async fn stop(&mut self) -> EngineResult<()> {
        self.push("stop".to_string());
        Ok(())
    }

    async fn check_alive(&mut self) -> bool {
        !*self.dead.lock().unwrap()
    }

    async fn shutdown(&mut self) {
        self.push("shutdown".to_string());
    }
}
