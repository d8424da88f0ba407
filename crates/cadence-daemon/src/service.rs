//! Contract with the remote media service.
//!
//! The event loop only ever sees this trait; `remote::RemoteService` is the
//! HTTP implementation and the tests use an in-memory one.

use async_trait::async_trait;
use cadence_proto::model::{
    DownloadEntry, ImportOutcome, ImportProgress, Playlist, StreamRef, Track,
};
use futures_util::stream::BoxStream;

use crate::error::ServiceResult;

#[async_trait]
pub trait MediaService: Send + Sync {
    async fn search(&self, query: &str) -> ServiceResult<Vec<Track>>;

    async fn related(&self, track_id: &str) -> ServiceResult<Vec<Track>>;

    /// Resolve a playable URL for a track.
    async fn resolve_stream(&self, track_id: &str) -> ServiceResult<StreamRef>;

    /// URL the engine plays for a file in the downloaded library.
    fn local_stream_url(&self, entry: &DownloadEntry) -> String;

    // ── Downloads ────────────────────────────────────────────────────────────

    /// Runs until the service finishes the download; returns the filename.
    async fn download(&self, track_id: &str) -> ServiceResult<String>;

    /// Progress in percent (0..=100).  Ends when the service closes it.
    async fn download_progress(&self, track_id: &str) -> ServiceResult<BoxStream<'static, f32>>;

    async fn downloads(&self) -> ServiceResult<Vec<DownloadEntry>>;

    async fn delete_download(&self, track_id: &str) -> ServiceResult<()>;

    // ── Playlists ────────────────────────────────────────────────────────────

    async fn playlists(&self) -> ServiceResult<Vec<Playlist>>;

    /// Returns the new playlist id.
    async fn create_playlist(&self, name: &str) -> ServiceResult<String>;

    async fn delete_playlist(&self, playlist_id: &str) -> ServiceResult<()>;

    async fn add_to_playlist(&self, playlist_id: &str, track: &Track) -> ServiceResult<()>;

    async fn remove_from_playlist(&self, playlist_id: &str, track_id: &str) -> ServiceResult<()>;

    async fn import_playlist(&self, name: Option<&str>, url: &str)
        -> ServiceResult<ImportOutcome>;

    async fn import_progress(&self) -> ServiceResult<ImportProgress>;

    // ── Recommendations ──────────────────────────────────────────────────────

    async fn recommendations(&self) -> ServiceResult<Vec<Track>>;
}
