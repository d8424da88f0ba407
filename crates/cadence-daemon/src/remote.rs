//! HTTP client for the media service.
//!
//! No request timeouts: a hung call is superseded by newer intents on the
//! event loop, never cancelled here.

use async_trait::async_trait;
use cadence_proto::config::ServiceConfig;
use cadence_proto::model::{
    normalize_all, DownloadEntry, ImportOutcome, ImportProgress, Playlist, PlaylistBody,
    StreamInfo, StreamRef, Track,
};
use futures_util::stream::{BoxStream, Stream, StreamExt};
use reqwest::{Client, RequestBuilder, Url};
use serde::de::DeserializeOwned;
use serde::Deserialize;
use std::collections::BTreeMap;
use tracing::debug;

use crate::error::{ServiceError, ServiceResult};
use crate::service::MediaService;

pub struct RemoteService {
    client: Client,
    base: Url,
    prefer_direct_stream: bool,
}

// ── reply bodies ──────────────────────────────────────────────────────────────

#[derive(Debug, Deserialize)]
struct SuccessReply {
    #[serde(default)]
    success: bool,
    #[serde(default)]
    id: Option<String>,
    #[serde(default)]
    error: Option<String>,
}

#[derive(Debug, Deserialize)]
struct DownloadReply {
    status: String,
    #[serde(default)]
    filename: Option<String>,
    #[serde(default)]
    message: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ImportReply {
    #[serde(default)]
    success: bool,
    #[serde(default)]
    playlist_id: Option<String>,
    #[serde(default)]
    name: Option<String>,
    #[serde(default)]
    song_count: usize,
    #[serde(default)]
    total_songs: usize,
    #[serde(default)]
    error: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ErrorBody {
    #[serde(default)]
    error: Option<String>,
    #[serde(default)]
    message: Option<String>,
}

impl RemoteService {
    pub fn new(config: &ServiceConfig) -> anyhow::Result<Self> {
        let mut base = Url::parse(&config.base_url)?;
        if !base.path().ends_with('/') {
            let path = format!("{}/", base.path());
            base.set_path(&path);
        }
        let client = Client::builder()
            .user_agent(concat!("cadence/", env!("CARGO_PKG_VERSION")))
            .build()?;
        Ok(Self {
            client,
            base,
            prefer_direct_stream: config.prefer_direct_stream,
        })
    }

    fn url(&self, path: &str) -> ServiceResult<Url> {
        self.base
            .join(path.trim_start_matches('/'))
            .map_err(|e| ServiceError::InvalidInput(format!("{}: {}", path, e)))
    }

    /// `/api/<segments...>` with each segment percent-encoded.
    fn api_url(&self, segments: &[&str]) -> ServiceResult<Url> {
        let mut url = self.url("api")?;
        url.path_segments_mut()
            .map_err(|_| ServiceError::InvalidInput(self.base.to_string()))?
            .pop_if_empty()
            .extend(segments);
        Ok(url)
    }

    async fn fetch_json<T: DeserializeOwned>(&self, request: RequestBuilder) -> ServiceResult<T> {
        let response = request.send().await?;
        let status = response.status();
        let body = response.text().await?;
        if !status.is_success() {
            return Err(status_error(status.as_u16(), &body));
        }
        serde_json::from_str(&body).map_err(|e| ServiceError::Parse(e.to_string()))
    }

    /// Like `fetch_json` but decodes the body on error statuses too, for
    /// endpoints that report failure inside a `success`/`status` field.
    async fn fetch_reply<T: DeserializeOwned>(&self, request: RequestBuilder) -> ServiceResult<T> {
        let response = request.send().await?;
        let status = response.status();
        let body = response.text().await?;
        match serde_json::from_str(&body) {
            Ok(reply) => Ok(reply),
            Err(_) if !status.is_success() => Err(status_error(status.as_u16(), &body)),
            Err(e) => Err(ServiceError::Parse(e.to_string())),
        }
    }

    async fn expect_success(&self, request: RequestBuilder) -> ServiceResult<SuccessReply> {
        let reply: SuccessReply = self.fetch_reply(request).await?;
        if reply.success {
            Ok(reply)
        } else {
            Err(ServiceError::Rejected(
                reply.error.unwrap_or_else(|| "operation failed".to_string()),
            ))
        }
    }

    fn pick_stream_url(&self, info: &StreamInfo) -> Option<String> {
        let proxied = info
            .proxied_url
            .as_deref()
            .filter(|u| !u.is_empty())
            .and_then(|u| self.url(u).ok())
            .map(|u| u.to_string());
        let direct = info.direct_url.clone().filter(|u| !u.is_empty());
        if self.prefer_direct_stream {
            direct.or(proxied)
        } else {
            proxied.or(direct)
        }
    }
}

fn status_error(status: u16, body: &str) -> ServiceError {
    let message = serde_json::from_str::<ErrorBody>(body)
        .ok()
        .and_then(|b| b.error.or(b.message))
        .unwrap_or_else(|| body.chars().take(200).collect());
    ServiceError::Status { status, message }
}

/// One SSE line → percent.  The service emits Python-repr payloads such as
/// `data: {'progress': 0.42}`; values up to 1.0 are fractions.
pub fn parse_progress_line(line: &str) -> Option<f32> {
    let payload = line.trim().strip_prefix("data:")?.trim();
    let json = payload.replace('\'', "\"");
    let value: serde_json::Value = serde_json::from_str(&json).ok()?;
    let raw = value.get("progress")?.as_f64()?;
    if !raw.is_finite() || raw < 0.0 {
        return None;
    }
    let percent = if raw <= 1.0 { raw * 100.0 } else { raw };
    Some(percent.min(100.0) as f32)
}

/// Split the next complete line off `buf`.  Decoding waits for the newline
/// so a character split across network chunks stays intact.
fn next_line(buf: &mut Vec<u8>) -> Option<String> {
    let end = buf.iter().position(|b| *b == b'\n')?;
    let line: Vec<u8> = buf.drain(..=end).collect();
    Some(String::from_utf8_lossy(&line).into_owned())
}

fn progress_events<S, B, E>(bytes: S) -> BoxStream<'static, f32>
where
    S: Stream<Item = Result<B, E>> + Send + 'static,
    B: AsRef<[u8]> + Send + 'static,
    E: Send + 'static,
{
    futures_util::stream::unfold(
        (Box::pin(bytes), Vec::new()),
        |(mut bytes, mut buf)| async move {
            loop {
                if let Some(line) = next_line(&mut buf) {
                    if let Some(percent) = parse_progress_line(&line) {
                        return Some((percent, (bytes, buf)));
                    }
                    continue;
                }
                match bytes.next().await {
                    Some(Ok(chunk)) => buf.extend_from_slice(chunk.as_ref()),
                    _ => return None,
                }
            }
        },
    )
    .boxed()
}

#[async_trait]
impl MediaService for RemoteService {
    async fn search(&self, query: &str) -> ServiceResult<Vec<Track>> {
        let query = query.trim();
        if query.is_empty() {
            return Err(ServiceError::InvalidInput("empty search query".into()));
        }
        let request = self
            .client
            .get(self.api_url(&["search"])?)
            .query(&[("q", query)]);
        let tracks: Vec<Track> = self.fetch_json(request).await?;
        Ok(normalize_all(tracks))
    }

    async fn related(&self, track_id: &str) -> ServiceResult<Vec<Track>> {
        let request = self.client.get(self.api_url(&["related", track_id])?);
        let tracks: Vec<Track> = self.fetch_json(request).await?;
        Ok(normalize_all(tracks))
    }

    async fn resolve_stream(&self, track_id: &str) -> ServiceResult<StreamRef> {
        let request = self.client.get(self.api_url(&["stream", track_id])?);
        let info: StreamInfo = self.fetch_json(request).await?;
        if let Some(err) = info.error.as_ref() {
            return Err(ServiceError::Rejected(err.clone()));
        }
        let url = self
            .pick_stream_url(&info)
            .ok_or_else(|| ServiceError::NoStream(track_id.to_string()))?;
        debug!("remote: resolved {} -> {}", track_id, url);
        Ok(StreamRef {
            track_id: track_id.to_string(),
            url,
            duration: info.duration,
            format: info.format,
        })
    }

    fn local_stream_url(&self, entry: &DownloadEntry) -> String {
        match self.api_url(&["local", &entry.filename]) {
            Ok(url) => url.to_string(),
            Err(_) => format!("{}api/local/{}", self.base, entry.filename),
        }
    }

    async fn download(&self, track_id: &str) -> ServiceResult<String> {
        let request = self.client.get(self.api_url(&["download", track_id])?);
        let reply: DownloadReply = self.fetch_reply(request).await?;
        match (reply.status.as_str(), reply.filename) {
            ("success", Some(filename)) => Ok(filename),
            _ => Err(ServiceError::Rejected(
                reply
                    .message
                    .unwrap_or_else(|| "Failed to download track".to_string()),
            )),
        }
    }

    async fn download_progress(&self, track_id: &str) -> ServiceResult<BoxStream<'static, f32>> {
        let url = self.api_url(&["download", track_id, "progress"])?;
        let response = self.client.get(url).send().await?;
        if !response.status().is_success() {
            return Err(ServiceError::Status {
                status: response.status().as_u16(),
                message: "progress stream unavailable".into(),
            });
        }
        Ok(progress_events(response.bytes_stream()))
    }

    async fn downloads(&self) -> ServiceResult<Vec<DownloadEntry>> {
        let request = self.client.get(self.api_url(&["downloads"])?);
        self.fetch_json(request).await
    }

    async fn delete_download(&self, track_id: &str) -> ServiceResult<()> {
        let request = self.client.delete(self.api_url(&["downloads", track_id])?);
        let response = request.send().await?;
        let status = response.status();
        if status.is_success() {
            return Ok(());
        }
        let body = response.text().await.unwrap_or_default();
        Err(status_error(status.as_u16(), &body))
    }

    async fn playlists(&self) -> ServiceResult<Vec<Playlist>> {
        let request = self.client.get(self.api_url(&["playlists"])?);
        let map: BTreeMap<String, PlaylistBody> = self.fetch_json(request).await?;
        let mut playlists: Vec<Playlist> = map
            .into_iter()
            .map(|(id, body)| body.into_playlist(id))
            .collect();
        playlists.sort_by(|a, b| a.created_at.cmp(&b.created_at).then(a.id.cmp(&b.id)));
        Ok(playlists)
    }

    async fn create_playlist(&self, name: &str) -> ServiceResult<String> {
        let request = self
            .client
            .post(self.api_url(&["playlists"])?)
            .json(&serde_json::json!({ "name": name }));
        let reply = self.expect_success(request).await?;
        reply
            .id
            .ok_or_else(|| ServiceError::Parse("playlist created without id".into()))
    }

    async fn delete_playlist(&self, playlist_id: &str) -> ServiceResult<()> {
        let request = self
            .client
            .delete(self.api_url(&["playlists", playlist_id])?);
        self.expect_success(request).await.map(|_| ())
    }

    async fn add_to_playlist(&self, playlist_id: &str, track: &Track) -> ServiceResult<()> {
        let request = self
            .client
            .post(self.api_url(&["playlists", playlist_id, "songs"])?)
            .json(track);
        self.expect_success(request).await.map(|_| ())
    }

    async fn remove_from_playlist(&self, playlist_id: &str, track_id: &str) -> ServiceResult<()> {
        let request = self
            .client
            .delete(self.api_url(&["playlists", playlist_id, "songs"])?)
            .query(&[("song_id", track_id)]);
        self.expect_success(request).await.map(|_| ())
    }

    async fn import_playlist(
        &self,
        name: Option<&str>,
        url: &str,
    ) -> ServiceResult<ImportOutcome> {
        if url.trim().is_empty() {
            return Err(ServiceError::InvalidInput("no playlist URL".into()));
        }
        let request = self
            .client
            .post(self.api_url(&["playlists", "import"])?)
            .json(&serde_json::json!({ "spotifyUrl": url, "name": name }));
        let reply: ImportReply = self.fetch_reply(request).await?;
        if !reply.success {
            return Err(ServiceError::Rejected(
                reply.error.unwrap_or_else(|| "import failed".to_string()),
            ));
        }
        Ok(ImportOutcome {
            playlist_id: reply.playlist_id.unwrap_or_default(),
            name: reply.name.unwrap_or_default(),
            song_count: reply.song_count,
            total_songs: reply.total_songs,
        })
    }

    async fn import_progress(&self) -> ServiceResult<ImportProgress> {
        let request = self
            .client
            .get(self.api_url(&["playlists", "import", "progress"])?);
        self.fetch_json(request).await
    }

    async fn recommendations(&self) -> ServiceResult<Vec<Track>> {
        let request = self.client.get(self.api_url(&["recommendations"])?);
        let tracks: Vec<Track> = self.fetch_json(request).await?;
        Ok(normalize_all(tracks))
    }
}
