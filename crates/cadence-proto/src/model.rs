//! Domain records exchanged with the remote media service and published to
//! clients.
//!
//! The service is loose about shapes: durations arrive as seconds, as `m:ss`
//! strings, as `"Unknown"`, or not at all, and optional fields are simply
//! missing. Everything here deserializes leniently and [`Track::normalize`]
//! fills the display defaults.

use serde::{Deserialize, Deserializer, Serialize};

pub const DEFAULT_TITLE: &str = "Unknown Title";
pub const DEFAULT_UPLOADER: &str = "Unknown Artist";
pub const DEFAULT_THUMBNAIL: &str = "/static/default-thumbnail.png";

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Thumbnail {
    pub url: String,
}

/// A playable item as returned by search, related and recommendation calls.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Track {
    #[serde(default)]
    pub id: String,
    #[serde(default)]
    pub title: String,
    #[serde(default)]
    pub uploader: String,
    #[serde(default)]
    pub thumbnails: Vec<Thumbnail>,
    /// Seconds.  `None` when the service reported nothing usable.
    #[serde(default, deserialize_with = "lenient_duration")]
    pub duration: Option<f64>,
}

impl Track {
    pub fn new(id: impl Into<String>, title: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            title: title.into(),
            uploader: DEFAULT_UPLOADER.to_string(),
            thumbnails: vec![Thumbnail {
                url: DEFAULT_THUMBNAIL.to_string(),
            }],
            duration: None,
        }
    }

    /// Fill display defaults.  Returns `None` for a track without an id,
    /// which can never be resolved or deduplicated.
    pub fn normalize(mut self) -> Option<Self> {
        if self.id.trim().is_empty() {
            return None;
        }
        if self.title.trim().is_empty() {
            self.title = DEFAULT_TITLE.to_string();
        }
        if self.uploader.trim().is_empty() {
            self.uploader = DEFAULT_UPLOADER.to_string();
        }
        self.thumbnails.retain(|t| !t.url.is_empty());
        if self.thumbnails.is_empty() {
            self.thumbnails.push(Thumbnail {
                url: DEFAULT_THUMBNAIL.to_string(),
            });
        }
        Some(self)
    }

    /// Last thumbnail is the highest resolution one the service offers.
    pub fn thumbnail(&self) -> &str {
        self.thumbnails
            .last()
            .map(|t| t.url.as_str())
            .unwrap_or(DEFAULT_THUMBNAIL)
    }

    pub fn same_title(&self, other: &str) -> bool {
        self.title.to_lowercase() == other.to_lowercase()
    }
}

/// Normalize a batch, dropping entries that fail [`Track::normalize`].
pub fn normalize_all(tracks: Vec<Track>) -> Vec<Track> {
    tracks.into_iter().filter_map(Track::normalize).collect()
}

/// Accepts `123`, `123.4`, `"2:03"`, `"1:02:03"`, `"Unknown"`, `""`, `null`.
fn lenient_duration<'de, D>(deserializer: D) -> Result<Option<f64>, D::Error>
where
    D: Deserializer<'de>,
{
    let value = Option::<serde_json::Value>::deserialize(deserializer)?;
    Ok(value.as_ref().and_then(duration_from_value))
}

fn duration_from_value(value: &serde_json::Value) -> Option<f64> {
    match value {
        serde_json::Value::Number(n) => n.as_f64().filter(|d| *d > 0.0),
        serde_json::Value::String(s) => parse_clock(s),
        _ => None,
    }
}

/// Parse `m:ss` or `h:mm:ss` into seconds.
pub fn parse_clock(s: &str) -> Option<f64> {
    let s = s.trim();
    if s.is_empty() {
        return None;
    }
    let mut total = 0u64;
    for part in s.split(':') {
        let n: u64 = part.trim().parse().ok()?;
        total = total.checked_mul(60)?.checked_add(n)?;
    }
    (total > 0).then_some(total as f64)
}

/// Resolved audio source for one track.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct StreamRef {
    pub track_id: String,
    pub url: String,
    #[serde(default)]
    pub duration: Option<f64>,
    #[serde(default)]
    pub format: Option<String>,
}

/// Raw body of `GET /api/stream/{id}`.
#[derive(Debug, Clone, Deserialize)]
pub struct StreamInfo {
    #[serde(default)]
    pub direct_url: Option<String>,
    #[serde(default)]
    pub proxied_url: Option<String>,
    #[serde(default)]
    pub title: Option<String>,
    #[serde(default, deserialize_with = "lenient_duration")]
    pub duration: Option<f64>,
    #[serde(default)]
    pub format: Option<String>,
    #[serde(default)]
    pub error: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Playlist {
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub songs: Vec<Track>,
    #[serde(default)]
    pub created_at: Option<String>,
}

/// Value half of the `GET /api/playlists` map; the id is the key.
#[derive(Debug, Clone, Deserialize)]
pub struct PlaylistBody {
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub songs: Vec<Track>,
    #[serde(default)]
    pub created_at: Option<String>,
}

impl PlaylistBody {
    pub fn into_playlist(self, id: String) -> Playlist {
        Playlist {
            id,
            name: self.name,
            songs: normalize_all(self.songs),
            created_at: self.created_at,
        }
    }
}

/// One file in the downloaded library.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct DownloadEntry {
    pub id: String,
    #[serde(default)]
    pub title: String,
    #[serde(default)]
    pub uploader: String,
    #[serde(default)]
    pub thumbnail: String,
    pub filename: String,
    #[serde(default)]
    pub path: String,
}

impl DownloadEntry {
    pub fn as_track(&self) -> Track {
        let mut track = Track::new(self.id.clone(), self.title.clone());
        if !self.uploader.is_empty() {
            track.uploader = self.uploader.clone();
        }
        if !self.thumbnail.is_empty() {
            track.thumbnails = vec![Thumbnail {
                url: self.thumbnail.clone(),
            }];
        }
        track.normalize().unwrap_or_else(|| Track::new("", DEFAULT_TITLE))
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ImportOutcome {
    pub playlist_id: String,
    pub name: String,
    pub song_count: usize,
    pub total_songs: usize,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Default)]
pub struct ImportProgress {
    /// Percentage, 0..=100.
    pub progress: f32,
    pub total_songs: usize,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_duration_variants() {
        let json = r#"[
            {"id": "a", "title": "A", "duration": 213},
            {"id": "b", "title": "B", "duration": "3:33"},
            {"id": "c", "title": "C", "duration": "Unknown"},
            {"id": "d", "title": "D", "duration": null},
            {"id": "e", "title": "E"},
            {"id": "f", "title": "F", "duration": "1:00:05"}
        ]"#;
        let tracks: Vec<Track> = serde_json::from_str(json).unwrap();
        let durations: Vec<_> = tracks.iter().map(|t| t.duration).collect();
        assert_eq!(
            durations,
            vec![Some(213.0), Some(213.0), None, None, None, Some(3605.0)]
        );
    }

    #[test]
    fn test_oversized_clock_duration_is_unknown() {
        let json = r#"{"id": "a", "title": "t", "duration": "18446744073709551615:59"}"#;
        let track: Track = serde_json::from_str(json).unwrap();
        assert_eq!(track.duration, None);
        assert_eq!(parse_clock("99999999999999999:00:00"), None);
        assert_eq!(parse_clock("2:05"), Some(125.0));
    }

    #[test]
    fn test_normalize_fills_defaults() {
        let json = r#"{"id": "x1", "title": "", "thumbnails": []}"#;
        let track: Track = serde_json::from_str(json).unwrap();
        let track = track.normalize().unwrap();
        assert_eq!(track.title, DEFAULT_TITLE);
        assert_eq!(track.uploader, DEFAULT_UPLOADER);
        assert_eq!(track.thumbnail(), DEFAULT_THUMBNAIL);
    }

    #[test]
    fn test_normalize_rejects_missing_id() {
        let json = r#"[{"title": "no id"}, {"id": "  ", "title": "blank"}, {"id": "ok"}]"#;
        let tracks: Vec<Track> = serde_json::from_str(json).unwrap();
        let kept = normalize_all(tracks);
        assert_eq!(kept.len(), 1);
        assert_eq!(kept[0].id, "ok");
    }

    #[test]
    fn test_same_title_ignores_case() {
        let t = Track::new("1", "Blue Monday");
        assert!(t.same_title("BLUE MONDAY"));
        assert!(!t.same_title("Blue Monday 88"));
    }

    #[test]
    fn test_playlist_body_keyed_by_id() {
        let json = r#"{"p1": {"name": "Mix", "songs": [{"id": "s", "title": "S"}], "created_at": "2024-01-01"}}"#;
        let map: std::collections::BTreeMap<String, PlaylistBody> =
            serde_json::from_str(json).unwrap();
        let playlists: Vec<Playlist> = map
            .into_iter()
            .map(|(id, body)| body.into_playlist(id))
            .collect();
        assert_eq!(playlists[0].id, "p1");
        assert_eq!(playlists[0].songs[0].uploader, DEFAULT_UPLOADER);
    }

    #[test]
    fn test_download_entry_as_track() {
        let entry = DownloadEntry {
            id: "dl".into(),
            title: "Song".into(),
            uploader: "".into(),
            thumbnail: "http://img".into(),
            filename: "song.mp3".into(),
            path: "/music/song.mp3".into(),
        };
        let track = entry.as_track();
        assert_eq!(track.id, "dl");
        assert_eq!(track.uploader, DEFAULT_UPLOADER);
        assert_eq!(track.thumbnail(), "http://img");
    }
}
