use serde::{Deserialize, Serialize};

use crate::model::{DownloadEntry, ImportProgress, Playlist, Track};

/// Current protocol version.  Bump this when the wire format changes in a
/// breaking way.  Clients check this on connect and can refuse to talk to an
/// incompatible daemon.
pub const PROTOCOL_VERSION: u32 = 1;

/// Intents sent from a client to the daemon.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "cmd")]
pub enum Command {
    // ── Search queue ─────────────────────────────────────────────────────────
    Search { query: String },
    PlayIndex { index: usize },
    Next,
    Prev,
    RemoveFromQueue { index: usize },
    /// Append a track behind the rest of the up-next queue.
    AddToQueue { track: Track },
    LoadMoreRelated,

    // ── Transport ────────────────────────────────────────────────────────────
    TogglePause,
    Stop,
    Volume { value: f32 },
    /// Pointer moved over the seek bar; fraction of the duration.
    SeekPreview { fraction: f64 },
    /// Pointer released; the engine seeks.
    SeekCommit { fraction: f64 },
    SetAutoplay { enabled: bool },

    // ── Downloads ────────────────────────────────────────────────────────────
    /// `None` downloads the current track.
    Download { track_id: Option<String> },
    DismissDownload { track_id: String },
    RefreshDownloads,
    PlayDownload { index: usize },
    DeleteDownload { track_id: String },

    // ── Playlists ────────────────────────────────────────────────────────────
    RefreshPlaylists,
    CreatePlaylist { name: String },
    DeletePlaylist { playlist_id: String },
    /// `None` adds the current track.
    AddToPlaylist { playlist_id: String, track: Option<Track> },
    RemoveFromPlaylist { playlist_id: String, track_id: String },
    PlayPlaylist { playlist_id: String, index: usize },
    ImportPlaylist { name: Option<String>, url: String },

    // ── Recommendations ──────────────────────────────────────────────────────
    LoadRecommendations { more: bool },
    PlayRecommendation { track_id: String },

    GetState,
}

/// Messages sent from the daemon to clients.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "broadcast")]
pub enum Broadcast {
    /// Sent immediately on connect: daemon version + full state snapshot.
    Hello {
        protocol_version: u32,
        daemon_rev: u64,
        state: PlayerState,
    },
    State {
        data: PlayerState,
    },
    /// Outcome of an explicit user action that the user should see.
    Notice {
        message: String,
    },
    DownloadProgress {
        track_id: String,
        percent: f32,
    },
    ImportProgress {
        progress: ImportProgress,
    },
    Log {
        message: String,
    },
    Error {
        message: String,
    },
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
pub enum PlaybackStatus {
    #[default]
    Idle, // nothing loaded / track ended / stopped
    Loading, // stream being resolved or handed to the engine
    Playing,
    Paused,
    Error, // resolution or playback start failed
}

/// Which list drives track-end progression.  Exactly one is active.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
pub enum PlaybackMode {
    #[default]
    SearchQueue,
    Playlist,
    DownloadedLibrary,
}

/// Health of the playback engine process as observed by the daemon.
///
/// Transitions:
///   Absent -> Starting -> Running -> Dead -> Starting ...
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
pub enum EngineHealth {
    /// Engine process does not exist yet (before first use).
    #[default]
    Absent,
    Starting,
    Running,
    /// Process exited or IPC closed.
    Dead,
}

impl EngineHealth {
    pub fn is_unhealthy(&self) -> bool {
        matches!(self, EngineHealth::Dead)
    }
}

/// What the now-playing area shows.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
#[serde(tag = "kind")]
pub enum Display {
    #[default]
    Empty,
    /// Placeholder while the stream resolves.
    Loading { track: Track },
    Track { track: Track },
    Error { track: Option<Track>, message: String },
}

impl Display {
    pub fn track(&self) -> Option<&Track> {
        match self {
            Display::Loading { track } | Display::Track { track } => Some(track),
            Display::Error { track, .. } => track.as_ref(),
            Display::Empty => None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ActiveDownload {
    pub track_id: String,
    pub percent: f32,
}

/// Full state of the daemon.  `rev` is a monotonically increasing counter
/// incremented every time the state changes.  Clients can use it to detect
/// missed updates and request a resync.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct PlayerState {
    #[serde(default)]
    pub rev: u64,

    pub queue: Vec<Track>,
    /// Index into `queue`; `None` when nothing is selected.
    pub position: Option<usize>,
    pub mode: PlaybackMode,
    /// Up-next panel is only meaningful for the search queue.
    pub queue_visible: bool,

    pub status: PlaybackStatus,
    pub display: Display,
    pub volume: f32,
    pub autoplay: bool,
    pub time_pos_secs: Option<f64>,
    pub duration_secs: Option<f64>,
    /// Seek bar position while the pointer is held down.
    #[serde(default)]
    pub seek_preview_secs: Option<f64>,
    #[serde(default)]
    pub engine_health: EngineHealth,
    #[serde(default)]
    pub is_paused: bool,

    #[serde(default)]
    pub searching: bool,
    #[serde(default)]
    pub loading_related: bool,

    #[serde(default)]
    pub downloads: Vec<DownloadEntry>,
    pub current_download: Option<usize>,
    #[serde(default)]
    pub active_downloads: Vec<ActiveDownload>,

    #[serde(default)]
    pub playlists: Vec<Playlist>,
    pub open_playlist: Option<String>,

    #[serde(default)]
    pub recommendations: Vec<Track>,

    pub import: Option<ImportProgress>,
}

impl PlayerState {
    pub fn current_track(&self) -> Option<&Track> {
        self.display.track()
    }
}

/// Wrapper for socket communication
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Message {
    Command(Command),
    Broadcast(Broadcast),
}

impl Message {
    pub fn encode(&self) -> anyhow::Result<Vec<u8>> {
        let json = serde_json::to_vec(self)?;
        let len = json.len() as u32;
        let mut result = Vec::with_capacity(4 + json.len());
        result.extend_from_slice(&len.to_be_bytes());
        result.extend_from_slice(&json);
        Ok(result)
    }

    pub fn decode(data: &[u8]) -> anyhow::Result<(Self, usize)> {
        if data.len() < 4 {
            anyhow::bail!("Insufficient data for length header");
        }
        let len = u32::from_be_bytes([data[0], data[1], data[2], data[3]]) as usize;
        if data.len() < 4 + len {
            anyhow::bail!("Insufficient data for message");
        }
        let msg: Self = serde_json::from_slice(&data[4..4 + len])?;
        Ok((msg, 4 + len))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_command_frame() {
        let msg = Message::Command(Command::PlayPlaylist {
            playlist_id: "p9".into(),
            index: 3,
        });
        let encoded = msg.encode().unwrap();
        let (decoded, len) = Message::decode(&encoded).unwrap();
        assert_eq!(len, encoded.len());
        match decoded {
            Message::Command(Command::PlayPlaylist { playlist_id, index }) => {
                assert_eq!(playlist_id, "p9");
                assert_eq!(index, 3);
            }
            other => panic!("Wrong message type: {:?}", other),
        }
    }

    #[test]
    fn test_unit_command_is_not_mistaken_for_broadcast() {
        let encoded = Message::Command(Command::GetState).encode().unwrap();
        let (decoded, _) = Message::decode(&encoded).unwrap();
        assert!(matches!(decoded, Message::Command(Command::GetState)));
    }

    #[test]
    fn test_hello_carries_state() {
        let state = PlayerState {
            rev: 42,
            queue: vec![Track::new("a", "A")],
            position: Some(0),
            display: Display::Track {
                track: Track::new("a", "A"),
            },
            ..Default::default()
        };
        let msg = Message::Broadcast(Broadcast::Hello {
            protocol_version: PROTOCOL_VERSION,
            daemon_rev: 42,
            state,
        });
        let encoded = msg.encode().unwrap();
        let (decoded, _) = Message::decode(&encoded).unwrap();
        match decoded {
            Message::Broadcast(Broadcast::Hello {
                protocol_version,
                daemon_rev,
                state,
            }) => {
                assert_eq!(protocol_version, PROTOCOL_VERSION);
                assert_eq!(daemon_rev, 42);
                assert_eq!(state.current_track().map(|t| t.id.as_str()), Some("a"));
            }
            other => panic!("Wrong message type: {:?}", other),
        }
    }

    #[test]
    fn test_partial_frame_is_rejected() {
        let encoded = Message::Command(Command::Next).encode().unwrap();
        assert!(Message::decode(&encoded[..2]).is_err());
        assert!(Message::decode(&encoded[..encoded.len() - 1]).is_err());
    }
}
