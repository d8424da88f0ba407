use anyhow::{bail, Context};
use cadence_proto::model::Track;
use cadence_proto::platform;
use cadence_proto::protocol::{Broadcast, Command, Message, PlaybackStatus, PlayerState};
use cadence_proto::model::DEFAULT_THUMBNAIL;
use cadence_proto::timeline::{format_time, pointer_fraction};
use clap::{Parser, Subcommand};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::time::{timeout, Duration};

/// Command-line remote for the cadence daemon
#[derive(Parser, Debug)]
#[command(name = "cadence-ctl", version, about)]
struct Args {
    /// Daemon address (default: 127.0.0.1:9877)
    #[arg(long)]
    address: Option<String>,

    /// Print raw state snapshots as JSON
    #[arg(long)]
    json: bool,

    #[command(subcommand)]
    command: Cmd,
}

#[derive(Subcommand, Debug)]
enum Cmd {
    /// Show what is playing and the up-next queue
    Status,
    /// Follow state changes and notices until interrupted
    Watch,
    /// Search and play the first result
    Search { query: Vec<String> },
    /// Play a queue entry
    Play { index: usize },
    Next,
    Prev,
    /// Toggle pause
    Pause,
    Stop,
    /// Set volume in percent (0-100)
    Volume { percent: u8 },
    /// Seek to a fraction of the track (0.0-1.0), or to a point on a bar
    /// of `--width` cells with `--at`
    Seek {
        #[arg(required_unless_present = "at")]
        fraction: Option<f64>,
        #[arg(long, requires = "width")]
        at: Option<f64>,
        #[arg(long)]
        width: Option<f64>,
    },
    /// Remove a queue entry
    Remove { index: usize },
    /// Append a track the daemon already knows (queue, playlists,
    /// recommendations, downloads) to the up-next queue
    Enqueue { track_id: String },
    /// Turn autoplay on or off
    Autoplay { mode: String },
    /// Fetch more related tracks
    More,
    /// Download a track (default: the current one)
    Download { track_id: Option<String> },
    /// List downloaded tracks
    Downloads,
    DeleteDownload { track_id: String },
    PlayDownload { index: usize },
    /// List playlists
    Playlists,
    CreatePlaylist { name: String },
    DeletePlaylist { playlist_id: String },
    /// Add a track to a playlist (default: the current one)
    AddToPlaylist { playlist_id: String },
    RemoveFromPlaylist { playlist_id: String, track_id: String },
    PlayPlaylist {
        playlist_id: String,
        #[arg(default_value_t = 0)]
        index: usize,
    },
    /// Import a playlist from a URL
    Import {
        url: String,
        #[arg(long)]
        name: Option<String>,
    },
    /// Show recommendations; `--more` fetches additional ones
    Recommend {
        #[arg(long)]
        more: bool,
    },
    PlayRecommendation { track_id: String },
}

impl Cmd {
    fn to_command(&self) -> anyhow::Result<Option<Command>> {
        let cmd = match self {
            // Enqueue needs the daemon's state to find the track
            Cmd::Status | Cmd::Watch | Cmd::Enqueue { .. } => return Ok(None),
            Cmd::Search { query } => {
                let query = query.join(" ");
                if query.trim().is_empty() {
                    bail!("search query cannot be empty");
                }
                Command::Search { query }
            }
            Cmd::Play { index } => Command::PlayIndex { index: *index },
            Cmd::Next => Command::Next,
            Cmd::Prev => Command::Prev,
            Cmd::Pause => Command::TogglePause,
            Cmd::Stop => Command::Stop,
            Cmd::Volume { percent } => Command::Volume {
                value: f32::from((*percent).min(100)) / 100.0,
            },
            Cmd::Seek {
                fraction,
                at,
                width,
            } => {
                let fraction = match (at, width, fraction) {
                    (Some(at), Some(width), _) => pointer_fraction(*at, *width),
                    (_, _, Some(fraction)) => fraction.clamp(0.0, 1.0),
                    _ => bail!("seek needs a fraction or --at with --width"),
                };
                Command::SeekCommit { fraction }
            }
            Cmd::Remove { index } => Command::RemoveFromQueue { index: *index },
            Cmd::Autoplay { mode } => Command::SetAutoplay {
                enabled: match mode.as_str() {
                    "on" => true,
                    "off" => false,
                    other => bail!("autoplay mode must be 'on' or 'off', got '{}'", other),
                },
            },
            Cmd::More => Command::LoadMoreRelated,
            Cmd::Download { track_id } => Command::Download {
                track_id: track_id.clone(),
            },
            Cmd::Downloads => Command::RefreshDownloads,
            Cmd::DeleteDownload { track_id } => Command::DeleteDownload {
                track_id: track_id.clone(),
            },
            Cmd::PlayDownload { index } => Command::PlayDownload { index: *index },
            Cmd::Playlists => Command::RefreshPlaylists,
            Cmd::CreatePlaylist { name } => Command::CreatePlaylist { name: name.clone() },
            Cmd::DeletePlaylist { playlist_id } => Command::DeletePlaylist {
                playlist_id: playlist_id.clone(),
            },
            Cmd::AddToPlaylist { playlist_id } => Command::AddToPlaylist {
                playlist_id: playlist_id.clone(),
                track: None,
            },
            Cmd::RemoveFromPlaylist {
                playlist_id,
                track_id,
            } => Command::RemoveFromPlaylist {
                playlist_id: playlist_id.clone(),
                track_id: track_id.clone(),
            },
            Cmd::PlayPlaylist { playlist_id, index } => Command::PlayPlaylist {
                playlist_id: playlist_id.clone(),
                index: *index,
            },
            Cmd::Import { url, name } => Command::ImportPlaylist {
                name: name.clone(),
                url: url.clone(),
            },
            Cmd::Recommend { more } => Command::LoadRecommendations { more: *more },
            Cmd::PlayRecommendation { track_id } => Command::PlayRecommendation {
                track_id: track_id.clone(),
            },
        };
        Ok(Some(cmd))
    }
}

/// Look up a track by id among everything the snapshot carries.
fn find_track(state: &PlayerState, track_id: &str) -> anyhow::Result<Track> {
    state
        .queue
        .iter()
        .chain(state.recommendations.iter())
        .chain(state.playlists.iter().flat_map(|p| p.songs.iter()))
        .find(|t| t.id == track_id)
        .cloned()
        .or_else(|| {
            state
                .downloads
                .iter()
                .find(|d| d.id == track_id)
                .map(|d| d.as_track())
        })
        .with_context(|| format!("track {} is not known to the daemon", track_id))
}

// ── connection ────────────────────────────────────────────────────────────────

struct Connection {
    stream: TcpStream,
    read_buf: Vec<u8>,
}

impl Connection {
    async fn open(address: &str) -> anyhow::Result<(Self, PlayerState)> {
        let stream = TcpStream::connect(address)
            .await
            .with_context(|| format!("cannot reach daemon at {}", address))?;
        let mut conn = Self {
            stream,
            read_buf: Vec::new(),
        };
        match conn.next_broadcast().await? {
            Broadcast::Hello { state, .. } => Ok((conn, state)),
            other => bail!("expected hello from daemon, got {:?}", other),
        }
    }

    async fn send(&mut self, cmd: Command) -> anyhow::Result<()> {
        let encoded = Message::Command(cmd).encode()?;
        self.stream.write_all(&encoded).await?;
        Ok(())
    }

    async fn next_broadcast(&mut self) -> anyhow::Result<Broadcast> {
        let mut tmp = [0u8; 4096];
        loop {
            if self.read_buf.len() >= 4 {
                if let Ok((msg, consumed)) = Message::decode(&self.read_buf) {
                    self.read_buf.drain(..consumed);
                    if let Message::Broadcast(b) = msg {
                        return Ok(b);
                    }
                    continue;
                }
            }
            let n = self.stream.read(&mut tmp).await?;
            if n == 0 {
                bail!("daemon closed the connection");
            }
            self.read_buf.extend_from_slice(&tmp[..n]);
        }
    }
}

// ── output ────────────────────────────────────────────────────────────────────

fn track_line(track: &Track) -> String {
    format!(
        "{} - {} [{}]",
        track.title,
        track.uploader,
        format_time(track.duration)
    )
}

fn print_state(state: &PlayerState, json: bool) {
    if json {
        match serde_json::to_string(state) {
            Ok(text) => println!("{}", text),
            Err(e) => eprintln!("cannot encode state: {}", e),
        }
        return;
    }

    let status = match state.status {
        PlaybackStatus::Idle => "idle",
        PlaybackStatus::Loading => "loading",
        PlaybackStatus::Playing => "playing",
        PlaybackStatus::Paused => "paused",
        PlaybackStatus::Error => "error",
    };
    match state.current_track() {
        Some(track) => println!(
            "{}: {}  {} / {}",
            status,
            track_line(track),
            format_time(state.time_pos_secs),
            format_time(state.duration_secs)
        ),
        None => println!("{}", status),
    }
    if let Some(track) = state.current_track() {
        let art = track.thumbnail();
        if art != DEFAULT_THUMBNAIL {
            println!("  art: {}", art);
        }
    }
    if let cadence_proto::protocol::Display::Error { message, .. } = &state.display {
        println!("  error: {}", message);
    }
    println!(
        "mode: {:?}  volume: {}%  autoplay: {}",
        state.mode,
        (state.volume * 100.0).round(),
        if state.autoplay { "on" } else { "off" }
    );

    if state.queue_visible && !state.queue.is_empty() {
        println!("queue:");
        for (i, track) in state.queue.iter().enumerate() {
            let marker = if state.position == Some(i) { ">" } else { " " };
            println!("{} {:>2}. {}", marker, i, track_line(track));
        }
    }
    for d in &state.active_downloads {
        println!("downloading {}: {:.0}%", d.track_id, d.percent);
    }
}

fn print_listing(cmd: &Cmd, state: &PlayerState) {
    match cmd {
        Cmd::Downloads => {
            for (i, d) in state.downloads.iter().enumerate() {
                let marker = if state.current_download == Some(i) { ">" } else { " " };
                println!("{} {:>2}. {} - {} ({})", marker, i, d.title, d.uploader, d.id);
            }
        }
        Cmd::Playlists => {
            for p in &state.playlists {
                println!("{}  {} ({} songs)", p.id, p.name, p.songs.len());
            }
        }
        Cmd::Recommend { .. } => {
            for t in &state.recommendations {
                println!("{}  {}", t.id, track_line(t));
            }
        }
        _ => {}
    }
}

/// Print whatever the daemon reports within `window`; returns the last state.
async fn collect(
    conn: &mut Connection,
    mut state: PlayerState,
    window: Duration,
) -> anyhow::Result<PlayerState> {
    while let Ok(msg) = timeout(window, conn.next_broadcast()).await {
        match msg? {
            Broadcast::State { data } => state = data,
            Broadcast::Notice { message } => println!("{}", message),
            Broadcast::Error { message } => eprintln!("error: {}", message),
            _ => {}
        }
    }
    Ok(state)
}

async fn watch(conn: &mut Connection, json: bool) -> anyhow::Result<()> {
    let mut last_rev = 0;
    loop {
        match conn.next_broadcast().await? {
            Broadcast::State { data } if data.rev != last_rev => {
                last_rev = data.rev;
                print_state(&data, json);
            }
            Broadcast::Notice { message } => println!("* {}", message),
            Broadcast::DownloadProgress { track_id, percent } => {
                println!("* {}: {:.0}%", track_id, percent)
            }
            Broadcast::ImportProgress { progress } => println!(
                "* import {:.0}% of {} songs",
                progress.progress, progress.total_songs
            ),
            Broadcast::Log { message } | Broadcast::Error { message } => eprintln!("{}", message),
            _ => {}
        }
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();
    let address = args
        .address
        .clone()
        .unwrap_or_else(platform::daemon_address);

    let command = args.command.to_command()?;
    let (mut conn, state) = Connection::open(&address).await?;
    let command = match &args.command {
        Cmd::Enqueue { track_id } => Some(Command::AddToQueue {
            track: find_track(&state, track_id)?,
        }),
        _ => command,
    };

    match (&args.command, command) {
        (Cmd::Watch, _) => {
            print_state(&state, args.json);
            watch(&mut conn, args.json).await
        }
        (_, None) => {
            print_state(&state, args.json);
            Ok(())
        }
        (cmd, Some(command)) => {
            conn.send(command).await?;
            let state = collect(&mut conn, state, Duration::from_millis(750)).await?;
            print_listing(cmd, &state);
            if !matches!(cmd, Cmd::Downloads | Cmd::Playlists | Cmd::Recommend { .. }) {
                print_state(&state, args.json);
            }
            Ok(())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_volume_percent_maps_to_fraction() {
        let cmd = Cmd::Volume { percent: 250 }.to_command().unwrap();
        assert_eq!(cmd, Some(Command::Volume { value: 1.0 }));
    }

    #[test]
    fn test_search_words_are_joined() {
        let cmd = Cmd::Search {
            query: vec!["daft".into(), "punk".into()],
        }
        .to_command()
        .unwrap();
        assert_eq!(
            cmd,
            Some(Command::Search {
                query: "daft punk".to_string()
            })
        );
    }

    #[test]
    fn test_bad_autoplay_mode_is_rejected() {
        assert!(Cmd::Autoplay {
            mode: "maybe".into()
        }
        .to_command()
        .is_err());
    }

    #[test]
    fn test_seek_from_bar_position() {
        let args =
            Args::try_parse_from(["cadence-ctl", "seek", "--at", "30", "--width", "120"]).unwrap();
        let cmd = args.command.to_command().unwrap();
        assert_eq!(cmd, Some(Command::SeekCommit { fraction: 0.25 }));

        let args = Args::try_parse_from(["cadence-ctl", "seek", "0.5"]).unwrap();
        let cmd = args.command.to_command().unwrap();
        assert_eq!(cmd, Some(Command::SeekCommit { fraction: 0.5 }));

        assert!(Args::try_parse_from(["cadence-ctl", "seek"]).is_err());
    }

    #[test]
    fn test_enqueue_finds_known_tracks() {
        let mut state = PlayerState::default();
        state.recommendations = vec![Track::new("r1", "Rec")];
        state.downloads = vec![cadence_proto::model::DownloadEntry {
            id: "d1".into(),
            title: "Local".into(),
            uploader: "Someone".into(),
            thumbnail: String::new(),
            filename: "d1.mp3".into(),
            path: "/music/d1.mp3".into(),
        }];
        assert_eq!(find_track(&state, "r1").unwrap().title, "Rec");
        assert_eq!(find_track(&state, "d1").unwrap().title, "Local");
        assert!(find_track(&state, "nope").is_err());
    }

    #[test]
    fn test_args_parse() {
        let args = Args::try_parse_from(["cadence-ctl", "play-playlist", "p1", "3"]).unwrap();
        assert!(matches!(
            args.command,
            Cmd::PlayPlaylist { ref playlist_id, index: 3 } if playlist_id == "p1"
        ));
    }
}
