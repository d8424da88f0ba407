mod core;
mod downloads;
mod engine;
mod error;
mod http;
mod mpv;
mod preload;
mod queue;
mod remote;
mod service;
mod socket;
mod token;

#[cfg(test)]
mod testing;

use cadence_proto::config::Config;
use cadence_proto::model::ImportProgress;
use cadence_proto::state::{PersistentState, StateManager};
use std::sync::Arc;
use tokio::sync::{broadcast, mpsc};
use tracing::{info, warn};
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

#[derive(Debug, Clone)]
pub enum BroadcastMessage {
    StateUpdated,
    /// Outcome of a user action (download finished, playlist created, ...).
    Notice(String),
    DownloadProgress { track_id: String, percent: f32 },
    ImportProgress(ImportProgress),
    Log(String),
}

/// A custom tracing layer that forwards log messages to the broadcast channel
struct BroadcastLayer {
    sender: broadcast::Sender<BroadcastMessage>,
}

impl BroadcastLayer {
    fn new(sender: broadcast::Sender<BroadcastMessage>) -> Self {
        Self { sender }
    }
}

impl<S> tracing_subscriber::Layer<S> for BroadcastLayer
where
    S: tracing::Subscriber,
{
    fn on_event(
        &self,
        event: &tracing::Event<'_>,
        _ctx: tracing_subscriber::layer::Context<'_, S>,
    ) {
        // Only WARN and ERROR reach clients
        let level = event.metadata().level();
        if !matches!(*level, tracing::Level::WARN | tracing::Level::ERROR) {
            return;
        }

        let mut message = format!("{} [{}] ", chrono::Local::now().format("%H:%M:%S"), level);
        let mut visitor = MessageVisitor(&mut message);
        event.record(&mut visitor);

        // No receivers is fine
        let _ = self.sender.send(BroadcastMessage::Log(message));
    }
}

struct MessageVisitor<'a>(&'a mut String);

impl<'a> tracing::field::Visit for MessageVisitor<'a> {
    fn record_debug(&mut self, field: &tracing::field::Field, value: &dyn std::fmt::Debug) {
        if field.name() == "message" {
            self.0.push_str(&format!("{:?}", value));
        } else {
            self.0.push_str(&format!(" {}={:?}", field.name(), value));
        }
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Broadcast channel first so logging can use it
    let (broadcast_tx, _) = broadcast::channel::<BroadcastMessage>(256);

    let log_path = cadence_proto::platform::log_file();
    if let Some(parent) = log_path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    let log_file = std::fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(&log_path)?;

    let fmt_layer = tracing_subscriber::fmt::layer()
        .with_writer(log_file)
        .with_ansi(false);

    tracing_subscriber::registry()
        .with(fmt_layer)
        .with(BroadcastLayer::new(broadcast_tx.clone()))
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info,cadence_daemon=debug")),
        )
        .init();

    info!("Log file: {:?}", log_path);

    let config = Config::load()?;
    info!("Config loaded from: {:?}", Config::config_path());

    if let Err(e) = std::fs::write(&config.daemon.pid_file, std::process::id().to_string()) {
        warn!("Failed to write pid file {:?}: {}", config.daemon.pid_file, e);
    }

    let state_manager = Arc::new(StateManager::new(
        config.daemon.state_file.clone(),
        PersistentState {
            volume: config.mpv.default_volume,
            autoplay: config.playback.autoplay,
        },
    ));
    let volume = state_manager.get_state().await.volume;

    let service = Arc::new(remote::RemoteService::new(&config.service)?);
    info!("Media service at {}", config.service.base_url);

    // All inputs funnel into PlayerCore
    let (event_tx, event_rx) = mpsc::channel::<core::CoreEvent>(256);

    // Engine signals are forwarded into the same loop
    let (engine_tx, mut engine_rx) = mpsc::channel::<engine::EngineEvent>(256);
    let forward_tx = event_tx.clone();
    tokio::spawn(async move {
        while let Some(signal) = engine_rx.recv().await {
            if forward_tx.send(core::CoreEvent::Engine(signal)).await.is_err() {
                break;
            }
        }
    });
    let engine = mpv::MpvEngine::new(engine_tx, volume);

    let player_core = core::PlayerCore::new(
        config.playback.clone(),
        service,
        Box::new(engine),
        state_manager,
        broadcast_tx.clone(),
        event_tx.clone(),
    )
    .await;

    let state_manager = player_core.state_manager();

    let _socket_handle = socket::start_server(
        config.http.bind_address.clone(),
        cadence_proto::platform::DAEMON_TCP_PORT,
        state_manager.clone(),
        event_tx.clone(),
        broadcast_tx.clone(),
    );

    if config.http.enabled {
        let _http_handle = http::start_server(
            config.http.bind_address.clone(),
            config.http.port,
            state_manager.clone(),
            event_tx.clone(),
        );
    }

    info!("Daemon initialised, running event loop");
    player_core.run(event_rx).await?;

    Ok(())
}
