use crate::core::CoreEvent;
use crate::BroadcastMessage;
use cadence_proto::protocol::{Broadcast, Command, Message, PROTOCOL_VERSION};
use cadence_proto::state::StateManager;
use std::sync::Arc;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{broadcast, mpsc};
use tracing::{debug, error, info, warn};

pub fn start_server(
    bind_address: String,
    port: u16,
    state_manager: Arc<StateManager>,
    event_tx: mpsc::Sender<CoreEvent>,
    broadcast_tx: broadcast::Sender<BroadcastMessage>,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let addr = format!("{}:{}", bind_address, port);

        let listener = match TcpListener::bind(&addr).await {
            Ok(l) => l,
            Err(e) => {
                error!("Failed to bind TCP socket {}: {}", addr, e);
                return;
            }
        };

        info!("TCP server listening at {}", addr);

        let mut client_id = 0usize;

        loop {
            match listener.accept().await {
                Ok((stream, peer)) => {
                    client_id += 1;
                    let id = client_id;
                    info!("Client {} connected from {}", id, peer);

                    let sm = state_manager.clone();
                    let evt_tx = event_tx.clone();
                    let bcast_rx = broadcast_tx.subscribe();

                    tokio::spawn(async move {
                        handle_client(stream, sm, id, evt_tx, bcast_rx).await;
                        info!("Client {} disconnected", id);
                    });
                }
                Err(e) => {
                    error!("Failed to accept connection: {}", e);
                }
            }
        }
    })
}

async fn handle_client(
    stream: TcpStream,
    state_manager: Arc<StateManager>,
    client_id: usize,
    event_tx: mpsc::Sender<CoreEvent>,
    mut broadcast_rx: broadcast::Receiver<BroadcastMessage>,
) {
    let (mut read_half, mut write_half) = stream.into_split();
    let mut tmp = [0u8; 4096];
    let mut read_buf: Vec<u8> = Vec::new();

    // Hello carries the full snapshot so clients start in sync
    if let Ok(encoded) = encode_hello(&state_manager).await {
        if write_half.write_all(&encoded).await.is_err() {
            return;
        }
    }

    loop {
        tokio::select! {
            result = read_half.read(&mut tmp) => {
                match result {
                    Ok(0) => {
                        info!("Client {} closed connection", client_id);
                        break;
                    }
                    Ok(n) => {
                        read_buf.extend_from_slice(&tmp[..n]);

                        loop {
                            if read_buf.len() < 4 { break; }
                            match Message::decode(&read_buf) {
                                Ok((Message::Command(cmd), consumed)) => {
                                    read_buf.drain(..consumed);
                                    debug!("Client {} sent command: {:?}", client_id, cmd);

                                    // GetState is answered here; everything else goes to the core
                                    if cmd != Command::GetState
                                        && event_tx.send(CoreEvent::ClientCommand(cmd)).await.is_err()
                                    {
                                        warn!("CoreEvent channel closed");
                                        return;
                                    }

                                    if let Ok(encoded) = encode_state(&state_manager).await {
                                        if write_half.write_all(&encoded).await.is_err() {
                                            return;
                                        }
                                    }
                                }
                                Ok((_, consumed)) => {
                                    read_buf.drain(..consumed);
                                }
                                Err(_) => break,
                            }
                        }
                    }
                    Err(e) => {
                        error!("Read error from client {}: {}", client_id, e);
                        break;
                    }
                }
            }

            msg = broadcast_rx.recv() => {
                let encoded = match msg {
                    Ok(BroadcastMessage::StateUpdated) => encode_state(&state_manager).await,
                    Ok(BroadcastMessage::Notice(message)) => {
                        Message::Broadcast(Broadcast::Notice { message }).encode()
                    }
                    Ok(BroadcastMessage::DownloadProgress { track_id, percent }) => {
                        Message::Broadcast(Broadcast::DownloadProgress { track_id, percent }).encode()
                    }
                    Ok(BroadcastMessage::ImportProgress(progress)) => {
                        Message::Broadcast(Broadcast::ImportProgress { progress }).encode()
                    }
                    Ok(BroadcastMessage::Log(message)) => {
                        Message::Broadcast(Broadcast::Log { message }).encode()
                    }
                    Err(broadcast::error::RecvError::Lagged(n)) => {
                        warn!("Client {} missed {} broadcast messages", client_id, n);
                        encode_state(&state_manager).await
                    }
                    Err(_) => break,
                };
                if let Ok(encoded) = encoded {
                    if write_half.write_all(&encoded).await.is_err() {
                        break;
                    }
                }
            }
        }
    }
}

async fn encode_hello(state_manager: &StateManager) -> anyhow::Result<Vec<u8>> {
    let state = state_manager.get_state().await;
    let rev = state.rev;
    Message::Broadcast(Broadcast::Hello {
        protocol_version: PROTOCOL_VERSION,
        daemon_rev: rev,
        state,
    })
    .encode()
}

async fn encode_state(state_manager: &StateManager) -> anyhow::Result<Vec<u8>> {
    let state = state_manager.get_state().await;
    Message::Broadcast(Broadcast::State { data: state }).encode()
}
