//! Observer plane: status fan-out for GUI clients.
//!
//! An observer is just another inbound link that opened with
//! `HANDSHAKE{isGUI: true}`. It gets its own broadcast channel - mirrored
//! round events plus a 2 s status snapshot - and may issue `COMMAND` frames
//! that run through the CLI grammar. Observers never appear in the address
//! book and never count toward the active node count; a failed send evicts
//! the observer and nothing else.

use std::sync::Arc;
use std::time::Duration;

use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::sync::{broadcast, RwLock};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use votemesh_protocol::{decode_frame, DecodedFrame, Frame};

use crate::mesh::{send_frame, MeshService, MeshState, Outbound};
use crate::round::RoundEngine;

/// Interval between status snapshots.
pub const STATUS_INTERVAL: Duration = Duration::from_secs(2);

/// Drive one observer link until it disconnects or a send fails.
pub(crate) async fn observer_loop(
    mesh: Arc<MeshService>,
    client_id: String,
    mut reader: BufReader<OwnedReadHalf>,
    mut writer: OwnedWriteHalf,
) {
    {
        let mut state = mesh.state.write().await;
        state.observers += 1;
    }
    info!("Observer {} attached", client_id);

    let mut rx = mesh.outbound.subscribe_observers();
    let mut line = String::new();
    loop {
        line.clear();
        tokio::select! {
            read = reader.read_line(&mut line) => {
                match read {
                    Ok(0) => {
                        info!("Observer {} disconnected", client_id);
                        break;
                    }
                    Ok(_) => match decode_frame(&line) {
                        DecodedFrame::Frame(Frame::Command { command, args }) => {
                            let response = mesh.commander.execute_observer(&command, &args).await;
                            let reply = Frame::CommandResponse { response };
                            if send_frame(&mut writer, &reply).await.is_err() {
                                break;
                            }
                        }
                        DecodedFrame::Frame(other) => {
                            debug!(
                                "Ignoring {} frame from observer {}",
                                other.tag(),
                                client_id
                            );
                        }
                        DecodedFrame::Unknown { tag } => {
                            debug!("Unknown frame type {} from observer {}", tag, client_id);
                        }
                        DecodedFrame::Malformed { error } => {
                            debug!("Malformed frame from observer {}: {}", client_id, error);
                        }
                    },
                    Err(e) => {
                        warn!("Observer {} read error: {}", client_id, e);
                        break;
                    }
                }
            }
            event = rx.recv() => {
                match event {
                    Ok(frame) => {
                        if send_frame(&mut writer, &frame).await.is_err() {
                            info!("Observer {} evicted on send failure", client_id);
                            break;
                        }
                    }
                    Err(broadcast::error::RecvError::Lagged(missed)) => {
                        debug!("Observer {} lagged, {} events dropped", client_id, missed);
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
        }
    }

    let mut state = mesh.state.write().await;
    state.observers = state.observers.saturating_sub(1);
}

/// Emit a `STATUS_UPDATE` snapshot to observers every 2 s.
pub fn spawn_status_stream(
    node_id: String,
    mesh_state: Arc<RwLock<MeshState>>,
    engine: Arc<RoundEngine>,
    outbound: Outbound,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(STATUS_INTERVAL);
        loop {
            interval.tick().await;

            let (peers, peers_list) = {
                let state = mesh_state.read().await;
                (state.active_node_count() - 1, state.active_peer_ids())
            };
            let status = engine.status().await;

            outbound.notify_observers(Frame::StatusUpdate {
                node_id: node_id.clone(),
                peers,
                peers_list,
                round_topic: status.as_ref().map(|s| s.topic.clone()),
                phase: status.as_ref().map(|s| s.phase),
                time_remaining: status.as_ref().map(|s| s.time_remaining_secs),
                encrypted_votes: status.as_ref().map(|s| s.encrypted_votes).unwrap_or(0),
                decrypted_votes: status.as_ref().map(|s| s.decrypted_votes).unwrap_or(0),
            });
        }
    })
}
