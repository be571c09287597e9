//! LAN presence beacon.
//!
//! Every node broadcasts `{nodeId, port}` as a UDP datagram to the local
//! network every 5 s and listens for the same from others. A received beacon
//! only ever *schedules a connect attempt*; all real protocol runs over the
//! TCP mesh. The socket is configured with address reuse so several nodes on
//! one machine can share the discovery port, and broadcast so datagrams
//! reach the whole segment.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use socket2::{Domain, Protocol, Socket, Type};
use tokio::net::UdpSocket;
use tokio::sync::RwLock;
use tracing::{debug, info, warn};

use crate::error::Result;
use crate::mesh::{normalize_host, MeshService, MeshState};

/// The well-known discovery port.
pub const DISCOVERY_PORT: u16 = 41234;
/// Beacon emission interval.
pub const BEACON_INTERVAL: Duration = Duration::from_secs(5);
/// LAN broadcast address the beacon targets.
const BROADCAST_ADDR: &str = "255.255.255.255";

/// The beacon datagram. Everything else stays on the TCP plane.
#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct Beacon {
    node_id: String,
    port: u16,
}

/// The discovery service: periodic announcements plus beacon ingestion.
pub struct DiscoveryBeacon {
    node_id: String,
    listen_port: u16,
    state: Arc<RwLock<MeshState>>,
    mesh: Arc<MeshService>,
}

impl DiscoveryBeacon {
    pub fn new(
        node_id: &str,
        listen_port: u16,
        state: Arc<RwLock<MeshState>>,
        mesh: Arc<MeshService>,
    ) -> Self {
        Self {
            node_id: node_id.to_string(),
            listen_port,
            state,
            mesh,
        }
    }

    /// Run the beacon until the process exits. Never fatal: if the discovery
    /// port is taken we fall back to announce-only on an ephemeral port.
    pub async fn run(self) -> Result<()> {
        let socket = match bind_discovery_socket(DISCOVERY_PORT) {
            Ok(socket) => {
                info!("Discovery beacon on UDP {}", DISCOVERY_PORT);
                socket
            }
            Err(e) => {
                warn!(
                    "Could not bind UDP {} ({}); beacon is announce-only",
                    DISCOVERY_PORT, e
                );
                bind_discovery_socket(0)?
            }
        };

        let payload = serde_json::to_vec(&Beacon {
            node_id: self.node_id.clone(),
            port: self.listen_port,
        })?;
        let target = format!("{}:{}", BROADCAST_ADDR, DISCOVERY_PORT);

        let mut interval = tokio::time::interval(BEACON_INTERVAL);
        let mut buf = [0u8; 2048];
        loop {
            tokio::select! {
                _ = interval.tick() => {
                    if let Err(e) = socket.send_to(&payload, &target).await {
                        debug!("Beacon send failed: {}", e);
                    }
                }
                received = socket.recv_from(&mut buf) => {
                    match received {
                        Ok((len, src)) => self.ingest(&buf[..len], src).await,
                        Err(e) => warn!("Beacon recv error: {}", e),
                    }
                }
            }
        }
    }

    /// Handle one received beacon: filter, then hand the address to the mesh.
    async fn ingest(&self, bytes: &[u8], src: SocketAddr) {
        let beacon: Beacon = match serde_json::from_slice(bytes) {
            Ok(beacon) => beacon,
            Err(e) => {
                debug!("Malformed beacon from {}: {}", src, e);
                return;
            }
        };

        // Our own broadcast loops back; drop it.
        if beacon.node_id == self.node_id {
            return;
        }

        let host = normalize_host(src.ip());
        {
            let state = self.state.read().await;
            // Anyone already in the address book is reached through the mesh,
            // not through the beacon.
            if state.knows_address(&host, beacon.port) {
                return;
            }
            if state.connecting.contains(&format!("{}:{}", host, beacon.port)) {
                return;
            }
        }

        info!(
            "Discovered {} at {}:{} via beacon",
            beacon.node_id, host, beacon.port
        );
        self.mesh.schedule_connect(host, beacon.port);
    }
}

/// Bind the discovery socket with address reuse and broadcast enabled, then
/// hand it to tokio.
fn bind_discovery_socket(port: u16) -> Result<UdpSocket> {
    let socket = Socket::new(Domain::IPV4, Type::DGRAM, Some(Protocol::UDP))?;
    socket.set_reuse_address(true)?;
    socket.set_broadcast(true)?;
    let addr = SocketAddr::from(([0, 0, 0, 0], port));
    socket.bind(&addr.into())?;
    socket.set_nonblocking(true)?;

    let std_socket: std::net::UdpSocket = socket.into();
    Ok(UdpSocket::from_std(std_socket)?)
}
