//! Peer mesh: links, handshake, gossip, heartbeat, duplicate detection.
//!
//! Every node keeps one TCP listener and a set of peer links, each link a
//! spawned task owning its socket halves. Frames are JSON, one object per
//! line. Broadcast fans out through a `tokio::sync::broadcast` channel that
//! every voting link forwards; observers get their own channel so they never
//! see mesh-plane traffic and never count toward consensus.
//!
//! The address book outlives links: a peer record is created on first
//! evidence (beacon, handshake, or gossip) and only its `active` bit clears
//! on disconnect.
//!
//! # Identity
//!
//! A node's identity is its self-asserted name. Exactly one active link per
//! remote name is allowed; a handshake asserting *our* name is answered with
//! `DUPLICATE_NODE_REJECTION` and closed, and receiving such a rejection
//! ourselves is fatal - the process logs, waits 3 s, and exits.

use std::collections::{HashMap, HashSet};
use std::net::IpAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{broadcast, RwLock};
use tokio::time::timeout;
use tracing::{debug, error, info, warn};

use votemesh_protocol::{decode_frame, encode_frame, DecodedFrame, Frame, PeerAddr};

use crate::cli::Commander;
use crate::error::{Error, Result};
use crate::node::now_ms;
use crate::observer;
use crate::round::RoundEngine;

/// Heartbeat broadcast interval.
pub const HEARTBEAT_INTERVAL: Duration = Duration::from_secs(10);
/// Grace period before exiting on a duplicate-identity rejection.
const DUPLICATE_EXIT_GRACE: Duration = Duration::from_secs(3);
/// Stagger between connect attempts scheduled from one gossip response.
const GOSSIP_CONNECT_STAGGER: Duration = Duration::from_secs(2);
/// Maximum new connect attempts per gossip response.
const GOSSIP_CONNECT_CAP: usize = 3;
/// Per-peer timeout during the startup duplicate probe.
const PROBE_PEER_TIMEOUT: Duration = Duration::from_secs(5);
/// Overall timeout for the startup duplicate probe.
const PROBE_TOTAL_TIMEOUT: Duration = Duration::from_secs(10);
/// Capacity of the broadcast channels feeding link tasks.
const FANOUT_CAPACITY: usize = 256;
/// A peer silent for longer than this is reported stale in `network` output.
pub const STALE_AFTER: Duration = Duration::from_secs(30);

/// Direction a link was opened in.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkDirection {
    Initiated,
    Accepted,
}

/// Address-book entry for a node the mesh has ever learned of.
#[derive(Debug, Clone)]
pub struct PeerRecord {
    pub node_id: String,
    pub host: String,
    pub port: u16,
    pub last_seen: Instant,
    pub active: bool,
    /// Serial of the live link task, if one is open.
    pub link: Option<u64>,
}

impl PeerRecord {
    pub fn new(node_id: &str, host: &str, port: u16) -> Self {
        Self {
            node_id: node_id.to_string(),
            host: host.to_string(),
            port,
            last_seen: Instant::now(),
            active: false,
            link: None,
        }
    }
}

/// Mesh state: the address book plus link bookkeeping. Single-owner; all
/// mutation happens under the write lock.
pub struct MeshState {
    pub node_id: String,
    pub listen_port: u16,
    /// Unix ms at process start, used for duplicate tie-breaking.
    pub startup_time: u64,
    /// Address book keyed by node id.
    pub peers: HashMap<String, PeerRecord>,
    /// Known `host:port` addresses to attempt, from argv and gossip.
    pub seeds: Vec<String>,
    /// Addresses with an in-flight connect attempt.
    pub connecting: HashSet<String>,
    /// Count of attached observer links.
    pub observers: usize,
    next_link: u64,
}

impl MeshState {
    pub fn new(node_id: &str, listen_port: u16, startup_time: u64, seeds: Vec<String>) -> Self {
        Self {
            node_id: node_id.to_string(),
            listen_port,
            startup_time,
            peers: HashMap::new(),
            seeds,
            connecting: HashSet::new(),
            observers: 0,
            next_link: 0,
        }
    }

    /// Handshake-completed peers plus self: the consensus denominator.
    pub fn active_node_count(&self) -> usize {
        self.peers.values().filter(|p| p.active).count() + 1
    }

    pub fn active_peer_ids(&self) -> Vec<String> {
        let mut ids: Vec<String> = self
            .peers
            .values()
            .filter(|p| p.active)
            .map(|p| p.node_id.clone())
            .collect();
        ids.sort();
        ids
    }

    /// Whether any address-book entry already covers `host:port`.
    pub fn knows_address(&self, host: &str, port: u16) -> bool {
        self.peers.values().any(|p| p.host == host && p.port == port)
    }

    fn next_link_serial(&mut self) -> u64 {
        self.next_link += 1;
        self.next_link
    }
}

/// Fan-out handles for the two broadcast planes.
///
/// `broadcast` reaches every active voting link and mirrors the round
/// frames observers are entitled to see; `notify_observers` is
/// observer-plane only.
#[derive(Clone)]
pub struct Outbound {
    mesh_tx: broadcast::Sender<Frame>,
    gui_tx: broadcast::Sender<Frame>,
}

impl Outbound {
    pub fn new() -> Self {
        let (mesh_tx, _) = broadcast::channel(FANOUT_CAPACITY);
        let (gui_tx, _) = broadcast::channel(FANOUT_CAPACITY);
        Self { mesh_tx, gui_tx }
    }

    /// Send to every active voting link, mirroring round frames to observers.
    pub fn broadcast(&self, frame: Frame) {
        if frame.mirrors_to_observers() {
            let _ = self.gui_tx.send(frame.clone());
        }
        let _ = self.mesh_tx.send(frame);
    }

    /// Observer-plane notification only.
    pub fn notify_observers(&self, frame: Frame) {
        let _ = self.gui_tx.send(frame);
    }

    pub fn subscribe_mesh(&self) -> broadcast::Receiver<Frame> {
        self.mesh_tx.subscribe()
    }

    pub fn subscribe_observers(&self) -> broadcast::Receiver<Frame> {
        self.gui_tx.subscribe()
    }
}

impl Default for Outbound {
    fn default() -> Self {
        Self::new()
    }
}

/// The mesh service: listener, link tasks, gossip, heartbeat.
pub struct MeshService {
    node_id: String,
    listen_port: u16,
    startup_time: u64,
    allow_observers: bool,
    pub(crate) state: Arc<RwLock<MeshState>>,
    pub(crate) outbound: Outbound,
    engine: Arc<RoundEngine>,
    pub(crate) commander: Arc<Commander>,
}

impl MeshService {
    pub fn new(
        state: Arc<RwLock<MeshState>>,
        outbound: Outbound,
        engine: Arc<RoundEngine>,
        commander: Arc<Commander>,
        node_id: &str,
        listen_port: u16,
        startup_time: u64,
        allow_observers: bool,
    ) -> Self {
        Self {
            node_id: node_id.to_string(),
            listen_port,
            startup_time,
            allow_observers,
            state,
            outbound,
            engine,
            commander,
        }
    }

    /// Accept loop. Runs until the process exits.
    pub async fn run(self: Arc<Self>) -> Result<()> {
        let listener = TcpListener::bind(("0.0.0.0", self.listen_port)).await?;
        info!("Mesh listening on port {}", self.listen_port);

        loop {
            match listener.accept().await {
                Ok((stream, addr)) => {
                    debug!("Incoming connection from {}", addr);
                    let mesh = Arc::clone(&self);
                    tokio::spawn(async move {
                        mesh.handle_connection(stream, addr.ip(), LinkDirection::Accepted)
                            .await;
                    });
                }
                Err(e) => {
                    error!("Accept error: {}", e);
                }
            }
        }
    }

    /// Broadcast `HEARTBEAT` every 10 s.
    pub fn spawn_heartbeat(self: &Arc<Self>) {
        let mesh = Arc::clone(self);
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(HEARTBEAT_INTERVAL);
            loop {
                interval.tick().await;
                mesh.outbound.broadcast(Frame::Heartbeat {
                    from: mesh.node_id.clone(),
                });
            }
        });
    }

    /// Schedule an outbound connect attempt, at most one per address.
    pub fn schedule_connect(self: &Arc<Self>, host: String, port: u16) {
        let mesh = Arc::clone(self);
        tokio::spawn(async move {
            mesh.connect_to(host, port).await;
        });
    }

    // Returns a boxed future rather than being declared `async fn`: `connect_to`
    // and `ingest_gossip` call each other through a spawned task, and the
    // compiler cannot resolve the auto-trait (Send) cycle across two mutually
    // recursive opaque `async fn` types. Boxing here gives the cycle a
    // concrete, named type to terminate on.
    fn connect_to(
        self: Arc<Self>,
        host: String,
        port: u16,
    ) -> std::pin::Pin<Box<dyn std::future::Future<Output = ()> + Send>> {
        Box::pin(async move {
            let target = format!("{}:{}", host, port);
            {
                let mut state = self.state.write().await;
                if state.connecting.contains(&target) {
                    return;
                }
                if state
                    .peers
                    .values()
                    .any(|p| p.active && p.host == host && p.port == port)
                {
                    return;
                }
                state.connecting.insert(target.clone());
            }

            match TcpStream::connect(&target).await {
                Ok(stream) => {
                    self.state.write().await.connecting.remove(&target);
                    info!("Connected to {}", target);
                    let ip = stream.peer_addr().map(|a| a.ip());
                    match ip {
                        Ok(ip) => {
                            self.handle_connection(stream, ip, LinkDirection::Initiated)
                                .await
                        }
                        Err(e) => warn!("Could not resolve peer address for {}: {}", target, e),
                    }
                }
                Err(e) => {
                    warn!("Connect to {} failed: {}", target, e);
                    let mut state = self.state.write().await;
                    state.connecting.remove(&target);
                    state.seeds.retain(|s| s != &target);
                }
            }
        })
    }

    /// Drive one link from raw socket to closed: handshake, then the frame
    /// loop. Every error path ends here; the link dies, the mesh lives.
    async fn handle_connection(
        self: Arc<Self>,
        stream: TcpStream,
        remote_ip: IpAddr,
        direction: LinkDirection,
    ) {
        let remote_host = normalize_host(remote_ip);
        let (reader, mut writer) = stream.into_split();
        let mut reader = BufReader::new(reader);

        if direction == LinkDirection::Initiated {
            let hello = {
                let state = self.state.read().await;
                Frame::Handshake {
                    from: self.node_id.clone(),
                    port: self.listen_port,
                    known_peers: peer_addr_snapshot(&state),
                    startup_time: self.startup_time,
                    is_gui: false,
                }
            };
            if let Err(e) = send_frame(&mut writer, &hello).await {
                warn!("Handshake send to {} failed: {}", remote_host, e);
                return;
            }
        }

        // Handshake phase: wait for the peer to identify itself.
        let mut line = String::new();
        loop {
            line.clear();
            match reader.read_line(&mut line).await {
                Ok(0) => {
                    debug!("Link to {} closed before handshake", remote_host);
                    return;
                }
                Ok(_) => {}
                Err(e) => {
                    debug!("Read error from {} before handshake: {}", remote_host, e);
                    return;
                }
            }

            match decode_frame(&line) {
                DecodedFrame::Frame(Frame::Handshake {
                    from,
                    port,
                    known_peers,
                    startup_time,
                    is_gui,
                }) => {
                    if from == self.node_id {
                        info!(
                            "Rejecting handshake asserting our identity (their startup {}, ours {})",
                            startup_time, self.startup_time
                        );
                        let _ = send_frame(&mut writer, &self.duplicate_rejection()).await;
                        return;
                    }

                    if is_gui {
                        if !self.allow_observers {
                            info!("Observer {} refused: observer plane disabled", from);
                            return;
                        }
                        let ack = self.handshake_ack().await;
                        if send_frame(&mut writer, &ack).await.is_err() {
                            return;
                        }
                        observer::observer_loop(self, from, reader, writer).await;
                        return;
                    }

                    let serial = self.register_peer(&from, &remote_host, port).await;
                    let ack = self.handshake_ack().await;
                    if send_frame(&mut writer, &ack).await.is_err() {
                        self.unregister(&from, serial).await;
                        return;
                    }
                    // Ask the newcomer for its view of the mesh right away.
                    let request = Frame::PeerExchangeRequest {
                        from: self.node_id.clone(),
                        is_validation: false,
                    };
                    if send_frame(&mut writer, &request).await.is_err() {
                        self.unregister(&from, serial).await;
                        return;
                    }
                    self.ingest_gossip(known_peers).await;
                    self.peer_loop(from, serial, reader, writer).await;
                    return;
                }
                DecodedFrame::Frame(Frame::HandshakeAck {
                    from, port, peers, ..
                }) => {
                    if from == self.node_id {
                        info!("Handshake ack asserting our identity from {}", remote_host);
                        let _ = send_frame(&mut writer, &self.duplicate_rejection()).await;
                        return;
                    }
                    let serial = self.register_peer(&from, &remote_host, port).await;
                    // The ack's peer list is gossip like any other.
                    self.ingest_gossip(peers).await;
                    self.peer_loop(from, serial, reader, writer).await;
                    return;
                }
                DecodedFrame::Frame(Frame::DuplicateNodeRejection { reason, .. }) => {
                    self.fatal_duplicate(&reason).await;
                    return;
                }
                DecodedFrame::Frame(Frame::PeerExchangeRequest { from, .. }) => {
                    // Startup duplicate probes ask before ever handshaking;
                    // answer them on the transient link.
                    debug!("Pre-handshake peer exchange from {}", from);
                    let response = {
                        let state = self.state.read().await;
                        build_peer_exchange_response(&state)
                    };
                    if send_frame(&mut writer, &response).await.is_err() {
                        return;
                    }
                }
                DecodedFrame::Frame(other) => {
                    debug!(
                        "Dropping pre-handshake {} frame from {}",
                        other.tag(),
                        remote_host
                    );
                }
                DecodedFrame::Unknown { tag } => {
                    debug!("Ignoring unknown frame type {} from {}", tag, remote_host);
                }
                DecodedFrame::Malformed { error } => {
                    debug!("Dropping malformed frame from {}: {}", remote_host, error);
                }
            }
        }
    }

    /// The steady-state loop for a voting link: deliver received frames,
    /// forward broadcasts, stop when superseded or the socket dies.
    async fn peer_loop(
        self: &Arc<Self>,
        peer_id: String,
        serial: u64,
        mut reader: BufReader<OwnedReadHalf>,
        mut writer: OwnedWriteHalf,
    ) {
        let mut rx = self.outbound.subscribe_mesh();
        let mut line = String::new();

        loop {
            if !self.is_current_link(&peer_id, serial).await {
                debug!("Link {} to {} superseded", serial, peer_id);
                break;
            }

            line.clear();
            tokio::select! {
                read = reader.read_line(&mut line) => {
                    match read {
                        Ok(0) => {
                            info!("Peer {} disconnected", peer_id);
                            break;
                        }
                        Ok(_) => {
                            if !self.dispatch_frame(&peer_id, &line, &mut writer).await {
                                break;
                            }
                        }
                        Err(e) => {
                            warn!("Read error from {}: {}", peer_id, e);
                            break;
                        }
                    }
                }
                forwarded = rx.recv() => {
                    match forwarded {
                        Ok(frame) => {
                            if let Err(e) = send_frame(&mut writer, &frame).await {
                                warn!("Send to {} failed: {}", peer_id, e);
                                break;
                            }
                        }
                        Err(broadcast::error::RecvError::Lagged(missed)) => {
                            warn!("Link to {} lagged, {} frames dropped", peer_id, missed);
                        }
                        Err(broadcast::error::RecvError::Closed) => break,
                    }
                }
            }
        }

        self.unregister(&peer_id, serial).await;
    }

    /// Decode and route one received line. Returns `false` to close the link.
    async fn dispatch_frame(
        self: &Arc<Self>,
        peer_id: &str,
        line: &str,
        writer: &mut OwnedWriteHalf,
    ) -> bool {
        let frame = match decode_frame(line) {
            DecodedFrame::Frame(frame) => frame,
            DecodedFrame::Unknown { tag } => {
                debug!("Ignoring unknown frame type {} from {}", tag, peer_id);
                return true;
            }
            DecodedFrame::Malformed { error } => {
                debug!("Dropping malformed frame from {}: {}", peer_id, error);
                return true;
            }
        };

        // Any frame is proof of life.
        self.touch(peer_id).await;

        match frame {
            Frame::Heartbeat { .. } => true,

            Frame::PeerExchangeRequest { from, is_validation } => {
                if is_validation {
                    debug!("Validation probe from {}", from);
                }
                let response = {
                    let state = self.state.read().await;
                    build_peer_exchange_response(&state)
                };
                if let Err(e) = send_frame(writer, &response).await {
                    warn!("Peer exchange reply to {} failed: {}", peer_id, e);
                    return false;
                }
                true
            }

            Frame::PeerExchangeResponse { peers, .. } => {
                self.ingest_gossip(peers).await;
                true
            }

            Frame::DuplicateNodeRejection { reason, .. } => {
                self.fatal_duplicate(&reason).await;
                false
            }

            Frame::Handshake { from, .. } | Frame::HandshakeAck { from, .. } => {
                if from == self.node_id {
                    let _ = send_frame(writer, &self.duplicate_rejection()).await;
                    return false;
                }
                debug!("Redundant handshake frame from {}", peer_id);
                true
            }

            frame @ (Frame::RoundStart { .. }
            | Frame::EncryptedVote { .. }
            | Frame::BatchVoteKeys { .. }
            | Frame::VoteKey { .. }
            | Frame::ResultProposal { .. }) => {
                self.engine.handle_frame(frame).await;
                true
            }

            other => {
                debug!(
                    "Dropping observer-plane {} frame on voting link {}",
                    other.tag(),
                    peer_id
                );
                true
            }
        }
    }

    /// Record a handshake-completed peer, replacing any previous link for
    /// the same name. Returns the new link serial.
    async fn register_peer(&self, node_id: &str, host: &str, port: u16) -> u64 {
        let mut state = self.state.write().await;
        let serial = state.next_link_serial();

        let record = state
            .peers
            .entry(node_id.to_string())
            .or_insert_with(|| PeerRecord::new(node_id, host, port));
        if record.link.is_some() {
            info!("Replacing existing link for {}", node_id);
        }
        record.host = host.to_string();
        record.port = port;
        record.last_seen = Instant::now();
        record.active = true;
        record.link = Some(serial);

        info!("Peer {} active at {}:{}", node_id, host, port);
        serial
    }

    async fn unregister(&self, peer_id: &str, serial: u64) {
        let mut state = self.state.write().await;
        if let Some(record) = state.peers.get_mut(peer_id) {
            if record.link == Some(serial) {
                record.active = false;
                record.link = None;
                info!("Peer {} inactive", peer_id);
            }
        }
    }

    async fn is_current_link(&self, peer_id: &str, serial: u64) -> bool {
        let state = self.state.read().await;
        state
            .peers
            .get(peer_id)
            .map(|record| record.link == Some(serial))
            .unwrap_or(false)
    }

    async fn touch(&self, peer_id: &str) {
        let mut state = self.state.write().await;
        if let Some(record) = state.peers.get_mut(peer_id) {
            record.last_seen = Instant::now();
            record.active = true;
        }
    }

    /// Process a gossip peer list: extend the seed list and schedule a
    /// capped, staggered set of connect attempts.
    async fn ingest_gossip(self: &Arc<Self>, peers: Vec<PeerAddr>) {
        let targets = {
            let mut state = self.state.write().await;
            gossip_targets(&mut state, peers)
        };

        for (index, (host, port)) in targets.into_iter().enumerate() {
            let mesh = Arc::clone(self);
            tokio::spawn(async move {
                tokio::time::sleep(GOSSIP_CONNECT_STAGGER * index as u32).await;
                mesh.connect_to(host, port).await;
            });
        }
    }

    async fn handshake_ack(&self) -> Frame {
        let state = self.state.read().await;
        Frame::HandshakeAck {
            from: self.node_id.clone(),
            port: self.listen_port,
            peers: peer_addr_snapshot(&state),
            startup_time: self.startup_time,
        }
    }

    fn duplicate_rejection(&self) -> Frame {
        Frame::DuplicateNodeRejection {
            reason: format!("node id \"{}\" is already in use on this mesh", self.node_id),
            existing_node_id: self.node_id.clone(),
        }
    }

    /// Another node owns our name. Log, give the message time to flush, exit.
    async fn fatal_duplicate(&self, reason: &str) {
        error!("FATAL: duplicate node identity: {}", reason);
        error!("Shutting down in {:?}", DUPLICATE_EXIT_GRACE);
        tokio::time::sleep(DUPLICATE_EXIT_GRACE).await;
        std::process::exit(1);
    }
}

/// Decide which gossip entries to pursue. Extends the seed list and the
/// address book; returns the addresses to dial, capped at
/// [`GOSSIP_CONNECT_CAP`].
fn gossip_targets(state: &mut MeshState, peers: Vec<PeerAddr>) -> Vec<(String, u16)> {
    let mut targets = Vec::new();

    for peer in peers {
        if peer.node_id == state.node_id {
            continue;
        }
        if state
            .peers
            .get(&peer.node_id)
            .map(|record| record.active)
            .unwrap_or(false)
        {
            continue;
        }
        if peer.host.is_empty() || peer.port == 0 {
            continue;
        }
        if is_loopback_host(&peer.host) && peer.port == state.listen_port {
            continue;
        }
        let target = format!("{}:{}", peer.host, peer.port);
        if state.connecting.contains(&target) {
            continue;
        }
        if state
            .peers
            .values()
            .any(|record| record.active && record.host == peer.host && record.port == peer.port)
        {
            continue;
        }

        // Gossip is first evidence: record the node even before we connect.
        if !peer.node_id.is_empty() {
            state
                .peers
                .entry(peer.node_id.clone())
                .or_insert_with(|| PeerRecord::new(&peer.node_id, &peer.host, peer.port));
        }
        if !state.seeds.contains(&target) {
            state.seeds.push(target);
        }
        if targets.len() < GOSSIP_CONNECT_CAP {
            targets.push((peer.host, peer.port));
        }
    }

    targets
}

/// Build a `PEER_EXCHANGE_RESPONSE`: seed addresses plus every active peer
/// with its recorded address.
fn build_peer_exchange_response(state: &MeshState) -> Frame {
    let mut peers: Vec<PeerAddr> = Vec::new();

    for seed in &state.seeds {
        if let Some((host, port)) = split_host_port(seed) {
            let node_id = state
                .peers
                .values()
                .find(|record| record.host == host && record.port == port)
                .map(|record| record.node_id.clone())
                .unwrap_or_default();
            peers.push(PeerAddr {
                node_id,
                host,
                port,
            });
        }
    }

    for record in state.peers.values().filter(|record| record.active) {
        if !peers
            .iter()
            .any(|p| p.host == record.host && p.port == record.port)
        {
            peers.push(PeerAddr {
                node_id: record.node_id.clone(),
                host: record.host.clone(),
                port: record.port,
            });
        }
    }

    Frame::PeerExchangeResponse {
        from: state.node_id.clone(),
        peers,
    }
}

/// Startup duplicate-identity probe.
///
/// Before the listener opens, ask each seed for its peer list under a
/// transient validator identity. A response listing our name, or any
/// handshake frame asserting it, aborts startup. Connect failures and
/// timeouts are not duplicates - an unreachable seed proves nothing.
pub async fn probe_for_duplicate(node_id: &str, seeds: &[String]) -> Result<()> {
    if seeds.is_empty() {
        return Ok(());
    }

    let sweep = async {
        for seed in seeds {
            match timeout(PROBE_PEER_TIMEOUT, probe_one_seed(node_id, seed)).await {
                Ok(Err(err @ Error::DuplicateIdentity { .. })) => return Err(err),
                Ok(Err(e)) => debug!("Probe of {} failed: {}", seed, e),
                Ok(Ok(())) => {}
                Err(_) => debug!("Probe of {} timed out", seed),
            }
        }
        Ok(())
    };

    match timeout(PROBE_TOTAL_TIMEOUT, sweep).await {
        Ok(result) => result,
        Err(_) => {
            debug!("Duplicate probe hit overall timeout; proceeding");
            Ok(())
        }
    }
}

async fn probe_one_seed(node_id: &str, seed: &str) -> Result<()> {
    let stream = TcpStream::connect(seed).await?;
    let (reader, mut writer) = stream.into_split();
    let mut reader = BufReader::new(reader);

    let request = Frame::PeerExchangeRequest {
        from: format!("validator_{}", now_ms()),
        is_validation: true,
    };
    send_frame(&mut writer, &request).await?;

    let mut line = String::new();
    loop {
        line.clear();
        if reader.read_line(&mut line).await? == 0 {
            return Ok(());
        }
        match decode_frame(&line) {
            DecodedFrame::Frame(Frame::PeerExchangeResponse { from, peers }) => {
                // The responder itself might be the one wearing our name.
                if from == node_id || peers.iter().any(|p| p.node_id == node_id) {
                    return Err(Error::DuplicateIdentity {
                        node_id: node_id.to_string(),
                    });
                }
                return Ok(());
            }
            DecodedFrame::Frame(
                Frame::Handshake { from, .. } | Frame::HandshakeAck { from, .. },
            ) if from == node_id => {
                return Err(Error::DuplicateIdentity {
                    node_id: node_id.to_string(),
                });
            }
            _ => {}
        }
    }
}

/// Write one frame as a line. The caller owns error handling; a failed send
/// is how a dead link announces itself.
pub(crate) async fn send_frame(writer: &mut OwnedWriteHalf, frame: &Frame) -> std::io::Result<()> {
    let mut line = encode_frame(frame)
        .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e))?;
    line.push('\n');
    writer.write_all(line.as_bytes()).await
}

/// Map loopback addresses to `localhost` so address-book entries compare
/// stably across nodes sharing one machine.
pub(crate) fn normalize_host(ip: IpAddr) -> String {
    if ip.is_loopback() {
        "localhost".to_string()
    } else {
        ip.to_string()
    }
}

pub(crate) fn is_loopback_host(host: &str) -> bool {
    matches!(host, "localhost" | "127.0.0.1" | "::1")
}

pub(crate) fn split_host_port(target: &str) -> Option<(String, u16)> {
    let (host, port) = target.rsplit_once(':')?;
    let port: u16 = port.parse().ok()?;
    if host.is_empty() || port == 0 {
        return None;
    }
    Some((host.to_string(), port))
}

fn peer_addr_snapshot(state: &MeshState) -> Vec<PeerAddr> {
    state
        .peers
        .values()
        .map(|record| PeerAddr {
            node_id: record.node_id.clone(),
            host: record.host.clone(),
            port: record.port,
        })
        .collect()
}

#[allow(dead_code)]
fn _diag_assert_send(svc: Arc<MeshService>, peers: Vec<PeerAddr>) {
    fn assert_send<T: Send>(_: T) {}
    assert_send(svc.clone());
    fn is_sync<T: Sync>() {}
    is_sync::<MeshService>();
    let _ = peers;
}

#[cfg(test)]
mod tests {
    use super::*;

    fn state_with(node_id: &str, port: u16) -> MeshState {
        MeshState::new(node_id, port, 0, vec![])
    }

    fn addr(node_id: &str, host: &str, port: u16) -> PeerAddr {
        PeerAddr {
            node_id: node_id.to_string(),
            host: host.to_string(),
            port,
        }
    }

    #[test]
    fn normalize_host_maps_loopback() {
        assert_eq!(normalize_host("127.0.0.1".parse().unwrap()), "localhost");
        assert_eq!(normalize_host("::1".parse().unwrap()), "localhost");
        assert_eq!(
            normalize_host("192.168.1.20".parse().unwrap()),
            "192.168.1.20"
        );
    }

    #[test]
    fn split_host_port_rejects_junk() {
        assert_eq!(
            split_host_port("localhost:3001"),
            Some(("localhost".to_string(), 3001))
        );
        assert_eq!(split_host_port("noport"), None);
        assert_eq!(split_host_port(":3001"), None);
        assert_eq!(split_host_port("host:0"), None);
        assert_eq!(split_host_port("host:notaport"), None);
    }

    #[test]
    fn gossip_skips_self_connected_and_incomplete() {
        let mut state = state_with("alice", 3001);
        let mut bob = PeerRecord::new("bob", "localhost", 3002);
        bob.active = true;
        state.peers.insert("bob".to_string(), bob);

        let targets = gossip_targets(
            &mut state,
            vec![
                addr("alice", "localhost", 3001), // self
                addr("bob", "localhost", 3002),   // already connected
                addr("carol", "", 3003),          // missing host
                addr("dave", "localhost", 0),     // missing port
                addr("erin", "localhost", 3001),  // loopback to own port
                addr("frank", "localhost", 3006), // the one good entry
            ],
        );

        assert_eq!(targets, vec![("localhost".to_string(), 3006)]);
        assert!(state.seeds.contains(&"localhost:3006".to_string()));
        assert_eq!(state.seeds.len(), 1);
    }

    #[test]
    fn gossip_caps_simultaneous_attempts() {
        let mut state = state_with("alice", 3001);
        let peers: Vec<PeerAddr> = (0..6)
            .map(|i| addr(&format!("peer{}", i), "localhost", 4000 + i))
            .collect();

        let targets = gossip_targets(&mut state, peers);

        assert_eq!(targets.len(), GOSSIP_CONNECT_CAP);
        // Uncapped entries still land in the seed list for later.
        assert_eq!(state.seeds.len(), 6);
    }

    #[test]
    fn gossip_skips_in_flight_addresses() {
        let mut state = state_with("alice", 3001);
        state.connecting.insert("localhost:4000".to_string());

        let targets = gossip_targets(&mut state, vec![addr("bob", "localhost", 4000)]);
        assert!(targets.is_empty());
    }

    #[test]
    fn exchange_response_lists_seeds_and_active_peers() {
        let mut state = state_with("alice", 3001);
        state.seeds.push("localhost:3002".to_string());

        let mut carol = PeerRecord::new("carol", "localhost", 3003);
        carol.active = true;
        state.peers.insert("carol".to_string(), carol);
        // Inactive entries stay in the address book but are not advertised.
        state
            .peers
            .insert("dave".to_string(), PeerRecord::new("dave", "localhost", 3004));

        match build_peer_exchange_response(&state) {
            Frame::PeerExchangeResponse { from, peers } => {
                assert_eq!(from, "alice");
                assert!(peers.iter().any(|p| p.port == 3002));
                assert!(peers.iter().any(|p| p.node_id == "carol" && p.port == 3003));
                assert!(!peers.iter().any(|p| p.node_id == "dave"));
            }
            other => panic!("expected exchange response, got {:?}", other),
        }
    }

    #[test]
    fn active_node_count_includes_self() {
        let mut state = state_with("alice", 3001);
        assert_eq!(state.active_node_count(), 1);

        let mut bob = PeerRecord::new("bob", "localhost", 3002);
        bob.active = true;
        state.peers.insert("bob".to_string(), bob);
        state
            .peers
            .insert("carol".to_string(), PeerRecord::new("carol", "localhost", 3003));

        assert_eq!(state.active_node_count(), 2);
    }
}
