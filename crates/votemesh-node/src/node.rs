//! Node configuration and wiring.
//!
//! `NodeConfig` parses argv; `VoteNode` owns every component - mesh, round
//! engine, discovery beacon, observer plane, CLI - and wires them together
//! in `run()`. There are no hidden globals: everything hangs off the values
//! constructed here.

use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use tokio::sync::RwLock;
use tracing::{error, info};

use crate::cli::{self, Commander};
use crate::discovery::DiscoveryBeacon;
use crate::error::{Error, Result};
use crate::mesh::{probe_for_duplicate, split_host_port, MeshService, MeshState, Outbound};
use crate::observer;
use crate::round::RoundEngine;

/// Unix milliseconds now.
pub(crate) fn now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

const NODE_ID_MIN_LEN: usize = 2;
const NODE_ID_MAX_LEN: usize = 20;

/// Startup configuration, from argv:
/// `votemesh-node <nodeId> <port> [peer:port ...] [--no-gui] [--gui-only]`
#[derive(Debug, Clone)]
pub struct NodeConfig {
    pub node_id: String,
    pub port: u16,
    /// Seed addresses as `host:port`.
    pub seeds: Vec<String>,
    /// Disable the observer plane entirely.
    pub no_gui: bool,
    /// Run headless: no interactive CLI, observers drive the node.
    pub gui_only: bool,
}

impl NodeConfig {
    /// Parse argv (without the program name).
    pub fn from_args<I>(args: I) -> Result<Self>
    where
        I: IntoIterator<Item = String>,
    {
        let mut positional = Vec::new();
        let mut no_gui = false;
        let mut gui_only = false;

        for arg in args {
            match arg.as_str() {
                "--no-gui" => no_gui = true,
                "--gui-only" => gui_only = true,
                flag if flag.starts_with("--") => {
                    return Err(Error::Config(format!("unknown flag {}", flag)));
                }
                _ => positional.push(arg),
            }
        }

        if positional.len() < 2 {
            return Err(Error::Config(
                "expected <nodeId> and <port>".to_string(),
            ));
        }

        let node_id = positional.remove(0);
        validate_node_id(&node_id)?;

        let port: u16 = positional
            .remove(0)
            .parse()
            .map_err(|_| Error::Config("port must be a number in 1-65535".to_string()))?;
        if port == 0 {
            return Err(Error::Config("port must be a number in 1-65535".to_string()));
        }

        let mut seeds = Vec::new();
        for peer in positional {
            match split_host_port(&peer) {
                Some((host, port)) => seeds.push(format!("{}:{}", host, port)),
                None => {
                    return Err(Error::Config(format!(
                        "seed \"{}\" must be host:port",
                        peer
                    )))
                }
            }
        }

        Ok(Self {
            node_id,
            port,
            seeds,
            no_gui,
            gui_only,
        })
    }

    pub fn usage() -> &'static str {
        "usage: votemesh-node <nodeId> <port> [peer1:port1 ...] [--no-gui] [--gui-only]\n\
         \x20 nodeId    2-20 chars of [A-Za-z0-9_-]\n\
         \x20 port      TCP listen port for the mesh\n\
         \x20 peers     seed addresses to join through"
    }
}

fn validate_node_id(node_id: &str) -> Result<()> {
    let len_ok = (NODE_ID_MIN_LEN..=NODE_ID_MAX_LEN).contains(&node_id.len());
    let chars_ok = node_id
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-');
    if len_ok && chars_ok {
        Ok(())
    } else {
        Err(Error::Config(format!(
            "node id \"{}\" must be {}-{} chars of [A-Za-z0-9_-]",
            node_id, NODE_ID_MIN_LEN, NODE_ID_MAX_LEN
        )))
    }
}

/// A running voting node.
pub struct VoteNode {
    config: NodeConfig,
    mesh_state: Arc<RwLock<MeshState>>,
    outbound: Outbound,
    engine: Arc<RoundEngine>,
    mesh: Arc<MeshService>,
    commander: Arc<Commander>,
}

impl VoteNode {
    pub fn new(config: NodeConfig) -> Self {
        let startup_time = now_ms();
        let outbound = Outbound::new();
        let mesh_state = Arc::new(RwLock::new(MeshState::new(
            &config.node_id,
            config.port,
            startup_time,
            config.seeds.clone(),
        )));
        let engine = Arc::new(RoundEngine::new(
            &config.node_id,
            Arc::clone(&mesh_state),
            outbound.clone(),
        ));
        let commander = Arc::new(Commander::new(
            &config.node_id,
            config.port,
            startup_time,
            Arc::clone(&mesh_state),
            Arc::clone(&engine),
            outbound.clone(),
        ));
        let mesh = Arc::new(MeshService::new(
            Arc::clone(&mesh_state),
            outbound.clone(),
            Arc::clone(&engine),
            Arc::clone(&commander),
            &config.node_id,
            config.port,
            startup_time,
            !config.no_gui,
        ));

        Self {
            config,
            mesh_state,
            outbound,
            engine,
            mesh,
            commander,
        }
    }

    /// Run the node. Returns when the operator quits; duplicate identity at
    /// startup returns the fatal error instead.
    pub async fn run(self) -> Result<()> {
        info!(
            "Starting node {} on port {} ({} seeds)",
            self.config.node_id,
            self.config.port,
            self.config.seeds.len()
        );

        // Make sure nobody on the mesh already answers to our name. Probe
        // failures are not duplicates; an actual sighting is fatal.
        if let Err(e) = probe_for_duplicate(&self.config.node_id, &self.config.seeds).await {
            error!("{}", e);
            return Err(e);
        }

        // Listener first, then the periodic planes.
        {
            let mesh = Arc::clone(&self.mesh);
            tokio::spawn(async move {
                if let Err(e) = mesh.run().await {
                    error!("Mesh service error: {}", e);
                }
            });
        }
        self.mesh.spawn_heartbeat();

        {
            let beacon = DiscoveryBeacon::new(
                &self.config.node_id,
                self.config.port,
                Arc::clone(&self.mesh_state),
                Arc::clone(&self.mesh),
            );
            tokio::spawn(async move {
                if let Err(e) = beacon.run().await {
                    error!("Discovery beacon error: {}", e);
                }
            });
        }

        if !self.config.no_gui {
            observer::spawn_status_stream(
                self.config.node_id.clone(),
                Arc::clone(&self.mesh_state),
                Arc::clone(&self.engine),
                self.outbound.clone(),
            );
        }

        // Dial the seeds we were given.
        for seed in &self.config.seeds {
            if let Some((host, port)) = split_host_port(seed) {
                self.mesh.schedule_connect(host, port);
            }
        }

        if self.config.gui_only {
            info!("Interactive CLI disabled (--gui-only); driven by observers");
            std::future::pending::<()>().await;
        } else {
            cli::run_cli_loop(Arc::clone(&self.commander)).await;
        }

        info!("Node {} shutting down", self.config.node_id);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn args(list: &[&str]) -> Vec<String> {
        list.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn parses_full_command_line() {
        let config = NodeConfig::from_args(args(&[
            "alice",
            "3001",
            "localhost:3002",
            "localhost:3003",
            "--no-gui",
        ]))
        .unwrap();

        assert_eq!(config.node_id, "alice");
        assert_eq!(config.port, 3001);
        assert_eq!(config.seeds, vec!["localhost:3002", "localhost:3003"]);
        assert!(config.no_gui);
        assert!(!config.gui_only);
    }

    #[test]
    fn rejects_bad_node_ids() {
        assert!(NodeConfig::from_args(args(&["a", "3001"])).is_err()); // too short
        assert!(NodeConfig::from_args(args(&["a".repeat(21).as_str(), "3001"])).is_err());
        assert!(NodeConfig::from_args(args(&["bad name", "3001"])).is_err());
        assert!(NodeConfig::from_args(args(&["ok_name-1", "3001"])).is_ok());
    }

    #[test]
    fn rejects_bad_ports_and_seeds() {
        assert!(NodeConfig::from_args(args(&["alice"])).is_err());
        assert!(NodeConfig::from_args(args(&["alice", "notaport"])).is_err());
        assert!(NodeConfig::from_args(args(&["alice", "0"])).is_err());
        assert!(NodeConfig::from_args(args(&["alice", "3001", "noport"])).is_err());
        assert!(NodeConfig::from_args(args(&["alice", "3001", "--bogus"])).is_err());
    }
}
