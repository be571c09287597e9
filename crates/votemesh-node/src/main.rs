//! Votemesh node binary.
//!
//! A peer-to-peer anonymous voting node for the local network.

use votemesh_node::{NodeConfig, VoteNode};

#[tokio::main]
async fn main() {
    // Initialize tracing
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "votemesh_node=info,votemesh_protocol=info".into()),
        )
        .init();

    let args: Vec<String> = std::env::args().skip(1).collect();
    let config = match NodeConfig::from_args(args) {
        Ok(config) => config,
        Err(e) => {
            eprintln!("{}", e);
            eprintln!("{}", NodeConfig::usage());
            std::process::exit(1);
        }
    };

    let node = VoteNode::new(config);
    if let Err(e) = node.run().await {
        tracing::error!("Fatal: {}", e);
        std::process::exit(1);
    }
}
