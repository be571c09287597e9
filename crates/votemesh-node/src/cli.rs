//! Interactive operator CLI.
//!
//! One line per command, parsed once into [`Command`] at the boundary and
//! dispatched from there - no string lookups past this point. The same
//! grammar serves observer-issued `COMMAND` frames, restricted to the
//! operations observers are allowed to run.

use std::sync::Arc;

use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::RwLock;
use tracing::warn;

use votemesh_protocol::Frame;

use crate::error::Error;
use crate::mesh::{probe_for_duplicate, MeshState, Outbound, STALE_AFTER};
use crate::round::{RoundEngine, RoundStatus};

/// Every operator command. Parsed once; unknown input never gets this far.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    Help,
    Status,
    Peers,
    Network,
    Discover,
    Start {
        topic: String,
        choices: Option<Vec<String>>,
        seconds: Option<u64>,
    },
    Vote {
        choice: String,
    },
    Results,
    Verify,
    Debug,
    CheckDuplicates,
    WhoAmI,
    GuiInfo,
    Quit,
}

/// Parse one input line. Errors are ready-to-print usage strings.
pub fn parse_command(line: &str) -> Result<Command, String> {
    let tokens: Vec<&str> = line.split_whitespace().collect();
    let Some((head, rest)) = tokens.split_first() else {
        return Err(String::new());
    };

    match head.to_lowercase().as_str() {
        "help" => Ok(Command::Help),
        "status" => Ok(Command::Status),
        "peers" => Ok(Command::Peers),
        "network" | "topology" => Ok(Command::Network),
        "discover" | "find-peers" => Ok(Command::Discover),
        "start" => parse_start(rest),
        "vote" => {
            if rest.is_empty() {
                Err("usage: vote <choice>".to_string())
            } else {
                Ok(Command::Vote {
                    choice: rest.join(" "),
                })
            }
        }
        "results" => Ok(Command::Results),
        "verify" => Ok(Command::Verify),
        "debug" => Ok(Command::Debug),
        "check-duplicates" | "validate" => Ok(Command::CheckDuplicates),
        "whoami" | "info" => Ok(Command::WhoAmI),
        "gui-info" => Ok(Command::GuiInfo),
        "quit" | "exit" => Ok(Command::Quit),
        other => Err(format!("unknown command \"{}\"; try help", other)),
    }
}

/// `start <topic> [choices] [seconds]`: the trailing argument is seconds iff
/// it is a pure integer, the then-last is the choice list iff it contains a
/// comma, and whatever remains joined by spaces is the topic.
fn parse_start(args: &[&str]) -> Result<Command, String> {
    let mut args: Vec<&str> = args.to_vec();

    let seconds = match args.last() {
        Some(last) if !last.is_empty() && last.chars().all(|c| c.is_ascii_digit()) => {
            let secs = last.parse::<u64>().map_err(|e| e.to_string())?;
            args.pop();
            Some(secs)
        }
        _ => None,
    };

    let choices = match args.last() {
        Some(last) if last.contains(',') => {
            let list: Vec<String> = last
                .split(',')
                .map(|c| c.trim().to_string())
                .filter(|c| !c.is_empty())
                .collect();
            args.pop();
            Some(list)
        }
        _ => None,
    };

    let topic = strip_quotes(&args.join(" ")).to_string();
    if topic.is_empty() {
        return Err("usage: start <topic> [choice1,choice2,...] [seconds]".to_string());
    }

    Ok(Command::Start {
        topic,
        choices,
        seconds,
    })
}

fn strip_quotes(s: &str) -> &str {
    let s = s.trim();
    if s.len() >= 2 && s.starts_with('"') && s.ends_with('"') {
        &s[1..s.len() - 1]
    } else {
        s
    }
}

/// Executes parsed commands against the node. Shared by the CLI loop and the
/// observer plane.
pub struct Commander {
    node_id: String,
    listen_port: u16,
    startup_time: u64,
    mesh_state: Arc<RwLock<MeshState>>,
    engine: Arc<RoundEngine>,
    outbound: Outbound,
}

impl Commander {
    pub fn new(
        node_id: &str,
        listen_port: u16,
        startup_time: u64,
        mesh_state: Arc<RwLock<MeshState>>,
        engine: Arc<RoundEngine>,
        outbound: Outbound,
    ) -> Self {
        Self {
            node_id: node_id.to_string(),
            listen_port,
            startup_time,
            mesh_state,
            engine,
            outbound,
        }
    }

    /// Run one command to a printable response.
    pub async fn execute(&self, command: Command) -> String {
        match command {
            Command::Help => help_text(),
            Command::Status => self.status_report().await,
            Command::Peers => self.peers_report().await,
            Command::Network => self.network_report().await,
            Command::Discover => {
                self.outbound.broadcast(Frame::PeerExchangeRequest {
                    from: self.node_id.clone(),
                    is_validation: false,
                });
                "peer discovery round triggered".to_string()
            }
            Command::Start {
                topic,
                choices,
                seconds,
            } => match self.engine.start_round(&topic, choices, seconds).await {
                Ok(message) => message,
                Err(e) => format!("rejected: {}", e),
            },
            Command::Vote { choice } => match self.engine.cast_vote(&choice).await {
                Ok(message) => message,
                Err(e) => format!("rejected: {}", e),
            },
            Command::Results => self.results_report().await,
            Command::Verify => self.verify_report().await,
            Command::Debug => self.debug_report().await,
            Command::CheckDuplicates => self.duplicate_report().await,
            Command::WhoAmI => format!(
                "{} on port {} (up since {} ms)",
                self.node_id, self.listen_port, self.startup_time
            ),
            Command::GuiInfo => format!(
                "observers attach by opening a TCP connection to port {} and sending\n\
                 {{\"type\":\"HANDSHAKE\",\"from\":\"<clientId>\",\"port\":0,\"isGUI\":true}}\n\
                 followed by newline; status updates stream every 2 s",
                self.listen_port
            ),
            Command::Quit => "bye".to_string(),
        }
    }

    /// Observer `COMMAND` frames run through the same grammar but may only
    /// reach status, start, vote, peers, and results.
    pub async fn execute_observer(&self, command: &str, args: &[String]) -> String {
        let mut line = command.to_string();
        for arg in args {
            line.push(' ');
            line.push_str(arg);
        }

        match parse_command(&line) {
            Ok(
                cmd @ (Command::Status
                | Command::Start { .. }
                | Command::Vote { .. }
                | Command::Peers
                | Command::Results),
            ) => self.execute(cmd).await,
            Ok(_) => format!("command \"{}\" is not available to observers", command),
            Err(e) => e,
        }
    }

    async fn status_report(&self) -> String {
        let (active, observers) = {
            let state = self.mesh_state.read().await;
            (state.active_node_count(), state.observers)
        };
        let mut out = format!(
            "node {} | port {} | {} active nodes | {} observers",
            self.node_id, self.listen_port, active, observers
        );
        match self.engine.status().await {
            Some(status) => {
                out.push_str(&format!(
                    "\nround {} \"{}\" | phase {} | {} s remaining | {} ballots, {} decrypted",
                    status.round_id,
                    status.topic,
                    status.phase,
                    status.time_remaining_secs,
                    status.encrypted_votes,
                    status.decrypted_votes,
                ));
                if status.has_voted {
                    out.push_str(" | voted");
                }
            }
            None => out.push_str("\nno round yet"),
        }
        out
    }

    async fn peers_report(&self) -> String {
        let state = self.mesh_state.read().await;
        let mut active: Vec<String> = state
            .peers
            .values()
            .filter(|p| p.active)
            .map(|p| format!("  {} at {}:{}", p.node_id, p.host, p.port))
            .collect();
        if active.is_empty() {
            return "no active peers".to_string();
        }
        active.sort();
        format!("{} active peers:\n{}", active.len(), active.join("\n"))
    }

    async fn network_report(&self) -> String {
        let state = self.mesh_state.read().await;
        if state.peers.is_empty() {
            return "address book is empty".to_string();
        }
        let mut lines: Vec<String> = state
            .peers
            .values()
            .map(|p| {
                let status = if p.active {
                    if p.last_seen.elapsed() > STALE_AFTER {
                        "active (stale)"
                    } else {
                        "active"
                    }
                } else {
                    "inactive"
                };
                format!("  {} at {}:{} [{}]", p.node_id, p.host, p.port, status)
            })
            .collect();
        lines.sort();
        format!(
            "{} known nodes ({} active):\n{}",
            state.peers.len(),
            state.active_node_count() - 1,
            lines.join("\n")
        )
    }

    async fn results_report(&self) -> String {
        match self.engine.status().await {
            Some(RoundStatus {
                round_id,
                topic,
                phase,
                results: Some(results),
                consensus_achieved,
                ..
            }) => {
                let mut out = format!("round {} \"{}\" [{}]:", round_id, topic, phase);
                if results.is_empty() {
                    out.push_str("\n  (no votes)");
                }
                for entry in &results {
                    out.push_str(&format!("\n  {}: {}", entry.choice, entry.count));
                }
                out.push_str(&format!(
                    "\nconsensus: {}",
                    if consensus_achieved { "yes" } else { "no" }
                ));
                out
            }
            Some(status) => format!(
                "round {} is in {} phase; no results yet",
                status.round_id, status.phase
            ),
            None => "no round yet".to_string(),
        }
    }

    async fn verify_report(&self) -> String {
        match self.engine.status().await {
            Some(status) => match status.my_ballot {
                Some(tracking) => {
                    if tracking.verified {
                        format!(
                            "ballot {} (\"{}\") verified in the final tally",
                            tracking.vote_id, tracking.choice
                        )
                    } else if status.phase == votemesh_protocol::RoundPhase::Finished {
                        format!(
                            "ballot {} (\"{}\") NOT found in the final tally",
                            tracking.vote_id, tracking.choice
                        )
                    } else {
                        format!(
                            "ballot {} cast; verification runs when the round finishes",
                            tracking.vote_id
                        )
                    }
                }
                None => "no ballot cast in this round".to_string(),
            },
            None => "no round yet".to_string(),
        }
    }

    async fn debug_report(&self) -> String {
        let state = self.mesh_state.read().await;
        format!(
            "peers: {} known, {} active | seeds: {:?} | connecting: {:?} | observers: {} | rounds seen: {}",
            state.peers.len(),
            state.active_node_count() - 1,
            state.seeds,
            state.connecting,
            state.observers,
            self.engine.round_count().await,
        )
    }

    async fn duplicate_report(&self) -> String {
        let seeds = self.mesh_state.read().await.seeds.clone();
        if seeds.is_empty() {
            return "no seeds to probe".to_string();
        }
        match probe_for_duplicate(&self.node_id, &seeds).await {
            Ok(()) => format!("no duplicate of \"{}\" found on the mesh", self.node_id),
            Err(Error::DuplicateIdentity { node_id }) => {
                format!("WARNING: another node answers to \"{}\"", node_id)
            }
            Err(e) => format!("probe failed: {}", e),
        }
    }
}

fn help_text() -> String {
    "commands:\n\
     \x20 status                               node and round overview\n\
     \x20 peers                                active peer links\n\
     \x20 network | topology                   full address book\n\
     \x20 discover | find-peers                trigger a peer exchange\n\
     \x20 start <topic> [choices] [seconds]    open a voting round\n\
     \x20 vote <choice>                        cast your ballot\n\
     \x20 results                              tally of the latest round\n\
     \x20 verify                               check your ballot in the tally\n\
     \x20 debug                                internal counters\n\
     \x20 check-duplicates | validate          probe seeds for a name clash\n\
     \x20 whoami | info                        identity\n\
     \x20 gui-info                             how observers attach\n\
     \x20 quit | exit                          shut down"
        .to_string()
}

/// The interactive loop. Returns when the operator quits or stdin closes.
pub async fn run_cli_loop(commander: Arc<Commander>) {
    let stdin = tokio::io::stdin();
    let mut lines = BufReader::new(stdin).lines();

    println!("votemesh ready; type help for commands");
    loop {
        match lines.next_line().await {
            Ok(Some(line)) => {
                let line = line.trim();
                if line.is_empty() {
                    continue;
                }
                match parse_command(line) {
                    Ok(Command::Quit) => {
                        println!("bye");
                        return;
                    }
                    Ok(command) => println!("{}", commander.execute(command).await),
                    Err(message) => println!("{}", message),
                }
            }
            Ok(None) => return,
            Err(e) => {
                warn!("CLI read error: {}", e);
                return;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn start_parses_topic_choices_and_seconds() {
        let cmd = parse_command("start \"x\" yes,no 60").unwrap();
        assert_eq!(
            cmd,
            Command::Start {
                topic: "x".to_string(),
                choices: Some(vec!["yes".to_string(), "no".to_string()]),
                seconds: Some(60),
            }
        );
    }

    #[test]
    fn start_without_choices_keeps_integer_as_seconds() {
        let cmd = parse_command("start Q 120").unwrap();
        assert_eq!(
            cmd,
            Command::Start {
                topic: "Q".to_string(),
                choices: None,
                seconds: Some(120),
            }
        );
    }

    #[test]
    fn start_with_multiword_topic() {
        let cmd = parse_command("start should we deploy today yes,no,abstain 45").unwrap();
        assert_eq!(
            cmd,
            Command::Start {
                topic: "should we deploy today".to_string(),
                choices: Some(vec![
                    "yes".to_string(),
                    "no".to_string(),
                    "abstain".to_string()
                ]),
                seconds: Some(45),
            }
        );
    }

    #[test]
    fn start_trailing_non_integer_is_topic() {
        // "60s" is not a pure integer, so it stays part of the topic.
        let cmd = parse_command("start deploy 60s").unwrap();
        assert_eq!(
            cmd,
            Command::Start {
                topic: "deploy 60s".to_string(),
                choices: None,
                seconds: None,
            }
        );
    }

    #[test]
    fn start_choice_list_is_trimmed() {
        let cmd = parse_command("start q yes,\u{20}no, 30");
        // Whitespace around commas came in as separate tokens; a comma list
        // is a single token, so "yes," parses alone.
        assert!(cmd.is_ok());
        match parse_command("start q a,b,,c").unwrap() {
            Command::Start { choices, .. } => {
                assert_eq!(
                    choices,
                    Some(vec!["a".to_string(), "b".to_string(), "c".to_string()])
                );
            }
            other => panic!("expected start, got {:?}", other),
        }
    }

    #[test]
    fn start_without_topic_is_usage_error() {
        assert!(parse_command("start").is_err());
        assert!(parse_command("start 60").is_err());
    }

    #[test]
    fn command_aliases_resolve() {
        assert_eq!(parse_command("topology").unwrap(), Command::Network);
        assert_eq!(parse_command("find-peers").unwrap(), Command::Discover);
        assert_eq!(parse_command("validate").unwrap(), Command::CheckDuplicates);
        assert_eq!(parse_command("info").unwrap(), Command::WhoAmI);
        assert_eq!(parse_command("exit").unwrap(), Command::Quit);
    }

    #[test]
    fn vote_joins_multiword_choice() {
        assert_eq!(
            parse_command("vote strong yes").unwrap(),
            Command::Vote {
                choice: "strong yes".to_string()
            }
        );
        assert!(parse_command("vote").is_err());
    }

    #[test]
    fn unknown_command_points_at_help() {
        let err = parse_command("frobnicate").unwrap_err();
        assert!(err.contains("help"));
    }
}
