//! Wire frames for the votemesh protocol.
//!
//! Every frame is a JSON object with a mandatory `type` discriminant,
//! delivered one object per line over a peer link. The tag set splits into
//! three planes:
//!
//! - **Mesh plane**: `HANDSHAKE`, `HANDSHAKE_ACK`, `HEARTBEAT`,
//!   `PEER_EXCHANGE_REQUEST`, `PEER_EXCHANGE_RESPONSE`,
//!   `DUPLICATE_NODE_REJECTION`.
//! - **Voting plane**: `ROUND_START`, `ENCRYPTED_VOTE`, `BATCH_VOTE_KEYS`,
//!   `VOTE_KEY`, `RESULT_PROPOSAL`.
//! - **Observer plane**: `STATUS_UPDATE`, `PHASE_CHANGE`, `VOTE_RECEIVED`,
//!   `RESULTS`, `COMMAND`, `COMMAND_RESPONSE`.
//!
//! `ENCRYPTED_VOTE` and `VOTE_KEY` carry no `from` field. That is the wire
//! half of the unlinkability guarantee and is load-bearing: do not add one.
//!
//! Unknown tags are ignored by receivers; malformed frames drop the frame
//! without closing the link. [`decode_frame`] distinguishes the two.

use serde::{Deserialize, Serialize};

use crate::tally::TallyEntry;

/// Address-book entry exchanged during handshake and peer gossip.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PeerAddr {
    pub node_id: String,
    pub host: String,
    pub port: u16,
}

/// One released ballot key inside a `BATCH_VOTE_KEYS` frame.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VoteKeyEntry {
    pub anonymous_vote_id: String,
    /// Hex-encoded 32-byte ballot key.
    pub key: String,
}

/// Phase of a voting round.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RoundPhase {
    Voting,
    Consensus,
    Finished,
}

impl std::fmt::Display for RoundPhase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RoundPhase::Voting => write!(f, "VOTING"),
            RoundPhase::Consensus => write!(f, "CONSENSUS"),
            RoundPhase::Finished => write!(f, "FINISHED"),
        }
    }
}

/// The complete frame set.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "SCREAMING_SNAKE_CASE", rename_all_fields = "camelCase")]
pub enum Frame {
    /// First frame on an initiated link. `known_peers` seeds the acceptor's
    /// address book; `startup_time` breaks ties during duplicate detection.
    Handshake {
        from: String,
        port: u16,
        #[serde(default)]
        known_peers: Vec<PeerAddr>,
        #[serde(default)]
        startup_time: u64,
        #[serde(default, rename = "isGUI")]
        is_gui: bool,
    },

    /// Acceptor's reply, mirroring its own peer list back.
    HandshakeAck {
        from: String,
        port: u16,
        #[serde(default)]
        peers: Vec<PeerAddr>,
        #[serde(default)]
        startup_time: u64,
    },

    Heartbeat {
        from: String,
    },

    /// Ask a peer for its view of the mesh. Startup duplicate probes send
    /// this with `is_validation = true` under a transient validator id.
    PeerExchangeRequest {
        from: String,
        #[serde(default)]
        is_validation: bool,
    },

    PeerExchangeResponse {
        from: String,
        peers: Vec<PeerAddr>,
    },

    /// Sent to a link asserting an identity that is already ours.
    DuplicateNodeRejection {
        reason: String,
        existing_node_id: String,
    },

    /// Opens a round. `allowed_choices = None` accepts any choice string.
    RoundStart {
        round_id: String,
        topic: String,
        allowed_choices: Option<Vec<String>>,
        voting_time_seconds: u64,
        /// Unix milliseconds at the originator.
        start_time: u64,
        from: String,
    },

    /// A sealed ballot. Deliberately carries no `from` field.
    EncryptedVote {
        round_id: String,
        anonymous_vote_id: String,
        /// Hex-encoded AES-256-CBC ciphertext.
        encrypted_data: String,
        /// Hex-encoded 16-byte IV.
        iv: String,
        timestamp: u64,
        /// Content-keyed hash tag, see [`crate::sig`].
        signature: String,
    },

    /// Batched release of every key this node produced, shuffled.
    BatchVoteKeys {
        round_id: String,
        keys: Vec<VoteKeyEntry>,
        from: String,
    },

    /// Single-key release. Accepted defensively on ingress; normal operation
    /// only ever batches. Carries no `from`.
    VoteKey {
        round_id: String,
        anonymous_vote_id: String,
        key: String,
    },

    ResultProposal {
        round_id: String,
        results: Vec<TallyEntry>,
        vote_count: usize,
        from: String,
    },

    /// Periodic observer snapshot.
    StatusUpdate {
        node_id: String,
        peers: usize,
        peers_list: Vec<String>,
        round_topic: Option<String>,
        phase: Option<RoundPhase>,
        /// Seconds until the round's hard deadline.
        time_remaining: Option<u64>,
        encrypted_votes: usize,
        decrypted_votes: usize,
    },

    PhaseChange {
        round_id: String,
        phase: RoundPhase,
    },

    /// Ballot-count notification for observers. Count only, never content.
    VoteReceived {
        round_id: String,
        count: usize,
    },

    /// Final tally and participation stats for a finished round.
    Results {
        round_id: String,
        topic: String,
        results: Vec<TallyEntry>,
        vote_count: usize,
        participating_nodes: usize,
        active_nodes: usize,
        consensus: bool,
    },

    /// Observer-issued operator command.
    Command {
        command: String,
        #[serde(default)]
        args: Vec<String>,
    },

    CommandResponse {
        response: String,
    },
}

impl Frame {
    /// The wire tag of this frame.
    pub fn tag(&self) -> &'static str {
        match self {
            Frame::Handshake { .. } => "HANDSHAKE",
            Frame::HandshakeAck { .. } => "HANDSHAKE_ACK",
            Frame::Heartbeat { .. } => "HEARTBEAT",
            Frame::PeerExchangeRequest { .. } => "PEER_EXCHANGE_REQUEST",
            Frame::PeerExchangeResponse { .. } => "PEER_EXCHANGE_RESPONSE",
            Frame::DuplicateNodeRejection { .. } => "DUPLICATE_NODE_REJECTION",
            Frame::RoundStart { .. } => "ROUND_START",
            Frame::EncryptedVote { .. } => "ENCRYPTED_VOTE",
            Frame::BatchVoteKeys { .. } => "BATCH_VOTE_KEYS",
            Frame::VoteKey { .. } => "VOTE_KEY",
            Frame::ResultProposal { .. } => "RESULT_PROPOSAL",
            Frame::StatusUpdate { .. } => "STATUS_UPDATE",
            Frame::PhaseChange { .. } => "PHASE_CHANGE",
            Frame::VoteReceived { .. } => "VOTE_RECEIVED",
            Frame::Results { .. } => "RESULTS",
            Frame::Command { .. } => "COMMAND",
            Frame::CommandResponse { .. } => "COMMAND_RESPONSE",
        }
    }

    /// Whether a broadcast of this frame is also mirrored to observers.
    pub fn mirrors_to_observers(&self) -> bool {
        matches!(
            self,
            Frame::RoundStart { .. } | Frame::ResultProposal { .. } | Frame::EncryptedVote { .. }
        )
    }
}

/// Outcome of decoding one received line.
#[derive(Debug)]
pub enum DecodedFrame {
    Frame(Frame),
    /// Well-formed JSON with a `type` tag we do not speak.
    Unknown { tag: String },
    /// Not a usable frame at all. The link stays open; the frame is dropped.
    Malformed { error: String },
}

/// Encode a frame as its single-line wire form (no trailing newline).
pub fn encode_frame(frame: &Frame) -> Result<String, serde_json::Error> {
    serde_json::to_string(frame)
}

/// Decode one received line into a frame, an unknown tag, or a reject.
pub fn decode_frame(line: &str) -> DecodedFrame {
    match serde_json::from_str::<Frame>(line) {
        Ok(frame) => DecodedFrame::Frame(frame),
        Err(err) => match serde_json::from_str::<serde_json::Value>(line) {
            Ok(value) => match value.get("type").and_then(|t| t.as_str()) {
                Some(tag) if !KNOWN_TAGS.contains(&tag) => DecodedFrame::Unknown {
                    tag: tag.to_string(),
                },
                _ => DecodedFrame::Malformed {
                    error: err.to_string(),
                },
            },
            Err(_) => DecodedFrame::Malformed {
                error: err.to_string(),
            },
        },
    }
}

const KNOWN_TAGS: [&str; 17] = [
    "HANDSHAKE",
    "HANDSHAKE_ACK",
    "HEARTBEAT",
    "PEER_EXCHANGE_REQUEST",
    "PEER_EXCHANGE_RESPONSE",
    "DUPLICATE_NODE_REJECTION",
    "ROUND_START",
    "ENCRYPTED_VOTE",
    "BATCH_VOTE_KEYS",
    "VOTE_KEY",
    "RESULT_PROPOSAL",
    "STATUS_UPDATE",
    "PHASE_CHANGE",
    "VOTE_RECEIVED",
    "RESULTS",
    "COMMAND",
    "COMMAND_RESPONSE",
];
