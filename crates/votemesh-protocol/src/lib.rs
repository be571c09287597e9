//! Votemesh protocol logic.
//!
//! Everything a node needs to speak the anonymous-voting protocol, with no
//! I/O attached:
//!
//! - **Frames**: the complete tagged message set, one JSON object per line
//!   on the wire.
//! - **Ballots**: sealing a vote under a fresh symmetric key so it can be
//!   collected now and opened later, without ever naming its caster.
//! - **Signatures**: content-keyed hash tags for ballot frames.
//! - **Tally**: the deterministic ordered count every node must agree on.
//!
//! # Unlinkability
//!
//! The core property of the protocol lives here: a sealed ballot carries a
//! random 128-bit vote id and nothing else that identifies its origin. The
//! ballot frame has no sender field and its signature is keyed on content,
//! not identity. Keys are released later, batched and shuffled, so that
//! arrival order cannot be correlated either. See [`ballot`] for the known
//! limitation of this scheme.

pub mod ballot;
pub mod message;
pub mod sig;
pub mod tally;

mod error;

pub use ballot::{open_ballot, seal_ballot, BallotPlaintext, SealedBallot};
pub use error::ProtocolError;
pub use message::{decode_frame, encode_frame, DecodedFrame, Frame, PeerAddr, RoundPhase, VoteKeyEntry};
pub use sig::{ballot_signature, verify_ballot_signature};
pub use tally::{tally, TallyEntry};
