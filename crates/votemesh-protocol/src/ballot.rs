//! Ballot sealing and opening.
//!
//! One ballot is the AES-256-CBC/PKCS#7 encryption of the plaintext record
//! `{choice, anonymousVoteId, timestamp, roundId}` under a fresh 32-byte key
//! and 16-byte IV. The record carries no voter field; the random 128-bit
//! vote id is the only identifier that survives into the tally.
//!
//! Keys never leave the sealing node until the aggregation phase, when they
//! are released in a shuffled batch.
//!
//! # Known limitation
//!
//! The node that sealed a ballot holds its only key, so at release time it
//! could substitute a key that opens to a different plaintext. The protocol
//! does not publish a plaintext commitment alongside the ciphertext, so this
//! substitution is undetectable by design of the current wire contract. The
//! consensus check bounds the damage: a substituted ballot changes every
//! node's tally identically, it cannot target a single victim.

use aes::cipher::{block_padding::Pkcs7, BlockDecryptMut, BlockEncryptMut, KeyIvInit};
use rand::RngCore;
use serde::{Deserialize, Serialize};

use crate::error::ProtocolError;
use crate::sig::ballot_signature;

type Aes256CbcEnc = cbc::Encryptor<aes::Aes256>;
type Aes256CbcDec = cbc::Decryptor<aes::Aes256>;

/// Ballot key length in bytes (AES-256).
pub const KEY_LEN: usize = 32;
/// IV length in bytes (AES block size).
pub const IV_LEN: usize = 16;
/// Anonymous vote id length in bytes before hex rendering.
pub const VOTE_ID_LEN: usize = 16;

/// The record sealed inside a ballot. No voter field, ever.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BallotPlaintext {
    pub choice: String,
    pub anonymous_vote_id: String,
    pub timestamp: u64,
    pub round_id: String,
}

/// A sealed ballot ready to travel in an `ENCRYPTED_VOTE` frame.
#[derive(Debug, Clone)]
pub struct SealedBallot {
    pub anonymous_vote_id: String,
    /// Hex-encoded ciphertext.
    pub encrypted_data: String,
    /// Hex-encoded IV.
    pub iv: String,
    pub signature: String,
    /// The key, hex-encoded. Held locally until the aggregation phase.
    pub key: String,
}

/// Generate a fresh anonymous vote id: 16 random bytes, hex-rendered.
pub fn new_vote_id() -> String {
    let mut id = [0u8; VOTE_ID_LEN];
    rand::thread_rng().fill_bytes(&mut id);
    hex::encode(id)
}

/// Seal `choice` into a ballot for `round_id` under fresh key material.
pub fn seal_ballot(
    round_id: &str,
    choice: &str,
    timestamp: u64,
) -> Result<SealedBallot, ProtocolError> {
    let mut key = [0u8; KEY_LEN];
    let mut iv = [0u8; IV_LEN];
    rand::thread_rng().fill_bytes(&mut key);
    rand::thread_rng().fill_bytes(&mut iv);

    let anonymous_vote_id = new_vote_id();
    let plaintext = BallotPlaintext {
        choice: choice.to_string(),
        anonymous_vote_id: anonymous_vote_id.clone(),
        timestamp,
        round_id: round_id.to_string(),
    };

    let serialized = serde_json::to_vec(&plaintext)?;
    let ciphertext =
        Aes256CbcEnc::new(&key.into(), &iv.into()).encrypt_padded_vec_mut::<Pkcs7>(&serialized);

    let encrypted_data = hex::encode(ciphertext);
    let iv_hex = hex::encode(iv);
    let signature = ballot_signature(round_id, &anonymous_vote_id, &iv_hex, &encrypted_data);

    Ok(SealedBallot {
        anonymous_vote_id,
        encrypted_data,
        iv: iv_hex,
        signature,
        key: hex::encode(key),
    })
}

/// Open a sealed ballot with its released key. Any corruption of the key,
/// IV, or ciphertext fails the unpad and yields [`ProtocolError::Open`].
pub fn open_ballot(
    encrypted_data: &str,
    iv: &str,
    key: &str,
) -> Result<BallotPlaintext, ProtocolError> {
    let key = decode_fixed::<KEY_LEN>("key", key)?;
    let iv = decode_fixed::<IV_LEN>("iv", iv)?;
    let ciphertext = hex::decode(encrypted_data)?;

    let plaintext = Aes256CbcDec::new(&key.into(), &iv.into())
        .decrypt_padded_vec_mut::<Pkcs7>(&ciphertext)
        .map_err(|_| ProtocolError::Open)?;

    Ok(serde_json::from_slice(&plaintext)?)
}

fn decode_fixed<const N: usize>(what: &'static str, hex_str: &str) -> Result<[u8; N], ProtocolError> {
    let bytes = hex::decode(hex_str)?;
    <[u8; N]>::try_from(bytes.as_slice()).map_err(|_| ProtocolError::Length {
        what,
        expected: N,
        got: bytes.len(),
    })
}
