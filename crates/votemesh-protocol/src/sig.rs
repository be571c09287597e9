//! Content-keyed hash tags for ballot frames.
//!
//! A ballot frame must not identify its caster, so its signature cannot
//! involve a node id. Instead it is a domain-tagged blake3 hash over the
//! frame's own content: round id, vote id, IV, ciphertext. Receivers verify
//! it on ingress and silently drop mismatches, which catches in-flight
//! corruption and naive tampering without breaking unlinkability.

/// Domain tag mixed into every ballot signature.
const BALLOT_DOMAIN: &str = "votemesh.ballot.v1";

/// Compute the hex signature of a sealed ballot's wire content.
pub fn ballot_signature(round_id: &str, vote_id: &str, iv: &str, encrypted_data: &str) -> String {
    let mut hasher = blake3::Hasher::new();
    hasher.update(BALLOT_DOMAIN.as_bytes());
    for part in [round_id, vote_id, iv, encrypted_data] {
        // Length-prefix each part so field boundaries cannot be shifted.
        hasher.update(&(part.len() as u64).to_le_bytes());
        hasher.update(part.as_bytes());
    }
    hex::encode(hasher.finalize().as_bytes())
}

/// Check a received ballot frame's signature against its content.
pub fn verify_ballot_signature(
    round_id: &str,
    vote_id: &str,
    iv: &str,
    encrypted_data: &str,
    signature: &str,
) -> bool {
    ballot_signature(round_id, vote_id, iv, encrypted_data) == signature
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn signature_verifies_own_content() {
        let sig = ballot_signature("round_1_alice", "ab".repeat(16).as_str(), "cd", "ef");
        assert!(verify_ballot_signature(
            "round_1_alice",
            "ab".repeat(16).as_str(),
            "cd",
            "ef",
            &sig
        ));
    }

    #[test]
    fn any_field_change_breaks_verification() {
        let sig = ballot_signature("round_1_alice", "id", "iv", "ct");
        assert!(!verify_ballot_signature("round_2_alice", "id", "iv", "ct", &sig));
        assert!(!verify_ballot_signature("round_1_alice", "xx", "iv", "ct", &sig));
        assert!(!verify_ballot_signature("round_1_alice", "id", "xx", "ct", &sig));
        assert!(!verify_ballot_signature("round_1_alice", "id", "iv", "xx", &sig));
    }

    #[test]
    fn field_boundaries_cannot_shift() {
        // Same concatenation, different split. Length prefixing must
        // distinguish them.
        let a = ballot_signature("r", "ab", "c", "d");
        let b = ballot_signature("r", "a", "bc", "d");
        assert_ne!(a, b);
    }
}
