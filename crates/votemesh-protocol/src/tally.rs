//! Deterministic tallying.
//!
//! Every node must compute a bit-identical ordered result from the same
//! decrypted multiset, because result agreement is checked by element-wise
//! comparison. Choices are folded to lowercase, counted, and ordered by
//! count descending with the choice string ascending as the tie-break.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

/// One line of an ordered tally.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TallyEntry {
    pub choice: String,
    pub count: u64,
}

/// Count a multiset of choices into the canonical ordered tally.
pub fn tally<I, S>(choices: I) -> Vec<TallyEntry>
where
    I: IntoIterator<Item = S>,
    S: AsRef<str>,
{
    let mut counts: HashMap<String, u64> = HashMap::new();
    for choice in choices {
        *counts.entry(choice.as_ref().to_lowercase()).or_insert(0) += 1;
    }

    let mut entries: Vec<TallyEntry> = counts
        .into_iter()
        .map(|(choice, count)| TallyEntry { choice, count })
        .collect();

    entries.sort_by(|a, b| b.count.cmp(&a.count).then_with(|| a.choice.cmp(&b.choice)));
    entries
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entry(choice: &str, count: u64) -> TallyEntry {
        TallyEntry {
            choice: choice.to_string(),
            count,
        }
    }

    #[test]
    fn counts_and_orders_by_count_desc() {
        let result = tally(["yes", "no", "yes"]);
        assert_eq!(result, vec![entry("yes", 2), entry("no", 1)]);
    }

    #[test]
    fn ties_break_lexicographically() {
        let result = tally(["b", "a", "c", "a", "b"]);
        assert_eq!(result, vec![entry("a", 2), entry("b", 2), entry("c", 1)]);
    }

    #[test]
    fn choices_fold_to_lowercase() {
        let result = tally(["Yes", "YES", "no"]);
        assert_eq!(result, vec![entry("yes", 2), entry("no", 1)]);
    }

    #[test]
    fn identical_multisets_tally_identically() {
        // Determinism must hold regardless of insertion order.
        let a = tally(["x", "y", "z", "y"]);
        let b = tally(["y", "z", "y", "x"]);
        assert_eq!(a, b);
    }

    #[test]
    fn empty_input_yields_empty_tally() {
        let result = tally(std::iter::empty::<&str>());
        assert!(result.is_empty());
    }
}
