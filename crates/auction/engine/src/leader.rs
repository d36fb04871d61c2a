//! Winner selection
//!
//! The winner is drawn uniformly from every bid tied at the top score, and
//! the highest-scoring other bid is drawn uniformly from the bids tied at the
//! best score among the rest. Only bids scoring above zero take part.

use auction_types::{BidRole, KAnonMode};

use crate::random::RandomSource;

/// Result of one selection pass over a level's candidates
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct Selection {
    pub winner: Option<usize>,
    /// Representative of the highest-scoring other bid.
    pub runner_up: Option<usize>,
}

/// Select a winner and runner-up among `scores`.
///
/// `scores[i]` is `None` for candidates that are not eligible in this pass.
/// The winner is drawn before the runner-up.
pub fn select(scores: &[Option<f64>], random: &dyn RandomSource) -> Selection {
    let winner = pick_best(scores, None, random);
    let runner_up = winner.and_then(|w| pick_best(scores, Some(w), random));
    Selection { winner, runner_up }
}

fn pick_best(
    scores: &[Option<f64>],
    skip: Option<usize>,
    random: &dyn RandomSource,
) -> Option<usize> {
    let mut best = f64::NEG_INFINITY;
    let mut tied: Vec<usize> = Vec::new();
    for (i, score) in scores.iter().enumerate() {
        if Some(i) == skip {
            continue;
        }
        let Some(score) = score.filter(|s| *s > 0.0) else {
            continue;
        };
        if score > best {
            best = score;
            tied.clear();
            tied.push(i);
        } else if score == best {
            tied.push(i);
        }
    }
    match tied.len() {
        0 => None,
        1 => Some(tied[0]),
        n => Some(tied[random.uniform_index(n)]),
    }
}

/// Whether a bid competes for the real win under `mode`.
pub fn in_main_track(role: BidRole, mode: KAnonMode) -> bool {
    match mode {
        KAnonMode::Disabled => true,
        KAnonMode::Enforce => role.is_enforced(),
        KAnonMode::Simulate => role.is_unenforced(),
    }
}

/// Whether a bid competes in the k-anonymity enforced track.
pub fn in_kanon_track(role: BidRole) -> bool {
    role.is_enforced()
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use super::*;
    use crate::mocks::ScriptedRandom;
    use crate::random::SeededRandom;

    #[test]
    fn highest_score_wins() {
        let r = SeededRandom::new(0);
        let s = select(&[Some(1.0), Some(3.0), Some(2.0)], &r);
        assert_eq!(s, Selection { winner: Some(1), runner_up: Some(2) });
    }

    #[test]
    fn non_positive_and_ineligible_are_ignored() {
        let r = SeededRandom::new(0);
        let s = select(&[Some(0.0), None, Some(-1.0), Some(0.5)], &r);
        assert_eq!(s, Selection { winner: Some(3), runner_up: None });
        assert_eq!(select(&[Some(0.0), None], &r), Selection::default());
    }

    #[test]
    fn tie_losers_become_runner_up() {
        // First draw picks the winner among {0, 1}; the second picks the
        // runner-up among what is left.
        let r = ScriptedRandom::new(vec![1, 0]);
        let s = select(&[Some(5.0), Some(5.0), Some(1.0)], &r);
        assert_eq!(s, Selection { winner: Some(1), runner_up: Some(0) });
    }

    #[test]
    fn runner_up_ties_are_drawn() {
        let r = ScriptedRandom::new(vec![1]);
        let s = select(&[Some(9.0), Some(2.0), Some(2.0), Some(2.0)], &r);
        assert_eq!(s, Selection { winner: Some(0), runner_up: Some(2) });
    }

    #[test]
    fn ties_are_uniform() {
        let r = SeededRandom::new(99);
        let mut wins: HashMap<usize, u32> = HashMap::new();
        let scores = [Some(4.0), Some(4.0), Some(4.0), Some(1.0)];
        for _ in 0..6000 {
            *wins.entry(select(&scores, &r).winner.unwrap()).or_default() += 1;
        }
        assert!(!wins.contains_key(&3));
        for i in 0..3 {
            let n = wins[&i];
            assert!((1700..=2300).contains(&n), "bid {} won {} times", i, n);
        }
    }

    #[test]
    fn tracks_by_mode() {
        assert!(in_main_track(BidRole::Unenforced, KAnonMode::Disabled));
        assert!(!in_main_track(BidRole::Unenforced, KAnonMode::Enforce));
        assert!(in_main_track(BidRole::Both, KAnonMode::Enforce));
        assert!(in_main_track(BidRole::Unenforced, KAnonMode::Simulate));
        assert!(!in_main_track(BidRole::Enforced, KAnonMode::Simulate));
        assert!(in_kanon_track(BidRole::Enforced));
        assert!(!in_kanon_track(BidRole::Unenforced));
    }
}
