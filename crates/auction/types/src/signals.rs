//! Post-auction signals disclosed to reporting

use serde::{Deserialize, Serialize};

use crate::currency::AdCurrency;

/// What one participant is allowed to learn about one auction level.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct PostAuctionSignals {
    pub winning_bid: f64,
    pub winning_bid_currency: Option<AdCurrency>,
    pub made_winning_bid: bool,
    pub highest_scoring_other_bid: f64,
    pub highest_scoring_other_bid_currency: Option<AdCurrency>,
    pub made_highest_scoring_other_bid: bool,
}

/// Top-level outcome shown to participants of a component auction
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct TopLevelSignals {
    pub winning_bid: f64,
    pub winning_bid_currency: Option<AdCurrency>,
    pub made_winning_bid: bool,
}
