//! Bids and scores

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::currency::AdCurrency;
use crate::ids::{InterestGroupKey, Origin};
use crate::interest_group::AdSize;

/// How k-anonymity status affects which bids may win
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum KAnonMode {
    /// k-anonymity is ignored entirely.
    #[default]
    Disabled,
    /// Only k-anonymous ads may win.
    Enforce,
    /// Any ad may win; the enforced outcome is computed and recorded.
    Simulate,
}

/// Which k-anonymity track(s) a bid belongs to
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum BidRole {
    /// Produced without k-anonymity constraints.
    Unenforced,
    /// Produced under k-anonymity constraints.
    Enforced,
    /// Valid for both tracks.
    Both,
}

impl BidRole {
    pub fn is_enforced(&self) -> bool {
        matches!(self, Self::Enforced | Self::Both)
    }

    pub fn is_unenforced(&self) -> bool {
        matches!(self, Self::Unenforced | Self::Both)
    }
}

/// Render URL plus optional size chosen by a bid
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct AdDescriptor {
    pub url: String,
    pub size: Option<AdSize>,
}

impl AdDescriptor {
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            size: None,
        }
    }
}

/// A bid produced by `generateBid`
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Bid {
    pub interest_group: InterestGroupKey,
    pub role: BidRole,
    pub value: f64,
    pub currency: Option<AdCurrency>,
    pub ad: AdDescriptor,
    pub ad_components: Vec<AdDescriptor>,
    pub ad_metadata: Option<String>,
    pub ad_cost: Option<f64>,
    pub modeling_signals: Option<u16>,
    pub bid_duration: Duration,
}

impl Bid {
    pub fn owner(&self) -> &Origin {
        &self.interest_group.owner
    }
}

/// Reason a seller rejected a bid
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum RejectReason {
    #[default]
    NotAvailable,
    InvalidBid,
    BidBelowAuctionFloor,
    PendingApprovalByExchange,
    DisapprovedByExchange,
    BlockedByPublisher,
    LanguageExclusions,
    CategoryExclusions,
}

impl RejectReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::NotAvailable => "not-available",
            Self::InvalidBid => "invalid-bid",
            Self::BidBelowAuctionFloor => "bid-below-auction-floor",
            Self::PendingApprovalByExchange => "pending-approval-by-exchange",
            Self::DisapprovedByExchange => "disapproved-by-exchange",
            Self::BlockedByPublisher => "blocked-by-publisher",
            Self::LanguageExclusions => "language-exclusions",
            Self::CategoryExclusions => "category-exclusions",
        }
    }

    /// Numeric code used as the `bid-reject-reason` aggregation base value.
    pub fn code(&self) -> i32 {
        match self {
            Self::NotAvailable => 0,
            Self::InvalidBid => 1,
            Self::BidBelowAuctionFloor => 2,
            Self::PendingApprovalByExchange => 3,
            Self::DisapprovedByExchange => 4,
            Self::BlockedByPublisher => 5,
            Self::LanguageExclusions => 6,
            Self::CategoryExclusions => 7,
        }
    }
}

impl std::fmt::Display for RejectReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Replacement bid a component seller presents to the top-level seller
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct ComponentModifiedBid {
    pub ad_metadata: Option<String>,
    pub value: Option<f64>,
    pub currency: Option<AdCurrency>,
}

/// A bid after seller scoring
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ScoredBid {
    pub bid: Bid,
    pub desirability: f64,
    pub reject_reason: RejectReason,
    pub modified_bid: Option<ComponentModifiedBid>,
    pub bid_in_seller_currency: Option<f64>,
    pub scoring_signals_data_version: Option<u32>,
    pub score_duration: Duration,
    /// Set when this bid came up from a component auction.
    pub component_seller: Option<Origin>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn reject_reason_codes_and_names() {
        assert_eq!(RejectReason::default().as_str(), "not-available");
        assert_eq!(RejectReason::BidBelowAuctionFloor.code(), 2);
        assert_eq!(RejectReason::CategoryExclusions.code(), 7);
        let parsed: RejectReason = serde_json::from_str("\"blocked-by-publisher\"").unwrap();
        assert_eq!(parsed, RejectReason::BlockedByPublisher);
    }

    #[test]
    fn bid_role_tracks() {
        assert!(BidRole::Both.is_enforced() && BidRole::Both.is_unenforced());
        assert!(!BidRole::Unenforced.is_enforced());
        assert!(!BidRole::Enforced.is_unenforced());
    }

    #[test]
    fn kanon_mode_parses_lowercase() {
        let mode: KAnonMode = serde_json::from_str("\"simulate\"").unwrap();
        assert_eq!(mode, KAnonMode::Simulate);
        assert_eq!(KAnonMode::default(), KAnonMode::Disabled);
    }
}
