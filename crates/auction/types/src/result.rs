//! Auction results

use std::collections::HashMap;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::aggregation::{EventContribution, ResolvedContribution};
use crate::currency::AdCurrency;
use crate::ids::{AuctionId, InterestGroupKey, Origin};

/// How an auction ended
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum AuctionOutcome {
    Won,
    NoBids,
    /// The top-level seller failed to load or crashed.
    Failed,
    /// The caller aborted before a winner was selected.
    Aborted,
}

/// The ad chosen by an auction
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct WinningAd {
    pub interest_group: InterestGroupKey,
    pub render_url: String,
    pub ad_components: Vec<String>,
    pub ad_metadata: Option<String>,
    pub bid: f64,
    pub bid_currency: Option<AdCurrency>,
    /// Seller of the component auction the winner came through.
    pub component_seller: Option<Origin>,
}

/// Everything reporting produced for the caller to dispatch
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct ReportBundle {
    /// Win and result report URLs from `reportWin`/`reportResult`.
    pub report_urls: Vec<String>,
    pub debug_win_report_urls: Vec<String>,
    pub debug_loss_report_urls: Vec<String>,
    /// Beacon destination URLs keyed by event type, per reporting origin.
    pub beacons: HashMap<Origin, HashMap<String, String>>,
    pub private_aggregation: Vec<ResolvedContribution>,
    /// Custom-event contributions, sent only if the event later fires.
    pub event_contributions: Vec<EventContribution>,
}

/// Per-buyer participation counters
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct BuyerStats {
    pub interest_groups: u32,
    pub bids: u32,
    pub timeouts: u32,
    pub crashes: u32,
    pub total_generate_bid_latency: Duration,
    pub total_signals_fetch_latency: Duration,
}

/// Comparison of the unenforced and k-anonymity enforced bid tracks
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct KAnonTrackStats {
    /// Groups with an unenforced bid but no enforced bid.
    pub no_bid: u32,
    pub same_bid: u32,
    pub different_bid: u32,
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct AuctionStats {
    pub buyers: HashMap<Origin, BuyerStats>,
    pub kanon: KAnonTrackStats,
}

impl AuctionStats {
    pub fn buyer(&mut self, owner: &Origin) -> &mut BuyerStats {
        self.buyers.entry(owner.clone()).or_default()
    }

    /// Fold another level's counters into this one.
    pub fn merge(&mut self, other: AuctionStats) {
        for (owner, stats) in other.buyers {
            let entry = self.buyer(&owner);
            entry.interest_groups += stats.interest_groups;
            entry.bids += stats.bids;
            entry.timeouts += stats.timeouts;
            entry.crashes += stats.crashes;
            entry.total_generate_bid_latency += stats.total_generate_bid_latency;
            entry.total_signals_fetch_latency += stats.total_signals_fetch_latency;
        }
        self.kanon.no_bid += other.kanon.no_bid;
        self.kanon.same_bid += other.kanon.same_bid;
        self.kanon.different_bid += other.kanon.different_bid;
    }
}

/// Final result of one auction
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct AuctionResult {
    pub id: AuctionId,
    pub outcome: AuctionOutcome,
    pub winner: Option<WinningAd>,
    /// Winner under k-anonymity enforcement, when it was computed.
    pub kanon_winner: Option<WinningAd>,
    /// k-anonymity keys the winning group should join.
    pub kanon_keys_to_join: Vec<String>,
    pub manually_aborted: bool,
    pub errors: Vec<String>,
    /// Protocol violations by the caller or a worklet.
    pub bad_messages: Vec<String>,
    pub reports: ReportBundle,
    pub stats: AuctionStats,
}

impl AuctionResult {
    pub fn empty(id: AuctionId, outcome: AuctionOutcome) -> Self {
        Self {
            id,
            outcome,
            winner: None,
            kanon_winner: None,
            kanon_keys_to_join: Vec::new(),
            manually_aborted: outcome == AuctionOutcome::Aborted,
            errors: Vec::new(),
            bad_messages: Vec::new(),
            reports: ReportBundle::default(),
            stats: AuctionStats::default(),
        }
    }

    pub fn winning_group(&self) -> Option<&InterestGroupKey> {
        self.winner.as_ref().map(|w| &w.interest_group)
    }
}
