//! Worklet call contracts
//!
//! Requests the engine sends to bidder and seller worklets, and the outputs
//! it expects back. Worklets report non-fatal script problems through the
//! `errors` list of each output; a crash is an `Err` from the call itself.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use auction_types::{
    AdCurrency, AdDescriptor, AggregationRequest, AuctionConfig, ComponentModifiedBid,
    InterestGroup, Origin, PreviousWin, RejectReason,
};
use serde_json::Value;

/// Browser-provided context for `generateBid`
#[derive(Clone, Debug)]
pub struct BidderBrowserSignals {
    pub top_window_origin: Origin,
    pub seller: Origin,
    pub top_level_seller: Option<Origin>,
    pub join_count: u32,
    pub bid_count: u32,
    pub prev_wins: Vec<PreviousWin>,
}

#[derive(Clone, Debug)]
pub struct GenerateBidRequest {
    /// The group, restricted to k-anonymous ads when `restrict_to_kanon_ads`.
    pub interest_group: Arc<InterestGroup>,
    pub auction_signals: Option<Value>,
    pub per_buyer_signals: Option<Value>,
    pub trusted_bidding_signals: Option<HashMap<String, Value>>,
    pub trusted_bidding_signals_data_version: Option<u32>,
    pub direct_from_seller_signals: Option<Value>,
    pub browser_signals: BidderBrowserSignals,
    pub per_buyer_timeout: Duration,
    pub expected_currency: Option<AdCurrency>,
    pub restrict_to_kanon_ads: bool,
}

/// Bid as returned by the script, before validation
#[derive(Clone, Debug, PartialEq)]
pub struct GeneratedBid {
    pub value: f64,
    pub currency: Option<AdCurrency>,
    pub ad: AdDescriptor,
    pub ad_components: Vec<AdDescriptor>,
    pub ad_metadata: Option<String>,
    pub ad_cost: Option<f64>,
    pub modeling_signals: Option<u16>,
    pub allow_component_auction: bool,
}

impl GeneratedBid {
    pub fn new(value: f64, render_url: impl Into<String>) -> Self {
        Self {
            value,
            currency: None,
            ad: AdDescriptor::new(render_url),
            ad_components: Vec::new(),
            ad_metadata: None,
            ad_cost: None,
            modeling_signals: None,
            allow_component_auction: true,
        }
    }
}

#[derive(Clone, Debug, Default)]
pub struct GenerateBidOutput {
    pub bid: Option<GeneratedBid>,
    pub debug_win_report_url: Option<String>,
    pub debug_loss_report_url: Option<String>,
    /// New base priority for the group, applied after the auction.
    pub set_priority: Option<f64>,
    pub aggregation_requests: Vec<AggregationRequest>,
    pub errors: Vec<String>,
}

/// Browser-provided context for `scoreAd`
#[derive(Clone, Debug)]
pub struct ScoringBrowserSignals {
    pub top_window_origin: Origin,
    pub interest_group_owner: Origin,
    pub render_url: String,
    pub ad_components: Vec<String>,
    pub bid_currency: Option<AdCurrency>,
    pub bidding_duration: Duration,
    pub data_version: Option<u32>,
    /// Set when scoring the winner of a component auction.
    pub component_seller: Option<Origin>,
    /// Set when scoring inside a component auction.
    pub top_level_seller: Option<Origin>,
}

#[derive(Clone, Debug)]
pub struct ScoreAdRequest {
    pub ad_metadata: Option<String>,
    pub bid: f64,
    pub auction_config: Arc<AuctionConfig>,
    pub trusted_scoring_signals: Option<HashMap<String, Value>>,
    pub browser_signals: ScoringBrowserSignals,
    pub seller_timeout: Duration,
}

#[derive(Clone, Debug, Default)]
pub struct ScoreAdOutput {
    pub desirability: f64,
    pub allow_component_auction: bool,
    pub reject_reason: RejectReason,
    pub modified_bid: Option<ComponentModifiedBid>,
    pub bid_in_seller_currency: Option<f64>,
    pub debug_win_report_url: Option<String>,
    pub debug_loss_report_url: Option<String>,
    pub aggregation_requests: Vec<AggregationRequest>,
    pub errors: Vec<String>,
}

/// Browser-provided context for `reportResult`. Bid values are rounded.
#[derive(Clone, Debug)]
pub struct SellerReportingBrowserSignals {
    pub top_window_origin: Origin,
    pub interest_group_owner: Origin,
    pub render_url: String,
    pub bid: f64,
    pub bid_currency: Option<AdCurrency>,
    pub desirability: f64,
    pub highest_scoring_other_bid: f64,
    pub highest_scoring_other_bid_currency: Option<AdCurrency>,
    pub top_level_seller: Option<Origin>,
    pub component_seller: Option<Origin>,
    /// Bid presented upward by a component seller.
    pub modified_bid: Option<f64>,
    pub data_version: Option<u32>,
}

#[derive(Clone, Debug)]
pub struct ReportResultRequest {
    pub auction_config: Arc<AuctionConfig>,
    pub browser_signals: SellerReportingBrowserSignals,
    pub direct_from_seller_signals: Option<Value>,
}

#[derive(Clone, Debug, Default)]
pub struct ReportResultOutput {
    /// Handed to the winning bidder's `reportWin`.
    pub signals_for_winner: Option<Value>,
    pub report_url: Option<String>,
    pub beacons: HashMap<String, String>,
    pub aggregation_requests: Vec<AggregationRequest>,
    pub errors: Vec<String>,
}

/// Browser-provided context for `reportWin`. Bid values are rounded.
#[derive(Clone, Debug)]
pub struct BidderReportingBrowserSignals {
    pub top_window_origin: Origin,
    pub interest_group_owner: Origin,
    pub interest_group_name: String,
    pub render_url: String,
    pub bid: f64,
    pub bid_currency: Option<AdCurrency>,
    pub highest_scoring_other_bid: f64,
    pub highest_scoring_other_bid_currency: Option<AdCurrency>,
    pub made_highest_scoring_other_bid: bool,
    pub seller: Origin,
    pub top_level_seller: Option<Origin>,
    pub ad_cost: Option<f64>,
    pub modeling_signals: Option<u16>,
    pub join_count: u32,
    pub data_version: Option<u32>,
}

#[derive(Clone, Debug)]
pub struct ReportWinRequest {
    pub auction_signals: Option<Value>,
    pub per_buyer_signals: Option<Value>,
    pub signals_for_winner: Option<Value>,
    pub browser_signals: BidderReportingBrowserSignals,
    pub direct_from_seller_signals: Option<Value>,
}

#[derive(Clone, Debug, Default)]
pub struct ReportWinOutput {
    pub report_url: Option<String>,
    pub beacons: HashMap<String, String>,
    pub aggregation_requests: Vec<AggregationRequest>,
    pub errors: Vec<String>,
}
