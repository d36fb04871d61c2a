//! Collaborator traits
//!
//! Everything outside the orchestration core is consumed through these
//! seams. In-crate implementations for tests live in [`crate::mocks`].

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use async_trait::async_trait;
use auction_types::{
    AdCurrency, FetchError, InterestGroup, InterestGroupKey, Origin, ServerResponseError,
    WorkletError,
};
use serde_json::Value;
use uuid::Uuid;

use crate::admission::SlotHandle;
use crate::worklet::{
    GenerateBidOutput, GenerateBidRequest, ReportResultOutput, ReportResultRequest,
    ReportWinOutput, ReportWinRequest, ScoreAdOutput, ScoreAdRequest,
};

/// A loaded bidder script.
#[async_trait]
pub trait BidderWorklet: Send + Sync {
    /// Run `generateBid`. `Err` means the worklet process died.
    async fn generate_bid(
        &self,
        request: GenerateBidRequest,
    ) -> Result<GenerateBidOutput, WorkletError>;

    /// Run `reportWin` for the winning group.
    async fn report_win(&self, request: ReportWinRequest) -> Result<ReportWinOutput, WorkletError>;
}

/// A loaded seller decision script.
#[async_trait]
pub trait SellerWorklet: Send + Sync {
    async fn score_ad(&self, request: ScoreAdRequest) -> Result<ScoreAdOutput, WorkletError>;

    async fn report_result(
        &self,
        request: ReportResultRequest,
    ) -> Result<ReportResultOutput, WorkletError>;
}

/// Loads worklets into granted worker processes.
///
/// A slot must be held to load; the worklet may only be used while the
/// caller keeps that slot.
#[async_trait]
pub trait WorkletHost: Send + Sync {
    async fn load_bidder(
        &self,
        slot: &SlotHandle,
        bidding_url: &str,
    ) -> Result<Arc<dyn BidderWorklet>, WorkletError>;

    async fn load_seller(
        &self,
        slot: &SlotHandle,
        decision_logic_url: &str,
    ) -> Result<Arc<dyn SellerWorklet>, WorkletError>;
}

/// Interest group storage and k-anonymity status.
#[async_trait]
pub trait InterestGroupStore: Send + Sync {
    /// Groups owned by `owner` that may bid in this auction.
    async fn interest_groups_for_owner(&self, owner: &Origin) -> Vec<InterestGroup>;

    /// The subset of `keys` currently authorized as k-anonymous.
    async fn kanon_authorized(&self, keys: &[String]) -> HashSet<String>;

    /// Increment the bid count of every listed group.
    async fn record_bids(&self, groups: &[InterestGroupKey]);

    /// Append a previous win to `group`.
    async fn record_win(&self, group: &InterestGroupKey, ad_json: String);

    /// Replace the base priority of `group`.
    async fn set_priority(&self, group: &InterestGroupKey, priority: f64);
}

/// Which worklet a signals fetch serves
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum SignalsKind {
    Bidding,
    Scoring,
}

/// One batched fetch against a trusted signals endpoint
#[derive(Clone, Debug, PartialEq)]
pub struct SignalsRequest {
    pub kind: SignalsKind,
    pub url: String,
    /// Bidding keys, or render URLs when scoring.
    pub keys: Vec<String>,
    /// Groups the fetch is made for. Empty when scoring.
    pub interest_group_names: Vec<String>,
}

/// Per-group data a bidding signals server may return
#[derive(Clone, Debug, Default, PartialEq)]
pub struct PerGroupSignals {
    pub priority_vector: Option<HashMap<String, f64>>,
}

#[derive(Clone, Debug, Default, PartialEq)]
pub struct SignalsResponse {
    pub values: HashMap<String, Value>,
    pub per_interest_group_data: HashMap<String, PerGroupSignals>,
    pub data_version: Option<u32>,
}

/// Fetches trusted bidding and scoring signals.
#[async_trait]
pub trait TrustedSignalsFetcher: Send + Sync {
    async fn fetch(&self, request: SignalsRequest) -> Result<SignalsResponse, FetchError>;
}

/// Reporting URLs carried by a server-side auction result
#[derive(Clone, Debug, Default, PartialEq)]
pub struct ServerReportingUrls {
    pub buyer_report_url: Option<String>,
    pub seller_report_url: Option<String>,
    pub component_seller_report_url: Option<String>,
}

/// Decoded contents of an encrypted server auction response
#[derive(Clone, Debug, PartialEq)]
pub struct DecodedServerResponse {
    /// Padding response with no auction result.
    pub is_chaff: bool,
    pub seller: Origin,
    pub interest_group: Option<InterestGroupKey>,
    pub render_url: Option<String>,
    pub ad_components: Vec<String>,
    pub bid: Option<f64>,
    pub bid_currency: Option<AdCurrency>,
    pub component_seller: Option<Origin>,
    pub reporting: ServerReportingUrls,
    pub errors: Vec<String>,
}

/// Decrypts and decodes server-side auction responses.
#[async_trait]
pub trait ServerResponseDecoder: Send + Sync {
    async fn decode(
        &self,
        request_id: Uuid,
        response: &[u8],
    ) -> Result<DecodedServerResponse, ServerResponseError>;
}
