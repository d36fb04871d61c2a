//! Mock collaborators for tests and local runs

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use rand::rngs::StdRng;
use rand::{RngCore, SeedableRng};
use auction_types::{
    FetchError, InterestGroup, InterestGroupKey, Origin, ServerResponseError, WorkletError,
};
use uuid::Uuid;

use crate::admission::SlotHandle;
use crate::random::RandomSource;
use crate::traits::{
    BidderWorklet, DecodedServerResponse, InterestGroupStore, SellerWorklet, ServerResponseDecoder,
    SignalsRequest, SignalsResponse, TrustedSignalsFetcher, WorkletHost,
};
use crate::worklet::{
    GenerateBidOutput, GenerateBidRequest, GeneratedBid, ReportResultOutput, ReportResultRequest,
    ReportWinOutput, ReportWinRequest, ScoreAdOutput, ScoreAdRequest,
};

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

type GenerateFn =
    dyn Fn(&GenerateBidRequest) -> Result<GenerateBidOutput, WorkletError> + Send + Sync;
type ReportWinFn = dyn Fn(&ReportWinRequest) -> Result<ReportWinOutput, WorkletError> + Send + Sync;
type ScoreFn = dyn Fn(&ScoreAdRequest) -> Result<ScoreAdOutput, WorkletError> + Send + Sync;
type ReportResultFn =
    dyn Fn(&ReportResultRequest) -> Result<ReportResultOutput, WorkletError> + Send + Sync;

/// Scripted bidder worklet
pub struct MockBidderWorklet {
    generate: Box<GenerateFn>,
    report_win: Box<ReportWinFn>,
    delay: Option<Duration>,
    generate_calls: Mutex<Vec<GenerateBidRequest>>,
    report_win_calls: Mutex<Vec<ReportWinRequest>>,
}

impl MockBidderWorklet {
    /// Bidder that never bids.
    pub fn new() -> Self {
        Self::with_generate(|_| Ok(GenerateBidOutput::default()))
    }

    pub fn with_generate<F>(generate: F) -> Self
    where
        F: Fn(&GenerateBidRequest) -> Result<GenerateBidOutput, WorkletError>
            + Send
            + Sync
            + 'static,
    {
        Self {
            generate: Box::new(generate),
            report_win: Box::new(|_| Ok(ReportWinOutput::default())),
            delay: None,
            generate_calls: Mutex::new(Vec::new()),
            report_win_calls: Mutex::new(Vec::new()),
        }
    }

    /// Bid `value` on the group's first ad.
    pub fn fixed_bid(value: f64) -> Self {
        Self::with_generate(move |request| {
            let bid = request
                .interest_group
                .ads
                .first()
                .map(|ad| GeneratedBid::new(value, ad.render_url.clone()));
            Ok(GenerateBidOutput {
                bid,
                ..Default::default()
            })
        })
    }

    /// Worklet whose every call crashes.
    pub fn crashing() -> Self {
        Self::with_generate(|_| {
            Err(WorkletError::Crashed {
                reason: "bidder process exited".into(),
            })
        })
    }

    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    pub fn with_report_win<F>(mut self, report_win: F) -> Self
    where
        F: Fn(&ReportWinRequest) -> Result<ReportWinOutput, WorkletError> + Send + Sync + 'static,
    {
        self.report_win = Box::new(report_win);
        self
    }

    pub fn generate_calls(&self) -> Vec<GenerateBidRequest> {
        lock(&self.generate_calls).clone()
    }

    pub fn report_win_calls(&self) -> Vec<ReportWinRequest> {
        lock(&self.report_win_calls).clone()
    }
}

impl Default for MockBidderWorklet {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl BidderWorklet for MockBidderWorklet {
    async fn generate_bid(
        &self,
        request: GenerateBidRequest,
    ) -> Result<GenerateBidOutput, WorkletError> {
        lock(&self.generate_calls).push(request.clone());
        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }
        (self.generate)(&request)
    }

    async fn report_win(&self, request: ReportWinRequest) -> Result<ReportWinOutput, WorkletError> {
        lock(&self.report_win_calls).push(request.clone());
        (self.report_win)(&request)
    }
}

/// Scripted seller worklet
pub struct MockSellerWorklet {
    score: Box<ScoreFn>,
    report_result: Box<ReportResultFn>,
    delay: Option<Duration>,
    score_calls: Mutex<Vec<ScoreAdRequest>>,
    report_result_calls: Mutex<Vec<ReportResultRequest>>,
}

impl MockSellerWorklet {
    pub fn with_score<F>(score: F) -> Self
    where
        F: Fn(&ScoreAdRequest) -> Result<ScoreAdOutput, WorkletError> + Send + Sync + 'static,
    {
        Self {
            score: Box::new(score),
            report_result: Box::new(|_| Ok(ReportResultOutput::default())),
            delay: None,
            score_calls: Mutex::new(Vec::new()),
            report_result_calls: Mutex::new(Vec::new()),
        }
    }

    /// Desirability equals the bid.
    pub fn bid_as_score() -> Self {
        Self::scaled(1.0)
    }

    /// Desirability is the bid times `factor`.
    pub fn scaled(factor: f64) -> Self {
        Self::with_score(move |request| {
            Ok(ScoreAdOutput {
                desirability: request.bid * factor,
                allow_component_auction: true,
                ..Default::default()
            })
        })
    }

    pub fn crashing() -> Self {
        Self::with_score(|_| {
            Err(WorkletError::Crashed {
                reason: "seller process exited".into(),
            })
        })
    }

    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    pub fn with_report_result<F>(mut self, report_result: F) -> Self
    where
        F: Fn(&ReportResultRequest) -> Result<ReportResultOutput, WorkletError>
            + Send
            + Sync
            + 'static,
    {
        self.report_result = Box::new(report_result);
        self
    }

    pub fn score_calls(&self) -> Vec<ScoreAdRequest> {
        lock(&self.score_calls).clone()
    }

    pub fn report_result_calls(&self) -> Vec<ReportResultRequest> {
        lock(&self.report_result_calls).clone()
    }
}

impl Default for MockSellerWorklet {
    fn default() -> Self {
        Self::bid_as_score()
    }
}

#[async_trait]
impl SellerWorklet for MockSellerWorklet {
    async fn score_ad(&self, request: ScoreAdRequest) -> Result<ScoreAdOutput, WorkletError> {
        lock(&self.score_calls).push(request.clone());
        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }
        (self.score)(&request)
    }

    async fn report_result(
        &self,
        request: ReportResultRequest,
    ) -> Result<ReportResultOutput, WorkletError> {
        lock(&self.report_result_calls).push(request.clone());
        (self.report_result)(&request)
    }
}

/// Worklet host serving scripts by URL
#[derive(Default)]
pub struct MockWorkletHost {
    bidders: HashMap<String, Arc<dyn BidderWorklet>>,
    sellers: HashMap<String, Arc<dyn SellerWorklet>>,
    loads: Mutex<Vec<String>>,
}

impl MockWorkletHost {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_bidder(mut self, url: impl Into<String>, worklet: Arc<dyn BidderWorklet>) -> Self {
        self.bidders.insert(url.into(), worklet);
        self
    }

    pub fn with_seller(mut self, url: impl Into<String>, worklet: Arc<dyn SellerWorklet>) -> Self {
        self.sellers.insert(url.into(), worklet);
        self
    }

    /// URLs loaded so far, in load order.
    pub fn loads(&self) -> Vec<String> {
        lock(&self.loads).clone()
    }

    fn not_found(url: &str) -> WorkletError {
        WorkletError::LoadFailed {
            url: url.to_string(),
            reason: "script not found".into(),
        }
    }
}

#[async_trait]
impl WorkletHost for MockWorkletHost {
    async fn load_bidder(
        &self,
        _slot: &SlotHandle,
        bidding_url: &str,
    ) -> Result<Arc<dyn BidderWorklet>, WorkletError> {
        lock(&self.loads).push(bidding_url.to_string());
        self.bidders
            .get(bidding_url)
            .cloned()
            .ok_or_else(|| Self::not_found(bidding_url))
    }

    async fn load_seller(
        &self,
        _slot: &SlotHandle,
        decision_logic_url: &str,
    ) -> Result<Arc<dyn SellerWorklet>, WorkletError> {
        lock(&self.loads).push(decision_logic_url.to_string());
        self.sellers
            .get(decision_logic_url)
            .cloned()
            .ok_or_else(|| Self::not_found(decision_logic_url))
    }
}

/// In-memory interest group store
#[derive(Default)]
pub struct MockInterestGroupStore {
    groups: Mutex<HashMap<Origin, Vec<InterestGroup>>>,
    kanon: Mutex<HashSet<String>>,
    bids: Mutex<Vec<InterestGroupKey>>,
    wins: Mutex<Vec<(InterestGroupKey, String)>>,
    priorities: Mutex<Vec<(InterestGroupKey, f64)>>,
}

impl MockInterestGroupStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_group(self, group: InterestGroup) -> Self {
        lock(&self.groups)
            .entry(group.owner.clone())
            .or_default()
            .push(group);
        self
    }

    /// Mark a k-anonymity key as authorized.
    pub fn with_kanon_key(self, key: impl Into<String>) -> Self {
        lock(&self.kanon).insert(key.into());
        self
    }

    pub fn recorded_bids(&self) -> Vec<InterestGroupKey> {
        lock(&self.bids).clone()
    }

    pub fn recorded_wins(&self) -> Vec<(InterestGroupKey, String)> {
        lock(&self.wins).clone()
    }

    pub fn priority_updates(&self) -> Vec<(InterestGroupKey, f64)> {
        lock(&self.priorities).clone()
    }
}

#[async_trait]
impl InterestGroupStore for MockInterestGroupStore {
    async fn interest_groups_for_owner(&self, owner: &Origin) -> Vec<InterestGroup> {
        lock(&self.groups).get(owner).cloned().unwrap_or_default()
    }

    async fn kanon_authorized(&self, keys: &[String]) -> HashSet<String> {
        let authorized = lock(&self.kanon);
        keys.iter()
            .filter(|k| authorized.contains(*k))
            .cloned()
            .collect()
    }

    async fn record_bids(&self, groups: &[InterestGroupKey]) {
        lock(&self.bids).extend(groups.iter().cloned());
    }

    async fn record_win(&self, group: &InterestGroupKey, ad_json: String) {
        lock(&self.wins).push((group.clone(), ad_json));
    }

    async fn set_priority(&self, group: &InterestGroupKey, priority: f64) {
        lock(&self.priorities).push((group.clone(), priority));
    }
}

/// Signals fetcher answering from canned responses keyed by URL
#[derive(Default)]
pub struct MockSignalsFetcher {
    responses: HashMap<String, SignalsResponse>,
    delay: Option<Duration>,
    requests: Mutex<Vec<SignalsRequest>>,
}

impl MockSignalsFetcher {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_response(mut self, url: impl Into<String>, response: SignalsResponse) -> Self {
        self.responses.insert(url.into(), response);
        self
    }

    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    pub fn fetch_count(&self) -> usize {
        lock(&self.requests).len()
    }

    pub fn requests(&self) -> Vec<SignalsRequest> {
        lock(&self.requests).clone()
    }
}

#[async_trait]
impl TrustedSignalsFetcher for MockSignalsFetcher {
    async fn fetch(&self, request: SignalsRequest) -> Result<SignalsResponse, FetchError> {
        lock(&self.requests).push(request.clone());
        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }
        self.responses
            .get(&request.url)
            .cloned()
            .ok_or_else(|| FetchError::Network {
                url: request.url.clone(),
                reason: "connection refused".into(),
            })
    }
}

/// Decoder returning a fixed result
pub struct MockServerResponseDecoder {
    result: Result<DecodedServerResponse, ServerResponseError>,
}

impl MockServerResponseDecoder {
    pub fn new(result: Result<DecodedServerResponse, ServerResponseError>) -> Self {
        Self { result }
    }
}

#[async_trait]
impl ServerResponseDecoder for MockServerResponseDecoder {
    async fn decode(
        &self,
        _request_id: Uuid,
        _response: &[u8],
    ) -> Result<DecodedServerResponse, ServerResponseError> {
        self.result.clone()
    }
}

/// Random source replaying scripted draws
///
/// Index draws pop from the script (taken modulo the bound) and fall back
/// to 0 once it runs out. Float draws always return `unit`.
pub struct ScriptedRandom {
    indices: Mutex<VecDeque<usize>>,
    unit: f64,
    /// Fixed-seed generator for shuffles.
    rng: Mutex<StdRng>,
}

impl ScriptedRandom {
    pub fn new(indices: Vec<usize>) -> Self {
        Self {
            indices: Mutex::new(indices.into()),
            unit: 0.5,
            rng: Mutex::new(StdRng::seed_from_u64(0)),
        }
    }

    pub fn with_unit(mut self, unit: f64) -> Self {
        self.unit = unit;
        self
    }
}

impl Default for ScriptedRandom {
    fn default() -> Self {
        Self::new(Vec::new())
    }
}

impl RandomSource for ScriptedRandom {
    fn uniform_index(&self, bound: usize) -> usize {
        lock(&self.indices).pop_front().unwrap_or(0) % bound.max(1)
    }

    fn unit_f64(&self) -> f64 {
        self.unit
    }

    fn with_rng(&self, f: &mut dyn FnMut(&mut dyn RngCore)) {
        f(&mut *lock(&self.rng))
    }
}
