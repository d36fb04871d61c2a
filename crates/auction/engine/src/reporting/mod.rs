//! Post-auction reporting
//!
//! Once winners are known, every level computes its post-auction signals,
//! fills in debug report URLs and resolves private aggregation requests.
//! The winning path then runs `reportResult` for the top-level seller, the
//! component seller when there is one, and `reportWin` for the bidder, in
//! that order, since each seller may pass signals on to the winner.

pub mod aggregation;
pub mod debug_url;
pub mod rounding;

use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use auction_types::{
    kanon_key_for_component, AdCurrency, AggregationContribution, AggregationRequest,
    AuctionConfig, BuyerReportType, EventContribution, Origin, PostAuctionSignals,
    ProtocolViolation, ReportBundle, ResolvedContribution, TopLevelSignals, WinningAd,
    WorkletError,
};
use serde_json::Value;
use tokio::time::Instant;
use tracing::debug;

use crate::admission::WorkerRole;
use crate::auction::{EngineContext, LevelOutcome};
use crate::random::RandomSource;
use crate::scoring::Candidate;
use crate::worklet::{
    BidderReportingBrowserSignals, ReportResultRequest, ReportWinRequest,
    SellerReportingBrowserSignals,
};

pub use aggregation::{resolve, route, BaseValues, Routing};
pub use debug_url::{substitute, DebugReportVars};
pub use rounding::round_stochastically;

/// What reporting produced for the caller
#[derive(Debug, Default)]
pub(crate) struct ReportingOutcome {
    pub winner: Option<WinningAd>,
    pub kanon_winner: Option<WinningAd>,
    pub kanon_keys_to_join: Vec<String>,
    pub reports: ReportBundle,
    pub errors: Vec<String>,
    pub bad_messages: Vec<ProtocolViolation>,
}

/// Currency a candidate's bid is reported in at a level.
fn candidate_currency(candidate: &Candidate, config: &AuctionConfig) -> Option<AdCurrency> {
    candidate.scored.bid.currency.clone().or_else(|| {
        let buyer = candidate
            .scored
            .component_seller
            .as_ref()
            .unwrap_or_else(|| candidate.scored.bid.owner());
        config.buyer_currency(buyer).cloned()
    })
}

/// Post-auction values of one level, rounded once for all its reports
struct LevelSignals {
    winning_bid: f64,
    winning_bid_currency: Option<AdCurrency>,
    winner_owner: Option<Origin>,
    highest_scoring_other_bid: f64,
    highest_scoring_other_bid_currency: Option<AdCurrency>,
    highest_scoring_other_owner: Option<Origin>,
    raw_winning_bid: f64,
    raw_highest_scoring_other_bid: f64,
}

impl LevelSignals {
    fn compute(
        outcome: &LevelOutcome,
        config: &AuctionConfig,
        bits: u32,
        random: &dyn RandomSource,
    ) -> Self {
        let winner = outcome.winner();
        let runner_up = outcome.main.runner_up.map(|i| &outcome.candidates[i]);

        let raw_winning_bid = winner.map(|c| c.scored.bid.value).unwrap_or(0.0);
        let (raw_hsob, hsob_currency) = match (runner_up, &config.seller_currency) {
            (None, _) => (0.0, None),
            (Some(r), Some(seller_currency)) => (
                r.scored.bid_in_seller_currency.unwrap_or(0.0),
                Some(seller_currency.clone()),
            ),
            (Some(r), None) => (r.scored.bid.value, candidate_currency(r, config)),
        };

        Self {
            winning_bid: round_stochastically(raw_winning_bid, bits, random),
            winning_bid_currency: winner.and_then(|c| candidate_currency(c, config)),
            winner_owner: winner.map(|c| c.record.bid.owner().clone()),
            highest_scoring_other_bid: round_stochastically(raw_hsob, bits, random),
            highest_scoring_other_bid_currency: hsob_currency,
            highest_scoring_other_owner: runner_up.map(|c| c.record.bid.owner().clone()),
            raw_winning_bid,
            raw_highest_scoring_other_bid: raw_hsob,
        }
    }

    /// Signals as seen by `viewer`, a bidder, or a seller when `None`.
    fn for_viewer(&self, viewer: Option<&Origin>) -> PostAuctionSignals {
        PostAuctionSignals {
            winning_bid: self.winning_bid,
            winning_bid_currency: self.winning_bid_currency.clone(),
            made_winning_bid: viewer.is_some() && self.winner_owner.as_ref() == viewer,
            highest_scoring_other_bid: self.highest_scoring_other_bid,
            highest_scoring_other_bid_currency: self.highest_scoring_other_bid_currency.clone(),
            made_highest_scoring_other_bid: viewer.is_some()
                && self.highest_scoring_other_owner.as_ref() == viewer,
        }
    }

    fn base_values(&self) -> BaseValues {
        BaseValues {
            winning_bid: self.raw_winning_bid,
            highest_scoring_other_bid: self.raw_highest_scoring_other_bid,
            ..Default::default()
        }
    }
}

/// One level prepared for reporting
struct LevelView<'a> {
    outcome: &'a LevelOutcome,
    config: Arc<AuctionConfig>,
    component_index: Option<usize>,
    signals: LevelSignals,
}

impl<'a> LevelView<'a> {
    fn new(
        outcome: &'a LevelOutcome,
        component_index: Option<usize>,
        bits: u32,
        random: &dyn RandomSource,
    ) -> Self {
        let config = outcome.config();
        let signals = LevelSignals::compute(outcome, &config, bits, random);
        Self {
            outcome,
            config,
            component_index,
            signals,
        }
    }
}

/// The final winner, and where it came from
#[derive(Clone, Copy, Debug, Default)]
struct WinnerPath {
    top: Option<usize>,
    component: Option<(usize, usize)>,
}

impl WinnerPath {
    fn of(top: &LevelOutcome) -> Self {
        let top_index = top.main.winner;
        Self {
            top: top_index,
            component: top_index.and_then(|i| top.candidates[i].component),
        }
    }

    fn won(&self, view: &LevelView<'_>, index: usize) -> bool {
        match view.component_index {
            None => self.top == Some(index),
            Some(component) => self.component == Some((component, index)),
        }
    }
}

/// Run all reporting for a finished auction.
pub(crate) async fn run_reporting(
    engine: &EngineContext,
    top_window_origin: &Origin,
    top: &LevelOutcome,
) -> ReportingOutcome {
    let random = engine.deps.random.as_ref();
    let bits = engine.config.reporting.rounding_bits;
    let top_view = LevelView::new(top, None, bits, random);
    let component_views: Vec<LevelView<'_>> = top
        .components
        .iter()
        .enumerate()
        .filter(|(_, c)| !c.seller_failed)
        .map(|(i, c)| LevelView::new(c, Some(i), bits, random))
        .collect();
    let path = WinnerPath::of(top);

    let mut reporter = Reporter {
        engine,
        top_window_origin,
        top: &top_view,
        out: ReportingOutcome::default(),
    };
    for view in std::iter::once(&top_view).chain(component_views.iter()) {
        reporter.debug_reports(view, &path);
        reporter.private_aggregation(view, &path);
        reporter.buyer_reports(view);
    }

    if let Some(top_index) = path.top {
        let component = path.component.and_then(|(ci, index)| {
            component_views
                .iter()
                .find(|v| v.component_index == Some(ci))
                .map(|v| (v, index))
        });
        reporter.report_winner(top_index, component).await;

        let winner = &top.candidates[top_index];
        let group = &winner.record.group;
        let mut keys = vec![group.kanon_key_for_ad(&winner.scored.bid.ad.url)];
        keys.extend(
            winner
                .scored
                .bid
                .ad_components
                .iter()
                .map(|c| kanon_key_for_component(&c.url)),
        );
        reporter.out.kanon_keys_to_join = keys;
        reporter.out.winner = Some(winning_ad(winner, &top_view.config));
    }
    reporter.out.kanon_winner = top.kanon_winner().map(|c| winning_ad(c, &top_view.config));
    reporter.out
}

fn winning_ad(candidate: &Candidate, config: &AuctionConfig) -> WinningAd {
    let bid = &candidate.scored.bid;
    WinningAd {
        interest_group: bid.interest_group.clone(),
        render_url: bid.ad.url.clone(),
        ad_components: bid.ad_components.iter().map(|c| c.url.clone()).collect(),
        ad_metadata: bid.ad_metadata.clone(),
        bid: bid.value,
        bid_currency: candidate_currency(candidate, config),
        component_seller: candidate.scored.component_seller.clone(),
    }
}

struct Reporter<'a> {
    engine: &'a EngineContext,
    top_window_origin: &'a Origin,
    top: &'a LevelView<'a>,
    out: ReportingOutcome,
}

impl Reporter<'_> {
    fn top_level_signals(
        &self,
        viewer: Option<&Origin>,
        made_winning_bid: Option<bool>,
    ) -> TopLevelSignals {
        let signals = &self.top.signals;
        TopLevelSignals {
            winning_bid: signals.winning_bid,
            winning_bid_currency: signals.winning_bid_currency.clone(),
            made_winning_bid: made_winning_bid.unwrap_or_else(|| {
                viewer.is_some() && signals.winner_owner.as_ref() == viewer
            }),
        }
    }

    fn push_debug(&mut self, url: Option<&String>, vars: &DebugReportVars, won: bool) {
        let Some(url) = url else {
            return;
        };
        let url = substitute(url, vars);
        if won {
            self.out.reports.debug_win_report_urls.push(url);
        } else {
            self.out.reports.debug_loss_report_urls.push(url);
        }
    }

    fn debug_reports(&mut self, view: &LevelView<'_>, path: &WinnerPath) {
        let component_won = view
            .component_index
            .map(|ci| path.component.map(|(c, _)| c) == Some(ci));
        for (index, candidate) in view.outcome.candidates.iter().enumerate() {
            if !view.outcome.in_main_track(candidate) {
                continue;
            }
            let won = path.won(view, index);

            if candidate.component.is_none() {
                let owner = candidate.record.bid.owner();
                let mut vars = DebugReportVars::new(&view.signals.for_viewer(Some(owner)));
                if !won {
                    vars = vars.with_reject_reason(candidate.scored.reject_reason);
                }
                if view.component_index.is_some() {
                    vars = vars.with_top_level(&self.top_level_signals(Some(owner), None));
                }
                let debug = &candidate.record.debug;
                let url = if won { debug.win.as_ref() } else { debug.loss.as_ref() };
                self.push_debug(url, &vars, won);
            }

            let mut vars = DebugReportVars::new(&view.signals.for_viewer(None));
            if view.component_index.is_some() {
                vars = vars.with_top_level(&self.top_level_signals(None, component_won));
            }
            let debug = &candidate.seller_debug;
            let url = if won { debug.win.as_ref() } else { debug.loss.as_ref() };
            self.push_debug(url, &vars, won);
        }
    }

    fn contribute(
        &mut self,
        origin: &Origin,
        requests: &[AggregationRequest],
        base: &BaseValues,
        won: bool,
    ) {
        for request in requests {
            let Some(contribution) = resolve(request, base) else {
                continue;
            };
            match route(&request.event, won) {
                Routing::Report => {
                    self.out.reports.private_aggregation.push(ResolvedContribution {
                        reporting_origin: origin.clone(),
                        contribution,
                        debug_mode: request.debug_mode,
                    })
                }
                Routing::Event(event) => {
                    self.out.reports.event_contributions.push(EventContribution {
                        reporting_origin: origin.clone(),
                        event,
                        contribution,
                    })
                }
                Routing::Drop => {}
            }
        }
    }

    fn private_aggregation(&mut self, view: &LevelView<'_>, path: &WinnerPath) {
        let level_base = view.signals.base_values();
        for (index, candidate) in view.outcome.candidates.iter().enumerate() {
            if !view.outcome.in_main_track(candidate) {
                continue;
            }
            let won = path.won(view, index);
            let reject_reason = candidate.scored.reject_reason;

            if candidate.component.is_none() {
                let record = &candidate.record;
                let base = BaseValues {
                    script_run_time: Some(record.bid.bid_duration),
                    signals_fetch_time: Some(record.signals_fetch_time),
                    reject_reason: Some(reject_reason),
                    ..level_base
                };
                self.contribute(record.bid.owner(), &record.aggregation, &base, won);
            }

            let base = BaseValues {
                script_run_time: Some(candidate.scored.score_duration),
                signals_fetch_time: Some(candidate.scoring_signals_fetch_time),
                reject_reason: Some(reject_reason),
                ..level_base
            };
            self.contribute(&view.outcome.seller, &candidate.seller_aggregation, &base, won);
        }
    }

    /// Per-buyer statistics the seller asked to receive.
    fn buyer_reports(&mut self, view: &LevelView<'_>) {
        let config = &view.config;
        if config.auction_report_buyers.is_empty() {
            return;
        }
        for (buyer, key) in config
            .interest_group_buyers
            .iter()
            .zip(config.auction_report_buyer_keys.iter())
        {
            let Some(stats) = view.outcome.stats.buyers.get(buyer) else {
                continue;
            };
            for (kind, report) in &config.auction_report_buyers {
                let stat = match kind {
                    BuyerReportType::InterestGroupCount => stats.interest_groups as f64,
                    BuyerReportType::BidCount => stats.bids as f64,
                    BuyerReportType::TotalGenerateBidLatency => {
                        stats.total_generate_bid_latency.as_millis() as f64
                    }
                    BuyerReportType::TotalSignalsFetchLatency => {
                        stats.total_signals_fetch_latency.as_millis() as f64
                    }
                };
                let value = (stat * report.scale) as i32;
                if value <= 0 {
                    continue;
                }
                self.out.reports.private_aggregation.push(ResolvedContribution {
                    reporting_origin: view.outcome.seller.clone(),
                    contribution: AggregationContribution {
                        bucket: key.saturating_add(report.bucket),
                        value,
                    },
                    debug_mode: false,
                });
            }
        }
    }

    /// Record what a reporting worklet returned.
    fn collect(
        &mut self,
        origin: &Origin,
        report_url: Option<String>,
        beacons: HashMap<String, String>,
        requests: Vec<AggregationRequest>,
        base: BaseValues,
    ) {
        self.out.reports.report_urls.extend(report_url);
        if !beacons.is_empty() {
            self.out
                .reports
                .beacons
                .entry(origin.clone())
                .or_default()
                .extend(beacons);
        }
        let mut valid = Vec::with_capacity(requests.len());
        for request in requests {
            match request.check() {
                Ok(()) => valid.push(request),
                Err(reason) => self
                    .out
                    .bad_messages
                    .push(ProtocolViolation::InvalidAggregationRequest {
                        origin: origin.clone(),
                        reason,
                    }),
            }
        }
        self.contribute(origin, &valid, &base, true);
    }

    async fn report_winner(
        &mut self,
        top_index: usize,
        component: Option<(&LevelView<'_>, usize)>,
    ) {
        let top = self.top;
        let top_candidate = &top.outcome.candidates[top_index];
        let top_signals = self.report_result(top, top_candidate, None).await;

        let (bidder_view, bidder_candidate, signals_for_winner) = match component {
            Some((view, index)) => {
                let candidate = &view.outcome.candidates[index];
                let modified = candidate
                    .scored
                    .modified_bid
                    .as_ref()
                    .and_then(|m| m.value);
                let signals = self.report_result(view, candidate, modified).await;
                (view, candidate, signals)
            }
            None => (top, top_candidate, top_signals),
        };

        self.report_win(bidder_view, bidder_candidate, signals_for_winner)
            .await;
    }

    async fn report_result(
        &mut self,
        view: &LevelView<'_>,
        candidate: &Candidate,
        modified_bid: Option<f64>,
    ) -> Option<Value> {
        let engine = self.engine;
        let seller = &view.outcome.seller;
        let config = &view.config;
        let Some(url) = config.decision_logic_url.clone() else {
            return None;
        };
        let Some(slot) = engine.pool.acquire(WorkerRole::Seller, seller.clone()).await else {
            self.out
                .errors
                .push(format!("{} could not obtain a seller process", seller));
            return None;
        };
        let worklet = match engine.deps.worklets.load_seller(&slot, &url).await {
            Ok(worklet) => worklet,
            Err(err) => {
                self.out.errors.push(err.to_string());
                return None;
            }
        };

        let random = engine.deps.random.as_ref();
        let bits = engine.config.reporting.rounding_bits;
        let signals = &view.signals;
        let request = ReportResultRequest {
            auction_config: Arc::clone(config),
            browser_signals: SellerReportingBrowserSignals {
                top_window_origin: self.top_window_origin.clone(),
                interest_group_owner: candidate.record.bid.owner().clone(),
                render_url: candidate.scored.bid.ad.url.clone(),
                bid: signals.winning_bid,
                bid_currency: signals.winning_bid_currency.clone(),
                desirability: round_stochastically(candidate.scored.desirability, bits, random),
                highest_scoring_other_bid: signals.highest_scoring_other_bid,
                highest_scoring_other_bid_currency: signals
                    .highest_scoring_other_bid_currency
                    .clone(),
                top_level_seller: view
                    .component_index
                    .map(|_| self.top.outcome.seller.clone()),
                component_seller: candidate.scored.component_seller.clone(),
                modified_bid: modified_bid.map(|v| round_stochastically(v, bits, random)),
                data_version: candidate.scored.scoring_signals_data_version,
            },
            direct_from_seller_signals: config
                .direct_from_seller_signals
                .value()
                .and_then(|d| d.as_ref())
                .and_then(|d| d.seller_signals.clone()),
        };

        let max_timeout = engine.config.scoring.max_seller_timeout();
        let timeout = config
            .seller_timeout
            .map(|t| t.min(max_timeout))
            .unwrap_or(max_timeout);
        let label = format!("{} reportResult()", url);
        let (output, elapsed) = self
            .call(worklet.report_result(request), timeout, &label)
            .await?;
        debug!(%seller, "reportResult finished");

        self.out.errors.extend(output.errors);
        let base = BaseValues {
            script_run_time: Some(elapsed),
            ..signals.base_values()
        };
        self.collect(seller, output.report_url, output.beacons, output.aggregation_requests, base);
        output.signals_for_winner
    }

    async fn report_win(
        &mut self,
        view: &LevelView<'_>,
        candidate: &Candidate,
        signals_for_winner: Option<Value>,
    ) {
        let engine = self.engine;
        let record = &candidate.record;
        let group = &record.group;
        let owner = &group.owner;
        let Some(url) = group.bidding_url.clone() else {
            return;
        };
        let Some(slot) = engine.pool.acquire(WorkerRole::Bidder, owner.clone()).await else {
            self.out
                .errors
                .push(format!("{} could not obtain a bidder process", owner));
            return;
        };
        let worklet = match engine.deps.worklets.load_bidder(&slot, &url).await {
            Ok(worklet) => worklet,
            Err(err) => {
                self.out.errors.push(err.to_string());
                return;
            }
        };

        let config = &view.config;
        let signals = &view.signals;
        let request = ReportWinRequest {
            auction_signals: config.auction_signals.value().cloned().flatten(),
            per_buyer_signals: config.per_buyer_signals_for(owner).cloned(),
            signals_for_winner,
            browser_signals: BidderReportingBrowserSignals {
                top_window_origin: self.top_window_origin.clone(),
                interest_group_owner: owner.clone(),
                interest_group_name: group.name.clone(),
                render_url: record.bid.ad.url.clone(),
                bid: signals.winning_bid,
                bid_currency: record
                    .bid
                    .currency
                    .clone()
                    .or_else(|| record.buyer_currency.clone()),
                highest_scoring_other_bid: signals.highest_scoring_other_bid,
                highest_scoring_other_bid_currency: signals
                    .highest_scoring_other_bid_currency
                    .clone(),
                made_highest_scoring_other_bid: signals.highest_scoring_other_owner.as_ref()
                    == Some(owner),
                seller: view.outcome.seller.clone(),
                top_level_seller: view
                    .component_index
                    .map(|_| self.top.outcome.seller.clone()),
                ad_cost: record.bid.ad_cost,
                modeling_signals: record.bid.modeling_signals,
                join_count: group.browser_signals.join_count,
                data_version: record.data_version,
            },
            direct_from_seller_signals: config
                .direct_from_seller_signals
                .value()
                .and_then(|d| d.as_ref())
                .and_then(|d| d.for_buyer(owner))
                .cloned(),
        };

        let timeout = engine.config.bidding.max_per_buyer_timeout();
        let label = format!("{} reportWin()", url);
        let Some((output, elapsed)) = self.call(worklet.report_win(request), timeout, &label).await
        else {
            return;
        };
        debug!(%owner, "reportWin finished");

        self.out.errors.extend(output.errors);
        let base = BaseValues {
            script_run_time: Some(elapsed),
            ..signals.base_values()
        };
        self.collect(owner, output.report_url, output.beacons, output.aggregation_requests, base);
    }

    async fn call<T>(
        &mut self,
        call: impl Future<Output = Result<T, WorkletError>>,
        timeout: Duration,
        label: &str,
    ) -> Option<(T, Duration)> {
        let started = Instant::now();
        match tokio::time::timeout(timeout, call).await {
            Err(_) => {
                self.out.errors.push(format!("{} timed out.", label));
                None
            }
            Ok(Err(err)) => {
                self.out.errors.push(format!("{} failed: {}", label, err));
                None
            }
            Ok(Ok(output)) => Some((output, started.elapsed())),
        }
    }
}
