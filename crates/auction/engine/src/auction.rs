//! Auction level orchestration
//!
//! A level is one seller's auction: its buyers' bids plus, at the top level,
//! the winners of its component auctions. Buyers, groups and component
//! auctions all run concurrently; each bid is scored as soon as it exists.

use std::sync::Arc;

use auction_types::{
    AuctionConfig, AuctionStats, Bid, BidRole, InterestGroupKey, KAnonMode, Origin,
    ProtocolViolation, WorkletError,
};
use chrono::Utc;
use futures::future::{join, join_all, BoxFuture, FutureExt};
use tracing::{debug, info};

use crate::admission::ProcessSlotPool;
use crate::bidding::{generate_bids, BuyerContext, GroupOutcome, KAnonComparison};
use crate::config::EngineConfig;
use crate::leader::{in_kanon_track, in_main_track, select, Selection};
use crate::priority::prioritize;
use crate::promise_gate::ConfigPromiseGate;
use crate::runner::EngineDeps;
use crate::scoring::{load_seller, score_bid, Candidate, Offer, ScoreOutcome, SellerLoad};
use crate::signals::BiddingSignalsBatcher;

/// Engine-wide state shared by every auction
pub(crate) struct EngineContext {
    pub config: EngineConfig,
    pub deps: EngineDeps,
    pub pool: ProcessSlotPool,
}

/// Debug report URLs returned by a worklet
#[derive(Clone, Debug, Default)]
pub(crate) struct DebugUrls {
    pub win: Option<String>,
    pub loss: Option<String>,
}

/// One seller's auction within a run
pub(crate) struct LevelContext {
    pub engine: Arc<EngineContext>,
    pub gate: Arc<ConfigPromiseGate>,
    pub seller: Origin,
    /// Set for component auctions.
    pub top_level_seller: Option<Origin>,
    pub top_window_origin: Origin,
    pub kanon_mode: KAnonMode,
}

impl LevelContext {
    pub fn top_level(
        engine: Arc<EngineContext>,
        gate: Arc<ConfigPromiseGate>,
        top_window_origin: Origin,
    ) -> Self {
        let kanon_mode = engine.config.kanon.mode;
        Self {
            seller: gate.snapshot().seller.clone(),
            engine,
            gate,
            top_level_seller: None,
            top_window_origin,
            kanon_mode,
        }
    }

    fn component(&self, gate: Arc<ConfigPromiseGate>) -> Self {
        Self {
            engine: Arc::clone(&self.engine),
            seller: gate.snapshot().seller.clone(),
            gate,
            top_level_seller: Some(self.seller.clone()),
            top_window_origin: self.top_window_origin.clone(),
            kanon_mode: self.kanon_mode,
        }
    }

    pub fn is_component(&self) -> bool {
        self.top_level_seller.is_some()
    }
}

/// Everything one level produced
pub(crate) struct LevelOutcome {
    pub seller: Origin,
    pub gate: Arc<ConfigPromiseGate>,
    pub candidates: Vec<Candidate>,
    pub main: Selection,
    /// Selection among k-anonymous bids; empty when k-anonymity is disabled.
    pub kanon: Selection,
    pub kanon_mode: KAnonMode,
    pub errors: Vec<String>,
    pub bad_messages: Vec<ProtocolViolation>,
    /// This level's own stats, components excluded.
    pub stats: AuctionStats,
    pub bidding_groups: Vec<InterestGroupKey>,
    pub priority_updates: Vec<(InterestGroupKey, f64)>,
    pub components: Vec<LevelOutcome>,
    pub seller_failed: bool,
}

impl LevelOutcome {
    fn new(level: &LevelContext) -> Self {
        Self {
            seller: level.seller.clone(),
            gate: Arc::clone(&level.gate),
            candidates: Vec::new(),
            main: Selection::default(),
            kanon: Selection::default(),
            kanon_mode: level.kanon_mode,
            errors: Vec::new(),
            bad_messages: Vec::new(),
            stats: AuctionStats::default(),
            bidding_groups: Vec::new(),
            priority_updates: Vec::new(),
            components: Vec::new(),
            seller_failed: false,
        }
    }

    pub fn config(&self) -> Arc<AuctionConfig> {
        self.gate.snapshot()
    }

    pub fn winner(&self) -> Option<&Candidate> {
        self.main.winner.map(|i| &self.candidates[i])
    }

    pub fn kanon_winner(&self) -> Option<&Candidate> {
        self.kanon.winner.map(|i| &self.candidates[i])
    }

    /// Whether the candidate competes for the real win.
    pub fn in_main_track(&self, candidate: &Candidate) -> bool {
        in_main_track(candidate.scored.bid.role, self.kanon_mode)
    }

    fn absorb_group(&mut self, owner: &Origin, group: GroupOutcome) {
        let stats = self.stats.buyer(owner);
        stats.interest_groups += 1;
        stats.bids += group
            .bids
            .iter()
            .filter(|r| in_main_track(r.bid.role, self.kanon_mode))
            .count() as u32;
        stats.timeouts += group.timed_out as u32;
        stats.crashes += group.crashed as u32;
        stats.total_generate_bid_latency += group.generate_latency;
        stats.total_signals_fetch_latency += group.fetch_latency;
        match group.kanon {
            Some(KAnonComparison::NoBid) => self.stats.kanon.no_bid += 1,
            Some(KAnonComparison::SameBid) => self.stats.kanon.same_bid += 1,
            Some(KAnonComparison::DifferentBid) => self.stats.kanon.different_bid += 1,
            None => {}
        }
        if let Some(record) = group.bids.first() {
            self.bidding_groups.push(record.bid.interest_group.clone());
        }
        self.priority_updates.extend(group.set_priority);
        self.errors.extend(group.errors);
        self.bad_messages.extend(group.bad_messages);
    }

    fn absorb_score(&mut self, score: ScoreOutcome, failure: &mut Option<WorkletError>) {
        self.errors.extend(score.errors);
        self.bad_messages.extend(score.bad_messages);
        if let Some(err) = score.seller_failure {
            failure.get_or_insert(err);
        }
        if let Some(candidate) = score.candidate {
            self.candidates.push(candidate);
        }
    }
}

/// Bid generation and scoring for one buyer
async fn run_buyer(
    level: &LevelContext,
    seller: &SellerLoad,
    config: &AuctionConfig,
    owner: Origin,
) -> Vec<(GroupOutcome, Vec<ScoreOutcome>)> {
    let engine = &level.engine;
    let groups = engine.deps.store.interest_groups_for_owner(&owner).await;
    let admitted = prioritize(
        groups,
        config,
        &owner,
        engine.config.bidding.default_group_limit,
        engine.deps.random.as_ref(),
        Utc::now(),
    );
    debug!(
        seller = %level.seller,
        buyer = %owner,
        groups = admitted.len(),
        "interest groups admitted"
    );

    let group_arcs: Vec<_> = admitted.iter().map(|p| Arc::clone(&p.group)).collect();
    let batcher = BiddingSignalsBatcher::new(Arc::clone(&engine.deps.signals), &group_arcs);
    let buyer = BuyerContext::new(owner, batcher);

    join_all(admitted.into_iter().map(|group| {
        let buyer = &buyer;
        async move {
            let outcome = generate_bids(level, buyer, group).await;
            let scores = join_all(outcome.bids.iter().map(|record| {
                let offer = Offer {
                    presented: record.bid.clone(),
                    record: Arc::clone(record),
                    component: None,
                };
                score_bid(level, seller, offer)
            }))
            .await;
            (outcome, scores)
        }
    }))
    .await
}

/// The bid a component auction's candidate becomes at the top level.
fn present_upward(candidate: &Candidate, component_config: &AuctionConfig) -> Bid {
    let mut bid = candidate.scored.bid.clone();
    if let Some(modified) = &candidate.scored.modified_bid {
        if let Some(value) = modified.value {
            bid.value = value;
            bid.currency = modified
                .currency
                .clone()
                .or_else(|| component_config.seller_currency.clone());
        }
        if modified.ad_metadata.is_some() {
            bid.ad_metadata = modified.ad_metadata.clone();
        }
    }
    bid
}

/// Run a component auction and score its winners at the parent level.
async fn run_component(
    parent: &LevelContext,
    seller: &SellerLoad,
    index: usize,
    gate: Arc<ConfigPromiseGate>,
) -> (LevelOutcome, Vec<ScoreOutcome>) {
    let child = Arc::new(parent.component(gate));
    let outcome = run_level(child, Vec::new()).await;
    if outcome.seller_failed {
        return (outcome, Vec::new());
    }

    let config = outcome.config();
    let mut presented: Vec<usize> = outcome.main.winner.into_iter().collect();
    if let Some(kanon) = outcome.kanon.winner.filter(|k| Some(*k) != outcome.main.winner) {
        presented.push(kanon);
    }
    let offers: Vec<Offer> = presented
        .into_iter()
        .map(|i| {
            let candidate = &outcome.candidates[i];
            Offer {
                presented: present_upward(candidate, &config),
                record: Arc::clone(&candidate.record),
                component: Some((index, i, outcome.seller.clone())),
            }
        })
        .collect();
    let scores = join_all(offers.into_iter().map(|offer| score_bid(parent, seller, offer))).await;
    (outcome, scores)
}

/// Run one level to completion: bidding, scoring and winner selection.
pub(crate) fn run_level(
    level: Arc<LevelContext>,
    components: Vec<Arc<ConfigPromiseGate>>,
) -> BoxFuture<'static, LevelOutcome> {
    async move {
        let config = level.gate.snapshot();
        let seller = load_seller(
            Arc::clone(&level.engine),
            level.seller.clone(),
            config.decision_logic_url.clone(),
        );

        let buyers = join_all(
            config
                .interest_group_buyers
                .iter()
                .map(|owner| run_buyer(&level, &seller, &config, owner.clone())),
        );
        let component_runs = join_all(
            components
                .into_iter()
                .enumerate()
                .map(|(i, gate)| run_component(&level, &seller, i, gate)),
        );
        let (buyer_results, component_results) = join(buyers, component_runs).await;

        let mut outcome = LevelOutcome::new(&level);
        let mut failure = None;
        for (owner, groups) in config.interest_group_buyers.iter().zip(buyer_results) {
            for (group, scores) in groups {
                outcome.absorb_group(owner, group);
                for score in scores {
                    outcome.absorb_score(score, &mut failure);
                }
            }
        }
        for (component, scores) in component_results {
            outcome.components.push(component);
            for score in scores {
                outcome.absorb_score(score, &mut failure);
            }
        }

        if let Some(err) = failure {
            info!(seller = %level.seller, error = %err, "seller worklet failed; level abandoned");
            outcome.errors.push(err.to_string());
            outcome.candidates.clear();
            outcome.seller_failed = true;
            return outcome;
        }

        let random = level.engine.deps.random.as_ref();
        let mode = level.kanon_mode;
        let scores = |eligible: &dyn Fn(BidRole) -> bool| -> Vec<Option<f64>> {
            outcome
                .candidates
                .iter()
                .map(|c| eligible(c.scored.bid.role).then_some(c.scored.desirability))
                .collect()
        };
        let main_scores = scores(&|role| in_main_track(role, mode));
        let kanon_scores = (mode != KAnonMode::Disabled).then(|| scores(&in_kanon_track));
        outcome.main = select(&main_scores, random);
        if let Some(kanon_scores) = kanon_scores {
            outcome.kanon = select(&kanon_scores, random);
        }
        debug!(
            seller = %level.seller,
            candidates = outcome.candidates.len(),
            winner = ?outcome.main.winner,
            "level scored"
        );
        outcome
    }
    .boxed()
}
