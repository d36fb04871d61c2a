//! Bid generation for one interest group
//!
//! Each admitted group acquires a bidder process, fetches its trusted
//! signals, waits for the config fields bidders depend on and runs
//! `generateBid`. With k-anonymity active a second, restricted run is made
//! when the first bid is not k-anonymous. Every group of a buyer shares that
//! buyer's cumulative timeout, which starts when its first group is granted a
//! process.

use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, OnceLock};
use std::time::Duration;

use auction_types::{
    currencies_match, currency_code, kanon_key_for_component, AdCurrency, AggregationRequest,
    AuctionConfig, Bid, BidRole, ConfigField, InterestGroup, InterestGroupKey, KAnonMode, Origin,
    ProtocolViolation, WorkletError,
};
use chrono::Utc;
use tokio::time::Instant;
use tracing::{debug, warn};

use crate::admission::{SlotHandle, WorkerRole};
use crate::auction::{DebugUrls, LevelContext};
use crate::priority::{reprioritize, PrioritizedGroup};
use crate::signals::{BiddingSignalsBatcher, GroupSignals};
use crate::traits::BidderWorklet;
use crate::worklet::{BidderBrowserSignals, GenerateBidOutput, GenerateBidRequest};

/// A validated bid and everything reporting later needs about it
#[derive(Debug)]
pub(crate) struct BidRecord {
    pub bid: Bid,
    /// The full group, even when the bid came from a restricted run.
    pub group: Arc<InterestGroup>,
    pub debug: DebugUrls,
    pub aggregation: Vec<AggregationRequest>,
    pub signals_fetch_time: Duration,
    pub data_version: Option<u32>,
    /// The level's expected currency for this buyer.
    pub buyer_currency: Option<AdCurrency>,
}

/// How the k-anonymous bid compared to the unrestricted one
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum KAnonComparison {
    NoBid,
    SameBid,
    DifferentBid,
}

/// Everything one group produced
#[derive(Debug, Default)]
pub(crate) struct GroupOutcome {
    pub bids: Vec<Arc<BidRecord>>,
    pub errors: Vec<String>,
    pub bad_messages: Vec<ProtocolViolation>,
    pub timed_out: bool,
    pub crashed: bool,
    pub generate_latency: Duration,
    pub fetch_latency: Duration,
    pub kanon: Option<KAnonComparison>,
    pub set_priority: Option<(InterestGroupKey, f64)>,
}

/// Per-buyer state shared by all of a buyer's groups in one level
pub(crate) struct BuyerContext {
    pub owner: Origin,
    pub batcher: BiddingSignalsBatcher,
    budget_start: OnceLock<Instant>,
    timeout_reported: AtomicBool,
}

impl BuyerContext {
    pub fn new(owner: Origin, batcher: BiddingSignalsBatcher) -> Self {
        Self {
            owner,
            batcher,
            budget_start: OnceLock::new(),
            timeout_reported: AtomicBool::new(false),
        }
    }
}

/// Run bid generation for one admitted group under its buyer's budget.
pub(crate) async fn generate_bids(
    level: &LevelContext,
    buyer: &BuyerContext,
    admitted: PrioritizedGroup,
) -> GroupOutcome {
    let group = admitted.group;
    let Some(slot) = level
        .engine
        .pool
        .acquire(WorkerRole::Bidder, group.owner.clone())
        .await
    else {
        return GroupOutcome {
            errors: vec![format!("{} could not obtain a bidder process", group.owner)],
            ..Default::default()
        };
    };

    let started = *buyer.budget_start.get_or_init(Instant::now);
    let finished = tokio::select! {
        biased;
        outcome = run_bidder(level, buyer, &slot, &group, admitted.priority) => Some(outcome),
        () = cumulative_budget(level, &buyer.owner, started) => None,
    };

    finished.unwrap_or_else(|| {
        debug!(group = %group.key(), "cumulative timeout hit");
        let mut outcome = GroupOutcome {
            timed_out: true,
            ..Default::default()
        };
        if !buyer.timeout_reported.swap(true, Ordering::Relaxed) {
            outcome.errors.push(format!(
                "{} perBuyerCumulativeTimeout exceeded during bid generation.",
                buyer.owner
            ));
        }
        outcome
    })
}

/// Completes when `owner`'s cumulative timeout has elapsed since `started`.
async fn cumulative_budget(level: &LevelContext, owner: &Origin, started: Instant) {
    let config = level
        .gate
        .wait_for(&[ConfigField::BuyerCumulativeTimeouts])
        .await;
    match config
        .buyer_cumulative_timeouts
        .value()
        .and_then(|t| t.for_buyer(owner))
    {
        Some(limit) => tokio::time::sleep_until(started + limit).await,
        None => std::future::pending().await,
    }
}

async fn run_bidder(
    level: &LevelContext,
    buyer: &BuyerContext,
    slot: &SlotHandle,
    group: &Arc<InterestGroup>,
    priority: f64,
) -> GroupOutcome {
    let mut outcome = GroupOutcome::default();
    let Some(bidding_url) = group.bidding_url.as_deref() else {
        return outcome;
    };

    let worklet = match level.engine.deps.worklets.load_bidder(slot, bidding_url).await {
        Ok(worklet) => worklet,
        Err(err) => {
            outcome.crashed = matches!(err, WorkletError::Crashed { .. });
            outcome.errors.push(err.to_string());
            return outcome;
        }
    };

    let signals = match buyer.batcher.signals_for(group).await {
        None => None,
        Some(Ok(signals)) => {
            outcome.fetch_latency = signals.fetch_duration;
            Some(signals)
        }
        Some(Err(err)) => {
            warn!(group = %group.key(), error = %err, "trusted bidding signals fetch failed");
            outcome.errors.push(err.to_string());
            return outcome;
        }
    };

    let config = level.gate.wait_for(&ConfigField::BIDDER_FIELDS).await;

    if group.enable_bidding_signals_prioritization {
        if let Some(vector) = signals.as_ref().and_then(|s| s.priority_vector.as_ref()) {
            if reprioritize(group, vector, priority, &config, Utc::now()).is_none() {
                debug!(group = %group.key(), "filtered by trusted signals priority");
                return outcome;
            }
        }
    }

    let bidder = Bidder {
        level,
        worklet: worklet.as_ref(),
        group,
        bidding_url,
        expected_currency: config.buyer_currency(&group.owner).cloned(),
        signals_fetch_time: outcome.fetch_latency,
        data_version: signals.as_ref().and_then(|s| s.data_version),
    };
    let base_request = bidder.request(&config, signals.as_ref());

    let Some(first) = bidder.invoke(base_request.clone(), &mut outcome).await else {
        return outcome;
    };
    let unrestricted = bidder.validate(group, &first, &mut outcome);

    let mode = level.kanon_mode;
    let Some(mut bid) = unrestricted else {
        if mode != KAnonMode::Disabled {
            outcome.kanon = Some(KAnonComparison::NoBid);
        }
        return outcome;
    };

    if mode == KAnonMode::Disabled {
        bidder.push(&mut outcome, bid, first);
        return outcome;
    }

    let keys = kanon_keys(group);
    let authorized = level.engine.deps.store.kanon_authorized(&keys).await;
    if bid_is_kanon(group, &bid, &authorized) {
        bid.role = BidRole::Both;
        outcome.kanon = Some(KAnonComparison::SameBid);
        bidder.push(&mut outcome, bid, first);
        return outcome;
    }

    let restricted = Arc::new(restrict_to_kanon(group, &authorized));
    let enforced = if restricted.ads.is_empty() {
        None
    } else {
        let request = GenerateBidRequest {
            interest_group: Arc::clone(&restricted),
            restrict_to_kanon_ads: true,
            ..base_request
        };
        match bidder.invoke(request, &mut outcome).await {
            Some(output) => bidder
                .validate(&restricted, &output, &mut outcome)
                .map(|bid| (bid, output)),
            None => None,
        }
    };

    outcome.kanon = Some(if enforced.is_some() {
        KAnonComparison::DifferentBid
    } else {
        KAnonComparison::NoBid
    });
    if mode == KAnonMode::Simulate {
        bidder.push(&mut outcome, bid, first);
    }
    if let Some((mut enforced_bid, output)) = enforced {
        enforced_bid.role = BidRole::Enforced;
        bidder.push(&mut outcome, enforced_bid, output);
    }
    outcome
}

/// Bid generation state for one group in one level
struct Bidder<'a> {
    level: &'a LevelContext,
    worklet: &'a dyn BidderWorklet,
    group: &'a Arc<InterestGroup>,
    bidding_url: &'a str,
    expected_currency: Option<AdCurrency>,
    signals_fetch_time: Duration,
    data_version: Option<u32>,
}

impl Bidder<'_> {
    fn request(
        &self,
        config: &AuctionConfig,
        signals: Option<&GroupSignals>,
    ) -> GenerateBidRequest {
        let engine = &self.level.engine.config;
        let owner = &self.group.owner;
        let per_buyer_timeout = config
            .buyer_timeouts
            .value()
            .and_then(|t| t.for_buyer(owner))
            .map(|t| t.min(engine.bidding.max_per_buyer_timeout()))
            .unwrap_or_else(|| engine.bidding.max_per_buyer_timeout());
        let browser = &self.group.browser_signals;

        GenerateBidRequest {
            interest_group: Arc::clone(self.group),
            auction_signals: config.auction_signals.value().cloned().flatten(),
            per_buyer_signals: config.per_buyer_signals_for(owner).cloned(),
            trusted_bidding_signals: signals.map(|s| s.values.clone()),
            trusted_bidding_signals_data_version: signals.and_then(|s| s.data_version),
            direct_from_seller_signals: config
                .direct_from_seller_signals
                .value()
                .and_then(|d| d.as_ref())
                .and_then(|d| d.for_buyer(owner))
                .cloned(),
            browser_signals: BidderBrowserSignals {
                top_window_origin: self.level.top_window_origin.clone(),
                seller: self.level.seller.clone(),
                top_level_seller: self.level.top_level_seller.clone(),
                join_count: browser.join_count,
                bid_count: browser.bid_count,
                prev_wins: browser.prev_wins.clone(),
            },
            per_buyer_timeout,
            expected_currency: self.expected_currency.clone(),
            restrict_to_kanon_ads: false,
        }
    }

    /// Run `generateBid` once. `None` means there is nothing to validate.
    async fn invoke(
        &self,
        request: GenerateBidRequest,
        outcome: &mut GroupOutcome,
    ) -> Option<(GenerateBidOutput, Duration)> {
        let timeout = request.per_buyer_timeout;
        let started = Instant::now();
        let result = tokio::time::timeout(timeout, self.worklet.generate_bid(request)).await;
        let elapsed = started.elapsed();
        outcome.generate_latency += elapsed;

        match result {
            Err(_) => {
                outcome
                    .errors
                    .push(format!("{} generateBid() timed out.", self.bidding_url));
                None
            }
            Ok(Err(err)) => {
                outcome.crashed = true;
                outcome.errors.push(err.to_string());
                None
            }
            Ok(Ok(output)) => {
                outcome.errors.extend(output.errors.iter().cloned());
                if let Some(priority) = output.set_priority {
                    outcome.set_priority = Some((self.group.key(), priority));
                }
                Some((output, elapsed))
            }
        }
    }

    /// Validate a script's bid against `against`, the group as the script saw it.
    fn validate(
        &self,
        against: &InterestGroup,
        (output, elapsed): &(GenerateBidOutput, Duration),
        outcome: &mut GroupOutcome,
    ) -> Option<Bid> {
        let generated = output.bid.as_ref()?;
        let key = self.group.key();
        let invalid = |reason: String| ProtocolViolation::InvalidBid {
            group: key.clone(),
            reason,
        };

        if !generated.value.is_finite() {
            outcome
                .bad_messages
                .push(invalid(format!("bid value {} is not finite", generated.value)));
            return None;
        }
        if generated.value <= 0.0 {
            return None;
        }
        if !currencies_match(generated.currency.as_ref(), self.expected_currency.as_ref()) {
            outcome.errors.push(format!(
                "{} generateBid() bidCurrency mismatch; returned '{}', expected '{}'.",
                self.bidding_url,
                currency_code(generated.currency.as_ref()),
                currency_code(self.expected_currency.as_ref()),
            ));
            return None;
        }
        if self.level.is_component() && !generated.allow_component_auction {
            outcome.errors.push(format!(
                "{} generateBid() bid does not have allowComponentAuction set to true. \
                 Bid dropped from component auction.",
                self.bidding_url
            ));
            return None;
        }
        let Some(ad) = against.find_ad(&generated.ad.url, generated.ad.size.as_ref()) else {
            outcome.bad_messages.push(invalid(format!(
                "bid render URL '{}' isn't one of the registered creative URLs",
                generated.ad.url
            )));
            return None;
        };
        let max_components = self.level.engine.config.bidding.max_ad_components;
        if generated.ad_components.len() > max_components {
            outcome.bad_messages.push(invalid(format!(
                "bid has {} ad components, more than the limit of {}",
                generated.ad_components.len(),
                max_components
            )));
            return None;
        }
        if let Some(component) = generated
            .ad_components
            .iter()
            .find(|c| against.find_ad_component(&c.url, c.size.as_ref()).is_none())
        {
            outcome.bad_messages.push(invalid(format!(
                "bid ad component URL '{}' isn't one of the registered creative URLs",
                component.url
            )));
            return None;
        }

        Some(Bid {
            interest_group: key,
            role: BidRole::Unenforced,
            value: generated.value,
            currency: generated.currency.clone(),
            ad: generated.ad.clone(),
            ad_components: generated.ad_components.clone(),
            ad_metadata: generated.ad_metadata.clone().or_else(|| ad.metadata.clone()),
            ad_cost: generated.ad_cost,
            modeling_signals: generated.modeling_signals,
            bid_duration: *elapsed,
        })
    }

    fn push(
        &self,
        outcome: &mut GroupOutcome,
        bid: Bid,
        (output, _): (GenerateBidOutput, Duration),
    ) {
        let mut aggregation = Vec::with_capacity(output.aggregation_requests.len());
        for request in output.aggregation_requests {
            match request.check() {
                Ok(()) => aggregation.push(request),
                Err(reason) => outcome
                    .bad_messages
                    .push(ProtocolViolation::InvalidAggregationRequest {
                        origin: self.group.owner.clone(),
                        reason,
                    }),
            }
        }
        outcome.bids.push(Arc::new(BidRecord {
            bid,
            group: Arc::clone(self.group),
            debug: DebugUrls {
                win: output.debug_win_report_url,
                loss: output.debug_loss_report_url,
            },
            aggregation,
            signals_fetch_time: self.signals_fetch_time,
            data_version: self.data_version,
            buyer_currency: self.expected_currency.clone(),
        }));
    }
}

/// Every k-anonymity key a bid from `group` could need.
fn kanon_keys(group: &InterestGroup) -> Vec<String> {
    group
        .ads
        .iter()
        .map(|ad| group.kanon_key_for_ad(&ad.render_url))
        .chain(
            group
                .ad_components
                .iter()
                .map(|ad| kanon_key_for_component(&ad.render_url)),
        )
        .collect()
}

fn bid_is_kanon(group: &InterestGroup, bid: &Bid, authorized: &HashSet<String>) -> bool {
    authorized.contains(&group.kanon_key_for_ad(&bid.ad.url))
        && bid
            .ad_components
            .iter()
            .all(|c| authorized.contains(&kanon_key_for_component(&c.url)))
}

/// `group` with only its k-anonymous ads and components.
fn restrict_to_kanon(group: &InterestGroup, authorized: &HashSet<String>) -> InterestGroup {
    let mut restricted = group.clone();
    restricted
        .ads
        .retain(|ad| authorized.contains(&group.kanon_key_for_ad(&ad.render_url)));
    restricted
        .ad_components
        .retain(|ad| authorized.contains(&kanon_key_for_component(&ad.render_url)));
    restricted
}

#[cfg(test)]
mod tests {
    use auction_types::InterestGroupAd;

    use super::*;

    fn group() -> InterestGroup {
        InterestGroup::new("https://b.test", "g", "https://b.test/bid.js")
            .with_ad(InterestGroupAd::new("https://ads.test/1"))
            .with_ad(InterestGroupAd::new("https://ads.test/2"))
            .with_ad_component(InterestGroupAd::new("https://ads.test/c1"))
    }

    #[test]
    fn kanon_keys_cover_ads_and_components() {
        let keys = kanon_keys(&group());
        assert_eq!(keys.len(), 3);
        assert!(keys.contains(&kanon_key_for_component("https://ads.test/c1")));
    }

    #[test]
    fn restriction_keeps_authorized_ads() {
        let g = group();
        let authorized = HashSet::from([g.kanon_key_for_ad("https://ads.test/2")]);
        let restricted = restrict_to_kanon(&g, &authorized);
        assert_eq!(restricted.ads.len(), 1);
        assert_eq!(restricted.ads[0].render_url, "https://ads.test/2");
        assert!(restricted.ad_components.is_empty());
    }
}
