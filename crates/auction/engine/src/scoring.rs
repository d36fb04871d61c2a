//! Bid scoring
//!
//! Every bid of a level, and every winner presented by a component auction,
//! is scored by the level's seller. The seller script is loaded once per
//! level, on first use, and shared by all scoring calls of that level.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use auction_types::{
    currencies_match, currency_code, AdCurrency, AggregationRequest, Bid, ConfigField, Origin,
    ProtocolViolation, RejectReason, ScoredBid, WorkletError,
};
use futures::future::{BoxFuture, FutureExt, Shared};
use serde_json::Value;
use tokio::time::Instant;
use tracing::{debug, warn};

use crate::admission::{SlotHandle, WorkerRole};
use crate::auction::{DebugUrls, EngineContext, LevelContext};
use crate::bidding::BidRecord;
use crate::traits::{SellerWorklet, SignalsKind, SignalsRequest};
use crate::worklet::{ScoreAdRequest, ScoringBrowserSignals};

/// A loaded seller worklet and the process slot it lives in
#[derive(Clone)]
pub(crate) struct SellerHandle {
    pub worklet: Arc<dyn SellerWorklet>,
    pub decision_logic_url: String,
    _slot: Arc<SlotHandle>,
}

pub(crate) type SellerLoad = Shared<BoxFuture<'static, Result<SellerHandle, WorkletError>>>;

/// Lazily load the seller worklet for one level.
///
/// Nothing happens until the first scoring call awaits the returned future.
pub(crate) fn load_seller(
    engine: Arc<EngineContext>,
    seller: Origin,
    decision_logic_url: Option<String>,
) -> SellerLoad {
    async move {
        let url = decision_logic_url.ok_or_else(|| WorkletError::LoadFailed {
            url: String::new(),
            reason: format!("{} has no decision logic", seller),
        })?;
        let slot = engine
            .pool
            .acquire(WorkerRole::Seller, seller.clone())
            .await
            .ok_or_else(|| WorkletError::LoadFailed {
                url: url.clone(),
                reason: "no seller process available".into(),
            })?;
        debug!(%seller, %url, "loading seller worklet");
        let worklet = engine.deps.worklets.load_seller(&slot, &url).await?;
        Ok(SellerHandle {
            worklet,
            decision_logic_url: url,
            _slot: Arc::new(slot),
        })
    }
    .boxed()
    .shared()
}

/// A scored bid competing in one level
#[derive(Debug)]
pub(crate) struct Candidate {
    /// The bid as this level's seller saw it.
    pub scored: ScoredBid,
    pub record: Arc<BidRecord>,
    pub seller_debug: DebugUrls,
    pub seller_aggregation: Vec<AggregationRequest>,
    pub scoring_signals_fetch_time: Duration,
    /// Component index and candidate index there, for bids that won a
    /// component auction.
    pub component: Option<(usize, usize)>,
}

/// Result of scoring one bid
#[derive(Debug, Default)]
pub(crate) struct ScoreOutcome {
    pub candidate: Option<Candidate>,
    pub errors: Vec<String>,
    pub bad_messages: Vec<ProtocolViolation>,
    /// The seller worklet could not be loaded or crashed.
    pub seller_failure: Option<WorkletError>,
}

/// A bid offered to a level for scoring
pub(crate) struct Offer {
    pub presented: Bid,
    pub record: Arc<BidRecord>,
    /// Component index, candidate index there and the component's seller.
    pub component: Option<(usize, usize, Origin)>,
}

/// Score one bid with the level's seller.
pub(crate) async fn score_bid(
    level: &LevelContext,
    seller: &SellerLoad,
    offer: Offer,
) -> ScoreOutcome {
    let mut outcome = ScoreOutcome::default();
    let config = level.gate.wait_for(&ConfigField::SELLER_FIELDS).await;
    let handle = match seller.clone().await {
        Ok(handle) => handle,
        Err(err) => {
            outcome.seller_failure = Some(err);
            return outcome;
        }
    };

    let Offer {
        presented,
        record,
        component,
    } = offer;
    let component_seller = component.as_ref().map(|(_, _, s)| s.clone());

    if let Some(component_seller) = &component_seller {
        let expected = config.buyer_currency(component_seller);
        if !currencies_match(presented.currency.as_ref(), expected) {
            outcome.errors.push(format!(
                "{} componentAuction bidCurrency mismatch; got '{}', expected '{}'.",
                component_seller,
                currency_code(presented.currency.as_ref()),
                currency_code(expected),
            ));
            return outcome;
        }
    }

    let (trusted_scoring_signals, data_version, fetch_time) = fetch_scoring_signals(
        level,
        config.trusted_scoring_signals_url.as_deref(),
        &presented,
        &mut outcome,
    )
    .await;

    let max_timeout = level.engine.config.scoring.max_seller_timeout();
    let seller_timeout = config
        .seller_timeout
        .map(|t| t.min(max_timeout))
        .unwrap_or(max_timeout);
    let request = ScoreAdRequest {
        ad_metadata: presented.ad_metadata.clone(),
        bid: presented.value,
        auction_config: Arc::clone(&config),
        trusted_scoring_signals,
        browser_signals: ScoringBrowserSignals {
            top_window_origin: level.top_window_origin.clone(),
            interest_group_owner: presented.owner().clone(),
            render_url: presented.ad.url.clone(),
            ad_components: presented.ad_components.iter().map(|c| c.url.clone()).collect(),
            bid_currency: presented.currency.clone(),
            bidding_duration: presented.bid_duration,
            data_version,
            component_seller: component_seller.clone(),
            top_level_seller: level.top_level_seller.clone(),
        },
        seller_timeout,
    };

    let started = Instant::now();
    let scored = tokio::time::timeout(seller_timeout, handle.worklet.score_ad(request)).await;
    let output = match scored {
        Err(_) => {
            outcome
                .errors
                .push(format!("{} scoreAd() timed out.", handle.decision_logic_url));
            return outcome;
        }
        Ok(Err(err)) => {
            warn!(seller = %level.seller, error = %err, "seller worklet failed while scoring");
            outcome.seller_failure = Some(err);
            return outcome;
        }
        Ok(Ok(output)) => output,
    };
    let score_duration = started.elapsed();
    outcome.errors.extend(output.errors.iter().cloned());

    let invalid = |reason: String| ProtocolViolation::InvalidScore {
        seller: level.seller.clone(),
        reason,
    };

    let mut desirability = output.desirability;
    if !desirability.is_finite() {
        outcome
            .bad_messages
            .push(invalid(format!("desirability {} is not finite", desirability)));
        desirability = 0.0;
    }

    let crosses_levels = level.is_component() || component_seller.is_some();
    if crosses_levels && desirability > 0.0 && !output.allow_component_auction {
        outcome.errors.push(format!(
            "{} scoreAd() return value does not have allowComponentAuction set to true. \
             Ad dropped from component auction.",
            handle.decision_logic_url
        ));
        desirability = 0.0;
    }

    let mut modified_bid = output.modified_bid.clone();
    if modified_bid.is_some() && !level.is_component() {
        outcome
            .bad_messages
            .push(invalid("only component auctions may modify bids".into()));
        modified_bid = None;
    }
    if let Some(value) = modified_bid.as_ref().and_then(|m| m.value) {
        if !value.is_finite() {
            outcome
                .bad_messages
                .push(invalid(format!("modified bid {} is not finite", value)));
            modified_bid = None;
        } else if desirability > 0.0 && value <= 0.0 {
            outcome.errors.push(format!(
                "{} scoreAd() modified bid must be positive.",
                handle.decision_logic_url
            ));
            desirability = 0.0;
        }
    }
    if let Some(modified) = modified_bid.as_ref().filter(|m| m.value.is_some()) {
        let seller_currency = config.seller_currency.as_ref();
        if desirability > 0.0 && !currencies_match(modified.currency.as_ref(), seller_currency) {
            outcome.errors.push(format!(
                "{} scoreAd() bid currency mismatch vs own sellerCurrency; expected '{}', got '{}'.",
                handle.decision_logic_url,
                currency_code(seller_currency),
                currency_code(modified.currency.as_ref()),
            ));
            desirability = 0.0;
        }
    }

    let bid_in_seller_currency = match bid_in_seller_currency(
        &presented,
        config.seller_currency.as_ref(),
        output.bid_in_seller_currency,
    ) {
        Ok(value) => value,
        Err(reason) => {
            if desirability > 0.0 {
                outcome
                    .errors
                    .push(format!("{} scoreAd() {}", handle.decision_logic_url, reason));
            }
            desirability = 0.0;
            None
        }
    };

    let mut seller_aggregation = Vec::with_capacity(output.aggregation_requests.len());
    for request in output.aggregation_requests {
        match request.check() {
            Ok(()) => seller_aggregation.push(request),
            Err(reason) => outcome
                .bad_messages
                .push(ProtocolViolation::InvalidAggregationRequest {
                    origin: level.seller.clone(),
                    reason,
                }),
        }
    }

    let reject_reason = if desirability <= 0.0 {
        output.reject_reason
    } else {
        RejectReason::NotAvailable
    };

    outcome.candidate = Some(Candidate {
        scored: ScoredBid {
            bid: presented,
            desirability,
            reject_reason,
            modified_bid,
            bid_in_seller_currency,
            scoring_signals_data_version: data_version,
            score_duration,
            component_seller,
        },
        record,
        seller_debug: DebugUrls {
            win: output.debug_win_report_url,
            loss: output.debug_loss_report_url,
        },
        seller_aggregation,
        scoring_signals_fetch_time: fetch_time,
        component: component.map(|(i, c, _)| (i, c)),
    });
    outcome
}

async fn fetch_scoring_signals(
    level: &LevelContext,
    url: Option<&str>,
    bid: &Bid,
    outcome: &mut ScoreOutcome,
) -> (Option<HashMap<String, Value>>, Option<u32>, Duration) {
    let Some(url) = url else {
        return (None, None, Duration::ZERO);
    };
    let keys: Vec<String> = std::iter::once(bid.ad.url.clone())
        .chain(bid.ad_components.iter().map(|c| c.url.clone()))
        .collect();
    let request = SignalsRequest {
        kind: SignalsKind::Scoring,
        url: url.to_string(),
        keys: keys.clone(),
        interest_group_names: Vec::new(),
    };
    let started = Instant::now();
    match level.engine.deps.signals.fetch(request).await {
        Ok(response) => {
            let values = keys
                .into_iter()
                .filter_map(|k| response.values.get(&k).cloned().map(|v| (k, v)))
                .collect();
            (Some(values), response.data_version, started.elapsed())
        }
        Err(err) => {
            outcome.errors.push(err.to_string());
            (None, None, started.elapsed())
        }
    }
}

/// The bid's value in the seller's currency.
///
/// `returned` is what the seller script reported. An `Err` rejects the bid.
pub(crate) fn bid_in_seller_currency(
    bid: &Bid,
    seller_currency: Option<&AdCurrency>,
    returned: Option<f64>,
) -> Result<Option<f64>, String> {
    let Some(seller_currency) = seller_currency else {
        return match returned {
            Some(_) => {
                Err("incomingBidInSellerCurrency without a configured sellerCurrency.".into())
            }
            None => Ok(None),
        };
    };
    if let Some(value) = returned {
        if !value.is_finite() || value < 0.0 {
            return Err(format!("incomingBidInSellerCurrency {} is not valid.", value));
        }
    }
    match (&bid.currency, returned) {
        (Some(c), Some(value)) if c == seller_currency && value != bid.value => Err(format!(
            "incomingBidInSellerCurrency changes a bid already in {}.",
            seller_currency
        )),
        (Some(c), _) if c == seller_currency => Ok(Some(bid.value)),
        (None, returned) => Ok(Some(returned.unwrap_or(bid.value))),
        (Some(_), Some(value)) => Ok(Some(value)),
        (Some(c), None) => Err(format!(
            "bid in {} has no conversion to sellerCurrency {}.",
            c, seller_currency
        )),
    }
}
