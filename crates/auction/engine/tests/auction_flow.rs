//! End-to-end single-seller auctions against mock worklets.

mod common;

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use auction_engine::mocks::{
    MockBidderWorklet, MockInterestGroupStore, MockSellerWorklet, MockWorkletHost,
};
use auction_engine::{
    AuctionContext, AuctionError, GenerateBidOutput, GeneratedBid, ReportResultOutput,
    ReportWinOutput, WorkerRole,
};
use auction_types::{
    AdCurrency, AuctionConfigError, AuctionId, AuctionOutcome, BuyerCurrencies, ConfigTarget,
    InterestGroupKey, MaybePromise, Origin, PromiseResolution, ProtocolViolation,
};
use common::*;

const B1: &str = "https://b1.test";
const B2: &str = "https://b2.test";

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

type TwoBidders = (
    Harness,
    Arc<MockBidderWorklet>,
    Arc<MockBidderWorklet>,
    Arc<MockSellerWorklet>,
);

/// B1 bids 1 and B2 bids 2, each with one group.
fn two_bidders(seller: MockSellerWorklet) -> TwoBidders {
    let b1 = Arc::new(MockBidderWorklet::fixed_bid(1.0));
    let b2 = Arc::new(MockBidderWorklet::fixed_bid(2.0).with_report_win(|_| {
        Ok(ReportWinOutput {
            report_url: Some("https://b2.test/win".into()),
            ..Default::default()
        })
    }));
    let seller = Arc::new(seller.with_report_result(|_| {
        Ok(ReportResultOutput {
            report_url: Some("https://seller.test/result".into()),
            ..Default::default()
        })
    }));
    let host = MockWorkletHost::new()
        .with_bidder(bidding_url(B1), b1.clone())
        .with_bidder(bidding_url(B2), b2.clone())
        .with_seller(DECISION_LOGIC, seller.clone());
    let store = MockInterestGroupStore::new()
        .with_group(group(B1, "shoes"))
        .with_group(group(B2, "cars"));
    (Harness::new(host, store), b1, b2, seller)
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[tokio::test]
async fn highest_scoring_bid_wins() {
    let (harness, _b1, b2, seller) = two_bidders(MockSellerWorklet::scaled(2.0));
    let result = harness.run(auction(&[B1, B2])).await;

    assert_eq!(result.outcome, AuctionOutcome::Won);
    let winner = result.winner.expect("winner");
    assert_eq!(winner.interest_group, InterestGroupKey::new(B2, "cars"));
    assert_eq!(winner.render_url, ad_url(B2, "cars"));
    assert_eq!(winner.bid, 2.0);
    assert!(result.errors.is_empty(), "{:?}", result.errors);

    assert_eq!(seller.score_calls().len(), 2);
    let report = &seller.report_result_calls()[0].browser_signals;
    assert_eq!(report.bid, 2.0);
    assert_eq!(report.desirability, 4.0);
    assert_eq!(report.highest_scoring_other_bid, 1.0);

    let win = &b2.report_win_calls()[0].browser_signals;
    assert_eq!(win.bid, 2.0);
    assert_eq!(win.highest_scoring_other_bid, 1.0);
    assert!(!win.made_highest_scoring_other_bid);
    assert_eq!(win.seller.as_str(), SELLER);

    assert_eq!(
        result.reports.report_urls,
        vec!["https://seller.test/result".to_string(), "https://b2.test/win".to_string()]
    );
}

#[tokio::test]
async fn store_records_bids_and_win() {
    let (harness, ..) = two_bidders(MockSellerWorklet::bid_as_score());
    harness.run(auction(&[B1, B2])).await;

    let mut bids = harness.store.recorded_bids();
    bids.sort();
    assert_eq!(
        bids,
        vec![InterestGroupKey::new(B1, "shoes"), InterestGroupKey::new(B2, "cars")]
    );
    let wins = harness.store.recorded_wins();
    assert_eq!(wins.len(), 1);
    assert_eq!(wins[0].0, InterestGroupKey::new(B2, "cars"));
    assert!(wins[0].1.contains(&ad_url(B2, "cars")));
}

#[tokio::test]
async fn winner_beats_every_other_bid() {
    let bidder = Arc::new(MockBidderWorklet::with_generate(|request| {
        let value = match request.interest_group.name.as_str() {
            "a" => 3.0,
            "b" => 5.0,
            _ => 4.0,
        };
        Ok(GenerateBidOutput {
            bid: Some(GeneratedBid::new(value, request.interest_group.ads[0].render_url.clone())),
            ..Default::default()
        })
    }));
    let host = MockWorkletHost::new()
        .with_bidder(bidding_url(B1), bidder)
        .with_seller(DECISION_LOGIC, Arc::new(MockSellerWorklet::bid_as_score()));
    let store = MockInterestGroupStore::new()
        .with_group(group(B1, "a"))
        .with_group(group(B1, "b"))
        .with_group(group(B1, "c"));
    let harness = Harness::new(host, store);

    let result = harness.run(auction(&[B1])).await;
    let winner = result.winner.expect("winner");
    assert_eq!(winner.interest_group.name, "b");
    assert_eq!(winner.bid, 5.0);
    assert_eq!(result.stats.buyers[&Origin::new(B1)].bids, 3);
    assert_eq!(result.stats.buyers[&Origin::new(B1)].interest_groups, 3);
}

#[tokio::test]
async fn no_bids_means_no_winner_and_no_reports() {
    let seller = Arc::new(MockSellerWorklet::bid_as_score());
    let host = MockWorkletHost::new()
        .with_bidder(bidding_url(B1), Arc::new(MockBidderWorklet::new()))
        .with_seller(DECISION_LOGIC, seller.clone());
    let store = MockInterestGroupStore::new().with_group(group(B1, "shoes"));
    let harness = Harness::new(host, store);

    let result = harness.run(auction(&[B1])).await;
    assert_eq!(result.outcome, AuctionOutcome::NoBids);
    assert!(result.winner.is_none());
    assert!(result.reports.report_urls.is_empty());
    assert!(seller.score_calls().is_empty());
    assert!(seller.report_result_calls().is_empty());
    assert!(harness.store.recorded_wins().is_empty());
}

#[tokio::test]
async fn bid_without_currency_is_reported_in_buyer_currency() {
    let (harness, _b1, b2, _seller) = two_bidders(MockSellerWorklet::bid_as_score());
    let mut config = auction(&[B1, B2]);
    config.buyer_currencies = MaybePromise::Literal(BuyerCurrencies {
        per_buyer: HashMap::from([(B2.into(), AdCurrency::new("EUR").unwrap())]),
        all_buyers: None,
    });

    let result = harness.run(config).await;
    assert_eq!(result.outcome, AuctionOutcome::Won);
    let win = &b2.report_win_calls()[0].browser_signals;
    assert_eq!(win.bid_currency.as_ref().map(AdCurrency::as_str), Some("EUR"));
    assert_eq!(
        result.winner.unwrap().bid_currency.as_ref().map(AdCurrency::as_str),
        Some("EUR")
    );
}

#[tokio::test]
async fn currency_mismatch_drops_the_bid() {
    let bidder = Arc::new(MockBidderWorklet::with_generate(|request| {
        let mut bid = GeneratedBid::new(1.0, request.interest_group.ads[0].render_url.clone());
        bid.currency = Some(AdCurrency::new("USD").unwrap());
        Ok(GenerateBidOutput {
            bid: Some(bid),
            ..Default::default()
        })
    }));
    let host = MockWorkletHost::new()
        .with_bidder(bidding_url(B1), bidder)
        .with_seller(DECISION_LOGIC, Arc::new(MockSellerWorklet::bid_as_score()));
    let harness = Harness::new(host, MockInterestGroupStore::new().with_group(group(B1, "shoes")));
    let mut config = auction(&[B1]);
    config.buyer_currencies = MaybePromise::Literal(BuyerCurrencies {
        per_buyer: HashMap::new(),
        all_buyers: Some(AdCurrency::new("EUR").unwrap()),
    });

    let result = harness.run(config).await;
    assert_eq!(result.outcome, AuctionOutcome::NoBids);
    assert_eq!(
        result.errors,
        vec![format!(
            "{} generateBid() bidCurrency mismatch; returned 'USD', expected 'EUR'.",
            bidding_url(B1)
        )]
    );
}

#[tokio::test]
async fn crashed_bidder_is_counted_and_others_still_win() {
    let host = MockWorkletHost::new()
        .with_bidder(bidding_url(B1), Arc::new(MockBidderWorklet::crashing()))
        .with_bidder(bidding_url(B2), Arc::new(MockBidderWorklet::fixed_bid(1.0)))
        .with_seller(DECISION_LOGIC, Arc::new(MockSellerWorklet::bid_as_score()));
    let store = MockInterestGroupStore::new()
        .with_group(group(B1, "shoes"))
        .with_group(group(B2, "cars"));
    let harness = Harness::new(host, store);

    let result = harness.run(auction(&[B1, B2])).await;
    assert_eq!(result.winning_group(), Some(&InterestGroupKey::new(B2, "cars")));
    assert_eq!(result.stats.buyers[&Origin::new(B1)].crashes, 1);
    assert!(result.errors.iter().any(|e| e.contains("bidder process exited")));
}

#[tokio::test]
async fn missing_bidding_script_is_an_error() {
    let host = MockWorkletHost::new()
        .with_seller(DECISION_LOGIC, Arc::new(MockSellerWorklet::bid_as_score()));
    let harness = Harness::new(host, MockInterestGroupStore::new().with_group(group(B1, "shoes")));

    let result = harness.run(auction(&[B1])).await;
    assert_eq!(result.outcome, AuctionOutcome::NoBids);
    assert!(result.errors.iter().any(|e| e.contains("script not found")));
}

#[tokio::test]
async fn seller_crash_fails_the_auction() {
    let (harness, _b1, b2, _seller) = two_bidders(MockSellerWorklet::crashing());
    let result = harness.run(auction(&[B1, B2])).await;

    assert_eq!(result.outcome, AuctionOutcome::Failed);
    assert!(result.winner.is_none());
    assert!(result.reports.report_urls.is_empty());
    assert!(b2.report_win_calls().is_empty());
    assert!(result.errors.iter().any(|e| e.contains("seller process exited")));
}

#[tokio::test]
async fn unregistered_render_url_is_a_bad_message() {
    let bidder = Arc::new(MockBidderWorklet::with_generate(|_| {
        Ok(GenerateBidOutput {
            bid: Some(GeneratedBid::new(1.0, "https://evil.test/ad")),
            ..Default::default()
        })
    }));
    let host = MockWorkletHost::new()
        .with_bidder(bidding_url(B1), bidder)
        .with_seller(DECISION_LOGIC, Arc::new(MockSellerWorklet::bid_as_score()));
    let harness = Harness::new(host, MockInterestGroupStore::new().with_group(group(B1, "shoes")));

    let result = harness.run(auction(&[B1])).await;
    assert_eq!(result.outcome, AuctionOutcome::NoBids);
    assert_eq!(result.bad_messages.len(), 1);
    assert!(result.bad_messages[0].contains("isn't one of the registered creative URLs"));
}

#[tokio::test]
async fn set_priority_is_applied_after_the_auction() {
    let bidder = Arc::new(MockBidderWorklet::with_generate(|_| {
        Ok(GenerateBidOutput {
            set_priority: Some(3.5),
            ..Default::default()
        })
    }));
    let host = MockWorkletHost::new()
        .with_bidder(bidding_url(B1), bidder)
        .with_seller(DECISION_LOGIC, Arc::new(MockSellerWorklet::bid_as_score()));
    let harness = Harness::new(host, MockInterestGroupStore::new().with_group(group(B1, "shoes")));

    harness.run(auction(&[B1])).await;
    assert_eq!(
        harness.store.priority_updates(),
        vec![(InterestGroupKey::new(B1, "shoes"), 3.5)]
    );
}

#[tokio::test]
async fn process_slots_are_released_after_the_auction() {
    let (harness, ..) = two_bidders(MockSellerWorklet::bid_as_score());
    harness.run(auction(&[B1, B2])).await;

    assert_eq!(harness.engine.pool().in_use(WorkerRole::Bidder), 0);
    assert_eq!(harness.engine.pool().in_use(WorkerRole::Seller), 0);
    assert_eq!(harness.engine.live_auctions(), 0);
}

#[tokio::test(start_paused = true)]
async fn abort_ends_the_auction_without_reports() {
    let bidder = Arc::new(MockBidderWorklet::fixed_bid(1.0).with_delay(Duration::from_secs(10)));
    let host = MockWorkletHost::new()
        .with_bidder(bidding_url(B1), bidder)
        .with_seller(DECISION_LOGIC, Arc::new(MockSellerWorklet::bid_as_score()));
    let harness = Harness::new(host, MockInterestGroupStore::new().with_group(group(B1, "shoes")));

    let handle = harness
        .engine
        .start_auction(auction(&[B1]), AuctionContext::new(PUBLISHER))
        .unwrap();
    harness.engine.abort(handle.id()).unwrap();
    let result = handle.result().await.unwrap();

    assert_eq!(result.outcome, AuctionOutcome::Aborted);
    assert!(result.manually_aborted);
    assert!(result.winner.is_none());
    assert!(harness.store.recorded_bids().is_empty());
    assert_eq!(harness.engine.live_auctions(), 0);
}

#[tokio::test]
async fn unknown_auction_is_rejected() {
    let (harness, ..) = two_bidders(MockSellerWorklet::bid_as_score());
    let id = AuctionId::generate();

    let err = harness
        .engine
        .resolve_promise(id, ConfigTarget::TopLevel, PromiseResolution::AuctionSignals(None))
        .unwrap_err();
    assert!(matches!(
        err,
        AuctionError::Protocol(ProtocolViolation::UnknownAuction(unknown)) if unknown == id
    ));
    assert!(harness.engine.abort(id).is_err());
}

#[tokio::test]
async fn invalid_config_is_rejected_before_starting() {
    let (harness, ..) = two_bidders(MockSellerWorklet::bid_as_score());
    let mut config = auction(&[B1]);
    config.decision_logic_url = None;

    let err = harness
        .engine
        .start_auction(config, AuctionContext::new(PUBLISHER))
        .err()
        .expect("config is invalid");
    assert!(matches!(
        err,
        AuctionError::InvalidConfig(AuctionConfigError::MissingDecisionLogic(_))
    ));
    assert_eq!(harness.engine.live_auctions(), 0);
}
