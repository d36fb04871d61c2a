//! Auctions completed from an encrypted server-side response.

mod common;

use std::sync::Arc;

use auction_engine::mocks::{
    MockInterestGroupStore, MockServerResponseDecoder, MockSignalsFetcher, MockWorkletHost,
};
use auction_engine::{
    AuctionContext, AuctionEngine, DecodedServerResponse, EngineConfig, EngineDeps,
    ServerReportingUrls,
};
use auction_types::{
    kanon_key_for_component, AuctionConfig, AuctionOutcome, AuctionResult, InterestGroupAd,
    InterestGroupKey, Origin, ServerResponseConfig, ServerResponseError,
};
use common::*;
use uuid::Uuid;

const B1: &str = "https://b1.test";
const COMPONENT: &str = "https://b1.test/ads/frame";

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

fn server_auction() -> AuctionConfig {
    let mut config = AuctionConfig::new(SELLER, DECISION_LOGIC);
    config.decision_logic_url = None;
    config.server_response = Some(ServerResponseConfig {
        request_id: Uuid::new_v4(),
        response: vec![1, 2, 3],
    });
    config
}

fn winning_response() -> DecodedServerResponse {
    DecodedServerResponse {
        is_chaff: false,
        seller: Origin::new(SELLER),
        interest_group: Some(InterestGroupKey::new(B1, "shoes")),
        render_url: Some(ad_url(B1, "shoes")),
        ad_components: vec![COMPONENT.to_string()],
        bid: Some(4.0),
        bid_currency: None,
        component_seller: None,
        reporting: ServerReportingUrls {
            buyer_report_url: Some("https://b1.test/win".into()),
            seller_report_url: Some("https://seller.test/result".into()),
            component_seller_report_url: None,
        },
        errors: Vec::new(),
    }
}

/// Runs `config` against a store holding one B1 group.
async fn run(
    decoded: Option<Result<DecodedServerResponse, ServerResponseError>>,
    config: AuctionConfig,
) -> (AuctionResult, Arc<MockInterestGroupStore>) {
    let store = Arc::new(MockInterestGroupStore::new().with_group(
        group(B1, "shoes").with_ad_component(InterestGroupAd::new(COMPONENT)),
    ));
    let mut deps = EngineDeps::new(
        Arc::new(MockWorkletHost::new()),
        store.clone(),
        Arc::new(MockSignalsFetcher::new()),
    );
    if let Some(decoded) = decoded {
        deps = deps.with_server_decoder(Arc::new(MockServerResponseDecoder::new(decoded)));
    }
    let engine = AuctionEngine::new(EngineConfig::default(), deps);
    let result = engine
        .start_auction(config, AuctionContext::new(PUBLISHER))
        .expect("auction config is valid")
        .result()
        .await
        .expect("auction task completes");
    (result, store)
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[tokio::test]
async fn accepted_winner_is_reported_and_recorded() {
    let (result, store) = run(Some(Ok(winning_response())), server_auction()).await;

    assert_eq!(result.outcome, AuctionOutcome::Won);
    let winner = result.winner.expect("winner");
    let key = InterestGroupKey::new(B1, "shoes");
    assert_eq!(winner.interest_group, key);
    assert_eq!(winner.bid, 4.0);
    assert_eq!(
        result.reports.report_urls,
        vec![
            "https://seller.test/result".to_string(),
            "https://b1.test/win".to_string(),
        ]
    );

    let group = group(B1, "shoes");
    assert_eq!(
        result.kanon_keys_to_join,
        vec![
            group.kanon_key_for_ad(&ad_url(B1, "shoes")),
            kanon_key_for_component(COMPONENT),
        ]
    );
    assert_eq!(store.recorded_bids(), vec![key.clone()]);
    let wins = store.recorded_wins();
    assert_eq!(wins.len(), 1);
    assert_eq!(wins[0].0, key);
    assert!(wins[0].1.contains(&ad_url(B1, "shoes")));
}

#[tokio::test]
async fn chaff_has_no_winner() {
    let mut decoded = winning_response();
    decoded.is_chaff = true;

    let (result, store) = run(Some(Ok(decoded)), server_auction()).await;

    assert_eq!(result.outcome, AuctionOutcome::NoBids);
    assert!(result.winner.is_none());
    assert!(store.recorded_wins().is_empty());
}

#[tokio::test]
async fn response_from_another_seller_fails() {
    let mut decoded = winning_response();
    decoded.seller = Origin::new("https://other.test");

    let (result, store) = run(Some(Ok(decoded)), server_auction()).await;

    assert_eq!(result.outcome, AuctionOutcome::Failed);
    assert!(result.errors[0].contains("seller mismatch"));
    assert!(store.recorded_bids().is_empty());
}

#[tokio::test]
async fn ad_outside_the_group_fails() {
    let mut decoded = winning_response();
    decoded.render_url = Some(ad_url(B1, "elsewhere"));

    let (result, _) = run(Some(Ok(decoded)), server_auction()).await;

    assert_eq!(result.outcome, AuctionOutcome::Failed);
    assert!(result.winner.is_none());
    assert!(result.errors[0].contains("not in interest group"));
}

#[tokio::test]
async fn unknown_group_fails() {
    let mut decoded = winning_response();
    decoded.interest_group = Some(InterestGroupKey::new(B1, "gone"));

    let (result, _) = run(Some(Ok(decoded)), server_auction()).await;

    assert_eq!(result.outcome, AuctionOutcome::Failed);
    assert!(result.errors[0].contains("unknown interest group"));
}

#[tokio::test]
async fn missing_decoder_fails() {
    let (result, _) = run(None, server_auction()).await;

    assert_eq!(result.outcome, AuctionOutcome::Failed);
    assert_eq!(
        result.errors,
        vec!["could not decrypt server auction response".to_string()]
    );
}

#[tokio::test]
async fn decoder_errors_fail_the_auction() {
    let (result, _) = run(
        Some(Err(ServerResponseError::NotWitnessed)),
        server_auction(),
    )
    .await;

    assert_eq!(result.outcome, AuctionOutcome::Failed);
    assert_eq!(
        result.errors,
        vec!["server auction response was not witnessed".to_string()]
    );
}
