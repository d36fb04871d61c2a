//! Shared fixtures for engine integration tests.

#![allow(dead_code)]

use std::sync::Arc;

use auction_engine::mocks::{MockInterestGroupStore, MockSignalsFetcher, MockWorkletHost};
use auction_engine::{AuctionContext, AuctionEngine, EngineConfig, EngineDeps, SeededRandom};
use auction_types::{AuctionConfig, AuctionResult, InterestGroup, InterestGroupAd};

pub const PUBLISHER: &str = "https://pub.test";
pub const SELLER: &str = "https://seller.test";
pub const DECISION_LOGIC: &str = "https://seller.test/decision.js";

pub fn bidding_url(owner: &str) -> String {
    format!("{}/bid.js", owner)
}

pub fn ad_url(owner: &str, name: &str) -> String {
    format!("{}/ads/{}", owner, name)
}

/// A group with one ad at `ad_url(owner, name)`.
pub fn group(owner: &str, name: &str) -> InterestGroup {
    InterestGroup::new(owner, name, bidding_url(owner))
        .with_ad(InterestGroupAd::new(ad_url(owner, name)))
}

pub fn auction(buyers: &[&str]) -> AuctionConfig {
    AuctionConfig::new(SELLER, DECISION_LOGIC).with_buyers(buyers.iter().copied())
}

/// Engine and the collaborators tests inspect afterwards
pub struct Harness {
    pub engine: AuctionEngine,
    pub store: Arc<MockInterestGroupStore>,
    pub fetcher: Arc<MockSignalsFetcher>,
}

impl Harness {
    pub fn new(host: MockWorkletHost, store: MockInterestGroupStore) -> Self {
        Self::build(EngineConfig::default(), host, store, MockSignalsFetcher::new())
    }

    pub fn build(
        config: EngineConfig,
        host: MockWorkletHost,
        store: MockInterestGroupStore,
        fetcher: MockSignalsFetcher,
    ) -> Self {
        let store = Arc::new(store);
        let fetcher = Arc::new(fetcher);
        let deps = EngineDeps::new(Arc::new(host), store.clone(), fetcher.clone())
            .with_random(Arc::new(SeededRandom::new(7)));
        Self {
            engine: AuctionEngine::new(config, deps),
            store,
            fetcher,
        }
    }

    /// Run `config` to completion.
    pub async fn run(&self, config: AuctionConfig) -> AuctionResult {
        self.engine
            .start_auction(config, AuctionContext::new(PUBLISHER))
            .expect("auction config is valid")
            .result()
            .await
            .expect("auction task completes")
    }
}
