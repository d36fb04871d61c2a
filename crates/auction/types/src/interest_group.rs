//! Interest groups
//!
//! An interest group is supplied whole by the external store at auction
//! start. The engine never mutates it during an auction; bid counts, wins and
//! priority changes are handed back to the store afterwards.

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::ids::{InterestGroupKey, Origin};

/// Rendered size of an ad, in pixels
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct AdSize {
    pub width: u32,
    pub height: u32,
}

impl AdSize {
    pub fn new(width: u32, height: u32) -> Self {
        Self { width, height }
    }
}

/// An ad or ad component registered on an interest group
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct InterestGroupAd {
    pub render_url: String,
    pub size: Option<AdSize>,
    /// Opaque JSON metadata handed to reporting.
    pub metadata: Option<String>,
}

impl InterestGroupAd {
    pub fn new(render_url: impl Into<String>) -> Self {
        Self {
            render_url: render_url.into(),
            size: None,
            metadata: None,
        }
    }

    pub fn with_size(mut self, size: AdSize) -> Self {
        self.size = Some(size);
        self
    }

    pub fn with_metadata(mut self, metadata: impl Into<String>) -> Self {
        self.metadata = Some(metadata.into());
        self
    }

    /// A bid naming `size` matches only an ad registered with that size.
    /// A bid naming no size matches by URL alone.
    fn matches(&self, url: &str, size: Option<&AdSize>) -> bool {
        if self.render_url != url {
            return false;
        }
        match size {
            Some(size) => self.size.as_ref() == Some(size),
            None => true,
        }
    }
}

/// A previous win of this group, as recorded by the store
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct PreviousWin {
    pub time: DateTime<Utc>,
    pub ad_json: String,
}

/// Browser-side bookkeeping shown to `generateBid`
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct BiddingBrowserSignals {
    pub join_count: u32,
    pub bid_count: u32,
    pub prev_wins: Vec<PreviousWin>,
}

/// A registered advertiser group capable of bidding
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct InterestGroup {
    pub owner: Origin,
    pub name: String,
    pub priority: f64,
    pub enable_bidding_signals_prioritization: bool,
    pub priority_vector: Option<HashMap<String, f64>>,
    pub priority_signals_overrides: Option<HashMap<String, f64>>,
    pub bidding_url: Option<String>,
    pub trusted_bidding_signals_url: Option<String>,
    pub trusted_bidding_signals_keys: Vec<String>,
    pub user_bidding_signals: Option<String>,
    pub ads: Vec<InterestGroupAd>,
    pub ad_components: Vec<InterestGroupAd>,
    pub join_time: DateTime<Utc>,
    pub browser_signals: BiddingBrowserSignals,
}

impl InterestGroup {
    /// Create a group with a bidding script and no ads.
    pub fn new(
        owner: impl Into<Origin>,
        name: impl Into<String>,
        bidding_url: impl Into<String>,
    ) -> Self {
        Self {
            owner: owner.into(),
            name: name.into(),
            priority: 0.0,
            enable_bidding_signals_prioritization: false,
            priority_vector: None,
            priority_signals_overrides: None,
            bidding_url: Some(bidding_url.into()),
            trusted_bidding_signals_url: None,
            trusted_bidding_signals_keys: Vec::new(),
            user_bidding_signals: None,
            ads: Vec::new(),
            ad_components: Vec::new(),
            join_time: Utc::now(),
            browser_signals: BiddingBrowserSignals::default(),
        }
    }

    pub fn with_ad(mut self, ad: InterestGroupAd) -> Self {
        self.ads.push(ad);
        self
    }

    pub fn with_ad_component(mut self, ad: InterestGroupAd) -> Self {
        self.ad_components.push(ad);
        self
    }

    pub fn with_priority(mut self, priority: f64) -> Self {
        self.priority = priority;
        self
    }

    pub fn with_trusted_signals(mut self, url: impl Into<String>, keys: Vec<String>) -> Self {
        self.trusted_bidding_signals_url = Some(url.into());
        self.trusted_bidding_signals_keys = keys;
        self
    }

    pub fn key(&self) -> InterestGroupKey {
        InterestGroupKey {
            owner: self.owner.clone(),
            name: self.name.clone(),
        }
    }

    /// A group can bid only with a bidding script and at least one ad.
    pub fn can_bid(&self) -> bool {
        self.bidding_url.is_some() && !self.ads.is_empty()
    }

    pub fn find_ad(&self, url: &str, size: Option<&AdSize>) -> Option<&InterestGroupAd> {
        self.ads.iter().find(|ad| ad.matches(url, size))
    }

    pub fn find_ad_component(&self, url: &str, size: Option<&AdSize>) -> Option<&InterestGroupAd> {
        self.ad_components.iter().find(|ad| ad.matches(url, size))
    }

    /// k-anonymity key of one of this group's ads.
    pub fn kanon_key_for_ad(&self, render_url: &str) -> String {
        format!(
            "AdBid\n{}/\n{}\n{}",
            self.owner,
            self.bidding_url.as_deref().unwrap_or_default(),
            render_url
        )
    }
}

/// k-anonymity key of an ad component. Components are keyed by URL alone.
pub fn kanon_key_for_component(render_url: &str) -> String {
    format!("ComponentBid\n{}", render_url)
}
