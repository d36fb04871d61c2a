//! Auction configuration
//!
//! One [`AuctionConfig`] describes a seller's auction. Top-level configs may
//! carry component configs, each itself a full `AuctionConfig`.

use std::collections::HashMap;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

use crate::currency::AdCurrency;
use crate::errors::{AuctionConfigError, PromiseStateError};
use crate::ids::Origin;
use crate::promise::{
    BuyerCurrencies, BuyerTimeouts, ConfigField, DirectFromSellerSignals, MaybePromise,
    PromiseResolution,
};

/// Buyer-level statistics a seller may ask to receive as aggregatable
/// contributions.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum BuyerReportType {
    InterestGroupCount,
    BidCount,
    TotalGenerateBidLatency,
    TotalSignalsFetchLatency,
}

/// Bucket offset and scale for one [`BuyerReportType`]
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct BuyerReportConfig {
    pub bucket: u128,
    pub scale: f64,
}

/// Descriptor of an encrypted server-side auction response
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ServerResponseConfig {
    pub request_id: Uuid,
    pub response: Vec<u8>,
}

/// A seller's description of an auction
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct AuctionConfig {
    pub seller: Origin,
    /// Required unless `server_response` is set.
    pub decision_logic_url: Option<String>,
    pub trusted_scoring_signals_url: Option<String>,
    pub interest_group_buyers: Vec<Origin>,

    pub auction_signals: MaybePromise<Option<Value>>,
    pub seller_signals: MaybePromise<Option<Value>>,
    pub per_buyer_signals: MaybePromise<HashMap<Origin, Value>>,
    pub buyer_timeouts: MaybePromise<BuyerTimeouts>,
    pub buyer_cumulative_timeouts: MaybePromise<BuyerTimeouts>,
    pub buyer_currencies: MaybePromise<BuyerCurrencies>,
    pub direct_from_seller_signals: MaybePromise<Option<DirectFromSellerSignals>>,

    pub seller_timeout: Option<Duration>,
    pub seller_currency: Option<AdCurrency>,

    pub per_buyer_group_limits: HashMap<Origin, u16>,
    pub all_buyers_group_limit: Option<u16>,
    pub per_buyer_priority_signals: HashMap<Origin, HashMap<String, f64>>,
    pub all_buyers_priority_signals: HashMap<String, f64>,

    pub auction_nonce: Option<Uuid>,
    /// Bucket base for each buyer, parallel to `interest_group_buyers`.
    pub auction_report_buyer_keys: Vec<u128>,
    pub auction_report_buyers: HashMap<BuyerReportType, BuyerReportConfig>,

    pub component_auctions: Vec<AuctionConfig>,
    pub server_response: Option<ServerResponseConfig>,
}

impl AuctionConfig {
    /// Create a config with every promise field literal and empty.
    pub fn new(seller: impl Into<Origin>, decision_logic_url: impl Into<String>) -> Self {
        Self {
            seller: seller.into(),
            decision_logic_url: Some(decision_logic_url.into()),
            trusted_scoring_signals_url: None,
            interest_group_buyers: Vec::new(),
            auction_signals: MaybePromise::default(),
            seller_signals: MaybePromise::default(),
            per_buyer_signals: MaybePromise::default(),
            buyer_timeouts: MaybePromise::default(),
            buyer_cumulative_timeouts: MaybePromise::default(),
            buyer_currencies: MaybePromise::default(),
            direct_from_seller_signals: MaybePromise::default(),
            seller_timeout: None,
            seller_currency: None,
            per_buyer_group_limits: HashMap::new(),
            all_buyers_group_limit: None,
            per_buyer_priority_signals: HashMap::new(),
            all_buyers_priority_signals: HashMap::new(),
            auction_nonce: None,
            auction_report_buyer_keys: Vec::new(),
            auction_report_buyers: HashMap::new(),
            component_auctions: Vec::new(),
            server_response: None,
        }
    }

    pub fn with_buyers<I, O>(mut self, buyers: I) -> Self
    where
        I: IntoIterator<Item = O>,
        O: Into<Origin>,
    {
        self.interest_group_buyers = buyers.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_component(mut self, component: AuctionConfig) -> Self {
        self.component_auctions.push(component);
        self
    }

    pub fn is_pending(&self, field: ConfigField) -> bool {
        match field {
            ConfigField::AuctionSignals => self.auction_signals.is_pending(),
            ConfigField::SellerSignals => self.seller_signals.is_pending(),
            ConfigField::PerBuyerSignals => self.per_buyer_signals.is_pending(),
            ConfigField::BuyerTimeouts => self.buyer_timeouts.is_pending(),
            ConfigField::BuyerCumulativeTimeouts => self.buyer_cumulative_timeouts.is_pending(),
            ConfigField::BuyerCurrencies => self.buyer_currencies.is_pending(),
            ConfigField::DirectFromSellerSignals => self.direct_from_seller_signals.is_pending(),
        }
    }

    /// Check that `field` can accept a resolution without touching it.
    pub fn check_resolvable(&self, field: ConfigField) -> Result<(), PromiseStateError> {
        let err = match field {
            ConfigField::AuctionSignals => self.auction_signals.resolve_error(),
            ConfigField::SellerSignals => self.seller_signals.resolve_error(),
            ConfigField::PerBuyerSignals => self.per_buyer_signals.resolve_error(),
            ConfigField::BuyerTimeouts => self.buyer_timeouts.resolve_error(),
            ConfigField::BuyerCumulativeTimeouts => self.buyer_cumulative_timeouts.resolve_error(),
            ConfigField::BuyerCurrencies => self.buyer_currencies.resolve_error(),
            ConfigField::DirectFromSellerSignals => self.direct_from_seller_signals.resolve_error(),
        };
        err.map_or(Ok(()), Err)
    }

    /// True once none of `fields` is pending.
    pub fn all_resolved(&self, fields: &[ConfigField]) -> bool {
        fields.iter().all(|f| !self.is_pending(*f))
    }

    pub fn pending_fields(&self) -> Vec<ConfigField> {
        ConfigField::ALL
            .into_iter()
            .filter(|f| self.is_pending(*f))
            .collect()
    }

    /// Apply a resolution to the matching field.
    pub fn resolve(&mut self, resolution: PromiseResolution) -> Result<(), PromiseStateError> {
        match resolution {
            PromiseResolution::AuctionSignals(v) => self.auction_signals.resolve(v),
            PromiseResolution::SellerSignals(v) => self.seller_signals.resolve(v),
            PromiseResolution::PerBuyerSignals(v) => self.per_buyer_signals.resolve(v),
            PromiseResolution::BuyerTimeouts(v) => self.buyer_timeouts.resolve(v),
            PromiseResolution::BuyerCumulativeTimeouts(v) => {
                self.buyer_cumulative_timeouts.resolve(v)
            }
            PromiseResolution::BuyerCurrencies(v) => self.buyer_currencies.resolve(v),
            PromiseResolution::DirectFromSellerSignals(v) => {
                self.direct_from_seller_signals.resolve(v)
            }
        }
    }

    pub fn buyer_currency(&self, buyer: &Origin) -> Option<&AdCurrency> {
        self.buyer_currencies.value().and_then(|c| c.for_buyer(buyer))
    }

    pub fn per_buyer_signals_for(&self, buyer: &Origin) -> Option<&Value> {
        self.per_buyer_signals.value().and_then(|m| m.get(buyer))
    }

    /// Check structural rules a config must satisfy before it can run.
    pub fn validate(&self) -> Result<(), AuctionConfigError> {
        self.validate_level(true)
    }

    fn validate_level(&self, top_level: bool) -> Result<(), AuctionConfigError> {
        if self.decision_logic_url.is_none() && self.server_response.is_none() {
            return Err(AuctionConfigError::MissingDecisionLogic(self.seller.clone()));
        }
        if !self.auction_report_buyer_keys.is_empty()
            && self.auction_report_buyer_keys.len() > self.interest_group_buyers.len()
        {
            return Err(AuctionConfigError::Invalid(format!(
                "{} auctionReportBuyerKeys has more entries than interestGroupBuyers",
                self.seller
            )));
        }
        if !self.component_auctions.is_empty() {
            if !top_level {
                return Err(AuctionConfigError::NestedTooDeep(self.seller.clone()));
            }
            for component in &self.component_auctions {
                component.validate_level(false)?;
            }
        }
        Ok(())
    }
}
