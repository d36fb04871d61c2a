//! Promise-capable configuration fields
//!
//! Fields of an [`AuctionConfig`](crate::AuctionConfig) that a page may
//! supply after the auction has started. Each is a [`MaybePromise`] with a
//! single one-way transition: `Pending -> Resolved`.

use std::collections::HashMap;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::currency::AdCurrency;
use crate::errors::PromiseStateError;
use crate::ids::Origin;

/// A configuration value that is literal, pending, or resolved.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "state", content = "value", rename_all = "lowercase")]
pub enum MaybePromise<T> {
    /// Supplied at creation; can never be resolved.
    Literal(T),
    /// Awaiting a value from the caller.
    Pending,
    /// Supplied later through promise resolution.
    Resolved(T),
}

impl<T> MaybePromise<T> {
    pub fn is_pending(&self) -> bool {
        matches!(self, Self::Pending)
    }

    /// The value in effect, if any.
    pub fn value(&self) -> Option<&T> {
        match self {
            Self::Literal(v) | Self::Resolved(v) => Some(v),
            Self::Pending => None,
        }
    }

    /// Why this field cannot be resolved, if it cannot.
    pub fn resolve_error(&self) -> Option<PromiseStateError> {
        match self {
            Self::Pending => None,
            Self::Literal(_) => Some(PromiseStateError::NotPending),
            Self::Resolved(_) => Some(PromiseStateError::AlreadyResolved),
        }
    }

    /// Apply a resolution. Rejected resolutions leave the field untouched.
    pub fn resolve(&mut self, value: T) -> Result<(), PromiseStateError> {
        match self {
            Self::Pending => {
                *self = Self::Resolved(value);
                Ok(())
            }
            Self::Literal(_) => Err(PromiseStateError::NotPending),
            Self::Resolved(_) => Err(PromiseStateError::AlreadyResolved),
        }
    }
}

impl<T: Default> Default for MaybePromise<T> {
    fn default() -> Self {
        Self::Literal(T::default())
    }
}

/// Names of the promise-capable fields
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum ConfigField {
    AuctionSignals,
    SellerSignals,
    PerBuyerSignals,
    BuyerTimeouts,
    BuyerCumulativeTimeouts,
    BuyerCurrencies,
    DirectFromSellerSignals,
}

impl ConfigField {
    pub const ALL: [ConfigField; 7] = [
        ConfigField::AuctionSignals,
        ConfigField::SellerSignals,
        ConfigField::PerBuyerSignals,
        ConfigField::BuyerTimeouts,
        ConfigField::BuyerCumulativeTimeouts,
        ConfigField::BuyerCurrencies,
        ConfigField::DirectFromSellerSignals,
    ];

    /// Fields `generateBid` depends on.
    pub const BIDDER_FIELDS: [ConfigField; 6] = [
        ConfigField::AuctionSignals,
        ConfigField::PerBuyerSignals,
        ConfigField::BuyerTimeouts,
        ConfigField::BuyerCumulativeTimeouts,
        ConfigField::BuyerCurrencies,
        ConfigField::DirectFromSellerSignals,
    ];

    /// Fields seller scoring depends on.
    pub const SELLER_FIELDS: [ConfigField; 7] = Self::ALL;
}

impl std::fmt::Display for ConfigField {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Self::AuctionSignals => "auctionSignals",
            Self::SellerSignals => "sellerSignals",
            Self::PerBuyerSignals => "perBuyerSignals",
            Self::BuyerTimeouts => "perBuyerTimeouts",
            Self::BuyerCumulativeTimeouts => "perBuyerCumulativeTimeouts",
            Self::BuyerCurrencies => "perBuyerCurrencies",
            Self::DirectFromSellerSignals => "directFromSellerSignals",
        };
        write!(f, "{}", name)
    }
}

/// Per-buyer timeouts with an all-buyers fallback
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct BuyerTimeouts {
    pub per_buyer: HashMap<Origin, Duration>,
    pub all_buyers: Option<Duration>,
}

impl BuyerTimeouts {
    pub fn for_buyer(&self, buyer: &Origin) -> Option<Duration> {
        self.per_buyer.get(buyer).copied().or(self.all_buyers)
    }
}

/// Per-buyer currencies with an all-buyers fallback
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct BuyerCurrencies {
    pub per_buyer: HashMap<Origin, AdCurrency>,
    pub all_buyers: Option<AdCurrency>,
}

impl BuyerCurrencies {
    pub fn for_buyer(&self, buyer: &Origin) -> Option<&AdCurrency> {
        self.per_buyer.get(buyer).or(self.all_buyers.as_ref())
    }
}

/// Signals delivered by the seller out of band of the page
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct DirectFromSellerSignals {
    pub seller_signals: Option<Value>,
    pub auction_signals: Option<Value>,
    pub per_buyer_signals: HashMap<Origin, Value>,
}

impl DirectFromSellerSignals {
    pub fn for_buyer(&self, buyer: &Origin) -> Option<&Value> {
        self.per_buyer_signals.get(buyer)
    }
}

/// A value supplied for one pending field
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "field", content = "value", rename_all = "camelCase")]
pub enum PromiseResolution {
    AuctionSignals(Option<Value>),
    SellerSignals(Option<Value>),
    PerBuyerSignals(HashMap<Origin, Value>),
    BuyerTimeouts(BuyerTimeouts),
    BuyerCumulativeTimeouts(BuyerTimeouts),
    BuyerCurrencies(BuyerCurrencies),
    DirectFromSellerSignals(Option<DirectFromSellerSignals>),
}

impl PromiseResolution {
    pub fn field(&self) -> ConfigField {
        match self {
            Self::AuctionSignals(_) => ConfigField::AuctionSignals,
            Self::SellerSignals(_) => ConfigField::SellerSignals,
            Self::PerBuyerSignals(_) => ConfigField::PerBuyerSignals,
            Self::BuyerTimeouts(_) => ConfigField::BuyerTimeouts,
            Self::BuyerCumulativeTimeouts(_) => ConfigField::BuyerCumulativeTimeouts,
            Self::BuyerCurrencies(_) => ConfigField::BuyerCurrencies,
            Self::DirectFromSellerSignals(_) => ConfigField::DirectFromSellerSignals,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pending_resolves_once() {
        let mut p: MaybePromise<u32> = MaybePromise::Pending;
        assert!(p.is_pending());
        assert_eq!(p.value(), None);
        p.resolve(7).unwrap();
        assert_eq!(p.value(), Some(&7));
        assert_eq!(p.resolve(8), Err(PromiseStateError::AlreadyResolved));
        assert_eq!(p.value(), Some(&7));
    }

    #[test]
    fn literal_cannot_be_resolved() {
        let mut p = MaybePromise::Literal(3);
        assert_eq!(p.resolve(4), Err(PromiseStateError::NotPending));
        assert_eq!(p, MaybePromise::Literal(3));
    }

    #[test]
    fn buyer_lookup_falls_back_to_all_buyers() {
        let buyer = Origin::new("https://b.test");
        let other = Origin::new("https://o.test");
        let mut timeouts = BuyerTimeouts {
            all_buyers: Some(Duration::from_millis(100)),
            ..Default::default()
        };
        timeouts.per_buyer.insert(buyer.clone(), Duration::from_millis(20));
        assert_eq!(timeouts.for_buyer(&buyer), Some(Duration::from_millis(20)));
        assert_eq!(timeouts.for_buyer(&other), Some(Duration::from_millis(100)));
    }

    #[test]
    fn resolution_names_its_field() {
        let r = PromiseResolution::BuyerCurrencies(BuyerCurrencies::default());
        assert_eq!(r.field(), ConfigField::BuyerCurrencies);
        assert_eq!(r.field().to_string(), "perBuyerCurrencies");
    }

    #[test]
    fn bidder_fields_exclude_seller_signals() {
        assert!(!ConfigField::BIDDER_FIELDS.contains(&ConfigField::SellerSignals));
        assert!(ConfigField::SELLER_FIELDS.contains(&ConfigField::SellerSignals));
    }
}
