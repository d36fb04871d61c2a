//! Error taxonomy shared by the engine and its collaborators

use thiserror::Error;

use crate::ids::{AuctionId, InterestGroupKey, Origin};
use crate::promise::ConfigField;

/// Invalid currency code
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum CurrencyError {
    #[error("invalid currency code: {0}")]
    InvalidCode(String),
}

/// Outcome of a rejected transition on a single promise field
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum PromiseStateError {
    #[error("field was not pending")]
    NotPending,

    #[error("field was already resolved")]
    AlreadyResolved,
}

/// Which config in an auction tree a resolution addresses
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, serde::Serialize, serde::Deserialize)]
pub enum ConfigTarget {
    TopLevel,
    Component(usize),
}

impl std::fmt::Display for ConfigTarget {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::TopLevel => write!(f, "top-level auction"),
            Self::Component(i) => write!(f, "component auction {}", i),
        }
    }
}

/// Messages that no well-behaved caller or worklet could send.
///
/// These are kept apart from ordinary script errors and reported on the
/// auction's bad-message channel.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum ProtocolViolation {
    #[error("{field} of {target} was not pending")]
    FieldNotPending {
        target: ConfigTarget,
        field: ConfigField,
    },

    #[error("{field} of {target} was already resolved")]
    AlreadyResolved {
        target: ConfigTarget,
        field: ConfigField,
    },

    #[error("no component auction at index {index}")]
    NoSuchComponent { index: usize },

    #[error("unknown auction: {0}")]
    UnknownAuction(AuctionId),

    #[error("invalid bid from {group}: {reason}")]
    InvalidBid {
        group: InterestGroupKey,
        reason: String,
    },

    #[error("invalid score from {seller}: {reason}")]
    InvalidScore { seller: Origin, reason: String },

    #[error("invalid aggregation request from {origin}: {reason}")]
    InvalidAggregationRequest { origin: Origin, reason: String },
}

impl ProtocolViolation {
    pub fn from_promise_state(
        target: ConfigTarget,
        field: ConfigField,
        err: PromiseStateError,
    ) -> Self {
        match err {
            PromiseStateError::NotPending => Self::FieldNotPending { target, field },
            PromiseStateError::AlreadyResolved => Self::AlreadyResolved { target, field },
        }
    }
}

/// Failures of a worklet process
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum WorkletError {
    #[error("worklet crashed: {reason}")]
    Crashed { reason: String },

    #[error("failed to load {url}: {reason}")]
    LoadFailed { url: String, reason: String },
}

/// Failures fetching trusted signals
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum FetchError {
    #[error("failed to fetch {url}: {reason}")]
    Network { url: String, reason: String },

    #[error("malformed response from {url}: {reason}")]
    Malformed { url: String, reason: String },
}

/// Failures decoding an encrypted server auction response
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ServerResponseError {
    #[error("malformed server auction response: {0}")]
    Malformed(String),

    #[error("server auction response was not witnessed")]
    NotWitnessed,

    #[error("server auction response seller mismatch: expected {expected}, got {actual}")]
    SellerMismatch { expected: Origin, actual: Origin },

    #[error("could not decrypt server auction response")]
    DecryptionFailed,

    #[error("server auction response names unknown interest group {0}")]
    UnknownInterestGroup(InterestGroupKey),

    #[error("server auction response names ad {url} not in interest group {group}")]
    UnknownAd { group: InterestGroupKey, url: String },
}

/// Structural problems in an auction config
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum AuctionConfigError {
    #[error("auction config for {0} has no decision logic")]
    MissingDecisionLogic(Origin),

    #[error("component auction {0} may not have component auctions of its own")]
    NestedTooDeep(Origin),

    #[error("invalid auction config: {0}")]
    Invalid(String),
}
