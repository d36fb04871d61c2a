//! Aggregatable reporting contributions
//!
//! Worklets return [`AggregationRequest`]s whose bucket and value may be
//! literal or derived from a named base value. The engine resolves them into
//! plain [`AggregationContribution`]s once the base values are known.

use serde::{Deserialize, Serialize};

use crate::ids::Origin;

/// Runtime signals a contribution may be derived from
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum BaseValue {
    WinningBid,
    HighestScoringOtherBid,
    ScriptRunTime,
    SignalsFetchTime,
    BidRejectReason,
}

/// Offset added to a derived bucket. Buckets are unsigned, so the sign is
/// carried separately.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct BucketOffset {
    pub value: u128,
    pub is_negative: bool,
}

#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum BucketSpec {
    Literal(u128),
    Derived {
        base_value: BaseValue,
        scale: Option<f64>,
        offset: Option<BucketOffset>,
    },
}

#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum ValueSpec {
    Literal(i32),
    Derived {
        base_value: BaseValue,
        scale: Option<f64>,
        offset: Option<i32>,
    },
}

/// When a contribution should be sent
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ContributionEvent {
    /// `reserved.win`
    Win,
    /// `reserved.loss`
    Loss,
    /// `reserved.always`
    Always,
    /// Non-reserved event name, triggered later by the rendered ad.
    Custom(String),
}

impl ContributionEvent {
    /// Parse an event name. Unknown `reserved.` names are rejected.
    pub fn parse(name: &str) -> Option<Self> {
        match name {
            "reserved.win" => Some(Self::Win),
            "reserved.loss" => Some(Self::Loss),
            "reserved.always" => Some(Self::Always),
            other if other.starts_with("reserved.") => None,
            other => Some(Self::Custom(other.to_string())),
        }
    }
}

/// A contribution as returned by a worklet
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct AggregationRequest {
    pub bucket: BucketSpec,
    pub value: ValueSpec,
    pub event: ContributionEvent,
    pub debug_mode: bool,
}

impl AggregationRequest {
    pub fn literal(bucket: u128, value: i32, event: ContributionEvent) -> Self {
        Self {
            bucket: BucketSpec::Literal(bucket),
            value: ValueSpec::Literal(value),
            event,
            debug_mode: false,
        }
    }

    /// Structural check applied when a worklet hands the request over.
    pub fn check(&self) -> Result<(), String> {
        if let ValueSpec::Literal(v) = self.value {
            if v < 0 {
                return Err(format!("negative aggregation value {}", v));
            }
        }
        Ok(())
    }
}

/// A fully resolved bucket/value pair
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct AggregationContribution {
    pub bucket: u128,
    pub value: i32,
}

/// A contribution attributed to the origin whose worklet requested it
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ResolvedContribution {
    pub reporting_origin: Origin,
    pub contribution: AggregationContribution,
    pub debug_mode: bool,
}

/// A custom-event contribution returned to the caller un-triggered
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct EventContribution {
    pub reporting_origin: Origin,
    pub event: String,
    pub contribution: AggregationContribution,
}
