//! Private aggregation contribution resolution

use std::time::Duration;

use auction_types::{
    AggregationContribution, AggregationRequest, BaseValue, BucketSpec, ContributionEvent,
    RejectReason, ValueSpec,
};

/// Auction values a derived contribution may be computed from. A base value
/// that is `None` never materialized for the calling script, and any
/// contribution derived from it is dropped.
#[derive(Clone, Copy, Debug, Default, PartialEq)]
pub struct BaseValues {
    pub winning_bid: f64,
    /// Zero when there was no other bid.
    pub highest_scoring_other_bid: f64,
    pub script_run_time: Option<Duration>,
    pub signals_fetch_time: Option<Duration>,
    /// Only generateBid() and scoreAd() contributions carry one.
    pub reject_reason: Option<RejectReason>,
}

impl BaseValues {
    fn get(&self, base: BaseValue) -> Option<f64> {
        match base {
            BaseValue::WinningBid => Some(self.winning_bid),
            BaseValue::HighestScoringOtherBid => Some(self.highest_scoring_other_bid),
            BaseValue::ScriptRunTime => self.script_run_time.map(|d| d.as_millis() as f64),
            BaseValue::SignalsFetchTime => self.signals_fetch_time.map(|d| d.as_millis() as f64),
            BaseValue::BidRejectReason => self.reject_reason.map(|r| r.code() as f64),
        }
    }
}

/// Where a contribution goes once the auction outcome is known
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Routing {
    Report,
    /// Held for a caller-triggered event.
    Event(String),
    Drop,
}

/// Route a contribution from a bid that did or did not win.
pub fn route(event: &ContributionEvent, won: bool) -> Routing {
    match (event, won) {
        (ContributionEvent::Always, _) => Routing::Report,
        (ContributionEvent::Win, true) | (ContributionEvent::Loss, false) => Routing::Report,
        (ContributionEvent::Custom(name), true) => Routing::Event(name.clone()),
        _ => Routing::Drop,
    }
}

fn resolve_bucket(spec: &BucketSpec, base: &BaseValues) -> Option<u128> {
    match *spec {
        BucketSpec::Literal(bucket) => Some(bucket),
        BucketSpec::Derived {
            base_value,
            scale,
            offset,
        } => {
            let scaled = base.get(base_value)? * scale.unwrap_or(1.0);
            let bucket = if scaled.is_nan() || scaled <= 0.0 {
                0
            } else if !scaled.is_finite() || scaled >= u128::MAX as f64 {
                u128::MAX
            } else {
                scaled as u128
            };
            Some(match offset {
                Some(o) if o.is_negative => bucket.saturating_sub(o.value),
                Some(o) => bucket.saturating_add(o.value),
                None => bucket,
            })
        }
    }
}

fn resolve_value(spec: &ValueSpec, base: &BaseValues) -> Option<i32> {
    match *spec {
        ValueSpec::Literal(value) => Some(value.max(0)),
        ValueSpec::Derived {
            base_value,
            scale,
            offset,
        } => {
            // `as` saturates and maps NaN to zero.
            let scaled = (base.get(base_value)? * scale.unwrap_or(1.0)) as i32;
            Some(
                scaled
                    .max(0)
                    .saturating_add(offset.unwrap_or(0))
                    .max(0),
            )
        }
    }
}

/// Compute the concrete bucket and value of `request`, or `None` when it
/// depends on a base value that never materialized.
pub fn resolve(
    request: &AggregationRequest,
    base: &BaseValues,
) -> Option<AggregationContribution> {
    Some(AggregationContribution {
        bucket: resolve_bucket(&request.bucket, base)?,
        value: resolve_value(&request.value, base)?,
    })
}

#[cfg(test)]
mod tests {
    use auction_types::BucketOffset;
    use proptest::prelude::*;

    use super::*;

    fn derived_bucket(
        base_value: BaseValue,
        scale: f64,
        offset: Option<BucketOffset>,
    ) -> AggregationRequest {
        AggregationRequest {
            bucket: BucketSpec::Derived {
                base_value,
                scale: Some(scale),
                offset,
            },
            value: ValueSpec::Literal(1),
            event: ContributionEvent::Always,
            debug_mode: false,
        }
    }

    #[test]
    fn negative_scaled_bucket_clamps_to_zero() {
        let base = BaseValues {
            winning_bid: 2.0,
            ..Default::default()
        };
        let out = resolve(&derived_bucket(BaseValue::WinningBid, -200.0, None), &base);
        assert_eq!(out, Some(AggregationContribution { bucket: 0, value: 1 }));
    }

    #[test]
    fn huge_bucket_saturates() {
        let base = BaseValues {
            winning_bid: 1e300,
            ..Default::default()
        };
        let offset = BucketOffset {
            value: 5,
            is_negative: false,
        };
        let out = resolve(&derived_bucket(BaseValue::WinningBid, 1e300, Some(offset)), &base);
        assert_eq!(out.map(|c| c.bucket), Some(u128::MAX));
    }

    #[test]
    fn bucket_offsets_apply() {
        let base = BaseValues {
            winning_bid: 10.0,
            ..Default::default()
        };
        let sub = BucketOffset {
            value: 3,
            is_negative: true,
        };
        let bucket = |offset| {
            resolve(&derived_bucket(BaseValue::WinningBid, 2.0, Some(offset)), &base)
                .map(|c| c.bucket)
        };
        assert_eq!(bucket(sub), Some(17));
        let big = BucketOffset {
            value: 100,
            is_negative: true,
        };
        assert_eq!(bucket(big), Some(0));
    }

    #[test]
    fn derived_values_clamp() {
        let base = BaseValues {
            script_run_time: Some(Duration::from_millis(40)),
            reject_reason: Some(RejectReason::BlockedByPublisher),
            ..Default::default()
        };
        let value = |base_value, scale, offset| {
            let req = AggregationRequest {
                bucket: BucketSpec::Literal(1),
                value: ValueSpec::Derived {
                    base_value,
                    scale,
                    offset,
                },
                event: ContributionEvent::Always,
                debug_mode: false,
            };
            resolve(&req, &base).map(|c| c.value)
        };
        assert_eq!(value(BaseValue::ScriptRunTime, None, None), Some(40));
        assert_eq!(value(BaseValue::ScriptRunTime, Some(-1.0), Some(5)), Some(5));
        assert_eq!(value(BaseValue::ScriptRunTime, Some(1e12), Some(7)), Some(i32::MAX));
        assert_eq!(value(BaseValue::BidRejectReason, None, Some(-10)), Some(0));
        assert_eq!(value(BaseValue::HighestScoringOtherBid, None, None), Some(0));
    }

    #[test]
    fn missing_base_values_drop_the_contribution() {
        let base = BaseValues {
            winning_bid: 3.0,
            ..Default::default()
        };
        let value_from = |base_value| AggregationRequest {
            bucket: BucketSpec::Literal(1),
            value: ValueSpec::Derived {
                base_value,
                scale: None,
                offset: Some(4),
            },
            event: ContributionEvent::Always,
            debug_mode: false,
        };
        assert_eq!(resolve(&value_from(BaseValue::BidRejectReason), &base), None);
        assert_eq!(resolve(&value_from(BaseValue::SignalsFetchTime), &base), None);
        assert_eq!(resolve(&value_from(BaseValue::ScriptRunTime), &base), None);
        assert_eq!(
            resolve(&derived_bucket(BaseValue::BidRejectReason, 1.0, None), &base),
            None
        );
        assert!(resolve(&value_from(BaseValue::WinningBid), &base).is_some());
    }

    #[test]
    fn routing_by_outcome() {
        assert_eq!(route(&ContributionEvent::Always, false), Routing::Report);
        assert_eq!(route(&ContributionEvent::Win, true), Routing::Report);
        assert_eq!(route(&ContributionEvent::Win, false), Routing::Drop);
        assert_eq!(route(&ContributionEvent::Loss, false), Routing::Report);
        assert_eq!(route(&ContributionEvent::Loss, true), Routing::Drop);
        assert_eq!(
            route(&ContributionEvent::Custom("click".into()), true),
            Routing::Event("click".into())
        );
        assert_eq!(route(&ContributionEvent::Custom("click".into()), false), Routing::Drop);
    }

    proptest! {
        #[test]
        fn derived_values_are_never_negative(
            bid in prop::num::f64::ANY,
            scale in prop::option::of(prop::num::f64::ANY),
            offset in prop::option::of(any::<i32>()),
        ) {
            let base = BaseValues {
                winning_bid: bid,
                ..Default::default()
            };
            let req = AggregationRequest {
                bucket: BucketSpec::Derived {
                    base_value: BaseValue::WinningBid,
                    scale,
                    offset: None,
                },
                value: ValueSpec::Derived {
                    base_value: BaseValue::WinningBid,
                    scale,
                    offset,
                },
                event: ContributionEvent::Always,
                debug_mode: false,
            };
            let out = resolve(&req, &base);
            prop_assert!(out.is_some());
            let out = out.unwrap();
            prop_assert!(out.value >= 0);
            let scaled = bid * scale.unwrap_or(1.0);
            if scaled.is_nan() || scaled <= 0.0 {
                prop_assert_eq!(out.bucket, 0);
            }
        }
    }
}
