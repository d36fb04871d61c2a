//! Interest group prioritization
//!
//! Decides which of a buyer's interest groups get to bid, and in what order.
//! A group's priority is its base priority, or the dot product of its
//! priority vector with the priority signals when it has one. Groups with a
//! negative priority are dropped and the rest are capped at the buyer's
//! group limit, breaking priority ties at random.

use std::collections::HashMap;
use std::sync::Arc;

use auction_types::{AuctionConfig, InterestGroup, Origin};
use chrono::{DateTime, Utc};

use crate::random::{shuffle, RandomSource};

/// A group admitted to bid, with the priority that admitted it
#[derive(Clone, Debug)]
pub struct PrioritizedGroup {
    pub group: Arc<InterestGroup>,
    pub priority: f64,
}

/// Sum of `vector[k] * signals[k]` over keys present in both.
pub fn dot_product(vector: &HashMap<String, f64>, signals: &HashMap<String, f64>) -> f64 {
    vector
        .iter()
        .filter_map(|(k, v)| signals.get(k).map(|s| v * s))
        .sum()
}

/// Priority signals visible to `group`'s priority vector.
///
/// Later sources win: all-buyers config signals, per-buyer config signals,
/// browser signals, then the group's own overrides.
pub fn priority_signals(
    group: &InterestGroup,
    config: &AuctionConfig,
    now: DateTime<Utc>,
) -> HashMap<String, f64> {
    let mut signals = config.all_buyers_priority_signals.clone();
    if let Some(per_buyer) = config.per_buyer_priority_signals.get(&group.owner) {
        signals.extend(per_buyer.iter().map(|(k, v)| (k.clone(), *v)));
    }

    let age_minutes = (now - group.join_time).num_minutes().max(0) as f64;
    signals.insert("browserSignals.one".into(), 1.0);
    signals.insert("browserSignals.basePriority".into(), group.priority);
    signals.insert("browserSignals.ageInMinutes".into(), age_minutes);
    signals.insert("browserSignals.ageInMinutesMax60".into(), age_minutes.min(60.0));
    signals.insert(
        "browserSignals.ageInHoursMax24".into(),
        (age_minutes / 60.0).floor().min(24.0),
    );
    signals.insert(
        "browserSignals.ageInDaysMax30".into(),
        (age_minutes / (60.0 * 24.0)).floor().min(30.0),
    );

    if let Some(overrides) = &group.priority_signals_overrides {
        signals.extend(overrides.iter().map(|(k, v)| (k.clone(), *v)));
    }
    signals
}

/// Priority of `group` before any trusted signals are known.
pub fn base_priority(group: &InterestGroup, config: &AuctionConfig, now: DateTime<Utc>) -> f64 {
    match &group.priority_vector {
        Some(vector) => dot_product(vector, &priority_signals(group, config, now)),
        None => group.priority,
    }
}

/// Group limit applying to `buyer`.
pub fn group_limit(config: &AuctionConfig, buyer: &Origin, default_limit: u16) -> usize {
    config
        .per_buyer_group_limits
        .get(buyer)
        .copied()
        .or(config.all_buyers_group_limit)
        .unwrap_or(default_limit) as usize
}

/// Select and order the groups of `buyer` allowed to bid.
pub fn prioritize(
    groups: Vec<InterestGroup>,
    config: &AuctionConfig,
    buyer: &Origin,
    default_limit: u16,
    random: &dyn RandomSource,
    now: DateTime<Utc>,
) -> Vec<PrioritizedGroup> {
    let mut admitted: Vec<PrioritizedGroup> = groups
        .into_iter()
        .filter(|g| g.can_bid())
        .filter_map(|g| {
            let priority = base_priority(&g, config, now);
            (priority >= 0.0).then(|| PrioritizedGroup {
                group: Arc::new(g),
                priority,
            })
        })
        .collect();

    shuffle(&mut admitted, random);
    admitted.sort_by(|a, b| b.priority.total_cmp(&a.priority));
    admitted.truncate(group_limit(config, buyer, default_limit));
    admitted
}

/// Recompute a group's priority from a priority vector returned by its
/// trusted signals server. `None` means the group should not bid.
pub fn reprioritize(
    group: &InterestGroup,
    signals_vector: &HashMap<String, f64>,
    first_priority: f64,
    config: &AuctionConfig,
    now: DateTime<Utc>,
) -> Option<f64> {
    let mut signals = priority_signals(group, config, now);
    signals.insert("browserSignals.firstDotProductPriority".into(), first_priority);
    let priority = dot_product(signals_vector, &signals);
    (priority >= 0.0).then_some(priority)
}
