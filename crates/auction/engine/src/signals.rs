//! Trusted bidding signals batching
//!
//! Interest groups of one buyer that share a trusted signals endpoint are
//! merged into a single fetch. The fetch starts when the first of those
//! groups asks for its signals and the response is demultiplexed per group.

use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;
use std::time::Duration;

use auction_types::{FetchError, InterestGroup};
use futures::future::{BoxFuture, FutureExt, Shared};
use serde_json::Value;
use tokio::time::Instant;
use tracing::debug;

use crate::traits::{SignalsKind, SignalsRequest, SignalsResponse, TrustedSignalsFetcher};

#[derive(Clone, Debug)]
struct Fetched {
    response: Arc<SignalsResponse>,
    duration: Duration,
}

type SharedFetch = Shared<BoxFuture<'static, Result<Fetched, FetchError>>>;

/// Signals for one interest group
#[derive(Clone, Debug, Default, PartialEq)]
pub struct GroupSignals {
    /// Values for the group's own keys only.
    pub values: HashMap<String, Value>,
    pub priority_vector: Option<HashMap<String, f64>>,
    pub data_version: Option<u32>,
    /// Wall time of the shared fetch.
    pub fetch_duration: Duration,
}

/// Merged bidding signals fetches for one buyer
pub struct BiddingSignalsBatcher {
    fetches: HashMap<String, SharedFetch>,
}

impl BiddingSignalsBatcher {
    pub fn new(fetcher: Arc<dyn TrustedSignalsFetcher>, groups: &[Arc<InterestGroup>]) -> Self {
        let mut batches: HashMap<String, (BTreeSet<String>, BTreeSet<String>)> = HashMap::new();
        for group in groups {
            if let Some(url) = &group.trusted_bidding_signals_url {
                let (keys, names) = batches.entry(url.clone()).or_default();
                keys.extend(group.trusted_bidding_signals_keys.iter().cloned());
                names.insert(group.name.clone());
            }
        }

        let fetches = batches
            .into_iter()
            .map(|(url, (keys, names))| {
                let request = SignalsRequest {
                    kind: SignalsKind::Bidding,
                    url: url.clone(),
                    keys: keys.into_iter().collect(),
                    interest_group_names: names.into_iter().collect(),
                };
                let fetcher = Arc::clone(&fetcher);
                let fetch = async move {
                    let started = Instant::now();
                    debug!(
                        url = %request.url,
                        keys = request.keys.len(),
                        "fetching trusted bidding signals"
                    );
                    let response = fetcher.fetch(request).await?;
                    Ok(Fetched {
                        response: Arc::new(response),
                        duration: started.elapsed(),
                    })
                }
                .boxed()
                .shared();
                (url, fetch)
            })
            .collect();

        Self { fetches }
    }

    /// Number of distinct fetches this batcher will make.
    pub fn batch_count(&self) -> usize {
        self.fetches.len()
    }

    /// Signals for `group`, or `None` if it has no signals endpoint.
    pub async fn signals_for(
        &self,
        group: &InterestGroup,
    ) -> Option<Result<GroupSignals, FetchError>> {
        let url = group.trusted_bidding_signals_url.as_ref()?;
        let fetch = self.fetches.get(url)?.clone();
        Some(fetch.await.map(|fetched| demultiplex(group, &fetched)))
    }
}

fn demultiplex(group: &InterestGroup, fetched: &Fetched) -> GroupSignals {
    let values = group
        .trusted_bidding_signals_keys
        .iter()
        .filter_map(|key| {
            fetched
                .response
                .values
                .get(key)
                .map(|v| (key.clone(), v.clone()))
        })
        .collect();
    let priority_vector = fetched
        .response
        .per_interest_group_data
        .get(&group.name)
        .and_then(|d| d.priority_vector.clone());
    GroupSignals {
        values,
        priority_vector,
        data_version: fetched.response.data_version,
        fetch_duration: fetched.duration,
    }
}

#[cfg(test)]
mod tests {
    use auction_types::InterestGroupAd;
    use serde_json::json;

    use super::*;
    use crate::mocks::MockSignalsFetcher;
    use crate::traits::PerGroupSignals;

    fn group(name: &str, url: &str, keys: &[&str]) -> Arc<InterestGroup> {
        Arc::new(
            InterestGroup::new("https://b.test", name, "https://b.test/bid.js")
                .with_ad(InterestGroupAd::new("https://ads.test/1"))
                .with_trusted_signals(url, keys.iter().map(|k| k.to_string()).collect()),
        )
    }

    #[tokio::test]
    async fn groups_sharing_an_endpoint_fetch_once() {
        let mut response = SignalsResponse {
            data_version: Some(4),
            ..Default::default()
        };
        response.values.insert("k1".into(), json!(1));
        response.values.insert("k2".into(), json!(2));
        response.per_interest_group_data.insert(
            "g2".into(),
            PerGroupSignals {
                priority_vector: Some(HashMap::from([("x".to_string(), 2.0)])),
            },
        );
        let fetcher = Arc::new(MockSignalsFetcher::new().with_response("https://s.test/a", response));

        let g1 = group("g1", "https://s.test/a", &["k1"]);
        let g2 = group("g2", "https://s.test/a", &["k2", "missing"]);
        let batcher = BiddingSignalsBatcher::new(fetcher.clone(), &[g1.clone(), g2.clone()]);
        assert_eq!(batcher.batch_count(), 1);

        let s1 = batcher.signals_for(&g1).await.unwrap().unwrap();
        let s2 = batcher.signals_for(&g2).await.unwrap().unwrap();
        assert_eq!(fetcher.fetch_count(), 1);

        assert_eq!(s1.values, HashMap::from([("k1".to_string(), json!(1))]));
        assert_eq!(s2.values, HashMap::from([("k2".to_string(), json!(2))]));
        assert!(s1.priority_vector.is_none());
        assert_eq!(s2.priority_vector.unwrap()["x"], 2.0);
        assert_eq!(s1.data_version, Some(4));

        let request = &fetcher.requests()[0];
        assert_eq!(request.keys, vec!["k1", "k2", "missing"]);
        assert_eq!(request.interest_group_names, vec!["g1", "g2"]);
    }

    #[tokio::test]
    async fn group_without_endpoint_has_no_signals() {
        let fetcher = Arc::new(MockSignalsFetcher::new());
        let plain = Arc::new(
            InterestGroup::new("https://b.test", "plain", "https://b.test/bid.js")
                .with_ad(InterestGroupAd::new("https://ads.test/1")),
        );
        let batcher = BiddingSignalsBatcher::new(fetcher.clone(), &[plain.clone()]);
        assert!(batcher.signals_for(&plain).await.is_none());
        assert_eq!(fetcher.fetch_count(), 0);
    }

    #[tokio::test]
    async fn fetch_failure_reaches_every_group() {
        let fetcher = Arc::new(MockSignalsFetcher::new());
        let g1 = group("g1", "https://s.test/down", &["k"]);
        let g2 = group("g2", "https://s.test/down", &["k"]);
        let batcher = BiddingSignalsBatcher::new(fetcher.clone(), &[g1.clone(), g2.clone()]);
        assert!(batcher.signals_for(&g1).await.unwrap().is_err());
        assert!(batcher.signals_for(&g2).await.unwrap().is_err());
        assert_eq!(fetcher.fetch_count(), 1);
    }
}
