//! Config promise gate
//!
//! Holds one auction level's config while some of its fields are still
//! pending. Stages wait for exactly the fields they depend on; everything
//! else proceeds. Each component auction has its own gate, addressed through
//! the auction's [`PromiseRouter`].

use std::sync::{Arc, Mutex, PoisonError};

use auction_types::{
    AuctionConfig, AuctionId, ConfigField, ConfigTarget, PromiseResolution, ProtocolViolation,
};
use tokio::sync::watch;
use tracing::{debug, warn};

/// Promise state of a single auction level
pub struct ConfigPromiseGate {
    target: ConfigTarget,
    tx: watch::Sender<Arc<AuctionConfig>>,
}

impl ConfigPromiseGate {
    pub fn new(target: ConfigTarget, config: AuctionConfig) -> Self {
        let (tx, _rx) = watch::channel(Arc::new(config));
        Self { target, tx }
    }

    pub fn target(&self) -> ConfigTarget {
        self.target
    }

    /// Current config, pending fields included.
    pub fn snapshot(&self) -> Arc<AuctionConfig> {
        Arc::clone(&self.tx.borrow())
    }

    /// Resolve one pending field. A rejected resolution leaves the config
    /// exactly as it was and wakes nobody.
    pub fn resolve(&self, resolution: PromiseResolution) -> Result<(), ProtocolViolation> {
        let field = resolution.field();
        let mut outcome = Ok(());
        self.tx.send_if_modified(|config| {
            if let Err(err) = config.check_resolvable(field) {
                outcome = Err(err);
                return false;
            }
            outcome = Arc::make_mut(config).resolve(resolution);
            outcome.is_ok()
        });
        outcome.map_err(|err| ProtocolViolation::from_promise_state(self.target, field, err))?;
        debug!(target_config = %self.target, %field, "promise resolved");
        Ok(())
    }

    /// Wait until none of `fields` is pending and return that config.
    pub async fn wait_for(&self, fields: &[ConfigField]) -> Arc<AuctionConfig> {
        let mut rx = self.tx.subscribe();
        let config = match rx.wait_for(|config| config.all_resolved(fields)).await {
            Ok(config) => Arc::clone(&config),
            // The sender lives in `self`, so the channel cannot close here.
            Err(_) => self.snapshot(),
        };
        config
    }
}

/// Routes caller resolutions to the right level of one auction and keeps
/// the resulting protocol violations.
pub struct PromiseRouter {
    auction_id: AuctionId,
    top: Arc<ConfigPromiseGate>,
    components: Vec<Arc<ConfigPromiseGate>>,
    violations: Mutex<Vec<String>>,
}

impl PromiseRouter {
    /// Split `config` into a top-level gate and one gate per component.
    pub fn new(auction_id: AuctionId, mut config: AuctionConfig) -> Self {
        let components = std::mem::take(&mut config.component_auctions)
            .into_iter()
            .enumerate()
            .map(|(i, c)| Arc::new(ConfigPromiseGate::new(ConfigTarget::Component(i), c)))
            .collect();
        Self {
            auction_id,
            top: Arc::new(ConfigPromiseGate::new(ConfigTarget::TopLevel, config)),
            components,
            violations: Mutex::new(Vec::new()),
        }
    }

    pub fn top(&self) -> &Arc<ConfigPromiseGate> {
        &self.top
    }

    pub fn components(&self) -> &[Arc<ConfigPromiseGate>] {
        &self.components
    }

    pub fn gate(&self, target: ConfigTarget) -> Option<&Arc<ConfigPromiseGate>> {
        match target {
            ConfigTarget::TopLevel => Some(&self.top),
            ConfigTarget::Component(i) => self.components.get(i),
        }
    }

    pub fn resolve(
        &self,
        target: ConfigTarget,
        resolution: PromiseResolution,
    ) -> Result<(), ProtocolViolation> {
        let result = match (target, self.gate(target)) {
            (_, Some(gate)) => gate.resolve(resolution),
            (ConfigTarget::Component(index), None) => {
                Err(ProtocolViolation::NoSuchComponent { index })
            }
            (ConfigTarget::TopLevel, None) => {
                Err(ProtocolViolation::UnknownAuction(self.auction_id))
            }
        };
        if let Err(violation) = &result {
            self.record(violation);
        }
        result
    }

    /// Record a protocol violation against this auction.
    pub fn record(&self, violation: &ProtocolViolation) {
        warn!(auction_id = %self.auction_id, %violation, "protocol violation");
        self.violations
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(violation.to_string());
    }

    pub fn violations(&self) -> Vec<String> {
        self.violations
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use auction_types::{MaybePromise, Origin};
    use serde_json::json;

    use super::*;

    fn config() -> AuctionConfig {
        let mut c = AuctionConfig::new("https://seller.test", "https://seller.test/d.js")
            .with_buyers(["https://b.test"]);
        c.seller_signals = MaybePromise::Pending;
        c
    }

    #[tokio::test]
    async fn waiter_released_once_fields_resolve() {
        let gate = Arc::new(ConfigPromiseGate::new(ConfigTarget::TopLevel, config()));

        // Bidder fields are all literal, so this returns at once.
        let ready = gate.wait_for(&ConfigField::BIDDER_FIELDS).await;
        assert!(ready.seller_signals.is_pending());

        let waiter = {
            let gate = Arc::clone(&gate);
            tokio::spawn(async move { gate.wait_for(&ConfigField::SELLER_FIELDS).await })
        };
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert!(!waiter.is_finished());

        gate.resolve(PromiseResolution::SellerSignals(Some(json!({"x": 1}))))
            .unwrap();
        let resolved = waiter.await.unwrap();
        assert_eq!(resolved.seller_signals.value(), Some(&Some(json!({"x": 1}))));
    }

    #[tokio::test]
    async fn double_resolution_keeps_first_value() {
        let gate = ConfigPromiseGate::new(ConfigTarget::TopLevel, config());
        gate.resolve(PromiseResolution::SellerSignals(Some(json!(1))))
            .unwrap();
        let err = gate
            .resolve(PromiseResolution::SellerSignals(Some(json!(2))))
            .unwrap_err();
        assert!(matches!(err, ProtocolViolation::AlreadyResolved { .. }));
        assert_eq!(gate.snapshot().seller_signals.value(), Some(&Some(json!(1))));
    }

    #[tokio::test]
    async fn literal_field_cannot_be_resolved() {
        let gate = ConfigPromiseGate::new(ConfigTarget::TopLevel, config());
        let before = gate.snapshot();
        let err = gate
            .resolve(PromiseResolution::AuctionSignals(Some(json!("late"))))
            .unwrap_err();
        assert_eq!(
            err,
            ProtocolViolation::FieldNotPending {
                target: ConfigTarget::TopLevel,
                field: ConfigField::AuctionSignals,
            }
        );
        assert_eq!(*gate.snapshot(), *before);
    }

    #[tokio::test]
    async fn router_addresses_components_independently() {
        let mut component = AuctionConfig::new("https://c.test", "https://c.test/d.js");
        component.auction_signals = MaybePromise::Pending;
        let top = AuctionConfig::new("https://top.test", "https://top.test/d.js")
            .with_component(component);
        let router = PromiseRouter::new(AuctionId::generate(), top);

        assert!(router.top().snapshot().component_auctions.is_empty());
        assert_eq!(router.components().len(), 1);

        // Top-level auctionSignals is literal; the component's is pending.
        assert!(router
            .resolve(ConfigTarget::TopLevel, PromiseResolution::AuctionSignals(None))
            .is_err());
        router
            .resolve(ConfigTarget::Component(0), PromiseResolution::AuctionSignals(None))
            .unwrap();

        let err = router
            .resolve(ConfigTarget::Component(3), PromiseResolution::AuctionSignals(None))
            .unwrap_err();
        assert_eq!(err, ProtocolViolation::NoSuchComponent { index: 3 });
        assert_eq!(router.violations().len(), 2);
        assert_eq!(router.components()[0].snapshot().seller, Origin::new("https://c.test"));
    }
}
