//! Auction engine entry point
//!
//! [`AuctionEngine`] owns the worker process pool and the registry of live
//! auctions. Each started auction runs as its own task; callers resolve
//! pending config promises and abort through its [`AuctionHandle`] or
//! through the engine by auction id.

use std::sync::Arc;

use auction_types::{
    AuctionConfig, AuctionId, AuctionOutcome, AuctionResult, ConfigTarget, Origin,
    PromiseResolution, ProtocolViolation,
};
use dashmap::DashMap;
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tracing::{info, instrument};

use crate::admission::ProcessSlotPool;
use crate::auction::{run_level, EngineContext, LevelContext, LevelOutcome};
use crate::config::EngineConfig;
use crate::error::{AuctionError, Result};
use crate::promise_gate::PromiseRouter;
use crate::random::{RandomSource, ThreadRandom};
use crate::reporting::run_reporting;
use crate::server_response::run_server_auction;
use crate::traits::{InterestGroupStore, ServerResponseDecoder, TrustedSignalsFetcher, WorkletHost};

/// Collaborators the engine runs against
#[derive(Clone)]
pub struct EngineDeps {
    pub worklets: Arc<dyn WorkletHost>,
    pub store: Arc<dyn InterestGroupStore>,
    pub signals: Arc<dyn TrustedSignalsFetcher>,
    pub server_decoder: Option<Arc<dyn ServerResponseDecoder>>,
    pub random: Arc<dyn RandomSource>,
}

impl EngineDeps {
    pub fn new(
        worklets: Arc<dyn WorkletHost>,
        store: Arc<dyn InterestGroupStore>,
        signals: Arc<dyn TrustedSignalsFetcher>,
    ) -> Self {
        Self {
            worklets,
            store,
            signals,
            server_decoder: None,
            random: Arc::new(ThreadRandom),
        }
    }

    pub fn with_server_decoder(mut self, decoder: Arc<dyn ServerResponseDecoder>) -> Self {
        self.server_decoder = Some(decoder);
        self
    }

    pub fn with_random(mut self, random: Arc<dyn RandomSource>) -> Self {
        self.random = random;
        self
    }
}

/// Page context an auction runs in
#[derive(Clone, Debug)]
pub struct AuctionContext {
    pub top_window_origin: Origin,
}

impl AuctionContext {
    pub fn new(top_window_origin: impl Into<Origin>) -> Self {
        Self {
            top_window_origin: top_window_origin.into(),
        }
    }
}

struct LiveAuction {
    router: Arc<PromiseRouter>,
    abort: Arc<Notify>,
}

/// Runs auctions against a shared worker pool
pub struct AuctionEngine {
    context: Arc<EngineContext>,
    auctions: Arc<DashMap<AuctionId, LiveAuction>>,
}

impl AuctionEngine {
    pub fn new(config: EngineConfig, deps: EngineDeps) -> Self {
        let pool = ProcessSlotPool::new(
            config.processes.max_bidder_processes,
            config.processes.max_seller_processes,
        );
        Self {
            context: Arc::new(EngineContext { config, deps, pool }),
            auctions: Arc::new(DashMap::new()),
        }
    }

    pub fn config(&self) -> &EngineConfig {
        &self.context.config
    }

    pub fn pool(&self) -> &ProcessSlotPool {
        &self.context.pool
    }

    /// Number of auctions that have not finished yet.
    pub fn live_auctions(&self) -> usize {
        self.auctions.len()
    }

    /// Validate `config` and start running it. Must be called inside a
    /// Tokio runtime.
    #[instrument(skip_all, fields(seller = %config.seller))]
    pub fn start_auction(
        &self,
        config: AuctionConfig,
        context: AuctionContext,
    ) -> Result<AuctionHandle> {
        config.validate()?;

        let id = AuctionId::generate();
        let router = Arc::new(PromiseRouter::new(id, config));
        let abort = Arc::new(Notify::new());
        self.auctions.insert(
            id,
            LiveAuction {
                router: Arc::clone(&router),
                abort: Arc::clone(&abort),
            },
        );

        let task = tokio::spawn(run_auction(
            Arc::clone(&self.context),
            Arc::clone(&self.auctions),
            id,
            Arc::clone(&router),
            Arc::clone(&abort),
            context,
        ));
        info!(auction_id = %id, "auction started");

        Ok(AuctionHandle {
            id,
            router,
            abort,
            task,
        })
    }

    /// Resolve a pending config field of a live auction.
    pub fn resolve_promise(
        &self,
        id: AuctionId,
        target: ConfigTarget,
        resolution: PromiseResolution,
    ) -> Result<()> {
        let router = self
            .auctions
            .get(&id)
            .map(|live| Arc::clone(&live.router))
            .ok_or(ProtocolViolation::UnknownAuction(id))?;
        router.resolve(target, resolution)?;
        Ok(())
    }

    /// Abort a live auction. It finishes with no winner and no reports.
    pub fn abort(&self, id: AuctionId) -> Result<()> {
        let live = self
            .auctions
            .get(&id)
            .ok_or(ProtocolViolation::UnknownAuction(id))?;
        live.abort.notify_one();
        Ok(())
    }
}

/// Caller's handle on one running auction
pub struct AuctionHandle {
    id: AuctionId,
    router: Arc<PromiseRouter>,
    abort: Arc<Notify>,
    task: JoinHandle<AuctionResult>,
}

impl AuctionHandle {
    pub fn id(&self) -> AuctionId {
        self.id
    }

    pub fn resolve_promise(
        &self,
        target: ConfigTarget,
        resolution: PromiseResolution,
    ) -> Result<()> {
        self.router.resolve(target, resolution)?;
        Ok(())
    }

    pub fn abort(&self) {
        self.abort.notify_one();
    }

    /// Wait for the auction to finish.
    pub async fn result(self) -> Result<AuctionResult> {
        self.task
            .await
            .map_err(|e| AuctionError::TaskFailed(e.to_string()))
    }
}

async fn run_auction(
    engine: Arc<EngineContext>,
    auctions: Arc<DashMap<AuctionId, LiveAuction>>,
    id: AuctionId,
    router: Arc<PromiseRouter>,
    abort: Arc<Notify>,
    context: AuctionContext,
) -> AuctionResult {
    let top_gate = Arc::clone(router.top());
    let snapshot = top_gate.snapshot();

    let mut result = if snapshot.server_response.is_some() {
        run_server_auction(&engine, id, &snapshot).await
    } else {
        let level = Arc::new(LevelContext::top_level(
            Arc::clone(&engine),
            top_gate,
            context.top_window_origin.clone(),
        ));
        let finished = tokio::select! {
            biased;
            () = abort.notified() => None,
            outcome = run_level(level, router.components().to_vec()) => Some(outcome),
        };
        match finished {
            Some(top) => finish(&engine, id, &context, top).await,
            None => AuctionResult::empty(id, AuctionOutcome::Aborted),
        }
    };

    let mut bad_messages = router.violations();
    bad_messages.append(&mut result.bad_messages);
    result.bad_messages = bad_messages;

    auctions.remove(&id);
    info!(
        auction_id = %id,
        outcome = ?result.outcome,
        errors = result.errors.len(),
        "auction finished"
    );
    result
}

/// Errors and bad messages of `level` and all its components.
fn collect_messages(level: &LevelOutcome, errors: &mut Vec<String>, bad: &mut Vec<String>) {
    errors.extend(level.errors.iter().cloned());
    bad.extend(level.bad_messages.iter().map(ToString::to_string));
    for component in &level.components {
        collect_messages(component, errors, bad);
    }
}

async fn finish(
    engine: &EngineContext,
    id: AuctionId,
    context: &AuctionContext,
    top: LevelOutcome,
) -> AuctionResult {
    let mut result = AuctionResult::empty(id, AuctionOutcome::NoBids);
    collect_messages(&top, &mut result.errors, &mut result.bad_messages);
    result.stats = top.stats.clone();
    for component in &top.components {
        result.stats.merge(component.stats.clone());
    }

    if top.seller_failed {
        result.outcome = AuctionOutcome::Failed;
        return result;
    }

    let reporting = run_reporting(engine, &context.top_window_origin, &top).await;
    result.errors.extend(reporting.errors);
    result
        .bad_messages
        .extend(reporting.bad_messages.iter().map(ToString::to_string));
    result.reports = reporting.reports;
    result.kanon_winner = reporting.kanon_winner;
    result.kanon_keys_to_join = reporting.kanon_keys_to_join;
    result.winner = reporting.winner;
    if result.winner.is_some() {
        result.outcome = AuctionOutcome::Won;
    }

    let store = &engine.deps.store;
    let mut bidding_groups = top.bidding_groups.clone();
    let mut priority_updates = top.priority_updates.clone();
    for component in &top.components {
        bidding_groups.extend(component.bidding_groups.iter().cloned());
        priority_updates.extend(component.priority_updates.iter().cloned());
    }
    if !bidding_groups.is_empty() {
        store.record_bids(&bidding_groups).await;
    }
    for (group, priority) in &priority_updates {
        store.set_priority(group, *priority).await;
    }
    if let Some(winner) = &result.winner {
        let ad_json = serde_json::json!({
            "renderURL": winner.render_url,
            "metadata": winner.ad_metadata,
        })
        .to_string();
        store.record_win(&winner.interest_group, ad_json).await;
    }
    result
}
