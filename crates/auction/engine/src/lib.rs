//! Auction Engine: orchestration of privacy-preserving ad auctions.
//!
//! An auction is run for one seller over the interest groups of its buyers,
//! optionally with component auctions whose winners compete at the top
//! level. Scripts run in isolated worklets behind the traits in
//! [`traits`]; the engine decides what runs when, with which inputs, and
//! what the results mean.
//!
//! ## Flow
//!
//! 1. **Admission**: worklets run in a bounded pool of worker processes
//!    ([`ProcessSlotPool`]), shared per origin.
//! 2. **Prioritization**: each buyer's interest groups are filtered, ranked
//!    and capped.
//! 3. **Bidding**: trusted signals are fetched in batches, then
//!    `generateBid` runs once config promises the bidder needs resolve.
//! 4. **Scoring**: each bid is scored by the seller as soon as it exists.
//! 5. **Selection**: the highest score wins; ties are drawn uniformly.
//! 6. **Reporting**: post-auction signals, debug reports, private
//!    aggregation and the `reportResult`/`reportWin` chain.
//!
//! ## Guarantees
//!
//! - A stage waiting on a pending config field blocks only itself.
//! - Every process slot is released on every exit path.
//! - Bid values exposed to reporting are stochastically rounded.
//! - With k-anonymity enforced, only k-anonymous bids can win.

#![deny(unsafe_code)]

pub mod admission;
pub mod config;
pub mod error;
pub mod leader;
pub mod mocks;
pub mod priority;
pub mod promise_gate;
pub mod random;
pub mod reporting;
pub mod signals;
pub mod telemetry;
pub mod traits;
pub mod worklet;

mod auction;
mod bidding;
mod runner;
mod scoring;
mod server_response;

pub use admission::{PendingSlot, ProcessSlotPool, SlotHandle, SlotRequest, WorkerRole};
pub use config::{
    BiddingConfig, EngineConfig, KAnonConfig, LoggingConfig, ProcessConfig, ReportingConfig,
    ScoringConfig,
};
pub use error::{AuctionError, ConfigError, Result};
pub use promise_gate::{ConfigPromiseGate, PromiseRouter};
pub use random::{RandomSource, SeededRandom, ThreadRandom};
pub use runner::{AuctionContext, AuctionEngine, AuctionHandle, EngineDeps};
pub use telemetry::init_tracing;
pub use traits::{
    BidderWorklet, DecodedServerResponse, InterestGroupStore, PerGroupSignals, SellerWorklet,
    ServerReportingUrls, ServerResponseDecoder, SignalsKind, SignalsRequest, SignalsResponse,
    TrustedSignalsFetcher, WorkletHost,
};
pub use worklet::*;
