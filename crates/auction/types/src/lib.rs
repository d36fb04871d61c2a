//! Auction Domain Types
//!
//! This crate defines the data model of a privacy-preserving ad auction:
//! interest groups that bid, auction configurations whose fields may still be
//! pending when the auction starts, the bids and scores that flow through the
//! engine, and the result handed back to the caller.
//!
//! # Key Concepts
//!
//! - **Interest group**: a registered advertiser group that can bid. Owned by
//!   an origin, carries ads, ad components, a priority, and browser-side
//!   bidding history.
//! - **Auction config**: a seller's description of the auction. Several fields
//!   are [`MaybePromise`]s: literal at creation, or pending until the caller
//!   resolves them.
//! - **Component auction**: a nested auction whose single winner competes in
//!   the top-level auction.
//! - **Post-auction signals**: the bounded set of values disclosed to
//!   reporting logic.
//!
//! # Architecture
//!
//! This is a pure types crate with no runtime dependencies. Types implement
//! `Clone`, `Debug`, `Serialize`, `Deserialize` where they cross the engine
//! boundary. IDs use the newtype pattern and implement `Display`.

#![deny(unsafe_code)]

mod aggregation;
mod bid;
mod config;
mod currency;
mod errors;
mod ids;
mod interest_group;
mod promise;
mod result;
mod signals;

pub use aggregation::*;
pub use bid::*;
pub use config::*;
pub use currency::*;
pub use errors::*;
pub use ids::*;
pub use interest_group::*;
pub use promise::*;
pub use result::*;
pub use signals::*;
