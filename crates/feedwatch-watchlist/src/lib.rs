//! feedwatch watchlist: the consumer-side subscription middle layer.
//!
//! This crate aggregates overlapping caller requests into the minimum set of
//! provider streams, fans provider responses back out per caller, caches the
//! provider's service directory with item group tracking, cascades
//! symbol-list members into item streams, correlates posts with acks,
//! bounds outstanding requests per service, and recovers streams after a
//! connection loss.

pub mod batch;
pub mod config;
pub mod directory;
pub mod error;
pub mod event;
pub mod group;
pub mod item;
pub mod login;
pub mod post;
pub mod recovery;
pub mod service;
pub mod state;
pub mod stats;
pub mod symbol_list;
pub mod timer;
pub mod view;
pub mod window;

pub use config::WatchlistConfig;
pub use error::{SubmitError, WatchlistError};
pub use event::{DeferredAction, DeferredActions, WatchlistEvent};
pub use service::{DispatchSummary, Watchlist, WatchlistCallbacks};
pub use state::{ServiceRef, SubmitOptions, UserTag, WatchlistState};
pub use stats::WatchlistStats;
