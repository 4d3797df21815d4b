//! Transport abstractions for feedwatch.
//!
//! The watchlist runtime only depends on the byte-oriented adapter trait
//! defined here; channel lifecycle changes travel in-band with inbound data
//! so their ordering relative to provider messages is preserved.

pub mod adapter;

pub use adapter::{
    route_in_memory_outbound, ChannelEvent, InMemoryAdapter, TransportAdapter, TransportEvent,
    TransportHealthSnapshot,
};
