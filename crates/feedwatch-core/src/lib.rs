//! Core feedwatch primitives shared across crates.
//!
//! Includes stream/service identifiers, domain types, stream state, QoS,
//! priority, group ids, directory filter bits, and base errors.

pub mod error;
pub mod types;

pub use error::FeedError;
pub use types::{
    DataState, DomainType, GroupId, Priority, Qos, QosRate, QosTimeliness, ServiceId, State,
    StateCode, StreamId, StreamState, DIRECTORY_STREAM_ID, FILTER_ALL, FILTER_DATA, FILTER_GROUP,
    FILTER_INFO, FILTER_LINK, FILTER_LOAD, FILTER_STATE, LOGIN_STREAM_ID,
};
