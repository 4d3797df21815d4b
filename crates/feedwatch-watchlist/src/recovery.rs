//! Recovery after channel, login or service loss.
//!
//! Recoverable requests are told their data is suspect and parked until
//! their service is available again; the rest are closed with a
//! recoverable state and forgotten.

use std::collections::HashSet;

use feedwatch_codec::{Msg, StatusMsg};
use feedwatch_core::{
    DataState, DomainType, ServiceId, State, StreamId, StreamState, LOGIN_STREAM_ID,
};
use feedwatch_transport::ChannelEvent;
use tracing::info;

use crate::directory;
use crate::event::WatchlistEvent;
use crate::item;
use crate::login;
use crate::post;
use crate::state::{AggregateId, ConnectionState, RequestOrigin, UserRequest, WatchlistState};
use crate::window;

pub const CHANNEL_DOWN_TEXT: &str = "channel down.";

/// Whether the watchlist may hold streams open with suspect data on the
/// caller's behalf.
pub fn can_hold_suspect(state: &WatchlistState) -> bool {
    state.single_open() && state.login.allow_suspect_data(&state.config)
}

/// Whether a request survives a loss of its provider stream.
pub fn is_recoverable(state: &WatchlistState, request: &UserRequest) -> bool {
    if !can_hold_suspect(state) || request.private {
        return false;
    }
    if state.connection == ConnectionState::Closed {
        return false;
    }
    if let RequestOrigin::SymbolList {
        parent_streaming: false,
        ..
    } = request.origin
    {
        return false;
    }
    // a dictionary that was fully delivered needs no recovery
    !(request.domain == DomainType::DICTIONARY && request.completed)
}

/// Parks `stream_id` until its service is available, keeping submission
/// order.
pub fn enqueue_pending(state: &mut WatchlistState, stream_id: StreamId) {
    if state.pending_service.contains(&stream_id) {
        return;
    }
    let Some(seq) = state.requests.get(&stream_id).map(|request| request.seq) else {
        return;
    };
    let position = state
        .pending_service
        .iter()
        .position(|pending| {
            state
                .requests
                .get(pending)
                .is_some_and(|request| request.seq > seq)
        })
        .unwrap_or(state.pending_service.len());
    state.pending_service.insert(position, stream_id);
}

/// Removes `aggregates` without closing their provider streams, then
/// recovers or closes every member with `text` in submission order.
pub fn demote_aggregates(state: &mut WatchlistState, aggregates: &[AggregateId], text: &str) {
    let mut members: HashSet<StreamId> = HashSet::new();
    for aggregate in aggregates {
        if let Some(agg) = state.aggregates.get(aggregate) {
            members.extend(agg.members.iter().copied());
        }
        item::drop_aggregate(state, *aggregate, false);
    }
    for stream_id in state.requests_in_order() {
        if members.contains(&stream_id) {
            demote_request(state, stream_id, text);
        }
    }
}

fn demote_request(state: &mut WatchlistState, stream_id: StreamId, text: &str) {
    let Some(request) = state.requests.get(&stream_id) else {
        return;
    };
    let domain = request.domain;
    if is_recoverable(state, request) {
        let status = StatusMsg::new(stream_id, domain, State::open_suspect(text));
        state.emit_to_request(stream_id, Msg::Status(status));
        if let Some(request) = state.requests.get_mut(&stream_id) {
            request.aggregate = None;
            request.awaiting_refresh = true;
        }
        enqueue_pending(state, stream_id);
    } else {
        let status = StatusMsg::new(stream_id, domain, State::closed_recover(text));
        state.emit_to_request(stream_id, Msg::Status(status));
        item::forget_request(state, stream_id);
    }
}

/// Recovers every item of a service that went away.
pub fn service_lost(state: &mut WatchlistState, service_id: ServiceId, text: &str) {
    let aggregates: Vec<AggregateId> = state
        .aggregates
        .values()
        .filter(|agg| agg.service_id() == service_id)
        .map(|agg| agg.id)
        .collect();
    if !aggregates.is_empty() {
        info!(service_id, items = aggregates.len(), "recovering items of lost service");
    }
    demote_aggregates(state, &aggregates, text);
    window::reset_service(state, service_id);
}

/// Closes every item request with a recoverable state, e.g. when the login
/// stream closes.
pub fn close_all(state: &mut WatchlistState, text: &str) {
    post::fail_all(state, text);
    let aggregates: Vec<AggregateId> = state.aggregates.keys().copied().collect();
    for aggregate in aggregates {
        item::drop_aggregate(state, aggregate, false);
    }
    for stream_id in state.requests_in_order() {
        let Some(domain) = state.requests.get(&stream_id).map(|request| request.domain) else {
            continue;
        };
        let status = StatusMsg::new(stream_id, domain, State::closed_recover(text));
        state.emit_to_request(stream_id, Msg::Status(status));
        item::forget_request(state, stream_id);
    }
    state.pending_service.clear();
    state.windows.clear();
}

/// Applies a channel lifecycle event.
pub fn on_channel_event(state: &mut WatchlistState, event: ChannelEvent) {
    match event {
        ChannelEvent::Up => {
            info!("channel up");
            state.connection = ConnectionState::Connected;
            state.events.push_back(WatchlistEvent::Channel(event));
            login::on_channel_up(state);
        }
        ChannelEvent::Down => channel_lost(state, event, true),
        ChannelEvent::Closed => channel_lost(state, event, false),
    }
}

fn channel_lost(state: &mut WatchlistState, event: ChannelEvent, reconnecting: bool) {
    if state.connection == ConnectionState::Closed {
        return;
    }
    let already_down = state.connection == ConnectionState::DownReconnecting;
    state.connection = if reconnecting {
        ConnectionState::DownReconnecting
    } else {
        ConnectionState::Closed
    };
    state.events.push_back(WatchlistEvent::Channel(event));
    if already_down && reconnecting {
        return;
    }
    state.stats.recoveries += 1;
    info!(
        reconnecting,
        requests = state.requests.len(),
        items = state.aggregates.len(),
        "channel lost, recovering streams"
    );

    if state.login.open || state.login.state.is_some() {
        let stream_state = if reconnecting {
            StreamState::Open
        } else {
            StreamState::Closed
        };
        let status = StatusMsg::new(
            LOGIN_STREAM_ID,
            DomainType::LOGIN,
            State::new(stream_state, DataState::Suspect, CHANNEL_DOWN_TEXT),
        );
        state.emit(Msg::Status(status), None);
        state.login.open = false;
    }

    directory::clear_for_recovery(state);
    if !reconnecting {
        directory::close_consumers(
            state,
            &State::new(StreamState::Closed, DataState::Suspect, CHANNEL_DOWN_TEXT),
        );
    }

    post::fail_all(state, CHANNEL_DOWN_TEXT);

    let aggregates: Vec<AggregateId> = state.aggregates.keys().copied().collect();
    demote_aggregates(state, &aggregates, CHANNEL_DOWN_TEXT);
    let parked: Vec<StreamId> = state.pending_service.clone();
    for stream_id in parked {
        let recoverable = state
            .requests
            .get(&stream_id)
            .is_some_and(|request| request.aggregate.is_none() && is_recoverable(state, request));
        if !recoverable {
            demote_request(state, stream_id, CHANNEL_DOWN_TEXT);
        }
    }

    state.provider_streams.clear();
    state.windows.clear();
    state.timers.clear();
    state.dirty.clear();
    state.outbound.clear();
}
