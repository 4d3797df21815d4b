//! Open-window admission control: bounds outstanding provider requests per
//! service and queues the rest in submission order.

use std::collections::VecDeque;

use feedwatch_core::ServiceId;
use tracing::debug;

use crate::state::{AggregateId, AggregatePhase, WatchlistState};

/// Per-service admission bookkeeping.
#[derive(Debug, Default, Clone)]
pub struct OpenWindow {
    /// Aggregates on the wire still waiting for a first complete response.
    pub outstanding: usize,
    /// Aggregates waiting for a slot, oldest first.
    pub queue: VecDeque<AggregateId>,
}

fn window_limit(state: &WatchlistState, service_id: ServiceId) -> Option<usize> {
    let advertised = state
        .directory
        .services
        .get(&service_id)
        .and_then(|entry| entry.load.as_ref())
        .and_then(|load| load.open_window);
    state
        .config
        .open_window_for(advertised)
        .map(|limit| limit as usize)
}

/// Assigns a provider stream to `aggregate` if its service has a free slot,
/// otherwise queues it. Returns whether the aggregate was admitted.
pub fn admit(state: &mut WatchlistState, aggregate: AggregateId) -> bool {
    let Some(service_id) = state.aggregates.get(&aggregate).map(|agg| agg.service_id()) else {
        return false;
    };
    let limit = window_limit(state, service_id);
    let window = state.windows.entry(service_id).or_default();
    if limit.is_some_and(|limit| window.outstanding >= limit) {
        if !window.queue.contains(&aggregate) {
            window.queue.push_back(aggregate);
        }
        debug!(
            service_id,
            aggregate,
            outstanding = window.outstanding,
            "open window full, queueing request"
        );
        if let Some(agg) = state.aggregates.get_mut(&aggregate) {
            agg.phase = AggregatePhase::Queued;
        }
        return false;
    }
    window.outstanding += 1;
    assign_provider_stream(state, aggregate);
    true
}

fn assign_provider_stream(state: &mut WatchlistState, aggregate: AggregateId) {
    let provider_stream = state.allocate_provider_stream();
    if let Some(agg) = state.aggregates.get_mut(&aggregate) {
        agg.provider_stream = Some(provider_stream);
        agg.outstanding = true;
        agg.phase = AggregatePhase::Requested;
        agg.sent = None;
        agg.refresh_pending = false;
    }
    state.provider_streams.insert(provider_stream, aggregate);
    state.mark_dirty(aggregate);
}

/// Frees the slot held by `aggregate` (if any) and admits queued aggregates
/// of the same service while slots remain.
pub fn release(state: &mut WatchlistState, aggregate: AggregateId) {
    let Some(agg) = state.aggregates.get_mut(&aggregate) else {
        return;
    };
    let service_id = agg.service_id();
    let held = std::mem::replace(&mut agg.outstanding, false);
    if let Some(window) = state.windows.get_mut(&service_id) {
        if held {
            window.outstanding = window.outstanding.saturating_sub(1);
        }
    }
    drain_queue(state, service_id);
}

/// Removes `aggregate` from its service's queue, e.g. on close.
pub fn dequeue(state: &mut WatchlistState, service_id: ServiceId, aggregate: AggregateId) {
    if let Some(window) = state.windows.get_mut(&service_id) {
        window.queue.retain(|queued| *queued != aggregate);
    }
}

/// Admits queued aggregates while the service has free slots.
pub fn drain_queue(state: &mut WatchlistState, service_id: ServiceId) {
    loop {
        let limit = window_limit(state, service_id);
        let Some(window) = state.windows.get_mut(&service_id) else {
            return;
        };
        if limit.is_some_and(|limit| window.outstanding >= limit) {
            return;
        }
        let Some(next) = window.queue.pop_front() else {
            return;
        };
        if !state.aggregates.contains_key(&next) {
            continue;
        }
        window.outstanding += 1;
        assign_provider_stream(state, next);
    }
}

/// Forgets all slots and queues for a service; used when its streams are lost.
pub fn reset_service(state: &mut WatchlistState, service_id: ServiceId) {
    state.windows.remove(&service_id);
}
