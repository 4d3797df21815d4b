//! Item stream multiplexer.
//!
//! Maps caller requests onto one provider stream per item identity, keeps
//! the provider-visible request in step with the net member state, and fans
//! provider responses back out to each member.

use feedwatch_codec::{
    CloseMsg, Msg, MsgKey, Payload, RefreshMsg, RequestMsg, StatusMsg, UpdateMsg,
};
use feedwatch_core::{
    DomainType, Priority, ServiceId, State, StateCode, StreamId, StreamState, LOGIN_STREAM_ID,
};
use tracing::{debug, info, warn};

use crate::batch;
use crate::directory::{self, ServiceUnavailable};
use crate::error::SubmitError;
use crate::post;
use crate::recovery;
use crate::state::{
    AggregateId, AggregatePhase, ConnectionState, ItemAggregate, ItemKey, RequestOrigin,
    SentRequest, ServiceRef, SubmitOptions, UserRequest, WatchlistState,
};
use crate::symbol_list;
use crate::timer::TimerKind;
use crate::view::{aggregate_view, check_view_kind, normalize_view};
use crate::window;

/// Caller entry point for any request message.
pub fn submit(
    state: &mut WatchlistState,
    request: RequestMsg,
    options: SubmitOptions,
) -> Result<(), SubmitError> {
    if state.connection == ConnectionState::Closed {
        return Err(SubmitError::ChannelClosed);
    }
    if options.service_name.is_some() && request.key.service_id.is_some() {
        return Err(SubmitError::ServiceNameAndId);
    }
    if request.stream_id <= 0 {
        return Err(SubmitError::InvalidStreamId);
    }
    if request.domain == DomainType::LOGIN || request.stream_id == LOGIN_STREAM_ID {
        return Err(SubmitError::ReservedStream);
    }
    if request.domain != DomainType::SOURCE
        && state.directory_consumers.contains_key(&request.stream_id)
    {
        return Err(SubmitError::DomainMismatch);
    }
    if request.batch.is_some() {
        if state.requests.contains_key(&request.stream_id) {
            return Err(SubmitError::BatchReissue);
        }
        return batch::expand_batch(state, request, options);
    }
    if request.domain == DomainType::SOURCE {
        return directory::submit_consumer(state, request, options);
    }
    if state.requests.contains_key(&request.stream_id) {
        return reissue(state, request);
    }
    open_request(state, request, options, RequestOrigin::Caller).map(|_| ())
}

fn service_ref(key: &MsgKey, service_name: Option<&str>) -> Result<ServiceRef, SubmitError> {
    match (service_name, key.service_id) {
        (Some(_), Some(_)) => Err(SubmitError::ServiceNameAndId),
        (Some(name), None) => Ok(ServiceRef::Name(name.to_string())),
        (None, Some(id)) => Ok(ServiceRef::Id(id)),
        (None, None) => Err(SubmitError::NoService),
    }
}

fn item_key(request: &UserRequest, service_id: ServiceId) -> ItemKey {
    ItemKey {
        domain: request.domain,
        service_id,
        name: request.key.name.clone(),
        identifier: request.key.identifier,
        qos: request.qos.unwrap_or_default(),
    }
}

fn canonical_key(key: &ItemKey) -> MsgKey {
    MsgKey {
        name: key.name.clone(),
        service_id: Some(key.service_id),
        filter: None,
        identifier: key.identifier,
    }
}

/// Creates a new caller request and binds it to an aggregate, or parks it
/// until its service is available.
pub(crate) fn open_request(
    state: &mut WatchlistState,
    request: RequestMsg,
    options: SubmitOptions,
    origin: RequestOrigin,
) -> Result<StreamId, SubmitError> {
    check_open(state, &request, &options)?;
    let service = service_ref(&request.key, options.service_name.as_deref())?;
    let view = normalize_view(request.view.as_ref());
    let seq = state.next_seq();
    let stream_id = request.stream_id;
    let user_request = UserRequest {
        stream_id,
        seq,
        domain: request.domain,
        key: request.key,
        service,
        qos: request.qos,
        streaming: request.streaming,
        private: request.private,
        paused: request.pause,
        view,
        priority: request.priority.unwrap_or_default(),
        key_in_updates: request.key_in_updates,
        tag: options.tag,
        symbol_list_behavior: request.symbol_list_behavior,
        origin,
        aggregate: None,
        awaiting_refresh: true,
        has_response: false,
        completed: false,
    };

    let behavior = user_request.symbol_list_behavior;
    let streaming = user_request.streaming;
    let is_symbol_list = user_request.domain == DomainType::SYMBOL_LIST;
    state.requests.insert(stream_id, user_request);
    if is_symbol_list {
        if let Some(behavior) = behavior {
            symbol_list::register(state, stream_id, behavior, streaming);
        }
    }
    attach(state, stream_id, true);
    Ok(stream_id)
}

/// Rejects a new request that could not be opened, including one whose view
/// kind clashes with the aggregate it would join. Nothing is changed.
pub(crate) fn check_open(
    state: &WatchlistState,
    request: &RequestMsg,
    options: &SubmitOptions,
) -> Result<(), SubmitError> {
    if request.no_refresh {
        return Err(SubmitError::OpenWithoutRefresh);
    }
    let service = service_ref(&request.key, options.service_name.as_deref())?;
    if let Some(aggregate) = joinable_aggregate(state, request, &service) {
        let view = normalize_view(request.view.as_ref());
        let existing = member_views(state, aggregate, None);
        check_view_kind(existing.iter().map(Option::as_ref), view.as_ref())?;
    }
    Ok(())
}

fn joinable_aggregate(
    state: &WatchlistState,
    request: &RequestMsg,
    service: &ServiceRef,
) -> Option<AggregateId> {
    if request.private {
        return None;
    }
    let service_id = directory::resolve(state, service).ok()?;
    let key = ItemKey {
        domain: request.domain,
        service_id,
        name: request.key.name.clone(),
        identifier: request.key.identifier,
        qos: request.qos.unwrap_or_default(),
    };
    state.aggregate_index.get(&key).copied()
}

fn member_views(
    state: &WatchlistState,
    aggregate: AggregateId,
    except: Option<StreamId>,
) -> Vec<Option<feedwatch_codec::View>> {
    state
        .aggregates
        .get(&aggregate)
        .map(|agg| {
            agg.members
                .iter()
                .filter(|stream_id| Some(**stream_id) != except)
                .filter_map(|stream_id| state.requests.get(stream_id))
                .map(|request| request.view.clone())
                .collect()
        })
        .unwrap_or_default()
}

/// Binds a tracked, unbound request to its aggregate (creating one when
/// needed). Requests whose service is unavailable are parked; `notify`
/// controls whether the caller is told so.
pub(crate) fn attach(state: &mut WatchlistState, stream_id: StreamId, notify: bool) {
    let Some(request) = state.requests.get(&stream_id) else {
        return;
    };
    let service_id = match directory::resolve(state, &request.service) {
        Ok(service_id) => service_id,
        Err(reason) => {
            wait_for_service(state, stream_id, reason, notify);
            return;
        }
    };
    let key = item_key(request, service_id);
    let private = request.private;

    let existing = if private {
        None
    } else {
        state.aggregate_index.get(&key).copied()
    };
    let aggregate = match existing {
        Some(aggregate) => aggregate,
        None => {
            let aggregate = state.allocate_aggregate_id();
            debug!(aggregate, ?key, "creating item aggregate");
            if !private {
                state.aggregate_index.insert(key.clone(), aggregate);
            }
            state
                .aggregates
                .insert(aggregate, ItemAggregate::new(aggregate, key, private));
            aggregate
        }
    };

    if let Some(agg) = state.aggregates.get_mut(&aggregate) {
        agg.members.push(stream_id);
    }
    if let Some(request) = state.requests.get_mut(&stream_id) {
        request.aggregate = Some(aggregate);
        request.awaiting_refresh = true;
    }
    match existing {
        Some(_) => state.mark_dirty(aggregate),
        None => {
            window::admit(state, aggregate);
        }
    }
}

fn wait_for_service(
    state: &mut WatchlistState,
    stream_id: StreamId,
    reason: ServiceUnavailable,
    notify: bool,
) {
    recovery::enqueue_pending(state, stream_id);
    if !notify || !state.directory.open {
        return;
    }
    let Some(domain) = state.requests.get(&stream_id).map(|request| request.domain) else {
        return;
    };
    if recovery::can_hold_suspect(state) {
        let status = StatusMsg::new(stream_id, domain, State::open_suspect(reason.text()));
        state.emit_to_request(stream_id, Msg::Status(status));
    } else {
        let status = StatusMsg::new(stream_id, domain, State::closed_recover(reason.text()));
        state.emit_to_request(stream_id, Msg::Status(status));
        forget_request(state, stream_id);
    }
}

/// Re-binds every parked request whose service is now available, in
/// submission order.
pub(crate) fn resubmit_pending(state: &mut WatchlistState) {
    if state.connection != ConnectionState::Connected {
        return;
    }
    let pending = std::mem::take(&mut state.pending_service);
    for stream_id in pending {
        if let Some(request) = state.requests.get(&stream_id) {
            if request.aggregate.is_none() {
                attach(state, stream_id, false);
            }
        }
    }
}

/// Replaces a member's view/priority/pause state in place.
pub fn reissue(state: &mut WatchlistState, request: RequestMsg) -> Result<(), SubmitError> {
    let stream_id = request.stream_id;
    let Some(existing) = state.requests.get(&stream_id) else {
        return Err(SubmitError::KeyMismatch);
    };
    if existing.domain != request.domain {
        return Err(SubmitError::DomainMismatch);
    }
    if request.key.name.is_some() && request.key.name != existing.key.name {
        return Err(SubmitError::KeyMismatch);
    }
    if existing.streaming != request.streaming {
        return Err(SubmitError::StreamingFlagChanged);
    }
    if existing.private != request.private {
        return Err(SubmitError::PrivateFlagChanged);
    }
    let view = normalize_view(request.view.as_ref());
    let priority = request.priority.unwrap_or(existing.priority);
    let aggregate = existing.aggregate;
    let unchanged =
        existing.view == view && existing.priority == priority && existing.paused == request.pause;

    let Some(aggregate) = aggregate else {
        if let Some(existing) = state.requests.get_mut(&stream_id) {
            existing.view = view;
            existing.priority = priority;
            existing.paused = request.pause;
        }
        return Ok(());
    };

    let others = member_views(state, aggregate, Some(stream_id));
    check_view_kind(others.iter().map(Option::as_ref), view.as_ref())?;

    let merged_before = aggregate_view(state, aggregate);
    if let Some(existing) = state.requests.get_mut(&stream_id) {
        existing.view = view;
        existing.priority = priority;
        existing.paused = request.pause;
    }
    let merged_after = aggregate_view(state, aggregate);
    if !request.no_refresh && (merged_before != merged_after || unchanged) {
        if let Some(existing) = state.requests.get_mut(&stream_id) {
            existing.awaiting_refresh = true;
        }
    }
    state.mark_dirty(aggregate);
    Ok(())
}

/// Closes a caller stream. Closing an unknown or already-closed stream is a
/// no-op.
pub fn close(state: &mut WatchlistState, stream_id: StreamId) {
    if directory::close_consumer(state, stream_id) {
        return;
    }
    let Some(aggregate) = state.requests.get(&stream_id).map(|request| request.aggregate) else {
        return;
    };
    forget_request(state, stream_id);
    if let Some(aggregate) = aggregate {
        remove_member(state, aggregate, stream_id);
    }
}

/// Drops every trace of a caller request except its aggregate membership.
pub(crate) fn forget_request(state: &mut WatchlistState, stream_id: StreamId) {
    state.requests.remove(&stream_id);
    state.pending_service.retain(|pending| *pending != stream_id);
    state.symbol_lists.remove(&stream_id);
    post::drop_stream_posts(state, stream_id);
}

fn remove_member(state: &mut WatchlistState, aggregate: AggregateId, stream_id: StreamId) {
    let Some(agg) = state.aggregates.get_mut(&aggregate) else {
        return;
    };
    agg.members.retain(|member| *member != stream_id);
    if agg.members.is_empty() {
        drop_aggregate(state, aggregate, true);
    } else {
        state.mark_dirty(aggregate);
    }
}

/// Removes an aggregate from every table. With `send_close`, a provider
/// stream that reached the wire is closed.
pub(crate) fn drop_aggregate(state: &mut WatchlistState, aggregate: AggregateId, send_close: bool) {
    window::release(state, aggregate);
    let Some(agg) = state.aggregates.remove(&aggregate) else {
        return;
    };
    window::dequeue(state, agg.service_id(), aggregate);
    if state.aggregate_index.get(&agg.key) == Some(&aggregate) {
        state.aggregate_index.remove(&agg.key);
    }
    if let Some(timer) = agg.timer {
        state.timers.cancel(timer);
    }
    if let Some(group) = &agg.group {
        directory::remove_item_group(state, agg.service_id(), group, aggregate);
    }
    state.dirty.retain(|dirty| *dirty != aggregate);
    if let Some(provider_stream) = agg.provider_stream {
        state.provider_streams.remove(&provider_stream);
        post::drop_provider_posts(state, provider_stream);
        if send_close && agg.sent.is_some() {
            debug!(aggregate, provider_stream, "closing provider stream");
            state.outbound.push(Msg::Close(CloseMsg {
                stream_id: provider_stream,
                domain: agg.key.domain,
            }));
            state.stats.closes_sent += 1;
        }
    }
}

/// Puts the net change of every dirty aggregate on the wire.
pub fn flush_requests(state: &mut WatchlistState) {
    let dirty = std::mem::take(&mut state.dirty);
    for aggregate in dirty {
        flush_aggregate(state, aggregate);
    }
}

fn flush_aggregate(state: &mut WatchlistState, aggregate: AggregateId) {
    let Some(agg) = state.aggregates.get(&aggregate) else {
        return;
    };
    let Some(provider_stream) = agg.provider_stream else {
        return;
    };
    let members: Vec<&UserRequest> = agg
        .members
        .iter()
        .filter_map(|stream_id| state.requests.get(stream_id))
        .collect();
    if members.is_empty() {
        return;
    }
    let any_streaming = members.iter().any(|request| request.streaming);
    // a snapshot already on the wire cannot be upgraded in place
    if let Some(sent) = &agg.sent {
        if !sent.streaming && agg.refresh_pending && any_streaming {
            return;
        }
    }
    let mut needs_refresh = members.iter().any(|request| request.awaiting_refresh)
        && !agg.refresh_pending;
    let streaming = any_streaming || agg.sent.as_ref().is_some_and(|sent| sent.streaming);
    // snapshot members never carry priority
    let priority = members
        .iter()
        .filter(|request| request.streaming)
        .map(|request| request.priority)
        .reduce(Priority::accumulate)
        .unwrap_or_default();
    let paused = any_streaming
        && members
            .iter()
            .filter(|request| request.streaming)
            .all(|request| request.paused);
    let key_in_updates = members.iter().any(|request| request.key_in_updates);
    let view = aggregate_view(state, aggregate);
    let next = SentRequest {
        streaming,
        priority,
        paused,
        view,
    };

    let priority_field = match &agg.sent {
        None => {
            needs_refresh = true;
            (any_streaming && next.priority != Priority::default()).then_some(next.priority)
        }
        Some(sent) => {
            let priority_changed = any_streaming && next.priority != sent.priority;
            let unchanged = sent.streaming == next.streaming
                && sent.paused == next.paused
                && sent.view == next.view
                && !priority_changed;
            if unchanged && !needs_refresh {
                return;
            }
            priority_changed.then_some(next.priority)
        }
    };

    let request = RequestMsg {
        stream_id: provider_stream,
        domain: agg.key.domain,
        key: canonical_key(&agg.key),
        qos: Some(agg.key.qos),
        priority: priority_field,
        streaming: next.streaming,
        private: agg.private,
        pause: next.paused,
        no_refresh: !needs_refresh,
        key_in_updates,
        view: next.view.clone(),
        batch: None,
        symbol_list_behavior: None,
        payload: Payload::None,
    };
    debug!(
        aggregate,
        provider_stream,
        refresh = needs_refresh,
        "sending item request"
    );
    state.outbound.push(Msg::Request(request));
    state.stats.requests_sent += 1;
    if let Some(agg) = state.aggregates.get_mut(&aggregate) {
        agg.sent = Some(next);
        if needs_refresh {
            agg.refresh_pending = true;
        }
    }
    if needs_refresh {
        schedule_request_timer(state, aggregate);
    }
}

fn schedule_request_timer(state: &mut WatchlistState, aggregate: AggregateId) {
    let deadline = state.now_ms.saturating_add(state.config.request_timeout_ms);
    let id = state
        .timers
        .schedule(deadline, TimerKind::Request(aggregate));
    let previous = state
        .aggregates
        .get_mut(&aggregate)
        .and_then(|agg| agg.timer.replace(id));
    if let Some(previous) = previous {
        state.timers.cancel(previous);
    }
}

fn cancel_request_timer(state: &mut WatchlistState, aggregate: AggregateId) {
    let timer = state
        .aggregates
        .get_mut(&aggregate)
        .and_then(|agg| agg.timer.take());
    if let Some(timer) = timer {
        state.timers.cancel(timer);
    }
}

/// Routes one provider message addressed to an item stream.
pub fn deliver(state: &mut WatchlistState, msg: Msg) {
    let provider_stream = msg.stream_id();
    let Some(aggregate) = state.provider_streams.get(&provider_stream).copied() else {
        state.stats.unknown_stream_messages += 1;
        debug!(provider_stream, class = ?msg.class(), "message for untracked stream");
        return;
    };
    match msg {
        Msg::Refresh(refresh) => on_refresh(state, aggregate, refresh),
        Msg::Update(update) => on_update(state, aggregate, update),
        Msg::Status(status) => on_status(state, aggregate, status),
        Msg::Generic(generic) => {
            let members = members_of(state, aggregate);
            let fallback = fallback_key(state, aggregate);
            let msg = Msg::Generic(generic);
            for stream_id in members {
                deliver_copy(state, stream_id, &msg, fallback.as_ref());
            }
        }
        Msg::Ack(ack) => post::on_ack(state, provider_stream, ack),
        Msg::Request(_) | Msg::Post(_) | Msg::Close(_) => {
            debug!(provider_stream, "ignoring consumer-only message class from provider");
        }
    }
}

fn members_of(state: &WatchlistState, aggregate: AggregateId) -> Vec<StreamId> {
    state
        .aggregates
        .get(&aggregate)
        .map(|agg| agg.members.clone())
        .unwrap_or_default()
}

fn fallback_key(state: &WatchlistState, aggregate: AggregateId) -> Option<MsgKey> {
    state.aggregates.get(&aggregate).map(|agg| {
        agg.last_key
            .clone()
            .unwrap_or_else(|| canonical_key(&agg.key))
    })
}

/// Delivers a per-member copy of `msg`, injecting the item key on the
/// member's first response when it asked for keys in updates.
pub(crate) fn deliver_copy(
    state: &mut WatchlistState,
    stream_id: StreamId,
    msg: &Msg,
    fallback_key: Option<&MsgKey>,
) {
    let mut copy = msg.clone();
    copy.set_stream_id(stream_id);
    let Some(request) = state.requests.get_mut(&stream_id) else {
        state.emit(copy, None);
        return;
    };
    if request.key_in_updates && !request.has_response {
        if let Some(slot) = copy.response_key_mut() {
            if slot.is_none() {
                *slot = fallback_key.cloned().or_else(|| Some(request.key.clone()));
            }
        }
    }
    request.has_response = true;
    let tag = request.tag;
    state.emit(copy, tag);
}

fn on_refresh(state: &mut WatchlistState, aggregate: AggregateId, refresh: RefreshMsg) {
    cancel_request_timer(state, aggregate);
    let Some(agg) = state.aggregates.get_mut(&aggregate) else {
        return;
    };
    if let Some(key) = &refresh.key {
        agg.last_key = Some(key.clone());
    }
    // a refresh replaces whatever state the group last pushed
    agg.last_group_state = None;
    let service_id = agg.service_id();
    let previous_group = agg.group.clone();
    if let Some(group) = &refresh.group_id {
        agg.group = Some(group.clone());
    }
    let members = agg.members.clone();
    if let Some(group) = refresh.group_id.clone() {
        directory::move_item_group(state, service_id, aggregate, previous_group.as_ref(), &group);
    }

    let wire_state = refresh.state.stream_state;
    let wire_closed = matches!(
        wire_state,
        StreamState::Closed | StreamState::ClosedRecover | StreamState::Redirected
    );
    let wire_snapshot_done = wire_state == StreamState::NonStreaming && refresh.complete;

    let targets: Vec<StreamId> = if wire_closed {
        members.clone()
    } else {
        let eligible: Vec<StreamId> = members
            .iter()
            .copied()
            .filter(|stream_id| {
                state.requests.get(stream_id).is_some_and(|request| {
                    wire_state != StreamState::NonStreaming || !request.streaming
                })
            })
            .collect();
        let awaiting: Vec<StreamId> = eligible
            .iter()
            .copied()
            .filter(|stream_id| {
                state
                    .requests
                    .get(stream_id)
                    .is_some_and(|request| request.awaiting_refresh)
            })
            .collect();
        if refresh.solicited && !awaiting.is_empty() {
            awaiting
        } else {
            eligible
        }
    };

    let fallback = fallback_key(state, aggregate);
    let msg = Msg::Refresh(refresh.clone());
    let mut finished = Vec::new();
    for stream_id in &targets {
        let Some(streaming) = state.requests.get(stream_id).map(|request| request.streaming) else {
            continue;
        };
        let mut copy = msg.clone();
        if let Msg::Refresh(member_refresh) = &mut copy {
            if !streaming && refresh.complete && member_refresh.state.stream_state == StreamState::Open
            {
                member_refresh.state.stream_state = StreamState::NonStreaming;
            }
        }
        deliver_copy(state, *stream_id, &copy, fallback.as_ref());
        if refresh.complete {
            if let Some(request) = state.requests.get_mut(stream_id) {
                request.awaiting_refresh = false;
                request.completed = true;
            }
            if !streaming || wire_closed {
                finished.push(*stream_id);
            }
        }
    }

    if refresh.domain == DomainType::SYMBOL_LIST {
        if let Payload::SymbolMap(entries) = &refresh.payload {
            for stream_id in &targets {
                symbol_list::cascade(state, *stream_id, entries);
            }
        }
    }

    if refresh.complete {
        if let Some(agg) = state.aggregates.get_mut(&aggregate) {
            agg.refresh_pending = false;
            agg.phase = AggregatePhase::Open;
        }
        window::release(state, aggregate);
    }

    if wire_closed {
        for stream_id in &members {
            forget_request(state, *stream_id);
        }
        drop_aggregate(state, aggregate, false);
        return;
    }

    for stream_id in &finished {
        forget_request(state, *stream_id);
    }
    let remaining = match state.aggregates.get_mut(&aggregate) {
        Some(agg) => {
            agg.members.retain(|member| !finished.contains(member));
            agg.members.len()
        }
        None => return,
    };
    if remaining == 0 {
        drop_aggregate(state, aggregate, !wire_snapshot_done);
        return;
    }
    if wire_snapshot_done {
        // streaming members that joined during the snapshot need a fresh stream
        let provider_stream = state
            .aggregates
            .get_mut(&aggregate)
            .and_then(|agg| agg.provider_stream.take());
        if let Some(provider_stream) = provider_stream {
            state.provider_streams.remove(&provider_stream);
        }
        if let Some(agg) = state.aggregates.get_mut(&aggregate) {
            agg.sent = None;
            agg.refresh_pending = false;
        }
        window::admit(state, aggregate);
        return;
    }
    state.mark_dirty(aggregate);
}

fn on_update(state: &mut WatchlistState, aggregate: AggregateId, update: UpdateMsg) {
    if let Some(key) = &update.key {
        if let Some(agg) = state.aggregates.get_mut(&aggregate) {
            agg.last_key = Some(key.clone());
        }
    }
    let targets: Vec<StreamId> = members_of(state, aggregate)
        .into_iter()
        .filter(|stream_id| {
            state
                .requests
                .get(stream_id)
                .is_some_and(|request| request.streaming || !request.awaiting_refresh)
        })
        .collect();
    let fallback = fallback_key(state, aggregate);
    let msg = Msg::Update(update);
    for stream_id in &targets {
        deliver_copy(state, *stream_id, &msg, fallback.as_ref());
    }
    if let Msg::Update(UpdateMsg {
        domain: DomainType::SYMBOL_LIST,
        payload: Payload::SymbolMap(entries),
        ..
    }) = &msg
    {
        for stream_id in &targets {
            symbol_list::cascade(state, *stream_id, entries);
        }
    }
}

fn on_status(state: &mut WatchlistState, aggregate: AggregateId, status: StatusMsg) {
    let Some(agg) = state.aggregates.get_mut(&aggregate) else {
        return;
    };
    if let Some(key) = &status.key {
        agg.last_key = Some(key.clone());
    }
    if status.state.is_some() {
        agg.last_group_state = None;
    }
    let service_id = agg.service_id();
    let previous_group = agg.group.clone();
    if let Some(group) = &status.group_id {
        agg.group = Some(group.clone());
    }
    if let Some(group) = status.group_id.clone() {
        directory::move_item_group(state, service_id, aggregate, previous_group.as_ref(), &group);
    }
    let terminal = status
        .state
        .as_ref()
        .is_some_and(|s| s.stream_state.is_terminal());
    if terminal {
        cancel_request_timer(state, aggregate);
    }
    fan_out_status(state, aggregate, Msg::Status(status));
    if terminal {
        close_from_provider(state, aggregate);
    }
}

fn fan_out_status(state: &mut WatchlistState, aggregate: AggregateId, msg: Msg) {
    let fallback = fallback_key(state, aggregate);
    for stream_id in members_of(state, aggregate) {
        deliver_copy(state, stream_id, &msg, fallback.as_ref());
    }
}

/// Removes an aggregate the provider already closed, along with its members.
fn close_from_provider(state: &mut WatchlistState, aggregate: AggregateId) {
    for stream_id in members_of(state, aggregate) {
        forget_request(state, stream_id);
    }
    drop_aggregate(state, aggregate, false);
}

/// Applies a group status to one aggregate, suppressing repeats of the
/// status last delivered through its group.
pub(crate) fn apply_group_status(state: &mut WatchlistState, aggregate: AggregateId, status: &State) {
    let Some(agg) = state.aggregates.get_mut(&aggregate) else {
        return;
    };
    if agg.last_group_state.as_ref() == Some(status) {
        return;
    }
    agg.last_group_state = Some(status.clone());
    let domain = agg.key.domain;
    let msg = Msg::Status(StatusMsg::new(0, domain, status.clone()));
    fan_out_status(state, aggregate, msg);
    if status.stream_state.is_terminal() {
        close_from_provider(state, aggregate);
    }
}

/// Notifies every member of `aggregate` with `status`; a terminal status
/// also removes the aggregate and its members.
pub(crate) fn notify_members(state: &mut WatchlistState, aggregate: AggregateId, status: &State) {
    let Some(agg) = state.aggregates.get_mut(&aggregate) else {
        return;
    };
    agg.last_group_state = None;
    let domain = agg.key.domain;
    let msg = Msg::Status(StatusMsg::new(0, domain, status.clone()));
    fan_out_status(state, aggregate, msg);
    if status.stream_state.is_terminal() {
        close_from_provider(state, aggregate);
    }
}

/// Handles a request whose first refresh did not arrive in time.
pub fn on_request_timeout(state: &mut WatchlistState, aggregate: AggregateId) {
    let Some(agg) = state.aggregates.get_mut(&aggregate) else {
        return;
    };
    agg.timer = None;
    let Some(provider_stream) = agg.provider_stream else {
        return;
    };
    let domain = agg.key.domain;
    let private = agg.private;
    state.stats.request_timeouts += 1;
    warn!(aggregate, provider_stream, "request timed out");

    let members = members_of(state, aggregate);
    let recoverable = !private && recovery::can_hold_suspect(state);
    if !recoverable {
        let status = State::closed_recover("Request timeout").with_code(StateCode::Timeout);
        fan_out_status(state, aggregate, Msg::Status(StatusMsg::new(0, domain, status)));
        for stream_id in members {
            forget_request(state, stream_id);
        }
        drop_aggregate(state, aggregate, true);
        return;
    }

    state.outbound.push(Msg::Close(CloseMsg {
        stream_id: provider_stream,
        domain,
    }));
    state.stats.closes_sent += 1;
    state.provider_streams.remove(&provider_stream);
    post::drop_provider_posts(state, provider_stream);
    let status = State::open_suspect("Request timeout").with_code(StateCode::Timeout);
    fan_out_status(state, aggregate, Msg::Status(StatusMsg::new(0, domain, status)));
    for stream_id in &members {
        if let Some(request) = state.requests.get_mut(stream_id) {
            request.awaiting_refresh = true;
        }
    }
    if let Some(agg) = state.aggregates.get_mut(&aggregate) {
        agg.provider_stream = None;
        agg.sent = None;
        agg.refresh_pending = false;
    }
    window::release(state, aggregate);
    info!(aggregate, "re-requesting timed out item");
    window::admit(state, aggregate);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::WatchlistConfig;
    use crate::directory::ServiceCacheEntry;
    use feedwatch_codec::{ServiceInfo, ServiceStatus, View};
    use feedwatch_core::{DataState, FILTER_INFO, FILTER_STATE};

    fn connected_state() -> WatchlistState {
        let mut state = WatchlistState::new(WatchlistConfig::default());
        state.connection = ConnectionState::Connected;
        state.directory.open = true;
        let mut entry = ServiceCacheEntry::new(1);
        entry.info = Some(ServiceInfo {
            name: "DIRECT_FEED".into(),
            ..ServiceInfo::default()
        });
        entry.state = Some(ServiceStatus::up());
        entry.present = FILTER_INFO | FILTER_STATE;
        state.directory.services.insert(1, entry);
        state
    }

    fn market_price(stream_id: StreamId, name: &str) -> RequestMsg {
        RequestMsg::new(stream_id, DomainType::MARKET_PRICE, MsgKey::named(name)).streaming()
    }

    fn take_requests(state: &mut WatchlistState) -> Vec<RequestMsg> {
        flush_requests(state);
        state
            .outbound
            .drain(..)
            .filter_map(|msg| match msg {
                Msg::Request(request) => Some(request),
                _ => None,
            })
            .collect()
    }

    fn feed() -> SubmitOptions {
        SubmitOptions::service("DIRECT_FEED")
    }

    #[test]
    fn same_item_aggregates_and_reissues_priority() {
        let mut state = connected_state();
        submit(&mut state, market_price(2, "TRI.N"), feed()).expect("first submit");
        let first = take_requests(&mut state);
        assert_eq!(first.len(), 1);
        assert_eq!(first[0].priority, None);
        assert!(!first[0].no_refresh);

        submit(&mut state, market_price(3, "TRI.N"), feed()).expect("second submit");
        let second = take_requests(&mut state);
        assert_eq!(second.len(), 1);
        assert_eq!(second[0].stream_id, first[0].stream_id);
        assert_eq!(second[0].priority, Some(Priority::new(1, 2)));
        assert!(second[0].no_refresh);

        close(&mut state, 2);
        let third = take_requests(&mut state);
        assert_eq!(third.len(), 1);
        assert_eq!(third[0].priority, Some(Priority::new(1, 1)));
        assert!(state.outbound.is_empty());

        close(&mut state, 3);
        flush_requests(&mut state);
        assert!(matches!(
            state.outbound.as_slice(),
            [Msg::Close(CloseMsg { stream_id, .. })] if *stream_id == first[0].stream_id
        ));
    }

    #[test]
    fn snapshot_only_aggregate_drops_its_priority() {
        let mut state = connected_state();
        submit(
            &mut state,
            market_price(2, "TRI.N").with_priority(1, 3),
            feed(),
        )
        .expect("streaming");
        let mut snapshot = market_price(3, "TRI.N");
        snapshot.streaming = false;
        submit(&mut state, snapshot, feed()).expect("snapshot");
        let first = take_requests(&mut state);
        assert_eq!(first.len(), 1);
        assert_eq!(first[0].priority, Some(Priority::new(1, 3)));

        close(&mut state, 2);
        assert!(take_requests(&mut state).is_empty());
        let aggregate = state.requests[&3].aggregate.expect("still bound");
        let sent = state.aggregates[&aggregate].sent.clone().expect("on the wire");
        assert_eq!(sent.priority, Priority::default());

        submit(
            &mut state,
            market_price(4, "TRI.N").with_priority(1, 2),
            feed(),
        )
        .expect("streaming again");
        let rejoined = take_requests(&mut state);
        assert_eq!(rejoined.len(), 1);
        assert_eq!(rejoined[0].priority, Some(Priority::new(1, 2)));
    }

    #[test]
    fn item_on_a_directory_consumer_stream_is_rejected() {
        let mut state = connected_state();
        let consumer = RequestMsg::new(
            5,
            DomainType::SOURCE,
            MsgKey::default().with_filter(FILTER_INFO),
        )
        .streaming();
        submit(&mut state, consumer, SubmitOptions::default()).expect("consumer");
        assert_eq!(
            submit(&mut state, market_price(5, "TRI.N"), feed()),
            Err(SubmitError::DomainMismatch)
        );
        assert!(state.requests.is_empty());
        assert!(state.aggregates.is_empty());

        close(&mut state, 5);
        assert!(state.directory_consumers.is_empty());
    }

    #[test]
    fn double_close_is_a_no_op() {
        let mut state = connected_state();
        submit(&mut state, market_price(2, "TRI.N"), feed()).expect("submit");
        close(&mut state, 2);
        close(&mut state, 2);
        assert_eq!(state.stats.closes_sent, 0);
        assert!(state.aggregates.is_empty());
    }

    #[test]
    fn both_service_name_and_id_is_rejected() {
        let mut state = connected_state();
        let mut request = market_price(2, "TRI.N");
        request.key.service_id = Some(1);
        assert_eq!(
            submit(&mut state, request, feed()),
            Err(SubmitError::ServiceNameAndId)
        );
        assert!(state.requests.is_empty());
    }

    #[test]
    fn view_reissue_with_unchanged_merge_sends_nothing() {
        let mut state = connected_state();
        let view = View::FieldIds(vec![22, 25]);
        submit(
            &mut state,
            market_price(2, "TRI.N").with_view(view.clone()),
            feed(),
        )
        .expect("submit a");
        submit(
            &mut state,
            market_price(3, "TRI.N").with_view(View::FieldIds(vec![22])),
            feed(),
        )
        .expect("submit b");
        let _ = take_requests(&mut state);

        let mut reissue_b = market_price(3, "TRI.N").with_view(View::FieldIds(vec![25]));
        reissue_b.no_refresh = true;
        submit(&mut state, reissue_b, feed()).expect("reissue");
        assert!(take_requests(&mut state).is_empty());
    }

    #[test]
    fn mixed_view_kinds_are_rejected() {
        let mut state = connected_state();
        submit(
            &mut state,
            market_price(2, "TRI.N").with_view(View::FieldIds(vec![22])),
            feed(),
        )
        .expect("submit");
        let err = submit(
            &mut state,
            market_price(3, "TRI.N").with_view(View::ElementNames(vec!["BID".into()])),
            feed(),
        )
        .expect_err("kind mismatch");
        assert_eq!(err, SubmitError::ViewTypeMismatch);
        assert!(!state.requests.contains_key(&3));
    }

    #[test]
    fn snapshot_member_gets_non_streaming_refresh_and_is_removed() {
        let mut state = connected_state();
        submit(&mut state, market_price(2, "TRI.N"), feed()).expect("streaming");
        let mut snapshot = market_price(3, "TRI.N");
        snapshot.streaming = false;
        submit(&mut state, snapshot, feed()).expect("snapshot");
        let requests = take_requests(&mut state);
        let provider_stream = requests[0].stream_id;
        state.events.clear();

        let refresh = RefreshMsg::new(provider_stream, DomainType::MARKET_PRICE, State::open_ok());
        deliver(&mut state, Msg::Refresh(refresh));

        let states: Vec<(StreamId, StreamState)> = state
            .events
            .iter()
            .filter_map(|event| match event.msg() {
                Some(Msg::Refresh(r)) => Some((r.stream_id, r.state.stream_state)),
                _ => None,
            })
            .collect();
        assert_eq!(
            states,
            vec![(2, StreamState::Open), (3, StreamState::NonStreaming)]
        );
        assert!(!state.requests.contains_key(&3));
        assert!(state.requests.contains_key(&2));
    }

    #[test]
    fn terminal_status_closes_every_member_once() {
        let mut state = connected_state();
        submit(&mut state, market_price(2, "TRI.N"), feed()).expect("a");
        submit(&mut state, market_price(3, "TRI.N"), feed()).expect("b");
        let provider_stream = take_requests(&mut state)[0].stream_id;
        state.events.clear();

        let status = StatusMsg::new(
            provider_stream,
            DomainType::MARKET_PRICE,
            State::new(StreamState::Closed, DataState::Suspect, "Not entitled"),
        );
        deliver(&mut state, Msg::Status(status));
        assert_eq!(state.events.len(), 2);
        assert!(state.requests.is_empty());
        assert!(state.aggregates.is_empty());
        flush_requests(&mut state);
        assert!(state.outbound.is_empty());
    }

    #[test]
    fn key_injected_only_on_first_response() {
        let mut state = connected_state();
        let mut request = market_price(2, "TRI.N");
        request.key_in_updates = true;
        submit(&mut state, request, feed()).expect("submit");
        let provider_stream = take_requests(&mut state)[0].stream_id;

        deliver(
            &mut state,
            Msg::Update(UpdateMsg::new(
                provider_stream,
                DomainType::MARKET_PRICE,
                Payload::None,
            )),
        );
        deliver(
            &mut state,
            Msg::Update(UpdateMsg::new(
                provider_stream,
                DomainType::MARKET_PRICE,
                Payload::None,
            )),
        );
        let keys: Vec<Option<MsgKey>> = state
            .events
            .iter()
            .filter_map(|event| event.msg().map(|msg| msg.response_key().cloned()))
            .collect();
        assert_eq!(keys.len(), 2);
        assert_eq!(
            keys[0].as_ref().and_then(|key| key.name.as_deref()),
            Some("TRI.N")
        );
        assert_eq!(keys[1], None);
    }

    #[test]
    fn unknown_service_waits_with_suspect_status() {
        let mut state = connected_state();
        submit(
            &mut state,
            market_price(2, "TRI.N"),
            SubmitOptions::service("NOPE"),
        )
        .expect("parked");
        assert_eq!(state.pending_service, vec![2]);
        assert!(state.aggregates.is_empty());
        let Some(Msg::Status(status)) = state.events.front().and_then(|event| event.msg()) else {
            panic!("expected status");
        };
        let state_value = status.state.as_ref().expect("state");
        assert_eq!(state_value.stream_state, StreamState::Open);
        assert_eq!(state_value.data_state, DataState::Suspect);
    }
}
