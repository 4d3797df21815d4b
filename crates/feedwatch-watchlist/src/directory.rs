//! Service directory cache.
//!
//! Holds the last known state of every provider service, answers caller
//! directory requests from the cache, fans live directory changes out to
//! streaming directory consumers, and turns service and group changes into
//! item status.

use std::collections::{BTreeMap, HashSet};

use bytes::Bytes;
use feedwatch_codec::{
    MapAction, Msg, MsgKey, Payload, RefreshMsg, RequestMsg, ServiceEntry, ServiceGroup,
    ServiceInfo, ServiceLink, ServiceLoad, ServiceStatus, StatusMsg, UpdateMsg,
};
use feedwatch_core::{
    DomainType, GroupId, ServiceId, State, StreamId, StreamState, DIRECTORY_STREAM_ID,
    FILTER_ALL, FILTER_DATA, FILTER_GROUP, FILTER_INFO, FILTER_LINK, FILTER_LOAD, FILTER_STATE,
};
use tracing::{debug, info, warn};

use crate::error::SubmitError;
use crate::group::GroupTable;
use crate::item;
use crate::recovery;
use crate::state::{AggregateId, ServiceRef, SubmitOptions, UserTag, WatchlistState};
use crate::window;

pub const SERVICE_LOST_TEXT: &str = "Service for this item was lost.";
const NOT_ACCEPTING_TEXT: &str = "Service is not accepting requests.";

/// Cached state of one service: every filter block seen so far.
#[derive(Debug, Clone)]
pub struct ServiceCacheEntry {
    pub service_id: ServiceId,
    /// Filter bits for which a block has been cached.
    pub present: u32,
    pub info: Option<ServiceInfo>,
    pub state: Option<ServiceStatus>,
    pub load: Option<ServiceLoad>,
    pub data: Option<Bytes>,
    pub links: Option<Vec<ServiceLink>>,
    pub groups: GroupTable,
}

impl ServiceCacheEntry {
    pub fn new(service_id: ServiceId) -> Self {
        Self {
            service_id,
            present: 0,
            info: None,
            state: None,
            load: None,
            data: None,
            links: None,
            groups: GroupTable::default(),
        }
    }

    pub fn name(&self) -> Option<&str> {
        self.info.as_ref().map(|info| info.name.as_str())
    }

    /// Snapshot of the cached blocks selected by `filter`. Group state is
    /// never part of a snapshot.
    pub fn snapshot(&self, filter: u32) -> ServiceEntry {
        let mask = filter & self.present & !FILTER_GROUP;
        ServiceEntry {
            service_id: self.service_id,
            action: MapAction::Add,
            info: self.info.clone().filter(|_| mask & FILTER_INFO != 0),
            state: self.state.clone().filter(|_| mask & FILTER_STATE != 0),
            groups: Vec::new(),
            load: self.load.clone().filter(|_| mask & FILTER_LOAD != 0),
            data: self.data.clone().filter(|_| mask & FILTER_DATA != 0),
            links: self.links.clone().filter(|_| mask & FILTER_LINK != 0),
        }
    }

    fn availability(&self) -> Result<(), ServiceUnavailable> {
        match &self.state {
            Some(status) if !status.service_up => Err(ServiceUnavailable::Down),
            Some(status) if status.accepting_requests == Some(false) => {
                Err(ServiceUnavailable::NotAccepting)
            }
            _ => Ok(()),
        }
    }
}

#[derive(Debug, Default)]
pub struct DirectoryCache {
    pub services: BTreeMap<ServiceId, ServiceCacheEntry>,
    /// A complete directory refresh has been received on this connection.
    pub open: bool,
}

impl DirectoryCache {
    pub fn find(&self, service: &ServiceRef) -> Option<&ServiceCacheEntry> {
        match service {
            ServiceRef::Id(id) => self.services.get(id),
            ServiceRef::Name(name) => self
                .services
                .values()
                .find(|entry| entry.name() == Some(name.as_str())),
        }
    }
}

/// Caller stream subscribed to the source directory.
#[derive(Debug, Clone)]
pub struct DirectoryConsumer {
    pub stream_id: StreamId,
    pub filter: u32,
    /// Restricts the consumer to one service.
    pub service: Option<ServiceRef>,
    pub streaming: bool,
    pub tag: Option<UserTag>,
    /// Waiting on a solicited refresh.
    pub awaiting_refresh: bool,
    /// Lost its view of the cache in a recovery and needs a fresh answer.
    pub resync: bool,
}

impl DirectoryConsumer {
    fn wants(&self, service_id: ServiceId, name: Option<&str>) -> bool {
        match &self.service {
            None => true,
            Some(ServiceRef::Id(id)) => *id == service_id,
            Some(ServiceRef::Name(wanted)) => name == Some(wanted.as_str()),
        }
    }

    fn is_live(&self) -> bool {
        self.streaming && !self.awaiting_refresh && !self.resync
    }
}

/// Why a request cannot be sent to its service right now.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ServiceUnavailable {
    NotFound,
    Down,
    NotAccepting,
}

impl ServiceUnavailable {
    pub fn text(self) -> &'static str {
        match self {
            ServiceUnavailable::NotFound => "No matching service present.",
            ServiceUnavailable::Down => "Service is down.",
            ServiceUnavailable::NotAccepting => NOT_ACCEPTING_TEXT,
        }
    }
}

/// Resolves a service reference against the cache.
pub fn resolve(state: &WatchlistState, service: &ServiceRef) -> Result<ServiceId, ServiceUnavailable> {
    let entry = state
        .directory
        .find(service)
        .ok_or(ServiceUnavailable::NotFound)?;
    entry.availability()?;
    Ok(entry.service_id)
}

/// Queues the watchlist's own directory request.
pub fn request_directory(state: &mut WatchlistState) {
    let key = MsgKey {
        filter: Some(state.config.directory_filter),
        ..MsgKey::default()
    };
    let request = RequestMsg::new(DIRECTORY_STREAM_ID, DomainType::SOURCE, key).streaming();
    debug!(filter = state.config.directory_filter, "requesting source directory");
    state.outbound.push(Msg::Request(request));
    state.stats.requests_sent += 1;
}

/// Opens or reissues a caller directory request.
pub fn submit_consumer(
    state: &mut WatchlistState,
    request: RequestMsg,
    options: SubmitOptions,
) -> Result<(), SubmitError> {
    let service = match (options.service_name, request.key.service_id) {
        (Some(name), _) => Some(ServiceRef::Name(name)),
        (None, Some(id)) => Some(ServiceRef::Id(id)),
        (None, None) => None,
    };
    let filter = request.key.filter.unwrap_or(FILTER_ALL);
    let stream_id = request.stream_id;

    match state.directory_consumers.get_mut(&stream_id) {
        Some(existing) => {
            if existing.streaming != request.streaming {
                return Err(SubmitError::StreamingFlagChanged);
            }
            existing.filter = filter;
            existing.service = service;
            if options.tag.is_some() {
                existing.tag = options.tag;
            }
            if request.no_refresh {
                return Ok(());
            }
            existing.awaiting_refresh = true;
        }
        None => {
            if request.no_refresh {
                return Err(SubmitError::OpenWithoutRefresh);
            }
            if state.requests.contains_key(&stream_id) {
                return Err(SubmitError::DomainMismatch);
            }
            state.directory_consumers.insert(
                stream_id,
                DirectoryConsumer {
                    stream_id,
                    filter,
                    service,
                    streaming: request.streaming,
                    tag: options.tag,
                    awaiting_refresh: true,
                    resync: false,
                },
            );
        }
    }
    if state.directory.open {
        answer_consumer(state, stream_id);
    }
    Ok(())
}

/// Closes a directory consumer; returns whether `stream_id` was one.
pub fn close_consumer(state: &mut WatchlistState, stream_id: StreamId) -> bool {
    state.directory_consumers.remove(&stream_id).is_some()
}

/// Answers a consumer from the cache with the intersection of what it asked
/// for and what has been cached.
fn answer_consumer(state: &mut WatchlistState, stream_id: StreamId) {
    let Some(consumer) = state.directory_consumers.get(&stream_id) else {
        return;
    };
    let entries: Vec<ServiceEntry> = state
        .directory
        .services
        .values()
        .filter(|entry| consumer.wants(entry.service_id, entry.name()))
        .map(|entry| entry.snapshot(consumer.filter))
        .collect();
    let stream_state = if consumer.streaming {
        StreamState::Open
    } else {
        StreamState::NonStreaming
    };
    let mut refresh = RefreshMsg::new(
        stream_id,
        DomainType::SOURCE,
        State::new(stream_state, feedwatch_core::DataState::Ok, ""),
    );
    refresh.solicited = consumer.awaiting_refresh;
    refresh.key = Some(MsgKey {
        service_id: match &consumer.service {
            Some(ServiceRef::Id(id)) => Some(*id),
            _ => None,
        },
        filter: Some(consumer.filter),
        ..MsgKey::default()
    });
    refresh.payload = Payload::Directory(entries);
    let tag = consumer.tag;
    let streaming = consumer.streaming;
    state.emit(Msg::Refresh(refresh), tag);

    if streaming {
        if let Some(consumer) = state.directory_consumers.get_mut(&stream_id) {
            consumer.awaiting_refresh = false;
            consumer.resync = false;
        }
    } else {
        state.directory_consumers.remove(&stream_id);
    }
}

/// Routes one provider message on the directory stream.
pub fn handle_directory_msg(state: &mut WatchlistState, msg: Msg) {
    match msg {
        Msg::Refresh(refresh) => on_directory_refresh(state, refresh),
        Msg::Update(update) => {
            if let Payload::Directory(entries) = update.payload {
                apply_entries(state, entries, true);
            }
            item::resubmit_pending(state);
        }
        Msg::Status(status) => on_directory_status(state, status),
        other => debug!(class = ?other.class(), "ignoring message on directory stream"),
    }
}

fn on_directory_refresh(state: &mut WatchlistState, refresh: RefreshMsg) {
    let entries = match refresh.payload {
        Payload::Directory(entries) => entries,
        _ => Vec::new(),
    };
    let first = !state.directory.open;
    if refresh.clear_cache && !first {
        let listed: HashSet<ServiceId> = entries.iter().map(|entry| entry.service_id).collect();
        let gone: Vec<ServiceEntry> = state
            .directory
            .services
            .keys()
            .filter(|id| !listed.contains(id))
            .map(|id| ServiceEntry::new(*id, MapAction::Delete))
            .collect();
        apply_entries(state, gone, true);
    }
    apply_entries(state, entries, !first);

    if refresh.complete && !refresh.state.stream_state.is_terminal() {
        if first {
            info!(
                services = state.directory.services.len(),
                "source directory open"
            );
        }
        state.directory.open = true;
        let waiting: Vec<StreamId> = state
            .directory_consumers
            .values()
            .filter(|consumer| consumer.awaiting_refresh || consumer.resync)
            .map(|consumer| consumer.stream_id)
            .collect();
        for stream_id in waiting {
            answer_consumer(state, stream_id);
        }
    }
    item::resubmit_pending(state);
}

fn on_directory_status(state: &mut WatchlistState, status: StatusMsg) {
    let Some(stream_state) = status.state.as_ref().map(|s| s.stream_state) else {
        return;
    };
    if !stream_state.is_terminal() {
        return;
    }
    warn!(?stream_state, "provider closed the source directory stream");
    state.directory.open = false;
    let consumers: Vec<(StreamId, Option<UserTag>)> = state
        .directory_consumers
        .values()
        .map(|consumer| (consumer.stream_id, consumer.tag))
        .collect();
    for (stream_id, tag) in consumers {
        let mut copy = status.clone();
        copy.stream_id = stream_id;
        state.emit(Msg::Status(copy), tag);
    }
    state.directory_consumers.clear();
}

fn apply_entries(state: &mut WatchlistState, entries: Vec<ServiceEntry>, fan_out: bool) {
    for entry in entries {
        let name_before = state
            .directory
            .services
            .get(&entry.service_id)
            .and_then(|cached| cached.name().map(str::to_string));
        if !apply_service_entry(state, &entry) || !fan_out {
            continue;
        }
        let name = state
            .directory
            .services
            .get(&entry.service_id)
            .and_then(|cached| cached.name().map(str::to_string))
            .or(name_before);
        fan_delta(state, &entry, name.as_deref());
    }
}

fn fan_delta(state: &mut WatchlistState, entry: &ServiceEntry, name: Option<&str>) {
    let targets: Vec<(StreamId, Option<UserTag>, u32)> = state
        .directory_consumers
        .values()
        .filter(|consumer| consumer.is_live() && consumer.wants(entry.service_id, name))
        .map(|consumer| (consumer.stream_id, consumer.tag, consumer.filter))
        .collect();
    for (stream_id, tag, filter) in targets {
        let delta = entry.filtered(filter);
        if delta.action == MapAction::Update && delta.filter_mask() == 0 {
            continue;
        }
        let update = UpdateMsg::new(stream_id, DomainType::SOURCE, Payload::Directory(vec![delta]));
        state.emit(Msg::Update(update), tag);
    }
}

/// Applies one service add/update/delete to the cache and to the items of
/// that service. Returns whether the cache changed.
pub fn apply_service_entry(state: &mut WatchlistState, entry: &ServiceEntry) -> bool {
    let service_id = entry.service_id;
    if entry.action == MapAction::Delete {
        if state.directory.services.remove(&service_id).is_none() {
            return false;
        }
        info!(service_id, "service removed from directory");
        recovery::service_lost(state, service_id, SERVICE_LOST_TEXT);
        return true;
    }

    let previous = state
        .directory
        .services
        .get(&service_id)
        .and_then(|cached| cached.state.clone());
    let cached = state
        .directory
        .services
        .entry(service_id)
        .or_insert_with(|| ServiceCacheEntry::new(service_id));
    if let Some(info) = &entry.info {
        cached.info = Some(info.clone());
        cached.present |= FILTER_INFO;
    }
    if let Some(status) = &entry.state {
        cached.state = Some(status.clone());
        cached.present |= FILTER_STATE;
    }
    if let Some(load) = &entry.load {
        cached.load = Some(load.clone());
        cached.present |= FILTER_LOAD;
    }
    if let Some(data) = &entry.data {
        cached.data = Some(data.clone());
        cached.present |= FILTER_DATA;
    }
    if let Some(links) = &entry.links {
        cached.links = Some(links.clone());
        cached.present |= FILTER_LINK;
    }
    if !entry.groups.is_empty() {
        cached.present |= FILTER_GROUP;
    }

    if let Some(status) = &entry.state {
        let was_up = previous.as_ref().map_or(true, |s| s.service_up);
        let was_accepting = previous
            .as_ref()
            .map_or(true, |s| s.accepting_requests.unwrap_or(true));
        if !status.service_up {
            if was_up {
                info!(service_id, "service went down");
                recovery::service_lost(state, service_id, SERVICE_LOST_TEXT);
            }
        } else if status.accepting_requests == Some(false) && was_accepting {
            let notice = State::open_suspect(NOT_ACCEPTING_TEXT);
            for aggregate in service_aggregates(state, service_id) {
                item::notify_members(state, aggregate, &notice);
            }
        }
        if let Some(service_state) = &status.status {
            apply_service_status(state, service_id, service_state);
        }
    }
    if entry.load.is_some() {
        window::drain_queue(state, service_id);
    }
    for group in &entry.groups {
        apply_group_update(state, service_id, group);
    }
    true
}

fn service_aggregates(state: &WatchlistState, service_id: ServiceId) -> Vec<AggregateId> {
    state
        .aggregates
        .values()
        .filter(|agg| agg.service_id() == service_id)
        .map(|agg| agg.id)
        .collect()
}

fn apply_service_status(state: &mut WatchlistState, service_id: ServiceId, status: &State) {
    if status.stream_state == StreamState::ClosedRecover {
        recovery::service_lost(state, service_id, &status.text);
        return;
    }
    for aggregate in service_aggregates(state, service_id) {
        item::notify_members(state, aggregate, status);
    }
}

/// Records a group merge and/or status and applies the status to every item
/// reached through the group.
pub fn apply_group_update(state: &mut WatchlistState, service_id: ServiceId, group: &ServiceGroup) {
    let Some(cached) = state.directory.services.get_mut(&service_id) else {
        return;
    };
    if let Some(target) = &group.merged_to {
        debug!(service_id, from = %group.group, to = %target, "merging item group");
        cached.groups.merge(&group.group, target);
    }
    let Some(status) = &group.status else {
        return;
    };
    cached.groups.set_status(&group.group, status.clone());
    let affected = cached.groups.affected_items(&group.group);
    for aggregate in affected {
        item::apply_group_status(state, aggregate, status);
    }
}

/// Moves an aggregate into `group` within its service's group table.
pub fn move_item_group(
    state: &mut WatchlistState,
    service_id: ServiceId,
    aggregate: AggregateId,
    previous: Option<&GroupId>,
    group: &GroupId,
) {
    let Some(cached) = state.directory.services.get_mut(&service_id) else {
        return;
    };
    if let Some(previous) = previous {
        if previous != group {
            cached.groups.remove_item(previous, aggregate);
        }
    }
    cached.groups.add_item(group, aggregate);
}

pub fn remove_item_group(
    state: &mut WatchlistState,
    service_id: ServiceId,
    group: &GroupId,
    aggregate: AggregateId,
) {
    if let Some(cached) = state.directory.services.get_mut(&service_id) {
        cached.groups.remove_item(group, aggregate);
    }
}

/// Tells live consumers every cached service is gone and empties the cache.
pub fn clear_for_recovery(state: &mut WatchlistState) {
    let entries: Vec<(ServiceId, Option<String>)> = state
        .directory
        .services
        .values()
        .map(|entry| (entry.service_id, entry.name().map(str::to_string)))
        .collect();
    for (service_id, name) in &entries {
        fan_delta(
            state,
            &ServiceEntry::new(*service_id, MapAction::Delete),
            name.as_deref(),
        );
    }
    for consumer in state.directory_consumers.values_mut() {
        if consumer.streaming && !consumer.awaiting_refresh {
            consumer.resync = true;
        }
    }
    state.directory.services.clear();
    state.directory.open = false;
}

/// Closes every directory consumer with `status`.
pub fn close_consumers(state: &mut WatchlistState, status: &State) {
    let consumers = std::mem::take(&mut state.directory_consumers);
    for consumer in consumers.into_values() {
        let msg = StatusMsg::new(consumer.stream_id, DomainType::SOURCE, status.clone());
        state.emit(Msg::Status(msg), consumer.tag);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::WatchlistConfig;
    use crate::state::ConnectionState;
    use feedwatch_core::DataState;

    fn feed_entry(service_id: ServiceId, name: &str) -> ServiceEntry {
        let mut entry = ServiceEntry::new(service_id, MapAction::Add);
        entry.info = Some(ServiceInfo {
            name: name.into(),
            capabilities: vec![DomainType::MARKET_PRICE],
            ..ServiceInfo::default()
        });
        entry.state = Some(ServiceStatus::up());
        entry
    }

    fn open_directory(entries: Vec<ServiceEntry>) -> WatchlistState {
        let mut state = WatchlistState::new(WatchlistConfig::default());
        state.connection = ConnectionState::Connected;
        let mut refresh = RefreshMsg::new(
            DIRECTORY_STREAM_ID,
            DomainType::SOURCE,
            State::open_ok(),
        );
        refresh.payload = Payload::Directory(entries);
        handle_directory_msg(&mut state, Msg::Refresh(refresh));
        state
    }

    fn directory_request(stream_id: StreamId, filter: u32) -> RequestMsg {
        RequestMsg::new(
            stream_id,
            DomainType::SOURCE,
            MsgKey::default().with_filter(filter),
        )
        .streaming()
    }

    #[test]
    fn resolve_reports_why_a_service_is_unusable() {
        let mut down = feed_entry(2, "SLOW_FEED");
        down.state = Some(ServiceStatus::down());
        let state = open_directory(vec![feed_entry(1, "DIRECT_FEED"), down]);
        assert_eq!(
            resolve(&state, &ServiceRef::Name("DIRECT_FEED".into())),
            Ok(1)
        );
        assert_eq!(
            resolve(&state, &ServiceRef::Id(2)),
            Err(ServiceUnavailable::Down)
        );
        assert_eq!(
            resolve(&state, &ServiceRef::Name("NOPE".into())),
            Err(ServiceUnavailable::NotFound)
        );
    }

    #[test]
    fn answer_is_intersection_of_requested_and_cached_without_groups() {
        let mut entry = feed_entry(1, "DIRECT_FEED");
        entry.groups.push(ServiceGroup {
            group: GroupId::from_u16(1),
            status: Some(State::open_ok()),
            merged_to: None,
        });
        let mut state = open_directory(vec![entry]);
        submit_consumer(
            &mut state,
            directory_request(5, FILTER_INFO | FILTER_GROUP | FILTER_LOAD),
            SubmitOptions::default(),
        )
        .expect("consumer");

        let Some(Msg::Refresh(refresh)) = state.events.pop_front().and_then(|e| e.msg().cloned())
        else {
            panic!("expected refresh");
        };
        let Payload::Directory(entries) = refresh.payload else {
            panic!("expected directory payload");
        };
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].filter_mask(), FILTER_INFO);
    }

    #[test]
    fn consumer_waits_for_directory_refresh() {
        let mut state = WatchlistState::new(WatchlistConfig::default());
        submit_consumer(
            &mut state,
            directory_request(5, FILTER_ALL),
            SubmitOptions::default(),
        )
        .expect("consumer");
        assert!(state.events.is_empty());

        let mut refresh =
            RefreshMsg::new(DIRECTORY_STREAM_ID, DomainType::SOURCE, State::open_ok());
        refresh.payload = Payload::Directory(vec![feed_entry(1, "DIRECT_FEED")]);
        handle_directory_msg(&mut state, Msg::Refresh(refresh));
        assert_eq!(state.events.len(), 1);
        assert!(!state.directory_consumers[&5].awaiting_refresh);
    }

    #[test]
    fn snapshot_consumer_is_answered_once_and_dropped() {
        let mut state = open_directory(vec![feed_entry(1, "DIRECT_FEED")]);
        let mut request = directory_request(5, FILTER_ALL);
        request.streaming = false;
        submit_consumer(&mut state, request, SubmitOptions::default()).expect("snapshot");
        let Some(Msg::Refresh(refresh)) = state.events.pop_front().and_then(|e| e.msg().cloned())
        else {
            panic!("expected refresh");
        };
        assert_eq!(refresh.state.stream_state, StreamState::NonStreaming);
        assert!(state.directory_consumers.is_empty());
    }

    #[test]
    fn updates_reach_only_consumers_whose_filter_intersects() {
        let mut state = open_directory(vec![feed_entry(1, "DIRECT_FEED")]);
        submit_consumer(
            &mut state,
            directory_request(5, FILTER_INFO),
            SubmitOptions::default(),
        )
        .expect("info consumer");
        submit_consumer(
            &mut state,
            directory_request(6, FILTER_STATE),
            SubmitOptions::default(),
        )
        .expect("state consumer");
        state.events.clear();

        let mut change = ServiceEntry::new(1, MapAction::Update);
        change.state = Some(ServiceStatus {
            service_up: true,
            accepting_requests: Some(true),
            status: Some(State::new(StreamState::Open, DataState::Ok, "fine")),
        });
        let update = UpdateMsg::new(
            DIRECTORY_STREAM_ID,
            DomainType::SOURCE,
            Payload::Directory(vec![change]),
        );
        handle_directory_msg(&mut state, Msg::Update(update));

        let streams: Vec<StreamId> = state.events.iter().filter_map(|e| e.stream_id()).collect();
        assert_eq!(streams, vec![6]);
    }

    #[test]
    fn recovery_clear_sends_deletes_and_marks_resync() {
        let mut state = open_directory(vec![feed_entry(1, "DIRECT_FEED"), feed_entry(2, "B")]);
        submit_consumer(
            &mut state,
            directory_request(5, FILTER_ALL),
            SubmitOptions::service("B"),
        )
        .expect("consumer");
        state.events.clear();

        clear_for_recovery(&mut state);
        assert_eq!(state.events.len(), 1);
        let Some(Msg::Update(update)) = state.events[0].msg() else {
            panic!("expected update");
        };
        assert_eq!(
            update.payload,
            Payload::Directory(vec![ServiceEntry::new(2, MapAction::Delete)])
        );
        assert!(state.directory.services.is_empty());
        assert!(state.directory_consumers[&5].resync);
    }
}
