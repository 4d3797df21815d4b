use std::collections::{BTreeMap, HashMap, VecDeque};

use feedwatch_codec::{Msg, MsgKey, SymbolListBehavior, View};
use feedwatch_core::{
    DomainType, GroupId, Priority, Qos, ServiceId, State, StreamId, DIRECTORY_STREAM_ID,
};

use crate::config::WatchlistConfig;
use crate::directory::{DirectoryCache, DirectoryConsumer};
use crate::event::WatchlistEvent;
use crate::login::LoginState;
use crate::post::PostTable;
use crate::stats::WatchlistStats;
use crate::symbol_list::SymbolListSubscription;
use crate::timer::{TimerId, TimerQueue};
use crate::window::OpenWindow;

/// Opaque caller value echoed back on every event for a stream.
pub type UserTag = u64;
/// Internal handle of an item aggregate; never shown on the wire.
pub type AggregateId = u64;

/// Per-call options accompanying a request submission.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SubmitOptions {
    /// Service to bind by name; mutually exclusive with a key service id.
    pub service_name: Option<String>,
    pub tag: Option<UserTag>,
}

impl SubmitOptions {
    pub fn service(name: impl Into<String>) -> Self {
        Self {
            service_name: Some(name.into()),
            tag: None,
        }
    }

    pub fn with_tag(mut self, tag: UserTag) -> Self {
        self.tag = Some(tag);
        self
    }
}

/// How a request names its service.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum ServiceRef {
    Id(ServiceId),
    Name(String),
}

/// Connection lifecycle as seen by the recovery manager.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ConnectionState {
    #[default]
    Pending,
    Connected,
    DownReconnecting,
    Closed,
}

/// Who opened a request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RequestOrigin {
    Caller,
    /// Child opened by the symbol-list cascader on behalf of `parent`.
    SymbolList {
        parent: StreamId,
        parent_streaming: bool,
    },
}

/// One caller subscription.
#[derive(Debug, Clone)]
pub struct UserRequest {
    pub stream_id: StreamId,
    /// Submission order, used for FIFO re-submission and fan-out ordering.
    pub seq: u64,
    pub domain: DomainType,
    pub key: MsgKey,
    pub service: ServiceRef,
    pub qos: Option<Qos>,
    pub streaming: bool,
    pub private: bool,
    pub paused: bool,
    /// Normalized (sorted, deduplicated) view.
    pub view: Option<View>,
    pub priority: Priority,
    pub key_in_updates: bool,
    pub tag: Option<UserTag>,
    pub symbol_list_behavior: Option<SymbolListBehavior>,
    pub origin: RequestOrigin,
    pub aggregate: Option<AggregateId>,
    /// Waiting on a solicited refresh.
    pub awaiting_refresh: bool,
    /// At least one response was delivered to this request.
    pub has_response: bool,
    /// A complete refresh was delivered to this request.
    pub completed: bool,
}

/// Identity under which requests aggregate onto one provider stream.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ItemKey {
    pub domain: DomainType,
    pub service_id: ServiceId,
    pub name: Option<String>,
    pub identifier: Option<i32>,
    pub qos: Qos,
}

/// Provider-visible request state as last put on the wire.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SentRequest {
    pub streaming: bool,
    pub priority: Priority,
    pub paused: bool,
    pub view: Option<View>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AggregatePhase {
    /// Waiting for an open-window slot; not on the wire.
    Queued,
    /// Request sent, first complete refresh outstanding.
    Requested,
    Open,
}

/// All callers currently interested in one item identity.
#[derive(Debug, Clone)]
pub struct ItemAggregate {
    pub id: AggregateId,
    pub key: ItemKey,
    pub private: bool,
    /// Caller stream ids in submission order.
    pub members: Vec<StreamId>,
    pub provider_stream: Option<StreamId>,
    pub phase: AggregatePhase,
    pub sent: Option<SentRequest>,
    /// A solicited refresh is outstanding on the wire.
    pub refresh_pending: bool,
    /// Holding an open-window slot.
    pub outstanding: bool,
    pub group: Option<GroupId>,
    pub last_group_state: Option<State>,
    /// Last key echoed by the provider.
    pub last_key: Option<MsgKey>,
    pub timer: Option<TimerId>,
}

impl ItemAggregate {
    pub fn new(id: AggregateId, key: ItemKey, private: bool) -> Self {
        Self {
            id,
            key,
            private,
            members: Vec::new(),
            provider_stream: None,
            phase: AggregatePhase::Queued,
            sent: None,
            refresh_pending: false,
            outstanding: false,
            group: None,
            last_group_state: None,
            last_key: None,
            timer: None,
        }
    }

    pub fn service_id(&self) -> ServiceId {
        self.key.service_id
    }
}

/// Connection-scoped watchlist state; every component operates on this.
#[derive(Debug)]
pub struct WatchlistState {
    pub config: WatchlistConfig,
    /// Monotonic clock in milliseconds, advanced by the dispatcher.
    pub now_ms: u64,
    pub connection: ConnectionState,
    pub login: LoginState,
    /// Caller requests keyed by caller stream id.
    pub requests: HashMap<StreamId, UserRequest>,
    /// Requests waiting for their service, in submission order.
    pub pending_service: Vec<StreamId>,
    pub aggregates: BTreeMap<AggregateId, ItemAggregate>,
    pub aggregate_index: HashMap<ItemKey, AggregateId>,
    pub provider_streams: HashMap<StreamId, AggregateId>,
    pub directory: DirectoryCache,
    pub directory_consumers: BTreeMap<StreamId, DirectoryConsumer>,
    pub windows: HashMap<ServiceId, OpenWindow>,
    pub posts: PostTable,
    pub symbol_lists: HashMap<StreamId, SymbolListSubscription>,
    pub timers: TimerQueue,
    /// Aggregates whose wire request must be re-evaluated, in first-touch order.
    pub dirty: Vec<AggregateId>,
    /// Provider-bound messages awaiting encode/send.
    pub outbound: Vec<Msg>,
    /// Caller-bound events awaiting delivery.
    pub events: VecDeque<WatchlistEvent>,
    pub stats: WatchlistStats,
    next_seq: u64,
    next_aggregate_id: AggregateId,
    next_provider_stream: StreamId,
    next_cascade_stream: StreamId,
}

impl WatchlistState {
    pub fn new(config: WatchlistConfig) -> Self {
        let login = LoginState::new(&config);
        Self {
            config,
            now_ms: 0,
            connection: ConnectionState::Pending,
            login,
            requests: HashMap::new(),
            pending_service: Vec::new(),
            aggregates: BTreeMap::new(),
            aggregate_index: HashMap::new(),
            provider_streams: HashMap::new(),
            directory: DirectoryCache::default(),
            directory_consumers: BTreeMap::new(),
            windows: HashMap::new(),
            posts: PostTable::default(),
            symbol_lists: HashMap::new(),
            timers: TimerQueue::default(),
            dirty: Vec::new(),
            outbound: Vec::new(),
            events: VecDeque::new(),
            stats: WatchlistStats::default(),
            next_seq: 0,
            next_aggregate_id: 1,
            next_provider_stream: DIRECTORY_STREAM_ID + 1,
            next_cascade_stream: -1,
        }
    }

    pub fn next_seq(&mut self) -> u64 {
        self.next_seq += 1;
        self.next_seq
    }

    pub fn allocate_aggregate_id(&mut self) -> AggregateId {
        let id = self.next_aggregate_id;
        self.next_aggregate_id += 1;
        id
    }

    /// Allocates a provider stream id; ids are never handed out twice.
    pub fn allocate_provider_stream(&mut self) -> StreamId {
        let id = self.next_provider_stream;
        self.next_provider_stream = self.next_provider_stream.saturating_add(1);
        id
    }

    /// Allocates a negative caller stream id for a cascaded child.
    pub fn allocate_cascade_stream(&mut self) -> StreamId {
        let id = self.next_cascade_stream;
        self.next_cascade_stream = self.next_cascade_stream.saturating_sub(1);
        id
    }

    pub fn mark_dirty(&mut self, aggregate: AggregateId) {
        if !self.dirty.contains(&aggregate) {
            self.dirty.push(aggregate);
        }
    }

    /// Queues `msg` for the caller stream it is already addressed to.
    pub fn emit(&mut self, msg: Msg, tag: Option<UserTag>) {
        self.stats.events_delivered += 1;
        self.events.push_back(WatchlistEvent::Message { msg, tag });
    }

    /// Queues `msg` for caller request `stream_id`, echoing its tag.
    pub fn emit_to_request(&mut self, stream_id: StreamId, mut msg: Msg) {
        let tag = self.requests.get(&stream_id).and_then(|r| r.tag);
        msg.set_stream_id(stream_id);
        self.emit(msg, tag);
    }

    pub fn single_open(&self) -> bool {
        self.login.single_open(&self.config)
    }

    /// Requests currently tracked, sorted by submission order.
    pub fn requests_in_order(&self) -> Vec<StreamId> {
        let mut ordered: Vec<(u64, StreamId)> = self
            .requests
            .values()
            .map(|request| (request.seq, request.stream_id))
            .collect();
        ordered.sort_unstable();
        ordered.into_iter().map(|(_, stream_id)| stream_id).collect()
    }
}
