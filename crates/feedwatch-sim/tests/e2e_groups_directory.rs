use feedwatch_codec::{
    MapAction, Msg, MsgKey, Payload, RequestMsg, ServiceEntry, ServiceGroup, ServiceLoad,
    ServiceStatus,
};
use feedwatch_core::{
    DomainType, GroupId, State, StreamId, StreamState, FILTER_INFO, FILTER_STATE,
};
use feedwatch_sim::{ScriptedProvider, SimHarness};
use feedwatch_watchlist::{SubmitOptions, WatchlistConfig};

const SERVICE: &str = "DIRECT_FEED";

fn harness() -> SimHarness {
    SimHarness::connected(
        WatchlistConfig::default(),
        ScriptedProvider::with_service(1, SERVICE),
    )
    .expect("handshake should complete")
}

fn open_in_group(harness: &mut SimHarness, stream_id: StreamId, name: &str, group: u16) {
    let request =
        RequestMsg::new(stream_id, DomainType::MARKET_PRICE, MsgKey::named(name)).streaming();
    harness
        .submit(request, SubmitOptions::service(SERVICE))
        .expect("open");
    harness
        .provider
        .refresh_item_in_group(name, GroupId::from_u16(group));
    harness.pump().expect("pump");
}

fn group_update(group: u16, status: Option<State>, merged_to: Option<u16>) -> ServiceEntry {
    let mut entry = ServiceEntry::new(1, MapAction::Update);
    entry.groups.push(ServiceGroup {
        group: GroupId::from_u16(group),
        status,
        merged_to: merged_to.map(GroupId::from_u16),
    });
    entry
}

fn directory_request(stream_id: StreamId, filter: u32) -> RequestMsg {
    RequestMsg::new(
        stream_id,
        DomainType::SOURCE,
        MsgKey::default().with_filter(filter),
    )
    .streaming()
}

fn directory_entries(msg: &Msg) -> Vec<ServiceEntry> {
    let payload = match msg {
        Msg::Refresh(refresh) => &refresh.payload,
        Msg::Update(update) => &update.payload,
        _ => return Vec::new(),
    };
    match payload {
        Payload::Directory(entries) => entries.clone(),
        _ => Vec::new(),
    }
}

#[test]
fn merged_group_status_reaches_items_of_both_groups_once() {
    let mut harness = harness();
    open_in_group(&mut harness, 5, "TRI.N", 1);
    open_in_group(&mut harness, 6, "IBM.N", 2);
    harness.take_events();

    harness.provider.update_service(group_update(1, None, Some(2)));
    harness.pump().expect("pump");
    assert!(harness.events.is_empty());

    let down = State::open_suspect("group down");
    harness
        .provider
        .update_service(group_update(2, Some(down.clone()), None));
    harness.pump().expect("pump");
    assert_eq!(
        harness.delivered_states(),
        vec![(5, down.clone()), (6, down.clone())]
    );

    harness.take_events();
    harness
        .provider
        .update_service(group_update(2, Some(down), None));
    harness.pump().expect("pump");
    assert!(harness.events.is_empty(), "repeated group status is suppressed");
}

#[test]
fn group_status_is_delivered_again_after_the_item_recovers() {
    let mut harness = harness();
    open_in_group(&mut harness, 5, "TRI.N", 1);
    harness.take_events();

    let down = State::open_suspect("group down");
    harness
        .provider
        .update_service(group_update(1, Some(down.clone()), None));
    harness.pump().expect("pump");
    assert_eq!(harness.delivered_states(), vec![(5, down.clone())]);

    harness.take_events();
    harness
        .provider
        .refresh_item("TRI.N", State::open_ok())
        .expect("stream known to provider");
    harness.pump().expect("pump");
    assert_eq!(harness.delivered_states(), vec![(5, State::open_ok())]);

    harness.take_events();
    harness
        .provider
        .update_service(group_update(1, Some(down.clone()), None));
    harness.pump().expect("pump");
    assert_eq!(harness.delivered_states(), vec![(5, down)]);
}

#[test]
fn closed_group_ends_its_items() {
    let mut harness = harness();
    open_in_group(&mut harness, 5, "TRI.N", 1);
    open_in_group(&mut harness, 6, "IBM.N", 2);
    harness.take_events();

    harness
        .provider
        .update_service(group_update(1, Some(State::closed("group gone")), None));
    harness.pump().expect("pump");
    assert_eq!(harness.stream_states(), vec![(5, StreamState::Closed)]);
    assert!(!harness.watchlist.state.requests.contains_key(&5));
    assert!(harness.watchlist.state.requests.contains_key(&6));

    let before = harness.watchlist.stats().unknown_stream_messages;
    harness
        .provider
        .update_item("TRI.N", Payload::None)
        .expect("stream known to provider");
    harness.pump().expect("pump");
    assert_eq!(harness.watchlist.stats().unknown_stream_messages, before + 1);
}

#[test]
fn directory_consumer_sees_only_the_blocks_it_asked_for() {
    let mut harness = harness();
    harness
        .submit(
            directory_request(30, FILTER_INFO | FILTER_STATE),
            SubmitOptions::default(),
        )
        .expect("directory consumer");
    assert!(
        harness.provider.item_requests().is_empty(),
        "answered from the cache"
    );

    let refresh = harness.messages()[0].clone();
    assert_eq!(refresh.stream_id(), 30);
    let entries = directory_entries(&refresh);
    assert_eq!(entries.len(), 1);
    assert_eq!(entries[0].filter_mask(), FILTER_INFO | FILTER_STATE);
    harness.take_events();

    let mut load = ServiceEntry::new(1, MapAction::Update);
    load.load = Some(ServiceLoad {
        load_factor: Some(40),
        ..ServiceLoad::default()
    });
    harness.provider.update_service(load);
    harness.pump().expect("pump");
    assert!(harness.events.is_empty(), "load is outside the consumer's filter");

    let mut down = ServiceEntry::new(1, MapAction::Update);
    down.state = Some(ServiceStatus::down());
    harness.provider.update_service(down);
    harness.pump().expect("pump");
    let updates = harness.messages();
    assert_eq!(updates.len(), 1);
    let delta = directory_entries(updates[0]);
    assert_eq!(delta[0].filter_mask(), FILTER_STATE);
    assert_eq!(delta[0].state, Some(ServiceStatus::down()));
}

#[test]
fn directory_consumer_for_a_named_service_gets_only_that_service() {
    let mut provider = ScriptedProvider::with_service(1, SERVICE);
    provider.add_service(2, "OTHER_FEED");
    let mut harness = SimHarness::connected(WatchlistConfig::default(), provider)
        .expect("handshake should complete");

    harness
        .submit(
            directory_request(30, FILTER_INFO),
            SubmitOptions::service("OTHER_FEED"),
        )
        .expect("named consumer");
    let entries = directory_entries(harness.messages()[0]);
    assert_eq!(entries.len(), 1);
    assert_eq!(entries[0].service_id, 2);

    harness
        .submit(directory_request(31, FILTER_INFO), SubmitOptions::service("NOPE"))
        .expect("unknown name still answered");
    assert!(directory_entries(harness.messages()[1]).is_empty());

    harness.close(30).expect("close consumer");
    harness.take_events();
    harness
        .provider
        .update_service(ServiceEntry::new(2, MapAction::Delete));
    harness.pump().expect("pump");
    assert!(harness.events.is_empty());
}
