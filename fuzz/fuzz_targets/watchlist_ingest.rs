#![no_main]

use feedwatch_codec::{MsgKey, RequestMsg};
use feedwatch_core::DomainType;
use feedwatch_transport::InMemoryAdapter;
use feedwatch_watchlist::{
    DeferredActions, SubmitOptions, Watchlist, WatchlistConfig, WatchlistEvent,
};
use libfuzzer_sys::fuzz_target;

fuzz_target!(|data: &[u8]| {
    let mut watchlist = Watchlist::new(WatchlistConfig::default(), InMemoryAdapter::connected());
    let request =
        RequestMsg::new(10, DomainType::MARKET_PRICE, MsgKey::named("TRI.N")).streaming();
    let _ = watchlist.submit(request, SubmitOptions::service("DIRECT_FEED"));

    watchlist.adapter_mut().enqueue_inbound(data.to_vec());
    let mut ignore = |_: &WatchlistEvent, _: &mut DeferredActions| {};
    let _ = watchlist.dispatch(0, &mut ignore);
    let _ = watchlist.dispatch(60_000, &mut ignore);
});
