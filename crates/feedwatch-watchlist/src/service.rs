use std::fmt::Display;

use feedwatch_codec::{decode_msg_cbor, encode_msg_cbor, GenericMsg, Msg, PostMsg, RequestMsg};
use feedwatch_core::{StreamId, DIRECTORY_STREAM_ID, LOGIN_STREAM_ID};
use feedwatch_transport::{TransportAdapter, TransportEvent};
use tracing::{debug, warn};

use crate::config::WatchlistConfig;
use crate::directory;
use crate::error::{SubmitError, WatchlistError};
use crate::event::{DeferredAction, DeferredActions, WatchlistEvent};
use crate::item;
use crate::login;
use crate::post;
use crate::recovery;
use crate::state::{SubmitOptions, WatchlistState};
use crate::stats::WatchlistStats;
use crate::timer::TimerKind;

/// Receives caller-visible events during [`Watchlist::dispatch`].
///
/// Callbacks must not touch the watchlist directly; mutations go through
/// `actions` and are applied once the current fan-out has been delivered.
pub trait WatchlistCallbacks {
    fn on_event(&mut self, event: &WatchlistEvent, actions: &mut DeferredActions);
}

impl<F> WatchlistCallbacks for F
where
    F: FnMut(&WatchlistEvent, &mut DeferredActions),
{
    fn on_event(&mut self, event: &WatchlistEvent, actions: &mut DeferredActions) {
        self(event, actions)
    }
}

/// Outcome of one dispatch pass.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DispatchSummary {
    pub inbound: usize,
    pub events: usize,
    pub timers_fired: usize,
    /// Deferred actions the watchlist refused, with the reason.
    pub rejected: Vec<(StreamId, SubmitError)>,
}

/// Stateful watchlist facade owning the connection state and its adapter.
pub struct Watchlist<A>
where
    A: TransportAdapter,
{
    pub state: WatchlistState,
    pub adapter: A,
}

impl<A> Watchlist<A>
where
    A: TransportAdapter,
    A::Error: Display,
{
    pub fn new(config: WatchlistConfig, adapter: A) -> Self {
        Self {
            state: WatchlistState::new(config),
            adapter,
        }
    }

    pub fn stats(&self) -> &WatchlistStats {
        &self.state.stats
    }

    pub fn adapter_mut(&mut self) -> &mut A {
        &mut self.adapter
    }

    /// Earliest pending timer deadline, for the caller's poll loop.
    pub fn next_timer_deadline(&self) -> Option<u64> {
        self.state.timers.next_deadline()
    }

    /// Opens or reissues a caller request.
    pub fn submit(
        &mut self,
        request: RequestMsg,
        options: SubmitOptions,
    ) -> Result<(), WatchlistError> {
        let stream_id = request.stream_id;
        let result = item::submit(&mut self.state, request, options);
        self.reject_on_error(stream_id, result)?;
        self.flush()
    }

    /// Closes a caller stream; unknown streams are ignored.
    pub fn close(&mut self, stream_id: StreamId) -> Result<(), WatchlistError> {
        item::close(&mut self.state, stream_id);
        self.flush()
    }

    pub fn submit_post(&mut self, stream_id: StreamId, post: PostMsg) -> Result<(), WatchlistError> {
        let result = post::submit_post(&mut self.state, stream_id, post);
        self.reject_on_error(stream_id, result)?;
        self.flush()
    }

    pub fn submit_generic(
        &mut self,
        stream_id: StreamId,
        msg: GenericMsg,
    ) -> Result<(), WatchlistError> {
        let result = post::submit_generic(&mut self.state, stream_id, msg);
        self.reject_on_error(stream_id, result)?;
        self.flush()
    }

    fn reject_on_error(
        &mut self,
        stream_id: StreamId,
        result: Result<(), SubmitError>,
    ) -> Result<(), SubmitError> {
        if let Err(err) = &result {
            self.state.stats.rejected_submits += 1;
            warn!(stream_id, error = %err, "rejected caller submission");
        }
        result
    }

    /// Runs one dispatch pass at `now_ms`: delivers queued events, fires due
    /// timers, then drains the adapter. Each inbound message's fan-out is
    /// delivered before the mutations its callbacks requested are applied.
    pub fn dispatch<C>(
        &mut self,
        now_ms: u64,
        callbacks: &mut C,
    ) -> Result<DispatchSummary, WatchlistError>
    where
        C: WatchlistCallbacks,
    {
        self.state.now_ms = self.state.now_ms.max(now_ms);
        let mut summary = DispatchSummary::default();
        self.deliver_events(callbacks, &mut summary)?;

        for kind in self.state.timers.expire(self.state.now_ms) {
            summary.timers_fired += 1;
            match kind {
                TimerKind::Request(aggregate) => item::on_request_timeout(&mut self.state, aggregate),
                TimerKind::PostAck {
                    provider_stream,
                    post_id,
                } => post::on_timeout(&mut self.state, provider_stream, post_id),
            }
            self.deliver_events(callbacks, &mut summary)?;
        }

        while let Some(event) = self.adapter.recv() {
            summary.inbound += 1;
            match event {
                TransportEvent::Channel(channel) => {
                    recovery::on_channel_event(&mut self.state, channel)
                }
                TransportEvent::Data(bytes) => self.ingest(&bytes),
            }
            self.deliver_events(callbacks, &mut summary)?;
        }
        Ok(summary)
    }

    fn ingest(&mut self, bytes: &[u8]) {
        self.state.stats.inbound_messages += 1;
        match decode_msg_cbor(bytes) {
            Ok(msg) => route_provider_msg(&mut self.state, msg),
            Err(err) => {
                self.state.stats.decode_errors += 1;
                debug!(error = %err, len = bytes.len(), "dropping undecodable provider message");
            }
        }
    }

    fn deliver_events<C>(
        &mut self,
        callbacks: &mut C,
        summary: &mut DispatchSummary,
    ) -> Result<(), WatchlistError>
    where
        C: WatchlistCallbacks,
    {
        loop {
            self.flush()?;
            if self.state.events.is_empty() {
                return Ok(());
            }
            let batch = std::mem::take(&mut self.state.events);
            let mut actions = DeferredActions::default();
            for event in &batch {
                callbacks.on_event(event, &mut actions);
                summary.events += 1;
            }
            for action in actions.take() {
                self.apply_action(action, summary);
            }
        }
    }

    fn apply_action(&mut self, action: DeferredAction, summary: &mut DispatchSummary) {
        let (stream_id, result) = match action {
            DeferredAction::Submit { request, options } => {
                let stream_id = request.stream_id;
                (stream_id, item::submit(&mut self.state, request, options))
            }
            DeferredAction::Close(stream_id) => {
                item::close(&mut self.state, stream_id);
                (stream_id, Ok(()))
            }
            DeferredAction::Post { stream_id, post } => {
                (stream_id, post::submit_post(&mut self.state, stream_id, post))
            }
            DeferredAction::Generic { stream_id, msg } => {
                (stream_id, post::submit_generic(&mut self.state, stream_id, msg))
            }
        };
        if let Err(err) = self.reject_on_error(stream_id, result) {
            summary.rejected.push((stream_id, err));
        }
    }

    /// Puts pending request changes on the wire. Send failures are counted
    /// and logged; the affected streams are repaired by recovery.
    pub fn flush(&mut self) -> Result<(), WatchlistError> {
        item::flush_requests(&mut self.state);
        let outbound = std::mem::take(&mut self.state.outbound);
        for msg in outbound {
            let bytes = encode_msg_cbor(&msg)?;
            if let Err(err) = self.adapter.send(&bytes) {
                self.state.stats.send_errors += 1;
                warn!(stream_id = msg.stream_id(), error = %err, "send failed");
            }
        }
        Ok(())
    }
}

/// Routes a decoded provider message to the component owning its stream.
pub fn route_provider_msg(state: &mut WatchlistState, msg: Msg) {
    match msg.stream_id() {
        LOGIN_STREAM_ID => login::handle_login_msg(state, msg),
        DIRECTORY_STREAM_ID => directory::handle_directory_msg(state, msg),
        _ => item::deliver(state, msg),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use feedwatch_codec::{LoginAttribs, MsgKey, Payload, RefreshMsg};
    use feedwatch_core::{DomainType, State};
    use feedwatch_transport::{ChannelEvent, InMemoryAdapter};

    fn login_refresh() -> Vec<u8> {
        let mut refresh = RefreshMsg::new(LOGIN_STREAM_ID, DomainType::LOGIN, State::open_ok());
        refresh.payload = Payload::Login(LoginAttribs::default());
        encode_msg_cbor(&Msg::Refresh(refresh)).expect("encode login refresh")
    }

    #[test]
    fn channel_up_sends_login_then_directory_request() {
        let mut watchlist = Watchlist::new(WatchlistConfig::default(), InMemoryAdapter::connected());
        let mut seen = Vec::new();
        let mut callbacks = |event: &WatchlistEvent, _: &mut DeferredActions| {
            seen.push(event.clone());
        };
        watchlist.dispatch(0, &mut callbacks).expect("dispatch");
        let sent: Vec<Msg> = watchlist
            .adapter_mut()
            .take_outbound()
            .iter()
            .map(|bytes| decode_msg_cbor(bytes).expect("decode"))
            .collect();
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].domain(), DomainType::LOGIN);

        watchlist.adapter_mut().enqueue_inbound(login_refresh());
        watchlist.dispatch(1, &mut callbacks).expect("dispatch");
        let sent: Vec<Msg> = watchlist
            .adapter_mut()
            .take_outbound()
            .iter()
            .map(|bytes| decode_msg_cbor(bytes).expect("decode"))
            .collect();
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].stream_id(), DIRECTORY_STREAM_ID);
        assert_eq!(seen[0], WatchlistEvent::Channel(ChannelEvent::Up));
        assert_eq!(seen.len(), 2);
    }

    #[test]
    fn garbage_input_is_counted_not_fatal() {
        let mut watchlist = Watchlist::new(WatchlistConfig::default(), InMemoryAdapter::connected());
        watchlist.adapter_mut().enqueue_inbound(vec![0xff, 0x00, 0x13]);
        let summary = watchlist
            .dispatch(0, &mut |_: &WatchlistEvent, _: &mut DeferredActions| {})
            .expect("dispatch");
        assert_eq!(summary.inbound, 2);
        assert_eq!(watchlist.stats().decode_errors, 1);
    }

    #[test]
    fn rejected_deferred_actions_are_reported() {
        let mut watchlist = Watchlist::new(WatchlistConfig::default(), InMemoryAdapter::connected());
        let mut callbacks = |event: &WatchlistEvent, actions: &mut DeferredActions| {
            if matches!(event, WatchlistEvent::Channel(ChannelEvent::Up)) {
                let mut request =
                    RequestMsg::new(5, DomainType::MARKET_PRICE, MsgKey::named("TRI.N"));
                request.key.service_id = Some(1);
                actions.submit(request, SubmitOptions::service("DIRECT_FEED"));
            }
        };
        let summary = watchlist.dispatch(0, &mut callbacks).expect("dispatch");
        assert_eq!(summary.rejected, vec![(5, SubmitError::ServiceNameAndId)]);
        assert_eq!(watchlist.stats().rejected_submits, 1);
    }

    #[test]
    fn submit_while_closed_is_rejected() {
        let mut adapter = InMemoryAdapter::connected();
        adapter.enqueue_channel_event(ChannelEvent::Closed);
        let mut watchlist = Watchlist::new(WatchlistConfig::default(), adapter);
        watchlist
            .dispatch(0, &mut |_: &WatchlistEvent, _: &mut DeferredActions| {})
            .expect("dispatch");
        let request = RequestMsg::new(5, DomainType::MARKET_PRICE, MsgKey::named("TRI.N"));
        let err = watchlist
            .submit(request, SubmitOptions::service("DIRECT_FEED"))
            .expect_err("closed");
        assert!(matches!(err, WatchlistError::Submit(SubmitError::ChannelClosed)));
    }
}
