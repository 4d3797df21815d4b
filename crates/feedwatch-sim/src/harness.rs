use feedwatch_codec::{CodecError, Msg, RequestMsg};
use feedwatch_core::{State, StreamId, StreamState};
use feedwatch_transport::{ChannelEvent, InMemoryAdapter};
use thiserror::Error;

use feedwatch_watchlist::{
    DeferredActions, DispatchSummary, SubmitOptions, Watchlist, WatchlistCallbacks,
    WatchlistConfig, WatchlistError, WatchlistEvent,
};

use crate::provider::ScriptedProvider;

/// Consumer watchlist and scripted provider joined by an in-memory channel.
pub struct SimHarness {
    pub watchlist: Watchlist<InMemoryAdapter>,
    pub provider: ScriptedProvider,
    /// Every caller event delivered so far.
    pub events: Vec<WatchlistEvent>,
    pub now_ms: u64,
}

#[derive(Debug, Error)]
pub enum HarnessError {
    #[error("watchlist: {0}")]
    Watchlist(#[from] WatchlistError),
    #[error("provider codec: {0}")]
    Codec(#[from] CodecError),
}

impl SimHarness {
    pub fn new(config: WatchlistConfig, provider: ScriptedProvider) -> Self {
        Self {
            watchlist: Watchlist::new(config, InMemoryAdapter::connected()),
            provider,
            events: Vec::new(),
            now_ms: 0,
        }
    }

    /// Harness already past the login and directory handshake.
    pub fn connected(config: WatchlistConfig, provider: ScriptedProvider) -> Result<Self, HarnessError> {
        let mut harness = Self::new(config, provider);
        harness.pump()?;
        harness.events.clear();
        harness.provider.take_received();
        Ok(harness)
    }

    /// Exchanges traffic in both directions until neither side has anything
    /// left to say.
    pub fn pump(&mut self) -> Result<DispatchSummary, HarnessError> {
        let mut ignore = |_: &WatchlistEvent, _: &mut DeferredActions| {};
        self.pump_with(&mut ignore)
    }

    /// As [`SimHarness::pump`], also handing every event to `callbacks`.
    pub fn pump_with<C>(&mut self, callbacks: &mut C) -> Result<DispatchSummary, HarnessError>
    where
        C: WatchlistCallbacks,
    {
        let mut total = DispatchSummary::default();
        loop {
            let events = &mut self.events;
            let mut recorder = |event: &WatchlistEvent, actions: &mut DeferredActions| {
                events.push(event.clone());
                callbacks.on_event(event, actions);
            };
            let summary = self.watchlist.dispatch(self.now_ms, &mut recorder)?;
            total.inbound += summary.inbound;
            total.events += summary.events;
            total.timers_fired += summary.timers_fired;
            total.rejected.extend(summary.rejected);

            let frames = self.watchlist.adapter_mut().take_outbound();
            let sent = frames.len();
            self.provider.ingest(frames)?;
            let delivered = self.provider.deliver(self.watchlist.adapter_mut())?;
            if sent == 0 && delivered == 0 {
                return Ok(total);
            }
        }
    }

    pub fn advance(&mut self, ms: u64) -> Result<DispatchSummary, HarnessError> {
        self.now_ms += ms;
        self.pump()
    }

    pub fn submit(
        &mut self,
        request: RequestMsg,
        options: SubmitOptions,
    ) -> Result<(), HarnessError> {
        self.watchlist.submit(request, options)?;
        self.pump()?;
        Ok(())
    }

    pub fn close(&mut self, stream_id: StreamId) -> Result<(), HarnessError> {
        self.watchlist.close(stream_id)?;
        self.pump()?;
        Ok(())
    }

    /// Injects a channel lifecycle event as if the transport reported it.
    pub fn channel_event(&mut self, event: ChannelEvent) -> Result<(), HarnessError> {
        self.watchlist.adapter_mut().enqueue_channel_event(event);
        self.pump()?;
        Ok(())
    }

    pub fn take_events(&mut self) -> Vec<WatchlistEvent> {
        std::mem::take(&mut self.events)
    }

    pub fn take_provider_msgs(&mut self) -> Vec<Msg> {
        self.provider.take_received()
    }

    /// Caller messages delivered so far, with their caller stream ids.
    pub fn messages(&self) -> Vec<&Msg> {
        self.events.iter().filter_map(WatchlistEvent::msg).collect()
    }

    /// `(caller stream, state)` of every refresh and status delivered.
    pub fn delivered_states(&self) -> Vec<(StreamId, State)> {
        self.messages()
            .into_iter()
            .filter_map(|msg| match msg {
                Msg::Refresh(refresh) => Some((refresh.stream_id, refresh.state.clone())),
                Msg::Status(status) => status.state.clone().map(|state| (status.stream_id, state)),
                _ => None,
            })
            .collect()
    }

    pub fn stream_states(&self) -> Vec<(StreamId, StreamState)> {
        self.delivered_states()
            .into_iter()
            .map(|(stream_id, state)| (stream_id, state.stream_state))
            .collect()
    }
}
